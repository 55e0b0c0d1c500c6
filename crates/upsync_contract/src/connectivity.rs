use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NetworkKind {
    Wifi,
    Cellular,
    Ethernet,
    Vpn,
}

/// Active transport types reported by the host. Empty means offline.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectivitySnapshot {
    #[serde(default)]
    pub active: BTreeSet<NetworkKind>,
}

impl ConnectivitySnapshot {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with(kinds: impl IntoIterator<Item = NetworkKind>) -> Self {
        Self {
            active: kinds.into_iter().collect(),
        }
    }

    pub fn is_connected(&self) -> bool {
        !self.active.is_empty()
    }

    pub fn has_wifi(&self) -> bool {
        self.active.contains(&NetworkKind::Wifi)
    }

    pub fn wifi_newly_present(&self, previous: &ConnectivitySnapshot) -> bool {
        self.has_wifi() && !previous.has_wifi()
    }
}
