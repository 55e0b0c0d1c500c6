use serde::{Deserialize, Serialize};
use upsync_contract::MediaCategory;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CategoryPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub wifi_only: bool,
}

/// Automatic upload settings per media category.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AutoUploadPolicy {
    #[serde(default)]
    pub pictures: CategoryPolicy,
    #[serde(default)]
    pub videos: CategoryPolicy,
}

impl AutoUploadPolicy {
    pub fn for_category(&self, category: MediaCategory) -> CategoryPolicy {
        match category {
            MediaCategory::Pictures => self.pictures,
            MediaCategory::Videos => self.videos,
        }
    }

    pub fn requires_wifi(&self, category: MediaCategory) -> bool {
        let policy = self.for_category(category);
        policy.enabled && policy.wifi_only
    }

    pub fn any_requires_wifi(&self) -> bool {
        self.requires_wifi(MediaCategory::Pictures) || self.requires_wifi(MediaCategory::Videos)
    }
}
