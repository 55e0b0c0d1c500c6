use serde::{Deserialize, Serialize};

pub type RecordId = i64;
pub type AccountName = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    InProgress,
    Failed,
    Succeeded,
    Queued,
}

impl TransferStatus {
    /// Listing order of the full view: in progress, queued, failed, succeeded.
    pub const LISTING_ORDER: [TransferStatus; 4] = [
        TransferStatus::InProgress,
        TransferStatus::Queued,
        TransferStatus::Failed,
        TransferStatus::Succeeded,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, TransferStatus::Succeeded | TransferStatus::Failed)
    }

    pub fn listing_rank(self) -> usize {
        match self {
            TransferStatus::InProgress => 0,
            TransferStatus::Queued => 1,
            TransferStatus::Failed => 2,
            TransferStatus::Succeeded => 3,
        }
    }
}

/// What happens to the local copy once the upload succeeds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LocalBehaviour {
    Copy,
    Move,
    Forget,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MediaCategory {
    Pictures,
    Videos,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CreatedBy {
    User,
    Automatic(MediaCategory),
}

impl CreatedBy {
    pub fn category(self) -> Option<MediaCategory> {
        match self {
            CreatedBy::User => None,
            CreatedBy::Automatic(category) => Some(category),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransferResult {
    Unknown,
    Uploaded,
    NetworkConnection,
    CredentialError,
    FolderError,
    ConflictError,
    FileError,
    PrivilegesError,
    Cancelled,
    FileNotFound,
    DelayedForWifi,
    ServiceInterrupted,
    ServiceUnavailable,
    QuotaExceeded,
    SslRecoverablePeerUnverified,
    SpecificForbidden,
    SpecificServiceUnavailable,
    SpecificUnsupportedMediaType,
    DelayedForCharging,
    DelayedInPowerSaveMode,
}

impl TransferResult {
    /// Human-readable reason shown next to a listed transfer.
    pub fn reason(self) -> &'static str {
        match self {
            TransferResult::Unknown => "Unknown error",
            TransferResult::Uploaded => "Uploaded",
            TransferResult::NetworkConnection => "Network connection lost",
            TransferResult::CredentialError => "Credentials are not valid",
            TransferResult::FolderError => "Destination folder does not exist",
            TransferResult::ConflictError => "A file with this name already exists",
            TransferResult::FileError => "Local file could not be read",
            TransferResult::PrivilegesError => "Not enough privileges on the destination",
            TransferResult::Cancelled => "Cancelled",
            TransferResult::FileNotFound => "Local file not found",
            TransferResult::DelayedForWifi => "Waiting for Wi-Fi",
            TransferResult::ServiceInterrupted => "Upload interrupted",
            TransferResult::ServiceUnavailable => "Server unavailable",
            TransferResult::QuotaExceeded => "Storage quota exceeded",
            TransferResult::SslRecoverablePeerUnverified => "Server certificate not trusted",
            TransferResult::SpecificForbidden => "Forbidden by the server",
            TransferResult::SpecificServiceUnavailable => "Server in maintenance",
            TransferResult::SpecificUnsupportedMediaType => "File type rejected by the server",
            TransferResult::DelayedForCharging => "Waiting for the device to charge",
            TransferResult::DelayedInPowerSaveMode => "Waiting for power save mode to end",
        }
    }

    /// Network-class outcomes that a later connectivity change may fix.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            TransferResult::NetworkConnection
                | TransferResult::DelayedForWifi
                | TransferResult::ServiceInterrupted
                | TransferResult::ServiceUnavailable
                | TransferResult::SpecificServiceUnavailable
                | TransferResult::DelayedForCharging
                | TransferResult::DelayedInPowerSaveMode
        )
    }
}

/// Persisted description of one upload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferRecord {
    pub id: RecordId,
    pub local_path: String,
    pub remote_path: String,
    pub account_name: AccountName,
    pub space_id: Option<String>,
    pub file_size: u64,
    pub status: TransferStatus,
    pub local_behaviour: LocalBehaviour,
    pub force_overwrite: bool,
    pub created_by: CreatedBy,
    /// Server-side chunk namespace of the current attempt.
    pub transfer_id: String,
    /// Epoch millis.
    pub transfer_end_timestamp: Option<i64>,
    pub last_result: Option<TransferResult>,
}

impl TransferRecord {
    pub fn last_result_reason(&self) -> Option<&'static str> {
        self.last_result.map(TransferResult::reason)
    }

    /// Request that recreates this upload as a new record.
    pub fn to_new_transfer(&self) -> NewTransfer {
        NewTransfer {
            local_path: self.local_path.clone(),
            remote_path: self.remote_path.clone(),
            account_name: self.account_name.clone(),
            space_id: self.space_id.clone(),
            file_size: self.file_size,
            local_behaviour: self.local_behaviour,
            force_overwrite: self.force_overwrite,
            created_by: self.created_by,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewTransfer {
    pub local_path: String,
    pub remote_path: String,
    pub account_name: AccountName,
    #[serde(default)]
    pub space_id: Option<String>,
    pub file_size: u64,
    pub local_behaviour: LocalBehaviour,
    #[serde(default)]
    pub force_overwrite: bool,
    pub created_by: CreatedBy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(TransferStatus::Succeeded.is_terminal());
        assert!(TransferStatus::Failed.is_terminal());
        assert!(!TransferStatus::Queued.is_terminal());
        assert!(!TransferStatus::InProgress.is_terminal());
    }

    #[test]
    fn listing_rank_follows_listing_order() {
        for (rank, status) in TransferStatus::LISTING_ORDER.iter().enumerate() {
            assert_eq!(status.listing_rank(), rank);
        }
    }

    #[test]
    fn only_network_class_results_are_retryable() {
        assert!(TransferResult::DelayedForWifi.is_retryable());
        assert!(TransferResult::NetworkConnection.is_retryable());
        assert!(!TransferResult::ConflictError.is_retryable());
        assert!(!TransferResult::FileNotFound.is_retryable());
        assert!(!TransferResult::Cancelled.is_retryable());
    }

    #[test]
    fn created_by_serializes_category() {
        let json = serde_json::to_string(&CreatedBy::Automatic(MediaCategory::Videos)).expect("encode");
        assert_eq!(json, r#"{"automatic":"videos"}"#);
        let user: CreatedBy = serde_json::from_str(r#""user""#).expect("decode");
        assert_eq!(user, CreatedBy::User);
    }
}
