//! Stable integer codes used by the transfer table and the server protocol.
//!
//! Codes are part of the persisted format: never renumber an entry, only
//! append new ones.

use thiserror::Error;

use crate::model::{CreatedBy, LocalBehaviour, MediaCategory, TransferResult, TransferStatus};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("unknown {kind} code {code}")]
    UnknownCode { kind: &'static str, code: i64 },
}

pub trait WireCode: Copy + PartialEq + 'static {
    const KIND: &'static str;
    const TABLE: &'static [(Self, i64)];

    /// A variant missing from the table encodes as -1, the unknown code.
    fn code(self) -> i64 {
        Self::TABLE
            .iter()
            .find(|(value, _)| *value == self)
            .map_or(-1, |(_, code)| *code)
    }

    fn from_code(code: i64) -> Result<Self, WireError> {
        Self::TABLE
            .iter()
            .find(|(_, candidate)| *candidate == code)
            .map(|(value, _)| *value)
            .ok_or(WireError::UnknownCode {
                kind: Self::KIND,
                code,
            })
    }
}

impl WireCode for TransferStatus {
    const KIND: &'static str = "transfer status";
    const TABLE: &'static [(Self, i64)] = &[
        (TransferStatus::InProgress, 0),
        (TransferStatus::Failed, 1),
        (TransferStatus::Succeeded, 2),
        (TransferStatus::Queued, 3),
    ];
}

impl WireCode for LocalBehaviour {
    const KIND: &'static str = "local behaviour";
    const TABLE: &'static [(Self, i64)] = &[
        (LocalBehaviour::Copy, 0),
        (LocalBehaviour::Move, 1),
        (LocalBehaviour::Forget, 2),
    ];
}

impl WireCode for CreatedBy {
    const KIND: &'static str = "created by";
    const TABLE: &'static [(Self, i64)] = &[
        (CreatedBy::User, 0),
        (CreatedBy::Automatic(MediaCategory::Pictures), 1),
        (CreatedBy::Automatic(MediaCategory::Videos), 2),
    ];
}

impl WireCode for TransferResult {
    const KIND: &'static str = "transfer result";
    const TABLE: &'static [(Self, i64)] = &[
        (TransferResult::Unknown, -1),
        (TransferResult::Uploaded, 0),
        (TransferResult::NetworkConnection, 1),
        (TransferResult::CredentialError, 2),
        (TransferResult::FolderError, 3),
        (TransferResult::ConflictError, 4),
        (TransferResult::FileError, 5),
        (TransferResult::PrivilegesError, 6),
        (TransferResult::Cancelled, 7),
        (TransferResult::FileNotFound, 8),
        (TransferResult::DelayedForWifi, 9),
        (TransferResult::ServiceInterrupted, 10),
        (TransferResult::ServiceUnavailable, 11),
        (TransferResult::QuotaExceeded, 12),
        (TransferResult::SslRecoverablePeerUnverified, 13),
        (TransferResult::SpecificForbidden, 14),
        (TransferResult::SpecificServiceUnavailable, 15),
        (TransferResult::SpecificUnsupportedMediaType, 16),
        (TransferResult::DelayedForCharging, 17),
        (TransferResult::DelayedInPowerSaveMode, 18),
    ];
}
