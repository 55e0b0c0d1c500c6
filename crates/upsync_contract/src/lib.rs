pub mod connectivity;
pub mod model;
pub mod wire;

pub use connectivity::{ConnectivitySnapshot, NetworkKind};
pub use model::{
    AccountName, CreatedBy, LocalBehaviour, MediaCategory, NewTransfer, RecordId, TransferRecord,
    TransferResult, TransferStatus,
};
pub use wire::{WireCode, WireError};
