mod repository;

pub use repository::{StorageConfig, TransferStore};
