//! Upload of one local file: destination checks, chunk plan, transport,
//! assembly.

mod assembly;
mod chunked;
mod config;
mod destination;
mod outcome;
mod plan;
mod single;

pub use assembly::{AssemblyRequest, ChunkAssembly};
pub use chunked::{ChunkTransport, ChunkedUpload, ProgressEvent};
pub use config::TransportConfig;
pub use destination::{
    numbered_path, Destination, DestinationRequest, RemoteDestination, MAX_NAME_ATTEMPTS,
};
pub use outcome::{HttpContext, OutcomeCode, RemoteOutcome};
pub use plan::ChunkPlan;
pub use single::{FileUpload, SingleUpload};

/// Fixed chunk size: 10 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 10 * 1024 * 1024;
