pub mod bridge;
pub mod http;
pub mod memory;

pub use bridge::{
    ChunkPut, DavBridge, DavError, DavMethod, DavResponse, FilePut, NamespaceMove, RemoteFile,
};
pub use http::{DavEndpoint, HttpDavBridge};
pub use memory::{InMemoryDavBridge, RecordedRequest};

pub const OC_TOTAL_LENGTH_HEADER: &str = "OC-Total-Length";
pub const OC_MTIME_HEADER: &str = "X-OC-Mtime";
