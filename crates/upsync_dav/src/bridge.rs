use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DavMethod {
    Put,
    Move,
    Mkcol,
    Head,
    Delete,
}

impl DavMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            DavMethod::Put => "PUT",
            DavMethod::Move => "MOVE",
            DavMethod::Mkcol => "MKCOL",
            DavMethod::Head => "HEAD",
            DavMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for DavMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A response the server actually sent, successful or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DavResponse {
    pub method: DavMethod,
    pub target: String,
    pub status: u16,
    pub etag: Option<String>,
}

impl DavResponse {
    pub fn is_success(&self) -> bool {
        matches!(self.status, 200 | 201 | 204)
    }
}

/// No response was obtained.
#[derive(Debug, Error)]
pub enum DavError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("request failed: {0}")]
    Request(String),
}

#[derive(Debug, Clone)]
pub struct ChunkPut {
    pub transfer_id: String,
    pub index: u64,
    pub body: Vec<u8>,
    pub content_type: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct NamespaceMove {
    pub transfer_id: String,
    pub destination: String,
    pub space_id: Option<String>,
    pub overwrite: bool,
    pub mtime_secs: i64,
    pub total_length: u64,
    pub if_match: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct FilePut {
    pub remote_path: String,
    pub space_id: Option<String>,
    pub body: Vec<u8>,
    pub content_type: String,
    pub if_match: Option<String>,
    /// Sends `If-None-Match: *`: the PUT must not replace an existing file.
    pub create_only: bool,
    pub mtime_secs: i64,
    pub timeout: Duration,
}

/// What a HEAD on an existing destination reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub length: u64,
    pub etag: Option<String>,
}

#[async_trait]
pub trait DavBridge: Send + Sync {
    /// MKCOL of `{uploads}/{transfer_id}`.
    async fn create_namespace(&self, transfer_id: &str) -> Result<DavResponse, DavError>;

    /// PUT of one byte range to `{uploads}/{transfer_id}/{index}`.
    async fn put_chunk(&self, request: ChunkPut) -> Result<DavResponse, DavError>;

    /// MOVE of `{uploads}/{transfer_id}` onto the destination file.
    async fn move_namespace(&self, request: NamespaceMove) -> Result<DavResponse, DavError>;

    /// DELETE of `{uploads}/{transfer_id}` and every chunk in it.
    async fn delete_namespace(&self, transfer_id: &str) -> Result<DavResponse, DavError>;

    async fn put_file(&self, request: FilePut) -> Result<DavResponse, DavError>;

    /// MKCOL of one folder in the files tree. 405 means it already exists,
    /// 409 that its own parent is missing.
    async fn create_folder(
        &self,
        remote_path: &str,
        space_id: Option<&str>,
    ) -> Result<DavResponse, DavError>;

    /// The remote file, `None` when it does not exist.
    async fn lookup(
        &self,
        remote_path: &str,
        space_id: Option<&str>,
    ) -> Result<Option<RemoteFile>, DavError>;
}

/// Strips the quotes servers put around entity tags.
pub fn normalize_etag(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_start_matches("W/").replace('"', "");
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
