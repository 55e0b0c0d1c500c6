use std::sync::Arc;

use tracing::{info, warn};
use upsync_dav::{DavBridge, NamespaceMove};

use crate::config::TransportConfig;
use crate::outcome::{OutcomeCode, RemoteOutcome};

#[derive(Debug, Clone)]
pub struct AssemblyRequest {
    pub transfer_id: String,
    pub remote_path: String,
    pub space_id: Option<String>,
    pub overwrite: bool,
    pub last_modified_secs: i64,
    pub total_length: u64,
    pub required_etag: Option<String>,
}

/// Turns a completed chunk namespace into the destination file.
pub struct ChunkAssembly {
    bridge: Arc<dyn DavBridge>,
    config: TransportConfig,
}

impl ChunkAssembly {
    pub fn new(bridge: Arc<dyn DavBridge>, config: TransportConfig) -> Self {
        Self { bridge, config }
    }

    /// On success yields the entity tag of the assembled file, if the server sent one.
    pub async fn assemble(&self, request: &AssemblyRequest) -> RemoteOutcome<Option<String>> {
        let command = NamespaceMove {
            transfer_id: request.transfer_id.clone(),
            destination: request.remote_path.clone(),
            space_id: request.space_id.clone(),
            overwrite: request.overwrite,
            mtime_secs: request.last_modified_secs,
            total_length: request.total_length,
            if_match: request.required_etag.clone(),
            timeout: self.config.extended_timeout,
        };
        match self.bridge.move_namespace(command).await {
            Ok(response) if response.is_success() => {
                info!(
                    transfer_id = %request.transfer_id,
                    remote_path = %request.remote_path,
                    status = response.status,
                    "chunks assembled"
                );
                RemoteOutcome::ok(response.etag)
            }
            Ok(response) => {
                warn!(
                    transfer_id = %request.transfer_id,
                    remote_path = %request.remote_path,
                    status = response.status,
                    "assembly rejected"
                );
                match response.status {
                    412 => RemoteOutcome::with_code(OutcomeCode::TargetExists, response),
                    409 => RemoteOutcome::with_code(OutcomeCode::ParentMissing, response),
                    _ => RemoteOutcome::from_response(response),
                }
            }
            Err(err) => RemoteOutcome::from_dav_error(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use upsync_dav::{ChunkPut, DavMethod, InMemoryDavBridge};

    use super::*;

    async fn staged(server: &InMemoryDavBridge, transfer_id: &str, data: &[u8]) {
        server.create_namespace(transfer_id).await.expect("mkcol");
        for (index, chunk) in data.chunks(3).enumerate() {
            server
                .put_chunk(ChunkPut {
                    transfer_id: transfer_id.to_string(),
                    index: index as u64,
                    body: chunk.to_vec(),
                    content_type: "text/plain".into(),
                    timeout: std::time::Duration::from_secs(1),
                })
                .await
                .expect("put");
        }
    }

    fn request(transfer_id: &str, remote_path: &str, overwrite: bool, len: u64) -> AssemblyRequest {
        AssemblyRequest {
            transfer_id: transfer_id.into(),
            remote_path: remote_path.into(),
            space_id: None,
            overwrite,
            last_modified_secs: 1_700_000_000,
            total_length: len,
            required_etag: None,
        }
    }

    #[tokio::test]
    async fn assembles_into_destination() {
        let server = Arc::new(InMemoryDavBridge::new());
        server.mkdir_all("/Photos");
        staged(&server, "tx", b"hello world").await;
        let assembly = ChunkAssembly::new(server.clone(), TransportConfig::default());

        let outcome = assembly.assemble(&request("tx", "/Photos/a.txt", false, 11)).await;

        assert!(outcome.is_ok());
        assert!(outcome.data.flatten().is_some());
        assert_eq!(server.file("/Photos/a.txt"), Some(b"hello world".to_vec()));
        assert_eq!(server.file_mtime("/Photos/a.txt"), Some(1_700_000_000));
        let moves: Vec<_> = server
            .requests()
            .into_iter()
            .filter(|r| r.method == DavMethod::Move)
            .collect();
        assert_eq!(moves[0].timeout, Some(TransportConfig::default().extended_timeout));
    }

    #[tokio::test]
    async fn existing_target_and_missing_parent_are_distinct() {
        let server = Arc::new(InMemoryDavBridge::new());
        server.seed_file("/Photos/a.txt", b"old");
        staged(&server, "tx-1", b"new data").await;
        staged(&server, "tx-2", b"new data").await;
        let assembly = ChunkAssembly::new(server.clone(), TransportConfig::default());

        let exists = assembly.assemble(&request("tx-1", "/Photos/a.txt", false, 8)).await;
        let orphan = assembly.assemble(&request("tx-2", "/Missing/a.txt", false, 8)).await;

        assert_eq!(exists.code, OutcomeCode::TargetExists);
        assert_eq!(orphan.code, OutcomeCode::ParentMissing);
        assert_eq!(exists.http.map(|h| h.status), Some(412));
        assert_eq!(orphan.http.map(|h| h.status), Some(409));
        assert_eq!(server.file("/Photos/a.txt"), Some(b"old".to_vec()));
    }

    #[tokio::test]
    async fn overwrite_replaces_existing_file() {
        let server = Arc::new(InMemoryDavBridge::new());
        server.seed_file("/Photos/a.txt", b"old");
        staged(&server, "tx", b"replacement").await;
        let assembly = ChunkAssembly::new(server.clone(), TransportConfig::default());

        let outcome = assembly.assemble(&request("tx", "/Photos/a.txt", true, 11)).await;

        assert!(outcome.is_ok());
        assert_eq!(server.file("/Photos/a.txt"), Some(b"replacement".to_vec()));
    }

    #[tokio::test]
    async fn unexpected_status_is_http_failure() {
        let server = Arc::new(InMemoryDavBridge::new());
        server.respond_next(DavMethod::Move, 507);
        let assembly = ChunkAssembly::new(server.clone(), TransportConfig::default());

        let outcome = assembly.assemble(&request("tx", "/a.txt", false, 1)).await;

        assert_eq!(outcome.code, OutcomeCode::HttpFailure);
        assert_eq!(outcome.http.map(|h| h.status), Some(507));
    }
}
