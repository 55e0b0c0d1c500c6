use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use upsync_dav::{DavBridge, FilePut};

use crate::chunked::ProgressEvent;
use crate::config::TransportConfig;
use crate::outcome::{OutcomeCode, RemoteOutcome};

#[derive(Debug, Clone)]
pub struct FileUpload {
    pub transfer_id: String,
    pub local_path: PathBuf,
    pub remote_path: String,
    pub space_id: Option<String>,
    pub mime_type: String,
    /// Without it the PUT only creates, and an occupied path is refused.
    pub overwrite: bool,
    /// Entity tag an overwritten file must still carry.
    pub required_etag: Option<String>,
    pub last_modified_secs: i64,
}

/// One-request upload for files that fit in a single chunk.
pub struct SingleUpload {
    bridge: Arc<dyn DavBridge>,
    config: TransportConfig,
}

impl SingleUpload {
    pub fn new(bridge: Arc<dyn DavBridge>, config: TransportConfig) -> Self {
        Self { bridge, config }
    }

    pub async fn upload(
        &self,
        request: &FileUpload,
        cancel: &CancellationToken,
        progress: Option<&mpsc::Sender<ProgressEvent>>,
    ) -> RemoteOutcome<Option<String>> {
        let body = match tokio::fs::read(&request.local_path).await {
            Ok(body) => body,
            Err(err) => {
                warn!(path = %request.local_path.display(), error = %err, "cannot read local file");
                return RemoteOutcome::from_io_error(&err);
            }
        };
        if cancel.is_cancelled() {
            return RemoteOutcome::cancelled();
        }

        let total_bytes = body.len() as u64;
        let put = FilePut {
            remote_path: request.remote_path.clone(),
            space_id: request.space_id.clone(),
            body,
            content_type: request.mime_type.clone(),
            if_match: request.required_etag.clone(),
            create_only: !request.overwrite,
            mtime_secs: request.last_modified_secs,
            timeout: self.config.extended_timeout,
        };
        match self.bridge.put_file(put).await {
            Ok(response) if response.is_success() => {
                info!(
                    transfer_id = %request.transfer_id,
                    remote_path = %request.remote_path,
                    bytes = total_bytes,
                    "file uploaded"
                );
                if let Some(progress) = progress {
                    let _ = progress
                        .send(ProgressEvent {
                            transfer_id: request.transfer_id.clone(),
                            chunk_index: 0,
                            bytes_sent: total_bytes,
                            total_bytes,
                        })
                        .await;
                }
                RemoteOutcome::ok(response.etag)
            }
            Ok(response) => match response.status {
                412 => RemoteOutcome::with_code(OutcomeCode::TargetExists, response),
                409 => RemoteOutcome::with_code(OutcomeCode::ParentMissing, response),
                _ => RemoteOutcome::from_response(response),
            },
            Err(err) => RemoteOutcome::from_dav_error(err),
        }
    }
}
