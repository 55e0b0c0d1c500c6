use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use upsync_dav::{ChunkPut, DavBridge};

use crate::config::TransportConfig;
use crate::outcome::RemoteOutcome;
use crate::plan::ChunkPlan;

#[derive(Debug, Clone)]
pub struct ChunkedUpload {
    pub transfer_id: String,
    pub local_path: PathBuf,
    pub mime_type: String,
}

/// Cumulative progress after each acknowledged chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub transfer_id: String,
    pub chunk_index: u64,
    pub bytes_sent: u64,
    pub total_bytes: u64,
}

/// Sends the chunks of one local file into an upload namespace.
///
/// Chunks go out strictly in index order. The first failure ends the
/// attempt; a later attempt runs under a fresh transfer id and starts again
/// at chunk zero.
pub struct ChunkTransport {
    bridge: Arc<dyn DavBridge>,
    config: TransportConfig,
}

impl ChunkTransport {
    pub fn new(bridge: Arc<dyn DavBridge>, config: TransportConfig) -> Self {
        Self { bridge, config }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub async fn open_namespace(&self, transfer_id: &str) -> RemoteOutcome<()> {
        match self.bridge.create_namespace(transfer_id).await {
            Ok(response) if response.is_success() => RemoteOutcome::ok(()),
            Ok(response) => RemoteOutcome::from_response(response),
            Err(err) => RemoteOutcome::from_dav_error(err),
        }
    }

    /// Drops an abandoned namespace with the chunks it holds. A failed
    /// removal is only logged; the server expires stale namespaces itself.
    pub async fn discard_namespace(&self, transfer_id: &str) -> RemoteOutcome<()> {
        let outcome = match self.bridge.delete_namespace(transfer_id).await {
            Ok(response) if response.is_success() || response.status == 404 => {
                RemoteOutcome::ok(())
            }
            Ok(response) => RemoteOutcome::from_response(response),
            Err(err) => RemoteOutcome::from_dav_error(err),
        };
        match &outcome.error {
            None => debug!(transfer_id = %transfer_id, "chunk namespace discarded"),
            Some(error) => warn!(transfer_id = %transfer_id, error = %error, "cannot discard chunk namespace"),
        }
        outcome
    }

    pub async fn upload(
        &self,
        request: &ChunkedUpload,
        cancel: &CancellationToken,
        progress: Option<&mpsc::Sender<ProgressEvent>>,
    ) -> RemoteOutcome<ChunkPlan> {
        let mut file = match File::open(&request.local_path).await {
            Ok(file) => file,
            Err(err) => {
                warn!(path = %request.local_path.display(), error = %err, "cannot open local file");
                return RemoteOutcome::from_io_error(&err);
            }
        };
        let total_length = match file.metadata().await {
            Ok(metadata) => metadata.len(),
            Err(err) => return RemoteOutcome::from_io_error(&err),
        };

        let plan = ChunkPlan::for_length(total_length, self.config.chunk_size);
        let mut bytes_sent = 0u64;
        for index in 0..plan.chunk_count() {
            if cancel.is_cancelled() {
                info!(transfer_id = %request.transfer_id, chunk = index, "chunk upload cancelled");
                return RemoteOutcome::cancelled();
            }

            let range = plan.range(index);
            let mut body = vec![0u8; (range.end - range.start) as usize];
            let read = async {
                file.seek(SeekFrom::Start(range.start)).await?;
                file.read_exact(&mut body).await
            };
            if let Err(err) = read.await {
                warn!(transfer_id = %request.transfer_id, chunk = index, error = %err, "local read failed");
                return RemoteOutcome::from_io_error(&err);
            }

            let timeout = if plan.is_last(index) {
                self.config.extended_timeout
            } else {
                self.config.request_timeout
            };
            if self.config.diagnostics {
                info!(
                    transfer_id = %request.transfer_id,
                    chunk = index,
                    offset = range.start,
                    length = body.len(),
                    timeout_secs = timeout.as_secs(),
                    "sending chunk"
                );
            } else {
                debug!(transfer_id = %request.transfer_id, chunk = index, "sending chunk");
            }

            let length = body.len() as u64;
            let put = ChunkPut {
                transfer_id: request.transfer_id.clone(),
                index,
                body,
                content_type: request.mime_type.clone(),
                timeout,
            };
            match self.bridge.put_chunk(put).await {
                Ok(response) if response.is_success() => {}
                Ok(response) => {
                    warn!(
                        transfer_id = %request.transfer_id,
                        chunk = index,
                        status = response.status,
                        "chunk rejected"
                    );
                    return RemoteOutcome::from_response(response);
                }
                Err(err) => {
                    warn!(transfer_id = %request.transfer_id, chunk = index, error = %err, "chunk request failed");
                    return RemoteOutcome::from_dav_error(err);
                }
            }

            bytes_sent += length;
            if let Some(progress) = progress {
                let _ = progress
                    .send(ProgressEvent {
                        transfer_id: request.transfer_id.clone(),
                        chunk_index: index,
                        bytes_sent,
                        total_bytes: total_length,
                    })
                    .await;
            }
        }

        RemoteOutcome::ok(plan)
    }
}
