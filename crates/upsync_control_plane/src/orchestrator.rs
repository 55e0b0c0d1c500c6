use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::UNIX_EPOCH;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use upsync_contract::{
    ConnectivitySnapshot, LocalBehaviour, NewTransfer, RecordId, TransferRecord, TransferResult,
    TransferStatus,
};
use upsync_dav::DavBridge;
use upsync_storage::TransferStore;
use upsync_transfer::{
    AssemblyRequest, ChunkAssembly, ChunkTransport, ChunkedUpload, Destination,
    DestinationRequest, FileUpload, HttpContext, OutcomeCode, ProgressEvent, RemoteDestination,
    RemoteOutcome, SingleUpload, TransportConfig,
};

use crate::coordinator::UploadRetrier;
use crate::policy::AutoUploadPolicy;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub transport: TransportConfig,
    pub max_concurrent_uploads: usize,
    pub policy: AutoUploadPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            max_concurrent_uploads: 2,
            policy: AutoUploadPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UploadEvent {
    Progress(ProgressEvent),
    Status {
        id: RecordId,
        status: TransferStatus,
        last_result: Option<TransferResult>,
    },
    Removed {
        id: RecordId,
    },
}

impl UploadEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            UploadEvent::Progress(_) => "transfer.progress",
            UploadEvent::Status { .. } => "transfer.status",
            UploadEvent::Removed { .. } => "transfer.removed",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Interrupted uploads whose destination turned out complete.
    pub completed: usize,
    /// Interrupted uploads put back in the queue under a new transfer id.
    pub requeued: usize,
    pub dispatched: usize,
}

/// How a worker left its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerExit {
    Settled,
    Deferred,
}

struct LocalSource {
    path: PathBuf,
    length: u64,
    mime_type: String,
    last_modified_secs: i64,
}

struct Inner {
    store: TransferStore,
    bridge: Arc<dyn DavBridge>,
    destination: RemoteDestination,
    transport: ChunkTransport,
    assembly: ChunkAssembly,
    single: SingleUpload,
    chunk_size: u64,
    permits: Arc<Semaphore>,
    running: Mutex<HashMap<RecordId, CancellationToken>>,
    connectivity: watch::Receiver<ConnectivitySnapshot>,
    policy: AutoUploadPolicy,
    events: broadcast::Sender<UploadEvent>,
}

impl Inner {
    fn lock_running(&self) -> MutexGuard<'_, HashMap<RecordId, CancellationToken>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Drives uploads from enqueue to a terminal record.
///
/// Every dispatched record gets one worker task holding its cancellation
/// token. Workers run concurrently up to `max_concurrent_uploads`.
#[derive(Clone)]
pub struct UploadOrchestrator {
    inner: Arc<Inner>,
}

impl UploadOrchestrator {
    pub fn new(
        store: TransferStore,
        bridge: Arc<dyn DavBridge>,
        config: OrchestratorConfig,
        connectivity: watch::Receiver<ConnectivitySnapshot>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let transport = config.transport;
        Self {
            inner: Arc::new(Inner {
                destination: RemoteDestination::new(bridge.clone()),
                transport: ChunkTransport::new(bridge.clone(), transport.clone()),
                assembly: ChunkAssembly::new(bridge.clone(), transport.clone()),
                single: SingleUpload::new(bridge.clone(), transport.clone()),
                chunk_size: transport.chunk_size,
                permits: Arc::new(Semaphore::new(config.max_concurrent_uploads.max(1))),
                running: Mutex::new(HashMap::new()),
                policy: config.policy,
                store,
                bridge,
                connectivity,
                events,
            }),
        }
    }

    pub fn store(&self) -> &TransferStore {
        &self.inner.store
    }

    pub fn policy(&self) -> AutoUploadPolicy {
        self.inner.policy
    }

    pub fn connectivity(&self) -> ConnectivitySnapshot {
        self.inner.connectivity.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_running(&self, id: RecordId) -> bool {
        self.inner.lock_running().contains_key(&id)
    }

    pub async fn enqueue(&self, transfer: NewTransfer) -> Result<TransferRecord> {
        let record = self.inner.store.create(&transfer).await?;
        info!(
            id = record.id,
            transfer_id = %record.transfer_id,
            remote_path = %record.remote_path,
            "upload enqueued"
        );
        self.emit_status(record.id, record.status, None);
        self.dispatch(record.id);
        Ok(record)
    }

    /// Starts a worker for the record unless one is already attached.
    pub fn dispatch(&self, id: RecordId) -> bool {
        let token = CancellationToken::new();
        {
            let mut running = self.inner.lock_running();
            if running.contains_key(&id) {
                return false;
            }
            running.insert(id, token.clone());
        }

        let orchestrator = self.clone();
        tokio::spawn(async move {
            let permit = tokio::select! {
                permit = orchestrator.inner.permits.clone().acquire_owned() => permit.ok(),
                _ = token.cancelled() => None,
            };
            let result = match permit {
                Some(_permit) => orchestrator.run_upload(id, &token).await,
                None => orchestrator
                    .discard(id)
                    .await
                    .map(|()| WorkerExit::Settled),
            };
            orchestrator.inner.lock_running().remove(&id);
            match result {
                // Connectivity may have returned before the slot was freed.
                Ok(WorkerExit::Deferred) if orchestrator.connectivity().is_connected() => {
                    orchestrator.dispatch(id);
                }
                Ok(_) => {}
                Err(err) => error!(id, error = %err, "upload worker failed"),
            }
        });
        true
    }

    /// Cancels a pending upload. The record is removed once the worker
    /// observes the cancellation, which happens between chunks.
    pub async fn cancel(&self, id: RecordId) -> Result<bool> {
        let token = self.inner.lock_running().get(&id).cloned();
        if let Some(token) = token {
            info!(id, "cancelling upload");
            token.cancel();
            return Ok(true);
        }
        match self.inner.store.get_by_id(id).await? {
            Some(record) if !record.status.is_terminal() => {
                self.discard(id).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Replaces a failed record with a fresh attempt and dispatches it.
    pub async fn retry(&self, id: RecordId) -> Result<Option<TransferRecord>> {
        let Some(successor) = self.inner.store.retry(id).await? else {
            return Ok(None);
        };
        self.emit(UploadEvent::Removed { id });
        self.emit_status(successor.id, successor.status, None);
        self.dispatch(successor.id);
        Ok(Some(successor))
    }

    /// Dispatches every QUEUED record without a worker.
    pub async fn resume_pending(&self) -> Result<usize> {
        let pending = self.inner.store.current_and_pending().await?;
        let dispatched = pending
            .into_iter()
            .filter(|record| record.status == TransferStatus::Queued)
            .filter(|record| self.dispatch(record.id))
            .count();
        Ok(dispatched)
    }

    /// Settles IN_PROGRESS records left behind by a previous process.
    ///
    /// Nothing records whether assembly ran, so the destination is looked
    /// up with HEAD: a remote file of the expected length means the upload completed,
    /// anything else restarts it from chunk zero under a new transfer id.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for record in self.inner.store.current_and_pending().await? {
            if record.status != TransferStatus::InProgress || self.is_running(record.id) {
                continue;
            }
            let remote = self
                .inner
                .bridge
                .lookup(&record.remote_path, record.space_id.as_deref())
                .await;
            match remote {
                Ok(Some(remote)) if remote.length == record.file_size => {
                    info!(id = record.id, remote_path = %record.remote_path, "interrupted upload already complete");
                    self.apply_local_behaviour(&record).await;
                    if self
                        .finish(&record, TransferStatus::Succeeded, TransferResult::Uploaded)
                        .await?
                    {
                        report.completed += 1;
                    }
                }
                other => {
                    if let Err(err) = &other {
                        warn!(id = record.id, error = %err, "destination lookup failed, restarting upload");
                    }
                    if let Some(transfer_id) = self.inner.store.transition_to_enqueued(record.id).await? {
                        info!(id = record.id, transfer_id = %transfer_id, "interrupted upload requeued");
                        self.emit_status(record.id, TransferStatus::Queued, None);
                        report.requeued += 1;
                    }
                }
            }
        }
        report.dispatched = self.resume_pending().await?;
        info!(
            completed = report.completed,
            requeued = report.requeued,
            dispatched = report.dispatched,
            "recovery finished"
        );
        Ok(report)
    }

    /// Resumes queued uploads whenever the device goes from offline to online.
    pub fn spawn_connectivity_watch(&self) -> JoinHandle<()> {
        let orchestrator = self.clone();
        let mut connectivity = self.inner.connectivity.clone();
        tokio::spawn(async move {
            let mut previous = connectivity.borrow_and_update().clone();
            while connectivity.changed().await.is_ok() {
                let current = connectivity.borrow_and_update().clone();
                if current.is_connected() && !previous.is_connected() {
                    match orchestrator.resume_pending().await {
                        Ok(resumed) => info!(resumed, "connectivity restored"),
                        Err(err) => warn!(error = %err, "failed to resume queued uploads"),
                    }
                }
                previous = current;
            }
        })
    }

    async fn run_upload(&self, id: RecordId, token: &CancellationToken) -> Result<WorkerExit> {
        let store = &self.inner.store;
        let Some(record) = store.get_by_id(id).await? else {
            return Ok(WorkerExit::Settled);
        };
        if record.status != TransferStatus::Queued {
            debug!(id, status = ?record.status, "record no longer queued");
            return Ok(WorkerExit::Settled);
        }
        if token.is_cancelled() {
            self.discard(id).await?;
            return Ok(WorkerExit::Settled);
        }

        let snapshot = self.connectivity();
        if let Some(category) = record.created_by.category() {
            if self.inner.policy.requires_wifi(category) && !snapshot.has_wifi() {
                info!(id, category = ?category, "automatic upload waits for wifi");
                self.finish(&record, TransferStatus::Failed, TransferResult::DelayedForWifi)
                    .await?;
                return Ok(WorkerExit::Settled);
            }
        }
        if !snapshot.is_connected() {
            self.finish(&record, TransferStatus::Failed, TransferResult::NetworkConnection)
                .await?;
            return Ok(WorkerExit::Settled);
        }

        if !store.transition_to_in_progress(id).await? {
            return Ok(WorkerExit::Settled);
        }
        self.emit_status(id, TransferStatus::InProgress, None);

        let outcome = self.transfer(&record, token).await;
        match outcome.code {
            OutcomeCode::Ok => {
                self.apply_local_behaviour(&record).await;
                self.finish(&record, TransferStatus::Succeeded, TransferResult::Uploaded)
                    .await?;
            }
            OutcomeCode::Cancelled => self.discard(id).await?,
            OutcomeCode::NetworkUnreachable | OutcomeCode::Timeout
                if !self.connectivity().is_connected() =>
            {
                if let Some(transfer_id) = store.transition_to_enqueued(id).await? {
                    info!(id, transfer_id = %transfer_id, "connectivity lost, upload deferred");
                    self.emit_status(id, TransferStatus::Queued, None);
                    return Ok(WorkerExit::Deferred);
                }
            }
            code => {
                let result = result_for_outcome(code, outcome.http.as_ref());
                warn!(
                    id,
                    code = ?code,
                    result = ?result,
                    error = outcome.error.as_deref().unwrap_or_default(),
                    "upload failed"
                );
                self.finish(&record, TransferStatus::Failed, result).await?;
            }
        }
        Ok(WorkerExit::Settled)
    }

    async fn transfer(
        &self,
        record: &TransferRecord,
        token: &CancellationToken,
    ) -> RemoteOutcome<Option<String>> {
        let path = PathBuf::from(&record.local_path);
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(err) => return RemoteOutcome::from_io_error(&err),
        };
        let source = LocalSource {
            mime_type: mime_for(&path),
            length: metadata.len(),
            last_modified_secs: metadata
                .modified()
                .ok()
                .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
                .map_or(0, |elapsed| elapsed.as_secs() as i64),
            path,
        };

        let prepared = self
            .inner
            .destination
            .prepare(&DestinationRequest {
                remote_path: record.remote_path.clone(),
                space_id: record.space_id.clone(),
                overwrite: record.force_overwrite,
            })
            .await;
        let Some(destination) = prepared.data.clone() else {
            return prepared.cast();
        };
        if destination.remote_path != record.remote_path {
            let renamed = TransferRecord {
                remote_path: destination.remote_path.clone(),
                status: TransferStatus::InProgress,
                ..record.clone()
            };
            match self.inner.store.update(&renamed).await {
                Ok(true) => info!(
                    id = record.id,
                    remote_path = %renamed.remote_path,
                    "destination renamed"
                ),
                Ok(false) => return RemoteOutcome::cancelled(),
                Err(err) => {
                    return RemoteOutcome::failure(
                        OutcomeCode::Unexpected,
                        format!("cannot record new destination: {err:#}"),
                    )
                }
            }
        }

        let (progress_tx, mut progress_rx) = mpsc::channel(32);
        let events = self.inner.events.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = progress_rx.recv().await {
                let _ = events.send(UploadEvent::Progress(event));
            }
        });

        let outcome = if source.length <= self.inner.chunk_size {
            let upload = FileUpload {
                transfer_id: record.transfer_id.clone(),
                local_path: source.path,
                remote_path: destination.remote_path,
                space_id: record.space_id.clone(),
                mime_type: source.mime_type,
                overwrite: record.force_overwrite,
                required_etag: destination.required_etag,
                last_modified_secs: source.last_modified_secs,
            };
            self.inner.single.upload(&upload, token, Some(&progress_tx)).await
        } else {
            self.upload_chunked(record, source, destination, token, &progress_tx)
                .await
        };

        drop(progress_tx);
        let _ = forwarder.await;
        outcome
    }

    async fn upload_chunked(
        &self,
        record: &TransferRecord,
        source: LocalSource,
        destination: Destination,
        token: &CancellationToken,
        progress: &mpsc::Sender<ProgressEvent>,
    ) -> RemoteOutcome<Option<String>> {
        let opened = self.inner.transport.open_namespace(&record.transfer_id).await;
        if !opened.is_ok() {
            return opened.cast();
        }

        let upload = ChunkedUpload {
            transfer_id: record.transfer_id.clone(),
            local_path: source.path,
            mime_type: source.mime_type,
        };
        let sent = self.inner.transport.upload(&upload, token, Some(progress)).await;
        if sent.code == OutcomeCode::Cancelled || (sent.is_ok() && token.is_cancelled()) {
            self.inner.transport.discard_namespace(&record.transfer_id).await;
            return RemoteOutcome::cancelled();
        }
        let Some(plan) = sent.data else {
            return sent.cast();
        };

        let request = AssemblyRequest {
            transfer_id: record.transfer_id.clone(),
            remote_path: destination.remote_path,
            space_id: record.space_id.clone(),
            overwrite: record.force_overwrite,
            last_modified_secs: source.last_modified_secs,
            total_length: plan.total_length(),
            required_etag: destination.required_etag,
        };
        self.inner.assembly.assemble(&request).await
    }

    async fn apply_local_behaviour(&self, record: &TransferRecord) {
        if record.local_behaviour != LocalBehaviour::Move {
            return;
        }
        match tokio::fs::remove_file(&record.local_path).await {
            Ok(()) => debug!(id = record.id, path = %record.local_path, "local copy removed"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(id = record.id, error = %err, "failed to remove local copy"),
        }
    }

    async fn finish(
        &self,
        record: &TransferRecord,
        status: TransferStatus,
        result: TransferResult,
    ) -> Result<bool> {
        let finished = self
            .inner
            .store
            .finish_with_result(record.id, status, Utc::now().timestamp_millis(), result)
            .await?;
        if finished {
            info!(id = record.id, status = ?status, reason = result.reason(), "upload finished");
            self.emit_status(record.id, status, Some(result));
        }
        Ok(finished)
    }

    async fn discard(&self, id: RecordId) -> Result<()> {
        if self.inner.store.delete_by_id(id).await? {
            info!(id, "upload cancelled");
            self.emit(UploadEvent::Removed { id });
        }
        Ok(())
    }

    fn emit_status(&self, id: RecordId, status: TransferStatus, last_result: Option<TransferResult>) {
        self.emit(UploadEvent::Status {
            id,
            status,
            last_result,
        });
    }

    fn emit(&self, event: UploadEvent) {
        let _ = self.inner.events.send(event);
    }
}

#[async_trait]
impl UploadRetrier for UploadOrchestrator {
    async fn retry_transfer(&self, id: RecordId) -> Result<bool> {
        Ok(self.retry(id).await?.is_some())
    }
}

/// Result code persisted for a failed remote operation.
pub fn result_for_outcome(code: OutcomeCode, http: Option<&HttpContext>) -> TransferResult {
    match code {
        OutcomeCode::Ok => TransferResult::Uploaded,
        OutcomeCode::Cancelled => TransferResult::Cancelled,
        OutcomeCode::TargetExists => TransferResult::ConflictError,
        OutcomeCode::ParentMissing => TransferResult::FolderError,
        OutcomeCode::LocalFileNotFound => TransferResult::FileNotFound,
        OutcomeCode::LocalIo => TransferResult::FileError,
        OutcomeCode::NetworkUnreachable | OutcomeCode::Timeout => TransferResult::NetworkConnection,
        OutcomeCode::Unexpected => TransferResult::Unknown,
        OutcomeCode::HttpFailure => match http.map(|context| context.status) {
            Some(401) => TransferResult::CredentialError,
            Some(403) => TransferResult::PrivilegesError,
            Some(404 | 409) => TransferResult::FolderError,
            Some(412) => TransferResult::ConflictError,
            Some(415) => TransferResult::SpecificUnsupportedMediaType,
            Some(503) => TransferResult::ServiceUnavailable,
            Some(507) => TransferResult::QuotaExceeded,
            Some(500..=599) => TransferResult::ServiceInterrupted,
            _ => TransferResult::Unknown,
        },
    }
}

fn mime_for(path: &Path) -> String {
    let extension = path
        .extension()
        .and_then(|extension| extension.to_str())
        .map(str::to_ascii_lowercase);
    let mime = match extension.as_deref() {
        Some("jpg" | "jpeg") => mime::IMAGE_JPEG,
        Some("png") => mime::IMAGE_PNG,
        Some("gif") => mime::IMAGE_GIF,
        Some("bmp") => mime::IMAGE_BMP,
        Some("svg") => mime::IMAGE_SVG,
        Some("txt") => mime::TEXT_PLAIN,
        Some("pdf") => mime::APPLICATION_PDF,
        Some("json") => mime::APPLICATION_JSON,
        Some("mp4") => return "video/mp4".to_string(),
        Some("mov") => return "video/quicktime".to_string(),
        Some("heic") => return "image/heic".to_string(),
        _ => mime::APPLICATION_OCTET_STREAM,
    };
    mime.to_string()
}
