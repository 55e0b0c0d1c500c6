use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use upsync_contract::{ConnectivitySnapshot, RecordId, TransferRecord, TransferResult, TransferStatus};
use upsync_storage::TransferStore;

use crate::policy::AutoUploadPolicy;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Entry point the coordinator uses to start a new attempt of a failed record.
#[async_trait]
pub trait UploadRetrier: Send + Sync {
    /// Returns false when the record was no longer eligible.
    async fn retry_transfer(&self, id: RecordId) -> Result<bool>;
}

/// Re-enqueues uploads parked for lack of Wi-Fi once Wi-Fi shows up.
pub struct RetryCoordinator {
    store: TransferStore,
    retrier: Arc<dyn UploadRetrier>,
    policy: AutoUploadPolicy,
    debounce: Duration,
}

impl RetryCoordinator {
    pub fn new(store: TransferStore, retrier: Arc<dyn UploadRetrier>, policy: AutoUploadPolicy) -> Self {
        Self {
            store,
            retrier,
            policy,
            debounce: DEFAULT_DEBOUNCE,
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Runs until the connectivity sender is dropped.
    ///
    /// Each transition to Wi-Fi schedules at most one pass, after the
    /// debounce delay. Changes that arrive during the delay are folded into
    /// the pending pass, and the pass is dropped if Wi-Fi is gone by then.
    pub async fn run(self, mut connectivity: watch::Receiver<ConnectivitySnapshot>) {
        let mut previous = connectivity.borrow_and_update().clone();
        while connectivity.changed().await.is_ok() {
            let current = connectivity.borrow_and_update().clone();
            let triggered = current.wifi_newly_present(&previous);
            previous = current;
            if !triggered || !self.policy.any_requires_wifi() {
                continue;
            }

            tokio::time::sleep(self.debounce).await;
            let settled = connectivity.borrow_and_update().clone();
            let keep = settled.has_wifi();
            previous = settled;
            if !keep {
                debug!("wifi dropped during debounce, skipping rescan");
                continue;
            }

            if let Err(err) = self.rescan().await {
                warn!(error = %err, "wifi rescan failed");
            }
        }
        debug!("connectivity feed closed, retry coordinator stopped");
    }

    /// One pass over FAILED records. Returns how many were re-enqueued.
    pub async fn rescan(&self) -> Result<usize> {
        let mut retried = 0;
        for record in self.store.failed().await? {
            if !self.is_eligible(&record) {
                continue;
            }
            match self.retrier.retry_transfer(record.id).await {
                Ok(true) => retried += 1,
                Ok(false) => {}
                Err(err) => warn!(id = record.id, error = %err, "retry failed"),
            }
        }
        info!(retried, "wifi rescan finished");
        Ok(retried)
    }

    fn is_eligible(&self, record: &TransferRecord) -> bool {
        if record.status != TransferStatus::Failed {
            return false;
        }
        if !matches!(
            record.last_result,
            Some(TransferResult::DelayedForWifi | TransferResult::NetworkConnection)
        ) {
            return false;
        }
        match record.created_by.category() {
            Some(category) => self.policy.requires_wifi(category),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use upsync_contract::{CreatedBy, LocalBehaviour, MediaCategory, NetworkKind, NewTransfer};
    use upsync_storage::StorageConfig;

    use super::*;
    use crate::policy::CategoryPolicy;

    const DEBOUNCE: Duration = Duration::from_millis(50);

    struct Recorder {
        retried: Mutex<Vec<RecordId>>,
        notify: mpsc::UnboundedSender<RecordId>,
    }

    #[async_trait]
    impl UploadRetrier for Recorder {
        async fn retry_transfer(&self, id: RecordId) -> Result<bool> {
            self.retried
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(id);
            let _ = self.notify.send(id);
            Ok(true)
        }
    }

    impl Recorder {
        fn count(&self) -> usize {
            self.retried
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .len()
        }
    }

    async fn store() -> (TempDir, TransferStore) {
        let dir = TempDir::new().expect("tempdir");
        let store = TransferStore::connect(&StorageConfig {
            sqlite_path: dir.path().join("upsync.db").display().to_string(),
        })
        .await
        .expect("connect store");
        (dir, store)
    }

    async fn failed(store: &TransferStore, name: &str, created_by: CreatedBy, result: TransferResult) -> RecordId {
        let record = store
            .create(&NewTransfer {
                local_path: format!("/local/{name}"),
                remote_path: format!("/remote/{name}"),
                account_name: "alice".to_string(),
                space_id: None,
                file_size: 1,
                local_behaviour: LocalBehaviour::Copy,
                force_overwrite: false,
                created_by,
            })
            .await
            .expect("create");
        store
            .finish_with_result(record.id, TransferStatus::Failed, 1, result)
            .await
            .expect("finish");
        record.id
    }

    fn policy(wifi_only: bool) -> AutoUploadPolicy {
        AutoUploadPolicy {
            pictures: CategoryPolicy {
                enabled: true,
                wifi_only,
            },
            videos: CategoryPolicy::default(),
        }
    }

    fn recorder() -> (Arc<Recorder>, mpsc::UnboundedReceiver<RecordId>) {
        let (notify, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Recorder {
                retried: Mutex::new(Vec::new()),
                notify,
            }),
            rx,
        )
    }

    #[tokio::test]
    async fn wifi_transition_retries_delayed_uploads() {
        let (_dir, store) = store().await;
        let id = failed(
            &store,
            "a.jpg",
            CreatedBy::Automatic(MediaCategory::Pictures),
            TransferResult::DelayedForWifi,
        )
        .await;
        let (retrier, mut retried) = recorder();
        let (tx, rx) = watch::channel(ConnectivitySnapshot::with([NetworkKind::Cellular]));
        let coordinator = RetryCoordinator::new(store, retrier.clone(), policy(true)).with_debounce(DEBOUNCE);
        let task = tokio::spawn(coordinator.run(rx));

        tx.send_replace(ConnectivitySnapshot::with([NetworkKind::Wifi, NetworkKind::Cellular]));

        let got = tokio::time::timeout(Duration::from_secs(5), retried.recv())
            .await
            .expect("rescan ran");
        assert_eq!(got, Some(id));
        drop(tx);
        task.await.expect("coordinator stopped");
        assert_eq!(retrier.count(), 1);
    }

    #[tokio::test]
    async fn policy_without_wifi_requirement_never_rescans() {
        let (_dir, store) = store().await;
        failed(
            &store,
            "a.jpg",
            CreatedBy::Automatic(MediaCategory::Pictures),
            TransferResult::DelayedForWifi,
        )
        .await;
        let (retrier, _retried) = recorder();
        let (tx, rx) = watch::channel(ConnectivitySnapshot::none());
        let coordinator = RetryCoordinator::new(store, retrier.clone(), policy(false)).with_debounce(DEBOUNCE);
        let task = tokio::spawn(coordinator.run(rx));

        tx.send_replace(ConnectivitySnapshot::with([NetworkKind::Wifi]));
        tokio::time::sleep(DEBOUNCE * 6).await;
        drop(tx);
        task.await.expect("coordinator stopped");

        assert_eq!(retrier.count(), 0);
    }

    #[tokio::test]
    async fn flapping_wifi_is_ignored() {
        let (_dir, store) = store().await;
        failed(&store, "a.txt", CreatedBy::User, TransferResult::NetworkConnection).await;
        let (retrier, _retried) = recorder();
        let (tx, rx) = watch::channel(ConnectivitySnapshot::none());
        let coordinator = RetryCoordinator::new(store, retrier.clone(), policy(true))
            .with_debounce(Duration::from_millis(200));
        let task = tokio::spawn(coordinator.run(rx));

        tx.send_replace(ConnectivitySnapshot::with([NetworkKind::Wifi]));
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send_replace(ConnectivitySnapshot::none());
        tokio::time::sleep(Duration::from_millis(500)).await;
        drop(tx);
        task.await.expect("coordinator stopped");

        assert_eq!(retrier.count(), 0);
    }

    #[tokio::test]
    async fn one_pass_per_transition() {
        let (_dir, store) = store().await;
        failed(&store, "a.txt", CreatedBy::User, TransferResult::NetworkConnection).await;
        let (retrier, mut retried) = recorder();
        let (tx, rx) = watch::channel(ConnectivitySnapshot::none());
        let coordinator = RetryCoordinator::new(store, retrier.clone(), policy(true))
            .with_debounce(Duration::from_millis(100));
        let task = tokio::spawn(coordinator.run(rx));

        tx.send_replace(ConnectivitySnapshot::with([NetworkKind::Wifi]));
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send_replace(ConnectivitySnapshot::with([NetworkKind::Wifi, NetworkKind::Vpn]));
        tokio::time::timeout(Duration::from_secs(5), retried.recv())
            .await
            .expect("rescan ran");
        tokio::time::sleep(Duration::from_millis(300)).await;
        drop(tx);
        task.await.expect("coordinator stopped");

        assert_eq!(retrier.count(), 1);
    }

    #[tokio::test]
    async fn rescan_scopes_records_by_result_and_category() {
        let (_dir, store) = store().await;
        let picture = failed(
            &store,
            "p.jpg",
            CreatedBy::Automatic(MediaCategory::Pictures),
            TransferResult::DelayedForWifi,
        )
        .await;
        let user = failed(&store, "u.txt", CreatedBy::User, TransferResult::NetworkConnection).await;
        failed(
            &store,
            "v.mp4",
            CreatedBy::Automatic(MediaCategory::Videos),
            TransferResult::DelayedForWifi,
        )
        .await;
        failed(&store, "c.txt", CreatedBy::User, TransferResult::ConflictError).await;
        let queued = store
            .create(&NewTransfer {
                local_path: "/local/q".into(),
                remote_path: "/remote/q".into(),
                account_name: "alice".into(),
                space_id: None,
                file_size: 1,
                local_behaviour: LocalBehaviour::Copy,
                force_overwrite: false,
                created_by: CreatedBy::User,
            })
            .await
            .expect("create");
        let (retrier, _retried) = recorder();
        let coordinator = RetryCoordinator::new(store, retrier.clone(), policy(true));

        assert_eq!(coordinator.rescan().await.expect("rescan"), 2);

        let retried = retrier
            .retried
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        assert_eq!(retried, [picture, user]);
        assert!(!retried.contains(&queued.id));
    }
}
