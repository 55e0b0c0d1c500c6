use anyhow::{bail, Context, Result};
use chrono::Utc;
use sqlx::sqlite::{Sqlite, SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Executor, FromRow, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info};
use upsync_contract::{
    CreatedBy, LocalBehaviour, NewTransfer, RecordId, TransferRecord, TransferResult,
    TransferStatus, WireCode,
};
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("sql/schema.sql");

const COLUMNS: &str = "id, local_path, remote_path, account_name, space_id, file_size, status, \
     local_behaviour, force_overwrite, created_by, transfer_id, transfer_end_timestamp, last_result";

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub sqlite_path: String,
}

/// Durable witness of every upload and its outcome.
///
/// Status changes are guarded updates: a row in a terminal state is never
/// rewritten, so re-applying a finish is a no-op.
#[derive(Debug, Clone)]
pub struct TransferStore {
    pool: SqlitePool,
}

#[derive(Debug, FromRow)]
struct TransferRow {
    id: i64,
    local_path: String,
    remote_path: String,
    account_name: String,
    space_id: Option<String>,
    file_size: i64,
    status: i64,
    local_behaviour: i64,
    force_overwrite: bool,
    created_by: i64,
    transfer_id: String,
    transfer_end_timestamp: Option<i64>,
    last_result: Option<i64>,
}

impl TransferRow {
    fn into_record(self) -> Result<TransferRecord> {
        let last_result = self
            .last_result
            .map(TransferResult::from_code)
            .transpose()
            .with_context(|| format!("decode last result of transfer {}", self.id))?;
        Ok(TransferRecord {
            id: self.id,
            file_size: u64::try_from(self.file_size)
                .with_context(|| format!("negative file size on transfer {}", self.id))?,
            status: TransferStatus::from_code(self.status)
                .with_context(|| format!("decode status of transfer {}", self.id))?,
            local_behaviour: LocalBehaviour::from_code(self.local_behaviour)
                .with_context(|| format!("decode local behaviour of transfer {}", self.id))?,
            created_by: CreatedBy::from_code(self.created_by)
                .with_context(|| format!("decode creator of transfer {}", self.id))?,
            local_path: self.local_path,
            remote_path: self.remote_path,
            account_name: self.account_name,
            space_id: self.space_id,
            force_overwrite: self.force_overwrite,
            transfer_id: self.transfer_id,
            transfer_end_timestamp: self.transfer_end_timestamp,
            last_result,
        })
    }
}

fn into_records(rows: Vec<TransferRow>) -> Result<Vec<TransferRecord>> {
    rows.into_iter().map(TransferRow::into_record).collect()
}

impl TransferStore {
    pub async fn connect(config: &StorageConfig) -> Result<Self> {
        let uri = normalize_sqlite_uri(&config.sqlite_path);
        let options = SqliteConnectOptions::from_str(&uri)
            .with_context(|| format!("invalid sqlite URI: {}", uri))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("failed to connect sqlite pool")?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA_SQL.split(';') {
            let sql = statement.trim();
            if sql.is_empty() {
                continue;
            }
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .with_context(|| format!("migration failed for statement: {sql}"))?;
        }
        info!("transfer schema ready");
        Ok(())
    }

    /// Inserts a QUEUED record with a fresh transfer identifier.
    pub async fn create(&self, transfer: &NewTransfer) -> Result<TransferRecord> {
        let transfer_id = Uuid::now_v7().to_string();
        let id = insert_queued(&self.pool, transfer, &transfer_id).await?;
        debug!(id, transfer_id = %transfer_id, "transfer created");
        self.get_by_id(id)
            .await?
            .context("transfer missing after insert")
    }

    /// Rewrites every field of a pending record. Terminal rows are never
    /// touched.
    pub async fn update(&self, record: &TransferRecord) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE transfers SET local_path = ?, remote_path = ?, account_name = ?, space_id = ?, file_size = ?, status = ?, local_behaviour = ?, force_overwrite = ?, created_by = ?, transfer_id = ?, transfer_end_timestamp = ?, last_result = ?, updated_at = ? WHERE id = ? AND status IN (?, ?)",
        )
        .bind(&record.local_path)
        .bind(&record.remote_path)
        .bind(&record.account_name)
        .bind(&record.space_id)
        .bind(size_to_sql(record.file_size)?)
        .bind(record.status.code())
        .bind(record.local_behaviour.code())
        .bind(record.force_overwrite)
        .bind(record.created_by.code())
        .bind(&record.transfer_id)
        .bind(record.transfer_end_timestamp)
        .bind(record.last_result.map(TransferResult::code))
        .bind(now)
        .bind(record.id)
        .bind(TransferStatus::InProgress.code())
        .bind(TransferStatus::Queued.code())
        .execute(&self.pool)
        .await
        .with_context(|| format!("update transfer {}", record.id))?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn transition_to_in_progress(&self, id: RecordId) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let result =
            sqlx::query("UPDATE transfers SET status = ?, updated_at = ? WHERE id = ? AND status IN (?, ?)")
                .bind(TransferStatus::InProgress.code())
                .bind(now)
                .bind(id)
                .bind(TransferStatus::Queued.code())
                .bind(TransferStatus::InProgress.code())
                .execute(&self.pool)
                .await
                .with_context(|| format!("mark transfer {id} in progress"))?;
        Ok(result.rows_affected() > 0)
    }

    /// Re-defers an IN_PROGRESS record. The record gets a new transfer
    /// identifier for its next attempt, which is returned.
    pub async fn transition_to_enqueued(&self, id: RecordId) -> Result<Option<String>> {
        let now = Utc::now().to_rfc3339();
        let transfer_id = Uuid::now_v7().to_string();
        let result = sqlx::query(
            "UPDATE transfers SET status = ?, transfer_id = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(TransferStatus::Queued.code())
        .bind(&transfer_id)
        .bind(now)
        .bind(id)
        .bind(TransferStatus::InProgress.code())
        .execute(&self.pool)
        .await
        .with_context(|| format!("re-enqueue transfer {id}"))?;
        Ok((result.rows_affected() > 0).then_some(transfer_id))
    }

    /// Moves a pending record to a terminal state. Returns false when the
    /// record was already terminal or is gone.
    pub async fn finish_with_result(
        &self,
        id: RecordId,
        status: TransferStatus,
        end_timestamp: i64,
        result: TransferResult,
    ) -> Result<bool> {
        if !status.is_terminal() {
            bail!("cannot finish transfer {id} with non-terminal status {status:?}");
        }
        let now = Utc::now().to_rfc3339();
        let outcome = sqlx::query(
            "UPDATE transfers SET status = ?, transfer_end_timestamp = ?, last_result = ?, updated_at = ? WHERE id = ? AND status IN (?, ?)",
        )
        .bind(status.code())
        .bind(end_timestamp)
        .bind(result.code())
        .bind(now)
        .bind(id)
        .bind(TransferStatus::InProgress.code())
        .bind(TransferStatus::Queued.code())
        .execute(&self.pool)
        .await
        .with_context(|| format!("finish transfer {id}"))?;
        Ok(outcome.rows_affected() > 0)
    }

    pub async fn update_local_path(&self, id: RecordId, local_path: &str) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query("UPDATE transfers SET local_path = ?, updated_at = ? WHERE id = ?")
            .bind(local_path)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("update local path of transfer {id}"))?;
        Ok(result.rows_affected() > 0)
    }

    /// Replaces the leading `old_prefix` directory of the record's local
    /// path. Only whole path components match: `/sdcard` never rewrites
    /// `/sdcard2/x`.
    pub async fn update_storage_directory_prefix(
        &self,
        id: RecordId,
        old_prefix: &str,
        new_prefix: &str,
    ) -> Result<bool> {
        let old_prefix = old_prefix.trim_end_matches('/');
        let new_prefix = new_prefix.trim_end_matches('/');
        let now = Utc::now().to_rfc3339();
        let prefix_len = old_prefix.chars().count() as i64;
        let result = sqlx::query(
            "UPDATE transfers SET local_path = ? || substr(local_path, ?), updated_at = ? WHERE id = ? AND (local_path = ? OR substr(local_path, 1, ?) = ? || '/')",
        )
        .bind(new_prefix)
        .bind(prefix_len + 1)
        .bind(now)
        .bind(id)
        .bind(old_prefix)
        .bind(prefix_len + 1)
        .bind(old_prefix)
        .execute(&self.pool)
        .await
        .with_context(|| format!("relocate storage directory of transfer {id}"))?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_by_id(&self, id: RecordId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM transfers WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("delete transfer {id}"))?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_all_for_account(&self, account_name: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM transfers WHERE account_name = ?")
            .bind(account_name)
            .execute(&self.pool)
            .await
            .with_context(|| format!("delete transfers of account {account_name}"))?;
        Ok(result.rows_affected())
    }

    pub async fn get_by_id(&self, id: RecordId) -> Result<Option<TransferRecord>> {
        sqlx::query_as::<_, TransferRow>(&format!("SELECT {COLUMNS} FROM transfers WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("query transfer {id}"))?
            .map(TransferRow::into_record)
            .transpose()
    }

    /// Latest record uploading to `remote_path` for the account.
    pub async fn last_for_remote_path(
        &self,
        remote_path: &str,
        account_name: &str,
    ) -> Result<Option<TransferRecord>> {
        sqlx::query_as::<_, TransferRow>(&format!(
            "SELECT {COLUMNS} FROM transfers WHERE remote_path = ? AND account_name = ? ORDER BY id DESC LIMIT 1"
        ))
        .bind(remote_path)
        .bind(account_name)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("query last transfer for {remote_path}"))?
        .map(TransferRow::into_record)
        .transpose()
    }

    /// Every record grouped IN_PROGRESS, QUEUED, FAILED, SUCCEEDED, in
    /// creation order inside each group.
    pub async fn list_all(&self) -> Result<Vec<TransferRecord>> {
        let rows = sqlx::query_as::<_, TransferRow>(&format!(
            "SELECT {COLUMNS} FROM transfers ORDER BY id ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .context("query all transfers")?;
        let mut records = into_records(rows)?;
        records.sort_by_key(|record| record.status.listing_rank());
        Ok(records)
    }

    pub async fn current_and_pending(&self) -> Result<Vec<TransferRecord>> {
        self.with_statuses(&[TransferStatus::InProgress, TransferStatus::Queued])
            .await
    }

    pub async fn failed(&self) -> Result<Vec<TransferRecord>> {
        self.with_statuses(&[TransferStatus::Failed]).await
    }

    pub async fn finished(&self) -> Result<Vec<TransferRecord>> {
        self.with_statuses(&[TransferStatus::Succeeded]).await
    }

    pub async fn clear_failed(&self) -> Result<u64> {
        self.delete_with_status(TransferStatus::Failed).await
    }

    pub async fn clear_succeeded(&self) -> Result<u64> {
        self.delete_with_status(TransferStatus::Succeeded).await
    }

    /// Drops failed records except those still waiting for Wi-Fi.
    pub async fn clear_failed_except_delayed_for_wifi(&self) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM transfers WHERE status = ? AND (last_result IS NULL OR last_result != ?)",
        )
        .bind(TransferStatus::Failed.code())
        .bind(TransferResult::DelayedForWifi.code())
        .execute(&self.pool)
        .await
        .context("clear failed transfers not waiting for wifi")?;
        Ok(result.rows_affected())
    }

    /// Replaces a FAILED record with a QUEUED successor under a new
    /// transfer identifier. Returns `None` if the record is not FAILED.
    pub async fn retry(&self, id: RecordId) -> Result<Option<TransferRecord>> {
        let mut tx = self.pool.begin().await.context("begin retry transaction")?;

        let failed = sqlx::query_as::<_, TransferRow>(&format!(
            "SELECT {COLUMNS} FROM transfers WHERE id = ? AND status = ?"
        ))
        .bind(id)
        .bind(TransferStatus::Failed.code())
        .fetch_optional(&mut *tx)
        .await
        .with_context(|| format!("query failed transfer {id}"))?;
        let Some(failed) = failed else {
            return Ok(None);
        };
        let failed = failed.into_record()?;

        sqlx::query("DELETE FROM transfers WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("delete failed transfer {id}"))?;
        let transfer_id = Uuid::now_v7().to_string();
        let successor = insert_queued(&mut *tx, &failed.to_new_transfer(), &transfer_id).await?;

        tx.commit().await.context("commit retry transaction")?;
        info!(failed = id, successor, transfer_id = %transfer_id, "transfer retried");
        self.get_by_id(successor).await
    }

    async fn with_statuses(&self, statuses: &[TransferStatus]) -> Result<Vec<TransferRecord>> {
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!("SELECT {COLUMNS} FROM transfers WHERE status IN ({placeholders}) ORDER BY id ASC");
        let mut query = sqlx::query_as::<_, TransferRow>(&sql);
        for status in statuses {
            query = query.bind(status.code());
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("query transfers with status {statuses:?}"))?;
        into_records(rows)
    }

    async fn delete_with_status(&self, status: TransferStatus) -> Result<u64> {
        let result = sqlx::query("DELETE FROM transfers WHERE status = ?")
            .bind(status.code())
            .execute(&self.pool)
            .await
            .with_context(|| format!("clear {status:?} transfers"))?;
        Ok(result.rows_affected())
    }
}

async fn insert_queued<'e, E>(executor: E, transfer: &NewTransfer, transfer_id: &str) -> Result<RecordId>
where
    E: Executor<'e, Database = Sqlite>,
{
    let now = Utc::now().to_rfc3339();
    let result = sqlx::query(
        "INSERT INTO transfers(local_path, remote_path, account_name, space_id, file_size, status, local_behaviour, force_overwrite, created_by, transfer_id, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&transfer.local_path)
    .bind(&transfer.remote_path)
    .bind(&transfer.account_name)
    .bind(&transfer.space_id)
    .bind(size_to_sql(transfer.file_size)?)
    .bind(TransferStatus::Queued.code())
    .bind(transfer.local_behaviour.code())
    .bind(transfer.force_overwrite)
    .bind(transfer.created_by.code())
    .bind(transfer_id)
    .bind(&now)
    .bind(&now)
    .execute(executor)
    .await
    .context("insert transfer")?;
    Ok(result.last_insert_rowid())
}

fn size_to_sql(size: u64) -> Result<i64> {
    i64::try_from(size).with_context(|| format!("file size {size} out of range"))
}

fn normalize_sqlite_uri(raw: &str) -> String {
    if raw.starts_with("sqlite:") {
        raw.to_string()
    } else {
        format!("sqlite://{raw}")
    }
}
