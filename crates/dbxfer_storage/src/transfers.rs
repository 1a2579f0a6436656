use anyhow::{bail, Context, Result};
use chrono::Utc;
use dbxfer_contract::{
    LogLevel, LogLine, SourceRef, TransferFailure, TransferMode, TransferOptions, TransferRecord,
    TransferStatus,
};
use sqlx::FromRow;
use tracing::{info, warn};
use uuid::Uuid;

use crate::repository::{now_text, parse_timestamp, timestamp_text, DbxferStorage};

/// Everything admission fixes about a transfer before the pipeline runs.
#[derive(Debug, Clone)]
pub struct NewTransfer {
    pub source: SourceRef,
    pub source_database_uuid: String,
    pub target_environment_id: i64,
    pub target_server_id: i64,
    pub mode: TransferMode,
    pub transfer_options: Option<TransferOptions>,
    pub existing_target_uuid: Option<String>,
    pub target_database_uuid: Option<String>,
    pub initiated_by: i64,
    pub team_id: i64,
}

#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Created(TransferRecord),
    /// Another non-terminal transfer already holds this source.
    SourceBusy { active_transfer_id: Option<Uuid> },
}

#[derive(Debug, FromRow)]
struct TransferRow {
    transfer_id: String,
    source_kind: String,
    source_id: i64,
    source_database_uuid: String,
    target_environment_id: i64,
    target_server_id: i64,
    mode: String,
    options_json: Option<String>,
    existing_target_uuid: Option<String>,
    target_database_uuid: Option<String>,
    status: String,
    progress: i64,
    current_step: Option<String>,
    total_bytes: i64,
    transferred_bytes: i64,
    error_json: Option<String>,
    initiated_by: i64,
    team_id: i64,
    created_at: String,
    updated_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
}

#[derive(Debug, FromRow)]
struct LogRow {
    logged_at: String,
    level: String,
    message: String,
}

const TRANSFER_COLUMNS: &str = "transfer_id, source_kind, source_id, source_database_uuid, target_environment_id, target_server_id, mode, options_json, existing_target_uuid, target_database_uuid, status, progress, current_step, total_bytes, transferred_bytes, error_json, initiated_by, team_id, created_at, updated_at, started_at, finished_at";

const ACTIVE_STATUS_SQL: &str = "('pending', 'validating', 'transferring', 'restoring')";

impl TransferRow {
    fn into_record(self, log: Vec<LogLine>) -> Result<TransferRecord> {
        let id = Uuid::parse_str(&self.transfer_id)
            .with_context(|| format!("invalid transfer id {}", self.transfer_id))?;
        let transfer_options = self
            .options_json
            .as_deref()
            .map(serde_json::from_str::<TransferOptions>)
            .transpose()
            .with_context(|| format!("parse options of transfer {id}"))?;
        let error = self
            .error_json
            .as_deref()
            .map(serde_json::from_str::<TransferFailure>)
            .transpose()
            .with_context(|| format!("parse failure of transfer {id}"))?;

        Ok(TransferRecord {
            id,
            source: SourceRef {
                kind: self.source_kind.parse()?,
                id: self.source_id,
            },
            source_database_uuid: self.source_database_uuid,
            target_environment_id: self.target_environment_id,
            target_server_id: self.target_server_id,
            mode: self.mode.parse()?,
            transfer_options,
            existing_target_uuid: self.existing_target_uuid,
            target_database_uuid: self.target_database_uuid,
            status: self.status.parse()?,
            progress: u8::try_from(self.progress.clamp(0, 100)).unwrap_or(100),
            current_step: self.current_step,
            total_bytes: u64::try_from(self.total_bytes).unwrap_or(0),
            transferred_bytes: u64::try_from(self.transferred_bytes).unwrap_or(0),
            error,
            log,
            initiated_by: self.initiated_by,
            team_id: self.team_id,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            started_at: self.started_at.as_deref().map(parse_timestamp).transpose()?,
            finished_at: self.finished_at.as_deref().map(parse_timestamp).transpose()?,
        })
    }
}

fn byte_count(bytes: u64) -> i64 {
    i64::try_from(bytes).unwrap_or(i64::MAX)
}

impl DbxferStorage {
    /// Creates a `pending` record unless the source already has a non-terminal one.
    ///
    /// The partial unique index on `(source_kind, source_id)` is the arbiter: two
    /// concurrent inserts for one source cannot both succeed, whichever handler runs them.
    pub async fn insert_transfer(&self, new: &NewTransfer) -> Result<InsertOutcome> {
        if let Some(active) = self.active_transfer_for_source(new.source).await? {
            return Ok(InsertOutcome::SourceBusy {
                active_transfer_id: Some(active),
            });
        }

        let transfer_id = Uuid::now_v7();
        let now = now_text();
        let options_json = new
            .transfer_options
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("serialize transfer options")?;

        let inserted = sqlx::query(
            "INSERT INTO database_transfers(transfer_id, source_kind, source_id, source_database_uuid, target_environment_id, target_server_id, mode, options_json, existing_target_uuid, target_database_uuid, status, progress, initiated_by, team_id, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?)",
        )
        .bind(transfer_id.to_string())
        .bind(new.source.kind.as_str())
        .bind(new.source.id)
        .bind(&new.source_database_uuid)
        .bind(new.target_environment_id)
        .bind(new.target_server_id)
        .bind(new.mode.as_str())
        .bind(options_json)
        .bind(&new.existing_target_uuid)
        .bind(&new.target_database_uuid)
        .bind(TransferStatus::Pending.as_str())
        .bind(new.initiated_by)
        .bind(new.team_id)
        .bind(&now)
        .bind(&now)
        .execute(self.pool())
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(db_error)) if db_error.is_unique_violation() => {
                warn!(source_kind = %new.source.kind, source_id = new.source.id, "lost single-flight race");
                let active = self.active_transfer_for_source(new.source).await?;
                return Ok(InsertOutcome::SourceBusy {
                    active_transfer_id: active,
                });
            }
            Err(other) => return Err(other).context("insert transfer"),
        }

        info!(transfer_id = %transfer_id, source_kind = %new.source.kind, source_id = new.source.id, mode = %new.mode, "transfer recorded");
        let record = self
            .get_transfer(transfer_id)
            .await?
            .context("transfer missing after insert")?;
        Ok(InsertOutcome::Created(record))
    }

    pub async fn get_transfer(&self, transfer_id: Uuid) -> Result<Option<TransferRecord>> {
        let row = sqlx::query_as::<_, TransferRow>(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM database_transfers WHERE transfer_id = ?"
        ))
        .bind(transfer_id.to_string())
        .fetch_optional(self.pool())
        .await
        .with_context(|| format!("query transfer {transfer_id}"))?;

        match row {
            Some(row) => {
                let log = self.transfer_log(transfer_id).await?;
                Ok(Some(row.into_record(log)?))
            }
            None => Ok(None),
        }
    }

    pub async fn transfer_log(&self, transfer_id: Uuid) -> Result<Vec<LogLine>> {
        let rows = sqlx::query_as::<_, LogRow>(
            "SELECT logged_at, level, message FROM transfer_logs WHERE transfer_id = ? ORDER BY log_id ASC",
        )
        .bind(transfer_id.to_string())
        .fetch_all(self.pool())
        .await
        .with_context(|| format!("query log of transfer {transfer_id}"))?;

        rows.into_iter()
            .map(|row| {
                Ok(LogLine {
                    timestamp: parse_timestamp(&row.logged_at)?,
                    level: LogLevel::parse(&row.level),
                    message: row.message,
                })
            })
            .collect()
    }

    pub async fn list_transfers_for_source(
        &self,
        source: SourceRef,
        limit: i64,
    ) -> Result<Vec<TransferRecord>> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT transfer_id FROM database_transfers WHERE source_kind = ? AND source_id = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(source.kind.as_str())
        .bind(source.id)
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .context("query transfers for source")?;

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            let transfer_id =
                Uuid::parse_str(&id).with_context(|| format!("invalid transfer id {id}"))?;
            if let Some(record) = self.get_transfer(transfer_id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    pub async fn active_transfer_for_source(&self, source: SourceRef) -> Result<Option<Uuid>> {
        let id = sqlx::query_scalar::<_, String>(&format!(
            "SELECT transfer_id FROM database_transfers WHERE source_kind = ? AND source_id = ? AND status IN {ACTIVE_STATUS_SQL} LIMIT 1"
        ))
        .bind(source.kind.as_str())
        .bind(source.id)
        .fetch_optional(self.pool())
        .await
        .context("query active transfer for source")?;

        id.map(|id| Uuid::parse_str(&id).with_context(|| format!("invalid transfer id {id}")))
            .transpose()
    }

    /// Moves status/progress forward. Progress never decreases and terminal records are left alone.
    ///
    /// A status change the state machine does not allow is refused with an error.
    pub async fn update_progress(
        &self,
        transfer_id: Uuid,
        status: TransferStatus,
        progress: u8,
        step: &str,
    ) -> Result<()> {
        let predecessors = status.predecessors();
        let placeholders = vec!["?"; predecessors.len()].join(", ");
        let sql = format!(
            "UPDATE database_transfers SET status = ?, progress = MAX(progress, ?), current_step = ?, updated_at = ?, started_at = COALESCE(started_at, ?) WHERE transfer_id = ? AND status IN ({placeholders})"
        );

        let now = now_text();
        let mut query = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(i64::from(progress.min(100)))
            .bind(step)
            .bind(&now)
            .bind(&now)
            .bind(transfer_id.to_string());
        for previous in &predecessors {
            query = query.bind(previous.as_str());
        }
        let updated = query
            .execute(self.pool())
            .await
            .with_context(|| format!("update progress of transfer {transfer_id}"))?;
        if updated.rows_affected() > 0 {
            return Ok(());
        }

        let current = sqlx::query_scalar::<_, String>(
            "SELECT status FROM database_transfers WHERE transfer_id = ?",
        )
        .bind(transfer_id.to_string())
        .fetch_optional(self.pool())
        .await
        .with_context(|| format!("query status of transfer {transfer_id}"))?;
        match current {
            None => bail!("transfer {transfer_id} not found"),
            Some(current) => {
                let current: TransferStatus = current.parse()?;
                if current.is_terminal() {
                    return Ok(());
                }
                bail!("transfer {transfer_id} cannot move from {current} to {status}")
            }
        }
    }

    pub async fn set_total_bytes(&self, transfer_id: Uuid, bytes: u64) -> Result<()> {
        sqlx::query("UPDATE database_transfers SET total_bytes = ?, updated_at = ? WHERE transfer_id = ?")
            .bind(byte_count(bytes))
            .bind(now_text())
            .bind(transfer_id.to_string())
            .execute(self.pool())
            .await
            .with_context(|| format!("update total bytes of transfer {transfer_id}"))?;
        Ok(())
    }

    pub async fn set_transferred_bytes(&self, transfer_id: Uuid, bytes: u64) -> Result<()> {
        sqlx::query("UPDATE database_transfers SET transferred_bytes = ?, updated_at = ? WHERE transfer_id = ?")
            .bind(byte_count(bytes))
            .bind(now_text())
            .bind(transfer_id.to_string())
            .execute(self.pool())
            .await
            .with_context(|| format!("update transferred bytes of transfer {transfer_id}"))?;
        Ok(())
    }

    pub async fn set_target_database(&self, transfer_id: Uuid, database_uuid: &str) -> Result<()> {
        sqlx::query("UPDATE database_transfers SET target_database_uuid = ?, updated_at = ? WHERE transfer_id = ?")
            .bind(database_uuid)
            .bind(now_text())
            .bind(transfer_id.to_string())
            .execute(self.pool())
            .await
            .with_context(|| format!("record target database of transfer {transfer_id}"))?;
        Ok(())
    }

    pub async fn mark_completed(&self, transfer_id: Uuid, step: &str) -> Result<()> {
        let now = now_text();
        sqlx::query(
            "UPDATE database_transfers SET status = 'completed', progress = 100, current_step = ?, error_json = NULL, updated_at = ?, finished_at = ? WHERE transfer_id = ? AND status NOT IN ('completed', 'failed')",
        )
        .bind(step)
        .bind(&now)
        .bind(&now)
        .bind(transfer_id.to_string())
        .execute(self.pool())
        .await
        .with_context(|| format!("complete transfer {transfer_id}"))?;
        Ok(())
    }

    /// Terminal failure. `current_step` keeps naming the step that failed.
    pub async fn mark_failed(&self, transfer_id: Uuid, failure: &TransferFailure) -> Result<()> {
        let now = now_text();
        let error_json = serde_json::to_string(failure).context("serialize transfer failure")?;
        sqlx::query(
            "UPDATE database_transfers SET status = 'failed', error_json = ?, updated_at = ?, finished_at = ? WHERE transfer_id = ? AND status NOT IN ('completed', 'failed')",
        )
        .bind(error_json)
        .bind(&now)
        .bind(&now)
        .bind(transfer_id.to_string())
        .execute(self.pool())
        .await
        .with_context(|| format!("fail transfer {transfer_id}"))?;
        Ok(())
    }

    pub async fn append_log(&self, transfer_id: Uuid, level: LogLevel, message: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO transfer_logs(transfer_id, logged_at, level, message) VALUES (?, ?, ?, ?)",
        )
        .bind(transfer_id.to_string())
        .bind(now_text())
        .bind(level.as_str())
        .bind(message)
        .execute(self.pool())
        .await
        .with_context(|| format!("append log to transfer {transfer_id}"))?;
        Ok(())
    }

    /// Fails records a previous process left mid-pipeline. Nothing resumes them.
    pub async fn fail_interrupted_transfers(&self) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, String>(&format!(
            "SELECT transfer_id FROM database_transfers WHERE status IN {ACTIVE_STATUS_SQL}"
        ))
        .fetch_all(self.pool())
        .await
        .context("query interrupted transfers")?;

        let mut failed = Vec::with_capacity(ids.len());
        for id in ids {
            let transfer_id =
                Uuid::parse_str(&id).with_context(|| format!("invalid transfer id {id}"))?;
            let failure = TransferFailure::new(
                "interrupted",
                "transfer was interrupted by a service restart",
            );
            self.mark_failed(transfer_id, &failure).await?;
            self.append_log(transfer_id, LogLevel::Error, &failure.message)
                .await?;
            failed.push(transfer_id);
        }
        Ok(failed)
    }

    /// Deletes terminal records (and their logs) that finished before the retention window.
    pub async fn purge_finished(&self, retention_days: i64) -> Result<u64> {
        let cutoff = timestamp_text(Utc::now() - chrono::Duration::days(retention_days));
        let result = sqlx::query(
            "DELETE FROM database_transfers WHERE status IN ('completed', 'failed') AND finished_at IS NOT NULL AND finished_at < ?",
        )
        .bind(cutoff)
        .execute(self.pool())
        .await
        .context("purge finished transfers")?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{NewDatabase, NewEnvironment, NewServer};
    use crate::repository::StorageConfig;
    use dbxfer_contract::DatabaseKind;

    async fn storage() -> DbxferStorage {
        DbxferStorage::connect(&StorageConfig::in_memory())
            .await
            .expect("connect")
    }

    fn new_transfer(source_id: i64) -> NewTransfer {
        NewTransfer {
            source: SourceRef {
                kind: DatabaseKind::Postgresql,
                id: source_id,
            },
            source_database_uuid: "pg-src".to_string(),
            target_environment_id: 1,
            target_server_id: 1,
            mode: TransferMode::Partial,
            transfer_options: Some(TransferOptions::Tables(vec!["orders".to_string()])),
            existing_target_uuid: None,
            target_database_uuid: None,
            initiated_by: 7,
            team_id: 3,
        }
    }

    fn created(outcome: InsertOutcome) -> TransferRecord {
        match outcome {
            InsertOutcome::Created(record) => record,
            InsertOutcome::SourceBusy { .. } => panic!("expected a new record"),
        }
    }

    #[tokio::test]
    async fn insert_persists_a_pending_record() {
        let storage = storage().await;
        let record = created(storage.insert_transfer(&new_transfer(1)).await.expect("insert"));

        assert_eq!(record.status, TransferStatus::Pending);
        assert_eq!(record.progress, 0);
        assert_eq!(
            record.transfer_options,
            Some(TransferOptions::Tables(vec!["orders".to_string()]))
        );
        assert!(record.log.is_empty());
    }

    #[tokio::test]
    async fn second_active_transfer_for_a_source_is_refused() {
        let storage = storage().await;
        let first = created(storage.insert_transfer(&new_transfer(1)).await.expect("first"));

        match storage.insert_transfer(&new_transfer(1)).await.expect("second") {
            InsertOutcome::SourceBusy { active_transfer_id } => {
                assert_eq!(active_transfer_id, Some(first.id))
            }
            InsertOutcome::Created(_) => panic!("single-flight violated"),
        }

        created(storage.insert_transfer(&new_transfer(2)).await.expect("other source"));

        storage
            .mark_failed(first.id, &TransferFailure::new("dump", "boom"))
            .await
            .expect("fail");
        created(storage.insert_transfer(&new_transfer(1)).await.expect("after terminal"));
    }

    #[tokio::test]
    async fn progress_is_monotonic_and_frozen_after_terminal_state() {
        let storage = storage().await;
        let record = created(storage.insert_transfer(&new_transfer(1)).await.expect("insert"));

        storage
            .update_progress(record.id, TransferStatus::Transferring, 50, "Dump created")
            .await
            .expect("50");
        storage
            .update_progress(record.id, TransferStatus::Transferring, 20, "Creating dump")
            .await
            .expect("20");
        let current = storage.get_transfer(record.id).await.expect("get").expect("exists");
        assert_eq!(current.progress, 50);
        assert!(current.started_at.is_some());

        storage.mark_completed(record.id, "Completed").await.expect("complete");
        storage
            .update_progress(record.id, TransferStatus::Restoring, 90, "late")
            .await
            .expect("late update");
        let done = storage.get_transfer(record.id).await.expect("get").expect("exists");
        assert_eq!(done.status, TransferStatus::Completed);
        assert_eq!(done.progress, 100);
        assert_eq!(done.current_step.as_deref(), Some("Completed"));
    }

    #[tokio::test]
    async fn status_never_moves_backwards() {
        let storage = storage().await;
        let record = created(storage.insert_transfer(&new_transfer(1)).await.expect("insert"));
        storage
            .update_progress(record.id, TransferStatus::Restoring, 85, "Restoring dump")
            .await
            .expect("forward");

        let refused = storage
            .update_progress(record.id, TransferStatus::Pending, 90, "Resolving source and target")
            .await;
        assert!(refused.is_err());
        assert!(storage
            .update_progress(record.id, TransferStatus::Transferring, 90, "Creating dump")
            .await
            .is_err());

        let current = storage.get_transfer(record.id).await.expect("get").expect("exists");
        assert_eq!(current.status, TransferStatus::Restoring);
        assert_eq!(current.progress, 85);
        assert_eq!(current.current_step.as_deref(), Some("Restoring dump"));

        storage
            .update_progress(record.id, TransferStatus::Restoring, 95, "Restore finished")
            .await
            .expect("same status");
    }

    #[tokio::test]
    async fn log_lines_keep_their_order() {
        let storage = storage().await;
        let record = created(storage.insert_transfer(&new_transfer(1)).await.expect("insert"));

        storage.append_log(record.id, LogLevel::Info, "first").await.expect("log");
        storage.append_log(record.id, LogLevel::Warn, "second").await.expect("log");
        storage.append_log(record.id, LogLevel::Error, "third").await.expect("log");

        let log = storage.transfer_log(record.id).await.expect("log");
        let messages: Vec<_> = log.iter().map(|line| line.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second", "third"]);
        assert_eq!(log[1].level, LogLevel::Warn);
    }

    #[tokio::test]
    async fn interrupted_transfers_are_failed_on_startup() {
        let storage = storage().await;
        let record = created(storage.insert_transfer(&new_transfer(1)).await.expect("insert"));
        storage
            .update_progress(record.id, TransferStatus::Restoring, 85, "Restoring dump")
            .await
            .expect("progress");

        let failed = storage.fail_interrupted_transfers().await.expect("sweep");
        assert_eq!(failed, vec![record.id]);

        let current = storage.get_transfer(record.id).await.expect("get").expect("exists");
        assert_eq!(current.status, TransferStatus::Failed);
        assert_eq!(current.error.map(|e| e.kind), Some("interrupted".to_string()));
        assert_eq!(current.current_step.as_deref(), Some("Restoring dump"));
    }

    #[tokio::test]
    async fn purge_only_removes_old_terminal_records() {
        let storage = storage().await;
        let finished = created(storage.insert_transfer(&new_transfer(1)).await.expect("insert"));
        storage.mark_completed(finished.id, "Completed").await.expect("complete");
        let active = created(storage.insert_transfer(&new_transfer(2)).await.expect("insert"));

        assert_eq!(storage.purge_finished(30).await.expect("purge"), 0);
        assert_eq!(storage.purge_finished(-1).await.expect("purge"), 1);
        assert!(storage.get_transfer(finished.id).await.expect("get").is_none());
        assert!(storage.get_transfer(active.id).await.expect("get").is_some());
    }

    #[tokio::test]
    async fn catalog_round_trips_databases_by_uuid() {
        let storage = storage().await;
        let server = storage
            .upsert_server(&NewServer {
                uuid: "srv-a".to_string(),
                name: "alpha".to_string(),
                ip: "10.0.0.10".to_string(),
                port: 22,
                user: "root".to_string(),
                private_key_path: None,
                reachable: true,
                usable: true,
            })
            .await
            .expect("server");
        let environment = storage
            .upsert_environment(&NewEnvironment {
                uuid: "env-prod".to_string(),
                name: "production".to_string(),
                team_id: 3,
            })
            .await
            .expect("environment");
        let database = storage
            .upsert_database(&NewDatabase {
                uuid: "pg-src".to_string(),
                kind: DatabaseKind::Postgresql,
                name: "orders-db".to_string(),
                environment_uuid: environment.uuid.clone(),
                server_uuid: server.uuid.clone(),
                container: "pg-src".to_string(),
                image: "postgres:16-alpine".to_string(),
                user: "postgres".to_string(),
                password: "secret".to_string(),
                database: "shop".to_string(),
                status: None,
            })
            .await
            .expect("database");

        assert_eq!(database.server_id, server.id);
        assert_eq!(database.environment_id, environment.id);
        assert_eq!(database.status, None);

        let missing_env = storage
            .upsert_database(&NewDatabase {
                uuid: "pg-orphan".to_string(),
                kind: DatabaseKind::Postgresql,
                name: "orphan".to_string(),
                environment_uuid: "nope".to_string(),
                server_uuid: server.uuid.clone(),
                container: "orphan".to_string(),
                image: "postgres:16".to_string(),
                user: "postgres".to_string(),
                password: "secret".to_string(),
                database: "orphan".to_string(),
                status: None,
            })
            .await;
        assert!(missing_env.is_err());
    }
}
