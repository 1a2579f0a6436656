//! Drives one transfer record from `pending` to `completed` or `failed`.
//!
//! Steps run strictly in order: resolve, validate, estimate, dump, relocate,
//! provision (new targets only), restore, cleanup. Every checkpoint moves the
//! stored progress forward, appends a log line and publishes a status event.
//! Whatever ends the run, including a panic inside a strategy, dump artifacts
//! are removed from every server the transfer touched before the record reaches
//! its terminal state.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Context;
use dbxfer_contract::{
    LogLevel, Server, TransferEvent, TransferFailure, TransferRecord, TransferStatus,
};
use dbxfer_remote::RemoteExecutor;
use dbxfer_storage::DbxferStorage;
use futures::FutureExt;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::admission::TransferDispatcher;
use crate::artifact::ArtifactPath;
use crate::error::EngineError;
use crate::notifier::TransferNotifier;
use crate::provision::TargetProvisioner;
use crate::registry::StrategyRegistry;
use crate::settings::TransferSettings;
use crate::strategy::{DatabaseHandle, TransferStrategy};

const STEP_RESOLVE: &str = "Resolving source and target";
const STEP_VALIDATE: &str = "Validating source and target";
const STEP_ESTIMATE: &str = "Estimating size";
const STEP_DUMP: &str = "Creating dump";
const STEP_DUMP_DONE: &str = "Dump created";
const STEP_RELOCATE: &str = "Copying dump to target server";
const STEP_RELOCATE_DONE: &str = "Dump copied to target server";
const STEP_PROVISION: &str = "Provisioning target database";
const STEP_RESTORE: &str = "Restoring dump";
const STEP_RESTORE_DONE: &str = "Restore finished";
const STEP_CLEANUP: &str = "Cleaning up";
const STEP_COMPLETE: &str = "Completed";

/// What the pipeline has learned so far; failure handling works from whatever is set.
#[derive(Default)]
struct RunState {
    progress: u8,
    step: Option<&'static str>,
    strategy: Option<Arc<dyn TransferStrategy>>,
    artifact: Option<ArtifactPath>,
    servers: Vec<Server>,
}

#[derive(Clone)]
pub struct TransferOrchestrator {
    storage: DbxferStorage,
    registry: Arc<StrategyRegistry>,
    executor: Arc<dyn RemoteExecutor>,
    provisioner: Arc<dyn TargetProvisioner>,
    notifier: Arc<dyn TransferNotifier>,
    settings: TransferSettings,
}

impl TransferOrchestrator {
    pub fn new(
        storage: DbxferStorage,
        registry: Arc<StrategyRegistry>,
        executor: Arc<dyn RemoteExecutor>,
        provisioner: Arc<dyn TargetProvisioner>,
        notifier: Arc<dyn TransferNotifier>,
        settings: TransferSettings,
    ) -> Self {
        Self {
            storage,
            registry,
            executor,
            provisioner,
            notifier,
            settings,
        }
    }

    /// Runs the whole pipeline and returns the terminal record.
    ///
    /// Pipeline failures end up in the record, not in the return value. An `Err`
    /// means the record itself could not be updated.
    pub async fn execute(&self, record: TransferRecord) -> anyhow::Result<TransferRecord> {
        info!(transfer_id = %record.id, mode = %record.mode, source = %record.source_database_uuid, "transfer started");
        let mut state = RunState::default();
        let outcome = AssertUnwindSafe(self.run_pipeline(&record, &mut state))
            .catch_unwind()
            .await;

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(error)) => Some(TransferFailure::new(error.kind(), error.to_string())),
            Err(panic) => Some(TransferFailure::new("panic", panic_message(panic.as_ref()))),
        };

        self.cleanup(record.id, &state).await;

        match failure {
            None => {
                self.storage
                    .mark_completed(record.id, STEP_COMPLETE)
                    .await?;
                self.storage
                    .append_log(record.id, LogLevel::Info, "Transfer completed")
                    .await?;
                info!(transfer_id = %record.id, "transfer completed");
            }
            Some(failure) => {
                let failure = failure
                    .at_step(state.step)
                    .with_context("source_database_uuid", record.source_database_uuid.as_str())
                    .with_context("mode", record.mode.as_str());
                warn!(
                    transfer_id = %record.id,
                    kind = %failure.kind,
                    step = ?failure.step,
                    error = %failure.message,
                    "transfer failed"
                );
                self.storage.mark_failed(record.id, &failure).await?;
                self.storage
                    .append_log(
                        record.id,
                        LogLevel::Error,
                        &format!("Transfer failed: {}", failure.message),
                    )
                    .await?;
            }
        }

        let finished = self.snapshot(record.id).await?;
        self.notifier
            .publish(TransferEvent::status_changed(finished.clone()));
        self.notifier.publish(TransferEvent::finished(finished.clone()));
        Ok(finished)
    }

    async fn run_pipeline(
        &self,
        record: &TransferRecord,
        state: &mut RunState,
    ) -> Result<(), EngineError> {
        let options = record.transfer_options.as_ref();
        self.checkpoint(record.id, state, TransferStatus::Validating, 0, STEP_RESOLVE)
            .await?;

        let source = self
            .storage
            .get_database_by_uuid(&record.source_database_uuid)
            .await?
            .ok_or_else(|| {
                EngineError::Catalog(format!(
                    "source database {} not found",
                    record.source_database_uuid
                ))
            })?;
        let strategy = self
            .registry
            .for_kind(source.kind)
            .ok_or_else(|| EngineError::UnsupportedEngine(source.kind.to_string()))?;
        let source_server = self.server(source.server_id).await?;
        let target_server = self.server(record.target_server_id).await?;
        let same_server = source_server.id == target_server.id;

        let artifact = ArtifactPath::for_record(
            &self.settings.scratch_dir,
            record,
            strategy.dump_file_extension(),
        );
        state.strategy = Some(strategy.clone());
        state.artifact = Some(artifact.clone());
        state.servers.push(source_server.clone());
        if !same_server {
            state.servers.push(target_server.clone());
        }

        let existing_target = match &record.existing_target_uuid {
            Some(uuid) => {
                let instance = self
                    .storage
                    .get_database_by_uuid(uuid)
                    .await?
                    .ok_or_else(|| {
                        EngineError::Catalog(format!("target database {uuid} not found"))
                    })?;
                Some(DatabaseHandle::new(instance, target_server.clone()))
            }
            None => None,
        };
        let source = DatabaseHandle::new(source, source_server.clone());

        self.checkpoint(record.id, state, TransferStatus::Validating, 5, STEP_VALIDATE)
            .await?;
        let report = strategy
            .validate_transfer(&source, existing_target.as_ref(), record)
            .await;
        if !report.valid {
            return Err(EngineError::Validation(report.errors));
        }

        self.checkpoint(record.id, state, TransferStatus::Validating, 10, STEP_ESTIMATE)
            .await?;
        let estimate = strategy.estimate_size(&source, options).await;
        self.storage.set_total_bytes(record.id, estimate).await?;
        self.log(record.id, LogLevel::Info, &format!("Estimated size: {estimate} bytes"))
            .await?;

        self.checkpoint(record.id, state, TransferStatus::Transferring, 20, STEP_DUMP)
            .await?;
        let dump = strategy.create_dump(&source, &artifact, options).await;
        if !dump.success {
            return Err(EngineError::Dump(
                dump.error.unwrap_or_else(|| "dump reported failure".to_string()),
            ));
        }
        if dump.size_bytes == 0 {
            return Err(EngineError::Dump("dump file is empty".to_string()));
        }
        self.storage
            .set_transferred_bytes(record.id, dump.size_bytes)
            .await?;
        self.checkpoint(record.id, state, TransferStatus::Transferring, 50, STEP_DUMP_DONE)
            .await?;

        if same_server {
            self.log(
                record.id,
                LogLevel::Info,
                "Source and target share a server, skipping copy",
            )
            .await?;
        } else {
            self.checkpoint(record.id, state, TransferStatus::Transferring, 55, STEP_RELOCATE)
                .await?;
            self.executor
                .relocate(
                    &source_server,
                    &target_server,
                    artifact.file(),
                    Some(self.settings.relocate_timeout),
                )
                .await?;
            self.checkpoint(
                record.id,
                state,
                TransferStatus::Transferring,
                80,
                STEP_RELOCATE_DONE,
            )
            .await?;
        }

        let target = match existing_target {
            Some(target) => target,
            None => {
                self.checkpoint(record.id, state, TransferStatus::Transferring, 82, STEP_PROVISION)
                    .await?;
                let instance = self
                    .provisioner
                    .provision(strategy.as_ref(), &source.instance, &target_server, record)
                    .await?;
                self.storage
                    .set_target_database(record.id, &instance.uuid)
                    .await?;
                self.log(
                    record.id,
                    LogLevel::Info,
                    &format!("Target database {} created", instance.uuid),
                )
                .await?;
                DatabaseHandle::new(instance, target_server.clone())
            }
        };

        self.checkpoint(record.id, state, TransferStatus::Restoring, 85, STEP_RESTORE)
            .await?;
        let restore = strategy
            .restore_dump(&target, &artifact, options, &source.instance)
            .await;
        if !restore.success {
            return Err(EngineError::Restore(
                restore
                    .error
                    .unwrap_or_else(|| "restore reported failure".to_string()),
            ));
        }
        self.checkpoint(record.id, state, TransferStatus::Restoring, 95, STEP_RESTORE_DONE)
            .await?;

        self.checkpoint(record.id, state, TransferStatus::Restoring, 96, STEP_CLEANUP)
            .await?;
        Ok(())
    }

    async fn server(&self, id: i64) -> Result<Server, EngineError> {
        self.storage
            .get_server(id)
            .await?
            .ok_or_else(|| EngineError::Catalog(format!("server {id} not found")))
    }

    async fn checkpoint(
        &self,
        transfer_id: Uuid,
        state: &mut RunState,
        status: TransferStatus,
        progress: u8,
        step: &'static str,
    ) -> Result<(), EngineError> {
        state.progress = state.progress.max(progress);
        state.step = Some(step);
        self.storage
            .update_progress(transfer_id, status, state.progress, step)
            .await?;
        self.storage
            .append_log(transfer_id, LogLevel::Info, step)
            .await?;
        info!(transfer_id = %transfer_id, status = %status, progress = state.progress, step, "transfer progress");
        let snapshot = self.snapshot(transfer_id).await?;
        self.notifier.publish(TransferEvent::status_changed(snapshot));
        Ok(())
    }

    async fn log(
        &self,
        transfer_id: Uuid,
        level: LogLevel,
        message: &str,
    ) -> Result<(), EngineError> {
        self.storage.append_log(transfer_id, level, message).await?;
        Ok(())
    }

    async fn snapshot(&self, transfer_id: Uuid) -> anyhow::Result<TransferRecord> {
        self.storage
            .get_transfer(transfer_id)
            .await?
            .with_context(|| format!("transfer {transfer_id} disappeared"))
    }

    /// Best effort on every server the transfer touched. Never fails the run.
    async fn cleanup(&self, transfer_id: Uuid, state: &RunState) {
        let (Some(strategy), Some(artifact)) = (&state.strategy, &state.artifact) else {
            return;
        };
        for server in &state.servers {
            if strategy.cleanup(server, artifact).await {
                continue;
            }
            let message = format!("Cleanup of {} on {} failed", artifact.file(), server.name);
            warn!(transfer_id = %transfer_id, server = %server.name, "dump cleanup failed");
            if let Err(error) = self
                .storage
                .append_log(transfer_id, LogLevel::Warn, &message)
                .await
            {
                warn!(transfer_id = %transfer_id, error = %error, "could not record cleanup failure");
            }
        }
    }
}

impl TransferDispatcher for TransferOrchestrator {
    fn dispatch(&self, record: TransferRecord) {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            let transfer_id = record.id;
            if let Err(error) = orchestrator.execute(record).await {
                error!(transfer_id = %transfer_id, error = ?error, "transfer bookkeeping failed");
            }
        });
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("transfer panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("transfer panicked: {message}")
    } else {
        "transfer panicked".to_string()
    }
}
