use std::sync::Arc;

use dbxfer_contract::{
    Initiator, LogLevel, SourceRef, TransferEvent, TransferMode, TransferOptions, TransferRecord,
};
use dbxfer_storage::{DbxferStorage, InsertOutcome, NewTransfer};
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::access::AccessPolicy;
use crate::error::IdentifierError;
use crate::identifier::validate_options_for;
use crate::notifier::TransferNotifier;
use crate::registry::StrategyRegistry;

#[derive(Debug, Clone, Deserialize)]
pub struct TransferRequest {
    pub source_database_uuid: String,
    pub target_environment_uuid: String,
    pub target_server_uuid: String,
    pub mode: String,
    #[serde(default)]
    pub transfer_options: Option<TransferOptions>,
    #[serde(default)]
    pub existing_target_uuid: Option<String>,
}

/// Hands an admitted record to whatever runs pipelines. Must not block.
pub trait TransferDispatcher: Send + Sync {
    fn dispatch(&self, record: TransferRecord);
}

#[derive(Debug, Error)]
pub enum Rejection {
    #[error("source database {0} not found")]
    SourceNotFound(String),
    #[error("no transfer strategy registered for {0}")]
    UnsupportedEngine(String),
    #[error("unknown transfer mode {0:?}")]
    UnknownMode(String),
    #[error("initiator may not {0}")]
    Unauthorized(&'static str),
    #[error("no owning team could be resolved for the initiator")]
    OwnerUnresolved,
    #[error("target environment {0} not found")]
    TargetEnvironmentNotFound(String),
    #[error("data_only transfers need an existing target database")]
    ExistingTargetRequired,
    #[error("existing target database {0} not found")]
    ExistingTargetNotFound(String),
    #[error("target engine {target} does not match source engine {source_kind}")]
    EngineMismatch { source_kind: String, target: String },
    #[error("existing target {0} is not in the requested environment")]
    TargetOutsideEnvironment(String),
    #[error("existing target {0} is not on the requested server")]
    TargetServerMismatch(String),
    #[error("target database is the source database")]
    TargetIsSource,
    #[error("an existing target is only accepted for data_only transfers")]
    UnexpectedExistingTarget,
    #[error("target server {0} not found")]
    TargetServerNotFound(String),
    #[error("target server {0} is not reachable or not usable")]
    TargetServerUnavailable(String),
    #[error("partial transfers need at least one table, collection or key pattern")]
    OptionsRequired,
    #[error("{label} options do not apply to {kind} databases")]
    OptionsEngineMismatch { label: &'static str, kind: String },
    #[error("transfer options are only accepted for partial transfers")]
    UnexpectedOptions,
    #[error("{0} does not support partial transfers")]
    PartialUnsupported(String),
    #[error(transparent)]
    InvalidIdentifier(#[from] IdentifierError),
    #[error("source database already has an active transfer")]
    TransferInProgress { active: Option<Uuid> },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Rejection {
    /// Stable code returned to API callers.
    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::SourceNotFound(_) => "source_not_found",
            Rejection::UnsupportedEngine(_) => "unsupported_engine",
            Rejection::UnknownMode(_) => "unknown_mode",
            Rejection::Unauthorized(_) => "unauthorized",
            Rejection::OwnerUnresolved => "owner_unresolved",
            Rejection::TargetEnvironmentNotFound(_) => "target_environment_not_found",
            Rejection::ExistingTargetRequired => "existing_target_required",
            Rejection::ExistingTargetNotFound(_) => "existing_target_not_found",
            Rejection::EngineMismatch { .. } => "engine_mismatch",
            Rejection::TargetOutsideEnvironment(_) => "target_outside_environment",
            Rejection::TargetServerMismatch(_) => "target_server_mismatch",
            Rejection::TargetIsSource => "target_is_source",
            Rejection::UnexpectedExistingTarget => "unexpected_existing_target",
            Rejection::TargetServerNotFound(_) => "target_server_not_found",
            Rejection::TargetServerUnavailable(_) => "target_server_unavailable",
            Rejection::OptionsRequired => "options_required",
            Rejection::OptionsEngineMismatch { .. } => "options_engine_mismatch",
            Rejection::UnexpectedOptions => "unexpected_options",
            Rejection::PartialUnsupported(_) => "partial_unsupported",
            Rejection::InvalidIdentifier(_) => "invalid_identifier",
            Rejection::TransferInProgress { .. } => "transfer_in_progress",
            Rejection::Internal(_) => "internal",
        }
    }
}

/// Validates transfer requests, persists the `pending` record and dispatches it.
#[derive(Clone)]
pub struct TransferAdmissionController {
    storage: DbxferStorage,
    registry: Arc<StrategyRegistry>,
    policy: Arc<dyn AccessPolicy>,
    notifier: Arc<dyn TransferNotifier>,
    dispatcher: Arc<dyn TransferDispatcher>,
}

impl TransferAdmissionController {
    pub fn new(
        storage: DbxferStorage,
        registry: Arc<StrategyRegistry>,
        policy: Arc<dyn AccessPolicy>,
        notifier: Arc<dyn TransferNotifier>,
        dispatcher: Arc<dyn TransferDispatcher>,
    ) -> Self {
        Self {
            storage,
            registry,
            policy,
            notifier,
            dispatcher,
        }
    }

    /// Checks run in a fixed order and the first failing one wins. Returns as soon
    /// as the record is stored; the pipeline runs in the background.
    pub async fn create(
        &self,
        request: &TransferRequest,
        initiator: &Initiator,
    ) -> Result<TransferRecord, Rejection> {
        let source = self
            .storage
            .get_database_by_uuid(&request.source_database_uuid)
            .await?
            .ok_or_else(|| Rejection::SourceNotFound(request.source_database_uuid.clone()))?;

        let strategy = self
            .registry
            .for_kind(source.kind)
            .ok_or_else(|| Rejection::UnsupportedEngine(source.kind.to_string()))?;

        let mode: TransferMode = request
            .mode
            .parse()
            .map_err(|_| Rejection::UnknownMode(request.mode.clone()))?;

        let source_environment = self.storage.get_environment(source.environment_id).await?;
        if !self
            .policy
            .can_read_database(initiator, &source, source_environment.as_ref())
        {
            return Err(Rejection::Unauthorized("read the source database"));
        }
        let environment = self
            .storage
            .get_environment_by_uuid(&request.target_environment_uuid)
            .await?
            .ok_or_else(|| {
                Rejection::TargetEnvironmentNotFound(request.target_environment_uuid.clone())
            })?;
        if !self.policy.can_use_environment(initiator, &environment) {
            return Err(Rejection::Unauthorized("use the target environment"));
        }

        let team_id = self
            .policy
            .resolve_owner_team(initiator)
            .ok_or(Rejection::OwnerUnresolved)?;

        let existing_target = match (mode, request.existing_target_uuid.as_deref()) {
            (TransferMode::DataOnly, None) => return Err(Rejection::ExistingTargetRequired),
            (TransferMode::DataOnly, Some(uuid)) => {
                let target = self
                    .storage
                    .get_database_by_uuid(uuid)
                    .await?
                    .ok_or_else(|| Rejection::ExistingTargetNotFound(uuid.to_string()))?;
                if target.kind != source.kind {
                    return Err(Rejection::EngineMismatch {
                        source_kind: source.kind.to_string(),
                        target: target.kind.to_string(),
                    });
                }
                if target.environment_id != environment.id {
                    return Err(Rejection::TargetOutsideEnvironment(target.uuid));
                }
                if target.uuid == source.uuid {
                    return Err(Rejection::TargetIsSource);
                }
                Some(target)
            }
            (_, Some(_)) => return Err(Rejection::UnexpectedExistingTarget),
            (_, None) => None,
        };

        let server = self
            .storage
            .get_server_by_uuid(&request.target_server_uuid)
            .await?
            .ok_or_else(|| Rejection::TargetServerNotFound(request.target_server_uuid.clone()))?;
        if !server.is_available() {
            return Err(Rejection::TargetServerUnavailable(server.name));
        }
        if let Some(target) = &existing_target {
            if target.server_id != server.id {
                return Err(Rejection::TargetServerMismatch(target.uuid.clone()));
            }
        }

        match (mode, &request.transfer_options) {
            (TransferMode::Partial, None) => return Err(Rejection::OptionsRequired),
            (TransferMode::Partial, Some(options)) => {
                if options.is_empty() {
                    return Err(Rejection::OptionsRequired);
                }
                if !options.applies_to(source.kind) {
                    return Err(Rejection::OptionsEngineMismatch {
                        label: options.label(),
                        kind: source.kind.to_string(),
                    });
                }
                validate_options_for(source.kind, options)?;
                if !strategy.supports_partial_transfer() {
                    return Err(Rejection::PartialUnsupported(source.kind.to_string()));
                }
            }
            (_, Some(_)) => return Err(Rejection::UnexpectedOptions),
            (_, None) => {}
        }

        let outcome = self
            .storage
            .insert_transfer(&NewTransfer {
                source: SourceRef {
                    kind: source.kind,
                    id: source.id,
                },
                source_database_uuid: source.uuid.clone(),
                target_environment_id: environment.id,
                target_server_id: server.id,
                mode,
                transfer_options: request.transfer_options.clone(),
                existing_target_uuid: request.existing_target_uuid.clone(),
                target_database_uuid: existing_target.map(|target| target.uuid),
                initiated_by: initiator.user_id,
                team_id,
            })
            .await?;
        let record = match outcome {
            InsertOutcome::Created(record) => record,
            InsertOutcome::SourceBusy { active_transfer_id } => {
                return Err(Rejection::TransferInProgress {
                    active: active_transfer_id,
                })
            }
        };

        info!(
            transfer_id = %record.id,
            source = %source.uuid,
            mode = %mode,
            target_server = %server.name,
            "transfer admitted"
        );
        let message = format!("Transfer requested by user {}", initiator.user_id);
        if let Err(error) = self
            .storage
            .append_log(record.id, LogLevel::Info, &message)
            .await
        {
            warn!(transfer_id = %record.id, error = %error, "could not write admission log line");
        }
        self.notifier
            .publish(TransferEvent::status_changed(record.clone()));
        self.dispatcher.dispatch(record.clone());
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use dbxfer_contract::{DatabaseKind, DatabaseStatus, TransferStatus};
    use dbxfer_remote::RecordingExecutor;
    use dbxfer_storage::{NewDatabase, NewEnvironment, NewServer, StorageConfig};

    use crate::access::TeamScopedPolicy;
    use crate::notifier::BroadcastNotifier;
    use crate::settings::TransferSettings;
    use crate::strategy::EngineContext;

    #[derive(Default)]
    struct Collected(Mutex<Vec<TransferRecord>>);

    impl TransferDispatcher for Collected {
        fn dispatch(&self, record: TransferRecord) {
            if let Ok(mut records) = self.0.lock() {
                records.push(record);
            }
        }
    }

    struct Fixture {
        controller: TransferAdmissionController,
        dispatched: Arc<Collected>,
    }

    async fn fixture_with(registry: StrategyRegistry) -> Fixture {
        let storage = DbxferStorage::connect(&StorageConfig::in_memory())
            .await
            .expect("storage");
        for (uuid, name, reachable) in [("srv-a", "alpha", true), ("srv-b", "beta", true), ("srv-c", "gamma", false)] {
            storage
                .upsert_server(&NewServer {
                    uuid: uuid.to_string(),
                    name: name.to_string(),
                    ip: "10.0.0.10".to_string(),
                    port: 22,
                    user: "root".to_string(),
                    private_key_path: None,
                    reachable,
                    usable: true,
                })
                .await
                .expect("server");
        }
        for (uuid, team_id) in [("prod", 1), ("staging", 1), ("foreign", 9)] {
            storage
                .upsert_environment(&NewEnvironment {
                    uuid: uuid.to_string(),
                    name: uuid.to_string(),
                    team_id,
                })
                .await
                .expect("environment");
        }
        for (uuid, kind, environment, server) in [
            ("pg-src", DatabaseKind::Postgresql, "prod", "srv-a"),
            ("pg-stage", DatabaseKind::Postgresql, "staging", "srv-b"),
            ("mongo-stage", DatabaseKind::Mongodb, "staging", "srv-b"),
        ] {
            storage
                .upsert_database(&NewDatabase {
                    uuid: uuid.to_string(),
                    kind,
                    name: uuid.to_string(),
                    environment_uuid: environment.to_string(),
                    server_uuid: server.to_string(),
                    container: uuid.to_string(),
                    image: "postgres:16".to_string(),
                    user: "app".to_string(),
                    password: "secret".to_string(),
                    database: "shop".to_string(),
                    status: Some(DatabaseStatus::Running),
                })
                .await
                .expect("database");
        }

        let dispatched = Arc::new(Collected::default());
        let controller = TransferAdmissionController::new(
            storage,
            Arc::new(registry),
            Arc::new(TeamScopedPolicy),
            Arc::new(BroadcastNotifier::default()),
            dispatched.clone(),
        );
        Fixture {
            controller,
            dispatched,
        }
    }

    async fn fixture() -> Fixture {
        let context = EngineContext::new(
            Arc::new(RecordingExecutor::new()),
            TransferSettings::without_delays(),
        );
        fixture_with(StrategyRegistry::with_default_engines(context)).await
    }

    fn initiator() -> Initiator {
        Initiator {
            user_id: 7,
            current_team: Some(1),
            team_ids: vec![1],
        }
    }

    fn request(mode: &str) -> TransferRequest {
        TransferRequest {
            source_database_uuid: "pg-src".to_string(),
            target_environment_uuid: "staging".to_string(),
            target_server_uuid: "srv-b".to_string(),
            mode: mode.to_string(),
            transfer_options: None,
            existing_target_uuid: None,
        }
    }

    async fn reject(fixture: &Fixture, request: &TransferRequest) -> &'static str {
        fixture
            .controller
            .create(request, &initiator())
            .await
            .expect_err("rejected")
            .reason()
    }

    #[tokio::test]
    async fn admitted_clone_is_pending_and_dispatched() {
        let fixture = fixture().await;
        let record = fixture
            .controller
            .create(&request("clone"), &initiator())
            .await
            .expect("admitted");

        assert_eq!(record.status, TransferStatus::Pending);
        assert_eq!(record.team_id, 1);
        assert_eq!(record.initiated_by, 7);
        let dispatched = fixture.dispatched.0.lock().expect("lock");
        assert_eq!(dispatched.len(), 1);
        assert_eq!(dispatched[0].id, record.id);
    }

    #[tokio::test]
    async fn data_only_records_the_resolved_target() {
        let fixture = fixture().await;
        let mut data_only = request("data_only");
        data_only.existing_target_uuid = Some("pg-stage".to_string());

        let record = fixture
            .controller
            .create(&data_only, &initiator())
            .await
            .expect("admitted");

        assert_eq!(record.target_database_uuid.as_deref(), Some("pg-stage"));
    }

    #[tokio::test]
    async fn checks_run_in_order() {
        let empty = fixture_with(StrategyRegistry::new()).await;
        assert_eq!(reject(&empty, &request("sideways")).await, "unsupported_engine");

        let fixture = fixture().await;
        assert_eq!(reject(&fixture, &request("sideways")).await, "unknown_mode");

        let mut missing = request("clone");
        missing.source_database_uuid = "nope".to_string();
        assert_eq!(reject(&fixture, &missing).await, "source_not_found");

        let mut foreign = request("clone");
        foreign.target_environment_uuid = "foreign".to_string();
        assert_eq!(reject(&fixture, &foreign).await, "unauthorized");

        let outsider = Initiator {
            user_id: 7,
            current_team: Some(2),
            team_ids: vec![1],
        };
        let rejection = fixture
            .controller
            .create(&request("clone"), &outsider)
            .await
            .expect_err("no owner");
        assert_eq!(rejection.reason(), "owner_unresolved");

        let mut unavailable = request("clone");
        unavailable.target_server_uuid = "srv-c".to_string();
        assert_eq!(reject(&fixture, &unavailable).await, "target_server_unavailable");

        assert!(fixture.dispatched.0.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn data_only_target_must_match_the_source() {
        let fixture = fixture().await;
        assert_eq!(reject(&fixture, &request("data_only")).await, "existing_target_required");

        let mut wrong_engine = request("data_only");
        wrong_engine.existing_target_uuid = Some("mongo-stage".to_string());
        assert_eq!(reject(&fixture, &wrong_engine).await, "engine_mismatch");

        let mut wrong_env = request("data_only");
        wrong_env.existing_target_uuid = Some("pg-src".to_string());
        assert_eq!(reject(&fixture, &wrong_env).await, "target_outside_environment");

        let mut clone_with_target = request("clone");
        clone_with_target.existing_target_uuid = Some("pg-stage".to_string());
        assert_eq!(reject(&fixture, &clone_with_target).await, "unexpected_existing_target");
    }

    #[tokio::test]
    async fn partial_requires_usable_options() {
        let fixture = fixture().await;
        assert_eq!(reject(&fixture, &request("partial")).await, "options_required");

        let mut blank = request("partial");
        blank.transfer_options = Some(TransferOptions::Tables(vec![" ".to_string()]));
        assert_eq!(reject(&fixture, &blank).await, "options_required");

        let mut collections = request("partial");
        collections.transfer_options = Some(TransferOptions::Collections(vec!["users".to_string()]));
        assert_eq!(reject(&fixture, &collections).await, "options_engine_mismatch");

        let mut injected = request("partial");
        injected.transfer_options = Some(TransferOptions::Tables(vec!["orders; DROP TABLE users".to_string()]));
        assert_eq!(reject(&fixture, &injected).await, "invalid_identifier");

        let mut clone_with_options = request("clone");
        clone_with_options.transfer_options = Some(TransferOptions::Tables(vec!["orders".to_string()]));
        assert_eq!(reject(&fixture, &clone_with_options).await, "unexpected_options");
    }

    #[tokio::test]
    async fn second_transfer_for_a_busy_source_conflicts() {
        let fixture = fixture().await;
        let first = fixture
            .controller
            .create(&request("clone"), &initiator())
            .await
            .expect("first");

        let rejection = fixture
            .controller
            .create(&request("clone"), &initiator())
            .await
            .expect_err("busy");
        match rejection {
            Rejection::TransferInProgress { active } => assert_eq!(active, Some(first.id)),
            other => panic!("unexpected rejection {other:?}"),
        }
    }
}
