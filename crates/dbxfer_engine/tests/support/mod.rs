#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use dbxfer_contract::{DatabaseKind, DatabaseStatus, Initiator, TransferRecord};
use dbxfer_engine::{
    BroadcastNotifier, DockerProvisioner, EngineContext, StrategyRegistry, TeamScopedPolicy,
    TransferAdmissionController, TransferDispatcher, TransferOrchestrator, TransferRequest,
    TransferSettings,
};
use dbxfer_remote::RecordingExecutor;
use dbxfer_storage::{DbxferStorage, NewDatabase, NewEnvironment, NewServer, StorageConfig};
use uuid::Uuid;

/// Holds admitted records so each test decides when the pipeline runs.
#[derive(Default)]
pub struct ManualDispatcher {
    records: Mutex<Vec<TransferRecord>>,
}

impl ManualDispatcher {
    pub fn take(&self) -> Vec<TransferRecord> {
        self.records
            .lock()
            .map(|mut records| std::mem::take(&mut *records))
            .unwrap_or_default()
    }
}

impl TransferDispatcher for ManualDispatcher {
    fn dispatch(&self, record: TransferRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }
}

pub struct Harness {
    pub storage: DbxferStorage,
    pub executor: RecordingExecutor,
    pub notifier: Arc<BroadcastNotifier>,
    pub dispatcher: Arc<ManualDispatcher>,
    pub admission: TransferAdmissionController,
    pub orchestrator: TransferOrchestrator,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_registry(StrategyRegistry::with_default_engines).await
    }

    pub async fn with_registry(build: impl FnOnce(EngineContext) -> StrategyRegistry) -> Self {
        let storage = DbxferStorage::connect(&StorageConfig::in_memory())
            .await
            .expect("storage");
        seed_catalog(&storage).await;

        let executor = RecordingExecutor::new();
        let settings = TransferSettings::without_delays();
        let context = EngineContext::new(Arc::new(executor.clone()), settings.clone());
        let registry = Arc::new(build(context));
        let notifier = Arc::new(BroadcastNotifier::new(1024));
        let dispatcher = Arc::new(ManualDispatcher::default());

        let provisioner = DockerProvisioner::new(
            storage.clone(),
            Arc::new(executor.clone()),
            settings.clone(),
        );
        let orchestrator = TransferOrchestrator::new(
            storage.clone(),
            registry.clone(),
            Arc::new(executor.clone()),
            Arc::new(provisioner),
            notifier.clone(),
            settings,
        );
        let admission = TransferAdmissionController::new(
            storage.clone(),
            registry,
            Arc::new(TeamScopedPolicy),
            notifier.clone(),
            dispatcher.clone(),
        );

        Self {
            storage,
            executor,
            notifier,
            dispatcher,
            admission,
            orchestrator,
        }
    }

    pub async fn admit(&self, request: &TransferRequest) -> TransferRecord {
        let record = self
            .admission
            .create(request, &initiator())
            .await
            .expect("admitted");
        let dispatched = self.dispatcher.take();
        assert_eq!(dispatched.len(), 1);
        record
    }

    /// Admits and runs the pipeline to its terminal state.
    pub async fn run(&self, request: &TransferRequest) -> TransferRecord {
        let record = self.admit(request).await;
        self.orchestrator.execute(record).await.expect("execute")
    }

    pub async fn record(&self, id: Uuid) -> TransferRecord {
        self.storage
            .get_transfer(id)
            .await
            .expect("query")
            .expect("record")
    }

    pub fn scripts_on(&self, server: &str, needle: &str) -> usize {
        self.executor
            .calls_on(server)
            .iter()
            .filter(|call| call.script.contains(needle))
            .count()
    }
}

pub fn initiator() -> Initiator {
    Initiator {
        user_id: 7,
        current_team: Some(1),
        team_ids: vec![1],
    }
}

pub fn request(source: &str, server: &str, mode: &str) -> TransferRequest {
    TransferRequest {
        source_database_uuid: source.to_string(),
        target_environment_uuid: "staging".to_string(),
        target_server_uuid: server.to_string(),
        mode: mode.to_string(),
        transfer_options: None,
        existing_target_uuid: None,
    }
}

/// Hex dump of `bytes` the way `od -An -tx1` prints it.
pub fn od_output(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!(" {byte:02x}")).collect()
}

/// Servers `alpha` (`srv-a`) and `beta` (`srv-b`), environments `prod` and
/// `staging` owned by team 1, and one source per engine family on alpha.
async fn seed_catalog(storage: &DbxferStorage) {
    for (uuid, name, ip) in [("srv-a", "alpha", "10.0.0.10"), ("srv-b", "beta", "10.0.0.11")] {
        storage
            .upsert_server(&NewServer {
                uuid: uuid.to_string(),
                name: name.to_string(),
                ip: ip.to_string(),
                port: 22,
                user: "root".to_string(),
                private_key_path: None,
                reachable: true,
                usable: true,
            })
            .await
            .expect("server");
    }
    for uuid in ["prod", "staging"] {
        storage
            .upsert_environment(&NewEnvironment {
                uuid: uuid.to_string(),
                name: uuid.to_string(),
                team_id: 1,
            })
            .await
            .expect("environment");
    }
    let databases = [
        ("pg-src", DatabaseKind::Postgresql, "prod", "srv-a", "postgres:16"),
        ("pg-stage", DatabaseKind::Postgresql, "staging", "srv-b", "postgres:16"),
        ("redis-src", DatabaseKind::Redis, "prod", "srv-a", "redis:7"),
        ("mongo-src", DatabaseKind::Mongodb, "prod", "srv-a", "mongo:7"),
        ("ch-src", DatabaseKind::Clickhouse, "prod", "srv-a", "clickhouse/clickhouse-server:24"),
    ];
    for (uuid, kind, environment, server, image) in databases {
        storage
            .upsert_database(&NewDatabase {
                uuid: uuid.to_string(),
                kind,
                name: uuid.to_string(),
                environment_uuid: environment.to_string(),
                server_uuid: server.to_string(),
                container: uuid.to_string(),
                image: image.to_string(),
                user: "app".to_string(),
                password: "secret".to_string(),
                database: "shop".to_string(),
                status: Some(DatabaseStatus::Running),
            })
            .await
            .expect("database");
    }
}
