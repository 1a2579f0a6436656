mod support;

use std::sync::Arc;

use async_trait::async_trait;
use dbxfer_contract::{
    DatabaseInstance, LogLevel, StructureItem, TransferEventKind, TransferOptions, TransferStatus,
};
use dbxfer_engine::strategy::keyvalue::KEYSPACE_HEADER;
use dbxfer_engine::{
    ArtifactPath, DatabaseHandle, DumpOutcome, EngineContext, RestoreOutcome, StrategyRegistry,
    TransferStrategy,
};
use dbxfer_storage::DbxferStorage;
use support::{od_output, request, Harness};

const PGDMP: &[u8] = b"PGDMP";

fn postgres_happy_path(harness: &Harness) {
    harness
        .executor
        .respond("pg_database_size", "8192")
        .respond("stat -c %s", "4096")
        .respond("od -An", &od_output(PGDMP));
}

#[tokio::test]
async fn cross_server_clone_completes_and_cleans_both_servers() {
    let harness = Harness::new().await;
    postgres_happy_path(&harness);

    let record = harness.run(&request("pg-src", "srv-b", "clone")).await;

    assert_eq!(record.status, TransferStatus::Completed);
    assert_eq!(record.progress, 100);
    assert_eq!(record.total_bytes, 8192);
    assert_eq!(record.transferred_bytes, 4096);
    assert!(record.error.is_none());
    assert!(record.started_at.is_some());
    assert!(record.finished_at.is_some());

    assert_eq!(harness.executor.scripts_containing("relocate ").len(), 1);
    assert_eq!(harness.scripts_on("alpha", "pg_dump"), 1);
    assert_eq!(harness.scripts_on("beta", "pg_restore"), 1);
    assert_eq!(harness.scripts_on("alpha", "rmdir"), 1);
    assert_eq!(harness.scripts_on("beta", "rmdir"), 1);

    let target_uuid = record.target_database_uuid.expect("provisioned target");
    let target = harness
        .storage
        .get_database_by_uuid(&target_uuid)
        .await
        .expect("query")
        .expect("target");
    assert_eq!(target.name, "pg-src (copy)");
    assert_eq!(harness.scripts_on("beta", "docker run -d"), 1);
}

#[tokio::test]
async fn failed_restore_fails_at_the_restore_step() {
    let harness = Harness::new().await;
    postgres_happy_path(&harness);
    harness
        .executor
        .fail_on("beta", "pg_restore", "relation \"orders\" already exists");

    let record = harness.run(&request("pg-src", "srv-b", "clone")).await;

    assert_eq!(record.status, TransferStatus::Failed);
    assert_eq!(record.current_step.as_deref(), Some("Restoring dump"));
    let failure = record.error.expect("failure");
    assert_eq!(failure.kind, "restore");
    assert_eq!(failure.step.as_deref(), Some("Restoring dump"));
    assert!(failure.message.contains("already exists"));
    assert_eq!(failure.context.get("mode").map(String::as_str), Some("clone"));

    assert_eq!(harness.scripts_on("alpha", "rmdir"), 1);
    assert_eq!(harness.scripts_on("beta", "rmdir"), 1);
    assert!(record
        .log
        .iter()
        .any(|line| line.level == LogLevel::Error && line.message.starts_with("Transfer failed")));
}

#[tokio::test]
async fn same_server_transfer_skips_relocation() {
    let harness = Harness::new().await;
    postgres_happy_path(&harness);

    let record = harness.run(&request("pg-src", "srv-a", "clone")).await;

    assert_eq!(record.status, TransferStatus::Completed);
    assert!(harness.executor.scripts_containing("relocate ").is_empty());
    assert!(harness.executor.calls_on("beta").is_empty());
    assert!(record
        .log
        .iter()
        .any(|line| line.message.contains("skipping copy")));

    let dump = &harness.executor.scripts_containing("pg_dump")[0].script;
    let restore = &harness.executor.scripts_containing("pg_restore")[0].script;
    let artifact = dump
        .split_whitespace()
        .find(|token| token.ends_with(".dump'"))
        .expect("dump path");
    assert!(restore.contains(artifact));
    assert_eq!(harness.scripts_on("alpha", "rmdir"), 1);
}

#[tokio::test]
async fn observed_progress_never_decreases_and_ends_at_100() {
    let harness = Harness::new().await;
    postgres_happy_path(&harness);
    let mut events = harness.notifier.subscribe();

    harness.run(&request("pg-src", "srv-b", "clone")).await;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    let progress: Vec<u8> = seen.iter().map(|event| event.record.progress).collect();
    assert!(progress.windows(2).all(|pair| pair[0] <= pair[1]), "{progress:?}");
    assert!(progress.len() > 8);

    let last = seen.last().expect("events");
    assert_eq!(last.event, TransferEventKind::Completed);
    assert_eq!(last.record.progress, 100);
    assert_eq!(last.record.status, TransferStatus::Completed);
}

#[tokio::test]
async fn validation_failure_stops_before_the_dump() {
    let harness = Harness::new().await;
    harness
        .executor
        .fail_on("alpha", "pg_isready", "no response");

    let record = harness.run(&request("pg-src", "srv-b", "clone")).await;

    assert_eq!(record.status, TransferStatus::Failed);
    let failure = record.error.expect("failure");
    assert_eq!(failure.kind, "validation");
    assert!(failure.message.contains("not responding"));
    assert!(harness.executor.scripts_containing("pg_dump").is_empty());
    assert!(harness.executor.scripts_containing("docker run").is_empty());
}

#[tokio::test]
async fn dump_failure_never_relocates() {
    let harness = Harness::new().await;
    postgres_happy_path(&harness);
    harness.executor.fail("pg_dump", "permission denied");

    let record = harness.run(&request("pg-src", "srv-b", "clone")).await;

    assert_eq!(record.status, TransferStatus::Failed);
    assert_eq!(record.error.as_ref().map(|e| e.kind.as_str()), Some("dump"));
    assert_eq!(record.current_step.as_deref(), Some("Creating dump"));
    assert!(harness.executor.scripts_containing("relocate ").is_empty());
    assert_eq!(harness.scripts_on("alpha", "rmdir"), 1);
    assert_eq!(harness.scripts_on("beta", "rmdir"), 1);
}

#[tokio::test]
async fn relocation_failure_is_reported_as_such() {
    let harness = Harness::new().await;
    postgres_happy_path(&harness);
    harness.executor.fail_relocation("connection reset by peer");

    let record = harness.run(&request("pg-src", "srv-b", "clone")).await;

    assert_eq!(record.status, TransferStatus::Failed);
    let failure = record.error.expect("failure");
    assert_eq!(failure.kind, "relocation");
    assert_eq!(failure.step.as_deref(), Some("Copying dump to target server"));
    assert!(harness.executor.scripts_containing("pg_restore").is_empty());
    assert_eq!(harness.scripts_on("beta", "rmdir"), 1);
}

#[tokio::test]
async fn data_only_restores_into_the_existing_target() {
    let harness = Harness::new().await;
    postgres_happy_path(&harness);
    let mut data_only = request("pg-src", "srv-b", "data_only");
    data_only.existing_target_uuid = Some("pg-stage".to_string());

    let record = harness.run(&data_only).await;

    assert_eq!(record.status, TransferStatus::Completed);
    assert_eq!(record.target_database_uuid.as_deref(), Some("pg-stage"));
    assert!(harness.executor.scripts_containing("docker run").is_empty());
    let restore = &harness.executor.scripts_containing("pg_restore")[0];
    assert_eq!(restore.server, "beta");
    assert!(restore.script.contains("'pg-stage'"));
}

#[tokio::test]
async fn partial_postgres_transfer_dumps_only_selected_tables() {
    let harness = Harness::new().await;
    harness
        .executor
        .respond("stat -c %s", "512")
        .respond("od -An", &od_output(b"--\n--"));
    let mut partial = request("pg-src", "srv-b", "partial");
    partial.transfer_options = Some(TransferOptions::Tables(vec!["orders".to_string()]));

    let record = harness.run(&partial).await;

    assert_eq!(record.status, TransferStatus::Completed);
    let dump = &harness.executor.scripts_containing("pg_dump")[0].script;
    assert_eq!(dump.matches(" -t ").count(), 1, "{dump}");
    assert!(dump.contains("-t '\"orders\"'"));
    assert!(dump.contains("--clean --if-exists"));
    assert!(!dump.contains("-Fc"));
    assert_eq!(harness.executor.scripts_containing("ON_ERROR_STOP=1").len(), 1);
}

#[tokio::test]
async fn key_pattern_transfer_moves_only_matching_keys() {
    let harness = Harness::new().await;
    harness
        .executor
        .respond("PING", "PONG")
        .respond("--scan --pattern 'session:*'", "session:1\ncache:1\nsession:2")
        .respond("MEMORY USAGE", "96")
        .respond("stat -c %s", "240")
        .respond("od -An", &od_output(KEYSPACE_HEADER.as_bytes()));
    let mut partial = request("redis-src", "srv-b", "partial");
    partial.transfer_options = Some(TransferOptions::KeyPatterns(vec!["session:*".to_string()]));

    let record = harness.run(&partial).await;

    assert_eq!(record.status, TransferStatus::Completed, "{:?}", record.error);
    assert_eq!(record.total_bytes, 96);
    let scans: Vec<_> = harness
        .executor
        .scripts_containing("--scan --pattern 'session:*'")
        .into_iter()
        .filter(|call| !call.script.contains("MEMORY USAGE"))
        .collect();
    assert_eq!(scans.len(), 1);
    assert_eq!(scans[0].server, "alpha");
    let dump = &harness.executor.scripts_containing("dump_key()")[0];
    assert_eq!(dump.server, "alpha");
    assert!(dump.script.contains("dump_key 'session:1'"));
    assert!(dump.script.contains("dump_key 'session:2'"));
    assert_eq!(dump.script.matches("\ndump_key '").count(), 2, "{}", dump.script);
    assert!(!dump.script.contains("cache:1"));

    let restore = &harness.executor.scripts_containing("-x RESTORE")[0];
    assert_eq!(restore.server, "beta");
    assert!(!restore.script.contains("FLUSHALL"));
}

/// Panics while dumping; everything else succeeds.
struct PanickingStrategy {
    context: EngineContext,
}

#[async_trait]
impl TransferStrategy for PanickingStrategy {
    fn context(&self) -> &EngineContext {
        &self.context
    }

    fn database_kind(&self) -> &'static str {
        "postgresql"
    }

    fn dump_file_extension(&self) -> &'static str {
        "dump"
    }

    fn data_directory(&self) -> &'static str {
        "/data"
    }

    fn container_environment(&self, _instance: &DatabaseInstance) -> Vec<(String, String)> {
        Vec::new()
    }

    async fn ping(&self, _database: &DatabaseHandle) -> bool {
        true
    }

    async fn create_dump(
        &self,
        _database: &DatabaseHandle,
        _path: &ArtifactPath,
        _options: Option<&TransferOptions>,
    ) -> DumpOutcome {
        panic!("dump buffer overflow")
    }

    async fn restore_dump(
        &self,
        _database: &DatabaseHandle,
        _path: &ArtifactPath,
        _options: Option<&TransferOptions>,
        _origin: &DatabaseInstance,
    ) -> RestoreOutcome {
        RestoreOutcome::restored()
    }

    async fn estimate_size(
        &self,
        _database: &DatabaseHandle,
        _options: Option<&TransferOptions>,
    ) -> u64 {
        0
    }

    async fn get_structure(&self, _database: &DatabaseHandle) -> Vec<StructureItem> {
        Vec::new()
    }
}

#[tokio::test]
async fn panics_inside_a_strategy_fail_the_record() {
    let harness = Harness::with_registry(|context| {
        let mut registry = StrategyRegistry::new();
        registry.register(Arc::new(PanickingStrategy { context }));
        registry
    })
    .await;

    let record = harness.run(&request("pg-src", "srv-b", "clone")).await;

    assert_eq!(record.status, TransferStatus::Failed);
    let failure = record.error.expect("failure");
    assert_eq!(failure.kind, "panic");
    assert!(failure.message.contains("dump buffer overflow"));
    assert_eq!(harness.scripts_on("alpha", "rmdir"), 1);
    assert_eq!(harness.scripts_on("beta", "rmdir"), 1);
}

#[tokio::test]
async fn unknown_engine_at_run_time_fails_without_touching_servers() {
    let harness = Harness::new().await;
    let record = harness.admit(&request("pg-src", "srv-b", "clone")).await;

    let bare = bare_orchestrator(&harness.storage, &harness);
    let finished = bare.execute(record).await.expect("execute");

    assert_eq!(finished.status, TransferStatus::Failed);
    assert_eq!(
        finished.error.as_ref().map(|e| e.kind.as_str()),
        Some("unsupported_engine")
    );
    assert!(harness.executor.calls().is_empty());
}

fn bare_orchestrator(storage: &DbxferStorage, harness: &Harness) -> dbxfer_engine::TransferOrchestrator {
    let settings = dbxfer_engine::TransferSettings::without_delays();
    dbxfer_engine::TransferOrchestrator::new(
        storage.clone(),
        Arc::new(StrategyRegistry::new()),
        Arc::new(harness.executor.clone()),
        Arc::new(dbxfer_engine::DockerProvisioner::new(
            storage.clone(),
            Arc::new(harness.executor.clone()),
            settings.clone(),
        )),
        harness.notifier.clone(),
        settings,
    )
}
