use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use dbxfer_control_plane::{build_router, AppState};
use dbxfer_engine::{
    AccessPolicy, BroadcastNotifier, DockerProvisioner, EngineContext, StrategyRegistry,
    StructureInspector, TeamScopedPolicy, TransferAdmissionController, TransferOrchestrator,
    TransferSettings,
};
use dbxfer_remote::{RemoteExecutor, SshConfig, SshExecutor};
use dbxfer_storage::{DbxferStorage, NewDatabase, NewEnvironment, NewServer, StorageConfig};
use serde::Deserialize;
use tracing::{error, info, warn};

const PURGE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Parser)]
#[command(author, version, about = "Database transfer orchestration daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP control plane and the transfer pipeline.
    Serve {
        #[arg(long, default_value = "config/dbxferd.toml")]
        config: PathBuf,
    },
    /// Load servers, environments and databases into the catalog.
    Catalog {
        #[command(subcommand)]
        action: CatalogAction,
    },
    /// Inspect stored transfer records.
    Transfer {
        #[command(subcommand)]
        action: TransferAction,
    },
}

#[derive(Debug, Subcommand)]
enum CatalogAction {
    Import {
        #[arg(long, default_value = "config/dbxferd.toml")]
        config: PathBuf,
        #[arg(long)]
        file: PathBuf,
    },
}

#[derive(Debug, Subcommand)]
enum TransferAction {
    Show {
        #[arg(long, default_value = "config/dbxferd.toml")]
        config: PathBuf,
        #[arg(long)]
        id: uuid::Uuid,
    },
}

#[derive(Debug, Clone, Deserialize)]
struct RuntimeConfig {
    http: HttpSection,
    storage: StorageSection,
    #[serde(default)]
    ssh: SshSection,
    #[serde(default)]
    transfer: TransferSection,
}

#[derive(Debug, Clone, Deserialize)]
struct HttpSection {
    bind: String,
    auth_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct StorageSection {
    sqlite_path: String,
    #[serde(default = "default_max_connections")]
    max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct SshSection {
    connect_timeout_secs: u64,
    multiplexing: bool,
    control_path_dir: PathBuf,
    strict_host_key_checking: String,
}

impl Default for SshSection {
    fn default() -> Self {
        let defaults = SshConfig::default();
        Self {
            connect_timeout_secs: defaults.connect_timeout_secs,
            multiplexing: defaults.multiplexing,
            control_path_dir: defaults.control_path_dir,
            strict_host_key_checking: defaults.strict_host_key_checking,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct TransferSection {
    scratch_dir: String,
    command_timeout_secs: u64,
    dump_timeout_secs: u64,
    relocate_timeout_secs: u64,
    restore_timeout_secs: u64,
    snapshot_poll_attempts: u32,
    snapshot_poll_interval_ms: u64,
    readiness_poll_attempts: u32,
    readiness_poll_interval_ms: u64,
    /// Finished records are kept forever unless this is set.
    retention_days: Option<i64>,
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            scratch_dir: "/tmp/dbxfer".to_string(),
            command_timeout_secs: 300,
            dump_timeout_secs: 3600,
            relocate_timeout_secs: 3600,
            restore_timeout_secs: 3600,
            snapshot_poll_attempts: 60,
            snapshot_poll_interval_ms: 1000,
            readiness_poll_attempts: 30,
            readiness_poll_interval_ms: 2000,
            retention_days: None,
        }
    }
}

impl TransferSection {
    fn settings(&self) -> TransferSettings {
        TransferSettings {
            scratch_dir: self.scratch_dir.clone(),
            command_timeout: Duration::from_secs(self.command_timeout_secs),
            dump_timeout: Duration::from_secs(self.dump_timeout_secs),
            relocate_timeout: Duration::from_secs(self.relocate_timeout_secs),
            restore_timeout: Duration::from_secs(self.restore_timeout_secs),
            snapshot_poll_attempts: self.snapshot_poll_attempts,
            snapshot_poll_interval: Duration::from_millis(self.snapshot_poll_interval_ms),
            readiness_poll_attempts: self.readiness_poll_attempts,
            readiness_poll_interval: Duration::from_millis(self.readiness_poll_interval_ms),
        }
    }
}

/// Catalog file for `catalog import`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CatalogFile {
    servers: Vec<NewServer>,
    environments: Vec<NewEnvironment>,
    databases: Vec<NewDatabase>,
}

fn default_max_connections() -> u32 {
    8
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config } => serve(config).await,
        Command::Catalog {
            action: CatalogAction::Import { config, file },
        } => import_catalog(config, file).await,
        Command::Transfer {
            action: TransferAction::Show { config, id },
        } => show_transfer(config, id).await,
    }
}

fn load_config(config_path: &Path) -> Result<RuntimeConfig> {
    let config_source = std::fs::read_to_string(config_path)
        .with_context(|| format!("failed to read config file {}", config_path.display()))?;
    toml::from_str(&config_source)
        .with_context(|| format!("invalid config TOML at {}", config_path.display()))
}

async fn open_storage(config: &RuntimeConfig) -> Result<DbxferStorage> {
    DbxferStorage::connect(&StorageConfig {
        sqlite_path: config.storage.sqlite_path.clone(),
        max_connections: config.storage.max_connections,
    })
    .await
}

async fn serve(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    let storage = open_storage(&config).await?;

    let require_bearer = requires_token(&config.http.bind);
    if require_bearer && config.http.auth_token.is_none() {
        return Err(anyhow!(
            "non-loopback bind {} requires http.auth_token",
            config.http.bind
        ));
    }
    if !require_bearer {
        info!("loopback bind detected: bearer auth optional");
    } else {
        warn!("non-loopback bind detected: bearer auth enforced");
    }

    startup_housekeeping(&storage, &config.transfer).await?;

    let settings = config.transfer.settings();
    let ssh = SshExecutor::new(SshConfig {
        connect_timeout_secs: config.ssh.connect_timeout_secs,
        multiplexing: config.ssh.multiplexing,
        control_path_dir: config.ssh.control_path_dir.clone(),
        strict_host_key_checking: config.ssh.strict_host_key_checking.clone(),
        default_timeout: settings.command_timeout,
    });
    // Dumps and restores run concurrently against the same hosts.
    let transfer_executor: Arc<dyn RemoteExecutor> = Arc::new(ssh.clone().without_multiplexing());
    let query_executor: Arc<dyn RemoteExecutor> = Arc::new(ssh);

    let registry = Arc::new(StrategyRegistry::with_default_engines(EngineContext::new(
        transfer_executor.clone(),
        settings.clone(),
    )));
    let inspection_registry = Arc::new(StrategyRegistry::with_default_engines(
        EngineContext::new(query_executor, settings.clone()),
    ));
    let notifier = Arc::new(BroadcastNotifier::default());
    let policy: Arc<dyn AccessPolicy> = Arc::new(TeamScopedPolicy);

    let provisioner = DockerProvisioner::new(
        storage.clone(),
        transfer_executor.clone(),
        settings.clone(),
    );
    let orchestrator = TransferOrchestrator::new(
        storage.clone(),
        registry.clone(),
        transfer_executor,
        Arc::new(provisioner),
        notifier.clone(),
        settings,
    );
    let admission = TransferAdmissionController::new(
        storage.clone(),
        registry,
        policy.clone(),
        notifier.clone(),
        Arc::new(orchestrator),
    );
    let inspector = StructureInspector::new(storage.clone(), inspection_registry);

    if let Some(retention_days) = config.transfer.retention_days {
        spawn_retention_purge(storage.clone(), retention_days);
    }

    let state = AppState::new(storage, admission, inspector, policy, notifier)
        .with_bearer_token(config.http.auth_token.clone(), require_bearer);
    let app = build_router(state);

    let socket: SocketAddr = config
        .http
        .bind
        .parse()
        .with_context(|| format!("invalid socket address {}", config.http.bind))?;

    let listener = tokio::net::TcpListener::bind(socket)
        .await
        .with_context(|| format!("failed to bind {}", config.http.bind))?;

    info!(bind = %config.http.bind, "dbxferd control-plane listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("axum server failed")
}

/// Runs before the listener opens. A single `dbxferd` per store is assumed: every
/// non-terminal record left behind belonged to this daemon's previous run.
async fn startup_housekeeping(storage: &DbxferStorage, transfer: &TransferSection) -> Result<()> {
    let interrupted = storage.fail_interrupted_transfers().await?;
    if !interrupted.is_empty() {
        warn!(count = interrupted.len(), "marked interrupted transfers as failed");
    }
    match transfer.retention_days {
        Some(retention_days) => {
            let purged = storage.purge_finished(retention_days).await?;
            info!(purged, retention_days, "finished transfers purged");
        }
        None => info!("retention purge disabled, finished transfers are kept"),
    }
    Ok(())
}

fn spawn_retention_purge(storage: DbxferStorage, retention_days: i64) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PURGE_INTERVAL);
        // The first tick fires immediately; startup already purged.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match storage.purge_finished(retention_days).await {
                Ok(purged) => info!(purged, "finished transfers purged"),
                Err(error) => error!(error = ?error, "retention purge failed"),
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        error!(error = %error, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

async fn import_catalog(config_path: PathBuf, file: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    let storage = open_storage(&config).await?;

    let source = std::fs::read_to_string(&file)
        .with_context(|| format!("failed to read catalog file {}", file.display()))?;
    let catalog: CatalogFile = toml::from_str(&source)
        .with_context(|| format!("invalid catalog TOML at {}", file.display()))?;

    for server in &catalog.servers {
        storage.upsert_server(server).await?;
    }
    for environment in &catalog.environments {
        storage.upsert_environment(environment).await?;
    }
    for database in &catalog.databases {
        storage
            .upsert_database(database)
            .await
            .with_context(|| format!("import database {}", database.uuid))?;
    }

    info!(
        servers = catalog.servers.len(),
        environments = catalog.environments.len(),
        databases = catalog.databases.len(),
        "catalog imported"
    );
    Ok(())
}

async fn show_transfer(config_path: PathBuf, id: uuid::Uuid) -> Result<()> {
    let config = load_config(&config_path)?;
    let storage = open_storage(&config).await?;
    let record = storage
        .get_transfer(id)
        .await?
        .ok_or_else(|| anyhow!("transfer {id} not found"))?;
    println!(
        "{}",
        serde_json::to_string_pretty(&record).context("serialize transfer record")?
    );
    Ok(())
}

fn requires_token(bind: &str) -> bool {
    match bind.parse::<SocketAddr>() {
        Ok(addr) => !addr.ip().is_loopback(),
        Err(_) => true,
    }
}
