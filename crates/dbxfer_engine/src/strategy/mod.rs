pub mod clickhouse;
pub mod columnar;
pub mod keyvalue;
pub mod mongo;
pub mod mysql;
pub mod postgres;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dbxfer_contract::{
    DatabaseInstance, DatabaseStatus, Server, StructureItem, TransferMode, TransferOptions,
    TransferRecord,
};
use dbxfer_remote::{quote, quote_env, ExecError, RemoteExecutor};
use tracing::{debug, warn};

use crate::artifact::ArtifactPath;
use crate::settings::TransferSettings;

pub use clickhouse::ClickhouseStrategy;
pub use keyvalue::KeyValueStrategy;
pub use mongo::MongoStrategy;
pub use mysql::MysqlStrategy;
pub use postgres::PostgresStrategy;

/// A database together with the server that hosts its container.
#[derive(Debug, Clone)]
pub struct DatabaseHandle {
    pub instance: DatabaseInstance,
    pub server: Server,
}

impl DatabaseHandle {
    pub fn new(instance: DatabaseInstance, server: Server) -> Self {
        Self { instance, server }
    }

    pub fn container(&self) -> &str {
        &self.instance.container
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpOutcome {
    pub success: bool,
    pub size_bytes: u64,
    pub error: Option<String>,
}

impl DumpOutcome {
    pub fn created(size_bytes: u64) -> Self {
        Self {
            success: true,
            size_bytes,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            size_bytes: 0,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreOutcome {
    pub success: bool,
    pub error: Option<String>,
}

impl RestoreOutcome {
    pub fn restored() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn from_errors(errors: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }
}

/// Executor and settings every strategy runs with.
#[derive(Clone)]
pub struct EngineContext {
    pub executor: Arc<dyn RemoteExecutor>,
    pub settings: TransferSettings,
}

impl EngineContext {
    pub fn new(executor: Arc<dyn RemoteExecutor>, settings: TransferSettings) -> Self {
        Self { executor, settings }
    }

    pub async fn run(
        &self,
        server: &Server,
        commands: Vec<String>,
        timeout: Duration,
    ) -> Result<String, ExecError> {
        self.executor.run(&commands, server, true, Some(timeout)).await
    }

    /// Short query under the command timeout.
    pub async fn query(&self, server: &Server, command: String) -> Result<String, ExecError> {
        self.run(server, vec![command], self.settings.command_timeout)
            .await
    }

    /// Size of a file on `server`, `0` when it does not exist.
    pub async fn artifact_size(&self, server: &Server, path: &str) -> Result<u64, ExecError> {
        let output = self
            .query(server, format!("stat -c %s {} 2>/dev/null || echo 0", quote(path)))
            .await?;
        Ok(parse_count(&output))
    }

    /// First `len` bytes of a file on `server`.
    pub async fn probe_magic(
        &self,
        server: &Server,
        path: &str,
        len: usize,
    ) -> Result<Vec<u8>, ExecError> {
        let output = self
            .query(
                server,
                format!("head -c {len} {} | od -An -v -tx1", quote(path)),
            )
            .await?;
        Ok(parse_hex_bytes(&output))
    }

    /// Best-effort removal of everything a dump may have left at `path`.
    pub async fn remove_artifacts(&self, server: &Server, path: &ArtifactPath) -> bool {
        let commands = vec![
            format!(
                "rm -rf {} {} {}",
                quote(path.file()),
                quote(&path.staging()),
                quote(&path.partial())
            ),
            format!("rmdir {} 2>/dev/null || true", quote(path.dir())),
        ];
        match self
            .executor
            .run(&commands, server, true, Some(self.settings.command_timeout))
            .await
        {
            Ok(_) => true,
            Err(error) => {
                warn!(server = %server.name, path = path.file(), error = %error, "artifact cleanup failed");
                false
            }
        }
    }
}

/// How one database engine dumps, restores, sizes and lists its data.
///
/// Estimation, structure listing and cleanup never fail: they fall back to `0`,
/// an empty list and `false`. Dump and restore report failure in their outcome
/// instead of erroring so the orchestrator can decide how to unwind.
#[async_trait]
pub trait TransferStrategy: Send + Sync {
    fn context(&self) -> &EngineContext;

    /// Registry key, equal to the `DatabaseKind` label.
    fn database_kind(&self) -> &'static str;

    fn dump_file_extension(&self) -> &'static str;

    fn supports_partial_transfer(&self) -> bool {
        true
    }

    /// Mount point of the data volume inside a provisioned container.
    fn data_directory(&self) -> &'static str;

    fn container_environment(&self, instance: &DatabaseInstance) -> Vec<(String, String)>;

    /// Arguments appended to `docker run` after the image.
    fn container_command(&self, _instance: &DatabaseInstance) -> Vec<String> {
        Vec::new()
    }

    async fn ping(&self, database: &DatabaseHandle) -> bool;

    async fn create_dump(
        &self,
        database: &DatabaseHandle,
        path: &ArtifactPath,
        options: Option<&TransferOptions>,
    ) -> DumpOutcome;

    /// `origin` is the database the dump was taken from.
    async fn restore_dump(
        &self,
        database: &DatabaseHandle,
        path: &ArtifactPath,
        options: Option<&TransferOptions>,
        origin: &DatabaseInstance,
    ) -> RestoreOutcome;

    async fn estimate_size(
        &self,
        database: &DatabaseHandle,
        options: Option<&TransferOptions>,
    ) -> u64;

    async fn get_structure(&self, database: &DatabaseHandle) -> Vec<StructureItem>;

    async fn validate_transfer(
        &self,
        source: &DatabaseHandle,
        target: Option<&DatabaseHandle>,
        record: &TransferRecord,
    ) -> ValidationReport {
        let mut errors = Vec::new();
        if record.mode == TransferMode::Partial && !self.supports_partial_transfer() {
            errors.push(format!(
                "{} does not support partial transfers",
                self.database_kind()
            ));
        }
        check_running(self, "source", source, &mut errors).await;
        if let Some(target) = target {
            check_running(self, "target", target, &mut errors).await;
        }
        ValidationReport::from_errors(errors)
    }

    async fn cleanup(&self, server: &Server, path: &ArtifactPath) -> bool {
        self.context().remove_artifacts(server, path).await
    }
}

async fn check_running<S: TransferStrategy + ?Sized>(
    strategy: &S,
    role: &str,
    database: &DatabaseHandle,
    errors: &mut Vec<String>,
) {
    if !database.server.is_available() {
        errors.push(format!(
            "{role} server {} is not reachable",
            database.server.name
        ));
        return;
    }
    if let Some(status) = database.instance.status {
        if status != DatabaseStatus::Running {
            errors.push(format!(
                "{role} database {} is {}",
                database.instance.name,
                status.as_str()
            ));
            return;
        }
    }
    if !strategy.ping(database).await {
        errors.push(format!(
            "{role} database {} is not responding",
            database.instance.name
        ));
    }
}

/// `K='v' docker exec [-i] -e K 'container' <command>`; `command` must already be quoted.
///
/// Values travel in the docker client's environment and are forwarded by name, so
/// secrets never show up in a process argument list on the host.
pub fn docker_exec(
    container: &str,
    env: &[(&str, &str)],
    interactive: bool,
    command: &str,
) -> String {
    let mut line = String::new();
    for (key, value) in env {
        line.push_str(&quote_env(key, value));
        line.push(' ');
    }
    line.push_str("docker exec");
    if interactive {
        line.push_str(" -i");
    }
    for (key, _) in env {
        line.push_str(" -e ");
        line.push_str(key);
    }
    line.push(' ');
    line.push_str(&quote(container));
    line.push(' ');
    line.push_str(command);
    line
}

/// Last non-empty line of `output` as an integer; `0` if it is not one.
/// Fractional values are truncated.
pub fn parse_count(output: &str) -> u64 {
    let Some(line) = output.lines().map(str::trim).rev().find(|line| !line.is_empty()) else {
        return 0;
    };
    line.parse::<u64>()
        .ok()
        .or_else(|| {
            line.parse::<f64>()
                .ok()
                .filter(|value| value.is_finite() && *value >= 0.0)
                .map(|value| value as u64)
        })
        .unwrap_or(0)
}

/// `name<sep>size` rows. The size is taken after the last separator so names may
/// contain it; malformed rows are skipped.
pub fn parse_size_rows(output: &str, separator: char) -> Vec<StructureItem> {
    output
        .lines()
        .filter_map(|line| {
            let (name, size) = line.trim_end().rsplit_once(separator)?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some(StructureItem {
                name: name.to_string(),
                size_bytes: parse_count(size),
            })
        })
        .collect()
}

fn parse_hex_bytes(output: &str) -> Vec<u8> {
    output
        .split_whitespace()
        .filter_map(|token| u8::from_str_radix(token, 16).ok())
        .collect()
}

pub(crate) fn is_gzip(magic: &[u8]) -> bool {
    magic.starts_with(&[0x1f, 0x8b])
}

pub(crate) fn log_best_effort(what: &str, database: &DatabaseHandle, error: &ExecError) {
    debug!(
        database = %database.instance.uuid,
        server = %database.server.name,
        error = %error,
        "{what} unavailable"
    );
}
