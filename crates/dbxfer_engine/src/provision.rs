use std::sync::Arc;

use async_trait::async_trait;
use dbxfer_contract::{DatabaseInstance, DatabaseStatus, Server, TransferRecord};
use dbxfer_remote::{quote, quote_env, RemoteExecutor};
use dbxfer_storage::{DbxferStorage, NewDatabase};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::settings::TransferSettings;
use crate::strategy::{DatabaseHandle, TransferStrategy};

/// Creates the database a `clone` or `partial` transfer restores into.
#[async_trait]
pub trait TargetProvisioner: Send + Sync {
    async fn provision(
        &self,
        strategy: &dyn TransferStrategy,
        source: &DatabaseInstance,
        target_server: &Server,
        record: &TransferRecord,
    ) -> Result<DatabaseInstance, EngineError>;
}

/// Starts a fresh container from the source's image and registers it in the catalog.
#[derive(Clone)]
pub struct DockerProvisioner {
    storage: DbxferStorage,
    executor: Arc<dyn RemoteExecutor>,
    settings: TransferSettings,
}

impl DockerProvisioner {
    pub fn new(
        storage: DbxferStorage,
        executor: Arc<dyn RemoteExecutor>,
        settings: TransferSettings,
    ) -> Self {
        Self {
            storage,
            executor,
            settings,
        }
    }

    async fn wait_until_ready(&self, strategy: &dyn TransferStrategy, handle: &DatabaseHandle) -> bool {
        for attempt in 1..=self.settings.readiness_poll_attempts {
            if strategy.ping(handle).await {
                info!(database = %handle.instance.uuid, attempt, "provisioned database is ready");
                return true;
            }
            tokio::time::sleep(self.settings.readiness_poll_interval).await;
        }
        false
    }
}

/// `docker run -d` line for `instance`, with a named volume over the engine's data directory.
/// Environment values are forwarded by name, like [`docker_exec`](crate::strategy::docker_exec).
pub fn docker_run_command(strategy: &dyn TransferStrategy, instance: &DatabaseInstance) -> String {
    let environment = strategy.container_environment(instance);
    let mut line = String::new();
    for (key, value) in &environment {
        line.push_str(&quote_env(key, value));
        line.push(' ');
    }
    line.push_str(&format!(
        "docker run -d --name {} --restart unless-stopped -v {}",
        quote(&instance.container),
        quote(&format!(
            "{}-data:{}",
            instance.container,
            strategy.data_directory()
        ))
    ));
    for (key, _) in &environment {
        line.push_str(" -e ");
        line.push_str(key);
    }
    line.push(' ');
    line.push_str(&quote(&instance.image));
    for arg in strategy.container_command(instance) {
        line.push(' ');
        line.push_str(&quote(&arg));
    }
    line
}

#[async_trait]
impl TargetProvisioner for DockerProvisioner {
    async fn provision(
        &self,
        strategy: &dyn TransferStrategy,
        source: &DatabaseInstance,
        target_server: &Server,
        record: &TransferRecord,
    ) -> Result<DatabaseInstance, EngineError> {
        let environment = self
            .storage
            .get_environment(record.target_environment_id)
            .await?
            .ok_or_else(|| {
                EngineError::Catalog(format!(
                    "target environment {} not found",
                    record.target_environment_id
                ))
            })?;

        let uuid = Uuid::now_v7().to_string();
        let instance = self
            .storage
            .upsert_database(&NewDatabase {
                uuid: uuid.clone(),
                kind: source.kind,
                name: format!("{} (copy)", source.name),
                environment_uuid: environment.uuid,
                server_uuid: target_server.uuid.clone(),
                container: format!("{}-{uuid}", source.kind),
                image: source.image.clone(),
                user: source.credentials.user.clone(),
                password: source.credentials.password.clone(),
                database: source.credentials.database.clone(),
                status: Some(DatabaseStatus::Starting),
            })
            .await?;

        let command = docker_run_command(strategy, &instance);
        if let Err(error) = self
            .executor
            .run(&[command], target_server, true, Some(self.settings.command_timeout))
            .await
        {
            warn!(transfer_id = %record.id, database = %uuid, error = %error, "container start failed");
            self.storage
                .set_database_status(&uuid, DatabaseStatus::Exited)
                .await?;
            return Err(EngineError::Provision(error.to_string()));
        }

        let handle = DatabaseHandle::new(instance, target_server.clone());
        if !self.wait_until_ready(strategy, &handle).await {
            self.storage
                .set_database_status(&uuid, DatabaseStatus::Exited)
                .await?;
            return Err(EngineError::Provision(format!(
                "{} did not become ready after {} attempts",
                handle.container(),
                self.settings.readiness_poll_attempts
            )));
        }

        self.storage
            .set_database_status(&uuid, DatabaseStatus::Running)
            .await?;
        let mut instance = handle.instance;
        instance.status = Some(DatabaseStatus::Running);
        info!(transfer_id = %record.id, database = %uuid, server = %target_server.name, "target database provisioned");
        Ok(instance)
    }
}
