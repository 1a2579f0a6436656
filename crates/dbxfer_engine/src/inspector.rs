use std::sync::Arc;

use dbxfer_contract::{DatabaseStatus, StructureReport};
use dbxfer_storage::DbxferStorage;
use thiserror::Error;
use tracing::debug;

use crate::registry::StrategyRegistry;
use crate::strategy::DatabaseHandle;

#[derive(Debug, Error)]
pub enum InspectionFailure {
    #[error("database {0} not found")]
    DatabaseNotFound(String),
    #[error("no transfer strategy registered for {0}")]
    UnsupportedEngine(String),
    #[error("server hosting database {0} is unavailable")]
    ServerUnavailable(String),
    #[error("database {uuid} is {status}")]
    NotRunning { uuid: String, status: String },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl InspectionFailure {
    pub fn reason(&self) -> &'static str {
        match self {
            InspectionFailure::DatabaseNotFound(_) => "database_not_found",
            InspectionFailure::UnsupportedEngine(_) => "unsupported_engine",
            InspectionFailure::ServerUnavailable(_) => "server_unavailable",
            InspectionFailure::NotRunning { .. } => "database_not_running",
            InspectionFailure::Storage(_) => "storage",
        }
    }
}

/// Lists a database's transferable units for partial-transfer selection. Read only.
#[derive(Clone)]
pub struct StructureInspector {
    storage: DbxferStorage,
    registry: Arc<StrategyRegistry>,
}

impl StructureInspector {
    pub fn new(storage: DbxferStorage, registry: Arc<StrategyRegistry>) -> Self {
        Self { storage, registry }
    }

    pub async fn inspect(&self, database_uuid: &str) -> Result<StructureReport, InspectionFailure> {
        let instance = self
            .storage
            .get_database_by_uuid(database_uuid)
            .await?
            .ok_or_else(|| InspectionFailure::DatabaseNotFound(database_uuid.to_string()))?;
        let strategy = self
            .registry
            .for_kind(instance.kind)
            .ok_or_else(|| InspectionFailure::UnsupportedEngine(instance.kind.to_string()))?;
        let server = self
            .storage
            .get_server(instance.server_id)
            .await?
            .filter(|server| server.is_available())
            .ok_or_else(|| InspectionFailure::ServerUnavailable(database_uuid.to_string()))?;

        // Engines without a tracked run state skip the check.
        if let Some(status) = instance.status.filter(|status| *status != DatabaseStatus::Running) {
            return Err(InspectionFailure::NotRunning {
                uuid: instance.uuid,
                status: status.as_str().to_string(),
            });
        }

        let kind = instance.kind;
        let handle = DatabaseHandle::new(instance, server);
        let items = strategy.get_structure(&handle).await;
        let total_bytes = items.iter().map(|item| item.size_bytes).sum();
        debug!(database = %database_uuid, units = items.len(), total_bytes, "structure inspected");

        Ok(StructureReport {
            kind,
            supports_partial: strategy.supports_partial_transfer(),
            items,
            total_bytes,
        })
    }
}
