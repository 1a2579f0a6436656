pub mod access;
pub mod admission;
pub mod artifact;
pub mod error;
pub mod identifier;
pub mod inspector;
pub mod notifier;
pub mod orchestrator;
pub mod provision;
pub mod registry;
pub mod settings;
pub mod strategy;

pub use access::{AccessPolicy, TeamScopedPolicy};
pub use admission::{Rejection, TransferAdmissionController, TransferDispatcher, TransferRequest};
pub use artifact::ArtifactPath;
pub use error::{EngineError, IdentifierError};
pub use inspector::{InspectionFailure, StructureInspector};
pub use notifier::{BroadcastNotifier, TransferNotifier};
pub use orchestrator::TransferOrchestrator;
pub use provision::{DockerProvisioner, TargetProvisioner};
pub use registry::StrategyRegistry;
pub use settings::TransferSettings;
pub use strategy::{
    DatabaseHandle, DumpOutcome, EngineContext, RestoreOutcome, TransferStrategy,
    ValidationReport,
};

#[cfg(test)]
pub(crate) mod testing {
    use chrono::Utc;
    use dbxfer_contract::{
        DatabaseCredentials, DatabaseInstance, DatabaseKind, DatabaseStatus, Server, SourceRef,
        TransferMode, TransferRecord, TransferStatus,
    };
    use uuid::Uuid;

    use crate::artifact::ArtifactPath;
    use crate::strategy::DatabaseHandle;

    pub fn record() -> TransferRecord {
        let now = Utc::now();
        TransferRecord {
            id: Uuid::now_v7(),
            source: SourceRef {
                kind: DatabaseKind::Postgresql,
                id: 1,
            },
            source_database_uuid: "source-db".to_string(),
            target_environment_id: 1,
            target_server_id: 2,
            mode: TransferMode::Clone,
            transfer_options: None,
            existing_target_uuid: None,
            target_database_uuid: None,
            status: TransferStatus::Pending,
            progress: 0,
            current_step: None,
            total_bytes: 0,
            transferred_bytes: 0,
            error: None,
            log: Vec::new(),
            initiated_by: 7,
            team_id: 1,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn server(name: &str) -> Server {
        Server {
            id: if name == "alpha" { 1 } else { 2 },
            uuid: format!("{name}-uuid"),
            name: name.to_string(),
            ip: "10.0.0.10".to_string(),
            port: 22,
            user: "root".to_string(),
            private_key_path: None,
            reachable: true,
            usable: true,
        }
    }

    pub fn handle(kind: DatabaseKind, server_name: &str) -> DatabaseHandle {
        let server = server(server_name);
        let instance = DatabaseInstance {
            id: 1,
            uuid: format!("{kind}-uuid"),
            kind,
            name: format!("{kind} source"),
            environment_id: 1,
            server_id: server.id,
            container: format!("{kind}-src"),
            image: format!("{kind}:latest"),
            credentials: DatabaseCredentials {
                user: "app".to_string(),
                password: "secret".to_string(),
                database: "shop".to_string(),
            },
            status: Some(DatabaseStatus::Running),
        };
        DatabaseHandle::new(instance, server)
    }

    pub fn artifact(extension: &str) -> ArtifactPath {
        ArtifactPath::for_record("/tmp/dbxfer", &record(), extension)
    }
}
