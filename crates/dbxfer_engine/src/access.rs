use dbxfer_contract::{DatabaseInstance, Environment, Initiator};

/// Authorization decisions the admission path delegates to the surrounding platform.
pub trait AccessPolicy: Send + Sync {
    /// `environment` is the one the database belongs to, when it could be resolved.
    fn can_read_database(
        &self,
        initiator: &Initiator,
        database: &DatabaseInstance,
        environment: Option<&Environment>,
    ) -> bool;

    fn can_use_environment(&self, initiator: &Initiator, environment: &Environment) -> bool;

    /// Team that will own the transfer record.
    fn resolve_owner_team(&self, initiator: &Initiator) -> Option<i64>;
}

/// Grants access to anything inside an environment owned by one of the initiator's teams.
#[derive(Debug, Clone, Copy, Default)]
pub struct TeamScopedPolicy;

impl AccessPolicy for TeamScopedPolicy {
    fn can_read_database(
        &self,
        initiator: &Initiator,
        _database: &DatabaseInstance,
        environment: Option<&Environment>,
    ) -> bool {
        environment.is_some_and(|environment| self.can_use_environment(initiator, environment))
    }

    fn can_use_environment(&self, initiator: &Initiator, environment: &Environment) -> bool {
        initiator.team_ids.contains(&environment.team_id)
    }

    fn resolve_owner_team(&self, initiator: &Initiator) -> Option<i64> {
        initiator
            .current_team
            .filter(|team| initiator.team_ids.contains(team))
    }
}
