use std::collections::BTreeMap;
use std::sync::Arc;

use dbxfer_contract::DatabaseKind;
use tracing::debug;

use crate::strategy::{
    ClickhouseStrategy, EngineContext, KeyValueStrategy, MongoStrategy, MysqlStrategy,
    PostgresStrategy, TransferStrategy,
};

/// Database kind label to strategy. Adding an engine means registering one more strategy here.
#[derive(Default, Clone)]
pub struct StrategyRegistry {
    strategies: BTreeMap<String, Arc<dyn TransferStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every built-in engine against one shared context.
    pub fn with_default_engines(context: EngineContext) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(PostgresStrategy::new(context.clone())));
        for kind in [DatabaseKind::Mysql, DatabaseKind::Mariadb] {
            registry.register(Arc::new(MysqlStrategy::new(context.clone(), kind)));
        }
        registry.register(Arc::new(MongoStrategy::new(context.clone())));
        for kind in [DatabaseKind::Redis, DatabaseKind::Keydb, DatabaseKind::Dragonfly] {
            registry.register(Arc::new(KeyValueStrategy::new(context.clone(), kind)));
        }
        registry.register(Arc::new(ClickhouseStrategy::new(context)));
        registry
    }

    /// Later registrations for the same kind replace earlier ones.
    pub fn register(&mut self, strategy: Arc<dyn TransferStrategy>) {
        let kind = strategy.database_kind().to_string();
        debug!(kind = %kind, "registering transfer strategy");
        self.strategies.insert(kind, strategy);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn TransferStrategy>> {
        self.strategies.get(kind).cloned()
    }

    pub fn for_kind(&self, kind: DatabaseKind) -> Option<Arc<dyn TransferStrategy>> {
        self.get(kind.as_str())
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.strategies.keys().map(String::as_str).collect()
    }
}
