use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseKind {
    Postgresql,
    Mysql,
    Mariadb,
    Mongodb,
    Redis,
    Keydb,
    Dragonfly,
    Clickhouse,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EngineFamily {
    Relational,
    Document,
    KeyValue,
    Columnar,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown database kind: {0}")]
pub struct UnknownDatabaseKind(pub String);

impl DatabaseKind {
    pub const ALL: [DatabaseKind; 8] = [
        DatabaseKind::Postgresql,
        DatabaseKind::Mysql,
        DatabaseKind::Mariadb,
        DatabaseKind::Mongodb,
        DatabaseKind::Redis,
        DatabaseKind::Keydb,
        DatabaseKind::Dragonfly,
        DatabaseKind::Clickhouse,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseKind::Postgresql => "postgresql",
            DatabaseKind::Mysql => "mysql",
            DatabaseKind::Mariadb => "mariadb",
            DatabaseKind::Mongodb => "mongodb",
            DatabaseKind::Redis => "redis",
            DatabaseKind::Keydb => "keydb",
            DatabaseKind::Dragonfly => "dragonfly",
            DatabaseKind::Clickhouse => "clickhouse",
        }
    }

    pub fn family(&self) -> EngineFamily {
        match self {
            DatabaseKind::Postgresql | DatabaseKind::Mysql | DatabaseKind::Mariadb => {
                EngineFamily::Relational
            }
            DatabaseKind::Mongodb => EngineFamily::Document,
            DatabaseKind::Redis | DatabaseKind::Keydb | DatabaseKind::Dragonfly => {
                EngineFamily::KeyValue
            }
            DatabaseKind::Clickhouse => EngineFamily::Columnar,
        }
    }
}

impl fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatabaseKind {
    type Err = UnknownDatabaseKind;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        DatabaseKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| UnknownDatabaseKind(value.to_string()))
    }
}

/// A host reachable over SSH that runs database containers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Server {
    pub id: i64,
    pub uuid: String,
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub user: String,
    pub private_key_path: Option<String>,
    pub reachable: bool,
    pub usable: bool,
}

impl Server {
    pub fn is_available(&self) -> bool {
        self.reachable && self.usable
    }

    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.ip)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Environment {
    pub id: i64,
    pub uuid: String,
    pub name: String,
    pub team_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseCredentials {
    pub user: String,
    pub password: String,
    pub database: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseStatus {
    Running,
    Starting,
    Stopped,
    Exited,
}

impl DatabaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseStatus::Running => "running",
            DatabaseStatus::Starting => "starting",
            DatabaseStatus::Stopped => "stopped",
            DatabaseStatus::Exited => "exited",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(DatabaseStatus::Running),
            "starting" => Some(DatabaseStatus::Starting),
            "stopped" => Some(DatabaseStatus::Stopped),
            "exited" => Some(DatabaseStatus::Exited),
            _ => None,
        }
    }
}

/// One database deployment: an engine container on a server, inside an environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseInstance {
    pub id: i64,
    pub uuid: String,
    pub kind: DatabaseKind,
    pub name: String,
    pub environment_id: i64,
    pub server_id: i64,
    pub container: String,
    pub image: String,
    pub credentials: DatabaseCredentials,
    /// `None` when the platform does not track a run state for this engine.
    pub status: Option<DatabaseStatus>,
}

/// Identity of whoever asked for a transfer, as resolved by the upstream auth layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Initiator {
    pub user_id: i64,
    pub current_team: Option<i64>,
    pub team_ids: Vec<i64>,
}
