use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::catalog::{DatabaseKind, EngineFamily};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown {field}: {value}")]
pub struct UnknownValue {
    pub field: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransferMode {
    Clone,
    DataOnly,
    Partial,
}

impl TransferMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferMode::Clone => "clone",
            TransferMode::DataOnly => "data_only",
            TransferMode::Partial => "partial",
        }
    }

}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferMode {
    type Err = UnknownValue;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "clone" => Ok(TransferMode::Clone),
            "data_only" => Ok(TransferMode::DataOnly),
            "partial" => Ok(TransferMode::Partial),
            other => Err(UnknownValue {
                field: "transfer mode",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Validating,
    Transferring,
    Restoring,
    Completed,
    Failed,
}

/// Statuses that hold the single-flight slot of a source database.
pub const ACTIVE_STATUSES: [TransferStatus; 4] = [
    TransferStatus::Pending,
    TransferStatus::Validating,
    TransferStatus::Transferring,
    TransferStatus::Restoring,
];

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Validating => "validating",
            TransferStatus::Transferring => "transferring",
            TransferStatus::Restoring => "restoring",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            TransferStatus::Pending => 0,
            TransferStatus::Validating => 1,
            TransferStatus::Transferring => 2,
            TransferStatus::Restoring => 3,
            TransferStatus::Completed => 4,
            TransferStatus::Failed => 5,
        }
    }

    /// Statuses a record may be in right before it moves to `self`.
    pub fn predecessors(&self) -> Vec<TransferStatus> {
        ACTIVE_STATUSES
            .into_iter()
            .filter(|status| status.can_transition_to(*self))
            .collect()
    }

    /// The pipeline only moves forward; `failed` is reachable from any non-terminal state.
    pub fn can_transition_to(&self, next: TransferStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            TransferStatus::Failed => true,
            TransferStatus::Completed => *self == TransferStatus::Restoring,
            other => other.rank() >= self.rank(),
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferStatus {
    type Err = UnknownValue;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(TransferStatus::Pending),
            "validating" => Ok(TransferStatus::Validating),
            "transferring" => Ok(TransferStatus::Transferring),
            "restoring" => Ok(TransferStatus::Restoring),
            "completed" => Ok(TransferStatus::Completed),
            "failed" => Ok(TransferStatus::Failed),
            other => Err(UnknownValue {
                field: "transfer status",
                value: other.to_string(),
            }),
        }
    }
}

/// Allow-list for a partial transfer. Which variant applies depends on the engine family.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransferOptions {
    Tables(Vec<String>),
    Collections(Vec<String>),
    KeyPatterns(Vec<String>),
}

impl TransferOptions {
    pub fn units(&self) -> &[String] {
        match self {
            TransferOptions::Tables(items)
            | TransferOptions::Collections(items)
            | TransferOptions::KeyPatterns(items) => items,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.units().iter().all(|unit| unit.trim().is_empty())
    }

    pub fn label(&self) -> &'static str {
        match self {
            TransferOptions::Tables(_) => "tables",
            TransferOptions::Collections(_) => "collections",
            TransferOptions::KeyPatterns(_) => "key_patterns",
        }
    }

    pub fn applies_to(&self, kind: DatabaseKind) -> bool {
        matches!(
            (self, kind.family()),
            (TransferOptions::Tables(_), EngineFamily::Relational)
                | (TransferOptions::Tables(_), EngineFamily::Columnar)
                | (TransferOptions::Collections(_), EngineFamily::Document)
                | (TransferOptions::KeyPatterns(_), EngineFamily::KeyValue)
        )
    }
}

/// Polymorphic reference to the database being read.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SourceRef {
    pub kind: DatabaseKind,
    pub id: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "warn" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferFailure {
    pub message: String,
    pub kind: String,
    pub step: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
}

impl TransferFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: kind.into(),
            step: None,
            context: BTreeMap::new(),
        }
    }

    pub fn at_step(mut self, step: Option<&str>) -> Self {
        self.step = step.map(str::to_owned);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferRecord {
    pub id: Uuid,
    pub source: SourceRef,
    pub source_database_uuid: String,
    pub target_environment_id: i64,
    pub target_server_id: i64,
    pub mode: TransferMode,
    pub transfer_options: Option<TransferOptions>,
    pub existing_target_uuid: Option<String>,
    /// Database the data lands in; known at admission for `data_only`, after provisioning otherwise.
    pub target_database_uuid: Option<String>,
    pub status: TransferStatus,
    pub progress: u8,
    pub current_step: Option<String>,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub error: Option<TransferFailure>,
    pub log: Vec<LogLine>,
    pub initiated_by: i64,
    pub team_id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}
