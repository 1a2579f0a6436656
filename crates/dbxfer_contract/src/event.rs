use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::DatabaseKind;
use crate::record::{TransferRecord, TransferStatus};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransferEventKind {
    #[serde(rename = "transfer.status.changed")]
    StatusChanged,
    #[serde(rename = "transfer.completed")]
    Completed,
    #[serde(rename = "transfer.failed")]
    Failed,
}

impl TransferEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferEventKind::StatusChanged => "transfer.status.changed",
            TransferEventKind::Completed => "transfer.completed",
            TransferEventKind::Failed => "transfer.failed",
        }
    }
}

/// Notification carrying the full record snapshot at the time it was emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferEvent {
    pub event: TransferEventKind,
    pub emitted_at: DateTime<Utc>,
    pub record: TransferRecord,
}

impl TransferEvent {
    pub fn status_changed(record: TransferRecord) -> Self {
        Self {
            event: TransferEventKind::StatusChanged,
            emitted_at: Utc::now(),
            record,
        }
    }

    pub fn finished(record: TransferRecord) -> Self {
        let event = if record.status == TransferStatus::Completed {
            TransferEventKind::Completed
        } else {
            TransferEventKind::Failed
        };
        Self {
            event,
            emitted_at: Utc::now(),
            record,
        }
    }
}

/// One transferable unit: a table, a collection, or a key-pattern group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StructureItem {
    pub name: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StructureReport {
    pub kind: DatabaseKind,
    pub supports_partial: bool,
    pub items: Vec<StructureItem>,
    pub total_bytes: u64,
}
