pub mod catalog;
pub mod event;
pub mod record;

pub use catalog::{
    DatabaseCredentials, DatabaseInstance, DatabaseKind, DatabaseStatus, EngineFamily,
    Environment, Initiator, Server, UnknownDatabaseKind,
};
pub use event::{StructureItem, StructureReport, TransferEvent, TransferEventKind};
pub use record::{
    LogLevel, LogLine, SourceRef, TransferFailure, TransferMode, TransferOptions, TransferRecord,
    TransferStatus, UnknownValue, ACTIVE_STATUSES,
};
