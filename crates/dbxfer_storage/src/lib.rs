mod catalog;
mod repository;
mod transfers;

pub use catalog::{NewDatabase, NewEnvironment, NewServer};
pub use repository::{DbxferStorage, StorageConfig};
pub use transfers::{InsertOutcome, NewTransfer};
