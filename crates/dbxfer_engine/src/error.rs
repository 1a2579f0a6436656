use dbxfer_remote::ExecError;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("{what} name is empty")]
    Empty { what: &'static str },
    #[error("{what} name {name:?} is longer than {max} characters")]
    TooLong {
        what: &'static str,
        name: String,
        max: usize,
    },
    #[error("{what} name {name:?} contains forbidden character {found:?}")]
    Forbidden {
        what: &'static str,
        name: String,
        found: char,
    },
    #[error("{what} name {name:?} must be `name` or `schema.name`")]
    Malformed { what: &'static str, name: String },
    #[error("{what} name {name:?} must not be qualified")]
    Qualified { what: &'static str, name: String },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no transfer strategy registered for {0}")]
    UnsupportedEngine(String),
    #[error(transparent)]
    Identifier(#[from] IdentifierError),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error("{}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("dump failed: {0}")]
    Dump(String),
    #[error("restore failed: {0}")]
    Restore(String),
    #[error("target provisioning failed: {0}")]
    Provision(String),
    #[error("catalog lookup failed: {0}")]
    Catalog(String),
    #[error("malformed dump: {0}")]
    Format(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    /// Stable label stored as `TransferFailure::kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::UnsupportedEngine(_) => "unsupported_engine",
            EngineError::Identifier(_) => "invalid_identifier",
            EngineError::Exec(ExecError::Timeout { .. }) => "timeout",
            EngineError::Exec(ExecError::Relocation { .. }) => "relocation",
            EngineError::Exec(_) => "remote_command",
            EngineError::Validation(_) => "validation",
            EngineError::Dump(_) => "dump",
            EngineError::Restore(_) => "restore",
            EngineError::Provision(_) => "provisioning",
            EngineError::Catalog(_) => "catalog",
            EngineError::Format(_) => "format",
            EngineError::Storage(_) => "storage",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_joined() {
        let error = EngineError::Validation(vec![
            "source database is not running".to_string(),
            "target database is not running".to_string(),
        ]);
        assert_eq!(
            error.to_string(),
            "source database is not running; target database is not running"
        );
        assert_eq!(error.kind(), "validation");
    }

    #[test]
    fn remote_timeouts_have_their_own_kind() {
        let error = EngineError::from(ExecError::Timeout {
            server: "alpha".to_string(),
            seconds: 3600,
        });
        assert_eq!(error.kind(), "timeout");
    }
}
