use std::time::Duration;

use async_trait::async_trait;
use dbxfer_contract::Server;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to start remote session to {server}: {reason}")]
    Spawn { server: String, reason: String },
    #[error("command on {server} timed out after {seconds}s")]
    Timeout { server: String, seconds: u64 },
    #[error("command on {server} exited with status {status:?}: {stderr}")]
    CommandFailed {
        server: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("copy from {source_server} to {target_server} failed: {reason}")]
    Relocation {
        source_server: String,
        target_server: String,
        reason: String,
    },
}

/// Shell access to the servers that host database containers.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Runs `commands` as one script on `server` and returns its trimmed stdout.
    ///
    /// With `raise_on_error` the script stops at the first failing command and a
    /// non-zero exit becomes [`ExecError::CommandFailed`]; without it the output is
    /// returned whatever the exit status.
    async fn run(
        &self,
        commands: &[String],
        server: &Server,
        raise_on_error: bool,
        timeout: Option<Duration>,
    ) -> Result<String, ExecError>;

    /// Copies one file from `source` to the same path on `target`. Single attempt.
    async fn relocate(
        &self,
        source: &Server,
        target: &Server,
        path: &str,
        timeout: Option<Duration>,
    ) -> Result<(), ExecError>;
}
