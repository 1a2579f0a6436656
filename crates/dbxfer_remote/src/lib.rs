pub mod executor;
pub mod recording;
pub mod shell;
pub mod ssh;

pub use executor::{ExecError, RemoteExecutor};
pub use recording::{ExecCall, RecordingExecutor};
pub use shell::{quote, quote_env};
pub use ssh::{SshConfig, SshExecutor};
