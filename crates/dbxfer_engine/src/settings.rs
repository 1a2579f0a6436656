use std::time::Duration;

/// Tunables shared by the strategies, the provisioner and the orchestrator.
#[derive(Debug, Clone)]
pub struct TransferSettings {
    /// Root of the per-transfer scratch directories on every server.
    pub scratch_dir: String,
    pub command_timeout: Duration,
    pub dump_timeout: Duration,
    pub relocate_timeout: Duration,
    pub restore_timeout: Duration,
    pub snapshot_poll_attempts: u32,
    pub snapshot_poll_interval: Duration,
    pub readiness_poll_attempts: u32,
    pub readiness_poll_interval: Duration,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            scratch_dir: "/tmp/dbxfer".to_string(),
            command_timeout: Duration::from_secs(300),
            dump_timeout: Duration::from_secs(3600),
            relocate_timeout: Duration::from_secs(3600),
            restore_timeout: Duration::from_secs(3600),
            snapshot_poll_attempts: 60,
            snapshot_poll_interval: Duration::from_millis(1000),
            readiness_poll_attempts: 30,
            readiness_poll_interval: Duration::from_millis(2000),
        }
    }
}

impl TransferSettings {
    /// Settings with no waiting between polls, for tests and dry runs.
    pub fn without_delays() -> Self {
        Self {
            snapshot_poll_interval: Duration::ZERO,
            readiness_poll_interval: Duration::ZERO,
            ..Self::default()
        }
    }
}
