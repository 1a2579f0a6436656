use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use dbxfer_contract::Server;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::executor::{ExecError, RemoteExecutor};
use crate::shell::quote;

#[derive(Debug, Clone)]
pub struct SshConfig {
    pub connect_timeout_secs: u64,
    /// Reuse one master connection per host. Off for transfers: concurrent dump and
    /// restore sessions on one multiplexed channel stall each other.
    pub multiplexing: bool,
    pub control_path_dir: PathBuf,
    pub strict_host_key_checking: String,
    pub default_timeout: Duration,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            multiplexing: false,
            control_path_dir: PathBuf::from("/tmp/dbxfer-ssh"),
            strict_host_key_checking: "accept-new".to_string(),
            default_timeout: Duration::from_secs(300),
        }
    }
}

/// Runs scripts through the system OpenSSH client, one child process per call.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    config: SshConfig,
}

impl SshExecutor {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    pub fn without_multiplexing(mut self) -> Self {
        self.config.multiplexing = false;
        self
    }

    fn session(&self, server: &Server) -> Command {
        let mut command = Command::new("ssh");
        command
            .arg("-p")
            .arg(server.port.to_string())
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.config.connect_timeout_secs))
            .arg("-o")
            .arg(format!(
                "StrictHostKeyChecking={}",
                self.config.strict_host_key_checking
            ))
            .arg("-o")
            .arg("ServerAliveInterval=20");

        if let Some(key) = &server.private_key_path {
            command.arg("-i").arg(key);
        }

        if self.config.multiplexing {
            command
                .arg("-o")
                .arg("ControlMaster=auto")
                .arg("-o")
                .arg(format!(
                    "ControlPath={}/%C",
                    self.config.control_path_dir.display()
                ))
                .arg("-o")
                .arg("ControlPersist=60s");
        } else {
            command
                .arg("-o")
                .arg("ControlMaster=no")
                .arg("-o")
                .arg("ControlPath=none");
        }

        command.arg(server.destination()).kill_on_drop(true);
        command
    }
}

fn render_script(commands: &[String], raise_on_error: bool) -> String {
    let mut script = String::new();
    if raise_on_error {
        script.push_str("set -eo pipefail\n");
    }
    for command in commands {
        script.push_str(command);
        script.push('\n');
    }
    script
}

/// Feeds `input` to the child's stdin while draining its output, so neither pipe can fill up
/// and stall the other. A child that exits without reading everything is not an error.
async fn converse(mut child: Child, input: &[u8]) -> std::io::Result<Output> {
    let stdin = child.stdin.take();
    let feed = async move {
        if let Some(mut stdin) = stdin {
            stdin.write_all(input).await?;
            stdin.shutdown().await?;
        }
        Ok::<_, std::io::Error>(())
    };
    let (fed, output) = tokio::join!(feed, child.wait_with_output());
    let output = output?;
    if let Err(err) = fed {
        if output.status.success() {
            return Err(err);
        }
    }
    Ok(output)
}

fn parent_dir(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) => "/",
        Some((dir, _)) => dir,
        None => ".",
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run(
        &self,
        commands: &[String],
        server: &Server,
        raise_on_error: bool,
        timeout: Option<Duration>,
    ) -> Result<String, ExecError> {
        let script = render_script(commands, raise_on_error);
        let limit = timeout.unwrap_or(self.config.default_timeout);

        let child = self
            .session(server)
            .arg("bash -s")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| ExecError::Spawn {
                server: server.name.clone(),
                reason: err.to_string(),
            })?;

        debug!(server = %server.name, commands = commands.len(), "remote script dispatched");

        let output = match tokio::time::timeout(limit, converse(child, script.as_bytes())).await {
            Ok(result) => result.map_err(|err| ExecError::Spawn {
                server: server.name.clone(),
                reason: err.to_string(),
            })?,
            Err(_) => {
                return Err(ExecError::Timeout {
                    server: server.name.clone(),
                    seconds: limit.as_secs(),
                })
            }
        };

        if raise_on_error && !output.status.success() {
            return Err(ExecError::CommandFailed {
                server: server.name.clone(),
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn relocate(
        &self,
        source: &Server,
        target: &Server,
        path: &str,
        timeout: Option<Duration>,
    ) -> Result<(), ExecError> {
        let limit = timeout.unwrap_or(self.config.default_timeout);
        let relocation_error = |reason: String| ExecError::Relocation {
            source_server: source.name.clone(),
            target_server: target.name.clone(),
            reason,
        };

        let mut reader = self
            .session(source)
            .arg(format!("cat {}", quote(path)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| relocation_error(err.to_string()))?;
        let mut writer = self
            .session(target)
            .arg(format!(
                "mkdir -p {} && cat > {}",
                quote(parent_dir(path)),
                quote(path)
            ))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| relocation_error(err.to_string()))?;

        let copy = async move {
            let mut upstream = reader
                .stdout
                .take()
                .ok_or_else(|| std::io::Error::other("source stdout unavailable"))?;
            let mut downstream = writer
                .stdin
                .take()
                .ok_or_else(|| std::io::Error::other("target stdin unavailable"))?;
            let bytes = tokio::io::copy(&mut upstream, &mut downstream).await?;
            downstream.shutdown().await?;
            drop(downstream);
            let read_side = reader.wait_with_output().await?;
            let write_side = writer.wait_with_output().await?;
            Ok::<_, std::io::Error>((bytes, read_side, write_side))
        };

        let (bytes, read_side, write_side) = match tokio::time::timeout(limit, copy).await {
            Ok(result) => result.map_err(|err| relocation_error(err.to_string()))?,
            Err(_) => {
                return Err(relocation_error(format!(
                    "timed out after {}s",
                    limit.as_secs()
                )))
            }
        };

        if !read_side.status.success() {
            return Err(relocation_error(format!(
                "read failed: {}",
                String::from_utf8_lossy(&read_side.stderr).trim()
            )));
        }
        if !write_side.status.success() {
            return Err(relocation_error(format!(
                "write failed: {}",
                String::from_utf8_lossy(&write_side.stderr).trim()
            )));
        }

        info!(
            source = %source.name,
            target = %target.name,
            bytes,
            "dump relocated"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(program: &str, args: &[&str]) -> Child {
        Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .expect("spawn")
    }

    #[tokio::test]
    async fn large_scripts_and_large_output_do_not_deadlock() {
        let input = vec![b'x'; 4 * 1024 * 1024];
        let output = tokio::time::timeout(
            Duration::from_secs(30),
            converse(local("cat", &[]), &input),
        )
        .await
        .expect("no deadlock")
        .expect("output");

        assert!(output.status.success());
        assert_eq!(output.stdout.len(), input.len());
    }

    #[tokio::test]
    async fn early_exit_reports_the_status_instead_of_a_pipe_error() {
        let input = vec![b'x'; 4 * 1024 * 1024];
        let output = converse(local("sh", &["-c", "echo boom >&2; exit 3"]), &input)
            .await
            .expect("output");

        assert_eq!(output.status.code(), Some(3));
        assert_eq!(String::from_utf8_lossy(&output.stderr).trim(), "boom");
    }

    #[test]
    fn raising_scripts_stop_on_first_failure() {
        let script = render_script(&["echo one".to_string(), "false".to_string()], true);
        assert!(script.starts_with("set -eo pipefail\n"));
        assert!(script.ends_with("false\n"));

        let lenient = render_script(&["echo one".to_string()], false);
        assert_eq!(lenient, "echo one\n");
    }

    #[test]
    fn parent_dir_of_artifact_paths() {
        assert_eq!(parent_dir("/tmp/dbxfer/abc/file.dump"), "/tmp/dbxfer/abc");
        assert_eq!(parent_dir("/file"), "/");
        assert_eq!(parent_dir("file"), ".");
    }
}
