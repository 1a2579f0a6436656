use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use dbxfer_contract::Server;
use tracing::info;

use crate::executor::{ExecError, RemoteExecutor};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecCall {
    pub server: String,
    pub script: String,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
struct Rule {
    server: Option<String>,
    needle: String,
    replies: VecDeque<Result<String, String>>,
}

impl Rule {
    fn matches(&self, server: &str, script: &str) -> bool {
        self.server.as_deref().map_or(true, |name| name == server) && script.contains(&self.needle)
    }

    /// The last reply repeats once the queue is down to one.
    fn next_reply(&mut self) -> Result<String, String> {
        if self.replies.len() > 1 {
            self.replies.pop_front().unwrap_or_else(|| Ok(String::new()))
        } else {
            self.replies.front().cloned().unwrap_or_else(|| Ok(String::new()))
        }
    }
}

#[derive(Debug, Default)]
struct Journal {
    calls: Vec<ExecCall>,
    rules: Vec<Rule>,
    relocation_failure: Option<String>,
}

/// In-memory executor that records every script and answers from scripted replies.
///
/// A call is answered by the most recently added rule whose needle occurs in the
/// script (and whose server matches, when the rule names one). Unmatched calls
/// succeed with empty output.
#[derive(Debug, Clone, Default)]
pub struct RecordingExecutor {
    journal: Arc<Mutex<Journal>>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn journal(&self) -> MutexGuard<'_, Journal> {
        self.journal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push_rule(&self, server: Option<&str>, needle: &str, replies: Vec<Result<String, String>>) {
        self.journal().rules.push(Rule {
            server: server.map(str::to_owned),
            needle: needle.to_string(),
            replies: replies.into(),
        });
    }

    pub fn respond(&self, needle: &str, output: &str) -> &Self {
        self.push_rule(None, needle, vec![Ok(output.to_string())]);
        self
    }

    pub fn respond_on(&self, server: &str, needle: &str, output: &str) -> &Self {
        self.push_rule(Some(server), needle, vec![Ok(output.to_string())]);
        self
    }

    pub fn respond_sequence(&self, needle: &str, outputs: &[&str]) -> &Self {
        let replies = outputs.iter().map(|output| Ok(output.to_string())).collect();
        self.push_rule(None, needle, replies);
        self
    }

    pub fn fail(&self, needle: &str, stderr: &str) -> &Self {
        self.push_rule(None, needle, vec![Err(stderr.to_string())]);
        self
    }

    pub fn fail_on(&self, server: &str, needle: &str, stderr: &str) -> &Self {
        self.push_rule(Some(server), needle, vec![Err(stderr.to_string())]);
        self
    }

    pub fn fail_relocation(&self, reason: &str) -> &Self {
        self.journal().relocation_failure = Some(reason.to_string());
        self
    }

    pub fn calls(&self) -> Vec<ExecCall> {
        self.journal().calls.clone()
    }

    pub fn calls_on(&self, server: &str) -> Vec<ExecCall> {
        self.calls()
            .into_iter()
            .filter(|call| call.server == server)
            .collect()
    }

    pub fn scripts_containing(&self, needle: &str) -> Vec<ExecCall> {
        self.calls()
            .into_iter()
            .filter(|call| call.script.contains(needle))
            .collect()
    }
}

#[async_trait]
impl RemoteExecutor for RecordingExecutor {
    async fn run(
        &self,
        commands: &[String],
        server: &Server,
        raise_on_error: bool,
        timeout: Option<Duration>,
    ) -> Result<String, ExecError> {
        let script = commands.join("\n");
        let reply = {
            let mut journal = self.journal();
            journal.calls.push(ExecCall {
                server: server.name.clone(),
                script: script.clone(),
                timeout,
            });
            journal
                .rules
                .iter_mut()
                .rev()
                .find(|rule| rule.matches(&server.name, &script))
                .map(Rule::next_reply)
        };

        match reply {
            Some(Ok(output)) | Some(Err(output)) if !raise_on_error => Ok(output),
            Some(Ok(output)) => Ok(output),
            Some(Err(stderr)) => Err(ExecError::CommandFailed {
                server: server.name.clone(),
                status: Some(1),
                stderr,
            }),
            None => Ok(String::new()),
        }
    }

    async fn relocate(
        &self,
        source: &Server,
        target: &Server,
        path: &str,
        timeout: Option<Duration>,
    ) -> Result<(), ExecError> {
        let failure = {
            let mut journal = self.journal();
            journal.calls.push(ExecCall {
                server: source.name.clone(),
                script: format!("relocate {path} -> {}", target.name),
                timeout,
            });
            journal.relocation_failure.clone()
        };

        match failure {
            Some(reason) => Err(ExecError::Relocation {
                source_server: source.name.clone(),
                target_server: target.name.clone(),
                reason,
            }),
            None => {
                info!(source = %source.name, target = %target.name, path, "recorded relocation");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(name: &str) -> Server {
        Server {
            id: 1,
            uuid: format!("{name}-uuid"),
            name: name.to_string(),
            ip: "10.0.0.1".to_string(),
            port: 22,
            user: "root".to_string(),
            private_key_path: None,
            reachable: true,
            usable: true,
        }
    }

    #[tokio::test]
    async fn sequences_repeat_their_last_reply() {
        let executor = RecordingExecutor::new();
        executor.respond_sequence("LASTSAVE", &["100", "100", "140"]);
        let a = server("a");

        let mut seen = Vec::new();
        for _ in 0..4 {
            let out = executor
                .run(&["redis-cli LASTSAVE".to_string()], &a, true, None)
                .await
                .expect("run");
            seen.push(out);
        }
        assert_eq!(seen, vec!["100", "100", "140", "140"]);
    }

    #[tokio::test]
    async fn failures_only_raise_when_requested() {
        let executor = RecordingExecutor::new();
        executor.fail_on("a", "pg_isready", "no response");
        let a = server("a");
        let b = server("b");

        let strict = executor
            .run(&["pg_isready".to_string()], &a, true, None)
            .await;
        assert!(matches!(strict, Err(ExecError::CommandFailed { .. })));

        let lenient = executor
            .run(&["pg_isready".to_string()], &a, false, None)
            .await
            .expect("lenient");
        assert_eq!(lenient, "no response");

        let other_server = executor
            .run(&["pg_isready".to_string()], &b, true, None)
            .await;
        assert!(other_server.is_ok());
        assert_eq!(executor.calls_on("a").len(), 2);
    }
}
