//! Task execution pipeline
//!
//! Launches the agent subprocess with a sandboxed environment and streams
//! its output. Transient backend errors are retried here at a fixed short
//! delay without consuming attempts; real failures propagate to the
//! scheduler's backoff policy. Cancellation is polled between stream
//! events.

pub mod retry;
pub mod stream;

use crate::config::{ExecutorConfig, SecurityMode};
use crate::error::{IstotaError, Result};
use crate::store::{Store, Task};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use stream::{parse_line, ProgressEvent, StreamEvent, StreamOutcome};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Grace period between SIGTERM and SIGKILL.
const TERMINATE_GRACE_SECS: u64 = 5;

/// Results beginning with this ask the user before proceeding.
const CONFIRM_PREFIX: &str = "CONFIRM:";

/// Environment variable names that look like credentials are stripped in
/// permissive mode.
const CREDENTIAL_MARKERS: &[&str] = &["TOKEN", "SECRET", "PASSWORD", "KEY", "CREDENTIAL"];

pub type ProgressFn = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// How a task run ended, short of an error.
#[derive(Debug, Clone)]
pub enum ExecOutcome {
    Completed { result: String, actions: Vec<Value> },
    ConfirmationNeeded { prompt: String },
    Cancelled,
}

pub struct AgentExecutor {
    config: ExecutorConfig,
    scratch_root: PathBuf,
    db_path: PathBuf,
    store: Arc<Store>,
}

impl AgentExecutor {
    pub fn new(
        config: ExecutorConfig,
        scratch_root: PathBuf,
        db_path: PathBuf,
        store: Arc<Store>,
    ) -> Self {
        Self { config, scratch_root, db_path, store }
    }

    /// Deferred-effect files land here; always writable even when the agent
    /// itself is sandboxed away from the database.
    pub fn deferred_dir(&self, user_id: &str) -> PathBuf {
        self.scratch_root.join("deferred").join(user_id)
    }

    fn task_dir(&self, task_id: i64) -> PathBuf {
        self.scratch_root.join(format!("task_{task_id}"))
    }

    fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.config.task_timeout_minutes * 60)
    }

    /// Run a task to an outcome. Raw `command` payloads execute directly;
    /// `prompt` payloads go through the agent subprocess with transient
    /// retry.
    pub async fn execute(
        &self,
        task: &Task,
        prompt: Option<&str>,
        progress: ProgressFn,
    ) -> Result<ExecOutcome> {
        if let Some(command) = &task.command {
            return self.execute_command(task, command).await;
        }
        let prompt = prompt.ok_or_else(|| IstotaError::InvalidTask {
            message: format!("task {} has neither prompt nor command", task.id),
        })?;

        let mut api_attempt = 0u32;
        loop {
            match self.run_agent_once(task, prompt, &progress).await {
                Err(err) if err.is_transient() && api_attempt < self.config.api_retry_attempts => {
                    api_attempt += 1;
                    warn!(
                        task_id = task.id,
                        api_attempt,
                        %err,
                        "transient backend error; retrying without consuming an attempt"
                    );
                    tokio::time::sleep(Duration::from_secs(self.config.api_retry_delay_secs)).await;
                }
                other => return other,
            }
        }
    }

    /// Raw shell command payloads skip the agent entirely.
    async fn execute_command(&self, task: &Task, command: &str) -> Result<ExecOutcome> {
        let parts = shell_words::split(command).map_err(|e| IstotaError::InvalidTask {
            message: format!("unparseable command: {e}"),
        })?;
        let Some((program, args)) = parts.split_first() else {
            return Err(IstotaError::InvalidTask { message: "empty command".into() });
        };

        let dir = self.task_dir(task.id);
        tokio::fs::create_dir_all(&dir).await?;

        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&dir).stdin(Stdio::null());
        cmd.kill_on_drop(true);

        let output = tokio::time::timeout(self.task_timeout(), cmd.output())
            .await
            .map_err(|_| IstotaError::TaskTimeout { minutes: self.config.task_timeout_minutes })??;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !output.status.success() {
            return Err(IstotaError::TaskFailed {
                message: format!("command exited {}: {}", output.status, stderr),
            });
        }
        Ok(ExecOutcome::Completed { result: stdout, actions: Vec::new() })
    }

    async fn run_agent_once(
        &self,
        task: &Task,
        prompt: &str,
        progress: &ProgressFn,
    ) -> Result<ExecOutcome> {
        let dir = self.task_dir(task.id);
        let deferred = self.deferred_dir(&task.user_id);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::create_dir_all(&deferred).await?;

        let mut cmd = self.build_command(task, prompt, &dir, &deferred);

        if self.config.streaming {
            self.run_streaming(task, cmd, &deferred, progress).await
        } else {
            let output = tokio::time::timeout(self.task_timeout(), cmd.output())
                .await
                .map_err(|_| IstotaError::TaskTimeout {
                    minutes: self.config.task_timeout_minutes,
                })??;

            let mut outcome = StreamOutcome::default();
            for line in String::from_utf8_lossy(&output.stdout).lines() {
                match parse_line(line) {
                    Some(event) => outcome.absorb(&event),
                    None => outcome.absorb_raw(line),
                }
            }
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            self.resolve(task, outcome, output.status.success(), &stderr, &deferred).await
        }
    }

    fn build_command(&self, task: &Task, prompt: &str, dir: &Path, deferred: &Path) -> Command {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args);

        match self.config.security_mode {
            SecurityMode::Restricted => {
                cmd.env_clear();
                // A sandboxed agent still needs the basics to run at all.
                for keep in ["PATH", "HOME", "LANG", "TMPDIR"] {
                    if let Ok(value) = std::env::var(keep) {
                        cmd.env(keep, value);
                    }
                }
                if !self.config.allowed_tools.is_empty() {
                    cmd.arg("--allowedTools").arg(self.config.allowed_tools.join(","));
                }
            }
            SecurityMode::Permissive => {
                for (name, _) in std::env::vars() {
                    let upper = name.to_uppercase();
                    if CREDENTIAL_MARKERS.iter().any(|marker| upper.contains(marker)) {
                        cmd.env_remove(&name);
                    }
                }
            }
        }

        cmd.env("ISTOTA_TASK_ID", task.id.to_string());
        cmd.env("ISTOTA_USER_ID", &task.user_id);
        cmd.env("ISTOTA_DB_PATH", &self.db_path);
        cmd.env("ISTOTA_DEFERRED_DIR", deferred);
        if let Some(token) = &task.conversation_token {
            cmd.env("ISTOTA_CONVERSATION_TOKEN", token);
        }

        cmd.arg(prompt);
        cmd.current_dir(dir);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }

    async fn run_streaming(
        &self,
        task: &Task,
        mut cmd: Command,
        deferred: &Path,
        progress: &ProgressFn,
    ) -> Result<ExecOutcome> {
        let mut child = cmd.spawn()?;
        if let Some(pid) = child.id() {
            let _ = self.store.set_worker_pid(task.id, pid);
        }

        let stdout = child.stdout.take().ok_or_else(|| IstotaError::Internal {
            message: "child stdout not captured".into(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| IstotaError::Internal {
            message: "child stderr not captured".into(),
        })?;

        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !buf.is_empty() {
                    buf.push('\n');
                }
                buf.push_str(&line);
            }
            buf
        });

        let mut outcome = StreamOutcome::default();
        let mut lines = BufReader::new(stdout).lines();
        let deadline = tokio::time::Instant::now() + self.task_timeout();

        loop {
            let next = tokio::time::timeout_at(deadline, lines.next_line()).await;
            let line = match next {
                Err(_) => {
                    warn!(task_id = task.id, "task timeout; terminating subprocess");
                    terminate_child(&mut child).await;
                    return Err(IstotaError::TaskTimeout {
                        minutes: self.config.task_timeout_minutes,
                    });
                }
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => break,
                Ok(Err(err)) => return Err(err.into()),
            };

            match parse_line(&line) {
                Some(event) => {
                    match &event {
                        StreamEvent::ToolUse { name, input } => {
                            progress(ProgressEvent::ToolUse {
                                name: name.clone(),
                                input: input.clone(),
                            });
                        }
                        StreamEvent::Text { text } => {
                            progress(ProgressEvent::Text { text: text.clone() });
                        }
                        StreamEvent::Result { .. } => {}
                    }
                    outcome.absorb(&event);
                }
                None => outcome.absorb_raw(&line),
            }

            // Safe point: cancellation is observed between stream events.
            if self.store.is_task_cancelled(task.id).unwrap_or(false) {
                info!(task_id = task.id, "cancel requested; terminating subprocess");
                terminate_child(&mut child).await;
                return Ok(ExecOutcome::Cancelled);
            }
        }

        let status = tokio::time::timeout_at(deadline, child.wait())
            .await
            .map_err(|_| IstotaError::TaskTimeout { minutes: self.config.task_timeout_minutes })??;
        let stderr_text = stderr_task.await.unwrap_or_default();

        self.resolve(task, outcome, status.success(), &stderr_text, deferred).await
    }

    /// Final result resolution, in priority order: a `result` event, then a
    /// result file from the sandbox, then stderr, then a generic error.
    async fn resolve(
        &self,
        task: &Task,
        outcome: StreamOutcome,
        exited_ok: bool,
        stderr: &str,
        deferred: &Path,
    ) -> Result<ExecOutcome> {
        let StreamOutcome { result, actions, raw_text } = outcome;

        if let Some((text, is_error)) = result {
            if is_error {
                return Err(self.failure_from(&text, stderr));
            }
            return Ok(self.completed(text, actions));
        }

        let result_file = deferred.join(format!("task_{}_result.txt", task.id));
        if let Ok(text) = tokio::fs::read_to_string(&result_file).await {
            let _ = tokio::fs::remove_file(&result_file).await;
            return Ok(self.completed(text.trim().to_string(), actions));
        }

        if exited_ok {
            if !raw_text.trim().is_empty() {
                return Ok(self.completed(raw_text.trim().to_string(), actions));
            }
            if !stderr.trim().is_empty() {
                return Ok(self.completed(stderr.trim().to_string(), actions));
            }
            return Err(IstotaError::TaskFailed { message: "agent produced no result".into() });
        }

        Err(self.failure_from(&raw_text, stderr))
    }

    fn completed(&self, result: String, actions: Vec<Value>) -> ExecOutcome {
        if let Some(rest) = result.strip_prefix(CONFIRM_PREFIX) {
            return ExecOutcome::ConfirmationNeeded { prompt: rest.trim().to_string() };
        }
        ExecOutcome::Completed { result, actions }
    }

    fn failure_from(&self, output: &str, stderr: &str) -> IstotaError {
        let combined = format!("{output}\n{stderr}");
        if let Some((status, payload)) = retry::classify_api_error(&combined) {
            return IstotaError::AgentBackend { status, payload };
        }
        let message = if stderr.trim().is_empty() { output } else { stderr };
        IstotaError::TaskFailed { message: message.trim().to_string() }
    }
}

/// SIGTERM, a grace period, then SIGKILL.
async fn terminate_child(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        if tokio::time::timeout(Duration::from_secs(TERMINATE_GRACE_SECS), child.wait())
            .await
            .is_ok()
        {
            return;
        }
        debug!(pid, "subprocess ignored SIGTERM; killing");
    }
    let _ = child.kill().await;
}
