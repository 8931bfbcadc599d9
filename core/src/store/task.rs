//! The task table: the central entity of the orchestrator
//!
//! Status transitions are enforced here. Terminal states are write-once;
//! invariant violations are rejected before anything touches the database.

use super::{fmt_ts, parse_ts, Store};
use crate::error::{IstotaError, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, params_from_iter, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Locked,
    Running,
    Completed,
    Failed,
    PendingConfirmation,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Locked => "locked",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::PendingConfirmation => "pending_confirmation",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = IstotaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "locked" => Ok(Self::Locked),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "pending_confirmation" => Ok(Self::PendingConfirmation),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(IstotaError::Internal { message: format!("unknown status: {other}") }),
        }
    }
}

/// Where a task came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Chat,
    Cli,
    Scheduled,
    Subtask,
    Briefing,
    Email,
    File,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Cli => "cli",
            Self::Scheduled => "scheduled",
            Self::Subtask => "subtask",
            Self::Briefing => "briefing",
            Self::Email => "email",
            Self::File => "file",
        }
    }

    /// Default execution class for tasks from this source.
    pub fn default_queue(&self) -> TaskQueue {
        match self {
            Self::Chat | Self::Cli | Self::Email => TaskQueue::Foreground,
            Self::Scheduled | Self::Subtask | Self::Briefing | Self::File => TaskQueue::Background,
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = IstotaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "chat" => Ok(Self::Chat),
            "cli" => Ok(Self::Cli),
            "scheduled" => Ok(Self::Scheduled),
            "subtask" => Ok(Self::Subtask),
            "briefing" => Ok(Self::Briefing),
            "email" => Ok(Self::Email),
            "file" => Ok(Self::File),
            other => Err(IstotaError::Internal { message: format!("unknown source type: {other}") }),
        }
    }
}

/// Execution priority class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskQueue {
    Foreground,
    Background,
}

impl TaskQueue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Foreground => "foreground",
            Self::Background => "background",
        }
    }
}

impl fmt::Display for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskQueue {
    type Err = IstotaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "foreground" => Ok(Self::Foreground),
            "background" => Ok(Self::Background),
            other => Err(IstotaError::Internal { message: format!("unknown queue: {other}") }),
        }
    }
}

/// Where results are delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputTarget {
    Chat,
    Email,
    Push,
    ChatEmail,
    All,
}

impl OutputTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Email => "email",
            Self::Push => "push",
            Self::ChatEmail => "chat+email",
            Self::All => "all",
        }
    }

    /// The individual sinks this target fans out to.
    pub fn sinks(&self) -> &'static [OutputTarget] {
        match self {
            Self::Chat => &[Self::Chat],
            Self::Email => &[Self::Email],
            Self::Push => &[Self::Push],
            Self::ChatEmail => &[Self::Chat, Self::Email],
            Self::All => &[Self::Chat, Self::Email, Self::Push],
        }
    }
}

impl fmt::Display for OutputTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputTarget {
    type Err = IstotaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "chat" => Ok(Self::Chat),
            "email" => Ok(Self::Email),
            "push" => Ok(Self::Push),
            "chat+email" => Ok(Self::ChatEmail),
            "all" | "chat+email+push" => Ok(Self::All),
            other => {
                Err(IstotaError::Internal { message: format!("unknown output target: {other}") })
            }
        }
    }
}

/// A unit of work for the agent subprocess
#[derive(Debug, Clone)]
pub struct Task {
    pub id: i64,
    pub user_id: String,
    pub source_type: SourceType,
    pub queue: TaskQueue,
    pub priority: u8,
    pub conversation_token: Option<String>,
    pub parent_task_id: Option<i64>,
    pub prompt: Option<String>,
    pub command: Option<String>,
    pub attachments: Vec<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub worker_pid: Option<u32>,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub cancel_requested: bool,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub actions_taken: Vec<serde_json::Value>,
    pub error: Option<String>,
    pub confirmation_prompt: Option<String>,
    pub output_target: Option<OutputTarget>,
    pub talk_message_id: Option<String>,
    pub talk_response_id: Option<String>,
    pub reply_to_talk_id: Option<String>,
    pub reply_to_content: Option<String>,
    pub heartbeat_silent: bool,
    pub scheduled_job_id: Option<i64>,
}

impl Task {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let status: String = row.get("status")?;
        let source_type: String = row.get("source_type")?;
        let queue: String = row.get("queue")?;
        let output_target: Option<String> = row.get("output_target")?;
        let attachments: Option<String> = row.get("attachments")?;
        let actions_taken: Option<String> = row.get("actions_taken")?;

        Ok(Task {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            source_type: source_type.parse().unwrap_or(SourceType::Cli),
            queue: queue.parse().unwrap_or(TaskQueue::Foreground),
            priority: row.get("priority")?,
            conversation_token: row.get("conversation_token")?,
            parent_task_id: row.get("parent_task_id")?,
            prompt: row.get("prompt")?,
            command: row.get("command")?,
            attachments: attachments
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or_default(),
            status: status.parse().unwrap_or(TaskStatus::Pending),
            created_at: get_ts(row, "created_at")?.unwrap_or_else(Utc::now),
            updated_at: get_ts(row, "updated_at")?.unwrap_or_else(Utc::now),
            locked_at: get_ts(row, "locked_at")?,
            started_at: get_ts(row, "started_at")?,
            completed_at: get_ts(row, "completed_at")?,
            confirmed_at: get_ts(row, "confirmed_at")?,
            locked_by: row.get("locked_by")?,
            worker_pid: row.get("worker_pid")?,
            attempt_count: row.get("attempt_count")?,
            max_attempts: row.get("max_attempts")?,
            cancel_requested: row.get::<_, i64>("cancel_requested")? != 0,
            scheduled_for: get_ts(row, "scheduled_for")?,
            result: row.get("result")?,
            actions_taken: actions_taken
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or_default(),
            error: row.get("error")?,
            confirmation_prompt: row.get("confirmation_prompt")?,
            output_target: output_target.and_then(|s| s.parse().ok()),
            talk_message_id: row.get("talk_message_id")?,
            talk_response_id: row.get("talk_response_id")?,
            reply_to_talk_id: row.get("reply_to_talk_id")?,
            reply_to_content: row.get("reply_to_content")?,
            heartbeat_silent: row.get::<_, i64>("heartbeat_silent")? != 0,
            scheduled_job_id: row.get("scheduled_job_id")?,
        })
    }

    /// Retries remain within the attempt budget.
    pub fn can_retry(&self) -> bool {
        self.attempt_count < self.max_attempts
    }
}

fn get_ts(row: &Row<'_>, column: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let value: Option<String> = row.get(column)?;
    Ok(value.as_deref().and_then(parse_ts))
}

/// Fields for task creation. Everything not set falls back to a sensible
/// default; `CreateTask` rejects invariant violations.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub user_id: String,
    pub source_type: SourceType,
    pub queue: TaskQueue,
    pub priority: u8,
    pub prompt: Option<String>,
    pub command: Option<String>,
    pub attachments: Vec<String>,
    pub conversation_token: Option<String>,
    pub parent_task_id: Option<i64>,
    pub output_target: Option<OutputTarget>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub max_attempts: u32,
    pub talk_message_id: Option<String>,
    pub reply_to_talk_id: Option<String>,
    pub reply_to_content: Option<String>,
    pub heartbeat_silent: bool,
    pub scheduled_job_id: Option<i64>,
}

impl NewTask {
    pub fn prompt(user_id: impl Into<String>, source_type: SourceType, prompt: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            source_type,
            queue: source_type.default_queue(),
            priority: 5,
            prompt: Some(prompt.into()),
            command: None,
            attachments: Vec::new(),
            conversation_token: None,
            parent_task_id: None,
            output_target: None,
            scheduled_for: None,
            max_attempts: 3,
            talk_message_id: None,
            reply_to_talk_id: None,
            reply_to_content: None,
            heartbeat_silent: false,
            scheduled_job_id: None,
        }
    }

    pub fn command(user_id: impl Into<String>, source_type: SourceType, command: impl Into<String>) -> Self {
        let mut new = Self::prompt(user_id, source_type, "");
        new.prompt = None;
        new.command = Some(command.into());
        new
    }

    fn validate(&self) -> Result<()> {
        if self.user_id.trim().is_empty() {
            return Err(IstotaError::InvalidTask { message: "user_id must be non-empty".into() });
        }
        let has_prompt = self.prompt.as_deref().is_some_and(|p| !p.trim().is_empty());
        let has_command = self.command.as_deref().is_some_and(|c| !c.trim().is_empty());
        match (has_prompt, has_command) {
            (true, true) => Err(IstotaError::InvalidTask {
                message: "prompt and command are mutually exclusive".into(),
            }),
            (false, false) => Err(IstotaError::InvalidTask {
                message: "either prompt or command must be non-empty".into(),
            }),
            _ => Ok(()),
        }?;
        if !(1..=10).contains(&self.priority) {
            return Err(IstotaError::InvalidTask {
                message: format!("priority {} outside 1..=10", self.priority),
            });
        }
        if self.max_attempts == 0 {
            return Err(IstotaError::InvalidTask { message: "max_attempts must be at least 1".into() });
        }
        Ok(())
    }
}

/// Filter for `list_tasks`
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub user_id: Option<String>,
    pub status: Option<TaskStatus>,
    pub queue: Option<TaskQueue>,
    pub source_type: Option<SourceType>,
    pub limit: Option<u32>,
}

/// One prior exchange, used for conversation context assembly
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub task_id: i64,
    pub prompt: Option<String>,
    pub result: Option<String>,
    pub source_type: SourceType,
    pub created_at: DateTime<Utc>,
}

/// What `cancel_task` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Task was running; the cancel flag was set for the worker to observe
    Flagged,
    /// Task moved straight to `cancelled`
    Cancelled,
    /// Task was already terminal; nothing changed
    AlreadyTerminal,
}

impl Store {
    /// Insert a new `pending` task. Rejects invariant violations.
    pub fn create_task(&self, new: &NewTask, now: DateTime<Utc>) -> Result<i64> {
        new.validate()?;
        let ts = fmt_ts(now);
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tasks (user_id, source_type, queue, priority, conversation_token,
                                    parent_task_id, prompt, command, attachments, status,
                                    created_at, updated_at, max_attempts, scheduled_for,
                                    output_target, talk_message_id, reply_to_talk_id,
                                    reply_to_content, heartbeat_silent, scheduled_job_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'pending',
                         ?10, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
                params![
                    new.user_id,
                    new.source_type.as_str(),
                    new.queue.as_str(),
                    new.priority,
                    new.conversation_token,
                    new.parent_task_id,
                    new.prompt,
                    new.command,
                    serde_json::to_string(&new.attachments)?,
                    ts,
                    new.max_attempts,
                    new.scheduled_for.map(fmt_ts),
                    new.output_target.map(|t| t.as_str()),
                    new.talk_message_id,
                    new.reply_to_talk_id,
                    new.reply_to_content,
                    new.heartbeat_silent as i64,
                    new.scheduled_job_id,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_task(&self, id: i64) -> Result<Option<Task>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM tasks WHERE id = ?1")?;
            match stmt.query_row(params![id], Task::from_row) {
                Ok(task) => Ok(Some(task)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(err) => Err(err.into()),
            }
        })
    }

    pub fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut sql = String::from("SELECT * FROM tasks WHERE 1=1");
        let mut args: Vec<String> = Vec::new();
        if let Some(user_id) = &filter.user_id {
            args.push(user_id.clone());
            sql.push_str(&format!(" AND user_id = ?{}", args.len()));
        }
        if let Some(status) = filter.status {
            args.push(status.as_str().to_string());
            sql.push_str(&format!(" AND status = ?{}", args.len()));
        }
        if let Some(queue) = filter.queue {
            args.push(queue.as_str().to_string());
            sql.push_str(&format!(" AND queue = ?{}", args.len()));
        }
        if let Some(source_type) = filter.source_type {
            args.push(source_type.as_str().to_string());
            sql.push_str(&format!(" AND source_type = ?{}", args.len()));
        }
        sql.push_str(" ORDER BY created_at DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(args.iter()), Task::from_row)?;
            let mut tasks = Vec::new();
            for row in rows {
                tasks.push(row?);
            }
            Ok(tasks)
        })
    }

    /// Users that have claimable pending work on `queue`.
    pub fn list_users_with_pending(&self, queue: TaskQueue, now: DateTime<Utc>) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT user_id FROM tasks
                 WHERE status = 'pending' AND queue = ?1
                   AND (scheduled_for IS NULL OR scheduled_for <= ?2)
                 ORDER BY user_id",
            )?;
            let rows = stmt.query_map(params![queue.as_str(), fmt_ts(now)], |row| row.get(0))?;
            let mut users = Vec::new();
            for row in rows {
                users.push(row?);
            }
            Ok(users)
        })
    }

    pub fn count_pending(&self, user_id: &str, queue: TaskQueue, now: DateTime<Utc>) -> Result<u32> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM tasks
                 WHERE status = 'pending' AND queue = ?1 AND user_id = ?2
                   AND (scheduled_for IS NULL OR scheduled_for <= ?3)",
                params![queue.as_str(), user_id, fmt_ts(now)],
                |row| row.get(0),
            )?;
            Ok(n as u32)
        })
    }

    /// Change a task's status, recording result/error/actions as given.
    /// Terminal states are write-once: a second terminal write is an error.
    pub fn update_task_status(
        &self,
        id: i64,
        status: TaskStatus,
        result: Option<&str>,
        error: Option<&str>,
        actions: Option<&[serde_json::Value]>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.with_tx(|tx| {
            let current: String = tx
                .query_row("SELECT status FROM tasks WHERE id = ?1", params![id], |row| row.get(0))
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => IstotaError::TaskNotFound(id),
                    other => other.into(),
                })?;
            let current: TaskStatus = current.parse()?;
            if current.is_terminal() {
                return Err(IstotaError::TerminalStatus { id, status: current.to_string() });
            }

            let ts = fmt_ts(now);
            let completed_at = status.is_terminal().then(|| ts.clone());
            let started_at = (status == TaskStatus::Running).then(|| ts.clone());
            tx.execute(
                "UPDATE tasks
                 SET status = ?2,
                     result = COALESCE(?3, result),
                     error = COALESCE(?4, error),
                     actions_taken = COALESCE(?5, actions_taken),
                     completed_at = COALESCE(?6, completed_at),
                     started_at = COALESCE(?7, started_at),
                     updated_at = ?8
                 WHERE id = ?1",
                params![
                    id,
                    status.as_str(),
                    result,
                    error,
                    actions.map(serde_json::to_string).transpose()?,
                    completed_at,
                    started_at,
                    ts,
                ],
            )?;
            Ok(())
        })
    }

    /// Transition a claimed task to `running`, recording the subprocess pid.
    pub fn mark_running(&self, id: i64, worker_pid: Option<u32>, now: DateTime<Utc>) -> Result<()> {
        let ts = fmt_ts(now);
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE tasks
                 SET status = 'running', started_at = ?2, worker_pid = ?3,
                     attempt_count = attempt_count + 1, updated_at = ?2
                 WHERE id = ?1 AND status = 'locked'",
                params![id, ts, worker_pid],
            )?;
            if changed == 0 {
                return Err(IstotaError::TaskNotFound(id));
            }
            Ok(())
        })
    }

    /// Record the chat delivery id once the reply is posted.
    pub fn set_talk_response_id(&self, id: i64, response_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE tasks SET talk_response_id = ?2 WHERE id = ?1",
                params![id, response_id],
            )?;
            Ok(())
        })
    }

    /// Record the subprocess pid once it is known.
    pub fn set_worker_pid(&self, id: i64, pid: u32) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("UPDATE tasks SET worker_pid = ?2 WHERE id = ?1", params![id, pid])?;
            Ok(())
        })
    }

    /// Give a claimed-but-unstarted task back to the queue.
    pub fn release_task(&self, id: i64, now: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE tasks
                 SET status = 'pending', locked_at = NULL, locked_by = NULL, updated_at = ?2
                 WHERE id = ?1 AND status = 'locked'",
                params![id, fmt_ts(now)],
            )?;
            Ok(())
        })
    }

    /// Return a failed task to `pending` with a future `scheduled_for`.
    /// The attempt was already counted when the run started.
    pub fn set_pending_retry(
        &self,
        id: i64,
        error: &str,
        delay: Duration,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let ts = fmt_ts(now);
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE tasks
                 SET status = 'pending', error = ?2, scheduled_for = ?3,
                     locked_at = NULL, locked_by = NULL, worker_pid = NULL, updated_at = ?4
                 WHERE id = ?1 AND status IN ('locked', 'running')",
                params![id, error, fmt_ts(now + delay), ts],
            )?;
            if changed == 0 {
                return Err(IstotaError::TaskNotFound(id));
            }
            Ok(())
        })
    }

    /// Park a task waiting on a user's explicit go-ahead.
    pub fn set_confirmation(&self, id: i64, prompt: &str, now: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE tasks
                 SET status = 'pending_confirmation', confirmation_prompt = ?2,
                     locked_at = NULL, locked_by = NULL, worker_pid = NULL, updated_at = ?3
                 WHERE id = ?1 AND status IN ('locked', 'running')",
                params![id, prompt, fmt_ts(now)],
            )?;
            if changed == 0 {
                return Err(IstotaError::TaskNotFound(id));
            }
            Ok(())
        })
    }

    /// A confirming reply re-queues the task.
    pub fn confirm_task(&self, id: i64, now: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE tasks
                 SET status = 'pending', confirmed_at = ?2, updated_at = ?2
                 WHERE id = ?1 AND status = 'pending_confirmation'",
                params![id, fmt_ts(now)],
            )?;
            if changed == 0 {
                return Err(IstotaError::TaskNotFound(id));
            }
            Ok(())
        })
    }

    /// Request cancellation. Running tasks get a flag their worker observes
    /// at the next safe point; anything else non-terminal cancels now.
    pub fn cancel_task(&self, id: i64, now: DateTime<Utc>) -> Result<CancelOutcome> {
        self.with_tx(|tx| {
            let status: String = tx
                .query_row("SELECT status FROM tasks WHERE id = ?1", params![id], |row| row.get(0))
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => IstotaError::TaskNotFound(id),
                    other => other.into(),
                })?;
            let status: TaskStatus = status.parse()?;
            let ts = fmt_ts(now);

            if status.is_terminal() {
                return Ok(CancelOutcome::AlreadyTerminal);
            }
            if status == TaskStatus::Running {
                tx.execute(
                    "UPDATE tasks SET cancel_requested = 1, updated_at = ?2 WHERE id = ?1",
                    params![id, ts],
                )?;
                return Ok(CancelOutcome::Flagged);
            }
            tx.execute(
                "UPDATE tasks
                 SET status = 'cancelled', cancel_requested = 1, completed_at = ?2, updated_at = ?2
                 WHERE id = ?1",
                params![id, ts],
            )?;
            Ok(CancelOutcome::Cancelled)
        })
    }

    /// Polled by the streaming executor between events.
    pub fn is_task_cancelled(&self, id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let (flag, status): (i64, String) = conn.query_row(
                "SELECT cancel_requested, status FROM tasks WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok(flag != 0 || status == "cancelled")
        })
    }

    /// Prior exchanges on a conversation token, newest first, excluding the
    /// given task and source types.
    pub fn conversation_history(
        &self,
        token: &str,
        exclude_task: Option<i64>,
        limit: u32,
        exclude_sources: &[SourceType],
    ) -> Result<Vec<HistoryEntry>> {
        let excluded: Vec<&str> = exclude_sources.iter().map(|s| s.as_str()).collect();
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, prompt, result, source_type, created_at FROM tasks
                 WHERE conversation_token = ?1 AND status = 'completed' AND id != ?2
                 ORDER BY created_at DESC LIMIT ?3",
            )?;
            let rows = stmt.query_map(
                params![token, exclude_task.unwrap_or(-1), limit],
                |row| {
                    let source: String = row.get(3)?;
                    let created: String = row.get(4)?;
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        source,
                        created,
                    ))
                },
            )?;
            let mut entries = Vec::new();
            for row in rows {
                let (task_id, prompt, result, source, created) = row?;
                let source_type: SourceType = match source.parse() {
                    Ok(s) => s,
                    Err(_) => continue,
                };
                if excluded.contains(&source_type.as_str()) {
                    continue;
                }
                entries.push(HistoryEntry {
                    task_id,
                    prompt,
                    result,
                    source_type,
                    created_at: parse_ts(&created).unwrap_or_else(Utc::now),
                });
            }
            Ok(entries)
        })
    }

    /// Expire confirmation requests older than `timeout`. Returns the tasks
    /// moved to `cancelled` so the caller can notify their users.
    pub fn expire_confirmations(&self, timeout: Duration, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let cutoff = fmt_ts(now - timeout);
        let ts = fmt_ts(now);
        self.with_tx(|tx| {
            let mut stmt = tx.prepare(
                "SELECT * FROM tasks
                 WHERE status = 'pending_confirmation' AND updated_at <= ?1",
            )?;
            let rows = stmt.query_map(params![cutoff], Task::from_row)?;
            let mut expired = Vec::new();
            for row in rows {
                expired.push(row?);
            }
            drop(stmt);

            for task in &expired {
                tx.execute(
                    "UPDATE tasks
                     SET status = 'cancelled', completed_at = ?2, updated_at = ?2,
                         error = 'confirmation timed out'
                     WHERE id = ?1",
                    params![task.id, ts],
                )?;
            }
            Ok(expired)
        })
    }

    /// The newest task awaiting confirmation on a conversation, if any.
    /// The chat poller checks this before turning a reply into a new task.
    pub fn pending_confirmation_for(&self, user_id: &str, token: &str) -> Result<Option<Task>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM tasks
                 WHERE user_id = ?1 AND conversation_token = ?2
                   AND status = 'pending_confirmation'
                 ORDER BY updated_at DESC LIMIT 1",
            )?;
            match stmt.query_row(params![user_id, token], Task::from_row) {
                Ok(task) => Ok(Some(task)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(err) => Err(err.into()),
            }
        })
    }

    /// Newest completed task id for a user, optionally narrowed to one
    /// conversation. Drives the sleep-cycle poller's high-water mark.
    pub fn latest_completed_task_id(
        &self,
        user_id: &str,
        conversation_token: Option<&str>,
    ) -> Result<Option<i64>> {
        self.with_conn(|conn| {
            let id: Option<i64> = match conversation_token {
                Some(token) => conn.query_row(
                    "SELECT MAX(id) FROM tasks
                     WHERE user_id = ?1 AND conversation_token = ?2 AND status = 'completed'",
                    params![user_id, token],
                    |row| row.get(0),
                )?,
                None => conn.query_row(
                    "SELECT MAX(id) FROM tasks WHERE user_id = ?1 AND status = 'completed'",
                    params![user_id],
                    |row| row.get(0),
                )?,
            };
            Ok(id)
        })
    }

    /// Retention sweep: delete terminal tasks older than `retention_days`.
    pub fn delete_old_tasks(&self, retention_days: u64, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = fmt_ts(now - Duration::days(retention_days as i64));
        self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM tasks
                 WHERE status IN ('completed', 'failed', 'cancelled') AND completed_at <= ?1
                   AND id NOT IN (SELECT parent_task_id FROM tasks WHERE parent_task_id IS NOT NULL)",
                params![cutoff],
            )?;
            Ok(n)
        })
    }

    /// Fail pending tasks nobody picked up within the abandonment window.
    pub fn fail_abandoned_pending(&self, max_age_days: u64, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = fmt_ts(now - Duration::days(max_age_days as i64));
        let ts = fmt_ts(now);
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE tasks
                 SET status = 'failed', error = 'abandoned: never claimed', completed_at = ?2,
                     updated_at = ?2
                 WHERE status = 'pending' AND created_at <= ?1",
                params![cutoff, ts],
            )?;
            Ok(n)
        })
    }
}
