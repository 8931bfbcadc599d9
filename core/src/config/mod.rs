//! Configuration management
//!
//! A single TOML document partitioned into typed sub-configs with serde
//! defaults. Recognized secrets can be overridden from the environment so
//! they never need to live in the file.

use crate::error::{IstotaError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default configuration file name
const CONFIG_FILE_NAME: &str = "istota.toml";

/// Default config directory name
const CONFIG_DIR_NAME: &str = "istota";

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,

    #[serde(default)]
    pub workers: WorkerConfig,

    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub channels: ChannelsConfig,

    #[serde(default)]
    pub prompt: PromptConfig,

    /// Skill documents with their selection predicates
    #[serde(default)]
    pub skills: Vec<SkillConfig>,

    /// Per-user settings keyed by user id
    #[serde(default)]
    pub users: BTreeMap<String, UserConfig>,
}

/// Top-level daemon settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DaemonConfig {
    /// Seconds between scheduler loop iterations
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Path to the SQLite database
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Shared scratch root for per-task working directories
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,

    /// Host-local exclusive lock file
    #[serde(default = "default_lock_path")]
    pub lock_path: PathBuf,

    /// Locked/running tasks older than this are failed by the claim protocol
    #[serde(default = "default_max_retry_age")]
    pub max_retry_age_hours: u64,

    /// Unconfirmed confirmation requests expire after this
    #[serde(default = "default_confirmation_timeout")]
    pub confirmation_timeout_minutes: u64,

    /// Scheduled jobs auto-disable after this many consecutive failures
    #[serde(default = "default_job_disable_threshold")]
    pub job_disable_threshold: u32,
}

fn default_poll_interval() -> u64 {
    2
}

fn default_db_path() -> PathBuf {
    data_dir().join("istota.db")
}

fn default_scratch_dir() -> PathBuf {
    data_dir().join("scratch")
}

fn default_lock_path() -> PathBuf {
    data_dir().join("istota.lock")
}

fn default_max_retry_age() -> u64 {
    24
}

fn default_confirmation_timeout() -> u64 {
    60
}

fn default_job_disable_threshold() -> u32 {
    5
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            db_path: default_db_path(),
            scratch_dir: default_scratch_dir(),
            lock_path: default_lock_path(),
            max_retry_age_hours: default_max_retry_age(),
            confirmation_timeout_minutes: default_confirmation_timeout(),
            job_disable_threshold: default_job_disable_threshold(),
        }
    }
}

/// Worker pool caps and lifecycle settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WorkerConfig {
    /// Instance-wide foreground worker cap
    #[serde(default = "default_max_fg")]
    pub max_foreground_workers: u32,

    /// Instance-wide background worker cap
    #[serde(default = "default_max_bg")]
    pub max_background_workers: u32,

    /// Default per-user foreground cap (overridable per user)
    #[serde(default = "default_user_fg")]
    pub user_max_foreground_workers: u32,

    /// Default per-user background cap (overridable per user)
    #[serde(default = "default_user_bg")]
    pub user_max_background_workers: u32,

    /// Workers exit after this many seconds without claiming a task
    #[serde(default = "default_idle_timeout")]
    pub worker_idle_timeout_secs: u64,

    /// Bounded join timeout for cooperative shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_max_fg() -> u32 {
    5
}

fn default_max_bg() -> u32 {
    3
}

fn default_user_fg() -> u32 {
    2
}

fn default_user_bg() -> u32 {
    1
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_shutdown_grace() -> u64 {
    10
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_foreground_workers: default_max_fg(),
            max_background_workers: default_max_bg(),
            user_max_foreground_workers: default_user_fg(),
            user_max_background_workers: default_user_bg(),
            worker_idle_timeout_secs: default_idle_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

/// How the agent subprocess environment is constructed
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    /// Strip inherited environment; pass only the allowlist
    #[default]
    Restricted,
    /// Inherit the environment minus credential-named variables
    Permissive,
}

/// Agent subprocess invocation settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ExecutorConfig {
    /// Agent program to invoke
    #[serde(default = "default_agent_program")]
    pub program: String,

    /// Extra arguments placed before the prompt
    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub security_mode: SecurityMode,

    /// Tools passed via --allowedTools in restricted mode
    #[serde(default)]
    pub allowed_tools: Vec<String>,

    /// Hard per-task timeout
    #[serde(default = "default_task_timeout")]
    pub task_timeout_minutes: u64,

    /// Parse the line-delimited JSON event stream instead of waiting for
    /// the full output
    #[serde(default = "default_streaming")]
    pub streaming: bool,

    /// Transient API error retries (do not consume task attempts)
    #[serde(default = "default_api_retries")]
    pub api_retry_attempts: u32,

    /// Fixed delay between transient API retries
    #[serde(default = "default_api_retry_delay")]
    pub api_retry_delay_secs: u64,

    /// Backoff curve for task-level retries, in minutes
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_minutes: Vec<u64>,
}

fn default_agent_program() -> String {
    "agent".to_string()
}

fn default_task_timeout() -> u64 {
    30
}

fn default_streaming() -> bool {
    true
}

fn default_api_retries() -> u32 {
    3
}

fn default_api_retry_delay() -> u64 {
    5
}

fn default_retry_backoff() -> Vec<u64> {
    vec![1, 4, 16]
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            program: default_agent_program(),
            args: Vec::new(),
            security_mode: SecurityMode::default(),
            allowed_tools: Vec::new(),
            task_timeout_minutes: default_task_timeout(),
            streaming: default_streaming(),
            api_retry_attempts: default_api_retries(),
            api_retry_delay_secs: default_api_retry_delay(),
            retry_backoff_minutes: default_retry_backoff(),
        }
    }
}

/// Retention policy applied by the cleanup poller
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RetentionConfig {
    /// Terminal tasks older than this are deleted
    #[serde(default = "default_task_retention")]
    pub task_retention_days: u64,

    /// Pending tasks older than this are failed as abandoned
    #[serde(default = "default_pending_age")]
    pub max_pending_age_days: u64,
}

fn default_task_retention() -> u64 {
    30
}

fn default_pending_age() -> u64 {
    7
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            task_retention_days: default_task_retention(),
            max_pending_age_days: default_pending_age(),
        }
    }
}

/// Inbound/outbound channel endpoints and secrets
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub chat: ChatChannelConfig,
    #[serde(default)]
    pub email: EmailChannelConfig,
    #[serde(default)]
    pub push: PushChannelConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ChatChannelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub base_url: String,
    /// The bot's own account; its messages are never turned into tasks
    #[serde(default)]
    pub bot_user: String,
    /// App password; overridable via ISTOTA_CHAT_TOKEN
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct EmailChannelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub imap_host: String,
    #[serde(default)]
    pub smtp_host: String,
    #[serde(default)]
    pub address: String,
    /// App password; overridable via ISTOTA_EMAIL_PASSWORD
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PushChannelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: String,
    /// API token; overridable via ISTOTA_PUSH_TOKEN
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_push_priority")]
    pub priority: u8,
}

fn default_push_priority() -> u8 {
    3
}

impl Default for PushChannelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            token: String::new(),
            priority: default_push_priority(),
        }
    }
}

/// Prompt assembly inputs that are content, not code
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PromptConfig {
    /// Persona document prepended to every prompt
    #[serde(default)]
    pub persona_file: Option<PathBuf>,

    /// Behavioral rules listed verbatim
    #[serde(default)]
    pub behavioral_rules: Vec<String>,

    /// Extra guidance keyed by source type name
    #[serde(default)]
    pub channel_guidelines: BTreeMap<String, String>,

    /// Conversation history entries included for context
    #[serde(default = "default_history_limit")]
    pub history_limit: u32,
}

fn default_history_limit() -> u32 {
    20
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            persona_file: None,
            behavioral_rules: Vec::new(),
            channel_guidelines: BTreeMap::new(),
            history_limit: default_history_limit(),
        }
    }
}

/// A skill document plus the predicates that select it
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct SkillConfig {
    pub name: String,
    /// Path to the skill's documentation file
    pub doc_path: PathBuf,
    /// Prompt keywords that trigger inclusion
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Source types that trigger inclusion
    #[serde(default)]
    pub source_types: Vec<String>,
    /// User resource types that trigger inclusion
    #[serde(default)]
    pub resource_types: Vec<String>,
    /// Attachment extensions that trigger inclusion
    #[serde(default)]
    pub extensions: Vec<String>,
    /// Included for every task regardless of predicates
    #[serde(default)]
    pub always_include: bool,
    /// Only available to admin users
    #[serde(default)]
    pub admin_only: bool,
}

/// Per-user settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UserConfig {
    /// IANA timezone for cron evaluation, e.g. "Europe/Warsaw"
    #[serde(default = "default_timezone")]
    pub timezone: String,

    #[serde(default)]
    pub admin: bool,

    /// Per-user cap overrides; fall back to [workers] defaults
    #[serde(default)]
    pub max_foreground_workers: Option<u32>,
    #[serde(default)]
    pub max_background_workers: Option<u32>,

    /// Chat rooms/threads polled for this user
    #[serde(default)]
    pub chat_tokens: Vec<String>,

    /// Senders whose emails become tasks
    #[serde(default)]
    pub email_senders: Vec<String>,

    /// Watched TASKS.md-style file
    #[serde(default)]
    pub tasks_file: Option<PathBuf>,

    /// Directory scanned for shared-file resource discovery
    #[serde(default)]
    pub shared_dir: Option<PathBuf>,

    /// Long-term memory root (MEMORY.md plus channels/<token>.md)
    #[serde(default)]
    pub memory_dir: Option<PathBuf>,

    /// Statically configured resources
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,

    #[serde(default)]
    pub briefings: Vec<BriefingConfig>,

    #[serde(default)]
    pub heartbeats: Vec<HeartbeatConfig>,

    #[serde(default)]
    pub sleep_cycle: Option<SleepCycleConfig>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            admin: false,
            max_foreground_workers: None,
            max_background_workers: None,
            chat_tokens: Vec::new(),
            email_senders: Vec::new(),
            tasks_file: None,
            shared_dir: None,
            memory_dir: None,
            resources: Vec::new(),
            briefings: Vec::new(),
            heartbeats: Vec::new(),
            sleep_cycle: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ResourceConfig {
    pub resource_type: String,
    pub path: PathBuf,
    #[serde(default = "default_permissions")]
    pub permissions: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

fn default_permissions() -> String {
    "read".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BriefingConfig {
    pub name: String,
    /// 5-field cron expression, evaluated in the user's timezone
    pub cron: String,
    pub prompt: String,
    #[serde(default)]
    pub output_target: Option<String>,
    /// Suppress NO_ACTION: results
    #[serde(default)]
    pub silent: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HeartbeatConfig {
    pub name: String,
    /// 5-field cron expression for the check cadence
    pub cron: String,
    /// Shell command; non-zero exit counts as a failed check
    pub command: String,
    /// Alert after this many consecutive failures
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Minimum minutes between repeated alerts
    #[serde(default = "default_alert_cooldown")]
    pub alert_cooldown_minutes: u64,
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_alert_cooldown() -> u64 {
    60
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SleepCycleConfig {
    /// When the nightly memory extraction runs (user timezone)
    #[serde(default = "default_sleep_cron")]
    pub cron: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_sleep_cron() -> String {
    "0 3 * * *".to_string()
}

fn default_enabled() -> bool {
    true
}

impl Default for SleepCycleConfig {
    fn default() -> Self {
        Self { cron: default_sleep_cron(), enabled: default_enabled() }
    }
}

impl Config {
    /// Load from an explicit path, or search the standard locations.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => find_config_file().ok_or_else(|| IstotaError::MissingConfig {
                key: CONFIG_FILE_NAME.to_string(),
            })?,
        };

        let content = std::fs::read_to_string(&path)?;
        let mut config: Config =
            toml::from_str(&content).map_err(|e| IstotaError::InvalidConfig {
                message: format!("{}: {}", path.display(), e),
            })?;

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Recognized secrets are overridable from the environment so the TOML
    /// file can stay free of credentials.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var("ISTOTA_CHAT_TOKEN") {
            self.channels.chat.token = token;
        }
        if let Ok(password) = std::env::var("ISTOTA_EMAIL_PASSWORD") {
            self.channels.email.password = password;
        }
        if let Ok(token) = std::env::var("ISTOTA_PUSH_TOKEN") {
            self.channels.push.token = token;
        }
        if let Ok(db) = std::env::var("ISTOTA_DB_PATH") {
            self.daemon.db_path = PathBuf::from(db);
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (user_id, user) in &self.users {
            if user_id.is_empty() {
                return Err(IstotaError::InvalidConfig {
                    message: "empty user id".to_string(),
                });
            }
            crate::cron::parse_timezone(&user.timezone)?;
            for briefing in &user.briefings {
                crate::cron::parse_expression(&briefing.cron)?;
            }
            for heartbeat in &user.heartbeats {
                crate::cron::parse_expression(&heartbeat.cron)?;
            }
            if let Some(sleep) = &user.sleep_cycle {
                crate::cron::parse_expression(&sleep.cron)?;
            }
        }
        if self.workers.max_foreground_workers == 0 {
            return Err(IstotaError::InvalidConfig {
                message: "max_foreground_workers must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Effective per-user foreground cap
    pub fn user_foreground_cap(&self, user_id: &str) -> u32 {
        self.users
            .get(user_id)
            .and_then(|u| u.max_foreground_workers)
            .unwrap_or(self.workers.user_max_foreground_workers)
    }

    /// Effective per-user background cap
    pub fn user_background_cap(&self, user_id: &str) -> u32 {
        self.users
            .get(user_id)
            .and_then(|u| u.max_background_workers)
            .unwrap_or(self.workers.user_max_background_workers)
    }

    pub fn is_admin(&self, user_id: &str) -> bool {
        self.users.get(user_id).map(|u| u.admin).unwrap_or(false)
    }

    pub fn user_timezone(&self, user_id: &str) -> String {
        self.users
            .get(user_id)
            .map(|u| u.timezone.clone())
            .unwrap_or_else(default_timezone)
    }
}

/// Find the configuration file in standard locations
pub fn find_config_file() -> Option<PathBuf> {
    if let Ok(cwd) = std::env::current_dir() {
        let path = cwd.join(CONFIG_FILE_NAME);
        if path.exists() {
            return Some(path);
        }
    }

    if let Some(dir) = dirs::config_dir() {
        let path = dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME);
        if path.exists() {
            return Some(path);
        }
    }

    None
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(CONFIG_DIR_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_caps() {
        let config = Config::default();
        assert_eq!(config.workers.max_foreground_workers, 5);
        assert_eq!(config.workers.max_background_workers, 3);
        assert_eq!(config.workers.user_max_foreground_workers, 2);
        assert_eq!(config.workers.user_max_background_workers, 1);
        assert_eq!(config.daemon.poll_interval_secs, 2);
        assert_eq!(config.executor.task_timeout_minutes, 30);
        assert_eq!(config.executor.retry_backoff_minutes, vec![1, 4, 16]);
    }

    #[test]
    fn per_user_overrides_replace_defaults() {
        let mut config = Config::default();
        config.users.insert(
            "alice".to_string(),
            UserConfig { max_foreground_workers: Some(4), ..Default::default() },
        );
        assert_eq!(config.user_foreground_cap("alice"), 4);
        assert_eq!(config.user_background_cap("alice"), 1);
        assert_eq!(config.user_foreground_cap("bob"), 2);
    }

    #[test]
    fn parses_minimal_document() {
        let doc = r#"
            [daemon]
            poll_interval_secs = 1

            [users.alice]
            timezone = "Europe/Warsaw"
            admin = true
            chat_tokens = ["room-1"]

            [[users.alice.briefings]]
            name = "morning"
            cron = "30 7 * * *"
            prompt = "Prepare the morning briefing."
        "#;
        let mut config: Config = toml::from_str(doc).expect("parse");
        config.validate().expect("validate");
        assert_eq!(config.daemon.poll_interval_secs, 1);
        assert!(config.is_admin("alice"));
        assert_eq!(config.users["alice"].briefings[0].name, "morning");
    }

    #[test]
    fn rejects_bad_cron_expression() {
        let doc = r#"
            [users.alice]
            [[users.alice.briefings]]
            name = "broken"
            cron = "not a cron"
            prompt = "x"
        "#;
        let config: Config = toml::from_str(doc).expect("parse");
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides_replace_secrets() {
        let mut config = Config::default();
        std::env::set_var("ISTOTA_CHAT_TOKEN", "tok-123");
        config.apply_env_overrides();
        std::env::remove_var("ISTOTA_CHAT_TOKEN");
        assert_eq!(config.channels.chat.token, "tok-123");
    }
}
