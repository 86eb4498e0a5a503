use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

use crate::types::InboundMessage;

/// Control-plane configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,

    pub slack_bot_token: String,
    pub slack_signing_secret: String,

    /// Empty means everyone is allowed.
    pub allowed_users: Vec<String>,

    pub rate_limit_enabled: bool,
    pub rate_limit_max: u32,
    pub rate_limit_window: Duration,

    /// Idle time before a worker is scaled to zero.
    pub grace_period: Duration,

    pub worker_namespace: String,
    pub worker_image: String,
    /// Kubernetes secret holding agent and chat credentials for workers.
    pub worker_secret_name: Option<String>,
    pub session_timeout_minutes: u64,

    /// `userId=owner/repo` pairs powering the Edit button.
    pub user_repos: HashMap<String, String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            slack_bot_token: env::var("SLACK_BOT_TOKEN")
                .context("SLACK_BOT_TOKEN must be set")?,
            slack_signing_secret: env::var("SLACK_SIGNING_SECRET")
                .context("SLACK_SIGNING_SECRET must be set")?,
            allowed_users: parse_list(env::var("ALLOWED_USERS").ok()),
            rate_limit_enabled: env::var("RATE_LIMIT_ENABLED")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
            rate_limit_max: parse_or("RATE_LIMIT_MAX", 5)?,
            rate_limit_window: Duration::from_secs(
                parse_or("RATE_LIMIT_WINDOW_MINUTES", 15u64)? * 60,
            ),
            grace_period: Duration::from_secs(parse_or("GRACE_PERIOD_MINUTES", 5u64)? * 60),
            worker_namespace: env::var("WORKER_NAMESPACE")
                .unwrap_or_else(|_| "default".to_string()),
            worker_image: env::var("WORKER_IMAGE").context("WORKER_IMAGE must be set")?,
            worker_secret_name: env::var("WORKER_SECRET_NAME").ok(),
            session_timeout_minutes: parse_or("SESSION_TIMEOUT_MINUTES", 30)?,
            user_repos: parse_map(env::var("USER_REPOS").ok()),
        })
    }

    pub fn user_allowed(&self, user_id: &str) -> bool {
        self.allowed_users.is_empty() || self.allowed_users.iter().any(|u| u == user_id)
    }

    /// Repository slug (`owner/repo`) for a user, if mapped.
    pub fn repo_for_user(&self, user_id: &str) -> Option<&str> {
        self.user_repos.get(user_id).map(String::as_str)
    }
}

/// Worker-side configuration; the orchestrator conveys most of it through
/// the deployment environment.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub user_id: String,
    pub deployment_name: String,
    /// Dedicated queue this session consumes.
    pub queue_name: String,
    pub database_url: String,
    pub repository_url: Option<String>,
    pub session_timeout_minutes: u64,
    pub workspace_dir: String,
    /// Agent CLI invocation, e.g. `agent --output-format stream-json`.
    pub agent_command: String,
    /// Parallel threads per session; ordering within a thread is always strict.
    pub concurrency: usize,
    pub subprocess_timeout_minutes: u64,
    /// First message conveyed at deploy time, processed before polling.
    pub bootstrap: Option<InboundMessage>,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        let user_id = env::var("USER_ID").context("USER_ID must be set")?;

        Ok(Self {
            deployment_name: env::var("DEPLOYMENT_NAME")
                .unwrap_or_else(|_| crate::types::worker_deployment_name(&user_id)),
            queue_name: env::var("WORKER_QUEUE")
                .unwrap_or_else(|_| crate::types::user_queue_name(&user_id)),
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            repository_url: env::var("REPOSITORY_URL").ok(),
            session_timeout_minutes: parse_or("SESSION_TIMEOUT_MINUTES", 30)?,
            workspace_dir: env::var("WORKSPACE_DIR").unwrap_or_else(|_| "/workspace".to_string()),
            agent_command: env::var("AGENT_COMMAND").unwrap_or_else(|_| "agent".to_string()),
            concurrency: parse_or("WORKER_CONCURRENCY", 1usize)?,
            subprocess_timeout_minutes: parse_or("AGENT_TIMEOUT_MINUTES", 5)?,
            bootstrap: bootstrap_from_env(&user_id),
            user_id,
        })
    }
}

/// Reconstruct the bootstrap message from `INITIAL_*` variables, if the
/// orchestrator passed one.
fn bootstrap_from_env(user_id: &str) -> Option<InboundMessage> {
    let message_text = env::var("INITIAL_MESSAGE_TEXT").ok()?;
    let channel_id = env::var("INITIAL_CHANNEL_ID").ok()?;
    let thread_id = env::var("INITIAL_THREAD_ID").ok()?;
    let placeholder_ts = env::var("INITIAL_PLACEHOLDER_TS").ok()?;

    Some(InboundMessage {
        user_id: user_id.to_string(),
        message_id: env::var("INITIAL_MESSAGE_ID").unwrap_or_else(|_| thread_id.clone()),
        original_message_ts: env::var("INITIAL_ORIGINAL_MESSAGE_TS")
            .unwrap_or_else(|_| thread_id.clone()),
        thread_id,
        channel_id,
        message_text,
        placeholder_ts,
        platform_metadata: serde_json::Value::Null,
        agent_options: Default::default(),
    })
}

fn parse_list(value: Option<String>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn parse_map(value: Option<String>) -> HashMap<String, String> {
    value
        .map(|v| {
            v.split(',')
                .filter_map(|pair| {
                    let (key, value) = pair.split_once('=')?;
                    let key = key.trim();
                    let value = value.trim();
                    (!key.is_empty() && !value.is_empty())
                        .then(|| (key.to_string(), value.to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_or<T: std::str::FromStr>(var: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(var) {
        Ok(value) => value
            .parse()
            .with_context(|| format!("{var} must be a valid number")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_list_splits_and_trims() {
        let list = parse_list(Some("U1, U2 ,,U3".to_string()));
        assert_eq!(list, vec!["U1", "U2", "U3"]);
        assert!(parse_list(None).is_empty());
    }

    #[test]
    fn parse_map_reads_pairs() {
        let map = parse_map(Some("U1=acme/api, U2=acme/web".to_string()));
        assert_eq!(map.get("U1").map(String::as_str), Some("acme/api"));
        assert_eq!(map.get("U2").map(String::as_str), Some("acme/web"));
        assert!(parse_map(Some("garbage".to_string())).is_empty());
    }

    #[test]
    fn allowlist_empty_means_open() {
        let mut config = sample_config();
        assert!(config.user_allowed("anyone"));

        config.allowed_users = vec!["U1".to_string()];
        assert!(config.user_allowed("U1"));
        assert!(!config.user_allowed("U2"));
    }

    fn sample_config() -> Config {
        Config {
            database_url: "postgres://localhost/test".into(),
            port: 8080,
            slack_bot_token: "xoxb-test".into(),
            slack_signing_secret: "secret".into(),
            allowed_users: Vec::new(),
            rate_limit_enabled: true,
            rate_limit_max: 5,
            rate_limit_window: Duration::from_secs(900),
            grace_period: Duration::from_secs(300),
            worker_namespace: "default".into(),
            worker_image: "worker:latest".into(),
            worker_secret_name: None,
            session_timeout_minutes: 30,
            user_repos: HashMap::new(),
        }
    }
}
