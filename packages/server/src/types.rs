//! Shared payload types carried on the bus, and the routing-key helpers
//! that name queues, deployments, and singleton keys.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Queue the dispatcher publishes inbound messages to; the orchestrator is
/// its only consumer.
pub const MESSAGES_QUEUE: &str = "messages";

/// Queue workers publish progress frames to; the response consumer is its
/// only consumer.
pub const THREAD_RESPONSE_QUEUE: &str = "thread_response";

/// Normalize a platform user ID for embedding in queue and workload names:
/// lowercase, alphanumerics kept, everything else mapped to `-`.
pub fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}

/// Dedicated queue for one user's worker session.
pub fn user_queue_name(user_id: &str) -> String {
    format!("user_{}_queue", sanitize_id(user_id))
}

/// Workload name for one user's worker (the `DEPLOYMENT_NAME` conveyed to
/// the session).
pub fn worker_deployment_name(user_id: &str) -> String {
    format!("worker-{}", sanitize_id(user_id))
}

/// Singleton key making inbound enqueue idempotent per chat message.
pub fn message_singleton_key(user_id: &str, thread_id: &str, message_id: &str) -> String {
    format!("message-{user_id}-{thread_id}-{message_id}")
}

/// Per-message knobs forwarded to the agent subprocess.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentOptions {
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Overrides the worker's default subprocess timeout.
    #[serde(default)]
    pub timeout_minutes: Option<u64>,
}

/// A user utterance lifted onto the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub user_id: String,
    pub thread_id: String,
    pub channel_id: String,
    pub message_id: String,
    pub message_text: String,
    /// `ts` of the user's message; reactions land here.
    pub original_message_ts: String,
    /// `ts` of the placeholder reply; every edit targets it.
    pub placeholder_ts: String,
    #[serde(default)]
    pub platform_metadata: serde_json::Value,
    #[serde(default)]
    pub agent_options: AgentOptions,
}

impl InboundMessage {
    pub fn singleton_key(&self) -> String {
        message_singleton_key(&self.user_id, &self.thread_id, &self.message_id)
    }
}

/// An incremental or terminal response payload from a worker.
///
/// Frames carry no singleton key; they are ordered by `timestamp` and
/// applied idempotently per `(channel_id, thread_ts)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressFrame {
    pub message_id: String,
    pub channel_id: String,
    pub thread_ts: String,
    pub user_id: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub is_done: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub original_message_ts: Option<String>,
    #[serde(default)]
    pub git_branch: Option<String>,
}

impl ProgressFrame {
    fn base(message: &InboundMessage) -> Self {
        Self {
            message_id: message.message_id.clone(),
            channel_id: message.channel_id.clone(),
            thread_ts: message.placeholder_ts.clone(),
            user_id: message.user_id.clone(),
            content: None,
            error: None,
            is_done: false,
            timestamp: Utc::now(),
            original_message_ts: Some(message.original_message_ts.clone()),
            git_branch: None,
        }
    }

    pub fn progress(message: &InboundMessage, content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::base(message)
        }
    }

    pub fn done(message: &InboundMessage, content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            is_done: true,
            ..Self::base(message)
        }
    }

    pub fn failed(message: &InboundMessage, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            is_done: true,
            ..Self::base(message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> InboundMessage {
        InboundMessage {
            user_id: "U123".into(),
            thread_id: "1700000000.000100".into(),
            channel_id: "C9".into(),
            message_id: "1700000001.000200".into(),
            message_text: "fix the tests".into(),
            original_message_ts: "1700000001.000200".into(),
            placeholder_ts: "1700000002.000300".into(),
            platform_metadata: serde_json::Value::Null,
            agent_options: AgentOptions::default(),
        }
    }

    #[test]
    fn sanitize_lowercases_and_replaces_punctuation() {
        assert_eq!(sanitize_id("U123"), "u123");
        assert_eq!(sanitize_id("user@example.com"), "user-example-com");
        assert_eq!(sanitize_id("W_9.z"), "w-9-z");
    }

    #[test]
    fn routing_names() {
        assert_eq!(user_queue_name("U123"), "user_u123_queue");
        assert_eq!(worker_deployment_name("U123"), "worker-u123");
        assert_eq!(
            message_singleton_key("U1", "T1", "M1"),
            "message-U1-T1-M1"
        );
    }

    #[test]
    fn frame_constructors_target_placeholder() {
        let message = sample_message();

        let progress = ProgressFrame::progress(&message, "step 1");
        assert_eq!(progress.thread_ts, message.placeholder_ts);
        assert!(!progress.is_done);
        assert!(progress.error.is_none());

        let done = ProgressFrame::done(&message, "final");
        assert!(done.is_done);
        assert_eq!(done.content.as_deref(), Some("final"));

        let failed = ProgressFrame::failed(&message, "agent crashed");
        assert!(failed.is_done);
        assert!(failed.content.is_none());
        assert_eq!(failed.error.as_deref(), Some("agent crashed"));
        assert_eq!(
            failed.original_message_ts.as_deref(),
            Some(message.original_message_ts.as_str())
        );
    }

    #[test]
    fn inbound_message_roundtrips_with_defaults() {
        let json = serde_json::json!({
            "user_id": "U1",
            "thread_id": "T1",
            "channel_id": "C1",
            "message_id": "M1",
            "message_text": "hello",
            "original_message_ts": "1.0",
            "placeholder_ts": "2.0",
        });
        let message: InboundMessage = serde_json::from_value(json).unwrap();
        assert!(message.agent_options.extra_args.is_empty());
        assert_eq!(message.singleton_key(), "message-U1-T1-M1");
    }
}
