//! Thin client for the Slack Web API using direct HTTP calls.
//!
//! Covers the surface the platform needs: posting and editing messages,
//! reaction add/remove, and request signature verification for the events
//! endpoint.

use std::time::Duration;

use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Serialize;
use sha2::Sha256;
use thiserror::Error;
use tracing::warn;

pub mod models;

use models::{
    ApiResponse, Block, MessageEvent, PostMessageRequest, PostedMessage, ReactionRequest,
    RepliesResponse, UpdateMessageRequest,
};

const SLACK_API_URL: &str = "https://slack.com/api";

/// Vendor validation errors that must not be retried.
const NON_RETRYABLE: &[&str] = &[
    "invalid_blocks",
    "msg_too_long",
    "invalid_blocks_format",
    "channel_not_found",
    "message_not_found",
];

/// Reaction idempotency: adding a present reaction or removing an absent one.
const REACTION_NOOPS: &[&str] = &["already_reacted", "no_reaction"];

#[derive(Debug, Error)]
pub enum SlackError {
    #[error("request to Slack failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Slack API error: {code}")]
    Api { code: String },

    #[error("Slack rate limited, retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },

    #[error("Slack auth rejected: {code}")]
    Auth { code: String },
}

impl SlackError {
    /// Validation failures (`invalid_blocks`, `msg_too_long`, …) that retrying
    /// cannot fix.
    pub fn is_validation(&self) -> bool {
        matches!(self, SlackError::Api { code } if NON_RETRYABLE.contains(&code.as_str()))
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            SlackError::Http(_) | SlackError::RateLimited { .. } => true,
            SlackError::Auth { .. } => false,
            SlackError::Api { .. } => !self.is_validation(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SlackOptions {
    pub bot_token: String,
    pub signing_secret: String,
}

/// Slack Web API client. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SlackClient {
    client: Client,
    options: SlackOptions,
}

impl SlackClient {
    pub fn new(options: SlackOptions) -> Result<Self, SlackError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client, options })
    }

    async fn call<T: Serialize>(&self, method: &str, body: &T) -> Result<ApiResponse, SlackError> {
        let url = format!("{SLACK_API_URL}/{method}");
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.options.bot_token)
            .json(body)
            .send()
            .await?;

        if response.status().as_u16() == 429 {
            let retry_after_seconds = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(30);
            return Err(SlackError::RateLimited {
                retry_after_seconds,
            });
        }

        let parsed: ApiResponse = response.json().await?;
        if parsed.ok {
            return Ok(parsed);
        }

        let code = parsed.error.unwrap_or_else(|| "unknown_error".to_string());
        if code == "invalid_auth" || code == "token_revoked" || code == "account_inactive" {
            return Err(SlackError::Auth { code });
        }
        Err(SlackError::Api { code })
    }

    /// Post a message, optionally as a thread reply. Returns the message `ts`
    /// used as the edit target for every later update.
    pub async fn post_message(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
        text: &str,
        blocks: Option<&[Block]>,
    ) -> Result<PostedMessage, SlackError> {
        let response = self
            .call(
                "chat.postMessage",
                &PostMessageRequest {
                    channel,
                    text,
                    thread_ts,
                    blocks,
                },
            )
            .await?;

        Ok(PostedMessage {
            channel: response.channel.unwrap_or_else(|| channel.to_string()),
            ts: response.ts.unwrap_or_default(),
        })
    }

    /// Edit a message in place by `(channel, ts)`. Re-applying the same edit
    /// is harmless, which is what makes frame delivery at-least-once safe.
    pub async fn update_message(
        &self,
        channel: &str,
        ts: &str,
        text: &str,
        blocks: Option<&[Block]>,
    ) -> Result<(), SlackError> {
        self.call(
            "chat.update",
            &UpdateMessageRequest {
                channel,
                ts,
                text,
                blocks,
            },
        )
        .await?;
        Ok(())
    }

    /// Add a reaction; adding one that is already present is a no-op.
    pub async fn add_reaction(
        &self,
        channel: &str,
        timestamp: &str,
        name: &str,
    ) -> Result<(), SlackError> {
        self.reaction_call("reactions.add", channel, timestamp, name)
            .await
    }

    /// Remove a reaction; removing one that is absent is a no-op.
    pub async fn remove_reaction(
        &self,
        channel: &str,
        timestamp: &str,
        name: &str,
    ) -> Result<(), SlackError> {
        self.reaction_call("reactions.remove", channel, timestamp, name)
            .await
    }

    /// Fetch replies of a thread, root included. Used to decide whether the
    /// bot has already claimed a thread.
    pub async fn conversation_replies(
        &self,
        channel: &str,
        thread_ts: &str,
        limit: u32,
    ) -> Result<Vec<MessageEvent>, SlackError> {
        let url = format!("{SLACK_API_URL}/conversations.replies");
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.options.bot_token)
            .query(&[
                ("channel", channel),
                ("ts", thread_ts),
                ("limit", &limit.to_string()),
            ])
            .send()
            .await?;

        let parsed: RepliesResponse = response.json().await?;
        if !parsed.ok {
            let code = parsed.error.unwrap_or_else(|| "unknown_error".to_string());
            return Err(SlackError::Api { code });
        }
        Ok(parsed.messages.unwrap_or_default())
    }

    async fn reaction_call(
        &self,
        method: &str,
        channel: &str,
        timestamp: &str,
        name: &str,
    ) -> Result<(), SlackError> {
        let result = self
            .call(
                method,
                &ReactionRequest {
                    channel,
                    timestamp,
                    name,
                },
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(SlackError::Api { code }) if REACTION_NOOPS.contains(&code.as_str()) => {
                warn!(method = %method, code = %code, "reaction already in desired state");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Verify a request against the signing secret.
    ///
    /// Signature scheme: `v0=` + hex HMAC-SHA256 of `v0:{timestamp}:{body}`.
    /// Requests older than five minutes are rejected to bound replays.
    pub fn verify_signature(&self, timestamp: &str, body: &str, signature: &str) -> bool {
        verify_signature(&self.options.signing_secret, timestamp, body, signature)
    }
}

/// Standalone form of [`SlackClient::verify_signature`].
pub fn verify_signature(secret: &str, timestamp: &str, body: &str, signature: &str) -> bool {
    let Ok(ts) = timestamp.parse::<i64>() else {
        return false;
    };
    let age = (chrono::Utc::now().timestamp() - ts).abs();
    if age > 300 {
        return false;
    }

    let Some(hex_sig) = signature.strip_prefix("v0=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };

    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(format!("v0:{timestamp}:{body}").as_bytes());
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, timestamp: &str, body: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("v0:{timestamp}:{body}").as_bytes());
        format!("v0={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn signature_roundtrip_verifies() {
        let secret = "8f742231b10e8888abcd99yyyzzz85a5";
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let body = r#"{"type":"url_verification","challenge":"x"}"#;

        let signature = sign(secret, &timestamp, body);
        assert!(verify_signature(secret, &timestamp, body, &signature));
    }

    #[test]
    fn tampered_body_fails_verification() {
        let secret = "secret";
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let signature = sign(secret, &timestamp, "original");
        assert!(!verify_signature(secret, &timestamp, "tampered", &signature));
    }

    #[test]
    fn stale_timestamp_fails_verification() {
        let secret = "secret";
        let timestamp = (chrono::Utc::now().timestamp() - 600).to_string();
        let body = "body";
        let signature = sign(secret, &timestamp, body);
        assert!(!verify_signature(secret, &timestamp, body, &signature));
    }

    #[test]
    fn malformed_signature_fails_verification() {
        let timestamp = chrono::Utc::now().timestamp().to_string();
        assert!(!verify_signature("secret", &timestamp, "body", "nope"));
        assert!(!verify_signature("secret", &timestamp, "body", "v0=zz"));
        assert!(!verify_signature("secret", "not-a-number", "body", "v0=00"));
    }

    #[test]
    fn validation_errors_are_not_retryable() {
        let error = SlackError::Api {
            code: "invalid_blocks".into(),
        };
        assert!(error.is_validation());
        assert!(!error.is_retryable());

        let error = SlackError::Api {
            code: "msg_too_long".into(),
        };
        assert!(error.is_validation());
    }

    #[test]
    fn rate_limits_are_retryable() {
        let error = SlackError::RateLimited {
            retry_after_seconds: 30,
        };
        assert!(error.is_retryable());
        assert!(!error.is_validation());
    }

    #[test]
    fn auth_errors_are_terminal() {
        let error = SlackError::Auth {
            code: "invalid_auth".into(),
        };
        assert!(!error.is_retryable());
    }
}
