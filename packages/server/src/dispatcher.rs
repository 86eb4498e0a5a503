//! Stateless translator from chat events to bus jobs.
//!
//! ```text
//! chat event ──► allowlist ──► placeholder reply ──► enqueue InboundMessage
//! ```
//!
//! The placeholder is posted before the enqueue so every later frame has a
//! known edit target. Enqueueing is idempotent per chat message via the
//! singleton key, so platform redeliveries never produce duplicate jobs.

use anyhow::{Context, Result};
use pgbus::SendOptions;
use slack::models::{ChatEvent, MessageEvent};
use tracing::{debug, info, warn};

use crate::deps::ServerDeps;
use crate::types::{message_singleton_key, InboundMessage, MESSAGES_QUEUE};

const PLACEHOLDER_TEXT: &str = "⏳ Working on it…";
const ENQUEUE_FAILED_TEXT: &str =
    "Something went wrong queueing your request. Please try again.";

pub struct Dispatcher {
    deps: ServerDeps,
}

impl Dispatcher {
    pub fn new(deps: ServerDeps) -> Self {
        Self { deps }
    }

    /// Handle one delivered chat event end to end.
    ///
    /// Returns Ok for events that are deliberately ignored; an Err means the
    /// event was actionable and failed before the placeholder existed, so a
    /// platform redelivery is welcome.
    pub async fn handle_event(&self, event: ChatEvent) -> Result<()> {
        let (message, is_mention) = match event {
            ChatEvent::AppMention(message) => (message, true),
            ChatEvent::Message(message) => (message, false),
            ChatEvent::Other => return Ok(()),
        };

        if !message.is_actionable() {
            debug!(ts = %message.ts, "skipping bot or subtype message");
            return Ok(());
        }
        let Some(user_id) = message.user.clone() else {
            return Ok(());
        };

        if !self.deps.config.user_allowed(&user_id) {
            info!(user_id = %user_id, "user not on allowlist, ignoring");
            return Ok(());
        }

        // Plain messages only count when they reply into a thread the bot
        // already claimed; mentions always start or continue one.
        if !is_mention && !self.thread_is_claimed(&message).await {
            debug!(ts = %message.ts, "reply in unclaimed thread, ignoring");
            return Ok(());
        }

        let thread_id = message.thread_root().to_string();

        // A redelivered event must not post a second placeholder; the
        // singleton key tells us the message is already in flight.
        let singleton_key = message_singleton_key(&user_id, &thread_id, &message.ts);
        if let Ok(Some(existing)) = self
            .deps
            .bus
            .find_singleton(MESSAGES_QUEUE, &singleton_key)
            .await
        {
            debug!(job_id = %existing.id, "event already enqueued, skipping");
            return Ok(());
        }

        // Placeholder first: the worker streams into its ts.
        let placeholder = self
            .deps
            .slack
            .post_message(&message.channel, Some(&thread_id), PLACEHOLDER_TEXT, None)
            .await
            .context("failed to post placeholder reply")?;

        let inbound = InboundMessage {
            user_id: user_id.clone(),
            thread_id,
            channel_id: message.channel.clone(),
            message_id: message.ts.clone(),
            message_text: strip_mentions(&message.text),
            original_message_ts: message.ts.clone(),
            placeholder_ts: placeholder.ts.clone(),
            platform_metadata: serde_json::Value::Null,
            agent_options: Default::default(),
        };

        let options = SendOptions {
            singleton_key: Some(inbound.singleton_key()),
            ..Default::default()
        };

        match self.deps.bus.send(MESSAGES_QUEUE, &inbound, options).await {
            Ok(result) => {
                info!(
                    user_id = %user_id,
                    job_id = %result.job_id(),
                    deduplicated = !result.is_created(),
                    "inbound message enqueued"
                );
                Ok(())
            }
            Err(e) => {
                // The placeholder already exists; turn it into the error
                // surface instead of leaving a dangling hourglass.
                warn!(user_id = %user_id, error = %e, "enqueue failed after placeholder");
                if let Err(edit_err) = self
                    .deps
                    .slack
                    .update_message(
                        &placeholder.channel,
                        &placeholder.ts,
                        ENQUEUE_FAILED_TEXT,
                        None,
                    )
                    .await
                {
                    warn!(error = %edit_err, "failed to edit placeholder to error notice");
                }
                Err(e.into())
            }
        }
    }

    /// A thread is claimed once the bot has replied in it (the placeholder
    /// of an earlier mention, or any streamed response).
    async fn thread_is_claimed(&self, message: &MessageEvent) -> bool {
        let Some(thread_ts) = message.thread_ts.as_deref() else {
            return false;
        };

        match self
            .deps
            .slack
            .conversation_replies(&message.channel, thread_ts, 20)
            .await
        {
            Ok(replies) => replies.iter().any(|reply| reply.bot_id.is_some()),
            Err(e) => {
                warn!(thread_ts = %thread_ts, error = %e, "failed to inspect thread, ignoring reply");
                false
            }
        }
    }
}

/// Remove `<@U…>` mention tokens, collapsing the whitespace they leave.
fn strip_mentions(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("<@") {
        if let Some(end) = rest[start..].find('>') {
            out.push_str(&rest[..start]);
            rest = &rest[start + end + 1..];
        } else {
            break;
        }
    }
    out.push_str(rest);
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_mentions_removes_tokens() {
        assert_eq!(strip_mentions("<@B0ABC> fix the tests"), "fix the tests");
        assert_eq!(
            strip_mentions("please <@B0ABC> look at <@U9> this"),
            "please look at this"
        );
        assert_eq!(strip_mentions("no mentions here"), "no mentions here");
    }

    #[test]
    fn strip_mentions_tolerates_unclosed_token() {
        assert_eq!(strip_mentions("broken <@U123 text"), "broken <@U123 text");
    }
}
