//! Applies progress frames to the chat surface.
//!
//! ```text
//! thread_response ──► per-(channel, thread) single-flight
//!                         │ drop frames older than last applied
//!                         ▼
//!                  render → edit message → reaction transitions
//! ```
//!
//! Everything here is idempotent: edits target a fixed `ts`, reaction calls
//! tolerate the current state, and a redelivered frame re-applies cleanly.

mod render;

pub use render::{render_content, RenderedMessage, MAX_BLOCKS, MAX_BUTTON_VALUE_LEN, MAX_TEXT_LEN};

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use pgbus::{BusWorker, JobContext, WorkOptions};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::deps::ServerDeps;
use crate::types::{ProgressFrame, THREAD_RESPONSE_QUEUE};

const REACTION_PROCESSING: &str = "gear";
const REACTION_DONE: &str = "white_check_mark";
const REACTION_ERROR: &str = "x";

/// Monotonic timestamp guard for one `(channel, thread)`.
#[derive(Debug, Default)]
struct ApplyState {
    last_applied: Option<DateTime<Utc>>,
}

impl ApplyState {
    /// Equal timestamps pass so a partially applied frame can be retried.
    fn should_apply(&self, timestamp: DateTime<Utc>) -> bool {
        self.last_applied.map_or(true, |last| timestamp >= last)
    }

    fn mark(&mut self, timestamp: DateTime<Utc>) {
        self.last_applied = Some(timestamp);
    }
}

pub struct ResponseConsumer {
    deps: ServerDeps,
    states: Mutex<HashMap<(String, String), Arc<Mutex<ApplyState>>>>,
}

impl ResponseConsumer {
    pub fn new(deps: ServerDeps) -> Self {
        Self {
            deps,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let worker = BusWorker::with_options(
            self.deps.bus.clone(),
            THREAD_RESPONSE_QUEUE,
            WorkOptions::with_worker_id("response-consumer"),
        );
        let token = worker.shutdown_token();

        let consumer = self.clone();
        let handle = tokio::spawn(worker.run(move |job: JobContext<ProgressFrame>| {
            let consumer = consumer.clone();
            async move { consumer.handle_frame(job.data).await }
        }));

        info!("response consumer started");
        shutdown.cancelled().await;
        token.cancel();
        handle.await??;
        info!("response consumer stopped");
        Ok(())
    }

    async fn state_for(&self, frame: &ProgressFrame) -> Arc<Mutex<ApplyState>> {
        let key = (frame.channel_id.clone(), frame.thread_ts.clone());
        let mut states = self.states.lock().await;
        states.entry(key).or_default().clone()
    }

    /// Apply one frame: content rendering, message edit, reactions.
    async fn handle_frame(&self, frame: ProgressFrame) -> Result<()> {
        let state_lock = self.state_for(&frame).await;
        let mut state = state_lock.lock().await;

        if !state.should_apply(frame.timestamp) {
            debug!(
                channel = %frame.channel_id,
                thread_ts = %frame.thread_ts,
                "dropping stale frame"
            );
            return Ok(());
        }

        let body = match (&frame.error, &frame.content) {
            (Some(error), _) => format!("❌ {error}"),
            (None, Some(content)) => content.clone(),
            (None, None) => String::new(),
        };

        if !body.is_empty() {
            let mut rendered = render_content(&body);

            if let (Some(branch), Some(slug)) = (
                frame.git_branch.as_deref(),
                self.deps.config.repo_for_user(&frame.user_id),
            ) {
                rendered.push_link_button(
                    "Edit",
                    "edit_branch",
                    &format!("https://github.com/{slug}/tree/{branch}"),
                );
            }

            let update = self
                .deps
                .slack
                .update_message(
                    &frame.channel_id,
                    &frame.thread_ts,
                    &rendered.text,
                    Some(&rendered.blocks),
                )
                .await;

            match update {
                Ok(()) => {}
                Err(e) if e.is_validation() => {
                    // Not retryable: replace with a plain-text notice and ack.
                    warn!(
                        channel = %frame.channel_id,
                        thread_ts = %frame.thread_ts,
                        error = %e,
                        "chat rejected rendered message, falling back to plain text"
                    );
                    let notice = format!("⚠️ The response could not be displayed ({e}).");
                    if let Err(fallback_err) = self
                        .deps
                        .slack
                        .update_message(&frame.channel_id, &frame.thread_ts, &notice, None)
                        .await
                    {
                        warn!(error = %fallback_err, "plain-text fallback failed too");
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.apply_reactions(&frame).await?;
        state.mark(frame.timestamp);
        Ok(())
    }

    /// Reaction transitions on the user's original message:
    /// content → `gear`, done → `white_check_mark`, error → `x`.
    async fn apply_reactions(&self, frame: &ProgressFrame) -> Result<()> {
        let Some(original_ts) = frame.original_message_ts.as_deref() else {
            return Ok(());
        };
        let channel = &frame.channel_id;
        let slack = &self.deps.slack;

        if frame.is_done {
            self.reaction(slack.remove_reaction(channel, original_ts, REACTION_PROCESSING))
                .await?;
            let name = if frame.error.is_some() {
                REACTION_ERROR
            } else {
                REACTION_DONE
            };
            self.reaction(slack.add_reaction(channel, original_ts, name))
                .await?;
        } else if frame.content.is_some() {
            self.reaction(slack.add_reaction(channel, original_ts, REACTION_PROCESSING))
                .await?;
        }
        Ok(())
    }

    /// Transient reaction failures bubble for a bus retry; anything else is
    /// logged and tolerated so reactions can never wedge a thread.
    async fn reaction(
        &self,
        call: impl std::future::Future<Output = Result<(), slack::SlackError>>,
    ) -> Result<()> {
        match call.await {
            Ok(()) => Ok(()),
            Err(e) if e.is_retryable() => Err(e.into()),
            Err(e) => {
                warn!(error = %e, "non-retryable reaction failure ignored");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn fresh_state_applies_anything() {
        let state = ApplyState::default();
        assert!(state.should_apply(Utc::now()));
    }

    #[test]
    fn older_frames_are_dropped() {
        let now = Utc::now();
        let mut state = ApplyState::default();
        state.mark(now);

        assert!(!state.should_apply(now - Duration::seconds(1)));
        assert!(state.should_apply(now));
        assert!(state.should_apply(now + Duration::seconds(1)));
    }

    #[test]
    fn applied_timestamps_are_monotonic() {
        let now = Utc::now();
        let mut state = ApplyState::default();

        state.mark(now);
        state.mark(now + Duration::seconds(2));
        assert!(!state.should_apply(now + Duration::seconds(1)));
        assert!(state.should_apply(now + Duration::seconds(2)));
    }
}
