//! The long-lived worker session bound to one user.
//!
//! ```text
//! WorkerSession
//!     │
//!     ├─► prepare workspace (clone on first use)
//!     ├─► process bootstrap message from env, if any
//!     ├─► consume user_{id}_queue
//!     │       └─► per job: thread lock → agent subprocess → coalesced frames
//!     └─► idle watchdog: exit 0 after session timeout with an empty queue
//! ```
//!
//! Jobs for the same thread serialize on an in-process lock; distinct
//! threads may run in parallel up to the configured concurrency.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use pgbus::{BusWorker, JobContext, MessageBus, WorkOptions};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::WorkerConfig;
use crate::types::{InboundMessage, ProgressFrame};
use crate::worker::agent::AgentRunner;
use crate::worker::frames::{FrameCoalescer, FramePublisher, COALESCE_INTERVAL};
use crate::worker::workspace::Workspace;

const THINKING_TEXT: &str = "💭 thinking…";
const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(15);

pub struct WorkerSession {
    config: WorkerConfig,
    bus: MessageBus,
    workspace: Workspace,
    publisher: FramePublisher,
    /// One lock per thread; same-thread jobs serialize here.
    thread_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Message IDs already handled, so the bootstrap copy of the first
    /// message and bus redeliveries stay idempotent.
    processed: Mutex<HashSet<String>>,
    last_activity: Mutex<Instant>,
    /// Session-wide cancellation (SIGTERM path). Kills active subprocesses.
    cancel: CancellationToken,
}

impl WorkerSession {
    pub fn new(config: WorkerConfig, bus: MessageBus) -> Self {
        let workspace = Workspace::new(&config.workspace_dir);
        let publisher = FramePublisher::new(bus.clone());
        Self {
            config,
            bus,
            workspace,
            publisher,
            thread_locks: Mutex::new(HashMap::new()),
            processed: Mutex::new(HashSet::new()),
            last_activity: Mutex::new(Instant::now()),
            cancel: CancellationToken::new(),
        }
    }

    /// Run the session until idle timeout or shutdown. A clean return is
    /// the exit-0 path.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(
            user_id = %self.config.user_id,
            deployment = %self.config.deployment_name,
            queue = %self.config.queue_name,
            "worker session starting"
        );

        {
            let workspace = self.workspace.clone();
            let repository_url = self.config.repository_url.clone();
            tokio::task::spawn_blocking(move || workspace.prepare(repository_url.as_deref()))
                .await??;
        }

        // The first message can ride in on the deployment environment;
        // handle it before touching the queue. The bus is the durable
        // record of whether that message was ever enqueued, so a restarted
        // pod re-reading the same environment does not replay it.
        if let Some(bootstrap) = self.config.bootstrap.clone() {
            if self.bootstrap_already_on_bus(&bootstrap).await {
                info!(
                    message_id = %bootstrap.message_id,
                    "bootstrap message already on the bus, skipping environment copy"
                );
            } else {
                info!(message_id = %bootstrap.message_id, "processing bootstrap message");
                let _guard = self.lock_thread(&bootstrap.thread_id).await;
                self.process_message(&bootstrap).await;
            }
        }

        let consumer = BusWorker::with_options(
            self.bus.clone(),
            self.config.queue_name.clone(),
            WorkOptions {
                batch_size: self.config.concurrency.max(1) as i64,
                ..WorkOptions::with_worker_id(self.config.deployment_name.clone())
            },
        );
        let consumer_token = consumer.shutdown_token();

        let session = self.clone();
        let consumer_handle = tokio::spawn(consumer.run(move |job: JobContext<InboundMessage>| {
            let session = session.clone();
            async move {
                session.handle_job(job).await;
                Ok(())
            }
        }));

        let session_timeout = Duration::from_secs(self.config.session_timeout_minutes * 60);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("shutdown requested, draining session");
                    // Stop claiming, then cut active subprocesses loose;
                    // their jobs end in terminal error frames.
                    consumer_token.cancel();
                    self.cancel.cancel();
                    break;
                }
                _ = tokio::time::sleep(IDLE_CHECK_INTERVAL) => {
                    let idle = self.last_activity.lock().await.elapsed();
                    if idle < session_timeout {
                        continue;
                    }
                    match self.bus.queue_size(&self.config.queue_name).await {
                        Ok(0) => {
                            info!(
                                idle_secs = idle.as_secs(),
                                "session idle past timeout, exiting"
                            );
                            consumer_token.cancel();
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "idle queue check failed"),
                    }
                }
            }
        }

        consumer_handle.await??;
        info!(user_id = %self.config.user_id, "worker session stopped");
        Ok(())
    }

    /// Whether the bootstrap message's singleton key has ever been seen on
    /// the session queue, in any state. True means the orchestrator's
    /// forwarded copy exists (or already ran) and the environment copy must
    /// not be processed again.
    async fn bootstrap_already_on_bus(&self, bootstrap: &InboundMessage) -> bool {
        match self
            .bus
            .singleton_seen(&self.config.queue_name, &bootstrap.singleton_key())
            .await
        {
            Ok(seen) => seen,
            Err(e) => {
                // Fail closed: the forwarded queue copy will deliver it.
                warn!(error = %e, "bootstrap dedup check failed, deferring to the queue");
                true
            }
        }
    }

    async fn lock_thread(&self, thread_id: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.thread_locks.lock().await;
            locks
                .entry(thread_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    async fn handle_job(&self, job: JobContext<InboundMessage>) {
        let message = job.data;

        {
            let processed = self.processed.lock().await;
            if processed.contains(&message.message_id) {
                return;
            }
        }

        let _guard = self.lock_thread(&message.thread_id).await;
        self.process_message(&message).await;
    }

    /// Run the agent for one message and stream its progress.
    ///
    /// Agent failures are terminal for the message, never for the session:
    /// the outcome becomes an error frame and the job is acknowledged.
    async fn process_message(&self, message: &InboundMessage) {
        self.processed
            .lock()
            .await
            .insert(message.message_id.clone());
        *self.last_activity.lock().await = Instant::now();

        let branch = self.detect_branch().await;

        let mut coalescer = FrameCoalescer::new(COALESCE_INTERVAL);
        let mut initial = ProgressFrame::progress(message, THINKING_TEXT);
        initial.git_branch = branch.clone();
        if let Some(frame) = coalescer.offer(initial) {
            self.publisher.publish(&frame).await;
        }

        let (updates_tx, mut updates_rx) = mpsc::unbounded_channel();
        let runner_handle = {
            let command = self.config.agent_command.clone();
            let workspace_dir = self.workspace.dir().to_path_buf();
            let timeout = Duration::from_secs(
                message
                    .agent_options
                    .timeout_minutes
                    .unwrap_or(self.config.subprocess_timeout_minutes)
                    * 60,
            );
            let prompt = message.message_text.clone();
            let extra_args = message.agent_options.extra_args.clone();
            let cancel = self.cancel.child_token();

            tokio::spawn(async move {
                AgentRunner::new(command, workspace_dir, timeout)
                    .run(&prompt, &extra_args, updates_tx, cancel)
                    .await
            })
        };

        let mut ticker = tokio::time::interval(Duration::from_millis(250));
        loop {
            tokio::select! {
                update = updates_rx.recv() => match update {
                    Some(content) => {
                        let mut frame = ProgressFrame::progress(message, content);
                        frame.git_branch = branch.clone();
                        if let Some(frame) = coalescer.offer(frame) {
                            self.publisher.publish(&frame).await;
                        }
                    }
                    // Sender dropped: the subprocess is done.
                    None => break,
                },
                _ = ticker.tick() => {
                    if let Some(frame) = coalescer.due() {
                        self.publisher.publish(&frame).await;
                    }
                }
            }
        }

        let outcome = match runner_handle.await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!(message_id = %message.message_id, error = %e, "agent run failed");
                let frame = ProgressFrame::failed(message, format!("Agent failed: {e}"));
                self.publisher.publish(&frame).await;
                *self.last_activity.lock().await = Instant::now();
                return;
            }
            Err(e) => {
                warn!(message_id = %message.message_id, error = %e, "agent task panicked");
                let frame = ProgressFrame::failed(message, "Agent crashed unexpectedly.");
                self.publisher.publish(&frame).await;
                *self.last_activity.lock().await = Instant::now();
                return;
            }
        };

        // The run may have created the branch the Edit button points at.
        let branch = self.detect_branch().await;

        let mut terminal = match &outcome.error {
            Some(error) => ProgressFrame::failed(message, error.clone()),
            None if outcome.content.is_empty() => ProgressFrame::done(message, "✅ Done"),
            None => ProgressFrame::done(message, outcome.content.clone()),
        };
        terminal.git_branch = branch;
        // Terminal frames bypass the window by contract.
        if let Some(frame) = coalescer.offer(terminal) {
            self.publisher.publish(&frame).await;
        }

        *self.last_activity.lock().await = Instant::now();
    }

    async fn detect_branch(&self) -> Option<String> {
        let workspace = self.workspace.clone();
        tokio::task::spawn_blocking(move || workspace.current_branch())
            .await
            .ok()
            .flatten()
    }
}
