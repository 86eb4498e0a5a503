//! Per-user worker reconciliation.
//!
//! ```text
//! messages queue ──► rate limit ──► ensure worker Job ──► user queue
//!                                        │
//!                              reconcile tick (30 s):
//!                              Provisioning → Active, idle → Scaled-Zero,
//!                              orphan GC, rate-limit window GC
//! ```
//!
//! The orchestrator is the sole consumer of the `messages` queue and the
//! sole writer to the workload API. Workers never see a message for another
//! user because routing happens here, onto per-user queues.

mod rate_limit;
mod workload;

pub use rate_limit::{RateLimitDecision, RateLimiter};
pub use workload::{ManagedWorkload, WorkloadManager};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use pgbus::{BusWorker, JobContext, SendOptions, WorkOptions};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::deps::ServerDeps;
use crate::types::{
    user_queue_name, worker_deployment_name, InboundMessage, ProgressFrame, MESSAGES_QUEUE,
    THREAD_RESPONSE_QUEUE,
};

const RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

/// Reconciled lifecycle of one user's worker. Absence from the map is the
/// implicit `Absent` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Workload created, waiting for a ready pod.
    Provisioning,
    Active,
    ScaledZero,
    /// Creation kept failing; next inbound message retries from scratch.
    Failed,
}

#[derive(Debug)]
struct UserWorker {
    state: WorkerState,
    last_message_at: DateTime<Utc>,
}

pub struct Orchestrator {
    deps: ServerDeps,
    workloads: WorkloadManager,
    rate_limiter: RateLimiter,
    workers: Mutex<HashMap<String, UserWorker>>,
}

impl Orchestrator {
    pub fn new(deps: ServerDeps, kube_client: kube::Client) -> Self {
        let config = &deps.config;
        let workloads = WorkloadManager::new(kube_client, &config.worker_namespace);
        let rate_limiter = RateLimiter::new(
            config.rate_limit_window,
            config.rate_limit_max,
            config.rate_limit_enabled,
        );
        Self {
            deps,
            workloads,
            rate_limiter,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Run the message router and the reconcile loop until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let consumer = BusWorker::with_options(
            self.deps.bus.clone(),
            MESSAGES_QUEUE,
            WorkOptions::with_worker_id("orchestrator"),
        );
        let consumer_token = consumer.shutdown_token();

        let router = self.clone();
        let consumer_handle = tokio::spawn(consumer.run(move |job: JobContext<InboundMessage>| {
            let orchestrator = router.clone();
            async move { orchestrator.route_message(job).await }
        }));

        info!("orchestrator started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(RECONCILE_INTERVAL) => {
                    self.reconcile().await;
                    self.rate_limiter.gc();
                }
            }
        }

        consumer_token.cancel();
        consumer_handle.await??;
        info!("orchestrator stopped");
        Ok(())
    }

    /// Handle one InboundMessage from the `messages` queue.
    async fn route_message(&self, job: JobContext<InboundMessage>) -> Result<()> {
        let message = job.data;

        match self.rate_limiter.check(&message.user_id) {
            RateLimitDecision::Allowed => {}
            RateLimitDecision::Rejected { retry_after } => {
                info!(user_id = %message.user_id, "message rejected by rate limit");
                self.emit_error_frame(
                    &message,
                    &format!(
                        "Rate limit exceeded. Please wait {} seconds before trying again.",
                        retry_after.as_secs().max(1)
                    ),
                )
                .await;
                // A rejection is a terminal answer, not a handler failure.
                return Ok(());
            }
        }

        if let Err(e) = self.ensure_worker(&message).await {
            warn!(
                user_id = %message.user_id,
                attempt = job.attempt,
                error = %e,
                "worker provisioning failed"
            );
            if job.retries_remaining == 0 {
                self.mark_failed(&message).await;
            }
            return Err(e);
        }

        // Forward onto the worker's dedicated queue; the singleton key keeps
        // redelivered routing jobs from duplicating it.
        let queue = user_queue_name(&message.user_id);
        let options = SendOptions {
            singleton_key: Some(message.singleton_key()),
            ..Default::default()
        };
        self.deps.bus.send(&queue, &message, options).await?;

        Ok(())
    }

    /// Bring the user's worker to (at least) Provisioning with one replica.
    async fn ensure_worker(&self, message: &InboundMessage) -> Result<()> {
        let user_id = &message.user_id;
        let mut workers = self.workers.lock().await;

        match workers.get(user_id).map(|w| w.state) {
            None | Some(WorkerState::Failed) => {
                // First sighting (or a retry after Failed): full template,
                // bootstrap message rides in the environment.
                self.workloads
                    .activate(&self.deps.config, user_id, Some(message))
                    .await?;
                workers.insert(
                    user_id.clone(),
                    UserWorker {
                        state: WorkerState::Provisioning,
                        last_message_at: Utc::now(),
                    },
                );
                info!(user_id = %user_id, "worker provisioning");
            }
            Some(WorkerState::ScaledZero) => {
                self.workloads.activate(&self.deps.config, user_id, None).await?;
                if let Some(worker) = workers.get_mut(user_id) {
                    worker.state = WorkerState::Provisioning;
                    worker.last_message_at = Utc::now();
                }
                info!(user_id = %user_id, "worker scaled back up");
            }
            Some(WorkerState::Provisioning) | Some(WorkerState::Active) => {
                // Touches the activity annotation, and replaces the Job if
                // the worker already took the self-exit fast path.
                self.workloads.activate(&self.deps.config, user_id, None).await?;
                if let Some(worker) = workers.get_mut(user_id) {
                    worker.last_message_at = Utc::now();
                }
            }
        }

        Ok(())
    }

    async fn mark_failed(&self, message: &InboundMessage) {
        {
            let mut workers = self.workers.lock().await;
            if let Some(worker) = workers.get_mut(&message.user_id) {
                worker.state = WorkerState::Failed;
            }
        }
        error!(user_id = %message.user_id, "worker marked failed");
        self.emit_error_frame(
            message,
            "Could not start a worker for your request. Please try again later.",
        )
        .await;
    }

    async fn emit_error_frame(&self, message: &InboundMessage, text: &str) {
        let frame = ProgressFrame::failed(message, text);
        if let Err(e) = self
            .deps
            .bus
            .send(THREAD_RESPONSE_QUEUE, &frame, SendOptions::default())
            .await
        {
            error!(user_id = %message.user_id, error = %e, "failed to emit error frame");
        }
    }

    /// One reconcile pass: promote provisioned workers, scale down idle
    /// ones, collect orphans.
    async fn reconcile(&self) {
        let grace = self.deps.config.grace_period;
        let snapshot: Vec<(String, WorkerState, DateTime<Utc>)> = {
            let workers = self.workers.lock().await;
            workers
                .iter()
                .map(|(user, worker)| (user.clone(), worker.state, worker.last_message_at))
                .collect()
        };

        for (user_id, state, last_message_at) in snapshot {
            match state {
                WorkerState::Provisioning => {
                    match self.workloads.ready_pods(&user_id).await {
                        Ok(ready) if ready >= 1 => {
                            self.set_state(&user_id, WorkerState::Active).await;
                            info!(user_id = %user_id, "worker active");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(user_id = %user_id, error = %e, "readiness check failed")
                        }
                    }
                }
                WorkerState::Active => {
                    let idle = Utc::now().signed_duration_since(last_message_at);
                    if idle.to_std().unwrap_or_default() <= grace {
                        continue;
                    }
                    let queue = user_queue_name(&user_id);
                    match self.deps.bus.queue_size(&queue).await {
                        Ok(0) => {
                            if let Err(e) = self.workloads.deactivate(&user_id).await {
                                warn!(user_id = %user_id, error = %e, "scale down failed");
                            } else {
                                self.set_state(&user_id, WorkerState::ScaledZero).await;
                                info!(user_id = %user_id, "worker scaled to zero after idle grace");
                            }
                        }
                        Ok(_) => {}
                        Err(e) => warn!(user_id = %user_id, error = %e, "queue size check failed"),
                    }
                }
                WorkerState::ScaledZero | WorkerState::Failed => {}
            }
        }

        self.collect_orphans().await;
    }

    async fn set_state(&self, user_id: &str, state: WorkerState) {
        let mut workers = self.workers.lock().await;
        if let Some(worker) = workers.get_mut(user_id) {
            worker.state = state;
        }
    }

    /// Delete managed workloads nobody is tracking once they have been
    /// quiet for two grace periods and their queue is drained. Covers
    /// worker jobs stranded by an orchestrator restart.
    async fn collect_orphans(&self) {
        let cutoff = 2 * self.deps.config.grace_period;
        let managed = match self.workloads.list_managed().await {
            Ok(managed) => managed,
            Err(e) => {
                warn!(error = %e, "orphan scan failed");
                return;
            }
        };

        let tracked: Vec<String> = {
            let workers = self.workers.lock().await;
            workers.keys().map(|u| worker_deployment_name(u)).collect()
        };

        for workload in managed {
            if tracked.contains(&workload.name) {
                continue;
            }
            let quiet_for = workload
                .last_message_at
                .map(|at| Utc::now().signed_duration_since(at).to_std().unwrap_or_default())
                .unwrap_or(cutoff);
            if quiet_for < cutoff {
                continue;
            }
            if let Some(user_id) = &workload.user_id {
                if let Ok(size) = self.deps.bus.queue_size(&user_queue_name(user_id)).await {
                    if size > 0 {
                        continue;
                    }
                }
            }
            info!(job = %workload.name, "collecting orphan worker job");
            if let Err(e) = self.workloads.delete(&workload.name).await {
                warn!(job = %workload.name, error = %e, "orphan delete failed");
            }
        }
    }

    /// Admin action: forget and delete a user's worker.
    pub async fn delete_worker(&self, user_id: &str) -> Result<()> {
        self.workers.lock().await.remove(user_id);
        self.workloads
            .delete(&worker_deployment_name(user_id))
            .await
    }
}
