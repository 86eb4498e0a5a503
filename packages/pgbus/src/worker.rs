//! Persistent queue consumer.
//!
//! ```text
//! BusWorker
//!     │
//!     ├─► claim batch (FOR UPDATE SKIP LOCKED, lease recovery)
//!     ├─► run handler per job (spawned, heartbeat, deadline)
//!     ├─► mark completed / failed (bus schedules retries)
//!     └─► periodic expiry sweep
//! ```
//!
//! Handler failures and panics are never fatal to the consumer; a job that
//! exhausts its retries moves to `failed` and the loop keeps going.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::FailureKind;
use crate::job::Job;
use crate::queue::MessageBus;

/// Configuration for a queue consumer.
#[derive(Debug, Clone)]
pub struct WorkOptions {
    /// Maximum jobs claimed and in flight at once.
    pub batch_size: i64,
    /// Visibility lease; an unacknowledged job returns to pending after
    /// this long.
    pub visibility_timeout: Duration,
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    /// Consumer identity recorded on claimed rows.
    pub worker_id: String,
}

impl Default for WorkOptions {
    fn default() -> Self {
        Self {
            batch_size: 5,
            visibility_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(2),
            worker_id: format!("consumer-{}", Uuid::new_v4()),
        }
    }
}

impl WorkOptions {
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }
}

/// A claimed job handed to the handler.
#[derive(Debug, Clone)]
pub struct JobContext<T> {
    pub id: Uuid,
    pub data: T,
    /// 1-based execution attempt.
    pub attempt: i32,
    pub retries_remaining: i32,
}

/// Long-running consumer bound to one queue.
pub struct BusWorker {
    bus: MessageBus,
    queue: String,
    options: WorkOptions,
    shutdown: CancellationToken,
}

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

impl BusWorker {
    pub fn new(bus: MessageBus, queue: impl Into<String>) -> Self {
        Self::with_options(bus, queue, WorkOptions::default())
    }

    pub fn with_options(
        bus: MessageBus,
        queue: impl Into<String>,
        options: WorkOptions,
    ) -> Self {
        Self {
            bus,
            queue: queue.into(),
            options,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the loop when cancelled. In-flight jobs finish
    /// before `run` returns.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the consumer until shutdown.
    ///
    /// The handler receives the deserialized payload; Ok acknowledges the
    /// job, Err hands it back to the bus for retry scheduling.
    pub async fn run<T, F, Fut>(self, handler: F) -> Result<()>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(JobContext<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        info!(
            queue = %self.queue,
            worker_id = %self.options.worker_id,
            batch_size = self.options.batch_size,
            "bus worker starting"
        );

        let handler = Arc::new(handler);
        let mut last_sweep = tokio::time::Instant::now();

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            if last_sweep.elapsed() >= SWEEP_INTERVAL {
                if let Err(e) = self.bus.sweep_expired().await {
                    warn!(error = %e, "expiry sweep failed");
                }
                last_sweep = tokio::time::Instant::now();
            }

            let jobs = match self
                .bus
                .claim(
                    &self.queue,
                    &self.options.worker_id,
                    self.options.batch_size,
                    self.options.visibility_timeout.as_secs() as i64,
                )
                .await
            {
                Ok(jobs) => jobs,
                Err(e) => {
                    error!(queue = %self.queue, error = %e, "failed to claim jobs");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            if jobs.is_empty() {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.options.poll_interval) => {}
                }
                continue;
            }

            debug!(queue = %self.queue, count = jobs.len(), "claimed jobs");

            let mut handles = Vec::with_capacity(jobs.len());
            for job in jobs {
                let bus = self.bus.clone();
                let handler = handler.clone();
                let visibility = self.options.visibility_timeout;

                // Spawned so a panicking handler takes down one job, not
                // the consumer.
                handles.push(tokio::spawn(async move {
                    process_job(bus, job, handler, visibility).await;
                }));
            }

            for result in futures::future::join_all(handles).await {
                if let Err(e) = result {
                    error!(queue = %self.queue, error = %e, "job task panicked");
                }
            }
        }

        info!(queue = %self.queue, worker_id = %self.options.worker_id, "bus worker stopped");
        Ok(())
    }
}

impl MessageBus {
    /// Register a persistent consumer on a queue (spawn-and-run shorthand
    /// for [`BusWorker`]).
    pub async fn work<T, F, Fut>(
        &self,
        queue: &str,
        options: WorkOptions,
        handler: F,
    ) -> Result<()>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(JobContext<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        BusWorker::with_options(self.clone(), queue, options)
            .run(handler)
            .await
    }
}

async fn process_job<T, F, Fut>(
    bus: MessageBus,
    job: Job,
    handler: Arc<F>,
    visibility: Duration,
) where
    T: DeserializeOwned + Send + 'static,
    F: Fn(JobContext<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let started = tokio::time::Instant::now();

    let data: T = match serde_json::from_value(job.payload.clone()) {
        Ok(data) => data,
        Err(e) => {
            error!(job_id = %job.id, queue = %job.queue_name, error = %e, "invalid payload");
            if let Err(mark_err) = bus
                .mark_failed(&job, &format!("invalid payload: {e}"), FailureKind::NonRetryable)
                .await
            {
                error!(job_id = %job.id, error = %mark_err, "failed to mark job as failed");
            }
            return;
        }
    };

    let context = JobContext {
        id: job.id,
        data,
        attempt: job.retry_count + 1,
        retries_remaining: job.retries_remaining(),
    };

    // Heartbeat keeps the lease alive for handlers that outlive it.
    let heartbeat_cancel = CancellationToken::new();
    let heartbeat = {
        let bus = bus.clone();
        let cancel = heartbeat_cancel.clone();
        let job_id = job.id;
        let lease_seconds = visibility.as_secs() as i64;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(visibility / 2);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = bus.extend_lease(job_id, lease_seconds).await {
                            warn!(job_id = %job_id, error = %e, "heartbeat failed");
                        }
                    }
                }
            }
        })
    };

    // Deadline: whichever comes first of lifetime cap and one lease window
    // extended by heartbeats up to the expiry.
    let remaining_lifetime = (job.expires_at - chrono::Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO);
    let result = tokio::time::timeout(remaining_lifetime, handler(context)).await;

    heartbeat_cancel.cancel();
    let _ = heartbeat.await;

    match result {
        Ok(Ok(())) => {
            debug!(job_id = %job.id, queue = %job.queue_name, "job completed");
            if let Err(e) = bus
                .mark_completed(&job, started.elapsed().as_millis() as u64)
                .await
            {
                error!(job_id = %job.id, error = %e, "failed to mark job as completed");
            }
        }
        Ok(Err(e)) => {
            warn!(job_id = %job.id, queue = %job.queue_name, error = %e, "job handler failed");
            if let Err(mark_err) = bus
                .mark_failed(&job, &e.to_string(), FailureKind::Retryable)
                .await
            {
                error!(job_id = %job.id, error = %mark_err, "failed to mark job as failed");
            }
        }
        Err(_) => {
            warn!(job_id = %job.id, queue = %job.queue_name, "job deadline exceeded");
            if let Err(mark_err) = bus
                .mark_failed(&job, "job deadline exceeded", FailureKind::Retryable)
                .await
            {
                error!(job_id = %job.id, error = %mark_err, "failed to mark job as failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_options_defaults() {
        let options = WorkOptions::default();
        assert_eq!(options.batch_size, 5);
        assert_eq!(options.visibility_timeout, Duration::from_secs(60));
        assert!(options.worker_id.starts_with("consumer-"));
    }

    #[test]
    fn work_options_with_worker_id() {
        let options = WorkOptions::with_worker_id("response-consumer");
        assert_eq!(options.worker_id, "response-consumer");
        assert_eq!(options.batch_size, 5);
    }
}
