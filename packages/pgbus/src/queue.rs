//! The message bus: durable, transactional job queue over PostgreSQL.
//!
//! This module provides the producer and administrative surface. The
//! consumer loop lives in [`crate::worker`].

use chrono::{Duration, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{BusError, FailureKind};
use crate::events::JobEvent;
use crate::job::Job;

/// Result of an enqueue that accounts for singleton deduplication.
#[derive(Debug, Clone)]
pub enum EnqueueResult {
    /// Job was enqueued, returns the new job ID.
    Created(Uuid),
    /// An in-flight job already holds the singleton key; returns its ID.
    Duplicate(Uuid),
}

impl EnqueueResult {
    /// The job ID regardless of whether it was created or deduplicated.
    pub fn job_id(&self) -> Uuid {
        match self {
            EnqueueResult::Created(id) | EnqueueResult::Duplicate(id) => *id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueResult::Created(_))
    }
}

/// Options for [`MessageBus::send`].
#[derive(Debug, Clone)]
pub struct SendOptions {
    /// Higher priority strictly precedes lower within a queue.
    pub priority: i32,
    /// Handler failures tolerated before the job moves to `failed`.
    pub retry_limit: i32,
    /// Base retry delay; attempt n waits `retry_delay_seconds × n`.
    pub retry_delay_seconds: i32,
    /// Total lifetime cap regardless of retries.
    pub expire_in_hours: i64,
    /// Uniqueness tag across pending/active jobs on one queue.
    pub singleton_key: Option<String>,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            retry_limit: 3,
            retry_delay_seconds: 30,
            expire_in_hours: 1,
            singleton_key: None,
        }
    }
}

impl SendOptions {
    pub fn with_singleton_key(key: impl Into<String>) -> Self {
        Self {
            singleton_key: Some(key.into()),
            ..Default::default()
        }
    }
}

/// Handle to the bus. Cheap to clone; all clones share the pool and the
/// event channel.
#[derive(Clone)]
pub struct MessageBus {
    pool: PgPool,
    events: broadcast::Sender<JobEvent>,
}

impl MessageBus {
    pub fn new(pool: PgPool) -> Self {
        let (events, _) = broadcast::channel(256);
        Self { pool, events }
    }

    /// Run the bus schema migrations.
    pub async fn migrate(&self) -> Result<(), BusError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| BusError::Unavailable(e.into()))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Subscribe to job lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub(crate) fn publish_event(&self, event: JobEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    /// Enqueue a payload on a named queue.
    ///
    /// With a singleton key set, a second send while a matching job is
    /// pending or active resolves to the existing job ID.
    pub async fn send<P: Serialize>(
        &self,
        queue: &str,
        payload: &P,
        options: SendOptions,
    ) -> Result<EnqueueResult, BusError> {
        if let Some(key) = &options.singleton_key {
            if let Some(existing) =
                Job::find_in_flight_by_singleton(queue, key, &self.pool).await?
            {
                debug!(queue = %queue, key = %key, job_id = %existing.id, "singleton hit");
                return Ok(EnqueueResult::Duplicate(existing.id));
            }
        }

        let mut job = Job::builder()
            .queue_name(queue.to_string())
            .payload(serde_json::to_value(payload)?)
            .priority(options.priority)
            .retry_limit(options.retry_limit)
            .retry_delay_seconds(options.retry_delay_seconds)
            .expires_at(Utc::now() + Duration::hours(options.expire_in_hours))
            .build();
        job.singleton_key = options.singleton_key.clone();

        match job.insert(&self.pool).await {
            Ok(inserted) => {
                debug!(queue = %queue, job_id = %inserted.id, "job enqueued");
                Ok(EnqueueResult::Created(inserted.id))
            }
            Err(e) if is_singleton_violation(&e) => {
                // Lost the insert race; the winner is the job we deduplicate to.
                let key = options
                    .singleton_key
                    .as_deref()
                    .unwrap_or_default()
                    .to_string();
                match Job::find_in_flight_by_singleton(queue, &key, &self.pool).await? {
                    Some(existing) => Ok(EnqueueResult::Duplicate(existing.id)),
                    None => Err(BusError::QueueRejected {
                        queue: queue.to_string(),
                        key,
                    }),
                }
            }
            Err(e) => Err(BusError::Unavailable(e)),
        }
    }

    pub async fn get_job(&self, queue: &str, id: Uuid) -> Result<Option<Job>, BusError> {
        Ok(Job::find(queue, id, &self.pool).await?)
    }

    /// Look up the in-flight job holding a singleton key, if any. Lets
    /// producers skip side effects they would otherwise repeat before a
    /// deduplicated send.
    pub async fn find_singleton(&self, queue: &str, key: &str) -> Result<Option<Job>, BusError> {
        Ok(Job::find_in_flight_by_singleton(queue, key, &self.pool).await?)
    }

    /// Whether a singleton key was ever enqueued on a queue, terminal
    /// states included. Consumers use this to decide if a side-channel
    /// copy of a message (bootstrap environment) still needs local
    /// handling after a restart.
    pub async fn singleton_seen(&self, queue: &str, key: &str) -> Result<bool, BusError> {
        Ok(Job::find_any_by_singleton(queue, key, &self.pool)
            .await?
            .is_some())
    }

    /// Cancel a pending job. Active jobs are left to their consumer.
    pub async fn cancel(&self, queue: &str, id: Uuid) -> Result<bool, BusError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'cancelled',
                updated_at = NOW()
            WHERE queue_name = $1 AND id = $2 AND state = 'pending'
            "#,
        )
        .bind(queue)
        .bind(id)
        .execute(&self.pool)
        .await?;

        let cancelled = result.rows_affected() > 0;
        if cancelled {
            self.publish_event(JobEvent::Cancelled {
                job_id: id,
                queue: queue.to_string(),
            });
        }
        Ok(cancelled)
    }

    /// Number of pending, unexpired jobs on a queue.
    pub async fn queue_size(&self, queue: &str) -> Result<i64, BusError> {
        Ok(Job::count_pending(queue, &self.pool).await?)
    }

    /// Claim up to `limit` jobs for a consumer.
    pub(crate) async fn claim(
        &self,
        queue: &str,
        worker_id: &str,
        limit: i64,
        lease_seconds: i64,
    ) -> Result<Vec<Job>, BusError> {
        Ok(Job::claim_batch(queue, worker_id, limit, lease_seconds, &self.pool).await?)
    }

    pub(crate) async fn extend_lease(
        &self,
        id: Uuid,
        lease_seconds: i64,
    ) -> Result<(), BusError> {
        Ok(Job::extend_lease(id, lease_seconds, &self.pool).await?)
    }

    /// Acknowledge a job: handler returned Ok.
    pub(crate) async fn mark_completed(
        &self,
        job: &Job,
        duration_ms: u64,
    ) -> Result<(), BusError> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'completed',
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .execute(&self.pool)
        .await?;

        self.publish_event(JobEvent::Completed {
            job_id: job.id,
            queue: job.queue_name.clone(),
            duration_ms,
        });
        Ok(())
    }

    /// Record a handler failure.
    ///
    /// Retryable failures with attempts remaining return the job to
    /// `pending`, scheduled at the linear-backoff time; otherwise the job
    /// moves to `failed` and never blocks the queue.
    pub async fn mark_failed(
        &self,
        job: &Job,
        error: &str,
        kind: FailureKind,
    ) -> Result<(), BusError> {
        let will_retry = kind.should_retry() && job.retry_count < job.retry_limit;

        if will_retry {
            let retry_at = job.next_retry_at(Utc::now());
            sqlx::query(
                r#"
                UPDATE jobs
                SET state = 'pending',
                    retry_count = retry_count + 1,
                    next_run_at = $1,
                    lease_expires_at = NULL,
                    worker_id = NULL,
                    error_message = $2,
                    updated_at = NOW()
                WHERE id = $3
                "#,
            )
            .bind(retry_at)
            .bind(error)
            .bind(job.id)
            .execute(&self.pool)
            .await?;

            info!(
                job_id = %job.id,
                queue = %job.queue_name,
                retry_at = %retry_at,
                attempt = job.retry_count + 1,
                "job scheduled for retry"
            );
        } else {
            sqlx::query(
                r#"
                UPDATE jobs
                SET state = 'failed',
                    lease_expires_at = NULL,
                    error_message = $1,
                    updated_at = NOW()
                WHERE id = $2
                "#,
            )
            .bind(error)
            .bind(job.id)
            .execute(&self.pool)
            .await?;

            warn!(
                job_id = %job.id,
                queue = %job.queue_name,
                error = %error,
                "job moved to failed"
            );
        }

        self.publish_event(JobEvent::Failed {
            job_id: job.id,
            queue: job.queue_name.clone(),
            error: error.to_string(),
            attempt: job.retry_count + 1,
            will_retry,
        });
        Ok(())
    }

    /// Move pending/active jobs past their lifetime cap to `expired`.
    ///
    /// Returns the number of jobs swept. Consumers run this periodically;
    /// it is also safe to call ad hoc.
    pub async fn sweep_expired(&self) -> Result<u64, BusError> {
        let expired = sqlx::query_as::<_, (Uuid, String)>(
            r#"
            UPDATE jobs
            SET state = 'expired',
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE state IN ('pending', 'active')
              AND expires_at <= NOW()
            RETURNING id, queue_name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        for (job_id, queue) in &expired {
            self.publish_event(JobEvent::Expired {
                job_id: *job_id,
                queue: queue.clone(),
            });
        }

        if !expired.is_empty() {
            info!(count = expired.len(), "swept expired jobs");
        }
        Ok(expired.len() as u64)
    }
}

fn is_singleton_violation(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => db.constraint() == Some("jobs_singleton_inflight"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_result_helpers() {
        let id = Uuid::new_v4();
        let created = EnqueueResult::Created(id);
        assert!(created.is_created());
        assert_eq!(created.job_id(), id);

        let duplicate = EnqueueResult::Duplicate(id);
        assert!(!duplicate.is_created());
        assert_eq!(duplicate.job_id(), id);
    }

    #[test]
    fn send_options_defaults() {
        let options = SendOptions::default();
        assert_eq!(options.priority, 0);
        assert_eq!(options.retry_limit, 3);
        assert_eq!(options.retry_delay_seconds, 30);
        assert_eq!(options.expire_in_hours, 1);
        assert!(options.singleton_key.is_none());
    }

    #[test]
    fn send_options_singleton() {
        let options = SendOptions::with_singleton_key("message-U1-T1-M1");
        assert_eq!(options.singleton_key.as_deref(), Some("message-U1-T1-M1"));
        assert_eq!(options.retry_limit, 3);
    }
}
