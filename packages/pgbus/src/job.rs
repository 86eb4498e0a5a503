//! Job row model and row-level SQL.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use typed_builder::TypedBuilder;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_state", rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Pending,
    Active,
    Completed,
    Failed,
    Expired,
    Cancelled,
}

impl JobState {
    /// States that count against a singleton key.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, JobState::Pending | JobState::Active)
    }
}

/// One row on the bus.
///
/// Queues are lazy: a queue exists as soon as a job names it. Priority is an
/// integer where higher strictly precedes lower; ties are FIFO by
/// `created_at`.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    pub queue_name: String,
    pub payload: serde_json::Value,

    #[builder(default = 0)]
    pub priority: i32,
    #[builder(default)]
    pub state: JobState,

    #[builder(default = 3)]
    pub retry_limit: i32,
    #[builder(default = 0)]
    pub retry_count: i32,
    #[builder(default = 30)]
    pub retry_delay_seconds: i32,

    #[builder(default, setter(strip_option))]
    pub next_run_at: Option<DateTime<Utc>>,
    #[builder(default = Utc::now() + Duration::hours(1))]
    pub expires_at: DateTime<Utc>,

    #[builder(default, setter(strip_option))]
    pub singleton_key: Option<String>,

    #[builder(default, setter(strip_option))]
    pub lease_expires_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub worker_id: Option<String>,

    #[builder(default, setter(strip_option))]
    pub error_message: Option<String>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Attempts left before the job dead-ends in `failed`.
    pub fn retries_remaining(&self) -> i32 {
        (self.retry_limit - self.retry_count).max(0)
    }

    /// When the next retry of this job should run.
    ///
    /// Linear backoff: `retry_delay_seconds × (retry_count + 1)`, so the
    /// first retry waits one full delay.
    pub fn next_retry_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let factor = i64::from(self.retry_count) + 1;
        now + Duration::seconds(i64::from(self.retry_delay_seconds) * factor)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub async fn insert(&self, pool: &PgPool) -> Result<Job, sqlx::Error> {
        sqlx::query_as::<_, Job>(
            r#"
            INSERT INTO jobs (
                id, queue_name, payload, priority, state,
                retry_limit, retry_count, retry_delay_seconds,
                next_run_at, expires_at, singleton_key,
                lease_expires_at, worker_id, error_message,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            RETURNING id, queue_name, payload, priority, state,
                      retry_limit, retry_count, retry_delay_seconds,
                      next_run_at, expires_at, singleton_key,
                      lease_expires_at, worker_id, error_message,
                      created_at, updated_at
            "#,
        )
        .bind(self.id)
        .bind(&self.queue_name)
        .bind(&self.payload)
        .bind(self.priority)
        .bind(self.state)
        .bind(self.retry_limit)
        .bind(self.retry_count)
        .bind(self.retry_delay_seconds)
        .bind(self.next_run_at)
        .bind(self.expires_at)
        .bind(&self.singleton_key)
        .bind(self.lease_expires_at)
        .bind(&self.worker_id)
        .bind(&self.error_message)
        .bind(self.created_at)
        .bind(self.updated_at)
        .fetch_one(pool)
        .await
    }

    pub async fn find(
        queue: &str,
        id: Uuid,
        pool: &PgPool,
    ) -> Result<Option<Job>, sqlx::Error> {
        sqlx::query_as::<_, Job>(
            r#"
            SELECT id, queue_name, payload, priority, state,
                   retry_limit, retry_count, retry_delay_seconds,
                   next_run_at, expires_at, singleton_key,
                   lease_expires_at, worker_id, error_message,
                   created_at, updated_at
            FROM jobs
            WHERE queue_name = $1 AND id = $2
            "#,
        )
        .bind(queue)
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    /// Find an in-flight job holding the given singleton key.
    pub async fn find_in_flight_by_singleton(
        queue: &str,
        key: &str,
        pool: &PgPool,
    ) -> Result<Option<Job>, sqlx::Error> {
        sqlx::query_as::<_, Job>(
            r#"
            SELECT id, queue_name, payload, priority, state,
                   retry_limit, retry_count, retry_delay_seconds,
                   next_run_at, expires_at, singleton_key,
                   lease_expires_at, worker_id, error_message,
                   created_at, updated_at
            FROM jobs
            WHERE queue_name = $1
              AND singleton_key = $2
              AND state IN ('pending', 'active')
            LIMIT 1
            "#,
        )
        .bind(queue)
        .bind(key)
        .fetch_optional(pool)
        .await
    }

    /// Find the newest job holding the given singleton key in any state.
    ///
    /// Unlike [`Job::find_in_flight_by_singleton`] this also sees terminal
    /// rows, so producers can tell "never enqueued" apart from "already
    /// handled".
    pub async fn find_any_by_singleton(
        queue: &str,
        key: &str,
        pool: &PgPool,
    ) -> Result<Option<Job>, sqlx::Error> {
        sqlx::query_as::<_, Job>(
            r#"
            SELECT id, queue_name, payload, priority, state,
                   retry_limit, retry_count, retry_delay_seconds,
                   next_run_at, expires_at, singleton_key,
                   lease_expires_at, worker_id, error_message,
                   created_at, updated_at
            FROM jobs
            WHERE queue_name = $1
              AND singleton_key = $2
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(queue)
        .bind(key)
        .fetch_optional(pool)
        .await
    }

    /// Claim up to `limit` jobs atomically with FOR UPDATE SKIP LOCKED.
    ///
    /// Also recovers `active` jobs whose visibility lease has lapsed, which
    /// is what returns unacknowledged work to circulation.
    pub async fn claim_batch(
        queue: &str,
        worker_id: &str,
        limit: i64,
        lease_seconds: i64,
        pool: &PgPool,
    ) -> Result<Vec<Job>, sqlx::Error> {
        sqlx::query_as::<_, Job>(
            r#"
            WITH next_jobs AS (
                SELECT id
                FROM jobs
                WHERE queue_name = $1
                  AND expires_at > NOW()
                  AND (
                        (state = 'pending' AND (next_run_at IS NULL OR next_run_at <= NOW()))
                     OR (state = 'active' AND lease_expires_at < NOW())
                  )
                ORDER BY priority DESC, created_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET state = 'active',
                lease_expires_at = NOW() + ($3 || ' seconds')::INTERVAL,
                worker_id = $4,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM next_jobs)
            RETURNING id, queue_name, payload, priority, state,
                      retry_limit, retry_count, retry_delay_seconds,
                      next_run_at, expires_at, singleton_key,
                      lease_expires_at, worker_id, error_message,
                      created_at, updated_at
            "#,
        )
        .bind(queue)
        .bind(limit)
        .bind(lease_seconds.to_string())
        .bind(worker_id)
        .fetch_all(pool)
        .await
    }

    /// Extend the visibility lease of a running job (heartbeat).
    pub async fn extend_lease(
        id: Uuid,
        lease_seconds: i64,
        pool: &PgPool,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET lease_expires_at = NOW() + ($1 || ' seconds')::INTERVAL,
                updated_at = NOW()
            WHERE id = $2 AND state = 'active'
            "#,
        )
        .bind(lease_seconds.to_string())
        .bind(id)
        .execute(pool)
        .await?;

        Ok(())
    }

    pub async fn count_pending(queue: &str, pool: &PgPool) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM jobs
            WHERE queue_name = $1
              AND state = 'pending'
              AND expires_at > NOW()
            "#,
        )
        .bind(queue)
        .fetch_one(pool)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> Job {
        Job::builder()
            .queue_name("messages")
            .payload(serde_json::json!({"user_id": "U1"}))
            .build()
    }

    #[test]
    fn builder_defaults() {
        let job = sample_job();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.priority, 0);
        assert_eq!(job.retry_limit, 3);
        assert_eq!(job.retry_delay_seconds, 30);
        assert!(job.singleton_key.is_none());
        assert!(job.expires_at > Utc::now());
    }

    #[test]
    fn retries_remaining_counts_down() {
        let mut job = sample_job();
        assert_eq!(job.retries_remaining(), 3);
        job.retry_count = 2;
        assert_eq!(job.retries_remaining(), 1);
        job.retry_count = 5;
        assert_eq!(job.retries_remaining(), 0);
    }

    #[test]
    fn retry_backoff_is_linear_from_zero() {
        let mut job = sample_job();
        let now = Utc::now();

        // First failure (retry_count still 0) waits one full delay.
        assert_eq!(job.next_retry_at(now), now + Duration::seconds(30));

        job.retry_count = 2;
        assert_eq!(job.next_retry_at(now), now + Duration::seconds(90));
    }

    #[test]
    fn in_flight_states() {
        assert!(JobState::Pending.is_in_flight());
        assert!(JobState::Active.is_in_flight());
        assert!(!JobState::Completed.is_in_flight());
        assert!(!JobState::Failed.is_in_flight());
        assert!(!JobState::Expired.is_in_flight());
        assert!(!JobState::Cancelled.is_in_flight());
    }

    #[test]
    fn expiry_check() {
        let mut job = sample_job();
        assert!(!job.is_expired(Utc::now()));
        job.expires_at = Utc::now() - Duration::seconds(1);
        assert!(job.is_expired(Utc::now()));
    }
}
