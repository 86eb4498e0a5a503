//! Transactional job queue over PostgreSQL.
//!
//! Named queues live in one `jobs` table and are created lazily by the first
//! send that references them. Delivery is at-least-once: a claimed job holds
//! a visibility lease and returns to `pending` if its consumer dies before
//! acknowledging. Singleton keys bound in-flight duplicates to one job per
//! `(queue, key)`.
//!
//! # Example
//!
//! ```ignore
//! let bus = MessageBus::new(pool);
//! bus.migrate().await?;
//!
//! bus.send("messages", &payload, SendOptions::with_singleton_key(key)).await?;
//!
//! bus.work("messages", WorkOptions::default(), |job: JobContext<Payload>| async move {
//!     handle(job.data).await
//! })
//! .await?;
//! ```

mod error;
mod events;
mod job;
mod queue;
mod worker;

pub use error::{BusError, FailureKind};
pub use events::JobEvent;
pub use job::{Job, JobState};
pub use queue::{EnqueueResult, MessageBus, SendOptions};
pub use worker::{BusWorker, JobContext, WorkOptions};
