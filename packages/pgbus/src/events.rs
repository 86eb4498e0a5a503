use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Job lifecycle events.
///
/// These are facts about jobs the bus has finished deciding on, published on
/// a broadcast channel so operators and tests can observe queue health
/// without polling the table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobEvent {
    /// Job completed successfully.
    Completed {
        job_id: Uuid,
        queue: String,
        duration_ms: u64,
    },

    /// Handler failed. `will_retry` is false on the attempt that moved the
    /// job to `failed`.
    Failed {
        job_id: Uuid,
        queue: String,
        error: String,
        attempt: i32,
        will_retry: bool,
    },

    /// Job outlived `expires_at` before completing.
    Expired { job_id: Uuid, queue: String },

    /// Pending job was cancelled.
    Cancelled { job_id: Uuid, queue: String },
}
