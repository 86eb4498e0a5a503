//! Chat-driven code-agent platform.
//!
//! Users mention a bot in a chat channel; the dispatcher lifts the message
//! onto a PostgreSQL-backed bus, the orchestrator materializes a per-user
//! worker workload, the worker session runs the coding agent as a
//! subprocess and streams coalesced progress frames back through the bus,
//! and the response consumer applies them to the chat thread.
//!
//! Two binaries share this crate: `server` (dispatcher + orchestrator +
//! response consumer) and `worker` (one user's session runtime).

pub mod config;
pub mod consumer;
pub mod deps;
pub mod dispatcher;
pub mod orchestrator;
pub mod server;
pub mod types;
pub mod worker;

pub use config::{Config, WorkerConfig};
pub use deps::ServerDeps;
