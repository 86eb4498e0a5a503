use std::sync::Arc;

use pgbus::MessageBus;
use slack::SlackClient;
use sqlx::PgPool;

use crate::config::Config;

/// Shared dependency bundle for the control-plane services.
///
/// Cloned freely; everything inside is a handle.
#[derive(Clone)]
pub struct ServerDeps {
    pub pool: PgPool,
    pub bus: MessageBus,
    pub slack: SlackClient,
    pub config: Arc<Config>,
}

impl ServerDeps {
    pub fn new(pool: PgPool, bus: MessageBus, slack: SlackClient, config: Config) -> Self {
        Self {
            pool,
            bus,
            slack,
            config: Arc::new(config),
        }
    }
}
