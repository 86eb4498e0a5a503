//! Route handlers: the signed events endpoint and the health check.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use tracing::{error, warn};

use slack::models::EventEnvelope;

use crate::server::app::AppState;

/// Receive a signed chat event.
///
/// The platform expects an ACK within a few seconds and redelivers on
/// timeout, so actionable events are processed on a spawned task after the
/// signature check.
pub async fn events_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    let timestamp = header_str(&headers, "x-slack-request-timestamp");
    let signature = header_str(&headers, "x-slack-signature");

    if !state
        .deps
        .slack
        .verify_signature(timestamp, &body, signature)
    {
        warn!("rejected event with bad signature");
        return (StatusCode::UNAUTHORIZED, String::new());
    }

    let envelope: EventEnvelope = match serde_json::from_str(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "unparseable event payload");
            return (StatusCode::BAD_REQUEST, String::new());
        }
    };

    match envelope {
        EventEnvelope::UrlVerification { challenge } => (StatusCode::OK, challenge),
        EventEnvelope::EventCallback { event } => {
            let dispatcher = state.dispatcher.clone();
            tokio::spawn(async move {
                if let Err(e) = dispatcher.handle_event(event).await {
                    error!(error = %e, "event dispatch failed");
                }
            });
            (StatusCode::OK, String::new())
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    database: DatabaseHealth,
    connection_pool: ConnectionPoolHealth,
}

#[derive(Serialize)]
pub struct DatabaseHealth {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
pub struct ConnectionPoolHealth {
    size: u32,
    idle_connections: usize,
}

/// Health check endpoint.
///
/// Returns 200 OK when the database answers, 503 otherwise.
pub async fn health_handler(
    State(state): State<AppState>,
) -> (StatusCode, Json<HealthResponse>) {
    let pool = &state.deps.pool;

    let database = match sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(pool).await {
        Ok(_) => DatabaseHealth {
            status: "ok".to_string(),
            error: None,
        },
        Err(e) => DatabaseHealth {
            status: "unavailable".to_string(),
            error: Some(e.to_string()),
        },
    };

    let healthy = database.error.is_none();
    let response = HealthResponse {
        status: if healthy { "ok" } else { "degraded" }.to_string(),
        database,
        connection_pool: ConnectionPoolHealth {
            size: pool.size(),
            idle_connections: pool.num_idle(),
        },
    };

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(response))
}
