//! `/health` endpoint body.

use serde::Serialize;

use crate::server::ServerStats;

/// Coarse liveness.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Accepting connections.
    Ok,
    /// Shutdown has begun; new upgrades are refused.
    ShuttingDown,
}

/// Health check response body.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Liveness.
    pub status: HealthStatus,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Live WebSocket connections.
    pub connections: usize,
    /// Active auth sessions.
    pub active_sessions: usize,
    /// Envelopes waiting in the reliable queue, retries included.
    pub queue_depth: usize,
    /// Envelopes delivered but not yet acknowledged.
    pub awaiting_ack: usize,
}

/// Summarize `stats` for load balancers and probes.
pub fn health_check(stats: &ServerStats, shutting_down: bool) -> HealthResponse {
    HealthResponse {
        status: if shutting_down {
            HealthStatus::ShuttingDown
        } else {
            HealthStatus::Ok
        },
        uptime_secs: stats.uptime_secs,
        connections: stats.clients.connections,
        active_sessions: stats.auth.active_sessions,
        queue_depth: stats.queue.depth + stats.queue.retry_depth,
        awaiting_ack: stats.queue.awaiting_ack,
    }
}
