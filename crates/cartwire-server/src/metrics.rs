//! Prometheus recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the global Prometheus recorder.
///
/// Returns the handle used to render `/metrics`. Fails if a recorder is
/// already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants shared across the server.

/// Connections accepted (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Connections refused at the limit (counter).
pub const WS_CONNECTIONS_REJECTED_TOTAL: &str = "ws_connections_rejected_total";
/// Connections closed (counter, labels: reason).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Live connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Inbound messages (counter, labels: message_type).
pub const WS_MESSAGES_RECEIVED_TOTAL: &str = "ws_messages_received_total";
/// Error replies sent to clients (counter, labels: code).
pub const WS_ERRORS_TOTAL: &str = "ws_errors_total";
/// Inbound dispatch duration seconds (histogram).
pub const WS_DISPATCH_DURATION_SECONDS: &str = "ws_dispatch_duration_seconds";
/// Queue depth including the retry pool (gauge).
pub const QUEUE_DEPTH: &str = "queue_depth";
/// Envelopes parked awaiting acknowledgment (gauge).
pub const QUEUE_AWAITING_ACK: &str = "queue_awaiting_ack";
/// Active sessions (gauge).
pub const AUTH_SESSIONS_ACTIVE: &str = "auth_sessions_active";
/// Live carts (gauge).
pub const CARTS_ACTIVE: &str = "carts_active";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_from_local_recorder() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let output = render(&handle);
        assert!(output.is_empty() || output.contains('#'));
    }

    #[test]
    fn metric_names_are_snake_case() {
        let names = [
            WS_CONNECTIONS_TOTAL,
            WS_CONNECTIONS_REJECTED_TOTAL,
            WS_DISCONNECTIONS_TOTAL,
            WS_CONNECTIONS_ACTIVE,
            WS_MESSAGES_RECEIVED_TOTAL,
            WS_ERRORS_TOTAL,
            WS_DISPATCH_DURATION_SECONDS,
            QUEUE_DEPTH,
            QUEUE_AWAITING_ACK,
            AUTH_SESSIONS_ACTIVE,
            CARTS_ACTIVE,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "{name} is not snake_case"
            );
        }
    }
}
