//! Per-connection liveness ticker.

use std::sync::Arc;
use std::time::Duration;

use cartwire_hub::{ClientConnection, SendFailure};
use tokio::time;
use tracing::debug;

/// Outcome of the heartbeat loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// No inbound traffic within the timeout window.
    TimedOut,
    /// The connection was cancelled.
    Cancelled,
    /// The write loop is gone.
    ChannelClosed,
}

/// Queue a ping on the connection's own outbound channel every `interval`.
///
/// Any inbound frame refreshes the connection's activity clock; once the
/// clock shows `timeout` of silence at a tick the loop returns
/// [`HeartbeatResult::TimedOut`]. A full outbound channel skips the ping for
/// that tick.
pub async fn run_heartbeat(
    connection: Arc<ClientConnection>,
    interval: Duration,
    timeout: Duration,
) -> HeartbeatResult {
    let cancel = connection.cancel_token().clone();
    let mut ticker = time::interval(interval);
    let _ = ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if connection.idle_for() >= timeout {
                    return HeartbeatResult::TimedOut;
                }
                match connection.try_send_ping() {
                    Ok(()) => {}
                    Err(SendFailure::Full) => {
                        debug!(conn_id = %connection.id(), "outbound full, skipping ping");
                    }
                    Err(SendFailure::Closed) => return HeartbeatResult::ChannelClosed,
                }
            }
            () = cancel.cancelled() => return HeartbeatResult::Cancelled,
        }
    }
}
