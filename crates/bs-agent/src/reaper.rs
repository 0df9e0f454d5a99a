//! Idle upload reaper
//!
//! Uploads that stop receiving chunks would otherwise hold a partial file
//! and a session slot until the connection closes. This task periodically
//! discards any session idle for longer than the policy's session timeout.
//! The connection and its key are left alone.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::state::AgentState;

/// Run the reaper until `cancel` fires
pub async fn run_upload_reaper(state: Arc<AgentState>, cancel: CancellationToken) {
    let timeout = state.config.upload.session_timeout;
    let mut interval = tokio::time::interval(state.config.reaper_interval);

    tracing::info!(
        "Starting upload reaper (session timeout: {:?}, check interval: {:?})",
        timeout,
        state.config.reaper_interval
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let expired = state.uploads.expire_idle(timeout).await;
                if expired > 0 {
                    tracing::info!("Reaped {} idle upload sessions", expired);
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Upload reaper shutting down");
                break;
            }
        }
    }
}
