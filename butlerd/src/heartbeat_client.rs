//! Outbound heartbeat loop for every non-switchboard butler (`spec.md` §6.2).
//!
//! The switchboard owns `butler_registry` directly; every other butler
//! pushes its own liveness over HTTP since it has no database role on the
//! switchboard schema (`spec.md` §6.5's per-butler role isolation).

use std::time::Duration;

use tokio_util::sync::CancellationToken;

pub async fn run(
    butler_name: String,
    switchboard_url: String,
    interval: Duration,
    shutdown: CancellationToken,
) {
    if switchboard_url.is_empty() {
        tracing::warn!("registry.switchboard_url not configured, heartbeat loop disabled");
        return;
    }

    let client = reqwest::Client::new();
    let url = format!("{}/api/switchboard/heartbeat", switchboard_url.trim_end_matches('/'));

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("heartbeat loop shutting down");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        let body = serde_json::json!({ "butler_name": butler_name });
        match client.post(&url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {
                tracing::debug!(butler = %butler_name, "heartbeat ok");
            }
            Ok(resp) => {
                tracing::warn!(butler = %butler_name, status = %resp.status(), "heartbeat rejected");
            }
            Err(err) => {
                tracing::warn!(butler = %butler_name, error = %err, "heartbeat request failed");
            }
        }
    }
}
