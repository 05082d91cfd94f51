//! Optional Pushgateway export of the in-process metrics.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::kernel::OrchestratorKernel;

/// PUT the Prometheus text rendering to the configured Pushgateway on a
/// fixed interval. A no-op when `PUSHGATEWAY_URL` is unset.
pub async fn run_metrics_push_loop(kernel: Arc<OrchestratorKernel>, shutdown: CancellationToken) {
    let Some(base_url) = kernel.settings.pushgateway_url.clone() else {
        return;
    };
    let url = format!("{}/metrics/job/langorch", base_url.trim_end_matches('/'));
    info!(url = %url, "metrics push loop started");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(kernel.settings.metrics_push_interval) => {}
        }
        let body = kernel.metrics.to_prometheus_text();
        let result = kernel
            .http
            .put(&url)
            .header("Content-Type", "text/plain; version=0.0.4")
            .body(body)
            .send()
            .await;
        match result {
            Ok(response) if !response.status().is_success() => {
                warn!(status = %response.status(), "pushgateway rejected metrics");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "pushgateway push failed"),
        }
    }
    info!("metrics push loop stopped");
}
