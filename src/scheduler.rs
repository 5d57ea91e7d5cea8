//! Periodic update checks for daemon mode.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::installer::Orchestrator;

/// Run a check cycle now and then every `interval`, forever.
///
/// A failing check is reported by the cycle itself and never ends the loop.
pub async fn run_daily(orchestrator: Arc<Orchestrator>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(interval_secs = interval.as_secs(), "Scheduled update checks");

    loop {
        ticker.tick().await;
        debug!("Running scheduled check");
        let report = orchestrator.check_all().await;
        if !report.updatable().is_empty() {
            info!(
                updatable = ?report.updatable().iter().map(|s| s.executable.as_str()).collect::<Vec<_>>(),
                "Updates available"
            );
        }
    }
}
