//! Background maintenance loops: retention pruning and storage health
//! monitoring. Both run until their cancellation token fires.

use crate::log_aggregator::LogAggregatorService;
use crate::request_context::RequestContext;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Bound on a single pruning pass
const PRUNE_TIMEOUT: Duration = Duration::from_secs(300);

/// Bound on a single monitor health check
const MONITOR_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Periodically delete entries ingested more than `max_age` ago.
///
/// The first pass runs immediately. Failures are logged and retried on the
/// next tick.
pub async fn run_retention(
    service: Arc<LogAggregatorService>,
    max_age: Duration,
    interval: Duration,
    shutdown: CancellationToken,
) {
    info!(
        max_age_secs = max_age.as_secs(),
        interval_secs = interval.as_secs(),
        "Retention pruner started"
    );

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let ctx = RequestContext::child_of(&shutdown, Some(PRUNE_TIMEOUT));
        match service.prune(&ctx, max_age).await {
            Ok(deleted) => {
                metrics::counter!("aggregator.logs.pruned").increment(deleted);
                if deleted > 0 {
                    info!(deleted = deleted, "Retention pass removed old logs");
                } else {
                    debug!("Retention pass found nothing to remove");
                }
            }
            Err(e) if ctx.is_cancelled() => {
                debug!(error = %e, "Retention pass interrupted by shutdown");
                break;
            }
            Err(e) => {
                error!(error = %e, "Retention pass failed");
            }
        }
    }

    info!("Retention pruner stopped");
}

/// Periodically check storage health and publish it as a gauge
pub async fn run_health_monitor(
    service: Arc<LogAggregatorService>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let ctx = RequestContext::child_of(&shutdown, Some(MONITOR_CHECK_TIMEOUT));
        match service.health_check(&ctx).await {
            Ok(()) => {
                metrics::gauge!("aggregator.storage.healthy").set(1.0);
                debug!(backend = service.backend_name(), "Storage healthy");
            }
            Err(e) => {
                metrics::gauge!("aggregator.storage.healthy").set(0.0);
                warn!(
                    backend = service.backend_name(),
                    error = %e,
                    "Storage health check failed"
                );
            }
        }
    }
}
