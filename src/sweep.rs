//! Background expiry of overdue pending edges.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::gate::SubscriptionChecker;
use crate::orchestrator::Orchestrator;
use crate::rlog;

const RETRY_BASE_SECS: u64 = 30;
const MAX_BACKOFF_SECS: u64 = 300; // 5 minutes

/// Delay before the next pass: the regular interval when healthy, otherwise
/// 30s × 2^(failures-1) capped at 5 minutes (and never beyond the interval).
pub fn next_delay(interval: Duration, consecutive_failures: u32) -> Duration {
    if consecutive_failures == 0 {
        return interval;
    }
    let backoff = RETRY_BASE_SECS
        .saturating_mul(2u64.saturating_pow(consecutive_failures - 1))
        .min(MAX_BACKOFF_SECS);
    Duration::from_secs(backoff).min(interval)
}

/// Runs [`Orchestrator::expire_pending`] every `interval` until `shutdown`
/// is notified. A failed pass is retried with exponential backoff.
pub async fn run_sweep_loop<C: SubscriptionChecker>(
    engine: Arc<Orchestrator<C>>,
    interval: Duration,
    shutdown: Arc<Notify>,
) {
    let mut consecutive_failures = 0u32;

    loop {
        let delay = next_delay(interval, consecutive_failures);
        tokio::select! {
            _ = shutdown.notified() => {
                rlog!("sweep: shutting down");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        match engine.expire_pending().await {
            Ok(report) => {
                if consecutive_failures > 0 {
                    rlog!("sweep: recovered after {} failed pass(es)", consecutive_failures);
                }
                consecutive_failures = 0;
                if report.unavailable > 0 {
                    rlog!(
                        "sweep: {} edge(s) left pending, subscription check unavailable",
                        report.unavailable
                    );
                }
            }
            Err(e) => {
                consecutive_failures = consecutive_failures.saturating_add(1);
                rlog!(
                    "sweep error (attempt {}, next retry in {}s): {}",
                    consecutive_failures,
                    next_delay(interval, consecutive_failures).as_secs(),
                    e
                );
            }
        }
    }
}
