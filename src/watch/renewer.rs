use super::WatchManager;
use futures::StreamExt;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tokio_stream::wrappers::IntervalStream;
use tracing::{info, warn};

/// Periodically recreate channels that are about to expire.
pub fn spawn_renewer(watch: WatchManager) -> JoinHandle<()> {
    let period = Duration::from_secs(watch.config().renew_interval_secs.max(1));
    tokio::spawn(async move {
        info!(interval_secs = period.as_secs(), "Watch renewer started");
        let mut ticks = IntervalStream::new(interval_at(Instant::now() + period, period));
        while ticks.next().await.is_some() {
            match watch.renew_expiring().await {
                Ok(report) if report.due > 0 => info!(
                    due = report.due,
                    renewed = report.renewed,
                    failed = report.failed,
                    "Watch renewal sweep finished"
                ),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Watch renewal sweep failed"),
            }
        }
    })
}
