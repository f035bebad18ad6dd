use super::SyncTrigger;
use crate::config::SyncConfig;
use crate::db::DbActorHandle;
use futures::StreamExt;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::{num::NonZeroU32, sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tokio_stream::wrappers::IntervalStream;
use tracing::{debug, info, warn};

/// Schedule a sync for every connected user, paced by `limiter`. Returns how many were scheduled.
pub async fn poll_once(
    db: &DbActorHandle,
    trigger: &dyn SyncTrigger,
    limiter: &DefaultDirectRateLimiter,
    debounce: Duration,
) -> usize {
    let users = match db.list_connected_users().await {
        Ok(users) => users,
        Err(e) => {
            warn!(error = %e, "Poll tick could not list connected users");
            return 0;
        }
    };

    let mut scheduled = 0;
    for user_id in users {
        limiter.until_ready().await;
        match trigger.schedule_sync(&user_id, Some(debounce)) {
            Ok(()) => scheduled += 1,
            Err(e) => warn!(user_id = %user_id, error = %e, "Poll trigger dropped"),
        }
    }
    scheduled
}

/// Periodic polling fallback for users whose calendar changes are not pushed to us.
pub fn spawn_poller(
    db: DbActorHandle,
    trigger: Arc<dyn SyncTrigger>,
    cfg: &SyncConfig,
) -> JoinHandle<()> {
    let period = cfg.poll_interval();
    let debounce = cfg.debounce();
    let tps = NonZeroU32::new(cfg.poll_dispatch_tps).unwrap_or(NonZeroU32::MIN);
    let limiter = RateLimiter::direct(Quota::per_second(tps));

    tokio::spawn(async move {
        info!(
            interval_ms = period.as_millis() as u64,
            dispatch_tps = tps.get(),
            "Poller started"
        );
        let mut ticks = IntervalStream::new(interval_at(Instant::now() + period, period));
        while ticks.next().await.is_some() {
            let scheduled = poll_once(&db, trigger.as_ref(), &limiter, debounce).await;
            debug!(scheduled, "Poll tick dispatched");
        }
    })
}
