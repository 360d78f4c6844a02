use crate::coupon_import::CouponImporter;
use crate::duration_until_nightly_run;
use crate::event_import::EventImporter;
use crate::listing_import::ListingImporter;
use once_cell::sync::Lazy;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;

/// The currently-running nightly pass, if any. Registered so the control
/// surface can abort it mid-run.
static RUNNING: Lazy<RwLock<Option<AbortHandle>>> = Lazy::new(|| RwLock::new(None));

pub struct Importers {
    pub listings: Arc<ListingImporter>,
    pub events: Arc<EventImporter>,
    pub coupons: Arc<CouponImporter>,
}

/// Spawns the daily scheduler: sleep until the next nightly slot, run all
/// three imports in sequence, repeat. The shutdown token stops the loop
/// between runs; an in-flight run finishes unless killed.
pub fn spawn_daily(importers: Importers, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let pause = duration_until_nightly_run();
            log::info!("Next scheduled import in {}s", pause.as_secs());
            tokio::select! {
                _ = shutdown.cancelled() => {
                    log::info!("Scheduler stopped");
                    break;
                }
                _ = tokio::time::sleep(pause) => {}
            }
            run_once(&importers).await;
        }
    })
}

async fn run_once(importers: &Importers) {
    let listings = importers.listings.clone();
    let events = importers.events.clone();
    let coupons = importers.coupons.clone();
    let task = tokio::spawn(async move {
        if let Err(err) = listings.run_cron().await {
            log::error!("Scheduled listings import failed: {err:#}");
        }
        if let Err(err) = events.run_cron().await {
            log::error!("Scheduled events import failed: {err:#}");
        }
        if let Err(err) = coupons.run_cron().await {
            log::error!("Scheduled coupons import failed: {err:#}");
        }
    });
    {
        let mut running = RUNNING.write().await;
        *running = Some(task.abort_handle());
    }
    if let Err(err) = task.await {
        if err.is_cancelled() {
            log::warn!("Scheduled import killed");
        } else {
            log::error!("Scheduled import panicked: {err}");
        }
    }
    let mut running = RUNNING.write().await;
    *running = None;
}

/// Aborts the nightly pass if one is in flight. Returns whether anything
/// was actually killed.
pub async fn kill_running() -> bool {
    let mut running = RUNNING.write().await;
    match running.take() {
        Some(handle) => {
            handle.abort();
            true
        }
        None => false,
    }
}
