//! GcLoop - retention for finished tasks.
//!
//! Every `every`, terminal tasks (and their results) completed more than
//! `retention` ago are dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::engine::Engine;

pub(crate) async fn run(
    engine: Arc<Engine>,
    retention: Duration,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // 初回 tick は即時に返るので読み捨てる
    ticker.tick().await;

    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                engine.cleanup(retention);
            }
        }
    }
    tracing::debug!("cleanup loop stopped");
}
