use std::sync::Arc;
use std::time::Duration;
use log::{debug, info, warn};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::{interval, MissedTickBehavior};

use crate::pipeline::Pipeline;

/// At most one pass runs at a time. A tick that finds the lock held is
/// dropped rather than queued.
#[derive(Debug, Clone, Default)]
pub struct RunLock {
    inner: Arc<Mutex<()>>,
}

impl RunLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> Option<OwnedMutexGuard<()>> {
        self.inner.clone().try_lock_owned().ok()
    }
}

/// Run a pass immediately, then on every interval tick, forever
pub async fn run_scheduled(pipeline: Arc<Pipeline>, every: Duration) {
    let lock = RunLock::new();
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        let Some(guard) = lock.try_acquire() else {
            info!("Previous pass still running, skipping this tick");
            continue;
        };

        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            let _guard = guard;
            match pipeline.run_pass().await {
                Ok(report) => debug!("Pass report: {:?}", report),
                // Already logged and notified by the pipeline
                Err(e) => warn!("Pass ended with error: {}", e),
            }
        });
    }
}
