//! Periodic unattended re-testing

use super::TestScheduler;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Background task running an auto-test pass on every interval tick
pub struct AutoTester {
    stop_tx: Option<watch::Sender<bool>>,
    task_handle: Option<JoinHandle<()>>,
}

impl AutoTester {
    /// Start the loop with the scheduler's configured interval
    ///
    /// Returns `None` when the interval is 0. Ticks are skipped while
    /// `active` holds `false`.
    pub async fn start(scheduler: TestScheduler, active: watch::Receiver<bool>) -> Option<Self> {
        let interval = scheduler.settings().await.auto_test_interval()?;
        Some(Self::with_interval(scheduler, interval, active))
    }

    pub fn with_interval(
        scheduler: TestScheduler,
        interval: Duration,
        active: watch::Receiver<bool>,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(Self::run_loop(scheduler, interval, active, stop_rx));

        Self {
            stop_tx: Some(stop_tx),
            task_handle: Some(task),
        }
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
        info!("Auto-test stopped");
    }

    pub fn is_running(&self) -> bool {
        self.task_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    async fn run_loop(
        scheduler: TestScheduler,
        interval: Duration,
        active: watch::Receiver<bool>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        info!("Auto-test every {:?}", interval);

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if !*active.borrow() {
                        debug!("Consumer inactive, skipping auto-test");
                        continue;
                    }
                    scheduler.run_auto_pass().await;
                }
            }
        }

        debug!("Auto-test loop ended");
    }
}

impl Drop for AutoTester {
    fn drop(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}
