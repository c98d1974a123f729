//! Recurring background tasks with clean start/stop.
//!
//! Each recurring job implements [`Tick`]; [`spawn_recurring`] drives it on a
//! `tokio::time::interval`. Stopping prevents further ticks but lets a tick
//! that is already running finish. Tests drive time with tokio's paused
//! clock instead of real sleeps.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// One unit of recurring work.
#[async_trait]
pub trait Tick: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Run once. Errors are handled (logged) inside; a tick never stops
    /// the schedule.
    async fn tick(&self);
}

/// When the first tick fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstTick {
    /// Right away, then every period.
    Immediate,
    /// After one full period.
    AfterPeriod,
}

/// Handle to a running recurring task.
///
/// Dropping the handle also stops the schedule.
pub struct TickerHandle {
    name: String,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl TickerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal the loop to stop. No new tick starts after this returns.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Stop and wait for any in-flight tick to finish.
    pub async fn shutdown(self) {
        self.stop();
        if let Err(e) = self.handle.await {
            warn!(task = %self.name, error = %e, "Recurring task ended abnormally");
        }
    }
}

/// Spawn `task` on a fixed period.
///
/// Missed ticks are delayed rather than bursted, so a slow tick never
/// causes a pile-up of back-to-back runs.
pub fn spawn_recurring(task: Arc<dyn Tick>, period: Duration, first: FirstTick) -> TickerHandle {
    let period = period.max(Duration::from_millis(1));
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let name = task.name().to_string();

    let handle = tokio::spawn(async move {
        info!(task = %task.name(), period = ?period, "Recurring task started");

        let start = match first {
            FirstTick::Immediate => Instant::now(),
            FirstTick::AfterPeriod => Instant::now() + period,
        };
        let mut ticker = tokio::time::interval_at(start, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                changed = stop_rx.changed() => {
                    // Err means every handle was dropped.
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                    continue;
                }
                _ = ticker.tick() => {}
            }

            if *stop_rx.borrow() {
                break;
            }

            debug!(task = %task.name(), "Tick");
            task.tick().await;
        }

        info!(task = %task.name(), "Recurring task stopped");
    });

    TickerHandle {
        name,
        stop_tx,
        handle,
    }
}
