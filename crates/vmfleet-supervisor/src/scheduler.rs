use std::{
    sync::Arc,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use futures_util::future::BoxFuture;
use tokio::sync::watch;

use crate::error::{FleetError, Result};

/// Outcome of one periodic tick: keep the registration firing, or drop it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Continue,
    Remove,
}

/// Cancels its periodic task when cancelled or dropped.
#[derive(Debug)]
pub struct PeriodicHandle {
    cancel: watch::Sender<bool>,
}

impl PeriodicHandle {
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }
}

/// Recurring-timer capability behind every watcher in this crate.
///
/// Each registration runs as one tokio task; a tick is awaited to
/// completion before the next one fires, so ticks of the same registration
/// never re-enter. Ticks of different registrations interleave freely.
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    shutdown: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a periodic tick. Fails with `WatcherScheduling` once the
    /// scheduler is shut down or when no runtime is available; the error is
    /// the caller's to report, nothing is retried.
    pub fn schedule_periodic<F>(&self, interval: Duration, mut tick: F) -> Result<PeriodicHandle>
    where
        F: FnMut() -> BoxFuture<'static, Tick> + Send + 'static,
    {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(FleetError::WatcherScheduling(
                "scheduler is shut down".to_string(),
            ));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| FleetError::WatcherScheduling(e.to_string()))?;

        let (tx, mut rx) = watch::channel(false);
        let shutdown = self.shutdown.clone();
        runtime.spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = timer.tick() => {}
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow_and_update() {
                            break;
                        }
                        continue;
                    }
                }
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                if tick().await == Tick::Remove {
                    break;
                }
            }
        });

        Ok(PeriodicHandle { cancel: tx })
    }

    /// Stop accepting registrations and wind down existing ones at their
    /// next tick boundary (an in-flight tick always completes).
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use futures_util::FutureExt;

    use super::*;

    #[tokio::test]
    async fn tick_fires_until_removed() {
        let scheduler = Scheduler::new();
        let count = Arc::new(AtomicU32::new(0));
        let seen = count.clone();
        let _handle = scheduler
            .schedule_periodic(Duration::from_millis(10), move || {
                let n = seen.fetch_add(1, Ordering::SeqCst) + 1;
                let result = if n >= 3 { Tick::Remove } else { Tick::Continue };
                std::future::ready(result).boxed()
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn ticks_do_not_reenter() {
        let scheduler = Scheduler::new();
        let in_tick = Arc::new(AtomicBool::new(false));
        let overlapped = Arc::new(AtomicBool::new(false));

        let in_tick2 = in_tick.clone();
        let overlapped2 = overlapped.clone();
        let _handle = scheduler
            .schedule_periodic(Duration::from_millis(5), move || {
                let in_tick = in_tick2.clone();
                let overlapped = overlapped2.clone();
                async move {
                    if in_tick.swap(true, Ordering::SeqCst) {
                        overlapped.store(true, Ordering::SeqCst);
                    }
                    // Longer than the interval, to provoke any overlap.
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    in_tick.store(false, Ordering::SeqCst);
                    Tick::Continue
                }
                .boxed()
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!overlapped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancel_stops_future_ticks() {
        let scheduler = Scheduler::new();
        let count = Arc::new(AtomicU32::new(0));
        let seen = count.clone();
        let handle = scheduler
            .schedule_periodic(Duration::from_millis(10), move || {
                seen.fetch_add(1, Ordering::SeqCst);
                std::future::ready(Tick::Continue).boxed()
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let at_cancel = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), at_cancel);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_registrations() {
        let scheduler = Scheduler::new();
        scheduler.shutdown();
        let err = scheduler
            .schedule_periodic(Duration::from_millis(10), || {
                std::future::ready(Tick::Continue).boxed()
            })
            .unwrap_err();
        assert!(matches!(err, FleetError::WatcherScheduling(_)));
    }
}
