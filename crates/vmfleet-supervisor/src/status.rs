//! Edge-triggered liveness notification for a managed process.

use std::time::Duration;

use futures_util::FutureExt;

use crate::config;
use crate::error::Result;
use crate::scheduler::{PeriodicHandle, Scheduler, Tick};
use crate::supervisor::ManagedProcess;

#[derive(Debug, Clone, Copy)]
pub struct StatusPollConfig {
    pub poll_interval: Duration,
}

impl Default for StatusPollConfig {
    fn default() -> Self {
        Self {
            poll_interval: config::status_poll_interval(),
        }
    }
}

/// Poll liveness; invoke `on_dead` exactly once at the first observed
/// alive-to-dead transition, then deregister. Silent while the state is
/// unchanged.
pub fn watch(
    scheduler: &Scheduler,
    proc: ManagedProcess,
    cfg: StatusPollConfig,
    on_dead: impl FnOnce() + Send + 'static,
) -> Result<PeriodicHandle> {
    let mut on_dead = Some(on_dead);
    scheduler.schedule_periodic(cfg.poll_interval, move || {
        let result = if proc.is_alive() {
            Tick::Continue
        } else {
            if let Some(notify) = on_dead.take() {
                notify();
            }
            Tick::Remove
        };
        std::future::ready(result).boxed()
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::supervisor::{SpawnSpec, spawn};

    use super::*;

    #[tokio::test]
    async fn emits_exactly_once_per_death_then_deregisters() {
        let dir = tempfile::tempdir().unwrap();
        let proc = spawn(
            dir.path(),
            SpawnSpec::new(
                "short",
                "/bin/sh",
                vec!["-c".to_string(), "sleep 0.1".to_string()],
            ),
            None,
        )
        .await
        .unwrap();

        let scheduler = Scheduler::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _handle = watch(
            &scheduler,
            proc,
            StatusPollConfig {
                poll_interval: Duration::from_millis(10),
            },
            move || {
                let _ = tx.send(());
            },
        )
        .unwrap();

        // One notification for the transition...
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no status notification")
            .unwrap();
        // ...and none afterwards: the sender was consumed and the tick
        // removed, so the channel closes instead of yielding again.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn silent_while_alive() {
        let dir = tempfile::tempdir().unwrap();
        let proc = spawn(
            dir.path(),
            SpawnSpec::new(
                "steady",
                "/bin/sh",
                vec!["-c".to_string(), "sleep 30".to_string()],
            ),
            None,
        )
        .await
        .unwrap();

        let scheduler = Scheduler::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _handle = watch(
            &scheduler,
            proc.clone(),
            StatusPollConfig {
                poll_interval: Duration::from_millis(10),
            },
            move || {
                let _ = tx.send(());
            },
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());

        proc.kill_group();
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no status notification after kill")
            .unwrap();
    }
}
