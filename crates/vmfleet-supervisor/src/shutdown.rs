//! Graceful-then-forced shutdown of one managed process.
//!
//! `Running -> Stopping -> Stopped`: a best-effort cooperative power-down
//! over the control channel, then a watchdog that escalates to a group
//! kill exactly once when the deadline passes, and keeps polling until the
//! process is confirmed dead. A timeout here is the expected escalation
//! trigger, never an error.

use std::{sync::Arc, time::Duration};

use futures_util::FutureExt;
use tokio::time::Instant;
use vmfleet_process::{KillOutcome, ProcessState, VmDescriptor};

use crate::backends::ControlChannel;
use crate::config;
use crate::error::Result;
use crate::scheduler::{PeriodicHandle, Scheduler, Tick};
use crate::supervisor::ManagedProcess;

/// Guest command asking the VM to power down before we reach for signals.
pub const POWER_DOWN_COMMAND: &str = "system_powerdown";

#[derive(Debug, Clone, Copy)]
pub struct ShutdownConfig {
    pub stop_timeout: Duration,
    pub watchdog_interval: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            stop_timeout: config::stop_timeout(),
            watchdog_interval: config::watchdog_interval(),
        }
    }
}

/// Start the shutdown sequence for `proc`. Returns the watchdog handle;
/// `on_stopped` fires once when death is confirmed. Only the watchdog
/// registration itself can fail.
pub async fn begin(
    scheduler: &Scheduler,
    proc: ManagedProcess,
    control: Arc<dyn ControlChannel>,
    descriptor: Option<VmDescriptor>,
    cfg: ShutdownConfig,
    on_stopped: impl FnOnce() + Send + 'static,
) -> Result<PeriodicHandle> {
    // Fire-and-forget: the guest may honor it, ignore it, or be gone
    // already. The sequence continues regardless.
    match &descriptor {
        Some(descriptor) => {
            if let Err(err) = control.send_command(descriptor, POWER_DOWN_COMMAND).await {
                tracing::warn!(name = %proc.name, error = %err, "cooperative shutdown command failed; continuing");
            }
        }
        None => {
            tracing::debug!(name = %proc.name, "no descriptor for cooperative shutdown; relying on the watchdog");
        }
    }

    proc.advance(ProcessState::Stopping);
    let initiated = Instant::now();
    let mut escalated = false;
    let mut on_stopped = Some(on_stopped);

    scheduler.schedule_periodic(cfg.watchdog_interval, move || {
        let result = if proc.is_alive() {
            if !escalated && initiated.elapsed() >= cfg.stop_timeout {
                escalated = true;
                tracing::warn!(
                    name = %proc.name,
                    timeout_ms = cfg.stop_timeout.as_millis() as u64,
                    "machine did not power down in time; killing process group"
                );
                match proc.kill_group() {
                    KillOutcome::Failed(err) => {
                        tracing::error!(name = %proc.name, error = %err, "forced kill failed");
                    }
                    outcome => {
                        tracing::debug!(name = %proc.name, ?outcome, "forced kill issued");
                    }
                }
            }
            Tick::Continue
        } else {
            proc.advance(ProcessState::Stopped);
            tracing::info!(name = %proc.name, "machine stopped");
            if let Some(notify) = on_stopped.take() {
                notify();
            }
            Tick::Remove
        };
        std::future::ready(result).boxed()
    })
}
