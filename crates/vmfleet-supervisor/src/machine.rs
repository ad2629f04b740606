//! A managed VM entity: catalog metadata plus zero-or-one live process.

use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
};

use tokio::sync::broadcast;
use vmfleet_process::{HistoryEntry, KillOutcome, MachineId, ProcessState, VmDescriptor};

use crate::error::{FleetError, Result};
use crate::lock;
use crate::log_tail::{self, LogTailConfig};
use crate::registry::FleetContext;
use crate::scheduler::PeriodicHandle;
use crate::shutdown::{self, ShutdownConfig};
use crate::status::{self, StatusPollConfig};
use crate::supervisor::{self, OnFailure, SpawnSpec};

/// Forwarded to whatever owns the registry whenever a machine's lifecycle
/// state changes.
#[derive(Debug, Clone)]
pub struct MachineEvent {
    pub machine_id: MachineId,
    pub state: ProcessState,
}

pub struct Machine {
    pub id: MachineId,
    pub name: String,
    pub origin: String,
    pub icon: Option<PathBuf>,
    entry: HistoryEntry,
    // Held across the whole start sequence so two concurrent starts can
    // never both pass the liveness check and spawn two process groups.
    start_gate: tokio::sync::Mutex<()>,
    descriptor: Mutex<Option<VmDescriptor>>,
    process: Mutex<Option<supervisor::ManagedProcess>>,
    watchers: Mutex<Vec<PeriodicHandle>>,
    events: broadcast::Sender<MachineEvent>,
}

impl Machine {
    pub(crate) fn from_entry(
        entry: HistoryEntry,
        events: broadcast::Sender<MachineEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: entry.machine_id(),
            name: entry.name.clone(),
            origin: entry.origin.clone(),
            icon: entry.icon.clone(),
            entry,
            start_gate: tokio::sync::Mutex::new(()),
            descriptor: Mutex::new(None),
            process: Mutex::new(None),
            watchers: Mutex::new(Vec::new()),
            events,
        })
    }

    /// Liveness is re-derived from the OS, never cached here.
    pub fn is_running(&self) -> bool {
        lock(&self.process).as_ref().is_some_and(|p| p.is_alive())
    }

    pub fn state(&self) -> Option<ProcessState> {
        lock(&self.process).as_ref().map(|p| p.state())
    }

    fn emit(&self, state: ProcessState) {
        let _ = self.events.send(MachineEvent {
            machine_id: self.id.clone(),
            state,
        });
    }

    /// Resolve the descriptor, spawn the VM process, and register the log
    /// tail and status watchers. Resolver and watcher-registration errors
    /// surface to the caller; a machine that is already running is a
    /// logged no-op.
    pub async fn start(self: &Arc<Self>, ctx: &FleetContext) -> Result<()> {
        let _start = self.start_gate.lock().await;
        if self.is_running() {
            tracing::warn!(machine = %self.id, "machine is already running");
            return Ok(());
        }

        // The descriptor comes from a build/eval step that may take a
        // while; keep it off the async workers.
        let resolver = ctx.backends.resolver.clone();
        let entry = self.entry.clone();
        let descriptor = tokio::task::spawn_blocking(move || resolver.resolve(&entry))
            .await
            .map_err(|e| FleetError::Resolve(format!("resolver task failed: {e}")))??;
        *lock(&self.descriptor) = Some(descriptor.clone());

        let spec = SpawnSpec::new(
            self.name.clone(),
            descriptor.program.clone(),
            descriptor.args.clone(),
        );
        let run_dir = ctx.run_dir(&self.id, &spec.run_id);

        let on_failure: OnFailure = {
            let id = self.id.clone();
            Arc::new(move |err, status| {
                tracing::error!(
                    machine = %id,
                    error = %err,
                    exit_code = ?status.exit_code,
                    "machine process failed"
                );
            })
        };

        let proc = supervisor::spawn(&run_dir, spec, Some(on_failure)).await?;
        *lock(&self.process) = Some(proc.clone());
        self.emit(ProcessState::Running);

        // Guest console into the supervisor's log stream.
        let log_handle = {
            let machine = self.id.clone();
            log_tail::tail(
                &ctx.scheduler,
                proc.clone(),
                LogTailConfig::default(),
                move |chunk| {
                    tracing::info!(target: "vmfleet::console", machine = %machine, "{}", chunk.trim_end());
                },
            )?
        };

        // The status poller owns the single outward death notification.
        let status_handle = {
            let this = Arc::downgrade(self);
            let proc = proc.clone();
            status::watch(
                &ctx.scheduler,
                proc.clone(),
                StatusPollConfig::default(),
                move || {
                    if let Some(machine) = this.upgrade() {
                        let state = proc.state();
                        machine.emit(if state.is_terminal() {
                            state
                        } else {
                            ProcessState::Stopped
                        });
                    }
                },
            )?
        };

        let mut watchers = lock(&self.watchers);
        // Handles from a previous run are spent once the machine stopped;
        // drop them so repeated start/stop cycles do not accumulate.
        watchers.clear();
        watchers.push(log_handle);
        watchers.push(status_handle);
        Ok(())
    }

    /// Begin the graceful-then-forced shutdown sequence. Fire-and-forget:
    /// the outcome arrives as a status-changed event. A machine that is
    /// not running is a no-op.
    pub async fn stop(&self, ctx: &FleetContext) -> Result<()> {
        let Some(proc) = lock(&self.process).clone() else {
            return Ok(());
        };
        if !proc.is_alive() {
            tracing::debug!(machine = %self.id, "stop requested but machine is not running");
            return Ok(());
        }

        let descriptor = lock(&self.descriptor).clone();
        let id = self.id.clone();
        let handle = shutdown::begin(
            &ctx.scheduler,
            proc,
            ctx.backends.control.clone(),
            descriptor,
            ShutdownConfig::default(),
            // The status poller emits the outward notification; the
            // watchdog only needs to log completion.
            move || tracing::debug!(machine = %id, "shutdown sequence finished"),
        )
        .await?;
        lock(&self.watchers).push(handle);
        self.emit(ProcessState::Stopping);
        Ok(())
    }

    /// Immediate group kill; no cooperative step, no watchdog.
    pub fn kill(&self) {
        let Some(proc) = lock(&self.process).clone() else {
            tracing::debug!(machine = %self.id, "kill requested but machine was never started");
            return;
        };
        match proc.kill_group() {
            KillOutcome::Killed => tracing::info!(machine = %self.id, "killed machine process group"),
            KillOutcome::AlreadyDead => {
                tracing::debug!(machine = %self.id, "kill requested but machine is already dead");
            }
            KillOutcome::Failed(err) => {
                tracing::warn!(machine = %self.id, error = %err, "kill failed");
            }
        }
    }

    /// Full contents of the current run's log file; empty (and logged)
    /// when no run produced one yet.
    pub async fn read_whole_log(&self) -> String {
        let Some(proc) = lock(&self.process).clone() else {
            return String::new();
        };
        match tokio::fs::read_to_string(&proc.out_file).await {
            Ok(contents) => contents,
            Err(err) => {
                tracing::warn!(machine = %self.id, error = %err, "log file unavailable");
                String::new()
            }
        }
    }

    /// Register an additional log tail with its own cursor. The returned
    /// handle controls the subscription's lifetime.
    pub fn subscribe_logs(
        &self,
        ctx: &FleetContext,
        on_chunk: impl FnMut(String) + Send + 'static,
    ) -> Result<PeriodicHandle> {
        let Some(proc) = lock(&self.process).clone() else {
            return Err(FleetError::WatcherScheduling(
                "machine has no managed process".to_string(),
            ));
        };
        log_tail::tail(&ctx.scheduler, proc, LogTailConfig::default(), on_chunk)
    }
}

impl Drop for Machine {
    // Teardown must kill the process group on every exit path; watcher
    // handles cancel themselves when dropped right after this.
    fn drop(&mut self) {
        let process = match self.process.get_mut() {
            Ok(process) => process,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(proc) = process
            && !proc.state().is_terminal()
        {
            tracing::info!(machine = %self.id, "machine dropped while running; killing process group");
            if let KillOutcome::Failed(err) = proc.kill_group() {
                tracing::warn!(machine = %self.id, error = %err, "teardown kill failed");
            }
        }
    }
}
