//! Ordered machine catalog and the process-wide fleet context.

use std::{
    path::PathBuf,
    sync::{Arc, Mutex, OnceLock},
};

use tokio::sync::broadcast;
use vmfleet_process::{MachineId, RunId};

use crate::backends::{Backends, HistoryStore};
use crate::config;
use crate::error::Result;
use crate::lock;
use crate::machine::{Machine, MachineEvent};
use crate::scheduler::Scheduler;

/// Machines sharing one origin, in catalog order.
pub struct OriginGroup {
    pub origin: String,
    pub machines: Vec<Arc<Machine>>,
}

/// In-memory catalog of known machines. Insertion order is the history
/// order and every listing operation preserves it.
pub struct Registry {
    machines: Mutex<Vec<Arc<Machine>>>,
    events: broadcast::Sender<MachineEvent>,
}

impl Registry {
    fn new(events: broadcast::Sender<MachineEvent>) -> Self {
        Self {
            machines: Mutex::new(Vec::new()),
            events,
        }
    }

    pub fn list(&self) -> Vec<Arc<Machine>> {
        lock(&self.machines).clone()
    }

    pub fn get(&self, id: &MachineId) -> Option<Arc<Machine>> {
        lock(&self.machines).iter().find(|m| &m.id == id).cloned()
    }

    /// Case-insensitive substring match on the machine name. The empty
    /// query matches everything.
    pub fn filter_by_name(&self, query: &str) -> Vec<Arc<Machine>> {
        let needle = query.to_lowercase();
        lock(&self.machines)
            .iter()
            .filter(|m| m.name.to_lowercase().contains(&needle))
            .cloned()
            .collect()
    }

    pub fn running(&self) -> Vec<Arc<Machine>> {
        lock(&self.machines)
            .iter()
            .filter(|m| m.is_running())
            .cloned()
            .collect()
    }

    /// Rebuild the catalog from the history backend. Machines whose id
    /// survives the reload keep their instance (and any live process);
    /// machines that disappeared are dropped, which tears their process
    /// down with them.
    pub fn refresh(&self, history: &dyn HistoryStore) -> Result<()> {
        let entries = history.list_entries()?;
        let mut machines = lock(&self.machines);
        let next = entries
            .into_iter()
            .map(|entry| {
                let id = entry.machine_id();
                machines
                    .iter()
                    .find(|m| m.id == id)
                    .cloned()
                    .unwrap_or_else(|| Machine::from_entry(entry, self.events.clone()))
            })
            .collect::<Vec<_>>();
        tracing::debug!(count = next.len(), "registry refreshed");
        *machines = next;
        Ok(())
    }

    /// Group the catalog by origin, first-seen origin order, catalog
    /// order within each group.
    pub fn group_by_origin(&self) -> Vec<OriginGroup> {
        let mut groups: Vec<OriginGroup> = Vec::new();
        for machine in lock(&self.machines).iter() {
            match groups.iter_mut().find(|g| g.origin == machine.origin) {
                Some(group) => group.machines.push(machine.clone()),
                None => groups.push(OriginGroup {
                    origin: machine.origin.clone(),
                    machines: vec![machine.clone()],
                }),
            }
        }
        groups
    }

    /// Immediate group kill for every machine. Used on supervisor exit,
    /// where there is no time for the graceful sequence.
    pub fn kill_all(&self) {
        for machine in self.list() {
            machine.kill();
        }
    }
}

/// Everything a machine operation needs: the watcher scheduler, the
/// backend set, the catalog, and the event stream. One per process in
/// normal operation, constructed per-test otherwise.
pub struct FleetContext {
    pub scheduler: Scheduler,
    pub backends: Backends,
    pub registry: Registry,
    events: broadcast::Sender<MachineEvent>,
    data_root: PathBuf,
}

static CONTEXT: OnceLock<FleetContext> = OnceLock::new();

impl FleetContext {
    pub fn new(backends: Backends, data_root: Option<PathBuf>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            scheduler: Scheduler::new(),
            backends,
            registry: Registry::new(events.clone()),
            events,
            data_root: data_root.unwrap_or_else(config::data_root),
        }
    }

    /// Process-wide context. The first caller's backends win; later calls
    /// return the same instance.
    pub fn get_or_init(backends: Backends) -> &'static FleetContext {
        CONTEXT.get_or_init(|| FleetContext::new(backends, None))
    }

    pub fn get() -> Option<&'static FleetContext> {
        CONTEXT.get()
    }

    /// New receiver on the lifecycle event stream. Slow receivers drop
    /// the oldest events rather than stalling the supervisor.
    pub fn subscribe_events(&self) -> broadcast::Receiver<MachineEvent> {
        self.events.subscribe()
    }

    /// Directory that holds one run's log and breadcrumb files.
    pub fn run_dir(&self, id: &MachineId, run_id: &RunId) -> PathBuf {
        self.data_root
            .join("machines")
            .join(sanitize_for_path(&id.to_string()))
            .join("runs")
            .join(run_id.to_string())
    }

    /// Stop accepting watcher registrations and kill every live machine.
    pub fn shutdown(&self) {
        tracing::info!("fleet context shutting down");
        self.scheduler.shutdown();
        self.registry.kill_all();
    }
}

/// Machine ids carry origin URLs; flatten them into one path component.
fn sanitize_for_path(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect()
}
