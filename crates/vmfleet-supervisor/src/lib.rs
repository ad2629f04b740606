//! Lifecycle management for externally-launched virtual machine processes.
//!
//! Machines are spawned as detached, process-group-isolated OS processes
//! with their output redirected to a per-run log file. The supervisor
//! re-derives liveness from the OS on every check, tails logs and polls
//! status through a shared periodic scheduler, and shuts machines down
//! cooperatively with a forced-kill fallback. Front-ends (GUI, HTTP, CLI)
//! sit on top of [`FleetContext`] and the event stream; they are not part
//! of this crate.

pub mod backends;
pub mod config;
pub mod error;
pub mod log_tail;
pub mod machine;
pub mod registry;
pub mod scheduler;
pub mod shutdown;
pub mod status;
pub mod supervisor;

pub use error::{FleetError, Result};
pub use machine::{Machine, MachineEvent};
pub use registry::{FleetContext, OriginGroup, Registry};
pub use scheduler::{PeriodicHandle, Scheduler, Tick};
pub use supervisor::{ManagedProcess, SpawnSpec};

use std::sync::{Mutex, MutexGuard};

/// Lock a mutex, recovering the value if a panicking thread poisoned it.
/// Every guarded value in this crate is a plain state cell that stays
/// valid regardless of where the writer panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
