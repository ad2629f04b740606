use std::{fmt, io, path::PathBuf};

/// Stable machine identifier: `<origin>#<name>`.
///
/// The origin is the URL or path of the source the machine was defined in,
/// so the same machine name from two sources never collides.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct MachineId(pub String);

impl MachineId {
    pub fn new(origin: &str, name: &str) -> Self {
        Self(format!("{origin}#{name}"))
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One spawn attempt. Fresh per call so concurrent spawns of the same
/// machine can never share a log directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ProcessState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl ProcessState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessState::Stopped | ProcessState::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            ProcessState::Starting => 0,
            ProcessState::Running => 1,
            ProcessState::Stopping => 2,
            // Both terminal states share a rank: once one is reached the
            // other is unreachable.
            ProcessState::Stopped | ProcessState::Failed => 3,
        }
    }

    /// Forward-only transition guard. Terminal states never change, which
    /// also makes `Stopping -> {Stopped, Failed}` mutually exclusive.
    pub fn can_advance_to(self, next: ProcessState) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

/// Point-in-time view of a managed process, safe to hand to front-ends.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ProcessStatus {
    pub name: String,
    pub run_id: RunId,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
}

/// How a kill request landed. "Already dead" is an expected no-op for the
/// caller, not an error, and is reported instead of raised so callers on
/// teardown paths never have to handle a spurious failure.
#[derive(Debug)]
pub enum KillOutcome {
    Killed,
    AlreadyDead,
    Failed(io::Error),
}

/// Opaque runnable descriptor produced by the external build/evaluation
/// step. The supervisor only ever execs it and (optionally) talks to its
/// control socket; it never inspects the contents beyond that.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct VmDescriptor {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_socket: Option<PathBuf>,
}

/// One persisted catalog entry, as listed by the history store.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HistoryEntry {
    pub name: String,
    pub origin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<PathBuf>,
}

impl HistoryEntry {
    pub fn machine_id(&self) -> MachineId {
        MachineId::new(&self.origin, &self.name)
    }
}
