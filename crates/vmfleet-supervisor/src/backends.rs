//! External collaborators behind registered-backend interfaces.
//!
//! Every backend is a compile-time-known variant selected through
//! [`BackendConfig`]; there is no runtime code loading. The supervisor
//! only ever sees the trait objects.

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use vmfleet_process::{HistoryEntry, MachineId, VmDescriptor};

use crate::error::{FleetError, Result};

/// Turns a catalog entry into something runnable. Implementations may
/// block (a build/evaluation step); callers run them on the blocking pool.
pub trait VmResolver: Send + Sync {
    fn resolve(&self, entry: &HistoryEntry) -> Result<VmDescriptor>;
}

/// Best-effort guest control. One command per call, fire-and-forget.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    async fn send_command(&self, descriptor: &VmDescriptor, command: &str) -> Result<()>;
}

/// Persisted source of known machines.
pub trait HistoryStore: Send + Sync {
    fn list_entries(&self) -> Result<Vec<HistoryEntry>>;
}

/// Resolver that shells out to an external evaluator. The evaluator gets
/// the origin and name as arguments and must print a JSON descriptor on
/// stdout.
pub struct CommandResolver {
    program: String,
    args: Vec<String>,
}

impl CommandResolver {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl VmResolver for CommandResolver {
    fn resolve(&self, entry: &HistoryEntry) -> Result<VmDescriptor> {
        let output = std::process::Command::new(&self.program)
            .args(&self.args)
            .arg(&entry.origin)
            .arg(&entry.name)
            .output()
            .map_err(|e| FleetError::Resolve(format!("run {}: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FleetError::Resolve(format!(
                "{} exited with {:?}: {}",
                self.program,
                output.status.code(),
                stderr.trim()
            )));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| FleetError::Resolve(format!("parse descriptor: {e}")))
    }
}

/// Fixed descriptor table, used by embedders and tests.
#[derive(Default)]
pub struct StaticResolver {
    table: HashMap<MachineId, VmDescriptor>,
}

impl StaticResolver {
    pub fn new(table: HashMap<MachineId, VmDescriptor>) -> Self {
        Self { table }
    }
}

impl VmResolver for StaticResolver {
    fn resolve(&self, entry: &HistoryEntry) -> Result<VmDescriptor> {
        self.table
            .get(&entry.machine_id())
            .cloned()
            .ok_or_else(|| {
                FleetError::Resolve(format!("no descriptor for {}", entry.machine_id()))
            })
    }
}

/// QMP-style control: one capability negotiation plus one `execute` frame
/// over the descriptor's unix control socket. Replies are not awaited;
/// this channel is strictly best-effort.
#[cfg(unix)]
pub struct QmpControl;

#[cfg(unix)]
#[async_trait]
impl ControlChannel for QmpControl {
    async fn send_command(&self, descriptor: &VmDescriptor, command: &str) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        let Some(socket) = &descriptor.control_socket else {
            return Err(FleetError::Control(
                "descriptor has no control socket".to_string(),
            ));
        };

        let mut stream = tokio::net::UnixStream::connect(socket)
            .await
            .map_err(|e| FleetError::Control(format!("connect {}: {e}", socket.display())))?;

        let mut frame = serde_json::to_vec(&serde_json::json!({ "execute": "qmp_capabilities" }))
            .map_err(|e| FleetError::Control(e.to_string()))?;
        frame.push(b'\n');
        frame.extend_from_slice(
            &serde_json::to_vec(&serde_json::json!({ "execute": command }))
                .map_err(|e| FleetError::Control(e.to_string()))?,
        );
        frame.push(b'\n');

        stream
            .write_all(&frame)
            .await
            .map_err(|e| FleetError::Control(format!("write {}: {e}", socket.display())))?;
        stream.flush().await.ok();
        Ok(())
    }
}

/// Control channel for descriptors with nothing to talk to; always
/// succeeds, so shutdown falls straight through to the watchdog.
pub struct NullControl;

#[async_trait]
impl ControlChannel for NullControl {
    async fn send_command(&self, _descriptor: &VmDescriptor, command: &str) -> Result<()> {
        tracing::debug!(command, "null control channel; command dropped");
        Ok(())
    }
}

/// History persisted as a JSON array of entries. A missing file is an
/// empty history, not an error.
pub struct JsonHistoryStore {
    path: PathBuf,
}

impl JsonHistoryStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl HistoryStore for JsonHistoryStore {
    fn list_entries(&self) -> Result<Vec<HistoryEntry>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(FleetError::History(format!(
                    "read {}: {err}",
                    self.path.display()
                )));
            }
        };
        serde_json::from_str(&raw)
            .map_err(|e| FleetError::History(format!("parse {}: {e}", self.path.display())))
    }
}

/// Fixed entry list, used by embedders and tests.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    entries: Vec<HistoryEntry>,
}

impl InMemoryHistoryStore {
    pub fn new(entries: Vec<HistoryEntry>) -> Self {
        Self { entries }
    }
}

impl HistoryStore for InMemoryHistoryStore {
    fn list_entries(&self) -> Result<Vec<HistoryEntry>> {
        Ok(self.entries.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlBackendKind {
    Qmp,
    Null,
}

/// Deployment-level backend selection; deserializable so a front-end can
/// read it from its own config file.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct BackendConfig {
    pub history_file: PathBuf,
    /// Evaluator invocation: program followed by leading arguments.
    pub resolver_command: Vec<String>,
    pub control: ControlBackendKind,
}

/// The resolved backend set handed to [`crate::FleetContext`].
#[derive(Clone)]
pub struct Backends {
    pub resolver: Arc<dyn VmResolver>,
    pub control: Arc<dyn ControlChannel>,
    pub history: Arc<dyn HistoryStore>,
}

impl Backends {
    pub fn from_config(cfg: BackendConfig) -> Result<Self> {
        let mut command = cfg.resolver_command.into_iter();
        let program = command
            .next()
            .ok_or_else(|| FleetError::Resolve("resolver_command is empty".to_string()))?;
        let resolver: Arc<dyn VmResolver> =
            Arc::new(CommandResolver::new(program, command.collect()));

        let control: Arc<dyn ControlChannel> = match cfg.control {
            #[cfg(unix)]
            ControlBackendKind::Qmp => Arc::new(QmpControl),
            #[cfg(not(unix))]
            ControlBackendKind::Qmp => {
                return Err(FleetError::Control(
                    "qmp control requires unix sockets".to_string(),
                ));
            }
            ControlBackendKind::Null => Arc::new(NullControl),
        };

        Ok(Self {
            resolver,
            control,
            history: Arc::new(JsonHistoryStore::new(cfg.history_file)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, origin: &str) -> HistoryEntry {
        HistoryEntry {
            name: name.to_string(),
            origin: origin.to_string(),
            icon: None,
        }
    }

    #[test]
    fn json_history_store_treats_missing_file_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonHistoryStore::new(dir.path().join("history.json"));
        assert!(store.list_entries().unwrap().is_empty());
    }

    #[test]
    fn json_history_store_round_trips_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        let entries = vec![entry("a", "flake:x"), entry("b", "flake:y")];
        std::fs::write(&path, serde_json::to_vec(&entries).unwrap()).unwrap();

        let store = JsonHistoryStore::new(path);
        let listed = store.list_entries().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].name, "a");
        assert_eq!(listed[1].origin, "flake:y");
    }

    #[test]
    fn json_history_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        std::fs::write(&path, b"not json").unwrap();

        let err = JsonHistoryStore::new(path).list_entries().unwrap_err();
        assert!(matches!(err, FleetError::History(_)));
    }

    #[test]
    fn static_resolver_misses_are_resolve_errors() {
        let resolver = StaticResolver::default();
        let err = resolver.resolve(&entry("ghost", "flake:x")).unwrap_err();
        assert!(matches!(err, FleetError::Resolve(_)));
    }

    #[test]
    fn backends_from_config_rejects_empty_resolver_command() {
        let cfg = BackendConfig {
            history_file: PathBuf::from("/tmp/history.json"),
            resolver_command: vec![],
            control: ControlBackendKind::Null,
        };
        assert!(matches!(
            Backends::from_config(cfg),
            Err(FleetError::Resolve(_))
        ));
    }

    #[tokio::test]
    async fn qmp_control_requires_a_socket() {
        #[cfg(unix)]
        {
            let descriptor = VmDescriptor {
                program: "qemu".to_string(),
                args: vec![],
                control_socket: None,
            };
            let err = QmpControl
                .send_command(&descriptor, "system_powerdown")
                .await
                .unwrap_err();
            assert!(matches!(err, FleetError::Control(_)));
        }
    }
}
