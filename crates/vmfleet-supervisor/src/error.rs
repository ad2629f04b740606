use std::io;

pub type Result<T> = std::result::Result<T, FleetError>;

#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    /// Log directory uncreatable or process creation failed. Fatal to that
    /// spawn call only.
    #[error("spawn failed: {reason}")]
    Spawn {
        reason: String,
        #[source]
        source: Option<io::Error>,
    },

    /// The spawned machine process exited abnormally. Contained to the
    /// child's process group; delivered through the failure callback and
    /// the eventual liveness transition, never by propagation.
    #[error("machine process exited abnormally (exit code {exit_code:?})")]
    Execution { exit_code: Option<i32> },

    /// A periodic watcher could not be registered. Fatal to the operation
    /// that needed the watcher, reported synchronously to its caller.
    #[error("failed to schedule periodic task: {0}")]
    WatcherScheduling(String),

    /// The external build/eval step could not produce a VM descriptor.
    #[error("descriptor resolution failed: {0}")]
    Resolve(String),

    /// Control channel failure. Best-effort consumers log and continue.
    #[error("control channel: {0}")]
    Control(String),

    /// Persisted entity store failure.
    #[error("history store: {0}")]
    History(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl FleetError {
    pub(crate) fn spawn(reason: impl Into<String>) -> Self {
        FleetError::Spawn {
            reason: reason.into(),
            source: None,
        }
    }

    pub(crate) fn spawn_io(reason: impl Into<String>, source: io::Error) -> Self {
        FleetError::Spawn {
            reason: reason.into(),
            source: Some(source),
        }
    }
}
