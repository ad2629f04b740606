//! Spawning and group-wide termination of machine processes.
//!
//! This is the only module that touches OS process state directly; every
//! higher component goes through [`ManagedProcess::kill_group`] and
//! [`ManagedProcess::is_alive`]. A child is detached into its own session
//! and process group at spawn, so one signal to `-pgid` reaches the leader
//! and every descendant it forks later.

use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{Arc, Mutex},
};

use tokio::io::AsyncWriteExt;
use vmfleet_process::{KillOutcome, ProcessState, ProcessStatus, RunId};

use crate::error::{FleetError, Result};
use crate::lock;

pub const OUT_LOG: &str = "out.log";

/// Called from the exit-wait task when the child fails. Receives the
/// captured failure and the final status of the process.
pub type OnFailure = Arc<dyn Fn(FleetError, ProcessStatus) + Send + Sync>;

/// What to run, independent of how the descriptor was produced.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub run_id: RunId,
    /// Descriptive name, used for logging and the best-effort argv[0]
    /// override.
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
}

impl SpawnSpec {
    pub fn new(
        name: impl Into<String>,
        program: impl Into<String>,
        args: Vec<String>,
    ) -> Self {
        Self {
            run_id: RunId::new(),
            name: name.into(),
            program: program.into(),
            args,
        }
    }
}

/// Handle to a spawned, group-isolated child. Cloneable; all clones share
/// the same state cell, so watchers observe transitions made by the
/// exit-wait task without owning the child.
#[derive(Debug, Clone)]
pub struct ManagedProcess {
    pub name: String,
    pub run_id: RunId,
    pub pid: u32,
    pub out_file: PathBuf,
    pgid: i32,
    state: Arc<Mutex<ProcessState>>,
    exit_code: Arc<Mutex<Option<i32>>>,
}

impl ManagedProcess {
    pub fn state(&self) -> ProcessState {
        *lock(&self.state)
    }

    /// Immutable once assigned; the sole handle used for termination.
    pub fn pgid(&self) -> i32 {
        self.pgid
    }

    pub fn status(&self) -> ProcessStatus {
        ProcessStatus {
            name: self.name.clone(),
            run_id: self.run_id.clone(),
            state: self.state(),
            pid: Some(self.pid),
            exit_code: *lock(&self.exit_code),
        }
    }

    /// Forward-only state transition; backward or post-terminal attempts
    /// are ignored. Returns whether the transition was applied.
    pub(crate) fn advance(&self, next: ProcessState) -> bool {
        let mut state = lock(&self.state);
        if state.can_advance_to(next) {
            tracing::debug!(name = %self.name, from = ?*state, to = ?next, "state transition");
            *state = next;
            true
        } else {
            tracing::debug!(name = %self.name, from = ?*state, to = ?next, "transition refused");
            false
        }
    }

    /// Liveness, re-derived from the OS on every call. A terminal state
    /// short-circuits the probe so a reaped (and possibly reused) pgid is
    /// never signalled again.
    pub fn is_alive(&self) -> bool {
        if self.state().is_terminal() {
            return false;
        }
        group_alive(self.pgid)
    }

    /// Send SIGTERM to the entire process group. Idempotent: a process
    /// that is already dead yields `AlreadyDead` (logged, no signal sent).
    pub fn kill_group(&self) -> KillOutcome {
        if self.state().is_terminal() {
            tracing::debug!(name = %self.name, pgid = self.pgid, "kill requested for already-dead process");
            return KillOutcome::AlreadyDead;
        }
        signal_group(self.pgid)
    }
}

#[cfg(unix)]
fn group_alive(pgid: i32) -> bool {
    // SAFETY: signal 0 performs permission/existence checks only.
    let rc = unsafe { libc::kill(-pgid, 0) };
    if rc == 0 {
        return true;
    }
    // EPERM still means the group exists.
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn group_alive(_pgid: i32) -> bool {
    false
}

#[cfg(unix)]
pub(crate) fn signal_group(pgid: i32) -> KillOutcome {
    // SAFETY: plain kill(2) on a negative pid targets the process group.
    let rc = unsafe { libc::kill(-pgid, libc::SIGTERM) };
    if rc == 0 {
        return KillOutcome::Killed;
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        tracing::debug!(pgid, "process group already gone");
        KillOutcome::AlreadyDead
    } else {
        KillOutcome::Failed(err)
    }
}

#[cfg(not(unix))]
pub(crate) fn signal_group(_pgid: i32) -> KillOutcome {
    KillOutcome::Failed(io::Error::new(
        io::ErrorKind::Unsupported,
        "process groups are only supported on unix",
    ))
}

#[cfg(target_os = "linux")]
fn set_parent_death_signal() -> io::Result<()> {
    // If the supervisor itself dies, the kernel terminates the child.
    // SAFETY: prctl with PR_SET_PDEATHSIG takes a plain signal number.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_parent_death_signal() -> io::Result<()> {
    Ok(())
}

#[derive(Debug, serde::Serialize)]
struct RunInfo {
    run_id: String,
    name: String,
    supervisor_version: String,
    started_at_unix_ms: u64,
    pid: u32,
    pgid: i32,
    program: String,
    args: Vec<String>,
    out_file: String,
}

async fn write_run_json(dir: &Path, info: &RunInfo) -> io::Result<()> {
    let path = dir.join("run.json");
    let tmp = dir.join("run.json.tmp");
    let data = serde_json::to_vec_pretty(info)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut f = tokio::fs::File::create(&tmp).await?;
    f.write_all(&data).await?;
    f.flush().await.ok();
    tokio::fs::rename(&tmp, &path).await?;
    Ok(())
}

/// Spawn `spec` detached into its own session/process group, with stdout
/// and stderr redirected to `log_dir/out.log`. The log file is opened
/// before the child exists, so no early output can be lost. Returns with
/// state already `Running`; completion is observed through the state cell,
/// never awaited here.
pub async fn spawn(
    log_dir: &Path,
    spec: SpawnSpec,
    on_failure: Option<OnFailure>,
) -> Result<ManagedProcess> {
    match std::fs::metadata(log_dir) {
        Ok(meta) if !meta.is_dir() => {
            return Err(FleetError::spawn(format!(
                "log path {} exists and is not a directory",
                log_dir.display()
            )));
        }
        Ok(_) => {}
        Err(_) => {
            std::fs::create_dir_all(log_dir).map_err(|e| {
                FleetError::spawn_io(
                    format!("create log directory {}", log_dir.display()),
                    e,
                )
            })?;
        }
    }

    let out_file = log_dir.join(OUT_LOG);
    let out = File::create(&out_file)
        .map_err(|e| FleetError::spawn_io(format!("create {}", out_file.display()), e))?;
    let err_out = out
        .try_clone()
        .map_err(|e| FleetError::spawn_io("dup log file handle", e))?;

    let mut cmd = std::process::Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(out))
        .stderr(Stdio::from(err_out));

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;

        // Best-effort descriptive name for ps/top; must never fail the
        // spawn, and a program that dislikes the argv[0] it gets simply
        // shows up under its real name.
        cmd.arg0(format!("vmfleet:{}", spec.name));

        // SAFETY: only async-signal-safe calls between fork and exec.
        unsafe {
            cmd.pre_exec(|| {
                set_parent_death_signal()?;
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let mut cmd = tokio::process::Command::from(cmd);
    let mut child = cmd
        .spawn()
        .map_err(|e| FleetError::spawn_io(format!("spawn {}", spec.program), e))?;

    let pid = child.id().ok_or_else(|| {
        FleetError::spawn("child exited before a pid could be observed")
    })?;
    // The child called setsid, so it leads a group whose id is its pid.
    let pgid = pid as i32;

    let proc = ManagedProcess {
        name: spec.name.clone(),
        run_id: spec.run_id.clone(),
        pid,
        out_file: out_file.clone(),
        pgid,
        state: Arc::new(Mutex::new(ProcessState::Starting)),
        exit_code: Arc::new(Mutex::new(None)),
    };
    proc.advance(ProcessState::Running);
    tracing::info!(name = %proc.name, pid, pgid, "spawned process group");

    let started_at_unix_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let info = RunInfo {
        run_id: spec.run_id.to_string(),
        name: spec.name.clone(),
        supervisor_version: env!("CARGO_PKG_VERSION").to_string(),
        started_at_unix_ms,
        pid,
        pgid,
        program: spec.program.clone(),
        args: spec.args.clone(),
        out_file: out_file.display().to_string(),
    };
    if let Err(err) = write_run_json(log_dir, &info).await {
        tracing::debug!(error = %err, "failed to write run.json breadcrumb");
    }

    // Exit-wait task: contain child failures here, then sweep the group so
    // a dead leader never leaves orphaned descendants behind.
    let watched = proc.clone();
    tokio::spawn(async move {
        let result = child.wait().await;
        match result {
            Ok(status) => {
                let code = status.code();
                *lock(&watched.exit_code) = code;
                let stopping = watched.state() == ProcessState::Stopping;
                if stopping || status.success() {
                    watched.advance(ProcessState::Stopped);
                } else {
                    watched.advance(ProcessState::Failed);
                    tracing::warn!(name = %watched.name, exit_code = ?code, "process failed");
                    if let Some(cb) = &on_failure {
                        cb(FleetError::Execution { exit_code: code }, watched.status());
                    }
                }
            }
            Err(err) => {
                watched.advance(ProcessState::Failed);
                tracing::error!(name = %watched.name, error = %err, "wait on child failed");
                if let Some(cb) = &on_failure {
                    cb(FleetError::Io(err), watched.status());
                }
            }
        }
        if let KillOutcome::Failed(err) = signal_group(watched.pgid) {
            tracing::warn!(name = %watched.name, error = %err, "failed to sweep process group");
        }
    });

    Ok(proc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_rejects_log_path_that_is_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("not-a-dir");
        std::fs::write(&file_path, b"x").unwrap();

        let err = spawn(
            &file_path,
            SpawnSpec::new("test", "/bin/true", vec![]),
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, FleetError::Spawn { .. }));
    }

    #[tokio::test]
    async fn spawn_creates_log_dir_and_redirects_output() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("machine").join("runs").join("r1");

        let proc = spawn(
            &log_dir,
            SpawnSpec::new(
                "echoer",
                "/bin/sh",
                vec!["-c".to_string(), "echo out; echo err 1>&2".to_string()],
            ),
            None,
        )
        .await
        .unwrap();

        wait_until_terminal(&proc).await;
        assert_eq!(proc.state(), ProcessState::Stopped);

        let contents = std::fs::read_to_string(&proc.out_file).unwrap();
        assert!(contents.contains("out"));
        assert!(contents.contains("err"));
        assert!(log_dir.join("run.json").exists());
    }

    #[tokio::test]
    async fn failure_callback_fires_on_nonzero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let on_failure: OnFailure = Arc::new(move |err, status| {
            let _ = tx.send((format!("{err}"), status));
        });

        let proc = spawn(
            dir.path(),
            SpawnSpec::new("failer", "/bin/sh", vec!["-c".to_string(), "exit 3".to_string()]),
            Some(on_failure),
        )
        .await
        .unwrap();

        wait_until_terminal(&proc).await;
        assert_eq!(proc.state(), ProcessState::Failed);

        let (message, status) = rx.recv().await.unwrap();
        assert!(message.contains("exited abnormally"));
        assert_eq!(status.exit_code, Some(3));
    }

    #[tokio::test]
    async fn kill_group_is_idempotent_after_natural_exit() {
        let dir = tempfile::tempdir().unwrap();
        let proc = spawn(
            dir.path(),
            SpawnSpec::new("quick", "/bin/true", vec![]),
            None,
        )
        .await
        .unwrap();

        wait_until_terminal(&proc).await;
        assert!(matches!(proc.kill_group(), KillOutcome::AlreadyDead));
        assert!(matches!(proc.kill_group(), KillOutcome::AlreadyDead));
    }

    #[tokio::test]
    async fn kill_group_terminates_a_running_group() {
        let dir = tempfile::tempdir().unwrap();
        let proc = spawn(
            dir.path(),
            SpawnSpec::new(
                "sleeper",
                "/bin/sh",
                vec!["-c".to_string(), "sleep 30".to_string()],
            ),
            None,
        )
        .await
        .unwrap();

        assert!(proc.is_alive());
        assert!(matches!(proc.kill_group(), KillOutcome::Killed));
        wait_until_terminal(&proc).await;
        assert!(!proc.is_alive());
        assert!(matches!(proc.kill_group(), KillOutcome::AlreadyDead));
    }

    #[tokio::test]
    async fn concurrent_spawns_get_distinct_groups_and_log_paths() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let spec = |name: &str| {
            SpawnSpec::new(name, "/bin/sh", vec!["-c".to_string(), "sleep 5".to_string()])
        };

        let (a, b) = tokio::join!(
            spawn(dir_a.path(), spec("a"), None),
            spawn(dir_b.path(), spec("b"), None),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_ne!(a.pgid(), b.pgid());
        assert_ne!(a.out_file, b.out_file);
        assert_ne!(a.run_id, b.run_id);

        a.kill_group();
        b.kill_group();
    }

    async fn wait_until_terminal(proc: &ManagedProcess) {
        for _ in 0..200 {
            if proc.state().is_terminal() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("process {} never reached a terminal state", proc.name);
    }
}
