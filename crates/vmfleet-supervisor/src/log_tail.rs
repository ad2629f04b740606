//! Incremental tailing of a managed process's log file.
//!
//! Each subscription owns its own byte cursor: read whatever appeared
//! since the last position, decode it, hand it to the subscriber. The
//! cursor never moves backward. The tick removes itself only once the
//! process is dead *and* a read at that point produced nothing new, so
//! every byte written before exit is eventually emitted.

use std::{io, path::Path, sync::Arc, time::Duration};

use futures_util::FutureExt;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::config;
use crate::error::Result;
use crate::scheduler::{PeriodicHandle, Scheduler, Tick};
use crate::supervisor::ManagedProcess;

#[derive(Debug, Clone, Copy)]
pub struct LogTailConfig {
    pub poll_interval: Duration,
}

impl Default for LogTailConfig {
    fn default() -> Self {
        Self {
            poll_interval: config::log_poll_interval(),
        }
    }
}

// A transient failure on a post-mortem read must not end the tail with
// bytes still unread; give it a few more ticks before giving up.
const MAX_DEAD_READ_RETRIES: u8 = 3;

struct TailState {
    cursor: u64,
    dead_read_errors: u8,
    on_chunk: Box<dyn FnMut(String) + Send>,
}

/// Apply one read result to the tail: emit new bytes, decide whether the
/// registration stays. Removal happens only on an error-free empty read
/// after death, or once post-mortem reads kept failing.
fn apply_read(
    st: &mut TailState,
    alive: bool,
    read: io::Result<Option<(Vec<u8>, u64)>>,
    name: &str,
) -> Tick {
    match read {
        Ok(Some((bytes, next_cursor))) if !bytes.is_empty() => {
            st.cursor = next_cursor;
            st.dead_read_errors = 0;
            (st.on_chunk)(String::from_utf8_lossy(&bytes).into_owned());
            Tick::Continue
        }
        Ok(_) if !alive => Tick::Remove,
        Ok(_) => Tick::Continue,
        Err(err) => {
            tracing::debug!(name, error = %err, "log read failed");
            if alive {
                Tick::Continue
            } else if st.dead_read_errors < MAX_DEAD_READ_RETRIES {
                st.dead_read_errors += 1;
                Tick::Continue
            } else {
                Tick::Remove
            }
        }
    }
}

/// Register a tail on `proc`'s log file. Chunks are lossy-decoded UTF-8;
/// the subscriber runs on the scheduler task, so it should stay cheap.
pub fn tail(
    scheduler: &Scheduler,
    proc: ManagedProcess,
    cfg: LogTailConfig,
    on_chunk: impl FnMut(String) + Send + 'static,
) -> Result<PeriodicHandle> {
    // Ticks never re-enter, so the mutex is uncontended; it only carries
    // the cursor and callback into each tick's future.
    let state = Arc::new(tokio::sync::Mutex::new(TailState {
        cursor: 0,
        dead_read_errors: 0,
        on_chunk: Box::new(on_chunk),
    }));

    scheduler.schedule_periodic(cfg.poll_interval, move || {
        let proc = proc.clone();
        let state = state.clone();
        async move {
            let mut st = state.lock().await;
            // Sample liveness before reading: anything written before the
            // process died is picked up by this read or a later one, and
            // only a post-mortem empty read ends the tail.
            let alive = proc.is_alive();
            let read = read_new_bytes(&proc.out_file, st.cursor).await;
            apply_read(&mut st, alive, read, &proc.name)
        }
        .boxed()
    })
}

/// Read everything between `cursor` and the current end of file.
/// `Ok(None)` means the file does not exist yet. A shrunken file never
/// rewinds the cursor.
async fn read_new_bytes(path: &Path, cursor: u64) -> io::Result<Option<(Vec<u8>, u64)>> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    let len = meta.len();
    if len <= cursor {
        return Ok(Some((Vec::new(), cursor)));
    }

    let mut f = tokio::fs::File::open(path).await?;
    f.seek(io::SeekFrom::Start(cursor)).await?;
    let to_read = (len - cursor) as usize;
    let mut buf = vec![0u8; to_read];
    f.read_exact(&mut buf).await?;
    Ok(Some((buf, cursor + to_read as u64)))
}
