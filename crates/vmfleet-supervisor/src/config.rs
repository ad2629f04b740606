use std::{path::PathBuf, time::Duration};

const DEFAULT_STOP_TIMEOUT_MS: u64 = 6_000;
const DEFAULT_WATCHDOG_INTERVAL_MS: u64 = 100;
const DEFAULT_LOG_POLL_INTERVAL_MS: u64 = 50;
const DEFAULT_STATUS_POLL_INTERVAL_MS: u64 = 50;

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse::<u64>().ok())
}

/// Root directory for per-machine run state (log files, run breadcrumbs).
/// Relative paths are resolved against the current working directory.
pub fn data_root() -> PathBuf {
    let raw = std::env::var("VMFLEET_DATA_ROOT").unwrap_or_else(|_| "./data".to_string());
    let p = PathBuf::from(raw);
    if p.is_absolute() {
        p
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(p)
    }
}

/// How long a cooperatively-stopping machine gets before the forced kill.
pub fn stop_timeout() -> Duration {
    Duration::from_millis(
        env_u64("VMFLEET_STOP_TIMEOUT_MS")
            .map(|v| v.clamp(500, 10 * 60 * 1000))
            .unwrap_or(DEFAULT_STOP_TIMEOUT_MS),
    )
}

pub fn watchdog_interval() -> Duration {
    Duration::from_millis(
        env_u64("VMFLEET_WATCHDOG_INTERVAL_MS")
            .map(|v| v.clamp(10, 10_000))
            .unwrap_or(DEFAULT_WATCHDOG_INTERVAL_MS),
    )
}

pub fn log_poll_interval() -> Duration {
    Duration::from_millis(
        env_u64("VMFLEET_LOG_POLL_INTERVAL_MS")
            .map(|v| v.clamp(10, 10_000))
            .unwrap_or(DEFAULT_LOG_POLL_INTERVAL_MS),
    )
}

pub fn status_poll_interval() -> Duration {
    Duration::from_millis(
        env_u64("VMFLEET_STATUS_POLL_INTERVAL_MS")
            .map(|v| v.clamp(10, 10_000))
            .unwrap_or(DEFAULT_STATUS_POLL_INTERVAL_MS),
    )
}
