//! Process identity and liveness checks

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nix::{errno::Errno, sys::signal::kill, unistd::Pid};

/// Nanoseconds since the UNIX epoch
pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Time elapsed since a timestamp taken with [`now_nanos`]
pub fn age_of(timestamp_nanos: u64) -> Duration {
    Duration::from_nanos(now_nanos().saturating_sub(timestamp_nanos))
}

pub fn current_pid() -> u32 {
    std::process::id()
}

/// Check whether a process exists.
///
/// Sends signal 0: `ESRCH` means the process is gone, while `EPERM` means it
/// exists but belongs to another user.
pub fn process_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(_) => true,
    }
}

/// Whether an endpoint owned by `pid` with the given last heartbeat counts as
/// alive
pub fn endpoint_alive(pid: u32, heartbeat: u64, heartbeat_timeout: Option<Duration>) -> bool {
    if pid == current_pid() {
        return true;
    }
    if !process_alive(pid) {
        return false;
    }
    match heartbeat_timeout {
        Some(limit) => age_of(heartbeat) <= limit,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_process_is_alive() {
        assert!(process_alive(current_pid()));
        assert!(endpoint_alive(current_pid(), 0, Some(Duration::from_millis(1))));
    }

    #[test]
    fn test_exited_child_is_dead() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!process_alive(pid));
        assert!(!endpoint_alive(pid, now_nanos(), None));
    }

    #[test]
    fn test_invalid_pids() {
        assert!(!process_alive(0));
        assert!(!process_alive(u32::MAX));
    }

    #[test]
    fn test_heartbeat_age() {
        let now = now_nanos();
        assert!(age_of(now) < Duration::from_secs(1));
        assert!(age_of(0) > Duration::from_secs(1));
    }
}
