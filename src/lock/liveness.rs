//! Process liveness and host identity checks used to judge lock staleness.

use std::sync::OnceLock;

/// Returns true if a process with `pid` exists on this machine.
///
/// PID 0 is never a valid lock owner. On platforms without a cheap liveness check the
/// answer is `true`, so an unverifiable lock is never deleted as stale.
pub fn process_exists(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    if pid == std::process::id() {
        return true;
    }
    pid_visible(pid)
}

#[cfg(target_os = "linux")]
fn pid_visible(pid: u32) -> bool {
    std::path::Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(all(unix, not(target_os = "linux")))]
fn pid_visible(pid: u32) -> bool {
    use std::process::{Command, Stdio};

    // kill -0 delivers no signal; it only reports whether the PID exists.
    Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}

#[cfg(not(unix))]
const fn pid_visible(_pid: u32) -> bool {
    true
}

/// Hostname of this machine, or an empty string if it cannot be determined.
///
/// Cached for the life of the process so every lock written and checked by
/// one process agrees on its own host.
pub fn hostname() -> &'static str {
    static HOST: OnceLock<String> = OnceLock::new();
    HOST.get_or_init(|| {
        ["/proc/sys/kernel/hostname", "/etc/hostname"]
            .iter()
            .filter_map(|p| std::fs::read_to_string(p).ok())
            .map(|s| s.trim().to_string())
            .find(|s| !s.is_empty())
            .or_else(|| std::env::var("HOSTNAME").ok())
            .or_else(|| std::env::var("COMPUTERNAME").ok())
            .unwrap_or_default()
    })
}
