//! Unix process control via signals
//!
//! Servers are spawned in their own session, so their PID doubles as the process
//! group ID and group signals reach every child the container runtime forks.

use anyhow::Result;

fn signal_group(pid: u32, signal: libc::c_int, what: &str) -> Result<()> {
    let pgid = pid as libc::pid_t;
    unsafe {
        if libc::kill(-pgid, signal) == 0 {
            return Ok(());
        }
        // Not a group leader (or already reaped group), fall back to the process itself
        if libc::kill(pgid, signal) == 0 {
            Ok(())
        } else {
            anyhow::bail!(
                "Failed to {} process {}: {}",
                what,
                pid,
                std::io::Error::last_os_error()
            )
        }
    }
}

/// Ask a process group to shut down (SIGINT)
pub fn interrupt_process(pid: u32) -> Result<()> {
    signal_group(pid, libc::SIGINT, "interrupt")
}

/// Force kill a process group (SIGKILL)
pub fn kill_process(pid: u32) -> Result<()> {
    signal_group(pid, libc::SIGKILL, "kill")
}

/// Kill whatever is left in the process group of an exited leader.
///
/// Never signals `pid` itself: once the leader is reaped the PID may be reused.
pub fn kill_group(pid: u32) -> Result<()> {
    let pgid = pid as libc::pid_t;
    if unsafe { libc::kill(-pgid, libc::SIGKILL) } == 0 {
        Ok(())
    } else {
        anyhow::bail!(
            "Failed to kill process group {}: {}",
            pid,
            std::io::Error::last_os_error()
        )
    }
}

/// Put the calling (child) process in a new session. Runs between fork and exec.
pub fn detach_session() -> std::io::Result<()> {
    unsafe {
        libc::setsid();
    }
    Ok(())
}
