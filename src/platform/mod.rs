//! Platform-specific process control

#[cfg(unix)]
pub mod unix;

use anyhow::Result;

/// Interrupt a process (graceful shutdown request)
pub fn interrupt_process(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        unix::interrupt_process(pid)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        anyhow::bail!("Unsupported platform")
    }
}

/// Force kill a process
pub fn kill_process(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        unix::kill_process(pid)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        anyhow::bail!("Unsupported platform")
    }
}

/// Kill the remaining members of an exited process group
pub fn kill_group(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        unix::kill_group(pid)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        anyhow::bail!("Unsupported platform")
    }
}
