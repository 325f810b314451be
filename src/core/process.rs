//! Process management - Spawning and controlling simulation server processes

use std::fs::File;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::allocator::GpuSlot;
use crate::platform;

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitOutcome {
    /// Exit code, when the process exited on its own
    pub code: Option<i32>,
    /// Terminating signal, when it was killed
    pub signal: Option<i32>,
}

impl ExitOutcome {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    pub fn is_clean(&self, clean_code: i32) -> bool {
        self.code == Some(clean_code)
    }
}

impl From<ExitStatus> for ExitOutcome {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl std::fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "killed by signal {}", signal),
            (None, None) => f.write_str("unknown exit"),
        }
    }
}

/// Server command with per-instance placeholders.
///
/// Recognised placeholders: `{gpu}`, `{slot}`, `{ordinal}`, `{port}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub program: String,
    pub arguments: Vec<String>,
}

impl CommandTemplate {
    pub fn new(program: impl Into<String>, arguments: Vec<String>) -> Self {
        Self {
            program: program.into(),
            arguments,
        }
    }

    /// Build the concrete launch description for one instance
    pub fn render(&self, ordinal: usize, assignment: GpuSlot, port: u16) -> LaunchSpec {
        let fill = |s: &str| {
            s.replace("{gpu}", &assignment.gpu.to_string())
                .replace("{slot}", &assignment.slot.to_string())
                .replace("{ordinal}", &ordinal.to_string())
                .replace("{port}", &port.to_string())
        };
        LaunchSpec {
            ordinal,
            assignment,
            port,
            program: fill(&self.program),
            arguments: self.arguments.iter().map(|a| fill(a)).collect(),
        }
    }
}

/// Everything needed to start one attempt of one instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub ordinal: usize,
    pub assignment: GpuSlot,
    pub port: u16,
    pub program: String,
    pub arguments: Vec<String>,
}

impl LaunchSpec {
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.arguments.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Where a process writes its stdout and stderr
#[derive(Debug)]
pub enum OutputSink {
    /// Attempt log file
    File(File),
    /// Supervisor's own stderr, used when the log file is unavailable
    Inherit,
}

/// A running (or finished) external process
pub trait ProcessHandle: Send {
    fn pid(&self) -> u32;

    /// Non-blocking exit check
    fn try_wait(&mut self) -> std::io::Result<Option<ExitOutcome>>;

    /// Ask the process to shut down gracefully
    fn interrupt(&mut self) -> Result<()>;

    /// Kill the process without waiting for cooperation
    fn kill(&mut self) -> Result<()>;

    /// Kill whatever the exited process left behind in its group
    fn kill_leftovers(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Something that can start external processes
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec, output: OutputSink) -> Result<Box<dyn ProcessHandle>>;

    /// Kill a process whose handle was lost with its supervisor
    fn kill_pid(&self, pid: u32) -> Result<()>;
}

/// Launches real OS processes with `std::process::Command`
#[derive(Debug, Clone, Default)]
pub struct CommandLauncher {
    /// Working directory for every server (defaults to ours)
    pub working_directory: Option<PathBuf>,
    /// Extra environment variables for every server
    pub environment: Vec<(String, String)>,
}

impl CommandLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_environment(
        mut self,
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        self.environment.extend(vars);
        self
    }
}

impl ProcessLauncher for CommandLauncher {
    fn launch(&self, spec: &LaunchSpec, output: OutputSink) -> Result<Box<dyn ProcessHandle>> {
        info!(
            "Spawning instance {} on {}: {}",
            spec.ordinal,
            spec.assignment,
            spec.command_line()
        );

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.arguments);

        if let Some(ref work_dir) = self.working_directory {
            cmd.current_dir(work_dir);
        }

        cmd.env("FLEET_INSTANCE", spec.ordinal.to_string());
        cmd.env("FLEET_GPU", spec.assignment.gpu.to_string());
        cmd.env("FLEET_SLOT", spec.assignment.slot.to_string());
        cmd.env("FLEET_PORT", spec.port.to_string());
        for (key, value) in &self.environment {
            cmd.env(key, value);
        }

        // Own session, so signals reach the whole container process tree
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            unsafe {
                cmd.pre_exec(platform::unix::detach_session);
            }
        }

        let (stdout, stderr) = match output {
            OutputSink::File(file) => {
                let err = file.try_clone().context("Failed to duplicate log handle")?;
                (Stdio::from(file), Stdio::from(err))
            }
            OutputSink::Inherit => (Stdio::inherit(), Stdio::inherit()),
        };

        let child = cmd
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", spec.program))?;

        let pid = child.id();
        info!("Spawned process with PID {}", pid);

        Ok(Box::new(ChildHandle { child, pid }))
    }

    fn kill_pid(&self, pid: u32) -> Result<()> {
        debug!("Killing orphaned PID {}", pid);
        platform::kill_process(pid)
    }
}

/// Handle around a spawned `std::process::Child`
pub struct ChildHandle {
    child: Child,
    pid: u32,
}

impl ProcessHandle for ChildHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn try_wait(&mut self) -> std::io::Result<Option<ExitOutcome>> {
        Ok(self.child.try_wait()?.map(ExitOutcome::from))
    }

    fn interrupt(&mut self) -> Result<()> {
        debug!("Interrupting PID {}", self.pid);
        platform::interrupt_process(self.pid)
    }

    fn kill(&mut self) -> Result<()> {
        debug!("Killing PID {}", self.pid);
        if let Err(e) = platform::kill_process(self.pid) {
            debug!("Group kill failed ({}), killing child directly", e);
            self.child.kill().context("Failed to kill process")?;
        }
        Ok(())
    }

    fn kill_leftovers(&mut self) -> Result<()> {
        platform::kill_group(self.pid)
    }
}
