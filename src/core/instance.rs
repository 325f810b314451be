//! Instance records - State of a single supervised simulation server

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use super::allocator::GpuSlot;
use super::process::ExitOutcome;

/// Lifecycle state of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    /// Created, not launched yet
    Pending,
    /// Launched, inside the start grace period
    Starting,
    /// Alive past the start grace period
    Running,
    /// Exited with the configured clean code
    ExitedClean,
    /// Exited with any other code or was killed by a signal
    Crashed,
    /// Waiting out the cooldown before relaunch
    Restarting,
    /// Stop requested, waiting for the process to go away
    Stopping,
    /// Stopped on request
    Stopped,
    /// Restart budget exhausted, needs an operator
    Dead,
}

impl InstanceState {
    pub fn all() -> &'static [InstanceState] {
        &[
            Self::Pending,
            Self::Starting,
            Self::Running,
            Self::ExitedClean,
            Self::Crashed,
            Self::Restarting,
            Self::Stopping,
            Self::Stopped,
            Self::Dead,
        ]
    }

    /// No further transitions happen from these states
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Dead)
    }

    /// A process may currently exist for the instance
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }

    /// Badge colour used by the HTML view
    pub fn color(&self) -> &'static str {
        match self {
            Self::Pending => "#6b7280",     // Dark gray
            Self::Starting => "#fbbf24",    // Yellow
            Self::Running => "#22c55e",     // Green
            Self::ExitedClean => "#3b82f6", // Blue
            Self::Crashed => "#ef4444",     // Red
            Self::Restarting => "#a855f7",  // Purple
            Self::Stopping => "#fb923c",    // Orange
            Self::Stopped => "#9ca3af",     // Gray
            Self::Dead => "#7f1d1d",        // Dark red
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::ExitedClean => "EXITED_CLEAN",
            Self::Crashed => "CRASHED",
            Self::Restarting => "RESTARTING",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Dead => "DEAD",
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// One supervised simulation-server worker.
///
/// Written only by its own supervisor; everybody else works on clones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Position in the fleet, `0..N`
    pub ordinal: usize,
    /// GPU and slot, fixed for the whole run
    pub assignment: GpuSlot,
    /// RPC port handed to the server
    pub port: u16,
    /// Current state
    pub state: InstanceState,
    /// Operating system process ID while a process exists
    pub pid: Option<u32>,
    /// Number of relaunches so far
    pub restart_count: u32,
    /// When the current (or last) attempt was launched
    pub last_start: Option<DateTime<Utc>>,
    /// When the last attempt ended
    pub stopped_at: Option<DateTime<Utc>>,
    /// How the last attempt ended
    pub last_exit: Option<ExitOutcome>,
    /// Last per-instance failure
    pub last_error: Option<String>,
    /// Log file of the current attempt
    pub log_path: Option<PathBuf>,
    /// Set once when output capture could not be set up
    pub logging_error: Option<String>,
    /// The last stop needed a forced kill
    pub forced_kill: bool,
}

pub type SharedRecord = Arc<RwLock<InstanceRecord>>;

impl InstanceRecord {
    pub fn new(ordinal: usize, assignment: GpuSlot, port: u16) -> Self {
        Self {
            ordinal,
            assignment,
            port,
            state: InstanceState::Pending,
            pid: None,
            restart_count: 0,
            last_start: None,
            stopped_at: None,
            last_exit: None,
            last_error: None,
            log_path: None,
            logging_error: None,
            forced_kill: false,
        }
    }

    pub fn shared(self) -> SharedRecord {
        Arc::new(RwLock::new(self))
    }

    /// Exit code of the last attempt, if it exited normally
    pub fn last_exit_code(&self) -> Option<i32> {
        self.last_exit.and_then(|e| e.code)
    }

    /// Get uptime duration if a process is alive
    pub fn uptime(&self) -> Option<chrono::Duration> {
        if !self.state.is_active() {
            return None;
        }
        self.last_start.map(|started| Utc::now() - started)
    }

    /// Format uptime as human-readable string
    pub fn uptime_string(&self) -> String {
        match self.uptime() {
            Some(duration) => {
                let secs = duration.num_seconds();
                if secs < 60 {
                    format!("{}s", secs)
                } else if secs < 3600 {
                    format!("{}m {}s", secs / 60, secs % 60)
                } else if secs < 86400 {
                    format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
                } else {
                    format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
                }
            }
            None => "-".to_string(),
        }
    }

    /// Mark instance as starting, before the launch is attempted
    pub fn mark_starting(&mut self, log_path: Option<PathBuf>) {
        self.state = InstanceState::Starting;
        self.pid = None;
        self.last_start = Some(Utc::now());
        self.stopped_at = None;
        self.log_path = log_path;
        self.forced_kill = false;
    }

    /// Record the PID of a successful launch
    pub fn attach_pid(&mut self, pid: u32) {
        self.pid = Some(pid);
    }

    /// Mark instance as running
    pub fn mark_running(&mut self) {
        self.state = InstanceState::Running;
    }

    /// Mark instance as exited with the clean code
    pub fn mark_exited_clean(&mut self, outcome: ExitOutcome) {
        self.state = InstanceState::ExitedClean;
        self.pid = None;
        self.stopped_at = Some(Utc::now());
        self.last_exit = Some(outcome);
    }

    /// Mark instance as crashed
    pub fn mark_crashed(&mut self, outcome: Option<ExitOutcome>, error: String) {
        self.state = InstanceState::Crashed;
        self.pid = None;
        self.stopped_at = Some(Utc::now());
        if outcome.is_some() {
            self.last_exit = outcome;
        }
        self.last_error = Some(error);
    }

    /// Mark instance as waiting for relaunch
    pub fn mark_restarting(&mut self) {
        self.state = InstanceState::Restarting;
    }

    /// Mark instance as stopping
    pub fn mark_stopping(&mut self) {
        self.state = InstanceState::Stopping;
    }

    /// Mark instance as stopped
    pub fn mark_stopped(&mut self, outcome: Option<ExitOutcome>, forced_kill: bool) {
        self.state = InstanceState::Stopped;
        self.pid = None;
        self.stopped_at = Some(Utc::now());
        if outcome.is_some() {
            self.last_exit = outcome;
        }
        self.forced_kill = forced_kill;
    }

    /// Mark instance as permanently given up on
    pub fn mark_dead(&mut self, error: String) {
        self.state = InstanceState::Dead;
        self.pid = None;
        self.last_error = Some(error);
    }

    /// Increment restart counter
    pub fn increment_restart_count(&mut self) {
        self.restart_count += 1;
    }

    /// Record a logging failure, keeping only the first one
    pub fn note_logging_error(&mut self, error: String) -> bool {
        if self.logging_error.is_some() {
            return false;
        }
        self.logging_error = Some(error);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> InstanceRecord {
        InstanceRecord::new(3, GpuSlot { gpu: 1, slot: 1 }, 2300)
    }

    #[test]
    fn crash_keeps_assignment_and_exit() {
        let mut r = record();
        r.mark_starting(None);
        r.attach_pid(42);
        r.mark_running();
        assert_eq!(r.pid, Some(42));
        r.mark_crashed(Some(ExitOutcome::code(7)), "exit code 7".into());
        assert_eq!(r.state, InstanceState::Crashed);
        assert_eq!(r.pid, None);
        assert_eq!(r.last_exit_code(), Some(7));
        assert_eq!(r.assignment, GpuSlot { gpu: 1, slot: 1 });
        assert_eq!(r.uptime_string(), "-");
    }

    #[test]
    fn launch_failure_keeps_previous_exit() {
        let mut r = record();
        r.mark_crashed(Some(ExitOutcome::code(3)), "exit code 3".into());
        r.mark_crashed(None, "spawn failed".into());
        assert_eq!(r.last_exit_code(), Some(3));
        assert_eq!(r.last_error.as_deref(), Some("spawn failed"));
    }

    #[test]
    fn logging_error_is_reported_once() {
        let mut r = record();
        assert!(r.note_logging_error("read-only fs".into()));
        assert!(!r.note_logging_error("still read-only".into()));
        assert_eq!(r.logging_error.as_deref(), Some("read-only fs"));
    }

    #[test]
    fn state_serializes_in_upper_snake_case() {
        let json = serde_json::to_string(&InstanceState::ExitedClean).unwrap();
        assert_eq!(json, "\"EXITED_CLEAN\"");
        assert!(InstanceState::all()
            .iter()
            .all(|s| serde_json::to_string(s).unwrap() == format!("\"{}\"", s.label())));
    }

    #[test]
    fn terminal_states() {
        assert!(InstanceState::Dead.is_terminal());
        assert!(InstanceState::Stopped.is_terminal());
        assert!(!InstanceState::Crashed.is_terminal());
    }
}
