//! Run session - One invocation of the fleet

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Timestamp format shared by run and instance directory names
pub const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Fleet-wide log files kept in the run directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunLog {
    /// Supervisor diagnostics
    Supervisor,
    /// One `nvidia-smi` block per poll
    Gpu,
    /// One port probe block per poll
    Ports,
    /// One CPU and memory block per poll
    System,
}

impl RunLog {
    pub fn all() -> &'static [RunLog] {
        &[RunLog::Supervisor, RunLog::Gpu, RunLog::Ports, RunLog::System]
    }

    pub fn name(&self) -> &'static str {
        match self {
            RunLog::Supervisor => "supervisor",
            RunLog::Gpu => "gpu",
            RunLog::Ports => "ports",
            RunLog::System => "system",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::all().iter().copied().find(|log| log.name() == name)
    }
}

/// Identity of one fleet invocation. Immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSession {
    pub created_at: DateTime<Local>,
    /// `<log_dir>/run_<stamp>`
    pub root_dir: PathBuf,
    pub instance_count: usize,
    pub gpus: Vec<u32>,
    pub max_per_gpu: u32,
}

impl RunSession {
    pub fn new(log_dir: &Path, instance_count: usize, gpus: Vec<u32>, max_per_gpu: u32) -> Self {
        Self::at(Local::now(), log_dir, instance_count, gpus, max_per_gpu)
    }

    pub fn at(
        created_at: DateTime<Local>,
        log_dir: &Path,
        instance_count: usize,
        gpus: Vec<u32>,
        max_per_gpu: u32,
    ) -> Self {
        let root_dir = log_dir.join(format!("run_{}", created_at.format(STAMP_FORMAT)));
        Self {
            created_at,
            root_dir,
            instance_count,
            gpus,
            max_per_gpu,
        }
    }

    pub fn stamp(&self) -> String {
        self.created_at.format(STAMP_FORMAT).to_string()
    }

    /// Create the run directory. Failure is not fatal for the fleet.
    pub fn create_root(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root_dir)
    }

    pub fn run_log(&self, log: RunLog) -> PathBuf {
        self.root_dir.join(format!("{}.log", log.name()))
    }

    /// Supervisor diagnostics file
    pub fn supervisor_log(&self) -> PathBuf {
        self.run_log(RunLog::Supervisor)
    }

    /// Latest snapshot written by the dashboard poller
    pub fn status_file(&self) -> PathBuf {
        self.root_dir.join("status.json")
    }
}
