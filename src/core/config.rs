//! Fleet configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::error::{FleetError, FleetResult};
use super::policy::RestartPolicy;
use super::process::CommandTemplate;

/// Smallest poll interval accepted for exit detection
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Container image used when no server command is given
pub const DEFAULT_CONTAINER_IMAGE: &str = "carla_0.9.15.sif";

/// Headless CARLA server inside an Apptainer container, one RPC port and GPU per instance
pub fn carla_command(image: &str) -> CommandTemplate {
    CommandTemplate::new(
        "apptainer",
        [
            "exec",
            "--nv",
            image,
            "/home/carla/CarlaUE4.sh",
            "-RenderOffScreen",
            "-nosound",
            "--carla-server",
            "-carla-rpc-port={port}",
            "-graphicsadapter={gpu}",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect(),
    )
}

/// Dashboard settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardConfig {
    pub enabled: bool,
    /// Bind address
    pub host: String,
    pub port: u16,
    /// Interval at which host counters are refreshed
    pub refresh: Duration,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 5000,
            refresh: Duration::from_secs(2),
        }
    }
}

/// Per-instance timing used by every supervisor of a fleet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorSettings {
    /// A process must stay alive this long to count as RUNNING
    pub start_grace: Duration,
    /// Time between interrupt and forced kill
    pub stop_grace: Duration,
    /// Exit polling interval
    pub poll_interval: Duration,
    /// Exit code that counts as a clean exit
    pub clean_exit_code: i32,
    pub restart: RestartPolicy,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            start_grace: Duration::from_secs(2),
            stop_grace: Duration::from_secs(10),
            poll_interval: Duration::from_millis(200),
            clean_exit_code: 0,
            restart: RestartPolicy::default(),
        }
    }
}

/// Everything a fleet run needs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Number of instances (N)
    pub instances: usize,
    /// GPU indices available to the fleet
    pub gpus: Vec<u32>,
    /// Maximum instances per GPU (M)
    pub max_per_gpu: u32,
    /// Server command with placeholders
    pub command: CommandTemplate,
    /// Port of instance 0
    pub base_port: u16,
    /// Port distance between consecutive instances
    pub port_step: u16,
    /// Directory under which run directories are created
    pub log_dir: PathBuf,
    pub supervisor: SupervisorSettings,
    pub dashboard: DashboardConfig,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            instances: 8,
            gpus: vec![0],
            max_per_gpu: 2,
            command: CommandTemplate::new(String::new(), Vec::new()),
            base_port: 2000,
            port_step: 100,
            log_dir: PathBuf::from("server_logs"),
            supervisor: SupervisorSettings::default(),
            dashboard: DashboardConfig::default(),
        }
    }
}

impl FleetConfig {
    /// Reject configurations the fleet cannot run with and fix up timing values
    pub fn validate(&mut self) -> FleetResult<()> {
        if self.instances == 0 {
            return Err(FleetError::config("instance count must be at least 1"));
        }
        if self.gpus.is_empty() {
            return Err(FleetError::config("no GPUs configured"));
        }
        if self.max_per_gpu == 0 {
            return Err(FleetError::config("max instances per GPU must be at least 1"));
        }
        if self.command.program.trim().is_empty() {
            return Err(FleetError::config("server command is empty"));
        }
        self.port_for(self.instances - 1)?;

        self.supervisor.poll_interval = self.supervisor.poll_interval.max(MIN_POLL_INTERVAL);
        self.dashboard.refresh = self.dashboard.refresh.max(Duration::from_millis(250));
        if let Some(budget) = self.supervisor.restart.budget {
            if budget.window.is_zero() {
                return Err(FleetError::config("restart window must be longer than zero"));
            }
        }
        Ok(())
    }

    /// RPC port of an instance: `base_port + ordinal * port_step`
    pub fn port_for(&self, ordinal: usize) -> FleetResult<u16> {
        let port = self.base_port as usize + ordinal * self.port_step as usize;
        u16::try_from(port).map_err(|_| {
            FleetError::config(format!("port for instance {} overflows ({})", ordinal, port))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::allocator::GpuSlot;

    fn config() -> FleetConfig {
        FleetConfig {
            command: CommandTemplate::new("server", vec![]),
            ..Default::default()
        }
    }

    #[test]
    fn ports_step_per_ordinal() {
        let c = config();
        assert_eq!(c.port_for(0).unwrap(), 2000);
        assert_eq!(c.port_for(3).unwrap(), 2300);
    }

    #[test]
    fn port_overflow_is_a_configuration_error() {
        let mut c = config();
        c.instances = 700;
        assert!(c.validate().unwrap_err().is_fatal());
    }

    #[test]
    fn validate_rejects_empty_inputs() {
        let mut c = config();
        c.instances = 0;
        assert!(c.validate().is_err());

        let mut c = config();
        c.gpus.clear();
        assert!(c.validate().is_err());

        let mut c = config();
        c.command.program = " ".into();
        assert!(c.validate().is_err());
    }

    #[test]
    fn carla_command_targets_port_and_gpu() {
        let spec = carla_command("/images/carla.sif").render(3, GpuSlot { gpu: 1, slot: 1 }, 2300);
        assert_eq!(spec.program, "apptainer");
        assert_eq!(spec.arguments[2], "/images/carla.sif");
        assert!(spec.arguments.contains(&"-carla-rpc-port=2300".to_string()));
        assert!(spec.arguments.contains(&"-graphicsadapter=1".to_string()));
    }

    #[test]
    fn validate_clamps_poll_interval() {
        let mut c = config();
        c.supervisor.poll_interval = Duration::ZERO;
        c.validate().unwrap();
        assert_eq!(c.supervisor.poll_interval, MIN_POLL_INTERVAL);
    }
}
