//! Core module - Fleet state, instance supervision, and resource monitoring

pub mod allocator;
pub mod config;
mod error;
mod fleet;
mod instance;
pub mod logs;
mod monitor;
pub mod policy;
pub mod process;
pub mod resource;
mod session;
mod supervisor;
#[cfg(test)]
pub mod testing;

pub use allocator::{GpuAllocator, GpuSlot};
pub use config::{DashboardConfig, FleetConfig, SupervisorSettings};
pub use error::{FleetError, FleetResult};
pub use fleet::{FleetManager, FleetStatus, FleetSummary};
pub use instance::{InstanceRecord, InstanceState};
pub use monitor::ResourceMonitor;
pub use process::{CommandLauncher, CommandTemplate};
pub use resource::HostView;
pub use session::{RunLog, RunSession};
