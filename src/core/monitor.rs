//! Resource monitoring - Host, GPU and per-instance observations

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use chrono::Utc;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, trace};

use super::fleet::FleetStatus;
use super::instance::InstanceState;
use super::resource::{
    parse_gpu_csv, GpuStats, HostView, InstanceHealth, ResourceUsage, SystemResources,
    NVIDIA_SMI_QUERY,
};

/// Upper bound for one `nvidia-smi` call
pub const GPU_QUERY_TIMEOUT: Duration = Duration::from_secs(5);
/// Upper bound for one RPC port probe
pub const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Resource monitor that tracks system and per-process resource usage
pub struct ResourceMonitor {
    system: System,
    /// Binary queried for GPU counters
    gpu_tool: String,
}

impl ResourceMonitor {
    pub fn new() -> Self {
        Self::with_gpu_tool("nvidia-smi")
    }

    pub fn with_gpu_tool(gpu_tool: impl Into<String>) -> Self {
        Self {
            system: System::new_all(),
            gpu_tool: gpu_tool.into(),
        }
    }

    /// Refresh CPU, memory and the given processes
    pub fn refresh(&mut self, pids: &[u32]) {
        self.system
            .refresh_cpu_specifics(CpuRefreshKind::everything());
        self.system
            .refresh_memory_specifics(MemoryRefreshKind::everything());
        let pids: Vec<Pid> = pids.iter().map(|p| Pid::from_u32(*p)).collect();
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&pids),
            true,
            ProcessRefreshKind::everything(),
        );
        trace!("Resource monitor refreshed");
    }

    /// Get system-wide resource information
    pub fn system_resources(&self) -> SystemResources {
        let cpus = self.system.cpus();
        let load = System::load_average();

        SystemResources {
            cpu_percent: self.system.global_cpu_usage(),
            cpu_per_core: cpus.iter().map(|cpu| cpu.cpu_usage()).collect(),
            load_average: [load.one, load.five, load.fifteen],
            total_memory: self.system.total_memory(),
            used_memory: self.system.used_memory(),
            available_memory: self.system.available_memory(),
            cpu_cores: cpus.len(),
            cpu_name: cpus
                .first()
                .map(|c| c.brand().to_string())
                .unwrap_or_default(),
            uptime_secs: System::uptime(),
        }
    }

    /// Get resource usage for a specific process
    pub fn process_usage(&self, pid: u32) -> Option<ResourceUsage> {
        let process = self.system.process(Pid::from_u32(pid))?;
        Some(ResourceUsage {
            cpu_percent: process.cpu_usage(),
            memory_bytes: process.memory(),
        })
    }

    /// Query GPU counters. Any failure yields an empty list.
    pub async fn gpu_stats(&self) -> Vec<GpuStats> {
        let output = Command::new(&self.gpu_tool)
            .args(NVIDIA_SMI_QUERY)
            .kill_on_drop(true)
            .output();
        match tokio::time::timeout(GPU_QUERY_TIMEOUT, output).await {
            Ok(Ok(out)) if out.status.success() => {
                parse_gpu_csv(&String::from_utf8_lossy(&out.stdout))
            }
            Ok(Ok(out)) => {
                debug!("{} exited with {}", self.gpu_tool, out.status);
                Vec::new()
            }
            Ok(Err(e)) => {
                debug!("{} unavailable: {}", self.gpu_tool, e);
                Vec::new()
            }
            Err(_) => {
                debug!("{} timed out", self.gpu_tool);
                Vec::new()
            }
        }
    }

    /// Take one full sample of the host and every live instance
    pub async fn sample(&mut self, status: &FleetStatus) -> HostView {
        let pids: Vec<u32> = status.instances.iter().filter_map(|r| r.pid).collect();
        self.refresh(&pids);

        let mut usage: HashMap<u32, ResourceUsage> = HashMap::new();
        for pid in pids {
            if let Some(u) = self.process_usage(pid) {
                usage.insert(pid, u);
            }
        }

        let mut instances = Vec::with_capacity(status.instances.len());
        for record in &status.instances {
            let listening = record.state == InstanceState::Running
                && probe_port(record.port, PORT_PROBE_TIMEOUT).await;
            instances.push(InstanceHealth {
                ordinal: record.ordinal,
                port: record.port,
                listening,
                usage: record.pid.and_then(|pid| usage.remove(&pid)),
            });
        }

        HostView {
            sampled_at: Some(Utc::now()),
            system: self.system_resources(),
            gpus: self.gpu_stats().await,
            instances,
        }
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Something accepts TCP connections on the local port
pub async fn probe_port(port: u16, timeout: Duration) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn probe_sees_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(probe_port(port, PORT_PROBE_TIMEOUT).await);
        drop(listener);
        assert!(!probe_port(port, PORT_PROBE_TIMEOUT).await);
    }

    #[tokio::test]
    async fn missing_gpu_tool_yields_no_gpus() {
        let monitor = ResourceMonitor::with_gpu_tool("/nonexistent/nvidia-smi");
        assert!(monitor.gpu_stats().await.is_empty());
    }

    #[test]
    fn own_process_is_visible() {
        let mut monitor = ResourceMonitor::new();
        let pid = std::process::id();
        monitor.refresh(&[pid]);
        assert!(monitor.process_usage(pid).is_some());
        let system = monitor.system_resources();
        assert!(system.total_memory > 0);
        assert!(system.cpu_cores > 0);
    }
}
