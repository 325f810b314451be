//! Host resources - CPU, memory and GPU counters shown next to the fleet

use std::fmt::Write;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// System-wide resource information
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemResources {
    /// Total CPU usage percentage
    pub cpu_percent: f32,
    /// Per-core CPU usage
    pub cpu_per_core: Vec<f32>,
    /// 1, 5 and 15 minute load averages
    pub load_average: [f64; 3],
    /// Total physical memory in bytes
    pub total_memory: u64,
    /// Used physical memory in bytes
    pub used_memory: u64,
    /// Available physical memory in bytes
    pub available_memory: u64,
    /// Number of CPU cores
    pub cpu_cores: usize,
    /// CPU brand/model name
    pub cpu_name: String,
    /// System uptime in seconds
    pub uptime_secs: u64,
}

impl SystemResources {
    /// Memory usage percentage
    pub fn memory_percent(&self) -> f32 {
        if self.total_memory > 0 {
            (self.used_memory as f32 / self.total_memory as f32) * 100.0
        } else {
            0.0
        }
    }

    pub fn used_memory_string(&self) -> String {
        format_bytes(self.used_memory)
    }

    pub fn total_memory_string(&self) -> String {
        format_bytes(self.total_memory)
    }
}

/// One row of `nvidia-smi --query-gpu`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuStats {
    pub index: u32,
    pub name: String,
    /// Utilization percentage, if reported
    pub utilization_percent: Option<f32>,
    /// Used memory in MiB
    pub memory_used_mb: Option<u64>,
    /// Total memory in MiB
    pub memory_total_mb: Option<u64>,
    pub temperature_c: Option<f32>,
}

impl GpuStats {
    pub fn memory_percent(&self) -> Option<f32> {
        match (self.memory_used_mb, self.memory_total_mb) {
            (Some(used), Some(total)) if total > 0 => Some(used as f32 / total as f32 * 100.0),
            _ => None,
        }
    }
}

/// Query arguments for `nvidia-smi`, matching the column order of [`parse_gpu_csv`]
pub const NVIDIA_SMI_QUERY: &[&str] = &[
    "--query-gpu=index,name,utilization.gpu,memory.used,memory.total,temperature.gpu",
    "--format=csv,noheader,nounits",
];

/// Parse `nvidia-smi` CSV output. Malformed lines are skipped.
pub fn parse_gpu_csv(output: &str) -> Vec<GpuStats> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() < 6 {
                return None;
            }
            Some(GpuStats {
                index: fields[0].parse().ok()?,
                name: fields[1].to_string(),
                utilization_percent: fields[2].parse().ok(),
                memory_used_mb: fields[3].parse().ok(),
                memory_total_mb: fields[4].parse().ok(),
                temperature_c: fields[5].parse().ok(),
            })
        })
        .collect()
}

/// Current resource usage of one instance process
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// CPU usage percentage (0.0-100.0 per core)
    pub cpu_percent: f32,
    /// Resident memory in bytes
    pub memory_bytes: u64,
}

impl ResourceUsage {
    pub fn memory_string(&self) -> String {
        format_bytes(self.memory_bytes)
    }

    pub fn cpu_string(&self) -> String {
        format!("{:.1}%", self.cpu_percent)
    }
}

/// Per-instance observations gathered by the poller
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceHealth {
    pub ordinal: usize,
    pub port: u16,
    /// Something accepts connections on the RPC port
    pub listening: bool,
    pub usage: Option<ResourceUsage>,
}

/// Everything the poller learned about the host in one pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostView {
    pub sampled_at: Option<DateTime<Utc>>,
    pub system: SystemResources,
    pub gpus: Vec<GpuStats>,
    pub instances: Vec<InstanceHealth>,
}

impl HostView {
    pub fn instance(&self, ordinal: usize) -> Option<&InstanceHealth> {
        self.instances.iter().find(|i| i.ordinal == ordinal)
    }

    fn report_header(&self) -> String {
        let stamp = self
            .sampled_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "never sampled".to_string());
        format!("=== {} ===\n", stamp)
    }

    /// Block appended to `gpu.log` for this sample
    pub fn gpu_report(&self) -> String {
        let mut out = self.report_header();
        if self.gpus.is_empty() {
            out.push_str("no GPU data\n");
        }
        for gpu in &self.gpus {
            let _ = writeln!(
                out,
                "GPU {} {}: util {}, memory {}/{} MiB, temp {}",
                gpu.index,
                gpu.name,
                gpu.utilization_percent
                    .map(|u| format!("{:.0}%", u))
                    .unwrap_or_else(|| "n/a".into()),
                gpu.memory_used_mb.map(|m| m.to_string()).unwrap_or_else(|| "?".into()),
                gpu.memory_total_mb.map(|m| m.to_string()).unwrap_or_else(|| "?".into()),
                gpu.temperature_c
                    .map(|t| format!("{:.0} C", t))
                    .unwrap_or_else(|| "n/a".into()),
            );
        }
        out
    }

    /// Block appended to `ports.log` for this sample
    pub fn ports_report(&self) -> String {
        let mut out = self.report_header();
        for health in &self.instances {
            let _ = writeln!(
                out,
                "instance {} port {}: {}",
                health.ordinal,
                health.port,
                if health.listening { "LISTENING" } else { "NOT LISTENING" }
            );
        }
        out
    }

    /// Block appended to `system.log` for this sample
    pub fn system_report(&self) -> String {
        let mut out = self.report_header();
        let sys = &self.system;
        let _ = writeln!(
            out,
            "cpu {:.1}% over {} cores, load {:.2} {:.2} {:.2}",
            sys.cpu_percent,
            sys.cpu_cores,
            sys.load_average[0],
            sys.load_average[1],
            sys.load_average[2]
        );
        let _ = writeln!(
            out,
            "memory {} / {} ({:.1}%)",
            sys.used_memory_string(),
            sys.total_memory_string(),
            sys.memory_percent()
        );
        for health in &self.instances {
            if let Some(usage) = &health.usage {
                let _ = writeln!(
                    out,
                    "instance {}: cpu {}, memory {}",
                    health.ordinal,
                    usage.cpu_string(),
                    usage.memory_string()
                );
            }
        }
        out
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
