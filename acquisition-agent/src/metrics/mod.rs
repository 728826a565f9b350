//! Machine details reported to coordinators
//!
//! Snapshot taken on demand for `update` orders and discovery requests:
//! - Memory totals
//! - Per-disk capacity
//! - Global and per-core CPU usage
//! - Local time and offset to the time server

use serde::Serialize;
use sysinfo::{Disks, System};
use tracing::debug;

use crate::timesync::TimeInfo;

/// Transient status snapshot (never persisted)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineDetails {
    pub ram: RamMetrics,
    pub rom: Vec<DiskMetrics>,
    pub cpu: f32,
    pub cpu_multi: Vec<f32>,
    pub time_info: TimeInfo,
}

/// Memory in bytes
#[derive(Debug, Clone, Serialize)]
pub struct RamMetrics {
    pub total: u64,
    pub available: u64,
}

/// Capacity of one mounted disk, in bytes
#[derive(Debug, Clone, Serialize)]
pub struct DiskMetrics {
    pub total: u64,
    pub free: u64,
    pub device: String,
    /// Mount point
    pub io: String,
}

impl MachineDetails {
    pub async fn collect(time_info: TimeInfo) -> Self {
        debug!("Collecting machine details...");

        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu();

        // Wait a moment for accurate CPU readings
        tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
        sys.refresh_cpu();

        let ram = RamMetrics {
            total: sys.total_memory(),
            available: sys.available_memory(),
        };

        let cpu = sys.global_cpu_info().cpu_usage();
        let cpu_multi = sys.cpus().iter().map(|c| c.cpu_usage()).collect();

        MachineDetails {
            ram,
            rom: DiskMetrics::collect(),
            cpu,
            cpu_multi,
            time_info,
        }
    }
}

impl DiskMetrics {
    fn collect() -> Vec<Self> {
        let disks = Disks::new_with_refreshed_list();

        disks
            .list()
            .iter()
            .map(|disk| DiskMetrics {
                total: disk.total_space(),
                free: disk.available_space(),
                device: disk.name().to_string_lossy().to_string(),
                io: disk.mount_point().display().to_string(),
            })
            .collect()
    }
}
