//! Host telemetry: CPU, RAM and disk metrics for the scratch filesystem.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use sysinfo::{Disks, System};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// One telemetry sample. All sizes in GiB, CPU as a percentage.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct SystemHealth {
    pub cpu_percent: f32,
    pub ram_total_gb: f64,
    pub ram_used_gb: f64,
    pub ram_available_gb: f64,
    pub disk_total_gb: f64,
    pub disk_used_gb: f64,
    pub disk_free_gb: f64,
}

/// Telemetry probe. CPU usage is computed against the previous refresh, so the
/// first sample after startup reports 0% CPU; callers sampling on a periodic
/// tick get meaningful numbers from the second sample on.
pub struct Telemetry {
    sys: Mutex<System>,
    temp_dir: PathBuf,
}

impl Telemetry {
    pub fn new(temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            sys: Mutex::new(System::new()),
            temp_dir: temp_dir.into(),
        }
    }

    /// Sample CPU, RAM and the disk backing the scratch directory.
    /// Never fails; metrics that cannot be read come back as zero.
    pub fn sample(&self) -> SystemHealth {
        let mut health = SystemHealth::default();
        {
            let mut sys = match self.sys.lock() {
                Ok(sys) => sys,
                Err(poisoned) => poisoned.into_inner(),
            };
            sys.refresh_cpu_usage();
            sys.refresh_memory();
            health.cpu_percent = sys.global_cpu_usage();
            health.ram_total_gb = sys.total_memory() as f64 / GIB;
            health.ram_used_gb = sys.used_memory() as f64 / GIB;
            health.ram_available_gb = sys.available_memory() as f64 / GIB;
        }

        if let Some((total, free)) = disk_space_for(&self.temp_dir) {
            health.disk_total_gb = total as f64 / GIB;
            health.disk_free_gb = free as f64 / GIB;
            health.disk_used_gb = (total.saturating_sub(free)) as f64 / GIB;
        } else {
            tracing::debug!(path = %self.temp_dir.display(), "no disk found for scratch path");
        }
        health
    }

    /// Free bytes on the filesystem backing the scratch directory, for disk
    /// admission checks. `None` when the mount cannot be identified.
    pub fn disk_free_bytes(&self) -> Option<u64> {
        disk_space_for(&self.temp_dir).map(|(_, free)| free)
    }
}

/// (total, available) bytes of the disk whose mount point is the longest
/// prefix of `path`.
fn disk_space_for(path: &Path) -> Option<(u64, u64)> {
    let disks = Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| (d.total_space(), d.available_space()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_is_infallible() {
        let probe = Telemetry::new(std::env::temp_dir());
        let health = probe.sample();
        assert!(health.ram_total_gb >= 0.0);
        assert!(health.disk_free_gb <= health.disk_total_gb || health.disk_total_gb == 0.0);
    }

    #[test]
    fn second_sample_has_memory() {
        let probe = Telemetry::new(std::env::temp_dir());
        probe.sample();
        let health = probe.sample();
        assert!(health.ram_total_gb > 0.0);
    }
}
