//! Platform metric sources
//!
//! The monitor samples through the [`PlatformSampler`] trait so tests can
//! script utilization sequences. The production implementation reads host
//! and process metrics via sysinfo.

use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use sysinfo::{Disks, Networks, System};

use crate::error::SampleError;
use crate::models::{ProcessMetrics, ResourceSample};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Trait for platform utilization sources
#[async_trait]
pub trait PlatformSampler: Send + Sync {
    /// Take one utilization sample across all resource kinds
    async fn sample(&self, include_process: bool) -> Result<ResourceSample, SampleError>;
}

/// Host sampler backed by sysinfo
///
/// Network utilization is reported against a configured link capacity since
/// the platform only exposes transferred byte counters.
pub struct SysinfoSampler {
    state: Mutex<SamplerState>,
    network_capacity_mbps: f64,
}

struct SamplerState {
    system: System,
    disks: Disks,
    networks: Networks,
    last_network: Option<NetworkCounters>,
}

struct NetworkCounters {
    taken_at: Instant,
    total_bytes: u64,
}

impl SysinfoSampler {
    pub fn new(network_capacity_mbps: f64) -> Self {
        let mut system = System::new_all();
        system.refresh_all();

        Self {
            state: Mutex::new(SamplerState {
                system,
                disks: Disks::new_with_refreshed_list(),
                networks: Networks::new_with_refreshed_list(),
                last_network: None,
            }),
            network_capacity_mbps,
        }
    }
}

#[async_trait]
impl PlatformSampler for SysinfoSampler {
    async fn sample(&self, include_process: bool) -> Result<ResourceSample, SampleError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| SampleError::Unavailable("sampler state lock poisoned".to_string()))?;

        state.system.refresh_all();
        state.disks.refresh();
        state.networks.refresh();

        let cpu_pct = state.system.global_cpu_usage() as f64;

        let total_memory = state.system.total_memory();
        let memory_pct = if total_memory > 0 {
            state.system.used_memory() as f64 / total_memory as f64 * 100.0
        } else {
            0.0
        };

        let (disk_total, disk_available) = state
            .disks
            .iter()
            .fold((0u64, 0u64), |(total, avail), disk| {
                (total + disk.total_space(), avail + disk.available_space())
            });
        let disk_pct = if disk_total > 0 {
            (disk_total - disk_available) as f64 / disk_total as f64 * 100.0
        } else {
            0.0
        };

        let network_pct = {
            let now = Instant::now();
            let total_bytes: u64 = state
                .networks
                .iter()
                .map(|(_, data)| data.total_received() + data.total_transmitted())
                .sum();

            let pct = match &state.last_network {
                Some(prev) if now > prev.taken_at && total_bytes >= prev.total_bytes => {
                    let elapsed = now.duration_since(prev.taken_at).as_secs_f64();
                    if elapsed > 0.0 && self.network_capacity_mbps > 0.0 {
                        let mbps = (total_bytes - prev.total_bytes) as f64 * 8.0
                            / elapsed
                            / 1_000_000.0;
                        (mbps / self.network_capacity_mbps * 100.0).clamp(0.0, 100.0)
                    } else {
                        0.0
                    }
                }
                // First sample has no baseline to compute a rate from
                _ => 0.0,
            };

            state.last_network = Some(NetworkCounters {
                taken_at: now,
                total_bytes,
            });
            pct
        };

        let process = if include_process {
            let pid = sysinfo::get_current_pid()
                .map_err(|e| SampleError::Failed(format!("cannot resolve own pid: {e}")))?;
            let process = state
                .system
                .process(pid)
                .ok_or_else(|| SampleError::Failed(format!("own process {pid} not visible")))?;
            let disk_usage = process.disk_usage();

            Some(ProcessMetrics {
                pid: pid.as_u32(),
                cpu_pct: process.cpu_usage() as f64,
                rss_mb: process.memory() as f64 / BYTES_PER_MB,
                disk_read_mb: disk_usage.total_read_bytes as f64 / BYTES_PER_MB,
                disk_written_mb: disk_usage.total_written_bytes as f64 / BYTES_PER_MB,
            })
        } else {
            None
        };

        Ok(ResourceSample {
            timestamp: chrono::Utc::now().timestamp(),
            cpu_pct,
            memory_pct,
            disk_pct,
            network_pct,
            process,
            gap: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sysinfo_sampler_produces_bounded_percentages() {
        let sampler = SysinfoSampler::new(1000.0);
        let sample = sampler.sample(false).await.unwrap();

        assert!(sample.memory_pct >= 0.0 && sample.memory_pct <= 100.0);
        assert!(sample.disk_pct >= 0.0 && sample.disk_pct <= 100.0);
        assert!(sample.network_pct >= 0.0 && sample.network_pct <= 100.0);
        assert!(!sample.gap);
        assert!(sample.process.is_none());
        assert!(sample.timestamp > 0);
    }

    #[tokio::test]
    async fn test_sysinfo_sampler_includes_process_metrics() {
        let sampler = SysinfoSampler::new(1000.0);
        let sample = sampler.sample(true).await.unwrap();

        let process = sample.process.expect("own process should be visible");
        assert_eq!(process.pid, std::process::id());
        assert!(process.rss_mb > 0.0);
    }
}
