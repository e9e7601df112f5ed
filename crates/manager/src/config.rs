//! Daemon configuration

use std::time::Duration;

use anyhow::{Context, Result};
use manager_lib::alloc::AllocatorConfig;
use manager_lib::models::StrategyKind;
use manager_lib::monitor::MonitorConfig;
use manager_lib::pressure::PressureConfig;
use serde::Deserialize;

/// Daemon configuration
///
/// Loaded from `RM_`-prefixed environment variables; every field has a
/// production default. Range validation happens when the manager is built.
#[derive(Debug, Clone, Deserialize)]
pub struct ManagerConfig {
    /// Instance name carried on every structured log event
    #[serde(default = "default_instance")]
    pub instance: String,

    /// Platform sampling interval in seconds
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,

    /// Pressure evaluation interval in seconds
    #[serde(default = "default_pressure_interval")]
    pub pressure_interval_secs: u64,

    /// Placement strategy: priority, fair-share, best-fit, or ml-optimized
    #[serde(default = "default_strategy")]
    pub strategy: StrategyKind,

    /// Pool capacity in CPU cores
    #[serde(default = "default_max_cpu_cores")]
    pub max_cpu_cores: f64,

    /// Pool capacity in MB of memory
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: f64,

    /// Pool capacity in MB of disk
    #[serde(default = "default_max_disk_mb")]
    pub max_disk_mb: f64,

    /// Pool capacity in Mbps of network bandwidth
    #[serde(default = "default_max_network_mbps")]
    pub max_network_mbps: f64,

    /// Multiplier applied to every capacity when admitting allocations
    #[serde(default = "default_over_provisioning_factor")]
    pub over_provisioning_factor: f64,

    /// Grant partial allocations instead of denying outright
    #[serde(default)]
    pub allow_sharing: bool,

    /// Forecast pressure escalations from recent utilization trend
    #[serde(default)]
    pub prediction_enabled: bool,

    /// Snapshot file restored at boot and written at shutdown
    #[serde(default)]
    pub state_path: Option<String>,
}

fn default_instance() -> String {
    "resource-manager".to_string()
}

fn default_monitor_interval() -> u64 {
    10
}

fn default_pressure_interval() -> u64 {
    15
}

fn default_strategy() -> StrategyKind {
    StrategyKind::Priority
}

fn default_max_cpu_cores() -> f64 {
    8.0
}

fn default_max_memory_mb() -> f64 {
    16384.0
}

fn default_max_disk_mb() -> f64 {
    102400.0
}

fn default_max_network_mbps() -> f64 {
    1000.0
}

fn default_over_provisioning_factor() -> f64 {
    1.0
}

impl ManagerConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("RM"))
            .build()?;

        config
            .try_deserialize()
            .context("invalid RM_* environment configuration")
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            interval: Duration::from_secs(self.monitor_interval_secs),
            ..MonitorConfig::default()
        }
    }

    pub fn allocator_config(&self) -> AllocatorConfig {
        AllocatorConfig {
            strategy: self.strategy,
            max_cpu_cores: self.max_cpu_cores,
            max_memory_mb: self.max_memory_mb,
            max_disk_mb: self.max_disk_mb,
            max_network_mbps: self.max_network_mbps,
            over_provisioning_factor: self.over_provisioning_factor,
            allow_sharing: self.allow_sharing,
            ..AllocatorConfig::default()
        }
    }

    pub fn pressure_config(&self) -> PressureConfig {
        let mut config = PressureConfig {
            evaluation_interval: Duration::from_secs(self.pressure_interval_secs),
            ..PressureConfig::default()
        };
        config.prediction.enabled = self.prediction_enabled;
        config
    }
}
