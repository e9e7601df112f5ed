//! Core data models for the resource manager

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Resource units keyed by kind, e.g. `{cpu: 2.0, memory: 1024.0}`
pub type ResourceUnits = BTreeMap<ResourceKind, f64>;

/// The four managed resource dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Cpu,
    Memory,
    Disk,
    Network,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Cpu,
        ResourceKind::Memory,
        ResourceKind::Disk,
        ResourceKind::Network,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Cpu => "cpu",
            ResourceKind::Memory => "memory",
            ResourceKind::Disk => "disk",
            ResourceKind::Network => "network",
        }
    }

    /// Unit each kind is measured in: cores, MB, MB, Mbps
    pub fn unit_label(&self) -> &'static str {
        match self {
            ResourceKind::Cpu => "cores",
            ResourceKind::Memory => "MB",
            ResourceKind::Disk => "MB",
            ResourceKind::Network => "Mbps",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One utilization sample across all resource kinds, in percent of capacity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSample {
    pub timestamp: i64,
    pub cpu_pct: f64,
    pub memory_pct: f64,
    pub disk_pct: f64,
    pub network_pct: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessMetrics>,
    /// True when this entry stands in for a failed sampling attempt
    #[serde(default)]
    pub gap: bool,
}

impl ResourceSample {
    pub fn utilization(&self, kind: ResourceKind) -> f64 {
        match kind {
            ResourceKind::Cpu => self.cpu_pct,
            ResourceKind::Memory => self.memory_pct,
            ResourceKind::Disk => self.disk_pct,
            ResourceKind::Network => self.network_pct,
        }
    }
}

/// Per-process metrics attached to a sample when enabled
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessMetrics {
    pub pid: u32,
    pub cpu_pct: f64,
    pub rss_mb: f64,
    pub disk_read_mb: f64,
    pub disk_written_mb: f64,
}

/// Severity attached to a threshold alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Warning,
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Warning => "warning",
            AlertLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Edge-triggered alert emitted when a sampled value crosses a threshold
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceAlert {
    pub kind: ResourceKind,
    pub level: AlertLevel,
    pub value: f64,
    pub timestamp: i64,
}

/// Pressure classification, ordered from calm to saturated
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureLevel {
    Normal,
    Moderate,
    High,
    Critical,
}

impl PressureLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PressureLevel::Normal => "normal",
            PressureLevel::Moderate => "moderate",
            PressureLevel::High => "high",
            PressureLevel::Critical => "critical",
        }
    }

    /// Numeric form exported as a gauge value
    pub fn as_gauge(&self) -> i64 {
        match self {
            PressureLevel::Normal => 0,
            PressureLevel::Moderate => 1,
            PressureLevel::High => 2,
            PressureLevel::Critical => 3,
        }
    }
}

impl fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Allocation placement strategy selected per pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    Priority,
    FairShare,
    BestFit,
    MlOptimized,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Priority => "priority",
            StrategyKind::FairShare => "fair-share",
            StrategyKind::BestFit => "best-fit",
            StrategyKind::MlOptimized => "ml-optimized",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a single allocation record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationState {
    Pending,
    Active,
    Reclaimed,
    Released,
}

impl fmt::Display for AllocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AllocationState::Pending => "pending",
            AllocationState::Active => "active",
            AllocationState::Reclaimed => "reclaimed",
            AllocationState::Released => "released",
        };
        f.write_str(s)
    }
}

/// A request for resources on behalf of an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub agent_id: String,
    pub resources: ResourceUnits,
    /// 0 is lowest priority, 255 highest
    pub priority: u8,
}

impl ResourceRequest {
    pub fn new(agent_id: impl Into<String>, resources: ResourceUnits, priority: u8) -> Self {
        Self {
            agent_id: agent_id.into(),
            resources,
            priority,
        }
    }
}

/// Bookkeeping entry for one grant held by the allocator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationRecord {
    pub id: String,
    pub agent_id: String,
    /// Units originally asked for
    pub requested: ResourceUnits,
    /// Units actually granted; empty while pending
    pub resources: ResourceUnits,
    pub priority: u8,
    pub strategy: StrategyKind,
    pub created_at: i64,
    pub last_used_at: i64,
    /// Exponentially weighted recent utilization in [0, 1]
    #[serde(default)]
    pub usage: f64,
    pub state: AllocationState,
    /// Set while a reclaim grace countdown is running
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reclaim_deadline: Option<i64>,
}

/// Why an allocation request was denied
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    /// Granting would push the pool past capacity times the over-provisioning factor
    CapacityExceeded,
    /// A requested amount was smaller than the pool's minimum allocatable unit
    BelowMinimumUnit { kind: ResourceKind },
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenialReason::CapacityExceeded => f.write_str("capacity_exceeded"),
            DenialReason::BelowMinimumUnit { kind } => {
                write!(f, "below_minimum_unit({kind})")
            }
        }
    }
}

/// Outcome of an allocation request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum Decision {
    Granted {
        allocation_id: String,
        resources: ResourceUnits,
    },
    Partial {
        allocation_id: String,
        resources: ResourceUnits,
        shortfall: ResourceUnits,
    },
    Denied {
        reason: DenialReason,
        shortfall: ResourceUnits,
        /// Present when the request was parked for later promotion
        #[serde(skip_serializing_if = "Option::is_none")]
        pending_id: Option<String>,
    },
}

impl Decision {
    pub fn is_granted(&self) -> bool {
        matches!(self, Decision::Granted { .. })
    }

    pub fn allocation_id(&self) -> Option<&str> {
        match self {
            Decision::Granted { allocation_id, .. } | Decision::Partial { allocation_id, .. } => {
                Some(allocation_id)
            }
            Decision::Denied { .. } => None,
        }
    }
}

/// How an agent may grow or shed its allocation under pressure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingPolicy {
    pub enabled: bool,
    /// Upper bound on growth as a multiple of the required resources
    pub ceiling_factor: f64,
    /// Fraction of the current allocation shed or regained per adjustment
    pub step_factor: f64,
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            ceiling_factor: 1.5,
            step_factor: 0.25,
        }
    }
}

/// Health scoring knobs for an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthPolicy {
    /// Below this score the agent is failed and its resources force-released
    pub floor: f64,
    pub interval_secs: u64,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            floor: 0.2,
            interval_secs: 30,
        }
    }
}

/// Static description of an agent's resource needs and behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResourceProfile {
    pub agent_id: String,
    /// Units the agent needs to run at full capability
    pub required: ResourceUnits,
    /// Guaranteed minimum that reclaim and scale-down must never breach
    pub qos_floor: ResourceUnits,
    pub priority: u8,
    #[serde(default)]
    pub scaling: ScalingPolicy,
    #[serde(default)]
    pub health: HealthPolicy,
}
