//! Resource manager library
//!
//! This crate provides the core functionality for:
//! - Platform resource monitoring with threshold alerting
//! - Pool-based allocation with pluggable placement strategies
//! - Pressure detection, forecasting, and graduated response
//! - Per-agent lifecycle management with QoS floors
//! - State snapshot export/import and health reporting

pub mod agent;
pub mod alloc;
pub mod error;
pub mod health;
pub mod history;
pub mod manager;
pub mod models;
pub mod monitor;
pub mod observability;
pub mod pressure;
pub mod state;

pub use agent::{AgentResourceManager, AgentState, LivenessProbe};
pub use alloc::{Allocator, AllocatorConfig, ReclaimConfig};
pub use error::{AllocError, ConfigurationError, LifecycleError, SampleError, StateError};
pub use health::{ComponentHealth, ComponentStatus, HealthRegistry, HealthReport};
pub use manager::{ResourceManager, ResourceManagerBuilder};
pub use models::*;
pub use monitor::{MonitorConfig, PlatformSampler, ResourceMonitor, SysinfoSampler};
pub use observability::{ManagerMetrics, StructuredLogger};
pub use pressure::{PressureConfig, PressureDetector, PressureTransition};
pub use state::{load_snapshot, save_snapshot, StateSnapshot};
