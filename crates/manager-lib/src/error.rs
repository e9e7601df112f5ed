//! Error taxonomy for the resource manager
//!
//! Expected allocation denials travel inside [`crate::models::Decision`];
//! the types here cover construction-time validation, lifecycle misuse,
//! sampling failure, and state persistence.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::agent::AgentState;
use crate::models::ResourceKind;

/// Invalid configuration detected at construction time
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("history capacity must be at least 1, got {0}")]
    InvalidHistoryCapacity(usize),

    #[error("capacity for {kind} must be positive, got {value}")]
    InvalidCapacity { kind: ResourceKind, value: f64 },

    #[error("minimum unit for {kind} must be positive, got {value}")]
    InvalidMinimumUnit { kind: ResourceKind, value: f64 },

    #[error("over-provisioning factor must be >= 1.0, got {0}")]
    InvalidOverProvisioningFactor(f64),

    #[error(
        "thresholds for {kind} must satisfy 0 < warning < critical <= 100, got {warning}/{critical}"
    )]
    InvalidThreshold {
        kind: ResourceKind,
        warning: f64,
        critical: f64,
    },

    #[error("pressure thresholds for {kind} must be strictly increasing and within (0, 100]")]
    InvalidPressureThresholds { kind: ResourceKind },

    #[error("interval must be non-zero")]
    ZeroInterval,

    #[error("prediction confidence floor must be within [0, 1], got {0}")]
    InvalidConfidenceFloor(f64),

    #[error("prediction model '{0}' must be registered before use")]
    UnregisteredModel(String),

    #[error("agent '{0}' is already registered")]
    DuplicateAgent(String),

    #[error("qos floor for agent '{agent_id}' exceeds its required {kind} ({floor} > {required})")]
    FloorAboveRequired {
        agent_id: String,
        kind: ResourceKind,
        floor: f64,
        required: f64,
    },

    #[error("health floor must be within [0, 1), got {0}")]
    InvalidHealthFloor(f64),

    #[error("scaling ceiling must be >= 1.0, got {0}")]
    InvalidScalingCeiling(f64),

    #[error("scaling step must be positive, got {0}")]
    InvalidScalingStep(f64),
}

/// Contract violations on the allocate/release boundary
#[derive(Debug, Error)]
pub enum AllocError {
    #[error("allocation '{0}' not found")]
    UnknownAllocation(String),

    #[error("allocation '{id}' is {state}, expected an active record")]
    NotActive { id: String, state: String },

    #[error(
        "qos floor violated for agent '{agent_id}': {kind} would drop to {attempted} below floor {floor}"
    )]
    QosViolation {
        agent_id: String,
        kind: ResourceKind,
        floor: f64,
        attempted: f64,
    },

    #[error("capacity invariant violated for {kind}: {allocated} allocated against limit {limit}")]
    InvariantViolation {
        kind: ResourceKind,
        allocated: f64,
        limit: f64,
    },
}

/// Transient failure while reading platform metrics
#[derive(Debug, Error)]
pub enum SampleError {
    #[error("platform sampler unavailable: {0}")]
    Unavailable(String),

    #[error("sampling failed: {0}")]
    Failed(String),
}

/// Agent lifecycle misuse or resource starvation
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: AgentState, to: AgentState },

    #[error("insufficient resources for agent '{agent_id}': shortfall {shortfall:?}")]
    InsufficientResources {
        agent_id: String,
        shortfall: BTreeMap<ResourceKind, f64>,
    },

    #[error("agent '{0}' holds no allocation")]
    NoAllocation(String),

    #[error("agent '{0}' is not registered")]
    UnknownAgent(String),

    #[error(transparent)]
    Alloc(#[from] AllocError),
}

/// Snapshot export/import failure
#[derive(Debug, Error)]
pub enum StateError {
    #[error("snapshot checksum mismatch: expected {expected}, computed {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),

    #[error(
        "snapshot violates capacity invariant for {kind}: {allocated} allocated against limit {limit}"
    )]
    InvariantViolation {
        kind: ResourceKind,
        allocated: f64,
        limit: f64,
    },

    #[error("snapshot agent profile rejected: {0}")]
    InvalidProfile(#[from] ConfigurationError),

    #[error("snapshot refers to unknown agent '{0}'")]
    UnknownAgent(String),

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization failure: {0}")]
    Serde(#[from] serde_json::Error),
}
