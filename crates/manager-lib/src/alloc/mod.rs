//! Resource allocation
//!
//! Tracks grants against per-kind capacity pools under a single lock so the
//! capacity invariant is never observed violated. Placement is delegated to
//! pluggable strategies; denials for capacity park the request for promotion
//! once units free up, and a periodic sweep reclaims idle grants.

mod strategy;

pub use strategy::{
    strategy_for, AllocationStrategy, PendingRequest, PoolView, StrategyDecision,
};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use self::strategy::UNIT_EPSILON;
use crate::error::{AllocError, ConfigurationError, StateError};
use crate::models::{
    AllocationRecord, AllocationState, Decision, DenialReason, ResourceKind, ResourceRequest,
    ResourceUnits, StrategyKind,
};
use crate::observability::ManagerMetrics;

/// Default reclaim sweep cadence
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Tolerance when comparing recorded against derived totals
const DRIFT_EPSILON: f64 = 1e-6;

/// Reclaim policy for idle allocations
#[derive(Debug, Clone)]
pub struct ReclaimConfig {
    pub enabled: bool,
    /// An allocation untouched for this long is an idle candidate
    pub idle_timeout: Duration,
    /// Recent utilization below this marks the allocation underused
    pub usage_threshold: f64,
    /// Countdown between marking and force-release
    pub grace_period: Duration,
    pub sweep_interval: Duration,
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_timeout: Duration::from_secs(300),
            usage_threshold: 0.2,
            grace_period: Duration::from_secs(60),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// Configuration for the allocator
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    pub strategy: StrategyKind,
    pub max_cpu_cores: f64,
    pub max_memory_mb: f64,
    pub max_disk_mb: f64,
    pub max_network_mbps: f64,
    /// Limits are capacity times this factor; 1.0 disables over-commit
    pub over_provisioning_factor: f64,
    /// Whether partial grants are allowed when a request does not fit
    pub allow_sharing: bool,
    pub minimum_units: ResourceUnits,
    pub reclaim: ReclaimConfig,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Priority,
            max_cpu_cores: 8.0,
            max_memory_mb: 16_384.0,
            max_disk_mb: 102_400.0,
            max_network_mbps: 1_000.0,
            over_provisioning_factor: 1.0,
            allow_sharing: false,
            minimum_units: [
                (ResourceKind::Cpu, 0.1),
                (ResourceKind::Memory, 64.0),
                (ResourceKind::Disk, 256.0),
                (ResourceKind::Network, 10.0),
            ]
            .into_iter()
            .collect(),
            reclaim: ReclaimConfig::default(),
        }
    }
}

impl AllocatorConfig {
    pub fn capacity(&self) -> ResourceUnits {
        [
            (ResourceKind::Cpu, self.max_cpu_cores),
            (ResourceKind::Memory, self.max_memory_mb),
            (ResourceKind::Disk, self.max_disk_mb),
            (ResourceKind::Network, self.max_network_mbps),
        ]
        .into_iter()
        .collect()
    }

    /// Per-kind grant ceiling: capacity times the over-provisioning factor
    pub fn limits(&self) -> ResourceUnits {
        self.capacity()
            .into_iter()
            .map(|(kind, value)| (kind, value * self.over_provisioning_factor))
            .collect()
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        for (kind, value) in self.capacity() {
            if value <= 0.0 {
                return Err(ConfigurationError::InvalidCapacity { kind, value });
            }
        }
        if self.over_provisioning_factor < 1.0 {
            return Err(ConfigurationError::InvalidOverProvisioningFactor(
                self.over_provisioning_factor,
            ));
        }
        for (kind, value) in &self.minimum_units {
            if *value <= 0.0 {
                return Err(ConfigurationError::InvalidMinimumUnit {
                    kind: *kind,
                    value: *value,
                });
            }
        }
        if self.reclaim.enabled && self.reclaim.sweep_interval.is_zero() {
            return Err(ConfigurationError::ZeroInterval);
        }
        Ok(())
    }
}

/// What happened to an allocation, for event consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationAction {
    Granted,
    Partial,
    Denied,
    Released,
    Reclaimed,
}

impl AllocationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationAction::Granted => "granted",
            AllocationAction::Partial => "partial",
            AllocationAction::Denied => "denied",
            AllocationAction::Released => "released",
            AllocationAction::Reclaimed => "reclaimed",
        }
    }
}

/// Event published for every allocation state change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationEvent {
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocation_id: Option<String>,
    pub action: AllocationAction,
    pub resources: ResourceUnits,
    pub timestamp: i64,
}

/// Serialized pool bookkeeping, guarded by the allocator lock
struct PoolState {
    /// Units granted per kind over active and reclaimed records
    allocated: ResourceUnits,
    records: HashMap<String, AllocationRecord>,
    /// Parked request ids in arrival order
    pending: Vec<String>,
    /// Guaranteed minimum per agent, registered by agent managers
    qos_floors: HashMap<String, ResourceUnits>,
}

impl PoolState {
    fn new() -> Self {
        Self {
            allocated: ResourceUnits::new(),
            records: HashMap::new(),
            pending: Vec::new(),
            qos_floors: HashMap::new(),
        }
    }

    fn allocated_of(&self, kind: ResourceKind) -> f64 {
        self.allocated.get(&kind).copied().unwrap_or(0.0)
    }

    fn add_allocated(&mut self, units: &ResourceUnits) {
        for (kind, amount) in units {
            *self.allocated.entry(*kind).or_insert(0.0) += amount;
        }
    }

    fn sub_allocated(&mut self, units: &ResourceUnits) {
        for (kind, amount) in units {
            let entry = self.allocated.entry(*kind).or_insert(0.0);
            *entry = (*entry - amount).max(0.0);
        }
    }

    /// Granted units per agent over active records
    fn agent_active_totals(&self) -> HashMap<String, ResourceUnits> {
        let mut totals: HashMap<String, ResourceUnits> = HashMap::new();
        for record in self.records.values() {
            if record.state == AllocationState::Active {
                let entry = totals.entry(record.agent_id.clone()).or_default();
                for (kind, amount) in &record.resources {
                    *entry.entry(*kind).or_insert(0.0) += amount;
                }
            }
        }
        totals
    }
}

struct SweeperTask {
    shutdown: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// Serialized resource allocator over one set of capacity pools
pub struct Allocator {
    config: AllocatorConfig,
    strategy: Arc<dyn AllocationStrategy>,
    pool: Mutex<PoolState>,
    events_tx: mpsc::UnboundedSender<AllocationEvent>,
    next_id: AtomicU64,
    metrics: ManagerMetrics,
    sweeper: Mutex<Option<SweeperTask>>,
}

impl Allocator {
    /// Create an allocator with the built-in strategy named in the config
    pub fn new(
        config: AllocatorConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<AllocationEvent>), ConfigurationError> {
        let strategy = strategy_for(config.strategy);
        Self::with_strategy(config, strategy)
    }

    /// Create an allocator with a caller-provided strategy implementation
    pub fn with_strategy(
        config: AllocatorConfig,
        strategy: Arc<dyn AllocationStrategy>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<AllocationEvent>), ConfigurationError> {
        config.validate()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok((
            Self {
                config,
                strategy,
                pool: Mutex::new(PoolState::new()),
                events_tx,
                next_id: AtomicU64::new(1),
                metrics: ManagerMetrics::new(),
                sweeper: Mutex::new(None),
            },
            events_rx,
        ))
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    pub fn strategy_kind(&self) -> StrategyKind {
        self.strategy.kind()
    }

    /// Request units for an agent
    ///
    /// Expected denials come back inside the [`Decision`]; capacity denials
    /// are parked for promotion, below-minimum requests are rejected outright.
    pub async fn allocate(&self, request: ResourceRequest) -> Decision {
        let mut state = self.pool.lock().await;
        let now = chrono::Utc::now().timestamp();
        let mut events = Vec::new();

        let decision = self.allocate_locked(&mut state, request, now, &mut events);
        self.publish_gauges(&state);
        drop(state);

        for event in events {
            self.emit(event);
        }
        decision
    }

    fn allocate_locked(
        &self,
        state: &mut PoolState,
        request: ResourceRequest,
        now: i64,
        events: &mut Vec<AllocationEvent>,
    ) -> Decision {
        // Below-minimum requests are rejected outright, never parked
        for (kind, amount) in &request.resources {
            let minimum = self
                .config
                .minimum_units
                .get(kind)
                .copied()
                .unwrap_or(0.0);
            if *amount <= 0.0 || *amount + UNIT_EPSILON < minimum {
                debug!(
                    agent_id = %request.agent_id,
                    kind = %kind,
                    amount = amount,
                    minimum = minimum,
                    "Request below minimum allocatable unit"
                );
                events.push(self.event(
                    &request.agent_id,
                    None,
                    AllocationAction::Denied,
                    request.resources.clone(),
                    now,
                ));
                return Decision::Denied {
                    reason: DenialReason::BelowMinimumUnit { kind: *kind },
                    shortfall: ResourceUnits::new(),
                    pending_id: None,
                };
            }
        }

        let view = self.build_view(state);
        match self.strategy.decide(&request, &view) {
            StrategyDecision::Grant(proposed) => {
                // Clamp to both the request and free capacity before booking
                let granted: ResourceUnits = request
                    .resources
                    .iter()
                    .map(|(kind, requested)| {
                        let amount = proposed
                            .get(kind)
                            .copied()
                            .unwrap_or(0.0)
                            .min(*requested)
                            .min(view.free_of(*kind))
                            .max(0.0);
                        (*kind, amount)
                    })
                    .collect();

                let full = request
                    .resources
                    .iter()
                    .all(|(kind, requested)| {
                        granted.get(kind).copied().unwrap_or(0.0) + UNIT_EPSILON >= *requested
                    });

                if !full {
                    let sub_minimum = granted.iter().any(|(kind, amount)| {
                        *amount + UNIT_EPSILON < view.minimum_unit_of(*kind)
                    });
                    if !view.allow_sharing || sub_minimum {
                        return self.park_denied(state, request, now, events);
                    }
                }

                let id = self.next_allocation_id();
                let record = AllocationRecord {
                    id: id.clone(),
                    agent_id: request.agent_id.clone(),
                    requested: request.resources.clone(),
                    resources: granted.clone(),
                    priority: request.priority,
                    strategy: self.strategy.kind(),
                    created_at: now,
                    last_used_at: now,
                    usage: 0.0,
                    state: AllocationState::Active,
                    reclaim_deadline: None,
                };
                state.add_allocated(&granted);
                state.records.insert(id.clone(), record);
                self.debug_check_invariant(state);

                if full {
                    events.push(self.event(
                        &request.agent_id,
                        Some(&id),
                        AllocationAction::Granted,
                        granted.clone(),
                        now,
                    ));
                    Decision::Granted {
                        allocation_id: id,
                        resources: granted,
                    }
                } else {
                    let shortfall: ResourceUnits = request
                        .resources
                        .iter()
                        .filter_map(|(kind, requested)| {
                            let gap = requested - granted.get(kind).copied().unwrap_or(0.0);
                            (gap > UNIT_EPSILON).then_some((*kind, gap))
                        })
                        .collect();
                    events.push(self.event(
                        &request.agent_id,
                        Some(&id),
                        AllocationAction::Partial,
                        granted.clone(),
                        now,
                    ));
                    Decision::Partial {
                        allocation_id: id,
                        resources: granted,
                        shortfall,
                    }
                }
            }
            StrategyDecision::Deny => self.park_denied(state, request, now, events),
        }
    }

    /// Record a capacity denial and park the request for later promotion
    fn park_denied(
        &self,
        state: &mut PoolState,
        request: ResourceRequest,
        now: i64,
        events: &mut Vec<AllocationEvent>,
    ) -> Decision {
        let view = self.build_view(state);
        let shortfall = view.shortfall(&request.resources);

        // A retry of an already-parked request reuses its pending slot
        let existing = state.pending.iter().find(|id| {
            state
                .records
                .get(*id)
                .map(|r| r.agent_id == request.agent_id && r.requested == request.resources)
                .unwrap_or(false)
        });

        let pending_id = match existing {
            Some(id) => id.clone(),
            None => {
                let id = self.next_allocation_id();
                state.records.insert(
                    id.clone(),
                    AllocationRecord {
                        id: id.clone(),
                        agent_id: request.agent_id.clone(),
                        requested: request.resources.clone(),
                        resources: ResourceUnits::new(),
                        priority: request.priority,
                        strategy: self.strategy.kind(),
                        created_at: now,
                        last_used_at: now,
                        usage: 0.0,
                        state: AllocationState::Pending,
                        reclaim_deadline: None,
                    },
                );
                state.pending.push(id.clone());
                id
            }
        };

        events.push(self.event(
            &request.agent_id,
            Some(&pending_id),
            AllocationAction::Denied,
            request.resources.clone(),
            now,
        ));
        Decision::Denied {
            reason: DenialReason::CapacityExceeded,
            shortfall,
            pending_id: Some(pending_id),
        }
    }

    /// Return an allocation's units to the pool
    ///
    /// Releasing a pending record just unparks it; releasing an active or
    /// reclaimed record frees its units and promotes whatever now fits.
    pub async fn release(&self, allocation_id: &str) -> Result<(), AllocError> {
        let mut state = self.pool.lock().await;
        let now = chrono::Utc::now().timestamp();

        let record = state
            .records
            .remove(allocation_id)
            .ok_or_else(|| AllocError::UnknownAllocation(allocation_id.to_string()))?;

        let mut events = Vec::new();
        events.push(self.event(
            &record.agent_id,
            Some(allocation_id),
            AllocationAction::Released,
            record.resources.clone(),
            now,
        ));
        match record.state {
            AllocationState::Pending => {
                state.pending.retain(|id| id != allocation_id);
            }
            AllocationState::Active | AllocationState::Reclaimed => {
                state.sub_allocated(&record.resources);
                self.drain_pending(&mut state, now, &mut events);
            }
            AllocationState::Released => {}
        }

        self.debug_check_invariant(&state);
        self.publish_gauges(&state);
        drop(state);

        for event in events {
            self.emit(event);
        }
        Ok(())
    }

    /// Adjust an active allocation's grant up or down
    ///
    /// Shrinking below the registered QoS floor aborts with
    /// [`AllocError::QosViolation`] rather than under-delivering.
    pub async fn resize(
        &self,
        allocation_id: &str,
        desired: ResourceUnits,
    ) -> Result<Decision, AllocError> {
        let mut state = self.pool.lock().await;
        let now = chrono::Utc::now().timestamp();
        let mut events = Vec::new();

        let record = state
            .records
            .get(allocation_id)
            .ok_or_else(|| AllocError::UnknownAllocation(allocation_id.to_string()))?;
        if record.state != AllocationState::Active {
            return Err(AllocError::NotActive {
                id: allocation_id.to_string(),
                state: record.state.to_string(),
            });
        }
        let agent_id = record.agent_id.clone();
        let current = record.resources.clone();

        // Floors guard the agent's total, so check the post-resize holdings
        if let Some(floor) = state.qos_floors.get(&agent_id) {
            let totals = state.agent_active_totals();
            let agent_total = totals.get(&agent_id).cloned().unwrap_or_default();
            for (kind, floor_amount) in floor {
                let others = agent_total.get(kind).copied().unwrap_or(0.0)
                    - current.get(kind).copied().unwrap_or(0.0);
                let attempted = others + desired.get(kind).copied().unwrap_or(0.0);
                if attempted + UNIT_EPSILON < *floor_amount {
                    self.metrics.inc_qos_violations();
                    return Err(AllocError::QosViolation {
                        agent_id,
                        kind: *kind,
                        floor: *floor_amount,
                        attempted,
                    });
                }
            }
        }

        // Grow is bounded by free capacity; shrink always succeeds
        let mut granted = ResourceUnits::new();
        let mut shortfall = ResourceUnits::new();
        for (kind, target) in &desired {
            let held = current.get(kind).copied().unwrap_or(0.0);
            let minimum = self
                .config
                .minimum_units
                .get(kind)
                .copied()
                .unwrap_or(0.0);
            if *target + UNIT_EPSILON < minimum {
                return Err(AllocError::QosViolation {
                    agent_id,
                    kind: *kind,
                    floor: minimum,
                    attempted: *target,
                });
            }
            let grow = target - held;
            let free = self.config.limits().get(kind).copied().unwrap_or(0.0)
                - state.allocated_of(*kind);
            let reachable = if grow > 0.0 {
                if !self.config.allow_sharing && grow > free + UNIT_EPSILON {
                    held
                } else {
                    held + grow.min(free.max(0.0))
                }
            } else {
                *target
            };
            if reachable + UNIT_EPSILON < *target {
                shortfall.insert(*kind, target - reachable);
            }
            granted.insert(*kind, reachable);
        }

        let delta_freeing = granted
            .iter()
            .any(|(kind, amount)| *amount < current.get(kind).copied().unwrap_or(0.0));

        state.sub_allocated(&current);
        state.add_allocated(&granted);
        let record = state
            .records
            .get_mut(allocation_id)
            .expect("record disappeared under the pool lock");
        record.resources = granted.clone();
        record.last_used_at = now;
        self.debug_check_invariant(&state);

        if delta_freeing {
            self.drain_pending(&mut state, now, &mut events);
        }
        self.publish_gauges(&state);
        drop(state);

        for event in events {
            self.emit(event);
        }

        if shortfall.is_empty() {
            Ok(Decision::Granted {
                allocation_id: allocation_id.to_string(),
                resources: granted,
            })
        } else {
            Ok(Decision::Partial {
                allocation_id: allocation_id.to_string(),
                resources: granted,
                shortfall,
            })
        }
    }

    /// Fold a fresh utilization observation into an allocation's usage
    ///
    /// Touching a record during its reclaim grace countdown cancels the
    /// reclaim and restores it to active.
    pub async fn record_usage(
        &self,
        allocation_id: &str,
        utilization: f64,
    ) -> Result<(), AllocError> {
        let mut state = self.pool.lock().await;
        let record = state
            .records
            .get_mut(allocation_id)
            .ok_or_else(|| AllocError::UnknownAllocation(allocation_id.to_string()))?;

        record.last_used_at = chrono::Utc::now().timestamp();
        record.usage = record.usage * 0.7 + utilization.clamp(0.0, 1.0) * 0.3;
        if record.state == AllocationState::Reclaimed {
            debug!(
                allocation_id = %allocation_id,
                "Usage resumed during grace period, cancelling reclaim"
            );
            record.state = AllocationState::Active;
            record.reclaim_deadline = None;
        }
        Ok(())
    }

    /// Run one reclaim pass now
    ///
    /// Idle underused records enter a grace countdown; records whose
    /// countdown has lapsed are force-released. Returns how many were
    /// force-released.
    pub async fn reclaim_sweep(&self) -> usize {
        self.reclaim_sweep_at(chrono::Utc::now().timestamp()).await
    }

    pub(crate) async fn reclaim_sweep_at(&self, now: i64) -> usize {
        if !self.config.reclaim.enabled {
            return 0;
        }

        let mut state = self.pool.lock().await;
        let mut events = Vec::new();
        let idle_cutoff = now - self.config.reclaim.idle_timeout.as_secs() as i64;
        let grace = self.config.reclaim.grace_period.as_secs() as i64;

        // Phase one: mark idle underused records, guarding QoS floors and
        // capacity already at the minimum unit
        let mut remaining_totals = state.agent_active_totals();
        let mut candidates: Vec<String> = state
            .records
            .values()
            .filter(|r| {
                r.state == AllocationState::Active
                    && r.last_used_at <= idle_cutoff
                    && r.usage < self.config.reclaim.usage_threshold
            })
            .map(|r| r.id.clone())
            .collect();
        candidates.sort();

        for id in candidates {
            let record = &state.records[&id];
            let at_minimum = record.resources.iter().all(|(kind, amount)| {
                let minimum = self
                    .config
                    .minimum_units
                    .get(kind)
                    .copied()
                    .unwrap_or(0.0);
                *amount <= minimum + UNIT_EPSILON
            });
            if at_minimum {
                continue;
            }

            if let Some(floor) = state.qos_floors.get(&record.agent_id) {
                let totals = remaining_totals
                    .get(&record.agent_id)
                    .cloned()
                    .unwrap_or_default();
                let breaches = floor.iter().any(|(kind, floor_amount)| {
                    let after = totals.get(kind).copied().unwrap_or(0.0)
                        - record.resources.get(kind).copied().unwrap_or(0.0);
                    after + UNIT_EPSILON < *floor_amount
                });
                if breaches {
                    continue;
                }
            }

            if let Some(totals) = remaining_totals.get_mut(&state.records[&id].agent_id) {
                for (kind, amount) in &state.records[&id].resources {
                    if let Some(entry) = totals.get_mut(kind) {
                        *entry -= amount;
                    }
                }
            }
            let record = state.records.get_mut(&id).expect("candidate id is valid");
            info!(
                allocation_id = %id,
                agent_id = %record.agent_id,
                idle_secs = now - record.last_used_at,
                usage = record.usage,
                "Marking idle allocation for reclaim"
            );
            record.state = AllocationState::Reclaimed;
            record.reclaim_deadline = Some(now + grace);
        }

        // Phase two: force-release records whose countdown has lapsed
        let expired: Vec<String> = state
            .records
            .values()
            .filter(|r| {
                r.state == AllocationState::Reclaimed
                    && r.reclaim_deadline.map(|d| d <= now).unwrap_or(false)
            })
            .map(|r| r.id.clone())
            .collect();

        let mut released = 0;
        for id in expired {
            if let Some(record) = state.records.remove(&id) {
                state.sub_allocated(&record.resources);
                self.metrics.inc_reclaimed();
                events.push(self.event(
                    &record.agent_id,
                    Some(&id),
                    AllocationAction::Reclaimed,
                    record.resources.clone(),
                    now,
                ));
                released += 1;
            }
        }

        if released > 0 {
            self.drain_pending(&mut state, now, &mut events);
        }
        self.debug_check_invariant(&state);
        self.publish_gauges(&state);
        drop(state);

        for event in events {
            self.emit(event);
        }
        released
    }

    /// Promote parked requests that now fit fully, in strategy order
    fn drain_pending(&self, state: &mut PoolState, now: i64, events: &mut Vec<AllocationEvent>) {
        if state.pending.is_empty() {
            return;
        }

        let mut view = self.build_view(state);
        let mut snapshot: Vec<PendingRequest> = state
            .pending
            .iter()
            .filter_map(|id| state.records.get(id))
            .map(|r| PendingRequest {
                id: r.id.clone(),
                agent_id: r.agent_id.clone(),
                requested: r.requested.clone(),
                priority: r.priority,
                created_at: r.created_at,
            })
            .collect();
        self.strategy.rank_pending(&mut snapshot, &view);

        for pending in snapshot {
            if !view.fits(&pending.requested) {
                continue;
            }

            for (kind, amount) in &pending.requested {
                if let Some(free) = view.free.get_mut(kind) {
                    *free -= amount;
                }
            }
            state.add_allocated(&pending.requested);
            state.pending.retain(|id| *id != pending.id);
            let record = state
                .records
                .get_mut(&pending.id)
                .expect("pending id is valid");
            record.state = AllocationState::Active;
            record.resources = pending.requested.clone();
            record.last_used_at = now;
            info!(
                allocation_id = %pending.id,
                agent_id = %pending.agent_id,
                "Promoted pending allocation"
            );
            events.push(self.event(
                &pending.agent_id,
                Some(&pending.id),
                AllocationAction::Granted,
                pending.requested.clone(),
                now,
            ));
        }
    }

    /// Register the guaranteed minimum for an agent
    pub async fn set_qos_floor(&self, agent_id: &str, floor: ResourceUnits) {
        let mut state = self.pool.lock().await;
        state.qos_floors.insert(agent_id.to_string(), floor);
    }

    pub async fn clear_qos_floor(&self, agent_id: &str) {
        let mut state = self.pool.lock().await;
        state.qos_floors.remove(agent_id);
    }

    /// Snapshot of one record
    pub async fn record(&self, allocation_id: &str) -> Option<AllocationRecord> {
        let state = self.pool.lock().await;
        state.records.get(allocation_id).cloned()
    }

    /// Snapshot of every record, pending included
    pub async fn records(&self) -> Vec<AllocationRecord> {
        let state = self.pool.lock().await;
        let mut records: Vec<AllocationRecord> = state.records.values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// The agent's first active record, if any
    pub async fn agent_active_allocation(&self, agent_id: &str) -> Option<AllocationRecord> {
        let state = self.pool.lock().await;
        let mut matches: Vec<&AllocationRecord> = state
            .records
            .values()
            .filter(|r| r.agent_id == agent_id && r.state == AllocationState::Active)
            .collect();
        matches.sort_by(|a, b| a.id.cmp(&b.id));
        matches.first().map(|r| (*r).clone())
    }

    pub async fn allocated_units(&self) -> ResourceUnits {
        let state = self.pool.lock().await;
        state.allocated.clone()
    }

    /// Check a snapshot table against the current limits without mutating
    ///
    /// Returns the per-kind totals derived over active and reclaimed
    /// records.
    pub(crate) fn check_restorable(
        &self,
        records: &[AllocationRecord],
    ) -> Result<ResourceUnits, StateError> {
        let limits = self.config.limits();
        let mut derived = ResourceUnits::new();
        for record in records {
            if matches!(
                record.state,
                AllocationState::Active | AllocationState::Reclaimed
            ) {
                for (kind, amount) in &record.resources {
                    *derived.entry(*kind).or_insert(0.0) += amount;
                }
            }
        }
        for (kind, total) in &derived {
            let limit = limits.get(kind).copied().unwrap_or(0.0);
            if *total > limit + DRIFT_EPSILON {
                return Err(StateError::InvariantViolation {
                    kind: *kind,
                    allocated: *total,
                    limit,
                });
            }
        }
        Ok(derived)
    }

    /// Replace the allocation table wholesale, e.g. on state import
    ///
    /// The capacity invariant is re-validated against the current limits
    /// before any mutation; a violating snapshot is rejected unchanged.
    pub async fn restore(&self, records: Vec<AllocationRecord>) -> Result<(), StateError> {
        let derived = self.check_restorable(&records)?;

        let mut state = self.pool.lock().await;
        let mut pending: Vec<&AllocationRecord> = records
            .iter()
            .filter(|r| r.state == AllocationState::Pending)
            .collect();
        pending.sort_by_key(|r| r.created_at);
        state.pending = pending.iter().map(|r| r.id.clone()).collect();
        state.records = records.into_iter().map(|r| (r.id.clone(), r)).collect();
        state.allocated = derived;

        // Keep ids monotonic after a restore
        let max_seq = state
            .records
            .keys()
            .filter_map(|id| id.strip_prefix("alloc-").and_then(|n| n.parse::<u64>().ok()))
            .max()
            .unwrap_or(0);
        self.next_id.fetch_max(max_seq + 1, Ordering::Relaxed);

        self.publish_gauges(&state);
        info!(records = state.records.len(), "Allocation table restored");
        Ok(())
    }

    /// Recompute totals from records and repair any drift
    ///
    /// Returns `(kind, recorded, derived)` for every mismatch found.
    pub async fn verify_consistency(&self) -> Vec<(ResourceKind, f64, f64)> {
        let mut state = self.pool.lock().await;

        let mut derived = ResourceUnits::new();
        for record in state.records.values() {
            if matches!(
                record.state,
                AllocationState::Active | AllocationState::Reclaimed
            ) {
                for (kind, amount) in &record.resources {
                    *derived.entry(*kind).or_insert(0.0) += amount;
                }
            }
        }

        let mut drifts = Vec::new();
        for kind in ResourceKind::ALL {
            let recorded = state.allocated_of(kind);
            let actual = derived.get(&kind).copied().unwrap_or(0.0);
            if (recorded - actual).abs() > DRIFT_EPSILON {
                warn!(
                    kind = %kind,
                    recorded = recorded,
                    derived = actual,
                    "Allocation total drifted from records, repairing"
                );
                drifts.push((kind, recorded, actual));
            }
        }
        if !drifts.is_empty() {
            state.allocated = derived;
            self.publish_gauges(&state);
        }
        drifts
    }

    pub async fn is_sweeping(&self) -> bool {
        self.sweeper.lock().await.is_some()
    }

    /// Begin the periodic reclaim sweep; a second call is a no-op
    pub async fn start_sweeper(self: &Arc<Self>) {
        if !self.config.reclaim.enabled {
            info!("Reclaim disabled by configuration");
            return;
        }

        let mut sweeper = self.sweeper.lock().await;
        if sweeper.is_some() {
            debug!("Reclaim sweeper already running");
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let allocator = Arc::clone(self);
        let sweep_interval = self.config.reclaim.sweep_interval;
        let handle = tokio::spawn(async move {
            info!(
                interval_secs = sweep_interval.as_secs(),
                "Starting reclaim sweeper"
            );
            let mut ticker = interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let released = allocator.reclaim_sweep().await;
                        if released > 0 {
                            info!(released = released, "Reclaim sweep released allocations");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Reclaim sweeper shutting down");
                        break;
                    }
                }
            }
        });

        *sweeper = Some(SweeperTask {
            shutdown: shutdown_tx,
            handle,
        });
    }

    /// Stop the periodic sweep; the in-flight pass completes. Idempotent.
    pub async fn stop_sweeper(&self) {
        let sweeper = self.sweeper.lock().await.take();
        if let Some(task) = sweeper {
            let _ = task.shutdown.send(());
            let _ = task.handle.await;
            info!("Reclaim sweeper stopped");
        }
    }

    fn build_view(&self, state: &PoolState) -> PoolView {
        let limits = self.config.limits();
        let free: ResourceUnits = limits
            .iter()
            .map(|(kind, limit)| (*kind, (limit - state.allocated_of(*kind)).max(0.0)))
            .collect();

        let active: Vec<&AllocationRecord> = state
            .records
            .values()
            .filter(|r| r.state == AllocationState::Active)
            .collect();
        let mean_usage = if active.is_empty() {
            0.0
        } else {
            active.iter().map(|r| r.usage).sum::<f64>() / active.len() as f64
        };

        PoolView {
            limits,
            free,
            minimum_units: self.config.minimum_units.clone(),
            allow_sharing: self.config.allow_sharing,
            agent_totals: state
                .agent_active_totals()
                .into_iter()
                .collect(),
            mean_usage,
        }
    }

    fn next_allocation_id(&self) -> String {
        format!("alloc-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn event(
        &self,
        agent_id: &str,
        allocation_id: Option<&str>,
        action: AllocationAction,
        resources: ResourceUnits,
        timestamp: i64,
    ) -> AllocationEvent {
        AllocationEvent {
            agent_id: agent_id.to_string(),
            allocation_id: allocation_id.map(str::to_string),
            action,
            resources,
            timestamp,
        }
    }

    fn emit(&self, event: AllocationEvent) {
        self.metrics.inc_allocation_decision(event.action.as_str());
        // Receiver dropping just means nobody is listening anymore
        let _ = self.events_tx.send(event);
    }

    fn publish_gauges(&self, state: &PoolState) {
        for kind in ResourceKind::ALL {
            self.metrics
                .set_allocated_units(kind, state.allocated_of(kind));
        }
        self.metrics.set_pending_requests(state.pending.len() as i64);
    }

    fn debug_check_invariant(&self, state: &PoolState) {
        if cfg!(debug_assertions) {
            let limits = self.config.limits();
            for kind in ResourceKind::ALL {
                let allocated = state.allocated_of(kind);
                let limit = limits.get(&kind).copied().unwrap_or(0.0);
                debug_assert!(
                    allocated <= limit + DRIFT_EPSILON,
                    "capacity invariant violated for {kind}: {allocated} > {limit}"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_pool(allow_sharing: bool) -> AllocatorConfig {
        AllocatorConfig {
            strategy: StrategyKind::Priority,
            max_memory_mb: 4096.0,
            over_provisioning_factor: 1.0,
            allow_sharing,
            minimum_units: [
                (ResourceKind::Cpu, 0.1),
                (ResourceKind::Memory, 128.0),
                (ResourceKind::Disk, 256.0),
                (ResourceKind::Network, 10.0),
            ]
            .into_iter()
            .collect(),
            ..AllocatorConfig::default()
        }
    }

    fn memory_request(agent: &str, amount: f64, priority: u8) -> ResourceRequest {
        ResourceRequest::new(
            agent,
            [(ResourceKind::Memory, amount)].into_iter().collect(),
            priority,
        )
    }

    #[tokio::test]
    async fn test_grants_until_capacity_then_denies_with_shortfall() {
        let (allocator, _rx) = Allocator::new(memory_pool(false)).unwrap();

        let first = allocator.allocate(memory_request("a", 1500.0, 1)).await;
        assert!(first.is_granted());
        let second = allocator.allocate(memory_request("b", 1500.0, 1)).await;
        assert!(second.is_granted());

        let third = allocator.allocate(memory_request("c", 1500.0, 1)).await;
        match third {
            Decision::Denied {
                reason,
                shortfall,
                pending_id,
            } => {
                assert_eq!(reason, DenialReason::CapacityExceeded);
                let gap = shortfall.get(&ResourceKind::Memory).copied().unwrap();
                assert!((gap - 404.0).abs() < 1e-6);
                assert!(pending_id.is_some());
            }
            other => panic!("expected denial, got {other:?}"),
        }

        let allocated = allocator.allocated_units().await;
        assert!((allocated[&ResourceKind::Memory] - 3000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_release_promotes_parked_request() {
        let (allocator, mut rx) = Allocator::new(memory_pool(false)).unwrap();

        let first = allocator.allocate(memory_request("a", 1500.0, 1)).await;
        let _second = allocator.allocate(memory_request("b", 1500.0, 1)).await;
        let third = allocator.allocate(memory_request("c", 1500.0, 1)).await;
        let pending_id = match &third {
            Decision::Denied { pending_id, .. } => pending_id.clone().unwrap(),
            other => panic!("expected denial, got {other:?}"),
        };

        allocator
            .release(first.allocation_id().unwrap())
            .await
            .unwrap();

        let promoted = allocator.record(&pending_id).await.unwrap();
        assert_eq!(promoted.state, AllocationState::Active);
        assert!(
            (promoted.resources[&ResourceKind::Memory] - 1500.0).abs() < 1e-9
        );

        // Event order: the release comes before the promotion it enabled
        let mut actions = Vec::new();
        while let Ok(event) = rx.try_recv() {
            actions.push((event.agent_id, event.action));
        }
        assert_eq!(
            actions,
            vec![
                ("a".to_string(), AllocationAction::Granted),
                ("b".to_string(), AllocationAction::Granted),
                ("c".to_string(), AllocationAction::Denied),
                ("a".to_string(), AllocationAction::Released),
                ("c".to_string(), AllocationAction::Granted),
            ]
        );
    }

    #[tokio::test]
    async fn test_below_minimum_rejected_outright() {
        let (allocator, _rx) = Allocator::new(memory_pool(false)).unwrap();

        let decision = allocator.allocate(memory_request("a", 64.0, 1)).await;
        match decision {
            Decision::Denied {
                reason, pending_id, ..
            } => {
                assert_eq!(
                    reason,
                    DenialReason::BelowMinimumUnit {
                        kind: ResourceKind::Memory
                    }
                );
                assert!(pending_id.is_none());
            }
            other => panic!("expected denial, got {other:?}"),
        }
        assert!(allocator.records().await.is_empty());
    }

    #[tokio::test]
    async fn test_over_provisioning_raises_the_limit() {
        let mut config = memory_pool(false);
        config.over_provisioning_factor = 1.5;
        let (allocator, _rx) = Allocator::new(config).unwrap();

        // 4096 * 1.5 = 6144 available despite 4096 physical
        assert!(allocator
            .allocate(memory_request("a", 2000.0, 1))
            .await
            .is_granted());
        assert!(allocator
            .allocate(memory_request("b", 2000.0, 1))
            .await
            .is_granted());
        assert!(allocator
            .allocate(memory_request("c", 2000.0, 1))
            .await
            .is_granted());
        assert!(!allocator
            .allocate(memory_request("d", 2000.0, 1))
            .await
            .is_granted());
    }

    #[tokio::test]
    async fn test_partial_grant_with_sharing() {
        let (allocator, _rx) = Allocator::new(memory_pool(true)).unwrap();

        let _first = allocator.allocate(memory_request("a", 3000.0, 1)).await;
        let second = allocator.allocate(memory_request("b", 1500.0, 1)).await;
        match second {
            Decision::Partial {
                resources,
                shortfall,
                ..
            } => {
                assert!((resources[&ResourceKind::Memory] - 1096.0).abs() < 1e-6);
                assert!((shortfall[&ResourceKind::Memory] - 404.0).abs() < 1e-6);
            }
            other => panic!("expected partial grant, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_release_unknown_allocation() {
        let (allocator, _rx) = Allocator::new(memory_pool(false)).unwrap();
        let result = allocator.release("alloc-404").await;
        assert!(matches!(result, Err(AllocError::UnknownAllocation(_))));
    }

    #[tokio::test]
    async fn test_duplicate_denial_reuses_pending_slot() {
        let (allocator, _rx) = Allocator::new(memory_pool(false)).unwrap();

        let _fill = allocator.allocate(memory_request("a", 4096.0, 1)).await;
        let first_try = allocator.allocate(memory_request("b", 1000.0, 1)).await;
        let second_try = allocator.allocate(memory_request("b", 1000.0, 1)).await;

        let id_of = |d: &Decision| match d {
            Decision::Denied { pending_id, .. } => pending_id.clone().unwrap(),
            other => panic!("expected denial, got {other:?}"),
        };
        assert_eq!(id_of(&first_try), id_of(&second_try));

        let pending: Vec<_> = allocator
            .records()
            .await
            .into_iter()
            .filter(|r| r.state == AllocationState::Pending)
            .collect();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_resize_shrink_frees_capacity_and_grow_is_bounded() {
        let (allocator, _rx) = Allocator::new(memory_pool(false)).unwrap();

        let decision = allocator.allocate(memory_request("a", 3000.0, 1)).await;
        let id = decision.allocation_id().unwrap().to_string();

        let shrunk = allocator
            .resize(&id, [(ResourceKind::Memory, 2000.0)].into_iter().collect())
            .await
            .unwrap();
        assert!(shrunk.is_granted());
        let allocated = allocator.allocated_units().await;
        assert!((allocated[&ResourceKind::Memory] - 2000.0).abs() < 1e-9);

        // Growing past free capacity without sharing keeps the old grant
        let grown = allocator
            .resize(&id, [(ResourceKind::Memory, 9000.0)].into_iter().collect())
            .await
            .unwrap();
        match grown {
            Decision::Partial { resources, .. } => {
                assert!((resources[&ResourceKind::Memory] - 2000.0).abs() < 1e-9);
            }
            other => panic!("expected partial resize, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_resize_below_qos_floor_aborts() {
        let (allocator, _rx) = Allocator::new(memory_pool(false)).unwrap();
        allocator
            .set_qos_floor("a", [(ResourceKind::Memory, 1024.0)].into_iter().collect())
            .await;

        let decision = allocator.allocate(memory_request("a", 2048.0, 1)).await;
        let id = decision.allocation_id().unwrap().to_string();

        let result = allocator
            .resize(&id, [(ResourceKind::Memory, 512.0)].into_iter().collect())
            .await;
        assert!(matches!(
            result,
            Err(AllocError::QosViolation {
                kind: ResourceKind::Memory,
                ..
            })
        ));

        // The grant is untouched after the abort
        let record = allocator.record(&id).await.unwrap();
        assert!((record.resources[&ResourceKind::Memory] - 2048.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_reclaim_marks_then_force_releases() {
        let (allocator, _rx) = Allocator::new(memory_pool(false)).unwrap();

        let decision = allocator.allocate(memory_request("a", 1024.0, 1)).await;
        let id = decision.allocation_id().unwrap().to_string();
        let created = allocator.record(&id).await.unwrap().created_at;

        // Not yet idle: nothing happens
        assert_eq!(allocator.reclaim_sweep_at(created + 10).await, 0);
        assert_eq!(
            allocator.record(&id).await.unwrap().state,
            AllocationState::Active
        );

        // Idle past the timeout: marked with a grace deadline
        assert_eq!(allocator.reclaim_sweep_at(created + 400).await, 0);
        let marked = allocator.record(&id).await.unwrap();
        assert_eq!(marked.state, AllocationState::Reclaimed);
        assert_eq!(marked.reclaim_deadline, Some(created + 400 + 60));

        // Grace lapsed: force-released and capacity returned
        assert_eq!(allocator.reclaim_sweep_at(created + 461).await, 1);
        assert!(allocator.record(&id).await.is_none());
        let allocated = allocator.allocated_units().await;
        assert!(allocated[&ResourceKind::Memory].abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_usage_touch_cancels_reclaim() {
        let (allocator, _rx) = Allocator::new(memory_pool(false)).unwrap();

        let decision = allocator.allocate(memory_request("a", 1024.0, 1)).await;
        let id = decision.allocation_id().unwrap().to_string();
        let created = allocator.record(&id).await.unwrap().created_at;

        allocator.reclaim_sweep_at(created + 400).await;
        assert_eq!(
            allocator.record(&id).await.unwrap().state,
            AllocationState::Reclaimed
        );

        allocator.record_usage(&id, 0.8).await.unwrap();
        let restored = allocator.record(&id).await.unwrap();
        assert_eq!(restored.state, AllocationState::Active);
        assert_eq!(restored.reclaim_deadline, None);
        assert!(restored.usage > 0.0);
    }

    #[tokio::test]
    async fn test_reclaim_respects_qos_floor() {
        let (allocator, _rx) = Allocator::new(memory_pool(false)).unwrap();
        allocator
            .set_qos_floor("a", [(ResourceKind::Memory, 1024.0)].into_iter().collect())
            .await;

        let decision = allocator.allocate(memory_request("a", 1024.0, 1)).await;
        let id = decision.allocation_id().unwrap().to_string();
        let created = allocator.record(&id).await.unwrap().created_at;

        // Idle and unused, but protected by the floor
        allocator.reclaim_sweep_at(created + 10_000).await;
        assert_eq!(
            allocator.record(&id).await.unwrap().state,
            AllocationState::Active
        );
    }

    #[tokio::test]
    async fn test_reclaim_skips_minimum_unit_grants() {
        let (allocator, _rx) = Allocator::new(memory_pool(false)).unwrap();

        let decision = allocator.allocate(memory_request("a", 128.0, 1)).await;
        let id = decision.allocation_id().unwrap().to_string();
        let created = allocator.record(&id).await.unwrap().created_at;

        allocator.reclaim_sweep_at(created + 10_000).await;
        assert_eq!(
            allocator.record(&id).await.unwrap().state,
            AllocationState::Active
        );
    }

    #[tokio::test]
    async fn test_promotion_follows_priority_order() {
        let (allocator, _rx) = Allocator::new(memory_pool(false)).unwrap();

        let _keeper = allocator.allocate(memory_request("keeper", 2596.0, 1)).await;
        let filler = allocator.allocate(memory_request("filler", 1500.0, 1)).await;
        let low = allocator.allocate(memory_request("low", 1500.0, 1)).await;
        let high = allocator.allocate(memory_request("high", 1500.0, 9)).await;
        let low_id = match &low {
            Decision::Denied { pending_id, .. } => pending_id.clone().unwrap(),
            other => panic!("expected denial, got {other:?}"),
        };
        let high_id = match &high {
            Decision::Denied { pending_id, .. } => pending_id.clone().unwrap(),
            other => panic!("expected denial, got {other:?}"),
        };

        // Frees room for exactly one of the two parked requests
        allocator
            .release(filler.allocation_id().unwrap())
            .await
            .unwrap();

        assert_eq!(
            allocator.record(&high_id).await.unwrap().state,
            AllocationState::Active
        );
        assert_eq!(
            allocator.record(&low_id).await.unwrap().state,
            AllocationState::Pending
        );
    }

    #[tokio::test]
    async fn test_restore_validates_capacity_invariant() {
        let (allocator, _rx) = Allocator::new(memory_pool(false)).unwrap();

        let oversized = AllocationRecord {
            id: "alloc-99".to_string(),
            agent_id: "a".to_string(),
            requested: [(ResourceKind::Memory, 9000.0)].into_iter().collect(),
            resources: [(ResourceKind::Memory, 9000.0)].into_iter().collect(),
            priority: 1,
            strategy: StrategyKind::Priority,
            created_at: 100,
            last_used_at: 100,
            usage: 0.5,
            state: AllocationState::Active,
            reclaim_deadline: None,
        };
        let result = allocator.restore(vec![oversized]).await;
        assert!(matches!(
            result,
            Err(StateError::InvariantViolation {
                kind: ResourceKind::Memory,
                ..
            })
        ));
        assert!(allocator.records().await.is_empty());
    }

    #[tokio::test]
    async fn test_restore_round_trip() {
        let (allocator, _rx) = Allocator::new(memory_pool(false)).unwrap();
        let _a = allocator.allocate(memory_request("a", 1500.0, 1)).await;
        let _b = allocator.allocate(memory_request("b", 1000.0, 2)).await;
        let exported = allocator.records().await;

        let (restored, _rx2) = Allocator::new(memory_pool(false)).unwrap();
        restored.restore(exported.clone()).await.unwrap();

        assert_eq!(restored.records().await, exported);
        let allocated = restored.allocated_units().await;
        assert!((allocated[&ResourceKind::Memory] - 2500.0).abs() < 1e-9);

        // Fresh ids continue past the restored ones
        let next = restored.allocate(memory_request("c", 500.0, 1)).await;
        let next_id = next.allocation_id().unwrap();
        assert!(!exported.iter().any(|r| r.id == next_id));
    }

    #[tokio::test]
    async fn test_verify_consistency_clean_after_churn() {
        let (allocator, _rx) = Allocator::new(memory_pool(true)).unwrap();

        let a = allocator.allocate(memory_request("a", 1500.0, 1)).await;
        let _b = allocator.allocate(memory_request("b", 3000.0, 1)).await;
        allocator
            .release(a.allocation_id().unwrap())
            .await
            .unwrap();
        let _c = allocator.allocate(memory_request("c", 800.0, 1)).await;

        assert!(allocator.verify_consistency().await.is_empty());
    }

    #[tokio::test]
    async fn test_sweeper_start_stop_idempotent() {
        let mut config = memory_pool(false);
        config.reclaim.sweep_interval = Duration::from_millis(10);
        let (allocator, _rx) = Allocator::new(config).unwrap();
        let allocator = Arc::new(allocator);

        allocator.start_sweeper().await;
        allocator.start_sweeper().await;
        assert!(allocator.is_sweeping().await);

        tokio::time::sleep(Duration::from_millis(30)).await;

        allocator.stop_sweeper().await;
        allocator.stop_sweeper().await;
        assert!(!allocator.is_sweeping().await);
    }
}
