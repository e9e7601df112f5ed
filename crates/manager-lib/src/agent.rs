//! Per-agent resource lifecycle
//!
//! Wraps one agent's allocation in a small state machine: initialize
//! acquires the allocation and registers the QoS floor, start validates the
//! hold against the agent's guaranteed minimum, pressure sheds load
//! gracefully before throttling, and a background health loop marks the
//! agent errored and force-releases everything once the smoothed score
//! falls through the configured floor.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::alloc::Allocator;
use crate::error::{AllocError, ConfigurationError, LifecycleError};
use crate::models::{
    AgentResourceProfile, AllocationRecord, AllocationState, Decision, PressureLevel,
    ResourceKind, ResourceRequest, ResourceUnits,
};
use crate::observability::{ManagerMetrics, StructuredLogger};
use crate::pressure::PressureTransition;

/// Fraction of required resources kept while throttled, floor permitting
const THROTTLE_FACTOR: f64 = 0.5;

/// Reported utilization at or above this triggers a scale-up step
const SCALE_UP_USAGE: f64 = 0.8;

/// Reported utilization at or below this triggers a scale-down step
const SCALE_DOWN_USAGE: f64 = 0.3;

/// EWMA weights for the smoothed health score
const HEALTH_PREV_WEIGHT: f64 = 0.7;
const HEALTH_NEW_WEIGHT: f64 = 0.3;

/// Utilization above this erodes instantaneous health
const SATURATION_ONSET: f64 = 0.9;
const SATURATION_SLOPE: f64 = 10.0;

const UNIT_EPSILON: f64 = 1e-9;

/// Lifecycle of one managed agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Uninitialized,
    Ready,
    Active,
    Throttled,
    Stopped,
    /// Health fell through the floor; resources were force-released
    Error,
    Destroyed,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Uninitialized => "uninitialized",
            AgentState::Ready => "ready",
            AgentState::Active => "active",
            AgentState::Throttled => "throttled",
            AgentState::Stopped => "stopped",
            AgentState::Error => "error",
            AgentState::Destroyed => "destroyed",
        }
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied liveness signal folded into the health score
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn alive(&self) -> bool;
}

/// Mutable runtime owned by the agent lock
struct AgentRuntime {
    state: AgentState,
    allocation_id: Option<String>,
    /// Smoothed health in [0, 1], starts perfect
    health_score: f64,
    /// Current allocation as a multiple of the required units
    scale_factor: f64,
    last_usage: f64,
}

impl AgentRuntime {
    fn new() -> Self {
        Self {
            state: AgentState::Uninitialized,
            allocation_id: None,
            health_score: 1.0,
            scale_factor: 1.0,
            last_usage: 0.0,
        }
    }
}

struct HealthTask {
    shutdown: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// Manages one agent's allocation, scaling, and health
pub struct AgentResourceManager {
    profile: AgentResourceProfile,
    allocator: Arc<Allocator>,
    liveness: Option<Arc<dyn LivenessProbe>>,
    state: Mutex<AgentRuntime>,
    metrics: ManagerMetrics,
    logger: StructuredLogger,
    health_task: Mutex<Option<HealthTask>>,
}

impl AgentResourceManager {
    pub fn new(
        profile: AgentResourceProfile,
        allocator: Arc<Allocator>,
    ) -> Result<Self, ConfigurationError> {
        validate_profile(&profile)?;
        let logger = StructuredLogger::new(profile.agent_id.clone());

        Ok(Self {
            profile,
            allocator,
            liveness: None,
            state: Mutex::new(AgentRuntime::new()),
            metrics: ManagerMetrics::new(),
            logger,
            health_task: Mutex::new(None),
        })
    }

    pub fn with_liveness_probe(mut self, probe: Arc<dyn LivenessProbe>) -> Self {
        self.liveness = Some(probe);
        self
    }

    pub fn agent_id(&self) -> &str {
        &self.profile.agent_id
    }

    pub fn profile(&self) -> &AgentResourceProfile {
        &self.profile
    }

    pub async fn state(&self) -> AgentState {
        self.state.lock().await.state
    }

    pub async fn health_score(&self) -> f64 {
        self.state.lock().await.health_score
    }

    /// Current allocation record, if the agent holds one
    pub async fn allocation(&self) -> Option<AllocationRecord> {
        let id = self.state.lock().await.allocation_id.clone()?;
        self.allocator.record(&id).await
    }

    /// Register the QoS floor and acquire the agent's allocation
    ///
    /// A partial grant is held and judged later by `start`. A denial undoes
    /// the floor registration, leaves the agent uninitialized, and returns
    /// the shortfall.
    pub async fn initialize(&self) -> Result<(), LifecycleError> {
        let mut runtime = self.state.lock().await;
        match runtime.state {
            AgentState::Ready => return Ok(()),
            AgentState::Uninitialized => {}
            from => {
                return Err(LifecycleError::InvalidTransition {
                    from,
                    to: AgentState::Ready,
                })
            }
        }

        if !self.profile.qos_floor.is_empty() {
            self.allocator
                .set_qos_floor(&self.profile.agent_id, self.profile.qos_floor.clone())
                .await;
        }
        let request = ResourceRequest::new(
            &self.profile.agent_id,
            self.profile.required.clone(),
            self.profile.priority,
        );
        match self.allocator.allocate(request).await {
            Decision::Granted { allocation_id, .. } | Decision::Partial { allocation_id, .. } => {
                runtime.allocation_id = Some(allocation_id);
                self.transition(&mut runtime, AgentState::Ready);
                Ok(())
            }
            Decision::Denied {
                shortfall,
                pending_id,
                ..
            } => {
                // Initialization is synchronous: nothing stays parked behind it
                if let Some(id) = pending_id {
                    let _ = self.allocator.release(&id).await;
                }
                self.allocator.clear_qos_floor(&self.profile.agent_id).await;
                Err(LifecycleError::InsufficientResources {
                    agent_id: self.profile.agent_id.clone(),
                    shortfall,
                })
            }
        }
    }

    /// Activate the agent and begin the health loop
    ///
    /// Requires an active allocation covering the agent's guaranteed
    /// minimum: the QoS floor where one is declared, the full requirement
    /// otherwise. A partial hold is topped up first; if it still falls
    /// short the agent stays ready and the shortfall is returned. Restart
    /// after a stop acquires a fresh allocation.
    pub async fn start(self: &Arc<Self>) -> Result<(), LifecycleError> {
        let mut runtime = self.state.lock().await;
        match runtime.state {
            AgentState::Active | AgentState::Throttled => return Ok(()),
            AgentState::Ready | AgentState::Stopped => {}
            from => {
                return Err(LifecycleError::InvalidTransition {
                    from,
                    to: AgentState::Active,
                })
            }
        }

        let mut record = match &runtime.allocation_id {
            Some(id) => self.allocator.record(id).await,
            None => None,
        };
        if record.is_none() {
            runtime.allocation_id = None;
            let request = ResourceRequest::new(
                &self.profile.agent_id,
                self.profile.required.clone(),
                self.profile.priority,
            );
            match self.allocator.allocate(request).await {
                Decision::Granted { allocation_id, .. }
                | Decision::Partial { allocation_id, .. } => {
                    record = self.allocator.record(&allocation_id).await;
                    runtime.allocation_id = Some(allocation_id);
                }
                Decision::Denied {
                    shortfall,
                    pending_id,
                    ..
                } => {
                    if let Some(id) = pending_id {
                        let _ = self.allocator.release(&id).await;
                    }
                    return Err(LifecycleError::InsufficientResources {
                        agent_id: self.profile.agent_id.clone(),
                        shortfall,
                    });
                }
            }
        }
        let Some(mut record) = record else {
            return Err(LifecycleError::NoAllocation(self.profile.agent_id.clone()));
        };

        // A hold in its reclaim grace window comes back on use
        if record.state == AllocationState::Reclaimed {
            self.allocator.record_usage(&record.id, record.usage).await?;
            if let Some(fresh) = self.allocator.record(&record.id).await {
                record = fresh;
            }
        }
        if record.state != AllocationState::Active {
            return Err(LifecycleError::NoAllocation(self.profile.agent_id.clone()));
        }

        let minimum = self.start_minimum();
        if !meets(&record.resources, &minimum) {
            // Top up a partial hold before judging it
            match self
                .allocator
                .resize(&record.id, self.profile.required.clone())
                .await
            {
                Ok(_) => {
                    if let Some(fresh) = self.allocator.record(&record.id).await {
                        record = fresh;
                    }
                }
                Err(AllocError::UnknownAllocation(_)) => {
                    runtime.allocation_id = None;
                    return Err(LifecycleError::NoAllocation(self.profile.agent_id.clone()));
                }
                Err(error) => return Err(error.into()),
            }
        }
        if !meets(&record.resources, &minimum) {
            return Err(LifecycleError::InsufficientResources {
                agent_id: self.profile.agent_id.clone(),
                shortfall: gap_to(&record.resources, &self.profile.required),
            });
        }

        runtime.scale_factor = 1.0;
        runtime.health_score = 1.0;
        runtime.last_usage = 0.0;
        self.transition(&mut runtime, AgentState::Active);
        drop(runtime);
        self.start_health_loop().await;
        Ok(())
    }

    /// Release the allocation and halt the health loop. Idempotent.
    pub async fn stop(&self) -> Result<(), LifecycleError> {
        self.stop_health_loop().await;

        let mut runtime = self.state.lock().await;
        match runtime.state {
            AgentState::Uninitialized | AgentState::Ready | AgentState::Stopped => return Ok(()),
            AgentState::Active | AgentState::Throttled | AgentState::Error => {}
            from => {
                return Err(LifecycleError::InvalidTransition {
                    from,
                    to: AgentState::Stopped,
                })
            }
        }

        if let Some(id) = runtime.allocation_id.take() {
            match self.allocator.release(&id).await {
                // Reclaim may have beaten us to it
                Ok(()) | Err(AllocError::UnknownAllocation(_)) => {}
                Err(error) => return Err(error.into()),
            }
        }
        self.transition(&mut runtime, AgentState::Stopped);
        Ok(())
    }

    /// Tear the agent down for good; any further operation fails
    pub async fn destroy(&self) -> Result<(), LifecycleError> {
        self.stop_health_loop().await;

        let mut runtime = self.state.lock().await;
        if runtime.state == AgentState::Destroyed {
            return Ok(());
        }
        if let Some(id) = runtime.allocation_id.take() {
            match self.allocator.release(&id).await {
                Ok(()) | Err(AllocError::UnknownAllocation(_)) => {}
                Err(error) => return Err(error.into()),
            }
        }
        self.allocator.clear_qos_floor(&self.profile.agent_id).await;
        self.transition(&mut runtime, AgentState::Destroyed);
        Ok(())
    }

    /// Shed down to the throttle target, never below the QoS floor
    pub async fn throttle(&self) -> Result<(), LifecycleError> {
        let mut runtime = self.state.lock().await;
        match runtime.state {
            AgentState::Throttled => return Ok(()),
            AgentState::Active => {}
            from => {
                return Err(LifecycleError::InvalidTransition {
                    from,
                    to: AgentState::Throttled,
                })
            }
        }

        let id = runtime
            .allocation_id
            .clone()
            .ok_or_else(|| LifecycleError::NoAllocation(self.profile.agent_id.clone()))?;
        match self.allocator.resize(&id, self.throttle_target()).await {
            Ok(_) => {
                self.transition(&mut runtime, AgentState::Throttled);
                Ok(())
            }
            Err(AllocError::UnknownAllocation(_)) => {
                runtime.allocation_id = None;
                self.transition(&mut runtime, AgentState::Stopped);
                Err(LifecycleError::NoAllocation(self.profile.agent_id.clone()))
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Grow back to the scaled target; partial coverage is accepted
    pub async fn resume(&self) -> Result<(), LifecycleError> {
        let mut runtime = self.state.lock().await;
        match runtime.state {
            AgentState::Active => return Ok(()),
            AgentState::Throttled => {}
            from => {
                return Err(LifecycleError::InvalidTransition {
                    from,
                    to: AgentState::Active,
                })
            }
        }

        let id = runtime
            .allocation_id
            .clone()
            .ok_or_else(|| LifecycleError::NoAllocation(self.profile.agent_id.clone()))?;
        let target = self.scaled_target(runtime.scale_factor);
        match self.allocator.resize(&id, target).await {
            Ok(decision) => {
                if let Decision::Partial { shortfall, .. } = decision {
                    debug!(
                        agent_id = %self.profile.agent_id,
                        ?shortfall,
                        "Resume partially satisfied"
                    );
                }
                self.transition(&mut runtime, AgentState::Active);
                Ok(())
            }
            Err(AllocError::UnknownAllocation(_)) => {
                runtime.allocation_id = None;
                self.transition(&mut runtime, AgentState::Stopped);
                Err(LifecycleError::NoAllocation(self.profile.agent_id.clone()))
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Report observed utilization in [0, 1]
    ///
    /// Feeds the allocator's usage tracking and, while active, drives the
    /// auto-scaling steps within the configured ceiling.
    pub async fn record_usage(&self, utilization: f64) -> Result<(), LifecycleError> {
        let mut runtime = self.state.lock().await;
        if !matches!(runtime.state, AgentState::Active | AgentState::Throttled) {
            return Err(LifecycleError::NoAllocation(self.profile.agent_id.clone()));
        }
        let id = runtime
            .allocation_id
            .clone()
            .ok_or_else(|| LifecycleError::NoAllocation(self.profile.agent_id.clone()))?;

        self.allocator.record_usage(&id, utilization).await?;
        runtime.last_usage = utilization.clamp(0.0, 1.0);

        if runtime.state == AgentState::Active && self.profile.scaling.enabled {
            self.maybe_scale(&mut runtime, &id).await;
        }
        Ok(())
    }

    /// React to an observed pressure transition
    ///
    /// Escalation to high sheds scaled growth first and throttles only at
    /// baseline; critical throttles outright. A return to normal resumes
    /// the agent. Forecast transitions are advisory only.
    pub async fn on_pressure(&self, transition: &PressureTransition) {
        if transition.predicted {
            return;
        }

        let escalated = transition.to > transition.from;
        let result = if escalated && transition.to == PressureLevel::Critical {
            self.shed_load(true).await
        } else if escalated && transition.to == PressureLevel::High {
            self.shed_load(false).await
        } else if transition.to == PressureLevel::Normal && transition.from > transition.to {
            self.resume().await
        } else {
            Ok(())
        };
        if let Err(error) = result {
            // Agents not in a shed-able state simply sit the response out
            if !matches!(error, LifecycleError::InvalidTransition { .. }) {
                warn!(
                    agent_id = %self.profile.agent_id,
                    error = %error,
                    "Pressure response failed"
                );
            }
        }
    }

    /// One health scoring pass; returns the smoothed score
    ///
    /// Blends allocation fullness against the current target with a
    /// saturation penalty on sustained near-total utilization, gated by the
    /// liveness probe when one is supplied. A score through the floor marks
    /// the agent errored and force-releases its resources.
    pub async fn evaluate_health_once(&self) -> f64 {
        let mut runtime = self.state.lock().await;
        if !matches!(runtime.state, AgentState::Active | AgentState::Throttled) {
            return runtime.health_score;
        }

        let alive = match &self.liveness {
            Some(probe) => probe.alive().await,
            None => true,
        };
        let instant = if !alive {
            0.0
        } else {
            let record = match &runtime.allocation_id {
                Some(id) => self.allocator.record(id).await,
                None => None,
            };
            match record {
                Some(record) => {
                    let expected = match runtime.state {
                        AgentState::Throttled => self.throttle_target(),
                        _ => self.scaled_target(runtime.scale_factor),
                    };
                    let fullness = fullness_of(&record.resources, &expected);
                    let saturation = 1.0
                        - ((runtime.last_usage - SATURATION_ONSET).max(0.0) * SATURATION_SLOPE)
                            .min(1.0);
                    fullness.min(saturation).clamp(0.0, 1.0)
                }
                // The allocation vanished underneath the agent
                None => 0.0,
            }
        };

        runtime.health_score =
            runtime.health_score * HEALTH_PREV_WEIGHT + instant * HEALTH_NEW_WEIGHT;
        self.metrics
            .set_agent_health(&self.profile.agent_id, runtime.health_score);

        if runtime.health_score < self.profile.health.floor {
            self.logger.log_agent_unhealthy(
                &self.profile.agent_id,
                runtime.health_score,
                self.profile.health.floor,
            );
            self.force_release(&mut runtime).await;
        }
        runtime.health_score
    }

    /// Re-adopt runtime state from a restored snapshot
    pub(crate) async fn adopt(
        self: &Arc<Self>,
        state: AgentState,
        health_score: f64,
        scale_factor: f64,
        allocation_id: Option<String>,
    ) {
        {
            let mut runtime = self.state.lock().await;
            runtime.state = state;
            runtime.health_score = health_score.clamp(0.0, 1.0);
            runtime.scale_factor = scale_factor.max(1.0);
            runtime.allocation_id = allocation_id;
        }
        if state != AgentState::Uninitialized && !self.profile.qos_floor.is_empty() {
            self.allocator
                .set_qos_floor(&self.profile.agent_id, self.profile.qos_floor.clone())
                .await;
        }
        if matches!(state, AgentState::Active | AgentState::Throttled) {
            self.start_health_loop().await;
        }
    }

    pub(crate) async fn scale_factor(&self) -> f64 {
        self.state.lock().await.scale_factor
    }

    /// Detach from the pool without releasing anything
    ///
    /// Used when an imported allocation table supersedes this agent's view;
    /// the held id may now belong to someone else, so it must not be freed.
    pub(crate) async fn quiesce(&self) {
        self.stop_health_loop().await;
        let mut runtime = self.state.lock().await;
        runtime.allocation_id = None;
        if runtime.state != AgentState::Destroyed {
            runtime.state = AgentState::Stopped;
        }
    }

    /// Reduce footprint under pressure
    ///
    /// While scaled above baseline, one graceful step down keeps the agent
    /// active; at baseline, or when `hard` is set, it throttles.
    async fn shed_load(&self, hard: bool) -> Result<(), LifecycleError> {
        if !hard {
            let mut runtime = self.state.lock().await;
            if runtime.state == AgentState::Active && runtime.scale_factor > 1.0 + f64::EPSILON {
                if let Some(id) = runtime.allocation_id.clone() {
                    let target_factor =
                        (runtime.scale_factor - self.profile.scaling.step_factor).max(1.0);
                    self.allocator
                        .resize(&id, self.scaled_target(target_factor))
                        .await?;
                    runtime.scale_factor = target_factor;
                    info!(
                        agent_id = %self.profile.agent_id,
                        factor = target_factor,
                        "Shed scaled allocation under pressure"
                    );
                    return Ok(());
                }
            }
        }
        self.throttle().await
    }

    async fn maybe_scale(&self, runtime: &mut AgentRuntime, allocation_id: &str) {
        let policy = &self.profile.scaling;
        let target_factor = if runtime.last_usage >= SCALE_UP_USAGE {
            (runtime.scale_factor + policy.step_factor).min(policy.ceiling_factor)
        } else if runtime.last_usage <= SCALE_DOWN_USAGE {
            (runtime.scale_factor - policy.step_factor).max(1.0)
        } else {
            runtime.scale_factor
        };
        if (target_factor - runtime.scale_factor).abs() < f64::EPSILON {
            return;
        }

        let desired = self.scaled_target(target_factor);
        match self.allocator.resize(allocation_id, desired).await {
            Ok(decision) => {
                runtime.scale_factor = target_factor;
                info!(
                    agent_id = %self.profile.agent_id,
                    factor = target_factor,
                    usage = runtime.last_usage,
                    "Agent allocation rescaled"
                );
                if let Decision::Partial { shortfall, .. } = decision {
                    debug!(
                        agent_id = %self.profile.agent_id,
                        ?shortfall,
                        "Scale step partially satisfied"
                    );
                }
            }
            // Scaling is best-effort; the agent keeps running either way
            Err(error) => warn!(
                agent_id = %self.profile.agent_id,
                error = %error,
                "Scale step failed"
            ),
        }
    }

    async fn force_release(&self, runtime: &mut AgentRuntime) {
        if let Some(id) = runtime.allocation_id.take() {
            match self.allocator.release(&id).await {
                Ok(()) | Err(AllocError::UnknownAllocation(_)) => {}
                Err(error) => warn!(
                    agent_id = %self.profile.agent_id,
                    error = %error,
                    "Force release failed"
                ),
            }
        }
        self.transition(runtime, AgentState::Error);
    }

    async fn start_health_loop(self: &Arc<Self>) {
        let mut task = self.health_task.lock().await;
        if let Some(old) = task.take() {
            // A previous loop either exited already or will on this signal
            let _ = old.shutdown.send(());
        }

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let agent = Arc::clone(self);
        let handle = tokio::spawn(async move {
            agent.run_health(shutdown_rx).await;
        });
        *task = Some(HealthTask {
            shutdown: shutdown_tx,
            handle,
        });
    }

    async fn stop_health_loop(&self) {
        let task = self.health_task.lock().await.take();
        if let Some(task) = task {
            let _ = task.shutdown.send(());
            let _ = task.handle.await;
        }
    }

    async fn run_health(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.profile.health.interval_secs));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.evaluate_health_once().await;
                    if !matches!(
                        self.state().await,
                        AgentState::Active | AgentState::Throttled
                    ) {
                        debug!(
                            agent_id = %self.profile.agent_id,
                            "Health loop ending, agent no longer running"
                        );
                        break;
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    }

    fn transition(&self, runtime: &mut AgentRuntime, to: AgentState) {
        let from = runtime.state;
        runtime.state = to;
        self.logger
            .log_agent_state(&self.profile.agent_id, from.as_str(), to.as_str());
    }

    /// Required units scaled by the current growth factor
    fn scaled_target(&self, factor: f64) -> ResourceUnits {
        self.profile
            .required
            .iter()
            .map(|(kind, required)| (*kind, required * factor))
            .collect()
    }

    /// Reduced units held while throttled; the floor always wins
    fn throttle_target(&self) -> ResourceUnits {
        self.profile
            .required
            .iter()
            .map(|(kind, required)| {
                let floor = self.profile.qos_floor.get(kind).copied().unwrap_or(0.0);
                (*kind, (required * THROTTLE_FACTOR).max(floor))
            })
            .collect()
    }

    /// Units the agent cannot start below: its guaranteed floor where
    /// declared, the full requirement otherwise
    fn start_minimum(&self) -> ResourceUnits {
        self.profile
            .required
            .iter()
            .map(|(kind, required)| {
                let floor = self
                    .profile
                    .qos_floor
                    .get(kind)
                    .copied()
                    .unwrap_or(*required);
                (*kind, floor.min(*required))
            })
            .collect()
    }
}

fn validate_profile(profile: &AgentResourceProfile) -> Result<(), ConfigurationError> {
    for (kind, floor) in &profile.qos_floor {
        let required = profile.required.get(kind).copied().unwrap_or(0.0);
        if *floor > required {
            return Err(ConfigurationError::FloorAboveRequired {
                agent_id: profile.agent_id.clone(),
                kind: *kind,
                floor: *floor,
                required,
            });
        }
    }
    if profile.scaling.enabled {
        if profile.scaling.ceiling_factor < 1.0 {
            return Err(ConfigurationError::InvalidScalingCeiling(
                profile.scaling.ceiling_factor,
            ));
        }
        if profile.scaling.step_factor <= 0.0 {
            return Err(ConfigurationError::InvalidScalingStep(
                profile.scaling.step_factor,
            ));
        }
    }
    if !(0.0..1.0).contains(&profile.health.floor) {
        return Err(ConfigurationError::InvalidHealthFloor(profile.health.floor));
    }
    if profile.health.interval_secs == 0 {
        return Err(ConfigurationError::ZeroInterval);
    }
    Ok(())
}

fn meets(granted: &ResourceUnits, minimum: &ResourceUnits) -> bool {
    minimum
        .iter()
        .all(|(kind, amount)| granted.get(kind).copied().unwrap_or(0.0) + UNIT_EPSILON >= *amount)
}

/// Per-kind gap between required and currently granted units
fn gap_to(granted: &ResourceUnits, required: &ResourceUnits) -> ResourceUnits {
    required
        .iter()
        .filter_map(|(kind, required_amount)| {
            let held = granted.get(kind).copied().unwrap_or(0.0);
            let gap = required_amount - held;
            (gap > UNIT_EPSILON).then_some((*kind, gap))
        })
        .collect()
}

/// Minimum per-kind coverage of the expected units, in [0, 1]
fn fullness_of(granted: &ResourceUnits, expected: &ResourceUnits) -> f64 {
    let mut fullness: f64 = 1.0;
    for (kind, expected_amount) in expected {
        if *expected_amount <= 0.0 {
            continue;
        }
        let held = granted.get(kind).copied().unwrap_or(0.0);
        fullness = fullness.min((held / expected_amount).min(1.0));
    }
    fullness
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::AllocatorConfig;
    use crate::models::{HealthPolicy, ScalingPolicy, StrategyKind};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn pool_config(allow_sharing: bool) -> AllocatorConfig {
        AllocatorConfig {
            strategy: StrategyKind::Priority,
            max_memory_mb: 4096.0,
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

    fn test_allocator() -> Arc<Allocator> {
        let (allocator, _rx) = Allocator::new(pool_config(false)).unwrap();
        Arc::new(allocator)
    }

    fn sharing_allocator() -> Arc<Allocator> {
        let (allocator, _rx) = Allocator::new(pool_config(true)).unwrap();
        Arc::new(allocator)
    }

    fn test_profile(agent_id: &str) -> AgentResourceProfile {
        AgentResourceProfile {
            agent_id: agent_id.to_string(),
            required: [(ResourceKind::Memory, 1024.0)].into_iter().collect(),
            qos_floor: [(ResourceKind::Memory, 256.0)].into_iter().collect(),
            priority: 5,
            scaling: ScalingPolicy {
                enabled: true,
                ceiling_factor: 2.0,
                step_factor: 0.5,
            },
            health: HealthPolicy {
                floor: 0.2,
                interval_secs: 30,
            },
        }
    }

    fn test_agent(agent_id: &str, allocator: Arc<Allocator>) -> Arc<AgentResourceManager> {
        Arc::new(AgentResourceManager::new(test_profile(agent_id), allocator).unwrap())
    }

    async fn fill_pool(allocator: &Allocator, agent_id: &str, memory_mb: f64) -> String {
        let request = ResourceRequest::new(
            agent_id,
            [(ResourceKind::Memory, memory_mb)].into_iter().collect(),
            1,
        );
        match allocator.allocate(request).await {
            Decision::Granted { allocation_id, .. } => allocation_id,
            other => panic!("filler not granted: {other:?}"),
        }
    }

    fn memory_of(record: &AllocationRecord) -> f64 {
        record.resources[&ResourceKind::Memory]
    }

    struct StaticProbe(AtomicBool);

    #[async_trait]
    impl LivenessProbe for StaticProbe {
        async fn alive(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_lifecycle_happy_path() {
        let allocator = test_allocator();
        let agent = test_agent("a", Arc::clone(&allocator));
        assert_eq!(agent.state().await, AgentState::Uninitialized);

        agent.initialize().await.unwrap();
        assert_eq!(agent.state().await, AgentState::Ready);
        let record = agent.allocation().await.unwrap();
        assert!((memory_of(&record) - 1024.0).abs() < 1e-9);

        agent.start().await.unwrap();
        assert_eq!(agent.state().await, AgentState::Active);

        agent.stop().await.unwrap();
        assert_eq!(agent.state().await, AgentState::Stopped);
        assert!(agent.allocation().await.is_none());
        let allocated = allocator.allocated_units().await;
        assert!(allocated
            .get(&ResourceKind::Memory)
            .copied()
            .unwrap_or(0.0)
            .abs()
            < 1e-9);

        // Restart acquires a fresh allocation
        agent.start().await.unwrap();
        assert_eq!(agent.state().await, AgentState::Active);
        assert!(agent.allocation().await.is_some());

        agent.stop().await.unwrap();
        agent.destroy().await.unwrap();
        assert_eq!(agent.state().await, AgentState::Destroyed);
        assert!(matches!(
            agent.start().await,
            Err(LifecycleError::InvalidTransition {
                from: AgentState::Destroyed,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_start_requires_initialize() {
        let agent = test_agent("a", test_allocator());
        assert!(matches!(
            agent.start().await,
            Err(LifecycleError::InvalidTransition {
                from: AgentState::Uninitialized,
                to: AgentState::Active,
            })
        ));
    }

    #[tokio::test]
    async fn test_initialize_denied_leaves_uninitialized() {
        let allocator = test_allocator();
        fill_pool(&allocator, "filler", 3500.0).await;

        let agent = test_agent("a", Arc::clone(&allocator));
        match agent.initialize().await {
            Err(LifecycleError::InsufficientResources { agent_id, shortfall }) => {
                assert_eq!(agent_id, "a");
                let gap = shortfall.get(&ResourceKind::Memory).copied().unwrap();
                assert!((gap - 428.0).abs() < 1e-6);
            }
            other => panic!("expected insufficient resources, got {other:?}"),
        }
        assert_eq!(agent.state().await, AgentState::Uninitialized);
        // The denied request must not linger as a pending promotion
        assert_eq!(allocator.records().await.len(), 1);
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let allocator = test_allocator();
        let agent = test_agent("a", Arc::clone(&allocator));
        agent.initialize().await.unwrap();
        agent.initialize().await.unwrap();
        assert_eq!(allocator.records().await.len(), 1);
    }

    #[tokio::test]
    async fn test_start_and_stop_idempotent() {
        let allocator = test_allocator();
        let agent = test_agent("a", Arc::clone(&allocator));
        agent.initialize().await.unwrap();

        agent.start().await.unwrap();
        agent.start().await.unwrap();
        assert_eq!(allocator.records().await.len(), 1);

        agent.stop().await.unwrap();
        agent.stop().await.unwrap();
        assert_eq!(agent.state().await, AgentState::Stopped);
    }

    #[tokio::test]
    async fn test_initialize_registers_qos_floor() {
        let allocator = test_allocator();
        let agent = test_agent("a", Arc::clone(&allocator));
        agent.initialize().await.unwrap();
        agent.start().await.unwrap();

        let id = agent.allocation().await.unwrap().id;
        let result = allocator
            .resize(&id, [(ResourceKind::Memory, 128.0)].into_iter().collect())
            .await;
        assert!(matches!(result, Err(AllocError::QosViolation { .. })));
    }

    #[tokio::test]
    async fn test_partial_hold_starts_above_floor() {
        let allocator = sharing_allocator();
        fill_pool(&allocator, "filler", 3500.0).await;

        // 596 MB remain; the 256 MB floor makes a degraded start acceptable
        let agent = test_agent("a", Arc::clone(&allocator));
        agent.initialize().await.unwrap();
        assert_eq!(agent.state().await, AgentState::Ready);
        let record = agent.allocation().await.unwrap();
        assert!((memory_of(&record) - 596.0).abs() < 1e-9);

        agent.start().await.unwrap();
        assert_eq!(agent.state().await, AgentState::Active);
    }

    #[tokio::test]
    async fn test_partial_hold_below_required_blocks_start() {
        let allocator = sharing_allocator();
        let filler_id = fill_pool(&allocator, "filler", 3500.0).await;

        // No declared floor, so nothing less than full coverage may start
        let mut profile = test_profile("a");
        profile.qos_floor = ResourceUnits::new();
        let agent = Arc::new(AgentResourceManager::new(profile, Arc::clone(&allocator)).unwrap());

        agent.initialize().await.unwrap();
        match agent.start().await {
            Err(LifecycleError::InsufficientResources { shortfall, .. }) => {
                let gap = shortfall.get(&ResourceKind::Memory).copied().unwrap();
                assert!((gap - 428.0).abs() < 1e-6);
            }
            other => panic!("expected insufficient resources, got {other:?}"),
        }
        assert_eq!(agent.state().await, AgentState::Ready);

        // Freed capacity lets the next attempt top the hold up to full
        allocator.release(&filler_id).await.unwrap();
        agent.start().await.unwrap();
        assert_eq!(agent.state().await, AgentState::Active);
        let record = agent.allocation().await.unwrap();
        assert!((memory_of(&record) - 1024.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_throttle_and_resume() {
        let allocator = test_allocator();
        let agent = test_agent("a", allocator);
        agent.initialize().await.unwrap();
        agent.start().await.unwrap();

        agent.throttle().await.unwrap();
        assert_eq!(agent.state().await, AgentState::Throttled);
        // Half of 1024, still above the 256 floor
        let record = agent.allocation().await.unwrap();
        assert!((memory_of(&record) - 512.0).abs() < 1e-9);

        agent.throttle().await.unwrap();
        assert_eq!(agent.state().await, AgentState::Throttled);

        agent.resume().await.unwrap();
        assert_eq!(agent.state().await, AgentState::Active);
        let record = agent.allocation().await.unwrap();
        assert!((memory_of(&record) - 1024.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_throttle_never_breaches_floor() {
        let allocator = test_allocator();
        let mut profile = test_profile("a");
        profile.required = [(ResourceKind::Memory, 300.0)].into_iter().collect();
        profile.qos_floor = [(ResourceKind::Memory, 256.0)].into_iter().collect();
        let agent = Arc::new(AgentResourceManager::new(profile, allocator).unwrap());
        agent.initialize().await.unwrap();
        agent.start().await.unwrap();

        agent.throttle().await.unwrap();
        // Half of 300 would be 150; the floor keeps it at 256
        let record = agent.allocation().await.unwrap();
        assert!((memory_of(&record) - 256.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_usage_scales_up_to_ceiling_and_back() {
        let allocator = test_allocator();
        let agent = test_agent("a", allocator);
        agent.initialize().await.unwrap();
        agent.start().await.unwrap();

        agent.record_usage(0.9).await.unwrap();
        let record = agent.allocation().await.unwrap();
        assert!((memory_of(&record) - 1536.0).abs() < 1e-9);

        agent.record_usage(0.9).await.unwrap();
        let record = agent.allocation().await.unwrap();
        assert!((memory_of(&record) - 2048.0).abs() < 1e-9);

        // Ceiling of 2.0x holds
        agent.record_usage(0.95).await.unwrap();
        let record = agent.allocation().await.unwrap();
        assert!((memory_of(&record) - 2048.0).abs() < 1e-9);

        // Idle usage sheds one step, never below the required baseline
        agent.record_usage(0.1).await.unwrap();
        let record = agent.allocation().await.unwrap();
        assert!((memory_of(&record) - 1536.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_moderate_usage_does_not_scale() {
        let allocator = test_allocator();
        let agent = test_agent("a", allocator);
        agent.initialize().await.unwrap();
        agent.start().await.unwrap();

        agent.record_usage(0.5).await.unwrap();
        let record = agent.allocation().await.unwrap();
        assert!((memory_of(&record) - 1024.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_health_stays_high_under_nominal_load() {
        let allocator = test_allocator();
        let agent = test_agent("a", allocator);
        agent.initialize().await.unwrap();
        agent.start().await.unwrap();
        agent.record_usage(0.5).await.unwrap();

        for _ in 0..3 {
            agent.evaluate_health_once().await;
        }
        assert!(agent.health_score().await > 0.99);
        assert_eq!(agent.state().await, AgentState::Active);
    }

    #[tokio::test]
    async fn test_health_floor_marks_error_and_releases() {
        let allocator = test_allocator();
        let agent = test_agent("a", Arc::clone(&allocator));
        agent.initialize().await.unwrap();
        agent.start().await.unwrap();
        agent.record_usage(1.0).await.unwrap();

        // Sustained saturation decays 1.0 -> 0.7^n; the fifth pass crosses 0.2
        let mut score = 1.0;
        for _ in 0..5 {
            score = agent.evaluate_health_once().await;
        }
        assert!(score < 0.2);
        assert_eq!(agent.state().await, AgentState::Error);
        assert!(agent.allocation().await.is_none());
        let allocated = allocator.allocated_units().await;
        assert!(allocated
            .get(&ResourceKind::Memory)
            .copied()
            .unwrap_or(0.0)
            .abs()
            < 1e-9);

        // Recovery goes through stop, then a fresh start
        agent.stop().await.unwrap();
        agent.start().await.unwrap();
        assert_eq!(agent.state().await, AgentState::Active);
        assert!(agent.health_score().await > 0.99);
    }

    #[tokio::test]
    async fn test_dead_liveness_probe_degrades_health() {
        let allocator = test_allocator();
        let probe = Arc::new(StaticProbe(AtomicBool::new(true)));
        let agent = Arc::new(
            AgentResourceManager::new(test_profile("a"), allocator)
                .unwrap()
                .with_liveness_probe(Arc::clone(&probe) as Arc<dyn LivenessProbe>),
        );
        agent.initialize().await.unwrap();
        agent.start().await.unwrap();
        agent.record_usage(0.5).await.unwrap();

        agent.evaluate_health_once().await;
        assert!(agent.health_score().await > 0.99);

        probe.0.store(false, Ordering::SeqCst);
        for _ in 0..5 {
            agent.evaluate_health_once().await;
        }
        assert_eq!(agent.state().await, AgentState::Error);
    }

    #[tokio::test]
    async fn test_high_pressure_sheds_gracefully_before_throttling() {
        let allocator = test_allocator();
        let agent = test_agent("a", allocator);
        agent.initialize().await.unwrap();
        agent.start().await.unwrap();
        agent.record_usage(0.9).await.unwrap();
        let record = agent.allocation().await.unwrap();
        assert!((memory_of(&record) - 1536.0).abs() < 1e-9);

        let high = PressureTransition {
            kind: ResourceKind::Memory,
            from: PressureLevel::Moderate,
            to: PressureLevel::High,
            value_pct: 90.0,
            timestamp: 100,
            predicted: false,
            confidence: None,
        };
        // First escalation drops the scaled growth but keeps the agent active
        agent.on_pressure(&high).await;
        assert_eq!(agent.state().await, AgentState::Active);
        let record = agent.allocation().await.unwrap();
        assert!((memory_of(&record) - 1024.0).abs() < 1e-9);

        // At baseline the same escalation throttles
        agent.on_pressure(&high).await;
        assert_eq!(agent.state().await, AgentState::Throttled);
        let record = agent.allocation().await.unwrap();
        assert!((memory_of(&record) - 512.0).abs() < 1e-9);

        let relief = PressureTransition {
            kind: ResourceKind::Memory,
            from: PressureLevel::High,
            to: PressureLevel::Normal,
            value_pct: 40.0,
            timestamp: 200,
            predicted: false,
            confidence: None,
        };
        agent.on_pressure(&relief).await;
        assert_eq!(agent.state().await, AgentState::Active);
        let record = agent.allocation().await.unwrap();
        assert!((memory_of(&record) - 1024.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_critical_pressure_throttles_immediately() {
        let allocator = test_allocator();
        let agent = test_agent("a", allocator);
        agent.initialize().await.unwrap();
        agent.start().await.unwrap();
        agent.record_usage(0.9).await.unwrap();

        let critical = PressureTransition {
            kind: ResourceKind::Memory,
            from: PressureLevel::Moderate,
            to: PressureLevel::Critical,
            value_pct: 97.0,
            timestamp: 100,
            predicted: false,
            confidence: None,
        };
        agent.on_pressure(&critical).await;
        assert_eq!(agent.state().await, AgentState::Throttled);
        let record = agent.allocation().await.unwrap();
        assert!((memory_of(&record) - 512.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_predicted_pressure_is_advisory() {
        let allocator = test_allocator();
        let agent = test_agent("a", allocator);
        agent.initialize().await.unwrap();
        agent.start().await.unwrap();

        let forecast = PressureTransition {
            kind: ResourceKind::Memory,
            from: PressureLevel::Normal,
            to: PressureLevel::Critical,
            value_pct: 99.0,
            timestamp: 100,
            predicted: true,
            confidence: Some(0.9),
        };
        agent.on_pressure(&forecast).await;
        assert_eq!(agent.state().await, AgentState::Active);
    }

    #[tokio::test]
    async fn test_floor_above_required_rejected() {
        let mut profile = test_profile("a");
        profile.qos_floor = [(ResourceKind::Memory, 2048.0)].into_iter().collect();

        let result = AgentResourceManager::new(profile, test_allocator());
        assert!(matches!(
            result,
            Err(ConfigurationError::FloorAboveRequired {
                kind: ResourceKind::Memory,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent_and_terminal() {
        let allocator = test_allocator();
        let agent = test_agent("a", Arc::clone(&allocator));
        agent.initialize().await.unwrap();
        agent.start().await.unwrap();

        agent.destroy().await.unwrap();
        agent.destroy().await.unwrap();
        let allocated = allocator.allocated_units().await;
        assert!(allocated
            .get(&ResourceKind::Memory)
            .copied()
            .unwrap_or(0.0)
            .abs()
            < 1e-9);
        assert!(matches!(
            agent.initialize().await,
            Err(LifecycleError::InvalidTransition { .. })
        ));
    }
}
