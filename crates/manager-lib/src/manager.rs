//! Top-level orchestration
//!
//! One [`ResourceManager`] owns the monitor, the allocator, and the pressure
//! detector, plus a registry of per-agent managers. It starts and stops the
//! stack in dependency order, fans pressure transitions out to agents, keeps
//! an aggregated health picture, and can export its whole state to a
//! checksummed snapshot and adopt one back.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::agent::{AgentResourceManager, AgentState, LivenessProbe};
use crate::alloc::{AllocationAction, AllocationEvent, Allocator, AllocatorConfig};
use crate::error::{ConfigurationError, LifecycleError, StateError};
use crate::health::{components, AgentHealth, HealthRegistry, HealthReport};
use crate::history::HistoryBuffer;
use crate::models::{AgentResourceProfile, PressureLevel, ResourceAlert, ResourceKind};
use crate::monitor::{
    AlertHandler, MonitorAlert, MonitorConfig, PlatformSampler, ResourceMonitor, SampleExporter,
    SysinfoSampler,
};
use crate::observability::{ManagerMetrics, PrometheusSampleExporter, StructuredLogger};
use crate::pressure::prediction::PredictionModel;
use crate::pressure::{PressureConfig, PressureDetector, PressureTransition, ResponseAction};
use crate::state::{
    load_snapshot, save_snapshot, AgentSnapshot, PoolSnapshot, StateSnapshot, SNAPSHOT_VERSION,
};

/// Instance name used when the builder is given none
const DEFAULT_INSTANCE: &str = "resource-manager";

/// Threshold alerts retained for health reports
const DEFAULT_RECENT_ALERTS: usize = 64;

/// Alert handler that keeps the most recent threshold alerts for reporting
struct AlertLog {
    ring: StdMutex<HistoryBuffer<ResourceAlert>>,
    logger: StructuredLogger,
}

impl AlertLog {
    fn new(capacity: usize, logger: StructuredLogger) -> Result<Self, ConfigurationError> {
        Ok(Self {
            ring: StdMutex::new(HistoryBuffer::new(capacity)?),
            logger,
        })
    }

    /// Retained alerts, oldest first
    fn recent(&self) -> Vec<ResourceAlert> {
        self.ring
            .lock()
            .map(|ring| ring.to_vec())
            .unwrap_or_default()
    }
}

impl AlertHandler for AlertLog {
    fn handle(&self, alert: &MonitorAlert) {
        match alert {
            MonitorAlert::Threshold(alert) => {
                self.logger.log_alert(alert.kind, alert.level, alert.value);
                if let Ok(mut ring) = self.ring.lock() {
                    ring.push(alert.clone());
                }
            }
            MonitorAlert::Degraded {
                consecutive_failures,
                ..
            } => {
                self.logger.log_monitor_degraded(*consecutive_failures);
            }
        }
    }
}

/// Built-in response action: sweep idle allocations once pressure is high
///
/// Registered ahead of caller-supplied actions so freed units are already
/// back in the pool by the time custom mitigations run.
pub struct ReclaimUnderPressure {
    allocator: Arc<Allocator>,
}

impl ReclaimUnderPressure {
    pub fn new(allocator: Arc<Allocator>) -> Self {
        Self { allocator }
    }
}

#[async_trait]
impl ResponseAction for ReclaimUnderPressure {
    fn name(&self) -> &'static str {
        "reclaim-idle"
    }

    fn engages_at(&self) -> PressureLevel {
        PressureLevel::High
    }

    async fn execute(&self, transition: &PressureTransition) -> anyhow::Result<()> {
        let reclaimed = self.allocator.reclaim_sweep().await;
        debug!(
            kind = %transition.kind,
            level = %transition.to,
            reclaimed = reclaimed,
            "Idle reclaim pass under pressure"
        );
        Ok(())
    }
}

/// Event pump that hands its receiver back when shut down, so a later
/// `start()` can resume consuming the same channel
struct PumpTask<T> {
    shutdown: broadcast::Sender<()>,
    handle: JoinHandle<mpsc::UnboundedReceiver<T>>,
}

impl<T> PumpTask<T> {
    async fn stop(self) -> Option<mpsc::UnboundedReceiver<T>> {
        let _ = self.shutdown.send(());
        self.handle.await.ok()
    }
}

struct ManagerTasks {
    alloc_pump: Option<PumpTask<AllocationEvent>>,
    pressure_pump: Option<PumpTask<PressureTransition>>,
}

/// Fluent construction for [`ResourceManager`]
///
/// Component configs default to production values; the sampler defaults to
/// the sysinfo host sampler. Tests inject a scripted sampler instead.
pub struct ResourceManagerBuilder {
    instance: String,
    monitor: MonitorConfig,
    allocator: AllocatorConfig,
    pressure: PressureConfig,
    sampler: Option<Arc<dyn PlatformSampler>>,
    model: Option<Box<dyn PredictionModel>>,
    alert_handlers: Vec<Arc<dyn AlertHandler>>,
    sample_exporters: Vec<Arc<dyn SampleExporter>>,
    response_actions: Vec<Arc<dyn ResponseAction>>,
    recent_alerts: usize,
}

impl Default for ResourceManagerBuilder {
    fn default() -> Self {
        Self {
            instance: DEFAULT_INSTANCE.to_string(),
            monitor: MonitorConfig::default(),
            allocator: AllocatorConfig::default(),
            pressure: PressureConfig::default(),
            sampler: None,
            model: None,
            alert_handlers: Vec::new(),
            sample_exporters: Vec::new(),
            response_actions: Vec::new(),
            recent_alerts: DEFAULT_RECENT_ALERTS,
        }
    }
}

impl ResourceManagerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Instance name carried on every structured log event
    pub fn instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = instance.into();
        self
    }

    pub fn monitor_config(mut self, config: MonitorConfig) -> Self {
        self.monitor = config;
        self
    }

    pub fn allocator_config(mut self, config: AllocatorConfig) -> Self {
        self.allocator = config;
        self
    }

    pub fn pressure_config(mut self, config: PressureConfig) -> Self {
        self.pressure = config;
        self
    }

    /// Platform sampler; defaults to [`SysinfoSampler`]
    pub fn sampler(mut self, sampler: Arc<dyn PlatformSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    /// Forecasting model overriding the one named in the pressure config
    pub fn prediction_model(mut self, model: Box<dyn PredictionModel>) -> Self {
        self.model = Some(model);
        self
    }

    /// Additional alert handler, run after the built-in alert log
    pub fn alert_handler(mut self, handler: Arc<dyn AlertHandler>) -> Self {
        self.alert_handlers.push(handler);
        self
    }

    /// Additional sample exporter, run after the Prometheus gauges
    pub fn sample_exporter(mut self, exporter: Arc<dyn SampleExporter>) -> Self {
        self.sample_exporters.push(exporter);
        self
    }

    /// Additional pressure response action, run after the built-in reclaim
    pub fn response_action(mut self, action: Arc<dyn ResponseAction>) -> Self {
        self.response_actions.push(action);
        self
    }

    /// How many threshold alerts health reports retain
    pub fn recent_alerts(mut self, capacity: usize) -> Self {
        self.recent_alerts = capacity;
        self
    }

    /// Validate all configs and wire the components together
    pub fn build(self) -> Result<ResourceManager, ConfigurationError> {
        let metrics = ManagerMetrics::new();
        let logger = StructuredLogger::new(self.instance.clone());
        let alert_log = Arc::new(AlertLog::new(self.recent_alerts, logger.clone())?);

        let sampler = self
            .sampler
            .unwrap_or_else(|| Arc::new(SysinfoSampler::new(self.allocator.max_network_mbps)));
        let mut monitor = ResourceMonitor::new(self.monitor, sampler)?;
        monitor.register_alert_handler(Arc::clone(&alert_log) as Arc<dyn AlertHandler>);
        for handler in self.alert_handlers {
            monitor.register_alert_handler(handler);
        }
        monitor.register_exporter(Arc::new(PrometheusSampleExporter::new()));
        for exporter in self.sample_exporters {
            monitor.register_exporter(exporter);
        }
        let monitor = Arc::new(monitor);

        let (allocator, allocation_events) = Allocator::new(self.allocator)?;
        let allocator = Arc::new(allocator);

        let (mut detector, pressure_transitions) = match self.model {
            Some(model) => {
                PressureDetector::with_model(self.pressure, monitor.history(), Some(model))?
            }
            None => PressureDetector::new(self.pressure, monitor.history())?,
        };
        detector.register_action(Arc::new(ReclaimUnderPressure::new(Arc::clone(&allocator))));
        for action in self.response_actions {
            detector.register_action(action);
        }
        let detector = Arc::new(detector);

        let health = HealthRegistry::with_components([
            components::MONITOR,
            components::ALLOCATOR,
            components::PRESSURE_DETECTOR,
        ]);

        Ok(ResourceManager {
            instance: self.instance,
            monitor,
            allocator,
            detector,
            agents: DashMap::new(),
            health,
            alert_log,
            allocation_events: Mutex::new(Some(allocation_events)),
            pressure_transitions: Mutex::new(Some(pressure_transitions)),
            tasks: Mutex::new(None),
            logger,
            metrics,
        })
    }
}

/// Orchestrator owning one monitor, allocator, and pressure detector plus
/// the registry of agent managers
pub struct ResourceManager {
    instance: String,
    monitor: Arc<ResourceMonitor>,
    allocator: Arc<Allocator>,
    detector: Arc<PressureDetector>,
    agents: DashMap<String, Arc<AgentResourceManager>>,
    health: HealthRegistry,
    alert_log: Arc<AlertLog>,
    allocation_events: Mutex<Option<mpsc::UnboundedReceiver<AllocationEvent>>>,
    pressure_transitions: Mutex<Option<mpsc::UnboundedReceiver<PressureTransition>>>,
    tasks: Mutex<Option<ManagerTasks>>,
    logger: StructuredLogger,
    metrics: ManagerMetrics,
}

impl ResourceManager {
    pub fn builder() -> ResourceManagerBuilder {
        ResourceManagerBuilder::new()
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn monitor(&self) -> Arc<ResourceMonitor> {
        Arc::clone(&self.monitor)
    }

    pub fn allocator(&self) -> Arc<Allocator> {
        Arc::clone(&self.allocator)
    }

    pub fn detector(&self) -> Arc<PressureDetector> {
        Arc::clone(&self.detector)
    }

    pub async fn is_running(&self) -> bool {
        self.tasks.lock().await.is_some()
    }

    /// Start the stack in dependency order
    ///
    /// Monitor and allocator services come up first, pressure detection
    /// next, agent managers last. A second call while running is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;
        if tasks.is_some() {
            debug!("Resource manager already running");
            return;
        }

        self.monitor.start().await;
        if self.monitor.config().enabled {
            self.health.set_healthy(components::MONITOR).await;
        } else {
            self.health
                .set_degraded(components::MONITOR, "sampling disabled")
                .await;
        }

        self.allocator.start_sweeper().await;
        self.health.set_healthy(components::ALLOCATOR).await;
        let alloc_pump = self.spawn_alloc_pump().await;

        self.detector.start().await;
        if self.detector.config().enabled {
            self.health.set_healthy(components::PRESSURE_DETECTOR).await;
        } else {
            self.health
                .set_degraded(components::PRESSURE_DETECTOR, "detection disabled")
                .await;
        }
        let pressure_pump = self.spawn_pressure_pump().await;

        for agent in self.agent_handles() {
            let state = agent.state().await;
            if matches!(state, AgentState::Ready | AgentState::Stopped) {
                if let Err(error) = agent.start().await {
                    warn!(
                        agent_id = %agent.agent_id(),
                        error = %error,
                        "Agent failed to start during cascade"
                    );
                }
            }
        }

        *tasks = Some(ManagerTasks {
            alloc_pump,
            pressure_pump,
        });
        self.logger.log_startup(env!("CARGO_PKG_VERSION"));
    }

    /// Stop everything in reverse dependency order
    ///
    /// Agents release their allocations first, then pressure detection,
    /// then the allocator services and the monitor. In-flight ticks
    /// complete before their loops exit. Idempotent.
    pub async fn stop(&self) {
        let Some(tasks) = self.tasks.lock().await.take() else {
            debug!("Resource manager already stopped");
            return;
        };

        for agent in self.agent_handles() {
            let state = agent.state().await;
            if matches!(
                state,
                AgentState::Active | AgentState::Throttled | AgentState::Error
            ) {
                if let Err(error) = agent.stop().await {
                    warn!(
                        agent_id = %agent.agent_id(),
                        error = %error,
                        "Agent failed to stop during cascade"
                    );
                }
            }
        }

        self.detector.stop().await;
        if let Some(pump) = tasks.pressure_pump {
            if let Some(receiver) = pump.stop().await {
                *self.pressure_transitions.lock().await = Some(receiver);
            }
        }

        self.allocator.stop_sweeper().await;
        if let Some(pump) = tasks.alloc_pump {
            if let Some(receiver) = pump.stop().await {
                *self.allocation_events.lock().await = Some(receiver);
            }
        }

        self.monitor.stop().await;

        self.health
            .set_degraded(components::PRESSURE_DETECTOR, "stopped")
            .await;
        self.health.set_degraded(components::ALLOCATOR, "stopped").await;
        self.health.set_degraded(components::MONITOR, "stopped").await;
        self.logger.log_shutdown("stop requested");
    }

    /// Register a new agent manager wired to this instance's allocator
    pub fn create_agent_manager(
        &self,
        profile: AgentResourceProfile,
    ) -> Result<Arc<AgentResourceManager>, ConfigurationError> {
        let agent = AgentResourceManager::new(profile, Arc::clone(&self.allocator))?;
        self.register_agent(Arc::new(agent))
    }

    /// Register a new agent manager with a caller-supplied liveness probe
    pub fn create_agent_manager_with_probe(
        &self,
        profile: AgentResourceProfile,
        probe: Arc<dyn LivenessProbe>,
    ) -> Result<Arc<AgentResourceManager>, ConfigurationError> {
        let agent = AgentResourceManager::new(profile, Arc::clone(&self.allocator))?
            .with_liveness_probe(probe);
        self.register_agent(Arc::new(agent))
    }

    fn register_agent(
        &self,
        agent: Arc<AgentResourceManager>,
    ) -> Result<Arc<AgentResourceManager>, ConfigurationError> {
        match self.agents.entry(agent.agent_id().to_string()) {
            Entry::Occupied(_) => Err(ConfigurationError::DuplicateAgent(
                agent.agent_id().to_string(),
            )),
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&agent));
                self.metrics.set_agents_registered(self.agents.len() as i64);
                info!(agent_id = %agent.agent_id(), "Agent manager registered");
                Ok(agent)
            }
        }
    }

    /// Deregister an agent, destroying it and releasing whatever it holds
    pub async fn remove_agent_manager(&self, agent_id: &str) -> Result<(), LifecycleError> {
        let (_, agent) = self
            .agents
            .remove(agent_id)
            .ok_or_else(|| LifecycleError::UnknownAgent(agent_id.to_string()))?;
        self.metrics.set_agents_registered(self.agents.len() as i64);
        agent.destroy().await?;
        info!(agent_id = %agent_id, "Agent manager removed");
        Ok(())
    }

    pub fn get_agent_manager(&self, agent_id: &str) -> Option<Arc<AgentResourceManager>> {
        self.agents.get(agent_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Registered agent ids, sorted
    pub fn agent_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.agents.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Aggregated view over components, pressure, recent alerts, and agents
    pub async fn health_report(&self) -> HealthReport {
        let (status, components) = self.health.snapshot().await;
        let pressure = self.detector.current_levels().await;
        let recent_alerts = self.alert_log.recent();

        let mut agents = Vec::new();
        for agent in self.agent_handles() {
            agents.push(AgentHealth {
                agent_id: agent.agent_id().to_string(),
                state: agent.state().await,
                health_score: agent.health_score().await,
            });
        }

        HealthReport {
            generated_at: Utc::now().timestamp(),
            status,
            components,
            pressure,
            recent_alerts,
            agents,
        }
    }

    /// Snapshot the pool, every allocation record, and every agent's runtime
    pub async fn export_state(&self) -> StateSnapshot {
        let allocations = self.allocator.records().await;
        let allocated = self.allocator.allocated_units().await;
        let config = self.allocator.config();

        let mut agents = Vec::new();
        for agent in self.agent_handles() {
            agents.push(AgentSnapshot {
                profile: agent.profile().clone(),
                state: agent.state().await,
                health_score: agent.health_score().await,
                scale_factor: agent.scale_factor().await,
                allocation_id: agent.allocation().await.map(|record| record.id),
            });
        }

        StateSnapshot {
            version: SNAPSHOT_VERSION,
            timestamp: Utc::now().timestamp(),
            pool: PoolSnapshot {
                capacity: config.capacity(),
                over_provisioning_factor: config.over_provisioning_factor,
                allocated,
            },
            allocations,
            agents,
        }
    }

    /// Adopt a snapshot wholesale, replacing the allocation table and the
    /// agent registry
    ///
    /// The snapshot is validated in full before anything is mutated: its
    /// version, every record's agent reference, every profile, and the
    /// capacity invariant against this instance's limits. A rejected
    /// snapshot leaves pool and registry untouched. Agents registered here
    /// but absent from the snapshot are detached without releasing, since
    /// their record ids may now belong to the imported table.
    pub async fn import_state(&self, snapshot: StateSnapshot) -> Result<(), StateError> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StateError::UnsupportedVersion(snapshot.version));
        }
        let known: HashSet<&str> = snapshot
            .agents
            .iter()
            .map(|agent| agent.profile.agent_id.as_str())
            .collect();
        for record in &snapshot.allocations {
            if !known.contains(record.agent_id.as_str()) {
                return Err(StateError::UnknownAgent(record.agent_id.clone()));
            }
        }

        // Reuse registered managers whose profile is unchanged so their
        // liveness probes survive the import; anything else is rebuilt.
        let mut incoming: Vec<(AgentSnapshot, Arc<AgentResourceManager>, bool)> = Vec::new();
        for snap in &snapshot.agents {
            let existing = self
                .get_agent_manager(&snap.profile.agent_id)
                .filter(|agent| agent.profile() == &snap.profile);
            match existing {
                Some(agent) => incoming.push((snap.clone(), agent, true)),
                None => {
                    let agent = AgentResourceManager::new(
                        snap.profile.clone(),
                        Arc::clone(&self.allocator),
                    )?;
                    incoming.push((snap.clone(), Arc::new(agent), false));
                }
            }
        }

        // The restore is the gate: a violating table is rejected unchanged
        let allocation_count = snapshot.allocations.len();
        self.allocator.restore(snapshot.allocations).await?;

        for agent in self.agent_handles() {
            if !known.contains(agent.agent_id()) {
                agent.quiesce().await;
                self.allocator.clear_qos_floor(agent.agent_id()).await;
                self.agents.remove(agent.agent_id());
            }
        }

        let agent_count = incoming.len();
        for (snap, agent, reused) in incoming {
            if reused {
                agent.quiesce().await;
            } else {
                self.agents
                    .insert(snap.profile.agent_id.clone(), Arc::clone(&agent));
            }
            agent
                .adopt(
                    snap.state,
                    snap.health_score,
                    snap.scale_factor,
                    snap.allocation_id,
                )
                .await;
        }

        self.metrics.set_agents_registered(self.agents.len() as i64);
        self.logger.log_state_loaded(allocation_count, agent_count);
        Ok(())
    }

    /// Export state to a checksummed snapshot file
    pub async fn save_state_to(&self, path: &Path) -> Result<(), StateError> {
        let snapshot = self.export_state().await;
        save_snapshot(&snapshot, path)?;
        self.logger
            .log_state_saved(&path.display().to_string(), snapshot.allocations.len());
        Ok(())
    }

    /// Load a snapshot file, verify its checksum, and adopt it
    pub async fn load_state_from(&self, path: &Path) -> Result<(), StateError> {
        let snapshot = load_snapshot(path)?;
        self.import_state(snapshot).await
    }

    /// Recompute pool totals from records, repairing and reporting drift
    pub async fn verify_consistency(&self) -> Vec<(ResourceKind, f64, f64)> {
        self.allocator.verify_consistency().await
    }

    /// Registered agents sorted by id, detached from the map locks
    fn agent_handles(&self) -> Vec<Arc<AgentResourceManager>> {
        let mut handles: Vec<Arc<AgentResourceManager>> = self
            .agents
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        handles.sort_by(|a, b| a.agent_id().cmp(b.agent_id()));
        handles
    }

    async fn spawn_alloc_pump(self: &Arc<Self>) -> Option<PumpTask<AllocationEvent>> {
        let receiver = self.allocation_events.lock().await.take()?;
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let manager = Arc::clone(self);
        let handle =
            tokio::spawn(async move { manager.run_alloc_pump(receiver, shutdown_rx).await });
        Some(PumpTask {
            shutdown: shutdown_tx,
            handle,
        })
    }

    async fn run_alloc_pump(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<AllocationEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> mpsc::UnboundedReceiver<AllocationEvent> {
        loop {
            tokio::select! {
                maybe = events.recv() => match maybe {
                    Some(event) => self.on_allocation_event(&event).await,
                    None => break,
                },
                _ = shutdown.recv() => break,
            }
        }
        events
    }

    async fn on_allocation_event(&self, event: &AllocationEvent) {
        if event.action == AllocationAction::Reclaimed {
            if let Some(id) = event.allocation_id.as_deref() {
                if let Some(record) = self.allocator.record(id).await {
                    let idle_secs = (event.timestamp - record.last_used_at).max(0);
                    self.logger.log_reclaim(id, &event.agent_id, idle_secs);
                    return;
                }
            }
        }
        self.logger.log_allocation(
            &event.agent_id,
            event.action.as_str(),
            event.allocation_id.as_deref().unwrap_or("-"),
        );
    }

    async fn spawn_pressure_pump(self: &Arc<Self>) -> Option<PumpTask<PressureTransition>> {
        let receiver = self.pressure_transitions.lock().await.take()?;
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let manager = Arc::clone(self);
        let handle =
            tokio::spawn(async move { manager.run_pressure_pump(receiver, shutdown_rx).await });
        Some(PumpTask {
            shutdown: shutdown_tx,
            handle,
        })
    }

    async fn run_pressure_pump(
        self: Arc<Self>,
        mut transitions: mpsc::UnboundedReceiver<PressureTransition>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> mpsc::UnboundedReceiver<PressureTransition> {
        loop {
            tokio::select! {
                maybe = transitions.recv() => match maybe {
                    Some(transition) => self.on_pressure_transition(&transition).await,
                    None => break,
                },
                _ = shutdown.recv() => break,
            }
        }
        transitions
    }

    /// Fan an observed transition out to every agent
    ///
    /// Forecasts only log here; the detector's response actions have
    /// already run for them, and agents react to observed pressure alone.
    async fn on_pressure_transition(&self, transition: &PressureTransition) {
        if transition.predicted {
            info!(
                kind = %transition.kind,
                level = %transition.to,
                value_pct = transition.value_pct,
                confidence = ?transition.confidence,
                "Pressure escalation forecast"
            );
            return;
        }

        self.logger
            .log_pressure_transition(transition.kind, transition.from, transition.to);
        for agent in self.agent_handles() {
            agent.on_pressure(transition).await;
        }

        if transition.to == PressureLevel::Critical && transition.to > transition.from {
            // Worst-case regime: make sure the books still balance
            let drift = self.allocator.verify_consistency().await;
            if !drift.is_empty() {
                warn!(
                    drifts = drift.len(),
                    "Pool accounting repaired under critical pressure"
                );
            }
        }
    }
}
