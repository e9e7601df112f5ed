//! Resource monitoring
//!
//! Periodically samples platform utilization, retains samples in a bounded
//! history, and raises edge-triggered threshold alerts. Sampling failures
//! are survivable: the loop records a gap marker and keeps going, escalating
//! only after repeated consecutive failures.

mod sampler;

pub use sampler::{PlatformSampler, SysinfoSampler};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::{debug, info, warn};

use crate::error::{ConfigurationError, SampleError};
use crate::history::HistoryBuffer;
use crate::models::{AlertLevel, ResourceAlert, ResourceKind, ResourceSample};
use crate::observability::ManagerMetrics;

/// Default sampling interval
const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

/// Default number of retained samples
const DEFAULT_HISTORY_SAMPLES: usize = 360;

/// Consecutive sampling failures before the monitor reports itself degraded
const DEGRADED_FAILURE_COUNT: u32 = 3;

/// Warning/critical threshold pair for one resource kind, in percent
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ThresholdConfig {
    pub warning: f64,
    pub critical: f64,
}

impl ThresholdConfig {
    pub fn new(warning: f64, critical: f64) -> Self {
        Self { warning, critical }
    }

    fn validate(&self, kind: ResourceKind) -> Result<(), ConfigurationError> {
        let ordered = self.warning > 0.0 && self.warning < self.critical && self.critical <= 100.0;
        if !ordered {
            return Err(ConfigurationError::InvalidThreshold {
                kind,
                warning: self.warning,
                critical: self.critical,
            });
        }
        Ok(())
    }
}

/// Threshold pairs for every resource kind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorThresholds {
    pub cpu: ThresholdConfig,
    pub memory: ThresholdConfig,
    pub disk: ThresholdConfig,
    pub network: ThresholdConfig,
}

impl MonitorThresholds {
    pub fn get(&self, kind: ResourceKind) -> &ThresholdConfig {
        match kind {
            ResourceKind::Cpu => &self.cpu,
            ResourceKind::Memory => &self.memory,
            ResourceKind::Disk => &self.disk,
            ResourceKind::Network => &self.network,
        }
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        for kind in ResourceKind::ALL {
            self.get(kind).validate(kind)?;
        }
        Ok(())
    }
}

impl Default for MonitorThresholds {
    fn default() -> Self {
        Self {
            cpu: ThresholdConfig::new(70.0, 90.0),
            memory: ThresholdConfig::new(75.0, 90.0),
            disk: ThresholdConfig::new(80.0, 95.0),
            network: ThresholdConfig::new(70.0, 90.0),
        }
    }
}

/// Configuration for the resource monitor
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,
    pub enabled: bool,
    pub thresholds: MonitorThresholds,
    /// Capacity of the sample history buffer
    pub history_samples: usize,
    pub include_process_metrics: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            enabled: true,
            thresholds: MonitorThresholds::default(),
            history_samples: DEFAULT_HISTORY_SAMPLES,
            include_process_metrics: true,
        }
    }
}

impl MonitorConfig {
    fn validate(&self) -> Result<(), ConfigurationError> {
        if self.interval.is_zero() {
            return Err(ConfigurationError::ZeroInterval);
        }
        if self.history_samples == 0 {
            return Err(ConfigurationError::InvalidHistoryCapacity(0));
        }
        self.thresholds.validate()
    }
}

/// Alert raised by the monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorAlert {
    /// A sampled value crossed into warning or critical territory
    Threshold(ResourceAlert),
    /// Sampling itself has failed repeatedly
    Degraded {
        consecutive_failures: u32,
        timestamp: i64,
    },
}

/// Receives monitor alerts in sample order
///
/// Handlers run on the sampling task and must not block.
pub trait AlertHandler: Send + Sync {
    fn handle(&self, alert: &MonitorAlert);
}

/// Receives every successful sample, e.g. to update gauges
pub trait SampleExporter: Send + Sync {
    fn export(&self, sample: &ResourceSample);
}

struct MonitorTask {
    shutdown: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// Periodic platform monitor with bounded history
pub struct ResourceMonitor {
    config: MonitorConfig,
    sampler: Arc<dyn PlatformSampler>,
    history: Arc<RwLock<HistoryBuffer<ResourceSample>>>,
    handlers: Vec<Arc<dyn AlertHandler>>,
    exporters: Vec<Arc<dyn SampleExporter>>,
    metrics: ManagerMetrics,
    task: Mutex<Option<MonitorTask>>,
}

/// Mutable alerting state owned by the sampling loop
#[derive(Default)]
struct TickState {
    prev_levels: BTreeMap<ResourceKind, Option<AlertLevel>>,
    consecutive_failures: u32,
    degraded_alerted: bool,
}

impl ResourceMonitor {
    pub fn new(
        config: MonitorConfig,
        sampler: Arc<dyn PlatformSampler>,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let history = HistoryBuffer::new(config.history_samples)?;

        Ok(Self {
            config,
            sampler,
            history: Arc::new(RwLock::new(history)),
            handlers: Vec::new(),
            exporters: Vec::new(),
            metrics: ManagerMetrics::new(),
            task: Mutex::new(None),
        })
    }

    /// Register an alert handler; must happen before `start()`
    pub fn register_alert_handler(&mut self, handler: Arc<dyn AlertHandler>) {
        self.handlers.push(handler);
    }

    /// Register a sample exporter; must happen before `start()`
    pub fn register_exporter(&mut self, exporter: Arc<dyn SampleExporter>) {
        self.exporters.push(exporter);
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Shared handle to the sample history
    pub fn history(&self) -> Arc<RwLock<HistoryBuffer<ResourceSample>>> {
        Arc::clone(&self.history)
    }

    pub async fn latest_sample(&self) -> Option<ResourceSample> {
        self.history.read().await.latest().cloned()
    }

    /// Last `limit` non-gap points for one resource kind, oldest first
    pub async fn series(&self, kind: ResourceKind, limit: usize) -> Vec<(i64, f64)> {
        let history = self.history.read().await;
        let mut points: Vec<(i64, f64)> = history
            .iter()
            .rev()
            .filter(|s| !s.gap)
            .take(limit)
            .map(|s| (s.timestamp, s.utilization(kind)))
            .collect();
        points.reverse();
        points
    }

    pub async fn is_running(&self) -> bool {
        self.task.lock().await.is_some()
    }

    /// Begin periodic sampling; a second call while running is a no-op
    pub async fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            info!("Resource monitor disabled by configuration");
            return;
        }

        let mut task = self.task.lock().await;
        if task.is_some() {
            debug!("Resource monitor already running");
            return;
        }

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            monitor.run(shutdown_rx).await;
        });

        *task = Some(MonitorTask {
            shutdown: shutdown_tx,
            handle,
        });
    }

    /// Stop sampling; the in-flight tick completes first. Idempotent.
    pub async fn stop(&self) {
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            let _ = task.shutdown.send(());
            let _ = task.handle.await;
            info!("Resource monitor stopped");
        }
    }

    async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            history_samples = self.config.history_samples,
            "Starting resource monitor"
        );

        let mut ticker = interval(self.config.interval);
        let mut state = TickState::default();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick(&mut state).await;
                }
                _ = shutdown.recv() => {
                    debug!("Resource monitor loop shutting down");
                    break;
                }
            }
        }
    }

    /// One sampling cycle: sample, record, evaluate thresholds
    async fn tick(&self, state: &mut TickState) {
        let start = Instant::now();
        let result = self
            .sampler
            .sample(self.config.include_process_metrics)
            .await;
        self.metrics
            .observe_sample_latency(start.elapsed().as_secs_f64());

        match result {
            Ok(sample) => self.ingest(state, sample).await,
            Err(e) => self.record_failure(state, &e).await,
        }
    }

    async fn ingest(&self, state: &mut TickState, sample: ResourceSample) {
        if state.consecutive_failures > 0 {
            info!(
                failures = state.consecutive_failures,
                "Sampling recovered after failures"
            );
        }
        state.consecutive_failures = 0;
        state.degraded_alerted = false;

        self.history.write().await.push(sample.clone());
        self.metrics.inc_samples();

        for exporter in &self.exporters {
            exporter.export(&sample);
        }

        for alert in self.evaluate_thresholds(state, &sample) {
            self.deliver(MonitorAlert::Threshold(alert));
        }
    }

    /// Compare each kind against its thresholds and fire on upward edges only
    fn evaluate_thresholds(
        &self,
        state: &mut TickState,
        sample: &ResourceSample,
    ) -> Vec<ResourceAlert> {
        let mut alerts = Vec::new();

        for kind in ResourceKind::ALL {
            let value = sample.utilization(kind);
            let level = classify(value, self.config.thresholds.get(kind));
            let prev = state.prev_levels.entry(kind).or_insert(None);

            let escalated = match (*prev, level) {
                (None, Some(next)) => Some(next),
                (Some(p), Some(next)) if next > p => Some(next),
                _ => None,
            };

            if let Some(level) = escalated {
                warn!(
                    kind = %kind,
                    level = %level,
                    value = value,
                    "Resource threshold breached"
                );
                alerts.push(ResourceAlert {
                    kind,
                    level,
                    value,
                    timestamp: sample.timestamp,
                });
            }

            // Dropping below the warning threshold re-arms the alert
            *prev = level;
        }

        alerts
    }

    async fn record_failure(&self, state: &mut TickState, error: &SampleError) {
        state.consecutive_failures += 1;
        self.metrics.inc_sample_failures();
        warn!(
            error = %error,
            consecutive = state.consecutive_failures,
            "Platform sample failed"
        );

        // Re-post the previous sample as a gap marker so history stays dense
        let mut history = self.history.write().await;
        if let Some(previous) = history.latest().cloned() {
            history.push(ResourceSample {
                timestamp: chrono::Utc::now().timestamp(),
                gap: true,
                ..previous
            });
        }
        drop(history);

        if state.consecutive_failures >= DEGRADED_FAILURE_COUNT && !state.degraded_alerted {
            state.degraded_alerted = true;
            self.deliver(MonitorAlert::Degraded {
                consecutive_failures: state.consecutive_failures,
                timestamp: chrono::Utc::now().timestamp(),
            });
        }
    }

    fn deliver(&self, alert: MonitorAlert) {
        if let MonitorAlert::Threshold(ref a) = alert {
            self.metrics.inc_threshold_alerts(a.level);
        }
        for handler in &self.handlers {
            handler.handle(&alert);
        }
    }
}

/// Map a value to the highest threshold it exceeds, or None below warning
fn classify(value: f64, thresholds: &ThresholdConfig) -> Option<AlertLevel> {
    if value >= thresholds.critical {
        Some(AlertLevel::Critical)
    } else if value >= thresholds.warning {
        Some(AlertLevel::Warning)
    } else {
        None
    }
}
