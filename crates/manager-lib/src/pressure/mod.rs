//! Pressure detection and response
//!
//! Classifies the monitor's sample history into discrete pressure levels per
//! resource kind, publishes a transition event on every level change, and
//! runs registered response actions on upward transitions. An optional
//! forecasting model surfaces predicted escalations ahead of time; a
//! high-confidence forecast of High or Critical runs the same actions. The
//! transition event is always on the wire before any action executes.

pub mod prediction;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use self::prediction::{model_for, PredictionModel};
use crate::error::ConfigurationError;
use crate::history::HistoryBuffer;
use crate::models::{PressureLevel, ResourceKind, ResourceSample};
use crate::observability::ManagerMetrics;

/// Default cadence between evaluations of the sample history
const DEFAULT_EVALUATION_INTERVAL: Duration = Duration::from_secs(10);

/// Default samples considered when fitting a forecast
const DEFAULT_TREND_WINDOW: usize = 12;

/// Escalation boundaries for one resource kind, in utilization percent
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LevelThresholds {
    pub moderate: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for LevelThresholds {
    fn default() -> Self {
        Self {
            moderate: 70.0,
            high: 85.0,
            critical: 95.0,
        }
    }
}

impl LevelThresholds {
    pub fn new(moderate: f64, high: f64, critical: f64) -> Self {
        Self {
            moderate,
            high,
            critical,
        }
    }

    fn validate(&self, kind: ResourceKind) -> Result<(), ConfigurationError> {
        let ordered = 0.0 < self.moderate
            && self.moderate < self.high
            && self.high < self.critical
            && self.critical <= 100.0;
        if !ordered {
            return Err(ConfigurationError::InvalidPressureThresholds { kind });
        }
        Ok(())
    }

    /// Map a utilization percentage onto a pressure level
    pub fn classify(&self, value_pct: f64) -> PressureLevel {
        if value_pct >= self.critical {
            PressureLevel::Critical
        } else if value_pct >= self.high {
            PressureLevel::High
        } else if value_pct >= self.moderate {
            PressureLevel::Moderate
        } else {
            PressureLevel::Normal
        }
    }
}

/// Per-kind escalation boundaries
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PressureThresholds {
    pub cpu: LevelThresholds,
    pub memory: LevelThresholds,
    pub disk: LevelThresholds,
    pub network: LevelThresholds,
}

impl PressureThresholds {
    pub fn get(&self, kind: ResourceKind) -> &LevelThresholds {
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

/// Forecasting knobs; disabled by default
#[derive(Debug, Clone)]
pub struct PredictionConfig {
    pub enabled: bool,
    /// How far ahead to forecast
    pub horizon: Duration,
    /// Registered model name, e.g. "linear" or "moving-average"
    pub model: String,
    /// Minimum spacing between forecast passes
    pub update_interval: Duration,
    /// Forecasts below this confidence are discarded
    pub min_confidence: f64,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            horizon: Duration::from_secs(300),
            model: "linear".to_string(),
            update_interval: Duration::from_secs(60),
            min_confidence: 0.6,
        }
    }
}

impl PredictionConfig {
    fn validate(&self) -> Result<(), ConfigurationError> {
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(ConfigurationError::InvalidConfidenceFloor(
                self.min_confidence,
            ));
        }
        if self.enabled && self.horizon.is_zero() {
            return Err(ConfigurationError::ZeroInterval);
        }
        Ok(())
    }
}

/// Configuration for the pressure detector
#[derive(Debug, Clone)]
pub struct PressureConfig {
    pub enabled: bool,
    pub thresholds: PressureThresholds,
    /// Recent non-gap samples considered when fitting a forecast
    pub trend_window: usize,
    pub evaluation_interval: Duration,
    pub prediction: PredictionConfig,
}

impl Default for PressureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            thresholds: PressureThresholds::default(),
            trend_window: DEFAULT_TREND_WINDOW,
            evaluation_interval: DEFAULT_EVALUATION_INTERVAL,
            prediction: PredictionConfig::default(),
        }
    }
}

impl PressureConfig {
    fn validate(&self) -> Result<(), ConfigurationError> {
        self.thresholds.validate()?;
        if self.trend_window == 0 {
            return Err(ConfigurationError::InvalidHistoryCapacity(0));
        }
        if self.evaluation_interval.is_zero() {
            return Err(ConfigurationError::ZeroInterval);
        }
        self.prediction.validate()
    }
}

/// One pressure level change, observed or forecast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PressureTransition {
    pub kind: ResourceKind,
    pub from: PressureLevel,
    pub to: PressureLevel,
    /// Observed utilization, or the forecast value for predicted transitions
    pub value_pct: f64,
    pub timestamp: i64,
    /// True when this comes from a forecast rather than an observation
    pub predicted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// Mitigation hook run on upward transitions
///
/// Actions run in registration order after the transition event has been
/// published; a failing action is logged and never stops the others.
/// High-confidence forecasts of High or Critical dispatch the same way,
/// with `predicted` set on the transition they carry.
#[async_trait]
pub trait ResponseAction: Send + Sync {
    fn name(&self) -> &'static str;

    /// Lowest level at which this action engages
    fn engages_at(&self) -> PressureLevel;

    async fn execute(&self, transition: &PressureTransition) -> anyhow::Result<()>;
}

/// Mutable detection state owned by the evaluation path
struct DetectorState {
    levels: BTreeMap<ResourceKind, PressureLevel>,
    last_forecast: Option<Instant>,
    /// Last predicted level published per kind, for deduplication
    forecast_levels: BTreeMap<ResourceKind, PressureLevel>,
}

impl DetectorState {
    fn new() -> Self {
        Self {
            levels: BTreeMap::new(),
            last_forecast: None,
            forecast_levels: BTreeMap::new(),
        }
    }

    fn should_forecast(&self, update_interval: Duration) -> bool {
        match self.last_forecast {
            None => true,
            Some(last) => last.elapsed() >= update_interval,
        }
    }
}

struct DetectorTask {
    shutdown: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// Edge-triggered pressure detector over the shared sample history
pub struct PressureDetector {
    config: PressureConfig,
    history: Arc<RwLock<HistoryBuffer<ResourceSample>>>,
    model: Option<Box<dyn PredictionModel>>,
    actions: Vec<Arc<dyn ResponseAction>>,
    transitions_tx: mpsc::UnboundedSender<PressureTransition>,
    state: Mutex<DetectorState>,
    metrics: ManagerMetrics,
    task: Mutex<Option<DetectorTask>>,
}

impl PressureDetector {
    /// Create a detector reading from the given sample history
    ///
    /// Resolves the configured forecasting model from the built-in registry
    /// when prediction is enabled.
    pub fn new(
        config: PressureConfig,
        history: Arc<RwLock<HistoryBuffer<ResourceSample>>>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PressureTransition>), ConfigurationError> {
        let model = if config.prediction.enabled {
            let name = config.prediction.model.as_str();
            Some(
                model_for(name)
                    .ok_or_else(|| ConfigurationError::UnregisteredModel(name.to_string()))?,
            )
        } else {
            None
        };
        Self::with_model(config, history, model)
    }

    /// Create a detector with a caller-provided forecasting model
    pub fn with_model(
        config: PressureConfig,
        history: Arc<RwLock<HistoryBuffer<ResourceSample>>>,
        model: Option<Box<dyn PredictionModel>>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PressureTransition>), ConfigurationError> {
        config.validate()?;
        let (transitions_tx, transitions_rx) = mpsc::unbounded_channel();

        Ok((
            Self {
                config,
                history,
                model,
                actions: Vec::new(),
                transitions_tx,
                state: Mutex::new(DetectorState::new()),
                metrics: ManagerMetrics::new(),
                task: Mutex::new(None),
            },
            transitions_rx,
        ))
    }

    /// Register a response action; must happen before `start()`
    pub fn register_action(&mut self, action: Arc<dyn ResponseAction>) {
        self.actions.push(action);
    }

    pub fn config(&self) -> &PressureConfig {
        &self.config
    }

    pub async fn current_levels(&self) -> BTreeMap<ResourceKind, PressureLevel> {
        let state = self.state.lock().await;
        ResourceKind::ALL
            .into_iter()
            .map(|kind| {
                (
                    kind,
                    state.levels.get(&kind).copied().unwrap_or(PressureLevel::Normal),
                )
            })
            .collect()
    }

    pub async fn level_of(&self, kind: ResourceKind) -> PressureLevel {
        let state = self.state.lock().await;
        state.levels.get(&kind).copied().unwrap_or(PressureLevel::Normal)
    }

    pub async fn is_running(&self) -> bool {
        self.task.lock().await.is_some()
    }

    /// Begin periodic evaluation; a second call while running is a no-op
    pub async fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            info!("Pressure detection disabled by configuration");
            return;
        }

        let mut task = self.task.lock().await;
        if task.is_some() {
            debug!("Pressure detector already running");
            return;
        }

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let detector = Arc::clone(self);
        let handle = tokio::spawn(async move {
            detector.run(shutdown_rx).await;
        });

        *task = Some(DetectorTask {
            shutdown: shutdown_tx,
            handle,
        });
    }

    /// Stop evaluating; the in-flight pass completes first. Idempotent.
    pub async fn stop(&self) {
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            let _ = task.shutdown.send(());
            let _ = task.handle.await;
            info!("Pressure detector stopped");
        }
    }

    async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.evaluation_interval.as_secs(),
            prediction = self.model.is_some(),
            "Starting pressure detector"
        );

        let mut ticker = interval(self.config.evaluation_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.evaluate_once().await;
                }
                _ = shutdown.recv() => {
                    debug!("Pressure detector loop shutting down");
                    break;
                }
            }
        }
    }

    /// One evaluation pass over the latest observation plus forecasts
    pub async fn evaluate_once(&self) {
        let (latest, series) = self.snapshot_history().await;
        let Some(sample) = latest else {
            return;
        };

        let mut state = self.state.lock().await;
        let mut escalations = Vec::new();

        for kind in ResourceKind::ALL {
            let value = sample.utilization(kind);
            let level = self.config.thresholds.get(kind).classify(value);
            self.metrics.set_pressure_level(kind, level);

            let prev = state
                .levels
                .get(&kind)
                .copied()
                .unwrap_or(PressureLevel::Normal);
            if level == prev {
                continue;
            }
            state.levels.insert(kind, level);
            // An observation supersedes any outstanding forecast for the kind
            state.forecast_levels.remove(&kind);

            let transition = PressureTransition {
                kind,
                from: prev,
                to: level,
                value_pct: value,
                timestamp: sample.timestamp,
                predicted: false,
                confidence: None,
            };
            self.metrics.inc_pressure_transitions(kind);
            if level >= PressureLevel::High {
                warn!(
                    kind = %kind,
                    from = %prev,
                    to = %level,
                    value_pct = value,
                    "Pressure level changed"
                );
            } else {
                info!(
                    kind = %kind,
                    from = %prev,
                    to = %level,
                    value_pct = value,
                    "Pressure level changed"
                );
            }
            // The event goes out before any mitigation below runs
            let _ = self.transitions_tx.send(transition.clone());
            if level > prev {
                escalations.push(transition);
            }
        }

        if self.model.is_some()
            && state.should_forecast(self.config.prediction.update_interval)
        {
            state.last_forecast = Some(Instant::now());
            escalations.extend(self.forecast(&mut state, &series, sample.timestamp));
        }
        drop(state);

        for transition in escalations {
            self.dispatch_actions(&transition).await;
        }
    }

    /// Publish forecast escalations above the current level, deduplicated
    ///
    /// Returns the predicted transitions reaching High or Critical; those
    /// run response actions the same way observed escalations do.
    fn forecast(
        &self,
        state: &mut DetectorState,
        series: &BTreeMap<ResourceKind, Vec<(i64, f64)>>,
        timestamp: i64,
    ) -> Vec<PressureTransition> {
        let mut actionable = Vec::new();
        let model = match &self.model {
            Some(model) => model,
            None => return actionable,
        };
        let horizon = self.config.prediction.horizon.as_secs();

        for kind in ResourceKind::ALL {
            let points = match series.get(&kind) {
                Some(points) => points,
                None => continue,
            };
            let Some(forecast) = model.forecast(points, horizon) else {
                continue;
            };
            if forecast.confidence < self.config.prediction.min_confidence {
                continue;
            }

            let current = state
                .levels
                .get(&kind)
                .copied()
                .unwrap_or(PressureLevel::Normal);
            let predicted = self.config.thresholds.get(kind).classify(forecast.value_pct);
            if predicted <= current {
                continue;
            }
            if state.forecast_levels.get(&kind) == Some(&predicted) {
                continue;
            }
            state.forecast_levels.insert(kind, predicted);

            info!(
                kind = %kind,
                level = %predicted,
                value_pct = forecast.value_pct,
                confidence = forecast.confidence,
                horizon_secs = horizon,
                model = model.name(),
                "Forecast pressure escalation"
            );
            self.metrics.inc_predictions();
            let transition = PressureTransition {
                kind,
                from: current,
                to: predicted,
                value_pct: forecast.value_pct,
                timestamp,
                predicted: true,
                confidence: Some(forecast.confidence),
            };
            // The event goes out first; severe forecasts then mitigate
            let _ = self.transitions_tx.send(transition.clone());
            if predicted >= PressureLevel::High {
                actionable.push(transition);
            }
        }
        actionable
    }

    async fn dispatch_actions(&self, transition: &PressureTransition) {
        for action in &self.actions {
            if action.engages_at() > transition.to {
                continue;
            }
            match action.execute(transition).await {
                Ok(()) => debug!(
                    action = action.name(),
                    kind = %transition.kind,
                    level = %transition.to,
                    "Pressure response action executed"
                ),
                Err(error) => warn!(
                    action = action.name(),
                    kind = %transition.kind,
                    level = %transition.to,
                    error = %error,
                    "Pressure response action failed"
                ),
            }
        }
    }

    /// Latest non-gap sample plus the recent non-gap series per kind
    async fn snapshot_history(
        &self,
    ) -> (
        Option<ResourceSample>,
        BTreeMap<ResourceKind, Vec<(i64, f64)>>,
    ) {
        let history = self.history.read().await;
        let latest = history.iter().rev().find(|s| !s.gap).cloned();

        let mut series = BTreeMap::new();
        if latest.is_some() {
            for kind in ResourceKind::ALL {
                let mut points: Vec<(i64, f64)> = history
                    .iter()
                    .rev()
                    .filter(|s| !s.gap)
                    .take(self.config.trend_window)
                    .map(|s| (s.timestamp, s.utilization(kind)))
                    .collect();
                points.reverse();
                series.insert(kind, points);
            }
        }
        (latest, series)
    }
}
