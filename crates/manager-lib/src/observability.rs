//! Observability infrastructure for the resource manager
//!
//! Provides:
//! - Prometheus metrics (sample latency, allocation decisions, pressure levels)
//! - Structured JSON logging with tracing

use prometheus::{
    register_gauge_vec, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge, register_int_gauge_vec, GaugeVec, Histogram, IntCounter, IntCounterVec,
    IntGauge, IntGaugeVec,
};
use std::sync::OnceLock;
use tracing::{info, warn};

use crate::models::{AlertLevel, PressureLevel, ResourceKind};
use crate::monitor::SampleExporter;

/// Default histogram buckets for latency measurements (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ManagerMetricsInner> = OnceLock::new();

/// Inner metrics structure that holds the actual Prometheus metrics
struct ManagerMetricsInner {
    sample_latency_seconds: Histogram,
    samples_total: IntCounter,
    sample_failures_total: IntCounter,
    threshold_alerts_total: IntCounterVec,
    utilization_percent: GaugeVec,
    allocation_decisions_total: IntCounterVec,
    allocated_units: GaugeVec,
    pending_requests: IntGauge,
    reclaimed_allocations_total: IntCounter,
    pressure_level: IntGaugeVec,
    pressure_transitions_total: IntCounterVec,
    predictions_total: IntCounter,
    qos_violations_total: IntCounter,
    agents_registered: IntGauge,
    agent_health_score: GaugeVec,
}

impl ManagerMetricsInner {
    fn new() -> Self {
        Self {
            sample_latency_seconds: register_histogram!(
                "resource_manager_sample_latency_seconds",
                "Time spent taking one platform utilization sample",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register sample_latency_seconds"),

            samples_total: register_int_counter!(
                "resource_manager_samples_total",
                "Total number of successful platform samples"
            )
            .expect("Failed to register samples_total"),

            sample_failures_total: register_int_counter!(
                "resource_manager_sample_failures_total",
                "Total number of failed platform samples"
            )
            .expect("Failed to register sample_failures_total"),

            threshold_alerts_total: register_int_counter_vec!(
                "resource_manager_threshold_alerts_total",
                "Threshold alerts emitted, by severity",
                &["level"]
            )
            .expect("Failed to register threshold_alerts_total"),

            utilization_percent: register_gauge_vec!(
                "resource_manager_utilization_percent",
                "Latest sampled utilization per resource kind",
                &["kind"]
            )
            .expect("Failed to register utilization_percent"),

            allocation_decisions_total: register_int_counter_vec!(
                "resource_manager_allocation_decisions_total",
                "Allocation decisions, by outcome",
                &["action"]
            )
            .expect("Failed to register allocation_decisions_total"),

            allocated_units: register_gauge_vec!(
                "resource_manager_allocated_units",
                "Units currently granted per resource kind",
                &["kind"]
            )
            .expect("Failed to register allocated_units"),

            pending_requests: register_int_gauge!(
                "resource_manager_pending_requests",
                "Allocation requests parked for later promotion"
            )
            .expect("Failed to register pending_requests"),

            reclaimed_allocations_total: register_int_counter!(
                "resource_manager_reclaimed_allocations_total",
                "Allocations force-released by the reclaim sweep"
            )
            .expect("Failed to register reclaimed_allocations_total"),

            pressure_level: register_int_gauge_vec!(
                "resource_manager_pressure_level",
                "Current pressure level per resource kind (0=normal .. 3=critical)",
                &["kind"]
            )
            .expect("Failed to register pressure_level"),

            pressure_transitions_total: register_int_counter_vec!(
                "resource_manager_pressure_transitions_total",
                "Pressure level transitions per resource kind",
                &["kind"]
            )
            .expect("Failed to register pressure_transitions_total"),

            predictions_total: register_int_counter!(
                "resource_manager_predictions_total",
                "Pressure predictions computed"
            )
            .expect("Failed to register predictions_total"),

            qos_violations_total: register_int_counter!(
                "resource_manager_qos_violations_total",
                "Operations aborted because they would breach a QoS floor"
            )
            .expect("Failed to register qos_violations_total"),

            agents_registered: register_int_gauge!(
                "resource_manager_agents_registered",
                "Agent resource managers currently registered"
            )
            .expect("Failed to register agents_registered"),

            agent_health_score: register_gauge_vec!(
                "resource_manager_agent_health_score",
                "Smoothed health score per agent",
                &["agent_id"]
            )
            .expect("Failed to register agent_health_score"),
        }
    }
}

/// Manager metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct ManagerMetrics {
    // This is just a marker - we use the global instance
    _private: (),
}

impl Default for ManagerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagerMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ManagerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ManagerMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    /// Record one sampling latency observation
    pub fn observe_sample_latency(&self, duration_secs: f64) {
        self.inner().sample_latency_seconds.observe(duration_secs);
    }

    pub fn inc_samples(&self) {
        self.inner().samples_total.inc();
    }

    pub fn inc_sample_failures(&self) {
        self.inner().sample_failures_total.inc();
    }

    pub fn inc_threshold_alerts(&self, level: AlertLevel) {
        self.inner()
            .threshold_alerts_total
            .with_label_values(&[level.as_str()])
            .inc();
    }

    pub fn set_utilization(&self, kind: ResourceKind, percent: f64) {
        self.inner()
            .utilization_percent
            .with_label_values(&[kind.as_str()])
            .set(percent);
    }

    /// Count one allocation decision by outcome label
    pub fn inc_allocation_decision(&self, action: &str) {
        self.inner()
            .allocation_decisions_total
            .with_label_values(&[action])
            .inc();
    }

    pub fn set_allocated_units(&self, kind: ResourceKind, units: f64) {
        self.inner()
            .allocated_units
            .with_label_values(&[kind.as_str()])
            .set(units);
    }

    pub fn set_pending_requests(&self, count: i64) {
        self.inner().pending_requests.set(count);
    }

    pub fn inc_reclaimed(&self) {
        self.inner().reclaimed_allocations_total.inc();
    }

    pub fn set_pressure_level(&self, kind: ResourceKind, level: PressureLevel) {
        self.inner()
            .pressure_level
            .with_label_values(&[kind.as_str()])
            .set(level.as_gauge());
    }

    pub fn inc_pressure_transitions(&self, kind: ResourceKind) {
        self.inner()
            .pressure_transitions_total
            .with_label_values(&[kind.as_str()])
            .inc();
    }

    pub fn inc_predictions(&self) {
        self.inner().predictions_total.inc();
    }

    pub fn inc_qos_violations(&self) {
        self.inner().qos_violations_total.inc();
    }

    pub fn set_agents_registered(&self, count: i64) {
        self.inner().agents_registered.set(count);
    }

    pub fn set_agent_health(&self, agent_id: &str, score: f64) {
        self.inner()
            .agent_health_score
            .with_label_values(&[agent_id])
            .set(score);
    }
}

/// Sample exporter that publishes utilization gauges
pub struct PrometheusSampleExporter {
    metrics: ManagerMetrics,
}

impl PrometheusSampleExporter {
    pub fn new() -> Self {
        Self {
            metrics: ManagerMetrics::new(),
        }
    }
}

impl Default for PrometheusSampleExporter {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleExporter for PrometheusSampleExporter {
    fn export(&self, sample: &crate::models::ResourceSample) {
        for kind in ResourceKind::ALL {
            self.metrics.set_utilization(kind, sample.utilization(kind));
        }
    }
}

/// Structured logger for manager events
///
/// Provides consistent JSON-formatted logging for allocations, pressure
/// transitions, and other significant events.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    /// Log a threshold alert
    pub fn log_alert(&self, kind: ResourceKind, level: AlertLevel, value: f64) {
        match level {
            AlertLevel::Critical => {
                warn!(
                    event = "threshold_alert",
                    instance = %self.instance,
                    kind = %kind,
                    level = %level,
                    value = value,
                    "Critical resource threshold breached"
                );
            }
            AlertLevel::Warning => {
                info!(
                    event = "threshold_alert",
                    instance = %self.instance,
                    kind = %kind,
                    level = %level,
                    value = value,
                    "Resource threshold breached"
                );
            }
        }
    }

    /// Log repeated sampling failure
    pub fn log_monitor_degraded(&self, consecutive_failures: u32) {
        warn!(
            event = "monitor_degraded",
            instance = %self.instance,
            consecutive_failures = consecutive_failures,
            "Monitor degraded after repeated sampling failures"
        );
    }

    /// Log an allocation decision event
    pub fn log_allocation(&self, agent_id: &str, action: &str, detail: &str) {
        info!(
            event = "allocation",
            instance = %self.instance,
            agent_id = %agent_id,
            action = %action,
            detail = %detail,
            "Allocation event"
        );
    }

    /// Log an idle allocation entering its reclaim grace period
    pub fn log_reclaim(&self, allocation_id: &str, agent_id: &str, idle_secs: i64) {
        info!(
            event = "allocation_reclaimed",
            instance = %self.instance,
            allocation_id = %allocation_id,
            agent_id = %agent_id,
            idle_secs = idle_secs,
            "Idle allocation reclaimed"
        );
    }

    /// Log a pressure level transition
    pub fn log_pressure_transition(
        &self,
        kind: ResourceKind,
        from: PressureLevel,
        to: PressureLevel,
    ) {
        if to >= PressureLevel::High {
            warn!(
                event = "pressure_transition",
                instance = %self.instance,
                kind = %kind,
                from = %from,
                to = %to,
                "Resource pressure escalated"
            );
        } else {
            info!(
                event = "pressure_transition",
                instance = %self.instance,
                kind = %kind,
                from = %from,
                to = %to,
                "Resource pressure changed"
            );
        }
    }

    /// Log an agent lifecycle transition
    pub fn log_agent_state(&self, agent_id: &str, from: &str, to: &str) {
        info!(
            event = "agent_state",
            instance = %self.instance,
            agent_id = %agent_id,
            from = %from,
            to = %to,
            "Agent state changed"
        );
    }

    /// Log an agent failing its health floor
    pub fn log_agent_unhealthy(&self, agent_id: &str, score: f64, floor: f64) {
        warn!(
            event = "agent_unhealthy",
            instance = %self.instance,
            agent_id = %agent_id,
            score = score,
            floor = floor,
            "Agent health dropped below floor, releasing resources"
        );
    }

    /// Log manager startup
    pub fn log_startup(&self, version: &str) {
        info!(
            event = "manager_started",
            instance = %self.instance,
            version = %version,
            "Resource manager started"
        );
    }

    /// Log manager shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "manager_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Resource manager shutting down"
        );
    }

    /// Log a state snapshot save
    pub fn log_state_saved(&self, path: &str, allocations: usize) {
        info!(
            event = "state_saved",
            instance = %self.instance,
            path = %path,
            allocations = allocations,
            "State snapshot written"
        );
    }

    /// Log a state snapshot restore
    pub fn log_state_loaded(&self, allocations: usize, agents: usize) {
        info!(
            event = "state_loaded",
            instance = %self.instance,
            allocations = allocations,
            agents = agents,
            "State snapshot restored"
        );
    }
}
