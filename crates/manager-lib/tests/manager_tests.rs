//! Integration tests for the orchestrated resource manager
//!
//! These drive the public API end to end: agents allocating from a shared
//! pool, pressure fanning out to throttles, and snapshots moving whole
//! manager states between instances.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use manager_lib::agent::AgentState;
use manager_lib::alloc::{AllocatorConfig, ReclaimConfig};
use manager_lib::error::{AllocError, LifecycleError, SampleError};
use manager_lib::health::ComponentStatus;
use manager_lib::manager::ResourceManager;
use manager_lib::models::{
    AgentResourceProfile, HealthPolicy, PressureLevel, ResourceKind, ResourceSample,
    ResourceUnits, ScalingPolicy, StrategyKind,
};
use manager_lib::monitor::{MonitorConfig, PlatformSampler};
use manager_lib::pressure::{PressureConfig, PressureTransition, ResponseAction};

/// Sampler reporting a nearly idle host on every tick
struct IdleSampler;

#[async_trait]
impl PlatformSampler for IdleSampler {
    async fn sample(&self, _include_process: bool) -> Result<ResourceSample, SampleError> {
        Ok(ResourceSample {
            timestamp: chrono::Utc::now().timestamp(),
            cpu_pct: 5.0,
            memory_pct: 5.0,
            disk_pct: 5.0,
            network_pct: 5.0,
            process: None,
            gap: false,
        })
    }
}

fn pool(max_memory_mb: f64) -> AllocatorConfig {
    AllocatorConfig {
        strategy: StrategyKind::Priority,
        max_cpu_cores: 32.0,
        max_memory_mb,
        max_disk_mb: 100_000.0,
        max_network_mbps: 1_000.0,
        over_provisioning_factor: 1.0,
        allow_sharing: false,
        minimum_units: [
            (ResourceKind::Cpu, 0.1),
            (ResourceKind::Memory, 128.0),
            (ResourceKind::Disk, 256.0),
            (ResourceKind::Network, 10.0),
        ]
        .into_iter()
        .collect(),
        reclaim: ReclaimConfig {
            enabled: false,
            ..ReclaimConfig::default()
        },
    }
}

/// Manager whose timers are parked hours out, driven manually by tests
fn quiet_manager(pool: AllocatorConfig) -> Arc<ResourceManager> {
    Arc::new(
        ResourceManager::builder()
            .instance("scenario")
            .monitor_config(MonitorConfig {
                interval: Duration::from_secs(3600),
                ..MonitorConfig::default()
            })
            .pressure_config(PressureConfig {
                evaluation_interval: Duration::from_secs(3600),
                ..PressureConfig::default()
            })
            .allocator_config(pool)
            .sampler(Arc::new(IdleSampler))
            .build()
            .unwrap(),
    )
}

fn profile(
    agent_id: &str,
    required: ResourceUnits,
    qos_floor: ResourceUnits,
    priority: u8,
) -> AgentResourceProfile {
    AgentResourceProfile {
        agent_id: agent_id.to_string(),
        required,
        qos_floor,
        priority,
        scaling: ScalingPolicy {
            enabled: false,
            ..ScalingPolicy::default()
        },
        health: HealthPolicy {
            floor: 0.0,
            interval_secs: 3600,
        },
    }
}

fn memory_profile(agent_id: &str, memory_mb: f64, floor_mb: f64, priority: u8) -> AgentResourceProfile {
    let floor: ResourceUnits = if floor_mb > 0.0 {
        [(ResourceKind::Memory, floor_mb)].into_iter().collect()
    } else {
        ResourceUnits::new()
    };
    profile(
        agent_id,
        [(ResourceKind::Memory, memory_mb)].into_iter().collect(),
        floor,
        priority,
    )
}

fn memory_of(units: &ResourceUnits) -> f64 {
    units.get(&ResourceKind::Memory).copied().unwrap_or(0.0)
}

async fn push_memory(manager: &ResourceManager, timestamp: i64, memory_pct: f64) {
    manager.monitor().history().write().await.push(ResourceSample {
        timestamp,
        cpu_pct: 10.0,
        memory_pct,
        disk_pct: 10.0,
        network_pct: 10.0,
        process: None,
        gap: false,
    });
}

#[tokio::test]
async fn test_memory_pool_exhaustion_reports_shortfall() {
    let manager = quiet_manager(pool(4096.0));
    manager
        .create_agent_manager(memory_profile("svc-a", 1500.0, 0.0, 5))
        .unwrap()
        .initialize()
        .await
        .unwrap();
    manager
        .create_agent_manager(memory_profile("svc-b", 1500.0, 0.0, 5))
        .unwrap()
        .initialize()
        .await
        .unwrap();

    let starved = manager
        .create_agent_manager(memory_profile("svc-c", 1500.0, 0.0, 5))
        .unwrap();
    let denied = starved.initialize().await.unwrap_err();
    match denied {
        LifecycleError::InsufficientResources { agent_id, shortfall } => {
            assert_eq!(agent_id, "svc-c");
            // 4096 capacity minus two 1500 grants leaves 1096 free
            assert_eq!(shortfall.get(&ResourceKind::Memory).copied(), Some(404.0));
        }
        other => panic!("expected resource denial, got {other}"),
    }
    assert_eq!(starved.state().await, AgentState::Uninitialized);
    assert_eq!(
        memory_of(&manager.allocator().allocated_units().await),
        3000.0
    );

    // Freed capacity admits the retry
    manager.remove_agent_manager("svc-a").await.unwrap();
    starved.initialize().await.unwrap();
    assert_eq!(starved.state().await, AgentState::Ready);
}

/// Response action that records every transition it is invoked for
#[derive(Default)]
struct RecordingAction {
    seen: Mutex<Vec<(PressureLevel, PressureLevel)>>,
}

#[async_trait]
impl ResponseAction for RecordingAction {
    fn name(&self) -> &'static str {
        "record"
    }

    fn engages_at(&self) -> PressureLevel {
        PressureLevel::Moderate
    }

    async fn execute(&self, transition: &PressureTransition) -> anyhow::Result<()> {
        self.seen
            .lock()
            .unwrap()
            .push((transition.from, transition.to));
        Ok(())
    }
}

#[tokio::test]
async fn test_escalating_utilization_fires_one_transition_per_level() {
    let recorder = Arc::new(RecordingAction::default());
    let manager = Arc::new(
        ResourceManager::builder()
            .instance("escalation")
            .monitor_config(MonitorConfig {
                interval: Duration::from_secs(3600),
                ..MonitorConfig::default()
            })
            .pressure_config(PressureConfig {
                evaluation_interval: Duration::from_secs(3600),
                ..PressureConfig::default()
            })
            .allocator_config(pool(4096.0))
            .sampler(Arc::new(IdleSampler))
            .response_action(Arc::clone(&recorder) as Arc<dyn ResponseAction>)
            .build()
            .unwrap(),
    );

    // Default boundaries are 70/85/95: the walk crosses each exactly once
    for (timestamp, pct) in [(10, 60.0), (20, 72.0), (30, 90.0), (40, 97.0)] {
        push_memory(&manager, timestamp, pct).await;
        manager.detector().evaluate_once().await;
    }

    let seen = recorder.seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            (PressureLevel::Normal, PressureLevel::Moderate),
            (PressureLevel::Moderate, PressureLevel::High),
            (PressureLevel::High, PressureLevel::Critical),
        ]
    );
    assert_eq!(
        manager
            .detector()
            .current_levels()
            .await
            .get(&ResourceKind::Memory),
        Some(&PressureLevel::Critical)
    );
}

#[tokio::test]
async fn test_qos_floor_survives_critical_pressure() {
    let manager = quiet_manager(pool(4096.0));
    let pinned = manager
        .create_agent_manager(memory_profile("pinned", 512.0, 256.0, 5))
        .unwrap();
    let batch = manager
        .create_agent_manager(memory_profile("batch", 1024.0, 0.0, 3))
        .unwrap();
    pinned.initialize().await.unwrap();
    batch.initialize().await.unwrap();

    manager.start().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(pinned.state().await, AgentState::Active);
    assert_eq!(batch.state().await, AgentState::Active);

    push_memory(&manager, 10, 97.0).await;
    manager.detector().evaluate_once().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Both throttle hard, but the floored agent never drops below 256
    assert_eq!(pinned.state().await, AgentState::Throttled);
    assert_eq!(batch.state().await, AgentState::Throttled);
    assert_eq!(
        memory_of(&pinned.allocation().await.unwrap().resources),
        256.0
    );
    assert_eq!(
        memory_of(&batch.allocation().await.unwrap().resources),
        512.0
    );

    // Forcing a grant under its floor is a contract violation, not a shrink
    let id = pinned.allocation().await.unwrap().id;
    let err = manager
        .allocator()
        .resize(&id, [(ResourceKind::Memory, 128.0)].into_iter().collect())
        .await
        .unwrap_err();
    assert!(matches!(err, AllocError::QosViolation { .. }));
    assert_eq!(
        memory_of(&pinned.allocation().await.unwrap().resources),
        256.0
    );

    manager.stop().await;
}

#[tokio::test]
async fn test_snapshot_round_trip_preserves_totals_and_profiles() {
    let manager = quiet_manager(pool(4096.0));
    let web = manager
        .create_agent_manager(profile(
            "web",
            [(ResourceKind::Cpu, 2.0), (ResourceKind::Memory, 1024.0)]
                .into_iter()
                .collect(),
            [(ResourceKind::Memory, 256.0)].into_iter().collect(),
            7,
        ))
        .unwrap();
    let worker = manager
        .create_agent_manager(memory_profile("worker", 512.0, 0.0, 4))
        .unwrap();
    web.initialize().await.unwrap();
    web.start().await.unwrap();
    worker.initialize().await.unwrap();

    let snapshot = manager.export_state().await;
    let restored = quiet_manager(pool(4096.0));
    restored.import_state(snapshot).await.unwrap();

    assert_eq!(
        manager.allocator().allocated_units().await,
        restored.allocator().allocated_units().await
    );
    assert_eq!(
        restored.agent_ids(),
        vec!["web".to_string(), "worker".to_string()]
    );

    let web2 = restored.get_agent_manager("web").unwrap();
    assert_eq!(web2.profile(), web.profile());
    assert_eq!(web2.state().await, AgentState::Active);
    let worker2 = restored.get_agent_manager("worker").unwrap();
    assert_eq!(worker2.profile(), worker.profile());
    assert_eq!(worker2.state().await, AgentState::Ready);
}

#[tokio::test]
async fn test_running_stack_lifecycle() {
    let manager = Arc::new(
        ResourceManager::builder()
            .instance("lifecycle")
            .monitor_config(MonitorConfig {
                interval: Duration::from_millis(20),
                ..MonitorConfig::default()
            })
            .pressure_config(PressureConfig {
                evaluation_interval: Duration::from_millis(25),
                ..PressureConfig::default()
            })
            .allocator_config(pool(4096.0))
            .sampler(Arc::new(IdleSampler))
            .build()
            .unwrap(),
    );
    let agent = manager
        .create_agent_manager(memory_profile("svc-a", 512.0, 0.0, 5))
        .unwrap();
    agent.initialize().await.unwrap();

    manager.start().await;
    manager.start().await;
    tokio::time::sleep(Duration::from_millis(120)).await;

    let report = manager.health_report().await;
    assert_eq!(report.status, ComponentStatus::Healthy);
    assert!(manager.monitor().latest_sample().await.is_some());
    assert!(report
        .pressure
        .values()
        .all(|level| *level == PressureLevel::Normal));
    assert_eq!(report.agents.len(), 1);
    assert_eq!(report.agents[0].state, AgentState::Active);

    manager.stop().await;
    manager.stop().await;
    assert_eq!(agent.state().await, AgentState::Stopped);

    // No timer survives the stop
    let settled = manager.monitor().history().read().await.len();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(manager.monitor().history().read().await.len(), settled);
}
