//! Randomized pool churn against the capacity invariant
//!
//! Whatever order allocate, release, resize, usage touches, and reclaim
//! sweeps interleave in, the total granted per kind must never exceed
//! capacity times the over-provisioning factor.

use std::sync::Arc;
use std::time::Duration;

use manager_lib::alloc::{Allocator, AllocatorConfig, ReclaimConfig};
use manager_lib::models::{Decision, ResourceKind, ResourceRequest, ResourceUnits, StrategyKind};

/// Deterministic LCG so a failing interleaving replays exactly
struct Lcg(u64);

impl Lcg {
    fn new(seed: u64) -> Self {
        Self(seed)
    }

    fn next_u64(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0
    }

    fn below(&mut self, bound: u64) -> u64 {
        (self.next_u64() >> 33) % bound
    }
}

fn churn_config(factor: f64, allow_sharing: bool) -> AllocatorConfig {
    AllocatorConfig {
        strategy: StrategyKind::Priority,
        max_cpu_cores: 16.0,
        max_memory_mb: 2048.0,
        max_disk_mb: 8192.0,
        max_network_mbps: 500.0,
        over_provisioning_factor: factor,
        allow_sharing,
        minimum_units: [
            (ResourceKind::Cpu, 0.1),
            (ResourceKind::Memory, 64.0),
            (ResourceKind::Disk, 128.0),
            (ResourceKind::Network, 10.0),
        ]
        .into_iter()
        .collect(),
        reclaim: ReclaimConfig {
            enabled: true,
            idle_timeout: Duration::ZERO,
            usage_threshold: 1.0,
            grace_period: Duration::ZERO,
            sweep_interval: Duration::from_secs(3600),
        },
    }
}

fn random_request(rng: &mut Lcg, namespace: &str) -> ResourceRequest {
    let agent = format!("{namespace}-{}", rng.below(6));
    let mut resources: ResourceUnits =
        [(ResourceKind::Memory, 64.0 * (1 + rng.below(12)) as f64)]
            .into_iter()
            .collect();
    if rng.below(3) == 0 {
        resources.insert(ResourceKind::Cpu, 0.5 * (1 + rng.below(8)) as f64);
    }
    if rng.below(4) == 0 {
        resources.insert(ResourceKind::Network, 10.0 * (1 + rng.below(10)) as f64);
    }
    ResourceRequest::new(agent, resources, rng.below(10) as u8)
}

async fn assert_within_limits(allocator: &Allocator, limits: &ResourceUnits) {
    let allocated = allocator.allocated_units().await;
    for (kind, total) in &allocated {
        let limit = limits.get(kind).copied().unwrap_or(0.0);
        assert!(
            *total <= limit + 1e-9,
            "{kind}: {total} allocated against limit {limit}"
        );
    }
}

async fn churn(allocator: &Allocator, limits: &ResourceUnits, seed: u64, namespace: &str, ops: usize) {
    let mut rng = Lcg::new(seed);
    let mut live: Vec<String> = Vec::new();

    for _ in 0..ops {
        match rng.below(10) {
            0..=3 => {
                let decision = allocator.allocate(random_request(&mut rng, namespace)).await;
                match decision {
                    Decision::Granted { allocation_id, .. }
                    | Decision::Partial { allocation_id, .. } => live.push(allocation_id),
                    Decision::Denied { pending_id, .. } => {
                        if let Some(id) = pending_id {
                            live.push(id);
                        }
                    }
                }
            }
            4..=6 if !live.is_empty() => {
                let id = live.swap_remove(rng.below(live.len() as u64) as usize);
                // Stale ids are expected once reclaim has force-released
                let _ = allocator.release(&id).await;
            }
            7 if !live.is_empty() => {
                let id = &live[rng.below(live.len() as u64) as usize];
                let desired: ResourceUnits =
                    [(ResourceKind::Memory, 64.0 * (1 + rng.below(16)) as f64)]
                        .into_iter()
                        .collect();
                let _ = allocator.resize(id, desired).await;
            }
            8 if !live.is_empty() => {
                let id = &live[rng.below(live.len() as u64) as usize];
                let utilization = rng.below(100) as f64 / 100.0;
                let _ = allocator.record_usage(id, utilization).await;
            }
            _ => {
                allocator.reclaim_sweep().await;
            }
        }
        assert_within_limits(allocator, limits).await;
    }
}

#[tokio::test]
async fn test_churn_never_oversells_the_pool() {
    let config = churn_config(1.0, false);
    let limits = config.limits();
    let (allocator, _events) = Allocator::new(config).unwrap();

    churn(&allocator, &limits, 0x5eed_0001, "churn", 600).await;
    assert!(allocator.verify_consistency().await.is_empty());
}

#[tokio::test]
async fn test_churn_with_sharing_and_over_provisioning() {
    let config = churn_config(1.5, true);
    let limits = config.limits();
    let (allocator, _events) = Allocator::new(config).unwrap();

    churn(&allocator, &limits, 0x5eed_0002, "shared", 600).await;
    assert!(allocator.verify_consistency().await.is_empty());
}

#[tokio::test]
async fn test_concurrent_churn_never_oversells_the_pool() {
    let config = churn_config(1.0, true);
    let limits = Arc::new(config.limits());
    let (allocator, _events) = Allocator::new(config).unwrap();
    let allocator = Arc::new(allocator);

    let mut handles = Vec::new();
    for task in 0..4u64 {
        let allocator = Arc::clone(&allocator);
        let limits = Arc::clone(&limits);
        handles.push(tokio::spawn(async move {
            let namespace = format!("task{task}");
            churn(&allocator, &limits, 0x5eed_1000 + task, &namespace, 150).await;
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_within_limits(&allocator, &limits).await;
    assert!(allocator.verify_consistency().await.is_empty());
}
