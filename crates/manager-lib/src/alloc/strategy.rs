//! Allocation placement strategies
//!
//! A strategy only proposes how much of a request to grant against a view of
//! the pool; the allocator owns validation, bookkeeping, and the capacity
//! invariant. Strategies also order parked requests for promotion when
//! capacity frees up.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::models::{ResourceKind, ResourceRequest, ResourceUnits, StrategyKind};

/// Tolerance for floating point capacity comparisons
pub(crate) const UNIT_EPSILON: f64 = 1e-9;

/// Grant fractions probed by the ml-optimized scorer
const ML_GRANT_FRACTIONS: [f64; 3] = [1.0, 0.75, 0.5];

/// Read-only view of one pool handed to a strategy
#[derive(Debug, Clone)]
pub struct PoolView {
    /// Capacity times the over-provisioning factor, per kind
    pub limits: ResourceUnits,
    /// Limit minus currently granted units, per kind
    pub free: ResourceUnits,
    pub minimum_units: ResourceUnits,
    pub allow_sharing: bool,
    /// Granted units summed per agent over active records
    pub agent_totals: BTreeMap<String, ResourceUnits>,
    /// Mean recent utilization across active records, in [0, 1]
    pub mean_usage: f64,
}

impl PoolView {
    pub fn free_of(&self, kind: ResourceKind) -> f64 {
        self.free.get(&kind).copied().unwrap_or(0.0)
    }

    pub fn limit_of(&self, kind: ResourceKind) -> f64 {
        self.limits.get(&kind).copied().unwrap_or(0.0)
    }

    pub fn minimum_unit_of(&self, kind: ResourceKind) -> f64 {
        self.minimum_units.get(&kind).copied().unwrap_or(0.0)
    }

    /// Whether the request fits fully into free capacity
    pub fn fits(&self, requested: &ResourceUnits) -> bool {
        requested
            .iter()
            .all(|(kind, amount)| *amount <= self.free_of(*kind) + UNIT_EPSILON)
    }

    /// Positive per-kind gap between the request and free capacity
    pub fn shortfall(&self, requested: &ResourceUnits) -> ResourceUnits {
        requested
            .iter()
            .filter_map(|(kind, amount)| {
                let gap = amount - self.free_of(*kind);
                (gap > UNIT_EPSILON).then_some((*kind, gap))
            })
            .collect()
    }

    fn agent_total(&self, agent_id: &str, kind: ResourceKind) -> f64 {
        self.agent_totals
            .get(agent_id)
            .and_then(|units| units.get(&kind))
            .copied()
            .unwrap_or(0.0)
    }

    /// Agent's granted units summed across kinds as fractions of the limits
    fn normalized_agent_total(&self, agent_id: &str) -> f64 {
        self.agent_totals
            .get(agent_id)
            .map(|units| {
                units
                    .iter()
                    .map(|(kind, amount)| {
                        let limit = self.limit_of(*kind);
                        if limit > 0.0 {
                            amount / limit
                        } else {
                            0.0
                        }
                    })
                    .sum()
            })
            .unwrap_or(0.0)
    }
}

/// What a strategy proposes for a request
#[derive(Debug, Clone, PartialEq)]
pub enum StrategyDecision {
    /// Grant these units; equal to the request for a full grant
    Grant(ResourceUnits),
    Deny,
}

/// Snapshot of a parked request handed to `rank_pending`
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub id: String,
    pub agent_id: String,
    pub requested: ResourceUnits,
    pub priority: u8,
    pub created_at: i64,
}

/// Placement policy for one pool
pub trait AllocationStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Propose a grant for the request against the current pool view
    fn decide(&self, request: &ResourceRequest, view: &PoolView) -> StrategyDecision;

    /// Order parked requests for promotion, most eligible first
    fn rank_pending(&self, pending: &mut Vec<PendingRequest>, view: &PoolView) {
        let _ = view;
        pending.sort_by_key(|p| p.created_at);
    }
}

/// Construct the built-in strategy for a configured kind
pub fn strategy_for(kind: StrategyKind) -> Arc<dyn AllocationStrategy> {
    match kind {
        StrategyKind::Priority => Arc::new(PriorityStrategy),
        StrategyKind::FairShare => Arc::new(FairShareStrategy),
        StrategyKind::BestFit => Arc::new(BestFitStrategy),
        StrategyKind::MlOptimized => Arc::new(MlOptimizedStrategy),
    }
}

/// Grants whatever fits; priority only matters for promotion order
pub struct PriorityStrategy;

impl AllocationStrategy for PriorityStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Priority
    }

    fn decide(&self, request: &ResourceRequest, view: &PoolView) -> StrategyDecision {
        if view.fits(&request.resources) {
            return StrategyDecision::Grant(request.resources.clone());
        }
        if !view.allow_sharing {
            return StrategyDecision::Deny;
        }

        // Hand over what remains, as long as every kind clears its minimum
        let grant: ResourceUnits = request
            .resources
            .iter()
            .map(|(kind, amount)| (*kind, amount.min(view.free_of(*kind))))
            .collect();
        if grant
            .iter()
            .all(|(kind, amount)| *amount + UNIT_EPSILON >= view.minimum_unit_of(*kind))
        {
            StrategyDecision::Grant(grant)
        } else {
            StrategyDecision::Deny
        }
    }

    fn rank_pending(&self, pending: &mut Vec<PendingRequest>, _view: &PoolView) {
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
    }
}

/// Targets an equal per-agent share of each limit, rebalanced per request
pub struct FairShareStrategy;

impl AllocationStrategy for FairShareStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::FairShare
    }

    fn decide(&self, request: &ResourceRequest, view: &PoolView) -> StrategyDecision {
        let mut agents = view.agent_totals.len();
        if !view.agent_totals.contains_key(&request.agent_id) {
            agents += 1;
        }
        let agents = agents.max(1) as f64;

        let mut grant = ResourceUnits::new();
        let mut full = true;
        for (kind, amount) in &request.resources {
            let target = view.limit_of(*kind) / agents;
            let headroom = (target - view.agent_total(&request.agent_id, *kind)).max(0.0);
            let granted = amount.min(headroom).min(view.free_of(*kind));
            if granted + UNIT_EPSILON < *amount {
                full = false;
            }
            grant.insert(*kind, granted);
        }

        if full {
            return StrategyDecision::Grant(request.resources.clone());
        }
        if !view.allow_sharing {
            return StrategyDecision::Deny;
        }
        if grant
            .iter()
            .all(|(kind, amount)| *amount + UNIT_EPSILON >= view.minimum_unit_of(*kind))
        {
            StrategyDecision::Grant(grant)
        } else {
            StrategyDecision::Deny
        }
    }

    fn rank_pending(&self, pending: &mut Vec<PendingRequest>, view: &PoolView) {
        // Agents holding the least go first
        pending.sort_by(|a, b| {
            let holdings_a = view.normalized_agent_total(&a.agent_id);
            let holdings_b = view.normalized_agent_total(&b.agent_id);
            holdings_a
                .partial_cmp(&holdings_b)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.created_at.cmp(&b.created_at))
        });
    }
}

/// Quantizes partial grants to minimum-unit multiples to limit fragmentation
pub struct BestFitStrategy;

impl AllocationStrategy for BestFitStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::BestFit
    }

    fn decide(&self, request: &ResourceRequest, view: &PoolView) -> StrategyDecision {
        if view.fits(&request.resources) {
            return StrategyDecision::Grant(request.resources.clone());
        }
        if !view.allow_sharing {
            return StrategyDecision::Deny;
        }

        let mut grant = ResourceUnits::new();
        for (kind, amount) in &request.resources {
            let unit = view.minimum_unit_of(*kind);
            let available = amount.min(view.free_of(*kind));
            let quantized = if unit > 0.0 {
                (available / unit).floor() * unit
            } else {
                available
            };
            if quantized + UNIT_EPSILON < unit {
                return StrategyDecision::Deny;
            }
            grant.insert(*kind, quantized);
        }
        StrategyDecision::Grant(grant)
    }

    fn rank_pending(&self, pending: &mut Vec<PendingRequest>, view: &PoolView) {
        // Tightest full fit first; requests that cannot fit yet go last
        pending.sort_by(|a, b| {
            let key = |p: &PendingRequest| {
                if view.fits(&p.requested) {
                    let leftover: f64 = p
                        .requested
                        .iter()
                        .map(|(kind, amount)| {
                            let limit = view.limit_of(*kind);
                            if limit > 0.0 {
                                (view.free_of(*kind) - amount) / limit
                            } else {
                                0.0
                            }
                        })
                        .sum();
                    (0u8, leftover)
                } else {
                    (1u8, 0.0)
                }
            };
            let (fit_a, left_a) = key(a);
            let (fit_b, left_b) = key(b);
            fit_a
                .cmp(&fit_b)
                .then(left_a.partial_cmp(&left_b).unwrap_or(std::cmp::Ordering::Equal))
                .then(a.created_at.cmp(&b.created_at))
        });
    }
}

/// Deterministic scorer standing in for a learned placement model
///
/// Probes a few grant fractions and keeps the one scoring best on projected
/// pool utilization and recent record usage. Conservative under load, whole
/// grants on an idle pool.
pub struct MlOptimizedStrategy;

impl MlOptimizedStrategy {
    fn score(&self, fraction: f64, grant: &ResourceUnits, view: &PoolView) -> f64 {
        let max_post_utilization = grant
            .iter()
            .map(|(kind, amount)| {
                let limit = view.limit_of(*kind);
                if limit > 0.0 {
                    (limit - view.free_of(*kind) + amount) / limit
                } else {
                    1.0
                }
            })
            .fold(0.0, f64::max);
        fraction * (1.0 - 0.5 * max_post_utilization - 0.2 * view.mean_usage)
    }
}

impl AllocationStrategy for MlOptimizedStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::MlOptimized
    }

    fn decide(&self, request: &ResourceRequest, view: &PoolView) -> StrategyDecision {
        let mut best: Option<(f64, ResourceUnits)> = None;

        for fraction in ML_GRANT_FRACTIONS {
            if fraction < 1.0 && !view.allow_sharing {
                continue;
            }

            let mut grant = ResourceUnits::new();
            let mut feasible = true;
            for (kind, amount) in &request.resources {
                let unit = view.minimum_unit_of(*kind);
                let scaled = if fraction < 1.0 && unit > 0.0 {
                    ((amount * fraction) / unit).floor() * unit
                } else {
                    amount * fraction
                };
                if scaled + UNIT_EPSILON < unit || scaled > view.free_of(*kind) + UNIT_EPSILON {
                    feasible = false;
                    break;
                }
                grant.insert(*kind, scaled);
            }
            if !feasible {
                continue;
            }

            let score = self.score(fraction, &grant, view);
            if best.as_ref().map(|(s, _)| score > *s).unwrap_or(true) {
                best = Some((score, grant));
            }
        }

        match best {
            Some((_, grant)) => StrategyDecision::Grant(grant),
            None => StrategyDecision::Deny,
        }
    }

    fn rank_pending(&self, pending: &mut Vec<PendingRequest>, view: &PoolView) {
        // Blend priority with request size relative to the pool
        pending.sort_by(|a, b| {
            let key = |p: &PendingRequest| {
                let size: f64 = p
                    .requested
                    .iter()
                    .map(|(kind, amount)| {
                        let limit = view.limit_of(*kind);
                        if limit > 0.0 {
                            amount / limit
                        } else {
                            0.0
                        }
                    })
                    .sum();
                p.priority as f64 / 255.0 * 0.6 + (1.0 - size.min(1.0)) * 0.4
            };
            key(b)
                .partial_cmp(&key(a))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.created_at.cmp(&b.created_at))
        });
    }
}
