/// Replica selection policy
///
/// Precedence, highest first: a matching routing rule's first healthy
/// replica, the caller's first healthy preference, then a weighted draw over
/// the healthy replicas of the highest priority.
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;

use crate::core::{ReplicaEntry, ReplicaId};
use crate::routing::RuleMatch;

/// Selection-time view of one replica
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub id: ReplicaId,
    pub healthy: bool,
    pub weight: f64,
    pub priority: i32,
    pub query_count: u64,
}

impl Candidate {
    pub fn from_entry(entry: &ReplicaEntry) -> Self {
        let state = entry.state();
        Self {
            id: entry.id().clone(),
            healthy: state.healthy,
            weight: state.weight,
            priority: state.priority,
            query_count: state.query_count,
        }
    }
}

/// Why a replica was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionReason {
    RoutingRule,
    Preference,
    Weighted,
}

impl fmt::Display for SelectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionReason::RoutingRule => write!(f, "routing-rule"),
            SelectionReason::Preference => write!(f, "preference"),
            SelectionReason::Weighted => write!(f, "weighted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub replica_id: ReplicaId,
    pub reason: SelectionReason,
}

/// Picks one replica out of a set of healthy candidates
pub trait SelectionAlgorithm: Send + Sync {
    /// Returns an index into `candidates`, `None` when the slice is empty
    fn select(&self, candidates: &[Candidate]) -> Option<usize>;
}

enum RngSource {
    Thread,
    Seeded(Mutex<StdRng>),
}

/// Priority-tiered weighted random selection
///
/// Only the highest-priority tier takes part in the draw. Inside the tier
/// replicas are ordered least-loaded first, then drawn with probability
/// proportional to their weight.
pub struct WeightedRandom {
    rng: RngSource,
}

impl WeightedRandom {
    pub fn new() -> Self {
        Self { rng: RngSource::Thread }
    }

    /// Deterministic draws, for tests and benchmarks
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: RngSource::Seeded(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }

    fn draw(&self, total: f64) -> f64 {
        match &self.rng {
            RngSource::Thread => rand::thread_rng().gen_range(0.0..total),
            RngSource::Seeded(rng) => rng.lock().gen_range(0.0..total),
        }
    }
}

impl Default for WeightedRandom {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionAlgorithm for WeightedRandom {
    fn select(&self, candidates: &[Candidate]) -> Option<usize> {
        let top_priority = candidates.iter().map(|c| c.priority).max()?;

        let mut tier: Vec<usize> = (0..candidates.len())
            .filter(|&i| candidates[i].priority == top_priority)
            .collect();
        tier.sort_by(|&a, &b| {
            candidates[a]
                .query_count
                .cmp(&candidates[b].query_count)
                .then_with(|| candidates[a].id.cmp(&candidates[b].id))
        });

        let total_weight: f64 = tier.iter().map(|&i| candidates[i].weight).sum();
        if total_weight <= 0.0 || !total_weight.is_finite() {
            // Weights are validated positive; fall back to least-loaded
            return tier.first().copied();
        }

        let target = self.draw(total_weight);
        let mut cumulative = 0.0;
        for &index in &tier {
            cumulative += candidates[index].weight;
            if cumulative > target {
                return Some(index);
            }
        }

        // Floating point rounding can leave the draw just past the last bucket
        tier.last().copied()
    }
}

/// Applies the selection precedence
pub struct SelectionPolicy {
    algorithm: Box<dyn SelectionAlgorithm>,
}

impl SelectionPolicy {
    pub fn new(algorithm: Box<dyn SelectionAlgorithm>) -> Self {
        Self { algorithm }
    }

    /// Choose a replica, or `None` when nothing healthy is eligible
    ///
    /// A matched rule whose replicas are all down and which asks for the
    /// primary fallback also yields `None` instead of a weighted pick.
    pub fn select(
        &self,
        rule: Option<&RuleMatch>,
        preferred: &[ReplicaId],
        replicas: &[Candidate],
    ) -> Option<Selection> {
        let is_healthy = |id: &ReplicaId| replicas.iter().any(|c| &c.id == id && c.healthy);

        if let Some(rule) = rule {
            if let Some(id) = rule.candidates.iter().find(|id| is_healthy(*id)) {
                return Some(Selection {
                    replica_id: id.clone(),
                    reason: SelectionReason::RoutingRule,
                });
            }
            if rule.fallback_to_primary {
                return None;
            }
        }

        if let Some(id) = preferred.iter().find(|id| is_healthy(*id)) {
            return Some(Selection {
                replica_id: id.clone(),
                reason: SelectionReason::Preference,
            });
        }

        let healthy: Vec<Candidate> = replicas.iter().filter(|c| c.healthy).cloned().collect();
        self.algorithm.select(&healthy).map(|index| Selection {
            replica_id: healthy[index].id.clone(),
            reason: SelectionReason::Weighted,
        })
    }
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self::new(Box::new(WeightedRandom::new()))
    }
}
