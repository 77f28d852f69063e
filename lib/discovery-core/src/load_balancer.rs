//! Selection strategies for picking one instance out of a resolution result

use dashmap::DashMap;
use discovery_api::{InstanceId, InstanceRecord};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// First candidate in the authority's order
    #[default]
    FirstAvailable,
    /// Rotate through candidates
    RoundRobin,
    /// Uniformly random candidate
    Random,
    /// Candidate with the fewest requests in flight through this balancer
    LeastLoaded,
}

/// Load balancer for selecting an instance based on a strategy
pub struct LoadBalancer {
    strategy: SelectionStrategy,
    round_robin_counter: AtomicUsize,
    in_flight: DashMap<InstanceId, AtomicUsize>,
}

impl LoadBalancer {
    pub fn new(strategy: SelectionStrategy) -> Self {
        Self {
            strategy,
            round_robin_counter: AtomicUsize::new(0),
            in_flight: DashMap::new(),
        }
    }

    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    /// Select a candidate that is not in `exclude`
    pub fn select<'a>(
        &self,
        candidates: &'a [InstanceRecord],
        exclude: &[InstanceId],
    ) -> Option<&'a InstanceRecord> {
        let eligible: Vec<&'a InstanceRecord> = candidates
            .iter()
            .filter(|c| !exclude.contains(&c.instance_id))
            .collect();

        if eligible.is_empty() {
            return None;
        }

        match self.strategy {
            SelectionStrategy::FirstAvailable => eligible.first().copied(),
            SelectionStrategy::RoundRobin => {
                let current = self.round_robin_counter.fetch_add(1, Ordering::Relaxed);
                eligible.get(current % eligible.len()).copied()
            }
            SelectionStrategy::Random => {
                let index = rand::thread_rng().gen_range(0..eligible.len());
                eligible.get(index).copied()
            }
            SelectionStrategy::LeastLoaded => eligible
                .iter()
                .copied()
                // min_by_key keeps the first of equal minima, so ties go to authority order
                .min_by_key(|c| self.in_flight(&c.instance_id)),
        }
    }

    /// Mark a request in flight against an instance until the guard drops
    pub fn begin(&self, id: InstanceId) -> InFlightGuard<'_> {
        self.in_flight.entry(id).or_default().fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            in_flight: &self.in_flight,
            id,
        }
    }

    pub fn in_flight(&self, id: &InstanceId) -> usize {
        self.in_flight
            .get(id)
            .map_or(0, |c| c.load(Ordering::Acquire))
    }

    /// Number of instances with a request in flight
    pub fn tracked(&self) -> usize {
        self.in_flight.len()
    }
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new(SelectionStrategy::default())
    }
}

/// Counts one request against an instance; the instance's entry goes away with its last guard
pub struct InFlightGuard<'a> {
    in_flight: &'a DashMap<InstanceId, AtomicUsize>,
    id: InstanceId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Some(counter) = self.in_flight.get(&self.id) {
            counter.fetch_sub(1, Ordering::AcqRel);
        }
        // remove_if holds the shard lock, so a concurrent begin either sees the entry or recreates it
        self.in_flight
            .remove_if(&self.id, |_, c| c.load(Ordering::Acquire) == 0);
    }
}
