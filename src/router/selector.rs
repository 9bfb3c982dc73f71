//! Replica ranking strategies
//!
//! A selector orders candidate backends best-first. Sessions use the order
//! when connecting (falling through to the next candidate on failure) and
//! pick the head of it when routing a read.

use std::cmp::Reverse;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::backend::Backend;
use crate::config::SelectionCriterion;

/// Strategy for ordering replica candidates
pub trait BackendSelector: Send + Sync {
    /// Order candidates best-first
    fn rank(&self, candidates: Vec<Arc<Backend>>) -> Vec<Arc<Backend>>;

    /// Best candidate, if any
    fn select(&self, candidates: Vec<Arc<Backend>>) -> Option<Arc<Backend>> {
        self.rank(candidates).into_iter().next()
    }
}

/// Lowest load metric wins; ties go to fewer router connections, then configuration order
#[derive(Debug, Clone, Copy)]
pub struct LeastLoadSelector {
    criterion: SelectionCriterion,
}

impl LeastLoadSelector {
    pub fn new(criterion: SelectionCriterion) -> Self {
        Self { criterion }
    }

    fn load(&self, backend: &Backend) -> u64 {
        let server = backend.server();
        match self.criterion {
            SelectionCriterion::LeastGlobalConnections => server.connections() as u64,
            SelectionCriterion::LeastCurrentOperations => server.operations() as u64,
            // unknown lag ranks behind every measured one
            SelectionCriterion::LeastBehindPrimary => server
                .status()
                .replication_lag
                .map(|lag| lag.as_millis() as u64)
                .unwrap_or(u64::MAX),
            SelectionCriterion::LeastRouterConnections | SelectionCriterion::WeightedRandom => {
                backend.conn_count() as u64
            }
        }
    }
}

impl BackendSelector for LeastLoadSelector {
    fn rank(&self, mut candidates: Vec<Arc<Backend>>) -> Vec<Arc<Backend>> {
        candidates.sort_by_key(|b| (self.load(b), b.conn_count(), b.index()));
        candidates
    }
}

/// Random order, each pick proportional to the normalized weight
#[derive(Debug, Default, Clone, Copy)]
pub struct WeightedRandomSelector;

impl BackendSelector for WeightedRandomSelector {
    fn rank(&self, mut candidates: Vec<Arc<Backend>>) -> Vec<Arc<Backend>> {
        let mut rng = rand::thread_rng();
        let mut ranked = Vec::with_capacity(candidates.len());

        while !candidates.is_empty() {
            let total: u64 = candidates.iter().map(|b| b.weight() as u64).sum();
            let pick = if total == 0 {
                // only zero weights left: keep configuration order
                candidates.sort_by_key(|b| Reverse(b.index()));
                candidates.len() - 1
            } else {
                let mut roll = rng.gen_range(0..total);
                candidates
                    .iter()
                    .position(|b| {
                        let w = b.weight() as u64;
                        if roll < w {
                            true
                        } else {
                            roll -= w;
                            false
                        }
                    })
                    .unwrap_or(candidates.len() - 1)
            };
            ranked.push(candidates.swap_remove(pick));
        }

        ranked
    }
}

/// Selector implementing a configured criterion
pub fn selector_for(criterion: SelectionCriterion) -> Box<dyn BackendSelector> {
    match criterion {
        SelectionCriterion::WeightedRandom => Box::new(WeightedRandomSelector),
        other => Box::new(LeastLoadSelector::new(other)),
    }
}

/// Replica lag is unknown or within the limit
pub fn within_lag(backend: &Backend, max_lag: Option<Duration>) -> bool {
    match (max_lag, backend.server().status().replication_lag) {
        (Some(max), Some(lag)) => lag <= max,
        _ => true,
    }
}
