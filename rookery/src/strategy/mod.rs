//! Load-balancing strategies.
//!
//! A [`Strategy`] picks one node out of the eligible candidates for an
//! action or event group. Eligibility (node availability, circuit-breaker
//! state) is decided by the registry before the strategy runs; strategies
//! only rank. Each endpoint list owns its own strategy instance, so cursor
//! and latency state never leak between actions.

use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use crate::registry::{Node, NodeId};

mod cpu_usage;
mod latency;
mod random;
mod round_robin;
mod shard;

pub use cpu_usage::CpuUsageStrategy;
pub use latency::LatencyStrategy;
pub use random::RandomStrategy;
pub use round_robin::RoundRobinStrategy;
pub use shard::ShardStrategy;

/// Picks a node from the pre-filtered candidate slice.
pub trait Strategy: fmt::Debug {
    /// Index of the chosen candidate, or `None` when the slice is empty.
    ///
    /// `params` and `meta` carry the call payload for key-based strategies.
    fn select(
        &self,
        candidates: &[Rc<Node>],
        params: &serde_json::Value,
        meta: &serde_json::Value,
    ) -> Option<usize>;

    /// Feedback after a call completes, for latency-aware strategies.
    fn on_call_finished(&self, _node: &NodeId, _elapsed: Duration) {}
}

/// Declarative strategy choice, turned into instances per endpoint list.
#[derive(Debug, Clone, PartialEq)]
pub enum StrategyKind {
    /// Cycle through candidates in order.
    RoundRobin,
    /// Uniform random choice.
    Random,
    /// Lowest reported CPU sample wins; unreported counts as fully loaded.
    CpuUsage,
    /// Lowest smoothed round-trip time wins; unmeasured nodes go first.
    Latency {
        /// EWMA smoothing factor in `(0, 1]`; higher follows recent samples.
        alpha: f64,
    },
    /// Same shard key, same node, as long as membership holds.
    Shard {
        /// Param field holding the key; `meta.` prefix reads from meta.
        /// Dots descend into nested objects.
        key: String,
    },
}

impl Default for StrategyKind {
    fn default() -> Self {
        StrategyKind::RoundRobin
    }
}

impl StrategyKind {
    /// Latency strategy with the default smoothing factor.
    pub fn latency() -> Self {
        StrategyKind::Latency { alpha: 0.3 }
    }

    pub fn shard(key: &str) -> Self {
        StrategyKind::Shard {
            key: key.to_string(),
        }
    }

    pub(crate) fn build(&self) -> Box<dyn Strategy> {
        match self {
            StrategyKind::RoundRobin => Box::new(RoundRobinStrategy::default()),
            StrategyKind::Random => Box::new(RandomStrategy),
            StrategyKind::CpuUsage => Box::new(CpuUsageStrategy::default()),
            StrategyKind::Latency { alpha } => Box::new(LatencyStrategy::new(*alpha)),
            StrategyKind::Shard { key } => Box::new(ShardStrategy::new(key)),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn nodes(ids: &[&str]) -> Vec<Rc<Node>> {
        ids.iter()
            .map(|id| Rc::new(Node::new_remote(NodeId::new(*id))))
            .collect()
    }

    pub fn no_params() -> serde_json::Value {
        serde_json::json!({})
    }
}
