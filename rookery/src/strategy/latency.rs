//! Latency-aware selection.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use crate::registry::{Node, NodeId};
use crate::strategy::Strategy;

/// Prefers the node with the lowest smoothed round-trip time.
///
/// Round-trip samples arrive through [`Strategy::on_call_finished`] and are
/// folded into an exponentially weighted moving average per node. A node
/// without a sample yet is chosen ahead of measured ones, so every node
/// gets measured at least once instead of being starved by an early
/// front-runner.
#[derive(Debug)]
pub struct LatencyStrategy {
    alpha: f64,
    /// Smoothed RTT per node, in milliseconds.
    samples: RefCell<HashMap<NodeId, f64>>,
}

impl LatencyStrategy {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha,
            samples: RefCell::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    fn sample(&self, node: &NodeId) -> Option<f64> {
        self.samples.borrow().get(node).copied()
    }
}

impl Strategy for LatencyStrategy {
    fn select(
        &self,
        candidates: &[Rc<Node>],
        _params: &serde_json::Value,
        _meta: &serde_json::Value,
    ) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let samples = self.samples.borrow();
        if let Some(unmeasured) = candidates
            .iter()
            .position(|node| !samples.contains_key(node.id()))
        {
            return Some(unmeasured);
        }
        candidates
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                let rtt_a = samples.get(a.id()).copied().unwrap_or(f64::INFINITY);
                let rtt_b = samples.get(b.id()).copied().unwrap_or(f64::INFINITY);
                rtt_a.partial_cmp(&rtt_b).unwrap_or(Ordering::Equal)
            })
            .map(|(index, _)| index)
    }

    fn on_call_finished(&self, node: &NodeId, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        let mut samples = self.samples.borrow_mut();
        let smoothed = match samples.get(node) {
            Some(old) => self.alpha * ms + (1.0 - self.alpha) * old,
            None => ms,
        };
        samples.insert(node.clone(), smoothed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::test_support::{no_params, nodes};

    #[test]
    fn test_unmeasured_nodes_get_tried_first() {
        let strategy = LatencyStrategy::new(0.3);
        let candidates = nodes(&["a", "b"]);
        let params = no_params();

        strategy.on_call_finished(&NodeId::new("a"), Duration::from_millis(5));
        // "b" has no sample yet, so it goes next despite "a" being fast.
        assert_eq!(strategy.select(&candidates, &params, &params), Some(1));
    }

    #[test]
    fn test_lowest_smoothed_rtt_wins() {
        let strategy = LatencyStrategy::new(0.3);
        let candidates = nodes(&["slow", "fast"]);
        let params = no_params();

        strategy.on_call_finished(&NodeId::new("slow"), Duration::from_millis(80));
        strategy.on_call_finished(&NodeId::new("fast"), Duration::from_millis(4));
        assert_eq!(strategy.select(&candidates, &params, &params), Some(1));
    }

    #[test]
    fn test_ewma_follows_recent_samples() {
        let strategy = LatencyStrategy::new(0.5);
        let node = NodeId::new("a");

        strategy.on_call_finished(&node, Duration::from_millis(100));
        strategy.on_call_finished(&node, Duration::from_millis(20));
        // 0.5 * 20 + 0.5 * 100
        let sample = strategy.sample(&node).expect("sample recorded");
        assert!((sample - 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_slice_yields_none() {
        let strategy = LatencyStrategy::new(0.3);
        assert_eq!(strategy.select(&[], &no_params(), &no_params()), None);
    }
}
