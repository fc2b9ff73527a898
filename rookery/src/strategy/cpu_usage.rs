//! CPU-load-aware selection.

use std::cell::Cell;
use std::rc::Rc;

use crate::registry::Node;
use crate::strategy::Strategy;

/// Prefers the node with the lowest CPU sample from its heartbeats.
///
/// Nodes that have never reported a sample are treated as fully loaded, so
/// a node with any real measurement always wins over an unknown one. Ties
/// rotate round-robin to avoid hammering a single node.
#[derive(Debug, Default)]
pub struct CpuUsageStrategy {
    tie_cursor: Cell<usize>,
}

impl Strategy for CpuUsageStrategy {
    fn select(
        &self,
        candidates: &[Rc<Node>],
        _params: &serde_json::Value,
        _meta: &serde_json::Value,
    ) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let loads: Vec<f32> = candidates
            .iter()
            .map(|node| node.cpu().unwrap_or(f32::INFINITY))
            .collect();
        let lowest = loads.iter().copied().fold(f32::INFINITY, f32::min);
        let best: Vec<usize> = loads
            .iter()
            .enumerate()
            .filter(|(_, load)| **load == lowest)
            .map(|(index, _)| index)
            .collect();
        if best.len() == 1 {
            return Some(best[0]);
        }
        let cursor = self.tie_cursor.get() % best.len();
        self.tie_cursor.set(cursor + 1);
        Some(best[cursor])
    }
}
