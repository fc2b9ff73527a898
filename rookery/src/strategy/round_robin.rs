//! Round-robin selection.

use std::cell::Cell;
use std::rc::Rc;

use crate::registry::Node;
use crate::strategy::Strategy;

/// Cycles through candidates in order. The default strategy.
#[derive(Debug, Default)]
pub struct RoundRobinStrategy {
    /// Next index (wraps around).
    next: Cell<usize>,
}

impl Strategy for RoundRobinStrategy {
    fn select(
        &self,
        candidates: &[Rc<Node>],
        _params: &serde_json::Value,
        _meta: &serde_json::Value,
    ) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let index = self.next.get() % candidates.len();
        self.next.set(index + 1);
        Some(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::test_support::{no_params, nodes};

    #[test]
    fn test_visits_each_candidate_once_per_cycle() {
        let strategy = RoundRobinStrategy::default();
        let candidates = nodes(&["a", "b", "c"]);
        let params = no_params();

        let mut picks = Vec::new();
        for _ in 0..6 {
            picks.push(
                strategy
                    .select(&candidates, &params, &params)
                    .expect("candidates present"),
            );
        }
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_empty_slice_yields_none() {
        let strategy = RoundRobinStrategy::default();
        assert_eq!(strategy.select(&[], &no_params(), &no_params()), None);
    }

    #[test]
    fn test_cursor_survives_shrinking_candidate_list() {
        let strategy = RoundRobinStrategy::default();
        let three = nodes(&["a", "b", "c"]);
        let params = no_params();
        strategy.select(&three, &params, &params);
        strategy.select(&three, &params, &params);

        // List shrinks; cursor keeps wrapping without panicking.
        let one = nodes(&["a"]);
        assert_eq!(strategy.select(&one, &params, &params), Some(0));
    }
}
