//! Uniform random selection.

use std::rc::Rc;

use rand::Rng;

use crate::registry::Node;
use crate::strategy::Strategy;

/// Picks a candidate uniformly at random.
#[derive(Debug, Default)]
pub struct RandomStrategy;

impl Strategy for RandomStrategy {
    fn select(
        &self,
        candidates: &[Rc<Node>],
        _params: &serde_json::Value,
        _meta: &serde_json::Value,
    ) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        Some(rand::thread_rng().gen_range(0..candidates.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::test_support::{no_params, nodes};

    #[test]
    fn test_selection_stays_in_bounds() {
        let strategy = RandomStrategy;
        let candidates = nodes(&["a", "b", "c"]);
        let params = no_params();
        for _ in 0..100 {
            let index = strategy
                .select(&candidates, &params, &params)
                .expect("candidates present");
            assert!(index < candidates.len());
        }
    }

    #[test]
    fn test_single_candidate_is_always_chosen() {
        let strategy = RandomStrategy;
        let candidates = nodes(&["only"]);
        let params = no_params();
        for _ in 0..10 {
            assert_eq!(strategy.select(&candidates, &params, &params), Some(0));
        }
    }

    #[test]
    fn test_empty_slice_yields_none() {
        let strategy = RandomStrategy;
        assert_eq!(strategy.select(&[], &no_params(), &no_params()), None);
    }
}
