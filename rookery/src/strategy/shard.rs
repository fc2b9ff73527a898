//! Key-based sharding.

use std::cell::Cell;
use std::rc::Rc;

use xxhash_rust::xxh3::{xxh3_64, xxh3_64_with_seed};

use crate::registry::Node;
use crate::strategy::Strategy;

/// Routes calls carrying the same shard key to the same node.
///
/// Selection is rendezvous hashing: every candidate is scored with
/// `xxh3(node_id, seed = xxh3(key))` and the highest score wins. When a
/// node leaves, only the keys it owned move; the rest keep their
/// assignment. Calls without the key field fall back to rotating through
/// the candidates.
#[derive(Debug)]
pub struct ShardStrategy {
    /// Dotted path into params, or into meta with a `meta.` prefix.
    key: String,
    fallback: Cell<usize>,
}

impl ShardStrategy {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            fallback: Cell::new(0),
        }
    }

    fn extract_key(&self, params: &serde_json::Value, meta: &serde_json::Value) -> Option<String> {
        let (source, path) = match self.key.strip_prefix("meta.") {
            Some(rest) => (meta, rest),
            None => (params, self.key.as_str()),
        };
        let mut current = source;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        match current {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

impl Strategy for ShardStrategy {
    fn select(
        &self,
        candidates: &[Rc<Node>],
        params: &serde_json::Value,
        meta: &serde_json::Value,
    ) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        match self.extract_key(params, meta) {
            Some(key) => {
                let seed = xxh3_64(key.as_bytes());
                candidates
                    .iter()
                    .enumerate()
                    .max_by_key(|(_, node)| {
                        xxh3_64_with_seed(node.id().as_str().as_bytes(), seed)
                    })
                    .map(|(index, _)| index)
            }
            None => {
                let index = self.fallback.get() % candidates.len();
                self.fallback.set(index + 1);
                Some(index)
            }
        }
    }
}
