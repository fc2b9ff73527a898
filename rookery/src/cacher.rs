//! Action result caching.
//!
//! Caching is declared per action via [`CachePolicy`] and served by a
//! [`Cacher`] plugged into the broker. The cache sits on the node that
//! executes the action, right before the handler: a hit skips the handler
//! entirely. Keys combine the action name with either the whole param
//! object or a declared subset of its fields.

use std::cell::RefCell;
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use xxhash_rust::xxh3::xxh3_64;

/// Per-action cache declaration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CachePolicy {
    /// Param fields (dotted paths) that make up the key. `None` keys on the
    /// whole param object.
    pub keys: Option<Vec<String>>,

    /// Entry lifetime; `None` defers to the cacher's default.
    pub ttl: Option<Duration>,
}

impl CachePolicy {
    /// Key on the whole param object.
    pub fn all_params() -> Self {
        Self::default()
    }

    /// Key on the named param fields only.
    pub fn keys(keys: &[&str]) -> Self {
        Self {
            keys: Some(keys.iter().map(|k| k.to_string()).collect()),
            ttl: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Cache backend seam.
#[async_trait(?Send)]
pub trait Cacher {
    async fn get(&self, key: &str) -> Option<serde_json::Value>;
    async fn set(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>);
    async fn del(&self, key: &str);
    async fn clear(&self);
}

/// Build the cache key for one invocation.
pub(crate) fn cache_key(
    action: &str,
    params: &serde_json::Value,
    keys: Option<&[String]>,
) -> String {
    match keys {
        None => {
            // serde_json renders object keys sorted, so equal params hash equal.
            let digest = xxh3_64(params.to_string().as_bytes());
            format!("{action}:{digest:016x}")
        }
        Some(keys) => {
            let parts: Vec<String> = keys
                .iter()
                .map(|key| {
                    let mut current = params;
                    for segment in key.split('.') {
                        match current.get(segment) {
                            Some(next) => current = next,
                            None => return "null".to_string(),
                        }
                    }
                    match current {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    }
                })
                .collect();
            format!("{action}:{}", parts.join("|"))
        }
    }
}

struct CacheEntry {
    value: serde_json::Value,
    expires_at: Option<Instant>,
}

/// In-memory cacher with per-entry TTL.
///
/// Expired entries are dropped lazily on access; call
/// [`MemoryCacher::prune`] if the working set accumulates entries that are
/// never read again.
pub struct MemoryCacher {
    default_ttl: Option<Duration>,
    entries: RefCell<HashMap<String, CacheEntry>>,
}

impl MemoryCacher {
    pub fn new(default_ttl: Option<Duration>) -> Self {
        Self {
            default_ttl,
            entries: RefCell::new(HashMap::new()),
        }
    }

    /// Drop every expired entry.
    pub fn prune(&self) {
        let now = Instant::now();
        self.entries
            .borrow_mut()
            .retain(|_, entry| match entry.expires_at {
                Some(at) => at > now,
                None => true,
            });
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.borrow().len()
    }
}

impl Default for MemoryCacher {
    fn default() -> Self {
        Self::new(Some(Duration::from_secs(30)))
    }
}

#[async_trait(?Send)]
impl Cacher for MemoryCacher {
    async fn get(&self, key: &str) -> Option<serde_json::Value> {
        let mut entries = self.entries.borrow_mut();
        match entries.get(key) {
            Some(entry) => {
                if let Some(at) = entry.expires_at {
                    if at <= Instant::now() {
                        entries.remove(key);
                        return None;
                    }
                }
                Some(entry.value.clone())
            }
            None => None,
        }
    }

    async fn set(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) {
        let expires_at = ttl
            .or(self.default_ttl)
            .map(|ttl| Instant::now() + ttl);
        self.entries
            .borrow_mut()
            .insert(key.to_string(), CacheEntry { value, expires_at });
    }

    async fn del(&self, key: &str) {
        self.entries.borrow_mut().remove(key);
    }

    async fn clear(&self) {
        self.entries.borrow_mut().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    #[tokio::test]
    async fn test_set_then_get() {
        let cacher = MemoryCacher::new(None);
        cacher.set("k", serde_json::json!({ "n": 1 }), None).await;
        assert_eq!(cacher.get("k").await, Some(serde_json::json!({ "n": 1 })));
        assert_eq!(cacher.get("other").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let cacher = MemoryCacher::new(None);
        cacher
            .set("k", serde_json::json!(1), Some(Duration::from_secs(5)))
            .await;
        advance(Duration::from_secs(4)).await;
        assert_eq!(cacher.get("k").await, Some(serde_json::json!(1)));
        advance(Duration::from_secs(2)).await;
        assert_eq!(cacher.get("k").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_ttl_applies_when_unset() {
        let cacher = MemoryCacher::new(Some(Duration::from_secs(1)));
        cacher.set("k", serde_json::json!(1), None).await;
        advance(Duration::from_secs(2)).await;
        assert_eq!(cacher.get("k").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_drops_expired_entries() {
        let cacher = MemoryCacher::new(Some(Duration::from_secs(1)));
        cacher.set("a", serde_json::json!(1), None).await;
        cacher
            .set("b", serde_json::json!(2), Some(Duration::from_secs(60)))
            .await;
        advance(Duration::from_secs(2)).await;

        cacher.prune();
        assert_eq!(cacher.len(), 1);
        assert_eq!(cacher.get("b").await, Some(serde_json::json!(2)));
    }

    #[tokio::test]
    async fn test_del_and_clear() {
        let cacher = MemoryCacher::new(None);
        cacher.set("a", serde_json::json!(1), None).await;
        cacher.set("b", serde_json::json!(2), None).await;

        cacher.del("a").await;
        assert_eq!(cacher.get("a").await, None);

        cacher.clear().await;
        assert_eq!(cacher.get("b").await, None);
    }

    #[test]
    fn test_key_from_selected_fields() {
        let params = serde_json::json!({ "user": "alice", "limit": 5, "flag": true });
        let keys = vec!["user".to_string(), "limit".to_string()];
        assert_eq!(
            cache_key("posts.list", &params, Some(&keys)),
            "posts.list:alice|5"
        );
    }

    #[test]
    fn test_key_handles_missing_and_nested_fields() {
        let params = serde_json::json!({ "filter": { "tag": "rust" } });
        let keys = vec!["filter.tag".to_string(), "absent".to_string()];
        assert_eq!(
            cache_key("posts.list", &params, Some(&keys)),
            "posts.list:rust|null"
        );
    }

    #[test]
    fn test_key_on_whole_params_is_order_insensitive() {
        let a = serde_json::json!({ "x": 1, "y": 2 });
        let b = serde_json::json!({ "y": 2, "x": 1 });
        assert_eq!(cache_key("a.b", &a, None), cache_key("a.b", &b, None));
    }
}
