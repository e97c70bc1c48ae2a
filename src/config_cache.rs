//! Caches [`RetryConfig`] objects by an arbitrary caller-chosen key, so that
//! equivalent requests share the same config rather than rebuilding one
//! (and its rule/backoff tree) per call.
//!
//! This is one of two process-wide mutable components in the core (the
//! other being the [`crate::limiter::RetryLimiter`] implementations) and
//! so must be thread-safe. The map is deliberately unbounded: callers are
//! responsible for choosing a key space with bounded cardinality, since an
//! unbounded key (e.g. a raw request body) would leak memory over time.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

use crate::driver::RetryConfig;

/// `(ctx, req) -> (key, RetryConfig)`, cached per key.
pub struct RetryConfigMapping<K, F>
where
    K: Eq + Hash + Clone + Send + Sync,
    F: Fn() -> (K, RetryConfig) + Send + Sync,
{
    resolve: F,
    cache: RwLock<HashMap<K, Arc<RetryConfig>>>,
}

impl<K, F> RetryConfigMapping<K, F>
where
    K: Eq + Hash + Clone + Send + Sync,
    F: Fn() -> (K, RetryConfig) + Send + Sync,
{
    pub fn new(resolve: F) -> Self {
        Self {
            resolve,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the cached config for this request's key, building and
    /// inserting it on first use.
    pub fn get_or_build(&self) -> Arc<RetryConfig> {
        let (key, config) = (self.resolve)();
        if let Some(existing) = self.cache.read().unwrap().get(&key) {
            return existing.clone();
        }
        let config = Arc::new(config);
        self.cache.write().unwrap().entry(key).or_insert_with(|| config.clone());
        config
    }

    /// Number of distinct keys currently cached, for diagnostics and tests.
    pub fn len(&self) -> usize {
        self.cache.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::RetryRuleBuilder;
    use http::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_rule() -> Arc<dyn crate::rule::RetryRule> {
        RetryRuleBuilder::new()
            .on_status(StatusCode::SERVICE_UNAVAILABLE)
            .then_default_backoff()
            .build()
            .unwrap()
    }

    #[test]
    fn shares_config_for_equal_keys() {
        let builds = AtomicUsize::new(0);
        let mapping = RetryConfigMapping::new(|| {
            builds.fetch_add(1, Ordering::SeqCst);
            ("procedure-a".to_string(), RetryConfig::builder(test_rule()).build().unwrap())
        });

        let a = mapping.get_or_build();
        let b = mapping.get_or_build();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(mapping.len(), 1);
        // The resolver itself still runs each time (it must, to know the
        // key); only the RetryConfig construction is avoided.
        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn separate_keys_get_separate_configs() {
        let counter = AtomicUsize::new(0);
        let mapping = RetryConfigMapping::new(|| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            (format!("procedure-{n}"), RetryConfig::builder(test_rule()).build().unwrap())
        });
        let a = mapping.get_or_build();
        let b = mapping.get_or_build();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(mapping.len(), 2);
    }
}
