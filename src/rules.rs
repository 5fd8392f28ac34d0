use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use regex::bytes::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid reject pattern '{pattern}': {source}")]
pub struct RuleError {
    pub pattern: String,
    #[source]
    source: regex::Error,
}

/// Memoizing compiler for caller-supplied reject patterns.
///
/// Patterns are matched against raw body bytes, so compiled matchers are
/// byte-oriented. Lookups take the read lock; a miss re-checks under the
/// write lock before compiling, so two requests racing on the same unseen
/// pattern compile it once. Failed compilations are not cached.
#[derive(Debug, Default)]
pub struct RuleCache {
    rules: RwLock<HashMap<String, Arc<Regex>>>,
}

impl RuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, pattern: &str) -> Result<Arc<Regex>, RuleError> {
        if let Some(matcher) = self.rules.read().get(pattern) {
            return Ok(matcher.clone());
        }
        self.compile_and_insert(pattern)
    }

    /// Compiles every pattern, preserving input order and failing on the
    /// first uncompilable one.
    pub fn get_all(&self, patterns: &[String]) -> Result<Vec<Arc<Regex>>, RuleError> {
        patterns.iter().map(|pattern| self.get(pattern)).collect()
    }

    fn compile_and_insert(&self, pattern: &str) -> Result<Arc<Regex>, RuleError> {
        let mut rules = self.rules.write();
        // Another caller may have compiled it between the two locks.
        if let Some(matcher) = rules.get(pattern) {
            return Ok(matcher.clone());
        }
        let matcher = Arc::new(Regex::new(pattern).map_err(|source| RuleError {
            pattern: pattern.to_string(),
            source,
        })?);
        rules.insert(pattern.to_string(), matcher.clone());
        Ok(matcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_and_matches() {
        let cache = RuleCache::new();
        let matcher = cache.get("page not found").unwrap();
        assert!(matcher.is_match(b"<html>page not found</html>"));
        assert!(!matcher.is_match(b"<html>all good</html>"));
    }

    #[test]
    fn memoizes_compiled_patterns() {
        let cache = RuleCache::new();
        let first = cache.get("rate.?limited").unwrap();
        let second = cache.get("rate.?limited").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn matches_non_utf8_bodies() {
        let cache = RuleCache::new();
        let matcher = cache.get("blocked").unwrap();
        let mut body = vec![0xff, 0xfe, 0x00];
        body.extend_from_slice(b"blocked");
        assert!(matcher.is_match(&body));
    }

    #[test]
    fn surfaces_compile_errors_without_caching_them() {
        let cache = RuleCache::new();
        let err = cache.get("([unclosed").unwrap_err();
        assert!(err.to_string().contains("([unclosed"));
        // A second attempt still reports the failure.
        assert!(cache.get("([unclosed").is_err());
    }

    #[test]
    fn get_all_preserves_order_and_fails_fast() {
        let cache = RuleCache::new();
        let patterns = vec!["alpha".to_string(), "beta".to_string()];
        let matchers = cache.get_all(&patterns).unwrap();
        assert_eq!(matchers.len(), 2);
        assert!(matchers[0].is_match(b"alpha"));
        assert!(matchers[1].is_match(b"beta"));

        let bad = vec!["fine".to_string(), "([broken".to_string()];
        assert!(cache.get_all(&bad).is_err());
    }
}
