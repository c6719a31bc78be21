//! Named collation registry.
//!
//! `BINARY`, `NOCASE` and `RTRIM` are pre-registered; hosts add custom
//! collations with a comparator. Names are case-insensitive.

use std::cmp::Ordering;
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{QuereusError, QuereusResult};
use crate::types::TextCollation;

pub type CollationFn = Arc<dyn Fn(&str, &str) -> Ordering + Send + Sync>;

pub struct CollationRegistry {
    collations: DashMap<String, CollationFn>,
}

impl CollationRegistry {
    pub fn new() -> Self {
        let registry = Self {
            collations: DashMap::new(),
        };
        for builtin in [TextCollation::Binary, TextCollation::NoCase, TextCollation::RTrim] {
            registry.collations.insert(
                builtin.name().to_string(),
                Arc::new(move |a: &str, b: &str| builtin.compare(a, b)) as CollationFn,
            );
        }
        registry
    }

    pub fn register(&self, name: &str, compare: CollationFn) {
        self.collations.insert(name.to_ascii_uppercase(), compare);
    }

    pub fn resolve(&self, name: &str) -> QuereusResult<CollationFn> {
        self.collations
            .get(&name.to_ascii_uppercase())
            .map(|e| e.value().clone())
            .ok_or_else(|| QuereusError::Resolve {
                kind: "collation",
                name: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.collations.contains_key(&name.to_ascii_uppercase())
    }
}

impl Default for CollationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_preregistered() {
        let registry = CollationRegistry::new();
        let nocase = registry.resolve("nocase").unwrap();
        assert_eq!(nocase("ABC", "abc"), Ordering::Equal);
    }

    #[test]
    fn unknown_collation_fails_resolution() {
        let registry = CollationRegistry::new();
        assert!(matches!(
            registry.resolve("klingon"),
            Err(QuereusError::Resolve { kind: "collation", .. })
        ));
    }

    #[test]
    fn custom_collation_round_trips() {
        let registry = CollationRegistry::new();
        registry.register(
            "reverse",
            Arc::new(|a: &str, b: &str| b.cmp(a)),
        );
        let reverse = registry.resolve("REVERSE").unwrap();
        assert_eq!(reverse("a", "b"), Ordering::Greater);
    }
}
