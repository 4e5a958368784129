//! Code → candidate sequence lookup used by `next_by_code`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// One active sequence carrying a given code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeEntry {
    pub id: i64,
    pub company_id: Option<i64>,
}

#[derive(Default)]
struct Entries {
    by_code: HashMap<String, Arc<Vec<CodeEntry>>>,
    generation: u64,
}

/// Cached candidate lists per code, in load order (by name, then id).
/// `next_by_code` applies the company preference on top.
///
/// Owned by one `SequenceService` and invalidated whenever a sequence is
/// created, changed or deleted. A list loaded before an invalidation is
/// never stored after it.
#[derive(Default)]
pub struct CodeCache {
    inner: RwLock<Entries>,
}

impl CodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, code: &str) -> Option<Arc<Vec<CodeEntry>>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.by_code.get(code).cloned()
    }

    /// Current invalidation generation. Read it before loading candidates
    /// and hand it to [`CodeCache::insert`].
    pub fn generation(&self) -> u64 {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).generation
    }

    /// Store `candidates` unless an invalidation happened since `seen`.
    /// The list is returned either way.
    pub fn insert(&self, code: &str, candidates: Vec<CodeEntry>, seen: u64) -> Arc<Vec<CodeEntry>> {
        let candidates = Arc::new(candidates);
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if inner.generation == seen {
            inner.by_code.insert(code.to_string(), Arc::clone(&candidates));
        }
        candidates
    }

    pub fn invalidate(&self, code: &str) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.by_code.remove(code);
        inner.generation += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_invalidate() {
        let cache = CodeCache::new();
        assert!(cache.get("account.invoice").is_none());

        let seen = cache.generation();
        let stored = cache.insert(
            "account.invoice",
            vec![CodeEntry { id: 2, company_id: Some(1) }, CodeEntry { id: 1, company_id: None }],
            seen,
        );
        assert_eq!(stored.len(), 2);
        assert_eq!(cache.get("account.invoice").unwrap()[0].id, 2);

        cache.invalidate("account.invoice");
        assert!(cache.get("account.invoice").is_none());
    }

    #[test]
    fn load_racing_an_invalidation_is_not_stored() {
        let cache = CodeCache::new();
        let seen = cache.generation();
        // A writer changes a sequence while the candidates are being loaded.
        cache.invalidate("sale.order");

        let loaded = cache.insert("sale.order", vec![CodeEntry { id: 5, company_id: None }], seen);
        assert_eq!(loaded[0].id, 5);
        assert!(cache.get("sale.order").is_none());

        let seen = cache.generation();
        cache.insert("sale.order", vec![], seen);
        assert!(cache.get("sale.order").is_some());
    }
}
