//! Narrow capability shared between the sync engine and ingestion so neither
//! depends on the other directly (9. DESIGN NOTES: "cyclic module
//! dependencies... broken by injecting a narrow capability interface").
//! Maps a venue token/asset id to the `(market_id, outcome_id)` pair the
//! sync engine last wrote for it.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;

use crate::db::store::Store;

#[derive(Clone, Default)]
pub struct TokenIndex {
    inner: Arc<DashMap<String, (String, String)>>,
}

impl TokenIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token_id: String, market_id: String, outcome_id: String) {
        self.inner.insert(token_id, (market_id, outcome_id));
    }

    pub fn get(&self, token_id: &str) -> Option<(String, String)> {
        self.inner.get(token_id).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Loads every known `(token_id, market_id, outcome_id)` triple so
    /// ingestion can resolve outcomes immediately after a restart, before
    /// the sync engine's first cycle completes.
    pub async fn seed_from_store(&self, store: &Store) {
        for (token_id, market_id, outcome_id) in store.all_outcome_tokens().await {
            self.insert(token_id, market_id, outcome_id);
        }
    }

    pub fn snapshot(&self) -> HashMap<String, (String, String)> {
        self.inner.iter().map(|e| (e.key().clone(), e.value().clone())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_get_round_trips() {
        let idx = TokenIndex::new();
        idx.insert("tok1".to_string(), "m1".to_string(), "o1".to_string());
        assert_eq!(idx.get("tok1"), Some(("m1".to_string(), "o1".to_string())));
        assert_eq!(idx.get("missing"), None);
    }
}
