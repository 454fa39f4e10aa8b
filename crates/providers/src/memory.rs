//! Long-term memory backends
//!
//! [`LocalMemoryStore`] keeps recorded turns in process and retrieves them by
//! keyword overlap; [`NullMemoryStore`] is the disabled backend where every
//! call is a safe no-op. Both satisfy the pipeline's 500 ms deadline
//! trivially.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::RwLock;

use voiceloop_core::{MemorySnippet, MemoryStore, Result};

struct MemoryEntry {
    user_id: String,
    content: String,
}

/// In-process memory with keyword-overlap retrieval
pub struct LocalMemoryStore {
    entries: RwLock<VecDeque<MemoryEntry>>,
    capacity: usize,
}

impl LocalMemoryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    fn score(query_terms: &[String], content: &str) -> usize {
        let content = content.to_lowercase();
        query_terms
            .iter()
            .filter(|term| content.contains(term.as_str()))
            .count()
    }
}

#[async_trait]
impl MemoryStore for LocalMemoryStore {
    async fn search(
        &self,
        query: &str,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<MemorySnippet>> {
        let terms: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .filter(|t| t.chars().count() > 1)
            .map(str::to_string)
            .collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let entries = self.entries.read();
        let mut scored: Vec<(usize, &MemoryEntry)> = entries
            .iter()
            .filter(|e| e.user_id == user_id)
            .map(|e| (Self::score(&terms, &e.content), e))
            .filter(|(score, _)| *score > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(_, e)| MemorySnippet {
                content: e.content.clone(),
            })
            .collect())
    }

    async fn record_turn(
        &self,
        user_id: &str,
        user_text: &str,
        assistant_text: &str,
    ) -> Result<()> {
        let mut entries = self.entries.write();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(MemoryEntry {
            user_id: user_id.to_string(),
            content: format!("User said: {user_text}. Assistant replied: {assistant_text}"),
        });
        Ok(())
    }
}

/// Disabled memory: every call is safe and empty
pub struct NullMemoryStore;

#[async_trait]
impl MemoryStore for NullMemoryStore {
    async fn search(&self, _: &str, _: &str, _: usize) -> Result<Vec<MemorySnippet>> {
        Ok(Vec::new())
    }

    async fn record_turn(&self, _: &str, _: &str, _: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn retrieval_matches_keywords_per_user() {
        let store = LocalMemoryStore::new(16);
        store
            .record_turn("alice", "I love espresso", "Noted, espresso fan")
            .await
            .unwrap();
        store
            .record_turn("bob", "I love tea", "Noted")
            .await
            .unwrap();

        let hits = store.search("what espresso do I like", "alice", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].content.contains("espresso"));

        let cross_user = store.search("espresso", "bob", 5).await.unwrap();
        assert!(cross_user.is_empty());
    }

    #[tokio::test]
    async fn capacity_evicts_oldest() {
        let store = LocalMemoryStore::new(2);
        for i in 0..3 {
            store
                .record_turn("u", &format!("fact number{i}"), "ok")
                .await
                .unwrap();
        }
        let hits = store.search("number0", "u", 5).await.unwrap();
        assert!(hits.is_empty());
        let hits = store.search("number2", "u", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn null_store_is_inert() {
        let store = NullMemoryStore;
        store.record_turn("u", "a", "b").await.unwrap();
        assert!(store.search("a", "u", 5).await.unwrap().is_empty());
    }
}
