//! In-process catalog with the same sequence semantics as the Postgres store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use kleaf_core::CatalogEntry;
use rand::seq::SliceRandom;
use tokio::sync::Mutex;

use crate::{CatalogError, CatalogStore};

#[derive(Debug, Default)]
struct MemoryState {
    entries: BTreeMap<String, CatalogEntry>,
    last_bucket: Option<i64>,
}

#[derive(Debug, Default)]
pub struct MemoryCatalogStore {
    state: Mutex<MemoryState>,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<CatalogEntry> {
        self.state.lock().await.entries.values().cloned().collect()
    }

    pub async fn bucket_of(&self, title: &str) -> Option<i64> {
        self.state
            .lock()
            .await
            .entries
            .get(title)
            .map(|e| e.bucket_id)
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn count_existing(&self, titles: &[String]) -> Result<u64, CatalogError> {
        let state = self.state.lock().await;
        Ok(titles
            .iter()
            .filter(|t| state.entries.contains_key(t.as_str()))
            .count() as u64)
    }

    async fn current_bucket(&self) -> Result<i64, CatalogError> {
        self.state
            .lock()
            .await
            .last_bucket
            .ok_or(CatalogError::UninitializedSequence)
    }

    async fn next_bucket(&self) -> Result<i64, CatalogError> {
        let mut state = self.state.lock().await;
        let next = state.last_bucket.unwrap_or(0) + 1;
        state.last_bucket = Some(next);
        Ok(next)
    }

    async fn insert_skipping_duplicates(
        &self,
        entries: &[CatalogEntry],
    ) -> Result<u64, CatalogError> {
        let mut state = self.state.lock().await;
        let mut inserted = 0;
        for entry in entries {
            if !state.entries.contains_key(&entry.title) {
                state.entries.insert(entry.title.clone(), entry.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn random_title_in_bucket(&self, bucket: i64) -> Result<String, CatalogError> {
        let state = self.state.lock().await;
        let titles = state
            .entries
            .values()
            .filter(|e| e.bucket_id == bucket)
            .map(|e| e.title.as_str())
            .collect::<Vec<_>>();
        titles
            .choose(&mut rand::thread_rng())
            .map(|t| t.to_string())
            .ok_or(CatalogError::EmptyBucket(bucket))
    }

    async fn count_titles(&self) -> Result<u64, CatalogError> {
        Ok(self.state.lock().await.entries.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sequence_starts_uninitialized_then_advances() {
        let store = MemoryCatalogStore::new();
        assert!(matches!(
            store.current_bucket().await,
            Err(CatalogError::UninitializedSequence)
        ));
        assert_eq!(store.next_bucket().await.unwrap(), 1);
        assert_eq!(store.next_bucket().await.unwrap(), 2);
        assert_eq!(store.current_bucket().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn random_title_stays_inside_bucket() {
        let store = MemoryCatalogStore::new();
        store
            .insert_skipping_duplicates(&[
                CatalogEntry::new("Alpha", 1),
                CatalogEntry::new("Beta", 2),
                CatalogEntry::new("Gamma", 2),
            ])
            .await
            .unwrap();
        for _ in 0..20 {
            let title = store.random_title_in_bucket(2).await.unwrap();
            assert!(title == "Beta" || title == "Gamma");
        }
        assert!(matches!(
            store.random_title_in_bucket(9).await,
            Err(CatalogError::EmptyBucket(9))
        ));
    }
}
