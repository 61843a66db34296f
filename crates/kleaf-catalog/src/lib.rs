//! Catalog persistence: the subject table, the shared bucket sequence, the
//! deduplicating bulk ingestor and the key-value title set.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use kleaf_core::CatalogEntry;
use serde::Serialize;
use thiserror::Error;

pub mod ingest;
pub mod kv;
pub mod memory;
pub mod postgres;

pub use ingest::{
    build_ingest_scheduler, ingest_lines, ingest_with_timeout, IngestConfig, IngestReport,
    KeyValueLoader, TitleSink,
};
pub use kv::{MemoryTitleSet, RedisTitleSet, SetKind, TitleSet};
pub use memory::MemoryCatalogStore;
pub use postgres::{
    connect_options_from_env, PgCatalogStore, PostgresSettings, BUCKET_SEQUENCE,
};
pub use sqlx::postgres::PgConnectOptions;

pub const CRATE_NAME: &str = "kleaf-catalog";

/// Batches adding at most this many new titles reuse the current bucket.
pub const SMALL_BATCH_THRESHOLD: u64 = 50;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("bucket sequence has never been advanced")]
    UninitializedSequence,
    #[error("no catalog entry in bucket {0}")]
    EmptyBucket(i64),
    #[error("catalog is empty")]
    EmptyCatalog,
    #[error("{0} is not supported by this backend")]
    Unsupported(&'static str),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("key-value store error: {0}")]
    KeyValue(#[from] redis::RedisError),
}

/// Persisted subjects plus the bucket sequence they are tagged from.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// How many of `titles` are already stored.
    async fn count_existing(&self, titles: &[String]) -> Result<u64, CatalogError>;

    /// Last value produced by the sequence.
    async fn current_bucket(&self) -> Result<i64, CatalogError>;

    /// Advances the sequence and returns the new value.
    async fn next_bucket(&self) -> Result<i64, CatalogError>;

    /// Inserts every entry whose title is not stored yet; duplicates are skipped.
    /// Returns the number of rows written.
    async fn insert_skipping_duplicates(&self, entries: &[CatalogEntry])
        -> Result<u64, CatalogError>;

    /// One title from `bucket`, picked by the backend in random order.
    async fn random_title_in_bucket(&self, bucket: i64) -> Result<String, CatalogError>;

    async fn count_titles(&self) -> Result<u64, CatalogError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BulkCreateOutcome {
    pub requested: u64,
    pub existing: u64,
    pub inserted: u64,
    pub bucket: Option<i64>,
}

/// Absorbs batches of normalized titles into a [`CatalogStore`].
#[derive(Clone)]
pub struct CatalogIngestor {
    store: Arc<dyn CatalogStore>,
}

impl CatalogIngestor {
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn CatalogStore> {
        &self.store
    }

    pub async fn bulk_create(&self, titles: &[String]) -> Result<BulkCreateOutcome, CatalogError> {
        let titles = titles
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();
        if titles.is_empty() {
            return Ok(BulkCreateOutcome::default());
        }

        let requested = titles.len() as u64;
        let existing = self.store.count_existing(&titles).await?;
        let diff = requested.saturating_sub(existing);
        if diff == 0 {
            return Ok(BulkCreateOutcome {
                requested,
                existing,
                ..Default::default()
            });
        }

        let bucket = self.choose_bucket(diff).await?;
        let entries = titles
            .into_iter()
            .map(|title| CatalogEntry::new(title, bucket))
            .collect::<Vec<_>>();
        let inserted = self.store.insert_skipping_duplicates(&entries).await?;

        Ok(BulkCreateOutcome {
            requested,
            existing,
            inserted,
            bucket: Some(bucket),
        })
    }

    async fn choose_bucket(&self, diff: u64) -> Result<i64, CatalogError> {
        if diff <= SMALL_BATCH_THRESHOLD {
            match self.store.current_bucket().await {
                Ok(bucket) => return Ok(bucket),
                Err(CatalogError::UninitializedSequence) => {}
                Err(err) => return Err(err),
            }
        }
        self.store.next_bucket().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn titles(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{prefix}_{i:04}")).collect()
    }

    fn ingestor() -> (Arc<MemoryCatalogStore>, CatalogIngestor) {
        let store = Arc::new(MemoryCatalogStore::new());
        (store.clone(), CatalogIngestor::new(store))
    }

    #[tokio::test]
    async fn empty_input_is_a_no_op() {
        let (store, ingestor) = ingestor();
        let outcome = ingestor.bulk_create(&[]).await.unwrap();
        assert_eq!(outcome, BulkCreateOutcome::default());
        assert!(matches!(
            store.current_bucket().await,
            Err(CatalogError::UninitializedSequence)
        ));
    }

    #[tokio::test]
    async fn repeated_ingestion_is_idempotent() {
        let (store, ingestor) = ingestor();
        let batch = titles("Planet", 120);

        let first = ingestor.bulk_create(&batch).await.unwrap();
        let second = ingestor.bulk_create(&batch).await.unwrap();

        assert_eq!(first.inserted, 120);
        assert_eq!(second.inserted, 0);
        assert_eq!(second.existing, 120);
        assert_eq!(second.bucket, None);
        assert_eq!(store.count_titles().await.unwrap(), 120);
        assert_eq!(store.current_bucket().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn disjoint_batches_are_fully_stored() {
        let (store, ingestor) = ingestor();
        ingestor.bulk_create(&titles("River", 80)).await.unwrap();
        ingestor.bulk_create(&titles("Mountain", 7)).await.unwrap();
        assert_eq!(store.count_titles().await.unwrap(), 87);
    }

    #[tokio::test]
    async fn small_batches_reuse_the_current_bucket() {
        let (store, ingestor) = ingestor();
        let first = ingestor.bulk_create(&titles("City", 200)).await.unwrap();
        let k = first.bucket.unwrap();

        let small = ingestor.bulk_create(&titles("Town", 50)).await.unwrap();
        assert_eq!(small.bucket, Some(k));
        assert_eq!(store.bucket_of("Town_0000").await, Some(k));

        let large = ingestor.bulk_create(&titles("Village", 51)).await.unwrap();
        assert!(large.bucket.unwrap() > k);
    }

    #[tokio::test]
    async fn small_diff_counts_only_new_titles() {
        let (_store, ingestor) = ingestor();
        let first = ingestor.bulk_create(&titles("Lake", 100)).await.unwrap();
        let mut mixed = titles("Lake", 100);
        mixed.extend(titles("Pond", 10));

        let outcome = ingestor.bulk_create(&mixed).await.unwrap();
        assert_eq!(outcome.existing, 100);
        assert_eq!(outcome.inserted, 10);
        assert_eq!(outcome.bucket, first.bucket);
    }

    #[tokio::test]
    async fn first_small_batch_advances_an_untouched_sequence() {
        let (store, ingestor) = ingestor();
        let outcome = ingestor.bulk_create(&titles("Star", 3)).await.unwrap();
        assert_eq!(outcome.bucket, Some(1));
        assert_eq!(store.current_bucket().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn duplicate_titles_in_one_batch_collapse() {
        let (store, ingestor) = ingestor();
        let batch = vec!["Moon".to_string(), "Moon".to_string(), "Sun".to_string()];
        let outcome = ingestor.bulk_create(&batch).await.unwrap();
        assert_eq!(outcome.requested, 2);
        assert_eq!(store.count_titles().await.unwrap(), 2);
    }

    struct FlakyStore {
        inner: MemoryCatalogStore,
        current_calls: AtomicUsize,
    }

    #[async_trait]
    impl CatalogStore for FlakyStore {
        async fn count_existing(&self, titles: &[String]) -> Result<u64, CatalogError> {
            self.inner.count_existing(titles).await
        }
        async fn current_bucket(&self) -> Result<i64, CatalogError> {
            self.current_calls.fetch_add(1, Ordering::SeqCst);
            Err(CatalogError::Database(sqlx::Error::PoolTimedOut))
        }
        async fn next_bucket(&self) -> Result<i64, CatalogError> {
            self.inner.next_bucket().await
        }
        async fn insert_skipping_duplicates(
            &self,
            entries: &[CatalogEntry],
        ) -> Result<u64, CatalogError> {
            self.inner.insert_skipping_duplicates(entries).await
        }
        async fn random_title_in_bucket(&self, bucket: i64) -> Result<String, CatalogError> {
            self.inner.random_title_in_bucket(bucket).await
        }
        async fn count_titles(&self) -> Result<u64, CatalogError> {
            self.inner.count_titles().await
        }
    }

    #[tokio::test]
    async fn transient_sequence_failures_abort_the_batch() {
        let store = Arc::new(FlakyStore {
            inner: MemoryCatalogStore::new(),
            current_calls: AtomicUsize::new(0),
        });
        let ingestor = CatalogIngestor::new(store.clone());

        let err = ingestor.bulk_create(&titles("Comet", 5)).await.unwrap_err();
        assert!(matches!(err, CatalogError::Database(_)));
        assert_eq!(store.current_calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.inner.count_titles().await.unwrap(), 0);
    }
}
