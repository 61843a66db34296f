use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use kleaf_catalog::{CatalogError, CatalogStore, SetKind, TitleSet};
use rand::Rng;
use tokio::sync::OnceCell;
use tracing::info;

use crate::{TitleBackendKind, TitleSource};

/// Reads the bundled sample list: a JSON array of titles.
pub async fn load_sample_titles(path: impl AsRef<Path>) -> anyhow::Result<Vec<String>> {
    let path = path.as_ref();
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Fixed, immutable list of titles loaded once at startup.
#[derive(Debug, Clone)]
pub struct StaticTitleSource {
    titles: Arc<[String]>,
}

impl StaticTitleSource {
    pub fn new(titles: Vec<String>) -> Result<Self, CatalogError> {
        if titles.is_empty() {
            return Err(CatalogError::EmptyCatalog);
        }
        Ok(Self {
            titles: titles.into(),
        })
    }

    pub fn len(&self) -> usize {
        self.titles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.titles.is_empty()
    }
}

#[async_trait]
impl TitleSource for StaticTitleSource {
    fn backend(&self) -> TitleBackendKind {
        TitleBackendKind::Static
    }

    async fn random_title(&self) -> Result<String, CatalogError> {
        let index = rand::thread_rng().gen_range(0..self.titles.len());
        Ok(self.titles[index].clone())
    }
}

/// Titles held in a key-value set. The set's size is counted once per
/// process and never refreshed.
pub struct KeyValueTitleSource {
    set: Arc<dyn TitleSet>,
    cardinality: OnceCell<u64>,
}

impl KeyValueTitleSource {
    pub fn new(set: Arc<dyn TitleSet>) -> Self {
        Self {
            set,
            cardinality: OnceCell::new(),
        }
    }

    async fn cardinality(&self) -> Result<u64, CatalogError> {
        self.cardinality
            .get_or_try_init(|| async {
                let count = self.set.cardinality().await?;
                info!(titles = count, "counted titles in key-value set");
                Ok::<_, CatalogError>(count)
            })
            .await
            .copied()
    }
}

#[async_trait]
impl TitleSource for KeyValueTitleSource {
    fn backend(&self) -> TitleBackendKind {
        TitleBackendKind::KeyValue
    }

    async fn random_title(&self) -> Result<String, CatalogError> {
        let count = self.cardinality().await?;
        if count == 0 {
            return Err(CatalogError::EmptyCatalog);
        }
        let member = match self.set.kind() {
            SetKind::Unordered => self.set.random_member().await?,
            SetKind::Ordered => {
                let index = rand::thread_rng().gen_range(0..count);
                self.set.member_at(index).await?
            }
        };
        member.ok_or(CatalogError::EmptyCatalog)
    }
}

/// Two-stage sampling over the relational catalog: a uniform bucket in
/// `[1, N]`, then one random row inside it. Titles in small buckets are drawn
/// more often than titles in large ones.
pub struct RelationalTitleSource {
    store: Arc<dyn CatalogStore>,
}

impl RelationalTitleSource {
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TitleSource for RelationalTitleSource {
    fn backend(&self) -> TitleBackendKind {
        TitleBackendKind::Relational
    }

    async fn random_title(&self) -> Result<String, CatalogError> {
        let highest = match self.store.current_bucket().await {
            Ok(n) if n >= 1 => n,
            Ok(_) | Err(CatalogError::UninitializedSequence) => {
                return Err(CatalogError::EmptyCatalog)
            }
            Err(err) => return Err(err),
        };
        let bucket = rand::thread_rng().gen_range(1..=highest);
        self.store.random_title_in_bucket(bucket).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kleaf_catalog::{CatalogIngestor, MemoryCatalogStore, MemoryTitleSet};
    use std::collections::HashMap;

    #[tokio::test]
    async fn static_sampling_is_close_to_uniform() {
        let titles = ["Alpha", "Bravo", "Charlie", "Delta", "Echo"]
            .map(String::from)
            .to_vec();
        let source = StaticTitleSource::new(titles.clone()).unwrap();
        let draws = 50_000usize;

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..draws {
            *counts.entry(source.random_title().await.unwrap()).or_default() += 1;
        }

        let expected = draws / titles.len();
        for title in &titles {
            let observed = counts.get(title).copied().unwrap_or(0);
            let deviation = observed.abs_diff(expected);
            assert!(
                deviation < expected / 10,
                "{title}: observed {observed}, expected about {expected}"
            );
        }
    }

    #[test]
    fn static_source_rejects_an_empty_list() {
        assert!(matches!(
            StaticTitleSource::new(Vec::new()),
            Err(CatalogError::EmptyCatalog)
        ));
    }

    async fn filled_set(kind: SetKind, titles: &[&str]) -> Arc<MemoryTitleSet> {
        let set = Arc::new(MemoryTitleSet::new(kind));
        let titles = titles.iter().map(|t| t.to_string()).collect::<Vec<_>>();
        set.add_titles(&titles).await.unwrap();
        set
    }

    #[tokio::test]
    async fn concurrent_first_callers_count_the_set_once() {
        let set = filled_set(SetKind::Unordered, &["One", "Two", "Three"]).await;
        let source = Arc::new(KeyValueTitleSource::new(set.clone()));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..16 {
            let source = source.clone();
            tasks.spawn(async move { source.random_title().await });
        }
        while let Some(result) = tasks.join_next().await {
            assert!(result.unwrap().is_ok());
        }
        assert_eq!(set.cardinality_calls(), 1);
    }

    #[tokio::test]
    async fn cached_cardinality_is_not_refreshed() {
        let set = filled_set(SetKind::Ordered, &["Apple", "Banana"]).await;
        let source = KeyValueTitleSource::new(set.clone());
        source.random_title().await.unwrap();

        set.add_titles(&["Cherry".to_string(), "Damson".to_string()])
            .await
            .unwrap();
        for _ in 0..50 {
            let title = source.random_title().await.unwrap();
            // indices stay below the stale count of two
            assert!(title == "Apple" || title == "Banana");
        }
        assert_eq!(set.cardinality_calls(), 1);
    }

    #[tokio::test]
    async fn empty_key_value_set_is_an_error() {
        let set = Arc::new(MemoryTitleSet::new(SetKind::Unordered));
        let source = KeyValueTitleSource::new(set);
        assert!(matches!(
            source.random_title().await,
            Err(CatalogError::EmptyCatalog)
        ));
    }

    #[tokio::test]
    async fn relational_source_needs_an_advanced_sequence() {
        let store = Arc::new(MemoryCatalogStore::new());
        let source = RelationalTitleSource::new(store);
        assert!(matches!(
            source.random_title().await,
            Err(CatalogError::EmptyCatalog)
        ));
    }

    #[tokio::test]
    async fn relational_source_draws_ingested_titles() {
        let store = Arc::new(MemoryCatalogStore::new());
        let ingestor = CatalogIngestor::new(store.clone());
        let big = (0..60).map(|i| format!("Big_{i}")).collect::<Vec<_>>();
        ingestor.bulk_create(&big).await.unwrap();
        ingestor
            .bulk_create(&(0..60).map(|i| format!("Other_{i}")).collect::<Vec<_>>())
            .await
            .unwrap();

        let source = RelationalTitleSource::new(store.clone());
        let mut seen_buckets = std::collections::BTreeSet::new();
        for _ in 0..100 {
            let title = source.random_title().await.unwrap();
            seen_buckets.insert(store.bucket_of(&title).await.unwrap());
        }
        assert_eq!(seen_buckets.into_iter().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn relational_sampling_favors_titles_in_small_buckets() {
        let store = Arc::new(MemoryCatalogStore::new());
        let ingestor = CatalogIngestor::new(store.clone());
        // bucket 1 holds 51 titles, bucket 2 holds a single one
        ingestor
            .bulk_create(&(0..51).map(|i| format!("Crowd_{i}")).collect::<Vec<_>>())
            .await
            .unwrap();
        store.next_bucket().await.unwrap();
        ingestor.bulk_create(&["Loner".to_string()]).await.unwrap();
        assert_eq!(store.bucket_of("Loner").await, Some(2));

        let source = RelationalTitleSource::new(store);
        let draws = 2_000;
        let mut loner = 0;
        for _ in 0..draws {
            if source.random_title().await.unwrap() == "Loner" {
                loner += 1;
            }
        }
        // about half the draws, far above the 1/52 a flat sample would give
        assert!(loner > draws / 4, "Loner drawn {loner} times");
    }
}
