//! Titles kept as a set (or a score-ordered set) under one namespace key.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Context;
use async_trait::async_trait;
use rand::seq::IteratorRandom;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::Mutex;

use crate::CatalogError;

pub const DEFAULT_TITLE_SET_KEY: &str = "datasource:wikipedia";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetKind {
    /// Plain set; random members come straight from the backend.
    Unordered,
    /// Score-ordered set; members are read by index.
    Ordered,
}

impl FromStr for SetKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "set" | "unordered" => Ok(SetKind::Unordered),
            "sorted" | "zset" | "ordered" => Ok(SetKind::Ordered),
            other => Err(format!("unknown set kind `{other}` (expected `set` or `sorted`)")),
        }
    }
}

#[async_trait]
pub trait TitleSet: Send + Sync {
    fn kind(&self) -> SetKind;

    async fn cardinality(&self) -> Result<u64, CatalogError>;

    async fn random_member(&self) -> Result<Option<String>, CatalogError>;

    /// Member at `index` in score order. Only meaningful for [`SetKind::Ordered`].
    async fn member_at(&self, index: u64) -> Result<Option<String>, CatalogError>;

    /// Returns how many titles were not present before.
    async fn add_titles(&self, titles: &[String]) -> Result<u64, CatalogError>;
}

#[derive(Clone)]
pub struct RedisTitleSet {
    conn: ConnectionManager,
    key: String,
    kind: SetKind,
}

impl RedisTitleSet {
    pub async fn connect(dsn: &str, key: impl Into<String>, kind: SetKind) -> anyhow::Result<Self> {
        let client = redis::Client::open(dsn).context("parsing redis dsn")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("connecting to redis")?;
        Ok(Self {
            conn,
            key: key.into(),
            kind,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

#[async_trait]
impl TitleSet for RedisTitleSet {
    fn kind(&self) -> SetKind {
        self.kind
    }

    async fn cardinality(&self) -> Result<u64, CatalogError> {
        let mut conn = self.conn.clone();
        let n: u64 = match self.kind {
            SetKind::Unordered => conn.scard(&self.key).await?,
            SetKind::Ordered => conn.zcard(&self.key).await?,
        };
        Ok(n)
    }

    async fn random_member(&self) -> Result<Option<String>, CatalogError> {
        let mut conn = self.conn.clone();
        let member: Option<String> = match self.kind {
            SetKind::Unordered => conn.srandmember(&self.key).await?,
            SetKind::Ordered => conn.zrandmember(&self.key, None).await?,
        };
        Ok(member)
    }

    async fn member_at(&self, index: u64) -> Result<Option<String>, CatalogError> {
        if self.kind != SetKind::Ordered {
            return Err(CatalogError::Unsupported("indexed reads on an unordered set"));
        }
        let mut conn = self.conn.clone();
        let idx = index as isize;
        let members: Vec<String> = conn.zrange(&self.key, idx, idx).await?;
        Ok(members.into_iter().next())
    }

    async fn add_titles(&self, titles: &[String]) -> Result<u64, CatalogError> {
        if titles.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let added: u64 = match self.kind {
            SetKind::Unordered => conn.sadd(&self.key, titles).await?,
            SetKind::Ordered => {
                // Equal scores keep members in lexicographic order.
                let members = titles.iter().map(|t| (0i64, t.as_str())).collect::<Vec<_>>();
                conn.zadd_multiple(&self.key, &members).await?
            }
        };
        Ok(added)
    }
}

/// In-process title set; ordered form keeps members lexicographically sorted.
#[derive(Debug)]
pub struct MemoryTitleSet {
    kind: SetKind,
    titles: Mutex<BTreeSet<String>>,
    cardinality_calls: AtomicUsize,
}

impl MemoryTitleSet {
    pub fn new(kind: SetKind) -> Self {
        Self {
            kind,
            titles: Mutex::new(BTreeSet::new()),
            cardinality_calls: AtomicUsize::new(0),
        }
    }

    /// How many times the cardinality was queried.
    pub fn cardinality_calls(&self) -> usize {
        self.cardinality_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TitleSet for MemoryTitleSet {
    fn kind(&self) -> SetKind {
        self.kind
    }

    async fn cardinality(&self) -> Result<u64, CatalogError> {
        self.cardinality_calls.fetch_add(1, Ordering::SeqCst);
        // Yield so concurrent first callers genuinely overlap.
        tokio::task::yield_now().await;
        Ok(self.titles.lock().await.len() as u64)
    }

    async fn random_member(&self) -> Result<Option<String>, CatalogError> {
        let titles = self.titles.lock().await;
        Ok(titles.iter().choose(&mut rand::thread_rng()).cloned())
    }

    async fn member_at(&self, index: u64) -> Result<Option<String>, CatalogError> {
        if self.kind != SetKind::Ordered {
            return Err(CatalogError::Unsupported("indexed reads on an unordered set"));
        }
        let titles = self.titles.lock().await;
        Ok(titles.iter().nth(index as usize).cloned())
    }

    async fn add_titles(&self, titles: &[String]) -> Result<u64, CatalogError> {
        let mut set = self.titles.lock().await;
        Ok(titles.iter().filter(|t| set.insert((*t).clone())).count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_kind_parses_config_values() {
        assert_eq!("set".parse::<SetKind>().unwrap(), SetKind::Unordered);
        assert_eq!("Sorted".parse::<SetKind>().unwrap(), SetKind::Ordered);
        assert!("list".parse::<SetKind>().is_err());
    }

    #[tokio::test]
    async fn memory_set_counts_new_members_only() {
        let set = MemoryTitleSet::new(SetKind::Ordered);
        let added = set
            .add_titles(&["Beta".into(), "Alpha".into(), "Beta".into()])
            .await
            .unwrap();
        assert_eq!(added, 2);
        assert_eq!(set.add_titles(&["Alpha".into()]).await.unwrap(), 0);
        assert_eq!(set.member_at(0).await.unwrap().as_deref(), Some("Alpha"));
        assert_eq!(set.member_at(5).await.unwrap(), None);
    }

    #[tokio::test]
    async fn unordered_set_rejects_indexed_reads() {
        let set = MemoryTitleSet::new(SetKind::Unordered);
        set.add_titles(&["Gamma".into()]).await.unwrap();
        assert!(matches!(
            set.member_at(0).await,
            Err(CatalogError::Unsupported(_))
        ));
        assert_eq!(set.random_member().await.unwrap().as_deref(), Some("Gamma"));
    }
}
