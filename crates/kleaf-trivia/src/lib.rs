//! Random subject selection and trivia summary aggregation.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use kleaf_catalog::kv::DEFAULT_TITLE_SET_KEY;
use kleaf_catalog::{
    connect_options_from_env, CatalogError, PgCatalogStore, PgConnectOptions, RedisTitleSet,
    SetKind,
};
use kleaf_core::{env_flag, env_or};
use tracing::info;

mod aggregate;
mod source;

pub use aggregate::{
    merge_summary, normalize_categories, SummaryAggregator, TriviaError, TriviaService,
    CATEGORY_PREFIX, MAX_TRIES,
};
pub use source::{load_sample_titles, KeyValueTitleSource, RelationalTitleSource, StaticTitleSource};

pub const CRATE_NAME: &str = "kleaf-trivia";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TitleBackendKind {
    Static,
    KeyValue,
    Relational,
}

impl FromStr for TitleBackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "static" => Ok(TitleBackendKind::Static),
            "redis" | "kv" | "key-value" => Ok(TitleBackendKind::KeyValue),
            "postgres" | "relational" => Ok(TitleBackendKind::Relational),
            other => Err(format!(
                "unknown title backend `{other}` (expected static, redis or postgres)"
            )),
        }
    }
}

/// Source of random subjects. The variant is fixed at construction.
#[async_trait]
pub trait TitleSource: Send + Sync {
    fn backend(&self) -> TitleBackendKind;

    async fn random_title(&self) -> Result<String, CatalogError>;
}

#[derive(Debug, Clone)]
pub struct TriviaConfig {
    pub backend: TitleBackendKind,
    pub sample_titles_path: PathBuf,
    pub redis_dsn: String,
    pub redis_key: String,
    pub redis_set_kind: SetKind,
    pub database: PgConnectOptions,
}

impl TriviaConfig {
    pub fn from_env() -> Result<Self> {
        let backend = match std::env::var("TITLE_BACKEND") {
            Ok(v) if !v.trim().is_empty() => v.parse().map_err(anyhow::Error::msg)?,
            _ if env_flag("POSTGRES_ENABLED") => TitleBackendKind::Relational,
            _ if env_flag("USE_REDIS") => TitleBackendKind::KeyValue,
            _ => TitleBackendKind::Static,
        };
        let redis_set_kind = env_or("REDIS_SET_KIND", "set")
            .parse()
            .map_err(anyhow::Error::msg)?;
        Ok(Self {
            backend,
            sample_titles_path: PathBuf::from(env_or("SAMPLE_TITLES_PATH", "data/sample_titles.json")),
            redis_dsn: env_or("REDIS_DSN", "redis://localhost:6379"),
            redis_key: env_or("REDIS_KEY", DEFAULT_TITLE_SET_KEY),
            redis_set_kind,
            database: connect_options_from_env().context("reading postgres settings")?,
        })
    }
}

/// Builds the configured [`TitleSource`], connecting to its backend.
pub async fn build_title_source(config: &TriviaConfig) -> Result<Arc<dyn TitleSource>> {
    info!(backend = ?config.backend, "building title source");
    let source: Arc<dyn TitleSource> = match config.backend {
        TitleBackendKind::Static => {
            let titles = load_sample_titles(&config.sample_titles_path).await?;
            let source = StaticTitleSource::new(titles).with_context(|| {
                format!("no titles in {}", config.sample_titles_path.display())
            })?;
            Arc::new(source)
        }
        TitleBackendKind::KeyValue => {
            let set = RedisTitleSet::connect(
                &config.redis_dsn,
                config.redis_key.clone(),
                config.redis_set_kind,
            )
            .await?;
            Arc::new(KeyValueTitleSource::new(Arc::new(set)))
        }
        TitleBackendKind::Relational => {
            let store = PgCatalogStore::connect(config.database.clone()).await?;
            Arc::new(RelationalTitleSource::new(Arc::new(store)))
        }
    };
    Ok(source)
}
