//! Postgres-backed catalog store.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kleaf_core::{env_or, env_parse, CatalogEntry};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use crate::{CatalogError, CatalogStore};

pub const BUCKET_SEQUENCE: &str = "catalog_bucket_seq";

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

/// Discrete connection settings read from the `POSTGRES_*` variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgresSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl Default for PostgresSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "knowledge_leaf".to_string(),
            password: String::new(),
            database: "knowledge_leaf".to_string(),
        }
    }
}

impl PostgresSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: env_or("POSTGRES_HOST", &defaults.host),
            port: env_parse("POSTGRES_PORT", defaults.port),
            user: env_or("POSTGRES_USER", &defaults.user),
            password: std::env::var("POSTGRES_PASSWORD").unwrap_or_default(),
            database: env_or("POSTGRES_DATABASE", &defaults.database),
        }
    }

    /// Field-by-field options, so credentials never pass through URL parsing.
    pub fn connect_options(&self) -> PgConnectOptions {
        let options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .database(&self.database);
        if self.password.is_empty() {
            options
        } else {
            options.password(&self.password)
        }
    }
}

/// `DATABASE_URL` when set, otherwise [`PostgresSettings::from_env`].
pub fn connect_options_from_env() -> Result<PgConnectOptions, CatalogError> {
    match std::env::var("DATABASE_URL") {
        Ok(url) if !url.trim().is_empty() => Ok(url.trim().parse::<PgConnectOptions>()?),
        _ => Ok(PostgresSettings::from_env().connect_options()),
    }
}

#[derive(Debug, Clone)]
pub struct PgCatalogStore {
    pool: PgPool,
}

impl PgCatalogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(options: PgConnectOptions) -> anyhow::Result<Self> {
        let target = format!("{}:{}", options.get_host(), options.get_port());
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to postgres at {target}"))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .context("running catalog migrations")
    }
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn count_existing(&self, titles: &[String]) -> Result<u64, CatalogError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM catalog_entries WHERE title = ANY($1)")
                .bind(titles)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }

    async fn current_bucket(&self) -> Result<i64, CatalogError> {
        // `currval` is per-session, which is meaningless behind a pool; the
        // sequence relation itself knows whether it was ever advanced.
        let (last_value, is_called): (i64, bool) = sqlx::query_as(&format!(
            "SELECT last_value, is_called FROM {BUCKET_SEQUENCE}"
        ))
        .fetch_one(&self.pool)
        .await?;
        if !is_called {
            return Err(CatalogError::UninitializedSequence);
        }
        Ok(last_value)
    }

    async fn next_bucket(&self) -> Result<i64, CatalogError> {
        let next: i64 = sqlx::query_scalar(&format!("SELECT nextval('{BUCKET_SEQUENCE}')"))
            .fetch_one(&self.pool)
            .await?;
        Ok(next)
    }

    async fn insert_skipping_duplicates(
        &self,
        entries: &[CatalogEntry],
    ) -> Result<u64, CatalogError> {
        if entries.is_empty() {
            return Ok(0);
        }
        let ids = entries.iter().map(|e| e.id).collect::<Vec<Uuid>>();
        let titles = entries.iter().map(|e| e.title.clone()).collect::<Vec<_>>();
        let buckets = entries.iter().map(|e| e.bucket_id).collect::<Vec<i64>>();
        let created = entries
            .iter()
            .map(|e| e.created_at)
            .collect::<Vec<DateTime<Utc>>>();
        let updated = entries
            .iter()
            .map(|e| e.updated_at)
            .collect::<Vec<DateTime<Utc>>>();

        let result = sqlx::query(
            r#"
            INSERT INTO catalog_entries (id, title, bucket_id, created_at, updated_at)
            SELECT * FROM UNNEST($1::uuid[], $2::text[], $3::bigint[], $4::timestamptz[], $5::timestamptz[])
            ON CONFLICT (title) DO NOTHING
            "#,
        )
        .bind(&ids)
        .bind(&titles)
        .bind(&buckets)
        .bind(&created)
        .bind(&updated)
        .execute(&self.pool)
        .await;

        insert_outcome(result.map(|done| done.rows_affected()), entries.len())
    }

    async fn random_title_in_bucket(&self, bucket: i64) -> Result<String, CatalogError> {
        let title: Option<String> = sqlx::query_scalar(
            r#"
            SELECT title
              FROM catalog_entries
             WHERE bucket_id = $1
             ORDER BY RANDOM()
             LIMIT 1
            "#,
        )
        .bind(bucket)
        .fetch_optional(&self.pool)
        .await?;
        title.ok_or(CatalogError::EmptyBucket(bucket))
    }

    async fn count_titles(&self) -> Result<u64, CatalogError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM catalog_entries")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

/// Title clashes are absorbed by `ON CONFLICT`, so a unique violation here
/// means an id clash; the batch is dropped and reported as zero rows.
fn insert_outcome(
    result: Result<u64, sqlx::Error>,
    batch_len: usize,
) -> Result<u64, CatalogError> {
    match result {
        Ok(rows) => Ok(rows),
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
            warn!(
                batch_len,
                constraint = db.constraint().unwrap_or("unknown"),
                error = %db,
                "catalog batch dropped on unique violation"
            );
            Ok(0)
        }
        Err(err) => Err(err.into()),
    }
}
