//! Dump ingestion: normalize and filter each line, batch distinct titles and
//! hand every batch to a [`TitleSink`] in order.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use kleaf_core::{env_duration, env_flag, env_or, env_parse, is_candidate_title, normalize_dump_line};
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info};

use crate::{CatalogError, CatalogIngestor, TitleSet};

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub batch_size: usize,
    pub timeout: Duration,
    pub skip_header: bool,
    pub cron: String,
    pub scheduler_enabled: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            timeout: Duration::from_secs(60 * 60),
            skip_header: true,
            cron: "0 0 3 * * Sun".to_string(),
            scheduler_enabled: false,
        }
    }
}

impl IngestConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            batch_size: env_parse("INGEST_BATCH_SIZE", defaults.batch_size).max(1),
            timeout: env_duration("INGEST_TIMEOUT", defaults.timeout),
            skip_header: env_parse("INGEST_SKIP_HEADER", defaults.skip_header),
            cron: env_or("INGEST_CRON", &defaults.cron),
            scheduler_enabled: env_flag("INGEST_SCHEDULER_ENABLED"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub lines_read: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub batches: u64,
    pub inserted: u64,
}

/// Destination of ingested batches.
#[async_trait]
pub trait TitleSink: Send + Sync {
    fn name(&self) -> &'static str;

    /// Persists one batch and returns how many titles were new.
    async fn accept(&self, batch: &[String]) -> Result<u64, CatalogError>;
}

#[async_trait]
impl TitleSink for CatalogIngestor {
    fn name(&self) -> &'static str {
        "catalog"
    }

    async fn accept(&self, batch: &[String]) -> Result<u64, CatalogError> {
        Ok(self.bulk_create(batch).await?.inserted)
    }
}

/// Loads batches into the key-value title set.
pub struct KeyValueLoader {
    set: Arc<dyn TitleSet>,
}

impl KeyValueLoader {
    pub fn new(set: Arc<dyn TitleSet>) -> Self {
        Self { set }
    }
}

#[async_trait]
impl TitleSink for KeyValueLoader {
    fn name(&self) -> &'static str {
        "key-value set"
    }

    async fn accept(&self, batch: &[String]) -> Result<u64, CatalogError> {
        self.set.add_titles(batch).await
    }
}

/// Lines that are not valid UTF-8 count as rejected.
pub async fn ingest_lines<R>(
    mut reader: R,
    sink: &dyn TitleSink,
    config: &IngestConfig,
) -> Result<IngestReport>
where
    R: AsyncBufRead + Unpin,
{
    let mut report = IngestReport::default();
    let mut batch = BTreeSet::new();
    let mut header_pending = config.skip_header;
    let mut raw = Vec::new();

    loop {
        raw.clear();
        let read = reader
            .read_until(b'\n', &mut raw)
            .await
            .context("reading dump line")?;
        if read == 0 {
            break;
        }
        if header_pending {
            header_pending = false;
            continue;
        }
        report.lines_read += 1;

        let Ok(line) = std::str::from_utf8(&raw) else {
            debug!(line = report.lines_read, "skipping line that is not valid UTF-8");
            report.rejected += 1;
            continue;
        };
        let title = normalize_dump_line(line);
        if !is_candidate_title(&title) {
            report.rejected += 1;
            continue;
        }
        report.accepted += 1;
        batch.insert(title);

        if batch.len() >= config.batch_size {
            flush(&mut batch, sink, &mut report).await?;
        }
    }
    flush(&mut batch, sink, &mut report).await?;

    info!(
        sink = sink.name(),
        lines_read = report.lines_read,
        accepted = report.accepted,
        rejected = report.rejected,
        batches = report.batches,
        inserted = report.inserted,
        "ingestion finished"
    );
    Ok(report)
}

/// [`ingest_lines`] bounded by the ingestion timeout.
pub async fn ingest_with_timeout<R>(
    reader: R,
    sink: &dyn TitleSink,
    config: &IngestConfig,
) -> Result<IngestReport>
where
    R: AsyncBufRead + Unpin,
{
    tokio::time::timeout(config.timeout, ingest_lines(reader, sink, config))
        .await
        .with_context(|| format!("ingestion exceeded {:?}", config.timeout))?
}

async fn flush(
    batch: &mut BTreeSet<String>,
    sink: &dyn TitleSink,
    report: &mut IngestReport,
) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }
    let titles = std::mem::take(batch).into_iter().collect::<Vec<_>>();
    let inserted = sink
        .accept(&titles)
        .await
        .with_context(|| format!("persisting batch {} into {}", report.batches + 1, sink.name()))?;
    report.batches += 1;
    report.inserted += inserted;
    if report.batches % 10 == 0 {
        info!(
            batches = report.batches,
            accepted = report.accepted,
            inserted = report.inserted,
            "ingestion progress"
        );
    }
    Ok(())
}

/// Builds a cron scheduler running `run` on `config.cron`, or `None` when disabled.
pub async fn build_ingest_scheduler<F, Fut>(
    config: &IngestConfig,
    run: F,
) -> Result<Option<JobScheduler>>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<IngestReport>> + Send + 'static,
{
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let run = Arc::new(run);
    let job = Job::new_async(config.cron.as_str(), move |_uuid, _lock| {
        let run = run.clone();
        Box::pin(async move {
            match run().await {
                Ok(report) => info!(inserted = report.inserted, "scheduled ingestion finished"),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled ingestion failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {}", config.cron))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
