use std::sync::Arc;

use kleaf_catalog::CatalogError;
use kleaf_core::{MergedSummary, Thumbnail};
use kleaf_wiki::{EncyclopediaClient, OnThisDayFeed, PageSummary, WikiError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Span};

use crate::TitleSource;

/// Namespace prefix carried by every raw category label.
pub const CATEGORY_PREFIX: &str = "Category:";

/// Total attempts per request, the first one included.
pub const MAX_TRIES: usize = 2;

#[derive(Debug, Error)]
pub enum TriviaError {
    #[error("drawing a subject: {0}")]
    Source(#[from] CatalogError),
    #[error(transparent)]
    Encyclopedia(#[from] WikiError),
    #[error("request cancelled")]
    Cancelled,
}

impl TriviaError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, TriviaError::Encyclopedia(err) if err.is_not_found())
    }
}

/// Strips [`CATEGORY_PREFIX`] from each label and sorts the result.
pub fn normalize_categories(raw: Vec<String>) -> Vec<String> {
    let mut categories = raw
        .into_iter()
        .map(|label| match label.strip_prefix(CATEGORY_PREFIX) {
            Some(rest) => rest.to_string(),
            None => label,
        })
        .collect::<Vec<_>>();
    categories.sort();
    categories
}

pub fn merge_summary(summary: PageSummary, categories: Vec<String>) -> MergedSummary {
    let thumbnail = summary
        .thumbnail
        .map(|t| Thumbnail {
            url: t.source,
            width: t.width,
            height: t.height,
        })
        .unwrap_or_default();
    MergedSummary {
        title: summary.title,
        kind: summary.kind,
        extract: summary.extract,
        description: summary.description,
        canonical_url: summary.content_urls.desktop.page,
        thumbnail,
        categories,
    }
}

/// Fetches summary and categories for one subject as a fail-fast pair.
#[derive(Clone)]
pub struct SummaryAggregator {
    client: Arc<dyn EncyclopediaClient>,
}

impl SummaryAggregator {
    pub fn new(client: Arc<dyn EncyclopediaClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Arc<dyn EncyclopediaClient> {
        &self.client
    }

    /// Both sub-requests share a child of `cancel`; whichever fails first
    /// cancels it so the other one is abandoned.
    pub async fn fetch(
        &self,
        subject: &str,
        cancel: &CancellationToken,
    ) -> Result<MergedSummary, WikiError> {
        let shared = cancel.child_token();

        let summary = async {
            let result = self.client.summary(subject, &shared).await;
            if result.is_err() {
                shared.cancel();
            }
            result
        };
        let categories = async {
            let result = self.client.categories(subject, &shared).await;
            if result.is_err() {
                shared.cancel();
            }
            result
        };

        match tokio::join!(summary, categories) {
            (Ok(summary), Ok(categories)) => {
                Ok(merge_summary(summary, normalize_categories(categories)))
            }
            // the side that tripped the token is the one that did not see it
            (Err(a), Err(b)) if a.is_cancelled() && !b.is_cancelled() => Err(b),
            (Err(err), _) | (_, Err(err)) => Err(err),
        }
    }
}

/// Draws a subject and aggregates its summary, drawing again when the
/// encyclopedia does not know the subject.
pub struct TriviaService {
    source: Arc<dyn TitleSource>,
    aggregator: SummaryAggregator,
    max_tries: usize,
}

impl TriviaService {
    pub fn new(source: Arc<dyn TitleSource>, client: Arc<dyn EncyclopediaClient>) -> Self {
        Self {
            source,
            aggregator: SummaryAggregator::new(client),
            max_tries: MAX_TRIES,
        }
    }

    pub fn with_max_tries(mut self, max_tries: usize) -> Self {
        self.max_tries = max_tries.max(1);
        self
    }

    pub fn source(&self) -> &Arc<dyn TitleSource> {
        &self.source
    }

    pub fn client(&self) -> &Arc<dyn EncyclopediaClient> {
        self.aggregator.client()
    }

    pub async fn random_trivia(
        &self,
        cancel: &CancellationToken,
        span: &Span,
    ) -> Result<MergedSummary, TriviaError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let subject = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TriviaError::Cancelled),
                title = self.source.random_title() => title?,
            };

            match self.aggregator.fetch(&subject, cancel).await {
                Ok(summary) => {
                    debug!(parent: span, title = %subject, attempt, "trivia resolved");
                    return Ok(summary);
                }
                Err(err) if err.is_not_found() && attempt < self.max_tries => {
                    info!(parent: span, title = %subject, "page not found - retrying");
                }
                Err(err) if err.is_cancelled() => return Err(TriviaError::Cancelled),
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub async fn on_this_day(
        &self,
        month: u32,
        day: u32,
        cancel: &CancellationToken,
    ) -> Result<OnThisDayFeed, TriviaError> {
        match self.client().on_this_day(month, day, cancel).await {
            Ok(feed) => Ok(feed),
            Err(err) if err.is_cancelled() => Err(TriviaError::Cancelled),
            Err(err) => Err(err.into()),
        }
    }
}
