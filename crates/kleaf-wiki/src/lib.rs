//! Outbound client for the encyclopedia API: page summaries, page categories,
//! the "on this day" feed and the bulk title dump.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_compression::tokio::bufread::GzipDecoder;
use async_trait::async_trait;
use futures::TryStreamExt;
use kleaf_core::{env_or, env_parse};
use reqwest::{StatusCode, Url};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncBufRead, BufReader};
use tokio::sync::Semaphore;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug_span, Instrument};

pub const CRATE_NAME: &str = "kleaf-wiki";

pub const DEFAULT_SUMMARY_ENDPOINT: &str = "https://en.wikipedia.org/api/rest_v1/page/summary";
pub const DEFAULT_API_ENDPOINT: &str = "https://en.wikipedia.org/w/api.php";
pub const DEFAULT_FEED_ENDPOINT: &str = "https://en.wikipedia.org/api/rest_v1/feed/onthisday";
pub const DEFAULT_DUMP_URL: &str =
    "https://dumps.wikimedia.org/enwiki/latest/enwiki-latest-all-titles-in-ns0.gz";
pub const DEFAULT_USER_AGENT: &str = "knowledge-leaf-client/1.0";

/// Line-oriented, already decompressed dump body.
pub type DumpReader = Box<dyn AsyncBufRead + Send + Unpin>;

#[derive(Debug, Error)]
pub enum WikiError {
    #[error("subject not found: {subject}")]
    NotFound { subject: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid endpoint {0}")]
    InvalidEndpoint(String),
    #[error("request cancelled")]
    Cancelled,
}

impl WikiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, WikiError::NotFound { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, WikiError::Cancelled)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ImageRef {
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PageUrls {
    #[serde(default)]
    pub page: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ContentUrls {
    #[serde(default)]
    pub desktop: PageUrls,
    #[serde(default)]
    pub mobile: PageUrls,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PageTitles {
    #[serde(default)]
    pub canonical: String,
    #[serde(default)]
    pub normalized: String,
    #[serde(default)]
    pub display: String,
}

/// Subset of the REST v1 page summary record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PageSummary {
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub extract: String,
    #[serde(default)]
    pub thumbnail: Option<ImageRef>,
    #[serde(default)]
    pub content_urls: ContentUrls,
}

#[derive(Debug, Deserialize)]
struct CategoriesResponse {
    #[serde(default)]
    query: Option<CategoriesQuery>,
}

#[derive(Debug, Deserialize)]
struct CategoriesQuery {
    #[serde(default)]
    pages: BTreeMap<String, CategoriesPage>,
}

#[derive(Debug, Deserialize)]
struct CategoriesPage {
    #[serde(default)]
    missing: Option<IgnoredAny>,
    #[serde(default)]
    categories: Vec<CategoryRef>,
}

#[derive(Debug, Deserialize)]
struct CategoryRef {
    title: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FeedPage {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub titles: PageTitles,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub extract: String,
    #[serde(default)]
    pub thumbnail: Option<ImageRef>,
    #[serde(default)]
    pub content_urls: ContentUrls,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FeedEvent {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub pages: Vec<FeedPage>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct OnThisDayFeed {
    #[serde(default)]
    pub events: Vec<FeedEvent>,
}

/// The encyclopedia as seen by the rest of the workspace.
#[async_trait]
pub trait EncyclopediaClient: Send + Sync {
    async fn summary(
        &self,
        subject: &str,
        cancel: &CancellationToken,
    ) -> Result<PageSummary, WikiError>;

    /// Raw category labels, still carrying their namespace prefix.
    async fn categories(
        &self,
        subject: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, WikiError>;

    async fn on_this_day(
        &self,
        month: u32,
        day: u32,
        cancel: &CancellationToken,
    ) -> Result<OnThisDayFeed, WikiError>;

    async fn dump(&self) -> Result<DumpReader, WikiError>;
}

#[derive(Debug, Clone)]
pub struct WikiClientConfig {
    pub summary_endpoint: String,
    pub api_endpoint: String,
    pub feed_endpoint: String,
    pub dump_url: String,
    pub user_agent: String,
    pub timeout: Duration,
    pub max_concurrency: usize,
}

impl Default for WikiClientConfig {
    fn default() -> Self {
        Self {
            summary_endpoint: DEFAULT_SUMMARY_ENDPOINT.to_string(),
            api_endpoint: DEFAULT_API_ENDPOINT.to_string(),
            feed_endpoint: DEFAULT_FEED_ENDPOINT.to_string(),
            dump_url: DEFAULT_DUMP_URL.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: Duration::from_secs(20),
            max_concurrency: 16,
        }
    }
}

impl WikiClientConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            summary_endpoint: env_or("WIKI_SUMMARY_ENDPOINT", &defaults.summary_endpoint),
            api_endpoint: env_or("WIKI_API_ENDPOINT", &defaults.api_endpoint),
            feed_endpoint: env_or("WIKI_FEED_ENDPOINT", &defaults.feed_endpoint),
            dump_url: env_or("WIKI_DUMP_URL", &defaults.dump_url),
            user_agent: env_or("WIKI_USER_AGENT", &defaults.user_agent),
            timeout: Duration::from_secs(env_parse("WIKI_HTTP_TIMEOUT_SECS", 20)),
            max_concurrency: env_parse("WIKI_MAX_CONCURRENCY", defaults.max_concurrency),
        }
    }
}

#[derive(Debug)]
pub struct WikipediaClient {
    client: reqwest::Client,
    dump_client: reqwest::Client,
    limit: Arc<Semaphore>,
    config: WikiClientConfig,
}

impl WikipediaClient {
    pub fn new(config: WikiClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;
        // The dump body streams for minutes; only the connect phase is bounded here.
        let dump_client = reqwest::Client::builder()
            .no_gzip()
            .connect_timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building dump reqwest client")?;

        Ok(Self {
            client,
            dump_client,
            limit: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            config,
        })
    }

    pub fn config(&self) -> &WikiClientConfig {
        &self.config
    }

    fn summary_url(&self, subject: &str) -> Result<Url, WikiError> {
        let mut url = parse_endpoint(&self.config.summary_endpoint)?;
        url.path_segments_mut()
            .map_err(|_| WikiError::InvalidEndpoint(self.config.summary_endpoint.clone()))?
            .pop_if_empty()
            .push(subject);
        Ok(url)
    }

    fn categories_url(&self, subject: &str) -> Result<Url, WikiError> {
        Url::parse_with_params(
            &self.config.api_endpoint,
            &[
                ("format", "json"),
                ("action", "query"),
                ("prop", "categories"),
                ("clprop", "timestamp"),
                ("clshow", "!hidden"),
                ("cllimit", "5"),
                ("titles", subject),
            ],
        )
        .map_err(|_| WikiError::InvalidEndpoint(self.config.api_endpoint.clone()))
    }

    fn on_this_day_url(&self, month: u32, day: u32) -> Result<Url, WikiError> {
        let mut url = parse_endpoint(&self.config.feed_endpoint)?;
        url.path_segments_mut()
            .map_err(|_| WikiError::InvalidEndpoint(self.config.feed_endpoint.clone()))?
            .pop_if_empty()
            .push("events")
            .push(&format!("{month:02}"))
            .push(&format!("{day:02}"));
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: Url,
        subject: &str,
        cancel: &CancellationToken,
    ) -> Result<T, WikiError> {
        let span = debug_span!("wiki_request", url = %url, subject);
        let request = async {
            let _permit = self
                .limit
                .acquire()
                .await
                .map_err(|_| WikiError::Cancelled)?;
            let resp = self.client.get(url.clone()).send().await?;
            let status = resp.status();
            if status == StatusCode::NOT_FOUND {
                return Err(WikiError::NotFound {
                    subject: subject.to_string(),
                });
            }
            if !status.is_success() {
                return Err(WikiError::HttpStatus {
                    status: status.as_u16(),
                    url: resp.url().to_string(),
                });
            }
            let body = resp.bytes().await?;
            serde_json::from_slice(&body).map_err(|source| WikiError::Decode {
                url: url.to_string(),
                source,
            })
        }
        .instrument(span);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(WikiError::Cancelled),
            result = request => result,
        }
    }
}

#[async_trait]
impl EncyclopediaClient for WikipediaClient {
    async fn summary(
        &self,
        subject: &str,
        cancel: &CancellationToken,
    ) -> Result<PageSummary, WikiError> {
        let url = self.summary_url(subject)?;
        self.get_json(url, subject, cancel).await
    }

    async fn categories(
        &self,
        subject: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, WikiError> {
        let url = self.categories_url(subject)?;
        let resp: CategoriesResponse = self.get_json(url, subject, cancel).await?;
        let pages = resp.query.map(|q| q.pages).unwrap_or_default();
        if !pages.is_empty() && pages.values().all(|p| p.missing.is_some()) {
            return Err(WikiError::NotFound {
                subject: subject.to_string(),
            });
        }
        Ok(pages
            .into_values()
            .flat_map(|p| p.categories.into_iter().map(|c| c.title))
            .collect())
    }

    async fn on_this_day(
        &self,
        month: u32,
        day: u32,
        cancel: &CancellationToken,
    ) -> Result<OnThisDayFeed, WikiError> {
        let url = self.on_this_day_url(month, day)?;
        self.get_json(url, "on-this-day", cancel).await
    }

    async fn dump(&self) -> Result<DumpReader, WikiError> {
        let resp = self.dump_client.get(&self.config.dump_url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(WikiError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        let gzip = is_gzip_path(resp.url().path());
        let stream = resp.bytes_stream().map_err(std::io::Error::other);
        let reader = StreamReader::new(Box::pin(stream));
        Ok(if gzip {
            Box::new(BufReader::new(GzipDecoder::new(reader)))
        } else {
            Box::new(reader)
        })
    }
}

/// Opens a dump stored on disk, decompressing `.gz` files on the fly.
pub async fn open_dump_file(path: impl AsRef<Path>) -> anyhow::Result<DumpReader> {
    let path = path.as_ref();
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("opening dump file {}", path.display()))?;
    let reader = BufReader::new(file);
    Ok(if is_gzip_path(&path.to_string_lossy()) {
        Box::new(BufReader::new(GzipDecoder::new(reader)))
    } else {
        Box::new(reader)
    })
}

fn is_gzip_path(path: &str) -> bool {
    path.ends_with(".gz")
}

fn parse_endpoint(endpoint: &str) -> Result<Url, WikiError> {
    Url::parse(endpoint).map_err(|_| WikiError::InvalidEndpoint(endpoint.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_compression::tokio::write::GzipEncoder;
    use axum::{extract::Path as AxumPath, http::StatusCode as AxumStatus, routing::get, Json, Router};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

    async fn spawn_upstream(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn client_for(base: &str) -> WikipediaClient {
        WikipediaClient::new(WikiClientConfig {
            summary_endpoint: format!("{base}/page/summary"),
            api_endpoint: format!("{base}/w/api.php"),
            feed_endpoint: format!("{base}/feed/onthisday"),
            dump_url: format!("{base}/dump/titles.gz"),
            timeout: Duration::from_secs(5),
            ..Default::default()
        })
        .unwrap()
    }

    async fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = GzipEncoder::new(Vec::new());
        encoder.write_all(bytes).await.unwrap();
        encoder.shutdown().await.unwrap();
        encoder.into_inner()
    }

    async fn read_lines(reader: DumpReader) -> Vec<String> {
        let mut lines = reader.lines();
        let mut out = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            out.push(line);
        }
        out
    }

    #[tokio::test]
    async fn summary_decodes_record_and_escapes_subject() {
        let router = Router::new().route(
            "/page/summary/{title}",
            get(|AxumPath(title): AxumPath<String>| async move {
                Json(serde_json::json!({
                    "type": "standard",
                    "title": title,
                    "description": "A test page",
                    "extract": "Some text.",
                    "thumbnail": {"source": "https://img/x.png", "width": 10, "height": 20},
                    "content_urls": {"desktop": {"page": "https://wiki/AC/DC"}}
                }))
            }),
        );
        let base = spawn_upstream(router).await;
        let client = client_for(&base);

        let summary = client
            .summary("AC/DC", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.title, "AC/DC");
        assert_eq!(summary.kind, "standard");
        assert_eq!(summary.content_urls.desktop.page, "https://wiki/AC/DC");
        assert_eq!(summary.thumbnail.unwrap().height, 20);
    }

    #[tokio::test]
    async fn missing_summary_maps_to_not_found() {
        let router = Router::new().route(
            "/page/summary/{title}",
            get(|| async { (AxumStatus::NOT_FOUND, "nope") }),
        );
        let base = spawn_upstream(router).await;
        let err = client_for(&base)
            .summary("Nowhere_Land", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn server_errors_are_not_not_found() {
        let router = Router::new().route(
            "/page/summary/{title}",
            get(|| async { (AxumStatus::BAD_GATEWAY, "down") }),
        );
        let base = spawn_upstream(router).await;
        let err = client_for(&base)
            .summary("Anything", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WikiError::HttpStatus { status: 502, .. }));
    }

    #[tokio::test]
    async fn categories_return_raw_labels_across_pages() {
        let router = Router::new().route(
            "/w/api.php",
            get(|| async {
                Json(serde_json::json!({
                    "query": {"pages": {"42": {
                        "pageid": 42,
                        "title": "Zebra",
                        "categories": [
                            {"ns": 14, "title": "Category:Zebras"},
                            {"ns": 14, "title": "Category:Equus"}
                        ]
                    }}}
                }))
            }),
        );
        let base = spawn_upstream(router).await;
        let labels = client_for(&base)
            .categories("Zebra", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(labels, vec!["Category:Zebras", "Category:Equus"]);
    }

    #[tokio::test]
    async fn categories_for_missing_page_are_not_found() {
        let router = Router::new().route(
            "/w/api.php",
            get(|| async {
                Json(serde_json::json!({
                    "query": {"pages": {"-1": {"ns": 0, "title": "Nope", "missing": ""}}}
                }))
            }),
        );
        let base = spawn_upstream(router).await;
        let err = client_for(&base)
            .categories("Nope", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits_request() {
        let router = Router::new().route(
            "/page/summary/{title}",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                "late"
            }),
        );
        let base = spawn_upstream(router).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = client_for(&base).summary("Slow", &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn on_this_day_uses_zero_padded_date() {
        let router = Router::new().route(
            "/feed/onthisday/events/{month}/{day}",
            get(|AxumPath((month, day)): AxumPath<(String, String)>| async move {
                Json(serde_json::json!({
                    "events": [{"text": format!("{month}-{day}"), "year": 1969, "pages": []}]
                }))
            }),
        );
        let base = spawn_upstream(router).await;
        let feed = client_for(&base)
            .on_this_day(7, 4, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(feed.events[0].text, "07-04");
        assert_eq!(feed.events[0].year, Some(1969));
    }

    #[tokio::test]
    async fn dump_stream_is_gunzipped() {
        let body = gzip(b"page_title\nAlpha\nBeta\n").await;
        let router = Router::new().route(
            "/dump/titles.gz",
            get(move || {
                let body = body.clone();
                async move { body }
            }),
        );
        let base = spawn_upstream(router).await;
        let reader = client_for(&base).dump().await.unwrap();
        assert_eq!(read_lines(reader).await, vec!["page_title", "Alpha", "Beta"]);
    }

    #[tokio::test]
    async fn dump_files_on_disk_are_read_plain_or_gzipped() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("titles.txt");
        let packed = dir.path().join("titles.gz");
        tokio::fs::write(&plain, b"One\nTwo\n").await.unwrap();
        tokio::fs::write(&packed, gzip(b"Three\n").await).await.unwrap();

        assert_eq!(
            read_lines(open_dump_file(&plain).await.unwrap()).await,
            vec!["One", "Two"]
        );
        assert_eq!(
            read_lines(open_dump_file(&packed).await.unwrap()).await,
            vec!["Three"]
        );
    }
}
