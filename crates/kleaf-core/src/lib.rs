//! Core domain model shared by the Knowledge Leaf crates.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "kleaf-core";

pub const MIN_TITLE_CHARS: usize = 3;
pub const MAX_TITLE_CHARS: usize = 30;

/// One known subject in the catalog. `bucket_id` is shared by every entry of
/// the ingestion batch that created it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: Uuid,
    pub title: String,
    pub bucket_id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CatalogEntry {
    pub fn new(title: impl Into<String>, bucket_id: i64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            bucket_id,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thumbnail {
    pub url: String,
    pub width: u32,
    pub height: u32,
}

/// Summary and category data for one subject, merged once per request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedSummary {
    pub title: String,
    pub kind: String,
    pub extract: String,
    pub description: String,
    pub canonical_url: String,
    pub thumbnail: Thumbnail,
    pub categories: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub url: String,
    pub width: u32,
    pub height: u32,
}

impl From<Thumbnail> for Image {
    fn from(t: Thumbnail) -> Self {
        Self {
            url: t.url,
            width: t.width,
            height: t.height,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriviaMetadata {
    pub description: String,
    pub url: String,
    pub image: Image,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriviaItem {
    pub title: String,
    pub summary: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub categories: Vec<String>,
    pub metadata: TriviaMetadata,
}

impl From<MergedSummary> for TriviaItem {
    fn from(s: MergedSummary) -> Self {
        Self {
            title: s.title,
            summary: s.extract,
            kind: s.kind,
            categories: s.categories,
            metadata: TriviaMetadata {
                description: s.description,
                url: s.canonical_url,
                image: s.thumbnail.into(),
            },
        }
    }
}

/// Body of `GET /trivia/random`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandomTriviaResponse {
    pub results: Vec<TriviaItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnThisDayEventReference {
    pub title: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnThisDayEvent {
    pub title: String,
    pub short_title: String,
    pub description: String,
    pub image: Image,
    pub extract: String,
    pub url: String,
    pub references: Vec<OnThisDayEventReference>,
    pub year: i32,
}

/// Body of `GET /on-this-day/events`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventsOnThisDayResponse {
    pub titles: Vec<OnThisDayEvent>,
}

/// Normalizes one raw dump line: surrounding whitespace and every `"` are removed.
pub fn normalize_dump_line(line: &str) -> String {
    line.trim().replace('"', "")
}

/// Whether a normalized title may enter the catalog.
pub fn is_candidate_title(title: &str) -> bool {
    let chars = title.chars().count();
    (MIN_TITLE_CHARS..=MAX_TITLE_CHARS).contains(&chars) && !title.starts_with('!')
}

/// Reads a boolean flag the way the rest of the workspace does (`1`/`true`).
pub fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

pub fn env_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

pub fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

pub fn env_duration(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| parse_duration(&v))
        .unwrap_or(default)
}

/// Parses `500ms`, `15s`, `2m`, `1h` or a bare number of seconds.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let input = input.trim();
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (number, unit) = input.split_at(split);
    let value: u64 = number.parse().ok()?;
    match unit.trim() {
        "" | "s" => Some(Duration::from_secs(value)),
        "ms" => Some(Duration::from_millis(value)),
        "m" => Some(Duration::from_secs(value.checked_mul(60)?)),
        "h" => Some(Duration::from_secs(value.checked_mul(3600)?)),
        _ => None,
    }
}
