use chrono::{DateTime, Utc};

use crate::storage::{Entry, EntryTranslation};
use crate::util::source_name;

/// Platform-neutral message built from one entry for one subscription.
///
/// `title` and `summary` are what the reader sees: the translation when one
/// was available, the original text otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedMessage {
    pub title: String,
    pub summary: Option<String>,
    pub link: String,
    /// Publisher name derived from the link's domain
    pub source: String,
    /// Published time, or discovery time when the feed gave none (unix seconds)
    pub timestamp: i64,
    pub image_url: Option<String>,
    /// Target language when `title`/`summary` are translated
    pub language: Option<String>,
}

impl ComposedMessage {
    pub fn original(entry: &Entry) -> Self {
        Self {
            title: entry.title.clone(),
            summary: entry.summary.clone(),
            link: entry.link.clone(),
            source: source_name(&entry.link),
            timestamp: entry.display_time(),
            image_url: entry.image_url.clone(),
            language: None,
        }
    }

    pub fn translated(entry: &Entry, translation: &EntryTranslation) -> Self {
        Self {
            title: translation.title.clone(),
            summary: translation.summary.clone().or_else(|| entry.summary.clone()),
            language: Some(translation.language.clone()),
            ..Self::original(entry)
        }
    }

    pub fn datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.timestamp, 0)
    }

    /// `YYYY-MM-DD HH:MM` in UTC, empty for an out-of-range timestamp.
    pub fn display_time(&self) -> String {
        self.datetime()
            .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default()
    }
}
