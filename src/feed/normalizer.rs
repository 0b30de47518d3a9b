//! Raw feed items to canonical, deduplicated entries.
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use std::collections::HashSet;
use thiserror::Error;
use url::Url;

use super::parser::RawItem;
use crate::storage::{Database, Entry, Feed, NewEntry};
use crate::util::{first_image_src, html_to_text, sha256_hex, truncate_chars, UNTITLED};

/// Longest stored title, in characters
pub const MAX_TITLE_CHARS: usize = 256;
/// Longest stored summary, in characters
pub const MAX_SUMMARY_CHARS: usize = 1024;

/// Naive layouts tried after RFC 3339 and RFC 2822. Read as UTC.
const NAIVE_DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];
const NAIVE_DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("Database error: {0}")]
    Database(String),
}

/// Clean `items`, drop the ones already stored for `feed`, and persist the rest.
///
/// Returns the newly inserted entries in emission order: by published time,
/// then source order, with undated entries last.
pub async fn normalize(
    db: &Database,
    feed: &Feed,
    items: Vec<RawItem>,
    discovered_at: i64,
) -> Result<Vec<Entry>, NormalizeError> {
    let candidates = canonicalize(feed, items);
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    let keys: Vec<&str> = candidates.iter().map(|e| e.guid.as_str()).collect();
    let existing = db
        .existing_guids(feed.id, &keys)
        .await
        .map_err(|e| NormalizeError::Database(e.to_string()))?;

    let fresh: Vec<NewEntry> = candidates
        .into_iter()
        .filter(|e| !existing.contains(&e.guid))
        .collect();
    if fresh.is_empty() {
        tracing::debug!(feed_id = feed.id, "No unseen items");
        return Ok(Vec::new());
    }

    // Insert-if-absent also covers rows that appeared since the lookup above.
    let inserted = db
        .insert_entries_if_absent(feed.id, &fresh, discovered_at)
        .await
        .map_err(|e| NormalizeError::Database(e.to_string()))?;

    tracing::debug!(
        feed_id = feed.id,
        candidates = fresh.len(),
        inserted = inserted.len(),
        "Stored new entries"
    );
    Ok(inserted)
}

/// Turn raw items into canonical entries without touching storage.
///
/// Duplicate identity keys within the batch collapse to the first occurrence.
/// The result is in emission order.
pub fn canonicalize(feed: &Feed, items: Vec<RawItem>) -> Vec<NewEntry> {
    let base = base_url(feed);
    let mut seen = HashSet::new();
    let mut entries: Vec<NewEntry> = items
        .into_iter()
        .map(|item| canonical_entry(item, &base))
        .filter(|entry| seen.insert(entry.guid.clone()))
        .collect();

    // Stable: equal timestamps keep source order, undated go last.
    entries.sort_by_key(|e| (e.published_at.is_none(), e.published_at.unwrap_or_default()));
    entries
}

fn canonical_entry(item: RawItem, base: &str) -> NewEntry {
    let title = clean_title(&item.title);
    let link = resolve_link(&item.link, base);
    let guid = identity_key(item.guid.as_deref(), &title, &link);

    let image_url = item
        .image
        .as_deref()
        .map(|img| resolve_link(img, base))
        .filter(|img| img != base)
        .or_else(|| item.summary.as_deref().and_then(first_image_src));

    let summary = item.summary.as_deref().and_then(clean_summary);
    let published_at = item.published.as_deref().and_then(parse_published);

    NewEntry {
        guid,
        title,
        link,
        summary,
        published_at,
        image_url,
    }
}

/// Stable identity of an item within its feed.
///
/// The trimmed source guid when present, else `sha256:` followed by the hex
/// digest of `title + "\n" + link`.
pub fn identity_key(guid: Option<&str>, title: &str, link: &str) -> String {
    match guid.map(str::trim).filter(|g| !g.is_empty()) {
        Some(guid) => guid.to_string(),
        None => format!("sha256:{}", sha256_hex(&format!("{title}\n{link}"))),
    }
}

fn clean_title(raw: &str) -> String {
    let text = html_to_text(raw);
    if text.is_empty() {
        return UNTITLED.to_string();
    }
    truncate_chars(&text, MAX_TITLE_CHARS).into_owned()
}

fn clean_summary(raw: &str) -> Option<String> {
    let text = html_to_text(raw);
    (!text.is_empty()).then(|| truncate_chars(&text, MAX_SUMMARY_CHARS).into_owned())
}

/// Where relative links resolve: the feed's site link if usable, else its URL.
fn base_url(feed: &Feed) -> String {
    feed.site_url
        .as_deref()
        .filter(|site| is_http_url(site))
        .unwrap_or(&feed.url)
        .to_string()
}

fn is_http_url(s: &str) -> bool {
    Url::parse(s).is_ok_and(|u| matches!(u.scheme(), "http" | "https"))
}

/// Canonical absolute link for an item.
///
/// Absolute http(s) links are kept as written (trimmed). Relative links are
/// joined onto `base`. Anything else (empty, `javascript:`, `mailto:`) becomes
/// `base` itself.
pub fn resolve_link(link: &str, base: &str) -> String {
    let link = link.trim();
    if link.is_empty() {
        return base.to_string();
    }

    match Url::parse(link) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => link.to_string(),
        Ok(_) => base.to_string(),
        Err(url::ParseError::RelativeUrlWithoutBase) => Url::parse(base)
            .and_then(|b| b.join(link))
            .ok()
            .filter(|u| matches!(u.scheme(), "http" | "https"))
            .map(|u| u.to_string())
            .unwrap_or_else(|| base.to_string()),
        Err(_) => base.to_string(),
    }
}

/// Parse a published timestamp in any of the accepted layouts.
///
/// Accepts RFC 3339, RFC 2822, `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DDTHH:MM:SS`
/// and `YYYY-MM-DD`; the naive forms are read as UTC. Returns unix seconds.
pub fn parse_published(raw: &str) -> Option<i64> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp());
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.timestamp());
    }
    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
            return Some(dt.and_utc().timestamp());
        }
    }
    NaiveDate::parse_from_str(s, NAIVE_DATE_FORMAT)
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp())
}
