//! Feed ingestion, translation caching and multi-platform delivery.
//!
//! The pieces, bottom-up:
//!
//! - [`storage`] - SQLite persistence for feeds, entries, subscriptions and translations
//! - [`feed`] - conditional fetching, parsing, normalization and the per-feed cycle
//! - [`translate`] - translation providers behind a two-tier, coalescing cache
//! - [`dispatch`] - rate-limited, retrying delivery to Telegram, Discord and webhooks
//! - [`scheduler`] - periodic polling with jitter, bounded concurrency and cleanup

pub mod config;
pub mod dispatch;
pub mod feed;
pub mod scheduler;
pub mod storage;
pub mod translate;
pub mod util;
