//! Feed ingestion: fetching, parsing, normalization and the per-feed cycle.
//!
//! - [`parser`] - RSS/Atom/JSON Feed documents to raw items via `feed-rs`
//! - [`fetcher`] - conditional HTTP GET with health and backoff bookkeeping
//! - [`normalizer`] - raw items to cleaned, deduplicated, stored entries
//! - [`cycle`] - fetch → normalize → record → dispatch for one feed
//!
//! # Example
//!
//! ```ignore
//! let cycle = FeedCycle::new(db.clone(), fetcher, dispatcher);
//! for feed in db.list_active_feeds().await? {
//!     let report = cycle.run_cycle(&feed).await?;
//!     println!("{} new entries", report.new_entries);
//! }
//! ```

pub mod cycle;
pub mod fetcher;
pub mod normalizer;
pub mod parser;

pub use cycle::{CycleError, CycleReport, CycleStatus, FeedCycle};
pub use fetcher::{
    backoff_delay, FailureKind, FetchError, FetchFailure, FetchOutcome, FetchedDocument, Fetcher,
};
pub use normalizer::{canonicalize, identity_key, normalize, NormalizeError};
pub use parser::{parse_feed, ParseError, ParsedFeed, RawItem};
