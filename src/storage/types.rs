use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with operator-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds the database lock
    #[error("Database is locked by another process. Stop the other relay instance and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        if is_lock_message(&err.to_string()) {
            return DatabaseError::InstanceLocked;
        }
        DatabaseError::Other(err)
    }
}

/// SQLITE_BUSY (5), SQLITE_LOCKED (6) and SQLITE_CANTOPEN (14) all surface as these messages.
pub(crate) fn is_lock_message(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("database is locked")
        || message.contains("database table is locked")
        || message.contains("sqlite_busy")
        || message.contains("sqlite_locked")
        || message.contains("unable to open database file")
}

// ============================================================================
// Input Types
// ============================================================================

/// A normalized entry ready to be inserted (produced by the normalizer)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntry {
    pub guid: String,
    pub title: String,
    pub link: String,
    pub summary: Option<String>,
    pub published_at: Option<i64>,
    pub image_url: Option<String>,
}

/// Subscription row as created by the command surface
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub platform: String,
    pub channel_id: String,
    pub feed_id: i64,
    pub translate: bool,
    pub target_language: String,
}

/// Conditional-request validators returned by the last successful fetch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Validators {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// Backoff decision computed by the fetcher for a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureRecord {
    pub attempted_at: i64,
    pub backoff_until: i64,
    pub deactivate: bool,
}

// ============================================================================
// Data Structures
// ============================================================================

/// Feed row with its health state
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Feed {
    pub id: i64,
    pub url: String,
    pub title: Option<String>,
    pub site_url: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    /// Last successful fetch (unix seconds)
    pub last_fetched_at: Option<i64>,
    /// Last attempt, successful or not (unix seconds)
    pub last_attempt_at: Option<i64>,
    pub consecutive_failures: i64,
    pub backoff_until: Option<i64>,
    pub active: bool,
    pub last_error: Option<String>,
}

impl Feed {
    pub fn validators(&self) -> Validators {
        Validators {
            etag: self.etag.clone(),
            last_modified: self.last_modified.clone(),
        }
    }

    /// True while `now` is before the stored backoff deadline.
    pub fn is_backing_off(&self, now: i64) -> bool {
        self.backoff_until.is_some_and(|until| now < until)
    }

    /// Title for logs and messages, falling back to the URL.
    pub fn display_name(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.url)
    }
}

/// Entry row
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Entry {
    pub id: i64,
    pub feed_id: i64,
    pub guid: String,
    pub title: String,
    pub link: String,
    pub summary: Option<String>,
    pub published_at: Option<i64>,
    pub image_url: Option<String>,
    pub discovered_at: i64,
}

impl Entry {
    /// Published time, or discovery time when the source gave none.
    pub fn display_time(&self) -> i64 {
        self.published_at.unwrap_or(self.discovered_at)
    }
}

/// Stored translation of an entry's title/summary for one language
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct EntryTranslation {
    pub entry_id: i64,
    pub language: String,
    pub title: String,
    pub summary: Option<String>,
}

/// Subscription row
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Subscription {
    pub id: i64,
    pub platform: String,
    pub channel_id: String,
    pub feed_id: i64,
    pub translate: bool,
    pub target_language: String,
    pub active: bool,
    pub disabled_reason: Option<String>,
}

/// Durable translation cache row
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct CachedTranslation {
    pub text_hash: String,
    pub language: String,
    pub translated: String,
    pub created_at: i64,
}
