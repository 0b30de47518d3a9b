use anyhow::Result;

use super::schema::Database;
use super::types::{FailureRecord, Feed, Validators};

const FEED_COLUMNS: &str = "id, url, title, site_url, etag, last_modified, last_fetched_at, \
     last_attempt_at, consecutive_failures, backoff_until, active, last_error";

impl Database {
    // ========================================================================
    // Feed Operations
    // ========================================================================

    /// Insert a feed by URL if it does not exist yet, returning its ID.
    ///
    /// An existing feed keeps its health state; it is not reactivated.
    pub async fn upsert_feed(&self, url: &str) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO feeds (url) VALUES (?)
            ON CONFLICT(url) DO UPDATE SET url = excluded.url
            RETURNING id
        "#,
        )
        .bind(url)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    pub async fn get_feed(&self, feed_id: i64) -> Result<Option<Feed>> {
        let feed = sqlx::query_as::<_, Feed>(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds WHERE id = ?"
        ))
        .bind(feed_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(feed)
    }

    /// All feeds with `active = 1`, including those currently backing off.
    ///
    /// The scheduler decides whether a backing-off feed is skipped.
    pub async fn list_active_feeds(&self) -> Result<Vec<Feed>> {
        let feeds = sqlx::query_as::<_, Feed>(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds WHERE active = 1 ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(feeds)
    }

    /// Record a successful fetch (modified or not modified).
    ///
    /// Resets the failure count, moves `backoff_until` to `now`, and stores
    /// the new validators and document title when given. `None` keeps the
    /// stored values (used for 304 responses).
    pub async fn record_fetch_success(
        &self,
        feed_id: i64,
        now: i64,
        validators: Option<&Validators>,
        title: Option<&str>,
        site_url: Option<&str>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE feeds SET
                last_fetched_at = ?,
                last_attempt_at = ?,
                consecutive_failures = 0,
                backoff_until = ?,
                last_error = NULL,
                title = COALESCE(?, title),
                site_url = COALESCE(?, site_url)
            WHERE id = ?
        "#,
        )
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(title)
        .bind(site_url)
        .bind(feed_id)
        .execute(&mut *tx)
        .await?;

        if let Some(validators) = validators {
            sqlx::query("UPDATE feeds SET etag = ?, last_modified = ? WHERE id = ?")
                .bind(&validators.etag)
                .bind(&validators.last_modified)
                .bind(feed_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Increment the consecutive failure count for a feed.
    ///
    /// Returns the new failure count. Used by the fetcher before it computes
    /// the backoff for this attempt.
    pub async fn increment_feed_failures(&self, feed_id: i64) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "UPDATE feeds SET consecutive_failures = consecutive_failures + 1
             WHERE id = ? RETURNING consecutive_failures",
        )
        .bind(feed_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    /// Store the outcome of a failed attempt.
    ///
    /// `backoff_until` never moves backwards: the stored value is the max of
    /// the old and new deadlines, which keeps it monotonic even if two writers
    /// race.
    pub async fn record_fetch_failure(
        &self,
        feed_id: i64,
        record: &FailureRecord,
        error: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE feeds SET
                last_attempt_at = ?,
                backoff_until = MAX(COALESCE(backoff_until, 0), ?),
                last_error = ?,
                active = CASE WHEN ? THEN 0 ELSE active END
            WHERE id = ?
        "#,
        )
        .bind(record.attempted_at)
        .bind(record.backoff_until)
        .bind(error)
        .bind(record.deactivate)
        .bind(feed_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Manually disable a feed. Entries and subscriptions are kept.
    pub async fn deactivate_feed(&self, feed_id: i64) -> Result<bool> {
        let result = sqlx::query("UPDATE feeds SET active = 0 WHERE id = ?")
            .bind(feed_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Reactivate a feed, clearing its failure count and backoff.
    pub async fn reactivate_feed(&self, feed_id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE feeds SET
                active = 1,
                consecutive_failures = 0,
                backoff_until = NULL,
                last_error = NULL
            WHERE id = ?
        "#,
        )
        .bind(feed_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{Database, FailureRecord, Validators};

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_upsert_feed_is_idempotent() {
        let db = test_db().await;
        let id1 = db.upsert_feed("https://example.com/rss").await.unwrap();
        let id2 = db.upsert_feed("https://example.com/rss").await.unwrap();
        assert_eq!(id1, id2);

        let feeds = db.list_active_feeds().await.unwrap();
        assert_eq!(feeds.len(), 1);
        assert!(feeds[0].active);
        assert_eq!(feeds[0].consecutive_failures, 0);
        assert!(feeds[0].validators().is_empty());
    }

    #[tokio::test]
    async fn test_record_success_stores_validators_and_title() {
        let db = test_db().await;
        let id = db.upsert_feed("https://example.com/rss").await.unwrap();

        let validators = Validators {
            etag: Some("\"abc\"".to_string()),
            last_modified: Some("Mon, 01 Jan 2024 00:00:00 GMT".to_string()),
        };
        db.record_fetch_success(id, 1_000, Some(&validators), Some("Example"), None)
            .await
            .unwrap();

        let feed = db.get_feed(id).await.unwrap().unwrap();
        assert_eq!(feed.validators(), validators);
        assert_eq!(feed.title.as_deref(), Some("Example"));
        assert_eq!(feed.last_fetched_at, Some(1_000));

        // A 304 keeps the stored validators and title
        db.record_fetch_success(id, 2_000, None, None, None)
            .await
            .unwrap();
        let feed = db.get_feed(id).await.unwrap().unwrap();
        assert_eq!(feed.validators(), validators);
        assert_eq!(feed.title.as_deref(), Some("Example"));
        assert_eq!(feed.last_fetched_at, Some(2_000));
    }

    #[tokio::test]
    async fn test_failure_then_success_resets() {
        let db = test_db().await;
        let id = db.upsert_feed("https://example.com/rss").await.unwrap();

        assert_eq!(db.increment_feed_failures(id).await.unwrap(), 1);
        db.record_fetch_failure(
            id,
            &FailureRecord {
                attempted_at: 100,
                backoff_until: 220,
                deactivate: false,
            },
            "HTTP error: status 503",
        )
        .await
        .unwrap();

        let feed = db.get_feed(id).await.unwrap().unwrap();
        assert_eq!(feed.consecutive_failures, 1);
        assert_eq!(feed.backoff_until, Some(220));
        assert!(feed.is_backing_off(200));
        assert!(!feed.is_backing_off(220));
        assert_eq!(feed.last_error.as_deref(), Some("HTTP error: status 503"));

        db.record_fetch_success(id, 300, None, None, None)
            .await
            .unwrap();
        let feed = db.get_feed(id).await.unwrap().unwrap();
        assert_eq!(feed.consecutive_failures, 0);
        assert_eq!(feed.backoff_until, Some(300));
        assert!(feed.last_error.is_none());
    }

    #[tokio::test]
    async fn test_backoff_never_moves_backwards() {
        let db = test_db().await;
        let id = db.upsert_feed("https://example.com/rss").await.unwrap();

        for (attempted_at, backoff_until) in [(100, 500), (110, 400)] {
            db.increment_feed_failures(id).await.unwrap();
            db.record_fetch_failure(
                id,
                &FailureRecord {
                    attempted_at,
                    backoff_until,
                    deactivate: false,
                },
                "timeout",
            )
            .await
            .unwrap();
        }

        let feed = db.get_feed(id).await.unwrap().unwrap();
        assert_eq!(feed.backoff_until, Some(500));
        assert_eq!(feed.consecutive_failures, 2);
    }

    #[tokio::test]
    async fn test_terminal_failure_deactivates_and_reactivate_resets() {
        let db = test_db().await;
        let id = db.upsert_feed("https://example.com/rss").await.unwrap();

        db.increment_feed_failures(id).await.unwrap();
        db.record_fetch_failure(
            id,
            &FailureRecord {
                attempted_at: 100,
                backoff_until: 160,
                deactivate: true,
            },
            "HTTP error: status 410",
        )
        .await
        .unwrap();

        assert!(db.list_active_feeds().await.unwrap().is_empty());
        let feed = db.get_feed(id).await.unwrap().unwrap();
        assert!(!feed.active);

        assert!(db.reactivate_feed(id).await.unwrap());
        let feed = db.get_feed(id).await.unwrap().unwrap();
        assert!(feed.active);
        assert_eq!(feed.consecutive_failures, 0);
        assert!(feed.backoff_until.is_none());
    }

    #[tokio::test]
    async fn test_deactivate_feed_keeps_row() {
        let db = test_db().await;
        let id = db.upsert_feed("https://example.com/rss").await.unwrap();
        assert!(db.deactivate_feed(id).await.unwrap());
        assert!(db.list_active_feeds().await.unwrap().is_empty());
        assert!(db.get_feed(id).await.unwrap().is_some());
        assert!(!db.deactivate_feed(999).await.unwrap());
    }
}
