use anyhow::Result;
use sqlx::QueryBuilder;
use std::collections::HashSet;

use super::schema::Database;
use super::types::{Entry, EntryTranslation, NewEntry};

const ENTRY_COLUMNS: &str =
    "id, feed_id, guid, title, link, summary, published_at, image_url, discovered_at";

impl Database {
    // ========================================================================
    // Entry Operations
    // ========================================================================

    /// Return the subset of `guids` that already exist for `feed_id`.
    ///
    /// PERF-001: Chunks at 500 keys per query to stay under SQLite's bind-parameter limit.
    pub async fn existing_guids(&self, feed_id: i64, guids: &[&str]) -> Result<HashSet<String>> {
        const CHUNK_SIZE: usize = 500;
        let mut found = HashSet::new();

        for chunk in guids.chunks(CHUNK_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> =
                QueryBuilder::new("SELECT guid FROM entries WHERE feed_id = ");
            builder.push_bind(feed_id);
            builder.push(" AND guid IN (");

            let mut separated = builder.separated(", ");
            for guid in chunk {
                separated.push_bind(*guid);
            }
            separated.push_unseparated(")");

            let rows: Vec<(String,)> = builder.build_query_as().fetch_all(&self.pool).await?;
            found.extend(rows.into_iter().map(|(guid,)| guid));
        }

        Ok(found)
    }

    /// Insert entries for a feed, skipping any whose `(feed_id, guid)` already exists.
    ///
    /// The whole batch is one transaction. Each row is an
    /// `INSERT ... ON CONFLICT DO NOTHING RETURNING id`, so an entry written
    /// concurrently by someone else is skipped rather than duplicated.
    /// Returns only the rows this call inserted, in input order.
    pub async fn insert_entries_if_absent(
        &self,
        feed_id: i64,
        entries: &[NewEntry],
        discovered_at: i64,
    ) -> Result<Vec<Entry>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::new();

        for entry in entries {
            let id: Option<(i64,)> = sqlx::query_as(
                r#"
                INSERT INTO entries
                    (feed_id, guid, title, link, summary, published_at, image_url, discovered_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(feed_id, guid) DO NOTHING
                RETURNING id
            "#,
            )
            .bind(feed_id)
            .bind(&entry.guid)
            .bind(&entry.title)
            .bind(&entry.link)
            .bind(&entry.summary)
            .bind(entry.published_at)
            .bind(&entry.image_url)
            .bind(discovered_at)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some((id,)) = id {
                inserted.push(Entry {
                    id,
                    feed_id,
                    guid: entry.guid.clone(),
                    title: entry.title.clone(),
                    link: entry.link.clone(),
                    summary: entry.summary.clone(),
                    published_at: entry.published_at,
                    image_url: entry.image_url.clone(),
                    discovered_at,
                });
            }
        }

        tx.commit().await?;
        Ok(inserted)
    }

    /// All entries for a feed, oldest discovery first.
    pub async fn entries_for_feed(&self, feed_id: i64) -> Result<Vec<Entry>> {
        let entries = sqlx::query_as::<_, Entry>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries WHERE feed_id = ? ORDER BY discovered_at, id"
        ))
        .bind(feed_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    // ========================================================================
    // Per-entry translations
    // ========================================================================

    pub async fn get_entry_translation(
        &self,
        entry_id: i64,
        language: &str,
    ) -> Result<Option<EntryTranslation>> {
        let row = sqlx::query_as::<_, EntryTranslation>(
            r#"
            SELECT entry_id, language, title, summary
            FROM entry_translations
            WHERE entry_id = ? AND language = ?
        "#,
        )
        .bind(entry_id)
        .bind(language)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Append a translation for an entry. An existing row for the language wins.
    pub async fn record_entry_translation(
        &self,
        translation: &EntryTranslation,
        now: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO entry_translations
                (entry_id, language, title, summary, created_at)
            VALUES (?, ?, ?, ?, ?)
        "#,
        )
        .bind(translation.entry_id)
        .bind(&translation.language)
        .bind(&translation.title)
        .bind(&translation.summary)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete entries discovered before `cutoff`. Translations cascade.
    pub async fn prune_entries_before(&self, cutoff: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM entries WHERE discovered_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{Database, EntryTranslation, NewEntry};
    use pretty_assertions::assert_eq;

    async fn test_db() -> (Database, i64) {
        let db = Database::open(":memory:").await.unwrap();
        let feed_id = db.upsert_feed("https://example.com/rss").await.unwrap();
        (db, feed_id)
    }

    fn new_entry(guid: &str) -> NewEntry {
        NewEntry {
            guid: guid.to_string(),
            title: format!("Title {guid}"),
            link: format!("https://example.com/{guid}"),
            summary: Some("Summary".to_string()),
            published_at: Some(1_704_067_200),
            image_url: None,
        }
    }

    #[tokio::test]
    async fn test_insert_entries_if_absent_returns_only_new() {
        let (db, feed_id) = test_db().await;

        let first = db
            .insert_entries_if_absent(feed_id, &[new_entry("1"), new_entry("2")], 10)
            .await
            .unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].guid, "1");
        assert_eq!(first[1].discovered_at, 10);

        let second = db
            .insert_entries_if_absent(
                feed_id,
                &[new_entry("1"), new_entry("2"), new_entry("3")],
                20,
            )
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].guid, "3");

        let all = db.entries_for_feed(feed_id).await.unwrap();
        assert_eq!(all.len(), 3);
        // Existing rows are untouched by the second batch
        assert_eq!(all[0].discovered_at, 10);
    }

    #[tokio::test]
    async fn test_insert_empty_batch() {
        let (db, feed_id) = test_db().await;
        let inserted = db.insert_entries_if_absent(feed_id, &[], 10).await.unwrap();
        assert!(inserted.is_empty());
    }

    #[tokio::test]
    async fn test_same_guid_in_different_feeds_is_distinct() {
        let (db, feed_a) = test_db().await;
        let feed_b = db.upsert_feed("https://other.example.com/rss").await.unwrap();

        db.insert_entries_if_absent(feed_a, &[new_entry("1")], 10)
            .await
            .unwrap();
        let inserted = db
            .insert_entries_if_absent(feed_b, &[new_entry("1")], 10)
            .await
            .unwrap();
        assert_eq!(inserted.len(), 1);
    }

    #[tokio::test]
    async fn test_existing_guids() {
        let (db, feed_id) = test_db().await;
        db.insert_entries_if_absent(feed_id, &[new_entry("a"), new_entry("b")], 10)
            .await
            .unwrap();

        let found = db.existing_guids(feed_id, &["a", "c"]).await.unwrap();
        assert!(found.contains("a"));
        assert!(!found.contains("c"));
        assert_eq!(found.len(), 1);

        assert!(db.existing_guids(feed_id, &[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_entry_translation_is_append_only() {
        let (db, feed_id) = test_db().await;
        let entries = db
            .insert_entries_if_absent(feed_id, &[new_entry("1")], 10)
            .await
            .unwrap();
        let entry_id = entries[0].id;

        let first = EntryTranslation {
            entry_id,
            language: "fr".to_string(),
            title: "Titre".to_string(),
            summary: Some("Résumé".to_string()),
        };
        assert!(db.record_entry_translation(&first, 10).await.unwrap());

        let second = EntryTranslation {
            title: "Autre titre".to_string(),
            ..first.clone()
        };
        assert!(!db.record_entry_translation(&second, 20).await.unwrap());

        let stored = db.get_entry_translation(entry_id, "fr").await.unwrap();
        assert_eq!(stored, Some(first));
        assert!(db.get_entry_translation(entry_id, "de").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_prune_entries_before() {
        let (db, feed_id) = test_db().await;
        db.insert_entries_if_absent(feed_id, &[new_entry("old")], 10)
            .await
            .unwrap();
        db.insert_entries_if_absent(feed_id, &[new_entry("new")], 100)
            .await
            .unwrap();

        assert_eq!(db.prune_entries_before(50).await.unwrap(), 1);
        let remaining = db.entries_for_feed(feed_id).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].guid, "new");
    }
}
