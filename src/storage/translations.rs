use anyhow::Result;

use super::schema::Database;
use super::types::CachedTranslation;

impl Database {
    // ========================================================================
    // Translation cache (durable tier)
    // ========================================================================

    pub async fn get_cached_translation(
        &self,
        text_hash: &str,
        language: &str,
    ) -> Result<Option<CachedTranslation>> {
        let row = sqlx::query_as::<_, CachedTranslation>(
            r#"
            SELECT text_hash, language, translated, created_at
            FROM translation_cache
            WHERE text_hash = ? AND language = ?
        "#,
        )
        .bind(text_hash)
        .bind(language)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Store a translation. The first stored value for a key is kept.
    pub async fn store_cached_translation(
        &self,
        text_hash: &str,
        language: &str,
        translated: &str,
        now: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO translation_cache (text_hash, language, translated, created_at)
            VALUES (?, ?, ?, ?)
        "#,
        )
        .bind(text_hash)
        .bind(language)
        .bind(translated)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn prune_translations_before(&self, cutoff: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM translation_cache WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
