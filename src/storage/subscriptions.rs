use anyhow::Result;

use super::schema::Database;
use super::types::{NewSubscription, Subscription};

const SUBSCRIPTION_COLUMNS: &str =
    "id, platform, channel_id, feed_id, translate, target_language, active, disabled_reason";

impl Database {
    // ========================================================================
    // Subscription Operations
    // ========================================================================

    /// Create a subscription, or re-enable and update an existing one for the
    /// same `(platform, channel_id, feed_id)`.
    pub async fn add_subscription(&self, sub: &NewSubscription) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO subscriptions (platform, channel_id, feed_id, translate, target_language)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(platform, channel_id, feed_id) DO UPDATE SET
                translate = excluded.translate,
                target_language = excluded.target_language,
                active = 1,
                disabled_reason = NULL
            RETURNING id
        "#,
        )
        .bind(&sub.platform)
        .bind(&sub.channel_id)
        .bind(sub.feed_id)
        .bind(sub.translate)
        .bind(&sub.target_language)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    pub async fn get_subscription(&self, id: i64) -> Result<Option<Subscription>> {
        let sub = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(sub)
    }

    /// Active subscriptions of a feed, in creation order.
    pub async fn active_subscriptions_for(&self, feed_id: i64) -> Result<Vec<Subscription>> {
        let subs = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
             WHERE feed_id = ? AND active = 1 ORDER BY id"
        ))
        .bind(feed_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(subs)
    }

    /// Disable a subscription after a terminal delivery failure.
    pub async fn disable_subscription(&self, id: i64, reason: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE subscriptions SET active = 0, disabled_reason = ? WHERE id = ? AND active = 1",
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Turn translation off for a subscription whose target language the
    /// provider cannot produce. Delivery continues untranslated.
    pub async fn disable_subscription_translation(&self, id: i64) -> Result<bool> {
        let result =
            sqlx::query("UPDATE subscriptions SET translate = 0 WHERE id = ? AND translate = 1")
                .bind(id)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }
}
