use super::schema::Database;
use super::snapshot::{group_tags, ARTICLE_COLUMNS};
use super::types::{ArticleDbRow, DatabaseError};
use crate::feed::ArticleIdentity;
use crate::store::{Article, FeedId, TagId};

impl Database {
    // ========================================================================
    // Article Queries
    // ========================================================================

    /// Point lookup by identity.
    pub async fn get_article(
        &self,
        identity: &ArticleIdentity,
    ) -> Result<Option<Article>, DatabaseError> {
        let row: Option<ArticleDbRow> = sqlx::query_as(&format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles WHERE identity = ?"
        ))
        .bind(identity.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let tag_ids: Vec<(i64,)> =
            sqlx::query_as("SELECT tag_id FROM article_tags WHERE identity = ? ORDER BY tag_id")
                .bind(identity.as_str())
                .fetch_all(&self.pool)
                .await?;
        let tags = tag_ids.into_iter().map(|(id,)| TagId(id)).collect();
        row.into_article(tags).map(Some)
    }

    /// Articles of one feed in display order (uses `idx_articles_feed_published`).
    pub async fn get_articles_for_feed(&self, feed_id: FeedId) -> Result<Vec<Article>, DatabaseError> {
        let rows: Vec<ArticleDbRow> = sqlx::query_as(&format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles WHERE feed_id = ? \
             ORDER BY published_at DESC, first_seen_at DESC, identity ASC"
        ))
        .bind(feed_id.0)
        .fetch_all(&self.pool)
        .await?;

        let links: Vec<(String, i64)> = sqlx::query_as(
            "SELECT t.identity, t.tag_id FROM article_tags t \
             JOIN articles a ON a.identity = t.identity WHERE a.feed_id = ?",
        )
        .bind(feed_id.0)
        .fetch_all(&self.pool)
        .await?;
        let mut tags = group_tags(links);

        rows.into_iter()
            .map(|row| {
                let article_tags = tags.remove(&row.identity).unwrap_or_default();
                row.into_article(article_tags)
            })
            .collect()
    }
}
