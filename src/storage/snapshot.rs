use sqlx::QueryBuilder;
use std::collections::{BTreeSet, HashMap};

use super::schema::Database;
use super::types::{to_millis, ArticleDbRow, DatabaseError, FeedDbRow};
use crate::store::{FeedId, FeedList, ListId, StoreSnapshot, Tag, TagId};

/// Rows per multi-value INSERT. 14 article columns × 100 stays far below
/// SQLite's bound-parameter limit.
const BATCH_SIZE: usize = 100;

pub(crate) const ARTICLE_COLUMNS: &str = "identity, feed_id, title, content_html, summary_html, link, \
     published_raw, published_at, published_estimated, author, image_url, is_read, \
     first_seen_at, last_seen_at";

impl Database {
    // ========================================================================
    // Snapshot Operations
    // ========================================================================

    /// Replaces the stored state with `snapshot` in a single transaction.
    ///
    /// Timestamps are kept with millisecond precision.
    pub async fn save_snapshot(&self, snapshot: &StoreSnapshot) -> Result<(), DatabaseError> {
        let mut tx = self.pool.begin().await?;

        for statement in [
            "DELETE FROM article_tags",
            "DELETE FROM articles",
            "DELETE FROM feeds",
            "DELETE FROM tags",
            "DELETE FROM lists",
        ] {
            sqlx::query(statement).execute(&mut *tx).await?;
        }

        for chunk in snapshot.lists.chunks(BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> =
                QueryBuilder::new("INSERT INTO lists (id, name) ");
            builder.push_values(chunk, |mut b, list| {
                b.push_bind(list.id.0).push_bind(&list.name);
            });
            builder.build().execute(&mut *tx).await?;
        }

        let positions: HashMap<FeedId, i64> = snapshot
            .lists
            .iter()
            .flat_map(|list| list.feed_ids.iter().enumerate())
            .map(|(pos, id)| (*id, pos as i64))
            .collect();
        let feed_errors = snapshot
            .feeds
            .iter()
            .map(|feed| {
                feed.last_error
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()
                    .map_err(|e| DatabaseError::InvalidRow(format!("feed {}: {e}", feed.id)))
            })
            .collect::<Result<Vec<Option<String>>, _>>()?;
        let feeds: Vec<_> = snapshot.feeds.iter().zip(feed_errors).collect();

        for chunk in feeds.chunks(BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "INSERT INTO feeds (id, url, title, list_id, position, site_url, \
                 last_fetched_at, last_success_at, last_error) ",
            );
            builder.push_values(chunk, |mut b, (feed, error)| {
                b.push_bind(feed.id.0)
                    .push_bind(&feed.url)
                    .push_bind(&feed.title)
                    .push_bind(feed.list_id.0)
                    .push_bind(positions.get(&feed.id).copied().unwrap_or(i64::MAX))
                    .push_bind(&feed.site_url)
                    .push_bind(feed.last_fetched_at.map(to_millis))
                    .push_bind(feed.last_success_at.map(to_millis))
                    .push_bind(error.clone());
            });
            builder.build().execute(&mut *tx).await?;
        }

        for chunk in snapshot.tags.chunks(BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> =
                QueryBuilder::new("INSERT INTO tags (id, name, color) ");
            builder.push_values(chunk, |mut b, tag| {
                b.push_bind(tag.id.0)
                    .push_bind(&tag.name)
                    .push_bind(&tag.color);
            });
            builder.build().execute(&mut *tx).await?;
        }

        for chunk in snapshot.articles.chunks(BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> =
                QueryBuilder::new(format!("INSERT INTO articles ({ARTICLE_COLUMNS}) "));
            builder.push_values(chunk, |mut b, article| {
                b.push_bind(article.identity.as_str())
                    .push_bind(article.feed_id.0)
                    .push_bind(&article.title)
                    .push_bind(&article.content_html)
                    .push_bind(&article.summary_html)
                    .push_bind(&article.link)
                    .push_bind(&article.published_at.raw)
                    .push_bind(to_millis(article.published_at.at))
                    .push_bind(article.published_at.estimated)
                    .push_bind(&article.author)
                    .push_bind(&article.image_url)
                    .push_bind(article.is_read)
                    .push_bind(to_millis(article.first_seen_at))
                    .push_bind(to_millis(article.last_seen_at));
            });
            builder.build().execute(&mut *tx).await?;
        }

        let tag_links: Vec<(&str, i64)> = snapshot
            .articles
            .iter()
            .flat_map(|a| a.tags.iter().map(move |t| (a.identity.as_str(), t.0)))
            .collect();
        for chunk in tag_links.chunks(BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> =
                QueryBuilder::new("INSERT INTO article_tags (identity, tag_id) ");
            builder.push_values(chunk, |mut b, (identity, tag_id)| {
                b.push_bind(*identity).push_bind(*tag_id);
            });
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        tracing::debug!(
            feeds = snapshot.feeds.len(),
            articles = snapshot.articles.len(),
            "Snapshot saved"
        );
        Ok(())
    }

    /// Reads the stored state back, ordered like `AggregationStore::snapshot`.
    pub async fn load_snapshot(&self) -> Result<StoreSnapshot, DatabaseError> {
        let list_rows: Vec<(i64, String)> =
            sqlx::query_as("SELECT id, name FROM lists ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        let mut lists: Vec<FeedList> = list_rows
            .into_iter()
            .map(|(id, name)| FeedList {
                id: ListId(id),
                name,
                feed_ids: Vec::new(),
            })
            .collect();

        let feed_rows: Vec<FeedDbRow> = sqlx::query_as(
            "SELECT id, url, title, list_id, site_url, last_fetched_at, last_success_at, last_error \
             FROM feeds ORDER BY list_id, position, id",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut feeds = Vec::with_capacity(feed_rows.len());
        for row in feed_rows {
            let feed = row.into_feed()?;
            if let Some(list) = lists.iter_mut().find(|l| l.id == feed.list_id) {
                list.feed_ids.push(feed.id);
            }
            feeds.push(feed);
        }
        feeds.sort_by_key(|f| f.id);

        let tag_rows: Vec<(i64, String, Option<String>)> =
            sqlx::query_as("SELECT id, name, color FROM tags ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        let tags = tag_rows
            .into_iter()
            .map(|(id, name, color)| Tag {
                id: TagId(id),
                name,
                color,
            })
            .collect();

        let links: Vec<(String, i64)> = sqlx::query_as("SELECT identity, tag_id FROM article_tags")
            .fetch_all(&self.pool)
            .await?;
        let mut tags_by_article = group_tags(links);

        let article_rows: Vec<ArticleDbRow> = sqlx::query_as(&format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles \
             ORDER BY feed_id, published_at DESC, first_seen_at DESC, identity ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        let articles = article_rows
            .into_iter()
            .map(|row| {
                let tags = tags_by_article.remove(&row.identity).unwrap_or_default();
                row.into_article(tags)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(StoreSnapshot {
            feeds,
            lists,
            tags,
            articles,
        })
    }
}

pub(crate) fn group_tags(links: Vec<(String, i64)>) -> HashMap<String, BTreeSet<TagId>> {
    let mut grouped: HashMap<String, BTreeSet<TagId>> = HashMap::new();
    for (identity, tag_id) in links {
        grouped.entry(identity).or_default().insert(TagId(tag_id));
    }
    grouped
}
