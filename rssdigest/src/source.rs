use chrono::{DateTime, TimeZone, Utc};
use common::{open_source_pool, resolve_user_db, SourceConfig};
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::DigestError;
use crate::model::Article;

/// Upper bound for opening the store and running the query
pub const SOURCE_TIMEOUT: Duration = Duration::from_secs(30);

const RECENT_ENTRIES_SQL: &str = r#"
    SELECT
        e.id,
        e.title,
        e.link,
        e.date,
        e.content,
        f.name AS feed_name,
        c.name AS category_name
    FROM entry e
    JOIN feed f ON e.id_feed = f.id
    LEFT JOIN category c ON f.category = c.id
    WHERE e.date >= ?
    ORDER BY e.date DESC, e.id DESC
"#;

/// Read-only view of one user's FreshRSS entries
pub struct ArticleSource {
    pool: SqlitePool,
    username: String,
}

impl ArticleSource {
    /// Open the store of the configured user.
    pub async fn open(config: &SourceConfig) -> Result<Self, DigestError> {
        let path = resolve_user_db(&config.db_path, &config.username);
        info!(user = %config.username, db_path = %path.display(), "opening article store");

        let pool = open_source_pool(&path, SOURCE_TIMEOUT)
            .await
            .map_err(|e| DigestError::SourceUnavailable(format!("{:#}", e)))?;

        Ok(Self {
            pool,
            username: config.username.clone(),
        })
    }

    /// Entries published at or after `since`, newest first.
    ///
    /// An empty result is not an error.
    pub async fn fetch_recent(&self, since: DateTime<Utc>) -> Result<Vec<Article>, DigestError> {
        let query = sqlx::query(RECENT_ENTRIES_SQL)
            .bind(since.timestamp())
            .fetch_all(&self.pool);

        let rows = tokio::time::timeout(SOURCE_TIMEOUT, query)
            .await
            .map_err(|_| DigestError::SourceUnavailable("article query timed out".to_string()))?
            .map_err(|e| DigestError::SourceUnavailable(format!("article query failed: {}", e)))?;

        let mut articles = Vec::with_capacity(rows.len());
        for row in rows {
            let date: i64 = row.try_get("date").map_err(row_error)?;
            articles.push(Article {
                id: row.try_get("id").map_err(row_error)?,
                title: row
                    .try_get::<Option<String>, _>("title")
                    .map_err(row_error)?
                    .unwrap_or_default(),
                link: row
                    .try_get::<Option<String>, _>("link")
                    .map_err(row_error)?
                    .unwrap_or_default(),
                published_at: Utc.timestamp_opt(date, 0).single().unwrap_or_default(),
                content: row
                    .try_get::<Option<String>, _>("content")
                    .map_err(row_error)?
                    .unwrap_or_default(),
                feed: row.try_get("feed_name").map_err(row_error)?,
                category: row.try_get("category_name").map_err(row_error)?,
            });
        }

        debug!(
            user = %self.username,
            since = %since,
            "fetched {} entries",
            articles.len()
        );
        Ok(articles)
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

fn row_error(e: sqlx::Error) -> DigestError {
    DigestError::SourceUnavailable(format!("unexpected row shape: {}", e))
}
