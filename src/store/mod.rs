//! # Store
//! SQLite persistence for sources, news items, posts and generation attempts.
//!
//! One [`Store`] wraps a sqlx pool; clones share it. Every public method
//! acquires its own pooled connection and commits before returning, except
//! the `*_in` helpers which run on a caller-owned transaction (ingestion
//! commits its whole batch at once).

pub mod error;
mod schema;

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::models::{
    NewSource, NewsItem, NewsItemUpdate, NewsSource, NewsSourceUpdate, NewsStats, ParserKind,
    Post, PostStats, PostStatus, PostUpdate, Stats,
};
use crate::retry::RetryPolicy;

pub use error::{Result, StoreError};
use schema::{CREATE_TABLES, NEWS_ITEM_COLUMNS, POST_COLUMNS, SOURCE_COLUMNS};

/// Outcome of an atomic claim: the token owning the claimed posts.
#[derive(Debug, Clone)]
pub struct Claim {
    pub token: String,
    pub posts: Vec<Post>,
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database at `database_url`,
    /// e.g. `sqlite://data/postgen.db`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);
        if let Some(parent) = opts.get_filename().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(opts)
            .await?;
        Self::with_pool(pool).await
    }

    /// Private in-memory database (single connection kept alive), for tests
    /// and dry runs.
    pub async fn in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::raw_sql(CREATE_TABLES).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Write transaction holding the write lock from its first statement.
    /// Overlapping writers wait on `busy_timeout`.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }

    // ------------------------------------------------------------
    // Sources
    // ------------------------------------------------------------

    pub async fn create_source(&self, src: &NewSource) -> Result<NewsSource> {
        let row = sqlx::query(&format!(
            "INSERT INTO news_sources (name, url, is_active, parser) VALUES (?1, ?2, ?3, ?4) \
             RETURNING {SOURCE_COLUMNS}"
        ))
        .bind(&src.name)
        .bind(&src.url)
        .bind(src.is_active)
        .bind(src.parser.as_str())
        .fetch_one(&self.pool)
        .await?;
        source_from_row(&row)
    }

    /// Insert sources whose name is not yet present. Existing rows are left
    /// alone so operator toggles survive restarts. Returns how many were added.
    pub async fn seed_sources(&self, sources: &[NewSource]) -> Result<usize> {
        let mut tx = self.begin().await?;
        let mut added = 0usize;
        for src in sources {
            let res = sqlx::query(
                "INSERT OR IGNORE INTO news_sources (name, url, is_active, parser) \
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(&src.name)
            .bind(&src.url)
            .bind(src.is_active)
            .bind(src.parser.as_str())
            .execute(&mut *tx)
            .await?;
            added += res.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(added)
    }

    pub async fn get_source(&self, id: i64) -> Result<Option<NewsSource>> {
        let row = sqlx::query(&format!("SELECT {SOURCE_COLUMNS} FROM news_sources WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(source_from_row).transpose()
    }

    pub async fn list_sources(&self) -> Result<Vec<NewsSource>> {
        let rows = sqlx::query(&format!("SELECT {SOURCE_COLUMNS} FROM news_sources ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(source_from_row).collect()
    }

    /// Active sources of the given kind, in id order.
    pub async fn active_sources(&self, parser: ParserKind) -> Result<Vec<NewsSource>> {
        let rows = sqlx::query(&format!(
            "SELECT {SOURCE_COLUMNS} FROM news_sources \
             WHERE is_active = 1 AND parser = ?1 ORDER BY id"
        ))
        .bind(parser.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(source_from_row).collect()
    }

    pub async fn update_source(
        &self,
        id: i64,
        update: &NewsSourceUpdate,
    ) -> Result<Option<NewsSource>> {
        if update.is_empty() {
            return self.get_source(id).await;
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE news_sources SET ");
        {
            let mut set = qb.separated(", ");
            if let Some(name) = &update.name {
                set.push("name = ").push_bind_unseparated(name.clone());
            }
            if let Some(url) = &update.url {
                set.push("url = ").push_bind_unseparated(url.clone());
            }
            if let Some(active) = update.is_active {
                set.push("is_active = ").push_bind_unseparated(active);
            }
            if let Some(parser) = update.parser {
                set.push("parser = ").push_bind_unseparated(parser.as_str());
            }
        }
        qb.push(" WHERE id = ").push_bind(id);
        qb.push(format!(" RETURNING {SOURCE_COLUMNS}"));
        let row = qb.build().fetch_optional(&self.pool).await?;
        row.as_ref().map(source_from_row).transpose()
    }

    // ------------------------------------------------------------
    // News items
    // ------------------------------------------------------------

    /// Id of an existing item with the same URL (when given) or the same title.
    pub async fn find_duplicate_in(
        conn: &mut SqliteConnection,
        url: Option<&str>,
        title: &str,
    ) -> Result<Option<Uuid>> {
        let row = sqlx::query(
            "SELECT id FROM news_items \
             WHERE (?1 IS NOT NULL AND url = ?1) OR title = ?2 LIMIT 1",
        )
        .bind(url)
        .bind(title)
        .fetch_optional(&mut *conn)
        .await?;
        row.map(|r| parse_uuid(&r, "id")).transpose()
    }

    pub async fn insert_news_item_in(conn: &mut SqliteConnection, item: &NewsItem) -> Result<()> {
        sqlx::query(
            "INSERT INTO news_items (id, title, url, summary, source, published_at, raw_text) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(item.id.to_string())
        .bind(&item.title)
        .bind(&item.url)
        .bind(&item.summary)
        .bind(&item.source)
        .bind(item.published_at)
        .bind(&item.raw_text)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn get_news_item(&self, id: Uuid) -> Result<Option<NewsItem>> {
        let row = sqlx::query(&format!(
            "SELECT {NEWS_ITEM_COLUMNS} FROM news_items WHERE id = ?1"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(news_item_from_row).transpose()
    }

    pub async fn list_news_items(&self, offset: i64, limit: i64) -> Result<Vec<NewsItem>> {
        let rows = sqlx::query(&format!(
            "SELECT {NEWS_ITEM_COLUMNS} FROM news_items \
             ORDER BY published_at DESC LIMIT ?1 OFFSET ?2"
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(news_item_from_row).collect()
    }

    /// Apply the `Some` fields of `update`; `None` when the item does not exist.
    pub async fn update_news_item(
        &self,
        id: Uuid,
        update: &NewsItemUpdate,
    ) -> Result<Option<NewsItem>> {
        if update.is_empty() {
            return self.get_news_item(id).await;
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE news_items SET ");
        {
            let mut set = qb.separated(", ");
            if let Some(title) = &update.title {
                set.push("title = ").push_bind_unseparated(title.clone());
            }
            if let Some(url) = &update.url {
                set.push("url = ").push_bind_unseparated(url.clone());
            }
            if let Some(summary) = &update.summary {
                set.push("summary = ").push_bind_unseparated(summary.clone());
            }
            if let Some(raw) = &update.raw_text {
                set.push("raw_text = ").push_bind_unseparated(raw.clone());
            }
        }
        qb.push(" WHERE id = ").push_bind(id.to_string());
        qb.push(format!(" RETURNING {NEWS_ITEM_COLUMNS}"));
        let row = qb.build().fetch_optional(&self.pool).await?;
        row.as_ref().map(news_item_from_row).transpose()
    }

    // ------------------------------------------------------------
    // Generation
    // ------------------------------------------------------------

    /// Items without a post (anti-join), skipping those still inside their
    /// generation backoff window or out of attempts. Oldest first.
    pub async fn items_needing_posts(
        &self,
        now: DateTime<Utc>,
        max_attempts: Option<u32>,
        limit: Option<usize>,
    ) -> Result<Vec<NewsItem>> {
        let rows = sqlx::query(
            "SELECT n.id, n.title, n.url, n.summary, n.source, n.published_at, n.raw_text \
             FROM news_items n \
             LEFT JOIN posts p ON p.news_item_id = n.id \
             LEFT JOIN generation_attempts g ON g.news_item_id = n.id \
             WHERE p.id IS NULL \
               AND (g.news_item_id IS NULL \
                    OR (g.next_attempt_at <= ?1 AND (?2 IS NULL OR g.attempts < ?2))) \
             ORDER BY n.published_at ASC \
             LIMIT ?3",
        )
        .bind(now)
        .bind(max_attempts.map(i64::from))
        .bind(limit.map(|l| l as i64).unwrap_or(-1))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(news_item_from_row).collect()
    }

    /// Create the draft post for `news_item_id` unless one already exists.
    /// Returns `None` when another post won the race.
    pub async fn create_draft_post(
        &self,
        news_item_id: Uuid,
        title: &str,
        content: &str,
    ) -> Result<Option<Post>> {
        let id = Uuid::new_v4();
        let res = sqlx::query(
            "INSERT INTO posts (id, news_item_id, title, content, status, created_at, attempts) \
             SELECT ?1, ?2, ?3, ?4, 'draft', ?5, 0 \
             WHERE NOT EXISTS (SELECT 1 FROM posts WHERE news_item_id = ?2)",
        )
        .bind(id.to_string())
        .bind(news_item_id.to_string())
        .bind(title)
        .bind(content)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_post(id).await
    }

    /// Count one failed generation attempt and schedule the next one.
    /// Returns the new attempt count.
    pub async fn record_generation_failure(
        &self,
        news_item_id: Uuid,
        error: &str,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<u32> {
        let mut tx = self.begin().await?;
        let prev: Option<i64> =
            sqlx::query_scalar("SELECT attempts FROM generation_attempts WHERE news_item_id = ?1")
                .bind(news_item_id.to_string())
                .fetch_optional(&mut *tx)
                .await?;
        let attempts = u32::try_from(prev.unwrap_or(0)).unwrap_or(0).saturating_add(1);
        let next = policy.next_attempt_at(attempts, now);
        sqlx::query(
            "INSERT INTO generation_attempts \
                 (news_item_id, attempts, last_error, last_attempt_at, next_attempt_at) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(news_item_id) DO UPDATE SET \
                 attempts = excluded.attempts, \
                 last_error = excluded.last_error, \
                 last_attempt_at = excluded.last_attempt_at, \
                 next_attempt_at = excluded.next_attempt_at",
        )
        .bind(news_item_id.to_string())
        .bind(i64::from(attempts))
        .bind(error)
        .bind(now)
        .bind(next)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(attempts)
    }

    pub async fn generation_attempts(&self, news_item_id: Uuid) -> Result<u32> {
        let n: Option<i64> =
            sqlx::query_scalar("SELECT attempts FROM generation_attempts WHERE news_item_id = ?1")
                .bind(news_item_id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        Ok(n.and_then(|n| u32::try_from(n).ok()).unwrap_or(0))
    }

    // ------------------------------------------------------------
    // Posts
    // ------------------------------------------------------------

    pub async fn get_post(&self, id: Uuid) -> Result<Option<Post>> {
        let row = sqlx::query(&format!("SELECT {POST_COLUMNS} FROM posts WHERE id = ?1"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(post_from_row).transpose()
    }

    pub async fn post_for_item(&self, news_item_id: Uuid) -> Result<Vec<Post>> {
        let rows = sqlx::query(&format!(
            "SELECT {POST_COLUMNS} FROM posts WHERE news_item_id = ?1 ORDER BY created_at"
        ))
        .bind(news_item_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(post_from_row).collect()
    }

    pub async fn posts_by_status(
        &self,
        status: PostStatus,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Post>> {
        let rows = sqlx::query(&format!(
            "SELECT {POST_COLUMNS} FROM posts WHERE status = ?1 \
             ORDER BY created_at LIMIT ?2 OFFSET ?3"
        ))
        .bind(status.as_str())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(post_from_row).collect()
    }

    /// Apply the `Some` fields of `update`. A status change must be a legal
    /// state-machine edge; leaving `claimed` drops the claim.
    pub async fn update_post(&self, id: Uuid, update: &PostUpdate) -> Result<Option<Post>> {
        let mut tx = self.begin().await?;
        let row = sqlx::query(&format!("SELECT {POST_COLUMNS} FROM posts WHERE id = ?1"))
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        let Some(current) = row.as_ref().map(post_from_row).transpose()? else {
            return Ok(None);
        };
        if let Some(next) = update.status {
            if next != current.status && !current.status.can_transition_to(next) {
                return Err(StoreError::InvalidTransition {
                    id,
                    from: current.status,
                    to: next,
                });
            }
        }
        if update.is_empty() {
            return Ok(Some(current));
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE posts SET ");
        {
            let mut set = qb.separated(", ");
            if let Some(title) = &update.title {
                set.push("title = ").push_bind_unseparated(title.clone());
            }
            if let Some(content) = &update.content {
                set.push("content = ").push_bind_unseparated(content.clone());
            }
            if let Some(status) = update.status {
                set.push("status = ").push_bind_unseparated(status.as_str());
                if status != PostStatus::Claimed {
                    set.push("claim_token = NULL");
                    set.push("claimed_at = NULL");
                }
            }
        }
        qb.push(" WHERE id = ").push_bind(id.to_string());
        qb.push(format!(" RETURNING {POST_COLUMNS}"));
        let row = qb.build().fetch_one(&mut *tx).await?;
        let updated = post_from_row(&row)?;
        tx.commit().await?;
        Ok(Some(updated))
    }

    /// Atomically move up to `limit` eligible drafts to `claimed` under a new
    /// token. Concurrent callers never receive the same post.
    pub async fn claim_drafts(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        max_attempts: Option<u32>,
    ) -> Result<Claim> {
        let token = Uuid::new_v4().to_string();
        let rows = sqlx::query(&format!(
            "UPDATE posts SET status = 'claimed', claim_token = ?1, claimed_at = ?2 \
             WHERE id IN ( \
                 SELECT id FROM posts \
                 WHERE status = 'draft' \
                   AND (retry_after IS NULL OR retry_after <= ?2) \
                   AND (?3 IS NULL OR attempts < ?3) \
                 ORDER BY created_at ASC \
                 LIMIT ?4) \
             RETURNING {POST_COLUMNS}"
        ))
        .bind(&token)
        .bind(now)
        .bind(max_attempts.map(i64::from))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut posts = rows.iter().map(post_from_row).collect::<Result<Vec<_>>>()?;
        posts.sort_by_key(|p| p.created_at);
        debug!(claimed = posts.len(), %token, "claimed drafts");
        Ok(Claim { token, posts })
    }

    /// claimed → published. `false` if the claim was lost in the meantime.
    pub async fn mark_published(&self, id: Uuid, token: &str) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE posts SET status = 'published', attempts = attempts + 1, last_error = NULL, \
                 retry_after = NULL, claim_token = NULL, claimed_at = NULL \
             WHERE id = ?1 AND status = 'claimed' AND claim_token = ?2",
        )
        .bind(id.to_string())
        .bind(token)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    /// claimed → failed, recording the error and the earliest retry time.
    pub async fn mark_failed(
        &self,
        id: Uuid,
        token: &str,
        error: &str,
        retry_after: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE posts SET status = 'failed', attempts = attempts + 1, last_error = ?3, \
                 retry_after = ?4, claim_token = NULL, claimed_at = NULL \
             WHERE id = ?1 AND status = 'claimed' AND claim_token = ?2",
        )
        .bind(id.to_string())
        .bind(token)
        .bind(error)
        .bind(retry_after)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    /// claimed → draft for every post still held by `token`.
    pub async fn release_claim(&self, token: &str) -> Result<u64> {
        self.release_claim_except(token, None).await
    }

    /// Like [`Store::release_claim`] but leaves `keep` claimed.
    pub async fn release_claim_except(&self, token: &str, keep: Option<Uuid>) -> Result<u64> {
        let res = sqlx::query(
            "UPDATE posts SET status = 'draft', claim_token = NULL, claimed_at = NULL \
             WHERE status = 'claimed' AND claim_token = ?1 AND (?2 IS NULL OR id <> ?2)",
        )
        .bind(token)
        .bind(keep.map(|id| id.to_string()))
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    /// claimed → draft for claims older than `cutoff` (crashed runs).
    pub async fn release_stale_claims(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let res = sqlx::query(
            "UPDATE posts SET status = 'draft', claim_token = NULL, claimed_at = NULL \
             WHERE status = 'claimed' AND claimed_at < ?1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    /// failed → draft for every failed post, in one statement.
    pub async fn retry_failed(&self) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            "UPDATE posts SET status = 'draft' WHERE status = 'failed' RETURNING id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|r| parse_uuid(r, "id")).collect()
    }

    // ------------------------------------------------------------
    // Counters
    // ------------------------------------------------------------

    pub async fn news_stats(&self) -> Result<NewsStats> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM news_items")
            .fetch_one(&self.pool)
            .await?;
        let processed: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM news_items n \
             WHERE EXISTS (SELECT 1 FROM posts p WHERE p.news_item_id = n.id)",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(NewsStats {
            total,
            processed,
            unprocessed: total - processed,
        })
    }

    pub async fn post_stats(&self) -> Result<PostStats> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM posts GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut stats = PostStats::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            stats.total += n;
            match PostStatus::from_str(&status).map_err(StoreError::decode)? {
                PostStatus::Draft => stats.draft = n,
                PostStatus::Claimed => stats.claimed = n,
                PostStatus::Published => stats.published = n,
                PostStatus::Failed => stats.failed = n,
            }
        }
        Ok(stats)
    }

    pub async fn stats(&self) -> Result<Stats> {
        Ok(Stats {
            news: self.news_stats().await?,
            posts: self.post_stats().await?,
        })
    }
}

// ------------------------------------------------------------
// Row mapping
// ------------------------------------------------------------

fn parse_uuid(row: &SqliteRow, col: &str) -> Result<Uuid> {
    let raw: String = row.try_get(col)?;
    Uuid::parse_str(&raw).map_err(|e| StoreError::decode(format!("{col}={raw}: {e}")))
}

fn news_item_from_row(row: &SqliteRow) -> Result<NewsItem> {
    Ok(NewsItem {
        id: parse_uuid(row, "id")?,
        title: row.try_get("title")?,
        url: row.try_get("url")?,
        summary: row.try_get("summary")?,
        source: row.try_get("source")?,
        published_at: row.try_get("published_at")?,
        raw_text: row.try_get("raw_text")?,
    })
}

fn post_from_row(row: &SqliteRow) -> Result<Post> {
    let status: String = row.try_get("status")?;
    let attempts: i64 = row.try_get("attempts")?;
    Ok(Post {
        id: parse_uuid(row, "id")?,
        news_item_id: parse_uuid(row, "news_item_id")?,
        title: row.try_get("title")?,
        content: row.try_get("content")?,
        status: PostStatus::from_str(&status).map_err(StoreError::decode)?,
        created_at: row.try_get("created_at")?,
        attempts: u32::try_from(attempts).map_err(StoreError::decode)?,
        last_error: row.try_get("last_error")?,
        retry_after: row.try_get("retry_after")?,
    })
}

fn source_from_row(row: &SqliteRow) -> Result<NewsSource> {
    let parser: String = row.try_get("parser")?;
    Ok(NewsSource {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        url: row.try_get("url")?,
        is_active: row.try_get("is_active")?,
        parser: ParserKind::from_str(&parser).map_err(StoreError::decode)?,
    })
}
