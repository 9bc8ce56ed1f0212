// Local store - the durable, ordered feed cache plus pagination bookmarks
mod cursor;
mod remote_keys;

use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use thiserror::Error;

use crate::db::models::{Attachment, Post, RemoteKey};
use crate::db::{self, DbPool};

pub use self::cursor::PostCursor;
pub use self::remote_keys::KeyUpdate;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] r2d2::Error),

    #[error("SQL error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("Migration error: {0}")]
    Migration(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

const POST_COLUMNS: &str = "id, author_id, author, content, published_at, liked_by_me, likes,
     author_avatar, attachment_url, attachment_kind, owned_by_me";

/// SQLite-backed feed cache.
///
/// Every multi-row write runs in one `BEGIN IMMEDIATE` transaction, so
/// writers are serialized and readers never observe a half-applied page.
#[derive(Clone)]
pub struct FeedStore {
    pool: DbPool,
}

impl FeedStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Open (or create) the cache at `path` and bring its schema up to date.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let pool = db::create_pool(path).map_err(|e| StoreError::Migration(e.to_string()))?;
        db::run_migrations(&pool).map_err(|e| StoreError::Migration(e.to_string()))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn get(&self, id: i64) -> StoreResult<Option<Post>> {
        let conn = self.pool.get()?;
        Ok(select_post(&conn, id)?)
    }

    pub fn upsert(&self, post: &Post) -> StoreResult<()> {
        let conn = self.pool.get()?;
        write_post(&conn, post)?;
        Ok(())
    }

    pub fn upsert_all(&self, posts: &[Post]) -> StoreResult<()> {
        self.write(|tx| {
            for post in posts {
                write_post(tx, post)?;
            }
            Ok(())
        })
    }

    /// Replace the whole feed: all posts and all bookmarks go, `posts` and
    /// `keys` come in, atomically.
    pub fn replace_all(&self, posts: &[Post], keys: &[RemoteKey]) -> StoreResult<()> {
        self.write(|tx| {
            tx.execute("DELETE FROM posts", [])?;
            tx.execute("DELETE FROM remote_keys", [])?;
            for post in posts {
                write_post(tx, post)?;
            }
            for key in keys {
                remote_keys::write_key(tx, key)?;
            }
            Ok(())
        })?;
        tracing::debug!("Replaced feed cache with {} posts", posts.len());
        Ok(())
    }

    /// Persist a fetched page and move one bookmark in the same transaction.
    pub fn append_page(&self, posts: &[Post], update: KeyUpdate) -> StoreResult<()> {
        self.write(|tx| {
            for post in posts {
                write_post(tx, post)?;
            }
            remote_keys::apply_update(tx, update)?;
            Ok(())
        })
    }

    /// Delete a post, returning the full row that was removed.
    pub fn remove(&self, id: i64) -> StoreResult<Option<Post>> {
        self.write(|tx| {
            let existing = select_post(tx, id)?;
            if existing.is_some() {
                tx.execute("DELETE FROM posts WHERE id = ?1", params![id])?;
            }
            Ok(existing)
        })
    }

    /// Read-modify-write of a single row. Returns `(before, after)`, or
    /// `None` when the post is not cached.
    pub fn update<F>(&self, id: i64, change: F) -> StoreResult<Option<(Post, Post)>>
    where
        F: FnOnce(&mut Post),
    {
        self.write(|tx| {
            let Some(before) = select_post(tx, id)? else {
                return Ok(None);
            };
            let mut after = before.clone();
            change(&mut after);
            write_post(tx, &after)?;
            Ok(Some((before, after)))
        })
    }

    /// Compare-and-swap on the row with `id`: when the stored row equals
    /// `expected` (`None` meaning absent), it is replaced by `replacement`
    /// (`None` meaning delete). Returns whether the swap happened.
    pub fn swap_if(
        &self,
        id: i64,
        expected: Option<&Post>,
        replacement: Option<&Post>,
    ) -> StoreResult<bool> {
        self.write(|tx| {
            let current = select_post(tx, id)?;
            if current.as_ref() != expected {
                return Ok(false);
            }
            match replacement {
                Some(post) => {
                    if post.id != id {
                        tx.execute("DELETE FROM posts WHERE id = ?1", params![id])?;
                    }
                    write_post(tx, post)?;
                }
                None => {
                    tx.execute("DELETE FROM posts WHERE id = ?1", params![id])?;
                }
            }
            Ok(true)
        })
    }

    /// Id of the newest server-confirmed post in canonical order.
    pub fn newest_id(&self) -> StoreResult<Option<i64>> {
        let conn = self.pool.get()?;
        let id = conn
            .query_row(
                "SELECT id FROM posts WHERE id > 0
                 ORDER BY published_at DESC, id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    pub fn count(&self) -> StoreResult<u64> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM posts", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Up to `limit` posts strictly after `after` in canonical order, or from
    /// the top of the feed when `after` is `None`.
    pub fn page_after(&self, after: Option<(i64, i64)>, limit: usize) -> StoreResult<Vec<Post>> {
        let conn = self.pool.get()?;
        let limit = limit as i64;
        let posts = match after {
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {POST_COLUMNS} FROM posts
                     ORDER BY published_at DESC, id DESC
                     LIMIT ?1"
                ))?;
                let rows = stmt.query_map(params![limit], row_to_post)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            Some((published_at, id)) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {POST_COLUMNS} FROM posts
                     WHERE published_at < ?1 OR (published_at = ?1 AND id < ?2)
                     ORDER BY published_at DESC, id DESC
                     LIMIT ?3"
                ))?;
                let rows = stmt.query_map(params![published_at, id, limit], row_to_post)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(posts)
    }

    /// Every cached post in canonical order.
    pub fn all(&self) -> StoreResult<Vec<Post>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {POST_COLUMNS} FROM posts ORDER BY published_at DESC, id DESC"
        ))?;
        let posts = stmt
            .query_map([], row_to_post)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(posts)
    }

    /// Lazy walk over the cache in canonical order, `chunk` rows at a time.
    pub fn cursor(&self, chunk: usize) -> PostCursor {
        PostCursor::new(self.clone(), chunk)
    }

    /// Run `f` inside one immediate transaction; commit on `Ok`, roll back
    /// on `Err`.
    fn write<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

fn select_post(conn: &Connection, id: i64) -> Result<Option<Post>, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT {POST_COLUMNS} FROM posts WHERE id = ?1"),
        params![id],
        row_to_post,
    )
    .optional()
}

fn write_post(conn: &Connection, post: &Post) -> Result<(), rusqlite::Error> {
    let (attachment_url, attachment_kind) = match &post.attachment {
        Some(a) => (Some(a.url.as_str()), Some(a.kind)),
        None => (None, None),
    };
    conn.execute(
        "INSERT INTO posts (id, author_id, author, content, published_at, liked_by_me, likes,
                            author_avatar, attachment_url, attachment_kind, owned_by_me)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(id) DO UPDATE SET
           author_id = excluded.author_id,
           author = excluded.author,
           content = excluded.content,
           published_at = excluded.published_at,
           liked_by_me = excluded.liked_by_me,
           likes = excluded.likes,
           author_avatar = excluded.author_avatar,
           attachment_url = excluded.attachment_url,
           attachment_kind = excluded.attachment_kind,
           owned_by_me = excluded.owned_by_me",
        params![
            post.id,
            post.author_id,
            post.author,
            post.content,
            post.published_at.timestamp(),
            post.liked_by_me,
            post.like_count,
            post.author_avatar,
            attachment_url,
            attachment_kind,
            post.owned_by_me,
        ],
    )?;
    Ok(())
}

fn row_to_post(row: &Row<'_>) -> Result<Post, rusqlite::Error> {
    let published: i64 = row.get(4)?;
    let published_at = chrono::DateTime::from_timestamp(published, 0)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(4, published))?;
    let attachment_url: Option<String> = row.get(8)?;
    let attachment = match attachment_url {
        Some(url) => Some(Attachment {
            url,
            kind: row.get(9)?,
        }),
        None => None,
    };
    Ok(Post {
        id: row.get(0)?,
        author_id: row.get(1)?,
        author: row.get(2)?,
        content: row.get(3)?,
        published_at,
        liked_by_me: row.get(5)?,
        like_count: row.get(6)?,
        author_avatar: row.get(7)?,
        attachment,
        owned_by_me: row.get(10)?,
    })
}
