//! Normalized layout: one `tag_map` row per (tag, post) pair.
//!
//! Resolution runs entirely in SQL. Positive terms become a grouped
//! `tag IN (..)` scan whose group size must equal the number of distinct
//! positive tags; negative terms become a `NOT IN` subquery.

use std::{
    collections::{HashMap, HashSet},
    path::Path,
    time::Duration,
};

use parking_lot::Mutex;
use rusqlite::{
    Connection, OptionalExtension, Transaction, params, params_from_iter,
    types::Value,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    post::{Post, PostStore},
    post_id::PostId,
    query::FilteredQuery,
    resolver::check_cancelled,
    tag_index::{IndexLayout, TagIndex},
};

/// Host parameters per statement, well under SQLite's compiled limit.
const CHUNK: usize = 500;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS posts (
    post_id     INTEGER PRIMARY KEY,
    filename    TEXT NOT NULL,
    ext         TEXT NOT NULL,
    description TEXT NOT NULL,
    poster      TEXT NOT NULL,
    mime_type   TEXT NOT NULL,
    created_at  INTEGER NOT NULL,
    tags        TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS tag_map (
    tag     TEXT NOT NULL,
    post_id INTEGER NOT NULL,
    PRIMARY KEY (tag, post_id)
) WITHOUT ROWID;
CREATE INDEX IF NOT EXISTS idx_tag_map_post ON tag_map(post_id);
";

const POST_COLUMNS: &str =
    "post_id, filename, ext, description, poster, mime_type, created_at, tags";

pub struct JoinTableStore {
    conn: Mutex<Connection>,
}

impl JoinTableStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            r"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

/// `?, ?, ?` for `n` parameters.
fn placeholders(n: usize) -> String {
    let mut out = String::with_capacity(n * 3);
    for i in 0..n {
        if i > 0 {
            out.push_str(", ");
        }
        out.push('?');
    }
    out
}

fn text_values<'a>(tags: impl Iterator<Item = &'a str>) -> Vec<Value> {
    tags.map(|t| Value::Text(t.to_string())).collect()
}

struct PostRow {
    id: i64,
    filename: String,
    extension: String,
    description: String,
    poster: String,
    mime_type: String,
    created_at: i64,
    tags: String,
}

impl PostRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            filename: row.get(1)?,
            extension: row.get(2)?,
            description: row.get(3)?,
            poster: row.get(4)?,
            mime_type: row.get(5)?,
            created_at: row.get(6)?,
            tags: row.get(7)?,
        })
    }

    fn into_post(self) -> Result<Post> {
        Ok(Post {
            id: PostId::from_i64(self.id),
            tags: serde_json::from_str(&self.tags)?,
            filename: self.filename,
            extension: self.extension,
            description: self.description,
            poster: self.poster,
            mime_type: self.mime_type,
            created_at: u64::try_from(self.created_at).unwrap_or_default(),
        })
    }
}

fn load_post(conn: &Connection, id: PostId) -> Result<Option<Post>> {
    conn.query_row(
        &format!("SELECT {POST_COLUMNS} FROM posts WHERE post_id = ?1"),
        params![id.as_i64()],
        PostRow::from_row,
    )
    .optional()?
    .map(PostRow::into_post)
    .transpose()
}

fn write_post(tx: &Transaction<'_>, post: &Post) -> Result<()> {
    tx.execute(
        &format!(
            "INSERT OR REPLACE INTO posts ({POST_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
        ),
        params![
            post.id.as_i64(),
            post.filename,
            post.extension,
            post.description,
            post.poster,
            post.mime_type,
            i64::try_from(post.created_at).unwrap_or(i64::MAX),
            serde_json::to_string(&post.tags)?,
        ],
    )?;
    replace_tags(tx, post.id, &post.tags)
}

fn replace_tags(tx: &Transaction<'_>, id: PostId, tags: &[String]) -> Result<()> {
    tx.execute("DELETE FROM tag_map WHERE post_id = ?1", params![id.as_i64()])?;
    let mut insert = tx.prepare_cached(
        "INSERT OR IGNORE INTO tag_map (tag, post_id) VALUES (?1, ?2)",
    )?;
    for tag in tags {
        insert.execute(params![tag, id.as_i64()])?;
    }
    Ok(())
}

impl PostStore for JoinTableStore {
    fn get(&self, id: PostId) -> Result<Post> {
        load_post(&self.conn.lock(), id)?.ok_or_else(|| Error::post_not_found(id))
    }

    fn get_many(&self, ids: &[PostId]) -> Result<Vec<Post>> {
        let conn = self.conn.lock();
        let mut found: HashMap<PostId, Post> = HashMap::with_capacity(ids.len());
        for chunk in ids.chunks(CHUNK) {
            let sql = format!(
                "SELECT {POST_COLUMNS} FROM posts WHERE post_id IN ({})",
                placeholders(chunk.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params_from_iter(chunk.iter().map(|id| id.as_i64())),
                PostRow::from_row,
            )?;
            for row in rows {
                let post = row?.into_post()?;
                found.insert(post.id, post);
            }
        }

        let mut posts = Vec::with_capacity(ids.len());
        for id in ids {
            match found.remove(id) {
                Some(post) => posts.push(post),
                None => warn!(%id, "indexed post has no metadata row"),
            }
        }
        Ok(posts)
    }

    fn all_ids(&self) -> Result<Vec<PostId>> {
        self.all_post_ids()
    }

    fn count(&self) -> Result<usize> {
        let n: i64 = self.conn.lock().query_row(
            "SELECT COUNT(*) FROM posts",
            [],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(n).unwrap_or_default())
    }

    fn create(&self, post: &Post) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM posts WHERE post_id = ?1)",
            params![post.id.as_i64()],
            |row| row.get(0),
        )?;
        if exists {
            return Err(Error::AlreadyExists {
                kind: "post",
                name: post.id.to_string(),
            });
        }
        write_post(&tx, post)?;
        tx.commit()?;
        debug!(id = %post.id, tags = post.tags.len(), "stored post");
        Ok(())
    }

    fn update(&self, post: &Post) -> Result<Post> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let previous =
            load_post(&tx, post.id)?.ok_or_else(|| Error::post_not_found(post.id))?;
        write_post(&tx, post)?;
        tx.commit()?;
        Ok(previous)
    }

    fn delete(&self, id: PostId) -> Result<Post> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let previous = load_post(&tx, id)?.ok_or_else(|| Error::post_not_found(id))?;
        tx.execute("DELETE FROM tag_map WHERE post_id = ?1", params![id.as_i64()])?;
        tx.execute("DELETE FROM posts WHERE post_id = ?1", params![id.as_i64()])?;
        tx.commit()?;
        Ok(previous)
    }
}

impl TagIndex for JoinTableStore {
    fn layout(&self) -> IndexLayout {
        IndexLayout::JoinTable
    }

    fn posts_for_tags(
        &self,
        tags: &[&str],
    ) -> Result<HashMap<String, Vec<PostId>>> {
        let mut out: HashMap<String, Vec<PostId>> = HashMap::new();
        if tags.is_empty() {
            return Ok(out);
        }
        let conn = self.conn.lock();
        for chunk in tags.chunks(CHUNK) {
            let sql = format!(
                "SELECT tag, post_id FROM tag_map WHERE tag IN ({})",
                placeholders(chunk.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (tag, id) = row?;
                out.entry(tag).or_default().push(PostId::from_i64(id));
            }
        }
        Ok(out)
    }

    fn all_post_ids(&self) -> Result<Vec<PostId>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT post_id FROM posts")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .map(|id| id.map(PostId::from_i64))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    fn tags_for_post(&self, id: PostId) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT tag FROM tag_map WHERE post_id = ?1 ORDER BY tag",
        )?;
        let tags = stmt
            .query_map(params![id.as_i64()], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(tags)
    }

    fn set_tags_for_post(&self, id: PostId, tags: &[String]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut post =
            load_post(&tx, id)?.ok_or_else(|| Error::post_not_found(id))?;
        post.tags = tags.to_vec();
        write_post(&tx, &post)?;
        tx.commit()?;
        Ok(())
    }

    fn tag_counts(
        &self,
        ids: &[PostId],
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, usize>> {
        let conn = self.conn.lock();
        let mut counts: HashMap<String, usize> = HashMap::new();
        for chunk in ids.chunks(CHUNK) {
            check_cancelled(cancel)?;
            let sql = format!(
                "SELECT tag, COUNT(*) FROM tag_map
                 WHERE post_id IN ({}) GROUP BY tag",
                placeholders(chunk.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params_from_iter(chunk.iter().map(|id| id.as_i64())),
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )?;
            for row in rows {
                let (tag, n) = row?;
                *counts.entry(tag).or_insert(0) +=
                    usize::try_from(n).unwrap_or_default();
            }
        }
        Ok(counts)
    }

    fn resolve(
        &self,
        query: &FilteredQuery,
        cancel: &CancellationToken,
    ) -> Result<HashSet<PostId>> {
        check_cancelled(cancel)?;

        let positives: Vec<&str> = query.positive_tags().collect();
        let negatives = query.exclude();
        let mut args: Vec<Value> = Vec::new();

        let exclusion = if negatives.is_empty() {
            String::new()
        } else {
            format!(
                "post_id NOT IN (SELECT post_id FROM tag_map WHERE tag IN ({}))",
                placeholders(negatives.len())
            )
        };

        let sql = if query.is_wildcard_based() {
            args.extend(text_values(negatives.iter().map(String::as_str)));
            if exclusion.is_empty() {
                "SELECT post_id FROM posts".to_string()
            } else {
                format!("SELECT post_id FROM posts WHERE {exclusion}")
            }
        } else {
            args.extend(text_values(positives.iter().copied()));
            args.extend(text_values(negatives.iter().map(String::as_str)));
            args.push(Value::Integer(positives.len() as i64));
            let and_exclusion = if exclusion.is_empty() {
                String::new()
            } else {
                format!(" AND {exclusion}")
            };
            format!(
                "SELECT post_id FROM tag_map
                 WHERE tag IN ({}){and_exclusion}
                 GROUP BY post_id
                 HAVING COUNT(DISTINCT tag) = ?",
                placeholders(positives.len())
            )
        };

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let ids = stmt
            .query_map(params_from_iter(args), |row| row.get::<_, i64>(0))?
            .map(|id| id.map(PostId::from_i64))
            .collect::<rusqlite::Result<HashSet<_>>>()?;
        Ok(ids)
    }
}
