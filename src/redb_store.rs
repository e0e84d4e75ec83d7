//! Denormalized layout: one row per tag holding the ids of every post that
//! carries it.
//!
//! Tag rows are rewritten read-modify-write inside the same write
//! transaction as the post row, so a reader never sees a post without its
//! tag rows or the other way round.

use std::{collections::HashMap, path::Path};

use redb::{
    Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, Table,
    TableDefinition, WriteTransaction,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    post::{Post, PostStore},
    post_id::PostId,
    resolver::check_cancelled,
    tag_index::{IndexLayout, TagIndex},
};

/// Post id → post as JSON.
const POSTS: TableDefinition<u64, &str> = TableDefinition::new("posts");
/// Tag → sorted JSON array of raw post ids.
const TAGS: TableDefinition<&str, &str> = TableDefinition::new("tags");
/// Post id → JSON array of its tags, so tag lookups skip the metadata.
const POST_TAGS: TableDefinition<u64, &str> = TableDefinition::new("post_tags");

pub struct BlobStore {
    db: Database,
}

impl BlobStore {
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        txn.open_table(POSTS)?;
        txn.open_table(TAGS)?;
        txn.open_table(POST_TAGS)?;
        txn.commit()?;

        Ok(Self { db })
    }

    fn load(txn: &WriteTransaction, id: PostId) -> Result<Option<Post>> {
        let table = txn.open_table(POSTS)?;
        let json = table.get(id.raw())?.map(|v| v.value().to_string());
        Ok(json.map(|j| serde_json::from_str(&j)).transpose()?)
    }
}

fn decode_ids(json: &str) -> Result<Vec<u64>> {
    Ok(serde_json::from_str(json)?)
}

fn add_to_tag(
    table: &mut Table<'_, &'static str, &'static str>,
    tag: &str,
    id: u64,
) -> Result<()> {
    let existing = table.get(tag)?.map(|v| v.value().to_string());
    let mut ids = match existing {
        Some(json) => decode_ids(&json)?,
        None => Vec::new(),
    };
    if let Err(pos) = ids.binary_search(&id) {
        ids.insert(pos, id);
        table.insert(tag, serde_json::to_string(&ids)?.as_str())?;
    }
    Ok(())
}

fn remove_from_tag(
    table: &mut Table<'_, &'static str, &'static str>,
    tag: &str,
    id: u64,
) -> Result<()> {
    let Some(json) = table.get(tag)?.map(|v| v.value().to_string()) else {
        return Ok(());
    };
    let mut ids = decode_ids(&json)?;
    if let Ok(pos) = ids.binary_search(&id) {
        ids.remove(pos);
        if ids.is_empty() {
            table.remove(tag)?;
        } else {
            table.insert(tag, serde_json::to_string(&ids)?.as_str())?;
        }
    }
    Ok(())
}

/// Move `id` from the rows of `old` tags to the rows of `new` tags.
fn retag(
    txn: &WriteTransaction,
    id: PostId,
    old: &[String],
    new: &[String],
) -> Result<()> {
    let mut table = txn.open_table(TAGS)?;
    for tag in old.iter().filter(|t| !new.contains(t)) {
        remove_from_tag(&mut table, tag, id.raw())?;
    }
    for tag in new.iter().filter(|t| !old.contains(t)) {
        add_to_tag(&mut table, tag, id.raw())?;
    }
    Ok(())
}

fn write_post(txn: &WriteTransaction, post: &Post) -> Result<()> {
    let json = serde_json::to_string(post)?;
    txn.open_table(POSTS)?.insert(post.id.raw(), json.as_str())?;
    let tags = serde_json::to_string(&post.tags)?;
    txn.open_table(POST_TAGS)?.insert(post.id.raw(), tags.as_str())?;
    Ok(())
}

impl PostStore for BlobStore {
    fn get(&self, id: PostId) -> Result<Post> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(POSTS)?;
        let json = table
            .get(id.raw())?
            .map(|v| v.value().to_string())
            .ok_or_else(|| Error::post_not_found(id))?;
        Ok(serde_json::from_str(&json)?)
    }

    fn get_many(&self, ids: &[PostId]) -> Result<Vec<Post>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(POSTS)?;
        let mut posts = Vec::with_capacity(ids.len());
        for &id in ids {
            match table.get(id.raw())? {
                Some(v) => posts.push(serde_json::from_str(v.value())?),
                None => warn!(%id, "indexed post has no metadata row"),
            }
        }
        Ok(posts)
    }

    fn all_ids(&self) -> Result<Vec<PostId>> {
        self.all_post_ids()
    }

    fn count(&self) -> Result<usize> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(POSTS)?;
        Ok(usize::try_from(table.len()?).unwrap_or(usize::MAX))
    }

    fn create(&self, post: &Post) -> Result<()> {
        let txn = self.db.begin_write()?;
        if Self::load(&txn, post.id)?.is_some() {
            return Err(Error::AlreadyExists {
                kind: "post",
                name: post.id.to_string(),
            });
        }
        write_post(&txn, post)?;
        retag(&txn, post.id, &[], &post.tags)?;
        txn.commit()?;
        debug!(id = %post.id, tags = post.tags.len(), "stored post");
        Ok(())
    }

    fn update(&self, post: &Post) -> Result<Post> {
        let txn = self.db.begin_write()?;
        let previous = Self::load(&txn, post.id)?
            .ok_or_else(|| Error::post_not_found(post.id))?;
        write_post(&txn, post)?;
        retag(&txn, post.id, &previous.tags, &post.tags)?;
        txn.commit()?;
        Ok(previous)
    }

    fn delete(&self, id: PostId) -> Result<Post> {
        let txn = self.db.begin_write()?;
        let previous =
            Self::load(&txn, id)?.ok_or_else(|| Error::post_not_found(id))?;
        txn.open_table(POSTS)?.remove(id.raw())?;
        txn.open_table(POST_TAGS)?.remove(id.raw())?;
        retag(&txn, id, &previous.tags, &[])?;
        txn.commit()?;
        Ok(previous)
    }
}

impl TagIndex for BlobStore {
    fn layout(&self) -> IndexLayout {
        IndexLayout::Blob
    }

    fn posts_for_tags(
        &self,
        tags: &[&str],
    ) -> Result<HashMap<String, Vec<PostId>>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(TAGS)?;
        let mut out = HashMap::with_capacity(tags.len());
        for &tag in tags {
            if let Some(v) = table.get(tag)? {
                let ids = decode_ids(v.value())?
                    .into_iter()
                    .map(PostId::from_raw)
                    .collect();
                out.insert(tag.to_string(), ids);
            }
        }
        Ok(out)
    }

    fn all_post_ids(&self) -> Result<Vec<PostId>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(POSTS)?;
        let mut ids = Vec::new();
        for entry in table.iter()? {
            let (k, _v) = entry?;
            ids.push(PostId::from_raw(k.value()));
        }
        Ok(ids)
    }

    fn tags_for_post(&self, id: PostId) -> Result<Vec<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(POST_TAGS)?;
        match table.get(id.raw())? {
            Some(v) => Ok(serde_json::from_str(v.value())?),
            None => Ok(Vec::new()),
        }
    }

    fn tag_counts(
        &self,
        ids: &[PostId],
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, usize>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(POST_TAGS)?;
        let mut counts = HashMap::new();
        for &id in ids {
            check_cancelled(cancel)?;
            if let Some(v) = table.get(id.raw())? {
                for tag in serde_json::from_str::<Vec<String>>(v.value())? {
                    *counts.entry(tag).or_insert(0) += 1;
                }
            }
        }
        Ok(counts)
    }

    fn set_tags_for_post(&self, id: PostId, tags: &[String]) -> Result<()> {
        let txn = self.db.begin_write()?;
        let mut post =
            Self::load(&txn, id)?.ok_or_else(|| Error::post_not_found(id))?;
        let old = std::mem::replace(&mut post.tags, tags.to_vec());
        write_post(&txn, &post)?;
        retag(&txn, id, &old, tags)?;
        txn.commit()?;
        Ok(())
    }
}

impl std::fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::ErrorKind, post_id::EPOCH_MS, query::filter_terms};

    fn test_store() -> (tempfile::TempDir, BlobStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = BlobStore::open(&tmp.path().join("posts.redb")).unwrap();
        (tmp, store)
    }

    fn post(n: u64, tags: &[&str]) -> Post {
        Post {
            id: PostId::from_parts(EPOCH_MS + n * 1000, 1, 0),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            filename: format!("file{n}"),
            extension: "jpg".to_string(),
            description: "a description".to_string(),
            poster: "bob".to_string(),
            mime_type: "image/jpeg".to_string(),
            created_at: 1_700_000_000 + n,
        }
    }

    #[test]
    fn posts_crud() {
        let (_tmp, store) = test_store();
        let p = post(1, &["cat", "user:bob"]);

        store.create(&p).unwrap();
        assert_eq!(store.get(p.id).unwrap(), p);
        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(store.all_ids().unwrap(), vec![p.id]);
        assert_eq!(store.create(&p).unwrap_err().kind(), ErrorKind::Conflict);

        let removed = store.delete(p.id).unwrap();
        assert_eq!(removed, p);
        assert_eq!(store.count().unwrap(), 0);
        assert_eq!(store.get(p.id).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn tag_rows_follow_post_writes() {
        let (_tmp, store) = test_store();
        let a = post(1, &["cat", "user:bob"]);
        let b = post(2, &["cat", "dog", "user:bob"]);
        store.create(&a).unwrap();
        store.create(&b).unwrap();

        assert_eq!(store.posts_for_tag("cat").unwrap(), vec![a.id, b.id]);
        assert_eq!(store.posts_for_tag("dog").unwrap(), vec![b.id]);

        let mut edited = b.clone();
        edited.tags = vec!["bird".to_string(), "user:bob".to_string()];
        store.update(&edited).unwrap();
        assert_eq!(store.posts_for_tag("cat").unwrap(), vec![a.id]);
        assert!(store.posts_for_tag("dog").unwrap().is_empty());
        assert_eq!(store.posts_for_tag("bird").unwrap(), vec![b.id]);

        store.delete(a.id).unwrap();
        assert!(store.posts_for_tag("cat").unwrap().is_empty());
        assert_eq!(store.posts_for_tag("user:bob").unwrap(), vec![b.id]);
    }

    #[test]
    fn set_tags_updates_post_and_rows() {
        let (_tmp, store) = test_store();
        let p = post(1, &["cat", "user:bob"]);
        store.create(&p).unwrap();

        let tags = vec!["fox".to_string(), "user:bob".to_string()];
        store.set_tags_for_post(p.id, &tags).unwrap();
        assert_eq!(store.tags_for_post(p.id).unwrap(), tags);
        assert_eq!(store.posts_for_tag("fox").unwrap(), vec![p.id]);
        assert!(store.posts_for_tag("cat").unwrap().is_empty());
    }

    #[test]
    fn in_memory_resolution() {
        let (_tmp, store) = test_store();
        let a = post(1, &["a", "b"]);
        let b = post(2, &["a"]);
        let c = post(3, &["b"]);
        for p in [&a, &b, &c] {
            store.create(p).unwrap();
        }
        let cancel = CancellationToken::new();

        let got = store.resolve(&filter_terms(&["a", "-b"]), &cancel).unwrap();
        assert_eq!(got.into_iter().collect::<Vec<_>>(), vec![b.id]);

        let got = store.resolve(&filter_terms(&["-a"]), &cancel).unwrap();
        assert_eq!(got.into_iter().collect::<Vec<_>>(), vec![c.id]);
    }

    #[test]
    fn reopen_preserves_data() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("posts.redb");
        let p = post(1, &["cat"]);

        {
            let store = BlobStore::open(&path).unwrap();
            store.create(&p).unwrap();
        }

        let store = BlobStore::open(&path).unwrap();
        assert_eq!(store.get(p.id).unwrap(), p);
        assert_eq!(store.posts_for_tag("cat").unwrap(), vec![p.id]);
    }

    #[test]
    fn tag_counts_read_the_tag_table() {
        let (_tmp, store) = test_store();
        let a = post(1, &["cat", "user:bob"]);
        let b = post(2, &["cat", "dog", "user:bob"]);
        store.create(&a).unwrap();
        store.create(&b).unwrap();

        let counts = store
            .tag_counts(&[a.id, b.id], &CancellationToken::new())
            .unwrap();
        assert_eq!(counts["cat"], 2);
        assert_eq!(counts["dog"], 1);
        assert_eq!(counts["user:bob"], 2);

        // The tag table alone answers lookups, without the post row.
        let txn = store.db.begin_write().unwrap();
        txn.open_table(POSTS).unwrap().remove(a.id.raw()).unwrap();
        txn.commit().unwrap();
        assert_eq!(store.tags_for_post(a.id).unwrap(), a.tags);

        store.delete(b.id).unwrap();
        assert!(store.tags_for_post(b.id).unwrap().is_empty());
        let counts = store
            .tag_counts(&[a.id, b.id], &CancellationToken::new())
            .unwrap();
        assert_eq!(counts.get("dog"), None);
        assert_eq!(counts["cat"], 1);
    }

    #[test]
    fn missing_post_has_no_tags() {
        let (_tmp, store) = test_store();
        let ghost = PostId::from_parts(EPOCH_MS, 1, 0);
        assert!(store.tags_for_post(ghost).unwrap().is_empty());
        assert_eq!(
            store.set_tags_for_post(ghost, &[]).unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }
}
