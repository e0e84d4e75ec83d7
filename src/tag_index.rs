use std::collections::{HashMap, HashSet};

use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    post_id::PostId,
    query::FilteredQuery,
    resolver,
};

/// Physical layout of the tag index.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum,
)]
pub enum IndexLayout {
    /// One row per (tag, post) pair in SQLite; set algebra runs in SQL.
    #[default]
    #[value(name = "join")]
    JoinTable,
    /// One row per tag holding a JSON list of post ids, in redb.
    #[value(name = "blob")]
    Blob,
}

impl std::fmt::Display for IndexLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexLayout::JoinTable => f.write_str("join"),
            IndexLayout::Blob => f.write_str("blob"),
        }
    }
}

/// Durable tag ↔ post mapping.
///
/// The default [`resolve`](TagIndex::resolve) fetches every tag the query
/// mentions in one batched call and does the set algebra in memory;
/// layouts that can run it in the store override it.
pub trait TagIndex: Send + Sync {
    fn layout(&self) -> IndexLayout;

    /// Post ids per tag. Tags with no posts may be absent from the map.
    fn posts_for_tags(
        &self,
        tags: &[&str],
    ) -> Result<HashMap<String, Vec<PostId>>>;

    fn posts_for_tag(&self, tag: &str) -> Result<Vec<PostId>> {
        Ok(self
            .posts_for_tags(&[tag])?
            .remove(tag)
            .unwrap_or_default())
    }

    /// Every post id, whatever its tags.
    fn all_post_ids(&self) -> Result<Vec<PostId>>;

    fn tags_for_post(&self, id: PostId) -> Result<Vec<String>>;

    /// Replace a post's tags atomically.
    fn set_tags_for_post(&self, id: PostId, tags: &[String]) -> Result<()>;

    /// How many of `ids` carry each tag.
    fn tag_counts(
        &self,
        ids: &[PostId],
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, usize>> {
        let mut counts = HashMap::new();
        for &id in ids {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            for tag in self.tags_for_post(id)? {
                *counts.entry(tag).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    /// Post ids carrying every include term and no exclude term.
    fn resolve(
        &self,
        query: &FilteredQuery,
        cancel: &CancellationToken,
    ) -> Result<HashSet<PostId>> {
        resolver::resolve_in_memory(self, query, cancel)
    }
}
