use std::collections::HashSet;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    error::{Error, Result},
    post_id::{self, PostId},
    query::FilteredQuery,
    tag_index::TagIndex,
};

/// Set algebra over per-tag id lists.
///
/// Every tag the query mentions is fetched in one batched call. Positive
/// legs are intersected smallest first, and an empty leg ends the query
/// before the negatives are looked at. Negatives are unioned and
/// subtracted. A wildcard query starts from every post id instead.
pub fn resolve_in_memory<I: TagIndex + ?Sized>(
    index: &I,
    query: &FilteredQuery,
    cancel: &CancellationToken,
) -> Result<HashSet<PostId>> {
    check_cancelled(cancel)?;

    let tags: Vec<&str> = query.tags().collect();
    let mut by_tag = if tags.is_empty() {
        Default::default()
    } else {
        index.posts_for_tags(&tags)?
    };
    check_cancelled(cancel)?;

    let mut matched: HashSet<PostId> = if query.is_wildcard_based() {
        index.all_post_ids()?.into_iter().collect()
    } else {
        let mut legs = Vec::new();
        for tag in query.positive_tags() {
            match by_tag.remove(tag) {
                Some(ids) if !ids.is_empty() => legs.push(ids),
                _ => {
                    debug!(%query, tag, "positive term has no posts");
                    return Ok(HashSet::new());
                }
            }
        }
        legs.sort_by_key(Vec::len);

        let mut legs = legs.into_iter();
        let mut acc: HashSet<PostId> =
            legs.next().unwrap_or_default().into_iter().collect();
        for leg in legs {
            let leg: HashSet<PostId> = leg.into_iter().collect();
            acc.retain(|id| leg.contains(id));
            if acc.is_empty() {
                return Ok(acc);
            }
        }
        acc
    };

    for tag in query.exclude() {
        if matched.is_empty() {
            break;
        }
        if let Some(ids) = by_tag.get(tag.as_str()) {
            for id in ids {
                matched.remove(id);
            }
        }
    }

    Ok(matched)
}

/// Resolve through the index and order newest first.
///
/// Any failure is wrapped in [`Error::Resolve`] naming the query, except
/// cancellation which is passed through as is.
pub fn resolve_sorted(
    index: &dyn TagIndex,
    query: &FilteredQuery,
    cancel: &CancellationToken,
) -> Result<Vec<PostId>> {
    let matched = index.resolve(query, cancel).map_err(|e| match e {
        Error::Cancelled => Error::Cancelled,
        other => Error::Resolve {
            query: query.key(),
            source: Box::new(other),
        },
    })?;

    let mut ids: Vec<PostId> = matched.into_iter().collect();
    post_id::sort_newest_first(&mut ids);
    debug!(
        %query,
        layout = %index.layout(),
        matches = ids.len(),
        "resolved query"
    );
    Ok(ids)
}

pub(crate) fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use parking_lot::Mutex;

    use super::*;
    use crate::{
        post_id::EPOCH_MS,
        query::filter_terms,
        tag_index::IndexLayout,
    };

    /// A tag index held in memory, counting round trips.
    #[derive(Default)]
    struct MemoryIndex {
        posts: HashMap<PostId, Vec<String>>,
        batches: Mutex<usize>,
        fail: bool,
    }

    impl MemoryIndex {
        /// `posts` pairs an id with its space-separated tags.
        fn with(posts: &[(PostId, &str)]) -> Self {
            Self {
                posts: posts
                    .iter()
                    .map(|(id, tags)| {
                        (*id, tags.split(' ').map(str::to_string).collect())
                    })
                    .collect(),
                ..Default::default()
            }
        }
    }

    impl TagIndex for MemoryIndex {
        fn layout(&self) -> IndexLayout {
            IndexLayout::Blob
        }

        fn posts_for_tags(
            &self,
            tags: &[&str],
        ) -> Result<HashMap<String, Vec<PostId>>> {
            *self.batches.lock() += 1;
            if self.fail {
                return Err(Error::Io(std::io::Error::other("index offline")));
            }
            let mut out: HashMap<String, Vec<PostId>> = HashMap::new();
            for (id, post_tags) in &self.posts {
                for tag in tags {
                    if post_tags.iter().any(|t| t == tag) {
                        out.entry(tag.to_string()).or_default().push(*id);
                    }
                }
            }
            Ok(out)
        }

        fn all_post_ids(&self) -> Result<Vec<PostId>> {
            Ok(self.posts.keys().copied().collect())
        }

        fn tags_for_post(&self, id: PostId) -> Result<Vec<String>> {
            Ok(self.posts.get(&id).cloned().unwrap_or_default())
        }

        fn set_tags_for_post(&self, _id: PostId, _tags: &[String]) -> Result<()> {
            unimplemented!("read-only test index")
        }
    }

    fn id(n: u64) -> PostId {
        PostId::from_parts(EPOCH_MS + n * 1000, 1, 0)
    }

    fn fixture() -> MemoryIndex {
        MemoryIndex::with(&[
            (id(1), "a b"),
            (id(2), "a"),
            (id(3), "b"),
        ])
    }

    fn resolve(index: &MemoryIndex, raw: &[&str]) -> HashSet<PostId> {
        resolve_in_memory(index, &filter_terms(raw), &CancellationToken::new())
            .unwrap()
    }

    #[test]
    fn positives_intersect() {
        let index = fixture();
        assert_eq!(resolve(&index, &["a", "b"]), HashSet::from([id(1)]));
    }

    #[test]
    fn negatives_are_subtracted() {
        let index = fixture();
        assert_eq!(resolve(&index, &["a", "-b"]), HashSet::from([id(2)]));
    }

    #[test]
    fn wildcard_matches_everything() {
        let index = fixture();
        assert_eq!(
            resolve(&index, &["*"]),
            HashSet::from([id(1), id(2), id(3)])
        );
    }

    #[test]
    fn pure_negative_subtracts_from_everything() {
        let index = fixture();
        assert_eq!(resolve(&index, &["-a"]), HashSet::from([id(3)]));
    }

    #[test]
    fn unknown_positive_is_empty() {
        let index = fixture();
        assert!(resolve(&index, &["a", "nope", "-b"]).is_empty());
    }

    #[test]
    fn all_tags_fetched_in_one_batch() {
        let index = fixture();
        resolve(&index, &["a", "b", "-c", "-d"]);
        assert_eq!(*index.batches.lock(), 1);
    }

    #[test]
    fn wildcard_alone_skips_tag_lookup() {
        let index = fixture();
        resolve(&index, &[]);
        assert_eq!(*index.batches.lock(), 0);
    }

    #[test]
    fn storage_failure_names_the_query() {
        let index = MemoryIndex {
            fail: true,
            ..fixture()
        };
        let err = resolve_sorted(
            &index,
            &filter_terms(&["a", "-b"]),
            &CancellationToken::new(),
        )
        .unwrap_err();
        match err {
            Error::Resolve { query, .. } => assert_eq!(query, "a+-b"),
            other => panic!("expected resolve error, got {other:?}"),
        }
    }

    #[test]
    fn cancelled_before_start() {
        let index = fixture();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err =
            resolve_sorted(&index, &filter_terms(&["a"]), &cancel).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(*index.batches.lock(), 0);
    }

    #[test]
    fn sorted_newest_first() {
        let index = fixture();
        let ids = resolve_sorted(
            &index,
            &FilteredQuery::wildcard(),
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(ids, vec![id(3), id(2), id(1)]);
    }
}
