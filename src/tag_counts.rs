use std::{cmp::Ordering, collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{cache::TtlCache, query::is_owner_tag};

/// How many posts in a result set carry a tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagCount {
    pub tag: String,
    pub count: usize,
}

/// Query → full tag histogram of its result set, ranked.
///
/// The whole ranking is cached so callers asking for different `n` share an
/// entry.
pub type TagCountsCache = TtlCache<Arc<[TagCount]>>;

/// Count descending, owner tags ahead of ordinary tags on equal counts, then
/// tag name.
fn rank(a: &TagCount, b: &TagCount) -> Ordering {
    b.count
        .cmp(&a.count)
        .then_with(|| is_owner_tag(&b.tag).cmp(&is_owner_tag(&a.tag)))
        .then_with(|| a.tag.cmp(&b.tag))
}

/// Turn raw counts into a ranked histogram.
pub fn rank_tag_counts(counts: HashMap<String, usize>) -> Vec<TagCount> {
    let mut ranked: Vec<TagCount> = counts
        .into_iter()
        .filter(|(_, count)| *count > 0)
        .map(|(tag, count)| TagCount { tag, count })
        .collect();
    ranked.sort_by(rank);
    ranked
}

/// The first `n` entries of a ranked histogram.
pub fn top_n(ranked: &[TagCount], n: usize) -> Vec<TagCount> {
    ranked.iter().take(n).cloned().collect()
}
