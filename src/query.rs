//! Query terms and the tag filter.
//!
//! A raw search is a list of terms. A leading `-` negates a term, `*`
//! matches every post. [`filter_terms`] turns any raw list into a canonical
//! [`FilteredQuery`] whose [`key`](FilteredQuery::key) doubles as the cache
//! key: two raw inputs with the same term set, in any order and with any
//! duplication, produce the same key.

use std::collections::BTreeSet;

/// The wildcard term.
pub const WILDCARD: &str = "*";

/// Prefix of the synthetic per-poster tags.
pub const OWNER_TAG_PREFIX: &str = "user:";

/// Separator used when joining terms into a cache key.
const KEY_SEPARATOR: char = '+';

/// Split a raw tag string (as typed into a search box) into terms.
///
/// Terms are separated by whitespace, `+` or `,`.
pub fn parse_tag_string(raw: &str) -> Vec<String> {
    split_terms(raw).map(str::to_string).collect()
}

fn split_terms(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(|c: char| c.is_whitespace() || c == '+' || c == ',')
        .filter(|t| !t.is_empty())
}

/// Lowercase a single tag token.
pub fn normalize_tag(tag: &str) -> String {
    tag.trim().to_lowercase()
}

pub fn is_owner_tag(tag: &str) -> bool {
    tag.starts_with(OWNER_TAG_PREFIX)
}

/// The owner tag for `poster`. Delimiters inside the name become `_` so
/// the tag stays a single search term.
pub fn owner_tag(poster: &str) -> String {
    let name: Vec<&str> = split_terms(poster).collect();
    format!("{OWNER_TAG_PREFIX}{}", normalize_tag(&name.join("_")))
}

/// A single query term with its polarity split off.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Term {
    Include(String),
    Exclude(String),
}

impl Term {
    /// Parse one normalized token. Returns `None` for tokens that name no
    /// tag: `-` alone, `-*` and double negations.
    fn parse(token: &str) -> Option<Self> {
        match token.strip_prefix('-') {
            Some(tag) => {
                if tag.is_empty() || tag.starts_with('-') || tag == WILDCARD {
                    None
                } else {
                    Some(Term::Exclude(tag.to_string()))
                }
            }
            None if token.is_empty() => None,
            None => Some(Term::Include(token.to_string())),
        }
    }

    pub fn tag(&self) -> &str {
        match self {
            Term::Include(tag) | Term::Exclude(tag) => tag,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, Term::Include(tag) if tag == WILDCARD)
    }
}

impl std::fmt::Display for Term {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Term::Include(tag) => f.write_str(tag),
            Term::Exclude(tag) => write!(f, "-{tag}"),
        }
    }
}

/// The output of the tag filter.
///
/// Invariants: at least one include term; `*` only appears alone among the
/// include terms; no tag appears both included and excluded; includes and
/// excludes are each sorted and deduplicated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FilteredQuery {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl FilteredQuery {
    /// The query matching every post.
    pub fn wildcard() -> Self {
        Self {
            include: vec![WILDCARD.to_string()],
            exclude: Vec::new(),
        }
    }

    pub fn include(&self) -> &[String] {
        &self.include
    }

    pub fn exclude(&self) -> &[String] {
        &self.exclude
    }

    /// Include terms other than the wildcard.
    pub fn positive_tags(&self) -> impl Iterator<Item = &str> {
        self.include
            .iter()
            .map(String::as_str)
            .filter(|t| *t != WILDCARD)
    }

    pub fn is_wildcard_based(&self) -> bool {
        self.include.iter().any(|t| t == WILDCARD)
    }

    /// Every distinct tag the query reads from the index, wildcard excluded.
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.positive_tags()
            .chain(self.exclude.iter().map(String::as_str))
    }

    /// The filtered list with polarity prefixes restored, includes first.
    pub fn terms(&self) -> Vec<String> {
        self.include
            .iter()
            .cloned()
            .chain(self.exclude.iter().map(|t| format!("-{t}")))
            .collect()
    }

    /// Canonical cache key.
    pub fn key(&self) -> String {
        let mut key = String::new();
        for term in self.terms() {
            if !key.is_empty() {
                key.push(KEY_SEPARATOR);
            }
            key.push_str(&term);
        }
        key
    }

    /// Whether a change to the posts carrying any of `tags` can change this
    /// query's result.
    pub fn depends_on<'a>(
        &self,
        mut tags: impl Iterator<Item = &'a str>,
    ) -> bool {
        self.is_wildcard_based()
            || tags.any(|changed| self.tags().any(|t| t == changed))
    }
}

impl std::fmt::Display for FilteredQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

/// Normalize a raw term list.
///
/// 1. split on delimiters, trim and lowercase;
/// 2. deduplicate;
/// 3. drop `t` and `-t` when both are present;
/// 4. drop tokens that name no tag;
/// 5. inject `*` when no positive term is left, drop a redundant `*`
///    otherwise;
/// 6. order includes before excludes.
pub fn filter_terms<S: AsRef<str>>(raw: &[S]) -> FilteredQuery {
    let tokens: BTreeSet<String> = raw
        .iter()
        .flat_map(|item| split_terms(item.as_ref()))
        .map(normalize_tag)
        .collect();

    let mut include = BTreeSet::new();
    let mut exclude = BTreeSet::new();
    for term in tokens.iter().filter_map(|t| Term::parse(t)) {
        match term {
            Term::Include(tag) => {
                if !tokens.contains(&format!("-{tag}")) {
                    include.insert(tag);
                }
            }
            Term::Exclude(tag) => {
                if !tokens.contains(&tag) {
                    exclude.insert(tag);
                }
            }
        }
    }

    if include.iter().any(|t| t != WILDCARD) {
        include.remove(WILDCARD);
    } else {
        include.insert(WILDCARD.to_string());
    }

    FilteredQuery {
        include: include.into_iter().collect(),
        exclude: exclude.into_iter().collect(),
    }
}

/// Filter a raw tag string.
pub fn filter_tag_string(raw: &str) -> FilteredQuery {
    filter_terms(&parse_tag_string(raw))
}

/// Clean the tags a poster attaches to a post.
///
/// Drops negations, the wildcard and any user-supplied owner tags, then
/// appends the poster's own owner tag. The result is sorted and unique apart
/// from the trailing owner tag.
pub fn sanitize_post_tags<S: AsRef<str>>(raw: &[S], poster: &str) -> Vec<String> {
    let tags: BTreeSet<String> = raw
        .iter()
        .flat_map(|item| split_terms(item.as_ref()))
        .map(normalize_tag)
        .filter(|t| {
            !t.is_empty() && !t.starts_with('-') && t != WILDCARD
        })
        .filter(|t| !is_owner_tag(t))
        .collect();

    let mut tags: Vec<String> = tags.into_iter().collect();
    tags.push(owner_tag(poster));
    tags
}
