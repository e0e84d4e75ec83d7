use std::{collections::BTreeSet, path::Path, sync::Arc};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    cache::{Clock, SearchCache, Sweep, SystemClock, TtlCache},
    config::EngineConfig,
    error::{Error, Result},
    pager,
    post::{NewPost, Post, PostEdit, PostStore},
    post_id::{PostId, PostIdGenerator},
    query::{FilteredQuery, filter_tag_string, filter_terms, sanitize_post_tags},
    redb_store::BlobStore,
    resolver::{check_cancelled, resolve_sorted},
    sqlite_store::JoinTableStore,
    sweeper::Sweeper,
    tag_counts::{TagCount, TagCountsCache, rank_tag_counts, top_n},
    tag_index::{IndexLayout, TagIndex},
};

/// One page of search results.
#[derive(Debug, Clone, Serialize)]
pub struct SearchPage {
    pub posts: Vec<Post>,
    /// Matches across all pages.
    pub total_count: usize,
    pub total_pages: usize,
    /// Zero-based.
    pub page: usize,
    /// The normalized query the page was resolved for.
    pub query: String,
}

/// Tag search over a post store, with cached results kept coherent across
/// post mutations.
///
/// Reads go filter → cache → resolver → pager → hydration. Writes go to the
/// store first and then drop every cache entry the write can affect.
pub struct SearchEngine {
    posts: Arc<dyn PostStore>,
    index: Arc<dyn TagIndex>,
    search_cache: Arc<SearchCache>,
    tag_counts: Arc<TagCountsCache>,
    config: EngineConfig,
    ids: PostIdGenerator,
    sweeper: Mutex<Option<Sweeper>>,
}

impl std::fmt::Debug for SearchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchEngine")
            .field("layout", &self.index.layout())
            .field("search_cache", &self.search_cache)
            .field("tag_counts", &self.tag_counts)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SearchEngine {
    /// Build an engine over a store that is both the post store and the
    /// tag index.
    ///
    /// Without [`start`](Self::start), expired cache entries are only
    /// reclaimed when later inserts purge them, so memory tracks twice the
    /// live set rather than the live set.
    pub fn with_store<S>(store: Arc<S>, config: EngineConfig) -> Self
    where
        S: PostStore + TagIndex + 'static,
    {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    /// Like [`with_store`](Self::with_store), with an explicit clock for the
    /// cache TTLs.
    pub fn with_clock<S>(
        store: Arc<S>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self
    where
        S: PostStore + TagIndex + 'static,
    {
        let search_cache = Arc::new(TtlCache::new(
            "search",
            config.search_ttl,
            clock.clone(),
        ));
        let tag_counts =
            Arc::new(TtlCache::new("tag_counts", config.tag_counts_ttl, clock));
        Self {
            posts: store.clone(),
            index: store,
            search_cache,
            tag_counts,
            config,
            ids: PostIdGenerator::default(),
            sweeper: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn layout(&self) -> IndexLayout {
        self.index.layout()
    }

    pub fn search_cache(&self) -> &SearchCache {
        &self.search_cache
    }

    pub fn tag_counts_cache(&self) -> &TagCountsCache {
        &self.tag_counts
    }

    // -- Reads --

    /// Every id matching `query`, newest first, from the cache when a live
    /// entry exists.
    fn matching_ids(
        &self,
        query: &FilteredQuery,
        cancel: &CancellationToken,
    ) -> Result<Arc<[PostId]>> {
        check_cancelled(cancel)?;
        if let Some(ids) = self.search_cache.get(query) {
            return Ok(ids);
        }

        let generation = self.search_cache.generation();
        let ids: Arc<[PostId]> = resolve_sorted(&*self.index, query, cancel)?.into();
        check_cancelled(cancel)?;

        Ok(self
            .search_cache
            .put_if_generation(query, ids.clone(), generation)
            .unwrap_or(ids))
    }

    fn search_query(
        &self,
        query: FilteredQuery,
        page: usize,
        cancel: &CancellationToken,
    ) -> Result<SearchPage> {
        let ids = self.matching_ids(&query, cancel)?;
        let slice = pager::page(&ids, page, self.config.page_size);
        check_cancelled(cancel)?;
        let posts = self.posts.get_many(slice)?;

        debug!(
            %query,
            page,
            total = ids.len(),
            shown = posts.len(),
            "search page"
        );
        Ok(SearchPage {
            posts,
            total_count: ids.len(),
            total_pages: pager::total_pages(ids.len(), self.config.page_size),
            page,
            query: query.key(),
        })
    }

    /// Search with a raw tag string such as `"cat -dog"`.
    pub fn search(
        &self,
        raw: &str,
        page: usize,
        cancel: &CancellationToken,
    ) -> Result<SearchPage> {
        self.search_query(filter_tag_string(raw), page, cancel)
    }

    /// Search with an already split term list.
    pub fn search_terms<S: AsRef<str>>(
        &self,
        terms: &[S],
        page: usize,
        cancel: &CancellationToken,
    ) -> Result<SearchPage> {
        self.search_query(filter_terms(terms), page, cancel)
    }

    /// The ids on one page, without hydrating posts.
    pub fn search_ids(
        &self,
        raw: &str,
        page: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<PostId>> {
        let ids = self.matching_ids(&filter_tag_string(raw), cancel)?;
        Ok(pager::page(&ids, page, self.config.page_size).to_vec())
    }

    pub fn count(&self, raw: &str, cancel: &CancellationToken) -> Result<usize> {
        Ok(self.matching_ids(&filter_tag_string(raw), cancel)?.len())
    }

    pub fn total_pages(
        &self,
        raw: &str,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        Ok(pager::total_pages(
            self.count(raw, cancel)?,
            self.config.page_size,
        ))
    }

    /// The `n` most frequent tags among the posts matching `raw`.
    pub fn top_tags(
        &self,
        raw: &str,
        n: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<TagCount>> {
        let query = filter_tag_string(raw);
        check_cancelled(cancel)?;
        if let Some(ranked) = self.tag_counts.get(&query) {
            return Ok(top_n(&ranked, n));
        }

        let generation = self.tag_counts.generation();
        let ids = self.matching_ids(&query, cancel)?;
        let counts = self.index.tag_counts(&ids, cancel)?;
        check_cancelled(cancel)?;

        let ranked: Arc<[TagCount]> = rank_tag_counts(counts).into();
        let ranked = self
            .tag_counts
            .put_if_generation(&query, ranked.clone(), generation)
            .unwrap_or(ranked);
        Ok(top_n(&ranked, n))
    }

    pub fn post(&self, id: PostId) -> Result<Post> {
        self.posts.get(id)
    }

    pub fn post_count(&self) -> Result<usize> {
        self.posts.count()
    }

    // -- Writes --

    pub fn create_post(&self, new: NewPost) -> Result<Post> {
        let id = self.ids.generate();
        let post = Post {
            id,
            tags: sanitize_post_tags(&new.tags, &new.poster),
            filename: new.filename,
            extension: new.extension,
            description: new.description,
            poster: new.poster,
            mime_type: new.mime_type,
            created_at: id.timestamp_ms() / 1000,
        };
        self.posts.create(&post)?;
        self.invalidate(&post.tags);
        info!(id = %post.id, poster = %post.poster, tags = post.tags.len(), "created post");
        Ok(post)
    }

    pub fn edit_post(&self, id: PostId, edit: PostEdit) -> Result<Post> {
        let mut post = self.posts.get(id)?;
        if let Some(tags) = edit.tags {
            let owner = edit.editor.as_deref().unwrap_or(&post.poster);
            post.tags = sanitize_post_tags(&tags, owner);
        }
        if let Some(description) = edit.description {
            post.description = description;
        }

        let previous = self.posts.update(&post)?;
        let affected: BTreeSet<String> =
            previous.tags.into_iter().chain(post.tags.iter().cloned()).collect();
        self.invalidate(&affected.into_iter().collect::<Vec<_>>());
        info!(%id, tags = post.tags.len(), "edited post");
        Ok(post)
    }

    pub fn delete_post(&self, id: PostId) -> Result<Post> {
        let removed = self.posts.delete(id)?;
        self.invalidate(&removed.tags);
        info!(%id, "deleted post");
        Ok(removed)
    }

    fn invalidate(&self, tags: &[String]) {
        let searches = self.search_cache.invalidate_tags(tags);
        let histograms = self.tag_counts.invalidate_tags(tags);
        debug!(searches, histograms, "invalidated cached queries");
    }

    /// Drop every cached result.
    pub fn invalidate_all(&self) {
        self.search_cache.clear();
        self.tag_counts.clear();
    }

    // -- Sweeper lifecycle --

    /// Start the background sweep on the current tokio runtime. Does
    /// nothing if it is already running.
    pub fn start(&self) -> Result<()> {
        let runtime = Handle::try_current().map_err(|e| {
            Error::Config(format!("cache sweeper needs a tokio runtime: {e}"))
        })?;
        let mut sweeper = self.sweeper.lock();
        if sweeper.as_ref().is_some_and(|s| !s.is_finished()) {
            return Ok(());
        }
        let targets: Vec<Arc<dyn Sweep>> = vec![
            self.search_cache.clone() as Arc<dyn Sweep>,
            self.tag_counts.clone() as Arc<dyn Sweep>,
        ];
        *sweeper = Some(Sweeper::spawn(
            &runtime,
            targets,
            self.config.sweep_interval,
            self.config.sweep_batch,
        ));
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.stop();
        }
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweeper
            .lock()
            .as_ref()
            .is_some_and(|s| !s.is_finished())
    }
}

impl Drop for SearchEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Open the store for `layout` at its default path under `data_dir`.
pub fn open_engine(
    layout: IndexLayout,
    data_dir: &crate::data_dir::DataDir,
    config: EngineConfig,
) -> Result<SearchEngine> {
    open_engine_at(layout, &data_dir.store_path(layout), config)
}

pub fn open_engine_at(
    layout: IndexLayout,
    path: &Path,
    config: EngineConfig,
) -> Result<SearchEngine> {
    debug!(%layout, path = %path.display(), "opening store");
    Ok(match layout {
        IndexLayout::JoinTable => {
            SearchEngine::with_store(Arc::new(JoinTableStore::open(path)?), config)
        }
        IndexLayout::Blob => {
            SearchEngine::with_store(Arc::new(BlobStore::open(path)?), config)
        }
    })
}

/// Format a results page for the terminal.
pub fn format_human(page: &SearchPage) {
    if page.posts.is_empty() {
        println!("No posts found for '{}'.", page.query);
        return;
    }

    for post in &page.posts {
        println!(
            "#{} {}.{} [{}]",
            post.id,
            post.filename,
            post.extension,
            post.tags.join(" ")
        );
        if !post.description.is_empty() {
            println!("    {}", post.description);
        }
    }
    println!(
        "\npage {}/{} ({} post(s))",
        page.page + 1,
        page.total_pages.max(1),
        page.total_count
    );
}

pub fn format_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{cache::ManualClock, error::ErrorKind};

    fn engine() -> (Arc<ManualClock>, SearchEngine) {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(JoinTableStore::open_in_memory().unwrap());
        let engine =
            SearchEngine::with_clock(store, EngineConfig::default(), clock.clone());
        (clock, engine)
    }

    fn new_post(poster: &str, tags: &str) -> NewPost {
        NewPost {
            filename: "pic".to_string(),
            extension: "png".to_string(),
            poster: poster.to_string(),
            mime_type: "image/png".to_string(),
            tags: vec![tags.to_string()],
            ..Default::default()
        }
    }

    fn ids(page: &SearchPage) -> Vec<PostId> {
        page.posts.iter().map(|p| p.id).collect()
    }

    #[test]
    fn created_post_gets_owner_tag() {
        let (_, engine) = engine();
        let post = engine
            .create_post(new_post("Amy", "Cat user:mallory -dog *"))
            .unwrap();
        assert_eq!(post.tags, vec!["cat", "user:amy"]);
        assert_eq!(post.created_at, post.id.timestamp_ms() / 1000);
        assert_eq!(engine.post(post.id).unwrap(), post);
    }

    #[test]
    fn search_pages_newest_first() {
        let (_, engine) = engine();
        let cancel = CancellationToken::new();
        let a = engine.create_post(new_post("amy", "cat")).unwrap();
        let b = engine.create_post(new_post("amy", "cat dog")).unwrap();

        let page = engine.search("cat", 0, &cancel).unwrap();
        assert_eq!(ids(&page), vec![b.id, a.id]);
        assert_eq!(page.total_count, 2);
        assert_eq!(page.total_pages, 1);
        assert_eq!(page.query, "cat");

        let page = engine.search("cat -dog", 0, &cancel).unwrap();
        assert_eq!(ids(&page), vec![a.id]);
    }

    #[test]
    fn mutations_invalidate_cached_results() {
        let (_, engine) = engine();
        let cancel = CancellationToken::new();
        let a = engine.create_post(new_post("amy", "cat")).unwrap();
        assert_eq!(engine.count("cat", &cancel).unwrap(), 1);

        let b = engine.create_post(new_post("amy", "cat")).unwrap();
        assert_eq!(engine.count("cat", &cancel).unwrap(), 2);

        engine
            .edit_post(
                a.id,
                PostEdit {
                    tags: Some(vec!["dog".to_string()]),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(engine.search_ids("cat", 0, &cancel).unwrap(), vec![b.id]);
        assert_eq!(engine.search_ids("dog", 0, &cancel).unwrap(), vec![a.id]);

        engine.delete_post(b.id).unwrap();
        assert_eq!(engine.count("cat", &cancel).unwrap(), 0);
        assert_eq!(engine.count("", &cancel).unwrap(), 1);
    }

    #[test]
    fn unrelated_entries_survive_a_write() {
        let (_, engine) = engine();
        let cancel = CancellationToken::new();
        engine.create_post(new_post("amy", "cat")).unwrap();
        engine.count("cat", &cancel).unwrap();
        engine.count("*", &cancel).unwrap();
        assert_eq!(engine.search_cache().len(), 2);

        engine.create_post(new_post("bob", "fox")).unwrap();
        // The wildcard entry goes; the "cat" entry cannot have changed.
        assert_eq!(engine.search_cache().len(), 1);
    }

    #[test]
    fn cached_results_expire() {
        let (clock, engine) = engine();
        let cancel = CancellationToken::new();
        let a = engine.create_post(new_post("amy", "cat")).unwrap();
        assert_eq!(engine.count("cat", &cancel).unwrap(), 1);

        // Bypass the engine so the cache is not told about the write.
        engine.index.set_tags_for_post(a.id, &[]).unwrap();
        assert_eq!(engine.count("cat", &cancel).unwrap(), 1);

        clock.advance(Duration::from_secs(5));
        assert_eq!(engine.count("cat", &cancel).unwrap(), 0);
    }

    #[test]
    fn top_tags_shares_one_entry_across_n() {
        let (_, engine) = engine();
        let cancel = CancellationToken::new();
        engine.create_post(new_post("amy", "cat dog")).unwrap();
        engine.create_post(new_post("bob", "cat")).unwrap();

        let top = engine.top_tags("", 2, &cancel).unwrap();
        assert_eq!(
            top,
            vec![
                TagCount { tag: "cat".to_string(), count: 2 },
                TagCount { tag: "user:amy".to_string(), count: 1 },
            ]
        );
        assert_eq!(engine.top_tags("*", 10, &cancel).unwrap().len(), 4);
        assert_eq!(engine.tag_counts_cache().len(), 1);
    }

    #[test]
    fn editor_owns_edited_tags() {
        let (_, engine) = engine();
        let post = engine.create_post(new_post("amy", "cat")).unwrap();
        let edited = engine
            .edit_post(
                post.id,
                PostEdit {
                    tags: Some(vec!["cat fox".to_string()]),
                    description: Some("edited".to_string()),
                    editor: Some("admin".to_string()),
                },
            )
            .unwrap();
        assert_eq!(edited.tags, vec!["cat", "fox", "user:admin"]);
        assert_eq!(edited.poster, "amy");
        assert_eq!(edited.description, "edited");
    }

    #[test]
    fn missing_post_is_not_found() {
        let (_, engine) = engine();
        let ghost = PostId::from_raw(1);
        assert_eq!(engine.post(ghost).unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(
            engine.delete_post(ghost).unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            engine
                .edit_post(ghost, PostEdit::default())
                .unwrap_err()
                .kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn cancelled_search_is_not_cached() {
        let (_, engine) = engine();
        engine.create_post(new_post("amy", "cat")).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = engine.search("cat", 0, &cancel).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(engine.search_cache().is_empty());
    }

    #[test]
    fn start_needs_a_runtime() {
        let (_, engine) = engine();
        assert_eq!(engine.start().unwrap_err().kind(), ErrorKind::Config);
        assert!(!engine.is_sweeping());
    }

    #[tokio::test]
    async fn start_and_stop_sweeper() {
        let (_, engine) = engine();
        engine.start().unwrap();
        engine.start().unwrap();
        assert!(engine.is_sweeping());
        engine.stop();
        assert!(!engine.is_sweeping());
    }
}
