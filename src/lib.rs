//! tagbooru - tag query and search caching for an imageboard.
//!
//! Posts carry lowercase tags. A query is an implicit AND of positive tags
//! minus any `-negated` tags, with `*` standing for every post. Results are
//! ordered newest first by the creation time embedded in each
//! [`PostId`], paginated, and cached per normalized query until a post
//! carrying one of the query's tags changes or the entry's TTL runs out.
//!
//! Two tag index layouts are available: a normalized SQLite join table
//! ([`JoinTableStore`], the default) and a denormalized redb store keeping
//! one id list per tag ([`BlobStore`]).
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tagbooru::{EngineConfig, JoinTableStore, NewPost, SearchEngine};
//! use tokio_util::sync::CancellationToken;
//!
//! let store = Arc::new(JoinTableStore::open_in_memory().unwrap());
//! let engine = SearchEngine::with_store(store, EngineConfig::default());
//!
//! engine
//!     .create_post(NewPost {
//!         poster: "amy".to_string(),
//!         tags: vec!["cat sleeping".to_string()],
//!         ..Default::default()
//!     })
//!     .unwrap();
//!
//! let cancel = CancellationToken::new();
//! let page = engine.search("cat -dog", 0, &cancel).unwrap();
//! for post in &page.posts {
//!     println!("#{} {}", post.id, post.tags.join(" "));
//! }
//! ```

pub mod cache;
pub mod cli;
pub mod config;
pub mod data_dir;
pub mod error;
pub mod pager;
pub mod post;
pub mod post_id;
pub mod query;
pub mod redb_store;
pub mod resolver;
pub mod search;
pub mod sqlite_store;
pub mod sweeper;
pub mod tag_counts;
pub mod tag_index;

pub use cache::{Clock, ManualClock, SearchCache, SystemClock, TtlCache};
pub use config::EngineConfig;
pub use data_dir::DataDir;
pub use error::{Error, ErrorKind, Result};
pub use post::{NewPost, Post, PostEdit, PostStore};
pub use post_id::{PostId, PostIdGenerator};
pub use query::{FilteredQuery, filter_tag_string, filter_terms};
pub use redb_store::BlobStore;
pub use search::{SearchEngine, SearchPage, open_engine};
pub use sqlite_store::JoinTableStore;
pub use tag_counts::{TagCount, TagCountsCache};
pub use tag_index::{IndexLayout, TagIndex};
