use serde::{Deserialize, Serialize};

use crate::{error::Result, post_id::PostId};

/// An uploaded file and its tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: PostId,
    /// Sorted tags, followed by the poster's owner tag.
    pub tags: Vec<String>,
    pub filename: String,
    #[serde(rename = "ext")]
    pub extension: String,
    pub description: String,
    pub poster: String,
    #[serde(rename = "mimetype")]
    pub mime_type: String,
    /// Unix seconds.
    pub created_at: u64,
}

/// Fields supplied when creating a post. Id, owner tag and creation time are
/// filled in by the engine.
#[derive(Debug, Clone, Default)]
pub struct NewPost {
    pub filename: String,
    pub extension: String,
    pub description: String,
    pub poster: String,
    pub mime_type: String,
    pub tags: Vec<String>,
}

/// A partial update; `None` leaves the field unchanged.
#[derive(Debug, Clone, Default)]
pub struct PostEdit {
    pub tags: Option<Vec<String>>,
    pub description: Option<String>,
    /// Whose owner tag the edited tag list carries. Defaults to the
    /// original poster.
    pub editor: Option<String>,
}

/// Durable post metadata.
///
/// Implementations that also implement [`TagIndex`](crate::TagIndex) write
/// a post row and its tag rows in one transaction.
pub trait PostStore: Send + Sync {
    fn get(&self, id: PostId) -> Result<Post>;

    /// Fetch posts in the order given. Ids without a post are logged and
    /// skipped.
    fn get_many(&self, ids: &[PostId]) -> Result<Vec<Post>>;

    fn all_ids(&self) -> Result<Vec<PostId>>;

    fn count(&self) -> Result<usize>;

    fn create(&self, post: &Post) -> Result<()>;

    /// Replace a post. Returns the previous version.
    fn update(&self, post: &Post) -> Result<Post>;

    /// Returns the removed post.
    fn delete(&self, id: PostId) -> Result<Post>;
}
