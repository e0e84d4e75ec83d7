use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::{
    error::{Error, Result},
    tag_index::IndexLayout,
};

/// Overrides the XDG location when `--data-dir` is absent.
const DATA_DIR_ENV: &str = "TAGBOORU_DATA_DIR";

#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

/// `--data-dir` beats a non-empty `TAGBOORU_DATA_DIR`, which beats
/// `$XDG_DATA_HOME/tagbooru`.
fn pick_root(explicit: Option<&Path>, env: Option<&OsStr>) -> Result<PathBuf> {
    match (explicit, env) {
        (Some(path), _) => Ok(path.to_path_buf()),
        (None, Some(val)) if !val.is_empty() => Ok(PathBuf::from(val)),
        _ => xdg::BaseDirectories::with_prefix("tagbooru")
            .get_data_home()
            .ok_or_else(|| Error::Config("no XDG data home".into())),
    }
}

impl DataDir {
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let env = std::env::var_os(DATA_DIR_ENV);
        let root = pick_root(explicit, env.as_deref())?;
        if let Err(e) = std::fs::create_dir_all(&root) {
            debug!(root = %root.display(), error = %e, "cannot create data dir");
            return Err(Error::DataDir(root));
        }
        debug!(root = %root.display(), "data dir");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sqlite_path(&self) -> PathBuf {
        self.root.join("posts.sqlite")
    }

    pub fn redb_path(&self) -> PathBuf {
        self.root.join("posts.redb")
    }

    /// The layout of an existing store, or the join table for a fresh
    /// directory.
    pub fn detect_layout(&self) -> IndexLayout {
        if self.redb_path().exists() && !self.sqlite_path().exists() {
            IndexLayout::Blob
        } else {
            IndexLayout::JoinTable
        }
    }

    /// The store file backing `layout`.
    pub fn store_path(&self, layout: IndexLayout) -> PathBuf {
        match layout {
            IndexLayout::JoinTable => self.sqlite_path(),
            IndexLayout::Blob => self.redb_path(),
        }
    }
}
