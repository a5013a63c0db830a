//! Where index files live on disk.
//!
//! By default an index sits next to the data it describes. Deployments whose
//! data directories are read-only can point every index at a cache root
//! instead; the data path is then mirrored below that root.

use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use parking_lot::RwLock;

/// Extension of collection and partition index files.
pub const INDEX_SUFFIX: &str = ".ncx2";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum IndexLocation {
    /// Index files are written beside the data.
    #[default]
    Alongside,
    /// Index files are written under this directory, mirroring the data path.
    CacheRoot(PathBuf),
}

impl IndexLocation {
    /// Maps the natural location of an index file to where it is stored.
    pub fn resolve(&self, natural: &Path) -> PathBuf {
        match self {
            Self::Alongside => natural.to_path_buf(),
            Self::CacheRoot(root) => {
                let mut path = root.clone();
                for component in natural.components() {
                    match component {
                        Component::Normal(part) => path.push(part),
                        Component::ParentDir => path.push(".."),
                        Component::Prefix(_) | Component::RootDir | Component::CurDir => {}
                    }
                }
                path
            }
        }
    }
}

static INDEX_LOCATION: LazyLock<RwLock<IndexLocation>> =
    LazyLock::new(|| RwLock::new(IndexLocation::Alongside));

/// Sets the process-wide index location.
pub fn initialize(location: IndexLocation) {
    log::debug!("index location set to {location:?}");
    *INDEX_LOCATION.write() = location;
}

/// Restores the default, [`IndexLocation::Alongside`].
pub fn reset() {
    initialize(IndexLocation::Alongside);
}

pub fn current() -> IndexLocation {
    INDEX_LOCATION.read().clone()
}

/// File name of a collection's index: spaces become underscores.
pub fn index_file_name(collection_name: &str) -> String {
    format!("{}{INDEX_SUFFIX}", collection_name.replace(' ', "_"))
}

/// Where the index of `collection_name` rooted at `directory` is stored.
pub fn index_path(directory: &Path, collection_name: &str) -> PathBuf {
    current().resolve(&directory.join(index_file_name(collection_name)))
}

/// Name of a child collection: the parent name and the child directory name.
pub fn child_collection_name(parent: &str, directory: &Path) -> String {
    match directory.file_name() {
        Some(name) => format!("{parent}-{}", name.to_string_lossy()),
        None => parent.to_string(),
    }
}
