//! Source file discovery.
//!
//! A scan lists the files directly under a collection root, sorted by name,
//! with their size and modification time. Index and companion files produced
//! by this crate are never reported as data.

use std::fs::{self, Metadata};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use ignore::overrides::OverrideBuilder;
use ignore::{Walk, WalkBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{CollectionError, Result};
use crate::index_location::INDEX_SUFFIX;
use crate::locator::LOCATOR_SUFFIX;

/// A file as seen by a scan: where it is, when it last changed and how big it is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceFile {
    pub path: PathBuf,
    /// Milliseconds since the Unix epoch.
    pub last_modified: u64,
    pub size: u64,
}

impl SourceFile {
    pub fn from_path(path: &Path) -> Result<Self> {
        let metadata = fs::metadata(path).map_err(|error| match error.kind() {
            std::io::ErrorKind::NotFound => CollectionError::PathNotFound(path.to_path_buf()),
            _ => CollectionError::Io(error),
        })?;
        Ok(Self::with_metadata(path.to_path_buf(), &metadata))
    }

    pub(crate) fn with_metadata(path: PathBuf, metadata: &Metadata) -> Self {
        Self {
            path,
            last_modified: modified_ms(metadata),
            size: metadata.len(),
        }
    }

    /// Final path component, lossily converted.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

pub(crate) fn modified_ms(metadata: &Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|value| value.duration_since(UNIX_EPOCH).ok())
        .map(|value| value.as_millis() as u64)
        .unwrap_or(0)
}

fn is_index_artifact(path: &Path) -> bool {
    let name = path.file_name().map(|name| name.to_string_lossy());
    name.is_some_and(|name| name.ends_with(INDEX_SUFFIX) || name.ends_with(LOCATOR_SUFFIX))
}

/// Files and subdirectories directly under one root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryScan {
    root: PathBuf,
    pattern: Option<String>,
}

impl DirectoryScan {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            pattern: None,
        }
    }

    /// Restricts data files to names matching a glob such as `*.grib2`.
    pub fn with_pattern(root: impl Into<PathBuf>, pattern: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            pattern: Some(pattern.into()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn walker(&self, pattern: Option<&str>) -> Result<Walk> {
        if !self.root.is_dir() {
            return Err(CollectionError::PathNotFound(self.root.clone()));
        }
        let mut builder = WalkBuilder::new(&self.root);
        builder
            .standard_filters(false)
            .hidden(true)
            .max_depth(Some(1))
            .sort_by_file_name(|a, b| a.cmp(b));

        if let Some(pattern) = pattern {
            let mut overrides = OverrideBuilder::new(&self.root);
            overrides.add(pattern).map_err(|error| {
                CollectionError::InvalidInput(format!("invalid file pattern {pattern}: {error}"))
            })?;
            let overrides = overrides.build().map_err(|error| {
                CollectionError::InvalidInput(format!("invalid file pattern {pattern}: {error}"))
            })?;
            builder.overrides(overrides);
        }
        Ok(builder.build())
    }

    /// Data files under the root, sorted by name.
    ///
    /// The iterator is lazy; call again to restart the scan. A file that
    /// cannot be inspected is reported as an `Err` item without ending the scan.
    pub fn files(&self) -> Result<impl Iterator<Item = Result<SourceFile>>> {
        let walk = self.walker(self.pattern.as_deref())?;
        Ok(walk.filter_map(|entry| match entry {
            Ok(entry) => {
                let is_file = entry.file_type().is_some_and(|kind| kind.is_file());
                if entry.depth() == 0 || !is_file || is_index_artifact(entry.path()) {
                    return None;
                }
                Some(
                    entry
                        .metadata()
                        .map(|metadata| SourceFile::with_metadata(entry.path().to_path_buf(), &metadata))
                        .map_err(|error| {
                            CollectionError::Internal(format!(
                                "cannot stat {}: {error}",
                                entry.path().display()
                            ))
                        }),
                )
            }
            Err(error) => Some(Err(CollectionError::Internal(format!("scan failed: {error}")))),
        }))
    }

    /// Immediate subdirectories, sorted by name.
    pub fn subdirectories(&self) -> Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        for entry in self.walker(None)? {
            let entry = entry.map_err(|error| CollectionError::Internal(format!("scan failed: {error}")))?;
            if entry.depth() > 0 && entry.file_type().is_some_and(|kind| kind.is_dir()) {
                dirs.push(entry.into_path());
            }
        }
        Ok(dirs)
    }

    pub fn has_subdirectories(&self) -> Result<bool> {
        Ok(!self.subdirectories()?.is_empty())
    }
}
