//! Inspecting an index file without opening a collection.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::error::{CollectionError, Result};
use crate::model::{ChildRef, CollectionDescriptor};
use crate::scan::SourceFile;

use super::header::{self, IndexHeader, IndexKind};
use super::payload;

/// Kind of the index at `path`, from its magic alone.
pub fn index_kind(path: &Path) -> Result<IndexKind> {
    let mut reader = BufReader::new(open(path)?);
    Ok(header::read_header(&mut reader)?.kind)
}

pub fn is_partition(path: &Path) -> bool {
    matches!(index_kind(path), Ok(IndexKind::Partition))
}

/// Header and descriptor of the index at `path`; `None` when it is unusable.
///
/// Record tables are skipped, not decoded.
pub fn read_descriptor(path: &Path) -> Result<Option<(IndexHeader, CollectionDescriptor)>> {
    let file = open(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let Some((header, payload)) = payload::read_frame(&mut reader, file_len, path)? else {
        return Ok(None);
    };
    Ok(payload::decode_descriptor(&payload, path).map(|descriptor| (header, descriptor)))
}

/// Data files recorded in a leaf index.
pub fn read_files(path: &Path) -> Result<Option<Vec<SourceFile>>> {
    match read_descriptor(path)? {
        Some((header, _)) if header.kind == IndexKind::Partition => Err(CollectionError::InvalidInput(
            format!("{} is a partition index", path.display()),
        )),
        Some((_, descriptor)) => Ok(Some(descriptor.files)),
        None => Ok(None),
    }
}

/// Children recorded in a partition index.
pub fn read_children(path: &Path) -> Result<Option<Vec<ChildRef>>> {
    match read_descriptor(path)? {
        Some((_, descriptor)) => match descriptor.partition {
            Some(partition) => Ok(Some(partition.children)),
            None => Err(CollectionError::InvalidInput(format!(
                "{} is not a partition index",
                path.display()
            ))),
        },
        None => Ok(None),
    }
}

fn open(path: &Path) -> Result<File> {
    File::open(path).map_err(|error| match error.kind() {
        std::io::ErrorKind::NotFound => CollectionError::PathNotFound(path.to_path_buf()),
        _ => CollectionError::Io(error),
    })
}
