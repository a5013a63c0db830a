//! Binary index format.
//!
//! An index file is a big-endian header (20-byte magic, `u32` version, `u64`
//! record section length), the record section, a LEB128 payload size and the
//! postcard-encoded descriptor. Record tables are read lazily by variables
//! using the absolute offsets stored in the descriptor.
//!
//! Readers never fail on an unusable file: they log the reason and return
//! `None` so the caller can rebuild.

mod header;
mod payload;
pub mod reader;
pub mod varint;

use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use tempfile::NamedTempFile;

use crate::error::{CollectionError, Result};
use crate::file_handle::FileHandle;
use crate::handle_cache::{self, PooledHandle};
use crate::model::{Collection, CollectionDescriptor, RecordTables};

pub use header::{
    IndexHeader, IndexKind, HEADER_LEN, INDEX_VERSION, LEAF_MAGIC, MAGIC_LEN, MIN_INDEX_VERSION,
    PARTITION_MAGIC,
};
pub use payload::{write_index, MAX_PAYLOAD_SIZE};

/// Reads the header at the start of an open index file.
pub fn read_header(handle: &FileHandle) -> Result<IndexHeader> {
    handle.with_cursor(0, |file| header::read_header(file))
}

/// Reads a collection from an open index file, taking ownership of the handle.
///
/// Returns `None` (and releases the handle) when the index is unusable.
pub fn read_collection(handle: PooledHandle) -> Option<Collection> {
    let path = handle.path().to_path_buf();
    let frame = handle.with_cursor(0, |file| {
        let file_len = file.metadata()?.len();
        payload::read_frame(file, file_len, &path)
    });
    let (header, payload) = match frame {
        Ok(Some(frame)) => frame,
        Ok(None) => return None,
        Err(error) => {
            log::warn!("failed to read index {}: {error}", path.display());
            return None;
        }
    };
    let descriptor = payload::decode_descriptor(&payload, &path)?;

    match Collection::from_descriptor(descriptor, header.kind, header.version, Some(handle)) {
        Ok(collection) => {
            log::debug!(
                "read index {} ({} files, {} groups)",
                path.display(),
                collection.files().len(),
                collection.groups().len()
            );
            Some(collection)
        }
        Err(error) => {
            log::warn!("index {} is inconsistent: {error}", path.display());
            None
        }
    }
}

/// Opens the index at `path` through the handle cache.
///
/// `Ok(None)` when the file does not exist or is not a usable index.
pub fn open_collection(path: &Path) -> Result<Option<Collection>> {
    match handle_cache::acquire_file(path) {
        Ok(handle) => Ok(read_collection(handle)),
        Err(CollectionError::PathNotFound(_)) => Ok(None),
        Err(error) => Err(error),
    }
}

/// Serializes `collection` to `out`, loading every record table first.
pub fn write_collection<W: Write + ?Sized>(collection: &Collection, out: &mut W) -> Result<()> {
    let (descriptor, tables) = collection.to_index_contents()?;
    write_index(out, descriptor, &tables)
}

/// Writes an index file atomically: a temp file in the target directory is
/// renamed over `path` once complete.
pub fn write_index_file(path: &Path, descriptor: CollectionDescriptor, tables: &RecordTables) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(|error| {
        CollectionError::Internal(format!(
            "failed to create index directory {}: {error}",
            dir.display()
        ))
    })?;

    let name = descriptor.name.clone();
    let groups = descriptor.groups.len();
    let mut temp = NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(temp.as_file_mut());
        write_index(&mut writer, descriptor, tables)?;
        writer.flush()?;
    }
    temp.persist(path).map_err(|error| {
        CollectionError::Internal(format!(
            "failed to finalize index file {}: {}",
            path.display(),
            error.error
        ))
    })?;

    log::debug!("wrote index {} for {name} ({groups} groups)", path.display());
    Ok(())
}
