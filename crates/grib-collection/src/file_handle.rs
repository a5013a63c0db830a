//! Shared read-only file handle with an explicit offset API.
//!
//! A `File` carries an implicit cursor, so seek-then-read must be atomic when
//! the handle is shared. `FileHandle` hides the cursor behind a mutex and only
//! exposes positioned reads.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::UNIX_EPOCH;

use parking_lot::Mutex;

use crate::error::{CollectionError, Result};

#[derive(Debug)]
pub struct FileHandle {
    path: PathBuf,
    file: Mutex<File>,
    /// Number of positioned reads served, for diagnostics.
    reads: AtomicU64,
}

impl FileHandle {
    /// Opens `path` read-only.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|error| match error.kind() {
            std::io::ErrorKind::NotFound => CollectionError::PathNotFound(path.to_path_buf()),
            _ => CollectionError::Io(error),
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            reads: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads exactly `len` bytes starting at `offset`.
    pub fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.with_cursor(offset, |file| {
            let mut buf = vec![0u8; len];
            file.read_exact(&mut buf)?;
            Ok(buf)
        })
    }

    /// Runs `f` with exclusive access to the file positioned at `offset`.
    ///
    /// Use this for sequential decodes that must not interleave with other readers.
    pub fn with_cursor<R>(&self, offset: u64, f: impl FnOnce(&mut File) -> Result<R>) -> Result<R> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        f(&mut file)
    }

    /// Current length of the underlying file in bytes.
    pub fn len(&self) -> Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Last modification time in milliseconds since the Unix epoch, 0 if unknown.
    pub fn last_modified_ms(&self) -> u64 {
        self.file
            .lock()
            .metadata()
            .ok()
            .and_then(|metadata| metadata.modified().ok())
            .and_then(|value| value.duration_since(UNIX_EPOCH).ok())
            .map(|value| value.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Number of positioned reads served so far.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }
}
