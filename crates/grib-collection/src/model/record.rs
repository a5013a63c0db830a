//! Physical data records and the per-variable record table.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{CollectionError, Result};

/// Location of one data record inside a source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Record {
    /// Index into the collection's data file list.
    pub fileno: u32,
    /// Byte offset where the record payload starts.
    pub pos: u64,
    /// Byte offset of the bitmap mask, 0 when absent.
    pub bms_pos: u64,
}

impl Record {
    pub fn new(fileno: u32, pos: u64, bms_pos: u64) -> Self {
        Self {
            fileno,
            pos,
            bms_pos,
        }
    }

    pub fn has_bitmap(&self) -> bool {
        self.bms_pos != 0
    }
}

/// Serialized record table of one variable.
///
/// The table is dense over the variable's linear index; a coordinate with no
/// record is `None`. `hash` repeats the owning variable's identity hash so a
/// table read from the wrong byte range is detected.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RecordTable {
    pub hash: u32,
    pub records: Vec<Option<Record>>,
}

#[derive(Serialize)]
struct RecordTableRef<'a> {
    hash: u32,
    records: &'a [Option<Record>],
}

impl RecordTable {
    /// Encodes a table without copying the records.
    pub fn encode(hash: u32, records: &[Option<Record>]) -> Result<Vec<u8>> {
        postcard::to_stdvec(&RecordTableRef { hash, records }).map_err(|error| {
            CollectionError::Serialization(format!("failed to encode record table: {error}"))
        })
    }

    /// Decodes a table; undecodable bytes mean the index is corrupt.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        postcard::from_bytes(bytes).map_err(|error| {
            CollectionError::CorruptIndex(format!("undecodable record table: {error}"))
        })
    }
}

/// Resolved location of a record: the data file on disk and offsets inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLocation {
    pub path: PathBuf,
    pub pos: u64,
    pub bms_pos: u64,
}
