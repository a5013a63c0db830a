//! Fixed-size index header: magic, version and record section length.

use std::io::{ErrorKind, Read, Write};

use crate::error::{CollectionError, Result};

pub const MAGIC_LEN: usize = 20;
pub const LEAF_MAGIC: &[u8; MAGIC_LEN] = b"Grib2Collectio2Index";
pub const PARTITION_MAGIC: &[u8; MAGIC_LEN] = b"Grib2Partition2Index";

/// Version written by this crate.
pub const INDEX_VERSION: u32 = 1;
/// Oldest version this crate can read.
pub const MIN_INDEX_VERSION: u32 = 1;

/// Bytes before the record section: magic, version, record section length.
pub const HEADER_LEN: u64 = MAGIC_LEN as u64 + 4 + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexKind {
    Leaf,
    Partition,
    Unrecognized,
}

impl IndexKind {
    pub fn from_magic(magic: &[u8]) -> Self {
        if magic == LEAF_MAGIC {
            Self::Leaf
        } else if magic == PARTITION_MAGIC {
            Self::Partition
        } else {
            Self::Unrecognized
        }
    }

    pub fn magic(self) -> Option<&'static [u8; MAGIC_LEN]> {
        match self {
            Self::Leaf => Some(LEAF_MAGIC),
            Self::Partition => Some(PARTITION_MAGIC),
            Self::Unrecognized => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexHeader {
    pub kind: IndexKind,
    pub version: u32,
    /// Length of the record section that follows the header.
    pub records_len: u64,
}

impl IndexHeader {
    const UNRECOGNIZED: Self = Self {
        kind: IndexKind::Unrecognized,
        version: 0,
        records_len: 0,
    };

    pub fn is_supported_version(&self) -> bool {
        (MIN_INDEX_VERSION..=INDEX_VERSION).contains(&self.version)
    }
}

/// Reads the header from the start of `reader`.
///
/// A file too short to hold a header is reported as unrecognized, not as an error.
pub fn read_header<R: Read + ?Sized>(reader: &mut R) -> Result<IndexHeader> {
    let mut magic = [0u8; MAGIC_LEN];
    match reader.read_exact(&mut magic) {
        Ok(()) => {}
        Err(error) if error.kind() == ErrorKind::UnexpectedEof => return Ok(IndexHeader::UNRECOGNIZED),
        Err(error) => return Err(error.into()),
    }
    let kind = IndexKind::from_magic(&magic);
    if kind == IndexKind::Unrecognized {
        return Ok(IndexHeader::UNRECOGNIZED);
    }

    let mut word = [0u8; 4];
    let mut long = [0u8; 8];
    match reader.read_exact(&mut word).and_then(|()| reader.read_exact(&mut long)) {
        Ok(()) => Ok(IndexHeader {
            kind,
            version: u32::from_be_bytes(word),
            records_len: u64::from_be_bytes(long),
        }),
        Err(error) if error.kind() == ErrorKind::UnexpectedEof => Ok(IndexHeader::UNRECOGNIZED),
        Err(error) => Err(error.into()),
    }
}

pub fn write_header<W: Write + ?Sized>(out: &mut W, kind: IndexKind, records_len: u64) -> Result<()> {
    let magic = kind.magic().ok_or_else(|| {
        CollectionError::Internal("cannot write an unrecognized index kind".into())
    })?;
    out.write_all(magic)?;
    out.write_all(&INDEX_VERSION.to_be_bytes())?;
    out.write_all(&records_len.to_be_bytes())?;
    Ok(())
}
