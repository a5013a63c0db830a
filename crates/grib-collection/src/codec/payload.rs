//! Record section and descriptor payload.
//!
//! Layout after the header: the record section (one encoded record table per
//! variable, in group then variable order), a LEB128 payload size, then the
//! postcard-encoded [`CollectionDescriptor`].

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{CollectionError, Result};
use crate::model::{CollectionDescriptor, RecordTable, RecordTables};

use super::header::{self, IndexHeader, IndexKind, HEADER_LEN};
use super::varint;

/// Largest payload a reader accepts. Anything bigger is treated as corruption.
pub const MAX_PAYLOAD_SIZE: u64 = 100_000_000;

/// Reads the header and raw payload bytes.
///
/// Returns `Ok(None)` when the file is not a usable index; the reason is logged.
/// The payload size is validated before any buffer is allocated for it.
pub(crate) fn read_frame<R: Read + Seek + ?Sized>(
    reader: &mut R,
    file_len: u64,
    path: &Path,
) -> Result<Option<(IndexHeader, Vec<u8>)>> {
    let header = header::read_header(reader)?;
    if header.kind == IndexKind::Unrecognized {
        log::warn!("{} is not a collection index (unrecognized magic)", path.display());
        return Ok(None);
    }
    if !header.is_supported_version() {
        log::warn!(
            "{} has unsupported index version {}",
            path.display(),
            header.version
        );
        return Ok(None);
    }

    let payload_start = match HEADER_LEN.checked_add(header.records_len) {
        Some(start) if start <= file_len => start,
        _ => {
            log::warn!(
                "{} declares a {} byte record section but is {file_len} bytes long",
                path.display(),
                header.records_len
            );
            return Ok(None);
        }
    };
    reader.seek(SeekFrom::Start(payload_start))?;

    let size = match varint::read_varint(reader) {
        Ok(size) => size,
        Err(error) => {
            log::warn!("{} has an unreadable payload size: {error}", path.display());
            return Ok(None);
        }
    };
    let remaining = file_len.saturating_sub(reader.stream_position()?);
    if size > MAX_PAYLOAD_SIZE || size > remaining {
        log::warn!(
            "{} declares an implausible payload of {size} bytes ({remaining} remaining)",
            path.display()
        );
        return Ok(None);
    }

    let mut payload = vec![0u8; size as usize];
    reader.read_exact(&mut payload)?;
    Ok(Some((header, payload)))
}

/// Decodes a payload; `None` (logged) when it is not a valid descriptor.
pub(crate) fn decode_descriptor(payload: &[u8], path: &Path) -> Option<CollectionDescriptor> {
    match postcard::from_bytes(payload) {
        Ok(descriptor) => Some(descriptor),
        Err(error) => {
            log::warn!("{} has an undecodable payload: {error}", path.display());
            None
        }
    }
}

/// Writes a complete index: header, record section and descriptor payload.
///
/// Record table positions in `descriptor` are filled in from `tables`.
pub fn write_index<W: Write + ?Sized>(
    out: &mut W,
    mut descriptor: CollectionDescriptor,
    tables: &RecordTables,
) -> Result<()> {
    if tables.len() != descriptor.groups.len() {
        return Err(CollectionError::Internal(format!(
            "{} record table groups for {} groups",
            tables.len(),
            descriptor.groups.len()
        )));
    }

    let mut section = Vec::new();
    for (group, group_tables) in descriptor.groups.iter_mut().zip(tables) {
        if group_tables.len() != group.variables.len() {
            return Err(CollectionError::Internal(format!(
                "{} record tables for {} variables in group {}",
                group_tables.len(),
                group.variables.len(),
                group.grid.base_id()
            )));
        }
        for (variable, records) in group.variables.iter_mut().zip(group_tables) {
            let bytes = RecordTable::encode(variable.hash, records)?;
            variable.records_pos = HEADER_LEN + section.len() as u64;
            variable.records_len = u32::try_from(bytes.len()).map_err(|_| {
                CollectionError::Serialization(format!(
                    "record table of {} is {} bytes",
                    variable.key,
                    bytes.len()
                ))
            })?;
            section.extend_from_slice(&bytes);
        }
    }

    let kind = if descriptor.partition.is_some() {
        IndexKind::Partition
    } else {
        IndexKind::Leaf
    };
    let payload = postcard::to_stdvec(&descriptor).map_err(|error| {
        CollectionError::Serialization(format!("failed to encode index payload: {error}"))
    })?;
    if payload.len() as u64 > MAX_PAYLOAD_SIZE {
        return Err(CollectionError::Serialization(format!(
            "index payload of {} is {} bytes",
            descriptor.name,
            payload.len()
        )));
    }

    header::write_header(out, kind, section.len() as u64)?;
    out.write_all(&section)?;
    let mut size = Vec::with_capacity(10);
    varint::encode_varint(payload.len() as u64, &mut size);
    out.write_all(&size)?;
    out.write_all(&payload)?;
    Ok(())
}
