//! Record discovery inside data files.
//!
//! Decoding the data format itself is delegated to a [`RecordLocator`]. What
//! it finds in a file is cached next to the file in a companion
//! `<name>.gbx9` inventory (postcard, zstd compressed), so later builds only
//! call the locator for files that changed.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::config::UpdatePolicy;
use crate::coord::{EnsembleMember, TimeValue, VerticalLevel};
use crate::error::{CollectionError, Result};
use crate::model::{GridDefinition, Producer, VariableKey};
use crate::scan::{modified_ms, SourceFile};

/// Suffix appended to a data file name to form its companion inventory.
pub const LOCATOR_SUFFIX: &str = ".gbx9";

/// Version 1: postcard encoded `PersistentInventory`, zstd compressed.
const INVENTORY_VERSION: u32 = 1;

/// One data record found in a file, with every coordinate it sits at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocatedRecord {
    pub grid: GridDefinition,
    pub key: VariableKey,
    pub runtime: DateTime<Utc>,
    pub time: TimeValue,
    pub vertical: Option<VerticalLevel>,
    pub ensemble: Option<EnsembleMember>,
    pub pos: u64,
    pub bms_pos: u64,
}

/// Everything a locator found in one data file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileInventory {
    pub producer: Producer,
    pub records: Vec<LocatedRecord>,
}

/// Finds the records of a data file.
///
/// `aux` is the opaque configuration value of the collection being built.
pub trait RecordLocator: Send + Sync {
    fn locate(&self, path: &Path, aux: &serde_json::Value) -> Result<FileInventory>;
}

impl<F> RecordLocator for F
where
    F: Fn(&Path, &serde_json::Value) -> Result<FileInventory> + Send + Sync,
{
    fn locate(&self, path: &Path, aux: &serde_json::Value) -> Result<FileInventory> {
        self(path, aux)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistentInventory {
    version: u32,
    data_last_modified: u64,
    data_size: u64,
    inventory: FileInventory,
}

pub fn companion_path(data: &Path) -> PathBuf {
    let mut name = data.as_os_str().to_os_string();
    name.push(LOCATOR_SUFFIX);
    PathBuf::from(name)
}

/// Loads the companion inventory of `data`.
///
/// With `check_fresh`, an inventory recorded for a different version of the
/// data file, or older than it, is ignored. Unreadable inventories are `None`.
pub fn read_companion(data: &SourceFile, check_fresh: bool) -> Option<FileInventory> {
    let path = companion_path(&data.path);
    let input = match File::open(&path) {
        Ok(file) => file,
        Err(error) if error.kind() == ErrorKind::NotFound => return None,
        Err(error) => {
            log::warn!("companion read failed for {}: {error}", path.display());
            return None;
        }
    };
    let companion_modified = input.metadata().map(|metadata| modified_ms(&metadata)).unwrap_or(0);

    let decoder = match zstd::Decoder::new(input) {
        Ok(decoder) => decoder,
        Err(error) => {
            log::warn!("companion decompress failed for {}: {error}", path.display());
            return None;
        }
    };
    let mut input = BufReader::new(decoder);
    let mut scratch = vec![0u8; 4 * 1024];
    let stored: PersistentInventory = match postcard::from_io((&mut input, &mut scratch)) {
        Ok((stored, _)) => stored,
        Err(error) => {
            log::warn!("companion decode failed for {}: {error}", path.display());
            return None;
        }
    };

    if stored.version != INVENTORY_VERSION {
        log::debug!(
            "companion version mismatch for {}: {} != {INVENTORY_VERSION}",
            path.display(),
            stored.version
        );
        return None;
    }
    if check_fresh
        && (stored.data_last_modified != data.last_modified
            || stored.data_size != data.size
            || companion_modified < data.last_modified)
    {
        log::debug!("companion {} is stale", path.display());
        return None;
    }
    Some(stored.inventory)
}

/// Writes the companion inventory of `data` atomically.
pub fn write_companion(data: &SourceFile, inventory: &FileInventory) -> Result<()> {
    let path = companion_path(&data.path);
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let stored = PersistentInventory {
        version: INVENTORY_VERSION,
        data_last_modified: data.last_modified,
        data_size: data.size,
        inventory: inventory.clone(),
    };

    let mut temp = NamedTempFile::new_in(dir)?;
    {
        let encoder = zstd::Encoder::new(temp.as_file_mut(), 3).map_err(|error| {
            CollectionError::Internal(format!("failed to create zstd encoder: {error}"))
        })?;
        let mut output = BufWriter::new(encoder.auto_finish());
        postcard::to_io(&stored, &mut output).map_err(|error| {
            CollectionError::Serialization(format!("failed to encode companion inventory: {error}"))
        })?;
        output.flush()?;
    }
    temp.persist(&path).map_err(|error| {
        CollectionError::Internal(format!(
            "failed to finalize companion {}: {}",
            path.display(),
            error.error
        ))
    })?;
    log::debug!(
        "wrote companion {} ({} records)",
        path.display(),
        inventory.records.len()
    );
    Ok(())
}

/// Returns the inventory of `file`, reusing its companion when `policy` allows.
///
/// A freshly located inventory is written back as the new companion; failing
/// to write it (read-only data directories) only costs a warning.
pub fn ensure_inventory(
    locator: &dyn RecordLocator,
    file: &SourceFile,
    policy: UpdatePolicy,
    aux: &serde_json::Value,
) -> Result<FileInventory> {
    let reused = match policy {
        UpdatePolicy::Always => None,
        UpdatePolicy::Test => read_companion(file, true),
        UpdatePolicy::Nocheck => read_companion(file, false),
        UpdatePolicy::Never => {
            return read_companion(file, false)
                .ok_or_else(|| CollectionError::IndexMissing(companion_path(&file.path)));
        }
    };
    if let Some(inventory) = reused {
        return Ok(inventory);
    }

    let inventory = locator.locate(&file.path, aux)?;
    if let Err(error) = write_companion(file, &inventory) {
        log::warn!(
            "could not write companion for {}: {error}",
            file.path.display()
        );
    }
    Ok(inventory)
}

/// Removes the companion of `data`, if any.
pub fn remove_companion(data: &Path) -> Result<()> {
    match fs::remove_file(companion_path(data)) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error.into()),
    }
}
