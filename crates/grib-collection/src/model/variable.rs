use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::coord::{linear_index, AxisDiffers};
use crate::error::{CollectionError, Result};
use crate::file_handle::FileHandle;

use super::descriptor::VariableDescriptor;
use super::record::{Record, RecordTable};

/// The identifying attributes of a physical variable.
///
/// Two records belong to the same variable exactly when their keys are equal.
/// The derived ordering is the order variables appear in within a group.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VariableKey {
    pub discipline: i32,
    pub category: i32,
    pub parameter: i32,
    pub level_type: i32,
    pub is_layer: bool,
    pub interval_type: i32,
    pub interval_name: Option<String>,
    pub ens_derived_type: i32,
    pub probability_type: i32,
    pub probability_name: Option<String>,
}

impl VariableKey {
    /// A key with only the parameter triple and level type set.
    pub fn new(discipline: i32, category: i32, parameter: i32, level_type: i32) -> Self {
        Self {
            discipline,
            category,
            parameter,
            level_type,
            is_layer: false,
            interval_type: -1,
            interval_name: None,
            ens_derived_type: -1,
            probability_type: -1,
            probability_name: None,
        }
    }

    /// Identity hash, stable across processes and platforms.
    ///
    /// FNV-1a over the fields in declaration order, integers big-endian,
    /// folded to 32 bits. Record tables carry it, so changing the byte
    /// layout invalidates existing indexes.
    pub fn hash_code(&self) -> u32 {
        let mut hash = FNV_OFFSET_BASIS;
        for value in [self.discipline, self.category, self.parameter, self.level_type] {
            fnv1a_update(&mut hash, &value.to_be_bytes());
        }
        fnv1a_update(&mut hash, &[u8::from(self.is_layer)]);
        fnv1a_update(&mut hash, &self.interval_type.to_be_bytes());
        update_name(&mut hash, self.interval_name.as_deref());
        fnv1a_update(&mut hash, &self.ens_derived_type.to_be_bytes());
        fnv1a_update(&mut hash, &self.probability_type.to_be_bytes());
        update_name(&mut hash, self.probability_name.as_deref());
        (hash ^ (hash >> 32)) as u32
    }

    /// Short parameter id, `discipline-category-parameter`.
    pub fn parameter_id(&self) -> String {
        format!("{}-{}-{}", self.discipline, self.category, self.parameter)
    }
}

const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;

fn fnv1a_update(hash: &mut u64, bytes: &[u8]) {
    const FNV_PRIME: u64 = 0x100000001b3;
    for byte in bytes {
        *hash ^= u64::from(*byte);
        *hash = hash.wrapping_mul(FNV_PRIME);
    }
}

/// Tag byte, then length and bytes when present.
fn update_name(hash: &mut u64, name: Option<&str>) {
    match name {
        None => fnv1a_update(hash, &[0]),
        Some(name) => {
            fnv1a_update(hash, &[1]);
            fnv1a_update(hash, &(name.len() as u64).to_be_bytes());
            fnv1a_update(hash, name.as_bytes());
        }
    }
}

impl fmt::Display for VariableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_L{}", self.parameter_id(), self.level_type)?;
        if self.is_layer {
            f.write_str("_layer")?;
        }
        if let Some(name) = &self.interval_name {
            write!(f, "_{name}")?;
        }
        if self.ens_derived_type >= 0 {
            write!(f, "_D{}", self.ens_derived_type)?;
        }
        if let Some(name) = &self.probability_name {
            write!(f, "_Prob_{name}")?;
        }
        Ok(())
    }
}

/// A partition child contributing to a variable, with the axes it disagrees on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChildVariable {
    pub child: u32,
    pub differs: AxisDiffers,
}

/// Axis lengths of one variable. Absent axes have length 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct VariableDims {
    pub n_runtimes: usize,
    pub n_offsets: usize,
    pub n_ens: usize,
    pub n_vert: usize,
}

impl VariableDims {
    pub fn n_times(&self) -> usize {
        self.n_runtimes.max(1) * self.n_offsets.max(1)
    }

    pub fn table_size(&self) -> usize {
        self.n_times() * self.n_ens.max(1) * self.n_vert.max(1)
    }
}

/// One variable of a group and its lazily loaded record table.
#[derive(Debug)]
pub struct VariableIndex {
    key: VariableKey,
    hash: u32,
    coords: Vec<u16>,
    dims: VariableDims,
    records_pos: u64,
    records_len: u32,
    partition_children: Vec<ChildVariable>,
    records: RwLock<Option<Arc<[Option<Record>]>>>,
    index_file: Option<Arc<FileHandle>>,
}

impl VariableIndex {
    pub(crate) fn from_descriptor(
        descriptor: VariableDescriptor,
        dims: VariableDims,
        index_file: Option<Arc<FileHandle>>,
    ) -> Self {
        Self {
            key: descriptor.key,
            hash: descriptor.hash,
            coords: descriptor.coords,
            dims,
            records_pos: descriptor.records_pos,
            records_len: descriptor.records_len,
            partition_children: descriptor.partition_children,
            records: RwLock::new(None),
            index_file,
        }
    }

    /// Descriptor for writing, with the table stored at `records_pos`.
    pub(crate) fn to_descriptor(&self, records_pos: u64, records_len: u32) -> VariableDescriptor {
        VariableDescriptor {
            key: self.key.clone(),
            hash: self.hash,
            coords: self.coords.clone(),
            records_pos,
            records_len,
            partition_children: self.partition_children.clone(),
        }
    }

    pub fn key(&self) -> &VariableKey {
        &self.key
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }

    /// Positions of this variable's axes in the owning group's coordinate list.
    pub fn coords(&self) -> &[u16] {
        &self.coords
    }

    /// Length of the time dimension: runtimes times forecast offsets.
    pub fn n_times(&self) -> usize {
        self.dims.n_times()
    }

    pub fn n_runtimes(&self) -> usize {
        self.dims.n_runtimes
    }

    pub fn n_offsets(&self) -> usize {
        self.dims.n_offsets
    }

    pub fn n_ens(&self) -> usize {
        self.dims.n_ens
    }

    pub fn n_vert(&self) -> usize {
        self.dims.n_vert
    }

    /// Number of slots in the record table.
    pub fn table_size(&self) -> usize {
        self.dims.table_size()
    }

    pub fn records_pos(&self) -> u64 {
        self.records_pos
    }

    pub fn records_len(&self) -> u32 {
        self.records_len
    }

    pub fn partition_children(&self) -> &[ChildVariable] {
        &self.partition_children
    }

    pub fn is_loaded(&self) -> bool {
        self.records.read().is_some()
    }

    /// Loads the record table from the index file if it is not loaded yet.
    ///
    /// Safe to call concurrently: readers that race all decode the same bytes
    /// and the first to finish publishes its table.
    pub fn read_records(&self) -> Result<()> {
        if self.is_loaded() {
            return Ok(());
        }

        let records: Arc<[Option<Record>]> = if self.records_len == 0 {
            vec![None; self.table_size()].into()
        } else {
            let handle = self.index_file.as_ref().ok_or_else(|| {
                CollectionError::Internal(format!("variable {} has no index file", self.key))
            })?;
            let end = self.records_pos.checked_add(u64::from(self.records_len));
            let file_len = handle.len()?;
            if !end.is_some_and(|end| end <= file_len) {
                return Err(CollectionError::CorruptIndex(format!(
                    "record table of {} at {}+{} lies beyond the index end ({file_len} bytes)",
                    self.key, self.records_pos, self.records_len
                )));
            }
            let bytes = handle.read_at(self.records_pos, self.records_len as usize)?;
            let table = RecordTable::decode(&bytes)?;
            if table.hash != self.hash {
                return Err(CollectionError::CorruptIndex(format!(
                    "record table hash {:#x} does not match variable {} ({:#x})",
                    table.hash, self.key, self.hash
                )));
            }
            if table.records.len() != self.table_size() {
                return Err(CollectionError::CorruptIndex(format!(
                    "record table of {} has {} slots, expected {}",
                    self.key,
                    table.records.len(),
                    self.table_size()
                )));
            }
            table.records.into()
        };

        let mut slot = self.records.write();
        if slot.is_none() {
            *slot = Some(records);
        }
        Ok(())
    }

    /// The record table, loading it on first use.
    pub fn records(&self) -> Result<Arc<[Option<Record>]>> {
        self.read_records()?;
        self.records
            .read()
            .clone()
            .ok_or_else(|| CollectionError::Internal(format!("records of {} not loaded", self.key)))
    }

    /// Record at a (time, ensemble, vertical) position, `None` when missing or out of range.
    pub fn record(&self, time: usize, ens: usize, vert: usize) -> Result<Option<Record>> {
        if time >= self.n_times() || ens >= self.dims.n_ens.max(1) || vert >= self.dims.n_vert.max(1) {
            return Ok(None);
        }
        let index = linear_index(time, ens, vert, self.dims.n_ens, self.dims.n_vert);
        Ok(self.records()?.get(index).copied().flatten())
    }

    /// Drops the loaded table; the next access reads it from disk again.
    pub fn unload(&self) {
        *self.records.write() = None;
    }
}

impl fmt::Display for VariableIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} hash={:#010x} times={} ens={} vert={} records@{}+{}",
            self.key,
            self.hash,
            self.n_times(),
            self.dims.n_ens,
            self.dims.n_vert,
            self.records_pos,
            self.records_len
        )
    }
}
