//! Serialized shape of an index payload.
//!
//! Every field is plain ordered data (vectors, no maps, no timestamps of the
//! write itself) so that writing the same collection twice yields the same bytes.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::coord::Coordinate;
use crate::scan::SourceFile;

use super::collection::{ChildRef, Producer};
use super::group::GridDefinition;
use super::record::Record;
use super::variable::{ChildVariable, VariableKey};

/// Record tables to be written alongside a descriptor, `tables[group][variable]`.
pub type RecordTables = Vec<Vec<Arc<[Option<Record>]>>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionDescriptor {
    pub name: String,
    pub directory: PathBuf,
    pub producer: Producer,
    /// Data files for a leaf, child index files for a partition.
    pub files: Vec<SourceFile>,
    /// Scanned data files the locator could not read. Always empty for a partition.
    pub skipped: Vec<SourceFile>,
    pub groups: Vec<GroupDescriptor>,
    pub partition: Option<PartitionDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupDescriptor {
    pub grid: GridDefinition,
    /// Positions in the collection's `files` that contribute to this group.
    pub filenos: Vec<u32>,
    pub coordinates: Vec<Coordinate>,
    pub variables: Vec<VariableDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDescriptor {
    pub key: VariableKey,
    pub hash: u32,
    pub coords: Vec<u16>,
    /// Absolute byte offset of the record table in the index file.
    pub records_pos: u64,
    pub records_len: u32,
    pub partition_children: Vec<ChildVariable>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionDescriptor {
    pub children: Vec<ChildRef>,
    /// Every child's data files, concatenated in child order.
    pub data_files: Vec<SourceFile>,
}
