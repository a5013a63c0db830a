//! Indexes collections of gridded model output files.
//!
//! This crate provides:
//! - A versioned binary index format with lazily loaded record tables
//! - Collection, group and variable models over that index
//! - Incremental rebuilds driven by update policies
//! - Partitions merging child collections onto shared axes
//! - A bounded pool of open file handles

pub mod builder;
pub mod codec;
pub mod config;
pub mod coord;
pub mod error;
pub mod file_handle;
pub mod handle_cache;
pub mod index_location;
pub mod locator;
pub mod model;
pub mod scan;

#[cfg(test)]
mod testing;

pub use builder::{open, open_with_outcome, BuildOutcome};
pub use config::{CollectionConfig, CollectionSpec, PartitionKind, UpdatePolicy};
pub use coord::{CoordIndex, Coordinate};
pub use error::{CollectionError, Result};
pub use handle_cache::{HandleCache, HandleCacheConfig};
pub use locator::{FileInventory, LocatedRecord, RecordLocator};
pub use model::{Collection, DataLocation, Group, VariableIndex, VariableKey};
