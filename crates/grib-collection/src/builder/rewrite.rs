//! Forced rebuild entry points.

use crate::config::{CollectionConfig, PartitionKind, UpdatePolicy};
use crate::error::Result;
use crate::locator::{self, RecordLocator};
use crate::model::Collection;

use super::collection::{build_leaf, LeafSource};
use super::partition::{build_partition, PartitionSource};

/// Rebuilds a partition and every collection below it, reusing nothing.
pub fn rewrite_partition_all(config: &CollectionConfig, locator: &dyn RecordLocator) -> Result<Collection> {
    let source = PartitionSource::from_config(config)?;
    log::info!("rewriting partition {} and all children", source.name);
    let outcome = build_partition(
        &source,
        UpdatePolicy::Always,
        UpdatePolicy::Always,
        &config.aux,
        locator,
    )?;
    Ok(outcome.collection)
}

/// Refreshes the companion inventory of every data file with `force_children`,
/// then opens the collection index with `force_collection`.
///
/// With `force_children` set to `never`, existing companions are required and
/// no data file is read.
pub fn rewrite_directory_collection(
    config: &CollectionConfig,
    force_collection: UpdatePolicy,
    force_children: UpdatePolicy,
    locator: &dyn RecordLocator,
) -> Result<Collection> {
    let source = LeafSource::from_config(config);
    let companion_update = if force_children == UpdatePolicy::Never {
        UpdatePolicy::Never
    } else {
        for file in source.current_files()? {
            if let Err(error) = locator::ensure_inventory(locator, &file, force_children, &config.aux) {
                log::warn!("skipping {}: {error}", file.path.display());
            }
        }
        UpdatePolicy::Nocheck
    };
    let outcome = build_leaf(&source, force_collection, companion_update, &config.aux, locator)?;
    Ok(outcome.collection)
}

/// Opens the file partition over `config`'s root, where every data file is a
/// child collection. Returns true when the partition index was recreated.
pub fn rewrite_file_partition(
    config: &CollectionConfig,
    force_collection: UpdatePolicy,
    force_children: UpdatePolicy,
    locator: &dyn RecordLocator,
) -> Result<bool> {
    let mut source = PartitionSource::new(config.name.clone(), config.spec.root(), PartitionKind::File);
    source.pattern = config.spec.pattern().map(str::to_string);
    let outcome = build_partition(&source, force_collection, force_children, &config.aux, locator)?;
    Ok(outcome.rebuilt)
}
