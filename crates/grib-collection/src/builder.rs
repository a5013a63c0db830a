//! Opening collections, building their indexes when needed.
//!
//! A request resolves to the existing index when the update policy allows
//! it, or to a fresh build that writes a new index and reads it back.
//! Builds run on the calling thread; partitions build their children
//! depth-first before merging them.

mod collection;
mod partition;
pub(crate) mod policy;
pub mod rewrite;

pub use collection::{build_leaf, FileSelection, LeafSource};
pub use partition::{build_partition, PartitionSource};
pub use rewrite::{rewrite_directory_collection, rewrite_file_partition, rewrite_partition_all};

use crate::config::CollectionConfig;
use crate::error::Result;
use crate::locator::RecordLocator;
use crate::model::Collection;

/// An opened collection and whether its index was written by this call.
#[derive(Debug)]
pub struct BuildOutcome {
    pub collection: Collection,
    pub rebuilt: bool,
}

/// Opens the collection described by `config`, honoring its update policies.
pub fn open(config: &CollectionConfig, locator: &dyn RecordLocator) -> Result<Collection> {
    open_with_outcome(config, locator).map(|outcome| outcome.collection)
}

pub fn open_with_outcome(config: &CollectionConfig, locator: &dyn RecordLocator) -> Result<BuildOutcome> {
    if config.partition.is_some() {
        let source = PartitionSource::from_config(config)?;
        build_partition(&source, config.update, config.child_update, &config.aux, locator)
    } else {
        let source = LeafSource::from_config(config);
        build_leaf(&source, config.update, config.child_update, &config.aux, locator)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;
    use crate::config::{CollectionSpec, PartitionKind, UpdatePolicy};
    use crate::error::CollectionError;
    use crate::testing::{self, LineLocator};

    #[test]
    fn opens_a_leaf_from_a_saved_config() {
        let dir = TempDir::new().expect("tempdir");
        testing::write_data_file(dir.path(), "a.grib2", &["1 0 0 0 100 0 0 500"]);
        let config_path = dir.path().join("collection.json");
        CollectionConfig::new(
            "leaf",
            CollectionSpec::Glob {
                root: dir.path().to_path_buf(),
                pattern: "*.grib2".to_string(),
            },
        )
        .save(&config_path)
        .expect("save");

        let config = CollectionConfig::load(&config_path).expect("load");
        let locator = LineLocator::default();
        let first = open_with_outcome(&config, &locator).expect("open");
        assert!(first.rebuilt);
        assert!(!first.collection.is_partition());
        assert_eq!(first.collection.file_names(), vec!["a.grib2".to_string()]);

        let second = open_with_outcome(&config, &locator).expect("reopen");
        assert!(!second.rebuilt);
        assert_eq!(locator.total_calls(), 1);
    }

    #[test]
    fn opens_a_partition_when_configured() {
        let root = TempDir::new().expect("tempdir");
        for (day, hour) in [("d1", 0), ("d2", 6)] {
            let dir = root.path().join(day);
            fs::create_dir(&dir).expect("mkdir");
            testing::write_data_file(&dir, "run.grib2", &[&format!("1 0 0 0 100 {hour} 0 500")]);
        }
        let config = CollectionConfig::new(
            "runs",
            CollectionSpec::Directory {
                root: root.path().to_path_buf(),
            },
        )
        .with_partition(PartitionKind::Directory);

        let partition = open(&config, &LineLocator::default()).expect("open");
        assert!(partition.is_partition());
        assert_eq!(partition.children().len(), 2);
    }

    #[test]
    fn never_refuses_to_build() {
        let dir = TempDir::new().expect("tempdir");
        testing::write_data_file(dir.path(), "a.grib2", &["1 0 0 0 100 0 0 500"]);
        let config = CollectionConfig::new(
            "leaf",
            CollectionSpec::Directory {
                root: dir.path().to_path_buf(),
            },
        )
        .with_update(UpdatePolicy::Never);

        let err = open(&config, &LineLocator::default()).expect_err("never");
        assert!(matches!(err, CollectionError::IndexMissing(_)));
    }
}
