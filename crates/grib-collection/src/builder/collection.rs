//! Building leaf collections from data files.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use fnv::FnvHashMap;

use crate::codec;
use crate::config::{CollectionConfig, CollectionSpec, UpdatePolicy};
use crate::coord::{linear_index, Axis, Coordinate, TimeValue};
use crate::error::{CollectionError, Result};
use crate::index_location;
use crate::locator::{self, FileInventory, LocatedRecord, RecordLocator};
use crate::model::{
    Collection, CollectionDescriptor, GridDefinition, GroupDescriptor, Record, RecordTables,
    VariableAxes, VariableDescriptor, VariableKey,
};
use crate::scan::{DirectoryScan, SourceFile};

use super::policy::{self, Decision};
use super::BuildOutcome;

/// Which data files make up a leaf collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSelection {
    Scan(DirectoryScan),
    Single(PathBuf),
}

/// A leaf collection to open or build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafSource {
    pub name: String,
    pub directory: PathBuf,
    pub files: FileSelection,
}

impl LeafSource {
    /// Every data file directly under `directory`, optionally filtered by a glob.
    pub fn directory(name: impl Into<String>, directory: &Path, pattern: Option<&str>) -> Self {
        let scan = match pattern {
            Some(pattern) => DirectoryScan::with_pattern(directory, pattern),
            None => DirectoryScan::new(directory),
        };
        Self {
            name: name.into(),
            directory: directory.to_path_buf(),
            files: FileSelection::Scan(scan),
        }
    }

    /// A collection of one file, named after the file.
    pub fn single_file(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let directory = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            name,
            directory,
            files: FileSelection::Single(path.to_path_buf()),
        }
    }

    pub fn from_config(config: &CollectionConfig) -> Self {
        match &config.spec {
            CollectionSpec::Directory { root } => Self::directory(&config.name, root, None),
            CollectionSpec::Glob { root, pattern } => Self::directory(&config.name, root, Some(pattern)),
            CollectionSpec::File { path } => Self::single_file(path),
        }
    }

    pub fn index_path(&self) -> PathBuf {
        index_location::index_path(&self.directory, &self.name)
    }

    /// Current data files. Files that cannot be inspected are logged and left out.
    pub fn current_files(&self) -> Result<Vec<SourceFile>> {
        match &self.files {
            FileSelection::Single(path) => Ok(vec![SourceFile::from_path(path)?]),
            FileSelection::Scan(scan) => {
                let mut files = Vec::new();
                for file in scan.files()? {
                    match file {
                        Ok(file) => files.push(file),
                        Err(error) => log::warn!("skipping file in {}: {error}", scan.root().display()),
                    }
                }
                Ok(files)
            }
        }
    }
}

/// Opens the index of `source`, rebuilding it when `update` requires.
///
/// `companion_update` governs reuse of each data file's companion inventory.
pub fn build_leaf(
    source: &LeafSource,
    update: UpdatePolicy,
    companion_update: UpdatePolicy,
    aux: &serde_json::Value,
    locator: &dyn RecordLocator,
) -> Result<BuildOutcome> {
    let index_path = source.index_path();
    let decision = policy::decide(update, &index_path, |existing| {
        let current = source.current_files()?;
        Ok(policy::same_sources(&scanned_files(existing), &current)
            && policy::index_is_newer(&index_path, &current))
    })?;
    if let Decision::Reuse(collection) = decision {
        return Ok(BuildOutcome {
            collection,
            rebuilt: false,
        });
    }

    let started = Instant::now();
    let mut files = Vec::new();
    let mut skipped = Vec::new();
    let mut inventories = Vec::new();
    for file in source.current_files()? {
        match locator::ensure_inventory(locator, &file, companion_update, aux) {
            Ok(inventory) => {
                files.push(file);
                inventories.push(inventory);
            }
            Err(error) => {
                log::warn!("skipping {}: {error}", file.path.display());
                skipped.push(file);
            }
        }
    }
    if files.is_empty() {
        return Err(CollectionError::BuildFailed(format!(
            "collection {} has no usable data files in {}",
            source.name,
            source.directory.display()
        )));
    }

    let (mut descriptor, tables) = assemble_leaf(&source.name, &source.directory, files, &inventories)?;
    descriptor.skipped = skipped;
    codec::write_index_file(&index_path, descriptor, &tables)?;
    let collection = codec::open_collection(&index_path)?.ok_or_else(|| {
        CollectionError::Internal(format!("index {} unreadable after write", index_path.display()))
    })?;

    log::info!(
        "built collection {} ({} files, {} groups) in {} ms",
        source.name,
        collection.files().len(),
        collection.groups().len(),
        started.elapsed().as_millis()
    );
    Ok(BuildOutcome {
        collection,
        rebuilt: true,
    })
}

/// Every file the last build scanned, indexed or skipped, in scan order.
fn scanned_files(collection: &Collection) -> Vec<SourceFile> {
    let mut files: Vec<SourceFile> = collection
        .files()
        .iter()
        .chain(collection.skipped())
        .cloned()
        .collect();
    files.sort_by(|a, b| a.path.cmp(&b.path));
    files
}

#[derive(Default)]
struct GroupRecords<'a> {
    filenos: BTreeSet<u32>,
    variables: BTreeMap<VariableKey, Vec<(u32, &'a LocatedRecord)>>,
}

/// Groups located records by grid and variable and lays out record tables.
///
/// Groups keep the order their grid first appears in; variables are sorted
/// by key. When two records share every coordinate, the later file wins.
pub(crate) fn assemble_leaf(
    name: &str,
    directory: &Path,
    files: Vec<SourceFile>,
    inventories: &[FileInventory],
) -> Result<(CollectionDescriptor, RecordTables)> {
    let mut order: FnvHashMap<u32, usize> = FnvHashMap::default();
    let mut grids: Vec<GridDefinition> = Vec::new();
    let mut groups: Vec<GroupRecords<'_>> = Vec::new();

    for (fileno, inventory) in inventories.iter().enumerate() {
        let fileno = fileno as u32;
        for record in &inventory.records {
            let index = *order.entry(record.grid.hash).or_insert_with(|| {
                grids.push(record.grid.clone());
                groups.push(GroupRecords::default());
                groups.len() - 1
            });
            let group = &mut groups[index];
            group.filenos.insert(fileno);
            group
                .variables
                .entry(record.key.clone())
                .or_default()
                .push((fileno, record));
        }
    }

    let mut group_descriptors = Vec::with_capacity(groups.len());
    let mut tables = Vec::with_capacity(groups.len());
    for (grid, group) in grids.into_iter().zip(groups) {
        let mut coordinates = Vec::new();
        let mut variables = Vec::with_capacity(group.variables.len());
        let mut group_tables = Vec::with_capacity(group.variables.len());
        for (key, records) in group.variables {
            let (coords, table) = assemble_variable(&key, &records, &mut coordinates)?;
            variables.push(VariableDescriptor {
                hash: key.hash_code(),
                key,
                coords,
                records_pos: 0,
                records_len: 0,
                partition_children: Vec::new(),
            });
            group_tables.push(Arc::from(table));
        }
        group_descriptors.push(GroupDescriptor {
            grid,
            filenos: group.filenos.into_iter().collect(),
            coordinates,
            variables,
        });
        tables.push(group_tables);
    }

    let descriptor = CollectionDescriptor {
        name: name.to_string(),
        directory: directory.to_path_buf(),
        producer: inventories.first().map(|inventory| inventory.producer).unwrap_or_default(),
        files,
        skipped: Vec::new(),
        groups: group_descriptors,
        partition: None,
    };
    Ok((descriptor, tables))
}

/// Position of `coordinate` in the group list, adding it when no equal one exists.
pub(crate) fn intern(coordinates: &mut Vec<Coordinate>, coordinate: Coordinate) -> Result<u16> {
    let index = match coordinates.iter().position(|have| *have == coordinate) {
        Some(index) => index,
        None => {
            coordinates.push(coordinate);
            coordinates.len() - 1
        }
    };
    u16::try_from(index)
        .map_err(|_| CollectionError::BuildFailed(format!("group has more than {} coordinates", u16::MAX)))
}

fn assemble_variable(
    key: &VariableKey,
    records: &[(u32, &LocatedRecord)],
    coordinates: &mut Vec<Coordinate>,
) -> Result<(Vec<u16>, Vec<Option<Record>>)> {
    let runtime = Axis::from_values(records.iter().map(|(_, record)| record.runtime));
    let time = match records.first().map(|(_, record)| record.time) {
        Some(TimeValue::Interval(_)) => Coordinate::TimeInterval(Axis::from_values(
            records.iter().filter_map(|(_, record)| match record.time {
                TimeValue::Interval(value) => Some(value),
                TimeValue::Offset(_) => None,
            }),
        )),
        _ => Coordinate::Time(Axis::from_values(records.iter().filter_map(
            |(_, record)| match record.time {
                TimeValue::Offset(value) => Some(value),
                TimeValue::Interval(_) => None,
            },
        ))),
    };
    let vertical = records
        .iter()
        .any(|(_, record)| record.vertical.is_some())
        .then(|| Axis::from_values(records.iter().filter_map(|(_, record)| record.vertical)));
    let ensemble = records
        .iter()
        .any(|(_, record)| record.ensemble.is_some())
        .then(|| Axis::from_values(records.iter().filter_map(|(_, record)| record.ensemble)));

    let axes = VariableAxes {
        runtime: Some(&runtime),
        time: Some(&time),
        vertical: vertical.as_ref(),
        ensemble: ensemble.as_ref(),
    };
    let dims = axes.dims();
    let mut table: Vec<Option<Record>> = vec![None; dims.table_size()];
    let mut unplaced = 0usize;
    let mut replaced = 0usize;

    for &(fileno, record) in records {
        let time_idx = axes.time_index(&record.runtime, &record.time);
        let ens_idx = match (axes.ensemble, &record.ensemble) {
            (Some(axis), Some(member)) => axis.position(member),
            (None, None) => Some(0),
            _ => None,
        };
        let vert_idx = match (axes.vertical, &record.vertical) {
            (Some(axis), Some(level)) => axis.position(level),
            (None, None) => Some(0),
            _ => None,
        };
        let (Some(time_idx), Some(ens_idx), Some(vert_idx)) = (time_idx, ens_idx, vert_idx) else {
            unplaced += 1;
            continue;
        };
        let slot = &mut table[linear_index(time_idx, ens_idx, vert_idx, dims.n_ens, dims.n_vert)];
        if slot.is_some() {
            replaced += 1;
        }
        *slot = Some(Record::new(fileno, record.pos, record.bms_pos));
    }
    if unplaced > 0 {
        log::warn!("{key}: {unplaced} records with inconsistent coordinates were dropped");
    }
    if replaced > 0 {
        log::debug!("{key}: {replaced} duplicate records replaced by later files");
    }

    let mut coords = vec![intern(coordinates, Coordinate::Runtime(runtime))?];
    coords.push(intern(coordinates, time)?);
    if let Some(vertical) = vertical {
        coords.push(intern(coordinates, Coordinate::Vertical(vertical))?);
    }
    if let Some(ensemble) = ensemble {
        coords.push(intern(coordinates, Coordinate::Ensemble(ensemble))?);
    }
    Ok((coords, table))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;
    use crate::coord::{CoordIndex, VerticalLevel};
    use crate::testing::{self, LineLocator};

    const NULL: serde_json::Value = serde_json::Value::Null;

    fn build(source: &LeafSource, update: UpdatePolicy, locator: &LineLocator) -> Result<BuildOutcome> {
        build_leaf(source, update, UpdatePolicy::Test, &NULL, locator)
    }

    #[test]
    fn groups_follow_first_grid_appearance() {
        let dir = TempDir::new().expect("tempdir");
        testing::write_data_file(
            dir.path(),
            "a.grib2",
            &["2 0 0 0 100 0 0 500", "1 0 1 8 1 0 0-6 -", "2 0 0 0 100 0 6 850"],
        );
        testing::write_data_file(dir.path(), "b.grib2", &["1 0 1 8 1 6 0-6 -", "2 0 0 0 100 6 0 500"]);

        let locator = LineLocator::default();
        let source = LeafSource::directory("leaf", dir.path(), Some("*.grib2"));
        let outcome = build(&source, UpdatePolicy::Always, &locator).expect("build");
        assert!(outcome.rebuilt);
        let collection = outcome.collection;

        assert_eq!(collection.files().len(), 2);
        let grids: Vec<u32> = collection.groups().iter().map(|group| group.grid().hash).collect();
        assert_eq!(grids, vec![2, 1]);
        assert_eq!(collection.find_group_by_id("grid-1").map(|g| g.grid().hash), Some(1));
        assert_eq!(collection.find_group_index_by_id("grid-2"), Some(0));

        let temperature = collection.group(0).expect("group").variable(0).expect("variable");
        assert_eq!(temperature.n_runtimes(), 2);
        assert_eq!(temperature.n_offsets(), 2);
        assert_eq!(temperature.n_vert(), 2);
        assert_eq!(temperature.table_size(), 8);

        // second runtime, offset 0, level 500 comes from b.grib2's second line
        let location = collection
            .locate(temperature, CoordIndex { time: 2, ens: 0, vert: 0 })
            .expect("locate")
            .expect("record");
        assert_eq!(location.path, dir.path().join("b.grib2"));
        assert_eq!(location.pos, "1 0 1 8 1 6 0-6 -\n".len() as u64);
        assert!(collection
            .locate(temperature, CoordIndex { time: 3, ens: 0, vert: 1 })
            .expect("locate")
            .is_none());
    }

    #[test]
    fn equal_axes_are_shared_within_a_group() {
        let dir = TempDir::new().expect("tempdir");
        testing::write_data_file(
            dir.path(),
            "a.grib2",
            &["1 0 0 0 100 0 0 500", "1 0 0 2 100 0 0 500", "1 0 0 3 100 0 0 850"],
        );
        let locator = LineLocator::default();
        let source = LeafSource::directory("shared", dir.path(), None);
        let collection = build(&source, UpdatePolicy::Always, &locator).expect("build").collection;

        let group = collection.group(0).expect("group");
        assert_eq!(group.variables().len(), 3);
        // runtime, time, two distinct vertical axes
        assert_eq!(group.coordinates().len(), 4);
        assert_eq!(group.variables()[0].coords(), group.variables()[1].coords());
        assert_ne!(group.variables()[0].coords(), group.variables()[2].coords());
        let axes = group.variable_axes(&group.variables()[2]);
        assert_eq!(axes.vertical.map(|axis| axis.values().to_vec()), Some(vec![VerticalLevel::new(850.0)]));
    }

    #[test]
    fn later_file_wins_duplicate_coordinates() {
        let dir = TempDir::new().expect("tempdir");
        testing::write_data_file(dir.path(), "a.grib2", &["1 0 0 0 100 0 0 500"]);
        testing::write_data_file(dir.path(), "b.grib2", &["# header", "1 0 0 0 100 0 0 500"]);
        let locator = LineLocator::default();
        let source = LeafSource::directory("dups", dir.path(), None);
        let collection = build(&source, UpdatePolicy::Always, &locator).expect("build").collection;

        let variable = collection.group(0).expect("group").variable(0).expect("variable");
        assert_eq!(variable.table_size(), 1);
        let record = variable.record(0, 0, 0).expect("record").expect("present");
        assert_eq!(record.fileno, 1);
        assert_eq!(record.pos, "# header\n".len() as u64);
    }

    #[test]
    fn unreadable_files_are_skipped() {
        let dir = TempDir::new().expect("tempdir");
        testing::write_data_file(dir.path(), "a.grib2", &["1 0 0 0 100 0 0 500"]);
        testing::write_data_file(dir.path(), "b.grib2", &["this is not a record line"]);
        let locator = LineLocator::default();
        let source = LeafSource::directory("partial", dir.path(), None);
        let collection = build(&source, UpdatePolicy::Always, &locator).expect("build").collection;
        assert_eq!(collection.file_names(), vec!["a.grib2"]);
    }

    #[test]
    fn skipped_files_do_not_force_rebuilds() {
        let dir = TempDir::new().expect("tempdir");
        testing::write_data_file(dir.path(), "a.grib2", &["1 0 0 0 100 0 0 500"]);
        let bad = testing::write_data_file(dir.path(), "b.grib2", &["this is not a record line"]);
        let locator = LineLocator::default();
        let source = LeafSource::directory("partial", dir.path(), None);

        let first = build(&source, UpdatePolicy::Test, &locator).expect("build");
        assert!(first.rebuilt);
        assert_eq!(first.collection.skipped().len(), 1);
        assert_eq!(first.collection.skipped()[0].path, bad);
        let calls = locator.total_calls();

        let second = build(&source, UpdatePolicy::Test, &locator).expect("reuse");
        assert!(!second.rebuilt);
        assert_eq!(second.collection.file_names(), vec!["a.grib2"]);
        assert_eq!(locator.total_calls(), calls);

        // a changed skipped file is noticed
        std::thread::sleep(std::time::Duration::from_millis(20));
        fs::write(&bad, "1 0 0 0 100 6 0 500\n").expect("fix");
        let third = build(&source, UpdatePolicy::Test, &locator).expect("rebuild");
        assert!(third.rebuilt);
        assert!(third.collection.skipped().is_empty());
        assert_eq!(third.collection.files().len(), 2);
    }

    #[test]
    fn no_usable_files_fails_the_build() {
        let dir = TempDir::new().expect("tempdir");
        testing::write_data_file(dir.path(), "b.grib2", &["garbage"]);
        let locator = LineLocator::default();
        let source = LeafSource::directory("broken", dir.path(), None);
        let err = build(&source, UpdatePolicy::Always, &locator).expect_err("no files");
        assert!(matches!(err, CollectionError::BuildFailed(_)));
        assert!(!source.index_path().exists());
    }

    #[test]
    fn policies_control_reuse() {
        let dir = TempDir::new().expect("tempdir");
        let data = testing::write_data_file(dir.path(), "a.grib2", &["1 0 0 0 100 0 0 500"]);
        let locator = LineLocator::default();
        let source = LeafSource::directory("policy", dir.path(), None);

        let err = build(&source, UpdatePolicy::Never, &locator).expect_err("never");
        assert!(matches!(err, CollectionError::IndexMissing(_)));

        assert!(build(&source, UpdatePolicy::Test, &locator).expect("build").rebuilt);
        assert!(!build(&source, UpdatePolicy::Test, &locator).expect("reuse").rebuilt);
        assert!(!build(&source, UpdatePolicy::Never, &locator).expect("reuse").rebuilt);

        fs::write(&data, "1 0 0 0 100 0 0 500\n1 0 0 0 100 0 6 500\n").expect("append");
        assert!(!build(&source, UpdatePolicy::Nocheck, &locator).expect("nocheck").rebuilt);
        let outcome = build(&source, UpdatePolicy::Test, &locator).expect("rebuild");
        assert!(outcome.rebuilt);
        let variable = outcome.collection.group(0).expect("group").variable(0).expect("variable");
        assert_eq!(variable.n_offsets(), 2);
        assert_eq!(locator.calls(&data), 2);
    }

    #[test]
    fn single_file_collection_is_named_after_the_file() {
        let dir = TempDir::new().expect("tempdir");
        let data = testing::write_data_file(dir.path(), "gfs 0p5.grib2", &["1 0 0 0 100 0 0 500"]);
        let locator = LineLocator::default();
        let source = LeafSource::single_file(&data);
        assert_eq!(source.index_path(), dir.path().join("gfs_0p5.grib2.ncx2"));

        let collection = build(&source, UpdatePolicy::Always, &locator).expect("build").collection;
        assert_eq!(collection.name(), "gfs 0p5.grib2");
        assert_eq!(collection.resolve_data_path(0).expect("path"), data);
        assert!(collection.find_file_by_name("gfs 0p5.grib2").is_some());
        assert!(collection.find_file_by_name("other.grib2").is_none());
        let handle = collection.data_file(0).expect("open data");
        assert_eq!(handle.read_at(0, 1).expect("read"), b"1");
    }

    #[test]
    fn missing_data_file_is_reported() {
        let dir = TempDir::new().expect("tempdir");
        let data = testing::write_data_file(dir.path(), "a.grib2", &["1 0 0 0 100 0 0 500"]);
        let locator = LineLocator::default();
        let source = LeafSource::directory("gone", dir.path(), None);
        let collection = build(&source, UpdatePolicy::Always, &locator).expect("build").collection;
        fs::remove_file(&data).expect("remove");
        let err = collection.resolve_data_path(0).expect_err("missing");
        assert!(matches!(err, CollectionError::DataFileNotFound(_)));
        assert_eq!(err.to_string(), format!("data file not found = {}", data.display()));
    }

    #[test]
    fn show_index_lists_groups_and_axes() {
        let dir = TempDir::new().expect("tempdir");
        testing::write_data_file(dir.path(), "a.grib2", &["1 0 0 0 100 0 0 500", "1 0 0 0 100 0 6 500"]);
        let locator = LineLocator::default();
        let source = LeafSource::directory("shown", dir.path(), None);
        let collection = build(&source, UpdatePolicy::Always, &locator).expect("build").collection;

        let mut text = String::new();
        collection.show_index(&mut text).expect("show");
        assert!(text.starts_with("collection shown"));
        assert!(text.contains("Group grid-1"));
        assert!(text.contains("time (2): 0, 6"));
        assert!(text.contains("0-0-0_L100"));
    }

    #[test]
    fn replacing_the_index_forces_a_rebuild() {
        let dir = TempDir::new().expect("tempdir");
        testing::write_data_file(dir.path(), "a.grib2", &["1 0 0 0 100 0 0 500"]);
        let locator = LineLocator::default();
        let source = LeafSource::directory("replaced", dir.path(), None);
        let collection = build(&source, UpdatePolicy::Test, &locator).expect("build").collection;

        let path = collection.make_new_index_file().expect("replace");
        assert_eq!(path, source.index_path());
        assert!(!path.exists());

        let outcome = build(&source, UpdatePolicy::Nocheck, &locator).expect("rebuild");
        assert!(outcome.rebuilt);
        assert!(path.exists());
        // the companion survived, so the data file was not read again
        assert_eq!(locator.total_calls(), 1);
        outcome.collection.close();
    }
}
