//! Building partitions: collections of collections.
//!
//! Children are opened (or built) depth-first, one at a time, before the
//! partition itself. The partition's axes are the union of its children's,
//! and every child record is moved to its position on those axes.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use fnv::FnvHashMap;

use crate::codec;
use crate::config::{CollectionConfig, PartitionKind, UpdatePolicy};
use crate::coord::{remap_index, remap_position, split_linear_index, Axis, AxisDiffers, Coordinate};
use crate::error::{CollectionError, Result};
use crate::index_location;
use crate::locator::RecordLocator;
use crate::model::{
    ChildRef, ChildVariable, Collection, CollectionDescriptor, GridDefinition, Group, GroupDescriptor,
    PartitionDescriptor, Record, RecordTables, VariableAxes, VariableDescriptor, VariableIndex,
    VariableKey,
};
use crate::scan::{DirectoryScan, SourceFile};

use super::collection::{build_leaf, intern, LeafSource};
use super::policy::{self, Decision};
use super::BuildOutcome;

/// A partition to open or build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSource {
    pub name: String,
    pub root: PathBuf,
    pub kind: PartitionKind,
    /// Data file filter applied inside every child.
    pub pattern: Option<String>,
}

impl PartitionSource {
    pub fn new(name: impl Into<String>, root: &Path, kind: PartitionKind) -> Self {
        Self {
            name: name.into(),
            root: root.to_path_buf(),
            kind,
            pattern: None,
        }
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    /// Partition described by `config`, whose `partition` kind must be set.
    pub fn from_config(config: &CollectionConfig) -> Result<Self> {
        let kind = config.partition.ok_or_else(|| {
            CollectionError::InvalidInput(format!("collection {} is not a partition", config.name))
        })?;
        Ok(Self {
            name: config.name.clone(),
            root: config.spec.root().to_path_buf(),
            kind,
            pattern: config.spec.pattern().map(str::to_string),
        })
    }

    pub fn index_path(&self) -> PathBuf {
        index_location::index_path(&self.root, &self.name)
    }
}

/// Opens the partition index of `source`, building children and the
/// partition as `update` and `child_update` require.
pub fn build_partition(
    source: &PartitionSource,
    update: UpdatePolicy,
    child_update: UpdatePolicy,
    aux: &serde_json::Value,
    locator: &dyn RecordLocator,
) -> Result<BuildOutcome> {
    let started = Instant::now();
    let children = build_children(source, child_update, aux, locator)?;
    if children.is_empty() {
        return Err(CollectionError::BuildFailed(format!(
            "partition {} has no usable children in {}",
            source.name,
            source.root.display()
        )));
    }

    let child_files = children
        .iter()
        .map(|child| {
            let path = child.index_path().ok_or_else(|| {
                CollectionError::Internal(format!("child {} has no index file", child.name()))
            })?;
            SourceFile::from_path(path)
        })
        .collect::<Result<Vec<_>>>()?;

    let index_path = source.index_path();
    let decision = policy::decide(update, &index_path, |existing| {
        Ok(policy::same_sources(existing.files(), &child_files)
            && policy::index_is_newer(&index_path, &child_files))
    })?;
    if let Decision::Reuse(collection) = decision {
        return Ok(BuildOutcome {
            collection,
            rebuilt: false,
        });
    }

    let (descriptor, tables) = merge_children(&source.name, &source.root, &children, child_files)?;
    drop(children);
    codec::write_index_file(&index_path, descriptor, &tables)?;
    let collection = codec::open_collection(&index_path)?.ok_or_else(|| {
        CollectionError::Internal(format!("index {} unreadable after write", index_path.display()))
    })?;

    log::info!(
        "built partition {} ({} children, {} groups) in {} ms",
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

fn build_children(
    source: &PartitionSource,
    child_update: UpdatePolicy,
    aux: &serde_json::Value,
    locator: &dyn RecordLocator,
) -> Result<Vec<Collection>> {
    let mut children = Vec::new();
    match source.kind {
        PartitionKind::Directory => {
            for dir in DirectoryScan::new(&source.root).subdirectories()? {
                let name = index_location::child_collection_name(&source.name, &dir);
                match build_directory_child(source, name, &dir, child_update, aux, locator) {
                    Ok(outcome) => children.push(outcome.collection),
                    Err(error) => log::warn!("skipping partition child {}: {error}", dir.display()),
                }
            }
        }
        PartitionKind::File => {
            let scan = match &source.pattern {
                Some(pattern) => DirectoryScan::with_pattern(&source.root, pattern),
                None => DirectoryScan::new(&source.root),
            };
            // children write index files into the scanned directory
            let files: Vec<Result<SourceFile>> = scan.files()?.collect();
            for file in files {
                let outcome = file.and_then(|file| {
                    build_leaf(
                        &LeafSource::single_file(&file.path),
                        child_update,
                        child_update,
                        aux,
                        locator,
                    )
                });
                match outcome {
                    Ok(outcome) => children.push(outcome.collection),
                    Err(error) => log::warn!("skipping partition child in {}: {error}", source.root.display()),
                }
            }
        }
    }
    Ok(children)
}

/// A subdirectory with subdirectories of its own is a nested partition.
fn build_directory_child(
    parent: &PartitionSource,
    name: String,
    dir: &Path,
    child_update: UpdatePolicy,
    aux: &serde_json::Value,
    locator: &dyn RecordLocator,
) -> Result<BuildOutcome> {
    if DirectoryScan::new(dir).has_subdirectories()? {
        let nested = PartitionSource {
            name,
            root: dir.to_path_buf(),
            kind: PartitionKind::Directory,
            pattern: parent.pattern.clone(),
        };
        build_partition(&nested, child_update, child_update, aux, locator)
    } else {
        let leaf = LeafSource::directory(name, dir, parent.pattern.as_deref());
        build_leaf(&leaf, child_update, child_update, aux, locator)
    }
}

struct Contribution<'a> {
    child: usize,
    group: &'a Group,
    variable: &'a VariableIndex,
}

#[derive(Default)]
struct PartitionGroup<'a> {
    children: BTreeSet<u32>,
    variables: BTreeMap<VariableKey, Vec<Contribution<'a>>>,
}

pub(crate) fn merge_children(
    name: &str,
    root: &Path,
    children: &[Collection],
    child_files: Vec<SourceFile>,
) -> Result<(CollectionDescriptor, RecordTables)> {
    let mut data_files = Vec::new();
    let mut bases = Vec::with_capacity(children.len());
    for child in children {
        bases.push(u32::try_from(data_files.len()).map_err(|_| {
            CollectionError::BuildFailed(format!("partition {name} has too many data files"))
        })?);
        data_files.extend(child.data_files().iter().cloned());
    }

    let mut order: FnvHashMap<u32, usize> = FnvHashMap::default();
    let mut grids: Vec<GridDefinition> = Vec::new();
    let mut groups: Vec<PartitionGroup<'_>> = Vec::new();
    for (child_idx, child) in children.iter().enumerate() {
        for group in child.groups() {
            let index = *order.entry(group.grid().hash).or_insert_with(|| {
                grids.push(group.grid().clone());
                groups.push(PartitionGroup::default());
                groups.len() - 1
            });
            let merged = &mut groups[index];
            merged.children.insert(child_idx as u32);
            for variable in group.variables() {
                merged
                    .variables
                    .entry(variable.key().clone())
                    .or_default()
                    .push(Contribution {
                        child: child_idx,
                        group,
                        variable,
                    });
            }
        }
    }

    let mut group_descriptors = Vec::with_capacity(groups.len());
    let mut tables = Vec::with_capacity(groups.len());
    for (grid, group) in grids.into_iter().zip(groups) {
        let mut coordinates = Vec::new();
        let mut variables = Vec::with_capacity(group.variables.len());
        let mut group_tables = Vec::with_capacity(group.variables.len());
        for (key, contributions) in group.variables {
            let merged = merge_variable(&key, &contributions, &bases, &mut coordinates)?;
            variables.push(VariableDescriptor {
                hash: key.hash_code(),
                key,
                coords: merged.coords,
                records_pos: 0,
                records_len: 0,
                partition_children: merged.children,
            });
            group_tables.push(Arc::from(merged.table));
        }
        group_descriptors.push(GroupDescriptor {
            grid,
            filenos: group.children.into_iter().collect(),
            coordinates,
            variables,
        });
        tables.push(group_tables);
    }

    let descriptor = CollectionDescriptor {
        name: name.to_string(),
        directory: root.to_path_buf(),
        producer: children.first().map(|child| *child.producer()).unwrap_or_default(),
        files: child_files,
        skipped: Vec::new(),
        groups: group_descriptors,
        partition: Some(PartitionDescriptor {
            children: children
                .iter()
                .map(|child| ChildRef {
                    name: child.name().to_string(),
                    directory: child.directory().to_path_buf(),
                })
                .collect(),
            data_files,
        }),
    };
    Ok((descriptor, tables))
}

struct MergedVariable {
    coords: Vec<u16>,
    children: Vec<ChildVariable>,
    table: Vec<Option<Record>>,
}

fn same_time_kind(a: Option<&Coordinate>, b: Option<&Coordinate>) -> bool {
    a.map(Coordinate::kind) == b.map(Coordinate::kind)
}

fn union_axis<'a, T: Ord + Clone + 'a>(axes: impl Iterator<Item = Option<&'a Axis<T>>>) -> Option<Axis<T>> {
    let present: Vec<&Axis<T>> = axes.flatten().collect();
    (!present.is_empty()).then(|| Axis::union(present))
}

fn union_time<'a>(coords: impl Iterator<Item = Option<&'a Coordinate>>) -> Option<Coordinate> {
    let present: Vec<&Coordinate> = coords.flatten().collect();
    match present.first()? {
        Coordinate::Time(_) => Some(Coordinate::Time(Axis::union(present.iter().copied().filter_map(
            |coord| match coord {
                Coordinate::Time(axis) => Some(axis),
                _ => None,
            },
        )))),
        Coordinate::TimeInterval(_) => Some(Coordinate::TimeInterval(Axis::union(
            present.iter().copied().filter_map(|coord| match coord {
                Coordinate::TimeInterval(axis) => Some(axis),
                _ => None,
            }),
        ))),
        _ => None,
    }
}

fn remap_optional<T: PartialEq>(index: usize, from: Option<&Axis<T>>, to: Option<&Axis<T>>) -> Option<usize> {
    match (from, to) {
        (Some(from), Some(to)) => remap_position(index, from, to),
        (None, None) => Some(index),
        _ => None,
    }
}

fn remap_time(index: usize, from: Option<&Coordinate>, to: Option<&Coordinate>) -> Option<usize> {
    match (from, to) {
        (Some(Coordinate::Time(from)), Some(Coordinate::Time(to))) => remap_position(index, from, to),
        (Some(Coordinate::TimeInterval(from)), Some(Coordinate::TimeInterval(to))) => {
            remap_position(index, from, to)
        }
        (None, None) => Some(index),
        _ => None,
    }
}

fn merge_variable(
    key: &VariableKey,
    contributions: &[Contribution<'_>],
    bases: &[u32],
    coordinates: &mut Vec<Coordinate>,
) -> Result<MergedVariable> {
    let mut usable: Vec<(&Contribution<'_>, VariableAxes<'_>)> = contributions
        .iter()
        .map(|contribution| (contribution, contribution.group.variable_axes(contribution.variable)))
        .collect();
    if let Some(first_time) = usable.first().map(|(_, axes)| axes.time) {
        usable.retain(|(contribution, axes)| {
            let keep = same_time_kind(axes.time, first_time);
            if !keep {
                log::warn!(
                    "{key}: child {} uses a different time axis kind, skipped",
                    contribution.child
                );
            }
            keep
        });
    }

    let runtime = union_axis(usable.iter().map(|(_, axes)| axes.runtime));
    let time = union_time(usable.iter().map(|(_, axes)| axes.time));
    let vertical = union_axis(usable.iter().map(|(_, axes)| axes.vertical));
    let ensemble = union_axis(usable.iter().map(|(_, axes)| axes.ensemble));

    let canonical = VariableAxes {
        runtime: runtime.as_ref(),
        time: time.as_ref(),
        vertical: vertical.as_ref(),
        ensemble: ensemble.as_ref(),
    };
    let dims = canonical.dims();
    let mut table: Vec<Option<Record>> = vec![None; dims.table_size()];
    let mut children = Vec::with_capacity(usable.len());

    for (contribution, axes) in &usable {
        let mut differs = AxisDiffers::empty();
        if axes.ensemble != canonical.ensemble {
            differs |= AxisDiffers::ENSEMBLE;
        }
        if axes.vertical != canonical.vertical {
            differs |= AxisDiffers::VERTICAL;
        }

        let records = match contribution.variable.records() {
            Ok(records) => records,
            Err(error) => {
                log::warn!("{key}: records of child {} unreadable: {error}", contribution.child);
                continue;
            }
        };
        let child_dims = axes.dims();
        let n_offsets = child_dims.n_offsets.max(1);
        let base = bases[contribution.child];
        let mut dropped = 0usize;

        for (index, record) in records.iter().enumerate() {
            let Some(record) = record else {
                continue;
            };
            let local = split_linear_index(index, child_dims.n_ens, child_dims.n_vert);
            let placed = remap_optional(local.time / n_offsets, axes.runtime, canonical.runtime)
                .zip(remap_time(local.time % n_offsets, axes.time, canonical.time))
                .and_then(|(run, offset)| {
                    let time = run * dims.n_offsets.max(1) + offset;
                    remap_index(
                        time,
                        local.ens,
                        local.vert,
                        differs,
                        axes.ensemble,
                        axes.vertical,
                        canonical.ensemble,
                        canonical.vertical,
                    )
                });
            match placed {
                Some(slot) => {
                    table[slot] = Some(Record {
                        fileno: base + record.fileno,
                        ..*record
                    });
                }
                None => dropped += 1,
            }
        }
        if dropped > 0 {
            log::debug!("{key}: {dropped} records of child {} have no partition position", contribution.child);
        }
        children.push(ChildVariable {
            child: contribution.child as u32,
            differs,
        });
    }

    let mut coords = Vec::with_capacity(4);
    if let Some(runtime) = runtime {
        coords.push(intern(coordinates, Coordinate::Runtime(runtime))?);
    }
    if let Some(time) = time {
        coords.push(intern(coordinates, time)?);
    }
    if let Some(vertical) = vertical {
        coords.push(intern(coordinates, Coordinate::Vertical(vertical))?);
    }
    if let Some(ensemble) = ensemble {
        coords.push(intern(coordinates, Coordinate::Ensemble(ensemble))?);
    }
    Ok(MergedVariable {
        coords,
        children,
        table,
    })
}
