use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};

use crate::codec::IndexKind;
use crate::coord::CoordIndex;
use crate::error::{CollectionError, Result};
use crate::handle_cache::{self, PooledHandle};
use crate::index_location;
use crate::scan::SourceFile;

use super::descriptor::{CollectionDescriptor, PartitionDescriptor, RecordTables};
use super::group::{Group, GroupNames};
use super::record::DataLocation;
use super::variable::VariableIndex;

/// Originating center and generating process of the indexed data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Producer {
    pub center: i32,
    pub subcenter: i32,
    pub master_table: i32,
    pub local_table: i32,
    pub gen_process_type: i32,
    pub gen_process_id: i32,
    pub back_process_id: i32,
}

/// A partition child: a collection with its own index file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChildRef {
    pub name: String,
    pub directory: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionKind {
    /// Indexes data files directly.
    Leaf,
    /// Indexes child collections. Record file numbers address `data_files`.
    Partition {
        children: Vec<ChildRef>,
        data_files: Vec<SourceFile>,
    },
}

/// An opened collection index.
///
/// The collection keeps its index file open so variables can load their
/// record tables on demand; the handle goes back to the pool on drop.
#[derive(Debug)]
pub struct Collection {
    name: String,
    directory: PathBuf,
    kind: CollectionKind,
    version: u32,
    producer: Producer,
    files: Vec<SourceFile>,
    skipped: Vec<SourceFile>,
    groups: Vec<Group>,
    index_path: Option<PathBuf>,
    index_file: Option<PooledHandle>,
    file_map: OnceLock<FnvHashMap<String, usize>>,
}

impl Collection {
    pub(crate) fn from_descriptor(
        descriptor: CollectionDescriptor,
        index_kind: IndexKind,
        version: u32,
        index_file: Option<PooledHandle>,
    ) -> Result<Self> {
        let CollectionDescriptor {
            name,
            directory,
            producer,
            files,
            skipped,
            groups,
            partition,
        } = descriptor;

        let kind = match (index_kind, partition) {
            (IndexKind::Leaf, None) => CollectionKind::Leaf,
            (IndexKind::Partition, Some(partition)) => CollectionKind::Partition {
                children: partition.children,
                data_files: partition.data_files,
            },
            (kind, partition) => {
                return Err(CollectionError::CorruptIndex(format!(
                    "{kind:?} index of {name} {} partition metadata",
                    if partition.is_some() { "carries" } else { "lacks" }
                )));
            }
        };
        if let CollectionKind::Partition { children, .. } = &kind {
            if children.len() != files.len() {
                return Err(CollectionError::CorruptIndex(format!(
                    "partition {name} lists {} children but {} index files",
                    children.len(),
                    files.len()
                )));
            }
        }

        let shared = index_file.as_ref().map(PooledHandle::shared);
        let names = Arc::new(GroupNames::default());
        let groups = groups
            .into_iter()
            .map(|group| Group::from_descriptor(group, names.clone(), shared.clone(), files.len()))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            name,
            directory,
            kind,
            version,
            producer,
            files,
            skipped,
            groups,
            index_path: index_file.as_ref().map(|handle| handle.path().to_path_buf()),
            index_file,
            file_map: OnceLock::new(),
        })
    }

    /// Descriptor and record tables for writing this collection back out.
    ///
    /// Loads every variable's record table.
    pub fn to_index_contents(&self) -> Result<(CollectionDescriptor, RecordTables)> {
        let mut groups = Vec::with_capacity(self.groups.len());
        let mut tables = Vec::with_capacity(self.groups.len());
        for group in &self.groups {
            let mut variables = Vec::with_capacity(group.variables().len());
            let mut group_tables = Vec::with_capacity(group.variables().len());
            for variable in group.variables() {
                group_tables.push(variable.records()?);
                variables.push(variable.to_descriptor(0, 0));
            }
            groups.push(group.to_descriptor(variables));
            tables.push(group_tables);
        }

        let partition = match &self.kind {
            CollectionKind::Leaf => None,
            CollectionKind::Partition {
                children,
                data_files,
            } => Some(PartitionDescriptor {
                children: children.clone(),
                data_files: data_files.clone(),
            }),
        };

        let descriptor = CollectionDescriptor {
            name: self.name.clone(),
            directory: self.directory.clone(),
            producer: self.producer,
            files: self.files.clone(),
            skipped: self.skipped.clone(),
            groups,
            partition,
        };
        Ok((descriptor, tables))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn kind(&self) -> &CollectionKind {
        &self.kind
    }

    pub fn is_partition(&self) -> bool {
        matches!(self.kind, CollectionKind::Partition { .. })
    }

    /// Format version of the index this collection was read from.
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn producer(&self) -> &Producer {
        &self.producer
    }

    /// Data files of a leaf, child index files of a partition.
    pub fn files(&self) -> &[SourceFile] {
        &self.files
    }

    /// Data files left out of the last build because they could not be read.
    pub fn skipped(&self) -> &[SourceFile] {
        &self.skipped
    }

    /// The files record file numbers refer to.
    pub fn data_files(&self) -> &[SourceFile] {
        match &self.kind {
            CollectionKind::Leaf => &self.files,
            CollectionKind::Partition { data_files, .. } => data_files,
        }
    }

    pub fn children(&self) -> &[ChildRef] {
        match &self.kind {
            CollectionKind::Leaf => &[],
            CollectionKind::Partition { children, .. } => children,
        }
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn group(&self, index: usize) -> Option<&Group> {
        self.groups.get(index)
    }

    pub fn index_path(&self) -> Option<&Path> {
        self.index_path.as_deref()
    }

    pub fn index_file(&self) -> Option<&PooledHandle> {
        self.index_file.as_ref()
    }

    pub fn find_group_by_id(&self, id: &str) -> Option<&Group> {
        self.groups.iter().find(|group| group.id() == id)
    }

    pub fn find_group_index_by_id(&self, id: &str) -> Option<usize> {
        self.groups.iter().position(|group| group.id() == id)
    }

    /// Looks up a file by its name; the name map is built on first use.
    pub fn find_file_by_name(&self, name: &str) -> Option<&SourceFile> {
        let map = self.file_map.get_or_init(|| {
            self.files
                .iter()
                .enumerate()
                .map(|(index, file)| (file.name(), index))
                .collect()
        });
        map.get(name).and_then(|&index| self.files.get(index))
    }

    /// Sorted file names.
    pub fn file_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.files.iter().map(SourceFile::name).collect();
        names.sort();
        names
    }

    /// Path of data file `fileno`, checking fallback locations when the
    /// recorded path no longer exists.
    pub fn resolve_data_path(&self, fileno: u32) -> Result<PathBuf> {
        let data_files = self.data_files();
        let file = data_files.get(fileno as usize).ok_or_else(|| {
            CollectionError::InvalidInput(format!(
                "file number {fileno} out of range for {} ({} files)",
                self.name,
                data_files.len()
            ))
        })?;

        let mut candidates = vec![file.path.clone()];
        let file_name = file.path.file_name();
        if let Some(file_name) = file_name {
            if let Some(index_dir) = self.index_path.as_deref().and_then(Path::parent) {
                candidates.push(index_dir.join(file_name));
            }
            candidates.push(self.directory.join(file_name));
        }
        if data_files.len() == 1 {
            candidates.push(self.directory.join(&self.name));
        }

        candidates
            .into_iter()
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| CollectionError::DataFileNotFound(file.path.clone()))
    }

    /// Opens data file `fileno` through the handle cache.
    pub fn data_file(&self, fileno: u32) -> Result<PooledHandle> {
        let path = self.resolve_data_path(fileno)?;
        handle_cache::acquire_file(&path)
    }

    /// Data file and offsets of the record of `variable` at `index`.
    ///
    /// `Ok(None)` means the coordinate exists but has no record.
    pub fn locate(&self, variable: &VariableIndex, index: CoordIndex) -> Result<Option<DataLocation>> {
        let Some(record) = variable.record(index.time, index.ens, index.vert)? else {
            return Ok(None);
        };
        let path = self.resolve_data_path(record.fileno)?;
        Ok(Some(DataLocation {
            path,
            pos: record.pos,
            bms_pos: record.bms_pos,
        }))
    }

    /// Closes the index and deletes it so a rebuild can write a replacement.
    ///
    /// Returns the path the replacement should be written to.
    pub fn make_new_index_file(self) -> Result<PathBuf> {
        let path = match &self.index_path {
            Some(path) => path.clone(),
            None => index_location::index_path(&self.directory, &self.name),
        };
        drop(self);
        match fs::remove_file(&path) {
            Ok(()) => log::debug!("removed stale index {}", path.display()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => return Err(error.into()),
        }
        Ok(path)
    }

    /// Releases the index file handle.
    pub fn close(self) {}

    /// Writes files, groups, variables and axes.
    pub fn show_index(&self, out: &mut impl fmt::Write) -> fmt::Result {
        writeln!(out, "{self}")?;
        writeln!(out, "producer: {:?}", self.producer)?;
        for (fileno, file) in self.files.iter().enumerate() {
            writeln!(
                out,
                "  file[{fileno}] {} size={} modified={}",
                file.path.display(),
                file.size,
                file.last_modified
            )?;
        }
        for file in &self.skipped {
            writeln!(out, "  skipped {} size={}", file.path.display(), file.size)?;
        }
        if let CollectionKind::Partition {
            children,
            data_files,
        } = &self.kind
        {
            for (index, child) in children.iter().enumerate() {
                writeln!(out, "  child[{index}] {} in {}", child.name, child.directory.display())?;
            }
            writeln!(out, "  data files: {}", data_files.len())?;
        }
        for group in &self.groups {
            write!(out, "{group}")?;
        }
        Ok(())
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} in {} (version {}, {} files, {} groups)",
            if self.is_partition() { "partition" } else { "collection" },
            self.name,
            self.directory.display(),
            self.version,
            self.files.len(),
            self.groups.len()
        )
    }
}
