use std::fmt;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use fnv::FnvHashSet;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::coord::{Axis, Coordinate, EnsembleMember, TimeValue, VerticalLevel};
use crate::error::{CollectionError, Result};
use crate::file_handle::FileHandle;
use crate::scan::SourceFile;

use super::descriptor::{GroupDescriptor, VariableDescriptor};
use super::variable::{VariableDims, VariableIndex, VariableKey};

/// Horizontal grid shared by every variable of a group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridDefinition {
    /// Grid identity; records with equal hashes share a group.
    pub hash: u32,
    pub template: i32,
    pub name: String,
    pub nx: u32,
    pub ny: u32,
}

impl GridDefinition {
    /// Id a group takes unless another group of the collection already has it.
    pub fn base_id(&self) -> String {
        self.name.trim().replace(' ', "_")
    }

    pub fn description(&self) -> String {
        format!(
            "{} {}X{} (template {}, hash {:#010x})",
            self.name, self.ny, self.nx, self.template, self.hash
        )
    }
}

/// Group ids already handed out within one collection.
#[derive(Debug, Default)]
pub(crate) struct GroupNames {
    taken: Mutex<FnvHashSet<String>>,
}

impl GroupNames {
    /// Claims `base`, or the first free `base-N` with N starting at 2.
    pub fn assign(&self, base: &str) -> String {
        let mut taken = self.taken.lock();
        if taken.insert(base.to_string()) {
            return base.to_string();
        }
        let mut suffix = 2u32;
        loop {
            let candidate = format!("{base}-{suffix}");
            if taken.insert(candidate.clone()) {
                return candidate;
            }
            suffix += 1;
        }
    }
}

/// The axes a variable spans, borrowed from its group.
#[derive(Debug, Clone, Copy, Default)]
pub struct VariableAxes<'a> {
    pub runtime: Option<&'a Axis<DateTime<Utc>>>,
    /// Either a `Time` or a `TimeInterval` coordinate.
    pub time: Option<&'a Coordinate>,
    pub vertical: Option<&'a Axis<VerticalLevel>>,
    pub ensemble: Option<&'a Axis<EnsembleMember>>,
}

impl<'a> VariableAxes<'a> {
    fn resolve(coordinates: &'a [Coordinate], refs: &[u16]) -> Result<Self> {
        let mut axes = Self::default();
        for &index in refs {
            let coordinate = coordinates.get(index as usize).ok_or_else(|| {
                CollectionError::CorruptIndex(format!(
                    "coordinate reference {index} out of range ({} coordinates)",
                    coordinates.len()
                ))
            })?;
            let duplicate = match coordinate {
                Coordinate::Runtime(axis) => axes.runtime.replace(axis).is_some(),
                Coordinate::Time(_) | Coordinate::TimeInterval(_) => {
                    axes.time.replace(coordinate).is_some()
                }
                Coordinate::Vertical(axis) => axes.vertical.replace(axis).is_some(),
                Coordinate::Ensemble(axis) => axes.ensemble.replace(axis).is_some(),
            };
            if duplicate {
                return Err(CollectionError::CorruptIndex(format!(
                    "variable references two {} coordinates",
                    coordinate.kind().as_str()
                )));
            }
        }
        Ok(axes)
    }

    pub(crate) fn dims(&self) -> VariableDims {
        VariableDims {
            n_runtimes: self.runtime.map_or(0, Axis::len),
            n_offsets: self.time.map_or(0, Coordinate::len),
            n_ens: self.ensemble.map_or(0, Axis::len),
            n_vert: self.vertical.map_or(0, Axis::len),
        }
    }

    /// Position on the time dimension for a run time and forecast time.
    pub fn time_index(&self, runtime: &DateTime<Utc>, time: &TimeValue) -> Option<usize> {
        let run = match self.runtime {
            Some(axis) => axis.position(runtime)?,
            None => 0,
        };
        let offset = match (self.time, time) {
            (Some(Coordinate::Time(axis)), TimeValue::Offset(value)) => axis.position(value)?,
            (Some(Coordinate::TimeInterval(axis)), TimeValue::Interval(value)) => axis.position(value)?,
            (None, _) => 0,
            _ => return None,
        };
        Some(run * self.time.map_or(1, |coord| coord.len().max(1)) + offset)
    }
}

/// The records of a collection that share one horizontal grid.
#[derive(Debug)]
pub struct Group {
    grid: GridDefinition,
    filenos: Vec<u32>,
    coordinates: Vec<Coordinate>,
    variables: Vec<VariableIndex>,
    id: OnceLock<String>,
    names: Arc<GroupNames>,
}

impl Group {
    pub(crate) fn from_descriptor(
        descriptor: GroupDescriptor,
        names: Arc<GroupNames>,
        index_file: Option<Arc<FileHandle>>,
        n_files: usize,
    ) -> Result<Self> {
        let GroupDescriptor {
            grid,
            filenos,
            coordinates,
            variables,
        } = descriptor;

        if let Some(bad) = coordinates.iter().find(|coord| !coord.is_well_formed()) {
            return Err(CollectionError::CorruptIndex(format!(
                "group {} has an unordered {} axis",
                grid.base_id(),
                bad.kind().as_str()
            )));
        }
        if let Some(&fileno) = filenos.iter().find(|&&fileno| fileno as usize >= n_files) {
            return Err(CollectionError::CorruptIndex(format!(
                "group {} references file {fileno} of {n_files}",
                grid.base_id()
            )));
        }

        let variables = variables
            .into_iter()
            .map(|variable| {
                if variable.hash != variable.key.hash_code() {
                    return Err(CollectionError::CorruptIndex(format!(
                        "variable {} carries hash {:#x}",
                        variable.key, variable.hash
                    )));
                }
                let dims = VariableAxes::resolve(&coordinates, &variable.coords)?.dims();
                Ok(VariableIndex::from_descriptor(variable, dims, index_file.clone()))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            grid,
            filenos,
            coordinates,
            variables,
            id: OnceLock::new(),
            names,
        })
    }

    pub(crate) fn to_descriptor(&self, variables: Vec<VariableDescriptor>) -> GroupDescriptor {
        GroupDescriptor {
            grid: self.grid.clone(),
            filenos: self.filenos.clone(),
            coordinates: self.coordinates.clone(),
            variables,
        }
    }

    /// Collection-unique id, assigned on first access.
    pub fn id(&self) -> &str {
        self.id.get_or_init(|| self.names.assign(&self.grid.base_id()))
    }

    pub fn grid(&self) -> &GridDefinition {
        &self.grid
    }

    pub fn description(&self) -> String {
        self.grid.description()
    }

    pub fn filenos(&self) -> &[u32] {
        &self.filenos
    }

    pub fn coordinates(&self) -> &[Coordinate] {
        &self.coordinates
    }

    pub fn variables(&self) -> &[VariableIndex] {
        &self.variables
    }

    pub fn variable(&self, index: usize) -> Option<&VariableIndex> {
        self.variables.get(index)
    }

    pub fn find_variable(&self, key: &VariableKey) -> Option<&VariableIndex> {
        self.variables.iter().find(|variable| variable.key() == key)
    }

    pub fn find_variable_by_hash(&self, hash: u32) -> Option<&VariableIndex> {
        self.variables.iter().find(|variable| variable.hash() == hash)
    }

    /// Axes of `variable`, which must belong to this group.
    pub fn variable_axes(&self, variable: &VariableIndex) -> VariableAxes<'_> {
        VariableAxes::resolve(&self.coordinates, variable.coords()).unwrap_or_default()
    }

    /// Sorted names of the files contributing to this group.
    pub fn file_names(&self, files: &[SourceFile]) -> Vec<String> {
        let mut names: Vec<String> = self
            .filenos
            .iter()
            .filter_map(|&fileno| files.get(fileno as usize))
            .map(SourceFile::name)
            .collect();
        names.sort();
        names
    }

    /// First and last run time of the group's longest runtime axis.
    pub fn run_time_coverage(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        self.coordinates
            .iter()
            .filter_map(|coord| match coord {
                Coordinate::Runtime(axis) => Some(axis),
                _ => None,
            })
            .max_by_key(|axis| axis.len())
            .and_then(|axis| Some((*axis.first()?, *axis.last()?)))
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Group {} ({})", self.id(), self.description())?;
        writeln!(f, "  files: {:?}", self.filenos)?;
        for (index, coordinate) in self.coordinates.iter().enumerate() {
            writeln!(f, "  coord[{index}] {coordinate}")?;
        }
        for variable in &self.variables {
            writeln!(f, "  var {variable}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::coord::TimeInterval;

    fn grid(name: &str, hash: u32) -> GridDefinition {
        GridDefinition {
            hash,
            template: 0,
            name: name.to_string(),
            nx: 360,
            ny: 181,
        }
    }

    fn group(grid: GridDefinition, names: &Arc<GroupNames>) -> Group {
        let runtime = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let key = VariableKey::new(0, 0, 0, 100);
        let descriptor = GroupDescriptor {
            grid,
            filenos: vec![0],
            coordinates: vec![
                Coordinate::Runtime(Axis::from_values([runtime])),
                Coordinate::Time(Axis::from_values([0, 6, 12])),
                Coordinate::Vertical(Axis::from_values([VerticalLevel::new(500.0)])),
            ],
            variables: vec![VariableDescriptor {
                hash: key.hash_code(),
                key,
                coords: vec![0, 1, 2],
                records_pos: 0,
                records_len: 0,
                partition_children: Vec::new(),
            }],
        };
        Group::from_descriptor(descriptor, names.clone(), None, 1).expect("group")
    }

    #[test]
    fn colliding_ids_get_numbered_suffixes() {
        let names = Arc::new(GroupNames::default());
        let first = group(grid("grid-A", 1), &names);
        let second = group(grid("grid-A", 2), &names);
        let third = group(grid("grid-A", 3), &names);
        assert_eq!(first.id(), "grid-A");
        assert_eq!(second.id(), "grid-A-2");
        assert_eq!(third.id(), "grid-A-3");
        assert_eq!(first.id(), "grid-A");
    }

    #[test]
    fn ids_follow_first_access_order() {
        let names = Arc::new(GroupNames::default());
        let first = group(grid("grid-A", 1), &names);
        let second = group(grid("grid-A", 2), &names);
        assert_eq!(second.id(), "grid-A");
        assert_eq!(first.id(), "grid-A-2");
    }

    #[test]
    fn variable_dims_follow_referenced_axes() {
        let names = Arc::new(GroupNames::default());
        let group = group(grid("g", 1), &names);
        let variable = group.variable(0).expect("variable");
        assert_eq!(variable.n_times(), 3);
        assert_eq!(variable.n_vert(), 1);
        assert_eq!(variable.n_ens(), 0);
        assert_eq!(variable.table_size(), 3);

        let axes = group.variable_axes(variable);
        let runtime = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(axes.time_index(&runtime, &TimeValue::Offset(12)), Some(2));
        assert_eq!(axes.time_index(&runtime, &TimeValue::Offset(3)), None);
        assert_eq!(
            axes.time_index(&runtime, &TimeValue::Interval(TimeInterval::new(0, 6))),
            None
        );
        assert_eq!(group.run_time_coverage(), Some((runtime, runtime)));
    }

    #[test]
    fn bad_coordinate_reference_is_corruption() {
        let key = VariableKey::new(0, 0, 0, 100);
        let descriptor = GroupDescriptor {
            grid: grid("g", 1),
            filenos: vec![0],
            coordinates: vec![Coordinate::Time(Axis::from_values([0]))],
            variables: vec![VariableDescriptor {
                hash: key.hash_code(),
                key,
                coords: vec![0, 4],
                records_pos: 0,
                records_len: 0,
                partition_children: Vec::new(),
            }],
        };
        let err = Group::from_descriptor(descriptor, Arc::default(), None, 1).expect_err("bad ref");
        assert!(err.requires_rebuild());
    }
}
