//! In-memory collection model.
//!
//! A `Collection` owns its source file list and one `Group` per horizontal
//! grid. Each group owns its coordinate axes and `VariableIndex` entries, and
//! each variable lazily loads its record table from the open index file.
//!
//! The serialized shape of all of this lives in `descriptor`; the model types
//! are built from descriptors when an index is read.

mod collection;
mod descriptor;
mod group;
mod record;
mod variable;

pub use collection::{ChildRef, Collection, CollectionKind, Producer};
pub use descriptor::{
    CollectionDescriptor, GroupDescriptor, PartitionDescriptor, RecordTables, VariableDescriptor,
};
pub use group::{GridDefinition, Group, VariableAxes};
pub use record::{DataLocation, Record, RecordTable};
pub use variable::{ChildVariable, VariableIndex, VariableKey};

pub(crate) use group::GroupNames;
