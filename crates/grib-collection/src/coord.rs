//! Coordinate systems and index arithmetic.
//!
//! A group's variables are laid out over up to five kinds of axis:
//! - run time (reference time of a model cycle)
//! - forecast time, either an offset or an interval
//! - vertical level
//! - ensemble member
//!
//! Records for a variable live in a single dense table addressed by one
//! linear index; `index` owns that arithmetic and the partition remapping.

mod axis;
mod index;

pub use axis::{
    Axis, Coordinate, CoordinateKind, EnsembleMember, TimeInterval, TimeValue, VerticalLevel,
};
pub use index::{
    linear_index, remap_index, remap_position, split_linear_index, AxisDiffers, CoordIndex,
};
