//! Linear record-table addressing and partition remapping.
//!
//! Canonical order is (time, ensemble, vertical): vertical varies fastest,
//! time slowest. An absent axis contributes a factor of one.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use super::axis::{Axis, EnsembleMember, VerticalLevel};

bitflags! {
    /// Which of a partition child's axes differ from the partition's canonical axes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct AxisDiffers: u8 {
        const ENSEMBLE = 0b0000_0001;
        const VERTICAL = 0b0000_0010;
    }
}

/// Position of a record along the three table dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoordIndex {
    pub time: usize,
    pub ens: usize,
    pub vert: usize,
}

/// Computes the linear record index for a (time, ensemble, vertical) position.
#[inline]
pub fn linear_index(time_idx: usize, ens_idx: usize, vert_idx: usize, n_ens: usize, n_vert: usize) -> usize {
    let n_ens = n_ens.max(1);
    let n_vert = n_vert.max(1);
    vert_idx + ens_idx * n_vert + time_idx * n_vert * n_ens
}

/// Inverse of [`linear_index`].
#[inline]
pub fn split_linear_index(index: usize, n_ens: usize, n_vert: usize) -> CoordIndex {
    let n_ens = n_ens.max(1);
    let n_vert = n_vert.max(1);
    CoordIndex {
        time: index / (n_vert * n_ens),
        ens: (index / n_vert) % n_ens,
        vert: index % n_vert,
    }
}

/// Maps position `index` on `from` to the position of an equal value on `to`.
///
/// Returns `None` when `index` is out of range or no equal value exists.
pub fn remap_position<T: PartialEq>(index: usize, from: &Axis<T>, to: &Axis<T>) -> Option<usize> {
    let want = from.get(index)?;
    to.position(want)
}

/// Computes a partition-wide linear index from a child's local position.
///
/// `time_idx` must already be expressed on the partition's time dimension.
/// Ensemble and vertical positions are taken through a value search only when
/// the corresponding flag in `differs` is set; otherwise they pass through
/// unchanged. Returns `None` when the child's coordinate value is absent from
/// the canonical axis, meaning the child has no record at that coordinate in
/// the partition's frame.
#[allow(clippy::too_many_arguments)]
pub fn remap_index(
    time_idx: usize,
    ens_idx: usize,
    vert_idx: usize,
    differs: AxisDiffers,
    child_ens: Option<&Axis<EnsembleMember>>,
    child_vert: Option<&Axis<VerticalLevel>>,
    canonical_ens: Option<&Axis<EnsembleMember>>,
    canonical_vert: Option<&Axis<VerticalLevel>>,
) -> Option<usize> {
    let want_ens = if differs.contains(AxisDiffers::ENSEMBLE) {
        remap_position(ens_idx, child_ens?, canonical_ens?)?
    } else {
        ens_idx
    };
    let want_vert = if differs.contains(AxisDiffers::VERTICAL) {
        remap_position(vert_idx, child_vert?, canonical_vert?)?
    } else {
        vert_idx
    };
    Some(linear_index(
        time_idx,
        want_ens,
        want_vert,
        canonical_ens.map_or(0, Axis::len),
        canonical_vert.map_or(0, Axis::len),
    ))
}
