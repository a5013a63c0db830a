//! Coordinate axis values and the generic ordered axis.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of a coordinate axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinateKind {
    Runtime,
    Time,
    TimeInterval,
    Vertical,
    Ensemble,
}

impl CoordinateKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Runtime => "runtime",
            Self::Time => "time",
            Self::TimeInterval => "timeIntv",
            Self::Vertical => "vert",
            Self::Ensemble => "ens",
        }
    }
}

/// A forecast interval `[start, end]` in the collection's time unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeInterval {
    pub start: i32,
    pub end: i32,
}

impl TimeInterval {
    pub fn new(start: i32, end: i32) -> Self {
        Self { start, end }
    }
}

impl fmt::Display for TimeInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.start, self.end)
    }
}

/// Forecast time of a single record: an offset from the run time or an interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeValue {
    Offset(i32),
    Interval(TimeInterval),
}

/// A vertical level; layers carry a second bound.
///
/// Ordering and equality use `f64::total_cmp`, so `-0.0` and `0.0` are
/// distinct levels and NaN compares equal to itself.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VerticalLevel {
    pub value1: f64,
    pub value2: Option<f64>,
}

impl VerticalLevel {
    pub fn new(value: f64) -> Self {
        Self {
            value1: value,
            value2: None,
        }
    }

    pub fn layer(value1: f64, value2: f64) -> Self {
        Self {
            value1,
            value2: Some(value2),
        }
    }

    pub fn is_layer(&self) -> bool {
        self.value2.is_some()
    }
}

impl Ord for VerticalLevel {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value1
            .total_cmp(&other.value1)
            .then_with(|| match (self.value2, other.value2) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(a), Some(b)) => a.total_cmp(&b),
            })
    }
}

impl PartialOrd for VerticalLevel {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for VerticalLevel {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for VerticalLevel {}

impl fmt::Display for VerticalLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value2 {
            Some(value2) => write!(f, "({},{})", self.value1, value2),
            None => write!(f, "{}", self.value1),
        }
    }
}

/// An ensemble member: the ensemble forecast type and the member number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EnsembleMember {
    pub code: i32,
    pub member: i32,
}

impl EnsembleMember {
    pub fn new(code: i32, member: i32) -> Self {
        Self { code, member }
    }
}

impl fmt::Display for EnsembleMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.code, self.member)
    }
}

/// An ordered sequence of distinct values.
///
/// The length of the axis is the cardinality used in index arithmetic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Axis<T> {
    values: Vec<T>,
}

impl<T> Default for Axis<T> {
    fn default() -> Self {
        Self { values: Vec::new() }
    }
}

impl<T: Ord + Clone> Axis<T> {
    /// Builds an axis from arbitrary values, sorting by natural order and dropping duplicates.
    pub fn from_values<I: IntoIterator<Item = T>>(values: I) -> Self {
        let mut values: Vec<T> = values.into_iter().collect();
        values.sort();
        values.dedup();
        Self { values }
    }

    /// Union of several axes, de-duplicated and naturally ordered.
    pub fn union<'a, I>(axes: I) -> Self
    where
        I: IntoIterator<Item = &'a Axis<T>>,
        T: 'a,
    {
        Self::from_values(axes.into_iter().flat_map(|axis| axis.values.iter().cloned()))
    }

    /// Returns true if the values are strictly increasing (sorted and unique).
    pub fn is_well_formed(&self) -> bool {
        self.values.windows(2).all(|pair| pair[0] < pair[1])
    }
}

impl<T: PartialEq> Axis<T> {
    /// Position of the first value equal to `want`.
    ///
    /// Linear on purpose: partition remapping breaks ties by first match.
    pub fn position(&self, want: &T) -> Option<usize> {
        self.values.iter().position(|have| have == want)
    }
}

impl<T> Axis<T> {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[T] {
        &self.values
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.values.get(index)
    }

    pub fn first(&self) -> Option<&T> {
        self.values.first()
    }

    pub fn last(&self) -> Option<&T> {
        self.values.last()
    }
}

/// One coordinate axis of a group, tagged with its kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Coordinate {
    Runtime(Axis<DateTime<Utc>>),
    Time(Axis<i32>),
    TimeInterval(Axis<TimeInterval>),
    Vertical(Axis<VerticalLevel>),
    Ensemble(Axis<EnsembleMember>),
}

impl Coordinate {
    pub fn kind(&self) -> CoordinateKind {
        match self {
            Self::Runtime(_) => CoordinateKind::Runtime,
            Self::Time(_) => CoordinateKind::Time,
            Self::TimeInterval(_) => CoordinateKind::TimeInterval,
            Self::Vertical(_) => CoordinateKind::Vertical,
            Self::Ensemble(_) => CoordinateKind::Ensemble,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Runtime(axis) => axis.len(),
            Self::Time(axis) => axis.len(),
            Self::TimeInterval(axis) => axis.len(),
            Self::Vertical(axis) => axis.len(),
            Self::Ensemble(axis) => axis.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_well_formed(&self) -> bool {
        match self {
            Self::Runtime(axis) => axis.is_well_formed(),
            Self::Time(axis) => axis.is_well_formed(),
            Self::TimeInterval(axis) => axis.is_well_formed(),
            Self::Vertical(axis) => axis.is_well_formed(),
            Self::Ensemble(axis) => axis.is_well_formed(),
        }
    }

    /// Formats the axis values as a comma separated list.
    pub fn show_values(&self) -> String {
        fn join<T: fmt::Display>(values: &[T]) -> String {
            values
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        }
        match self {
            Self::Runtime(axis) => axis
                .values()
                .iter()
                .map(|value| value.to_rfc3339())
                .collect::<Vec<_>>()
                .join(", "),
            Self::Time(axis) => join(axis.values()),
            Self::TimeInterval(axis) => join(axis.values()),
            Self::Vertical(axis) => join(axis.values()),
            Self::Ensemble(axis) => join(axis.values()),
        }
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.kind().as_str(), self.len(), self.show_values())
    }
}
