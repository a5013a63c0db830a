//! Fixtures shared by unit tests.
//!
//! Data files are plain text, one record per line:
//! `grid discipline category parameter level_type runtime_hour time level [member]`
//! where `time` is an offset (`6`) or an interval (`0-6`), `level` and
//! `member` may be `-`. A record's position is the byte offset of its line.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Duration, TimeZone, Utc};
use fnv::FnvHashMap;
use parking_lot::Mutex;

use crate::coord::{Axis, Coordinate, EnsembleMember, TimeInterval, TimeValue, VerticalLevel};
use crate::error::{CollectionError, Result};
use crate::locator::{FileInventory, LocatedRecord, RecordLocator};
use crate::model::{
    CollectionDescriptor, GridDefinition, GroupDescriptor, Producer, Record, RecordTables,
    VariableDescriptor, VariableKey,
};
use crate::scan::SourceFile;

pub fn runtime(hours: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::hours(hours)
}

pub fn grid(hash: u32) -> GridDefinition {
    GridDefinition {
        hash,
        template: 0,
        name: format!("grid-{hash}"),
        nx: 360,
        ny: 181,
    }
}

pub fn producer() -> Producer {
    Producer {
        center: 7,
        subcenter: 0,
        master_table: 2,
        local_table: 1,
        gen_process_type: 2,
        gen_process_id: 96,
        back_process_id: 0,
    }
}

pub fn write_data_file(dir: &Path, name: &str, lines: &[&str]) -> PathBuf {
    let path = dir.join(name);
    let mut text = lines.join("\n");
    text.push('\n');
    fs::write(&path, text).expect("write data file");
    path
}

/// Locator for the line format above; counts calls per path.
#[derive(Debug, Default)]
pub struct LineLocator {
    calls: Mutex<FnvHashMap<PathBuf, usize>>,
}

impl LineLocator {
    pub fn calls(&self, path: &Path) -> usize {
        self.calls.lock().get(path).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }
}

fn field<T: FromStr>(fields: &[&str], index: usize, line: &str) -> Result<T> {
    fields
        .get(index)
        .and_then(|value| value.parse().ok())
        .ok_or_else(|| CollectionError::InvalidInput(format!("bad field {index} in {line:?}")))
}

fn parse_line(line: &str, pos: u64) -> Result<Option<LocatedRecord>> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.is_empty() || fields[0].starts_with('#') {
        return Ok(None);
    }
    if fields.len() < 8 {
        return Err(CollectionError::InvalidInput(format!("short record line {line:?}")));
    }

    let time = match fields[6].split_once('-') {
        Some((start, end)) => TimeValue::Interval(TimeInterval::new(
            start.parse().map_err(|_| CollectionError::InvalidInput(line.to_string()))?,
            end.parse().map_err(|_| CollectionError::InvalidInput(line.to_string()))?,
        )),
        None => TimeValue::Offset(field(&fields, 6, line)?),
    };
    let vertical = match fields[7] {
        "-" => None,
        _ => Some(VerticalLevel::new(field(&fields, 7, line)?)),
    };
    let ensemble = match fields.get(8) {
        None | Some(&"-") => None,
        Some(_) => Some(EnsembleMember::new(1, field(&fields, 8, line)?)),
    };

    Ok(Some(LocatedRecord {
        grid: grid(field(&fields, 0, line)?),
        key: VariableKey::new(
            field(&fields, 1, line)?,
            field(&fields, 2, line)?,
            field(&fields, 3, line)?,
            field(&fields, 4, line)?,
        ),
        runtime: runtime(field(&fields, 5, line)?),
        time,
        vertical,
        ensemble,
        pos,
        bms_pos: 0,
    }))
}

impl RecordLocator for LineLocator {
    fn locate(&self, path: &Path, _aux: &serde_json::Value) -> Result<FileInventory> {
        *self.calls.lock().entry(path.to_path_buf()).or_default() += 1;
        let text = fs::read_to_string(path)?;
        let mut records = Vec::new();
        let mut pos = 0u64;
        for line in text.split_inclusive('\n') {
            if let Some(record) = parse_line(line, pos)? {
                records.push(record);
            }
            pos += line.len() as u64;
        }
        Ok(FileInventory {
            producer: producer(),
            records,
        })
    }
}

/// A hand-built leaf index over two data files created in `dir`.
pub fn sample_contents(dir: &Path) -> (CollectionDescriptor, RecordTables) {
    let files: Vec<SourceFile> = ["a.grib2", "b.grib2"]
        .iter()
        .map(|name| {
            let path = write_data_file(dir, name, &["1 0 0 0 100 0 0 500"]);
            SourceFile::from_path(&path).expect("stat")
        })
        .collect();

    let temperature = VariableKey::new(0, 0, 0, 100);
    let precipitation = VariableKey {
        interval_type: 1,
        interval_name: Some("Accumulation".to_string()),
        ..VariableKey::new(0, 1, 8, 1)
    };
    let variable = |key: &VariableKey, coords: Vec<u16>| VariableDescriptor {
        key: key.clone(),
        hash: key.hash_code(),
        coords,
        records_pos: 0,
        records_len: 0,
        partition_children: Vec::new(),
    };

    let groups = vec![
        GroupDescriptor {
            grid: grid(1),
            filenos: vec![0, 1],
            coordinates: vec![
                Coordinate::Runtime(Axis::from_values([runtime(0)])),
                Coordinate::Time(Axis::from_values([0, 6])),
                Coordinate::Vertical(Axis::from_values([
                    VerticalLevel::new(500.0),
                    VerticalLevel::new(850.0),
                ])),
            ],
            variables: vec![variable(&temperature, vec![0, 1, 2])],
        },
        GroupDescriptor {
            grid: grid(2),
            filenos: vec![1],
            coordinates: vec![
                Coordinate::Runtime(Axis::from_values([runtime(0), runtime(6)])),
                Coordinate::TimeInterval(Axis::from_values([TimeInterval::new(0, 6)])),
            ],
            variables: vec![variable(&precipitation, vec![0, 1])],
        },
    ];
    let tables: RecordTables = vec![
        vec![vec![
            Some(Record::new(0, 0, 0)),
            Some(Record::new(0, 10, 0)),
            Some(Record::new(1, 0, 0)),
            None,
        ]
        .into()],
        vec![vec![Some(Record::new(1, 20, 0)), Some(Record::new(1, 40, 64))].into()],
    ];

    let descriptor = CollectionDescriptor {
        name: "sample".to_string(),
        directory: dir.to_path_buf(),
        producer: producer(),
        files,
        skipped: Vec::new(),
        groups,
        partition: None,
    };
    (descriptor, tables)
}
