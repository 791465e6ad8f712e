//! CSV-sourced waypoint and step tables.
//!
//! A timecourse table has a `times` column (seconds, or human-readable durations such
//! as `2 min`) plus one column per knob. A sequence table has one column per knob and
//! one row per step. Cells are recast like instrument responses.

use super::{Sequence, Setpoint, Timecourse};
use crate::config::parse_time;
use crate::core::Value;
use crate::error::{AppResult, DaqError};
use std::io::Read;
use std::path::Path;

struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

fn read_table<R: Read>(reader: R) -> AppResult<Table> {
    let mut csv = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let headers = csv.headers()?.iter().map(str::to_string).collect::<Vec<_>>();
    let mut rows = Vec::new();
    for record in csv.records() {
        let record = record?;
        rows.push(record.iter().map(str::to_string).collect());
    }
    if rows.is_empty() {
        return Err(DaqError::Configuration("table has no rows".to_string()));
    }
    Ok(Table { headers, rows })
}

fn column(table: &Table, index: usize) -> AppResult<Vec<Setpoint>> {
    table
        .rows
        .iter()
        .map(|row| Value::recast(&row[index]).map(Setpoint::Literal))
        .collect()
}

/// Timecourse from CSV text; the `times` column is required.
pub fn timecourse_from_reader<R: Read>(reader: R) -> AppResult<Timecourse> {
    let table = read_table(reader)?;
    let times_index = table
        .headers
        .iter()
        .position(|h| h == "times" || h == "time")
        .ok_or_else(|| DaqError::Configuration("timecourse table has no 'times' column".into()))?;
    let times = table
        .rows
        .iter()
        .map(|row| parse_time(&row[times_index]))
        .collect::<AppResult<Vec<f64>>>()?;
    let columns = table
        .headers
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != times_index)
        .map(|(i, knob)| Ok((knob.clone(), column(&table, i)?)))
        .collect::<AppResult<Vec<_>>>()?;
    Timecourse::new(times, columns)
}

/// Sequence from CSV text, one step per row.
pub fn sequence_from_reader<R: Read>(interval: f64, reader: R) -> AppResult<Sequence> {
    let table = read_table(reader)?;
    let columns = table
        .headers
        .iter()
        .enumerate()
        .map(|(i, knob)| Ok((knob.clone(), column(&table, i)?)))
        .collect::<AppResult<Vec<_>>>()?;
    Sequence::new(interval, columns)
}

pub fn load_timecourse(path: impl AsRef<Path>) -> AppResult<Timecourse> {
    timecourse_from_reader(std::fs::File::open(path)?)
}

pub fn load_sequence(interval: f64, path: impl AsRef<Path>) -> AppResult<Sequence> {
    sequence_from_reader(interval, std::fs::File::open(path)?)
}
