//! Station tables held as polars DataFrames.
//!
//! Conversion between frame cells and [`CellValue`], the whitespace clean-up
//! applied to every retrieved table, and the result columns appended after
//! analysis.

use crate::classifier::{Classification, Row};
use crate::error::{RcaError, Result};
use crate::normalize::CellValue;
use polars::prelude::*;
use std::fs::File;
use std::path::Path;

pub const RESULT_COLUMN: &str = "Result";
pub const PREDICTION_COLUMN: &str = "Prediction";
pub const ROOT_CAUSE_COLUMN: &str = "Root_Cause";
pub const MATCH_PATH_COLUMN: &str = "Match_Path";
pub const DATE_TIME_COLUMN: &str = "Date_Time";

pub fn cell_from_any(value: &AnyValue) -> CellValue {
    match value {
        AnyValue::Null => CellValue::Null,
        AnyValue::Boolean(b) => CellValue::Bool(*b),
        AnyValue::String(s) => CellValue::Text(s.to_string()),
        AnyValue::StringOwned(s) => CellValue::Text(s.to_string()),
        AnyValue::Int32(i) => CellValue::Int(*i as i64),
        AnyValue::Int64(i) => CellValue::Int(*i),
        AnyValue::UInt32(u) => CellValue::Int(*u as i64),
        AnyValue::UInt64(u) => match i64::try_from(*u) {
            Ok(i) => CellValue::Int(i),
            Err(_) => CellValue::Text(u.to_string()),
        },
        AnyValue::Float32(f) => CellValue::from_f32(*f),
        AnyValue::Float64(f) => CellValue::Float(*f),
        other => CellValue::Text(other.to_string()),
    }
}

/// Random access to frame rows as [`Row`]s.
pub struct RowReader<'a> {
    columns: &'a [Series],
    height: usize,
}

impl<'a> RowReader<'a> {
    pub fn new(df: &'a DataFrame) -> Self {
        Self {
            columns: df.get_columns(),
            height: df.height(),
        }
    }

    pub fn len(&self) -> usize {
        self.height
    }

    pub fn is_empty(&self) -> bool {
        self.height == 0
    }

    pub fn row(&self, idx: usize) -> Result<Row> {
        let mut row = Row::new();
        for series in self.columns {
            let value = series.get(idx)?;
            row.insert(series.name(), cell_from_any(&value));
        }
        Ok(row)
    }
}

/// Text of every cell in a column; `None` for nulls or when the column is absent.
pub fn text_column(df: &DataFrame, name: &str) -> Result<Vec<Option<String>>> {
    let series = match df.column(name) {
        Ok(series) => series,
        Err(_) => return Ok(vec![None; df.height()]),
    };
    (0..series.len())
        .map(|idx| {
            let cell = cell_from_any(&series.get(idx)?);
            Ok(if cell.is_missing() {
                None
            } else {
                Some(cell.to_string())
            })
        })
        .collect()
}

/// Trim column names and the contents of every string column.
pub fn strip_frame(mut df: DataFrame) -> Result<DataFrame> {
    let names: Vec<String> = df
        .get_column_names()
        .iter()
        .map(|name| name.trim().to_string())
        .collect();
    df.set_column_names(&names)?;

    for name in &names {
        let series = df.column(name)?;
        if !matches!(series.dtype(), DataType::String) {
            continue;
        }
        let trimmed: Vec<Option<String>> = series
            .str()?
            .into_iter()
            .map(|cell| cell.map(|text| text.trim().to_string()))
            .collect();
        df.with_column(Series::new(name, trimmed))?;
    }
    Ok(df)
}

/// Add an empty `Result` column when the station did not provide one.
pub fn ensure_result_column(df: &mut DataFrame) -> Result<()> {
    if df.column(RESULT_COLUMN).is_err() {
        let empty = vec![String::new(); df.height()];
        df.with_column(Series::new(RESULT_COLUMN, empty))?;
    }
    Ok(())
}

/// Append `Prediction`, `Root_Cause` and `Match_Path`, one entry per row.
pub fn append_classifications(df: &mut DataFrame, results: &[Classification]) -> Result<()> {
    if results.len() != df.height() {
        return Err(RcaError::Table(format!(
            "{} classifications for a table of {} rows",
            results.len(),
            df.height()
        )));
    }
    let verdicts: Vec<String> = results.iter().map(|r| r.verdict.to_string()).collect();
    let causes: Vec<String> = results.iter().map(|r| r.cause.clone()).collect();
    let paths: Vec<String> = results.iter().map(|r| r.path.clone()).collect();
    df.with_column(Series::new(PREDICTION_COLUMN, verdicts))?;
    df.with_column(Series::new(ROOT_CAUSE_COLUMN, causes))?;
    df.with_column(Series::new(MATCH_PATH_COLUMN, paths))?;
    Ok(())
}

/// Build a frame from loosely typed records, one column type per column:
/// all-integer columns become Int64, numeric ones Float64, all-boolean ones
/// Boolean, anything else String.
pub fn frame_from_records(columns: &[String], records: &[Vec<CellValue>]) -> Result<DataFrame> {
    let null = CellValue::Null;
    let mut series = Vec::with_capacity(columns.len());
    for (idx, name) in columns.iter().enumerate() {
        let cells: Vec<&CellValue> = records
            .iter()
            .map(|record| record.get(idx).unwrap_or(&null))
            .collect();
        series.push(series_from_cells(name, &cells));
    }
    Ok(DataFrame::new(series)?)
}

fn series_from_cells(name: &str, cells: &[&CellValue]) -> Series {
    let present = || cells.iter().filter(|c| !matches!(c, CellValue::Null));

    if present().all(|c| matches!(c, CellValue::Int(_))) && present().count() > 0 {
        let values: Vec<Option<i64>> = cells
            .iter()
            .map(|c| match c {
                CellValue::Int(i) => Some(*i),
                _ => None,
            })
            .collect();
        return Series::new(name, values);
    }
    if present().all(|c| matches!(c, CellValue::Int(_) | CellValue::Float(_))) && present().count() > 0 {
        let values: Vec<Option<f64>> = cells
            .iter()
            .map(|c| match c {
                CellValue::Int(i) => Some(*i as f64),
                CellValue::Float(f) => Some(*f),
                _ => None,
            })
            .collect();
        return Series::new(name, values);
    }
    if present().all(|c| matches!(c, CellValue::Bool(_))) && present().count() > 0 {
        let values: Vec<Option<bool>> = cells
            .iter()
            .map(|c| match c {
                CellValue::Bool(b) => Some(*b),
                _ => None,
            })
            .collect();
        return Series::new(name, values);
    }

    let values: Vec<Option<String>> = cells
        .iter()
        .map(|c| match c {
            CellValue::Null => None,
            other => Some(other.to_string()),
        })
        .collect();
    Series::new(name, values)
}

pub fn read_csv(path: impl AsRef<Path>) -> Result<DataFrame> {
    let path = path.as_ref();
    let df = LazyCsvReader::new(path)
        .with_has_header(true)
        .finish()?
        .collect()?;
    strip_frame(df)
}

pub fn write_csv(df: &mut DataFrame, path: impl AsRef<Path>) -> Result<()> {
    let mut file = File::create(path.as_ref())?;
    CsvWriter::new(&mut file).include_header(true).finish(df)?;
    Ok(())
}
