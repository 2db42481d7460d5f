//! Record sources for station tables.
//!
//! Every station stores its test records in a table of its own. Retrieval
//! narrows a table to an operating-state and a `Date_Time` window and returns
//! a whitespace-stripped [`DataFrame`].

use crate::error::{RcaError, Result};
use crate::normalize::CellValue;
use crate::table::{frame_from_records, strip_frame, DATE_TIME_COLUMN};
use chrono::NaiveDateTime;
use polars::prelude::DataFrame;
use rusqlite::types::ValueRef;
use rusqlite::{params_from_iter, Connection, OpenFlags};
use std::path::Path;
use tracing::{error, info};

pub const STATE_COLUMN: &str = "State";
const DATE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Which rows of a station table to retrieve.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalFilter {
    /// Operating state; `None` retrieves every state.
    pub state: Option<String>,
    pub from: NaiveDateTime,
    pub to: NaiveDateTime,
}

impl RetrievalFilter {
    pub fn new(from: NaiveDateTime, to: NaiveDateTime) -> Self {
        Self {
            state: None,
            from,
            to,
        }
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }
}

/// A database holding one table per station.
pub trait RecordSource {
    fn list_tables(&self) -> Result<Vec<String>>;

    fn retrieve(&self, table: &str, filter: &RetrievalFilter) -> Result<DataFrame>;

    /// Retrieve several tables; a failing table logs and comes back empty.
    fn retrieve_all(&self, tables: &[String], filter: &RetrievalFilter) -> Vec<(String, DataFrame)> {
        info!(
            "Starting to retrieve data for selected tables: {:?}, state: {}, from: {}, to: {}",
            tables,
            filter.state.as_deref().unwrap_or("None"),
            filter.from.format(DATE_TIME_FORMAT),
            filter.to.format(DATE_TIME_FORMAT)
        );
        let frames = tables
            .iter()
            .map(|table| {
                let frame = match self.retrieve(table, filter) {
                    Ok(df) => {
                        info!("Retrieved {} rows from {}", df.height(), table);
                        df
                    }
                    Err(e) => {
                        error!("Retrieve failed for {}: {}", table, e);
                        DataFrame::empty()
                    }
                };
                (table.clone(), frame)
            })
            .collect();
        info!("Data retrieval completed.");
        frames
    }
}

pub struct SqliteSource {
    conn: Connection,
}

impl SqliteSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_URI,
        )
        .map_err(|e| RcaError::Database(format!("Failed to open {}: {}", path.display(), e)))?;
        info!("Connected to {}", path.display());
        Ok(Self { conn })
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn cell_from_sql(value: ValueRef<'_>) -> CellValue {
    match value {
        ValueRef::Null => CellValue::Null,
        ValueRef::Integer(i) => CellValue::Int(i),
        ValueRef::Real(f) => CellValue::Float(f),
        ValueRef::Text(bytes) => CellValue::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => CellValue::Text(String::from_utf8_lossy(bytes).into_owned()),
    }
}

impl RecordSource for SqliteSource {
    fn list_tables(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let tables = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tables)
    }

    fn retrieve(&self, table: &str, filter: &RetrievalFilter) -> Result<DataFrame> {
        let mut conditions = Vec::new();
        let mut params: Vec<String> = Vec::new();
        if let Some(state) = &filter.state {
            conditions.push(format!("{} = ?", quote_identifier(STATE_COLUMN)));
            params.push(state.clone());
        }
        conditions.push(format!("{} BETWEEN ? AND ?", quote_identifier(DATE_TIME_COLUMN)));
        params.push(filter.from.format(DATE_TIME_FORMAT).to_string());
        params.push(filter.to.format(DATE_TIME_FORMAT).to_string());

        let sql = format!(
            "SELECT * FROM {} WHERE {}",
            quote_identifier(table),
            conditions.join(" AND ")
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let width = columns.len();

        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let mut record = Vec::with_capacity(width);
            for idx in 0..width {
                record.push(cell_from_sql(row.get_ref(idx)?));
            }
            records.push(record);
        }

        strip_frame(frame_from_records(&columns, &records)?)
    }
}
