use thiserror::Error;

#[derive(Error, Debug)]
pub enum RcaError {
    #[error("Rules error: {0}")]
    Rules(String),

    #[error("Troubleshooting error: {0}")]
    Troubleshooting(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Table error: {0}")]
    Table(String),

    #[error("Report error: {0}")]
    Report(String),

    #[error("Analysis canceled")]
    Canceled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Polars error: {0}")]
    Polars(String),
}

impl From<polars::error::PolarsError> for RcaError {
    fn from(err: polars::error::PolarsError) -> Self {
        RcaError::Polars(err.to_string())
    }
}

impl From<rusqlite::Error> for RcaError {
    fn from(err: rusqlite::Error) -> Self {
        RcaError::Database(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RcaError>;
