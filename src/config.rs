//! Application configuration (`app_config.json`).
//!
//! Every field has a default so partially written files still load. A `.env`
//! file and the `RCA_DB_PASSWORD` / `RCA_DATABASE` variables override the
//! connection settings stored on disk.

use crate::datasource::RetrievalFilter;
use crate::error::{RcaError, Result};
use crate::rule_tree::RuleParseOptions;
use chrono::{Duration, Local, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

pub const DATE_SETUP_FORMAT: &str = "%Y/%m/%d";
pub const ENV_DB_PASSWORD: &str = "RCA_DB_PASSWORD";
pub const ENV_DATABASE: &str = "RCA_DATABASE";

fn default_port() -> String {
    "3306".to_string()
}

fn default_every() -> u32 {
    7
}

fn default_state() -> String {
    "Auto".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// Database name; for the SQLite source, the database file path.
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub auto_save_path: String,
    #[serde(default)]
    pub html_filename: String,
    #[serde(default)]
    pub html_title: String,
    #[serde(default)]
    pub include_week_no: bool,
    /// Analysis window length in days.
    #[serde(default = "default_every")]
    pub every: u32,
    /// End date of the next window, `YYYY/MM/DD`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_setup: Option<String>,
    #[serde(default)]
    pub auto_run: bool,
    /// Tables to analyze; `None` means every table in the database.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_tables: Option<Vec<String>>,
    #[serde(default = "default_state")]
    pub state: String,
    #[serde(default = "default_true")]
    pub apply_state: bool,
    #[serde(default)]
    pub strict_rules: bool,
    #[serde(default)]
    pub route_verdict_labels: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            user: String::new(),
            password: String::new(),
            database: String::new(),
            auto_save_path: String::new(),
            html_filename: String::new(),
            html_title: String::new(),
            include_week_no: false,
            every: default_every(),
            date_setup: None,
            auto_run: false,
            selected_tables: None,
            state: default_state(),
            apply_state: true,
            strict_rules: false,
            route_verdict_labels: false,
        }
    }
}

/// Inclusive retrieval window of an automatic run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalysisWindow {
    pub from: NaiveDateTime,
    pub to: NaiveDateTime,
}

impl AppConfig {
    /// Load from disk and apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RcaError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let mut config: AppConfig = serde_json::from_str(&content).map_err(|e| {
            RcaError::Config(format!("Invalid config {}: {}", path.display(), e))
        })?;
        config.apply_env_overrides();
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load, falling back to defaults (plus overrides) when the file is unusable.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path.as_ref()) {
            Ok(config) => config,
            Err(e) => {
                warn!("{}; using default configuration", e);
                let mut config = Self::default();
                config.apply_env_overrides();
                config
            }
        }
    }

    pub fn apply_env_overrides(&mut self) {
        dotenv::dotenv().ok();
        if let Ok(password) = std::env::var(ENV_DB_PASSWORD) {
            self.password = password;
        }
        if let Ok(database) = std::env::var(ENV_DATABASE) {
            if !database.trim().is_empty() {
                self.database = database.trim().to_string();
            }
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Configuration saved");
        Ok(())
    }

    /// Full check of saved settings, report naming included.
    pub fn validate(&self) -> Result<()> {
        if self.html_filename.trim().is_empty() {
            return Err(RcaError::Config("Report filename cannot be empty".to_string()));
        }
        if self.html_title.trim().is_empty() {
            return Err(RcaError::Config("Report title cannot be empty".to_string()));
        }
        self.validate_run_settings()
    }

    /// Settings an automatic run depends on. Report naming falls back to
    /// defaults, so it is not checked here.
    pub fn validate_run_settings(&self) -> Result<()> {
        if self.database.trim().is_empty() {
            return Err(RcaError::Config("Database cannot be empty".to_string()));
        }
        if self.every < 1 {
            return Err(RcaError::Config("'every' must be at least 1 day".to_string()));
        }
        let save_path = self.auto_save_path.trim();
        if !save_path.is_empty() && !Path::new(save_path).is_dir() {
            return Err(RcaError::Config(format!(
                "Auto-save path {} is not an existing directory",
                save_path
            )));
        }
        if self.auto_run && matches!(&self.selected_tables, Some(tables) if tables.is_empty()) {
            return Err(RcaError::Config(
                "Auto-run requires at least one selected table".to_string(),
            ));
        }
        if let Some(date) = &self.date_setup {
            parse_date_setup(date)?;
        }
        Ok(())
    }

    pub fn parse_options(&self) -> RuleParseOptions {
        RuleParseOptions {
            strict: self.strict_rules,
            route_verdict_labels: self.route_verdict_labels,
        }
    }

    /// End date of the window: `date_setup`, or `today` when unset.
    pub fn end_date(&self, today: NaiveDate) -> Result<NaiveDate> {
        match &self.date_setup {
            Some(date) if !date.trim().is_empty() => parse_date_setup(date),
            _ => Ok(today),
        }
    }

    /// `[end - every days 08:00:00, end 07:59:59]`, one operation day per calendar boundary.
    pub fn analysis_window(&self, today: NaiveDate) -> Result<AnalysisWindow> {
        let end = self.end_date(today)?;
        let start = end - Duration::days(i64::from(self.every));
        Ok(AnalysisWindow {
            from: start.and_time(operation_day_start()),
            to: end.and_time(operation_day_end()),
        })
    }

    pub fn current_window(&self) -> Result<AnalysisWindow> {
        self.analysis_window(Local::now().date_naive())
    }

    pub fn retrieval_filter(&self, window: AnalysisWindow) -> RetrievalFilter {
        let filter = RetrievalFilter::new(window.from, window.to);
        if self.apply_state {
            filter.with_state(self.state.clone())
        } else {
            filter
        }
    }

    /// Move `date_setup` forward by `every` days. Returns the new value, if any.
    pub fn advance_date_setup(&mut self) -> Result<Option<String>> {
        let current = match &self.date_setup {
            Some(date) if !date.trim().is_empty() => parse_date_setup(date)?,
            _ => return Ok(None),
        };
        let next = (current + Duration::days(i64::from(self.every)))
            .format(DATE_SETUP_FORMAT)
            .to_string();
        info!("Updated config date to {}", next);
        self.date_setup = Some(next.clone());
        Ok(Some(next))
    }
}

fn operation_day_start() -> NaiveTime {
    NaiveTime::from_hms_opt(8, 0, 0).unwrap_or(NaiveTime::MIN)
}

fn operation_day_end() -> NaiveTime {
    NaiveTime::from_hms_opt(7, 59, 59).unwrap_or(NaiveTime::MIN)
}

pub fn parse_date_setup(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), DATE_SETUP_FORMAT).map_err(|e| {
        RcaError::Config(format!("Invalid date_setup '{}': {}", value, e))
    })
}
