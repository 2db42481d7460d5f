//! Session context for one analysis run.
//!
//! Holds the loaded documents, the retrieved and analyzed station tables and
//! the run log. Stages pass the session explicitly instead of sharing global
//! state.

use crate::analysis::{
    select_first_models, AnalysisOutcome, AnalysisWorker, AnalyzedStation, CancelFlag, ProgressSink,
    StationSelection,
};
use crate::config::AppConfig;
use crate::datasource::{RecordSource, RetrievalFilter};
use crate::error::{RcaError, Result};
use crate::observability::LogBuffer;
use crate::report::{Report, ReportInput, ReportSettings};
use crate::rule_document::RuleDocument;
use crate::troubleshooting::TroubleshootingGuide;
use polars::prelude::DataFrame;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct Session {
    rules: Arc<RuleDocument>,
    troubleshooting: TroubleshootingGuide,
    selected_tables: Vec<String>,
    retrieved: HashMap<String, DataFrame>,
    analyzed: Vec<AnalyzedStation>,
    state: Option<String>,
    logs: LogBuffer,
    cancel: CancelFlag,
}

impl Session {
    pub fn new(rules: RuleDocument, troubleshooting: TroubleshootingGuide, logs: LogBuffer) -> Self {
        Self {
            rules: Arc::new(rules),
            troubleshooting,
            selected_tables: Vec::new(),
            retrieved: HashMap::new(),
            analyzed: Vec::new(),
            state: None,
            logs,
            cancel: CancelFlag::new(),
        }
    }

    pub fn rules(&self) -> &RuleDocument {
        &self.rules
    }

    pub fn troubleshooting(&self) -> &TroubleshootingGuide {
        &self.troubleshooting
    }

    pub fn selected_tables(&self) -> &[String] {
        &self.selected_tables
    }

    pub fn retrieved(&self) -> &HashMap<String, DataFrame> {
        &self.retrieved
    }

    pub fn analyzed(&self) -> &[AnalyzedStation] {
        &self.analyzed
    }

    pub fn state(&self) -> Option<&str> {
        self.state.as_deref()
    }

    pub fn logs(&self) -> &LogBuffer {
        &self.logs
    }

    /// Flag that cancels the analysis currently running for this session.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Replace the retrieved tables; earlier analysis results are dropped.
    pub fn set_tables(&mut self, tables: Vec<(String, DataFrame)>) {
        self.selected_tables = tables.iter().map(|(name, _)| name.clone()).collect();
        self.retrieved = tables.into_iter().collect();
        self.analyzed.clear();
        info!(
            "Accepted retrieved data from {:?}, total rows={}",
            self.selected_tables,
            self.retrieved.values().map(DataFrame::height).sum::<usize>()
        );
    }

    pub fn retrieve(&mut self, source: &dyn RecordSource, tables: &[String], filter: &RetrievalFilter) {
        self.state = filter.state.clone();
        let frames = source.retrieve_all(tables, filter);
        self.set_tables(frames);
    }

    /// Analyze the retrieved tables. Returns `false` when the run was canceled,
    /// in which case earlier results are kept and the cancel flag is re-armed.
    pub async fn analyze(
        &mut self,
        selections: Vec<StationSelection>,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<bool> {
        let worker = AnalysisWorker::with_cancel_flag(self.rules.clone(), self.cancel.clone());
        let handle = worker.spawn(self.retrieved.clone(), selections, progress);
        let outcome = handle
            .await
            .map_err(|e| RcaError::Table(format!("Analysis worker failed: {}", e)))??;
        match outcome {
            AnalysisOutcome::Completed(analyzed) => {
                self.analyzed = analyzed;
                info!("Analysis completed.");
                Ok(true)
            }
            AnalysisOutcome::Canceled => {
                self.cancel = CancelFlag::new();
                Ok(false)
            }
        }
    }

    pub fn report(&self, settings: &ReportSettings) -> Result<Report> {
        Report::build(
            &ReportInput {
                selected_tables: &self.selected_tables,
                retrieved: &self.retrieved,
                analyzed: &self.analyzed,
                troubleshooting: &self.troubleshooting,
            },
            settings,
        )
    }
}

/// Unattended run: retrieve the configured window, analyze each station with
/// its first model, write the report and move the configured date forward.
///
/// Returns the report path, or `None` when the analysis was canceled or no
/// retrieved station has rules. The configured date only moves on after a report.
pub async fn auto_run(
    session: &mut Session,
    config: &mut AppConfig,
    config_path: &Path,
    source: &dyn RecordSource,
    progress: Arc<dyn ProgressSink>,
) -> Result<Option<PathBuf>> {
    config.validate_run_settings()?;
    info!("Starting automatic analysis");
    let tables = match &config.selected_tables {
        Some(tables) => tables.clone(),
        None => source.list_tables().map_err(|e| {
            error!("Error refreshing tables in auto-run: {}", e);
            e
        })?,
    };
    info!("Auto-selected tables: {:?}", tables);

    let window = config.current_window()?;
    session.retrieve(source, &tables, &config.retrieval_filter(window));

    let selections = select_first_models(session.rules(), &tables);
    if selections.is_empty() {
        warn!("No stations with models for auto-analysis");
        return Ok(None);
    }
    if !session.analyze(selections, progress).await? {
        return Ok(None);
    }

    let report = session.report(&ReportSettings::from(&*config))?;
    let save_dir = config.auto_save_path.trim();
    let path = report.write((!save_dir.is_empty()).then(|| Path::new(save_dir)))?;

    if config.advance_date_setup()?.is_some() {
        config.save(config_path)?;
    }
    Ok(Some(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::NoProgress;
    use crate::datasource::SqliteSource;
    use crate::rule_tree::RuleParseOptions;
    use polars::df;
    use rusqlite::Connection;
    use serde_json::json;
    use tempfile::TempDir;

    fn session() -> Session {
        let rules = RuleDocument::from_json(
            &json!({"ST10": {"models": {"M1": {"rules": [{
                "feature": "Leak",
                "fail": {"Prediction": "NG", "root_cause": "Leak"},
                "pass": {"Prediction": "OK"}
            }]}}}}),
            RuleParseOptions::default(),
        )
        .unwrap();
        Session::new(rules, TroubleshootingGuide::default(), LogBuffer::new(100))
    }

    #[tokio::test]
    async fn test_analyze_then_report() {
        let mut session = session();
        session.set_tables(vec![(
            "ST10".to_string(),
            df![
                "Leak" => ["0", "1"],
                "Date_Time" => ["2024-05-01 09:00:00", "2024-05-01 10:00:00"],
                "Result" => ["NG", "OK"]
            ]
            .unwrap(),
        )]);
        assert!(session
            .analyze(vec![StationSelection::new("ST10", "M1")], Arc::new(NoProgress))
            .await
            .unwrap());
        assert_eq!(session.analyzed().len(), 1);

        let report = session.report(&ReportSettings::default()).unwrap();
        assert_eq!(report.root_causes[0].causes[0].cause, "Leak");
        assert_eq!(report.troubleshooting[0].percentage, 100.0);
    }

    #[tokio::test]
    async fn test_canceled_analysis_keeps_previous_results() {
        let mut session = session();
        session.set_tables(vec![("ST10".to_string(), df!["Leak" => ["0"]].unwrap())]);
        session.cancel_flag().cancel();
        let completed = session
            .analyze(vec![StationSelection::new("ST10", "M1")], Arc::new(NoProgress))
            .await
            .unwrap();
        assert!(!completed);
        assert!(session.analyzed().is_empty());
    }

    fn unrelated_source() -> SqliteSource {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE "ST99" ("Serial" TEXT, "State" TEXT, "Date_Time" TEXT, "Result" TEXT);
            INSERT INTO "ST99" VALUES ('U1', 'Auto', '2024-04-30 10:00:00', 'NG');
            "#,
        )
        .unwrap();
        SqliteSource::from_connection(conn)
    }

    #[tokio::test]
    async fn test_auto_run_without_ruled_stations_keeps_window() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("app_config.json");
        let mut config = AppConfig {
            database: ":memory:".to_string(),
            auto_save_path: dir.path().display().to_string(),
            date_setup: Some("2024/05/01".to_string()),
            ..AppConfig::default()
        };
        let mut session = session();

        let source = unrelated_source();
        let path = auto_run(&mut session, &mut config, &config_path, &source, Arc::new(NoProgress))
            .await
            .unwrap();

        assert_eq!(path, None);
        assert_eq!(session.retrieved()["ST99"].height(), 1);
        assert_eq!(config.date_setup.as_deref(), Some("2024/05/01"));
        assert!(!config_path.exists());
        assert!(!dir.path().join("Report.json").exists());
    }

    #[tokio::test]
    async fn test_auto_run_rejects_invalid_settings() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("app_config.json");
        let mut config = AppConfig {
            database: ":memory:".to_string(),
            every: 0,
            date_setup: Some("2024/05/01".to_string()),
            ..AppConfig::default()
        };
        let mut session = session();
        let source = unrelated_source();

        let result = auto_run(&mut session, &mut config, &config_path, &source, Arc::new(NoProgress)).await;
        assert!(matches!(result, Err(RcaError::Config(_))));
        assert!(session.retrieved().is_empty());

        config.every = 7;
        config.date_setup = Some("May 1st".to_string());
        let result = auto_run(&mut session, &mut config, &config_path, &source, Arc::new(NoProgress)).await;
        assert!(matches!(result, Err(RcaError::Config(_))));
    }
}
