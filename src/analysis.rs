//! Batch analysis of retrieved station tables.
//!
//! Each selected `(station, model)` pair is classified row by row against the
//! model's active rule tree. Rows are independent; the only shared state is
//! the read-only rule document. Cancellation is cooperative and checked
//! between rows, progress goes out through a [`ProgressSink`].

use crate::classifier::{classify, Classification};
use crate::error::Result;
use crate::rule_document::RuleDocument;
use crate::table::{append_classifications, ensure_result_column, RowReader};
use polars::prelude::DataFrame;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Shared cancellation request flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub done: usize,
    pub total: usize,
}

impl Progress {
    pub fn percent(&self) -> usize {
        if self.total == 0 {
            0
        } else {
            self.done * 100 / self.total
        }
    }
}

pub trait ProgressSink: Send + Sync {
    fn report(&self, progress: Progress);
}

impl<F> ProgressSink for F
where
    F: Fn(Progress) + Send + Sync,
{
    fn report(&self, progress: Progress) {
        self(progress)
    }
}

/// Progress sink that drops every update.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _progress: Progress) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationSelection {
    pub station: String,
    pub model: String,
}

impl StationSelection {
    pub fn new(station: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            station: station.into(),
            model: model.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnalyzedStation {
    pub station: String,
    pub model: String,
    /// Retrieved table with `Prediction`, `Root_Cause` and `Match_Path` appended.
    pub frame: DataFrame,
}

#[derive(Debug, Clone)]
pub enum AnalysisOutcome {
    Completed(Vec<AnalyzedStation>),
    /// Partial results are discarded.
    Canceled,
}

impl AnalysisOutcome {
    pub fn is_canceled(&self) -> bool {
        matches!(self, AnalysisOutcome::Canceled)
    }
}

/// For each station that has rules, pick the first model it declares.
pub fn select_first_models(rules: &RuleDocument, stations: &[String]) -> Vec<StationSelection> {
    stations
        .iter()
        .filter_map(|station| {
            rules
                .first_model(station)
                .map(|model| StationSelection::new(station.as_str(), model))
        })
        .collect()
}

pub struct AnalysisWorker {
    rules: Arc<RuleDocument>,
    cancel: CancelFlag,
}

impl AnalysisWorker {
    pub fn new(rules: Arc<RuleDocument>) -> Self {
        Self {
            rules,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel_flag(rules: Arc<RuleDocument>, cancel: CancelFlag) -> Self {
        Self { rules, cancel }
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Classify every selected station table.
    pub fn run(
        &self,
        tables: &HashMap<String, DataFrame>,
        selections: &[StationSelection],
        progress: &dyn ProgressSink,
    ) -> Result<AnalysisOutcome> {
        let total: usize = selections
            .iter()
            .map(|s| tables.get(&s.station).map(DataFrame::height).unwrap_or(0))
            .sum();
        let mut done = 0usize;
        let mut analyzed = Vec::new();

        for selection in selections {
            if self.cancel.is_canceled() {
                info!("Analysis canceled");
                return Ok(AnalysisOutcome::Canceled);
            }

            let station = selection.station.as_str();
            if !self.rules.contains_station(station) {
                warn!("No rules for station {}, skipping", station);
                continue;
            }
            let rule = match self.rules.active_rule(station, &selection.model) {
                Some(rule) => rule,
                None => {
                    warn!(
                        "No active rule tree for station {}, model {}, skipping",
                        station, selection.model
                    );
                    continue;
                }
            };
            let mut frame = match tables.get(station) {
                Some(df) if df.height() > 0 => df.clone(),
                _ => {
                    info!("No data for station {}, skipping", station);
                    continue;
                }
            };

            info!(
                "Analyzing station: {}, model: {}, rows: {}",
                station,
                selection.model,
                frame.height()
            );
            ensure_result_column(&mut frame)?;

            let reader = RowReader::new(&frame);
            let mut results: Vec<Classification> = Vec::with_capacity(reader.len());
            for idx in 0..reader.len() {
                if self.cancel.is_canceled() {
                    info!("Analysis canceled");
                    return Ok(AnalysisOutcome::Canceled);
                }
                results.push(classify(&reader.row(idx)?, rule));
                done += 1;
                progress.report(Progress { done, total });
            }

            append_classifications(&mut frame, &results)?;
            info!("Completed analysis for {}", station);
            analyzed.push(AnalyzedStation {
                station: station.to_string(),
                model: selection.model.clone(),
                frame,
            });
        }

        Ok(AnalysisOutcome::Completed(analyzed))
    }

    /// Run the batch on the blocking pool; cancel through [`Self::cancel_flag`].
    pub fn spawn(
        self,
        tables: HashMap<String, DataFrame>,
        selections: Vec<StationSelection>,
        progress: Arc<dyn ProgressSink>,
    ) -> JoinHandle<Result<AnalysisOutcome>> {
        tokio::task::spawn_blocking(move || self.run(&tables, &selections, progress.as_ref()))
    }
}
