//! Troubleshooting guidance keyed by station and root cause label.
//!
//! ```json
//! { "<station>": { "<root cause>": [ {"Possible Problem": "...", "Solution": "..."} ] } }
//! ```
//!
//! Unlike the rules document this file is optional: a missing or broken file
//! leaves the report without guidance but never stops a run.

use crate::error::{RcaError, Result};
use crate::rule_tree::json_text;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use tracing::{error, info, warn};

pub const POSSIBLE_PROBLEM: &str = "Possible Problem";
pub const SOLUTION: &str = "Solution";
const NOT_AVAILABLE: &str = "N/A";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TroubleshootingMethod {
    pub possible_problem: String,
    pub solution: String,
}

impl TroubleshootingMethod {
    fn from_json(value: &Value) -> (Self, bool) {
        match value {
            Value::Object(map) => {
                let field = |key: &str| match map.get(key) {
                    Some(Value::String(s)) => (s.clone(), !s.trim().is_empty()),
                    Some(other) => (json_text(other), false),
                    None => (NOT_AVAILABLE.to_string(), false),
                };
                let (possible_problem, problem_ok) = field(POSSIBLE_PROBLEM);
                let (solution, solution_ok) = field(SOLUTION);
                (
                    Self {
                        possible_problem,
                        solution,
                    },
                    problem_ok && solution_ok,
                )
            }
            // Bare entries show up in both columns.
            other => {
                let text = json_text(other);
                (
                    Self {
                        possible_problem: text.clone(),
                        solution: text,
                    },
                    false,
                )
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TroubleshootingGuide {
    stations: HashMap<String, HashMap<String, Vec<TroubleshootingMethod>>>,
}

impl TroubleshootingGuide {
    /// Load the guide, falling back to an empty one on any failure.
    pub fn load_or_empty(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            warn!(
                "{} not found, no troubleshooting methods available",
                path.display()
            );
            return Self::default();
        }
        match Self::load(path) {
            Ok(guide) => guide,
            Err(e) => {
                error!("Failed to load {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&content)?;
        let guide = Self::from_json(&value)?;
        info!(
            "Successfully loaded {} with {} stations",
            path.display(),
            guide.stations.len()
        );
        Ok(guide)
    }

    pub fn from_json(value: &Value) -> Result<Self> {
        let root = value.as_object().ok_or_else(|| {
            RcaError::Troubleshooting("troubleshooting document must be a mapping".to_string())
        })?;

        let mut stations = HashMap::new();
        for (station, causes_value) in root {
            let causes_map = causes_value.as_object().ok_or_else(|| {
                RcaError::Troubleshooting(format!("Station {} must map to a mapping", station))
            })?;

            let mut causes = HashMap::new();
            for (cause, methods_value) in causes_map {
                let entries = methods_value.as_array().ok_or_else(|| {
                    RcaError::Troubleshooting(format!(
                        "Troubleshooting methods for {} in station {} must be a list",
                        cause, station
                    ))
                })?;
                if entries.is_empty() {
                    warn!(
                        "Empty troubleshooting methods for {} in station {}",
                        cause, station
                    );
                }

                let methods = entries
                    .iter()
                    .map(|entry| {
                        let (method, valid) = TroubleshootingMethod::from_json(entry);
                        if !valid {
                            warn!(
                                "Invalid method for {} in station {}: {}",
                                cause, station, entry
                            );
                        }
                        method
                    })
                    .collect();
                causes.insert(cause.clone(), methods);
            }
            stations.insert(station.clone(), causes);
        }

        Ok(Self { stations })
    }

    pub fn methods(&self, station: &str, cause: &str) -> &[TroubleshootingMethod] {
        self.stations
            .get(station)
            .and_then(|causes| causes.get(cause))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn station_count(&self) -> usize {
        self.stations.len()
    }
}
