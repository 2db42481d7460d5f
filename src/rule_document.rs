//! The persisted rules document.
//!
//! Layout on disk:
//!
//! ```json
//! { "<station>": { "models": { "<model>": { "rules": [ <rule tree> ] } } } }
//! ```
//!
//! `rules` is normally a one-element list whose first entry is the active
//! tree; a bare tree is accepted as well.

use crate::error::{RcaError, Result};
use crate::rule_tree::{RuleNode, RuleParseOptions};
use serde_json::Value;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct ModelRules {
    pub name: String,
    pub rules: Vec<RuleNode>,
    /// The `rules` value as written, kept for feature collection.
    pub raw_rules: Value,
}

impl ModelRules {
    /// The tree used for classification: the first entry of the list.
    pub fn active_rule(&self) -> Option<&RuleNode> {
        self.rules.first()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StationRules {
    pub name: String,
    /// Models in document order.
    pub models: Vec<ModelRules>,
}

impl StationRules {
    pub fn model(&self, name: &str) -> Option<&ModelRules> {
        self.models.iter().find(|m| m.name == name)
    }

    pub fn model_names(&self) -> Vec<&str> {
        self.models.iter().map(|m| m.name.as_str()).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleDocument {
    stations: Vec<StationRules>,
}

impl RuleDocument {
    /// Load and parse a rules file. Any failure here is fatal for a run.
    pub fn load(path: impl AsRef<Path>, options: RuleParseOptions) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RcaError::Rules(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let value: Value = serde_json::from_str(&content).map_err(|e| {
            RcaError::Rules(format!("Invalid JSON in {}: {}", path.display(), e))
        })?;
        let document = Self::from_json(&value, options)?;
        info!(
            "Successfully loaded {} with {} stations",
            path.display(),
            document.stations.len()
        );
        Ok(document)
    }

    pub fn from_json_str(text: &str, options: RuleParseOptions) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_json(&value, options)
    }

    pub fn from_json(value: &Value, options: RuleParseOptions) -> Result<Self> {
        let root = value
            .as_object()
            .ok_or_else(|| RcaError::Rules("rules document must be a mapping of stations".to_string()))?;

        let mut stations = Vec::with_capacity(root.len());
        for (station_name, station_value) in root {
            let station_map = station_value.as_object().ok_or_else(|| {
                RcaError::Rules(format!("station '{}' must map to a mapping", station_name))
            })?;

            let mut models = Vec::new();
            match station_map.get("models") {
                None => warn!("Station '{}' has no models", station_name),
                Some(Value::Object(model_map)) => {
                    for (model_name, model_value) in model_map {
                        models.push(parse_model(station_name, model_name, model_value, options)?);
                    }
                }
                Some(_) => {
                    return Err(RcaError::Rules(format!(
                        "'models' of station '{}' must be a mapping",
                        station_name
                    )));
                }
            }

            stations.push(StationRules {
                name: station_name.clone(),
                models,
            });
        }

        Ok(Self { stations })
    }

    pub fn stations(&self) -> impl Iterator<Item = &StationRules> {
        self.stations.iter()
    }

    pub fn station(&self, name: &str) -> Option<&StationRules> {
        self.stations.iter().find(|s| s.name == name)
    }

    pub fn contains_station(&self, name: &str) -> bool {
        self.station(name).is_some()
    }

    pub fn model(&self, station: &str, model: &str) -> Option<&ModelRules> {
        self.station(station).and_then(|s| s.model(model))
    }

    pub fn active_rule(&self, station: &str, model: &str) -> Option<&RuleNode> {
        self.station(station)?.model(model)?.active_rule()
    }

    /// First model declared for a station, used when no model is chosen explicitly.
    pub fn first_model(&self, station: &str) -> Option<&str> {
        self.station(station)?.models.first().map(|m| m.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.stations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }
}

fn parse_model(
    station: &str,
    model: &str,
    value: &Value,
    options: RuleParseOptions,
) -> Result<ModelRules> {
    let model_map = value.as_object().ok_or_else(|| {
        RcaError::Rules(format!("model '{}' of station '{}' must be a mapping", model, station))
    })?;

    let context = |e: RcaError| RcaError::Rules(format!("{}/{}: {}", station, model, e));
    let rules = match model_map.get("rules") {
        None => {
            warn!("Model '{}' of station '{}' has no rules", model, station);
            Vec::new()
        }
        Some(Value::Array(trees)) => trees
            .iter()
            .map(|tree| RuleNode::from_json(tree, options))
            .collect::<Result<Vec<_>>>()
            .map_err(context)?,
        Some(tree) => vec![RuleNode::from_json(tree, options).map_err(context)?],
    };

    if rules.is_empty() {
        warn!("Model '{}' of station '{}' has no active rule tree", model, station);
    }

    Ok(ModelRules {
        name: model.to_string(),
        rules,
        raw_rules: model_map.get("rules").cloned().unwrap_or(Value::Null),
    })
}
