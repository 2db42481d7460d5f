//! Row classification against a station rule tree.
//!
//! Every call walks the tree from the given node down to a terminal and
//! reports the verdict, a cause label and the `->` joined trail of branch
//! decisions. Data problems never become errors: a missing column yields
//! `Missing`, an unmatched value or a broken node yields `Unknown`.

use crate::normalize::{is_disable, is_falsy, CellValue};
use crate::rule_tree::RuleNode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

pub const PATH_SEPARATOR: &str = "->";
pub const NO_MATCHING_RULE: &str = "No Matching Rule";
pub const NO_FEATURE_IN_RULE: &str = "No feature in rule";
pub const GOOD_CONDITION: &str = "Good Condition";
pub const UNKNOWN_CAUSE: &str = "Unknown";

/// One row of a station table keyed by column name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    cells: HashMap<String, CellValue>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<CellValue>) {
        self.cells.insert(column.into(), value.into());
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<CellValue>) -> Self {
        self.insert(column, value);
        self
    }

    pub fn get(&self, column: &str) -> Option<&CellValue> {
        self.cells.get(column)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Build a row from a JSON object; anything else gives an empty row.
    pub fn from_json(value: &serde_json::Value) -> Self {
        let cells = value
            .as_object()
            .map(|map| {
                map.iter()
                    .map(|(k, v)| (k.clone(), CellValue::from_json(v)))
                    .collect()
            })
            .unwrap_or_default();
        Self { cells }
    }
}

impl<K: Into<String>, V: Into<CellValue>> FromIterator<(K, V)> for Row {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            cells: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    Ng,
    Ok,
    Missing,
    Unknown,
    /// Any other prediction text, uppercased.
    Other(String),
}

impl Verdict {
    pub fn as_str(&self) -> &str {
        match self {
            Verdict::Ng => "NG",
            Verdict::Ok => "OK",
            Verdict::Missing => "Missing",
            Verdict::Unknown => "Unknown",
            Verdict::Other(text) => text,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of classifying one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub verdict: Verdict,
    pub cause: String,
    pub path: String,
}

impl Classification {
    fn new(verdict: Verdict, cause: impl Into<String>, path: &[String]) -> Self {
        Self {
            verdict,
            cause: cause.into(),
            path: path.join(PATH_SEPARATOR),
        }
    }

    pub fn into_triple(self) -> (String, String, String) {
        (self.verdict.to_string(), self.cause, self.path)
    }
}

/// Exact-match lookup of a raw cell value among a node's branch labels.
///
/// Returns the label as spelled in the document together with its child.
pub fn resolve_exact_branch<'a>(rule: &'a RuleNode, raw_value: &str) -> Option<(&'a str, &'a RuleNode)> {
    match rule {
        RuleNode::Feature(node) => node
            .branch_for(raw_value)
            .map(|branch| (branch.label.as_str(), &branch.node)),
        _ => None,
    }
}

/// Classify a row starting from the root of a rule tree.
pub fn classify(row: &Row, rule: &RuleNode) -> Classification {
    classify_from(row, rule, None, Vec::new())
}

/// Classify a row from an inner node, continuing an existing path.
pub fn classify_from(
    row: &Row,
    rule: &RuleNode,
    parent_feature: Option<&str>,
    mut path: Vec<String>,
) -> Classification {
    let node = match rule {
        RuleNode::Malformed => {
            return Classification::new(
                Verdict::Unknown,
                label_or(parent_feature, NO_MATCHING_RULE),
                &path,
            );
        }
        RuleNode::Empty => {
            return Classification::new(
                Verdict::Unknown,
                label_or(parent_feature, NO_FEATURE_IN_RULE),
                &path,
            );
        }
        RuleNode::Prediction(prediction) => {
            let verdict_text = prediction.prediction.to_uppercase();
            return match verdict_text.as_str() {
                "NG" => {
                    let cause = prediction
                        .root_cause
                        .clone()
                        .or_else(|| prediction.feature.clone())
                        .unwrap_or_else(|| label_or(parent_feature, UNKNOWN_CAUSE));
                    path.push("[PRED=NG]".to_string());
                    Classification::new(Verdict::Ng, cause, &path)
                }
                "OK" => {
                    path.push("[PRED=OK]".to_string());
                    Classification::new(Verdict::Ok, GOOD_CONDITION, &path)
                }
                _ => Classification::new(
                    Verdict::Other(verdict_text),
                    label_or(parent_feature, UNKNOWN_CAUSE),
                    &path,
                ),
            };
        }
        RuleNode::Feature(node) => node,
    };

    let feature = node.feature.as_str();
    let value = match row.get(feature) {
        Some(cell) if !cell.is_missing() => cell.clean_text(),
        _ => {
            path.push(format!("{}=<MISSING>", feature));
            return Classification::new(
                Verdict::Missing,
                format!("Missing feature: {}", feature),
                &path,
            );
        }
    };

    if let Some(branch) = node.branch_for(&value) {
        path.push(format!("{}={}", feature, branch.label));
        return classify_from(row, &branch.node, Some(feature), path);
    }

    // Fallback order matters: a value that is both falsy and a disable token
    // ("OFF") must take the fail branch.
    if let Some(child) = node.fail.as_deref().filter(|_| is_falsy(value.as_str())) {
        path.push(format!("{}=FAIL-LIKE({})", feature, value));
        return classify_from(row, child, Some(feature), path);
    }
    if let Some(child) = node.disable.as_deref().filter(|_| is_disable(value.as_str())) {
        path.push(format!("{}=DISABLE({})", feature, value));
        return classify_from(row, child, Some(feature), path);
    }
    if let Some(child) = node.pass.as_deref() {
        path.push(format!("{}=PASS-LIKE({})", feature, value));
        return classify_from(row, child, Some(feature), path);
    }

    path.push(format!("{}=<{}> (no-branch)", feature, value));
    Classification::new(
        Verdict::Unknown,
        label_or(parent_feature, NO_MATCHING_RULE),
        &path,
    )
}

fn label_or(label: Option<&str>, fallback: &str) -> String {
    match label {
        Some(text) if !text.is_empty() => text.to_string(),
        _ => fallback.to_string(),
    }
}
