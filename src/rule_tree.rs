//! Typed rule trees.
//!
//! Station rules are stored as nested JSON mappings. They are parsed once at
//! load time into [`RuleNode`] so the classifier walks a closed set of node
//! shapes instead of probing untyped maps on every row.

use crate::error::{RcaError, Result};
use crate::normalize::{format_float, normalize};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Keys that never act as exact-match branch labels (compared uppercased).
pub const RESERVED_KEYS: [&str; 8] = [
    "FEATURE", "PASS", "FAIL", "DISABLE", "PREDICTION", "ROOT_CAUSE", "OK", "NG",
];

pub const KEY_FEATURE: &str = "feature";
pub const KEY_PREDICTION: &str = "Prediction";
pub const KEY_ROOT_CAUSE: &str = "root_cause";
pub const KEY_PASS: &str = "pass";
pub const KEY_FAIL: &str = "fail";
pub const KEY_DISABLE: &str = "Disable";

/// How permissive the rule parser is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleParseOptions {
    /// Reject dead-end nodes, non-mapping nodes and branch labels that
    /// normalize to the same text instead of keeping them.
    #[serde(default)]
    pub strict: bool,

    /// Admit `OK` / `NG` keys as exact-match branch labels.
    #[serde(default)]
    pub route_verdict_labels: bool,
}

impl RuleParseOptions {
    pub fn strict() -> Self {
        Self {
            strict: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RuleNode {
    /// Terminal node carrying a verdict.
    Prediction(PredictionNode),
    /// Decision node that inspects one row field.
    Feature(FeatureNode),
    /// Mapping with neither `Prediction` nor `feature`.
    Empty,
    /// Anything that is not a mapping (string, number, list, null).
    Malformed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PredictionNode {
    /// Prediction text as written in the document (not yet uppercased).
    pub prediction: String,
    pub root_cause: Option<String>,
    /// Some documents put a `feature` on terminal nodes; it is only used as a
    /// fallback cause label.
    pub feature: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureNode {
    pub feature: String,
    /// Exact-match branches in document order.
    pub branches: Vec<Branch>,
    pub pass: Option<Box<RuleNode>>,
    pub fail: Option<Box<RuleNode>>,
    pub disable: Option<Box<RuleNode>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
    /// Label exactly as spelled in the document.
    pub label: String,
    /// Normalized label used for lookups.
    pub key: String,
    pub node: RuleNode,
}

impl FeatureNode {
    /// Later branches shadow earlier ones with the same normalized label.
    pub fn branch_for(&self, value: &str) -> Option<&Branch> {
        let wanted = normalize(value);
        self.branches.iter().rev().find(|b| b.key == wanted)
    }
}

impl RuleNode {
    pub fn parse_str(text: &str, options: RuleParseOptions) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_json(&value, options)
    }

    pub fn from_json(value: &Value, options: RuleParseOptions) -> Result<Self> {
        parse_node(value, "", options)
    }

    pub fn is_rule(&self) -> bool {
        matches!(self, RuleNode::Prediction(_) | RuleNode::Feature(_))
    }

    /// Number of nodes in the tree, this one included.
    pub fn node_count(&self) -> usize {
        match self {
            RuleNode::Feature(node) => {
                1 + node.branches.iter().map(|b| b.node.node_count()).sum::<usize>()
                    + [&node.pass, &node.fail, &node.disable]
                        .into_iter()
                        .flatten()
                        .map(|child| child.node_count())
                        .sum::<usize>()
            }
            _ => 1,
        }
    }
}

fn parse_node(value: &Value, pointer: &str, options: RuleParseOptions) -> Result<RuleNode> {
    let map = match value {
        Value::Object(map) => map,
        _ => {
            if options.strict {
                return Err(RcaError::Rules(format!(
                    "rule node at '{}' is not a mapping",
                    display_pointer(pointer)
                )));
            }
            return Ok(RuleNode::Malformed);
        }
    };

    if let Some(prediction) = map.get(KEY_PREDICTION) {
        return Ok(RuleNode::Prediction(PredictionNode {
            prediction: json_text(prediction),
            root_cause: map.get(KEY_ROOT_CAUSE).and_then(json_label),
            feature: map.get(KEY_FEATURE).and_then(json_label),
        }));
    }

    let feature = match map.get(KEY_FEATURE) {
        Some(Value::Null) | None => {
            if options.strict {
                return Err(RcaError::Rules(format!(
                    "rule node at '{}' has neither '{}' nor '{}'",
                    display_pointer(pointer),
                    KEY_PREDICTION,
                    KEY_FEATURE
                )));
            }
            return Ok(RuleNode::Empty);
        }
        Some(feature) => json_text(feature),
    };

    let child = |key: &str| -> Result<Option<Box<RuleNode>>> {
        match map.get(key) {
            Some(v) => Ok(Some(Box::new(parse_node(v, &child_pointer(pointer, key), options)?))),
            None => Ok(None),
        }
    };

    let mut branches: Vec<Branch> = Vec::new();
    for (label, child_value) in map {
        let upper = label.to_uppercase();
        let reserved = RESERVED_KEYS.contains(&upper.as_str());
        let verdict_label = upper == "OK" || upper == "NG";
        if reserved && !(verdict_label && options.route_verdict_labels) {
            if !matches!(
                label.as_str(),
                KEY_FEATURE | KEY_PASS | KEY_FAIL | KEY_DISABLE | KEY_ROOT_CAUSE
            ) {
                debug!(
                    "Ignoring reserved key '{}' at '{}'",
                    label,
                    display_pointer(pointer)
                );
            }
            continue;
        }

        let key = normalize(label.as_str());
        if let Some(previous) = branches.iter().find(|b| b.key == key) {
            if options.strict {
                return Err(RcaError::Rules(format!(
                    "branch labels '{}' and '{}' at '{}' both normalize to '{}'",
                    previous.label,
                    label,
                    display_pointer(pointer),
                    key
                )));
            }
            warn!(
                "Branch '{}' shadows '{}' at '{}' (both normalize to '{}')",
                label,
                previous.label,
                display_pointer(pointer),
                key
            );
        }

        branches.push(Branch {
            label: label.clone(),
            key,
            node: parse_node(child_value, &child_pointer(pointer, label), options)?,
        });
    }

    Ok(RuleNode::Feature(FeatureNode {
        feature,
        branches,
        pass: child(KEY_PASS)?,
        fail: child(KEY_FAIL)?,
        disable: child(KEY_DISABLE)?,
    }))
}

/// Text of a JSON scalar as rule documents spell it (`None`, `True`, `5.0`).
pub fn json_text(value: &Value) -> String {
    match value {
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(u) = n.as_u64() {
                u.to_string()
            } else {
                format_float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Like [`json_text`] but empty-ish values (null, false, 0, "", [], {}) count as absent.
pub(crate) fn json_label(value: &Value) -> Option<String> {
    let empty = match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    };
    if empty {
        None
    } else {
        Some(json_text(value))
    }
}

fn child_pointer(pointer: &str, key: &str) -> String {
    format!("{}/{}", pointer, key.replace('~', "~0").replace('/', "~1"))
}

fn display_pointer(pointer: &str) -> &str {
    if pointer.is_empty() {
        "/"
    } else {
        pointer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: Value) -> RuleNode {
        RuleNode::from_json(&value, RuleParseOptions::default()).unwrap()
    }

    #[test]
    fn test_prediction_wins_over_feature() {
        let node = parse(json!({"Prediction": "ng", "feature": "S1", "pass": {"Prediction": "OK"}}));
        match node {
            RuleNode::Prediction(p) => {
                assert_eq!(p.prediction, "ng");
                assert_eq!(p.feature.as_deref(), Some("S1"));
                assert_eq!(p.root_cause, None);
            }
            other => panic!("expected prediction node, got {:?}", other),
        }
    }

    #[test]
    fn test_feature_node_children() {
        let node = parse(json!({
            "feature": "Sensor",
            "A": {"Prediction": "OK"},
            "pass": {"Prediction": "OK"},
            "fail": {"Prediction": "NG"},
            "Disable": {"Prediction": "OK"},
            "root_cause": "ignored"
        }));
        let RuleNode::Feature(f) = node else {
            panic!("expected feature node");
        };
        assert_eq!(f.feature, "Sensor");
        assert_eq!(f.branches.len(), 1);
        assert_eq!(f.branches[0].label, "A");
        assert!(f.pass.is_some() && f.fail.is_some() && f.disable.is_some());
    }

    #[test]
    fn test_reserved_keys_are_case_insensitive() {
        let node = parse(json!({
            "feature": "S",
            "PASS": {"Prediction": "OK"},
            "Fail": {"Prediction": "NG"},
            "ok": {"Prediction": "OK"},
            "Ng": {"Prediction": "NG"}
        }));
        let RuleNode::Feature(f) = node else {
            panic!("expected feature node");
        };
        assert!(f.branches.is_empty());
        // Only the exact spellings act as fallbacks.
        assert!(f.pass.is_none());
        assert!(f.fail.is_none());
    }

    #[test]
    fn test_route_verdict_labels_admits_ok_ng() {
        let options = RuleParseOptions {
            route_verdict_labels: true,
            ..RuleParseOptions::default()
        };
        let node = RuleNode::from_json(
            &json!({"feature": "S", "OK": {"Prediction": "OK"}, "NG": {"Prediction": "NG"}}),
            options,
        )
        .unwrap();
        let RuleNode::Feature(f) = node else {
            panic!("expected feature node");
        };
        let labels: Vec<_> = f.branches.iter().map(|b| b.label.as_str()).collect();
        assert_eq!(labels, vec!["OK", "NG"]);
    }

    #[test]
    fn test_dead_end_and_malformed_nodes() {
        assert_eq!(parse(json!({"root_cause": "x"})), RuleNode::Empty);
        assert_eq!(parse(json!({"feature": null})), RuleNode::Empty);
        assert_eq!(parse(json!("OK")), RuleNode::Malformed);
        assert_eq!(parse(json!([1, 2])), RuleNode::Malformed);
    }

    #[test]
    fn test_strict_rejects_dead_ends() {
        let err = RuleNode::from_json(
            &json!({"feature": "S", "pass": {"root_cause": "x"}}),
            RuleParseOptions::strict(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("/pass"));

        let err = RuleNode::from_json(&json!({"feature": "S", "A": 3}), RuleParseOptions::strict())
            .unwrap_err();
        assert!(err.to_string().contains("/A"));
    }

    #[test]
    fn test_collision_last_write_wins_when_lenient() {
        let node = parse(json!({
            "feature": "S",
            "ab": {"Prediction": "OK"},
            "AB ": {"Prediction": "NG"}
        }));
        let RuleNode::Feature(f) = node else {
            panic!("expected feature node");
        };
        let branch = f.branch_for("ab").unwrap();
        assert_eq!(branch.label, "AB ");
    }

    #[test]
    fn test_collision_rejected_when_strict() {
        let result = RuleNode::from_json(
            &json!({"feature": "S", "ab": {"Prediction": "OK"}, "AB ": {"Prediction": "NG"}}),
            RuleParseOptions::strict(),
        );
        assert!(matches!(result, Err(RcaError::Rules(_))));
    }

    #[test]
    fn test_json_text_spelling() {
        assert_eq!(json_text(&json!(null)), "None");
        assert_eq!(json_text(&json!(true)), "True");
        assert_eq!(json_text(&json!(5)), "5");
        assert_eq!(json_text(&json!(5.0)), "5.0");
        assert_eq!(json_text(&json!("x")), "x");
    }

    #[test]
    fn test_empty_root_cause_counts_as_absent() {
        let node = parse(json!({"Prediction": "NG", "root_cause": ""}));
        let RuleNode::Prediction(p) = node else {
            panic!("expected prediction node");
        };
        assert_eq!(p.root_cause, None);
    }

    #[test]
    fn test_node_count() {
        let node = parse(json!({
            "feature": "A",
            "x": {"Prediction": "OK"},
            "fail": {"feature": "B", "pass": {"Prediction": "NG"}}
        }));
        assert_eq!(node.node_count(), 4);
    }
}
