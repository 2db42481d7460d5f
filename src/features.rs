//! Feature collection and column coverage checks for rule trees.

use crate::rule_tree::{
    json_label, KEY_DISABLE, KEY_FAIL, KEY_FEATURE, KEY_PASS, KEY_PREDICTION, KEY_ROOT_CAUSE,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use strsim::jaro_winkler;

/// Keys whose mapping values are never descended. Matched case-sensitively,
/// so `"ok"` or `"Pass"` children are still searched.
const SKIPPED_KEYS: [&str; 5] = [KEY_FEATURE, KEY_PREDICTION, KEY_ROOT_CAUSE, "OK", "NG"];

/// Add every `feature` referenced anywhere in a rule tree (or list of trees) to `out`.
///
/// Works on the document as written rather than the parsed tree: fallback
/// children are searched even under prediction nodes, lists are flattened,
/// and any other mapping-valued key counts as a subtree.
pub fn collect_features(rule: &Value, out: &mut BTreeSet<String>) {
    let map = match rule {
        Value::Array(rules) => {
            for rule in rules {
                collect_features(rule, out);
            }
            return;
        }
        Value::Object(map) => map,
        _ => return,
    };

    if let Some(feature) = map.get(KEY_FEATURE).and_then(json_label) {
        out.insert(feature);
    }
    for (key, child) in map {
        if matches!(key.as_str(), KEY_PASS | KEY_FAIL | KEY_DISABLE) {
            collect_features(child, out);
        } else if child.is_object() && !SKIPPED_KEYS.contains(&key.as_str()) {
            collect_features(child, out);
        }
    }
}

/// Features referenced by a single tree or rules list.
pub fn rule_features(rule: &Value) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    collect_features(rule, &mut out);
    out
}

/// Features referenced by any of several rules values.
pub fn collect_features_all<'a, I>(rules: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a Value>,
{
    let mut out = BTreeSet::new();
    for rule in rules {
        collect_features(rule, &mut out);
    }
    out
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissingColumn {
    pub feature: String,
    /// Closest table column, when one is similar enough.
    pub suggestion: Option<String>,
    pub similarity: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnCoverage {
    pub present: Vec<String>,
    pub missing: Vec<MissingColumn>,
}

impl ColumnCoverage {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Checks which rule features a table provides, suggesting near-miss column names.
pub struct CoverageChecker {
    /// Similarity threshold (0.0-1.0) for offering a suggestion
    pub similarity_threshold: f64,
}

impl Default for CoverageChecker {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.85,
        }
    }
}

impl CoverageChecker {
    pub fn new(threshold: f64) -> Self {
        Self {
            similarity_threshold: threshold,
        }
    }

    pub fn check<S: AsRef<str>>(&self, features: &BTreeSet<String>, columns: &[S]) -> ColumnCoverage {
        let mut coverage = ColumnCoverage::default();
        for feature in features {
            if columns.iter().any(|c| c.as_ref() == feature) {
                coverage.present.push(feature.clone());
                continue;
            }

            let wanted = feature.to_lowercase();
            let best = columns
                .iter()
                .map(|c| (c.as_ref(), jaro_winkler(&wanted, &c.as_ref().to_lowercase())))
                .fold(None, |best: Option<(&str, f64)>, candidate| match best {
                    Some(b) if b.1 >= candidate.1 => Some(b),
                    _ => Some(candidate),
                });

            let (suggestion, similarity) = match best {
                Some((column, score)) if score >= self.similarity_threshold => {
                    (Some(column.to_string()), score)
                }
                Some((_, score)) => (None, score),
                None => (None, 0.0),
            };
            coverage.missing.push(MissingColumn {
                feature: feature.clone(),
                suggestion,
                similarity,
            });
        }
        coverage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn names(features: BTreeSet<String>) -> Vec<String> {
        features.into_iter().collect()
    }

    #[test]
    fn test_collects_nested_pass_fail_chains() {
        let tree = json!({
            "feature": "A",
            "pass": {
                "feature": "B",
                "fail": {"feature": "C", "pass": {"Prediction": "OK"}},
                "pass": {"Prediction": "OK"}
            },
            "fail": {"feature": "C", "Disable": {"Prediction": "NG"}}
        });
        assert_eq!(names(rule_features(&tree)), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_collects_exact_branch_children() {
        let tree = json!({
            "feature": "Mode",
            "Auto": {"feature": "Pressure", "pass": {"Prediction": "OK"}},
            "Manual": {"Prediction": "NG", "feature": "Operator"}
        });
        assert_eq!(names(rule_features(&tree)), vec!["Mode", "Operator", "Pressure"]);
    }

    #[test]
    fn test_odd_cased_keys_are_searched() {
        let tree = json!({
            "feature": "A",
            "ok": {"feature": "B"},
            "Pass": {"feature": "C"},
            "pass": {"Prediction": "NG", "fail": {"feature": "D"}}
        });
        assert_eq!(names(rule_features(&tree)), vec!["A", "B", "C", "D"]);
    }

    #[test]
    fn test_verdict_labels_are_never_searched() {
        let tree = json!({
            "feature": "A",
            "NG": {"feature": "Z"},
            "OK": {"feature": "Y"},
            "root_cause": {"feature": "W"}
        });
        assert_eq!(names(rule_features(&tree)), vec!["A"]);
    }

    #[test]
    fn test_lists_under_fallbacks_are_flattened() {
        let tree = json!({
            "feature": "A",
            "pass": [{"feature": "B"}, {"feature": "C", "fail": [{"feature": "D"}]}],
            "Disable": [{"Prediction": "OK", "feature": "E"}],
            "Auto": [{"feature": "Ignored"}]
        });
        assert_eq!(names(rule_features(&tree)), vec!["A", "B", "C", "D", "E"]);
    }

    #[test]
    fn test_falsy_features_are_skipped() {
        let tree = json!({"feature": "", "pass": {"feature": null, "fail": {"feature": "B"}}});
        assert_eq!(names(rule_features(&tree)), vec!["B"]);
    }

    #[test]
    fn test_collects_across_list() {
        let rules = vec![
            json!([{"feature": "X", "pass": {"Prediction": "OK"}}]),
            json!({"feature": "Y"}),
            json!("not a node"),
        ];
        assert_eq!(names(collect_features_all(&rules)), vec!["X", "Y"]);
    }

    #[test]
    fn test_coverage_suggests_close_columns() {
        let features: BTreeSet<String> = ["Pressure", "Torque_1"].iter().map(|s| s.to_string()).collect();
        let columns = vec!["Pressure", "Torque1", "Date_Time"];
        let coverage = CoverageChecker::default().check(&features, &columns);
        assert_eq!(coverage.present, vec!["Pressure".to_string()]);
        assert_eq!(coverage.missing.len(), 1);
        assert_eq!(coverage.missing[0].suggestion.as_deref(), Some("Torque1"));
        assert!(!coverage.is_complete());
    }

    #[test]
    fn test_coverage_without_close_match() {
        let features: BTreeSet<String> = ["Voltage"].iter().map(|s| s.to_string()).collect();
        let coverage = CoverageChecker::default().check(&features, &["Serial", "Date_Time"]);
        assert_eq!(coverage.missing[0].suggestion, None);
    }
}
