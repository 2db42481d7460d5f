//! Value normalization for rule matching.
//!
//! Cell values coming out of station tables are compared as text: every value
//! is stringified, trimmed and uppercased before it is looked up in a branch
//! table or in one of the fixed token vocabularies below.

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

lazy_static! {
    /// Tokens that read as a passing measurement.
    static ref TRUTHY_TOKENS: HashSet<&'static str> =
        ["1", "TRUE", "T", "YES", "Y", "ON", "PASS", "OK"].into_iter().collect();

    /// Tokens that read as a failing measurement. `___`, `E100000FFF` and `?`
    /// are what the test stations write for a broken sensor or a missing
    /// instrument, so they count as failures too.
    static ref FALSY_TOKENS: HashSet<&'static str> = [
        "0", "FALSE", "F", "NO", "N", "OFF", "FAIL", "NG", "___", "E100000FFF", "?",
    ]
    .into_iter()
    .collect();

    static ref DISABLE_TOKENS: HashSet<&'static str> =
        ["DISABLE", "OFF", "-1"].into_iter().collect();
}

/// A single scalar cell of a station table row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl CellValue {
    /// Null and NaN cells are treated as absent data.
    pub fn is_missing(&self) -> bool {
        match self {
            CellValue::Null => true,
            CellValue::Float(f) => f.is_nan(),
            _ => false,
        }
    }

    /// Text cells are trimmed, everything else is stringified as-is.
    pub fn clean_text(&self) -> String {
        match self {
            CellValue::Text(s) => s.trim().to_string(),
            other => other.to_string(),
        }
    }

    pub fn from_f32(value: f32) -> Self {
        // Go through the shortest f32 text so 0.1f32 stays "0.1" instead of
        // picking up the f64 widening noise.
        CellValue::Float(value.to_string().parse::<f64>().unwrap_or(value as f64))
    }

    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => CellValue::Null,
            serde_json::Value::Bool(b) => CellValue::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => CellValue::Int(i),
                None => CellValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => CellValue::Text(s.clone()),
            other => CellValue::Text(other.to_string()),
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Null => write!(f, "None"),
            CellValue::Bool(true) => write!(f, "True"),
            CellValue::Bool(false) => write!(f, "False"),
            CellValue::Int(i) => write!(f, "{}", i),
            CellValue::Float(x) => write!(f, "{}", format_float(*x)),
            CellValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        CellValue::Text(value.to_string())
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        CellValue::Text(value)
    }
}

impl From<i64> for CellValue {
    fn from(value: i64) -> Self {
        CellValue::Int(value)
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        CellValue::Float(value)
    }
}

impl From<bool> for CellValue {
    fn from(value: bool) -> Self {
        CellValue::Bool(value)
    }
}

/// Float text as the station exports write it: integral values keep a
/// trailing `.0`, very large or very small magnitudes switch to `1e+20` /
/// `1.5e-05` exponent notation.
pub fn format_float(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }

    let magnitude = value.abs();
    if magnitude != 0.0 && !(1e-4..1e16).contains(&magnitude) {
        let text = format!("{:e}", value);
        return match text.split_once('e') {
            Some((mantissa, exponent)) => {
                let exponent: i32 = exponent.parse().unwrap_or(0);
                let sign = if exponent < 0 { '-' } else { '+' };
                format!("{}e{}{:02}", mantissa, sign, exponent.abs())
            }
            None => text,
        };
    }

    if value.fract() == 0.0 {
        format!("{:.1}", value)
    } else {
        format!("{}", value)
    }
}

/// Stringify, trim and uppercase.
pub fn normalize<T: fmt::Display + ?Sized>(value: &T) -> String {
    value.to_string().trim().to_uppercase()
}

pub fn is_truthy<T: fmt::Display + ?Sized>(value: &T) -> bool {
    TRUTHY_TOKENS.contains(normalize(value).as_str())
}

pub fn is_falsy<T: fmt::Display + ?Sized>(value: &T) -> bool {
    FALSY_TOKENS.contains(normalize(value).as_str())
}

/// `DISABLE`, `OFF` and `-1` mark a check that was switched off at the station.
pub fn is_disable<T: fmt::Display + ?Sized>(value: &T) -> bool {
    DISABLE_TOKENS.contains(normalize(value).as_str())
}
