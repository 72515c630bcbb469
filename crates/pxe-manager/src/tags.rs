//! Capability tags and the filter that matches them against requests.
//!
//! Numeric request values are capability floors: a resource matches when its
//! advertised value is greater than or equal to the requested one. The
//! `memory` tag is special-cased because reported byte counts always come in
//! a little under the nominal size, so the advertised value is discounted by
//! 10% before comparing. Every other kind of value must match exactly.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// Tag key whose advertised value is discounted before comparison.
pub const MEMORY_TAG: &str = "memory";

/// Advertised memory is multiplied by `NUMERATOR / DENOMINATOR` before it is
/// compared against a request.
const MEMORY_FUDGE_NUMERATOR: i128 = 9;
const MEMORY_FUDGE_DENOMINATOR: i128 = 10;

/// Attribute map attached to a resource or a request.
pub type Tags = BTreeMap<String, TagValue>;

/// A single tag value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    /// Boolean flag (e.g. `raid: true`).
    Bool(bool),
    /// Integer capability (core count, bytes of memory, link speed).
    Integer(i64),
    /// Fractional capability.
    Float(f64),
    /// Free-form label (e.g. `vendor: "dell"`).
    String(String),
}

impl TagValue {
    /// Whether the value takes part in capability (`>=`) matching.
    #[must_use]
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Integer(_) | Self::Float(_))
    }

    #[allow(clippy::cast_precision_loss)]
    fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::Bool(_) | Self::String(_) => None,
        }
    }

    /// Convert a JSON value, returning `None` for kinds tags cannot hold
    /// (arrays, objects, null).
    #[must_use]
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(Self::Bool(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Self::Integer)
                .or_else(|| n.as_f64().map(Self::Float)),
            serde_json::Value::String(s) => Some(Self::String(s.clone())),
            _ => None,
        }
    }

    /// Parse a command-line value.
    ///
    /// Accepts booleans, integers, floats and integer sizes with a binary
    /// suffix (`16GiB`, `512MiB`); anything else is kept as a string.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        match raw {
            "true" => return Self::Bool(true),
            "false" => return Self::Bool(false),
            _ => {}
        }
        if let Ok(i) = raw.parse::<i64>() {
            return Self::Integer(i);
        }
        if let Some(bytes) = parse_binary_size(raw) {
            return Self::Integer(bytes);
        }
        match raw.parse::<f64>() {
            Ok(f) if f.is_finite() => Self::Float(f),
            _ => Self::String(raw.to_string()),
        }
    }
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<&str> for TagValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<i64> for TagValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<bool> for TagValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

fn parse_binary_size(raw: &str) -> Option<i64> {
    const UNITS: [(&str, i64); 4] = [
        ("KiB", 1 << 10),
        ("MiB", 1 << 20),
        ("GiB", 1 << 30),
        ("TiB", 1 << 40),
    ];
    UNITS.iter().find_map(|(suffix, scale)| {
        raw.strip_suffix(suffix)
            .and_then(|n| n.trim().parse::<i64>().ok())
            .and_then(|n| n.checked_mul(*scale))
    })
}

/// Parse a `key=value` pair as given on the command line.
///
/// # Errors
/// Returns the offending input when there is no `=` or the key is empty.
pub fn parse_pair(raw: &str) -> Result<(String, TagValue), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), TagValue::parse(value)))
        }
        _ => Err(format!("expected key=value, got '{raw}'")),
    }
}

/// Decode a tag map, silently dropping values that are not scalars.
///
/// The datastore holds hand-curated documents that sometimes carry nested
/// structures (interface lists) under `tags`; those can never satisfy a
/// request so they are skipped rather than failing the whole document.
///
/// # Errors
/// Propagates errors from the underlying deserializer.
pub fn deserialize_lenient<'de, D>(deserializer: D) -> Result<Tags, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<BTreeMap<String, serde_json::Value>>::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(key, value)| TagValue::from_json(&value).map(|tag| (key, tag)))
        .collect())
}

/// Check whether a resource's tags satisfy every requested tag.
///
/// An empty request matches everything. A resource missing a requested key
/// never matches.
#[must_use]
pub fn matches(resource: &Tags, requested: &Tags) -> bool {
    requested.iter().all(|(key, want)| {
        resource
            .get(key)
            .is_some_and(|have| satisfies(key, have, want))
    })
}

fn satisfies(key: &str, have: &TagValue, want: &TagValue) -> bool {
    if !want.is_numeric() {
        return have == want;
    }

    let memory = key == MEMORY_TAG;
    match (have, want) {
        (TagValue::Integer(have), TagValue::Integer(want)) => {
            if memory {
                i128::from(*have) * MEMORY_FUDGE_NUMERATOR
                    >= i128::from(*want) * MEMORY_FUDGE_DENOMINATOR
            } else {
                have >= want
            }
        }
        _ => match (have.as_f64(), want.as_f64()) {
            (Some(have), Some(want)) => {
                let have = if memory { have * 0.9 } else { have };
                have >= want
            }
            _ => false,
        },
    }
}
