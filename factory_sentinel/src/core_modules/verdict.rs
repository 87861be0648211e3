// THEORY:
// The `verdict` module turns a classifier's free-form reply into a structured
// `Verdict`. Backends wrap their JSON in markdown fences, vary the key casing
// and sometimes rename keys altogether, so decoding happens in three steps:
//
// 1.  **Unwrap**: strip fenced-code markers and surrounding whitespace.
// 2.  **Normalize**: parse as JSON and rewrite every key through `KEY_ALIASES`
//     (lower-cased lookup) to one canonical name. This table is the only place
//     where naming variants are known.
// 3.  **Extract**: read status, issue and confidence from canonical keys.
//
// A reply that fails any step is a `DecodeError`. There is no default verdict:
// an unreadable reply is "no verdict", never SAFE and never DANGER.

use crate::error::DecodeError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Fence markers stripped before parsing, longest first.
const FENCE_MARKERS: [&str; 3] = ["```json", "```JSON", "```"];

/// Lower-cased key variant -> canonical key.
pub const KEY_ALIASES: &[(&str, &str)] = &[
    ("status", "status"),
    ("verdict", "status"),
    ("state", "status"),
    ("issue", "issue"),
    ("violation", "issue"),
    ("description", "issue"),
    ("reason", "issue"),
    ("confidence", "confidence"),
    ("conf", "confidence"),
    ("score", "confidence"),
    ("timestamp", "timestamp"),
    ("time", "timestamp"),
    ("location", "location"),
];

/// Issue text used when a DANGER reply does not say what the danger is.
pub const UNKNOWN_ISSUE: &str = "Unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SafetyStatus {
    Safe,
    Danger,
}

impl SafetyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyStatus::Safe => "SAFE",
            SafetyStatus::Danger => "DANGER",
        }
    }

    fn parse(raw: &str) -> Result<Self, DecodeError> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "SAFE" => Ok(SafetyStatus::Safe),
            "DANGER" => Ok(SafetyStatus::Danger),
            _ => Err(DecodeError::UnknownStatus(raw.to_string())),
        }
    }
}

impl std::fmt::Display for SafetyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured safety judgment for one frame.
///
/// `issue` is present exactly when the status is `Danger`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    status: SafetyStatus,
    issue: Option<String>,
    confidence: Option<u8>,
}

impl Verdict {
    pub fn safe(confidence: Option<u8>) -> Self {
        Self {
            status: SafetyStatus::Safe,
            issue: None,
            confidence: confidence.map(|c| c.min(100)),
        }
    }

    pub fn danger(issue: impl Into<String>, confidence: Option<u8>) -> Self {
        let issue = issue.into();
        let issue = if issue.trim().is_empty() {
            UNKNOWN_ISSUE.to_string()
        } else {
            issue.trim().to_string()
        };
        Self {
            status: SafetyStatus::Danger,
            issue: Some(issue),
            confidence: confidence.map(|c| c.min(100)),
        }
    }

    pub fn status(&self) -> SafetyStatus {
        self.status
    }

    pub fn issue(&self) -> Option<&str> {
        self.issue.as_deref()
    }

    pub fn confidence(&self) -> Option<u8> {
        self.confidence
    }

    pub fn is_danger(&self) -> bool {
        self.status == SafetyStatus::Danger
    }

    /// Decodes a raw backend reply. Pure.
    pub fn decode(raw: &str) -> Result<Self, DecodeError> {
        let payload = strip_fences(raw);
        let value: Value = serde_json::from_str(payload)?;
        let Value::Object(map) = value else {
            return Err(DecodeError::NotAnObject);
        };
        let fields = normalize_keys(map);

        let status = match fields.get("status") {
            Some(Value::String(s)) => SafetyStatus::parse(s)?,
            Some(other) => return Err(DecodeError::UnknownStatus(other.to_string())),
            None => return Err(DecodeError::MissingStatus),
        };
        let confidence = fields.get("confidence").and_then(parse_confidence);

        Ok(match status {
            SafetyStatus::Safe => Verdict::safe(confidence),
            SafetyStatus::Danger => {
                let issue = fields
                    .get("issue")
                    .and_then(Value::as_str)
                    .unwrap_or(UNKNOWN_ISSUE);
                Verdict::danger(issue, confidence)
            }
        })
    }
}

/// Removes markdown fence markers and trims what is left.
pub fn strip_fences(raw: &str) -> &str {
    let mut text = raw.trim();
    for marker in FENCE_MARKERS {
        if let Some(rest) = text.strip_prefix(marker) {
            text = rest.trim_start();
            break;
        }
    }
    if let Some(rest) = text.strip_suffix("```") {
        text = rest.trim_end();
    }
    text
}

/// Maps a key to its canonical name, or `None` when it is not in the table.
pub fn canonical_key(key: &str) -> Option<&'static str> {
    let lowered = key.trim().to_ascii_lowercase();
    KEY_ALIASES
        .iter()
        .find(|(alias, _)| *alias == lowered)
        .map(|(_, canonical)| *canonical)
}

/// Rewrites keys through the alias table. Unknown keys are dropped. A key
/// spelled with its canonical name always beats an alias of it; among aliases
/// alone, the first in key order wins.
pub fn normalize_keys(map: Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::with_capacity(map.len());
    let mut exact: Vec<&'static str> = Vec::new();
    for (key, value) in map {
        let Some(canonical) = canonical_key(&key) else { continue };
        if key.trim().eq_ignore_ascii_case(canonical) {
            if !exact.contains(&canonical) {
                exact.push(canonical);
                out.insert(canonical.to_string(), value);
            }
        } else if !exact.contains(&canonical) {
            out.entry(canonical.to_string()).or_insert(value);
        }
    }
    out
}

fn parse_confidence(value: &Value) -> Option<u8> {
    let number = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().trim_end_matches('%').trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !number.is_finite() {
        return None;
    }
    Some(number.round().clamp(0.0, 100.0) as u8)
}
