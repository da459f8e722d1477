//! Prediction decoding.
//!
//! The inference backend pushes one JSON record per classification:
//! `{ "label": "person", "confidence": 0.92, "threat_status": "Threat" }`.
//!
//! Decoding is lenient per field and strict per record:
//! - missing or empty `label` becomes `"Unknown"`
//! - missing or non-numeric `confidence` becomes `0.0`; numbers are clamped to `[0, 1]`
//! - missing or unrecognized `threat_status` becomes `ThreatStatus::Unknown`, never `Normal`
//! - anything that is not a JSON object is a `DecodeError`

use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;

use crate::error::DecodeError;

pub const UNKNOWN_LABEL: &str = "Unknown";

/// Opaque payload handed over by a transport. Consumed by `decode`, never retained.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawMessage {
    bytes: Vec<u8>,
}

impl RawMessage {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl From<Vec<u8>> for RawMessage {
    fn from(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

impl From<String> for RawMessage {
    fn from(text: String) -> Self {
        Self {
            bytes: text.into_bytes(),
        }
    }
}

impl From<&str> for RawMessage {
    fn from(text: &str) -> Self {
        Self {
            bytes: text.as_bytes().to_vec(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ThreatStatus {
    Normal,
    Threat,
    Unknown,
}

impl ThreatStatus {
    /// Parse the wire value. Anything other than "threat"/"normal" is `Unknown`.
    pub fn from_wire(value: &str) -> Self {
        let value = value.trim();
        if value.eq_ignore_ascii_case("threat") {
            ThreatStatus::Threat
        } else if value.eq_ignore_ascii_case("normal") {
            ThreatStatus::Normal
        } else {
            ThreatStatus::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatStatus::Normal => "Normal",
            ThreatStatus::Threat => "Threat",
            ThreatStatus::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ThreatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated classification. Fields are private so the clamp cannot be bypassed.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Prediction {
    label: String,
    confidence: f64,
    threat_status: ThreatStatus,
}

impl Prediction {
    pub fn new(label: impl Into<String>, confidence: f64, threat_status: ThreatStatus) -> Self {
        let label = label.into();
        let label = if label.trim().is_empty() {
            UNKNOWN_LABEL.to_string()
        } else {
            label
        };
        Self {
            label,
            confidence: clamp_confidence(confidence),
            threat_status,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Always within `[0, 1]`.
    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn threat_status(&self) -> ThreatStatus {
        self.threat_status
    }

    pub fn is_threat(&self) -> bool {
        self.threat_status == ThreatStatus::Threat
    }
}

fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Decode a raw transport message into a `Prediction`.
///
/// Never panics. Field-level problems are replaced with defaults; only a
/// payload that is not a JSON object is rejected.
pub fn decode(raw: &RawMessage) -> Result<Prediction, DecodeError> {
    let value: Value = serde_json::from_slice(raw.as_bytes())?;
    let record = match value {
        Value::Object(record) => record,
        other => return Err(DecodeError::NotARecord(json_kind(&other))),
    };
    Ok(Prediction::new(
        read_label(&record),
        read_confidence(&record),
        read_threat_status(&record),
    ))
}

fn read_label(record: &Map<String, Value>) -> String {
    match record.get("label") {
        Some(Value::String(label)) if !label.trim().is_empty() => label.clone(),
        _ => UNKNOWN_LABEL.to_string(),
    }
}

fn read_confidence(record: &Map<String, Value>) -> f64 {
    record
        .get("confidence")
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
}

fn read_threat_status(record: &Map<String, Value>) -> ThreatStatus {
    match record.get("threat_status") {
        Some(Value::String(status)) => ThreatStatus::from_wire(status),
        _ => ThreatStatus::Unknown,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
