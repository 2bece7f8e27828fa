//! Topic-based classification of inbound scanner messages.
//!
//! Turns a `(topic, payload)` pair published under the presence topic into a
//! typed event. Anything malformed or unrecognized is dropped (`None`); the
//! classifier never fails.

use serde::Deserialize;
use serde_json::Value;

use crate::types::{DeviceKind, ScanPhase};
use crate::util::normalize_id;

/// Classification result for an inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// Informational scanner status, logged only.
    ScannerStatus { location: String, text: String },
    /// A scanner started or finished a scan.
    ScanLifecycle {
        location: String,
        identity: Option<String>,
        phase: ScanPhase,
    },
    /// A device was seen with some confidence at a location.
    DeviceSeen(DeviceSighting),
}

impl InboundEvent {
    /// Short label used in log lines.
    pub fn label(&self) -> &'static str {
        match self {
            Self::ScannerStatus { .. } => "scanner_status",
            Self::ScanLifecycle { .. } => "scan_lifecycle",
            Self::DeviceSeen(_) => "device_seen",
        }
    }
}

/// A single device sighting reported by a scanner.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSighting {
    pub location: String,
    pub mac: String,
    pub kind: DeviceKind,
    pub name: Option<String>,
    pub confidence: u8,
}

/// Wire format of a device sighting payload.
#[derive(Deserialize)]
struct RawSighting {
    #[serde(rename = "type", default)]
    device_type: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    confidence: Option<Value>,
}

/// Classify a message published on `topic`.
///
/// Recognized layouts:
/// - `{presence_topic}/{location}/status`
/// - `{presence_topic}/{location}/scan/{start|end}` (also `{location}/{start|end}`)
/// - `{presence_topic}/{location}/{radio_id}`
pub fn classify(
    presence_topic: &str,
    unknown_name: &str,
    topic: &str,
    payload: &str,
) -> Option<InboundEvent> {
    if payload.trim().is_empty() {
        return None;
    }

    let segments: Vec<&str> = topic.split('/').collect();
    if segments.first() != Some(&presence_topic) {
        return None;
    }

    match segments.as_slice() {
        // Our own outbound scan requests echo back on `{presence_topic}/scan/{kind}`
        [_, "scan", _] => None,
        [_, location, "status"] => Some(InboundEvent::ScannerStatus {
            location: normalize_id(location),
            text: parse_status(payload),
        }),
        [_, location, "start"] | [_, location, "scan", "start"] => {
            parse_lifecycle(location, payload, ScanPhase::Start)
        }
        [_, location, "end"] | [_, location, "scan", "end"] => {
            parse_lifecycle(location, payload, ScanPhase::End)
        }
        [_, location, mac] if !location.is_empty() && !mac.is_empty() => {
            parse_sighting(location, mac, payload, unknown_name).map(InboundEvent::DeviceSeen)
        }
        _ => None,
    }
}

/// Status payloads are either plain text or `{"status": "..."}`.
fn parse_status(payload: &str) -> String {
    match serde_json::from_str::<Value>(payload) {
        Ok(Value::Object(map)) => match map.get("status") {
            Some(Value::String(s)) => s.clone(),
            _ => payload.trim().to_string(),
        },
        _ => payload.trim().to_string(),
    }
}

fn parse_lifecycle(location: &str, payload: &str, phase: ScanPhase) -> Option<InboundEvent> {
    let value: Value = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(e) => {
            log::debug!("Dropping scan {:?} message from {}: {}", phase, location, e);
            return None;
        }
    };
    let identity = match &value {
        Value::Object(map) => map.get("identity").and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }),
        _ => return None,
    };
    Some(InboundEvent::ScanLifecycle {
        location: normalize_id(location),
        identity,
        phase,
    })
}

fn parse_sighting(
    location: &str,
    mac: &str,
    payload: &str,
    unknown_name: &str,
) -> Option<DeviceSighting> {
    let raw: RawSighting = match serde_json::from_str(payload) {
        Ok(raw) => raw,
        Err(e) => {
            log::debug!("Dropping sighting of {} at {}: {}", mac, location, e);
            return None;
        }
    };

    let kind = match raw.device_type.as_deref() {
        Some("KNOWN_MAC") => DeviceKind::Known,
        Some("GENERIC_BEACON") => DeviceKind::Beacon,
        _ => return None,
    };

    let name = raw
        .name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty());

    if kind == DeviceKind::Known && name.as_deref() == Some(unknown_name) {
        return None;
    }

    let confidence = raw.confidence.as_ref().and_then(parse_confidence)?;

    Some(DeviceSighting {
        location: normalize_id(location),
        mac: mac.to_string(),
        kind,
        name,
        confidence,
    })
}

/// Scanners send confidence either as a number or as a numeric string.
/// Values outside 0-100 are invalid.
fn parse_confidence(value: &Value) -> Option<u8> {
    let number = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !(0.0..=100.0).contains(&number) {
        return None;
    }
    Some(number.round() as u8)
}
