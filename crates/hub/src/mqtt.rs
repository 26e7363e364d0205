//! MQTT message handling: topic parsing, payload decode, identity check.
//!
//! The subscriber feeds raw publishes through [`decode_reading`]; every
//! failure maps to exactly one drop reason so the pipeline counters stay
//! honest.  Validation order: size guard → JSON decode → topic/payload
//! identity → schema and range invariants → quality rules.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::QualitySettings;
use crate::reading::{FieldError, Reading, ReadingPayload, ReadingRejection};

/// Anything larger than this is not a sensor reading.  A normal payload is
/// a few hundred bytes.
pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Drop reasons
// ---------------------------------------------------------------------------

/// Why an incoming publish never reached the buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum DropReason {
    /// Payload is not decodable JSON for the reading shape.
    MalformedPayload(String),
    /// Decoded fine, but violates a schema/range invariant.
    InvalidReading(FieldError),
    /// Cross-field quality rule rejected it.
    QualityCheckFailed(String),
    /// machineId in the payload contradicts the topic segment.
    IdentityMismatch { topic_id: String, payload_id: String },
}

impl DropReason {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedPayload(_) => "malformed_payload",
            Self::InvalidReading(_) => "invalid_reading",
            Self::QualityCheckFailed(_) => "quality_check_failed",
            Self::IdentityMismatch { .. } => "identity_mismatch",
        }
    }
}

// ---------------------------------------------------------------------------
// Topic helpers
// ---------------------------------------------------------------------------

/// Extract the machine id from "machine/<id>/data".  Topics of any other
/// shape carry no identity claim.
pub fn extract_machine_id(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "machine" && parts[2] == "data" && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Decode + validate
// ---------------------------------------------------------------------------

/// Turn a raw publish into a validated [`Reading`], or say exactly why not.
pub fn decode_reading(
    topic: &str,
    payload: &[u8],
    quality: &QualitySettings,
    now: DateTime<Utc>,
) -> Result<Reading, DropReason> {
    if payload.len() > MAX_PAYLOAD_BYTES {
        return Err(DropReason::MalformedPayload(format!(
            "payload of {} bytes exceeds {MAX_PAYLOAD_BYTES} byte limit",
            payload.len()
        )));
    }

    let decoded: ReadingPayload = serde_json::from_slice(payload)
        .map_err(|e| DropReason::MalformedPayload(e.to_string()))?;

    if let Some(topic_id) = extract_machine_id(topic) {
        if topic_id != decoded.machine_id {
            return Err(DropReason::IdentityMismatch {
                topic_id: topic_id.to_string(),
                payload_id: decoded.machine_id,
            });
        }
    }

    decoded.validate(now, quality).map_err(|e| match e {
        ReadingRejection::Invalid(field) => DropReason::InvalidReading(field),
        ReadingRejection::Quality(msg) => DropReason::QualityCheckFailed(msg),
    })
}

// ---------------------------------------------------------------------------
// Reconnect backoff
// ---------------------------------------------------------------------------

pub const RECONNECT_INITIAL: Duration = Duration::from_secs(1);
pub const RECONNECT_MAX: Duration = Duration::from_secs(60);

/// Exponential backoff with ±20% jitter: 1s, 2s, 4s … capped at 60s.
/// The jitter keeps a fleet of hubs from reconnecting in lockstep.
pub fn reconnect_backoff(attempt: u32) -> Duration {
    let base = RECONNECT_INITIAL
        .checked_mul(2u32.saturating_pow(attempt.min(6)))
        .unwrap_or(RECONNECT_MAX)
        .min(RECONNECT_MAX);
    let jitter = 0.8 + 0.4 * fastrand::f64();
    Duration::from_secs_f64(base.as_secs_f64() * jitter)
}

// ===========================================================================
// Tests
// ===========================================================================
