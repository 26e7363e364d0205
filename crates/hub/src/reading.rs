//! Reading wire types and semantic validation.
//!
//! A reading arrives as a camelCase JSON object (MQTT payload or POST /data
//! body), is range-checked against the documented sensor envelopes, then
//! passed through the cross-field quality rules before it may enter the
//! ingest buffer.  A reading is never persisted partially: it either passes
//! every check or is dropped whole.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::config::QualitySettings;

/// Device clocks may run ahead of ours by at most this much.
pub const CLOCK_SKEW_TOLERANCE_S: i64 = 300;

pub const MAX_MACHINE_ID_LEN: usize = 50;
pub const MAX_LOCATION_LEN: usize = 100;

// ---------------------------------------------------------------------------
// Machine status
// ---------------------------------------------------------------------------

/// Status as reported by the device.  Authoritative — ingestion never
/// rewrites it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MachineStatus {
    Running,
    Idle,
    Warning,
    Critical,
}

impl MachineStatus {
    /// Parse a status path/query token, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "RUNNING" => Some(Self::Running),
            "IDLE" => Some(Self::Idle),
            "WARNING" => Some(Self::Warning),
            "CRITICAL" => Some(Self::Critical),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Idle => "IDLE",
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
        }
    }
}

// ---------------------------------------------------------------------------
// Wire payload
// ---------------------------------------------------------------------------

/// Raw decoded JSON shape.  Unknown fields are ignored; everything here is
/// as sent by the device, before semantic validation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingPayload {
    pub machine_id: String,
    #[serde(deserialize_with = "deserialize_utc")]
    pub timestamp: DateTime<Utc>,
    pub temperature: f64,
    pub vibration: f64,
    #[serde(default)]
    pub pressure: Option<f64>,
    #[serde(default)]
    pub humidity: Option<f64>,
    #[serde(default)]
    pub power_consumption: Option<f64>,
    #[serde(default)]
    pub rotation_speed: Option<f64>,
    pub status: MachineStatus,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Accepts ISO-8601 without timezone (treated as UTC, per the wire
/// contract) as well as RFC3339 with an offset, normalized to UTC.
fn deserialize_utc<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_utc(&raw).map_err(serde::de::Error::custom)
}

pub fn parse_utc(raw: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|_| format!("not an ISO-8601 timestamp: '{raw}'"))
}

// ---------------------------------------------------------------------------
// Validated reading
// ---------------------------------------------------------------------------

/// A reading that has passed every invariant and is eligible for
/// persistence.  Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    pub machine_id: String,
    pub timestamp: DateTime<Utc>,
    pub temperature: f64,
    pub vibration: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pressure: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power_consumption: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation_speed: Option<f64>,
    pub status: MachineStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Rejection reasons
// ---------------------------------------------------------------------------

/// A single-field invariant violation.  The message is field-scoped so the
/// HTTP surface can return it verbatim.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FieldError {
    #[error("machineId: {0}")]
    MachineId(String),
    #[error("timestamp: more than {CLOCK_SKEW_TOLERANCE_S}s in the future")]
    FutureTimestamp,
    #[error("{field}: {value} outside {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("location: exceeds {MAX_LOCATION_LEN} characters")]
    LocationTooLong,
}

/// Why a decoded payload was refused.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReadingRejection {
    #[error("{0}")]
    Invalid(FieldError),
    #[error("quality check failed: {0}")]
    Quality(String),
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn check_machine_id(id: &str) -> Result<(), FieldError> {
    if id.is_empty() || id.len() > MAX_MACHINE_ID_LEN {
        return Err(FieldError::MachineId(format!(
            "length must be 1..={MAX_MACHINE_ID_LEN}"
        )));
    }
    let mut chars = id.chars();
    if !chars.next().is_some_and(|c| c.is_ascii_uppercase()) {
        return Err(FieldError::MachineId(
            "must start with an uppercase letter".into(),
        ));
    }
    if !chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '-') {
        return Err(FieldError::MachineId(
            "only A-Z, 0-9 and '-' are allowed".into(),
        ));
    }
    Ok(())
}

/// NaN fails every range check by construction.
fn check_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), FieldError> {
    if value >= min && value <= max {
        Ok(())
    } else {
        Err(FieldError::OutOfRange {
            field,
            value,
            min,
            max,
        })
    }
}

fn check_optional(
    field: &'static str,
    value: Option<f64>,
    min: f64,
    max: f64,
) -> Result<(), FieldError> {
    match value {
        Some(v) => check_range(field, v, min, max),
        None => Ok(()),
    }
}

impl ReadingPayload {
    /// Apply every §-invariant plus the cross-field quality rules.  `now`
    /// is the validation instant, used for the clock-skew bound.
    pub fn validate(
        self,
        now: DateTime<Utc>,
        quality: &QualitySettings,
    ) -> Result<Reading, ReadingRejection> {
        check_machine_id(&self.machine_id).map_err(ReadingRejection::Invalid)?;

        if (self.timestamp - now).num_seconds() > CLOCK_SKEW_TOLERANCE_S {
            return Err(ReadingRejection::Invalid(FieldError::FutureTimestamp));
        }

        check_range("temperature", self.temperature, -50.0, 200.0)
            .map_err(ReadingRejection::Invalid)?;
        check_range("vibration", self.vibration, 0.0, 1.0).map_err(ReadingRejection::Invalid)?;
        check_optional("pressure", self.pressure, 0.0, 10.0).map_err(ReadingRejection::Invalid)?;
        check_optional("humidity", self.humidity, 0.0, 100.0).map_err(ReadingRejection::Invalid)?;
        check_optional("powerConsumption", self.power_consumption, 0.0, 10_000.0)
            .map_err(ReadingRejection::Invalid)?;
        check_optional("rotationSpeed", self.rotation_speed, 0.0, 5_000.0)
            .map_err(ReadingRejection::Invalid)?;

        if let Some(loc) = &self.location {
            if loc.chars().count() > MAX_LOCATION_LEN {
                return Err(ReadingRejection::Invalid(FieldError::LocationTooLong));
            }
        }

        // Cross-field quality heuristics.  These catch devices reporting a
        // status their own sensors contradict; they never block a valid
        // anomaly reading (a genuinely hot CRITICAL machine passes).
        if quality.enabled {
            if self.status == MachineStatus::Critical
                && self.temperature < quality.critical_min_temperature
                && self.vibration < quality.critical_min_vibration
            {
                return Err(ReadingRejection::Quality(format!(
                    "status CRITICAL but temperature {:.1} < {:.1} and vibration {:.2} < {:.2}",
                    self.temperature,
                    quality.critical_min_temperature,
                    self.vibration,
                    quality.critical_min_vibration,
                )));
            }
            if self.status == MachineStatus::Idle && self.temperature > quality.idle_max_temperature
            {
                return Err(ReadingRejection::Quality(format!(
                    "status IDLE but temperature {:.1} > {:.1}",
                    self.temperature, quality.idle_max_temperature,
                )));
            }
        }

        Ok(Reading {
            machine_id: self.machine_id,
            timestamp: self.timestamp,
            temperature: self.temperature,
            vibration: self.vibration,
            pressure: self.pressure,
            humidity: self.humidity,
            power_consumption: self.power_consumption,
            rotation_speed: self.rotation_speed,
            status: self.status,
            location: self.location,
            metadata: self.metadata,
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
