//! The sensor reading record and its wire format.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::format_description::well_known::{Iso8601, Rfc3339};
use time::{OffsetDateTime, PrimitiveDateTime};

/// Errors from building or decoding a record. Malformed records are never retried.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum RecordError {
    #[error("error decoding record: {0}")]
    Decode(String),
    #[error("error encoding record: {0}")]
    Encode(String),
    #[error("sensor id must not be empty")]
    EmptySensorId,
    #[error("record value must be a finite number, got {0}")]
    NonFinite(f64),
    #[error("invalid ISO 8601 timestamp {value}: {reason}")]
    Timestamp { value: String, reason: String },
}

/// A single sensor reading.
///
/// The wire format is JSON: `{"sensorId": "...", "value": <number>, "timestamp": "<ISO 8601>"}`.
/// Records built here always carry an RFC 3339 timestamp. Decoded timestamps may omit the offset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PipelineRecord {
    sensor_id: String,
    value: f64,
    timestamp: String,
}

impl PipelineRecord {
    /// Create a new record.
    pub fn new(sensor_id: impl Into<String>, value: f64, timestamp: OffsetDateTime) -> Result<Self, RecordError> {
        let timestamp = timestamp.format(&Rfc3339).map_err(|err| RecordError::Timestamp {
            value: timestamp.to_string(),
            reason: err.to_string(),
        })?;
        let record = Self {
            sensor_id: sensor_id.into(),
            value,
            timestamp,
        };
        record.validate()?;
        Ok(record)
    }

    /// Decode a record from its wire format.
    pub fn decode(payload: &[u8]) -> Result<Self, RecordError> {
        let record: Self = serde_json::from_slice(payload).map_err(|err| RecordError::Decode(err.to_string()))?;
        record.validate()?;
        Ok(record)
    }

    /// Encode this record to its wire format.
    pub fn encode(&self) -> Result<Bytes, RecordError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|err| RecordError::Encode(err.to_string()))
    }

    pub fn sensor_id(&self) -> &str {
        &self.sensor_id
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    /// A copy of this record carrying a different value.
    pub fn with_value(&self, value: f64) -> Result<Self, RecordError> {
        let record = Self { value, ..self.clone() };
        record.validate()?;
        Ok(record)
    }

    /// The archive key of this record.
    ///
    /// The key is derived from the record's content only, so redelivered duplicates overwrite
    /// the same archive entry.
    pub fn archive_key(&self) -> String {
        let digest = seahash::hash(format!("{}\u{1f}{}\u{1f}{}", self.sensor_id, self.value, self.timestamp).as_bytes());
        format!("{}/{}/{:016x}", self.sensor_id, self.timestamp, digest)
    }

    fn validate(&self) -> Result<(), RecordError> {
        if self.sensor_id.trim().is_empty() {
            return Err(RecordError::EmptySensorId);
        }
        if !self.value.is_finite() {
            return Err(RecordError::NonFinite(self.value));
        }
        if OffsetDateTime::parse(&self.timestamp, &Rfc3339).is_ok() {
            return Ok(());
        }
        PrimitiveDateTime::parse(&self.timestamp, &Iso8601::DEFAULT).map_err(|err| RecordError::Timestamp {
            value: self.timestamp.clone(),
            reason: err.to_string(),
        })?;
        Ok(())
    }
}
