use anyhow::Result;
use time::macros::datetime;

use super::record::{PipelineRecord, RecordError};

#[test]
fn decode_accepts_wire_format() -> Result<()> {
    let record = PipelineRecord::decode(br#"{"sensorId":"3","value":35,"timestamp":"2024-01-01T00:00:00Z"}"#)?;
    assert_eq!(record.sensor_id(), "3");
    assert_eq!(record.value(), 35.0);
    assert_eq!(record.timestamp(), "2024-01-01T00:00:00Z");
    Ok(())
}

#[test]
fn encode_uses_camel_case_fields() -> Result<()> {
    let record = PipelineRecord::new("4", 29.5, datetime!(2024-01-01 00:00:00 UTC))?;
    let encoded = record.encode()?;
    let json: serde_json::Value = serde_json::from_slice(&encoded)?;
    assert_eq!(json["sensorId"], "4", "expected sensorId field, got {}", json);
    assert_eq!(json["value"], 29.5, "expected value field, got {}", json);
    assert_eq!(json["timestamp"], "2024-01-01T00:00:00Z", "expected timestamp field, got {}", json);
    assert_eq!(PipelineRecord::decode(&encoded)?, record, "expected decoded record to match");
    Ok(())
}

#[test]
fn decode_accepts_timestamps_without_offset() -> Result<()> {
    for ts in ["2024-01-01T00:00:00", "2024-01-01T00:00:00.123456", "2024-01-01T00:00:00+02:00"] {
        let payload = format!(r#"{{"sensorId":"7","value":28.5,"timestamp":"{}"}}"#, ts);
        let record = PipelineRecord::decode(payload.as_bytes())?;
        assert_eq!(record.timestamp(), ts, "expected timestamp to be kept as sent");
    }

    let res = PipelineRecord::decode(br#"{"sensorId":"7","value":28.5,"timestamp":"2024-13-01T00:00:00"}"#);
    assert!(matches!(res, Err(RecordError::Timestamp { .. })), "expected timestamp error for month 13, got {:?}", res);
    Ok(())
}

#[test]
fn decode_rejects_malformed_records() -> Result<()> {
    let cases: &[&[u8]] = &[
        b"not json",
        br#"{"sensorId":"3","value":35}"#,
        br#"{"sensorId":"3","value":35,"timestamp":"2024-01-01T00:00:00Z","extra":true}"#,
        br#"{"sensorId":"","value":35,"timestamp":"2024-01-01T00:00:00Z"}"#,
        br#"{"sensorId":"3","value":"35","timestamp":"2024-01-01T00:00:00Z"}"#,
    ];
    for case in cases {
        let res = PipelineRecord::decode(case);
        assert!(res.is_err(), "expected {:?} to be rejected, got {:?}", String::from_utf8_lossy(case), res);
    }

    let res = PipelineRecord::decode(br#"{"sensorId":"3","value":35,"timestamp":"yesterday"}"#);
    assert!(matches!(res, Err(RecordError::Timestamp { .. })), "expected timestamp error, got {:?}", res);
    Ok(())
}

#[test]
fn new_rejects_non_finite_values() -> Result<()> {
    let res = PipelineRecord::new("1", f64::NAN, datetime!(2024-01-01 00:00:00 UTC));
    assert!(matches!(res, Err(RecordError::NonFinite(_))), "expected non-finite error, got {:?}", res);
    Ok(())
}

#[test]
fn archive_key_is_content_addressed() -> Result<()> {
    let a = PipelineRecord::new("1", 30.0, datetime!(2024-01-01 00:00:00 UTC))?;
    let b = PipelineRecord::decode(&a.encode()?)?;
    let c = a.with_value(31.0)?;
    assert_eq!(a.archive_key(), b.archive_key(), "expected duplicates to share an archive key");
    assert_ne!(a.archive_key(), c.archive_key(), "expected different content to have different keys");
    assert!(a.archive_key().starts_with("1/2024-01-01T00:00:00Z/"), "unexpected key layout {}", a.archive_key());
    Ok(())
}
