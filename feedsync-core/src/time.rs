//! Timestamp adapter for raw backing-store values
//!
//! Backends encode timestamps in several shapes. This is the only place that
//! inspects them; everything past the boundary works with [`Timestamp`].

use crate::{ParseError, Timestamp};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

/// Parse a raw timestamp value.
///
/// Accepted shapes:
/// - RFC 3339 strings (`"2024-05-01T12:00:00Z"`)
/// - integer or float epoch milliseconds
/// - `{ "seconds": i64, "nanoseconds": u32 }` objects
/// - `{ "_seconds": i64, "_nanoseconds": u32 }` objects (admin SDK JSON)
pub fn parse_timestamp(raw: &Value) -> Result<Timestamp, ParseError> {
    match raw {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| ParseError::InvalidString {
                raw: s.clone(),
                reason: e.to_string(),
            }),
        Value::Number(n) => {
            let millis = match n.as_i64() {
                Some(ms) => ms,
                None => n
                    .as_f64()
                    .filter(|f| f.is_finite())
                    .map(|f| f.trunc() as i64)
                    .ok_or_else(|| ParseError::OutOfRange { raw: n.to_string() })?,
            };
            Utc.timestamp_millis_opt(millis)
                .single()
                .ok_or_else(|| ParseError::OutOfRange { raw: n.to_string() })
        }
        Value::Object(map) => {
            let seconds = map
                .get("seconds")
                .or_else(|| map.get("_seconds"))
                .and_then(Value::as_i64);
            let nanos = map
                .get("nanoseconds")
                .or_else(|| map.get("_nanoseconds"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            let Some(seconds) = seconds else {
                return Err(ParseError::UnsupportedShape {
                    shape: "object without seconds".to_string(),
                });
            };
            let nanos = u32::try_from(nanos)
                .ok()
                .filter(|n| *n < 1_000_000_000)
                .ok_or_else(|| ParseError::OutOfRange { raw: raw.to_string() })?;
            Utc.timestamp_opt(seconds, nanos)
                .single()
                .ok_or_else(|| ParseError::OutOfRange { raw: raw.to_string() })
        }
        Value::Null => Err(ParseError::UnsupportedShape {
            shape: "null".to_string(),
        }),
        Value::Bool(_) => Err(ParseError::UnsupportedShape {
            shape: "bool".to_string(),
        }),
        Value::Array(_) => Err(ParseError::UnsupportedShape {
            shape: "array".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_parse_rfc3339() {
        let ts = parse_timestamp(&json!("2024-05-01T12:00:00+02:00")).unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap());
    }

    #[test]
    fn test_parse_epoch_millis() {
        let ts = parse_timestamp(&json!(1_700_000_000_123i64)).unwrap();
        assert_eq!(ts.timestamp_millis(), 1_700_000_000_123);

        let ts = parse_timestamp(&json!(1_700_000_000_123.9)).unwrap();
        assert_eq!(ts.timestamp_millis(), 1_700_000_000_123);
    }

    #[test]
    fn test_parse_seconds_object_shapes() {
        let a = parse_timestamp(&json!({"seconds": 1_700_000_000, "nanoseconds": 5_000_000})).unwrap();
        let b = parse_timestamp(&json!({"_seconds": 1_700_000_000, "_nanoseconds": 5_000_000})).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.timestamp_millis(), 1_700_000_000_005);
    }

    #[test]
    fn test_rejects_unsupported_shapes() {
        assert!(matches!(
            parse_timestamp(&json!(null)),
            Err(ParseError::UnsupportedShape { .. })
        ));
        assert!(matches!(
            parse_timestamp(&json!({"nanoseconds": 1})),
            Err(ParseError::UnsupportedShape { .. })
        ));
        assert!(matches!(
            parse_timestamp(&json!("yesterday")),
            Err(ParseError::InvalidString { .. })
        ));
        assert!(matches!(
            parse_timestamp(&json!({"seconds": 1, "nanoseconds": 2_000_000_000u64})),
            Err(ParseError::OutOfRange { .. })
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Every supported shape of the same instant parses to the same timestamp.
        #[test]
        fn prop_shapes_agree(millis in 0i64..4_102_444_800_000) {
            let ts = Utc.timestamp_millis_opt(millis).single().unwrap();
            let from_millis = parse_timestamp(&json!(millis)).unwrap();
            let from_string = parse_timestamp(&json!(ts.to_rfc3339())).unwrap();
            let from_object = parse_timestamp(&json!({
                "seconds": ts.timestamp(),
                "nanoseconds": ts.timestamp_subsec_nanos(),
            }))
            .unwrap();
            prop_assert_eq!(from_millis, ts);
            prop_assert_eq!(from_string, ts);
            prop_assert_eq!(from_object, ts);
        }
    }
}
