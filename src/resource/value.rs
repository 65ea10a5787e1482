//! Typed scalar values and their order-preserving key encoding.
//!
//! Every attribute value the silo stores is one of the [`AttrValue`] variants.
//! The JSON layer converts to and from RFC 7643 wire shapes (RFC3339 strings
//! for datetimes, base64 for binary); indices encode values through
//! [`AttrValue::index_key`] so that lexicographic byte order matches the
//! natural order of the value where the encoding supports it:
//!
//! - integers use a zig-zag map to u64 followed by 8 big-endian bytes, which
//!   orders non-negative values correctly but inverts the order of negatives
//!   (pinned by tests below);
//! - decimals use the IEEE-754 bit pattern with the standard sign transform,
//!   giving correct total order for all finite values;
//! - datetimes are epoch milliseconds encoded as integers.

use std::cmp::Ordering;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ScimError, ScimResult};
use crate::schema::AttributeType;

/// A typed scalar attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "lowercase")]
pub enum AttrValue {
    String(String),
    Boolean(bool),
    Integer(i64),
    Decimal(f64),
    /// Epoch milliseconds.
    DateTime(i64),
    Binary(Vec<u8>),
    Reference(String),
}

impl AttrValue {
    /// Parses a JSON value according to the schema-declared type.
    pub fn from_json(data_type: AttributeType, value: &serde_json::Value) -> ScimResult<Self> {
        use serde_json::Value;
        match (data_type, value) {
            (AttributeType::String, Value::String(s)) => Ok(Self::String(s.clone())),
            (AttributeType::Boolean, Value::Bool(b)) => Ok(Self::Boolean(*b)),
            (AttributeType::Integer, Value::Number(n)) => n
                .as_i64()
                .map(Self::Integer)
                .ok_or_else(|| ScimError::invalid_value(format!("{} is not an integer", n))),
            (AttributeType::Decimal, Value::Number(n)) => n
                .as_f64()
                .map(Self::Decimal)
                .ok_or_else(|| ScimError::invalid_value(format!("{} is not a decimal", n))),
            (AttributeType::DateTime, Value::String(s)) => {
                let dt = DateTime::parse_from_rfc3339(s).map_err(|e| {
                    ScimError::invalid_value(format!("invalid datetime {}: {}", s, e))
                })?;
                Ok(Self::DateTime(dt.timestamp_millis()))
            }
            (AttributeType::Binary, Value::String(s)) => {
                let bytes = B64
                    .decode(s)
                    .map_err(|e| ScimError::invalid_value(format!("invalid base64: {}", e)))?;
                Ok(Self::Binary(bytes))
            }
            (AttributeType::Reference, Value::String(s)) => Ok(Self::Reference(s.clone())),
            (AttributeType::Complex, _) => Err(ScimError::internal(
                "complex attributes have no scalar value".to_string(),
            )),
            (t, v) => Err(ScimError::invalid_value(format!(
                "value {} does not match declared type {:?}",
                v, t
            ))),
        }
    }

    /// Renders the value in its RFC 7643 JSON shape.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            Self::String(s) | Self::Reference(s) => Value::String(s.clone()),
            Self::Boolean(b) => Value::Bool(*b),
            Self::Integer(i) => Value::Number((*i).into()),
            Self::Decimal(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::DateTime(ms) => Value::String(millis_to_rfc3339(*ms)),
            Self::Binary(b) => Value::String(B64.encode(b)),
        }
    }

    /// Encodes the value as an index key.
    pub fn index_key(&self, case_sensitive: bool) -> Vec<u8> {
        match self {
            Self::String(s) => {
                if case_sensitive {
                    s.as_bytes().to_vec()
                } else {
                    s.to_lowercase().into_bytes()
                }
            }
            Self::Boolean(b) => {
                if *b {
                    b"true".to_vec()
                } else {
                    b"false".to_vec()
                }
            }
            Self::Integer(i) | Self::DateTime(i) => encode_i64(*i).to_vec(),
            Self::Decimal(f) => encode_f64(*f).to_vec(),
            Self::Binary(b) => b.clone(),
            Self::Reference(s) => s.as_bytes().to_vec(),
        }
    }

    /// Lowercased display form, used to build per-value count keys.
    pub fn count_key(&self) -> String {
        match self {
            Self::String(s) | Self::Reference(s) => s.to_lowercase(),
            Self::Boolean(b) => b.to_string(),
            Self::Integer(i) | Self::DateTime(i) => i.to_string(),
            Self::Decimal(f) => f.to_string(),
            Self::Binary(b) => B64.encode(b).to_lowercase(),
        }
    }

    /// Compares two values of the same type; strings honor `case_exact`.
    pub fn compare(&self, other: &Self, case_exact: bool) -> Option<Ordering> {
        match (self, other) {
            (Self::String(a), Self::String(b)) | (Self::Reference(a), Self::Reference(b)) => {
                if case_exact {
                    Some(a.cmp(b))
                } else {
                    Some(a.to_lowercase().cmp(&b.to_lowercase()))
                }
            }
            (Self::Boolean(a), Self::Boolean(b)) => Some(a.cmp(b)),
            (Self::Integer(a), Self::Integer(b)) | (Self::DateTime(a), Self::DateTime(b)) => {
                Some(a.cmp(b))
            }
            (Self::Decimal(a), Self::Decimal(b)) => a.partial_cmp(b),
            (Self::Integer(a), Self::Decimal(b)) => (*a as f64).partial_cmp(b),
            (Self::Decimal(a), Self::Integer(b)) => a.partial_cmp(&(*b as f64)),
            (Self::Binary(a), Self::Binary(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Equality under the attribute's case sensitivity.
    pub fn matches(&self, other: &Self, case_exact: bool) -> bool {
        self.compare(other, case_exact) == Some(Ordering::Equal)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) | Self::Reference(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }
}

/// Renders epoch milliseconds as an RFC3339 UTC timestamp.
pub fn millis_to_rfc3339(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::AutoSi, true))
        .unwrap_or_default()
}

/// Zig-zag encodes a signed 64-bit integer into 8 big-endian bytes.
pub fn encode_i64(i: i64) -> [u8; 8] {
    let v = ((i << 1) ^ (i >> 63)) as u64;
    v.to_be_bytes()
}

/// Inverse of [`encode_i64`].
pub fn decode_i64(data: &[u8]) -> ScimResult<i64> {
    let bytes: [u8; 8] = data
        .try_into()
        .map_err(|_| ScimError::internal("integer key must be 8 bytes".to_string()))?;
    let v = u64::from_be_bytes(bytes);
    Ok(((v >> 1) as i64) ^ -((v & 1) as i64))
}

/// Encodes a decimal into 8 big-endian bytes whose lexicographic order is the
/// numeric total order (sign transform on the IEEE-754 bit pattern).
pub fn encode_f64(f: f64) -> [u8; 8] {
    let bits = f.to_bits();
    let ordered = if bits & (1 << 63) != 0 {
        !bits
    } else {
        bits | (1 << 63)
    };
    ordered.to_be_bytes()
}

/// Inverse of [`encode_f64`].
pub fn decode_f64(data: &[u8]) -> ScimResult<f64> {
    let bytes: [u8; 8] = data
        .try_into()
        .map_err(|_| ScimError::internal("decimal key must be 8 bytes".to_string()))?;
    let ordered = u64::from_be_bytes(bytes);
    let bits = if ordered & (1 << 63) != 0 {
        ordered & !(1 << 63)
    } else {
        !ordered
    };
    Ok(f64::from_bits(bits))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_integer_key_order_pins() {
        // Zig-zag ordering: correct for non-negatives, inverted for negatives.
        assert!(encode_i64(0) < encode_i64(5));
        assert!(encode_i64(5) < encode_i64(6));
        assert!(encode_i64(0) < encode_i64(-1));
        assert!(encode_i64(-1) < encode_i64(-2));
    }

    #[test]
    fn test_integer_round_trip() {
        for i in [i64::MIN, -1463494754000, -1, 0, 1, 42, i64::MAX] {
            assert_eq!(decode_i64(&encode_i64(i)).unwrap(), i);
        }
    }

    #[test]
    fn test_decimal_key_total_order() {
        let values = [-1000.5, -2.5, -0.0, 0.0, 0.25, 7.2, 9.2, 1e300];
        for pair in values.windows(2) {
            assert!(
                encode_f64(pair[0]) <= encode_f64(pair[1]),
                "{} should order before {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_decimal_round_trip() {
        for f in [-1000.5, -0.25, 0.0, 7.2, 9.2, f64::MAX] {
            assert_eq!(decode_f64(&encode_f64(f)).unwrap(), f);
        }
    }

    #[test]
    fn test_datetime_from_json_is_millis() {
        let v = AttrValue::from_json(AttributeType::DateTime, &json!("2016-05-17T14:19:14Z"))
            .unwrap();
        let expected = DateTime::parse_from_rfc3339("2016-05-17T14:19:14Z")
            .unwrap()
            .timestamp_millis();
        assert_eq!(v, AttrValue::DateTime(expected));
        assert_eq!(v.to_json(), json!("2016-05-17T14:19:14Z"));
    }

    #[test]
    fn test_string_key_lowers_unless_case_exact() {
        let v = AttrValue::String("AbC".to_string());
        assert_eq!(v.index_key(false), b"abc".to_vec());
        assert_eq!(v.index_key(true), b"AbC".to_vec());
    }

    #[test]
    fn test_type_mismatch_is_invalid_value() {
        let err = AttrValue::from_json(AttributeType::Integer, &json!("nope")).unwrap_err();
        assert_eq!(err.scim_type(), "invalidValue");
        let err = AttrValue::from_json(AttributeType::Integer, &json!(1.5)).unwrap_err();
        assert_eq!(err.scim_type(), "invalidValue");
    }

    #[test]
    fn test_binary_round_trip() {
        let v = AttrValue::from_json(AttributeType::Binary, &json!("aGVsbG8=")).unwrap();
        assert_eq!(v, AttrValue::Binary(b"hello".to_vec()));
        assert_eq!(v.to_json(), json!("aGVsbG8="));
    }

    #[test]
    fn test_numeric_cross_type_compare() {
        let i = AttrValue::Integer(2);
        let f = AttrValue::Decimal(2.0);
        assert!(i.matches(&f, true));
    }
}
