//! Core types for EmberDB

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Timestamp in milliseconds since Unix epoch
pub type Timestamp = i64;

/// Reserved field name holding the timestamp column of a series bucket
pub const TS_FIELD: &str = "TS";

/// Separator between series id and field name inside a field id
pub const FIELD_ID_SEPARATOR: char = '#';

/// Series key combining measurement and tags
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeriesKey {
    /// Measurement name (e.g., "temperature", "cpu_usage")
    pub measurement: String,
    /// Sorted tags for consistent ordering
    pub tags: BTreeMap<String, String>,
}

impl SeriesKey {
    /// Create a new series key
    pub fn new(measurement: impl Into<String>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
        }
    }

    /// Add a tag to the series key
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Canonical string form; identical tag-sets always produce identical ids
    pub fn canonical(&self) -> String {
        let mut s = self.measurement.clone();
        for (k, v) in &self.tags {
            s.push(',');
            s.push_str(k);
            s.push('=');
            s.push_str(v);
        }
        s
    }

    /// Immutable series id derived from the canonical form
    pub fn series_id(&self) -> SeriesId {
        SeriesId(Bytes::from(self.canonical()))
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

/// Immutable byte-string identity of one tag-set within a measurement
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeriesId(Bytes);

impl SeriesId {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        // ids are built from String keys, always valid UTF-8
        std::str::from_utf8(&self.0).unwrap_or("")
    }

    /// Field id for one named field of this series
    pub fn field_id(&self, field_name: &str) -> String {
        format!("{}{}{}", self.as_str(), FIELD_ID_SEPARATOR, field_name)
    }
}

impl From<&str> for SeriesId {
    fn from(s: &str) -> Self {
        SeriesId(Bytes::from(s.to_string()))
    }
}

impl fmt::Display for SeriesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Possible field value types
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// 64-bit float, stored as its raw bit pattern
    Float(f64),
    /// 64-bit signed integer
    Integer(i64),
}

impl FieldValue {
    /// Raw 64-bit storage representation
    pub fn to_raw(self) -> i64 {
        match self {
            FieldValue::Float(v) => v.to_bits() as i64,
            FieldValue::Integer(v) => v,
        }
    }

    /// Whether this value is floating point
    pub fn is_fp(self) -> bool {
        matches!(self, FieldValue::Float(_))
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

/// A single ingested point: one timestamp plus named field values
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    /// Series key (measurement + tags)
    pub key: SeriesKey,
    /// Timestamp in milliseconds
    pub timestamp: Timestamp,
    /// Field name/value pairs
    pub values: Vec<(String, FieldValue)>,
}

impl Point {
    /// Create a new point with a single field
    pub fn new(key: SeriesKey, timestamp: Timestamp, field: impl Into<String>, value: FieldValue) -> Self {
        Self {
            key,
            timestamp,
            values: vec![(field.into(), value)],
        }
    }

    /// Add another field value
    pub fn with_value(mut self, field: impl Into<String>, value: FieldValue) -> Self {
        self.values.push((field.into(), value));
        self
    }
}

/// A decoded (timestamp, raw value) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataPoint {
    /// Timestamp in milliseconds
    pub timestamp: Timestamp,
    /// Raw 64-bit value; bit pattern of an f64 for floating point fields
    pub value: i64,
}

impl DataPoint {
    pub fn new(timestamp: Timestamp, value: i64) -> Self {
        Self { timestamp, value }
    }

    /// Interpret the raw value as a float
    pub fn value_as_f64(&self) -> f64 {
        f64::from_bits(self.value as u64)
    }
}

/// Time range for queries, endpoints inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl TimeRange {
    /// Create a range, normalizing swapped endpoints
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self {
            start: start.min(end),
            end: start.max(end),
        }
    }

    /// Check if a timestamp is within the range
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts <= self.end
    }
}

/// Pushed-down filter applied to raw decoded values
pub type Predicate = Arc<dyn Fn(i64) -> bool + Send + Sync>;

/// Predicate accepting values inside `[start, end]`
pub fn between(start: i64, end: i64) -> Predicate {
    Arc::new(move |v| v >= start && v <= end)
}

/// Time bucket id for a millisecond timestamp: floor(seconds / bucket size).
/// Saturates at the i32 range so extreme query bounds stay ordered.
pub fn time_bucket(timestamp_ms: Timestamp, bucket_size_secs: u32) -> i32 {
    let secs = timestamp_ms.div_euclid(1000);
    secs.div_euclid(bucket_size_secs.max(1) as i64)
        .clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_series_key_canonical() {
        let key = SeriesKey::new("temperature")
            .with_tag("sensor", "sensor-001")
            .with_tag("location", "building-a");

        assert_eq!(
            key.canonical(),
            "temperature,location=building-a,sensor=sensor-001"
        );
        assert_eq!(
            key.series_id().field_id("value1"),
            "temperature,location=building-a,sensor=sensor-001#value1"
        );
    }

    #[test]
    fn test_time_bucket() {
        assert_eq!(time_bucket(0, 4096), 0);
        assert_eq!(time_bucket(4095_999, 4096), 0);
        assert_eq!(time_bucket(4096_000, 4096), 1);
        // same bucket for points 1s apart inside one window
        assert_eq!(time_bucket(1_000_000, 4096), time_bucket(1_001_000, 4096));
    }

    #[test]
    fn test_time_range_normalizes() {
        let r = TimeRange::new(200, 100);
        assert_eq!(r.start, 100);
        assert_eq!(r.end, 200);
        assert!(r.contains(150));
        assert!(!r.contains(250));
    }

    #[test]
    fn test_field_value_raw() {
        assert_eq!(FieldValue::Integer(42).to_raw(), 42);
        let f = FieldValue::Float(3.25);
        assert_eq!(f64::from_bits(f.to_raw() as u64), 3.25);
        assert!(f.is_fp());
    }
}
