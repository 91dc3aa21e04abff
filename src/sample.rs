use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Why a line of collector output was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SampleError {
    #[error("empty line")]
    Empty,

    #[error("missing timestamp or value")]
    Truncated,

    #[error("timestamp is not a positive number of seconds")]
    Timestamp,

    #[error("value is not an integer or finite float")]
    Value,

    #[error("malformed tag")]
    Tag,
}

/// A metric value. Integers and finite floats only; boolean literals,
/// `NaN`, `Infinity` and anything else non-numeric reject the whole line.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(untagged)]
pub enum MetricValue {
    Int(i64),
    Float(f64),
}

impl MetricValue {
    fn parse(token: &str) -> Result<Self, SampleError> {
        if let Ok(i) = token.parse::<i64>() {
            return Ok(MetricValue::Int(i));
        }
        // f64 parsing accepts "inf" and "NaN"; the finite check throws
        // those out. Identifiers and booleans fail the parse itself.
        match token.parse::<f64>() {
            Ok(f) if f.is_finite() => Ok(MetricValue::Float(f)),
            _ => Err(SampleError::Value),
        }
    }
}

impl PartialEq for MetricValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (MetricValue::Int(a), MetricValue::Int(b)) => a == b,
            (MetricValue::Float(a), MetricValue::Float(b)) => a == b,
            (MetricValue::Int(i), MetricValue::Float(f))
            | (MetricValue::Float(f), MetricValue::Int(i)) => *i as f64 == *f,
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Int(i) => write!(f, "{i}"),
            MetricValue::Float(x) => write!(f, "{x}"),
        }
    }
}

/// One validated metric observation. Either every field parses or the
/// line is rejected whole; instances are never mutated after parsing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub metric: String,
    pub timestamp: u64,
    pub value: MetricValue,
    #[serde(serialize_with = "tags_as_map")]
    pub tags: Vec<(String, String)>,
}

impl Sample {
    /// Parse one line: `<metric> <timestamp> <value> [<k>=<v>]*`.
    pub fn parse(line: &str) -> Result<Sample, SampleError> {
        let mut fields = line.split_whitespace();
        let metric = fields.next().ok_or(SampleError::Empty)?;
        let ts_token = fields.next().ok_or(SampleError::Truncated)?;
        let value_token = fields.next().ok_or(SampleError::Truncated)?;

        let timestamp = parse_timestamp(ts_token)?;
        let value = MetricValue::parse(value_token)?;

        let mut tags: Vec<(String, String)> = Vec::new();
        for token in fields {
            let (k, v) = token.split_once('=').ok_or(SampleError::Tag)?;
            if k.is_empty() || v.is_empty() {
                return Err(SampleError::Tag);
            }
            if tags.iter().any(|(seen, _)| seen == k) {
                return Err(SampleError::Tag);
            }
            tags.push((k.to_string(), v.to_string()));
        }

        Ok(Sample {
            metric: metric.to_string(),
            timestamp,
            value,
            tags,
        })
    }

    /// Identity of the series this sample belongs to: metric name plus
    /// the tag set sorted by key. Dedup state is keyed on this.
    pub fn series_key(&self) -> String {
        let mut key = self.metric.clone();
        let mut sorted: Vec<&(String, String)> = self.tags.iter().collect();
        sorted.sort();
        for (k, v) in sorted {
            key.push(' ');
            key.push_str(k);
            key.push('=');
            key.push_str(v);
        }
        key
    }

    /// Wire serialization, tags in input order.
    pub fn to_line(&self) -> String {
        let mut line = format!("{} {} {}", self.metric, self.timestamp, self.value);
        for (k, v) in &self.tags {
            line.push(' ');
            line.push_str(k);
            line.push('=');
            line.push_str(v);
        }
        line
    }
}

/// Timestamps are seconds since the epoch, strictly positive. Collectors
/// may emit sub-second resolution (`123.24`); the fraction is dropped.
fn parse_timestamp(token: &str) -> Result<u64, SampleError> {
    let whole = match token.split_once('.') {
        Some((whole, frac)) => {
            if frac.is_empty() || !frac.bytes().all(|b| b.is_ascii_digit()) {
                return Err(SampleError::Timestamp);
            }
            whole
        }
        None => token,
    };
    if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
        return Err(SampleError::Timestamp);
    }
    let ts: u64 = whole.parse().map_err(|_| SampleError::Timestamp)?;
    if ts == 0 {
        return Err(SampleError::Timestamp);
    }
    Ok(ts)
}

fn tags_as_map<S>(tags: &[(String, String)], serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    use serde::ser::SerializeMap;
    let mut map = serializer.serialize_map(Some(tags.len()))?;
    for (k, v) in tags {
        map.serialize_entry(k, v)?;
    }
    map.end()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_line() {
        let s = Sample::parse("mymetric 123 12 a=b c=d").unwrap();
        assert_eq!(s.metric, "mymetric");
        assert_eq!(s.timestamp, 123);
        assert_eq!(s.value, MetricValue::Int(12));
        assert_eq!(s.tags.len(), 2);
    }

    #[test]
    fn parses_without_tags() {
        let s = Sample::parse("mymetric 125 12.7").unwrap();
        assert_eq!(s.value, MetricValue::Float(12.7));
        assert!(s.tags.is_empty());
    }

    #[test]
    fn accepts_decimal_timestamp() {
        let s = Sample::parse("mymetric 123.24 12 a=b").unwrap();
        assert_eq!(s.timestamp, 123);
    }

    #[test]
    fn rejects_booleans_and_identifiers() {
        for line in [
            "mymetric 123 True a=b",
            "mymetric 123 False a=b",
            "mymetric 123 Value a=b",
            "xxx",
        ] {
            assert!(Sample::parse(line).is_err(), "{line}");
        }
    }

    #[test]
    fn rejects_non_finite_values() {
        assert_eq!(
            Sample::parse("m 1 NaN").unwrap_err(),
            SampleError::Value
        );
        assert_eq!(
            Sample::parse("m 1 inf").unwrap_err(),
            SampleError::Value
        );
        assert_eq!(
            Sample::parse("m 1 -Infinity").unwrap_err(),
            SampleError::Value
        );
    }

    #[test]
    fn rejects_bad_timestamps() {
        for line in ["m 0 1", "m -5 1", "m 12x 1", "m 12. 1", "m 1.2.3 1"] {
            assert_eq!(Sample::parse(line).unwrap_err(), SampleError::Timestamp, "{line}");
        }
    }

    #[test]
    fn rejects_empty_and_truncated() {
        assert_eq!(Sample::parse("").unwrap_err(), SampleError::Empty);
        assert_eq!(Sample::parse("   ").unwrap_err(), SampleError::Empty);
        assert_eq!(Sample::parse("m 123").unwrap_err(), SampleError::Truncated);
    }

    #[test]
    fn rejects_malformed_tags() {
        for line in ["m 1 2 ab", "m 1 2 =b", "m 1 2 a=", "m 1 2 a=b a=c"] {
            assert_eq!(Sample::parse(line).unwrap_err(), SampleError::Tag, "{line}");
        }
    }

    #[test]
    fn series_key_sorts_tags() {
        let a = Sample::parse("m 1 2 b=2 a=1").unwrap();
        let b = Sample::parse("m 9 7 a=1 b=2").unwrap();
        assert_eq!(a.series_key(), b.series_key());
    }

    #[test]
    fn line_round_trip() {
        for line in ["mymetric 123 12 a=b", "m 1 2", "m 1 2.5 a=b c=d"] {
            assert_eq!(Sample::parse(line).unwrap().to_line(), line);
        }
    }

    #[test]
    fn int_and_float_values_compare_numerically() {
        assert_eq!(MetricValue::Int(12), MetricValue::Float(12.0));
        assert_ne!(MetricValue::Int(12), MetricValue::Float(12.5));
    }

    #[test]
    fn serializes_tags_as_json_object() {
        let s = Sample::parse("m 123 12 a=b").unwrap();
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "metric": "m",
                "timestamp": 123,
                "value": 12,
                "tags": {"a": "b"},
            })
        );
    }
}
