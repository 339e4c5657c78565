//! Schemaless record values.
//!
//! Records held by the local stores are open key/value maps. Dates are a
//! first-class case so restored timestamps come back as instants rather than
//! strings. In exported JSON a date travels as the sentinel object
//! `{"__type": "Date", "value": "<ISO-8601>"}`.

use chrono::{DateTime, NaiveDate, SecondsFormat, TimeZone, Utc};
use regex::Regex;
use serde_json::{Map, Number};
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Field that marks an object as an encoded date.
pub const DATE_TYPE_FIELD: &str = "__type";
/// Marker value stored under [`DATE_TYPE_FIELD`].
pub const DATE_TYPE_NAME: &str = "Date";
/// Field that carries the serialized instant of an encoded date.
pub const DATE_VALUE_FIELD: &str = "value";

const ISO_DATE_TIME_PATTERN: &str = r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(\.\d{3})?Z$";

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Date(DateTime<Utc>),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

/// A JSON node classified before conversion: either an encoded date (holding
/// the sentinel's inner value) or anything else.
#[derive(Debug, Clone, PartialEq)]
pub enum Tagged {
    Date(serde_json::Value),
    Raw(serde_json::Value),
}

impl Tagged {
    pub fn classify(json: serde_json::Value) -> Tagged {
        match json {
            serde_json::Value::Object(mut map) if is_date_sentinel(&map) => {
                let inner = map
                    .remove(DATE_VALUE_FIELD)
                    .unwrap_or(serde_json::Value::Null);
                Tagged::Date(inner)
            }
            other => Tagged::Raw(other),
        }
    }
}

fn is_date_sentinel(map: &Map<String, serde_json::Value>) -> bool {
    matches!(map.get(DATE_TYPE_FIELD), Some(serde_json::Value::String(t)) if t == DATE_TYPE_NAME)
        && map.contains_key(DATE_VALUE_FIELD)
}

fn iso_date_time_regex() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(ISO_DATE_TIME_PATTERN).ok())
        .as_ref()
}

/// True for strings shaped exactly like `YYYY-MM-DDTHH:mm:ss[.sss]Z`.
pub fn is_iso_date_time(s: &str) -> bool {
    iso_date_time_regex().is_some_and(|re| re.is_match(s))
}

/// Reconstruct the instant carried by a date sentinel.
///
/// Accepts RFC 3339 strings, bare `YYYY-MM-DD` dates (midnight UTC) and epoch
/// milliseconds.
pub fn parse_date_payload(payload: &serde_json::Value) -> Option<DateTime<Utc>> {
    match payload {
        serde_json::Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|naive| naive.and_utc())
        }
        serde_json::Value::Number(n) => {
            let millis = n.as_i64().or_else(|| {
                n.as_f64()
                    .filter(|f| f.is_finite() && f.fract() == 0.0)
                    .map(|f| f as i64)
            })?;
            Utc.timestamp_millis_opt(millis).single()
        }
        _ => None,
    }
}

/// Rehydrate dates inside a restored record.
///
/// Sentinel objects become [`Value::Date`], or [`Value::Null`] when their
/// payload cannot be reconstructed. Strings shaped like an ISO-8601 UTC
/// timestamp become dates when they parse and are kept verbatim otherwise.
/// Objects and arrays are walked recursively.
pub fn normalize_dates(json: serde_json::Value) -> Value {
    match Tagged::classify(json) {
        Tagged::Date(payload) => parse_date_payload(&payload)
            .map(Value::Date)
            .unwrap_or(Value::Null),
        Tagged::Raw(serde_json::Value::String(s)) => {
            if is_iso_date_time(&s) {
                match DateTime::parse_from_rfc3339(&s) {
                    Ok(dt) => Value::Date(dt.with_timezone(&Utc)),
                    Err(_) => Value::String(s),
                }
            } else {
                Value::String(s)
            }
        }
        Tagged::Raw(serde_json::Value::Array(items)) => {
            Value::Array(items.into_iter().map(normalize_dates).collect())
        }
        Tagged::Raw(serde_json::Value::Object(map)) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, normalize_dates(v)))
                .collect(),
        ),
        Tagged::Raw(scalar) => Value::from_json(scalar),
    }
}

impl Value {
    /// Structural conversion; no date detection.
    pub fn from_json(json: serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Decode JSON written by [`Value::to_json`]: sentinels become dates,
    /// strings stay strings.
    pub fn from_stored_json(json: serde_json::Value) -> Value {
        match Tagged::classify(json) {
            Tagged::Date(payload) => parse_date_payload(&payload)
                .map(Value::Date)
                .unwrap_or(Value::Null),
            Tagged::Raw(serde_json::Value::Array(items)) => {
                Value::Array(items.into_iter().map(Value::from_stored_json).collect())
            }
            Tagged::Raw(serde_json::Value::Object(map)) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from_stored_json(v)))
                    .collect(),
            ),
            Tagged::Raw(scalar) => Value::from_json(scalar),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Value::Number(n.clone()),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Date(dt) => {
                let mut map = Map::new();
                map.insert(
                    DATE_TYPE_FIELD.to_string(),
                    serde_json::Value::String(DATE_TYPE_NAME.to_string()),
                );
                map.insert(
                    DATE_VALUE_FIELD.to_string(),
                    serde_json::Value::String(dt.to_rfc3339_opts(SecondsFormat::Millis, true)),
                );
                serde_json::Value::Object(map)
            }
            Value::Array(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Value::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.as_object().and_then(|map| map.get(field))
    }

    /// Value at a dotted key path such as `id` or `meta.code`.
    pub fn lookup_path(&self, path: &str) -> Option<&Value> {
        path.split('.')
            .try_fold(self, |current, segment| current.get(segment))
    }

    /// Write `value` at a dotted key path, creating intermediate objects.
    /// Returns false when a non-object sits on the path.
    pub fn set_path(&mut self, path: &str, value: Value) -> bool {
        let mut segments = path.split('.').peekable();
        let mut current = self;
        while let Some(segment) = segments.next() {
            let Value::Object(map) = current else {
                return false;
            };
            if segments.peek().is_none() {
                map.insert(segment.to_string(), value);
                return true;
            }
            current = map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(BTreeMap::new()));
        }
        false
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(dt: DateTime<Utc>) -> Self {
        Value::Date(dt)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn instant(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_sentinel_becomes_date() {
        let value = normalize_dates(json!({"__type": "Date", "value": "2024-01-01T00:00:00.000Z"}));
        assert_eq!(value, Value::Date(instant("2024-01-01T00:00:00Z")));
    }

    #[test]
    fn test_malformed_sentinel_becomes_null() {
        let value = normalize_dates(json!({
            "createdAt": {"__type": "Date", "value": "not a date"},
            "updatedAt": {"__type": "Date", "value": {"nested": true}}
        }));
        assert_eq!(value.get("createdAt"), Some(&Value::Null));
        assert_eq!(value.get("updatedAt"), Some(&Value::Null));
    }

    #[test]
    fn test_sentinel_accepts_epoch_millis_and_plain_dates() {
        assert_eq!(
            normalize_dates(json!({"__type": "Date", "value": 1704067200000i64})),
            Value::Date(instant("2024-01-01T00:00:00Z"))
        );
        assert_eq!(
            normalize_dates(json!({"__type": "Date", "value": "2024-01-01"})),
            Value::Date(instant("2024-01-01T00:00:00Z"))
        );
    }

    #[test]
    fn test_object_without_payload_is_not_a_sentinel() {
        let value = normalize_dates(json!({"__type": "Date"}));
        assert_eq!(
            value,
            Value::Object(BTreeMap::from([(
                "__type".to_string(),
                Value::String("Date".to_string())
            )]))
        );
    }

    #[test]
    fn test_iso_strings_are_rehydrated() {
        let value = normalize_dates(json!({
            "withMillis": "2024-03-15T10:30:00.250Z",
            "withoutMillis": "2024-03-15T10:30:00Z",
            "offset": "2024-03-15T10:30:00+03:00",
            "dateOnly": "2024-03-15",
            "impossible": "2024-13-45T99:00:00Z",
            "name": "Simit"
        }));

        assert_eq!(
            value.get("withMillis"),
            Some(&Value::Date(instant("2024-03-15T10:30:00.250Z")))
        );
        assert_eq!(
            value.get("withoutMillis"),
            Some(&Value::Date(instant("2024-03-15T10:30:00Z")))
        );
        // only the strict UTC shape is rehydrated
        assert_eq!(value.get("offset"), Some(&Value::from("2024-03-15T10:30:00+03:00")));
        assert_eq!(value.get("dateOnly"), Some(&Value::from("2024-03-15")));
        assert_eq!(value.get("impossible"), Some(&Value::from("2024-13-45T99:00:00Z")));
        assert_eq!(value.get("name"), Some(&Value::from("Simit")));
    }

    #[test]
    fn test_nested_structures_are_walked() {
        let value = normalize_dates(json!({
            "items": [
                {"soldAt": {"__type": "Date", "value": "2024-01-01T00:00:00.000Z"}},
                ["2024-01-02T00:00:00.000Z", 3]
            ]
        }));

        let Some(Value::Array(items)) = value.get("items") else {
            panic!("items should stay an array");
        };
        assert_eq!(
            items[0].get("soldAt"),
            Some(&Value::Date(instant("2024-01-01T00:00:00Z")))
        );
        assert_eq!(
            items[1],
            Value::Array(vec![
                Value::Date(instant("2024-01-02T00:00:00Z")),
                Value::from(3)
            ])
        );
    }

    #[test]
    fn test_stored_json_roundtrip_keeps_strings() {
        let original = Value::Object(BTreeMap::from([
            ("at".to_string(), Value::Date(instant("2024-05-05T12:00:00.123Z"))),
            ("label".to_string(), Value::from("2024-05-05T12:00:00.123Z")),
        ]));

        let decoded = Value::from_stored_json(original.to_json());
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_key_paths() {
        let mut record = Value::from_json(json!({"id": 7, "meta": {"code": "A1"}}));
        assert_eq!(record.lookup_path("id"), Some(&Value::from(7)));
        assert_eq!(record.lookup_path("meta.code"), Some(&Value::from("A1")));
        assert_eq!(record.lookup_path("meta.missing"), None);

        assert!(record.set_path("meta.serial", Value::from(9)));
        assert_eq!(record.lookup_path("meta.serial"), Some(&Value::from(9)));
        assert!(!record.set_path("id.inner", Value::Null));
    }
}
