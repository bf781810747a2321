// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Time, number and field-lookup helpers shared by the adapters and the mapper.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::constants::NANOS_PER_MILLI;

/// Current wall-clock time in epoch milliseconds.
#[must_use]
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Floor-divides epoch nanoseconds into epoch milliseconds.
#[must_use]
pub fn nanos_to_ms(nanos: u64) -> i64 {
    i64::try_from(nanos / NANOS_PER_MILLI).unwrap_or(i64::MAX)
}

/// Normalizes an epoch value of unknown precision to milliseconds.
///
/// Magnitude decides the unit: below 1e11 is seconds, below 1e14 is
/// milliseconds, below 1e17 is microseconds, anything larger is nanoseconds.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn normalize_epoch(value: f64) -> Option<i64> {
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let ms = if value < 1e11 {
        value * 1_000.0
    } else if value < 1e14 {
        value
    } else if value < 1e17 {
        value / 1_000.0
    } else {
        value / 1_000_000.0
    };
    Some(ms.floor() as i64)
}

/// Reads a timestamp from a number, a numeric string or an RFC 3339 string.
#[must_use]
pub fn parse_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_f64().and_then(normalize_epoch),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(n) = s.parse::<f64>() {
                return normalize_epoch(n);
            }
            DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
        }
        _ => None,
    }
}

/// Numbers and numeric strings as `f64`.
#[must_use]
pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    }
}

/// Integral numbers and integral numeric strings as `i64`.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < 9.0e15)
                .map(|f| f as i64)
        }),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.fract() == 0.0 && f.abs() < 9.0e15)
                    .map(|f| f as i64)
            })
        }
        _ => None,
    }
}

/// Epoch nanoseconds as carried by OTLP JSON (string or number).
#[must_use]
pub fn as_nanos(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
}

/// Scalars rendered as text; empty strings and containers yield `None`.
#[must_use]
pub fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// The JavaScript `typeof` of a JSON value.
#[must_use]
pub const fn json_type_of(value: &Value) -> &'static str {
    match value {
        Value::String(_) => "string",
        Value::Number(_) => "number",
        Value::Bool(_) => "boolean",
        Value::Null | Value::Array(_) | Value::Object(_) => "object",
    }
}

/// Path component of a URL: scheme, authority, query and fragment stripped.
#[must_use]
pub fn path_from_url(url: &str) -> String {
    let without_scheme = match url.find("://") {
        Some(idx) => {
            let rest = &url[idx + 3..];
            match rest.find('/') {
                Some(slash) => &rest[slash..],
                None => "/",
            }
        }
        None => url,
    };
    let end = without_scheme
        .find(|c| c == '?' || c == '#')
        .unwrap_or(without_scheme.len());
    let path = &without_scheme[..end];
    if path.is_empty() {
        "/".to_string()
    } else {
        path.to_string()
    }
}

/// Case-insensitive read-only view over a JSON object.
///
/// An exact key match always wins; otherwise the first case-insensitive match
/// in the map's iteration order is used, so lookups are deterministic for a
/// given object.
#[derive(Debug, Clone, Copy)]
pub struct FieldMap<'a> {
    map: &'a Map<String, Value>,
}

impl<'a> FieldMap<'a> {
    #[must_use]
    pub const fn new(map: &'a Map<String, Value>) -> Self {
        Self { map }
    }

    /// Returns the stored key and value for `key`.
    #[must_use]
    pub fn entry(&self, key: &str) -> Option<(&'a str, &'a Value)> {
        if let Some((k, v)) = self.map.get_key_value(key) {
            return Some((k.as_str(), v));
        }
        self.map
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(k, v)| (k.as_str(), v))
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&'a Value> {
        self.entry(key).map(|(_, v)| v)
    }

    /// True when the key exists with a non-null value.
    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some_and(|v| !v.is_null())
    }

    #[must_use]
    pub fn has_any(&self, keys: &[&str]) -> bool {
        keys.iter().any(|key| self.has(key))
    }

    /// First alias (in the given order) present with a non-null value.
    #[must_use]
    pub fn first_of(&self, keys: &[&str]) -> Option<(&'a str, &'a Value)> {
        keys.iter()
            .filter_map(|key| self.entry(key))
            .find(|(_, v)| !v.is_null())
    }
}
