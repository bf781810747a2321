// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Data model shared by every stage of the pipeline.
//!
//! Adapters produce transient [`BaseMessage`]s; the mapper turns those (and
//! untyped JSON) into one of the five [`Record`] variants that are stored,
//! aggregated and broadcast. Records are immutable once created and are
//! shared as `Arc<Record>` between the ring buffers, correlation groups and
//! subscriber queues.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Free-form attributes carried by messages and records.
pub type Attributes = Map<String, Value>;

/// The ring buffer a record lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Requests,
    Logs,
    Events,
    Metrics,
    Raw,
}

impl RecordKind {
    pub const ALL: [RecordKind; 5] = [
        RecordKind::Requests,
        RecordKind::Logs,
        RecordKind::Events,
        RecordKind::Metrics,
        RecordKind::Raw,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            RecordKind::Requests => "requests",
            RecordKind::Logs => "logs",
            RecordKind::Events => "events",
            RecordKind::Metrics => "metrics",
            RecordKind::Raw => "raw",
        }
    }

    pub(crate) const fn index(self) -> usize {
        match self {
            RecordKind::Requests => 0,
            RecordKind::Logs => 1,
            RecordKind::Events => 2,
            RecordKind::Metrics => 3,
            RecordKind::Raw => 4,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("Unknown record kind: {0}")]
pub struct UnknownKind(pub String);

impl FromStr for RecordKind {
    type Err = UnknownKind;

    /// Accepts both the plural buffer name and its singular form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "requests" | "request" => Ok(RecordKind::Requests),
            "logs" | "log" => Ok(RecordKind::Logs),
            "events" | "event" => Ok(RecordKind::Events),
            "metrics" | "metric" => Ok(RecordKind::Metrics),
            "raw" => Ok(RecordKind::Raw),
            _ => Err(UnknownKind(s.to_string())),
        }
    }
}

/// Wire format a [`BaseMessage`] was decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Syslog,
    Otlp,
}

impl Source {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Source::Syslog => "syslog",
            Source::Otlp => "otlp",
        }
    }
}

/// Severity as reported upstream: either a level name or a numeric level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Severity {
    Text(String),
    Number(i64),
}

impl Severity {
    /// Reads a severity out of an arbitrary JSON value. Empty strings and
    /// non-scalar values carry no severity.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Severity> {
        match value {
            Value::String(s) if !s.is_empty() => Some(Severity::Text(s.clone())),
            Value::Number(n) => n.as_i64().map(Severity::Number),
            _ => None,
        }
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Severity::Text(s) => Value::String(s.clone()),
            Severity::Number(n) => Value::from(*n),
        }
    }
}

/// Common intermediate produced by the format adapters.
#[derive(Debug, Clone, PartialEq)]
pub struct BaseMessage {
    pub id: String,
    /// Always epoch milliseconds, whatever precision the source used.
    pub timestamp_ms: i64,
    pub source: Source,
    pub message: String,
    pub service_name: Option<String>,
    pub host: Option<String>,
    pub app: Option<String>,
    pub severity: Option<Severity>,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub correlation_id: Option<String>,
    pub attributes: Attributes,
    pub raw: Value,
}

impl BaseMessage {
    #[must_use]
    pub fn new(source: Source, timestamp_ms: i64, message: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp_ms,
            source,
            message: message.into(),
            service_name: None,
            host: None,
            app: None,
            severity: None,
            trace_id: None,
            span_id: None,
            correlation_id: None,
            attributes: Attributes::new(),
            raw: Value::Null,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RequestItem {
    pub t: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attrs: Option<Attributes>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LogItem {
    pub t: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attrs: Option<Attributes>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EventItem {
    pub t: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attrs: Option<Attributes>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricItem {
    pub t: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// OTLP metric kind (`sum`, `gauge`, `histogram_count`, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attrs: Option<Attributes>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RawItem {
    pub t: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(rename = "dataType", skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    pub content: String,
    #[serde(rename = "contentType", skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attrs: Option<Attributes>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

/// A typed, stored record. Serializes as the bare item; the kind travels
/// alongside it (see [`crate::broadcast::StreamMessage`]).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Record {
    Request(RequestItem),
    Log(LogItem),
    Event(EventItem),
    Metric(MetricItem),
    Raw(RawItem),
}

impl Record {
    #[must_use]
    pub const fn kind(&self) -> RecordKind {
        match self {
            Record::Request(_) => RecordKind::Requests,
            Record::Log(_) => RecordKind::Logs,
            Record::Event(_) => RecordKind::Events,
            Record::Metric(_) => RecordKind::Metrics,
            Record::Raw(_) => RecordKind::Raw,
        }
    }

    /// Epoch milliseconds.
    #[must_use]
    pub const fn timestamp(&self) -> i64 {
        match self {
            Record::Request(item) => item.t,
            Record::Log(item) => item.t,
            Record::Event(item) => item.t,
            Record::Metric(item) => item.t,
            Record::Raw(item) => item.t,
        }
    }

    #[must_use]
    pub fn attrs(&self) -> Option<&Attributes> {
        match self {
            Record::Request(item) => item.attrs.as_ref(),
            Record::Log(item) => item.attrs.as_ref(),
            Record::Event(item) => item.attrs.as_ref(),
            Record::Metric(item) => item.attrs.as_ref(),
            Record::Raw(item) => item.attrs.as_ref(),
        }
    }

    /// Status code of a request record; other kinds carry none.
    #[must_use]
    pub fn status(&self) -> Option<i64> {
        match self {
            Record::Request(item) => item.status,
            _ => None,
        }
    }
}
