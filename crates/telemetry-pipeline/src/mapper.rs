// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Classification of messages and untyped JSON into typed records.
//!
//! Kind precedence for objects: synthetic metric (`metric.name`), request,
//! log, event, then raw. Canonical keys consumed into typed fields are
//! removed from `attrs`; the untouched input is kept in `raw`.

use serde_json::Value;

use crate::record::{
    Attributes, BaseMessage, EventItem, LogItem, MetricItem, RawItem, Record, RequestItem,
    Severity,
};
use crate::util::{
    as_f64, as_i64, as_string, json_type_of, now_ms, parse_timestamp, path_from_url, FieldMap,
};

const TIMESTAMP_KEYS: [&str; 5] = ["timestamp", "time", "ts", "t", "@timestamp"];
const SERVICE_KEYS: [&str; 4] = ["service", "serviceName", "service.name", "app"];
const REQUEST_KEYS: [&str; 8] = [
    "method",
    "path",
    "url",
    "status",
    "statusCode",
    "duration",
    "duration_ms",
    "responseTimeMs",
];
const LOG_KEYS: [&str; 3] = ["message", "level", "severity"];
const EVENT_KEYS: [&str; 2] = ["event", "name"];
const METRIC_NAME: &str = "metric.name";
const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Field reader that remembers which stored keys were consumed.
struct Fields<'a> {
    object: &'a Attributes,
    lookup: FieldMap<'a>,
    consumed: Vec<&'a str>,
}

impl<'a> Fields<'a> {
    fn new(object: &'a Attributes) -> Self {
        Self {
            object,
            lookup: FieldMap::new(object),
            consumed: Vec::new(),
        }
    }

    fn has_any(&self, keys: &[&str]) -> bool {
        self.lookup.has_any(keys)
    }

    /// First alias present, marking it consumed.
    fn take(&mut self, keys: &[&str]) -> Option<&'a Value> {
        let (key, value) = self.lookup.first_of(keys)?;
        self.consumed.push(key);
        Some(value)
    }

    fn take_all(&mut self, keys: &[&str]) -> Vec<&'a Value> {
        keys.iter().filter_map(|key| self.take(&[*key])).collect()
    }

    fn timestamp(&mut self, now: i64) -> i64 {
        self.take(&TIMESTAMP_KEYS)
            .and_then(parse_timestamp)
            .unwrap_or(now)
    }

    fn service(&mut self) -> Option<String> {
        self.take(&SERVICE_KEYS).and_then(as_string)
    }

    /// Keys not consumed into typed fields; `None` when nothing is left.
    fn remaining(&self) -> Option<Attributes> {
        let rest: Attributes = self
            .object
            .iter()
            .filter(|(k, _)| !self.consumed.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        (!rest.is_empty()).then_some(rest)
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Classifies an arbitrary JSON value using the current time as fallback.
#[must_use]
pub fn map_value(value: &Value) -> Record {
    map_value_at(value, now_ms())
}

/// Classifies an arbitrary JSON value; `now` stamps values without a
/// recognizable timestamp.
#[must_use]
pub fn map_value_at(value: &Value, now: i64) -> Record {
    match value {
        Value::Object(object) => map_object(object, value, now),
        Value::String(s) => Record::Log(LogItem {
            t: now,
            message: s.clone(),
            raw: Some(value.clone()),
            ..Default::default()
        }),
        other => Record::Raw(RawItem {
            t: now,
            data_type: Some(json_type_of(other).to_string()),
            content: other.to_string(),
            content_type: Some(DEFAULT_CONTENT_TYPE.to_string()),
            raw: Some(other.clone()),
            ..Default::default()
        }),
    }
}

fn map_object(object: &Attributes, original: &Value, now: i64) -> Record {
    let mut fields = Fields::new(object);
    let raw = Some(original.clone());

    if fields.has_any(&[METRIC_NAME]) {
        let name = fields.take(&[METRIC_NAME]).map(text_of).unwrap_or_default();
        let t = fields.timestamp(now);
        let service = fields.service();
        let value = fields.take(&["metric.value", "value"]).and_then(as_f64);
        let unit = fields.take(&["metric.unit", "unit"]).and_then(as_string);
        let kind = fields.take(&["metric.kind"]).and_then(as_string);
        return Record::Metric(MetricItem {
            t,
            service,
            name,
            value,
            unit,
            kind,
            attrs: fields.remaining(),
            raw,
        });
    }

    if fields.has_any(&REQUEST_KEYS) {
        let t = fields.timestamp(now);
        let service = fields.service();
        let method = fields.take(&["method"]).and_then(as_string);
        let url = fields.take(&["url"]).and_then(as_string);
        let path = fields
            .take(&["path"])
            .or_else(|| fields.take(&["http.target"]))
            .or_else(|| fields.take(&["http.route"]))
            .and_then(as_string)
            .or_else(|| url.as_deref().map(path_from_url));
        let status = fields.take(&["status", "statusCode"]).and_then(as_i64);
        let duration_ms = fields
            .take(&["duration_ms", "duration", "responseTimeMs"])
            .and_then(as_f64);
        // Keep the consumed URL visible to consumers.
        let mut attrs = fields.remaining();
        if let Some(url) = url {
            attrs
                .get_or_insert_with(Attributes::new)
                .insert("url".to_string(), Value::String(url));
        }
        return Record::Request(RequestItem {
            t,
            service,
            method,
            path,
            status,
            duration_ms,
            attrs,
            raw,
        });
    }

    if fields.has_any(&LOG_KEYS) {
        let t = fields.timestamp(now);
        let service = fields.service();
        let message = fields.take(&["message"]).map(text_of).unwrap_or_default();
        let severity = fields
            .take_all(&["severity", "level"])
            .into_iter()
            .find_map(Severity::from_value);
        return Record::Log(LogItem {
            t,
            service,
            severity,
            message,
            attrs: fields.remaining(),
            raw,
        });
    }

    if fields.has_any(&EVENT_KEYS) {
        let t = fields.timestamp(now);
        let service = fields.service();
        let name = fields.take(&EVENT_KEYS).map(text_of).unwrap_or_default();
        return Record::Event(EventItem {
            t,
            service,
            name,
            attrs: fields.remaining(),
            raw,
        });
    }

    let t = fields.timestamp(now);
    let service = fields.service();
    let content_type = fields
        .take(&["contentType", "content_type"])
        .and_then(as_string)
        .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
    Record::Raw(RawItem {
        t,
        service,
        data_type: Some(json_type_of(original).to_string()),
        content: original.to_string(),
        content_type: Some(content_type),
        source: None,
        attrs: fields.remaining(),
        raw,
    })
}

/// Classifies an adapter message.
///
/// Messages tagged with `metric.name` become metrics directly; everything
/// else is flattened (attributes first, then the message's own fields) and
/// run through the generic mapper. The message timestamp and raw payload
/// always win over whatever the mapper derived.
#[must_use]
pub fn classify_message(message: BaseMessage) -> Record {
    let source = message.source.as_str().to_string();
    let mut record = if message.attributes.contains_key(METRIC_NAME) {
        metric_from_message(&message)
    } else {
        let normalized = normalize(&message);
        map_value_at(&normalized, message.timestamp_ms)
    };
    stamp(&mut record, message.timestamp_ms, message.raw, source);
    record
}

fn metric_from_message(message: &BaseMessage) -> Record {
    let mut attributes = message.attributes.clone();
    let mut pop = |key: &str| attributes.remove(key);
    let name = pop(METRIC_NAME).as_ref().map(text_of).unwrap_or_default();
    let value = pop("metric.value").as_ref().and_then(as_f64);
    let unit = pop("metric.unit").as_ref().and_then(as_string);
    let kind = pop("metric.kind").as_ref().and_then(as_string);
    if let Some(correlation_id) = &message.correlation_id {
        attributes
            .entry("correlationId")
            .or_insert_with(|| Value::String(correlation_id.clone()));
    }
    Record::Metric(MetricItem {
        t: message.timestamp_ms,
        service: message.service_name.clone().or_else(|| message.app.clone()),
        name,
        value,
        unit,
        kind,
        attrs: (!attributes.is_empty()).then_some(attributes),
        raw: None,
    })
}

/// Flattens a message into the object shape the generic mapper reads.
fn normalize(message: &BaseMessage) -> Value {
    let mut object = message.attributes.clone();
    let mut set = |key: &str, value: Option<Value>| {
        if let Some(value) = value {
            object.insert(key.to_string(), value);
        }
    };
    set("message", Some(Value::String(message.message.clone())));
    set("severity", message.severity.as_ref().map(Severity::to_value));
    set("service", message.service_name.clone().map(Value::String));
    set("host", message.host.clone().map(Value::String));
    set("app", message.app.clone().map(Value::String));
    set("traceId", message.trace_id.clone().map(Value::String));
    set("spanId", message.span_id.clone().map(Value::String));
    set(
        "correlationId",
        message.correlation_id.clone().map(Value::String),
    );
    Value::Object(object)
}

fn stamp(record: &mut Record, t: i64, raw: Value, source: String) {
    let raw = (!raw.is_null()).then_some(raw);
    match record {
        Record::Request(item) => {
            item.t = t;
            item.raw = raw;
        }
        Record::Log(item) => {
            item.t = t;
            item.raw = raw;
        }
        Record::Event(item) => {
            item.t = t;
            item.raw = raw;
        }
        Record::Metric(item) => {
            item.t = t;
            item.raw = raw;
        }
        Record::Raw(item) => {
            item.t = t;
            item.raw = raw;
            item.source = Some(source);
        }
    }
}
