// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! OTLP/JSON adapter.
//!
//! Flattens `resourceLogs`, `resourceSpans` and `resourceMetrics` exports into
//! [`BaseMessage`]s. Resource attributes are applied first and record level
//! attributes override them. Span HTTP attributes are aliased to the generic
//! `statusCode`/`url`/`method` names and metrics are exploded into one message
//! per value, tagged with `metric.name`, `metric.kind` and `metric.value`.

use serde_json::{Map, Number, Value};
use tracing::debug;

use crate::constants::EXP_HISTOGRAM_QUANTILES;
use crate::record::{Attributes, BaseMessage, Severity, Source};
use crate::util::{as_f64, as_i64, as_nanos, as_string, nanos_to_ms, now_ms, FieldMap};

const RESOURCE_LOGS: &str = "resourceLogs";
const RESOURCE_SPANS: &str = "resourceSpans";
const RESOURCE_METRICS: &str = "resourceMetrics";

const CORRELATION_KEYS: [&str; 4] = [
    "correlationId",
    "correlation_id",
    "correlation.id",
    "x-correlation-id",
];
const TRACE_KEYS: [&str; 3] = ["traceId", "trace_id", "trace.id"];
const SESSION_KEYS: [&str; 3] = ["sessionId", "session_id", "session.id"];
const REQUEST_ID_KEYS: [&str; 4] = ["requestId", "request_id", "request.id", "x-request-id"];
const USER_KEYS: [&str; 4] = ["userId", "user_id", "user.id", "enduser.id"];

/// True when the value looks like an OTLP export: an object carrying at
/// least one of the resource arrays, each made only of objects.
#[must_use]
pub fn is_otlp_payload(value: &Value) -> bool {
    let Some(object) = value.as_object() else {
        return false;
    };
    let mut found = false;
    for key in [RESOURCE_LOGS, RESOURCE_SPANS, RESOURCE_METRICS] {
        match object.get(key) {
            None => {}
            Some(Value::Array(items)) if items.iter().all(Value::is_object) => found = true,
            Some(_) => return false,
        }
    }
    found
}

/// Resolves the correlation key of a message or record.
///
/// Tries, in order: an explicit correlation attribute (used verbatim), then
/// `trace:<traceId>`, `session:<id>`, `request:<id>` and `user:<id>`.
#[must_use]
pub fn extract_correlation_id(attributes: &Attributes, trace_id: Option<&str>) -> Option<String> {
    let fields = FieldMap::new(attributes);
    let lookup = |keys: &[&str]| fields.first_of(keys).and_then(|(_, v)| as_string(v));

    if let Some(explicit) = lookup(&CORRELATION_KEYS) {
        return Some(explicit);
    }
    if let Some(trace) = trace_id
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .or_else(|| lookup(&TRACE_KEYS))
    {
        return Some(format!("trace:{trace}"));
    }
    if let Some(session) = lookup(&SESSION_KEYS) {
        return Some(format!("session:{session}"));
    }
    if let Some(request) = lookup(&REQUEST_ID_KEYS) {
        return Some(format!("request:{request}"));
    }
    lookup(&USER_KEYS).map(|user| format!("user:{user}"))
}

/// Converts an OTLP `AnyValue` wrapper into plain JSON. Values that are not
/// wrappers are returned unchanged.
#[must_use]
pub fn any_value_to_json(value: &Value) -> Value {
    let Some(object) = value.as_object() else {
        return value.clone();
    };
    if let Some(s) = object.get("stringValue") {
        return s.clone();
    }
    if let Some(b) = object.get("boolValue") {
        return b.clone();
    }
    if let Some(i) = object.get("intValue") {
        return as_i64(i).map_or_else(|| i.clone(), Value::from);
    }
    if let Some(d) = object.get("doubleValue") {
        return as_f64(d)
            .and_then(Number::from_f64)
            .map_or_else(|| d.clone(), Value::Number);
    }
    if let Some(array) = object.get("arrayValue") {
        let values = array
            .get("values")
            .and_then(Value::as_array)
            .map(|items| items.iter().map(any_value_to_json).collect())
            .unwrap_or_default();
        return Value::Array(values);
    }
    if let Some(kvlist) = object.get("kvlistValue") {
        return Value::Object(key_values_to_map(kvlist.get("values")));
    }
    if let Some(bytes) = object.get("bytesValue") {
        return bytes.clone();
    }
    if object.is_empty() {
        return Value::Null;
    }
    value.clone()
}

/// Converts an OTLP `[{key, value}]` list into a JSON object.
#[must_use]
pub fn key_values_to_map(list: Option<&Value>) -> Attributes {
    let mut map = Attributes::new();
    merge_key_values(&mut map, list);
    map
}

fn merge_key_values(map: &mut Attributes, list: Option<&Value>) {
    let Some(items) = list.and_then(Value::as_array) else {
        return;
    };
    for item in items {
        if let Some(key) = item.get("key").and_then(Value::as_str) {
            let value = item.get("value").map_or(Value::Null, any_value_to_json);
            map.insert(key.to_string(), value);
        }
    }
}

fn array<'a>(value: &'a Value, key: &str) -> &'a [Value] {
    value
        .get(key)
        .and_then(Value::as_array)
        .map_or(&[][..], Vec::as_slice)
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn nanos_field(value: &Value, key: &str) -> u64 {
    value.get(key).and_then(as_nanos).unwrap_or(0)
}

/// Record timestamp, falling back to the observed time and then to now.
fn resolve_time(time_nanos: u64, observed_nanos: u64) -> i64 {
    if time_nanos > 0 {
        nanos_to_ms(time_nanos)
    } else if observed_nanos > 0 {
        nanos_to_ms(observed_nanos)
    } else {
        now_ms()
    }
}

/// Copies well-known resource attributes onto the message.
fn apply_resource_identity(message: &mut BaseMessage) {
    let fields = FieldMap::new(&message.attributes);
    message.service_name = fields.get("service.name").and_then(as_string);
    message.host = fields
        .first_of(&["host.name", "host"])
        .and_then(|(_, v)| as_string(v));
}

/// Format-independent pieces of one OTLP log record.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LogParts {
    pub time_nanos: u64,
    pub observed_nanos: u64,
    pub severity_text: String,
    pub severity_number: i64,
    /// Body already converted to plain JSON.
    pub body: Value,
    /// Resource attributes merged with record attributes.
    pub attributes: Attributes,
    pub trace_id: String,
    pub span_id: String,
    pub raw: Value,
}

/// Builds the message for one log record. Shared by every log transformer
/// so their outputs have the same shape.
pub(crate) fn build_log_message(parts: LogParts) -> BaseMessage {
    let text = match &parts.body {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    };
    let mut message = BaseMessage::new(
        Source::Otlp,
        resolve_time(parts.time_nanos, parts.observed_nanos),
        text,
    );
    message.severity = if !parts.severity_text.is_empty() {
        Some(Severity::Text(parts.severity_text))
    } else if parts.severity_number != 0 {
        Some(Severity::Number(parts.severity_number))
    } else {
        None
    };
    message.trace_id = Some(parts.trace_id).filter(|s| !s.is_empty());
    message.span_id = Some(parts.span_id).filter(|s| !s.is_empty());
    message.attributes = parts.attributes;
    message.correlation_id =
        extract_correlation_id(&message.attributes, message.trace_id.as_deref());
    message.raw = parts.raw;
    apply_resource_identity(&mut message);
    message
}

/// Manual extraction of `resourceLogs[].scopeLogs[].logRecords[]`.
#[must_use]
pub fn extract_logs(payload: &Value) -> Vec<BaseMessage> {
    let mut messages = Vec::new();
    for resource_logs in array(payload, RESOURCE_LOGS) {
        let resource_attrs =
            key_values_to_map(resource_logs.pointer("/resource/attributes"));
        for scope_logs in array(resource_logs, "scopeLogs") {
            for record in array(scope_logs, "logRecords") {
                let mut attributes = resource_attrs.clone();
                merge_key_values(&mut attributes, record.get("attributes"));
                let parts = LogParts {
                    time_nanos: nanos_field(record, "timeUnixNano"),
                    observed_nanos: nanos_field(record, "observedTimeUnixNano"),
                    severity_text: non_empty_str(record.get("severityText")).unwrap_or_default(),
                    severity_number: record
                        .get("severityNumber")
                        .and_then(as_i64)
                        .unwrap_or(0),
                    body: record.get("body").map_or(Value::Null, any_value_to_json),
                    attributes,
                    trace_id: non_empty_str(record.get("traceId")).unwrap_or_default(),
                    span_id: non_empty_str(record.get("spanId")).unwrap_or_default(),
                    raw: record.clone(),
                };
                messages.push(build_log_message(parts));
            }
        }
    }
    messages
}

/// First present attribute among `sources`, copied under `alias`.
fn alias_attribute(attributes: &mut Attributes, alias: &str, sources: &[&str]) {
    if attributes.contains_key(alias) {
        return;
    }
    let value = sources
        .iter()
        .find_map(|key| attributes.get(*key).filter(|v| !v.is_null()).cloned());
    if let Some(value) = value {
        attributes.insert(alias.to_string(), value);
    }
}

/// Span duration in milliseconds; `None` when either bound is missing or the
/// span ends before it starts.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn span_duration_ms(start_nanos: u64, end_nanos: u64) -> Option<f64> {
    if start_nanos == 0 || end_nanos == 0 || end_nanos < start_nanos {
        return None;
    }
    Some((end_nanos - start_nanos) as f64 / 1e6)
}

/// Manual extraction of `resourceSpans[].scopeSpans[].spans[]`.
#[must_use]
pub fn extract_spans(payload: &Value) -> Vec<BaseMessage> {
    let mut messages = Vec::new();
    for resource_spans in array(payload, RESOURCE_SPANS) {
        let resource_attrs =
            key_values_to_map(resource_spans.pointer("/resource/attributes"));
        for scope_spans in array(resource_spans, "scopeSpans") {
            for span in array(scope_spans, "spans") {
                messages.push(span_message(span, &resource_attrs));
            }
        }
    }
    messages
}

fn span_message(span: &Value, resource_attrs: &Attributes) -> BaseMessage {
    let start = nanos_field(span, "startTimeUnixNano");
    let end = nanos_field(span, "endTimeUnixNano");
    let name = non_empty_str(span.get("name")).unwrap_or_default();

    let mut attributes = resource_attrs.clone();
    merge_key_values(&mut attributes, span.get("attributes"));
    alias_attribute(
        &mut attributes,
        "statusCode",
        &["http.status_code", "http.response.status_code"],
    );
    alias_attribute(&mut attributes, "url", &["http.url", "url.full"]);
    alias_attribute(&mut attributes, "method", &["http.method", "http.request.method"]);
    alias_attribute(&mut attributes, "path", &["http.target", "url.path", "http.route"]);
    if let Some(duration) = span_duration_ms(start, end) {
        attributes.insert("duration_ms".to_string(), Value::from(duration));
    }
    attributes.insert("span.name".to_string(), Value::String(name.clone()));
    if let Some(kind) = span.get("kind").filter(|k| !k.is_null()) {
        attributes.insert("span.kind".to_string(), kind.clone());
    }
    if let Some(parent) = non_empty_str(span.get("parentSpanId")) {
        attributes.insert("parentSpanId".to_string(), Value::String(parent));
    }
    if let Some(code) = span.pointer("/status/code").filter(|c| !c.is_null()) {
        attributes.insert("otel.status_code".to_string(), code.clone());
    }

    let mut message = BaseMessage::new(Source::Otlp, resolve_time(start, 0), name);
    message.trace_id = non_empty_str(span.get("traceId"));
    message.span_id = non_empty_str(span.get("spanId"));
    message.attributes = attributes;
    message.correlation_id =
        extract_correlation_id(&message.attributes, message.trace_id.as_deref());
    message.raw = span.clone();
    apply_resource_identity(&mut message);
    message
}

/// Identity of the metric a data point belongs to.
struct MetricContext<'a> {
    name: &'a str,
    unit: Option<&'a str>,
    description: Option<&'a str>,
    resource_attrs: &'a Attributes,
}

impl MetricContext<'_> {
    fn message(&self, data_point: &Value, kind: &str, value: f64) -> BaseMessage {
        self.message_with(data_point, kind, value, Map::new())
    }

    fn message_with(
        &self,
        data_point: &Value,
        kind: &str,
        value: f64,
        extra: Attributes,
    ) -> BaseMessage {
        let mut attributes = self.resource_attrs.clone();
        merge_key_values(&mut attributes, data_point.get("attributes"));
        attributes.extend(extra);
        attributes.insert("metric.name".to_string(), Value::from(self.name));
        attributes.insert("metric.kind".to_string(), Value::from(kind));
        attributes.insert(
            "metric.value".to_string(),
            Number::from_f64(value).map_or(Value::Null, Value::Number),
        );
        if let Some(unit) = self.unit {
            attributes.insert("metric.unit".to_string(), Value::from(unit));
        }
        if let Some(description) = self.description {
            attributes.insert("metric.description".to_string(), Value::from(description));
        }

        let timestamp = resolve_time(
            nanos_field(data_point, "timeUnixNano"),
            nanos_field(data_point, "startTimeUnixNano"),
        );
        let mut message = BaseMessage::new(
            Source::Otlp,
            timestamp,
            format!("{} {kind}={value}", self.name),
        );
        message.attributes = attributes;
        message.correlation_id = extract_correlation_id(&message.attributes, None);
        message.raw = data_point.clone();
        apply_resource_identity(&mut message);
        message
    }
}

/// Manual extraction of `resourceMetrics[].scopeMetrics[].metrics[]`.
#[must_use]
pub fn extract_metrics(payload: &Value) -> Vec<BaseMessage> {
    let mut messages = Vec::new();
    for resource_metrics in array(payload, RESOURCE_METRICS) {
        let resource_attrs =
            key_values_to_map(resource_metrics.pointer("/resource/attributes"));
        for scope_metrics in array(resource_metrics, "scopeMetrics") {
            for metric in array(scope_metrics, "metrics") {
                let Some(name) = metric.get("name").and_then(Value::as_str) else {
                    debug!("Skipping OTLP metric without a name");
                    continue;
                };
                let context = MetricContext {
                    name,
                    unit: metric.get("unit").and_then(Value::as_str).filter(|u| !u.is_empty()),
                    description: metric
                        .get("description")
                        .and_then(Value::as_str)
                        .filter(|d| !d.is_empty()),
                    resource_attrs: &resource_attrs,
                };
                flatten_metric(metric, &context, &mut messages);
            }
        }
    }
    messages
}

fn flatten_metric(metric: &Value, context: &MetricContext<'_>, out: &mut Vec<BaseMessage>) {
    for kind in ["sum", "gauge"] {
        if let Some(body) = metric.get(kind) {
            for point in array(body, "dataPoints") {
                let value = point
                    .get("asDouble")
                    .and_then(as_f64)
                    .or_else(|| point.get("asInt").and_then(as_f64));
                match value {
                    Some(value) => out.push(context.message(point, kind, value)),
                    None => debug!("Skipping {kind} data point without a value for {}", context.name),
                }
            }
        }
    }

    if let Some(body) = metric.get("histogram") {
        for point in array(body, "dataPoints") {
            push_count_and_sum(point, context, "histogram", out);
        }
    }

    if let Some(body) = metric.get("exponentialHistogram") {
        for point in array(body, "dataPoints") {
            push_count_and_sum(point, context, "exp_histogram", out);
            for (quantile, label, value) in exponential_quantiles(point) {
                let mut extra = Attributes::new();
                extra.insert(
                    "quantile".to_string(),
                    Number::from_f64(quantile).map_or(Value::Null, Value::Number),
                );
                out.push(context.message_with(
                    point,
                    &format!("exp_histogram_{label}"),
                    value,
                    extra,
                ));
            }
        }
    }

    if let Some(body) = metric.get("summary") {
        for point in array(body, "dataPoints") {
            push_count_and_sum(point, context, "summary", out);
            for quantile_value in array(point, "quantileValues") {
                let quantile = quantile_value.get("quantile").and_then(as_f64).unwrap_or(0.0);
                let Some(value) = quantile_value.get("value").and_then(as_f64) else {
                    continue;
                };
                let mut extra = Attributes::new();
                extra.insert(
                    "quantile".to_string(),
                    Number::from_f64(quantile).map_or(Value::Null, Value::Number),
                );
                out.push(context.message_with(point, "summary_quantile", value, extra));
            }
        }
    }
}

fn push_count_and_sum(
    point: &Value,
    context: &MetricContext<'_>,
    prefix: &str,
    out: &mut Vec<BaseMessage>,
) {
    if let Some(count) = point.get("count").and_then(as_f64) {
        out.push(context.message(point, &format!("{prefix}_count"), count));
    }
    if let Some(sum) = point.get("sum").and_then(as_f64) {
        out.push(context.message(point, &format!("{prefix}_sum"), sum));
    }
}

/// Approximate p50/p90/p95/p99 of an exponential histogram data point.
///
/// Bucket `i` of the positive range covers `(base^i, base^(i+1)]` with
/// `base = 2^(2^-scale)`. For each quantile the threshold `q * total` is
/// walked through the cumulative counts (zero bucket first) and the upper
/// boundary of the crossing bucket is reported. This is an estimate only; its
/// error grows with bucket width.
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
pub fn exponential_quantiles(point: &Value) -> Vec<(f64, &'static str, f64)> {
    let scale = point.get("scale").and_then(as_i64).unwrap_or(0);
    let zero_count = point.get("zeroCount").and_then(as_f64).unwrap_or(0.0);
    let offset = point
        .pointer("/positive/offset")
        .and_then(as_i64)
        .unwrap_or(0);
    let counts: Vec<f64> = point
        .pointer("/positive/bucketCounts")
        .and_then(Value::as_array)
        .map(|items| items.iter().map(|c| as_f64(c).unwrap_or(0.0)).collect())
        .unwrap_or_default();

    let total = zero_count + counts.iter().sum::<f64>();
    if total <= 0.0 {
        return Vec::new();
    }
    let base = 2f64.powf(2f64.powi(-(scale.clamp(-10, 20) as i32)));

    EXP_HISTOGRAM_QUANTILES
        .iter()
        .filter_map(|(q, label)| {
            let threshold = q * total;
            if threshold <= zero_count {
                return Some((*q, *label, 0.0));
            }
            let mut cumulative = zero_count;
            for (i, count) in counts.iter().enumerate() {
                cumulative += count;
                if cumulative >= threshold {
                    let index = i64::try_from(i)
                        .map_or(i64::MAX, |i| offset.saturating_add(i).saturating_add(1));
                    return Some((*q, *label, base.powf(index as f64)));
                }
            }
            None
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attr(key: &str, value: Value) -> Value {
        json!({"key": key, "value": value})
    }

    #[test]
    fn test_is_otlp_payload() {
        assert!(is_otlp_payload(&json!({"resourceLogs": [{}]})));
        assert!(is_otlp_payload(&json!({"resourceSpans": []})));
        assert!(!is_otlp_payload(&json!({"resourceLogs": [1, 2]})));
        assert!(!is_otlp_payload(&json!({"resourceLogs": {}})));
        assert!(!is_otlp_payload(&json!({"message": "hi"})));
        assert!(!is_otlp_payload(&json!([{"resourceLogs": []}])));
    }

    #[test]
    fn test_any_value_to_json() {
        assert_eq!(any_value_to_json(&json!({"stringValue": "a"})), json!("a"));
        assert_eq!(any_value_to_json(&json!({"intValue": "42"})), json!(42));
        assert_eq!(any_value_to_json(&json!({"doubleValue": 1.5})), json!(1.5));
        assert_eq!(any_value_to_json(&json!({"boolValue": true})), json!(true));
        assert_eq!(
            any_value_to_json(&json!({"arrayValue": {"values": [{"intValue": 1}, {"stringValue": "b"}]}})),
            json!([1, "b"])
        );
        assert_eq!(
            any_value_to_json(&json!({"kvlistValue": {"values": [{"key": "k", "value": {"stringValue": "v"}}]}})),
            json!({"k": "v"})
        );
        assert_eq!(any_value_to_json(&json!({})), Value::Null);
        assert_eq!(any_value_to_json(&json!("plain")), json!("plain"));
    }

    #[test]
    fn test_extract_logs_merges_resource_then_record_attributes() {
        let payload = json!({
            "resourceLogs": [{
                "resource": {"attributes": [
                    attr("service.name", json!({"stringValue": "checkout"})),
                    attr("env", json!({"stringValue": "prod"}))
                ]},
                "scopeLogs": [{
                    "logRecords": [{
                        "timeUnixNano": "1700000000123456789",
                        "severityText": "ERROR",
                        "body": {"stringValue": "payment failed"},
                        "traceId": "abc123",
                        "attributes": [attr("env", json!({"stringValue": "staging"}))]
                    }, {
                        "observedTimeUnixNano": 1_700_000_001_000_000_000u64,
                        "severityNumber": 9,
                        "body": "plain body"
                    }]
                }]
            }]
        });

        let messages = extract_logs(&payload);
        assert_eq!(messages.len(), 2);

        let first = &messages[0];
        assert_eq!(first.timestamp_ms, 1_700_000_000_123);
        assert_eq!(first.message, "payment failed");
        assert_eq!(first.severity, Some(Severity::Text("ERROR".to_string())));
        assert_eq!(first.service_name.as_deref(), Some("checkout"));
        assert_eq!(first.attributes["env"], json!("staging"));
        assert_eq!(first.trace_id.as_deref(), Some("abc123"));
        assert_eq!(first.correlation_id.as_deref(), Some("trace:abc123"));
        assert_eq!(first.source, Source::Otlp);

        let second = &messages[1];
        assert_eq!(second.timestamp_ms, 1_700_000_001_000);
        assert_eq!(second.message, "plain body");
        assert_eq!(second.severity, Some(Severity::Number(9)));
        assert_eq!(second.attributes["env"], json!("prod"));
    }

    #[test]
    fn test_span_duration_and_http_aliases() {
        let payload = json!({
            "resourceSpans": [{
                "scopeSpans": [{
                    "spans": [{
                        "name": "GET /api/x",
                        "traceId": "t1",
                        "spanId": "s1",
                        "startTimeUnixNano": 1_000_000_000u64,
                        "endTimeUnixNano": 1_500_000_000u64,
                        "attributes": [
                            attr("http.status_code", json!({"intValue": "200"})),
                            attr("http.url", json!({"stringValue": "https://svc/api/x"})),
                            attr("http.method", json!({"stringValue": "GET"}))
                        ]
                    }]
                }]
            }]
        });

        let messages = extract_spans(&payload);
        assert_eq!(messages.len(), 1);
        let span = &messages[0];
        assert_eq!(span.timestamp_ms, 1_000);
        assert_eq!(span.attributes["duration_ms"], json!(500.0));
        assert_eq!(span.attributes["statusCode"], json!(200));
        assert_eq!(span.attributes["url"], json!("https://svc/api/x"));
        assert_eq!(span.attributes["method"], json!("GET"));
        assert_eq!(span.message, "GET /api/x");
        assert_eq!(span.correlation_id.as_deref(), Some("trace:t1"));
    }

    #[test]
    fn test_span_duration_ms() {
        assert_eq!(span_duration_ms(1_000_000_000, 1_500_000_000), Some(500.0));
        assert_eq!(span_duration_ms(0, 1_500_000_000), None);
        assert_eq!(span_duration_ms(2, 1), None);
    }

    #[test]
    fn test_extract_metrics_flattens_every_kind() {
        let payload = json!({
            "resourceMetrics": [{
                "resource": {"attributes": [attr("service.name", json!({"stringValue": "api"}))]},
                "scopeMetrics": [{
                    "metrics": [
                        {"name": "requests", "unit": "1", "sum": {"dataPoints": [
                            {"asInt": "7", "timeUnixNano": "1700000000000000000"}
                        ]}},
                        {"name": "temp", "gauge": {"dataPoints": [{"asDouble": 21.5}]}},
                        {"name": "latency", "histogram": {"dataPoints": [
                            {"count": "3", "sum": 30.0, "bucketCounts": ["1", "2"]}
                        ]}},
                        {"name": "rpc", "summary": {"dataPoints": [
                            {"count": 2, "sum": 4.0, "quantileValues": [
                                {"quantile": 0.5, "value": 1.5}, {"quantile": 0.99, "value": 2.5}
                            ]}
                        ]}}
                    ]
                }]
            }]
        });

        let messages = extract_metrics(&payload);
        let kinds: Vec<(&str, &str, f64)> = messages
            .iter()
            .map(|m| {
                (
                    m.attributes["metric.name"].as_str().unwrap(),
                    m.attributes["metric.kind"].as_str().unwrap(),
                    m.attributes["metric.value"].as_f64().unwrap(),
                )
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("requests", "sum", 7.0),
                ("temp", "gauge", 21.5),
                ("latency", "histogram_count", 3.0),
                ("latency", "histogram_sum", 30.0),
                ("rpc", "summary_count", 2.0),
                ("rpc", "summary_sum", 4.0),
                ("rpc", "summary_quantile", 1.5),
                ("rpc", "summary_quantile", 2.5),
            ]
        );
        assert_eq!(messages[0].timestamp_ms, 1_700_000_000_000);
        assert_eq!(messages[0].attributes["metric.unit"], json!("1"));
        assert_eq!(messages[0].service_name.as_deref(), Some("api"));
        assert_eq!(messages[7].attributes["quantile"], json!(0.99));
    }

    #[test]
    fn test_exponential_histogram_quantiles_cross_cumulative_thresholds() {
        // scale 0 => base 2; buckets (1,2], (2,4], (4,8], (8,16]
        let point = json!({
            "count": 10,
            "sum": 50.0,
            "scale": 0,
            "zeroCount": 0,
            "positive": {"offset": 0, "bucketCounts": [5, 3, 1, 1]}
        });
        let quantiles = exponential_quantiles(&point);
        assert_eq!(
            quantiles,
            vec![
                (0.5, "p50", 2.0),
                (0.9, "p90", 8.0),
                (0.95, "p95", 16.0),
                (0.99, "p99", 16.0),
            ]
        );

        let payload = json!({"resourceMetrics": [{"scopeMetrics": [{"metrics": [
            {"name": "size", "exponentialHistogram": {"dataPoints": [point]}}
        ]}]}]});
        let kinds: Vec<String> = extract_metrics(&payload)
            .iter()
            .map(|m| m.attributes["metric.kind"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            kinds,
            vec![
                "exp_histogram_count",
                "exp_histogram_sum",
                "exp_histogram_p50",
                "exp_histogram_p90",
                "exp_histogram_p95",
                "exp_histogram_p99"
            ]
        );
    }

    #[test]
    fn test_exponential_quantiles_zero_bucket_and_empty() {
        let point = json!({"scale": 1, "zeroCount": 9, "positive": {"offset": 2, "bucketCounts": [1]}});
        let quantiles = exponential_quantiles(&point);
        assert_eq!(quantiles[0], (0.5, "p50", 0.0));
        assert_eq!(quantiles[1], (0.9, "p90", 0.0));
        // base = sqrt(2), upper bound of index 2 is base^3
        let expected = 2f64.sqrt().powi(3);
        assert!((quantiles[3].2 - expected).abs() < 1e-12);

        assert!(exponential_quantiles(&json!({"scale": 0})).is_empty());
    }

    #[test]
    fn test_exponential_quantiles_saturate_huge_offset() {
        let point = json!({"scale": 0, "positive": {"offset": i64::MAX, "bucketCounts": [1, 1]}});
        let quantiles = exponential_quantiles(&point);
        assert_eq!(quantiles.len(), EXP_HISTOGRAM_QUANTILES.len());
        assert!(quantiles.iter().all(|(_, _, value)| value.is_infinite()));
    }

    #[test]
    fn test_correlation_priority() {
        let mut attrs = Attributes::new();
        attrs.insert("correlationId".to_string(), json!("abc"));
        attrs.insert("traceId".to_string(), json!("t-1"));
        assert_eq!(extract_correlation_id(&attrs, None).as_deref(), Some("abc"));

        attrs.remove("correlationId");
        assert_eq!(
            extract_correlation_id(&attrs, None).as_deref(),
            Some("trace:t-1")
        );
        assert_eq!(
            extract_correlation_id(&attrs, Some("t-2")).as_deref(),
            Some("trace:t-2")
        );

        let mut attrs = Attributes::new();
        attrs.insert("user_id".to_string(), json!(7));
        attrs.insert("requestId".to_string(), json!("r-9"));
        assert_eq!(
            extract_correlation_id(&attrs, None).as_deref(),
            Some("request:r-9")
        );
        attrs.insert("sessionId".to_string(), json!("s-1"));
        assert_eq!(
            extract_correlation_id(&attrs, None).as_deref(),
            Some("session:s-1")
        );
        attrs.clear();
        attrs.insert("user_id".to_string(), json!(7));
        assert_eq!(extract_correlation_id(&attrs, None).as_deref(), Some("user:7"));
        assert_eq!(extract_correlation_id(&Attributes::new(), None), None);
    }
}
