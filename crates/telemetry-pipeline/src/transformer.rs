// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Interchangeable OTLP log transformers.
//!
//! [`LibraryLogTransformer`] decodes the export through `opentelemetry-proto`;
//! [`ManualLogTransformer`] walks the JSON directly. Both feed the same
//! message builder so their outputs match field for field. The default
//! [`FallbackLogTransformer`] tries the library first and retries with the
//! manual walker when decoding fails.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use opentelemetry_proto::tonic::collector::logs::v1::ExportLogsServiceRequest;
use opentelemetry_proto::tonic::common::v1::{any_value::Value as AnyValueKind, AnyValue, KeyValue};
use serde_json::{Number, Value};
use tracing::{debug, warn};

use crate::errors::TransformError;
use crate::otlp::{build_log_message, extract_logs, LogParts};
use crate::record::{Attributes, BaseMessage};

#[async_trait]
pub trait LogTransformer: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Turns the `resourceLogs` of an OTLP/JSON export into messages.
    async fn transform(&self, payload: &Value) -> Result<Vec<BaseMessage>, TransformError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ManualLogTransformer;

#[async_trait]
impl LogTransformer for ManualLogTransformer {
    fn name(&self) -> &'static str {
        "manual"
    }

    async fn transform(&self, payload: &Value) -> Result<Vec<BaseMessage>, TransformError> {
        Ok(extract_logs(payload))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LibraryLogTransformer;

impl LibraryLogTransformer {
    fn decode(payload: &Value) -> Result<Vec<BaseMessage>, TransformError> {
        let request: ExportLogsServiceRequest = serde_json::from_value(payload.clone())?;
        let mut messages = Vec::new();
        for (i, resource_logs) in request.resource_logs.iter().enumerate() {
            let mut resource_attrs = Attributes::new();
            if let Some(resource) = &resource_logs.resource {
                merge_key_values(&mut resource_attrs, &resource.attributes)?;
            }
            for (j, scope_logs) in resource_logs.scope_logs.iter().enumerate() {
                for (k, record) in scope_logs.log_records.iter().enumerate() {
                    let mut attributes = resource_attrs.clone();
                    merge_key_values(&mut attributes, &record.attributes)?;
                    let body = match &record.body {
                        Some(body) => any_value_to_json(body)?,
                        None => Value::Null,
                    };
                    let raw = payload
                        .pointer(&format!("/resourceLogs/{i}/scopeLogs/{j}/logRecords/{k}"))
                        .cloned()
                        .unwrap_or(Value::Null);
                    messages.push(build_log_message(LogParts {
                        time_nanos: record.time_unix_nano,
                        observed_nanos: record.observed_time_unix_nano,
                        severity_text: record.severity_text.clone(),
                        severity_number: i64::from(record.severity_number),
                        body,
                        attributes,
                        trace_id: hex::encode(&record.trace_id),
                        span_id: hex::encode(&record.span_id),
                        raw,
                    }));
                }
            }
        }
        Ok(messages)
    }
}

#[async_trait]
impl LogTransformer for LibraryLogTransformer {
    fn name(&self) -> &'static str {
        "library"
    }

    async fn transform(&self, payload: &Value) -> Result<Vec<BaseMessage>, TransformError> {
        Self::decode(payload)
    }
}

fn merge_key_values(map: &mut Attributes, list: &[KeyValue]) -> Result<(), TransformError> {
    for kv in list {
        let value = match &kv.value {
            Some(value) => any_value_to_json(value)?,
            None => Value::Null,
        };
        map.insert(kv.key.clone(), value);
    }
    Ok(())
}

fn any_value_to_json(value: &AnyValue) -> Result<Value, TransformError> {
    let converted = match &value.value {
        None => Value::Null,
        Some(AnyValueKind::StringValue(s)) => Value::String(s.clone()),
        Some(AnyValueKind::BoolValue(b)) => Value::Bool(*b),
        Some(AnyValueKind::IntValue(i)) => Value::from(*i),
        Some(AnyValueKind::DoubleValue(d)) => Number::from_f64(*d).map_or(Value::Null, Value::Number),
        Some(AnyValueKind::ArrayValue(array)) => Value::Array(
            array
                .values
                .iter()
                .map(any_value_to_json)
                .collect::<Result<_, _>>()?,
        ),
        Some(AnyValueKind::KvlistValue(list)) => {
            let mut map = Attributes::new();
            merge_key_values(&mut map, &list.values)?;
            Value::Object(map)
        }
        // The JSON encoding carries bytes as base64 text, which only the
        // manual walker keeps verbatim.
        Some(AnyValueKind::BytesValue(_)) => {
            return Err(TransformError::Unavailable(
                "bytes values are not rendered by the library transformer".to_string(),
            ))
        }
    };
    Ok(converted)
}

/// Library decoding with the manual walker as a safety net.
#[derive(Debug)]
pub struct FallbackLogTransformer {
    primary: Arc<dyn LogTransformer>,
    fallback: Arc<dyn LogTransformer>,
}

impl FallbackLogTransformer {
    #[must_use]
    pub fn new(primary: Arc<dyn LogTransformer>, fallback: Arc<dyn LogTransformer>) -> Self {
        Self { primary, fallback }
    }
}

impl Default for FallbackLogTransformer {
    fn default() -> Self {
        Self::new(Arc::new(LibraryLogTransformer), Arc::new(ManualLogTransformer))
    }
}

#[async_trait]
impl LogTransformer for FallbackLogTransformer {
    fn name(&self) -> &'static str {
        self.primary.name()
    }

    async fn transform(&self, payload: &Value) -> Result<Vec<BaseMessage>, TransformError> {
        match self.primary.transform(payload).await {
            Ok(messages) => Ok(messages),
            Err(e) => {
                warn!(
                    "{} log transformer failed, retrying with {}: {e}",
                    self.primary.name(),
                    self.fallback.name()
                );
                self.fallback.transform(payload).await
            }
        }
    }
}

/// Which transformer handles OTLP logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransformerKind {
    #[default]
    Library,
    Manual,
}

impl TransformerKind {
    #[must_use]
    pub fn build(self) -> Arc<dyn LogTransformer> {
        debug!("Using the {self} OTLP log transformer");
        match self {
            TransformerKind::Library => Arc::new(FallbackLogTransformer::default()),
            TransformerKind::Manual => Arc::new(ManualLogTransformer),
        }
    }
}

impl fmt::Display for TransformerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransformerKind::Library => f.write_str("library"),
            TransformerKind::Manual => f.write_str("manual"),
        }
    }
}

impl FromStr for TransformerKind {
    type Err = TransformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "library" | "lib" => Ok(TransformerKind::Library),
            "manual" => Ok(TransformerKind::Manual),
            other => Err(TransformError::Unavailable(format!(
                "unknown log transformer: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry_proto::tonic::common::v1::{any_value, KeyValue};
    use opentelemetry_proto::tonic::logs::v1::{LogRecord, ResourceLogs, ScopeLogs};
    use opentelemetry_proto::tonic::resource::v1::Resource;
    use serde_json::json;

    fn string_kv(key: &str, value: &str) -> KeyValue {
        KeyValue {
            key: key.to_string(),
            value: Some(AnyValue {
                value: Some(any_value::Value::StringValue(value.to_string())),
            }),
        }
    }

    fn sample_payload() -> Value {
        let request = ExportLogsServiceRequest {
            resource_logs: vec![ResourceLogs {
                resource: Some(Resource {
                    attributes: vec![string_kv("service.name", "checkout")],
                    ..Default::default()
                }),
                scope_logs: vec![ScopeLogs {
                    log_records: vec![
                        LogRecord {
                            time_unix_nano: 1_704_067_200_000_000_000,
                            severity_text: "WARN".to_string(),
                            body: Some(AnyValue {
                                value: Some(any_value::Value::StringValue(
                                    "disk almost full".to_string(),
                                )),
                            }),
                            attributes: vec![string_kv("disk", "/dev/sda1")],
                            trace_id: vec![0xab; 16],
                            span_id: vec![0xcd; 8],
                            ..Default::default()
                        },
                        LogRecord {
                            observed_time_unix_nano: 1_704_067_201_000_000_000,
                            severity_number: 9,
                            ..Default::default()
                        },
                    ],
                    ..Default::default()
                }],
                ..Default::default()
            }],
        };
        serde_json::to_value(&request).expect("serialize sample export")
    }

    fn without_ids(mut messages: Vec<BaseMessage>) -> Vec<BaseMessage> {
        for message in &mut messages {
            message.id.clear();
        }
        messages
    }

    #[tokio::test]
    async fn test_library_and_manual_agree() {
        let payload = sample_payload();
        let library = LibraryLogTransformer.transform(&payload).await.unwrap();
        let manual = ManualLogTransformer.transform(&payload).await.unwrap();

        assert_eq!(library.len(), 2);
        assert_eq!(without_ids(library.clone()), without_ids(manual));
        assert_eq!(library[0].message, "disk almost full");
        assert_eq!(library[0].timestamp_ms, 1_704_067_200_000);
        assert_eq!(library[0].service_name.as_deref(), Some("checkout"));
        assert_eq!(
            library[0].correlation_id,
            Some(format!("trace:{}", "ab".repeat(16)))
        );
        assert_eq!(library[1].timestamp_ms, 1_704_067_201_000);
        assert_eq!(library[1].trace_id, None);
    }

    #[tokio::test]
    async fn test_library_rejects_malformed_export() {
        let payload = json!({"resourceLogs": "nope"});
        assert!(LibraryLogTransformer.transform(&payload).await.is_err());
    }

    #[tokio::test]
    async fn test_fallback_uses_manual_on_decode_failure() {
        let payload = json!({"resourceLogs": "nope"});
        let transformer = FallbackLogTransformer::default();
        let messages = transformer.transform(&payload).await.unwrap();
        assert!(messages.is_empty());
        assert_eq!(transformer.name(), "library");
    }

    #[tokio::test]
    async fn test_fallback_output_matches_manual() {
        let payload = sample_payload();
        let fallback = TransformerKind::Library.build().transform(&payload).await.unwrap();
        let manual = TransformerKind::Manual.build().transform(&payload).await.unwrap();
        assert_eq!(without_ids(fallback), without_ids(manual));
    }

    #[test]
    fn test_transformer_kind_from_str() {
        assert_eq!("library".parse::<TransformerKind>().unwrap(), TransformerKind::Library);
        assert_eq!(" Manual ".parse::<TransformerKind>().unwrap(), TransformerKind::Manual);
        assert!("protobuf".parse::<TransformerKind>().is_err());
        assert_eq!(TransformerKind::default().to_string(), "library");
    }
}
