// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ingest coordinator: routes raw input to the right adapter, classifies the
//! results and hands the whole batch to the pipeline service.
//!
//! A batch is fully parsed before anything is written, so a rejected input
//! never leaves partial state behind.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::IngestError;
use crate::mapper::{classify_message, map_value};
use crate::otlp::{extract_metrics, extract_spans, is_otlp_payload};
use crate::pipeline_service::PipelineHandle;
use crate::record::{Record, RecordKind};
use crate::syslog::{is_syslog_line, parse_syslog_line};
use crate::transformer::LogTransformer;
use crate::util::json_type_of;

/// Raw input as received from a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestInput {
    Text(String),
    Binary(Vec<u8>),
    Json(Value),
}

/// Outcome reported back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub written: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub by_kind: Option<BTreeMap<RecordKind, usize>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl IngestResponse {
    #[must_use]
    pub fn accepted(written: usize, by_kind: BTreeMap<RecordKind, usize>) -> Self {
        Self {
            success: true,
            written: Some(written),
            by_kind: Some(by_kind),
            message: None,
        }
    }

    #[must_use]
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            written: None,
            by_kind: None,
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Ingestor {
    handle: PipelineHandle,
    transformer: Arc<dyn LogTransformer>,
}

impl Ingestor {
    #[must_use]
    pub fn new(handle: PipelineHandle, transformer: Arc<dyn LogTransformer>) -> Self {
        Self {
            handle,
            transformer,
        }
    }

    #[must_use]
    pub const fn handle(&self) -> &PipelineHandle {
        &self.handle
    }

    /// Parses, classifies and stores one input. Failures are reported in the
    /// response, never raised.
    pub async fn ingest(&self, input: IngestInput) -> IngestResponse {
        match self.try_ingest(input).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Rejected ingest: {e}");
                IngestResponse::rejected(e.to_string())
            }
        }
    }

    /// Like [`Ingestor::ingest`] but hands the failure back to the caller.
    pub async fn try_ingest(&self, input: IngestInput) -> Result<IngestResponse, IngestError> {
        let records = self.parse(input).await?;
        if records.is_empty() {
            return Ok(IngestResponse::accepted(0, BTreeMap::new()));
        }
        let summary = self.handle.ingest(records).await?;
        debug!("Ingested {} records", summary.written);
        Ok(IngestResponse::accepted(summary.written, summary.by_kind))
    }

    /// Turns raw input into records without touching any state.
    pub async fn parse(&self, input: IngestInput) -> Result<Vec<Record>, IngestError> {
        match input {
            IngestInput::Text(text) => Ok(text_records(&text)),
            IngestInput::Binary(bytes) => Ok(text_records(std::str::from_utf8(&bytes)?)),
            IngestInput::Json(value) => self.json_records(value).await,
        }
    }

    async fn json_records(&self, value: Value) -> Result<Vec<Record>, IngestError> {
        match value {
            Value::String(text) => Ok(text_records(&text)),
            Value::Array(items) => {
                let mut records = Vec::with_capacity(items.len());
                for item in &items {
                    if is_otlp_payload(item) {
                        records.extend(self.otlp_records(item).await?);
                    } else {
                        records.push(map_value(item));
                    }
                }
                Ok(records)
            }
            Value::Object(_) if is_otlp_payload(&value) => self.otlp_records(&value).await,
            Value::Object(_) => Ok(vec![map_value(&value)]),
            other => Err(IngestError::UnsupportedInput(format!(
                "top-level JSON {} is not ingestible",
                json_type_of(&other)
            ))),
        }
    }

    async fn otlp_records(&self, payload: &Value) -> Result<Vec<Record>, IngestError> {
        let mut messages = Vec::new();
        if payload.get("resourceLogs").is_some() {
            let logs = self
                .transformer
                .transform(payload)
                .await
                .map_err(|e| IngestError::MalformedOtlp(e.to_string()))?;
            messages.extend(logs);
        }
        messages.extend(extract_spans(payload));
        messages.extend(extract_metrics(payload));
        debug!("Decoded {} OTLP messages", messages.len());
        Ok(messages.into_iter().map(classify_message).collect())
    }
}

/// One record per non-blank line: syslog-looking lines go through the syslog
/// adapter, anything else becomes a plain log.
fn text_records(text: &str) -> Vec<Record> {
    text.lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            if is_syslog_line(line) {
                classify_message(parse_syslog_line(line))
            } else {
                map_value(&Value::String(line.to_string()))
            }
        })
        .collect()
}
