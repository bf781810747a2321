// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for the ingestion pipeline.

/// Errors raised while turning raw input into records.
///
/// [`crate::ingest::Ingestor::ingest`] folds these into a failed
/// [`crate::ingest::IngestResponse`].
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Unsupported input: {0}")]
    UnsupportedInput(String),

    #[error("Binary payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("Malformed OTLP payload: {0}")]
    MalformedOtlp(String),

    #[error(transparent)]
    Service(#[from] ServiceError),
}

/// Errors raised by the log transformer capability.
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("Log transformer unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to decode OTLP logs: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Invalid bucket query parameters.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error("stepMinutes must be at least 1, got {0}")]
    InvalidStep(i64),

    #[error("from ({from}) must not be after to ({to})")]
    InvalidRange { from: i64, to: i64 },

    #[error("Query spans {0} windows, more than the allowed maximum")]
    TooManyWindows(i64),
}

/// Failures talking to the pipeline service.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Failed to send command to pipeline service: {0}")]
    Send(String),

    #[error("Failed to receive response from pipeline service: {0}")]
    Receive(#[from] tokio::sync::oneshot::error::RecvError),

    #[error(transparent)]
    Query(#[from] QueryError),
}
