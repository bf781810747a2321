// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("Invalid configuration {name}={value}: {reason}")]
    InvalidConfig {
        name: &'static str,
        value: String,
        reason: String,
    },
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Server error: {0}")]
    Serve(#[from] std::io::Error),
}

impl CollectorError {
    pub(crate) fn invalid_config(
        name: &'static str,
        value: &str,
        reason: impl Into<String>,
    ) -> Self {
        CollectorError::InvalidConfig {
            name,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}
