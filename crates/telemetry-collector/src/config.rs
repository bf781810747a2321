// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::str::FromStr;

use telemetry_pipeline::constants::{
    DEFAULT_BUCKET_RETENTION_MINUTES, DEFAULT_CORRELATION_MAX_GROUPS, DEFAULT_RING_CAPACITY,
    DEFAULT_SUBSCRIBER_QUEUE_CAPACITY,
};
use telemetry_pipeline::pipeline_service::PipelineConfig;
use telemetry_pipeline::transformer::TransformerKind;

use crate::error::CollectorError;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 4319;
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

const LOG_LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Lowercase `tracing` level directive.
    pub log_level: String,
    pub log_transformer: TransformerKind,
    /// Records retained per kind.
    pub ring_capacity: usize,
    pub subscriber_queue_capacity: usize,
    pub bucket_retention_minutes: u64,
    pub correlation_max_groups: usize,
    pub max_body_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            log_transformer: TransformerKind::default(),
            ring_capacity: DEFAULT_RING_CAPACITY,
            subscriber_queue_capacity: DEFAULT_SUBSCRIBER_QUEUE_CAPACITY,
            bucket_retention_minutes: DEFAULT_BUCKET_RETENTION_MINUTES,
            correlation_max_groups: DEFAULT_CORRELATION_MAX_GROUPS,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl Config {
    /// Reads the `TELEMETRY_*` environment variables.
    pub fn from_env() -> Result<Config, CollectorError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds a config from any variable source. Unset or blank variables
    /// keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Config, CollectorError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let defaults = Config::default();

        let host = read("TELEMETRY_HOST").unwrap_or(defaults.host);
        let port = parse_var(&read, "TELEMETRY_PORT", defaults.port)?;

        let log_level = match read("TELEMETRY_LOG_LEVEL") {
            Some(level) => {
                let level = level.to_lowercase();
                if !LOG_LEVELS.contains(&level.as_str()) {
                    return Err(CollectorError::invalid_config(
                        "TELEMETRY_LOG_LEVEL",
                        &level,
                        "expected one of trace, debug, info, warn, error, off",
                    ));
                }
                level
            }
            None => defaults.log_level,
        };

        let log_transformer = match read("TELEMETRY_LOG_TRANSFORMER") {
            Some(value) => TransformerKind::from_str(&value).map_err(|_| {
                CollectorError::invalid_config(
                    "TELEMETRY_LOG_TRANSFORMER",
                    &value,
                    "expected library or manual",
                )
            })?,
            None => defaults.log_transformer,
        };

        let config = Config {
            host,
            port,
            log_level,
            log_transformer,
            ring_capacity: parse_var(&read, "TELEMETRY_RING_CAPACITY", defaults.ring_capacity)?,
            subscriber_queue_capacity: parse_var(
                &read,
                "TELEMETRY_SUBSCRIBER_QUEUE",
                defaults.subscriber_queue_capacity,
            )?,
            bucket_retention_minutes: parse_var(
                &read,
                "TELEMETRY_BUCKET_RETENTION_MINUTES",
                defaults.bucket_retention_minutes,
            )?,
            correlation_max_groups: parse_var(
                &read,
                "TELEMETRY_CORRELATION_MAX_GROUPS",
                defaults.correlation_max_groups,
            )?,
            max_body_bytes: parse_var(&read, "TELEMETRY_MAX_BODY_BYTES", defaults.max_body_bytes)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), CollectorError> {
        let positive = [
            ("TELEMETRY_RING_CAPACITY", self.ring_capacity as u64),
            (
                "TELEMETRY_SUBSCRIBER_QUEUE",
                self.subscriber_queue_capacity as u64,
            ),
            (
                "TELEMETRY_BUCKET_RETENTION_MINUTES",
                self.bucket_retention_minutes,
            ),
            (
                "TELEMETRY_CORRELATION_MAX_GROUPS",
                self.correlation_max_groups as u64,
            ),
            ("TELEMETRY_MAX_BODY_BYTES", self.max_body_bytes as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(CollectorError::invalid_config(
                    name,
                    "0",
                    "must be greater than zero",
                ));
            }
        }
        Ok(())
    }

    /// Socket address the server binds to.
    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    #[must_use]
    pub const fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            ring_capacity: self.ring_capacity,
            correlation_max_groups: self.correlation_max_groups,
        }
    }

    /// Bucket retention in milliseconds.
    #[must_use]
    pub fn retention_ms(&self) -> i64 {
        i64::try_from(self.bucket_retention_minutes)
            .unwrap_or(i64::MAX)
            .saturating_mul(60_000)
    }
}

fn parse_var<T, R>(read: &R, name: &'static str, default: T) -> Result<T, CollectorError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    R: Fn(&str) -> Option<String>,
{
    match read(name) {
        Some(value) => value
            .parse::<T>()
            .map_err(|e| CollectorError::invalid_config(name, &value, e.to_string())),
        None => Ok(default),
    }
}
