// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Default number of records retained per record kind.
pub const DEFAULT_RING_CAPACITY: usize = 2000;

/// Default per-subscriber queue depth before new messages are dropped.
pub const DEFAULT_SUBSCRIBER_QUEUE_CAPACITY: usize = 1024;

/// Default bound on the number of tracked correlation groups.
pub const DEFAULT_CORRELATION_MAX_GROUPS: usize = 10_000;

/// Default minute-bucket retention (one day).
pub const DEFAULT_BUCKET_RETENTION_MINUTES: u64 = 1440;

pub const MINUTE_MS: i64 = 60_000;

/// Upper bound on windows produced by a single bucket query.
pub const MAX_QUERY_WINDOWS: i64 = 10_000;

pub const NANOS_PER_MILLI: u64 = 1_000_000;

/// Quantiles estimated for OTLP exponential histograms.
pub const EXP_HISTOGRAM_QUANTILES: [(f64, &str); 4] =
    [(0.5, "p50"), (0.9, "p90"), (0.95, "p95"), (0.99, "p99")];
