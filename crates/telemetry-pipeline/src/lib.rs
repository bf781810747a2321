// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Telemetry ingestion pipeline.
//!
//! Raw input (text, bytes or JSON) flows one way through the pipeline:
//!
//! ```text
//! raw input ──> adapters (otlp, syslog) / generic mapper ──> Record
//!                                                             │
//!              PipelineService (single owner of mutable state)│
//!                ├─ ring buffer push                          ▼
//!                ├─ minute bucket update
//!                ├─ broadcast to live subscribers
//!                └─ correlation index update
//! ```
//!
//! Query paths (recent items, counts, bucket rollups, correlation groups) are
//! answered from snapshots taken inside the service and never feed back into
//! ingestion.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod aggregator;
pub mod broadcast;
pub mod constants;
pub mod correlation;
pub mod errors;
pub mod ingest;
pub mod mapper;
pub mod otlp;
pub mod pipeline_service;
pub mod record;
pub mod ring_buffer;
pub mod syslog;
pub mod transformer;
pub mod util;
