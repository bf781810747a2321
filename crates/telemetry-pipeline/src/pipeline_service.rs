// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Single owner of the pipeline's mutable state.
//!
//! [`PipelineService`] holds the ring store, the minute buckets and the
//! correlation index and processes one command at a time, so a record is
//! pushed, aggregated, broadcast and indexed before the next one starts.
//! [`PipelineHandle`] is the cloneable front used by the ingest coordinator
//! and the HTTP handlers.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::aggregator::{AggregatedPoint, BucketAggregator, BucketQuery};
use crate::broadcast::BroadcastRegistry;
use crate::constants::{DEFAULT_CORRELATION_MAX_GROUPS, DEFAULT_RING_CAPACITY};
use crate::correlation::{CorrelationIndex, GroupState, GroupSummary};
use crate::errors::{QueryError, ServiceError};
use crate::record::{Record, RecordKind};
use crate::ring_buffer::{BufferCount, RingStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Per-kind ring buffer capacity.
    pub ring_capacity: usize,
    pub correlation_max_groups: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ring_capacity: DEFAULT_RING_CAPACITY,
            correlation_max_groups: DEFAULT_CORRELATION_MAX_GROUPS,
        }
    }
}

/// Records written by one ingest batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub written: usize,
    pub by_kind: BTreeMap<RecordKind, usize>,
}

/// Members of one correlation group, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorrelationGroup {
    pub key: String,
    pub state: GroupState,
    pub records: Vec<Arc<Record>>,
}

#[derive(Debug)]
pub enum PipelineCommand {
    Ingest {
        records: Vec<Record>,
        response_tx: oneshot::Sender<IngestSummary>,
    },
    Recent {
        kind: RecordKind,
        limit: Option<usize>,
        response_tx: oneshot::Sender<Vec<Arc<Record>>>,
    },
    Counts(oneshot::Sender<BTreeMap<RecordKind, BufferCount>>),
    Clear(oneshot::Sender<usize>),
    Buckets {
        query: BucketQuery,
        response_tx: oneshot::Sender<Result<Vec<AggregatedPoint>, QueryError>>,
    },
    Prune {
        cutoff_ms: i64,
        response_tx: oneshot::Sender<usize>,
    },
    Correlation {
        key: String,
        response_tx: oneshot::Sender<Option<CorrelationGroup>>,
    },
    CorrelationGroups(oneshot::Sender<Vec<GroupSummary>>),
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct PipelineHandle {
    tx: mpsc::UnboundedSender<PipelineCommand>,
}

impl PipelineHandle {
    async fn request<T>(
        &self,
        name: &str,
        command: impl FnOnce(oneshot::Sender<T>) -> PipelineCommand,
    ) -> Result<T, ServiceError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(command(response_tx))
            .map_err(|e| ServiceError::Send(format!("{name}: {e}")))?;
        Ok(response_rx.await?)
    }

    /// Stores, aggregates, broadcasts and indexes `records` in order.
    pub async fn ingest(&self, records: Vec<Record>) -> Result<IngestSummary, ServiceError> {
        self.request("ingest", |response_tx| PipelineCommand::Ingest {
            records,
            response_tx,
        })
        .await
    }

    /// The newest `limit` records of a kind (all when `None`), oldest first.
    pub async fn recent(
        &self,
        kind: RecordKind,
        limit: Option<usize>,
    ) -> Result<Vec<Arc<Record>>, ServiceError> {
        self.request("recent", |response_tx| PipelineCommand::Recent {
            kind,
            limit,
            response_tx,
        })
        .await
    }

    pub async fn counts(&self) -> Result<BTreeMap<RecordKind, BufferCount>, ServiceError> {
        self.request("counts", PipelineCommand::Counts).await
    }

    /// Empties every ring buffer and the correlation index. Buckets are kept.
    pub async fn clear(&self) -> Result<usize, ServiceError> {
        self.request("clear", PipelineCommand::Clear).await
    }

    pub async fn buckets(&self, query: BucketQuery) -> Result<Vec<AggregatedPoint>, ServiceError> {
        let points = self
            .request("buckets", |response_tx| PipelineCommand::Buckets {
                query,
                response_tx,
            })
            .await??;
        Ok(points)
    }

    /// Drops minute buckets that end at or before `cutoff_ms`.
    pub async fn prune(&self, cutoff_ms: i64) -> Result<usize, ServiceError> {
        self.request("prune", |response_tx| PipelineCommand::Prune {
            cutoff_ms,
            response_tx,
        })
        .await
    }

    pub async fn correlation(&self, key: &str) -> Result<Option<CorrelationGroup>, ServiceError> {
        let key = key.to_string();
        self.request("correlation", |response_tx| PipelineCommand::Correlation {
            key,
            response_tx,
        })
        .await
    }

    pub async fn correlation_groups(&self) -> Result<Vec<GroupSummary>, ServiceError> {
        self.request("correlation_groups", PipelineCommand::CorrelationGroups)
            .await
    }

    pub fn shutdown(&self) -> Result<(), mpsc::error::SendError<PipelineCommand>> {
        self.tx.send(PipelineCommand::Shutdown)
    }
}

pub struct PipelineService {
    store: RingStore,
    buckets: BucketAggregator,
    correlation: CorrelationIndex,
    registry: BroadcastRegistry,
    rx: mpsc::UnboundedReceiver<PipelineCommand>,
}

impl PipelineService {
    #[must_use]
    pub fn new(config: PipelineConfig, registry: BroadcastRegistry) -> (Self, PipelineHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = Self {
            store: RingStore::new(config.ring_capacity),
            buckets: BucketAggregator::new(),
            correlation: CorrelationIndex::new(config.correlation_max_groups),
            registry,
            rx,
        };
        (service, PipelineHandle { tx })
    }

    fn ingest(&mut self, records: Vec<Record>) -> IngestSummary {
        let mut summary = IngestSummary::default();
        for record in records {
            let record = Arc::new(record);
            let kind = record.kind();
            self.store.push(Arc::clone(&record));
            self.buckets.update(&record);
            self.registry.broadcast(&record);
            self.correlation.index(&record);

            summary.written += 1;
            *summary.by_kind.entry(kind).or_insert(0) += 1;
        }
        summary
    }

    pub async fn run(mut self) {
        debug!("Pipeline service started");

        while let Some(command) = self.rx.recv().await {
            match command {
                PipelineCommand::Ingest {
                    records,
                    response_tx,
                } => {
                    let summary = self.ingest(records);
                    if response_tx.send(summary).is_err() {
                        error!("Failed to send ingest response - receiver dropped");
                    }
                }

                PipelineCommand::Recent {
                    kind,
                    limit,
                    response_tx,
                } => {
                    let records = match limit {
                        Some(limit) => self.store.latest(kind, limit),
                        None => self.store.snapshot(kind),
                    };
                    if response_tx.send(records).is_err() {
                        error!("Failed to send recent response - receiver dropped");
                    }
                }

                PipelineCommand::Counts(response_tx) => {
                    if response_tx.send(self.store.counts()).is_err() {
                        error!("Failed to send counts response - receiver dropped");
                    }
                }

                PipelineCommand::Clear(response_tx) => {
                    let removed = self.store.clear();
                    let groups = self.correlation.clear();
                    debug!("Cleared {removed} records and {groups} correlation groups");
                    if response_tx.send(removed).is_err() {
                        error!("Failed to send clear response - receiver dropped");
                    }
                }

                PipelineCommand::Buckets { query, response_tx } => {
                    if response_tx.send(self.buckets.query(&query)).is_err() {
                        error!("Failed to send buckets response - receiver dropped");
                    }
                }

                PipelineCommand::Prune {
                    cutoff_ms,
                    response_tx,
                } => {
                    let pruned = self.buckets.prune(cutoff_ms);
                    if pruned > 0 {
                        debug!("Pruned {pruned} minute buckets older than {cutoff_ms}");
                    }
                    if response_tx.send(pruned).is_err() {
                        error!("Failed to send prune response - receiver dropped");
                    }
                }

                PipelineCommand::Correlation { key, response_tx } => {
                    let group = self.correlation.get(&key).map(|records| CorrelationGroup {
                        state: self
                            .correlation
                            .state(&key)
                            .unwrap_or(GroupState::Pending),
                        key,
                        records,
                    });
                    if response_tx.send(group).is_err() {
                        error!("Failed to send correlation response - receiver dropped");
                    }
                }

                PipelineCommand::CorrelationGroups(response_tx) => {
                    if response_tx.send(self.correlation.groups()).is_err() {
                        error!("Failed to send correlation groups response - receiver dropped");
                    }
                }

                PipelineCommand::Shutdown => {
                    debug!("Pipeline service shutting down");
                    break;
                }
            }
        }

        debug!("Pipeline service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{StreamMessage, Transport};
    use crate::constants::MINUTE_MS;
    use crate::record::{Attributes, LogItem, RequestItem};
    use serde_json::json;

    const BASE: i64 = 1_700_000_040_000;

    fn request(status: i64, key: &str) -> Record {
        let mut attrs = Attributes::new();
        attrs.insert("correlationId".to_string(), json!(key));
        Record::Request(RequestItem {
            t: BASE,
            path: Some("/api/x".to_string()),
            status: Some(status),
            duration_ms: (status != 0).then_some(120.0),
            attrs: Some(attrs),
            ..Default::default()
        })
    }

    fn start(config: PipelineConfig) -> (PipelineHandle, BroadcastRegistry, tokio::task::JoinHandle<()>) {
        let registry = BroadcastRegistry::new(16);
        let (service, handle) = PipelineService::new(config, registry.clone());
        let task = tokio::spawn(service.run());
        (handle, registry, task)
    }

    #[tokio::test]
    async fn test_ingest_updates_every_stage() {
        let (handle, registry, task) = start(PipelineConfig::default());
        let mut subscription = registry.register(Transport::Push);

        let summary = handle
            .ingest(vec![request(200, "abc"), request(0, "abc")])
            .await
            .expect("ingest failed");
        assert_eq!(summary.written, 2);
        assert_eq!(summary.by_kind[&RecordKind::Requests], 2);

        let recent = handle.recent(RecordKind::Requests, None).await.unwrap();
        let statuses: Vec<Option<i64>> = recent.iter().map(|r| r.status()).collect();
        assert_eq!(statuses, vec![Some(200), Some(0)]);

        let points = handle
            .buckets(BucketQuery {
                from: BASE,
                to: BASE,
                step_minutes: 1,
                top_n_paths: 5,
            })
            .await
            .unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].resp_count, 1);
        assert_eq!(points[0].req_count, 1);
        assert_eq!(points[0].status_counts, BTreeMap::from([(200, 1)]));
        assert_eq!(points[0].latency.count, 1);
        assert_eq!(points[0].latency.avg, Some(120.0));

        let group = handle.correlation("abc").await.unwrap().unwrap();
        assert_eq!(group.state, GroupState::Complete);
        assert_eq!(group.records.len(), 2);

        assert!(matches!(subscription.recv().await, Some(StreamMessage::Ping { .. })));
        assert!(matches!(
            subscription.recv().await,
            Some(StreamMessage::Record { kind: RecordKind::Requests, .. })
        ));

        handle.shutdown().expect("Failed to shutdown");
        task.await.expect("Service task failed");
    }

    #[tokio::test]
    async fn test_ring_capacity_and_counts() {
        let (handle, _registry, task) = start(PipelineConfig {
            ring_capacity: 2,
            ..Default::default()
        });
        let logs = (0..3)
            .map(|i| {
                Record::Log(LogItem {
                    t: BASE + i,
                    message: format!("log {i}"),
                    ..Default::default()
                })
            })
            .collect();
        handle.ingest(logs).await.unwrap();

        let counts = handle.counts().await.unwrap();
        assert_eq!(counts[&RecordKind::Logs].length, 2);
        assert_eq!(counts[&RecordKind::Logs].capacity, 2);

        let latest = handle.recent(RecordKind::Logs, Some(1)).await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].timestamp(), BASE + 2);

        handle.shutdown().unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_clear_is_idempotent_and_keeps_buckets() {
        let (handle, _registry, task) = start(PipelineConfig::default());
        handle.ingest(vec![request(200, "k")]).await.unwrap();

        assert_eq!(handle.clear().await.unwrap(), 1);
        assert_eq!(handle.clear().await.unwrap(), 0);
        assert!(handle
            .counts()
            .await
            .unwrap()
            .values()
            .all(|c| c.length == 0));
        assert!(handle.correlation_groups().await.unwrap().is_empty());

        let points = handle
            .buckets(BucketQuery {
                from: BASE,
                to: BASE,
                step_minutes: 1,
                top_n_paths: 1,
            })
            .await
            .unwrap();
        assert_eq!(points[0].records, 1);

        assert_eq!(handle.prune(BASE + MINUTE_MS).await.unwrap(), 1);
        handle.shutdown().unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_query_and_stopped_service() {
        let (handle, _registry, task) = start(PipelineConfig::default());
        let error = handle
            .buckets(BucketQuery {
                from: BASE,
                to: BASE,
                step_minutes: 0,
                top_n_paths: 5,
            })
            .await
            .unwrap_err();
        assert!(matches!(error, ServiceError::Query(QueryError::InvalidStep(0))));
        assert!(handle.correlation("missing").await.unwrap().is_none());

        handle.shutdown().unwrap();
        task.await.unwrap();
        assert!(matches!(
            handle.counts().await,
            Err(ServiceError::Send(_))
        ));
    }
}
