// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Live fan-out of accepted records to stream and socket subscribers.
//!
//! Every subscriber owns a bounded queue. Delivery never blocks: when a
//! queue is full the new message is dropped for that subscriber only, and a
//! subscriber whose receiving side has gone away is removed on the next
//! broadcast.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::constants::DEFAULT_SUBSCRIBER_QUEUE_CAPACITY;
use crate::record::{Record, RecordKind};
use crate::util::now_ms;

/// How a subscriber receives messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Server-sent events (`GET /stream`).
    Push,
    /// WebSocket (`GET /socket`).
    Socket,
}

/// Message delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamMessage {
    Ping { t: i64 },
    Record { kind: RecordKind, data: Arc<Record> },
}

impl StreamMessage {
    #[must_use]
    pub fn ping() -> Self {
        StreamMessage::Ping { t: now_ms() }
    }

    #[must_use]
    pub fn record(record: Arc<Record>) -> Self {
        StreamMessage::Record {
            kind: record.kind(),
            data: record,
        }
    }

    /// JSON text of the message.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug)]
struct Subscriber {
    transport: Transport,
    sender: mpsc::Sender<StreamMessage>,
}

#[derive(Debug, Default)]
struct RegistryState {
    next_id: u64,
    subscribers: HashMap<u64, Subscriber>,
    dropped: u64,
}

/// Result of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub delivered: usize,
    pub dropped: usize,
    pub closed: usize,
}

/// Registry of live subscribers, shared between the HTTP handlers that
/// register them and the pipeline service that delivers to them.
#[derive(Debug, Clone)]
pub struct BroadcastRegistry {
    state: Arc<Mutex<RegistryState>>,
    queue_capacity: usize,
}

impl Default for BroadcastRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_QUEUE_CAPACITY)
    }
}

impl BroadcastRegistry {
    #[must_use]
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(RegistryState::default())),
            queue_capacity: queue_capacity.max(1),
        }
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        // Updates never leave the state half-written, so a poisoned lock is
        // still consistent.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Registers a subscriber and enqueues its initial ping.
    #[must_use]
    pub fn register(&self, transport: Transport) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        // The queue is empty, so the ping always fits.
        let _ = sender.try_send(StreamMessage::ping());

        let mut state = self.state();
        let id = state.next_id;
        state.next_id += 1;
        state.subscribers.insert(id, Subscriber { transport, sender });
        debug!(
            "Registered {transport:?} subscriber {id}, {} active",
            state.subscribers.len()
        );
        drop(state);

        Subscription {
            id,
            transport,
            receiver,
            registry: self.clone(),
        }
    }

    fn unregister(&self, id: u64) {
        let mut state = self.state();
        if state.subscribers.remove(&id).is_some() {
            debug!(
                "Unregistered subscriber {id}, {} active",
                state.subscribers.len()
            );
        }
    }

    /// Offers a record to every subscriber without waiting on any of them.
    pub fn broadcast(&self, record: &Arc<Record>) -> BroadcastOutcome {
        let message = StreamMessage::record(Arc::clone(record));
        let mut outcome = BroadcastOutcome::default();
        let mut state = self.state();
        let mut closed = Vec::new();

        for (id, subscriber) in &state.subscribers {
            match subscriber.sender.try_send(message.clone()) {
                Ok(()) => outcome.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    outcome.dropped += 1;
                    warn!(
                        "Subscriber {id} ({:?}) queue is full, dropping {} record",
                        subscriber.transport,
                        record.kind()
                    );
                }
                Err(TrySendError::Closed(_)) => closed.push(*id),
            }
        }
        for id in &closed {
            state.subscribers.remove(id);
            debug!("Removed closed subscriber {id}");
        }
        outcome.closed = closed.len();
        state.dropped += outcome.dropped as u64;
        outcome
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state().subscribers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn push_count(&self) -> usize {
        self.count(Transport::Push)
    }

    #[must_use]
    pub fn socket_count(&self) -> usize {
        self.count(Transport::Socket)
    }

    fn count(&self, transport: Transport) -> usize {
        self.state()
            .subscribers
            .values()
            .filter(|s| s.transport == transport)
            .count()
    }

    /// Messages dropped on full queues since startup.
    #[must_use]
    pub fn dropped_total(&self) -> u64 {
        self.state().dropped
    }
}

/// Receiving end of a registration. Dropping it unregisters the subscriber.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    transport: Transport,
    receiver: mpsc::Receiver<StreamMessage>,
    registry: BroadcastRegistry,
}

impl Subscription {
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub const fn transport(&self) -> Transport {
        self.transport
    }

    /// Next queued message; `None` once the registry is gone.
    pub async fn recv(&mut self) -> Option<StreamMessage> {
        self.receiver.recv().await
    }

    /// Closes the queue while keeping the registration, so the next
    /// broadcast sees a closed subscriber.
    pub fn close(&mut self) {
        self.receiver.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}
