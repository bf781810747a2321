// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Grouping of records that share a correlation key.
//!
//! A record with status `0` is the request half of a pair and any other
//! status is the response half. A group holding both halves is complete.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::constants::DEFAULT_CORRELATION_MAX_GROUPS;
use crate::otlp::extract_correlation_id;
use crate::record::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupState {
    Pending,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSummary {
    pub key: String,
    pub count: usize,
    pub state: GroupState,
    pub first_seen: i64,
    pub last_seen: i64,
}

#[derive(Debug)]
struct Group {
    first_seen: i64,
    last_seen: i64,
    members: Vec<Arc<Record>>,
    has_request: bool,
    has_response: bool,
    /// Position in [`CorrelationIndex::recency`].
    sequence: u64,
}

impl Group {
    const fn state(&self) -> GroupState {
        if self.has_request && self.has_response {
            GroupState::Complete
        } else {
            GroupState::Pending
        }
    }
}

/// Resolved correlation key of a stored record, if any.
#[must_use]
pub fn correlation_key(record: &Record) -> Option<String> {
    record
        .attrs()
        .and_then(|attrs| extract_correlation_id(attrs, None))
}

#[derive(Debug)]
pub struct CorrelationIndex {
    groups: HashMap<String, Group>,
    /// Update sequence to key, oldest first.
    recency: BTreeMap<u64, String>,
    next_sequence: u64,
    max_groups: usize,
}

impl Default for CorrelationIndex {
    fn default() -> Self {
        Self::new(DEFAULT_CORRELATION_MAX_GROUPS)
    }
}

impl CorrelationIndex {
    #[must_use]
    pub fn new(max_groups: usize) -> Self {
        Self {
            groups: HashMap::new(),
            recency: BTreeMap::new(),
            next_sequence: 0,
            max_groups: max_groups.max(1),
        }
    }

    /// Appends the record to its group. Returns the key it was filed under,
    /// or `None` when the record carries no correlation key.
    pub fn index(&mut self, record: &Arc<Record>) -> Option<String> {
        let key = correlation_key(record)?;
        let t = record.timestamp();
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        match self.groups.get_mut(&key) {
            Some(group) => {
                self.recency.remove(&group.sequence);
                group.sequence = sequence;
                group.first_seen = group.first_seen.min(t);
                group.last_seen = group.last_seen.max(t);
                group.members.push(Arc::clone(record));
                mark_halves(group, record);
            }
            None => {
                if self.groups.len() >= self.max_groups {
                    self.evict_oldest();
                }
                let mut group = Group {
                    first_seen: t,
                    last_seen: t,
                    members: vec![Arc::clone(record)],
                    has_request: false,
                    has_response: false,
                    sequence,
                };
                mark_halves(&mut group, record);
                self.groups.insert(key.clone(), group);
            }
        }
        self.recency.insert(sequence, key.clone());
        Some(key)
    }

    fn evict_oldest(&mut self) {
        if let Some((_, key)) = self.recency.pop_first() {
            self.groups.remove(&key);
            debug!("Evicted correlation group {key}");
        }
    }

    /// Members of a group in insertion order.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Vec<Arc<Record>>> {
        self.groups.get(key).map(|group| group.members.clone())
    }

    #[must_use]
    pub fn state(&self, key: &str) -> Option<GroupState> {
        self.groups.get(key).map(Group::state)
    }

    /// Summaries ordered by `last_seen` descending, ties broken by key.
    #[must_use]
    pub fn groups(&self) -> Vec<GroupSummary> {
        let mut summaries: Vec<GroupSummary> = self
            .groups
            .iter()
            .map(|(key, group)| GroupSummary {
                key: key.clone(),
                count: group.members.len(),
                state: group.state(),
                first_seen: group.first_seen,
                last_seen: group.last_seen,
            })
            .collect();
        summaries.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then_with(|| a.key.cmp(&b.key)));
        summaries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Drops every group, returning how many were removed.
    pub fn clear(&mut self) -> usize {
        let removed = self.groups.len();
        self.groups.clear();
        self.recency.clear();
        removed
    }
}

fn mark_halves(group: &mut Group, record: &Record) {
    match record.status() {
        Some(0) => group.has_request = true,
        Some(_) => group.has_response = true,
        None => {}
    }
}
