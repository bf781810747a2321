// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Minute-granularity rollups of request records.
//!
//! Every record lands in the bucket of the minute containing its timestamp.
//! Request records additionally fold their status, path and latency in. A
//! status of exactly `0` marks the request half of a pair; any other status
//! marks a response.
//!
//! Latency is tracked with a Welford accumulator, so buckets never keep raw
//! samples. Queries merge buckets with the parallel variance formula, which
//! yields the same mean and variance as a pass over every underlying sample.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use serde_json::Value;

use crate::constants::{MAX_QUERY_WINDOWS, MINUTE_MS};
use crate::errors::QueryError;
use crate::record::{Record, RequestItem};

/// Streaming count/mean/M2 accumulator with min, max and sum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyStats {
    pub count: u64,
    pub mean: f64,
    pub m2: f64,
    pub min: f64,
    pub max: f64,
    pub sum: f64,
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self {
            count: 0,
            mean: 0.0,
            m2: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            sum: 0.0,
        }
    }
}

impl LatencyStats {
    #[allow(clippy::cast_precision_loss)]
    pub fn add(&mut self, sample: f64) {
        self.count += 1;
        let delta = sample - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (sample - self.mean);
        self.min = self.min.min(sample);
        self.max = self.max.max(sample);
        self.sum += sample;
    }

    /// Parallel (Chan et al.) combination of two accumulators.
    #[allow(clippy::cast_precision_loss)]
    pub fn merge(&mut self, other: &LatencyStats) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        let n_a = self.count as f64;
        let n_b = other.count as f64;
        let n = n_a + n_b;
        let delta = other.mean - self.mean;
        self.mean += delta * n_b / n;
        self.m2 += other.m2 + delta * delta * n_a * n_b / n;
        self.count += other.count;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.sum += other.sum;
    }

    /// Sample variance; undefined below two samples.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn variance(&self) -> Option<f64> {
        (self.count > 1).then(|| self.m2 / (self.count - 1) as f64)
    }

    #[must_use]
    pub fn std_dev(&self) -> Option<f64> {
        self.variance().map(f64::sqrt)
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn summary(&self) -> LatencySummary {
        let populated = self.count > 0;
        LatencySummary {
            count: self.count,
            sum: self.sum,
            avg: populated.then(|| self.sum / self.count as f64),
            mean: populated.then_some(self.mean),
            min: populated.then_some(self.min),
            max: populated.then_some(self.max),
            std_dev: self.std_dev(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MinuteBucket {
    /// Every record timestamped in this minute, whatever its kind.
    pub records: u64,
    pub req_count: u64,
    pub resp_count: u64,
    pub status_counts: BTreeMap<i64, u64>,
    pub path_counts: HashMap<String, u64>,
    pub latency: LatencyStats,
}

impl MinuteBucket {
    fn fold_request(&mut self, item: &RequestItem) {
        match item.status {
            Some(0) => self.req_count += 1,
            Some(status) => {
                self.resp_count += 1;
                *self.status_counts.entry(status).or_insert(0) += 1;
            }
            None => {}
        }
        if let Some(path) = request_path(item) {
            *self.path_counts.entry(path.to_string()).or_insert(0) += 1;
        }
        if let Some(duration) = item.duration_ms.filter(|d| d.is_finite()) {
            self.latency.add(duration);
        }
    }

    fn merge(&mut self, other: &MinuteBucket) {
        self.records += other.records;
        self.req_count += other.req_count;
        self.resp_count += other.resp_count;
        for (status, count) in &other.status_counts {
            *self.status_counts.entry(*status).or_insert(0) += count;
        }
        for (path, count) in &other.path_counts {
            *self.path_counts.entry(path.clone()).or_insert(0) += count;
        }
        self.latency.merge(&other.latency);
    }
}

/// `attrs.metadata.path` wins over the record's own path.
fn request_path(item: &RequestItem) -> Option<&str> {
    item.attrs
        .as_ref()
        .and_then(|attrs| attrs.get("metadata"))
        .and_then(|metadata| metadata.get("path"))
        .and_then(Value::as_str)
        .or(item.path.as_deref())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencySummary {
    pub count: u64,
    pub sum: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg: Option<f64>,
    /// Welford running mean.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub std_dev: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathCount {
    pub path: String,
    pub count: u64,
}

/// One step window of a bucket query.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedPoint {
    /// Window start, epoch milliseconds.
    pub t: i64,
    pub records: u64,
    pub req_count: u64,
    pub resp_count: u64,
    pub status_counts: BTreeMap<i64, u64>,
    pub top_paths: Vec<PathCount>,
    pub latency: LatencySummary,
}

/// Bucket query parameters, all times in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketQuery {
    pub from: i64,
    pub to: i64,
    pub step_minutes: i64,
    pub top_n_paths: usize,
}

#[must_use]
pub const fn minute_key(timestamp_ms: i64) -> i64 {
    timestamp_ms.saturating_sub(timestamp_ms.rem_euclid(MINUTE_MS))
}

#[derive(Debug, Default)]
pub struct BucketAggregator {
    buckets: BTreeMap<i64, MinuteBucket>,
}

impl BucketAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, record: &Record) {
        let bucket = self
            .buckets
            .entry(minute_key(record.timestamp()))
            .or_default();
        bucket.records += 1;
        if let Record::Request(item) = record {
            bucket.fold_request(item);
        }
    }

    pub fn query(&self, query: &BucketQuery) -> Result<Vec<AggregatedPoint>, QueryError> {
        if query.step_minutes < 1 {
            return Err(QueryError::InvalidStep(query.step_minutes));
        }
        if query.from > query.to {
            return Err(QueryError::InvalidRange {
                from: query.from,
                to: query.to,
            });
        }
        let step_ms = query.step_minutes.saturating_mul(MINUTE_MS);
        let start = minute_key(query.from);
        let windows = query
            .to
            .checked_sub(start)
            .map_or(i64::MAX, |span| span / step_ms + 1);
        if windows > MAX_QUERY_WINDOWS {
            return Err(QueryError::TooManyWindows(windows));
        }

        let mut points = Vec::with_capacity(usize::try_from(windows).unwrap_or_default());
        let end = query.to.saturating_add(1);
        let mut window_start = start;
        while window_start <= query.to {
            let window_end = window_start.saturating_add(step_ms).min(end);
            let mut merged = MinuteBucket::default();
            for bucket in self.buckets.range(window_start..window_end).map(|(_, b)| b) {
                merged.merge(bucket);
            }
            points.push(Self::point(window_start, merged, query.top_n_paths));
            let Some(next) = window_start.checked_add(step_ms) else {
                break;
            };
            window_start = next;
        }
        Ok(points)
    }

    fn point(t: i64, bucket: MinuteBucket, top_n: usize) -> AggregatedPoint {
        let mut paths: Vec<PathCount> = bucket
            .path_counts
            .into_iter()
            .map(|(path, count)| PathCount { path, count })
            .collect();
        paths.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.path.cmp(&b.path)));
        paths.truncate(top_n);

        AggregatedPoint {
            t,
            records: bucket.records,
            req_count: bucket.req_count,
            resp_count: bucket.resp_count,
            status_counts: bucket.status_counts,
            top_paths: paths,
            latency: bucket.latency.summary(),
        }
    }

    /// Drops buckets whose whole minute lies before `cutoff_ms`.
    pub fn prune(&mut self, cutoff_ms: i64) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain(|key, _| key.saturating_add(MINUTE_MS) > cutoff_ms);
        before - self.buckets.len()
    }

    #[must_use]
    pub fn bucket(&self, timestamp_ms: i64) -> Option<&MinuteBucket> {
        self.buckets.get(&minute_key(timestamp_ms))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::LogItem;
    use proptest::prelude::*;
    use serde_json::json;

    const BASE: i64 = 1_700_000_040_000;

    fn request(t: i64, status: Option<i64>, path: &str, duration: Option<f64>) -> Record {
        Record::Request(RequestItem {
            t,
            method: Some("GET".to_string()),
            path: Some(path.to_string()),
            status,
            duration_ms: duration,
            ..Default::default()
        })
    }

    fn query(from: i64, to: i64, step_minutes: i64, top_n_paths: usize) -> BucketQuery {
        BucketQuery {
            from,
            to,
            step_minutes,
            top_n_paths,
        }
    }

    #[test]
    fn test_minute_key_floors() {
        assert_eq!(minute_key(BASE + 59_999), BASE);
        assert_eq!(minute_key(BASE + 60_000), BASE + 60_000);
        assert_eq!(minute_key(-1), -60_000);
    }

    #[test]
    fn test_update_splits_requests_and_responses() {
        let mut aggregator = BucketAggregator::new();
        aggregator.update(&request(BASE, Some(200), "/api/x", Some(120.0)));
        aggregator.update(&request(BASE + 10, Some(0), "/api/x", None));
        aggregator.update(&request(BASE + 20, Some(500), "/api/y", Some(80.0)));
        aggregator.update(&Record::Log(LogItem {
            t: BASE + 30,
            message: "hello".to_string(),
            ..Default::default()
        }));

        let bucket = aggregator.bucket(BASE).unwrap();
        assert_eq!(bucket.records, 4);
        assert_eq!(bucket.req_count, 1);
        assert_eq!(bucket.resp_count, 2);
        assert_eq!(bucket.status_counts, BTreeMap::from([(200, 1), (500, 1)]));
        assert_eq!(bucket.path_counts["/api/x"], 2);
        assert_eq!(bucket.latency.count, 2);
        assert!((bucket.latency.mean - 100.0).abs() < 1e-12);
    }

    #[test]
    fn test_metadata_path_overrides_record_path() {
        let mut aggregator = BucketAggregator::new();
        let mut attrs = serde_json::Map::new();
        attrs.insert("metadata".to_string(), json!({"path": "/nested"}));
        aggregator.update(&Record::Request(RequestItem {
            t: BASE,
            path: Some("/outer".to_string()),
            status: Some(200),
            attrs: Some(attrs),
            ..Default::default()
        }));
        let bucket = aggregator.bucket(BASE).unwrap();
        assert_eq!(bucket.path_counts.get("/nested"), Some(&1));
        assert!(!bucket.path_counts.contains_key("/outer"));
    }

    #[test]
    fn test_query_steps_and_top_paths() {
        let mut aggregator = BucketAggregator::new();
        for (minute, path) in [(0, "/a"), (0, "/a"), (1, "/b"), (2, "/c"), (3, "/a")] {
            aggregator.update(&request(
                BASE + minute * MINUTE_MS,
                Some(200),
                path,
                Some(10.0),
            ));
        }

        let points = aggregator
            .query(&query(BASE, BASE + 3 * MINUTE_MS, 2, 1))
            .unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].t, BASE);
        assert_eq!(points[0].resp_count, 3);
        assert_eq!(
            points[0].top_paths,
            vec![PathCount {
                path: "/a".to_string(),
                count: 2
            }]
        );
        assert_eq!(points[1].t, BASE + 2 * MINUTE_MS);
        assert_eq!(points[1].resp_count, 2);
        assert_eq!(points[1].top_paths.len(), 1);
    }

    #[test]
    fn test_query_emits_empty_windows() {
        let aggregator = BucketAggregator::new();
        let points = aggregator
            .query(&query(BASE, BASE + 2 * MINUTE_MS, 1, 5))
            .unwrap();
        assert_eq!(points.len(), 3);
        assert!(points.iter().all(|p| p.latency.count == 0 && p.latency.avg.is_none()));
    }

    #[test]
    fn test_query_rejects_bad_parameters() {
        let aggregator = BucketAggregator::new();
        assert_eq!(
            aggregator.query(&query(BASE, BASE, 0, 5)),
            Err(QueryError::InvalidStep(0))
        );
        assert_eq!(
            aggregator.query(&query(BASE + 1, BASE, 1, 5)),
            Err(QueryError::InvalidRange {
                from: BASE + 1,
                to: BASE
            })
        );
        assert!(matches!(
            aggregator.query(&query(0, BASE, 1, 5)),
            Err(QueryError::TooManyWindows(_))
        ));
    }

    #[test]
    fn test_query_at_the_edges_of_i64() {
        let mut aggregator = BucketAggregator::new();
        aggregator.update(&request(BASE, Some(200), "/a", Some(5.0)));

        let points = aggregator
            .query(&query(i64::MAX, i64::MAX, 1, 5))
            .unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].t, minute_key(i64::MAX));
        assert_eq!(points[0].records, 0);

        assert_eq!(
            aggregator.query(&query(-MINUTE_MS, i64::MAX, 1, 5)),
            Err(QueryError::TooManyWindows(i64::MAX))
        );
        assert!(matches!(
            aggregator.query(&query(i64::MIN, i64::MIN, i64::MAX, 5)),
            Ok(points) if points.len() == 1
        ));
        // Still usable afterwards.
        assert_eq!(
            aggregator
                .query(&query(BASE, BASE, 1, 5))
                .unwrap()[0]
                .resp_count,
            1
        );
    }

    #[test]
    fn test_prune_drops_only_whole_minutes_before_cutoff() {
        let mut aggregator = BucketAggregator::new();
        aggregator.update(&request(BASE, Some(200), "/a", None));
        aggregator.update(&request(BASE + MINUTE_MS, Some(200), "/a", None));
        aggregator.update(&request(BASE + 2 * MINUTE_MS, Some(200), "/a", None));

        assert_eq!(aggregator.prune(BASE + MINUTE_MS + 1), 1);
        assert_eq!(aggregator.len(), 2);
        assert!(aggregator.bucket(BASE).is_none());
        assert!(aggregator.bucket(BASE + MINUTE_MS).is_some());
    }

    #[test]
    fn test_latency_summary_single_sample_has_no_std_dev() {
        let mut stats = LatencyStats::default();
        stats.add(42.0);
        let summary = stats.summary();
        assert_eq!(summary.avg, Some(42.0));
        assert_eq!(summary.min, Some(42.0));
        assert_eq!(summary.std_dev, None);
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-9 * b.abs().max(1.0)
    }

    proptest! {
        #[test]
        fn test_bucket_merge_matches_direct_statistics(
            samples in prop::collection::vec((0i64..10, 0.0f64..5_000.0), 2..200)
        ) {
            let mut aggregator = BucketAggregator::new();
            for (minute, duration) in &samples {
                aggregator.update(&request(BASE + minute * MINUTE_MS, Some(200), "/p", Some(*duration)));
            }
            let points = aggregator
                .query(&query(BASE, BASE + 9 * MINUTE_MS, 10, 5))
                .unwrap();
            prop_assert_eq!(points.len(), 1);
            let latency = &points[0].latency;

            let n = samples.len() as f64;
            let mean = samples.iter().map(|(_, d)| d).sum::<f64>() / n;
            let variance = samples.iter().map(|(_, d)| (d - mean).powi(2)).sum::<f64>() / (n - 1.0);

            prop_assert_eq!(latency.count, samples.len() as u64);
            prop_assert!(close(latency.avg.unwrap(), mean));
            prop_assert!(close(latency.mean.unwrap(), mean));
            prop_assert!(close(latency.std_dev.unwrap(), variance.sqrt()));
        }
    }
}
