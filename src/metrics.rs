//! Pipeline metrics
//!
//! Components report through an injected [`MetricsSink`] rather than global
//! counters. [`InMemoryMetrics`] keeps per-(kind, labels) counts plus
//! latency aggregates and can render a summary; [`NoopMetrics`] discards
//! everything.

use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Things the pipeline reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    /// One pass of a worker loop
    WorkerCycle,
    /// A message was received
    Job,
    /// A worker entered / left processing
    WorkerBusy,
    WorkerIdle,
    /// Sentinel pause taken
    SentinelPause,
    GeneratorPublish,
    GeneratorPublishFailed,
    StoreInsert,
    StoreInsertFailed,
    CacheDelete,
    CacheDeleteFailed,
    /// Message consumed but not persisted, and not coming back
    MessageDropped,
    /// Message returned to the queue after a failure
    MessageRequeued,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkerCycle => "worker_total_run",
            Self::Job => "jobs_total",
            Self::WorkerBusy => "worker_busy",
            Self::WorkerIdle => "worker_idle",
            Self::SentinelPause => "sentinel_pause",
            Self::GeneratorPublish => "generator_total_run",
            Self::GeneratorPublishFailed => "generator_publish_failed",
            Self::StoreInsert => "database_insert_queries",
            Self::StoreInsertFailed => "database_insert_failed",
            Self::CacheDelete => "cache_delete",
            Self::CacheDeleteFailed => "cache_delete_failed",
            Self::MessageDropped => "message_dropped",
            Self::MessageRequeued => "message_requeued",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timed operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LatencyKind {
    /// One bounded receive from the queue, empty or not
    QueueRead,
    /// One event insert, successful or not
    StoreInsert,
    /// One cache entry deletion
    CacheDelete,
}

impl LatencyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QueueRead => "mq_read_latency",
            Self::StoreInsert => "database_insert_latency",
            Self::CacheDelete => "cache_delete_latency",
        }
    }
}

impl fmt::Display for LatencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observations of one [`LatencyKind`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencyStats {
    pub count: u64,
    pub total: Duration,
    pub max: Duration,
}

impl LatencyStats {
    fn observe(&mut self, elapsed: Duration) {
        self.count += 1;
        self.total = self.total.saturating_add(elapsed);
        self.max = self.max.max(elapsed);
    }

    pub fn mean(&self) -> Duration {
        match u32::try_from(self.count) {
            Ok(0) => Duration::ZERO,
            Ok(n) => self.total / n,
            Err(_) => Duration::from_secs_f64(self.total.as_secs_f64() / self.count as f64),
        }
    }
}

pub trait MetricsSink: Send + Sync {
    fn record_event(&self, kind: EventKind, labels: &[(&str, &str)]);

    fn record_latency(&self, _kind: LatencyKind, _elapsed: Duration) {}
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_event(&self, _kind: EventKind, _labels: &[(&str, &str)]) {}
}

type SeriesKey = (EventKind, Vec<(String, String)>);

/// Counting sink, keyed by kind and sorted label set
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    series: DashMap<SeriesKey, u64>,
    latencies: DashMap<LatencyKind, LatencyStats>,
    busy: AtomicI64,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count for an exact (kind, labels) series
    pub fn count(&self, kind: EventKind, labels: &[(&str, &str)]) -> u64 {
        self.series
            .get(&series_key(kind, labels))
            .map(|v| *v)
            .unwrap_or(0)
    }

    /// Count for a kind summed over every label set
    pub fn total(&self, kind: EventKind) -> u64 {
        self.series
            .iter()
            .filter(|entry| entry.key().0 == kind)
            .map(|entry| *entry.value())
            .sum()
    }

    /// Latency aggregate for a kind, `None` if never observed
    pub fn latency(&self, kind: LatencyKind) -> Option<LatencyStats> {
        self.latencies.get(&kind).map(|stats| *stats)
    }

    /// Latency aggregates sorted by kind
    pub fn latency_summary(&self) -> Vec<(LatencyKind, LatencyStats)> {
        let mut all: Vec<_> = self.latencies.iter().map(|e| (*e.key(), *e.value())).collect();
        all.sort_by_key(|(kind, _)| *kind);
        all
    }

    /// Workers currently between receive and the end of processing
    pub fn busy_workers(&self) -> i64 {
        self.busy.load(Ordering::Relaxed)
    }

    /// Totals per kind, sorted by kind
    pub fn summary(&self) -> Vec<(EventKind, u64)> {
        let mut totals: Vec<(EventKind, u64)> = Vec::new();
        for entry in self.series.iter() {
            let kind = entry.key().0;
            match totals.iter_mut().find(|(k, _)| *k == kind) {
                Some((_, total)) => *total += *entry.value(),
                None => totals.push((kind, *entry.value())),
            }
        }
        totals.sort_by_key(|(kind, _)| *kind);
        totals
    }
}

impl MetricsSink for InMemoryMetrics {
    fn record_event(&self, kind: EventKind, labels: &[(&str, &str)]) {
        match kind {
            EventKind::WorkerBusy => {
                self.busy.fetch_add(1, Ordering::Relaxed);
            }
            EventKind::WorkerIdle => {
                self.busy.fetch_sub(1, Ordering::Relaxed);
            }
            _ => {}
        }
        *self.series.entry(series_key(kind, labels)).or_insert(0) += 1;
    }

    fn record_latency(&self, kind: LatencyKind, elapsed: Duration) {
        self.latencies.entry(kind).or_default().observe(elapsed);
    }
}

fn series_key(kind: EventKind, labels: &[(&str, &str)]) -> SeriesKey {
    let mut labels: Vec<(String, String)> = labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    labels.sort();
    (kind, labels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_by_labels() {
        let metrics = InMemoryMetrics::new();
        metrics.record_event(EventKind::WorkerCycle, &[("worker_id", "0")]);
        metrics.record_event(EventKind::WorkerCycle, &[("worker_id", "0")]);
        metrics.record_event(EventKind::WorkerCycle, &[("worker_id", "1")]);
        metrics.record_event(EventKind::Job, &[]);

        assert_eq!(metrics.count(EventKind::WorkerCycle, &[("worker_id", "0")]), 2);
        assert_eq!(metrics.total(EventKind::WorkerCycle), 3);
        assert_eq!(metrics.total(EventKind::Job), 1);
        assert_eq!(metrics.total(EventKind::StoreInsert), 0);
    }

    #[test]
    fn test_label_order_does_not_matter() {
        let metrics = InMemoryMetrics::new();
        metrics.record_event(EventKind::StoreInsert, &[("a", "1"), ("b", "2")]);
        assert_eq!(metrics.count(EventKind::StoreInsert, &[("b", "2"), ("a", "1")]), 1);
    }

    #[test]
    fn test_busy_gauge() {
        let metrics = InMemoryMetrics::new();
        metrics.record_event(EventKind::WorkerBusy, &[]);
        metrics.record_event(EventKind::WorkerBusy, &[]);
        metrics.record_event(EventKind::WorkerIdle, &[]);
        assert_eq!(metrics.busy_workers(), 1);
    }

    #[test]
    fn test_summary_sorted() {
        let metrics = InMemoryMetrics::new();
        metrics.record_event(EventKind::StoreInsert, &[]);
        metrics.record_event(EventKind::Job, &[("x", "1")]);
        metrics.record_event(EventKind::Job, &[("x", "2")]);
        assert_eq!(
            metrics.summary(),
            vec![(EventKind::Job, 2), (EventKind::StoreInsert, 1)]
        );
    }

    #[test]
    fn test_latency_aggregates() {
        let metrics = InMemoryMetrics::new();
        assert_eq!(metrics.latency(LatencyKind::StoreInsert), None);

        metrics.record_latency(LatencyKind::StoreInsert, Duration::from_millis(10));
        metrics.record_latency(LatencyKind::StoreInsert, Duration::from_millis(30));
        metrics.record_latency(LatencyKind::QueueRead, Duration::from_millis(1));

        let insert = metrics.latency(LatencyKind::StoreInsert).unwrap();
        assert_eq!(insert.count, 2);
        assert_eq!(insert.max, Duration::from_millis(30));
        assert_eq!(insert.mean(), Duration::from_millis(20));
        assert_eq!(metrics.latency_summary().len(), 2);
        assert_eq!(metrics.latency_summary()[0].0, LatencyKind::QueueRead);
    }

    #[test]
    fn test_noop_ignores_latency() {
        NoopMetrics.record_latency(LatencyKind::CacheDelete, Duration::from_secs(1));
    }
}
