//! Per-key latency statistics for consumed broadcast messages.
//!
//! # Purpose
//! Tracks count plus min/max/sum of transmission and processing times for
//! every event key, logs fresh maxima that cross the configured threshold,
//! and flushes per-key and overall summaries once per reporting window.
//!
//! # Design notes
//! The registry is owned by the single consumer task, so it needs no
//! interior locking. Flushing destroys every slot and restarts the window;
//! a zero-length window flushes after every recorded event.
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::info;

use lynx_wire::BroadcastMessage;

/// Aggregation key: one per entity group or relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StatsKey {
    Group(u64),
    Relation(u64),
}

impl fmt::Display for StatsKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatsKey::Group(id) => write!(f, "g{id}"),
            StatsKey::Relation(id) => write!(f, "r{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Metric {
    min: u64,
    max: u64,
    sum: u64,
}

impl Metric {
    fn new() -> Self {
        Self {
            min: u64::MAX,
            max: 0,
            sum: 0,
        }
    }

    /// Fold in one sample; reports whether it set a new maximum. The first
    /// sample of a window always counts as one.
    fn record(&mut self, value: u64) -> bool {
        let first = self.min == u64::MAX;
        self.sum += value;
        if value < self.min {
            self.min = value;
        }
        if first || value > self.max {
            self.max = value;
            return true;
        }
        false
    }

    fn avg(&self, count: u64) -> u64 {
        if count > 0 { self.sum / count } else { 0 }
    }
}

#[derive(Debug)]
struct Slot {
    count: u64,
    tx: Metric,
    px: Metric,
}

impl Slot {
    fn new() -> Self {
        Self {
            count: 0,
            tx: Metric::new(),
            px: Metric::new(),
        }
    }
}

/// Flushed per-key summary for one reporting window.
#[derive(Debug, Clone)]
pub struct KeySummary {
    pub key: StatsKey,
    pub count: u64,
    pub tx_max: u64,
    pub tx_min: u64,
    pub tx_avg: u64,
    pub px_max: u64,
    pub px_min: u64,
    pub px_avg: u64,
}

/// Flushed whole-window summary across all keys.
#[derive(Debug, Clone)]
pub struct OverallSummary {
    pub count: u64,
    pub tx_max: u64,
    pub tx_min: u64,
    pub tx_avg: u64,
    pub px_max: u64,
    pub px_min: u64,
    pub px_avg: u64,
    /// Cumulative time spent inside the aggregator itself this window.
    pub collection_ms: u64,
}

#[derive(Debug, Clone)]
pub struct StatsReport {
    pub keys: Vec<KeySummary>,
    pub overall: OverallSummary,
}

pub struct StatsRegistry {
    slots: HashMap<StatsKey, Slot>,
    collection: Duration,
    window_start: Instant,
    period: Duration,
    log_threshold_ms: u64,
}

impl StatsRegistry {
    pub fn new(period_minutes: u64, log_threshold_ms: u64) -> Self {
        Self {
            slots: HashMap::new(),
            collection: Duration::ZERO,
            window_start: Instant::now(),
            period: Duration::from_secs(period_minutes * 60),
            log_threshold_ms,
        }
    }

    /// Record one consumed message's transmission and processing times.
    /// Returns the flushed report when this record closed the window.
    pub fn record(
        &mut self,
        key: StatsKey,
        tx_ms: u64,
        px_ms: u64,
        message: &BroadcastMessage,
    ) -> Option<StatsReport> {
        let started = Instant::now();
        let slot = self.slots.entry(key).or_insert_with(Slot::new);
        slot.count += 1;
        if slot.tx.record(tx_ms) && tx_ms > self.log_threshold_ms {
            // Only fresh maxima above the threshold are worth a line; the
            // new-max condition keeps this from flooding the log.
            info!(key = %key, tx_ms, event = ?message, "new transmission max");
        }
        if slot.px.record(px_ms) && px_ms > self.log_threshold_ms {
            info!(key = %key, px_ms, event = ?message, "new processing max");
        }
        self.collection += started.elapsed();

        if self.window_start.elapsed() >= self.period {
            return Some(self.flush());
        }
        None
    }

    /// Summarize and destroy every slot, restarting the reporting window.
    pub fn flush(&mut self) -> StatsReport {
        let mut keys: Vec<KeySummary> = self
            .slots
            .iter()
            .map(|(key, slot)| KeySummary {
                key: *key,
                count: slot.count,
                tx_max: slot.tx.max,
                tx_min: slot.tx.min,
                tx_avg: slot.tx.avg(slot.count),
                px_max: slot.px.max,
                px_min: slot.px.min,
                px_avg: slot.px.avg(slot.count),
            })
            .collect();
        keys.sort_by_key(|summary| summary.key);

        let count: u64 = self.slots.values().map(|slot| slot.count).sum();
        let tx_sum: u64 = self.slots.values().map(|slot| slot.tx.sum).sum();
        let px_sum: u64 = self.slots.values().map(|slot| slot.px.sum).sum();
        let overall = OverallSummary {
            count,
            tx_max: self.slots.values().map(|slot| slot.tx.max).max().unwrap_or(0),
            tx_min: self.slots.values().map(|slot| slot.tx.min).min().unwrap_or(0),
            tx_avg: if count > 0 { tx_sum / count } else { 0 },
            px_max: self.slots.values().map(|slot| slot.px.max).max().unwrap_or(0),
            px_min: self.slots.values().map(|slot| slot.px.min).min().unwrap_or(0),
            px_avg: if count > 0 { px_sum / count } else { 0 },
            collection_ms: self.collection.as_millis() as u64,
        };

        self.slots.clear();
        self.collection = Duration::ZERO;
        self.window_start = Instant::now();
        StatsReport { keys, overall }
    }

    /// Number of live slots in the current window.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Time spent in the aggregator during the current window.
    pub fn collection_time(&self) -> Duration {
        self.collection
    }
}

/// Emit a flushed report to the log, one line per key plus the overall line.
pub fn log_report(report: &StatsReport) {
    for key in &report.keys {
        info!(
            key = %key.key,
            count = key.count,
            tx_max = key.tx_max,
            tx_min = key.tx_min,
            tx_avg = key.tx_avg,
            px_max = key.px_max,
            px_min = key.px_min,
            px_avg = key.px_avg,
            "cache bus stats summary"
        );
    }
    let overall = &report.overall;
    info!(
        count = overall.count,
        tx_max = overall.tx_max,
        tx_min = overall.tx_min,
        tx_avg = overall.tx_avg,
        px_max = overall.px_max,
        px_min = overall.px_min,
        px_avg = overall.px_avg,
        collection_ms = overall.collection_ms,
        "cache bus stats summary overall"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use lynx_wire::CacheEvent;

    fn message() -> BroadcastMessage {
        BroadcastMessage::Cache(CacheEvent::GroupReset { group_id: 7 })
    }

    #[test]
    fn key_display_matches_wire_convention() {
        assert_eq!(StatsKey::Group(7).to_string(), "g7");
        assert_eq!(StatsKey::Relation(3).to_string(), "r3");
    }

    #[test]
    fn zero_period_flushes_every_record() {
        let mut stats = StatsRegistry::new(0, 10);
        let report = stats
            .record(StatsKey::Group(7), 2, 5, &message())
            .expect("report");
        assert_eq!(report.keys.len(), 1);
        assert_eq!(report.keys[0].count, 1);
        assert_eq!(stats.slot_count(), 0);
        assert_eq!(stats.collection_time(), Duration::ZERO);
    }

    #[test]
    fn summaries_aggregate_min_max_avg() {
        let mut stats = StatsRegistry::new(60, 10);
        for px in [1, 5, 9] {
            assert!(stats.record(StatsKey::Group(7), 0, px, &message()).is_none());
        }
        let report = stats.flush();
        let key = &report.keys[0];
        assert_eq!(key.count, 3);
        assert_eq!(key.px_max, 9);
        assert_eq!(key.px_min, 1);
        assert_eq!(key.px_avg, 5);
        assert!(key.px_min <= key.px_avg && key.px_avg <= key.px_max);
        assert!(key.tx_min <= key.tx_avg && key.tx_avg <= key.tx_max);
    }

    #[test]
    fn overall_spans_every_key() {
        let mut stats = StatsRegistry::new(60, 10);
        stats.record(StatsKey::Group(7), 1, 2, &message());
        stats.record(StatsKey::Relation(3), 7, 4, &message());
        let report = stats.flush();
        assert_eq!(report.keys.len(), 2);
        let overall = &report.overall;
        assert_eq!(overall.count, 2);
        assert_eq!(overall.tx_max, 7);
        assert_eq!(overall.tx_min, 1);
        assert_eq!(overall.px_max, 4);
        assert_eq!(overall.px_min, 2);
    }

    #[test]
    fn flush_resets_all_accumulators() {
        let mut stats = StatsRegistry::new(60, 10);
        stats.record(StatsKey::Group(7), 1, 2, &message());
        assert_eq!(stats.slot_count(), 1);
        let _ = stats.flush();
        assert_eq!(stats.slot_count(), 0);
        assert_eq!(stats.collection_time(), Duration::ZERO);

        // A fresh window aggregates from scratch.
        stats.record(StatsKey::Group(7), 3, 3, &message());
        let report = stats.flush();
        assert_eq!(report.keys[0].count, 1);
        assert_eq!(report.keys[0].tx_max, 3);
        assert_eq!(report.keys[0].tx_min, 3);
    }
}
