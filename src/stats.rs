//! Statistics tracking for the packet feed.
//!
//! This module provides counters for every stage a datagram passes through
//! (received, filtered, malformed, built into a segment) plus a latency
//! distribution and a per-channel breakdown.

use chrono::{DateTime, Utc};
use hdrhistogram::Histogram;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Upper bound of the latency histogram: one hour, in milliseconds.
const MAX_LATENCY_MS: u64 = 3_600_000;

/// Thread-safe statistics collector for the feed.
#[derive(Debug)]
pub struct FeedStats {
    /// Datagrams pulled from the packet source
    pub datagrams_received: AtomicU64,

    /// Total bytes of raw datagrams
    pub bytes_received: AtomicU64,

    /// Well-formed packets dropped by the channel filter
    pub packets_filtered: AtomicU64,

    /// Datagrams that failed to parse
    pub parse_failures: AtomicU64,

    /// Packets whose start time jumped too far from the feed's clock
    pub timestamp_rejections: AtomicU64,

    /// Segments handed to the accumulator
    pub segments_built: AtomicU64,

    /// Segments that could not be matched to a calibration response
    pub attach_failures: AtomicU64,

    /// Delay between a packet's first sample and its arrival, in ms
    latency_histogram: RwLock<Histogram<u64>>,

    /// Segments per channel
    segments_by_channel: RwLock<HashMap<String, u64>>,

    /// When stats collection started
    start_time: Instant,
}

impl FeedStats {
    /// Create a new statistics collector.
    pub fn new() -> Self {
        Self {
            datagrams_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            packets_filtered: AtomicU64::new(0),
            parse_failures: AtomicU64::new(0),
            timestamp_rejections: AtomicU64::new(0),
            segments_built: AtomicU64::new(0),
            attach_failures: AtomicU64::new(0),
            latency_histogram: RwLock::new(
                Histogram::new_with_bounds(1, MAX_LATENCY_MS, 3)
                    .expect("Failed to create latency histogram"),
            ),
            segments_by_channel: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    /// Record a raw datagram.
    pub fn record_datagram(&self, bytes: usize) {
        self.datagrams_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record a datagram that failed to parse.
    pub fn record_parse_failure(&self) {
        self.parse_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a packet rejected for an implausible start time.
    pub fn record_timestamp_rejection(&self) {
        self.timestamp_rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a packet dropped by the channel filter.
    pub fn record_filtered(&self) {
        self.packets_filtered.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed calibration attach.
    pub fn record_attach_failure(&self) {
        self.attach_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record how long after `packet_start` the packet arrived.
    pub fn record_latency(&self, packet_start: DateTime<Utc>) {
        let latency_ms = (Utc::now() - packet_start).num_milliseconds().max(1) as u64;
        if let Ok(mut hist) = self.latency_histogram.write() {
            let _ = hist.record(latency_ms.min(MAX_LATENCY_MS));
        }
    }

    /// Record a built segment.
    pub fn record_segment(&self, channel: &str) {
        self.segments_built.fetch_add(1, Ordering::Relaxed);

        if let Ok(mut map) = self.segments_by_channel.write() {
            *map.entry(channel.to_string()).or_insert(0) += 1;
        }
    }

    /// Get the elapsed time since stats collection started.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Get the current segments per second rate.
    pub fn segments_per_second(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.segments_built.load(Ordering::Relaxed) as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Generate a summary report.
    pub fn summary(&self) -> StatsSummary {
        let latency_ms = self
            .latency_histogram
            .read()
            .ok()
            .filter(|h| !h.is_empty())
            .map(|h| HistogramPercentiles {
                p50: h.value_at_quantile(0.50),
                p90: h.value_at_quantile(0.90),
                p99: h.value_at_quantile(0.99),
                min: h.min(),
                max: h.max(),
                mean: h.mean(),
            });

        let segments_by_channel = self
            .segments_by_channel
            .read()
            .map(|m| m.clone())
            .unwrap_or_default();

        StatsSummary {
            elapsed_secs: self.elapsed().as_secs_f64(),
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_filtered: self.packets_filtered.load(Ordering::Relaxed),
            parse_failures: self.parse_failures.load(Ordering::Relaxed),
            timestamp_rejections: self.timestamp_rejections.load(Ordering::Relaxed),
            segments_built: self.segments_built.load(Ordering::Relaxed),
            attach_failures: self.attach_failures.load(Ordering::Relaxed),
            segments_per_second: self.segments_per_second(),
            latency_ms,
            segments_by_channel,
        }
    }
}

impl Default for FeedStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Percentile values from a histogram.
#[derive(Debug, Clone, Serialize)]
pub struct HistogramPercentiles {
    pub p50: u64,
    pub p90: u64,
    pub p99: u64,
    pub min: u64,
    pub max: u64,
    pub mean: f64,
}

/// Summary of collected statistics.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSummary {
    pub elapsed_secs: f64,
    pub datagrams_received: u64,
    pub bytes_received: u64,
    pub packets_filtered: u64,
    pub parse_failures: u64,
    pub timestamp_rejections: u64,
    pub segments_built: u64,
    pub attach_failures: u64,
    pub segments_per_second: f64,
    pub latency_ms: Option<HistogramPercentiles>,
    pub segments_by_channel: HashMap<String, u64>,
}

impl std::fmt::Display for StatsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "═══════════════════════════════════════════════════════")?;
        writeln!(f, "                  FEED STATISTICS")?;
        writeln!(f, "═══════════════════════════════════════════════════════")?;
        writeln!(f)?;
        writeln!(f, "Runtime: {:.1}s", self.elapsed_secs)?;
        writeln!(f, "Datagrams received: {}", self.datagrams_received)?;
        writeln!(f, "Segments built: {}", self.segments_built)?;
        writeln!(f, "Filtered by channel: {}", self.packets_filtered)?;
        writeln!(f, "Parse failures: {}", self.parse_failures)?;
        writeln!(f, "Timestamp rejections: {}", self.timestamp_rejections)?;
        writeln!(f, "Calibration attach failures: {}", self.attach_failures)?;
        writeln!(f, "Bytes received: {} KB", self.bytes_received / 1024)?;
        writeln!(f, "Rate: {:.1} segments/sec", self.segments_per_second)?;
        writeln!(f)?;

        if let Some(ref p) = self.latency_ms {
            writeln!(f, "Packet Latency (ms):")?;
            writeln!(f, "  Min: {}, Max: {}, Mean: {:.1}", p.min, p.max, p.mean)?;
            writeln!(f, "  P50: {}, P90: {}, P99: {}", p.p50, p.p90, p.p99)?;
            writeln!(f)?;
        }

        if !self.segments_by_channel.is_empty() {
            writeln!(f, "Segments by Channel:")?;
            let mut channels: Vec<_> = self.segments_by_channel.iter().collect();
            channels.sort_by(|a, b| a.0.cmp(b.0));
            for (channel, count) in channels {
                writeln!(f, "  {}: {}", channel, count)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn test_record_segment() {
        let stats = FeedStats::new();

        stats.record_segment("EHZ");
        stats.record_segment("EHZ");
        stats.record_segment("ENE");

        assert_eq!(stats.segments_built.load(Ordering::Relaxed), 3);
        let summary = stats.summary();
        assert_eq!(summary.segments_by_channel.get("EHZ"), Some(&2));
        assert_eq!(summary.segments_by_channel.get("ENE"), Some(&1));
    }

    #[test]
    fn test_segments_per_second() {
        let stats = FeedStats::new();

        for _ in 0..100 {
            stats.record_segment("EHZ");
        }

        assert!(stats.segments_per_second() > 0.0);
    }

    #[test]
    fn test_latency_is_recorded() {
        let stats = FeedStats::new();
        assert!(stats.summary().latency_ms.is_none());

        stats.record_latency(Utc::now() - TimeDelta::milliseconds(500));
        // Packets stamped in the future still count.
        stats.record_latency(Utc::now() + TimeDelta::seconds(5));

        let latency = stats.summary().latency_ms.unwrap();
        assert_eq!(latency.min, 1);
        assert!(latency.max >= 500);
    }

    #[test]
    fn test_summary_counts_feed_events() {
        let stats = FeedStats::new();

        stats.record_datagram(1000);
        stats.record_datagram(24);
        stats.record_parse_failure();
        stats.record_filtered();
        stats.record_attach_failure();
        stats.record_segment("EHZ");

        let summary = stats.summary();

        assert_eq!(summary.datagrams_received, 2);
        assert_eq!(summary.bytes_received, 1024);
        assert_eq!(summary.parse_failures, 1);
        assert_eq!(summary.packets_filtered, 1);
        assert_eq!(summary.attach_failures, 1);
        assert_eq!(summary.segments_built, 1);

        let report = summary.to_string();
        assert!(report.contains("Bytes received: 1 KB"));
        assert!(report.contains("  EHZ: 1"));
    }
}
