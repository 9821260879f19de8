//! Feed statistics tracking
//!
//! Counts packets through the reorder windows, outcomes of the sequencers and
//! anomalies reported by the books, plus a sliding window of apply latencies.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::info;

use crate::feed::FeedEvent;
use crate::reorder::Dispatch;
use crate::sequencer::Outcome;

const WINDOW_SIZE: usize = 10000;

#[derive(Debug, Clone, Copy)]
pub struct LatencyStats {
    pub min_us: u64,
    pub max_us: u64,
    pub mean_us: f64,
    pub p50_us: u64,
    pub p99_us: u64,
}

impl LatencyStats {
    fn from_window(window: &VecDeque<u64>) -> Option<Self> {
        if window.is_empty() {
            return None;
        }

        let mut sorted: Vec<u64> = window.iter().copied().collect();
        sorted.sort_unstable();

        let min = sorted[0];
        let max = sorted[sorted.len() - 1];
        let mean = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
        let p50 = sorted[sorted.len() / 2];
        let p99 = sorted[(sorted.len() * 99) / 100];

        Some(LatencyStats {
            min_us: min,
            max_us: max,
            mean_us: mean,
            p50_us: p50,
            p99_us: p99,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct FeedStats {
    start_time: Option<Instant>,
    packets: u64,
    bytes: u64,

    // Reorder windows
    delivered: u64,
    buffered: u64,
    duplicates: u64,
    resets: u64,

    // Sequencers
    applied: u64,
    snapshots: u64,
    discarded: u64,
    overflows: u64,
    gaps: u64,
    recovery_requests: u64,

    // Books and codec
    anomalies: u64,
    decode_failures: u64,

    apply_latencies: VecDeque<u64>,
}

impl FeedStats {
    pub fn new() -> Self {
        FeedStats {
            apply_latencies: VecDeque::with_capacity(WINDOW_SIZE),
            ..FeedStats::default()
        }
    }

    /// Record a datagram received
    pub fn record_packet(&mut self, size: usize) {
        if self.start_time.is_none() {
            self.start_time = Some(Instant::now());
        }
        self.packets += 1;
        self.bytes += size as u64;
    }

    pub fn record_dispatch(&mut self, dispatch: Dispatch) {
        match dispatch {
            Dispatch::Delivered(count) => self.delivered += count as u64,
            Dispatch::Buffered => self.buffered += 1,
            Dispatch::Duplicate => self.duplicates += 1,
            // counted through FeedEvent::Reset
            Dispatch::Reset(_) => {}
        }
    }

    pub fn record_outcome(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Applied => self.applied += 1,
            Outcome::SnapshotApplied { replayed } => {
                self.snapshots += 1;
                self.applied += replayed as u64;
            }
            Outcome::Discarded => self.discarded += 1,
            Outcome::Overflow { .. } => self.overflows += 1,
            // a live incremental that could not be applied in sequence
            Outcome::RecoveryRequested { .. } => self.gaps += 1,
            // counted through FeedEvent::BookAnomaly
            Outcome::Rejected { .. } => {}
            Outcome::SnapshotSkipped | Outcome::Buffered | Outcome::Cleared => {}
        }
    }

    pub fn record_event(&mut self, event: &FeedEvent) {
        match event {
            FeedEvent::RecoveryRequested { .. } => self.recovery_requests += 1,
            FeedEvent::Reset { .. } => self.resets += 1,
            FeedEvent::BookAnomaly { .. } => self.anomalies += 1,
            FeedEvent::DecodeFailed { .. } => self.decode_failures += 1,
            FeedEvent::Synced { .. } | FeedEvent::Stale { .. } | FeedEvent::Overflow { .. } => {}
        }
    }

    /// Record the time spent sequencing and applying one update
    pub fn record_apply_latency(&mut self, elapsed: Duration) {
        if self.apply_latencies.len() >= WINDOW_SIZE {
            self.apply_latencies.pop_front();
        }
        self.apply_latencies.push_back(elapsed.as_micros() as u64);
    }

    pub fn packets_per_sec(&self) -> f64 {
        self.rate(self.packets)
    }

    pub fn bytes_per_sec(&self) -> f64 {
        self.rate(self.bytes)
    }

    fn rate(&self, total: u64) -> f64 {
        match self.start_time {
            None => 0.0,
            Some(start) => {
                let elapsed = start.elapsed().as_secs_f64();
                if elapsed > 0.0 {
                    total as f64 / elapsed
                } else {
                    0.0
                }
            }
        }
    }

    pub fn apply_latency_stats(&self) -> Option<LatencyStats> {
        LatencyStats::from_window(&self.apply_latencies)
    }

    pub fn elapsed(&self) -> Option<Duration> {
        self.start_time.map(|st| st.elapsed())
    }

    pub fn packets(&self) -> u64 {
        self.packets
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Payloads released in order by the reorder windows
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn buffered(&self) -> u64 {
        self.buffered
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    pub fn resets(&self) -> u64 {
        self.resets
    }

    /// Incrementals applied, live or replayed
    pub fn applied(&self) -> u64 {
        self.applied
    }

    pub fn snapshots(&self) -> u64 {
        self.snapshots
    }

    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    pub fn overflows(&self) -> u64 {
        self.overflows
    }

    pub fn gaps(&self) -> u64 {
        self.gaps
    }

    /// Includes re-requests after a recovery timeout
    pub fn recovery_requests(&self) -> u64 {
        self.recovery_requests
    }

    pub fn anomalies(&self) -> u64 {
        self.anomalies
    }

    pub fn decode_failures(&self) -> u64 {
        self.decode_failures
    }

    /// Reset all statistics
    pub fn reset(&mut self) {
        *self = FeedStats::new();
    }

    /// Log a statistics summary at info level
    pub fn log_summary(&self) {
        info!(
            packets = self.packets,
            bytes = self.bytes,
            elapsed = ?self.elapsed(),
            packets_per_sec = format_args!("{:.2}", self.packets_per_sec()),
            "feed totals"
        );
        info!(
            delivered = self.delivered,
            buffered = self.buffered,
            duplicates = self.duplicates,
            resets = self.resets,
            "reorder windows"
        );
        info!(
            applied = self.applied,
            snapshots = self.snapshots,
            discarded = self.discarded,
            overflows = self.overflows,
            gaps = self.gaps,
            recovery_requests = self.recovery_requests,
            anomalies = self.anomalies,
            decode_failures = self.decode_failures,
            "sequencers"
        );
        if let Some(stats) = self.apply_latency_stats() {
            info!(
                min_us = stats.min_us,
                max_us = stats.max_us,
                mean_us = format_args!("{:.2}", stats.mean_us),
                p50_us = stats.p50_us,
                p99_us = stats.p99_us,
                "apply latency"
            );
        }
    }
}
