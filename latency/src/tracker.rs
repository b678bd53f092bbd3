/*
FaF DNS Latency measures DNS query/response round trip times
Copyright (C) 2022  James Bates

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

//! Query/response correlation feeding the latency histogram

use crate::config::TrackerConfig;
use crate::correlation::{CorrelationTable, PendingQuery, QueryOutcome};
use crate::error::Result;
use crate::export::{self, HistogramRecord, PendingRecord};
use crate::flow_key::FlowKey;
use crate::histogram::{Histogram, HistogramBucket};
use crate::rtt::RttObservation;
use crate::stats::{Stats, StatsSnapshot};
use log::debug;
use std::io::Write;
use std::sync::Arc;

/// Owns the correlation table and the histogram for one measurement.
///
/// All methods take `&self`; share it between capture contexts with an `Arc`.
pub struct DnsLatencyTracker {
    table: CorrelationTable,
    histogram: Histogram,
    stats: Arc<Stats>,
    max_rtt_ns: Option<u64>,
}

impl DnsLatencyTracker {
    pub fn new(config: TrackerConfig) -> Result<Self> {
        let stats = Arc::new(Stats::new());
        Ok(Self {
            table: CorrelationTable::new(&config, stats.clone())?,
            histogram: Histogram::new(),
            stats,
            max_rtt_ns: config.max_rtt_ns,
        })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(TrackerConfig::default())
    }

    /// A query for `key` was seen at `timestamp_ns`
    pub fn query_event(&self, key: FlowKey, timestamp_ns: u64) -> QueryOutcome {
        self.table.record_query(key, timestamp_ns)
    }

    /// A response for `key` was seen at `timestamp_ns`.
    ///
    /// Returns the completed exchange, or `None` if no query was pending for the key. An
    /// exchange slower than the configured `max_rtt_ns` is returned but not added to the
    /// histogram.
    pub fn response_event(&self, key: FlowKey, timestamp_ns: u64) -> Option<RttObservation> {
        let observation = self.table.record_response(key, timestamp_ns)?;

        match self.max_rtt_ns {
            Some(max_rtt_ns) if observation.rtt_ns > max_rtt_ns => {
                debug!("rtt {}ns for {} exceeds {}ns, not counted", observation.rtt_ns, key, max_rtt_ns);
                self.stats.increment_rtt_outlier();
            }
            _ => self.histogram.observe_rtt(observation.rtt_ns),
        }

        Some(observation)
    }

    /// Drop pending queries older than `max_age_ns` at `now_ns`. Meant to be called periodically by the driver.
    pub fn evict_expired(&self, now_ns: u64, max_age_ns: u64) -> usize {
        self.table.evict_expired(now_ns, max_age_ns)
    }

    pub fn pending(&self) -> Vec<PendingQuery> {
        self.table.pending()
    }

    pub fn pending_len(&self) -> usize {
        self.table.len()
    }

    pub fn histogram(&self) -> Vec<HistogramBucket> {
        self.histogram.snapshot()
    }

    /// Return the histogram window so far and start a new one
    pub fn rotate_histogram(&self) -> Vec<HistogramBucket> {
        self.histogram.snapshot_and_reset()
    }

    pub fn reset_histogram(&self) {
        self.histogram.reset();
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn export_pending(&self) -> Vec<PendingRecord> {
        export::export_pending(&self.pending())
    }

    pub fn export_histogram(&self) -> Vec<HistogramRecord> {
        export::export_histogram(&self.histogram())
    }

    pub fn write_pending<W: Write>(&self, writer: W) -> Result<()> {
        export::write_pending(writer, &self.pending())
    }

    pub fn write_histogram<W: Write>(&self, writer: W) -> Result<()> {
        export::write_histogram(writer, &self.histogram())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtt;
    use std::net::{IpAddr, Ipv4Addr};
    use std::thread;

    fn key(dns_id: u16) -> FlowKey {
        FlowKey::from_raw(4, &[10, 0, 0, 1], dns_id).unwrap()
    }

    #[test]
    fn test_end_to_end_single_exchange() {
        let tracker = DnsLatencyTracker::with_defaults().unwrap();
        assert_eq!(tracker.query_event(key(0x1234), 1_000_000), QueryOutcome::Inserted);

        let observation = tracker.response_event(key(0x1234), 1_250_000).unwrap();
        assert_eq!(observation.rtt_ns, 250_000);
        assert_eq!(observation.bucket(), 17);

        assert_eq!(tracker.histogram(), vec![HistogramBucket { index: 17, count: 1 }]);
        assert_eq!(tracker.pending_len(), 0);
    }

    #[test]
    fn test_end_to_end_retransmission() {
        let tracker = DnsLatencyTracker::with_defaults().unwrap();
        tracker.query_event(key(0x1234), 1_000_000);
        assert_eq!(tracker.query_event(key(0x1234), 1_200_000), QueryOutcome::Replaced);

        let observation = tracker.response_event(key(0x1234), 1_250_000).unwrap();
        assert_eq!(observation.rtt_ns, 50_000);
        assert!(tracker.response_event(key(0x1234), 1_260_000).is_none());

        assert_eq!(tracker.histogram(), vec![HistogramBucket { index: rtt::compute(50_000), count: 1 }]);
        let stats = tracker.stats();
        assert_eq!(stats.retransmissions, 1);
        assert_eq!(stats.matched, 1);
        assert_eq!(stats.unmatched_responses, 1);
    }

    #[test]
    fn test_unmatched_response_leaves_histogram() {
        let tracker = DnsLatencyTracker::with_defaults().unwrap();
        assert!(tracker.response_event(key(1), 10).is_none());
        assert!(tracker.histogram().is_empty());
    }

    #[test]
    fn test_zero_rtt_counts_in_bucket_zero() {
        let tracker = DnsLatencyTracker::with_defaults().unwrap();
        tracker.query_event(key(1), 500);
        assert_eq!(tracker.response_event(key(1), 500).unwrap().rtt_ns, 0);
        assert_eq!(tracker.histogram(), vec![HistogramBucket { index: 0, count: 1 }]);
        assert_eq!(tracker.stats().degenerate_rtts, 1);
    }

    #[test]
    fn test_max_rtt_filter() {
        let config = TrackerConfig { max_rtt_ns: Some(500_000_000), ..TrackerConfig::default() };
        let tracker = DnsLatencyTracker::new(config).unwrap();

        tracker.query_event(key(1), 0);
        let slow = tracker.response_event(key(1), 600_000_000).unwrap();
        assert_eq!(slow.rtt_ns, 600_000_000);
        assert!(tracker.histogram().is_empty());
        assert_eq!(tracker.pending_len(), 0);
        assert_eq!(tracker.stats().rtt_outliers, 1);

        tracker.query_event(key(2), 0);
        tracker.response_event(key(2), 500_000_000).unwrap();
        assert_eq!(tracker.histogram().len(), 1);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = TrackerConfig { max_pending: 0, ..TrackerConfig::default() };
        assert!(DnsLatencyTracker::new(config).is_err());
    }

    #[test]
    fn test_expiry_then_late_response() {
        let tracker = DnsLatencyTracker::with_defaults().unwrap();
        tracker.query_event(key(1), 1_000);
        assert_eq!(tracker.evict_expired(10_000, 5_000), 1);
        assert!(tracker.response_event(key(1), 10_001).is_none());
        assert_eq!(tracker.stats().expired, 1);
    }

    #[test]
    fn test_rotate_histogram() {
        let tracker = DnsLatencyTracker::with_defaults().unwrap();
        tracker.query_event(key(1), 0);
        tracker.response_event(key(1), 1_024);

        assert_eq!(tracker.rotate_histogram(), vec![HistogramBucket { index: 10, count: 1 }]);
        assert!(tracker.histogram().is_empty());
    }

    #[test]
    fn test_exports_are_read_only() {
        let tracker = DnsLatencyTracker::with_defaults().unwrap();
        tracker.query_event(key(1), 100);
        tracker.query_event(key(2), 200);
        tracker.response_event(key(2), 300);

        let pending = tracker.export_pending();
        let histogram = tracker.export_histogram();
        assert_eq!(pending.len(), 1);
        assert_eq!(histogram.len(), 1);
        assert_eq!(tracker.pending_len(), 1);
        assert_eq!(tracker.histogram().len(), 1);

        let mut out = Vec::new();
        tracker.write_pending(&mut out).unwrap();
        let decoded = export::decode_pending(std::str::from_utf8(&out).unwrap()).unwrap();
        assert_eq!(decoded, vec![PendingQuery { key: key(1), query_ts_ns: 100 }]);

        let mut out = Vec::new();
        tracker.write_histogram(&mut out).unwrap();
        let decoded = export::decode_histogram(std::str::from_utf8(&out).unwrap()).unwrap();
        assert_eq!(decoded, tracker.histogram());
    }

    #[test]
    fn test_concurrent_capture_contexts() {
        let tracker = Arc::new(DnsLatencyTracker::with_defaults().unwrap());

        let threads: Vec<_> = (0..4u8)
            .map(|t| {
                let tracker = tracker.clone();
                thread::spawn(move || {
                    let mut rng = fastrand::Rng::with_seed(u64::from(t));
                    for id in 0..500u16 {
                        let key = FlowKey::new(IpAddr::V4(Ipv4Addr::new(10, 0, 1, t)), id);
                        let start = rng.u64(0..1_000_000);
                        tracker.query_event(key, start);
                        tracker.response_event(key, start + 250_000);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(tracker.histogram(), vec![HistogramBucket { index: 17, count: 2_000 }]);
        assert_eq!(tracker.stats().matched, 2_000);
        assert_eq!(tracker.pending_len(), 0);
    }
}
