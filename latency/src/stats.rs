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

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

// Cache-line aligned so the capture path counters don't false-share with the sweep counters
#[repr(align(64))]
#[derive(Default)]
struct EventCounters {
    queries: AtomicU64,
    retransmissions: AtomicU64,
    responses: AtomicU64,
    matched: AtomicU64,
    unmatched_responses: AtomicU64,
    degenerate_rtts: AtomicU64,
    rtt_outliers: AtomicU64,
}

#[repr(align(64))]
#[derive(Default)]
struct EvictionCounters {
    capacity_evictions: AtomicU64,
    expired: AtomicU64,
}

/// Counters for the non-fatal conditions seen while correlating
#[derive(Default)]
pub struct Stats {
    events: EventCounters,
    evictions: EvictionCounters,
}

/// Point in time copy of [`Stats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub queries: u64,
    pub retransmissions: u64,
    pub responses: u64,
    pub matched: u64,
    pub unmatched_responses: u64,
    pub degenerate_rtts: u64,
    pub rtt_outliers: u64,
    pub capacity_evictions: u64,
    pub expired: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn increment_query(&self, replaced: bool) {
        self.events.queries.fetch_add(1, Ordering::Relaxed);
        if replaced {
            self.events.retransmissions.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn increment_response(&self, matched: bool) {
        self.events.responses.fetch_add(1, Ordering::Relaxed);
        let counter = if matched { &self.events.matched } else { &self.events.unmatched_responses };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn increment_degenerate_rtt(&self) {
        self.events.degenerate_rtts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn increment_rtt_outlier(&self) {
        self.events.rtt_outliers.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_capacity_evictions(&self, count: u64) {
        self.evictions.capacity_evictions.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_expired(&self, count: u64) {
        self.evictions.expired.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            queries: self.events.queries.load(Ordering::Relaxed),
            retransmissions: self.events.retransmissions.load(Ordering::Relaxed),
            responses: self.events.responses.load(Ordering::Relaxed),
            matched: self.events.matched.load(Ordering::Relaxed),
            unmatched_responses: self.events.unmatched_responses.load(Ordering::Relaxed),
            degenerate_rtts: self.events.degenerate_rtts.load(Ordering::Relaxed),
            rtt_outliers: self.events.rtt_outliers.load(Ordering::Relaxed),
            capacity_evictions: self.evictions.capacity_evictions.load(Ordering::Relaxed),
            expired: self.evictions.expired.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "queries: {} (retransmitted: {}), responses: {} (matched: {}, unmatched: {}), zero rtt: {}, outliers: {}, evicted: {} (capacity) {} (expired)",
            self.queries,
            self.retransmissions,
            self.responses,
            self.matched,
            self.unmatched_responses,
            self.degenerate_rtts,
            self.rtt_outliers,
            self.capacity_evictions,
            self.expired
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = Stats::new();
        stats.increment_query(false);
        stats.increment_query(true);
        stats.increment_response(true);
        stats.increment_response(false);
        stats.increment_response(false);
        stats.add_capacity_evictions(3);
        stats.add_expired(2);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.queries, 2);
        assert_eq!(snapshot.retransmissions, 1);
        assert_eq!(snapshot.responses, 3);
        assert_eq!(snapshot.matched, 1);
        assert_eq!(snapshot.unmatched_responses, 2);
        assert_eq!(snapshot.capacity_evictions, 3);
        assert_eq!(snapshot.expired, 2);
        assert_eq!(snapshot.degenerate_rtts, 0);
    }
}
