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

//! Bounded store of in-flight queries, keyed by [`FlowKey`]

use crate::config::TrackerConfig;
use crate::error::Result;
use crate::flow_key::FlowKey;
use crate::hasher::{KeyBuildHasher, key_build_hasher};
use crate::rtt::{self, RttObservation};
use crate::stats::Stats;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::{debug, warn};
use std::collections::BTreeMap;
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A query still waiting for its response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingQuery {
    pub key: FlowKey,
    pub query_ts_ns: u64,
}

/// Whether [`CorrelationTable::record_query`] admitted a new key or overwrote a retransmission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    Inserted,
    Replaced,
}

#[derive(Debug, Clone, Copy)]
struct PendingEntry {
    query_ts_ns: u64,
    // breaks ties between equal timestamps and detects replacement between lookup and remove
    seq: u64,
}

impl PendingEntry {
    fn age_order(&self) -> (u64, u64) {
        (self.query_ts_ns, self.seq)
    }
}

/// Pending entries ordered oldest first.
///
/// Split into lanes by key hash, each behind its own short lock, so recording queries for
/// different keys rarely touches the same lane. Finding the oldest entry reads one head per
/// lane. Index entries are added while the table entry's shard is still locked and removed
/// after the table entry is gone, so a stale head can show up here but a live entry is never
/// missing once its insert returns.
struct AgeIndex {
    lanes: Box<[Mutex<BTreeMap<(u64, u64), FlowKey>>]>,
    hasher: KeyBuildHasher,
}

impl AgeIndex {
    fn new(lane_count: usize) -> Self {
        Self { lanes: (0..lane_count).map(|_| Mutex::new(BTreeMap::new())).collect(), hasher: key_build_hasher() }
    }

    fn lane(&self, key: &FlowKey) -> MutexGuard<'_, BTreeMap<(u64, u64), FlowKey>> {
        // lane count is a power of two
        let index = self.hasher.hash_one(key) as usize & (self.lanes.len() - 1);
        self.lanes[index].lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, key: FlowKey, entry: &PendingEntry) {
        self.lane(&key).insert(entry.age_order(), key);
    }

    fn remove(&self, key: &FlowKey, age_order: (u64, u64)) {
        self.lane(key).remove(&age_order);
    }

    fn oldest(&self) -> Option<((u64, u64), FlowKey)> {
        self.lanes
            .iter()
            .filter_map(|lane| {
                let lane = lane.lock().unwrap_or_else(PoisonError::into_inner);
                lane.first_key_value().map(|(order, key)| (*order, *key))
            })
            .min_by_key(|(order, _)| *order)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lanes.iter().map(|lane| lane.lock().unwrap_or_else(PoisonError::into_inner).len()).sum()
    }
}

/// Thread-safe correlation table.
///
/// Entries live in a sharded map, so operations on different keys only contend when they hash
/// to the same shard, and operations on the same key are serialized by that shard's lock. The
/// number of entries never exceeds `max_pending`: a slot is reserved before a new key is
/// admitted, and when none is free the entry with the oldest query timestamp is evicted first.
pub struct CorrelationTable {
    entries: DashMap<FlowKey, PendingEntry, KeyBuildHasher>,
    // lock order is always entries shard, then index lane
    index: AgeIndex,
    // reserved slots; always >= entries.len()
    reserved: AtomicUsize,
    max_pending: usize,
    next_seq: AtomicU64,
    stats: Arc<Stats>,
}

impl CorrelationTable {
    /// Create a new correlation table reporting into `stats`
    pub fn new(config: &TrackerConfig, stats: Arc<Stats>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            entries: DashMap::with_capacity_and_hasher_and_shard_amount(
                config.max_pending,
                key_build_hasher(),
                config.shard_amount,
            ),
            index: AgeIndex::new(config.shard_amount),
            reserved: AtomicUsize::new(0),
            max_pending: config.max_pending,
            next_seq: AtomicU64::new(0),
            stats,
        })
    }

    /// Create a table with the default configuration and its own counters
    pub fn with_defaults() -> Result<Self> {
        Self::new(&TrackerConfig::default(), Arc::new(Stats::new()))
    }

    /// Insert the pending query for `key`, replacing (and restarting the clock of) any earlier
    /// query with the same key.
    pub fn record_query(&self, key: FlowKey, query_ts_ns: u64) -> QueryOutcome {
        let entry = PendingEntry { query_ts_ns, seq: self.next_seq.fetch_add(1, Ordering::Relaxed) };

        loop {
            match self.entries.entry(key) {
                Entry::Occupied(mut occupied) => {
                    let replaced = occupied.insert(entry);
                    self.index.remove(&key, replaced.age_order());
                    self.index.insert(key, &entry);
                    self.stats.increment_query(true);
                    return QueryOutcome::Replaced;
                }
                Entry::Vacant(vacant) => {
                    if self.try_reserve_slot() {
                        let _inserted = vacant.insert(entry);
                        self.index.insert(key, &entry);
                        self.stats.increment_query(false);
                        return QueryOutcome::Inserted;
                    }
                }
            }

            // Full. The shard guard is released above, so eviction can take any shard.
            if !self.evict_oldest() {
                // every reserved slot is still being filled
                std::thread::yield_now();
            }
        }
    }

    /// Remove the pending query matching `key` and turn it into an observation.
    ///
    /// Returns `None` for an unmatched response. Removal is atomic, so of two racing responses
    /// for the same exchange exactly one gets the observation.
    pub fn record_response(&self, key: FlowKey, response_ts_ns: u64) -> Option<RttObservation> {
        let Some((key, entry)) = self.entries.remove(&key) else {
            self.stats.increment_response(false);
            debug!("unmatched response {}", key);
            return None;
        };
        self.index.remove(&key, entry.age_order());
        self.reserved.fetch_sub(1, Ordering::AcqRel);
        self.stats.increment_response(true);

        let rtt_ns = match rtt::elapsed(entry.query_ts_ns, response_ts_ns) {
            Some(rtt_ns) => rtt_ns,
            None => {
                warn!(
                    "response for {} at {}ns precedes its query at {}ns, clamping rtt to 0",
                    key, response_ts_ns, entry.query_ts_ns
                );
                0
            }
        };
        if rtt_ns == 0 {
            self.stats.increment_degenerate_rtt();
        }

        Some(RttObservation { key, rtt_ns })
    }

    /// Drop every pending query with `now_ns - query_ts_ns > max_age_ns`.
    ///
    /// Shards are swept one at a time; inserts into other shards proceed during the sweep.
    pub fn evict_expired(&self, now_ns: u64, max_age_ns: u64) -> usize {
        let mut expired = Vec::new();
        self.entries.retain(|key, entry| {
            let keep = now_ns.saturating_sub(entry.query_ts_ns) <= max_age_ns;
            if !keep {
                debug!("expired pending query {} from {}ns", key, entry.query_ts_ns);
                expired.push((*key, entry.age_order()));
            }
            keep
        });

        for (key, age_order) in &expired {
            self.index.remove(key, *age_order);
        }
        if !expired.is_empty() {
            self.reserved.fetch_sub(expired.len(), Ordering::AcqRel);
            self.stats.add_expired(expired.len() as u64);
        }
        expired.len()
    }

    /// Point in time copy of the pending queries, oldest first
    pub fn pending(&self) -> Vec<PendingQuery> {
        let mut pending: Vec<(u64, PendingQuery)> = self
            .entries
            .iter()
            .map(|item| {
                let entry = item.value();
                (entry.seq, PendingQuery { key: *item.key(), query_ts_ns: entry.query_ts_ns })
            })
            .collect();
        pending.sort_unstable_by_key(|(seq, query)| (query.query_ts_ns, *seq));
        pending.into_iter().map(|(_, query)| query).collect()
    }

    /// Get the current number of pending queries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_pending
    }

    /// Clear all pending queries without counting them as expired
    pub fn clear(&self) {
        let mut removed = Vec::new();
        self.entries.retain(|key, entry| {
            removed.push((*key, entry.age_order()));
            false
        });
        for (key, age_order) in &removed {
            self.index.remove(key, *age_order);
        }
        self.reserved.fetch_sub(removed.len(), Ordering::AcqRel);
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    fn try_reserve_slot(&self) -> bool {
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |reserved| {
                (reserved < self.max_pending).then_some(reserved + 1)
            })
            .is_ok()
    }

    /// Evict the entry with the oldest query timestamp to make room for a new one.
    ///
    /// Returns false only when the index is empty. A head that was matched or replaced since it
    /// was read is dropped from the index instead, and the caller retries.
    fn evict_oldest(&self) -> bool {
        let Some((age_order, key)) = self.index.oldest() else {
            return false;
        };

        let Some((key, removed)) = self.entries.remove_if(&key, |_, current| current.seq == age_order.1) else {
            // seq is never reused, so nothing in the table still owns this index entry
            self.index.remove(&key, age_order);
            return true;
        };
        self.index.remove(&key, age_order);
        self.reserved.fetch_sub(1, Ordering::AcqRel);
        self.stats.add_capacity_evictions(1);
        debug!("table full ({} entries), evicted pending query {} from {}ns", self.max_pending, key, removed.query_ts_ns);

        true
    }
}
