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

//! Log2 latency histogram

use crate::error::{Error, Result};
use crate::rtt::{self, BUCKET_COUNT};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// One non-empty histogram bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistogramBucket {
    pub index: u32,
    pub count: u64,
}

impl HistogramBucket {
    /// Inclusive nanosecond range this bucket covers
    pub fn range_ns(&self) -> (u64, u64) {
        rtt::bucket_range(self.index)
    }
}

#[repr(align(64))]
struct Buckets([AtomicU64; BUCKET_COUNT]);

impl Buckets {
    const fn new() -> Self {
        Self([const { AtomicU64::new(0) }; BUCKET_COUNT])
    }

    fn collect(&self) -> Vec<HistogramBucket> {
        self.0
            .iter()
            .enumerate()
            .filter_map(|(index, count)| {
                let count = count.load(Ordering::Relaxed);
                (count > 0).then_some(HistogramBucket { index: index as u32, count })
            })
            .collect()
    }
}

/// Bucket index -> observation count.
///
/// `observe` is an atomic increment taken under the shared side of the window lock, so the
/// capture path never waits on other observers. `reset` takes the exclusive side, so a
/// `snapshot` sees either the whole window before the reset or the empty one after it.
pub struct Histogram {
    window: RwLock<Buckets>,
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

impl Histogram {
    pub const fn new() -> Self {
        Self { window: RwLock::new(Buckets::new()) }
    }

    /// Count one observation in `bucket_index`. An index past the last bucket is rejected and
    /// nothing is counted.
    #[inline]
    pub fn observe(&self, bucket_index: u32) -> Result<()> {
        let window = self.read();
        let count = window.0.get(bucket_index as usize).ok_or_else(|| {
            Error::InvalidRecord(format!("bucket index {} out of range, expected 0..{}", bucket_index, BUCKET_COUNT))
        })?;
        count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Count one round trip. Every u64 maps to a bucket, so this can't fail.
    #[inline]
    pub fn observe_rtt(&self, rtt_ns: u64) {
        self.read().0[rtt::compute(rtt_ns) as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Non-empty buckets in ascending index order
    pub fn snapshot(&self) -> Vec<HistogramBucket> {
        self.read().collect()
    }

    /// Count for a single bucket
    pub fn count(&self, bucket_index: u32) -> u64 {
        self.read().0.get(bucket_index as usize).map_or(0, |count| count.load(Ordering::Relaxed))
    }

    /// Total observations in the current window
    pub fn total(&self) -> u64 {
        self.read().0.iter().map(|count| count.load(Ordering::Relaxed)).sum()
    }

    pub fn reset(&self) {
        let window = self.write();
        for count in &window.0 {
            count.store(0, Ordering::Relaxed);
        }
    }

    /// Close the current window: return its buckets and start a new empty one, atomically
    pub fn snapshot_and_reset(&self) -> Vec<HistogramBucket> {
        let window = self.write();
        let snapshot = window.collect();
        for count in &window.0 {
            count.store(0, Ordering::Relaxed);
        }
        snapshot
    }

    fn read(&self) -> RwLockReadGuard<'_, Buckets> {
        // counters are plain atomics, a panicking holder can't leave them torn
        self.window.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Buckets> {
        self.window.write().unwrap_or_else(PoisonError::into_inner)
    }
}
