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

//! Log2 bucketing of round trip times.
//!
//! Bucket `k` covers `[2^k, 2^(k+1) - 1]` nanoseconds. A zero rtt (clock too coarse to see the
//! exchange) lands in bucket 0 instead of being dropped.

use crate::flow_key::FlowKey;

/// One bucket per bit of a u64 nanosecond value
pub const BUCKET_COUNT: usize = 64;

/// A completed query/response exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttObservation {
    pub key: FlowKey,
    pub rtt_ns: u64,
}

impl RttObservation {
    #[inline]
    pub fn bucket(&self) -> u32 {
        compute(self.rtt_ns)
    }
}

/// Index of the highest set bit of `rtt_ns`, 0 for 0
#[inline]
pub fn compute(rtt_ns: u64) -> u32 {
    rtt_ns.checked_ilog2().unwrap_or(0)
}

/// Nanosecond range covered by `index`, inclusive on both ends. Indices past the last bucket
/// saturate to the last bucket's range.
#[inline]
pub fn bucket_range(index: u32) -> (u64, u64) {
    let index = index.min(BUCKET_COUNT as u32 - 1);
    let low = 1u64 << index;
    let high = low.checked_mul(2).map_or(u64::MAX, |next| next - 1);
    (low, high)
}

/// Elapsed nanoseconds between query and response. Returns `None` when the response timestamp
/// is earlier than the query's, which only happens if the caller's clock went backwards.
#[inline]
pub fn elapsed(query_ts_ns: u64, response_ts_ns: u64) -> Option<u64> {
    response_ts_ns.checked_sub(query_ts_ns)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_in_bucket(rtt_ns: u64) {
        let index = compute(rtt_ns);
        let (low, high) = bucket_range(index);
        assert!(low <= rtt_ns && rtt_ns <= high, "{} not in bucket {} [{}, {}]", rtt_ns, index, low, high);
    }

    #[test]
    fn test_zero_clamps_to_bucket_zero() {
        assert_eq!(compute(0), 0);
    }

    #[test]
    fn test_small_values() {
        assert_eq!(compute(1), 0);
        assert_eq!(compute(2), 1);
        assert_eq!(compute(3), 1);
        assert_eq!(compute(4), 2);
        assert_eq!(compute(7), 2);
        assert_eq!(compute(8), 3);
    }

    #[test]
    fn test_power_of_two_boundaries() {
        for k in 0..64u32 {
            let low = 1u64 << k;
            assert_eq!(compute(low), k);
            if k > 0 {
                assert_eq!(compute(low - 1), k - 1);
            }
            assert_eq!(bucket_range(k).0, low);
        }
        assert_eq!(compute(u64::MAX), 63);
        assert_eq!(bucket_range(63), (1 << 63, u64::MAX));
    }

    #[test]
    fn test_ranges_tile_without_gaps() {
        for k in 0..63u32 {
            let (_, high) = bucket_range(k);
            let (next_low, _) = bucket_range(k + 1);
            assert_eq!(high + 1, next_low);
        }
    }

    #[test]
    fn test_random_values_land_in_their_range() {
        let mut rng = fastrand::Rng::with_seed(0x5eed);
        for _ in 0..100_000 {
            let shift = rng.u32(0..64);
            assert_in_bucket((rng.u64(1..=u64::MAX) >> shift).max(1));
        }
    }

    #[test]
    fn test_dns_sized_rtt() {
        // 250us: 2^17 = 131072 <= 250000 <= 262143
        assert_eq!(compute(250_000), 17);
    }

    #[test]
    fn test_elapsed() {
        assert_eq!(elapsed(1_000_000, 1_250_000), Some(250_000));
        assert_eq!(elapsed(5, 5), Some(0));
        assert_eq!(elapsed(6, 5), None);
    }
}
