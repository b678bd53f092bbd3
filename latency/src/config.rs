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

use crate::error::{Error, Result};
use serde::Deserialize;

/// Same bound as the kernel-side query timestamp map
pub const DEFAULT_MAX_PENDING: usize = 1024;

/// Tracker configuration.
///
/// Every field has a default, so a partial document (or none at all) deserializes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Maximum number of in-flight queries held at once
    pub max_pending: usize,
    /// Number of independently locked shards in the correlation table. Must be a power of two > 1.
    pub shard_amount: usize,
    /// Matched exchanges slower than this are returned but kept out of the histogram
    pub max_rtt_ns: Option<u64>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self { max_pending: DEFAULT_MAX_PENDING, shard_amount: default_shard_amount(), max_rtt_ns: None }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_pending == 0 {
            return Err(Error::InvalidConfig("max_pending must be at least 1".to_string()));
        }
        if self.shard_amount < 2 || !self.shard_amount.is_power_of_two() {
            return Err(Error::InvalidConfig(format!(
                "shard_amount must be a power of two greater than 1, got {}",
                self.shard_amount
            )));
        }
        if self.max_rtt_ns == Some(0) {
            return Err(Error::InvalidConfig("max_rtt_ns must be greater than 0 when set".to_string()));
        }
        Ok(())
    }
}

// 4 shards per core, like dashmap's own default
fn default_shard_amount() -> usize {
    let cores = std::thread::available_parallelism().map_or(1, usize::from);
    (cores * 4).next_power_of_two().max(2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = TrackerConfig::default();
        assert_eq!(config.max_pending, DEFAULT_MAX_PENDING);
        assert!(config.shard_amount.is_power_of_two());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let config: TrackerConfig = serde_json::from_str(r#"{ "max_pending": 16, "max_rtt_ns": 500000000 }"#).unwrap();
        assert_eq!(config.max_pending, 16);
        assert_eq!(config.max_rtt_ns, Some(500_000_000));
        assert_eq!(config.shard_amount, TrackerConfig::default().shard_amount);
    }

    #[test]
    fn test_validate_rejects() {
        let zero = TrackerConfig { max_pending: 0, ..TrackerConfig::default() };
        assert!(matches!(zero.validate(), Err(Error::InvalidConfig(_))));

        let odd_shards = TrackerConfig { shard_amount: 3, ..TrackerConfig::default() };
        assert!(matches!(odd_shards.validate(), Err(Error::InvalidConfig(_))));

        let one_shard = TrackerConfig { shard_amount: 1, ..TrackerConfig::default() };
        assert!(matches!(one_shard.validate(), Err(Error::InvalidConfig(_))));

        let zero_rtt = TrackerConfig { max_rtt_ns: Some(0), ..TrackerConfig::default() };
        assert!(matches!(zero_rtt.validate(), Err(Error::InvalidConfig(_))));
    }
}
