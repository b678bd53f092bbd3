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

//! DNS round trip time correlation library
//!
//! Pairs DNS queries with their responses by (IP version, source address, transaction id),
//! measures the elapsed nanoseconds, and aggregates them into a log2 latency histogram. Query
//! and response events come from whatever capture layer the caller has; this crate only
//! correlates, counts, and exports.

pub mod config;
pub mod correlation;
pub mod error;
pub mod export;
pub mod flow_key;
mod hasher;
pub mod histogram;
pub mod rtt;
pub mod stats;
pub mod tracker;

// Re-export main public types
pub use config::TrackerConfig;
pub use correlation::{CorrelationTable, PendingQuery, QueryOutcome};
pub use error::{Error, Result};
pub use flow_key::{FlowKey, IpVersion};
pub use histogram::{Histogram, HistogramBucket};
pub use rtt::RttObservation;
pub use stats::{Stats, StatsSnapshot};
pub use tracker::DnsLatencyTracker;
