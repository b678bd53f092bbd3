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

use clap::Parser;
use faf_dns_latency::TrackerConfig;

/// FaF DNS Replay - DNS query/response latency from a recorded event trace
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
   /// event trace to replay, one JSON event per line.
   #[clap(short, long)]
   pub trace: std::path::PathBuf,

   /// directory to write map.json and hist.json to. Defaults to the current working directory.
   #[clap(short, long)]
   pub out_dir: Option<std::path::PathBuf>,

   /// number of concurrent workers feeding the tracker.
   #[clap(short, long, default_value_t = 4)]
   pub workers: usize,

   /// maximum number of unanswered queries held at once. The oldest is dropped past this.
   #[clap(long, default_value_t = faf_dns_latency::config::DEFAULT_MAX_PENDING)]
   pub max_pending: usize,

   /// unanswered queries older than this are dropped by the sweep.
   #[clap(long, default_value_t = 5000)]
   pub max_age_ms: u64,

   /// how often the expiry sweep runs.
   #[clap(long, default_value_t = 100)]
   pub sweep_interval_ms: u64,

   /// answers slower than this are matched but left out of the histogram.
   #[clap(long)]
   pub max_rtt_ms: Option<u64>,

   /// log each matched exchange and the replay summary.
   #[clap(short, long)]
   pub verbose: bool,

   /// daemon mode, no logging output.
   #[clap(short, long)]
   pub daemon: bool,
}

impl Args {
   pub fn tracker_config(&self) -> TrackerConfig {
      TrackerConfig {
         max_pending: self.max_pending,
         max_rtt_ns: self.max_rtt_ms.map(|ms| ms.saturating_mul(1_000_000)),
         ..TrackerConfig::default()
      }
   }

   pub fn max_age_ns(&self) -> u64 {
      self.max_age_ms.saturating_mul(1_000_000)
   }
}

#[test]
fn args_defaults_test() {
   let args = Args::try_parse_from(["faf-dns-replay", "--trace", "events.jsonl"]).unwrap();
   assert_eq!(args.trace, std::path::PathBuf::from("events.jsonl"));
   assert_eq!(args.out_dir, None);
   assert_eq!(args.workers, 4);
   assert_eq!(args.max_pending, 1024);
   assert_eq!(args.max_age_ns(), 5_000_000_000);
   assert!(!args.daemon);

   let config = args.tracker_config();
   assert_eq!(config.max_pending, 1024);
   assert_eq!(config.max_rtt_ns, None);
}

#[test]
fn args_overrides_test() {
   let args = Args::try_parse_from([
      "faf-dns-replay",
      "-t",
      "events.jsonl",
      "-o",
      "/tmp/out",
      "-w",
      "8",
      "--max-pending",
      "16",
      "--max-rtt-ms",
      "500",
      "-v",
   ])
   .unwrap();
   assert_eq!(args.workers, 8);
   assert!(args.verbose);

   let config = args.tracker_config();
   assert_eq!(config.max_pending, 16);
   assert_eq!(config.max_rtt_ns, Some(500_000_000));
}

#[test]
fn args_require_trace_test() {
   assert!(Args::try_parse_from(["faf-dns-replay"]).is_err());
}
