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

use crate::args::Args;
use crate::statics::*;
use crate::trace::{self, EventKind, TraceEvent};
use anyhow::Context;
use faf_dns_latency::{DnsLatencyTracker, FlowKey, HistogramBucket, StatsSnapshot};
use log::{debug, info};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncBufReadExt;

// A worker's watermark is the timestamp of the last event it applied, u64::MAX until it has
// applied one. Responses are routed to the same worker as their query, so sweeping at the
// lowest watermark never expires a query whose response is still queued within max_age.
type Watermarks = Arc<Vec<AtomicU64>>;

#[derive(Debug)]
pub struct ReplaySummary {
   pub events: u64,
   pub last_ts_ns: u64,
   pub stats: StatsSnapshot,
   pub pending: usize,
   pub histogram: Vec<HistogramBucket>,
   pub pending_path: PathBuf,
   pub histogram_path: PathBuf,
}

pub async fn go(args: &Args) -> anyhow::Result<ReplaySummary> {
   anyhow::ensure!(args.workers > 0, "--workers must be at least 1");

   let tracker = Arc::new(DnsLatencyTracker::new(args.tracker_config()).context("invalid tracker configuration")?);
   let max_age_ns = args.max_age_ns();
   let watermarks: Watermarks = Arc::new((0..args.workers).map(|_| AtomicU64::new(u64::MAX)).collect());

   let mut tx_channels: Vec<kanal::AsyncSender<TraceEvent>> = Vec::with_capacity(args.workers);
   let mut workers = Vec::with_capacity(args.workers);
   for index in 0..args.workers {
      let (tx, rx) = kanal::bounded_async::<TraceEvent>(WORKER_QUEUE_LEN);
      workers.push(tokio::task::spawn(apply_events(rx, index, tracker.clone(), watermarks.clone())));
      tx_channels.push(tx);
   }

   let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
   let sweep_every = tokio::time::Duration::from_millis(args.sweep_interval_ms.max(1));
   let sweeper = tokio::task::spawn(sweep_expired(tracker.clone(), watermarks.clone(), sweep_every, max_age_ns, stop_rx));

   let trace_file =
      tokio::fs::File::open(&args.trace).await.with_context(|| format!("failed to open trace {:?}", args.trace))?;
   let mut lines = tokio::io::BufReader::new(trace_file).lines();

   let mut line_number = 0usize;
   let mut events: u64 = 0;
   let mut last_ts_ns: u64 = 0;
   while let Some(line) = lines.next_line().await.with_context(|| format!("failed to read trace {:?}", args.trace))? {
      line_number += 1;
      let Some(event) = trace::parse_line(&line).with_context(|| format!("{:?} line {}", args.trace, line_number))? else {
         continue;
      };

      events += 1;
      last_ts_ns = last_ts_ns.max(event.ts_ns);
      let tx = &tx_channels[worker_index(&event.key, tx_channels.len())];
      tx.send(event).await.context("worker stopped before the trace was consumed")?;
   }

   // closing the channels lets the workers drain and exit
   drop(tx_channels);
   for worker in workers {
      worker.await.context("worker panicked")?;
   }
   let _ = stop_tx.send(());
   sweeper.await.context("expiry sweep panicked")?;

   // Final sweep against the last event, so what is left pending doesn't depend on timer luck
   let expired = tracker.evict_expired(last_ts_ns, max_age_ns);
   debug!("final sweep at {}ns expired {} pending queries", last_ts_ns, expired);

   let out_dir = args.out_dir.clone().unwrap_or_else(|| PathBuf::from("."));
   tokio::fs::create_dir_all(&out_dir).await.with_context(|| format!("failed to create {:?}", out_dir))?;

   let pending_path = out_dir.join(PENDING_EXPORT_FILE);
   let mut pending_json = Vec::new();
   tracker.write_pending(&mut pending_json)?;
   tokio::fs::write(&pending_path, pending_json).await.with_context(|| format!("failed to write {:?}", pending_path))?;

   let histogram_path = out_dir.join(HISTOGRAM_EXPORT_FILE);
   let mut histogram_json = Vec::new();
   tracker.write_histogram(&mut histogram_json)?;
   tokio::fs::write(&histogram_path, histogram_json)
      .await
      .with_context(|| format!("failed to write {:?}", histogram_path))?;

   let summary = ReplaySummary {
      events,
      last_ts_ns,
      stats: tracker.stats(),
      pending: tracker.pending_len(),
      histogram: tracker.histogram(),
      pending_path,
      histogram_path,
   };
   info!("replayed {} events, {}", summary.events, summary.stats);
   info!("{} queries still pending -> {:?}", summary.pending, summary.pending_path);
   info!("{} histogram buckets -> {:?}", summary.histogram.len(), summary.histogram_path);

   Ok(summary)
}

async fn apply_events(
   rx: kanal::AsyncReceiver<TraceEvent>,
   index: usize,
   tracker: Arc<DnsLatencyTracker>,
   watermarks: Watermarks,
) {
   while let Ok(event) = rx.recv().await {
      match event.kind {
         EventKind::Query => {
            tracker.query_event(event.key, event.ts_ns);
         }
         EventKind::Response => {
            if let Some(observation) = tracker.response_event(event.key, event.ts_ns) {
               debug!("{:>4}us <- {}", observation.rtt_ns / 1_000, observation.key);
            }
         }
      }
      watermarks[index].store(event.ts_ns, Ordering::Release);
   }
}

async fn sweep_expired(
   tracker: Arc<DnsLatencyTracker>,
   watermarks: Watermarks,
   every: tokio::time::Duration,
   max_age_ns: u64,
   mut stop: tokio::sync::oneshot::Receiver<()>,
) {
   let mut interval = tokio::time::interval(every);
   interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

   loop {
      tokio::select! {
         _ = &mut stop => break,
         _ = interval.tick() => {
            let now_ns = watermarks.iter().map(|watermark| watermark.load(Ordering::Acquire)).min().unwrap_or(u64::MAX);
            if now_ns == u64::MAX {
               continue;
            }
            let expired = tracker.evict_expired(now_ns, max_age_ns);
            if expired > 0 {
               debug!("sweep at {}ns expired {} pending queries", now_ns, expired);
            }
         }
      }
   }
}

/// Pick the worker for a key. All events of one exchange land on the same worker, keeping their trace order.
#[inline]
fn worker_index(key: &FlowKey, workers: usize) -> usize {
   use xxhash_rust::xxh3::xxh3_64;

   (xxh3_64(&key.to_map_key_bytes()) % workers as u64) as usize
}

#[cfg(test)]
mod tests {
   use super::*;
   use clap::Parser;
   use faf_dns_latency::export;

   const TRACE: &str = r#"# two answered exchanges, one retransmission, one unanswered v6 query
{"kind":"query","ip_version":4,"addr":"10.0.0.1","dns_id":4660,"ts_ns":1000000}
{"kind":"query","ip_version":6,"addr":"2001:db8::53","dns_id":7,"ts_ns":1100000}
{"kind":"query","ip_version":4,"addr":"10.0.0.2","dns_id":1,"ts_ns":1200000}

{"kind":"query","ip_version":4,"addr":"10.0.0.2","dns_id":1,"ts_ns":1210000}
{"kind":"response","ip_version":4,"addr":"10.0.0.1","dns_id":4660,"ts_ns":1250000}
{"kind":"response","ip_version":4,"addr":"10.0.0.2","dns_id":1,"ts_ns":1220000}
{"kind":"response","ip_version":4,"addr":"10.0.0.9","dns_id":9,"ts_ns":1300000}
"#;

   fn args_for(dir: &tempfile::TempDir, trace: &str, extra: &[&str]) -> Args {
      let trace_path = dir.path().join("trace.jsonl");
      std::fs::write(&trace_path, trace).unwrap();

      let mut argv = vec![
         "faf-dns-replay".to_string(),
         "--trace".to_string(),
         trace_path.to_string_lossy().into_owned(),
         "--out-dir".to_string(),
         dir.path().join("out").to_string_lossy().into_owned(),
      ];
      argv.extend(extra.iter().map(|arg| arg.to_string()));
      Args::try_parse_from(argv).unwrap()
   }

   #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
   async fn test_replay_writes_exports() {
      let dir = tempfile::tempdir().unwrap();
      let args = args_for(&dir, TRACE, &["--workers", "3"]);

      let summary = go(&args).await.unwrap();
      assert_eq!(summary.events, 7);
      assert_eq!(summary.last_ts_ns, 1_300_000);
      assert_eq!(summary.stats.matched, 2);
      assert_eq!(summary.stats.retransmissions, 1);
      assert_eq!(summary.stats.unmatched_responses, 1);
      assert_eq!(summary.pending, 1);

      // 250us -> bucket 17, 10us -> bucket 13
      assert_eq!(
         summary.histogram,
         vec![HistogramBucket { index: 13, count: 1 }, HistogramBucket { index: 17, count: 1 }]
      );

      let pending = export::decode_pending(&std::fs::read_to_string(&summary.pending_path).unwrap()).unwrap();
      assert_eq!(pending.len(), 1);
      assert_eq!(pending[0].key.addr(), "2001:db8::53".parse::<std::net::IpAddr>().unwrap());
      assert_eq!(pending[0].query_ts_ns, 1_100_000);

      let histogram = export::decode_histogram(&std::fs::read_to_string(&summary.histogram_path).unwrap()).unwrap();
      assert_eq!(histogram, summary.histogram);
   }

   #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
   async fn test_replay_expires_stale_queries() {
      let dir = tempfile::tempdir().unwrap();
      let trace = r#"{"kind":"query","ip_version":4,"addr":"10.0.0.1","dns_id":1,"ts_ns":0}
{"kind":"query","ip_version":4,"addr":"10.0.0.2","dns_id":2,"ts_ns":1500000000}
{"kind":"response","ip_version":4,"addr":"10.0.0.3","dns_id":3,"ts_ns":2000000000}
"#;
      let args = args_for(&dir, trace, &["--max-age-ms", "1000"]);

      let summary = go(&args).await.unwrap();
      assert_eq!(summary.stats.expired, 1);
      assert_eq!(summary.stats.unmatched_responses, 1);
      assert_eq!(summary.pending, 1);
      assert!(summary.histogram.is_empty());
   }

   #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
   async fn test_replay_max_rtt_filter() {
      let dir = tempfile::tempdir().unwrap();
      let trace = r#"{"kind":"query","ip_version":4,"addr":"10.0.0.1","dns_id":1,"ts_ns":0}
{"kind":"response","ip_version":4,"addr":"10.0.0.1","dns_id":1,"ts_ns":600000000}
"#;
      let args = args_for(&dir, trace, &["--max-rtt-ms", "500"]);

      let summary = go(&args).await.unwrap();
      assert_eq!(summary.stats.matched, 1);
      assert_eq!(summary.stats.rtt_outliers, 1);
      assert!(summary.histogram.is_empty());
   }

   #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
   async fn test_replay_reports_bad_line() {
      let dir = tempfile::tempdir().unwrap();
      let trace = r#"{"kind":"query","ip_version":4,"addr":"10.0.0.1","dns_id":1,"ts_ns":0}
{"kind":"query","ip_version":4,"addr":"10.0.0.1"
"#;
      let args = args_for(&dir, trace, &[]);

      let err = go(&args).await.unwrap_err();
      assert!(format!("{:#}", err).contains("line 2"));
   }

   #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
   async fn test_replay_rejects_zero_workers() {
      let dir = tempfile::tempdir().unwrap();
      let args = args_for(&dir, TRACE, &["--workers", "0"]);
      assert!(go(&args).await.is_err());
   }

   #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
   async fn test_replay_many_workers_matches_everything() {
      let dir = tempfile::tempdir().unwrap();
      let mut rng = fastrand::Rng::with_seed(7);
      let mut trace = String::new();
      let mut ts = 0u64;
      for id in 0..2_000u16 {
         let addr = format!("10.0.{}.{}", id / 250, id % 250);
         ts += rng.u64(1..1_000);
         trace.push_str(&format!(
            "{{\"kind\":\"query\",\"ip_version\":4,\"addr\":\"{}\",\"dns_id\":{},\"ts_ns\":{}}}\n",
            addr, id, ts
         ));
         trace.push_str(&format!(
            "{{\"kind\":\"response\",\"ip_version\":4,\"addr\":\"{}\",\"dns_id\":{},\"ts_ns\":{}}}\n",
            addr,
            id,
            ts + 300_000
         ));
      }
      let args = args_for(&dir, &trace, &["--workers", "8", "--sweep-interval-ms", "1"]);

      let summary = go(&args).await.unwrap();
      assert_eq!(summary.stats.matched, 2_000);
      assert_eq!(summary.stats.unmatched_responses, 0);
      assert_eq!(summary.pending, 0);
      assert_eq!(summary.histogram, vec![HistogramBucket { index: 18, count: 2_000 }]);
   }

   #[test]
   fn test_worker_index_is_stable() {
      let key = FlowKey::from_raw(4, &[10, 0, 0, 1], 1).unwrap();
      let first = worker_index(&key, 8);
      assert!(first < 8);
      for _ in 0..10 {
         assert_eq!(worker_index(&key, 8), first);
      }
      assert_eq!(worker_index(&key, 1), 0);
   }
}
