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

use anyhow::Context;
use faf_dns_latency::FlowKey;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
   Query,
   Response,
}

/// One line of the trace, e.g.
/// `{"kind":"query","ip_version":4,"addr":"10.0.0.1","dns_id":4660,"ts_ns":1000000}`
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TraceLine {
   kind: EventKind,
   ip_version: u8,
   addr: std::net::IpAddr,
   dns_id: u16,
   ts_ns: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceEvent {
   pub kind: EventKind,
   pub key: FlowKey,
   pub ts_ns: u64,
}

/// Parse one trace line. Blank lines and `#` comments yield `None`.
pub fn parse_line(line: &str) -> anyhow::Result<Option<TraceEvent>> {
   let line = line.trim();
   if line.is_empty() || line.starts_with('#') {
      return Ok(None);
   }

   let parsed: TraceLine = serde_json::from_str(line).context("malformed trace event")?;

   // the declared version has to agree with the address, the codec checks the length
   let octets = match parsed.addr {
      std::net::IpAddr::V4(v4) => v4.octets().to_vec(),
      std::net::IpAddr::V6(v6) => v6.octets().to_vec(),
   };
   let key = FlowKey::from_raw(parsed.ip_version, &octets, parsed.dns_id)?;

   Ok(Some(TraceEvent { kind: parsed.kind, key, ts_ns: parsed.ts_ns }))
}

#[test]
fn parse_line_query_test() {
   let event = parse_line(r#"{"kind":"query","ip_version":4,"addr":"10.0.0.1","dns_id":4660,"ts_ns":1000000}"#)
      .unwrap()
      .unwrap();
   assert_eq!(event.kind, EventKind::Query);
   assert_eq!(event.key, FlowKey::from_raw(4, &[10, 0, 0, 1], 0x1234).unwrap());
   assert_eq!(event.ts_ns, 1_000_000);
}

#[test]
fn parse_line_v6_response_test() {
   let event =
      parse_line(r#"  {"kind":"response","ip_version":6,"addr":"2001:db8::53","dns_id":7,"ts_ns":5}  "#).unwrap().unwrap();
   assert_eq!(event.kind, EventKind::Response);
   assert_eq!(event.key.addr(), "2001:db8::53".parse::<std::net::IpAddr>().unwrap());
}

#[test]
fn parse_line_skips_blank_and_comments_test() {
   assert!(parse_line("").unwrap().is_none());
   assert!(parse_line("   ").unwrap().is_none());
   assert!(parse_line("# captured on eth0").unwrap().is_none());
}

#[test]
fn parse_line_rejects_test() {
   // version disagrees with the address
   assert!(parse_line(r#"{"kind":"query","ip_version":6,"addr":"10.0.0.1","dns_id":1,"ts_ns":1}"#).is_err());
   assert!(parse_line(r#"{"kind":"query","ip_version":5,"addr":"10.0.0.1","dns_id":1,"ts_ns":1}"#).is_err());
   assert!(parse_line(r#"{"kind":"retry","ip_version":4,"addr":"10.0.0.1","dns_id":1,"ts_ns":1}"#).is_err());
   assert!(parse_line(r#"{"kind":"query","ip_version":4,"addr":"10.0.0.1","dns_id":70000,"ts_ns":1}"#).is_err());
   assert!(parse_line(r#"{"kind":"query","ip_version":4,"addr":"10.0.0.1","dns_id":1}"#).is_err());
   assert!(parse_line("not json").is_err());
}
