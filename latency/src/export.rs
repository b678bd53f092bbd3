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

//! JSON export of pending queries and the histogram.
//!
//! Both shapes follow a `bpftool map dump` listing: each entry carries raw `key`/`value` cells
//! as hex text plus a `formatted` object. Pending-query cells are the bytes of the packed map
//! key and of the little-endian timestamp. Histogram cells hold the whole bucket index and the
//! whole count, since readers parse only the first cell.

use crate::correlation::PendingQuery;
use crate::error::{Error, Result};
use crate::flow_key::{FlowKey, IpVersion};
use crate::histogram::HistogramBucket;
use crate::rtt::BUCKET_COUNT;
use serde::{Deserialize, Serialize};
use std::io::Write;

/// Key fields of a pending query, as the map's BTF would format them.
///
/// The address field of the key's own version is required when decoding. The other one may be
/// left out and reads as zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormattedKey {
    pub ip_version: u8,
    #[serde(default)]
    pub pad: u8,
    pub dns_id: u16,
    #[serde(default)]
    pub src_ip4: Option<u32>,
    #[serde(default)]
    pub src_ip6: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormattedPending {
    pub key: FormattedKey,
    /// Query timestamp, monotonic nanoseconds
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRecord {
    #[serde(default)]
    pub key: Vec<String>,
    #[serde(default)]
    pub value: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formatted: Option<FormattedPending>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormattedBucket {
    pub key: u32,
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistogramRecord {
    #[serde(default)]
    pub key: Vec<String>,
    #[serde(default)]
    pub value: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formatted: Option<FormattedBucket>,
}

impl From<&PendingQuery> for PendingRecord {
    fn from(query: &PendingQuery) -> Self {
        let key = &query.key;
        Self {
            key: key.to_map_key_bytes().iter().map(|b| format!("{:#04x}", b)).collect(),
            value: query.query_ts_ns.to_le_bytes().iter().map(|b| format!("{:#04x}", b)).collect(),
            formatted: Some(FormattedPending {
                key: FormattedKey {
                    ip_version: key.ip_version().as_u8(),
                    pad: 0,
                    dns_id: key.dns_id(),
                    src_ip4: Some(key.src_ip4()),
                    src_ip6: Some(key.src_ip6().to_vec()),
                },
                value: query.query_ts_ns,
            }),
        }
    }
}

impl TryFrom<&PendingRecord> for PendingQuery {
    type Error = Error;

    fn try_from(record: &PendingRecord) -> Result<Self> {
        if let Some(formatted) = &record.formatted {
            let key = &formatted.key;
            let missing = match IpVersion::from_u8(key.ip_version)? {
                IpVersion::V4 => key.src_ip4.is_none().then_some("src_ip4"),
                IpVersion::V6 => key.src_ip6.is_none().then_some("src_ip6"),
            };
            if let Some(field) = missing {
                return Err(Error::InvalidKey(format!("ip_version {} key has no {}", key.ip_version, field)));
            }

            let src_ip6 = match key.src_ip6.as_deref() {
                None => [0u8; 16],
                Some(bytes) => <[u8; 16]>::try_from(bytes)
                    .map_err(|_| Error::InvalidKey(format!("src_ip6 must be 16 bytes, got {}", bytes.len())))?,
            };

            let mut raw = [0u8; FlowKey::MAP_KEY_LEN];
            raw[0] = key.ip_version;
            raw[1] = key.pad;
            raw[2..4].copy_from_slice(&key.dns_id.to_le_bytes());
            raw[4..8].copy_from_slice(&key.src_ip4.unwrap_or(0).to_le_bytes());
            raw[8..24].copy_from_slice(&src_ip6);

            return Ok(PendingQuery { key: FlowKey::from_map_key_bytes(&raw)?, query_ts_ns: formatted.value });
        }

        let key_bytes = parse_byte_cells(&record.key, "key")?;
        let value_bytes = parse_byte_cells(&record.value, "value")?;
        if value_bytes.is_empty() || value_bytes.len() > 8 {
            return Err(Error::InvalidRecord(format!(
                "timestamp needs 1 to 8 value bytes, got {}",
                value_bytes.len()
            )));
        }
        let mut ts = [0u8; 8];
        ts[..value_bytes.len()].copy_from_slice(&value_bytes);

        Ok(PendingQuery { key: FlowKey::from_map_key_bytes(&key_bytes)?, query_ts_ns: u64::from_le_bytes(ts) })
    }
}

impl From<&HistogramBucket> for HistogramRecord {
    fn from(bucket: &HistogramBucket) -> Self {
        Self {
            key: vec![format!("{:#x}", bucket.index)],
            value: vec![format!("{:#x}", bucket.count)],
            formatted: Some(FormattedBucket { key: bucket.index, value: bucket.count }),
        }
    }
}

impl TryFrom<&HistogramRecord> for HistogramBucket {
    type Error = Error;

    fn try_from(record: &HistogramRecord) -> Result<Self> {
        let (index, count) = match &record.formatted {
            Some(formatted) => (u64::from(formatted.key), formatted.value),
            None => (cell_value(&record.key, "key")?, cell_value(&record.value, "value")?),
        };

        if index >= BUCKET_COUNT as u64 {
            return Err(Error::InvalidRecord(format!(
                "bucket index {} out of range, expected 0..{}",
                index, BUCKET_COUNT
            )));
        }
        Ok(HistogramBucket { index: index as u32, count })
    }
}

pub fn export_pending(queries: &[PendingQuery]) -> Vec<PendingRecord> {
    queries.iter().map(PendingRecord::from).collect()
}

pub fn export_histogram(buckets: &[HistogramBucket]) -> Vec<HistogramRecord> {
    buckets.iter().map(HistogramRecord::from).collect()
}

/// Write the pending-query view as a pretty printed JSON array
pub fn write_pending<W: Write>(writer: W, queries: &[PendingQuery]) -> Result<()> {
    serde_json::to_writer_pretty(writer, &export_pending(queries))?;
    Ok(())
}

/// Write the histogram view as a pretty printed JSON array
pub fn write_histogram<W: Write>(writer: W, buckets: &[HistogramBucket]) -> Result<()> {
    serde_json::to_writer_pretty(writer, &export_histogram(buckets))?;
    Ok(())
}

/// Decode a pending-query export. Every entry must decode, nothing is skipped.
pub fn decode_pending(json: &str) -> Result<Vec<PendingQuery>> {
    decode_entries::<PendingRecord>(json)?
        .iter()
        .enumerate()
        .map(|(i, record)| PendingQuery::try_from(record).map_err(|e| at_entry(i, e)))
        .collect()
}

/// Decode a histogram export into ascending buckets. A bucket index may appear only once.
pub fn decode_histogram(json: &str) -> Result<Vec<HistogramBucket>> {
    let mut buckets = decode_entries::<HistogramRecord>(json)?
        .iter()
        .enumerate()
        .map(|(i, record)| HistogramBucket::try_from(record).map_err(|e| at_entry(i, e)))
        .collect::<Result<Vec<_>>>()?;

    buckets.sort_unstable_by_key(|bucket| bucket.index);
    if let Some(pair) = buckets.windows(2).find(|pair| pair[0].index == pair[1].index) {
        return Err(Error::InvalidRecord(format!("bucket index {} appears more than once", pair[0].index)));
    }
    Ok(buckets)
}

fn decode_entries<T: serde::de::DeserializeOwned>(json: &str) -> Result<Vec<T>> {
    let entries: Vec<serde_json::Value> = serde_json::from_str(json)?;
    entries
        .into_iter()
        .enumerate()
        .map(|(i, entry)| serde_json::from_value(entry).map_err(|e| Error::InvalidRecord(format!("entry {}: {}", i, e))))
        .collect()
}

fn at_entry(index: usize, err: Error) -> Error {
    match err {
        Error::InvalidKey(msg) => Error::InvalidKey(format!("entry {}: {}", index, msg)),
        Error::InvalidRecord(msg) => Error::InvalidRecord(format!("entry {}: {}", index, msg)),
        other => other,
    }
}

/// A single cell holds the whole integer. Several cells are the little-endian bytes of it, as a
/// plain `bpftool map dump` prints them.
fn cell_value(cells: &[String], field: &str) -> Result<u64> {
    match cells {
        [] => Err(Error::InvalidRecord(format!("{} has no cells", field))),
        [cell] => parse_int_literal(cell)
            .ok_or_else(|| Error::InvalidRecord(format!("{} cell {:?} is not an integer", field, cell))),
        _ if cells.len() > 8 => {
            Err(Error::InvalidRecord(format!("{} has {} byte cells, at most 8 fit", field, cells.len())))
        }
        _ => {
            let mut bytes = [0u8; 8];
            bytes[..cells.len()].copy_from_slice(&parse_byte_cells(cells, field)?);
            Ok(u64::from_le_bytes(bytes))
        }
    }
}

fn parse_byte_cells(cells: &[String], field: &str) -> Result<Vec<u8>> {
    cells
        .iter()
        .map(|cell| {
            parse_int_literal(cell)
                .and_then(|v| u8::try_from(v).ok())
                .ok_or_else(|| Error::InvalidRecord(format!("{} cell {:?} is not a byte", field, cell)))
        })
        .collect()
}

/// Parse an unsigned integer literal: `0x`, `0o` and `0b` prefixes, or decimal without leading
/// zeros. Underscores between digits are allowed.
pub fn parse_int_literal(text: &str) -> Option<u64> {
    let text = text.trim();
    // from_str_radix would take a sign, a literal never carries one
    if text.contains(['+', '-']) {
        return None;
    }

    let (radix, digits) = match text.get(..2).map(str::to_ascii_lowercase).as_deref() {
        Some("0x") => (16, strip_separator(&text[2..])),
        Some("0o") => (8, strip_separator(&text[2..])),
        Some("0b") => (2, strip_separator(&text[2..])),
        _ => {
            if text.len() > 1 && text.starts_with('0') && text.bytes().any(|b| b != b'0' && b != b'_') {
                return None;
            }
            (10, text)
        }
    };

    if digits.is_empty() || digits.starts_with('_') || digits.ends_with('_') || digits.contains("__") {
        return None;
    }
    u64::from_str_radix(&digits.replace('_', ""), radix).ok()
}

// a prefix may be followed by one separator, as in 0x_ff
fn strip_separator(digits: &str) -> &str {
    digits.strip_prefix('_').unwrap_or(digits)
}
