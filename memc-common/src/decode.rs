//! # Response Decoders
//!
//! Purpose: Turn buffered response bytes into a typed [`Reply`] or a
//! structured [`McError`], one decoder per command family.
//!
//! ## Contract
//!
//! Every decoder receives the first line of the head response (already split
//! off by the frame reader) plus the whole receive buffer, with that response
//! starting at offset 0. It either reports how many bytes the full response
//! occupies, or [`Decoded::Incomplete`]. Incomplete decodes must leave no trace:
//! the read loop calls the decoder again from the same start once more bytes
//! arrive.
//!
//! ```text
//! buffer: [ VALUE a 0 1\r\n a \r\n END\r\n | next response ... ]
//!           ^ line                    ^ consumed
//! ```

use std::fmt;

use bytes::Bytes;

use crate::adapter::Adapter;
use crate::error::{ErrorKind, McError, McResult};
use crate::frame::{read_line, Line};
use crate::protocol::{
    StatsCategory, CLIENT_ERROR, CRLF, END, ITEMS_PREFIX, STAT_PREFIX, VALUE_TOKEN,
    VERSION_PREFIX,
};
use crate::types::{Entry, Item, Reply, SizeStats, Stats, StatsReport, Values};

/// Outcome of one decode attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// Not enough bytes buffered; nothing was consumed.
    Incomplete,
    /// The full response was decoded.
    Complete {
        consumed: usize,
        outcome: McResult<Reply>,
    },
    /// The bytes cannot belong to a valid response; the stream is out of sync.
    Malformed(String),
}

impl Decoded {
    fn done(consumed: usize, outcome: McResult<Reply>) -> Self {
        Decoded::Complete { consumed, outcome }
    }
}

/// Decoder attached to a pending request, chosen by the command family.
#[derive(Clone)]
pub enum Decoder {
    /// set/add/replace/append/prepend/cas/delete.
    Status,
    /// incr/decr.
    Numeric,
    Version,
    /// get/gets, with the adapter active when the command was issued.
    Retrieval(Adapter),
    Stats(StatsCategory),
}

impl fmt::Debug for Decoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decoder::Status => f.write_str("Status"),
            Decoder::Numeric => f.write_str("Numeric"),
            Decoder::Version => f.write_str("Version"),
            Decoder::Retrieval(_) => f.write_str("Retrieval"),
            Decoder::Stats(category) => f.debug_tuple("Stats").field(category).finish(),
        }
    }
}

impl Decoder {
    /// Decodes the head response whose first line is `line`.
    pub fn decode(&self, line: &Line, buf: &[u8]) -> Decoded {
        match self {
            Decoder::Status => decode_status(line),
            Decoder::Numeric => decode_numeric(line),
            Decoder::Version => decode_version(line),
            Decoder::Retrieval(adapter) => decode_retrieval(line, buf, adapter),
            Decoder::Stats(category) => decode_stats(buf, category),
        }
    }
}

/// Single status line of the storage and delete commands.
pub fn decode_status(line: &Line) -> Decoded {
    if let Some(kind) = ErrorKind::from_status(&line.text) {
        return Decoded::done(line.next, Err(McError::bare(kind)));
    }
    if let Some(description) = client_error(&line.text) {
        return Decoded::done(line.next, Err(McError::client(description)));
    }
    Decoded::done(line.next, Ok(Reply::Status(line.text.clone())))
}

/// Single decimal line of incr/decr.
pub fn decode_numeric(line: &Line) -> Decoded {
    if line.text == "NOT_FOUND" {
        return Decoded::done(line.next, Err(McError::not_found()));
    }
    if let Some(description) = client_error(&line.text) {
        return Decoded::done(line.next, Err(McError::client(description)));
    }
    let outcome = line
        .text
        .trim()
        .parse::<i64>()
        .map(Reply::Numeric)
        .map_err(|_| McError::new(ErrorKind::Error, format!("invalid numeric reply {:?}", line.text)));
    Decoded::done(line.next, outcome)
}

/// `VERSION <string>` line.
pub fn decode_version(line: &Line) -> Decoded {
    let version = line
        .text
        .strip_prefix(VERSION_PREFIX)
        .unwrap_or(&line.text)
        .to_string();
    Decoded::done(line.next, Ok(Reply::Version(version)))
}

/// Zero or more `VALUE` blocks closed by `END`.
///
/// **Logic**:
/// 1. For each `VALUE` header, check that the declared payload and its
///    terminator are buffered; bail out with `Incomplete` otherwise.
/// 2. Adapt the payload and record it under its key.
/// 3. On `END`, report `NOT_FOUND` when no item was seen.
///
/// Items are accumulated in a local map, so an `Incomplete` result discards
/// everything and the next attempt starts over.
pub fn decode_retrieval(line: &Line, buf: &[u8], adapter: &Adapter) -> Decoded {
    let mut values = Values::new();
    let mut line = line.clone();

    while line.text != END {
        let header = match ValueHeader::parse(&line.text) {
            Ok(header) => header,
            Err(reason) => return Decoded::Malformed(reason),
        };

        // The length comes from the server; it must not overflow the offsets.
        let Some((value_end, block_end)) = line
            .next
            .checked_add(header.size)
            .and_then(|end| Some((end, end.checked_add(CRLF.len())?)))
        else {
            return Decoded::Malformed(format!(
                "value length {} for {:?} out of range",
                header.size, header.key
            ));
        };
        if block_end > buf.len() {
            return Decoded::Incomplete;
        }
        if &buf[value_end..block_end] != CRLF {
            return Decoded::Malformed(format!(
                "value for {:?} not followed by CRLF",
                header.key
            ));
        }

        let item = Item {
            flags: header.flags,
            size: header.size,
            data: Bytes::copy_from_slice(&buf[line.next..value_end]),
        };
        values.insert(
            header.key,
            Entry {
                value: adapter(item),
                cas: header.cas,
            },
        );

        line = match read_line(buf, block_end) {
            Some(next) => next,
            None => return Decoded::Incomplete,
        };
    }

    if values.is_empty() {
        Decoded::done(line.next, Err(McError::not_found()))
    } else {
        Decoded::done(line.next, Ok(Reply::Values(values)))
    }
}

/// `STAT` lines closed by `END`.
///
/// Unlike retrievals, nothing is parsed until the terminal `END` line is
/// buffered.
pub fn decode_stats(buf: &[u8], category: &StatsCategory) -> Decoded {
    let Some((lines, consumed)) = stats_block(buf) else {
        return Decoded::Incomplete;
    };

    let stats = match category {
        StatsCategory::Sizes => Stats::Sizes(
            lines
                .iter()
                .find_map(|text| stat_pair(text))
                .map(|(bytes, items)| SizeStats {
                    bytes: bytes.to_string(),
                    items: items.to_string(),
                }),
        ),
        StatsCategory::Items => Stats::Report(group_stats(&lines, |key| {
            key.strip_prefix(ITEMS_PREFIX).and_then(slab_field)
        })),
        StatsCategory::Slabs => Stats::Report(group_stats(&lines, slab_field)),
        StatsCategory::General | StatsCategory::Other(_) => {
            Stats::Report(group_stats(&lines, |_| None))
        }
    };
    Decoded::done(consumed, Ok(Reply::Stats(stats)))
}

fn client_error(text: &str) -> Option<&str> {
    text.strip_prefix(CLIENT_ERROR).map(str::trim_start)
}

/// Parsed `VALUE <key> <flags> <bytes> [<cas>]` header.
struct ValueHeader {
    key: String,
    flags: u32,
    size: usize,
    cas: Option<u64>,
}

impl ValueHeader {
    fn parse(text: &str) -> Result<Self, String> {
        let malformed = || format!("malformed value header {:?}", text);
        let mut parts = text.split(' ');
        if parts.next() != Some(VALUE_TOKEN) {
            return Err(malformed());
        }
        let key = parts.next().filter(|key| !key.is_empty()).ok_or_else(malformed)?;
        let flags = parts
            .next()
            .and_then(|flags| flags.parse().ok())
            .ok_or_else(malformed)?;
        let size = parts
            .next()
            .and_then(|size| size.parse().ok())
            .ok_or_else(malformed)?;
        let cas = match parts.next() {
            Some(token) => Some(token.parse().map_err(|_| malformed())?),
            None => None,
        };
        Ok(ValueHeader {
            key: key.to_string(),
            flags,
            size,
            cas,
        })
    }
}

/// Collects the lines before `END` and the offset just past it.
fn stats_block(buf: &[u8]) -> Option<(Vec<String>, usize)> {
    let mut lines = Vec::new();
    let mut offset = 0;
    loop {
        let line = read_line(buf, offset)?;
        if line.text == END {
            return Some((lines, line.next));
        }
        offset = line.next;
        lines.push(line.text);
    }
}

fn stat_pair(text: &str) -> Option<(&str, &str)> {
    let rest = text.strip_prefix(STAT_PREFIX)?;
    Some(rest.split_once(' ').unwrap_or((rest, "")))
}

/// Splits `<slab>:<field>` when the slab part is numeric.
fn slab_field(key: &str) -> Option<(u32, &str)> {
    let (slab, field) = key.split_once(':')?;
    Some((slab.parse().ok()?, field))
}

fn group_stats<F>(lines: &[String], slab_of: F) -> StatsReport
where
    F: Fn(&str) -> Option<(u32, &str)>,
{
    let mut report = StatsReport::default();
    for (key, value) in lines.iter().filter_map(|text| stat_pair(text)) {
        match slab_of(key) {
            Some((slab, field)) => {
                report
                    .slabs
                    .entry(slab)
                    .or_default()
                    .insert(field.to_string(), value.to_string());
            }
            None => {
                report.general.insert(key.to_string(), value.to_string());
            }
        }
    }
    report
}
