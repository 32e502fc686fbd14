//! # Response Types
//!
//! Typed results produced by the response decoders.
//!
//! ```text
//! Reply
//!   ├── Status(String)        set/add/replace/append/prepend/cas/delete
//!   ├── Numeric(i64)          incr/decr
//!   ├── Version(String)       version
//!   ├── Values(Values)        get/gets: key -> Entry { value, cas }
//!   └── Stats(Stats)          stats [items|slabs|sizes]
//! ```

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;

use crate::error::{ErrorKind, McError, McResult};

/// Raw item decoded from a `VALUE` block, before adaptation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    /// Opaque flags stored alongside the item.
    pub flags: u32,
    /// Declared payload length in bytes.
    pub size: usize,
    /// Payload bytes.
    pub data: Bytes,
}

/// Application value produced by an adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Raw(Item),
    Text(String),
    Binary(Bytes),
    Json(serde_json::Value),
}

/// One retrieved key: the adapted value plus its CAS token (`gets` only).
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub value: Value,
    pub cas: Option<u64>,
}

/// Key -> entry mapping returned by retrievals.
pub type Values = HashMap<String, Entry>;

/// Flat statistics plus per-slab groups.
///
/// `STAT <key> <value>` lines land in `general`. Slab-scoped keys such as
/// `STAT 1:chunk_size 96` or `STAT items:1:number 5` land in `slabs[1]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsReport {
    pub general: BTreeMap<String, String>,
    pub slabs: BTreeMap<u32, BTreeMap<String, String>>,
}

/// First line of `stats sizes`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeStats {
    pub bytes: String,
    pub items: String,
}

/// Decoded result of one `stats` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stats {
    Report(StatsReport),
    /// `None` when the server sent no size line before `END`.
    Sizes(Option<SizeStats>),
}

/// Successful outcome of one request.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Status(String),
    Numeric(i64),
    Version(String),
    Values(Values),
    Stats(Stats),
}

impl Reply {
    pub fn into_status(self) -> McResult<String> {
        match self {
            Reply::Status(status) => Ok(status),
            other => Err(unexpected(&other)),
        }
    }

    pub fn into_numeric(self) -> McResult<i64> {
        match self {
            Reply::Numeric(value) => Ok(value),
            other => Err(unexpected(&other)),
        }
    }

    pub fn into_version(self) -> McResult<String> {
        match self {
            Reply::Version(version) => Ok(version),
            other => Err(unexpected(&other)),
        }
    }

    pub fn into_values(self) -> McResult<Values> {
        match self {
            Reply::Values(values) => Ok(values),
            other => Err(unexpected(&other)),
        }
    }

    pub fn into_stats(self) -> McResult<Stats> {
        match self {
            Reply::Stats(stats) => Ok(stats),
            other => Err(unexpected(&other)),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Reply::Status(_) => "status",
            Reply::Numeric(_) => "numeric",
            Reply::Version(_) => "version",
            Reply::Values(_) => "values",
            Reply::Stats(_) => "stats",
        }
    }
}

fn unexpected(reply: &Reply) -> McError {
    McError::new(
        ErrorKind::Error,
        format!("unexpected {} reply", reply.name()),
    )
}
