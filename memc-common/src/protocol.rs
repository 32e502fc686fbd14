//! # Text Protocol Definitions
//!
//! Purpose: Hold the memcache text protocol tokens and build the command
//! bytes written to the socket.
//!
//! ## Wire Shapes
//!
//! ```text
//! get <key>+\r\n                              -> (VALUE <key> <flags> <bytes> [<cas>]\r\n<data>\r\n)* END\r\n
//! <verb> <key> <flags> <exptime> <bytes> [<cas>]\r\n<data>\r\n
//!                                             -> STORED | NOT_STORED | EXISTS | NOT_FOUND
//! incr|decr <key> <delta>\r\n                 -> <number> | NOT_FOUND | CLIENT_ERROR <msg>
//! delete <key>\r\n                            -> DELETED | NOT_FOUND
//! version\r\n                                 -> VERSION <string>
//! stats [items|slabs|sizes]\r\n               -> (STAT <key> <value>\r\n)* END\r\n
//! ```
//!
//! Any malformed command yields a bare `ERROR\r\n`.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ErrorKind, McError};

/// Line terminator for every command and response line.
pub const CRLF: &[u8] = b"\r\n";

/// Terminal line of retrieval and stats responses.
pub const END: &str = "END";

pub const VALUE_TOKEN: &str = "VALUE";
pub const VERSION_PREFIX: &str = "VERSION ";
pub const STAT_PREFIX: &str = "STAT ";
pub const ITEMS_PREFIX: &str = "items:";

pub const ERROR: &str = "ERROR";
pub const CLIENT_ERROR: &str = "CLIENT_ERROR";
pub const SERVER_ERROR: &str = "SERVER_ERROR";

/// Longest key accepted by any command, in characters.
pub const MAX_KEY_LENGTH: usize = 250;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 11211;

/// Storage command verbs sharing the `<verb> <key> <flags> <exptime> <bytes>` shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreVerb {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    Cas,
}

impl StoreVerb {
    pub const fn as_str(self) -> &'static str {
        match self {
            StoreVerb::Set => "set",
            StoreVerb::Add => "add",
            StoreVerb::Replace => "replace",
            StoreVerb::Append => "append",
            StoreVerb::Prepend => "prepend",
            StoreVerb::Cas => "cas",
        }
    }
}

/// Header line of a storage command, without the data block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreCommand<'a> {
    pub verb: StoreVerb,
    pub key: &'a str,
    pub flags: u32,
    pub exptime: u64,
    /// Comparison token; when absent the line carries no trailing token.
    pub cas: Option<u64>,
}

impl StoreCommand<'_> {
    /// Renders the command line for a data block of `len` bytes.
    pub fn line(&self, len: usize) -> String {
        let mut line = format!(
            "{} {} {} {} {}",
            self.verb.as_str(),
            self.key,
            self.flags,
            self.exptime,
            len
        );
        if let Some(cas) = self.cas {
            line.push(' ');
            line.push_str(&cas.to_string());
        }
        line
    }
}

/// Encodes a command line, plus the optional data block, into wire bytes.
pub fn encode_request(line: &str, value: Option<&[u8]>) -> Bytes {
    let value_len = value.map_or(0, |data| data.len() + CRLF.len());
    let mut out = BytesMut::with_capacity(line.len() + CRLF.len() + value_len);
    out.put_slice(line.as_bytes());
    out.put_slice(CRLF);
    if let Some(data) = value {
        out.put_slice(data);
        out.put_slice(CRLF);
    }
    out.freeze()
}

/// Checks that `key` travels as exactly one command token.
///
/// Rejects empty keys, keys over [`MAX_KEY_LENGTH`] characters and keys
/// containing whitespace or control characters, which would split the
/// command into extra tokens or extra lines.
pub fn validate_key(key: &str) -> Result<(), McError> {
    if key.is_empty() {
        return Err(McError::client("empty key"));
    }
    if key.chars().count() > MAX_KEY_LENGTH {
        return Err(McError::client(format!(
            "key too long, max {} characters",
            MAX_KEY_LENGTH
        )));
    }
    if key.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(McError::client(format!(
            "key {:?} contains whitespace or control characters",
            key
        )));
    }
    Ok(())
}

/// Returns the request-level failure carried by a response line, if any.
///
/// `ERROR` and `SERVER_ERROR` can answer any command, so the read loop checks
/// for them before handing the line to the command's decoder.
pub fn line_error(line: &str) -> Option<McError> {
    if let Some(rest) = line.strip_prefix(SERVER_ERROR) {
        return Some(McError::new(ErrorKind::ServerError, rest.trim_start()));
    }
    if let Some(rest) = line.strip_prefix(ERROR) {
        return Some(McError::new(ErrorKind::Error, rest.trim_start()));
    }
    None
}

/// Statistics group selector for the `stats` command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StatsCategory {
    #[default]
    General,
    Items,
    Slabs,
    Sizes,
    /// Any other group; decoded like the general statistics.
    Other(String),
}

impl StatsCategory {
    /// Parses a selector, `""` meaning the general statistics.
    pub fn parse(name: &str) -> Self {
        match name {
            "" => StatsCategory::General,
            "items" => StatsCategory::Items,
            "slabs" => StatsCategory::Slabs,
            "sizes" => StatsCategory::Sizes,
            other => StatsCategory::Other(other.to_string()),
        }
    }

    /// Command line requesting this group.
    pub fn command(&self) -> String {
        match self {
            StatsCategory::General => "stats".to_string(),
            StatsCategory::Items => "stats items".to_string(),
            StatsCategory::Slabs => "stats slabs".to_string(),
            StatsCategory::Sizes => "stats sizes".to_string(),
            StatsCategory::Other(name) => format!("stats {}", name),
        }
    }
}
