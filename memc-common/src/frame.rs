//! # Frame Reader
//!
//! Purpose: Find the next CRLF-terminated line in a receive buffer.
//!
//! The reader never mutates the buffer. When no terminator is present yet it
//! returns `None` and the caller retries from the same offset once more bytes
//! have arrived.

use crate::protocol::CRLF;

/// One complete response line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    /// Line text without the terminator (lossy UTF-8).
    pub text: String,
    /// Offset immediately after the terminator.
    pub next: usize,
}

/// Reads the line starting at `start`.
///
/// **Input**: `buf` (full receive buffer), `start` (offset to scan from).
/// **Output**: `Some(Line)` when a terminator is found, `None` otherwise.
pub fn read_line(buf: &[u8], start: usize) -> Option<Line> {
    let tail = buf.get(start..)?;
    let pos = tail.windows(CRLF.len()).position(|window| window == CRLF)?;
    Some(Line {
        text: String::from_utf8_lossy(&tail[..pos]).into_owned(),
        next: start + pos + CRLF.len(),
    })
}
