//! # Request Pipeline
//!
//! Purpose: Correlate responses with requests on one connection.
//!
//! The text protocol carries no request identifiers, so the only valid
//! correlation is order: the queue holds pending requests in the order their
//! commands were written, and the head of the queue always owns the bytes at
//! the front of the receive buffer.
//!
//! ```text
//! socket ──read──► buffer: [ resp#1 | resp#2 | partial resp#3 ]
//!                             │        │        │
//! queue (FIFO):            [ req#1  , req#2  , req#3 , req#4 ]
//! ```
//!
//! The pipeline owns no socket. The connection worker appends received bytes
//! and calls [`Pipeline::process`]; a [`ProtocolViolation`] means the stream is
//! out of sync and the worker must restart the connection.

use std::collections::VecDeque;

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tracing::{debug, trace};

use memc_common::protocol::line_error;
use memc_common::{read_line, Decoded, Decoder, McError, McResult, Reply};

/// Completion callback of a pending request; called exactly once.
pub type Callback = Box<dyn FnOnce(McResult<Reply>) + Send + 'static>;

/// Initial receive buffer capacity.
const BUFFER_CAPACITY: usize = 8 * 1024;

/// A command written to the socket and still waiting for its response.
///
/// Dropping a request that was never completed fails its callback with a
/// connection error, so the callback fires exactly once on every path.
pub struct PendingRequest {
    decoder: Decoder,
    callback: Option<Callback>,
}

impl PendingRequest {
    pub fn new(decoder: Decoder, callback: Callback) -> Self {
        PendingRequest {
            decoder,
            callback: Some(callback),
        }
    }

    /// Completes the request, consuming it.
    pub fn complete(mut self, outcome: McResult<Reply>) {
        if let Some(callback) = self.callback.take() {
            callback(outcome);
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback(Err(McError::connection("request dropped before completion")));
        }
    }
}

/// Faults that leave the byte stream unattributable to any request.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("{0} unsolicited bytes with no pending request")]
    Unsolicited(usize),
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Receive buffer plus FIFO of pending requests for one connection.
pub struct Pipeline {
    buffer: BytesMut,
    queue: VecDeque<PendingRequest>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Pipeline::new()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Pipeline {
            buffer: BytesMut::with_capacity(BUFFER_CAPACITY),
            queue: VecDeque::new(),
        }
    }

    /// Buffer the socket reads into.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Appends received bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Queues a request whose command has been written.
    pub fn push(&mut self, request: PendingRequest) {
        self.queue.push_back(request);
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Decodes and completes as many head requests as the buffer allows.
    ///
    /// **Output**: number of requests completed, or the violation that makes
    /// the remaining bytes unusable.
    ///
    /// **Logic**:
    /// 1. Bytes with an empty queue are unsolicited: fail.
    /// 2. Wait for a complete first line.
    /// 3. `ERROR`/`SERVER_ERROR` lines fail the head request directly.
    /// 4. Otherwise run the head decoder; on `Incomplete` stop without
    ///    consuming anything, on success trim the buffer and complete.
    pub fn process(&mut self) -> Result<usize, ProtocolViolation> {
        let mut completed = 0;
        while !self.buffer.is_empty() {
            let Some(head) = self.queue.front() else {
                return Err(ProtocolViolation::Unsolicited(self.buffer.len()));
            };
            let Some(line) = read_line(&self.buffer, 0) else {
                trace!(buffered = self.buffer.len(), "waiting for complete line");
                break;
            };

            let (consumed, outcome) = match line_error(&line.text) {
                Some(err) => (line.next, Err(err)),
                None => match head.decoder.decode(&line, &self.buffer) {
                    Decoded::Incomplete => {
                        trace!(buffered = self.buffer.len(), "waiting for rest of response");
                        break;
                    }
                    Decoded::Complete { consumed, outcome } => (consumed, outcome),
                    Decoded::Malformed(reason) => return Err(ProtocolViolation::Malformed(reason)),
                },
            };

            self.buffer.advance(consumed);
            if let Some(request) = self.queue.pop_front() {
                debug!(consumed, ok = outcome.is_ok(), "response decoded");
                request.complete(outcome);
                completed += 1;
            }
        }
        Ok(completed)
    }

    /// Fails every pending request with `err`, oldest first, and drops any
    /// buffered bytes.
    pub fn fail_all(&mut self, err: &McError) -> usize {
        self.buffer.clear();
        let mut failed = 0;
        while let Some(request) = self.queue.pop_front() {
            request.complete(Err(err.clone()));
            failed += 1;
        }
        failed
    }
}
