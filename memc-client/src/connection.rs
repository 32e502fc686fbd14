//! # Server Connection
//!
//! Purpose: Own one socket to one server and drive its request pipeline.
//!
//! Each [`Connection`] is a handle to a worker task. The worker exclusively
//! owns the socket, the receive buffer and the pending queue; callers only
//! talk to it through a channel, so writes are serialized in the same order
//! their requests enter the queue.
//!
//! ## Lifecycle
//!
//! ```text
//!              open()                connect ok
//! disconnected ───────► connecting ─────────────► open
//!      ▲                    │ connect failed        │ read error / EOF /
//!      │                    ▼                       │ write error / violation
//!      └──── backoff ── schedule retry ◄────────────┘  (fail queue)
//!
//! close(): any state ──► stopped (queue failed, no further reconnects)
//! ```
//!
//! ## Reads During Writes
//!
//! The socket is split into halves. A command being written is polled in the
//! same `select!` as the read half, so replies to earlier commands keep
//! draining while a large value block is still going out. A command joins the
//! pending queue once its last byte is written; commands arriving meanwhile
//! wait in an outgoing queue, in order.

use std::collections::VecDeque;
use std::future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Buf, Bytes};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace, warn};

use memc_common::protocol::encode_request;
use memc_common::{Decoder, McError, McResult};

use crate::backoff::Backoff;
use crate::config::ReconnectConfig;
use crate::pipeline::{Callback, PendingRequest, Pipeline, ProtocolViolation};

const NO_CONNECTION: &str = "no connection available";
const CLOSED: &str = "connection closed";

enum Message {
    Open(oneshot::Sender<McResult<()>>),
    Request { bytes: Bytes, pending: PendingRequest },
    Close,
}

/// Handle to the worker task serving one server.
pub struct Connection {
    addr: String,
    tx: mpsc::UnboundedSender<Message>,
    attempts: Arc<AtomicU64>,
}

impl Connection {
    /// Spawns a disconnected worker for `addr`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(addr: String, reconnect: &ReconnectConfig, nodelay: bool) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let attempts = Arc::new(AtomicU64::new(0));
        let worker = Worker {
            addr: addr.clone(),
            rx,
            stream: None,
            outgoing: VecDeque::new(),
            pipeline: Pipeline::new(),
            backoff: Backoff::from_config(reconnect),
            retry: true,
            retry_at: None,
            waiters: Vec::new(),
            nodelay,
            attempts: Arc::clone(&attempts),
        };
        tokio::spawn(worker.run());
        Connection { addr, tx, attempts }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Asks the worker to connect; the receiver resolves once the attempt ends.
    ///
    /// Already open connections answer `Ok` immediately. A closed connection
    /// answers with a connection error and never reconnects.
    pub fn open(&self) -> oneshot::Receiver<McResult<()>> {
        let (ready, done) = oneshot::channel();
        if let Err(mpsc::error::SendError(Message::Open(ready))) = self.tx.send(Message::Open(ready)) {
            let _ = ready.send(Err(McError::connection(CLOSED)));
        }
        done
    }

    /// Writes `command` (and the optional data block) and queues `callback`
    /// for its response.
    ///
    /// Without a live socket the callback fails immediately with
    /// `CONNECTION_ERROR`; the request is not retried.
    pub fn write(&self, decoder: Decoder, callback: Callback, command: &str, value: Option<&[u8]>) {
        let message = Message::Request {
            bytes: encode_request(command, value),
            pending: PendingRequest::new(decoder, callback),
        };
        if let Err(mpsc::error::SendError(Message::Request { pending, .. })) = self.tx.send(message) {
            pending.complete(Err(McError::connection(NO_CONNECTION)));
        }
    }

    /// Stops the worker: fails everything pending and disables reconnects.
    pub fn close(&self) {
        let _ = self.tx.send(Message::Close);
    }

    /// True once the worker has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Connect attempts made so far, initial and retries alike.
    pub fn connect_attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }
}

struct Stream {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
}

/// A command accepted for writing; `bytes` shrinks as it goes out.
struct Outgoing {
    bytes: Bytes,
    pending: PendingRequest,
}

enum OpenEvent {
    Message(Option<Message>),
    Read(io::Result<usize>),
    Written(io::Result<usize>),
}

enum IdleEvent {
    Message(Option<Message>),
    RetryDue,
}

struct Worker {
    addr: String,
    rx: mpsc::UnboundedReceiver<Message>,
    stream: Option<Stream>,
    outgoing: VecDeque<Outgoing>,
    pipeline: Pipeline,
    backoff: Backoff,
    retry: bool,
    retry_at: Option<Instant>,
    waiters: Vec<oneshot::Sender<McResult<()>>>,
    nodelay: bool,
    attempts: Arc<AtomicU64>,
}

impl Worker {
    async fn run(mut self) {
        loop {
            let running = if self.stream.is_some() {
                self.step_open().await
            } else {
                self.step_idle().await
            };
            if !running {
                break;
            }
        }
        debug!(addr = %self.addr, "connection worker stopped");
    }

    /// Handles one event while connected. Returns false once stopped.
    async fn step_open(&mut self) -> bool {
        let Some(stream) = self.stream.as_mut() else {
            return true;
        };
        let event = tokio::select! {
            message = self.rx.recv() => OpenEvent::Message(message),
            read = stream.reader.read_buf(self.pipeline.buffer_mut()) => OpenEvent::Read(read),
            written = write_front(&mut stream.writer, &mut self.outgoing) => OpenEvent::Written(written),
        };

        match event {
            OpenEvent::Message(Some(Message::Request { bytes, pending })) => {
                self.outgoing.push_back(Outgoing { bytes, pending });
            }
            OpenEvent::Message(Some(Message::Open(ready))) => {
                let _ = ready.send(Ok(()));
            }
            OpenEvent::Message(Some(Message::Close)) | OpenEvent::Message(None) => {
                self.shutdown().await;
                return false;
            }
            OpenEvent::Read(Ok(0)) => self.connection_lost("closed by server"),
            OpenEvent::Read(Ok(read)) => {
                trace!(addr = %self.addr, read, "bytes received");
                self.drain();
            }
            OpenEvent::Read(Err(err)) => self.connection_lost(&err.to_string()),
            OpenEvent::Written(Ok(0)) => self.connection_lost("write returned zero bytes"),
            OpenEvent::Written(Ok(_)) => self.finish_write(),
            // A partial write leaves the stream unusable.
            OpenEvent::Written(Err(err)) => self.connection_lost(&format!("write failed: {}", err)),
        }
        true
    }

    /// Handles one event while disconnected. Returns false once stopped.
    async fn step_idle(&mut self) -> bool {
        let event = match self.retry_at {
            Some(at) => tokio::select! {
                message = self.rx.recv() => IdleEvent::Message(message),
                _ = sleep_until(at) => IdleEvent::RetryDue,
            },
            None => IdleEvent::Message(self.rx.recv().await),
        };

        match event {
            IdleEvent::RetryDue => {
                self.retry_at = None;
                self.connect().await
            }
            IdleEvent::Message(Some(Message::Open(ready))) => {
                self.waiters.push(ready);
                self.retry_at = None;
                self.connect().await
            }
            IdleEvent::Message(Some(Message::Request { pending, .. })) => {
                pending.complete(Err(McError::connection(NO_CONNECTION)));
                true
            }
            IdleEvent::Message(Some(Message::Close)) | IdleEvent::Message(None) => {
                self.shutdown().await;
                false
            }
        }
    }

    /// One connect attempt. Requests arriving meanwhile fail immediately;
    /// `Close` aborts the attempt. Returns false once stopped.
    async fn connect(&mut self) -> bool {
        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(addr = %self.addr, attempt, "connecting");
        let connecting = TcpStream::connect(self.addr.clone());
        tokio::pin!(connecting);

        let result = loop {
            tokio::select! {
                result = &mut connecting => break result,
                message = self.rx.recv() => match message {
                    Some(Message::Open(ready)) => self.waiters.push(ready),
                    Some(Message::Request { pending, .. }) => {
                        pending.complete(Err(McError::connection(NO_CONNECTION)));
                    }
                    Some(Message::Close) | None => {
                        self.shutdown().await;
                        return false;
                    }
                },
            }
        };

        match result {
            Ok(socket) => {
                if self.nodelay {
                    if let Err(err) = socket.set_nodelay(true) {
                        warn!(addr = %self.addr, error = %err, "failed to set TCP_NODELAY");
                    }
                }
                info!(addr = %self.addr, "connected");
                let (reader, writer) = socket.into_split();
                self.stream = Some(Stream { reader, writer });
                self.backoff.reset();
                self.notify_waiters(Ok(()));
            }
            Err(err) => {
                warn!(addr = %self.addr, error = %err, "connect failed");
                self.notify_waiters(Err(McError::connection(format!("connect failed: {}", err))));
                self.schedule_reconnect();
            }
        }
        true
    }

    /// Moves the front command into the pending queue once fully written.
    fn finish_write(&mut self) {
        let done = self
            .outgoing
            .front()
            .map_or(false, |front| !front.bytes.has_remaining());
        if !done {
            return;
        }
        if let Some(Outgoing { pending, .. }) = self.outgoing.pop_front() {
            self.pipeline.push(pending);
            debug!(addr = %self.addr, pending = self.pipeline.pending(), "command written");
        }
        self.drain();
    }

    /// Completes whatever the buffered bytes answer.
    fn drain(&mut self) {
        match self.pipeline.process() {
            Ok(_) => {}
            // Early reply to a command whose write has not finished yet.
            Err(ProtocolViolation::Unsolicited(_)) if !self.outgoing.is_empty() => {}
            Err(violation) => {
                warn!(addr = %self.addr, %violation, "protocol violation, restarting connection");
                self.connection_lost(&violation.to_string());
            }
        }
    }

    /// The single teardown path for socket errors, EOF and protocol
    /// violations: detach, fail the queue, then maybe schedule a retry.
    fn connection_lost(&mut self, reason: &str) {
        self.stream = None;
        let failed = self.fail_pending(&McError::connection(format!("connection lost: {}", reason)));
        warn!(addr = %self.addr, failed, reason, "connection lost");
        self.schedule_reconnect();
    }

    /// Fails written requests first, then the ones still waiting to go out.
    fn fail_pending(&mut self, err: &McError) -> usize {
        let mut failed = self.pipeline.fail_all(err);
        for outgoing in self.outgoing.drain(..) {
            outgoing.pending.complete(Err(err.clone()));
            failed += 1;
        }
        failed
    }

    fn schedule_reconnect(&mut self) {
        if !self.retry {
            return;
        }
        let delay = self.backoff.next_delay();
        debug!(addr = %self.addr, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
        self.retry_at = Some(Instant::now() + delay);
    }

    async fn shutdown(&mut self) {
        self.retry = false;
        self.retry_at = None;
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.writer.shutdown().await;
        }
        let failed = self.fail_pending(&McError::connection(CLOSED));
        self.notify_waiters(Err(McError::connection(CLOSED)));
        self.rx.close();
        info!(addr = %self.addr, failed, "connection closed");
    }

    fn notify_waiters(&mut self, outcome: McResult<()>) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(outcome.clone());
        }
    }
}

/// Writes part of the front outgoing command. Pends forever when there is
/// nothing to write, leaving the other `select!` branches in charge.
async fn write_front(writer: &mut OwnedWriteHalf, outgoing: &mut VecDeque<Outgoing>) -> io::Result<usize> {
    match outgoing.front_mut() {
        Some(front) => writer.write_buf(&mut front.bytes).await,
        None => future::pending().await,
    }
}
