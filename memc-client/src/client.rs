//! # Cluster Client API
//!
//! Purpose: Expose the memcache commands over a cluster of servers.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `Client` hides connections, sharding and decoding.
//! 2. **One Socket Per Server**: each configured server gets one
//!    [`Connection`]; keys are routed by the active [`Strategy`].
//! 3. **Pipelined Fan-Out**: multi-key and cluster-wide commands are written
//!    to every involved connection before any reply is awaited.
//! 4. **Uniform Errors**: misses and conflicts come back as [`McError`] kinds,
//!    the same channel as faults.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::oneshot;
use tracing::debug;

use memc_common::adapter::{self, Adapter};
use memc_common::protocol::{validate_key, StatsCategory, StoreCommand, StoreVerb};
use memc_common::{Decoder, McError, McResult, Reply, Stats, Values};

use crate::config::{ClientConfig, ConfigError};
use crate::connection::Connection;
use crate::strategy::{self, Strategy};

/// Per-call options of the storage commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreOptions {
    /// Expiry in seconds (or an absolute epoch time). When unset, the
    /// client's default time-to-live applies.
    pub exptime: Option<u32>,
    /// Opaque flags stored with the item.
    pub flags: u32,
    /// Comparison token; adds the trailing CAS field to the command line.
    pub cas: Option<u64>,
}

/// Memcache client over one or more servers.
pub struct Client {
    connections: Vec<Connection>,
    strategy: Strategy,
    adapter: Adapter,
    ttl: u32,
}

impl Client {
    /// Builds a client with one disconnected connection per configured server.
    ///
    /// Single-server clusters always use the solo strategy; larger ones start
    /// with the hash strategy. The default adapter is [`adapter::raw`].
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: ClientConfig) -> Result<Self, ConfigError> {
        let connections: Vec<Connection> = config
            .addresses()?
            .into_iter()
            .map(|addr| Connection::spawn(addr, &config.reconnect, config.nodelay))
            .collect();
        let strategy = if connections.len() == 1 {
            strategy::solo()
        } else {
            strategy::hash()
        };
        Ok(Client {
            connections,
            strategy,
            adapter: adapter::raw(),
            ttl: config.default_ttl,
        })
    }

    pub fn with_adapter(mut self, adapter: Adapter) -> Self {
        self.adapter = adapter;
        self
    }

    /// Replaces the sharding strategy. Ignored for single-server clusters.
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        if self.connections.len() > 1 {
            self.strategy = strategy;
        }
        self
    }

    /// Adapter applied to retrievals issued from now on.
    pub fn set_adapter(&mut self, adapter: Adapter) {
        self.adapter = adapter;
    }

    /// Default time-to-live in seconds for stores without an explicit
    /// `exptime`. 0 disables it.
    pub fn set_time_to_live(&mut self, seconds: u32) {
        self.ttl = seconds;
    }

    pub fn servers(&self) -> impl Iterator<Item = &str> {
        self.connections.iter().map(Connection::addr)
    }

    /// Opens every connection and waits until each finished its first
    /// attempt.
    ///
    /// Returns the first failure; failed connections keep retrying in the
    /// background with backoff.
    pub async fn connect(&self) -> McResult<()> {
        let attempts: Vec<_> = self.connections.iter().map(Connection::open).collect();
        let mut failure = None;
        for attempt in attempts {
            let result = attempt
                .await
                .unwrap_or_else(|_| Err(McError::connection("connection closed")));
            if let Err(err) = result {
                failure.get_or_insert(err);
            }
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Closes every connection. Pending requests fail and nothing reconnects.
    pub fn close(&self) {
        for connection in &self.connections {
            connection.close();
        }
    }

    pub async fn get(&self, key: &str) -> McResult<Values> {
        self.retrieve("get", key).await
    }

    /// Like [`Client::get`], with CAS tokens on every entry.
    pub async fn gets(&self, key: &str) -> McResult<Values> {
        self.retrieve("gets", key).await
    }

    /// Multi-key get; one pipelined command per involved server.
    pub async fn get_multi(&self, keys: &[&str]) -> McResult<Values> {
        self.retrieve_multi("get", keys).await
    }

    pub async fn gets_multi(&self, keys: &[&str]) -> McResult<Values> {
        self.retrieve_multi("gets", keys).await
    }

    pub async fn set(&self, key: &str, value: impl AsRef<[u8]>, options: StoreOptions) -> McResult<String> {
        self.store(StoreVerb::Set, key, value.as_ref(), options).await
    }

    pub async fn add(&self, key: &str, value: impl AsRef<[u8]>, options: StoreOptions) -> McResult<String> {
        self.store(StoreVerb::Add, key, value.as_ref(), options).await
    }

    pub async fn replace(&self, key: &str, value: impl AsRef<[u8]>, options: StoreOptions) -> McResult<String> {
        self.store(StoreVerb::Replace, key, value.as_ref(), options).await
    }

    pub async fn append(&self, key: &str, value: impl AsRef<[u8]>, options: StoreOptions) -> McResult<String> {
        self.store(StoreVerb::Append, key, value.as_ref(), options).await
    }

    pub async fn prepend(&self, key: &str, value: impl AsRef<[u8]>, options: StoreOptions) -> McResult<String> {
        self.store(StoreVerb::Prepend, key, value.as_ref(), options).await
    }

    /// Stores only if the item still carries `cas` (from a `gets`).
    pub async fn cas(
        &self,
        key: &str,
        value: impl AsRef<[u8]>,
        cas: u64,
        options: StoreOptions,
    ) -> McResult<String> {
        let options = StoreOptions {
            cas: Some(cas),
            ..options
        };
        self.store(StoreVerb::Cas, key, value.as_ref(), options).await
    }

    /// Increments a numeric item by `delta` and returns the new value.
    pub async fn incr(&self, key: &str, delta: u64) -> McResult<i64> {
        self.numeric("incr", key, delta).await
    }

    pub async fn decr(&self, key: &str, delta: u64) -> McResult<i64> {
        self.numeric("decr", key, delta).await
    }

    pub async fn del(&self, key: &str) -> McResult<String> {
        validate_key(key)?;
        let command = format!("delete {}", key);
        request(self.connection_for(key), Decoder::Status, &command, None)
            .await?
            .into_status()
    }

    /// Version of every server, in configuration order. Failures stay in
    /// the list as entries.
    pub async fn version(&self) -> Vec<McResult<String>> {
        self.broadcast(Decoder::Version, "version")
            .await
            .into_iter()
            .map(|reply| reply.and_then(Reply::into_version))
            .collect()
    }

    /// Statistics of every server, in configuration order.
    pub async fn stats(&self, category: StatsCategory) -> Vec<McResult<Stats>> {
        let command = category.command();
        self.broadcast(Decoder::Stats(category), &command)
            .await
            .into_iter()
            .map(|reply| reply.and_then(Reply::into_stats))
            .collect()
    }

    fn bucket(&self, key: &str) -> usize {
        let count = self.connections.len();
        (self.strategy)(key, count) % count
    }

    fn connection_for(&self, key: &str) -> &Connection {
        &self.connections[self.bucket(key)]
    }

    async fn retrieve(&self, verb: &str, key: &str) -> McResult<Values> {
        validate_key(key)?;
        let command = format!("{} {}", verb, key);
        let decoder = Decoder::Retrieval(self.adapter.clone());
        request(self.connection_for(key), decoder, &command, None)
            .await?
            .into_values()
    }

    /// Groups keys by bucket, writes one command per bucket, then merges
    /// once every bucket has answered.
    ///
    /// Buckets answering `NOT_FOUND` contribute nothing; any other failure
    /// fails the whole call. No hits at all is `NOT_FOUND`. One invalid key
    /// rejects the call before anything is written.
    async fn retrieve_multi(&self, verb: &str, keys: &[&str]) -> McResult<Values> {
        for key in keys {
            validate_key(key)?;
        }
        let mut buckets: BTreeMap<usize, Vec<&str>> = BTreeMap::new();
        for key in keys {
            buckets.entry(self.bucket(key)).or_default().push(*key);
        }
        debug!(keys = keys.len(), buckets = buckets.len(), verb, "multi-key retrieval");

        let replies: Vec<_> = buckets
            .into_iter()
            .map(|(index, keys)| {
                let command = format!("{} {}", verb, keys.join(" "));
                let decoder = Decoder::Retrieval(self.adapter.clone());
                dispatch(&self.connections[index], decoder, &command, None)
            })
            .collect();

        let mut merged = Values::new();
        let mut failure = None;
        for reply in replies {
            match settle(reply).await.and_then(Reply::into_values) {
                Ok(values) => merged.extend(values),
                Err(err) if err.is_not_found() => {}
                Err(err) => {
                    failure.get_or_insert(err);
                }
            }
        }

        match failure {
            Some(err) => Err(err),
            None if merged.is_empty() => Err(McError::not_found()),
            None => Ok(merged),
        }
    }

    async fn store(&self, verb: StoreVerb, key: &str, value: &[u8], options: StoreOptions) -> McResult<String> {
        validate_key(key)?;
        let command = StoreCommand {
            verb,
            key,
            flags: options.flags,
            exptime: self.exptime(options.exptime),
            cas: options.cas,
        };
        request(self.connection_for(key), Decoder::Status, &command.line(value.len()), Some(value))
            .await?
            .into_status()
    }

    async fn numeric(&self, verb: &str, key: &str, delta: u64) -> McResult<i64> {
        validate_key(key)?;
        let command = format!("{} {} {}", verb, key, delta);
        request(self.connection_for(key), Decoder::Numeric, &command, None)
            .await?
            .into_numeric()
    }

    async fn broadcast(&self, decoder: Decoder, command: &str) -> Vec<McResult<Reply>> {
        let replies: Vec<_> = self
            .connections
            .iter()
            .map(|connection| dispatch(connection, decoder.clone(), command, None))
            .collect();
        let mut results = Vec::with_capacity(replies.len());
        for reply in replies {
            results.push(settle(reply).await);
        }
        results
    }

    /// Explicit exptime wins; otherwise the default TTL becomes an absolute
    /// epoch time.
    fn exptime(&self, explicit: Option<u32>) -> u64 {
        match explicit {
            Some(exptime) => u64::from(exptime),
            None if self.ttl > 0 => epoch_seconds() + u64::from(self.ttl),
            None => 0,
        }
    }
}

/// Writes a command and returns the receiver its callback completes.
fn dispatch(
    connection: &Connection,
    decoder: Decoder,
    command: &str,
    value: Option<&[u8]>,
) -> oneshot::Receiver<McResult<Reply>> {
    let (tx, rx) = oneshot::channel();
    connection.write(
        decoder,
        Box::new(move |outcome| {
            let _ = tx.send(outcome);
        }),
        command,
        value,
    );
    rx
}

async fn settle(reply: oneshot::Receiver<McResult<Reply>>) -> McResult<Reply> {
    reply
        .await
        .unwrap_or_else(|_| Err(McError::connection("request abandoned")))
}

async fn request(
    connection: &Connection,
    decoder: Decoder,
    command: &str,
    value: Option<&[u8]>,
) -> McResult<Reply> {
    settle(dispatch(connection, decoder, command, value)).await
}

fn epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
