//! # Memcache Cluster Client
//!
//! Purpose: Async client for the memcache text protocol, sharding keys over
//! one socket per configured server.
//!
//! ## Design Principles
//! 1. **Head-of-Line Decoding**: responses carry no request ids, so each
//!    connection completes requests strictly in write order.
//! 2. **Resumable Decoders**: partial reads never consume bytes; decoding
//!    restarts from the buffer front once more data arrives.
//! 3. **Exclusive Ownership**: a connection's socket, buffer and queue live
//!    in one worker task and are never shared.
//! 4. **Reconnect With Backoff**: lost connections fail their queue once and
//!    retry with exponential backoff until explicitly closed.
//!
//! ## Example
//!
//! ```no_run
//! use memc_client::{Client, ClientConfig, StoreOptions};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::new(ClientConfig::with_servers(["127.0.0.1:11211"]))?;
//! client.connect().await?;
//! client.set("greeting", "hello", StoreOptions::default()).await?;
//! let values = client.get("greeting").await?;
//! assert!(values.contains_key("greeting"));
//! client.close();
//! # Ok(())
//! # }
//! ```

mod backoff;
mod client;
mod config;
mod connection;
mod pipeline;
pub mod strategy;

pub use backoff::Backoff;
pub use client::{Client, StoreOptions};
pub use config::{server_address, ClientConfig, ConfigError, ReconnectConfig};
pub use connection::Connection;
pub use pipeline::{Callback, PendingRequest, Pipeline, ProtocolViolation};
pub use strategy::Strategy;

pub use memc_common::{
    adapter, Adapter, Decoded, Decoder, Entry, ErrorKind, Item, McError, McResult, Reply, SizeStats,
    Stats, StatsCategory, StatsReport, Value, Values,
};
