//! # Value Adapters
//!
//! An adapter turns a raw decoded [`Item`] into the value the application
//! wants back from `get`/`gets`. It is applied once per item while the
//! retrieval response is decoded, so it must be pure: a partially buffered
//! response is decoded again from the start when more bytes arrive.
//!
//! Built-in adapters cover the common cases; applications can pass any
//! closure with the same signature.

use std::sync::Arc;

use crate::types::{Item, Value};

/// Shared adapter handle.
pub type Adapter = Arc<dyn Fn(Item) -> Value + Send + Sync>;

/// Keeps the whole item: flags, size and payload.
pub fn raw() -> Adapter {
    Arc::new(Value::Raw)
}

/// Payload as (lossy) UTF-8 text.
pub fn string() -> Adapter {
    Arc::new(|item: Item| Value::Text(String::from_utf8_lossy(&item.data).into_owned()))
}

/// Payload bytes only.
pub fn binary() -> Adapter {
    Arc::new(|item: Item| Value::Binary(item.data))
}

/// Payload parsed as JSON; falls back to text when it is not valid JSON.
pub fn json() -> Adapter {
    Arc::new(|item: Item| match serde_json::from_slice(&item.data) {
        Ok(value) => Value::Json(value),
        Err(_) => Value::Text(String::from_utf8_lossy(&item.data).into_owned()),
    })
}
