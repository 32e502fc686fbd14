//! # Reconnect Backoff
//!
//! Exponential delay between reconnect attempts: starts at a floor, doubles
//! after every consecutive failure up to a ceiling, and returns to the floor
//! once a connect succeeds.

use std::time::Duration;

use crate::config::ReconnectConfig;

#[derive(Debug, Clone)]
pub struct Backoff {
    floor: Duration,
    ceiling: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        let ceiling = ceiling.max(floor);
        Backoff {
            floor,
            ceiling,
            current: floor,
        }
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Backoff::new(
            Duration::from_millis(config.floor_ms),
            Duration::from_millis(config.ceiling_ms),
        )
    }

    /// Returns the delay for the next attempt and doubles it for the one after.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.ceiling);
        delay
    }

    /// Back to the floor after a successful connect.
    pub fn reset(&mut self) {
        self.current = self.floor;
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}
