//! Transport tuning: timeouts, watermarks, and buffer bounds.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use wamp_core::{WampError, WampResult};

/// `[transport]` settings. Every field has a default, so partial TOML works.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// How long `connect()` may take before failing.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// How long an orderly disconnect waits for queued messages to flush.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Queued outbound messages at which the pause handler fires.
    #[serde(default = "default_high_watermark")]
    pub high_watermark: usize,

    /// Queued outbound messages at which the resume handler fires.
    #[serde(default = "default_low_watermark")]
    pub low_watermark: usize,

    /// Messages buffered while receipt is paused before reads stop.
    #[serde(default = "default_inbound_buffer")]
    pub inbound_buffer: usize,

    /// Frames read off the network ahead of the dispatcher.
    #[serde(default = "default_read_ahead")]
    pub read_ahead: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            high_watermark: default_high_watermark(),
            low_watermark: default_low_watermark(),
            inbound_buffer: default_inbound_buffer(),
            read_ahead: default_read_ahead(),
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_shutdown_timeout_ms() -> u64 {
    2_000
}

fn default_high_watermark() -> usize {
    256
}

fn default_low_watermark() -> usize {
    64
}

fn default_inbound_buffer() -> usize {
    1024
}

fn default_read_ahead() -> usize {
    16
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Reject settings the flow-control state machine cannot honour.
    pub fn validate(&self) -> WampResult<()> {
        if self.high_watermark == 0 {
            return Err(WampError::Config("high_watermark must be positive".into()));
        }
        if self.low_watermark >= self.high_watermark {
            return Err(WampError::Config(format!(
                "low_watermark ({}) must be below high_watermark ({})",
                self.low_watermark, self.high_watermark
            )));
        }
        if self.inbound_buffer == 0 {
            return Err(WampError::Config("inbound_buffer must be positive".into()));
        }
        if self.read_ahead == 0 {
            return Err(WampError::Config("read_ahead must be positive".into()));
        }
        if self.connect_timeout_ms == 0 {
            return Err(WampError::Config("connect_timeout_ms must be positive".into()));
        }
        Ok(())
    }
}
