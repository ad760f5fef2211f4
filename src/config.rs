use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Chunk size in bytes in which data is transferred.
pub const CHUNK_SIZE: usize = 2048;

/// Size of the transport buffer in bytes.
///
/// Both write and read operations require a buffer of at least [`CHUNK_SIZE`] bytes.
pub const BUFFER_SIZE: usize = CHUNK_SIZE;

/// Timeout of a single physical transfer attempt.
pub const TIMEOUT: Duration = Duration::from_millis(1000);

/// Number of consecutive timeouts before a transfer is treated as timed out.
pub const NUM_TIMEOUTS: usize = 2;

/// What to do with bytes received beyond the length declared for a read operation.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverrunPolicy {
    /// Fail the read with a protocol error.
    #[default]
    Reject,
    /// Keep the surplus buffered for the next read operation.
    Retain,
}

/// Transport tuning.
///
/// The defaults match what the probes expect; there should rarely be a reason to change them
/// except in tests.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub chunk_size: usize,
    pub buffer_size: usize,
    pub timeout_ms: u64,
    pub max_timeouts: usize,
    pub overrun: OverrunPolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            buffer_size: BUFFER_SIZE,
            timeout_ms: TIMEOUT.as_millis() as u64,
            max_timeouts: NUM_TIMEOUTS,
            overrun: OverrunPolicy::Reject,
        }
    }
}

impl TransportConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Panics if the buffer geometry can't support the chunk alignment rule.
    pub(crate) fn validate(&self) {
        assert!(self.chunk_size > 0, "chunk size must not be zero");
        assert!(
            self.buffer_size >= self.chunk_size,
            "buffer size ({}) must be at least one chunk ({})",
            self.buffer_size,
            self.chunk_size
        );
        assert!(
            self.buffer_size % self.chunk_size == 0,
            "buffer size ({}) must be a multiple of the chunk size ({})",
            self.buffer_size,
            self.chunk_size
        );
        assert!(self.max_timeouts > 0, "at least one transfer attempt is required");
    }
}
