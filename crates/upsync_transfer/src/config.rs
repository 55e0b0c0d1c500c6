use std::time::Duration;

use crate::DEFAULT_CHUNK_SIZE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub chunk_size: u64,
    /// Timeout of every request except the extended ones.
    pub request_timeout: Duration,
    /// Timeout of the final chunk and of the assembly MOVE, during which the
    /// server rebuilds the whole file.
    pub extended_timeout: Duration,
    /// Log every chunk request at `info` instead of `debug`.
    pub diagnostics: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            request_timeout: Duration::from_secs(60),
            extended_timeout: Duration::from_secs(15 * 60),
            diagnostics: false,
        }
    }
}

impl TransportConfig {
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }
}
