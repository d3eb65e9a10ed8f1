use crate::constants::MAX_PARAMS;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Per-byte read timeout used by the host side transports.
pub const DEFAULT_BYTE_TIMEOUT: Duration = Duration::from_millis(100);

/// Default TCP endpoint of a simulated bus.
pub const DEFAULT_ADDR: &str = "127.0.0.1:8888";

/// Controller-side settings.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BusConfig {
    /// How long a transport waits for a single byte before reporting a timeout
    pub byte_timeout: Duration,
    /// Largest status packet (in parameter bytes) the controller will accept
    pub max_status_params: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            byte_timeout: DEFAULT_BYTE_TIMEOUT,
            max_status_params: MAX_PARAMS,
        }
    }
}

impl BusConfig {
    pub fn with_byte_timeout(mut self, byte_timeout: Duration) -> Self {
        self.byte_timeout = byte_timeout;
        self
    }

    pub fn with_max_status_params(mut self, max_status_params: usize) -> Self {
        self.max_status_params = max_status_params.min(MAX_PARAMS);
        self
    }
}
