//! Message reliability protocol (MRP) parameters.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_IDLE_RETRANSMISSION_TIMEOUT_MS: u32 = 5000;
pub const DEFAULT_ACTIVE_RETRANSMISSION_TIMEOUT_MS: u32 = 300;
pub const DEFAULT_RETRANSMISSION_RETRIES: u32 = 2;

/// Retransmission timing for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MrpParameters {
    pub idle_retransmission_timeout_ms: u32,
    pub active_retransmission_timeout_ms: u32,
    pub retransmission_retries: u32,
}

impl Default for MrpParameters {
    fn default() -> Self {
        Self {
            idle_retransmission_timeout_ms: DEFAULT_IDLE_RETRANSMISSION_TIMEOUT_MS,
            active_retransmission_timeout_ms: DEFAULT_ACTIVE_RETRANSMISSION_TIMEOUT_MS,
            retransmission_retries: DEFAULT_RETRANSMISSION_RETRIES,
        }
    }
}

impl MrpParameters {
    /// Parameters negotiated by a handshake. Missing values fall back to defaults.
    pub fn negotiated(idle_ms: Option<u32>, active_ms: Option<u32>) -> Self {
        let defaults = Self::default();
        Self {
            idle_retransmission_timeout_ms: idle_ms
                .unwrap_or(defaults.idle_retransmission_timeout_ms),
            active_retransmission_timeout_ms: active_ms
                .unwrap_or(defaults.active_retransmission_timeout_ms),
            ..defaults
        }
    }

    pub fn idle_retransmission_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_retransmission_timeout_ms.into())
    }

    pub fn active_retransmission_timeout(&self) -> Duration {
        Duration::from_millis(self.active_retransmission_timeout_ms.into())
    }

    /// How long a closing exchange stays around to absorb late retransmissions:
    /// one active interval per transmission attempt.
    pub fn close_grace_period(&self) -> Duration {
        self.active_retransmission_timeout() * (self.retransmission_retries + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let mrp = MrpParameters::default();
        assert_eq!(mrp.idle_retransmission_timeout(), Duration::from_millis(5000));
        assert_eq!(mrp.active_retransmission_timeout(), Duration::from_millis(300));
        assert_eq!(mrp.retransmission_retries, 2);
        assert_eq!(mrp.close_grace_period(), Duration::from_millis(900));
    }

    #[test]
    fn test_negotiated_overrides() {
        let mrp = MrpParameters::negotiated(None, Some(50));
        assert_eq!(mrp.idle_retransmission_timeout_ms, 5000);
        assert_eq!(mrp.active_retransmission_timeout_ms, 50);
        assert_eq!(mrp.retransmission_retries, 2);
    }
}
