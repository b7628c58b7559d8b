//! Server configuration.
//!
//! Each layer keeps its own config struct; [`ServerConfig`] just bundles
//! them for the builder. All of them have working defaults.

use std::time::Duration;

use rollstream_bridge::BridgeConfig;
use rollstream_room::RoomConfig;
use rollstream_session::SessionConfig;

/// Everything the HTTP layer needs, one field per concern.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub session: SessionConfig,
    pub room: RoomConfig,
    pub stream: StreamConfig,
    pub rate_limit: RateLimitConfig,
    pub dice: DiceConfig,
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

/// Tuning for the SSE subscription route.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// How often a `ping` frame is sent on an idle stream.
    ///
    /// Default: 20 seconds.
    pub ping_interval: Duration,

    /// Reconnect delay suggested to clients in the stream's first frame.
    ///
    /// Default: 5 seconds.
    pub client_retry: Duration,

    /// Longest single wait on the store before the bridge re-checks for
    /// cancellation. This bounds how long a vanished client can hold a
    /// subscription open.
    ///
    /// Default: 2 seconds.
    pub receive_timeout: Duration,

    /// Frames buffered per client before the bridge stops reading.
    ///
    /// Default: 32.
    pub queue_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(20),
            client_retry: Duration::from_secs(5),
            receive_timeout: Duration::from_secs(2),
            queue_capacity: 32,
        }
    }
}

impl StreamConfig {
    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            receive_timeout: self.receive_timeout,
            keepalive_interval: self.ping_interval,
            queue_capacity: self.queue_capacity,
        }
    }
}

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

/// Per-origin fixed-window request ceiling.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Requests allowed per origin per window. The next one is rejected.
    pub max_requests: i64,

    /// Window length. Counters expire after one window.
    pub window: Duration,

    /// Consecutive counter failures that open the breaker. While open,
    /// requests pass uncounted.
    pub max_consecutive_failures: u32,

    /// How long the breaker stays open before counting is retried.
    pub breaker_cooldown: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 120,
            window: Duration::from_secs(60),
            max_consecutive_failures: 5,
            breaker_cooldown: Duration::from_secs(30),
        }
    }
}

// ---------------------------------------------------------------------------
// Dice
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DiceConfig {
    /// Largest dice pool a single roll may ask for.
    pub max_single_roll: u32,
    /// Largest number of initiative dice.
    pub max_initiative_dice: u8,
    /// Lowest initiative base score.
    pub min_initiative_base: i32,
}

impl Default for DiceConfig {
    fn default() -> Self {
        Self {
            max_single_roll: 100,
            max_initiative_dice: 5,
            min_initiative_base: -2,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Settings for [`crate::logging::init`].
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter used when `RUST_LOG` is unset, in `EnvFilter` syntax.
    pub default_filter: String,
    /// Colored output.
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_filter: "info,rollstream=debug".into(),
            ansi: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_config_bridge_config_uses_ping_as_keepalive() {
        let stream = StreamConfig {
            ping_interval: Duration::from_secs(7),
            ..StreamConfig::default()
        };
        let bridge = stream.bridge_config();
        assert_eq!(bridge.keepalive_interval, Duration::from_secs(7));
        assert_eq!(bridge.receive_timeout, Duration::from_secs(2));
        assert_eq!(bridge.queue_capacity, 32);
    }
}
