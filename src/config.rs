//! Router configuration
//!
//! Broadcast cadence, retry, and handshake tunables are construction
//! parameters rather than process-wide statics, so two routers in one
//! process (a common test topology) can run different schedules.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default interval between periodic link-state broadcasts
const DEFAULT_BROADCAST_INTERVAL: Duration = Duration::from_secs(5);

/// Default coalescing delay after a topology change
const DEFAULT_COALESCE_DELAY: Duration = Duration::from_millis(500);

/// Default number of routing-link attempts before the neighbor is dropped
const DEFAULT_ROUTING_RETRY_LIMIT: u32 = 5;

/// Default deadline for a single handshake step
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Tunables for a [`Router`](crate::routing::Router)
///
/// All fields have sensible defaults; construct with `RouterConfig::default()`
/// and override what you need:
///
/// ```
/// use meshwork::RouterConfig;
/// use std::time::Duration;
///
/// let config = RouterConfig {
///     coalesce_delay: Duration::from_millis(100),
///     ..RouterConfig::default()
/// };
/// assert!(config.coalesce_delay < config.broadcast_interval);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Interval between regular link-state broadcasts
    pub broadcast_interval: Duration,

    /// Short delay used to coalesce a burst of topology changes into a
    /// single broadcast; also the starting backoff for routing-link retries
    pub coalesce_delay: Duration,

    /// Consecutive routing-link failures tolerated before the peer's
    /// addresses are dropped and the neighbor is considered lost
    pub routing_retry_limit: u32,

    /// Deadline applied to each packet read/write inside an establishment
    pub handshake_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            broadcast_interval: DEFAULT_BROADCAST_INTERVAL,
            coalesce_delay: DEFAULT_COALESCE_DELAY,
            routing_retry_limit: DEFAULT_ROUTING_RETRY_LIMIT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_keep_short_delay_below_regular() {
        let config = RouterConfig::default();
        assert!(config.coalesce_delay < config.broadcast_interval);
        assert_eq!(config.routing_retry_limit, 5);
    }
}
