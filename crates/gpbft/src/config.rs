//! Participant configuration.

use std::time::Duration;

/// Configuration for a Granite participant.
#[derive(Debug, Clone)]
pub struct GraniteConfig {
    /// Instance number the participant starts at.
    pub initial_instance: u64,

    /// Expected bound on network synchrony in round 0. Phase timeouts are
    /// `2·Δ` where `Δ = delta · delta_backoff_exponent^round`.
    pub delta: Duration,

    /// Per-round growth factor for the synchrony bound.
    pub delta_backoff_exponent: f64,

    /// Queued messages for future instances are dropped when they carry no
    /// justification and name a round beyond this bound.
    pub max_lookahead_rounds: u64,
}

impl Default for GraniteConfig {
    fn default() -> Self {
        Self {
            initial_instance: 0,
            delta: Duration::from_secs(2),
            delta_backoff_exponent: 1.3,
            max_lookahead_rounds: 5,
        }
    }
}
