//! Client construction options.

use serde::{Deserialize, Serialize};

/// Options controlling circuit lifecycle and connection behavior.
///
/// Defaults match the documented construction options: a 15s connection
/// timeout, a 90s circuit build timeout, two warm spare circuits, and a
/// 10-minute circuit lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TorClientConfig {
    /// WebSocket URL of the Snowflake bridge carrying the link.
    pub snowflake_url: String,

    /// Timeout for establishing the bridge connection and link handshake.
    pub connection_timeout_ms: u64,

    /// Per-attempt timeout for building one circuit.
    pub circuit_timeout_ms: u64,

    /// Number of warm spare circuits the manager keeps buffered. Zero
    /// disables circuit creation entirely.
    pub circuit_buffer: usize,

    /// Age at which a circuit is rotated out.
    pub max_circuit_lifetime_ms: u64,

    /// Rotation starts this long before `max_circuit_lifetime_ms` so a
    /// replacement is warm before the old circuit is disposed.
    pub rotation_grace_ms: u64,

    /// Unbound circuits idle longer than this are disposed.
    pub idle_timeout_ms: u64,

    /// Backoff floor after a failed build.
    pub backoff_min_ms: u64,

    /// Backoff ceiling.
    pub backoff_max_ms: u64,

    /// Backoff growth factor per consecutive failure.
    pub backoff_multiplier: f64,
}

impl Default for TorClientConfig {
    fn default() -> Self {
        Self {
            snowflake_url: String::new(),
            connection_timeout_ms: 15_000,
            circuit_timeout_ms: 90_000,
            circuit_buffer: 2,
            max_circuit_lifetime_ms: 600_000,
            rotation_grace_ms: 60_000,
            idle_timeout_ms: 300_000,
            backoff_min_ms: 5_000,
            backoff_max_ms: 60_000,
            backoff_multiplier: 1.1,
        }
    }
}

impl TorClientConfig {
    /// Config with a bridge URL and defaults for everything else.
    pub fn with_bridge(url: impl Into<String>) -> Self {
        Self {
            snowflake_url: url.into(),
            ..Self::default()
        }
    }
}

/// How the client treats IPv6 when opening exit streams.
///
/// Mapped onto the RELAY_BEGIN flags field: `IPV6_OK`, `IPV4_NOT_OK`,
/// `IPV6_PREFER`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ipv6Policy {
    /// IPv4 only.
    Never,
    /// IPv4 preferred, IPv6 allowed.
    #[default]
    Avoided,
    /// IPv6 preferred, IPv4 allowed.
    Preferred,
    /// IPv6 only.
    Always,
}

impl Ipv6Policy {
    /// Encode as RELAY_BEGIN flag bits (tor-spec §6.2).
    pub fn begin_flags(self) -> u32 {
        const IPV6_OK: u32 = 1;
        const IPV4_NOT_OK: u32 = 1 << 1;
        const IPV6_PREFER: u32 = 1 << 2;
        match self {
            Ipv6Policy::Never => 0,
            Ipv6Policy::Avoided => IPV6_OK,
            Ipv6Policy::Preferred => IPV6_OK | IPV6_PREFER,
            Ipv6Policy::Always => IPV6_OK | IPV4_NOT_OK | IPV6_PREFER,
        }
    }
}
