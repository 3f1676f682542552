//! Configuration surface assembled by the caller and handed to [`crate::engine::Engine::join`].
//!
//! No config file, env var schema, or CLI lives here — configuration loading is the
//! embedding application's job. These are plain `Default`-able structs built by the
//! caller and passed in directly, rather than read from disk.

use crate::transport::IceTransportPolicy;
use smart_default::SmartDefault;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// The low-water mark under which [`crate::data_plane::DataPlane::is_buffer_status_low`]
/// reports a channel as drained enough to accept more sends.
pub const DEFAULT_LOW_BUFFER_THRESHOLD_BYTES: usize = 4096;

/// Default timeout `Join`/`WaitUntilConnected` wait for the primary transport to
/// reach `Connected`.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(15);

/// Maximum reconnect loop iterations.
pub const MAX_RECONNECT_COUNT: u32 = 10;

/// Reconnect backoff cap; exceeding it abandons the loop.
pub const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(60);

/// Per-iteration backoff base; actual delay is `i^2 * RECONNECT_BACKOFF_BASE`.
pub const RECONNECT_BACKOFF_BASE: Duration = Duration::from_millis(300);

/// Poll interval for `WaitUntilConnected`.
pub const CONNECTED_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Poll interval `Close` uses while waiting for an in-flight reconnect to settle.
pub const CLOSE_RECONNECT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Poll interval for `WaitForBufferStatusLow`.
pub const BUFFER_STATUS_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Fixed data-channel labels.
pub const RELIABLE_DATA_CHANNEL_LABEL: &str = "_reliable";
pub const LOSSY_DATA_CHANNEL_LABEL: &str = "_lossy";

/// Lossy channel's bounded retransmit count.
pub const LOSSY_MAX_RETRANSMITS: u16 = 1;

/// Configuration enumerated by the caller and carried through `Join`/`Configure`.
#[derive(Debug, Clone, SmartDefault)]
pub struct ConnectionParams {
    /// Caller-requested ICE transport policy. May be overridden to `Relay` by the
    /// server's `ClientConfiguration.force_relay`.
    #[default(IceTransportPolicy::All)]
    pub ice_transport_policy: IceTransportPolicy,

    /// Bound on the per-send-direction retransmit buffer the publisher and
    /// subscriber transports are constructed with.
    #[default(4 * 1024 * 1024)]
    pub retransmit_buffer_size: usize,

    /// Low-water mark for `IsBufferStatusLow`, per channel kind.
    #[default(DEFAULT_LOW_BUFFER_THRESHOLD_BYTES)]
    pub low_buffer_threshold_bytes: usize,

    /// How long `Join`/`WaitUntilConnected` wait for the primary transport.
    #[default(DEFAULT_JOIN_TIMEOUT)]
    pub join_timeout: Duration,

    /// When true, the publisher offers immediately after `Join` even if the
    /// session is subscriber-primary.
    #[default(false)]
    pub fast_publish: bool,
}

/// Everything `Join` needs beyond the room URL/token.
///
/// `cancel` lets a caller abandon an in-flight join; the signaling join honors
/// it directly. Defaults to a token that is never cancelled, so callers that
/// don't need cancellation can ignore it.
#[derive(Debug, Clone)]
pub struct JoinContext {
    pub url: String,
    pub token: String,
    pub params: ConnectionParams,
    pub cancel: CancellationToken,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_params_default_matches_documented_constants() {
        let params = ConnectionParams::default();
        assert_eq!(params.ice_transport_policy, IceTransportPolicy::All);
        assert_eq!(
            params.low_buffer_threshold_bytes,
            DEFAULT_LOW_BUFFER_THRESHOLD_BYTES
        );
        assert!(!params.fast_publish);
        assert_eq!(params.join_timeout, DEFAULT_JOIN_TIMEOUT);
    }
}
