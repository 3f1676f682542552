//! The low-level peer-connection wrapper's interface.
//!
//! `PCTransport` is an external collaborator: this crate specifies only
//! the operations the engine invokes on it and the events it must emit, not its
//! internal ICE/DTLS/SRTP implementation. A concrete implementation would wrap
//! something like a `webrtc-rs`-backed peer connection; none ships here.

use crate::error::Result;
use crate::proto::{IceCandidateInit, SessionDescription};
use async_trait::async_trait;
use std::fmt;

/// Which role a transport plays. A publisher transport sends media/data; a
/// subscriber transport receives it. Exactly one of each exists per engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportRole {
    Publisher,
    Subscriber,
}

/// Mirrors the standard ICE connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::Completed)
    }
}

/// The local/remote candidates ICE settled on for a transport, as reported by
/// `PCTransport::selected_candidate_pair` once the connection reaches
/// `Connected`/`Completed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedCandidatePair {
    pub local: String,
    pub remote: String,
}

/// Configuration applied to a transport at creation time and (for ICE servers and
/// transport policy) again during a resume's `SetConfiguration` call.
#[derive(Debug, Clone, Default)]
pub struct RtcConfiguration {
    pub ice_servers: Vec<crate::proto::IceServer>,
    pub ice_transport_policy: IceTransportPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IceTransportPolicy {
    #[default]
    All,
    Relay,
}

/// Parameters the data-channel creation calls carry.
#[derive(Debug, Clone)]
pub struct DataChannelInit {
    pub ordered: bool,
    pub max_retransmits: Option<u16>,
}

/// Handle to a single data channel on a transport. The engine only ever needs to
/// send bytes and read the channel's buffered-byte count for backpressure; actual
/// framing and congestion behavior live in the real implementation.
#[async_trait]
pub trait DataChannelHandle: Send + Sync + fmt::Debug {
    fn label(&self) -> &str;
    async fn send_text(&self, data: &str) -> Result<()>;
    async fn send_binary(&self, data: &[u8]) -> Result<()>;
    /// Bytes currently queued for send but not yet flushed to the wire.
    fn buffered_amount(&self) -> usize;
    /// Installs the handler invoked for every inbound message on this channel.
    /// `Configure` wires the same handler onto both publisher-side channels;
    /// the subscriber-side channels get it when they arrive via
    /// `PCTransportEventSink::on_data_channel`.
    fn set_message_handler(&self, handler: DataChannelMessageHandler);
}

/// Invoked on every message the remote side of a channel sends, with the message
/// body and whether it arrived as text (`true`) or binary (`false`).
pub type DataChannelMessageHandler = Box<dyn Fn(Vec<u8>, bool) + Send + Sync>;

/// Events a [`PCTransport`] pushes back to the engine. Mirrors
/// [`crate::signal::SignalEventSink`]'s all-default-no-op
/// shape: the engine installs one sink per transport and only overrides the
/// methods relevant to that transport's role.
pub trait PCTransportEventSink: Send + Sync {
    /// A local candidate was gathered; `None` is the end-of-candidates
    /// sentinel and is ignored by the negotiation coordinator.
    fn on_ice_candidate(&self, _candidate: Option<IceCandidateInit>) {}
    fn on_ice_connection_state_change(&self, _state: IceConnectionState) {}
    /// Subscriber-only: a remote data channel arrived.
    fn on_data_channel(&self, _label: String, _handle: std::sync::Arc<dyn DataChannelHandle>) {}
    /// Subscriber-only: a remote media track arrived.
    fn on_track(&self, _event: crate::proto::room::MediaTrackEvent) {}
    /// Publisher-only: the transport renegotiated on its own (e.g. a track was
    /// added above the engine) and produced a fresh local offer.
    fn on_offer(&self, _desc: SessionDescription) {}
}

/// The operations the engine performs on a single peer connection. One instance
/// per [`TransportRole`].
#[async_trait]
pub trait PCTransport: Send + Sync {
    fn role(&self) -> TransportRole;

    fn set_event_sink(&self, sink: std::sync::Arc<dyn PCTransportEventSink>);

    /// Current ICE connection state.
    fn ice_connection_state(&self) -> IceConnectionState;

    /// The candidate pair ICE selected, once settled. `None` before
    /// `Connected`/`Completed`, and for any implementation that doesn't
    /// expose it.
    fn selected_candidate_pair(&self) -> Option<SelectedCandidatePair> {
        None
    }

    /// Creates a local offer (publisher path) or answer (subscriber path,
    /// after the remote offer has been applied).
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<()>;

    /// Rebuilds the underlying ICE agent's server list / policy without a full
    /// teardown; used only by the resume path.
    async fn set_configuration(&self, config: RtcConfiguration) -> Result<()>;

    /// Publisher-only: opens a new data channel with the given label/parameters.
    async fn create_data_channel(
        &self,
        label: &str,
        init: DataChannelInit,
    ) -> Result<std::sync::Arc<dyn DataChannelHandle>>;

    /// Publisher-only: a stream of RTT estimates the transport produces.
    /// `Configure` forwards each value to the subscriber transport via
    /// `report_rtt`. Subscriber-role transports, and any
    /// publisher implementation with nothing to report, return `None`.
    fn rtt_updates(&self) -> Option<tokio::sync::watch::Receiver<u32>> {
        None
    }

    /// Subscriber-only sink for the publisher's RTT stream; a no-op default
    /// covers transports (and the publisher side itself) that don't consume it.
    fn report_rtt(&self, _rtt_ms: u32) {}

    async fn close(&self);
}

/// Bound on the per-send-direction retransmit buffer; the only publisher-side
/// tuning knob exposed concretely here. A pacer, interceptors, and similar are
/// internal to whatever concrete `PCTransport` a binding supplies, out of
/// scope here.
#[derive(Debug, Clone, Copy, Default)]
pub struct PublisherTransportOptions {
    pub retransmit_buffer_size: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SubscriberTransportOptions {
    pub retransmit_buffer_size: usize,
}

/// Builds the publisher/subscriber pair during `Configure`. An external
/// collaborator, like `PCTransport` and `SignalClient`: no
/// concrete implementation ships here, only the construction surface the
/// engine invokes.
#[async_trait]
pub trait PCTransportFactory: Send + Sync {
    async fn create_publisher(
        &self,
        config: RtcConfiguration,
        options: PublisherTransportOptions,
    ) -> Result<std::sync::Arc<dyn PCTransport>>;

    async fn create_subscriber(
        &self,
        config: RtcConfiguration,
        options: SubscriberTransportOptions,
    ) -> Result<std::sync::Arc<dyn PCTransport>>;
}
