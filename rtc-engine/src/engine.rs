//! The engine facade and `Configure`.
//!
//! `Engine` is a cheap `Arc`-backed handle; the actual state lives in
//! `EngineInner` and is shared with the `Negotiation`/`ReconnectController`
//! handles and the event-sink adapters below. Lock partitioning keeps one
//! lock per concern: `pc` guards the transport pair, data-channel state lives
//! entirely inside `DataPlane`'s own lock, and the reliable-sequence lock
//! never leaves `DataPlane`.

use crate::callbacks::EngineCallbacks;
use crate::config::{ConnectionParams, JoinContext, CONNECTED_POLL_INTERVAL};
use crate::data_plane::{DataPacketKind, DataPlane};
use crate::error::{EngineError, Result};
use crate::negotiation::Negotiation;
use crate::proto::{
    map_reason, room, ClientConfiguration, IceServer, JoinResponse, LeaveAction, LeaveRequest,
    PacketValue, RpcError, SessionDescription, SignalTarget, StreamChunkPacket,
    StreamHeaderPacket, WireLeaveReason,
};
use crate::reconnect::ReconnectController;
use crate::signal::{SignalClient, SignalEventSink};
use crate::transport::{
    IceConnectionState, IceTransportPolicy, PCTransport, PCTransportEventSink, PCTransportFactory,
    PublisherTransportOptions, RtcConfiguration, SubscriberTransportOptions, TransportRole,
};
use dashmap::DashMap;
use log::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, Notify, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// The transport-pair state guarded by `EngineInner::pc`.
#[derive(Default)]
pub(crate) struct PcState {
    pub publisher: Option<Arc<dyn PCTransport>>,
    pub subscriber: Option<Arc<dyn PCTransport>>,
    pub subscriber_primary: bool,
    rtt_forward_task: Option<abort_on_drop::ChildTask<()>>,
}

/// Shared engine state. Every field here is either behind its own lock/atomic
/// or immutable after construction.
pub(crate) struct EngineInner {
    pub pc: RwLock<PcState>,
    pub data_plane: Arc<DataPlane>,
    pub signal: Arc<dyn SignalClient>,
    pub transport_factory: Arc<dyn PCTransportFactory>,
    /// Shared with `data_plane`'s own copy of the same `Arc` so a caller
    /// installing a handler via `Engine::mutate_callbacks` is visible to both
    /// the engine-level dispatch in this file and `DataPlane::dispatch`.
    pub callbacks: Arc<RwLock<EngineCallbacks>>,
    pub url: RwLock<String>,
    /// Last-writer-wins; refreshed asynchronously by `OnTokenRefresh`.
    pub token: RwLock<String>,
    pub params: RwLock<ConnectionParams>,
    pub participant_sid: RwLock<String>,
    pub has_connected: AtomicBool,
    pub has_publish: AtomicBool,
    pub closed: AtomicBool,
    pub reconnecting: AtomicBool,
    pub requires_full_reconnect: AtomicBool,
    /// Lets `Close` wait for an in-flight reconnect without busy-polling,
    /// preferring a condition variable over spinning on a flag.
    pub reconnect_notify: Notify,
    /// The `Vec` itself is the guarded resource.
    pub close_handlers: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    handlers_drained: AtomicBool,
    /// Pending-publication registry, expressed as a `DashMap` rather than an
    /// explicit mutex + `HashMap` (see DESIGN.md).
    pub pending_publications: DashMap<String, oneshot::Sender<room::LocalTrackPublishedUpdate>>,
}

impl EngineInner {
    pub(crate) async fn session_context(&self) -> (String, String, ConnectionParams, String) {
        (
            self.url.read().await.clone(),
            self.token.read().await.clone(),
            self.params.read().await.clone(),
            self.participant_sid.read().await.clone(),
        )
    }

    pub(crate) async fn is_connected(&self) -> bool {
        let pc = self.pc.read().await;
        let (Some(publisher), Some(subscriber)) = (&pc.publisher, &pc.subscriber) else {
            return false;
        };
        let primary: &dyn PCTransport = if pc.subscriber_primary {
            subscriber.as_ref()
        } else {
            publisher.as_ref()
        };
        primary.ice_connection_state().is_connected()
    }

    /// `WaitUntilConnected`: polls `is_connected` until it's true or `timeout`
    /// elapses. On success, clears `requires_full_reconnect` — the only place
    /// that flag is cleared outside the reconnect loop consuming it.
    pub(crate) async fn wait_until_connected_inner(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_connected().await {
                self.requires_full_reconnect.store(false, Ordering::SeqCst);
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(EngineError::ConnectionTimeout(timeout));
            }
            tokio::time::sleep(CONNECTED_POLL_INTERVAL).await;
        }
    }

    /// The core join sequence, reused by both `Engine::join` and
    /// `restart_connection`, which replaces both transports by calling this
    /// again. `cancel` races the signaling handshake only; `restart_connection`
    /// passes a fresh, never-cancelled token, since cancellation is a property
    /// of the caller-facing `Join`, not of internally driven rejoins.
    pub(crate) async fn rejoin(self: &Arc<Self>, cancel: CancellationToken) -> Result<JoinResponse> {
        let (url, token, params, _) = self.session_context().await;
        let ctx = JoinContext {
            url,
            token,
            params: params.clone(),
            cancel: cancel.clone(),
        };
        self.signal
            .set_event_sink(Arc::new(SignalSink(self.clone())) as Arc<dyn SignalEventSink>);
        let response = tokio::select! {
            res = self.signal.join(&ctx) => res?,
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        };
        *self.participant_sid.write().await = response.participant_sid.clone();

        self.configure(
            response.ice_servers.clone(),
            response.client_configuration.clone(),
            response.subscriber_primary,
        )
        .await?;

        // Marks the signaling client as logically connected and brings up its
        // read loop.
        debug!("signaling client connected, starting read loop");
        self.signal.start().await?;

        if !response.subscriber_primary || params.fast_publish || response.fast_publish {
            Negotiation(self.clone())
                .request_publisher_offer(false)
                .await?;
        }

        self.wait_until_connected_inner(params.join_timeout).await?;
        self.has_connected.store(true, Ordering::SeqCst);
        info!(
            "join succeeded, subscriber_primary={}",
            response.subscriber_primary
        );
        Ok(response)
    }

    /// `Configure`: atomic reconfiguration of the transport pair under `pc`.
    pub(crate) async fn configure(
        self: &Arc<Self>,
        ice_servers: Vec<IceServer>,
        client_config: ClientConfiguration,
        subscriber_primary: bool,
    ) -> Result<()> {
        // Step 1: reset the reliable sequence counter.
        self.data_plane.reset_sequence().await;

        // Step 2: close any existing publisher/subscriber.
        {
            let mut pc = self.pc.write().await;
            if let Some(p) = pc.publisher.take() {
                p.close().await;
            }
            if let Some(s) = pc.subscriber.take() {
                s.close().await;
            }
            pc.rtt_forward_task = None;
        }
        self.data_plane.clear_channels().await;

        // Step 3: build the RTC configuration.
        let requested_policy = self.params.read().await.ice_transport_policy;
        let ice_transport_policy = if client_config.force_relay {
            IceTransportPolicy::Relay
        } else {
            requested_policy
        };
        let retransmit_buffer_size = self.params.read().await.retransmit_buffer_size;
        let config = RtcConfiguration {
            ice_servers,
            ice_transport_policy,
        };

        // Step 4: create the publisher and subscriber.
        let publisher = self
            .transport_factory
            .create_publisher(
                config.clone(),
                PublisherTransportOptions {
                    retransmit_buffer_size,
                },
            )
            .await?;
        let subscriber = self
            .transport_factory
            .create_subscriber(
                config,
                SubscriberTransportOptions {
                    retransmit_buffer_size,
                },
            )
            .await?;

        // Steps 6-9: wire event sinks (candidate forwarding, primary ICE
        // observation, on-track, on-data-channel, publisher on-offer).
        publisher.set_event_sink(Arc::new(PublisherSink(self.clone())));
        subscriber.set_event_sink(Arc::new(SubscriberSink(self.clone())));

        let rtt_forward_task = publisher.rtt_updates().map(|mut rx| {
            let subscriber = subscriber.clone();
            tokio::spawn(async move {
                while rx.changed().await.is_ok() {
                    subscriber.report_rtt(*rx.borrow());
                }
            })
            .into()
        });

        // Step 5 + storing the pair.
        {
            let mut pc = self.pc.write().await;
            pc.publisher = Some(publisher.clone());
            pc.subscriber = Some(subscriber);
            pc.subscriber_primary = subscriber_primary;
            pc.rtt_forward_task = rtt_forward_task;
        }

        // Step 10: publisher-side data channels (lossy then reliable).
        self.data_plane.create_publisher_channels(publisher.as_ref()).await?;

        debug!("configure complete, subscriber_primary={subscriber_primary}");
        Ok(())
    }
}

/// Adapter delivering `SignalClient` pushes onto `EngineInner`.
struct SignalSink(Arc<EngineInner>);

macro_rules! emit {
    ($inner:expr, $field:ident, $val:expr) => {{
        let inner = $inner.clone();
        let val = $val;
        tokio::spawn(async move {
            let callbacks = inner.callbacks.read().await;
            if let Some(cb) = &callbacks.$field {
                cb(val);
            }
        });
    }};
}

impl SignalEventSink for SignalSink {
    fn on_answer(&self, desc: SessionDescription) {
        let inner = self.0.clone();
        tokio::spawn(async move { Negotiation(inner).handle_answer(desc).await });
    }

    fn on_offer(&self, desc: SessionDescription) {
        let inner = self.0.clone();
        tokio::spawn(async move { Negotiation(inner).handle_offer(desc).await });
    }

    fn on_trickle(&self, candidate: Option<crate::proto::IceCandidateInit>, target: SignalTarget) {
        let inner = self.0.clone();
        tokio::spawn(async move { Negotiation(inner).handle_trickle(candidate, target).await });
    }

    fn on_participant_update(&self, update: room::ParticipantUpdate) {
        emit!(self.0, on_participant_update, update);
    }

    fn on_speakers_changed(&self, update: room::SpeakerUpdate) {
        emit!(self.0, on_speakers_changed, update);
    }

    fn on_local_track_published(&self, update: room::LocalTrackPublishedUpdate) {
        let inner = self.0.clone();
        tokio::spawn(async move {
            if let Some(cid) = update.0.get("cid").and_then(|v| v.as_str()) {
                if let Some((_, tx)) = inner.pending_publications.remove(cid) {
                    let _ = tx.send(update.clone());
                }
            }
            let callbacks = inner.callbacks.read().await;
            if let Some(cb) = &callbacks.on_local_track_published {
                cb(update);
            }
        });
    }

    fn on_local_track_unpublished(&self, update: room::LocalTrackUnpublishedUpdate) {
        emit!(self.0, on_local_track_unpublished, update);
    }

    fn on_track_remote_muted(&self, update: room::TrackRemoteMutedUpdate) {
        emit!(self.0, on_track_remote_muted, update);
    }

    fn on_connection_quality(&self, update: room::ConnectionQualityUpdate) {
        emit!(self.0, on_connection_quality, update);
    }

    fn on_room_update(&self, update: room::RoomUpdate) {
        emit!(self.0, on_room_update, update);
    }

    fn on_room_moved(&self, update: room::RoomMovedUpdate) {
        emit!(self.0, on_room_moved, update);
    }

    fn on_leave(&self, request: LeaveRequest) {
        let inner = self.0.clone();
        tokio::spawn(async move {
            match request.action {
                LeaveAction::Disconnect => {
                    let reason = map_reason(request.reason);
                    Engine::from_inner(inner.clone()).close().await;
                    let callbacks = inner.callbacks.read().await;
                    if let Some(cb) = &callbacks.on_disconnected {
                        cb(reason);
                    }
                }
                LeaveAction::Reconnect => {
                    ReconnectController(inner).handle_disconnect(true).await;
                }
                LeaveAction::Resume => {
                    ReconnectController(inner).handle_disconnect(false).await;
                }
                LeaveAction::Other => {}
            }
        });
    }

    fn on_token_refresh(&self, token: String) {
        let inner = self.0.clone();
        tokio::spawn(async move {
            *inner.token.write().await = token;
        });
    }

    fn on_local_track_subscribed(&self, update: room::LocalTrackSubscribedUpdate) {
        emit!(self.0, on_local_track_subscribed, update);
    }

    fn on_subscribed_quality_update(&self, update: room::SubscribedQualityUpdate) {
        emit!(self.0, on_subscribed_quality_update, update);
    }

    fn on_close(&self) {
        trace!("signaling client reported socket close");
    }
}

/// Adapter wiring the publisher transport's events onto the negotiation
/// coordinator and the signaling client.
struct PublisherSink(Arc<EngineInner>);

impl PCTransportEventSink for PublisherSink {
    fn on_ice_candidate(&self, candidate: Option<crate::proto::IceCandidateInit>) {
        let inner = self.0.clone();
        tokio::spawn(async move {
            Negotiation(inner)
                .handle_local_candidate(TransportRole::Publisher, candidate)
                .await
        });
    }

    fn on_ice_connection_state_change(&self, state: IceConnectionState) {
        let inner = self.0.clone();
        tokio::spawn(async move {
            let is_primary = !inner.pc.read().await.subscriber_primary;
            if is_primary {
                Negotiation(inner).handle_ice_connection_state(state).await;
            }
        });
    }

    fn on_offer(&self, desc: SessionDescription) {
        let inner = self.0.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.signal.send_offer(desc).await {
                error!("failed to forward autonomous publisher offer: {e}");
                return;
            }
            inner.has_publish.store(true, Ordering::SeqCst);
        });
    }
}

/// Adapter wiring the subscriber transport's events onto the negotiation
/// coordinator and the data plane.
struct SubscriberSink(Arc<EngineInner>);

impl PCTransportEventSink for SubscriberSink {
    fn on_ice_candidate(&self, candidate: Option<crate::proto::IceCandidateInit>) {
        let inner = self.0.clone();
        tokio::spawn(async move {
            Negotiation(inner)
                .handle_local_candidate(TransportRole::Subscriber, candidate)
                .await
        });
    }

    fn on_ice_connection_state_change(&self, state: IceConnectionState) {
        let inner = self.0.clone();
        tokio::spawn(async move {
            let is_primary = inner.pc.read().await.subscriber_primary;
            if is_primary {
                Negotiation(inner).handle_ice_connection_state(state).await;
            }
        });
    }

    fn on_data_channel(&self, label: String, handle: Arc<dyn crate::transport::DataChannelHandle>) {
        let inner = self.0.clone();
        tokio::spawn(async move {
            inner.data_plane.set_subscriber_channel(&label, handle).await;
        });
    }

    fn on_track(&self, event: room::MediaTrackEvent) {
        emit!(self.0, on_media_track, event);
    }
}

/// Ergonomic construction over `ConnectionParams` plus the two external
/// collaborators.
pub struct EngineBuilder {
    signal: Option<Arc<dyn SignalClient>>,
    transport_factory: Option<Arc<dyn PCTransportFactory>>,
    callbacks: EngineCallbacks,
    low_buffer_threshold_bytes: usize,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            signal: None,
            transport_factory: None,
            callbacks: EngineCallbacks::default(),
            low_buffer_threshold_bytes: crate::config::DEFAULT_LOW_BUFFER_THRESHOLD_BYTES,
        }
    }
}

impl EngineBuilder {
    pub fn signal_client(mut self, signal: Arc<dyn SignalClient>) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn transport_factory(mut self, factory: Arc<dyn PCTransportFactory>) -> Self {
        self.transport_factory = Some(factory);
        self
    }

    pub fn callbacks(mut self, callbacks: EngineCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn low_buffer_threshold_bytes(mut self, bytes: usize) -> Self {
        self.low_buffer_threshold_bytes = bytes;
        self
    }

    pub fn build(self) -> Engine {
        let signal = self.signal.expect("EngineBuilder requires a signal_client");
        let transport_factory = self
            .transport_factory
            .expect("EngineBuilder requires a transport_factory");
        let callbacks = Arc::new(RwLock::new(self.callbacks));
        let data_plane = Arc::new(DataPlane::new(
            callbacks.clone(),
            self.low_buffer_threshold_bytes,
        ));
        let inner = Arc::new(EngineInner {
            pc: RwLock::new(PcState::default()),
            data_plane,
            signal,
            transport_factory,
            callbacks,
            url: RwLock::new(String::new()),
            token: RwLock::new(String::new()),
            params: RwLock::new(ConnectionParams::default()),
            participant_sid: RwLock::new(String::new()),
            has_connected: AtomicBool::new(false),
            has_publish: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            requires_full_reconnect: AtomicBool::new(false),
            reconnect_notify: Notify::new(),
            close_handlers: Mutex::new(Vec::new()),
            handlers_drained: AtomicBool::new(false),
            pending_publications: DashMap::new(),
        });
        Engine { inner }
    }
}

/// The engine facade: lifecycle, configuration assembly, the public callback
/// surface, and wait-until-connected gating. A cheap
/// `Arc`-backed handle — cloning it shares the same underlying session.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    fn from_inner(inner: Arc<EngineInner>) -> Self {
        Self { inner }
    }

    /// Performs the signaling join, configures both transports, and may
    /// immediately request a publisher offer depending on the negotiation
    /// rules below. Waits up to `params.join_timeout` for the primary
    /// transport to connect.
    pub async fn join(
        &self,
        url: impl Into<String>,
        token: impl Into<String>,
        params: ConnectionParams,
    ) -> Result<JoinResponse> {
        self.join_with_cancel(url, token, params, CancellationToken::new())
            .await
    }

    /// Same as [`Engine::join`], but the signaling handshake is raced against
    /// `cancel`, so a caller can abandon an in-flight join.
    pub async fn join_with_cancel(
        &self,
        url: impl Into<String>,
        token: impl Into<String>,
        params: ConnectionParams,
        cancel: CancellationToken,
    ) -> Result<JoinResponse> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed);
        }
        *self.inner.url.write().await = url.into();
        *self.inner.token.write().await = token.into();
        *self.inner.params.write().await = params;
        self.inner.rejoin(cancel).await
    }

    /// Idempotent. Waits for an in-flight reconnect to settle, drains close
    /// handlers exactly once in insertion order, then releases both
    /// transports and the signaling client.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        loop {
            let notified = self.inner.reconnect_notify.notified();
            if !self.inner.reconnecting.load(Ordering::SeqCst) {
                break;
            }
            notified.await;
        }

        let handlers = {
            let mut guard = self.inner.close_handlers.lock().await;
            std::mem::take(&mut *guard)
        };
        self.inner.handlers_drained.store(true, Ordering::SeqCst);
        for handler in handlers {
            handler();
        }

        let mut pc = self.inner.pc.write().await;
        if let Some(p) = pc.publisher.take() {
            p.close().await;
        }
        if let Some(s) = pc.subscriber.take() {
            s.close().await;
        }
        pc.rtt_forward_task = None;
        drop(pc);
        self.inner.signal.close().await;
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.is_connected().await
    }

    /// Registers a close handler. A no-op once the drain has already started
    /// — a handler registered that late is simply dropped rather than run.
    pub async fn on_close(&self, handler: impl FnOnce() + Send + 'static) {
        if self.inner.handlers_drained.load(Ordering::SeqCst) {
            return;
        }
        self.inner.close_handlers.lock().await.push(Box::new(handler));
    }

    /// Polls `is_connected` at a fixed interval until it's true or
    /// `params.join_timeout` elapses.
    pub async fn wait_until_connected(&self) -> Result<()> {
        let timeout = self.inner.params.read().await.join_timeout;
        self.inner.wait_until_connected_inner(timeout).await
    }

    pub async fn mutate_callbacks(&self, f: impl FnOnce(&mut EngineCallbacks)) {
        let mut callbacks = self.inner.callbacks.write().await;
        f(&mut callbacks);
    }

    /// Last-writer-wins token refresh, exposed for callers that refresh the
    /// token out-of-band — the server may push a new one asynchronously.
    pub async fn update_token(&self, token: impl Into<String>) {
        *self.inner.token.write().await = token.into();
    }

    /// Inserts a single-slot wait for a `TrackPublished` response keyed by
    /// client track id. The returned receiver resolves when
    /// `on_local_track_published` reports a
    /// matching `cid`, or is dropped (silently removed) if the caller gives
    /// up.
    pub fn register_pending_publication(
        &self,
        client_track_id: impl Into<String>,
    ) -> oneshot::Receiver<room::LocalTrackPublishedUpdate> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending_publications
            .insert(client_track_id.into(), tx);
        rx
    }

    pub fn cancel_pending_publication(&self, client_track_id: &str) {
        self.inner.pending_publications.remove(client_track_id);
    }

    /// Gates a publish on the publisher being in a state that can carry data,
    /// then sends the packet.
    pub async fn publish_data_packet(
        &self,
        value: PacketValue,
        participant_identity: impl Into<String>,
        destination_identities: Vec<String>,
        kind: DataPacketKind,
    ) -> Result<()> {
        Negotiation(self.inner.clone())
            .ensure_publisher_connected(true)
            .await?;
        self.inner
            .data_plane
            .publish(value, participant_identity.into(), destination_identities, kind)
            .await
    }

    pub async fn publish_rpc_request(
        &self,
        destination_identities: Vec<String>,
        id: String,
        method: String,
        payload: String,
        response_timeout_ms: u32,
        version: u32,
    ) -> Result<()> {
        Negotiation(self.inner.clone())
            .ensure_publisher_connected(true)
            .await?;
        self.inner
            .data_plane
            .publish_rpc_request(destination_identities, id, method, payload, response_timeout_ms, version)
            .await
    }

    pub async fn publish_rpc_ack(
        &self,
        destination_identities: Vec<String>,
        request_id: String,
    ) -> Result<()> {
        Negotiation(self.inner.clone())
            .ensure_publisher_connected(true)
            .await?;
        self.inner
            .data_plane
            .publish_rpc_ack(destination_identities, request_id)
            .await
    }

    pub async fn publish_rpc_response(
        &self,
        destination_identities: Vec<String>,
        request_id: String,
        payload: Option<String>,
        error: Option<RpcError>,
    ) -> Result<()> {
        Negotiation(self.inner.clone())
            .ensure_publisher_connected(true)
            .await?;
        self.inner
            .data_plane
            .publish_rpc_response(destination_identities, request_id, payload, error)
            .await
    }

    pub async fn publish_stream_header(
        &self,
        destination_identities: Vec<String>,
        header: StreamHeaderPacket,
    ) -> Result<()> {
        Negotiation(self.inner.clone())
            .ensure_publisher_connected(true)
            .await?;
        self.inner
            .data_plane
            .publish_stream_header(destination_identities, header)
            .await
    }

    pub async fn publish_stream_chunk(
        &self,
        destination_identities: Vec<String>,
        chunk: StreamChunkPacket,
    ) -> Result<()> {
        Negotiation(self.inner.clone())
            .ensure_publisher_connected(true)
            .await?;
        self.inner
            .data_plane
            .publish_stream_chunk(destination_identities, chunk)
            .await
    }

    pub async fn publish_stream_trailer(
        &self,
        destination_identities: Vec<String>,
        stream_id: String,
        reason: Option<String>,
    ) -> Result<()> {
        Negotiation(self.inner.clone())
            .ensure_publisher_connected(true)
            .await?;
        self.inner
            .data_plane
            .publish_stream_trailer(destination_identities, stream_id, reason)
            .await
    }

    pub async fn is_buffer_status_low(&self, kind: DataPacketKind) -> bool {
        self.inner.data_plane.is_buffer_status_low(kind).await
    }

    pub async fn wait_for_buffer_status_low(&self, kind: DataPacketKind) {
        self.inner.data_plane.wait_for_buffer_status_low(kind).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{ClientConfiguration, IceCandidateInit, JoinResponse};
    use crate::transport::{DataChannelHandle, DataChannelInit, DataChannelMessageHandler};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    #[derive(Debug)]
    struct FakeDataChannel {
        label: String,
    }

    #[async_trait]
    impl DataChannelHandle for FakeDataChannel {
        fn label(&self) -> &str {
            &self.label
        }
        async fn send_text(&self, _data: &str) -> Result<()> {
            Ok(())
        }
        async fn send_binary(&self, _data: &[u8]) -> Result<()> {
            Ok(())
        }
        fn buffered_amount(&self) -> usize {
            0
        }
        fn set_message_handler(&self, _handler: DataChannelMessageHandler) {}
    }

    struct FakeTransport {
        role: TransportRole,
        state: StdMutex<IceConnectionState>,
    }

    #[async_trait]
    impl PCTransport for FakeTransport {
        fn role(&self) -> TransportRole {
            self.role
        }
        fn set_event_sink(&self, _sink: Arc<dyn PCTransportEventSink>) {}
        fn ice_connection_state(&self) -> IceConnectionState {
            *self.state.lock().unwrap()
        }
        async fn create_offer(&self, _ice_restart: bool) -> Result<SessionDescription> {
            Ok(SessionDescription {
                sdp: "offer".to_string(),
            })
        }
        async fn create_answer(&self) -> Result<SessionDescription> {
            Ok(SessionDescription {
                sdp: "answer".to_string(),
            })
        }
        async fn set_local_description(&self, _desc: SessionDescription) -> Result<()> {
            Ok(())
        }
        async fn set_remote_description(&self, _desc: SessionDescription) -> Result<()> {
            Ok(())
        }
        async fn add_ice_candidate(&self, _candidate: IceCandidateInit) -> Result<()> {
            Ok(())
        }
        async fn set_configuration(&self, _config: RtcConfiguration) -> Result<()> {
            Ok(())
        }
        async fn create_data_channel(
            &self,
            label: &str,
            _init: DataChannelInit,
        ) -> Result<Arc<dyn DataChannelHandle>> {
            Ok(Arc::new(FakeDataChannel {
                label: label.to_string(),
            }))
        }
        async fn close(&self) {
            *self.state.lock().unwrap() = IceConnectionState::Closed;
        }
    }

    impl FakeTransport {
        fn connected(role: TransportRole) -> Arc<Self> {
            Arc::new(Self {
                role,
                state: StdMutex::new(IceConnectionState::Connected),
            })
        }
    }

    struct FakeTransportFactory {
        publisher: Arc<FakeTransport>,
        subscriber: Arc<FakeTransport>,
    }

    #[async_trait]
    impl PCTransportFactory for FakeTransportFactory {
        async fn create_publisher(
            &self,
            _config: RtcConfiguration,
            _options: PublisherTransportOptions,
        ) -> Result<Arc<dyn PCTransport>> {
            Ok(self.publisher.clone())
        }
        async fn create_subscriber(
            &self,
            _config: RtcConfiguration,
            _options: SubscriberTransportOptions,
        ) -> Result<Arc<dyn PCTransport>> {
            Ok(self.subscriber.clone())
        }
    }

    struct FakeSignalClient {
        started: AtomicBool,
        join_calls: AtomicUsize,
        subscriber_primary: bool,
        fast_publish: bool,
    }

    #[async_trait]
    impl SignalClient for FakeSignalClient {
        async fn join(&self, _ctx: &JoinContext) -> Result<JoinResponse> {
            self.join_calls.fetch_add(1, Ordering::SeqCst);
            Ok(JoinResponse {
                participant_sid: "PA_test".to_string(),
                ice_servers: vec![],
                subscriber_primary: self.subscriber_primary,
                fast_publish: self.fast_publish,
                client_configuration: ClientConfiguration::default(),
                server_version: None,
            })
        }
        async fn start(&self) -> Result<()> {
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn close(&self) {
            self.started.store(false, Ordering::SeqCst);
        }
        async fn send_offer(&self, _offer: SessionDescription) -> Result<()> {
            Ok(())
        }
        async fn send_answer(&self, _answer: SessionDescription) -> Result<()> {
            Ok(())
        }
        async fn send_ice_candidate(
            &self,
            _candidate: IceCandidateInit,
            _target: SignalTarget,
        ) -> Result<()> {
            Ok(())
        }
        async fn send_leave_with_reason(&self, _reason: WireLeaveReason) -> Result<()> {
            Ok(())
        }
        async fn reconnect(
            &self,
            _url: &str,
            _token: &str,
            _params: &ConnectionParams,
            _participant_sid: &str,
        ) -> Result<Option<Vec<IceServer>>> {
            Ok(None)
        }
        fn is_started(&self) -> bool {
            self.started.load(Ordering::SeqCst)
        }
        fn set_logger(&self, _target: &str) {}
        fn set_event_sink(&self, _sink: Arc<dyn SignalEventSink>) {}
    }

    fn test_engine(subscriber_primary: bool, fast_publish: bool) -> Engine {
        let factory = Arc::new(FakeTransportFactory {
            publisher: FakeTransport::connected(TransportRole::Publisher),
            subscriber: FakeTransport::connected(TransportRole::Subscriber),
        });
        let signal = Arc::new(FakeSignalClient {
            started: AtomicBool::new(false),
            join_calls: AtomicUsize::new(0),
            subscriber_primary,
            fast_publish,
        });
        Engine::builder()
            .signal_client(signal)
            .transport_factory(factory)
            .build()
    }

    #[test_log::test(tokio::test)]
    async fn join_publisher_primary_reaches_connected() {
        let engine = test_engine(false, false);
        let response = engine
            .join("wss://example", "tok", ConnectionParams::default())
            .await
            .unwrap();
        assert!(!response.subscriber_primary);
        assert!(engine.is_connected().await);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_drains_handlers_once() {
        let engine = test_engine(false, false);
        engine
            .join("wss://example", "tok", ConnectionParams::default())
            .await
            .unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let count = count.clone();
            engine
                .on_close(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                })
                .await;
        }
        engine.close().await;
        engine.close().await;
        engine.close().await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn handle_disconnect_before_has_connected_is_a_no_op() {
        let engine = test_engine(false, false);
        ReconnectController(engine.inner.clone())
            .handle_disconnect(false)
            .await;
        assert!(!engine.inner.reconnecting.load(Ordering::SeqCst));
    }

    #[test_log::test(tokio::test)]
    async fn resume_path_succeeds_without_restarting() {
        let engine = test_engine(false, false);
        engine
            .join("wss://example", "tok", ConnectionParams::default())
            .await
            .unwrap();
        ReconnectController(engine.inner.clone())
            .handle_disconnect(false)
            .await;
        // Both fakes stay "connected" and signaling succeeds unconditionally, so
        // a soft reconnect resolves on its first iteration and never escalates
        // to a second `join` call.
        assert!(!engine.inner.reconnecting.load(Ordering::SeqCst));
        assert!(!engine.inner.requires_full_reconnect.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn escalation_during_an_in_flight_reconnect_sets_requires_full_reconnect() {
        let engine = test_engine(false, false);
        engine
            .join("wss://example", "tok", ConnectionParams::default())
            .await
            .unwrap();
        // Simulate another reconnect attempt already in flight: the second
        // caller's full-reconnect demand must be recorded for that attempt's
        // next iteration rather than starting a second attempt of its own.
        engine.inner.reconnecting.store(true, Ordering::SeqCst);
        ReconnectController(engine.inner.clone())
            .handle_disconnect(true)
            .await;
        assert!(engine.inner.requires_full_reconnect.load(Ordering::SeqCst));
        // The in-flight attempt (simulated here, not actually running) is
        // untouched by the second caller.
        assert!(engine.inner.reconnecting.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn configure_resets_sequence_counter() {
        let engine = test_engine(false, false);
        engine
            .join("wss://example", "tok", ConnectionParams::default())
            .await
            .unwrap();
        assert_eq!(engine.inner.data_plane.sequence_for_test().await, 1);
    }
}
