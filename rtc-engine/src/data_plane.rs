//! The data-plane multiplexer.
//!
//! Owns the two publisher-side data channels, observes the two subscriber-side
//! channels, sequences reliable sends, and decodes inbound packets into the
//! callback surface. The "single writer" constraint on the reliable sequence
//! counter is expressed as a lock held across stamp → serialize → send rather
//! than a dedicated draining task, since sends here are caller-driven rather
//! than queue-driven.

use crate::callbacks::{DataPacketPayload, EngineCallbacks, RpcRequestArgs, RpcResponseArgs};
use crate::config::{
    BUFFER_STATUS_POLL_INTERVAL, LOSSY_DATA_CHANNEL_LABEL, LOSSY_MAX_RETRANSMITS,
    RELIABLE_DATA_CHANNEL_LABEL,
};
use crate::error::{EngineError, Result};
use crate::proto::{
    DataPacket, PacketValue, RpcAckPacket, RpcError, RpcRequestPacket, RpcResponsePacket,
    StreamChunkPacket, StreamHeaderPacket, StreamTrailerPacket, UserDataPacket,
};
use crate::transport::{DataChannelHandle, DataChannelInit, PCTransport};
use log::*;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Which of the two named channels a packet travels over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataPacketKind {
    Reliable,
    Lossy,
}

#[derive(Default)]
struct DataChannelSlots {
    reliable_dc: Option<Arc<dyn DataChannelHandle>>,
    lossy_dc: Option<Arc<dyn DataChannelHandle>>,
    reliable_dc_sub: Option<Arc<dyn DataChannelHandle>>,
    lossy_dc_sub: Option<Arc<dyn DataChannelHandle>>,
}

pub struct DataPlane {
    /// Shared/exclusive guard over the four channel slots. Readers (send-path
    /// lookups) take the shared side.
    dc_lock: RwLock<DataChannelSlots>,
    /// Serializes stamp → serialize → send for every reliable publish. The
    /// guarded value *is* the reliable sequence counter itself,
    /// so acquiring the lock and reading the counter are the same operation.
    reliable_seq: Mutex<u32>,
    callbacks: Arc<RwLock<EngineCallbacks>>,
    low_buffer_threshold_bytes: usize,
}

impl DataPlane {
    pub fn new(callbacks: Arc<RwLock<EngineCallbacks>>, low_buffer_threshold_bytes: usize) -> Self {
        Self {
            dc_lock: RwLock::new(DataChannelSlots::default()),
            reliable_seq: Mutex::new(1),
            callbacks,
            low_buffer_threshold_bytes,
        }
    }

    /// Resets the reliable sequence counter to 1, invoked by `Configure`.
    /// Takes the same lock a reliable send would, so a reset can never
    /// interleave with an in-flight stamp → serialize → send.
    pub async fn reset_sequence(&self) {
        *self.reliable_seq.lock().await = 1;
    }

    #[cfg(test)]
    pub(crate) async fn sequence_for_test(&self) -> u32 {
        *self.reliable_seq.lock().await
    }

    /// Drops all four channel slots, via `Configure` closing the old
    /// publisher/subscriber first.
    pub async fn clear_channels(&self) {
        let mut slots = self.dc_lock.write().await;
        *slots = DataChannelSlots::default();
    }

    /// Creates the publisher-side channels, lossy first then reliable. Both
    /// get the same inbound message handler wired through `self`.
    pub async fn create_publisher_channels(
        self: &Arc<Self>,
        transport: &dyn PCTransport,
    ) -> Result<()> {
        let lossy = transport
            .create_data_channel(
                LOSSY_DATA_CHANNEL_LABEL,
                DataChannelInit {
                    ordered: false,
                    max_retransmits: Some(LOSSY_MAX_RETRANSMITS),
                },
            )
            .await?;
        let reliable = transport
            .create_data_channel(
                RELIABLE_DATA_CHANNEL_LABEL,
                DataChannelInit {
                    ordered: true,
                    max_retransmits: None,
                },
            )
            .await?;
        self.wire_inbound_decoder(&lossy);
        self.wire_inbound_decoder(&reliable);
        let mut slots = self.dc_lock.write().await;
        slots.lossy_dc = Some(lossy);
        slots.reliable_dc = Some(reliable);
        debug!("publisher data channels created: {RELIABLE_DATA_CHANNEL_LABEL}, {LOSSY_DATA_CHANNEL_LABEL}");
        Ok(())
    }

    /// Routes a subscriber-received data channel into its slot by label.
    /// Unknown labels are ignored.
    pub async fn set_subscriber_channel(
        self: &Arc<Self>,
        label: &str,
        handle: Arc<dyn DataChannelHandle>,
    ) {
        self.wire_inbound_decoder(&handle);
        let mut slots = self.dc_lock.write().await;
        match label {
            RELIABLE_DATA_CHANNEL_LABEL => slots.reliable_dc_sub = Some(handle),
            LOSSY_DATA_CHANNEL_LABEL => slots.lossy_dc_sub = Some(handle),
            other => warn!("ignoring subscriber data channel with unknown label {other:?}"),
        }
    }

    /// Installs the shared inbound-message handler; both publisher and
    /// subscriber channels receive the same one. The handler is a plain
    /// synchronous callback, so decoding/dispatch — which needs `.await` for
    /// the callback-lookup lock — runs in a spawned task.
    fn wire_inbound_decoder(self: &Arc<Self>, channel: &Arc<dyn DataChannelHandle>) {
        let plane = self.clone();
        channel.set_message_handler(Box::new(move |bytes, is_text| {
            let plane = plane.clone();
            tokio::spawn(async move {
                plane.decode_and_dispatch(&bytes, is_text).await;
            });
        }));
    }

    /// Decodes an inbound data-channel frame and dispatches it to the
    /// installed callbacks. Decode failures and unknown tags are silently
    /// ignored — the engine never aborts a connection over a single
    /// malformed peer packet.
    pub async fn decode_and_dispatch(&self, data: &[u8], is_text: bool) {
        let packet = if is_text {
            let text = match std::str::from_utf8(data) {
                Ok(t) => t,
                Err(_) => return,
            };
            DataPacket::decode_text(text)
        } else {
            DataPacket::decode_binary(data)
        };
        let packet = match packet {
            Ok(p) => p,
            Err(e) => {
                trace!("ignoring malformed inbound data packet: {e}");
                return;
            }
        };
        self.dispatch(packet).await;
    }

    async fn dispatch(&self, mut packet: DataPacket) {
        let outer_identity = packet.participant_identity.clone();
        let outer_destinations = packet.destination_identities.clone();
        let callbacks = self.callbacks.read().await.clone();
        match &mut packet.value {
            PacketValue::User(user) => {
                let identity = if outer_identity.is_empty() {
                    user.participant_identity.clone()
                } else {
                    outer_identity.clone()
                };
                if user.participant_identity.is_empty() {
                    user.participant_identity = outer_identity.clone();
                }
                if user.destination_identities.is_empty() {
                    user.destination_identities = outer_destinations;
                }
                if let Some(cb) = &callbacks.on_data_received {
                    cb(user.clone());
                }
                if let Some(cb) = &callbacks.on_data_packet {
                    cb((
                        identity,
                        DataPacketPayload::User(UserDataPacket {
                            payload: user.payload.clone(),
                            topic: user.topic.clone(),
                        }),
                    ));
                }
            }
            PacketValue::SipDtmf(dtmf) => {
                if let Some(cb) = &callbacks.on_data_packet {
                    cb((outer_identity, DataPacketPayload::SipDtmf(dtmf.clone())));
                }
            }
            PacketValue::Transcription(t) => {
                if let Some(cb) = &callbacks.on_transcription {
                    cb(t.clone());
                }
            }
            PacketValue::RpcRequest(req) => {
                if let Some(cb) = &callbacks.on_rpc_request {
                    cb(RpcRequestArgs {
                        caller_identity: outer_identity,
                        request_id: req.id.clone(),
                        method: req.method.clone(),
                        payload: req.payload.clone(),
                        response_timeout_ms: req.response_timeout_ms,
                        version: req.version,
                    });
                }
            }
            PacketValue::RpcAck(ack) => {
                if let Some(cb) = &callbacks.on_rpc_ack {
                    cb(ack.request_id.clone());
                }
            }
            PacketValue::RpcResponse(resp) => {
                if let Some(cb) = &callbacks.on_rpc_response {
                    cb(RpcResponseArgs {
                        request_id: resp.request_id.clone(),
                        payload: resp.payload.clone(),
                        error: resp.error.clone(),
                    });
                }
            }
            PacketValue::StreamHeader(header) => {
                if let Some(cb) = &callbacks.on_stream_header {
                    cb((outer_identity, header.clone()));
                }
            }
            PacketValue::StreamChunk(chunk) => {
                if let Some(cb) = &callbacks.on_stream_chunk {
                    cb(chunk.clone());
                }
            }
            PacketValue::StreamTrailer(trailer) => {
                if let Some(cb) = &callbacks.on_stream_trailer {
                    cb(trailer.clone());
                }
            }
        }
    }

    async fn channel_for_send(&self, kind: DataPacketKind) -> Result<Arc<dyn DataChannelHandle>> {
        let slots = self.dc_lock.read().await;
        let handle = match kind {
            DataPacketKind::Reliable => slots.reliable_dc.clone(),
            DataPacketKind::Lossy => slots.lossy_dc.clone(),
        };
        handle.ok_or(EngineError::DataChannelNotFound(kind))
    }

    /// The core outbound path; any connection-readiness gate is already
    /// applied by the caller. Reliable sends stamp a sequence number under
    /// `reliable_seq`, holding the lock across serialize and send so wire
    /// order equals sequence order.
    pub async fn publish(
        &self,
        value: PacketValue,
        participant_identity: String,
        destination_identities: Vec<String>,
        kind: DataPacketKind,
    ) -> Result<()> {
        let channel = self.channel_for_send(kind).await?;
        match kind {
            DataPacketKind::Reliable => {
                let mut seq = self.reliable_seq.lock().await;
                let packet = DataPacket {
                    sequence: *seq,
                    participant_identity,
                    destination_identities,
                    value,
                };
                let bytes = packet.encode_binary()?;
                channel.send_binary(&bytes).await?;
                *seq += 1;
                trace!("sent reliable data packet, sequence={}", packet.sequence);
                Ok(())
            }
            DataPacketKind::Lossy => {
                let packet = DataPacket {
                    sequence: 0,
                    participant_identity,
                    destination_identities,
                    value,
                };
                let bytes = packet.encode_binary()?;
                channel.send_binary(&bytes).await
            }
        }
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
        self.publish(
            PacketValue::RpcRequest(RpcRequestPacket {
                id,
                method,
                payload,
                response_timeout_ms,
                version,
            }),
            String::new(),
            destination_identities,
            DataPacketKind::Reliable,
        )
        .await
    }

    pub async fn publish_rpc_ack(
        &self,
        destination_identities: Vec<String>,
        request_id: String,
    ) -> Result<()> {
        self.publish(
            PacketValue::RpcAck(RpcAckPacket { request_id }),
            String::new(),
            destination_identities,
            DataPacketKind::Reliable,
        )
        .await
    }

    /// Exactly one of `payload`/`error` travels on the wire; a `None` payload
    /// becomes the empty string to preserve wire compatibility.
    pub async fn publish_rpc_response(
        &self,
        destination_identities: Vec<String>,
        request_id: String,
        payload: Option<String>,
        error: Option<RpcError>,
    ) -> Result<()> {
        self.publish(
            PacketValue::RpcResponse(RpcResponsePacket {
                request_id,
                payload: if error.is_some() {
                    None
                } else {
                    Some(payload.unwrap_or_default())
                },
                error,
            }),
            String::new(),
            destination_identities,
            DataPacketKind::Reliable,
        )
        .await
    }

    pub async fn publish_stream_header(
        &self,
        destination_identities: Vec<String>,
        header: StreamHeaderPacket,
    ) -> Result<()> {
        self.publish(
            PacketValue::StreamHeader(header),
            String::new(),
            destination_identities,
            DataPacketKind::Reliable,
        )
        .await
    }

    pub async fn publish_stream_chunk(
        &self,
        destination_identities: Vec<String>,
        chunk: StreamChunkPacket,
    ) -> Result<()> {
        self.publish(
            PacketValue::StreamChunk(chunk),
            String::new(),
            destination_identities,
            DataPacketKind::Reliable,
        )
        .await
    }

    pub async fn publish_stream_trailer(
        &self,
        destination_identities: Vec<String>,
        stream_id: String,
        reason: Option<String>,
    ) -> Result<()> {
        self.publish(
            PacketValue::StreamTrailer(StreamTrailerPacket { stream_id, reason }),
            String::new(),
            destination_identities,
            DataPacketKind::Reliable,
        )
        .await
    }

    /// True when the channel's buffered byte count is at or below the
    /// low-water mark.
    pub async fn is_buffer_status_low(&self, kind: DataPacketKind) -> bool {
        let slots = self.dc_lock.read().await;
        let handle = match kind {
            DataPacketKind::Reliable => &slots.reliable_dc,
            DataPacketKind::Lossy => &slots.lossy_dc,
        };
        match handle {
            Some(h) => h.buffered_amount() <= self.low_buffer_threshold_bytes,
            None => true,
        }
    }

    /// Polls `is_buffer_status_low` at a fixed interval until it is true.
    pub async fn wait_for_buffer_status_low(&self, kind: DataPacketKind) {
        while !self.is_buffer_status_low(kind).await {
            tokio::time::sleep(BUFFER_STATUS_POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{SipDtmfPacket, UserPacket};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct FakeChannel {
        label: String,
        sent: Mutex<Vec<Vec<u8>>>,
        buffered: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl DataChannelHandle for FakeChannel {
        fn label(&self) -> &str {
            &self.label
        }
        async fn send_text(&self, data: &str) -> Result<()> {
            self.sent.lock().await.push(data.as_bytes().to_vec());
            Ok(())
        }
        async fn send_binary(&self, data: &[u8]) -> Result<()> {
            self.sent.lock().await.push(data.to_vec());
            Ok(())
        }
        fn buffered_amount(&self) -> usize {
            self.buffered.load(Ordering::SeqCst)
        }
        fn set_message_handler(&self, _handler: crate::transport::DataChannelMessageHandler) {}
    }

    fn fake_channel(label: &str) -> Arc<FakeChannel> {
        Arc::new(FakeChannel {
            label: label.to_string(),
            sent: Mutex::new(Vec::new()),
            buffered: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn publish_without_channel_fails_with_data_channel_not_found() {
        let plane = DataPlane::new(Arc::new(RwLock::new(EngineCallbacks::default())), 4096);
        let err = plane
            .publish(
                PacketValue::RpcAck(RpcAckPacket {
                    request_id: "r1".to_string(),
                }),
                String::new(),
                vec![],
                DataPacketKind::Reliable,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DataChannelNotFound(DataPacketKind::Reliable)));
    }

    #[tokio::test]
    async fn reliable_publishes_sequence_strictly_increasing() {
        let plane = DataPlane::new(Arc::new(RwLock::new(EngineCallbacks::default())), 4096);
        let channel = fake_channel(RELIABLE_DATA_CHANNEL_LABEL);
        {
            let mut slots = plane.dc_lock.write().await;
            slots.reliable_dc = Some(channel.clone());
        }
        for _ in 0..5 {
            plane
                .publish(
                    PacketValue::RpcAck(RpcAckPacket {
                        request_id: "r".to_string(),
                    }),
                    String::new(),
                    vec![],
                    DataPacketKind::Reliable,
                )
                .await
                .unwrap();
        }
        let sent = channel.sent.lock().await;
        let sequences: Vec<u32> = sent
            .iter()
            .map(|bytes| DataPacket::decode_binary(bytes).unwrap().sequence)
            .collect();
        assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn concurrent_reliable_publishes_produce_a_contiguous_wire_order() {
        let plane = Arc::new(DataPlane::new(
            Arc::new(RwLock::new(EngineCallbacks::default())),
            4096,
        ));
        let channel = fake_channel(RELIABLE_DATA_CHANNEL_LABEL);
        {
            let mut slots = plane.dc_lock.write().await;
            slots.reliable_dc = Some(channel.clone());
        }
        let tasks: Vec<_> = (0..100)
            .map(|i| {
                let plane = plane.clone();
                tokio::spawn(async move {
                    plane
                        .publish(
                            PacketValue::RpcAck(RpcAckPacket {
                                request_id: format!("r{i}"),
                            }),
                            String::new(),
                            vec![],
                            DataPacketKind::Reliable,
                        )
                        .await
                        .unwrap();
                })
            })
            .collect();
        futures::future::join_all(tasks).await;

        let sent = channel.sent.lock().await;
        assert_eq!(sent.len(), 100);
        let sequences: Vec<u32> = sent
            .iter()
            .map(|bytes| DataPacket::decode_binary(bytes).unwrap().sequence)
            .collect();
        // Holding reliable_seq across stamp -> serialize -> send guarantees wire
        // order equals sequence order, regardless of the order 100 concurrent
        // tasks were scheduled in.
        let expected: Vec<u32> = (1..=100).collect();
        assert_eq!(sequences, expected);
    }

    #[tokio::test]
    async fn configure_resets_sequence_to_one() {
        let plane = DataPlane::new(Arc::new(RwLock::new(EngineCallbacks::default())), 4096);
        *plane.reliable_seq.lock().await = 42;
        plane.reset_sequence().await;
        assert_eq!(*plane.reliable_seq.lock().await, 1);
    }

    #[tokio::test]
    async fn user_packet_backward_compat_fallback_fills_identity() {
        let called_data_received: Arc<std::sync::Mutex<Option<UserPacket>>> =
            Arc::new(std::sync::Mutex::new(None));
        let called_data_packet: Arc<std::sync::Mutex<Option<String>>> =
            Arc::new(std::sync::Mutex::new(None));
        let mut callbacks = EngineCallbacks::new();
        let c1 = called_data_received.clone();
        callbacks.set_on_data_received(move |p: UserPacket| {
            *c1.lock().unwrap() = Some(p);
        });
        let c2 = called_data_packet.clone();
        callbacks.set_on_data_packet(move |(identity, _payload)| {
            *c2.lock().unwrap() = Some(identity);
        });
        let plane = DataPlane::new(Arc::new(RwLock::new(callbacks)), 4096);
        let packet = DataPacket {
            sequence: 0,
            participant_identity: "alice".to_string(),
            destination_identities: vec![],
            value: PacketValue::User(UserPacket {
                participant_identity: String::new(),
                destination_identities: vec![],
                payload: b"hi".to_vec(),
                topic: None,
            }),
        };
        plane.dispatch(packet).await;
        assert_eq!(
            called_data_received
                .lock()
                .unwrap()
                .as_ref()
                .unwrap()
                .participant_identity,
            "alice"
        );
        assert_eq!(called_data_packet.lock().unwrap().as_ref().unwrap(), "alice");
    }

    #[tokio::test]
    async fn sip_dtmf_routes_to_data_packet_only() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let mut callbacks = EngineCallbacks::new();
        callbacks.set_on_data_packet(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        let plane = DataPlane::new(Arc::new(RwLock::new(callbacks)), 4096);
        let packet = DataPacket {
            sequence: 0,
            participant_identity: "bob".to_string(),
            destination_identities: vec![],
            value: PacketValue::SipDtmf(SipDtmfPacket {
                code: 5,
                digit: "5".to_string(),
            }),
        };
        plane.dispatch(packet).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
