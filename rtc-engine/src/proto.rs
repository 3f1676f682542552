//! Protocol message types.
//!
//! These are "external, assumed available" wire types, defined locally only so the
//! engine's module boundaries compile and can be tested in isolation. The engine
//! never invents semantics for these; it decodes/encodes them and dispatches on
//! their tags.
//!
//! Text frames decode with the JSON encoding (`serde_json`); binary frames decode with
//! the compact binary encoding (`bincode`).

use serde::{Deserialize, Serialize};

/// Which of the two peer connections a trickled candidate or negotiation message
/// targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalTarget {
    Publisher,
    Subscriber,
}

/// A single ICE server entry, as returned in the join response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// Server-side policy overrides delivered alongside the join response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfiguration {
    /// When true, the ICE transport policy must be forced to relay-only
    /// regardless of what the caller requested.
    pub force_relay: bool,
}

/// The response to a signaling `Join` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResponse {
    pub participant_sid: String,
    pub ice_servers: Vec<IceServer>,
    pub subscriber_primary: bool,
    pub fast_publish: bool,
    pub client_configuration: ClientConfiguration,
    pub server_version: Option<String>,
}

/// A candidate trickled over signaling, targeting one of the two transports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrickleRequest {
    pub candidate: Option<IceCandidateInit>,
    pub target: SignalTarget,
}

/// Mirrors the browser/WebRTC `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidateInit {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_m_line_index: Option<u16>,
}

/// An SDP offer or answer, opaque to the engine beyond its `sdp` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
}

/// Action requested by a `LeaveRequest` pushed from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaveAction {
    Disconnect,
    Reconnect,
    Resume,
    /// Anything else the server might send; always ignored.
    Other,
}

/// The raw reason code carried on the wire; mapped to [`DisconnectReason`] by
/// [`map_reason`] before being surfaced to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireLeaveReason {
    Unknown,
    ClientInitiated,
    ServerInitiated,
    DuplicateIdentity,
    ServerShutdown,
    ParticipantRemoved,
    RoomDeleted,
    StateMismatch,
    JoinFailure,
    Reconnecting,
    SignalingConnectionFailure,
    RoomClosed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaveRequest {
    pub action: LeaveAction,
    pub reason: WireLeaveReason,
}

/// The reason surfaced to callers via `OnDisconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    ClientInitiated,
    ServerInitiated,
    DuplicateIdentity,
    ServerShutdown,
    ParticipantRemoved,
    RoomDeleted,
    StateMismatch,
    JoinFailure,
    Reconnecting,
    SignalingConnectionFailure,
    RoomClosed,
    /// Emitted when the reconnect loop exhausts its attempts.
    Failed,
    Unknown,
}

pub fn map_reason(reason: WireLeaveReason) -> DisconnectReason {
    match reason {
        WireLeaveReason::Unknown => DisconnectReason::Unknown,
        WireLeaveReason::ClientInitiated => DisconnectReason::ClientInitiated,
        WireLeaveReason::ServerInitiated => DisconnectReason::ServerInitiated,
        WireLeaveReason::DuplicateIdentity => DisconnectReason::DuplicateIdentity,
        WireLeaveReason::ServerShutdown => DisconnectReason::ServerShutdown,
        WireLeaveReason::ParticipantRemoved => DisconnectReason::ParticipantRemoved,
        WireLeaveReason::RoomDeleted => DisconnectReason::RoomDeleted,
        WireLeaveReason::StateMismatch => DisconnectReason::StateMismatch,
        WireLeaveReason::JoinFailure => DisconnectReason::JoinFailure,
        WireLeaveReason::Reconnecting => DisconnectReason::Reconnecting,
        WireLeaveReason::SignalingConnectionFailure => {
            DisconnectReason::SignalingConnectionFailure
        }
        WireLeaveReason::RoomClosed => DisconnectReason::RoomClosed,
    }
}

/// A single user-to-user payload, unwrapped of its outer packet envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserDataPacket {
    pub payload: Vec<u8>,
    pub topic: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPacket {
    pub participant_identity: String,
    pub destination_identities: Vec<String>,
    pub payload: Vec<u8>,
    pub topic: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SipDtmfPacket {
    pub code: u32,
    pub digit: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionSegment {
    pub id: String,
    pub text: String,
    pub language: Option<String>,
    pub is_final: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionPacket {
    pub transcribed_participant_identity: String,
    pub track_id: String,
    pub segments: Vec<TranscriptionSegment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequestPacket {
    pub id: String,
    pub method: String,
    pub payload: String,
    pub response_timeout_ms: u32,
    pub version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcAckPacket {
    pub request_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: u32,
    pub message: String,
    pub data: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponsePacket {
    pub request_id: String,
    pub payload: Option<String>,
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamHeaderPacket {
    pub stream_id: String,
    pub mime_type: String,
    pub topic: String,
    pub total_length: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunkPacket {
    pub stream_id: String,
    pub chunk_index: u64,
    pub content: Vec<u8>,
    pub complete: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamTrailerPacket {
    pub stream_id: String,
    pub reason: Option<String>,
}

/// The tagged variant carried over a data channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PacketValue {
    User(UserPacket),
    SipDtmf(SipDtmfPacket),
    Transcription(TranscriptionPacket),
    RpcRequest(RpcRequestPacket),
    RpcAck(RpcAckPacket),
    RpcResponse(RpcResponsePacket),
    StreamHeader(StreamHeaderPacket),
    StreamChunk(StreamChunkPacket),
    StreamTrailer(StreamTrailerPacket),
}

/// The full packet envelope, including the monotonic reliable-sequence stamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPacket {
    /// Set by the publishing side only for reliable sends; 0 for lossy.
    pub sequence: u32,
    /// Outer participant identity, used as a fallback when a variant's own
    /// identity field is empty, for backward compatibility with older senders.
    pub participant_identity: String,
    pub destination_identities: Vec<String>,
    pub value: PacketValue,
}

impl DataPacket {
    /// Decodes a text data-channel frame. A tag this build doesn't recognize (or
    /// any other malformed input) is surfaced as an `Err`; every caller in
    /// `data_plane.rs` treats that `Err` as "ignore and keep reading" — the
    /// engine never aborts a connection over a single bad inbound packet.
    pub fn decode_text(text: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn decode_binary(bytes: &[u8]) -> crate::error::Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    pub fn encode_text(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn encode_binary(&self) -> crate::error::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }
}

/// Opaque room/participant protocol updates.
///
/// Their full schemas belong to the room/participant model above this engine —
/// media track plumbing is out of scope here; the engine only routes them to
/// the caller's callbacks unexamined, so a `Value` passthrough is all the
/// connection-lifecycle layer needs.
pub mod room {
    use serde::{Deserialize, Serialize};

    macro_rules! opaque_update {
        ($name:ident) => {
            #[derive(Debug, Clone, Serialize, Deserialize)]
            pub struct $name(pub serde_json::Value);
        };
    }

    opaque_update!(ParticipantUpdate);
    opaque_update!(SpeakerUpdate);
    opaque_update!(RoomUpdate);
    opaque_update!(RoomMovedUpdate);
    opaque_update!(ConnectionQualityUpdate);
    opaque_update!(SubscribedQualityUpdate);
    opaque_update!(LocalTrackPublishedUpdate);
    opaque_update!(LocalTrackUnpublishedUpdate);
    opaque_update!(TrackRemoteMutedUpdate);
    opaque_update!(LocalTrackSubscribedUpdate);
    opaque_update!(MediaTrackEvent);
}

/// Envelope for messages the client sends to the signaling server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientMessage {
    Join { token: String },
    Offer(SessionDescription),
    Answer(SessionDescription),
    Trickle(TrickleRequest),
    Leave { reason: WireLeaveReason },
}

/// Envelope for messages the signaling server pushes to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerMessage {
    Joined(JoinResponse),
    Answer(SessionDescription),
    Offer(SessionDescription),
    Trickle(TrickleRequest),
    ParticipantUpdate(room::ParticipantUpdate),
    SpeakersChanged(room::SpeakerUpdate),
    ConnectionQuality(room::ConnectionQualityUpdate),
    RoomUpdate(room::RoomUpdate),
    RoomMoved(room::RoomMovedUpdate),
    Leave(LeaveRequest),
    TokenRefresh(String),
    LocalTrackPublished(room::LocalTrackPublishedUpdate),
    LocalTrackUnpublished(room::LocalTrackUnpublishedUpdate),
    TrackRemoteMuted(room::TrackRemoteMutedUpdate),
    LocalTrackSubscribed(room::LocalTrackSubscribedUpdate),
    SubscribedQualityUpdate(room::SubscribedQualityUpdate),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_packet_round_trips_through_json() {
        let packet = DataPacket {
            sequence: 7,
            participant_identity: "alice".to_string(),
            destination_identities: vec![],
            value: PacketValue::User(UserPacket {
                participant_identity: String::new(),
                destination_identities: vec![],
                payload: b"hello".to_vec(),
                topic: Some("chat".to_string()),
            }),
        };
        let text = packet.encode_text().unwrap();
        let decoded = DataPacket::decode_text(&text).unwrap();
        assert_eq!(decoded.sequence, 7);
        assert_eq!(decoded.participant_identity, "alice");
    }

    #[test]
    fn user_packet_round_trips_through_binary() {
        let packet = DataPacket {
            sequence: 3,
            participant_identity: "bob".to_string(),
            destination_identities: vec!["carol".to_string()],
            value: PacketValue::SipDtmf(SipDtmfPacket {
                code: 1,
                digit: "1".to_string(),
            }),
        };
        let bytes = packet.encode_binary().unwrap();
        let decoded = DataPacket::decode_binary(&bytes).unwrap();
        assert_eq!(decoded.destination_identities, vec!["carol".to_string()]);
    }

    #[test]
    fn decode_failure_is_an_error_not_a_panic() {
        assert!(DataPacket::decode_text("not json").is_err());
        assert!(DataPacket::decode_binary(&[0xff, 0x00]).is_err());
    }
}
