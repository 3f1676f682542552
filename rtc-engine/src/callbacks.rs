//! The public callback surface.
//!
//! An observer trait would also fit this shape, but a struct of optional
//! function values is preferred here: each field is independently nullable and
//! independently replaceable, which
//! keeps `Engine::new` free of a mandatory trait-object parameter and lets a
//! caller register only the handlers it cares about.
//!
//! None of these are invoked concurrently with their own assignment: callers
//! set a handler once (typically right after constructing the engine, before
//! `join`), and the engine only reads the slot afterward.

use crate::proto::{room, DisconnectReason, JoinResponse, RpcError};
use std::sync::Arc;

/// A boxed, thread-safe callback. `Arc` (not `Box`) so a snapshot of the
/// handler can be cloned out from under the holding lock before it's invoked,
/// matching the read-then-drop-lock-then-call discipline used throughout
/// `engine.rs` and `data_plane.rs`.
pub type Callback<Args> = Arc<dyn Fn(Args) + Send + Sync>;

macro_rules! callback_field {
    ($setter:ident, $field:ident, $args:ty) => {
        pub fn $setter(&mut self, f: impl Fn($args) + Send + Sync + 'static) {
            self.$field = Some(Arc::new(f));
        }
    };
}

/// Optional handlers a caller installs on [`crate::engine::Engine`]. Every
/// field defaults to `None`; calling the corresponding event is then a no-op.
#[derive(Default, Clone)]
pub struct EngineCallbacks {
    pub on_participant_update: Option<Callback<room::ParticipantUpdate>>,
    pub on_speakers_changed: Option<Callback<room::SpeakerUpdate>>,
    pub on_room_update: Option<Callback<room::RoomUpdate>>,
    pub on_room_moved: Option<Callback<room::RoomMovedUpdate>>,
    pub on_media_track: Option<Callback<room::MediaTrackEvent>>,

    /// Legacy data-received hook (`OnDataReceived`).
    pub on_data_received: Option<Callback<crate::proto::UserPacket>>,
    /// Unified data-packet hook: `(senderIdentity, payload)`.
    pub on_data_packet: Option<Callback<(String, DataPacketPayload)>>,
    pub on_transcription: Option<Callback<crate::proto::TranscriptionPacket>>,

    /// `(callerIdentity, requestId, method, payload, responseTimeoutMs, version)`
    pub on_rpc_request: Option<Callback<RpcRequestArgs>>,
    pub on_rpc_ack: Option<Callback<String>>,
    /// `(requestId, payload, error)` — exactly one of `payload`/`error` is set.
    pub on_rpc_response: Option<Callback<RpcResponseArgs>>,

    pub on_stream_header: Option<Callback<(String, crate::proto::StreamHeaderPacket)>>,
    pub on_stream_chunk: Option<Callback<crate::proto::StreamChunkPacket>>,
    pub on_stream_trailer: Option<Callback<crate::proto::StreamTrailerPacket>>,

    pub on_local_track_published: Option<Callback<room::LocalTrackPublishedUpdate>>,
    pub on_local_track_unpublished: Option<Callback<room::LocalTrackUnpublishedUpdate>>,
    pub on_local_track_subscribed: Option<Callback<room::LocalTrackSubscribedUpdate>>,
    pub on_track_remote_muted: Option<Callback<room::TrackRemoteMutedUpdate>>,
    pub on_subscribed_quality_update: Option<Callback<room::SubscribedQualityUpdate>>,
    pub on_connection_quality: Option<Callback<room::ConnectionQualityUpdate>>,

    pub on_disconnected: Option<Callback<DisconnectReason>>,

    /// Reconnection lifecycle hooks.
    pub on_restarting: Option<Callback<()>>,
    pub on_restarted: Option<Callback<JoinResponse>>,
    pub on_resuming: Option<Callback<()>>,
    pub on_resumed: Option<Callback<()>>,
}

/// The payload carried by the unified `OnDataPacket` callback; either a user
/// payload or a SIP DTMF event.
#[derive(Debug, Clone)]
pub enum DataPacketPayload {
    User(crate::proto::UserDataPacket),
    SipDtmf(crate::proto::SipDtmfPacket),
}

#[derive(Debug, Clone)]
pub struct RpcRequestArgs {
    pub caller_identity: String,
    pub request_id: String,
    pub method: String,
    pub payload: String,
    pub response_timeout_ms: u32,
    pub version: u32,
}

#[derive(Debug, Clone)]
pub struct RpcResponseArgs {
    pub request_id: String,
    pub payload: Option<String>,
    pub error: Option<RpcError>,
}

impl EngineCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    callback_field!(set_on_participant_update, on_participant_update, room::ParticipantUpdate);
    callback_field!(set_on_speakers_changed, on_speakers_changed, room::SpeakerUpdate);
    callback_field!(set_on_room_update, on_room_update, room::RoomUpdate);
    callback_field!(set_on_room_moved, on_room_moved, room::RoomMovedUpdate);
    callback_field!(set_on_media_track, on_media_track, room::MediaTrackEvent);
    callback_field!(set_on_data_received, on_data_received, crate::proto::UserPacket);
    callback_field!(set_on_data_packet, on_data_packet, (String, DataPacketPayload));
    callback_field!(set_on_transcription, on_transcription, crate::proto::TranscriptionPacket);
    callback_field!(set_on_rpc_request, on_rpc_request, RpcRequestArgs);
    callback_field!(set_on_rpc_ack, on_rpc_ack, String);
    callback_field!(set_on_rpc_response, on_rpc_response, RpcResponseArgs);
    callback_field!(
        set_on_stream_header,
        on_stream_header,
        (String, crate::proto::StreamHeaderPacket)
    );
    callback_field!(set_on_stream_chunk, on_stream_chunk, crate::proto::StreamChunkPacket);
    callback_field!(set_on_stream_trailer, on_stream_trailer, crate::proto::StreamTrailerPacket);
    callback_field!(
        set_on_local_track_published,
        on_local_track_published,
        room::LocalTrackPublishedUpdate
    );
    callback_field!(
        set_on_local_track_unpublished,
        on_local_track_unpublished,
        room::LocalTrackUnpublishedUpdate
    );
    callback_field!(
        set_on_local_track_subscribed,
        on_local_track_subscribed,
        room::LocalTrackSubscribedUpdate
    );
    callback_field!(
        set_on_track_remote_muted,
        on_track_remote_muted,
        room::TrackRemoteMutedUpdate
    );
    callback_field!(
        set_on_subscribed_quality_update,
        on_subscribed_quality_update,
        room::SubscribedQualityUpdate
    );
    callback_field!(
        set_on_connection_quality,
        on_connection_quality,
        room::ConnectionQualityUpdate
    );
    callback_field!(set_on_disconnected, on_disconnected, DisconnectReason);
    callback_field!(set_on_restarting, on_restarting, ());
    callback_field!(set_on_restarted, on_restarted, JoinResponse);
    callback_field!(set_on_resuming, on_resuming, ());
    callback_field!(set_on_resumed, on_resumed, ());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn unset_handler_is_a_no_op() {
        let callbacks = EngineCallbacks::new();
        assert!(callbacks.on_restarting.is_none());
    }

    #[test]
    fn setting_a_handler_makes_it_callable() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        let mut callbacks = EngineCallbacks::new();
        callbacks.set_on_resumed(move |_| fired_clone.store(true, Ordering::SeqCst));
        (callbacks.on_resumed.unwrap())(());
        assert!(fired.load(Ordering::SeqCst));
    }
}
