//! The negotiation coordinator.
//!
//! Drives offer/answer between the publisher/subscriber transports and the
//! signaling client, and routes trickled ICE candidates. Holds no state of
//! its own beyond an `Arc<EngineInner>` — it's a thin set of operations over
//! the engine's shared `pc`/flags, a cheap handle wrapping the shared state
//! rather than a struct with its own storage.

use crate::engine::EngineInner;
use crate::error::{EngineError, Result};
use crate::proto::{IceCandidateInit, SessionDescription, SignalTarget};
use crate::transport::{PCTransport, TransportRole};
use log::*;
use std::sync::atomic::Ordering;
use std::sync::Arc;

#[derive(Clone)]
pub struct Negotiation(pub(crate) Arc<EngineInner>);

impl Negotiation {
    /// Creates a fresh offer on the publisher transport, sets it locally, and
    /// forwards it to the signaling client. Called for the initial
    /// fast-publish offer, a resume's ICE-restart offer, and autonomous
    /// renegotiation alike.
    pub async fn request_publisher_offer(&self, ice_restart: bool) -> Result<()> {
        let publisher = {
            let pc = self.0.pc.read().await;
            pc.publisher.clone()
        };
        let Some(publisher) = publisher else {
            return Err(EngineError::NoPeerConnection);
        };
        let offer = publisher.create_offer(ice_restart).await?;
        publisher.set_local_description(offer.clone()).await?;
        self.0.signal.send_offer(offer).await?;
        self.0.has_publish.store(true, Ordering::SeqCst);
        debug!("sent publisher offer (ice_restart={ice_restart})");
        Ok(())
    }

    /// Ensures the publisher is in a state that can carry a data-channel send.
    /// When the session is subscriber-primary and no publisher offer has ever
    /// been made, this triggers one now.
    pub async fn ensure_publisher_connected(&self, _require_data_ready: bool) -> Result<()> {
        let (subscriber_primary, has_publisher) = {
            let pc = self.0.pc.read().await;
            (pc.subscriber_primary, pc.publisher.is_some())
        };
        if !has_publisher {
            return Err(EngineError::NoPeerConnection);
        }
        if subscriber_primary && !self.0.has_publish.load(Ordering::SeqCst) {
            self.request_publisher_offer(false).await?;
        }
        Ok(())
    }

    /// Server answer arrived for the publisher's offer.
    pub async fn handle_answer(&self, desc: SessionDescription) {
        if self.0.closed.load(Ordering::SeqCst) {
            return;
        }
        let publisher = {
            let pc = self.0.pc.read().await;
            pc.publisher.clone()
        };
        let Some(publisher) = publisher else {
            warn!("received answer with no publisher transport");
            return;
        };
        if let Err(e) = publisher.set_remote_description(desc).await {
            error!("failed to apply publisher answer: {e}");
        }
    }

    /// Server offer arrived for the subscriber. Applies it as the remote
    /// description, creates an answer once the
    /// subscriber has settled, and sends it back.
    pub async fn handle_offer(&self, desc: SessionDescription) {
        if self.0.closed.load(Ordering::SeqCst) {
            return;
        }
        let subscriber = {
            let pc = self.0.pc.read().await;
            pc.subscriber.clone()
        };
        let Some(subscriber) = subscriber else {
            warn!("received offer with no subscriber transport");
            return;
        };
        if let Err(e) = subscriber.set_remote_description(desc).await {
            error!("failed to apply subscriber offer: {e}");
            return;
        }
        self.send_subscriber_answer(subscriber.as_ref()).await;
    }

    async fn send_subscriber_answer(&self, subscriber: &dyn PCTransport) {
        let answer = match subscriber.create_answer().await {
            Ok(a) => a,
            Err(e) => {
                error!("failed to create subscriber answer: {e}");
                return;
            }
        };
        if let Err(e) = subscriber.set_local_description(answer.clone()).await {
            error!("failed to set subscriber local description: {e}");
            return;
        }
        if let Err(e) = self.0.signal.send_answer(answer).await {
            error!("failed to send subscriber answer: {e}");
        }
    }

    /// Routes an inbound trickle candidate pushed by the server to the
    /// transport it targets. A `None` candidate is the end-of-candidates
    /// sentinel and is ignored. Add-candidate errors are logged, never fatal.
    pub async fn handle_trickle(&self, candidate: Option<IceCandidateInit>, target: SignalTarget) {
        if self.0.closed.load(Ordering::SeqCst) {
            return;
        }
        let Some(candidate) = candidate else {
            return;
        };
        let transport = {
            let pc = self.0.pc.read().await;
            match target {
                SignalTarget::Publisher => pc.publisher.clone(),
                SignalTarget::Subscriber => pc.subscriber.clone(),
            }
        };
        let Some(transport) = transport else {
            warn!("received trickle candidate for {target:?} with no matching transport");
            return;
        };
        if let Err(e) = transport.add_ice_candidate(candidate).await {
            warn!("failed to add ICE candidate for {target:?}: {e}");
        }
    }

    /// A transport gathered a local candidate; forward it to signaling tagged
    /// with the originating transport. `None` (end-of-candidates) is dropped.
    pub async fn handle_local_candidate(
        &self,
        role: TransportRole,
        candidate: Option<IceCandidateInit>,
    ) {
        let Some(candidate) = candidate else {
            return;
        };
        let target = match role {
            TransportRole::Publisher => SignalTarget::Publisher,
            TransportRole::Subscriber => SignalTarget::Subscriber,
        };
        if let Err(e) = self.0.signal.send_ice_candidate(candidate, target).await {
            warn!("failed to send trickle candidate for {target:?}: {e}");
        }
    }

    /// Primary-transport ICE state observation. Only the
    /// primary transport's observer is wired to this; see `engine.rs`
    /// `Configure`.
    pub async fn handle_ice_connection_state(
        &self,
        state: crate::transport::IceConnectionState,
    ) {
        use crate::transport::IceConnectionState as S;
        match state {
            S::Connected | S::Completed => {
                let pair = {
                    let pc = self.0.pc.read().await;
                    let primary: Option<&std::sync::Arc<dyn PCTransport>> = if pc.subscriber_primary
                    {
                        pc.subscriber.as_ref()
                    } else {
                        pc.publisher.as_ref()
                    };
                    primary.and_then(|t| t.selected_candidate_pair())
                };
                match pair {
                    Some(p) => info!(
                        "primary transport ICE connected, selected candidate pair: local={} remote={}",
                        p.local, p.remote
                    ),
                    None => info!("primary transport ICE connected"),
                }
            }
            S::Disconnected => {
                info!("primary transport ICE disconnected");
            }
            S::Failed => {
                warn!("primary transport ICE failed, triggering reconnect");
                let inner = self.0.clone();
                tokio::spawn(async move {
                    crate::reconnect::ReconnectController(inner)
                        .handle_disconnect(false)
                        .await;
                });
            }
            S::New | S::Checking | S::Closed => {}
        }
    }
}
