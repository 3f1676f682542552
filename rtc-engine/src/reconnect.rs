//! The reconnect controller.
//!
//! Implements the resume/restart state machine: bounded retries, quadratic
//! backoff, and a single-in-flight-attempt guarantee. Like `negotiation.rs`,
//! this is a thin handle over `Arc<EngineInner>` rather than a struct with its
//! own storage — the state that matters (`reconnecting`,
//! `requires_full_reconnect`, the transports) all lives on the engine and must
//! be visible to `Close` and the negotiation coordinator too.

use crate::config::{MAX_RECONNECT_BACKOFF, MAX_RECONNECT_COUNT, RECONNECT_BACKOFF_BASE};
use crate::engine::EngineInner;
use crate::error::Result;
use crate::proto::DisconnectReason;
use log::*;
use std::sync::atomic::Ordering;
use std::sync::Arc;

#[derive(Clone)]
pub struct ReconnectController(pub(crate) Arc<EngineInner>);

impl ReconnectController {
    /// Entry point invoked on transport failure or a server-pushed
    /// `Reconnect`/`Resume` leave action.
    pub async fn handle_disconnect(&self, full_reconnect: bool) {
        if self.0.closed.load(Ordering::SeqCst) || !self.0.has_connected.load(Ordering::SeqCst) {
            // Never reconnect before initial success, and never reconnect
            // after a terminal close.
            return;
        }
        if self
            .0
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // Another attempt is already in flight; escalate it if this caller
            // demanded a full reconnect.
            if full_reconnect {
                self.0.requires_full_reconnect.store(true, Ordering::SeqCst);
            }
            return;
        }
        self.run_loop(full_reconnect).await;
    }

    async fn run_loop(&self, initial_full_reconnect: bool) {
        let mut full = initial_full_reconnect;
        for i in 0..MAX_RECONNECT_COUNT {
            if self.0.closed.load(Ordering::SeqCst) {
                break;
            }
            if self.0.requires_full_reconnect.swap(false, Ordering::SeqCst) {
                full = true;
            }
            if i == 0 {
                let callbacks = self.0.callbacks.read().await.clone();
                if full {
                    if let Some(cb) = &callbacks.on_restarting {
                        cb(());
                    }
                } else if let Some(cb) = &callbacks.on_resuming {
                    cb(());
                }
            }
            debug!("reconnect attempt {i} (full={full})");
            let outcome = if full {
                self.restart_connection().await.map(Outcome::Restarted)
            } else {
                self.resume_connection().await.map(|_| Outcome::Resumed)
            };
            match outcome {
                Ok(result) => {
                    self.finish(false);
                    let callbacks = self.0.callbacks.read().await.clone();
                    match result {
                        Outcome::Restarted(join_response) => {
                            if let Some(cb) = &callbacks.on_restarted {
                                cb(join_response);
                            }
                        }
                        Outcome::Resumed => {
                            if let Some(cb) = &callbacks.on_resumed {
                                cb(());
                            }
                        }
                    }
                    return;
                }
                Err(e) => {
                    warn!("reconnect attempt {i} failed (full={full}): {e}");
                    let Some(delay) = backoff_delay(i) else {
                        warn!("reconnect backoff exceeded cap, abandoning loop");
                        break;
                    };
                    if i + 1 < MAX_RECONNECT_COUNT {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        error!("reconnect exhausted after {MAX_RECONNECT_COUNT} attempts");
        self.finish(true);
        let callbacks = self.0.callbacks.read().await.clone();
        if let Some(cb) = &callbacks.on_disconnected {
            cb(DisconnectReason::Failed);
        }
    }

    fn finish(&self, _exhausted: bool) {
        self.0.reconnecting.store(false, Ordering::SeqCst);
        self.0.reconnect_notify.notify_waiters();
    }

    /// Soft reconnection: ICE restart on both transports via a fresh
    /// signaling resume handshake, preserving subscriber state.
    async fn resume_connection(&self) -> Result<()> {
        let (url, token, params, participant_sid) = self.0.session_context().await;
        let new_ice_servers = self
            .0
            .signal
            .reconnect(&url, &token, &params, &participant_sid)
            .await?;
        if let Some(ice_servers) = new_ice_servers {
            let pc = self.0.pc.write().await;
            let config = crate::transport::RtcConfiguration {
                ice_servers,
                ice_transport_policy: params.ice_transport_policy,
            };
            if let Some(p) = &pc.publisher {
                p.set_configuration(config.clone()).await?;
            }
            if let Some(s) = &pc.subscriber {
                s.set_configuration(config).await?;
            }
        }
        self.0.signal.start().await?;

        let (subscriber_primary, has_publisher) = {
            let pc = self.0.pc.read().await;
            (pc.subscriber_primary, pc.publisher.is_some())
        };
        if has_publisher
            && (!subscriber_primary || self.0.has_publish.load(Ordering::SeqCst))
        {
            crate::negotiation::Negotiation(self.0.clone())
                .request_publisher_offer(true)
                .await?;
        }
        self.0.wait_until_connected_inner(params.join_timeout).await
    }

    /// Hard reconnection: leave, close the signaling client, and rejoin from
    /// scratch, which replaces both transports.
    async fn restart_connection(&self) -> Result<crate::proto::JoinResponse> {
        if self.0.signal.is_started() {
            let _ = self
                .0
                .signal
                .send_leave_with_reason(crate::proto::WireLeaveReason::Unknown)
                .await;
            self.0.signal.close().await;
        }
        self.0.rejoin(tokio_util::sync::CancellationToken::new()).await
    }
}

enum Outcome {
    Restarted(crate::proto::JoinResponse),
    Resumed,
}

/// Quadratic backoff for reconnect iteration `i`: `i^2 * 300ms`, or `None`
/// once that exceeds the 60s cap, which abandons the loop rather than
/// sleeping.
fn backoff_delay(i: u32) -> Option<std::time::Duration> {
    let delay = RECONNECT_BACKOFF_BASE * (i * i);
    (delay <= MAX_RECONNECT_BACKOFF).then_some(delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_quadratic_in_the_iteration_index() {
        assert_eq!(backoff_delay(0), Some(std::time::Duration::ZERO));
        assert_eq!(backoff_delay(1), Some(RECONNECT_BACKOFF_BASE));
        assert_eq!(backoff_delay(2), Some(RECONNECT_BACKOFF_BASE * 4));
        assert_eq!(backoff_delay(3), Some(RECONNECT_BACKOFF_BASE * 9));
    }

    #[test]
    fn backoff_abandons_the_loop_once_it_exceeds_the_cap() {
        // 300ms * i^2 > 60s once i >= 15 (15^2 * 300ms = 67.5s).
        assert!(backoff_delay(14).is_some());
        assert!(backoff_delay(15).is_none());
    }
}
