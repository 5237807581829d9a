//! Inbound dispatcher: reads the live transport and publishes classified events.

use base64::prelude::*;
use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use super::base::{Credentials, InboundEvent};
use super::sender::wait_for_change;
use super::session::Session;
use super::state::SessionState;
use super::transport::{TransportError, TransportFrame, TransportResult};

/// Replacement for secrets found in inbound text.
pub const REDACTED: &str = "[REDACTED]";

/// Turns raw transport reads into [`InboundEvent`]s.
///
/// - binary frames are voice audio
/// - JSON text whose `type` ends in `audio.delta` carries base64 audio in `delta`
/// - any other text is a control event (non-JSON text is kept as a JSON string)
///
/// The API key is scrubbed from text before it is parsed, so it can never be
/// echoed back to callers.
#[derive(Debug, Clone, Default)]
pub struct FrameClassifier {
    secret: Option<Credentials>,
}

impl FrameClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Redact `credentials` from every text frame.
    pub fn redacting(credentials: Credentials) -> Self {
        Self {
            secret: (!credentials.is_empty()).then_some(credentials),
        }
    }

    /// Classify the outcome of a transport read.
    ///
    /// Returns `None` for a read timeout, which is not an event.
    pub fn classify_read(&self, read: TransportResult<TransportFrame>) -> Option<InboundEvent> {
        match read {
            Ok(frame) => Some(self.classify(frame)),
            Err(TransportError::Timeout) => None,
            Err(error) => Some(InboundEvent::TransportError(error)),
        }
    }

    pub fn classify(&self, frame: TransportFrame) -> InboundEvent {
        match frame {
            TransportFrame::Binary(data) => InboundEvent::VoiceAudio(data),
            TransportFrame::Text(text) => {
                let text = self.redact(text);
                match serde_json::from_str::<Value>(&text) {
                    Ok(value) => match audio_delta(&value) {
                        Some(audio) => InboundEvent::VoiceAudio(audio),
                        None => InboundEvent::ControlEvent(value),
                    },
                    Err(_) => {
                        trace!("Non-JSON text frame passed through as control event");
                        InboundEvent::ControlEvent(Value::String(text))
                    }
                }
            }
        }
    }

    fn redact(&self, text: String) -> String {
        match &self.secret {
            Some(secret) if text.contains(secret.expose()) => {
                warn!("Inbound frame contained the API key, redacting");
                text.replace(secret.expose(), REDACTED)
            }
            _ => text,
        }
    }
}

/// Decoded audio of an `*audio.delta` event.
fn audio_delta(value: &Value) -> Option<Bytes> {
    let kind = value.get("type")?.as_str()?;
    if !kind.ends_with("audio.delta") {
        return None;
    }

    let delta = value.get("delta")?.as_str()?;
    match BASE64_STANDARD.decode(delta) {
        Ok(audio) => Some(Bytes::from(audio)),
        Err(e) => {
            warn!(event_type = kind, "Undecodable audio delta: {}", e);
            None
        }
    }
}

pub(crate) async fn run_dispatcher(
    session: Arc<Session>,
    inbound: mpsc::Sender<InboundEvent>,
    classifier: FrameClassifier,
) {
    let mut state_rx = session.state.subscribe();
    let mut link_rx = session.subscribe_link();
    let poll = session.config.receive_poll();
    let mut published: u64 = 0;

    debug!(session_id = %session.id, "Inbound dispatcher started");

    loop {
        let state = *state_rx.borrow_and_update();
        if state.is_shutting_down() {
            break;
        }

        let link = link_rx.borrow_and_update().clone();
        let link = match (state, link) {
            (SessionState::Open, Some(link)) => link,
            _ => {
                wait_for_change(&mut state_rx, &mut link_rx).await;
                continue;
            }
        };

        let read = tokio::select! {
            biased;
            _ = state_rx.changed() => continue,
            _ = link_rx.changed() => continue,
            read = link.transport.receive(poll) => read,
        };

        match classifier.classify_read(read) {
            None => continue,
            Some(InboundEvent::TransportError(error)) => {
                warn!(
                    session_id = %session.id,
                    generation = link.generation,
                    "Inbound read failed: {}",
                    error
                );
                session.report_failure(link.generation, error);
                wait_for_change(&mut state_rx, &mut link_rx).await;
            }
            Some(event) => {
                if !publish(&mut state_rx, &inbound, event).await {
                    break;
                }
                published += 1;
            }
        }
    }

    debug!(session_id = %session.id, published, "Inbound dispatcher stopped");
}

/// Wait for room on the inbound queue. Gives up only when the session shuts down.
async fn publish(
    state_rx: &mut watch::Receiver<SessionState>,
    inbound: &mpsc::Sender<InboundEvent>,
    event: InboundEvent,
) -> bool {
    loop {
        tokio::select! {
            permit = inbound.reserve() => {
                return match permit {
                    Ok(permit) => {
                        permit.send(event);
                        true
                    }
                    Err(_) => false,
                };
            }
            changed = state_rx.changed() => {
                if changed.is_err() || state_rx.borrow_and_update().is_shutting_down() {
                    return false;
                }
            }
        }
    }
}
