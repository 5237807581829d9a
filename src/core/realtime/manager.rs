//! The session manager facade.
//!
//! [`RealtimeSessionManager`] is the only type callers need. It owns at most
//! one current session and runs three background tasks for it while it is
//! live:
//!
//! - the sender loop, draining the outbound queue onto the transport
//! - the inbound dispatcher, classifying frames into [`InboundEvent`]s
//! - the reconnection supervisor, replacing the transport when it drops
//!
//! All operations take `&self`, so the manager can be shared behind an `Arc`
//! between a producer feeding audio and a consumer reading synthesized voice.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::base::{
    Credentials, EndpointConfig, InboundEvent, ManagerConfig, OutboundItem, OutboundRetention,
    SessionError, SessionResult,
};
use super::dispatcher::{FrameClassifier, run_dispatcher};
use super::sender::run_sender;
use super::session::{Session, SessionChannels, SessionTasks, join_task};
use super::state::{SessionState, wait_for_state};
use super::supervisor::run_supervisor;
use super::transport::TransportFactory;

/// How a session ended, as reported by [`RealtimeSessionManager::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// `connect` was never called
    NotStarted,
    /// Closed by `disconnect`
    Closed,
    /// Gave up; `reason` is the last recorded error
    Failed { reason: String },
}

/// Manages one resilient streaming session with a realtime speech service.
pub struct RealtimeSessionManager {
    factory: Arc<dyn TransportFactory>,
    config: ManagerConfig,
    current: parking_lot::Mutex<Option<Arc<Session>>>,
}

impl RealtimeSessionManager {
    /// Create a manager that opens transports through `factory`.
    pub fn new(factory: Arc<dyn TransportFactory>, config: ManagerConfig) -> SessionResult<Self> {
        config.validate()?;
        Ok(Self {
            factory,
            config,
            current: parking_lot::Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    fn current(&self) -> Option<Arc<Session>> {
        self.current.lock().clone()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open a new session and start its background tasks.
    ///
    /// Returns once the transport is open and the handshake was sent. Fails
    /// with [`SessionError::AlreadyConnected`] while another session is
    /// connecting, open or closing.
    pub async fn connect(
        &self,
        credentials: Credentials,
        endpoint: EndpointConfig,
    ) -> SessionResult<()> {
        if credentials.is_empty() {
            return Err(SessionError::AuthenticationFailed(
                "API key is required".to_string(),
            ));
        }
        if endpoint.url.is_empty() {
            return Err(SessionError::InvalidConfiguration(
                "endpoint url is required".to_string(),
            ));
        }

        let (session, channels) = {
            let mut current = self.current.lock();
            if let Some(existing) = current.as_ref() {
                let state = existing.state.get();
                if state != SessionState::Idle && !state.is_terminal() {
                    return Err(SessionError::AlreadyConnected);
                }
            }

            let (session, channels) = Session::new(self.config.clone(), credentials, endpoint);
            session.state.transition(SessionState::Connecting)?;
            *current = Some(session.clone());
            (session, channels)
        };

        info!(
            session_id = %session.id,
            url = session.endpoint_url(),
            "Connecting realtime session"
        );

        let transport = match session.open_transport(self.factory.as_ref()).await {
            Ok(transport) => transport,
            Err(_) if session.state.get().is_shutting_down() => {
                return Err(SessionError::ConnectFailed(
                    "session was closed while connecting".to_string(),
                ));
            }
            Err(e) => {
                let err = SessionError::from_connect(e);
                error!(session_id = %session.id, "Failed to connect: {}", err);
                session.record_error(err.to_string());
                if let Err(e) = session.state.transition(SessionState::Failed) {
                    debug!(session_id = %session.id, "Not marking session failed: {}", e);
                }
                return Err(err);
            }
        };

        let generation = session.install_link(transport);
        if session
            .state
            .transition_from(SessionState::Connecting, SessionState::Open)
            .is_err()
        {
            session.close_link().await;
            return Err(SessionError::ConnectFailed(
                "session was closed while connecting".to_string(),
            ));
        }
        session.mark_opened();
        self.spawn_tasks(&session, channels);

        info!(session_id = %session.id, generation, "Realtime session open");
        Ok(())
    }

    fn spawn_tasks(&self, session: &Arc<Session>, channels: SessionChannels) {
        let SessionChannels {
            outbound_rx,
            inbound_tx,
            failures_rx,
        } = channels;
        let classifier = FrameClassifier::redacting(session.credentials().clone());

        let tasks = SessionTasks {
            sender: tokio::spawn(run_sender(session.clone(), outbound_rx)),
            dispatcher: tokio::spawn(run_dispatcher(session.clone(), inbound_tx, classifier)),
            supervisor: tokio::spawn(run_supervisor(
                session.clone(),
                self.factory.clone(),
                failures_rx,
            )),
        };
        session.set_tasks(tasks);
    }

    /// Close the current session.
    ///
    /// Idempotent: calling it with no session, or on a session that already
    /// closed or failed, does nothing. Queued outbound items are flushed first
    /// under [`OutboundRetention::Preserve`] and dropped otherwise.
    pub async fn disconnect(&self) {
        let Some(session) = self.current() else {
            return;
        };

        let previous = match session.state.transition(SessionState::Closing) {
            Ok(previous) => previous,
            Err(e) => {
                debug!(session_id = %session.id, "Nothing to disconnect: {}", e);
                return;
            }
        };
        info!(session_id = %session.id, from = %previous, "Disconnecting realtime session");

        session.close_outbound();
        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace();

        if let Some(SessionTasks {
            sender,
            dispatcher,
            supervisor,
        }) = session.take_tasks()
        {
            if self.config.retention == OutboundRetention::Preserve {
                // Let the sender flush before the transport goes away
                join_task(session.id, "sender", sender, deadline).await;
                session.close_link().await;
            } else {
                session.close_link().await;
                join_task(session.id, "sender", sender, deadline).await;
            }
            join_task(session.id, "dispatcher", dispatcher, deadline).await;
            join_task(session.id, "supervisor", supervisor, deadline).await;
        }
        session.close_link().await;

        if let Err(e) = session.state.transition(SessionState::Closed) {
            debug!(session_id = %session.id, "Close transition rejected: {}", e);
        }
        info!(session_id = %session.id, "Realtime session closed");
    }

    /// Wait until the current session ends and report how.
    ///
    /// The background tasks do the work; this only waits for a terminal
    /// state and reaps them.
    pub async fn run(&self) -> RunOutcome {
        let Some(session) = self.current() else {
            return RunOutcome::NotStarted;
        };

        let mut state_rx = session.state.subscribe();
        let terminal = wait_for_state(&mut state_rx, SessionState::is_terminal)
            .await
            .unwrap_or(SessionState::Failed);

        if let Some(tasks) = session.take_tasks() {
            let deadline = tokio::time::Instant::now() + self.config.shutdown_grace();
            tasks.join(session.id, deadline).await;
        }

        match terminal {
            SessionState::Closed => RunOutcome::Closed,
            _ => RunOutcome::Failed {
                reason: session
                    .last_error()
                    .unwrap_or_else(|| "session failed".to_string()),
            },
        }
    }

    // =========================================================================
    // Streaming
    // =========================================================================

    /// Queue one frame of caller audio.
    ///
    /// Accepted while the session is open and while it is reconnecting after a
    /// drop. Fails with [`SessionError::QueueFull`] per the configured
    /// queue-full policy and [`SessionError::NotConnected`] otherwise.
    pub async fn send_audio(&self, frame: impl Into<Bytes>) -> SessionResult<()> {
        let session = self.current().ok_or(SessionError::NotConnected)?;
        let item = OutboundItem::AudioFrame {
            data: frame.into(),
            sequence: session.next_sequence(),
        };
        session.enqueue(item).await
    }

    /// Queue a structured control message, written as a text frame.
    pub async fn send_control(&self, payload: serde_json::Value) -> SessionResult<()> {
        let session = self.current().ok_or(SessionError::NotConnected)?;
        session.enqueue(OutboundItem::ControlMessage(payload)).await
    }

    /// Wait up to `timeout` for the next inbound event.
    ///
    /// Events arrive in transport read order. Fails with
    /// [`SessionError::Timeout`] when nothing arrived in time and with
    /// [`SessionError::Closed`] once the session is closing or gone.
    pub async fn receive_voice(&self, timeout: Duration) -> SessionResult<InboundEvent> {
        let session = self.current().ok_or(SessionError::NotConnected)?;
        session.receive(timeout).await
    }

    // =========================================================================
    // Observability
    // =========================================================================

    pub fn state(&self) -> SessionState {
        self.current()
            .map(|session| session.state.get())
            .unwrap_or_default()
    }

    /// Watch state transitions of the current session.
    pub fn subscribe_state(&self) -> Option<watch::Receiver<SessionState>> {
        self.current().map(|session| session.state.subscribe())
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.current().map(|session| session.id)
    }

    /// Reconnection attempts since the link was last open.
    pub fn retry_count(&self) -> u32 {
        self.current()
            .map(|session| session.retry_count())
            .unwrap_or(0)
    }

    pub fn last_error(&self) -> Option<String> {
        self.current().and_then(|session| session.last_error())
    }
}

impl Drop for RealtimeSessionManager {
    fn drop(&mut self) {
        if let Some(session) = self.current.lock().take() {
            session.abort_tasks();
        }
    }
}
