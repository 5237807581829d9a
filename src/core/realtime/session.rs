//! State shared between the manager facade and one session's background tasks.
//!
//! A [`Session`] lives from one `connect` to the matching terminal state. The
//! live transport is published as a [`Link`] on a watch channel; every
//! (re)connection installs a link with a fresh generation number so stale
//! failure reports can be told apart from current ones.

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::base::{
    Credentials, EndpointConfig, InboundEvent, ManagerConfig, OutboundItem, QueueFullPolicy,
    SessionError, SessionResult,
};
use super::state::{SessionState, StateCell, wait_for_state};
use super::transport::{BoxedTransport, TransportError, TransportFactory, TransportResult};

/// Capacity of the failure channel feeding the supervisor.
const FAILURE_CHANNEL_CAPACITY: usize = 16;

/// The transport currently carrying traffic.
#[derive(Clone)]
pub(crate) struct Link {
    pub(crate) generation: u64,
    pub(crate) transport: BoxedTransport,
}

/// A transport failure observed by the sender loop or the dispatcher.
#[derive(Debug)]
pub(crate) struct LinkFailure {
    pub(crate) generation: u64,
    pub(crate) error: TransportError,
}

/// Receiving ends handed to the background tasks when the session opens.
pub(crate) struct SessionChannels {
    pub(crate) outbound_rx: mpsc::Receiver<OutboundItem>,
    pub(crate) inbound_tx: mpsc::Sender<InboundEvent>,
    pub(crate) failures_rx: mpsc::Receiver<LinkFailure>,
}

/// Join handles of the background tasks.
pub(crate) struct SessionTasks {
    pub(crate) sender: JoinHandle<()>,
    pub(crate) dispatcher: JoinHandle<()>,
    pub(crate) supervisor: JoinHandle<()>,
}

impl SessionTasks {
    /// Wait for every task until `deadline`, aborting the ones still running.
    pub(crate) async fn join(self, session_id: Uuid, deadline: tokio::time::Instant) {
        for (name, handle) in [
            ("sender", self.sender),
            ("dispatcher", self.dispatcher),
            ("supervisor", self.supervisor),
        ] {
            join_task(session_id, name, handle, deadline).await;
        }
    }

    fn abort(&self) {
        self.sender.abort();
        self.dispatcher.abort();
        self.supervisor.abort();
    }
}

/// Wait for a single task until `deadline`, aborting it if it overruns.
pub(crate) async fn join_task(
    session_id: Uuid,
    name: &str,
    mut handle: JoinHandle<()>,
    deadline: tokio::time::Instant,
) {
    match tokio::time::timeout_at(deadline, &mut handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) if e.is_cancelled() => {}
        Ok(Err(e)) => warn!(%session_id, task = name, "Session task panicked: {}", e),
        Err(_) => {
            warn!(%session_id, task = name, "Session task did not stop in time, aborting");
            handle.abort();
        }
    }
}

pub(crate) struct Session {
    pub(crate) id: Uuid,
    pub(crate) state: StateCell,
    pub(crate) config: ManagerConfig,
    credentials: Credentials,
    endpoint: EndpointConfig,
    link: watch::Sender<Option<Link>>,
    next_generation: AtomicU64,
    outbound_tx: Mutex<Option<mpsc::Sender<OutboundItem>>>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<InboundEvent>>,
    failures_tx: mpsc::Sender<LinkFailure>,
    sequence: AtomicU64,
    retry_count: AtomicU32,
    ever_opened: AtomicBool,
    last_error: Mutex<Option<String>>,
    tasks: Mutex<Option<SessionTasks>>,
}

impl Session {
    pub(crate) fn new(
        config: ManagerConfig,
        credentials: Credentials,
        endpoint: EndpointConfig,
    ) -> (Arc<Self>, SessionChannels) {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity);
        let (failures_tx, failures_rx) = mpsc::channel(FAILURE_CHANNEL_CAPACITY);
        let (link, _rx) = watch::channel(None);

        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            state: StateCell::new(),
            config,
            credentials,
            endpoint,
            link,
            next_generation: AtomicU64::new(0),
            outbound_tx: Mutex::new(Some(outbound_tx)),
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            failures_tx,
            sequence: AtomicU64::new(0),
            retry_count: AtomicU32::new(0),
            ever_opened: AtomicBool::new(false),
            last_error: Mutex::new(None),
            tasks: Mutex::new(None),
        });

        let channels = SessionChannels {
            outbound_rx,
            inbound_tx,
            failures_rx,
        };

        (session, channels)
    }

    pub(crate) fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub(crate) fn endpoint_url(&self) -> &str {
        &self.endpoint.url
    }

    // -------------------------------------------------------------------------
    // Link management
    // -------------------------------------------------------------------------

    /// Create, open and handshake a fresh transport within the connect timeout.
    ///
    /// Gives up with [`TransportError::Closed`] as soon as the session starts
    /// shutting down. On any failure the half-opened transport is closed
    /// before returning.
    pub(crate) async fn open_transport(
        &self,
        factory: &dyn TransportFactory,
    ) -> TransportResult<BoxedTransport> {
        let transport = factory.create();
        let mut state_rx = self.state.subscribe();

        let handshake = async {
            transport
                .open(&self.endpoint, self.credentials.expose())
                .await?;
            if let Some(message) = &self.endpoint.handshake {
                transport.send_text(message.to_string()).await?;
            }
            Ok::<(), TransportError>(())
        };

        let error = tokio::select! {
            opened = tokio::time::timeout(self.config.connect_timeout(), handshake) => match opened {
                Ok(Ok(())) => return Ok(transport),
                Ok(Err(e)) => e,
                Err(_) => TransportError::Timeout,
            },
            _ = wait_for_state(&mut state_rx, SessionState::is_shutting_down) => {
                debug!(session_id = %self.id, "Session shutting down, abandoning transport open");
                TransportError::Closed
            }
        };

        if let Err(e) = transport.close().await {
            debug!(session_id = %self.id, "Error closing half-open transport: {}", e);
        }
        Err(error)
    }

    /// Publish `transport` as the live link and return its generation.
    pub(crate) fn install_link(&self, transport: BoxedTransport) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.link.send_replace(Some(Link {
            generation,
            transport,
        }));
        generation
    }

    pub(crate) fn take_link(&self) -> Option<Link> {
        self.link.send_replace(None)
    }

    pub(crate) fn current_link(&self) -> Option<Link> {
        self.link.borrow().clone()
    }

    pub(crate) fn current_generation(&self) -> Option<u64> {
        self.link.borrow().as_ref().map(|link| link.generation)
    }

    pub(crate) fn subscribe_link(&self) -> watch::Receiver<Option<Link>> {
        self.link.subscribe()
    }

    /// Hand a transport failure to the supervisor.
    pub(crate) fn report_failure(&self, generation: u64, error: TransportError) {
        if let Err(e) = self
            .failures_tx
            .try_send(LinkFailure { generation, error })
        {
            // A full channel already holds a failure that will trigger recovery
            debug!(session_id = %self.id, generation, "Dropped failure report: {}", e);
        }
    }

    /// Close the live transport, if any, and clear the link.
    pub(crate) async fn close_link(&self) {
        if let Some(link) = self.take_link()
            && let Err(e) = link.transport.close().await
        {
            debug!(session_id = %self.id, generation = link.generation, "Error closing transport: {}", e);
        }
    }

    /// Move to `Failed`, recording `reason` and closing the transport.
    pub(crate) async fn fail(&self, reason: String) {
        self.record_error(reason);
        if let Err(e) = self.state.transition(SessionState::Failed) {
            debug!(session_id = %self.id, "Not marking session failed: {}", e);
        }
        self.close_outbound();
        self.close_link().await;
    }

    // -------------------------------------------------------------------------
    // Caller side
    // -------------------------------------------------------------------------

    /// Outbound items are accepted while open, and while a reconnect is in flight.
    fn accepts_outbound(&self) -> bool {
        match self.state.get() {
            SessionState::Open => true,
            SessionState::Connecting => self.ever_opened.load(Ordering::SeqCst),
            _ => false,
        }
    }

    pub(crate) fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    /// Put `item` on the outbound queue according to the queue-full policy.
    pub(crate) async fn enqueue(&self, item: OutboundItem) -> SessionResult<()> {
        if !self.accepts_outbound() {
            return Err(SessionError::NotConnected);
        }
        let Some(tx) = self.outbound_tx.lock().clone() else {
            return Err(SessionError::NotConnected);
        };

        match self.config.queue_full_policy {
            QueueFullPolicy::RejectImmediately => tx.try_send(item).map_err(|e| match e {
                TrySendError::Full(_) => SessionError::QueueFull,
                TrySendError::Closed(_) => SessionError::NotConnected,
            }),
            QueueFullPolicy::BlockWithTimeout { timeout_ms } => tx
                .send_timeout(item, Duration::from_millis(timeout_ms))
                .await
                .map_err(|e| match e {
                    SendTimeoutError::Timeout(_) => SessionError::QueueFull,
                    SendTimeoutError::Closed(_) => SessionError::NotConnected,
                }),
        }
    }

    /// Stop accepting outbound items. The sender loop sees the queue close
    /// once it has drained what is already there.
    pub(crate) fn close_outbound(&self) {
        self.outbound_tx.lock().take();
    }

    /// Wait up to `timeout` for the next inbound event.
    ///
    /// Returns [`SessionError::Closed`] as soon as the session starts shutting
    /// down, even if a caller is already blocked.
    pub(crate) async fn receive(&self, timeout: Duration) -> SessionResult<InboundEvent> {
        let mut state_rx = self.state.subscribe();
        if state_rx.borrow_and_update().is_shutting_down() {
            return Err(SessionError::Closed);
        }

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let mut inbound = loop {
            tokio::select! {
                biased;
                changed = state_rx.changed() => {
                    if changed.is_err() || state_rx.borrow_and_update().is_shutting_down() {
                        return Err(SessionError::Closed);
                    }
                }
                guard = self.inbound_rx.lock() => break guard,
                _ = &mut deadline => return Err(SessionError::Timeout),
            }
        };

        loop {
            tokio::select! {
                biased;
                changed = state_rx.changed() => {
                    if changed.is_err() || state_rx.borrow_and_update().is_shutting_down() {
                        return Err(SessionError::Closed);
                    }
                }
                event = inbound.recv() => return event.ok_or(SessionError::Closed),
                _ = &mut deadline => return Err(SessionError::Timeout),
            }
        }
    }

    // -------------------------------------------------------------------------
    // Bookkeeping
    // -------------------------------------------------------------------------

    pub(crate) fn mark_opened(&self) {
        self.ever_opened.store(true, Ordering::SeqCst);
    }

    pub(crate) fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::SeqCst)
    }

    /// Count one more reconnection attempt and return the new total.
    pub(crate) fn bump_retry(&self) -> u32 {
        self.retry_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn reset_retries(&self) {
        self.retry_count.store(0, Ordering::SeqCst);
    }

    pub(crate) fn record_error(&self, reason: impl Into<String>) {
        *self.last_error.lock() = Some(reason.into());
    }

    pub(crate) fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub(crate) fn set_tasks(&self, tasks: SessionTasks) {
        *self.tasks.lock() = Some(tasks);
    }

    pub(crate) fn take_tasks(&self) -> Option<SessionTasks> {
        self.tasks.lock().take()
    }

    /// Abort the background tasks without waiting for them.
    pub(crate) fn abort_tasks(&self) {
        if let Some(tasks) = self.tasks.lock().as_ref() {
            tasks.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::realtime::mock::MockTransportFactory;
    use bytes::Bytes;

    fn session_with(config: ManagerConfig) -> (Arc<Session>, SessionChannels) {
        Session::new(
            config,
            Credentials::new("test-key"),
            EndpointConfig::new("mock://upstream"),
        )
    }

    fn audio(n: u8) -> OutboundItem {
        OutboundItem::AudioFrame {
            data: Bytes::from(vec![n]),
            sequence: n as u64,
        }
    }

    fn open(session: &Session) {
        session.state.transition(SessionState::Connecting).unwrap();
        session.state.transition(SessionState::Open).unwrap();
        session.mark_opened();
    }

    #[tokio::test]
    async fn test_enqueue_requires_open_session() {
        let (session, _channels) = session_with(ManagerConfig::default());
        assert!(matches!(
            session.enqueue(audio(1)).await,
            Err(SessionError::NotConnected)
        ));

        session.state.transition(SessionState::Connecting).unwrap();
        assert!(matches!(
            session.enqueue(audio(1)).await,
            Err(SessionError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_enqueue_accepted_during_reconnect() {
        let (session, mut channels) = session_with(ManagerConfig::default());
        open(&session);
        session
            .state
            .transition(SessionState::Connecting)
            .unwrap();

        session.enqueue(audio(7)).await.unwrap();
        assert_eq!(channels.outbound_rx.recv().await, Some(audio(7)));
    }

    #[tokio::test]
    async fn test_enqueue_rejects_when_full() {
        let config = ManagerConfig {
            outbound_capacity: 2,
            ..Default::default()
        };
        let (session, _channels) = session_with(config);
        open(&session);

        session.enqueue(audio(1)).await.unwrap();
        session.enqueue(audio(2)).await.unwrap();
        assert!(matches!(
            session.enqueue(audio(3)).await,
            Err(SessionError::QueueFull)
        ));
    }

    #[tokio::test]
    async fn test_enqueue_block_with_timeout_reports_queue_full() {
        let config = ManagerConfig {
            outbound_capacity: 1,
            queue_full_policy: QueueFullPolicy::BlockWithTimeout { timeout_ms: 20 },
            ..Default::default()
        };
        let (session, _channels) = session_with(config);
        open(&session);

        session.enqueue(audio(1)).await.unwrap();
        let started = tokio::time::Instant::now();
        assert!(matches!(
            session.enqueue(audio(2)).await,
            Err(SessionError::QueueFull)
        ));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_receive_times_out() {
        let (session, _channels) = session_with(ManagerConfig::default());
        open(&session);
        let result = session.receive(Duration::from_millis(10)).await;
        assert!(matches!(result, Err(SessionError::Timeout)));
    }

    #[tokio::test]
    async fn test_receive_unblocks_on_shutdown() {
        let (session, _channels) = session_with(ManagerConfig::default());
        open(&session);

        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.receive(Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.state.transition(SessionState::Closing).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(SessionError::Closed)));
    }

    #[tokio::test]
    async fn test_receive_waiting_for_inbound_lock_unblocks_on_shutdown() {
        let (session, _channels) = session_with(ManagerConfig::default());
        open(&session);

        // another receiver owns the inbound queue for the whole test
        let _held = session.inbound_rx.lock().await;

        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.receive(Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.state.transition(SessionState::Closing).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(SessionError::Closed)));
    }

    #[tokio::test]
    async fn test_install_link_bumps_generation() {
        let (session, _channels) = session_with(ManagerConfig::default());
        let factory = MockTransportFactory::new();

        let first = session.install_link(factory.create());
        let second = session.install_link(factory.create());
        assert_eq!(first + 1, second);
        assert_eq!(session.current_generation(), Some(second));

        assert!(session.take_link().is_some());
        assert!(session.current_link().is_none());
    }

    #[tokio::test]
    async fn test_open_transport_sends_handshake() {
        let endpoint = EndpointConfig::new("mock://upstream")
            .with_handshake(serde_json::json!({"type": "session.update"}));
        let (session, _channels) = Session::new(
            ManagerConfig::default(),
            Credentials::new("test-key"),
            endpoint,
        );
        let factory = MockTransportFactory::new();

        session.open_transport(&factory).await.unwrap();
        let written = factory.written();
        assert_eq!(written.len(), 1);
        assert!(matches!(
            &written[0],
            crate::core::realtime::TransportFrame::Text(text) if text.contains("session.update")
        ));
    }

    #[tokio::test]
    async fn test_open_transport_closes_when_shutdown_interrupts_handshake() {
        let endpoint = EndpointConfig::new("mock://upstream")
            .with_handshake(serde_json::json!({"type": "session.update"}));
        let (session, _channels) = Session::new(
            ManagerConfig::default(),
            Credentials::new("test-key"),
            endpoint,
        );
        session.state.transition(SessionState::Connecting).unwrap();
        let factory = MockTransportFactory::new();
        factory.pause_writes();

        let opening = {
            let session = session.clone();
            let factory = factory.clone();
            tokio::spawn(async move { session.open_transport(&factory).await.map(|_| ()) })
        };
        assert!(factory.wait_for_transports(1, Duration::from_secs(1)).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.state.transition(SessionState::Closing).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), opening)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(TransportError::Closed));
        assert!(factory.latest().unwrap().is_closed());
        assert!(factory.written().is_empty());
    }

    #[tokio::test]
    async fn test_open_transport_closes_on_failure() {
        let (session, _channels) = session_with(ManagerConfig::default());
        let factory = MockTransportFactory::new();
        factory.fail_next_opens([TransportError::Unauthorized("bad key".to_string())]);

        let result = session.open_transport(&factory).await;
        assert!(matches!(result, Err(TransportError::Unauthorized(_))));
        assert!(factory.latest().unwrap().is_closed());
    }

    #[test]
    fn test_retry_bookkeeping() {
        let (session, _channels) = session_with(ManagerConfig::default());
        assert_eq!(session.bump_retry(), 1);
        assert_eq!(session.bump_retry(), 2);
        assert_eq!(session.retry_count(), 2);
        session.reset_retries();
        assert_eq!(session.retry_count(), 0);
    }
}
