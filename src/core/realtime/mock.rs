//! In-process transport for tests and offline demos.
//!
//! [`MockTransportFactory`] hands out [`MockTransport`]s that never touch the
//! network. Inbound frames are scripted by the caller, failures are injected
//! on demand and every successful write is recorded, so the manager runs the
//! exact same code path it runs against the real service.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use nyra_realtime::core::realtime::{
//!     Credentials, EndpointConfig, ManagerConfig, MockTransportFactory, RealtimeSessionManager,
//! };
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let factory = MockTransportFactory::new();
//! let manager = RealtimeSessionManager::new(Arc::new(factory.clone()), ManagerConfig::default())?;
//! manager
//!     .connect(Credentials::new("test-key"), EndpointConfig::new("mock://upstream"))
//!     .await?;
//!
//! manager.send_audio(&b"pcm"[..]).await?;
//! factory.latest().unwrap().push_binary(&b"tts"[..]);
//! let event = manager.receive_voice(Duration::from_secs(1)).await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use super::base::EndpointConfig;
use super::transport::{
    BoxedTransport, Transport, TransportError, TransportFactory, TransportFrame, TransportResult,
};

/// How often the wait helpers re-check their condition.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// State shared by a factory and every transport it created.
struct MockShared {
    transports: Mutex<Vec<Arc<MockTransport>>>,
    open_failures: Mutex<VecDeque<TransportError>>,
    write_failures: Mutex<HashSet<usize>>,
    write_attempts: AtomicUsize,
    written: Mutex<Vec<TransportFrame>>,
    /// `true` while writes are allowed to complete
    write_gate: watch::Sender<bool>,
}

impl MockShared {
    fn new() -> Self {
        let (write_gate, _rx) = watch::channel(true);
        Self {
            transports: Mutex::new(Vec::new()),
            open_failures: Mutex::new(VecDeque::new()),
            write_failures: Mutex::new(HashSet::new()),
            write_attempts: AtomicUsize::new(0),
            written: Mutex::new(Vec::new()),
            write_gate,
        }
    }
}

/// Factory producing [`MockTransport`]s that share one script.
#[derive(Clone)]
pub struct MockTransportFactory {
    shared: Arc<MockShared>,
}

impl Default for MockTransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(MockShared::new()),
        }
    }

    /// Make the next `open` calls fail with the given errors, in order.
    pub fn fail_next_opens(&self, errors: impl IntoIterator<Item = TransportError>) {
        self.shared.open_failures.lock().extend(errors);
    }

    /// Fail the `n`-th write attempt (1-based, counted across all transports).
    ///
    /// The failing transport behaves as if the remote end dropped: every later
    /// operation on it reports [`TransportError::Closed`].
    pub fn fail_write_attempt(&self, n: usize) {
        self.shared.write_failures.lock().insert(n);
    }

    /// Hold every write until [`resume_writes`](Self::resume_writes) or until
    /// the transport closes.
    pub fn pause_writes(&self) {
        self.shared.write_gate.send_replace(false);
    }

    pub fn resume_writes(&self) {
        self.shared.write_gate.send_replace(true);
    }

    /// Number of transports handed out so far.
    pub fn created(&self) -> usize {
        self.shared.transports.lock().len()
    }

    pub fn transports(&self) -> Vec<Arc<MockTransport>> {
        self.shared.transports.lock().clone()
    }

    /// The most recently created transport.
    pub fn latest(&self) -> Option<Arc<MockTransport>> {
        self.shared.transports.lock().last().cloned()
    }

    /// Every successful write across all transports, in order.
    pub fn written(&self) -> Vec<TransportFrame> {
        self.shared.written.lock().clone()
    }

    /// Payloads of every successful binary write, in order.
    pub fn binary_writes(&self) -> Vec<Bytes> {
        self.shared
            .written
            .lock()
            .iter()
            .filter_map(|frame| match frame {
                TransportFrame::Binary(data) => Some(data.clone()),
                TransportFrame::Text(_) => None,
            })
            .collect()
    }

    /// Number of write attempts, successful or not.
    pub fn write_attempts(&self) -> usize {
        self.shared.write_attempts.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` binary writes were recorded.
    pub async fn wait_for_binary_writes(&self, count: usize, timeout: Duration) -> bool {
        poll_until(timeout, || self.binary_writes().len() >= count).await
    }

    /// Wait until at least `count` transports were created.
    pub async fn wait_for_transports(&self, count: usize, timeout: Duration) -> bool {
        poll_until(timeout, || self.created() >= count).await
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(&self) -> BoxedTransport {
        let transport = Arc::new(MockTransport::new(self.shared.clone()));
        self.shared.transports.lock().push(transport.clone());
        transport
    }
}

async fn poll_until<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn wait_until_set(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|set| *set).await;
}

/// Scriptable in-memory transport.
pub struct MockTransport {
    shared: Arc<MockShared>,
    inbound_tx: mpsc::UnboundedSender<TransportFrame>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<TransportFrame>>,
    opened: AtomicBool,
    closed: watch::Sender<bool>,
    endpoint: Mutex<Option<EndpointConfig>>,
    writes: Mutex<Vec<TransportFrame>>,
}

impl MockTransport {
    fn new(shared: Arc<MockShared>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (closed, _rx) = watch::channel(false);
        Self {
            shared,
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            opened: AtomicBool::new(false),
            closed,
            endpoint: Mutex::new(None),
            writes: Mutex::new(Vec::new()),
        }
    }

    /// Queue a frame for the reader.
    pub fn push_frame(&self, frame: TransportFrame) {
        let _ = self.inbound_tx.send(frame);
    }

    pub fn push_binary(&self, data: impl Into<Bytes>) {
        self.push_frame(TransportFrame::Binary(data.into()));
    }

    pub fn push_text(&self, text: impl Into<String>) {
        self.push_frame(TransportFrame::Text(text.into()));
    }

    /// Simulate the remote end dropping the connection.
    pub fn drop_connection(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::SeqCst) && !self.is_closed()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Endpoint passed to `open`, if it was called.
    pub fn endpoint(&self) -> Option<EndpointConfig> {
        self.endpoint.lock().clone()
    }

    /// Successful writes on this transport only.
    pub fn writes(&self) -> Vec<TransportFrame> {
        self.writes.lock().clone()
    }

    async fn write(&self, frame: TransportFrame) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let mut gate = self.shared.write_gate.subscribe();
        let mut closed = self.closed.subscribe();
        tokio::select! {
            _ = wait_until_set(&mut gate) => {}
            _ = wait_until_set(&mut closed) => return Err(TransportError::Closed),
        }
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let attempt = self.shared.write_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.shared.write_failures.lock().remove(&attempt) {
            self.drop_connection();
            return Err(TransportError::Io(format!(
                "injected failure on write attempt {attempt}"
            )));
        }

        self.writes.lock().push(frame.clone());
        self.shared.written.lock().push(frame);
        Ok(())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, endpoint: &EndpointConfig, auth_token: &str) -> TransportResult<()> {
        if auth_token.is_empty() {
            return Err(TransportError::Unauthorized(
                "missing bearer token".to_string(),
            ));
        }

        let failure = self.shared.open_failures.lock().pop_front();
        if let Some(error) = failure {
            return Err(error);
        }

        *self.endpoint.lock() = Some(endpoint.clone());
        self.opened.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send_binary(&self, data: Bytes) -> TransportResult<()> {
        self.write(TransportFrame::Binary(data)).await
    }

    async fn send_text(&self, text: String) -> TransportResult<()> {
        self.write(TransportFrame::Text(text)).await
    }

    async fn receive(&self, timeout: Duration) -> TransportResult<TransportFrame> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let mut closed = self.closed.subscribe();
        let mut inbound = self.inbound_rx.lock().await;
        tokio::select! {
            biased;
            _ = wait_until_set(&mut closed) => Err(TransportError::Closed),
            frame = inbound.recv() => frame.ok_or(TransportError::Closed),
            _ = tokio::time::sleep(timeout) => Err(TransportError::Timeout),
        }
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.send_replace(true);
        Ok(())
    }
}
