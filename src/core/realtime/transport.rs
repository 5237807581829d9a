//! Transport abstraction used by the session manager.
//!
//! The manager never constructs a transport directly. It holds a
//! [`TransportFactory`] and asks it for a fresh [`Transport`] on every
//! (re)connection, so production and test builds differ only in the factory
//! they inject.
//!
//! All methods take `&self`: the sender loop owns writes and the inbound
//! dispatcher owns reads of the same handle, so implementations keep the
//! read and write halves behind separate locks.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::base::EndpointConfig;

/// Errors reported by transports.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Nothing arrived within the read timeout
    #[error("Receive timed out")]
    Timeout,

    /// The connection is closed (locally or by the remote end)
    #[error("Transport closed")]
    Closed,

    /// The remote end rejected the credentials
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The connection handshake failed
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Any other I/O or protocol failure
    #[error("I/O error: {0}")]
    Io(String),
}

impl TransportError {
    /// Whether reconnecting may fix the problem.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::Unauthorized(_))
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// A raw frame read from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFrame {
    Binary(Bytes),
    Text(String),
}

/// A duplex message channel to the upstream service.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the connection and authenticate with `auth_token`.
    async fn open(&self, endpoint: &EndpointConfig, auth_token: &str) -> TransportResult<()>;

    /// Write a binary frame.
    async fn send_binary(&self, data: Bytes) -> TransportResult<()>;

    /// Write a text frame.
    async fn send_text(&self, text: String) -> TransportResult<()>;

    /// Read the next frame, waiting at most `timeout`.
    ///
    /// Returns [`TransportError::Timeout`] when nothing arrived and
    /// [`TransportError::Closed`] once the connection is gone.
    async fn receive(&self, timeout: Duration) -> TransportResult<TransportFrame>;

    /// Close the connection. Closing twice is not an error.
    async fn close(&self) -> TransportResult<()>;
}

/// Shared handle to a transport.
pub type BoxedTransport = Arc<dyn Transport>;

/// Produces a fresh, unopened transport on every call.
pub trait TransportFactory: Send + Sync {
    fn create(&self) -> BoxedTransport;
}

impl<F> TransportFactory for F
where
    F: Fn() -> BoxedTransport + Send + Sync,
{
    fn create(&self) -> BoxedTransport {
        self()
    }
}
