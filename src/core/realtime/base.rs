//! Base types for the realtime session manager.
//!
//! This module defines the error taxonomy, the configuration knobs and the
//! data exchanged between callers and the session tasks:
//!
//! - [`OutboundItem`] flows from callers to the sender loop
//! - [`InboundEvent`] flows from the inbound dispatcher to callers
//! - [`Credentials`] and [`EndpointConfig`] describe how to reach the upstream service

use bytes::Bytes;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::state::SessionState;
use super::transport::TransportError;

// =============================================================================
// Error Types
// =============================================================================

/// Errors surfaced by the session manager.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Opening the transport or performing the handshake failed
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    /// The upstream service rejected the credentials
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// `connect` was called while a session is connecting or open
    #[error("Session already connected")]
    AlreadyConnected,

    /// The outbound queue is at capacity
    #[error("Outbound queue is full")]
    QueueFull,

    /// The operation requires an open session
    #[error("Not connected")]
    NotConnected,

    /// No inbound event arrived within the caller's wait budget
    #[error("Timed out waiting for an inbound event")]
    Timeout,

    /// The session is closed or failed and will not come back
    #[error("Session closed")]
    Closed,

    /// Transport level failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The state machine rejected a transition
    #[error("Illegal state transition from {from} to {to}")]
    IllegalTransition {
        from: SessionState,
        to: SessionState,
    },
}

impl SessionError {
    /// Map a transport error raised while connecting into the connect taxonomy.
    pub(crate) fn from_connect(err: TransportError) -> Self {
        match err {
            TransportError::Unauthorized(msg) => SessionError::AuthenticationFailed(msg),
            TransportError::Timeout => {
                SessionError::ConnectFailed("handshake timed out".to_string())
            }
            other => SessionError::ConnectFailed(other.to_string()),
        }
    }
}

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

// =============================================================================
// Configuration Types
// =============================================================================

/// Configuration for automatic reconnection behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectionConfig {
    /// Enable automatic reconnection on connection loss.
    /// Default: true
    pub enabled: bool,

    /// Maximum number of reconnection attempts before giving up.
    /// Set to 0 for unlimited attempts.
    /// Default: 5
    pub max_attempts: u32,

    /// Initial delay between reconnection attempts (milliseconds).
    /// Default: 500ms
    pub initial_delay_ms: u64,

    /// Maximum delay between reconnection attempts (milliseconds).
    /// Default: 30000ms (30 seconds)
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff.
    /// Default: 2.0
    pub backoff_multiplier: f32,

    /// Whether to add up to 25% jitter to the delay.
    /// Default: true
    pub jitter: bool,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            initial_delay_ms: 500,
            max_delay_ms: 30000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ReconnectionConfig {
    /// Create a config with reconnection disabled.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Calculate the delay for a given attempt number (1-based) using
    /// exponential backoff. The result never exceeds `max_delay_ms`.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_delay = self.initial_delay_ms as f64;
        let multiplier = self.backoff_multiplier.max(1.0) as f64;
        let ceiling = self.max_delay_ms as f64;

        // Exponential backoff: base_delay * multiplier^(attempt-1)
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let mut delay = (base_delay * multiplier.powi(exponent)).min(ceiling);

        if self.jitter && delay > 0.0 {
            let jitter_range = delay * 0.25;
            delay += rand::thread_rng().gen_range(-jitter_range..=jitter_range);
        }

        Duration::from_millis(delay.clamp(0.0, ceiling) as u64)
    }

    /// Check if another reconnection attempt is allowed after `attempts_made`.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        self.enabled && (self.max_attempts == 0 || attempts_made < self.max_attempts)
    }

    /// Human readable attempt budget for log lines.
    pub(crate) fn budget_label(&self) -> String {
        if self.max_attempts == 0 {
            "unlimited".to_string()
        } else {
            self.max_attempts.to_string()
        }
    }
}

/// What `send_audio` does when the outbound queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum QueueFullPolicy {
    /// Fail with [`SessionError::QueueFull`] straight away
    #[default]
    RejectImmediately,
    /// Wait up to `timeout_ms` for room, then fail with [`SessionError::QueueFull`]
    BlockWithTimeout { timeout_ms: u64 },
}

/// What happens to queued-but-unsent outbound items when the link is replaced
/// or the session is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundRetention {
    /// Keep items across reconnection and flush them on disconnect
    #[default]
    Preserve,
    /// Drop items on reconnection and on disconnect
    DiscardOnReconnect,
}

/// Tuning for a [`RealtimeSessionManager`](super::RealtimeSessionManager).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Capacity of the outbound queue. Default: 256
    pub outbound_capacity: usize,
    /// Capacity of the inbound event queue. Default: 256
    pub inbound_capacity: usize,
    /// Behavior of `send_audio` on a full outbound queue
    pub queue_full_policy: QueueFullPolicy,
    /// Fate of queued items on reconnection and disconnect
    pub retention: OutboundRetention,
    /// Reconnection policy
    pub reconnection: ReconnectionConfig,
    /// Budget for transport open plus handshake (milliseconds). Default: 10000
    pub connect_timeout_ms: u64,
    /// How long the dispatcher waits on a single transport read (milliseconds). Default: 250
    pub receive_poll_ms: u64,
    /// Grace period for the background tasks to exit on disconnect (milliseconds). Default: 2000
    pub shutdown_grace_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            inbound_capacity: 256,
            queue_full_policy: QueueFullPolicy::default(),
            retention: OutboundRetention::default(),
            reconnection: ReconnectionConfig::default(),
            connect_timeout_ms: 10_000,
            receive_poll_ms: 250,
            shutdown_grace_ms: 2_000,
        }
    }
}

impl ManagerConfig {
    /// Check the configuration for values the manager cannot work with.
    pub fn validate(&self) -> SessionResult<()> {
        if self.outbound_capacity == 0 {
            return Err(SessionError::InvalidConfiguration(
                "outbound_capacity must be greater than zero".to_string(),
            ));
        }
        if self.inbound_capacity == 0 {
            return Err(SessionError::InvalidConfiguration(
                "inbound_capacity must be greater than zero".to_string(),
            ));
        }
        if self.receive_poll_ms == 0 {
            return Err(SessionError::InvalidConfiguration(
                "receive_poll_ms must be greater than zero".to_string(),
            ));
        }
        if self.reconnection.initial_delay_ms > self.reconnection.max_delay_ms {
            return Err(SessionError::InvalidConfiguration(
                "reconnection.initial_delay_ms exceeds reconnection.max_delay_ms".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub(crate) fn receive_poll(&self) -> Duration {
        Duration::from_millis(self.receive_poll_ms)
    }

    pub(crate) fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

// =============================================================================
// Credentials & Endpoint
// =============================================================================

/// API credentials for the upstream service.
///
/// The key is zeroized on drop and never shows up in `Debug` output.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    api_key: String,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
        }
    }

    /// The raw bearer token. Only transports should call this.
    pub fn expose(&self) -> &str {
        &self.api_key
    }

    pub fn is_empty(&self) -> bool {
        self.api_key.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

/// Where and how to open the upstream session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// WebSocket URL including query parameters
    pub url: String,
    /// Message sent right after the transport opens, on every (re)connection
    #[serde(default)]
    pub handshake: Option<serde_json::Value>,
}

impl EndpointConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            handshake: None,
        }
    }

    pub fn with_handshake(mut self, handshake: serde_json::Value) -> Self {
        self.handshake = Some(handshake);
        self
    }
}

// =============================================================================
// Queue Items
// =============================================================================

/// An item produced by callers and written to the transport by the sender loop.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundItem {
    /// Raw audio, written as a binary frame
    AudioFrame { data: Bytes, sequence: u64 },
    /// Structured control payload, written as a text frame
    ControlMessage(serde_json::Value),
}

impl OutboundItem {
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundItem::AudioFrame { .. } => "audio",
            OutboundItem::ControlMessage(_) => "control",
        }
    }
}

/// A classified frame read from the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// Synthesized audio from the upstream service
    VoiceAudio(Bytes),
    /// Control or metadata payload
    ControlEvent(serde_json::Value),
    /// Read failure or remote close; routed to the reconnection supervisor
    TransportError(TransportError),
}

impl InboundEvent {
    pub fn is_voice(&self) -> bool {
        matches!(self, InboundEvent::VoiceAudio(_))
    }

    /// The audio payload, if this is a voice event.
    pub fn audio(&self) -> Option<&Bytes> {
        match self {
            InboundEvent::VoiceAudio(data) => Some(data),
            _ => None,
        }
    }
}
