//! Realtime streaming session manager.
//!
//! Keeps one long-lived, bidirectional session with a realtime speech-AI
//! service alive on behalf of a telephony bridge: caller audio goes out in
//! order, synthesized voice comes back as [`InboundEvent`]s, and dropped
//! connections are re-established with exponential backoff without the
//! caller noticing more than a short gap.
//!
//! # Architecture
//!
//! - [`RealtimeSessionManager`] is the facade callers use
//! - [`Transport`] / [`TransportFactory`] abstract the wire; the manager asks
//!   the factory for a fresh transport on every (re)connection
//! - a sender loop, an inbound dispatcher and a reconnection supervisor run
//!   as background tasks while a session is live
//! - [`MockTransportFactory`] runs the whole stack in-process for tests
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use nyra_realtime::core::realtime::openai::{OpenAIRealtimeOptions, OpenAIRealtimeTransportFactory};
//! use nyra_realtime::core::realtime::{Credentials, ManagerConfig, RealtimeSessionManager};
//!
//! # async fn demo(caller_audio: Vec<u8>) -> Result<(), Box<dyn std::error::Error>> {
//! let manager = RealtimeSessionManager::new(
//!     Arc::new(OpenAIRealtimeTransportFactory),
//!     ManagerConfig::default(),
//! )?;
//! manager
//!     .connect(Credentials::new("sk-..."), OpenAIRealtimeOptions::default().endpoint())
//!     .await?;
//!
//! manager.send_audio(caller_audio).await?;
//! let event = manager.receive_voice(Duration::from_secs(5)).await?;
//! if let Some(audio) = event.audio() {
//!     // play audio back to the caller
//! }
//! manager.disconnect().await;
//! # Ok(())
//! # }
//! ```

mod base;
mod dispatcher;
mod manager;
mod mock;
mod sender;
mod session;
mod state;
mod supervisor;
mod transport;

pub mod openai;

pub use base::{
    Credentials, EndpointConfig, InboundEvent, ManagerConfig, OutboundItem, OutboundRetention,
    QueueFullPolicy, ReconnectionConfig, SessionError, SessionResult,
};
pub use dispatcher::{FrameClassifier, REDACTED};
pub use manager::{RealtimeSessionManager, RunOutcome};
pub use mock::{MockTransport, MockTransportFactory};
pub use state::SessionState;
pub use transport::{
    BoxedTransport, Transport, TransportError, TransportFactory, TransportFrame, TransportResult,
};
