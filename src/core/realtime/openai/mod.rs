//! OpenAI Realtime API support.
//!
//! Provides the WebSocket [`OpenAIRealtimeTransport`] and the options that
//! produce the `session.update` handshake resent on every reconnection.
//!
//! # Audio Format
//!
//! Input and output audio is PCM 16-bit signed little-endian at 24kHz.
//! G.711 u-law and a-law are also supported at 8kHz.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use nyra_realtime::core::realtime::openai::{OpenAIRealtimeOptions, OpenAIRealtimeTransportFactory};
//! use nyra_realtime::core::realtime::{Credentials, ManagerConfig, RealtimeSessionManager};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = RealtimeSessionManager::new(
//!     Arc::new(OpenAIRealtimeTransportFactory),
//!     ManagerConfig::default(),
//! )?;
//! let options = OpenAIRealtimeOptions::default();
//! manager.connect(Credentials::new("sk-..."), options.endpoint()).await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod messages;
mod transport;

pub use config::{
    OPENAI_REALTIME_SAMPLE_RATE, OPENAI_REALTIME_URL, OpenAIRealtimeAudioFormat,
    OpenAIRealtimeModel, OpenAIRealtimeOptions, OpenAIRealtimeVoice,
};
pub use messages::{ClientEvent, SessionConfig, TurnDetection};
pub use transport::{OpenAIRealtimeTransport, OpenAIRealtimeTransportFactory, USER_AGENT};
