pub mod realtime;

// Re-export commonly used types for convenience
pub use realtime::{
    Credentials, EndpointConfig, InboundEvent, ManagerConfig, RealtimeSessionManager, RunOutcome,
    SessionError, SessionResult, SessionState,
};
