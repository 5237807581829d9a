pub mod commands;
pub mod config;
pub mod core;

// Re-export commonly used items for convenience
pub use config::BridgeConfig;
pub use crate::core::*;
