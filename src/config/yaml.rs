use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;

use crate::core::realtime::{OutboundRetention, QueueFullPolicy, REDACTED, ReconnectionConfig};

/// Complete YAML configuration structure
///
/// All fields are optional so a file can override just the values it cares
/// about; everything else comes from the environment or the defaults.
///
/// # Example YAML structure
/// ```yaml
/// openai:
///   api_key: "sk-..."
///   url: "wss://api.openai.com/v1/realtime"
///   model: "gpt-4o-mini-realtime-preview"
///   voice: "coral"
///   audio_format: "g711_ulaw"
///   instructions: "You are a friendly phone assistant."
///   server_vad: true
///
/// manager:
///   outbound_capacity: 256
///   inbound_capacity: 256
///   queue_full_policy:
///     mode: block_with_timeout
///     timeout_ms: 50
///   retention: preserve
///   connect_timeout_ms: 10000
///   receive_poll_ms: 250
///   shutdown_grace_ms: 2000
///   reconnection:
///     max_attempts: 5
///     initial_delay_ms: 500
///     max_delay_ms: 30000
///     backoff_multiplier: 2.0
///     jitter: true
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub openai: Option<OpenAIYaml>,
    pub manager: Option<ManagerYaml>,
}

/// OpenAI Realtime settings from YAML
#[derive(Clone, Deserialize, Default)]
#[serde(default)]
pub struct OpenAIYaml {
    pub api_key: Option<String>,
    pub url: Option<String>,
    pub model: Option<String>,
    pub voice: Option<String>,
    pub audio_format: Option<String>,
    pub instructions: Option<String>,
    pub server_vad: Option<bool>,
}

impl fmt::Debug for OpenAIYaml {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAIYaml")
            .field("api_key", &self.api_key.as_ref().map(|_| REDACTED))
            .field("url", &self.url)
            .field("model", &self.model)
            .field("voice", &self.voice)
            .field("audio_format", &self.audio_format)
            .field("instructions", &self.instructions)
            .field("server_vad", &self.server_vad)
            .finish()
    }
}

/// Session manager tuning from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ManagerYaml {
    pub outbound_capacity: Option<usize>,
    pub inbound_capacity: Option<usize>,
    pub queue_full_policy: Option<QueueFullPolicy>,
    pub retention: Option<OutboundRetention>,
    pub reconnection: Option<ReconnectionConfig>,
    pub connect_timeout_ms: Option<u64>,
    pub receive_poll_ms: Option<u64>,
    pub shutdown_grace_ms: Option<u64>,
}

impl YamlConfig {
    /// Load configuration from a YAML file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or the YAML is malformed.
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {e}", path.display()))?;

        let config: YamlConfig = serde_yaml::from_str(&contents)
            .map_err(|e| format!("Failed to parse YAML config: {e}"))?;

        Ok(config)
    }
}
