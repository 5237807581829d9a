//! Configuration for the realtime bridge
//!
//! Configuration comes from .env files, environment variables and an optional
//! YAML file. Priority: YAML > ENV vars > .env values > defaults.
//!
//! # Example
//! ```rust,no_run
//! use nyra_realtime::config::BridgeConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load from environment variables only
//! let config = BridgeConfig::from_env()?;
//!
//! // Load from YAML file with environment variable base
//! let config = BridgeConfig::from_file(&PathBuf::from("config.yaml"))?;
//! println!("Connecting to {}", config.realtime.ws_url());
//! # Ok(())
//! # }
//! ```

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

mod yaml;

pub use yaml::{ManagerYaml, OpenAIYaml, YamlConfig};

use crate::core::realtime::openai::{
    OpenAIRealtimeAudioFormat, OpenAIRealtimeModel, OpenAIRealtimeOptions, OpenAIRealtimeVoice,
};
use crate::core::realtime::{Credentials, EndpointConfig, ManagerConfig, REDACTED};

/// Environment variables the bridge deployment expects to be present.
pub const REQUIRED_ENV_KEYS: [&str; 4] = [
    "OPENAI_API_KEY",
    "TWILIO_ACCOUNT_SID",
    "TWILIO_AUTH_TOKEN",
    "ADMIN_TOKEN",
];

/// Names of required environment variables that are unset or empty.
///
/// Only names are returned, never values.
pub fn missing_required_env() -> Vec<&'static str> {
    REQUIRED_ENV_KEYS
        .iter()
        .copied()
        .filter(|key| env::var(key).map(|v| v.trim().is_empty()).unwrap_or(true))
        .collect()
}

/// Bridge configuration
///
/// Everything needed to run a realtime session:
/// - the OpenAI API key
/// - realtime session options (endpoint, model, voice, audio format)
/// - session manager tuning (queues, backpressure, reconnection)
#[derive(Clone)]
pub struct BridgeConfig {
    pub openai_api_key: Option<String>,
    pub realtime: OpenAIRealtimeOptions,
    pub manager: ManagerConfig,
}

impl fmt::Debug for BridgeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeConfig")
            .field("openai_api_key", &self.openai_api_key.as_ref().map(|_| REDACTED))
            .field("realtime", &self.realtime)
            .field("manager", &self.manager)
            .finish()
    }
}

/// Zeroize the API key when the configuration is dropped.
impl Drop for BridgeConfig {
    fn drop(&mut self) {
        use zeroize::Zeroize;

        if let Some(ref mut key) = self.openai_api_key {
            key.zeroize();
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>, String> {
    match env_string(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| format!("Invalid value for {key}: expected a number")),
        None => Ok(None),
    }
}

fn env_bool(key: &str) -> Option<bool> {
    env_string(key).map(|v| {
        matches!(
            v.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

impl BridgeConfig {
    /// Load configuration from environment variables
    ///
    /// Recognized variables:
    /// - `OPENAI_API_KEY`
    /// - `OPENAI_REALTIME_URL`, `OPENAI_REALTIME_MODEL`, `OPENAI_REALTIME_VOICE`,
    ///   `OPENAI_REALTIME_AUDIO_FORMAT`, `OPENAI_REALTIME_INSTRUCTIONS`,
    ///   `OPENAI_REALTIME_SERVER_VAD`
    /// - `REALTIME_QUEUE_CAPACITY`, `REALTIME_MAX_RETRIES`,
    ///   `REALTIME_CONNECT_TIMEOUT_MS`
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let config = Self::load(None)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file with environment variable base
    ///
    /// The .env file is loaded in main.rs at startup, so by the time this
    /// runs the environment already holds .env values. YAML overrides them.
    ///
    /// # Errors
    /// Returns an error if the YAML file cannot be read or is malformed, an
    /// environment variable has an invalid format, or validation fails.
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let yaml_config = YamlConfig::from_file(path)?;
        let config = Self::load(Some(yaml_config))?;
        config.validate()?;
        Ok(config)
    }

    fn load(yaml: Option<YamlConfig>) -> Result<Self, Box<dyn std::error::Error>> {
        let mut realtime = OpenAIRealtimeOptions::default();
        let mut manager = ManagerConfig::default();
        let mut openai_api_key = env_string("OPENAI_API_KEY");

        // Environment
        if let Some(url) = env_string("OPENAI_REALTIME_URL") {
            realtime.url = url;
        }
        if let Some(model) = env_string("OPENAI_REALTIME_MODEL") {
            realtime.model = OpenAIRealtimeModel::from_str_or_default(&model);
        }
        if let Some(voice) = env_string("OPENAI_REALTIME_VOICE") {
            realtime.voice = OpenAIRealtimeVoice::from_str_or_default(&voice);
        }
        if let Some(format) = env_string("OPENAI_REALTIME_AUDIO_FORMAT") {
            realtime.audio_format = OpenAIRealtimeAudioFormat::from_str_or_default(&format);
        }
        if let Some(instructions) = env_string("OPENAI_REALTIME_INSTRUCTIONS") {
            realtime.instructions = Some(instructions);
        }
        if let Some(server_vad) = env_bool("OPENAI_REALTIME_SERVER_VAD") {
            realtime.server_vad = server_vad;
        }
        if let Some(capacity) = env_parse::<usize>("REALTIME_QUEUE_CAPACITY")? {
            manager.outbound_capacity = capacity;
            manager.inbound_capacity = capacity;
        }
        if let Some(max_attempts) = env_parse::<u32>("REALTIME_MAX_RETRIES")? {
            manager.reconnection.max_attempts = max_attempts;
        }
        if let Some(timeout_ms) = env_parse::<u64>("REALTIME_CONNECT_TIMEOUT_MS")? {
            manager.connect_timeout_ms = timeout_ms;
        }

        // YAML overrides
        if let Some(yaml) = yaml {
            if let Some(openai) = yaml.openai {
                if openai.api_key.is_some() {
                    openai_api_key = openai.api_key;
                }
                if let Some(url) = openai.url {
                    realtime.url = url;
                }
                if let Some(model) = openai.model {
                    realtime.model = OpenAIRealtimeModel::from_str_or_default(&model);
                }
                if let Some(voice) = openai.voice {
                    realtime.voice = OpenAIRealtimeVoice::from_str_or_default(&voice);
                }
                if let Some(format) = openai.audio_format {
                    realtime.audio_format =
                        OpenAIRealtimeAudioFormat::from_str_or_default(&format);
                }
                if openai.instructions.is_some() {
                    realtime.instructions = openai.instructions;
                }
                if let Some(server_vad) = openai.server_vad {
                    realtime.server_vad = server_vad;
                }
            }

            if let Some(m) = yaml.manager {
                if let Some(capacity) = m.outbound_capacity {
                    manager.outbound_capacity = capacity;
                }
                if let Some(capacity) = m.inbound_capacity {
                    manager.inbound_capacity = capacity;
                }
                if let Some(policy) = m.queue_full_policy {
                    manager.queue_full_policy = policy;
                }
                if let Some(retention) = m.retention {
                    manager.retention = retention;
                }
                if let Some(reconnection) = m.reconnection {
                    manager.reconnection = reconnection;
                }
                if let Some(timeout_ms) = m.connect_timeout_ms {
                    manager.connect_timeout_ms = timeout_ms;
                }
                if let Some(poll_ms) = m.receive_poll_ms {
                    manager.receive_poll_ms = poll_ms;
                }
                if let Some(grace_ms) = m.shutdown_grace_ms {
                    manager.shutdown_grace_ms = grace_ms;
                }
            }
        }

        Ok(Self {
            openai_api_key,
            realtime,
            manager,
        })
    }

    /// Check the merged configuration.
    ///
    /// The API key is not required here: `validate-env` and `demo` run
    /// without one.
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.realtime.url.trim().is_empty() {
            return Err("OpenAI realtime URL must not be empty".into());
        }
        if !(self.realtime.url.starts_with("ws://") || self.realtime.url.starts_with("wss://")) {
            return Err(format!(
                "OpenAI realtime URL must use ws:// or wss://, got {}",
                self.realtime.url
            )
            .into());
        }
        self.manager.validate()?;
        Ok(())
    }

    /// Credentials for the session manager, if an API key is configured.
    pub fn credentials(&self) -> Option<Credentials> {
        self.openai_api_key.as_deref().map(Credentials::new)
    }

    /// Endpoint including the `session.update` handshake.
    pub fn endpoint(&self) -> EndpointConfig {
        self.realtime.endpoint()
    }
}
