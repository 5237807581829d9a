//! Implementations of the `nyra-realtime` CLI subcommands.
//!
//! ```text
//! $ nyra-realtime demo
//! $ nyra-realtime live --input caller.pcm --output reply.pcm
//! $ nyra-realtime validate-env
//! ```
//!
//! `demo` never touches the network. `live` opens a real session with the
//! OpenAI Realtime API using the key from the environment.

use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{BridgeConfig, missing_required_env};
use crate::core::realtime::openai::{
    ClientEvent, OpenAIRealtimeAudioFormat, OpenAIRealtimeTransportFactory,
};
use crate::core::realtime::{
    Credentials, EndpointConfig, InboundEvent, ManagerConfig, MockTransportFactory,
    RealtimeSessionManager, SessionError,
};

/// What the offline demo exchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct DemoReport {
    /// Frames the mock upstream recorded, in write order
    pub sent: Vec<Bytes>,
    /// Voice frames handed back to the caller
    pub received: Vec<Bytes>,
}

/// Run the manager against an in-process upstream that echoes two synthesized frames.
pub async fn demo(config: ManagerConfig) -> Result<DemoReport> {
    let factory = MockTransportFactory::new();
    let manager = RealtimeSessionManager::new(Arc::new(factory.clone()), config)?;

    println!("Connecting to mock realtime upstream (local demo, no network used)");
    manager
        .connect(
            Credentials::new("demo-key"),
            EndpointConfig::new("mock://realtime"),
        )
        .await?;

    let upstream = factory
        .latest()
        .ok_or_else(|| anyhow!("mock upstream was not created"))?;
    let remote_tts = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        upstream.push_binary(Bytes::from_static(b"mock-tts-frame-1"));
        tokio::time::sleep(Duration::from_millis(30)).await;
        upstream.push_binary(Bytes::from_static(b"mock-tts-frame-2"));
    });

    manager.send_audio(Bytes::from_static(b"pcm-frame-1")).await?;
    manager.send_audio(Bytes::from_static(b"pcm-frame-2")).await?;

    let mut received = Vec::new();
    while received.len() < 2 {
        match manager.receive_voice(Duration::from_secs(1)).await? {
            InboundEvent::VoiceAudio(audio) => {
                println!("received: {}", String::from_utf8_lossy(&audio));
                received.push(audio);
            }
            other => debug!(?other, "Ignoring non-voice event"),
        }
    }

    let _ = remote_tts.await;
    manager.disconnect().await;

    Ok(DemoReport {
        sent: factory.binary_writes(),
        received,
    })
}

/// Options for [`live`].
#[derive(Debug, Clone)]
pub struct LiveOptions {
    /// Chunk length streamed per `send_audio` call
    pub chunk_ms: u32,
    /// Stop listening after this long without an inbound event
    pub idle_timeout: Duration,
}

impl Default for LiveOptions {
    fn default() -> Self {
        Self {
            chunk_ms: 20,
            idle_timeout: Duration::from_secs(5),
        }
    }
}

/// Bytes of audio per `chunk_ms` milliseconds in `format`.
pub fn chunk_size(format: OpenAIRealtimeAudioFormat, chunk_ms: u32) -> usize {
    let bytes_per_sample = match format {
        OpenAIRealtimeAudioFormat::Pcm16 => 2,
        OpenAIRealtimeAudioFormat::G711Ulaw | OpenAIRealtimeAudioFormat::G711Alaw => 1,
    };
    let samples = format.sample_rate() as usize * chunk_ms.max(1) as usize / 1000;
    samples.max(1) * bytes_per_sample
}

/// Stream a raw audio file to the OpenAI Realtime API and save the reply.
///
/// Returns the number of reply audio bytes written to `output`.
pub async fn live(
    config: &BridgeConfig,
    input: &Path,
    output: &Path,
    options: LiveOptions,
) -> Result<usize> {
    let credentials = config
        .credentials()
        .context("OPENAI_API_KEY must be set to run `nyra-realtime live`")?;

    let audio = tokio::fs::read(input)
        .await
        .with_context(|| format!("Failed to read input audio {}", input.display()))?;

    let manager = RealtimeSessionManager::new(
        Arc::new(OpenAIRealtimeTransportFactory),
        config.manager.clone(),
    )?;
    manager.connect(credentials, config.endpoint()).await?;
    info!(session_id = ?manager.session_id(), "Live session open");

    let chunk = chunk_size(config.realtime.audio_format, options.chunk_ms);
    let pace = Duration::from_millis(options.chunk_ms as u64);
    let mut sent = 0usize;
    for frame in audio.chunks(chunk) {
        manager.send_audio(Bytes::copy_from_slice(frame)).await?;
        sent += frame.len();
        tokio::time::sleep(pace).await;
    }
    info!(bytes = sent, "Finished streaming input audio");

    if !config.realtime.server_vad {
        end_turn(&manager).await?;
    }

    let mut reply = Vec::new();
    loop {
        match manager.receive_voice(options.idle_timeout).await {
            Ok(InboundEvent::VoiceAudio(data)) => reply.extend_from_slice(&data),
            Ok(InboundEvent::ControlEvent(event)) => {
                let kind = event.get("type").and_then(|t| t.as_str()).unwrap_or("");
                debug!(event_type = kind, "Control event");
                if kind == "error" {
                    warn!("Upstream reported an error: {}", event);
                }
                if kind == "response.done" {
                    break;
                }
            }
            Ok(InboundEvent::TransportError(e)) => warn!("Transport error: {}", e),
            Err(SessionError::Timeout) => {
                info!("No inbound events for {:?}, stopping", options.idle_timeout);
                break;
            }
            Err(e) => {
                manager.disconnect().await;
                return Err(e.into());
            }
        }
    }

    manager.disconnect().await;

    tokio::fs::write(output, &reply)
        .await
        .with_context(|| format!("Failed to write reply audio {}", output.display()))?;
    println!("Wrote {} bytes of reply audio to {}", reply.len(), output.display());

    Ok(reply.len())
}

/// Commit the buffered caller audio and ask for a response.
async fn end_turn(manager: &RealtimeSessionManager) -> Result<()> {
    for event in [ClientEvent::InputAudioBufferCommit, ClientEvent::ResponseCreate] {
        manager.send_control(serde_json::to_value(&event)?).await?;
    }
    Ok(())
}

/// Check required environment variables, printing only the names of missing ones.
pub fn validate_env() -> Result<()> {
    // Local overrides; never replaces variables that are already set
    let _ = dotenvy::from_filename(".env.local");

    let missing = missing_required_env();
    if !missing.is_empty() {
        println!("Missing required environment variables: {}", missing.join(", "));
        return Err(anyhow!("{} required variable(s) missing", missing.len()));
    }

    println!("All required environment variables appear to be present.");
    Ok(())
}
