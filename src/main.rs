use std::path::PathBuf;
use std::time::Duration;

use anyhow::anyhow;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use nyra_realtime::BridgeConfig;
use nyra_realtime::commands::{self, LiveOptions};

/// Nyra Realtime - resilient streaming sessions with realtime speech-AI services
#[derive(Parser, Debug)]
#[command(name = "nyra-realtime")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the session manager against an in-process mock upstream
    Demo,

    /// Stream a raw audio file to the OpenAI Realtime API and save the reply
    Live {
        /// Raw audio to send, in the configured audio format
        #[arg(short = 'i', long = "input", value_name = "FILE")]
        input: PathBuf,

        /// Where to write the synthesized reply
        #[arg(short = 'o', long = "output", value_name = "FILE")]
        output: PathBuf,

        /// Milliseconds of audio per frame
        #[arg(long = "chunk-ms", default_value_t = 20)]
        chunk_ms: u32,

        /// Stop after this many seconds without inbound events
        #[arg(long = "idle-secs", default_value_t = 5)]
        idle_secs: u64,
    },

    /// Check that required environment variables are set (prints names only)
    ValidateEnv,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (must be done before config loading)
    let _ = dotenvy::dotenv();

    // Initialize tracing, RUST_LOG overrides the default level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Initialize crypto provider for TLS connections
    // This must be done before any TLS connections are attempted
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    if let Commands::ValidateEnv = cli.command {
        return commands::validate_env();
    }

    // Load configuration from file or environment
    let config = if let Some(config_path) = cli.config {
        println!("Loading configuration from {}", config_path.display());
        BridgeConfig::from_file(&config_path).map_err(|e| anyhow!(e.to_string()))?
    } else {
        BridgeConfig::from_env().map_err(|e| anyhow!(e.to_string()))?
    };

    match cli.command {
        Commands::Demo => {
            let report = commands::demo(config.manager.clone()).await?;
            println!(
                "Demo finished: sent {} frame(s), received {} frame(s)",
                report.sent.len(),
                report.received.len()
            );
        }
        Commands::Live {
            input,
            output,
            chunk_ms,
            idle_secs,
        } => {
            let options = LiveOptions {
                chunk_ms,
                idle_timeout: Duration::from_secs(idle_secs),
            };
            commands::live(&config, &input, &output, options).await?;
        }
        Commands::ValidateEnv => {}
    }

    Ok(())
}
