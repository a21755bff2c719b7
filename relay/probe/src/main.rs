//! Relay Probe - Diagnostic CLI for local inference backends
//!
//! Exercises the relay against whatever backends are configured: lists the
//! discovered models, probes health, and sends one generation through the
//! router with retry and failover.
//!
//! # Usage
//!
//! ```bash
//! # Models from every healthy backend
//! relay-probe models
//!
//! # Bypass the discovery cache
//! relay-probe models --refresh --json
//!
//! # Health of each configured backend
//! relay-probe health
//!
//! # One generation, streamed to stdout
//! relay-probe generate --backend ollama --model llama2:7b --stream "Why is the sky blue?"
//!
//! # Alternate config file
//! relay-probe --config ./relay.toml health
//!
//! # Verbose logging
//! RUST_LOG=relay_core=debug relay-probe models
//! ```

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use relay_core::{
    default_config_path, load_config_from_path, BackendKind, GenerateContentRequest, ModelTarget,
    RelayClient,
};

/// Relay Probe - inspect and exercise local LLM backends
#[derive(Parser, Debug)]
#[command(name = "relay-probe")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "RELAY_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "RELAY_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List models discovered on healthy backends
    Models {
        /// Rescan even if the cached catalog is fresh
        #[arg(long)]
        refresh: bool,

        /// Print the catalog as JSON
        #[arg(long)]
        json: bool,
    },

    /// Probe each enabled backend
    Health,

    /// Send one generation through the router
    Generate {
        /// Backend that owns the model (ollama, openai_compatible)
        #[arg(short = 'b', long)]
        backend: BackendKind,

        /// Backend-native model id
        #[arg(short = 'm', long)]
        model: String,

        /// Optional system prompt
        #[arg(long)]
        system: Option<String>,

        /// Sampling temperature
        #[arg(long)]
        temperature: Option<f32>,

        /// Maximum tokens to generate
        #[arg(long)]
        max_tokens: Option<u32>,

        /// Print chunks as they arrive
        #[arg(long)]
        stream: bool,

        /// Prompt text
        prompt: String,
    },
}

/// Token cancelled on the first Ctrl-C
fn ctrl_c_token() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            child.cancel();
        }
    });
    token
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("relay_probe={level},relay_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

async fn list_models(client: &RelayClient, refresh: bool, json: bool) -> Result<()> {
    let models = if refresh {
        client.refresh_models().await
    } else {
        client.discover_models().await
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&models)?);
        return Ok(());
    }

    if models.is_empty() {
        warn!("No models discovered; is any backend running?");
        return Ok(());
    }

    for model in &models {
        let context = model
            .capabilities
            .max_context_length
            .map_or_else(|| "-".to_string(), |n| n.to_string());
        println!(
            "{:<18} {:<48} ctx={:<8} chat={}",
            model.backend, model.id, context, model.capabilities.supports_chat
        );
    }

    let result = client.discovery_result().await;
    for error in &result.errors {
        warn!(backend = %error.backend, error = %error.message, "Backend skipped");
    }
    Ok(())
}

async fn show_health(client: &RelayClient) {
    for kind in client.discovery().enabled_backends() {
        let status = client.check_health(kind).await;
        if status.available {
            let ms = status.response_time.map_or(0, |t| t.as_millis());
            println!("{:<18} {:<24} up   {ms}ms", kind, status.endpoint);
        } else {
            println!(
                "{:<18} {:<24} down {}",
                kind,
                status.endpoint,
                status.error.unwrap_or_default()
            );
        }
    }
}

async fn generate(
    client: &RelayClient,
    request: GenerateContentRequest,
    target: ModelTarget,
) -> Result<()> {
    let cancel = ctrl_c_token();

    if !request.stream.unwrap_or(false) {
        let response = client
            .generate_with_cancel(&request, &target, cancel)
            .await
            .map_err(|e| anyhow::anyhow!("{e}\n  ({})", e.technical_message))?;
        println!("{}", response.content);
        if let Some(usage) = response.usage {
            info!(
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "Generation complete"
            );
        }
        return Ok(());
    }

    let mut stream = client
        .generate_stream(&request, &target)
        .await
        .map_err(|e| anyhow::anyhow!("{e}\n  ({})", e.technical_message))?;

    let mut stdout = std::io::stdout();
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                stream.close();
                warn!("Cancelled");
                break;
            }
            chunk = stream.next() => {
                let Some(chunk) = chunk else { break };
                let chunk = chunk.context("Stream failed")?;
                write!(stdout, "{}", chunk.content)?;
                stdout.flush()?;
                if chunk.is_final() {
                    break;
                }
            }
        }
    }
    writeln!(stdout)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    let config_path = args.config.or_else(default_config_path);
    let config = load_config_from_path(config_path).context("Failed to load configuration")?;
    info!(source = %config.source(), "Configuration loaded");

    let client = RelayClient::new(&config);

    match args.command {
        Command::Models { refresh, json } => list_models(&client, refresh, json).await?,
        Command::Health => show_health(&client).await,
        Command::Generate {
            backend,
            model,
            system,
            temperature,
            max_tokens,
            stream,
            prompt,
        } => {
            let mut request =
                GenerateContentRequest::new(model.clone(), prompt).with_stream(stream);
            if let Some(system) = system {
                request = request.with_system(system);
            }
            if let Some(temperature) = temperature {
                request = request.with_temperature(temperature);
            }
            if let Some(max_tokens) = max_tokens {
                request = request.with_max_tokens(max_tokens);
            }
            generate(&client, request, ModelTarget::new(model, backend)).await?;
        }
    }

    Ok(())
}
