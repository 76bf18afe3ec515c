use std::path::PathBuf;
#[cfg(feature = "http-api")]
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use tracing::{debug, info};

use keyrelay_core::config::{self, Config};
use keyrelay_core::error::ConfigError;
use keyrelay_core::fallback::FallbackOrchestrator;
use keyrelay_core::types::{CompletionOptions, Message};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(
    name = "keyrelay",
    about = "API key rotation and provider fallback for LLM and image APIs",
    version = keyrelay_core::VERSION,
)]
struct Cli {
    /// Config file (default: ~/.keyrelay/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat completion through the fallback chain
    Chat {
        /// Message to send
        message: Vec<String>,
        /// Model to request (default from config)
        #[arg(short, long)]
        model: Option<String>,
        #[arg(short, long)]
        temperature: Option<f64>,
        #[arg(long)]
        max_tokens: Option<u32>,
    },
    /// Generate code in a given language
    Code {
        prompt: Vec<String>,
        #[arg(short, long, default_value = "python")]
        language: String,
    },
    /// Generate an image and print its URL
    Image {
        prompt: Vec<String>,
        /// Width in pixels (0 uses the configured default)
        #[arg(long, default_value_t = 0)]
        width: u32,
        /// Height in pixels (0 uses the configured default)
        #[arg(long, default_value_t = 0)]
        height: u32,
    },
    /// Ask every key at once and keep the best answer
    Instant { prompt: Vec<String> },
    /// Show providers and key status
    Status,
    /// Ping each chat provider
    Health,
    /// Start the HTTP API server
    #[cfg(feature = "http-api")]
    Serve {
        /// Override the configured port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Write a default config file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("keyrelay=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.clone();

    match cli.command {
        Commands::Init => cmd_init(config_path)?,
        command => {
            let cfg = load(config_path.as_deref())?;
            run(command, cfg).await?;
        }
    }

    Ok(())
}

/// Resolve configuration: an explicit path must exist; otherwise the default
/// file and `KEYRELAY_CONFIG` are used. Keys from the environment are added on top.
fn load(path: Option<&std::path::Path>) -> Result<Config> {
    let cfg = match path {
        Some(p) => {
            if !p.exists() {
                return Err(ConfigError::NotFound(p.to_path_buf()).into());
            }
            let mut cfg = config::load_config(Some(p));
            config::overlay_env(&mut cfg, &|name: &str| std::env::var(name).ok());
            cfg
        }
        None => config::load_config_from_env(),
    };
    cfg.validate()?;
    debug!(
        "Loaded {} chat and {} image providers",
        cfg.providers.len(),
        cfg.image_providers.len()
    );
    Ok(cfg)
}

async fn run(command: Commands, cfg: Config) -> Result<()> {
    let orchestrator = FallbackOrchestrator::from_config(&cfg)?;

    match command {
        Commands::Chat {
            message,
            model,
            temperature,
            max_tokens,
        } => {
            let text = joined(message)?;
            let options = CompletionOptions {
                temperature,
                max_tokens,
                ..CompletionOptions::default()
            };
            let resp = orchestrator
                .ai_completion(vec![Message::user(text)], model.as_deref(), options)
                .await?;
            print_json(&resp)?;
        }
        Commands::Code { prompt, language } => {
            let resp = orchestrator
                .generate_code_with_fallback(&joined(prompt)?, &language)
                .await?;
            println!("{}", resp.content);
        }
        Commands::Image {
            prompt,
            width,
            height,
        } => {
            let image = orchestrator
                .generate_image_with_fallback(&joined(prompt)?, width, height)
                .await?;
            print_json(&image)?;
        }
        Commands::Instant { prompt } => {
            let resp = orchestrator.instant_completion(&joined(prompt)?).await?;
            print_json(&resp)?;
        }
        Commands::Status => cmd_status(&orchestrator)?,
        Commands::Health => {
            let health = orchestrator.health_check().await;
            for (name, ok) in &health {
                println!("{:<16} {}", name, if *ok { "✓" } else { "✗" });
            }
        }
        #[cfg(feature = "http-api")]
        Commands::Serve { port } => {
            use keyrelay_core::service::http::{serve, AppState};

            let addr = format!("{}:{}", cfg.gateway.host, port.unwrap_or(cfg.gateway.port));
            let state = Arc::new(AppState::new(Arc::new(orchestrator)));
            info!("Starting keyrelay {} on {}", keyrelay_core::VERSION, addr);
            serve(&addr, state).await?;
        }
        // Handled before any config is loaded.
        Commands::Init => {}
    }

    Ok(())
}

fn cmd_init(path: Option<PathBuf>) -> Result<()> {
    let target = path.clone().unwrap_or_else(config::get_config_path);
    if target.exists() {
        println!("Config already exists at {}", target.display());
        println!("Delete it first to re-initialize.");
        return Ok(());
    }

    config::save_config(&Config::default(), path.as_deref())?;
    info!("Wrote default config to {}", target.display());
    println!("Created config at {}", target.display());
    println!("\nNext steps:");
    println!("  1. Add keys to the config, or export LLM7_API_KEY / GEMINI_API_KEY / FAL_KEY");
    println!("  2. Chat: keyrelay chat \"Hello!\"");
    Ok(())
}

fn cmd_status(orchestrator: &FallbackOrchestrator) -> Result<()> {
    let providers = orchestrator.provider_status();
    if providers.is_empty() {
        println!("No providers configured.");
        return Ok(());
    }
    for p in &providers {
        println!(
            "{:<12} priority {:<3} {} ({} keys, current #{})",
            p.name,
            p.priority,
            if !p.enabled {
                "disabled"
            } else if p.available {
                "✓"
            } else {
                "✗ exhausted"
            },
            p.keys.len(),
            p.current_key_index,
        );
        for key in &p.keys {
            println!(
                "    {} {} errors={} last={}ms",
                key.key,
                if key.exhausted { "exhausted" } else { "ok" },
                key.error_count,
                key.response_time_ms,
            );
        }
    }
    Ok(())
}

fn joined(words: Vec<String>) -> Result<String> {
    let text = words.join(" ");
    if text.trim().is_empty() {
        anyhow::bail!("Prompt must not be empty");
    }
    Ok(text)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
