//! `superbridge` - HTTP gateway to a stateful upstream inference service.
//!
//! `superbridge serve` (the default) runs the HTTP adapter. `health` and
//! `chat` open their own short-lived upstream connection for scripting and
//! troubleshooting.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use futures::StreamExt;
use superbridge_gateway::{ChatSession, Gateway, SessionId};
use superbridge_server::{ServerConfig, run, warm_up};
use superbridge_telemetry::{LogFormat, LogTarget, setup_logging};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Superbridge - one gateway in front of one stateful inference service.
#[derive(Parser)]
#[command(name = "superbridge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, env = "SUPERBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Upstream host (overrides config and environment)
    #[arg(long, global = true)]
    upstream_host: Option<String>,

    /// Upstream port (overrides config and environment)
    #[arg(long, global = true)]
    upstream_port: Option<u16>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server (default)
    Serve {
        /// Address to listen on
        #[arg(short, long)]
        listen: Option<String>,

        /// Skip connecting and loading models before accepting requests
        #[arg(long)]
        no_warm_up: bool,
    },

    /// Print the upstream health report as JSON; exits 1 when degraded
    Health,

    /// Send one prompt and stream the reply to stdout
    Chat {
        /// Prompt text
        prompt: String,

        /// Continue an existing upstream session
        #[arg(short, long)]
        session: Option<i64>,

        /// Client label sent upstream
        #[arg(long)]
        name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let mut config = ServerConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(host) = cli.upstream_host {
        config.gateway.upstream.host = host;
    }
    if let Some(port) = cli.upstream_port {
        config.gateway.upstream.port = port;
    }

    let command = cli.command.unwrap_or(Commands::Serve {
        listen: None,
        no_warm_up: false,
    });

    // One-shot commands keep stdout for their output.
    let mut log_config = config.logging.clone();
    if cli.verbose {
        log_config.level = "debug".into();
    }
    if !matches!(command, Commands::Serve { .. }) {
        if !cli.verbose {
            log_config.level = "warn".into();
        }
        log_config = log_config
            .with_target(LogTarget::Stderr)
            .with_format(LogFormat::Compact);
    }
    if let Err(e) = setup_logging(&log_config) {
        eprintln!("Failed to initialize logging: {e}");
    }

    match command {
        Commands::Serve { listen, no_warm_up } => {
            if let Some(listen) = listen {
                config.server.listen = listen;
            }
            if no_warm_up {
                config.server.connect_on_startup = false;
            }
            serve(config).await?;
            Ok(ExitCode::SUCCESS)
        },
        Commands::Health => health(config).await,
        Commands::Chat {
            prompt,
            session,
            name,
        } => chat(config, prompt, session, name).await,
    }
}

async fn serve(config: ServerConfig) -> Result<()> {
    let addr = config.listen_addr()?;
    let gateway = Gateway::with_websocket(config.gateway.clone());

    if config.server.connect_on_startup {
        warm_up(&gateway).await;
    }

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    println!(
        "{}",
        format!(
            "superbridge listening on {addr} (upstream {})",
            config.gateway.upstream.target()
        )
        .cyan()
        .bold()
    );

    run(listener, gateway, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;

    info!("superbridge stopped");
    Ok(())
}

async fn health(config: ServerConfig) -> Result<ExitCode> {
    let gateway = Gateway::with_websocket(config.gateway);
    // A failed connect still yields a (degraded) report.
    let _ = gateway.connect().await;

    let report = gateway.health().await;
    gateway.disconnect().await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.is_healthy() {
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!("{} {}", "DEGRADED".yellow(), report.message);
        Ok(ExitCode::FAILURE)
    }
}

async fn chat(
    config: ServerConfig,
    prompt: String,
    session: Option<i64>,
    name: Option<String>,
) -> Result<ExitCode> {
    let label = name.unwrap_or_else(|| config.gateway.upstream.client_name.clone());
    let gateway = Gateway::with_websocket(config.gateway);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let session_id = match session {
        Some(id) => SessionId::new(id),
        None => {
            // Connecting first lets allocation avoid ids in the upstream history.
            let _ = gateway.connect().await;
            gateway.allocate_session_id().await
        },
    };
    eprintln!("{}", format!("session {session_id}").dimmed());

    let session = ChatSession::new(session_id, label);
    let result = stream_reply(&gateway, session, prompt, cancel.clone()).await;
    gateway.disconnect().await;

    match result {
        Ok(()) if cancel.is_cancelled() => {
            eprintln!("{}", "cancelled".yellow());
            Ok(ExitCode::from(130))
        },
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            eprintln!("{} {e:#}", "error:".red().bold());
            Ok(ExitCode::FAILURE)
        },
    }
}

async fn stream_reply(
    gateway: &Gateway,
    session: ChatSession,
    prompt: String,
    cancel: CancellationToken,
) -> Result<()> {
    let mut stream = gateway.chat(session, prompt, cancel).await?;
    let mut stdout = std::io::stdout();
    while let Some(chunk) = stream.next().await {
        write!(stdout, "{}", chunk?)?;
        stdout.flush()?;
    }
    writeln!(stdout)?;
    Ok(())
}
