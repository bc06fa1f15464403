//! SessionLink - Session-based TCP messaging
//!
//! Demo front end: an echo server and a line-based client.

use std::path::PathBuf;
use std::sync::Mutex;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sessionlink::config::{self, Config};
use sessionlink::network::{Client, ClientEvent, Server, ServerEvent};
use sessionlink::protocol::RawBytes;

/// SessionLink - session-based TCP messaging
#[derive(Parser)]
#[command(name = "sessionlink")]
#[command(version = "0.1.0")]
#[command(about = "Exchange messages between a server and its clients", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an echo server
    Serve {
        /// Port to listen on (default: from configuration)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Connect to a server and send it lines read from stdin
    Connect {
        /// Server host name or address
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Server port (default: from configuration)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    init_logging(cli.verbose || config.general.verbose, &config)?;

    match cli.command {
        Commands::Serve { port } => {
            run_server(config, port).await?;
        }
        Commands::Connect { host, port } => {
            run_client(config, host, port).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

fn init_logging(verbose: bool, config: &Config) -> anyhow::Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    let file_layer = match &config.general.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(file_layer)
        .with(filter)
        .init();

    Ok(())
}

/// Run an echo server until Ctrl+C
async fn run_server(config: Config, port: Option<u16>) -> anyhow::Result<()> {
    let mut net_config = config.network;
    net_config.port = port.unwrap_or(net_config.port);

    let mut server = Server::new(net_config, RawBytes);
    let mut event_rx = server
        .take_event_receiver()
        .ok_or_else(|| anyhow::anyhow!("server event receiver already taken"))?;

    server.start().await?;

    println!("\n========================================");
    println!("  SessionLink Echo Server Running");
    println!("========================================");
    if let Some(addr) = server.local_addr().await {
        println!("  Listening: {}", addr);
    }
    println!("========================================");
    println!("\nWaiting for clients to connect...");
    println!("Press Ctrl+C to stop.\n");

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    ServerEvent::ClientConnected { session } => {
                        println!("+ Client connected: {}", session);
                    }
                    ServerEvent::ClientDisconnected { session, reason } => {
                        println!("- Client disconnected: {} ({})", session, reason);
                    }
                    ServerEvent::DataReceived { session, data } => {
                        tracing::debug!("Echoing {} bytes to {}", data.len(), session);
                        if let Err(e) = server.send(&data, session).await {
                            tracing::warn!("Echo to {} failed: {}", session, e);
                        }
                    }
                    ServerEvent::Fault { session, message } => {
                        tracing::error!("Server fault ({:?}): {}", session, message);
                    }
                    ServerEvent::Started { .. } | ServerEvent::Stopped => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    server.stop().await?;
    server.dispose().await;

    Ok(())
}

/// Connect to a server, send stdin lines, print whatever comes back
async fn run_client(config: Config, host: String, port: Option<u16>) -> anyhow::Result<()> {
    let mut net_config = config.network;
    net_config.port = port.unwrap_or(net_config.port);

    let mut client = Client::new(net_config, RawBytes);
    let mut event_rx = client
        .take_event_receiver()
        .ok_or_else(|| anyhow::anyhow!("client event receiver already taken"))?;

    println!("Connecting to {}:{}...", host, client.port());
    client.connect_host(&host).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    ClientEvent::ConnectionEstablished { session } => {
                        println!("Connected as session {}", session);
                        println!("Type lines to send, Ctrl+C to disconnect.\n");
                    }
                    ClientEvent::ConnectionClosed => {
                        println!("Connection closed by server");
                        return Ok(());
                    }
                    ClientEvent::DataReceived { data } => {
                        println!("< {}", String::from_utf8_lossy(&data));
                    }
                    ClientEvent::Fault { message } => {
                        tracing::error!("Client fault: {}", message);
                    }
                }
            }
            line = lines.next_line(), if stdin_open => {
                match line? {
                    Some(line) if line.is_empty() => {}
                    Some(line) => {
                        if let Err(e) = client.send(&line.into_bytes()).await {
                            tracing::warn!("Send failed: {}", e);
                        }
                    }
                    None => stdin_open = false,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nDisconnecting...");
                break;
            }
        }
    }

    client.disconnect().await?;

    Ok(())
}
