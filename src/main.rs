//! ipcbus CLI - poke at local IPC endpoints from a shell.
//!
//! See the `ipcbus` library for the transport itself.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ipcbus::{Body, IpcConfig, IpcMessageClient, IpcPublisher, IpcServer, ReplySender, SocketAddress, Subscriber};
use mimalloc::MiMalloc;
use tokio::io::AsyncBufReadExt;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Grace period for queued publisher writes before exiting.
const PUBLISH_DRAIN: Duration = Duration::from_millis(200);

// CLI
#[derive(Parser)]
#[command(name = "ipcbus")]
#[command(version)]
#[command(about = "Send, serve, publish and subscribe over local IPC sockets")]
struct Cli {
    /// JSON config file (IPCBUS_* environment variables still apply)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every message received; echo it back when the sender expects a reply
    Serve {
        /// Socket path, or a port number for loopback TCP
        address: SocketAddress,
    },
    /// Send one JSON message without waiting for an answer
    Send {
        /// Socket path, or a port number for loopback TCP
        address: SocketAddress,
        /// Message body as JSON
        json: String,
    },
    /// Send one JSON message and print the reply
    Request {
        /// Socket path, or a port number for loopback TCP
        address: SocketAddress,
        /// Message body as JSON
        json: String,
        /// Seconds to wait for the reply
        #[arg(long, default_value_t = 5)]
        timeout: u64,
    },
    /// Publish one JSON document per stdin line to every subscriber
    Publish {
        /// Socket path, or a port number for loopback TCP
        address: SocketAddress,
    },
    /// Print messages from a publisher until it closes
    Subscribe {
        /// Socket path, or a port number for loopback TCP
        address: SocketAddress,
        /// Stop after this many seconds without a message
        #[arg(long)]
        timeout: Option<u64>,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<IpcConfig> {
    match path {
        Some(path) => IpcConfig::load(path),
        None => {
            let mut config = IpcConfig::default();
            config.apply_env();
            Ok(config)
        }
    }
}

fn parse_json(json: &str) -> Result<Body> {
    let value: serde_json::Value = serde_json::from_str(json).context("Message is not valid JSON")?;
    Ok(Body::from(value))
}

/// Render a body for the terminal.
fn render(body: &Body) -> String {
    match body.decode::<serde_json::Value>() {
        Ok(value) => value.to_string(),
        Err(_) => format!("{body:?}"),
    }
}

async fn serve(address: SocketAddress) -> Result<()> {
    let server = IpcServer::new(address.clone(), |body: Body, reply: ReplySender| async move {
        println!("{}", render(&body));
        if let Err(e) = reply.send(body).await {
            log::warn!("Failed to reply: {e}");
        }
    });
    server.start().with_context(|| format!("Failed to start server on {address}"))?;

    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down...");
    server.close();
    Ok(())
}

async fn publish(address: SocketAddress, config: &IpcConfig) -> Result<()> {
    let publisher = IpcPublisher::new(address.clone(), config);
    publisher
        .start()
        .with_context(|| format!("Failed to start publisher on {address}"))?;

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let sent = publisher.publish(parse_json(&line)?)?;
        log::debug!("Published to {sent} subscriber(s)");
    }

    tokio::time::sleep(PUBLISH_DRAIN).await;
    publisher.close();
    Ok(())
}

async fn subscribe(address: SocketAddress, config: &IpcConfig, timeout: Option<u64>) -> Result<()> {
    let subscriber = Subscriber::new(address, config);
    let timeout = timeout.map(Duration::from_secs);
    while let Some(body) = subscriber.next_message(timeout).await? {
        println!("{}", render(&body));
    }
    subscriber.close();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Serve { address } => serve(address).await?,
        Commands::Send { address, json } => {
            let client = IpcMessageClient::new(address);
            client.send(parse_json(&json)?).await?;
            client.close();
        }
        Commands::Request { address, json, timeout } => {
            let client = IpcMessageClient::new(address);
            let reply = client
                .request(parse_json(&json)?, Some(Duration::from_secs(timeout)))
                .await
                .context("Request failed")?;
            println!("{}", render(&reply));
            client.close();
        }
        Commands::Publish { address } => publish(address, &config).await?,
        Commands::Subscribe { address, timeout } => subscribe(address, &config, timeout).await?,
    }

    Ok(())
}
