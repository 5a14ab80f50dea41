//! Conduit CLI - run a bus server or talk to one from the command line.
//!
//! `conduit serve` answers requests on the `echo` channel and logs
//! notifications on the log channel. `conduit send` connects as a client,
//! sends one notification or request, and exits.

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use conduit_core::{
    IpcAddress, IpcConfig, IpcDefaults, IpcManager, LinkState, MessageKind, Statistics,
};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Channel the server answers requests on.
const ECHO_CHANNEL: &str = "echo";

#[derive(Parser, Debug)]
#[command(name = "conduit")]
#[command(about = "Local IPC message bus")]
struct Args {
    /// Enable debug logging (RUST_LOG takes precedence when set)
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a server until Ctrl-C, then print statistics as JSON
    Serve(ServeArgs),
    /// Connect as a client and send one message
    Send(SendArgs),
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    /// Endpoint: tcp://127.0.0.1:PORT, a socket path, or a pipe name
    #[arg(short, long)]
    address: Option<String>,

    /// Maximum concurrent peers
    #[arg(long, default_value_t = IpcDefaults::MAX_PEERS)]
    max_peers: usize,

    /// Channel whose notifications are logged
    #[arg(long, default_value = "log")]
    log_channel: String,
}

#[derive(clap::Args, Debug)]
struct SendArgs {
    /// Endpoint: tcp://127.0.0.1:PORT, a socket path, or a pipe name
    #[arg(short, long)]
    address: Option<String>,

    /// Channel to send on
    #[arg(short, long)]
    channel: String,

    /// Payload, sent as UTF-8 bytes
    #[arg(short, long, default_value = "")]
    payload: String,

    /// Send a request and print the response payload
    #[arg(long)]
    request: bool,

    /// How long to wait for a response
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,

    /// How long to wait for the connection
    #[arg(long, default_value_t = 5000)]
    connect_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug);

    match args.command {
        Command::Serve(serve_args) => serve(serve_args).await,
        Command::Send(send_args) => send(send_args).await,
    }
}

fn init_logging(debug: bool) {
    // Logs go to stderr; stdout carries output meant for scripts.
    let builder = FmtSubscriber::builder()
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact();

    if std::env::var_os("RUST_LOG").is_some() {
        builder.with_env_filter(EnvFilter::from_default_env()).init();
    } else {
        let log_level = if debug { Level::DEBUG } else { Level::INFO };
        builder.with_max_level(log_level).init();
    }
}

fn resolve_address(address: Option<&str>) -> Result<IpcAddress> {
    match address {
        Some(address) => Ok(IpcAddress::parse(address)?),
        None => Ok(IpcAddress::default_local()),
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let address = resolve_address(args.address.as_deref())?;
    info!("Starting Conduit server");

    let manager = IpcManager::new();

    let responder = manager.responder();
    manager.on_message(ECHO_CHANNEL, move |msg| {
        if msg.kind == MessageKind::Request {
            responder.reply(msg, msg.payload.clone())?;
        }
        Ok(())
    });

    let log_channel = args.log_channel.clone();
    manager.on_message(args.log_channel, move |msg| {
        info!("[{}] {}", log_channel, msg.payload_lossy());
        Ok(())
    });

    manager.on_connection(|peer, connected| {
        if connected {
            info!("Peer {} connected", peer);
        } else {
            info!("Peer {} disconnected", peer);
        }
    });
    manager.on_error(|description, code| warn!("{} (code {})", description, code));

    manager
        .start(IpcConfig::server(address).with_max_peers(args.max_peers))
        .await?;
    manager
        .wait_for_state(|s| *s == LinkState::Listening, Duration::from_secs(10))
        .await
        .context("server did not start listening")?;
    let local = manager
        .local_address()
        .context("server has no bound address")?;

    // Print the address for scripts to read (intentional stdout)
    println!("IPC_ADDRESS={}", local);
    info!("Conduit server running on {}", local);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");

    manager.stop().await;
    println!("{}", serde_json::to_string_pretty(&manager.statistics())?);
    Ok(())
}

async fn send(args: SendArgs) -> Result<()> {
    let address = resolve_address(args.address.as_deref())?;
    let connect_timeout = Duration::from_millis(args.connect_timeout_ms);

    let manager = IpcManager::new();
    manager
        .start(
            IpcConfig::client(address.clone())
                .with_reconnect(false)
                .with_io_timeout(connect_timeout),
        )
        .await?;

    let result = exchange(&manager, &address, args, connect_timeout).await;
    manager.stop().await;
    result
}

async fn exchange(
    manager: &IpcManager,
    address: &IpcAddress,
    args: SendArgs,
    connect_timeout: Duration,
) -> Result<()> {
    let state = manager
        .wait_for_state(
            |s| matches!(s, LinkState::Connected | LinkState::Failed),
            connect_timeout + Duration::from_secs(1),
        )
        .await
        .with_context(|| format!("timed out connecting to {}", address))?;
    if state == LinkState::Failed {
        bail!("could not connect to {}", address);
    }

    let payload = Bytes::from(args.payload.into_bytes());
    let timeout = Duration::from_millis(args.timeout_ms);

    if args.request {
        let reply = manager
            .send_request(args.channel.as_str(), payload, timeout)
            .await
            .with_context(|| format!("request on {} failed", args.channel))?;
        println!("{}", String::from_utf8_lossy(&reply));
    } else {
        let before = manager.statistics();
        manager.send(args.channel.as_str(), payload)?;
        wait_for_delivery(manager, before, timeout).await?;
        info!("Sent notification on {}", args.channel);
    }
    Ok(())
}

/// Wait until the dispatcher has written (or dropped) the queued message.
async fn wait_for_delivery(manager: &IpcManager, before: Statistics, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let now = manager.statistics();
        if now.messages_sent > before.messages_sent {
            return Ok(());
        }
        if now.messages_dropped > before.messages_dropped {
            bail!("message was dropped: connection to server lost");
        }
        if Instant::now() >= deadline {
            bail!("timed out waiting for the message to be written");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
