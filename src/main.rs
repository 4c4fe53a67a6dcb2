//! Classroom Realtime CLI - watch and poke dashboard channels from a terminal.
//!
//! This is the main binary entry point. See the `classroom_realtime`
//! library for the multiplexer itself.

use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use classroom_realtime::transport::socket::cable_url;
use classroom_realtime::transport::TransportEvents;
use classroom_realtime::{
    filter, CableTransport, ChannelName, Config, Event, HttpTokenProvider, Message, Multiplexer,
};
use mimalloc::MiMalloc;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// How long `send` waits for the connection before giving up.
const SEND_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Grace period for the socket task to write the last frame.
const SEND_LINGER: Duration = Duration::from_millis(250);

// CLI
#[derive(Parser)]
#[command(name = "classroom-realtime")]
#[command(version)]
#[command(about = "Real-time event channel client for the classroom dashboard")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print events from one or more channels as JSON lines
    Watch {
        /// Channels to subscribe to (e.g. class-42, private-studio-7)
        #[arg(required = true)]
        channels: Vec<String>,
        /// Only print these message types (repeatable)
        #[arg(long = "type", value_name = "TYPE")]
        types: Vec<String>,
    },
    /// Send one message on a channel
    Send {
        /// Destination channel
        channel: String,
        /// Message type (e.g. request-leaderboard)
        kind: String,
        /// JSON payload
        payload: Option<String>,
    },
    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    if let Commands::Config = cli.command {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    // The multiplexer is single-threaded.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(async move {
        match cli.command {
            Commands::Watch { channels, types } => watch(&config, channels, types).await,
            Commands::Send {
                channel,
                kind,
                payload,
            } => send(&config, channel, &kind, payload.as_deref()).await,
            Commands::Config => Ok(()),
        }
    })
}

fn build(config: &Config) -> Result<(Multiplexer, TransportEvents)> {
    let mut transport = CableTransport::new(config.cable_options());
    if config.has_token() {
        let provider = HttpTokenProvider::new(&config.server_url, config.token.clone())?;
        transport = transport.with_token_provider(Arc::new(provider));
    }
    let events = transport
        .take_events()
        .context("Transport event stream already taken")?;
    let mux = Multiplexer::new(transport, config.mux_options());
    Ok((mux, events))
}

async fn watch(config: &Config, channels: Vec<String>, types: Vec<String>) -> Result<()> {
    let (mux, events) = build(config)?;

    for channel in channels {
        let predicate: filter::Predicate = if types.is_empty() {
            Rc::new(filter::any())
        } else {
            Rc::new(filter::kinds(types.clone()))
        };
        let name = ChannelName::from(channel);
        let printed = name.clone();
        mux.subscribe_with_errors(
            name,
            move |m| predicate(m),
            move |m| {
                let line = serde_json::json!({ "channel": printed.as_str(), "message": m.to_wire() });
                println!("{line}");
                Ok(())
            },
            |e| eprintln!("error: {e}"),
        );
    }

    mux.connect(&cable_url(&config.server_url), &config.auth_params());

    tokio::select! {
        () = mux.run(events) => {}
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for ctrl-c")?;
            log::info!("Interrupted, disconnecting");
        }
    }

    mux.disconnect();
    let diag = mux.diagnostics();
    log::info!(
        "Delivered {} of {} message(s) ({} malformed, {} handler failures)",
        diag.delivered,
        diag.dispatched,
        diag.malformed,
        diag.handler_failures
    );
    Ok(())
}

async fn send(config: &Config, channel: String, kind: &str, payload: Option<&str>) -> Result<()> {
    let payload = match payload {
        Some(text) => serde_json::from_str(text).context("Payload is not valid JSON")?,
        None => serde_json::Value::Null,
    };
    let event = Event::decode(kind, payload)?;

    let (mux, events) = build(config)?;
    mux.send(channel, Message::new(event));
    mux.connect(&cable_url(&config.server_url), &config.auth_params());

    let flushed = async {
        while mux.queued() > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };

    let sent = tokio::select! {
        () = mux.run(events) => false,
        () = flushed => true,
        () = tokio::time::sleep(SEND_CONNECT_TIMEOUT) => false,
    };

    if sent {
        tokio::time::sleep(SEND_LINGER).await;
    }
    mux.disconnect();

    if !sent {
        anyhow::bail!("Could not deliver message within {:?}", SEND_CONNECT_TIMEOUT);
    }
    println!("sent");
    Ok(())
}
