//! WebSocket cable transport.
//!
//! Owns the one physical connection to the dashboard's cable endpoint. A
//! background task manages the socket lifecycle (connect, welcome, ping,
//! reconnect with jittered exponential backoff) and translates cable frames
//! into [`TransportEvent`]s.
//!
//! # Architecture
//!
//! ```text
//!   Multiplexer (event loop)          CableTransport
//!         │                                 │
//!         │  open_channel / send / close    │  Command ──► connection task
//!         │ ──────────────────────────────► │              (socket owner)
//!         │                                 │
//!         │  TransportEvent stream          │
//!         │ ◄────────────────────────────── │ ◄── frames, state changes
//! ```
//!
//! The task does not remember channels across reconnects. Re-opening is the
//! Channel Registry's job, triggered by the `Connected` state event.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use super::backoff::{Backoff, BackoffPolicy};
use super::protocol::{self, InboundFrame};
use super::socket::{self, SocketFrame, SocketReader, SocketWriter};
use super::{AuthParams, ConnectionState, Transport, TransportEvent, TransportEvents};
use crate::auth::TokenProvider;
use crate::constants::{DEFAULT_CABLE_CHANNEL, WELCOME_TIMEOUT};
use crate::error::{ChannelOpenError, TransportError};
use crate::message::{ChannelName, Message};

/// Cable transport settings.
#[derive(Debug, Clone)]
pub struct CableOptions {
    /// Server-side cable channel class.
    pub cable_channel: String,
    /// Reconnect backoff.
    pub backoff: BackoffPolicy,
}

impl Default for CableOptions {
    fn default() -> Self {
        Self {
            cable_channel: DEFAULT_CABLE_CHANNEL.to_string(),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Request from the event loop to the connection task.
#[derive(Debug)]
enum Command {
    Open(ChannelName),
    Close(ChannelName),
    Send { channel: ChannelName, message: Message },
}

/// A running connection task.
#[derive(Debug)]
struct Session {
    command_tx: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Multiplexed WebSocket transport.
pub struct CableTransport {
    options: CableOptions,
    tokens: Option<Arc<dyn TokenProvider>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    event_rx: Option<TransportEvents>,
    session: Option<Session>,
}

impl std::fmt::Debug for CableTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CableTransport")
            .field("options", &self.options)
            .field("state", &*self.state_tx.borrow())
            .field("has_token_provider", &self.tokens.is_some())
            .field("running", &self.session.is_some())
            .finish_non_exhaustive()
    }
}

impl CableTransport {
    /// Create a disconnected transport.
    #[must_use]
    pub fn new(options: CableOptions) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            options,
            tokens: None,
            state_tx: Arc::new(state_tx),
            event_tx,
            event_rx: Some(event_rx),
            session: None,
        }
    }

    /// Use `provider` for private-channel tokens.
    #[must_use]
    pub fn with_token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.tokens = Some(provider);
        self
    }

    /// Take the inbound event stream. Returns `None` after the first call.
    pub fn take_events(&mut self) -> Option<TransportEvents> {
        self.event_rx.take()
    }

    fn command(&self, command: Command) -> Result<(), TransportError> {
        let session = self.session.as_ref().ok_or(TransportError::NotConnected)?;
        if session.command_tx.send(command).is_err() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

impl Transport for CableTransport {
    /// Spawns the connection task; must be called inside a tokio runtime.
    fn connect(&mut self, url: &str, auth: &AuthParams) {
        if let Some(session) = &self.session {
            if !session.task.is_finished() {
                log::debug!("[Cable] connect() while already running, ignoring");
                return;
            }
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let ctx = LoopContext {
            url: socket::cable_url(url),
            bearer: auth.token.clone(),
            cable_channel: self.options.cable_channel.clone(),
            backoff: self.options.backoff,
            tokens: self.tokens.clone(),
            state_tx: Arc::clone(&self.state_tx),
            event_tx: self.event_tx.clone(),
            cancel: cancel.clone(),
        };

        let task = tokio::spawn(run_connection_loop(ctx, command_rx));
        self.session = Some(Session {
            command_tx,
            cancel,
            task,
        });
    }

    fn disconnect(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        log::info!("[Cable] Disconnect requested");
        session.cancel.cancel();
        publish_state(&self.state_tx, &self.event_tx, ConnectionState::Disconnected);
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn open_channel(&mut self, channel: &ChannelName) -> Result<(), TransportError> {
        self.command(Command::Open(channel.clone()))
    }

    fn close_channel(&mut self, channel: &ChannelName) -> Result<(), TransportError> {
        self.command(Command::Close(channel.clone()))
    }

    fn send(&mut self, channel: &ChannelName, message: &Message) -> Result<(), TransportError> {
        if !self.state().is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.command(Command::Send {
            channel: channel.clone(),
            message: message.clone(),
        })
    }
}

impl Drop for CableTransport {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            session.cancel.cancel();
            publish_state(&self.state_tx, &self.event_tx, ConnectionState::Disconnected);
        }
    }
}

/// Publish a state change on the watch channel and the event stream.
///
/// Repeated states are not re-announced.
fn publish_state(
    state_tx: &watch::Sender<ConnectionState>,
    event_tx: &mpsc::UnboundedSender<TransportEvent>,
    state: ConnectionState,
) {
    let changed = state_tx.send_if_modified(|current| {
        if *current == state {
            false
        } else {
            *current = state;
            true
        }
    });
    if changed {
        log::debug!("[Cable] State -> {state}");
        let _ = event_tx.send(TransportEvent::StateChanged(state));
    }
}

// =============================================================================
// Connection task
// =============================================================================

/// Everything the connection task needs, moved into it at spawn.
struct LoopContext {
    url: String,
    bearer: Option<String>,
    cable_channel: String,
    backoff: BackoffPolicy,
    tokens: Option<Arc<dyn TokenProvider>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    cancel: CancellationToken,
}

impl LoopContext {
    /// Publish a state unless this session was cancelled.
    ///
    /// Whoever cancels has already published `Disconnected`, and a newer
    /// session may own the state by now.
    fn set_state(&self, state: ConnectionState) {
        if self.cancel.is_cancelled() {
            return;
        }
        publish_state(&self.state_tx, &self.event_tx, state);
    }

    /// Forward an event; `false` once nobody is listening.
    fn emit(&self, event: TransportEvent) -> bool {
        self.event_tx.send(event).is_ok()
    }
}

/// Why a connected session ended.
#[derive(Debug, PartialEq, Eq)]
enum SessionExit {
    /// `disconnect()` or the transport was dropped.
    Shutdown,
    /// Server asked us to go away for good.
    Refused,
    /// Connection lost; reconnect.
    Lost,
}

/// Connect, run, and reconnect until cancelled.
async fn run_connection_loop(ctx: LoopContext, mut commands: mpsc::UnboundedReceiver<Command>) {
    let mut backoff = Backoff::new(ctx.backoff);

    loop {
        ctx.set_state(ConnectionState::Connecting);
        log::info!("[Cable] Connecting to {}", ctx.url);

        let opened = tokio::select! {
            () = ctx.cancel.cancelled() => break,
            opened = open_socket(&ctx) => opened,
        };

        match opened {
            Ok((mut writer, mut reader)) => {
                backoff.reset();

                // Anything queued while offline predates this connection; the
                // registry replays opens once it sees `Connected`.
                let mut stale = 0usize;
                while commands.try_recv().is_ok() {
                    stale += 1;
                }
                if stale > 0 {
                    log::debug!("[Cable] Discarded {stale} stale command(s)");
                }

                ctx.set_state(ConnectionState::Connected);
                log::info!("[Cable] Connected");

                let exit = run_session(&ctx, &mut writer, &mut reader, &mut commands).await;
                match exit {
                    SessionExit::Shutdown => {
                        let _ = writer.close().await;
                        break;
                    }
                    SessionExit::Refused => {
                        log::warn!("[Cable] Server refused reconnection");
                        break;
                    }
                    SessionExit::Lost => log::warn!("[Cable] Connection lost"),
                }
            }
            Err(e) => log::warn!("[Cable] Connection failed: {e:#}"),
        }

        let delay = backoff.next_delay();
        ctx.set_state(ConnectionState::Reconnecting {
            attempt: backoff.attempt(),
        });
        log::info!(
            "[Cable] Reconnecting in {:.1}s (attempt {})",
            delay.as_secs_f32(),
            backoff.attempt()
        );

        tokio::select! {
            () = ctx.cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    ctx.set_state(ConnectionState::Disconnected);
    log::info!("[Cable] Connection task exited");
}

/// Open the socket and wait for the cable `welcome`.
async fn open_socket(ctx: &LoopContext) -> anyhow::Result<(SocketWriter, SocketReader)> {
    let (mut writer, mut reader) = socket::connect(&ctx.url, ctx.bearer.as_deref()).await?;

    let welcomed = tokio::time::timeout(WELCOME_TIMEOUT, wait_for_welcome(&mut writer, &mut reader))
        .await
        .unwrap_or(false);
    if !welcomed {
        anyhow::bail!("no welcome within {}s", WELCOME_TIMEOUT.as_secs());
    }
    Ok((writer, reader))
}

async fn wait_for_welcome(writer: &mut SocketWriter, reader: &mut SocketReader) -> bool {
    while let Some(frame) = reader.recv().await {
        match frame {
            Ok(SocketFrame::Text(text)) => {
                if matches!(protocol::decode(&text), Ok(InboundFrame::Welcome)) {
                    log::debug!("[Cable] Received welcome");
                    return true;
                }
            }
            Ok(SocketFrame::Ping(data)) => {
                let _ = writer.send_pong(data).await;
            }
            Ok(SocketFrame::Close { code, reason }) => {
                log::warn!("[Cable] Closed before welcome ({code}: {reason})");
                return false;
            }
            Err(e) => {
                log::warn!("[Cable] Error waiting for welcome: {e:#}");
                return false;
            }
        }
    }
    false
}

/// Result of a private-channel token fetch.
type TokenResult = (ChannelName, Result<String, String>);

/// Per-connection bookkeeping of the session loop.
#[derive(Default)]
struct SessionChannels {
    /// Identifier each open channel was subscribed with (tokens included).
    identifiers: HashMap<ChannelName, String>,
    /// Private channels waiting on their token.
    awaiting_token: HashSet<ChannelName>,
    /// In-flight token fetches; aborted when the session ends.
    fetches: JoinSet<TokenResult>,
}

/// Message loop for one connected socket.
async fn run_session(
    ctx: &LoopContext,
    writer: &mut SocketWriter,
    reader: &mut SocketReader,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> SessionExit {
    let mut channels = SessionChannels::default();

    loop {
        tokio::select! {
            () = ctx.cancel.cancelled() => return SessionExit::Shutdown,

            frame = reader.recv() => match frame {
                Some(Ok(SocketFrame::Text(text))) => {
                    if let Some(exit) = handle_text(ctx, &text, &mut channels.identifiers) {
                        return exit;
                    }
                }
                Some(Ok(SocketFrame::Ping(data))) => {
                    let _ = writer.send_pong(data).await;
                }
                Some(Ok(SocketFrame::Close { code, reason })) => {
                    log::info!("[Cable] Closed by server ({code}: {reason})");
                    return SessionExit::Lost;
                }
                Some(Err(e)) => {
                    log::warn!("[Cable] Socket error: {e:#}");
                    return SessionExit::Lost;
                }
                None => {
                    log::info!("[Cable] Socket stream ended");
                    return SessionExit::Lost;
                }
            },

            command = commands.recv() => {
                let Some(command) = command else {
                    return SessionExit::Shutdown;
                };
                if let Err(e) = handle_command(ctx, writer, command, &mut channels).await {
                    log::warn!("[Cable] Write failed: {e:#}");
                    return SessionExit::Lost;
                }
            }

            Some(joined) = channels.fetches.join_next(), if !channels.fetches.is_empty() => {
                let (channel, token) = match joined {
                    Ok(result) => result,
                    Err(e) => {
                        log::warn!("[Cable] Token fetch task failed: {e}");
                        continue;
                    }
                };
                if let Err(e) = handle_token(ctx, writer, channel, token, &mut channels).await {
                    log::warn!("[Cable] Write failed: {e:#}");
                    return SessionExit::Lost;
                }
            }
        }
    }
}

/// Route one inbound text frame. Returns `Some` when the session must end.
fn handle_text(
    ctx: &LoopContext,
    text: &str,
    identifiers: &mut HashMap<ChannelName, String>,
) -> Option<SessionExit> {
    let frame = match protocol::decode(text) {
        Ok(frame) => frame,
        Err(e) => {
            log::warn!(
                "[Cable] Undecodable frame ({e:#}): {}",
                preview(text)
            );
            return None;
        }
    };

    let delivered = match frame {
        InboundFrame::Welcome | InboundFrame::Ping | InboundFrame::Ignored => true,
        InboundFrame::Confirmed(channel) => {
            if identifiers.contains_key(&channel) {
                log::info!("[Cable] Channel {channel} confirmed");
                ctx.emit(TransportEvent::ChannelOpened(channel))
            } else {
                log::debug!("[Cable] Confirmation for closed channel {channel}");
                true
            }
        }
        InboundFrame::Rejected(channel) => {
            log::error!("[Cable] Channel {channel} rejected");
            identifiers.remove(&channel);
            ctx.emit(TransportEvent::ChannelFailed(ChannelOpenError::Rejected { channel }))
        }
        InboundFrame::Disconnect { reason, reconnect } => {
            log::warn!(
                "[Cable] Server requested disconnect (reason={}, reconnect={reconnect})",
                reason.as_deref().unwrap_or("none")
            );
            return Some(if reconnect {
                SessionExit::Lost
            } else {
                SessionExit::Refused
            });
        }
        InboundFrame::Data { channel, message } => {
            log::trace!("[Cable] Data on {channel}");
            ctx.emit(TransportEvent::Message { channel, raw: message })
        }
    };

    if delivered {
        None
    } else {
        log::info!("[Cable] Event listener dropped, shutting down");
        Some(SessionExit::Shutdown)
    }
}

/// Write one command to the socket.
///
/// Private channels first need a token; that fetch runs beside the session
/// so other channels keep flowing, and the subscribe goes out from
/// [`handle_token`].
async fn handle_command(
    ctx: &LoopContext,
    writer: &mut SocketWriter,
    command: Command,
    channels: &mut SessionChannels,
) -> anyhow::Result<()> {
    match command {
        Command::Open(channel) if channel.is_private() => {
            let Some(tokens) = ctx.tokens.clone() else {
                fail_unauthorized(ctx, channel, "no token provider configured".to_string());
                return Ok(());
            };
            if channels.awaiting_token.insert(channel.clone()) {
                log::debug!("[Cable] Fetching token for {channel}");
                channels.fetches.spawn(async move {
                    let token = tokens
                        .channel_token(&channel)
                        .await
                        .map_err(|e| format!("{e:#}"));
                    (channel, token)
                });
            }
        }
        Command::Open(channel) => {
            subscribe(ctx, writer, channel, None, &mut channels.identifiers).await?;
        }
        Command::Close(channel) => {
            if channels.awaiting_token.remove(&channel) {
                log::debug!("[Cable] {channel} closed before its token arrived");
            }
            if let Some(identifier) = channels.identifiers.remove(&channel) {
                writer.send_json(&protocol::unsubscribe_command(&identifier)).await?;
                log::debug!("[Cable] Sent unsubscribe for {channel}");
            }
        }
        Command::Send { channel, message } => {
            let identifier = channels
                .identifiers
                .get(&channel)
                .cloned()
                .unwrap_or_else(|| protocol::identifier(&ctx.cable_channel, &channel, None));
            writer
                .send_json(&protocol::message_command(&identifier, &message))
                .await?;
            log::trace!("[Cable] Sent {} on {channel}", message.kind());
        }
    }
    Ok(())
}

/// Finish opening a private channel once its token fetch returns.
async fn handle_token(
    ctx: &LoopContext,
    writer: &mut SocketWriter,
    channel: ChannelName,
    token: Result<String, String>,
    channels: &mut SessionChannels,
) -> anyhow::Result<()> {
    if !channels.awaiting_token.remove(&channel) {
        log::debug!("[Cable] Discarding token for closed channel {channel}");
        return Ok(());
    }
    match token {
        Ok(token) => subscribe(ctx, writer, channel, Some(&token), &mut channels.identifiers).await,
        Err(reason) => {
            fail_unauthorized(ctx, channel, reason);
            Ok(())
        }
    }
}

async fn subscribe(
    ctx: &LoopContext,
    writer: &mut SocketWriter,
    channel: ChannelName,
    token: Option<&str>,
    identifiers: &mut HashMap<ChannelName, String>,
) -> anyhow::Result<()> {
    let identifier = protocol::identifier(&ctx.cable_channel, &channel, token);
    writer.send_json(&protocol::subscribe_command(&identifier)).await?;
    log::debug!("[Cable] Sent subscribe for {channel}");
    identifiers.insert(channel, identifier);
    Ok(())
}

fn fail_unauthorized(ctx: &LoopContext, channel: ChannelName, reason: String) {
    log::warn!("[Cable] No token for {channel}: {reason}");
    ctx.emit(TransportEvent::ChannelFailed(ChannelOpenError::Unauthorized {
        channel,
        reason,
    }));
}

/// First 100 characters of a frame, for logs.
fn preview(text: &str) -> String {
    text.chars().take(100).collect()
}
