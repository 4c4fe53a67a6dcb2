//! Transport Connection: the single physical push connection.
//!
//! # Architecture
//!
//! ```text
//! Transport (trait)
//!     │
//!     ├── CableTransport   WebSocket to the dashboard's cable endpoint
//!     │   └── background task (connect, reconnect w/ backoff, route, ping)
//!     │
//!     └── MemoryTransport  in-process, records commands (tests, demos)
//! ```
//!
//! Commands flow into the transport through the [`Transport`] trait
//! (fire-and-forget, never blocking the event loop). Everything the
//! transport observes flows back out as [`TransportEvent`]s on a single
//! stream, consumed by [`crate::Multiplexer::run`]. State transitions are
//! also published on a `watch` channel for UI status indicators.

pub mod backoff;
pub mod cable;
pub mod memory;
pub mod protocol;
pub mod socket;

use tokio::sync::{mpsc, watch};

use crate::error::{ChannelOpenError, TransportError};
use crate::message::{ChannelName, Message};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not connected; terminal until `connect()` is called.
    #[default]
    Disconnected,
    /// Attempting to connect.
    Connecting,
    /// Connected and ready.
    Connected,
    /// Lost the connection; waiting out the backoff delay.
    Reconnecting {
        /// 1-based reconnect attempt number.
        attempt: u32,
    },
}

impl ConnectionState {
    /// Whether outbound traffic can flow.
    #[must_use]
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
        }
    }
}

/// Something the transport observed.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The connection moved to a new state.
    StateChanged(ConnectionState),
    /// The server confirmed a channel subscription.
    ChannelOpened(ChannelName),
    /// A channel could not be opened.
    ChannelFailed(ChannelOpenError),
    /// Raw inbound message on a channel.
    Message {
        /// Channel the frame was addressed to.
        channel: ChannelName,
        /// Unvalidated message body.
        raw: serde_json::Value,
    },
}

/// Receiving end of a transport's event stream.
///
/// Exactly one exists per transport; dropping it detaches the listener.
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Credentials for the physical connection.
#[derive(Clone, Default)]
pub struct AuthParams {
    /// Bearer token sent with the WebSocket handshake.
    pub token: Option<String>,
}

impl AuthParams {
    /// Authenticate with a bearer token.
    #[must_use]
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }
}

impl std::fmt::Debug for AuthParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthParams")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Command surface of a push transport.
///
/// All methods return immediately. Channel opens are acknowledged later
/// through [`TransportEvent::ChannelOpened`] or
/// [`TransportEvent::ChannelFailed`].
pub trait Transport {
    /// Begin connecting. Idempotent while connecting or connected.
    fn connect(&mut self, url: &str, auth: &AuthParams);

    /// Tear down and cancel any pending reconnect.
    fn disconnect(&mut self);

    /// Observable connection state.
    fn watch_state(&self) -> watch::Receiver<ConnectionState>;

    /// Current connection state.
    fn state(&self) -> ConnectionState {
        let rx = self.watch_state();
        let state = *rx.borrow();
        state
    }

    /// Ask the server to start delivering `channel`.
    fn open_channel(&mut self, channel: &ChannelName) -> Result<(), TransportError>;

    /// Ask the server to stop delivering `channel`.
    fn close_channel(&mut self, channel: &ChannelName) -> Result<(), TransportError>;

    /// Send an application message on `channel`.
    ///
    /// Fails with [`TransportError::NotConnected`] unless connected.
    fn send(&mut self, channel: &ChannelName, message: &Message) -> Result<(), TransportError>;
}

pub use backoff::{Backoff, BackoffPolicy};
pub use cable::CableTransport;
pub use memory::{MemoryTransport, TransportCall};
