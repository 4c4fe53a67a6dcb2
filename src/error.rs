//! Error taxonomy for the multiplexer.
//!
//! None of these escape `subscribe`/`unsubscribe`/`send`. Transport failures
//! are recovered by reconnecting and surface only through the connection
//! status observable; channel failures reach that channel's subscribers
//! through their error callback; handler and malformed-message failures are
//! logged and counted.

use crate::message::ChannelName;

/// Why the transport refused a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The connection is not in the `Connected` state.
    NotConnected,
    /// The transport task has shut down.
    Closed,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConnected => write!(f, "Transport not connected"),
            Self::Closed => write!(f, "Transport closed"),
        }
    }
}

impl std::error::Error for TransportError {}

/// A specific channel could not be opened.
///
/// Reported only to the subscribers of `channel`; never fatal to the
/// connection or to other channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOpenError {
    /// The server rejected the subscription (auth or permission failure).
    Rejected {
        /// Channel that was rejected.
        channel: ChannelName,
    },
    /// No token could be obtained for a private channel.
    Unauthorized {
        /// Channel that needed the token.
        channel: ChannelName,
        /// Why the token provider failed.
        reason: String,
    },
    /// The server never acknowledged the open request.
    Timeout {
        /// Channel that timed out.
        channel: ChannelName,
    },
}

impl ChannelOpenError {
    /// Channel the failure belongs to.
    #[must_use]
    pub fn channel(&self) -> &ChannelName {
        match self {
            Self::Rejected { channel }
            | Self::Unauthorized { channel, .. }
            | Self::Timeout { channel } => channel,
        }
    }
}

impl std::fmt::Display for ChannelOpenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejected { channel } => write!(f, "Subscription to {channel} rejected"),
            Self::Unauthorized { channel, reason } => {
                write!(f, "No token for private channel {channel}: {reason}")
            }
            Self::Timeout { channel } => write!(f, "Channel {channel} open timed out"),
        }
    }
}

impl std::error::Error for ChannelOpenError {}

/// A subscriber callback failed while handling a message.
#[derive(Debug)]
pub enum HandlerError {
    /// The handler returned an error.
    Failed(anyhow::Error),
    /// The handler panicked.
    Panicked(String),
}

impl HandlerError {
    /// Build a [`HandlerError::Panicked`] from a `catch_unwind` payload.
    pub(crate) fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let msg = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self::Panicked(msg)
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed(e) => write!(f, "Handler failed: {e:#}"),
            Self::Panicked(msg) => write!(f, "Handler panicked: {msg}"),
        }
    }
}

impl std::error::Error for HandlerError {}

/// An inbound message could not be turned into a [`crate::Message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MalformedMessageError {
    /// The message was not a JSON object.
    NotAnObject,
    /// The required `type` field was missing, empty, or not a string.
    MissingType,
    /// The payload did not match the shape of its declared type.
    ///
    /// Only strict decoding ([`crate::Event::decode`]) reports this; inbound
    /// messages fall back to [`crate::Event::Other`] instead.
    InvalidPayload {
        /// The declared message type.
        kind: String,
        /// Deserializer error text.
        reason: String,
    },
}

impl std::fmt::Display for MalformedMessageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotAnObject => write!(f, "Message is not a JSON object"),
            Self::MissingType => write!(f, "Message has no type"),
            Self::InvalidPayload { kind, reason } => {
                write!(f, "Invalid payload for {kind}: {reason}")
            }
        }
    }
}

impl std::error::Error for MalformedMessageError {}
