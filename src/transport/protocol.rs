//! Cable wire protocol.
//!
//! ActionCable-compatible framing. All logical channels share one cable
//! channel class; the logical name travels in the subscription identifier:
//!
//! ```text
//! → {"command":"subscribe","identifier":"{\"channel\":\"DashboardChannel\",\"name\":\"class-42\"}"}
//! ← {"type":"confirm_subscription","identifier":"..."}
//! ← {"identifier":"...","message":{"type":"student-enrolled","payload":{"id":"s1"}}}
//! → {"command":"message","identifier":"...","data":"{\"type\":\"request-leaderboard\",...}"}
//! → {"command":"unsubscribe","identifier":"..."}
//! ```
//!
//! Identifiers and `data` are JSON *strings* containing JSON, as ActionCable
//! expects.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::message::{ChannelName, Message};

/// Subscription identifier payload.
#[derive(Debug, Serialize, Deserialize)]
struct ChannelIdentifier {
    channel: String,
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token: Option<String>,
}

/// Build the identifier string for a logical channel.
#[must_use]
pub fn identifier(cable_channel: &str, channel: &ChannelName, token: Option<&str>) -> String {
    let id = ChannelIdentifier {
        channel: cable_channel.to_string(),
        name: channel.as_str().to_string(),
        token: token.map(str::to_string),
    };
    // Plain strings only; serialization cannot fail.
    serde_json::to_string(&id).unwrap_or_default()
}

/// Recover the logical channel from an identifier echoed by the server.
#[must_use]
pub fn channel_of(identifier: &str) -> Option<ChannelName> {
    serde_json::from_str::<ChannelIdentifier>(identifier)
        .ok()
        .map(|id| ChannelName::from(id.name))
}

/// `subscribe` command.
#[must_use]
pub fn subscribe_command(identifier: &str) -> Value {
    json!({ "command": "subscribe", "identifier": identifier })
}

/// `unsubscribe` command.
#[must_use]
pub fn unsubscribe_command(identifier: &str) -> Value {
    json!({ "command": "unsubscribe", "identifier": identifier })
}

/// `message` command carrying an application message.
#[must_use]
pub fn message_command(identifier: &str, message: &Message) -> Value {
    json!({
        "command": "message",
        "identifier": identifier,
        "data": message.to_wire().to_string(),
    })
}

/// Decoded server frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Connection accepted.
    Welcome,
    /// Server keepalive.
    Ping,
    /// Channel subscription confirmed.
    Confirmed(ChannelName),
    /// Channel subscription rejected.
    Rejected(ChannelName),
    /// Server is closing the connection.
    Disconnect {
        /// Server-supplied reason.
        reason: Option<String>,
        /// Whether the client may reconnect.
        reconnect: bool,
    },
    /// Application data on a channel.
    Data {
        /// Destination channel.
        channel: ChannelName,
        /// Raw message body.
        message: Value,
    },
    /// Anything else (unknown control types, foreign identifiers).
    Ignored,
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    frame_type: Option<String>,
    identifier: Option<String>,
    message: Option<Value>,
    reason: Option<String>,
    reconnect: Option<bool>,
}

/// Decode one text frame.
pub fn decode(text: &str) -> Result<InboundFrame> {
    let raw: RawFrame = serde_json::from_str(text).context("frame is not a JSON object")?;
    let channel = raw.identifier.as_deref().and_then(channel_of);

    Ok(match raw.frame_type.as_deref() {
        Some("welcome") => InboundFrame::Welcome,
        Some("ping") => InboundFrame::Ping,
        Some("confirm_subscription") => channel.map_or(InboundFrame::Ignored, InboundFrame::Confirmed),
        Some("reject_subscription") => channel.map_or(InboundFrame::Ignored, InboundFrame::Rejected),
        Some("disconnect") => InboundFrame::Disconnect {
            reason: raw.reason,
            reconnect: raw.reconnect.unwrap_or(true),
        },
        Some(_) => InboundFrame::Ignored,
        None => match (channel, raw.message) {
            (Some(channel), Some(message)) => InboundFrame::Data { channel, message },
            _ => InboundFrame::Ignored,
        },
    })
}
