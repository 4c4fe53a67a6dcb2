//! WebSocket plumbing for the cable transport.
//!
//! Thin wrapper around `tokio-tungstenite` that splits a connection into
//! [`SocketWriter`] / [`SocketReader`] halves for use in `tokio::select!`
//! loops and reduces inbound traffic to the frames the cable protocol cares
//! about. The rest of the crate never touches `tungstenite` types.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;

use crate::constants::CABLE_PATH;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Inbound frame, reduced to what the cable loop handles.
#[derive(Debug)]
pub enum SocketFrame {
    /// UTF-8 text frame (cable JSON).
    Text(String),
    /// Ping that must be answered with a pong.
    Ping(Vec<u8>),
    /// Peer closed the connection.
    Close {
        /// WebSocket close code (1005 when the peer sent none).
        code: u16,
        /// Close reason.
        reason: String,
    },
}

/// Write half of a socket.
#[derive(Debug)]
pub struct SocketWriter {
    sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
}

impl SocketWriter {
    /// Serialize `value` and send it as a text frame.
    pub async fn send_json(&mut self, value: &serde_json::Value) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Text(value.to_string()))
            .await
            .context("socket send failed")
    }

    /// Answer a ping.
    pub async fn send_pong(&mut self, data: Vec<u8>) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Pong(data))
            .await
            .context("socket pong failed")
    }

    /// Send a close frame and flush.
    pub async fn close(&mut self) -> Result<()> {
        self.sink.close().await.context("socket close failed")
    }
}

/// Read half of a socket.
#[derive(Debug)]
pub struct SocketReader {
    stream: futures_util::stream::SplitStream<WsStream>,
}

impl SocketReader {
    /// Next frame, or `None` when the stream ends.
    ///
    /// Pongs, binary and raw frames are skipped.
    pub async fn recv(&mut self) -> Option<Result<SocketFrame>> {
        loop {
            match self.stream.next().await? {
                Ok(tungstenite::Message::Text(text)) => {
                    return Some(Ok(SocketFrame::Text(text.to_string())));
                }
                Ok(tungstenite::Message::Ping(data)) => {
                    return Some(Ok(SocketFrame::Ping(data.to_vec())));
                }
                Ok(tungstenite::Message::Close(frame)) => {
                    let (code, reason) = frame
                        .map(|cf| (cf.code.into(), cf.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    return Some(Ok(SocketFrame::Close { code, reason }));
                }
                Ok(tungstenite::Message::Binary(data)) => {
                    log::trace!("[Cable] Skipping {} byte binary frame", data.len());
                }
                Ok(tungstenite::Message::Pong(_) | tungstenite::Message::Frame(_)) => {}
                Err(e) => return Some(Err(anyhow::anyhow!("socket read error: {e}"))),
            }
        }
    }
}

/// Open a socket to `url`, authenticating with `bearer` when given.
pub async fn connect(url: &str, bearer: Option<&str>) -> Result<(SocketWriter, SocketReader)> {
    use tungstenite::client::IntoClientRequest;

    let mut request = url
        .into_client_request()
        .with_context(|| format!("invalid WebSocket URL: {url}"))?;

    if let Some(token) = bearer {
        let value = tungstenite::http::HeaderValue::from_str(&format!("Bearer {token}"))
            .context("invalid bearer token")?;
        request
            .headers_mut()
            .insert(tungstenite::http::header::AUTHORIZATION, value);
    }

    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .context("WebSocket connect failed")?;

    let (sink, stream) = ws_stream.split();
    Ok((SocketWriter { sink }, SocketReader { stream }))
}

/// Cable endpoint for a server URL.
///
/// `https://` becomes `wss://`, `http://` becomes `ws://`, and the cable path
/// is appended unless the URL already ends with it.
#[must_use]
pub fn cable_url(server_url: &str) -> String {
    let trimmed = server_url.trim_end_matches('/');
    let ws = if trimmed.starts_with("wss://") || trimmed.starts_with("ws://") {
        trimmed.to_string()
    } else {
        trimmed
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1)
    };
    if ws.ends_with(CABLE_PATH) {
        ws
    } else {
        format!("{ws}{CABLE_PATH}")
    }
}
