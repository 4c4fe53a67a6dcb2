//! In-process transport.
//!
//! Records every command it receives and lets the caller decide what the
//! "server" does next. Used to drive the multiplexer deterministically in
//! tests and demos; clones share state, so a test keeps one clone and hands
//! the other to the multiplexer.

use std::cell::RefCell;
use std::rc::Rc;

use tokio::sync::watch;

use super::{AuthParams, ConnectionState, Transport, TransportEvent};
use crate::error::TransportError;
use crate::message::{ChannelName, Message};

/// A command observed by [`MemoryTransport`].
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCall {
    /// `connect(url, ..)`
    Connect {
        /// Requested URL.
        url: String,
    },
    /// `disconnect()`
    Disconnect,
    /// `open_channel(..)`
    Open(ChannelName),
    /// `close_channel(..)`
    Close(ChannelName),
    /// `send(..)`
    Send {
        /// Destination channel.
        channel: ChannelName,
        /// Message as handed to the transport.
        message: Message,
    },
}

/// Recording transport with caller-controlled state.
#[derive(Clone)]
pub struct MemoryTransport {
    calls: Rc<RefCell<Vec<TransportCall>>>,
    state_tx: Rc<watch::Sender<ConnectionState>>,
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("state", &*self.state_tx.borrow())
            .field("calls", &self.calls.borrow().len())
            .finish()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// Disconnected transport with an empty call log.
    #[must_use]
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            calls: Rc::new(RefCell::new(Vec::new())),
            state_tx: Rc::new(state_tx),
        }
    }

    /// Move to `state` and return the event a real transport would emit.
    pub fn set_state(&self, state: ConnectionState) -> TransportEvent {
        self.state_tx.send_replace(state);
        TransportEvent::StateChanged(state)
    }

    /// Every command so far, oldest first.
    #[must_use]
    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.borrow().clone()
    }

    /// Drain the call log.
    pub fn take_calls(&self) -> Vec<TransportCall> {
        std::mem::take(&mut *self.calls.borrow_mut())
    }

    /// Channels opened so far, in order (repeats included).
    #[must_use]
    pub fn opened(&self) -> Vec<ChannelName> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|c| match c {
                TransportCall::Open(ch) => Some(ch.clone()),
                _ => None,
            })
            .collect()
    }

    /// Channels closed so far, in order.
    #[must_use]
    pub fn closed(&self) -> Vec<ChannelName> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|c| match c {
                TransportCall::Close(ch) => Some(ch.clone()),
                _ => None,
            })
            .collect()
    }

    /// Messages sent so far, in order.
    #[must_use]
    pub fn sent(&self) -> Vec<(ChannelName, Message)> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|c| match c {
                TransportCall::Send { channel, message } => Some((channel.clone(), message.clone())),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: TransportCall) {
        self.calls.borrow_mut().push(call);
    }
}

impl Transport for MemoryTransport {
    fn connect(&mut self, url: &str, _auth: &AuthParams) {
        self.record(TransportCall::Connect {
            url: url.to_string(),
        });
        if *self.state_tx.borrow() == ConnectionState::Disconnected {
            self.state_tx.send_replace(ConnectionState::Connecting);
        }
    }

    fn disconnect(&mut self) {
        self.record(TransportCall::Disconnect);
        self.state_tx.send_replace(ConnectionState::Disconnected);
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn open_channel(&mut self, channel: &ChannelName) -> Result<(), TransportError> {
        self.record(TransportCall::Open(channel.clone()));
        Ok(())
    }

    fn close_channel(&mut self, channel: &ChannelName) -> Result<(), TransportError> {
        self.record(TransportCall::Close(channel.clone()));
        Ok(())
    }

    fn send(&mut self, channel: &ChannelName, message: &Message) -> Result<(), TransportError> {
        if !self.state().is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.record(TransportCall::Send {
            channel: channel.clone(),
            message: message.clone(),
        });
        Ok(())
    }
}
