//! Channel Registry: reference-counted logical channels.
//!
//! Tracks, per channel, which subscriptions hold it and where its open
//! handshake stands. The first acquirer opens the channel (or parks it as
//! pending until the transport connects); the last releaser closes it and
//! drops the entry.
//!
//! # Lifecycle
//!
//! ```text
//!            acquire (disconnected)
//!   (none) ─────────────────────────► Pending ◄──────────── link lost
//!     │                                  │                     ▲
//!     │ acquire (connected)              │ on_connected        │
//!     ▼                                  ▼                     │
//!   Opening{since} ◄─────────────── Opening{since} ── ack ──► Open
//!     │
//!     │ reject / token failure / timeout
//!     ▼
//!   Failed  (re-opened on the next Connected transition)
//! ```
//!
//! Reconnection is centralized here: [`ChannelRegistry::on_connected`]
//! replays every tracked channel, so subscribers never re-subscribe.

// Rust guideline compliant 2026-02

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use tokio::time::Instant;

use crate::message::ChannelName;
use crate::subscription::SubscriptionId;
use crate::transport::Transport;

/// Where a channel's open handshake stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Waiting for the transport to connect.
    Pending,
    /// Open requested; no acknowledgment yet.
    Opening {
        /// When the request was issued.
        since: Instant,
    },
    /// Server confirmed the channel.
    Open,
    /// The open request failed; retried on the next connect.
    Failed,
}

/// Registry entry for one channel.
#[derive(Debug, Clone)]
pub struct ChannelState {
    name: ChannelName,
    subscribers: BTreeSet<SubscriptionId>,
    status: ChannelStatus,
    /// A subscribe went out on the current connection.
    requested: bool,
}

impl ChannelState {
    /// Channel name.
    #[must_use]
    pub fn name(&self) -> &ChannelName {
        &self.name
    }

    /// Number of live subscriptions holding the channel.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Whether the server confirmed the channel.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.status == ChannelStatus::Open
    }

    /// Handshake status.
    #[must_use]
    pub fn status(&self) -> ChannelStatus {
        self.status
    }

    /// Subscribers in registration order.
    ///
    /// Ids are allocated monotonically, so id order is registration order.
    pub fn subscribers(&self) -> impl Iterator<Item = SubscriptionId> + '_ {
        self.subscribers.iter().copied()
    }
}

/// Channel name to [`ChannelState`].
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: HashMap<ChannelName, ChannelState>,
}

impl ChannelRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` on `channel`.
    ///
    /// On the 0→1 transition the channel is opened right away when
    /// `connected`, otherwise parked as pending.
    pub fn acquire(
        &mut self,
        channel: &ChannelName,
        id: SubscriptionId,
        transport: &mut dyn Transport,
        connected: bool,
    ) {
        if let Some(state) = self.channels.get_mut(channel) {
            state.subscribers.insert(id);
            log::trace!(
                "[Registry] {} ref_count={} (+{})",
                channel,
                state.ref_count(),
                id
            );
            return;
        }

        let mut state = ChannelState {
            name: channel.clone(),
            subscribers: BTreeSet::from([id]),
            status: ChannelStatus::Pending,
            requested: false,
        };
        if connected {
            state.status = open(transport, channel, Instant::now());
            state.requested = state.status != ChannelStatus::Pending;
        } else {
            log::debug!("[Registry] {} pending until connected", channel);
        }
        self.channels.insert(channel.clone(), state);
    }

    /// Drop `id` from `channel`.
    ///
    /// Returns `true` when that was the last subscriber and the channel was
    /// removed. The close request is sent whenever a subscribe went out on
    /// the current connection, whatever came of it (a channel that timed
    /// out may still be live on the server).
    pub fn release(
        &mut self,
        channel: &ChannelName,
        id: SubscriptionId,
        transport: &mut dyn Transport,
        connected: bool,
    ) -> bool {
        let Some(state) = self.channels.get_mut(channel) else {
            return false;
        };
        if !state.subscribers.remove(&id) {
            return false;
        }
        if !state.subscribers.is_empty() {
            log::trace!(
                "[Registry] {} ref_count={} (-{})",
                channel,
                state.ref_count(),
                id
            );
            return false;
        }

        let requested = state.requested;
        self.channels.remove(channel);

        if connected && requested {
            if let Err(e) = transport.close_channel(channel) {
                log::warn!("[Registry] Failed to close {}: {}", channel, e);
            }
        }
        log::debug!("[Registry] {} released", channel);
        true
    }

    /// Re-open every tracked channel after the transport connects.
    ///
    /// Channels are replayed in name order so the sequence is stable.
    pub fn on_connected(&mut self, transport: &mut dyn Transport, now: Instant) {
        let mut names: Vec<&ChannelName> = self.channels.keys().collect();
        names.sort();
        let names: Vec<ChannelName> = names.into_iter().cloned().collect();

        if !names.is_empty() {
            log::info!("[Registry] Re-opening {} channel(s)", names.len());
        }
        for name in names {
            let status = open(transport, &name, now);
            if let Some(state) = self.channels.get_mut(&name) {
                state.status = status;
                state.requested = status != ChannelStatus::Pending;
            }
        }
    }

    /// The link dropped: every channel must be opened again.
    pub fn on_disconnected(&mut self) {
        for state in self.channels.values_mut() {
            state.status = ChannelStatus::Pending;
            state.requested = false;
        }
    }

    /// Record the server's acknowledgment. Returns `false` for channels no
    /// longer tracked.
    pub fn mark_open(&mut self, channel: &ChannelName) -> bool {
        match self.channels.get_mut(channel) {
            Some(state) => {
                state.status = ChannelStatus::Open;
                log::debug!("[Registry] {} open ({} subscriber(s))", channel, state.ref_count());
                true
            }
            None => false,
        }
    }

    /// Record an open failure and return the subscribers to notify.
    pub fn mark_failed(&mut self, channel: &ChannelName) -> Vec<SubscriptionId> {
        match self.channels.get_mut(channel) {
            Some(state) => {
                state.status = ChannelStatus::Failed;
                state.subscribers().collect()
            }
            None => Vec::new(),
        }
    }

    /// Channels whose open request has gone unacknowledged for `timeout`.
    #[must_use]
    pub fn timed_out(&self, now: Instant, timeout: Duration) -> Vec<ChannelName> {
        let mut expired: Vec<ChannelName> = self
            .channels
            .values()
            .filter(|state| match state.status {
                ChannelStatus::Opening { since } => now.saturating_duration_since(since) >= timeout,
                _ => false,
            })
            .map(|state| state.name.clone())
            .collect();
        expired.sort();
        expired
    }

    /// Snapshot of `channel`'s subscribers in registration order.
    #[must_use]
    pub fn subscribers(&self, channel: &ChannelName) -> Option<Vec<SubscriptionId>> {
        self.channels
            .get(channel)
            .map(|state| state.subscribers().collect())
    }

    /// Look up a channel.
    #[must_use]
    pub fn get(&self, channel: &ChannelName) -> Option<&ChannelState> {
        self.channels.get(channel)
    }

    /// Reference count (0 for untracked channels).
    #[must_use]
    pub fn ref_count(&self, channel: &ChannelName) -> usize {
        self.channels.get(channel).map_or(0, ChannelState::ref_count)
    }

    /// Whether the channel is tracked and confirmed.
    #[must_use]
    pub fn is_open(&self, channel: &ChannelName) -> bool {
        self.channels.get(channel).is_some_and(ChannelState::is_open)
    }

    /// Number of tracked channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// True when no channel is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

fn open(transport: &mut dyn Transport, channel: &ChannelName, now: Instant) -> ChannelStatus {
    match transport.open_channel(channel) {
        Ok(()) => ChannelStatus::Opening { since: now },
        Err(e) => {
            log::warn!("[Registry] Failed to open {}: {}", channel, e);
            ChannelStatus::Pending
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
