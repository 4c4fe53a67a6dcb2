//! The multiplexer: one transport, many subscribers.
//!
//! # Architecture
//!
//! ```text
//!   UI component ──subscribe/unsubscribe/send──► Multiplexer (Rc<RefCell<Inner>>)
//!                                                   │
//!                      ┌────────────────┬───────────┼──────────────┐
//!                      ▼                ▼           ▼              ▼
//!              SubscriptionTable  ChannelRegistry  OutboundQueue  Box<dyn Transport>
//!                                                                  │
//!   Multiplexer::run ◄──────────── TransportEvent stream ──────────┘
//!        │
//!        └─► handle_event: StateChanged → replay channels, flush queue
//!                          ChannelOpened / ChannelFailed → registry
//!                          Message → dispatch
//! ```
//!
//! Everything runs on one thread. The handle is `Clone` but not `Send`;
//! drive [`Multiplexer::run`] from a current-thread runtime or a
//! `tokio::task::LocalSet`.
//!
//! # Borrowing
//!
//! No `RefCell` borrow is held while user code (predicates, handlers, error
//! callbacks, or drops of their captured state) runs. Handlers may therefore
//! call back into the multiplexer freely, including unsubscribing themselves.

// Rust guideline compliant 2026-02

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::constants::{CHANNEL_OPEN_TIMEOUT, DEFAULT_OUTBOUND_CAPACITY, OPEN_TIMEOUT_CHECK_INTERVAL};
use crate::dispatch::{self, DispatchReport, DispatchStats, SubscriberSource};
use crate::error::{ChannelOpenError, HandlerError};
use crate::message::{ChannelName, Message};
use crate::outbound::{OutboundQueue, QueuedMessage};
use crate::registry::{ChannelRegistry, ChannelStatus};
use crate::subscription::{ErrorHandler, Subscription, SubscriptionId, SubscriptionTable};
use crate::transport::{AuthParams, ConnectionState, Transport, TransportEvent, TransportEvents};

/// Tunables for a [`Multiplexer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxOptions {
    /// A channel open with no acknowledgment after this long fails.
    pub open_timeout: Duration,
    /// Outbound messages held while disconnected.
    pub outbound_capacity: usize,
}

impl Default for MuxOptions {
    fn default() -> Self {
        Self {
            open_timeout: CHANNEL_OPEN_TIMEOUT,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

/// Counters for monitoring and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Diagnostics {
    /// Inbound messages handed to the dispatcher.
    pub dispatched: u64,
    /// Successful handler invocations.
    pub delivered: u64,
    /// Handler invocations that failed or panicked.
    pub handler_failures: u64,
    /// Inbound messages rejected as malformed.
    pub malformed: u64,
    /// Inbound messages for channels nobody holds.
    pub dropped: u64,
    /// Channel open failures (rejections, token errors, timeouts).
    pub channel_failures: u64,
    /// Outbound messages handed to the transport.
    pub outbound_sent: u64,
    /// Outbound messages that had to wait for the link.
    pub outbound_queued: u64,
    /// Queued outbound messages evicted by newer ones.
    pub outbound_dropped: u64,
}

struct Inner {
    transport: Box<dyn Transport>,
    /// Link state as of the last processed `StateChanged`.
    link: ConnectionState,
    subscriptions: SubscriptionTable,
    registry: ChannelRegistry,
    outbound: OutboundQueue,
    options: MuxOptions,
    dispatch_stats: DispatchStats,
    channel_failures: u64,
    outbound_sent: u64,
    outbound_queued: u64,
}

impl Inner {
    /// Send now when the link is up and nothing is waiting, else queue.
    fn send_or_queue(&mut self, channel: ChannelName, message: Message) {
        if self.link.is_connected() && self.outbound.is_empty() {
            match self.transport.send(&channel, &message) {
                Ok(()) => {
                    self.outbound_sent += 1;
                    log::trace!("[Outbound] Sent {} on {}", message.kind(), channel);
                    return;
                }
                Err(e) => {
                    log::warn!("[Outbound] Send on {} failed, queueing: {}", channel, e);
                }
            }
        }
        self.enqueue(QueuedMessage { channel, message });
    }

    fn enqueue(&mut self, entry: QueuedMessage) {
        log::debug!(
            "[Outbound] Queued {} for {} ({} waiting)",
            entry.message.kind(),
            entry.channel,
            self.outbound.len() + 1
        );
        self.outbound_queued += 1;
        if let Some(evicted) = self.outbound.push(entry) {
            log::warn!(
                "[Outbound] Queue full ({}), dropped oldest {} for {}",
                self.outbound.capacity(),
                evicted.message.kind(),
                evicted.channel
            );
        }
    }

    /// Drain the queue in FIFO order. Stops at the first failure.
    fn flush(&mut self) {
        let mut flushed = 0;
        while let Some(entry) = self.outbound.pop() {
            if let Err(e) = self.transport.send(&entry.channel, &entry.message) {
                log::warn!(
                    "[Outbound] Flush stopped with {} waiting: {}",
                    self.outbound.len() + 1,
                    e
                );
                self.outbound.requeue_front(entry);
                break;
            }
            self.outbound_sent += 1;
            flushed += 1;
        }
        if flushed > 0 {
            log::info!("[Outbound] Flushed {} queued message(s)", flushed);
        }
    }

    fn apply_state(&mut self, state: ConnectionState) {
        let previous = self.link;
        if previous == state {
            return;
        }
        self.link = state;
        log::info!("[Mux] Connection {} -> {}", previous, state);

        if state.is_connected() {
            let Self {
                registry, transport, ..
            } = self;
            registry.on_connected(transport.as_mut(), Instant::now());
            self.flush();
        } else if previous.is_connected() {
            self.registry.on_disconnected();
        }
    }
}

impl SubscriberSource for RefCell<Inner> {
    fn subscribers_of(&self, channel: &ChannelName) -> Option<Vec<SubscriptionId>> {
        self.borrow().registry.subscribers(channel)
    }

    fn live(&self, id: SubscriptionId) -> Option<Subscription> {
        self.borrow().subscriptions.get(id).cloned()
    }
}

/// Shared handle to the multiplexer.
///
/// Cloning is cheap; every clone drives the same state.
#[derive(Clone)]
pub struct Multiplexer {
    inner: Rc<RefCell<Inner>>,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner.try_borrow() {
            Ok(inner) => f
                .debug_struct("Multiplexer")
                .field("link", &inner.link)
                .field("subscriptions", &inner.subscriptions.len())
                .field("channels", &inner.registry.len())
                .field("queued", &inner.outbound.len())
                .finish(),
            Err(_) => f.debug_struct("Multiplexer").finish_non_exhaustive(),
        }
    }
}

impl Multiplexer {
    /// Wrap `transport`. Nothing connects until [`Self::connect`].
    pub fn new(transport: impl Transport + 'static, options: MuxOptions) -> Self {
        let link = transport.state();
        let outbound = OutboundQueue::new(options.outbound_capacity);
        Self {
            inner: Rc::new(RefCell::new(Inner {
                transport: Box::new(transport),
                link,
                subscriptions: SubscriptionTable::new(),
                registry: ChannelRegistry::new(),
                outbound,
                options,
                dispatch_stats: DispatchStats::default(),
                channel_failures: 0,
                outbound_sent: 0,
                outbound_queued: 0,
            })),
        }
    }

    // ========================================================================
    // Connection
    // ========================================================================

    /// Start connecting. Idempotent while connecting or connected.
    pub fn connect(&self, url: &str, auth: &AuthParams) {
        log::info!("[Mux] Connecting to {}", url);
        self.inner.borrow_mut().transport.connect(url, auth);
    }

    /// Tear the connection down. Subscriptions and queued messages survive
    /// and resume on the next [`Self::connect`].
    pub fn disconnect(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.transport.disconnect();
        inner.apply_state(ConnectionState::Disconnected);
    }

    /// Connection status observable.
    #[must_use]
    pub fn status(&self) -> watch::Receiver<ConnectionState> {
        self.inner.borrow().transport.watch_state()
    }

    /// Link state as seen by the multiplexer (last processed transition).
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.borrow().link
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Deliver messages on `channel` that satisfy `predicate` to `handler`.
    ///
    /// Never fails; the channel open may still be in flight when this
    /// returns.
    pub fn subscribe<P, H>(
        &self,
        channel: impl Into<ChannelName>,
        predicate: P,
        handler: H,
    ) -> SubscriptionId
    where
        P: Fn(&Message) -> bool + 'static,
        H: Fn(&Message) -> anyhow::Result<()> + 'static,
    {
        self.insert(channel.into(), Rc::new(predicate), Rc::new(handler), None)
    }

    /// Like [`Self::subscribe`], also reporting channel open failures to
    /// `on_error`.
    pub fn subscribe_with_errors<P, H, E>(
        &self,
        channel: impl Into<ChannelName>,
        predicate: P,
        handler: H,
        on_error: E,
    ) -> SubscriptionId
    where
        P: Fn(&Message) -> bool + 'static,
        H: Fn(&Message) -> anyhow::Result<()> + 'static,
        E: Fn(&ChannelOpenError) + 'static,
    {
        let on_error: ErrorHandler = Rc::new(on_error);
        self.insert(
            channel.into(),
            Rc::new(predicate),
            Rc::new(handler),
            Some(on_error),
        )
    }

    /// Like [`Self::subscribe`], returning a guard that unsubscribes on drop.
    pub fn subscribe_scoped<P, H>(
        &self,
        channel: impl Into<ChannelName>,
        predicate: P,
        handler: H,
    ) -> SubscriptionGuard
    where
        P: Fn(&Message) -> bool + 'static,
        H: Fn(&Message) -> anyhow::Result<()> + 'static,
    {
        let id = self.subscribe(channel, predicate, handler);
        SubscriptionGuard {
            mux: Rc::downgrade(&self.inner),
            id,
        }
    }

    fn insert(
        &self,
        channel: ChannelName,
        predicate: Rc<dyn Fn(&Message) -> bool>,
        handler: Rc<dyn Fn(&Message) -> anyhow::Result<()>>,
        on_error: Option<ErrorHandler>,
    ) -> SubscriptionId {
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;

        let id = inner.subscriptions.next_id();
        inner.subscriptions.insert(Subscription {
            id,
            channel: channel.clone(),
            predicate,
            handler,
            on_error,
        });
        let connected = inner.link.is_connected();
        inner
            .registry
            .acquire(&channel, id, inner.transport.as_mut(), connected);

        log::debug!("[Mux] {} subscribed to {}", id, channel);
        id
    }

    /// Remove a subscription. Unknown or already-removed ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let removed = {
            let mut inner = self.inner.borrow_mut();
            let inner = &mut *inner;
            let Some(subscription) = inner.subscriptions.remove(id) else {
                return;
            };
            let connected = inner.link.is_connected();
            inner.registry.release(
                &subscription.channel,
                id,
                inner.transport.as_mut(),
                connected,
            );
            log::debug!("[Mux] {} unsubscribed from {}", id, subscription.channel);
            subscription
        };
        // Captured handler state may itself call back in on drop.
        drop(removed);
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    /// Send `message` on `channel`, queueing while the link is down.
    ///
    /// Messages without a timestamp are stamped now.
    pub fn send(&self, channel: impl Into<ChannelName>, message: impl Into<Message>) {
        let channel = channel.into();
        let message = message.into().on_channel(&channel).stamped();
        self.inner.borrow_mut().send_or_queue(channel, message);
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Process one transport event.
    pub fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::StateChanged(state) => self.inner.borrow_mut().apply_state(state),
            TransportEvent::ChannelOpened(channel) => {
                if !self.inner.borrow_mut().registry.mark_open(&channel) {
                    log::debug!("[Mux] Ignoring confirmation for released channel {}", channel);
                }
            }
            TransportEvent::ChannelFailed(error) => self.fail_channel(&error),
            TransportEvent::Message { channel, raw } => self.dispatch(&channel, raw),
        }
    }

    /// Route one raw inbound message on `channel`.
    pub fn dispatch(&self, channel: &ChannelName, raw: Value) {
        let report = dispatch::dispatch(&*self.inner, channel, raw);
        self.inner.borrow_mut().dispatch_stats.record(&report);
        if let DispatchReport::Routed { failed, .. } = report {
            if failed > 0 {
                log::debug!("[Mux] {} handler(s) failed on {}", failed, channel);
            }
        }
    }

    /// Fail every open request older than the configured timeout.
    pub fn check_timeouts(&self, now: Instant) {
        let expired = {
            let inner = self.inner.borrow();
            inner.registry.timed_out(now, inner.options.open_timeout)
        };
        for channel in expired {
            self.fail_channel(&ChannelOpenError::Timeout { channel });
        }
    }

    fn fail_channel(&self, error: &ChannelOpenError) {
        let callbacks: Vec<ErrorHandler> = {
            let mut inner = self.inner.borrow_mut();
            let inner = &mut *inner;
            inner.channel_failures += 1;
            inner
                .registry
                .mark_failed(error.channel())
                .into_iter()
                .filter_map(|id| inner.subscriptions.get(id).and_then(|s| s.on_error.clone()))
                .collect()
        };

        log::warn!(
            "[Mux] {} (notifying {} subscriber(s))",
            error,
            callbacks.len()
        );
        for callback in callbacks {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(error))) {
                log::warn!(
                    "[Mux] Error callback for {}: {}",
                    error.channel(),
                    HandlerError::from_panic(payload.as_ref())
                );
            }
        }
    }

    /// Consume transport events until the stream ends.
    ///
    /// Also checks pending channel opens against the timeout once per
    /// second.
    pub async fn run(&self, mut events: TransportEvents) {
        let mut ticker = tokio::time::interval(OPEN_TIMEOUT_CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        log::info!("[Mux] Transport event stream closed");
                        break;
                    }
                },
                _ = ticker.tick() => self.check_timeouts(Instant::now()),
            }
        }
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Live subscriptions on `channel`.
    #[must_use]
    pub fn ref_count(&self, channel: &ChannelName) -> usize {
        self.inner.borrow().registry.ref_count(channel)
    }

    /// Whether `channel` is held and confirmed by the server.
    #[must_use]
    pub fn is_open(&self, channel: &ChannelName) -> bool {
        self.inner.borrow().registry.is_open(channel)
    }

    /// Handshake status of `channel`, `None` when untracked.
    #[must_use]
    pub fn channel_status(&self, channel: &ChannelName) -> Option<ChannelStatus> {
        self.inner
            .borrow()
            .registry
            .get(channel)
            .map(crate::registry::ChannelState::status)
    }

    /// Whether `id` is still live.
    #[must_use]
    pub fn is_subscribed(&self, id: SubscriptionId) -> bool {
        self.inner.borrow().subscriptions.contains(id)
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.borrow().subscriptions.len()
    }

    /// Outbound messages waiting for the link.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.inner.borrow().outbound.len()
    }

    /// Snapshot of the counters.
    #[must_use]
    pub fn diagnostics(&self) -> Diagnostics {
        let inner = self.inner.borrow();
        let stats = inner.dispatch_stats;
        Diagnostics {
            dispatched: stats.dispatched,
            delivered: stats.delivered,
            handler_failures: stats.handler_failures,
            malformed: stats.malformed,
            dropped: stats.dropped,
            channel_failures: inner.channel_failures,
            outbound_sent: inner.outbound_sent,
            outbound_queued: inner.outbound_queued,
            outbound_dropped: inner.outbound.evicted(),
        }
    }
}

/// Unsubscribes on drop.
///
/// Holds only a weak reference, so a guard captured inside a handler does
/// not keep the multiplexer alive.
#[must_use = "dropping the guard unsubscribes immediately"]
pub struct SubscriptionGuard {
    mux: Weak<RefCell<Inner>>,
    id: SubscriptionId,
}

impl SubscriptionGuard {
    /// The guarded subscription.
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Keep the subscription alive past the guard.
    pub fn detach(mut self) -> SubscriptionId {
        self.mux = Weak::new();
        self.id
    }
}

impl std::fmt::Debug for SubscriptionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionGuard")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.mux.upgrade() {
            Multiplexer { inner }.unsubscribe(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter;
    use crate::message::Event;
    use crate::transport::{MemoryTransport, TransportCall};
    use serde_json::json;

    fn setup() -> (Multiplexer, MemoryTransport) {
        let transport = MemoryTransport::new();
        let mux = Multiplexer::new(transport.clone(), MuxOptions::default());
        (mux, transport)
    }

    fn go_online(mux: &Multiplexer, transport: &MemoryTransport) {
        mux.handle_event(transport.set_state(ConnectionState::Connected));
    }

    #[test]
    fn test_subscribe_before_connect_opens_on_connected() {
        let (mux, transport) = setup();
        let class = ChannelName::from("class-42");

        mux.subscribe("class-42", filter::any(), |_| Ok(()));
        assert!(transport.opened().is_empty());
        assert_eq!(mux.channel_status(&class), Some(ChannelStatus::Pending));

        go_online(&mux, &transport);
        assert_eq!(transport.opened(), vec![class.clone()]);

        mux.handle_event(TransportEvent::ChannelOpened(class.clone()));
        assert!(mux.is_open(&class));
    }

    #[test]
    fn test_duplicate_state_events_are_ignored() {
        let (mux, transport) = setup();
        mux.subscribe("class-42", filter::any(), |_| Ok(()));

        go_online(&mux, &transport);
        go_online(&mux, &transport);
        assert_eq!(transport.opened().len(), 1);
    }

    #[test]
    fn test_disconnect_keeps_subscriptions() {
        let (mux, transport) = setup();
        go_online(&mux, &transport);
        let id = mux.subscribe("class-42", filter::any(), |_| Ok(()));

        mux.disconnect();
        assert_eq!(mux.connection_state(), ConnectionState::Disconnected);
        assert!(mux.is_subscribed(id));
        assert!(transport.calls().contains(&TransportCall::Disconnect));
    }

    #[test]
    fn test_send_is_stamped_and_addressed() {
        let (mux, transport) = setup();
        go_online(&mux, &transport);

        mux.send("class-42", Event::LeaderboardRefresh);

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        let (channel, message) = &sent[0];
        assert_eq!(channel.as_str(), "class-42");
        assert_eq!(message.channel.as_ref(), Some(channel));
        assert!(message.timestamp.is_some());
    }

    #[test]
    fn test_queue_eviction_is_counted() {
        let transport = MemoryTransport::new();
        let mux = Multiplexer::new(
            transport.clone(),
            MuxOptions {
                outbound_capacity: 2,
                ..MuxOptions::default()
            },
        );
        for _ in 0..3 {
            mux.send("class-42", Event::LeaderboardRefresh);
        }
        assert_eq!(mux.queued(), 2);

        let diag = mux.diagnostics();
        assert_eq!(diag.outbound_queued, 3);
        assert_eq!(diag.outbound_dropped, 1);

        go_online(&mux, &transport);
        assert_eq!(transport.sent().len(), 2);
        assert_eq!(mux.diagnostics().outbound_sent, 2);
    }

    #[test]
    fn test_guard_unsubscribes_on_drop() {
        let (mux, _transport) = setup();
        let class = ChannelName::from("class-42");

        let guard = mux.subscribe_scoped("class-42", filter::any(), |_| Ok(()));
        assert_eq!(mux.ref_count(&class), 1);
        drop(guard);
        assert_eq!(mux.ref_count(&class), 0);
    }

    #[test]
    fn test_detached_guard_keeps_subscription() {
        let (mux, _transport) = setup();
        let id = mux
            .subscribe_scoped("class-42", filter::any(), |_| Ok(()))
            .detach();
        assert!(mux.is_subscribed(id));
    }

    #[test]
    fn test_guard_outliving_mux_is_harmless() {
        let (mux, _transport) = setup();
        let guard = mux.subscribe_scoped("class-42", filter::any(), |_| Ok(()));
        drop(mux);
        drop(guard);
    }

    #[test]
    fn test_guard_captured_in_handler_is_dropped_safely() {
        let (mux, transport) = setup();
        go_online(&mux, &transport);

        let inner_guard = mux.subscribe_scoped("class-7", filter::any(), |_| Ok(()));
        let outer = mux.subscribe("class-42", filter::any(), move |_| {
            let _keep = &inner_guard;
            Ok(())
        });
        assert_eq!(mux.ref_count(&ChannelName::from("class-7")), 1);

        // Dropping the outer handler drops the guard, which re-enters unsubscribe.
        mux.unsubscribe(outer);
        assert_eq!(mux.ref_count(&ChannelName::from("class-7")), 0);
        assert_eq!(mux.subscription_count(), 0);
    }

    #[test]
    fn test_confirmation_for_released_channel_is_ignored() {
        let (mux, transport) = setup();
        go_online(&mux, &transport);
        let id = mux.subscribe("class-42", filter::any(), |_| Ok(()));
        mux.unsubscribe(id);

        mux.handle_event(TransportEvent::ChannelOpened(ChannelName::from("class-42")));
        assert!(!mux.is_open(&ChannelName::from("class-42")));
        assert_eq!(mux.channel_status(&ChannelName::from("class-42")), None);
    }

    #[test]
    fn test_panicking_error_callback_does_not_stop_others() {
        let (mux, transport) = setup();
        go_online(&mux, &transport);
        let hits = Rc::new(RefCell::new(0));

        mux.subscribe_with_errors("private-x", filter::any(), |_| Ok(()), |_| panic!("ui gone"));
        let h = Rc::clone(&hits);
        mux.subscribe_with_errors(
            "private-x",
            filter::any(),
            |_| Ok(()),
            move |_| *h.borrow_mut() += 1,
        );

        mux.handle_event(TransportEvent::ChannelFailed(ChannelOpenError::Rejected {
            channel: ChannelName::from("private-x"),
        }));
        assert_eq!(*hits.borrow(), 1);
        assert_eq!(mux.diagnostics().channel_failures, 1);
    }

    #[test]
    fn test_dispatch_counts() {
        let (mux, _transport) = setup();
        mux.subscribe("class-42", filter::any(), |_| Ok(()));

        mux.dispatch(&ChannelName::from("class-42"), json!({ "type": "leaderboard-refresh" }));
        mux.dispatch(&ChannelName::from("class-9"), json!({ "type": "leaderboard-refresh" }));
        mux.dispatch(&ChannelName::from("class-42"), json!([1, 2]));

        let diag = mux.diagnostics();
        assert_eq!(diag.dispatched, 3);
        assert_eq!(diag.delivered, 1);
        assert_eq!(diag.dropped, 1);
        assert_eq!(diag.malformed, 1);
    }
}
