//! Dispatcher: routes one inbound message to its matching subscriptions.
//!
//! # Phases
//!
//! 1. Validate the raw body into a [`Message`]. Malformed input is reported,
//!    never raised.
//! 2. Snapshot the channel's subscriber ids (O(1) lookup by channel name).
//! 3. For each id in registration order, re-check liveness, clone the
//!    subscription out of the table, and only then run predicate and
//!    handler. No state borrow is held while user code runs, so a handler
//!    may subscribe or unsubscribe anything, itself included.
//!
//! Handler errors and panics are caught per subscription and reported in the
//! [`DispatchReport`]; the remaining subscribers still run.

use std::panic::{self, AssertUnwindSafe};

use serde_json::Value;

use crate::error::{HandlerError, MalformedMessageError};
use crate::message::{ChannelName, Message};
use crate::subscription::{Subscription, SubscriptionId};

/// What the dispatcher needs from the multiplexer state.
///
/// Implementations must not hold a borrow past each call.
pub trait SubscriberSource {
    /// Subscriber ids on `channel` in registration order, or `None` when the
    /// channel is not tracked.
    fn subscribers_of(&self, channel: &ChannelName) -> Option<Vec<SubscriptionId>>;

    /// The subscription, if still live.
    fn live(&self, id: SubscriptionId) -> Option<Subscription>;
}

/// Result of offering one message to one subscription.
#[derive(Debug)]
pub enum Delivery {
    /// Predicate matched and the handler succeeded.
    Delivered,
    /// Predicate rejected the message.
    Filtered,
    /// Predicate or handler failed.
    Failed(HandlerError),
}

/// Offer `message` to `subscription`, isolating any failure.
pub fn deliver(subscription: &Subscription, message: &Message) -> Delivery {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        if !(subscription.predicate)(message) {
            return Ok(false);
        }
        (subscription.handler)(message).map(|()| true)
    }));

    match outcome {
        Ok(Ok(true)) => Delivery::Delivered,
        Ok(Ok(false)) => Delivery::Filtered,
        Ok(Err(e)) => Delivery::Failed(HandlerError::Failed(e)),
        Err(payload) => Delivery::Failed(HandlerError::from_panic(payload.as_ref())),
    }
}

/// What happened to one inbound message.
#[derive(Debug)]
pub enum DispatchReport {
    /// The body was not a valid message.
    Malformed(MalformedMessageError),
    /// Nobody is subscribed to the channel.
    NoSubscribers,
    /// Offered to the channel's subscribers.
    Routed {
        /// Handlers that ran successfully.
        delivered: usize,
        /// Handlers (or predicates) that failed.
        failed: usize,
    },
}

/// Route `raw`, received on `channel`, to the matching subscriptions.
///
/// The channel the transport delivered on is authoritative and overrides
/// any `channel` field in the body.
pub fn dispatch(source: &impl SubscriberSource, channel: &ChannelName, raw: Value) -> DispatchReport {
    let mut message = match Message::from_wire(raw) {
        Ok(message) => message,
        Err(e) => {
            log::warn!("[Dispatch] Dropping malformed message on {}: {}", channel, e);
            return DispatchReport::Malformed(e);
        }
    };
    message.channel = Some(channel.clone());

    let Some(ids) = source.subscribers_of(channel) else {
        log::debug!(
            "[Dispatch] No subscribers on {}, dropping {}",
            channel,
            message.kind()
        );
        return DispatchReport::NoSubscribers;
    };

    let mut delivered = 0;
    let mut failed = 0;
    for id in ids {
        // Unsubscribed by an earlier handler for this same message.
        let Some(subscription) = source.live(id) else {
            continue;
        };

        match deliver(&subscription, &message) {
            Delivery::Delivered => delivered += 1,
            Delivery::Filtered => {}
            Delivery::Failed(e) => {
                failed += 1;
                log::warn!(
                    "[Dispatch] {} on {} failed for {}: {}",
                    id,
                    channel,
                    message.kind(),
                    e
                );
            }
        }
    }

    log::trace!(
        "[Dispatch] {} on {}: delivered={} failed={}",
        message.kind(),
        channel,
        delivered,
        failed
    );
    DispatchReport::Routed { delivered, failed }
}

/// Running totals over every dispatched message.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    /// Messages received from the transport.
    pub dispatched: u64,
    /// Successful handler invocations.
    pub delivered: u64,
    /// Handler invocations that returned an error or panicked.
    pub handler_failures: u64,
    /// Messages rejected as malformed.
    pub malformed: u64,
    /// Messages for channels without subscribers.
    pub dropped: u64,
}

impl DispatchStats {
    /// Fold one report into the totals.
    pub fn record(&mut self, report: &DispatchReport) {
        self.dispatched += 1;
        match report {
            DispatchReport::Malformed(_) => self.malformed += 1,
            DispatchReport::NoSubscribers => self.dropped += 1,
            DispatchReport::Routed { delivered, failed } => {
                self.delivered += *delivered as u64;
                self.handler_failures += *failed as u64;
            }
        }
    }
}
