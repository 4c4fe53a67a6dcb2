//! Outbound Sender queue.
//!
//! Holds messages issued while the link is down. The queue is bounded: once
//! full, each new message evicts the oldest one, so memory stays flat no
//! matter how long the disconnect lasts. On reconnect the multiplexer drains
//! it front to back before anything new is sent.

use std::collections::VecDeque;

use crate::message::{ChannelName, Message};

/// A message waiting for the link.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    /// Destination channel.
    pub channel: ChannelName,
    /// Message, already stamped.
    pub message: Message,
}

/// Bounded FIFO of [`QueuedMessage`]s.
#[derive(Debug)]
pub struct OutboundQueue {
    buf: VecDeque<QueuedMessage>,
    capacity: usize,
    evicted: u64,
}

impl OutboundQueue {
    /// Queue holding at most `capacity` messages (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buf: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            evicted: 0,
        }
    }

    /// Append, evicting the oldest entry when full. Returns the evicted entry.
    pub fn push(&mut self, entry: QueuedMessage) -> Option<QueuedMessage> {
        let evicted = if self.buf.len() >= self.capacity {
            self.evicted += 1;
            self.buf.pop_front()
        } else {
            None
        };
        self.buf.push_back(entry);
        evicted
    }

    /// Remove the oldest entry.
    pub fn pop(&mut self) -> Option<QueuedMessage> {
        self.buf.pop_front()
    }

    /// Put an entry back at the front (a send failed mid-flush).
    pub fn requeue_front(&mut self, entry: QueuedMessage) {
        self.buf.push_front(entry);
    }

    /// Number of waiting messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when nothing is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Maximum number of waiting messages.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total entries evicted since creation.
    #[must_use]
    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
