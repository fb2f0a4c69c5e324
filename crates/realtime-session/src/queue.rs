//! FIFO buffer for messages emitted while the link is down.
//!
//! Delivery after a flush is at-least-once: a message written just before a
//! late-detected disconnect stays queued and is sent again. There is no
//! deduplication.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::transport::{Frame, LinkSender};
use crate::types::Error;

/// What to do when a bounded queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Evict the oldest entry to make room.
    #[default]
    DropOldest,
    /// Refuse the new entry with [`Error::QueueFull`].
    RejectNew,
}

#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub event: String,
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct OutboundMessageQueue {
    entries: VecDeque<QueuedMessage>,
    capacity: Option<usize>,
    policy: OverflowPolicy,
    dropped: u64,
}

impl OutboundMessageQueue {
    /// `capacity: None` makes the queue unbounded.
    pub fn new(capacity: Option<usize>, policy: OverflowPolicy) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
            policy,
            dropped: 0,
        }
    }

    pub fn enqueue(&mut self, event: &str, payload: serde_json::Value) -> Result<(), Error> {
        let full = self.capacity.is_some_and(|cap| self.entries.len() >= cap);
        if full {
            match self.policy {
                OverflowPolicy::RejectNew => return Err(Error::QueueFull),
                OverflowPolicy::DropOldest => {
                    if let Some(evicted) = self.entries.pop_front() {
                        self.dropped += 1;
                        tracing::warn!(
                            event = %evicted.event,
                            total_dropped = self.dropped,
                            "outbound queue full, dropping oldest message"
                        );
                    }
                }
            }
        }
        self.entries.push_back(QueuedMessage {
            event: event.to_string(),
            payload,
            enqueued_at: Utc::now(),
        });
        Ok(())
    }

    /// Put frames back at the head, keeping their order, ahead of anything
    /// queued since. They were accepted once already, so capacity is not
    /// enforced for them.
    pub fn requeue_front(&mut self, frames: Vec<Frame>) {
        let now = Utc::now();
        for frame in frames.into_iter().rev() {
            self.entries.push_front(QueuedMessage {
                event: frame.event,
                payload: frame.data,
                enqueued_at: now,
            });
        }
    }

    /// Send queued messages from the head in order. Stops at the first send
    /// failure and leaves that message (and everything after it) queued.
    /// Returns how many were sent.
    pub fn flush_to(&mut self, sender: &mut dyn LinkSender) -> usize {
        let mut sent = 0;
        while let Some(msg) = self.entries.pop_front() {
            let frame = Frame::new(msg.event.clone(), msg.payload.clone());
            if let Err(e) = sender.send(frame) {
                tracing::warn!(
                    remaining = self.entries.len() + 1,
                    "flush interrupted: {e}"
                );
                self.entries.push_front(msg);
                break;
            }
            sent += 1;
        }
        if sent > 0 {
            tracing::debug!(sent, "flushed outbound queue");
        }
        sent
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Messages evicted by [`OverflowPolicy::DropOldest`] so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedMessage> {
        self.entries.iter()
    }
}
