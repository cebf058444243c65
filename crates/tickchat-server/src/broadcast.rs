use std::collections::BTreeMap;

use bytes::Bytes;
use tickchat_proto::{encode_batch, ChannelId, ServerEvent, SystemEvent};

use crate::connection::ConnId;
use crate::queue::SharedQueue;

/// A chat event waiting to be broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEvent {
    /// Connection the event is about.
    pub origin: ConnId,
    pub event: ServerEvent,
}

impl ChatEvent {
    pub fn user(
        origin: ConnId,
        name: &str,
        text: impl Into<String>,
        timestamp: u64,
        channel: ChannelId,
    ) -> Self {
        Self {
            origin,
            event: ServerEvent::user(name, text, timestamp, channel),
        }
    }

    pub fn system(
        origin: ConnId,
        name: &str,
        event: SystemEvent,
        timestamp: u64,
        channel: ChannelId,
    ) -> Self {
        Self {
            origin,
            event: ServerEvent::system(name, event, timestamp, channel),
        }
    }

    pub fn timestamp(&self) -> u64 {
        self.event.timestamp
    }
}

/// Producer side of a channel's event stream.
pub type EventQueue = SharedQueue<ChatEvent>;

/// Events of the current broadcast window, ordered by timestamp.
///
/// Equal timestamps keep arrival order.
#[derive(Debug, Default)]
pub struct BroadcastWindow {
    events: BTreeMap<(u64, u64), ChatEvent>,
    seq: u64,
}

impl BroadcastWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: ChatEvent) {
        self.events.insert((event.timestamp(), self.seq), event);
        self.seq += 1;
    }

    /// Move everything queued so far into the window.
    pub fn absorb(&mut self, queue: &EventQueue) -> usize {
        let drained = queue.drain();
        let count = drained.len();
        for event in drained {
            self.push(event);
        }
        count
    }

    /// The window as one JSON array payload, or `None` when empty.
    pub fn batch(&self) -> tickchat_proto::Result<Option<Bytes>> {
        if self.events.is_empty() {
            return Ok(None);
        }
        encode_batch(self.events.values().map(|chat| &chat.event)).map(Some)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChatEvent> {
        self.events.values()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}
