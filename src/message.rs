//! Message and per-message context.
//!
//! The kernel never inspects the message body; it is opaque bytes plus a
//! coarse `MessageType` tag used only for callback/input type filters.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use bitflags::bitflags;

/// A message's direction. `LR` only ever appears as a stage attribute
/// ("attach to both half-pipes"); a concrete message is always `L` or `R`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    L,
    R,
    LR,
}

impl Direction {
    pub fn is_concrete(self) -> bool {
        matches!(self, Direction::L | Direction::R)
    }

    /// The other concrete direction. Panics on `LR`, which has no opposite.
    pub fn flip(self) -> Direction {
        match self {
            Direction::L => Direction::R,
            Direction::R => Direction::L,
            Direction::LR => panic!("Direction::LR has no opposite"),
        }
    }
}

/// Coarse BGP message type, used only for callback/input type filters. The
/// kernel treats the body as opaque; concrete stages (out of scope here)
/// are responsible for real wire-format parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum MessageType {
    #[default]
    Unknown = 0,
    Open = 1,
    Update = 2,
    Notification = 3,
    Keepalive = 4,
    RouteRefresh = 5,
}

impl MessageType {
    pub fn from_u8(v: u8) -> MessageType {
        match v {
            1 => MessageType::Open,
            2 => MessageType::Update,
            3 => MessageType::Notification,
            4 => MessageType::Keepalive,
            5 => MessageType::RouteRefresh,
            _ => MessageType::Unknown,
        }
    }
}

bitflags! {
    /// Context action bitset. `DROP` is the only action currently used, but
    /// the bitset leaves room for stages to coordinate via other private
    /// bits without growing the context struct.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Action: u32 {
        const DROP = 0b0000_0001;
    }
}

/// Per-message ephemeral record. Writable by callbacks, read by the bus to
/// decide post-callback disposition.
#[derive(Debug, Clone, Default)]
pub struct MessageContext {
    /// Id of the input that injected this message, if any.
    pub input_id: Option<usize>,
    pub action: Action,
    pub tags: HashMap<String, String>,
}

impl MessageContext {
    pub fn new(input_id: Option<usize>) -> Self {
        Self {
            input_id,
            action: Action::empty(),
            tags: HashMap::new(),
        }
    }

    pub fn is_dropped(&self) -> bool {
        self.action.contains(Action::DROP)
    }

    pub fn drop_message(&mut self) {
        self.action.insert(Action::DROP);
    }

    /// Reset for pooled-message reuse.
    pub fn reset(&mut self, input_id: Option<usize>) {
        self.input_id = input_id;
        self.action = Action::empty();
        self.tags.clear();
    }
}

/// An opaque BGP message flowing through one half-pipe.
#[derive(Debug, Clone)]
pub struct Message {
    pub direction: Direction,
    /// Assigned by the half-pipe when the message enters the pipe, not when
    /// constructed. `0` until assigned.
    pub seq: u64,
    pub timestamp_millis: u64,
    pub kind: MessageType,
    pub body: Vec<u8>,
    pub context: MessageContext,
}

impl Message {
    /// Construct a message not yet attached to any half-pipe. `seq` is `0`
    /// until the half-pipe assigns a real sequence number on entry.
    pub fn new(direction: Direction, kind: MessageType, body: Vec<u8>) -> Self {
        assert!(direction.is_concrete(), "a message must have a concrete direction");
        Self {
            direction,
            seq: 0,
            timestamp_millis: now_millis(),
            kind,
            body,
            context: MessageContext::new(None),
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_else(|e| {
            tracing::warn!("SystemTime error: {e}");
            0
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_is_advisory_until_read() {
        let mut ctx = MessageContext::new(Some(3));
        assert!(!ctx.is_dropped());
        ctx.drop_message();
        assert!(ctx.is_dropped());
    }

    #[test]
    fn reset_clears_tags_and_input() {
        let mut ctx = MessageContext::new(Some(1));
        ctx.tags.insert("k".into(), "v".into());
        ctx.drop_message();
        ctx.reset(Some(2));
        assert_eq!(ctx.input_id, Some(2));
        assert!(ctx.tags.is_empty());
        assert!(!ctx.is_dropped());
    }

    #[test]
    #[should_panic]
    fn message_requires_concrete_direction() {
        Message::new(Direction::LR, MessageType::Open, vec![]);
    }
}
