//! Suppression of radio-level retransmissions
//!
//! Only the most recently forwarded command is remembered. A decoded event
//! with the same `(type, mainIndex, subIndex)` inside the window is treated
//! as a retransmission, not a new user action.

use crate::domain::models::{DeviceEvent, EventKind};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct LastCommand {
    key: (EventKind, i32, i32),
    forwarded_at: Instant,
}

pub struct DuplicateFilter {
    window: Duration,
    last: Option<LastCommand>,
}

impl DuplicateFilter {
    pub fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    pub fn should_suppress(&self, event: &DeviceEvent, now: Instant) -> bool {
        self.last.is_some_and(|last| {
            last.key == event.command_key()
                && now.saturating_duration_since(last.forwarded_at) < self.window
        })
    }

    pub fn record_sent(&mut self, event: &DeviceEvent, now: Instant) {
        self.last = Some(LastCommand {
            key: event.command_key(),
            forwarded_at: now,
        });
    }

    /// Check and record in one step. Returns true if the event should be
    /// forwarded.
    pub fn admit(&mut self, event: &DeviceEvent, now: Instant) -> bool {
        if self.should_suppress(event, now) {
            return false;
        }
        self.record_sent(event, now);
        true
    }

    pub fn reset(&mut self) {
        self.last = None;
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_none()
    }
}
