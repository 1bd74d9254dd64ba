//! Fragment reassembly
//!
//! The transport splits messages at arbitrary byte offsets. Fragments are
//! appended to a buffer until the whole buffer frames a JSON object; a
//! buffer that stays incomplete longer than the idle timeout is discarded.

use crate::domain::codec;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Upper bound on buffered bytes; a real message is well under 100 bytes.
const MAX_BUFFER_LEN: usize = 4096;

/// What a fragment did to the buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    /// The buffer framed a whole message and is now empty
    Complete(String),
    /// Still waiting for the rest of a message
    Pending,
    /// The partial message grew past the size cap and was thrown away
    Discarded,
    /// Nothing buffered
    Idle,
}

pub struct ReassemblyBuffer {
    buffer: Vec<u8>,
    idle_since: Option<Instant>,
    idle_timeout: Duration,
}

impl ReassemblyBuffer {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            buffer: Vec::new(),
            idle_since: None,
            idle_timeout,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Append a fragment. Yields the complete message text once the buffer
    /// frames a whole object, leaving the buffer empty.
    pub fn on_fragment(&mut self, bytes: &[u8], now: Instant) -> Fragment {
        if bytes.is_empty() {
            return if self.is_pending() {
                Fragment::Pending
            } else {
                Fragment::Idle
            };
        }

        self.buffer.extend_from_slice(bytes);

        // A split multi-byte character is simply "not complete yet"
        let complete = std::str::from_utf8(&self.buffer)
            .map(codec::is_complete)
            .unwrap_or(false);

        if complete {
            let message = String::from_utf8_lossy(&self.buffer).trim().to_string();
            self.clear();
            trace!("Reassembled message: {}", message);
            return Fragment::Complete(message);
        }

        if self.buffer.len() > MAX_BUFFER_LEN {
            debug!(
                "Fragment buffer exceeded {} bytes without completing, discarding",
                MAX_BUFFER_LEN
            );
            self.clear();
            return Fragment::Discarded;
        }

        self.idle_since = Some(now);
        Fragment::Pending
    }

    /// Discard a partial message that has been idle for at least the
    /// timeout. Returns true if anything was dropped.
    pub fn expire_if_idle(&mut self, now: Instant) -> bool {
        match self.idle_since {
            Some(since) if now.saturating_duration_since(since) >= self.idle_timeout => {
                debug!(
                    "Discarding {} bytes of incomplete message after idle timeout",
                    self.buffer.len()
                );
                self.clear();
                true
            }
            _ => false,
        }
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.idle_since = None;
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Whether an incomplete message is waiting for more fragments
    pub fn is_pending(&self) -> bool {
        self.idle_since.is_some()
    }
}
