//! Cancellable timers for the supervisor loop
//!
//! Each timer is a tokio task that sleeps and then posts a [`TimerFired`]
//! into the supervisor's queue. At most one instance of each [`TimerKind`]
//! is live; scheduling a kind again replaces the previous instance.
//!
//! A fired timer is only honoured if it is still the live instance of its
//! kind and its generation matches the supervisor's current generation, so
//! an expiry that was already queued when its timer got cancelled, or that
//! belongs to a torn-down link, is ignored.

use crate::infrastructure::bluetooth::supervisor::LinkInput;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    ConnectTimeout,
    ConnectRetry,
    DescriptorWriteTimeout,
    DescriptorRetry,
    VerificationSettle,
    Probe,
    Verification,
    FragmentIdle,
    PollTick,
    PollRetry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: TimerKind,
    pub generation: u64,
    seq: u64,
}

struct PendingTimer {
    seq: u64,
    handle: JoinHandle<()>,
}

pub struct Timers {
    sender: mpsc::UnboundedSender<LinkInput>,
    pending: HashMap<TimerKind, PendingTimer>,
    next_seq: u64,
}

impl Timers {
    pub fn new(sender: mpsc::UnboundedSender<LinkInput>) -> Self {
        Self {
            sender,
            pending: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Start (or restart) the timer of this kind.
    pub fn schedule(&mut self, kind: TimerKind, delay: Duration, generation: u64) {
        self.cancel(kind);

        self.next_seq += 1;
        let fired = TimerFired {
            kind,
            generation,
            seq: self.next_seq,
        };
        let sender = self.sender.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sender.send(LinkInput::Timer(fired));
        });

        trace!("Timer {:?} scheduled in {:?} (gen {})", kind, delay, generation);
        self.pending.insert(
            kind,
            PendingTimer {
                seq: fired.seq,
                handle,
            },
        );
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        if let Some(timer) = self.pending.remove(&kind) {
            timer.handle.abort();
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, timer) in self.pending.drain() {
            timer.handle.abort();
        }
    }

    pub fn is_pending(&self, kind: TimerKind) -> bool {
        self.pending.contains_key(&kind)
    }

    /// Decide whether a fired timer is still live. A live timer is consumed.
    pub fn accept(&mut self, fired: &TimerFired, generation: u64) -> bool {
        let live = self
            .pending
            .get(&fired.kind)
            .is_some_and(|timer| timer.seq == fired.seq);
        if !live || fired.generation != generation {
            trace!("Ignoring stale timer {:?} (gen {})", fired.kind, fired.generation);
            return false;
        }
        self.pending.remove(&fired.kind);
        true
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
