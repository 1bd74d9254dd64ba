//! Polling fallback
//!
//! Once the link is ready, every tick writes a trigger byte to the event
//! characteristic and reads it back; the remote answers reads with its most
//! recently buffered event whether or not notifications work. One cycle is
//! in flight at a time: a tick that finds the previous cycle unfinished is
//! skipped, not queued.

use crate::domain::error::LinkError;
use crate::infrastructure::bluetooth::protocol::POLL_TRIGGER;
use crate::infrastructure::bluetooth::radio::{LinkContext, ReadKind};
use crate::infrastructure::bluetooth::timers::{TimerKind, Timers};
use std::time::Instant;
use tracing::{debug, trace, warn};

#[derive(Default)]
pub struct PollingFallback {
    active: bool,
    in_flight_since: Option<Instant>,
    retried: bool,
    last_raw: Option<Vec<u8>>,
}

impl PollingFallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight_since.is_some()
    }

    pub fn start(&mut self, ctx: &mut LinkContext<'_>) {
        if self.active {
            self.stop(ctx.timers);
        }
        debug!("Starting event polling every {:?}", ctx.timings.poll_interval());
        self.active = true;
        let interval = ctx.timings.poll_interval();
        ctx.schedule(TimerKind::PollTick, interval);
    }

    pub fn stop(&mut self, timers: &mut Timers) {
        if self.active {
            debug!("Stopping event polling");
        }
        self.active = false;
        self.in_flight_since = None;
        self.retried = false;
        self.last_raw = None;
        timers.cancel(TimerKind::PollTick);
        timers.cancel(TimerKind::PollRetry);
    }

    pub fn on_tick(&mut self, ctx: &mut LinkContext<'_>, now: Instant) {
        if !self.active {
            return;
        }
        let interval = ctx.timings.poll_interval();
        ctx.schedule(TimerKind::PollTick, interval);

        if let Some(since) = self.in_flight_since {
            if now.saturating_duration_since(since) < ctx.timings.poll_stall_timeout() {
                trace!("Previous poll cycle still running, skipping tick");
                return;
            }
            warn!("Poll cycle stalled, abandoning it");
            ctx.cancel(TimerKind::PollRetry);
        }

        self.in_flight_since = Some(now);
        self.retried = false;
        self.write_trigger(ctx);
    }

    pub fn on_retry(&mut self, ctx: &mut LinkContext<'_>) {
        if self.active && self.in_flight_since.is_some() {
            self.write_trigger(ctx);
        }
    }

    fn write_trigger(&mut self, ctx: &mut LinkContext<'_>) {
        let Some(characteristic) = ctx.characteristic() else {
            warn!("Event characteristic gone, stopping polling");
            self.stop(ctx.timers);
            return;
        };

        if let Err(e) = ctx.radio.write_characteristic(&characteristic, &POLL_TRIGGER) {
            self.write_failed(ctx, e);
        }
    }

    fn write_failed(&mut self, ctx: &mut LinkContext<'_>, error: LinkError) {
        if self.retried {
            debug!("Poll trigger failed again ({}), waiting for next tick", error);
            self.in_flight_since = None;
            return;
        }
        trace!("Poll trigger failed ({}), retrying once", error);
        self.retried = true;
        let delay = ctx.timings.poll_retry_delay();
        ctx.schedule(TimerKind::PollRetry, delay);
    }

    pub fn on_write_complete(&mut self, ctx: &mut LinkContext<'_>, result: Result<(), LinkError>) {
        if !self.active || self.in_flight_since.is_none() {
            return;
        }

        match result {
            Ok(()) => {
                let read = ctx
                    .characteristic()
                    .map(|c| ctx.radio.read_characteristic(&c, ReadKind::Poll));
                if !matches!(read, Some(Ok(()))) {
                    trace!("Poll read not issued");
                    self.in_flight_since = None;
                }
            }
            Err(e) => self.write_failed(ctx, e),
        }
    }

    pub fn on_read_complete(&mut self) {
        self.in_flight_since = None;
    }

    /// Compare a read result with the previous one. Returns false when the
    /// remote's buffer has not changed since the last read.
    pub fn is_fresh_read(&mut self, value: &[u8]) -> bool {
        if self.last_raw.as_deref() == Some(value) {
            return false;
        }
        self.last_raw = Some(value.to_vec());
        true
    }
}
