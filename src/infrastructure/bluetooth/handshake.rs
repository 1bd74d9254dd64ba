//! Notification subscription handshake
//!
//! Two retry tiers:
//!
//! - **write retry**: the CCCD write was refused, failed, or never
//!   confirmed. The write is repeated after a fixed delay, re-resolving the
//!   characteristic each time, up to `max_descriptor_retries`.
//! - **verification retry**: the write was confirmed but no event arrived
//!   before the verification timer fired. The write is issued again, up to
//!   `max_verification_retries`.
//!
//! After a confirmed write a few read probes are sent to nudge peripherals
//! that accept the subscription without starting to notify.

use crate::domain::error::LinkError;
use crate::infrastructure::bluetooth::protocol::{self, ENABLE_NOTIFICATION_VALUE};
use crate::infrastructure::bluetooth::radio::{LinkContext, ReadKind};
use crate::infrastructure::bluetooth::timers::{TimerKind, Timers};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Pending,
    Failed(LinkError),
}

pub struct SubscriptionHandshake {
    cccd: Uuid,
    write_retries: u32,
    verification_retries: u32,
    probes_sent: u32,
    subscribed: bool,
    verified: bool,
}

impl Default for SubscriptionHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionHandshake {
    pub fn new() -> Self {
        Self {
            cccd: Uuid::from_u128(protocol::CCCD),
            write_retries: 0,
            verification_retries: 0,
            probes_sent: 0,
            subscribed: false,
            verified: false,
        }
    }

    pub fn reset(&mut self) {
        self.write_retries = 0;
        self.verification_retries = 0;
        self.probes_sent = 0;
        self.subscribed = false;
        self.verified = false;
    }

    /// The CCCD write has been confirmed for the current attempt
    pub fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    pub fn is_verified(&self) -> bool {
        self.verified
    }

    pub fn write_retries(&self) -> u32 {
        self.write_retries
    }

    pub fn verification_retries(&self) -> u32 {
        self.verification_retries
    }

    pub fn begin(&mut self, ctx: &mut LinkContext<'_>) -> HandshakeOutcome {
        self.reset();
        info!("Enabling notifications on {}", ctx.link);
        self.write_descriptor(ctx)
    }

    fn write_descriptor(&mut self, ctx: &mut LinkContext<'_>) -> HandshakeOutcome {
        self.subscribed = false;

        let Some(characteristic) = ctx.characteristic() else {
            return self.write_failed(
                ctx,
                LinkError::Transient("event characteristic not available".into()),
            );
        };

        if let Err(e) = ctx.radio.enable_notifications(&characteristic) {
            return self.write_failed(ctx, e);
        }

        match ctx
            .radio
            .write_descriptor(&characteristic, self.cccd, &ENABLE_NOTIFICATION_VALUE)
        {
            Ok(()) => {
                let timeout = ctx.timings.descriptor_write_timeout();
                ctx.schedule(TimerKind::DescriptorWriteTimeout, timeout);
                HandshakeOutcome::Pending
            }
            Err(e) => self.write_failed(ctx, e),
        }
    }

    fn write_failed(&mut self, ctx: &mut LinkContext<'_>, error: LinkError) -> HandshakeOutcome {
        self.subscribed = false;
        ctx.cancel(TimerKind::DescriptorWriteTimeout);

        if !error.is_retryable() {
            warn!("Descriptor write failed permanently: {}", error);
            return HandshakeOutcome::Failed(error);
        }

        let max = ctx.timings.max_descriptor_retries;
        if self.write_retries >= max {
            warn!("Descriptor write failed after {} retries: {}", max, error);
            return HandshakeOutcome::Failed(LinkError::HandshakeFailed(format!(
                "descriptor write failed after {} retries: {}",
                max, error
            )));
        }

        self.write_retries += 1;
        warn!(
            "Descriptor write failed ({}), retrying ({}/{})",
            error, self.write_retries, max
        );
        let delay = ctx.timings.descriptor_retry_delay();
        ctx.schedule(TimerKind::DescriptorRetry, delay);
        HandshakeOutcome::Pending
    }

    pub fn on_descriptor_written(
        &mut self,
        ctx: &mut LinkContext<'_>,
        result: Result<(), LinkError>,
    ) -> HandshakeOutcome {
        match result {
            Ok(()) => {
                if self.subscribed {
                    return HandshakeOutcome::Pending;
                }
                ctx.cancel(TimerKind::DescriptorWriteTimeout);
                ctx.cancel(TimerKind::DescriptorRetry);
                self.subscribed = true;
                self.write_retries = 0;
                self.probes_sent = 0;
                info!("Descriptor write confirmed, verifying delivery");

                let settle = ctx.timings.verification_settle();
                let timeout = ctx.timings.verification_timeout();
                ctx.schedule(TimerKind::VerificationSettle, settle);
                ctx.schedule(TimerKind::Verification, timeout);
                HandshakeOutcome::Pending
            }
            Err(e) => {
                // Already timed out and scheduled a retry for this write
                if ctx.timers.is_pending(TimerKind::DescriptorRetry) {
                    debug!("Late descriptor write failure ignored: {}", e);
                    return HandshakeOutcome::Pending;
                }
                self.write_failed(ctx, e)
            }
        }
    }

    pub fn on_timer(&mut self, ctx: &mut LinkContext<'_>, kind: TimerKind) -> HandshakeOutcome {
        match kind {
            TimerKind::DescriptorWriteTimeout => {
                self.write_failed(ctx, LinkError::Timeout("descriptor write"))
            }
            TimerKind::DescriptorRetry => self.write_descriptor(ctx),
            TimerKind::VerificationSettle | TimerKind::Probe => {
                self.probe(ctx);
                HandshakeOutcome::Pending
            }
            TimerKind::Verification => self.verification_expired(ctx),
            _ => HandshakeOutcome::Pending,
        }
    }

    fn probe(&mut self, ctx: &mut LinkContext<'_>) {
        if !self.subscribed || self.verified {
            return;
        }

        if let Some(characteristic) = ctx.characteristic() {
            if let Err(e) = ctx.radio.read_characteristic(&characteristic, ReadKind::Probe) {
                debug!("Verification probe not sent: {}", e);
            }
        }

        self.probes_sent += 1;
        if self.probes_sent < ctx.timings.probe_count {
            let spacing = ctx.timings.probe_spacing();
            ctx.schedule(TimerKind::Probe, spacing);
        }
    }

    fn verification_expired(&mut self, ctx: &mut LinkContext<'_>) -> HandshakeOutcome {
        if !self.subscribed || self.verified {
            return HandshakeOutcome::Pending;
        }

        let max = ctx.timings.max_verification_retries;
        if self.verification_retries >= max {
            warn!("No events after {} re-subscriptions, giving up", max);
            return HandshakeOutcome::Failed(LinkError::HandshakeFailed(format!(
                "subscription accepted but no events after {} retries",
                max
            )));
        }

        self.verification_retries += 1;
        warn!(
            "Subscription not delivering events, rewriting descriptor ({}/{})",
            self.verification_retries, max
        );
        ctx.cancel(TimerKind::VerificationSettle);
        ctx.cancel(TimerKind::Probe);
        self.write_descriptor(ctx)
    }

    /// An inbound message arrived. Returns true if it completes verification.
    pub fn on_inbound_event(&mut self, timers: &mut Timers) -> bool {
        if !self.subscribed || self.verified {
            return false;
        }
        self.verified = true;
        timers.cancel(TimerKind::Verification);
        timers.cancel(TimerKind::VerificationSettle);
        timers.cancel(TimerKind::Probe);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::settings::LinkTimings;
    use crate::infrastructure::bluetooth::radio::fake::{FakeRadio, RadioCall, Reply};
    use crate::infrastructure::bluetooth::radio::{LinkId, RadioEventSink};
    use crate::infrastructure::bluetooth::supervisor::LinkInput;
    use tokio::sync::mpsc;

    struct Rig {
        radio: FakeRadio,
        timers: Timers,
        timings: LinkTimings,
        _rx: mpsc::UnboundedReceiver<LinkInput>,
    }

    const LINK: LinkId = LinkId(1);

    impl Rig {
        fn new() -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            let radio = FakeRadio::new(RadioEventSink::new(tx.clone()));
            radio.script(|s| s.current_link = Some(LINK));
            Self {
                radio,
                timers: Timers::new(tx),
                timings: LinkTimings::default(),
                _rx: rx,
            }
        }

        fn ctx(&mut self) -> LinkContext<'_> {
            LinkContext {
                radio: &self.radio,
                timers: &mut self.timers,
                link: LINK,
                service: Uuid::from_u128(protocol::SERVICE),
                characteristic: Uuid::from_u128(protocol::EVENT_CHARACTERISTIC),
                timings: &self.timings,
            }
        }

        fn descriptor_writes(&self) -> usize {
            self.radio
                .count(|c| matches!(c, RadioCall::WriteDescriptor(_)))
        }
    }

    #[tokio::test]
    async fn test_confirmed_write_starts_verification() {
        let mut rig = Rig::new();
        let mut hs = SubscriptionHandshake::new();

        assert_eq!(hs.begin(&mut rig.ctx()), HandshakeOutcome::Pending);
        assert_eq!(rig.descriptor_writes(), 1);
        assert!(rig.timers.is_pending(TimerKind::DescriptorWriteTimeout));

        hs.on_descriptor_written(&mut rig.ctx(), Ok(()));
        assert!(hs.is_subscribed());
        assert!(!rig.timers.is_pending(TimerKind::DescriptorWriteTimeout));
        assert!(rig.timers.is_pending(TimerKind::VerificationSettle));
        assert!(rig.timers.is_pending(TimerKind::Verification));

        assert!(hs.on_inbound_event(&mut rig.timers));
        assert!(hs.is_verified());
        assert!(!rig.timers.is_pending(TimerKind::Verification));
        assert!(!hs.on_inbound_event(&mut rig.timers));
    }

    #[tokio::test]
    async fn test_events_before_confirmation_do_not_verify() {
        let mut rig = Rig::new();
        let mut hs = SubscriptionHandshake::new();
        hs.begin(&mut rig.ctx());
        assert!(!hs.on_inbound_event(&mut rig.timers));
    }

    #[tokio::test]
    async fn test_write_failures_are_bounded() {
        let mut rig = Rig::new();
        let mut hs = SubscriptionHandshake::new();
        hs.begin(&mut rig.ctx());

        for attempt in 1..=3 {
            let outcome = hs.on_descriptor_written(
                &mut rig.ctx(),
                Err(LinkError::Transient("status 133".into())),
            );
            assert_eq!(outcome, HandshakeOutcome::Pending);
            assert_eq!(hs.write_retries(), attempt);
            assert!(rig.timers.is_pending(TimerKind::DescriptorRetry));

            rig.timers.cancel(TimerKind::DescriptorRetry);
            hs.on_timer(&mut rig.ctx(), TimerKind::DescriptorRetry);
        }
        assert_eq!(rig.descriptor_writes(), 4);

        let outcome = hs.on_descriptor_written(
            &mut rig.ctx(),
            Err(LinkError::Transient("status 133".into())),
        );
        assert!(matches!(
            outcome,
            HandshakeOutcome::Failed(LinkError::HandshakeFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_write_timeout_enters_retry_path() {
        let mut rig = Rig::new();
        let mut hs = SubscriptionHandshake::new();
        hs.begin(&mut rig.ctx());

        rig.timers.cancel(TimerKind::DescriptorWriteTimeout);
        let outcome = hs.on_timer(&mut rig.ctx(), TimerKind::DescriptorWriteTimeout);
        assert_eq!(outcome, HandshakeOutcome::Pending);
        assert_eq!(hs.write_retries(), 1);
        assert!(rig.timers.is_pending(TimerKind::DescriptorRetry));

        // A late failure for the timed-out write does not count twice
        hs.on_descriptor_written(&mut rig.ctx(), Err(LinkError::Transient("late".into())));
        assert_eq!(hs.write_retries(), 1);
    }

    #[tokio::test]
    async fn test_missing_characteristic_counts_as_write_failure() {
        let mut rig = Rig::new();
        rig.radio.script(|s| s.has_characteristic = false);
        let mut hs = SubscriptionHandshake::new();

        assert_eq!(hs.begin(&mut rig.ctx()), HandshakeOutcome::Pending);
        assert_eq!(hs.write_retries(), 1);
        assert_eq!(rig.descriptor_writes(), 0);
    }

    #[tokio::test]
    async fn test_rejected_write_is_retried() {
        let mut rig = Rig::new();
        rig.radio
            .script(|s| s.descriptor_replies.push_back(Reply::Reject));
        let mut hs = SubscriptionHandshake::new();

        assert_eq!(hs.begin(&mut rig.ctx()), HandshakeOutcome::Pending);
        assert_eq!(hs.write_retries(), 1);
        assert!(rig.timers.is_pending(TimerKind::DescriptorRetry));
    }

    #[tokio::test]
    async fn test_probes_follow_settle_delay() {
        let mut rig = Rig::new();
        let mut hs = SubscriptionHandshake::new();
        hs.begin(&mut rig.ctx());
        hs.on_descriptor_written(&mut rig.ctx(), Ok(()));

        rig.timers.cancel(TimerKind::VerificationSettle);
        hs.on_timer(&mut rig.ctx(), TimerKind::VerificationSettle);
        for _ in 0..2 {
            assert!(rig.timers.is_pending(TimerKind::Probe));
            rig.timers.cancel(TimerKind::Probe);
            hs.on_timer(&mut rig.ctx(), TimerKind::Probe);
        }

        let probes = rig
            .radio
            .count(|c| matches!(c, RadioCall::Read(_, ReadKind::Probe)));
        assert_eq!(probes, 3);
        assert!(!rig.timers.is_pending(TimerKind::Probe));
    }

    #[tokio::test]
    async fn test_silent_subscription_rewrites_until_cap() {
        let mut rig = Rig::new();
        let mut hs = SubscriptionHandshake::new();
        hs.begin(&mut rig.ctx());

        for retry in 1..=2 {
            hs.on_descriptor_written(&mut rig.ctx(), Ok(()));
            let outcome = hs.on_timer(&mut rig.ctx(), TimerKind::Verification);
            assert_eq!(outcome, HandshakeOutcome::Pending);
            assert_eq!(hs.verification_retries(), retry);
            assert_eq!(rig.descriptor_writes(), 1 + retry as usize);
        }

        hs.on_descriptor_written(&mut rig.ctx(), Ok(()));
        let outcome = hs.on_timer(&mut rig.ctx(), TimerKind::Verification);
        assert!(matches!(outcome, HandshakeOutcome::Failed(_)));
        assert_eq!(rig.descriptor_writes(), 3);
    }
}
