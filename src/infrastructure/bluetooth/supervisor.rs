//! Connection supervisor
//!
//! Owns the single link and drives it through
//! `Idle → Connecting → ServiceDiscovery → Subscribing → Ready`. Every input
//! (application commands, radio callbacks, timer expiries) arrives on one
//! queue and is handled to completion before the next, so no two inputs
//! ever touch link state concurrently.
//!
//! The application only hears `ConnectionChanged(true)` once the
//! subscription has been verified by an actual inbound event.

use crate::domain::codec;
use crate::domain::duplicate::DuplicateFilter;
use crate::domain::error::LinkError;
use crate::domain::models::{
    AppEvent, LinkState, MessageSeverity, PeripheralIdentity, StatusMessage,
};
use crate::domain::reassembly::{Fragment, ReassemblyBuffer};
use crate::domain::settings::{LinkTimings, Settings};
use crate::infrastructure::bluetooth::handshake::{HandshakeOutcome, SubscriptionHandshake};
use crate::infrastructure::bluetooth::polling::PollingFallback;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::radio::{
    LinkContext, LinkId, RadioEvent, RadioStack, ReadKind,
};
use crate::infrastructure::bluetooth::scanner::BleScanner;
use crate::infrastructure::bluetooth::timers::{TimerFired, TimerKind, Timers};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Requests from the application
#[derive(Debug, Clone)]
pub enum LinkCommand {
    Connect(PeripheralIdentity),
    Disconnect,
    StartScan,
    StopScan,
    Shutdown,
}

/// Everything the owner loop consumes
#[derive(Debug)]
pub enum LinkInput {
    Command(LinkCommand),
    Radio(RadioEvent),
    Timer(TimerFired),
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub service_uuid: Uuid,
    pub event_char_uuid: Uuid,
    pub device_names: Vec<String>,
    pub timings: LinkTimings,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            service_uuid: Uuid::from_u128(protocol::SERVICE),
            event_char_uuid: Uuid::from_u128(protocol::EVENT_CHARACTERISTIC),
            device_names: protocol::KNOWN_DEVICE_NAMES
                .iter()
                .map(|name| name.to_string())
                .collect(),
            timings: LinkTimings::default(),
        }
    }
}

impl LinkConfig {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        Ok(Self {
            service_uuid: protocol::parse_uuid(&settings.ble_service_uuid)?,
            event_char_uuid: protocol::parse_uuid(&settings.ble_event_char_uuid)?,
            device_names: settings.device_names.clone(),
            timings: settings.timings.clone(),
        })
    }
}

fn link_context<'a>(
    radio: &'a dyn RadioStack,
    timers: &'a mut Timers,
    config: &'a LinkConfig,
    link: LinkId,
) -> LinkContext<'a> {
    LinkContext {
        radio,
        timers,
        link,
        service: config.service_uuid,
        characteristic: config.event_char_uuid,
        timings: &config.timings,
    }
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

pub struct LinkSupervisor {
    config: LinkConfig,
    radio: Arc<dyn RadioStack>,
    events: mpsc::UnboundedSender<AppEvent>,
    state_tx: watch::Sender<LinkState>,
    state: LinkState,
    /// Bumped whenever a link is opened or released; doubles as the id of
    /// the current link.
    generation: u64,
    link: Option<LinkId>,
    target: Option<PeripheralIdentity>,
    connect_retries: u32,
    /// Last value sent as `ConnectionChanged`, cleared by each `connect`
    reported: Option<bool>,
    timers: Timers,
    scanner: BleScanner,
    reassembly: ReassemblyBuffer,
    duplicates: DuplicateFilter,
    handshake: SubscriptionHandshake,
    polling: PollingFallback,
}

impl LinkSupervisor {
    pub fn new(
        config: LinkConfig,
        radio: Arc<dyn RadioStack>,
        loopback: mpsc::UnboundedSender<LinkInput>,
        events: mpsc::UnboundedSender<AppEvent>,
        state_tx: watch::Sender<LinkState>,
    ) -> Self {
        let scanner = BleScanner::new(
            config.service_uuid,
            config.device_names.clone(),
            events.clone(),
        );
        let reassembly = ReassemblyBuffer::new(config.timings.fragment_idle_timeout());
        let duplicates = DuplicateFilter::new(config.timings.duplicate_window());

        Self {
            config,
            radio,
            events,
            state_tx,
            state: LinkState::Idle,
            generation: 0,
            link: None,
            target: None,
            connect_retries: 0,
            reported: None,
            timers: Timers::new(loopback),
            scanner,
            reassembly,
            duplicates,
            handshake: SubscriptionHandshake::new(),
            polling: PollingFallback::new(),
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<LinkInput>) {
        info!("Link supervisor started");
        while let Some(input) = inbox.recv().await {
            if !self.handle(input) {
                break;
            }
        }
        self.scanner.stop(self.radio.as_ref());
        self.release_link();
        info!("Link supervisor stopped");
    }

    /// Handle one input. Returns false once the loop should stop.
    pub fn handle(&mut self, input: LinkInput) -> bool {
        match input {
            LinkInput::Command(command) => return self.on_command(command),
            LinkInput::Radio(event) => self.on_radio(event),
            LinkInput::Timer(fired) => self.on_timer(fired),
        }
        true
    }

    fn on_command(&mut self, command: LinkCommand) -> bool {
        debug!("Command: {:?}", command);
        match command {
            LinkCommand::Connect(identity) => self.connect(identity),
            LinkCommand::Disconnect => self.disconnect(),
            LinkCommand::StartScan => self.scanner.start(self.radio.as_ref()),
            LinkCommand::StopScan => self.scanner.stop(self.radio.as_ref()),
            LinkCommand::Shutdown => {
                self.disconnect();
                return false;
            }
        }
        true
    }

    // Lifecycle

    fn connect(&mut self, identity: PeripheralIdentity) {
        if self.link.is_some() || self.state != LinkState::Idle {
            info!("Replacing current link before connecting to {}", identity);
            self.disconnect();
        }

        self.send_log(
            format!("Connecting to {}...", identity),
            MessageSeverity::Info,
        );
        self.target = Some(identity);
        self.connect_retries = 0;
        self.reported = None;
        self.attempt_connect();
    }

    fn attempt_connect(&mut self) {
        let Some(identity) = self.target.clone() else {
            return;
        };

        self.generation += 1;
        let link = LinkId(self.generation);
        self.link = Some(link);
        self.set_state(LinkState::Connecting);

        if !self.radio.is_powered() {
            self.fail_terminal(LinkError::RadioUnavailable(
                "Bluetooth is not enabled".into(),
            ));
            return;
        }

        info!("Opening {} to {}", link, identity);
        match self.radio.connect(link, &identity) {
            Ok(()) => {
                let timeout = self.config.timings.connect_timeout();
                self.timers
                    .schedule(TimerKind::ConnectTimeout, timeout, self.generation);
            }
            Err(e) => self.connect_failed(e),
        }
    }

    fn connect_failed(&mut self, error: LinkError) {
        self.release_link();

        if !error.is_retryable() {
            self.fail_terminal(error);
            return;
        }

        let max = self.config.timings.max_connect_retries;
        if self.connect_retries >= max {
            self.fail_terminal(LinkError::Transient(format!(
                "connection failed after {} retries: {}",
                max, error
            )));
            return;
        }

        self.connect_retries += 1;
        warn!(
            "Connection attempt failed ({}), retrying ({}/{})",
            error, self.connect_retries, max
        );
        self.send_log(
            format!(
                "Connection failed, retrying ({}/{})",
                self.connect_retries, max
            ),
            MessageSeverity::Warning,
        );
        self.set_state(LinkState::Failed);
        let delay = self.config.timings.connect_retry_delay();
        self.timers
            .schedule(TimerKind::ConnectRetry, delay, self.generation);
    }

    /// Give up on the current attempt sequence. A new `connect` is needed.
    fn fail_terminal(&mut self, error: LinkError) {
        error!("Connection failed: {}", error);
        self.release_link();
        self.set_state(LinkState::Failed);
        self.send_log(
            format!("Connection failed: {}", error),
            MessageSeverity::Error,
        );
        self.report(false);
        self.target = None;
        self.connect_retries = 0;
        self.set_state(LinkState::Idle);
    }

    fn disconnect(&mut self) {
        if self.link.is_none() && self.state == LinkState::Idle {
            return;
        }
        info!("Disconnecting");
        self.close_session("Disconnected from device");
    }

    fn close_session(&mut self, message: &str) {
        self.set_state(LinkState::Disconnected);
        self.release_link();
        self.send_log(message, MessageSeverity::Info);
        self.report(false);
        self.target = None;
        self.connect_retries = 0;
        self.set_state(LinkState::Idle);
    }

    /// Drop everything tied to the current link. Anything still queued for
    /// it is ignored from here on.
    fn release_link(&mut self) {
        self.timers.cancel_all();
        self.polling.stop(&mut self.timers);
        if let Some(link) = self.link.take() {
            debug!("Closing {}", link);
            self.radio.close(link);
        }
        self.generation += 1;
        self.reassembly.clear();
        self.duplicates.reset();
        self.handshake.reset();
    }

    fn enter_ready(&mut self, link: LinkId) {
        self.set_state(LinkState::Ready);
        self.connect_retries = 0;

        let mut ctx = link_context(self.radio.as_ref(), &mut self.timers, &self.config, link);
        self.polling.start(&mut ctx);

        let target = self
            .target
            .as_ref()
            .map(|t| t.to_string())
            .unwrap_or_default();
        info!("Link ready, events verified from {}", target);
        self.send_log(
            format!("Connected to {}", target),
            MessageSeverity::Success,
        );
        self.report(true);
    }

    // Radio events

    fn on_radio(&mut self, event: RadioEvent) {
        if let Some(link) = event.link() {
            if self.link != Some(link) {
                trace!("Dropping event for stale {}: {:?}", link, event);
                return;
            }
        }

        match event {
            RadioEvent::Advertisement(advertisement) => {
                self.scanner.on_advertisement(advertisement)
            }
            RadioEvent::ScanFailed(reason) => self.scanner.on_scan_failed(&reason),
            RadioEvent::Connected { link } => self.on_connected(link),
            RadioEvent::ConnectFailed { error, .. } => {
                if self.state == LinkState::Connecting {
                    self.timers.cancel(TimerKind::ConnectTimeout);
                    self.connect_failed(error);
                }
            }
            RadioEvent::Disconnected { link } => self.on_link_lost(link),
            RadioEvent::MtuChanged { link, mtu } => info!("MTU on {} is now {}", link, mtu),
            RadioEvent::ServicesDiscovered { link, result } => {
                self.on_services_discovered(link, result)
            }
            RadioEvent::DescriptorWritten { link, result } => {
                if self.state == LinkState::Subscribing {
                    let mut ctx =
                        link_context(self.radio.as_ref(), &mut self.timers, &self.config, link);
                    let outcome = self.handshake.on_descriptor_written(&mut ctx, result);
                    self.after_handshake(outcome);
                }
            }
            RadioEvent::CharacteristicWritten { link, result } => {
                if self.state == LinkState::Ready {
                    let mut ctx =
                        link_context(self.radio.as_ref(), &mut self.timers, &self.config, link);
                    self.polling.on_write_complete(&mut ctx, result);
                }
            }
            RadioEvent::CharacteristicRead { link, kind, result } => {
                self.on_read(link, kind, result)
            }
            RadioEvent::Notification { link, value } => {
                if matches!(self.state, LinkState::Subscribing | LinkState::Ready) {
                    self.ingest(link, &value);
                }
            }
        }
    }

    fn on_connected(&mut self, link: LinkId) {
        if self.state != LinkState::Connecting {
            return;
        }
        self.timers.cancel(TimerKind::ConnectTimeout);
        info!("{} connected, discovering services", link);
        self.set_state(LinkState::ServiceDiscovery);

        if let Err(e) = self
            .radio
            .request_mtu(link, self.config.timings.preferred_mtu)
        {
            debug!("MTU request not sent: {}", e);
        }

        if let Err(e) = self.radio.discover_services(link) {
            self.connect_failed(e);
        }
    }

    fn on_services_discovered(&mut self, link: LinkId, result: Result<(), LinkError>) {
        if self.state != LinkState::ServiceDiscovery {
            return;
        }
        if let Err(e) = result {
            self.connect_failed(e);
            return;
        }

        let characteristic = self.radio.find_characteristic(
            link,
            self.config.service_uuid,
            self.config.event_char_uuid,
        );
        let Some(characteristic) = characteristic else {
            self.fail_terminal(LinkError::IncompatiblePeripheral(format!(
                "service {} / characteristic {} not found",
                self.config.service_uuid, self.config.event_char_uuid
            )));
            return;
        };
        if !characteristic.properties.notify {
            self.fail_terminal(LinkError::IncompatiblePeripheral(format!(
                "characteristic {} does not support notifications",
                characteristic.uuid
            )));
            return;
        }

        self.set_state(LinkState::Subscribing);
        let mut ctx = link_context(self.radio.as_ref(), &mut self.timers, &self.config, link);
        let outcome = self.handshake.begin(&mut ctx);
        self.after_handshake(outcome);
    }

    fn after_handshake(&mut self, outcome: HandshakeOutcome) {
        if let HandshakeOutcome::Failed(error) = outcome {
            self.fail_terminal(error);
        }
    }

    fn on_read(&mut self, link: LinkId, kind: ReadKind, result: Result<Vec<u8>, LinkError>) {
        if kind == ReadKind::Poll {
            self.polling.on_read_complete();
        }
        if !matches!(self.state, LinkState::Subscribing | LinkState::Ready) {
            return;
        }

        let value = match result {
            Ok(value) => value,
            Err(e) => {
                debug!("{:?} read failed: {}", kind, e);
                return;
            }
        };
        if value.is_empty() {
            return;
        }
        if !self.polling.is_fresh_read(&value) {
            trace!("{:?} read unchanged, skipping", kind);
            return;
        }
        self.ingest(link, &value);
    }

    fn on_link_lost(&mut self, link: LinkId) {
        match self.state {
            LinkState::Connecting => {
                self.timers.cancel(TimerKind::ConnectTimeout);
                self.connect_failed(LinkError::Transient("link dropped while connecting".into()));
            }
            _ => {
                warn!("{} lost", link);
                self.close_session("Connection lost");
            }
        }
    }

    /// Fragment → message → event pipeline shared by notifications and reads
    fn ingest(&mut self, link: LinkId, bytes: &[u8]) {
        let now = now();
        if self.reassembly.expire_if_idle(now) {
            self.duplicates.reset();
        }

        let message = match self.reassembly.on_fragment(bytes, now) {
            Fragment::Complete(message) => {
                self.timers.cancel(TimerKind::FragmentIdle);
                message
            }
            Fragment::Pending => {
                let idle = self.reassembly.idle_timeout();
                self.timers
                    .schedule(TimerKind::FragmentIdle, idle, self.generation);
                return;
            }
            Fragment::Discarded => {
                // A dropped partial message may have carried a repeat
                self.timers.cancel(TimerKind::FragmentIdle);
                self.duplicates.reset();
                return;
            }
            Fragment::Idle => {
                self.timers.cancel(TimerKind::FragmentIdle);
                return;
            }
        };

        let event = match codec::decode(&message) {
            Ok(event) => event,
            Err(e) => {
                debug!("Dropping message {:?}: {}", message, e);
                return;
            }
        };

        let fresh = self.duplicates.admit(&event, now);
        if self.handshake.on_inbound_event(&mut self.timers) && self.state == LinkState::Subscribing
        {
            self.enter_ready(link);
        }

        if fresh {
            debug!("Event received: {}", message);
            let _ = self.events.send(AppEvent::EventReceived {
                raw: message,
                event,
            });
        } else {
            debug!("Suppressed repeat of {:?}", event.command_key());
        }
    }

    // Timers

    fn on_timer(&mut self, fired: TimerFired) {
        if !self.timers.accept(&fired, self.generation) {
            return;
        }
        trace!("Timer {:?} fired in {:?}", fired.kind, self.state);

        match fired.kind {
            TimerKind::ConnectTimeout => {
                if self.state == LinkState::Connecting {
                    warn!("Connection attempt timed out");
                    self.connect_failed(LinkError::Timeout("connection"));
                }
            }
            TimerKind::ConnectRetry => {
                if self.state == LinkState::Failed {
                    info!(
                        "Retrying connection ({}/{})",
                        self.connect_retries, self.config.timings.max_connect_retries
                    );
                    self.attempt_connect();
                }
            }
            TimerKind::DescriptorWriteTimeout
            | TimerKind::DescriptorRetry
            | TimerKind::VerificationSettle
            | TimerKind::Probe
            | TimerKind::Verification => {
                let Some(link) = self.link else { return };
                if self.state != LinkState::Subscribing {
                    return;
                }
                let mut ctx =
                    link_context(self.radio.as_ref(), &mut self.timers, &self.config, link);
                let outcome = self.handshake.on_timer(&mut ctx, fired.kind);
                self.after_handshake(outcome);
            }
            TimerKind::FragmentIdle => {
                if !self.reassembly.is_empty() {
                    debug!("Discarding incomplete message after idle timeout");
                }
                self.reassembly.clear();
                self.duplicates.reset();
            }
            TimerKind::PollTick | TimerKind::PollRetry => {
                let Some(link) = self.link else { return };
                if self.state != LinkState::Ready {
                    return;
                }
                let mut ctx =
                    link_context(self.radio.as_ref(), &mut self.timers, &self.config, link);
                if fired.kind == TimerKind::PollTick {
                    self.polling.on_tick(&mut ctx, now());
                } else {
                    self.polling.on_retry(&mut ctx);
                }
            }
        }
    }

    // Reporting

    fn set_state(&mut self, state: LinkState) {
        if self.state != state {
            debug!("Link state {:?} -> {:?}", self.state, state);
            self.state = state;
            self.state_tx.send_replace(state);
        }
    }

    /// Emit `ConnectionChanged` unless the application already has this value
    fn report(&mut self, connected: bool) {
        if self.reported == Some(connected) {
            return;
        }
        self.reported = Some(connected);
        info!("Connection changed: {}", connected);
        let _ = self.events.send(AppEvent::ConnectionChanged(connected));
    }

    fn send_log(&self, message: impl Into<String>, severity: MessageSeverity) {
        let _ = self.events.send(AppEvent::LogMessage(StatusMessage {
            message: message.into(),
            severity,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{DeviceEvent, EventKind};
    use crate::infrastructure::bluetooth::radio::fake::{FakeRadio, FakeState, RadioCall, Reply};
    use crate::infrastructure::bluetooth::radio::{Advertisement, RadioEventSink};
    use crate::infrastructure::bluetooth::service::{LinkQueue, LinkService};
    use std::time::Duration;

    const CONFIRM: &[u8] = b"{\"type\":2,\"mainIndex\":1,\"subIndex\":0,\"ts\":100}";

    fn peer() -> PeripheralIdentity {
        PeripheralIdentity::new("A4:C1:38:12:0F:0E")
    }

    async fn wait(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    struct Harness {
        radio: Arc<FakeRadio>,
        sink: RadioEventSink,
        service: LinkService,
        events: mpsc::UnboundedReceiver<AppEvent>,
        seen: Vec<AppEvent>,
    }

    impl Harness {
        fn start(script: impl FnOnce(&mut FakeState)) -> Self {
            let queue = LinkQueue::new();
            let sink = queue.radio_sink();
            let radio = Arc::new(FakeRadio::new(queue.radio_sink()));
            radio.script(script);
            let (event_tx, events) = mpsc::unbounded_channel();
            let service = LinkService::spawn(LinkConfig::default(), radio.clone(), queue, event_tx);
            Self {
                radio,
                sink,
                service,
                events,
                seen: Vec::new(),
            }
        }

        async fn connect(&mut self) {
            self.service.connect(peer()).unwrap();
            wait(10).await;
        }

        /// Connect and verify the subscription with one notified event
        async fn connect_ready(&mut self) {
            self.connect().await;
            assert_eq!(self.service.state(), LinkState::Subscribing);
            self.radio.notify(CONFIRM);
            wait(10).await;
            assert!(self.service.is_connected());
        }

        fn collect(&mut self) -> &[AppEvent] {
            while let Ok(event) = self.events.try_recv() {
                self.seen.push(event);
            }
            &self.seen
        }

        fn connection_changes(&mut self) -> Vec<bool> {
            self.collect()
                .iter()
                .filter_map(|e| match e {
                    AppEvent::ConnectionChanged(connected) => Some(*connected),
                    _ => None,
                })
                .collect()
        }

        fn received(&mut self) -> Vec<DeviceEvent> {
            self.collect()
                .iter()
                .filter_map(|e| match e {
                    AppEvent::EventReceived { event, .. } => Some(*event),
                    _ => None,
                })
                .collect()
        }

        fn errors(&mut self) -> Vec<String> {
            self.collect()
                .iter()
                .filter_map(|e| match e {
                    AppEvent::LogMessage(m) if m.severity == MessageSeverity::Error => {
                        Some(m.message.clone())
                    }
                    _ => None,
                })
                .collect()
        }

        fn connects(&self) -> usize {
            self.radio.count(|c| matches!(c, RadioCall::Connect(_)))
        }

        fn descriptor_writes(&self) -> usize {
            self.radio.count(|c| matches!(c, RadioCall::WriteDescriptor(_)))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fragmented_event_delivered_once() {
        let mut h = Harness::start(|_| {});
        h.connect().await;
        assert!(!h.service.is_connected());
        assert!(h.connection_changes().is_empty());

        h.radio.notify(b"{\"type\":2,");
        wait(10).await;
        h.radio.notify(b"\"mainIndex\":1,\"subIndex\":0,\"ts\":100}");
        wait(10).await;

        assert_eq!(
            h.received(),
            vec![DeviceEvent::new(EventKind::Confirm, 1, 0, 100)]
        );
        assert_eq!(h.connection_changes(), vec![true]);
        assert!(h.service.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_raw_text_is_forwarded_trimmed() {
        let mut h = Harness::start(|_| {});
        h.connect().await;
        h.radio.notify(b"{\"type\":0,\"mainIndex\":3}\r\n");
        wait(10).await;

        let raw: Vec<String> = h
            .collect()
            .iter()
            .filter_map(|e| match e {
                AppEvent::EventReceived { raw, .. } => Some(raw.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(raw, vec!["{\"type\":0,\"mainIndex\":3}".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_command_suppressed_within_window() {
        let mut h = Harness::start(|_| {});
        h.connect_ready().await;

        wait(500).await;
        h.radio.notify(CONFIRM);
        wait(10).await;
        assert_eq!(h.received().len(), 1);

        wait(2000).await;
        h.radio.notify(CONFIRM);
        wait(10).await;
        assert_eq!(h.received().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_commands_pass_close_together() {
        let mut h = Harness::start(|_| {});
        h.connect_ready().await;
        h.radio.notify(b"{\"type\":3,\"mainIndex\":1,\"subIndex\":0,\"ts\":101}");
        wait(10).await;

        let kinds: Vec<EventKind> = h.received().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::Confirm, EventKind::Cancel]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_messages_are_dropped() {
        let mut h = Harness::start(|_| {});
        h.connect_ready().await;

        h.radio.notify(b"{\"type\":9,\"mainIndex\":1}");
        wait(10).await;
        h.radio.notify(b"{not json}");
        wait(10).await;

        assert_eq!(h.received().len(), 1);
        assert!(h.service.is_connected());
        assert!(h.errors().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_incomplete_fragment_expires() {
        let mut h = Harness::start(|_| {});
        h.connect_ready().await;

        h.radio.notify(b"{\"type\":1,");
        wait(200).await;
        // Would complete the first half if it had been kept
        h.radio.notify(b"\"mainIndex\":2}");
        wait(200).await;
        h.radio.notify(b"{\"type\":1,\"mainIndex\":2}");
        wait(10).await;

        let events = h.received();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], DeviceEvent::new(EventKind::SubRotate, 2, 0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_discard_resets_duplicate_filter() {
        let mut h = Harness::start(|_| {});
        h.connect_ready().await;

        h.radio.notify(b"{\"type\":1,");
        wait(150).await;
        // Still inside the repeat window of the first CONFIRM
        h.radio.notify(CONFIRM);
        wait(10).await;

        let kinds: Vec<EventKind> = h.received().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::Confirm, EventKind::Confirm]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_discard_resets_duplicate_filter() {
        let mut h = Harness::start(|_| {});
        h.connect_ready().await;

        let noise = vec![b'x'; 512];
        for _ in 0..9 {
            h.radio.notify(&noise);
        }
        wait(10).await;
        h.radio.notify(CONFIRM);
        wait(10).await;

        let kinds: Vec<EventKind> = h.received().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::Confirm, EventKind::Confirm]);
        assert!(h.service.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_subscription_gives_up_without_ready() {
        let mut h = Harness::start(|_| {});
        h.connect().await;
        wait(20_000).await;

        assert_eq!(h.descriptor_writes(), 3);
        assert_eq!(
            h.radio
                .count(|c| matches!(c, RadioCall::Read(_, ReadKind::Probe))),
            9
        );
        assert_eq!(h.connection_changes(), vec![false]);
        assert_eq!(h.service.state(), LinkState::Idle);
        assert_eq!(h.errors().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_read_verifies_subscription() {
        let mut h = Harness::start(|s| s.read_value = Some(CONFIRM.to_vec()));
        h.connect().await;
        assert_eq!(h.service.state(), LinkState::Subscribing);

        wait(600).await;
        assert!(h.service.is_connected());
        assert_eq!(h.connection_changes(), vec![true]);

        // Polling keeps reading the same buffered value
        wait(2000).await;
        assert!(h.radio.count(|c| matches!(c, RadioCall::Read(_, ReadKind::Poll))) > 10);
        assert_eq!(h.received().len(), 1);
        assert_eq!(h.descriptor_writes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_delivers_changed_reads() {
        let mut h = Harness::start(|_| {});
        h.connect_ready().await;

        h.radio.script(|s| {
            s.read_value = Some(b"{\"type\":4,\"mainIndex\":0,\"subIndex\":0,\"ts\":7}".to_vec())
        });
        wait(200).await;
        wait(500).await;
        h.radio.script(|s| {
            s.read_value = Some(b"{\"type\":5,\"mainIndex\":0,\"subIndex\":0,\"ts\":9}".to_vec())
        });
        wait(200).await;

        let kinds: Vec<EventKind> = h.received().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::Confirm,
                EventKind::AssistPress,
                EventKind::AssistRelease
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_retries_rejected_trigger() {
        let mut h = Harness::start(|_| {});
        h.connect_ready().await;
        let before = h.radio.count(|c| matches!(c, RadioCall::WriteCharacteristic(_)));

        h.radio.script(|s| s.write_replies.extend([Reply::Reject; 2]));
        // Tick at +50, retry 25 ms later, next tick at +100
        wait(110).await;
        let after = h.radio.count(|c| matches!(c, RadioCall::WriteCharacteristic(_)));
        assert!(after - before >= 3);
        assert!(h.service.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_are_bounded() {
        let mut h = Harness::start(|s| s.connect_replies.extend([Reply::Nack; 10]));
        h.connect().await;
        wait(10_000).await;

        assert_eq!(h.connects(), 4);
        assert_eq!(h.connection_changes(), vec![false]);
        assert_eq!(h.service.state(), LinkState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_connect_times_out_and_retries() {
        let mut h = Harness::start(|s| s.connect_replies.extend([Reply::Silent; 10]));
        h.connect().await;
        assert_eq!(h.service.state(), LinkState::Connecting);

        wait(5_500).await;
        assert_eq!(h.service.state(), LinkState::Failed);
        assert_eq!(h.connects(), 1);

        wait(30_000).await;
        assert_eq!(h.connects(), 4);
        assert_eq!(h.connection_changes(), vec![false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_recover() {
        let mut h = Harness::start(|s| s.connect_replies.extend([Reply::Nack, Reply::Nack]));
        h.connect().await;
        wait(3_000).await;
        assert_eq!(h.connects(), 3);
        assert_eq!(h.service.state(), LinkState::Subscribing);

        h.radio.notify(CONFIRM);
        wait(10).await;
        assert_eq!(h.connection_changes(), vec![true]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_failure_uses_connect_retries() {
        let mut h = Harness::start(|s| s.discovery_reply = Reply::Nack);
        h.connect().await;
        wait(10_000).await;

        assert_eq!(h.connects(), 4);
        assert_eq!(h.connection_changes(), vec![false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_characteristic_is_incompatible() {
        let mut h = Harness::start(|s| s.has_characteristic = false);
        h.connect().await;
        wait(10_000).await;

        assert_eq!(h.connects(), 1);
        assert_eq!(h.connection_changes(), vec![false]);
        assert_eq!(h.service.state(), LinkState::Idle);
        let errors = h.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("Incompatible peripheral"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_characteristic_without_notify_is_incompatible() {
        let mut h = Harness::start(|s| s.notify_property = false);
        h.connect().await;
        wait(10_000).await;

        assert_eq!(h.connects(), 1);
        assert_eq!(h.descriptor_writes(), 0);
        assert!(h.errors()[0].contains("notifications"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_denied_is_not_retried() {
        let mut h = Harness::start(|s| s.permission_denied = true);
        h.connect().await;
        wait(10_000).await;

        assert_eq!(h.connects(), 1);
        assert_eq!(h.connection_changes(), vec![false]);
        assert!(h.errors()[0].contains("Permission denied"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_powered_off_radio_fails_immediately() {
        let mut h = Harness::start(|s| s.powered = false);
        h.connect().await;

        assert_eq!(h.connects(), 0);
        assert_eq!(h.connection_changes(), vec![false]);
        assert_eq!(h.service.state(), LinkState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_disconnect_reports_once() {
        let mut h = Harness::start(|_| {});
        h.connect_ready().await;

        h.radio.drop_link();
        wait(10).await;
        assert_eq!(h.connection_changes(), vec![true, false]);
        assert_eq!(h.service.state(), LinkState::Idle);

        // No automatic reconnect
        wait(10_000).await;
        assert_eq!(h.connects(), 1);
        assert_eq!(h.connection_changes(), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_radio_traffic_after_disconnect() {
        let mut h = Harness::start(|_| {});
        h.connect_ready().await;
        wait(200).await;
        assert!(h.radio.count(|c| matches!(c, RadioCall::Read(_, ReadKind::Poll))) > 0);

        h.service.disconnect().unwrap();
        wait(10).await;
        let before = h.radio.calls().len();

        wait(5_000).await;
        assert_eq!(h.radio.calls().len(), before);
        assert_eq!(h.service.state(), LinkState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_radio_traffic_after_peer_drop() {
        let mut h = Harness::start(|_| {});
        h.connect_ready().await;
        wait(200).await;

        h.radio.drop_link();
        wait(10).await;
        let before = h.radio.calls().len();

        wait(5_000).await;
        assert_eq!(h.radio.calls().len(), before);
        assert_eq!(h.connection_changes(), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_discards_partial_message() {
        let mut h = Harness::start(|_| {});
        h.connect_ready().await;
        h.radio.notify(b"{\"type\":2,");
        wait(10).await;

        h.service.disconnect().unwrap();
        wait(10).await;
        assert_eq!(h.connection_changes(), vec![true, false]);
        assert!(h.radio.calls().iter().any(|c| matches!(c, RadioCall::Close(_))));

        h.connect().await;
        h.radio.notify(b"\"mainIndex\":1,\"subIndex\":0,\"ts\":100}");
        wait(10).await;
        assert_eq!(h.received().len(), 1);
        assert_eq!(h.service.state(), LinkState::Subscribing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_resets_duplicate_filter() {
        let mut h = Harness::start(|_| {});
        h.connect_ready().await;
        h.service.disconnect().unwrap();
        wait(10).await;

        h.connect().await;
        h.radio.notify(CONFIRM);
        wait(10).await;

        assert_eq!(h.received().len(), 2);
        assert_eq!(h.connection_changes(), vec![true, false, true]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_from_old_link_are_dropped() {
        let mut h = Harness::start(|_| {});
        h.connect_ready().await;
        let old = h.radio.current_link().unwrap();

        h.service.disconnect().unwrap();
        wait(10).await;
        h.connect().await;
        let new = h.radio.current_link().unwrap();
        assert_ne!(old, new);

        h.sink.send(RadioEvent::Notification {
            link: old,
            value: b"{\"type\":0,\"mainIndex\":3}".to_vec(),
        });
        h.sink.send(RadioEvent::Disconnected { link: old });
        wait(10).await;

        assert_eq!(h.received().len(), 1);
        assert_eq!(h.service.state(), LinkState::Subscribing);
        assert_eq!(h.connection_changes(), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_replaces_existing_link() {
        let mut h = Harness::start(|_| {});
        h.connect_ready().await;
        let old = h.radio.current_link().unwrap();

        h.connect().await;
        assert!(h.radio.calls().contains(&RadioCall::Close(old)));
        assert_eq!(h.connection_changes(), vec![true, false]);
        assert_eq!(h.service.state(), LinkState::Subscribing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_reports_matching_devices() {
        let mut h = Harness::start(|_| {});
        h.service.start_scan().unwrap();
        wait(10).await;

        h.radio.advertise(Advertisement {
            identity: peer(),
            local_name: Some("Engelsiz Yaşam Asistanı".into()),
            service_uuids: Vec::new(),
            rssi: Some(-48),
        });
        h.radio.advertise(Advertisement {
            identity: PeripheralIdentity::new("11:22:33:44:55:66"),
            local_name: Some("Keyboard".into()),
            service_uuids: Vec::new(),
            rssi: None,
        });
        wait(10).await;

        let found: Vec<PeripheralIdentity> = h
            .collect()
            .iter()
            .filter_map(|e| match e {
                AppEvent::DeviceFound(device) => Some(device.identity.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(found, vec![peer()]);
        assert!(h.radio.calls().contains(&RadioCall::StartScan));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_link() {
        let mut h = Harness::start(|_| {});
        h.connect_ready().await;
        let link = h.radio.current_link().unwrap();

        let Harness { radio, service, .. } = h;
        service.shutdown().await.unwrap();
        assert!(radio.calls().contains(&RadioCall::Close(link)));
    }
}
