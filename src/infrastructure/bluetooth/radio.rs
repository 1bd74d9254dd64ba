//! Radio stack interface
//!
//! The platform Bluetooth stack is consumed through [`RadioStack`]. Every
//! request is fire-and-continue: the call only reports whether the request
//! was accepted, and the outcome arrives later as a [`RadioEvent`] on the
//! supervisor's queue. Each event carries the [`LinkId`] it belongs to so
//! results from a superseded link can be recognised and dropped.

use crate::domain::error::LinkError;
use crate::domain::models::PeripheralIdentity;
use crate::domain::settings::LinkTimings;
use crate::infrastructure::bluetooth::supervisor::LinkInput;
use crate::infrastructure::bluetooth::timers::{TimerKind, Timers};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// One physical connection attempt. Never reused after teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub notify: bool,
}

/// Resolved handle to the event characteristic of one link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicRef {
    pub link: LinkId,
    pub service: Uuid,
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

/// Why a characteristic read was issued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadKind {
    /// Verification probe after subscribing
    Probe,
    /// Polling fallback cycle
    Poll,
}

#[derive(Debug, Clone)]
pub struct Advertisement {
    pub identity: PeripheralIdentity,
    pub local_name: Option<String>,
    pub service_uuids: Vec<Uuid>,
    pub rssi: Option<i16>,
}

/// Asynchronous results delivered by the radio stack
#[derive(Debug, Clone)]
pub enum RadioEvent {
    Advertisement(Advertisement),
    ScanFailed(String),
    Connected {
        link: LinkId,
    },
    ConnectFailed {
        link: LinkId,
        error: LinkError,
    },
    Disconnected {
        link: LinkId,
    },
    MtuChanged {
        link: LinkId,
        mtu: u16,
    },
    ServicesDiscovered {
        link: LinkId,
        result: Result<(), LinkError>,
    },
    DescriptorWritten {
        link: LinkId,
        result: Result<(), LinkError>,
    },
    CharacteristicWritten {
        link: LinkId,
        result: Result<(), LinkError>,
    },
    CharacteristicRead {
        link: LinkId,
        kind: ReadKind,
        result: Result<Vec<u8>, LinkError>,
    },
    Notification {
        link: LinkId,
        value: Vec<u8>,
    },
}

impl RadioEvent {
    /// The link this event belongs to, if it is link-scoped
    pub fn link(&self) -> Option<LinkId> {
        match self {
            Self::Advertisement(_) | Self::ScanFailed(_) => None,
            Self::Connected { link }
            | Self::ConnectFailed { link, .. }
            | Self::Disconnected { link }
            | Self::MtuChanged { link, .. }
            | Self::ServicesDiscovered { link, .. }
            | Self::DescriptorWritten { link, .. }
            | Self::CharacteristicWritten { link, .. }
            | Self::CharacteristicRead { link, .. }
            | Self::Notification { link, .. } => Some(*link),
        }
    }
}

/// Hands radio callbacks to the supervisor's queue. Cheap to clone and safe
/// to use from platform threads.
#[derive(Clone)]
pub struct RadioEventSink {
    sender: mpsc::UnboundedSender<LinkInput>,
}

impl RadioEventSink {
    pub fn new(sender: mpsc::UnboundedSender<LinkInput>) -> Self {
        Self { sender }
    }

    pub fn send(&self, event: RadioEvent) {
        // The queue only closes when the supervisor has shut down
        let _ = self.sender.send(LinkInput::Radio(event));
    }
}

/// The platform radio stack, as seen by the supervisor.
pub trait RadioStack: Send + Sync {
    /// Whether the adapter exists and is switched on
    fn is_powered(&self) -> bool;

    /// Start reporting advertisements. `service` is a hint for platform-side
    /// filtering; name-only advertisements must still be reported.
    fn start_scan(&self, service: Uuid) -> Result<(), LinkError>;

    fn stop_scan(&self);

    /// Open a link. Answered by `Connected` or `ConnectFailed`.
    fn connect(&self, link: LinkId, identity: &PeripheralIdentity) -> Result<(), LinkError>;

    /// Tear a link down. No further events are expected for it.
    fn close(&self, link: LinkId);

    /// Ask for a larger MTU. Answered by `MtuChanged` if supported.
    fn request_mtu(&self, _link: LinkId, _mtu: u16) -> Result<(), LinkError> {
        Ok(())
    }

    /// Answered by `ServicesDiscovered`.
    fn discover_services(&self, link: LinkId) -> Result<(), LinkError>;

    /// Look up a characteristic on an already discovered link.
    fn find_characteristic(
        &self,
        link: LinkId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Option<CharacteristicRef>;

    /// Register locally for value-changed callbacks.
    fn enable_notifications(&self, characteristic: &CharacteristicRef) -> Result<(), LinkError>;

    /// Answered by `DescriptorWritten`.
    fn write_descriptor(
        &self,
        characteristic: &CharacteristicRef,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), LinkError>;

    /// Answered by `CharacteristicWritten`.
    fn write_characteristic(
        &self,
        characteristic: &CharacteristicRef,
        value: &[u8],
    ) -> Result<(), LinkError>;

    /// Answered by `CharacteristicRead`.
    fn read_characteristic(
        &self,
        characteristic: &CharacteristicRef,
        kind: ReadKind,
    ) -> Result<(), LinkError>;
}

/// The current link as lent to the handshake and polling components for
/// the duration of one input.
pub struct LinkContext<'a> {
    pub radio: &'a dyn RadioStack,
    pub timers: &'a mut Timers,
    pub link: LinkId,
    pub service: Uuid,
    pub characteristic: Uuid,
    pub timings: &'a LinkTimings,
}

impl LinkContext<'_> {
    /// Re-resolve the characteristic from the link; it may have changed.
    pub fn characteristic(&self) -> Option<CharacteristicRef> {
        self.radio
            .find_characteristic(self.link, self.service, self.characteristic)
    }

    pub fn schedule(&mut self, kind: TimerKind, delay: Duration) {
        self.timers.schedule(kind, delay, self.link.0);
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        self.timers.cancel(kind);
    }
}
