use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of control event emitted by the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    MainRotate,
    SubRotate,
    Confirm,
    Cancel,
    AssistPress,
    AssistRelease,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::MainRotate,
        EventKind::SubRotate,
        EventKind::Confirm,
        EventKind::Cancel,
        EventKind::AssistPress,
        EventKind::AssistRelease,
    ];

    /// Numeric code used on the wire
    pub fn code(self) -> i64 {
        match self {
            Self::MainRotate => 0,
            Self::SubRotate => 1,
            Self::Confirm => 2,
            Self::Cancel => 3,
            Self::AssistPress => 4,
            Self::AssistRelease => 5,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }
}

/// A single decoded control event. Immutable once built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceEvent {
    pub kind: EventKind,
    pub main_index: i32,
    pub sub_index: i32,
    /// Peripheral-side timestamp (milliseconds since peripheral boot)
    pub timestamp: i64,
}

impl DeviceEvent {
    pub fn new(kind: EventKind, main_index: i32, sub_index: i32, timestamp: i64) -> Self {
        Self {
            kind,
            main_index,
            sub_index,
            timestamp,
        }
    }

    /// The `(type, mainIndex, subIndex)` triple that identifies a command.
    pub fn command_key(&self) -> (EventKind, i32, i32) {
        (self.kind, self.main_index, self.sub_index)
    }
}

/// Opaque transport address of a peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeripheralIdentity(String);

impl PeripheralIdentity {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Format a 48-bit Bluetooth address as `AA:BB:CC:DD:EE:FF`.
    pub fn from_bluetooth_address(address: u64) -> Self {
        let bytes = address.to_be_bytes();
        let text = bytes[2..]
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":");
        Self(text)
    }

    /// Parse the identity back into a 48-bit address, if it is one.
    pub fn bluetooth_address(&self) -> Option<u64> {
        let parts: Vec<&str> = self.0.split(':').collect();
        if parts.len() != 6 {
            return None;
        }
        parts.iter().try_fold(0u64, |acc, part| {
            if part.len() != 2 {
                return None;
            }
            u8::from_str_radix(part, 16)
                .ok()
                .map(|byte| (acc << 8) | byte as u64)
        })
    }
}

impl fmt::Display for PeripheralIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of the single link owned by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connecting,
    ServiceDiscovery,
    Subscribing,
    Ready,
    Disconnected,
    /// Waiting out the delay before another connection attempt
    Failed,
}

/// Everything the transport reports to the application.
#[derive(Debug, Clone)]
pub enum AppEvent {
    DeviceFound(ScannedDevice),
    EventReceived { raw: String, event: DeviceEvent },
    ConnectionChanged(bool),
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedDevice {
    pub identity: PeripheralIdentity,
    pub name: String,
    pub signal_strength: Option<i16>,
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_codes() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(EventKind::from_code(6), None);
        assert_eq!(EventKind::from_code(-1), None);
    }

    #[test]
    fn test_bluetooth_address_formatting() {
        let identity = PeripheralIdentity::from_bluetooth_address(0x0000_A4C1_3812_0F0E);
        assert_eq!(identity.as_str(), "A4:C1:38:12:0F:0E");
        assert_eq!(identity.bluetooth_address(), Some(0xA4C1_3812_0F0E));
    }

    #[test]
    fn test_bluetooth_address_rejects_other_identities() {
        assert_eq!(PeripheralIdentity::new("not-an-address").bluetooth_address(), None);
        assert_eq!(PeripheralIdentity::new("A4:C1:38:12:0F").bluetooth_address(), None);
        assert_eq!(PeripheralIdentity::new("A4:C1:38:12:0F:ZZ").bluetooth_address(), None);
    }
}
