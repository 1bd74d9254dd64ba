//! BLE Scanner Module
//!
//! Matches advertisements reported by the radio against the event remote.
//! An advertisement matches if it lists the event service, or, since some
//! firmware leaves the service out of the advertisement, if its local name
//! is one of the configured device names.

use crate::domain::models::{AppEvent, MessageSeverity, ScannedDevice, StatusMessage};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::radio::{Advertisement, RadioStack};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct BleScanner {
    service: Uuid,
    device_names: Vec<String>,
    scanning: bool,
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl BleScanner {
    pub fn new(
        service: Uuid,
        device_names: Vec<String>,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        Self {
            service,
            device_names,
            scanning: false,
            event_sender,
        }
    }

    /// Start scanning, restarting a scan that is already running.
    pub fn start(&mut self, radio: &dyn RadioStack) {
        if !radio.is_powered() {
            warn!("Cannot scan: Bluetooth is not enabled");
            self.send_log("Bluetooth is not enabled", MessageSeverity::Error);
            return;
        }

        if self.scanning {
            debug!("Restarting running scan");
            radio.stop_scan();
            self.scanning = false;
        }

        info!("Starting BLE scan for service UUID: {}", self.service);
        match radio.start_scan(self.service) {
            Ok(()) => {
                self.scanning = true;
                self.send_log("Scanning for remote...", MessageSeverity::Info);
            }
            Err(e) => {
                warn!("Scan could not be started: {}", e);
                self.send_log(format!("Scan failed: {}", e), MessageSeverity::Error);
            }
        }
    }

    pub fn stop(&mut self, radio: &dyn RadioStack) {
        if self.scanning {
            info!("Stopping BLE scan...");
            radio.stop_scan();
            self.scanning = false;
            self.send_log("Scan stopped.", MessageSeverity::Info);
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    pub fn on_scan_failed(&mut self, reason: &str) {
        warn!("Scan failed: {}", reason);
        self.scanning = false;
        self.send_log(format!("Scan failed: {}", reason), MessageSeverity::Error);
    }

    pub fn matches(&self, advertisement: &Advertisement) -> bool {
        advertisement.service_uuids.contains(&self.service)
            || advertisement
                .local_name
                .as_deref()
                .is_some_and(|name| protocol::is_known_name(name, &self.device_names))
    }

    pub fn on_advertisement(&mut self, advertisement: Advertisement) {
        if !self.scanning || !self.matches(&advertisement) {
            return;
        }

        let name = advertisement
            .local_name
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "Unknown".to_string());
        debug!("Found {} ({})", name, advertisement.identity);

        let _ = self.event_sender.send(AppEvent::DeviceFound(ScannedDevice {
            identity: advertisement.identity,
            name,
            signal_strength: advertisement.rssi,
        }));
    }

    fn send_log(&self, message: impl Into<String>, severity: MessageSeverity) {
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.into(),
            severity,
        }));
    }
}
