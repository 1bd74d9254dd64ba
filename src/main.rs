use anyhow::Result;
use ble_event_link::domain::models::{AppEvent, MessageSeverity, PeripheralIdentity};
use ble_event_link::domain::settings::SettingsService;
use ble_event_link::infrastructure::bluetooth::radio::RadioStack;
use ble_event_link::infrastructure::bluetooth::{LinkConfig, LinkQueue, LinkService};
use ble_event_link::infrastructure::logging;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[cfg(windows)]
async fn open_radio(queue: &LinkQueue) -> Result<Arc<dyn RadioStack>> {
    use ble_event_link::infrastructure::bluetooth::winrt::WinRtRadio;
    let radio = WinRtRadio::new(queue.radio_sink()).await?;
    Ok(Arc::new(radio))
}

#[cfg(not(windows))]
async fn open_radio(_queue: &LinkQueue) -> Result<Arc<dyn RadioStack>> {
    anyhow::bail!("No Bluetooth backend is available on this platform")
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut settings = SettingsService::new()?;
    let _logging_guard = logging::init_logger(&settings.get().log_settings)?;
    info!("Starting BLE event link");

    if !settings.path().exists() {
        settings.save()?;
        info!("Wrote default settings to {}", settings.path().display());
    }

    let config = LinkConfig::from_settings(settings.get())?;
    let auto_connect = settings.get().auto_connect;
    let target = settings
        .get()
        .target_address
        .clone()
        .map(PeripheralIdentity::new);

    let queue = LinkQueue::new();
    let radio = open_radio(&queue).await?;
    let (event_tx, mut events) = mpsc::unbounded_channel();
    let service = LinkService::spawn(config, radio, queue, event_tx);
    service.start_scan()?;

    // Peripheral we are currently connecting or connected to
    let mut current: Option<PeripheralIdentity> = None;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted, shutting down");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    AppEvent::DeviceFound(device) => {
                        info!(
                            "Found {} ({}), RSSI {:?}",
                            device.name, device.identity, device.signal_strength
                        );
                        let wanted = target.as_ref().map_or(true, |t| *t == device.identity);
                        if auto_connect && wanted && current.is_none() {
                            service.stop_scan()?;
                            service.connect(device.identity.clone())?;
                            current = Some(device.identity);
                        }
                    }
                    AppEvent::ConnectionChanged(true) => {
                        if let Some(identity) = &current {
                            if let Err(e) = settings.remember_address(identity.as_str()) {
                                warn!("Could not save settings: {}", e);
                            }
                        }
                    }
                    AppEvent::ConnectionChanged(false) => {
                        current = None;
                        if auto_connect {
                            service.start_scan()?;
                        }
                    }
                    AppEvent::EventReceived { raw, event } => {
                        info!(
                            "{:?} main={} sub={} ts={}  {}",
                            event.kind, event.main_index, event.sub_index, event.timestamp, raw
                        );
                    }
                    AppEvent::LogMessage(status) => match status.severity {
                        MessageSeverity::Error => error!("{}", status.message),
                        MessageSeverity::Warning => warn!("{}", status.message),
                        MessageSeverity::Info | MessageSeverity::Success => {
                            info!("{}", status.message)
                        }
                    },
                }
            }
        }
    }

    service.shutdown().await
}
