//! WinRT radio backend
//!
//! Implements [`RadioStack`] on the Windows Bluetooth LE APIs. Each request
//! is started on the tokio runtime and its outcome is posted back through
//! the [`RadioEventSink`]. Peripherals are addressed by their 48-bit
//! Bluetooth address.

use crate::domain::error::LinkError;
use crate::domain::models::PeripheralIdentity;
use crate::infrastructure::bluetooth::protocol::{self, ENABLE_NOTIFICATION_VALUE};
use crate::infrastructure::bluetooth::radio::{
    Advertisement, CharacteristicProperties, CharacteristicRef, LinkId, RadioEvent,
    RadioEventSink, RadioStack, ReadKind,
};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use windows::core::GUID;
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEAdvertisementWatcherStoppedEventArgs, BluetoothLEScanningMode,
};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattCharacteristicProperties,
    GattClientCharacteristicConfigurationDescriptorValue, GattCommunicationStatus, GattSession,
    GattValueChangedEventArgs,
};
use windows::Devices::Bluetooth::{
    BluetoothAdapter, BluetoothCacheMode, BluetoothConnectionStatus, BluetoothError,
    BluetoothLEDevice,
};
use windows::Devices::Radios::{Radio, RadioState};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter, IBuffer};
use windows::Win32::Foundation::E_ACCESSDENIED;

// User dismissed the pairing prompt
const ERROR_CANCELLED: &str = "800704C7";

fn to_guid(uuid: Uuid) -> GUID {
    GUID::from_u128(uuid.as_u128())
}

fn to_uuid(guid: GUID) -> Uuid {
    Uuid::from_fields(guid.data1, guid.data2, guid.data3, &guid.data4)
}

fn buffer_bytes(buffer: &IBuffer) -> windows::core::Result<Vec<u8>> {
    let reader = DataReader::FromBuffer(buffer)?;
    let mut bytes = vec![0u8; reader.UnconsumedBufferLength()? as usize];
    reader.ReadBytes(&mut bytes)?;
    Ok(bytes)
}

fn check(status: GattCommunicationStatus, what: &str) -> Result<()> {
    if status == GattCommunicationStatus::Success {
        return Ok(());
    }
    let error = if status == GattCommunicationStatus::AccessDenied {
        LinkError::PermissionDenied(format!("{} was denied", what))
    } else {
        LinkError::Transient(format!("{} returned {:?}", what, status))
    };
    Err(error.into())
}

/// Collapse a backend failure into the link error taxonomy.
fn to_link_error(error: anyhow::Error) -> LinkError {
    let error = match error.downcast::<LinkError>() {
        Ok(link_error) => return link_error,
        Err(error) => error,
    };
    if let Some(win) = error.downcast_ref::<windows::core::Error>() {
        if win.code() == E_ACCESSDENIED {
            return LinkError::PermissionDenied(win.to_string());
        }
    }
    let text = format!("{:?}", error);
    if text.contains(ERROR_CANCELLED) {
        warn!("Pairing was cancelled; accept the pairing dialog when it appears");
    }
    LinkError::Transient(error.to_string())
}

struct DiscoveredCharacteristic {
    service: Uuid,
    uuid: Uuid,
    properties: CharacteristicProperties,
    handle: GattCharacteristic,
}

#[derive(Default)]
struct LinkEntry {
    device: Option<BluetoothLEDevice>,
    session: Option<GattSession>,
    status_token: Option<i64>,
    characteristics: Vec<DiscoveredCharacteristic>,
    value_handler: Option<(GattCharacteristic, i64)>,
}

impl LinkEntry {
    fn release(self) {
        if let Some((characteristic, token)) = self.value_handler {
            let _ = characteristic.RemoveValueChanged(token);
        }
        if let Some(session) = self.session {
            let _ = session.Close();
        }
        if let Some(device) = self.device {
            if let Some(token) = self.status_token {
                let _ = device.RemoveConnectionStatusChanged(token);
            }
            let _ = device.Close();
        }
    }
}

type LinkTable = Arc<Mutex<HashMap<LinkId, LinkEntry>>>;

fn lock(links: &LinkTable) -> MutexGuard<'_, HashMap<LinkId, LinkEntry>> {
    links.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct WinRtRadio {
    sink: RadioEventSink,
    runtime: Handle,
    radio: Option<Radio>,
    watcher: Mutex<Option<BluetoothLEAdvertisementWatcher>>,
    links: LinkTable,
}

impl WinRtRadio {
    /// Look up the default adapter. Must be called inside a tokio runtime.
    pub async fn new(sink: RadioEventSink) -> Result<Self> {
        let radio = match BluetoothAdapter::GetDefaultAsync()?.await {
            Ok(adapter) => {
                info!(
                    "Using Bluetooth adapter {:#X}",
                    adapter.BluetoothAddress().unwrap_or_default()
                );
                adapter.GetRadioAsync()?.await.ok()
            }
            Err(e) => {
                warn!("No Bluetooth adapter found: {}", e);
                None
            }
        };

        Ok(Self {
            sink,
            runtime: Handle::current(),
            radio,
            watcher: Mutex::new(None),
            links: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn device(&self, link: LinkId) -> Result<BluetoothLEDevice, LinkError> {
        lock(&self.links)
            .get(&link)
            .and_then(|entry| entry.device.clone())
            .ok_or_else(|| LinkError::Transient(format!("{} is not open", link)))
    }

    fn gatt_characteristic(
        &self,
        characteristic: &CharacteristicRef,
    ) -> Result<GattCharacteristic, LinkError> {
        lock(&self.links)
            .get(&characteristic.link)
            .and_then(|entry| {
                entry.characteristics.iter().find(|c| {
                    c.service == characteristic.service && c.uuid == characteristic.uuid
                })
            })
            .map(|c| c.handle.clone())
            .ok_or_else(|| LinkError::Transient("characteristic no longer available".into()))
    }

    fn start_watcher(&self) -> Result<BluetoothLEAdvertisementWatcher> {
        let watcher = BluetoothLEAdvertisementWatcher::new()?;
        watcher.SetScanningMode(BluetoothLEScanningMode::Active)?;

        let sink = self.sink.clone();
        let received = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let adv = args.Advertisement()?;
                    let guids = adv.ServiceUuids()?;
                    let mut service_uuids = Vec::new();
                    for i in 0..guids.Size()? {
                        service_uuids.push(to_uuid(guids.GetAt(i)?));
                    }
                    let name = adv.LocalName()?.to_string();

                    sink.send(RadioEvent::Advertisement(Advertisement {
                        identity: PeripheralIdentity::from_bluetooth_address(
                            args.BluetoothAddress()?,
                        ),
                        local_name: (!name.is_empty()).then_some(name),
                        service_uuids,
                        rssi: args.RawSignalStrengthInDBm().ok(),
                    }));
                }
                Ok(())
            },
        );
        watcher.Received(&received)?;

        let sink = self.sink.clone();
        let stopped = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementWatcherStoppedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let error = args.Error()?;
                    if error != BluetoothError::Success {
                        sink.send(RadioEvent::ScanFailed(format!("{:?}", error)));
                    }
                }
                Ok(())
            },
        );
        watcher.Stopped(&stopped)?;

        watcher.Start()?;
        Ok(watcher)
    }
}

async fn open_device(
    link: LinkId,
    address: u64,
    sink: RadioEventSink,
) -> Result<(BluetoothLEDevice, Option<GattSession>, i64)> {
    let device = BluetoothLEDevice::FromBluetoothAddressAsync(address)?.await?;
    info!("Device opened: {:?}", device.Name()?);

    // Keeps Windows from dropping the link between GATT requests
    let session = match GattSession::FromDeviceIdAsync(&device.BluetoothDeviceId()?)?.await {
        Ok(session) => {
            session.SetMaintainConnection(true)?;
            Some(session)
        }
        Err(e) => {
            warn!("Failed to create GattSession, continuing anyway: {}", e);
            None
        }
    };

    let handler = TypedEventHandler::new(move |dev: windows::core::Ref<BluetoothLEDevice>, _| {
        if let Some(dev) = dev.as_ref() {
            if dev.ConnectionStatus()? == BluetoothConnectionStatus::Disconnected {
                sink.send(RadioEvent::Disconnected { link });
            }
        }
        Ok(())
    });
    let token = device.ConnectionStatusChanged(&handler)?;

    Ok((device, session, token))
}

async fn discover(device: BluetoothLEDevice) -> Result<Vec<DiscoveredCharacteristic>> {
    let services = device
        .GetGattServicesWithCacheModeAsync(BluetoothCacheMode::Uncached)?
        .await?;
    check(services.Status()?, "service discovery")?;

    let services = services.Services()?;
    let mut discovered = Vec::new();
    for i in 0..services.Size()? {
        let service = services.GetAt(i)?;
        let service_uuid = to_uuid(service.Uuid()?);

        let result = service
            .GetCharacteristicsWithCacheModeAsync(BluetoothCacheMode::Uncached)?
            .await?;
        if result.Status()? != GattCommunicationStatus::Success {
            debug!("Skipping service {}: {:?}", service_uuid, result.Status()?);
            continue;
        }

        let characteristics = result.Characteristics()?;
        for j in 0..characteristics.Size()? {
            let handle = characteristics.GetAt(j)?;
            let flags = handle.CharacteristicProperties()?;
            let has = |flag: GattCharacteristicProperties| flags.0 & flag.0 != 0;
            discovered.push(DiscoveredCharacteristic {
                service: service_uuid,
                uuid: to_uuid(handle.Uuid()?),
                properties: CharacteristicProperties {
                    read: has(GattCharacteristicProperties::Read),
                    write: has(GattCharacteristicProperties::Write)
                        || has(GattCharacteristicProperties::WriteWithoutResponse),
                    notify: has(GattCharacteristicProperties::Notify),
                },
                handle,
            });
        }
    }

    info!("Discovered {} characteristics", discovered.len());
    Ok(discovered)
}

async fn write_cccd(
    characteristic: GattCharacteristic,
    value: GattClientCharacteristicConfigurationDescriptorValue,
) -> Result<()> {
    let status = characteristic
        .WriteClientCharacteristicConfigurationDescriptorAsync(value)?
        .await?;
    check(status, "descriptor write")
}

async fn write_value(characteristic: GattCharacteristic, value: Vec<u8>) -> Result<()> {
    let writer = DataWriter::new()?;
    writer.WriteBytes(&value)?;
    let buffer = writer.DetachBuffer()?;
    let status = characteristic.WriteValueAsync(&buffer)?.await?;
    check(status, "characteristic write")
}

async fn read_value(characteristic: GattCharacteristic) -> Result<Vec<u8>> {
    let result = characteristic
        .ReadValueWithCacheModeAsync(BluetoothCacheMode::Uncached)?
        .await?;
    check(result.Status()?, "characteristic read")?;
    Ok(buffer_bytes(&result.Value()?)?)
}

impl RadioStack for WinRtRadio {
    fn is_powered(&self) -> bool {
        self.radio
            .as_ref()
            .and_then(|radio| radio.State().ok())
            .is_some_and(|state| state == RadioState::On)
    }

    fn start_scan(&self, service: Uuid) -> Result<(), LinkError> {
        debug!("Starting advertisement watcher (service hint {})", service);
        let watcher = self.start_watcher().map_err(to_link_error)?;
        let previous = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(watcher);
        if let Some(previous) = previous {
            let _ = previous.Stop();
        }
        Ok(())
    }

    fn stop_scan(&self) {
        let watcher = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(watcher) = watcher {
            let _ = watcher.Stop();
        }
    }

    fn connect(&self, link: LinkId, identity: &PeripheralIdentity) -> Result<(), LinkError> {
        let address = identity.bluetooth_address().ok_or_else(|| {
            LinkError::IncompatiblePeripheral(format!("{} is not a Bluetooth address", identity))
        })?;
        lock(&self.links).insert(link, LinkEntry::default());

        let links = self.links.clone();
        let sink = self.sink.clone();
        self.runtime.spawn(async move {
            match open_device(link, address, sink.clone()).await {
                Ok((device, session, token)) => {
                    let mut table = lock(&links);
                    let Some(entry) = table.get_mut(&link) else {
                        // Closed while the device was being opened
                        drop(table);
                        LinkEntry {
                            device: Some(device),
                            session,
                            status_token: Some(token),
                            ..Default::default()
                        }
                        .release();
                        return;
                    };
                    entry.device = Some(device);
                    entry.session = session;
                    entry.status_token = Some(token);
                    drop(table);
                    sink.send(RadioEvent::Connected { link });
                }
                Err(e) => sink.send(RadioEvent::ConnectFailed {
                    link,
                    error: to_link_error(e),
                }),
            }
        });
        Ok(())
    }

    fn close(&self, link: LinkId) {
        let entry = lock(&self.links).remove(&link);
        if let Some(entry) = entry {
            debug!("Releasing {}", link);
            entry.release();
        }
    }

    fn request_mtu(&self, link: LinkId, mtu: u16) -> Result<(), LinkError> {
        // Windows negotiates the MTU itself; report what it settled on
        let negotiated = lock(&self.links)
            .get(&link)
            .and_then(|entry| entry.session.as_ref())
            .and_then(|session| session.MaxPduSize().ok());
        if let Some(negotiated) = negotiated {
            debug!("Requested MTU {}, negotiated {}", mtu, negotiated);
            self.sink.send(RadioEvent::MtuChanged {
                link,
                mtu: negotiated,
            });
        }
        Ok(())
    }

    fn discover_services(&self, link: LinkId) -> Result<(), LinkError> {
        let device = self.device(link)?;
        let links = self.links.clone();
        let sink = self.sink.clone();
        self.runtime.spawn(async move {
            let result = match discover(device).await {
                Ok(characteristics) => {
                    if let Some(entry) = lock(&links).get_mut(&link) {
                        entry.characteristics = characteristics;
                    }
                    Ok(())
                }
                Err(e) => Err(to_link_error(e)),
            };
            sink.send(RadioEvent::ServicesDiscovered { link, result });
        });
        Ok(())
    }

    fn find_characteristic(
        &self,
        link: LinkId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Option<CharacteristicRef> {
        lock(&self.links).get(&link).and_then(|entry| {
            entry
                .characteristics
                .iter()
                .find(|c| c.service == service && c.uuid == characteristic)
                .map(|c| CharacteristicRef {
                    link,
                    service,
                    uuid: characteristic,
                    properties: c.properties,
                })
        })
    }

    fn enable_notifications(&self, characteristic: &CharacteristicRef) -> Result<(), LinkError> {
        let gatt = self.gatt_characteristic(characteristic)?;
        let link = characteristic.link;

        let mut table = lock(&self.links);
        let Some(entry) = table.get_mut(&link) else {
            return Err(LinkError::Transient(format!("{} is not open", link)));
        };
        if entry.value_handler.is_some() {
            return Ok(());
        }

        let sink = self.sink.clone();
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<GattCharacteristic>,
                  args: windows::core::Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let value = buffer_bytes(&args.CharacteristicValue()?)?;
                    sink.send(RadioEvent::Notification { link, value });
                }
                Ok(())
            },
        );
        let token = gatt
            .ValueChanged(&handler)
            .map_err(|e| LinkError::Transient(e.to_string()))?;
        entry.value_handler = Some((gatt, token));
        Ok(())
    }

    fn write_descriptor(
        &self,
        characteristic: &CharacteristicRef,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), LinkError> {
        if descriptor != Uuid::from_u128(protocol::CCCD) {
            return Err(LinkError::IncompatiblePeripheral(format!(
                "descriptor {} cannot be written",
                descriptor
            )));
        }
        let gatt = self.gatt_characteristic(characteristic)?;
        let cccd = if value == ENABLE_NOTIFICATION_VALUE {
            GattClientCharacteristicConfigurationDescriptorValue::Notify
        } else {
            GattClientCharacteristicConfigurationDescriptorValue::None
        };

        let link = characteristic.link;
        let sink = self.sink.clone();
        self.runtime.spawn(async move {
            let result = write_cccd(gatt, cccd).await.map_err(to_link_error);
            sink.send(RadioEvent::DescriptorWritten { link, result });
        });
        Ok(())
    }

    fn write_characteristic(
        &self,
        characteristic: &CharacteristicRef,
        value: &[u8],
    ) -> Result<(), LinkError> {
        let gatt = self.gatt_characteristic(characteristic)?;
        let link = characteristic.link;
        let sink = self.sink.clone();
        let value = value.to_vec();
        self.runtime.spawn(async move {
            let result = write_value(gatt, value).await.map_err(to_link_error);
            sink.send(RadioEvent::CharacteristicWritten { link, result });
        });
        Ok(())
    }

    fn read_characteristic(
        &self,
        characteristic: &CharacteristicRef,
        kind: ReadKind,
    ) -> Result<(), LinkError> {
        let gatt = self.gatt_characteristic(characteristic)?;
        let link = characteristic.link;
        let sink = self.sink.clone();
        self.runtime.spawn(async move {
            let result = read_value(gatt).await.map_err(to_link_error);
            sink.send(RadioEvent::CharacteristicRead { link, kind, result });
        });
        Ok(())
    }
}

impl Drop for WinRtRadio {
    fn drop(&mut self) {
        self.stop_scan();
        let entries: Vec<LinkEntry> = lock(&self.links).drain().map(|(_, e)| e).collect();
        for entry in entries {
            entry.release();
        }
    }
}
