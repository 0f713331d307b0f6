//! Bluetooth LE Transport
//!
//! [`Transport`] over the host radio through btleplug. btleplug drives the
//! central role only, so this node scans and dials but cannot itself be
//! advertised as connectable.

use anyhow::Context;
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use dashmap::DashMap;
use futures::StreamExt;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::peer_registry::PeerAddress;
use super::protocol::message_characteristic_uuid;
use super::transport::{
    AdvertiseHandle, ConnectionHandle, EventSink, ScanHandle, Transport, TransportEvent,
};
use crate::error::TransportError;

struct HostRadio {
    // Keeps the platform session alive for the adapter
    _manager: Manager,
    adapter: Adapter,
}

struct BleLink {
    id: PeripheralId,
    address: PeerAddress,
    peripheral: Peripheral,
    characteristic: Characteristic,
    receiver: Option<JoinHandle<()>>,
}

/// Host Bluetooth adapter as a mesh transport
pub struct BleTransport {
    radio: Option<HostRadio>,
    peripherals: Arc<DashMap<PeerAddress, PeripheralId>>,
    scans: Mutex<HashMap<ScanHandle, JoinHandle<()>>>,
    links: Arc<DashMap<ConnectionHandle, BleLink>>,
    next_id: AtomicU64,
}

impl BleTransport {
    /// Bind to the first adapter. A host without one yields a transport
    /// that reports itself unavailable.
    pub async fn new() -> Self {
        let radio = match Self::first_adapter().await {
            Ok(radio) => Some(radio),
            Err(e) => {
                warn!("Bluetooth unavailable: {:#}", e);
                None
            }
        };
        Self::from_radio(radio)
    }

    fn from_radio(radio: Option<HostRadio>) -> Self {
        Self {
            radio,
            peripherals: Arc::new(DashMap::new()),
            scans: Mutex::new(HashMap::new()),
            links: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    async fn first_adapter() -> anyhow::Result<HostRadio> {
        let manager = Manager::new()
            .await
            .context("Failed to create Bluetooth manager")?;

        let adapters = manager
            .adapters()
            .await
            .context("Failed to get Bluetooth adapters")?;

        let adapter = adapters
            .into_iter()
            .next()
            .context("No Bluetooth adapters found")?;

        let adapter_info = adapter
            .adapter_info()
            .await
            .context("Failed to query Bluetooth adapter")?;
        info!("Using Bluetooth adapter: {}", adapter_info);

        Ok(HostRadio {
            _manager: manager,
            adapter,
        })
    }

    fn adapter(&self) -> Result<&Adapter, TransportError> {
        self.radio
            .as_ref()
            .map(|radio| &radio.adapter)
            .ok_or_else(|| TransportError::Unavailable("no Bluetooth adapter".to_string()))
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Stable string form of a platform peripheral id
    fn address_of(id: &PeripheralId) -> PeerAddress {
        format!("{:?}", id)
    }

    fn link_parts(&self, connection: ConnectionHandle) -> Result<(Peripheral, Characteristic), TransportError> {
        let link = self
            .links
            .get(&connection)
            .ok_or(TransportError::ConnectionClosed(connection))?;
        Ok((link.peripheral.clone(), link.characteristic.clone()))
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn is_available(&self) -> bool {
        match self.adapter() {
            Ok(adapter) => adapter.adapter_info().await.is_ok(),
            Err(_) => false,
        }
    }

    fn local_address(&self) -> Option<PeerAddress> {
        None
    }

    async fn advertise(
        &self,
        _service: Uuid,
        visible_name: &str,
        _sink: EventSink,
    ) -> Result<AdvertiseHandle, TransportError> {
        warn!("Cannot advertise {}: peripheral role is not supported on this host", visible_name);
        Err(TransportError::Unavailable("peripheral role unsupported".to_string()))
    }

    async fn stop_advertise(&self, _handle: AdvertiseHandle) -> Result<(), TransportError> {
        Ok(())
    }

    async fn scan(&self, service: Uuid, sink: EventSink) -> Result<ScanHandle, TransportError> {
        let adapter = self.adapter()?.clone();

        let mut events = adapter
            .events()
            .await
            .context("Failed to subscribe to adapter events")?;

        adapter
            .start_scan(ScanFilter {
                services: vec![service],
            })
            .await
            .context("Failed to start BLE scan")?;
        info!("Starting BLE scan for mesh devices");

        let peripherals = Arc::clone(&self.peripherals);
        let links = Arc::clone(&self.links);
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    CentralEvent::DeviceDisconnected(id) => {
                        let dropped: Vec<ConnectionHandle> = links
                            .iter()
                            .filter(|link| link.id == id)
                            .map(|link| *link.key())
                            .collect();
                        for connection in dropped {
                            debug!("Device dropped link {:?}", connection);
                            if sink.send(TransportEvent::Disconnected { connection }).is_err() {
                                return;
                            }
                        }
                        continue;
                    }
                    _ => continue,
                };

                let name = match adapter.peripheral(&id).await {
                    Ok(peripheral) => peripheral
                        .properties()
                        .await
                        .ok()
                        .flatten()
                        .and_then(|properties| properties.local_name),
                    Err(_) => None,
                };

                let address = Self::address_of(&id);
                debug!("Discovered device: {} ({:?})", address, name);
                peripherals.insert(address.clone(), id);

                if sink.send(TransportEvent::Discovered { address, name }).is_err() {
                    break;
                }
            }
            debug!("Scan event stream ended");
        });

        let handle = ScanHandle(self.next_id());
        self.scans.lock().insert(handle, task);
        Ok(handle)
    }

    async fn stop_scan(&self, handle: ScanHandle) -> Result<(), TransportError> {
        if let Some(task) = self.scans.lock().remove(&handle) {
            task.abort();
        }
        self.adapter()?
            .stop_scan()
            .await
            .context("Failed to stop BLE scan")?;
        Ok(())
    }

    async fn connect(&self, address: &str) -> Result<ConnectionHandle, TransportError> {
        let adapter = self.adapter()?;
        let id = self
            .peripherals
            .get(address)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::UnknownPeer(address.to_string()))?;

        let peripheral = adapter
            .peripheral(&id)
            .await
            .context("Peripheral no longer known to adapter")?;

        if !peripheral.is_connected().await.unwrap_or(false) {
            peripheral.connect().await.context("Failed to connect")?;
        }

        peripheral
            .discover_services()
            .await
            .context("Failed to discover services")?;

        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == message_characteristic_uuid())
            .context("Mesh message characteristic not found")?;

        peripheral
            .subscribe(&characteristic)
            .await
            .context("Failed to subscribe to characteristic")?;

        let handle = ConnectionHandle(self.next_id());
        self.links.insert(
            handle,
            BleLink {
                id,
                address: address.to_string(),
                peripheral,
                characteristic,
                receiver: None,
            },
        );

        info!("Peripheral connection setup complete: {}", address);
        Ok(handle)
    }

    async fn send(&self, connection: ConnectionHandle, bytes: &[u8]) -> Result<(), TransportError> {
        let (peripheral, characteristic) = self.link_parts(connection)?;
        peripheral
            .write(&characteristic, bytes, WriteType::WithoutResponse)
            .await
            .context("Failed to write to characteristic")?;
        Ok(())
    }

    async fn on_receive(&self, connection: ConnectionHandle, sink: EventSink) -> Result<(), TransportError> {
        let (peripheral, characteristic) = self.link_parts(connection)?;
        let mut notifications = peripheral
            .notifications()
            .await
            .context("Failed to open notification stream")?;

        let task = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != characteristic.uuid {
                    continue;
                }
                let event = TransportEvent::Received {
                    connection,
                    bytes: notification.value,
                };
                if sink.send(event).is_err() {
                    return;
                }
            }

            info!("Notification stream ended for {:?}", connection);
            let _ = sink.send(TransportEvent::Disconnected { connection });
        });

        match self.links.get_mut(&connection) {
            Some(mut link) => {
                if let Some(previous) = link.receiver.replace(task) {
                    previous.abort();
                }
                Ok(())
            }
            None => {
                task.abort();
                Err(TransportError::ConnectionClosed(connection))
            }
        }
    }

    async fn close(&self, connection: ConnectionHandle) -> Result<(), TransportError> {
        let Some((_, link)) = self.links.remove(&connection) else {
            return Ok(());
        };

        if let Some(receiver) = link.receiver {
            receiver.abort();
        }

        debug!("Disconnecting from {}", link.address);
        link.peripheral
            .disconnect()
            .await
            .context("Failed to disconnect")?;
        Ok(())
    }
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        for (_, task) in self.scans.lock().drain() {
            task.abort();
        }
        for link in self.links.iter() {
            if let Some(receiver) = &link.receiver {
                receiver.abort();
            }
        }
    }
}
