//! In-Memory Radio Medium
//!
//! A shared "airspace" connecting [`MemoryRadio`]s inside one process.
//! Advertisements are visible to every scanner of the same service
//! (including the advertiser itself, which real stacks may also report),
//! links are point-to-point and deliver frames in order.

use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, trace};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::peer_registry::PeerAddress;
use super::transport::{
    AdvertiseHandle, ConnectionHandle, EventSink, ScanHandle, Transport, TransportEvent,
};
use crate::error::TransportError;

struct Advertisement {
    handle: AdvertiseHandle,
    service: Uuid,
    name: String,
    sink: EventSink,
}

struct Scanner {
    handle: ScanHandle,
    service: Uuid,
    sink: EventSink,
}

struct Endpoint {
    peer: PeerAddress,
    peer_connection: ConnectionHandle,
    sink: Option<EventSink>,
    // Frames that arrived before a receiver was attached
    pending: Vec<Vec<u8>>,
}

struct RadioState {
    enabled: bool,
    stalled: bool,
    central_only: bool,
    connect_held: bool,
    refusing: bool,
    advertisement: Option<Advertisement>,
    scanner: Option<Scanner>,
    endpoints: HashMap<ConnectionHandle, Endpoint>,
    frames_sent: u64,
    connect_attempts: u64,
}

impl RadioState {
    fn new() -> Self {
        Self {
            enabled: true,
            stalled: false,
            central_only: false,
            connect_held: false,
            refusing: false,
            advertisement: None,
            scanner: None,
            endpoints: HashMap::new(),
            frames_sent: 0,
            connect_attempts: 0,
        }
    }
}

/// Shared medium all in-memory radios attach to
pub struct MemoryMedium {
    radios: DashMap<PeerAddress, Arc<Mutex<RadioState>>>,
    next_id: AtomicU64,
}

impl MemoryMedium {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            radios: DashMap::new(),
            next_id: AtomicU64::new(1),
        })
    }

    /// Attach a radio with the given address (re-attaching returns the same radio)
    pub fn radio(self: &Arc<Self>, address: impl Into<PeerAddress>) -> Arc<MemoryRadio> {
        let address = address.into();
        self.radios
            .entry(address.clone())
            .or_insert_with(|| Arc::new(Mutex::new(RadioState::new())));

        Arc::new(MemoryRadio {
            medium: Arc::clone(self),
            address,
        })
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn state(&self, address: &str) -> Option<Arc<Mutex<RadioState>>> {
        self.radios.get(address).map(|entry| Arc::clone(entry.value()))
    }

    // Clone the table so no shard lock is held while radio locks are taken
    fn all_radios(&self) -> Vec<(PeerAddress, Arc<Mutex<RadioState>>)> {
        self.radios
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }
}

/// One node's radio on a [`MemoryMedium`]
pub struct MemoryRadio {
    medium: Arc<MemoryMedium>,
    address: PeerAddress,
}

impl MemoryRadio {
    pub fn address(&self) -> &str {
        &self.address
    }

    fn state(&self) -> Arc<Mutex<RadioState>> {
        self.medium
            .state(&self.address)
            .expect("radio state is registered when the radio is attached")
    }

    /// Switch the radio on or off. Turning it off drops every link.
    pub fn set_enabled(&self, enabled: bool) {
        let links: Vec<ConnectionHandle> = {
            let state = self.state();
            let mut state = state.lock();
            state.enabled = enabled;
            if enabled {
                Vec::new()
            } else {
                state.advertisement = None;
                state.scanner = None;
                state.endpoints.keys().copied().collect()
            }
        };

        for connection in links {
            self.close_link(connection);
        }
    }

    /// A stalled radio never confirms advertise/scan start or stop
    pub fn set_stalled(&self, stalled: bool) {
        self.state().lock().stalled = stalled;
    }

    /// A central-only radio refuses to advertise, like hosts without a peripheral role
    pub fn set_central_only(&self, central_only: bool) {
        self.state().lock().central_only = central_only;
    }

    /// Outgoing connects wait until released
    pub fn set_connect_held(&self, held: bool) {
        self.state().lock().connect_held = held;
    }

    /// Keep advertising but reject every incoming connection
    pub fn set_refusing(&self, refusing: bool) {
        self.state().lock().refusing = refusing;
    }

    /// Number of frames handed to this radio for transmission
    pub fn frames_sent(&self) -> u64 {
        self.state().lock().frames_sent
    }

    pub fn connect_attempts(&self) -> u64 {
        self.state().lock().connect_attempts
    }

    pub fn link_count(&self) -> usize {
        self.state().lock().endpoints.len()
    }

    pub fn is_advertising(&self) -> bool {
        self.state().lock().advertisement.is_some()
    }

    pub fn is_scanning(&self) -> bool {
        self.state().lock().scanner.is_some()
    }

    /// Handles of every open link on this radio
    pub fn links(&self) -> Vec<ConnectionHandle> {
        let mut links: Vec<_> = self.state().lock().endpoints.keys().copied().collect();
        links.sort();
        links
    }

    fn is_stalled(&self) -> bool {
        self.state().lock().stalled
    }

    async fn stall_if_configured(&self) {
        if self.is_stalled() {
            debug!("Radio {} stalled, operation will not complete", self.address);
            futures::future::pending::<()>().await;
        }
    }

    fn ensure_enabled(&self) -> Result<(), TransportError> {
        if self.state().lock().enabled {
            Ok(())
        } else {
            Err(TransportError::Unavailable(format!("radio {} is off", self.address)))
        }
    }

    // Remove both ends of a link and tell the remote side
    fn close_link(&self, connection: ConnectionHandle) {
        let endpoint = self.state().lock().endpoints.remove(&connection);
        let Some(endpoint) = endpoint else {
            return;
        };

        if let Some(peer_state) = self.medium.state(&endpoint.peer) {
            let remote = peer_state.lock().endpoints.remove(&endpoint.peer_connection);
            if let Some(Endpoint { sink: Some(sink), .. }) = remote {
                let _ = sink.send(TransportEvent::Disconnected {
                    connection: endpoint.peer_connection,
                });
            }
        }
        debug!("Radio {} closed link {:?} to {}", self.address, connection, endpoint.peer);
    }
}

#[async_trait]
impl Transport for MemoryRadio {
    async fn is_available(&self) -> bool {
        self.state().lock().enabled
    }

    fn local_address(&self) -> Option<PeerAddress> {
        Some(self.address.clone())
    }

    async fn advertise(
        &self,
        service: Uuid,
        visible_name: &str,
        sink: EventSink,
    ) -> Result<AdvertiseHandle, TransportError> {
        self.ensure_enabled()?;
        if self.state().lock().central_only {
            return Err(TransportError::Unavailable("peripheral role unsupported".to_string()));
        }
        self.stall_if_configured().await;

        let handle = AdvertiseHandle(self.medium.next_id());
        self.state().lock().advertisement = Some(Advertisement {
            handle,
            service,
            name: visible_name.to_string(),
            sink,
        });

        for (_, radio) in self.medium.all_radios() {
            let radio = radio.lock();
            if let Some(scanner) = radio.scanner.as_ref().filter(|s| s.service == service) {
                let _ = scanner.sink.send(TransportEvent::Discovered {
                    address: self.address.clone(),
                    name: Some(visible_name.to_string()),
                });
            }
        }

        debug!("Radio {} advertising as {}", self.address, visible_name);
        Ok(handle)
    }

    async fn stop_advertise(&self, handle: AdvertiseHandle) -> Result<(), TransportError> {
        self.stall_if_configured().await;

        let state = self.state();
        let mut state = state.lock();
        if state.advertisement.as_ref().map(|a| a.handle) == Some(handle) {
            state.advertisement = None;
        }
        Ok(())
    }

    async fn scan(&self, service: Uuid, sink: EventSink) -> Result<ScanHandle, TransportError> {
        self.ensure_enabled()?;
        self.stall_if_configured().await;

        let handle = ScanHandle(self.medium.next_id());
        self.state().lock().scanner = Some(Scanner {
            handle,
            service,
            sink: sink.clone(),
        });

        // Report everything already on the air
        for (address, radio) in self.medium.all_radios() {
            let radio = radio.lock();
            if let Some(advert) = radio.advertisement.as_ref().filter(|a| a.service == service) {
                let _ = sink.send(TransportEvent::Discovered {
                    address,
                    name: Some(advert.name.clone()),
                });
            }
        }

        debug!("Radio {} scanning", self.address);
        Ok(handle)
    }

    async fn stop_scan(&self, handle: ScanHandle) -> Result<(), TransportError> {
        self.stall_if_configured().await;

        let state = self.state();
        let mut state = state.lock();
        if state.scanner.as_ref().map(|s| s.handle) == Some(handle) {
            state.scanner = None;
        }
        Ok(())
    }

    async fn connect(&self, address: &str) -> Result<ConnectionHandle, TransportError> {
        self.ensure_enabled()?;
        self.state().lock().connect_attempts += 1;

        while self.state().lock().connect_held {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let target = self
            .medium
            .state(address)
            .ok_or_else(|| TransportError::UnknownPeer(address.to_string()))?;

        let local = ConnectionHandle(self.medium.next_id());
        let remote = ConnectionHandle(self.medium.next_id());

        let advert_sink = {
            let mut target = target.lock();
            let sink = match (&target.advertisement, target.enabled && !target.refusing) {
                (Some(advert), true) => advert.sink.clone(),
                _ => {
                    return Err(TransportError::Unavailable(format!(
                        "{address} is not accepting connections"
                    )))
                }
            };
            target.endpoints.insert(
                remote,
                Endpoint {
                    peer: self.address.clone(),
                    peer_connection: local,
                    sink: None,
                    pending: Vec::new(),
                },
            );
            sink
        };

        self.state().lock().endpoints.insert(
            local,
            Endpoint {
                peer: address.to_string(),
                peer_connection: remote,
                sink: None,
                pending: Vec::new(),
            },
        );

        let _ = advert_sink.send(TransportEvent::IncomingConnection {
            address: self.address.clone(),
            connection: remote,
        });

        debug!("Radio {} connected to {} ({:?})", self.address, address, local);
        Ok(local)
    }

    async fn send(&self, connection: ConnectionHandle, bytes: &[u8]) -> Result<(), TransportError> {
        let (peer, peer_connection) = {
            let state = self.state();
            let mut state = state.lock();
            if !state.enabled {
                return Err(TransportError::Unavailable(format!("radio {} is off", self.address)));
            }
            let endpoint = state
                .endpoints
                .get(&connection)
                .ok_or(TransportError::ConnectionClosed(connection))?;
            let route = (endpoint.peer.clone(), endpoint.peer_connection);
            state.frames_sent += 1;
            route
        };

        let peer_state = self
            .medium
            .state(&peer)
            .ok_or(TransportError::ConnectionClosed(connection))?;
        let mut peer_state = peer_state.lock();
        let endpoint = peer_state
            .endpoints
            .get_mut(&peer_connection)
            .ok_or(TransportError::ConnectionClosed(connection))?;

        match &endpoint.sink {
            Some(sink) => {
                let _ = sink.send(TransportEvent::Received {
                    connection: peer_connection,
                    bytes: bytes.to_vec(),
                });
            }
            None => endpoint.pending.push(bytes.to_vec()),
        }

        trace!("Radio {} sent {} bytes to {}", self.address, bytes.len(), peer);
        Ok(())
    }

    async fn on_receive(&self, connection: ConnectionHandle, sink: EventSink) -> Result<(), TransportError> {
        let state = self.state();
        let mut state = state.lock();
        let endpoint = state
            .endpoints
            .get_mut(&connection)
            .ok_or(TransportError::ConnectionClosed(connection))?;

        for bytes in endpoint.pending.drain(..) {
            let _ = sink.send(TransportEvent::Received { connection, bytes });
        }
        endpoint.sink = Some(sink);
        Ok(())
    }

    async fn close(&self, connection: ConnectionHandle) -> Result<(), TransportError> {
        self.close_link(connection);
        Ok(())
    }
}
