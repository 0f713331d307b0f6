//! Radio Transport Boundary
//!
//! The capability the mesh session consumes from the platform radio:
//! advertise, scan, connect, and move frames over a connection. Events
//! flow back through an [`EventSink`] instead of callbacks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::peer_registry::PeerAddress;
use crate::error::TransportError;

/// Identifies one live link as seen from the local side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionHandle(pub u64);

/// Identifies an active advertisement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AdvertiseHandle(pub u64);

/// Identifies an active scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScanHandle(pub u64);

/// Asynchronous notifications from the radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A node advertising the mesh service was seen
    Discovered {
        address: PeerAddress,
        name: Option<String>,
    },
    /// A peer connected to our advertisement
    IncomingConnection {
        address: PeerAddress,
        connection: ConnectionHandle,
    },
    /// A frame arrived on a connection
    Received {
        connection: ConnectionHandle,
        bytes: Vec<u8>,
    },
    /// The link closed from the remote side or was lost
    Disconnected { connection: ConnectionHandle },
}

pub type EventSink = mpsc::UnboundedSender<TransportEvent>;

/// Platform radio capability
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Whether a radio is present and enabled
    async fn is_available(&self) -> bool;

    /// Our own address, when the platform exposes it (used for self-filtering)
    fn local_address(&self) -> Option<PeerAddress>;

    /// Begin advertising; incoming connections are reported on `sink`
    async fn advertise(
        &self,
        service: Uuid,
        visible_name: &str,
        sink: EventSink,
    ) -> Result<AdvertiseHandle, TransportError>;

    async fn stop_advertise(&self, handle: AdvertiseHandle) -> Result<(), TransportError>;

    /// Begin scanning for `service`; discoveries are reported on `sink`
    async fn scan(&self, service: Uuid, sink: EventSink) -> Result<ScanHandle, TransportError>;

    async fn stop_scan(&self, handle: ScanHandle) -> Result<(), TransportError>;

    async fn connect(&self, address: &str) -> Result<ConnectionHandle, TransportError>;

    /// Write one frame; returns once the radio has accepted it, not on delivery
    async fn send(&self, connection: ConnectionHandle, bytes: &[u8]) -> Result<(), TransportError>;

    /// Route inbound frames and the eventual disconnect of `connection` to `sink`
    async fn on_receive(&self, connection: ConnectionHandle, sink: EventSink) -> Result<(), TransportError>;

    async fn close(&self, connection: ConnectionHandle) -> Result<(), TransportError>;
}
