//! Emergency Mesh - Offline Bluetooth LE Emergency Messaging
//!
//! One Admin base station and many field Users exchange SOS calls,
//! location reports, alerts and broadcasts over a BLE mesh with no
//! infrastructure.

pub mod bluetooth;
pub mod config;
pub mod error;
pub mod message;

pub use bluetooth::{
    BleTransport, ConnectionState, MemoryMedium, MemoryRadio, MeshSession, NodeIdentity, PeerRecord, SessionState,
    SessionStatus, Transport,
};
pub use config::{Role, SessionConfig};
pub use error::{MeshError, Result, TransportError};
pub use message::{GeoPoint, MeshEvent, MeshHandler, MeshMessage, MessageKind, Payload};
