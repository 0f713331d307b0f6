//! Bluetooth LE Mesh Networking Module
//!
//! Session lifecycle, peer tracking and the radio seam, with a btleplug
//! backend for real hardware and an in-memory medium for tests and demos.

pub mod ble_transport;
pub mod memory_transport;
pub mod mesh_session;
pub mod peer_registry;
pub mod protocol;
pub mod transport;

pub use ble_transport::BleTransport;
pub use memory_transport::{MemoryMedium, MemoryRadio};
pub use mesh_session::{MeshSession, NodeIdentity, SessionState, SessionStats, SessionStatus};
pub use peer_registry::{ConnectionState, PeerAddress, PeerRecord, PeerRegistry, RegistryStatistics};
pub use transport::{ConnectionHandle, EventSink, Transport, TransportEvent};
