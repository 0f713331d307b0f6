//! Message Handling Module
//!
//! Typed mesh messages, the wire codec and role-aware dispatch.

pub mod codec;
pub mod dispatcher;
pub mod message_types;

pub use codec::MeshCodec;
pub use dispatcher::{deliver, pump, EventReceiver, EventSender, MeshEvent, MeshHandler, RoleDispatcher};
pub use message_types::{GeoPoint, MeshMessage, MessageKind, Payload};
