//! Message Type Definitions
//!
//! Defines the typed messages exchanged between mesh nodes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Text used when an alert arrives or is created without a body
pub const DEFAULT_ALERT_TEXT: &str = "Emergency Alert";

/// Kind of mesh message, mirroring the wire tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Sos,       // User in distress, with position
    Location,  // Periodic position report
    Alert,     // Admin-issued emergency alert
    Broadcast, // Admin-issued general message
    PlainText, // Free text, also the fallback for unknown tags
}

impl MessageKind {
    /// Tag written at the start of every frame
    pub fn wire_tag(self) -> &'static str {
        match self {
            MessageKind::Sos => "SOS",
            MessageKind::Location => "LOCATION",
            MessageKind::Alert => "ALERT",
            MessageKind::Broadcast => "BROADCAST",
            MessageKind::PlainText => "TEXT",
        }
    }

    /// Look up a known tag. Unknown tags return `None`; the codec maps them to plain text.
    pub fn from_wire_tag(tag: &str) -> Option<Self> {
        match tag {
            "SOS" => Some(MessageKind::Sos),
            "LOCATION" => Some(MessageKind::Location),
            "ALERT" => Some(MessageKind::Alert),
            "BROADCAST" => Some(MessageKind::Broadcast),
            "TEXT" => Some(MessageKind::PlainText),
            _ => None,
        }
    }

    /// Whether this kind always goes to every connected peer
    pub fn is_broadcast_only(self) -> bool {
        matches!(self, MessageKind::Alert | MessageKind::Broadcast)
    }
}

/// A latitude/longitude pair in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// Finite and inside the WGS84 ranges
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// Kind-specific message body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    Sos { latitude: f64, longitude: f64 },
    Location { latitude: f64, longitude: f64 },
    Alert { text: String },
    Broadcast { text: String },
    PlainText { text: String },
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::Sos { .. } => MessageKind::Sos,
            Payload::Location { .. } => MessageKind::Location,
            Payload::Alert { .. } => MessageKind::Alert,
            Payload::Broadcast { .. } => MessageKind::Broadcast,
            Payload::PlainText { .. } => MessageKind::PlainText,
        }
    }

    /// Coordinates carried by SOS and location reports
    pub fn position(&self) -> Option<GeoPoint> {
        match self {
            Payload::Sos { latitude, longitude } | Payload::Location { latitude, longitude } => {
                Some(GeoPoint::new(*latitude, *longitude))
            }
            _ => None,
        }
    }

    /// Text carried by alerts, broadcasts and plain text
    pub fn text(&self) -> Option<&str> {
        match self {
            Payload::Alert { text } | Payload::Broadcast { text } | Payload::PlainText { text } => {
                Some(text)
            }
            _ => None,
        }
    }
}

/// The unit of exchange between mesh nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshMessage {
    pub sender_id: String,
    pub payload: Payload,
    /// Creation time locally, receive time for decoded frames. Not used for ordering.
    pub timestamp: DateTime<Utc>,
}

impl MeshMessage {
    pub fn new(sender_id: impl Into<String>, payload: Payload) -> Self {
        Self {
            sender_id: sender_id.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Create an SOS carrying the sender's position
    pub fn sos(sender_id: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self::new(sender_id, Payload::Sos { latitude, longitude })
    }

    /// Create a location update
    pub fn location(sender_id: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self::new(sender_id, Payload::Location { latitude, longitude })
    }

    /// Create an emergency alert; an empty body becomes [`DEFAULT_ALERT_TEXT`]
    pub fn alert(sender_id: impl Into<String>, text: impl Into<String>) -> Self {
        let mut text = text.into();
        if text.is_empty() {
            text = DEFAULT_ALERT_TEXT.to_string();
        }
        Self::new(sender_id, Payload::Alert { text })
    }

    pub fn broadcast(sender_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(sender_id, Payload::Broadcast { text: text.into() })
    }

    pub fn plain_text(sender_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(sender_id, Payload::PlainText { text: text.into() })
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }
}
