//! Mesh Frame Codec
//!
//! Pipe-delimited text frames, human readable on a sniffer:
//!
//! ```text
//! SOS|40.7128|-74.006
//! LOCATION|40.7128|-74.006
//! ALERT|Evacuate to the north gate
//! BROADCAST|Water at the school
//! TEXT|anything, may contain | pipes
//! ```
//!
//! Tags outside this set decode to plain text carrying the whole frame.

use chrono::Utc;
use log::debug;

use super::message_types::{GeoPoint, MeshMessage, MessageKind, Payload, DEFAULT_ALERT_TEXT};
use crate::bluetooth::protocol::{FIELD_SEPARATOR, MAX_FRAME_SIZE};
use crate::error::{MeshError, Result};

/// Stateless encoder/decoder for mesh frames
pub struct MeshCodec;

impl MeshCodec {
    /// Encode a message into a wire frame
    pub fn encode(message: &MeshMessage) -> Result<Vec<u8>> {
        let tag = message.kind().wire_tag();

        let frame = match &message.payload {
            Payload::Sos { latitude, longitude } | Payload::Location { latitude, longitude } => {
                // `{}` on f64 is the shortest text that parses back to the same value
                format!("{tag}{FIELD_SEPARATOR}{latitude}{FIELD_SEPARATOR}{longitude}")
            }
            Payload::Alert { text } | Payload::Broadcast { text } | Payload::PlainText { text } => {
                format!("{tag}{FIELD_SEPARATOR}{text}")
            }
        };

        if frame.len() > MAX_FRAME_SIZE {
            return Err(MeshError::FrameTooLarge {
                size: frame.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        Ok(frame.into_bytes())
    }

    /// Decode a wire frame received from `sender_id`
    ///
    /// Never panics. Frames over [`MAX_FRAME_SIZE`] are
    /// [`MeshError::FrameTooLarge`]; every other defect is
    /// [`MeshError::MalformedMessage`].
    pub fn decode(data: &[u8], sender_id: &str) -> Result<MeshMessage> {
        if data.len() > MAX_FRAME_SIZE {
            return Err(MeshError::FrameTooLarge {
                size: data.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        let frame = std::str::from_utf8(data)
            .map_err(|e| MeshError::MalformedMessage(format!("frame is not UTF-8: {e}")))?;

        let (tag, rest) = frame.split_once(FIELD_SEPARATOR).ok_or_else(|| {
            MeshError::MalformedMessage(format!("expected at least 2 fields in {frame:?}"))
        })?;

        let payload = match MessageKind::from_wire_tag(tag) {
            Some(MessageKind::Sos) => {
                let point = Self::parse_position(tag, rest)?;
                Payload::Sos {
                    latitude: point.latitude,
                    longitude: point.longitude,
                }
            }
            Some(MessageKind::Location) => {
                let point = Self::parse_position(tag, rest)?;
                Payload::Location {
                    latitude: point.latitude,
                    longitude: point.longitude,
                }
            }
            Some(MessageKind::Alert) => {
                let text = if rest.is_empty() { DEFAULT_ALERT_TEXT } else { rest };
                Payload::Alert { text: text.to_string() }
            }
            Some(MessageKind::Broadcast) => Payload::Broadcast { text: rest.to_string() },
            Some(MessageKind::PlainText) => Payload::PlainText { text: rest.to_string() },
            None => {
                debug!("Unknown frame tag {:?}, treating as plain text", tag);
                Payload::PlainText { text: frame.to_string() }
            }
        };

        Ok(MeshMessage {
            sender_id: sender_id.to_string(),
            payload,
            timestamp: Utc::now(),
        })
    }

    /// Parse the `lat|lon` remainder of a positional frame
    fn parse_position(tag: &str, rest: &str) -> Result<GeoPoint> {
        let fields: Vec<&str> = rest.split(FIELD_SEPARATOR).collect();
        if fields.len() != 2 {
            return Err(MeshError::MalformedMessage(format!(
                "{tag} frame needs exactly 3 fields, got {}",
                fields.len() + 1
            )));
        }

        let latitude = Self::parse_coordinate(tag, "latitude", fields[0])?;
        let longitude = Self::parse_coordinate(tag, "longitude", fields[1])?;
        let point = GeoPoint::new(latitude, longitude);

        if !point.is_valid() {
            return Err(MeshError::MalformedMessage(format!(
                "{tag} coordinates out of range: {latitude}, {longitude}"
            )));
        }

        Ok(point)
    }

    fn parse_coordinate(tag: &str, name: &str, field: &str) -> Result<f64> {
        field.trim().parse::<f64>().map_err(|e| {
            MeshError::MalformedMessage(format!("{tag} {name} {field:?} is not a number: {e}"))
        })
    }
}
