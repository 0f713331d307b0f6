//! Role Dispatcher
//!
//! Maps each decoded message to the notification its receiving role cares
//! about and posts it on the delivery queue.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::message_types::{MeshMessage, Payload};
use crate::config::Role;

/// Notification delivered to the application layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MeshEvent {
    Message { sender_id: String, text: String },
    Sos { sender_id: String, latitude: f64, longitude: f64 },
    Alert { text: String },
    Location { sender_id: String, latitude: f64, longitude: f64 },
    PeerConnected { address: String },
    PeerDisconnected { address: String },
}

pub type EventSender = mpsc::UnboundedSender<MeshEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<MeshEvent>;

/// Stateless role-aware message dispatch
pub struct RoleDispatcher;

impl RoleDispatcher {
    /// Decide which notification, if any, `role` raises for `message`
    pub fn route(role: Role, message: &MeshMessage) -> Option<MeshEvent> {
        let sender_id = message.sender_id.clone();

        match (role, &message.payload) {
            (Role::Admin, Payload::Sos { latitude, longitude }) => Some(MeshEvent::Sos {
                sender_id,
                latitude: *latitude,
                longitude: *longitude,
            }),
            (Role::Admin, Payload::Location { latitude, longitude }) => Some(MeshEvent::Location {
                sender_id,
                latitude: *latitude,
                longitude: *longitude,
            }),
            (Role::User, Payload::Alert { text }) => Some(MeshEvent::Alert { text: text.clone() }),
            (_, Payload::Broadcast { text } | Payload::PlainText { text }) => {
                Some(MeshEvent::Message {
                    sender_id,
                    text: text.clone(),
                })
            }
            (Role::User, Payload::Sos { .. } | Payload::Location { .. }) => {
                info!(
                    "Ignoring unexpected {:?} from {} on a user node",
                    message.kind(),
                    message.sender_id
                );
                None
            }
            (Role::Admin, Payload::Alert { .. }) => {
                debug!("Admin ignores alert from {}", message.sender_id);
                None
            }
        }
    }

    /// Route `message` and post the result without waiting on the consumer.
    /// Returns whether a notification was queued.
    pub fn dispatch(role: Role, message: &MeshMessage, events: &EventSender) -> bool {
        match Self::route(role, message) {
            Some(event) => {
                if events.send(event).is_err() {
                    debug!("Event receiver dropped, notification discarded");
                    return false;
                }
                true
            }
            None => false,
        }
    }
}

/// Callback-style consumer of mesh notifications
///
/// Only the methods a UI cares about need overriding.
pub trait MeshHandler {
    fn on_message(&mut self, _sender_id: &str, _text: &str) {}

    fn on_sos(&mut self, _sender_id: &str, _latitude: f64, _longitude: f64) {}

    fn on_alert(&mut self, _text: &str) {}

    fn on_location(&mut self, _sender_id: &str, _latitude: f64, _longitude: f64) {}

    fn on_peer_connected(&mut self, _address: &str) {}

    fn on_peer_disconnected(&mut self, _address: &str) {}
}

/// Invoke the handler method matching `event`
pub fn deliver<H: MeshHandler + ?Sized>(handler: &mut H, event: &MeshEvent) {
    match event {
        MeshEvent::Message { sender_id, text } => handler.on_message(sender_id, text),
        MeshEvent::Sos {
            sender_id,
            latitude,
            longitude,
        } => handler.on_sos(sender_id, *latitude, *longitude),
        MeshEvent::Alert { text } => handler.on_alert(text),
        MeshEvent::Location {
            sender_id,
            latitude,
            longitude,
        } => handler.on_location(sender_id, *latitude, *longitude),
        MeshEvent::PeerConnected { address } => handler.on_peer_connected(address),
        MeshEvent::PeerDisconnected { address } => handler.on_peer_disconnected(address),
    }
}

/// Drain the delivery queue into `handler` until every sender is gone
pub async fn pump<H: MeshHandler + Send>(mut events: EventReceiver, mut handler: H) -> H {
    while let Some(event) = events.recv().await {
        deliver(&mut handler, &event);
    }
    handler
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
    }

    impl MeshHandler for Recorder {
        fn on_message(&mut self, sender_id: &str, text: &str) {
            self.calls.push(format!("message:{sender_id}:{text}"));
        }

        fn on_sos(&mut self, sender_id: &str, latitude: f64, longitude: f64) {
            self.calls.push(format!("sos:{sender_id}:{latitude}:{longitude}"));
        }

        fn on_alert(&mut self, text: &str) {
            self.calls.push(format!("alert:{text}"));
        }

        fn on_location(&mut self, sender_id: &str, latitude: f64, longitude: f64) {
            self.calls.push(format!("location:{sender_id}:{latitude}:{longitude}"));
        }
    }

    fn peer_message(payload: Payload) -> MeshMessage {
        MeshMessage::new("peer1", payload)
    }

    #[test]
    fn admin_receives_sos_exactly_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sos = peer_message(Payload::Sos {
            latitude: 40.7128,
            longitude: -74.0060,
        });

        assert!(RoleDispatcher::dispatch(Role::Admin, &sos, &tx));
        assert_eq!(
            rx.try_recv().unwrap(),
            MeshEvent::Sos {
                sender_id: "peer1".to_string(),
                latitude: 40.7128,
                longitude: -74.0060,
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn user_ignores_sos_and_location() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sos = peer_message(Payload::Sos {
            latitude: 40.7128,
            longitude: -74.0060,
        });
        let location = peer_message(Payload::Location {
            latitude: 1.0,
            longitude: 2.0,
        });

        assert!(!RoleDispatcher::dispatch(Role::User, &sos, &tx));
        assert!(!RoleDispatcher::dispatch(Role::User, &location, &tx));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn alerts_only_reach_users() {
        let alert = peer_message(Payload::Alert {
            text: "Evacuate".to_string(),
        });
        assert_eq!(RoleDispatcher::route(Role::Admin, &alert), None);
        assert_eq!(
            RoleDispatcher::route(Role::User, &alert),
            Some(MeshEvent::Alert {
                text: "Evacuate".to_string()
            })
        );
    }

    #[test]
    fn text_reaches_both_roles() {
        for payload in [
            Payload::Broadcast { text: "hi".to_string() },
            Payload::PlainText { text: "hi".to_string() },
        ] {
            let message = peer_message(payload);
            for role in [Role::Admin, Role::User] {
                assert_eq!(
                    RoleDispatcher::route(role, &message),
                    Some(MeshEvent::Message {
                        sender_id: "peer1".to_string(),
                        text: "hi".to_string(),
                    })
                );
            }
        }
    }

    #[test]
    fn admin_location_is_reported() {
        let location = peer_message(Payload::Location {
            latitude: 1.5,
            longitude: 2.5,
        });
        assert_eq!(
            RoleDispatcher::route(Role::Admin, &location),
            Some(MeshEvent::Location {
                sender_id: "peer1".to_string(),
                latitude: 1.5,
                longitude: 2.5,
            })
        );
    }

    #[test]
    fn dropped_receiver_does_not_panic() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let message = peer_message(Payload::Broadcast { text: "hi".to_string() });
        assert!(!RoleDispatcher::dispatch(Role::User, &message, &tx));
    }

    #[tokio::test]
    async fn pump_invokes_callbacks_in_order() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(MeshEvent::Alert { text: "a".to_string() }).unwrap();
        tx.send(MeshEvent::Sos {
            sender_id: "B".to_string(),
            latitude: 1.0,
            longitude: 2.0,
        })
        .unwrap();
        tx.send(MeshEvent::PeerConnected { address: "B".to_string() }).unwrap();
        drop(tx);

        let recorder = pump(rx, Recorder::default()).await;
        assert_eq!(recorder.calls, vec!["alert:a", "sos:B:1:2"]);
    }
}
