//! Signaling Router
//!
//! Forwards call/answer envelopes to exactly one addressed session, or tells
//! the sender the target is unavailable.

use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::mpsc;

use crate::protocol::{ClientMessage, ServerMessage, Signal};
use crate::registry::IdentityRegistry;

/// Outbound queue of one session
pub type Outbox = mpsc::UnboundedSender<ServerMessage>;

/// Outcome of a routing attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Unavailable,
}

/// Routes signaling messages between live sessions
pub struct Router {
    registry: IdentityRegistry,
    /// connection handle -> outbound queue
    sessions: RwLock<HashMap<String, Outbox>>,
}

impl Router {
    pub fn new(registry: IdentityRegistry) -> Self {
        Self {
            registry,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &IdentityRegistry {
        &self.registry
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Register a new connection and tell it its peer id
    pub fn connect(&self, handle: &str, outbox: Outbox) -> String {
        let peer_id = self.registry.allocate(handle);
        let _ = outbox.send(ServerMessage::Me {
            id: peer_id.clone(),
        });
        self.sessions.write().insert(handle.to_string(), outbox);
        log::info!("User connected: {}", peer_id);
        peer_id
    }

    /// Dispatch one inbound client message
    pub fn handle_message(&self, handle: &str, message: ClientMessage) -> Option<Delivery> {
        match message {
            ClientMessage::CallUser {
                user_to_call,
                signal_data,
                from,
                name,
            } => Some(self.call_user(handle, &user_to_call, signal_data, &from, name)),
            ClientMessage::AnswerCall { signal, to } => Some(self.answer_call(handle, &to, signal)),
            ClientMessage::SendFeedback { text } => {
                self.send_feedback(handle, &text);
                None
            }
        }
    }

    /// Relay a call-initiation signal to the addressed peer
    pub fn call_user(
        &self,
        sender: &str,
        target_id: &str,
        signal: Signal,
        from: &str,
        name: Option<String>,
    ) -> Delivery {
        let from = if from.trim().is_empty() {
            self.registry.peer_id_of(sender).unwrap_or_default()
        } else {
            from.to_string()
        };
        log::debug!("callUser {} -> {} ({} bytes)", from, target_id, signal.encoded_len());

        let message = ServerMessage::CallUser { signal, from, name };
        self.route(sender, target_id, message)
    }

    /// Relay an answer-side signal back to the caller
    pub fn answer_call(&self, sender: &str, target_id: &str, signal: Signal) -> Delivery {
        log::debug!("answerCall -> {} ({} bytes)", target_id, signal.encoded_len());
        self.route(sender, target_id, ServerMessage::CallAccepted { signal })
    }

    /// Feedback is only logged
    pub fn send_feedback(&self, sender: &str, text: &str) {
        let peer_id = self.registry.peer_id_of(sender).unwrap_or_default();
        log::info!(target: "feedback", "[{}] {}", peer_id, text);
    }

    /// Forget a connection and tell everyone else a call ended.
    ///
    /// Safe to call more than once; only the first call broadcasts.
    pub fn disconnect(&self, handle: &str) -> Option<String> {
        let peer_id = self.registry.release(handle);
        let removed = self.sessions.write().remove(handle);
        if removed.is_none() {
            return peer_id;
        }

        log::info!("User disconnected: {}", peer_id.as_deref().unwrap_or(handle));

        // Every remaining session hears about it; clients ignore ended
        // events for calls they are not part of.
        let sessions = self.sessions.read();
        for outbox in sessions.values() {
            let _ = outbox.send(ServerMessage::CallEnded { id: peer_id.clone() });
        }
        peer_id
    }

    fn route(&self, sender: &str, target_id: &str, message: ServerMessage) -> Delivery {
        let event = message.event_name();
        let delivered = match self.registry.resolve(target_id) {
            Some(target) => self.deliver(&target, message),
            None => false,
        };

        if delivered {
            log::info!("Relayed {} to {}", event, target_id.trim());
            return Delivery::Delivered;
        }

        log::info!("{} target {} unavailable", event, target_id.trim());
        self.deliver(
            sender,
            ServerMessage::UserUnavailable {
                user_to_call: target_id.to_string(),
            },
        );
        Delivery::Unavailable
    }

    fn deliver(&self, handle: &str, message: ServerMessage) -> bool {
        match self.sessions.read().get(handle) {
            Some(outbox) => outbox.send(message).is_ok(),
            None => false,
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new(IdentityRegistry::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn session(router: &Router, handle: &str) -> (String, UnboundedReceiver<ServerMessage>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = router.connect(handle, tx);
        assert_eq!(rx.try_recv().unwrap(), ServerMessage::Me { id: id.clone() });
        (id, rx)
    }

    fn offer() -> Signal {
        Signal::new(json!({"type": "offer", "sdp": "v=0"}))
    }

    #[test]
    fn test_call_user_is_unicast() {
        let router = Router::default();
        let (a, mut rx_a) = session(&router, "aaaa0001");
        let (b, mut rx_b) = session(&router, "bbbb0001");
        let (_c, mut rx_c) = session(&router, "cccc0001");

        let result = router.call_user("aaaa0001", &b, offer(), &a, Some("Alice".to_string()));
        assert_eq!(result, Delivery::Delivered);

        assert_eq!(
            rx_b.try_recv().unwrap(),
            ServerMessage::CallUser {
                signal: offer(),
                from: a.clone(),
                name: Some("Alice".to_string()),
            }
        );
        assert!(rx_a.try_recv().is_err());
        assert!(rx_c.try_recv().is_err());
    }

    #[test]
    fn test_answer_call_is_unicast() {
        let router = Router::default();
        let (a, mut rx_a) = session(&router, "aaaa0001");
        let (_b, mut rx_b) = session(&router, "bbbb0001");
        let (_c, mut rx_c) = session(&router, "cccc0001");

        let answer = Signal::new(json!({"type": "answer"}));
        let result = router.handle_message(
            "bbbb0001",
            ClientMessage::AnswerCall {
                signal: answer.clone(),
                to: a,
            },
        );
        assert_eq!(result, Some(Delivery::Delivered));
        assert_eq!(rx_a.try_recv().unwrap(), ServerMessage::CallAccepted { signal: answer });
        assert!(rx_b.try_recv().is_err());
        assert!(rx_c.try_recv().is_err());
    }

    #[test]
    fn test_unknown_target_reports_unavailable_once() {
        let router = Router::default();
        let (a, mut rx_a) = session(&router, "aaaa0001");
        let (_b, mut rx_b) = session(&router, "bbbb0001");

        let result = router.call_user("aaaa0001", "zzzz", offer(), &a, None);
        assert_eq!(result, Delivery::Unavailable);
        assert_eq!(
            rx_a.try_recv().unwrap(),
            ServerMessage::UserUnavailable {
                user_to_call: "zzzz".to_string()
            }
        );
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());

        let result = router.answer_call("aaaa0001", "", offer());
        assert_eq!(result, Delivery::Unavailable);
        assert_eq!(
            rx_a.try_recv().unwrap(),
            ServerMessage::UserUnavailable {
                user_to_call: String::new()
            }
        );
        assert_eq!(router.registry().len(), 2);
    }

    #[test]
    fn test_raw_handle_addressing() {
        let router = Router::default();
        let (a, _rx_a) = session(&router, "aaaa0001");
        let (_b, mut rx_b) = session(&router, "bbbb0001");

        let result = router.call_user("aaaa0001", "bbbb0001", offer(), &a, None);
        assert_eq!(result, Delivery::Delivered);
        assert!(matches!(rx_b.try_recv().unwrap(), ServerMessage::CallUser { .. }));
    }

    #[test]
    fn test_blank_from_uses_sender_id() {
        let router = Router::default();
        let (a, _rx_a) = session(&router, "aaaa0001");
        let (b, mut rx_b) = session(&router, "bbbb0001");

        router.call_user("aaaa0001", &b, offer(), "  ", None);
        match rx_b.try_recv().unwrap() {
            ServerMessage::CallUser { from, .. } => assert_eq!(from, a),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_disconnect_releases_and_broadcasts() {
        let router = Router::default();
        let (a, _rx_a) = session(&router, "aaaa0001");
        let (b, mut rx_b) = session(&router, "bbbb0001");
        let (_c, mut rx_c) = session(&router, "cccc0001");

        assert_eq!(router.disconnect("aaaa0001").as_deref(), Some(a.as_str()));
        let ended = ServerMessage::CallEnded { id: Some(a.clone()) };
        assert_eq!(rx_b.try_recv().unwrap(), ended);
        assert_eq!(rx_c.try_recv().unwrap(), ended);
        assert_eq!(router.session_count(), 2);

        // A second disconnect is silent
        assert!(router.disconnect("aaaa0001").is_none());
        assert!(rx_b.try_recv().is_err());

        // The released id is no longer routable
        let result = router.call_user("bbbb0001", &a, offer(), &b, None);
        assert_eq!(result, Delivery::Unavailable);
        assert!(matches!(
            rx_b.try_recv().unwrap(),
            ServerMessage::UserUnavailable { .. }
        ));
        assert!(rx_c.try_recv().is_err());
    }

    #[test]
    fn test_closed_outbox_counts_as_unavailable() {
        let router = Router::default();
        let (a, mut rx_a) = session(&router, "aaaa0001");
        let (b, rx_b) = session(&router, "bbbb0001");
        drop(rx_b);

        let result = router.call_user("aaaa0001", &b, offer(), &a, None);
        assert_eq!(result, Delivery::Unavailable);
        assert!(matches!(
            rx_a.try_recv().unwrap(),
            ServerMessage::UserUnavailable { .. }
        ));
    }

    #[test]
    fn test_feedback_has_no_reply() {
        let router = Router::default();
        let (_a, mut rx_a) = session(&router, "aaaa0001");
        let result = router.handle_message(
            "aaaa0001",
            ClientMessage::SendFeedback {
                text: "works great".to_string(),
            },
        );
        assert!(result.is_none());
        assert!(rx_a.try_recv().is_err());
    }
}
