// Status change notifications. Events carry only the session id and the
// new lifecycle status; consumers re-fetch the record for anything else
// (commit status in particular is never embedded here).

use serde::Serialize;
use tokio::sync::broadcast;

use super::types::SessionStatus;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub session_id: String,
    pub status: SessionStatus,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StatusEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    /// An event with no subscribers is dropped.
    pub fn publish(&self, session_id: &str, status: SessionStatus) {
        let _ = self.tx.send(StatusEvent {
            session_id: session_id.to_string(),
            status,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish("s1", SessionStatus::Ready);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.session_id, "s1");
        assert_eq!(event.status, SessionStatus::Ready);
    }

    #[test]
    fn event_payload_omits_commit_status() {
        let event = StatusEvent {
            session_id: "s1".to_string(),
            status: SessionStatus::Stopped,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["sessionId"], "s1");
        assert_eq!(json["status"], "stopped");
        assert!(json.get("commitStatus").is_none());
    }
}
