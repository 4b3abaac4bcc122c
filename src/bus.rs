//! In-process event bus for chat and mail fan-out.
//!
//! Topic-keyed broadcast channels: the topic is the session id for chat
//! events and `mail:<project>:<agent>` for mail arrival. Exactly one event
//! is published per committed write, after the commit, so subscribers on a
//! topic observe events in commit order. Publishing to a topic nobody is
//! subscribed to is a no-op.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard, RwLock};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Message {
        session_id: String,
        message_id: String,
        from_agent: String,
        from_agent_id: String,
        body: String,
        sender_leaving: bool,
        hang_on: bool,
        extends_wait_seconds: i64,
        timestamp: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        from_did: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        to_did: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        signing_key_id: Option<String>,
    },
    ReadReceipt {
        session_id: String,
        reader_alias: String,
        reader_agent_id: String,
        up_to_message_id: String,
        extends_wait_seconds: i64,
        timestamp: String,
    },
    Mail {
        message_id: String,
        from_alias: String,
        subject: String,
        priority: String,
        timestamp: String,
    },
}

impl Event {
    /// SSE event name for this event.
    pub fn name(&self) -> &'static str {
        match self {
            Event::Message { .. } => "message",
            Event::ReadReceipt { .. } => "read_receipt",
            Event::Mail { .. } => "mail",
        }
    }
}

pub struct EventBus {
    channels: RwLock<HashMap<String, broadcast::Sender<Event>>>,
    // Serializes commit+publish per topic so subscribers observe events in
    // commit order.
    locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            locks: RwLock::new(HashMap::new()),
        }
    }

    /// Take the write-ordering lock for a topic. Writers hold it across the
    /// store commit and the matching publish.
    pub async fn write_lock(&self, topic: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let locks = self.locks.read().await;
            locks.get(topic).cloned()
        };
        let lock = match lock {
            Some(lock) => lock,
            None => self
                .locks
                .write()
                .await
                .entry(topic.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone(),
        };
        lock.lock_owned().await
    }

    pub fn mail_topic(project_id: &str, agent_id: &str) -> String {
        format!("mail:{project_id}:{agent_id}")
    }

    /// Subscribe to a topic, creating its channel on first use.
    pub async fn subscribe(&self, topic: &str) -> broadcast::Receiver<Event> {
        {
            let channels = self.channels.read().await;
            if let Some(tx) = channels.get(topic) {
                return tx.subscribe();
            }
        }

        let mut channels = self.channels.write().await;
        channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish an event to a topic. Returns the number of live subscribers
    /// it reached.
    pub async fn publish(&self, topic: &str, event: Event) -> usize {
        let delivered = {
            let channels = self.channels.read().await;
            match channels.get(topic) {
                Some(tx) => tx.send(event).unwrap_or(0),
                None => return 0,
            }
        };

        // Drop drained channels so the map does not grow unboundedly. Safe
        // only when no receiver is left to strand.
        if delivered == 0 {
            let mut channels = self.channels.write().await;
            if channels.get(topic).is_some_and(|tx| tx.receiver_count() == 0) {
                channels.remove(topic);
            }
        }

        delivered
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message_event(session_id: &str, body: &str) -> Event {
        Event::Message {
            session_id: session_id.to_string(),
            message_id: uuid::Uuid::new_v4().to_string(),
            from_agent: "alice".to_string(),
            from_agent_id: "a-1".to_string(),
            body: body.to_string(),
            sender_leaving: false,
            hang_on: false,
            extends_wait_seconds: 0,
            timestamp: crate::db::now_ts(),
            from_did: None,
            to_did: None,
            signature: None,
            signing_key_id: None,
        }
    }

    #[tokio::test]
    async fn subscribers_see_events_in_publish_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("s1").await;

        bus.publish("s1", message_event("s1", "first")).await;
        bus.publish("s1", message_event("s1", "second")).await;

        for expected in ["first", "second"] {
            match rx.recv().await.unwrap() {
                Event::Message { body, .. } => assert_eq!(body, expected),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe("s1").await;
        let mut rx2 = bus.subscribe("s2").await;

        bus.publish("s1", message_event("s1", "only-s1")).await;
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_noop() {
        let bus = EventBus::new();
        assert_eq!(bus.publish("nobody", message_event("nobody", "x")).await, 0);
    }

    #[test]
    fn event_payloads_carry_the_wire_shape() {
        let json = serde_json::to_value(message_event("s1", "hi")).unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["body"], "hi");
        assert_eq!(json["from_agent"], "alice");
        assert!(json.get("from_did").is_none());

        let rr = Event::ReadReceipt {
            session_id: "s1".to_string(),
            reader_alias: "bob".to_string(),
            reader_agent_id: "a-2".to_string(),
            up_to_message_id: "m1".to_string(),
            extends_wait_seconds: 300,
            timestamp: crate::db::now_ts(),
        };
        let json = serde_json::to_value(rr).unwrap();
        assert_eq!(json["type"], "read_receipt");
        assert_eq!(json["extends_wait_seconds"], 300);
    }
}
