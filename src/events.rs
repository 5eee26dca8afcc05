//! Lifecycle event fan-out
//!
//! The broadcaster hands every pipeline event to each live subscriber through
//! its own bounded queue. Delivery never waits: a subscriber whose queue is
//! full simply misses the event, and one whose receiver is gone is dropped from
//! the subscriber set. The pipeline never takes this lock while holding any of
//! its own.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};
use uuid::Uuid;

pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    FileDetected,
    FileProcessing,
    FileSkipped,
    FileComplete,
    FileError,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::FileDetected => "file_detected",
            EventType::FileProcessing => "file_processing",
            EventType::FileSkipped => "file_skipped",
            EventType::FileComplete => "file_complete",
            EventType::FileError => "file_error",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `{type, message, payload}` notification, serialized verbatim for listeners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventType,
    pub message: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

pub type SubscriberId = Uuid;

/// Receiving end of one subscription. Dropping it disconnects the listener.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    receiver: mpsc::Receiver<Event>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.receiver.try_recv().ok()
    }
}

#[derive(Debug)]
pub struct EventBroadcaster {
    subscribers: RwLock<HashMap<SubscriberId, mpsc::Sender<Event>>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = Uuid::new_v4();
        self.write().insert(id, tx);
        debug!("Event subscriber {} connected", id);
        Subscription { id, receiver: rx }
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.write().remove(&id).is_some();
        if removed {
            debug!("Event subscriber {} disconnected", id);
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.read().len()
    }

    /// Events discarded so far because a subscriber's queue was full
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn broadcast_json<P: Serialize>(
        &self,
        kind: EventType,
        message: impl Into<String>,
        payload: P,
    ) {
        let payload = match serde_json::to_value(payload) {
            Ok(value) => value,
            Err(e) => {
                warn!("Failed to serialize {} payload: {}", kind, e);
                serde_json::Value::Null
            }
        };

        self.broadcast(Event {
            kind,
            message: message.into(),
            payload,
            timestamp: Utc::now(),
        });
    }

    pub fn broadcast(&self, event: Event) {
        let mut disconnected = Vec::new();
        {
            let subscribers = self.read();
            for (id, tx) in subscribers.iter() {
                match tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        debug!("Subscriber {} lagging, dropped {} event", id, event.kind);
                    }
                    Err(TrySendError::Closed(_)) => disconnected.push(*id),
                }
            }
        }

        if !disconnected.is_empty() {
            let mut subscribers = self.write();
            for id in disconnected {
                subscribers.remove(&id);
                debug!("Removed disconnected event subscriber {}", id);
            }
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<SubscriberId, mpsc::Sender<Event>>> {
        self.subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<SubscriberId, mpsc::Sender<Event>>> {
        self.subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_broadcast_reaches_every_subscriber() {
        let broadcaster = EventBroadcaster::default();
        let mut first = broadcaster.subscribe();
        let mut second = broadcaster.subscribe();

        broadcaster.broadcast_json(
            EventType::FileDetected,
            "found a.txt",
            json!({"path": "/w/a.txt"}),
        );

        for sub in [&mut first, &mut second] {
            let event = sub.try_recv().expect("event delivered");
            assert_eq!(event.kind, EventType::FileDetected);
            assert_eq!(event.message, "found a.txt");
            assert_eq!(event.payload["path"], "/w/a.txt");
        }
    }

    #[test]
    fn test_unsubscribed_channel_receives_nothing() {
        let broadcaster = EventBroadcaster::default();
        let mut kept = broadcaster.subscribe();
        let mut gone = broadcaster.subscribe();

        assert!(broadcaster.unsubscribe(gone.id()));
        assert!(!broadcaster.unsubscribe(gone.id()));

        broadcaster.broadcast_json(EventType::FileSkipped, "unchanged", json!({}));

        assert!(kept.try_recv().is_some());
        assert!(gone.try_recv().is_none());
        assert_eq!(broadcaster.subscriber_count(), 1);
    }

    #[test]
    fn test_full_queue_drops_without_affecting_others() {
        let broadcaster = EventBroadcaster::new(2);
        let mut slow = broadcaster.subscribe();
        let mut fast = broadcaster.subscribe();

        for i in 0..5 {
            broadcaster.broadcast_json(EventType::FileProcessing, format!("event {}", i), json!(i));
            // fast keeps draining
            assert_eq!(fast.try_recv().unwrap().payload, json!(i));
        }

        assert_eq!(slow.try_recv().unwrap().payload, json!(0));
        assert_eq!(slow.try_recv().unwrap().payload, json!(1));
        assert!(slow.try_recv().is_none());
        assert_eq!(broadcaster.dropped_count(), 3);
    }

    #[test]
    fn test_dropped_receiver_is_pruned() {
        let broadcaster = EventBroadcaster::default();
        let sub = broadcaster.subscribe();
        drop(sub);

        broadcaster.broadcast_json(EventType::FileError, "boom", json!(null));
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[test]
    fn test_event_serializes_with_type_field() {
        let event = Event {
            kind: EventType::FileComplete,
            message: "done".to_string(),
            payload: json!({"chunks": 3}),
            timestamp: Utc::now(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "file_complete");
        assert_eq!(value["payload"]["chunks"], 3);
    }
}
