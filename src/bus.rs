//! Event Bus
//!
//! In-process pub/sub with per-topic ordering and optional replay from the
//! durable log. Every subscriber owns a bounded buffer; a publisher never
//! blocks on a slow subscriber — past the high-water mark its messages are
//! dropped and a drop notice goes to the monitoring topic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use taskmesh_store::DurableStore;
use taskmesh_types::{Event, EventBody};

/// Topic that receives subscriber-drop notices.
pub const MONITOR_TOPIC: &str = "bus.drops";

/// Predicate over event payloads.
pub type EventFilter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

struct Subscriber {
    id: Uuid,
    topic: String,
    filter: Option<EventFilter>,
    tx: mpsc::Sender<Event>,
    dropped: Arc<AtomicU64>,
}

impl Subscriber {
    fn matches(&self, topic: &str, event: &Event) -> bool {
        if self.topic != topic {
            return false;
        }
        match &self.filter {
            Some(filter) => filter(event),
            None => true,
        }
    }
}

/// Handle returned by `subscribe`. Dropping it ends the subscription.
pub struct Subscription {
    pub id: Uuid,
    rx: mpsc::Receiver<Event>,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Messages this subscriber has lost to backpressure.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// The in-process event bus.
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
    high_water: usize,
    store: Option<Arc<DurableStore>>,
}

impl EventBus {
    pub fn new(high_water: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            high_water: high_water.max(1),
            store: None,
        }
    }

    /// Attach a durable store so `from_beginning` subscriptions can replay.
    pub fn with_store(high_water: usize, store: Arc<DurableStore>) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            high_water: high_water.max(1),
            store: Some(store),
        }
    }

    /// Deliver an event to every active subscriber of `topic`, preserving
    /// per-topic order. Never blocks: full subscriber buffers drop the
    /// message and a drop notice is emitted to the monitoring topic.
    pub fn publish(&self, topic: &str, event: &Event) {
        let mut drops: Vec<(Uuid, u64)> = Vec::new();
        {
            let mut subscribers = self.subscribers.lock().expect("bus lock");
            subscribers.retain(|sub| {
                if !sub.matches(topic, event) {
                    return true;
                }
                match sub.tx.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        let total = sub.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        drops.push((sub.id, total));
                        true
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                }
            });
        }

        for (subscriber, total) in drops {
            warn!(%subscriber, total, topic, "Subscriber buffer full; event dropped");
            let notice = Event::new(EventBody::Alert {
                code: "subscriber_drop".to_string(),
                message: format!("subscriber {} dropped event on topic {}", subscriber, topic),
            });
            self.publish_monitor(&notice);
        }
    }

    /// Monitoring-topic delivery. Drops here are silent; anything else
    /// would recurse.
    fn publish_monitor(&self, event: &Event) {
        let mut subscribers = self.subscribers.lock().expect("bus lock");
        subscribers.retain(|sub| {
            if !sub.matches(MONITOR_TOPIC, event) {
                return true;
            }
            !matches!(
                sub.tx.try_send(event.clone()),
                Err(mpsc::error::TrySendError::Closed(_))
            )
        });
    }

    /// Subscribe to a topic with an optional payload filter.
    ///
    /// With `from_beginning`, matching events are first replayed from the
    /// durable store, then live delivery continues with events the replay
    /// did not cover. Replay needs a store-attached bus.
    pub fn subscribe(
        &self,
        topic: impl Into<String>,
        filter: Option<EventFilter>,
        from_beginning: bool,
    ) -> Subscription {
        let topic = topic.into();
        let id = Uuid::new_v4();
        let dropped = Arc::new(AtomicU64::new(0));

        let (live_tx, mut live_rx) = mpsc::channel(self.high_water);
        self.subscribers.lock().expect("bus lock").push(Subscriber {
            id,
            topic: topic.clone(),
            filter: filter.clone(),
            tx: live_tx,
            dropped: dropped.clone(),
        });

        let store = if from_beginning { self.store.clone() } else { None };
        let Some(store) = store else {
            return Subscription {
                id,
                rx: live_rx,
                dropped,
            };
        };

        // Replay path: forward historical events first, then the live feed,
        // skipping live events the replay already covered.
        let (out_tx, out_rx) = mpsc::channel(self.high_water);
        tokio::spawn(async move {
            let mut replayed_to = 0u64;
            match store.read_range(1, u64::MAX).await {
                Ok(events) => {
                    for event in events {
                        if event.kind.topic() != topic {
                            continue;
                        }
                        if let Some(filter) = &filter {
                            if !filter(&event) {
                                continue;
                            }
                        }
                        replayed_to = event.seq;
                        if out_tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Event replay failed; continuing live"),
            }
            debug!(%id, replayed_to, "Replay complete; switching to live feed");
            while let Some(event) = live_rx.recv().await {
                if event.seq != 0 && event.seq <= replayed_to {
                    continue;
                }
                if out_tx.send(event).await.is_err() {
                    return;
                }
            }
        });

        Subscription {
            id,
            rx: out_rx,
            dropped,
        }
    }
}
