//! Fan-out of inference results to observer clients
//!
//! Results are pushed onto a bounded queue and delivered by a dedicated task,
//! so the inference receive loop never waits on observers. When the queue is
//! full the incoming payload is dropped; that is the only place results are
//! lost. Each observer owns a bounded channel drained by the task writing to
//! its WebSocket. Delivery waits for room in that channel, and an observer
//! whose channel is closed is pruned from the set.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default capacity of the delivery queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Opaque message forwarded to observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    pub fn len(&self) -> usize {
        match self {
            Payload::Text(text) => text.len(),
            Payload::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub type ObserverId = Uuid;

/// Observer set plus the delivery queue feeding it
pub struct ObserverBroadcaster {
    observers: RwLock<HashMap<ObserverId, mpsc::Sender<Payload>>>,
    queue: mpsc::Sender<Payload>,
}

impl ObserverBroadcaster {
    /// Create the broadcaster and start its delivery task.
    ///
    /// The task ends once the broadcaster is dropped.
    pub fn spawn(queue_capacity: usize) -> Arc<Self> {
        let (queue, mut rx) = mpsc::channel(queue_capacity.max(1));
        let broadcaster = Arc::new(Self {
            observers: RwLock::new(HashMap::new()),
            queue,
        });

        let weak: Weak<Self> = Arc::downgrade(&broadcaster);
        tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                let Some(broadcaster) = weak.upgrade() else {
                    break;
                };
                broadcaster.deliver(payload).await;
            }
            debug!("Observer delivery task stopped");
        });

        broadcaster
    }

    /// Add an observer; payloads will be pushed into `sender`
    pub async fn register(&self, sender: mpsc::Sender<Payload>) -> ObserverId {
        let id = Uuid::new_v4();
        let mut observers = self.observers.write().await;
        observers.insert(id, sender);
        info!(observer = %id, total_observers = observers.len(), "Observer connected");
        id
    }

    pub async fn unregister(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write().await;
        let removed = observers.remove(&id).is_some();
        if removed {
            info!(observer = %id, remaining_observers = observers.len(), "Observer disconnected");
        }
        removed
    }

    pub async fn count(&self) -> usize {
        self.observers.read().await.len()
    }

    /// Queue a payload for delivery without waiting.
    ///
    /// Returns false if the payload was dropped because the queue is full.
    pub fn enqueue(&self, payload: Payload) -> bool {
        match self.queue.try_send(payload) {
            Ok(()) => {
                debug!("Payload queued for observers");
                true
            }
            Err(mpsc::error::TrySendError::Full(payload)) => {
                warn!(bytes = payload.len(), "Observer queue full, dropping payload");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Observer delivery task stopped, dropping payload");
                false
            }
        }
    }

    /// Deliver one payload to every observer, pruning those that are gone.
    ///
    /// Waits on observers whose channel is full; the delivery queue absorbs
    /// the backlog meanwhile. Returns the number of observers that accepted
    /// the payload.
    pub async fn deliver(&self, payload: Payload) -> usize {
        let targets: Vec<(ObserverId, mpsc::Sender<Payload>)> = self
            .observers
            .read()
            .await
            .iter()
            .map(|(id, sender)| (*id, sender.clone()))
            .collect();

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, sender) in targets {
            match sender.send(payload.clone()).await {
                Ok(()) => delivered += 1,
                Err(_) => {
                    warn!(observer = %id, "Observer connection gone");
                    dead.push(id);
                }
            }
        }

        if !dead.is_empty() {
            let mut observers = self.observers.write().await;
            for id in &dead {
                observers.remove(id);
            }
            info!(pruned = dead.len(), remaining_observers = observers.len(), "Pruned observers");
        }

        delivered
    }
}
