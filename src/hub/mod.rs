//! Live subscriber registry with global and group fan-out.
//!
//! Every subscriber owns a bounded delivery queue. Delivery never waits on a
//! subscriber: a full queue evicts the subscriber, closing its queue and
//! removing it from the global set and from its group. Registry mutation and
//! delivery share one mutex so eviction cannot race a concurrent register.
//!
//! Producers that must not block hand payloads to [`BroadcastHub::submit`];
//! the hub's delivery task drains that bounded inbound queue and performs the
//! global broadcast.

mod ws;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::HubConfig;
use crate::{IngestError, Result};

pub use ws::{SubscriberListener, serve_subscriber, service_group};

/// Serialized JSON text delivered to subscribers.
pub type Payload = Arc<str>;

/// Registry-assigned subscriber identity.
pub type ClientId = u64;

/// Outcome of one delivery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub evicted: usize,
}

/// Receiving side of a registered subscriber.
///
/// `recv` returns `None` once the hub has evicted or unregistered the
/// subscriber and every queued payload has been read.
#[derive(Debug)]
pub struct Subscription {
    id: ClientId,
    group: Option<String>,
    rx: mpsc::Receiver<Payload>,
}

impl Subscription {
    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub async fn recv(&mut self) -> Option<Payload> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Payload> {
        self.rx.try_recv().ok()
    }
}

struct ClientSlot {
    tx: mpsc::Sender<Payload>,
    group: Option<String>,
}

#[derive(Default)]
struct Registry {
    clients: HashMap<ClientId, ClientSlot>,
    groups: HashMap<String, HashSet<ClientId>>,
}

impl Registry {
    fn remove(&mut self, id: ClientId) -> bool {
        let Some(slot) = self.clients.remove(&id) else { return false };
        if let Some(group) = slot.group
            && let Some(members) = self.groups.get_mut(&group)
        {
            members.remove(&id);
            if members.is_empty() {
                self.groups.remove(&group);
            }
        }
        true
    }
}

struct HubInner {
    registry: Mutex<Registry>,
    next_id: AtomicU64,
    inbound: mpsc::Sender<Payload>,
    client_capacity: usize,
}

/// Cloneable handle to the broadcast registry.
#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl BroadcastHub {
    /// Create the hub and spawn its delivery task.
    pub fn spawn(config: &HubConfig, cancel: CancellationToken) -> Self {
        let (inbound, mut rx) = mpsc::channel::<Payload>(config.inbound_capacity.max(1));
        let hub = Self {
            inner: Arc::new(HubInner {
                registry: Mutex::new(Registry::default()),
                next_id: AtomicU64::new(1),
                inbound,
                client_capacity: config.client_queue_capacity.max(1),
            }),
        };

        let delivery = hub.clone();
        tokio::spawn(async move {
            info!("Hub delivery task started");
            loop {
                let payload = tokio::select! {
                    _ = cancel.cancelled() => break,
                    payload = rx.recv() => payload,
                };
                let Some(payload) = payload else { break };
                let report = delivery.broadcast(payload);
                if report.evicted > 0 {
                    debug!(evicted = report.evicted, "Slow subscribers evicted");
                }
            }
            info!("Hub delivery task stopped");
        });

        hub
    }

    /// Add a subscriber, optionally tagged with a group.
    pub fn register(&self, group: Option<String>) -> Subscription {
        let group = group.filter(|g| !g.is_empty());
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.client_capacity);

        let mut registry = self.inner.registry.lock();
        if let Some(name) = &group {
            registry.groups.entry(name.clone()).or_default().insert(id);
        }
        registry.clients.insert(id, ClientSlot { tx, group: group.clone() });
        drop(registry);

        debug!(client = id, group = ?group, "Subscriber registered");
        Subscription { id, group, rx }
    }

    /// Remove a subscriber and close its queue. Unknown ids are ignored.
    pub fn unregister(&self, id: ClientId) {
        if self.inner.registry.lock().remove(id) {
            debug!(client = id, "Subscriber unregistered");
        }
    }

    /// Deliver to every subscriber, evicting any whose queue is full or closed.
    pub fn broadcast(&self, payload: Payload) -> DeliveryReport {
        let mut registry = self.inner.registry.lock();
        let mut report = DeliveryReport::default();
        let mut evict = Vec::new();

        for (id, slot) in &registry.clients {
            match slot.tx.try_send(payload.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => evict.push(*id),
            }
        }
        for id in evict {
            registry.remove(id);
            report.evicted += 1;
        }
        report
    }

    /// Deliver to one group with the same eviction policy. Unknown groups are a no-op.
    pub fn broadcast_to_group(&self, group: &str, payload: Payload) -> DeliveryReport {
        let mut registry = self.inner.registry.lock();
        let mut report = DeliveryReport::default();
        let Some(members) = registry.groups.get(group) else { return report };

        let mut evict = Vec::new();
        for id in members {
            match registry.clients.get(id) {
                Some(slot) => match slot.tx.try_send(payload.clone()) {
                    Ok(()) => report.delivered += 1,
                    Err(_) => evict.push(*id),
                },
                None => evict.push(*id),
            }
        }
        for id in evict {
            registry.remove(id);
            if let Some(members) = registry.groups.get_mut(group) {
                members.remove(&id);
                if members.is_empty() {
                    registry.groups.remove(group);
                }
            }
            report.evicted += 1;
        }
        report
    }

    /// Queue a payload for global delivery without waiting.
    pub fn submit(&self, payload: Payload) -> Result<()> {
        self.inner.inbound.try_send(payload).map_err(|e| match e {
            TrySendError::Full(_) => IngestError::Backpressure { waited: Duration::ZERO },
            TrySendError::Closed(_) => IngestError::channel_closed("hub inbound queue"),
        })
    }

    /// Queue a payload for global delivery, waiting at most `timeout`.
    pub async fn submit_timeout(&self, payload: Payload, timeout: Duration) -> Result<()> {
        self.inner.inbound.send_timeout(payload, timeout).await.map_err(|e| match e {
            mpsc::error::SendTimeoutError::Timeout(_) => {
                IngestError::Backpressure { waited: timeout }
            }
            mpsc::error::SendTimeoutError::Closed(_) => {
                IngestError::channel_closed("hub inbound queue")
            }
        })
    }

    pub fn client_count(&self) -> usize {
        self.inner.registry.lock().clients.len()
    }

    pub fn group_size(&self, group: &str) -> usize {
        self.inner.registry.lock().groups.get(group).map_or(0, HashSet::len)
    }
}
