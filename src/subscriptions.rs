use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::engine::ValueStream;

pub type ConnectionId = Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Subscriber for {0} already exists")]
    AlreadyExists(String),
}

#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    id: Arc<str>,
    generation: u64,
    token: CancellationToken,
}

impl SubscriptionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

struct Active {
    generation: u64,
    token: CancellationToken,
}

#[derive(Clone)]
pub struct SubscriptionRegistry {
    connection_id: ConnectionId,
    active: Arc<DashMap<String, Active>>,
    generations: Arc<AtomicU64>,
}

impl SubscriptionRegistry {
    pub fn new(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            active: Arc::new(DashMap::new()),
            generations: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn register(&self, id: &str) -> Result<SubscriptionHandle, RegistryError> {
        match self.active.entry(id.to_string()) {
            Entry::Occupied(_) => Err(RegistryError::AlreadyExists(id.to_string())),
            Entry::Vacant(slot) => {
                let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
                let token = CancellationToken::new();
                slot.insert(Active {
                    generation,
                    token: token.clone(),
                });
                debug!(connection_id = %self.connection_id, id, generation, "subscription registered");
                Ok(SubscriptionHandle {
                    id: Arc::from(id),
                    generation,
                    token,
                })
            }
        }
    }

    pub fn cancel(&self, id: &str) -> bool {
        match self.active.remove(id) {
            Some((_, active)) => {
                active.token.cancel();
                debug!(connection_id = %self.connection_id, id, "subscription cancelled");
                true
            }
            None => false,
        }
    }

    pub fn finish(&self, handle: &SubscriptionHandle) {
        self.active
            .remove_if(handle.id(), |_, active| active.generation == handle.generation);
    }

    pub fn cancel_all(&self) -> usize {
        let ids: Vec<String> = self.active.iter().map(|e| e.key().clone()).collect();
        ids.iter().filter(|id| self.cancel(id)).count()
    }

    #[cfg(test)]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Next(Value),
    Error(Vec<Value>),
    Complete,
}

#[derive(Debug, Clone)]
pub struct SubscriptionEvent {
    pub handle: SubscriptionHandle,
    pub kind: EventKind,
}

impl SubscriptionEvent {
    /// Events of a cancelled subscription must not reach the wire.
    pub fn is_stale(&self) -> bool {
        self.handle.is_cancelled()
    }
}

pub async fn drive<T>(
    registry: SubscriptionRegistry,
    handle: SubscriptionHandle,
    mut values: ValueStream,
    sink: mpsc::Sender<T>,
) where
    T: From<SubscriptionEvent> + Send,
{
    loop {
        tokio::select! {
            biased;
            _ = handle.cancelled() => {
                debug!(id = handle.id(), generation = handle.generation(), "subscription stopped by cancel");
                return;
            }
            item = values.next() => {
                let kind = match item {
                    Some(value) => EventKind::Next(value),
                    None => break,
                };
                let event = SubscriptionEvent { handle: handle.clone(), kind };
                if sink.send(event.into()).await.is_err() {
                    registry.cancel(handle.id());
                    return;
                }
            }
        }
    }

    drop(values);
    registry.finish(&handle);
    let complete = SubscriptionEvent {
        handle,
        kind: EventKind::Complete,
    };
    let _ = sink.send(complete.into()).await;
}
