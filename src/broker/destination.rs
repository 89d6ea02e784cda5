//! Destinations: durable queues and transient topics.

use std::collections::VecDeque;

use tracing::debug;
use uuid::Uuid;

use super::session::SessionId;
use super::topic::TopicFanout;
use crate::persistence::{MessageStore, ReceivedMessage, StoreConfig};
use crate::utils::error::StoreResult;

/// Names starting with this prefix are topics; everything else is a queue.
pub const TOPIC_PREFIX: &str = "/topic/";

/// Point-to-point destination backed by a [`MessageStore`].
///
/// `subscribers` is kept in delivery rotation order: the session that just
/// received a message moves to the back.
#[derive(Debug)]
pub struct QueueDestination {
    store: MessageStore,
    subscribers: VecDeque<SessionId>,
}

impl QueueDestination {
    pub fn open(name: &str, config: StoreConfig) -> StoreResult<Self> {
        Ok(Self {
            store: MessageStore::open(name, config)?,
            subscribers: VecDeque::new(),
        })
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut MessageStore {
        &mut self.store
    }

    pub fn rotate(&mut self, session_id: &str) {
        if let Some(idx) = self.subscribers.iter().position(|s| s == session_id) {
            if let Some(sid) = self.subscribers.remove(idx) {
                self.subscribers.push_back(sid);
            }
        }
    }
}

#[derive(Debug)]
pub enum Destination {
    Queue(QueueDestination),
    Topic(TopicFanout),
}

impl Destination {
    /// Open a destination, choosing the kind from the name prefix.
    pub fn open(name: &str, config: &StoreConfig) -> StoreResult<Self> {
        if name.starts_with(TOPIC_PREFIX) {
            Ok(Destination::Topic(TopicFanout::new(name)))
        } else {
            Ok(Destination::Queue(QueueDestination::open(name, config.clone())?))
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Destination::Queue(q) => q.store.name(),
            Destination::Topic(t) => &t.name,
        }
    }

    pub fn is_topic(&self) -> bool {
        matches!(self, Destination::Topic(_))
    }

    pub fn subscribe(&mut self, session_id: &str) {
        match self {
            Destination::Queue(q) => {
                if !q.subscribers.iter().any(|s| s == session_id) {
                    q.subscribers.push_back(session_id.to_string());
                }
            }
            Destination::Topic(t) => t.subscribe(session_id.to_string()),
        }
    }

    pub fn unsubscribe(&mut self, session_id: &str) {
        match self {
            Destination::Queue(q) => q.subscribers.retain(|s| s != session_id),
            Destination::Topic(t) => t.unsubscribe(session_id),
        }
    }

    pub fn has_subscriber(&self, session_id: &str) -> bool {
        match self {
            Destination::Queue(q) => q.subscribers.iter().any(|s| s == session_id),
            Destination::Topic(t) => t.subscribers.contains(session_id),
        }
    }

    pub fn subscribers(&self) -> Vec<SessionId> {
        match self {
            Destination::Queue(q) => q.subscribers.iter().cloned().collect(),
            Destination::Topic(t) => t.subscribers.iter().cloned().collect(),
        }
    }

    /// Topics keep nothing to receive.
    pub fn receive(&mut self, auto_ack: bool) -> StoreResult<Option<ReceivedMessage>> {
        match self {
            Destination::Queue(q) => q.store.receive(auto_ack),
            Destination::Topic(_) => Ok(None),
        }
    }

    pub fn ack(&mut self, id: &Uuid) -> StoreResult<bool> {
        match self {
            Destination::Queue(q) => q.store.ack(id),
            Destination::Topic(t) => {
                debug!(topic = %t.name, id = %id.simple(), "ignoring ack on topic");
                Ok(false)
            }
        }
    }

    /// Release the destination's resources, deleting a queue's file.
    pub fn destroy(self) -> StoreResult<()> {
        match self {
            Destination::Queue(q) => q.store.destroy(),
            Destination::Topic(_) => Ok(()),
        }
    }
}
