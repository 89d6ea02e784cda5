//! Topic fan-out
//!
//! A `TopicFanout` holds the subscriber IDs for one `/topic/...` destination.
//! Nothing is stored: a publish is delivered synchronously to whoever is
//! subscribed at that moment, regardless of ack mode or busy state, and a
//! later subscriber never sees it.
//!
//! Concurrency note: callers must synchronize access to `TopicFanout` (for
//! example via the broker lock) when modifying subscriptions.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use uuid::Uuid;

use super::message::{Delivery, MessageToken};
use super::session::{Session, SessionId};

#[derive(Debug, Default)]
pub struct TopicFanout {
    pub name: String,
    pub subscribers: HashSet<SessionId>,
}

impl TopicFanout {
    /// Create a new topic with the given name.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            subscribers: HashSet::new(),
        }
    }

    /// Add a subscriber to the topic. Duplicate adds are ignored.
    pub fn subscribe(&mut self, id: SessionId) {
        self.subscribers.insert(id);
    }

    /// Remove a subscriber from the topic.
    pub fn unsubscribe(&mut self, id: &str) {
        self.subscribers.remove(id);
    }

    /// Deliver `body` to every current subscriber. Returns how many sessions
    /// it was handed to.
    pub fn publish(&self, body: &Bytes, sessions: &HashMap<SessionId, Session>) -> usize {
        let message_id = MessageToken::new(Uuid::new_v4(), &self.name).to_string();
        let mut delivered = 0;
        for sub_id in &self.subscribers {
            if let Some(session) = sessions.get(sub_id) {
                session.deliver(Delivery {
                    destination: self.name.clone(),
                    message_id: message_id.clone(),
                    body: body.clone(),
                });
                delivered += 1;
            }
        }
        delivered
    }
}
