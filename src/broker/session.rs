//! Sessions and subscriptions.
//!
//! A `Session` is one connected client: the destinations it listens to, in
//! the order it will next pull from them, and whether it is waiting on a
//! client ack. Sessions never hold references to destinations; the broker
//! looks destinations up by name in its registry.

use std::fmt;

use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

use super::message::Delivery;
use crate::persistence::WILDCARD_SUFFIX;

pub type SessionId = String;

/// Receiving end of a session's deliveries, implemented by the protocol
/// layer to turn a [`Delivery`] into a wire frame.
pub trait DeliverySink: Send {
    fn deliver(&self, delivery: Delivery);
}

impl DeliverySink for UnboundedSender<Delivery> {
    fn deliver(&self, delivery: Delivery) {
        if let Err(e) = self.send(delivery) {
            warn!("delivery channel closed, dropping message {}", e.0.message_id);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub destination: String,
    pub auto_ack: bool,
    /// Added because a wildcard subscription matched a new destination.
    pub wildcard_derived: bool,
}

impl Subscription {
    pub fn new(destination: &str, auto_ack: bool) -> Self {
        Self {
            destination: destination.to_string(),
            auto_ack,
            wildcard_derived: false,
        }
    }

    pub fn derived(destination: &str, auto_ack: bool) -> Self {
        Self {
            wildcard_derived: true,
            ..Self::new(destination, auto_ack)
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.destination.ends_with(WILDCARD_SUFFIX)
    }

    /// Prefix match for wildcard patterns, exact match otherwise.
    pub fn matches(&self, name: &str) -> bool {
        match self.destination.strip_suffix(WILDCARD_SUFFIX) {
            Some(prefix) => name.starts_with(prefix),
            None => self.destination == name,
        }
    }
}

/// `Idle` -> `AwaitingAck` on a client-ack delivery, back on the matching ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingAck,
}

pub struct Session {
    id: SessionId,
    sink: Option<Box<dyn DeliverySink>>,
    subscriptions: Vec<Subscription>,
    state: SessionState,
}

impl Session {
    pub fn new(id: SessionId, sink: Box<dyn DeliverySink>) -> Self {
        Self {
            sink: Some(sink),
            ..Self::detached(id)
        }
    }

    /// A session known only by id, with nowhere to deliver yet. Queues hold
    /// its messages back until a sink is attached.
    pub fn detached(id: SessionId) -> Self {
        Self {
            id,
            sink: None,
            subscriptions: Vec::new(),
            state: SessionState::Idle,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_busy(&self) -> bool {
        self.state == SessionState::AwaitingAck
    }

    pub fn is_attached(&self) -> bool {
        self.sink.is_some()
    }

    /// Idle with a sink to deliver into.
    pub fn is_ready(&self) -> bool {
        self.is_attached() && !self.is_busy()
    }

    pub(crate) fn attach(&mut self, sink: Box<dyn DeliverySink>) {
        self.sink = Some(sink);
    }

    /// Subscriptions in pull order.
    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    pub fn subscription(&self, destination: &str) -> Option<&Subscription> {
        self.subscriptions
            .iter()
            .find(|s| s.destination == destination)
    }

    /// Returns `false` if the session already subscribes to that destination.
    /// An explicit subscription replaces one inherited from a wildcard.
    pub fn add_subscription(&mut self, subscription: Subscription) -> bool {
        match self
            .subscriptions
            .iter_mut()
            .find(|s| s.destination == subscription.destination)
        {
            Some(existing) if existing.wildcard_derived && !subscription.wildcard_derived => {
                *existing = subscription;
                true
            }
            Some(_) => false,
            None => {
                self.subscriptions.push(subscription);
                true
            }
        }
    }

    pub fn remove_subscription(&mut self, destination: &str) -> Option<Subscription> {
        let idx = self
            .subscriptions
            .iter()
            .position(|s| s.destination == destination)?;
        Some(self.subscriptions.remove(idx))
    }

    /// First wildcard subscription matching `name`, if any.
    pub fn wildcard_parent(&self, name: &str) -> Option<&Subscription> {
        self.subscriptions
            .iter()
            .find(|s| s.is_wildcard() && s.destination != name && s.matches(name))
    }

    /// Move `destination` to the end of the pull order.
    pub fn rotate_to_back(&mut self, destination: &str) {
        if let Some(idx) = self
            .subscriptions
            .iter()
            .position(|s| s.destination == destination)
        {
            let sub = self.subscriptions.remove(idx);
            self.subscriptions.push(sub);
        }
    }

    pub fn deliver(&self, delivery: Delivery) {
        match &self.sink {
            Some(sink) => sink.deliver(delivery),
            None => warn!(session = %self.id, "no sink attached, dropping message {}", delivery.message_id),
        }
    }

    pub(crate) fn await_ack(&mut self) {
        self.state = SessionState::AwaitingAck;
    }

    pub(crate) fn ack_received(&mut self) {
        self.state = SessionState::Idle;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("subscriptions", &self.subscriptions)
            .field("state", &self.state)
            .field("attached", &self.is_attached())
            .finish()
    }
}
