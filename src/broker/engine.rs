//! Broker engine
//!
//! This module contains the broker implementation responsible for:
//! - owning the destination registry and the session table
//! - routing SEND to a queue store or a topic fan-out
//! - delivering queued messages round-robin across idle subscribers
//! - gating client-ack sessions to one unacknowledged message at a time
//!
//! Concurrency and usage notes:
//! - The public API here is synchronous and designed to be held behind a
//!   lock (for example `Arc<Mutex<Broker>>`) by the transport layer. Every
//!   destination and session mutation therefore runs one at a time.
//! - Delivery never blocks: sessions push into their [`DeliverySink`], which
//!   the transport drains on its own task.

use std::collections::HashMap;

use bytes::Bytes;
use tracing::{debug, info, warn};

use super::destination::Destination;
use super::message::{Delivery, MessageToken};
use super::registry::{DestinationRegistry, SessionTable};
use super::session::{DeliverySink, Session, Subscription};
use crate::config::BrokerSettings;
use crate::persistence::StoreConfig;
use crate::utils::error::BrokerResult;

#[derive(Debug)]
pub struct Broker {
    registry: DestinationRegistry,
    sessions: SessionTable,
}

impl Broker {
    /// Creates a broker with no sessions and no destinations.
    /// Queue files under `config.dir` are opened lazily, the first time a
    /// destination name is referenced by send, subscribe or ack.
    pub fn new(config: StoreConfig) -> Self {
        Self {
            registry: DestinationRegistry::new(config),
            sessions: HashMap::new(),
        }
    }

    /// Creates a broker from the `[broker]` section of the loaded settings.
    pub fn from_settings(settings: &BrokerSettings) -> Self {
        Self::new(settings.store_config())
    }

    /// Read access to every live destination.
    pub fn registry(&self) -> &DestinationRegistry {
        &self.registry
    }

    /// Returns the destination called `name` if it has been created.
    /// This never opens a queue file.
    pub fn destination(&self, name: &str) -> Option<&Destination> {
        self.registry.get(name)
    }

    /// Returns a session's subscriptions and ack state, if it is registered.
    pub fn session(&self, session_id: &str) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    /// Number of registered sessions, attached or not.
    /// The server drops a session when its connection ends, so this is also
    /// the number of live connections that sent CONNECT.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Register a session at CONNECT. Re-opening an attached session keeps
    /// its original sink; a session created by an earlier subscribe gets
    /// `sink` and receives whatever its queues held back.
    pub fn open_session(&mut self, session_id: &str, sink: Box<dyn DeliverySink>) -> BrokerResult<()> {
        match self.sessions.get_mut(session_id) {
            Some(session) if session.is_attached() => {
                debug!(session = session_id, "session already open");
                return Ok(());
            }
            Some(session) => session.attach(sink),
            None => {
                self.sessions.insert(
                    session_id.to_string(),
                    Session::new(session_id.to_string(), sink),
                );
            }
        }
        info!(session = session_id, "session opened");
        self.drain(session_id, None)?;
        Ok(())
    }

    /// Tear a session down, unsubscribing it from every destination it held.
    /// Messages it was leasing are requeued once their lease expires.
    pub fn disconnect(&mut self, session_id: &str) {
        let Some(session) = self.sessions.remove(session_id) else {
            return;
        };
        for sub in session.subscriptions() {
            if let Some(dest) = self.registry.get_mut(&sub.destination) {
                dest.unsubscribe(session_id);
            }
        }
        info!(
            session = session_id,
            subscriptions = session.subscriptions().len(),
            "session closed"
        );
    }

    /// Routes a message by destination name.
    /// Topics fan it out to current subscribers and keep nothing. Queues
    /// append it to their log, then offer it to the next idle subscriber in
    /// rotation.
    pub fn send(&mut self, dest_name: &str, body: impl Into<Bytes>) -> BrokerResult<()> {
        let body = body.into();
        self.ensure_destination(dest_name)?;
        let Some(dest) = self.registry.get_mut(dest_name) else {
            return Ok(());
        };

        match dest {
            Destination::Topic(topic) => {
                let delivered = topic.publish(&body, &self.sessions);
                debug!(topic = dest_name, delivered, "published");
            }
            Destination::Queue(queue) => {
                queue.store_mut().send(&body)?;
                self.dispatch_queue(dest_name)?;
            }
        }
        Ok(())
    }

    /// Subscribe a session, creating it detached if the id is new.
    pub fn subscribe(&mut self, dest_name: &str, auto_ack: bool, session_id: &str) -> BrokerResult<()> {
        self.ensure_destination(dest_name)?;

        let session = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session::detached(session_id.to_string()));
        let subscription = Subscription::new(dest_name, auto_ack);
        let wildcard = subscription.is_wildcard();
        if session.add_subscription(subscription) {
            if let Some(dest) = self.registry.get_mut(dest_name) {
                dest.subscribe(session_id);
            }
            info!(session = session_id, destination = dest_name, auto_ack, "subscribed");
        }

        if wildcard {
            self.attach_existing(dest_name, auto_ack, session_id);
        }
        self.drain(session_id, None)?;
        Ok(())
    }

    /// Remove a subscription from both sides. Unsubscribing a wildcard
    /// pattern also drops the subscriptions it attached, unless another
    /// pattern of the session still covers them.
    pub fn unsubscribe(&mut self, dest_name: &str, session_id: &str) -> BrokerResult<()> {
        let Some(session) = self.sessions.get_mut(session_id) else {
            debug!(session = session_id, destination = dest_name, "unsubscribe for unknown session");
            return Ok(());
        };
        let Some(removed) = session.remove_subscription(dest_name) else {
            return Ok(());
        };

        let mut detached = vec![dest_name.to_string()];
        if removed.is_wildcard() {
            let orphans: Vec<String> = session
                .subscriptions()
                .iter()
                .filter(|s| s.wildcard_derived && removed.matches(&s.destination))
                .filter(|s| session.wildcard_parent(&s.destination).is_none())
                .map(|s| s.destination.clone())
                .collect();
            for name in orphans {
                session.remove_subscription(&name);
                detached.push(name);
            }
        }

        for name in &detached {
            if let Some(dest) = self.registry.get_mut(name) {
                dest.unsubscribe(session_id);
            }
        }
        info!(session = session_id, destination = dest_name, "unsubscribed");
        Ok(())
    }

    /// Acknowledge a delivery by the `message-id` token it carried.
    ///
    /// Returns whether the owning store held the message. Only then is the
    /// session released to receive its next message.
    pub fn ack(&mut self, session_id: &str, message_id: &str) -> BrokerResult<bool> {
        let token: MessageToken = message_id.parse()?;
        self.ensure_destination(&token.destination)?;

        let acked = match self.registry.get_mut(&token.destination) {
            Some(dest) => dest.ack(&token.record_id)?,
            None => false,
        };
        if !acked {
            warn!(session = session_id, message_id, "ack for a message that is not in use");
            return Ok(false);
        }

        if let Some(session) = self.sessions.get_mut(session_id) {
            session.ack_received();
            self.drain(session_id, None)?;
        }
        Ok(true)
    }

    /// Destroy a destination: unsubscribe everyone and delete its file.
    pub fn destroy_destination(&mut self, name: &str) -> BrokerResult<bool> {
        Ok(self.registry.destroy(name, &mut self.sessions)?)
    }

    /// Get-or-create `name`, then feed any sessions a wildcard attached to it.
    fn ensure_destination(&mut self, name: &str) -> BrokerResult<()> {
        let (_, attached) = self.registry.get_or_create(name, &mut self.sessions)?;
        for session_id in attached {
            self.drain(&session_id, Some(name))?;
        }
        Ok(())
    }

    /// Attach a new wildcard pattern to destinations that already exist.
    fn attach_existing(&mut self, pattern: &str, auto_ack: bool, session_id: &str) {
        let Some(session) = self.sessions.get_mut(session_id) else {
            return;
        };
        let Some(parent) = session.subscription(pattern).cloned() else {
            return;
        };
        let matching: Vec<String> = self
            .registry
            .names()
            .filter(|name| *name != pattern && parent.matches(name))
            .map(str::to_string)
            .collect();

        for name in matching {
            if session.add_subscription(Subscription::derived(&name, auto_ack)) {
                if let Some(dest) = self.registry.get_mut(&name) {
                    dest.subscribe(session_id);
                }
            }
        }
    }

    /// Offer the newest queue message to the next idle subscriber in
    /// rotation.
    fn dispatch_queue(&mut self, dest_name: &str) -> BrokerResult<()> {
        let subscribers = match self.registry.get(dest_name) {
            Some(dest) if !dest.is_topic() => dest.subscribers(),
            _ => return Ok(()),
        };

        for session_id in subscribers {
            let ready = self
                .sessions
                .get(&session_id)
                .is_some_and(Session::is_ready);
            if !ready {
                continue;
            }
            if self.pull(&session_id, Some(dest_name))? {
                if let Some(Destination::Queue(queue)) = self.registry.get_mut(dest_name) {
                    queue.rotate(&session_id);
                }
                break;
            }
        }
        Ok(())
    }

    /// Pull until the session is busy or has nothing left to receive.
    fn drain(&mut self, session_id: &str, only: Option<&str>) -> BrokerResult<usize> {
        let mut pulled = 0;
        while self.pull(session_id, only)? {
            pulled += 1;
        }
        Ok(pulled)
    }

    /// Deliver at most one message to an idle session, scanning its
    /// subscriptions in rotation order (or only `only`).
    fn pull(&mut self, session_id: &str, only: Option<&str>) -> BrokerResult<bool> {
        let Some(session) = self.sessions.get_mut(session_id) else {
            return Ok(false);
        };
        if !session.is_ready() {
            return Ok(false);
        }

        let candidates: Vec<(String, bool)> = session
            .subscriptions()
            .iter()
            .filter(|s| only.is_none_or(|name| s.destination == name))
            .map(|s| (s.destination.clone(), s.auto_ack))
            .collect();

        for (name, auto_ack) in candidates {
            let Some(dest) = self.registry.get_mut(&name) else {
                continue;
            };
            let Some(msg) = dest.receive(auto_ack)? else {
                continue;
            };

            session.deliver(Delivery {
                message_id: MessageToken::new(msg.id, &name).to_string(),
                destination: name.clone(),
                body: msg.body,
            });
            if !auto_ack {
                session.await_ack();
            }
            session.rotate_to_back(&name);
            return Ok(true);
        }
        Ok(false)
    }
}
