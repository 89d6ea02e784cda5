//! Destination registry
//!
//! Owns exactly one [`Destination`] per name for the broker's lifetime and
//! creates them lazily on first reference. When a destination is created,
//! every session holding a matching wildcard subscription is attached to it.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use tracing::{debug, info};

use super::destination::Destination;
use super::session::{Session, SessionId, Subscription};
use crate::persistence::{StoreConfig, validate_destination_name};
use crate::utils::error::StoreResult;

pub type SessionTable = HashMap<SessionId, Session>;

#[derive(Debug)]
pub struct DestinationRegistry {
    config: StoreConfig,
    destinations: HashMap<String, Destination>,
}

impl DestinationRegistry {
    /// Creates an empty registry.
    /// Queue stores opened later use `config` for their directory, fsync,
    /// lease and compaction settings.
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            destinations: HashMap::new(),
        }
    }

    /// Store settings shared by every queue this registry opens.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Looks up a live destination without creating it.
    /// Queues whose files exist on disk but were never referenced in this
    /// process are not loaded here; use `get_or_create` for that.
    pub fn get(&self, name: &str) -> Option<&Destination> {
        self.destinations.get(name)
    }

    /// Mutable lookup, used by the broker to send, receive and ack.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Destination> {
        self.destinations.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.destinations.contains_key(name)
    }

    /// Number of live destinations, queues and topics together.
    pub fn len(&self) -> usize {
        self.destinations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }

    /// Names of every live destination, in no particular order.
    /// A new wildcard subscription scans these to find what it should
    /// attach to.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.destinations.keys().map(String::as_str)
    }

    /// Return the destination called `name`, creating it if this is its
    /// first reference. The second value lists sessions that were attached
    /// through a wildcard subscription as a result of the creation.
    pub fn get_or_create(
        &mut self,
        name: &str,
        sessions: &mut SessionTable,
    ) -> StoreResult<(&mut Destination, Vec<SessionId>)> {
        match self.destinations.entry(name.to_string()) {
            Entry::Occupied(entry) => Ok((entry.into_mut(), Vec::new())),
            Entry::Vacant(entry) => {
                validate_destination_name(name)?;
                let dest = entry.insert(Destination::open(name, &self.config)?);
                info!(destination = name, topic = dest.is_topic(), "created destination");
                let attached = attach_wildcard_subscribers(dest, sessions);
                Ok((dest, attached))
            }
        }
    }

    /// Unsubscribe every bound session, then release the destination.
    /// Returns `false` if no destination had that name.
    pub fn destroy(&mut self, name: &str, sessions: &mut SessionTable) -> StoreResult<bool> {
        let Some(dest) = self.destinations.remove(name) else {
            return Ok(false);
        };
        for session_id in dest.subscribers() {
            if let Some(session) = sessions.get_mut(&session_id) {
                session.remove_subscription(name);
            }
        }
        dest.destroy()?;
        info!(destination = name, "destroyed destination");
        Ok(true)
    }
}

fn attach_wildcard_subscribers(dest: &mut Destination, sessions: &mut SessionTable) -> Vec<SessionId> {
    let name = dest.name().to_string();
    let mut attached = Vec::new();
    for session in sessions.values_mut() {
        let Some(auto_ack) = session.wildcard_parent(&name).map(|p| p.auto_ack) else {
            continue;
        };
        if session.add_subscription(Subscription::derived(&name, auto_ack)) {
            dest.subscribe(session.id());
            debug!(session = session.id(), destination = %name, "wildcard subscription attached");
            attached.push(session.id().to_string());
        }
    }
    attached
}
