//! The `broker` module routes messages between sessions and destinations.
//!
//! - [`registry`] owns one [`Destination`] per name and attaches wildcard
//!   subscribers when a destination is first referenced.
//! - [`session`] holds a client's subscriptions and its ack state.
//! - [`engine`] is the [`Broker`] itself: the operations the protocol layer
//!   calls, plus the pull loop that feeds idle sessions.
//!
//! Sessions and destinations refer to each other by name only; the broker
//! owns both sides.

pub mod destination;
pub mod engine;
pub mod message;
pub mod registry;
pub mod session;
pub mod topic;

pub use destination::{Destination, QueueDestination, TOPIC_PREFIX};
pub use engine::Broker;
pub use message::{Delivery, MessageToken};
pub use registry::DestinationRegistry;
pub use session::{DeliverySink, Session, SessionId, SessionState, Subscription};
pub use topic::TopicFanout;
