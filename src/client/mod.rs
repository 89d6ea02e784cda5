//! The `client` module holds both ends of a STOMP connection as seen from
//! this crate.
//!
//! - [`Client`] is the broker-side handle for a connected session: it turns
//!   deliveries into MESSAGE frames on the connection's outbound channel.
//! - [`StompClient`] is an async client used by the CLI and the tests to
//!   talk to a running server.

pub mod pubsub_client;
pub mod stomp_client;

pub use pubsub_client::Client;
pub use stomp_client::StompClient;
