//! The `transport` module is responsible for network communication with
//! clients over STOMP.
//!
//! It defines the frame codec used on the wire and implements the TCP
//! server itself: accepting connections, decoding frames and forwarding
//! client requests to the broker.

pub mod frame;
pub mod server;

pub use frame::{Command, Frame, StompCodec};
pub use server::{SharedBroker, serve, start_server};
