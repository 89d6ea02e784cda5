//! # PopMQ
//!
//! `popmq` is a small persistent message broker speaking STOMP over TCP.
//! Queues (`/queue/...` and any name not under `/topic/`) are backed by a
//! durable per-queue log and survive restarts; topics (`/topic/...`) fan
//! messages out to whoever is subscribed at the time.
//!
//! ## Core Modules
//!
//! - `persistence`: The append-only message log behind each queue, with crash
//!   recovery and compaction.
//! - `broker`: Destinations, sessions and the dispatch logic (wildcards, fair
//!   rotation, client-ack flow control).
//! - `transport`: The STOMP codec and the TCP server.
//! - `client`: The broker-side connection handle and an async STOMP client.
//! - `config`: Layered configuration loading.
//! - `utils`: Error types, logging setup and shared helpers.

pub mod broker;
pub mod client;
pub mod config;
pub mod persistence;
pub mod transport;
pub mod utils;
