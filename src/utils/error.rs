//! The `error` module defines the error types used within `popmq`.
//!
//! Errors are grouped by the layer that raises them. Store-level conditions
//! that the broker treats as benign (acking an id that is not in use, for
//! instance) are not errors at all; they are logged where they happen.

use std::io;
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Failures raised by a queue's durable message log.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid destination name: {name:?}")]
    InvalidName { name: String },

    #[error("unsupported store file version {found}")]
    UnsupportedVersion { found: i32 },

    #[error("corrupt store file at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },

    #[error("message segment of {size} bytes exceeds the record format limit")]
    MessageTooLarge { size: usize },
}

/// Failures surfaced by broker operations to the protocol layer.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("malformed message id {token:?}")]
    InvalidMessageId { token: String },
}

/// Failures while decoding or encoding wire frames.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed frame: {reason}")]
    Malformed { reason: String },

    #[error("unknown command {command:?}")]
    UnknownCommand { command: String },

    #[error("missing header {header:?}")]
    MissingHeader { header: &'static str },
}

/// Reasons a server connection answers a frame with ERROR.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("not connected: send CONNECT first")]
    NotConnected,

    #[error("{command} is not accepted from clients")]
    UnexpectedCommand { command: String },

    #[error("broker task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Failures seen by the STOMP client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client i/o error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("unexpected {command} frame")]
    UnexpectedFrame { command: String },

    #[error("server error: {message}")]
    Server { message: String },

    #[error("no receipt for {receipt} in time")]
    ReceiptTimeout { receipt: String },
}
