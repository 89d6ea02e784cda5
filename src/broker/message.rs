//! Delivery types shared by the broker and the protocol layer.
//!
//! Every message handed to a consumer carries a `message-id` token of the
//! form `<record-id-hex>,<destination>`. The token is opaque to clients and
//! must be echoed back verbatim in an ACK; embedding the destination lets the
//! broker route the ack to the right store without a global id index.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use uuid::Uuid;

use crate::utils::error::BrokerError;

/// A message on its way to one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub destination: String,
    pub message_id: String,
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageToken {
    pub record_id: Uuid,
    pub destination: String,
}

impl MessageToken {
    pub fn new(record_id: Uuid, destination: &str) -> Self {
        Self {
            record_id,
            destination: destination.to_string(),
        }
    }
}

impl fmt::Display for MessageToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.record_id.simple(), self.destination)
    }
}

impl FromStr for MessageToken {
    type Err = BrokerError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        let invalid = || BrokerError::InvalidMessageId {
            token: token.to_string(),
        };
        let (id, destination) = token.split_once(',').ok_or_else(invalid)?;
        if destination.is_empty() {
            return Err(invalid());
        }
        let record_id = Uuid::try_parse(id).map_err(|_| invalid())?;
        Ok(Self::new(record_id, destination))
    }
}
