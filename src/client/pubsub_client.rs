use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

use crate::broker::{Delivery, DeliverySink, SessionId};
use crate::transport::frame::{Command, Frame};

/// Represents a connected STOMP client on the broker side.
///
/// Each client is identified by the session id handed out in CONNECTED and
/// owns a channel (`sender`) feeding the connection's writer task.
#[derive(Debug, Clone)]
pub struct Client {
    /// Session id assigned at CONNECT.
    pub session_id: SessionId,

    /// Channel to send frames to the client.
    pub sender: UnboundedSender<Frame>,
}

impl Client {
    pub fn new(session_id: SessionId, sender: UnboundedSender<Frame>) -> Self {
        Self { session_id, sender }
    }
}

impl DeliverySink for Client {
    fn deliver(&self, delivery: Delivery) {
        let frame = Frame::new(Command::Message)
            .header("destination", delivery.destination)
            .header("message-id", delivery.message_id)
            .body(delivery.body);
        if self.sender.send(frame).is_err() {
            warn!(session = %self.session_id, "connection gone, dropping delivery");
        }
    }
}
