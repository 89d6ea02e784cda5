use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::{Instant, timeout};
use tokio_util::codec::Framed;
use tracing::debug;
use uuid::Uuid;

use crate::transport::frame::{Command, Frame, StompCodec};
use crate::utils::error::ClientError;

const DEFAULT_RECEIPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Async STOMP client.
///
/// By default every command carries a `receipt` header and waits for the
/// matching RECEIPT, so a returned `Ok` means the broker has applied it.
/// Frames that arrive while waiting are buffered for [`next_frame`].
///
/// [`next_frame`]: StompClient::next_frame
pub struct StompClient {
    framed: Framed<TcpStream, StompCodec>,
    session_id: String,
    buffered: VecDeque<Frame>,
    wait_for_receipts: bool,
    receipt_timeout: Duration,
}

impl StompClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        let mut framed = Framed::new(stream, StompCodec::default());
        framed.send(Frame::new(Command::Connect)).await?;

        let connected = match framed.next().await {
            Some(frame) => frame?,
            None => return Err(ClientError::ConnectionClosed),
        };
        match connected.command {
            Command::Connected => {}
            Command::Error => return Err(server_error(&connected)),
            other => {
                return Err(ClientError::UnexpectedFrame {
                    command: other.to_string(),
                });
            }
        }
        let session_id = connected.get("session").unwrap_or_default().to_string();
        debug!(session = %session_id, "connected");

        Ok(Self {
            framed,
            session_id,
            buffered: VecDeque::new(),
            wait_for_receipts: true,
            receipt_timeout: DEFAULT_RECEIPT_TIMEOUT,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Turn receipts off to stream commands without a round trip each.
    pub fn set_wait_for_receipts(&mut self, wait: bool) {
        self.wait_for_receipts = wait;
    }

    pub fn set_receipt_timeout(&mut self, limit: Duration) {
        self.receipt_timeout = limit;
    }

    pub async fn send(
        &mut self,
        destination: &str,
        body: impl Into<Bytes>,
    ) -> Result<(), ClientError> {
        let frame = Frame::new(Command::Send)
            .header("destination", destination)
            .body(body);
        self.transmit(frame).await
    }

    pub async fn subscribe(&mut self, destination: &str, auto_ack: bool) -> Result<(), ClientError> {
        let ack = if auto_ack { "auto" } else { "client" };
        let frame = Frame::new(Command::Subscribe)
            .header("destination", destination)
            .header("ack", ack);
        self.transmit(frame).await
    }

    pub async fn unsubscribe(&mut self, destination: &str) -> Result<(), ClientError> {
        let frame = Frame::new(Command::Unsubscribe).header("destination", destination);
        self.transmit(frame).await
    }

    pub async fn ack(&mut self, message_id: &str) -> Result<(), ClientError> {
        let frame = Frame::new(Command::Ack).header("message-id", message_id);
        self.transmit(frame).await
    }

    pub async fn disconnect(mut self) -> Result<(), ClientError> {
        self.framed.send(Frame::new(Command::Disconnect)).await?;
        self.framed.close().await?;
        Ok(())
    }

    /// Next frame from the server, or `Ok(None)` if nothing arrives within
    /// `wait`. End of stream is [`ClientError::ConnectionClosed`].
    pub async fn next_frame(&mut self, wait: Duration) -> Result<Option<Frame>, ClientError> {
        if let Some(frame) = self.buffered.pop_front() {
            return Ok(Some(frame));
        }
        self.read_frame(wait).await
    }

    /// Send a raw frame, bypassing receipts.
    pub async fn send_frame(&mut self, frame: Frame) -> Result<(), ClientError> {
        self.framed.send(frame).await?;
        Ok(())
    }

    async fn transmit(&mut self, frame: Frame) -> Result<(), ClientError> {
        if !self.wait_for_receipts {
            return self.send_frame(frame).await;
        }

        let receipt = Uuid::new_v4().simple().to_string();
        self.send_frame(frame.header("receipt", receipt.clone())).await?;

        let deadline = Instant::now() + self.receipt_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(frame) = self.read_frame(remaining).await? else {
                return Err(ClientError::ReceiptTimeout { receipt });
            };
            match frame.command {
                Command::Receipt if frame.get("receipt-id") == Some(receipt.as_str()) => {
                    return Ok(());
                }
                Command::Error => return Err(server_error(&frame)),
                _ => self.buffered.push_back(frame),
            }
        }
    }

    async fn read_frame(&mut self, wait: Duration) -> Result<Option<Frame>, ClientError> {
        match timeout(wait, self.framed.next()).await {
            Err(_) => Ok(None),
            Ok(None) => Err(ClientError::ConnectionClosed),
            Ok(Some(frame)) => Ok(Some(frame?)),
        }
    }
}

fn server_error(frame: &Frame) -> ClientError {
    ClientError::Server {
        message: frame.get("message").unwrap_or_default().to_string(),
    }
}
