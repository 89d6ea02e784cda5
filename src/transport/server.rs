use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::{self, JoinHandle};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{Broker, SessionId};
use crate::client::Client;
use crate::config::ServerSettings;
use crate::transport::frame::{Command, Frame, StompCodec};
use crate::utils::error::{BrokerResult, ProtocolError};

pub type SharedBroker = Arc<Mutex<Broker>>;

/// Bind `addr` and serve STOMP connections until the task is dropped.
pub async fn start_server(
    addr: &str,
    broker: SharedBroker,
    settings: ServerSettings,
) -> io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("STOMP server listening on {}", listener.local_addr()?);
    serve(listener, broker, settings).await
}

/// Accept loop over an already bound listener.
pub async fn serve(
    listener: TcpListener,
    broker: SharedBroker,
    settings: ServerSettings,
) -> io::Result<()> {
    let read_timeout = settings.read_timeout();
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let broker = broker.clone();
        tokio::spawn(handle_connection(stream, peer, broker, read_timeout));
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    broker: SharedBroker,
    read_timeout: Option<Duration>,
) {
    debug!(%peer, "connection accepted");
    let (mut frame_sink, mut frames) = Framed::new(stream, StompCodec::default()).split();

    // Outbound frames from both the frame loop and the broker's deliveries
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = frame_sink.send(frame).await {
                warn!(%peer, "failed to write frame: {}", e);
                break;
            }
        }
    });

    // The id is fixed before any frame is read so the session can be
    // released even if the frame loop dies.
    let session_id: SessionId = Uuid::new_v4().simple().to_string();
    let mut conn = Connection::new(broker.clone(), tx, session_id.clone());
    let frame_loop = tokio::spawn(async move {
        loop {
            let next = match read_timeout {
                Some(limit) => match timeout(limit, frames.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        debug!(%peer, "no frame within {:?}", limit);
                        continue;
                    }
                },
                None => frames.next().await,
            };

            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    warn!(%peer, "unreadable frame: {}", e);
                    conn.reply(Frame::error(e.to_string()));
                    break;
                }
                None => break,
            };

            if conn.handle(frame).await == Flow::Close {
                break;
            }
        }
    });

    // Releasing the session drops the last sender, which ends the writer.
    release_session(frame_loop, &broker, &session_id).await;
    if let Err(e) = writer.await {
        error!(%peer, "writer task failed: {}", e);
    }
    info!(%peer, "connection closed");
}

/// Wait for a connection's frame loop, however it ends, then disconnect its
/// session. A read failure or a panic is an implicit DISCONNECT.
pub(crate) async fn release_session(
    frame_loop: JoinHandle<()>,
    broker: &SharedBroker,
    session_id: &str,
) {
    if let Err(e) = frame_loop.await {
        error!(session = session_id, "connection task failed: {}", e);
    }
    broker.lock().await.disconnect(session_id);
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// Per-connection protocol state.
struct Connection {
    broker: SharedBroker,
    outbound: UnboundedSender<Frame>,
    session_id: SessionId,
    connected: bool,
}

impl Connection {
    fn new(broker: SharedBroker, outbound: UnboundedSender<Frame>, session_id: SessionId) -> Self {
        Self {
            broker,
            outbound,
            session_id,
            connected: false,
        }
    }

    fn reply(&self, frame: Frame) {
        if self.outbound.send(frame).is_err() {
            debug!("writer gone, dropping reply");
        }
    }

    fn session(&self) -> Result<SessionId, ProtocolError> {
        if self.connected {
            Ok(self.session_id.clone())
        } else {
            Err(ProtocolError::NotConnected)
        }
    }

    /// Run `op` against the broker on the blocking pool. Broker operations
    /// read and write queue files, so they stay off the async workers.
    async fn with_broker<T, F>(&self, op: F) -> Result<T, ProtocolError>
    where
        F: FnOnce(&mut Broker) -> BrokerResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let broker = self.broker.clone();
        let result = task::spawn_blocking(move || op(&mut broker.blocking_lock())).await?;
        Ok(result?)
    }

    /// Run one client frame, answering its `receipt` on success and with
    /// ERROR on failure.
    async fn handle(&mut self, frame: Frame) -> Flow {
        let receipt = frame.get("receipt").map(str::to_string);
        let command = frame.command;
        match self.dispatch(frame).await {
            Ok(flow) => {
                if let Some(id) = receipt {
                    self.reply(Frame::new(Command::Receipt).header("receipt-id", id));
                }
                flow
            }
            Err(e) => {
                warn!(session = %self.session_id, connected = self.connected, %command, "rejected frame: {}", e);
                self.reply(Frame::error(e.to_string()));
                Flow::Continue
            }
        }
    }

    async fn dispatch(&mut self, frame: Frame) -> Result<Flow, ProtocolError> {
        match frame.command {
            Command::Connect => {
                let connected = self.connect().await?;
                self.reply(connected);
            }
            Command::Send => {
                let session_id = self.session()?;
                let destination = frame.require("destination")?.to_string();
                debug!(session = %session_id, %destination, "send");
                let body = frame.body;
                self.with_broker(move |broker| broker.send(&destination, body))
                    .await?;
            }
            Command::Subscribe => {
                let session_id = self.session()?;
                let destination = frame.require("destination")?.to_string();
                let auto_ack = frame.get("ack") != Some("client");
                self.with_broker(move |broker| broker.subscribe(&destination, auto_ack, &session_id))
                    .await?;
            }
            Command::Unsubscribe => {
                let session_id = self.session()?;
                let destination = frame.require("destination")?.to_string();
                self.with_broker(move |broker| broker.unsubscribe(&destination, &session_id))
                    .await?;
            }
            Command::Ack => {
                let session_id = self.session()?;
                let message_id = frame.require("message-id")?.to_string();
                self.with_broker(move |broker| broker.ack(&session_id, &message_id))
                    .await?;
            }
            Command::Disconnect => return Ok(Flow::Close),
            other => {
                return Err(ProtocolError::UnexpectedCommand {
                    command: other.to_string(),
                });
            }
        }
        Ok(Flow::Continue)
    }

    async fn connect(&mut self) -> Result<Frame, ProtocolError> {
        let session_id = self.session_id.clone();
        let sink = Client::new(session_id.clone(), self.outbound.clone());
        self.with_broker({
            let session_id = session_id.clone();
            move |broker| broker.open_session(&session_id, Box::new(sink))
        })
        .await?;
        self.connected = true;
        Ok(Frame::new(Command::Connected).header("session", session_id))
    }
}
