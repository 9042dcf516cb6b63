//! Per-client connection handling.
//!
//! Each client gets a [`SocketSession`] (its [`Session`] face towards the
//! scheduler) and a [`ConnectionHandler`] that:
//! - Reads the first message: `status` (one-shot) or `subscribe`
//! - Admits the session to the requested feed
//! - Serves `pull`, `reply`, `status` and `unsubscribe` until EOF
//! - Disconnects the session from its feed on the way out
//!
//! Outbound frames go through a bounded queue drained by a writer task, so
//! timer ticks never wait on a socket.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - A failed write marks the session closed; it never propagates into a tick
//! - Connection errors are logged and result in graceful disconnect

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tickcast_core::{
    ConnectParams, FeedType, Interval, SendError, Session, SessionId, SessionProperties,
    SessionRef,
};
use tickcast_protocol::{ClientMessage, DaemonMessage, SubscriptionMode};

use crate::reply::{request_reply, ReplySlot};
use crate::scheduler::Scheduler;
use crate::service::IntervalBroadcastService;

/// Frames queued per client before sends start failing
const OUTBOUND_BUFFER: usize = 256;

/// Maximum client message size (1 MB), excluding the newline
pub const MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Write timeout (10 seconds)
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeouts applied to one connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    /// Time allowed for the first message
    pub handshake_timeout: Duration,
    /// Disconnect after this long without a client message
    pub idle_timeout: Option<Duration>,
    /// Longest wait in [`SocketSession::request_reply`]
    pub reply_timeout: Duration,
}

// ============================================================================
// Socket Session
// ============================================================================

/// A client connection seen as a [`Session`].
pub struct SocketSession {
    id: SessionId,
    open: Arc<AtomicBool>,
    outbound: mpsc::Sender<DaemonMessage>,
    closed: CancellationToken,
    properties: SessionProperties,
    replies: ReplySlot,
    reply_timeout: Duration,
}

impl SocketSession {
    /// Creates the session and starts its writer task.
    ///
    /// `reply_timeout` bounds [`request_reply`](Self::request_reply).
    pub fn spawn(id: SessionId, writer: OwnedWriteHalf, reply_timeout: Duration) -> Arc<Self> {
        let (outbound, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let open = Arc::new(AtomicBool::new(true));
        let closed = CancellationToken::new();

        tokio::spawn(write_loop(
            id.clone(),
            BufWriter::new(writer),
            rx,
            Arc::clone(&open),
            closed.clone(),
        ));

        Arc::new(Self {
            id,
            open,
            outbound,
            closed,
            properties: SessionProperties::new(),
            replies: ReplySlot::new(),
            reply_timeout,
        })
    }

    /// Queues a control frame.
    pub fn send_message(&self, msg: DaemonMessage) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::Closed(self.id.clone()));
        }
        self.outbound.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                SendError::Transport("outbound queue full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => SendError::Closed(self.id.clone()),
        })
    }

    /// Replies received from the client.
    pub fn replies(&self) -> &ReplySlot {
        &self.replies
    }

    /// Pushes `prompt` and waits for the client's `reply` frame.
    ///
    /// Gives up with `Ok(None)` after the configured reply timeout.
    pub async fn request_reply(&self, prompt: &str) -> Result<Option<String>, SendError> {
        request_reply(self, &self.replies, prompt, self.reply_timeout).await
    }

    /// Token cancelled once the session closes.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

impl Session for SocketSession {
    fn id(&self) -> &SessionId {
        &self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send(&self, text: &str) -> Result<(), SendError> {
        self.send_message(DaemonMessage::push(text))
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.closed.cancel();
    }

    fn properties(&self) -> &SessionProperties {
        &self.properties
    }
}

/// Drains the outbound queue into the socket.
///
/// Frames queued before the session closed are still written.
async fn write_loop(
    id: SessionId,
    mut writer: BufWriter<OwnedWriteHalf>,
    mut rx: mpsc::Receiver<DaemonMessage>,
    open: Arc<AtomicBool>,
    closed: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            biased;
            msg = rx.recv() => msg,
            _ = closed.cancelled() => None,
        };
        let Some(msg) = msg else { break };

        if let Err(e) = write_frame(&mut writer, &msg).await {
            debug!(session_id = %id, error = %e, "Write failed, closing session");
            open.store(false, Ordering::SeqCst);
            closed.cancel();
            return;
        }
    }

    while let Ok(msg) = rx.try_recv() {
        if write_frame(&mut writer, &msg).await.is_err() {
            break;
        }
    }
    open.store(false, Ordering::SeqCst);
    let _ = writer.shutdown().await;
}

/// Writes one JSON line.
pub(crate) async fn write_frame<W>(writer: &mut W, msg: &DaemonMessage) -> Result<(), ConnectionError>
where
    W: AsyncWrite + Unpin,
{
    let json =
        serde_json::to_string(msg).map_err(|e| ConnectionError::ParseError(e.to_string()))?;

    match timeout(WRITE_TIMEOUT, async {
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok::<(), std::io::Error>(())
    })
    .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ConnectionError::Io(e.to_string())),
        Err(_) => Err(ConnectionError::WriteTimeout),
    }
}

// ============================================================================
// Connection Handler
// ============================================================================

/// Connection handler for a single client.
pub struct ConnectionHandler {
    reader: BufReader<OwnedReadHalf>,
    session: Arc<SocketSession>,
    scheduler: Arc<Scheduler>,
    settings: ConnectionSettings,
    shutdown: CancellationToken,
    service: Option<Arc<IntervalBroadcastService>>,
    connection_number: u64,
}

impl ConnectionHandler {
    pub fn new(
        stream: UnixStream,
        scheduler: Arc<Scheduler>,
        settings: ConnectionSettings,
        shutdown: CancellationToken,
        connection_number: u64,
    ) -> Self {
        let (reader, writer) = stream.into_split();
        let session = SocketSession::spawn(
            SessionId::new(format!("session-{connection_number}")),
            writer,
            settings.reply_timeout,
        );
        Self {
            reader: BufReader::new(reader),
            session,
            scheduler,
            settings,
            shutdown,
            service: None,
            connection_number,
        }
    }

    pub fn session(&self) -> &Arc<SocketSession> {
        &self.session
    }

    /// Runs the connection until the client leaves or the server stops.
    pub async fn run(mut self) {
        debug!(connection = self.connection_number, "New client connected");

        match self.handle_handshake().await {
            Ok(true) => {
                if let Err(e) = self.process_messages().await {
                    debug!(session_id = %self.session.id(), error = %e, "Connection closed");
                }
            }
            Ok(false) => {}
            Err(e) => {
                warn!(connection = self.connection_number, error = %e, "Handshake failed");
                let _ = self.session.send_message(DaemonMessage::error(&e.to_string()));
            }
        }

        if let Some(service) = self.service.take() {
            service.disconnect(self.session.as_ref());
        }
        self.session.close();
        debug!(session_id = %self.session.id(), "Client disconnected");
    }

    /// Handles the first message. Returns whether to enter the message loop.
    async fn handle_handshake(&mut self) -> Result<bool, ConnectionError> {
        let msg = timeout(self.settings.handshake_timeout, self.read_message())
            .await
            .map_err(|_| ConnectionError::Timeout)??;

        match msg {
            ClientMessage::Status => {
                self.send(DaemonMessage::status(self.scheduler.status()))?;
                Ok(false)
            }
            ClientMessage::Subscribe {
                feed,
                interval,
                query,
            } => self.subscribe(feed, interval, query.as_deref()),
            other => Err(ConnectionError::UnexpectedMessage(format!(
                "expected subscribe or status, got {other:?}"
            ))),
        }
    }

    fn subscribe(
        &mut self,
        feed: FeedType,
        interval: Option<Interval>,
        query: Option<&str>,
    ) -> Result<bool, ConnectionError> {
        let service = self
            .scheduler
            .service(&feed)
            .ok_or_else(|| ConnectionError::UnknownFeed(feed.clone()))?;
        let params = ConnectParams::from_query(query.unwrap_or_default());

        // Acknowledge first: the first tick of a new cohort fires immediately
        if let Some(interval) = interval {
            let (mode, key) = if interval.is_active() {
                (SubscriptionMode::Active, None)
            } else {
                (SubscriptionMode::Passive, Some(service.group_key_for(&params)))
            };
            self.send(DaemonMessage::subscribed(self.session.id().clone(), mode, key))?;
        }

        let session: SessionRef = self.session.clone();
        match service.connect(session, interval, &params) {
            Ok(mode) => {
                info!(
                    session_id = %self.session.id(),
                    feed = %feed,
                    mode = ?mode,
                    "Client subscribed"
                );
                self.service = Some(service);
                Ok(true)
            }
            Err(e) => {
                debug!(session_id = %self.session.id(), error = %e, "Subscription rejected");
                Ok(false)
            }
        }
    }

    async fn process_messages(&mut self) -> Result<(), ConnectionError> {
        let shutdown = self.shutdown.clone();
        let closed = self.session.closed_token();
        let session_id = self.session.id().clone();

        loop {
            let read = tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(session_id = %session_id, "Server shutting down");
                    return Ok(());
                }
                _ = closed.cancelled() => return Ok(()),
                read = self.next_message() => read,
            };

            match read {
                Ok(msg) => match self.handle_message(msg).await {
                    Ok(true) => {}
                    Ok(false) => return Ok(()),
                    Err(e) => {
                        warn!(session_id = %self.session.id(), error = %e, "Error handling message");
                        let _ = self.send(DaemonMessage::error(&e.to_string()));
                    }
                },
                Err(ConnectionError::Eof) => {
                    debug!(session_id = %self.session.id(), "Client sent EOF");
                    return Ok(());
                }
                Err(e @ ConnectionError::ParseError(_)) => {
                    let _ = self.send(DaemonMessage::error(&e.to_string()));
                }
                Err(e @ ConnectionError::MessageTooLarge { .. }) => {
                    let _ = self.send(DaemonMessage::error(&e.to_string()));
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Handles one message. Returns `false` when the client is leaving.
    async fn handle_message(&mut self, msg: ClientMessage) -> Result<bool, ConnectionError> {
        match msg {
            ClientMessage::Pull => {
                let service = self
                    .service
                    .clone()
                    .ok_or_else(|| ConnectionError::UnexpectedMessage("not subscribed".to_string()))?;
                let text = tokio::task::spawn_blocking(move || service.pull())
                    .await
                    .map_err(|e| ConnectionError::Internal(e.to_string()))?;
                self.send(DaemonMessage::push(&text))?;
            }

            ClientMessage::Reply { text } => {
                debug!(session_id = %self.session.id(), "Reply received");
                self.session.replies().fulfill(text);
            }

            ClientMessage::Status => {
                self.send(DaemonMessage::status(self.scheduler.status()))?;
            }

            ClientMessage::Unsubscribe => {
                debug!(session_id = %self.session.id(), "Client unsubscribed");
                return Ok(false);
            }

            ClientMessage::Subscribe { .. } => {
                return Err(ConnectionError::UnexpectedMessage(
                    "already subscribed".to_string(),
                ));
            }
        }
        Ok(true)
    }

    async fn next_message(&mut self) -> Result<ClientMessage, ConnectionError> {
        match self.settings.idle_timeout {
            Some(limit) => timeout(limit, self.read_message())
                .await
                .map_err(|_| ConnectionError::Timeout)?,
            None => self.read_message().await,
        }
    }

    /// Reads a single message from the client.
    ///
    /// Never buffers more than `MAX_MESSAGE_SIZE + 1` bytes, newline or not.
    async fn read_message(&mut self) -> Result<ClientMessage, ConnectionError> {
        let mut line = Vec::new();
        let limit = MAX_MESSAGE_SIZE as u64 + 1;

        let bytes_read = (&mut self.reader)
            .take(limit)
            .read_until(b'\n', &mut line)
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        if bytes_read == 0 {
            return Err(ConnectionError::Eof);
        }

        let payload = line.strip_suffix(b"\n").unwrap_or(&line);
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(ConnectionError::MessageTooLarge {
                size: line.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        serde_json::from_slice(payload).map_err(|e| ConnectionError::ParseError(e.to_string()))
    }

    fn send(&self, msg: DaemonMessage) -> Result<(), ConnectionError> {
        self.session
            .send_message(msg)
            .map_err(|e| ConnectionError::Send(e.to_string()))
    }
}

/// Errors that can occur during connection handling.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Unknown feed: {0}")]
    UnknownFeed(FeedType),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Connection closed")]
    Eof,

    #[error("Read timeout")]
    Timeout,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Internal error: {0}")]
    Internal(String),
}
