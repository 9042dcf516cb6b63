//! Unix socket push server.
//!
//! The server:
//! - Listens on a Unix socket for client connections
//! - Spawns a ConnectionHandler for each client
//! - Caps the number of concurrent connections
//! - Supports graceful shutdown via CancellationToken
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  DaemonServer   │
//! │                 │
//! │  UnixListener   │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐  connect/  ┌──────────────────────────┐
//! │ConnectionHandler│──────────▶│ IntervalBroadcastService │
//! │   (per client)  │ disconnect │       (per feed)         │
//! └───────┬─────────┘            └────────────┬─────────────┘
//!         │ SocketSession                     │ cohort ticks
//!         ▼                                   ▼
//! ┌─────────────────┐            ┌──────────────────────────┐
//! │  writer task    │◀───────────│       Broadcaster        │
//! │ (outbound queue)│   push     └──────────────────────────┘
//! └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Accept errors are logged and the server keeps accepting
//! - The socket file is removed on shutdown

mod connection;

pub use connection::{
    ConnectionError, ConnectionHandler, ConnectionSettings, SocketSession, MAX_MESSAGE_SIZE,
};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tickcast_protocol::{ClientMessage, DaemonMessage, StatusSnapshot};

use crate::config::DaemonConfig;
use crate::scheduler::Scheduler;

/// Time allowed for a status query round trip
const STATUS_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Unix socket server for the daemon.
pub struct DaemonServer {
    /// Path to the Unix socket
    socket_path: PathBuf,

    scheduler: Arc<Scheduler>,

    settings: ConnectionSettings,

    max_connections: usize,

    /// Cancellation token for graceful shutdown
    cancel_token: CancellationToken,

    /// Connection counter for generating session IDs
    connection_counter: AtomicU64,

    /// Connections currently being served
    open_connections: Arc<AtomicUsize>,
}

impl DaemonServer {
    pub fn new(
        config: &DaemonConfig,
        scheduler: Arc<Scheduler>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            socket_path: config.socket_path.clone(),
            scheduler,
            settings: ConnectionSettings {
                handshake_timeout: config.handshake_timeout(),
                idle_timeout: config.idle_timeout(),
                reply_timeout: config.scheduler.reply_timeout(),
            },
            max_connections: config.max_connections,
            cancel_token,
            connection_counter: AtomicU64::new(0),
            open_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn open_connections(&self) -> usize {
        self.open_connections.load(Ordering::SeqCst)
    }

    /// Runs the server until the cancellation token is triggered.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind()?;

        info!(socket = %self.socket_path.display(), "Push server listening");

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Server shutdown requested");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let conn_num = self.connection_counter.fetch_add(1, Ordering::Relaxed);
                            self.handle_connection(stream, conn_num);
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }

        self.cleanup();
        Ok(())
    }

    fn bind(&self) -> Result<UnixListener, ServerError> {
        let setup_error = |e: std::io::Error| ServerError::SocketSetup {
            path: self.socket_path.clone(),
            error: e.to_string(),
        };

        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(setup_error)?;
        }
        if let Some(parent) = self.socket_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(setup_error)?;
            }
        }
        UnixListener::bind(&self.socket_path).map_err(setup_error)
    }

    fn handle_connection(&self, stream: UnixStream, connection_number: u64) {
        if self.open_connections() >= self.max_connections {
            let err = ServerError::TooManyClients {
                max: self.max_connections,
            };
            warn!(connection = connection_number, error = %err, "Rejecting connection");
            tokio::spawn(reject(stream, err.to_string()));
            return;
        }

        self.open_connections.fetch_add(1, Ordering::SeqCst);
        let guard = ConnectionGuard(Arc::clone(&self.open_connections));
        let handler = ConnectionHandler::new(
            stream,
            Arc::clone(&self.scheduler),
            self.settings,
            self.cancel_token.child_token(),
            connection_number,
        );

        tokio::spawn(async move {
            let _guard = guard;
            handler.run().await;
        });
    }

    fn cleanup(&self) {
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(
                    socket = %self.socket_path.display(),
                    error = %e,
                    "Failed to remove socket file"
                );
            }
        }
        info!("Server cleanup complete");
    }
}

/// Decrements the open-connection count when a handler finishes.
struct ConnectionGuard(Arc<AtomicUsize>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn reject(stream: UnixStream, reason: String) {
    let (_, mut writer) = stream.into_split();
    if let Err(e) = connection::write_frame(&mut writer, &DaemonMessage::error(&reason)).await {
        debug!(error = %e, "Could not deliver rejection");
    }
}

/// Asks a running daemon for its status snapshot.
pub async fn request_status(socket_path: &Path) -> Result<StatusSnapshot, ServerError> {
    let client_error = |error: String| ServerError::Client {
        path: socket_path.to_path_buf(),
        error,
    };

    let exchange = async {
        let stream = UnixStream::connect(socket_path)
            .await
            .map_err(|e| client_error(e.to_string()))?;
        let (reader, mut writer) = stream.into_split();

        let mut request =
            serde_json::to_string(&ClientMessage::Status).map_err(|e| client_error(e.to_string()))?;
        request.push('\n');
        writer
            .write_all(request.as_bytes())
            .await
            .map_err(|e| client_error(e.to_string()))?;

        let mut line = String::new();
        BufReader::new(reader)
            .read_line(&mut line)
            .await
            .map_err(|e| client_error(e.to_string()))?;

        match serde_json::from_str::<DaemonMessage>(&line) {
            Ok(DaemonMessage::Status { snapshot }) => Ok(snapshot),
            Ok(DaemonMessage::Error { message }) => Err(client_error(message)),
            Ok(other) => Err(client_error(format!("unexpected response: {other:?}"))),
            Err(e) => Err(client_error(e.to_string())),
        }
    };

    timeout(STATUS_QUERY_TIMEOUT, exchange)
        .await
        .map_err(|_| client_error("timed out waiting for status".to_string()))?
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to setup socket at {path}: {error}")]
    SocketSetup { path: PathBuf, error: String },

    #[error("Too many clients (max: {max})")]
    TooManyClients { max: usize },

    #[error("Daemon query via {path} failed: {error}")]
    Client { path: PathBuf, error: String },

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_error_display() {
        let err = ServerError::SocketSetup {
            path: PathBuf::from("/tmp/test.sock"),
            error: "permission denied".to_string(),
        };
        assert!(err.to_string().contains("/tmp/test.sock"));
        assert!(err.to_string().contains("permission denied"));
    }

    #[test]
    fn test_max_clients_error() {
        let err = ServerError::TooManyClients { max: 3 };
        assert!(err.to_string().contains('3'));
    }

    #[tokio::test]
    async fn test_status_query_without_daemon_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = request_status(&dir.path().join("missing.sock")).await.unwrap_err();
        assert!(matches!(err, ServerError::Client { .. }));
    }
}
