//! Integration tests for the Unix socket push server.
//!
//! These tests run a DaemonServer on a temporary socket and talk to it with
//! the JSON-lines protocol: subscriptions, pushes, pulls, status queries and
//! graceful shutdown.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

mod common;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use common::fixed;
use tempfile::TempDir;
use tickcast_core::{FeedType, GroupKey, Interval};
use tickcast_protocol::{ClientMessage, DaemonMessage, SubscriptionMode};
use tickcastd::config::DaemonConfig;
use tickcastd::server::{request_status, DaemonServer, MAX_MESSAGE_SIZE};
use tickcastd::Scheduler;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Constants
// ============================================================================

/// Maximum time to wait for server socket to appear
const SOCKET_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Interval between socket existence checks
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Maximum time to wait for one frame
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Test Helpers
// ============================================================================

/// Test server context that manages server lifecycle and cleanup.
struct TestServer {
    socket_path: PathBuf,
    scheduler: Arc<Scheduler>,
    cancel_token: CancellationToken,
    _temp_dir: TempDir,
}

impl TestServer {
    async fn spawn() -> Self {
        Self::spawn_with(|_| {}).await
    }

    async fn spawn_with(adjust: impl FnOnce(&mut DaemonConfig)) -> Self {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        let socket_path = temp_dir.path().join("test.sock");

        let mut config = DaemonConfig {
            socket_path: socket_path.clone(),
            ..DaemonConfig::default()
        };
        adjust(&mut config);

        let scheduler = Arc::new(Scheduler::new(config.scheduler.clone()).unwrap());
        scheduler.register_feed("quotes", fixed("X"));

        let cancel_token = CancellationToken::new();
        let server = DaemonServer::new(&config, Arc::clone(&scheduler), cancel_token.clone());
        tokio::spawn(async move {
            let _ = server.run().await;
        });

        let start = tokio::time::Instant::now();
        while start.elapsed() < SOCKET_WAIT_TIMEOUT && !socket_path.exists() {
            sleep(SOCKET_POLL_INTERVAL).await;
        }
        assert!(
            socket_path.exists(),
            "Server socket did not appear within {SOCKET_WAIT_TIMEOUT:?}"
        );

        Self {
            socket_path,
            scheduler,
            cancel_token,
            _temp_dir: temp_dir,
        }
    }

    async fn connect(&self) -> TestClient {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .expect("connect to server");
        TestClient::new(stream)
    }
}

/// Test client connection with protocol helpers.
struct TestClient {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: tokio::net::unix::OwnedWriteHalf,
}

impl TestClient {
    fn new(stream: UnixStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn send(&mut self, msg: ClientMessage) {
        let json = serde_json::to_string(&msg).unwrap();
        self.writer.write_all(json.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn send_bytes(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    /// Next frame, or `None` on EOF.
    async fn recv(&mut self) -> Option<DaemonMessage> {
        let mut line = String::new();
        let read = timeout(RECV_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("frame within timeout")
            .unwrap();
        if read == 0 {
            return None;
        }
        Some(serde_json::from_str(&line).unwrap())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_passive_subscribe_receives_ack_then_pushes() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    client
        .send(ClientMessage::subscribe("quotes", Some(1), Some("token=t&zone=A")))
        .await;

    match client.recv().await {
        Some(DaemonMessage::Subscribed {
            mode, group_key, ..
        }) => {
            assert_eq!(mode, SubscriptionMode::Passive);
            assert_eq!(group_key, Some(GroupKey::new("zone=A")));
        }
        other => panic!("expected subscribed, got {other:?}"),
    }
    assert_eq!(client.recv().await, Some(DaemonMessage::push("X")));
    assert_eq!(client.recv().await, Some(DaemonMessage::push("X")));

    server.cancel_token.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_active_subscribe_pulls_on_demand() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    client.send(ClientMessage::subscribe("quotes", Some(0), None)).await;
    assert!(matches!(
        client.recv().await,
        Some(DaemonMessage::Subscribed { mode: SubscriptionMode::Active, group_key: None, .. })
    ));

    client.send(ClientMessage::Pull).await;
    assert_eq!(client.recv().await, Some(DaemonMessage::push("X")));

    let counts = server.scheduler.service(&FeedType::new("quotes")).unwrap().counts();
    assert_eq!(counts.active_sessions, 1);

    server.cancel_token.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_subscribe_without_interval_is_rejected_and_closed() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    client.send(ClientMessage::subscribe("quotes", None, Some("zone=A"))).await;

    match client.recv().await {
        Some(DaemonMessage::Push { text }) => assert!(text.contains("interval is required")),
        other => panic!("expected rejection text, got {other:?}"),
    }
    assert_eq!(client.recv().await, None);

    let status = server.scheduler.status();
    assert_eq!(status.overview.total_sessions, 0);
    assert_eq!(status.feed(&FeedType::new("quotes")).map(|f| f.group_count()), Some(0));

    server.cancel_token.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_feed_returns_error() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    client.send(ClientMessage::subscribe("missing", Some(5), None)).await;

    match client.recv().await {
        Some(DaemonMessage::Error { message }) => assert!(message.contains("missing")),
        other => panic!("expected error, got {other:?}"),
    }
    assert_eq!(client.recv().await, None);

    server.cancel_token.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_malformed_message_keeps_connection() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;
    client.send(ClientMessage::subscribe("quotes", Some(0), None)).await;
    client.recv().await;

    client.send_raw("{not json").await;
    assert!(matches!(client.recv().await, Some(DaemonMessage::Error { .. })));

    client.send(ClientMessage::Pull).await;
    assert_eq!(client.recv().await, Some(DaemonMessage::push("X")));

    server.cancel_token.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_oversized_line_without_newline_is_rejected() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    // No newline: the server must give up at the size limit
    client.send_bytes(&vec![b'a'; MAX_MESSAGE_SIZE + 1]).await;

    match client.recv().await {
        Some(DaemonMessage::Error { message }) => assert!(message.contains("too large")),
        other => panic!("expected size error, got {other:?}"),
    }
    assert_eq!(client.recv().await, None);

    server.cancel_token.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_oversized_message_after_subscribe_closes_connection() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;
    client.send(ClientMessage::subscribe("quotes", Some(0), None)).await;
    client.recv().await;

    client.send_bytes(&vec![b' '; MAX_MESSAGE_SIZE + 1]).await;

    assert!(matches!(client.recv().await, Some(DaemonMessage::Error { .. })));
    assert_eq!(client.recv().await, None);
    let scheduler = Arc::clone(&server.scheduler);
    assert!(
        common::wait_until(RECV_TIMEOUT, move || scheduler.status().overview.total_sessions == 0)
            .await
    );

    server.cancel_token.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disconnect_removes_session_and_status_reports_it() {
    let server = TestServer::spawn().await;
    let mut first = server.connect().await;
    let mut second = server.connect().await;

    first.send(ClientMessage::subscribe("quotes", Some(60), Some("zone=A"))).await;
    second.send(ClientMessage::subscribe("quotes", Some(60), Some("zone=A"))).await;
    first.recv().await;
    second.recv().await;

    let snapshot = request_status(&server.socket_path).await.unwrap();
    let feed = snapshot.feed(&FeedType::new("quotes")).unwrap();
    let group = feed.group(&GroupKey::new("zone=A"), Interval::from_secs(60)).unwrap();
    assert_eq!(group.session_ids.len(), 2);
    assert!(group.timer_attached);

    first.send(ClientMessage::Unsubscribe).await;
    drop(second);

    let scheduler = Arc::clone(&server.scheduler);
    assert!(
        common::wait_until(RECV_TIMEOUT, move || scheduler.status().overview.total_sessions == 0)
            .await
    );

    server.cancel_token.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connection_limit() {
    let server = TestServer::spawn_with(|config| config.max_connections = 1).await;
    let mut first = server.connect().await;
    first.send(ClientMessage::subscribe("quotes", Some(0), None)).await;
    first.recv().await;

    let mut second = server.connect().await;
    match second.recv().await {
        Some(DaemonMessage::Error { message }) => assert!(message.contains("Too many clients")),
        other => panic!("expected rejection, got {other:?}"),
    }

    server.cancel_token.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_removes_socket_and_closes_clients() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;
    client.send(ClientMessage::subscribe("quotes", Some(0), None)).await;
    client.recv().await;

    server.cancel_token.cancel();

    assert_eq!(client.recv().await, None);
    let socket_path = server.socket_path.clone();
    assert!(common::wait_until(RECV_TIMEOUT, move || !socket_path.exists()).await);
}
