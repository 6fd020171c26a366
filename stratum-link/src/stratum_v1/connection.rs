//! One Stratum peer session over a TCP stream.
//!
//! A [`Connection`] owns the transport, the per-session protocol state
//! (identity, authorization flag, subscription token, activity timestamp,
//! last received command) and fans transport lifecycle signals out to any
//! number of subscribers as [`ConnectionEvent`]s.
//!
//! # Tasks
//!
//! Attaching a transport spawns a writer task that owns the write half and
//! drains a FIFO queue of outbound buffers, so bytes reach the stream in the
//! order the send calls were made. Each queued buffer carries a oneshot that
//! completes once the bytes are written and flushed. A reader task owns the
//! read half in both roles and reports end of stream and read failures. In
//! the client role it hands every received buffer to
//! [`Connection::handle_data`]; in the server role it queues the buffers for
//! the owner, who collects the queue with [`Connection::take_inbound`].
//!
//! Both tasks stop when the connection is closed, which drops both halves of
//! the stream. Handles are cheap clones of one shared session; the tasks
//! only hold weak references, so dropping the last handle closes it too.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::error::{MiningError, StratumError, StratumResult};
use super::inbound::{CommandDispatcher, CommandParser};
use super::messages::JsonRpcMessage;
use super::socket;
use crate::config::ConnectionConfig;

/// Completion of a queued write.
///
/// Resolves once the local transport has accepted and flushed the bytes.
/// This says nothing about whether the peer received or processed them.
pub type SendFuture = BoxFuture<'static, StratumResult<()>>;

/// Inbound buffers handed to server-role owners, in arrival order.
///
/// Yields `None` once the peer has closed, a read failed, or the connection
/// was closed locally.
pub type InboundStream = mpsc::Receiver<Vec<u8>>;

type ReadStream = Box<dyn AsyncRead + Send + Unpin>;
type OutboundStream = Box<dyn AsyncWrite + Send + Unpin>;

/// Outbound request ids start at 1 and are not advanced.
const REQUEST_ID: u64 = 1;

const READ_BUF_SIZE: usize = 4096;

/// Buffers held for a server-role owner before the reader waits.
const INBOUND_QUEUE: usize = 64;

/// Which side of the session this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The connection reads its own socket and dispatches what arrives.
    Client,
    /// An external owner reads the socket and feeds bytes in.
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    IPv4,
    IPv6,
}

/// Local address of a bound socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketAddress {
    pub address: IpAddr,
    pub port: u16,
    pub family: AddressFamily,
}

impl From<SocketAddr> for SocketAddress {
    fn from(addr: SocketAddr) -> Self {
        let family = match addr {
            SocketAddr::V4(_) => AddressFamily::IPv4,
            SocketAddr::V6(_) => AddressFamily::IPv6,
        };
        Self {
            address: addr.ip(),
            port: addr.port(),
            family,
        }
    }
}

/// Lifecycle signals, each tagged with the connection that raised it.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Peer closed its side of the stream
    Ended(Connection),

    /// Transport reported an error, or the connection was closed with a reason
    Errored { connection: Connection, reason: String },

    /// Every queued write has been flushed
    Drained(Connection),

    /// A send was refused locally
    ProtocolError {
        connection: Connection,
        error: MiningError,
    },
}

struct WriteRequest {
    bytes: Vec<u8>,
    done: oneshot::Sender<StratumResult<()>>,
}

struct SessionState {
    subscription: String,
    last_activity: OffsetDateTime,
    last_command: Option<JsonRpcMessage>,
}

/// Per-subscriber queues; closed subscribers are pruned on publish.
#[derive(Default)]
struct EventHub {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ConnectionEvent>>>,
}

impl EventHub {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    fn publish(&self, event: ConnectionEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

struct Inner {
    id: Uuid,
    role: Role,
    config: ConnectionConfig,
    authorized: AtomicBool,
    state: Mutex<SessionState>,
    local_addr: Mutex<Option<SocketAddr>>,

    write_tx: mpsc::UnboundedSender<WriteRequest>,
    /// Write queue receiver until a transport is attached
    pending_writes: Mutex<Option<mpsc::UnboundedReceiver<WriteRequest>>>,
    /// Inbound queue parked for a server-role owner
    inbound: Mutex<Option<InboundStream>>,

    parser: Mutex<Box<dyn CommandParser>>,
    dispatcher: Arc<dyn CommandDispatcher>,

    events: EventHub,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Handle to one Stratum peer session.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("authorized", &self.is_authorized())
            .finish()
    }
}

impl Connection {
    /// Create a connection with default transport settings.
    ///
    /// With `Some(stream)` the stream is configured and attached right away;
    /// with `None` the connection waits for [`connect`](Self::connect), and
    /// any sends issued in the meantime stay queued.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        stream: Option<TcpStream>,
        role: Role,
        parser: Box<dyn CommandParser>,
        dispatcher: Arc<dyn CommandDispatcher>,
    ) -> Self {
        Self::with_config(stream, role, parser, dispatcher, ConnectionConfig::default())
    }

    /// Create a connection with explicit transport settings.
    pub fn with_config(
        stream: Option<TcpStream>,
        role: Role,
        parser: Box<dyn CommandParser>,
        dispatcher: Arc<dyn CommandDispatcher>,
        config: ConnectionConfig,
    ) -> Self {
        let conn = Self::unattached(role, parser, dispatcher, config);
        if let Some(stream) = stream {
            conn.attach_tcp(stream);
        }
        conn
    }

    /// Create a connection over an arbitrary byte stream.
    ///
    /// No socket options are applied and [`address`](Self::address) reports
    /// [`StratumError::NotConnected`].
    pub fn with_transport<T>(
        io: T,
        role: Role,
        parser: Box<dyn CommandParser>,
        dispatcher: Arc<dyn CommandDispatcher>,
    ) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let conn = Self::unattached(role, parser, dispatcher, ConnectionConfig::default());
        let (reader, writer) = tokio::io::split(io);
        conn.attach(Box::new(reader), Box::new(writer), None);
        conn
    }

    fn unattached(
        role: Role,
        parser: Box<dyn CommandParser>,
        dispatcher: Arc<dyn CommandDispatcher>,
        config: ConnectionConfig,
    ) -> Self {
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        debug!(connection = %id, ?role, "Created connection");

        Self {
            inner: Arc::new(Inner {
                id,
                role,
                config,
                authorized: AtomicBool::new(false),
                state: Mutex::new(SessionState {
                    subscription: String::new(),
                    last_activity: OffsetDateTime::now_utc(),
                    last_command: None,
                }),
                local_addr: Mutex::new(None),
                write_tx,
                pending_writes: Mutex::new(Some(write_rx)),
                inbound: Mutex::new(None),
                parser: Mutex::new(parser),
                dispatcher,
                events: EventHub::default(),
                shutdown: CancellationToken::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn attach_tcp(&self, stream: TcpStream) -> bool {
        let stream = socket::configure(stream, &self.inner.config);
        let local_addr = stream.local_addr().ok();
        let (reader, writer) = stream.into_split();
        self.attach(Box::new(reader), Box::new(writer), local_addr)
    }

    /// Start the I/O tasks. Returns false if a transport was already
    /// attached or the connection is closed.
    fn attach(
        &self,
        reader: ReadStream,
        writer: OutboundStream,
        local_addr: Option<SocketAddr>,
    ) -> bool {
        let Some(write_rx) = self.inner.pending_writes.lock().take() else {
            return false;
        };
        *self.inner.local_addr.lock() = local_addr;

        let owner = match self.inner.role {
            Role::Client => None,
            Role::Server => {
                let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
                *self.inner.inbound.lock() = Some(rx);
                Some(tx)
            }
        };

        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(write_loop(self.downgrade(), shutdown.clone(), writer, write_rx));
        tokio::spawn(read_loop(self.downgrade(), shutdown, reader, owner));
        true
    }

    /// Connect to `addr` (`host:port`).
    ///
    /// Completes once the TCP handshake has finished. No timeout is applied;
    /// wrap the call in `tokio::time::timeout` to bound it.
    pub async fn connect(&self, addr: &str) -> StratumResult<()> {
        if self.inner.pending_writes.lock().is_none() {
            return Err(StratumError::ConnectionFailed(
                "transport already attached or connection closed".to_string(),
            ));
        }

        let stream = socket::connect(addr, &self.inner.config).await?;
        if !self.attach_tcp(stream) {
            return Err(StratumError::ConnectionFailed(
                "transport already attached or connection closed".to_string(),
            ));
        }
        Ok(())
    }

    /// Tear down the transport.
    ///
    /// Idempotent. Queued and later sends fail with
    /// [`StratumError::Disconnected`]. A `reason` is published to subscribers
    /// as [`ConnectionEvent::Errored`].
    pub fn close(&self, reason: Option<&str>) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(connection = %self.inner.id, reason, "Closing connection");

        self.inner.shutdown.cancel();
        *self.inner.local_addr.lock() = None;
        self.inner.inbound.lock().take();

        // Never attached: nobody else will fail the queued writes
        if let Some(mut write_rx) = self.inner.pending_writes.lock().take() {
            fail_queued(&mut write_rx);
        }

        if let Some(reason) = reason {
            self.publish(ConnectionEvent::Errored {
                connection: self.clone(),
                reason: reason.to_string(),
            });
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Local address of the socket.
    pub fn address(&self) -> StratumResult<SocketAddress> {
        self.inner
            .local_addr
            .lock()
            .map(SocketAddress::from)
            .ok_or(StratumError::NotConnected)
    }

    /// Globally unique identity of this session.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Id carried by every outbound request.
    pub fn request_id(&self) -> u64 {
        REQUEST_ID
    }

    pub fn is_authorized(&self) -> bool {
        self.inner.authorized.load(Ordering::SeqCst)
    }

    /// Record that the pool accepted this worker. There is no way back to
    /// unauthorized short of a new connection.
    pub fn mark_authorized(&self) {
        if !self.inner.authorized.swap(true, Ordering::SeqCst) {
            debug!(connection = %self.inner.id, "Worker authorized");
        }
    }

    pub fn subscription(&self) -> String {
        self.inner.state.lock().subscription.clone()
    }

    pub fn set_subscription(&self, subscription: impl Into<String>) {
        self.inner.state.lock().subscription = subscription.into();
    }

    pub fn last_activity(&self) -> OffsetDateTime {
        self.inner.state.lock().last_activity
    }

    /// Record activity at `time`, or now. An idle reaper compares this
    /// against its own deadline.
    pub fn set_last_activity(&self, time: Option<OffsetDateTime>) {
        self.inner.state.lock().last_activity = time.unwrap_or_else(OffsetDateTime::now_utc);
    }

    pub fn last_command(&self) -> Option<JsonRpcMessage> {
        self.inner.state.lock().last_command.clone()
    }

    pub fn set_last_command(&self, command: JsonRpcMessage) {
        self.inner.state.lock().last_command = Some(command);
    }

    /// Subscribe to lifecycle events of this connection.
    pub fn events(&self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    pub(super) fn publish(&self, event: ConnectionEvent) {
        self.inner.events.publish(event);
    }

    pub(super) fn dispatcher(&self) -> Arc<dyn CommandDispatcher> {
        self.inner.dispatcher.clone()
    }

    pub(super) fn parser(&self) -> &Mutex<Box<dyn CommandParser>> {
        &self.inner.parser
    }

    /// Collect the inbound queue in the server role.
    ///
    /// Returns `None` in the client role, before a transport is attached,
    /// after the first call, and after close.
    pub fn take_inbound(&self) -> Option<InboundStream> {
        self.inner.inbound.lock().take()
    }

    fn downgrade(&self) -> WeakConnection {
        WeakConnection {
            id: self.inner.id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Queue raw bytes for the transport.
    ///
    /// The bytes are queued before this returns, so consecutive calls reach
    /// the stream in call order whether or not the futures are awaited.
    pub fn send(&self, data: impl Into<Vec<u8>>) -> SendFuture {
        let bytes = data.into();
        trace!(
            connection = %self.inner.id,
            tx = %String::from_utf8_lossy(&bytes).trim_end(),
            "Sending"
        );

        let (done, completion) = oneshot::channel();
        let queued = self.inner.write_tx.send(WriteRequest { bytes, done });

        async move {
            queued.map_err(|_| StratumError::Disconnected)?;
            completion.await.map_err(|_| StratumError::Disconnected)?
        }
        .boxed()
    }
}

fn fail_queued(write_rx: &mut mpsc::UnboundedReceiver<WriteRequest>) {
    write_rx.close();
    while let Ok(request) = write_rx.try_recv() {
        let _ = request.done.send(Err(StratumError::Disconnected));
    }
}

/// Reference held by the I/O tasks.
struct WeakConnection {
    id: Uuid,
    inner: Weak<Inner>,
}

impl WeakConnection {
    fn upgrade(&self) -> Option<Connection> {
        self.inner.upgrade().map(|inner| Connection { inner })
    }

    fn publish(&self, event: impl FnOnce(Connection) -> ConnectionEvent) {
        if let Some(conn) = self.upgrade() {
            conn.publish(event(conn.clone()));
        }
    }
}

async fn write_loop(
    conn: WeakConnection,
    shutdown: CancellationToken,
    mut writer: OutboundStream,
    mut write_rx: mpsc::UnboundedReceiver<WriteRequest>,
) {
    loop {
        let request = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            request = write_rx.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let result = async {
            writer.write_all(&request.bytes).await?;
            writer.flush().await
        }
        .await;

        match result {
            Ok(()) => {
                let _ = request.done.send(Ok(()));
                if write_rx.is_empty() {
                    conn.publish(ConnectionEvent::Drained);
                }
            }
            Err(e) => {
                warn!(connection = %conn.id, error = %e, "Write failed");
                let reason = e.to_string();
                conn.publish(|connection| ConnectionEvent::Errored { connection, reason });
                let _ = request.done.send(Err(StratumError::TransportWrite {
                    connection: conn.id,
                    source: e,
                }));
                break;
            }
        }
    }

    fail_queued(&mut write_rx);
    let _ = writer.shutdown().await;
    trace!(connection = %conn.id, "Writer stopped");
}

async fn read_loop(
    conn: WeakConnection,
    shutdown: CancellationToken,
    mut reader: ReadStream,
    owner: Option<mpsc::Sender<Vec<u8>>>,
) {
    let mut buf = vec![0u8; READ_BUF_SIZE];

    loop {
        let n = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            n = reader.read(&mut buf) => n,
        };

        let data = match n {
            Ok(0) => {
                debug!(connection = %conn.id, "Connection closed by peer");
                conn.publish(ConnectionEvent::Ended);
                break;
            }
            Ok(n) => &buf[..n],
            Err(e) => {
                warn!(connection = %conn.id, error = %e, "Read failed");
                let reason = e.to_string();
                conn.publish(|connection| ConnectionEvent::Errored { connection, reason });
                break;
            }
        };

        match &owner {
            Some(owner) => {
                let queued = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    queued = owner.send(data.to_vec()) => queued,
                };
                if queued.is_err() {
                    trace!(connection = %conn.id, len = data.len(), "Owner gone, discarding inbound data");
                }
            }
            None => {
                let Some(handle) = conn.upgrade() else {
                    break;
                };
                if let Err(e) = handle.handle_data(data).await {
                    warn!(connection = %conn.id, error = %e, "Error handling inbound data");
                }
            }
        }
    }

    trace!(connection = %conn.id, "Reader stopped");
}

#[cfg(test)]
mod tests {
    use super::super::inbound::testing::{RecordingDispatcher, test_connection};
    use super::super::inbound::LineParser;
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> ConnectionEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event hub dropped")
    }

    #[tokio::test]
    async fn test_initial_state() {
        let (conn, _peer, _calls) = test_connection(Role::Client);

        assert!(!conn.is_authorized());
        assert_eq!(conn.subscription(), "");
        assert_eq!(conn.request_id(), 1);
        assert!(conn.last_command().is_none());
        assert!(!conn.is_closed());
        assert!(matches!(conn.address(), Err(StratumError::NotConnected)));
    }

    #[tokio::test]
    async fn test_identities_are_unique() {
        let mut ids = HashSet::new();
        for _ in 0..64 {
            let (conn, _peer, _calls) = test_connection(Role::Client);
            assert!(ids.insert(conn.id()));
        }
    }

    #[tokio::test]
    async fn test_mark_authorized_is_sticky() {
        let (conn, _peer, _calls) = test_connection(Role::Client);
        conn.mark_authorized();
        conn.mark_authorized();
        assert!(conn.is_authorized());
    }

    #[tokio::test]
    async fn test_set_last_activity_explicit_is_idempotent() {
        let (conn, _peer, _calls) = test_connection(Role::Client);
        let t = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();

        conn.set_last_activity(Some(t));
        conn.set_last_activity(Some(t));
        assert_eq!(conn.last_activity(), t);
    }

    #[tokio::test]
    async fn test_set_last_activity_now_is_non_decreasing() {
        let (conn, _peer, _calls) = test_connection(Role::Client);
        let created = conn.last_activity();

        conn.set_last_activity(None);
        let first = conn.last_activity();
        conn.set_last_activity(None);
        let second = conn.last_activity();

        assert!(first >= created);
        assert!(second >= first);
    }

    #[tokio::test]
    async fn test_set_last_command_overwrites() {
        let (conn, _peer, _calls) = test_connection(Role::Client);
        let first = JsonRpcMessage::notification("mining.notify", serde_json::json!([]));
        let second = JsonRpcMessage::notification("mining.set_difficulty", serde_json::json!([8]));

        conn.set_last_command(first);
        conn.set_last_command(second.clone());
        assert_eq!(conn.last_command(), Some(second));
    }

    #[tokio::test]
    async fn test_send_resolves_after_flush_and_reports_drain() {
        let (conn, peer, _calls) = test_connection(Role::Client);
        let mut events = conn.events();

        conn.send("hello\n").await.unwrap();

        let mut lines = BufReader::new(peer).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "hello");

        match next_event(&mut events).await {
            ConnectionEvent::Drained(c) => assert_eq!(c.id(), conn.id()),
            other => panic!("Expected Drained, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_order_matches_call_order_without_awaiting() {
        let (conn, peer, _calls) = test_connection(Role::Client);

        let first = conn.send("one\n");
        let second = conn.send("two\n");
        let third = conn.send("three\n");
        // Await out of order; the stream must still see call order
        third.await.unwrap();
        first.await.unwrap();
        second.await.unwrap();

        let mut lines = BufReader::new(peer).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "one");
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "two");
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "three");
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_fails_later_sends() {
        let (conn, _peer, _calls) = test_connection(Role::Client);

        conn.close(None);
        conn.close(None);
        assert!(conn.is_closed());

        let result = conn.send("late\n").await;
        assert!(matches!(result, Err(StratumError::Disconnected)));
    }

    #[tokio::test]
    async fn test_close_with_reason_publishes_error_once() {
        let (conn, _peer, _calls) = test_connection(Role::Client);
        let mut events = conn.events();

        conn.close(Some("idle timeout"));
        conn.close(Some("idle timeout"));

        match next_event(&mut events).await {
            ConnectionEvent::Errored { connection, reason } => {
                assert_eq!(connection.id(), conn.id());
                assert_eq!(reason, "idle timeout");
            }
            other => panic!("Expected Errored, got {:?}", other),
        }
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_peer_close_publishes_ended() {
        let (conn, peer, _calls) = test_connection(Role::Client);
        let mut events = conn.events();

        drop(peer);

        match next_event(&mut events).await {
            ConnectionEvent::Ended(c) => assert_eq!(c.id(), conn.id()),
            other => panic!("Expected Ended, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_write_to_dropped_peer_rejects_with_connection_id() {
        let (conn, peer, _calls) = test_connection(Role::Server);
        drop(peer);

        let result = conn.send("into the void\n").await;
        match result {
            Err(StratumError::TransportWrite { connection, .. }) => {
                assert_eq!(connection, conn.id())
            }
            other => panic!("Expected TransportWrite, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_events_reach_every_subscriber() {
        let (conn, _peer, _calls) = test_connection(Role::Client);
        let mut a = conn.events();
        let mut b = conn.events();

        conn.send("x\n").await.unwrap();

        assert!(matches!(next_event(&mut a).await, ConnectionEvent::Drained(_)));
        assert!(matches!(next_event(&mut b).await, ConnectionEvent::Drained(_)));
    }

    #[tokio::test]
    async fn test_server_role_queues_bytes_for_owner() {
        let (conn, mut peer, calls) = test_connection(Role::Server);

        peer.write_all(b"{\"method\":\"mining.notify\",\"id\":null,\"params\":[]}\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.count(), 0);

        // The owner gets the queue exactly once
        let mut inbound = conn.take_inbound().expect("inbound queue parked for owner");
        assert!(conn.take_inbound().is_none());

        let data = timeout(Duration::from_secs(5), inbound.recv())
            .await
            .unwrap()
            .unwrap();
        conn.handle_data(&data).await.unwrap();
        assert_eq!(calls.count(), 1);
    }

    #[tokio::test]
    async fn test_server_role_peer_close_publishes_ended() {
        let (conn, peer, _calls) = test_connection(Role::Server);
        let mut events = conn.events();
        let mut inbound = conn.take_inbound().unwrap();

        drop(peer);

        match next_event(&mut events).await {
            ConnectionEvent::Ended(c) => assert_eq!(c.id(), conn.id()),
            other => panic!("Expected Ended, got {:?}", other),
        }
        assert!(inbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_server_role_close_tears_down_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut miner = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (accepted, _) = listener.accept().await.unwrap();

        let conn = Connection::new(
            Some(accepted),
            Role::Server,
            Box::new(LineParser::new()),
            Arc::new(RecordingDispatcher::default()),
        );
        let mut inbound = conn.take_inbound().unwrap();

        conn.close(None);

        let mut buf = [0u8; 64];
        let n = timeout(Duration::from_secs(5), miner.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        let _ = miner.write_all(b"after close\n").await;
        let next = timeout(Duration::from_secs(5), inbound.recv()).await.unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_close_wins_over_queued_write() {
        let (conn, mut peer, _calls) = test_connection(Role::Client);

        let queued = conn.send("too late\n");
        conn.close(None);

        assert!(matches!(queued.await, Err(StratumError::Disconnected)));
        let mut received = Vec::new();
        timeout(Duration::from_secs(5), peer.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn test_dropping_last_handle_closes_transport() {
        let (conn, mut peer, _calls) = test_connection(Role::Client);
        conn.send("hi\n").await.unwrap();

        drop(conn);

        let mut received = Vec::new();
        timeout(Duration::from_secs(5), peer.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, b"hi\n");
    }

    #[tokio::test]
    async fn test_connect_over_tcp_reports_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(socket).lines();
            lines.next_line().await.unwrap()
        });

        let conn = Connection::new(
            None,
            Role::Client,
            Box::new(LineParser::new()),
            Arc::new(RecordingDispatcher::default()),
        );
        assert!(matches!(conn.address(), Err(StratumError::NotConnected)));

        // Queued before the transport exists
        let early = conn.send("queued\n");

        conn.connect(&addr.to_string()).await.unwrap();
        early.await.unwrap();

        let local = conn.address().unwrap();
        assert_eq!(local.family, AddressFamily::IPv4);
        assert_eq!(local.address, addr.ip());
        assert_ne!(local.port, 0);

        assert_eq!(server.await.unwrap().unwrap(), "queued");

        // A second connect is refused
        assert!(conn.connect(&addr.to_string()).await.is_err());

        conn.close(None);
        assert!(matches!(conn.address(), Err(StratumError::NotConnected)));
    }

    #[tokio::test]
    async fn test_close_before_connect_fails_queued_sends() {
        let conn = Connection::new(
            None,
            Role::Client,
            Box::new(LineParser::new()),
            Arc::new(RecordingDispatcher::default()),
        );
        let queued = conn.send("never\n");

        conn.close(None);

        assert!(matches!(queued.await, Err(StratumError::Disconnected)));
        assert!(conn.connect("127.0.0.1:1").await.is_err());
    }
}
