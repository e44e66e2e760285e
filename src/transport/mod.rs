//! The one persistent connection to the matchmaking/presence service.
//!
//! Two independent directions of traffic run concurrently: a reader task
//! decodes frames off the decrypted stream and hands them to the registered
//! [`InboundHandler`]; a writer task drains the outbound queue. Connection
//! establishment is two-phase: the transport-level connect (which must see a
//! ServerInfo frame with an acceptable protocol version) followed by the
//! application-level login exchange. Nothing else is valid until both
//! succeeded.
//!
//! Failure semantics are deliberately blunt: a malformed frame, a version
//! mismatch or an unexpected frame kind tears the whole connection down; the
//! caller reconnects and re-authenticates from scratch. There is no
//! partial-stream recovery.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, warn};

use crate::config::ClientConfig;
use crate::protocol::frame::Frame;
use crate::protocol::{CommandId, ErrorCode, FrameKind, UserIdentity, PROTOCOL_VERSION};
use crate::transport::encryption::{Aes256GcmEncryption, FrameEncryption, NoEncryption};
use crate::util::buf::put_string;

pub mod encryption;

pub const MAX_FRAME_SIZE: usize = 256 * 1024;

/// Correlation id reserved for the transport's own login exchange; the
/// orchestrator's id allocator never produces it.
const LOGIN_CORRELATION_ID: u64 = 0;

#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Authenticated,
}

/// Consumer of inbound traffic. Decoding and cache mutation happen on the
/// reader task inside these calls; anything slow must be deferred.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn on_reply(&self, command: u16, correlation_id: u64, payload: Bytes);
    async fn on_notification(&self, command: u16, payload: Bytes);
    /// The connection is gone, and with it every outstanding request.
    async fn on_connection_lost(&self);
}

struct Connection {
    send_tx: mpsc::UnboundedSender<Frame>,
    shutdown_tx: watch::Sender<bool>,
    torn_down: AtomicBool,
}

/// The state both I/O loops and the public handle share.
struct TransportShared {
    state_tx: watch::Sender<ConnectionState>,
    connection: Mutex<Option<Arc<Connection>>>,
}

impl TransportShared {
    /// Tears the connection down exactly once; both I/O loops and the
    /// graceful path funnel through here.
    async fn teardown(&self, handler: &Arc<dyn InboundHandler>) {
        let connection = {
            let mut connection_slot = self.connection.lock().await;
            connection_slot.take()
        };
        let Some(connection) = connection else {
            return;
        };
        if connection.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        connection.shutdown_tx.send_replace(true);
        self.state_tx.send_replace(ConnectionState::Disconnected);
        handler.on_connection_lost().await;
        debug!("connection torn down");
    }
}

pub struct Transport {
    config: Arc<ClientConfig>,
    encryption: Arc<dyn FrameEncryption>,
    shared: Arc<TransportShared>,
    local_identity: std::sync::Mutex<Option<UserIdentity>>,
}

impl Transport {
    pub fn new(config: Arc<ClientConfig>) -> Transport {
        let encryption: Arc<dyn FrameEncryption> = match &config.encryption_key {
            Some(key) => Arc::new(Aes256GcmEncryption::new(key)),
            None => Arc::new(NoEncryption),
        };
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        Transport {
            config,
            encryption,
            shared: Arc::new(TransportShared {
                state_tx,
                connection: Mutex::new(None),
            }),
            local_identity: std::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// The identity the service acknowledged at login.
    pub fn local_identity(&self) -> Option<UserIdentity> {
        *self.local_identity.lock().expect("identity lock poisoned")
    }

    pub async fn wait_connected(&self) {
        self.wait_for_at_least(ConnectionState::Connected).await;
    }

    pub async fn wait_authenticated(&self) {
        self.wait_for_at_least(ConnectionState::Authenticated).await;
    }

    async fn wait_for_at_least(&self, target: ConnectionState) {
        let mut rx = self.shared.state_tx.subscribe();
        while *rx.borrow() < target {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    async fn wait_disconnected(&self) {
        let mut rx = self.shared.state_tx.subscribe();
        while *rx.borrow() != ConnectionState::Disconnected {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Establishes the connection and performs the two-phase handshake:
    /// ServerInfo version check, then the login exchange. Only after both
    /// succeed are the reader/writer loops spawned and other requests valid.
    pub async fn connect(&self, handler: Arc<dyn InboundHandler>) -> anyhow::Result<()> {
        let mut connection_slot = self.shared.connection.lock().await;
        if connection_slot.is_some() {
            bail!("already connected");
        }

        let stream = TcpStream::connect(&self.config.server_host).await?;
        let (mut read_half, mut write_half) = stream.into_split();

        let server_info = read_frame(&mut read_half, self.encryption.as_ref()).await?;
        if server_info.kind != FrameKind::ServerInfo {
            bail!("expected ServerInfo as the first frame, got {:?}", server_info.kind);
        }
        let version = server_info.server_info_version()?;
        if version != PROTOCOL_VERSION {
            bail!("server protocol version {} but this client requires {}", version, PROTOCOL_VERSION);
        }
        self.shared.state_tx.send_replace(ConnectionState::Connected);
        debug!("connected to {}, protocol version {}", self.config.server_host, version);

        let identity = self.login(&mut read_half, &mut write_half).await.inspect_err(|_| {
            self.shared.state_tx.send_replace(ConnectionState::Disconnected);
        })?;
        *self.local_identity.lock().expect("identity lock poisoned") = Some(identity);
        self.shared.state_tx.send_replace(ConnectionState::Authenticated);
        debug!("authenticated as {:?}", identity);

        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        let connection = Arc::new(Connection {
            send_tx,
            shutdown_tx,
            torn_down: AtomicBool::new(false),
        });
        *connection_slot = Some(connection.clone());

        tokio::spawn(run_reader(
            self.shared.clone(),
            self.encryption.clone(),
            connection.clone(),
            read_half,
            handler.clone(),
        ));
        tokio::spawn(run_writer(
            self.shared.clone(),
            self.encryption.clone(),
            connection,
            write_half,
            send_rx,
            handler,
        ));

        Ok(())
    }

    async fn login(&self, read_half: &mut OwnedReadHalf, write_half: &mut OwnedWriteHalf) -> anyhow::Result<UserIdentity> {
        let mut payload = BytesMut::new();
        put_string(&mut payload, &self.config.username);
        put_string(&mut payload, &self.config.password);
        put_string(&mut payload, &self.config.token);

        let request = Frame::request(CommandId::Login, LOGIN_CORRELATION_ID, payload.freeze());
        write_frame(write_half, self.encryption.as_ref(), &request).await?;

        let reply = read_frame(read_half, self.encryption.as_ref()).await?;
        if reply.kind != FrameKind::Reply
            || reply.command != u16::from(CommandId::Login)
            || reply.correlation_id != Some(LOGIN_CORRELATION_ID)
        {
            bail!("unexpected frame during login exchange: {:?}", reply.kind);
        }

        let mut cursor = crate::protocol::cursor::ByteCursor::new(reply.payload);
        let raw_error = cursor.get_u16();
        let identity = cursor.get_identity();
        if cursor.error() {
            bail!("malformed login reply");
        }
        match ErrorCode::try_from(raw_error) {
            Ok(ErrorCode::Ok) => Ok(identity),
            Ok(code) => bail!("login rejected: {:?}", code),
            Err(_) => bail!("login reply carries unknown error code {}", raw_error),
        }
    }

    /// Queues a frame for the writer task. Fails only when disconnected.
    pub async fn send(&self, frame: Frame) -> anyhow::Result<()> {
        let connection_slot = self.shared.connection.lock().await;
        let connection = connection_slot.as_ref().ok_or_else(|| anyhow!("not connected"))?;
        connection
            .send_tx
            .send(frame)
            .map_err(|_| anyhow!("connection is shutting down"))
    }

    /// Graceful disconnect: a Terminate request is queued as the connection's
    /// final frame (the writer closes after sending it), then teardown runs.
    /// Pending requests are abandoned, never completed.
    pub async fn disconnect(&self, handler: &Arc<dyn InboundHandler>) {
        let terminate = Frame::request(CommandId::Terminate, LOGIN_CORRELATION_ID, Bytes::new());
        match self.send(terminate).await {
            Ok(()) => self.wait_disconnected().await,
            Err(_) => self.shared.teardown(handler).await,
        }
    }
}

async fn run_reader(
    shared: Arc<TransportShared>,
    encryption: Arc<dyn FrameEncryption>,
    connection: Arc<Connection>,
    mut read_half: OwnedReadHalf,
    handler: Arc<dyn InboundHandler>,
) {
    let mut shutdown_rx = connection.shutdown_tx.subscribe();

    loop {
        if *shutdown_rx.borrow() {
            return;
        }
        let frame = tokio::select! {
            result = read_frame(&mut read_half, encryption.as_ref()) => result,
            _ = shutdown_rx.changed() => return,
        };

        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!("inbound stream broke: {} - tearing down the connection", e);
                break;
            }
        };

        match frame.kind {
            FrameKind::Reply => {
                let Some(correlation_id) = frame.correlation_id else {
                    error!("reply frame without correlation id - tearing down the connection");
                    break;
                };
                handler.on_reply(frame.command, correlation_id, frame.payload).await;
            }
            FrameKind::Notification => {
                handler.on_notification(frame.command, frame.payload).await;
            }
            FrameKind::Request | FrameKind::ServerInfo => {
                error!("unexpected {:?} frame outside connection setup - tearing down the connection", frame.kind);
                break;
            }
        }
    }

    shared.teardown(&handler).await;
}

async fn run_writer(
    shared: Arc<TransportShared>,
    encryption: Arc<dyn FrameEncryption>,
    connection: Arc<Connection>,
    mut write_half: OwnedWriteHalf,
    mut send_rx: mpsc::UnboundedReceiver<Frame>,
    handler: Arc<dyn InboundHandler>,
) {
    let mut shutdown_rx = connection.shutdown_tx.subscribe();

    loop {
        if *shutdown_rx.borrow() {
            return;
        }
        let frame = tokio::select! {
            frame = send_rx.recv() => frame,
            _ = shutdown_rx.changed() => return,
        };
        let Some(frame) = frame else {
            return;
        };

        if let Err(e) = write_frame(&mut write_half, encryption.as_ref(), &frame).await {
            warn!("outbound stream broke: {} - tearing down the connection", e);
            break;
        }

        // Terminate is by definition the connection's last frame
        if frame.kind == FrameKind::Request && frame.command == u16::from(CommandId::Terminate) {
            debug!("terminate sent, closing the connection");
            break;
        }
    }

    shared.teardown(&handler).await;
}

pub(crate) async fn read_frame(read: &mut (impl AsyncRead + Unpin), encryption: &dyn FrameEncryption) -> anyhow::Result<Frame> {
    let mut len_raw = [0u8; 4];
    read.read_exact(&mut len_raw).await?;
    let len = u32::from_le_bytes(len_raw) as usize;
    if len > MAX_FRAME_SIZE {
        bail!("announced frame length {} exceeds the {} byte limit", len, MAX_FRAME_SIZE);
    }

    let mut buf = BytesMut::zeroed(len);
    read.read_exact(&mut buf).await?;
    encryption.decrypt_buffer(&mut buf)?;
    Frame::deser(buf.freeze())
}

pub(crate) async fn write_frame(
    write: &mut (impl AsyncWrite + Unpin),
    encryption: &dyn FrameEncryption,
    frame: &Frame,
) -> anyhow::Result<()> {
    let mut buf = BytesMut::new();
    frame.ser(&mut buf);
    encryption.encrypt_buffer(&mut buf)?;

    write.write_all(&(buf.len() as u32).to_le_bytes()).await?;
    write.write_all(&buf).await?;
    write.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::fake_server::FakeServer;
    use std::time::Duration;
    use tokio::sync::Mutex as TokioMutex;

    struct RecordingHandler {
        replies: TokioMutex<Vec<(u16, u64, Bytes)>>,
        notifications: TokioMutex<Vec<(u16, Bytes)>>,
        lost: AtomicBool,
    }
    impl RecordingHandler {
        fn new() -> Arc<RecordingHandler> {
            Arc::new(RecordingHandler {
                replies: TokioMutex::new(Vec::new()),
                notifications: TokioMutex::new(Vec::new()),
                lost: AtomicBool::new(false),
            })
        }
    }
    #[async_trait]
    impl InboundHandler for RecordingHandler {
        async fn on_reply(&self, command: u16, correlation_id: u64, payload: Bytes) {
            self.replies.lock().await.push((command, correlation_id, payload));
        }
        async fn on_notification(&self, command: u16, payload: Bytes) {
            self.notifications.lock().await.push((command, payload));
        }
        async fn on_connection_lost(&self) {
            self.lost.store(true, Ordering::Release);
        }
    }

    async fn connected_pair(key: Option<Vec<u8>>) -> (Arc<Transport>, FakeServer, Arc<RecordingHandler>) {
        let server = FakeServer::start(key.clone()).await;
        let mut config = ClientConfig::new(server.host(), "alice", "hunter2");
        config.encryption_key = key;
        let transport = Arc::new(Transport::new(Arc::new(config)));
        let handler = RecordingHandler::new();
        transport.connect(handler.clone() as Arc<dyn InboundHandler>).await.unwrap();
        (transport, server, handler)
    }

    #[tokio::test]
    async fn test_connect_handshake_and_login() {
        let (transport, server, _handler) = connected_pair(None).await;

        assert_eq!(transport.state(), ConnectionState::Authenticated);
        assert_eq!(transport.local_identity(), Some(UserIdentity::from_name("alice")));
        transport.wait_connected().await;
        transport.wait_authenticated().await;

        let login = server.take_request().await;
        assert_eq!(login.command, u16::from(CommandId::Login));
    }

    #[tokio::test]
    async fn test_connect_encrypted() {
        let (transport, _server, _handler) = connected_pair(Some(vec![3u8; 32])).await;
        assert_eq!(transport.state(), ConnectionState::Authenticated);
    }

    #[tokio::test]
    async fn test_replies_and_notifications_dispatched() {
        let (_transport, server, handler) = connected_pair(None).await;

        server.push_frame(Frame::reply(CommandId::LeaveRoom, 42, Bytes::from_static(&[0, 0]))).await;
        server
            .push_frame(Frame::notification(
                crate::protocol::NotificationKind::RoomDestroyed,
                Bytes::from_static(&[1, 0, 0, 0, 0, 0, 0, 0]),
            ))
            .await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handler.replies.lock().await.len(), 1);
        assert_eq!(handler.replies.lock().await[0].1, 42);
        assert_eq!(handler.notifications.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_send_queued_frame_reaches_server() {
        let (transport, server, _handler) = connected_pair(None).await;

        let frame = Frame::request(CommandId::GetNetworkTime, 7, Bytes::new());
        transport.send(frame.clone()).await.unwrap();

        let received = server.take_request().await;
        assert_eq!(received, frame);
    }

    #[tokio::test]
    async fn test_malformed_frame_is_fatal() {
        let (transport, server, handler) = connected_pair(None).await;

        server.push_raw(&[3, 0, 0, 0, 0xff, 0xff, 0xff]).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert!(handler.lost.load(Ordering::Acquire));
        assert!(transport.send(Frame::request(CommandId::GetNetworkTime, 8, Bytes::new())).await.is_err());
    }

    #[tokio::test]
    async fn test_version_mismatch_rejected() {
        let server = FakeServer::start_with_version(None, PROTOCOL_VERSION + 1).await;
        let config = ClientConfig::new(server.host(), "alice", "hunter2");
        let transport = Arc::new(Transport::new(Arc::new(config)));
        let handler = RecordingHandler::new();

        let result = transport.connect(handler as Arc<dyn InboundHandler>).await;
        assert!(result.is_err());
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_sends_terminate() {
        let (transport, server, handler) = connected_pair(None).await;

        let handler_dyn: Arc<dyn InboundHandler> = handler.clone();
        transport.disconnect(&handler_dyn).await;

        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert!(handler.lost.load(Ordering::Acquire));
        let terminate = server.take_request().await;
        assert_eq!(terminate.command, u16::from(CommandId::Terminate));
    }
}
