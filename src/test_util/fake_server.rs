use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::protocol::cursor::ByteCursor;
use crate::protocol::frame::Frame;
use crate::protocol::{CommandId, FrameKind, UserIdentity, PROTOCOL_VERSION};
use crate::transport::encryption::{Aes256GcmEncryption, FrameEncryption, NoEncryption};
use crate::transport::{read_frame, write_frame};

enum Push {
    Frame(Frame),
    Raw(Vec<u8>),
}

/// Scripted stand-in for the matchmaking service: speaks the ServerInfo +
/// login handshake, records incoming requests, and pushes whatever frames
/// (or raw bytes) a test tells it to.
pub struct FakeServer {
    host: String,
    requests_rx: Mutex<mpsc::UnboundedReceiver<Frame>>,
    push_tx: mpsc::UnboundedSender<Push>,
}

impl FakeServer {
    pub async fn start(encryption_key: Option<Vec<u8>>) -> FakeServer {
        Self::start_with_version(encryption_key, PROTOCOL_VERSION).await
    }

    pub async fn start_with_version(encryption_key: Option<Vec<u8>>, version: u32) -> FakeServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake server");
        let host = listener.local_addr().expect("local addr").to_string();

        let encryption: Arc<dyn FrameEncryption> = match encryption_key {
            Some(key) => Arc::new(Aes256GcmEncryption::new(&key)),
            None => Arc::new(NoEncryption),
        };

        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (push_tx, push_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            if let Err(e) = serve(listener, encryption, version, requests_tx, push_rx).await {
                debug!("fake server finished: {}", e);
            }
        });

        FakeServer {
            host,
            requests_rx: Mutex::new(requests_rx),
            push_tx,
        }
    }

    pub fn host(&self) -> String {
        self.host.clone()
    }

    /// Next request frame the client sent (excluding the login exchange,
    /// which the server answers itself).
    pub async fn take_request(&self) -> Frame {
        self.requests_rx.lock().await.recv().await.expect("fake server hung up")
    }

    pub async fn push_frame(&self, frame: Frame) {
        self.push_tx.send(Push::Frame(frame)).expect("fake server hung up");
    }

    /// Writes raw bytes to the stream, length prefix included; for feeding
    /// the client malformed traffic.
    pub async fn push_raw(&self, raw: &[u8]) {
        self.push_tx.send(Push::Raw(raw.to_vec())).expect("fake server hung up");
    }
}

async fn serve(
    listener: TcpListener,
    encryption: Arc<dyn FrameEncryption>,
    version: u32,
    requests_tx: mpsc::UnboundedSender<Frame>,
    mut push_rx: mpsc::UnboundedReceiver<Push>,
) -> anyhow::Result<()> {
    let (stream, _) = listener.accept().await?;
    let (mut read_half, mut write_half) = stream.into_split();

    write_frame(&mut write_half, encryption.as_ref(), &Frame::server_info(version)).await?;

    loop {
        select! {
            frame = read_frame(&mut read_half, encryption.as_ref()) => {
                let frame = frame?;
                if frame.kind == FrameKind::Request && frame.command == u16::from(CommandId::Login) {
                    let mut cursor = ByteCursor::new(frame.payload.clone());
                    let username = cursor.get_string();

                    let mut payload = BytesMut::new();
                    payload.put_u16_le(0); // ErrorCode::Ok
                    UserIdentity::from_name(&username).ser(&mut payload);
                    let reply = Frame::reply(CommandId::Login, frame.correlation_id.unwrap_or(0), payload.freeze());
                    write_frame(&mut write_half, encryption.as_ref(), &reply).await?;
                } else {
                    requests_tx.send(frame).ok();
                }
            }
            push = push_rx.recv() => {
                match push {
                    Some(Push::Frame(frame)) => write_frame(&mut write_half, encryption.as_ref(), &frame).await?,
                    Some(Push::Raw(raw)) => {
                        write_half.write_all(&raw).await?;
                        write_half.flush().await?;
                    }
                    None => return Ok(()),
                }
            }
        }
    }
}
