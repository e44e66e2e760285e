use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

use crate::config::ClientConfig;
use crate::requests::{CallbackExecutor, RequestOrchestrator};
use crate::rooms::RoomCache;
use crate::signaling::{run_signaling, DatagramSocket, SignalingEvent, SignalingHandler};
use crate::transport::Transport;

/// This is the client's public API: one service connection, the local room
/// mirror, and the peer signaling machine, wired together.
///
/// The embedder supplies the two external collaborators: the raw datagram
/// socket for signaling, and the executor that runs completion callbacks on
/// the guest side.
pub struct MatchmakingClient {
    pub config: Arc<ClientConfig>,
    transport: Arc<Transport>,
    orchestrator: RequestOrchestrator,
    cache: Arc<RoomCache>,
    signaling: Arc<SignalingHandler>,
}

impl MatchmakingClient {
    pub fn new(
        config: Arc<ClientConfig>,
        socket: Arc<dyn DatagramSocket>,
        executor: Arc<dyn CallbackExecutor>,
    ) -> MatchmakingClient {
        let transport = Arc::new(Transport::new(config.clone()));
        let cache = Arc::new(RoomCache::new());
        let orchestrator = RequestOrchestrator::new(transport.clone(), cache.clone(), executor);
        let signaling = Arc::new(SignalingHandler::new(config.clone(), socket));
        orchestrator.attach_signaling(signaling.clone());

        MatchmakingClient {
            config,
            transport,
            orchestrator,
            cache,
            signaling,
        }
    }

    /// Connects and authenticates. After this returns, requests are valid
    /// and signaling packets carry the service-acknowledged identity.
    pub async fn connect(&self) -> anyhow::Result<()> {
        self.transport.connect(self.orchestrator.inbound_handler()).await?;
        if let Some(identity) = self.transport.local_identity() {
            self.signaling.set_local_identity(identity).await;
        }
        debug!("client connected to {}", self.config.server_host);
        Ok(())
    }

    /// Runs the signaling worker; resolves only on error or abort.
    pub async fn run(&self) -> anyhow::Result<()> {
        run_signaling(self.signaling.clone()).await
    }

    pub async fn disconnect(&self) {
        self.transport.disconnect(&self.orchestrator.inbound_handler()).await;
    }

    pub fn requests(&self) -> &RequestOrchestrator {
        &self.orchestrator
    }

    pub fn rooms(&self) -> &Arc<RoomCache> {
        &self.cache
    }

    pub fn signaling(&self) -> &Arc<SignalingHandler> {
        &self.signaling
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn subscribe_signaling_events(&self) -> broadcast::Receiver<SignalingEvent> {
        self.signaling.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::Frame;
    use crate::protocol::records::test_data;
    use crate::protocol::{CommandId, ErrorCode, UserIdentity};
    use crate::requests::{CreateRoomParams, ReplyOutcome};
    use crate::test_util::datagram::TrackingDatagramSocket;
    use crate::test_util::executor::InlineExecutor;
    use crate::test_util::fake_server::FakeServer;
    use bytes::{BufMut, BytesMut};
    use std::time::Duration;

    #[tokio::test]
    async fn test_full_stack_create_room() {
        let server = FakeServer::start(None).await;
        let config = Arc::new(ClientConfig::new(server.host(), "alice", "pw"));
        let client = MatchmakingClient::new(
            config,
            Arc::new(TrackingDatagramSocket::new()),
            Arc::new(InlineExecutor),
        );
        client.connect().await.unwrap();
        assert_eq!(client.transport().local_identity(), Some(UserIdentity::from_name("alice")));

        let done = Arc::new(std::sync::Mutex::new(None));
        let sink = done.clone();
        let correlation_id = client
            .requests()
            .create_room(
                "NPWR00001",
                CreateRoomParams { slot_count: 8, ..Default::default() },
                Box::new(move |outcome: ReplyOutcome| {
                    *sink.lock().expect("sink lock poisoned") = Some(outcome.error);
                }),
            )
            .await
            .unwrap();

        server.take_request().await;
        let mut payload = BytesMut::new();
        payload.put_u16_le(u16::from(ErrorCode::Ok));
        payload.put_u16_le(1);
        test_data::room(7, &[1]).ser(&mut payload);
        server.push_frame(Frame::reply(CommandId::CreateRoom, correlation_id, payload.freeze())).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*done.lock().unwrap(), Some(ErrorCode::Ok));
        assert_eq!(client.rooms().member_count(7).await.unwrap(), 1);
        assert_eq!(client.rooms().local_member_id(7).await.unwrap(), Some(1));

        client.disconnect().await;
        assert!(client.rooms().is_stale().await);
    }
}
