//! Request/reply correlation and callback dispatch.
//!
//! A request is fire-and-forget from the caller's point of view: it is
//! encoded, registered in the pending table and queued for the transport;
//! completion arrives later through the caller's callback. Replies are
//! matched purely by correlation id, so out-of-order replies are fine.
//! Decoding and cache mutation happen on the transport's reader task;
//! callback *invocation* is deferred onto the external
//! [`CallbackExecutor`] so decoding never blocks on guest-side execution.
//!
//! A pending request has no timeout: it lives until its reply arrives or the
//! connection is torn down, at which point it is abandoned silently (its
//! callback never fires).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::protocol::cursor::ByteCursor;
use crate::protocol::frame::Frame;
use crate::protocol::records::{MemberRecord, PresenceRecord, RoomRecord, SignalingInfoRecord};
use crate::protocol::{CommandId, ErrorCode, NotificationKind, UserIdentity};
use crate::requests::result_buffer::ResultBuffer;
use crate::rooms::RoomCache;
use crate::signaling::packet::PeerKey;
use crate::signaling::SignalingHandler;
use crate::transport::{InboundHandler, Transport};
use crate::util::buf::{put_bytes_prefixed, put_string, put_string_nul};

pub mod replies;
pub mod result_buffer;

/// Boundary to the application callback executor: submit an opaque task, it
/// runs later, once, on some other executor.
pub trait CallbackExecutor: Send + Sync {
    fn submit(&self, task: Box<dyn FnOnce() + Send>);
}

/// Which logical family issued a request; stamped into the correlation id's
/// high bits.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[repr(u16)]
pub enum RequestFamily {
    Room = 1,
    Score = 2,
    Gui = 3,
    Misc = 4,
}

/// What a completed request hands to its callback.
pub struct ReplyOutcome {
    pub command: CommandId,
    pub error: ErrorCode,
    pub data: Option<ResultBuffer>,
}

pub type RequestCallback = Box<dyn FnOnce(ReplyOutcome) + Send>;

/// Per-request state the reply decoder needs beyond the payload itself.
pub(crate) enum RequestContext {
    None,
    CreateJoin { password: Option<Vec<u8>> },
}

struct PendingRequest {
    command: CommandId,
    context: RequestContext,
    issued_at: Instant,
    callback: RequestCallback,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum RoomEvent {
    MemberJoined { room_id: u64, member_id: u16 },
    MemberLeft { room_id: u64, member_id: u16 },
    RoomDestroyed { room_id: u64 },
    RoomUpdated { room_id: u64 },
    MemberUpdated { room_id: u64, member_id: u16 },
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct RoomMessage {
    pub room_id: u64,
    pub member_id: u16,
    pub payload: Vec<u8>,
}

type RoomEventHandler = Arc<dyn Fn(RoomEvent) + Send + Sync>;
type RoomMessageHandler = Arc<dyn Fn(RoomMessage) + Send + Sync>;

/// Shared half of the orchestrator: everything the transport's reader task
/// needs to route inbound frames.
pub struct Dispatcher {
    cache: Arc<RoomCache>,
    executor: Arc<dyn CallbackExecutor>,
    pending: Mutex<FxHashMap<u64, PendingRequest>>,
    /// one wrapping counter per request family; collisions against
    /// still-pending ids are not checked
    counters: [AtomicU32; 4],
    room_event_handler: std::sync::Mutex<Option<RoomEventHandler>>,
    room_message_handler: std::sync::Mutex<Option<RoomMessageHandler>>,
    waiters: Mutex<FxHashMap<NotificationKind, oneshot::Sender<Bytes>>>,
    signaling: std::sync::Mutex<Option<Arc<SignalingHandler>>>,
}

impl Dispatcher {
    fn new(cache: Arc<RoomCache>, executor: Arc<dyn CallbackExecutor>) -> Dispatcher {
        Dispatcher {
            cache,
            executor,
            pending: Mutex::new(FxHashMap::default()),
            counters: [AtomicU32::new(1), AtomicU32::new(1), AtomicU32::new(1), AtomicU32::new(1)],
            room_event_handler: std::sync::Mutex::new(None),
            room_message_handler: std::sync::Mutex::new(None),
            waiters: Mutex::new(FxHashMap::default()),
            signaling: std::sync::Mutex::new(None),
        }
    }

    /// family tag in the high 16 bits, wrapping counter in the low 32.
    /// Uniqueness only holds among currently-outstanding requests.
    pub(crate) fn next_correlation_id(&self, family: RequestFamily) -> u64 {
        let counter = self.counters[family as usize - 1].fetch_add(1, Ordering::AcqRel);
        ((family as u64) << 48) | counter as u64
    }

    fn signaling_handler(&self) -> Option<Arc<SignalingHandler>> {
        self.signaling.lock().expect("signaling lock poisoned").clone()
    }

    fn dispatch_room_event(&self, event: RoomEvent) {
        let handler = self.room_event_handler.lock().expect("handler lock poisoned").clone();
        if let Some(handler) = handler {
            self.executor.submit(Box::new(move || handler(event)));
        }
    }

    fn dispatch_room_message(&self, message: RoomMessage) {
        let handler = self.room_message_handler.lock().expect("handler lock poisoned").clone();
        if let Some(handler) = handler {
            self.executor.submit(Box::new(move || handler(message)));
        }
    }
}

#[async_trait]
impl InboundHandler for Dispatcher {
    async fn on_reply(&self, command: u16, correlation_id: u64, payload: Bytes) {
        let pending = self.pending.lock().await.remove(&correlation_id);
        let Some(pending) = pending else {
            // duplicate, or a stale reply to an aborted request
            debug!("dropping reply {:#x} with no pending request", correlation_id);
            return;
        };
        match CommandId::try_from(command) {
            Ok(reply_command) if reply_command != pending.command => {
                warn!(
                    "reply {:#x} claims command {:?} but {:?} was pending - trusting the pending entry",
                    correlation_id, reply_command, pending.command
                );
            }
            _ => {}
        }

        let decoded = replies::decode_reply(
            pending.command,
            payload,
            &pending.context,
            pending.issued_at.elapsed(),
            &self.cache,
        )
        .await;

        if let Some(signaling) = self.signaling_handler() {
            if let Some((room_id, member_id)) = decoded.local_member {
                signaling.set_local_member(room_id, member_id).await;
            }
            if let Some((peer, addr)) = decoded.signaling_peer {
                signaling.connect_peer(peer, addr).await;
            }
        }

        trace!("completing {:?} request {:#x}: {:?}", pending.command, correlation_id, decoded.outcome.error);
        let callback = pending.callback;
        let outcome = decoded.outcome;
        self.executor.submit(Box::new(move || callback(outcome)));
    }

    async fn on_notification(&self, command: u16, payload: Bytes) {
        let Ok(kind) = NotificationKind::try_from(command) else {
            warn!("dropping notification with unknown kind {}", command);
            return;
        };

        // a registered waiter consumes the notification instead of the
        // normal dispatch path (used to wake a blocked synchronous caller)
        if let Some(waiter) = self.waiters.lock().await.remove(&kind) {
            waiter.send(payload).ok();
            return;
        }

        let mut cursor = ByteCursor::new(payload);
        match kind {
            NotificationKind::UserJoinedRoom => {
                let room_id = cursor.get_u64();
                let member = MemberRecord::deser(&mut cursor);
                if cursor.error() {
                    warn!("dropping malformed {:?} notification", kind);
                    return;
                }
                self.cache.apply_member_joined(room_id, &member).await;
                self.dispatch_room_event(RoomEvent::MemberJoined {
                    room_id,
                    member_id: member.member_id,
                });
            }
            NotificationKind::UserLeftRoom => {
                let room_id = cursor.get_u64();
                let member_id = cursor.get_u16();
                if cursor.error() {
                    warn!("dropping malformed {:?} notification", kind);
                    return;
                }
                self.cache.apply_member_left(room_id, member_id).await;
                self.dispatch_room_event(RoomEvent::MemberLeft { room_id, member_id });
            }
            NotificationKind::RoomDestroyed => {
                let room_id = cursor.get_u64();
                if cursor.error() {
                    warn!("dropping malformed {:?} notification", kind);
                    return;
                }
                self.cache.apply_room_destroyed(room_id).await;
                if let Some(signaling) = self.signaling_handler() {
                    signaling.forget_local_member(room_id).await;
                }
                self.dispatch_room_event(RoomEvent::RoomDestroyed { room_id });
            }
            NotificationKind::UpdatedRoomDataInternal => {
                let record = RoomRecord::deser(&mut cursor);
                if cursor.error() {
                    warn!("dropping malformed {:?} notification", kind);
                    return;
                }
                self.cache.apply_room_updated(&record).await;
                self.dispatch_room_event(RoomEvent::RoomUpdated { room_id: record.room_id });
            }
            NotificationKind::UpdatedRoomMemberDataInternal => {
                let room_id = cursor.get_u64();
                let member = MemberRecord::deser(&mut cursor);
                if cursor.error() {
                    warn!("dropping malformed {:?} notification", kind);
                    return;
                }
                self.cache.apply_member_updated(room_id, &member).await;
                self.dispatch_room_event(RoomEvent::MemberUpdated {
                    room_id,
                    member_id: member.member_id,
                });
            }
            NotificationKind::RoomMessageReceived => {
                let room_id = cursor.get_u64();
                let member_id = cursor.get_u16();
                let data = cursor.get_bytes_prefixed();
                if cursor.error() {
                    warn!("dropping malformed {:?} notification", kind);
                    return;
                }
                self.dispatch_room_message(RoomMessage {
                    room_id,
                    member_id,
                    payload: data.to_vec(),
                });
            }
            NotificationKind::SignalingHelper => {
                let record = SignalingInfoRecord::deser(&mut cursor);
                if cursor.error() {
                    warn!("dropping malformed {:?} notification", kind);
                    return;
                }
                if let Some(signaling) = self.signaling_handler() {
                    let addr = std::net::SocketAddr::new(
                        std::net::IpAddr::V4(std::net::Ipv4Addr::from(record.addr.to_be_bytes())),
                        record.port,
                    );
                    signaling.connect_peer(PeerKey::Identity(record.identity), addr).await;
                }
            }
            NotificationKind::FriendPresenceChanged => {
                let record = PresenceRecord::deser(&mut cursor);
                if cursor.error() {
                    warn!("dropping malformed {:?} notification", kind);
                    return;
                }
                self.cache.apply_presence(&record).await;
            }
        }
    }

    async fn on_connection_lost(&self) {
        let abandoned = {
            let mut pending = self.pending.lock().await;
            let count = pending.len();
            // abandoned silently: their callbacks never fire
            pending.clear();
            count
        };
        self.waiters.lock().await.clear();
        self.cache.mark_stale().await;
        if abandoned > 0 {
            debug!("abandoned {} pending requests on connection loss", abandoned);
        }
    }
}

#[derive(Clone, Debug)]
pub struct GroupConfig {
    pub group_id: u8,
    pub slot_num: u32,
    pub label: String,
}

#[derive(Clone, Debug, Default)]
pub struct CreateRoomParams {
    pub slot_count: u16,
    pub flags: u32,
    pub password_slot_mask: u64,
    pub password: Option<Vec<u8>>,
    pub groups: Vec<GroupConfig>,
}

pub struct RequestOrchestrator {
    transport: Arc<Transport>,
    dispatcher: Arc<Dispatcher>,
}

impl RequestOrchestrator {
    pub fn new(transport: Arc<Transport>, cache: Arc<RoomCache>, executor: Arc<dyn CallbackExecutor>) -> RequestOrchestrator {
        RequestOrchestrator {
            transport,
            dispatcher: Arc::new(Dispatcher::new(cache, executor)),
        }
    }

    /// The handler to register with [`Transport::connect`].
    pub fn inbound_handler(&self) -> Arc<dyn InboundHandler> {
        self.dispatcher.clone()
    }

    /// Wires the signaling state machine in so peer-address replies and
    /// helper pushes can trigger handshakes.
    pub fn attach_signaling(&self, signaling: Arc<SignalingHandler>) {
        *self.dispatcher.signaling.lock().expect("signaling lock poisoned") = Some(signaling);
    }

    pub fn set_room_event_handler(&self, handler: impl Fn(RoomEvent) + Send + Sync + 'static) {
        *self.dispatcher.room_event_handler.lock().expect("handler lock poisoned") = Some(Arc::new(handler));
    }

    pub fn set_room_message_handler(&self, handler: impl Fn(RoomMessage) + Send + Sync + 'static) {
        *self.dispatcher.room_message_handler.lock().expect("handler lock poisoned") = Some(Arc::new(handler));
    }

    /// Encodes and sends a request. Succeeds immediately with the new
    /// correlation id; completion happens later through `callback`. The only
    /// failure is a transport send failure, which requires a disconnect.
    pub async fn issue_request(
        &self,
        family: RequestFamily,
        command: CommandId,
        payload: Bytes,
        callback: RequestCallback,
    ) -> anyhow::Result<u64> {
        self.issue_with_context(family, command, payload, RequestContext::None, callback).await
    }

    async fn issue_with_context(
        &self,
        family: RequestFamily,
        command: CommandId,
        payload: Bytes,
        context: RequestContext,
        callback: RequestCallback,
    ) -> anyhow::Result<u64> {
        let correlation_id = self.dispatcher.next_correlation_id(family);
        self.dispatcher.pending.lock().await.insert(correlation_id, PendingRequest {
            command,
            context,
            issued_at: Instant::now(),
            callback,
        });

        let frame = Frame::request(command, correlation_id, payload);
        if let Err(e) = self.transport.send(frame).await {
            self.dispatcher.pending.lock().await.remove(&correlation_id);
            return Err(e.context("request could not be sent - disconnect and reconnect"));
        }
        trace!("issued {:?} request {:#x}", command, correlation_id);
        Ok(correlation_id)
    }

    /// Removes a pending request without ever invoking its callback.
    /// Returns whether one was found.
    pub async fn abort_request(&self, correlation_id: u64) -> bool {
        self.dispatcher.pending.lock().await.remove(&correlation_id).is_some()
    }

    /// Registers a one-shot waiter for a notification kind. The next such
    /// notification is consumed by the waiter instead of the normal dispatch
    /// path; the receiver errors if the connection dies first. Registration
    /// is immediate, so the caller can park on the receiver without racing
    /// the push.
    pub async fn expect_notification(&self, kind: NotificationKind) -> oneshot::Receiver<Bytes> {
        let (tx, rx) = oneshot::channel();
        self.dispatcher.waiters.lock().await.insert(kind, tx);
        rx
    }

    // ---- request call-sites -------------------------------------------
    // Thin wrappers that construct a payload and await completion through
    // the callback; the interesting work all happens in the reply path.

    pub async fn create_room(
        &self,
        com_id: &str,
        params: CreateRoomParams,
        callback: RequestCallback,
    ) -> anyhow::Result<u64> {
        let mut payload = BytesMut::new();
        put_string_nul(&mut payload, com_id);
        payload.put_u16_le(params.slot_count);
        payload.put_u32_le(params.flags);
        payload.put_u64_le(params.password_slot_mask);
        put_bytes_prefixed(&mut payload, params.password.as_deref().unwrap_or(&[]));
        payload.put_u8(params.groups.len() as u8);
        for group in &params.groups {
            payload.put_u8(group.group_id);
            payload.put_u32_le(group.slot_num);
            put_string(&mut payload, &group.label);
        }

        let context = RequestContext::CreateJoin {
            password: params.password,
        };
        self.issue_with_context(RequestFamily::Room, CommandId::CreateRoom, payload.freeze(), context, callback)
            .await
    }

    pub async fn join_room(
        &self,
        com_id: &str,
        room_id: u64,
        password: Option<&[u8]>,
        callback: RequestCallback,
    ) -> anyhow::Result<u64> {
        let mut payload = BytesMut::new();
        put_string_nul(&mut payload, com_id);
        payload.put_u64_le(room_id);
        put_bytes_prefixed(&mut payload, password.unwrap_or(&[]));
        self.issue_with_context(
            RequestFamily::Room,
            CommandId::JoinRoom,
            payload.freeze(),
            RequestContext::CreateJoin { password: None },
            callback,
        )
        .await
    }

    pub async fn leave_room(&self, com_id: &str, room_id: u64, callback: RequestCallback) -> anyhow::Result<u64> {
        let mut payload = BytesMut::new();
        put_string_nul(&mut payload, com_id);
        payload.put_u64_le(room_id);
        self.issue_request(RequestFamily::Room, CommandId::LeaveRoom, payload.freeze(), callback).await
    }

    pub async fn search_room(&self, com_id: &str, limit: u16, callback: RequestCallback) -> anyhow::Result<u64> {
        let mut payload = BytesMut::new();
        put_string_nul(&mut payload, com_id);
        payload.put_u16_le(limit);
        self.issue_request(RequestFamily::Room, CommandId::SearchRoom, payload.freeze(), callback).await
    }

    pub async fn get_room_data_internal(&self, com_id: &str, room_id: u64, callback: RequestCallback) -> anyhow::Result<u64> {
        let mut payload = BytesMut::new();
        put_string_nul(&mut payload, com_id);
        payload.put_u64_le(room_id);
        self.issue_request(RequestFamily::Room, CommandId::GetRoomDataInternal, payload.freeze(), callback).await
    }

    pub async fn set_room_data_internal(
        &self,
        com_id: &str,
        room_id: u64,
        flags: u32,
        password_slot_mask: u64,
        callback: RequestCallback,
    ) -> anyhow::Result<u64> {
        let mut payload = BytesMut::new();
        put_string_nul(&mut payload, com_id);
        payload.put_u64_le(room_id);
        payload.put_u32_le(flags);
        payload.put_u64_le(password_slot_mask);
        self.issue_request(RequestFamily::Room, CommandId::SetRoomDataInternal, payload.freeze(), callback).await
    }

    pub async fn set_room_data_external(
        &self,
        com_id: &str,
        room_id: u64,
        searchable: bool,
        callback: RequestCallback,
    ) -> anyhow::Result<u64> {
        let mut payload = BytesMut::new();
        put_string_nul(&mut payload, com_id);
        payload.put_u64_le(room_id);
        payload.put_u8(searchable as u8);
        self.issue_request(RequestFamily::Room, CommandId::SetRoomDataExternal, payload.freeze(), callback).await
    }

    pub async fn set_room_member_data_internal(
        &self,
        com_id: &str,
        room_id: u64,
        member_id: u16,
        team_id: u8,
        callback: RequestCallback,
    ) -> anyhow::Result<u64> {
        let mut payload = BytesMut::new();
        put_string_nul(&mut payload, com_id);
        payload.put_u64_le(room_id);
        payload.put_u16_le(member_id);
        payload.put_u8(team_id);
        self.issue_request(RequestFamily::Room, CommandId::SetRoomMemberDataInternal, payload.freeze(), callback)
            .await
    }

    pub async fn ping_room_owner(&self, com_id: &str, room_id: u64, callback: RequestCallback) -> anyhow::Result<u64> {
        let mut payload = BytesMut::new();
        put_string_nul(&mut payload, com_id);
        payload.put_u64_le(room_id);
        self.issue_request(RequestFamily::Room, CommandId::PingRoomOwner, payload.freeze(), callback).await
    }

    pub async fn send_room_message(
        &self,
        com_id: &str,
        room_id: u64,
        data: &[u8],
        callback: RequestCallback,
    ) -> anyhow::Result<u64> {
        let mut payload = BytesMut::new();
        put_string_nul(&mut payload, com_id);
        payload.put_u64_le(room_id);
        put_bytes_prefixed(&mut payload, data);
        self.issue_request(RequestFamily::Room, CommandId::SendRoomMessage, payload.freeze(), callback).await
    }

    pub async fn request_signaling_infos(
        &self,
        com_id: &str,
        identity: UserIdentity,
        callback: RequestCallback,
    ) -> anyhow::Result<u64> {
        let mut payload = BytesMut::new();
        put_string_nul(&mut payload, com_id);
        identity.ser(&mut payload);
        self.issue_request(RequestFamily::Misc, CommandId::RequestSignalingInfos, payload.freeze(), callback)
            .await
    }

    pub async fn get_network_time(&self, callback: RequestCallback) -> anyhow::Result<u64> {
        self.issue_request(RequestFamily::Misc, CommandId::GetNetworkTime, Bytes::new(), callback).await
    }

    pub async fn record_score(
        &self,
        com_id: &str,
        board_id: u32,
        score: i64,
        comment: &str,
        callback: RequestCallback,
    ) -> anyhow::Result<u64> {
        let mut payload = BytesMut::new();
        put_string_nul(&mut payload, com_id);
        payload.put_u32_le(board_id);
        payload.put_u64_le(score as u64);
        put_string(&mut payload, comment);
        self.issue_request(RequestFamily::Score, CommandId::RecordScore, payload.freeze(), callback).await
    }

    pub async fn get_score_range(
        &self,
        com_id: &str,
        board_id: u32,
        start_rank: u32,
        count: u32,
        callback: RequestCallback,
    ) -> anyhow::Result<u64> {
        let mut payload = BytesMut::new();
        put_string_nul(&mut payload, com_id);
        payload.put_u32_le(board_id);
        payload.put_u32_le(start_rank);
        payload.put_u32_le(count);
        self.issue_request(RequestFamily::Score, CommandId::GetScoreRange, payload.freeze(), callback).await
    }

    pub async fn set_presence(
        &self,
        title: &str,
        status: &str,
        comment: &str,
        data: &[u8],
        callback: RequestCallback,
    ) -> anyhow::Result<u64> {
        let mut payload = BytesMut::new();
        put_string(&mut payload, title);
        put_string(&mut payload, status);
        put_string(&mut payload, comment);
        put_bytes_prefixed(&mut payload, data);
        self.issue_request(RequestFamily::Misc, CommandId::SetPresence, payload.freeze(), callback).await
    }

    pub async fn get_server_list(&self, com_id: &str, callback: RequestCallback) -> anyhow::Result<u64> {
        let mut payload = BytesMut::new();
        put_string_nul(&mut payload, com_id);
        self.issue_request(RequestFamily::Misc, CommandId::GetServerList, payload.freeze(), callback).await
    }

    pub async fn get_world_list(&self, com_id: &str, server_id: u16, callback: RequestCallback) -> anyhow::Result<u64> {
        let mut payload = BytesMut::new();
        put_string_nul(&mut payload, com_id);
        payload.put_u16_le(server_id);
        self.issue_request(RequestFamily::Misc, CommandId::GetWorldList, payload.freeze(), callback).await
    }
}
