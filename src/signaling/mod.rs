//! Peer-to-peer signaling: UDP handshake, keepalive and teardown, with a
//! single retransmission scheduler.
//!
//! Each peer walks `Inactive -> Pending -> Active -> Inactive`. Outbound
//! control packets are rescheduled at command-specific delays until their
//! expected response arrives, out of one time-ordered queue; at most one
//! scheduled entry exists per `(peer, command)` pair - rescheduling replaces.
//! A peer with no traffic for the liveness window is forced back to
//! `Inactive` by the periodic sweep.
//!
//! The state machine never opens sockets itself: datagrams go out through
//! the [`DatagramSocket`] boundary, and the raw socket layer signals new
//! inbound traffic via [`SignalingHandler::notify_datagrams`].

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::time::{self, Duration, Instant};
use tracing::{debug, trace, warn};

use crate::config::ClientConfig;
use crate::protocol::UserIdentity;
use crate::signaling::packet::{PeerKey, SignalingCommand, SignalingPacket};

pub mod packet;

/// Boundary to the raw socket layer; the core never performs `send`/`recv`
/// itself.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DatagramSocket: Send + Sync {
    async fn send_datagram(&self, bytes: Bytes, dest: SocketAddr) -> anyhow::Result<()>;
    fn poll_incoming(&self) -> Vec<(SocketAddr, Bytes)>;
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum PeerStatus {
    Inactive,
    Pending,
    Active,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum SignalingEvent {
    /// The peer is reachable: the handshake completed from our point of view.
    Established { peer: PeerKey },
    /// Both sides confirmed each other; fired once, after `Established`.
    MutuallyEstablished { peer: PeerKey },
    /// The peer is gone, by explicit teardown or by liveness timeout.
    Dead { peer: PeerKey, timeout: bool },
}

struct Peer {
    status: PeerStatus,
    addr: Option<SocketAddr>,
    last_message: Instant,
    /// the remote side activated us without a local connect call
    ext_activated: bool,
    mutual: bool,
    established_fired: bool,
    mutual_fired: bool,
}

impl Peer {
    fn new(now: Instant) -> Peer {
        Peer {
            status: PeerStatus::Inactive,
            addr: None,
            last_message: now,
            ext_activated: false,
            mutual: false,
            established_fired: false,
            mutual_fired: false,
        }
    }

    fn reset_for_activation(&mut self) {
        self.ext_activated = false;
        self.mutual = false;
        self.established_fired = false;
        self.mutual_fired = false;
    }
}

#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Debug)]
struct ScheduleKey {
    due: Instant,
    seq: u64,
}

struct ScheduledPacket {
    peer: PeerKey,
    command: SignalingCommand,
    attempts: u32,
}

#[derive(Default)]
struct SignalingInner {
    peers: FxHashMap<PeerKey, Peer>,
    queue: BTreeMap<ScheduleKey, ScheduledPacket>,
    /// at most one queue entry per (peer, command); this is the replace index
    index: FxHashMap<(PeerKey, SignalingCommand), ScheduleKey>,
    next_seq: u64,
    local_identity: Option<UserIdentity>,
    /// our own member id per joined room, for stamping outbound v2 packets
    local_members: FxHashMap<u64, u16>,
}

/// Outbound work computed under the lock, performed after it is released:
/// the lock is never held across socket I/O.
#[derive(Default)]
struct Actions {
    sends: Vec<(SocketAddr, SignalingPacket)>,
    events: Vec<SignalingEvent>,
}

pub struct SignalingHandler {
    config: Arc<ClientConfig>,
    socket: Arc<dyn DatagramSocket>,
    inner: Mutex<SignalingInner>,
    wake: Notify,
    events_tx: broadcast::Sender<SignalingEvent>,
}

impl SignalingHandler {
    pub fn new(config: Arc<ClientConfig>, socket: Arc<dyn DatagramSocket>) -> SignalingHandler {
        let (events_tx, _) = broadcast::channel(64);
        SignalingHandler {
            config,
            socket,
            inner: Mutex::new(SignalingInner::default()),
            wake: Notify::new(),
            events_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.events_tx.subscribe()
    }

    /// The raw socket layer calls this when `poll_incoming` has new data.
    pub fn notify_datagrams(&self) {
        self.wake.notify_one();
    }

    pub async fn set_local_identity(&self, identity: UserIdentity) {
        self.inner.lock().await.local_identity = Some(identity);
    }

    /// Records our own member id inside a room so room-scoped packets can be
    /// stamped with the right sender.
    pub async fn set_local_member(&self, room_id: u64, member_id: u16) {
        self.inner.lock().await.local_members.insert(room_id, member_id);
    }

    pub async fn forget_local_member(&self, room_id: u64) {
        self.inner.lock().await.local_members.remove(&room_id);
    }

    pub async fn peer_status(&self, key: &PeerKey) -> PeerStatus {
        self.inner
            .lock()
            .await
            .peers
            .get(key)
            .map(|p| p.status)
            .unwrap_or(PeerStatus::Inactive)
    }

    /// Whether both sides have confirmed the current activation.
    pub async fn peer_is_mutual(&self, key: &PeerKey) -> bool {
        self.inner
            .lock()
            .await
            .peers
            .get(key)
            .map(|p| p.mutual)
            .unwrap_or(false)
    }

    /// Initiates a handshake with a peer whose address became known (from a
    /// signaling-infos reply or a helper push). No-op if the handshake is
    /// already running or the peer is active.
    pub async fn connect_peer(&self, key: PeerKey, addr: SocketAddr) {
        let mut actions = Actions::default();
        {
            let mut inner = self.inner.lock().await;
            let now = Instant::now();
            let peer = inner.peers.entry(key).or_insert_with(|| Peer::new(now));
            if peer.status != PeerStatus::Inactive {
                trace!("connect_peer for {:?} in state {:?} - nothing to do", key, peer.status);
                return;
            }
            peer.reset_for_activation();
            peer.status = PeerStatus::Pending;
            peer.addr = Some(addr);
            peer.last_message = now;
            debug!("initiating handshake with {:?} at {}", key, addr);

            self.send_and_schedule(&mut inner, &mut actions, key, addr, SignalingCommand::Connect, now);
        }
        self.dispatch(actions).await;
        self.wake.notify_one();
    }

    /// Local teardown: tell the peer we are done and declare it dead. The
    /// FINISHED packet is retransmitted a bounded number of times; the peer
    /// is gone either way.
    pub async fn teardown_peer(&self, key: PeerKey) {
        let mut actions = Actions::default();
        {
            let mut inner = self.inner.lock().await;
            let now = Instant::now();
            let Some(peer) = inner.peers.get(&key) else {
                return;
            };
            if peer.status == PeerStatus::Inactive {
                return;
            }
            let addr = peer.addr;
            Self::deactivate(&mut inner, &mut actions, key, false);
            if let Some(addr) = addr {
                self.send_and_schedule(&mut inner, &mut actions, key, addr, SignalingCommand::Finished, now);
            }
        }
        self.dispatch(actions).await;
        self.wake.notify_one();
    }

    /// Drains all pending inbound datagrams. Malformed or unrecognized
    /// packets are dropped with a log line and no state change.
    pub async fn drain_incoming(&self) {
        let datagrams = self.socket.poll_incoming();
        if datagrams.is_empty() {
            return;
        }

        let mut actions = Actions::default();
        {
            let mut inner = self.inner.lock().await;
            let now = Instant::now();
            for (src, raw) in datagrams {
                match SignalingPacket::deser(raw) {
                    Ok(packet) => self.on_packet(&mut inner, &mut actions, src, packet, now),
                    Err(e) => warn!("dropping signaling datagram from {}: {}", src, e),
                }
            }
        }
        self.dispatch(actions).await;
    }

    fn on_packet(
        &self,
        inner: &mut SignalingInner,
        actions: &mut Actions,
        src: SocketAddr,
        packet: SignalingPacket,
        now: Instant,
    ) {
        let key = packet.source;
        trace!("signaling packet {:?} from {:?} at {}", packet.command, key, src);

        let peer = inner.peers.entry(key).or_insert_with(|| Peer::new(now));
        peer.last_message = now;
        peer.addr = Some(src); // track address rebinds

        match packet.command {
            SignalingCommand::Connect => {
                match peer.status {
                    PeerStatus::Inactive => {
                        // remote-initiated connection, accepted without a
                        // local connect call
                        peer.reset_for_activation();
                        peer.status = PeerStatus::Active;
                        peer.ext_activated = true;
                        Self::fire_established(peer, actions, key);
                        self.send_and_schedule(inner, actions, key, src, SignalingCommand::ConnectAck, now);
                    }
                    PeerStatus::Pending => {
                        // simultaneous open: treat their CONNECT like an
                        // activation, keep our own handshake running
                        peer.status = PeerStatus::Active;
                        peer.ext_activated = true;
                        Self::fire_established(peer, actions, key);
                        self.send_and_schedule(inner, actions, key, src, SignalingCommand::ConnectAck, now);
                    }
                    PeerStatus::Active => {
                        // duplicate CONNECT means our ack was lost
                        self.send_and_schedule(inner, actions, key, src, SignalingCommand::ConnectAck, now);
                    }
                }
            }
            SignalingCommand::ConnectAck => {
                Self::cancel(inner, key, SignalingCommand::Connect);
                let peer = inner.peers.get_mut(&key).expect("peer inserted above");
                if peer.status == PeerStatus::Pending {
                    peer.status = PeerStatus::Active;
                    Self::fire_established(peer, actions, key);
                    Self::schedule(inner, key, SignalingCommand::Ping, now + self.config.keepalive_interval, 0);
                }
                // the CONFIRM reply is one-shot; their side retransmits the
                // ack if it gets lost
                actions.sends.push((src, self.outbound_packet(inner, key, SignalingCommand::Confirm)));
            }
            SignalingCommand::Confirm => {
                Self::cancel(inner, key, SignalingCommand::ConnectAck);
                let peer = inner.peers.get_mut(&key).expect("peer inserted above");
                if peer.status == PeerStatus::Pending {
                    peer.status = PeerStatus::Active;
                }
                if peer.status == PeerStatus::Active && !peer.mutual_fired {
                    peer.mutual = true;
                    peer.mutual_fired = true;
                    trace!("peer {:?} mutually confirmed (remotely activated: {})", key, peer.ext_activated);
                    actions.events.push(SignalingEvent::MutuallyEstablished { peer: key });
                    Self::schedule_if_absent(inner, key, SignalingCommand::Ping, now + self.config.keepalive_interval);
                }
            }
            SignalingCommand::Ping => {
                actions.sends.push((src, self.outbound_packet(inner, key, SignalingCommand::Pong)));
            }
            SignalingCommand::Pong => {
                // peer is alive: drop back to the slow keepalive cadence
                Self::schedule(inner, key, SignalingCommand::Ping, now + self.config.keepalive_slow_interval, 0);
            }
            SignalingCommand::Finished => {
                actions.sends.push((src, self.outbound_packet(inner, key, SignalingCommand::FinishedAck)));
                Self::deactivate(inner, actions, key, false);
            }
            SignalingCommand::FinishedAck => {
                Self::cancel(inner, key, SignalingCommand::Finished);
            }
        }
    }

    fn fire_established(peer: &mut Peer, actions: &mut Actions, key: PeerKey) {
        if !peer.established_fired {
            peer.established_fired = true;
            actions.events.push(SignalingEvent::Established { peer: key });
        }
    }

    /// Sends a packet now and schedules its retransmission.
    fn send_and_schedule(
        &self,
        inner: &mut SignalingInner,
        actions: &mut Actions,
        key: PeerKey,
        addr: SocketAddr,
        command: SignalingCommand,
        now: Instant,
    ) {
        actions.sends.push((addr, self.outbound_packet(inner, key, command)));
        Self::schedule(inner, key, command, now + self.retransmit_delay(command), 1);
    }

    /// Retry cadence while a command's expected response is outstanding.
    fn retransmit_delay(&self, _command: SignalingCommand) -> Duration {
        self.config.handshake_retransmit_interval
    }

    /// Stamps an outbound packet with our own identity in the peer's keying
    /// scheme: version 1 carries our user identity, version 2 our member id
    /// in the shared room.
    fn outbound_packet(&self, inner: &SignalingInner, key: PeerKey, command: SignalingCommand) -> SignalingPacket {
        let source = match key {
            PeerKey::Identity(_) => PeerKey::Identity(inner.local_identity.unwrap_or_default()),
            PeerKey::RoomMember { room_id, .. } => PeerKey::RoomMember {
                room_id,
                member_id: inner.local_members.get(&room_id).copied().unwrap_or(0),
            },
        };
        SignalingPacket::new(command, source)
    }

    fn schedule(inner: &mut SignalingInner, key: PeerKey, command: SignalingCommand, due: Instant, attempts: u32) {
        if let Some(old) = inner.index.remove(&(key, command)) {
            inner.queue.remove(&old);
        }
        let schedule_key = ScheduleKey {
            due,
            seq: inner.next_seq,
        };
        inner.next_seq += 1;
        inner.queue.insert(schedule_key, ScheduledPacket {
            peer: key,
            command,
            attempts,
        });
        inner.index.insert((key, command), schedule_key);
    }

    fn schedule_if_absent(inner: &mut SignalingInner, key: PeerKey, command: SignalingCommand, due: Instant) {
        if !inner.index.contains_key(&(key, command)) {
            Self::schedule(inner, key, command, due, 0);
        }
    }

    fn cancel(inner: &mut SignalingInner, key: PeerKey, command: SignalingCommand) -> bool {
        match inner.index.remove(&(key, command)) {
            Some(schedule_key) => {
                inner.queue.remove(&schedule_key);
                true
            }
            None => false,
        }
    }

    fn cancel_all_for_peer(inner: &mut SignalingInner, key: PeerKey) {
        let commands: Vec<SignalingCommand> = inner
            .index
            .keys()
            .filter(|(k, _)| *k == key)
            .map(|(_, c)| *c)
            .collect();
        for command in commands {
            Self::cancel(inner, key, command);
        }
    }

    /// Transition out of Pending/Active: cancels everything scheduled for
    /// the peer and fires exactly one Dead event per activation.
    fn deactivate(inner: &mut SignalingInner, actions: &mut Actions, key: PeerKey, timeout: bool) {
        Self::cancel_all_for_peer(inner, key);
        let Some(peer) = inner.peers.get_mut(&key) else {
            return;
        };
        if peer.status != PeerStatus::Inactive {
            peer.status = PeerStatus::Inactive;
            actions.events.push(SignalingEvent::Dead { peer: key, timeout });
            debug!("peer {:?} is dead (timeout: {})", key, timeout);
        }
    }

    /// Sends every due retransmission and requeues it. Entries for inactive
    /// peers are discarded, except FINISHED which retries up to its cap.
    pub async fn process_due(&self) {
        let mut actions = Actions::default();
        {
            let mut inner = self.inner.lock().await;
            let now = Instant::now();

            loop {
                let Some((&schedule_key, _)) = inner.queue.first_key_value() else {
                    break;
                };
                if schedule_key.due > now {
                    break;
                }
                let entry = inner.queue.remove(&schedule_key).expect("checked above");
                inner.index.remove(&(entry.peer, entry.command));

                let Some(peer) = inner.peers.get(&entry.peer) else {
                    continue;
                };
                let inactive = peer.status == PeerStatus::Inactive;
                if inactive && entry.command != SignalingCommand::Finished {
                    continue;
                }
                if entry.command == SignalingCommand::Finished && entry.attempts >= self.config.finished_retransmit_limit {
                    debug!("giving up on FINISHED for {:?} after {} attempts", entry.peer, entry.attempts);
                    continue;
                }
                let Some(addr) = peer.addr else {
                    continue;
                };

                trace!("retransmitting {:?} to {:?} (attempt {})", entry.command, entry.peer, entry.attempts + 1);
                actions.sends.push((addr, self.outbound_packet(&inner, entry.peer, entry.command)));
                Self::schedule(
                    &mut inner,
                    entry.peer,
                    entry.command,
                    now + self.retransmit_delay(entry.command),
                    entry.attempts + 1,
                );
            }
        }
        self.dispatch(actions).await;
    }

    /// Declares peers without traffic for the liveness window dead,
    /// independent of any explicit FINISHED exchange.
    pub async fn sweep_liveness(&self) {
        let mut actions = Actions::default();
        {
            let mut inner = self.inner.lock().await;
            let now = Instant::now();
            let timed_out: Vec<PeerKey> = inner
                .peers
                .iter()
                .filter(|(_, peer)| {
                    peer.status != PeerStatus::Inactive
                        && now.duration_since(peer.last_message) >= self.config.peer_liveness_timeout
                })
                .map(|(&key, _)| key)
                .collect();
            for key in timed_out {
                Self::deactivate(&mut inner, &mut actions, key, true);
            }
        }
        self.dispatch(actions).await;
    }

    pub async fn next_due(&self) -> Option<Instant> {
        self.inner.lock().await.queue.first_key_value().map(|(k, _)| k.due)
    }

    async fn dispatch(&self, actions: Actions) {
        for (addr, packet) in actions.sends {
            if let Err(e) = self.socket.send_datagram(packet.to_bytes(), addr).await {
                warn!("failed to send signaling datagram to {}: {}", addr, e);
            }
        }
        for event in actions.events {
            self.events_tx.send(event).ok();
        }
    }

    #[cfg(test)]
    async fn scheduled_commands_for(&self, key: &PeerKey) -> Vec<SignalingCommand> {
        let inner = self.inner.lock().await;
        inner
            .index
            .keys()
            .filter(|(k, _)| k == key)
            .map(|(_, c)| *c)
            .collect()
    }
}

/// The signaling worker: sleeps until new datagrams are signalled or the
/// next scheduled retransmission is due, then drains inbound traffic,
/// processes due retransmissions and sweeps for dead peers.
pub async fn run_signaling(handler: Arc<SignalingHandler>) -> anyhow::Result<()> {
    loop {
        let sweep_at = Instant::now() + handler.config.liveness_sweep_interval;
        let wake_at = match handler.next_due().await {
            Some(due) => due.min(sweep_at),
            None => sweep_at,
        };

        select! {
            _ = handler.wake.notified() => {}
            _ = time::sleep_until(wake_at) => {}
        }

        handler.drain_incoming().await;
        handler.process_due().await;
        handler.sweep_liveness().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::datagram::TrackingDatagramSocket;

    fn test_config() -> Arc<ClientConfig> {
        Arc::new(ClientConfig::new("127.0.0.1:0", "local", "pw"))
    }

    fn peer_addr() -> SocketAddr {
        "10.0.0.2:3658".parse().unwrap()
    }

    async fn handler_with_socket() -> (Arc<SignalingHandler>, Arc<TrackingDatagramSocket>) {
        let socket = Arc::new(TrackingDatagramSocket::new());
        let handler = Arc::new(SignalingHandler::new(test_config(), socket.clone()));
        handler.set_local_identity(UserIdentity::from_name("local")).await;
        (handler, socket)
    }

    fn identity_key(name: &str) -> PeerKey {
        PeerKey::Identity(UserIdentity::from_name(name))
    }

    fn drain_events(rx: &mut broadcast::Receiver<SignalingEvent>) -> Vec<SignalingEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_initiator_handshake_to_active() {
        let (handler, socket) = handler_with_socket().await;
        let mut events = handler.subscribe();
        let peer = identity_key("remote");

        handler.connect_peer(peer, peer_addr()).await;
        assert_eq!(handler.peer_status(&peer).await, PeerStatus::Pending);
        let sent = socket.take_sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(SignalingPacket::deser(sent[0].1.clone()).unwrap().command, SignalingCommand::Connect);

        // CONNECT_ACK flips us to Active, replies CONFIRM, starts keepalive
        let ack = SignalingPacket::new(SignalingCommand::ConnectAck, peer);
        socket.inject(peer_addr(), ack.to_bytes()).await;
        handler.drain_incoming().await;

        assert_eq!(handler.peer_status(&peer).await, PeerStatus::Active);
        let sent = socket.take_sent().await;
        assert_eq!(SignalingPacket::deser(sent[0].1.clone()).unwrap().command, SignalingCommand::Confirm);
        assert_eq!(handler.scheduled_commands_for(&peer).await, vec![SignalingCommand::Ping]);
        assert_eq!(drain_events(&mut events), vec![SignalingEvent::Established { peer }]);

        // their CONFIRM makes it mutual, exactly once
        let confirm = SignalingPacket::new(SignalingCommand::Confirm, peer);
        socket.inject(peer_addr(), confirm.to_bytes()).await;
        handler.drain_incoming().await;
        assert_eq!(drain_events(&mut events), vec![SignalingEvent::MutuallyEstablished { peer }]);
        assert!(handler.peer_is_mutual(&peer).await);

        // duplicate CONFIRM is a no-op
        let confirm = SignalingPacket::new(SignalingCommand::Confirm, peer);
        socket.inject(peer_addr(), confirm.to_bytes()).await;
        handler.drain_incoming().await;
        assert_eq!(drain_events(&mut events), vec![]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsolicited_connect_activates_peer() {
        let (handler, socket) = handler_with_socket().await;
        let mut events = handler.subscribe();
        let peer = identity_key("caller");

        let connect = SignalingPacket::new(SignalingCommand::Connect, peer);
        socket.inject(peer_addr(), connect.to_bytes()).await;
        handler.drain_incoming().await;

        assert_eq!(handler.peer_status(&peer).await, PeerStatus::Active);
        let sent = socket.take_sent().await;
        assert_eq!(SignalingPacket::deser(sent[0].1.clone()).unwrap().command, SignalingCommand::ConnectAck);
        assert_eq!(drain_events(&mut events), vec![SignalingEvent::Established { peer }]);

        // the ack is retransmitted until their CONFIRM arrives
        assert_eq!(handler.scheduled_commands_for(&peer).await, vec![SignalingCommand::ConnectAck]);
        let confirm = SignalingPacket::new(SignalingCommand::Confirm, peer);
        socket.inject(peer_addr(), confirm.to_bytes()).await;
        handler.drain_incoming().await;
        assert!(!handler.scheduled_commands_for(&peer).await.contains(&SignalingCommand::ConnectAck));
        assert_eq!(drain_events(&mut events), vec![SignalingEvent::MutuallyEstablished { peer }]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retransmits_until_liveness_timeout() {
        let (handler, socket) = handler_with_socket().await;
        let mut events = handler.subscribe();
        let peer = identity_key("silent");

        handler.connect_peer(peer, peer_addr()).await;
        socket.take_sent().await;

        // a few retransmission rounds happen while the peer stays silent
        time::advance(Duration::from_millis(1600)).await;
        handler.process_due().await;
        handler.sweep_liveness().await;
        assert!(!socket.take_sent().await.is_empty());
        assert_eq!(handler.peer_status(&peer).await, PeerStatus::Pending);

        // after the liveness window the sweep declares it dead, exactly once
        time::advance(Duration::from_secs(60)).await;
        handler.process_due().await;
        handler.sweep_liveness().await;
        handler.sweep_liveness().await;

        assert_eq!(handler.peer_status(&peer).await, PeerStatus::Inactive);
        assert_eq!(drain_events(&mut events), vec![SignalingEvent::Dead { peer, timeout: true }]);
        assert_eq!(handler.scheduled_commands_for(&peer).await, vec![]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_answered_with_pong() {
        let (handler, socket) = handler_with_socket().await;
        let peer = identity_key("remote");

        let connect = SignalingPacket::new(SignalingCommand::Connect, peer);
        socket.inject(peer_addr(), connect.to_bytes()).await;
        handler.drain_incoming().await;
        socket.take_sent().await;

        let ping = SignalingPacket::new(SignalingCommand::Ping, peer);
        socket.inject(peer_addr(), ping.to_bytes()).await;
        handler.drain_incoming().await;

        let sent = socket.take_sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(SignalingPacket::deser(sent[0].1.clone()).unwrap().command, SignalingCommand::Pong);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_reschedules_keepalive_to_slow_cadence() {
        let (handler, socket) = handler_with_socket().await;
        let peer = identity_key("remote");

        handler.connect_peer(peer, peer_addr()).await;
        let ack = SignalingPacket::new(SignalingCommand::ConnectAck, peer);
        socket.inject(peer_addr(), ack.to_bytes()).await;
        handler.drain_incoming().await;
        socket.take_sent().await;

        let before = handler.next_due().await.unwrap();

        let pong = SignalingPacket::new(SignalingCommand::Pong, peer);
        socket.inject(peer_addr(), pong.to_bytes()).await;
        handler.drain_incoming().await;

        // only one Ping entry exists, and it moved out to the slow cadence
        assert_eq!(handler.scheduled_commands_for(&peer).await, vec![SignalingCommand::Ping]);
        let after = handler.next_due().await.unwrap();
        assert!(after > before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_never_duplicates() {
        let (handler, socket) = handler_with_socket().await;
        let peer = identity_key("remote");

        // two outstanding commands for the peer: ConnectAck and Ping
        let connect = SignalingPacket::new(SignalingCommand::Connect, peer);
        socket.inject(peer_addr(), connect.to_bytes()).await;
        handler.drain_incoming().await;
        let pong = SignalingPacket::new(SignalingCommand::Pong, peer);
        socket.inject(peer_addr(), pong.to_bytes()).await;
        handler.drain_incoming().await;

        let mut commands = handler.scheduled_commands_for(&peer).await;
        commands.sort_by_key(|c| u32::from(*c));
        assert_eq!(commands, vec![SignalingCommand::ConnectAck, SignalingCommand::Ping]);

        // rescheduling one of them replaces its entry instead of adding one
        let pong = SignalingPacket::new(SignalingCommand::Pong, peer);
        socket.inject(peer_addr(), pong.to_bytes()).await;
        handler.drain_incoming().await;

        let mut commands = handler.scheduled_commands_for(&peer).await;
        commands.sort_by_key(|c| u32::from(*c));
        assert_eq!(commands, vec![SignalingCommand::ConnectAck, SignalingCommand::Ping]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_teardown_sends_finished_and_fires_dead() {
        let (handler, socket) = handler_with_socket().await;
        let mut events = handler.subscribe();
        let peer = identity_key("remote");

        let connect = SignalingPacket::new(SignalingCommand::Connect, peer);
        socket.inject(peer_addr(), connect.to_bytes()).await;
        handler.drain_incoming().await;
        socket.take_sent().await;
        drain_events(&mut events);

        handler.teardown_peer(peer).await;

        assert_eq!(handler.peer_status(&peer).await, PeerStatus::Inactive);
        let sent = socket.take_sent().await;
        assert_eq!(SignalingPacket::deser(sent[0].1.clone()).unwrap().command, SignalingCommand::Finished);
        assert_eq!(drain_events(&mut events), vec![SignalingEvent::Dead { peer, timeout: false }]);

        // their FINISHED_ACK stops the retransmission
        assert_eq!(handler.scheduled_commands_for(&peer).await, vec![SignalingCommand::Finished]);
        let ack = SignalingPacket::new(SignalingCommand::FinishedAck, peer);
        socket.inject(peer_addr(), ack.to_bytes()).await;
        handler.drain_incoming().await;
        assert_eq!(handler.scheduled_commands_for(&peer).await, vec![]);
        // and no second Dead event fires
        assert_eq!(drain_events(&mut events), vec![]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_received_finished_acked_and_dead() {
        let (handler, socket) = handler_with_socket().await;
        let mut events = handler.subscribe();
        let peer = identity_key("remote");

        let connect = SignalingPacket::new(SignalingCommand::Connect, peer);
        socket.inject(peer_addr(), connect.to_bytes()).await;
        handler.drain_incoming().await;
        socket.take_sent().await;
        drain_events(&mut events);

        let finished = SignalingPacket::new(SignalingCommand::Finished, peer);
        socket.inject(peer_addr(), finished.to_bytes()).await;
        handler.drain_incoming().await;

        assert_eq!(handler.peer_status(&peer).await, PeerStatus::Inactive);
        let sent = socket.take_sent().await;
        assert_eq!(SignalingPacket::deser(sent[0].1.clone()).unwrap().command, SignalingCommand::FinishedAck);
        assert_eq!(drain_events(&mut events), vec![SignalingEvent::Dead { peer, timeout: false }]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_datagram_dropped_without_state_change() {
        let (handler, socket) = handler_with_socket().await;
        let peer = identity_key("remote");
        handler.connect_peer(peer, peer_addr()).await;
        socket.take_sent().await;

        socket.inject(peer_addr(), Bytes::from_static(&[1, 2, 3])).await;
        handler.drain_incoming().await;

        assert_eq!(handler.peer_status(&peer).await, PeerStatus::Pending);
        assert!(socket.take_sent().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_room_scoped_packets_carry_local_member_id() {
        let (handler, socket) = handler_with_socket().await;
        handler.set_local_member(44, 7).await;
        let peer = PeerKey::RoomMember { room_id: 44, member_id: 2 };

        handler.connect_peer(peer, peer_addr()).await;

        let sent = socket.take_sent().await;
        let packet = SignalingPacket::deser(sent[0].1.clone()).unwrap();
        assert_eq!(packet.source, PeerKey::RoomMember { room_id: 44, member_id: 7 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_loop_drives_retransmission_and_timeout() {
        let (handler, socket) = handler_with_socket().await;
        let mut events = handler.subscribe();
        let peer = identity_key("silent");

        let worker = tokio::spawn(run_signaling(handler.clone()));

        handler.connect_peer(peer, peer_addr()).await;
        socket.take_sent().await;

        // paused time auto-advances while the worker sleeps
        time::sleep(Duration::from_secs(2)).await;
        assert!(!socket.take_sent().await.is_empty());

        time::sleep(Duration::from_secs(61)).await;
        assert_eq!(handler.peer_status(&peer).await, PeerStatus::Inactive);
        let events = drain_events(&mut events);
        assert_eq!(events, vec![SignalingEvent::Dead { peer, timeout: true }]);

        worker.abort();
    }
}
