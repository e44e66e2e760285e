//! Codec for the peer-to-peer signaling datagrams.
//!
//! Layout: `signature: u32 (big-endian magic) | version: u32 | command: u32 |
//! source`, where `source` is version-tagged: version 1 carries a 16-byte
//! user identity, version 2 carries `room_id: u64 + member_id: u16`.
//! Anything with an unknown signature or version is dropped by the caller,
//! with no state change.

use anyhow::bail;
use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::protocol::cursor::ByteCursor;
use crate::protocol::UserIdentity;

pub const SIGNALING_SIGNATURE: u32 = 0x4d4c_5347; // "MLSG"

#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum SignalingCommand {
    Ping = 0,
    Pong = 1,
    Connect = 2,
    ConnectAck = 3,
    Confirm = 4,
    Finished = 5,
    FinishedAck = 6,
}

/// Who a datagram is from/about: a bare user identity for general P2P, or a
/// room-scoped member for session P2P. Doubles as the peer table key.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum PeerKey {
    Identity(UserIdentity),
    RoomMember { room_id: u64, member_id: u16 },
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct SignalingPacket {
    pub command: SignalingCommand,
    pub source: PeerKey,
}

impl SignalingPacket {
    pub fn new(command: SignalingCommand, source: PeerKey) -> SignalingPacket {
        SignalingPacket { command, source }
    }

    fn version(&self) -> u32 {
        match self.source {
            PeerKey::Identity(_) => 1,
            PeerKey::RoomMember { .. } => 2,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(SIGNALING_SIGNATURE); // big-endian on the wire
        buf.put_u32_le(self.version());
        buf.put_u32_le(u32::from(self.command));
        match self.source {
            PeerKey::Identity(identity) => identity.ser(buf),
            PeerKey::RoomMember { room_id, member_id } => {
                buf.put_u64_le(room_id);
                buf.put_u16_le(member_id);
            }
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }

    pub fn deser(raw: Bytes) -> anyhow::Result<SignalingPacket> {
        let mut cursor = ByteCursor::new(raw);

        let signature = cursor.get_u32_be();
        if signature != SIGNALING_SIGNATURE {
            bail!("bad signaling signature {:#010x}", signature);
        }
        let version = cursor.get_u32();
        let raw_command = cursor.get_u32();
        let Ok(command) = SignalingCommand::try_from(raw_command) else {
            bail!("unknown signaling command {}", raw_command);
        };

        let source = match version {
            1 => PeerKey::Identity(cursor.get_identity()),
            2 => PeerKey::RoomMember {
                room_id: cursor.get_u64(),
                member_id: cursor.get_u16(),
            },
            v => bail!("unsupported signaling version {}", v),
        };
        if cursor.error() {
            bail!("truncated signaling packet");
        }

        Ok(SignalingPacket { command, source })
    }
}
