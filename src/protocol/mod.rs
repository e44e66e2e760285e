use std::fmt::{Debug, Formatter};

use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

pub mod cursor;
pub mod frame;
pub mod records;

/// Protocol version announced by the service in its ServerInfo frame. A
/// mismatch is fatal for the connection.
pub const PROTOCOL_VERSION: u32 = 29;

#[derive(Clone, Copy, Eq, PartialEq, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum FrameKind {
    Request = 0,
    Reply = 1,
    Notification = 2,
    ServerInfo = 3,
}

#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum CommandId {
    Login = 0,
    Terminate = 1,
    GetServerList = 16,
    GetWorldList = 17,
    CreateRoom = 18,
    JoinRoom = 19,
    LeaveRoom = 20,
    SearchRoom = 21,
    SetRoomDataExternal = 22,
    GetRoomDataInternal = 23,
    SetRoomDataInternal = 24,
    SetRoomMemberDataInternal = 25,
    PingRoomOwner = 26,
    SendRoomMessage = 27,
    RequestSignalingInfos = 28,
    GetNetworkTime = 29,
    RecordScore = 32,
    GetScoreRange = 33,
    SetPresence = 48,
}

/// Notifications reuse the command id slot of the frame header; they form
/// their own numbering space starting above the request commands.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum NotificationKind {
    UserJoinedRoom = 256,
    UserLeftRoom = 257,
    RoomDestroyed = 258,
    UpdatedRoomDataInternal = 259,
    UpdatedRoomMemberDataInternal = 260,
    RoomMessageReceived = 261,
    SignalingHelper = 262,
    FriendPresenceChanged = 263,
}

/// Application-level result code carried as the first u16 of every reply
/// payload. Anything but `Ok` terminates the reply body, and is surfaced to
/// the caller through its callback rather than through connection teardown.
#[derive(Clone, Copy, Eq, PartialEq, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum ErrorCode {
    Ok = 0,
    NotFound = 1,
    RoomMissing = 2,
    RoomFull = 3,
    PasswordMismatch = 4,
    Unauthorized = 5,
    Timeout = 6,
    Malformed = 7,
    ServerError = 8,
}

/// Fixed-width user identity as it appears in wire records and version-1
/// signaling datagrams. Shorter names are NUL-padded.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct UserIdentity(pub [u8; 16]);

impl UserIdentity {
    pub fn from_name(name: &str) -> UserIdentity {
        let mut raw = [0u8; 16];
        let n = name.len().min(16);
        raw[..n].copy_from_slice(&name.as_bytes()[..n]);
        UserIdentity(raw)
    }

    pub fn name(&self) -> &str {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(16);
        std::str::from_utf8(&self.0[..end]).unwrap_or("")
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.0);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<UserIdentity> {
        if buf.remaining() < 16 {
            anyhow::bail!("buffer too short for user identity");
        }
        let mut raw = [0u8; 16];
        buf.copy_to_slice(&mut raw);
        Ok(UserIdentity(raw))
    }
}

impl Debug for UserIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[id:{}]", self.name())
    }
}

impl Default for UserIdentity {
    fn default() -> UserIdentity {
        UserIdentity([0u8; 16])
    }
}
