use anyhow::bail;
use bytes::{BufMut, Bytes, BytesMut};

use crate::protocol::cursor::ByteCursor;
use crate::protocol::{CommandId, FrameKind, NotificationKind};

/// One self-contained protocol message.
///
/// `command` is kept as the raw wire integer because requests/replies and
/// notifications draw from different numbering spaces; dispatch narrows it
/// to [`CommandId`] or [`NotificationKind`] based on `kind`.
///
/// Layout: `kind: u8 | command: u16 | correlation_id: u64 (Request/Reply
/// only) | payload_len: u32 | payload`, all little-endian.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Frame {
    pub kind: FrameKind,
    pub command: u16,
    pub correlation_id: Option<u64>,
    pub payload: Bytes,
}

impl Frame {
    pub fn request(command: CommandId, correlation_id: u64, payload: Bytes) -> Frame {
        Frame {
            kind: FrameKind::Request,
            command: command.into(),
            correlation_id: Some(correlation_id),
            payload,
        }
    }

    pub fn reply(command: CommandId, correlation_id: u64, payload: Bytes) -> Frame {
        Frame {
            kind: FrameKind::Reply,
            command: command.into(),
            correlation_id: Some(correlation_id),
            payload,
        }
    }

    pub fn notification(kind: NotificationKind, payload: Bytes) -> Frame {
        Frame {
            kind: FrameKind::Notification,
            command: kind.into(),
            correlation_id: None,
            payload,
        }
    }

    pub fn server_info(protocol_version: u32) -> Frame {
        let mut payload = BytesMut::new();
        payload.put_u32_le(protocol_version);
        Frame {
            kind: FrameKind::ServerInfo,
            command: 0,
            correlation_id: None,
            payload: payload.freeze(),
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind.into());
        buf.put_u16_le(self.command);
        if let Some(correlation_id) = self.correlation_id {
            buf.put_u64_le(correlation_id);
        }
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);
    }

    /// Decodes one complete decrypted frame. Any malformation is an error:
    /// the transport treats it as fatal for the whole connection.
    pub fn deser(raw: Bytes) -> anyhow::Result<Frame> {
        let mut cursor = ByteCursor::new(raw);

        let raw_kind = cursor.get_u8();
        let Ok(kind) = FrameKind::try_from(raw_kind) else {
            bail!("unknown frame kind {}", raw_kind);
        };
        let command = cursor.get_u16();
        let correlation_id = match kind {
            FrameKind::Request | FrameKind::Reply => Some(cursor.get_u64()),
            FrameKind::Notification | FrameKind::ServerInfo => None,
        };
        let payload = cursor.get_bytes_prefixed();

        if cursor.error() {
            bail!("truncated frame of kind {:?}", kind);
        }
        if !cursor.is_exhausted() {
            bail!("{} trailing bytes after frame of kind {:?}", cursor.remaining(), kind);
        }

        Ok(Frame {
            kind,
            command,
            correlation_id,
            payload,
        })
    }

    /// The protocol version carried by a ServerInfo frame.
    pub fn server_info_version(&self) -> anyhow::Result<u32> {
        if self.kind != FrameKind::ServerInfo || self.payload.len() != 4 {
            bail!("not a well-formed ServerInfo frame");
        }
        let mut cursor = ByteCursor::new(self.payload.clone());
        Ok(cursor.get_u32())
    }
}
