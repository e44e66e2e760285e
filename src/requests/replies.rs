//! Reply payload decoding.
//!
//! Every reply starts with a u16 result code; a non-Ok code terminates the
//! body. The command-specific body is decoded into a [`ResultBuffer`] (the
//! relocatable arena handed to the guest later) and, where the reply carries
//! authoritative room state, folded into the cache before the caller's
//! callback is enqueued.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tracing::warn;

use crate::protocol::cursor::ByteCursor;
use crate::protocol::records::{RoomRecord, ScoreEntryRecord, SignalingInfoRecord};
use crate::protocol::{CommandId, ErrorCode};
use crate::requests::result_buffer::ResultBuffer;
use crate::requests::{ReplyOutcome, RequestContext};
use crate::rooms::RoomCache;
use crate::signaling::packet::PeerKey;

pub(crate) struct DecodedReply {
    pub outcome: ReplyOutcome,
    /// peer whose address this reply revealed; forwarded to signaling
    pub signaling_peer: Option<(PeerKey, SocketAddr)>,
    /// our own member id in a room we just entered
    pub local_member: Option<(u64, u16)>,
}

impl DecodedReply {
    fn error(command: CommandId, error: ErrorCode) -> DecodedReply {
        DecodedReply {
            outcome: ReplyOutcome {
                command,
                error,
                data: None,
            },
            signaling_peer: None,
            local_member: None,
        }
    }
}

pub(crate) async fn decode_reply(
    command: CommandId,
    payload: Bytes,
    context: &RequestContext,
    rtt: Duration,
    cache: &RoomCache,
) -> DecodedReply {
    let mut cursor = ByteCursor::new(payload);

    let raw_error = cursor.get_u16();
    if cursor.error() {
        warn!("reply to {:?} too short for a result code", command);
        return DecodedReply::error(command, ErrorCode::Malformed);
    }
    let error = match ErrorCode::try_from(raw_error) {
        Ok(error) => error,
        Err(_) => {
            warn!("reply to {:?} carries unknown error code {}", command, raw_error);
            ErrorCode::ServerError
        }
    };
    if error != ErrorCode::Ok {
        // an application-level error ends the body; it goes back to the
        // caller through the normal callback path
        return DecodedReply::error(command, error);
    }

    let mut decoded = DecodedReply::error(command, ErrorCode::Ok);

    match command {
        CommandId::CreateRoom | CommandId::JoinRoom => {
            let member_id = cursor.get_u16();
            let record = RoomRecord::deser(&mut cursor);
            if !cursor.error() {
                let password = match context {
                    RequestContext::CreateJoin { password } => password.clone(),
                    RequestContext::None => None,
                };
                cache.apply_room_snapshot(&record, Some(member_id), password).await;
                decoded.local_member = Some((record.room_id, member_id));
                decoded.outcome.data = Some(build_room_result(&record));
            }
        }
        CommandId::LeaveRoom => {
            let room_id = cursor.get_u64();
            if !cursor.error() {
                cache.apply_local_leave(room_id).await;
                let mut buf = ResultBuffer::new();
                let offset = buf.alloc(8);
                buf.write_u64_at(offset, room_id);
                decoded.outcome.data = Some(buf);
            }
        }
        CommandId::GetRoomDataInternal => {
            let record = RoomRecord::deser(&mut cursor);
            if !cursor.error() {
                cache.apply_room_snapshot(&record, None, None).await;
                decoded.outcome.data = Some(build_room_result(&record));
            }
        }
        CommandId::SearchRoom => {
            let count = cursor.get_u16();
            let records: Vec<RoomRecord> = (0..count).map(|_| RoomRecord::deser(&mut cursor)).collect();
            if !cursor.error() {
                decoded.outcome.data = Some(build_search_result(&records));
            }
        }
        CommandId::GetNetworkTime => {
            let server_micros = cursor.get_u64();
            if !cursor.error() {
                let latency = rtt / 2;
                let local_micros = local_clock_micros();
                let offset = (server_micros as i64 + latency.as_micros() as i64) - local_micros as i64;
                cache.set_network_time_offset(offset).await;

                let mut buf = ResultBuffer::new();
                let offset_slot = buf.alloc(8);
                buf.write_u64_at(offset_slot, server_micros);
                decoded.outcome.data = Some(buf);
            }
        }
        CommandId::PingRoomOwner => {
            let rtt_micros = cursor.get_u32();
            if !cursor.error() {
                let mut buf = ResultBuffer::new();
                let offset = buf.alloc(4);
                buf.write_u32_at(offset, rtt_micros);
                decoded.outcome.data = Some(buf);
            }
        }
        CommandId::RequestSignalingInfos => {
            let record = SignalingInfoRecord::deser(&mut cursor);
            if !cursor.error() {
                let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::from(record.addr.to_be_bytes())), record.port);
                decoded.signaling_peer = Some((PeerKey::Identity(record.identity), addr));

                let mut buf = ResultBuffer::new();
                let header = buf.alloc(8);
                buf.write_u32_at(header, record.addr);
                buf.write_u16_at(header + 4, record.port);
                decoded.outcome.data = Some(buf);
            }
        }
        CommandId::RecordScore => {
            let rank = cursor.get_u32();
            if !cursor.error() {
                let mut buf = ResultBuffer::new();
                let offset = buf.alloc(4);
                buf.write_u32_at(offset, rank);
                decoded.outcome.data = Some(buf);
            }
        }
        CommandId::GetScoreRange => {
            let count = cursor.get_u32();
            let entries: Vec<ScoreEntryRecord> = (0..count).map(|_| ScoreEntryRecord::deser(&mut cursor)).collect();
            if !cursor.error() {
                decoded.outcome.data = Some(build_score_result(&entries));
            }
        }
        CommandId::GetServerList => {
            let count = cursor.get_u16();
            let ids: Vec<u16> = (0..count).map(|_| cursor.get_u16()).collect();
            if !cursor.error() {
                let mut buf = ResultBuffer::new();
                let header = buf.alloc(4);
                buf.write_u16_at(header, ids.len() as u16);
                for id in ids {
                    let offset = buf.alloc(2);
                    buf.write_u16_at(offset, id);
                }
                decoded.outcome.data = Some(buf);
            }
        }
        CommandId::GetWorldList => {
            let count = cursor.get_u32();
            let ids: Vec<u32> = (0..count).map(|_| cursor.get_u32()).collect();
            if !cursor.error() {
                let mut buf = ResultBuffer::new();
                let header = buf.alloc(4);
                buf.write_u32_at(header, ids.len() as u32);
                for id in ids {
                    let offset = buf.alloc(4);
                    buf.write_u32_at(offset, id);
                }
                decoded.outcome.data = Some(buf);
            }
        }
        // pure acknowledgements: the result code is the whole story
        CommandId::SetRoomDataExternal
        | CommandId::SetRoomDataInternal
        | CommandId::SetRoomMemberDataInternal
        | CommandId::SendRoomMessage
        | CommandId::SetPresence
        | CommandId::Login
        | CommandId::Terminate => {}
    }

    if cursor.error() {
        warn!("malformed reply body for {:?}", command);
        decoded.outcome.error = ErrorCode::Malformed;
        decoded.outcome.data = None;
        decoded.signaling_peer = None;
        decoded.local_member = None;
    }
    decoded
}

fn local_clock_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Guest-facing room layout:
/// header (24 bytes): room_id u64, slot_count u16, member_count u16,
/// flags u32, members reference slot; member entries (32 bytes each):
/// member_id u16, team_id u8, nat_type u8, flags u32, join_time u64,
/// identity reference slot, attribute count u32, padding; identity strings
/// NUL-terminated at the tail.
pub(crate) fn build_room_result(record: &RoomRecord) -> ResultBuffer {
    const HEADER_SIZE: usize = 24;
    const MEMBER_SIZE: usize = 32;

    let mut buf = ResultBuffer::new();
    let header = buf.alloc(HEADER_SIZE);
    buf.write_u64_at(header, record.room_id);
    buf.write_u16_at(header + 8, record.slot_count);
    buf.write_u16_at(header + 10, record.members.len() as u16);
    buf.write_u32_at(header + 12, record.flags);

    if record.members.is_empty() {
        return buf;
    }

    let members_start = buf.alloc(MEMBER_SIZE * record.members.len());
    buf.record_reference(header + 16, members_start);

    for (i, member) in record.members.iter().enumerate() {
        let entry = members_start + i * MEMBER_SIZE;
        buf.write_u16_at(entry, member.member_id);
        buf.write_u8_at(entry + 2, member.team_id);
        buf.write_u8_at(entry + 3, member.nat_type);
        buf.write_u32_at(entry + 4, member.flags);
        buf.write_u64_at(entry + 8, member.join_time);
        buf.write_u32_at(entry + 24, member.attributes.len() as u32);
    }

    // strings go after the array so the entries stay fixed-width
    for (i, member) in record.members.iter().enumerate() {
        let entry = members_start + i * MEMBER_SIZE;
        let name = buf.push_str_nul(member.identity.name());
        buf.record_reference(entry + 16, name);
    }

    buf
}

/// Search results: count u32, padding, entries reference slot; entries
/// (16 bytes each): room_id u64, slot_count u16, member_count u16, flags u32.
pub(crate) fn build_search_result(records: &[RoomRecord]) -> ResultBuffer {
    const HEADER_SIZE: usize = 16;
    const ENTRY_SIZE: usize = 16;

    let mut buf = ResultBuffer::new();
    let header = buf.alloc(HEADER_SIZE);
    buf.write_u32_at(header, records.len() as u32);

    if records.is_empty() {
        return buf;
    }

    let entries_start = buf.alloc(ENTRY_SIZE * records.len());
    buf.record_reference(header + 8, entries_start);

    for (i, record) in records.iter().enumerate() {
        let entry = entries_start + i * ENTRY_SIZE;
        buf.write_u64_at(entry, record.room_id);
        buf.write_u16_at(entry + 8, record.slot_count);
        buf.write_u16_at(entry + 10, record.members.len() as u16);
        buf.write_u32_at(entry + 12, record.flags);
    }

    buf
}

/// Score ranges: count u32, padding, entries reference slot; entries
/// (32 bytes each): rank u32, padding, score u64, identity reference,
/// comment reference; strings at the tail.
pub(crate) fn build_score_result(entries: &[ScoreEntryRecord]) -> ResultBuffer {
    const HEADER_SIZE: usize = 16;
    const ENTRY_SIZE: usize = 32;

    let mut buf = ResultBuffer::new();
    let header = buf.alloc(HEADER_SIZE);
    buf.write_u32_at(header, entries.len() as u32);

    if entries.is_empty() {
        return buf;
    }

    let entries_start = buf.alloc(ENTRY_SIZE * entries.len());
    buf.record_reference(header + 8, entries_start);

    for (i, entry) in entries.iter().enumerate() {
        let at = entries_start + i * ENTRY_SIZE;
        buf.write_u32_at(at, entry.rank);
        buf.write_u64_at(at + 8, entry.score as u64);
    }

    for (i, entry) in entries.iter().enumerate() {
        let at = entries_start + i * ENTRY_SIZE;
        let identity = buf.push_str_nul(entry.identity.name());
        buf.record_reference(at + 16, identity);
        let comment = buf.push_str_nul(&entry.comment);
        buf.record_reference(at + 24, comment);
    }

    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::records::test_data;
    use bytes::{BufMut, BytesMut};

    fn ok_payload(body: impl FnOnce(&mut BytesMut)) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u16_le(u16::from(ErrorCode::Ok));
        body(&mut buf);
        buf.freeze()
    }

    #[tokio::test]
    async fn test_create_room_reply_updates_cache_and_builds_buffer() {
        let cache = RoomCache::new();
        let record = test_data::room(7, &[1, 2]);
        let payload = ok_payload(|buf| {
            buf.put_u16_le(2); // our member id
            record.ser(buf);
        });

        let context = RequestContext::CreateJoin {
            password: Some(b"pw".to_vec()),
        };
        let decoded = decode_reply(CommandId::CreateRoom, payload, &context, Duration::ZERO, &cache).await;

        assert_eq!(decoded.outcome.error, ErrorCode::Ok);
        assert_eq!(decoded.local_member, Some((7, 2)));
        assert_eq!(cache.member_count(7).await.unwrap(), 2);
        assert_eq!(cache.local_member_id(7).await.unwrap(), Some(2));

        let data = decoded.outcome.data.unwrap();
        assert_eq!(&data.data()[0..8], &7u64.to_le_bytes());
        assert_eq!(&data.data()[10..12], &2u16.to_le_bytes());
        assert_eq!(data.reference_count(), 1 + 2); // members array + one identity each
    }

    #[tokio::test]
    async fn test_error_reply_carries_code_and_no_body() {
        let cache = RoomCache::new();
        let mut payload = BytesMut::new();
        payload.put_u16_le(u16::from(ErrorCode::RoomFull));

        let decoded = decode_reply(CommandId::JoinRoom, payload.freeze(), &RequestContext::None, Duration::ZERO, &cache).await;

        assert_eq!(decoded.outcome.error, ErrorCode::RoomFull);
        assert!(decoded.outcome.data.is_none());
        assert!(cache.room_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_reply_body_is_request_level_error() {
        let cache = RoomCache::new();
        let payload = ok_payload(|buf| {
            buf.put_u16_le(1);
            buf.put_slice(&[1, 2, 3]); // not a room record
        });

        let decoded = decode_reply(CommandId::JoinRoom, payload, &RequestContext::None, Duration::ZERO, &cache).await;

        assert_eq!(decoded.outcome.error, ErrorCode::Malformed);
        assert!(decoded.outcome.data.is_none());
        assert!(cache.room_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_leave_room_reply_drops_mirror() {
        let cache = RoomCache::new();
        cache.apply_room_snapshot(&test_data::room(9, &[1]), Some(1), None).await;

        let payload = ok_payload(|buf| buf.put_u64_le(9));
        let decoded = decode_reply(CommandId::LeaveRoom, payload, &RequestContext::None, Duration::ZERO, &cache).await;

        assert_eq!(decoded.outcome.error, ErrorCode::Ok);
        assert!(cache.room_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_network_time_reply_sets_offset() {
        let cache = RoomCache::new();
        let server_micros = local_clock_micros() + 5_000_000; // server 5s ahead
        let payload = ok_payload(|buf| buf.put_u64_le(server_micros));

        let decoded = decode_reply(CommandId::GetNetworkTime, payload, &RequestContext::None, Duration::from_millis(100), &cache).await;

        assert_eq!(decoded.outcome.error, ErrorCode::Ok);
        let now = local_clock_micros();
        let network_now = cache.network_time(now).await.unwrap();
        // offset ~5s plus half the rtt, with some slack for test scheduling
        let ahead = network_now as i64 - now as i64;
        assert!((4_900_000..5_200_000).contains(&ahead), "ahead by {}", ahead);
    }

    #[tokio::test]
    async fn test_signaling_infos_reply_names_the_peer() {
        let cache = RoomCache::new();
        let record = SignalingInfoRecord {
            identity: crate::protocol::UserIdentity::from_name("peer"),
            addr: u32::from_be_bytes([10, 1, 2, 3]),
            port: 3658,
        };
        let payload = ok_payload(|buf| record.ser(buf));

        let decoded = decode_reply(CommandId::RequestSignalingInfos, payload, &RequestContext::None, Duration::ZERO, &cache).await;

        let (peer, addr) = decoded.signaling_peer.unwrap();
        assert_eq!(peer, PeerKey::Identity(crate::protocol::UserIdentity::from_name("peer")));
        assert_eq!(addr, "10.1.2.3:3658".parse().unwrap());
    }

    #[tokio::test]
    async fn test_score_range_reply_builds_relocatable_buffer() {
        let cache = RoomCache::new();
        let entries = vec![
            ScoreEntryRecord {
                rank: 1,
                identity: crate::protocol::UserIdentity::from_name("first"),
                score: 9999,
                comment: "gg".to_owned(),
            },
            ScoreEntryRecord {
                rank: 2,
                identity: crate::protocol::UserIdentity::from_name("second"),
                score: -5,
                comment: String::new(),
            },
        ];
        let payload = ok_payload(|buf| {
            buf.put_u32_le(2);
            for entry in &entries {
                entry.ser(buf);
            }
        });

        let decoded = decode_reply(CommandId::GetScoreRange, payload, &RequestContext::None, Duration::ZERO, &cache).await;

        let mut data = decoded.outcome.data.unwrap();
        assert_eq!(&data.data()[0..4], &2u32.to_le_bytes());
        assert_eq!(data.reference_count(), 1 + 2 * 2);

        data.apply_relocations(0x1_0000).unwrap();
        let entries_addr = u64::from_le_bytes(data.data()[8..16].try_into().unwrap());
        assert!(entries_addr >= 0x1_0000);
        let first = (entries_addr - 0x1_0000) as usize;
        assert_eq!(&data.data()[first..first + 4], &1u32.to_le_bytes());
        let identity_addr = u64::from_le_bytes(data.data()[first + 16..first + 24].try_into().unwrap());
        let identity_at = (identity_addr - 0x1_0000) as usize;
        assert_eq!(&data.data()[identity_at..identity_at + 6], b"first\0");
    }

    #[tokio::test]
    async fn test_search_room_reply() {
        let cache = RoomCache::new();
        let rooms = vec![test_data::room(5, &[1]), test_data::room(6, &[1, 2, 3])];
        let payload = ok_payload(|buf| {
            buf.put_u16_le(2);
            for room in &rooms {
                room.ser(buf);
            }
        });

        let decoded = decode_reply(CommandId::SearchRoom, payload, &RequestContext::None, Duration::ZERO, &cache).await;

        let data = decoded.outcome.data.unwrap();
        assert_eq!(&data.data()[0..4], &2u32.to_le_bytes());
        // search results are display data; nothing lands in the cache
        assert!(cache.room_ids().await.is_empty());
    }
}
