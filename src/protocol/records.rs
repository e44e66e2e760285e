//! Nested sub-messages embedded in frame payloads.
//!
//! A record travels as a length-prefixed byte range whose first byte is a
//! schema tag. The sub-decoder validates the tag and the record's field
//! layout; rejection poisons the parent cursor exactly like a primitive
//! under-read, so callers still check a single error flag per payload.

use bytes::{BufMut, BytesMut};
use rustc_hash::FxHashMap;

use crate::protocol::cursor::ByteCursor;
use crate::protocol::UserIdentity;
use crate::util::buf::{put_bytes_prefixed, put_string};

const SCHEMA_ROOM: u8 = 1;
const SCHEMA_GROUP: u8 = 2;
const SCHEMA_MEMBER: u8 = 3;
const SCHEMA_SIGNALING_INFO: u8 = 4;
const SCHEMA_SCORE_ENTRY: u8 = 5;
const SCHEMA_PRESENCE: u8 = 6;

#[derive(Clone, Eq, PartialEq, Debug)]
pub enum AttributeValue {
    Int(u32),
    Bin(Vec<u8>),
}

#[derive(Clone, Default, Eq, PartialEq, Debug)]
pub struct RoomRecord {
    pub room_id: u64,
    pub slot_count: u16,
    pub flags: u32,
    pub password_slot_mask: u64,
    pub owner_member_id: u16,
    pub groups: Vec<GroupRecord>,
    pub members: Vec<MemberRecord>,
}

#[derive(Clone, Default, Eq, PartialEq, Debug)]
pub struct GroupRecord {
    pub group_id: u8,
    pub slot_num: u32,
    pub with_password: bool,
    pub label: String,
}

#[derive(Clone, Default, Eq, PartialEq, Debug)]
pub struct MemberRecord {
    pub member_id: u16,
    pub identity: UserIdentity,
    pub join_time: u64,
    pub team_id: u8,
    /// 0 means "not in any group" on the wire.
    pub group_id: u8,
    pub nat_type: u8,
    pub flags: u32,
    pub attributes: FxHashMap<u16, AttributeValue>,
}

#[derive(Clone, Default, Eq, PartialEq, Debug)]
pub struct SignalingInfoRecord {
    pub identity: UserIdentity,
    pub addr: u32,
    pub port: u16,
}

#[derive(Clone, Default, Eq, PartialEq, Debug)]
pub struct ScoreEntryRecord {
    pub rank: u32,
    pub identity: UserIdentity,
    pub score: i64,
    pub comment: String,
}

#[derive(Clone, Default, Eq, PartialEq, Debug)]
pub struct PresenceRecord {
    pub identity: UserIdentity,
    pub title: String,
    pub status: String,
    pub comment: String,
    pub data: Vec<u8>,
}

fn ser_nested(buf: &mut BytesMut, ser_body: impl FnOnce(&mut BytesMut)) {
    let mut body = BytesMut::new();
    ser_body(&mut body);
    put_bytes_prefixed(buf, &body);
}

/// Extracts the nested range, validates the schema tag, and runs the field
/// decoder. Any failure inside the record poisons the parent cursor and
/// yields the record's default value.
fn deser_nested<T: Default>(
    parent: &mut ByteCursor,
    schema: u8,
    deser_body: impl FnOnce(&mut ByteCursor) -> T,
) -> T {
    let mut sub = parent.sub_record();
    if parent.error() {
        return T::default();
    }
    if sub.get_u8() != schema {
        parent.mark_error();
        return T::default();
    }
    let record = deser_body(&mut sub);
    if sub.error() {
        parent.mark_error();
        return T::default();
    }
    record
}

impl RoomRecord {
    pub fn ser(&self, buf: &mut BytesMut) {
        ser_nested(buf, |body| {
            body.put_u8(SCHEMA_ROOM);
            body.put_u64_le(self.room_id);
            body.put_u16_le(self.slot_count);
            body.put_u32_le(self.flags);
            body.put_u64_le(self.password_slot_mask);
            body.put_u16_le(self.owner_member_id);
            body.put_u8(self.groups.len() as u8);
            for group in &self.groups {
                group.ser(body);
            }
            body.put_u16_le(self.members.len() as u16);
            for member in &self.members {
                member.ser(body);
            }
        });
    }

    pub fn deser(parent: &mut ByteCursor) -> RoomRecord {
        deser_nested(parent, SCHEMA_ROOM, |sub| {
            let room_id = sub.get_u64();
            let slot_count = sub.get_u16();
            let flags = sub.get_u32();
            let password_slot_mask = sub.get_u64();
            let owner_member_id = sub.get_u16();
            let num_groups = sub.get_u8();
            let groups = (0..num_groups).map(|_| GroupRecord::deser(sub)).collect();
            let num_members = sub.get_u16();
            let members = (0..num_members).map(|_| MemberRecord::deser(sub)).collect();
            RoomRecord {
                room_id,
                slot_count,
                flags,
                password_slot_mask,
                owner_member_id,
                groups,
                members,
            }
        })
    }
}

impl GroupRecord {
    pub fn ser(&self, buf: &mut BytesMut) {
        ser_nested(buf, |body| {
            body.put_u8(SCHEMA_GROUP);
            body.put_u8(self.group_id);
            body.put_u32_le(self.slot_num);
            body.put_u8(self.with_password as u8);
            put_string(body, &self.label);
        });
    }

    pub fn deser(parent: &mut ByteCursor) -> GroupRecord {
        deser_nested(parent, SCHEMA_GROUP, |sub| GroupRecord {
            group_id: sub.get_u8(),
            slot_num: sub.get_u32(),
            with_password: sub.get_u8() != 0,
            label: sub.get_string(),
        })
    }
}

impl MemberRecord {
    pub fn ser(&self, buf: &mut BytesMut) {
        ser_nested(buf, |body| {
            body.put_u8(SCHEMA_MEMBER);
            body.put_u16_le(self.member_id);
            self.identity.ser(body);
            body.put_u64_le(self.join_time);
            body.put_u8(self.team_id);
            body.put_u8(self.group_id);
            body.put_u8(self.nat_type);
            body.put_u32_le(self.flags);
            body.put_u8(self.attributes.len() as u8);
            for (&id, value) in &self.attributes {
                body.put_u16_le(id);
                match value {
                    AttributeValue::Int(n) => {
                        body.put_u8(0);
                        body.put_u32_le(*n);
                    }
                    AttributeValue::Bin(raw) => {
                        body.put_u8(1);
                        put_bytes_prefixed(body, raw);
                    }
                }
            }
        });
    }

    pub fn deser(parent: &mut ByteCursor) -> MemberRecord {
        deser_nested(parent, SCHEMA_MEMBER, |sub| {
            let member_id = sub.get_u16();
            let identity = sub.get_identity();
            let join_time = sub.get_u64();
            let team_id = sub.get_u8();
            let group_id = sub.get_u8();
            let nat_type = sub.get_u8();
            let flags = sub.get_u32();
            let num_attributes = sub.get_u8();
            let mut attributes = FxHashMap::default();
            for _ in 0..num_attributes {
                let id = sub.get_u16();
                let value = match sub.get_u8() {
                    0 => AttributeValue::Int(sub.get_u32()),
                    1 => AttributeValue::Bin(sub.get_bytes_prefixed().to_vec()),
                    _ => {
                        sub.mark_error();
                        break;
                    }
                };
                attributes.insert(id, value);
            }
            MemberRecord {
                member_id,
                identity,
                join_time,
                team_id,
                group_id,
                nat_type,
                flags,
                attributes,
            }
        })
    }
}

impl SignalingInfoRecord {
    pub fn ser(&self, buf: &mut BytesMut) {
        ser_nested(buf, |body| {
            body.put_u8(SCHEMA_SIGNALING_INFO);
            self.identity.ser(body);
            body.put_u32_le(self.addr);
            body.put_u16_le(self.port);
        });
    }

    pub fn deser(parent: &mut ByteCursor) -> SignalingInfoRecord {
        deser_nested(parent, SCHEMA_SIGNALING_INFO, |sub| SignalingInfoRecord {
            identity: sub.get_identity(),
            addr: sub.get_u32(),
            port: sub.get_u16(),
        })
    }
}

impl ScoreEntryRecord {
    pub fn ser(&self, buf: &mut BytesMut) {
        ser_nested(buf, |body| {
            body.put_u8(SCHEMA_SCORE_ENTRY);
            body.put_u32_le(self.rank);
            self.identity.ser(body);
            body.put_u64_le(self.score as u64);
            put_string(body, &self.comment);
        });
    }

    pub fn deser(parent: &mut ByteCursor) -> ScoreEntryRecord {
        deser_nested(parent, SCHEMA_SCORE_ENTRY, |sub| ScoreEntryRecord {
            rank: sub.get_u32(),
            identity: sub.get_identity(),
            score: sub.get_i64(),
            comment: sub.get_string(),
        })
    }
}

impl PresenceRecord {
    pub fn ser(&self, buf: &mut BytesMut) {
        ser_nested(buf, |body| {
            body.put_u8(SCHEMA_PRESENCE);
            self.identity.ser(body);
            put_string(body, &self.title);
            put_string(body, &self.status);
            put_string(body, &self.comment);
            put_bytes_prefixed(body, &self.data);
        });
    }

    pub fn deser(parent: &mut ByteCursor) -> PresenceRecord {
        deser_nested(parent, SCHEMA_PRESENCE, |sub| PresenceRecord {
            identity: sub.get_identity(),
            title: sub.get_string(),
            status: sub.get_string(),
            comment: sub.get_string(),
            data: sub.get_bytes_prefixed().to_vec(),
        })
    }
}
