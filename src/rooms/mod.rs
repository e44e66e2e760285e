//! Local mirror of room/member/presence state.
//!
//! The service pushes authoritative state through replies and notifications;
//! this cache is the single source of truth for what the local client
//! currently believes about a room, and answers local queries without a
//! network round trip. One coarse lock covers all operations; concurrent
//! updates to the same room are serialized here and resolve last-write-wins
//! per field group, with no merge logic.

use std::fmt::{Display, Formatter};

use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::protocol::records::{AttributeValue, MemberRecord, PresenceRecord, RoomRecord};
use crate::protocol::UserIdentity;

/// Local query against a room/member that is not (or no longer) mirrored.
/// No network round-trip is attempted for these.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum QueryError {
    RoomNotFound,
    MemberNotFound,
}

impl Display for QueryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryError::RoomNotFound => write!(f, "room is not in the local mirror"),
            QueryError::MemberNotFound => write!(f, "member is not in the local mirror"),
        }
    }
}
impl std::error::Error for QueryError {}

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Member {
    pub member_id: u16,
    pub identity: UserIdentity,
    pub join_time: u64,
    pub team_id: u8,
    pub group_id: Option<u8>,
    pub nat_type: u8,
    pub flags: u32,
    pub attributes: FxHashMap<u16, AttributeValue>,
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Group {
    pub group_id: u8,
    pub slot_num: u32,
    pub with_password: bool,
    pub label: String,
}

#[derive(Clone, Debug)]
pub struct Room {
    pub room_id: u64,
    pub slot_count: u16,
    pub flags: u32,
    pub password_slot_mask: u64,
    pub owner_member_id: u16,
    pub groups: FxHashMap<u8, Group>,
    pub members: FxHashMap<u16, Member>,
    /// member id of the local client inside this room, if it joined (rather
    /// than merely mirroring the room)
    pub local_member_id: Option<u16>,
    /// kept verbatim while the local client owns the room
    pub password: Option<Vec<u8>>,
}

impl Room {
    pub fn is_local_owner(&self) -> bool {
        self.local_member_id == Some(self.owner_member_id)
    }

    /// Occupancy mask derived from the member table: member id n occupies
    /// slot bit n-1.
    pub fn joined_slot_mask(&self) -> u64 {
        self.members
            .keys()
            .filter(|&&id| id >= 1 && id as usize <= 64)
            .fold(0u64, |mask, &id| mask | 1 << (id - 1))
    }
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct SlotInfo {
    pub room_id: u64,
    pub slot_count: u16,
    pub joined_slot_mask: u64,
    pub password_slot_mask: u64,
    pub open_public_slot_num: u16,
    pub open_private_slot_num: u16,
}

#[derive(Clone, Default, Eq, PartialEq, Debug)]
pub struct PresenceInfo {
    pub title: String,
    pub status: String,
    pub comment: String,
    pub data: Vec<u8>,
}

#[derive(Default)]
struct CacheInner {
    rooms: FxHashMap<u64, Room>,
    presence: FxHashMap<UserIdentity, PresenceInfo>,
    /// microseconds to add to the local clock to obtain server time
    network_time_offset: Option<i64>,
    stale: bool,
}

pub struct RoomCache {
    inner: RwLock<CacheInner>,
}

fn member_from_record(record: &MemberRecord, groups: &FxHashMap<u8, Group>) -> Member {
    let group_id = match record.group_id {
        0 => None,
        id if groups.contains_key(&id) => Some(id),
        id => {
            warn!("member {} references unknown group {} - dropping the reference", record.member_id, id);
            None
        }
    };
    Member {
        member_id: record.member_id,
        identity: record.identity,
        join_time: record.join_time,
        team_id: record.team_id,
        group_id,
        nat_type: record.nat_type,
        flags: record.flags,
        attributes: record.attributes.clone(),
    }
}

impl RoomCache {
    pub fn new() -> RoomCache {
        RoomCache {
            inner: RwLock::new(CacheInner::default()),
        }
    }

    /// Replaces the mirrored state of a room with a full snapshot from a
    /// create/join reply or a room-data fetch. Clears staleness: a snapshot
    /// is the rebuild step after a reconnect.
    pub async fn apply_room_snapshot(&self, record: &RoomRecord, local_member_id: Option<u16>, password: Option<Vec<u8>>) {
        let mut inner = self.inner.write().await;
        inner.stale = false;

        let groups: FxHashMap<u8, Group> = record
            .groups
            .iter()
            .map(|g| {
                (g.group_id, Group {
                    group_id: g.group_id,
                    slot_num: g.slot_num,
                    with_password: g.with_password,
                    label: g.label.clone(),
                })
            })
            .collect();
        let members = record
            .members
            .iter()
            .map(|m| (m.member_id, member_from_record(m, &groups)))
            .collect();

        // carry over local identity and password from an earlier snapshot
        // unless the caller provides fresh ones
        let previous = inner.rooms.get(&record.room_id);
        let local_member_id = local_member_id.or_else(|| previous.and_then(|r| r.local_member_id));
        let password = password.or_else(|| previous.and_then(|r| r.password.clone()));

        debug!("mirroring room {} with {} members", record.room_id, record.members.len());
        inner.rooms.insert(record.room_id, Room {
            room_id: record.room_id,
            slot_count: record.slot_count,
            flags: record.flags,
            password_slot_mask: record.password_slot_mask,
            owner_member_id: record.owner_member_id,
            groups,
            members,
            local_member_id,
            password,
        });
    }

    /// insert_or_replace: applying the same join twice leaves the cache in
    /// the same state as applying it once.
    pub async fn apply_member_joined(&self, room_id: u64, record: &MemberRecord) {
        let mut inner = self.inner.write().await;
        let Some(room) = inner.rooms.get_mut(&room_id) else {
            debug!("member-joined for unmirrored room {} - ignoring", room_id);
            return;
        };
        let member = member_from_record(record, &room.groups);
        room.members.insert(member.member_id, member);
    }

    pub async fn apply_member_left(&self, room_id: u64, member_id: u16) {
        let mut inner = self.inner.write().await;
        let Some(room) = inner.rooms.get_mut(&room_id) else {
            return;
        };
        if room.members.remove(&member_id).is_none() {
            debug!("member-left for unknown member {} of room {}", member_id, room_id);
        }
        if room.local_member_id == Some(member_id) {
            room.local_member_id = None;
            room.password = None;
        }
    }

    /// Attribute update for a single member; replaces the member wholesale
    /// (last write wins).
    pub async fn apply_member_updated(&self, room_id: u64, record: &MemberRecord) {
        self.apply_member_joined(room_id, record).await;
    }

    /// Room-level attribute update: flags, password slot mask, groups and
    /// ownership change as one field group; the member table is left alone.
    pub async fn apply_room_updated(&self, record: &RoomRecord) {
        let mut inner = self.inner.write().await;
        let Some(room) = inner.rooms.get_mut(&record.room_id) else {
            debug!("room-updated for unmirrored room {} - ignoring", record.room_id);
            return;
        };
        room.flags = record.flags;
        room.password_slot_mask = record.password_slot_mask;
        room.owner_member_id = record.owner_member_id;
        room.groups = record
            .groups
            .iter()
            .map(|g| {
                (g.group_id, Group {
                    group_id: g.group_id,
                    slot_num: g.slot_num,
                    with_password: g.with_password,
                    label: g.label.clone(),
                })
            })
            .collect();
    }

    pub async fn apply_room_destroyed(&self, room_id: u64) -> bool {
        self.inner.write().await.rooms.remove(&room_id).is_some()
    }

    /// The local client left on its own initiative; the mirror for that room
    /// is dropped entirely.
    pub async fn apply_local_leave(&self, room_id: u64) {
        self.inner.write().await.rooms.remove(&room_id);
    }

    pub async fn set_room_password(&self, room_id: u64, password: Option<Vec<u8>>) {
        if let Some(room) = self.inner.write().await.rooms.get_mut(&room_id) {
            room.password = password;
        }
    }

    // ---- local queries ------------------------------------------------

    pub async fn room_ids(&self) -> Vec<u64> {
        self.inner.read().await.rooms.keys().copied().collect()
    }

    pub async fn slot_info(&self, room_id: u64) -> Result<SlotInfo, QueryError> {
        let inner = self.inner.read().await;
        let room = inner.rooms.get(&room_id).ok_or(QueryError::RoomNotFound)?;

        let joined = room.joined_slot_mask();
        let mut open_public = 0u16;
        let mut open_private = 0u16;
        for slot in 0..room.slot_count.min(64) {
            let bit = 1u64 << slot;
            if joined & bit != 0 {
                continue;
            }
            if room.password_slot_mask & bit != 0 {
                open_private += 1;
            } else {
                open_public += 1;
            }
        }

        Ok(SlotInfo {
            room_id,
            slot_count: room.slot_count,
            joined_slot_mask: joined,
            password_slot_mask: room.password_slot_mask,
            open_public_slot_num: open_public,
            open_private_slot_num: open_private,
        })
    }

    pub async fn member(&self, room_id: u64, member_id: u16) -> Result<Member, QueryError> {
        let inner = self.inner.read().await;
        let room = inner.rooms.get(&room_id).ok_or(QueryError::RoomNotFound)?;
        room.members.get(&member_id).cloned().ok_or(QueryError::MemberNotFound)
    }

    pub async fn member_count(&self, room_id: u64) -> Result<usize, QueryError> {
        let inner = self.inner.read().await;
        let room = inner.rooms.get(&room_id).ok_or(QueryError::RoomNotFound)?;
        Ok(room.members.len())
    }

    pub async fn local_member_id(&self, room_id: u64) -> Result<Option<u16>, QueryError> {
        let inner = self.inner.read().await;
        let room = inner.rooms.get(&room_id).ok_or(QueryError::RoomNotFound)?;
        Ok(room.local_member_id)
    }

    pub async fn is_local_owner(&self, room_id: u64) -> Result<bool, QueryError> {
        let inner = self.inner.read().await;
        let room = inner.rooms.get(&room_id).ok_or(QueryError::RoomNotFound)?;
        Ok(room.is_local_owner())
    }

    /// The stored password, available only while the local client owns the
    /// room.
    pub async fn room_password(&self, room_id: u64) -> Result<Option<Vec<u8>>, QueryError> {
        let inner = self.inner.read().await;
        let room = inner.rooms.get(&room_id).ok_or(QueryError::RoomNotFound)?;
        if !room.is_local_owner() {
            return Ok(None);
        }
        Ok(room.password.clone())
    }

    pub async fn member_identity(&self, room_id: u64, member_id: u16) -> Result<UserIdentity, QueryError> {
        self.member(room_id, member_id).await.map(|m| m.identity)
    }

    // ---- presence -----------------------------------------------------

    pub async fn apply_presence(&self, record: &PresenceRecord) {
        self.inner.write().await.presence.insert(record.identity, PresenceInfo {
            title: record.title.clone(),
            status: record.status.clone(),
            comment: record.comment.clone(),
            data: record.data.clone(),
        });
    }

    pub async fn presence(&self, identity: &UserIdentity) -> Option<PresenceInfo> {
        self.inner.read().await.presence.get(identity).cloned()
    }

    // ---- network time -------------------------------------------------

    pub async fn set_network_time_offset(&self, offset_micros: i64) {
        self.inner.write().await.network_time_offset = Some(offset_micros);
    }

    /// Server time for a given local timestamp, from the cached offset.
    /// None until a GetNetworkTime reply has been observed.
    pub async fn network_time(&self, local_micros: u64) -> Option<u64> {
        self.inner
            .read()
            .await
            .network_time_offset
            .map(|offset| local_micros.saturating_add_signed(offset))
    }

    // ---- connection lifecycle -----------------------------------------

    /// The connection died: everything mirrored is suspect and must be
    /// rebuilt after reconnect. Queries miss until fresh snapshots arrive.
    pub async fn mark_stale(&self) {
        let mut inner = self.inner.write().await;
        inner.stale = true;
        inner.rooms.clear();
        inner.presence.clear();
    }

    pub async fn is_stale(&self) -> bool {
        self.inner.read().await.stale
    }
}

impl Default for RoomCache {
    fn default() -> RoomCache {
        RoomCache::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::records::test_data;

    #[tokio::test]
    async fn test_snapshot_and_queries() {
        let cache = RoomCache::new();
        cache.apply_room_snapshot(&test_data::room(7, &[1, 2]), Some(2), None).await;

        assert_eq!(cache.room_ids().await, vec![7]);
        assert_eq!(cache.member_count(7).await.unwrap(), 2);
        assert_eq!(cache.local_member_id(7).await.unwrap(), Some(2));
        assert!(!cache.is_local_owner(7).await.unwrap());
        assert_eq!(cache.member(7, 1).await.unwrap().identity, UserIdentity::from_name("user1"));
        assert_eq!(cache.member(7, 3).await, Err(QueryError::MemberNotFound));
        assert_eq!(cache.member(8, 1).await, Err(QueryError::RoomNotFound));
    }

    #[tokio::test]
    async fn test_slot_accounting() {
        // 8 slots, password mask over the first 4, 3 members all in the
        // first 4 slots
        let cache = RoomCache::new();
        cache.apply_room_snapshot(&test_data::room(7, &[1, 2, 3]), None, None).await;

        let info = cache.slot_info(7).await.unwrap();
        assert_eq!(info.slot_count, 8);
        assert_eq!(info.joined_slot_mask, 0b0000_0111);
        assert_eq!(info.password_slot_mask, 0b0000_1111);
        assert_eq!(info.open_private_slot_num, 1);
        assert_eq!(info.open_public_slot_num, 4);
        assert_eq!(info.open_private_slot_num + info.open_public_slot_num, 8 - 3);
    }

    #[tokio::test]
    async fn test_member_joined_is_idempotent() {
        let cache = RoomCache::new();
        cache.apply_room_snapshot(&test_data::room(7, &[1]), None, None).await;

        let joined = test_data::member(4, "late");
        cache.apply_member_joined(7, &joined).await;
        let after_once = cache.member(7, 4).await.unwrap();
        let count_once = cache.member_count(7).await.unwrap();

        cache.apply_member_joined(7, &joined).await;
        assert_eq!(cache.member(7, 4).await.unwrap(), after_once);
        assert_eq!(cache.member_count(7).await.unwrap(), count_once);
    }

    #[tokio::test]
    async fn test_member_left_clears_local_identity() {
        let cache = RoomCache::new();
        cache.apply_room_snapshot(&test_data::room(7, &[1, 2]), Some(2), None).await;

        cache.apply_member_left(7, 2).await;
        assert_eq!(cache.local_member_id(7).await.unwrap(), None);
        assert_eq!(cache.member(7, 2).await, Err(QueryError::MemberNotFound));
    }

    #[tokio::test]
    async fn test_room_destroyed() {
        let cache = RoomCache::new();
        cache.apply_room_snapshot(&test_data::room(7, &[1]), None, None).await;

        assert!(cache.apply_room_destroyed(7).await);
        assert!(!cache.apply_room_destroyed(7).await);
        assert_eq!(cache.slot_info(7).await, Err(QueryError::RoomNotFound));
    }

    #[tokio::test]
    async fn test_room_password_only_for_owner() {
        let cache = RoomCache::new();
        // owner is member 1
        cache.apply_room_snapshot(&test_data::room(7, &[1, 2]), Some(1), Some(b"sekrit".to_vec())).await;
        assert_eq!(cache.room_password(7).await.unwrap(), Some(b"sekrit".to_vec()));

        cache.apply_room_snapshot(&test_data::room(8, &[1, 2]), Some(2), Some(b"sekrit".to_vec())).await;
        assert_eq!(cache.room_password(8).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unknown_group_reference_is_dropped() {
        let cache = RoomCache::new();
        let mut room = test_data::room(7, &[]);
        let mut member = test_data::member(1, "a");
        member.group_id = 99;
        room.members.push(member);

        cache.apply_room_snapshot(&room, None, None).await;
        assert_eq!(cache.member(7, 1).await.unwrap().group_id, None);
    }

    #[tokio::test]
    async fn test_room_updated_leaves_members_alone() {
        let cache = RoomCache::new();
        cache.apply_room_snapshot(&test_data::room(7, &[1, 2]), None, None).await;

        let mut update = test_data::room(7, &[]);
        update.flags = 0xff;
        update.password_slot_mask = 0b1111_0000;
        cache.apply_room_updated(&update).await;

        assert_eq!(cache.member_count(7).await.unwrap(), 2);
        let info = cache.slot_info(7).await.unwrap();
        assert_eq!(info.password_slot_mask, 0b1111_0000);
    }

    #[tokio::test]
    async fn test_mark_stale_clears_mirror() {
        let cache = RoomCache::new();
        cache.apply_room_snapshot(&test_data::room(7, &[1]), None, None).await;
        cache.set_network_time_offset(1000).await;

        cache.mark_stale().await;
        assert!(cache.is_stale().await);
        assert_eq!(cache.slot_info(7).await, Err(QueryError::RoomNotFound));
        // the time offset survives staleness; it is clock state, not room state
        assert_eq!(cache.network_time(5).await, Some(1005));

        // a fresh snapshot is the rebuild step
        cache.apply_room_snapshot(&test_data::room(9, &[1]), None, None).await;
        assert!(!cache.is_stale().await);
    }

    #[tokio::test]
    async fn test_presence() {
        let cache = RoomCache::new();
        let identity = UserIdentity::from_name("buddy");
        assert_eq!(cache.presence(&identity).await, None);

        cache.apply_presence(&crate::protocol::records::PresenceRecord {
            identity,
            title: "Game".to_owned(),
            status: "lobby".to_owned(),
            comment: String::new(),
            data: vec![],
        }).await;

        assert_eq!(cache.presence(&identity).await.unwrap().status, "lobby");
    }
}
