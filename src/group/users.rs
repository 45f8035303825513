use std::collections::{BTreeMap, VecDeque};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::group::error::PeerError;
use crate::group::ids::UserId;
use crate::util::clock::{Clock, Timestamp};

/// The application-defined part of a user record. Everything except the id is up to the
///  application; `Update` is the partial form that `update_user` sends around, and
///  `apply_update` merges it into a full record.
pub trait UserData: Clone + Debug + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static {
    type Update: Clone + Debug + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static;

    fn apply_update(&mut self, update: &Self::Update);
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound = "D: UserData")]
pub struct User<D: UserData> {
    pub id: UserId,
    pub data: D,
}

/// A partial user record together with the id it applies to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound = "D: UserData")]
pub struct UserUpdate<D: UserData> {
    pub id: UserId,
    pub update: D::Update,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingInfo {
    pub last_ping_date: Timestamp,
    pub round_trip_time: Option<Duration>,
}

/// One entry of a PING_INFO broadcast
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingInfoEntry {
    pub user_id: UserId,
    pub last_ping_date: Timestamp,
    pub round_trip_time: Option<Duration>,
}
impl PingInfoEntry {
    pub fn ping_info(&self) -> PingInfo {
        PingInfo {
            last_ping_date: self.last_ping_date,
            round_trip_time: self.round_trip_time,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound = "D: UserData")]
pub struct UserInfo<D: UserData> {
    pub user: User<D>,
    pub last_ping_date: Timestamp,
    pub round_trip_time: Option<Duration>,
    pub disconnected: bool,
}
impl <D: UserData> UserInfo<D> {
    pub fn ping_info(&self) -> PingInfo {
        PingInfo {
            last_ping_date: self.last_ping_date,
            round_trip_time: self.round_trip_time,
        }
    }
}


/// A peer's local view of the group's users.
///
/// Users that left are kept in a separate archive so that a later USER_RECONNECTED can restore
///  their record. The archive is invisible to [UserRegistry::snapshot] and [UserRegistry::count].
///  It holds at most `departed_capacity` users, dropping the ones that left first.
pub struct UserRegistry<D: UserData> {
    clock: Arc<dyn Clock>,
    users: BTreeMap<UserId, UserInfo<D>>,
    departed: FxHashMap<UserId, UserInfo<D>>,
    departure_order: VecDeque<UserId>,
    departed_capacity: usize,
}

impl <D: UserData> UserRegistry<D> {
    pub fn new(clock: Arc<dyn Clock>, departed_capacity: usize) -> UserRegistry<D> {
        UserRegistry {
            clock,
            users: Default::default(),
            departed: Default::default(),
            departure_order: Default::default(),
            departed_capacity,
        }
    }

    fn archive(&mut self, info: UserInfo<D>) {
        let user_id = info.user.id.clone();
        if self.departed.insert(user_id.clone(), info).is_none() {
            self.departure_order.push_back(user_id);
        }
        while self.departed.len() > self.departed_capacity {
            match self.departure_order.pop_front() {
                Some(oldest) => {
                    trace!(user_id = ?oldest, "dropping departed user from the archive");
                    self.departed.remove(&oldest);
                }
                None => break,
            }
        }
    }

    fn unarchive(&mut self, user_id: &UserId) -> Option<UserInfo<D>> {
        let info = self.departed.remove(user_id)?;
        self.departure_order.retain(|id| id != user_id);
        Some(info)
    }

    pub fn add_user(&mut self, user: User<D>) {
        trace!(user_id = ?user.id, "adding user");
        self.unarchive(&user.id);
        self.users.insert(user.id.clone(), UserInfo {
            user,
            last_ping_date: self.clock.now_millis(),
            round_trip_time: None,
            disconnected: false,
        });
    }

    /// Removes a user, keeping its record in the archive of departed users
    pub fn remove_user(&mut self, user_id: &UserId) -> Option<User<D>> {
        let mut info = self.users.remove(user_id)?;
        trace!(?user_id, "removing user");
        info.disconnected = true;
        let user = info.user.clone();
        self.archive(info);
        Some(user)
    }

    /// Removes a user without archiving it, so it can not be restored
    pub fn forget_user(&mut self, user_id: &UserId) -> Option<User<D>> {
        self.unarchive(user_id);
        self.users.remove(user_id)
            .map(|info| info.user)
    }

    /// Moves a previously removed user back into the registry, preserving its prior info
    pub fn restore_user(&mut self, user_id: &UserId) -> bool {
        match self.unarchive(user_id) {
            Some(mut info) => {
                trace!(?user_id, "restoring user");
                info.disconnected = false;
                self.users.insert(user_id.clone(), info);
                true
            }
            None => false,
        }
    }

    pub fn get_user(&self, user_id: &UserId) -> Option<&User<D>> {
        self.users.get(user_id)
            .map(|info| &info.user)
    }

    pub fn get_info(&self, user_id: &UserId) -> Option<&UserInfo<D>> {
        self.users.get(user_id)
    }

    pub fn contains(&self, user_id: &UserId) -> bool {
        self.users.contains_key(user_id)
    }

    pub fn is_departed(&self, user_id: &UserId) -> bool {
        self.departed.contains_key(user_id)
    }

    /// Applying an update to an unknown user is a logic error somewhere in the protocol, so it
    ///  is reported as an internal inconsistency.
    pub fn update_user(&mut self, user_id: &UserId, update: &D::Update) -> Result<&User<D>, PeerError> {
        match self.users.get_mut(user_id) {
            Some(info) => {
                info.user.data.apply_update(update);
                Ok(&info.user)
            }
            None => Err(PeerError::InternalInconsistency(format!("no user with id {:?}", user_id))),
        }
    }

    pub fn update_ping_info(&mut self, user_id: &UserId, ping_info: PingInfo) -> Result<(), PeerError> {
        match self.users.get_mut(user_id) {
            Some(info) => {
                info.last_ping_date = ping_info.last_ping_date;
                info.round_trip_time = ping_info.round_trip_time;
                Ok(())
            }
            None => Err(PeerError::InternalInconsistency(format!("no user with id {:?}", user_id))),
        }
    }

    /// Bulk load as received during a handshake. Existing entries with the same ids are
    ///  replaced, other entries are kept.
    pub fn initialize(&mut self, users: Vec<UserInfo<D>>) {
        for mut info in users {
            self.unarchive(&info.user.id);
            info.disconnected = false;
            self.users.insert(info.user.id.clone(), info);
        }
    }

    pub fn clear(&mut self) {
        self.users.clear();
        self.departed.clear();
        self.departure_order.clear();
    }

    /// All current users, sorted by id. The order is part of the protocol: it determines the
    ///  payload of WELCOME and PING_INFO packets.
    pub fn snapshot(&self) -> Vec<UserInfo<D>> {
        self.users.values()
            .cloned()
            .collect()
    }

    pub fn users(&self) -> Vec<User<D>> {
        self.users.values()
            .map(|info| info.user.clone())
            .collect()
    }

    pub fn user_ids(&self) -> Vec<UserId> {
        self.users.keys()
            .cloned()
            .collect()
    }

    pub fn ping_infos(&self) -> Vec<PingInfoEntry> {
        self.users.values()
            .map(|info| PingInfoEntry {
                user_id: info.user.id.clone(),
                last_ping_date: info.last_ping_date,
                round_trip_time: info.round_trip_time,
            })
            .collect()
    }

    pub fn count(&self) -> usize {
        self.users.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use rstest::rstest;

    use crate::group::ids::UserId;
    use crate::test_util::user::{MockUser, MockUserUpdate};
    use crate::util::clock::FixedClock;

    use super::*;

    fn user(id: &str) -> User<MockUser> {
        User {
            id: UserId::from(id),
            data: MockUser::new(&format!("Mr. {}", id)),
        }
    }

    fn registry() -> UserRegistry<MockUser> {
        UserRegistry::new(Arc::new(FixedClock(1000)), 16)
    }

    enum Op {
        Add(&'static str),
        Remove(&'static str),
        Update(&'static str),
    }

    #[rstest]
    #[case::empty(vec![], vec![])]
    #[case::sorted(vec![Op::Add("c"), Op::Add("a"), Op::Add("b")], vec!["a", "b", "c"])]
    #[case::removed(vec![Op::Add("c"), Op::Add("a"), Op::Remove("c")], vec!["a"])]
    #[case::remove_unknown(vec![Op::Add("a"), Op::Remove("x")], vec!["a"])]
    #[case::re_added(vec![Op::Add("b"), Op::Remove("b"), Op::Add("b"), Op::Add("a")], vec!["a", "b"])]
    #[case::added_twice(vec![Op::Add("b"), Op::Add("b")], vec!["b"])]
    #[case::updated(vec![Op::Add("z"), Op::Add("y"), Op::Update("z")], vec!["y", "z"])]
    fn test_snapshot_sorted_and_exact(#[case] ops: Vec<Op>, #[case] expected: Vec<&str>) {
        let mut registry = registry();
        for op in ops {
            match op {
                Op::Add(id) => registry.add_user(user(id)),
                Op::Remove(id) => { registry.remove_user(&UserId::from(id)); }
                Op::Update(id) => { registry.update_user(&UserId::from(id), &MockUserUpdate::name("changed")).unwrap(); }
            }
        }

        let ids = registry.snapshot().into_iter()
            .map(|info| info.user.id.as_str().to_string())
            .collect::<Vec<_>>();
        assert_eq!(ids, expected);
        assert_eq!(registry.count(), expected.len());
    }

    #[test]
    fn test_add_user_initializes_ping_info() {
        let mut registry = registry();
        registry.add_user(user("a"));

        let info = registry.get_info(&UserId::from("a")).unwrap();
        assert_eq!(info.last_ping_date, 1000);
        assert_eq!(info.round_trip_time, None);
        assert!(!info.disconnected);
    }

    #[test]
    fn test_update_user_merges() {
        let mut registry = registry();
        registry.add_user(user("a"));

        let updated = registry.update_user(&UserId::from("a"), &MockUserUpdate::name("Mr. Newname")).unwrap();
        assert_eq!(updated.data.name, "Mr. Newname");
        assert_eq!(registry.get_user(&UserId::from("a")).unwrap().data.name, "Mr. Newname");
    }

    #[test]
    fn test_update_unknown_user_is_internal_inconsistency() {
        let mut registry = registry();
        let result = registry.update_user(&UserId::from("x"), &MockUserUpdate::name("x"));
        assert!(matches!(result, Err(PeerError::InternalInconsistency(_))));

        let result = registry.update_ping_info(&UserId::from("x"), PingInfo { last_ping_date: 1, round_trip_time: None });
        assert!(matches!(result, Err(PeerError::InternalInconsistency(_))));
    }

    #[test]
    fn test_update_ping_info() {
        let mut registry = registry();
        registry.add_user(user("a"));
        registry.update_ping_info(&UserId::from("a"), PingInfo { last_ping_date: 5, round_trip_time: Some(Duration::from_millis(7)) }).unwrap();

        assert_eq!(registry.ping_infos(), vec![PingInfoEntry {
            user_id: UserId::from("a"),
            last_ping_date: 5,
            round_trip_time: Some(Duration::from_millis(7)),
        }]);
    }

    #[test]
    fn test_remove_and_restore_preserves_info() {
        let mut registry = registry();
        registry.add_user(user("a"));
        registry.update_ping_info(&UserId::from("a"), PingInfo { last_ping_date: 5, round_trip_time: Some(Duration::from_millis(7)) }).unwrap();

        assert_eq!(registry.remove_user(&UserId::from("a")), Some(user("a")));
        assert!(!registry.contains(&UserId::from("a")));
        assert!(registry.is_departed(&UserId::from("a")));
        assert!(registry.snapshot().is_empty());

        assert!(registry.restore_user(&UserId::from("a")));
        let info = registry.get_info(&UserId::from("a")).unwrap();
        assert_eq!(info.last_ping_date, 5);
        assert_eq!(info.round_trip_time, Some(Duration::from_millis(7)));
        assert!(!info.disconnected);

        assert!(!registry.restore_user(&UserId::from("b")));
    }

    #[test]
    fn test_forget_user_can_not_be_restored() {
        let mut registry = registry();
        registry.add_user(user("a"));
        assert_eq!(registry.forget_user(&UserId::from("a")), Some(user("a")));
        assert!(!registry.restore_user(&UserId::from("a")));

        registry.add_user(user("b"));
        registry.remove_user(&UserId::from("b"));
        assert_eq!(registry.forget_user(&UserId::from("b")), None);
        assert!(!registry.is_departed(&UserId::from("b")));
    }

    #[test]
    fn test_archive_drops_users_that_left_first() {
        let mut registry = UserRegistry::new(Arc::new(FixedClock(1000)), 2);
        for id in ["a", "b", "c"] {
            registry.add_user(user(id));
        }
        for id in ["a", "b", "c"] {
            registry.remove_user(&UserId::from(id));
        }

        assert!(!registry.is_departed(&UserId::from("a")));
        assert!(registry.is_departed(&UserId::from("b")));
        assert!(registry.is_departed(&UserId::from("c")));

        // a restored user no longer takes up room in the archive
        assert!(registry.restore_user(&UserId::from("b")));
        registry.add_user(user("d"));
        registry.remove_user(&UserId::from("d"));
        assert!(registry.is_departed(&UserId::from("c")));
        assert!(registry.is_departed(&UserId::from("d")));
    }

    #[test]
    fn test_initialize_replaces_same_ids_and_keeps_others() {
        let mut registry = registry();
        registry.add_user(user("own"));
        registry.initialize(vec![
            UserInfo { user: user("b"), last_ping_date: 3, round_trip_time: Some(Duration::from_millis(2)), disconnected: false },
            UserInfo { user: user("a"), last_ping_date: 4, round_trip_time: None, disconnected: false },
        ]);

        assert_eq!(registry.user_ids(), vec![UserId::from("a"), UserId::from("b"), UserId::from("own")]);
        assert_eq!(registry.get_info(&UserId::from("b")).unwrap().last_ping_date, 3);
    }
}
