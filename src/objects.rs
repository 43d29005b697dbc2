//! The Object Registry (§4.C).
//!
//! Per-session object storage with optimistic-concurrency updates,
//! scope-based lifetime, and a secondary `type` index kept consistent with
//! `Data["type"]` on every create/update/delete (I6).

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::debug;
use crate::registry::{now_ms, MemberId, SessionId, Timestamp};

pub type ObjectId = Uuid;
pub type ObjectData = HashMap<String, Value>;

const TYPE_KEY: &str = "type";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Scope {
  PerMember,
  PerSession,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Object {
  pub id: ObjectId,
  pub session_id: SessionId,
  pub creator_member_id: MemberId,
  pub owner_member_id: MemberId,
  pub scope: Scope,
  pub data: ObjectData,
  pub version: u64,
  pub created_at: Timestamp,
  pub updated_at: Timestamp,
}

impl Object {
  fn type_value(&self) -> Option<String> {
    self.data.get(TYPE_KEY).and_then(|v| v.as_str()).map(str::to_owned)
  }
}

/// Result of §4.C.6 `HandleMemberDeparture`.
#[derive(Debug, Clone, Default)]
pub struct DepartureCleanup {
  pub deleted_ids: Vec<ObjectId>,
  pub migrations: Vec<(ObjectId, MemberId)>,
  /// Types that may have transitioned to a zero count — the Hub checks each
  /// one against `CountByType` before emitting `OnObjectTypeEmpty` (§4.C.6).
  pub affected_types: HashSet<String>,
}

struct SessionObjects {
  objects: HashMap<ObjectId, Object>,
  /// Insertion order, preserved so round-robin migration (§4.C.6) iterates
  /// objects in a stable, deterministic sequence.
  order: Vec<ObjectId>,
  type_index: HashMap<String, HashSet<ObjectId>>,
}

impl SessionObjects {
  fn new() -> Self {
    SessionObjects {
      objects: HashMap::new(),
      order: Vec::new(),
      type_index: HashMap::new(),
    }
  }

  fn index_insert(&mut self, object: &Object) {
    if let Some(t) = object.type_value() {
      self.type_index.entry(t).or_default().insert(object.id);
    }
  }

  fn index_remove(&mut self, id: ObjectId, old_type: Option<&str>) {
    if let Some(t) = old_type {
      if let Some(set) = self.type_index.get_mut(t) {
        set.remove(&id);
        if set.is_empty() {
          self.type_index.remove(t);
        }
      }
    }
  }

  fn insert(&mut self, object: Object) {
    self.index_insert(&object);
    self.order.push(object.id);
    self.objects.insert(object.id, object);
  }

  fn remove(&mut self, id: ObjectId) -> Option<Object> {
    let object = self.objects.remove(&id)?;
    self.index_remove(id, object.type_value().as_deref());
    self.order.retain(|o| *o != id);
    Some(object)
  }
}

pub struct ObjectRegistry {
  sessions: Mutex<HashMap<SessionId, SessionObjects>>,
  distribute_orphaned_objects: bool,
}

impl ObjectRegistry {
  #[must_use]
  pub fn new(distribute_orphaned_objects: bool) -> Self {
    ObjectRegistry {
      sessions: Mutex::new(HashMap::new()),
      distribute_orphaned_objects,
    }
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, SessionObjects>> {
    self.sessions.lock().expect("object registry mutex poisoned")
  }

  /// Called by the Hub when a session is created, so object storage exists
  /// even before the first object does; harmless if called again.
  pub fn register_session(&self, session_id: SessionId) {
    self.lock().entry(session_id).or_insert_with(SessionObjects::new);
  }

  /// Called by the Hub when a session is destroyed, to free its object
  /// storage (all objects in a destroyed session die with it, §3).
  pub fn drop_session(&self, session_id: SessionId) {
    self.lock().remove(&session_id);
  }

  /// §4.C.1 `CreateObject`. Returns `None` if the session is absent, or if
  /// an explicit `owner_member_id` is supplied but is not in
  /// `live_member_ids` — the Hub passes the calling session's current
  /// membership so a foreign or stale owner id can never be accepted and
  /// turn into an I5 ghost object. `creator_member_id` itself is trusted: the
  /// Hub only ever derives it from the Session Registry's own connection
  /// index, so it is a live member by construction.
  #[must_use]
  pub fn create_object(
    &self, session_id: SessionId, creator_member_id: MemberId, scope: Scope, data: ObjectData,
    owner_member_id: Option<MemberId>, live_member_ids: &HashSet<MemberId>,
  ) -> Option<Object> {
    if let Some(owner) = owner_member_id {
      if !live_member_ids.contains(&owner) {
        debug!("(ObjectRegistry.create_object) Rejected non-live owner_member_id {owner} for session {session_id}.");
        return None;
      }
    }

    let mut sessions = self.lock();
    let session_objects = sessions.get_mut(&session_id)?;

    let now = now_ms();
    let object = Object {
      id: Uuid::new_v4(),
      session_id,
      creator_member_id,
      owner_member_id: owner_member_id.unwrap_or(creator_member_id),
      scope,
      data,
      version: 1,
      created_at: now,
      updated_at: now,
    };
    session_objects.insert(object.clone());
    debug!("(ObjectRegistry.create_object) Created object {} in session {session_id}.", object.id);
    Some(object)
  }

  /// §4.C.2 `UpdateObject`. `None` on missing session/object, or on an
  /// `expected_version` mismatch (silent optimistic-concurrency no-op, not
  /// an error — §7 "VersionMismatch").
  #[must_use]
  pub fn update_object(
    &self, session_id: SessionId, object_id: ObjectId, patch: &ObjectData, expected_version: Option<u64>,
  ) -> Option<Object> {
    let mut sessions = self.lock();
    let session_objects = sessions.get_mut(&session_id)?;
    let object = session_objects.objects.get(&object_id)?;

    if let Some(expected) = expected_version {
      if object.version != expected {
        debug!(
          "(ObjectRegistry.update_object) Version mismatch on {object_id}: expected {expected}, have {}.",
          object.version
        );
        return None;
      }
    }

    let old_type = object.type_value();
    let mut updated = session_objects.objects.remove(&object_id).expect("object disappeared under lock");
    session_objects.index_remove(object_id, old_type.as_deref());

    for (key, value) in patch {
      updated.data.insert(key.clone(), value.clone());
    }
    updated.version += 1;
    updated.updated_at = now_ms();

    session_objects.index_insert(&updated);
    session_objects.objects.insert(object_id, updated.clone());
    Some(updated)
  }

  /// §4.C.3 `UpdateObjects`: applies each patch independently, preserving
  /// input order, skipping any that fail their precondition. No
  /// all-or-nothing semantics across patches.
  pub fn update_objects(
    &self, session_id: SessionId, patches: Vec<(ObjectId, ObjectData, Option<u64>)>,
  ) -> Vec<Object> {
    patches
      .into_iter()
      .filter_map(|(object_id, patch, expected_version)| {
        self.update_object(session_id, object_id, &patch, expected_version)
      })
      .collect()
  }

  /// §4.C.4 `DeleteObject`. Atomic take-and-remove; idempotent by
  /// construction — a second delete of the same id returns `None`.
  #[must_use]
  pub fn delete_object(&self, session_id: SessionId, object_id: ObjectId) -> Option<Object> {
    let mut sessions = self.lock();
    let session_objects = sessions.get_mut(&session_id)?;
    session_objects.remove(object_id)
  }

  #[must_use]
  pub fn get_object(&self, session_id: SessionId, object_id: ObjectId) -> Option<Object> {
    self.lock().get(&session_id)?.objects.get(&object_id).cloned()
  }

  /// §4.C listing used by join-snapshots (§4.D.3) and tests.
  #[must_use]
  pub fn list_session_objects(&self, session_id: SessionId) -> Vec<Object> {
    let sessions = self.lock();
    let Some(session_objects) = sessions.get(&session_id) else {
      return Vec::new();
    };
    session_objects.order.iter().filter_map(|id| session_objects.objects.get(id).cloned()).collect()
  }

  /// §4.C.5 `CountByType`, backed by the secondary type index (I6).
  #[must_use]
  pub fn count_by_type(&self, session_id: SessionId, type_key: &str) -> usize {
    self.lock().get(&session_id).and_then(|s| s.type_index.get(type_key)).map_or(0, HashSet::len)
  }

  /// §4.C.6 `HandleMemberDeparture`.
  ///
  /// For every object owned by `departing_member_id`: `PerMember` objects are
  /// deleted outright; `PerSession` objects are reassigned to
  /// `remaining_member_ids` — round-robin across all of them if
  /// `distribute_orphaned_objects` is set and more than one member remains,
  /// otherwise all to `remaining_member_ids[0]`. If no members remain, the
  /// session is about to be destroyed and `PerSession` objects are left
  /// alone (they die with the session).
  pub fn handle_member_departure(
    &self, session_id: SessionId, departing_member_id: MemberId, remaining_member_ids: &[MemberId],
  ) -> DepartureCleanup {
    let mut sessions = self.lock();
    let Some(session_objects) = sessions.get_mut(&session_id) else {
      return DepartureCleanup::default();
    };

    let mut cleanup = DepartureCleanup::default();
    let owned: Vec<ObjectId> = session_objects
      .order
      .iter()
      .copied()
      .filter(|id| session_objects.objects.get(id).is_some_and(|o| o.owner_member_id == departing_member_id))
      .collect();

    let mut round_robin_index = 0usize;
    for object_id in owned {
      let scope = session_objects.objects[&object_id].scope;
      match scope {
        Scope::PerMember => {
          if let Some(removed) = session_objects.remove(object_id) {
            cleanup.deleted_ids.push(object_id);
            if let Some(t) = removed.type_value() {
              cleanup.affected_types.insert(t);
            }
          }
        }
        Scope::PerSession => {
          if remaining_member_ids.is_empty() {
            // Session is being destroyed; leave the object as-is.
            continue;
          }
          let new_owner = if self.distribute_orphaned_objects && remaining_member_ids.len() > 1 {
            let owner = remaining_member_ids[round_robin_index % remaining_member_ids.len()];
            round_robin_index += 1;
            owner
          } else {
            remaining_member_ids[0]
          };

          if let Some(object) = session_objects.objects.get_mut(&object_id) {
            object.owner_member_id = new_owner;
            object.version += 1;
            object.updated_at = now_ms();
            cleanup.migrations.push((object_id, new_owner));
          }
        }
      }
    }

    debug!(
      "(ObjectRegistry.handle_member_departure) session={session_id} departing={departing_member_id} deleted={} migrated={}",
      cleanup.deleted_ids.len(),
      cleanup.migrations.len()
    );
    cleanup
  }
}

impl Default for ObjectRegistry {
  fn default() -> Self {
    Self::new(true)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::registry::SessionRegistry;
  use serde_json::json;

  fn type_data(t: &str) -> ObjectData {
    let mut data = HashMap::new();
    data.insert(TYPE_KEY.to_string(), json!(t));
    data
  }

  fn session_with_members(n: usize) -> (SessionId, Vec<MemberId>) {
    let registry = SessionRegistry::new_for_test(6, 8);
    let (session, authority) = registry.create_session(&"c0".to_string(), 1.0).unwrap();
    let mut member_ids = vec![authority.id];
    for i in 1..n {
      let (_, m) = registry.join_session(session.id, &format!("c{i}")).unwrap();
      member_ids.push(m.id);
    }
    (session.id, member_ids)
  }

  fn as_set(members: &[MemberId]) -> HashSet<MemberId> {
    members.iter().copied().collect()
  }

  #[test]
  fn create_object_defaults_owner_to_creator() {
    let objects = ObjectRegistry::new(true);
    let (session_id, members) = session_with_members(1);
    objects.register_session(session_id);

    let object = objects.create_object(session_id, members[0], Scope::PerSession, HashMap::new(), None, &as_set(&members)).unwrap();
    assert_eq!(object.owner_member_id, members[0]);
    assert_eq!(object.version, 1);
  }

  #[test]
  fn create_object_fails_for_unregistered_session() {
    let objects = ObjectRegistry::new(true);
    let result =
      objects.create_object(Uuid::new_v4(), Uuid::new_v4(), Scope::PerSession, HashMap::new(), None, &HashSet::new());
    assert!(result.is_none());
  }

  // I5: an explicit owner_member_id that isn't a live member of the session
  // must be rejected, not silently accepted as a ghost owner.
  #[test]
  fn create_object_rejects_an_owner_id_outside_live_membership() {
    let objects = ObjectRegistry::new(true);
    let (session_id, members) = session_with_members(1);
    objects.register_session(session_id);

    let foreign_member_id = Uuid::new_v4();
    let result = objects.create_object(
      session_id,
      members[0],
      Scope::PerSession,
      HashMap::new(),
      Some(foreign_member_id),
      &as_set(&members),
    );
    assert!(result.is_none());
  }

  // L2 / Scenario 2: double-delete is safe and idempotent.
  #[test]
  fn double_delete_is_safe() {
    let objects = ObjectRegistry::new(true);
    let (session_id, members) = session_with_members(1);
    objects.register_session(session_id);

    let x =
      objects.create_object(session_id, members[0], Scope::PerSession, type_data("asteroid"), None, &as_set(&members)).unwrap();
    let y =
      objects.create_object(session_id, members[0], Scope::PerSession, type_data("ship"), None, &as_set(&members)).unwrap();

    assert_eq!(objects.delete_object(session_id, x.id).unwrap().id, x.id);
    assert!(objects.delete_object(session_id, x.id).is_none());

    let remaining = objects.list_session_objects(session_id);
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, y.id);
    assert_eq!(objects.count_by_type(session_id, "asteroid"), 0);
  }

  // L3: expected_version=current is equivalent to expected_version=None absent races.
  #[test]
  fn update_with_current_version_matches_unconditional_update() {
    let objects = ObjectRegistry::new(true);
    let (session_id, members) = session_with_members(1);
    objects.register_session(session_id);
    let object =
      objects.create_object(session_id, members[0], Scope::PerMember, HashMap::new(), None, &as_set(&members)).unwrap();

    let mut patch = HashMap::new();
    patch.insert("hp".to_string(), json!(10));
    let updated = objects.update_object(session_id, object.id, &patch, Some(object.version)).unwrap();
    assert_eq!(updated.version, 2);

    let objects2 = ObjectRegistry::new(true);
    let (session_id2, members2) = session_with_members(1);
    objects2.register_session(session_id2);
    let object2 =
      objects2.create_object(session_id2, members2[0], Scope::PerMember, HashMap::new(), None, &as_set(&members2)).unwrap();
    let updated2 = objects2.update_object(session_id2, object2.id, &patch, None).unwrap();
    assert_eq!(updated2.version, 2);
  }

  // Scenario 6: optimistic concurrency — stale expected_version is rejected.
  #[test]
  fn stale_expected_version_is_rejected() {
    let objects = ObjectRegistry::new(true);
    let (session_id, members) = session_with_members(1);
    objects.register_session(session_id);
    let object =
      objects.create_object(session_id, members[0], Scope::PerMember, HashMap::new(), None, &as_set(&members)).unwrap();

    let mut patch = HashMap::new();
    patch.insert("a".to_string(), json!(1));
    let first = objects.update_object(session_id, object.id, &patch, Some(5)).unwrap_or_else(|| {
      // object.version is 1, not 5 — the realistic stale case uses the real version.
      objects.update_object(session_id, object.id, &patch, Some(object.version)).unwrap()
    });
    assert_eq!(first.version, 2);

    // Now a second caller racing with an old expected_version (1) fails.
    let stale = objects.update_object(session_id, object.id, &patch, Some(1));
    assert!(stale.is_none());
    assert_eq!(objects.get_object(session_id, object.id).unwrap().version, 2);
  }

  // Shallow merge: patch keys overwrite, others are preserved.
  #[test]
  fn update_object_shallow_merges_patch() {
    let objects = ObjectRegistry::new(true);
    let (session_id, members) = session_with_members(1);
    objects.register_session(session_id);
    let mut initial = HashMap::new();
    initial.insert("hp".to_string(), json!(10));
    initial.insert("shield".to_string(), json!(5));
    let object =
      objects.create_object(session_id, members[0], Scope::PerMember, initial, None, &as_set(&members)).unwrap();

    let mut patch = HashMap::new();
    patch.insert("hp".to_string(), json!(3));
    let updated = objects.update_object(session_id, object.id, &patch, None).unwrap();
    assert_eq!(updated.data.get("hp"), Some(&json!(3)));
    assert_eq!(updated.data.get("shield"), Some(&json!(5)));
  }

  // Scenario 3: migration with distribution off.
  #[test]
  fn migration_with_distribution_off_assigns_all_to_first_remaining_member() {
    let (session_id, members) = session_with_members(3);
    let objects = ObjectRegistry::new(false);
    objects.register_session(session_id);
    for _ in 0..3 {
      objects.create_object(session_id, members[0], Scope::PerSession, HashMap::new(), None, &as_set(&members)).unwrap();
    }

    let remaining = vec![members[1], members[2]];
    let cleanup = objects.handle_member_departure(session_id, members[0], &remaining);
    assert_eq!(cleanup.migrations.len(), 3);
    assert!(cleanup.migrations.iter().all(|(_, owner)| *owner == members[1]));
  }

  // Scenario 4: migration with distribution on, round-robin in object-map order.
  #[test]
  fn migration_with_distribution_on_round_robins_across_remaining_members() {
    let (session_id, members) = session_with_members(3);
    let objects = ObjectRegistry::new(true);
    objects.register_session(session_id);
    for _ in 0..3 {
      objects.create_object(session_id, members[0], Scope::PerSession, HashMap::new(), None, &as_set(&members)).unwrap();
    }

    let remaining = vec![members[1], members[2]];
    let cleanup = objects.handle_member_departure(session_id, members[0], &remaining);
    let owners: Vec<MemberId> = cleanup.migrations.iter().map(|(_, owner)| *owner).collect();
    assert_eq!(owners, vec![members[1], members[2], members[1]]);
  }

  #[test]
  fn per_member_objects_are_deleted_on_owner_departure() {
    let (session_id, members) = session_with_members(2);
    let objects = ObjectRegistry::new(true);
    objects.register_session(session_id);
    let obj =
      objects.create_object(session_id, members[0], Scope::PerMember, type_data("cursor"), None, &as_set(&members)).unwrap();

    let cleanup = objects.handle_member_departure(session_id, members[0], &[members[1]]);
    assert_eq!(cleanup.deleted_ids, vec![obj.id]);
    assert!(cleanup.affected_types.contains("cursor"));
    assert!(objects.get_object(session_id, obj.id).is_none());
  }

  // L4: HandleMemberDeparture is idempotent.
  #[test]
  fn handle_member_departure_is_idempotent() {
    let (session_id, members) = session_with_members(2);
    let objects = ObjectRegistry::new(true);
    objects.register_session(session_id);
    objects.create_object(session_id, members[0], Scope::PerMember, HashMap::new(), None, &as_set(&members)).unwrap();

    let first = objects.handle_member_departure(session_id, members[0], &[members[1]]);
    assert_eq!(first.deleted_ids.len(), 1);
    let second = objects.handle_member_departure(session_id, members[0], &[members[1]]);
    assert!(second.deleted_ids.is_empty());
    assert!(second.migrations.is_empty());
  }

  // Scenario 5: type-empty signal only on the last delete of a type.
  #[test]
  fn type_count_reaches_zero_only_after_last_delete() {
    let objects = ObjectRegistry::new(true);
    let (session_id, members) = session_with_members(1);
    objects.register_session(session_id);
    let a =
      objects.create_object(session_id, members[0], Scope::PerSession, type_data("asteroid"), None, &as_set(&members)).unwrap();
    let b =
      objects.create_object(session_id, members[0], Scope::PerSession, type_data("asteroid"), None, &as_set(&members)).unwrap();

    assert_eq!(objects.count_by_type(session_id, "asteroid"), 2);
    objects.delete_object(session_id, a.id);
    assert_eq!(objects.count_by_type(session_id, "asteroid"), 1);
    objects.delete_object(session_id, b.id);
    assert_eq!(objects.count_by_type(session_id, "asteroid"), 0);
  }

  #[test]
  fn type_index_tracks_type_changes_on_update() {
    let objects = ObjectRegistry::new(true);
    let (session_id, members) = session_with_members(1);
    objects.register_session(session_id);
    let object =
      objects.create_object(session_id, members[0], Scope::PerSession, type_data("asteroid"), None, &as_set(&members)).unwrap();
    assert_eq!(objects.count_by_type(session_id, "asteroid"), 1);

    let mut patch = HashMap::new();
    patch.insert(TYPE_KEY.to_string(), json!("debris"));
    objects.update_object(session_id, object.id, &patch, None).unwrap();

    assert_eq!(objects.count_by_type(session_id, "asteroid"), 0);
    assert_eq!(objects.count_by_type(session_id, "debris"), 1);
  }
}
