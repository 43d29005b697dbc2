//! The Session Registry (§4.B).
//!
//! Owns session and member lifecycle: creation, joining, leaving (with
//! authority re-election), and the two reverse indexes (`connectionId ->
//! memberId`, `memberId -> sessionId`) that must stay consistent with each
//! session's own `Members` map (§3 "Indexes", invariant I2).
//!
//! All registry-wide mutations serialize on one `std::sync::Mutex` (§5) so
//! that "is this connection already in a session? is there room?" is a
//! linearisable observation. Authority promotion (§4.B.3 step 3) takes a
//! *separate*, per-session lock so a slow promotion on one session never
//! blocks `CreateSession`/`JoinSession` on another.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::naming::NamingPool;
use crate::{debug, warn};

pub type SessionId = Uuid;
pub type MemberId = Uuid;
pub type ConnectionId = String;

/// Milliseconds since the Unix epoch. Plain `u64`, matching the donor's own
/// `SystemTime -> u64` convention in `server.rs`'s scenario-expiration logic.
pub type Timestamp = u64;

#[must_use]
pub fn now_ms() -> Timestamp {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .expect("system clock before Unix epoch")
    .as_millis() as Timestamp
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Role {
  Authority,
  Participant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
  pub id: MemberId,
  pub connection_id: ConnectionId,
  pub session_id: SessionId,
  pub role: Role,
  pub joined_at: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
  pub id: SessionId,
  pub name: String,
  pub created_at: Timestamp,
  pub aspect_ratio: f64,
  pub game_started: bool,
  /// Incremented every time authority changes hands (§3 invariant).
  pub version: u64,
  pub members: HashMap<MemberId, Member>,
}

impl Session {
  fn authority_id(&self) -> Option<MemberId> {
    self.members.values().find(|m| m.role == Role::Authority).map(|m| m.id)
  }
}

/// Snapshot row returned by `ListActiveSessions` (§4.B.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
  pub id: SessionId,
  pub name: String,
  pub member_count: usize,
  pub max_members: u32,
  pub created_at: Timestamp,
  pub game_started: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSessionsSnapshot {
  pub sessions: Vec<SessionSummary>,
  pub max_sessions: u32,
  pub can_create_session: bool,
}

/// Outcome of a successful `LeaveSession` (§4.B.3 step 5).
#[derive(Debug, Clone)]
pub struct DepartureResult {
  pub session_id: SessionId,
  pub session_name: String,
  pub member_id: MemberId,
  pub session_destroyed: bool,
  pub promoted_member: Option<MemberId>,
  /// Members remaining in the session after removal; empty if destroyed.
  /// Order is stable iteration order over the post-removal `Members` map,
  /// which `HandleMemberDeparture`'s round-robin migration (§4.C.6) relies on.
  pub remaining_member_ids: Vec<MemberId>,
}

const ASPECT_RATIO_MIN: f64 = 0.25;
const ASPECT_RATIO_MAX: f64 = 4.0;
/// Sentinel substituted for a NaN aspect ratio (§8 boundary behavior,
/// Open Question resolved in DESIGN.md): the midpoint of the legal range.
const ASPECT_RATIO_NAN_SENTINEL: f64 = 1.0;

fn clamp_aspect_ratio(value: f64) -> f64 {
  if value.is_nan() {
    ASPECT_RATIO_NAN_SENTINEL
  } else {
    value.clamp(ASPECT_RATIO_MIN, ASPECT_RATIO_MAX)
  }
}

pub struct SessionRegistry {
  max_sessions: u32,
  max_members_per_session: u32,
  naming_pool: NamingPool,
  sessions: Mutex<HashMap<SessionId, Session>>,
  conn_index: DashMap<ConnectionId, MemberId>,
  member_index: DashMap<MemberId, SessionId>,
  /// Per-session promotion lock (§5), kept separate from `sessions` so a
  /// slow promotion never widens the registry-wide critical section.
  promotion_locks: DashMap<SessionId, Mutex<()>>,
  test_mode: bool,
}

impl SessionRegistry {
  #[must_use]
  pub fn new(max_sessions: u32, max_members_per_session: u32) -> Self {
    SessionRegistry {
      max_sessions,
      max_members_per_session,
      naming_pool: NamingPool::new(),
      sessions: Mutex::new(HashMap::new()),
      conn_index: DashMap::new(),
      member_index: DashMap::new(),
      promotion_locks: DashMap::new(),
      test_mode: false,
    }
  }

  #[must_use]
  pub fn new_for_test(max_sessions: u32, max_members_per_session: u32) -> Self {
    let mut registry = Self::new(max_sessions, max_members_per_session);
    registry.test_mode = true;
    registry
  }

  fn rng(&self) -> SmallRng {
    if self.test_mode {
      SmallRng::seed_from_u64(0)
    } else {
      SmallRng::from_entropy()
    }
  }

  /// §4.B.1 `CreateSession`.
  ///
  /// # Errors
  /// Returns [`CoreError::AlreadyInSession`] if `connection_id` already has a
  /// live member, or [`CoreError::CapacityReached`] if `MaxSessions`
  /// non-empty sessions already exist.
  ///
  /// # Panics
  /// Panics if the registry mutex is poisoned by a prior panicking holder.
  pub fn create_session(&self, connection_id: &ConnectionId, aspect_ratio: f64) -> Result<(Session, Member)> {
    let mut sessions = self.sessions.lock().expect("session registry mutex poisoned");

    if self.conn_index.contains_key(connection_id) {
      warn!("(SessionRegistry.create_session) Connection {connection_id} is already in a session.");
      return Err(CoreError::AlreadyInSession);
    }
    if sessions.len() as u32 >= self.max_sessions {
      warn!("(SessionRegistry.create_session) Session capacity ({}) reached.", self.max_sessions);
      return Err(CoreError::CapacityReached);
    }

    let used: std::collections::HashSet<String> = sessions.values().map(|s| s.name.clone()).collect();
    let name = self.naming_pool.allocate(&used);

    let session_id = Uuid::new_v4();
    let member_id = Uuid::new_v4();
    let now = now_ms();

    let member = Member {
      id: member_id,
      connection_id: connection_id.clone(),
      session_id,
      role: Role::Authority,
      joined_at: now,
    };

    let mut members = HashMap::new();
    members.insert(member_id, member.clone());

    let session = Session {
      id: session_id,
      name,
      created_at: now,
      aspect_ratio: clamp_aspect_ratio(aspect_ratio),
      game_started: false,
      version: 1,
      members,
    };

    sessions.insert(session_id, session.clone());
    self.conn_index.insert(connection_id.clone(), member_id);
    self.member_index.insert(member_id, session_id);

    debug!("(SessionRegistry.create_session) Created session {} ({}).", session.name, session_id);

    Ok((session, member))
  }

  /// §4.B.2 `JoinSession`.
  ///
  /// # Errors
  /// Returns [`CoreError::AlreadyInSession`], [`CoreError::NotFound`], or
  /// [`CoreError::SessionFull`] per §4.B.2.
  ///
  /// # Panics
  /// Panics if the registry mutex is poisoned by a prior panicking holder.
  pub fn join_session(&self, session_id: SessionId, connection_id: &ConnectionId) -> Result<(Session, Member)> {
    let mut sessions = self.sessions.lock().expect("session registry mutex poisoned");

    if self.conn_index.contains_key(connection_id) {
      return Err(CoreError::AlreadyInSession);
    }
    let session = sessions.get_mut(&session_id).ok_or(CoreError::NotFound)?;
    if session.members.len() as u32 >= self.max_members_per_session {
      warn!("(SessionRegistry.join_session) Session {} is full.", session.name);
      return Err(CoreError::SessionFull);
    }

    let member_id = Uuid::new_v4();
    let member = Member {
      id: member_id,
      connection_id: connection_id.clone(),
      session_id,
      role: Role::Participant,
      joined_at: now_ms(),
    };
    session.members.insert(member_id, member.clone());
    let session_snapshot = session.clone();

    self.conn_index.insert(connection_id.clone(), member_id);
    self.member_index.insert(member_id, session_id);

    debug!("(SessionRegistry.join_session) {connection_id} joined session {}.", session_snapshot.name);

    Ok((session_snapshot, member))
  }

  /// §4.B.3 `LeaveSession`. Returns `None` if `connection_id` has no live
  /// member (already left, or disconnect re-entrancy per §9).
  ///
  /// # Panics
  /// Panics if the registry mutex, or the per-session promotion lock, is
  /// poisoned by a prior panicking holder.
  pub fn leave_session(&self, connection_id: &ConnectionId) -> Option<DepartureResult> {
    // Step 1: remove from both indexes. This is the linearisation point.
    let (_, member_id) = self.conn_index.remove(connection_id)?;
    let (_, session_id) = self.member_index.remove(&member_id)?;

    let mut sessions = self.sessions.lock().expect("session registry mutex poisoned");
    let session = sessions.get_mut(&session_id)?;
    let departing = session.members.remove(&member_id)?;

    let mut promoted_member = None;
    if departing.role == Role::Authority && !session.members.is_empty() {
      let lock_entry = self.promotion_locks.entry(session_id).or_insert_with(|| Mutex::new(()));
      let _promotion_guard = lock_entry.lock().expect("promotion lock poisoned");
      // Double-check under the promotion lock: another path may already have
      // promoted someone (disconnect re-entrancy, §9).
      if session.authority_id().is_none() {
        let mut rng = self.rng();
        let candidates: Vec<MemberId> = session.members.keys().copied().collect();
        let chosen = candidates[rng.gen_range(0..candidates.len())];
        if let Some(m) = session.members.get_mut(&chosen) {
          m.role = Role::Authority;
        }
        session.version += 1;
        promoted_member = Some(chosen);
        debug!("(SessionRegistry.leave_session) Promoted {chosen} to Authority in session {session_id}.");
      }
    }

    let remaining_member_ids: Vec<MemberId> = session.members.keys().copied().collect();
    let session_name = session.name.clone();
    let session_destroyed = session.members.is_empty();

    if session_destroyed {
      sessions.remove(&session_id);
      self.promotion_locks.remove(&session_id);
      debug!("(SessionRegistry.leave_session) Session {session_name} destroyed (last member left).");
    }

    Some(DepartureResult {
      session_id,
      session_name,
      member_id,
      session_destroyed,
      promoted_member,
      remaining_member_ids,
    })
  }

  /// # Panics
  /// Panics if the registry mutex is poisoned by a prior panicking holder.
  #[must_use]
  pub fn get_session(&self, session_id: SessionId) -> Option<Session> {
    self.sessions.lock().expect("session registry mutex poisoned").get(&session_id).cloned()
  }

  #[must_use]
  pub fn get_member_by_connection(&self, connection_id: &ConnectionId) -> Option<MemberId> {
    self.conn_index.get(connection_id).map(|e| *e)
  }

  #[must_use]
  pub fn get_session_by_connection(&self, connection_id: &ConnectionId) -> Option<SessionId> {
    let member_id = self.get_member_by_connection(connection_id)?;
    self.member_index.get(&member_id).map(|e| *e)
  }

  /// §4.B.4 `ListActiveSessions`. Non-empty sessions, newest first.
  ///
  /// # Panics
  /// Panics if the registry mutex is poisoned by a prior panicking holder.
  #[must_use]
  pub fn list_active_sessions(&self) -> ActiveSessionsSnapshot {
    let sessions = self.sessions.lock().expect("session registry mutex poisoned");
    let mut summaries: Vec<SessionSummary> = sessions
      .values()
      .filter(|s| !s.members.is_empty())
      .map(|s| SessionSummary {
        id: s.id,
        name: s.name.clone(),
        member_count: s.members.len(),
        max_members: self.max_members_per_session,
        created_at: s.created_at,
        game_started: s.game_started,
      })
      .collect();
    summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    let active_count = summaries.len() as u32;
    ActiveSessionsSnapshot {
      sessions: summaries,
      max_sessions: self.max_sessions,
      can_create_session: active_count < self.max_sessions,
    }
  }

  /// §4.D.5 `StartGame` precondition + mutation, delegated to by the Hub.
  ///
  /// # Errors
  /// Returns [`CoreError::NotFound`] if the session does not exist,
  /// [`CoreError::NotAuthority`] if `member_id` is not that session's
  /// Authority, or [`CoreError::AlreadyStarted`] if the game already started.
  ///
  /// # Panics
  /// Panics if the registry mutex is poisoned by a prior panicking holder.
  pub fn start_game(&self, session_id: SessionId, member_id: MemberId) -> Result<()> {
    let mut sessions = self.sessions.lock().expect("session registry mutex poisoned");
    let session = sessions.get_mut(&session_id).ok_or(CoreError::NotFound)?;
    if session.authority_id() != Some(member_id) {
      return Err(CoreError::NotAuthority);
    }
    if session.game_started {
      return Err(CoreError::AlreadyStarted);
    }
    session.game_started = true;
    Ok(())
  }
}
