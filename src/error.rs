//! Error types for the Session Registry and Hub Dispatcher.
//!
//! Only outcomes §7 classifies as genuine errors get a [`CoreError`] variant.
//! Outcomes §7 calls a "silent no-op" (version mismatch, missing object,
//! `StartGame` by a non-authority) are represented as `Option::None` / `false`
//! at the call site instead, exactly as the spec prescribes — see the
//! relevant doc comments on `ObjectRegistry` and `Hub` methods.

use thiserror::Error;

/// Failures surfaced by the Session Registry (§4.B) and relayed by the Hub
/// Dispatcher as a null RPC response.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CoreError {
  /// The connection already has a live member somewhere in the registry.
  #[error("connection is already in a session")]
  AlreadyInSession,

  /// `MaxSessions` non-empty sessions already exist.
  #[error("session capacity reached")]
  CapacityReached,

  /// The target session's `Members` count is at `MaxMembersPerSession`.
  #[error("session is full")]
  SessionFull,

  /// The referenced session (or, for `StartGame`, the caller's session) does not exist.
  #[error("not found")]
  NotFound,

  /// `StartGame` called by a member other than the session's Authority.
  #[error("caller is not the session authority")]
  NotAuthority,

  /// `StartGame` called on a session that already has `GameStarted = true`.
  #[error("game already started")]
  AlreadyStarted,
}

pub type Result<T> = std::result::Result<T, CoreError>;
