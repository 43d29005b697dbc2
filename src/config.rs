//! Options struct for the coordination core (§6 "Configuration").
//!
//! Mirrors how the donor codebase takes its own CLI options with `clap`'s
//! derive API, but this struct doubles as a plain library type: callers that
//! embed `lobby_core` without going through a CLI get the same defaults via
//! `HubOptions::default()`.

use clap::Parser;

/// Default cap on concurrently live (non-empty) sessions.
pub const DEFAULT_MAX_SESSIONS: u32 = 6;
/// Default cap on members per session.
pub const DEFAULT_MAX_MEMBERS_PER_SESSION: u32 = 4;

#[derive(Parser, Debug, Clone, Copy, PartialEq, Eq)]
#[command(name = "lobby-core", about = "Real-time multiplayer lobby coordination core")]
pub struct HubOptions {
  /// Maximum number of concurrently live (non-empty) sessions.
  #[arg(long, default_value_t = DEFAULT_MAX_SESSIONS)]
  pub max_sessions: u32,

  /// Maximum number of members allowed in a single session.
  #[arg(long, default_value_t = DEFAULT_MAX_MEMBERS_PER_SESSION)]
  pub max_members_per_session: u32,

  /// Whether orphaned `PerSession` objects are spread round-robin across
  /// remaining members on departure, rather than all assigned to one member.
  #[arg(long, default_value_t = true)]
  pub distribute_orphaned_objects: bool,
}

impl Default for HubOptions {
  fn default() -> Self {
    HubOptions {
      max_sessions: DEFAULT_MAX_SESSIONS,
      max_members_per_session: DEFAULT_MAX_MEMBERS_PER_SESSION,
      distribute_orphaned_objects: true,
    }
  }
}
