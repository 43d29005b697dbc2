//! The transport contract (§6 "Transport contract") and a concrete fallback.
//!
//! The framing layer itself — how bytes become RPC calls, TLS, websockets —
//! is explicitly out of scope (§1). What the Hub Dispatcher needs from it is
//! narrow: a connection identifier, group membership, and group send. This
//! module defines that contract as [`Transport`] and ships one concrete
//! implementation, [`BroadcastTransport`], built the way §9 "Broadcast
//! fan-out" prescribes when the transport itself doesn't provide groups: a
//! per-group set of connection ids, iterated under a lock.
//!
//! Group membership alone doesn't deliver anything — `main.rs` registers a
//! real outbound channel per connection (see [`BroadcastTransport::register`])
//! so a group send actually reaches the websocket write half owned by that
//! connection's forwarding task, rather than only logging that it would have.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::payloads::Event;
use crate::{debug, warn};

pub type ConnectionId = String;
pub type GroupName = String;

/// Name of the group every connected client belongs to (§4.D "global group").
pub const GLOBAL_GROUP: &str = "__global__";

/// What the Hub Dispatcher needs from the transport (§6).
///
/// Payloads cross this boundary as the concrete [`Event`] catalogue, not a
/// generic parameter, so `Transport` stays object-safe — the Hub holds an
/// `Arc<dyn Transport>` rather than being generic over the transport type.
/// Implementations must make `send_to_group`/`send_to_others_in_group`
/// best-effort: §7 says a transport exception during broadcast is logged at
/// warn and does not undo state, so these methods do not return `Result`.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn add_to_group(&self, connection_id: &str, group: &str);
  async fn remove_from_group(&self, connection_id: &str, group: &str);
  async fn send_to_group(&self, group: &str, event: &Event);
  async fn send_to_others_in_group(&self, group: &str, exclude: &str, event: &Event);
}

/// In-process fallback transport: a per-group set of connection ids guarded
/// by one lock, exactly as §9 describes for a transport with no native
/// notion of groups, plus a `connection_id -> sender` map that actually
/// delivers. `main.rs` calls [`register`](Self::register) with the sending
/// half of an `mpsc` channel per accepted connection and owns a forwarding
/// task that drains the matching receiver onto the real websocket sink; a
/// real deployment swaps this whole type for an adapter over its own framing
/// layer.
pub struct BroadcastTransport {
  groups: Mutex<HashMap<GroupName, HashSet<ConnectionId>>>,
  senders: Mutex<HashMap<ConnectionId, mpsc::UnboundedSender<Message>>>,
}

impl BroadcastTransport {
  #[must_use]
  pub fn new() -> Self {
    BroadcastTransport { groups: Mutex::new(HashMap::new()), senders: Mutex::new(HashMap::new()) }
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<GroupName, HashSet<ConnectionId>>> {
    self.groups.lock().expect("broadcast transport groups mutex poisoned")
  }

  fn lock_senders(&self) -> std::sync::MutexGuard<'_, HashMap<ConnectionId, mpsc::UnboundedSender<Message>>> {
    self.senders.lock().expect("broadcast transport senders mutex poisoned")
  }

  /// Snapshot of a group's members, for tests and diagnostics.
  #[must_use]
  pub fn members_of(&self, group: &str) -> HashSet<ConnectionId> {
    self.lock().get(group).cloned().unwrap_or_default()
  }

  /// Registers the outbound channel `main.rs` forwards onto a connection's
  /// websocket sink, so group sends addressed to `connection_id` actually
  /// reach it. Overwrites any prior sender for the same id.
  pub fn register(&self, connection_id: &str, sender: mpsc::UnboundedSender<Message>) {
    self.lock_senders().insert(connection_id.to_string(), sender);
  }

  /// Drops `connection_id`'s outbound channel; called once its websocket
  /// handler exits, group membership cleanup happens separately via
  /// `remove_from_group`/the Hub's disconnect flow.
  pub fn deregister(&self, connection_id: &str) {
    self.lock_senders().remove(connection_id);
  }

  fn deliver(&self, connection_id: &str, group: &str, method: &str, json: &str) {
    let senders = self.lock_senders();
    match senders.get(connection_id) {
      Some(sender) => {
        if sender.send(Message::Text(json.to_string().into())).is_err() {
          warn!("(BroadcastTransport) {connection_id} [{group}] {method}: receiver dropped, message not delivered.");
        }
      }
      None => debug!("(BroadcastTransport) {connection_id} [{group}] {method}: no registered sender, skipping."),
    }
  }
}

impl Default for BroadcastTransport {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl Transport for BroadcastTransport {
  async fn add_to_group(&self, connection_id: &str, group: &str) {
    self.lock().entry(group.to_string()).or_default().insert(connection_id.to_string());
  }

  async fn remove_from_group(&self, connection_id: &str, group: &str) {
    if let Some(members) = self.lock().get_mut(group) {
      members.remove(connection_id);
    }
  }

  async fn send_to_group(&self, group: &str, event: &Event) {
    let members = self.members_of(group);
    let method: &'static str = event.into();
    match serde_json::to_string(event) {
      Ok(json) => {
        for member in &members {
          self.deliver(member, group, method, &json);
        }
      }
      Err(e) => warn!("(BroadcastTransport) Failed to serialize {method} payload for group {group}: {e}"),
    }
  }

  async fn send_to_others_in_group(&self, group: &str, exclude: &str, event: &Event) {
    let members = self.members_of(group);
    let method: &'static str = event.into();
    match serde_json::to_string(event) {
      Ok(json) => {
        for member in members.iter().filter(|m| m.as_str() != exclude) {
          self.deliver(member, group, method, &json);
        }
      }
      Err(e) => warn!("(BroadcastTransport) Failed to serialize {method} payload for group {group}: {e}"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn group_membership_tracks_add_and_remove() {
    let transport = BroadcastTransport::new();
    transport.add_to_group("c1", "session-1").await;
    transport.add_to_group("c2", "session-1").await;
    assert_eq!(transport.members_of("session-1").len(), 2);

    transport.remove_from_group("c1", "session-1").await;
    let remaining = transport.members_of("session-1");
    assert_eq!(remaining.len(), 1);
    assert!(remaining.contains("c2"));
  }

  #[tokio::test]
  async fn removing_from_an_unknown_group_is_a_noop() {
    let transport = BroadcastTransport::new();
    transport.remove_from_group("c1", "nonexistent").await;
    assert!(transport.members_of("nonexistent").is_empty());
  }

  #[tokio::test]
  async fn send_to_group_and_others_does_not_panic_on_empty_group() {
    let transport = BroadcastTransport::new();
    transport.send_to_group("empty", &Event::OnSessionsChanged).await;
    transport.send_to_others_in_group("empty", "c1", &Event::OnSessionsChanged).await;
  }

  #[tokio::test]
  async fn send_to_group_delivers_to_registered_connections() {
    let transport = BroadcastTransport::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    transport.register("c1", tx);
    transport.add_to_group("c1", "session-1").await;

    transport.send_to_group("session-1", &Event::OnSessionsChanged).await;

    let message = rx.recv().await.expect("registered connection should receive a forwarded message");
    assert!(matches!(message, Message::Text(_)));
  }

  #[tokio::test]
  async fn send_to_others_in_group_skips_the_excluded_connection() {
    let transport = BroadcastTransport::new();
    let (tx1, mut rx1) = mpsc::unbounded_channel();
    let (tx2, mut rx2) = mpsc::unbounded_channel();
    transport.register("c1", tx1);
    transport.register("c2", tx2);
    transport.add_to_group("c1", "session-1").await;
    transport.add_to_group("c2", "session-1").await;

    transport.send_to_others_in_group("session-1", "c1", &Event::OnSessionsChanged).await;

    assert!(rx1.try_recv().is_err(), "excluded connection should not receive the event");
    assert!(rx2.recv().await.is_some());
  }

  #[tokio::test]
  async fn deregister_stops_further_delivery() {
    let transport = BroadcastTransport::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    transport.register("c1", tx);
    transport.add_to_group("c1", "session-1").await;
    transport.deregister("c1");

    transport.send_to_group("session-1", &Event::OnSessionsChanged).await;
    assert!(rx.try_recv().is_err());
  }
}
