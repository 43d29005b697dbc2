//! Wire payloads: the RPC request/response surface and the outgoing event
//! catalogue (§6 "External interfaces").
//!
//! Mirrors the donor's own `RequestMsg`/`ResponseMsg` shape — a tagged enum
//! per direction, `IntoStaticStr` on the outgoing side so the Hub can hand
//! the transport a message name and a payload the way `Clients.Group(...)
//! .Send(method, payload)` expects.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;
use strum_macros::IntoStaticStr;

use crate::objects::{Object, ObjectData, ObjectId, Scope};
use crate::registry::{ActiveSessionsSnapshot, MemberId, Role, SessionId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberInfo {
  pub member_id: MemberId,
  pub role: Role,
  pub joined_at: u64,
}

/// One element of `UpdateObjects`' `updates[]` (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectUpdate {
  pub object_id: ObjectId,
  pub patch: ObjectData,
  pub expected_version: Option<u64>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
  pub aspect_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinSessionRequest {
  pub session_id: SessionId,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateObjectRequest {
  pub scope: Scope,
  pub data: Option<ObjectData>,
  pub owner_member_id: Option<MemberId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateObjectsRequest {
  pub updates: Vec<ObjectUpdate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteObjectRequest {
  pub object_id: ObjectId,
}

/// The five domain-specific relay RPCs (§4.D.7) all carry an opaque payload
/// the core never introspects, plus (on the way out) the reporter's member
/// id appended by the Hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayPayload {
  #[serde(flatten)]
  pub body: HashMap<String, Value>,
}

/// Incoming RPC surface (§6 "RPC surface"). Wire shape is `{"method": ...,
/// "payload": ...}`, adjacently tagged so a method with no request body
/// (`LeaveSession`, `GetActiveSessions`, `StartGame`) serializes with no
/// `payload` key at all. `IntoStaticStr` gives the Hub the same method name
/// for logging without duplicating a name string per arm.
#[derive(Debug, Clone, Serialize, Deserialize, IntoStaticStr)]
#[serde(tag = "method", content = "payload")]
pub enum Request {
  CreateSession(CreateSessionRequest),
  JoinSession(JoinSessionRequest),
  LeaveSession,
  GetActiveSessions,
  StartGame,
  CreateObject(CreateObjectRequest),
  UpdateObjects(UpdateObjectsRequest),
  DeleteObject(DeleteObjectRequest),
  ReportBulletHit(RelayPayload),
  ConfirmBulletHit(RelayPayload),
  RejectBulletHit(RelayPayload),
  ReportShipHit(RelayPayload),
  ReportScore(RelayPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
  pub session_id: SessionId,
  pub session_name: String,
  pub member_id: MemberId,
  pub role: Role,
  pub aspect_ratio: f64,
}

/// The "joining snapshot" returned by `JoinSession` (§4.D.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinSnapshot {
  pub session_id: SessionId,
  pub session_name: String,
  pub member_id: MemberId,
  pub role: Role,
  pub members: Vec<MemberInfo>,
  pub objects: Vec<Object>,
  pub aspect_ratio: f64,
  pub game_started: bool,
}

/// Direct RPC reply sent back to the calling connection — distinct from the
/// broadcast [`Event`]s fanned out to session/global groups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
  CreateSession(Option<CreateSessionResponse>),
  JoinSession(Option<JoinSnapshot>),
  LeaveSession,
  GetActiveSessions(ActiveSessionsSnapshot),
  StartGame(bool),
  CreateObject(Option<Object>),
  UpdateObjects(Vec<Object>),
  DeleteObject(bool),
  NoReply,
}

/// `OnMemberLeft`'s payload (§4.D.4 step 5).
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberLeftPayload {
  pub member_id: MemberId,
  pub promoted_member_id: Option<MemberId>,
  pub promoted_role: Option<Role>,
  pub deleted_object_ids: Vec<ObjectId>,
  pub migrations: Vec<ObjectMigration>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMigration {
  pub object_id: ObjectId,
  pub new_owner_id: MemberId,
}

/// The outgoing event catalogue (§6 "Outgoing events"). `IntoStaticStr`
/// supplies the transport method name (`(&event).into()`); `serde(untagged)`
/// means only the payload crosses the wire, since the method name travels
/// alongside it as the `Transport::send_to_group` argument, not embedded in
/// the JSON body.
#[derive(Debug, Clone, Serialize, IntoStaticStr)]
#[serde(untagged)]
pub enum Event {
  OnSessionsChanged,
  OnMemberJoined(MemberInfo),
  OnMemberLeft(MemberLeftPayload),
  OnObjectCreated(Object),
  OnObjectsUpdated(Vec<Object>),
  OnObjectDeleted(ObjectId),
  OnObjectTypeEmpty(String),
  OnObjectTypeRestored(String),
  OnGameStarted(SessionId),
  OnBulletHitReported(RelayPayload),
  OnBulletHitConfirmed(RelayPayload),
  OnBulletHitRejected(RelayPayload),
  OnShipHitReported(RelayPayload),
  OnScoreReported(RelayPayload),
}

#[cfg(test)]
mod tests {
  use super::*;
  use assert_json_diff::assert_json_eq;
  use serde_json::json;

  #[test]
  fn member_joined_event_serializes_without_the_method_tag() {
    let event = Event::OnMemberJoined(MemberInfo { member_id: MemberId::nil(), role: Role::Participant, joined_at: 42 });
    let value = serde_json::to_value(&event).unwrap();
    assert_json_eq!(
      value,
      json!({ "memberId": "00000000-0000-0000-0000-000000000000", "role": "Participant", "joinedAt": 42 })
    );
  }

  #[test]
  fn create_session_request_deserializes_from_tagged_wire_shape() {
    let json_value = json!({ "method": "CreateSession", "payload": { "aspectRatio": 1.5 } });
    let request: Request = serde_json::from_value(json_value).unwrap();
    match request {
      Request::CreateSession(req) => assert!((req.aspect_ratio - 1.5).abs() < f64::EPSILON),
      _ => panic!("expected CreateSession"),
    }
  }

  #[test]
  fn no_payload_requests_omit_the_payload_key() {
    let json_value = json!({ "method": "LeaveSession" });
    let request: Request = serde_json::from_value(json_value).unwrap();
    assert!(matches!(request, Request::LeaveSession));
  }

  #[test]
  fn event_method_names_match_the_spec_surface() {
    let event = Event::OnSessionsChanged;
    let name: &'static str = (&event).into();
    assert_eq!(name, "OnSessionsChanged");

    let event = Event::OnObjectTypeEmpty("asteroid".to_string());
    let name: &'static str = (&event).into();
    assert_eq!(name, "OnObjectTypeEmpty");
  }

  #[test]
  fn relay_payload_round_trips_opaque_fields() {
    let json_value = json!({ "shooterId": "a", "targetId": "b", "damage": 12 });
    let payload: RelayPayload = serde_json::from_value(json_value).unwrap();
    assert_eq!(payload.body.get("damage"), Some(&json!(12)));
  }
}
