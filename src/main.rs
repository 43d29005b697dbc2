use std::sync::Arc;

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use lobby_core::config::HubOptions;
use lobby_core::hub::Hub;
use lobby_core::objects::ObjectRegistry;
use lobby_core::payloads::{Request, Response};
use lobby_core::registry::SessionRegistry;
use lobby_core::transport::BroadcastTransport;
use lobby_core::{debug, error, info, warn};

/// One accepted websocket connection. The framing layer proper (TLS,
/// authentication, reconnect) is deliberately out of scope (§1); this is the
/// thinnest adapter that lets the Hub Dispatcher actually run in a process.
///
/// A connection has exactly one writer: an `mpsc` channel registered with
/// `transport` under `connection_id`, drained by a forwarding task that owns
/// the websocket sink. Both the direct RPC reply below and any broadcast
/// event `transport.send_to_group` emits for this connection go through that
/// same channel, so the two sources of outbound traffic never race on the
/// sink.
async fn handle_connection(hub: Arc<Hub>, transport: Arc<BroadcastTransport>, stream: TcpStream, connection_id: String) {
  let ws_stream = match tokio_tungstenite::accept_async(stream).await {
    Ok(ws) => ws,
    Err(e) => {
      warn!("(handle_connection) Websocket handshake failed for {connection_id}: {e}");
      return;
    }
  };

  let (mut write, mut read) = ws_stream.split();
  let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
  transport.register(&connection_id, tx.clone());

  let forwarder_connection_id = connection_id.clone();
  let forwarder = tokio::task::spawn(async move {
    while let Some(message) = rx.recv().await {
      if let Err(e) = write.send(message).await {
        warn!("(handle_connection) Failed to forward a message to {forwarder_connection_id}: {e}");
        break;
      }
    }
  });

  hub.on_connected(&connection_id).await;

  while let Some(message) = read.next().await {
    let text = match message {
      Ok(Message::Text(text)) => text,
      Ok(Message::Close(_)) => break,
      Ok(_) => continue,
      Err(e) => {
        warn!("(handle_connection) Read error on {connection_id}: {e}");
        break;
      }
    };

    let request: Request = match serde_json::from_str(&text) {
      Ok(r) => r,
      Err(e) => {
        warn!("(handle_connection) Malformed request from {connection_id} ({e}): {text}");
        continue;
      }
    };

    debug!("(handle_connection) {connection_id} -> {}", <&str>::from(&request));
    let response = dispatch(&hub, &connection_id, request).await;

    if let Response::NoReply = response {
      continue;
    }
    match serde_json::to_string(&response) {
      Ok(json) => {
        if tx.send(Message::Text(json.into())).is_err() {
          warn!("(handle_connection) Failed to queue a response for {connection_id}: forwarder already exited.");
          break;
        }
      }
      Err(e) => error!("(handle_connection) Failed to serialize response for {connection_id}: {e}"),
    }
  }

  hub.on_disconnected(&connection_id).await;
  transport.deregister(&connection_id);
  drop(tx);
  let _ = forwarder.await;
}

async fn dispatch(hub: &Hub, connection_id: &String, request: Request) -> Response {
  match request {
    Request::CreateSession(req) => Response::CreateSession(hub.create_session(connection_id, req.aspect_ratio).await),
    Request::JoinSession(req) => Response::JoinSession(hub.join_session(connection_id, req.session_id).await),
    Request::LeaveSession => {
      hub.leave_session(connection_id).await;
      Response::LeaveSession
    }
    Request::GetActiveSessions => Response::GetActiveSessions(hub.get_active_sessions()),
    Request::StartGame => Response::StartGame(hub.start_game(connection_id).await),
    Request::CreateObject(req) => {
      let data = req.data.unwrap_or_default();
      Response::CreateObject(hub.create_object(connection_id, req.scope, data, req.owner_member_id).await)
    }
    Request::UpdateObjects(req) => Response::UpdateObjects(hub.update_objects(connection_id, req.updates).await),
    Request::DeleteObject(req) => Response::DeleteObject(hub.delete_object(connection_id, req.object_id).await),
    Request::ReportBulletHit(payload) => {
      hub.report_bullet_hit(connection_id, payload).await;
      Response::NoReply
    }
    Request::ConfirmBulletHit(payload) => {
      hub.confirm_bullet_hit(connection_id, payload).await;
      Response::NoReply
    }
    Request::RejectBulletHit(payload) => {
      hub.reject_bullet_hit(connection_id, payload).await;
      Response::NoReply
    }
    Request::ReportShipHit(payload) => {
      hub.report_ship_hit(connection_id, payload).await;
      Response::NoReply
    }
    Request::ReportScore(payload) => {
      hub.report_score(connection_id, payload).await;
      Response::NoReply
    }
  }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
  tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

  let options = HubOptions::parse();
  info!("(main) Starting lobby-core with options: {options:?}");

  let registry = Arc::new(SessionRegistry::new(options.max_sessions, options.max_members_per_session));
  let objects = Arc::new(ObjectRegistry::new(options.distribute_orphaned_objects));
  let transport = Arc::new(BroadcastTransport::new());
  let hub = Arc::new(Hub::new(registry, objects, transport.clone()));

  let addr = "127.0.0.1:3000";
  let listener = TcpListener::bind(addr).await?;
  info!("(main) Listening on {addr}.");

  loop {
    let (stream, peer_addr) = listener.accept().await?;
    let connection_id = peer_addr.to_string();
    let hub = hub.clone();
    let transport = transport.clone();
    tokio::task::spawn(async move {
      handle_connection(hub, transport, stream, connection_id).await;
    });
  }
}
