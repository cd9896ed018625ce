//! Axum WebSocket server: framed JSON at / on a single port. Each connection
//! gets a reader task (inbound dispatch) and a writer task that drains the
//! client's bounded outbound queue; the registry closes a connection by
//! dropping the queue's senders.

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::Response,
    routing::get,
    Router,
};
use common::protocol::{decode_client, encode_server, ServerMsg};
use common::registry::Registry;
use common::session::{ClientId, CLIENT_QUEUE_CAP};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Inbound frames above this size drop the connection.
const MAX_INBOUND_BYTES: usize = 1024 * 1024;

/// Runs the axum server on every interface (remote clients on the trusted
/// LAN are the point). A bind failure surfaces as an error so the process
/// exits non-zero. Resolves after ctrl-c once the registry has drained.
pub async fn run_web_server(port: u16, registry: Arc<Registry>) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(registry.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("shareterm listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(registry))
        .await?;
    Ok(())
}

async fn shutdown_signal(registry: Arc<Registry>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutting down, draining sessions");
    registry.shutdown();
}

async fn ws_handler(State(registry): State<Arc<Registry>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, registry))
}

async fn handle_socket(socket: WebSocket, registry: Arc<Registry>) {
    let client_id = ClientId::new();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMsg>(CLIENT_QUEUE_CAP);
    registry.register_client(client_id, out_tx);
    info!(client = %client_id, "connection open");

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Drains the bounded queue into the socket. Ends when every sender is
    // gone (the registry dropped this client) or the peer goes away.
    let outbound = async {
        while let Some(msg) = out_rx.recv().await {
            if ws_tx
                .send(Message::Text(encode_server(&msg).into()))
                .await
                .is_err()
            {
                break;
            }
        }
    };

    let inbound = async {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                Message::Text(text) => {
                    if text.len() > MAX_INBOUND_BYTES {
                        warn!(client = %client_id, size = text.len(), "inbound frame too large");
                        break;
                    }
                    dispatch(&registry, client_id, text.as_str()).await;
                }
                Message::Close(_) => break,
                // Pings are answered by the websocket layer; binary frames
                // are not part of the protocol.
                _ => {}
            }
        }
    };

    tokio::select! {
        _ = outbound => {}
        _ = inbound => {}
    }
    registry.client_gone(client_id);
    info!(client = %client_id, "connection closed");
}

/// Handle one inbound frame. Protocol and registry errors become `error`
/// replies to this client only; unknown types are dropped; transport errors
/// are the caller's concern.
async fn dispatch(registry: &Arc<Registry>, client: ClientId, text: &str) {
    use common::protocol::ClientMsg;

    let msg = match decode_client(text) {
        Ok(Some(msg)) => msg,
        Ok(None) => {
            debug!(client = %client, "ignoring unknown frame type");
            return;
        }
        Err(message) => {
            registry.send_to_client(client, ServerMsg::Error { message });
            return;
        }
    };

    match msg {
        ClientMsg::List => registry.broadcast_sessions(),
        ClientMsg::Create { name } => {
            if let Err(e) = registry.create(&name, client) {
                registry.send_to_client(
                    client,
                    ServerMsg::Error {
                        message: e.to_string(),
                    },
                );
            }
        }
        ClientMsg::Attach { name } => match registry.attach(&name, client) {
            // The scrollback replay is already queued ahead of this reply.
            Ok(()) => registry.send_to_client(client, ServerMsg::Attached { name }),
            Err(e) => registry.send_to_client(
                client,
                ServerMsg::Error {
                    message: e.to_string(),
                },
            ),
        },
        ClientMsg::Kill { name } => {
            if let Err(e) = registry.kill(&name) {
                registry.send_to_client(
                    client,
                    ServerMsg::Error {
                        message: e.to_string(),
                    },
                );
            }
        }
        ClientMsg::Rename { old_name, new_name } => {
            if let Err(e) = registry.rename(&old_name, &new_name) {
                registry.send_to_client(
                    client,
                    ServerMsg::Error {
                        message: e.to_string(),
                    },
                );
            }
        }
        ClientMsg::Input { data } => registry.input(client, data).await,
        ClientMsg::Resize { cols, rows } => {
            if cols == 0 || rows == 0 {
                registry.send_to_client(
                    client,
                    ServerMsg::Error {
                        message: "cols and rows must be at least 1".to_string(),
                    },
                );
            } else {
                registry.resize(client, cols, rows);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect(reg: &Arc<Registry>) -> (ClientId, mpsc::Receiver<ServerMsg>) {
        let id = ClientId::new();
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_CAP);
        reg.register_client(id, tx);
        (id, rx)
    }

    #[tokio::test]
    async fn malformed_frame_gets_error_reply() {
        let reg = Arc::new(Registry::new(1024));
        let (a, mut rx) = connect(&reg);

        dispatch(&reg, a, "{oops").await;
        let reply = rx.recv().await.expect("error reply");
        assert!(matches!(reply, ServerMsg::Error { .. }));
    }

    #[tokio::test]
    async fn unknown_type_is_dropped_without_reply() {
        let reg = Arc::new(Registry::new(1024));
        let (a, mut rx) = connect(&reg);

        dispatch(&reg, a, r#"{"type":"telemetry","x":1}"#).await;
        assert!(rx.try_recv().is_err(), "unknown frames produce nothing");
    }

    #[tokio::test]
    async fn kill_missing_session_replies_error() {
        let reg = Arc::new(Registry::new(1024));
        let (a, mut rx) = connect(&reg);

        dispatch(&reg, a, r#"{"type":"kill","name":"ghost"}"#).await;
        let reply = rx.recv().await.expect("error reply");
        match reply {
            ServerMsg::Error { message } => assert!(message.contains("not found")),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn zero_resize_is_rejected() {
        let reg = Arc::new(Registry::new(1024));
        let (a, mut rx) = connect(&reg);

        dispatch(&reg, a, r#"{"type":"resize","cols":0,"rows":24}"#).await;
        let reply = rx.recv().await.expect("error reply");
        assert!(matches!(reply, ServerMsg::Error { .. }));
    }

    #[tokio::test]
    async fn list_reaches_every_connected_client() {
        let reg = Arc::new(Registry::new(1024));
        let (a, mut rx_a) = connect(&reg);
        let (_b, mut rx_b) = connect(&reg);

        dispatch(&reg, a, r#"{"type":"list"}"#).await;
        assert!(matches!(
            rx_a.recv().await,
            Some(ServerMsg::Sessions { .. })
        ));
        assert!(matches!(
            rx_b.recv().await,
            Some(ServerMsg::Sessions { .. })
        ));
    }
}
