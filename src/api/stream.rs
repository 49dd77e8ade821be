//! WebSocket streaming subscription.
//!
//! On connect the subscriber immediately receives the current snapshot, then
//! one payload per publish interval until disconnect. A slow client only ever
//! loses its own oldest payloads; the publisher and other subscribers are
//! unaffected.

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::Response,
};
use tracing::{debug, warn};

use crate::api::routes::AppState;
use crate::fleet::publisher::StreamPublisher;
use crate::models::WsServerEvent;

pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let mut subscription = state.publisher.subscribe();

    // Immediate snapshot so the client is never empty while waiting for the
    // first publish tick.
    let initial = StreamPublisher::payload_from(&state.aggregator.capture());
    if send_event(&mut socket, &WsServerEvent::Snapshot(initial))
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            maybe_payload = subscription.recv() => {
                let Some(payload) = maybe_payload else { break };
                let event = WsServerEvent::Snapshot((*payload).clone());
                if send_event(&mut socket, &event).await.is_err() {
                    break;
                }
            }
            maybe_msg = socket.recv() => {
                match maybe_msg {
                    Some(Ok(Message::Text(text))) => {
                        if text == "ping" {
                            let _ = socket.send(Message::Text("pong".to_string())).await;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "ws receive error; dropping subscriber");
                        break;
                    }
                }
            }
        }
    }

    debug!(
        dropped = subscription.dropped,
        "stream subscriber disconnected"
    );
}

async fn send_event(socket: &mut WebSocket, event: &WsServerEvent) -> Result<(), ()> {
    let msg = serde_json::to_string(event).unwrap_or_else(|e| {
        warn!("failed to serialize ws event: {}", e);
        "{}".to_string()
    });
    socket.send(Message::Text(msg)).await.map_err(|_| ())
}
