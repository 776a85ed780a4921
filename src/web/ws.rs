//! WebSocket push channel for observer clients.
//!
//! Clients identify themselves with an opaque connection id at connect time;
//! connections without one are rejected. Messages are the broadcaster's
//! `{type, data}` events, plus a greeting and an application-level ping/pong.

use super::AppState;
use crate::broadcast::Broadcaster;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    pub client_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct Greeting<'a> {
    r#type: &'static str,
    client_id: &'a str,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct Pong {
    r#type: &'static str,
    timestamp: DateTime<Utc>,
}

pub async fn handle_ws(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(client_id) = query.client_id.filter(|id| !id.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "client_id required").into_response();
    };

    let broadcaster = state.broadcaster.clone();
    ws.on_upgrade(move |socket| client_loop(socket, client_id, broadcaster))
}

async fn client_loop(socket: WebSocket, client_id: String, broadcaster: Arc<Broadcaster>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    broadcaster.register(&client_id, tx.clone());

    let (mut sink, mut stream) = socket.split();

    let greeting = Greeting {
        r#type: "connection_established",
        client_id: &client_id,
        timestamp: Utc::now(),
    };
    if let Ok(text) = serde_json::to_string(&greeting) {
        if sink.send(Message::Text(text.into())).await.is_err() {
            broadcaster.unregister_channel(&client_id, &tx);
            return;
        }
    }

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(text) => {
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if is_ping(text.as_str()) {
                            let pong = Pong {
                                r#type: "pong",
                                timestamp: Utc::now(),
                            };
                            if let Ok(reply) = serde_json::to_string(&pong) {
                                if sink.send(Message::Text(reply.into())).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    broadcaster.unregister_channel(&client_id, &tx);
}

fn is_ping(text: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(text)
        .map(|v| v["type"] == "ping")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_ping() {
        assert!(is_ping(r#"{"type":"ping"}"#));
        assert!(!is_ping(r#"{"type":"pong"}"#));
        assert!(!is_ping("not json"));
        assert!(!is_ping("{}"));
    }
}
