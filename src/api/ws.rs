//! WebSocket push channel
//!
//! Clients open a socket and send subscribe-by-class messages; matching
//! events stream back as JSON. Lagging subscribers skip ahead rather than
//! blocking publishers.

use super::ApiState;

use crate::events::EventClass;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use serde::Deserialize;
use std::collections::HashSet;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct SubscribeMessage {
    #[serde(rename = "type")]
    kind: String,
}

fn class_for(kind: &str) -> Option<EventClass> {
    match kind {
        "subscribe_metrics" => Some(EventClass::Metrics),
        "subscribe_recordings" => Some(EventClass::Recordings),
        "subscribe_scaling_alerts" => Some(EventClass::Scaling),
        _ => None,
    }
}

/// WebSocket handler for the event push channel
pub async fn events_handler(
    ws: WebSocketUpgrade,
    State(state): State<ApiState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(mut socket: WebSocket, state: ApiState) {
    let mut classes: HashSet<EventClass> = HashSet::new();

    // First message selects the initial subscription class
    match socket.recv().await {
        Some(Ok(Message::Text(text))) => match parse_subscribe(&text) {
            Some(class) => {
                classes.insert(class);
            }
            None => {
                let _ = socket
                    .send(Message::Text(
                        serde_json::json!({
                            "type": "error",
                            "error": "expected a subscribe_* message"
                        })
                        .to_string(),
                    ))
                    .await;
                return;
            }
        },
        _ => return,
    }

    let mut rx = state.orchestrator.bus.subscribe();

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if !classes.contains(&event.class()) {
                            continue;
                        }
                        let Ok(text) = serde_json::to_string(&event) else {
                            continue;
                        };
                        if socket.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Push subscriber lagged, skipped {} events", skipped);
                        continue;
                    }
                    Err(_) => break,
                }
            }
            msg = socket.recv() => {
                match msg {
                    // Additional subscribe messages widen the selection
                    Some(Ok(Message::Text(text))) => {
                        if let Some(class) = parse_subscribe(&text) {
                            classes.insert(class);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    _ => continue,
                }
            }
        }
    }
}

fn parse_subscribe(text: &str) -> Option<EventClass> {
    serde_json::from_str::<SubscribeMessage>(text)
        .ok()
        .and_then(|m| class_for(&m.kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_messages_map_to_classes() {
        assert_eq!(
            parse_subscribe(r#"{"type":"subscribe_metrics"}"#),
            Some(EventClass::Metrics)
        );
        assert_eq!(
            parse_subscribe(r#"{"type":"subscribe_recordings"}"#),
            Some(EventClass::Recordings)
        );
        assert_eq!(
            parse_subscribe(r#"{"type":"subscribe_scaling_alerts"}"#),
            Some(EventClass::Scaling)
        );
        assert_eq!(parse_subscribe(r#"{"type":"subscribe_everything"}"#), None);
        assert_eq!(parse_subscribe("not json"), None);
    }
}
