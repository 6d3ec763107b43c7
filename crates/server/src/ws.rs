//! WebSocket endpoint for the progress bus.
//!
//! Clients subscribe to all jobs or an explicit set, mutable at runtime.
//! The server pings every 20 s and closes subscribers that miss the pong
//! deadline; the bus closes subscribers that stop consuming entirely.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::api::AppState;
use crate::bus::{BusEvent, SubscriptionFilter};
use crate::jobs::now_ms;

/// Server ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(20);

/// A client that has not answered a ping within this window is closed.
const PONG_DEADLINE: Duration = Duration::from_secs(40);

/// Close code for refusals and overwhelmed subscribers (try again later).
const CLOSE_TRY_AGAIN: u16 = 1013;

/// Messages accepted from clients.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Ping,
    Pong,
    Subscribe { job_ids: Vec<String> },
    Unsubscribe { job_ids: Vec<String> },
    SubscribeAll,
}

/// Upgrade handler for `/ws/progress`.
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    // Until the client declares interest it hears nothing.
    let subscription = match state.bus.subscribe(SubscriptionFilter::Jobs(HashSet::new())) {
        Ok(subscription) => subscription,
        Err(e) => {
            let (mut sink, _) = socket.split();
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_TRY_AGAIN,
                    reason: e.to_string().into(),
                })))
                .await;
            return;
        }
    };

    info!(subscriber = subscription.id(), "websocket client connected");

    let (mut sink, mut stream) = socket.split();
    let mut ping_timer = tokio::time::interval(PING_INTERVAL);
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; that opening ping also starts the
    // pong clock.
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            event = subscription.recv() => {
                match event {
                    Some(event) => {
                        let Ok(text) = serde_json::to_string(&event) else { continue };
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        // The bus disconnected us (consumer too slow).
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code: CLOSE_TRY_AGAIN,
                                reason: "subscriber not consuming".into(),
                            })))
                            .await;
                        break;
                    }
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(ClientMessage::Ping) => {
                                let _ = sink
                                    .send(Message::Text("{\"type\":\"pong\"}".into()))
                                    .await;
                            }
                            Ok(ClientMessage::Pong) => {
                                last_pong = Instant::now();
                            }
                            Ok(ClientMessage::Subscribe { job_ids }) => {
                                subscription.subscribe_jobs(&job_ids);
                            }
                            Ok(ClientMessage::Unsubscribe { job_ids }) => {
                                subscription.unsubscribe_jobs(&job_ids);
                            }
                            Ok(ClientMessage::SubscribeAll) => {
                                subscription.set_filter(SubscriptionFilter::All);
                            }
                            Err(e) => {
                                debug!(error = %e, "ignoring malformed client message");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = sink.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
            _ = ping_timer.tick() => {
                if last_pong.elapsed() > PONG_DEADLINE {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: CLOSE_TRY_AGAIN,
                            reason: "pong deadline missed".into(),
                        })))
                        .await;
                    break;
                }
                let ping = BusEvent::Ping { server_ts: now_ms() };
                let Ok(text) = serde_json::to_string(&ping) else { continue };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        }
    }

    info!(subscriber = subscription.id(), dropped = subscription.dropped_events(), "websocket client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_parsing() {
        assert_eq!(
            serde_json::from_str::<ClientMessage>(r#"{"type":"ping"}"#).unwrap(),
            ClientMessage::Ping
        );
        assert_eq!(
            serde_json::from_str::<ClientMessage>(r#"{"type":"pong"}"#).unwrap(),
            ClientMessage::Pong
        );
        assert_eq!(
            serde_json::from_str::<ClientMessage>(
                r#"{"type":"subscribe","job_ids":["a","b"]}"#
            )
            .unwrap(),
            ClientMessage::Subscribe {
                job_ids: vec!["a".to_string(), "b".to_string()]
            }
        );
        assert_eq!(
            serde_json::from_str::<ClientMessage>(r#"{"type":"unsubscribe","job_ids":[]}"#)
                .unwrap(),
            ClientMessage::Unsubscribe { job_ids: vec![] }
        );
        assert_eq!(
            serde_json::from_str::<ClientMessage>(r#"{"type":"subscribe_all"}"#).unwrap(),
            ClientMessage::SubscribeAll
        );
    }

    #[test]
    fn test_malformed_client_messages_rejected() {
        assert!(serde_json::from_str::<ClientMessage>("{}").is_err());
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"explode"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"subscribe"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>("not json").is_err());
    }
}
