//! WebSocket session handling at `/socket.io/` (spec §4.8, §6.2).
//!
//! A flat `{"event": "...", "data": {...}}` JSON envelope over a plain
//! `axum` WebSocket, rather than a full Engine.IO/Socket.IO handshake (out
//! of scope per spec.md's edge-adapter exclusion). Each connection owns a
//! `bus::Subscription` per joined queue and polls it on a fixed cadence,
//! since the Progress Bus is a pull-based buffer rather than an async
//! channel (see `bus::Subscription::drain`).

use super::{snapshot_json, state::AppState};
use crate::bus::{BusEvent, Subscription};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// At least one poll per the spec's ≥200ms `batch_progress` heartbeat.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

pub async fn upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_session(socket, state))
}

#[derive(Debug, Deserialize)]
struct ClientMessage {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

fn envelope(event: &str, data: serde_json::Value) -> Message {
    Message::Text(
        serde_json::json!({ "event": event, "data": data }).to_string(),
    )
}

fn queue_id_of(data: &serde_json::Value) -> Option<Uuid> {
    data.get("queue_id")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
}

async fn run_session(mut socket: WebSocket, state: AppState) {
    let mut subscriptions: HashMap<Uuid, Subscription> = HashMap::new();

    if socket
        .send(envelope("connected", serde_json::json!({})))
        .await
        .is_err()
    {
        return;
    }

    let mut ticker = tokio::time::interval(POLL_INTERVAL);

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if !handle_client_message(&mut socket, &state, &mut subscriptions, &text).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            _ = ticker.tick() => {
                if !flush_subscriptions(&mut socket, &subscriptions).await {
                    break;
                }
            }
        }
    }
}

async fn handle_client_message(
    socket: &mut WebSocket,
    state: &AppState,
    subscriptions: &mut HashMap<Uuid, Subscription>,
    text: &str,
) -> bool {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(_) => return true, // ignore malformed frames; keep the connection alive
    };

    match msg.event.as_str() {
        "join_queue" => {
            if let Some(job_id) = queue_id_of(&msg.data) {
                subscriptions.entry(job_id).or_insert_with(|| state.bus.subscribe(job_id));
                if let Ok(snapshot) = state.scheduler.progress(job_id) {
                    let payload = snapshot_json(&snapshot.job);
                    if socket.send(envelope("queue_status", payload)).await.is_err() {
                        return false;
                    }
                }
            }
        }
        "leave_queue" => {
            if let Some(job_id) = queue_id_of(&msg.data) {
                subscriptions.remove(&job_id);
            }
        }
        "request_progress" => {
            if let Some(job_id) = queue_id_of(&msg.data) {
                if let Ok(snapshot) = state.scheduler.progress(job_id) {
                    let payload = snapshot_json(&snapshot.job);
                    if socket.send(envelope("batch_progress", payload)).await.is_err() {
                        return false;
                    }
                }
            }
        }
        "cancel_batch" => {
            if let Some(job_id) = queue_id_of(&msg.data) {
                let _ = state.scheduler.cancel(job_id);
            }
        }
        "get_queue_status" => {
            if let Some(job_id) = queue_id_of(&msg.data) {
                if let Ok(snapshot) = state.scheduler.progress(job_id) {
                    let payload = snapshot_json(&snapshot.job);
                    if socket.send(envelope("queue_status", payload)).await.is_err() {
                        return false;
                    }
                }
            }
        }
        "get_active_queues" => {
            let active = state.scheduler.list_active();
            let payload = serde_json::json!({
                "queue_ids": active.iter().map(Uuid::to_string).collect::<Vec<_>>(),
            });
            if socket.send(envelope("active_queues", payload)).await.is_err() {
                return false;
            }
        }
        _ => {}
    }
    true
}

/// Drain every joined queue's buffered events in publication order and
/// forward them as the matching server-to-client event (spec §6.2 "Server
/// -> client events").
async fn flush_subscriptions(
    socket: &mut WebSocket,
    subscriptions: &HashMap<Uuid, Subscription>,
) -> bool {
    for subscription in subscriptions.values() {
        for delivery in subscription.drain() {
            let (event_name, data) = match delivery.event {
                BusEvent::BatchStarted(v) => ("batch_started", v),
                BusEvent::BatchProgress(v) => ("batch_progress", v),
                BusEvent::FileProcessed(v) => ("file_processed", v),
                BusEvent::BatchCompleted(v) => ("batch_completed", v),
                BusEvent::BatchCancelled(v) => ("batch_cancelled", v),
                BusEvent::BatchError(v) => ("batch_error", v),
            };
            let mut payload = data;
            if let serde_json::Value::Object(ref mut map) = payload {
                map.insert("events_lost".into(), delivery.events_lost.into());
            }
            if socket.send(envelope(event_name, payload)).await.is_err() {
                return false;
            }
        }
    }
    true
}
