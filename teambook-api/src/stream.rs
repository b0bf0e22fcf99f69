//! WebSocket event streaming.
//!
//! Frame protocol (text frames, JSON):
//! - server on connect: `{type:"auth_required", conn_id, token}`
//! - client: `{type:"auth", token}` → `{type:"connected", conn_id, ai_id,
//!   watches_synced}`
//! - heartbeat: `{type:"ping"}` → `{type:"pong"}`; idle > 300 s disconnects
//! - server: `{type:"event", event_id, item_type, item_id, event_type,
//!   summary?, actor_ai_id, created_at}`
//! - client ack: `{type:"ack", event_id}` (accepted, informational)
//! - errors: `{type:"error", error:"<code>"}`
//!
//! Events are durable until expiry, so a client that never connects can
//! pull the same stream via `get_events` without loss.

use crate::AppState;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::Response;
use chrono::Utc;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use governor::{Quota, RateLimiter};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use teambook_core::{AiId, StreamConnection, StreamStatus, StreamSubscription, Timestamp, STREAM_IDLE_TIMEOUT_SECS, STREAM_RATE_PER_SECOND, STREAM_TOKEN_TTL_HOURS};
use teambook_events::DomainEvent;
use teambook_storage::StorageBackend;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

type ConnLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Server-side registry of live streaming connections.
pub struct StreamRegistry {
    connections: DashMap<Uuid, StreamConnection>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    fn issue(&self, ai_hint: Option<AiId>) -> StreamConnection {
        let conn = StreamConnection {
            conn_id: Uuid::new_v4(),
            ai_id: ai_hint,
            auth_token: generate_token(),
            connected_at: Utc::now(),
            last_ping: Utc::now(),
            status: StreamStatus::Pending,
        };
        self.connections.insert(conn.conn_id, conn.clone());
        conn
    }

    /// Consume a single-use token. Succeeds once per connection.
    fn authenticate(&self, conn_id: Uuid, token: &str, now: Timestamp) -> Option<AiId> {
        let mut entry = self.connections.get_mut(&conn_id)?;
        if entry.status != StreamStatus::Pending || entry.auth_token != token {
            return None;
        }
        if now - entry.connected_at > chrono::Duration::hours(STREAM_TOKEN_TTL_HOURS) {
            return None;
        }
        entry.status = StreamStatus::Authenticated;
        entry.auth_token.clear();
        entry.ai_id.clone()
    }

    fn touch(&self, conn_id: Uuid) {
        if let Some(mut entry) = self.connections.get_mut(&conn_id) {
            entry.last_ping = Utc::now();
        }
    }

    fn close(&self, conn_id: Uuid) {
        self.connections.remove(&conn_id);
    }

    pub fn active_count(&self) -> usize {
        self.connections.len()
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn generate_token() -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine as _;
    let raw: [u8; 24] = rand::random();
    URL_SAFE_NO_PAD.encode(raw)
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Identity hint: which AI's watches the connection serves.
    pub ai_id: Option<String>,
}

/// Upgrade handler for `GET /stream`.
pub async fn stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Response {
    let ai_hint = query.ai_id.map(AiId::new);
    ws.on_upgrade(move |socket| handle_socket(socket, state, ai_hint))
}

async fn handle_socket(socket: WebSocket, state: AppState, ai_hint: Option<AiId>) {
    let conn = state.streams.issue(ai_hint);
    let conn_id = conn.conn_id;
    info!(conn_id = %conn_id, "stream connection opened");

    let (mut sender, mut receiver) = socket.split();
    let hello = json!({
        "type": "auth_required",
        "conn_id": conn_id,
        "token": conn.auth_token,
    });
    if send_json(&mut sender, &hello).await.is_err() {
        state.streams.close(conn_id);
        return;
    }

    let mut bus = state.kernel.event_bus().subscribe();
    let quota = Quota::per_second(NonZeroU32::new(STREAM_RATE_PER_SECOND).expect("nonzero rate"));
    let limiter: ConnLimiter = RateLimiter::direct(quota);

    let mut subscriptions: Vec<StreamSubscription> = Vec::new();
    let mut authenticated: Option<AiId> = None;
    let mut idle_check = tokio::time::interval(Duration::from_secs(30));
    let mut last_activity = tokio::time::Instant::now();

    loop {
        tokio::select! {
            frame = receiver.next() => {
                let Some(Ok(frame)) = frame else {
                    debug!(conn_id = %conn_id, "client closed stream");
                    break;
                };
                last_activity = tokio::time::Instant::now();
                match frame {
                    Message::Text(text) => {
                        let Ok(incoming) = serde_json::from_str::<JsonValue>(&text) else {
                            let _ = send_json(&mut sender, &json!({"type": "error", "error": "invalid_frame"})).await;
                            continue;
                        };
                        match incoming["type"].as_str() {
                            Some("auth") => {
                                let token = incoming["token"].as_str().unwrap_or_default();
                                match state.streams.authenticate(conn_id, token, Utc::now()) {
                                    Some(ai_id) => {
                                        subscriptions = sync_watches(&state, conn_id, &ai_id).await;
                                        authenticated = Some(ai_id.clone());
                                        state.streams.touch(conn_id);
                                        let connected = json!({
                                            "type": "connected",
                                            "conn_id": conn_id,
                                            "ai_id": ai_id,
                                            "watches_synced": subscriptions.len(),
                                        });
                                        if send_json(&mut sender, &connected).await.is_err() {
                                            break;
                                        }
                                    }
                                    None => {
                                        let _ = send_json(&mut sender, &json!({"type": "error", "error": "auth_failed"})).await;
                                        break;
                                    }
                                }
                            }
                            Some("ping") => {
                                state.streams.touch(conn_id);
                                if send_json(&mut sender, &json!({"type": "pong"})).await.is_err() {
                                    break;
                                }
                            }
                            Some("ack") => {
                                debug!(conn_id = %conn_id, event = ?incoming["event_id"], "ack");
                            }
                            _ => {
                                let _ = send_json(&mut sender, &json!({"type": "error", "error": "unknown_frame"})).await;
                            }
                        }
                    }
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {}
                }
            }

            event = bus.recv() => {
                match event {
                    Ok(wire) => {
                        if authenticated.is_none() {
                            continue;
                        }
                        let Some(frame) = event_frame(&wire.event, &subscriptions) else {
                            continue;
                        };
                        if limiter.check().is_err() {
                            debug!(conn_id = %conn_id, "per-connection rate limit, dropping event");
                            continue;
                        }
                        if send_json(&mut sender, &frame).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(conn_id = %conn_id, skipped, "stream lagged");
                        let _ = send_json(&mut sender, &json!({"type": "error", "error": "lagged"})).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            _ = idle_check.tick() => {
                if last_activity.elapsed() > Duration::from_secs(STREAM_IDLE_TIMEOUT_SECS) {
                    info!(conn_id = %conn_id, "evicting idle stream connection");
                    let _ = send_json(&mut sender, &json!({"type": "error", "error": "idle_timeout"})).await;
                    break;
                }
            }
        }
    }

    state.streams.close(conn_id);
    info!(conn_id = %conn_id, "stream connection closed");
}

/// Copy the AI's durable watches into per-connection subscriptions.
async fn sync_watches(state: &AppState, conn_id: Uuid, ai_id: &AiId) -> Vec<StreamSubscription> {
    let teambook = state.kernel.current_teambook();
    match state.kernel.storage().watches_for_ai(&teambook, ai_id).await {
        Ok(watches) => watches
            .into_iter()
            .map(|watch| StreamSubscription {
                conn_id,
                item_type: watch.item_type,
                item_id: watch.item_id,
                event_types: watch.event_types,
            })
            .collect(),
        Err(err) => {
            warn!(error = %err, "watch sync failed");
            Vec::new()
        }
    }
}

/// Build an event frame when the domain event matches a subscription.
fn event_frame(event: &DomainEvent, subscriptions: &[StreamSubscription]) -> Option<JsonValue> {
    let DomainEvent::WatchEvent {
        event_id,
        item_type,
        item_id,
        event_type,
        actor,
        summary,
        created,
    } = event
    else {
        return None;
    };
    let matched = subscriptions
        .iter()
        .any(|sub| sub.matches(*item_type, item_id, event_type));
    if !matched {
        return None;
    }
    Some(json!({
        "type": "event",
        "event_id": event_id,
        "item_type": item_type,
        "item_id": item_id,
        "event_type": event_type,
        "summary": summary,
        "actor_ai_id": actor,
        "created_at": created.to_rfc3339(),
    }))
}

async fn send_json(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    value: &JsonValue,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(value).map_err(axum::Error::new)?;
    sender.send(Message::Text(text)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use teambook_core::ItemType;

    #[test]
    fn test_token_single_use() {
        let registry = StreamRegistry::new();
        let conn = registry.issue(Some(AiId::from("alpha-001")));
        let now = Utc::now();
        assert!(registry
            .authenticate(conn.conn_id, &conn.auth_token, now)
            .is_some());
        // Second use fails: the token was consumed.
        assert!(registry
            .authenticate(conn.conn_id, &conn.auth_token, now)
            .is_none());
    }

    #[test]
    fn test_token_expiry() {
        let registry = StreamRegistry::new();
        let conn = registry.issue(Some(AiId::from("alpha-001")));
        let later = Utc::now() + chrono::Duration::hours(STREAM_TOKEN_TTL_HOURS + 1);
        assert!(registry
            .authenticate(conn.conn_id, &conn.auth_token, later)
            .is_none());
    }

    #[test]
    fn test_wrong_token_rejected() {
        let registry = StreamRegistry::new();
        let conn = registry.issue(Some(AiId::from("alpha-001")));
        assert!(registry
            .authenticate(conn.conn_id, "forged", Utc::now())
            .is_none());
    }

    #[test]
    fn test_event_frame_respects_subscription_filters() {
        let sub = StreamSubscription {
            conn_id: Uuid::new_v4(),
            item_type: ItemType::Note,
            item_id: "42".to_string(),
            event_types: vec!["edited".to_string()],
        };
        let event = DomainEvent::WatchEvent {
            event_id: teambook_core::EventId::from(1),
            item_type: ItemType::Note,
            item_id: "42".to_string(),
            event_type: "edited".to_string(),
            actor: AiId::from("beta-002"),
            summary: Some("new".to_string()),
            created: Utc::now(),
        };
        let frame = event_frame(&event, std::slice::from_ref(&sub)).expect("frame");
        assert_eq!(frame["type"], "event");
        assert_eq!(frame["actor_ai_id"], "beta-002");

        let other = DomainEvent::WatchEvent {
            event_id: teambook_core::EventId::from(2),
            item_type: ItemType::Note,
            item_id: "42".to_string(),
            event_type: "deleted".to_string(),
            actor: AiId::from("beta-002"),
            summary: None,
            created: Utc::now(),
        };
        assert!(event_frame(&other, std::slice::from_ref(&sub)).is_none());
    }
}
