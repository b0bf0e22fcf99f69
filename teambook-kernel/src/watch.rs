//! Watches, durable events, and delivery.

use crate::validate::parse_since;
use crate::{Kernel, KernelResponse};
use chrono::Utc;
use rand::Rng;
use serde_json::{json, Value as JsonValue};
use teambook_core::*;
use teambook_events::DomainEvent;
use teambook_storage::{NewEvent, StorageBackend};
use tracing::debug;

impl Kernel {
    /// Register (or refresh) a watch. Idempotent: re-watching the same item
    /// updates the event-type filter instead of adding a row.
    pub async fn watch(
        &self,
        item_type: ItemType,
        item_id: &str,
        event_types: Vec<String>,
    ) -> TeambookResult<KernelResponse> {
        let teambook = self.current_teambook();
        let count = self.store.count_watches(&teambook, self.ai_id()).await?;
        if count >= MAX_WATCHES_PER_AI as u64 {
            return Err(TeambookError::new(
                ErrorCode::WatchLimit,
                format!("max {} watches per AI", MAX_WATCHES_PER_AI),
            ));
        }
        let watch = Watch {
            ai_id: self.ai_id().clone(),
            item_type,
            item_id: item_id.to_string(),
            event_types,
            last_activity: Utc::now(),
            teambook: teambook.clone(),
        };
        let created = self.store.upsert_watch(&watch).await?;
        Ok(KernelResponse::ok(
            if created { "watching" } else { "watch refreshed" },
            json!({"item_type": item_type, "item_id": item_id, "created": created}),
        ))
    }

    pub async fn unwatch(&self, item_type: ItemType, item_id: &str) -> TeambookResult<KernelResponse> {
        let teambook = self.current_teambook();
        let removed = self
            .store
            .delete_watch(&teambook, self.ai_id(), item_type, item_id)
            .await?;
        if !removed {
            return Err(TeambookError::new(
                ErrorCode::InvalidItem,
                format!("not watching {} {}", item_type, item_id),
            ));
        }
        Ok(KernelResponse::ok(
            "unwatched",
            json!({"item_type": item_type, "item_id": item_id}),
        ))
    }

    /// Pull delivered events. `since` accepts a unix timestamp or a human
    /// window (`5m`, `1h`, `2d`); the default window is 24h.
    pub async fn get_events(
        &self,
        since: Option<&str>,
        limit: usize,
        mark_seen: bool,
    ) -> TeambookResult<KernelResponse> {
        self.limiter.admit_event_query(self.ai_id())?;
        let teambook = self.current_teambook();
        let since = parse_since(since, chrono::Duration::hours(24))?;
        let limit = if limit == 0 { 20 } else { limit.min(200) };
        let events = self
            .store
            .events_for(&teambook, self.ai_id(), since, limit, mark_seen)
            .await?;
        let rendered: Vec<JsonValue> = events
            .iter()
            .map(|event| {
                json!({
                    "event_id": event.id,
                    "item_type": event.item_type,
                    "item_id": event.item_id,
                    "type": event.event_type,
                    "actor_ai_id": event.actor,
                    "summary": event.summary,
                    "created": event.created.to_rfc3339(),
                })
            })
            .collect();
        Ok(KernelResponse::ok(
            format!("{} events", rendered.len()),
            json!({"events": rendered}),
        ))
    }

    /// Emit an event for a state change: one durable delivery row per
    /// matching watcher, a bus publish for streaming clients, and an
    /// opportunistic retention sweep. Called internally by mutating verbs;
    /// failures are logged, never propagated into the primary operation.
    pub(crate) async fn emit(
        &self,
        item_type: ItemType,
        item_id: &str,
        event_type: &str,
        summary: Option<&str>,
        metadata: Option<JsonValue>,
    ) {
        let teambook = self.current_teambook();
        let watchers = match self
            .store
            .watchers_for_item(&teambook, item_type, item_id)
            .await
        {
            Ok(watchers) => watchers,
            Err(err) => {
                debug!(error = %err, "watcher lookup failed");
                return;
            }
        };
        let recipients: Vec<AiId> = watchers
            .iter()
            .filter(|watch| watch.matches(event_type))
            .map(|watch| watch.ai_id.clone())
            .collect();
        if recipients.is_empty() {
            return;
        }

        let now = Utc::now();
        let event = NewEvent {
            item_type,
            item_id: item_id.to_string(),
            event_type: event_type.to_string(),
            actor: self.ai_id().clone(),
            summary: summary.map(String::from),
            created: now,
            expires_at: now + chrono::Duration::days(EVENT_RETENTION_DAYS),
            teambook: teambook.clone(),
            metadata,
        };
        match self.store.insert_event(event, &recipients).await {
            Ok(event_id) => {
                self.publish_event(DomainEvent::WatchEvent {
                    event_id,
                    item_type,
                    item_id: item_id.to_string(),
                    event_type: event_type.to_string(),
                    actor: self.ai_id().clone(),
                    summary: summary.map(String::from),
                    created: now,
                })
                .await;
            }
            Err(err) => debug!(error = %err, "event insert failed"),
        }

        // Opportunistic retention sweep, ~10% of emits.
        if rand::thread_rng().gen_ratio(1, CLEANUP_SAMPLE) {
            if let Err(err) = self.store.purge_expired_events(&teambook).await {
                debug!(error = %err, "event cleanup failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notes::WriteNoteArgs;
    use crate::testutil::test_kernel;

    #[tokio::test]
    async fn test_watch_idempotent() {
        let (_dir, kernel) = test_kernel().await;
        let first = kernel
            .watch(ItemType::Note, "42", vec![])
            .await
            .expect("watch");
        assert_eq!(first.data.unwrap()["created"], true);
        let second = kernel
            .watch(ItemType::Note, "42", vec!["edited".to_string()])
            .await
            .expect("rewatch");
        assert_eq!(second.data.unwrap()["created"], false);
    }

    #[tokio::test]
    async fn test_watch_limit() {
        let (_dir, kernel) = test_kernel().await;
        for i in 0..MAX_WATCHES_PER_AI {
            kernel
                .watch(ItemType::Note, &i.to_string(), vec![])
                .await
                .expect("watch under cap");
        }
        let err = kernel
            .watch(ItemType::Note, "overflow", vec![])
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::WatchLimit);
    }

    #[tokio::test]
    async fn test_edit_event_delivered_with_filter() {
        let (_dir, kernel) = test_kernel().await;
        let written = kernel
            .write_note(WriteNoteArgs {
                content: "watched note".to_string(),
                ..Default::default()
            })
            .await
            .expect("write");
        let id = written.data.unwrap()["note_id"].as_i64().unwrap().to_string();

        kernel
            .watch(ItemType::Note, &id, vec!["edited".to_string()])
            .await
            .expect("watch");

        // A deletion-type filter means "created" events never deliver, so
        // only the edit should land.
        kernel
            .update_note(
                &id,
                NotePatch {
                    summary: Some(Some("new".to_string())),
                    ..Default::default()
                },
            )
            .await
            .expect("update");

        let events = kernel
            .get_events(Some("1h"), 20, true)
            .await
            .expect("events");
        let events = events.data.unwrap()["events"].as_array().unwrap().clone();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "edited");
        assert_eq!(
            events[0]["actor_ai_id"].as_str().unwrap(),
            kernel.ai_id().as_str()
        );
    }

    #[tokio::test]
    async fn test_unwatch_missing_errors() {
        let (_dir, kernel) = test_kernel().await;
        let err = kernel.unwatch(ItemType::Task, "9").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidItem);
    }
}
