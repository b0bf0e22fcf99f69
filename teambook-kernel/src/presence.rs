//! Presence verbs: who is here, set status.

use crate::{Kernel, KernelResponse};
use chrono::Utc;
use serde_json::{json, Value as JsonValue};
use teambook_core::*;
use teambook_events::DomainEvent;
use teambook_storage::StorageBackend;

impl Kernel {
    /// All AIs active within the window, ordered by recency.
    pub async fn who_is_here(&self, minutes: i64) -> TeambookResult<KernelResponse> {
        let teambook = self.current_teambook();
        let window = minutes.clamp(1, 24 * 60);
        let now = Utc::now();
        let presences = self
            .store
            .active_presences(&teambook, now - chrono::Duration::minutes(window))
            .await?;
        let rendered: Vec<JsonValue> = presences
            .iter()
            .map(|presence| {
                json!({
                    "ai_id": presence.ai_id,
                    "status": presence.status(now),
                    "minutes_ago": presence.minutes_ago(now),
                    "last_operation": presence.last_operation,
                    "status_message": presence.status_message,
                })
            })
            .collect();
        Ok(KernelResponse::ok(
            format!("{} active", rendered.len()),
            json!({"here": rendered, "window_minutes": window}),
        ))
    }

    /// Set an explicit status message alongside the passive tracking.
    pub async fn set_status(&self, message: Option<String>) -> TeambookResult<KernelResponse> {
        let teambook = self.current_teambook();
        let presence = Presence {
            ai_id: self.ai_id().clone(),
            last_seen: Utc::now(),
            last_operation: "set_status".to_string(),
            status_message: message.clone(),
            teambook,
        };
        self.store.upsert_presence(&presence).await?;
        self.publish_event(DomainEvent::PresenceChanged {
            ai_id: self.ai_id().clone(),
            status_message: message.clone(),
        })
        .await;
        Ok(KernelResponse::ok(
            "status set",
            json!({"status_message": message}),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_kernel;

    #[tokio::test]
    async fn test_presence_appears_after_activity() {
        let (_dir, kernel) = test_kernel().await;
        kernel
            .set_status(Some("reviewing auth".to_string()))
            .await
            .expect("status");

        let here = kernel.who_is_here(15).await.expect("who");
        let list = here.data.unwrap()["here"].as_array().unwrap().clone();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["ai_id"].as_str().unwrap(), kernel.ai_id().as_str());
        assert_eq!(list[0]["status"], "online");
        assert_eq!(list[0]["status_message"], "reviewing auth");
    }

    #[tokio::test]
    async fn test_status_message_survives_passive_updates() {
        let (_dir, kernel) = test_kernel().await;
        kernel
            .set_status(Some("deep work".to_string()))
            .await
            .expect("status");
        // Passive presence updates carry no message; the stored one stays.
        kernel.touch_presence("write_note").await;

        let here = kernel.who_is_here(15).await.expect("who");
        let list = here.data.unwrap()["here"].as_array().unwrap().clone();
        assert_eq!(list[0]["status_message"], "deep work");
    }
}
