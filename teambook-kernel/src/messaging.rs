//! Channel broadcasts and direct messages.

use crate::validate::{clamp_text, clean_text, simple_summary};
use crate::{Kernel, KernelResponse};
use chrono::Utc;
use rand::Rng;
use serde_json::{json, Value as JsonValue};
use teambook_core::*;
use teambook_events::DomainEvent;
use teambook_storage::{NewMessage, StorageBackend};
use tracing::debug;

/// Options accepted by `send_message`.
#[derive(Debug, Clone, Default)]
pub struct SendMessageArgs {
    pub content: String,
    pub to: Option<AiId>,
    pub channel: Option<String>,
    pub reply_to: Option<MessageId>,
    pub summary: Option<String>,
    pub ttl_hours: Option<i64>,
}

impl Kernel {
    pub async fn send_message(&self, args: SendMessageArgs) -> TeambookResult<KernelResponse> {
        let teambook = self.current_teambook();
        self.limiter.admit_message(self.ai_id())?;

        let cleaned = clean_text(&args.content);
        if cleaned.is_empty() {
            return Err(TeambookError::new(ErrorCode::EmptyMessage, "message is empty"));
        }
        let (content, truncated) = clamp_text(&cleaned, MAX_CONTENT_CHARS);

        let is_dm = args.to.is_some();
        let channel = if is_dm {
            DM_CHANNEL.to_string()
        } else {
            let channel = args.channel.unwrap_or_else(|| "general".to_string());
            if !is_valid_channel(&channel, false) {
                return Err(TeambookError::new(
                    ErrorCode::InvalidChannel,
                    format!("invalid channel '{}'", channel),
                ));
            }
            channel
        };
        if let Some(to) = &args.to {
            if to == self.ai_id() {
                return Err(TeambookError::new(
                    ErrorCode::CannotDmSelf,
                    "recipient is the sender",
                ));
            }
        }

        let summary = args
            .summary
            .map(|s| clamp_text(&clean_text(&s), MAX_MESSAGE_SUMMARY_CHARS).0)
            .unwrap_or_else(|| simple_summary(&content, 80));

        let ttl = args
            .ttl_hours
            .unwrap_or(MESSAGE_TTL_DEFAULT_HOURS)
            .clamp(MESSAGE_TTL_MIN_HOURS, MESSAGE_TTL_MAX_HOURS);
        let now = Utc::now();
        let expires_at = now + chrono::Duration::hours(ttl);

        // The envelope signs routing + a content digest, not the content
        // itself, so verification works on compact listings too.
        let envelope_payload = json!({
            "ai_id": self.ai_id(),
            "channel": channel,
            "recipient": args.to,
            "content_hash": sha3_hex(content.as_bytes()),
            "expires_at": expires_at.to_rfc3339(),
            "teambook": teambook,
        });
        let envelope = self
            .identity()
            .build_envelope(&envelope_payload, "teambook.message");

        let msg_id = self
            .store
            .insert_message(NewMessage {
                channel: channel.clone(),
                from_ai: self.ai_id().clone(),
                to_ai: args.to.clone(),
                content,
                summary: Some(summary.clone()),
                reply_to: args.reply_to,
                created: now,
                expires_at,
                teambook: teambook.clone(),
                envelope: Some(envelope),
            })
            .await?;

        // Post-commit fan-out; publish failures never fail the send.
        match &args.to {
            Some(to) => {
                self.publish_event(DomainEvent::DirectMessage {
                    msg_id,
                    from_ai: self.ai_id().clone(),
                    to_ai: to.clone(),
                })
                .await;
                self.emit(ItemType::Message, &msg_id.to_string(), "dm", Some(&summary), None)
                    .await;
            }
            None => {
                self.publish_event(DomainEvent::Broadcast {
                    msg_id,
                    channel: channel.clone(),
                    from_ai: self.ai_id().clone(),
                    summary: Some(summary.clone()),
                })
                .await;
                self.emit(
                    ItemType::Channel,
                    &channel,
                    "broadcast",
                    Some(&summary),
                    None,
                )
                .await;
            }
        }

        // Opportunistic expiry sweep on roughly one write in ten.
        if rand::thread_rng().gen_ratio(1, CLEANUP_SAMPLE) {
            if let Err(err) = self.store.purge_expired_messages(&teambook).await {
                debug!(error = %err, "message cleanup failed");
            }
        }

        let mut data = json!({
            "msg_id": msg_id,
            "channel": channel,
            "to": args.to.as_ref().map(|t| t.as_str().to_string()).unwrap_or_else(|| "all".to_string()),
            "expires_at": expires_at.to_rfc3339(),
        });
        if truncated {
            data["warning"] = json!("content truncated at 5000 chars");
        }
        let quota = self.limiter.message_quota_remaining(self.ai_id());
        if quota < 10 {
            data["quota_remaining"] = json!(quota);
        }
        Ok(KernelResponse::ok(format!("message {}", msg_id), data))
    }

    /// Read channel messages. `compact` skips read-marking; otherwise the
    /// returned messages are marked read for the caller.
    pub async fn get_messages(
        &self,
        channel: Option<String>,
        since: Option<&str>,
        unread_only: bool,
        thread_id: Option<MessageId>,
        compact: bool,
        limit: usize,
    ) -> TeambookResult<KernelResponse> {
        let teambook = self.current_teambook();
        let channel = channel.unwrap_or_else(|| "general".to_string());
        if !is_valid_channel(&channel, false) {
            return Err(TeambookError::new(
                ErrorCode::InvalidChannel,
                format!("invalid channel '{}'", channel),
            ));
        }

        let since = match since {
            Some(raw) => Some(crate::validate::parse_since(Some(raw), chrono::Duration::hours(24))?),
            None => None,
        };
        let filter = MessageFilter {
            teambook: teambook.clone(),
            channel: Some(channel.clone()),
            // DM reads scope to the caller as recipient.
            to_ai: (channel == DM_CHANNEL).then(|| self.ai_id().clone()),
            since,
            unread_only,
            thread_id,
            limit: if limit == 0 { 20 } else { limit },
            ..Default::default()
        };
        let messages = self.store.read_messages(&filter).await?;

        if !compact && !messages.is_empty() {
            let ids: Vec<MessageId> = messages.iter().map(|m| m.id).collect();
            self.store.mark_messages_read(&teambook, &ids).await?;
        }

        let rendered: Vec<JsonValue> = messages
            .iter()
            .map(|msg| {
                json!({
                    "msg_id": msg.id,
                    "from": msg.from_ai,
                    "to": msg.to_ai.as_ref().map(|t| t.as_str().to_string()).unwrap_or_else(|| "all".to_string()),
                    "channel": msg.channel,
                    "summary": msg.summary,
                    "content": if compact { JsonValue::Null } else { json!(msg.content) },
                    "reply_to": msg.reply_to,
                    "created": msg.created.to_rfc3339(),
                    "unread": !msg.read,
                    "signed": msg.envelope.as_ref().map(|e| e.status.as_str()),
                })
            })
            .collect();
        Ok(KernelResponse::ok(
            format!("{} messages", rendered.len()),
            json!({"channel": channel, "messages": rendered}),
        ))
    }

    /// DMs addressed to the caller.
    pub async fn read_dms(&self, unread_only: bool, limit: usize) -> TeambookResult<KernelResponse> {
        self.get_messages(
            Some(DM_CHANNEL.to_string()),
            None,
            unread_only,
            None,
            false,
            limit,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_kernel;

    fn broadcast(content: &str) -> SendMessageArgs {
        SendMessageArgs {
            content: content.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_broadcast_then_read() {
        let (_dir, kernel) = test_kernel().await;
        let sent = kernel.send_message(broadcast("hello")).await.expect("send");
        let data = sent.data.unwrap();
        assert_eq!(data["to"], "all");
        assert_eq!(data["channel"], "general");

        let read = kernel
            .get_messages(Some("general".to_string()), None, false, None, true, 10)
            .await
            .expect("read");
        let messages = read.data.unwrap()["messages"].as_array().unwrap().clone();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["summary"], "hello");
        assert_eq!(messages[0]["unread"], true);
        assert_eq!(messages[0]["signed"], "signed");
    }

    #[tokio::test]
    async fn test_invalid_channel_rejected() {
        let (_dir, kernel) = test_kernel().await;
        let err = kernel
            .send_message(SendMessageArgs {
                content: "x".to_string(),
                channel: Some("Bad Channel".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidChannel);
    }

    #[tokio::test]
    async fn test_cannot_dm_self() {
        let (_dir, kernel) = test_kernel().await;
        let err = kernel
            .send_message(SendMessageArgs {
                content: "hi me".to_string(),
                to: Some(kernel.ai_id().clone()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::CannotDmSelf);
    }

    #[tokio::test]
    async fn test_ttl_clamped() {
        let (_dir, kernel) = test_kernel().await;
        let sent = kernel
            .send_message(SendMessageArgs {
                content: "short lived".to_string(),
                ttl_hours: Some(10_000),
                ..Default::default()
            })
            .await
            .expect("send");
        let expires = sent.data.unwrap()["expires_at"].as_str().unwrap().to_string();
        let expires = chrono::DateTime::parse_from_rfc3339(&expires).unwrap();
        let hours = (expires.with_timezone(&Utc) - Utc::now()).num_hours();
        assert!(hours <= MESSAGE_TTL_MAX_HOURS);
        assert!(hours >= MESSAGE_TTL_MAX_HOURS - 1);
    }

    #[tokio::test]
    async fn test_auto_summary_first_sentence() {
        let (_dir, kernel) = test_kernel().await;
        kernel
            .send_message(broadcast("First sentence. Second sentence."))
            .await
            .expect("send");
        let read = kernel
            .get_messages(Some("general".to_string()), None, false, None, true, 10)
            .await
            .expect("read");
        let messages = read.data.unwrap()["messages"].as_array().unwrap().clone();
        assert_eq!(messages[0]["summary"], "First sentence.");
    }

    #[tokio::test]
    async fn test_read_marks_messages_when_not_compact() {
        let (_dir, kernel) = test_kernel().await;
        kernel.send_message(broadcast("mark me")).await.expect("send");
        kernel
            .get_messages(Some("general".to_string()), None, false, None, false, 10)
            .await
            .expect("full read");
        let second = kernel
            .get_messages(Some("general".to_string()), None, false, None, true, 10)
            .await
            .expect("reread");
        let messages = second.data.unwrap()["messages"].as_array().unwrap().clone();
        assert_eq!(messages[0]["unread"], false);
    }

    #[tokio::test]
    async fn test_broadcast_event_published() {
        let (_dir, kernel) = test_kernel().await;
        let mut rx = kernel.event_bus().subscribe();
        kernel.send_message(broadcast("ping")).await.expect("send");
        let mut saw = false;
        while let Ok(wire) = rx.try_recv() {
            if wire.event.event_type() == "broadcast" {
                saw = true;
            }
        }
        assert!(saw);
    }
}
