//! Channel broadcast and direct-message records.

use crate::{AiId, Envelope, MessageId, Timestamp};
use serde::{Deserialize, Serialize};

/// Channel sentinel under which direct messages are stored.
pub const DM_CHANNEL: &str = "_dm";

/// A broadcast or direct message. Broadcasts have `to_ai = None`; DMs are
/// stored under the [`DM_CHANNEL`] sentinel. Messages are invisible after
/// `expires_at` and deleted opportunistically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub channel: String,
    pub from_ai: AiId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_ai: Option<AiId>,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    pub created: Timestamp,
    #[serde(default)]
    pub read: bool,
    pub expires_at: Timestamp,
    pub teambook: String,
    /// Security envelope over {ai_id, channel, recipient, content hash,
    /// expires_at, teambook}.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub envelope: Option<Envelope>,
}

impl Message {
    pub fn is_dm(&self) -> bool {
        self.channel == DM_CHANNEL
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::RecordIdType;
    use chrono::{Duration, Utc};

    #[test]
    fn test_expiry_boundary() {
        let now = Utc::now();
        let msg = Message {
            id: MessageId::new(1),
            channel: "general".to_string(),
            from_ai: AiId::from("alpha-001"),
            to_ai: None,
            content: "hello".to_string(),
            summary: None,
            reply_to: None,
            created: now,
            read: false,
            expires_at: now + Duration::hours(1),
            teambook: "demo".to_string(),
            envelope: None,
        };
        assert!(!msg.is_expired(now + Duration::minutes(59)));
        assert!(msg.is_expired(now + Duration::minutes(61)));
        assert!(!msg.is_dm());
    }
}
