//! Watches, events, delivery tracking, and streaming connections.

use crate::{AiId, EventId, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// ITEM TYPES
// ============================================================================

/// The kinds of items a watch can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Note,
    Lock,
    Channel,
    Evolution,
    Contribution,
    Task,
    Message,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Note => "note",
            ItemType::Lock => "lock",
            ItemType::Channel => "channel",
            ItemType::Evolution => "evolution",
            ItemType::Contribution => "contribution",
            ItemType::Task => "task",
            ItemType::Message => "message",
        }
    }

    pub const ALL: [ItemType; 7] = [
        ItemType::Note,
        ItemType::Lock,
        ItemType::Channel,
        ItemType::Evolution,
        ItemType::Contribution,
        ItemType::Task,
        ItemType::Message,
    ];
}

impl FromStr for ItemType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "note" => Ok(ItemType::Note),
            "lock" => Ok(ItemType::Lock),
            "channel" => Ok(ItemType::Channel),
            "evolution" => Ok(ItemType::Evolution),
            "contribution" => Ok(ItemType::Contribution),
            "task" => Ok(ItemType::Task),
            "message" => Ok(ItemType::Message),
            other => Err(format!("invalid item type: {}", other)),
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// WATCHES
// ============================================================================

/// A standing interest in events about a specific item.
/// `(ai_id, item_type, item_id)` is unique; re-watching updates the filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Watch {
    pub ai_id: AiId,
    pub item_type: ItemType,
    /// Item key: numeric id rendered as a string, or a channel name.
    pub item_id: String,
    /// Event types to deliver; empty means all.
    #[serde(default)]
    pub event_types: Vec<String>,
    pub last_activity: Timestamp,
    pub teambook: String,
}

impl Watch {
    /// Whether an event of `event_type` passes this watch's filter.
    pub fn matches(&self, event_type: &str) -> bool {
        self.event_types.is_empty() || self.event_types.iter().any(|t| t == event_type)
    }
}

// ============================================================================
// EVENTS
// ============================================================================

/// A record of a state change on a watched item. Retained 7 days.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub id: EventId,
    pub item_type: ItemType,
    pub item_id: String,
    pub event_type: String,
    pub actor: AiId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub created: Timestamp,
    pub expires_at: Timestamp,
    pub teambook: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Per-watcher delivery row, populated at emit time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDelivery {
    pub event_id: EventId,
    pub ai_id: AiId,
    pub seen: bool,
}

// ============================================================================
// STREAMING
// ============================================================================

/// Lifecycle of a long-lived streaming connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    /// Connected, token issued, not yet authenticated.
    Pending,
    Authenticated,
    Closed,
}

/// Server-side state for one streaming client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConnection {
    pub conn_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_id: Option<AiId>,
    /// Single-use token, consumed by the auth frame. Expires in 24h.
    pub auth_token: String,
    pub connected_at: Timestamp,
    pub last_ping: Timestamp,
    pub status: StreamStatus,
}

/// Per-connection replica of a watch, synced at authentication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSubscription {
    pub conn_id: Uuid,
    pub item_type: ItemType,
    pub item_id: String,
    #[serde(default)]
    pub event_types: Vec<String>,
}

impl StreamSubscription {
    pub fn matches(&self, item_type: ItemType, item_id: &str, event_type: &str) -> bool {
        self.item_type == item_type
            && self.item_id == item_id
            && (self.event_types.is_empty() || self.event_types.iter().any(|t| t == event_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_watch_filter() {
        let watch = Watch {
            ai_id: AiId::from("alpha-001"),
            item_type: ItemType::Note,
            item_id: "42".to_string(),
            event_types: vec!["edited".to_string()],
            last_activity: Utc::now(),
            teambook: "demo".to_string(),
        };
        assert!(watch.matches("edited"));
        assert!(!watch.matches("deleted"));

        let open = Watch {
            event_types: vec![],
            ..watch
        };
        assert!(open.matches("deleted"));
    }

    #[test]
    fn test_item_type_roundtrip() {
        for ty in ItemType::ALL {
            assert_eq!(ty.as_str().parse::<ItemType>().unwrap(), ty);
        }
    }

    #[test]
    fn test_subscription_match() {
        let sub = StreamSubscription {
            conn_id: Uuid::new_v4(),
            item_type: ItemType::Task,
            item_id: "1".to_string(),
            event_types: vec![],
        };
        assert!(sub.matches(ItemType::Task, "1", "claimed"));
        assert!(!sub.matches(ItemType::Task, "2", "claimed"));
        assert!(!sub.matches(ItemType::Note, "1", "claimed"));
    }
}
