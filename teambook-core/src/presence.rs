//! Passive presence tracking.

use crate::{AiId, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Derived liveness status from last observed activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    /// Active within the last 2 minutes.
    Online,
    /// Active within the last 15 minutes.
    Away,
    Offline,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Away => "away",
            PresenceStatus::Offline => "offline",
        }
    }

    /// Classify from elapsed time since last activity.
    pub fn from_idle(idle: chrono::Duration) -> Self {
        if idle < chrono::Duration::minutes(2) {
            PresenceStatus::Online
        } else if idle < chrono::Duration::minutes(15) {
            PresenceStatus::Away
        } else {
            PresenceStatus::Offline
        }
    }
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-AI activity record, updated passively on every kernel call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Presence {
    pub ai_id: AiId,
    pub last_seen: Timestamp,
    pub last_operation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    pub teambook: String,
}

impl Presence {
    pub fn status(&self, now: Timestamp) -> PresenceStatus {
        PresenceStatus::from_idle(now - self.last_seen)
    }

    pub fn minutes_ago(&self, now: Timestamp) -> i64 {
        ((now - self.last_seen).num_seconds() / 60).max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[test]
    fn test_status_thresholds() {
        assert_eq!(
            PresenceStatus::from_idle(Duration::seconds(30)),
            PresenceStatus::Online
        );
        assert_eq!(
            PresenceStatus::from_idle(Duration::minutes(5)),
            PresenceStatus::Away
        );
        assert_eq!(
            PresenceStatus::from_idle(Duration::minutes(20)),
            PresenceStatus::Offline
        );
    }

    #[test]
    fn test_minutes_ago_floor() {
        let presence = Presence {
            ai_id: AiId::from("alpha-001"),
            last_seen: Utc::now() + Duration::seconds(5),
            last_operation: "write_note".to_string(),
            status_message: None,
            teambook: "demo".to_string(),
        };
        // Clock skew never yields negative minutes.
        assert_eq!(presence.minutes_ago(Utc::now()), 0);
    }
}
