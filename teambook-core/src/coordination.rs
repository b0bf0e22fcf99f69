//! Distributed locks, priority task queue, and coordination events.

use crate::{tamper_hash, AiId, TaskId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// LOCKS
// ============================================================================

/// A distributed mutual-exclusion lock on a named resource.
///
/// `resource_id` is the primary key within a teambook. Expired locks are
/// treated as absent by acquisition and swept at query time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lock {
    pub resource_id: String,
    pub held_by: AiId,
    pub acquired_at: Timestamp,
    pub expires_at: Timestamp,
    pub teambook: String,
}

impl Lock {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }

    pub fn remaining_secs(&self, now: Timestamp) -> i64 {
        (self.expires_at - now).num_seconds().max(0)
    }
}

/// Outcome of an atomic acquisition attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LockAttempt {
    /// The caller now holds the lock.
    Acquired(Lock),
    /// Another live holder owns the resource.
    Held { held_by: AiId, expires_at: Timestamp },
}

// ============================================================================
// TASKS
// ============================================================================

/// Task queue lifecycle. A task transitions `pending -> claimed -> completed`
/// exactly once in each direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Claimed,
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Claimed => "claimed",
            TaskStatus::Completed => "completed",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "claimed" => Ok(TaskStatus::Claimed),
            "completed" => Ok(TaskStatus::Completed),
            other => Err(format!("invalid task status: {}", other)),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A queued unit of work with priority 0-9 (9 = most urgent).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub task: String,
    pub priority: u8,
    pub status: TaskStatus,
    pub author: AiId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<AiId>,
    pub created: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    pub teambook: String,
    #[serde(default)]
    pub metadata: JsonValue,
    pub tamper_hash: String,
}

impl Task {
    /// Semantic fields covered by the task tamper hash. Recomputed on every
    /// state change.
    pub fn semantic_fields(&self) -> JsonValue {
        json!({
            "task": self.task,
            "priority": self.priority,
            "status": self.status.as_str(),
            "author": self.author,
            "claimed_by": self.claimed_by,
            "result": self.result,
            "teambook": self.teambook,
            "metadata": self.metadata,
        })
    }

    pub fn compute_tamper_hash(&self) -> String {
        tamper_hash(&self.semantic_fields())
    }
}

// ============================================================================
// COORDINATION EVENTS
// ============================================================================

/// Immutable log entry for cross-AI coordination milestones: detangle
/// initiated/resolved, ambient checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinationEvent {
    pub id: i64,
    pub event_type: String,
    pub ai_id: AiId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub created: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonValue>,
    pub teambook: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::RecordIdType;
    use chrono::{Duration, Utc};

    #[test]
    fn test_lock_expiry() {
        let now = Utc::now();
        let lock = Lock {
            resource_id: "auth.rs".to_string(),
            held_by: AiId::from("alpha-001"),
            acquired_at: now,
            expires_at: now + Duration::seconds(30),
            teambook: "demo".to_string(),
        };
        assert!(!lock.is_expired(now));
        assert!(lock.is_expired(now + Duration::seconds(31)));
        assert_eq!(lock.remaining_secs(now + Duration::seconds(10)), 20);
    }

    #[test]
    fn test_task_hash_tracks_state_changes() {
        let mut task = Task {
            id: TaskId::new(1),
            task: "ship docs".to_string(),
            priority: 7,
            status: TaskStatus::Pending,
            author: AiId::from("alpha-001"),
            claimed_by: None,
            created: Utc::now(),
            claimed_at: None,
            completed_at: None,
            result: None,
            teambook: "demo".to_string(),
            metadata: json!({}),
            tamper_hash: String::new(),
        };
        let pending_hash = task.compute_tamper_hash();

        task.status = TaskStatus::Claimed;
        task.claimed_by = Some(AiId::from("beta-002"));
        assert_ne!(task.compute_tamper_hash(), pending_hash);
    }
}
