//! Domain event types broadcast on the bus.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use teambook_core::{AiId, EventId, ItemType, MessageId, NoteId, TaskId, Timestamp};

/// Domain events emitted by the kernel when state changes.
///
/// Mutation operations trigger exactly one event after the backing write is
/// committed. The same enum feeds in-process handlers, the watch/event
/// delivery tables, and the streaming surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DomainEvent {
    // ========================================================================
    // NOTE EVENTS
    // ========================================================================
    /// A note was written.
    NoteCreated {
        note_id: NoteId,
        author: AiId,
        note_type: String,
        summary: Option<String>,
    },

    /// A note's semantic fields changed.
    NoteEdited {
        note_id: NoteId,
        actor: AiId,
        summary: Option<String>,
    },

    /// A note was deleted.
    NoteDeleted { note_id: NoteId, actor: AiId },

    // ========================================================================
    // MESSAGE EVENTS
    // ========================================================================
    /// A broadcast landed on a channel.
    Broadcast {
        msg_id: MessageId,
        channel: String,
        from_ai: AiId,
        summary: Option<String>,
    },

    /// A direct message was sent.
    DirectMessage {
        msg_id: MessageId,
        from_ai: AiId,
        to_ai: AiId,
    },

    // ========================================================================
    // COORDINATION EVENTS
    // ========================================================================
    LockAcquired {
        resource_id: String,
        held_by: AiId,
        expires_at: Timestamp,
    },

    LockReleased {
        resource_id: String,
        released_by: AiId,
    },

    TaskQueued {
        task_id: TaskId,
        priority: u8,
        author: AiId,
    },

    TaskClaimed {
        task_id: TaskId,
        claimed_by: AiId,
    },

    TaskCompleted {
        task_id: TaskId,
        completed_by: AiId,
    },

    // ========================================================================
    // EVOLUTION EVENTS
    // ========================================================================
    EvolutionStarted {
        evo_id: NoteId,
        author: AiId,
        goal_summary: Option<String>,
    },

    ContributionAdded {
        evo_id: NoteId,
        contrib_id: teambook_core::ContributionId,
        author: AiId,
    },

    SynthesisWritten {
        evo_id: NoteId,
        output_path: String,
        author: AiId,
    },

    // ========================================================================
    // WATCH DELIVERY
    // ========================================================================
    /// A durable watch event was recorded; streaming clients with a matching
    /// subscription receive it immediately.
    WatchEvent {
        event_id: EventId,
        item_type: ItemType,
        item_id: String,
        event_type: String,
        actor: AiId,
        summary: Option<String>,
        created: Timestamp,
    },

    // ========================================================================
    // PRESENCE
    // ========================================================================
    PresenceChanged {
        ai_id: AiId,
        status_message: Option<String>,
    },
}

impl DomainEvent {
    /// Event type tag for logging and handler registration.
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::NoteCreated { .. } => "note_created",
            DomainEvent::NoteEdited { .. } => "note_edited",
            DomainEvent::NoteDeleted { .. } => "note_deleted",
            DomainEvent::Broadcast { .. } => "broadcast",
            DomainEvent::DirectMessage { .. } => "direct_message",
            DomainEvent::LockAcquired { .. } => "lock_acquired",
            DomainEvent::LockReleased { .. } => "lock_released",
            DomainEvent::TaskQueued { .. } => "task_queued",
            DomainEvent::TaskClaimed { .. } => "task_claimed",
            DomainEvent::TaskCompleted { .. } => "task_completed",
            DomainEvent::EvolutionStarted { .. } => "evolution_started",
            DomainEvent::ContributionAdded { .. } => "contribution_added",
            DomainEvent::SynthesisWritten { .. } => "synthesis_written",
            DomainEvent::WatchEvent { .. } => "watch_event",
            DomainEvent::PresenceChanged { .. } => "presence_changed",
        }
    }
}

/// The JSON frame published to remote pub/sub channels: event type tag,
/// emission timestamp, and payload. Mirrors what in-process subscribers see
/// so pull and push consumers observe identical data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    pub teambook: String,
    pub timestamp: Timestamp,
    #[serde(flatten)]
    pub event: DomainEvent,
}

impl WireEvent {
    pub fn new(teambook: impl Into<String>, event: DomainEvent) -> Self {
        Self {
            teambook: teambook.into(),
            timestamp: chrono::Utc::now(),
            event,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_names() {
        let event = DomainEvent::Broadcast {
            msg_id: MessageId::from(1),
            channel: "general".to_string(),
            from_ai: AiId::from("alpha-001"),
            summary: None,
        };
        assert_eq!(event.event_type(), "broadcast");
    }

    #[test]
    fn test_event_serialization_roundtrip() {
        let event = DomainEvent::TaskClaimed {
            task_id: TaskId::from(7),
            claimed_by: AiId::from("beta-002"),
        };
        let json = serde_json::to_string(&event).expect("serialize");
        let back: DomainEvent = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, event);
    }

    #[test]
    fn test_wire_event_tag_flattened() {
        let wire = WireEvent::new(
            "demo",
            DomainEvent::LockReleased {
                resource_id: "auth.rs".to_string(),
                released_by: AiId::from("alpha-001"),
            },
        );
        let value = wire.to_json();
        assert_eq!(value["type"], "LockReleased");
        assert_eq!(value["teambook"], "demo");
    }
}
