//! Filter types for read paths.

use crate::{AiId, MessageId, SessionId, Timestamp};
use serde::{Deserialize, Serialize};

/// Ordering mode for `read_notes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadMode {
    /// pinned desc, pagerank desc, created desc.
    Important,
    /// created desc.
    #[default]
    Recent,
}

/// Filter for note reads. All fields combine with AND.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NoteFilter {
    pub teambook: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<AiId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<AiId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pinned_only: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    /// Substring match over content and summary (LIKE or FTS).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default)]
    pub mode: ReadMode,
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

impl NoteFilter {
    pub fn recent(teambook: impl Into<String>, limit: usize) -> Self {
        Self {
            teambook: teambook.into(),
            limit,
            ..Default::default()
        }
    }
}

/// Filter for message reads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageFilter {
    pub teambook: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_ai: Option<AiId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_ai: Option<AiId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<Timestamp>,
    #[serde(default)]
    pub unread_only: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<MessageId>,
    pub limit: usize,
}
