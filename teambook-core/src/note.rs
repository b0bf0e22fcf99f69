//! Note, edge, entity, fact, and session records.

use crate::{tamper_hash, AiId, NoteId, SessionId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// REPRESENTATION POLICY
// ============================================================================

/// Controls whether stored content may be compressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepresentationPolicy {
    /// Content codec decides (compress if large).
    #[default]
    Default,
    /// Content is stored byte-for-byte as written.
    Verbatim,
}

impl RepresentationPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepresentationPolicy::Default => "default",
            RepresentationPolicy::Verbatim => "verbatim",
        }
    }
}

impl FromStr for RepresentationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "default" | "" => Ok(RepresentationPolicy::Default),
            "verbatim" => Ok(RepresentationPolicy::Verbatim),
            other => Err(format!("invalid representation policy: {}", other)),
        }
    }
}

impl fmt::Display for RepresentationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// NOTE
// ============================================================================

/// Durable text record with graph edges and a tamper hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: NoteId,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub pinned: bool,
    pub author: AiId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<AiId>,
    /// Free-form type: general, dm, task, evolution, ...
    #[serde(rename = "type")]
    pub note_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<NoteId>,
    pub teambook: String,
    pub created: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub linked_items: Vec<String>,
    #[serde(default)]
    pub pagerank: f64,
    #[serde(default)]
    pub has_vector: bool,
    #[serde(default)]
    pub representation_policy: RepresentationPolicy,
    #[serde(default)]
    pub metadata: JsonValue,
    pub tamper_hash: String,
}

impl Note {
    /// The semantic fields covered by the tamper hash, in canonical form.
    ///
    /// Server-supplied fields (`id`, `created`, `pagerank`, `has_vector`)
    /// are deliberately excluded so the hash survives recomputation from a
    /// returned record.
    pub fn semantic_fields(&self) -> JsonValue {
        note_semantic_fields(
            &self.content,
            self.summary.as_deref(),
            &self.tags,
            self.pinned,
            self.owner.as_ref(),
            &self.teambook,
            &self.linked_items,
            self.representation_policy,
            &self.metadata,
            &self.note_type,
            self.parent_id,
        )
    }

    /// Recompute the tamper hash from the current semantic fields.
    pub fn compute_tamper_hash(&self) -> String {
        tamper_hash(&self.semantic_fields())
    }
}

/// Canonical semantic-field projection shared by write and verify paths.
#[allow(clippy::too_many_arguments)]
pub fn note_semantic_fields(
    content: &str,
    summary: Option<&str>,
    tags: &[String],
    pinned: bool,
    owner: Option<&AiId>,
    teambook: &str,
    linked_items: &[String],
    policy: RepresentationPolicy,
    metadata: &JsonValue,
    note_type: &str,
    parent_id: Option<NoteId>,
) -> JsonValue {
    json!({
        "content": content,
        "summary": summary,
        "tags": tags,
        "pinned": pinned,
        "owner": owner,
        "teambook": teambook,
        "linked_items": linked_items,
        "representation_policy": policy.as_str(),
        "metadata": metadata,
        "type": note_type,
        "parent_id": parent_id,
    })
}

/// Fields accepted by `update_note`. Absent fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotePatch {
    pub content: Option<String>,
    pub summary: Option<Option<String>>,
    pub tags: Option<Vec<String>>,
    pub pinned: Option<bool>,
    pub owner: Option<Option<AiId>>,
    pub linked_items: Option<Vec<String>>,
    pub metadata: Option<JsonValue>,
}

impl NotePatch {
    pub fn is_empty(&self) -> bool {
        self.content.is_none()
            && self.summary.is_none()
            && self.tags.is_none()
            && self.pinned.is_none()
            && self.owner.is_none()
            && self.linked_items.is_none()
            && self.metadata.is_none()
    }
}

// ============================================================================
// EDGES
// ============================================================================

/// Typed directed relationship between two notes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    Temporal,
    Reference,
    ReferencedBy,
    Session,
    Entity,
}

impl EdgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeType::Temporal => "temporal",
            EdgeType::Reference => "reference",
            EdgeType::ReferencedBy => "referenced_by",
            EdgeType::Session => "session",
            EdgeType::Entity => "entity",
        }
    }

    /// Temporal, session, and entity edges are written in both directions;
    /// reference/referenced_by form an asymmetric pair.
    pub fn is_symmetric(&self) -> bool {
        matches!(self, EdgeType::Temporal | EdgeType::Session | EdgeType::Entity)
    }
}

impl FromStr for EdgeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "temporal" => Ok(EdgeType::Temporal),
            "reference" => Ok(EdgeType::Reference),
            "referenced_by" => Ok(EdgeType::ReferencedBy),
            "session" => Ok(EdgeType::Session),
            "entity" => Ok(EdgeType::Entity),
            other => Err(format!("invalid edge type: {}", other)),
        }
    }
}

impl fmt::Display for EdgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Graph edge with temporal validity. `(from_id, to_id, edge_type)` is the
/// primary key; closing an edge (setting `valid_to`) enables point-in-time
/// queries without deleting history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from_id: NoteId,
    pub to_id: NoteId,
    pub edge_type: EdgeType,
    pub weight: f64,
    pub created: Timestamp,
    pub valid_from: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_to: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_note_id: Option<NoteId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonValue>,
}

// ============================================================================
// ENTITIES AND FACTS
// ============================================================================

/// How an entity token was first recognized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Known tool name from the built-in list.
    Tool,
    /// Previously extracted entity seen again.
    Known,
    /// `@name` mention.
    Mention,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Tool => "tool",
            EntityKind::Known => "known",
            EntityKind::Mention => "mention",
        }
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tool" => Ok(EntityKind::Tool),
            "known" => Ok(EntityKind::Known),
            "mention" => Ok(EntityKind::Mention),
            other => Err(format!("invalid entity kind: {}", other)),
        }
    }
}

/// Auto-extracted noun-like token with a unique name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: crate::EntityId,
    pub name: String,
    pub kind: EntityKind,
    pub first_seen: Timestamp,
    pub last_seen: Timestamp,
    pub mention_count: i64,
}

/// Structured subject-relation-object triple with temporal validity.
///
/// New facts for an invalidating relation close prior open facts for the
/// same (entity, relation) pair by setting their `valid_to`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityFact {
    pub id: crate::FactId,
    pub entity_id: crate::EntityId,
    pub relation: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_entity_id: Option<crate::EntityId>,
    pub valid_from: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_to: Option<Timestamp>,
    pub source_note_id: NoteId,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonValue>,
}

// ============================================================================
// SESSIONS
// ============================================================================

/// Contiguous authoring window. A note joins the previous note's session
/// when written within the session gap; otherwise a new session starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub started: Timestamp,
    pub ended: Timestamp,
    pub note_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::RecordIdType;
    use chrono::Utc;

    fn sample_note() -> Note {
        Note {
            id: NoteId::new(1),
            content: "hello".to_string(),
            summary: None,
            tags: vec!["a".to_string()],
            pinned: false,
            author: AiId::from("alpha-001"),
            owner: None,
            note_type: "general".to_string(),
            parent_id: None,
            teambook: "demo".to_string(),
            created: Utc::now(),
            session_id: None,
            linked_items: vec![],
            pagerank: 0.0,
            has_vector: false,
            representation_policy: RepresentationPolicy::Default,
            metadata: serde_json::json!({}),
            tamper_hash: String::new(),
        }
    }

    #[test]
    fn test_tamper_hash_ignores_server_fields() {
        let mut note = sample_note();
        note.tamper_hash = note.compute_tamper_hash();
        let expected = note.tamper_hash.clone();

        note.id = NoteId::new(999);
        note.pagerank = 0.7;
        note.has_vector = true;
        assert_eq!(note.compute_tamper_hash(), expected);
    }

    #[test]
    fn test_tamper_hash_covers_semantic_fields() {
        let note = sample_note();
        let base = note.compute_tamper_hash();

        let mut pinned = note.clone();
        pinned.pinned = true;
        assert_ne!(pinned.compute_tamper_hash(), base);

        let mut retagged = note.clone();
        retagged.tags = vec!["b".to_string()];
        assert_ne!(retagged.compute_tamper_hash(), base);
    }

    #[test]
    fn test_edge_symmetry_classification() {
        assert!(EdgeType::Temporal.is_symmetric());
        assert!(EdgeType::Session.is_symmetric());
        assert!(EdgeType::Entity.is_symmetric());
        assert!(!EdgeType::Reference.is_symmetric());
        assert!(!EdgeType::ReferencedBy.is_symmetric());
    }

    #[test]
    fn test_representation_policy_parse() {
        assert_eq!(
            "verbatim".parse::<RepresentationPolicy>().unwrap(),
            RepresentationPolicy::Verbatim
        );
        assert!("gzip".parse::<RepresentationPolicy>().is_err());
    }
}
