//! The storage adapter contract.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use teambook_core::{
    AiId, BackendKind, Contribution, ContributionConflict, ContributionId, CoordinationEvent,
    Edge, EntityFact, EntityId, EntityKind, EventId, FactId, Lock, LockAttempt, Message,
    MessageFilter, MessageId, Note, NoteFilter, NoteId, NotePatch, Presence, Ranking,
    RepresentationPolicy, SessionId, StorageResult, SynthesisStrategy, Task, TaskId, Timestamp,
    VaultEntryInfo, VaultItem, Vote, Watch, WatchEvent,
};
use tokio::sync::mpsc;

// ============================================================================
// WRITE-SIDE RECORD SHAPES
// ============================================================================

/// Fields the kernel supplies when inserting a note; the backend allocates
/// `id` under its uniqueness guarantee and returns it.
#[derive(Debug, Clone)]
pub struct NewNote {
    pub content: String,
    pub summary: Option<String>,
    pub tags: Vec<String>,
    pub pinned: bool,
    pub author: AiId,
    pub owner: Option<AiId>,
    pub note_type: String,
    pub parent_id: Option<NoteId>,
    pub teambook: String,
    pub created: Timestamp,
    pub session_id: Option<SessionId>,
    pub linked_items: Vec<String>,
    pub representation_policy: RepresentationPolicy,
    pub metadata: JsonValue,
    pub tamper_hash: String,
    pub has_vector: bool,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub channel: String,
    pub from_ai: AiId,
    pub to_ai: Option<AiId>,
    pub content: String,
    pub summary: Option<String>,
    pub reply_to: Option<MessageId>,
    pub created: Timestamp,
    pub expires_at: Timestamp,
    pub teambook: String,
    pub envelope: Option<teambook_core::Envelope>,
}

#[derive(Debug, Clone)]
pub struct NewTask {
    pub task: String,
    pub priority: u8,
    pub author: AiId,
    pub created: Timestamp,
    pub teambook: String,
    pub metadata: JsonValue,
    pub tamper_hash: String,
}

#[derive(Debug, Clone)]
pub struct NewFact {
    pub entity_id: EntityId,
    pub relation: String,
    pub value: String,
    pub target_entity_id: Option<EntityId>,
    pub valid_from: Timestamp,
    pub source_note_id: NoteId,
    pub confidence: f64,
    pub metadata: Option<JsonValue>,
}

#[derive(Debug, Clone)]
pub struct NewEvent {
    pub item_type: teambook_core::ItemType,
    pub item_id: String,
    pub event_type: String,
    pub actor: AiId,
    pub summary: Option<String>,
    pub created: Timestamp,
    pub expires_at: Timestamp,
    pub teambook: String,
    pub metadata: Option<JsonValue>,
}

#[derive(Debug, Clone)]
pub struct NewContribution {
    pub evolution_id: NoteId,
    pub author: AiId,
    pub content: String,
    pub approach: Option<String>,
    pub created: Timestamp,
}

#[derive(Debug, Clone)]
pub struct NewSynthesis {
    pub evolution_id: NoteId,
    pub strategy: SynthesisStrategy,
    pub output_path: String,
    pub contribution_count: i64,
    pub author: AiId,
    pub created: Timestamp,
    pub teambook: String,
}

#[derive(Debug, Clone)]
pub struct NewCoordinationEvent {
    pub event_type: String,
    pub ai_id: AiId,
    pub task_id: Option<TaskId>,
    pub summary: Option<String>,
    pub created: Timestamp,
    pub metadata: Option<JsonValue>,
    pub teambook: String,
}

// ============================================================================
// READ-SIDE SHAPES
// ============================================================================

/// A fact row matched by a recall query token.
#[derive(Debug, Clone)]
pub struct FactCandidate {
    pub note_id: NoteId,
    pub entity_id: EntityId,
    pub relation: String,
    pub value: String,
    pub confidence: f64,
}

/// Latest-note metadata consulted by session detection.
#[derive(Debug, Clone, Copy)]
pub struct LastNoteMeta {
    pub id: NoteId,
    pub created: Timestamp,
    pub session_id: Option<SessionId>,
}

/// Aggregate counts for `get_status`.
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    pub notes: u64,
    pub edges: u64,
    pub entities: u64,
    pub sessions: u64,
    pub messages: u64,
    pub tasks: u64,
    pub operations: u64,
}

/// Outcome of a lock release.
#[derive(Debug, Clone, PartialEq)]
pub enum ReleaseOutcome {
    Released,
    NotLocked,
    NotHolder { held_by: AiId },
}

/// Outcome of a task completion attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum CompleteOutcome {
    Completed(Task),
    NotFound,
    NotClaimer,
    AlreadyCompleted,
}

/// Remote pub/sub payload stream. `None` from [`StorageBackend::subscribe`]
/// means the backend has no cross-process pub/sub (embedded, postgres);
/// in-process fan-out still runs through the event bus.
pub type RemoteEventStream = mpsc::Receiver<String>;

// ============================================================================
// THE ADAPTER TRAIT
// ============================================================================

/// Uniform interface over the embedded sqlite, remote PostgreSQL, and Redis
/// backends.
///
/// Guarantees every implementation upholds:
/// - record-level atomic writes;
/// - `read_notes` ordering per [`teambook_core::ReadMode`];
/// - `update_note` recomputes the tamper hash from the merged state;
/// - lock acquisition and task claim are race-free across processes.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Cheap liveness check used by backend selection and health surfaces.
    async fn ping(&self) -> StorageResult<()>;

    // ------------------------------------------------------------------
    // Notes
    // ------------------------------------------------------------------
    async fn insert_note(&self, note: NewNote) -> StorageResult<NoteId>;
    async fn get_note(&self, teambook: &str, id: NoteId) -> StorageResult<Option<Note>>;
    async fn read_notes(&self, filter: &NoteFilter) -> StorageResult<Vec<Note>>;
    async fn update_note(
        &self,
        teambook: &str,
        id: NoteId,
        patch: NotePatch,
    ) -> StorageResult<Option<Note>>;
    async fn delete_note(&self, teambook: &str, id: NoteId) -> StorageResult<bool>;
    async fn note_count(&self, teambook: &str) -> StorageResult<u64>;
    /// Metadata of the most recent note, for session detection.
    async fn last_note_meta(&self, teambook: &str) -> StorageResult<Option<LastNoteMeta>>;
    /// Filter `ids` down to those that exist.
    async fn existing_note_ids(&self, teambook: &str, ids: &[NoteId]) -> StorageResult<Vec<NoteId>>;
    /// Recent note ids, newest first, for temporal edges.
    async fn recent_note_ids(
        &self,
        teambook: &str,
        before: NoteId,
        limit: usize,
    ) -> StorageResult<Vec<NoteId>>;

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------
    async fn create_session(&self, teambook: &str, started: Timestamp) -> StorageResult<SessionId>;
    async fn touch_session(
        &self,
        teambook: &str,
        id: SessionId,
        ended: Timestamp,
    ) -> StorageResult<()>;
    async fn session_note_ids(
        &self,
        teambook: &str,
        id: SessionId,
        exclude: NoteId,
    ) -> StorageResult<Vec<NoteId>>;

    // ------------------------------------------------------------------
    // Edges and PageRank
    // ------------------------------------------------------------------
    async fn upsert_edge(&self, teambook: &str, edge: &Edge) -> StorageResult<()>;
    async fn edges_for(
        &self,
        teambook: &str,
        note: NoteId,
        reverse: bool,
    ) -> StorageResult<Vec<Edge>>;
    /// `(from, to, weight)` for all currently open edges.
    async fn adjacency(&self, teambook: &str) -> StorageResult<Vec<(i64, i64, f64)>>;
    async fn store_pagerank(&self, teambook: &str, scores: &[(NoteId, f64)]) -> StorageResult<()>;

    // ------------------------------------------------------------------
    // Entities and facts
    // ------------------------------------------------------------------
    async fn upsert_entity(
        &self,
        teambook: &str,
        name: &str,
        kind: EntityKind,
        now: Timestamp,
    ) -> StorageResult<EntityId>;
    async fn link_entity_note(
        &self,
        teambook: &str,
        entity: EntityId,
        note: NoteId,
    ) -> StorageResult<()>;
    async fn entity_note_ids(&self, teambook: &str, entity: EntityId) -> StorageResult<Vec<NoteId>>;
    async fn known_entity_names(&self, teambook: &str) -> StorageResult<Vec<String>>;
    async fn find_open_fact(
        &self,
        teambook: &str,
        entity: EntityId,
        relation: &str,
        value: &str,
    ) -> StorageResult<Option<EntityFact>>;
    async fn refresh_fact(
        &self,
        teambook: &str,
        id: FactId,
        valid_from: Timestamp,
        source_note_id: NoteId,
        confidence: f64,
    ) -> StorageResult<()>;
    /// Close open facts for `(entity, relation)` whose value differs.
    async fn close_open_facts(
        &self,
        teambook: &str,
        entity: EntityId,
        relation: &str,
        except_value: &str,
        now: Timestamp,
    ) -> StorageResult<u64>;
    async fn insert_fact(&self, teambook: &str, fact: NewFact) -> StorageResult<FactId>;
    async fn fact_candidates(
        &self,
        teambook: &str,
        token: &str,
        limit: usize,
    ) -> StorageResult<Vec<FactCandidate>>;

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------
    async fn insert_message(&self, msg: NewMessage) -> StorageResult<MessageId>;
    async fn read_messages(&self, filter: &MessageFilter) -> StorageResult<Vec<Message>>;
    async fn mark_messages_read(&self, teambook: &str, ids: &[MessageId]) -> StorageResult<u64>;
    async fn purge_expired_messages(&self, teambook: &str) -> StorageResult<u64>;

    // ------------------------------------------------------------------
    // Locks
    // ------------------------------------------------------------------
    /// Atomic acquire: succeeds only if the row is absent or expired.
    async fn try_acquire_lock(
        &self,
        teambook: &str,
        resource_id: &str,
        holder: &AiId,
        ttl_secs: i64,
    ) -> StorageResult<LockAttempt>;
    async fn release_lock(
        &self,
        teambook: &str,
        resource_id: &str,
        holder: &AiId,
    ) -> StorageResult<ReleaseOutcome>;
    /// Raise expiry for the current holder only; returns the updated lock.
    async fn extend_lock(
        &self,
        teambook: &str,
        resource_id: &str,
        holder: &AiId,
        new_expiry: Timestamp,
    ) -> StorageResult<Option<Lock>>;
    async fn locks_held_by(&self, teambook: &str, holder: &AiId) -> StorageResult<u64>;
    async fn sweep_expired_locks(&self, teambook: &str) -> StorageResult<u64>;

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------
    async fn insert_task(&self, task: NewTask) -> StorageResult<TaskId>;
    async fn pending_task_count(&self, teambook: &str) -> StorageResult<u64>;
    /// Atomic claim of the best pending task (locked read).
    async fn claim_next_task(
        &self,
        teambook: &str,
        claimer: &AiId,
        prefer_priority: bool,
        now: Timestamp,
    ) -> StorageResult<Option<Task>>;
    async fn get_task(&self, teambook: &str, id: TaskId) -> StorageResult<Option<Task>>;
    async fn complete_task(
        &self,
        teambook: &str,
        id: TaskId,
        caller: &AiId,
        result: Option<String>,
        now: Timestamp,
    ) -> StorageResult<CompleteOutcome>;

    // ------------------------------------------------------------------
    // Watches and events
    // ------------------------------------------------------------------
    /// Returns true when a new watch row was created (idempotent re-watch
    /// updates the filter in place).
    async fn upsert_watch(&self, watch: &Watch) -> StorageResult<bool>;
    async fn delete_watch(
        &self,
        teambook: &str,
        ai_id: &AiId,
        item_type: teambook_core::ItemType,
        item_id: &str,
    ) -> StorageResult<bool>;
    async fn count_watches(&self, teambook: &str, ai_id: &AiId) -> StorageResult<u64>;
    /// All of one AI's watches, for streaming subscription sync.
    async fn watches_for_ai(&self, teambook: &str, ai_id: &AiId) -> StorageResult<Vec<Watch>>;
    async fn watchers_for_item(
        &self,
        teambook: &str,
        item_type: teambook_core::ItemType,
        item_id: &str,
    ) -> StorageResult<Vec<Watch>>;
    /// Insert the event and one delivery row per recipient.
    async fn insert_event(&self, event: NewEvent, recipients: &[AiId]) -> StorageResult<EventId>;
    async fn events_for(
        &self,
        teambook: &str,
        ai_id: &AiId,
        since: Timestamp,
        limit: usize,
        mark_seen: bool,
    ) -> StorageResult<Vec<WatchEvent>>;
    async fn purge_expired_events(&self, teambook: &str) -> StorageResult<u64>;

    // ------------------------------------------------------------------
    // Presence
    // ------------------------------------------------------------------
    async fn upsert_presence(&self, presence: &Presence) -> StorageResult<()>;
    async fn active_presences(
        &self,
        teambook: &str,
        since: Timestamp,
    ) -> StorageResult<Vec<Presence>>;
    async fn prune_presence(&self, teambook: &str, before: Timestamp) -> StorageResult<u64>;

    // ------------------------------------------------------------------
    // Vault
    // ------------------------------------------------------------------
    async fn vault_set(&self, teambook: &str, item: &VaultItem) -> StorageResult<()>;
    async fn vault_get(&self, teambook: &str, key: &str) -> StorageResult<Option<VaultItem>>;
    async fn vault_delete(&self, teambook: &str, key: &str) -> StorageResult<bool>;
    async fn vault_list(&self, teambook: &str) -> StorageResult<Vec<VaultEntryInfo>>;

    // ------------------------------------------------------------------
    // Evolution
    // ------------------------------------------------------------------
    async fn insert_contribution(
        &self,
        teambook: &str,
        contribution: NewContribution,
    ) -> StorageResult<ContributionId>;
    async fn contributions_for(
        &self,
        teambook: &str,
        evolution_id: NoteId,
    ) -> StorageResult<Vec<Contribution>>;
    async fn get_contribution(
        &self,
        teambook: &str,
        id: ContributionId,
    ) -> StorageResult<Option<Contribution>>;
    async fn count_contributions_by(
        &self,
        teambook: &str,
        evolution_id: NoteId,
        author: &AiId,
    ) -> StorageResult<u64>;
    /// Upsert a ranking, recompute and persist the contribution's score
    /// cache, and return `(avg_score, rank_count)`.
    async fn upsert_ranking(&self, teambook: &str, ranking: &Ranking)
        -> StorageResult<(f64, i64)>;
    async fn get_vote(
        &self,
        teambook: &str,
        evolution_id: NoteId,
        voter: &AiId,
    ) -> StorageResult<Option<Vote>>;
    async fn upsert_vote(&self, teambook: &str, vote: &Vote) -> StorageResult<()>;
    async fn insert_synthesis(&self, record: NewSynthesis) -> StorageResult<i64>;
    async fn synthesis_count_since(&self, teambook: &str, since: Timestamp)
        -> StorageResult<u64>;
    async fn insert_conflicts(
        &self,
        teambook: &str,
        conflicts: &[ContributionConflict],
    ) -> StorageResult<()>;

    // ------------------------------------------------------------------
    // Coordination events and registry
    // ------------------------------------------------------------------
    async fn insert_coordination_event(&self, event: NewCoordinationEvent) -> StorageResult<i64>;
    async fn coordination_events(
        &self,
        teambook: &str,
        since: Timestamp,
        limit: usize,
    ) -> StorageResult<Vec<CoordinationEvent>>;
    async fn touch_teambook(&self, name: &str, creator: &AiId) -> StorageResult<()>;
    async fn list_teambooks(&self) -> StorageResult<Vec<(String, Timestamp, Option<Timestamp>)>>;

    // ------------------------------------------------------------------
    // Stats
    // ------------------------------------------------------------------
    async fn record_operation(
        &self,
        teambook: &str,
        operation: &str,
        dur_ms: Option<i64>,
        author: &AiId,
    ) -> StorageResult<()>;
    async fn get_stats(&self, teambook: &str) -> StorageResult<StorageStats>;

    // ------------------------------------------------------------------
    // Pub/sub
    // ------------------------------------------------------------------
    /// Publish a payload to a remote pub/sub channel. Backends without one
    /// return Ok and rely on the in-process bus.
    async fn publish(&self, channel: &str, payload: &str) -> StorageResult<()>;
    /// Subscribe to a remote pub/sub channel. `None` when the backend has
    /// no cross-process fan-out.
    async fn subscribe(&self, channel: &str) -> StorageResult<Option<RemoteEventStream>>;
}
