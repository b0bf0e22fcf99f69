//! Note graph: write path, edges, sessions, facts, PageRank, recall.

use crate::validate::{clamp_text, clean_text};
use crate::{Kernel, KernelResponse};
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value as JsonValue};
use std::collections::{HashMap, HashSet, VecDeque};
use teambook_core::*;
use teambook_events::DomainEvent;
use teambook_storage::{NewFact, NewNote, StorageBackend};
use tracing::{debug, warn};

// ============================================================================
// EXTRACTION TABLES
// ============================================================================

/// Tool names recognized as entities without a prior sighting.
const KNOWN_TOOLS: &[&str] = &[
    "teambook", "redis", "postgres", "sqlite", "git", "docker", "vault",
];

static MENTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@([A-Za-z][A-Za-z0-9_-]{1,40})").expect("mention regex"));

static REFERENCE_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [r"note\s+(\d+)", r"\bn(\d+)\b", r"#(\d+)", r"\[(\d+)\]"]
        .iter()
        .map(|p| Regex::new(p).expect("reference regex"))
        .collect()
});

struct FactPattern {
    relation: &'static str,
    patterns: &'static [&'static str],
    invalidate: bool,
    confidence: f64,
}

/// Deterministic relation patterns. Invalidating relations close prior open
/// facts for the same (entity, relation) pair.
const FACT_PATTERNS: &[FactPattern] = &[
    FactPattern {
        relation: "resides_in",
        patterns: &[
            r"(?i)(?P<subject>[A-Z][\w\s]+?)\s+(?:lives in|lives at|is based in)\s+(?P<object>[A-Z][\w\s]+)",
            r"(?i)(?P<subject>[A-Z][\w\s]+?)\s+moved to\s+(?P<object>[A-Z][\w\s]+)",
        ],
        invalidate: true,
        confidence: 0.85,
    },
    FactPattern {
        relation: "works_at",
        patterns: &[
            r"(?i)(?P<subject>[A-Z][\w\s]+?)\s+(?:works at|works for|joined)\s+(?P<object>[A-Z][\w\s&]+)",
        ],
        invalidate: true,
        confidence: 0.8,
    },
    FactPattern {
        relation: "located_in",
        patterns: &[
            r"(?i)(?P<subject>[A-Z][\w\s]+?)\s+(?:is located in|is in|operates in)\s+(?P<object>[A-Z][\w\s]+)",
        ],
        invalidate: false,
        confidence: 0.75,
    },
];

fn extract_references(content: &str) -> Vec<NoteId> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for re in REFERENCE_RES.iter() {
        for cap in re.captures_iter(content) {
            if let Some(id) = cap.get(1).and_then(|m| m.as_str().parse::<i64>().ok()) {
                if seen.insert(id) {
                    out.push(NoteId::new(id));
                }
            }
        }
    }
    out
}

fn normalize_entity_key(name: &str) -> String {
    clean_text(name).to_lowercase()
}

// ============================================================================
// WRITE PATH
// ============================================================================

/// Options accepted by `write_note`.
#[derive(Debug, Clone, Default)]
pub struct WriteNoteArgs {
    pub content: String,
    pub summary: Option<String>,
    pub tags: Vec<String>,
    pub pinned: bool,
    pub owner: Option<AiId>,
    pub note_type: Option<String>,
    pub parent_id: Option<NoteId>,
    pub linked_items: Vec<String>,
    pub representation_policy: RepresentationPolicy,
    pub metadata: Option<JsonValue>,
}

impl Kernel {
    pub async fn write_note(&self, args: WriteNoteArgs) -> TeambookResult<KernelResponse> {
        let teambook = self.current_teambook();
        let cleaned = clean_text(&args.content);
        if cleaned.is_empty() {
            return Err(TeambookError::new(ErrorCode::EmptyMessage, "note content is empty"));
        }
        let (content, truncated) = clamp_text(&cleaned, MAX_CONTENT_CHARS);
        let summary = args
            .summary
            .map(|s| clamp_text(&clean_text(&s), MAX_NOTE_SUMMARY_CHARS).0);

        let now = Utc::now();
        let session_id = self.detect_or_create_session(&teambook, now).await;

        let policy = args.representation_policy;
        let stored_content = self.codec.encode(&content, policy);
        let stored_summary = summary.as_ref().map(|s| self.codec.encode(s, policy));
        let metadata = args.metadata.unwrap_or_else(|| json!({}));
        let note_type = args.note_type.unwrap_or_else(|| "general".to_string());

        let embedding = self.embed(&content);
        let tamper = tamper_hash(&note_semantic_fields(
            &stored_content,
            stored_summary.as_deref(),
            &args.tags,
            args.pinned,
            args.owner.as_ref(),
            &teambook,
            &args.linked_items,
            policy,
            &metadata,
            &note_type,
            args.parent_id,
        ));

        let note_id = self
            .store
            .insert_note(NewNote {
                content: stored_content,
                summary: stored_summary,
                tags: args.tags.clone(),
                pinned: args.pinned,
                author: self.ai_id().clone(),
                owner: args.owner,
                note_type: note_type.clone(),
                parent_id: args.parent_id,
                teambook: teambook.clone(),
                created: now,
                session_id,
                linked_items: args.linked_items,
                representation_policy: policy,
                metadata,
                tamper_hash: tamper,
                has_vector: embedding.is_some(),
            })
            .await?;

        // Graph enrichment is best-effort: a failed edge never loses the
        // note itself.
        if let Err(err) = self
            .build_edges(&teambook, note_id, &content, session_id, now)
            .await
        {
            warn!(error = %err, note_id = %note_id, "edge generation failed");
        }

        if let Some(vector) = embedding {
            self.with_vectors(&teambook, |index| index.upsert(note_id, vector));
        }

        self.note_written(note_id);
        self.write_cache
            .record(note_id, &content, summary.as_deref(), &teambook, self.ai_id());
        self.mark_pagerank_dirty();
        self.recompute_pagerank_if_due(&teambook).await;

        self.publish_event(DomainEvent::NoteCreated {
            note_id,
            author: self.ai_id().clone(),
            note_type,
            summary: summary.clone(),
        })
        .await;
        self.emit(
            ItemType::Note,
            &note_id.to_string(),
            "created",
            summary.as_deref(),
            None,
        )
        .await;

        let mut data = json!({"note_id": note_id, "session_id": session_id});
        if truncated {
            data["warning"] = json!("content truncated at 5000 chars");
        }
        Ok(KernelResponse::ok(format!("note {}", note_id), data))
    }

    pub async fn get_note(&self, raw_id: &str) -> TeambookResult<KernelResponse> {
        let teambook = self.current_teambook();
        let id = self.resolve_note_ref(raw_id)?;
        let Some(note) = self.store.get_note(&teambook, id).await? else {
            return Err(TeambookError::new(
                ErrorCode::NoteNotFound,
                format!("note {} not found", id),
            ));
        };
        let edges = self.store.edges_for(&teambook, id, false).await.unwrap_or_default();
        Ok(KernelResponse::ok(
            format!("note {}", id),
            json!({"note": self.render_note(note), "edges": edges.len()}),
        ))
    }

    pub async fn read_notes(&self, mut filter: NoteFilter) -> TeambookResult<KernelResponse> {
        filter.teambook = self.current_teambook();
        if filter.limit == 0 {
            filter.limit = 20;
        }
        let notes = self.store.read_notes(&filter).await?;
        let rendered: Vec<JsonValue> = notes.into_iter().map(|n| self.render_note(n)).collect();
        Ok(KernelResponse::ok(
            format!("{} notes", rendered.len()),
            json!({"notes": rendered}),
        ))
    }

    pub async fn update_note(
        &self,
        raw_id: &str,
        patch: NotePatch,
    ) -> TeambookResult<KernelResponse> {
        let teambook = self.current_teambook();
        let id = self.resolve_note_ref(raw_id)?;
        if patch.is_empty() {
            return Err(TeambookError::new(ErrorCode::InvalidItem, "empty update"));
        }
        let Some(updated) = self.store.update_note(&teambook, id, patch).await? else {
            return Err(TeambookError::new(
                ErrorCode::NoteNotFound,
                format!("note {} not found", id),
            ));
        };
        self.mark_pagerank_dirty();
        let summary = updated.summary.clone();
        self.publish_event(DomainEvent::NoteEdited {
            note_id: id,
            actor: self.ai_id().clone(),
            summary: summary.clone(),
        })
        .await;
        self.emit(
            ItemType::Note,
            &id.to_string(),
            "edited",
            summary.as_deref(),
            None,
        )
        .await;
        Ok(KernelResponse::ok(
            format!("note {} updated", id),
            json!({"note": self.render_note(updated)}),
        ))
    }

    pub async fn pin_note(&self, raw_id: &str, pinned: bool) -> TeambookResult<KernelResponse> {
        self.update_note(
            raw_id,
            NotePatch {
                pinned: Some(pinned),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn delete_note(&self, raw_id: &str) -> TeambookResult<KernelResponse> {
        let teambook = self.current_teambook();
        let id = self.resolve_note_ref(raw_id)?;
        let removed = self.store.delete_note(&teambook, id).await?;
        if !removed {
            return Err(TeambookError::new(
                ErrorCode::NoteNotFound,
                format!("note {} not found", id),
            ));
        }
        self.with_vectors(&teambook, |index| index.remove(id));
        self.mark_pagerank_dirty();
        self.publish_event(DomainEvent::NoteDeleted {
            note_id: id,
            actor: self.ai_id().clone(),
        })
        .await;
        self.emit(ItemType::Note, &id.to_string(), "deleted", None, None)
            .await;
        Ok(KernelResponse::ok(
            format!("note {} deleted", id),
            json!({"note_id": id}),
        ))
    }

    fn render_note(&self, mut note: Note) -> JsonValue {
        note.content = self.codec.decode(&note.content);
        if let Some(summary) = &note.summary {
            note.summary = Some(self.codec.decode(summary));
        }
        serde_json::to_value(&note).unwrap_or(JsonValue::Null)
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Join the previous note's session when it is close enough, otherwise
    /// start a new one. Session failures degrade to an unsessioned note.
    async fn detect_or_create_session(
        &self,
        teambook: &str,
        now: Timestamp,
    ) -> Option<SessionId> {
        match self.store.last_note_meta(teambook).await {
            Ok(Some(prev)) => {
                if let Some(session) = prev.session_id {
                    if (now - prev.created).num_minutes() <= SESSION_GAP_MINUTES {
                        let _ = self.store.touch_session(teambook, session, now).await;
                        return Some(session);
                    }
                }
            }
            Ok(None) => {}
            Err(err) => {
                debug!(error = %err, "session lookup failed");
                return None;
            }
        }
        match self.store.create_session(teambook, now).await {
            Ok(session) => Some(session),
            Err(err) => {
                debug!(error = %err, "session creation failed");
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // Edges
    // ------------------------------------------------------------------

    async fn build_edges(
        &self,
        teambook: &str,
        note_id: NoteId,
        content: &str,
        session_id: Option<SessionId>,
        now: Timestamp,
    ) -> TeambookResult<()> {
        // Temporal: link to the last few prior notes, both directions.
        let recent = self
            .store
            .recent_note_ids(teambook, note_id, TEMPORAL_EDGES)
            .await?;
        for prev in recent {
            self.link(teambook, note_id, prev, EdgeType::Temporal, 1.0, note_id, None)
                .await?;
        }

        // Reference: `note N`, `nN`, `#N`, `[N]` patterns, asymmetric pair.
        let refs = extract_references(content);
        let valid = self.store.existing_note_ids(teambook, &refs).await?;
        for target in valid {
            if target == note_id {
                continue;
            }
            self.link_one(teambook, note_id, target, EdgeType::Reference, 2.0, note_id, None)
                .await?;
            self.link_one(
                teambook,
                target,
                note_id,
                EdgeType::ReferencedBy,
                2.0,
                note_id,
                None,
            )
            .await?;
        }

        // Session peers.
        if let Some(session) = session_id {
            let peers = self.store.session_note_ids(teambook, session, note_id).await?;
            let meta = json!({"session_id": session});
            for peer in peers {
                self.link(
                    teambook,
                    note_id,
                    peer,
                    EdgeType::Session,
                    1.5,
                    note_id,
                    Some(meta.clone()),
                )
                .await?;
            }
        }

        // Entities.
        let entities = self.extract_entities(teambook, content).await;
        let mut entity_map: HashMap<String, EntityId> = HashMap::new();
        for (name, kind) in entities {
            let entity_id = self.store.upsert_entity(teambook, &name, kind, now).await?;
            self.store.link_entity_note(teambook, entity_id, note_id).await?;
            self.known_entities
                .write()
                .expect("entity cache poisoned")
                .insert(name.clone());
            entity_map.insert(normalize_entity_key(&name), entity_id);

            let shared = self.store.entity_note_ids(teambook, entity_id).await?;
            let meta = json!({"entity_id": entity_id});
            for other in shared {
                if other == note_id {
                    continue;
                }
                self.link(
                    teambook,
                    note_id,
                    other,
                    EdgeType::Entity,
                    1.2,
                    note_id,
                    Some(meta.clone()),
                )
                .await?;
            }
        }

        if !entity_map.is_empty() {
            self.record_entity_facts(teambook, note_id, now, content, &entity_map)
                .await?;
        }
        Ok(())
    }

    /// Symmetric link: writes both directions.
    async fn link(
        &self,
        teambook: &str,
        a: NoteId,
        b: NoteId,
        edge_type: EdgeType,
        weight: f64,
        source: NoteId,
        metadata: Option<JsonValue>,
    ) -> TeambookResult<()> {
        self.link_one(teambook, a, b, edge_type, weight, source, metadata.clone())
            .await?;
        self.link_one(teambook, b, a, edge_type, weight, source, metadata)
            .await
    }

    async fn link_one(
        &self,
        teambook: &str,
        from: NoteId,
        to: NoteId,
        edge_type: EdgeType,
        weight: f64,
        source: NoteId,
        metadata: Option<JsonValue>,
    ) -> TeambookResult<()> {
        let now = Utc::now();
        self.store
            .upsert_edge(
                teambook,
                &Edge {
                    from_id: from,
                    to_id: to,
                    edge_type,
                    weight,
                    created: now,
                    valid_from: now,
                    valid_to: None,
                    source_note_id: Some(source),
                    metadata,
                },
            )
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Entities
    // ------------------------------------------------------------------

    async fn extract_entities(&self, teambook: &str, content: &str) -> Vec<(String, EntityKind)> {
        // Warm the known-entities cache once per scope.
        let cache_empty = self
            .known_entities
            .read()
            .expect("entity cache poisoned")
            .is_empty();
        if cache_empty {
            if let Ok(names) = self.store.known_entity_names(teambook).await {
                let mut cache = self.known_entities.write().expect("entity cache poisoned");
                cache.extend(names.into_iter().map(|n| n.to_lowercase()));
            }
        }

        let mut seen = HashSet::new();
        let mut out = Vec::new();

        for cap in MENTION_RE.captures_iter(content) {
            let name = cap[1].to_lowercase();
            if seen.insert(name.clone()) {
                out.push((name, EntityKind::Mention));
            }
        }

        let lower = content.to_lowercase();
        for tool in KNOWN_TOOLS {
            if lower.contains(tool) && seen.insert((*tool).to_string()) {
                out.push(((*tool).to_string(), EntityKind::Tool));
            }
        }

        let known = self.known_entities.read().expect("entity cache poisoned");
        for token in lower.split(|c: char| !c.is_alphanumeric()) {
            if token.len() >= 3 && known.contains(token) && seen.insert(token.to_string()) {
                out.push((token.to_string(), EntityKind::Known));
            }
        }
        out
    }

    // ------------------------------------------------------------------
    // Facts
    // ------------------------------------------------------------------

    async fn record_entity_facts(
        &self,
        teambook: &str,
        note_id: NoteId,
        now: Timestamp,
        content: &str,
        entity_map: &HashMap<String, EntityId>,
    ) -> TeambookResult<()> {
        for definition in FACT_PATTERNS {
            for pattern in definition.patterns {
                let Ok(re) = Regex::new(pattern) else { continue };
                for cap in re.captures_iter(content) {
                    let subject = cap.name("subject").map(|m| m.as_str()).unwrap_or("");
                    let object = cap.name("object").map(|m| m.as_str()).unwrap_or("");
                    let Some(subject_id) = resolve_entity(entity_map, subject) else {
                        continue;
                    };
                    let value = clean_text(object);
                    if value.is_empty() {
                        continue;
                    }
                    let target = resolve_entity(entity_map, object);
                    self.upsert_fact(
                        teambook,
                        note_id,
                        now,
                        subject_id,
                        definition.relation,
                        &value,
                        target,
                        definition.invalidate,
                        definition.confidence,
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn upsert_fact(
        &self,
        teambook: &str,
        note_id: NoteId,
        now: Timestamp,
        entity: EntityId,
        relation: &str,
        value: &str,
        target: Option<EntityId>,
        invalidate: bool,
        confidence: f64,
    ) -> TeambookResult<()> {
        if let Some(existing) = self
            .store
            .find_open_fact(teambook, entity, relation, value)
            .await?
        {
            // Confidence blends toward agreement when a fact repeats.
            let merged = ((existing.confidence + confidence) / 2.0 + 0.05).min(1.0);
            let valid_from = existing.valid_from.min(now);
            self.store
                .refresh_fact(teambook, existing.id, valid_from, note_id, merged)
                .await?;
            return Ok(());
        }

        if invalidate {
            self.store
                .close_open_facts(teambook, entity, relation, value, now)
                .await?;
        }

        self.store
            .insert_fact(
                teambook,
                NewFact {
                    entity_id: entity,
                    relation: relation.to_string(),
                    value: value.to_string(),
                    target_entity_id: target,
                    valid_from: now,
                    source_note_id: note_id,
                    confidence,
                    metadata: None,
                },
            )
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // PageRank
    // ------------------------------------------------------------------

    /// Recompute when the graph is big enough and the cache is dirty or
    /// stale. Runs in memory over the adjacency list; failures only delay
    /// the next recompute.
    pub(crate) async fn recompute_pagerank_if_due(&self, teambook: &str) {
        let count = match self.store.note_count(teambook).await {
            Ok(count) => count,
            Err(_) => return,
        };
        if count < PAGERANK_MIN_NOTES || !self.take_pagerank_due() {
            return;
        }
        let adjacency = match self.store.adjacency(teambook).await {
            Ok(adjacency) => adjacency,
            Err(err) => {
                warn!(error = %err, "pagerank adjacency read failed");
                return;
            }
        };
        let scores = pagerank(&adjacency);
        let rows: Vec<(NoteId, f64)> = scores
            .into_iter()
            .map(|(id, score)| (NoteId::new(id), score))
            .collect();
        if let Err(err) = self.store.store_pagerank(teambook, &rows).await {
            warn!(error = %err, "pagerank store failed");
        } else {
            debug!(nodes = rows.len(), "pagerank recomputed");
        }
    }

    // ------------------------------------------------------------------
    // Recall
    // ------------------------------------------------------------------

    /// Semantic-ish search: FTS/LIKE candidates merged with vector hits and
    /// graph reasoning, reranked by vector score + PageRank + freshness.
    pub async fn recall(&self, query: &str, limit: usize) -> TeambookResult<KernelResponse> {
        let teambook = self.current_teambook();
        let query = clean_text(query);
        if query.is_empty() {
            return Err(TeambookError::new(ErrorCode::EmptyMessage, "empty query"));
        }
        let limit = limit.clamp(1, 100);

        let text_hits = self
            .store
            .read_notes(&NoteFilter {
                teambook: teambook.clone(),
                query: Some(query.clone()),
                limit: limit * 3,
                ..Default::default()
            })
            .await?;

        let mut scores: HashMap<i64, f64> = HashMap::new();
        let mut notes: HashMap<i64, Note> = HashMap::new();
        let now = Utc::now();

        for note in text_hits {
            scores.insert(note.id.as_i64(), 1.0);
            notes.insert(note.id.as_i64(), note);
        }

        // Vector candidates, when an encoder is configured.
        if let Some(vector) = self.embed(&query) {
            let hits = self
                .with_vectors(&teambook, |index| index.search(&vector, limit * 2))
                .unwrap_or_default();
            for (id, score) in hits {
                *scores.entry(id.as_i64()).or_insert(0.0) += score;
            }
        }

        // Graph reasoning from the text seeds.
        let seeds: Vec<NoteId> = scores.keys().take(5).map(|id| NoteId::new(*id)).collect();
        let graph_scores = self.graph_reasoning(&teambook, &query, &seeds).await?;
        for (id, score) in graph_scores {
            let entry = scores.entry(id.as_i64()).or_insert(0.0);
            *entry = entry.max(score);
        }

        // Hydrate missing notes and rerank.
        for id in scores.keys().copied().collect::<Vec<_>>() {
            if !notes.contains_key(&id) {
                if let Some(note) = self.store.get_note(&teambook, NoteId::new(id)).await? {
                    notes.insert(id, note);
                } else {
                    scores.remove(&id);
                }
            }
        }

        let mut ranked: Vec<(f64, Note)> = scores
            .into_iter()
            .filter_map(|(id, base)| {
                let note = notes.remove(&id)?;
                let age_hours = (now - note.created).num_hours().max(0) as f64;
                let freshness = 1.0 / (1.0 + age_hours / 24.0);
                Some((base + note.pagerank + 0.25 * freshness, note))
            })
            .collect();
        ranked.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(limit);

        let results: Vec<JsonValue> = ranked
            .into_iter()
            .map(|(score, note)| {
                let mut rendered = self.render_note(note);
                rendered["score"] = json!((score * 1e6).round() / 1e6);
                rendered
            })
            .collect();
        Ok(KernelResponse::ok(
            format!("{} results", results.len()),
            json!({"query": query, "results": results}),
        ))
    }

    /// BFS over open edges from seed notes up to the hop limit, scoring
    /// `weight / (hop + 0.5)`; fact matches score `0.6 + 0.4 * confidence`.
    async fn graph_reasoning(
        &self,
        teambook: &str,
        query: &str,
        seeds: &[NoteId],
    ) -> TeambookResult<Vec<(NoteId, f64)>> {
        let mut scores: HashMap<i64, f64> = HashMap::new();

        if !seeds.is_empty() {
            let adjacency = self.store.adjacency(teambook).await?;
            let mut neighbors: HashMap<i64, Vec<(i64, f64)>> = HashMap::new();
            for (from, to, weight) in adjacency {
                neighbors.entry(from).or_default().push((to, weight));
            }

            let mut visited: HashMap<i64, usize> = seeds.iter().map(|s| (s.as_i64(), 0)).collect();
            let mut queue: VecDeque<(i64, usize)> =
                seeds.iter().map(|s| (s.as_i64(), 0)).collect();

            while let Some((current, depth)) = queue.pop_front() {
                if depth >= GRAPH_MAX_HOPS {
                    continue;
                }
                let Some(adjacent) = neighbors.get(&current) else {
                    continue;
                };
                for (to, weight) in adjacent {
                    if *to == current {
                        continue;
                    }
                    let hop = depth + 1;
                    let score = weight / (hop as f64 + 0.5);
                    let entry = scores.entry(*to).or_insert(0.0);
                    *entry = entry.max(score);
                    if hop < GRAPH_MAX_HOPS && visited.get(to).copied().unwrap_or(usize::MAX) > hop
                    {
                        visited.insert(*to, hop);
                        queue.push_back((*to, hop));
                    }
                }
            }
        }

        // Fact-match candidates on the first meaningful query token.
        if let Some(token) = query
            .split(|c: char| !c.is_alphanumeric())
            .find(|t| t.len() >= 3)
        {
            for candidate in self.store.fact_candidates(teambook, token, 20).await? {
                let score = 0.6 + 0.4 * candidate.confidence;
                let entry = scores.entry(candidate.note_id.as_i64()).or_insert(0.0);
                *entry = entry.max(score);
            }
        }

        let seed_set: HashSet<i64> = seeds.iter().map(|s| s.as_i64()).collect();
        Ok(scores
            .into_iter()
            .filter(|(id, _)| !seed_set.contains(id))
            .map(|(id, score)| (NoteId::new(id), score))
            .collect())
    }
}

/// Iterative PageRank over a weighted adjacency list.
fn pagerank(adjacency: &[(i64, i64, f64)]) -> Vec<(i64, f64)> {
    let mut nodes: HashSet<i64> = HashSet::new();
    let mut outgoing: HashMap<i64, Vec<(i64, f64)>> = HashMap::new();
    let mut out_weight: HashMap<i64, f64> = HashMap::new();
    for (from, to, weight) in adjacency {
        nodes.insert(*from);
        nodes.insert(*to);
        outgoing.entry(*from).or_default().push((*to, *weight));
        *out_weight.entry(*from).or_insert(0.0) += weight;
    }
    let n = nodes.len();
    if n == 0 {
        return vec![];
    }

    let base = (1.0 - PAGERANK_DAMPING) / n as f64;
    let mut rank: HashMap<i64, f64> = nodes.iter().map(|id| (*id, 1.0 / n as f64)).collect();
    for _ in 0..PAGERANK_ITERATIONS {
        let mut next: HashMap<i64, f64> = nodes.iter().map(|id| (*id, base)).collect();
        for (from, targets) in &outgoing {
            let total = out_weight[from];
            if total <= 0.0 {
                continue;
            }
            let share = rank[from] * PAGERANK_DAMPING;
            for (to, weight) in targets {
                *next.get_mut(to).expect("node present") += share * weight / total;
            }
        }
        rank = next;
    }
    rank.into_iter().collect()
}

/// Match a captured name against the extracted entities, tolerating
/// substring containment in either direction.
fn resolve_entity(entity_map: &HashMap<String, EntityId>, candidate: &str) -> Option<EntityId> {
    let normalized = normalize_entity_key(candidate);
    if normalized.is_empty() {
        return None;
    }
    if let Some(id) = entity_map.get(&normalized) {
        return Some(*id);
    }
    entity_map
        .iter()
        .find(|(key, _)| normalized.contains(*key) || key.contains(&normalized))
        .map(|(_, id)| *id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_kernel;

    fn args(content: &str) -> WriteNoteArgs {
        WriteNoteArgs {
            content: content.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_write_then_get_roundtrip() {
        let (_dir, kernel) = test_kernel().await;
        let written = kernel.write_note(args("hello graph")).await.expect("write");
        let note_id = written.data.unwrap()["note_id"].as_i64().unwrap();

        let fetched = kernel.get_note(&note_id.to_string()).await.expect("get");
        let note = &fetched.data.unwrap()["note"];
        assert_eq!(note["content"], "hello graph");
        assert_eq!(note["type"], "general");
    }

    #[tokio::test]
    async fn test_content_boundary_5000() {
        let (_dir, kernel) = test_kernel().await;
        let exact = kernel
            .write_note(args(&"x".repeat(MAX_CONTENT_CHARS)))
            .await
            .expect("write");
        assert!(exact.data.unwrap().get("warning").is_none());

        let over = kernel
            .write_note(args(&"y".repeat(MAX_CONTENT_CHARS + 1)))
            .await
            .expect("write");
        assert!(over.data.unwrap().get("warning").is_some());
    }

    #[tokio::test]
    async fn test_temporal_edges_link_recent_notes() {
        let (_dir, kernel) = test_kernel().await;
        let mut last = 0;
        for i in 0..5 {
            let resp = kernel
                .write_note(args(&format!("note body {}", i)))
                .await
                .expect("write");
            last = resp.data.unwrap()["note_id"].as_i64().unwrap();
        }
        let teambook = kernel.current_teambook();
        let edges = kernel
            .store
            .edges_for(&teambook, NoteId::new(last), false)
            .await
            .expect("edges");
        let temporal: Vec<_> = edges
            .iter()
            .filter(|e| e.edge_type == EdgeType::Temporal)
            .collect();
        assert_eq!(temporal.len(), TEMPORAL_EDGES);
        // Symmetric: reverse direction exists too.
        let reverse = kernel
            .store
            .edges_for(&teambook, NoteId::new(last), true)
            .await
            .expect("edges");
        assert!(reverse.iter().any(|e| e.edge_type == EdgeType::Temporal));
    }

    #[tokio::test]
    async fn test_reference_edges() {
        let (_dir, kernel) = test_kernel().await;
        let first = kernel.write_note(args("base note")).await.expect("write");
        let first_id = first.data.unwrap()["note_id"].as_i64().unwrap();
        let second = kernel
            .write_note(args(&format!("see note {} for context", first_id)))
            .await
            .expect("write");
        let second_id = second.data.unwrap()["note_id"].as_i64().unwrap();

        let teambook = kernel.current_teambook();
        let edges = kernel
            .store
            .edges_for(&teambook, NoteId::new(second_id), false)
            .await
            .expect("edges");
        assert!(edges
            .iter()
            .any(|e| e.edge_type == EdgeType::Reference && e.to_id.as_i64() == first_id));
        let back = kernel
            .store
            .edges_for(&teambook, NoteId::new(first_id), false)
            .await
            .expect("edges");
        assert!(back
            .iter()
            .any(|e| e.edge_type == EdgeType::ReferencedBy && e.to_id.as_i64() == second_id));
    }

    #[tokio::test]
    async fn test_session_joins_within_gap() {
        let (_dir, kernel) = test_kernel().await;
        let a = kernel.write_note(args("first")).await.expect("write");
        let b = kernel.write_note(args("second")).await.expect("write");
        let sa = a.data.unwrap()["session_id"].clone();
        let sb = b.data.unwrap()["session_id"].clone();
        assert_eq!(sa, sb);
        assert!(!sa.is_null());
    }

    #[tokio::test]
    async fn test_entity_extraction_links_shared_notes() {
        let (_dir, kernel) = test_kernel().await;
        kernel
            .write_note(args("migrating the cache to redis tonight"))
            .await
            .expect("write");
        let second = kernel
            .write_note(args("redis latency looks fine now"))
            .await
            .expect("write");
        let second_id = second.data.unwrap()["note_id"].as_i64().unwrap();

        let teambook = kernel.current_teambook();
        let edges = kernel
            .store
            .edges_for(&teambook, NoteId::new(second_id), false)
            .await
            .expect("edges");
        assert!(edges.iter().any(|e| e.edge_type == EdgeType::Entity));
    }

    #[tokio::test]
    async fn test_fact_invalidation_closes_prior() {
        let (_dir, kernel) = test_kernel().await;
        kernel
            .write_note(args("@alice update: Alice lives in Paris"))
            .await
            .expect("write");
        kernel
            .write_note(args("@alice update: Alice moved to Berlin"))
            .await
            .expect("write");

        let teambook = kernel.current_teambook();
        let candidates = kernel
            .store
            .fact_candidates(&teambook, "Berlin", 10)
            .await
            .expect("facts");
        assert!(!candidates.is_empty());
        // The Paris fact is closed, so only Berlin remains open.
        let paris = kernel
            .store
            .fact_candidates(&teambook, "Paris", 10)
            .await
            .expect("facts");
        assert!(paris.is_empty());
    }

    #[tokio::test]
    async fn test_update_note_emits_edited_and_rehashes() {
        let (_dir, kernel) = test_kernel().await;
        let mut rx = kernel.event_bus().subscribe();
        let written = kernel.write_note(args("original text")).await.expect("write");
        let note_id = written.data.unwrap()["note_id"].as_i64().unwrap();

        kernel
            .update_note(
                &note_id.to_string(),
                NotePatch {
                    summary: Some(Some("new".to_string())),
                    ..Default::default()
                },
            )
            .await
            .expect("update");

        let mut saw_edited = false;
        while let Ok(wire) = rx.try_recv() {
            if wire.event.event_type() == "note_edited" {
                saw_edited = true;
            }
        }
        assert!(saw_edited);

        let teambook = kernel.current_teambook();
        let stored = kernel
            .store
            .get_note(&teambook, NoteId::new(note_id))
            .await
            .expect("get")
            .expect("note");
        assert_eq!(stored.tamper_hash, stored.compute_tamper_hash());
    }

    #[tokio::test]
    async fn test_recall_finds_by_text_without_embedder() {
        let (dir, _guard) = {
            // Kernel without the semantic flag: recall degrades to FTS/LIKE
            // plus graph ranking and never returns empty for a match.
            let dir = tempfile::tempdir().expect("tempdir");
            (dir, ())
        };
        let config = TeambookConfig {
            root: dir.path().to_path_buf(),
            teambook: "demo".to_string(),
            identity_dir: Some(dir.path().join("identity")),
            semantic: false,
            ..Default::default()
        };
        let store: std::sync::Arc<dyn teambook_storage::StorageBackend> =
            std::sync::Arc::new(teambook_storage::SqliteBackend::new(config.root.clone()));
        let kernel = Kernel::new(config, store, teambook_events::EventBus::new(64));

        kernel
            .write_note(args("deploy checklist for the api gateway"))
            .await
            .expect("write");
        kernel.write_note(args("lunch plans")).await.expect("write");

        let found = kernel.recall("gateway checklist", 10).await.expect("recall");
        let results = found.data.unwrap()["results"].as_array().unwrap().clone();
        assert!(!results.is_empty());
        assert!(results[0]["content"]
            .as_str()
            .unwrap()
            .contains("gateway"));
    }

    #[tokio::test]
    async fn test_pin_unpin_idempotent_surface() {
        let (_dir, kernel) = test_kernel().await;
        let written = kernel.write_note(args("pin me")).await.expect("write");
        let id = written.data.unwrap()["note_id"].as_i64().unwrap().to_string();
        kernel.pin_note(&id, true).await.expect("pin");
        let fetched = kernel.get_note(&id).await.expect("get");
        assert_eq!(fetched.data.unwrap()["note"]["pinned"], true);
        kernel.pin_note(&id, false).await.expect("unpin");
        let fetched = kernel.get_note(&id).await.expect("get");
        assert_eq!(fetched.data.unwrap()["note"]["pinned"], false);
    }

    #[tokio::test]
    async fn test_last_reference_resolves() {
        let (_dir, kernel) = test_kernel().await;
        let written = kernel.write_note(args("most recent")).await.expect("write");
        let id = written.data.unwrap()["note_id"].as_i64().unwrap();
        let fetched = kernel.get_note("last").await.expect("get last");
        assert_eq!(fetched.data.unwrap()["note"]["id"], id);
    }

    #[test]
    fn test_pagerank_favors_linked_nodes() {
        let adjacency = vec![
            (1, 3, 1.0),
            (2, 3, 1.0),
            (4, 3, 1.0),
            (3, 1, 0.5),
        ];
        let scores: HashMap<i64, f64> = pagerank(&adjacency).into_iter().collect();
        assert!(scores[&3] > scores[&2]);
        assert!(scores[&3] > scores[&4]);
    }

    #[test]
    fn test_reference_extraction_forms() {
        let refs = extract_references("see note 12, n34, #56 and [78]");
        let ids: HashSet<i64> = refs.iter().map(|r| r.as_i64()).collect();
        assert_eq!(ids, HashSet::from([12, 34, 56, 78]));
    }
}
