//! Redis backend.
//!
//! Data model: hash records for notes, sorted sets for timeline/pagerank,
//! sets for index lookups, integer counters (`INCR`) for ID generation, and
//! JSON strings for the remaining record kinds. Message and event keys carry
//! a real TTL so Redis expires them natively. Lock acquisition and task
//! claim run as Lua scripts so multi-process coordination stays atomic.
//! Pub/sub uses a dedicated non-pooled connection per channel.

use crate::adapter::*;
use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::str::FromStr;
use teambook_core::*;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Redis storage backend.
pub struct RedisBackend {
    client: redis::Client,
    conn: ConnectionManager,
}

fn kv_err(err: impl std::fmt::Display) -> StorageError {
    StorageError::Query(err.to_string())
}

fn prefix(teambook: &str) -> String {
    format!("teambook:{}", teambook)
}

fn ms(ts: Timestamp) -> i64 {
    ts.timestamp_millis()
}

impl RedisBackend {
    /// Connect and verify liveness with a PING.
    pub async fn connect(url: &str) -> StorageResult<Self> {
        let client = redis::Client::open(url).map_err(|e| StorageError::Unavailable(e.to_string()))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        let backend = Self { client, conn };
        backend.ping_inner().await?;
        info!(url, "redis storage ready");
        Ok(backend)
    }

    fn c(&self) -> ConnectionManager {
        self.conn.clone()
    }

    async fn ping_inner(&self) -> StorageResult<()> {
        let mut conn = self.c();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn next_id(&self, teambook: &str, seq: &str) -> StorageResult<i64> {
        let mut conn = self.c();
        conn.incr(format!("{}:seq:{}", prefix(teambook), seq), 1)
            .await
            .map_err(kv_err)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> StorageResult<Option<T>> {
        let mut conn = self.c();
        let raw: Option<String> = conn.get(key).await.map_err(kv_err)?;
        Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
    }

    async fn set_json<T: serde::Serialize>(&self, key: &str, value: &T) -> StorageResult<()> {
        let mut conn = self.c();
        let raw = serde_json::to_string(value)?;
        conn.set::<_, _, ()>(key, raw).await.map_err(kv_err)
    }

    /// Fetch note ids to consider for a filter, narrowest index first.
    async fn candidate_note_ids(&self, filter: &NoteFilter) -> StorageResult<Vec<i64>> {
        let p = prefix(&filter.teambook);
        let mut conn = self.c();
        let mut ids: Vec<i64> = if filter.pinned_only == Some(true) {
            conn.smembers(format!("{}:notes:pinned", p)).await.map_err(kv_err)?
        } else if let Some(author) = &filter.author {
            conn.smembers(format!("{}:idx:author:{}", p, author))
                .await
                .map_err(kv_err)?
        } else if let Some(note_type) = &filter.note_type {
            conn.smembers(format!("{}:idx:type:{}", p, note_type))
                .await
                .map_err(kv_err)?
        } else if let Some(session) = filter.session_id {
            conn.smembers(format!("{}:idx:session:{}", p, session.as_i64()))
                .await
                .map_err(kv_err)?
        } else if let Some(tag) = &filter.tag {
            conn.smembers(format!("{}:idx:tag:{}", p, tag)).await.map_err(kv_err)?
        } else if filter.mode == ReadMode::Important {
            conn.zrevrange(format!("{}:notes:pagerank", p), 0, -1)
                .await
                .map_err(kv_err)?
        } else {
            conn.zrevrange(
                format!("{}:notes:timeline", p),
                0,
                (filter.offset + filter.limit.max(1) * 4) as isize,
            )
            .await
            .map_err(kv_err)?
        };
        ids.sort_unstable_by(|a, b| b.cmp(a));
        Ok(ids)
    }

    async fn fetch_note(&self, teambook: &str, id: i64) -> StorageResult<Option<Note>> {
        let mut conn = self.c();
        let map: HashMap<String, String> = conn
            .hgetall(format!("{}:note:{}", prefix(teambook), id))
            .await
            .map_err(kv_err)?;
        if map.is_empty() {
            return Ok(None);
        }
        Ok(Some(note_from_hash(&map)?))
    }

    async fn write_note_hash(&self, note: &Note) -> StorageResult<()> {
        let mut conn = self.c();
        let key = format!("{}:note:{}", prefix(&note.teambook), note.id.as_i64());
        let fields = note_to_hash(note)?;
        conn.hset_multiple::<_, _, _, ()>(key, &fields).await.map_err(kv_err)
    }

    async fn deindex_note(&self, note: &Note) -> StorageResult<()> {
        let p = prefix(&note.teambook);
        let id = note.id.as_i64();
        let mut conn = self.c();
        let _: () = conn.zrem(format!("{}:notes:timeline", p), id).await.map_err(kv_err)?;
        let _: () = conn.zrem(format!("{}:notes:pagerank", p), id).await.map_err(kv_err)?;
        let _: () = conn.srem(format!("{}:notes:pinned", p), id).await.map_err(kv_err)?;
        let _: () = conn
            .srem(format!("{}:idx:author:{}", p, note.author), id)
            .await
            .map_err(kv_err)?;
        let _: () = conn
            .srem(format!("{}:idx:type:{}", p, note.note_type), id)
            .await
            .map_err(kv_err)?;
        if let Some(session) = note.session_id {
            let _: () = conn
                .srem(format!("{}:idx:session:{}", p, session.as_i64()), id)
                .await
                .map_err(kv_err)?;
        }
        for tag in &note.tags {
            let _: () = conn.srem(format!("{}:idx:tag:{}", p, tag), id).await.map_err(kv_err)?;
        }
        Ok(())
    }

    async fn index_note(&self, note: &Note) -> StorageResult<()> {
        let p = prefix(&note.teambook);
        let id = note.id.as_i64();
        let mut conn = self.c();
        let _: () = conn
            .zadd(format!("{}:notes:timeline", p), id, ms(note.created))
            .await
            .map_err(kv_err)?;
        let _: () = conn
            .zadd(format!("{}:notes:pagerank", p), id, note.pagerank)
            .await
            .map_err(kv_err)?;
        let _: () = conn
            .sadd(format!("{}:idx:author:{}", p, note.author), id)
            .await
            .map_err(kv_err)?;
        let _: () = conn
            .sadd(format!("{}:idx:type:{}", p, note.note_type), id)
            .await
            .map_err(kv_err)?;
        if let Some(session) = note.session_id {
            let _: () = conn
                .sadd(format!("{}:idx:session:{}", p, session.as_i64()), id)
                .await
                .map_err(kv_err)?;
        }
        if note.pinned {
            let _: () = conn.sadd(format!("{}:notes:pinned", p), id).await.map_err(kv_err)?;
        }
        for tag in &note.tags {
            let _: () = conn.sadd(format!("{}:idx:tag:{}", p, tag), id).await.map_err(kv_err)?;
        }
        Ok(())
    }
}

// ============================================================================
// NOTE HASH CODEC
// ============================================================================

fn note_to_hash(note: &Note) -> StorageResult<Vec<(String, String)>> {
    Ok(vec![
        ("id".into(), note.id.as_i64().to_string()),
        ("content".into(), note.content.clone()),
        ("summary".into(), note.summary.clone().unwrap_or_default()),
        ("tags".into(), serde_json::to_string(&note.tags)?),
        ("pinned".into(), if note.pinned { "1" } else { "0" }.into()),
        ("author".into(), note.author.as_str().to_string()),
        (
            "owner".into(),
            note.owner.as_ref().map(|o| o.as_str().to_string()).unwrap_or_default(),
        ),
        ("type".into(), note.note_type.clone()),
        (
            "parent_id".into(),
            note.parent_id.map(|p| p.as_i64().to_string()).unwrap_or_default(),
        ),
        ("teambook".into(), note.teambook.clone()),
        ("created".into(), note.created.to_rfc3339()),
        (
            "session_id".into(),
            note.session_id.map(|s| s.as_i64().to_string()).unwrap_or_default(),
        ),
        ("linked_items".into(), serde_json::to_string(&note.linked_items)?),
        ("pagerank".into(), note.pagerank.to_string()),
        ("has_vector".into(), if note.has_vector { "1" } else { "0" }.into()),
        (
            "representation_policy".into(),
            note.representation_policy.as_str().to_string(),
        ),
        ("metadata".into(), serde_json::to_string(&note.metadata)?),
        ("tamper_hash".into(), note.tamper_hash.clone()),
    ])
}

fn note_from_hash(map: &HashMap<String, String>) -> StorageResult<Note> {
    let field = |name: &str| map.get(name).cloned().unwrap_or_default();
    let opt = |name: &str| map.get(name).filter(|v| !v.is_empty()).cloned();
    let created = chrono::DateTime::parse_from_rfc3339(&field("created"))
        .map_err(kv_err)?
        .with_timezone(&Utc);
    Ok(Note {
        id: NoteId::new(field("id").parse().unwrap_or(0)),
        content: field("content"),
        summary: opt("summary"),
        tags: serde_json::from_str(&field("tags")).unwrap_or_default(),
        pinned: field("pinned") == "1",
        author: AiId::new(field("author")),
        owner: opt("owner").map(AiId::new),
        note_type: field("type"),
        parent_id: opt("parent_id").and_then(|v| v.parse().ok()).map(NoteId::new),
        teambook: field("teambook"),
        created,
        session_id: opt("session_id").and_then(|v| v.parse().ok()).map(SessionId::new),
        linked_items: serde_json::from_str(&field("linked_items")).unwrap_or_default(),
        pagerank: field("pagerank").parse().unwrap_or(0.0),
        has_vector: field("has_vector") == "1",
        representation_policy: RepresentationPolicy::from_str(&field("representation_policy"))
            .unwrap_or_default(),
        metadata: serde_json::from_str(&field("metadata")).unwrap_or_else(|_| serde_json::json!({})),
        tamper_hash: field("tamper_hash"),
    })
}

// Stored JSON shapes that carry an expiry alongside the record.
#[derive(serde::Serialize, serde::Deserialize)]
struct StoredEdge {
    weight: f64,
    created: Timestamp,
    valid_from: Timestamp,
    valid_to: Option<Timestamp>,
    source_note_id: Option<i64>,
    metadata: Option<JsonValue>,
}

// ============================================================================
// LUA SCRIPTS
// ============================================================================

/// Acquire succeeds when the key is absent, expired, or already ours.
/// ARGV: lock json, now ms, holder, ttl ms. Returns '' on success or the
/// current holder's json.
const ACQUIRE_SCRIPT: &str = r#"
local cur = redis.call('GET', KEYS[1])
if cur then
  local lock = cjson.decode(cur)
  if tonumber(lock.expires_ms) > tonumber(ARGV[2]) and lock.held_by ~= ARGV[3] then
    return cur
  end
end
redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[4])
return ''
"#;

/// Pop the best pending task id from the ordering zset and drop it from the
/// sibling zset. Returns '' when the queue is empty.
const CLAIM_SCRIPT: &str = r#"
local popped = redis.call('ZPOPMIN', KEYS[1])
if #popped == 0 then return '' end
redis.call('ZREM', KEYS[2], popped[1])
return popped[1]
"#;

// ============================================================================
// TRAIT IMPLEMENTATION
// ============================================================================

#[async_trait]
impl StorageBackend for RedisBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Redis
    }

    async fn ping(&self) -> StorageResult<()> {
        self.ping_inner().await
    }

    // ------------------------------------------------------------------
    // Notes
    // ------------------------------------------------------------------

    async fn insert_note(&self, new: NewNote) -> StorageResult<NoteId> {
        let id = NoteId::new(self.next_id(&new.teambook, "notes").await?);
        let note = Note {
            id,
            content: new.content,
            summary: new.summary,
            tags: new.tags,
            pinned: new.pinned,
            author: new.author,
            owner: new.owner,
            note_type: new.note_type,
            parent_id: new.parent_id,
            teambook: new.teambook,
            created: new.created,
            session_id: new.session_id,
            linked_items: new.linked_items,
            pagerank: 0.0,
            has_vector: new.has_vector,
            representation_policy: new.representation_policy,
            metadata: new.metadata,
            tamper_hash: new.tamper_hash,
        };
        self.write_note_hash(&note).await?;
        self.index_note(&note).await?;
        debug!(note_id = %id, teambook = %note.teambook, "note stored");
        Ok(id)
    }

    async fn get_note(&self, teambook: &str, id: NoteId) -> StorageResult<Option<Note>> {
        self.fetch_note(teambook, id.as_i64()).await
    }

    async fn read_notes(&self, filter: &NoteFilter) -> StorageResult<Vec<Note>> {
        let ids = self.candidate_note_ids(filter).await?;
        let mut notes = Vec::new();
        for id in ids {
            let Some(note) = self.fetch_note(&filter.teambook, id).await? else {
                continue;
            };
            if let Some(tag) = &filter.tag {
                if !note.tags.iter().any(|t| t == tag) {
                    continue;
                }
            }
            if let Some(owner) = &filter.owner {
                if note.owner.as_ref() != Some(owner) {
                    continue;
                }
            }
            if let Some(note_type) = &filter.note_type {
                if &note.note_type != note_type {
                    continue;
                }
            }
            if filter.pinned_only == Some(true) && !note.pinned {
                continue;
            }
            if let Some(query) = &filter.query {
                let q = query.to_lowercase();
                let hit = note.content.to_lowercase().contains(&q)
                    || note
                        .summary
                        .as_deref()
                        .map(|s| s.to_lowercase().contains(&q))
                        .unwrap_or(false);
                if !hit {
                    continue;
                }
            }
            notes.push(note);
        }
        match filter.mode {
            ReadMode::Important => notes.sort_by(|a, b| {
                b.pinned
                    .cmp(&a.pinned)
                    .then(b.pagerank.partial_cmp(&a.pagerank).unwrap_or(std::cmp::Ordering::Equal))
                    .then(b.created.cmp(&a.created))
            }),
            ReadMode::Recent => notes.sort_by(|a, b| b.created.cmp(&a.created)),
        }
        Ok(notes
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit)
            .collect())
    }

    async fn update_note(
        &self,
        teambook: &str,
        id: NoteId,
        patch: NotePatch,
    ) -> StorageResult<Option<Note>> {
        let Some(mut note) = self.fetch_note(teambook, id.as_i64()).await? else {
            return Ok(None);
        };
        self.deindex_note(&note).await?;
        if let Some(content) = patch.content {
            note.content = content;
        }
        if let Some(summary) = patch.summary {
            note.summary = summary;
        }
        if let Some(tags) = patch.tags {
            note.tags = tags;
        }
        if let Some(pinned) = patch.pinned {
            note.pinned = pinned;
        }
        if let Some(owner) = patch.owner {
            note.owner = owner;
        }
        if let Some(linked) = patch.linked_items {
            note.linked_items = linked;
        }
        if let Some(metadata) = patch.metadata {
            note.metadata = metadata;
        }
        note.tamper_hash = note.compute_tamper_hash();
        self.write_note_hash(&note).await?;
        self.index_note(&note).await?;
        Ok(Some(note))
    }

    async fn delete_note(&self, teambook: &str, id: NoteId) -> StorageResult<bool> {
        let Some(note) = self.fetch_note(teambook, id.as_i64()).await? else {
            return Ok(false);
        };
        self.deindex_note(&note).await?;
        let mut conn = self.c();
        let _: () = conn
            .del(format!("{}:note:{}", prefix(teambook), id.as_i64()))
            .await
            .map_err(kv_err)?;
        let _: () = conn
            .del(format!("{}:edges:{}", prefix(teambook), id.as_i64()))
            .await
            .map_err(kv_err)?;
        let _: () = conn
            .del(format!("{}:redges:{}", prefix(teambook), id.as_i64()))
            .await
            .map_err(kv_err)?;
        Ok(true)
    }

    async fn note_count(&self, teambook: &str) -> StorageResult<u64> {
        let mut conn = self.c();
        let n: i64 = conn
            .zcard(format!("{}:notes:timeline", prefix(teambook)))
            .await
            .map_err(kv_err)?;
        Ok(n as u64)
    }

    async fn last_note_meta(&self, teambook: &str) -> StorageResult<Option<LastNoteMeta>> {
        let mut conn = self.c();
        let ids: Vec<i64> = conn
            .zrevrange(format!("{}:notes:timeline", prefix(teambook)), 0, 0)
            .await
            .map_err(kv_err)?;
        let Some(id) = ids.first() else {
            return Ok(None);
        };
        Ok(self.fetch_note(teambook, *id).await?.map(|note| LastNoteMeta {
            id: note.id,
            created: note.created,
            session_id: note.session_id,
        }))
    }

    async fn existing_note_ids(
        &self,
        teambook: &str,
        ids: &[NoteId],
    ) -> StorageResult<Vec<NoteId>> {
        let mut out = Vec::new();
        let mut conn = self.c();
        for id in ids {
            let exists: bool = conn
                .exists(format!("{}:note:{}", prefix(teambook), id.as_i64()))
                .await
                .map_err(kv_err)?;
            if exists {
                out.push(*id);
            }
        }
        Ok(out)
    }

    async fn recent_note_ids(
        &self,
        teambook: &str,
        before: NoteId,
        limit: usize,
    ) -> StorageResult<Vec<NoteId>> {
        let mut conn = self.c();
        let ids: Vec<i64> = conn
            .zrevrange(format!("{}:notes:timeline", prefix(teambook)), 0, -1)
            .await
            .map_err(kv_err)?;
        Ok(ids
            .into_iter()
            .filter(|id| *id < before.as_i64())
            .take(limit)
            .map(NoteId::new)
            .collect())
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    async fn create_session(&self, teambook: &str, started: Timestamp) -> StorageResult<SessionId> {
        let id = SessionId::new(self.next_id(teambook, "sessions").await?);
        self.set_json(
            &format!("{}:session:{}", prefix(teambook), id.as_i64()),
            &Session {
                id,
                started,
                ended: started,
                note_count: 1,
            },
        )
        .await?;
        Ok(id)
    }

    async fn touch_session(
        &self,
        teambook: &str,
        id: SessionId,
        ended: Timestamp,
    ) -> StorageResult<()> {
        let key = format!("{}:session:{}", prefix(teambook), id.as_i64());
        if let Some(mut session) = self.get_json::<Session>(&key).await? {
            session.ended = ended;
            session.note_count += 1;
            self.set_json(&key, &session).await?;
        }
        Ok(())
    }

    async fn session_note_ids(
        &self,
        teambook: &str,
        id: SessionId,
        exclude: NoteId,
    ) -> StorageResult<Vec<NoteId>> {
        let mut conn = self.c();
        let ids: Vec<i64> = conn
            .smembers(format!("{}:idx:session:{}", prefix(teambook), id.as_i64()))
            .await
            .map_err(kv_err)?;
        Ok(ids
            .into_iter()
            .filter(|raw| *raw != exclude.as_i64())
            .map(NoteId::new)
            .collect())
    }

    // ------------------------------------------------------------------
    // Edges and PageRank
    // ------------------------------------------------------------------

    async fn upsert_edge(&self, teambook: &str, edge: &Edge) -> StorageResult<()> {
        let p = prefix(teambook);
        let stored = StoredEdge {
            weight: edge.weight,
            created: edge.created,
            valid_from: edge.valid_from,
            valid_to: None,
            source_note_id: edge.source_note_id.map(|n| n.as_i64()),
            metadata: edge.metadata.clone(),
        };
        let raw = serde_json::to_string(&stored)?;
        let field = format!("{}:{}", edge.to_id.as_i64(), edge.edge_type.as_str());
        let rfield = format!("{}:{}", edge.from_id.as_i64(), edge.edge_type.as_str());
        let mut conn = self.c();
        let _: () = conn
            .hset(format!("{}:edges:{}", p, edge.from_id.as_i64()), field, &raw)
            .await
            .map_err(kv_err)?;
        let _: () = conn
            .hset(format!("{}:redges:{}", p, edge.to_id.as_i64()), rfield, &raw)
            .await
            .map_err(kv_err)?;
        Ok(())
    }

    async fn edges_for(
        &self,
        teambook: &str,
        note: NoteId,
        reverse: bool,
    ) -> StorageResult<Vec<Edge>> {
        let key = if reverse {
            format!("{}:redges:{}", prefix(teambook), note.as_i64())
        } else {
            format!("{}:edges:{}", prefix(teambook), note.as_i64())
        };
        let mut conn = self.c();
        let map: HashMap<String, String> = conn.hgetall(key).await.map_err(kv_err)?;
        let mut edges = Vec::new();
        for (field, raw) in map {
            let Some((other, edge_type)) = field.split_once(':') else {
                continue;
            };
            let Ok(other_id) = other.parse::<i64>() else {
                continue;
            };
            let Ok(edge_type) = EdgeType::from_str(edge_type) else {
                continue;
            };
            let Ok(stored) = serde_json::from_str::<StoredEdge>(&raw) else {
                continue;
            };
            let (from_id, to_id) = if reverse {
                (NoteId::new(other_id), note)
            } else {
                (note, NoteId::new(other_id))
            };
            edges.push(Edge {
                from_id,
                to_id,
                edge_type,
                weight: stored.weight,
                created: stored.created,
                valid_from: stored.valid_from,
                valid_to: stored.valid_to,
                source_note_id: stored.source_note_id.map(NoteId::new),
                metadata: stored.metadata,
            });
        }
        Ok(edges)
    }

    async fn adjacency(&self, teambook: &str) -> StorageResult<Vec<(i64, i64, f64)>> {
        let pattern = format!("{}:edges:*", prefix(teambook));
        let mut conn = self.c();
        let keys: Vec<String> = {
            let mut iter = conn.scan_match::<_, String>(&pattern).await.map_err(kv_err)?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };
        let mut out = Vec::new();
        for key in keys {
            let Some(from) = key.rsplit(':').next().and_then(|s| s.parse::<i64>().ok()) else {
                continue;
            };
            let map: HashMap<String, String> = conn.hgetall(&key).await.map_err(kv_err)?;
            for (field, raw) in map {
                let Some((to, _)) = field.split_once(':') else {
                    continue;
                };
                let (Ok(to), Ok(stored)) =
                    (to.parse::<i64>(), serde_json::from_str::<StoredEdge>(&raw))
                else {
                    continue;
                };
                if stored.valid_to.is_none() {
                    out.push((from, to, stored.weight));
                }
            }
        }
        Ok(out)
    }

    async fn store_pagerank(&self, teambook: &str, scores: &[(NoteId, f64)]) -> StorageResult<()> {
        let p = prefix(teambook);
        let mut conn = self.c();
        for (id, score) in scores {
            let _: () = conn
                .zadd(format!("{}:notes:pagerank", p), id.as_i64(), *score)
                .await
                .map_err(kv_err)?;
            let _: () = conn
                .hset(
                    format!("{}:note:{}", p, id.as_i64()),
                    "pagerank",
                    score.to_string(),
                )
                .await
                .map_err(kv_err)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Entities and facts
    // ------------------------------------------------------------------

    async fn upsert_entity(
        &self,
        teambook: &str,
        name: &str,
        kind: EntityKind,
        now: Timestamp,
    ) -> StorageResult<EntityId> {
        let p = prefix(teambook);
        let mut conn = self.c();
        let existing: Option<i64> = conn
            .hget(format!("{}:entity:names", p), name)
            .await
            .map_err(kv_err)?;
        if let Some(raw) = existing {
            let key = format!("{}:entity:{}", p, raw);
            if let Some(mut entity) = self.get_json::<Entity>(&key).await? {
                entity.last_seen = now;
                entity.mention_count += 1;
                self.set_json(&key, &entity).await?;
            }
            return Ok(EntityId::new(raw));
        }
        let id = EntityId::new(self.next_id(teambook, "entities").await?);
        let entity = Entity {
            id,
            name: name.to_string(),
            kind,
            first_seen: now,
            last_seen: now,
            mention_count: 1,
        };
        self.set_json(&format!("{}:entity:{}", p, id.as_i64()), &entity).await?;
        let _: () = conn
            .hset(format!("{}:entity:names", p), name, id.as_i64())
            .await
            .map_err(kv_err)?;
        Ok(id)
    }

    async fn link_entity_note(
        &self,
        teambook: &str,
        entity: EntityId,
        note: NoteId,
    ) -> StorageResult<()> {
        let mut conn = self.c();
        conn.sadd(
            format!("{}:entity_notes:{}", prefix(teambook), entity.as_i64()),
            note.as_i64(),
        )
        .await
        .map_err(kv_err)
    }

    async fn entity_note_ids(&self, teambook: &str, entity: EntityId) -> StorageResult<Vec<NoteId>> {
        let mut conn = self.c();
        let ids: Vec<i64> = conn
            .smembers(format!("{}:entity_notes:{}", prefix(teambook), entity.as_i64()))
            .await
            .map_err(kv_err)?;
        Ok(ids.into_iter().map(NoteId::new).collect())
    }

    async fn known_entity_names(&self, teambook: &str) -> StorageResult<Vec<String>> {
        let mut conn = self.c();
        let names: Vec<String> = conn
            .hkeys(format!("{}:entity:names", prefix(teambook)))
            .await
            .map_err(kv_err)?;
        Ok(names)
    }

    async fn find_open_fact(
        &self,
        teambook: &str,
        entity: EntityId,
        relation: &str,
        value: &str,
    ) -> StorageResult<Option<EntityFact>> {
        let facts = self.open_facts_for(teambook, entity, relation).await?;
        Ok(facts.into_iter().find(|f| f.value == value))
    }

    async fn refresh_fact(
        &self,
        teambook: &str,
        id: FactId,
        valid_from: Timestamp,
        source_note_id: NoteId,
        confidence: f64,
    ) -> StorageResult<()> {
        let key = format!("{}:fact:{}", prefix(teambook), id.as_i64());
        if let Some(mut fact) = self.get_json::<EntityFact>(&key).await? {
            fact.valid_from = valid_from;
            fact.source_note_id = source_note_id;
            fact.confidence = confidence;
            self.set_json(&key, &fact).await?;
        }
        Ok(())
    }

    async fn close_open_facts(
        &self,
        teambook: &str,
        entity: EntityId,
        relation: &str,
        except_value: &str,
        now: Timestamp,
    ) -> StorageResult<u64> {
        let p = prefix(teambook);
        let mut closed = 0;
        let mut conn = self.c();
        for fact in self.open_facts_for(teambook, entity, relation).await? {
            if fact.value == except_value {
                continue;
            }
            let key = format!("{}:fact:{}", p, fact.id.as_i64());
            let mut fact = fact;
            fact.valid_to = Some(now);
            self.set_json(&key, &fact).await?;
            let _: () = conn
                .srem(format!("{}:facts:open", p), fact.id.as_i64())
                .await
                .map_err(kv_err)?;
            closed += 1;
        }
        Ok(closed)
    }

    async fn insert_fact(&self, teambook: &str, new: NewFact) -> StorageResult<FactId> {
        let p = prefix(teambook);
        let id = FactId::new(self.next_id(teambook, "facts").await?);
        let fact = EntityFact {
            id,
            entity_id: new.entity_id,
            relation: new.relation.clone(),
            value: new.value,
            target_entity_id: new.target_entity_id,
            valid_from: new.valid_from,
            valid_to: None,
            source_note_id: new.source_note_id,
            confidence: new.confidence,
            metadata: new.metadata,
        };
        self.set_json(&format!("{}:fact:{}", p, id.as_i64()), &fact).await?;
        let mut conn = self.c();
        let _: () = conn
            .sadd(
                format!("{}:facts:{}:{}", p, new.entity_id.as_i64(), new.relation),
                id.as_i64(),
            )
            .await
            .map_err(kv_err)?;
        let _: () = conn
            .sadd(format!("{}:facts:open", p), id.as_i64())
            .await
            .map_err(kv_err)?;
        Ok(id)
    }

    async fn fact_candidates(
        &self,
        teambook: &str,
        token: &str,
        limit: usize,
    ) -> StorageResult<Vec<FactCandidate>> {
        let p = prefix(teambook);
        let mut conn = self.c();
        let ids: Vec<i64> = conn
            .smembers(format!("{}:facts:open", p))
            .await
            .map_err(kv_err)?;
        let needle = token.to_lowercase();
        let mut out = Vec::new();
        for id in ids {
            let Some(fact) = self
                .get_json::<EntityFact>(&format!("{}:fact:{}", p, id))
                .await?
            else {
                continue;
            };
            if fact.valid_to.is_some() {
                continue;
            }
            if fact.value.to_lowercase().contains(&needle)
                || fact.relation.to_lowercase().contains(&needle)
            {
                out.push(FactCandidate {
                    note_id: fact.source_note_id,
                    entity_id: fact.entity_id,
                    relation: fact.relation,
                    value: fact.value,
                    confidence: fact.confidence,
                });
            }
        }
        out.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        out.truncate(limit);
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    async fn insert_message(&self, new: NewMessage) -> StorageResult<MessageId> {
        let p = prefix(&new.teambook);
        let id = MessageId::new(self.next_id(&new.teambook, "messages").await?);
        let msg = Message {
            id,
            channel: new.channel.clone(),
            from_ai: new.from_ai,
            to_ai: new.to_ai,
            content: new.content,
            summary: new.summary,
            reply_to: new.reply_to,
            created: new.created,
            read: false,
            expires_at: new.expires_at,
            teambook: new.teambook,
            envelope: new.envelope,
        };
        let key = format!("{}:msg:{}", p, id.as_i64());
        self.set_json(&key, &msg).await?;
        let mut conn = self.c();
        // Redis expires the body natively; the zset member is filtered out
        // lazily on read and in purge.
        let _: () = conn
            .expire_at(&key, msg.expires_at.timestamp())
            .await
            .map_err(kv_err)?;
        let _: () = conn
            .zadd(format!("{}:msgs:{}", p, new.channel), id.as_i64(), ms(msg.created))
            .await
            .map_err(kv_err)?;
        Ok(id)
    }

    async fn read_messages(&self, filter: &MessageFilter) -> StorageResult<Vec<Message>> {
        let p = prefix(&filter.teambook);
        let channel = filter.channel.clone().unwrap_or_else(|| DM_CHANNEL.to_string());
        let mut conn = self.c();
        let ids: Vec<i64> = conn
            .zrevrange(format!("{}:msgs:{}", p, channel), 0, -1)
            .await
            .map_err(kv_err)?;
        let now = Utc::now();
        let mut out = Vec::new();
        for id in ids {
            if out.len() >= filter.limit {
                break;
            }
            let Some(msg) = self
                .get_json::<Message>(&format!("{}:msg:{}", p, id))
                .await?
            else {
                continue;
            };
            if msg.is_expired(now) {
                continue;
            }
            if let Some(to_ai) = &filter.to_ai {
                if msg.to_ai.as_ref() != Some(to_ai) {
                    continue;
                }
            }
            if let Some(from_ai) = &filter.from_ai {
                if &msg.from_ai != from_ai {
                    continue;
                }
            }
            if let Some(since) = filter.since {
                if msg.created <= since {
                    continue;
                }
            }
            if filter.unread_only && msg.read {
                continue;
            }
            if let Some(thread) = filter.thread_id {
                if msg.id != thread && msg.reply_to != Some(thread) {
                    continue;
                }
            }
            out.push(msg);
        }
        Ok(out)
    }

    async fn mark_messages_read(&self, teambook: &str, ids: &[MessageId]) -> StorageResult<u64> {
        let p = prefix(teambook);
        let mut updated = 0;
        let mut conn = self.c();
        for id in ids {
            let key = format!("{}:msg:{}", p, id.as_i64());
            if let Some(mut msg) = self.get_json::<Message>(&key).await? {
                msg.read = true;
                let raw = serde_json::to_string(&msg)?;
                // KEEPTTL preserves the native expiry.
                let _: () = redis::cmd("SET")
                    .arg(&key)
                    .arg(raw)
                    .arg("KEEPTTL")
                    .query_async(&mut conn)
                    .await
                    .map_err(kv_err)?;
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn purge_expired_messages(&self, teambook: &str) -> StorageResult<u64> {
        let p = prefix(teambook);
        let pattern = format!("{}:msgs:*", p);
        let mut conn = self.c();
        let channels: Vec<String> = {
            let mut iter = conn.scan_match::<_, String>(&pattern).await.map_err(kv_err)?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };
        let mut removed = 0;
        for channel_key in channels {
            let ids: Vec<i64> = conn.zrange(&channel_key, 0, -1).await.map_err(kv_err)?;
            for id in ids {
                let exists: bool = conn
                    .exists(format!("{}:msg:{}", p, id))
                    .await
                    .map_err(kv_err)?;
                if !exists {
                    let _: () = conn.zrem(&channel_key, id).await.map_err(kv_err)?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Locks
    // ------------------------------------------------------------------

    async fn try_acquire_lock(
        &self,
        teambook: &str,
        resource_id: &str,
        holder: &AiId,
        ttl_secs: i64,
    ) -> StorageResult<LockAttempt> {
        let now = Utc::now();
        let lock = Lock {
            resource_id: resource_id.to_string(),
            held_by: holder.clone(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(ttl_secs),
            teambook: teambook.to_string(),
        };
        #[derive(serde::Serialize, serde::Deserialize)]
        struct StoredLock {
            held_by: String,
            acquired_at: Timestamp,
            expires_at: Timestamp,
            expires_ms: i64,
        }
        let stored = StoredLock {
            held_by: holder.as_str().to_string(),
            acquired_at: lock.acquired_at,
            expires_at: lock.expires_at,
            expires_ms: ms(lock.expires_at),
        };
        let ttl_ms = (ttl_secs.max(1)) * 1000;
        let mut conn = self.c();
        let current: String = redis::Script::new(ACQUIRE_SCRIPT)
            .key(format!("{}:lock:{}", prefix(teambook), resource_id))
            .arg(serde_json::to_string(&stored)?)
            .arg(ms(now))
            .arg(holder.as_str())
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(kv_err)?;
        if current.is_empty() {
            let mut c2 = self.c();
            let _: () = c2
                .sadd(
                    format!("{}:locks:{}", prefix(teambook), holder),
                    resource_id,
                )
                .await
                .map_err(kv_err)?;
            return Ok(LockAttempt::Acquired(lock));
        }
        let existing: StoredLock = serde_json::from_str(&current)?;
        Ok(LockAttempt::Held {
            held_by: AiId::new(existing.held_by),
            expires_at: existing.expires_at,
        })
    }

    async fn release_lock(
        &self,
        teambook: &str,
        resource_id: &str,
        holder: &AiId,
    ) -> StorageResult<ReleaseOutcome> {
        let key = format!("{}:lock:{}", prefix(teambook), resource_id);
        let mut conn = self.c();
        let raw: Option<String> = conn.get(&key).await.map_err(kv_err)?;
        let Some(raw) = raw else {
            return Ok(ReleaseOutcome::NotLocked);
        };
        let current: JsonValue = serde_json::from_str(&raw)?;
        let held_by = current["held_by"].as_str().unwrap_or_default().to_string();
        if held_by != holder.as_str() {
            return Ok(ReleaseOutcome::NotHolder {
                held_by: AiId::new(held_by),
            });
        }
        let _: () = conn.del(&key).await.map_err(kv_err)?;
        let _: () = conn
            .srem(format!("{}:locks:{}", prefix(teambook), holder), resource_id)
            .await
            .map_err(kv_err)?;
        Ok(ReleaseOutcome::Released)
    }

    async fn extend_lock(
        &self,
        teambook: &str,
        resource_id: &str,
        holder: &AiId,
        new_expiry: Timestamp,
    ) -> StorageResult<Option<Lock>> {
        let key = format!("{}:lock:{}", prefix(teambook), resource_id);
        let mut conn = self.c();
        let raw: Option<String> = conn.get(&key).await.map_err(kv_err)?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let mut current: JsonValue = serde_json::from_str(&raw)?;
        if current["held_by"].as_str() != Some(holder.as_str()) {
            return Ok(None);
        }
        let acquired_at = current["acquired_at"]
            .as_str()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        current["expires_at"] = JsonValue::String(new_expiry.to_rfc3339());
        current["expires_ms"] = JsonValue::from(ms(new_expiry));
        let remaining_ms = (new_expiry - Utc::now()).num_milliseconds().max(1);
        let _: () = redis::cmd("SET")
            .arg(&key)
            .arg(serde_json::to_string(&current)?)
            .arg("PX")
            .arg(remaining_ms)
            .query_async(&mut conn)
            .await
            .map_err(kv_err)?;
        Ok(Some(Lock {
            resource_id: resource_id.to_string(),
            held_by: holder.clone(),
            acquired_at,
            expires_at: new_expiry,
            teambook: teambook.to_string(),
        }))
    }

    async fn locks_held_by(&self, teambook: &str, holder: &AiId) -> StorageResult<u64> {
        let p = prefix(teambook);
        let mut conn = self.c();
        let resources: Vec<String> = conn
            .smembers(format!("{}:locks:{}", p, holder))
            .await
            .map_err(kv_err)?;
        let mut live = 0;
        for resource in resources {
            let exists: bool = conn
                .exists(format!("{}:lock:{}", p, resource))
                .await
                .map_err(kv_err)?;
            if exists {
                live += 1;
            } else {
                let _: () = conn
                    .srem(format!("{}:locks:{}", p, holder), &resource)
                    .await
                    .map_err(kv_err)?;
            }
        }
        Ok(live)
    }

    async fn sweep_expired_locks(&self, _teambook: &str) -> StorageResult<u64> {
        // Lock keys carry PX expiry; Redis sweeps them natively.
        Ok(0)
    }

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    async fn insert_task(&self, new: NewTask) -> StorageResult<TaskId> {
        let p = prefix(&new.teambook);
        let id = TaskId::new(self.next_id(&new.teambook, "tasks").await?);
        let task = Task {
            id,
            task: new.task,
            priority: new.priority,
            status: TaskStatus::Pending,
            author: new.author,
            claimed_by: None,
            created: new.created,
            claimed_at: None,
            completed_at: None,
            result: None,
            teambook: new.teambook,
            metadata: new.metadata,
            tamper_hash: new.tamper_hash,
        };
        self.set_json(&format!("{}:task:{}", p, id.as_i64()), &task).await?;
        let created_ms = ms(task.created) as f64;
        // Composite ordering score: higher priority pops first, FIFO within
        // a priority band.
        let pri_score = (9 - task.priority as i64) as f64 * 1e13 + created_ms;
        let mut conn = self.c();
        let _: () = conn
            .zadd(format!("{}:tasks:pending:pri", p), id.as_i64(), pri_score)
            .await
            .map_err(kv_err)?;
        let _: () = conn
            .zadd(format!("{}:tasks:pending:fifo", p), id.as_i64(), created_ms)
            .await
            .map_err(kv_err)?;
        Ok(id)
    }

    async fn pending_task_count(&self, teambook: &str) -> StorageResult<u64> {
        let mut conn = self.c();
        let n: i64 = conn
            .zcard(format!("{}:tasks:pending:fifo", prefix(teambook)))
            .await
            .map_err(kv_err)?;
        Ok(n as u64)
    }

    async fn claim_next_task(
        &self,
        teambook: &str,
        claimer: &AiId,
        prefer_priority: bool,
        now: Timestamp,
    ) -> StorageResult<Option<Task>> {
        let p = prefix(teambook);
        let (primary, sibling) = if prefer_priority {
            ("pri", "fifo")
        } else {
            ("fifo", "pri")
        };
        let mut conn = self.c();
        let popped: String = redis::Script::new(CLAIM_SCRIPT)
            .key(format!("{}:tasks:pending:{}", p, primary))
            .key(format!("{}:tasks:pending:{}", p, sibling))
            .invoke_async(&mut conn)
            .await
            .map_err(kv_err)?;
        if popped.is_empty() {
            return Ok(None);
        }
        let id: i64 = popped.parse().map_err(kv_err)?;
        let key = format!("{}:task:{}", p, id);
        let Some(mut task) = self.get_json::<Task>(&key).await? else {
            return Ok(None);
        };
        task.status = TaskStatus::Claimed;
        task.claimed_by = Some(claimer.clone());
        task.claimed_at = Some(now);
        task.tamper_hash = task.compute_tamper_hash();
        self.set_json(&key, &task).await?;
        Ok(Some(task))
    }

    async fn get_task(&self, teambook: &str, id: TaskId) -> StorageResult<Option<Task>> {
        self.get_json(&format!("{}:task:{}", prefix(teambook), id.as_i64()))
            .await
    }

    async fn complete_task(
        &self,
        teambook: &str,
        id: TaskId,
        caller: &AiId,
        result: Option<String>,
        now: Timestamp,
    ) -> StorageResult<CompleteOutcome> {
        let key = format!("{}:task:{}", prefix(teambook), id.as_i64());
        let Some(mut task) = self.get_json::<Task>(&key).await? else {
            return Ok(CompleteOutcome::NotFound);
        };
        if task.status == TaskStatus::Completed {
            return Ok(CompleteOutcome::AlreadyCompleted);
        }
        if task.claimed_by.as_ref() != Some(caller) {
            return Ok(CompleteOutcome::NotClaimer);
        }
        task.status = TaskStatus::Completed;
        task.completed_at = Some(now);
        task.result = result;
        task.tamper_hash = task.compute_tamper_hash();
        self.set_json(&key, &task).await?;
        Ok(CompleteOutcome::Completed(task))
    }

    // ------------------------------------------------------------------
    // Watches and events
    // ------------------------------------------------------------------

    async fn upsert_watch(&self, watch: &Watch) -> StorageResult<bool> {
        let p = prefix(&watch.teambook);
        let field = format!("{}:{}", watch.item_type.as_str(), watch.item_id);
        let raw = serde_json::to_string(watch)?;
        let mut conn = self.c();
        let created: bool = conn
            .hset(format!("{}:watch:{}", p, watch.ai_id), &field, &raw)
            .await
            .map_err(kv_err)?;
        let _: () = conn
            .hset(
                format!("{}:watchers:{}:{}", p, watch.item_type.as_str(), watch.item_id),
                watch.ai_id.as_str(),
                &raw,
            )
            .await
            .map_err(kv_err)?;
        Ok(created)
    }

    async fn delete_watch(
        &self,
        teambook: &str,
        ai_id: &AiId,
        item_type: ItemType,
        item_id: &str,
    ) -> StorageResult<bool> {
        let p = prefix(teambook);
        let field = format!("{}:{}", item_type.as_str(), item_id);
        let mut conn = self.c();
        let removed: i64 = conn
            .hdel(format!("{}:watch:{}", p, ai_id), &field)
            .await
            .map_err(kv_err)?;
        let _: () = conn
            .hdel(
                format!("{}:watchers:{}:{}", p, item_type.as_str(), item_id),
                ai_id.as_str(),
            )
            .await
            .map_err(kv_err)?;
        Ok(removed > 0)
    }

    async fn count_watches(&self, teambook: &str, ai_id: &AiId) -> StorageResult<u64> {
        let mut conn = self.c();
        let n: i64 = conn
            .hlen(format!("{}:watch:{}", prefix(teambook), ai_id))
            .await
            .map_err(kv_err)?;
        Ok(n as u64)
    }

    async fn watches_for_ai(&self, teambook: &str, ai_id: &AiId) -> StorageResult<Vec<Watch>> {
        let mut conn = self.c();
        let map: HashMap<String, String> = conn
            .hgetall(format!("{}:watch:{}", prefix(teambook), ai_id))
            .await
            .map_err(kv_err)?;
        Ok(map
            .into_values()
            .filter_map(|raw| serde_json::from_str(&raw).ok())
            .collect())
    }

    async fn watchers_for_item(
        &self,
        teambook: &str,
        item_type: ItemType,
        item_id: &str,
    ) -> StorageResult<Vec<Watch>> {
        let mut conn = self.c();
        let map: HashMap<String, String> = conn
            .hgetall(format!(
                "{}:watchers:{}:{}",
                prefix(teambook),
                item_type.as_str(),
                item_id
            ))
            .await
            .map_err(kv_err)?;
        Ok(map
            .into_values()
            .filter_map(|raw| serde_json::from_str(&raw).ok())
            .collect())
    }

    async fn insert_event(&self, event: NewEvent, recipients: &[AiId]) -> StorageResult<EventId> {
        let p = prefix(&event.teambook);
        let id = EventId::new(self.next_id(&event.teambook, "events").await?);
        let stored = WatchEvent {
            id,
            item_type: event.item_type,
            item_id: event.item_id,
            event_type: event.event_type,
            actor: event.actor,
            summary: event.summary,
            created: event.created,
            expires_at: event.expires_at,
            teambook: event.teambook.clone(),
            metadata: event.metadata,
        };
        let key = format!("{}:event:{}", p, id.as_i64());
        self.set_json(&key, &stored).await?;
        let mut conn = self.c();
        let _: () = conn
            .expire_at(&key, stored.expires_at.timestamp())
            .await
            .map_err(kv_err)?;
        for ai in recipients {
            let _: () = conn
                .zadd(format!("{}:inbox:{}", p, ai), id.as_i64(), ms(stored.created))
                .await
                .map_err(kv_err)?;
        }
        Ok(id)
    }

    async fn events_for(
        &self,
        teambook: &str,
        ai_id: &AiId,
        since: Timestamp,
        limit: usize,
        mark_seen: bool,
    ) -> StorageResult<Vec<WatchEvent>> {
        let p = prefix(teambook);
        let mut conn = self.c();
        let ids: Vec<i64> = conn
            .zrevrangebyscore(
                format!("{}:inbox:{}", p, ai_id),
                "+inf",
                format!("({}", ms(since)),
            )
            .await
            .map_err(kv_err)?;
        let mut out = Vec::new();
        for id in ids.into_iter().take(limit) {
            if let Some(event) = self
                .get_json::<WatchEvent>(&format!("{}:event:{}", p, id))
                .await?
            {
                if mark_seen {
                    let _: () = conn
                        .sadd(format!("{}:seen:{}", p, ai_id), id)
                        .await
                        .map_err(kv_err)?;
                }
                out.push(event);
            }
        }
        Ok(out)
    }

    async fn purge_expired_events(&self, teambook: &str) -> StorageResult<u64> {
        // Event bodies expire natively; trim inbox members whose body is
        // gone.
        let p = prefix(teambook);
        let pattern = format!("{}:inbox:*", p);
        let mut conn = self.c();
        let inboxes: Vec<String> = {
            let mut iter = conn.scan_match::<_, String>(&pattern).await.map_err(kv_err)?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };
        let mut removed = 0;
        for inbox in inboxes {
            let ids: Vec<i64> = conn.zrange(&inbox, 0, -1).await.map_err(kv_err)?;
            for id in ids {
                let exists: bool = conn
                    .exists(format!("{}:event:{}", p, id))
                    .await
                    .map_err(kv_err)?;
                if !exists {
                    let _: () = conn.zrem(&inbox, id).await.map_err(kv_err)?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Presence
    // ------------------------------------------------------------------

    async fn upsert_presence(&self, presence: &Presence) -> StorageResult<()> {
        let mut conn = self.c();
        let existing: Option<String> = conn
            .hget(format!("{}:presence", prefix(&presence.teambook)), presence.ai_id.as_str())
            .await
            .map_err(kv_err)?;
        let mut merged = presence.clone();
        if merged.status_message.is_none() {
            if let Some(old) = existing.and_then(|raw| serde_json::from_str::<Presence>(&raw).ok())
            {
                merged.status_message = old.status_message;
            }
        }
        conn.hset(
            format!("{}:presence", prefix(&presence.teambook)),
            presence.ai_id.as_str(),
            serde_json::to_string(&merged)?,
        )
        .await
        .map_err(kv_err)
    }

    async fn active_presences(
        &self,
        teambook: &str,
        since: Timestamp,
    ) -> StorageResult<Vec<Presence>> {
        let mut conn = self.c();
        let map: HashMap<String, String> = conn
            .hgetall(format!("{}:presence", prefix(teambook)))
            .await
            .map_err(kv_err)?;
        let mut out: Vec<Presence> = map
            .into_values()
            .filter_map(|raw| serde_json::from_str::<Presence>(&raw).ok())
            .filter(|presence| presence.last_seen > since)
            .collect();
        out.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        Ok(out)
    }

    async fn prune_presence(&self, teambook: &str, before: Timestamp) -> StorageResult<u64> {
        let key = format!("{}:presence", prefix(teambook));
        let mut conn = self.c();
        let map: HashMap<String, String> = conn.hgetall(&key).await.map_err(kv_err)?;
        let mut pruned = 0;
        for (ai, raw) in map {
            if let Ok(presence) = serde_json::from_str::<Presence>(&raw) {
                if presence.last_seen < before {
                    let _: () = conn.hdel(&key, ai).await.map_err(kv_err)?;
                    pruned += 1;
                }
            }
        }
        Ok(pruned)
    }

    // ------------------------------------------------------------------
    // Vault
    // ------------------------------------------------------------------

    async fn vault_set(&self, teambook: &str, item: &VaultItem) -> StorageResult<()> {
        let mut conn = self.c();
        conn.hset(
            format!("{}:vault", prefix(teambook)),
            &item.key,
            serde_json::to_string(item)?,
        )
        .await
        .map_err(kv_err)
    }

    async fn vault_get(&self, teambook: &str, key: &str) -> StorageResult<Option<VaultItem>> {
        let mut conn = self.c();
        let raw: Option<String> = conn
            .hget(format!("{}:vault", prefix(teambook)), key)
            .await
            .map_err(kv_err)?;
        Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
    }

    async fn vault_delete(&self, teambook: &str, key: &str) -> StorageResult<bool> {
        let mut conn = self.c();
        let removed: i64 = conn
            .hdel(format!("{}:vault", prefix(teambook)), key)
            .await
            .map_err(kv_err)?;
        Ok(removed > 0)
    }

    async fn vault_list(&self, teambook: &str) -> StorageResult<Vec<VaultEntryInfo>> {
        let mut conn = self.c();
        let map: HashMap<String, String> = conn
            .hgetall(format!("{}:vault", prefix(teambook)))
            .await
            .map_err(kv_err)?;
        let mut out: Vec<VaultEntryInfo> = map
            .into_values()
            .filter_map(|raw| serde_json::from_str::<VaultItem>(&raw).ok())
            .map(|item| VaultEntryInfo {
                key: item.key,
                updated: item.updated,
                author: item.author,
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Evolution
    // ------------------------------------------------------------------

    async fn insert_contribution(
        &self,
        teambook: &str,
        new: NewContribution,
    ) -> StorageResult<ContributionId> {
        let p = prefix(teambook);
        let id = ContributionId::new(self.next_id(teambook, "contributions").await?);
        let contribution = Contribution {
            id,
            evolution_id: new.evolution_id,
            author: new.author,
            content: new.content,
            approach: new.approach,
            created: new.created,
            avg_score: 0.0,
            rank_count: 0,
        };
        self.set_json(&format!("{}:contrib:{}", p, id.as_i64()), &contribution)
            .await?;
        let mut conn = self.c();
        let _: () = conn
            .sadd(
                format!("{}:contribs:{}", p, new.evolution_id.as_i64()),
                id.as_i64(),
            )
            .await
            .map_err(kv_err)?;
        Ok(id)
    }

    async fn contributions_for(
        &self,
        teambook: &str,
        evolution_id: NoteId,
    ) -> StorageResult<Vec<Contribution>> {
        let p = prefix(teambook);
        let mut conn = self.c();
        let ids: Vec<i64> = conn
            .smembers(format!("{}:contribs:{}", p, evolution_id.as_i64()))
            .await
            .map_err(kv_err)?;
        let mut out = Vec::new();
        for id in ids {
            if let Some(contribution) = self
                .get_json::<Contribution>(&format!("{}:contrib:{}", p, id))
                .await?
            {
                out.push(contribution);
            }
        }
        out.sort_by(|a, b| {
            b.avg_score
                .partial_cmp(&a.avg_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.created.cmp(&b.created))
        });
        Ok(out)
    }

    async fn get_contribution(
        &self,
        teambook: &str,
        id: ContributionId,
    ) -> StorageResult<Option<Contribution>> {
        self.get_json(&format!("{}:contrib:{}", prefix(teambook), id.as_i64()))
            .await
    }

    async fn count_contributions_by(
        &self,
        teambook: &str,
        evolution_id: NoteId,
        author: &AiId,
    ) -> StorageResult<u64> {
        Ok(self
            .contributions_for(teambook, evolution_id)
            .await?
            .iter()
            .filter(|c| &c.author == author)
            .count() as u64)
    }

    async fn upsert_ranking(
        &self,
        teambook: &str,
        ranking: &Ranking,
    ) -> StorageResult<(f64, i64)> {
        let p = prefix(teambook);
        let ranks_key = format!("{}:ranks:{}", p, ranking.contribution_id.as_i64());
        let mut conn = self.c();
        let _: () = conn
            .hset(
                &ranks_key,
                ranking.ranked_by.as_str(),
                serde_json::to_string(ranking)?,
            )
            .await
            .map_err(kv_err)?;
        let all: HashMap<String, String> = conn.hgetall(&ranks_key).await.map_err(kv_err)?;
        let scores: Vec<f64> = all
            .values()
            .filter_map(|raw| serde_json::from_str::<Ranking>(raw).ok())
            .map(|r| r.score)
            .collect();
        let count = scores.len() as i64;
        let avg = if count > 0 {
            scores.iter().sum::<f64>() / count as f64
        } else {
            0.0
        };
        let contrib_key = format!("{}:contrib:{}", p, ranking.contribution_id.as_i64());
        if let Some(mut contribution) = self.get_json::<Contribution>(&contrib_key).await? {
            contribution.avg_score = avg;
            contribution.rank_count = count;
            self.set_json(&contrib_key, &contribution).await?;
        }
        Ok((avg, count))
    }

    async fn get_vote(
        &self,
        teambook: &str,
        evolution_id: NoteId,
        voter: &AiId,
    ) -> StorageResult<Option<Vote>> {
        let mut conn = self.c();
        let raw: Option<String> = conn
            .hget(
                format!("{}:votes:{}", prefix(teambook), evolution_id.as_i64()),
                voter.as_str(),
            )
            .await
            .map_err(kv_err)?;
        Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
    }

    async fn upsert_vote(&self, teambook: &str, vote: &Vote) -> StorageResult<()> {
        let mut conn = self.c();
        conn.hset(
            format!("{}:votes:{}", prefix(teambook), vote.evolution_id.as_i64()),
            vote.voter.as_str(),
            serde_json::to_string(vote)?,
        )
        .await
        .map_err(kv_err)
    }

    async fn insert_synthesis(&self, record: NewSynthesis) -> StorageResult<i64> {
        let id = self.next_id(&record.teambook, "synthesis").await?;
        let stored = SynthesisRecord {
            id,
            evolution_id: record.evolution_id,
            strategy: record.strategy,
            output_path: record.output_path,
            contribution_count: record.contribution_count,
            author: record.author,
            created: record.created,
            teambook: record.teambook.clone(),
        };
        let mut conn = self.c();
        let _: () = conn
            .zadd(
                format!("{}:synthesis", prefix(&record.teambook)),
                serde_json::to_string(&stored)?,
                ms(stored.created),
            )
            .await
            .map_err(kv_err)?;
        Ok(id)
    }

    async fn synthesis_count_since(
        &self,
        teambook: &str,
        since: Timestamp,
    ) -> StorageResult<u64> {
        let mut conn = self.c();
        let n: i64 = conn
            .zcount(format!("{}:synthesis", prefix(teambook)), ms(since), "+inf")
            .await
            .map_err(kv_err)?;
        Ok(n as u64)
    }

    async fn insert_conflicts(
        &self,
        teambook: &str,
        conflicts: &[ContributionConflict],
    ) -> StorageResult<()> {
        let mut conn = self.c();
        for conflict in conflicts {
            let _: () = conn
                .sadd(
                    format!(
                        "{}:conflicts:{}",
                        prefix(teambook),
                        conflict.evolution_id.as_i64()
                    ),
                    serde_json::to_string(conflict)?,
                )
                .await
                .map_err(kv_err)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Coordination events and registry
    // ------------------------------------------------------------------

    async fn insert_coordination_event(&self, event: NewCoordinationEvent) -> StorageResult<i64> {
        let id = self.next_id(&event.teambook, "coord").await?;
        let stored = CoordinationEvent {
            id,
            event_type: event.event_type,
            ai_id: event.ai_id,
            task_id: event.task_id,
            summary: event.summary,
            created: event.created,
            metadata: event.metadata,
            teambook: event.teambook.clone(),
        };
        let mut conn = self.c();
        let _: () = conn
            .zadd(
                format!("{}:coord", prefix(&event.teambook)),
                serde_json::to_string(&stored)?,
                ms(stored.created),
            )
            .await
            .map_err(kv_err)?;
        Ok(id)
    }

    async fn coordination_events(
        &self,
        teambook: &str,
        since: Timestamp,
        limit: usize,
    ) -> StorageResult<Vec<CoordinationEvent>> {
        let mut conn = self.c();
        let raws: Vec<String> = conn
            .zrevrangebyscore(
                format!("{}:coord", prefix(teambook)),
                "+inf",
                format!("({}", ms(since)),
            )
            .await
            .map_err(kv_err)?;
        Ok(raws
            .into_iter()
            .take(limit)
            .filter_map(|raw| serde_json::from_str(&raw).ok())
            .collect())
    }

    async fn touch_teambook(&self, name: &str, creator: &AiId) -> StorageResult<()> {
        let mut conn = self.c();
        let existing: Option<String> = conn
            .hget("teambook:registry", name)
            .await
            .map_err(kv_err)?;
        let now = Utc::now();
        let entry = match existing.and_then(|raw| serde_json::from_str::<JsonValue>(&raw).ok()) {
            Some(mut entry) => {
                entry["last_active"] = JsonValue::String(now.to_rfc3339());
                entry
            }
            None => serde_json::json!({
                "name": name,
                "created": now.to_rfc3339(),
                "created_by": creator.as_str(),
                "last_active": now.to_rfc3339(),
            }),
        };
        conn.hset("teambook:registry", name, entry.to_string())
            .await
            .map_err(kv_err)
    }

    async fn list_teambooks(&self) -> StorageResult<Vec<(String, Timestamp, Option<Timestamp>)>> {
        let mut conn = self.c();
        let map: HashMap<String, String> =
            conn.hgetall("teambook:registry").await.map_err(kv_err)?;
        let mut out = Vec::new();
        for (name, raw) in map {
            let Ok(entry) = serde_json::from_str::<JsonValue>(&raw) else {
                continue;
            };
            let parse = |v: &JsonValue| {
                v.as_str()
                    .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.with_timezone(&Utc))
            };
            let Some(created) = parse(&entry["created"]) else {
                continue;
            };
            out.push((name, created, parse(&entry["last_active"])));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Stats
    // ------------------------------------------------------------------

    async fn record_operation(
        &self,
        teambook: &str,
        operation: &str,
        _dur_ms: Option<i64>,
        _author: &AiId,
    ) -> StorageResult<()> {
        let mut conn = self.c();
        let _: () = conn
            .hincr(format!("{}:stats:ops", prefix(teambook)), operation, 1)
            .await
            .map_err(kv_err)?;
        let _: () = conn
            .incr(format!("{}:stats:count", prefix(teambook)), 1)
            .await
            .map_err(kv_err)?;
        Ok(())
    }

    async fn get_stats(&self, teambook: &str) -> StorageResult<StorageStats> {
        let p = prefix(teambook);
        let mut conn = self.c();
        let notes: i64 = conn.zcard(format!("{}:notes:timeline", p)).await.map_err(kv_err)?;
        let operations: Option<i64> = conn.get(format!("{}:stats:count", p)).await.map_err(kv_err)?;
        let sessions: Option<i64> = conn.get(format!("{}:seq:sessions", p)).await.map_err(kv_err)?;
        let messages: Option<i64> = conn.get(format!("{}:seq:messages", p)).await.map_err(kv_err)?;
        let tasks: Option<i64> = conn.get(format!("{}:seq:tasks", p)).await.map_err(kv_err)?;
        let entities: i64 = conn.hlen(format!("{}:entity:names", p)).await.map_err(kv_err)?;
        Ok(StorageStats {
            notes: notes as u64,
            edges: 0,
            entities: entities as u64,
            sessions: sessions.unwrap_or(0) as u64,
            messages: messages.unwrap_or(0) as u64,
            tasks: tasks.unwrap_or(0) as u64,
            operations: operations.unwrap_or(0) as u64,
        })
    }

    // ------------------------------------------------------------------
    // Pub/sub
    // ------------------------------------------------------------------

    async fn publish(&self, channel: &str, payload: &str) -> StorageResult<()> {
        let mut conn = self.c();
        let _: () = conn.publish(channel, payload).await.map_err(kv_err)?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> StorageResult<Option<RemoteEventStream>> {
        // Dedicated non-pooled connection; pub/sub connections must not be
        // shared with command traffic.
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        pubsub.subscribe(channel).await.map_err(kv_err)?;
        let (tx, rx) = mpsc::channel(256);
        let channel = channel.to_string();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let Ok(payload) = msg.get_payload::<String>() else {
                    continue;
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
            debug!(channel, "pub/sub listener stopped");
        });
        Ok(Some(rx))
    }
}

impl RedisBackend {
    async fn open_facts_for(
        &self,
        teambook: &str,
        entity: EntityId,
        relation: &str,
    ) -> StorageResult<Vec<EntityFact>> {
        let p = prefix(teambook);
        let mut conn = self.c();
        let ids: Vec<i64> = conn
            .smembers(format!("{}:facts:{}:{}", p, entity.as_i64(), relation))
            .await
            .map_err(kv_err)?;
        let mut out = Vec::new();
        for id in ids {
            if let Some(fact) = self
                .get_json::<EntityFact>(&format!("{}:fact:{}", p, id))
                .await?
            {
                if fact.valid_to.is_none() {
                    out.push(fact);
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_note_hash_roundtrip() {
        let note = Note {
            id: NoteId::new(7),
            content: "hello".to_string(),
            summary: Some("hi".to_string()),
            tags: vec!["a".to_string(), "b".to_string()],
            pinned: true,
            author: AiId::from("alpha-001"),
            owner: None,
            note_type: "general".to_string(),
            parent_id: Some(NoteId::new(3)),
            teambook: "demo".to_string(),
            created: Utc::now(),
            session_id: Some(SessionId::new(2)),
            linked_items: vec![],
            pagerank: 0.25,
            has_vector: false,
            representation_policy: RepresentationPolicy::Verbatim,
            metadata: serde_json::json!({"k": "v"}),
            tamper_hash: "hash".to_string(),
        };
        let fields = note_to_hash(&note).expect("encode");
        let map: HashMap<String, String> = fields.into_iter().collect();
        let back = note_from_hash(&map).expect("decode");
        assert_eq!(back.id, note.id);
        assert_eq!(back.tags, note.tags);
        assert_eq!(back.parent_id, note.parent_id);
        assert_eq!(back.representation_policy, note.representation_policy);
        assert_eq!(back.metadata, note.metadata);
        assert_eq!(back.pagerank, note.pagerank);
    }

    #[test]
    fn test_priority_score_ordering() {
        // Higher priority pops first; FIFO within a band.
        let score = |priority: u8, created_ms: i64| {
            (9 - priority as i64) as f64 * 1e13 + created_ms as f64
        };
        assert!(score(9, 2000) < score(8, 1000));
        assert!(score(5, 1000) < score(5, 2000));
    }
}
