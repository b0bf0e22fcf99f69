//! Remote PostgreSQL backend.
//!
//! A bounded deadpool connection pool over one shared database; all tables
//! carry a `teambook_name` column for scoping. Lock acquisition and task
//! claim use row-level locking (`FOR UPDATE` / `FOR UPDATE SKIP LOCKED`) so
//! multi-process coordination is race-free.

use crate::adapter::*;
use async_trait::async_trait;
use chrono::Utc;
use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use serde_json::Value as JsonValue;
use std::str::FromStr;
use teambook_core::*;
use tokio_postgres::{NoTls, Row};
use tracing::info;

/// PostgreSQL storage over a bounded connection pool.
pub struct PostgresBackend {
    pool: Pool,
}

fn pg_err(err: impl std::fmt::Display) -> StorageError {
    StorageError::Query(err.to_string())
}

fn pool_err(err: impl std::fmt::Display) -> StorageError {
    StorageError::Unavailable(err.to_string())
}

impl PostgresBackend {
    /// Connect, verify liveness, and ensure the schema exists.
    pub async fn connect(url: &str, max_size: usize) -> StorageResult<Self> {
        let mut cfg = Config::new();
        cfg.url = Some(url.to_string());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(deadpool_postgres::PoolConfig::new(max_size));

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(pool_err)?;

        let backend = Self { pool };
        backend.ensure_schema().await?;
        info!(max_size, "postgres storage pool ready");
        Ok(backend)
    }

    async fn conn(&self) -> StorageResult<deadpool_postgres::Object> {
        self.pool.get().await.map_err(pool_err)
    }

    async fn ensure_schema(&self) -> StorageResult<()> {
        let conn = self.conn().await?;
        conn.batch_execute(SCHEMA).await.map_err(pg_err)
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS notes (
    id BIGSERIAL PRIMARY KEY,
    content TEXT NOT NULL,
    summary TEXT,
    tags TEXT[] NOT NULL DEFAULT '{}',
    pinned BOOLEAN NOT NULL DEFAULT FALSE,
    author VARCHAR(255) NOT NULL,
    owner VARCHAR(255),
    type VARCHAR(100) NOT NULL DEFAULT 'general',
    parent_id BIGINT,
    teambook_name VARCHAR(255) NOT NULL,
    created TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    session_id BIGINT,
    linked_items TEXT[] NOT NULL DEFAULT '{}',
    pagerank DOUBLE PRECISION NOT NULL DEFAULT 0.0,
    has_vector BOOLEAN NOT NULL DEFAULT FALSE,
    representation_policy VARCHAR(20) NOT NULL DEFAULT 'default',
    metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
    tamper_hash TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_notes_teambook ON notes(teambook_name, created DESC);
CREATE INDEX IF NOT EXISTS idx_notes_pinned ON notes(teambook_name, pinned DESC, created DESC);
CREATE INDEX IF NOT EXISTS idx_notes_pagerank ON notes(teambook_name, pagerank DESC);
CREATE INDEX IF NOT EXISTS idx_notes_content_gin
    ON notes USING gin(to_tsvector('english', content));

CREATE TABLE IF NOT EXISTS edges (
    teambook_name VARCHAR(255) NOT NULL,
    from_id BIGINT NOT NULL,
    to_id BIGINT NOT NULL,
    type VARCHAR(100) NOT NULL,
    weight DOUBLE PRECISION NOT NULL DEFAULT 1.0,
    created TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    valid_from TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    valid_to TIMESTAMPTZ,
    source_note_id BIGINT,
    metadata JSONB,
    PRIMARY KEY(teambook_name, from_id, to_id, type)
);
CREATE INDEX IF NOT EXISTS idx_edges_from ON edges(teambook_name, from_id);
CREATE INDEX IF NOT EXISTS idx_edges_to ON edges(teambook_name, to_id);

CREATE TABLE IF NOT EXISTS entities (
    id BIGSERIAL PRIMARY KEY,
    teambook_name VARCHAR(255) NOT NULL,
    name VARCHAR(255) NOT NULL,
    type VARCHAR(100) NOT NULL,
    first_seen TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    last_seen TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    mention_count INTEGER NOT NULL DEFAULT 1,
    UNIQUE(teambook_name, name)
);

CREATE TABLE IF NOT EXISTS entity_notes (
    entity_id BIGINT NOT NULL,
    note_id BIGINT NOT NULL,
    PRIMARY KEY(entity_id, note_id)
);

CREATE TABLE IF NOT EXISTS entity_facts (
    id BIGSERIAL PRIMARY KEY,
    teambook_name VARCHAR(255) NOT NULL,
    entity_id BIGINT NOT NULL,
    relation VARCHAR(100) NOT NULL,
    value TEXT NOT NULL,
    target_entity_id BIGINT,
    valid_from TIMESTAMPTZ NOT NULL,
    valid_to TIMESTAMPTZ,
    source_note_id BIGINT NOT NULL,
    confidence DOUBLE PRECISION NOT NULL DEFAULT 0.7,
    metadata JSONB
);
CREATE INDEX IF NOT EXISTS idx_entity_facts_lookup ON entity_facts(entity_id, relation);

CREATE TABLE IF NOT EXISTS sessions (
    id BIGSERIAL PRIMARY KEY,
    teambook_name VARCHAR(255) NOT NULL,
    started TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    ended TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    note_count INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS messages (
    id BIGSERIAL PRIMARY KEY,
    channel VARCHAR(50) NOT NULL,
    from_ai VARCHAR(100) NOT NULL,
    to_ai VARCHAR(100),
    content TEXT NOT NULL,
    summary TEXT,
    reply_to BIGINT,
    created TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    read BOOLEAN NOT NULL DEFAULT FALSE,
    expires_at TIMESTAMPTZ NOT NULL,
    teambook_name VARCHAR(255) NOT NULL,
    envelope JSONB
);
CREATE INDEX IF NOT EXISTS idx_msg_channel ON messages(teambook_name, channel, created DESC);
CREATE INDEX IF NOT EXISTS idx_msg_to_ai ON messages(to_ai, read, created DESC);
CREATE INDEX IF NOT EXISTS idx_msg_expires ON messages(expires_at);

CREATE TABLE IF NOT EXISTS locks (
    teambook_name VARCHAR(255) NOT NULL,
    resource_id TEXT NOT NULL,
    held_by VARCHAR(255) NOT NULL,
    acquired_at TIMESTAMPTZ NOT NULL,
    expires_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY(teambook_name, resource_id)
);

CREATE TABLE IF NOT EXISTS tasks (
    id BIGSERIAL PRIMARY KEY,
    task TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 5,
    status VARCHAR(20) NOT NULL DEFAULT 'pending',
    author VARCHAR(255) NOT NULL,
    claimed_by VARCHAR(255),
    created TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    claimed_at TIMESTAMPTZ,
    completed_at TIMESTAMPTZ,
    result TEXT,
    teambook_name VARCHAR(255) NOT NULL,
    metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
    tamper_hash TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_claim
    ON tasks(teambook_name, status, priority DESC, created);

CREATE TABLE IF NOT EXISTS watches (
    ai_id VARCHAR(255) NOT NULL,
    item_type VARCHAR(20) NOT NULL,
    item_id TEXT NOT NULL,
    event_types TEXT[] NOT NULL DEFAULT '{}',
    last_activity TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    teambook_name VARCHAR(255) NOT NULL,
    PRIMARY KEY(teambook_name, ai_id, item_type, item_id)
);

CREATE TABLE IF NOT EXISTS events (
    id BIGSERIAL PRIMARY KEY,
    item_type VARCHAR(20) NOT NULL,
    item_id TEXT NOT NULL,
    event_type VARCHAR(50) NOT NULL,
    actor VARCHAR(255) NOT NULL,
    summary TEXT,
    created TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    expires_at TIMESTAMPTZ NOT NULL,
    teambook_name VARCHAR(255) NOT NULL,
    metadata JSONB
);
CREATE INDEX IF NOT EXISTS idx_events_created ON events(teambook_name, created DESC);

CREATE TABLE IF NOT EXISTS event_deliveries (
    event_id BIGINT NOT NULL,
    ai_id VARCHAR(255) NOT NULL,
    seen BOOLEAN NOT NULL DEFAULT FALSE,
    PRIMARY KEY(event_id, ai_id)
);

CREATE TABLE IF NOT EXISTS presence (
    teambook_name VARCHAR(255) NOT NULL,
    ai_id VARCHAR(255) NOT NULL,
    last_seen TIMESTAMPTZ NOT NULL,
    last_operation VARCHAR(100) NOT NULL,
    status_message TEXT,
    PRIMARY KEY(teambook_name, ai_id)
);

CREATE TABLE IF NOT EXISTS vault (
    teambook_name VARCHAR(255) NOT NULL,
    key VARCHAR(255) NOT NULL,
    encrypted_value BYTEA NOT NULL,
    created TIMESTAMPTZ NOT NULL,
    updated TIMESTAMPTZ NOT NULL,
    author VARCHAR(255) NOT NULL,
    PRIMARY KEY(teambook_name, key)
);

CREATE TABLE IF NOT EXISTS contributions (
    id BIGSERIAL PRIMARY KEY,
    teambook_name VARCHAR(255) NOT NULL,
    evolution_id BIGINT NOT NULL,
    author VARCHAR(255) NOT NULL,
    content TEXT NOT NULL,
    approach TEXT,
    created TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    avg_score DOUBLE PRECISION NOT NULL DEFAULT 0.0,
    rank_count BIGINT NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_contrib_evo ON contributions(teambook_name, evolution_id);

CREATE TABLE IF NOT EXISTS rankings (
    contribution_id BIGINT NOT NULL,
    ranked_by VARCHAR(255) NOT NULL,
    score DOUBLE PRECISION NOT NULL,
    reason TEXT,
    created TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY(contribution_id, ranked_by)
);

CREATE TABLE IF NOT EXISTS votes (
    teambook_name VARCHAR(255) NOT NULL,
    evolution_id BIGINT NOT NULL,
    voter VARCHAR(255) NOT NULL,
    preferred BIGINT[] NOT NULL DEFAULT '{}',
    change_count BIGINT NOT NULL DEFAULT 0,
    updated TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY(teambook_name, evolution_id, voter)
);

CREATE TABLE IF NOT EXISTS synthesis_history (
    id BIGSERIAL PRIMARY KEY,
    evolution_id BIGINT NOT NULL,
    strategy VARCHAR(20) NOT NULL,
    output_path TEXT NOT NULL,
    contribution_count BIGINT NOT NULL,
    author VARCHAR(255) NOT NULL,
    created TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    teambook_name VARCHAR(255) NOT NULL
);

CREATE TABLE IF NOT EXISTS contribution_conflicts (
    teambook_name VARCHAR(255) NOT NULL,
    evolution_id BIGINT NOT NULL,
    contribution_a BIGINT NOT NULL,
    contribution_b BIGINT NOT NULL,
    topic VARCHAR(100) NOT NULL,
    detected TIMESTAMPTZ NOT NULL,
    PRIMARY KEY(teambook_name, evolution_id, contribution_a, contribution_b, topic)
);

CREATE TABLE IF NOT EXISTS coordination_events (
    id BIGSERIAL PRIMARY KEY,
    event_type VARCHAR(50) NOT NULL,
    ai_id VARCHAR(255) NOT NULL,
    task_id BIGINT,
    summary TEXT,
    created TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    metadata JSONB,
    teambook_name VARCHAR(255) NOT NULL
);

CREATE TABLE IF NOT EXISTS teambooks (
    name VARCHAR(255) PRIMARY KEY,
    created TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    created_by VARCHAR(255) NOT NULL,
    last_active TIMESTAMPTZ
);

CREATE TABLE IF NOT EXISTS stats (
    id BIGSERIAL PRIMARY KEY,
    teambook_name VARCHAR(255) NOT NULL,
    operation VARCHAR(100) NOT NULL,
    ts TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    dur_ms BIGINT,
    author VARCHAR(255) NOT NULL
);
"#;

// ============================================================================
// ROW MAPPING
// ============================================================================

const NOTE_COLUMNS: &str = "id, content, summary, tags, pinned, author, owner, type, parent_id, \
    teambook_name, created, session_id, linked_items, pagerank, has_vector, \
    representation_policy, metadata, tamper_hash";

fn note_from_row(row: &Row) -> StorageResult<Note> {
    Ok(Note {
        id: NoteId::new(row.try_get(0).map_err(pg_err)?),
        content: row.try_get(1).map_err(pg_err)?,
        summary: row.try_get(2).map_err(pg_err)?,
        tags: row.try_get(3).map_err(pg_err)?,
        pinned: row.try_get(4).map_err(pg_err)?,
        author: AiId::new(row.try_get::<_, String>(5).map_err(pg_err)?),
        owner: row
            .try_get::<_, Option<String>>(6)
            .map_err(pg_err)?
            .map(AiId::new),
        note_type: row.try_get(7).map_err(pg_err)?,
        parent_id: row
            .try_get::<_, Option<i64>>(8)
            .map_err(pg_err)?
            .map(NoteId::new),
        teambook: row.try_get(9).map_err(pg_err)?,
        created: row.try_get(10).map_err(pg_err)?,
        session_id: row
            .try_get::<_, Option<i64>>(11)
            .map_err(pg_err)?
            .map(SessionId::new),
        linked_items: row.try_get(12).map_err(pg_err)?,
        pagerank: row.try_get(13).map_err(pg_err)?,
        has_vector: row.try_get(14).map_err(pg_err)?,
        representation_policy: RepresentationPolicy::from_str(
            row.try_get::<_, String>(15).map_err(pg_err)?.as_str(),
        )
        .unwrap_or_default(),
        metadata: row.try_get(16).map_err(pg_err)?,
        tamper_hash: row.try_get(17).map_err(pg_err)?,
    })
}

const TASK_COLUMNS: &str = "id, task, priority, status, author, claimed_by, created, claimed_at, \
    completed_at, result, teambook_name, metadata, tamper_hash";

fn task_from_row(row: &Row) -> StorageResult<Task> {
    Ok(Task {
        id: TaskId::new(row.try_get(0).map_err(pg_err)?),
        task: row.try_get(1).map_err(pg_err)?,
        priority: row.try_get::<_, i32>(2).map_err(pg_err)? as u8,
        status: TaskStatus::from_str(row.try_get::<_, String>(3).map_err(pg_err)?.as_str())
            .unwrap_or(TaskStatus::Pending),
        author: AiId::new(row.try_get::<_, String>(4).map_err(pg_err)?),
        claimed_by: row
            .try_get::<_, Option<String>>(5)
            .map_err(pg_err)?
            .map(AiId::new),
        created: row.try_get(6).map_err(pg_err)?,
        claimed_at: row.try_get(7).map_err(pg_err)?,
        completed_at: row.try_get(8).map_err(pg_err)?,
        result: row.try_get(9).map_err(pg_err)?,
        teambook: row.try_get(10).map_err(pg_err)?,
        metadata: row.try_get(11).map_err(pg_err)?,
        tamper_hash: row.try_get(12).map_err(pg_err)?,
    })
}

const MESSAGE_COLUMNS: &str =
    "id, channel, from_ai, to_ai, content, summary, reply_to, created, read, expires_at, \
     teambook_name, envelope";

fn message_from_row(row: &Row) -> StorageResult<Message> {
    Ok(Message {
        id: MessageId::new(row.try_get(0).map_err(pg_err)?),
        channel: row.try_get(1).map_err(pg_err)?,
        from_ai: AiId::new(row.try_get::<_, String>(2).map_err(pg_err)?),
        to_ai: row
            .try_get::<_, Option<String>>(3)
            .map_err(pg_err)?
            .map(AiId::new),
        content: row.try_get(4).map_err(pg_err)?,
        summary: row.try_get(5).map_err(pg_err)?,
        reply_to: row
            .try_get::<_, Option<i64>>(6)
            .map_err(pg_err)?
            .map(MessageId::new),
        created: row.try_get(7).map_err(pg_err)?,
        read: row.try_get(8).map_err(pg_err)?,
        expires_at: row.try_get(9).map_err(pg_err)?,
        teambook: row.try_get(10).map_err(pg_err)?,
        envelope: row
            .try_get::<_, Option<JsonValue>>(11)
            .map_err(pg_err)?
            .and_then(|v| serde_json::from_value(v).ok()),
    })
}

fn lock_from_row(row: &Row) -> StorageResult<Lock> {
    Ok(Lock {
        teambook: row.try_get(0).map_err(pg_err)?,
        resource_id: row.try_get(1).map_err(pg_err)?,
        held_by: AiId::new(row.try_get::<_, String>(2).map_err(pg_err)?),
        acquired_at: row.try_get(3).map_err(pg_err)?,
        expires_at: row.try_get(4).map_err(pg_err)?,
    })
}

fn contribution_from_row(row: &Row) -> StorageResult<Contribution> {
    Ok(Contribution {
        id: ContributionId::new(row.try_get(0).map_err(pg_err)?),
        evolution_id: NoteId::new(row.try_get(1).map_err(pg_err)?),
        author: AiId::new(row.try_get::<_, String>(2).map_err(pg_err)?),
        content: row.try_get(3).map_err(pg_err)?,
        approach: row.try_get(4).map_err(pg_err)?,
        created: row.try_get(5).map_err(pg_err)?,
        avg_score: row.try_get(6).map_err(pg_err)?,
        rank_count: row.try_get(7).map_err(pg_err)?,
    })
}

// ============================================================================
// TRAIT IMPLEMENTATION
// ============================================================================

#[async_trait]
impl StorageBackend for PostgresBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Postgres
    }

    async fn ping(&self) -> StorageResult<()> {
        let conn = self.conn().await?;
        conn.simple_query("SELECT 1").await.map_err(pg_err)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Notes
    // ------------------------------------------------------------------

    async fn insert_note(&self, note: NewNote) -> StorageResult<NoteId> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "INSERT INTO notes (content, summary, tags, pinned, author, owner, type, \
                 parent_id, teambook_name, created, session_id, linked_items, has_vector, \
                 representation_policy, metadata, tamper_hash) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16) \
                 RETURNING id",
                &[
                    &note.content,
                    &note.summary,
                    &note.tags,
                    &note.pinned,
                    &note.author.as_str(),
                    &note.owner.as_ref().map(|o| o.as_str().to_string()),
                    &note.note_type,
                    &note.parent_id.map(|p| p.as_i64()),
                    &note.teambook,
                    &note.created,
                    &note.session_id.map(|s| s.as_i64()),
                    &note.linked_items,
                    &note.has_vector,
                    &note.representation_policy.as_str(),
                    &note.metadata,
                    &note.tamper_hash,
                ],
            )
            .await
            .map_err(pg_err)?;
        Ok(NoteId::new(row.try_get(0).map_err(pg_err)?))
    }

    async fn get_note(&self, teambook: &str, id: NoteId) -> StorageResult<Option<Note>> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT {} FROM notes WHERE id = $1 AND teambook_name = $2",
                    NOTE_COLUMNS
                ),
                &[&id.as_i64(), &teambook],
            )
            .await
            .map_err(pg_err)?;
        row.map(|r| note_from_row(&r)).transpose()
    }

    async fn read_notes(&self, filter: &NoteFilter) -> StorageResult<Vec<Note>> {
        let conn = self.conn().await?;
        let mut sql = format!(
            "SELECT {} FROM notes WHERE teambook_name = $1",
            NOTE_COLUMNS
        );
        let mut params: Vec<Box<dyn tokio_postgres::types::ToSql + Send + Sync>> =
            vec![Box::new(filter.teambook.clone())];

        if let Some(tag) = &filter.tag {
            params.push(Box::new(tag.clone()));
            sql.push_str(&format!(" AND ${} = ANY(tags)", params.len()));
        }
        if let Some(owner) = &filter.owner {
            params.push(Box::new(owner.as_str().to_string()));
            sql.push_str(&format!(" AND owner = ${}", params.len()));
        }
        if let Some(author) = &filter.author {
            params.push(Box::new(author.as_str().to_string()));
            sql.push_str(&format!(" AND author = ${}", params.len()));
        }
        if let Some(note_type) = &filter.note_type {
            params.push(Box::new(note_type.clone()));
            sql.push_str(&format!(" AND type = ${}", params.len()));
        }
        if filter.pinned_only == Some(true) {
            sql.push_str(" AND pinned = TRUE");
        }
        if let Some(session) = filter.session_id {
            params.push(Box::new(session.as_i64()));
            sql.push_str(&format!(" AND session_id = ${}", params.len()));
        }
        if let Some(query) = &filter.query {
            // Native FTS over content, LIKE fallback for the summary.
            params.push(Box::new(query.clone()));
            let idx = params.len();
            sql.push_str(&format!(
                " AND (to_tsvector('english', content) @@ plainto_tsquery('english', ${idx}) \
                 OR content ILIKE '%' || ${idx} || '%' OR summary ILIKE '%' || ${idx} || '%')"
            ));
        }

        match filter.mode {
            ReadMode::Important => {
                sql.push_str(" ORDER BY pinned DESC, pagerank DESC, created DESC")
            }
            ReadMode::Recent => sql.push_str(" ORDER BY created DESC"),
        }
        params.push(Box::new(filter.limit as i64));
        sql.push_str(&format!(" LIMIT ${}", params.len()));
        params.push(Box::new(filter.offset as i64));
        sql.push_str(&format!(" OFFSET ${}", params.len()));

        let refs: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = params
            .iter()
            .map(|p| p.as_ref() as &(dyn tokio_postgres::types::ToSql + Sync))
            .collect();
        let rows = conn.query(&sql, &refs).await.map_err(pg_err)?;
        rows.iter().map(note_from_row).collect()
    }

    async fn update_note(
        &self,
        teambook: &str,
        id: NoteId,
        patch: NotePatch,
    ) -> StorageResult<Option<Note>> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await.map_err(pg_err)?;
        let row = tx
            .query_opt(
                &format!(
                    "SELECT {} FROM notes WHERE id = $1 AND teambook_name = $2 FOR UPDATE",
                    NOTE_COLUMNS
                ),
                &[&id.as_i64(), &teambook],
            )
            .await
            .map_err(pg_err)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut note = note_from_row(&row)?;

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

        tx.execute(
            "UPDATE notes SET content = $1, summary = $2, tags = $3, pinned = $4, owner = $5, \
             linked_items = $6, metadata = $7, tamper_hash = $8 WHERE id = $9",
            &[
                &note.content,
                &note.summary,
                &note.tags,
                &note.pinned,
                &note.owner.as_ref().map(|o| o.as_str().to_string()),
                &note.linked_items,
                &note.metadata,
                &note.tamper_hash,
                &id.as_i64(),
            ],
        )
        .await
        .map_err(pg_err)?;
        tx.commit().await.map_err(pg_err)?;
        Ok(Some(note))
    }

    async fn delete_note(&self, teambook: &str, id: NoteId) -> StorageResult<bool> {
        let conn = self.conn().await?;
        let affected = conn
            .execute(
                "DELETE FROM notes WHERE id = $1 AND teambook_name = $2",
                &[&id.as_i64(), &teambook],
            )
            .await
            .map_err(pg_err)?;
        conn.execute(
            "DELETE FROM edges WHERE teambook_name = $1 AND (from_id = $2 OR to_id = $2)",
            &[&teambook, &id.as_i64()],
        )
        .await
        .map_err(pg_err)?;
        Ok(affected > 0)
    }

    async fn note_count(&self, teambook: &str) -> StorageResult<u64> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "SELECT COUNT(*) FROM notes WHERE teambook_name = $1",
                &[&teambook],
            )
            .await
            .map_err(pg_err)?;
        Ok(row.try_get::<_, i64>(0).map_err(pg_err)? as u64)
    }

    async fn last_note_meta(&self, teambook: &str) -> StorageResult<Option<LastNoteMeta>> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT id, created, session_id FROM notes WHERE teambook_name = $1 \
                 ORDER BY id DESC LIMIT 1",
                &[&teambook],
            )
            .await
            .map_err(pg_err)?;
        row.map(|r| {
            Ok(LastNoteMeta {
                id: NoteId::new(r.try_get(0).map_err(pg_err)?),
                created: r.try_get(1).map_err(pg_err)?,
                session_id: r
                    .try_get::<_, Option<i64>>(2)
                    .map_err(pg_err)?
                    .map(SessionId::new),
            })
        })
        .transpose()
    }

    async fn existing_note_ids(
        &self,
        teambook: &str,
        ids: &[NoteId],
    ) -> StorageResult<Vec<NoteId>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let conn = self.conn().await?;
        let raw: Vec<i64> = ids.iter().map(|id| id.as_i64()).collect();
        let rows = conn
            .query(
                "SELECT id FROM notes WHERE teambook_name = $1 AND id = ANY($2)",
                &[&teambook, &raw],
            )
            .await
            .map_err(pg_err)?;
        rows.iter()
            .map(|r| Ok(NoteId::new(r.try_get(0).map_err(pg_err)?)))
            .collect()
    }

    async fn recent_note_ids(
        &self,
        teambook: &str,
        before: NoteId,
        limit: usize,
    ) -> StorageResult<Vec<NoteId>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT id FROM notes WHERE teambook_name = $1 AND id < $2 \
                 ORDER BY id DESC LIMIT $3",
                &[&teambook, &before.as_i64(), &(limit as i64)],
            )
            .await
            .map_err(pg_err)?;
        rows.iter()
            .map(|r| Ok(NoteId::new(r.try_get(0).map_err(pg_err)?)))
            .collect()
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    async fn create_session(&self, teambook: &str, started: Timestamp) -> StorageResult<SessionId> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "INSERT INTO sessions (teambook_name, started, ended) VALUES ($1, $2, $2) \
                 RETURNING id",
                &[&teambook, &started],
            )
            .await
            .map_err(pg_err)?;
        Ok(SessionId::new(row.try_get(0).map_err(pg_err)?))
    }

    async fn touch_session(
        &self,
        _teambook: &str,
        id: SessionId,
        ended: Timestamp,
    ) -> StorageResult<()> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE sessions SET ended = $1, note_count = note_count + 1 WHERE id = $2",
            &[&ended, &id.as_i64()],
        )
        .await
        .map_err(pg_err)?;
        Ok(())
    }

    async fn session_note_ids(
        &self,
        teambook: &str,
        id: SessionId,
        exclude: NoteId,
    ) -> StorageResult<Vec<NoteId>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT id FROM notes WHERE teambook_name = $1 AND session_id = $2 AND id != $3",
                &[&teambook, &id.as_i64(), &exclude.as_i64()],
            )
            .await
            .map_err(pg_err)?;
        rows.iter()
            .map(|r| Ok(NoteId::new(r.try_get(0).map_err(pg_err)?)))
            .collect()
    }

    // ------------------------------------------------------------------
    // Edges and PageRank
    // ------------------------------------------------------------------

    async fn upsert_edge(&self, teambook: &str, edge: &Edge) -> StorageResult<()> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO edges (teambook_name, from_id, to_id, type, weight, created, \
             valid_from, valid_to, source_note_id, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, NULL, $8, $9) \
             ON CONFLICT (teambook_name, from_id, to_id, type) DO UPDATE SET \
               weight = EXCLUDED.weight, created = EXCLUDED.created, \
               source_note_id = COALESCE(EXCLUDED.source_note_id, edges.source_note_id), \
               metadata = COALESCE(EXCLUDED.metadata, edges.metadata), \
               valid_from = LEAST(edges.valid_from, EXCLUDED.created), \
               valid_to = NULL",
            &[
                &teambook,
                &edge.from_id.as_i64(),
                &edge.to_id.as_i64(),
                &edge.edge_type.as_str(),
                &edge.weight,
                &edge.created,
                &edge.valid_from,
                &edge.source_note_id.map(|n| n.as_i64()),
                &edge.metadata,
            ],
        )
        .await
        .map_err(pg_err)?;
        Ok(())
    }

    async fn edges_for(
        &self,
        teambook: &str,
        note: NoteId,
        reverse: bool,
    ) -> StorageResult<Vec<Edge>> {
        let conn = self.conn().await?;
        let column = if reverse { "to_id" } else { "from_id" };
        let rows = conn
            .query(
                &format!(
                    "SELECT from_id, to_id, type, weight, created, valid_from, valid_to, \
                     source_note_id, metadata FROM edges \
                     WHERE teambook_name = $1 AND {} = $2",
                    column
                ),
                &[&teambook, &note.as_i64()],
            )
            .await
            .map_err(pg_err)?;
        rows.iter()
            .map(|r| {
                Ok(Edge {
                    from_id: NoteId::new(r.try_get(0).map_err(pg_err)?),
                    to_id: NoteId::new(r.try_get(1).map_err(pg_err)?),
                    edge_type: EdgeType::from_str(r.try_get::<_, String>(2).map_err(pg_err)?.as_str())
                        .map_err(StorageError::Query)?,
                    weight: r.try_get(3).map_err(pg_err)?,
                    created: r.try_get(4).map_err(pg_err)?,
                    valid_from: r.try_get(5).map_err(pg_err)?,
                    valid_to: r.try_get(6).map_err(pg_err)?,
                    source_note_id: r
                        .try_get::<_, Option<i64>>(7)
                        .map_err(pg_err)?
                        .map(NoteId::new),
                    metadata: r.try_get(8).map_err(pg_err)?,
                })
            })
            .collect()
    }

    async fn adjacency(&self, teambook: &str) -> StorageResult<Vec<(i64, i64, f64)>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT from_id, to_id, weight FROM edges \
                 WHERE teambook_name = $1 AND valid_to IS NULL",
                &[&teambook],
            )
            .await
            .map_err(pg_err)?;
        rows.iter()
            .map(|r| {
                Ok((
                    r.try_get(0).map_err(pg_err)?,
                    r.try_get(1).map_err(pg_err)?,
                    r.try_get(2).map_err(pg_err)?,
                ))
            })
            .collect()
    }

    async fn store_pagerank(&self, teambook: &str, scores: &[(NoteId, f64)]) -> StorageResult<()> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await.map_err(pg_err)?;
        let stmt = tx
            .prepare("UPDATE notes SET pagerank = $1 WHERE teambook_name = $2 AND id = $3")
            .await
            .map_err(pg_err)?;
        for (id, score) in scores {
            tx.execute(&stmt, &[score, &teambook, &id.as_i64()])
                .await
                .map_err(pg_err)?;
        }
        tx.commit().await.map_err(pg_err)
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
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "INSERT INTO entities (teambook_name, name, type, first_seen, last_seen) \
                 VALUES ($1, $2, $3, $4, $4) \
                 ON CONFLICT (teambook_name, name) DO UPDATE SET \
                   last_seen = EXCLUDED.last_seen, \
                   mention_count = entities.mention_count + 1 \
                 RETURNING id",
                &[&teambook, &name, &kind.as_str(), &now],
            )
            .await
            .map_err(pg_err)?;
        Ok(EntityId::new(row.try_get(0).map_err(pg_err)?))
    }

    async fn link_entity_note(
        &self,
        _teambook: &str,
        entity: EntityId,
        note: NoteId,
    ) -> StorageResult<()> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO entity_notes (entity_id, note_id) VALUES ($1, $2) \
             ON CONFLICT DO NOTHING",
            &[&entity.as_i64(), &note.as_i64()],
        )
        .await
        .map_err(pg_err)?;
        Ok(())
    }

    async fn entity_note_ids(&self, _teambook: &str, entity: EntityId) -> StorageResult<Vec<NoteId>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT note_id FROM entity_notes WHERE entity_id = $1",
                &[&entity.as_i64()],
            )
            .await
            .map_err(pg_err)?;
        rows.iter()
            .map(|r| Ok(NoteId::new(r.try_get(0).map_err(pg_err)?)))
            .collect()
    }

    async fn known_entity_names(&self, teambook: &str) -> StorageResult<Vec<String>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT name FROM entities WHERE teambook_name = $1",
                &[&teambook],
            )
            .await
            .map_err(pg_err)?;
        rows.iter()
            .map(|r| r.try_get(0).map_err(pg_err))
            .collect()
    }

    async fn find_open_fact(
        &self,
        teambook: &str,
        entity: EntityId,
        relation: &str,
        value: &str,
    ) -> StorageResult<Option<EntityFact>> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT id, entity_id, relation, value, target_entity_id, valid_from, valid_to, \
                 source_note_id, confidence, metadata FROM entity_facts \
                 WHERE teambook_name = $1 AND entity_id = $2 AND relation = $3 AND value = $4 \
                 AND valid_to IS NULL",
                &[&teambook, &entity.as_i64(), &relation, &value],
            )
            .await
            .map_err(pg_err)?;
        row.map(|r| {
            Ok(EntityFact {
                id: FactId::new(r.try_get(0).map_err(pg_err)?),
                entity_id: EntityId::new(r.try_get(1).map_err(pg_err)?),
                relation: r.try_get(2).map_err(pg_err)?,
                value: r.try_get(3).map_err(pg_err)?,
                target_entity_id: r
                    .try_get::<_, Option<i64>>(4)
                    .map_err(pg_err)?
                    .map(EntityId::new),
                valid_from: r.try_get(5).map_err(pg_err)?,
                valid_to: r.try_get(6).map_err(pg_err)?,
                source_note_id: NoteId::new(r.try_get(7).map_err(pg_err)?),
                confidence: r.try_get(8).map_err(pg_err)?,
                metadata: r.try_get(9).map_err(pg_err)?,
            })
        })
        .transpose()
    }

    async fn refresh_fact(
        &self,
        _teambook: &str,
        id: FactId,
        valid_from: Timestamp,
        source_note_id: NoteId,
        confidence: f64,
    ) -> StorageResult<()> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE entity_facts SET valid_from = $1, source_note_id = $2, confidence = $3 \
             WHERE id = $4",
            &[&valid_from, &source_note_id.as_i64(), &confidence, &id.as_i64()],
        )
        .await
        .map_err(pg_err)?;
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
        let conn = self.conn().await?;
        let affected = conn
            .execute(
                "UPDATE entity_facts SET valid_to = $1 \
                 WHERE teambook_name = $2 AND entity_id = $3 AND relation = $4 \
                 AND valid_to IS NULL AND value != $5",
                &[&now, &teambook, &entity.as_i64(), &relation, &except_value],
            )
            .await
            .map_err(pg_err)?;
        Ok(affected)
    }

    async fn insert_fact(&self, teambook: &str, fact: NewFact) -> StorageResult<FactId> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "INSERT INTO entity_facts (teambook_name, entity_id, relation, value, \
                 target_entity_id, valid_from, valid_to, source_note_id, confidence, metadata) \
                 VALUES ($1, $2, $3, $4, $5, $6, NULL, $7, $8, $9) RETURNING id",
                &[
                    &teambook,
                    &fact.entity_id.as_i64(),
                    &fact.relation,
                    &fact.value,
                    &fact.target_entity_id.map(|t| t.as_i64()),
                    &fact.valid_from,
                    &fact.source_note_id.as_i64(),
                    &fact.confidence,
                    &fact.metadata,
                ],
            )
            .await
            .map_err(pg_err)?;
        Ok(FactId::new(row.try_get(0).map_err(pg_err)?))
    }

    async fn fact_candidates(
        &self,
        teambook: &str,
        token: &str,
        limit: usize,
    ) -> StorageResult<Vec<FactCandidate>> {
        let conn = self.conn().await?;
        let like = format!("%{}%", token);
        let rows = conn
            .query(
                "SELECT source_note_id, entity_id, relation, value, confidence \
                 FROM entity_facts \
                 WHERE teambook_name = $1 AND valid_to IS NULL \
                 AND (value ILIKE $2 OR relation ILIKE $2) \
                 ORDER BY confidence DESC, valid_from DESC LIMIT $3",
                &[&teambook, &like, &(limit as i64)],
            )
            .await
            .map_err(pg_err)?;
        rows.iter()
            .map(|r| {
                Ok(FactCandidate {
                    note_id: NoteId::new(r.try_get(0).map_err(pg_err)?),
                    entity_id: EntityId::new(r.try_get(1).map_err(pg_err)?),
                    relation: r.try_get(2).map_err(pg_err)?,
                    value: r.try_get(3).map_err(pg_err)?,
                    confidence: r.try_get(4).map_err(pg_err)?,
                })
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    async fn insert_message(&self, msg: NewMessage) -> StorageResult<MessageId> {
        let conn = self.conn().await?;
        let envelope = msg
            .envelope
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        let row = conn
            .query_one(
                "INSERT INTO messages (channel, from_ai, to_ai, content, summary, reply_to, \
                 created, expires_at, teambook_name, envelope) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) RETURNING id",
                &[
                    &msg.channel,
                    &msg.from_ai.as_str(),
                    &msg.to_ai.as_ref().map(|t| t.as_str().to_string()),
                    &msg.content,
                    &msg.summary,
                    &msg.reply_to.map(|r| r.as_i64()),
                    &msg.created,
                    &msg.expires_at,
                    &msg.teambook,
                    &envelope,
                ],
            )
            .await
            .map_err(pg_err)?;
        Ok(MessageId::new(row.try_get(0).map_err(pg_err)?))
    }

    async fn read_messages(&self, filter: &MessageFilter) -> StorageResult<Vec<Message>> {
        let conn = self.conn().await?;
        let mut sql = format!(
            "SELECT {} FROM messages WHERE teambook_name = $1 AND expires_at > NOW()",
            MESSAGE_COLUMNS
        );
        let mut params: Vec<Box<dyn tokio_postgres::types::ToSql + Send + Sync>> =
            vec![Box::new(filter.teambook.clone())];

        if let Some(channel) = &filter.channel {
            params.push(Box::new(channel.clone()));
            sql.push_str(&format!(" AND channel = ${}", params.len()));
        }
        if let Some(to_ai) = &filter.to_ai {
            params.push(Box::new(to_ai.as_str().to_string()));
            sql.push_str(&format!(" AND to_ai = ${}", params.len()));
        }
        if let Some(from_ai) = &filter.from_ai {
            params.push(Box::new(from_ai.as_str().to_string()));
            sql.push_str(&format!(" AND from_ai = ${}", params.len()));
        }
        if let Some(since) = filter.since {
            params.push(Box::new(since));
            sql.push_str(&format!(" AND created > ${}", params.len()));
        }
        if filter.unread_only {
            sql.push_str(" AND read = FALSE");
        }
        if let Some(thread) = filter.thread_id {
            params.push(Box::new(thread.as_i64()));
            let idx = params.len();
            sql.push_str(&format!(" AND (id = ${idx} OR reply_to = ${idx})"));
        }
        params.push(Box::new(filter.limit as i64));
        sql.push_str(&format!(" ORDER BY created DESC LIMIT ${}", params.len()));

        let refs: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = params
            .iter()
            .map(|p| p.as_ref() as &(dyn tokio_postgres::types::ToSql + Sync))
            .collect();
        let rows = conn.query(&sql, &refs).await.map_err(pg_err)?;
        rows.iter().map(message_from_row).collect()
    }

    async fn mark_messages_read(&self, teambook: &str, ids: &[MessageId]) -> StorageResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let conn = self.conn().await?;
        let raw: Vec<i64> = ids.iter().map(|id| id.as_i64()).collect();
        conn.execute(
            "UPDATE messages SET read = TRUE WHERE teambook_name = $1 AND id = ANY($2)",
            &[&teambook, &raw],
        )
        .await
        .map_err(pg_err)
    }

    async fn purge_expired_messages(&self, teambook: &str) -> StorageResult<u64> {
        let conn = self.conn().await?;
        conn.execute(
            "DELETE FROM messages WHERE teambook_name = $1 AND expires_at < NOW()",
            &[&teambook],
        )
        .await
        .map_err(pg_err)
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
        let mut conn = self.conn().await?;
        let now = Utc::now();
        let tx = conn.transaction().await.map_err(pg_err)?;
        let existing = tx
            .query_opt(
                "SELECT teambook_name, resource_id, held_by, acquired_at, expires_at \
                 FROM locks WHERE teambook_name = $1 AND resource_id = $2 FOR UPDATE",
                &[&teambook, &resource_id],
            )
            .await
            .map_err(pg_err)?;

        if let Some(row) = existing {
            let lock = lock_from_row(&row)?;
            if lock.expires_at > now && lock.held_by != *holder {
                return Ok(LockAttempt::Held {
                    held_by: lock.held_by,
                    expires_at: lock.expires_at,
                });
            }
        }

        let lock = Lock {
            resource_id: resource_id.to_string(),
            held_by: holder.clone(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(ttl_secs),
            teambook: teambook.to_string(),
        };
        tx.execute(
            "INSERT INTO locks (teambook_name, resource_id, held_by, acquired_at, expires_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (teambook_name, resource_id) DO UPDATE SET \
               held_by = EXCLUDED.held_by, acquired_at = EXCLUDED.acquired_at, \
               expires_at = EXCLUDED.expires_at",
            &[
                &lock.teambook,
                &lock.resource_id,
                &lock.held_by.as_str(),
                &lock.acquired_at,
                &lock.expires_at,
            ],
        )
        .await
        .map_err(pg_err)?;
        tx.commit().await.map_err(pg_err)?;
        Ok(LockAttempt::Acquired(lock))
    }

    async fn release_lock(
        &self,
        teambook: &str,
        resource_id: &str,
        holder: &AiId,
    ) -> StorageResult<ReleaseOutcome> {
        let conn = self.conn().await?;
        let existing = conn
            .query_opt(
                "SELECT held_by FROM locks WHERE teambook_name = $1 AND resource_id = $2",
                &[&teambook, &resource_id],
            )
            .await
            .map_err(pg_err)?;
        match existing {
            None => Ok(ReleaseOutcome::NotLocked),
            Some(row) => {
                let held_by: String = row.try_get(0).map_err(pg_err)?;
                if held_by != holder.as_str() {
                    return Ok(ReleaseOutcome::NotHolder {
                        held_by: AiId::new(held_by),
                    });
                }
                conn.execute(
                    "DELETE FROM locks WHERE teambook_name = $1 AND resource_id = $2 \
                     AND held_by = $3",
                    &[&teambook, &resource_id, &holder.as_str()],
                )
                .await
                .map_err(pg_err)?;
                Ok(ReleaseOutcome::Released)
            }
        }
    }

    async fn extend_lock(
        &self,
        teambook: &str,
        resource_id: &str,
        holder: &AiId,
        new_expiry: Timestamp,
    ) -> StorageResult<Option<Lock>> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "UPDATE locks SET expires_at = $1 \
                 WHERE teambook_name = $2 AND resource_id = $3 AND held_by = $4 \
                 RETURNING teambook_name, resource_id, held_by, acquired_at, expires_at",
                &[&new_expiry, &teambook, &resource_id, &holder.as_str()],
            )
            .await
            .map_err(pg_err)?;
        row.map(|r| lock_from_row(&r)).transpose()
    }

    async fn locks_held_by(&self, teambook: &str, holder: &AiId) -> StorageResult<u64> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "SELECT COUNT(*) FROM locks \
                 WHERE teambook_name = $1 AND held_by = $2 AND expires_at > NOW()",
                &[&teambook, &holder.as_str()],
            )
            .await
            .map_err(pg_err)?;
        Ok(row.try_get::<_, i64>(0).map_err(pg_err)? as u64)
    }

    async fn sweep_expired_locks(&self, teambook: &str) -> StorageResult<u64> {
        let conn = self.conn().await?;
        conn.execute(
            "DELETE FROM locks WHERE teambook_name = $1 AND expires_at < NOW()",
            &[&teambook],
        )
        .await
        .map_err(pg_err)
    }

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    async fn insert_task(&self, task: NewTask) -> StorageResult<TaskId> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "INSERT INTO tasks (task, priority, status, author, created, teambook_name, \
                 metadata, tamper_hash) VALUES ($1, $2, 'pending', $3, $4, $5, $6, $7) \
                 RETURNING id",
                &[
                    &task.task,
                    &(task.priority as i32),
                    &task.author.as_str(),
                    &task.created,
                    &task.teambook,
                    &task.metadata,
                    &task.tamper_hash,
                ],
            )
            .await
            .map_err(pg_err)?;
        Ok(TaskId::new(row.try_get(0).map_err(pg_err)?))
    }

    async fn pending_task_count(&self, teambook: &str) -> StorageResult<u64> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "SELECT COUNT(*) FROM tasks WHERE teambook_name = $1 AND status = 'pending'",
                &[&teambook],
            )
            .await
            .map_err(pg_err)?;
        Ok(row.try_get::<_, i64>(0).map_err(pg_err)? as u64)
    }

    async fn claim_next_task(
        &self,
        teambook: &str,
        claimer: &AiId,
        prefer_priority: bool,
        now: Timestamp,
    ) -> StorageResult<Option<Task>> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await.map_err(pg_err)?;
        let order = if prefer_priority {
            "priority DESC, created ASC"
        } else {
            "created ASC"
        };
        // SKIP LOCKED makes concurrent claimers pick disjoint rows instead
        // of serializing on the same head-of-queue task.
        let row = tx
            .query_opt(
                &format!(
                    "SELECT {} FROM tasks WHERE teambook_name = $1 AND status = 'pending' \
                     ORDER BY {} LIMIT 1 FOR UPDATE SKIP LOCKED",
                    TASK_COLUMNS, order
                ),
                &[&teambook],
            )
            .await
            .map_err(pg_err)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut task = task_from_row(&row)?;
        task.status = TaskStatus::Claimed;
        task.claimed_by = Some(claimer.clone());
        task.claimed_at = Some(now);
        task.tamper_hash = task.compute_tamper_hash();

        tx.execute(
            "UPDATE tasks SET status = 'claimed', claimed_by = $1, claimed_at = $2, \
             tamper_hash = $3 WHERE id = $4",
            &[
                &claimer.as_str(),
                &now,
                &task.tamper_hash,
                &task.id.as_i64(),
            ],
        )
        .await
        .map_err(pg_err)?;
        tx.commit().await.map_err(pg_err)?;
        Ok(Some(task))
    }

    async fn get_task(&self, teambook: &str, id: TaskId) -> StorageResult<Option<Task>> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT {} FROM tasks WHERE teambook_name = $1 AND id = $2",
                    TASK_COLUMNS
                ),
                &[&teambook, &id.as_i64()],
            )
            .await
            .map_err(pg_err)?;
        row.map(|r| task_from_row(&r)).transpose()
    }

    async fn complete_task(
        &self,
        teambook: &str,
        id: TaskId,
        caller: &AiId,
        result: Option<String>,
        now: Timestamp,
    ) -> StorageResult<CompleteOutcome> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await.map_err(pg_err)?;
        let row = tx
            .query_opt(
                &format!(
                    "SELECT {} FROM tasks WHERE teambook_name = $1 AND id = $2 FOR UPDATE",
                    TASK_COLUMNS
                ),
                &[&teambook, &id.as_i64()],
            )
            .await
            .map_err(pg_err)?;

        let Some(row) = row else {
            return Ok(CompleteOutcome::NotFound);
        };
        let mut task = task_from_row(&row)?;
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

        tx.execute(
            "UPDATE tasks SET status = 'completed', completed_at = $1, result = $2, \
             tamper_hash = $3 WHERE id = $4",
            &[&now, &task.result, &task.tamper_hash, &task.id.as_i64()],
        )
        .await
        .map_err(pg_err)?;
        tx.commit().await.map_err(pg_err)?;
        Ok(CompleteOutcome::Completed(task))
    }

    // ------------------------------------------------------------------
    // Watches and events
    // ------------------------------------------------------------------

    async fn upsert_watch(&self, watch: &Watch) -> StorageResult<bool> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "INSERT INTO watches (ai_id, item_type, item_id, event_types, last_activity, \
                 teambook_name) VALUES ($1, $2, $3, $4, $5, $6) \
                 ON CONFLICT (teambook_name, ai_id, item_type, item_id) DO UPDATE SET \
                   event_types = EXCLUDED.event_types, last_activity = EXCLUDED.last_activity \
                 RETURNING (xmax = 0)",
                &[
                    &watch.ai_id.as_str(),
                    &watch.item_type.as_str(),
                    &watch.item_id,
                    &watch.event_types,
                    &watch.last_activity,
                    &watch.teambook,
                ],
            )
            .await
            .map_err(pg_err)?;
        row.try_get(0).map_err(pg_err)
    }

    async fn delete_watch(
        &self,
        teambook: &str,
        ai_id: &AiId,
        item_type: ItemType,
        item_id: &str,
    ) -> StorageResult<bool> {
        let conn = self.conn().await?;
        let affected = conn
            .execute(
                "DELETE FROM watches WHERE teambook_name = $1 AND ai_id = $2 \
                 AND item_type = $3 AND item_id = $4",
                &[&teambook, &ai_id.as_str(), &item_type.as_str(), &item_id],
            )
            .await
            .map_err(pg_err)?;
        Ok(affected > 0)
    }

    async fn count_watches(&self, teambook: &str, ai_id: &AiId) -> StorageResult<u64> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "SELECT COUNT(*) FROM watches WHERE teambook_name = $1 AND ai_id = $2",
                &[&teambook, &ai_id.as_str()],
            )
            .await
            .map_err(pg_err)?;
        Ok(row.try_get::<_, i64>(0).map_err(pg_err)? as u64)
    }

    async fn watches_for_ai(&self, teambook: &str, ai_id: &AiId) -> StorageResult<Vec<Watch>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT ai_id, item_type, item_id, event_types, last_activity, teambook_name \
                 FROM watches WHERE teambook_name = $1 AND ai_id = $2",
                &[&teambook, &ai_id.as_str()],
            )
            .await
            .map_err(pg_err)?;
        rows.iter()
            .map(|r| {
                Ok(Watch {
                    ai_id: AiId::new(r.try_get::<_, String>(0).map_err(pg_err)?),
                    item_type: ItemType::from_str(r.try_get::<_, String>(1).map_err(pg_err)?.as_str())
                        .unwrap_or(ItemType::Note),
                    item_id: r.try_get(2).map_err(pg_err)?,
                    event_types: r.try_get(3).map_err(pg_err)?,
                    last_activity: r.try_get(4).map_err(pg_err)?,
                    teambook: r.try_get(5).map_err(pg_err)?,
                })
            })
            .collect()
    }

    async fn watchers_for_item(
        &self,
        teambook: &str,
        item_type: ItemType,
        item_id: &str,
    ) -> StorageResult<Vec<Watch>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT ai_id, item_type, item_id, event_types, last_activity, teambook_name \
                 FROM watches WHERE teambook_name = $1 AND item_type = $2 AND item_id = $3",
                &[&teambook, &item_type.as_str(), &item_id],
            )
            .await
            .map_err(pg_err)?;
        rows.iter()
            .map(|r| {
                Ok(Watch {
                    ai_id: AiId::new(r.try_get::<_, String>(0).map_err(pg_err)?),
                    item_type: ItemType::from_str(r.try_get::<_, String>(1).map_err(pg_err)?.as_str())
                        .unwrap_or(ItemType::Note),
                    item_id: r.try_get(2).map_err(pg_err)?,
                    event_types: r.try_get(3).map_err(pg_err)?,
                    last_activity: r.try_get(4).map_err(pg_err)?,
                    teambook: r.try_get(5).map_err(pg_err)?,
                })
            })
            .collect()
    }

    async fn insert_event(&self, event: NewEvent, recipients: &[AiId]) -> StorageResult<EventId> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await.map_err(pg_err)?;
        let row = tx
            .query_one(
                "INSERT INTO events (item_type, item_id, event_type, actor, summary, created, \
                 expires_at, teambook_name, metadata) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING id",
                &[
                    &event.item_type.as_str(),
                    &event.item_id,
                    &event.event_type,
                    &event.actor.as_str(),
                    &event.summary,
                    &event.created,
                    &event.expires_at,
                    &event.teambook,
                    &event.metadata,
                ],
            )
            .await
            .map_err(pg_err)?;
        let event_id: i64 = row.try_get(0).map_err(pg_err)?;
        let stmt = tx
            .prepare(
                "INSERT INTO event_deliveries (event_id, ai_id, seen) VALUES ($1, $2, FALSE) \
                 ON CONFLICT DO NOTHING",
            )
            .await
            .map_err(pg_err)?;
        for ai in recipients {
            tx.execute(&stmt, &[&event_id, &ai.as_str()])
                .await
                .map_err(pg_err)?;
        }
        tx.commit().await.map_err(pg_err)?;
        Ok(EventId::new(event_id))
    }

    async fn events_for(
        &self,
        teambook: &str,
        ai_id: &AiId,
        since: Timestamp,
        limit: usize,
        mark_seen: bool,
    ) -> StorageResult<Vec<WatchEvent>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT e.id, e.item_type, e.item_id, e.event_type, e.actor, e.summary, \
                 e.created, e.expires_at, e.teambook_name, e.metadata \
                 FROM events e JOIN event_deliveries d ON d.event_id = e.id \
                 WHERE e.teambook_name = $1 AND d.ai_id = $2 AND e.created > $3 \
                 AND e.expires_at > NOW() ORDER BY e.created DESC LIMIT $4",
                &[&teambook, &ai_id.as_str(), &since, &(limit as i64)],
            )
            .await
            .map_err(pg_err)?;
        let events: Vec<WatchEvent> = rows
            .iter()
            .map(|r| {
                Ok(WatchEvent {
                    id: EventId::new(r.try_get(0).map_err(pg_err)?),
                    item_type: ItemType::from_str(r.try_get::<_, String>(1).map_err(pg_err)?.as_str())
                        .unwrap_or(ItemType::Note),
                    item_id: r.try_get(2).map_err(pg_err)?,
                    event_type: r.try_get(3).map_err(pg_err)?,
                    actor: AiId::new(r.try_get::<_, String>(4).map_err(pg_err)?),
                    summary: r.try_get(5).map_err(pg_err)?,
                    created: r.try_get(6).map_err(pg_err)?,
                    expires_at: r.try_get(7).map_err(pg_err)?,
                    teambook: r.try_get(8).map_err(pg_err)?,
                    metadata: r.try_get(9).map_err(pg_err)?,
                })
            })
            .collect::<StorageResult<_>>()?;

        if mark_seen && !events.is_empty() {
            let ids: Vec<i64> = events.iter().map(|e| e.id.as_i64()).collect();
            conn.execute(
                "UPDATE event_deliveries SET seen = TRUE WHERE ai_id = $1 AND event_id = ANY($2)",
                &[&ai_id.as_str(), &ids],
            )
            .await
            .map_err(pg_err)?;
        }
        Ok(events)
    }

    async fn purge_expired_events(&self, teambook: &str) -> StorageResult<u64> {
        let conn = self.conn().await?;
        let affected = conn
            .execute(
                "DELETE FROM events WHERE teambook_name = $1 AND expires_at < NOW()",
                &[&teambook],
            )
            .await
            .map_err(pg_err)?;
        conn.execute(
            "DELETE FROM event_deliveries WHERE event_id NOT IN (SELECT id FROM events)",
            &[],
        )
        .await
        .map_err(pg_err)?;
        Ok(affected)
    }

    // ------------------------------------------------------------------
    // Presence
    // ------------------------------------------------------------------

    async fn upsert_presence(&self, presence: &Presence) -> StorageResult<()> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO presence (teambook_name, ai_id, last_seen, last_operation, \
             status_message) VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (teambook_name, ai_id) DO UPDATE SET \
               last_seen = EXCLUDED.last_seen, last_operation = EXCLUDED.last_operation, \
               status_message = COALESCE(EXCLUDED.status_message, presence.status_message)",
            &[
                &presence.teambook,
                &presence.ai_id.as_str(),
                &presence.last_seen,
                &presence.last_operation,
                &presence.status_message,
            ],
        )
        .await
        .map_err(pg_err)?;
        Ok(())
    }

    async fn active_presences(
        &self,
        teambook: &str,
        since: Timestamp,
    ) -> StorageResult<Vec<Presence>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT ai_id, last_seen, last_operation, status_message, teambook_name \
                 FROM presence WHERE teambook_name = $1 AND last_seen > $2 \
                 ORDER BY last_seen DESC",
                &[&teambook, &since],
            )
            .await
            .map_err(pg_err)?;
        rows.iter()
            .map(|r| {
                Ok(Presence {
                    ai_id: AiId::new(r.try_get::<_, String>(0).map_err(pg_err)?),
                    last_seen: r.try_get(1).map_err(pg_err)?,
                    last_operation: r.try_get(2).map_err(pg_err)?,
                    status_message: r.try_get(3).map_err(pg_err)?,
                    teambook: r.try_get(4).map_err(pg_err)?,
                })
            })
            .collect()
    }

    async fn prune_presence(&self, teambook: &str, before: Timestamp) -> StorageResult<u64> {
        let conn = self.conn().await?;
        conn.execute(
            "DELETE FROM presence WHERE teambook_name = $1 AND last_seen < $2",
            &[&teambook, &before],
        )
        .await
        .map_err(pg_err)
    }

    // ------------------------------------------------------------------
    // Vault
    // ------------------------------------------------------------------

    async fn vault_set(&self, teambook: &str, item: &VaultItem) -> StorageResult<()> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO vault (teambook_name, key, encrypted_value, created, updated, author) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (teambook_name, key) DO UPDATE SET \
               encrypted_value = EXCLUDED.encrypted_value, updated = EXCLUDED.updated, \
               author = EXCLUDED.author",
            &[
                &teambook,
                &item.key,
                &item.encrypted_value,
                &item.created,
                &item.updated,
                &item.author.as_str(),
            ],
        )
        .await
        .map_err(pg_err)?;
        Ok(())
    }

    async fn vault_get(&self, teambook: &str, key: &str) -> StorageResult<Option<VaultItem>> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT key, encrypted_value, created, updated, author FROM vault \
                 WHERE teambook_name = $1 AND key = $2",
                &[&teambook, &key],
            )
            .await
            .map_err(pg_err)?;
        row.map(|r| {
            Ok(VaultItem {
                key: r.try_get(0).map_err(pg_err)?,
                encrypted_value: r.try_get(1).map_err(pg_err)?,
                created: r.try_get(2).map_err(pg_err)?,
                updated: r.try_get(3).map_err(pg_err)?,
                author: AiId::new(r.try_get::<_, String>(4).map_err(pg_err)?),
            })
        })
        .transpose()
    }

    async fn vault_delete(&self, teambook: &str, key: &str) -> StorageResult<bool> {
        let conn = self.conn().await?;
        let affected = conn
            .execute(
                "DELETE FROM vault WHERE teambook_name = $1 AND key = $2",
                &[&teambook, &key],
            )
            .await
            .map_err(pg_err)?;
        Ok(affected > 0)
    }

    async fn vault_list(&self, teambook: &str) -> StorageResult<Vec<VaultEntryInfo>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT key, updated, author FROM vault WHERE teambook_name = $1 ORDER BY key",
                &[&teambook],
            )
            .await
            .map_err(pg_err)?;
        rows.iter()
            .map(|r| {
                Ok(VaultEntryInfo {
                    key: r.try_get(0).map_err(pg_err)?,
                    updated: r.try_get(1).map_err(pg_err)?,
                    author: AiId::new(r.try_get::<_, String>(2).map_err(pg_err)?),
                })
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Evolution
    // ------------------------------------------------------------------

    async fn insert_contribution(
        &self,
        teambook: &str,
        contribution: NewContribution,
    ) -> StorageResult<ContributionId> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "INSERT INTO contributions (teambook_name, evolution_id, author, content, \
                 approach, created) VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
                &[
                    &teambook,
                    &contribution.evolution_id.as_i64(),
                    &contribution.author.as_str(),
                    &contribution.content,
                    &contribution.approach,
                    &contribution.created,
                ],
            )
            .await
            .map_err(pg_err)?;
        Ok(ContributionId::new(row.try_get(0).map_err(pg_err)?))
    }

    async fn contributions_for(
        &self,
        teambook: &str,
        evolution_id: NoteId,
    ) -> StorageResult<Vec<Contribution>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT id, evolution_id, author, content, approach, created, avg_score, \
                 rank_count FROM contributions \
                 WHERE teambook_name = $1 AND evolution_id = $2 \
                 ORDER BY avg_score DESC, created ASC",
                &[&teambook, &evolution_id.as_i64()],
            )
            .await
            .map_err(pg_err)?;
        rows.iter().map(contribution_from_row).collect()
    }

    async fn get_contribution(
        &self,
        teambook: &str,
        id: ContributionId,
    ) -> StorageResult<Option<Contribution>> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT id, evolution_id, author, content, approach, created, avg_score, \
                 rank_count FROM contributions WHERE teambook_name = $1 AND id = $2",
                &[&teambook, &id.as_i64()],
            )
            .await
            .map_err(pg_err)?;
        row.map(|r| contribution_from_row(&r)).transpose()
    }

    async fn count_contributions_by(
        &self,
        teambook: &str,
        evolution_id: NoteId,
        author: &AiId,
    ) -> StorageResult<u64> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "SELECT COUNT(*) FROM contributions \
                 WHERE teambook_name = $1 AND evolution_id = $2 AND author = $3",
                &[&teambook, &evolution_id.as_i64(), &author.as_str()],
            )
            .await
            .map_err(pg_err)?;
        Ok(row.try_get::<_, i64>(0).map_err(pg_err)? as u64)
    }

    async fn upsert_ranking(
        &self,
        _teambook: &str,
        ranking: &Ranking,
    ) -> StorageResult<(f64, i64)> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await.map_err(pg_err)?;
        tx.execute(
            "INSERT INTO rankings (contribution_id, ranked_by, score, reason, created) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (contribution_id, ranked_by) DO UPDATE SET \
               score = EXCLUDED.score, reason = EXCLUDED.reason, created = EXCLUDED.created",
            &[
                &ranking.contribution_id.as_i64(),
                &ranking.ranked_by.as_str(),
                &ranking.score,
                &ranking.reason,
                &ranking.created,
            ],
        )
        .await
        .map_err(pg_err)?;
        let row = tx
            .query_one(
                "SELECT COALESCE(AVG(score), 0.0), COUNT(*) FROM rankings \
                 WHERE contribution_id = $1",
                &[&ranking.contribution_id.as_i64()],
            )
            .await
            .map_err(pg_err)?;
        let avg: f64 = row.try_get(0).map_err(pg_err)?;
        let count: i64 = row.try_get(1).map_err(pg_err)?;
        tx.execute(
            "UPDATE contributions SET avg_score = $1, rank_count = $2 WHERE id = $3",
            &[&avg, &count, &ranking.contribution_id.as_i64()],
        )
        .await
        .map_err(pg_err)?;
        tx.commit().await.map_err(pg_err)?;
        Ok((avg, count))
    }

    async fn get_vote(
        &self,
        teambook: &str,
        evolution_id: NoteId,
        voter: &AiId,
    ) -> StorageResult<Option<Vote>> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT evolution_id, voter, preferred, change_count, updated FROM votes \
                 WHERE teambook_name = $1 AND evolution_id = $2 AND voter = $3",
                &[&teambook, &evolution_id.as_i64(), &voter.as_str()],
            )
            .await
            .map_err(pg_err)?;
        row.map(|r| {
            Ok(Vote {
                evolution_id: NoteId::new(r.try_get(0).map_err(pg_err)?),
                voter: AiId::new(r.try_get::<_, String>(1).map_err(pg_err)?),
                preferred: r
                    .try_get::<_, Vec<i64>>(2)
                    .map_err(pg_err)?
                    .into_iter()
                    .map(ContributionId::new)
                    .collect(),
                change_count: r.try_get(3).map_err(pg_err)?,
                updated: r.try_get(4).map_err(pg_err)?,
            })
        })
        .transpose()
    }

    async fn upsert_vote(&self, teambook: &str, vote: &Vote) -> StorageResult<()> {
        let conn = self.conn().await?;
        let preferred: Vec<i64> = vote.preferred.iter().map(|c| c.as_i64()).collect();
        conn.execute(
            "INSERT INTO votes (teambook_name, evolution_id, voter, preferred, change_count, \
             updated) VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (teambook_name, evolution_id, voter) DO UPDATE SET \
               preferred = EXCLUDED.preferred, change_count = EXCLUDED.change_count, \
               updated = EXCLUDED.updated",
            &[
                &teambook,
                &vote.evolution_id.as_i64(),
                &vote.voter.as_str(),
                &preferred,
                &vote.change_count,
                &vote.updated,
            ],
        )
        .await
        .map_err(pg_err)?;
        Ok(())
    }

    async fn insert_synthesis(&self, record: NewSynthesis) -> StorageResult<i64> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "INSERT INTO synthesis_history (evolution_id, strategy, output_path, \
                 contribution_count, author, created, teambook_name) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING id",
                &[
                    &record.evolution_id.as_i64(),
                    &record.strategy.as_str(),
                    &record.output_path,
                    &record.contribution_count,
                    &record.author.as_str(),
                    &record.created,
                    &record.teambook,
                ],
            )
            .await
            .map_err(pg_err)?;
        row.try_get(0).map_err(pg_err)
    }

    async fn synthesis_count_since(
        &self,
        teambook: &str,
        since: Timestamp,
    ) -> StorageResult<u64> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "SELECT COUNT(*) FROM synthesis_history \
                 WHERE teambook_name = $1 AND created > $2",
                &[&teambook, &since],
            )
            .await
            .map_err(pg_err)?;
        Ok(row.try_get::<_, i64>(0).map_err(pg_err)? as u64)
    }

    async fn insert_conflicts(
        &self,
        teambook: &str,
        conflicts: &[ContributionConflict],
    ) -> StorageResult<()> {
        let conn = self.conn().await?;
        let stmt = conn
            .prepare(
                "INSERT INTO contribution_conflicts \
                 (teambook_name, evolution_id, contribution_a, contribution_b, topic, detected) \
                 VALUES ($1, $2, $3, $4, $5, $6) ON CONFLICT DO NOTHING",
            )
            .await
            .map_err(pg_err)?;
        for conflict in conflicts {
            conn.execute(
                &stmt,
                &[
                    &teambook,
                    &conflict.evolution_id.as_i64(),
                    &conflict.contribution_a.as_i64(),
                    &conflict.contribution_b.as_i64(),
                    &conflict.topic,
                    &conflict.detected,
                ],
            )
            .await
            .map_err(pg_err)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Coordination events and registry
    // ------------------------------------------------------------------

    async fn insert_coordination_event(&self, event: NewCoordinationEvent) -> StorageResult<i64> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "INSERT INTO coordination_events (event_type, ai_id, task_id, summary, created, \
                 metadata, teambook_name) VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING id",
                &[
                    &event.event_type,
                    &event.ai_id.as_str(),
                    &event.task_id.map(|t| t.as_i64()),
                    &event.summary,
                    &event.created,
                    &event.metadata,
                    &event.teambook,
                ],
            )
            .await
            .map_err(pg_err)?;
        row.try_get(0).map_err(pg_err)
    }

    async fn coordination_events(
        &self,
        teambook: &str,
        since: Timestamp,
        limit: usize,
    ) -> StorageResult<Vec<CoordinationEvent>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT id, event_type, ai_id, task_id, summary, created, metadata, \
                 teambook_name FROM coordination_events \
                 WHERE teambook_name = $1 AND created > $2 ORDER BY created DESC LIMIT $3",
                &[&teambook, &since, &(limit as i64)],
            )
            .await
            .map_err(pg_err)?;
        rows.iter()
            .map(|r| {
                Ok(CoordinationEvent {
                    id: r.try_get(0).map_err(pg_err)?,
                    event_type: r.try_get(1).map_err(pg_err)?,
                    ai_id: AiId::new(r.try_get::<_, String>(2).map_err(pg_err)?),
                    task_id: r
                        .try_get::<_, Option<i64>>(3)
                        .map_err(pg_err)?
                        .map(TaskId::new),
                    summary: r.try_get(4).map_err(pg_err)?,
                    created: r.try_get(5).map_err(pg_err)?,
                    metadata: r.try_get(6).map_err(pg_err)?,
                    teambook: r.try_get(7).map_err(pg_err)?,
                })
            })
            .collect()
    }

    async fn touch_teambook(&self, name: &str, creator: &AiId) -> StorageResult<()> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO teambooks (name, created, created_by, last_active) \
             VALUES ($1, NOW(), $2, NOW()) \
             ON CONFLICT (name) DO UPDATE SET last_active = NOW()",
            &[&name, &creator.as_str()],
        )
        .await
        .map_err(pg_err)?;
        Ok(())
    }

    async fn list_teambooks(&self) -> StorageResult<Vec<(String, Timestamp, Option<Timestamp>)>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT name, created, last_active FROM teambooks ORDER BY name",
                &[],
            )
            .await
            .map_err(pg_err)?;
        rows.iter()
            .map(|r| {
                Ok((
                    r.try_get(0).map_err(pg_err)?,
                    r.try_get(1).map_err(pg_err)?,
                    r.try_get(2).map_err(pg_err)?,
                ))
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Stats
    // ------------------------------------------------------------------

    async fn record_operation(
        &self,
        teambook: &str,
        operation: &str,
        dur_ms: Option<i64>,
        author: &AiId,
    ) -> StorageResult<()> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO stats (teambook_name, operation, ts, dur_ms, author) \
             VALUES ($1, $2, NOW(), $3, $4)",
            &[&teambook, &operation, &dur_ms, &author.as_str()],
        )
        .await
        .map_err(pg_err)?;
        Ok(())
    }

    async fn get_stats(&self, teambook: &str) -> StorageResult<StorageStats> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "SELECT \
                 (SELECT COUNT(*) FROM notes WHERE teambook_name = $1), \
                 (SELECT COUNT(*) FROM edges WHERE teambook_name = $1), \
                 (SELECT COUNT(*) FROM entities WHERE teambook_name = $1), \
                 (SELECT COUNT(*) FROM sessions WHERE teambook_name = $1), \
                 (SELECT COUNT(*) FROM messages WHERE teambook_name = $1), \
                 (SELECT COUNT(*) FROM tasks WHERE teambook_name = $1), \
                 (SELECT COUNT(*) FROM stats WHERE teambook_name = $1)",
                &[&teambook],
            )
            .await
            .map_err(pg_err)?;
        let get = |idx: usize| -> StorageResult<u64> {
            Ok(row.try_get::<_, i64>(idx).map_err(pg_err)? as u64)
        };
        Ok(StorageStats {
            notes: get(0)?,
            edges: get(1)?,
            entities: get(2)?,
            sessions: get(3)?,
            messages: get(4)?,
            tasks: get(5)?,
            operations: get(6)?,
        })
    }

    // ------------------------------------------------------------------
    // Pub/sub (none; in-process bus only)
    // ------------------------------------------------------------------

    async fn publish(&self, _channel: &str, _payload: &str) -> StorageResult<()> {
        Ok(())
    }

    async fn subscribe(&self, _channel: &str) -> StorageResult<Option<RemoteEventStream>> {
        Ok(None)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Live tests run only against a disposable database:
    /// `TEAMBOOK_PG_TESTS=1 POSTGRES_URL=... cargo test -p teambook-storage`
    async fn live_backend() -> Option<PostgresBackend> {
        if std::env::var("TEAMBOOK_PG_TESTS").ok().as_deref() != Some("1") {
            return None;
        }
        let url = std::env::var("POSTGRES_URL").ok()?;
        PostgresBackend::connect(&url, 4).await.ok()
    }

    #[tokio::test]
    async fn test_live_lock_roundtrip() {
        let Some(backend) = live_backend().await else {
            return;
        };
        let alpha = AiId::from("alpha-001");
        let beta = AiId::from("beta-002");
        let resource = format!("res-{}", std::process::id());

        let first = backend
            .try_acquire_lock("pg-tests", &resource, &alpha, 30)
            .await
            .expect("acquire");
        assert!(matches!(first, LockAttempt::Acquired(_)));
        let second = backend
            .try_acquire_lock("pg-tests", &resource, &beta, 30)
            .await
            .expect("acquire");
        assert!(matches!(second, LockAttempt::Held { .. }));
        backend
            .release_lock("pg-tests", &resource, &alpha)
            .await
            .expect("release");
    }

    #[tokio::test]
    async fn test_live_concurrent_claim() {
        let Some(backend) = live_backend().await else {
            return;
        };
        let backend = std::sync::Arc::new(backend);
        backend
            .insert_task(NewTask {
                task: "race me".to_string(),
                priority: 5,
                author: AiId::from("alpha-001"),
                created: Utc::now(),
                teambook: "pg-tests-claim".to_string(),
                metadata: serde_json::json!({}),
                tamper_hash: "h".to_string(),
            })
            .await
            .expect("queue");

        let a = backend.clone();
        let b = backend.clone();
        let alpha_id = AiId::from("alpha-001");
        let beta_id = AiId::from("beta-002");
        let (ra, rb) = tokio::join!(
            a.claim_next_task("pg-tests-claim", &alpha_id, true, Utc::now()),
            b.claim_next_task("pg-tests-claim", &beta_id, true, Utc::now()),
        );
        let won = [ra.expect("claim a"), rb.expect("claim b")]
            .into_iter()
            .flatten()
            .count();
        assert_eq!(won, 1, "exactly one claimer wins");
    }
}
