//! Embedded sqlite backend.
//!
//! One database file per teambook at `<root>/<name>/teambook.sqlite3`, WAL
//! mode. Concurrent-open contention is handled with bounded exponential
//! backoff (100 ms x 2^attempt, up to 5 attempts); only after retries
//! exhaust does the backend open a disposable temp database so a single
//! call never blocks indefinitely. Temp databases are tracked and removed
//! when the backend drops.
//!
//! Queries are short single-file operations and run inline under the
//! connection mutex; this backend is the embedded fallback, not the
//! high-concurrency path.

use crate::adapter::*;
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;
use teambook_core::*;
use tracing::{debug, warn};

const OPEN_RETRIES: u32 = 5;
const OPEN_BACKOFF_MS: u64 = 100;

/// Embedded sqlite storage rooted at a teambook directory tree.
pub struct SqliteBackend {
    root: PathBuf,
    conns: Mutex<HashMap<String, Connection>>,
    temp_dbs: Mutex<Vec<PathBuf>>,
}

impl SqliteBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            conns: Mutex::new(HashMap::new()),
            temp_dbs: Mutex::new(Vec::new()),
        }
    }

    fn db_path(&self, teambook: &str) -> PathBuf {
        self.root.join(teambook).join("teambook.sqlite3")
    }

    /// Open with bounded backoff; fall back to a disposable temp database
    /// only after retries exhaust.
    fn open_database(&self, path: &Path) -> StorageResult<Connection> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;

        let mut last_err = None;
        for attempt in 0..OPEN_RETRIES {
            match Connection::open_with_flags(path, flags) {
                Ok(conn) => {
                    conn.busy_timeout(Duration::from_millis(250)).map_err(sql_err)?;
                    conn.pragma_update(None, "journal_mode", "WAL").map_err(sql_err)?;
                    return Ok(conn);
                }
                Err(err) => {
                    last_err = Some(err);
                    std::thread::sleep(Duration::from_millis(OPEN_BACKOFF_MS << attempt));
                }
            }
        }

        warn!(
            path = %path.display(),
            error = %last_err.as_ref().map(|e| e.to_string()).unwrap_or_default(),
            "database locked after retries, opening disposable temp database"
        );
        let temp = tempfile::Builder::new()
            .prefix("teambook-")
            .suffix(".sqlite3")
            .tempfile()?
            .into_temp_path()
            .keep()
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        let conn = Connection::open_with_flags(&temp, flags).map_err(sql_err)?;
        self.temp_dbs
            .lock()
            .expect("temp db registry poisoned")
            .push(temp);
        Ok(conn)
    }

    fn with_conn<T>(
        &self,
        teambook: &str,
        f: impl FnOnce(&mut Connection) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut conns = self.conns.lock().expect("connection map poisoned");
        if !conns.contains_key(teambook) {
            let conn = self.open_database(&self.db_path(teambook))?;
            create_schema(&conn)?;
            conns.insert(teambook.to_string(), conn);
        }
        let conn = conns.get_mut(teambook).expect("connection just inserted");
        f(conn)
    }
}

impl Drop for SqliteBackend {
    fn drop(&mut self) {
        let temps = self.temp_dbs.lock().map(|t| t.clone()).unwrap_or_default();
        for path in temps {
            if let Err(err) = std::fs::remove_file(&path) {
                debug!(path = %path.display(), error = %err, "temp database cleanup failed");
            }
        }
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

fn create_schema(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS notes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            content TEXT NOT NULL,
            summary TEXT,
            tags TEXT NOT NULL DEFAULT '[]',
            pinned INTEGER NOT NULL DEFAULT 0,
            author TEXT NOT NULL,
            owner TEXT,
            type TEXT NOT NULL DEFAULT 'general',
            parent_id INTEGER,
            teambook_name TEXT NOT NULL,
            created TEXT NOT NULL,
            session_id INTEGER,
            linked_items TEXT NOT NULL DEFAULT '[]',
            pagerank REAL NOT NULL DEFAULT 0.0,
            has_vector INTEGER NOT NULL DEFAULT 0,
            representation_policy TEXT NOT NULL DEFAULT 'default',
            metadata TEXT NOT NULL DEFAULT '{}',
            tamper_hash TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_notes_created ON notes(created DESC);
        CREATE INDEX IF NOT EXISTS idx_notes_pinned ON notes(pinned DESC, created DESC);
        CREATE INDEX IF NOT EXISTS idx_notes_pagerank ON notes(pagerank DESC);
        CREATE INDEX IF NOT EXISTS idx_notes_type ON notes(type);

        CREATE TABLE IF NOT EXISTS edges (
            from_id INTEGER NOT NULL,
            to_id INTEGER NOT NULL,
            type TEXT NOT NULL,
            weight REAL NOT NULL DEFAULT 1.0,
            created TEXT NOT NULL,
            valid_from TEXT NOT NULL,
            valid_to TEXT,
            source_note_id INTEGER,
            metadata TEXT,
            PRIMARY KEY(from_id, to_id, type)
        );
        CREATE INDEX IF NOT EXISTS idx_edges_from ON edges(from_id);
        CREATE INDEX IF NOT EXISTS idx_edges_to ON edges(to_id);

        CREATE TABLE IF NOT EXISTS entities (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT UNIQUE NOT NULL,
            type TEXT NOT NULL,
            first_seen TEXT NOT NULL,
            last_seen TEXT NOT NULL,
            mention_count INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS entity_notes (
            entity_id INTEGER NOT NULL,
            note_id INTEGER NOT NULL,
            PRIMARY KEY(entity_id, note_id)
        );

        CREATE TABLE IF NOT EXISTS entity_facts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_id INTEGER NOT NULL,
            relation TEXT NOT NULL,
            value TEXT NOT NULL,
            target_entity_id INTEGER,
            valid_from TEXT NOT NULL,
            valid_to TEXT,
            source_note_id INTEGER NOT NULL,
            confidence REAL NOT NULL DEFAULT 0.7,
            metadata TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_entity_facts_lookup ON entity_facts(entity_id, relation);

        CREATE TABLE IF NOT EXISTS sessions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            started TEXT NOT NULL,
            ended TEXT NOT NULL,
            note_count INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            channel TEXT NOT NULL,
            from_ai TEXT NOT NULL,
            to_ai TEXT,
            content TEXT NOT NULL,
            summary TEXT,
            reply_to INTEGER,
            created TEXT NOT NULL,
            read INTEGER NOT NULL DEFAULT 0,
            expires_at TEXT NOT NULL,
            teambook_name TEXT NOT NULL,
            envelope TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_msg_channel ON messages(channel, created DESC);
        CREATE INDEX IF NOT EXISTS idx_msg_to_ai ON messages(to_ai, read, created DESC);
        CREATE INDEX IF NOT EXISTS idx_msg_expires ON messages(expires_at);

        CREATE TABLE IF NOT EXISTS locks (
            resource_id TEXT PRIMARY KEY,
            held_by TEXT NOT NULL,
            acquired_at TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            teambook_name TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS tasks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 5,
            status TEXT NOT NULL DEFAULT 'pending',
            author TEXT NOT NULL,
            claimed_by TEXT,
            created TEXT NOT NULL,
            claimed_at TEXT,
            completed_at TEXT,
            result TEXT,
            teambook_name TEXT NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            tamper_hash TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status, priority DESC, created);

        CREATE TABLE IF NOT EXISTS watches (
            ai_id TEXT NOT NULL,
            item_type TEXT NOT NULL,
            item_id TEXT NOT NULL,
            event_types TEXT NOT NULL DEFAULT '[]',
            last_activity TEXT NOT NULL,
            teambook_name TEXT NOT NULL,
            PRIMARY KEY(ai_id, item_type, item_id)
        );

        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            item_type TEXT NOT NULL,
            item_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            actor TEXT NOT NULL,
            summary TEXT,
            created TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            teambook_name TEXT NOT NULL,
            metadata TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_events_created ON events(created DESC);

        CREATE TABLE IF NOT EXISTS event_deliveries (
            event_id INTEGER NOT NULL,
            ai_id TEXT NOT NULL,
            seen INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY(event_id, ai_id)
        );

        CREATE TABLE IF NOT EXISTS presence (
            ai_id TEXT PRIMARY KEY,
            last_seen TEXT NOT NULL,
            last_operation TEXT NOT NULL,
            status_message TEXT,
            teambook_name TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS vault (
            key TEXT PRIMARY KEY,
            encrypted_value BLOB NOT NULL,
            created TEXT NOT NULL,
            updated TEXT NOT NULL,
            author TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS contributions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            evolution_id INTEGER NOT NULL,
            author TEXT NOT NULL,
            content TEXT NOT NULL,
            approach TEXT,
            created TEXT NOT NULL,
            avg_score REAL NOT NULL DEFAULT 0.0,
            rank_count INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_contrib_evo ON contributions(evolution_id);

        CREATE TABLE IF NOT EXISTS rankings (
            contribution_id INTEGER NOT NULL,
            ranked_by TEXT NOT NULL,
            score REAL NOT NULL,
            reason TEXT,
            created TEXT NOT NULL,
            PRIMARY KEY(contribution_id, ranked_by)
        );

        CREATE TABLE IF NOT EXISTS votes (
            evolution_id INTEGER NOT NULL,
            voter TEXT NOT NULL,
            preferred TEXT NOT NULL DEFAULT '[]',
            change_count INTEGER NOT NULL DEFAULT 0,
            updated TEXT NOT NULL,
            PRIMARY KEY(evolution_id, voter)
        );

        CREATE TABLE IF NOT EXISTS synthesis_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            evolution_id INTEGER NOT NULL,
            strategy TEXT NOT NULL,
            output_path TEXT NOT NULL,
            contribution_count INTEGER NOT NULL,
            author TEXT NOT NULL,
            created TEXT NOT NULL,
            teambook_name TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS contribution_conflicts (
            evolution_id INTEGER NOT NULL,
            contribution_a INTEGER NOT NULL,
            contribution_b INTEGER NOT NULL,
            topic TEXT NOT NULL,
            detected TEXT NOT NULL,
            PRIMARY KEY(evolution_id, contribution_a, contribution_b, topic)
        );

        CREATE TABLE IF NOT EXISTS coordination_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_type TEXT NOT NULL,
            ai_id TEXT NOT NULL,
            task_id INTEGER,
            summary TEXT,
            created TEXT NOT NULL,
            metadata TEXT,
            teambook_name TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS teambooks (
            name TEXT PRIMARY KEY,
            created TEXT NOT NULL,
            created_by TEXT NOT NULL,
            last_active TEXT
        );

        CREATE TABLE IF NOT EXISTS stats (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            operation TEXT NOT NULL,
            ts TEXT NOT NULL,
            dur_ms INTEGER,
            author TEXT NOT NULL
        );
        "#,
    )
    .map_err(sql_err)
}

// ============================================================================
// ROW MAPPING HELPERS
// ============================================================================

fn sql_err(err: rusqlite::Error) -> StorageError {
    match err {
        rusqlite::Error::SqliteFailure(code, ref msg)
            if code.code == rusqlite::ErrorCode::DatabaseBusy
                || code.code == rusqlite::ErrorCode::DatabaseLocked =>
        {
            StorageError::Contention(msg.clone().unwrap_or_else(|| err.to_string()))
        }
        other => StorageError::Query(other.to_string()),
    }
}

fn fmt_ts(ts: Timestamp) -> String {
    ts.to_rfc3339()
}

fn parse_ts(value: &str) -> rusqlite::Result<Timestamp> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_json(value: Option<String>) -> JsonValue {
    value
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or(JsonValue::Null)
}

fn parse_string_vec(value: String) -> Vec<String> {
    serde_json::from_str(&value).unwrap_or_default()
}

fn note_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Note> {
    Ok(Note {
        id: NoteId::new(row.get(0)?),
        content: row.get(1)?,
        summary: row.get(2)?,
        tags: parse_string_vec(row.get(3)?),
        pinned: row.get::<_, i64>(4)? != 0,
        author: AiId::new(row.get::<_, String>(5)?),
        owner: row.get::<_, Option<String>>(6)?.map(AiId::new),
        note_type: row.get(7)?,
        parent_id: row.get::<_, Option<i64>>(8)?.map(NoteId::new),
        teambook: row.get(9)?,
        created: parse_ts(&row.get::<_, String>(10)?)?,
        session_id: row.get::<_, Option<i64>>(11)?.map(SessionId::new),
        linked_items: parse_string_vec(row.get(12)?),
        pagerank: row.get(13)?,
        has_vector: row.get::<_, i64>(14)? != 0,
        representation_policy: RepresentationPolicy::from_str(&row.get::<_, String>(15)?)
            .unwrap_or_default(),
        metadata: {
            let meta = parse_json(row.get(16)?);
            if meta.is_null() {
                serde_json::json!({})
            } else {
                meta
            }
        },
        tamper_hash: row.get(17)?,
    })
}

const NOTE_COLUMNS: &str = "id, content, summary, tags, pinned, author, owner, type, parent_id, \
    teambook_name, created, session_id, linked_items, pagerank, has_vector, \
    representation_policy, metadata, tamper_hash";

fn edge_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Edge> {
    Ok(Edge {
        from_id: NoteId::new(row.get(0)?),
        to_id: NoteId::new(row.get(1)?),
        edge_type: EdgeType::from_str(&row.get::<_, String>(2)?).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                e.into(),
            )
        })?,
        weight: row.get(3)?,
        created: parse_ts(&row.get::<_, String>(4)?)?,
        valid_from: parse_ts(&row.get::<_, String>(5)?)?,
        valid_to: row
            .get::<_, Option<String>>(6)?
            .map(|s| parse_ts(&s))
            .transpose()?,
        source_note_id: row.get::<_, Option<i64>>(7)?.map(NoteId::new),
        metadata: row.get::<_, Option<String>>(8)?.map(|s| parse_json(Some(s))),
    })
}

fn task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: TaskId::new(row.get(0)?),
        task: row.get(1)?,
        priority: row.get::<_, i64>(2)? as u8,
        status: TaskStatus::from_str(&row.get::<_, String>(3)?).unwrap_or(TaskStatus::Pending),
        author: AiId::new(row.get::<_, String>(4)?),
        claimed_by: row.get::<_, Option<String>>(5)?.map(AiId::new),
        created: parse_ts(&row.get::<_, String>(6)?)?,
        claimed_at: row
            .get::<_, Option<String>>(7)?
            .map(|s| parse_ts(&s))
            .transpose()?,
        completed_at: row
            .get::<_, Option<String>>(8)?
            .map(|s| parse_ts(&s))
            .transpose()?,
        result: row.get(9)?,
        teambook: row.get(10)?,
        metadata: {
            let meta = parse_json(row.get(11)?);
            if meta.is_null() {
                serde_json::json!({})
            } else {
                meta
            }
        },
        tamper_hash: row.get(12)?,
    })
}

const TASK_COLUMNS: &str = "id, task, priority, status, author, claimed_by, created, claimed_at, \
    completed_at, result, teambook_name, metadata, tamper_hash";

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: MessageId::new(row.get(0)?),
        channel: row.get(1)?,
        from_ai: AiId::new(row.get::<_, String>(2)?),
        to_ai: row.get::<_, Option<String>>(3)?.map(AiId::new),
        content: row.get(4)?,
        summary: row.get(5)?,
        reply_to: row.get::<_, Option<i64>>(6)?.map(MessageId::new),
        created: parse_ts(&row.get::<_, String>(7)?)?,
        read: row.get::<_, i64>(8)? != 0,
        expires_at: parse_ts(&row.get::<_, String>(9)?)?,
        teambook: row.get(10)?,
        envelope: row
            .get::<_, Option<String>>(11)?
            .and_then(|s| serde_json::from_str(&s).ok()),
    })
}

const MESSAGE_COLUMNS: &str =
    "id, channel, from_ai, to_ai, content, summary, reply_to, created, read, expires_at, \
     teambook_name, envelope";

// ============================================================================
// TRAIT IMPLEMENTATION
// ============================================================================

#[async_trait]
impl StorageBackend for SqliteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Embedded
    }

    async fn ping(&self) -> StorageResult<()> {
        // Opening (or reusing) the private scope is the embedded liveness
        // check; it also primes the schema.
        self.with_conn(PRIVATE_TEAMBOOK, |conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))
                .map_err(sql_err)
        })
    }

    // ------------------------------------------------------------------
    // Notes
    // ------------------------------------------------------------------

    async fn insert_note(&self, note: NewNote) -> StorageResult<NoteId> {
        let teambook = note.teambook.clone();
        self.with_conn(&teambook, |conn| {
            conn.execute(
                "INSERT INTO notes (content, summary, tags, pinned, author, owner, type, \
                 parent_id, teambook_name, created, session_id, linked_items, pagerank, \
                 has_vector, representation_policy, metadata, tamper_hash) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 0.0, ?13, ?14, ?15, ?16)",
                params![
                    note.content,
                    note.summary,
                    serde_json::to_string(&note.tags)?,
                    note.pinned as i64,
                    note.author.as_str(),
                    note.owner.as_ref().map(|o| o.as_str().to_string()),
                    note.note_type,
                    note.parent_id.map(|p| p.as_i64()),
                    note.teambook,
                    fmt_ts(note.created),
                    note.session_id.map(|s| s.as_i64()),
                    serde_json::to_string(&note.linked_items)?,
                    note.has_vector as i64,
                    note.representation_policy.as_str(),
                    serde_json::to_string(&note.metadata)?,
                    note.tamper_hash,
                ],
            )
            .map_err(sql_err)?;
            Ok(NoteId::new(conn.last_insert_rowid()))
        })
    }

    async fn get_note(&self, teambook: &str, id: NoteId) -> StorageResult<Option<Note>> {
        self.with_conn(teambook, |conn| {
            conn.query_row(
                &format!("SELECT {} FROM notes WHERE id = ?1", NOTE_COLUMNS),
                params![id.as_i64()],
                note_from_row,
            )
            .optional()
            .map_err(sql_err)
        })
    }

    async fn read_notes(&self, filter: &NoteFilter) -> StorageResult<Vec<Note>> {
        self.with_conn(&filter.teambook, |conn| {
            let mut sql = format!("SELECT {} FROM notes WHERE teambook_name = ?", NOTE_COLUMNS);
            let mut args: Vec<Box<dyn rusqlite::ToSql>> =
                vec![Box::new(filter.teambook.clone())];

            if let Some(tag) = &filter.tag {
                // Tags are a JSON array; membership via a quoted LIKE probe.
                sql.push_str(" AND tags LIKE ?");
                args.push(Box::new(format!("%\"{}\"%", tag)));
            }
            if let Some(owner) = &filter.owner {
                sql.push_str(" AND owner = ?");
                args.push(Box::new(owner.as_str().to_string()));
            }
            if let Some(author) = &filter.author {
                sql.push_str(" AND author = ?");
                args.push(Box::new(author.as_str().to_string()));
            }
            if let Some(note_type) = &filter.note_type {
                sql.push_str(" AND type = ?");
                args.push(Box::new(note_type.clone()));
            }
            if filter.pinned_only == Some(true) {
                sql.push_str(" AND pinned = 1");
            }
            if let Some(session) = filter.session_id {
                sql.push_str(" AND session_id = ?");
                args.push(Box::new(session.as_i64()));
            }
            if let Some(query) = &filter.query {
                sql.push_str(" AND (content LIKE ? OR summary LIKE ?)");
                let like = format!("%{}%", query);
                args.push(Box::new(like.clone()));
                args.push(Box::new(like));
            }

            match filter.mode {
                ReadMode::Important => {
                    sql.push_str(" ORDER BY pinned DESC, pagerank DESC, created DESC")
                }
                ReadMode::Recent => sql.push_str(" ORDER BY created DESC"),
            }
            sql.push_str(" LIMIT ? OFFSET ?");
            args.push(Box::new(filter.limit as i64));
            args.push(Box::new(filter.offset as i64));

            let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
            let rows = stmt
                .query_map(params_from_iter(args.iter().map(|a| a.as_ref())), note_from_row)
                .map_err(sql_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql_err)?;
            Ok(rows)
        })
    }

    async fn update_note(
        &self,
        teambook: &str,
        id: NoteId,
        patch: NotePatch,
    ) -> StorageResult<Option<Note>> {
        self.with_conn(teambook, |conn| {
            let tx = conn.transaction().map_err(sql_err)?;
            let existing = tx
                .query_row(
                    &format!("SELECT {} FROM notes WHERE id = ?1", NOTE_COLUMNS),
                    params![id.as_i64()],
                    note_from_row,
                )
                .optional()
                .map_err(sql_err)?;

            let Some(mut note) = existing else {
                return Ok(None);
            };

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
            // Tamper hash always reflects the merged post-update state.
            note.tamper_hash = note.compute_tamper_hash();

            tx.execute(
                "UPDATE notes SET content = ?1, summary = ?2, tags = ?3, pinned = ?4, \
                 owner = ?5, linked_items = ?6, metadata = ?7, tamper_hash = ?8 WHERE id = ?9",
                params![
                    note.content,
                    note.summary,
                    serde_json::to_string(&note.tags)?,
                    note.pinned as i64,
                    note.owner.as_ref().map(|o| o.as_str().to_string()),
                    serde_json::to_string(&note.linked_items)?,
                    serde_json::to_string(&note.metadata)?,
                    note.tamper_hash,
                    id.as_i64(),
                ],
            )
            .map_err(sql_err)?;
            tx.commit().map_err(sql_err)?;
            Ok(Some(note))
        })
    }

    async fn delete_note(&self, teambook: &str, id: NoteId) -> StorageResult<bool> {
        self.with_conn(teambook, |conn| {
            let affected = conn
                .execute("DELETE FROM notes WHERE id = ?1", params![id.as_i64()])
                .map_err(sql_err)?;
            conn.execute(
                "DELETE FROM edges WHERE from_id = ?1 OR to_id = ?1",
                params![id.as_i64()],
            )
            .map_err(sql_err)?;
            Ok(affected > 0)
        })
    }

    async fn note_count(&self, teambook: &str) -> StorageResult<u64> {
        self.with_conn(teambook, |conn| {
            conn.query_row("SELECT COUNT(*) FROM notes", [], |row| row.get::<_, i64>(0))
                .map(|n| n as u64)
                .map_err(sql_err)
        })
    }

    async fn last_note_meta(&self, teambook: &str) -> StorageResult<Option<LastNoteMeta>> {
        self.with_conn(teambook, |conn| {
            conn.query_row(
                "SELECT id, created, session_id FROM notes ORDER BY id DESC LIMIT 1",
                [],
                |row| {
                    Ok(LastNoteMeta {
                        id: NoteId::new(row.get(0)?),
                        created: parse_ts(&row.get::<_, String>(1)?)?,
                        session_id: row.get::<_, Option<i64>>(2)?.map(SessionId::new),
                    })
                },
            )
            .optional()
            .map_err(sql_err)
        })
    }

    async fn existing_note_ids(
        &self,
        teambook: &str,
        ids: &[NoteId],
    ) -> StorageResult<Vec<NoteId>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        self.with_conn(teambook, |conn| {
            let placeholders = vec!["?"; ids.len()].join(",");
            let sql = format!("SELECT id FROM notes WHERE id IN ({})", placeholders);
            let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
            let rows = stmt
                .query_map(
                    params_from_iter(ids.iter().map(|id| id.as_i64())),
                    |row| row.get::<_, i64>(0).map(NoteId::new),
                )
                .map_err(sql_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql_err)?;
            Ok(rows)
        })
    }

    async fn recent_note_ids(
        &self,
        teambook: &str,
        before: NoteId,
        limit: usize,
    ) -> StorageResult<Vec<NoteId>> {
        self.with_conn(teambook, |conn| {
            let mut stmt = conn
                .prepare("SELECT id FROM notes WHERE id < ?1 ORDER BY id DESC LIMIT ?2")
                .map_err(sql_err)?;
            let rows = stmt
                .query_map(params![before.as_i64(), limit as i64], |row| {
                    row.get::<_, i64>(0).map(NoteId::new)
                })
                .map_err(sql_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql_err)?;
            Ok(rows)
        })
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    async fn create_session(&self, teambook: &str, started: Timestamp) -> StorageResult<SessionId> {
        self.with_conn(teambook, |conn| {
            conn.execute(
                "INSERT INTO sessions (started, ended) VALUES (?1, ?1)",
                params![fmt_ts(started)],
            )
            .map_err(sql_err)?;
            Ok(SessionId::new(conn.last_insert_rowid()))
        })
    }

    async fn touch_session(
        &self,
        teambook: &str,
        id: SessionId,
        ended: Timestamp,
    ) -> StorageResult<()> {
        self.with_conn(teambook, |conn| {
            conn.execute(
                "UPDATE sessions SET ended = ?1, note_count = note_count + 1 WHERE id = ?2",
                params![fmt_ts(ended), id.as_i64()],
            )
            .map_err(sql_err)?;
            Ok(())
        })
    }

    async fn session_note_ids(
        &self,
        teambook: &str,
        id: SessionId,
        exclude: NoteId,
    ) -> StorageResult<Vec<NoteId>> {
        self.with_conn(teambook, |conn| {
            let mut stmt = conn
                .prepare("SELECT id FROM notes WHERE session_id = ?1 AND id != ?2")
                .map_err(sql_err)?;
            let rows = stmt
                .query_map(params![id.as_i64(), exclude.as_i64()], |row| {
                    row.get::<_, i64>(0).map(NoteId::new)
                })
                .map_err(sql_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql_err)?;
            Ok(rows)
        })
    }

    // ------------------------------------------------------------------
    // Edges and PageRank
    // ------------------------------------------------------------------

    async fn upsert_edge(&self, teambook: &str, edge: &Edge) -> StorageResult<()> {
        self.with_conn(teambook, |conn| {
            conn.execute(
                "INSERT INTO edges (from_id, to_id, type, weight, created, valid_from, valid_to, \
                 source_note_id, metadata) VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, ?8) \
                 ON CONFLICT(from_id, to_id, type) DO UPDATE SET \
                   weight = excluded.weight, \
                   created = excluded.created, \
                   source_note_id = COALESCE(excluded.source_note_id, edges.source_note_id), \
                   metadata = COALESCE(excluded.metadata, edges.metadata), \
                   valid_from = CASE WHEN excluded.created < edges.valid_from \
                       THEN excluded.created ELSE edges.valid_from END, \
                   valid_to = NULL",
                params![
                    edge.from_id.as_i64(),
                    edge.to_id.as_i64(),
                    edge.edge_type.as_str(),
                    edge.weight,
                    fmt_ts(edge.created),
                    fmt_ts(edge.valid_from),
                    edge.source_note_id.map(|n| n.as_i64()),
                    edge.metadata
                        .as_ref()
                        .map(|m| serde_json::to_string(m))
                        .transpose()?,
                ],
            )
            .map_err(sql_err)?;
            Ok(())
        })
    }

    async fn edges_for(
        &self,
        teambook: &str,
        note: NoteId,
        reverse: bool,
    ) -> StorageResult<Vec<Edge>> {
        self.with_conn(teambook, |conn| {
            let column = if reverse { "to_id" } else { "from_id" };
            let sql = format!(
                "SELECT from_id, to_id, type, weight, created, valid_from, valid_to, \
                 source_note_id, metadata FROM edges WHERE {} = ?1",
                column
            );
            let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
            let rows = stmt
                .query_map(params![note.as_i64()], edge_from_row)
                .map_err(sql_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql_err)?;
            Ok(rows)
        })
    }

    async fn adjacency(&self, teambook: &str) -> StorageResult<Vec<(i64, i64, f64)>> {
        self.with_conn(teambook, |conn| {
            let mut stmt = conn
                .prepare("SELECT from_id, to_id, weight FROM edges WHERE valid_to IS NULL")
                .map_err(sql_err)?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
                .map_err(sql_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql_err)?;
            Ok(rows)
        })
    }

    async fn store_pagerank(&self, teambook: &str, scores: &[(NoteId, f64)]) -> StorageResult<()> {
        self.with_conn(teambook, |conn| {
            let tx = conn.transaction().map_err(sql_err)?;
            {
                let mut stmt = tx
                    .prepare("UPDATE notes SET pagerank = ?1 WHERE id = ?2")
                    .map_err(sql_err)?;
                for (id, score) in scores {
                    stmt.execute(params![score, id.as_i64()]).map_err(sql_err)?;
                }
            }
            tx.commit().map_err(sql_err)
        })
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
        self.with_conn(teambook, |conn| {
            let existing: Option<i64> = conn
                .query_row(
                    "SELECT id FROM entities WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sql_err)?;
            match existing {
                Some(id) => {
                    conn.execute(
                        "UPDATE entities SET last_seen = ?1, mention_count = mention_count + 1 \
                         WHERE id = ?2",
                        params![fmt_ts(now), id],
                    )
                    .map_err(sql_err)?;
                    Ok(EntityId::new(id))
                }
                None => {
                    conn.execute(
                        "INSERT INTO entities (name, type, first_seen, last_seen) \
                         VALUES (?1, ?2, ?3, ?3)",
                        params![name, kind.as_str(), fmt_ts(now)],
                    )
                    .map_err(sql_err)?;
                    Ok(EntityId::new(conn.last_insert_rowid()))
                }
            }
        })
    }

    async fn link_entity_note(
        &self,
        teambook: &str,
        entity: EntityId,
        note: NoteId,
    ) -> StorageResult<()> {
        self.with_conn(teambook, |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO entity_notes (entity_id, note_id) VALUES (?1, ?2)",
                params![entity.as_i64(), note.as_i64()],
            )
            .map_err(sql_err)?;
            Ok(())
        })
    }

    async fn entity_note_ids(&self, teambook: &str, entity: EntityId) -> StorageResult<Vec<NoteId>> {
        self.with_conn(teambook, |conn| {
            let mut stmt = conn
                .prepare("SELECT note_id FROM entity_notes WHERE entity_id = ?1")
                .map_err(sql_err)?;
            let rows = stmt
                .query_map(params![entity.as_i64()], |row| {
                    row.get::<_, i64>(0).map(NoteId::new)
                })
                .map_err(sql_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql_err)?;
            Ok(rows)
        })
    }

    async fn known_entity_names(&self, teambook: &str) -> StorageResult<Vec<String>> {
        self.with_conn(teambook, |conn| {
            let mut stmt = conn.prepare("SELECT name FROM entities").map_err(sql_err)?;
            let rows = stmt
                .query_map([], |row| row.get(0))
                .map_err(sql_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql_err)?;
            Ok(rows)
        })
    }

    async fn find_open_fact(
        &self,
        teambook: &str,
        entity: EntityId,
        relation: &str,
        value: &str,
    ) -> StorageResult<Option<EntityFact>> {
        self.with_conn(teambook, |conn| {
            conn.query_row(
                "SELECT id, entity_id, relation, value, target_entity_id, valid_from, valid_to, \
                 source_note_id, confidence, metadata FROM entity_facts \
                 WHERE entity_id = ?1 AND relation = ?2 AND value = ?3 AND valid_to IS NULL",
                params![entity.as_i64(), relation, value],
                fact_from_row,
            )
            .optional()
            .map_err(sql_err)
        })
    }

    async fn refresh_fact(
        &self,
        teambook: &str,
        id: FactId,
        valid_from: Timestamp,
        source_note_id: NoteId,
        confidence: f64,
    ) -> StorageResult<()> {
        self.with_conn(teambook, |conn| {
            conn.execute(
                "UPDATE entity_facts SET valid_from = ?1, source_note_id = ?2, confidence = ?3 \
                 WHERE id = ?4",
                params![fmt_ts(valid_from), source_note_id.as_i64(), confidence, id.as_i64()],
            )
            .map_err(sql_err)?;
            Ok(())
        })
    }

    async fn close_open_facts(
        &self,
        teambook: &str,
        entity: EntityId,
        relation: &str,
        except_value: &str,
        now: Timestamp,
    ) -> StorageResult<u64> {
        self.with_conn(teambook, |conn| {
            let affected = conn
                .execute(
                    "UPDATE entity_facts SET valid_to = ?1 \
                     WHERE entity_id = ?2 AND relation = ?3 AND valid_to IS NULL AND value != ?4",
                    params![fmt_ts(now), entity.as_i64(), relation, except_value],
                )
                .map_err(sql_err)?;
            Ok(affected as u64)
        })
    }

    async fn insert_fact(&self, teambook: &str, fact: NewFact) -> StorageResult<FactId> {
        self.with_conn(teambook, |conn| {
            conn.execute(
                "INSERT INTO entity_facts (entity_id, relation, value, target_entity_id, \
                 valid_from, valid_to, source_note_id, confidence, metadata) \
                 VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, ?7, ?8)",
                params![
                    fact.entity_id.as_i64(),
                    fact.relation,
                    fact.value,
                    fact.target_entity_id.map(|t| t.as_i64()),
                    fmt_ts(fact.valid_from),
                    fact.source_note_id.as_i64(),
                    fact.confidence,
                    fact.metadata
                        .as_ref()
                        .map(|m| serde_json::to_string(m))
                        .transpose()?,
                ],
            )
            .map_err(sql_err)?;
            Ok(FactId::new(conn.last_insert_rowid()))
        })
    }

    async fn fact_candidates(
        &self,
        teambook: &str,
        token: &str,
        limit: usize,
    ) -> StorageResult<Vec<FactCandidate>> {
        self.with_conn(teambook, |conn| {
            let like = format!("%{}%", token);
            let mut stmt = conn
                .prepare(
                    "SELECT source_note_id, entity_id, relation, value, confidence \
                     FROM entity_facts \
                     WHERE valid_to IS NULL AND (value LIKE ?1 OR relation LIKE ?1) \
                     ORDER BY confidence DESC, valid_from DESC LIMIT ?2",
                )
                .map_err(sql_err)?;
            let rows = stmt
                .query_map(params![like, limit as i64], |row| {
                    Ok(FactCandidate {
                        note_id: NoteId::new(row.get(0)?),
                        entity_id: EntityId::new(row.get(1)?),
                        relation: row.get(2)?,
                        value: row.get(3)?,
                        confidence: row.get(4)?,
                    })
                })
                .map_err(sql_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql_err)?;
            Ok(rows)
        })
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    async fn insert_message(&self, msg: NewMessage) -> StorageResult<MessageId> {
        let teambook = msg.teambook.clone();
        self.with_conn(&teambook, |conn| {
            conn.execute(
                "INSERT INTO messages (channel, from_ai, to_ai, content, summary, reply_to, \
                 created, read, expires_at, teambook_name, envelope) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9, ?10)",
                params![
                    msg.channel,
                    msg.from_ai.as_str(),
                    msg.to_ai.as_ref().map(|t| t.as_str().to_string()),
                    msg.content,
                    msg.summary,
                    msg.reply_to.map(|r| r.as_i64()),
                    fmt_ts(msg.created),
                    fmt_ts(msg.expires_at),
                    msg.teambook,
                    msg.envelope
                        .as_ref()
                        .map(|e| serde_json::to_string(e))
                        .transpose()?,
                ],
            )
            .map_err(sql_err)?;
            Ok(MessageId::new(conn.last_insert_rowid()))
        })
    }

    async fn read_messages(&self, filter: &MessageFilter) -> StorageResult<Vec<Message>> {
        self.with_conn(&filter.teambook, |conn| {
            let mut sql = format!(
                "SELECT {} FROM messages WHERE teambook_name = ? AND expires_at > ?",
                MESSAGE_COLUMNS
            );
            let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![
                Box::new(filter.teambook.clone()),
                Box::new(fmt_ts(Utc::now())),
            ];

            if let Some(channel) = &filter.channel {
                sql.push_str(" AND channel = ?");
                args.push(Box::new(channel.clone()));
            }
            if let Some(to_ai) = &filter.to_ai {
                sql.push_str(" AND to_ai = ?");
                args.push(Box::new(to_ai.as_str().to_string()));
            }
            if let Some(from_ai) = &filter.from_ai {
                sql.push_str(" AND from_ai = ?");
                args.push(Box::new(from_ai.as_str().to_string()));
            }
            if let Some(since) = filter.since {
                sql.push_str(" AND created > ?");
                args.push(Box::new(fmt_ts(since)));
            }
            if filter.unread_only {
                sql.push_str(" AND read = 0");
            }
            if let Some(thread) = filter.thread_id {
                sql.push_str(" AND (id = ? OR reply_to = ?)");
                args.push(Box::new(thread.as_i64()));
                args.push(Box::new(thread.as_i64()));
            }
            sql.push_str(" ORDER BY created DESC LIMIT ?");
            args.push(Box::new(filter.limit as i64));

            let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
            let rows = stmt
                .query_map(
                    params_from_iter(args.iter().map(|a| a.as_ref())),
                    message_from_row,
                )
                .map_err(sql_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql_err)?;
            Ok(rows)
        })
    }

    async fn mark_messages_read(&self, teambook: &str, ids: &[MessageId]) -> StorageResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.with_conn(teambook, |conn| {
            let placeholders = vec!["?"; ids.len()].join(",");
            let sql = format!("UPDATE messages SET read = 1 WHERE id IN ({})", placeholders);
            let affected = conn
                .execute(&sql, params_from_iter(ids.iter().map(|id| id.as_i64())))
                .map_err(sql_err)?;
            Ok(affected as u64)
        })
    }

    async fn purge_expired_messages(&self, teambook: &str) -> StorageResult<u64> {
        self.with_conn(teambook, |conn| {
            let affected = conn
                .execute(
                    "DELETE FROM messages WHERE expires_at < ?1",
                    params![fmt_ts(Utc::now())],
                )
                .map_err(sql_err)?;
            Ok(affected as u64)
        })
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
        self.with_conn(teambook, |conn| {
            let now = Utc::now();
            let tx = conn.transaction().map_err(sql_err)?;
            let existing = tx
                .query_row(
                    "SELECT held_by, expires_at FROM locks WHERE resource_id = ?1",
                    params![resource_id],
                    |row| {
                        Ok((
                            AiId::new(row.get::<_, String>(0)?),
                            parse_ts(&row.get::<_, String>(1)?)?,
                        ))
                    },
                )
                .optional()
                .map_err(sql_err)?;

            if let Some((held_by, expires_at)) = existing {
                if expires_at > now && held_by != *holder {
                    return Ok(LockAttempt::Held { held_by, expires_at });
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
                "INSERT INTO locks (resource_id, held_by, acquired_at, expires_at, teambook_name) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(resource_id) DO UPDATE SET \
                   held_by = excluded.held_by, acquired_at = excluded.acquired_at, \
                   expires_at = excluded.expires_at",
                params![
                    lock.resource_id,
                    lock.held_by.as_str(),
                    fmt_ts(lock.acquired_at),
                    fmt_ts(lock.expires_at),
                    lock.teambook,
                ],
            )
            .map_err(sql_err)?;
            tx.commit().map_err(sql_err)?;
            Ok(LockAttempt::Acquired(lock))
        })
    }

    async fn release_lock(
        &self,
        teambook: &str,
        resource_id: &str,
        holder: &AiId,
    ) -> StorageResult<ReleaseOutcome> {
        self.with_conn(teambook, |conn| {
            let existing: Option<String> = conn
                .query_row(
                    "SELECT held_by FROM locks WHERE resource_id = ?1",
                    params![resource_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sql_err)?;
            match existing {
                None => Ok(ReleaseOutcome::NotLocked),
                Some(held_by) if held_by != holder.as_str() => Ok(ReleaseOutcome::NotHolder {
                    held_by: AiId::new(held_by),
                }),
                Some(_) => {
                    conn.execute(
                        "DELETE FROM locks WHERE resource_id = ?1 AND held_by = ?2",
                        params![resource_id, holder.as_str()],
                    )
                    .map_err(sql_err)?;
                    Ok(ReleaseOutcome::Released)
                }
            }
        })
    }

    async fn extend_lock(
        &self,
        teambook: &str,
        resource_id: &str,
        holder: &AiId,
        new_expiry: Timestamp,
    ) -> StorageResult<Option<Lock>> {
        self.with_conn(teambook, |conn| {
            let affected = conn
                .execute(
                    "UPDATE locks SET expires_at = ?1 WHERE resource_id = ?2 AND held_by = ?3",
                    params![fmt_ts(new_expiry), resource_id, holder.as_str()],
                )
                .map_err(sql_err)?;
            if affected == 0 {
                return Ok(None);
            }
            conn.query_row(
                "SELECT resource_id, held_by, acquired_at, expires_at, teambook_name \
                 FROM locks WHERE resource_id = ?1",
                params![resource_id],
                |row| {
                    Ok(Lock {
                        resource_id: row.get(0)?,
                        held_by: AiId::new(row.get::<_, String>(1)?),
                        acquired_at: parse_ts(&row.get::<_, String>(2)?)?,
                        expires_at: parse_ts(&row.get::<_, String>(3)?)?,
                        teambook: row.get(4)?,
                    })
                },
            )
            .optional()
            .map_err(sql_err)
        })
    }

    async fn locks_held_by(&self, teambook: &str, holder: &AiId) -> StorageResult<u64> {
        self.with_conn(teambook, |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM locks WHERE held_by = ?1 AND expires_at > ?2",
                params![holder.as_str(), fmt_ts(Utc::now())],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as u64)
            .map_err(sql_err)
        })
    }

    async fn sweep_expired_locks(&self, teambook: &str) -> StorageResult<u64> {
        self.with_conn(teambook, |conn| {
            let affected = conn
                .execute(
                    "DELETE FROM locks WHERE expires_at < ?1",
                    params![fmt_ts(Utc::now())],
                )
                .map_err(sql_err)?;
            Ok(affected as u64)
        })
    }

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    async fn insert_task(&self, task: NewTask) -> StorageResult<TaskId> {
        let teambook = task.teambook.clone();
        self.with_conn(&teambook, |conn| {
            conn.execute(
                "INSERT INTO tasks (task, priority, status, author, created, teambook_name, \
                 metadata, tamper_hash) VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6, ?7)",
                params![
                    task.task,
                    task.priority as i64,
                    task.author.as_str(),
                    fmt_ts(task.created),
                    task.teambook,
                    serde_json::to_string(&task.metadata)?,
                    task.tamper_hash,
                ],
            )
            .map_err(sql_err)?;
            Ok(TaskId::new(conn.last_insert_rowid()))
        })
    }

    async fn pending_task_count(&self, teambook: &str) -> StorageResult<u64> {
        self.with_conn(teambook, |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM tasks WHERE status = 'pending'",
                [],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as u64)
            .map_err(sql_err)
        })
    }

    async fn claim_next_task(
        &self,
        teambook: &str,
        claimer: &AiId,
        prefer_priority: bool,
        now: Timestamp,
    ) -> StorageResult<Option<Task>> {
        self.with_conn(teambook, |conn| {
            let tx = conn.transaction().map_err(sql_err)?;
            let order = if prefer_priority {
                "priority DESC, created ASC"
            } else {
                "created ASC"
            };
            let candidate = tx
                .query_row(
                    &format!(
                        "SELECT {} FROM tasks WHERE status = 'pending' ORDER BY {} LIMIT 1",
                        TASK_COLUMNS, order
                    ),
                    [],
                    task_from_row,
                )
                .optional()
                .map_err(sql_err)?;

            let Some(mut task) = candidate else {
                return Ok(None);
            };
            task.status = TaskStatus::Claimed;
            task.claimed_by = Some(claimer.clone());
            task.claimed_at = Some(now);
            task.tamper_hash = task.compute_tamper_hash();

            // Guarded update: the claim wins only if the row is still
            // pending at commit time.
            let affected = tx
                .execute(
                    "UPDATE tasks SET status = 'claimed', claimed_by = ?1, claimed_at = ?2, \
                     tamper_hash = ?3 WHERE id = ?4 AND status = 'pending'",
                    params![
                        claimer.as_str(),
                        fmt_ts(now),
                        task.tamper_hash,
                        task.id.as_i64()
                    ],
                )
                .map_err(sql_err)?;
            tx.commit().map_err(sql_err)?;
            if affected == 0 {
                return Ok(None);
            }
            Ok(Some(task))
        })
    }

    async fn get_task(&self, teambook: &str, id: TaskId) -> StorageResult<Option<Task>> {
        self.with_conn(teambook, |conn| {
            conn.query_row(
                &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
                params![id.as_i64()],
                task_from_row,
            )
            .optional()
            .map_err(sql_err)
        })
    }

    async fn complete_task(
        &self,
        teambook: &str,
        id: TaskId,
        caller: &AiId,
        result: Option<String>,
        now: Timestamp,
    ) -> StorageResult<CompleteOutcome> {
        self.with_conn(teambook, |conn| {
            let tx = conn.transaction().map_err(sql_err)?;
            let existing = tx
                .query_row(
                    &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
                    params![id.as_i64()],
                    task_from_row,
                )
                .optional()
                .map_err(sql_err)?;

            let Some(mut task) = existing else {
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

            tx.execute(
                "UPDATE tasks SET status = 'completed', completed_at = ?1, result = ?2, \
                 tamper_hash = ?3 WHERE id = ?4",
                params![
                    fmt_ts(now),
                    task.result,
                    task.tamper_hash,
                    task.id.as_i64()
                ],
            )
            .map_err(sql_err)?;
            tx.commit().map_err(sql_err)?;
            Ok(CompleteOutcome::Completed(task))
        })
    }

    // ------------------------------------------------------------------
    // Watches and events
    // ------------------------------------------------------------------

    async fn upsert_watch(&self, watch: &Watch) -> StorageResult<bool> {
        self.with_conn(&watch.teambook, |conn| {
            let existed: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM watches WHERE ai_id = ?1 AND item_type = ?2 AND item_id = ?3",
                    params![watch.ai_id.as_str(), watch.item_type.as_str(), watch.item_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sql_err)?;
            conn.execute(
                "INSERT INTO watches (ai_id, item_type, item_id, event_types, last_activity, \
                 teambook_name) VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(ai_id, item_type, item_id) DO UPDATE SET \
                   event_types = excluded.event_types, last_activity = excluded.last_activity",
                params![
                    watch.ai_id.as_str(),
                    watch.item_type.as_str(),
                    watch.item_id,
                    serde_json::to_string(&watch.event_types)?,
                    fmt_ts(watch.last_activity),
                    watch.teambook,
                ],
            )
            .map_err(sql_err)?;
            Ok(existed.is_none())
        })
    }

    async fn delete_watch(
        &self,
        teambook: &str,
        ai_id: &AiId,
        item_type: ItemType,
        item_id: &str,
    ) -> StorageResult<bool> {
        self.with_conn(teambook, |conn| {
            let affected = conn
                .execute(
                    "DELETE FROM watches WHERE ai_id = ?1 AND item_type = ?2 AND item_id = ?3",
                    params![ai_id.as_str(), item_type.as_str(), item_id],
                )
                .map_err(sql_err)?;
            Ok(affected > 0)
        })
    }

    async fn count_watches(&self, teambook: &str, ai_id: &AiId) -> StorageResult<u64> {
        self.with_conn(teambook, |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM watches WHERE ai_id = ?1",
                params![ai_id.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as u64)
            .map_err(sql_err)
        })
    }

    async fn watches_for_ai(&self, teambook: &str, ai_id: &AiId) -> StorageResult<Vec<Watch>> {
        self.with_conn(teambook, |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT ai_id, item_type, item_id, event_types, last_activity, teambook_name \
                     FROM watches WHERE ai_id = ?1",
                )
                .map_err(sql_err)?;
            let rows = stmt
                .query_map(params![ai_id.as_str()], |row| {
                    Ok(Watch {
                        ai_id: AiId::new(row.get::<_, String>(0)?),
                        item_type: ItemType::from_str(&row.get::<_, String>(1)?)
                            .unwrap_or(ItemType::Note),
                        item_id: row.get(2)?,
                        event_types: parse_string_vec(row.get(3)?),
                        last_activity: parse_ts(&row.get::<_, String>(4)?)?,
                        teambook: row.get(5)?,
                    })
                })
                .map_err(sql_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql_err)?;
            Ok(rows)
        })
    }

    async fn watchers_for_item(
        &self,
        teambook: &str,
        item_type: ItemType,
        item_id: &str,
    ) -> StorageResult<Vec<Watch>> {
        self.with_conn(teambook, |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT ai_id, item_type, item_id, event_types, last_activity, teambook_name \
                     FROM watches WHERE item_type = ?1 AND item_id = ?2",
                )
                .map_err(sql_err)?;
            let rows = stmt
                .query_map(params![item_type.as_str(), item_id], |row| {
                    Ok(Watch {
                        ai_id: AiId::new(row.get::<_, String>(0)?),
                        item_type: ItemType::from_str(&row.get::<_, String>(1)?)
                            .unwrap_or(ItemType::Note),
                        item_id: row.get(2)?,
                        event_types: parse_string_vec(row.get(3)?),
                        last_activity: parse_ts(&row.get::<_, String>(4)?)?,
                        teambook: row.get(5)?,
                    })
                })
                .map_err(sql_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql_err)?;
            Ok(rows)
        })
    }

    async fn insert_event(&self, event: NewEvent, recipients: &[AiId]) -> StorageResult<EventId> {
        let teambook = event.teambook.clone();
        self.with_conn(&teambook, |conn| {
            let tx = conn.transaction().map_err(sql_err)?;
            tx.execute(
                "INSERT INTO events (item_type, item_id, event_type, actor, summary, created, \
                 expires_at, teambook_name, metadata) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    event.item_type.as_str(),
                    event.item_id,
                    event.event_type,
                    event.actor.as_str(),
                    event.summary,
                    fmt_ts(event.created),
                    fmt_ts(event.expires_at),
                    event.teambook,
                    event
                        .metadata
                        .as_ref()
                        .map(|m| serde_json::to_string(m))
                        .transpose()?,
                ],
            )
            .map_err(sql_err)?;
            let event_id = tx.last_insert_rowid();
            {
                let mut stmt = tx
                    .prepare(
                        "INSERT OR IGNORE INTO event_deliveries (event_id, ai_id, seen) \
                         VALUES (?1, ?2, 0)",
                    )
                    .map_err(sql_err)?;
                for ai in recipients {
                    stmt.execute(params![event_id, ai.as_str()]).map_err(sql_err)?;
                }
            }
            tx.commit().map_err(sql_err)?;
            Ok(EventId::new(event_id))
        })
    }

    async fn events_for(
        &self,
        teambook: &str,
        ai_id: &AiId,
        since: Timestamp,
        limit: usize,
        mark_seen: bool,
    ) -> StorageResult<Vec<WatchEvent>> {
        self.with_conn(teambook, |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT e.id, e.item_type, e.item_id, e.event_type, e.actor, e.summary, \
                     e.created, e.expires_at, e.teambook_name, e.metadata \
                     FROM events e JOIN event_deliveries d ON d.event_id = e.id \
                     WHERE d.ai_id = ?1 AND e.created > ?2 AND e.expires_at > ?3 \
                     ORDER BY e.created DESC LIMIT ?4",
                )
                .map_err(sql_err)?;
            let rows = stmt
                .query_map(
                    params![
                        ai_id.as_str(),
                        fmt_ts(since),
                        fmt_ts(Utc::now()),
                        limit as i64
                    ],
                    |row| {
                        Ok(WatchEvent {
                            id: EventId::new(row.get(0)?),
                            item_type: ItemType::from_str(&row.get::<_, String>(1)?)
                                .unwrap_or(ItemType::Note),
                            item_id: row.get(2)?,
                            event_type: row.get(3)?,
                            actor: AiId::new(row.get::<_, String>(4)?),
                            summary: row.get(5)?,
                            created: parse_ts(&row.get::<_, String>(6)?)?,
                            expires_at: parse_ts(&row.get::<_, String>(7)?)?,
                            teambook: row.get(8)?,
                            metadata: row.get::<_, Option<String>>(9)?.map(|s| parse_json(Some(s))),
                        })
                    },
                )
                .map_err(sql_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql_err)?;

            if mark_seen && !rows.is_empty() {
                let placeholders = vec!["?"; rows.len()].join(",");
                let sql = format!(
                    "UPDATE event_deliveries SET seen = 1 WHERE ai_id = ? AND event_id IN ({})",
                    placeholders
                );
                let mut args: Vec<Box<dyn rusqlite::ToSql>> =
                    vec![Box::new(ai_id.as_str().to_string())];
                for ev in &rows {
                    args.push(Box::new(ev.id.as_i64()));
                }
                conn.execute(&sql, params_from_iter(args.iter().map(|a| a.as_ref())))
                    .map_err(sql_err)?;
            }
            Ok(rows)
        })
    }

    async fn purge_expired_events(&self, teambook: &str) -> StorageResult<u64> {
        self.with_conn(teambook, |conn| {
            let affected = conn
                .execute(
                    "DELETE FROM events WHERE expires_at < ?1",
                    params![fmt_ts(Utc::now())],
                )
                .map_err(sql_err)?;
            conn.execute(
                "DELETE FROM event_deliveries WHERE event_id NOT IN (SELECT id FROM events)",
                [],
            )
            .map_err(sql_err)?;
            Ok(affected as u64)
        })
    }

    // ------------------------------------------------------------------
    // Presence
    // ------------------------------------------------------------------

    async fn upsert_presence(&self, presence: &Presence) -> StorageResult<()> {
        self.with_conn(&presence.teambook, |conn| {
            conn.execute(
                "INSERT INTO presence (ai_id, last_seen, last_operation, status_message, \
                 teambook_name) VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(ai_id) DO UPDATE SET \
                   last_seen = excluded.last_seen, last_operation = excluded.last_operation, \
                   status_message = COALESCE(excluded.status_message, presence.status_message)",
                params![
                    presence.ai_id.as_str(),
                    fmt_ts(presence.last_seen),
                    presence.last_operation,
                    presence.status_message,
                    presence.teambook,
                ],
            )
            .map_err(sql_err)?;
            Ok(())
        })
    }

    async fn active_presences(
        &self,
        teambook: &str,
        since: Timestamp,
    ) -> StorageResult<Vec<Presence>> {
        self.with_conn(teambook, |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT ai_id, last_seen, last_operation, status_message, teambook_name \
                     FROM presence WHERE last_seen > ?1 ORDER BY last_seen DESC",
                )
                .map_err(sql_err)?;
            let rows = stmt
                .query_map(params![fmt_ts(since)], |row| {
                    Ok(Presence {
                        ai_id: AiId::new(row.get::<_, String>(0)?),
                        last_seen: parse_ts(&row.get::<_, String>(1)?)?,
                        last_operation: row.get(2)?,
                        status_message: row.get(3)?,
                        teambook: row.get(4)?,
                    })
                })
                .map_err(sql_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql_err)?;
            Ok(rows)
        })
    }

    async fn prune_presence(&self, teambook: &str, before: Timestamp) -> StorageResult<u64> {
        self.with_conn(teambook, |conn| {
            let affected = conn
                .execute(
                    "DELETE FROM presence WHERE last_seen < ?1",
                    params![fmt_ts(before)],
                )
                .map_err(sql_err)?;
            Ok(affected as u64)
        })
    }

    // ------------------------------------------------------------------
    // Vault
    // ------------------------------------------------------------------

    async fn vault_set(&self, teambook: &str, item: &VaultItem) -> StorageResult<()> {
        self.with_conn(teambook, |conn| {
            conn.execute(
                "INSERT INTO vault (key, encrypted_value, created, updated, author) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(key) DO UPDATE SET \
                   encrypted_value = excluded.encrypted_value, updated = excluded.updated, \
                   author = excluded.author",
                params![
                    item.key,
                    item.encrypted_value,
                    fmt_ts(item.created),
                    fmt_ts(item.updated),
                    item.author.as_str(),
                ],
            )
            .map_err(sql_err)?;
            Ok(())
        })
    }

    async fn vault_get(&self, teambook: &str, key: &str) -> StorageResult<Option<VaultItem>> {
        self.with_conn(teambook, |conn| {
            conn.query_row(
                "SELECT key, encrypted_value, created, updated, author FROM vault WHERE key = ?1",
                params![key],
                |row| {
                    Ok(VaultItem {
                        key: row.get(0)?,
                        encrypted_value: row.get(1)?,
                        created: parse_ts(&row.get::<_, String>(2)?)?,
                        updated: parse_ts(&row.get::<_, String>(3)?)?,
                        author: AiId::new(row.get::<_, String>(4)?),
                    })
                },
            )
            .optional()
            .map_err(sql_err)
        })
    }

    async fn vault_delete(&self, teambook: &str, key: &str) -> StorageResult<bool> {
        self.with_conn(teambook, |conn| {
            let affected = conn
                .execute("DELETE FROM vault WHERE key = ?1", params![key])
                .map_err(sql_err)?;
            Ok(affected > 0)
        })
    }

    async fn vault_list(&self, teambook: &str) -> StorageResult<Vec<VaultEntryInfo>> {
        self.with_conn(teambook, |conn| {
            let mut stmt = conn
                .prepare("SELECT key, updated, author FROM vault ORDER BY key")
                .map_err(sql_err)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(VaultEntryInfo {
                        key: row.get(0)?,
                        updated: parse_ts(&row.get::<_, String>(1)?)?,
                        author: AiId::new(row.get::<_, String>(2)?),
                    })
                })
                .map_err(sql_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql_err)?;
            Ok(rows)
        })
    }

    // ------------------------------------------------------------------
    // Evolution
    // ------------------------------------------------------------------

    async fn insert_contribution(
        &self,
        teambook: &str,
        contribution: NewContribution,
    ) -> StorageResult<ContributionId> {
        self.with_conn(teambook, |conn| {
            conn.execute(
                "INSERT INTO contributions (evolution_id, author, content, approach, created) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    contribution.evolution_id.as_i64(),
                    contribution.author.as_str(),
                    contribution.content,
                    contribution.approach,
                    fmt_ts(contribution.created),
                ],
            )
            .map_err(sql_err)?;
            Ok(ContributionId::new(conn.last_insert_rowid()))
        })
    }

    async fn contributions_for(
        &self,
        teambook: &str,
        evolution_id: NoteId,
    ) -> StorageResult<Vec<Contribution>> {
        self.with_conn(teambook, |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, evolution_id, author, content, approach, created, avg_score, \
                     rank_count FROM contributions WHERE evolution_id = ?1 \
                     ORDER BY avg_score DESC, created ASC",
                )
                .map_err(sql_err)?;
            let rows = stmt
                .query_map(params![evolution_id.as_i64()], contribution_from_row)
                .map_err(sql_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql_err)?;
            Ok(rows)
        })
    }

    async fn get_contribution(
        &self,
        teambook: &str,
        id: ContributionId,
    ) -> StorageResult<Option<Contribution>> {
        self.with_conn(teambook, |conn| {
            conn.query_row(
                "SELECT id, evolution_id, author, content, approach, created, avg_score, \
                 rank_count FROM contributions WHERE id = ?1",
                params![id.as_i64()],
                contribution_from_row,
            )
            .optional()
            .map_err(sql_err)
        })
    }

    async fn count_contributions_by(
        &self,
        teambook: &str,
        evolution_id: NoteId,
        author: &AiId,
    ) -> StorageResult<u64> {
        self.with_conn(teambook, |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM contributions WHERE evolution_id = ?1 AND author = ?2",
                params![evolution_id.as_i64(), author.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as u64)
            .map_err(sql_err)
        })
    }

    async fn upsert_ranking(
        &self,
        teambook: &str,
        ranking: &Ranking,
    ) -> StorageResult<(f64, i64)> {
        self.with_conn(teambook, |conn| {
            let tx = conn.transaction().map_err(sql_err)?;
            tx.execute(
                "INSERT INTO rankings (contribution_id, ranked_by, score, reason, created) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(contribution_id, ranked_by) DO UPDATE SET \
                   score = excluded.score, reason = excluded.reason, created = excluded.created",
                params![
                    ranking.contribution_id.as_i64(),
                    ranking.ranked_by.as_str(),
                    ranking.score,
                    ranking.reason,
                    fmt_ts(ranking.created),
                ],
            )
            .map_err(sql_err)?;

            let (avg, count): (f64, i64) = tx
                .query_row(
                    "SELECT COALESCE(AVG(score), 0.0), COUNT(*) FROM rankings \
                     WHERE contribution_id = ?1",
                    params![ranking.contribution_id.as_i64()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map_err(sql_err)?;
            tx.execute(
                "UPDATE contributions SET avg_score = ?1, rank_count = ?2 WHERE id = ?3",
                params![avg, count, ranking.contribution_id.as_i64()],
            )
            .map_err(sql_err)?;
            tx.commit().map_err(sql_err)?;
            Ok((avg, count))
        })
    }

    async fn get_vote(
        &self,
        teambook: &str,
        evolution_id: NoteId,
        voter: &AiId,
    ) -> StorageResult<Option<Vote>> {
        self.with_conn(teambook, |conn| {
            conn.query_row(
                "SELECT evolution_id, voter, preferred, change_count, updated FROM votes \
                 WHERE evolution_id = ?1 AND voter = ?2",
                params![evolution_id.as_i64(), voter.as_str()],
                |row| {
                    Ok(Vote {
                        evolution_id: NoteId::new(row.get(0)?),
                        voter: AiId::new(row.get::<_, String>(1)?),
                        preferred: serde_json::from_str::<Vec<i64>>(&row.get::<_, String>(2)?)
                            .unwrap_or_default()
                            .into_iter()
                            .map(ContributionId::new)
                            .collect(),
                        change_count: row.get(3)?,
                        updated: parse_ts(&row.get::<_, String>(4)?)?,
                    })
                },
            )
            .optional()
            .map_err(sql_err)
        })
    }

    async fn upsert_vote(&self, teambook: &str, vote: &Vote) -> StorageResult<()> {
        self.with_conn(teambook, |conn| {
            let preferred: Vec<i64> = vote.preferred.iter().map(|c| c.as_i64()).collect();
            conn.execute(
                "INSERT INTO votes (evolution_id, voter, preferred, change_count, updated) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(evolution_id, voter) DO UPDATE SET \
                   preferred = excluded.preferred, change_count = excluded.change_count, \
                   updated = excluded.updated",
                params![
                    vote.evolution_id.as_i64(),
                    vote.voter.as_str(),
                    serde_json::to_string(&preferred)?,
                    vote.change_count,
                    fmt_ts(vote.updated),
                ],
            )
            .map_err(sql_err)?;
            Ok(())
        })
    }

    async fn insert_synthesis(&self, record: NewSynthesis) -> StorageResult<i64> {
        let teambook = record.teambook.clone();
        self.with_conn(&teambook, |conn| {
            conn.execute(
                "INSERT INTO synthesis_history (evolution_id, strategy, output_path, \
                 contribution_count, author, created, teambook_name) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.evolution_id.as_i64(),
                    record.strategy.as_str(),
                    record.output_path,
                    record.contribution_count,
                    record.author.as_str(),
                    fmt_ts(record.created),
                    record.teambook,
                ],
            )
            .map_err(sql_err)?;
            Ok(conn.last_insert_rowid())
        })
    }

    async fn synthesis_count_since(
        &self,
        teambook: &str,
        since: Timestamp,
    ) -> StorageResult<u64> {
        self.with_conn(teambook, |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM synthesis_history WHERE created > ?1",
                params![fmt_ts(since)],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as u64)
            .map_err(sql_err)
        })
    }

    async fn insert_conflicts(
        &self,
        teambook: &str,
        conflicts: &[ContributionConflict],
    ) -> StorageResult<()> {
        self.with_conn(teambook, |conn| {
            let tx = conn.transaction().map_err(sql_err)?;
            {
                let mut stmt = tx
                    .prepare(
                        "INSERT OR IGNORE INTO contribution_conflicts \
                         (evolution_id, contribution_a, contribution_b, topic, detected) \
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                    )
                    .map_err(sql_err)?;
                for conflict in conflicts {
                    stmt.execute(params![
                        conflict.evolution_id.as_i64(),
                        conflict.contribution_a.as_i64(),
                        conflict.contribution_b.as_i64(),
                        conflict.topic,
                        fmt_ts(conflict.detected),
                    ])
                    .map_err(sql_err)?;
                }
            }
            tx.commit().map_err(sql_err)
        })
    }

    // ------------------------------------------------------------------
    // Coordination events and registry
    // ------------------------------------------------------------------

    async fn insert_coordination_event(&self, event: NewCoordinationEvent) -> StorageResult<i64> {
        let teambook = event.teambook.clone();
        self.with_conn(&teambook, |conn| {
            conn.execute(
                "INSERT INTO coordination_events (event_type, ai_id, task_id, summary, created, \
                 metadata, teambook_name) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    event.event_type,
                    event.ai_id.as_str(),
                    event.task_id.map(|t| t.as_i64()),
                    event.summary,
                    fmt_ts(event.created),
                    event
                        .metadata
                        .as_ref()
                        .map(|m| serde_json::to_string(m))
                        .transpose()?,
                    event.teambook,
                ],
            )
            .map_err(sql_err)?;
            Ok(conn.last_insert_rowid())
        })
    }

    async fn coordination_events(
        &self,
        teambook: &str,
        since: Timestamp,
        limit: usize,
    ) -> StorageResult<Vec<CoordinationEvent>> {
        self.with_conn(teambook, |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, event_type, ai_id, task_id, summary, created, metadata, \
                     teambook_name FROM coordination_events WHERE created > ?1 \
                     ORDER BY created DESC LIMIT ?2",
                )
                .map_err(sql_err)?;
            let rows = stmt
                .query_map(params![fmt_ts(since), limit as i64], |row| {
                    Ok(CoordinationEvent {
                        id: row.get(0)?,
                        event_type: row.get(1)?,
                        ai_id: AiId::new(row.get::<_, String>(2)?),
                        task_id: row.get::<_, Option<i64>>(3)?.map(TaskId::new),
                        summary: row.get(4)?,
                        created: parse_ts(&row.get::<_, String>(5)?)?,
                        metadata: row.get::<_, Option<String>>(6)?.map(|s| parse_json(Some(s))),
                        teambook: row.get(7)?,
                    })
                })
                .map_err(sql_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql_err)?;
            Ok(rows)
        })
    }

    async fn touch_teambook(&self, name: &str, creator: &AiId) -> StorageResult<()> {
        self.with_conn(name, |conn| {
            conn.execute(
                "INSERT INTO teambooks (name, created, created_by, last_active) \
                 VALUES (?1, ?2, ?3, ?2) \
                 ON CONFLICT(name) DO UPDATE SET last_active = excluded.last_active",
                params![name, fmt_ts(Utc::now()), creator.as_str()],
            )
            .map_err(sql_err)?;
            Ok(())
        })
    }

    async fn list_teambooks(&self) -> StorageResult<Vec<(String, Timestamp, Option<Timestamp>)>> {
        // Each teambook database carries its own registry row; enumerate
        // the root directory tree.
        let mut books = Vec::new();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(_) => return Ok(books),
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !entry.path().join("teambook.sqlite3").exists() {
                continue;
            }
            let row = self.with_conn(&name, |conn| {
                conn.query_row(
                    "SELECT name, created, last_active FROM teambooks WHERE name = ?1",
                    params![name],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            parse_ts(&row.get::<_, String>(1)?)?,
                            row.get::<_, Option<String>>(2)?
                                .map(|s| parse_ts(&s))
                                .transpose()?,
                        ))
                    },
                )
                .optional()
                .map_err(sql_err)
            })?;
            if let Some(book) = row {
                books.push(book);
            }
        }
        books.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(books)
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
        self.with_conn(teambook, |conn| {
            conn.execute(
                "INSERT INTO stats (operation, ts, dur_ms, author) VALUES (?1, ?2, ?3, ?4)",
                params![operation, fmt_ts(Utc::now()), dur_ms, author.as_str()],
            )
            .map_err(sql_err)?;
            Ok(())
        })
    }

    async fn get_stats(&self, teambook: &str) -> StorageResult<StorageStats> {
        self.with_conn(teambook, |conn| {
            let count = |table: &str| -> StorageResult<u64> {
                conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                    row.get::<_, i64>(0)
                })
                .map(|n| n as u64)
                .map_err(sql_err)
            };
            Ok(StorageStats {
                notes: count("notes")?,
                edges: count("edges")?,
                entities: count("entities")?,
                sessions: count("sessions")?,
                messages: count("messages")?,
                tasks: count("tasks")?,
                operations: count("stats")?,
            })
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

fn fact_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntityFact> {
    Ok(EntityFact {
        id: FactId::new(row.get(0)?),
        entity_id: EntityId::new(row.get(1)?),
        relation: row.get(2)?,
        value: row.get(3)?,
        target_entity_id: row.get::<_, Option<i64>>(4)?.map(EntityId::new),
        valid_from: parse_ts(&row.get::<_, String>(5)?)?,
        valid_to: row
            .get::<_, Option<String>>(6)?
            .map(|s| parse_ts(&s))
            .transpose()?,
        source_note_id: NoteId::new(row.get(7)?),
        confidence: row.get(8)?,
        metadata: row.get::<_, Option<String>>(9)?.map(|s| parse_json(Some(s))),
    })
}

fn contribution_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Contribution> {
    Ok(Contribution {
        id: ContributionId::new(row.get(0)?),
        evolution_id: NoteId::new(row.get(1)?),
        author: AiId::new(row.get::<_, String>(2)?),
        content: row.get(3)?,
        approach: row.get(4)?,
        created: parse_ts(&row.get::<_, String>(5)?)?,
        avg_score: row.get(6)?,
        rank_count: row.get(7)?,
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn backend() -> (tempfile::TempDir, SqliteBackend) {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = SqliteBackend::new(dir.path());
        (dir, backend)
    }

    fn new_note(teambook: &str, content: &str) -> NewNote {
        NewNote {
            content: content.to_string(),
            summary: None,
            tags: vec![],
            pinned: false,
            author: AiId::from("alpha-001"),
            owner: None,
            note_type: "general".to_string(),
            parent_id: None,
            teambook: teambook.to_string(),
            created: Utc::now(),
            session_id: None,
            linked_items: vec![],
            representation_policy: RepresentationPolicy::Default,
            metadata: json!({}),
            tamper_hash: "h".to_string(),
            has_vector: false,
        }
    }

    #[tokio::test]
    async fn test_note_roundtrip() {
        let (_dir, backend) = backend();
        let id = backend.insert_note(new_note("demo", "hello")).await.unwrap();
        let note = backend.get_note("demo", id).await.unwrap().unwrap();
        assert_eq!(note.content, "hello");
        assert_eq!(note.author.as_str(), "alpha-001");
        assert!(!note.pinned);
    }

    #[tokio::test]
    async fn test_note_ids_monotonic() {
        let (_dir, backend) = backend();
        let a = backend.insert_note(new_note("demo", "a")).await.unwrap();
        let b = backend.insert_note(new_note("demo", "b")).await.unwrap();
        assert!(b.as_i64() > a.as_i64());
    }

    #[tokio::test]
    async fn test_update_note_recomputes_hash() {
        let (_dir, backend) = backend();
        let id = backend.insert_note(new_note("demo", "before")).await.unwrap();
        let patch = NotePatch {
            content: Some("after".to_string()),
            ..Default::default()
        };
        let updated = backend
            .update_note("demo", id, patch)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.content, "after");
        assert_eq!(updated.tamper_hash, updated.compute_tamper_hash());
    }

    #[tokio::test]
    async fn test_lock_acquire_conflict_and_expiry() {
        let (_dir, backend) = backend();
        let alpha = AiId::from("alpha-001");
        let beta = AiId::from("beta-002");

        let first = backend
            .try_acquire_lock("demo", "auth.rs", &alpha, 30)
            .await
            .unwrap();
        assert!(matches!(first, LockAttempt::Acquired(_)));

        let second = backend
            .try_acquire_lock("demo", "auth.rs", &beta, 30)
            .await
            .unwrap();
        match second {
            LockAttempt::Held { held_by, .. } => assert_eq!(held_by, alpha),
            other => panic!("expected Held, got {:?}", other),
        }

        // An expired row is treated as absent.
        let expired = backend
            .try_acquire_lock("demo", "stale.rs", &alpha, -1)
            .await
            .unwrap();
        assert!(matches!(expired, LockAttempt::Acquired(_)));
        let retaken = backend
            .try_acquire_lock("demo", "stale.rs", &beta, 30)
            .await
            .unwrap();
        assert!(matches!(retaken, LockAttempt::Acquired(_)));
    }

    #[tokio::test]
    async fn test_release_lock_holder_check() {
        let (_dir, backend) = backend();
        let alpha = AiId::from("alpha-001");
        let beta = AiId::from("beta-002");
        backend
            .try_acquire_lock("demo", "r", &alpha, 30)
            .await
            .unwrap();

        let wrong = backend.release_lock("demo", "r", &beta).await.unwrap();
        assert!(matches!(wrong, ReleaseOutcome::NotHolder { .. }));
        let right = backend.release_lock("demo", "r", &alpha).await.unwrap();
        assert_eq!(right, ReleaseOutcome::Released);
        let again = backend.release_lock("demo", "r", &alpha).await.unwrap();
        assert_eq!(again, ReleaseOutcome::NotLocked);
    }

    #[tokio::test]
    async fn test_task_claim_exactly_once() {
        let (_dir, backend) = backend();
        let alpha = AiId::from("alpha-001");
        let beta = AiId::from("beta-002");
        backend
            .insert_task(NewTask {
                task: "ship docs".to_string(),
                priority: 7,
                author: alpha.clone(),
                created: Utc::now(),
                teambook: "demo".to_string(),
                metadata: json!({}),
                tamper_hash: "h".to_string(),
            })
            .await
            .unwrap();

        let first = backend
            .claim_next_task("demo", &alpha, true, Utc::now())
            .await
            .unwrap();
        assert!(first.is_some());
        let second = backend
            .claim_next_task("demo", &beta, true, Utc::now())
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_complete_task_requires_claimer() {
        let (_dir, backend) = backend();
        let alpha = AiId::from("alpha-001");
        let beta = AiId::from("beta-002");
        let id = backend
            .insert_task(NewTask {
                task: "t".to_string(),
                priority: 5,
                author: alpha.clone(),
                created: Utc::now(),
                teambook: "demo".to_string(),
                metadata: json!({}),
                tamper_hash: "h".to_string(),
            })
            .await
            .unwrap();
        backend
            .claim_next_task("demo", &alpha, true, Utc::now())
            .await
            .unwrap();

        let denied = backend
            .complete_task("demo", id, &beta, None, Utc::now())
            .await
            .unwrap();
        assert_eq!(denied, CompleteOutcome::NotClaimer);

        let done = backend
            .complete_task("demo", id, &alpha, Some("done".to_string()), Utc::now())
            .await
            .unwrap();
        assert!(matches!(done, CompleteOutcome::Completed(_)));

        let repeat = backend
            .complete_task("demo", id, &alpha, None, Utc::now())
            .await
            .unwrap();
        assert_eq!(repeat, CompleteOutcome::AlreadyCompleted);
    }

    #[tokio::test]
    async fn test_watch_idempotent_and_delivery() {
        let (_dir, backend) = backend();
        let alpha = AiId::from("alpha-001");
        let watch = Watch {
            ai_id: alpha.clone(),
            item_type: ItemType::Note,
            item_id: "42".to_string(),
            event_types: vec!["edited".to_string()],
            last_activity: Utc::now(),
            teambook: "demo".to_string(),
        };
        assert!(backend.upsert_watch(&watch).await.unwrap());
        assert!(!backend.upsert_watch(&watch).await.unwrap());
        assert_eq!(backend.count_watches("demo", &alpha).await.unwrap(), 1);

        let event_id = backend
            .insert_event(
                NewEvent {
                    item_type: ItemType::Note,
                    item_id: "42".to_string(),
                    event_type: "edited".to_string(),
                    actor: AiId::from("beta-002"),
                    summary: Some("new".to_string()),
                    created: Utc::now(),
                    expires_at: Utc::now() + chrono::Duration::days(7),
                    teambook: "demo".to_string(),
                    metadata: None,
                },
                &[alpha.clone()],
            )
            .await
            .unwrap();

        let events = backend
            .events_for(
                "demo",
                &alpha,
                Utc::now() - chrono::Duration::hours(1),
                20,
                true,
            )
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, event_id);
        assert_eq!(events[0].event_type, "edited");
    }

    #[tokio::test]
    async fn test_message_expiry_filtering() {
        let (_dir, backend) = backend();
        let now = Utc::now();
        backend
            .insert_message(NewMessage {
                channel: "general".to_string(),
                from_ai: AiId::from("alpha-001"),
                to_ai: None,
                content: "old".to_string(),
                summary: None,
                reply_to: None,
                created: now - chrono::Duration::hours(2),
                expires_at: now - chrono::Duration::hours(1),
                teambook: "demo".to_string(),
                envelope: None,
            })
            .await
            .unwrap();
        backend
            .insert_message(NewMessage {
                channel: "general".to_string(),
                from_ai: AiId::from("alpha-001"),
                to_ai: None,
                content: "fresh".to_string(),
                summary: None,
                reply_to: None,
                created: now,
                expires_at: now + chrono::Duration::hours(1),
                teambook: "demo".to_string(),
                envelope: None,
            })
            .await
            .unwrap();

        let msgs = backend
            .read_messages(&MessageFilter {
                teambook: "demo".to_string(),
                channel: Some("general".to_string()),
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].content, "fresh");
    }

    #[tokio::test]
    async fn test_ranking_recomputes_average() {
        let (_dir, backend) = backend();
        let contrib = backend
            .insert_contribution(
                "demo",
                NewContribution {
                    evolution_id: NoteId::new(10),
                    author: AiId::from("alpha-001"),
                    content: "use JWT".to_string(),
                    approach: None,
                    created: Utc::now(),
                },
            )
            .await
            .unwrap();

        let (avg, count) = backend
            .upsert_ranking(
                "demo",
                &Ranking {
                    contribution_id: contrib,
                    ranked_by: AiId::from("beta-002"),
                    score: 8.0,
                    reason: None,
                    created: Utc::now(),
                },
            )
            .await
            .unwrap();
        assert_eq!((avg, count), (8.0, 1));

        let (avg, count) = backend
            .upsert_ranking(
                "demo",
                &Ranking {
                    contribution_id: contrib,
                    ranked_by: AiId::from("gamma-003"),
                    score: 6.0,
                    reason: None,
                    created: Utc::now(),
                },
            )
            .await
            .unwrap();
        assert_eq!((avg, count), (7.0, 2));
    }

    #[tokio::test]
    async fn test_read_notes_important_ordering() {
        let (_dir, backend) = backend();
        let a = backend.insert_note(new_note("demo", "plain")).await.unwrap();
        let mut pinned = new_note("demo", "pinned");
        pinned.pinned = true;
        let b = backend.insert_note(pinned).await.unwrap();
        backend
            .store_pagerank("demo", &[(a, 0.9), (b, 0.1)])
            .await
            .unwrap();

        let notes = backend
            .read_notes(&NoteFilter {
                teambook: "demo".to_string(),
                mode: ReadMode::Important,
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        // Pinned wins over pagerank.
        assert_eq!(notes[0].id, b);
        assert_eq!(notes[1].id, a);
    }
}
