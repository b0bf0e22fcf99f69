//! Teambook Kernel - The Collaboration Engine
//!
//! One `Kernel` per process owns the storage backend, the event bus, the
//! signing identity, rate-limit windows, and every verb the hosts call.
//! Module-level mutable state of the original design (encoder handles,
//! entity caches, rate maps) lives here as explicit fields; there are no
//! ambient globals.

mod api;
mod cache;
mod codec;
mod coordination;
mod embed;
mod evolution;
mod identity;
mod messaging;
mod notes;
mod presence;
mod ratelimit;
mod response;
mod validate;
mod vault;
mod watch;

pub use api::{KernelVerb, KERNEL_VERBS};
pub use cache::{CachedNote, WriteCache};
pub use codec::ContentCodec;
pub use embed::{Embedder, HashEmbedder, VectorIndex};
pub use identity::SigningIdentity;
pub use messaging::SendMessageArgs;
pub use notes::WriteNoteArgs;
pub use ratelimit::RateLimiter;
pub use response::KernelResponse;
pub use validate::{clamp_text, clean_text, normalize_int, normalize_opt_str, parse_id_ref, parse_since, simple_summary, IdRef};
pub use vault::VaultCrypto;

use chrono::Utc;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use teambook_core::*;
use teambook_events::{channel_for, DomainEvent, EventBus, EventBusHandle};
use teambook_storage::{select_backend, StorageBackend};
use tracing::{debug, info, warn};

struct PagerankState {
    dirty: bool,
    computed_at: Option<Instant>,
}

/// The collaboration kernel.
pub struct Kernel {
    config: TeambookConfig,
    pub(crate) store: Arc<dyn StorageBackend>,
    pub(crate) bus: EventBusHandle,
    identity: SigningIdentity,
    pub(crate) limiter: RateLimiter,
    pub(crate) codec: ContentCodec,
    current_teambook: RwLock<String>,
    vaults: Mutex<HashMap<String, Arc<VaultCrypto>>>,
    pagerank: Mutex<PagerankState>,
    pub(crate) known_entities: RwLock<HashSet<String>>,
    last_write: Mutex<Option<NoteId>>,
    pub(crate) write_cache: WriteCache,
    embedder: Option<Box<dyn Embedder>>,
    vectors: Mutex<Option<VectorIndex>>,
}

impl Kernel {
    /// Assemble a kernel over an already-selected backend.
    pub fn new(config: TeambookConfig, store: Arc<dyn StorageBackend>, bus: EventBusHandle) -> Self {
        let identity = SigningIdentity::load_or_create(&config);
        let current = read_current_teambook(&config);
        let write_cache = WriteCache::open(&config.root);
        let embedder: Option<Box<dyn Embedder>> = if config.semantic {
            Some(Box::new(HashEmbedder))
        } else {
            None
        };
        info!(ai_id = %identity.ai_id(), teambook = %current, backend = ?store.kind(), "kernel ready");
        Self {
            config,
            store,
            bus,
            identity,
            limiter: RateLimiter::new(),
            codec: ContentCodec,
            current_teambook: RwLock::new(current),
            vaults: Mutex::new(HashMap::new()),
            pagerank: Mutex::new(PagerankState {
                dirty: false,
                computed_at: None,
            }),
            known_entities: RwLock::new(HashSet::new()),
            last_write: Mutex::new(None),
            write_cache,
            embedder,
            vectors: Mutex::new(None),
        }
    }

    /// Full bootstrap: probe backends, spin up the bus, bridge remote
    /// pub/sub into it, and build the kernel.
    pub async fn bootstrap(config: TeambookConfig) -> Arc<Self> {
        let store = select_backend(&config).await;
        let bus = EventBus::new(1024);

        let kernel = Arc::new(Self::new(config, store.clone(), bus.clone()));
        kernel.spawn_remote_bridge().await;
        kernel
    }

    /// Bridge the backend's remote pub/sub channel (if it has one) into the
    /// in-process bus so cross-process mutations reach local handlers.
    async fn spawn_remote_bridge(self: &Arc<Self>) {
        let teambook = self.current_teambook();
        let channel = channel_for(&teambook);
        match self.store.subscribe(&channel).await {
            Ok(Some(mut stream)) => {
                let bus = self.bus.clone();
                tokio::spawn(async move {
                    while let Some(payload) = stream.recv().await {
                        match serde_json::from_str(&payload) {
                            Ok(wire) => bus.inject_remote(wire),
                            Err(err) => debug!(error = %err, "dropping malformed remote event"),
                        }
                    }
                });
                info!(channel, "remote event bridge running");
            }
            Ok(None) => {}
            Err(err) => warn!(error = %err, "remote pub/sub unavailable"),
        }
    }

    // ------------------------------------------------------------------
    // Identity and context accessors
    // ------------------------------------------------------------------

    pub fn ai_id(&self) -> &AiId {
        self.identity.ai_id()
    }

    pub fn identity(&self) -> &SigningIdentity {
        &self.identity
    }

    pub fn config(&self) -> &TeambookConfig {
        &self.config
    }

    pub fn event_bus(&self) -> EventBusHandle {
        self.bus.clone()
    }

    /// The selected storage backend, for hosts that need read access
    /// beyond the verb surface (watch sync, health probes).
    pub fn storage(&self) -> Arc<dyn StorageBackend> {
        self.store.clone()
    }

    pub fn current_teambook(&self) -> String {
        self.current_teambook
            .read()
            .expect("teambook context poisoned")
            .clone()
    }

    /// Switch the active teambook, persisting the choice to the context
    /// file and touching the registry.
    pub async fn use_teambook(&self, name: &str) -> TeambookResult<KernelResponse> {
        if !is_valid_teambook_name(name) {
            return Err(TeambookError::new(
                ErrorCode::InvalidItem,
                "teambook names are alphanumeric plus dash/underscore",
            ));
        }
        self.store.touch_teambook(name, self.ai_id()).await?;
        *self
            .current_teambook
            .write()
            .expect("teambook context poisoned") = name.to_string();
        if let Err(err) = std::fs::write(self.config.current_teambook_file(), name) {
            debug!(error = %err, "could not persist teambook context");
        }
        // Pagerank cache and entity cache belong to the previous scope.
        self.mark_pagerank_dirty();
        self.known_entities
            .write()
            .expect("entity cache poisoned")
            .clear();
        Ok(KernelResponse::ok(
            format!("using {}", name),
            json!({"teambook": name}),
        ))
    }

    pub async fn list_teambooks(&self) -> TeambookResult<KernelResponse> {
        let books = self.store.list_teambooks().await?;
        let listing: Vec<_> = books
            .iter()
            .map(|(name, created, last_active)| {
                json!({
                    "name": name,
                    "created": created.to_rfc3339(),
                    "last_active": last_active.map(|t| t.to_rfc3339()),
                })
            })
            .collect();
        Ok(KernelResponse::ok(
            format!("{} teambooks", listing.len()),
            json!({"teambooks": listing}),
        ))
    }

    // ------------------------------------------------------------------
    // Cross-cutting plumbing
    // ------------------------------------------------------------------

    pub(crate) fn vault_for(&self, teambook: &str) -> TeambookResult<Arc<VaultCrypto>> {
        let mut vaults = self.vaults.lock().expect("vault map poisoned");
        if let Some(crypto) = vaults.get(teambook) {
            return Ok(crypto.clone());
        }
        let crypto = Arc::new(VaultCrypto::open(&self.config.vault_key_file(teambook))?);
        vaults.insert(teambook.to_string(), crypto.clone());
        Ok(crypto)
    }

    pub(crate) fn resolve_note_ref(&self, raw: &str) -> TeambookResult<NoteId> {
        match parse_id_ref(raw)? {
            IdRef::Last => self
                .last_write
                .lock()
                .expect("last write poisoned")
                .or_else(|| self.write_cache.last_note_id())
                .ok_or_else(|| {
                    TeambookError::new(ErrorCode::InvalidItem, "no write recorded yet for 'last'")
                }),
            IdRef::Note(id) | IdRef::Evolution(id) => Ok(id),
            IdRef::Raw(raw) => Ok(NoteId::new(raw)),
        }
    }

    pub(crate) fn note_written(&self, id: NoteId) {
        *self.last_write.lock().expect("last write poisoned") = Some(id);
    }

    pub(crate) fn mark_pagerank_dirty(&self) {
        self.pagerank.lock().expect("pagerank state poisoned").dirty = true;
    }

    /// Whether a recompute is due: dirty flag or TTL expiry. Resets the
    /// state when it answers yes.
    pub(crate) fn take_pagerank_due(&self) -> bool {
        let mut state = self.pagerank.lock().expect("pagerank state poisoned");
        let stale = match state.computed_at {
            Some(at) => at.elapsed().as_secs() > PAGERANK_CACHE_SECONDS,
            None => true,
        };
        if state.dirty || stale {
            state.dirty = false;
            state.computed_at = Some(Instant::now());
            true
        } else {
            false
        }
    }

    pub(crate) fn with_vectors<T>(
        &self,
        teambook: &str,
        f: impl FnOnce(&mut VectorIndex) -> T,
    ) -> Option<T> {
        self.embedder.as_ref()?;
        let mut guard = self.vectors.lock().expect("vector index poisoned");
        if guard.is_none() {
            match VectorIndex::open(&self.config.vectors_dir(teambook)) {
                Ok(index) => *guard = Some(index),
                Err(err) => {
                    debug!(error = %err, "vector index unavailable");
                    return None;
                }
            }
        }
        guard.as_mut().map(f)
    }

    pub(crate) fn embed(&self, text: &str) -> Option<Vec<f32>> {
        self.embedder.as_ref().map(|embedder| embedder.embed(text))
    }

    /// Record presence passively. Non-critical: failures are swallowed.
    pub(crate) async fn touch_presence(&self, operation: &str) {
        let presence = Presence {
            ai_id: self.ai_id().clone(),
            last_seen: Utc::now(),
            last_operation: operation.to_string(),
            status_message: None,
            teambook: self.current_teambook(),
        };
        if let Err(err) = self.store.upsert_presence(&presence).await {
            debug!(error = %err, "presence update failed");
        }
    }

    /// Record an operation stat row, best effort.
    pub(crate) async fn record_op(&self, operation: &str, started: Instant) {
        let dur_ms = started.elapsed().as_millis() as i64;
        let teambook = self.current_teambook();
        if let Err(err) = self
            .store
            .record_operation(&teambook, operation, Some(dur_ms), self.ai_id())
            .await
        {
            debug!(error = %err, "operation stat failed");
        }
    }

    /// Publish a domain event after a committed write. Errors must not
    /// fail the write, so they are logged and dropped.
    pub(crate) async fn publish_event(&self, event: DomainEvent) {
        let teambook = self.current_teambook();
        self.bus.publish(&teambook, event.clone());
        let wire = teambook_events::WireEvent::new(teambook.clone(), event);
        if let Ok(payload) = serde_json::to_string(&wire) {
            if let Err(err) = self.store.publish(&channel_for(&teambook), &payload).await {
                debug!(error = %err, "remote publish failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Status and maintenance
    // ------------------------------------------------------------------

    pub async fn get_status(&self) -> TeambookResult<KernelResponse> {
        let teambook = self.current_teambook();
        let stats = self.store.get_stats(&teambook).await?;
        let recent_events = self
            .store
            .coordination_events(&teambook, Utc::now() - chrono::Duration::hours(24), 10)
            .await
            .unwrap_or_default();
        let cached: Vec<_> = self
            .write_cache
            .recent()
            .into_iter()
            .map(|entry| {
                json!({
                    "note_id": entry.note_id,
                    "summary": entry.summary,
                    "teambook": entry.teambook,
                })
            })
            .collect();
        Ok(KernelResponse::ok(
            "status",
            json!({
                "ai_id": self.ai_id(),
                "teambook": teambook,
                "backend": self.store.kind().as_str(),
                "notes": stats.notes,
                "edges": stats.edges,
                "entities": stats.entities,
                "sessions": stats.sessions,
                "messages": stats.messages,
                "tasks": stats.tasks,
                "operations": stats.operations,
                "vectors": self.with_vectors(&teambook, |index| index.len()).unwrap_or(0),
                "recent_coordination": recent_events.len(),
                "recent_writes": cached,
            }),
        ))
    }

    /// Housekeeping pass: purge expired messages/events, sweep locks,
    /// prune stale presence.
    pub async fn maintenance(&self) -> TeambookResult<KernelResponse> {
        let teambook = self.current_teambook();
        let messages = self.store.purge_expired_messages(&teambook).await?;
        let events = self.store.purge_expired_events(&teambook).await?;
        let locks = self.store.sweep_expired_locks(&teambook).await?;
        let presence = self
            .store
            .prune_presence(
                &teambook,
                Utc::now() - chrono::Duration::days(PRESENCE_RETENTION_DAYS),
            )
            .await?;
        Ok(KernelResponse::ok(
            "maintenance complete",
            json!({
                "expired_messages": messages,
                "expired_events": events,
                "expired_locks": locks,
                "pruned_presence": presence,
            }),
        ))
    }
}

fn read_current_teambook(config: &TeambookConfig) -> String {
    std::fs::read_to_string(config.current_teambook_file())
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|name| is_valid_teambook_name(name))
        .unwrap_or_else(|| config.teambook.clone())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use teambook_storage::SqliteBackend;

    /// Kernel over a throwaway sqlite root; returns the tempdir guard too.
    pub async fn test_kernel() -> (tempfile::TempDir, Arc<Kernel>) {
        test_kernel_named("demo").await
    }

    pub async fn test_kernel_named(teambook: &str) -> (tempfile::TempDir, Arc<Kernel>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = TeambookConfig {
            root: dir.path().to_path_buf(),
            teambook: teambook.to_string(),
            identity_dir: Some(dir.path().join("identity")),
            semantic: true,
            ..Default::default()
        };
        let store: Arc<dyn StorageBackend> = Arc::new(SqliteBackend::new(config.root.clone()));
        let bus = EventBus::new(256);
        (dir, Arc::new(Kernel::new(config, store, bus)))
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::test_kernel;
    use super::*;

    #[tokio::test]
    async fn test_status_reports_backend_and_identity() {
        let (_dir, kernel) = test_kernel().await;
        let status = kernel.get_status().await.expect("status");
        let data = status.data.expect("data");
        assert_eq!(data["backend"], "embedded");
        assert_eq!(data["teambook"], "demo");
        assert!(data["ai_id"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_use_teambook_switches_and_persists() {
        let (_dir, kernel) = test_kernel().await;
        kernel.use_teambook("project-x").await.expect("switch");
        assert_eq!(kernel.current_teambook(), "project-x");
        let persisted =
            std::fs::read_to_string(kernel.config().current_teambook_file()).expect("context file");
        assert_eq!(persisted.trim(), "project-x");

        let listed = kernel.list_teambooks().await.expect("list");
        let data = listed.data.expect("data");
        let names: Vec<&str> = data["teambooks"]
            .as_array()
            .expect("array")
            .iter()
            .filter_map(|book| book["name"].as_str())
            .collect();
        assert!(names.contains(&"project-x"));
    }

    #[tokio::test]
    async fn test_use_teambook_rejects_bad_names() {
        let (_dir, kernel) = test_kernel().await;
        let err = kernel.use_teambook("bad name!").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidItem);
    }

    #[tokio::test]
    async fn test_maintenance_runs_clean() {
        let (_dir, kernel) = test_kernel().await;
        let report = kernel.maintenance().await.expect("maintenance");
        assert!(report.success);
    }
}
