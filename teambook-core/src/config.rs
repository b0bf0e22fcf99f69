//! Configuration and tunable limits.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ============================================================================
// LIMITS AND TUNABLES
// ============================================================================

/// Max note/message content length in characters. Longer content is
/// truncated with a warning, never rejected.
pub const MAX_CONTENT_CHARS: usize = 5000;
/// Max note summary length.
pub const MAX_NOTE_SUMMARY_CHARS: usize = 200;
/// Max message summary length.
pub const MAX_MESSAGE_SUMMARY_CHARS: usize = 400;
/// Max task text length.
pub const MAX_TASK_CHARS: usize = 2000;
/// Max channel name length.
pub const MAX_CHANNEL_CHARS: usize = 50;

/// Message TTL clamp, hours.
pub const MESSAGE_TTL_MIN_HOURS: i64 = 1;
pub const MESSAGE_TTL_MAX_HOURS: i64 = 168;
pub const MESSAGE_TTL_DEFAULT_HOURS: i64 = 24;

/// Per-AI message rate, sliding minute window.
pub const MAX_MESSAGES_PER_MINUTE: usize = 100;
/// Per-AI kernel call rate, sliding second window.
pub const MAX_CALLS_PER_SECOND: usize = 50;
/// Per-AI kernel call rate, sliding minute window.
pub const MAX_CALLS_PER_MINUTE: usize = 600;
/// Error cascade trip threshold, errors per minute.
pub const ERROR_CASCADE_THRESHOLD: usize = 20;
/// Event query rate, sliding minute window.
pub const MAX_EVENT_QUERY_RATE: usize = 100;

/// Coordination limits.
pub const MAX_LOCKS_PER_AI: usize = 10;
pub const LOCK_TIMEOUT_MAX_SECS: i64 = 300;
pub const LOCK_EXTEND_MAX_SECS: i64 = 300;
pub const MAX_QUEUE_SIZE: usize = 1000;

/// Watch/event limits.
pub const MAX_WATCHES_PER_AI: usize = 50;
pub const EVENT_RETENTION_DAYS: i64 = 7;
/// Opportunistic cleanup probability denominator (~10%).
pub const CLEANUP_SAMPLE: u32 = 10;

/// Evolution limits.
pub const MAX_EVOLUTIONS_PER_TEAMBOOK: usize = 20;
pub const MAX_CONTRIBUTIONS_PER_AI: usize = 10;
pub const MAX_CONTRIBUTION_BYTES: usize = 10 * 1024;
pub const MAX_VOTE_CHANGES: i64 = 5;
pub const MAX_SYNTHESIS_PER_HOUR: usize = 10;
pub const SYNTHESIS_CONSENSUS_SCORE: f64 = 9.0;
pub const SYNTHESIS_TOP_LIMIT: usize = 5;

/// Note graph tunables.
pub const SESSION_GAP_MINUTES: i64 = 30;
pub const TEMPORAL_EDGES: usize = 3;
pub const PAGERANK_MIN_NOTES: u64 = 50;
pub const PAGERANK_CACHE_SECONDS: u64 = 300;
pub const PAGERANK_ITERATIONS: usize = 20;
pub const PAGERANK_DAMPING: f64 = 0.85;
pub const GRAPH_MAX_HOPS: usize = 2;

/// Compression threshold: content below this stays plain.
pub const COMPRESS_THRESHOLD_BYTES: usize = 512;

/// Presence retention, days.
pub const PRESENCE_RETENTION_DAYS: i64 = 30;

/// Streaming tunables.
pub const STREAM_TOKEN_TTL_HOURS: i64 = 24;
pub const STREAM_IDLE_TIMEOUT_SECS: u64 = 300;
pub const STREAM_RATE_PER_SECOND: u32 = 100;

/// Write-through cache of this process's last notes.
pub const WRITE_CACHE_SIZE: usize = 10;

/// Sentinel teambook used when no teambook is active.
pub const PRIVATE_TEAMBOOK: &str = "_private";

// ============================================================================
// NAME VALIDATION
// ============================================================================

static TEAMBOOK_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("teambook name regex"));
static CHANNEL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9_-]+$").expect("channel regex"));

/// Teambook names: alphanumeric plus dash/underscore. The `_private`
/// sentinel also passes.
pub fn is_valid_teambook_name(name: &str) -> bool {
    TEAMBOOK_NAME_RE.is_match(name)
}

/// Channel names: `^[a-z0-9_-]+$`, max length 50. `allow_wildcard` permits
/// `*` segments for subscriptions only.
pub fn is_valid_channel(name: &str, allow_wildcard: bool) -> bool {
    if name.is_empty() || name.len() > MAX_CHANNEL_CHARS {
        return false;
    }
    if name == crate::DM_CHANNEL {
        return true;
    }
    if allow_wildcard {
        return name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "_-*".contains(c));
    }
    CHANNEL_RE.is_match(name)
}

// ============================================================================
// BACKEND SELECTION
// ============================================================================

/// Which storage backend a process ended up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Embedded sqlite database under the teambook root.
    Embedded,
    /// Remote PostgreSQL over a bounded connection pool.
    Postgres,
    /// Redis key-value store with pub/sub.
    Redis,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Embedded => "embedded",
            BackendKind::Postgres => "postgres",
            BackendKind::Redis => "redis",
        }
    }
}

/// Output rendering for the CLI host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Pipe,
    Json,
}

// ============================================================================
// CONFIG
// ============================================================================

/// Process configuration, resolved once from the environment at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeambookConfig {
    /// Storage root (`TEAMBOOK_ROOT` or `~/.teambook`).
    pub root: PathBuf,
    /// Default active teambook (`TEAMBOOK_NAME`), `_private` when unset.
    pub teambook: String,
    pub format: OutputFormat,
    /// Remote SQL URL (`POSTGRES_URL` / `DATABASE_URL`).
    pub postgres_url: Option<String>,
    /// `USE_REDIS` flag.
    pub use_redis: bool,
    /// `REDIS_URL`, defaulted when redis is enabled.
    pub redis_url: String,
    /// `TEAMBOOK_SEMANTIC` enables the vector index.
    pub semantic: bool,
    /// Identity overrides.
    pub ai_id_override: Option<String>,
    pub display_name: Option<String>,
    pub identity_file: Option<PathBuf>,
    pub identity_dir: Option<PathBuf>,
    pub identity_registry: Option<PathBuf>,
    /// Terminal hint: strip non-ASCII from pipe output.
    pub force_ascii: bool,
}

impl TeambookConfig {
    /// Read configuration from environment variables, falling back to a
    /// temp directory if the home-rooted default cannot be created.
    pub fn from_env() -> Self {
        let root = std::env::var("TEAMBOOK_ROOT")
            .map(PathBuf::from)
            .ok()
            .or_else(|| dirs_fallback())
            .unwrap_or_else(std::env::temp_dir);

        let teambook = std::env::var("TEAMBOOK_NAME")
            .ok()
            .filter(|name| is_valid_teambook_name(name))
            .unwrap_or_else(|| PRIVATE_TEAMBOOK.to_string());

        let format = match std::env::var("TEAMBOOK_FORMAT").ok().as_deref() {
            Some("json") => OutputFormat::Json,
            _ => OutputFormat::Pipe,
        };

        Self {
            root,
            teambook,
            format,
            postgres_url: std::env::var("POSTGRES_URL")
                .or_else(|_| std::env::var("DATABASE_URL"))
                .ok(),
            use_redis: env_flag("USE_REDIS"),
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379/0".to_string()),
            semantic: env_flag("TEAMBOOK_SEMANTIC"),
            ai_id_override: std::env::var("AI_ID").ok(),
            display_name: std::env::var("AI_DISPLAY_NAME").ok(),
            identity_file: std::env::var("AI_IDENTITY_FILE").map(PathBuf::from).ok(),
            identity_dir: std::env::var("AI_IDENTITY_DIR").map(PathBuf::from).ok(),
            identity_registry: std::env::var("AI_IDENTITY_REGISTRY")
                .map(PathBuf::from)
                .ok(),
            force_ascii: env_flag("TEAMBOOK_FORCE_ASCII") || env_flag("MCP_FORCE_ASCII"),
        }
    }

    /// Per-teambook directory (`<root>/<name>/`).
    pub fn teambook_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Evolution artifact directory (`<root>/<name>/outputs/`).
    pub fn outputs_dir(&self, name: &str) -> PathBuf {
        self.teambook_dir(name).join("outputs")
    }

    /// Vector index directory (`<root>/<name>/vectors/`).
    pub fn vectors_dir(&self, name: &str) -> PathBuf {
        self.teambook_dir(name).join("vectors")
    }

    /// Vault key file (`<root>/<name>/.vault_key`).
    pub fn vault_key_file(&self, name: &str) -> PathBuf {
        self.teambook_dir(name).join(".vault_key")
    }

    /// Active-teambook context file (`<root>/.current_teambook`).
    pub fn current_teambook_file(&self) -> PathBuf {
        self.root.join(".current_teambook")
    }
}

impl Default for TeambookConfig {
    fn default() -> Self {
        Self {
            root: std::env::temp_dir().join("teambook"),
            teambook: PRIVATE_TEAMBOOK.to_string(),
            format: OutputFormat::Pipe,
            postgres_url: None,
            use_redis: false,
            redis_url: "redis://localhost:6379/0".to_string(),
            semantic: false,
            ai_id_override: None,
            display_name: None,
            identity_file: None,
            identity_dir: None,
            identity_registry: None,
            force_ascii: false,
        }
    }
}

fn env_flag(key: &str) -> bool {
    matches!(
        std::env::var(key)
            .unwrap_or_default()
            .to_ascii_lowercase()
            .as_str(),
        "true" | "1" | "yes"
    )
}

fn dirs_fallback() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".teambook"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_teambook_name_validation() {
        assert!(is_valid_teambook_name("project-42"));
        assert!(is_valid_teambook_name("_private"));
        assert!(!is_valid_teambook_name("bad name"));
        assert!(!is_valid_teambook_name(""));
    }

    #[test]
    fn test_channel_validation() {
        assert!(is_valid_channel("general", false));
        assert!(is_valid_channel("_dm", false));
        assert!(!is_valid_channel("General", false));
        assert!(!is_valid_channel("dev-*", false));
        assert!(is_valid_channel("dev-*", true));
        assert!(!is_valid_channel(&"x".repeat(51), false));
    }

    #[test]
    fn test_ttl_clamp_constants() {
        assert!(MESSAGE_TTL_MIN_HOURS < MESSAGE_TTL_DEFAULT_HOURS);
        assert!(MESSAGE_TTL_DEFAULT_HOURS < MESSAGE_TTL_MAX_HOURS);
    }
}
