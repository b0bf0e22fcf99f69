//! Backend selection with a live connectivity probe.

use crate::{PostgresBackend, RedisBackend, SqliteBackend, StorageBackend};
use std::sync::Arc;
use teambook_core::TeambookConfig;
use tracing::{info, warn};

const PG_POOL_SIZE: usize = 20;

/// Pick a storage backend once at process start.
///
/// Priority order:
/// 1. PostgreSQL, if `POSTGRES_URL`/`DATABASE_URL` is set AND a connection
///    succeeds.
/// 2. Redis, if `USE_REDIS` is enabled AND the server answers PING.
/// 3. Embedded sqlite, always available.
///
/// Connectivity is verified, not just configuration: a configured but
/// unreachable backend falls through to the next preference.
pub async fn select_backend(config: &TeambookConfig) -> Arc<dyn StorageBackend> {
    if let Some(url) = &config.postgres_url {
        match PostgresBackend::connect(url, PG_POOL_SIZE).await {
            Ok(backend) => {
                info!("storage backend: postgres");
                return Arc::new(backend);
            }
            Err(err) => {
                warn!(error = %err, "postgres configured but connection failed, falling back");
            }
        }
    }

    if config.use_redis {
        match RedisBackend::connect(&config.redis_url).await {
            Ok(backend) => {
                info!("storage backend: redis");
                return Arc::new(backend);
            }
            Err(err) => {
                warn!(error = %err, "redis enabled but connection failed, falling back");
            }
        }
    }

    info!(root = %config.root.display(), "storage backend: embedded sqlite");
    Arc::new(SqliteBackend::new(config.root.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use teambook_core::BackendKind;

    #[tokio::test]
    async fn test_unreachable_backends_fall_through_to_embedded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = TeambookConfig {
            root: dir.path().to_path_buf(),
            postgres_url: Some("postgres://nobody@127.0.0.1:1/none".to_string()),
            use_redis: true,
            redis_url: "redis://127.0.0.1:1/0".to_string(),
            ..Default::default()
        };
        let backend = select_backend(&config).await;
        assert_eq!(backend.kind(), BackendKind::Embedded);
        backend.ping().await.expect("embedded ping");
    }

    #[tokio::test]
    async fn test_default_is_embedded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = TeambookConfig {
            root: dir.path().to_path_buf(),
            ..Default::default()
        };
        let backend = select_backend(&config).await;
        assert_eq!(backend.kind(), BackendKind::Embedded);
    }
}
