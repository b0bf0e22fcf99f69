//! The identity endpoint.

use crate::AppState;
use axum::extract::{Query, State};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::collections::BTreeMap;
use teambook_core::HandleCapabilities;

/// Query parameters accepted by `GET /identity`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdentityQuery {
    pub protocol: Option<String>,
    pub prefer_pretty: Option<String>,
    pub pattern: Option<String>,
    pub max_length: Option<String>,
    pub supports_spaces: Option<String>,
    pub supports_unicode: Option<String>,
    pub prefer_ascii: Option<String>,
    /// Comma-separated list of extra protocols to resolve.
    pub protocols: Option<String>,
}

fn parse_bool(raw: Option<&str>, default: bool) -> bool {
    match raw {
        None => default,
        Some(raw) => !matches!(
            raw.trim().to_ascii_lowercase().as_str(),
            "0" | "false" | "no" | "off" | ""
        ),
    }
}

fn capabilities_from_query(query: &IdentityQuery) -> HandleCapabilities {
    HandleCapabilities {
        pattern: query.pattern.clone().filter(|p| !p.is_empty()),
        max_length: query
            .max_length
            .as_deref()
            .and_then(|raw| raw.parse().ok())
            .filter(|n| *n > 0),
        supports_spaces: query
            .supports_spaces
            .as_deref()
            .map(|raw| parse_bool(Some(raw), false)),
        supports_unicode: query
            .supports_unicode
            .as_deref()
            .map(|raw| parse_bool(Some(raw), false)),
        prefer_ascii: query
            .prefer_ascii
            .as_deref()
            .map(|raw| parse_bool(Some(raw), false)),
    }
}

/// Identity snapshot: resolved handles, a signed envelope over the payload,
/// and the request echo.
pub async fn identity_handler(
    State(state): State<AppState>,
    Query(query): Query<IdentityQuery>,
) -> Json<JsonValue> {
    let identity = state.kernel.identity();
    let meta = identity.identity();
    let prefer_pretty = parse_bool(query.prefer_pretty.as_deref(), false);
    let capabilities = capabilities_from_query(&query);

    let resolved_handle =
        identity.resolve_handle(query.protocol.as_deref(), &capabilities, prefer_pretty);

    let protocol_list: Vec<String> = query
        .protocols
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| p.to_ascii_lowercase())
        .collect();

    let mut resolved_handles: BTreeMap<String, String> = meta.handles.clone();
    for protocol in &protocol_list {
        let pretty = matches!(protocol.as_str(), "cli" | "terminal" | "shell");
        resolved_handles.insert(
            protocol.clone(),
            identity.resolve_handle(Some(protocol), &capabilities, pretty),
        );
    }

    let payload = json!({
        "ai_id": meta.ai_id,
        "display_name": meta.display_name,
        "fingerprint": meta.fingerprint,
        "public_key": meta.public_key,
        "handles": meta.handles,
        "resolved_handle": resolved_handle,
        "resolved_handles": resolved_handles,
        "resolved_context": {
            "protocol": query.protocol,
            "prefer_pretty": prefer_pretty,
            "capabilities": capabilities,
        },
        "timestamp": Utc::now().to_rfc3339(),
    });
    let envelope = identity.build_envelope(&payload, "teambook.http.identity");

    let matches_pattern = match &capabilities.pattern {
        Some(pattern) => regex::Regex::new(pattern)
            .map(|re| re.is_match(&resolved_handle))
            .unwrap_or(false),
        None => true,
    };

    Json(json!({
        "identity": payload,
        "envelope": envelope,
        "matches_pattern": matches_pattern,
        "request": {
            "protocol": query.protocol,
            "prefer_pretty": prefer_pretty,
            "capabilities": capabilities,
            "protocols": protocol_list,
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use teambook_core::derive_fingerprint;
    use teambook_events::EventBus;
    use teambook_kernel::{Kernel, SigningIdentity};
    use teambook_storage::SqliteBackend;

    async fn state() -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = teambook_core::TeambookConfig {
            root: dir.path().to_path_buf(),
            identity_dir: Some(dir.path().join("identity")),
            ..Default::default()
        };
        let store = std::sync::Arc::new(SqliteBackend::new(config.root.clone()));
        let kernel = std::sync::Arc::new(Kernel::new(config, store, EventBus::new(64)));
        (dir, AppState::new(kernel))
    }

    #[tokio::test]
    async fn test_identity_snapshot_shape() {
        let (_dir, state) = state().await;
        let Json(body) = identity_handler(
            State(state.clone()),
            Query(IdentityQuery {
                protocol: Some("mcp".to_string()),
                protocols: Some("cli,http".to_string()),
                ..Default::default()
            }),
        )
        .await;

        let identity = &body["identity"];
        assert!(identity["ai_id"].as_str().is_some());
        assert_eq!(identity["fingerprint"].as_str().unwrap().len(), 16);
        assert!(body["matches_pattern"].as_bool().unwrap());
        assert_eq!(body["request"]["protocols"].as_array().unwrap().len(), 2);
        assert!(body["identity"]["resolved_handles"]["cli"].is_string());
        assert_eq!(body["envelope"]["status"], "signed");
    }

    #[tokio::test]
    async fn test_fingerprint_invariant_and_signature() {
        let (_dir, state) = state().await;
        let Json(body) = identity_handler(
            State(state.clone()),
            Query(IdentityQuery::default()),
        )
        .await;

        let pk_b64 = body["identity"]["public_key"].as_str().unwrap();
        let pk = base64::engine::general_purpose::STANDARD
            .decode(pk_b64)
            .unwrap();
        assert_eq!(
            body["identity"]["fingerprint"].as_str().unwrap(),
            derive_fingerprint(&pk)
        );

        // The envelope signature verifies over the canonical envelope
        // minus signature/status.
        let envelope: teambook_core::Envelope =
            serde_json::from_value(body["envelope"].clone()).unwrap();
        assert!(SigningIdentity::verify(
            pk_b64,
            &envelope.signing_bytes(),
            envelope.signature.as_deref().unwrap(),
        ));
    }

    #[tokio::test]
    async fn test_pattern_mismatch_reported() {
        let (_dir, state) = state().await;
        let Json(body) = identity_handler(
            State(state),
            Query(IdentityQuery {
                pattern: Some("^zzz$".to_string()),
                ..Default::default()
            }),
        )
        .await;
        assert_eq!(body["matches_pattern"], false);
    }
}
