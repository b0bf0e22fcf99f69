//! End-to-end scenarios across two kernel instances sharing one embedded
//! store, simulating two AI processes attached to the same teambook.

use serde_json::json;
use std::sync::Arc;
use teambook_core::TeambookConfig;
use teambook_events::EventBus;
use teambook_kernel::Kernel;
use teambook_storage::{SqliteBackend, StorageBackend};

/// Two kernels ("alpha", "beta") over the same root directory.
fn two_kernels(dir: &tempfile::TempDir) -> (Arc<Kernel>, Arc<Kernel>) {
    let make = |name: &str| {
        let config = TeambookConfig {
            root: dir.path().to_path_buf(),
            teambook: "shared".to_string(),
            identity_dir: Some(dir.path().join(format!("identity-{}", name))),
            ai_id_override: Some(format!("{}-001", name)),
            display_name: Some(name.to_string()),
            ..Default::default()
        };
        let store: Arc<dyn StorageBackend> = Arc::new(SqliteBackend::new(config.root.clone()));
        Arc::new(Kernel::new(config, store, EventBus::new(256)))
    };
    (make("alpha"), make("beta"))
}

#[tokio::test]
async fn scenario_broadcast_then_read() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (alpha, beta) = two_kernels(&dir);

    let sent = alpha
        .execute("send_message", &json!({"content": "hello", "channel": "general"}))
        .await;
    assert!(sent.success, "{:?}", sent);
    assert_eq!(sent.data.as_ref().unwrap()["msg_id"], 1);

    let read = beta
        .execute(
            "get_messages",
            &json!({"channel": "general", "compact": true, "limit": 10}),
        )
        .await;
    assert!(read.success);
    let messages = read.data.unwrap()["messages"].as_array().unwrap().clone();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["from"], "alpha-001");
    assert_eq!(messages[0]["to"], "all");
    assert_eq!(messages[0]["summary"], "hello");
    assert_eq!(messages[0]["unread"], true);
}

#[tokio::test]
async fn scenario_dm_routing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (alpha, beta) = two_kernels(&dir);

    let sent = alpha
        .execute(
            "send_message",
            &json!({"content": "ping", "to": "beta-001", "ttl_hours": 1}),
        )
        .await;
    assert!(sent.success, "{:?}", sent);

    // The recipient sees the DM; the sender's DM inbox stays empty.
    let theirs = beta.execute("read_dms", &json!({})).await;
    let messages = theirs.data.unwrap()["messages"].as_array().unwrap().clone();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["from"], "alpha-001");

    let mine = alpha.execute("read_dms", &json!({})).await;
    let messages = mine.data.unwrap()["messages"].as_array().unwrap().clone();
    assert!(messages.is_empty());
}

#[tokio::test]
async fn scenario_lock_contention() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (alpha, beta) = two_kernels(&dir);

    let first = alpha
        .execute("acquire_lock", &json!({"resource_id": "auth.rs", "timeout": 30}))
        .await;
    assert!(first.success);

    let contested = beta
        .execute("acquire_lock", &json!({"resource_id": "auth.rs", "timeout": 30}))
        .await;
    assert!(!contested.success);
    assert_eq!(contested.error.as_deref(), Some("not_your_lock"));
    assert!(contested.message.contains("locked_by:alpha-001"));

    // After release the other AI can take it.
    let released = alpha
        .execute("release_lock", &json!({"resource_id": "auth.rs"}))
        .await;
    assert!(released.success);
    let retaken = beta
        .execute("acquire_lock", &json!({"resource_id": "auth.rs", "timeout": 30}))
        .await;
    assert!(retaken.success);
}

#[tokio::test]
async fn scenario_task_claim_exactly_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (alpha, beta) = two_kernels(&dir);

    let queued = alpha
        .execute("queue_task", &json!({"task": "ship docs", "priority": 7}))
        .await;
    assert!(queued.success);
    let task_id = queued.data.unwrap()["task_id"].as_i64().unwrap();

    let claim_args = json!({});
    let (a, b) = tokio::join!(
        alpha.execute("claim_task", &claim_args),
        beta.execute("claim_task", &claim_args),
    );
    let wins = [&a, &b]
        .iter()
        .filter(|resp| {
            resp.data
                .as_ref()
                .and_then(|d| d.get("task_id"))
                .is_some()
        })
        .count();
    assert_eq!(wins, 1, "exactly one claim wins: {:?} {:?}", a, b);

    // The non-claimer cannot complete.
    let claimer_is_alpha = a
        .data
        .as_ref()
        .and_then(|d| d.get("task_id"))
        .is_some();
    let (claimer, bystander) = if claimer_is_alpha {
        (&alpha, &beta)
    } else {
        (&beta, &alpha)
    };
    let denied = bystander
        .execute("complete_task", &json!({"id": task_id.to_string()}))
        .await;
    assert_eq!(denied.error.as_deref(), Some("not_your_task"));

    let done = claimer
        .execute(
            "complete_task",
            &json!({"id": task_id.to_string(), "result": "done"}),
        )
        .await;
    assert!(done.success, "{:?}", done);
}

#[tokio::test]
async fn scenario_watch_event_delivery() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (alpha, beta) = two_kernels(&dir);

    let written = beta
        .execute("write_note", &json!({"content": "watched note"}))
        .await;
    let note_id = written.data.unwrap()["note_id"].as_i64().unwrap();

    let watched = alpha
        .execute(
            "watch",
            &json!({
                "item_type": "note",
                "item_id": note_id.to_string(),
                "event_types": ["edited"],
            }),
        )
        .await;
    assert!(watched.success);

    beta.execute(
        "write_note",
        &json!({"content": "unrelated note that should not deliver"}),
    )
    .await;
    let updated = beta
        .execute(
            "get_note",
            &json!({"id": note_id.to_string()}),
        )
        .await;
    assert!(updated.success);
    let edited = beta
        .execute(
            "pin",
            &json!({"id": note_id.to_string()}),
        )
        .await;
    assert!(edited.success);

    let events = alpha
        .execute("get_events", &json!({"since": "1h"}))
        .await;
    assert!(events.success);
    let events = events.data.unwrap()["events"].as_array().unwrap().clone();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["type"], "edited");
    assert_eq!(events[0]["actor_ai_id"], "beta-001");
    assert_eq!(events[0]["item_id"], note_id.to_string());
}

#[tokio::test]
async fn scenario_evolution_synthesize_top() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (alpha, beta) = two_kernels(&dir);

    let evo = alpha
        .execute("evolve", &json!({"goal": "pick auth lib", "output": "auth.md"}))
        .await;
    assert!(evo.success);
    let evo_id = evo.data.unwrap()["evo_id"].as_i64().unwrap().to_string();

    let jwt = alpha
        .execute("contribute", &json!({"evo_id": evo_id, "content": "use JWT"}))
        .await;
    let jwt_id = jwt.data.unwrap()["contrib_id"].as_i64().unwrap();
    let oauth = beta
        .execute("contribute", &json!({"evo_id": evo_id, "content": "use OAuth"}))
        .await;
    let oauth_id = oauth.data.unwrap()["contrib_id"].as_i64().unwrap();

    beta.execute("rank", &json!({"contrib_id": jwt_id, "score": 8}))
        .await;
    alpha
        .execute("rank", &json!({"contrib_id": oauth_id, "score": 6}))
        .await;

    let synthesized = alpha
        .execute(
            "synthesize",
            &json!({"evo_id": evo_id, "strategy": "top", "min_score": 7.0}),
        )
        .await;
    assert!(synthesized.success, "{:?}", synthesized);
    let output = synthesized.data.unwrap()["output"].as_str().unwrap().to_string();
    assert!(output.ends_with("auth.md"));

    let document = std::fs::read_to_string(&output).expect("artifact written");
    assert!(document.contains("use JWT"));
    assert!(!document.contains("use OAuth"));
}

#[tokio::test]
async fn scenario_presence_across_instances() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (alpha, beta) = two_kernels(&dir);

    alpha
        .execute("set_status", &json!({"message": "on auth"}))
        .await;
    beta.execute("write_note", &json!({"content": "beta was here"}))
        .await;

    let here = alpha.execute("who_is_here", &json!({"minutes": 15})).await;
    let list = here.data.unwrap()["here"].as_array().unwrap().clone();
    let ids: Vec<&str> = list.iter().filter_map(|p| p["ai_id"].as_str()).collect();
    assert!(ids.contains(&"alpha-001"));
    assert!(ids.contains(&"beta-001"));
}

#[tokio::test]
async fn scenario_tamper_hash_verifiable_end_to_end() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (alpha, _beta) = two_kernels(&dir);

    alpha
        .execute(
            "write_note",
            &json!({"content": "verify me", "tags": ["check"], "pinned": true}),
        )
        .await;

    // Recompute over the stored record's semantic fields.
    let note = alpha
        .storage()
        .get_note("shared", teambook_core::NoteId::from(1))
        .await
        .expect("read")
        .expect("present");
    assert_eq!(note.tamper_hash, note.compute_tamper_hash());
}
