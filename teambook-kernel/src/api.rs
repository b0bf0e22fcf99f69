//! Unified verb entry point for CLI, MCP, and HTTP hosts.
//!
//! `Kernel::execute` takes a verb name and a loosely typed JSON argument
//! object, runs validation/rate limiting, dispatches to the typed method,
//! and shapes the structured response. Presence and operation stats are
//! updated on every call; their failures are swallowed.

use crate::messaging::SendMessageArgs;
use crate::notes::WriteNoteArgs;
use crate::validate::{normalize_int, normalize_json_str};
use crate::{Kernel, KernelResponse};
use serde_json::Value as JsonValue;
use std::str::FromStr;
use std::time::Instant;
use teambook_core::*;
use tracing::debug;

/// Every verb the kernel exposes, in the order hosts list them.
pub const KERNEL_VERBS: &[&str] = &[
    "write_note",
    "read_notes",
    "get_note",
    "recall",
    "pin",
    "unpin",
    "delete_note",
    "send_message",
    "get_messages",
    "read_dms",
    "acquire_lock",
    "release_lock",
    "extend_lock",
    "queue_task",
    "claim_task",
    "complete_task",
    "watch",
    "unwatch",
    "get_events",
    "who_is_here",
    "set_status",
    "evolve",
    "contribute",
    "contributions",
    "rank",
    "vote",
    "synthesize",
    "conflicts",
    "vault_set",
    "vault_get",
    "vault_delete",
    "vault_list",
    "use_teambook",
    "list_teambooks",
    "detangle_open",
    "detangle_resolve",
    "get_status",
    "maintenance",
];

/// Verb alias for hosts that want the list type-checked.
pub type KernelVerb = &'static str;

fn arg_str(args: &JsonValue, key: &str) -> Option<String> {
    normalize_json_str(args.get(key).unwrap_or(&JsonValue::Null))
}

fn arg_int(args: &JsonValue, key: &str) -> Option<i64> {
    args.get(key).and_then(normalize_int)
}

fn arg_bool(args: &JsonValue, key: &str, default: bool) -> bool {
    match args.get(key) {
        Some(JsonValue::Bool(b)) => *b,
        Some(JsonValue::String(s)) => matches!(s.to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        _ => default,
    }
}

fn arg_string_vec(args: &JsonValue, key: &str) -> Vec<String> {
    match args.get(key) {
        Some(JsonValue::Array(items)) => items
            .iter()
            .filter_map(normalize_json_str)
            .collect(),
        Some(JsonValue::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect(),
        _ => vec![],
    }
}

fn required_str(args: &JsonValue, key: &str) -> TeambookResult<String> {
    arg_str(args, key).ok_or_else(|| {
        TeambookError::new(ErrorCode::InvalidItem, format!("missing argument '{}'", key))
    })
}

impl Kernel {
    /// Execute a verb by name. Always returns a structured response.
    pub async fn execute(&self, verb: &str, args: &JsonValue) -> KernelResponse {
        let started = Instant::now();

        if self.limiter.cascade_tripped(self.ai_id()) {
            return KernelResponse::err(TeambookError::rate_limit(
                "error cascade tripped, backing off",
            ));
        }
        if let Err(err) = self.limiter.admit_call(self.ai_id()) {
            return KernelResponse::err(err);
        }

        let result = self.dispatch(verb, args).await;
        if result.is_err() {
            self.limiter.record_error(self.ai_id());
        }

        self.touch_presence(verb).await;
        self.record_op(verb, started).await;

        match result {
            Ok(response) => response,
            Err(err) => {
                debug!(verb, code = %err.code, "verb failed");
                KernelResponse::err(err)
            }
        }
    }

    async fn dispatch(&self, verb: &str, args: &JsonValue) -> TeambookResult<KernelResponse> {
        match verb {
            "write_note" => {
                let policy = arg_str(args, "representation_policy")
                    .map(|s| RepresentationPolicy::from_str(&s))
                    .transpose()
                    .map_err(|e| TeambookError::new(ErrorCode::InvalidItem, e))?
                    .unwrap_or_default();
                self.write_note(WriteNoteArgs {
                    content: required_str(args, "content")?,
                    summary: arg_str(args, "summary"),
                    tags: arg_string_vec(args, "tags"),
                    pinned: arg_bool(args, "pinned", false),
                    owner: arg_str(args, "owner").map(AiId::new),
                    note_type: arg_str(args, "type"),
                    parent_id: arg_int(args, "parent_id").map(NoteId::new),
                    linked_items: arg_string_vec(args, "linked_items"),
                    representation_policy: policy,
                    metadata: args.get("metadata").filter(|m| !m.is_null()).cloned(),
                })
                .await
            }
            "read_notes" => {
                let mode = match arg_str(args, "mode").as_deref() {
                    Some("important") => ReadMode::Important,
                    _ => ReadMode::Recent,
                };
                self.read_notes(NoteFilter {
                    tag: arg_str(args, "tag"),
                    owner: arg_str(args, "owner").map(AiId::new),
                    note_type: arg_str(args, "type"),
                    pinned_only: arg_bool(args, "pinned_only", false).then_some(true),
                    query: arg_str(args, "query"),
                    mode,
                    limit: arg_int(args, "limit").unwrap_or(20).max(1) as usize,
                    offset: arg_int(args, "offset").unwrap_or(0).max(0) as usize,
                    ..Default::default()
                })
                .await
            }
            "get_note" => self.get_note(&required_str(args, "id")?).await,
            "recall" => {
                self.recall(
                    &required_str(args, "query")?,
                    arg_int(args, "limit").unwrap_or(10).max(1) as usize,
                )
                .await
            }
            "pin" => self.pin_note(&required_str(args, "id")?, true).await,
            "unpin" => self.pin_note(&required_str(args, "id")?, false).await,
            "delete_note" => self.delete_note(&required_str(args, "id")?).await,
            "send_message" => {
                self.send_message(SendMessageArgs {
                    content: required_str(args, "content")?,
                    to: arg_str(args, "to").map(AiId::new),
                    channel: arg_str(args, "channel"),
                    reply_to: arg_int(args, "reply_to").map(MessageId::new),
                    summary: arg_str(args, "summary"),
                    ttl_hours: arg_int(args, "ttl_hours"),
                })
                .await
            }
            "get_messages" => {
                self.get_messages(
                    arg_str(args, "channel"),
                    arg_str(args, "since").as_deref(),
                    arg_bool(args, "unread_only", false),
                    arg_int(args, "thread_id").map(MessageId::new),
                    arg_bool(args, "compact", true),
                    arg_int(args, "limit").unwrap_or(20).max(1) as usize,
                )
                .await
            }
            "read_dms" => {
                self.read_dms(
                    arg_bool(args, "unread_only", false),
                    arg_int(args, "limit").unwrap_or(20).max(1) as usize,
                )
                .await
            }
            "acquire_lock" => {
                self.acquire_lock(
                    &required_str(args, "resource_id")?,
                    arg_int(args, "timeout").unwrap_or(60),
                )
                .await
            }
            "release_lock" => self.release_lock(&required_str(args, "resource_id")?).await,
            "extend_lock" => {
                self.extend_lock(
                    &required_str(args, "resource_id")?,
                    arg_int(args, "seconds").unwrap_or(60),
                )
                .await
            }
            "queue_task" => {
                self.queue_task(
                    &required_str(args, "task")?,
                    arg_int(args, "priority").unwrap_or(5).clamp(0, 255) as u8,
                    args.get("metadata").filter(|m| !m.is_null()).cloned(),
                )
                .await
            }
            "claim_task" => self.claim_task(arg_bool(args, "prefer_priority", true)).await,
            "complete_task" => {
                self.complete_task(&required_str(args, "id")?, arg_str(args, "result"))
                    .await
            }
            "watch" => {
                let item_type = parse_item_type(&required_str(args, "item_type")?)?;
                self.watch(
                    item_type,
                    &required_str(args, "item_id")?,
                    arg_string_vec(args, "event_types"),
                )
                .await
            }
            "unwatch" => {
                let item_type = parse_item_type(&required_str(args, "item_type")?)?;
                self.unwatch(item_type, &required_str(args, "item_id")?).await
            }
            "get_events" => {
                self.get_events(
                    arg_str(args, "since").as_deref(),
                    arg_int(args, "limit").unwrap_or(20).max(1) as usize,
                    arg_bool(args, "mark_seen", true),
                )
                .await
            }
            "who_is_here" => self.who_is_here(arg_int(args, "minutes").unwrap_or(15)).await,
            "set_status" => self.set_status(arg_str(args, "message")).await,
            "evolve" => {
                self.evolve(&required_str(args, "goal")?, arg_str(args, "output"))
                    .await
            }
            "contribute" => {
                self.contribute(
                    &required_str(args, "evo_id")?,
                    &required_str(args, "content")?,
                    arg_str(args, "approach"),
                )
                .await
            }
            "contributions" => self.contributions(&required_str(args, "evo_id")?).await,
            "rank" => {
                let score = args
                    .get("score")
                    .and_then(JsonValue::as_f64)
                    .or_else(|| arg_int(args, "score").map(|n| n as f64))
                    .ok_or_else(|| {
                        TeambookError::new(ErrorCode::InvalidScore, "missing score")
                    })?;
                self.rank(
                    arg_int(args, "contrib_id").ok_or_else(|| {
                        TeambookError::new(ErrorCode::InvalidItem, "missing contrib_id")
                    })?,
                    score,
                    arg_str(args, "reason"),
                )
                .await
            }
            "vote" => {
                let preferred = match args.get("preferred") {
                    Some(JsonValue::Array(items)) => {
                        items.iter().filter_map(normalize_int).collect()
                    }
                    _ => vec![],
                };
                self.vote(&required_str(args, "evo_id")?, preferred).await
            }
            "synthesize" => {
                let strategy = arg_str(args, "strategy")
                    .map(|s| SynthesisStrategy::from_str(&s))
                    .transpose()
                    .map_err(|e| TeambookError::new(ErrorCode::InvalidItem, e))?
                    .unwrap_or(SynthesisStrategy::Top);
                let min_score = args
                    .get("min_score")
                    .and_then(JsonValue::as_f64)
                    .unwrap_or(7.0);
                self.synthesize(&required_str(args, "evo_id")?, strategy, min_score)
                    .await
            }
            "conflicts" => self.conflicts(&required_str(args, "evo_id")?).await,
            "vault_set" => {
                self.vault_set(&required_str(args, "key")?, &required_str(args, "value")?)
                    .await
            }
            "vault_get" => self.vault_get(&required_str(args, "key")?).await,
            "vault_delete" => self.vault_delete(&required_str(args, "key")?).await,
            "vault_list" => self.vault_list().await,
            "use_teambook" => self.use_teambook(&required_str(args, "name")?).await,
            "list_teambooks" => self.list_teambooks().await,
            "detangle_open" => {
                self.detangle_open(
                    &AiId::new(required_str(args, "with")?),
                    &required_str(args, "description")?,
                )
                .await
            }
            "detangle_resolve" => {
                self.detangle_resolve(
                    arg_int(args, "room_id").ok_or_else(|| {
                        TeambookError::new(ErrorCode::InvalidItem, "missing room_id")
                    })?,
                    &required_str(args, "summary")?,
                )
                .await
            }
            "get_status" => self.get_status().await,
            "maintenance" => self.maintenance().await,
            other => Err(TeambookError::new(
                ErrorCode::UnknownError,
                format!("unknown verb '{}'", other),
            )),
        }
    }
}

fn parse_item_type(raw: &str) -> TeambookResult<ItemType> {
    ItemType::from_str(raw).map_err(|e| TeambookError::new(ErrorCode::InvalidItem, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_kernel;
    use serde_json::json;

    #[tokio::test]
    async fn test_execute_write_and_read() {
        let (_dir, kernel) = test_kernel().await;
        let written = kernel
            .execute("write_note", &json!({"content": "via dispatch"}))
            .await;
        assert!(written.success, "{:?}", written);

        let read = kernel.execute("read_notes", &json!({"limit": "5"})).await;
        assert!(read.success);
        let notes = read.data.unwrap()["notes"].as_array().unwrap().clone();
        assert_eq!(notes.len(), 1);
    }

    #[tokio::test]
    async fn test_execute_none_strings_treated_absent() {
        let (_dir, kernel) = test_kernel().await;
        let resp = kernel
            .execute(
                "write_note",
                &json!({"content": "x", "summary": "None", "type": "null"}),
            )
            .await;
        assert!(resp.success);
        let read = kernel.execute("read_notes", &json!({})).await;
        let notes = read.data.unwrap()["notes"].as_array().unwrap().clone();
        assert!(notes[0]["summary"].is_null());
        assert_eq!(notes[0]["type"], "general");
    }

    #[tokio::test]
    async fn test_execute_unknown_verb() {
        let (_dir, kernel) = test_kernel().await;
        let resp = kernel.execute("explode", &json!({})).await;
        assert!(!resp.success);
        assert_eq!(resp.error.as_deref(), Some("unknown_error"));
    }

    #[tokio::test]
    async fn test_execute_missing_argument() {
        let (_dir, kernel) = test_kernel().await;
        let resp = kernel.execute("write_note", &json!({})).await;
        assert!(!resp.success);
        assert_eq!(resp.error.as_deref(), Some("invalid_item"));
    }

    #[tokio::test]
    async fn test_verb_list_dispatches() {
        // Every advertised verb is wired; missing-arg errors are fine,
        // "unknown verb" is not.
        let (_dir, kernel) = test_kernel().await;
        for verb in KERNEL_VERBS {
            let resp = kernel.execute(verb, &json!({})).await;
            if !resp.success {
                assert_ne!(
                    resp.message,
                    format!("unknown verb '{}'", verb),
                    "verb {} not wired",
                    verb
                );
            }
        }
    }
}
