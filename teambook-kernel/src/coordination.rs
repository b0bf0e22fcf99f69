//! Distributed locks, the priority task queue, and detangle coordination.

use crate::validate::{clamp_text, clean_text};
use crate::{Kernel, KernelResponse};
use chrono::Utc;
use serde_json::{json, Value as JsonValue};
use teambook_core::*;
use teambook_events::DomainEvent;
use teambook_storage::{
    CompleteOutcome, NewCoordinationEvent, NewTask, ReleaseOutcome, StorageBackend,
};

impl Kernel {
    // ------------------------------------------------------------------
    // Locks
    // ------------------------------------------------------------------

    /// Acquire a distributed lock. Succeeds only when the resource row is
    /// absent or expired; atomicity is the backend's contract.
    pub async fn acquire_lock(
        &self,
        resource_id: &str,
        timeout_secs: i64,
    ) -> TeambookResult<KernelResponse> {
        let teambook = self.current_teambook();
        let resource = clean_text(resource_id);
        if resource.is_empty() {
            return Err(TeambookError::new(ErrorCode::InvalidItem, "empty resource id"));
        }

        self.store.sweep_expired_locks(&teambook).await?;
        let held = self.store.locks_held_by(&teambook, self.ai_id()).await?;
        if held >= MAX_LOCKS_PER_AI as u64 {
            return Err(TeambookError::new(
                ErrorCode::LockLimit,
                format!("max {} concurrent locks per AI", MAX_LOCKS_PER_AI),
            ));
        }

        let ttl = timeout_secs.clamp(1, LOCK_TIMEOUT_MAX_SECS);
        match self
            .store
            .try_acquire_lock(&teambook, &resource, self.ai_id(), ttl)
            .await?
        {
            LockAttempt::Acquired(lock) => {
                self.publish_event(DomainEvent::LockAcquired {
                    resource_id: resource.clone(),
                    held_by: self.ai_id().clone(),
                    expires_at: lock.expires_at,
                })
                .await;
                self.emit(ItemType::Lock, &resource, "acquired", None, None).await;
                Ok(KernelResponse::ok(
                    format!("locked {}", resource),
                    json!({
                        "resource_id": resource,
                        "expires_at": lock.expires_at.to_rfc3339(),
                        "timeout": ttl,
                    }),
                ))
            }
            LockAttempt::Held { held_by, expires_at } => Err(TeambookError::new(
                ErrorCode::NotYourLock,
                format!("locked_by:{}", held_by),
            )
            .with_details(json!({
                "held_by": held_by,
                "expires_at": expires_at.to_rfc3339(),
            }))),
        }
    }

    pub async fn release_lock(&self, resource_id: &str) -> TeambookResult<KernelResponse> {
        let teambook = self.current_teambook();
        match self
            .store
            .release_lock(&teambook, resource_id, self.ai_id())
            .await?
        {
            ReleaseOutcome::Released => {
                self.publish_event(DomainEvent::LockReleased {
                    resource_id: resource_id.to_string(),
                    released_by: self.ai_id().clone(),
                })
                .await;
                self.emit(ItemType::Lock, resource_id, "released", None, None).await;
                Ok(KernelResponse::ok(
                    format!("released {}", resource_id),
                    json!({"resource_id": resource_id}),
                ))
            }
            ReleaseOutcome::NotLocked => Err(TeambookError::new(
                ErrorCode::NotLocked,
                format!("{} is not locked", resource_id),
            )),
            ReleaseOutcome::NotHolder { held_by } => Err(TeambookError::new(
                ErrorCode::NotYourLock,
                format!("locked_by:{}", held_by),
            )),
        }
    }

    /// Raise the holder's expiry, clamped to five minutes from now.
    pub async fn extend_lock(
        &self,
        resource_id: &str,
        additional_secs: i64,
    ) -> TeambookResult<KernelResponse> {
        let teambook = self.current_teambook();
        let now = Utc::now();
        let ceiling = now + chrono::Duration::seconds(LOCK_EXTEND_MAX_SECS);
        let requested = now + chrono::Duration::seconds(additional_secs.max(1));
        let new_expiry = requested.min(ceiling);

        match self
            .store
            .extend_lock(&teambook, resource_id, self.ai_id(), new_expiry)
            .await?
        {
            Some(lock) => Ok(KernelResponse::ok(
                format!("extended {}", resource_id),
                json!({
                    "resource_id": resource_id,
                    "expires_at": lock.expires_at.to_rfc3339(),
                }),
            )),
            None => Err(TeambookError::new(
                ErrorCode::NotYourLock,
                format!("{} is not held by this AI", resource_id),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Task queue
    // ------------------------------------------------------------------

    pub async fn queue_task(
        &self,
        task: &str,
        priority: u8,
        metadata: Option<JsonValue>,
    ) -> TeambookResult<KernelResponse> {
        let teambook = self.current_teambook();
        let cleaned = clean_text(task);
        if cleaned.is_empty() {
            return Err(TeambookError::new(ErrorCode::EmptyMessage, "task text is empty"));
        }
        let (text, truncated) = clamp_text(&cleaned, MAX_TASK_CHARS);
        if priority > 9 {
            return Err(TeambookError::new(
                ErrorCode::InvalidScore,
                "priority must be 0-9",
            ));
        }
        let pending = self.store.pending_task_count(&teambook).await?;
        if pending >= MAX_QUEUE_SIZE as u64 {
            return Err(TeambookError::new(
                ErrorCode::QueueFull,
                format!("queue capped at {} pending tasks", MAX_QUEUE_SIZE),
            ));
        }

        let metadata = metadata.unwrap_or_else(|| json!({}));
        let now = Utc::now();
        let draft = Task {
            id: TaskId::new(0),
            task: text.clone(),
            priority,
            status: TaskStatus::Pending,
            author: self.ai_id().clone(),
            claimed_by: None,
            created: now,
            claimed_at: None,
            completed_at: None,
            result: None,
            teambook: teambook.clone(),
            metadata: metadata.clone(),
            tamper_hash: String::new(),
        };
        let task_id = self
            .store
            .insert_task(NewTask {
                task: text,
                priority,
                author: self.ai_id().clone(),
                created: now,
                teambook,
                metadata,
                tamper_hash: draft.compute_tamper_hash(),
            })
            .await?;

        self.publish_event(DomainEvent::TaskQueued {
            task_id,
            priority,
            author: self.ai_id().clone(),
        })
        .await;
        self.emit(ItemType::Task, &task_id.to_string(), "queued", None, None)
            .await;

        let mut data = json!({"task_id": task_id, "priority": priority});
        if truncated {
            data["warning"] = json!("task text truncated at 2000 chars");
        }
        Ok(KernelResponse::ok(format!("task {}", task_id), data))
    }

    /// Claim the best pending task. Returns success with empty data when
    /// the queue has nothing claimable.
    pub async fn claim_task(&self, prefer_priority: bool) -> TeambookResult<KernelResponse> {
        let teambook = self.current_teambook();
        let claimed = self
            .store
            .claim_next_task(&teambook, self.ai_id(), prefer_priority, Utc::now())
            .await?;
        match claimed {
            Some(task) => {
                self.publish_event(DomainEvent::TaskClaimed {
                    task_id: task.id,
                    claimed_by: self.ai_id().clone(),
                })
                .await;
                self.emit(ItemType::Task, &task.id.to_string(), "claimed", None, None)
                    .await;
                Ok(KernelResponse::ok(
                    format!("task {}", task.id),
                    json!({
                        "task_id": task.id,
                        "task": task.task,
                        "priority": task.priority,
                    }),
                ))
            }
            None => Ok(KernelResponse::ok("queue empty", json!({}))),
        }
    }

    pub async fn complete_task(
        &self,
        raw_id: &str,
        result: Option<String>,
    ) -> TeambookResult<KernelResponse> {
        let teambook = self.current_teambook();
        let id = TaskId::new(self.resolve_note_ref(raw_id)?.as_i64());
        match self
            .store
            .complete_task(&teambook, id, self.ai_id(), result, Utc::now())
            .await?
        {
            CompleteOutcome::Completed(task) => {
                self.publish_event(DomainEvent::TaskCompleted {
                    task_id: task.id,
                    completed_by: self.ai_id().clone(),
                })
                .await;
                self.emit(ItemType::Task, &task.id.to_string(), "completed", None, None)
                    .await;
                Ok(KernelResponse::ok(
                    format!("task {} completed", task.id),
                    json!({"task_id": task.id, "result": task.result}),
                ))
            }
            CompleteOutcome::NotFound => Err(TeambookError::new(
                ErrorCode::TaskNotFound,
                format!("task {} not found", id),
            )),
            CompleteOutcome::NotClaimer => Err(TeambookError::new(
                ErrorCode::NotYourTask,
                format!("task {} is claimed by another AI", id),
            )),
            CompleteOutcome::AlreadyCompleted => Err(TeambookError::new(
                ErrorCode::AlreadyCompleted,
                format!("task {} already completed", id),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Detangle (conflict-resolution coordination events)
    // ------------------------------------------------------------------

    /// Open a detangle conversation with another AI over a conflict.
    /// Modeled as a coordination event stream rather than dedicated rooms.
    pub async fn detangle_open(
        &self,
        other_ai: &AiId,
        description: &str,
    ) -> TeambookResult<KernelResponse> {
        if other_ai == self.ai_id() {
            return Err(TeambookError::new(
                ErrorCode::InvalidRecipient,
                "cannot detangle with yourself",
            ));
        }
        let teambook = self.current_teambook();
        let id = self
            .store
            .insert_coordination_event(NewCoordinationEvent {
                event_type: "detangle_initiated".to_string(),
                ai_id: self.ai_id().clone(),
                task_id: None,
                summary: Some(clean_text(description)),
                created: Utc::now(),
                metadata: Some(json!({"with": other_ai})),
                teambook,
            })
            .await?;
        Ok(KernelResponse::ok(
            "detangle opened",
            json!({"room_id": id, "with": other_ai}),
        ))
    }

    pub async fn detangle_resolve(
        &self,
        room_id: i64,
        summary: &str,
    ) -> TeambookResult<KernelResponse> {
        let teambook = self.current_teambook();
        let id = self
            .store
            .insert_coordination_event(NewCoordinationEvent {
                event_type: "detangle_resolved".to_string(),
                ai_id: self.ai_id().clone(),
                task_id: None,
                summary: Some(clean_text(summary)),
                created: Utc::now(),
                metadata: Some(json!({"room_id": room_id})),
                teambook,
            })
            .await?;
        Ok(KernelResponse::ok(
            "detangle resolved",
            json!({"room_id": room_id, "event_id": id}),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_kernel;

    #[tokio::test]
    async fn test_lock_contention_and_timeout_clamp() {
        let (_dir, kernel) = test_kernel().await;
        let acquired = kernel.acquire_lock("auth.rs", 500).await.expect("acquire");
        let data = acquired.data.unwrap();
        // timeout > 300 clamps to 300.
        assert_eq!(data["timeout"], LOCK_TIMEOUT_MAX_SECS);

        // Same holder re-acquires fine; release then re-acquire works too.
        kernel.acquire_lock("auth.rs", 30).await.expect("reentrant");
        kernel.release_lock("auth.rs").await.expect("release");
        kernel.acquire_lock("auth.rs", 30).await.expect("reacquire");
    }

    #[tokio::test]
    async fn test_release_unheld_lock() {
        let (_dir, kernel) = test_kernel().await;
        let err = kernel.release_lock("ghost").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NotLocked);
    }

    #[tokio::test]
    async fn test_lock_limit_enforced() {
        let (_dir, kernel) = test_kernel().await;
        for i in 0..MAX_LOCKS_PER_AI {
            kernel
                .acquire_lock(&format!("res-{}", i), 60)
                .await
                .expect("under cap");
        }
        let err = kernel.acquire_lock("one-more", 60).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::LockLimit);
    }

    #[tokio::test]
    async fn test_extend_clamped_to_five_minutes() {
        let (_dir, kernel) = test_kernel().await;
        kernel.acquire_lock("res", 30).await.expect("acquire");
        let extended = kernel.extend_lock("res", 86_400).await.expect("extend");
        let expires = extended.data.unwrap()["expires_at"].as_str().unwrap().to_string();
        let expires = chrono::DateTime::parse_from_rfc3339(&expires).unwrap();
        let secs = (expires.with_timezone(&Utc) - Utc::now()).num_seconds();
        assert!(secs <= LOCK_EXTEND_MAX_SECS + 2);
    }

    #[tokio::test]
    async fn test_queue_claim_complete_lifecycle() {
        let (_dir, kernel) = test_kernel().await;
        let queued = kernel
            .queue_task("ship docs", 7, None)
            .await
            .expect("queue");
        let task_id = queued.data.unwrap()["task_id"].as_i64().unwrap();

        let claimed = kernel.claim_task(true).await.expect("claim");
        assert_eq!(claimed.data.unwrap()["task_id"].as_i64().unwrap(), task_id);

        // Second claim returns the empty-queue result, not an error.
        let empty = kernel.claim_task(true).await.expect("claim");
        assert!(empty.data.unwrap().as_object().unwrap().is_empty());

        kernel
            .complete_task(&task_id.to_string(), Some("done".to_string()))
            .await
            .expect("complete");
        let repeat = kernel
            .complete_task(&task_id.to_string(), None)
            .await
            .unwrap_err();
        assert_eq!(repeat.code, ErrorCode::AlreadyCompleted);
    }

    #[tokio::test]
    async fn test_priority_order_preferred() {
        let (_dir, kernel) = test_kernel().await;
        kernel.queue_task("low", 2, None).await.expect("queue");
        let high = kernel.queue_task("high", 9, None).await.expect("queue");
        let high_id = high.data.unwrap()["task_id"].as_i64().unwrap();

        let claimed = kernel.claim_task(true).await.expect("claim");
        assert_eq!(claimed.data.unwrap()["task_id"].as_i64().unwrap(), high_id);
    }

    #[tokio::test]
    async fn test_invalid_priority_rejected() {
        let (_dir, kernel) = test_kernel().await;
        let err = kernel.queue_task("task", 10, None).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidScore);
    }

    #[tokio::test]
    async fn test_detangle_event_stream() {
        let (_dir, kernel) = test_kernel().await;
        let opened = kernel
            .detangle_open(&AiId::from("beta-002"), "both editing auth.rs")
            .await
            .expect("open");
        let room_id = opened.data.unwrap()["room_id"].as_i64().unwrap();
        kernel
            .detangle_resolve(room_id, "beta takes auth.rs")
            .await
            .expect("resolve");

        let teambook = kernel.current_teambook();
        let events = kernel
            .store
            .coordination_events(&teambook, Utc::now() - chrono::Duration::hours(1), 10)
            .await
            .expect("events");
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert!(types.contains(&"detangle_initiated"));
        assert!(types.contains(&"detangle_resolved"));
    }
}
