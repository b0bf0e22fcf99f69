//! Evolution workflow: idea submission, ranking, voting, synthesis.

use crate::notes::WriteNoteArgs;
use crate::validate::clean_text;
use crate::{Kernel, KernelResponse};
use chrono::Utc;
use serde_json::{json, Value as JsonValue};
use teambook_core::*;
use teambook_events::DomainEvent;
use teambook_storage::{NewContribution, NewSynthesis, StorageBackend};

impl Kernel {
    /// Start an evolution: a note of type `evolution` whose content is the
    /// goal. `output` names the synthesis artifact file.
    pub async fn evolve(&self, goal: &str, output: Option<String>) -> TeambookResult<KernelResponse> {
        let teambook = self.current_teambook();
        let existing = self
            .store
            .read_notes(&NoteFilter {
                teambook: teambook.clone(),
                note_type: Some("evolution".to_string()),
                limit: MAX_EVOLUTIONS_PER_TEAMBOOK + 1,
                ..Default::default()
            })
            .await?;
        if existing.len() >= MAX_EVOLUTIONS_PER_TEAMBOOK {
            return Err(TeambookError::new(
                ErrorCode::SynthesisLimit,
                format!("max {} evolutions per teambook", MAX_EVOLUTIONS_PER_TEAMBOOK),
            ));
        }

        let output = output.unwrap_or_else(|| "synthesis.md".to_string());
        let goal = clean_text(goal);
        let written = self
            .write_note(WriteNoteArgs {
                content: goal.clone(),
                note_type: Some("evolution".to_string()),
                metadata: Some(json!({"output": output})),
                ..Default::default()
            })
            .await?;
        let evo_id = written.data.as_ref().and_then(|d| d["note_id"].as_i64()).unwrap_or(0);

        self.publish_event(DomainEvent::EvolutionStarted {
            evo_id: NoteId::new(evo_id),
            author: self.ai_id().clone(),
            goal_summary: Some(crate::validate::simple_summary(&goal, 80)),
        })
        .await;
        self.emit(
            ItemType::Evolution,
            &evo_id.to_string(),
            "started",
            Some(&goal),
            None,
        )
        .await;
        Ok(KernelResponse::ok(
            format!("evolution {}", evo_id),
            json!({"evo_id": evo_id, "output": output}),
        ))
    }

    pub async fn contribute(
        &self,
        raw_evo: &str,
        content: &str,
        approach: Option<String>,
    ) -> TeambookResult<KernelResponse> {
        let teambook = self.current_teambook();
        let evo_id = self.resolve_evolution(&teambook, raw_evo).await?;

        let content = clean_text(content);
        if content.is_empty() {
            return Err(TeambookError::new(ErrorCode::EmptyMessage, "empty contribution"));
        }
        if content.len() > MAX_CONTRIBUTION_BYTES {
            return Err(TeambookError::new(
                ErrorCode::ContentTooLong,
                format!("contributions capped at {} bytes", MAX_CONTRIBUTION_BYTES),
            ));
        }
        let mine = self
            .store
            .count_contributions_by(&teambook, evo_id, self.ai_id())
            .await?;
        if mine >= MAX_CONTRIBUTIONS_PER_AI as u64 {
            return Err(TeambookError::new(
                ErrorCode::HookLimit,
                format!("max {} contributions per AI per evolution", MAX_CONTRIBUTIONS_PER_AI),
            ));
        }

        let contrib_id = self
            .store
            .insert_contribution(
                &teambook,
                NewContribution {
                    evolution_id: evo_id,
                    author: self.ai_id().clone(),
                    content,
                    approach,
                    created: Utc::now(),
                },
            )
            .await?;

        self.publish_event(DomainEvent::ContributionAdded {
            evo_id,
            contrib_id,
            author: self.ai_id().clone(),
        })
        .await;
        self.emit(
            ItemType::Evolution,
            &evo_id.to_string(),
            "contribution",
            None,
            None,
        )
        .await;
        Ok(KernelResponse::ok(
            format!("contribution {}", contrib_id),
            json!({"contrib_id": contrib_id, "evo_id": evo_id}),
        ))
    }

    pub async fn contributions(&self, raw_evo: &str) -> TeambookResult<KernelResponse> {
        let teambook = self.current_teambook();
        let evo_id = self.resolve_evolution(&teambook, raw_evo).await?;
        let contributions = self.store.contributions_for(&teambook, evo_id).await?;
        let rendered: Vec<JsonValue> = contributions
            .iter()
            .map(|c| {
                json!({
                    "contrib_id": c.id,
                    "author": c.author,
                    "approach": c.approach,
                    "avg_score": c.avg_score,
                    "rank_count": c.rank_count,
                    "content": c.content,
                })
            })
            .collect();
        Ok(KernelResponse::ok(
            format!("{} contributions", rendered.len()),
            json!({"evo_id": evo_id, "contributions": rendered}),
        ))
    }

    /// Score a contribution 0-10; one score per ranker, last write wins.
    pub async fn rank(
        &self,
        contrib_id: i64,
        score: f64,
        reason: Option<String>,
    ) -> TeambookResult<KernelResponse> {
        if !(0.0..=10.0).contains(&score) {
            return Err(TeambookError::new(
                ErrorCode::InvalidScore,
                "score must be between 0 and 10",
            ));
        }
        let teambook = self.current_teambook();
        let contrib = ContributionId::new(contrib_id);
        if self.store.get_contribution(&teambook, contrib).await?.is_none() {
            return Err(TeambookError::new(
                ErrorCode::InvalidItem,
                format!("contribution {} not found", contrib_id),
            ));
        }
        let (avg, count) = self
            .store
            .upsert_ranking(
                &teambook,
                &Ranking {
                    contribution_id: contrib,
                    ranked_by: self.ai_id().clone(),
                    score,
                    reason,
                    created: Utc::now(),
                },
            )
            .await?;
        Ok(KernelResponse::ok(
            "ranked",
            json!({"contrib_id": contrib_id, "avg_score": avg, "rank_count": count}),
        ))
    }

    /// Store ranked preferences; a voter may revise at most five times.
    pub async fn vote(
        &self,
        raw_evo: &str,
        preferred: Vec<i64>,
    ) -> TeambookResult<KernelResponse> {
        let teambook = self.current_teambook();
        let evo_id = self.resolve_evolution(&teambook, raw_evo).await?;
        let existing = self.store.get_vote(&teambook, evo_id, self.ai_id()).await?;
        let change_count = match &existing {
            Some(vote) if vote.change_count >= MAX_VOTE_CHANGES => {
                return Err(TeambookError::new(
                    ErrorCode::RateLimit,
                    format!("vote changed {} times already", MAX_VOTE_CHANGES),
                ));
            }
            Some(vote) => vote.change_count + 1,
            None => 0,
        };
        self.store
            .upsert_vote(
                &teambook,
                &Vote {
                    evolution_id: evo_id,
                    voter: self.ai_id().clone(),
                    preferred: preferred.iter().map(|id| ContributionId::new(*id)).collect(),
                    change_count,
                    updated: Utc::now(),
                },
            )
            .await?;
        Ok(KernelResponse::ok(
            "vote recorded",
            json!({"evo_id": evo_id, "changes_used": change_count}),
        ))
    }

    /// Combine contributions into the output artifact, per strategy.
    pub async fn synthesize(
        &self,
        raw_evo: &str,
        strategy: SynthesisStrategy,
        min_score: f64,
    ) -> TeambookResult<KernelResponse> {
        let teambook = self.current_teambook();
        let evo_id = self.resolve_evolution(&teambook, raw_evo).await?;

        let recent = self
            .store
            .synthesis_count_since(&teambook, Utc::now() - chrono::Duration::hours(1))
            .await?;
        if recent >= MAX_SYNTHESIS_PER_HOUR as u64 {
            return Err(TeambookError::new(
                ErrorCode::SynthesisLimit,
                format!("max {} syntheses per hour", MAX_SYNTHESIS_PER_HOUR),
            ));
        }

        let evolution = self
            .store
            .get_note(&teambook, evo_id)
            .await?
            .ok_or_else(|| TeambookError::new(ErrorCode::EvolutionNotFound, "evolution missing"))?;
        let goal = self.codec.decode(&evolution.content);
        let filename = evolution.metadata["output"]
            .as_str()
            .unwrap_or("synthesis.md")
            .to_string();

        let all = self.store.contributions_for(&teambook, evo_id).await?;
        let selected: Vec<&Contribution> = match strategy {
            SynthesisStrategy::Top => all
                .iter()
                .filter(|c| c.avg_score >= min_score)
                .take(SYNTHESIS_TOP_LIMIT)
                .collect(),
            SynthesisStrategy::Consensus => all
                .iter()
                .filter(|c| c.avg_score >= SYNTHESIS_CONSENSUS_SCORE)
                .collect(),
            SynthesisStrategy::All => all.iter().collect(),
        };

        // Deterministic document: selection order is the stored ranking
        // order, so repeated runs produce identical bytes.
        let mut document = format!("# Synthesis: {}\n\n", goal);
        document.push_str(&format!(
            "Strategy: {} | Contributions: {}\n\n",
            strategy,
            selected.len()
        ));
        for contribution in &selected {
            document.push_str(&format!(
                "## {} (score {:.1}, {} ranks)\n\n{}\n\n",
                contribution.author, contribution.avg_score, contribution.rank_count,
                contribution.content
            ));
        }

        let outputs = self.config().outputs_dir(&teambook);
        std::fs::create_dir_all(&outputs)
            .map_err(|e| TeambookError::database(e.to_string()))?;
        let path = outputs.join(&filename);
        std::fs::write(&path, document)
            .map_err(|e| TeambookError::database(e.to_string()))?;
        let output_path = path.to_string_lossy().to_string();

        self.store
            .insert_synthesis(NewSynthesis {
                evolution_id: evo_id,
                strategy,
                output_path: output_path.clone(),
                contribution_count: selected.len() as i64,
                author: self.ai_id().clone(),
                created: Utc::now(),
                teambook: teambook.clone(),
            })
            .await?;

        self.publish_event(DomainEvent::SynthesisWritten {
            evo_id,
            output_path: output_path.clone(),
            author: self.ai_id().clone(),
        })
        .await;
        self.emit(
            ItemType::Evolution,
            &evo_id.to_string(),
            "synthesized",
            Some(&filename),
            None,
        )
        .await;
        Ok(KernelResponse::ok(
            format!("synthesized {} contributions", selected.len()),
            json!({
                "evo_id": evo_id,
                "output": output_path,
                "strategy": strategy,
                "included": selected.len(),
            }),
        ))
    }

    /// Pairwise conflict detection over known opposing keyword pairs.
    pub async fn conflicts(&self, raw_evo: &str) -> TeambookResult<KernelResponse> {
        let teambook = self.current_teambook();
        let evo_id = self.resolve_evolution(&teambook, raw_evo).await?;
        let all = self.store.contributions_for(&teambook, evo_id).await?;

        let mut found = Vec::new();
        for (i, a) in all.iter().enumerate() {
            for b in all.iter().skip(i + 1) {
                let lower_a = a.content.to_lowercase();
                let lower_b = b.content.to_lowercase();
                for (left, right) in CONFLICT_KEYWORD_PAIRS {
                    let opposed = (lower_a.contains(left) && lower_b.contains(right))
                        || (lower_a.contains(right) && lower_b.contains(left));
                    if opposed {
                        found.push(ContributionConflict {
                            evolution_id: evo_id,
                            contribution_a: a.id,
                            contribution_b: b.id,
                            topic: format!("{}/{}", left, right),
                            detected: Utc::now(),
                        });
                    }
                }
            }
        }
        if !found.is_empty() {
            self.store.insert_conflicts(&teambook, &found).await?;
        }
        let rendered: Vec<JsonValue> = found
            .iter()
            .map(|c| {
                json!({
                    "contribution_a": c.contribution_a,
                    "contribution_b": c.contribution_b,
                    "topic": c.topic,
                })
            })
            .collect();
        Ok(KernelResponse::ok(
            format!("{} conflicts", rendered.len()),
            json!({"evo_id": evo_id, "conflicts": rendered}),
        ))
    }

    async fn resolve_evolution(&self, teambook: &str, raw: &str) -> TeambookResult<NoteId> {
        let id = self.resolve_note_ref(raw)?;
        let note = self.store.get_note(teambook, id).await?;
        match note {
            Some(note) if note.note_type == "evolution" => Ok(id),
            _ => Err(TeambookError::new(
                ErrorCode::EvolutionNotFound,
                format!("evolution {} not found", raw),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_kernel;

    async fn start_evo(kernel: &Kernel) -> i64 {
        kernel
            .evolve("pick auth lib", Some("auth.md".to_string()))
            .await
            .expect("evolve")
            .data
            .unwrap()["evo_id"]
            .as_i64()
            .unwrap()
    }

    #[tokio::test]
    async fn test_synthesize_top_filters_by_score() {
        let (_dir, kernel) = test_kernel().await;
        let evo = start_evo(&kernel).await;

        let jwt = kernel
            .contribute(&evo.to_string(), "use JWT", None)
            .await
            .expect("contribute")
            .data
            .unwrap()["contrib_id"]
            .as_i64()
            .unwrap();
        let oauth = kernel
            .contribute(&evo.to_string(), "use OAuth", None)
            .await
            .expect("contribute")
            .data
            .unwrap()["contrib_id"]
            .as_i64()
            .unwrap();

        kernel.rank(jwt, 8.0, None).await.expect("rank");
        kernel.rank(oauth, 6.0, None).await.expect("rank");

        let result = kernel
            .synthesize(&evo.to_string(), SynthesisStrategy::Top, 7.0)
            .await
            .expect("synthesize");
        let data = result.data.unwrap();
        assert_eq!(data["included"], 1);

        let document = std::fs::read_to_string(data["output"].as_str().unwrap()).expect("artifact");
        assert!(document.contains("use JWT"));
        assert!(!document.contains("use OAuth"));
    }

    #[tokio::test]
    async fn test_rank_bounds() {
        let (_dir, kernel) = test_kernel().await;
        let evo = start_evo(&kernel).await;
        let contrib = kernel
            .contribute(&evo.to_string(), "idea", None)
            .await
            .expect("contribute")
            .data
            .unwrap()["contrib_id"]
            .as_i64()
            .unwrap();
        assert_eq!(
            kernel.rank(contrib, 11.0, None).await.unwrap_err().code,
            ErrorCode::InvalidScore
        );
        assert_eq!(
            kernel.rank(contrib, -0.5, None).await.unwrap_err().code,
            ErrorCode::InvalidScore
        );
    }

    #[tokio::test]
    async fn test_vote_change_cap() {
        let (_dir, kernel) = test_kernel().await;
        let evo = start_evo(&kernel).await;
        let evo_ref = evo.to_string();
        kernel.vote(&evo_ref, vec![1]).await.expect("initial vote");
        for _ in 0..MAX_VOTE_CHANGES {
            kernel.vote(&evo_ref, vec![1]).await.expect("revision");
        }
        assert_eq!(
            kernel.vote(&evo_ref, vec![2]).await.unwrap_err().code,
            ErrorCode::RateLimit
        );
    }

    #[tokio::test]
    async fn test_contribution_cap_per_ai() {
        let (_dir, kernel) = test_kernel().await;
        let evo = start_evo(&kernel).await;
        for i in 0..MAX_CONTRIBUTIONS_PER_AI {
            kernel
                .contribute(&evo.to_string(), &format!("idea {}", i), None)
                .await
                .expect("under cap");
        }
        let err = kernel
            .contribute(&evo.to_string(), "one too many", None)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::HookLimit);
    }

    #[tokio::test]
    async fn test_conflict_detection_keyword_pairs() {
        let (_dir, kernel) = test_kernel().await;
        let evo = start_evo(&kernel).await;
        kernel
            .contribute(&evo.to_string(), "go async everywhere", None)
            .await
            .expect("contribute");
        kernel
            .contribute(&evo.to_string(), "keep the sync design", None)
            .await
            .expect("contribute");

        let conflicts = kernel.conflicts(&evo.to_string()).await.expect("conflicts");
        let found = conflicts.data.unwrap()["conflicts"].as_array().unwrap().clone();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["topic"], "async/sync");
    }

    #[tokio::test]
    async fn test_contribute_to_plain_note_rejected() {
        let (_dir, kernel) = test_kernel().await;
        let written = kernel
            .write_note(crate::notes::WriteNoteArgs {
                content: "not an evolution".to_string(),
                ..Default::default()
            })
            .await
            .expect("write");
        let note_id = written.data.unwrap()["note_id"].as_i64().unwrap();
        let err = kernel
            .contribute(&note_id.to_string(), "idea", None)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::EvolutionNotFound);
    }
}
