//! Bounded evaluate→revise loop that decides whether a draft is good enough
//! to auto-send.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use outreach_llm::provider::ReasoningEffort;

use super::artifact::{Stage, write_artifact};
use super::context::{ChunkCache, build_query, cache_key, select_chunks};
use super::evaluation::{DraftEvaluator, Evaluation};
use super::stages::{DraftCandidate, PromptStages, RunContext, StageError};
use super::store::PipelineStore;
use crate::clock::Clock;
use crate::config::OutreachCfg;
use crate::types::{ContextChunk, LoopStopReason, RevisionLoopSummary};

/// Rewrites a draft using evaluator feedback and grounding chunks.
#[async_trait]
pub trait DraftReviser: Send + Sync {
    async fn revise(
        &self,
        ctx: &RunContext,
        draft: &str,
        evaluation: &Evaluation,
        chunks: &[ContextChunk],
    ) -> Result<String, StageError>;
}

const REVISE_PROMPT: &str = "You improve sales replies that a reviewer was not confident enough to \
send. Address the reviewer's concern using only facts from the context. Keep the reply short and in \
the same voice. Respond with JSON only: {\"content\": string}.";

#[async_trait]
impl DraftReviser for PromptStages {
    async fn revise(
        &self,
        ctx: &RunContext,
        draft: &str,
        evaluation: &Evaluation,
        chunks: &[ContextChunk],
    ) -> Result<String, StageError> {
        let user = format!(
            "Lead message:\n{}\n\nContext:\n{}\n\nCurrent reply:\n{}\n\nReviewer confidence {:.2}: {}",
            ctx.message.body,
            RunContext::render_chunks(chunks),
            draft,
            evaluation.confidence,
            evaluation.reason
        );
        let revised: DraftCandidate = self.ask(REVISE_PROMPT, user, Some(ReasoningEffort::Medium)).await?;
        Ok(revised.content)
    }
}

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub threshold: f64,
    pub max_iterations: u32,
    pub time_budget: Duration,
    /// Minimum confidence gain for a revision to count as progress.
    pub epsilon: f64,
    /// Consecutive low-gain revisions tolerated before stopping.
    pub patience: u32,
    pub max_chunks: usize,
}

impl LoopSettings {
    pub fn from_cfg(cfg: &OutreachCfg) -> Self {
        Self {
            threshold: cfg.auto_send_threshold,
            max_iterations: cfg.revision_max_iterations,
            time_budget: Duration::from_millis(cfg.revision_time_budget_ms),
            epsilon: cfg.revision_epsilon,
            patience: cfg.revision_patience,
            max_chunks: cfg.max_context_chunks,
        }
    }
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self::from_cfg(&OutreachCfg::default())
    }
}

/// Final state of one loop.
#[derive(Debug)]
pub struct LoopOutcome {
    pub summary: RevisionLoopSummary,
    pub draft: String,
    pub evaluation: Evaluation,
    /// Set when the stop reason is `error`.
    pub failure: Option<StageError>,
}

/// Payload of each `auto_send_revision` artifact.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RevisionRecord<'a> {
    draft: &'a str,
    evaluation: &'a Evaluation,
    previous_confidence: f64,
    delta_confidence: f64,
    chunk_ids: Vec<&'a str>,
    cache_hit: bool,
}

struct Step {
    draft: String,
    evaluation: Evaluation,
    cache_hit: bool,
}

#[derive(Clone)]
pub struct RevisionLoop {
    evaluator: Arc<dyn DraftEvaluator>,
    reviser: Arc<dyn DraftReviser>,
    cache: Arc<dyn ChunkCache>,
    store: Arc<dyn PipelineStore>,
    clock: Arc<dyn Clock>,
    settings: LoopSettings,
}

impl RevisionLoop {
    pub fn new(
        evaluator: Arc<dyn DraftEvaluator>,
        reviser: Arc<dyn DraftReviser>,
        cache: Arc<dyn ChunkCache>,
        store: Arc<dyn PipelineStore>,
        clock: Arc<dyn Clock>,
        settings: LoopSettings,
    ) -> Self {
        Self { evaluator, reviser, cache, store, clock, settings }
    }

    pub fn settings(&self) -> &LoopSettings {
        &self.settings
    }

    fn elapsed(&self, started: chrono::DateTime<chrono::Utc>) -> Duration {
        (self.clock.now() - started).to_std().unwrap_or(Duration::ZERO)
    }

    /// Run the loop from the evaluation stage's verdict. Never fails: any
    /// error ends the loop with stop reason `error`, the state reached so far
    /// and the failure itself. Budgets are checked between iterations, never
    /// mid-call.
    pub async fn run(&self, ctx: &RunContext, draft: String, evaluation: Evaluation) -> LoopOutcome {
        let s = &self.settings;
        let started = self.clock.now();
        let start_confidence = evaluation.confidence;
        let mut draft = draft;
        let mut evaluation = evaluation;
        let mut iterations = 0u32;
        let mut cache_hits = 0u32;
        let mut low_gain = 0u32;
        let mut failure = None;

        let stop_reason = loop {
            if evaluation.hard_block {
                break LoopStopReason::HardBlock;
            }
            if evaluation.confidence >= s.threshold {
                break LoopStopReason::ThresholdMet;
            }
            if low_gain >= s.patience.max(1) {
                break LoopStopReason::NoImprovement;
            }
            if iterations >= s.max_iterations {
                break LoopStopReason::Exhausted;
            }
            if self.elapsed(started) > s.time_budget {
                break LoopStopReason::Timeout;
            }

            match self.iterate(ctx, iterations + 1, &draft, &evaluation).await {
                Ok(step) => {
                    iterations += 1;
                    cache_hits += u32::from(step.cache_hit);
                    let delta = step.evaluation.confidence - evaluation.confidence;
                    low_gain = if delta < s.epsilon { low_gain + 1 } else { 0 };
                    draft = step.draft;
                    evaluation = step.evaluation;
                }
                Err(e) => {
                    tracing::warn!(run_id = %ctx.run_id, iteration = iterations + 1, error = %e, "revision loop failed");
                    failure = Some(e);
                    break LoopStopReason::Error;
                }
            }
        };

        let summary = RevisionLoopSummary {
            stop_reason,
            iterations_used: iterations,
            threshold: s.threshold,
            start_confidence,
            end_confidence: evaluation.confidence,
            delta_confidence: evaluation.confidence - start_confidence,
            cache_hits,
            elapsed_ms: self.elapsed(started).as_millis() as u64,
            channel: ctx.message.channel,
            error: failure.as_ref().map(ToString::to_string),
        };
        self.record_summary(ctx, &summary).await;
        LoopOutcome { summary, draft, evaluation, failure }
    }

    async fn iterate(
        &self,
        ctx: &RunContext,
        iteration: u32,
        draft: &str,
        evaluation: &Evaluation,
    ) -> Result<Step, StageError> {
        let query = build_query(&ctx.message.body, draft);
        let key = cache_key(&ctx.message.id, &query, self.settings.max_chunks);
        let cached = match self.cache.get(&key).await {
            Ok(hit) => hit,
            Err(e) => {
                tracing::warn!(error = %e, "chunk cache read failed");
                None
            }
        };
        let cache_hit = cached.is_some();
        let chunks = match cached {
            Some(chunks) => chunks,
            None => {
                let chunks = select_chunks(&ctx.chunks, &query, self.settings.max_chunks);
                if let Err(e) = self.cache.put(&key, &chunks).await {
                    tracing::warn!(error = %e, "chunk cache write failed");
                }
                chunks
            }
        };

        let revised = self.reviser.revise(ctx, draft, evaluation, &chunks).await?;
        let verdict = self.evaluator.evaluate(ctx, &revised).await?;

        let record = RevisionRecord {
            draft: &revised,
            evaluation: &verdict,
            previous_confidence: evaluation.confidence,
            delta_confidence: verdict.confidence - evaluation.confidence,
            chunk_ids: chunks.iter().map(|c| c.id.as_str()).collect(),
            cache_hit,
        };
        write_artifact(
            self.store.as_ref(),
            ctx.run_id,
            Stage::AutoSendRevision,
            iteration as i32,
            &record,
            self.clock.now(),
        )
        .await?;
        tracing::debug!(
            run_id = %ctx.run_id,
            iteration,
            confidence = verdict.confidence,
            cache_hit,
            "revision iteration complete"
        );

        Ok(Step { draft: revised, evaluation: verdict, cache_hit })
    }

    async fn record_summary(&self, ctx: &RunContext, summary: &RevisionLoopSummary) {
        let now = self.clock.now();
        if let Err(e) = write_artifact(
            self.store.as_ref(),
            ctx.run_id,
            Stage::AutoSendLoopSummary,
            0,
            summary,
            now,
        )
        .await
        {
            tracing::warn!(run_id = %ctx.run_id, error = %e, "failed to write loop summary artifact");
        }
        if let Err(e) = self.store.record_loop_summary(ctx.run_id, summary, now).await {
            tracing::warn!(run_id = %ctx.run_id, error = %e, "failed to record loop summary");
        }
        tracing::info!(
            target: "outreach::auto_send",
            run_id = %ctx.run_id,
            message_id = %ctx.message.id,
            channel = %summary.channel,
            stop_reason = %summary.stop_reason,
            iterations_used = summary.iterations_used,
            threshold = summary.threshold,
            start_confidence = summary.start_confidence,
            end_confidence = summary.end_confidence,
            delta_confidence = summary.delta_confidence,
            cache_hits = summary.cache_hits,
            elapsed_ms = summary.elapsed_ms,
            "revision loop finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::pipeline::context::{InMemoryChunkCache, NoChunkCache};
    use crate::pipeline::store::InMemoryPipelineStore;
    use crate::types::{Channel, ChunkKind, InboundMessage};
    use outreach_llm::runner::{ErrorCategory, PromptError};
    use std::sync::Mutex;

    /// Evaluator returning scripted confidences in order.
    struct ScriptedEvaluator {
        verdicts: Mutex<Vec<Evaluation>>,
    }

    impl ScriptedEvaluator {
        fn confidences(values: &[f64]) -> Arc<Self> {
            let mut verdicts: Vec<Evaluation> = values
                .iter()
                .map(|c| Evaluation { confidence: *c, hard_block: false, reason: "scripted".into() })
                .collect();
            verdicts.reverse();
            Arc::new(Self { verdicts: Mutex::new(verdicts) })
        }

        fn from(mut verdicts: Vec<Evaluation>) -> Arc<Self> {
            verdicts.reverse();
            Arc::new(Self { verdicts: Mutex::new(verdicts) })
        }
    }

    #[async_trait]
    impl DraftEvaluator for ScriptedEvaluator {
        async fn evaluate(&self, _ctx: &RunContext, _draft: &str) -> Result<Evaluation, StageError> {
            self.verdicts
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| PromptError::new(ErrorCategory::Unknown, "script exhausted", false).into())
        }
    }

    /// Reviser that appends a marker and advances the clock per call.
    struct TickingReviser {
        clock: ManualClock,
        per_call: chrono::Duration,
        fixed: Option<String>,
        fail: bool,
    }

    #[async_trait]
    impl DraftReviser for TickingReviser {
        async fn revise(
            &self,
            _ctx: &RunContext,
            draft: &str,
            _evaluation: &Evaluation,
            _chunks: &[ContextChunk],
        ) -> Result<String, StageError> {
            self.clock.advance(self.per_call);
            if self.fail {
                return Err(PromptError::new(ErrorCategory::ApiError, "provider down", true).into());
            }
            Ok(self.fixed.clone().unwrap_or_else(|| format!("{draft}+")))
        }
    }

    struct Harness {
        store: Arc<InMemoryPipelineStore>,
        clock: ManualClock,
        ctx: RunContext,
    }

    impl Harness {
        fn new() -> Self {
            let clock = ManualClock::default();
            let ctx = RunContext {
                run_id: uuid::Uuid::new_v4(),
                message: InboundMessage {
                    id: "m1".into(),
                    workspace_id: "w1".into(),
                    lead_id: "l1".into(),
                    channel: Channel::Email,
                    body: "what does pricing look like".into(),
                    received_at: clock.now(),
                },
                chunks: vec![ContextChunk {
                    id: "c1".into(),
                    group: "kb".into(),
                    kind: ChunkKind::Detail,
                    text: "pricing starts at 49 per seat".into(),
                }],
            };
            Self { store: Arc::new(InMemoryPipelineStore::new()), clock, ctx }
        }

        fn reviser(&self, secs: i64) -> TickingReviser {
            TickingReviser { clock: self.clock.clone(), per_call: chrono::Duration::seconds(secs), fixed: None, fail: false }
        }

        fn looper(
            &self,
            evaluator: Arc<dyn DraftEvaluator>,
            reviser: TickingReviser,
            cache: Arc<dyn ChunkCache>,
            settings: LoopSettings,
        ) -> RevisionLoop {
            RevisionLoop::new(
                evaluator,
                Arc::new(reviser),
                cache,
                self.store.clone(),
                Arc::new(self.clock.clone()),
                settings,
            )
        }

        async fn revision_count(&self) -> usize {
            self.store
                .list_artifacts(self.ctx.run_id)
                .await
                .unwrap()
                .iter()
                .filter(|a| a.stage == "auto_send_revision")
                .count()
        }
    }

    fn start(confidence: f64) -> Evaluation {
        Evaluation { confidence, hard_block: false, reason: "initial".into() }
    }

    #[tokio::test]
    async fn threshold_met_without_revising() {
        let h = Harness::new();
        let lp = h.looper(ScriptedEvaluator::confidences(&[]), h.reviser(1), Arc::new(NoChunkCache), LoopSettings::default());
        let out = lp.run(&h.ctx, "draft".into(), start(0.92)).await;

        assert_eq!(out.summary.stop_reason, LoopStopReason::ThresholdMet);
        assert_eq!(out.summary.iterations_used, 0);
        assert_eq!(out.draft, "draft");
        assert_eq!(h.revision_count().await, 0);
        let summary = h.store.load_artifact(h.ctx.run_id, "auto_send_loop_summary", 0).await.unwrap().unwrap();
        assert_eq!(summary.payload["stopReason"], "threshold_met");
        assert!(h.store.loop_summary(h.ctx.run_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn small_gain_stops_with_no_improvement() {
        let h = Harness::new();
        let lp = h.looper(ScriptedEvaluator::confidences(&[0.42]), h.reviser(1), Arc::new(NoChunkCache), LoopSettings::default());
        let out = lp.run(&h.ctx, "draft".into(), start(0.40)).await;

        assert_eq!(out.summary.stop_reason, LoopStopReason::NoImprovement);
        assert_eq!(out.summary.iterations_used, 1);
        assert!((out.summary.delta_confidence - 0.02).abs() < 1e-9);
        assert_eq!(out.summary.end_confidence, 0.42);
        assert_eq!(h.revision_count().await, 1);
    }

    #[tokio::test]
    async fn patience_allows_consecutive_small_gains() {
        let h = Harness::new();
        let settings = LoopSettings { patience: 2, max_iterations: 5, ..LoopSettings::default() };
        let lp = h.looper(ScriptedEvaluator::confidences(&[0.42, 0.43]), h.reviser(1), Arc::new(NoChunkCache), settings);
        let out = lp.run(&h.ctx, "draft".into(), start(0.40)).await;

        assert_eq!(out.summary.stop_reason, LoopStopReason::NoImprovement);
        assert_eq!(out.summary.iterations_used, 2);
    }

    #[tokio::test]
    async fn time_budget_stops_before_iteration_budget() {
        let h = Harness::new();
        let settings = LoopSettings { max_iterations: 10, ..LoopSettings::default() };
        let lp = h.looper(
            ScriptedEvaluator::confidences(&[0.5, 0.6, 0.7]),
            h.reviser(40),
            Arc::new(NoChunkCache),
            settings,
        );
        let out = lp.run(&h.ctx, "draft".into(), start(0.3)).await;

        assert_eq!(out.summary.stop_reason, LoopStopReason::Timeout);
        assert_eq!(out.summary.iterations_used, 2);
        assert_eq!(out.summary.elapsed_ms, 80_000);
    }

    #[tokio::test]
    async fn iteration_budget_exhausts() {
        let h = Harness::new();
        let lp = h.looper(
            ScriptedEvaluator::confidences(&[0.4, 0.5, 0.6]),
            h.reviser(1),
            Arc::new(NoChunkCache),
            LoopSettings::default(),
        );
        let out = lp.run(&h.ctx, "d".into(), start(0.3)).await;

        assert_eq!(out.summary.stop_reason, LoopStopReason::Exhausted);
        assert_eq!(out.summary.iterations_used, 3);
        assert_eq!(out.draft, "d+++");
        let iterations: Vec<i32> = h
            .store
            .list_artifacts(h.ctx.run_id)
            .await
            .unwrap()
            .iter()
            .filter(|a| a.stage == "auto_send_revision")
            .map(|a| a.iteration)
            .collect();
        assert_eq!(iterations, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn hard_block_is_never_revised() {
        let h = Harness::new();
        let lp = h.looper(ScriptedEvaluator::confidences(&[]), h.reviser(1), Arc::new(NoChunkCache), LoopSettings::default());
        let out = lp.run(&h.ctx, "draft".into(), Evaluation::blocked("promised a discount")).await;
        assert_eq!(out.summary.stop_reason, LoopStopReason::HardBlock);
        assert_eq!(out.summary.iterations_used, 0);
    }

    #[tokio::test]
    async fn hard_block_after_revision_stops() {
        let h = Harness::new();
        let evaluator = ScriptedEvaluator::from(vec![Evaluation { confidence: 0.95, hard_block: true, reason: "pii".into() }]);
        let lp = h.looper(evaluator, h.reviser(1), Arc::new(NoChunkCache), LoopSettings::default());
        let out = lp.run(&h.ctx, "draft".into(), start(0.5)).await;
        assert_eq!(out.summary.stop_reason, LoopStopReason::HardBlock);
        assert_eq!(out.summary.iterations_used, 1);
    }

    #[tokio::test]
    async fn failure_keeps_partial_state() {
        let h = Harness::new();
        let mut reviser = h.reviser(1);
        reviser.fail = true;
        let lp = h.looper(ScriptedEvaluator::confidences(&[]), reviser, Arc::new(NoChunkCache), LoopSettings::default());
        let out = lp.run(&h.ctx, "draft".into(), start(0.5)).await;

        assert_eq!(out.summary.stop_reason, LoopStopReason::Error);
        assert_eq!(out.summary.iterations_used, 0);
        assert_eq!(out.summary.end_confidence, 0.5);
        assert!(out.summary.error.as_deref().unwrap_or_default().contains("provider down"));
        assert!(out.failure.as_ref().is_some_and(StageError::is_retryable));
        let row = h.store.loop_summary(h.ctx.run_id).await.unwrap().unwrap();
        assert_eq!(row.stop_reason, LoopStopReason::Error);
    }

    #[tokio::test]
    async fn repeated_query_hits_the_cache() {
        let h = Harness::new();
        let mut reviser = h.reviser(1);
        reviser.fixed = Some("same reply".into());
        let lp = h.looper(
            ScriptedEvaluator::confidences(&[0.2, 0.3, 0.4]),
            reviser,
            Arc::new(InMemoryChunkCache::new()),
            LoopSettings::default(),
        );
        let out = lp.run(&h.ctx, "first reply".into(), start(0.1)).await;

        assert_eq!(out.summary.iterations_used, 3);
        assert_eq!(out.summary.cache_hits, 1);
        let third = h.store.load_artifact(h.ctx.run_id, "auto_send_revision", 3).await.unwrap().unwrap();
        assert_eq!(third.payload["cacheHit"], true);
        assert_eq!(third.payload["chunkIds"][0], "c1");
    }
}
