//! Sequences the draft stages into a run and turns the revision loop's stop
//! reason into an auto-send decision.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use super::artifact::{Stage, is_error_marker, write_artifact};
use super::context::ChunkCache;
use super::evaluation::{DraftEvaluator, Evaluation};
use super::revision::{DraftReviser, LoopSettings, RevisionLoop};
use super::stages::{DraftCandidate, DraftStages, GateDecision, PromptStages, RunContext, StageError};
use super::store::PipelineStore;
use crate::clock::Clock;
use crate::config::OutreachCfg;
use crate::drafts::{AutoSendDecision, AutoSendDecisionRecorder, DraftStore, NewDraft};
use crate::error::StoreError;
use crate::notify::Notifier;
use crate::types::{AutoSendAction, ContextChunk, InboundMessage, LoopStopReason, PipelineRun, RunStatus};

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub revision: LoopSettings,
    /// Zero sends immediately; anything else schedules a delayed send.
    pub auto_send_delay: Duration,
}

impl PipelineSettings {
    pub fn from_cfg(cfg: &OutreachCfg) -> Self {
        Self {
            revision: LoopSettings::from_cfg(cfg),
            auto_send_delay: Duration::from_secs(cfg.auto_send_delay_secs),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_cfg(&OutreachCfg::default())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("stage {stage} failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: StageError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PipelineError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Stage { source, .. } => source.is_retryable(),
            Self::Store(_) => true,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Stage { source, .. } => source.retry_after(),
            Self::Store(_) => None,
        }
    }
}

/// The decision a run reached.
#[derive(Debug, Clone, PartialEq)]
pub struct RunDecision {
    pub run_id: Uuid,
    pub draft_id: Uuid,
    pub action: AutoSendAction,
    pub confidence: Option<f64>,
    /// `None` when the meeting gate routed the draft to review before the loop.
    pub stop_reason: Option<LoopStopReason>,
    pub run_status: RunStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    Decided(RunDecision),
    /// A redelivered trigger for a run that already finished.
    AlreadyFinished { run_id: Uuid, status: RunStatus },
}

/// Map a loop stop reason to an action. Anything short of a confident,
/// unblocked draft goes to a human.
pub fn decide(stop_reason: LoopStopReason, delay: Duration) -> AutoSendAction {
    match stop_reason {
        LoopStopReason::ThresholdMet if delay.is_zero() => AutoSendAction::SendImmediate,
        LoopStopReason::ThresholdMet => AutoSendAction::SendDelayed,
        LoopStopReason::HardBlock => AutoSendAction::Skip,
        LoopStopReason::NoImprovement | LoopStopReason::Timeout | LoopStopReason::Exhausted => {
            AutoSendAction::NeedsReview
        }
        LoopStopReason::Error => AutoSendAction::Error,
    }
}

/// `final_draft` artifact: the content that ships and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalDraft {
    pub content: String,
    pub action: AutoSendAction,
    pub confidence: Option<f64>,
    pub reason: String,
    pub stop_reason: Option<LoopStopReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Collaborators the orchestrator drives.
#[derive(Clone)]
pub struct PipelineDeps {
    pub pipeline: Arc<dyn PipelineStore>,
    pub drafts: Arc<dyn DraftStore>,
    pub stages: Arc<dyn DraftStages>,
    pub evaluator: Arc<dyn DraftEvaluator>,
    pub reviser: Arc<dyn DraftReviser>,
    pub cache: Arc<dyn ChunkCache>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
}

impl PipelineDeps {
    /// Every stage, the evaluator and the reviser backed by one prompt runner.
    pub fn prompt_backed(
        stages: PromptStages,
        pipeline: Arc<dyn PipelineStore>,
        drafts: Arc<dyn DraftStore>,
        cache: Arc<dyn ChunkCache>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let stages = Arc::new(stages);
        Self {
            pipeline,
            drafts,
            stages: stages.clone(),
            evaluator: stages.clone(),
            reviser: stages,
            cache,
            notifier,
            clock,
        }
    }
}

pub struct PipelineOrchestrator {
    deps: PipelineDeps,
    recorder: AutoSendDecisionRecorder,
    revision: RevisionLoop,
    settings: PipelineSettings,
}

impl PipelineOrchestrator {
    pub fn new(deps: PipelineDeps, settings: PipelineSettings) -> Self {
        let revision = RevisionLoop::new(
            deps.evaluator.clone(),
            deps.reviser.clone(),
            deps.cache.clone(),
            deps.pipeline.clone(),
            deps.clock.clone(),
            settings.revision.clone(),
        );
        Self { recorder: AutoSendDecisionRecorder::new(deps.drafts.clone()), revision, deps, settings }
    }

    /// Run (or resume) the pipeline for one inbound message.
    ///
    /// Stages whose artifact already exists for the run are loaded instead of
    /// executed, so a retried job picks up where the failed attempt stopped.
    /// A retryable revision loop failure is returned as an error unless
    /// `final_attempt` is set, in which case the draft is stamped `error`.
    pub async fn run(
        &self,
        message: InboundMessage,
        chunks: Vec<ContextChunk>,
        final_attempt: bool,
    ) -> Result<PipelineOutcome, PipelineError> {
        let now = self.deps.clock.now();
        let (mut run, created) = self.deps.pipeline.get_or_create_run(&message.id, message.channel, now).await?;

        match run.status {
            RunStatus::Completed | RunStatus::Aborted => {
                tracing::info!(run_id = %run.id, status = run.status.as_db_str(), "run already finished");
                return Ok(PipelineOutcome::AlreadyFinished { run_id: run.id, status: run.status });
            }
            RunStatus::Failed => {
                tracing::info!(run_id = %run.id, "resuming failed run");
                self.deps.pipeline.set_run_status(run.id, RunStatus::Running, now).await?;
                run.status = RunStatus::Running;
            }
            RunStatus::Running if !created => tracing::info!(run_id = %run.id, "resuming run"),
            RunStatus::Running => tracing::info!(run_id = %run.id, message_id = %message.id, "run started"),
        }

        let ctx = RunContext { run_id: run.id, message, chunks };
        match self.execute(&ctx, &mut run, final_attempt).await {
            Ok(decision) => {
                if decision.run_status == RunStatus::Completed {
                    self.deps.pipeline.set_run_status(run.id, RunStatus::Completed, self.deps.clock.now()).await?;
                }
                tracing::info!(
                    run_id = %run.id,
                    draft_id = %decision.draft_id,
                    action = decision.action.as_db_str(),
                    status = decision.run_status.as_db_str(),
                    "run finished"
                );
                Ok(PipelineOutcome::Decided(decision))
            }
            Err(e) => {
                let (stage, retryable) = match &e {
                    PipelineError::Stage { stage, source } => (*stage, source.is_retryable()),
                    PipelineError::Store(_) => (Stage::LoopError, true),
                };
                tracing::warn!(run_id = %run.id, %stage, error = %e, "run failed");
                self.fail_run(&ctx, stage, &e.to_string(), retryable).await;
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        ctx: &RunContext,
        run: &mut PipelineRun,
        final_attempt: bool,
    ) -> Result<RunDecision, PipelineError> {
        let stages = &self.deps.stages;

        let strategy = self.stage(ctx, Stage::Strategy, || stages.strategy(ctx)).await?;
        let candidate = self.stage(ctx, Stage::DraftGeneration, || stages.draft(ctx, &strategy)).await?;
        let draft_id = self.ensure_draft(ctx, run, &candidate).await?;
        let verification = self.stage(ctx, Stage::Verification, || stages.verify(ctx, &candidate)).await?;

        let final_draft = if verification.blocked {
            let reason = if verification.issues.is_empty() {
                "blocked by verification".to_owned()
            } else {
                verification.issues.join("; ")
            };
            self.conclude(ctx, &candidate, Evaluation::blocked(reason), final_attempt).await?
        } else {
            let gate = self.stage(ctx, Stage::MeetingOverseer, || stages.meeting_gate(ctx, &candidate)).await?;
            if gate.decision == GateDecision::NeedsReview {
                let held = FinalDraft {
                    content: candidate.content.clone(),
                    action: AutoSendAction::NeedsReview,
                    confidence: None,
                    reason: gate.reason.clone(),
                    stop_reason: None,
                    error: None,
                };
                self.stage(ctx, Stage::FinalDraft, move || async move { Ok(held) }).await?
            } else {
                let evaluation = self
                    .stage(ctx, Stage::AutoSendEvaluation, || self.deps.evaluator.evaluate(ctx, &candidate.content))
                    .await?;
                self.conclude(ctx, &candidate, evaluation, final_attempt).await?
            }
        };

        let failed = final_draft.action == AutoSendAction::Error;
        let now = self.deps.clock.now();
        if final_draft.content != candidate.content {
            self.deps
                .drafts
                .update_content(draft_id, &final_draft.content, now)
                .await
                .map_err(|e| stage_failure(Stage::FinalDraft, e))?;
        }

        let decision = AutoSendDecision {
            action: final_draft.action,
            confidence: final_draft.confidence,
            threshold: self.settings.revision.threshold,
            reason: final_draft.error.clone().unwrap_or_else(|| final_draft.reason.clone()),
            evaluated_at: now,
        };
        self.recorder
            .record(draft_id, &decision)
            .await
            .map_err(|e| stage_failure(Stage::FinalDraft, e))?;
        self.notify(draft_id, &decision).await;
        if failed {
            self.fail_run(ctx, Stage::AutoSendRevision, &decision.reason, false).await;
        }

        Ok(RunDecision {
            run_id: ctx.run_id,
            draft_id,
            action: final_draft.action,
            confidence: final_draft.confidence,
            stop_reason: final_draft.stop_reason,
            run_status: if failed { RunStatus::Failed } else { RunStatus::Completed },
        })
    }

    /// Load a finished stage's output, or run it and persist the artifact.
    async fn stage<T, F, Fut>(&self, ctx: &RunContext, stage: Stage, f: F) -> Result<T, PipelineError>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, StageError>> + Send,
    {
        if let Some(done) = self.resume(ctx, stage).await? {
            return Ok(done);
        }
        let value = f().await.map_err(|source| PipelineError::Stage { stage, source })?;
        write_artifact(self.deps.pipeline.as_ref(), ctx.run_id, stage, 0, &value, self.deps.clock.now())
            .await
            .map_err(|e| stage_failure(stage, e))?;
        Ok(value)
    }

    async fn resume<T: DeserializeOwned>(&self, ctx: &RunContext, stage: Stage) -> Result<Option<T>, PipelineError> {
        let stored = self
            .deps
            .pipeline
            .load_artifact(ctx.run_id, stage.as_str(), 0)
            .await
            .map_err(|e| stage_failure(stage, e))?;
        let Some(artifact) = stored else {
            return Ok(None);
        };
        if is_error_marker(&artifact.payload) {
            return Ok(None);
        }
        match serde_json::from_value(artifact.payload) {
            Ok(value) => {
                tracing::debug!(run_id = %ctx.run_id, %stage, "stage loaded from artifact");
                Ok(Some(value))
            }
            Err(e) => {
                tracing::warn!(run_id = %ctx.run_id, %stage, error = %e, "stored artifact unreadable, re-running stage");
                Ok(None)
            }
        }
    }

    /// Revision loop plus the `final_draft` artifact. A loop that ended in
    /// error leaves no `final_draft`, so a later run re-enters the loop.
    async fn conclude(
        &self,
        ctx: &RunContext,
        candidate: &DraftCandidate,
        evaluation: Evaluation,
        final_attempt: bool,
    ) -> Result<FinalDraft, PipelineError> {
        if let Some(done) = self.resume(ctx, Stage::FinalDraft).await? {
            return Ok(done);
        }
        let outcome = self.revision.run(ctx, candidate.content.clone(), evaluation).await;
        if let Some(source) = outcome.failure {
            if source.is_retryable() && !final_attempt {
                return Err(PipelineError::Stage { stage: Stage::AutoSendRevision, source });
            }
        }
        let stop_reason = outcome.summary.stop_reason;
        let final_draft = FinalDraft {
            content: outcome.draft,
            action: decide(stop_reason, self.settings.auto_send_delay),
            confidence: Some(outcome.evaluation.confidence),
            reason: outcome.evaluation.reason,
            stop_reason: Some(stop_reason),
            error: outcome.summary.error,
        };
        if stop_reason != LoopStopReason::Error {
            write_artifact(
                self.deps.pipeline.as_ref(),
                ctx.run_id,
                Stage::FinalDraft,
                0,
                &final_draft,
                self.deps.clock.now(),
            )
            .await
            .map_err(|e| stage_failure(Stage::FinalDraft, e))?;
        }
        Ok(final_draft)
    }

    async fn ensure_draft(
        &self,
        ctx: &RunContext,
        run: &mut PipelineRun,
        candidate: &DraftCandidate,
    ) -> Result<Uuid, PipelineError> {
        if let Some(id) = run.draft_id {
            return Ok(id);
        }
        let now = self.deps.clock.now();
        let new = NewDraft {
            workspace_id: ctx.message.workspace_id.clone(),
            lead_id: ctx.message.lead_id.clone(),
            trigger_message_id: ctx.message.id.clone(),
            channel: ctx.message.channel,
            content: candidate.content.clone(),
            run_id: Some(run.id),
        };
        let draft = self
            .deps
            .drafts
            .create(&new, now)
            .await
            .map_err(|e| stage_failure(Stage::DraftGeneration, e))?;
        self.deps
            .pipeline
            .attach_draft(run.id, draft.id, now)
            .await
            .map_err(|e| stage_failure(Stage::DraftGeneration, e))?;
        run.draft_id = Some(draft.id);
        tracing::debug!(run_id = %run.id, draft_id = %draft.id, "draft created");
        Ok(draft.id)
    }

    async fn notify(&self, draft_id: Uuid, decision: &AutoSendDecision) {
        let draft = match self.deps.drafts.get(draft_id).await {
            Ok(Some(draft)) => draft,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(%draft_id, error = %e, "failed to load draft for notification");
                return;
            }
        };
        match self.deps.notifier.draft_decided(&draft, decision).await {
            Ok(Some(meta)) => {
                if let Err(e) = self.deps.drafts.set_notification(draft_id, &meta, self.deps.clock.now()).await {
                    tracing::warn!(%draft_id, error = %e, "failed to store notification metadata");
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(%draft_id, error = %e, "notification failed"),
        }
    }

    async fn fail_run(&self, ctx: &RunContext, stage: Stage, error: &str, retryable: bool) {
        let now = self.deps.clock.now();
        let payload = json!({ "stage": stage.as_str(), "error": error, "retryable": retryable });
        if let Err(e) = write_artifact(self.deps.pipeline.as_ref(), ctx.run_id, Stage::LoopError, 0, &payload, now).await {
            tracing::warn!(run_id = %ctx.run_id, error = %e, "failed to write loop_error artifact");
        }
        if let Err(e) = self.deps.pipeline.set_run_status(ctx.run_id, RunStatus::Failed, now).await {
            tracing::warn!(run_id = %ctx.run_id, error = %e, "failed to mark run failed");
        }
    }
}

fn stage_failure(stage: Stage, e: StoreError) -> PipelineError {
    PipelineError::Stage { stage, source: StageError::Store(e) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decisions_bias_toward_review() {
        let zero = Duration::ZERO;
        assert_eq!(decide(LoopStopReason::ThresholdMet, zero), AutoSendAction::SendImmediate);
        assert_eq!(decide(LoopStopReason::ThresholdMet, Duration::from_secs(300)), AutoSendAction::SendDelayed);
        assert_eq!(decide(LoopStopReason::HardBlock, zero), AutoSendAction::Skip);
        assert_eq!(decide(LoopStopReason::NoImprovement, zero), AutoSendAction::NeedsReview);
        assert_eq!(decide(LoopStopReason::Timeout, zero), AutoSendAction::NeedsReview);
        assert_eq!(decide(LoopStopReason::Exhausted, zero), AutoSendAction::NeedsReview);
        assert_eq!(decide(LoopStopReason::Error, zero), AutoSendAction::Error);
    }

    #[test]
    fn failures_carry_retry_hints() {
        use outreach_llm::runner::{ErrorCategory, PromptError};
        let mut limited = PromptError::new(ErrorCategory::RateLimit, "429", true);
        limited.retry_after = Some(Duration::from_secs(20));
        let e = PipelineError::Stage { stage: Stage::Strategy, source: limited.into() };
        assert!(e.is_retryable());
        assert_eq!(e.retry_after(), Some(Duration::from_secs(20)));
        assert!(e.to_string().starts_with("stage strategy failed"));
    }
}
