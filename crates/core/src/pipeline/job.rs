use std::sync::Arc;

use async_trait::async_trait;

use super::orchestrator::{PipelineError, PipelineOrchestrator, PipelineOutcome};
use crate::clock::Clock;
use crate::conversation::ConversationSource;
use crate::jobs::{AI_DRAFT_PIPELINE, BackgroundJob, JobError, JobHandler};

/// Runs the draft pipeline for the job's trigger message.
pub struct DraftPipelineHandler {
    orchestrator: Arc<PipelineOrchestrator>,
    conversations: Arc<dyn ConversationSource>,
    clock: Arc<dyn Clock>,
}

impl DraftPipelineHandler {
    pub fn new(
        orchestrator: Arc<PipelineOrchestrator>,
        conversations: Arc<dyn ConversationSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { orchestrator, conversations, clock }
    }

    fn job_error(&self, e: PipelineError) -> JobError {
        if !e.is_retryable() {
            return JobError::Permanent(e.to_string());
        }
        match e.retry_after().and_then(|d| chrono::Duration::from_std(d).ok()) {
            Some(wait) => JobError::Reschedule { run_at: self.clock.now() + wait, reason: e.to_string() },
            None => JobError::Failed(e.to_string()),
        }
    }
}

#[async_trait]
impl JobHandler for DraftPipelineHandler {
    fn job_type(&self) -> &'static str {
        AI_DRAFT_PIPELINE
    }

    async fn handle(&self, job: &BackgroundJob) -> Result<(), JobError> {
        let message = self
            .conversations
            .inbound_message(&job.message_id)
            .await
            .map_err(|e| JobError::Failed(e.to_string()))?
            .ok_or_else(|| JobError::Permanent(format!("message {} not found", job.message_id)))?;
        let chunks = self
            .conversations
            .context_chunks(&message.workspace_id, &message.lead_id)
            .await
            .map_err(|e| JobError::Failed(e.to_string()))?;

        match self.orchestrator.run(message, chunks, job.attempts_exhausted()).await {
            Ok(PipelineOutcome::Decided(decision)) => {
                tracing::debug!(
                    job_id = %job.id,
                    run_id = %decision.run_id,
                    action = decision.action.as_db_str(),
                    "draft pipeline job done"
                );
                Ok(())
            }
            Ok(PipelineOutcome::AlreadyFinished { run_id, .. }) => {
                tracing::debug!(job_id = %job.id, %run_id, "draft pipeline already finished");
                Ok(())
            }
            Err(e) => Err(self.job_error(e)),
        }
    }
}
