//! Pipeline stage outputs and the prompt-backed stage implementations.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use outreach_llm::provider::ReasoningEffort;
use outreach_llm::runner::{PromptError, PromptRequest, PromptRunner};

use super::evaluation::{EvaluationError, extract_json};
use crate::error::StoreError;
use crate::types::{ContextChunk, InboundMessage};

/// Shared inputs for every stage of one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub message: InboundMessage,
    pub chunks: Vec<ContextChunk>,
}

impl RunContext {
    /// Context chunks rendered for a prompt, most relevant first.
    pub fn render_chunks(chunks: &[ContextChunk]) -> String {
        chunks
            .iter()
            .map(|c| format!("[{}] {}", c.group, c.text))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("prompt failed: {0}")]
    Prompt(#[from] PromptError),
    #[error("invalid model output: {0}")]
    Invalid(#[from] EvaluationError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl StageError {
    /// Whether a later job attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Prompt(e) => e.retryable,
            Self::Invalid(_) | Self::Store(_) => true,
        }
    }

    /// Provider back-off hint, if the failure carried one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Prompt(e) => e.retry_after,
            _ => None,
        }
    }
}

// ── Stage outputs ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Strategy {
    pub intent: String,
    pub talking_points: Vec<String>,
    pub tone: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftCandidate {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    /// Policy or factual problem that must never be sent.
    pub blocked: bool,
    #[serde(default)]
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    Proceed,
    NeedsReview,
}

/// Meeting-overseer output: scheduling details extracted from the thread and
/// whether the draft may go out without a human.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeetingGate {
    pub decision: GateDecision,
    #[serde(default)]
    pub proposed_times: Vec<String>,
    #[serde(default)]
    pub reason: String,
}

/// The linear stages before evaluation.
#[async_trait]
pub trait DraftStages: Send + Sync {
    async fn strategy(&self, ctx: &RunContext) -> Result<Strategy, StageError>;

    async fn draft(&self, ctx: &RunContext, strategy: &Strategy) -> Result<DraftCandidate, StageError>;

    async fn verify(&self, ctx: &RunContext, draft: &DraftCandidate) -> Result<Verification, StageError>;

    async fn meeting_gate(&self, ctx: &RunContext, draft: &DraftCandidate) -> Result<MeetingGate, StageError>;
}

const STRATEGY_PROMPT: &str = "You plan replies for a sales team. Read the lead's latest message and \
the context. Respond with JSON only: {\"intent\": string, \"talkingPoints\": [string], \"tone\": string}.";

const DRAFT_PROMPT: &str = "You write short, specific replies to sales leads on behalf of a human \
setter. Follow the strategy. Never invent prices, dates or commitments that are not in the context. \
Respond with JSON only: {\"content\": string}.";

const VERIFY_PROMPT: &str = "You check outbound sales replies before they are sent. Set blocked to \
true if the reply makes claims unsupported by the context, promises pricing or legal terms, or \
contains anything unsafe to send. Respond with JSON only: {\"blocked\": bool, \"issues\": [string]}.";

const MEETING_PROMPT: &str = "You oversee meeting scheduling in sales replies. Extract any times the \
lead proposed. Answer needs_review if the reply books, moves or cancels a meeting the context does \
not confirm. Respond with JSON only: {\"decision\": \"proceed\" | \"needs_review\", \
\"proposedTimes\": [string], \"reason\": string}.";

/// Stages, evaluator and reviser backed by the prompt runner.
#[derive(Clone)]
pub struct PromptStages {
    runner: PromptRunner,
    output_tokens: u32,
}

impl PromptStages {
    pub fn new(runner: PromptRunner, output_tokens: u32) -> Self {
        Self { runner, output_tokens }
    }

    /// Run one prompt and validate its JSON into `T`.
    pub(crate) async fn ask<T: DeserializeOwned>(
        &self,
        system: &str,
        user: String,
        effort: Option<ReasoningEffort>,
    ) -> Result<T, StageError> {
        let mut request = PromptRequest::new(system, user, self.output_tokens);
        request.reasoning_effort = effort;
        let response = self.runner.run(request).await?;
        parse_output(&response.content)
    }
}

/// Parse model output into `T`, tolerating code fences and surrounding prose.
pub fn parse_output<T: DeserializeOwned>(raw: &str) -> Result<T, StageError> {
    let value = extract_json(raw)?;
    serde_json::from_value(value).map_err(|e| StageError::Invalid(EvaluationError::Schema(e.to_string())))
}

fn thread_prompt(ctx: &RunContext) -> String {
    format!(
        "Channel: {}\nLead message:\n{}\n\nContext:\n{}",
        ctx.message.channel,
        ctx.message.body,
        RunContext::render_chunks(&ctx.chunks)
    )
}

#[async_trait]
impl DraftStages for PromptStages {
    async fn strategy(&self, ctx: &RunContext) -> Result<Strategy, StageError> {
        self.ask(STRATEGY_PROMPT, thread_prompt(ctx), Some(ReasoningEffort::Low)).await
    }

    async fn draft(&self, ctx: &RunContext, strategy: &Strategy) -> Result<DraftCandidate, StageError> {
        let user = format!(
            "{}\n\nStrategy: {} (tone: {})\nTalking points:\n- {}",
            thread_prompt(ctx),
            strategy.intent,
            strategy.tone,
            strategy.talking_points.join("\n- ")
        );
        let draft: DraftCandidate = self.ask(DRAFT_PROMPT, user, None).await?;
        if draft.content.trim().is_empty() {
            return Err(EvaluationError::Field { field: "content", problem: "empty".into() }.into());
        }
        Ok(draft)
    }

    async fn verify(&self, ctx: &RunContext, draft: &DraftCandidate) -> Result<Verification, StageError> {
        let user = format!("{}\n\nReply to check:\n{}", thread_prompt(ctx), draft.content);
        self.ask(VERIFY_PROMPT, user, Some(ReasoningEffort::Medium)).await
    }

    async fn meeting_gate(&self, ctx: &RunContext, draft: &DraftCandidate) -> Result<MeetingGate, StageError> {
        let user = format!("{}\n\nReply to check:\n{}", thread_prompt(ctx), draft.content);
        self.ask(MEETING_PROMPT, user, Some(ReasoningEffort::Low)).await
    }
}
