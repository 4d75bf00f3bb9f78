//! Prompt runner: one logical completion call with categorized failures,
//! bounded retries, and an output-token budget that grows per attempt.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::budget::TokenBudgetPolicy;
use crate::provider::{
    ChatMessage, CompletionRequest, LlmError, LlmProvider, ReasoningEffort, StopReason,
};

/// Upper bound on the sleep between transient retries.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Closed failure taxonomy exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Timeout,
    RateLimit,
    ApiError,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RateLimit => "rate_limit",
            Self::ApiError => "api_error",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A categorized prompt failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[error("{category}: {message}")]
pub struct PromptError {
    pub category: ErrorCategory,
    pub message: String,
    pub retryable: bool,
    /// Provider back-off hint, only set for rate limits.
    #[serde(skip)]
    pub retry_after: Option<Duration>,
}

impl PromptError {
    pub fn new(category: ErrorCategory, message: impl Into<String>, retryable: bool) -> Self {
        Self { category, message: message.into(), retryable, retry_after: None }
    }

    /// The single place provider errors are mapped onto the taxonomy.
    pub fn from_llm(err: &LlmError) -> Self {
        match err {
            LlmError::Timeout => Self::new(ErrorCategory::Timeout, err.to_string(), true),
            LlmError::RateLimited { retry_after } => Self {
                retry_after: *retry_after,
                ..Self::new(ErrorCategory::RateLimit, err.to_string(), true)
            },
            LlmError::Api { status, .. } => {
                Self::new(ErrorCategory::ApiError, err.to_string(), *status >= 500)
            }
            LlmError::Connection(_) => Self::new(ErrorCategory::ApiError, err.to_string(), true),
            LlmError::Decode(_) => Self::new(ErrorCategory::Unknown, err.to_string(), false),
        }
    }
}

impl From<LlmError> for PromptError {
    fn from(err: LlmError) -> Self {
        Self::from_llm(&err)
    }
}

/// One logical prompt.
#[derive(Debug, Clone)]
pub struct PromptRequest {
    pub system_prompt: String,
    pub messages: Vec<ChatMessage>,
    pub model: Option<String>,
    pub reasoning_effort: Option<ReasoningEffort>,
    /// Output-token budget of the first attempt.
    pub max_output_tokens: u32,
    pub temperature: f32,
}

impl PromptRequest {
    pub fn new(system_prompt: impl Into<String>, user: impl Into<String>, max_output_tokens: u32) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            messages: vec![ChatMessage::user(user)],
            model: None,
            reasoning_effort: None,
            max_output_tokens,
            temperature: 0.3,
        }
    }

    pub fn with_reasoning(mut self, effort: ReasoningEffort) -> Self {
        self.reasoning_effort = Some(effort);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PromptResponse {
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub latency_ms: u64,
    /// Number of provider calls used, including the successful one.
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub max_attempts: usize,
    pub multiplier: f64,
    pub token_cap: u32,
    pub retry_bonus: u32,
    pub call_timeout: Duration,
    /// Base sleep between transient retries, doubled per attempt.
    pub retry_delay: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            multiplier: 1.2,
            token_cap: 8000,
            retry_bonus: 0,
            call_timeout: Duration::from_secs(60),
            retry_delay: Duration::from_millis(500),
        }
    }
}

/// Executes prompts against a provider.
#[derive(Clone)]
pub struct PromptRunner {
    provider: Arc<dyn LlmProvider>,
    settings: RunnerSettings,
}

impl PromptRunner {
    pub fn new(provider: Arc<dyn LlmProvider>, settings: RunnerSettings) -> Self {
        Self { provider, settings }
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    fn budgets(&self, initial: u32) -> Vec<u32> {
        let policy = TokenBudgetPolicy::new(
            initial,
            self.settings.max_attempts.max(1),
            self.settings.multiplier,
            self.settings.token_cap.max(initial),
        )
        .with_retry_bonus(self.settings.retry_bonus);
        policy.expand()
    }

    /// Run a prompt. Transient failures are retried up to `max_attempts`
    /// times with the next (larger) token budget, reusing the capped budget
    /// once it stops growing. Truncated output is retried only while the
    /// budget can still grow. Terminal failures return immediately.
    pub async fn run(&self, request: PromptRequest) -> Result<PromptResponse, PromptError> {
        let budgets = self.budgets(request.max_output_tokens);
        let attempts = self.settings.max_attempts.max(1);
        let started = Instant::now();
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        messages.push(ChatMessage::system(request.system_prompt.clone()));
        messages.extend(request.messages.iter().cloned());

        let mut last_err = PromptError::new(ErrorCategory::Unknown, "no attempts configured", false);
        for index in 0..attempts {
            let max_tokens = budgets.get(index).or(budgets.last()).copied().unwrap_or(request.max_output_tokens);
            let is_last = index + 1 == attempts;
            let can_grow = index + 1 < budgets.len();
            let call = CompletionRequest {
                model: request.model.clone(),
                messages: messages.clone(),
                max_tokens,
                temperature: request.temperature,
                reasoning_effort: request.reasoning_effort,
            };

            let mut truncated = false;
            let err = match tokio::time::timeout(self.settings.call_timeout, self.provider.complete(call)).await {
                Err(_) => PromptError::new(
                    ErrorCategory::Timeout,
                    format!("no response within {}ms", self.settings.call_timeout.as_millis()),
                    true,
                ),
                Ok(Err(e)) => PromptError::from_llm(&e),
                Ok(Ok(resp)) if resp.stop_reason == StopReason::MaxTokens => {
                    truncated = true;
                    PromptError::new(ErrorCategory::Unknown, format!("output truncated at {max_tokens} tokens"), true)
                }
                Ok(Ok(resp)) => {
                    return Ok(PromptResponse {
                        content: resp.content,
                        input_tokens: resp.input_tokens,
                        output_tokens: resp.output_tokens,
                        latency_ms: started.elapsed().as_millis() as u64,
                        attempts: index as u32 + 1,
                    });
                }
            };

            tracing::warn!(
                provider = self.provider.name(),
                attempt = index + 1,
                max_tokens,
                category = %err.category,
                retryable = err.retryable,
                error = %err.message,
                "prompt attempt failed"
            );
            if truncated && (is_last || !can_grow) {
                // Truncation on the final budget is not worth another job retry.
                return Err(PromptError { retryable: false, ..err });
            }
            if !err.retryable || is_last {
                return Err(err);
            }
            let delay = err
                .retry_after
                .unwrap_or_else(|| self.settings.retry_delay * 2u32.saturating_pow(index as u32))
                .min(MAX_RETRY_DELAY);
            tokio::time::sleep(delay).await;
            last_err = err;
        }
        Err(last_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ScriptedProvider, ScriptedReply};

    fn settings() -> RunnerSettings {
        RunnerSettings {
            max_attempts: 3,
            multiplier: 1.2,
            token_cap: 10_000,
            retry_bonus: 0,
            call_timeout: Duration::from_secs(5),
            retry_delay: Duration::ZERO,
        }
    }

    fn runner(p: &Arc<ScriptedProvider>) -> PromptRunner {
        PromptRunner::new(p.clone(), settings())
    }

    #[test]
    fn categorize_provider_errors() {
        let t = PromptError::from_llm(&LlmError::Timeout);
        assert_eq!(t.category, ErrorCategory::Timeout);
        assert!(t.retryable);

        let r = PromptError::from_llm(&LlmError::RateLimited { retry_after: Some(Duration::from_secs(3)) });
        assert_eq!(r.category, ErrorCategory::RateLimit);
        assert_eq!(r.retry_after, Some(Duration::from_secs(3)));

        let five = PromptError::from_llm(&LlmError::Api { status: 503, message: "down".into() });
        assert_eq!(five.category, ErrorCategory::ApiError);
        assert!(five.retryable);

        let four = PromptError::from_llm(&LlmError::Api { status: 400, message: "bad".into() });
        assert!(!four.retryable);

        let d = PromptError::from_llm(&LlmError::Decode("eof".into()));
        assert_eq!(d.category, ErrorCategory::Unknown);
        assert!(!d.retryable);
    }

    #[tokio::test]
    async fn timeout_is_retried_with_larger_budget() {
        let p = Arc::new(ScriptedProvider::new(vec![
            ScriptedReply::Fail(LlmError::Timeout),
            ScriptedReply::Text("hello".into()),
        ]));
        let resp = runner(&p).run(PromptRequest::new("sys", "user", 1000)).await.unwrap();
        assert_eq!(resp.content, "hello");
        assert_eq!(resp.attempts, 2);

        let seen = p.requests();
        assert_eq!(seen[0].max_tokens, 1000);
        assert_eq!(seen[1].max_tokens, 1200);
        assert_eq!(seen[0].messages[0].content, "sys");
    }

    #[tokio::test]
    async fn slow_call_becomes_timeout_category() {
        let p = Arc::new(ScriptedProvider::new(vec![
            ScriptedReply::Delayed(Duration::from_millis(200), "late".into()),
            ScriptedReply::Text("fast".into()),
        ]));
        let mut s = settings();
        s.call_timeout = Duration::from_millis(20);
        let resp = PromptRunner::new(p.clone(), s)
            .run(PromptRequest::new("sys", "user", 1000))
            .await
            .unwrap();
        assert_eq!(resp.content, "fast");
    }

    #[tokio::test]
    async fn truncated_output_expands_budget() {
        let p = Arc::new(ScriptedProvider::new(vec![
            ScriptedReply::Truncated("{\"partial".into()),
            ScriptedReply::Text("{}".into()),
        ]));
        let resp = runner(&p).run(PromptRequest::new("sys", "user", 1000)).await.unwrap();
        assert_eq!(resp.content, "{}");
        assert_eq!(p.requests()[1].max_tokens, 1200);
    }

    #[tokio::test]
    async fn capped_budget_still_gets_every_attempt() {
        let p = Arc::new(ScriptedProvider::new(vec![
            ScriptedReply::Fail(LlmError::Timeout),
            ScriptedReply::Fail(LlmError::RateLimited { retry_after: None }),
            ScriptedReply::Text("ok".into()),
        ]));
        let mut s = settings();
        s.token_cap = 8000;
        let resp = PromptRunner::new(p.clone(), s)
            .run(PromptRequest::new("sys", "user", 8000))
            .await
            .unwrap();
        assert_eq!(resp.content, "ok");
        assert_eq!(resp.attempts, 3);
        assert!(p.requests().iter().all(|r| r.max_tokens == 8000));
    }

    #[tokio::test]
    async fn truncation_at_the_cap_is_not_retried() {
        let p = Arc::new(ScriptedProvider::new(vec![
            ScriptedReply::Truncated("{\"partial".into()),
            ScriptedReply::Text("{}".into()),
        ]));
        let mut s = settings();
        s.token_cap = 8000;
        let err = PromptRunner::new(p.clone(), s)
            .run(PromptRequest::new("sys", "user", 8000))
            .await
            .unwrap_err();
        assert!(!err.retryable);
        assert_eq!(p.requests().len(), 1);
    }

    #[tokio::test]
    async fn terminal_error_is_not_retried() {
        let p = Arc::new(ScriptedProvider::new(vec![
            ScriptedReply::Fail(LlmError::Api { status: 401, message: "bad key".into() }),
            ScriptedReply::Text("never".into()),
        ]));
        let err = runner(&p).run(PromptRequest::new("sys", "user", 1000)).await.unwrap_err();
        assert_eq!(err.category, ErrorCategory::ApiError);
        assert!(!err.retryable);
        assert_eq!(p.requests().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_last_error() {
        let p = Arc::new(ScriptedProvider::new(vec![
            ScriptedReply::Fail(LlmError::RateLimited { retry_after: None }),
            ScriptedReply::Fail(LlmError::RateLimited { retry_after: None }),
            ScriptedReply::Fail(LlmError::RateLimited { retry_after: None }),
        ]));
        let err = runner(&p).run(PromptRequest::new("sys", "user", 1000)).await.unwrap_err();
        assert_eq!(err.category, ErrorCategory::RateLimit);
        assert!(err.retryable);
        assert_eq!(p.requests().len(), 3);
    }
}
