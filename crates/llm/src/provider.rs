use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Reasoning effort hint forwarded to models that support it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Minimal,
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minimal => "minimal",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopReason {
    #[default]
    EndTurn,
    MaxTokens,
}

/// LLM completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Overrides the provider's configured model when set.
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub reasoning_effort: Option<ReasoningEffort>,
}

/// LLM completion response.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub stop_reason: StopReason,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Transport-level error raised by a provider.
///
/// Callers outside this crate see these only through
/// [`PromptError`](crate::runner::PromptError), which maps them onto the closed
/// category set.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("request timed out")]
    Timeout,
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("provider returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("malformed response: {0}")]
    Decode(String),
}

/// A model endpoint the prompt runner can call.
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    fn complete(
        &self,
        request: CompletionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CompletionResponse, LlmError>> + Send + '_>>;
}

/// One scripted reply for [`ScriptedProvider`].
#[derive(Debug)]
pub enum ScriptedReply {
    Text(String),
    Truncated(String),
    Fail(LlmError),
    /// Sleeps before answering; used to exercise call timeouts.
    Delayed(Duration, String),
}

/// Test provider that replays a queue of replies and records every request.
/// Once the queue is drained it keeps answering with the fallback text.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<ScriptedReply>>,
    seen: Mutex<Vec<CompletionRequest>>,
    fallback: String,
}

impl ScriptedProvider {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            seen: Mutex::new(Vec::new()),
            fallback: String::new(),
        }
    }

    pub fn with_fallback(mut self, text: impl Into<String>) -> Self {
        self.fallback = text.into();
        self
    }

    /// Requests received so far, in call order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn complete(
        &self,
        request: CompletionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CompletionResponse, LlmError>> + Send + '_>> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(request);
        }
        let next = self.replies.lock().ok().and_then(|mut q| q.pop_front());
        let fallback = self.fallback.clone();
        Box::pin(async move {
            let ok = |content: String, stop_reason| CompletionResponse {
                output_tokens: content.len() as u32,
                content,
                stop_reason,
                input_tokens: 10,
            };
            match next {
                None => Ok(ok(fallback, StopReason::EndTurn)),
                Some(ScriptedReply::Text(t)) => Ok(ok(t, StopReason::EndTurn)),
                Some(ScriptedReply::Truncated(t)) => Ok(ok(t, StopReason::MaxTokens)),
                Some(ScriptedReply::Fail(e)) => Err(e),
                Some(ScriptedReply::Delayed(d, t)) => {
                    tokio::time::sleep(d).await;
                    Ok(ok(t, StopReason::EndTurn))
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CompletionRequest {
        CompletionRequest {
            model: None,
            messages: vec![ChatMessage::user("hi")],
            max_tokens: 100,
            temperature: 0.7,
            reasoning_effort: None,
        }
    }

    #[tokio::test]
    async fn scripted_provider_replays_in_order() {
        let p = ScriptedProvider::new(vec![
            ScriptedReply::Fail(LlmError::Timeout),
            ScriptedReply::Truncated("partial".into()),
            ScriptedReply::Text("done".into()),
        ])
        .with_fallback("fallback");

        assert!(matches!(p.complete(request()).await, Err(LlmError::Timeout)));
        let r = p.complete(request()).await.unwrap();
        assert_eq!(r.stop_reason, StopReason::MaxTokens);
        assert_eq!(p.complete(request()).await.unwrap().content, "done");
        assert_eq!(p.complete(request()).await.unwrap().content, "fallback");
        assert_eq!(p.requests().len(), 4);
    }
}
