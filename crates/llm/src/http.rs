//! HTTP transport for the prompt runner.
//!
//! Two wire formats cover the hosted models the worker talks to: the
//! OpenAI-style `/chat/completions` endpoint (also served by Gemini, DeepSeek
//! and most gateways) and Anthropic's `/v1/messages`. Every stage prompt asks
//! for a JSON object, so chat-completions requests turn on JSON mode.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::provider::{ChatMessage, CompletionRequest, CompletionResponse, LlmError, LlmProvider, Role, StopReason};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const ERROR_BODY_CHARS: usize = 500;

/// Request/response shape spoken by the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wire {
    ChatCompletions,
    Messages,
}

impl Wire {
    /// `claude-*` models speak the Messages API; everything else is assumed
    /// to be chat-completions compatible.
    pub fn for_model(model: &str) -> Self {
        if model.to_ascii_lowercase().starts_with("claude-") { Self::Messages } else { Self::ChatCompletions }
    }

    fn default_base_url(self) -> &'static str {
        match self {
            Self::ChatCompletions => "https://api.openai.com/v1",
            Self::Messages => "https://api.anthropic.com",
        }
    }

    fn path(self) -> &'static str {
        match self {
            Self::ChatCompletions => "/chat/completions",
            Self::Messages => "/v1/messages",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub model: String,
    pub api_key: String,
    pub wire: Wire,
    pub base_url: String,
    /// Transport-level ceiling. The prompt runner applies its own, shorter,
    /// per-call timeout on top.
    pub request_timeout: Duration,
}

impl HttpSettings {
    pub fn new(model: impl Into<String>, api_key: impl Into<String>) -> Self {
        let model = model.into();
        let wire = Wire::for_model(&model);
        Self {
            model,
            api_key: api_key.into(),
            wire,
            base_url: wire.default_base_url().to_owned(),
            request_timeout: Duration::from_secs(120),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_owned();
        self
    }
}

// ── chat-completions wire ──

#[derive(Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    response_format: JsonMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_effort: Option<&'static str>,
}

#[derive(Serialize)]
struct JsonMode {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

// ── messages wire ──

#[derive(Serialize)]
struct MessagesBody<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "String::is_empty")]
    system: String,
    messages: Vec<WireMessage<'a>>,
}

#[derive(Deserialize)]
struct MessagesReply {
    #[serde(default)]
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: Option<MessagesUsage>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct MessagesUsage {
    input_tokens: u32,
    output_tokens: u32,
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

fn chat_body<'a>(model: &'a str, request: &'a CompletionRequest) -> ChatBody<'a> {
    ChatBody {
        model,
        messages: request
            .messages
            .iter()
            .map(|m| WireMessage { role: role_name(m.role), content: &m.content })
            .collect(),
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        response_format: JsonMode { kind: "json_object" },
        reasoning_effort: request.reasoning_effort.map(|e| e.as_str()),
    }
}

/// System messages move to the top-level `system` field, joined in order.
fn messages_body<'a>(model: &'a str, request: &'a CompletionRequest) -> MessagesBody<'a> {
    let (system, turns): (Vec<&ChatMessage>, Vec<&ChatMessage>) =
        request.messages.iter().partition(|m| m.role == Role::System);
    MessagesBody {
        model,
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        system: system.iter().map(|m| m.content.as_str()).collect::<Vec<_>>().join("\n\n"),
        messages: turns
            .into_iter()
            .map(|m| WireMessage { role: role_name(m.role), content: &m.content })
            .collect(),
    }
}

fn parse_chat_reply(raw: &str) -> Result<CompletionResponse, LlmError> {
    let reply: ChatReply = serde_json::from_str(raw).map_err(|e| LlmError::Decode(e.to_string()))?;
    let choice = reply
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::Decode("response has no choices".into()))?;
    let (input_tokens, output_tokens) = reply.usage.map_or((0, 0), |u| (u.prompt_tokens, u.completion_tokens));
    Ok(CompletionResponse {
        content: choice.message.content.unwrap_or_default(),
        stop_reason: match choice.finish_reason.as_deref() {
            Some("length") => StopReason::MaxTokens,
            _ => StopReason::EndTurn,
        },
        input_tokens,
        output_tokens,
    })
}

fn parse_messages_reply(raw: &str) -> Result<CompletionResponse, LlmError> {
    let reply: MessagesReply = serde_json::from_str(raw).map_err(|e| LlmError::Decode(e.to_string()))?;
    let content = reply
        .content
        .into_iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text),
            ContentBlock::Other => None,
        })
        .collect::<String>();
    let (input_tokens, output_tokens) = reply.usage.map_or((0, 0), |u| (u.input_tokens, u.output_tokens));
    Ok(CompletionResponse {
        content,
        stop_reason: match reply.stop_reason.as_deref() {
            Some("max_tokens") => StopReason::MaxTokens,
            _ => StopReason::EndTurn,
        },
        input_tokens,
        output_tokens,
    })
}

/// Map a non-2xx status onto the transport taxonomy. 529 is Anthropic's
/// "overloaded" and is treated like a rate limit.
fn classify_status(status: u16, retry_after: Option<Duration>, body: &str) -> LlmError {
    match status {
        429 | 529 => LlmError::RateLimited { retry_after },
        408 | 504 => LlmError::Timeout,
        _ => LlmError::Api { status, message: body.chars().take(ERROR_BODY_CHARS).collect() },
    }
}

/// Longest `Retry-After` hint honoured.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// `Retry-After` in (possibly fractional) seconds, clamped to
/// [`MAX_RETRY_AFTER`]. Negative, non-finite and HTTP-date values are ignored
/// and fall back to the runner's own backoff.
fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let secs: f64 = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?.trim().parse().ok()?;
    if !secs.is_finite() {
        return None;
    }
    Duration::try_from_secs_f64(secs.min(MAX_RETRY_AFTER.as_secs_f64())).ok()
}

fn transport_error(e: reqwest::Error) -> LlmError {
    if e.is_timeout() {
        LlmError::Timeout
    } else if e.is_decode() {
        LlmError::Decode(e.to_string())
    } else {
        LlmError::Connection(e.to_string())
    }
}

/// Provider backed by a hosted model endpoint.
pub struct HttpProvider {
    settings: HttpSettings,
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn new(settings: HttpSettings) -> Self {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "http client builder failed, using defaults");
                reqwest::Client::new()
            });
        Self { settings, client }
    }

    fn endpoint(&self) -> String {
        format!("{}{}", self.settings.base_url, self.settings.wire.path())
    }

    async fn send(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let model = request.model.as_deref().unwrap_or(&self.settings.model);
        let builder = self.client.post(self.endpoint());
        let builder = match self.settings.wire {
            Wire::ChatCompletions => builder.bearer_auth(&self.settings.api_key).json(&chat_body(model, &request)),
            Wire::Messages => builder
                .header("x-api-key", &self.settings.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&messages_body(model, &request)),
        };

        let resp = builder.send().await.map_err(transport_error)?;
        let status = resp.status();
        let hint = retry_after(resp.headers());
        let raw = resp.text().await.map_err(transport_error)?;
        if !status.is_success() {
            tracing::debug!(status = status.as_u16(), model, "model endpoint returned an error");
            return Err(classify_status(status.as_u16(), hint, &raw));
        }
        match self.settings.wire {
            Wire::ChatCompletions => parse_chat_reply(&raw),
            Wire::Messages => parse_messages_reply(&raw),
        }
    }
}

impl LlmProvider for HttpProvider {
    fn name(&self) -> &str {
        match self.settings.wire {
            Wire::ChatCompletions => "chat-completions",
            Wire::Messages => "messages",
        }
    }

    fn complete(
        &self,
        request: CompletionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CompletionResponse, LlmError>> + Send + '_>> {
        Box::pin(self.send(request))
    }
}

/// Provider from `OUTREACH_LLM_MODEL` and `OUTREACH_LLM_API_KEY`, with an
/// optional `OUTREACH_LLM_BASE_URL`. `None` when model or key is missing.
pub fn from_env() -> Option<HttpProvider> {
    let model = std::env::var("OUTREACH_LLM_MODEL").ok()?;
    let api_key = std::env::var("OUTREACH_LLM_API_KEY").ok()?;
    let mut settings = HttpSettings::new(model, api_key);
    if let Ok(base_url) = std::env::var("OUTREACH_LLM_BASE_URL") {
        settings = settings.with_base_url(base_url);
    }
    Some(HttpProvider::new(settings))
}
