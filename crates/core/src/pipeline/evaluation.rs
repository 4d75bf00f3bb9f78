//! Auto-send evaluation: schema-checked evaluator output.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use outreach_llm::provider::ReasoningEffort;

use super::stages::{PromptStages, RunContext, StageError};

/// Evaluator output that failed validation. Nothing partially parsed is
/// ever handed on.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvaluationError {
    #[error("no JSON object in output")]
    NoJson,
    #[error("malformed JSON: {0}")]
    Malformed(String),
    #[error("schema mismatch: {0}")]
    Schema(String),
    #[error("field `{field}`: {problem}")]
    Field { field: &'static str, problem: String },
}

/// Pull the first JSON object out of model output. Accepts bare JSON, fenced
/// blocks and objects wrapped in prose.
pub fn extract_json(raw: &str) -> Result<Value, EvaluationError> {
    let trimmed = raw.trim();
    let body = match trimmed.find("```") {
        Some(start) => {
            let after = &trimmed[start + 3..];
            let after = after.strip_prefix("json").unwrap_or(after);
            after.find("```").map_or(after, |end| &after[..end])
        }
        None => trimmed,
    };
    let (Some(open), Some(close)) = (body.find('{'), body.rfind('}')) else {
        return Err(EvaluationError::NoJson);
    };
    if close < open {
        return Err(EvaluationError::NoJson);
    }
    serde_json::from_str(&body[open..=close]).map_err(|e| EvaluationError::Malformed(e.to_string()))
}

/// Validated evaluator score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    /// In `[0, 1]`.
    pub confidence: f64,
    /// Policy or safety violation; never auto-sent or revised.
    pub hard_block: bool,
    pub reason: String,
}

impl Evaluation {
    /// Synthetic verdict for a draft that failed verification.
    pub fn blocked(reason: impl Into<String>) -> Self {
        Self { confidence: 0.0, hard_block: true, reason: reason.into() }
    }

    pub fn parse(raw: &str) -> Result<Self, EvaluationError> {
        Self::from_value(&extract_json(raw)?)
    }

    pub fn from_value(v: &Value) -> Result<Self, EvaluationError> {
        let obj = v
            .as_object()
            .ok_or_else(|| EvaluationError::Schema("expected an object".into()))?;

        let confidence = match obj.get("confidence") {
            Some(Value::Number(n)) => n.as_f64().ok_or_else(|| EvaluationError::Field {
                field: "confidence",
                problem: "not representable as f64".into(),
            })?,
            Some(other) => {
                return Err(EvaluationError::Field { field: "confidence", problem: format!("expected number, got {other}") });
            }
            None => return Err(EvaluationError::Field { field: "confidence", problem: "missing".into() }),
        };
        if !(0.0..=1.0).contains(&confidence) {
            return Err(EvaluationError::Field { field: "confidence", problem: format!("{confidence} outside [0, 1]") });
        }

        let hard_block = match obj.get("hardBlock") {
            Some(Value::Bool(b)) => *b,
            Some(other) => {
                return Err(EvaluationError::Field { field: "hardBlock", problem: format!("expected bool, got {other}") });
            }
            None => return Err(EvaluationError::Field { field: "hardBlock", problem: "missing".into() }),
        };

        let reason = match obj.get("reason") {
            Some(Value::String(s)) => s.clone(),
            None | Some(Value::Null) => String::new(),
            Some(other) => {
                return Err(EvaluationError::Field { field: "reason", problem: format!("expected string, got {other}") });
            }
        };

        Ok(Self { confidence, hard_block, reason })
    }
}

/// Scores a draft for auto-send.
#[async_trait]
pub trait DraftEvaluator: Send + Sync {
    async fn evaluate(&self, ctx: &RunContext, draft: &str) -> Result<Evaluation, StageError>;
}

const EVALUATE_PROMPT: &str = "You decide whether a sales reply can be sent without human review. \
Score your confidence that it is accurate, on-brand and answers the lead. Set hardBlock when it \
violates policy or could harm the lead relationship if sent. Respond with JSON only: \
{\"confidence\": number between 0 and 1, \"hardBlock\": bool, \"reason\": string}.";

#[async_trait]
impl DraftEvaluator for PromptStages {
    async fn evaluate(&self, ctx: &RunContext, draft: &str) -> Result<Evaluation, StageError> {
        let user = format!(
            "Lead message:\n{}\n\nContext:\n{}\n\nReply:\n{}",
            ctx.message.body,
            RunContext::render_chunks(&ctx.chunks),
            draft
        );
        let value: Value = self.ask(EVALUATE_PROMPT, user, Some(ReasoningEffort::Medium)).await?;
        Ok(Evaluation::from_value(&value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_json() {
        let e = Evaluation::parse("```json\n{\"confidence\": 0.92, \"hardBlock\": false, \"reason\": \"ok\"}\n```").unwrap();
        assert_eq!(e.confidence, 0.92);
        assert!(!e.hard_block);
    }

    #[test]
    fn parses_json_inside_prose() {
        let e = Evaluation::parse("Sure. {\"confidence\": 1, \"hardBlock\": true} Hope that helps").unwrap();
        assert_eq!(e.confidence, 1.0);
        assert!(e.hard_block);
        assert_eq!(e.reason, "");
    }

    #[test]
    fn rejects_partial_or_mistyped_output() {
        assert_eq!(Evaluation::parse("no json here"), Err(EvaluationError::NoJson));
        assert!(matches!(Evaluation::parse("{\"confidence\": 0.9"), Err(EvaluationError::NoJson)));
        assert!(matches!(Evaluation::parse("{\"confidence\": }"), Err(EvaluationError::Malformed(_))));
        assert!(matches!(
            Evaluation::parse("{\"confidence\": \"0.9\", \"hardBlock\": false}"),
            Err(EvaluationError::Field { field: "confidence", .. })
        ));
        assert!(matches!(
            Evaluation::parse("{\"confidence\": 0.9}"),
            Err(EvaluationError::Field { field: "hardBlock", .. })
        ));
        assert!(matches!(
            Evaluation::parse("{\"confidence\": 1.5, \"hardBlock\": false}"),
            Err(EvaluationError::Field { field: "confidence", .. })
        ));
        assert!(matches!(
            Evaluation::parse("{\"a\": 1}"),
            Err(EvaluationError::Field { field: "confidence", problem }) if problem == "missing"
        ));
    }
}
