use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use uuid::Uuid;

use super::store::PipelineStore;
use crate::error::StoreError;

/// Largest serialized artifact payload stored as-is.
pub const MAX_ARTIFACT_BYTES: usize = 32_768;

/// Artifact stage keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Strategy,
    DraftGeneration,
    Verification,
    MeetingOverseer,
    AutoSendEvaluation,
    /// One artifact per revision pass, iterations 1..
    AutoSendRevision,
    /// Singleton at iteration 0.
    AutoSendLoopSummary,
    LoopError,
    FinalDraft,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Strategy => "strategy",
            Self::DraftGeneration => "draft_generation",
            Self::Verification => "verification",
            Self::MeetingOverseer => "meeting_overseer",
            Self::AutoSendEvaluation => "auto_send_evaluation",
            Self::AutoSendRevision => "auto_send_revision",
            Self::AutoSendLoopSummary => "auto_send_loop_summary",
            Self::LoopError => "loop_error",
            Self::FinalDraft => "final_draft",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serialize `payload` for storage. Oversized or unserializable payloads
/// degrade to a small error marker instead of failing the write.
pub fn cap_payload<T: Serialize + ?Sized>(payload: &T) -> Value {
    let bytes = match serde_json::to_vec(payload) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(error = %e, "artifact payload not serializable");
            return json!({ "error": "payload_not_serializable" });
        }
    };
    if bytes.len() > MAX_ARTIFACT_BYTES {
        tracing::warn!(bytes = bytes.len(), max = MAX_ARTIFACT_BYTES, "artifact payload too large");
        return json!({
            "error": "payload_too_large",
            "bytes": bytes.len(),
            "maxBytes": MAX_ARTIFACT_BYTES,
        });
    }
    serde_json::from_slice(&bytes).unwrap_or_else(|_| json!({ "error": "payload_not_serializable" }))
}

/// True for payloads produced by [`cap_payload`]'s fallbacks.
pub fn is_error_marker(value: &Value) -> bool {
    matches!(
        value.get("error").and_then(Value::as_str),
        Some("payload_too_large" | "payload_not_serializable")
    )
}

/// Cap and upsert one artifact. Repeating the call for the same key
/// overwrites the previous payload.
pub async fn write_artifact<T: Serialize + ?Sized + Sync>(
    store: &dyn PipelineStore,
    run_id: Uuid,
    stage: Stage,
    iteration: i32,
    payload: &T,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let value = cap_payload(payload);
    store.upsert_artifact(run_id, stage.as_str(), iteration, value, now).await?;
    tracing::debug!(%run_id, stage = stage.as_str(), iteration, "artifact written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serializer;

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("nope"))
        }
    }

    #[test]
    fn small_payload_is_kept() {
        let v = cap_payload(&json!({ "content": "hi" }));
        assert_eq!(v["content"], "hi");
        assert!(!is_error_marker(&v));
    }

    #[test]
    fn oversized_payload_becomes_marker() {
        let big = "x".repeat(MAX_ARTIFACT_BYTES);
        let v = cap_payload(&json!({ "content": big }));
        assert_eq!(v["error"], "payload_too_large");
        assert_eq!(v["maxBytes"], 32_768);
        assert_eq!(v["bytes"], MAX_ARTIFACT_BYTES + 14);
        assert!(is_error_marker(&v));
    }

    #[test]
    fn payload_at_limit_is_kept() {
        // `"` + n bytes + `"` serializes to exactly the cap.
        let s = "y".repeat(MAX_ARTIFACT_BYTES - 2);
        let v = cap_payload(&s);
        assert_eq!(v.as_str().map(str::len), Some(MAX_ARTIFACT_BYTES - 2));
    }

    #[test]
    fn unserializable_payload_becomes_marker() {
        let v = cap_payload(&Unserializable);
        assert_eq!(v, json!({ "error": "payload_not_serializable" }));
    }
}
