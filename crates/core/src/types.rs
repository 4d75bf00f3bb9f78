use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Conversation types ─────────────────────────────────────────

/// Outreach channel a message arrived on and a reply goes out through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
    Linkedin,
}

impl Channel {
    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "email" => Some(Self::Email),
            "sms" => Some(Self::Sms),
            "linkedin" => Some(Self::Linkedin),
            _ => None,
        }
    }

    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Sms => "sms",
            Self::Linkedin => "linkedin",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_db_str())
    }
}

/// An inbound lead message that triggers draft generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    pub workspace_id: String,
    pub lead_id: String,
    pub channel: Channel,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

/// Kind of a lead-context chunk. Summary chunks condense their group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    Summary,
    Detail,
}

/// A unit of lead context (thread excerpt, note, knowledge-base passage)
/// that can ground a revision prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextChunk {
    pub id: String,
    /// Source group, e.g. the thread or document the chunk came from.
    pub group: String,
    pub kind: ChunkKind,
    pub text: String,
}

// ── Job types ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "SUCCEEDED" => Some(Self::Succeeded),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

// ── Pipeline types ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Aborted,
}

impl RunStatus {
    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "RUNNING" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "ABORTED" => Some(Self::Aborted),
            _ => None,
        }
    }

    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Aborted => "ABORTED",
        }
    }
}

/// One pipeline execution for a (trigger message, channel) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub trigger_message_id: String,
    pub channel: Channel,
    pub draft_id: Option<Uuid>,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
}

/// Persisted snapshot of one stage/iteration output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineArtifact {
    pub run_id: Uuid,
    pub stage: String,
    pub iteration: i32,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ── Draft types ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftStatus {
    Pending,
    Sending,
    Approved,
    Rejected,
}

impl DraftStatus {
    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "sending" => Some(Self::Sending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

/// Auto-send decision for a draft.
/// `send_immediate` and `send_delayed` are terminal: once stored they are never
/// replaced by a non-send action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoSendAction {
    SendImmediate,
    SendDelayed,
    NeedsReview,
    Skip,
    Error,
}

impl AutoSendAction {
    pub const TERMINAL_SENDS: [AutoSendAction; 2] = [Self::SendImmediate, Self::SendDelayed];

    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "send_immediate" => Some(Self::SendImmediate),
            "send_delayed" => Some(Self::SendDelayed),
            "needs_review" => Some(Self::NeedsReview),
            "skip" => Some(Self::Skip),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::SendImmediate => "send_immediate",
            Self::SendDelayed => "send_delayed",
            Self::NeedsReview => "needs_review",
            Self::Skip => "skip",
            Self::Error => "error",
        }
    }

    pub fn is_terminal_send(&self) -> bool {
        Self::TERMINAL_SENDS.contains(self)
    }
}

/// How a sent message relates to the draft it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseDisposition {
    AutoSent,
    Approved,
    Edited,
}

impl ResponseDisposition {
    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "AUTO_SENT" => Some(Self::AutoSent),
            "APPROVED" => Some(Self::Approved),
            "EDITED" => Some(Self::Edited),
            _ => None,
        }
    }

    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::AutoSent => "AUTO_SENT",
            Self::Approved => "APPROVED",
            Self::Edited => "EDITED",
        }
    }
}

/// Where the reviewer notification for a draft was posted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMeta {
    pub channel_id: String,
    pub message_ts: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    pub id: Uuid,
    pub workspace_id: String,
    pub lead_id: String,
    pub trigger_message_id: String,
    pub channel: Channel,
    pub content: String,
    pub status: DraftStatus,
    pub auto_send_action: Option<AutoSendAction>,
    pub auto_send_confidence: Option<f64>,
    pub auto_send_threshold: Option<f64>,
    pub auto_send_reason: Option<String>,
    pub auto_send_evaluated_at: Option<DateTime<Utc>>,
    pub notification: Option<NotificationMeta>,
    pub response_disposition: Option<ResponseDisposition>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Who put an outbound message on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SentBy {
    /// The automated sender.
    Ai,
    /// A human setter.
    Setter,
    Other(String),
}

impl SentBy {
    pub fn from_db(s: &str) -> Self {
        match s {
            "ai" => Self::Ai,
            "setter" => Self::Setter,
            other => Self::Other(other.to_owned()),
        }
    }
}

/// Most recent outbound message linked to a draft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentMessage {
    pub body: String,
    pub sent_by: SentBy,
    pub sent_at: DateTime<Utc>,
}

// ── Revision loop types ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStopReason {
    ThresholdMet,
    HardBlock,
    NoImprovement,
    Timeout,
    Exhausted,
    Error,
}

impl LoopStopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ThresholdMet => "threshold_met",
            Self::HardBlock => "hard_block",
            Self::NoImprovement => "no_improvement",
            Self::Timeout => "timeout",
            Self::Exhausted => "exhausted",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for LoopStopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome record of one revision loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionLoopSummary {
    pub stop_reason: LoopStopReason,
    pub iterations_used: u32,
    pub threshold: f64,
    pub start_confidence: f64,
    pub end_confidence: f64,
    pub delta_confidence: f64,
    pub cache_hits: u32,
    pub elapsed_ms: u64,
    pub channel: Channel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_strings_roundtrip() {
        for c in [Channel::Email, Channel::Sms, Channel::Linkedin] {
            assert_eq!(Channel::from_db(c.as_db_str()), Some(c));
        }
        for s in [JobStatus::Pending, JobStatus::Running, JobStatus::Succeeded, JobStatus::Failed] {
            assert_eq!(JobStatus::from_db(s.as_db_str()), Some(s));
        }
        for s in [RunStatus::Running, RunStatus::Completed, RunStatus::Failed, RunStatus::Aborted] {
            assert_eq!(RunStatus::from_db(s.as_db_str()), Some(s));
        }
        for a in [
            AutoSendAction::SendImmediate,
            AutoSendAction::SendDelayed,
            AutoSendAction::NeedsReview,
            AutoSendAction::Skip,
            AutoSendAction::Error,
        ] {
            assert_eq!(AutoSendAction::from_db(a.as_db_str()), Some(a));
        }
        assert_eq!(DraftStatus::from_db("nope"), None);
    }

    #[test]
    fn only_send_actions_are_terminal() {
        assert!(AutoSendAction::SendImmediate.is_terminal_send());
        assert!(AutoSendAction::SendDelayed.is_terminal_send());
        assert!(!AutoSendAction::NeedsReview.is_terminal_send());
        assert!(!AutoSendAction::Skip.is_terminal_send());
        assert!(!AutoSendAction::Error.is_terminal_send());
    }

    #[test]
    fn summary_serializes_camel_case() {
        let s = RevisionLoopSummary {
            stop_reason: LoopStopReason::NoImprovement,
            iterations_used: 1,
            threshold: 0.85,
            start_confidence: 0.4,
            end_confidence: 0.42,
            delta_confidence: 0.02,
            cache_hits: 0,
            elapsed_ms: 12,
            channel: Channel::Email,
            error: None,
        };
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["stopReason"], "no_improvement");
        assert_eq!(v["iterationsUsed"], 1);
        assert!(v.get("error").is_none());
    }

    #[test]
    fn sent_by_parses_known_senders() {
        assert_eq!(SentBy::from_db("ai"), SentBy::Ai);
        assert_eq!(SentBy::from_db("setter"), SentBy::Setter);
        assert_eq!(SentBy::from_db("zap"), SentBy::Other("zap".into()));
    }
}
