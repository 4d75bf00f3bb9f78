use std::sync::Arc;

use uuid::Uuid;

use super::store::{AutoSendDecision, DraftStore, WriteCondition};
use crate::error::StoreError;

/// Persists auto-send decisions with monotonic semantics: a terminal send
/// is never replaced, and non-send actions only fill an empty slot.
#[derive(Clone)]
pub struct AutoSendDecisionRecorder {
    drafts: Arc<dyn DraftStore>,
}

impl AutoSendDecisionRecorder {
    pub fn new(drafts: Arc<dyn DraftStore>) -> Self {
        Self { drafts }
    }

    /// Returns true if the decision was stored, false if an earlier decision
    /// won.
    pub async fn record(&self, draft_id: Uuid, decision: &AutoSendDecision) -> Result<bool, StoreError> {
        let condition = WriteCondition::for_action(decision.action);
        let applied = self.drafts.record_auto_send(draft_id, decision, condition).await?;
        if applied {
            tracing::info!(
                %draft_id,
                action = decision.action.as_db_str(),
                confidence = decision.confidence,
                threshold = decision.threshold,
                "auto-send decision recorded"
            );
        } else {
            tracing::info!(
                %draft_id,
                action = decision.action.as_db_str(),
                "auto-send decision not applied; draft already decided"
            );
        }
        Ok(applied)
    }
}
