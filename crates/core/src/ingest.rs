//! Entry point for inbound lead messages.

use crate::error::StoreError;
use crate::jobs::{AI_DRAFT_PIPELINE, EnqueueOutcome, JobQueue};
use crate::types::InboundMessage;

/// Queue the draft pipeline for an inbound message. Webhook redeliveries
/// map onto the same dedupe key and come back with `enqueued == false`.
pub async fn on_inbound_message(queue: &JobQueue, message: &InboundMessage) -> Result<EnqueueOutcome, StoreError> {
    let outcome = queue
        .enqueue(AI_DRAFT_PIPELINE, &message.workspace_id, &message.lead_id, &message.id, None, None)
        .await?;
    if outcome.enqueued {
        tracing::info!(message_id = %message.id, dedupe_key = %outcome.dedupe_key, "draft pipeline queued");
    } else {
        tracing::debug!(message_id = %message.id, dedupe_key = %outcome.dedupe_key, "draft pipeline already queued");
    }
    Ok(outcome)
}
