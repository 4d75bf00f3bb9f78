//! Reviewer notification hook, informed once a draft's decision is stored.

use async_trait::async_trait;

use crate::drafts::AutoSendDecision;
use crate::types::{Draft, NotificationMeta};

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notification rejected: {0}")]
    Rejected(String),
    #[error("notification transport failed: {0}")]
    Transport(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Announce a decided draft. Returns where the notification landed, if
    /// the transport has such a notion.
    async fn draft_decided(
        &self,
        draft: &Draft,
        decision: &AutoSendDecision,
    ) -> Result<Option<NotificationMeta>, NotifyError>;
}

/// Notifier that only logs; used when no chat integration is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn draft_decided(
        &self,
        draft: &Draft,
        decision: &AutoSendDecision,
    ) -> Result<Option<NotificationMeta>, NotifyError> {
        tracing::info!(
            draft_id = %draft.id,
            lead_id = %draft.lead_id,
            action = decision.action.as_db_str(),
            confidence = decision.confidence,
            "draft ready"
        );
        Ok(None)
    }
}
