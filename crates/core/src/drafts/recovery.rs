//! Reconciles drafts left in `sending` after the send finished elsewhere.

use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;

use super::store::{DraftFailure, DraftStore};
use crate::clock::Clock;
use crate::error::StoreError;
use crate::types::{ResponseDisposition, SentBy, SentMessage};

/// Classify a sent message against its draft. Any byte difference, including
/// whitespace, counts as an edit; automated sends are always `AUTO_SENT`.
pub fn disposition(draft_content: &str, sent: &SentMessage) -> ResponseDisposition {
    match sent.sent_by {
        SentBy::Ai => ResponseDisposition::AutoSent,
        _ if sent.body == draft_content => ResponseDisposition::Approved,
        _ => ResponseDisposition::Edited,
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub resolved: usize,
    /// Drafts another writer moved out of `sending` first.
    pub already_resolved: usize,
    pub missing_message: usize,
    pub errors: Vec<DraftFailure>,
}

pub struct StaleDraftRecovery {
    drafts: Arc<dyn DraftStore>,
    clock: Arc<dyn Clock>,
    stale_after: Duration,
    batch: usize,
}

impl StaleDraftRecovery {
    pub fn new(drafts: Arc<dyn DraftStore>, clock: Arc<dyn Clock>, stale_after: Duration, batch: usize) -> Self {
        Self { drafts, clock, stale_after, batch }
    }

    /// One pass over stale `sending` drafts. Per-draft failures are collected
    /// and never abort the batch; only the initial scan can fail.
    pub async fn sweep(&self) -> Result<SweepReport, StoreError> {
        let now = self.clock.now();
        let stale = self.drafts.find_stale_sending(now - self.stale_after, self.batch).await?;
        let mut report = SweepReport { scanned: stale.len(), ..SweepReport::default() };

        for item in stale {
            let item = match item {
                Ok(item) => item,
                Err(failure) => {
                    tracing::warn!(draft_id = %failure.draft_id, error = %failure.error, "stale draft unreadable");
                    report.errors.push(failure);
                    continue;
                }
            };
            let draft_id = item.draft.id;
            let Some(sent) = item.last_sent else {
                tracing::debug!(%draft_id, "stale draft has no sent message");
                report.missing_message += 1;
                continue;
            };
            let disposition = disposition(&item.draft.content, &sent);
            match self.drafts.resolve_stale_sending(draft_id, disposition, now).await {
                Ok(true) => {
                    tracing::info!(%draft_id, disposition = disposition.as_db_str(), "stale draft resolved");
                    report.resolved += 1;
                }
                Ok(false) => report.already_resolved += 1,
                Err(e) => {
                    tracing::warn!(%draft_id, error = %e, "failed to resolve stale draft");
                    report.errors.push(DraftFailure { draft_id, error: e.to_string() });
                }
            }
        }

        if report.scanned > 0 {
            tracing::info!(
                scanned = report.scanned,
                resolved = report.resolved,
                already_resolved = report.already_resolved,
                missing_message = report.missing_message,
                errors = report.errors.len(),
                "stale draft sweep finished"
            );
        }
        Ok(report)
    }
}
