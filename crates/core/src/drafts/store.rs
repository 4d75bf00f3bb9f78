use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{StoreError, poisoned};
use crate::types::{
    AutoSendAction, Channel, Draft, DraftStatus, NotificationMeta, ResponseDisposition, SentMessage,
};

/// Fields supplied when the pipeline first creates a draft.
#[derive(Debug, Clone)]
pub struct NewDraft {
    pub workspace_id: String,
    pub lead_id: String,
    pub trigger_message_id: String,
    pub channel: Channel,
    pub content: String,
    /// Pipeline run that produced the draft. A run gets at most one draft.
    pub run_id: Option<Uuid>,
}

/// The auto-send verdict for one draft.
#[derive(Debug, Clone, PartialEq)]
pub struct AutoSendDecision {
    pub action: AutoSendAction,
    pub confidence: Option<f64>,
    pub threshold: f64,
    pub reason: String,
    pub evaluated_at: DateTime<Utc>,
}

/// Guard on the stored action for a conditional decision write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteCondition {
    /// Apply unless a terminal send action is already stored.
    NotTerminalSend,
    /// Apply only while no action is stored.
    Unset,
}

impl WriteCondition {
    pub fn for_action(action: AutoSendAction) -> Self {
        if action.is_terminal_send() { Self::NotTerminalSend } else { Self::Unset }
    }

    pub fn allows(&self, stored: Option<AutoSendAction>) -> bool {
        match self {
            Self::NotTerminalSend => !stored.is_some_and(|a| a.is_terminal_send()),
            Self::Unset => stored.is_none(),
        }
    }
}

/// A draft stuck in `sending` with the latest message sent for it.
#[derive(Debug, Clone)]
pub struct StaleDraft {
    pub draft: Draft,
    pub last_sent: Option<SentMessage>,
}

/// A draft the stale sweep could not process.
#[derive(Debug, Clone, Serialize)]
pub struct DraftFailure {
    pub draft_id: Uuid,
    pub error: String,
}

/// Draft persistence. Decision and recovery writes are conditional so they
/// stay correct across independent processes without row locks.
#[async_trait]
pub trait DraftStore: Send + Sync {
    /// Insert a pending draft. Creating again for the same `run_id` returns
    /// the draft already stored for that run.
    async fn create(&self, draft: &NewDraft, now: DateTime<Utc>) -> Result<Draft, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Draft>, StoreError>;

    async fn update_content(&self, id: Uuid, content: &str, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Store the decision if `condition` holds for the stored action.
    /// Returns false when the guard rejected the write.
    async fn record_auto_send(
        &self,
        id: Uuid,
        decision: &AutoSendDecision,
        condition: WriteCondition,
    ) -> Result<bool, StoreError>;

    async fn set_notification(
        &self,
        id: Uuid,
        meta: &NotificationMeta,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Drafts in `sending` last updated before `updated_before`, oldest first.
    /// A row that cannot be decoded comes back as a failure for that draft
    /// and does not hide the rest of the batch.
    async fn find_stale_sending(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Result<StaleDraft, DraftFailure>>, StoreError>;

    /// Move a `sending` draft to `approved` with `disposition`. Returns false
    /// if the draft had already left `sending`.
    async fn resolve_stale_sending(
        &self,
        id: Uuid,
        disposition: ResponseDisposition,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
}

#[derive(Debug, Default)]
struct Tables {
    drafts: HashMap<Uuid, Draft>,
    by_run: HashMap<Uuid, Uuid>,
    sent: Vec<(Uuid, SentMessage)>,
}

/// In-memory draft store for tests and ephemeral mode.
#[derive(Debug, Default)]
pub struct InMemoryDraftStore {
    tables: Mutex<Tables>,
}

impl InMemoryDraftStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tables.lock().map(|t| t.drafts.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record an outbound message sent for `draft_id`.
    pub fn record_sent(&self, draft_id: Uuid, message: SentMessage) -> Result<(), StoreError> {
        self.tables.lock().map_err(poisoned)?.sent.push((draft_id, message));
        Ok(())
    }

    /// Force a status, as the sender or a reviewer would.
    pub fn set_status(&self, id: Uuid, status: DraftStatus, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut t = self.tables.lock().map_err(poisoned)?;
        Ok(t.drafts.get_mut(&id).map(|d| {
            d.status = status;
            d.updated_at = now;
        }).is_some())
    }

    fn update(&self, id: Uuid, apply: impl FnOnce(&mut Draft) -> bool) -> Result<bool, StoreError> {
        let mut t = self.tables.lock().map_err(poisoned)?;
        Ok(t.drafts.get_mut(&id).is_some_and(apply))
    }
}

#[async_trait]
impl DraftStore for InMemoryDraftStore {
    async fn create(&self, draft: &NewDraft, now: DateTime<Utc>) -> Result<Draft, StoreError> {
        let mut t = self.tables.lock().map_err(poisoned)?;
        if let Some(existing) = draft.run_id.and_then(|run| t.by_run.get(&run)).and_then(|id| t.drafts.get(id)) {
            return Ok(existing.clone());
        }
        let row = Draft {
            id: Uuid::new_v4(),
            workspace_id: draft.workspace_id.clone(),
            lead_id: draft.lead_id.clone(),
            trigger_message_id: draft.trigger_message_id.clone(),
            channel: draft.channel,
            content: draft.content.clone(),
            status: DraftStatus::Pending,
            auto_send_action: None,
            auto_send_confidence: None,
            auto_send_threshold: None,
            auto_send_reason: None,
            auto_send_evaluated_at: None,
            notification: None,
            response_disposition: None,
            created_at: now,
            updated_at: now,
        };
        if let Some(run) = draft.run_id {
            t.by_run.insert(run, row.id);
        }
        t.drafts.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Draft>, StoreError> {
        Ok(self.tables.lock().map_err(poisoned)?.drafts.get(&id).cloned())
    }

    async fn update_content(&self, id: Uuid, content: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        self.update(id, |d| {
            d.content = content.to_owned();
            d.updated_at = now;
            true
        })
    }

    async fn record_auto_send(
        &self,
        id: Uuid,
        decision: &AutoSendDecision,
        condition: WriteCondition,
    ) -> Result<bool, StoreError> {
        self.update(id, |d| {
            if !condition.allows(d.auto_send_action) {
                return false;
            }
            d.auto_send_action = Some(decision.action);
            d.auto_send_confidence = decision.confidence;
            d.auto_send_threshold = Some(decision.threshold);
            d.auto_send_reason = Some(decision.reason.clone());
            d.auto_send_evaluated_at = Some(decision.evaluated_at);
            d.updated_at = decision.evaluated_at;
            true
        })
    }

    async fn set_notification(
        &self,
        id: Uuid,
        meta: &NotificationMeta,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.update(id, |d| {
            d.notification = Some(meta.clone());
            d.updated_at = now;
            true
        })
    }

    async fn find_stale_sending(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Result<StaleDraft, DraftFailure>>, StoreError> {
        let t = self.tables.lock().map_err(poisoned)?;
        let mut stale: Vec<&Draft> = t
            .drafts
            .values()
            .filter(|d| d.status == DraftStatus::Sending && d.updated_at < updated_before)
            .collect();
        stale.sort_by_key(|d| d.updated_at);
        Ok(stale
            .into_iter()
            .take(limit)
            .map(|d| {
                let last_sent = t
                    .sent
                    .iter()
                    .filter(|(draft_id, _)| *draft_id == d.id)
                    .map(|(_, m)| m)
                    .max_by_key(|m| m.sent_at)
                    .cloned();
                Ok(StaleDraft { draft: d.clone(), last_sent })
            })
            .collect())
    }

    async fn resolve_stale_sending(
        &self,
        id: Uuid,
        disposition: ResponseDisposition,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.update(id, |d| {
            if d.status != DraftStatus::Sending {
                return false;
            }
            d.status = DraftStatus::Approved;
            d.response_disposition = Some(disposition);
            d.updated_at = now;
            true
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_draft() -> NewDraft {
        NewDraft {
            workspace_id: "w1".into(),
            lead_id: "l1".into(),
            trigger_message_id: "m1".into(),
            channel: Channel::Email,
            content: "hi".into(),
            run_id: None,
        }
    }

    fn decision(action: AutoSendAction) -> AutoSendDecision {
        AutoSendDecision {
            action,
            confidence: Some(0.9),
            threshold: 0.85,
            reason: "scripted".into(),
            evaluated_at: Utc::now(),
        }
    }

    #[test]
    fn write_conditions() {
        use AutoSendAction::*;
        assert!(WriteCondition::NotTerminalSend.allows(None));
        assert!(WriteCondition::NotTerminalSend.allows(Some(Skip)));
        assert!(!WriteCondition::NotTerminalSend.allows(Some(SendDelayed)));
        assert!(WriteCondition::Unset.allows(None));
        assert!(!WriteCondition::Unset.allows(Some(NeedsReview)));
        assert_eq!(WriteCondition::for_action(SendImmediate), WriteCondition::NotTerminalSend);
        assert_eq!(WriteCondition::for_action(Error), WriteCondition::Unset);
    }

    #[tokio::test]
    async fn send_is_never_downgraded() {
        let store = InMemoryDraftStore::new();
        let d = store.create(&new_draft(), Utc::now()).await.unwrap();
        let send = decision(AutoSendAction::SendImmediate);
        assert!(store.record_auto_send(d.id, &send, WriteCondition::NotTerminalSend).await.unwrap());
        let skip = decision(AutoSendAction::Skip);
        assert!(!store.record_auto_send(d.id, &skip, WriteCondition::Unset).await.unwrap());
        assert!(!store.record_auto_send(d.id, &send, WriteCondition::NotTerminalSend).await.unwrap());
        let stored = store.get(d.id).await.unwrap().unwrap();
        assert_eq!(stored.auto_send_action, Some(AutoSendAction::SendImmediate));
    }

    #[tokio::test]
    async fn create_is_idempotent_per_run() {
        let store = InMemoryDraftStore::new();
        let run_id = Uuid::new_v4();
        let first = store.create(&NewDraft { run_id: Some(run_id), ..new_draft() }, Utc::now()).await.unwrap();
        let again = NewDraft { run_id: Some(run_id), content: "retried".into(), ..new_draft() };
        let second = store.create(&again, Utc::now()).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.content, "hi");

        // Drafts outside a run are never merged.
        let a = store.create(&new_draft(), Utc::now()).await.unwrap();
        let b = store.create(&new_draft(), Utc::now()).await.unwrap();
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn stale_sending_is_resolved_once() {
        let store = InMemoryDraftStore::new();
        let t0 = Utc::now() - chrono::Duration::minutes(30);
        let d = store.create(&new_draft(), t0).await.unwrap();
        store.set_status(d.id, DraftStatus::Sending, t0).unwrap();

        let stale = store.find_stale_sending(Utc::now(), 10).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert!(stale[0].as_ref().unwrap().last_sent.is_none());

        let now = Utc::now();
        assert!(store.resolve_stale_sending(d.id, ResponseDisposition::Approved, now).await.unwrap());
        assert!(!store.resolve_stale_sending(d.id, ResponseDisposition::Edited, now).await.unwrap());
        let stored = store.get(d.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DraftStatus::Approved);
        assert_eq!(stored.response_disposition, Some(ResponseDisposition::Approved));
    }
}
