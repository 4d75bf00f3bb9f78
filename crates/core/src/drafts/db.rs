use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::store::{AutoSendDecision, DraftFailure, DraftStore, NewDraft, StaleDraft, WriteCondition};
use crate::error::StoreError;
use crate::types::{
    AutoSendAction, Channel, Draft, DraftStatus, NotificationMeta, ResponseDisposition, SentBy, SentMessage,
};

const DRAFT_COLUMNS: &str = "d.id, d.workspace_id, d.lead_id, d.trigger_message_id, d.channel, d.content, \
     d.status, d.auto_send_action, d.auto_send_confidence, d.auto_send_threshold, d.auto_send_reason, \
     d.auto_send_evaluated_at, d.notification_channel_id, d.notification_message_ts, \
     d.response_disposition, d.created_at, d.updated_at";

/// Row type for sqlx deserialization from the `drafts` table, optionally
/// joined with the draft's latest `sent_messages` row.
#[derive(sqlx::FromRow)]
struct DraftRow {
    id: Uuid,
    workspace_id: String,
    lead_id: String,
    trigger_message_id: String,
    channel: String,
    content: String,
    status: String,
    auto_send_action: Option<String>,
    auto_send_confidence: Option<f64>,
    auto_send_threshold: Option<f64>,
    auto_send_reason: Option<String>,
    auto_send_evaluated_at: Option<DateTime<Utc>>,
    notification_channel_id: Option<String>,
    notification_message_ts: Option<String>,
    response_disposition: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DraftRow> for Draft {
    type Error = StoreError;

    fn try_from(row: DraftRow) -> Result<Self, Self::Error> {
        let id = row.id;
        let corrupt = |field: &str, value: &str| StoreError::corrupt(format!("draft {id} has {field} {value}"));

        let channel = Channel::from_db(&row.channel).ok_or_else(|| corrupt("channel", &row.channel))?;
        let status = DraftStatus::from_db(&row.status).ok_or_else(|| corrupt("status", &row.status))?;
        let auto_send_action = row
            .auto_send_action
            .as_deref()
            .map(|a| AutoSendAction::from_db(a).ok_or_else(|| corrupt("auto_send_action", a)))
            .transpose()?;
        let response_disposition = row
            .response_disposition
            .as_deref()
            .map(|r| ResponseDisposition::from_db(r).ok_or_else(|| corrupt("response_disposition", r)))
            .transpose()?;
        let notification = match (row.notification_channel_id, row.notification_message_ts) {
            (Some(channel_id), Some(message_ts)) => Some(NotificationMeta { channel_id, message_ts }),
            _ => None,
        };

        Ok(Self {
            id,
            workspace_id: row.workspace_id,
            lead_id: row.lead_id,
            trigger_message_id: row.trigger_message_id,
            channel,
            content: row.content,
            status,
            auto_send_action,
            auto_send_confidence: row.auto_send_confidence,
            auto_send_threshold: row.auto_send_threshold,
            auto_send_reason: row.auto_send_reason,
            auto_send_evaluated_at: row.auto_send_evaluated_at,
            notification,
            response_disposition,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct StaleRow {
    #[sqlx(flatten)]
    draft: DraftRow,
    sent_body: Option<String>,
    sent_by: Option<String>,
    sent_at: Option<DateTime<Utc>>,
}

impl TryFrom<StaleRow> for StaleDraft {
    type Error = StoreError;

    fn try_from(row: StaleRow) -> Result<Self, Self::Error> {
        let last_sent = match (row.sent_body, row.sent_by, row.sent_at) {
            (Some(body), Some(sent_by), Some(sent_at)) => {
                Some(SentMessage { body, sent_by: SentBy::from_db(&sent_by), sent_at })
            }
            _ => None,
        };
        Ok(Self { draft: Draft::try_from(row.draft)?, last_sent })
    }
}

/// Decode each row on its own so one corrupt draft only fails itself.
fn decode_stale(rows: Vec<StaleRow>) -> Vec<Result<StaleDraft, DraftFailure>> {
    rows.into_iter()
        .map(|row| {
            let draft_id = row.draft.id;
            StaleDraft::try_from(row).map_err(|e| DraftFailure { draft_id, error: e.to_string() })
        })
        .collect()
}

/// Insert a draft, or return the id of the draft already created for the
/// same run.
pub async fn insert(pool: &PgPool, draft: &NewDraft, now: DateTime<Utc>) -> Result<Uuid, sqlx::Error> {
    sqlx::query_scalar(
        "INSERT INTO drafts (id, run_id, workspace_id, lead_id, trigger_message_id, channel, content, status, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', $8, $8)
         ON CONFLICT (run_id) DO UPDATE SET run_id = EXCLUDED.run_id
         RETURNING id"
    )
    .bind(Uuid::new_v4())
    .bind(draft.run_id)
    .bind(&draft.workspace_id)
    .bind(&draft.lead_id)
    .bind(&draft.trigger_message_id)
    .bind(draft.channel.as_db_str())
    .bind(&draft.content)
    .bind(now)
    .fetch_one(pool)
    .await
}

async fn fetch(pool: &PgPool, id: Uuid) -> Result<Option<DraftRow>, sqlx::Error> {
    sqlx::query_as(&format!("SELECT {DRAFT_COLUMNS} FROM drafts d WHERE d.id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn update_content(pool: &PgPool, id: Uuid, content: &str, now: DateTime<Utc>) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("UPDATE drafts SET content = $2, updated_at = $3 WHERE id = $1")
        .bind(id)
        .bind(content)
        .bind(now)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Conditional decision write. The guard lives in the WHERE clause so two
/// processes racing on one draft cannot downgrade a stored send.
pub async fn update_auto_send(
    pool: &PgPool,
    id: Uuid,
    decision: &AutoSendDecision,
    condition: WriteCondition,
) -> Result<bool, sqlx::Error> {
    let guard = match condition {
        WriteCondition::NotTerminalSend => {
            "(auto_send_action IS NULL OR auto_send_action NOT IN ('send_immediate', 'send_delayed'))"
        }
        WriteCondition::Unset => "auto_send_action IS NULL",
    };
    let result = sqlx::query(&format!(
        "UPDATE drafts
         SET auto_send_action = $2, auto_send_confidence = $3, auto_send_threshold = $4,
             auto_send_reason = $5, auto_send_evaluated_at = $6, updated_at = $6
         WHERE id = $1 AND {guard}"
    ))
    .bind(id)
    .bind(decision.action.as_db_str())
    .bind(decision.confidence)
    .bind(decision.threshold)
    .bind(&decision.reason)
    .bind(decision.evaluated_at)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn update_notification(
    pool: &PgPool,
    id: Uuid,
    meta: &NotificationMeta,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE drafts SET notification_channel_id = $2, notification_message_ts = $3, updated_at = $4 WHERE id = $1"
    )
    .bind(id)
    .bind(&meta.channel_id)
    .bind(&meta.message_ts)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

async fn fetch_stale_sending(
    pool: &PgPool,
    updated_before: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<StaleRow>, sqlx::Error> {
    sqlx::query_as(&format!(
        "SELECT {DRAFT_COLUMNS}, s.body AS sent_body, s.sent_by, s.sent_at
         FROM drafts d
         LEFT JOIN LATERAL (
             SELECT body, sent_by, sent_at FROM sent_messages
             WHERE draft_id = d.id
             ORDER BY sent_at DESC
             LIMIT 1
         ) s ON TRUE
         WHERE d.status = 'sending' AND d.updated_at < $1
         ORDER BY d.updated_at
         LIMIT $2"
    ))
    .bind(updated_before)
    .bind(limit)
    .fetch_all(pool)
    .await
}

pub async fn resolve_sending(
    pool: &PgPool,
    id: Uuid,
    disposition: ResponseDisposition,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE drafts SET status = 'approved', response_disposition = $2, updated_at = $3
         WHERE id = $1 AND status = 'sending'"
    )
    .bind(id)
    .bind(disposition.as_db_str())
    .bind(now)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// [`DraftStore`] over the `drafts` and `sent_messages` tables.
#[derive(Debug, Clone)]
pub struct PgDraftStore {
    pool: PgPool,
}

impl PgDraftStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DraftStore for PgDraftStore {
    async fn create(&self, draft: &NewDraft, now: DateTime<Utc>) -> Result<Draft, StoreError> {
        let id = insert(&self.pool, draft, now).await?;
        self.get(id).await?.ok_or_else(|| StoreError::not_found(format!("draft {id}")))
    }

    async fn get(&self, id: Uuid) -> Result<Option<Draft>, StoreError> {
        fetch(&self.pool, id).await?.map(Draft::try_from).transpose()
    }

    async fn update_content(&self, id: Uuid, content: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        Ok(update_content(&self.pool, id, content, now).await?)
    }

    async fn record_auto_send(
        &self,
        id: Uuid,
        decision: &AutoSendDecision,
        condition: WriteCondition,
    ) -> Result<bool, StoreError> {
        Ok(update_auto_send(&self.pool, id, decision, condition).await?)
    }

    async fn set_notification(
        &self,
        id: Uuid,
        meta: &NotificationMeta,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        Ok(update_notification(&self.pool, id, meta, now).await?)
    }

    async fn find_stale_sending(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Result<StaleDraft, DraftFailure>>, StoreError> {
        let rows = fetch_stale_sending(&self.pool, updated_before, limit as i64).await?;
        Ok(decode_stale(rows))
    }

    async fn resolve_stale_sending(
        &self,
        id: Uuid,
        disposition: ResponseDisposition,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        Ok(resolve_sending(&self.pool, id, disposition, now).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(status: &str) -> StaleRow {
        let now = Utc::now();
        StaleRow {
            draft: DraftRow {
                id: Uuid::new_v4(),
                workspace_id: "w1".into(),
                lead_id: "l1".into(),
                trigger_message_id: "m1".into(),
                channel: "email".into(),
                content: "See you Tuesday".into(),
                status: status.into(),
                auto_send_action: None,
                auto_send_confidence: None,
                auto_send_threshold: None,
                auto_send_reason: None,
                auto_send_evaluated_at: None,
                notification_channel_id: None,
                notification_message_ts: None,
                response_disposition: None,
                created_at: now,
                updated_at: now,
            },
            sent_body: Some("See you Tuesday".into()),
            sent_by: Some("setter".into()),
            sent_at: Some(now),
        }
    }

    #[test]
    fn corrupt_stale_row_fails_alone() {
        let bad = row("shipped");
        let bad_id = bad.draft.id;
        let decoded = decode_stale(vec![bad, row("sending")]);

        assert_eq!(decoded.len(), 2);
        let failure = decoded[0].as_ref().unwrap_err();
        assert_eq!(failure.draft_id, bad_id);
        assert!(failure.error.contains("shipped"));
        let ok = decoded[1].as_ref().unwrap();
        assert_eq!(ok.draft.status, DraftStatus::Sending);
        assert!(ok.last_sent.is_some());
    }
}
