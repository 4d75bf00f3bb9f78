//! Read side of the CRM the pipeline drafts against: inbound messages and
//! per-lead context chunks.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::{StoreError, poisoned};
use crate::types::{Channel, ChunkKind, ContextChunk, InboundMessage};

#[async_trait]
pub trait ConversationSource: Send + Sync {
    async fn inbound_message(&self, message_id: &str) -> Result<Option<InboundMessage>, StoreError>;

    /// Every context chunk known for a lead, summaries included.
    async fn context_chunks(&self, workspace_id: &str, lead_id: &str) -> Result<Vec<ContextChunk>, StoreError>;
}

#[derive(Debug, Default)]
struct Conversations {
    messages: HashMap<String, InboundMessage>,
    chunks: HashMap<(String, String), Vec<ContextChunk>>,
}

/// In-memory source for tests and ephemeral mode.
#[derive(Debug, Default)]
pub struct InMemoryConversationSource {
    inner: Mutex<Conversations>,
}

impl InMemoryConversationSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_message(&self, message: InboundMessage) -> Result<(), StoreError> {
        self.inner.lock().map_err(poisoned)?.messages.insert(message.id.clone(), message);
        Ok(())
    }

    pub fn add_chunk(&self, workspace_id: &str, lead_id: &str, chunk: ContextChunk) -> Result<(), StoreError> {
        self.inner
            .lock()
            .map_err(poisoned)?
            .chunks
            .entry((workspace_id.to_owned(), lead_id.to_owned()))
            .or_default()
            .push(chunk);
        Ok(())
    }
}

#[async_trait]
impl ConversationSource for InMemoryConversationSource {
    async fn inbound_message(&self, message_id: &str) -> Result<Option<InboundMessage>, StoreError> {
        Ok(self.inner.lock().map_err(poisoned)?.messages.get(message_id).cloned())
    }

    async fn context_chunks(&self, workspace_id: &str, lead_id: &str) -> Result<Vec<ContextChunk>, StoreError> {
        let inner = self.inner.lock().map_err(poisoned)?;
        Ok(inner
            .chunks
            .get(&(workspace_id.to_owned(), lead_id.to_owned()))
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    workspace_id: String,
    lead_id: String,
    channel: String,
    body: String,
    received_at: DateTime<Utc>,
}

impl TryFrom<MessageRow> for InboundMessage {
    type Error = StoreError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(Self {
            channel: Channel::from_db(&row.channel)
                .ok_or_else(|| StoreError::corrupt(format!("message {} has channel {}", row.id, row.channel)))?,
            id: row.id,
            workspace_id: row.workspace_id,
            lead_id: row.lead_id,
            body: row.body,
            received_at: row.received_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ChunkRow {
    id: String,
    group_key: String,
    kind: String,
    text: String,
}

impl TryFrom<ChunkRow> for ContextChunk {
    type Error = StoreError;

    fn try_from(row: ChunkRow) -> Result<Self, Self::Error> {
        let kind = match row.kind.as_str() {
            "summary" => ChunkKind::Summary,
            "detail" => ChunkKind::Detail,
            other => return Err(StoreError::corrupt(format!("chunk {} has kind {other}", row.id))),
        };
        Ok(Self { id: row.id, group: row.group_key, kind, text: row.text })
    }
}

/// [`ConversationSource`] over the `inbound_messages` and
/// `lead_context_chunks` tables.
#[derive(Debug, Clone)]
pub struct PgConversationSource {
    pool: PgPool,
}

impl PgConversationSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConversationSource for PgConversationSource {
    async fn inbound_message(&self, message_id: &str) -> Result<Option<InboundMessage>, StoreError> {
        let row: Option<MessageRow> = sqlx::query_as(
            "SELECT id, workspace_id, lead_id, channel, body, received_at FROM inbound_messages WHERE id = $1",
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(InboundMessage::try_from).transpose()
    }

    async fn context_chunks(&self, workspace_id: &str, lead_id: &str) -> Result<Vec<ContextChunk>, StoreError> {
        let rows: Vec<ChunkRow> = sqlx::query_as(
            "SELECT id, group_key, kind, text FROM lead_context_chunks
             WHERE workspace_id = $1 AND lead_id = $2
             ORDER BY position, id",
        )
        .bind(workspace_id)
        .bind(lead_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ContextChunk::try_from).collect()
    }
}
