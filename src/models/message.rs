use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

/// Content discriminator for a message. Stored as TEXT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    Voice,
    File,
    System,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::Voice => "voice",
            MessageKind::File => "file",
            MessageKind::System => "system",
        }
    }

    /// Unknown discriminators degrade to `Text` rather than failing a read.
    pub fn parse(value: &str) -> Self {
        match value {
            "image" => MessageKind::Image,
            "voice" => MessageKind::Voice,
            "file" => MessageKind::File,
            "system" => MessageKind::System,
            _ => MessageKind::Text,
        }
    }
}

/// Denormalized sender identity carried inside cached payloads so cache
/// reads never need a secondary lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sender {
    pub id: Uuid,
    pub name: String,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Option<Uuid>,
    /// Per-conversation monotonic sequence; 0 means the sequencer was
    /// unavailable at ingestion time and gap-repair is degraded for this row.
    pub seq_id: i64,
    pub client_msg_id: Option<String>,
    pub kind: MessageKind,
    pub content: String,
    pub duration_ms: Option<i32>,
    pub thumbnail_url: Option<String>,
    pub is_revoked: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sender: Option<Sender>,
}

impl Message {
    pub fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        let kind: String = row.try_get("message_type")?;
        Ok(Self {
            id: row.try_get("id")?,
            conversation_id: row.try_get("conversation_id")?,
            sender_id: row.try_get("sender_id")?,
            seq_id: row.try_get("seq_id")?,
            client_msg_id: row.try_get("client_msg_id")?,
            kind: MessageKind::parse(&kind),
            content: row.try_get("content")?,
            duration_ms: row.try_get("duration_ms")?,
            thumbnail_url: row.try_get("thumbnail_url")?,
            is_revoked: row.try_get("is_revoked")?,
            created_at: row.try_get("created_at")?,
            sender: None,
        })
    }
}
