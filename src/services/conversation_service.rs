use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{Conversation, ConversationMember, ConversationType};

/// Minimal conversation/membership surface the pipeline needs. Group
/// administration (roles, invites, transfers) lives with the platform's
/// conversation-management component, not here.
pub struct ConversationService;

impl ConversationService {
    pub async fn create_conversation(
        db: &Pool<Postgres>,
        kind: ConversationType,
        name: &str,
        created_by: Option<Uuid>,
        member_ids: &[Uuid],
    ) -> AppResult<Uuid> {
        let id = Uuid::new_v4();
        let mut tx = db.begin().await?;
        sqlx::query(
            "INSERT INTO conversations (id, conversation_type, name, created_by) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(id)
        .bind(kind.as_str())
        .bind(name)
        .bind(created_by)
        .execute(&mut *tx)
        .await?;
        for user_id in member_ids {
            sqlx::query(
                "INSERT INTO conversation_members (conversation_id, user_id) \
                 VALUES ($1, $2) ON CONFLICT DO NOTHING",
            )
            .bind(id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(id)
    }

    pub async fn get_conversation(db: &Pool<Postgres>, id: Uuid) -> AppResult<Conversation> {
        let row = sqlx::query(
            "SELECT id, conversation_type, name, created_by, created_at, updated_at \
             FROM conversations WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(db)
        .await?
        .ok_or(AppError::NotFound)?;
        Ok(Conversation::from_row(&row)?)
    }

    /// Conversations visible to a user, most recently active first. Hidden
    /// memberships are excluded; they reappear here once a new message
    /// clears `hidden_at`.
    pub async fn list_for_user(
        db: &Pool<Postgres>,
        user_id: Uuid,
    ) -> AppResult<Vec<Conversation>> {
        let rows = sqlx::query(
            "SELECT c.id, c.conversation_type, c.name, c.created_by, c.created_at, c.updated_at \
             FROM conversations c \
             JOIN conversation_members m ON m.conversation_id = c.id \
             WHERE m.user_id = $1 AND m.hidden_at IS NULL \
             ORDER BY c.updated_at DESC",
        )
        .bind(user_id)
        .fetch_all(db)
        .await?;
        rows.iter()
            .map(|row| Conversation::from_row(row).map_err(AppError::from))
            .collect()
    }

    pub async fn is_member(
        db: &Pool<Postgres>,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM conversation_members \
             WHERE conversation_id = $1 AND user_id = $2)",
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_one(db)
        .await?;
        Ok(exists)
    }

    pub async fn get_member(
        db: &Pool<Postgres>,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<ConversationMember> {
        let row = sqlx::query(
            "SELECT conversation_id, user_id, role, joined_at, hidden_at, \
                    last_read_msg_id, last_read_msg_time \
             FROM conversation_members WHERE conversation_id = $1 AND user_id = $2",
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_optional(db)
        .await?
        .ok_or(AppError::NotAMember)?;
        Ok(ConversationMember::from_row(&row)?)
    }

    pub async fn add_member(
        db: &Pool<Postgres>,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO conversation_members (conversation_id, user_id) \
             VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(conversation_id)
        .bind(user_id)
        .execute(db)
        .await?;
        Ok(())
    }

    pub async fn remove_member(
        db: &Pool<Postgres>,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<()> {
        sqlx::query(
            "DELETE FROM conversation_members WHERE conversation_id = $1 AND user_id = $2",
        )
        .bind(conversation_id)
        .bind(user_id)
        .execute(db)
        .await?;
        Ok(())
    }

    /// Cascade deletion of a conversation: messages, memberships, and the
    /// conversation row go in one transaction, never as eventual cleanup.
    /// Returns the former member ids so callers can invalidate caches.
    pub async fn delete_conversation(
        db: &Pool<Postgres>,
        conversation_id: Uuid,
    ) -> AppResult<Vec<Uuid>> {
        let rows =
            sqlx::query("SELECT user_id FROM conversation_members WHERE conversation_id = $1")
                .bind(conversation_id)
                .fetch_all(db)
                .await?;
        let member_ids: Vec<Uuid> = rows.iter().map(|r| r.get("user_id")).collect();

        let mut tx = db.begin().await?;
        sqlx::query("DELETE FROM messages WHERE conversation_id = $1")
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM conversation_members WHERE conversation_id = $1")
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM conversations WHERE id = $1")
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(member_ids)
    }
}
