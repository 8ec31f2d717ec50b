use sqlx::{Pool, Postgres};
use uuid::Uuid;

use crate::error::AppResult;

/// Per-member "hidden" state for a conversation. A hidden conversation
/// disappears from the member's list until any new message arrives, at which
/// point every hidden flag for that conversation is cleared.
pub struct VisibilityManager;

impl VisibilityManager {
    /// Remove the conversation from one member's list.
    pub async fn hide(db: &Pool<Postgres>, conversation_id: Uuid, user_id: Uuid) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE conversation_members SET hidden_at = now() \
             WHERE conversation_id = $1 AND user_id = $2",
        )
        .bind(conversation_id)
        .bind(user_id)
        .execute(db)
        .await?;
        if result.rows_affected() == 0 {
            return Err(crate::error::AppError::NotAMember);
        }
        Ok(())
    }

    /// Clear `hidden_at` for every member of the conversation that has it
    /// set. Invoked (fire-and-forget) on every successful ingestion,
    /// whichever write path handled it. Returns the number of rows cleared.
    pub async fn unhide_all(db: &Pool<Postgres>, conversation_id: Uuid) -> AppResult<u64> {
        let result = sqlx::query(
            "UPDATE conversation_members SET hidden_at = NULL \
             WHERE conversation_id = $1 AND hidden_at IS NOT NULL",
        )
        .bind(conversation_id)
        .execute(db)
        .await?;
        Ok(result.rows_affected())
    }
}
