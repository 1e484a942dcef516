//! Notification audience computation.

use chantier_core::error::Result;
use chantier_core::ids::{ProjectId, UserId};
use sqlx::SqlitePool;

/// Who gets notified about one event.
///
/// Audience = project team members ∪ all admins (when the actor is not an
/// admin) − the actor − muted members.
///
/// # Errors
///
/// Returns [`EngineError::Database`](chantier_core::EngineError::Database)
/// on query failure.
pub async fn compute(
    pool: &SqlitePool,
    project_id: ProjectId,
    actor_id: UserId,
    actor_is_admin: bool,
) -> Result<Vec<UserId>> {
    let recipients: Vec<i64> = sqlx::query_scalar(
        "SELECT DISTINCT user_id FROM ( \
             SELECT pm.user_id AS user_id FROM project_members pm \
             WHERE pm.project_id = ? AND pm.muted = 0 \
             UNION \
             SELECT u.id AS user_id FROM users u WHERE u.is_admin = 1 AND ? = 0 \
         ) WHERE user_id <> ? ORDER BY user_id",
    )
    .bind(project_id)
    .bind(i64::from(actor_is_admin))
    .bind(actor_id)
    .fetch_all(pool)
    .await?;
    Ok(recipients.into_iter().map(UserId).collect())
}
