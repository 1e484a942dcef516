//! Shared identifier space allocator for ouvrages and blocs.
//!
//! Both tables use plain rowid primary keys, so each table's own counter
//! cannot see the other's allocations. After every insert the mutation
//! shell calls [`IdentitySpaceResolver::resolve_inserted`], which checks
//! the freshly assigned id against the sibling table and re-keys the row
//! inside a savepoint when it collides. A failed re-key rolls back only
//! the savepoint; the allocation is retried a bounded number of times
//! before the conflict aborts the whole mutation.

use chantier_core::domain::NodeKind;
use chantier_core::error::{EngineError, Result};
use sqlx::{Acquire, Sqlite, Transaction};

/// Allocator guaranteeing no ouvrage id ever equals a bloc id.
pub struct IdentitySpaceResolver;

impl IdentitySpaceResolver {
    /// Smallest identifier ≥ `candidate` unused by both tables.
    ///
    /// The candidate row itself (identified by `kind`) is ignored at the
    /// candidate position, so a just-inserted row that has no cross-table
    /// collision resolves to its own id.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Database`] on query failure.
    pub async fn next_safe_id(
        tx: &mut Transaction<'_, Sqlite>,
        candidate: i64,
        kind: NodeKind,
    ) -> Result<i64> {
        let mut id = candidate.max(1);
        loop {
            let in_ouvrages = Self::ouvrage_exists(tx, id).await?;
            let in_blocs = Self::bloc_exists(tx, id).await?;
            let taken = match kind {
                NodeKind::Ouvrage => in_blocs || (in_ouvrages && id != candidate),
                NodeKind::Bloc => in_ouvrages || (in_blocs && id != candidate),
            };
            if !taken {
                return Ok(id);
            }
            id += 1;
        }
    }

    /// Resolve the id of a row the current transaction just inserted.
    ///
    /// Returns the final id: the inserted one when it is already safe,
    /// otherwise the re-keyed one. Each attempt runs under a savepoint so
    /// a failed re-key leaves earlier work in the transaction intact.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Conflict`] once the retry bound is
    /// exhausted; the caller must roll back the whole mutation.
    pub async fn resolve_inserted(
        tx: &mut Transaction<'_, Sqlite>,
        inserted: i64,
        kind: NodeKind,
        retries: u32,
    ) -> Result<i64> {
        let mut attempt: u32 = 0;
        loop {
            let mut savepoint = tx.begin().await?;
            match Self::try_rekey(&mut savepoint, inserted, kind).await {
                Ok(id) => {
                    savepoint.commit().await?;
                    if id != inserted {
                        tracing::debug!(inserted, resolved = id, ?kind, "re-keyed shared-space id");
                    }
                    return Ok(id);
                }
                Err(error) => {
                    savepoint.rollback().await?;
                    if attempt >= retries {
                        return Err(EngineError::Conflict(format!(
                            "identifier {inserted} could not be re-keyed after {attempt} retries: {error}"
                        )));
                    }
                    attempt += 1;
                    tracing::warn!(%error, inserted, attempt, "identifier re-key failed, retrying");
                }
            }
        }
    }

    async fn try_rekey(
        savepoint: &mut Transaction<'_, Sqlite>,
        inserted: i64,
        kind: NodeKind,
    ) -> Result<i64> {
        let safe = Self::next_safe_id(savepoint, inserted, kind).await?;
        if safe != inserted {
            let sql = match kind {
                NodeKind::Ouvrage => "UPDATE ouvrages SET id = ? WHERE id = ?",
                NodeKind::Bloc => "UPDATE blocs SET id = ? WHERE id = ?",
            };
            sqlx::query(sql)
                .bind(safe)
                .bind(inserted)
                .execute(&mut **savepoint)
                .await?;
        }
        Ok(safe)
    }

    async fn ouvrage_exists(tx: &mut Transaction<'_, Sqlite>, id: i64) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ouvrages WHERE id = ?")
            .bind(id)
            .fetch_one(&mut **tx)
            .await?;
        Ok(count > 0)
    }

    async fn bloc_exists(tx: &mut Transaction<'_, Sqlite>, id: i64) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM blocs WHERE id = ?")
            .bind(id)
            .fetch_one(&mut **tx)
            .await?;
        Ok(count > 0)
    }
}
