//! Structure index: the join entity anchoring line items to the tree.
//!
//! Every line item references a structure node, never an ouvrage or bloc
//! directly. A node maps (ouvrage, bloc-or-null) to a stable id; the pair
//! is created lazily on first use and never duplicated.

use chantier_core::domain::StructureNode;
use chantier_core::error::{EngineError, Result};
use chantier_core::ids::{BlocId, NodeId, OuvrageId};
use sqlx::{Sqlite, Transaction};

/// Find-or-create access to structure nodes, plus the cascade rules for
/// deleting ouvrages and detaching blocs.
pub struct StructureIndex;

impl StructureIndex {
    /// Return the node id for `(ouvrage_id, bloc_id)`, creating the row
    /// on first use. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Database`] on query failure.
    pub async fn find_or_create(
        tx: &mut Transaction<'_, Sqlite>,
        ouvrage_id: OuvrageId,
        bloc_id: Option<BlocId>,
    ) -> Result<NodeId> {
        // UNIQUE(ouvrage_id, bloc_id) does not cover the NULL-bloc case
        // (SQLite treats NULLs as distinct), so select before insert.
        let existing: Option<i64> =
            sqlx::query_scalar("SELECT id FROM structure_nodes WHERE ouvrage_id = ? AND bloc_id IS ?")
                .bind(ouvrage_id)
                .bind(bloc_id)
                .fetch_optional(&mut **tx)
                .await?;
        if let Some(id) = existing {
            return Ok(NodeId(id));
        }

        let result = sqlx::query("INSERT INTO structure_nodes (ouvrage_id, bloc_id) VALUES (?, ?)")
            .bind(ouvrage_id)
            .bind(bloc_id)
            .execute(&mut **tx)
            .await?;
        Ok(NodeId(result.last_insert_rowid()))
    }

    /// Load a node row.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] when the node does not exist.
    pub async fn node(tx: &mut Transaction<'_, Sqlite>, node_id: NodeId) -> Result<StructureNode> {
        sqlx::query_as::<_, StructureNode>(
            "SELECT id, ouvrage_id, bloc_id FROM structure_nodes WHERE id = ?",
        )
        .bind(node_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(EngineError::not_found("structure node", node_id.0))
    }

    /// Delete every node scoped to `ouvrage_id`, cascading its line items
    /// and removing blocs left without any remaining parent.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Database`] on query failure.
    pub async fn delete_for_ouvrage(
        tx: &mut Transaction<'_, Sqlite>,
        ouvrage_id: OuvrageId,
    ) -> Result<()> {
        let blocs: Vec<i64> = sqlx::query_scalar(
            "SELECT DISTINCT bloc_id FROM structure_nodes WHERE ouvrage_id = ? AND bloc_id IS NOT NULL",
        )
        .bind(ouvrage_id)
        .fetch_all(&mut **tx)
        .await?;

        // Line items cascade through the node foreign key.
        sqlx::query("DELETE FROM structure_nodes WHERE ouvrage_id = ?")
            .bind(ouvrage_id)
            .execute(&mut **tx)
            .await?;

        for bloc in blocs {
            Self::delete_bloc_if_orphan(tx, BlocId(bloc)).await?;
        }
        Ok(())
    }

    /// Remove the index row for one specific (ouvrage, bloc) pair and its
    /// line items. The bloc row itself is deleted only when no other
    /// ouvrage still references it.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] when the pair is not indexed.
    pub async fn detach_bloc(
        tx: &mut Transaction<'_, Sqlite>,
        ouvrage_id: OuvrageId,
        bloc_id: BlocId,
    ) -> Result<()> {
        let deleted = sqlx::query("DELETE FROM structure_nodes WHERE ouvrage_id = ? AND bloc_id = ?")
            .bind(ouvrage_id)
            .bind(bloc_id)
            .execute(&mut **tx)
            .await?
            .rows_affected();
        if deleted == 0 {
            return Err(EngineError::not_found("structure node", bloc_id.0));
        }
        Self::delete_bloc_if_orphan(tx, bloc_id).await
    }

    /// Delete blocs that no structure node references anymore.
    ///
    /// Used by project/lot deletion, where nodes disappear through
    /// foreign-key cascades without per-bloc bookkeeping.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Database`] on query failure.
    pub async fn sweep_orphan_blocs(tx: &mut Transaction<'_, Sqlite>) -> Result<u64> {
        let swept = sqlx::query(
            "DELETE FROM blocs WHERE id NOT IN \
             (SELECT bloc_id FROM structure_nodes WHERE bloc_id IS NOT NULL)",
        )
        .execute(&mut **tx)
        .await?
        .rows_affected();
        Ok(swept)
    }

    async fn delete_bloc_if_orphan(
        tx: &mut Transaction<'_, Sqlite>,
        bloc_id: BlocId,
    ) -> Result<()> {
        sqlx::query(
            "DELETE FROM blocs WHERE id = ? AND NOT EXISTS \
             (SELECT 1 FROM structure_nodes WHERE bloc_id = ?)",
        )
        .bind(bloc_id)
        .bind(bloc_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}
