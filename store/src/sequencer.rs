//! Designation renumbering.
//!
//! Produces the human-facing ordinal labels: lots "1", "2", …; ouvrages
//! "1.2"; blocs "1.2.3". Labels are gap-free within a scope and ordered
//! by (explicit position, then id), so insertion order is the tiebreak
//! until a reorder supplies positions.
//!
//! The sequencer runs after structural mutations only. Its caller wraps
//! it in a warn-and-continue guard: a renumbering failure never fails the
//! surrounding mutation.

use chantier_core::error::Result;
use chantier_core::ids::{LotId, OuvrageId, ProjectId};
use sqlx::{Sqlite, Transaction};

/// Scope of one renumbering pass.
///
/// With an `ouvrage_id`, only that ouvrage's blocs are renumbered; with a
/// `lot_id`, only the ouvrages (and their blocs) under that lot; with
/// neither, the whole project.
#[derive(Debug, Clone, Default)]
pub struct RecalcScope {
    /// Restrict to one lot.
    pub lot_id: Option<LotId>,
    /// Restrict to one ouvrage's blocs.
    pub ouvrage_id: Option<OuvrageId>,
    /// Label to number from, overriding the stored designation of the
    /// scope root.
    pub starting_label: Option<String>,
}

impl RecalcScope {
    /// Renumber the whole project.
    #[must_use]
    pub const fn whole_project() -> Self {
        Self {
            lot_id: None,
            ouvrage_id: None,
            starting_label: None,
        }
    }

    /// Renumber one lot's ouvrages and their blocs.
    #[must_use]
    pub const fn lot(lot_id: LotId) -> Self {
        Self {
            lot_id: Some(lot_id),
            ouvrage_id: None,
            starting_label: None,
        }
    }

    /// Renumber one ouvrage's blocs.
    #[must_use]
    pub const fn ouvrage(ouvrage_id: OuvrageId) -> Self {
        Self {
            lot_id: None,
            ouvrage_id: Some(ouvrage_id),
            starting_label: None,
        }
    }

    /// Override the label the scope root numbers from.
    #[must_use]
    pub fn with_starting_label(mut self, label: impl Into<String>) -> Self {
        self.starting_label = Some(label.into());
        self
    }
}

/// Recomputes designation labels for the smallest affected subtree.
pub struct DesignationSequencer;

impl DesignationSequencer {
    /// Renumber everything in `scope`.
    ///
    /// When a scoped root has no stored designation yet (a fresh subtree),
    /// the pass widens to the enclosing scope so labels stay consistent.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Database`](chantier_core::EngineError::Database)
    /// on query failure; callers downgrade this to a logged warning.
    pub async fn recalculate(
        tx: &mut Transaction<'_, Sqlite>,
        project_id: ProjectId,
        scope: RecalcScope,
    ) -> Result<()> {
        if let Some(ouvrage_id) = scope.ouvrage_id {
            let prefix = match scope.starting_label {
                Some(label) => Some(label),
                None => Self::ouvrage_label(tx, ouvrage_id).await?,
            };
            return match prefix {
                Some(prefix) => Self::renumber_blocs(tx, ouvrage_id, &prefix).await,
                // Never numbered: widen to the lot so the ouvrage gets a
                // label first.
                None => match Self::lot_of_ouvrage(tx, ouvrage_id).await? {
                    Some(lot_id) => {
                        Box::pin(Self::recalculate(tx, project_id, RecalcScope::lot(lot_id))).await
                    }
                    None => Ok(()),
                },
            };
        }

        if let Some(lot_id) = scope.lot_id {
            let label = match scope.starting_label {
                Some(label) => Some(label),
                None => Self::lot_label(tx, lot_id).await?,
            };
            return match label {
                Some(label) => Self::renumber_lot(tx, lot_id, &label).await,
                None => Box::pin(Self::recalculate(tx, project_id, RecalcScope::whole_project()))
                    .await,
            };
        }

        let lots: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM lots WHERE project_id = ? ORDER BY id",
        )
        .bind(project_id)
        .fetch_all(&mut **tx)
        .await?;

        for (index, lot) in lots.iter().enumerate() {
            let label = (index + 1).to_string();
            sqlx::query("UPDATE lots SET designation = ? WHERE id = ?")
                .bind(&label)
                .bind(lot)
                .execute(&mut **tx)
                .await?;
            Self::renumber_lot(tx, LotId(*lot), &label).await?;
        }
        Ok(())
    }

    async fn renumber_lot(
        tx: &mut Transaction<'_, Sqlite>,
        lot_id: LotId,
        label: &str,
    ) -> Result<()> {
        let ouvrages: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM ouvrages WHERE lot_id = ? \
             ORDER BY position IS NULL, position, id",
        )
        .bind(lot_id)
        .fetch_all(&mut **tx)
        .await?;

        for (index, ouvrage) in ouvrages.iter().enumerate() {
            let designation = format!("{label}.{}", index + 1);
            sqlx::query("UPDATE ouvrages SET designation = ? WHERE id = ?")
                .bind(&designation)
                .bind(ouvrage)
                .execute(&mut **tx)
                .await?;
            Self::renumber_blocs(tx, OuvrageId(*ouvrage), &designation).await?;
        }
        Ok(())
    }

    async fn renumber_blocs(
        tx: &mut Transaction<'_, Sqlite>,
        ouvrage_id: OuvrageId,
        prefix: &str,
    ) -> Result<()> {
        let blocs: Vec<i64> = sqlx::query_scalar(
            "SELECT b.id FROM blocs b \
             JOIN structure_nodes sn ON sn.bloc_id = b.id \
             WHERE sn.ouvrage_id = ? \
             ORDER BY b.position IS NULL, b.position, b.id",
        )
        .bind(ouvrage_id)
        .fetch_all(&mut **tx)
        .await?;

        for (index, bloc) in blocs.iter().enumerate() {
            sqlx::query("UPDATE blocs SET designation = ? WHERE id = ?")
                .bind(format!("{prefix}.{}", index + 1))
                .bind(bloc)
                .execute(&mut **tx)
                .await?;
        }
        Ok(())
    }

    async fn ouvrage_label(
        tx: &mut Transaction<'_, Sqlite>,
        ouvrage_id: OuvrageId,
    ) -> Result<Option<String>> {
        let label: Option<Option<String>> =
            sqlx::query_scalar("SELECT designation FROM ouvrages WHERE id = ?")
                .bind(ouvrage_id)
                .fetch_optional(&mut **tx)
                .await?;
        Ok(label.flatten())
    }

    async fn lot_label(
        tx: &mut Transaction<'_, Sqlite>,
        lot_id: LotId,
    ) -> Result<Option<String>> {
        let label: Option<Option<String>> =
            sqlx::query_scalar("SELECT designation FROM lots WHERE id = ?")
                .bind(lot_id)
                .fetch_optional(&mut **tx)
                .await?;
        Ok(label.flatten())
    }

    async fn lot_of_ouvrage(
        tx: &mut Transaction<'_, Sqlite>,
        ouvrage_id: OuvrageId,
    ) -> Result<Option<LotId>> {
        let lot: Option<i64> = sqlx::query_scalar("SELECT lot_id FROM ouvrages WHERE id = ?")
            .bind(ouvrage_id)
            .fetch_optional(&mut **tx)
            .await?;
        Ok(lot.map(LotId))
    }
}
