//! Bottom-up price roll-ups.
//!
//! Three idempotent recomputations, called inside the same transaction as
//! the mutation that invalidated them:
//!
//! - bloc `pt` = Σ `total_ttc` over the bloc's line items in the project;
//!   `pu` = `pt / quantite`, cleared when the quantity is empty or ≤ 0.
//! - ouvrage `prix_total` = Σ `total_ttc` over **all** line items anchored
//!   anywhere under the ouvrage — not a sum of bloc totals, so lines
//!   attached directly to the ouvrage are never double-counted.
//! - project `prix_vente` = Σ ouvrage totals × margin coefficient.

use chantier_core::domain::{Margins, StructureNode};
use chantier_core::error::{EngineError, Result};
use chantier_core::ids::{BlocId, OuvrageId, ProjectId};
use sqlx::{Sqlite, Transaction};

/// Recomputes the denormalized monetary aggregates.
pub struct PriceRollupEngine;

impl PriceRollupEngine {
    /// Recompute `pt` and `pu` of one bloc.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] when the bloc does not exist.
    pub async fn recalc_bloc(
        tx: &mut Transaction<'_, Sqlite>,
        project_id: ProjectId,
        bloc_id: BlocId,
    ) -> Result<()> {
        let total: f64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(li.total_ttc), 0.0) \
             FROM line_items li \
             JOIN structure_nodes sn ON sn.id = li.node_id \
             WHERE sn.bloc_id = ? AND li.project_id = ?",
        )
        .bind(bloc_id)
        .bind(project_id)
        .fetch_one(&mut **tx)
        .await?;

        let quantite: Option<f64> = sqlx::query_scalar("SELECT quantite FROM blocs WHERE id = ?")
            .bind(bloc_id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or(EngineError::not_found("bloc", bloc_id.0))?;

        let pu = quantite.filter(|q| *q > 0.0).map(|q| total / q);

        sqlx::query("UPDATE blocs SET pt = ?, pu = ? WHERE id = ?")
            .bind(total)
            .bind(pu)
            .bind(bloc_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Recompute `prix_total` of one ouvrage.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Database`] on query failure.
    pub async fn recalc_ouvrage(
        tx: &mut Transaction<'_, Sqlite>,
        ouvrage_id: OuvrageId,
    ) -> Result<()> {
        let total: f64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(li.total_ttc), 0.0) \
             FROM line_items li \
             JOIN structure_nodes sn ON sn.id = li.node_id \
             WHERE sn.ouvrage_id = ?",
        )
        .bind(ouvrage_id)
        .fetch_one(&mut **tx)
        .await?;

        sqlx::query("UPDATE ouvrages SET prix_total = ? WHERE id = ?")
            .bind(total)
            .bind(ouvrage_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Recompute the project sell price from its ouvrage totals and
    /// margin coefficient.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] when the project does not exist.
    pub async fn recalc_project_sell_price(
        tx: &mut Transaction<'_, Sqlite>,
        project_id: ProjectId,
    ) -> Result<()> {
        let margins: (f64, f64) =
            sqlx::query_as("SELECT gross_margin, net_margin FROM projects WHERE id = ?")
                .bind(project_id)
                .fetch_optional(&mut **tx)
                .await?
                .ok_or(EngineError::not_found("project", project_id.0))?;

        let total: f64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(o.prix_total), 0.0) \
             FROM ouvrages o \
             JOIN lots l ON l.id = o.lot_id \
             WHERE l.project_id = ?",
        )
        .bind(project_id)
        .fetch_one(&mut **tx)
        .await?;

        let coefficient = Margins::new(margins.0, margins.1).coefficient();
        sqlx::query("UPDATE projects SET prix_vente = ? WHERE id = ?")
            .bind(total * coefficient)
            .bind(project_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Recompute everything a line-item change at `node` invalidated:
    /// the bloc (when the node has one), the ouvrage, then the project.
    ///
    /// # Errors
    ///
    /// Returns the first recomputation error.
    pub async fn recalc_node(
        tx: &mut Transaction<'_, Sqlite>,
        project_id: ProjectId,
        node: &StructureNode,
    ) -> Result<()> {
        if let Some(bloc_id) = node.bloc_id {
            Self::recalc_bloc(tx, project_id, bloc_id).await?;
        }
        Self::recalc_ouvrage(tx, node.ouvrage_id).await?;
        Self::recalc_project_sell_price(tx, project_id).await
    }
}
