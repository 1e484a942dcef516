//! Transactional mutation shell.
//!
//! Every structural write goes through [`MutationService`], which wraps
//! it in one transaction: validate → write rows (identifier allocation
//! under a savepoint, structure indexing) → price roll-ups → designation
//! renumbering (structural mutations only) → commit. Event recording and
//! notification fanout happen post-commit, fire-and-forget: their failure
//! is logged and never rolls back the mutation.

use crate::identity::IdentitySpaceResolver;
use crate::rollup::PriceRollupEngine;
use crate::sequencer::{DesignationSequencer, RecalcScope};
use crate::structure::StructureIndex;
use chantier_core::config::EngineConfig;
use chantier_core::domain::{
    line_totals, Actor, Bloc, LineItem, Lot, Margins, NodeKind, Ouvrage, Project,
};
use chantier_core::environment::{BoxFuture, CatalogLookup, Clock, ConsistencyHooks, EventSink};
use chantier_core::error::{EngineError, Result};
use chantier_core::event::{ActionKind, NewEvent};
use chantier_core::ids::{BlocId, LabelId, LineItemId, LotId, OuvrageId, ProjectId};
use serde_json::json;
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::sync::Arc;

type Tx<'c> = Transaction<'c, Sqlite>;

/// Partial update of project-level fields.
#[derive(Debug, Clone, Default)]
pub struct ProjectPatch {
    /// New display name.
    pub name: Option<String>,
    /// New gross margin percentage.
    pub gross_margin: Option<f64>,
    /// New net margin percentage.
    pub net_margin: Option<f64>,
}

impl ProjectPatch {
    const fn is_empty(&self) -> bool {
        self.name.is_none() && self.gross_margin.is_none() && self.net_margin.is_none()
    }

    const fn touches_margins(&self) -> bool {
        self.gross_margin.is_some() || self.net_margin.is_some()
    }
}

/// Partial update of a bloc. Outer `Option` = "change this field",
/// inner `Option` = the new (possibly cleared) value.
#[derive(Debug, Clone, Default)]
pub struct BlocPatch {
    /// New display name.
    pub name: Option<String>,
    /// New unit of measure (`Some(None)` clears it).
    pub unite: Option<Option<String>>,
    /// New quantity (`Some(None)` clears it, which also clears `pu`).
    pub quantite: Option<Option<f64>>,
}

impl BlocPatch {
    const fn is_empty(&self) -> bool {
        self.name.is_none() && self.unite.is_none() && self.quantite.is_none()
    }
}

/// Partial update of a line item.
#[derive(Debug, Clone, Default)]
pub struct LineItemPatch {
    /// New quantity.
    pub quantite: Option<f64>,
    /// New unit price.
    pub prix_unitaire: Option<f64>,
    /// New tax rate percentage.
    pub tva: Option<f64>,
}

impl LineItemPatch {
    const fn is_empty(&self) -> bool {
        self.quantite.is_none() && self.prix_unitaire.is_none() && self.tva.is_none()
    }
}

/// Entry point for all hierarchy mutations.
#[derive(Clone)]
pub struct MutationService {
    pool: SqlitePool,
    catalog: Arc<dyn CatalogLookup>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl MutationService {
    /// Create a mutation service.
    pub fn new(
        pool: SqlitePool,
        catalog: Arc<dyn CatalogLookup>,
        sink: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            pool,
            catalog,
            sink,
            clock,
            config,
        }
    }

    /// The underlying pool (read access for callers and tests).
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ═══════════════════════════════════════════════════════════
    // Projects
    // ═══════════════════════════════════════════════════════════

    /// Create a project; the actor becomes its owner and first member.
    ///
    /// # Errors
    ///
    /// [`EngineError::Validation`] on an empty name.
    pub async fn create_project(
        &self,
        actor: Actor,
        name: &str,
        margins: Margins,
    ) -> Result<Project> {
        let name = non_empty("name", name)?;
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "INSERT INTO projects (name, owner_id, gross_margin, net_margin, prix_vente, created_at) \
             VALUES (?, ?, ?, ?, 0, ?)",
        )
        .bind(name)
        .bind(actor.user_id)
        .bind(margins.gross)
        .bind(margins.net)
        .bind(self.clock.now())
        .execute(&mut *tx)
        .await?;
        let project_id = ProjectId(result.last_insert_rowid());

        sqlx::query("INSERT INTO project_members (project_id, user_id, muted) VALUES (?, ?, 0)")
            .bind(project_id)
            .bind(actor.user_id)
            .execute(&mut *tx)
            .await?;

        let project = load_project(&mut tx, project_id).await?;
        tx.commit().await?;

        self.emit(NewEvent::new(ActionKind::ProjectCreated, actor.user_id, project_id));
        Ok(project)
    }

    /// Edit project-level fields (name, margins).
    ///
    /// Not structural: designations are untouched. Margin changes
    /// recompute the sell price. Emits the mergeable
    /// [`ActionKind::ProjectFieldsUpdated`] event with a field diff.
    ///
    /// # Errors
    ///
    /// [`EngineError::Validation`] when the patch is empty.
    pub async fn update_project_fields(
        &self,
        actor: Actor,
        project_id: ProjectId,
        patch: ProjectPatch,
    ) -> Result<Project> {
        if patch.is_empty() {
            return Err(EngineError::validation("patch", "no fields to update"));
        }
        let mut tx = self.pool.begin().await?;
        let before = load_project(&mut tx, project_id).await?;
        ensure_access(&mut tx, actor, project_id).await?;

        let mut fields = serde_json::Map::new();
        if let Some(name) = &patch.name {
            let name = non_empty("name", name)?;
            fields.insert("name".into(), json!({ "from": before.name, "to": name }));
            sqlx::query("UPDATE projects SET name = ? WHERE id = ?")
                .bind(name)
                .bind(project_id)
                .execute(&mut *tx)
                .await?;
        }
        if let Some(gross) = patch.gross_margin {
            fields.insert(
                "gross_margin".into(),
                json!({ "from": before.gross_margin, "to": gross }),
            );
            sqlx::query("UPDATE projects SET gross_margin = ? WHERE id = ?")
                .bind(gross)
                .bind(project_id)
                .execute(&mut *tx)
                .await?;
        }
        if let Some(net) = patch.net_margin {
            fields.insert(
                "net_margin".into(),
                json!({ "from": before.net_margin, "to": net }),
            );
            sqlx::query("UPDATE projects SET net_margin = ? WHERE id = ?")
                .bind(net)
                .bind(project_id)
                .execute(&mut *tx)
                .await?;
        }

        if patch.touches_margins() {
            PriceRollupEngine::recalc_project_sell_price(&mut tx, project_id).await?;
        }

        let project = load_project(&mut tx, project_id).await?;
        tx.commit().await?;

        self.emit(
            NewEvent::new(ActionKind::ProjectFieldsUpdated, actor.user_id, project_id)
                .metadata(json!({ "fields": fields })),
        );
        Ok(project)
    }

    /// Delete a project and everything beneath it.
    ///
    /// Events referencing the project are kept: they carry name snapshots
    /// and plain-integer references precisely so they survive this.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] / [`EngineError::AccessDenied`].
    pub async fn delete_project(&self, actor: Actor, project_id: ProjectId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let project = load_project(&mut tx, project_id).await?;
        ensure_access(&mut tx, actor, project_id).await?;

        sqlx::query("DELETE FROM projects WHERE id = ?")
            .bind(project_id)
            .execute(&mut *tx)
            .await?;
        StructureIndex::sweep_orphan_blocs(&mut tx).await?;
        tx.commit().await?;

        self.emit(
            NewEvent::new(ActionKind::ProjectDeleted, actor.user_id, project_id)
                .metadata(json!({ "name": project.name })),
        );
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════
    // Lots
    // ═══════════════════════════════════════════════════════════

    /// Associate a taxonomy label with a project, find-or-create.
    ///
    /// At most one lot per (project, label) pair: calling twice with the
    /// same label returns the existing association.
    ///
    /// # Errors
    ///
    /// [`EngineError::Validation`] on an empty label.
    pub async fn create_lot(&self, actor: Actor, project_id: ProjectId, label: &str) -> Result<Lot> {
        let label = non_empty("label", label)?;
        let mut tx = self.pool.begin().await?;
        load_project(&mut tx, project_id).await?;
        ensure_access(&mut tx, actor, project_id).await?;

        let label_id = find_or_create_label(&mut tx, label).await?;
        let existing: Option<i64> =
            sqlx::query_scalar("SELECT id FROM lots WHERE project_id = ? AND label_id = ?")
                .bind(project_id)
                .bind(label_id)
                .fetch_optional(&mut *tx)
                .await?;
        let (lot_id, created) = match existing {
            Some(id) => (LotId(id), false),
            None => {
                let result = sqlx::query("INSERT INTO lots (project_id, label_id) VALUES (?, ?)")
                    .bind(project_id)
                    .bind(label_id)
                    .execute(&mut *tx)
                    .await?;
                (LotId(result.last_insert_rowid()), true)
            }
        };

        if created {
            renumber(&mut tx, project_id, RecalcScope::whole_project()).await;
        }
        let lot = load_lot(&mut tx, project_id, lot_id).await?;
        tx.commit().await?;

        if created {
            self.emit(
                NewEvent::new(ActionKind::LotCreated, actor.user_id, project_id)
                    .metadata(json!({ "label": label, "lot_id": lot_id.0 })),
            );
        }
        Ok(lot)
    }

    /// Delete a lot and every ouvrage beneath it.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] / [`EngineError::AccessDenied`].
    pub async fn delete_lot(&self, actor: Actor, project_id: ProjectId, lot_id: LotId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        load_lot(&mut tx, project_id, lot_id).await?;
        ensure_access(&mut tx, actor, project_id).await?;

        sqlx::query("DELETE FROM lots WHERE id = ?")
            .bind(lot_id)
            .execute(&mut *tx)
            .await?;
        StructureIndex::sweep_orphan_blocs(&mut tx).await?;
        PriceRollupEngine::recalc_project_sell_price(&mut tx, project_id).await?;
        renumber(&mut tx, project_id, RecalcScope::whole_project()).await;
        tx.commit().await?;

        self.emit(
            NewEvent::new(ActionKind::LotDeleted, actor.user_id, project_id)
                .metadata(json!({ "lot_id": lot_id.0 })),
        );
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════
    // Ouvrages
    // ═══════════════════════════════════════════════════════════

    /// Create an ouvrage under a lot.
    ///
    /// The freshly assigned rowid is checked against the bloc table and
    /// re-keyed under a savepoint if it collides (shared identifier
    /// space).
    ///
    /// # Errors
    ///
    /// [`EngineError::Conflict`] when allocation cannot be resolved.
    pub async fn create_ouvrage(
        &self,
        actor: Actor,
        project_id: ProjectId,
        lot_id: LotId,
        name: &str,
    ) -> Result<Ouvrage> {
        let name = non_empty("name", name)?;
        let mut tx = self.pool.begin().await?;
        load_lot(&mut tx, project_id, lot_id).await?;
        ensure_access(&mut tx, actor, project_id).await?;

        let result =
            sqlx::query("INSERT INTO ouvrages (lot_id, name, prix_total) VALUES (?, ?, 0)")
                .bind(lot_id)
                .bind(name)
                .execute(&mut *tx)
                .await?;
        let inserted = result.last_insert_rowid();
        let ouvrage_id = OuvrageId(
            IdentitySpaceResolver::resolve_inserted(
                &mut tx,
                inserted,
                NodeKind::Ouvrage,
                self.config.allocation_retries,
            )
            .await?,
        );

        renumber(&mut tx, project_id, RecalcScope::lot(lot_id)).await;
        let ouvrage = load_ouvrage(&mut tx, project_id, ouvrage_id).await?;
        tx.commit().await?;

        self.emit(
            NewEvent::new(ActionKind::OuvrageCreated, actor.user_id, project_id)
                .ouvrage(ouvrage_id, name),
        );
        Ok(ouvrage)
    }

    /// Rename an ouvrage. Not structural: no renumbering.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] / [`EngineError::AccessDenied`].
    pub async fn rename_ouvrage(
        &self,
        actor: Actor,
        project_id: ProjectId,
        ouvrage_id: OuvrageId,
        name: &str,
    ) -> Result<Ouvrage> {
        let name = non_empty("name", name)?;
        let mut tx = self.pool.begin().await?;
        let before = load_ouvrage(&mut tx, project_id, ouvrage_id).await?;
        ensure_access(&mut tx, actor, project_id).await?;

        sqlx::query("UPDATE ouvrages SET name = ? WHERE id = ?")
            .bind(name)
            .bind(ouvrage_id)
            .execute(&mut *tx)
            .await?;
        let ouvrage = load_ouvrage(&mut tx, project_id, ouvrage_id).await?;
        tx.commit().await?;

        self.emit(
            NewEvent::new(ActionKind::OuvrageRenamed, actor.user_id, project_id)
                .ouvrage(ouvrage_id, name)
                .metadata(json!({ "name": { "from": before.name, "to": name } })),
        );
        Ok(ouvrage)
    }

    /// Delete an ouvrage, cascading its structure nodes and line items.
    ///
    /// The event snapshots the ouvrage name so history survives the
    /// deletion.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] / [`EngineError::AccessDenied`].
    pub async fn delete_ouvrage(
        &self,
        actor: Actor,
        project_id: ProjectId,
        ouvrage_id: OuvrageId,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let ouvrage = load_ouvrage(&mut tx, project_id, ouvrage_id).await?;
        ensure_access(&mut tx, actor, project_id).await?;

        StructureIndex::delete_for_ouvrage(&mut tx, ouvrage_id).await?;
        sqlx::query("DELETE FROM ouvrages WHERE id = ?")
            .bind(ouvrage_id)
            .execute(&mut *tx)
            .await?;
        PriceRollupEngine::recalc_project_sell_price(&mut tx, project_id).await?;
        renumber(&mut tx, project_id, RecalcScope::lot(ouvrage.lot_id)).await;
        tx.commit().await?;

        self.emit(
            NewEvent::new(ActionKind::OuvrageDeleted, actor.user_id, project_id)
                .ouvrage(ouvrage_id, ouvrage.name),
        );
        Ok(())
    }

    /// Reorder the ouvrages of one lot. `order` must be a permutation of
    /// the lot's current ouvrages.
    ///
    /// # Errors
    ///
    /// [`EngineError::Validation`] when `order` is not a permutation.
    pub async fn reorder_ouvrages(
        &self,
        actor: Actor,
        project_id: ProjectId,
        lot_id: LotId,
        order: &[OuvrageId],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        load_lot(&mut tx, project_id, lot_id).await?;
        ensure_access(&mut tx, actor, project_id).await?;

        let current: Vec<i64> = sqlx::query_scalar("SELECT id FROM ouvrages WHERE lot_id = ?")
            .bind(lot_id)
            .fetch_all(&mut *tx)
            .await?;
        ensure_permutation("order", &current, order.iter().map(|id| id.0))?;

        for (index, ouvrage_id) in order.iter().enumerate() {
            sqlx::query("UPDATE ouvrages SET position = ? WHERE id = ?")
                .bind(index as i64)
                .bind(ouvrage_id)
                .execute(&mut *tx)
                .await?;
        }
        renumber(&mut tx, project_id, RecalcScope::lot(lot_id)).await;
        tx.commit().await?;

        self.emit(
            NewEvent::new(ActionKind::OuvragesReordered, actor.user_id, project_id).metadata(
                json!({ "lot_id": lot_id.0, "order": order.iter().map(|id| id.0).collect::<Vec<_>>() }),
            ),
        );
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════
    // Blocs
    // ═══════════════════════════════════════════════════════════

    /// Create a bloc under an ouvrage.
    ///
    /// Allocates from the shared identifier space and anchors the bloc
    /// through a structure node.
    ///
    /// # Errors
    ///
    /// [`EngineError::Conflict`] when allocation cannot be resolved.
    pub async fn create_bloc(
        &self,
        actor: Actor,
        project_id: ProjectId,
        ouvrage_id: OuvrageId,
        name: &str,
        unite: Option<&str>,
        quantite: Option<f64>,
    ) -> Result<Bloc> {
        let name = non_empty("name", name)?;
        let mut tx = self.pool.begin().await?;
        let ouvrage = load_ouvrage(&mut tx, project_id, ouvrage_id).await?;
        ensure_access(&mut tx, actor, project_id).await?;

        let result = sqlx::query("INSERT INTO blocs (name, unite, quantite) VALUES (?, ?, ?)")
            .bind(name)
            .bind(unite)
            .bind(quantite)
            .execute(&mut *tx)
            .await?;
        let inserted = result.last_insert_rowid();
        let bloc_id = BlocId(
            IdentitySpaceResolver::resolve_inserted(
                &mut tx,
                inserted,
                NodeKind::Bloc,
                self.config.allocation_retries,
            )
            .await?,
        );

        StructureIndex::find_or_create(&mut tx, ouvrage_id, Some(bloc_id)).await?;
        PriceRollupEngine::recalc_bloc(&mut tx, project_id, bloc_id).await?;
        renumber(&mut tx, project_id, RecalcScope::ouvrage(ouvrage_id)).await;
        let bloc = load_bloc(&mut tx, project_id, bloc_id).await?;
        tx.commit().await?;

        self.emit(
            NewEvent::new(ActionKind::BlocCreated, actor.user_id, project_id)
                .ouvrage(ouvrage_id, ouvrage.name)
                .bloc(bloc_id, name),
        );
        Ok(bloc)
    }

    /// Edit bloc fields. Not structural.
    ///
    /// Changing (or clearing) the quantity recomputes `pu`; a cleared or
    /// non-positive quantity clears `pu`.
    ///
    /// # Errors
    ///
    /// [`EngineError::Validation`] when the patch is empty.
    pub async fn update_bloc(
        &self,
        actor: Actor,
        project_id: ProjectId,
        bloc_id: BlocId,
        patch: BlocPatch,
    ) -> Result<Bloc> {
        if patch.is_empty() {
            return Err(EngineError::validation("patch", "no fields to update"));
        }
        let mut tx = self.pool.begin().await?;
        let before = load_bloc(&mut tx, project_id, bloc_id).await?;
        ensure_access(&mut tx, actor, project_id).await?;

        let mut fields = serde_json::Map::new();
        if let Some(name) = &patch.name {
            let name = non_empty("name", name)?;
            fields.insert("name".into(), json!({ "from": before.name, "to": name }));
            sqlx::query("UPDATE blocs SET name = ? WHERE id = ?")
                .bind(name)
                .bind(bloc_id)
                .execute(&mut *tx)
                .await?;
        }
        if let Some(unite) = &patch.unite {
            fields.insert("unite".into(), json!({ "from": before.unite, "to": unite }));
            sqlx::query("UPDATE blocs SET unite = ? WHERE id = ?")
                .bind(unite.as_deref())
                .bind(bloc_id)
                .execute(&mut *tx)
                .await?;
        }
        if let Some(quantite) = patch.quantite {
            fields.insert(
                "quantite".into(),
                json!({ "from": before.quantite, "to": quantite }),
            );
            sqlx::query("UPDATE blocs SET quantite = ? WHERE id = ?")
                .bind(quantite)
                .bind(bloc_id)
                .execute(&mut *tx)
                .await?;
        }

        PriceRollupEngine::recalc_bloc(&mut tx, project_id, bloc_id).await?;
        let bloc = load_bloc(&mut tx, project_id, bloc_id).await?;
        tx.commit().await?;

        self.emit(
            NewEvent::new(ActionKind::BlocUpdated, actor.user_id, project_id)
                .bloc(bloc_id, bloc.name.clone())
                .metadata(json!({ "fields": fields })),
        );
        Ok(bloc)
    }

    /// Detach a bloc from an ouvrage, deleting its line items there.
    ///
    /// The bloc row itself is removed only when this was its last parent.
    /// The event snapshots both names.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] when the pair is not indexed.
    pub async fn delete_bloc(
        &self,
        actor: Actor,
        project_id: ProjectId,
        ouvrage_id: OuvrageId,
        bloc_id: BlocId,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let ouvrage = load_ouvrage(&mut tx, project_id, ouvrage_id).await?;
        let bloc = load_bloc(&mut tx, project_id, bloc_id).await?;
        ensure_access(&mut tx, actor, project_id).await?;

        StructureIndex::detach_bloc(&mut tx, ouvrage_id, bloc_id).await?;
        PriceRollupEngine::recalc_ouvrage(&mut tx, ouvrage_id).await?;
        PriceRollupEngine::recalc_project_sell_price(&mut tx, project_id).await?;
        renumber(&mut tx, project_id, RecalcScope::ouvrage(ouvrage_id)).await;
        tx.commit().await?;

        self.emit(
            NewEvent::new(ActionKind::BlocDeleted, actor.user_id, project_id)
                .ouvrage(ouvrage_id, ouvrage.name)
                .bloc(bloc_id, bloc.name),
        );
        Ok(())
    }

    /// Reorder the blocs of one ouvrage.
    ///
    /// # Errors
    ///
    /// [`EngineError::Validation`] when `order` is not a permutation of
    /// the ouvrage's current blocs.
    pub async fn reorder_blocs(
        &self,
        actor: Actor,
        project_id: ProjectId,
        ouvrage_id: OuvrageId,
        order: &[BlocId],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        load_ouvrage(&mut tx, project_id, ouvrage_id).await?;
        ensure_access(&mut tx, actor, project_id).await?;

        let current: Vec<i64> = sqlx::query_scalar(
            "SELECT bloc_id FROM structure_nodes WHERE ouvrage_id = ? AND bloc_id IS NOT NULL",
        )
        .bind(ouvrage_id)
        .fetch_all(&mut *tx)
        .await?;
        ensure_permutation("order", &current, order.iter().map(|id| id.0))?;

        for (index, bloc_id) in order.iter().enumerate() {
            sqlx::query("UPDATE blocs SET position = ? WHERE id = ?")
                .bind(index as i64)
                .bind(bloc_id)
                .execute(&mut *tx)
                .await?;
        }
        renumber(&mut tx, project_id, RecalcScope::ouvrage(ouvrage_id)).await;
        tx.commit().await?;

        self.emit(
            NewEvent::new(ActionKind::BlocsReordered, actor.user_id, project_id).metadata(
                json!({ "ouvrage_id": ouvrage_id.0, "order": order.iter().map(|id| id.0).collect::<Vec<_>>() }),
            ),
        );
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════
    // Line items
    // ═══════════════════════════════════════════════════════════

    /// Add a catalog article at a tree position.
    ///
    /// Name, unit and unit price come from the catalog; totals are
    /// computed from quantity and tax rate. Placeholder rows kept in the
    /// same lot are removed now that a real line occupies it.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] when the catalog id is unknown,
    /// [`EngineError::Validation`] on a non-positive quantity.
    pub async fn add_line_item(
        &self,
        actor: Actor,
        project_id: ProjectId,
        ouvrage_id: OuvrageId,
        bloc_id: Option<BlocId>,
        catalog_article_id: i64,
        quantite: f64,
        tva: f64,
    ) -> Result<LineItem> {
        if quantite <= 0.0 {
            return Err(EngineError::validation("quantite", "must be positive"));
        }
        let article = self.catalog.fetch_article(catalog_article_id).await?;

        let mut tx = self.pool.begin().await?;
        let ouvrage = load_ouvrage(&mut tx, project_id, ouvrage_id).await?;
        ensure_access(&mut tx, actor, project_id).await?;
        if let Some(bloc_id) = bloc_id {
            load_bloc(&mut tx, project_id, bloc_id).await?;
        }

        let node_id = StructureIndex::find_or_create(&mut tx, ouvrage_id, bloc_id).await?;
        let (total_ht, total_ttc) = line_totals(quantite, article.reference_price, tva);
        let result = sqlx::query(
            "INSERT INTO line_items \
             (node_id, project_id, catalog_article_id, name, unite, quantite, prix_unitaire, tva, total_ht, total_ttc) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(node_id)
        .bind(project_id)
        .bind(catalog_article_id)
        .bind(&article.name)
        .bind(&article.unite)
        .bind(quantite)
        .bind(article.reference_price)
        .bind(tva)
        .bind(total_ht)
        .bind(total_ttc)
        .execute(&mut *tx)
        .await?;
        let line_item_id = LineItemId(result.last_insert_rowid());

        // A real line occupies the lot now; placeholders are obsolete.
        sqlx::query(
            "DELETE FROM line_items WHERE catalog_article_id IS NULL AND node_id IN \
             (SELECT sn.id FROM structure_nodes sn \
              JOIN ouvrages o ON o.id = sn.ouvrage_id \
              WHERE o.lot_id = ?)",
        )
        .bind(ouvrage.lot_id)
        .execute(&mut *tx)
        .await?;

        let node = StructureIndex::node(&mut tx, node_id).await?;
        PriceRollupEngine::recalc_node(&mut tx, project_id, &node).await?;
        renumber(&mut tx, project_id, RecalcScope::ouvrage(ouvrage_id)).await;
        let line = load_line_item(&mut tx, project_id, line_item_id).await?;
        tx.commit().await?;

        let mut event = NewEvent::new(ActionKind::LineItemAdded, actor.user_id, project_id)
            .ouvrage(ouvrage_id, ouvrage.name)
            .line_item(line_item_id)
            .metadata(json!({ "catalog_article_id": catalog_article_id, "name": article.name }));
        if let Some(bloc_id) = bloc_id {
            let bloc_name: Option<String> =
                sqlx::query_scalar("SELECT name FROM blocs WHERE id = ?")
                    .bind(bloc_id)
                    .fetch_optional(&self.pool)
                    .await?;
            if let Some(bloc_name) = bloc_name {
                event = event.bloc(bloc_id, bloc_name);
            }
        }
        self.emit(event);
        Ok(line)
    }

    /// Edit a line item's quantity, unit price or tax rate. Not
    /// structural.
    ///
    /// # Errors
    ///
    /// [`EngineError::Validation`] when the patch is empty or the
    /// quantity is non-positive.
    pub async fn update_line_item(
        &self,
        actor: Actor,
        project_id: ProjectId,
        line_item_id: LineItemId,
        patch: LineItemPatch,
    ) -> Result<LineItem> {
        if patch.is_empty() {
            return Err(EngineError::validation("patch", "no fields to update"));
        }
        if matches!(patch.quantite, Some(q) if q <= 0.0) {
            return Err(EngineError::validation("quantite", "must be positive"));
        }
        let mut tx = self.pool.begin().await?;
        let before = load_line_item(&mut tx, project_id, line_item_id).await?;
        ensure_access(&mut tx, actor, project_id).await?;

        let quantite = patch.quantite.unwrap_or(before.quantite);
        let prix_unitaire = patch.prix_unitaire.unwrap_or(before.prix_unitaire);
        let tva = patch.tva.unwrap_or(before.tva);
        let (total_ht, total_ttc) = line_totals(quantite, prix_unitaire, tva);

        sqlx::query(
            "UPDATE line_items SET quantite = ?, prix_unitaire = ?, tva = ?, total_ht = ?, total_ttc = ? \
             WHERE id = ?",
        )
        .bind(quantite)
        .bind(prix_unitaire)
        .bind(tva)
        .bind(total_ht)
        .bind(total_ttc)
        .bind(line_item_id)
        .execute(&mut *tx)
        .await?;

        let node = StructureIndex::node(&mut tx, before.node_id).await?;
        PriceRollupEngine::recalc_node(&mut tx, project_id, &node).await?;
        let line = load_line_item(&mut tx, project_id, line_item_id).await?;
        tx.commit().await?;

        self.emit(
            NewEvent::new(ActionKind::LineItemUpdated, actor.user_id, project_id)
                .line_item(line_item_id)
                .metadata(json!({
                    "quantite": { "from": before.quantite, "to": quantite },
                    "prix_unitaire": { "from": before.prix_unitaire, "to": prix_unitaire },
                    "tva": { "from": before.tva, "to": tva },
                })),
        );
        Ok(line)
    }

    /// Remove a line item.
    ///
    /// When it is the last real line of its lot, the row is converted to
    /// a zero-quantity placeholder instead, keeping the lot visible.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] / [`EngineError::AccessDenied`].
    pub async fn remove_line_item(
        &self,
        actor: Actor,
        project_id: ProjectId,
        line_item_id: LineItemId,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let line = load_line_item(&mut tx, project_id, line_item_id).await?;
        ensure_access(&mut tx, actor, project_id).await?;
        let node = StructureIndex::node(&mut tx, line.node_id).await?;
        let ouvrage = load_ouvrage(&mut tx, project_id, node.ouvrage_id).await?;

        let real_lines_in_lot: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM line_items li \
             JOIN structure_nodes sn ON sn.id = li.node_id \
             JOIN ouvrages o ON o.id = sn.ouvrage_id \
             WHERE o.lot_id = ? AND li.catalog_article_id IS NOT NULL",
        )
        .bind(ouvrage.lot_id)
        .fetch_one(&mut *tx)
        .await?;

        let converted = real_lines_in_lot <= 1 && !line.is_placeholder();
        if converted {
            sqlx::query(
                "UPDATE line_items SET catalog_article_id = NULL, quantite = 0, \
                 prix_unitaire = 0, total_ht = 0, total_ttc = 0 WHERE id = ?",
            )
            .bind(line_item_id)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query("DELETE FROM line_items WHERE id = ?")
                .bind(line_item_id)
                .execute(&mut *tx)
                .await?;
        }

        PriceRollupEngine::recalc_node(&mut tx, project_id, &node).await?;
        renumber(&mut tx, project_id, RecalcScope::ouvrage(node.ouvrage_id)).await;
        tx.commit().await?;

        let mut event = NewEvent::new(ActionKind::LineItemRemoved, actor.user_id, project_id)
            .ouvrage(node.ouvrage_id, ouvrage.name)
            .line_item(line_item_id)
            .metadata(json!({ "name": line.name, "converted_to_placeholder": converted }));
        if let Some(bloc_id) = node.bloc_id {
            let bloc_name: Option<String> =
                sqlx::query_scalar("SELECT name FROM blocs WHERE id = ?")
                    .bind(bloc_id)
                    .fetch_optional(&self.pool)
                    .await?;
            if let Some(bloc_name) = bloc_name {
                event = event.bloc(bloc_id, bloc_name);
            }
        }
        self.emit(event);
        Ok(())
    }

    /// Record an event post-commit, fire-and-forget.
    fn emit(&self, event: NewEvent) {
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            if let Err(error) = sink.record(event).await {
                tracing::warn!(%error, "event recording failed after commit");
            }
        });
    }
}

impl ConsistencyHooks for MutationService {
    fn refresh_project_prices(&self, project_id: ProjectId) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await?;
            let ouvrages: Vec<i64> = sqlx::query_scalar(
                "SELECT o.id FROM ouvrages o JOIN lots l ON l.id = o.lot_id WHERE l.project_id = ?",
            )
            .bind(project_id)
            .fetch_all(&mut *tx)
            .await?;
            for ouvrage in ouvrages {
                PriceRollupEngine::recalc_ouvrage(&mut tx, OuvrageId(ouvrage)).await?;
            }
            PriceRollupEngine::recalc_project_sell_price(&mut tx, project_id).await?;
            tx.commit().await?;
            Ok(())
        })
    }

    fn refresh_designations(&self, project_id: ProjectId) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await?;
            DesignationSequencer::recalculate(&mut tx, project_id, RecalcScope::whole_project())
                .await?;
            tx.commit().await?;
            Ok(())
        })
    }
}

// ═══════════════════════════════════════════════════════════
// Shared helpers
// ═══════════════════════════════════════════════════════════

/// Run the sequencer, downgrading failures to a warning: renumbering must
/// never fail the surrounding mutation.
async fn renumber(tx: &mut Tx<'_>, project_id: ProjectId, scope: RecalcScope) {
    if let Err(error) = DesignationSequencer::recalculate(tx, project_id, scope).await {
        tracing::warn!(%error, project_id = project_id.0, "designation renumbering failed");
    }
}

fn non_empty<'a>(field: &'static str, value: &'a str) -> Result<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(EngineError::validation(field, "must not be empty"));
    }
    Ok(trimmed)
}

fn ensure_permutation(
    field: &'static str,
    current: &[i64],
    proposed: impl Iterator<Item = i64>,
) -> Result<()> {
    let mut expected = current.to_vec();
    expected.sort_unstable();
    let mut got: Vec<i64> = proposed.collect();
    got.sort_unstable();
    if expected == got {
        Ok(())
    } else {
        Err(EngineError::validation(
            field,
            "must be a permutation of the current children",
        ))
    }
}

async fn ensure_access(tx: &mut Tx<'_>, actor: Actor, project_id: ProjectId) -> Result<()> {
    if actor.is_admin {
        return Ok(());
    }
    let member: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM project_members WHERE project_id = ? AND user_id = ?",
    )
    .bind(project_id)
    .bind(actor.user_id)
    .fetch_one(&mut **tx)
    .await?;
    if member == 0 {
        return Err(EngineError::AccessDenied);
    }
    Ok(())
}

async fn load_project(tx: &mut Tx<'_>, project_id: ProjectId) -> Result<Project> {
    sqlx::query_as::<_, Project>(
        "SELECT id, name, owner_id, gross_margin, net_margin, prix_vente, created_at \
         FROM projects WHERE id = ?",
    )
    .bind(project_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or(EngineError::not_found("project", project_id.0))
}

async fn load_lot(tx: &mut Tx<'_>, project_id: ProjectId, lot_id: LotId) -> Result<Lot> {
    sqlx::query_as::<_, Lot>(
        "SELECT id, project_id, label_id, designation FROM lots WHERE id = ? AND project_id = ?",
    )
    .bind(lot_id)
    .bind(project_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or(EngineError::not_found("lot", lot_id.0))
}

async fn load_ouvrage(
    tx: &mut Tx<'_>,
    project_id: ProjectId,
    ouvrage_id: OuvrageId,
) -> Result<Ouvrage> {
    sqlx::query_as::<_, Ouvrage>(
        "SELECT o.id, o.lot_id, o.designation, o.name, o.prix_total, o.position \
         FROM ouvrages o JOIN lots l ON l.id = o.lot_id \
         WHERE o.id = ? AND l.project_id = ?",
    )
    .bind(ouvrage_id)
    .bind(project_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or(EngineError::not_found("ouvrage", ouvrage_id.0))
}

async fn load_bloc(tx: &mut Tx<'_>, project_id: ProjectId, bloc_id: BlocId) -> Result<Bloc> {
    sqlx::query_as::<_, Bloc>(
        "SELECT DISTINCT b.id, b.designation, b.name, b.unite, b.quantite, b.pu, b.pt, b.position \
         FROM blocs b \
         JOIN structure_nodes sn ON sn.bloc_id = b.id \
         JOIN ouvrages o ON o.id = sn.ouvrage_id \
         JOIN lots l ON l.id = o.lot_id \
         WHERE b.id = ? AND l.project_id = ?",
    )
    .bind(bloc_id)
    .bind(project_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or(EngineError::not_found("bloc", bloc_id.0))
}

async fn load_line_item(
    tx: &mut Tx<'_>,
    project_id: ProjectId,
    line_item_id: LineItemId,
) -> Result<LineItem> {
    sqlx::query_as::<_, LineItem>(
        "SELECT id, node_id, project_id, catalog_article_id, name, unite, quantite, \
                prix_unitaire, tva, total_ht, total_ttc \
         FROM line_items WHERE id = ? AND project_id = ?",
    )
    .bind(line_item_id)
    .bind(project_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or(EngineError::not_found("line item", line_item_id.0))
}

async fn find_or_create_label(tx: &mut Tx<'_>, name: &str) -> Result<LabelId> {
    let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM lot_labels WHERE name = ?")
        .bind(name)
        .fetch_optional(&mut **tx)
        .await?;
    if let Some(id) = existing {
        return Ok(LabelId(id));
    }
    let result = sqlx::query("INSERT INTO lot_labels (name) VALUES (?)")
        .bind(name)
        .execute(&mut **tx)
        .await?;
    Ok(LabelId(result.last_insert_rowid()))
}
