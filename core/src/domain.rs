//! Domain entities for the priced hierarchy.
//!
//! The tree is Lot → Ouvrage → Bloc → [`LineItem`], with blocs optional:
//! line items may anchor directly under an ouvrage. Every entity mirrors
//! one row of the persisted schema; computed fields (`prix_total`, `pu`,
//! `pt`, `prix_vente`, `designation`) are denormalized and recomputed by
//! the engine after each mutation.

use crate::ids::{BlocId, LabelId, LineItemId, LotId, NodeId, OuvrageId, ProjectId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coefficient applied when the margin configuration is degenerate
/// (denominator ≤ 0 or non-finite).
pub const FALLBACK_COEFFICIENT: f64 = 1.2;

/// Margin configuration of a project, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Margins {
    /// Gross margin percentage.
    pub gross: f64,
    /// Net margin percentage.
    pub net: f64,
}

impl Margins {
    /// Create a margin configuration.
    #[must_use]
    pub const fn new(gross: f64, net: f64) -> Self {
        Self { gross, net }
    }

    /// Sell-price coefficient derived from the margins.
    ///
    /// `1 / (1 − gross/100 − net/100)`, falling back to
    /// [`FALLBACK_COEFFICIENT`] when the denominator is not a positive
    /// finite number.
    #[must_use]
    pub fn coefficient(&self) -> f64 {
        let denominator = 1.0 - self.gross / 100.0 - self.net / 100.0;
        if denominator.is_finite() && denominator > 0.0 {
            1.0 / denominator
        } else {
            FALLBACK_COEFFICIENT
        }
    }
}

/// Which of the two sibling tables a shared-space identifier belongs to.
///
/// Ouvrages and blocs allocate from one identifier space (legacy lookups
/// address either kind by bare integer), so the allocator must know which
/// table the candidate row was inserted into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// The candidate row is an ouvrage.
    Ouvrage,
    /// The candidate row is a bloc.
    Bloc,
}

/// Caller identity, supplied by the (external) session layer.
///
/// The engine trusts this as given; it performs membership checks but
/// never authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// Acting user.
    pub user_id: UserId,
    /// Whether the user is an administrator.
    pub is_admin: bool,
}

impl Actor {
    /// Create an actor.
    #[must_use]
    pub const fn new(user_id: UserId, is_admin: bool) -> Self {
        Self { user_id, is_admin }
    }
}

/// Root aggregate of one priced hierarchy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Project {
    /// Row identifier.
    pub id: ProjectId,
    /// Display name.
    pub name: String,
    /// Creating user.
    pub owner_id: UserId,
    /// Gross margin percentage.
    pub gross_margin: f64,
    /// Net margin percentage.
    pub net_margin: f64,
    /// Computed sell price (Σ ouvrage totals × coefficient).
    pub prix_vente: f64,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Association of one shared taxonomy label with one project.
///
/// At most one lot per (project, label) pair; creation is find-or-create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Lot {
    /// Row identifier.
    pub id: LotId,
    /// Owning project.
    pub project_id: ProjectId,
    /// Shared taxonomy label.
    pub label_id: LabelId,
    /// Human-facing ordinal label ("1", "2", …).
    pub designation: Option<String>,
}

/// Macro-node: a major work package under a lot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Ouvrage {
    /// Row identifier (shared space with blocs).
    pub id: OuvrageId,
    /// Owning lot association.
    pub lot_id: LotId,
    /// Human-facing ordinal label ("1.2"-style).
    pub designation: Option<String>,
    /// Display name.
    pub name: String,
    /// Running total over every line item anchored anywhere beneath.
    pub prix_total: f64,
    /// Explicit reorder position; `None` means insertion order.
    pub position: Option<i64>,
}

/// Sub-node: an optional finer grouping under an ouvrage.
///
/// A bloc row may be shared by several ouvrages through the structure
/// index; per-parent attachment is a structure-node row, not a column
/// here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Bloc {
    /// Row identifier (shared space with ouvrages).
    pub id: BlocId,
    /// Human-facing ordinal label ("1.2.3"-style).
    pub designation: Option<String>,
    /// Display name.
    pub name: String,
    /// Unit of measure.
    pub unite: Option<String>,
    /// Quantity; clearing it clears `pu`.
    pub quantite: Option<f64>,
    /// Computed unit price (`pt / quantite` when `quantite > 0`).
    pub pu: Option<f64>,
    /// Computed total over the bloc's line items.
    pub pt: Option<f64>,
    /// Explicit reorder position; `None` means insertion order.
    pub position: Option<i64>,
}

/// Structure-index row anchoring line items to one tree position.
///
/// Maps (ouvrage, bloc-or-null) to a stable node id; `bloc_id = None`
/// means "attached directly to the ouvrage".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct StructureNode {
    /// Row identifier.
    pub id: NodeId,
    /// Parent ouvrage.
    pub ouvrage_id: OuvrageId,
    /// Optional bloc; `None` anchors directly under the ouvrage.
    pub bloc_id: Option<BlocId>,
}

/// Leaf row: one priced catalog-article occurrence at one tree position.
///
/// `catalog_article_id = None` marks a placeholder row kept when the last
/// real line of a lot is removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct LineItem {
    /// Row identifier.
    pub id: LineItemId,
    /// Anchoring structure node.
    pub node_id: NodeId,
    /// Owning project (denormalized for rollup queries).
    pub project_id: ProjectId,
    /// Catalog article, or `None` for a placeholder.
    pub catalog_article_id: Option<i64>,
    /// Name snapshot taken from the catalog at add time.
    pub name: String,
    /// Unit of measure snapshot.
    pub unite: Option<String>,
    /// Quantity.
    pub quantite: f64,
    /// Unit price.
    pub prix_unitaire: f64,
    /// Tax rate percentage.
    pub tva: f64,
    /// Computed pre-tax total.
    pub total_ht: f64,
    /// Computed tax-inclusive total.
    pub total_ttc: f64,
}

impl LineItem {
    /// Whether this row is a placeholder keeping an otherwise-empty lot
    /// visible.
    #[must_use]
    pub const fn is_placeholder(&self) -> bool {
        self.catalog_article_id.is_none()
    }
}

/// Read-only catalog reference data, fetched through
/// [`CatalogLookup`](crate::environment::CatalogLookup).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogArticle {
    /// Catalog identifier.
    pub id: i64,
    /// Article name.
    pub name: String,
    /// Unit of measure.
    pub unite: Option<String>,
    /// Reference unit price.
    pub reference_price: f64,
}

/// Compute line totals from quantity, unit price and tax rate.
#[must_use]
pub fn line_totals(quantite: f64, prix_unitaire: f64, tva: f64) -> (f64, f64) {
    let total_ht = quantite * prix_unitaire;
    let total_ttc = total_ht * (1.0 + tva / 100.0);
    (total_ht, total_ttc)
}
