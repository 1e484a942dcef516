//! Integration tests for the mutation shell: identifier allocation,
//! price roll-ups, designation renumbering and the placeholder rule.

#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use chantier_core::config::EngineConfig;
use chantier_core::domain::{Actor, Margins};
use chantier_core::environment::{Clock, EventSink, SystemClock};
use chantier_core::error::EngineError;
use chantier_core::event::ActionKind;
use chantier_core::ids::{BlocId, ProjectId, UserId};
use chantier_store::{db, BlocPatch, DesignationSequencer, MutationService, ProjectPatch, RecalcScope};
use chantier_testing::mocks::{CollectingSink, FixedClock, NoopSink, StaticCatalog};
use chrono::{TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;

const ACTOR: Actor = Actor::new(UserId(1), false);

async fn service_with(sink: Arc<dyn EventSink>) -> MutationService {
    let pool = db::in_memory().await.expect("in-memory pool");
    let catalog = StaticCatalog::new()
        .with_article(1, "Béton C25/30", Some("m3"), 100.0)
        .with_article(2, "Acier HA500", Some("kg"), 25.0);
    MutationService::new(
        pool,
        Arc::new(catalog),
        sink,
        Arc::new(SystemClock),
        EngineConfig::new(),
    )
}

async fn service() -> MutationService {
    service_with(Arc::new(NoopSink)).await
}

async fn scalar_f64(service: &MutationService, sql: &str, id: i64) -> f64 {
    sqlx::query_scalar(sql)
        .bind(id)
        .fetch_one(service.pool())
        .await
        .expect("scalar query")
}

/// The end-to-end scenario: an ouvrage with a direct line, a bloc with
/// its own line, then the bloc's deletion — totals, unit prices and
/// designations tracked at every step.
#[tokio::test]
async fn scenario_rollups_and_designations_track_the_tree() {
    let sink = Arc::new(CollectingSink::new());
    let service = service_with(Arc::clone(&sink) as Arc<dyn EventSink>).await;

    let project = service
        .create_project(ACTOR, "Villa Azur", Margins::new(0.0, 0.0))
        .await
        .expect("create project");
    let lot = service
        .create_lot(ACTOR, project.id, "Gros œuvre")
        .await
        .expect("create lot");
    let ouvrage = service
        .create_ouvrage(ACTOR, project.id, lot.id, "A")
        .await
        .expect("create ouvrage");

    // Empty project: zero totals, lot numbered "1", ouvrage "1.1".
    assert_eq!(ouvrage.prix_total, 0.0);
    assert_eq!(ouvrage.designation.as_deref(), Some("1.1"));
    let lot_label: Option<String> =
        sqlx::query_scalar("SELECT designation FROM lots WHERE id = ?")
            .bind(lot.id)
            .fetch_one(service.pool())
            .await
            .expect("lot designation");
    assert_eq!(lot_label.as_deref(), Some("1"));
    assert_eq!(
        scalar_f64(&service, "SELECT prix_vente FROM projects WHERE id = ?", project.id.0).await,
        0.0
    );

    // Line attached directly under the ouvrage: 1 × 100, no tax.
    service
        .add_line_item(ACTOR, project.id, ouvrage.id, None, 1, 1.0, 0.0)
        .await
        .expect("add direct line");
    assert_eq!(
        scalar_f64(&service, "SELECT prix_total FROM ouvrages WHERE id = ?", ouvrage.id.0).await,
        100.0
    );

    // Bloc "B" with quantity 2, carrying a 2 × 25 line.
    let bloc = service
        .create_bloc(ACTOR, project.id, ouvrage.id, "B", Some("m2"), Some(2.0))
        .await
        .expect("create bloc");
    assert_eq!(bloc.designation.as_deref(), Some("1.1.1"));
    service
        .add_line_item(ACTOR, project.id, ouvrage.id, Some(bloc.id), 2, 2.0, 0.0)
        .await
        .expect("add bloc line");

    let pt = scalar_f64(&service, "SELECT pt FROM blocs WHERE id = ?", bloc.id.0).await;
    let pu = scalar_f64(&service, "SELECT pu FROM blocs WHERE id = ?", bloc.id.0).await;
    assert!((pt - 50.0).abs() < 1e-9);
    assert!((pu - 25.0).abs() < 1e-9);
    assert_eq!(
        scalar_f64(&service, "SELECT prix_total FROM ouvrages WHERE id = ?", ouvrage.id.0).await,
        150.0
    );
    assert_eq!(
        scalar_f64(&service, "SELECT prix_vente FROM projects WHERE id = ?", project.id.0).await,
        150.0
    );

    // Deleting the bloc removes its lines and recomputes everything.
    service
        .delete_bloc(ACTOR, project.id, ouvrage.id, bloc.id)
        .await
        .expect("delete bloc");
    assert_eq!(
        scalar_f64(&service, "SELECT prix_total FROM ouvrages WHERE id = ?", ouvrage.id.0).await,
        100.0
    );
    let bloc_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM blocs WHERE id = ?")
        .bind(bloc.id)
        .fetch_one(service.pool())
        .await
        .expect("bloc count");
    assert_eq!(bloc_rows, 0);

    // The deletion event preserved the bloc's name.
    let event = wait_for_event(&sink, ActionKind::BlocDeleted).await;
    assert_eq!(event.bloc_name.as_deref(), Some("B"));
    assert_eq!(event.ouvrage_name.as_deref(), Some("A"));
}

async fn wait_for_event(
    sink: &CollectingSink,
    action: ActionKind,
) -> chantier_core::event::NewEvent {
    for _ in 0..100 {
        if let Some(event) = sink.find(action) {
            return event;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("event {action} was never recorded");
}

#[tokio::test]
async fn ouvrage_and_bloc_ids_never_collide() {
    let service = service().await;
    let project = service
        .create_project(ACTOR, "Collisions", Margins::default())
        .await
        .expect("create project");
    let lot = service
        .create_lot(ACTOR, project.id, "Lot")
        .await
        .expect("create lot");

    // Interleave creations so each table's own counter would collide
    // with the sibling table.
    for index in 0..4 {
        let ouvrage = service
            .create_ouvrage(ACTOR, project.id, lot.id, &format!("O{index}"))
            .await
            .expect("create ouvrage");
        service
            .create_bloc(ACTOR, project.id, ouvrage.id, &format!("B{index}"), None, None)
            .await
            .expect("create bloc");
    }

    let ouvrage_ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM ouvrages")
        .fetch_all(service.pool())
        .await
        .expect("ouvrage ids");
    let bloc_ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM blocs")
        .fetch_all(service.pool())
        .await
        .expect("bloc ids");
    assert_eq!(ouvrage_ids.len(), 4);
    assert_eq!(bloc_ids.len(), 4);
    for id in &ouvrage_ids {
        assert!(!bloc_ids.contains(id), "id {id} used by both tables");
    }
}

#[tokio::test]
async fn bloc_unit_price_follows_quantity() {
    let service = service().await;
    let project = service
        .create_project(ACTOR, "PU", Margins::default())
        .await
        .expect("create project");
    let lot = service.create_lot(ACTOR, project.id, "Lot").await.expect("lot");
    let ouvrage = service
        .create_ouvrage(ACTOR, project.id, lot.id, "O")
        .await
        .expect("ouvrage");
    let bloc = service
        .create_bloc(ACTOR, project.id, ouvrage.id, "B", None, Some(2.0))
        .await
        .expect("bloc");
    service
        .add_line_item(ACTOR, project.id, ouvrage.id, Some(bloc.id), 2, 2.0, 0.0)
        .await
        .expect("line");

    let bloc = service
        .update_bloc(
            ACTOR,
            project.id,
            bloc.id,
            BlocPatch {
                quantite: Some(Some(4.0)),
                ..BlocPatch::default()
            },
        )
        .await
        .expect("update quantity");
    assert_eq!(bloc.pt, Some(50.0));
    assert_eq!(bloc.pu, Some(12.5));

    // Clearing the quantity clears the unit price but keeps the total.
    let bloc = service
        .update_bloc(
            ACTOR,
            project.id,
            bloc.id,
            BlocPatch {
                quantite: Some(None),
                ..BlocPatch::default()
            },
        )
        .await
        .expect("clear quantity");
    assert_eq!(bloc.pu, None);
    assert_eq!(bloc.pt, Some(50.0));
}

#[tokio::test]
async fn ouvrage_total_counts_direct_and_bloc_lines_once() {
    let service = service().await;
    let project = service
        .create_project(ACTOR, "Totaux", Margins::default())
        .await
        .expect("project");
    let lot = service.create_lot(ACTOR, project.id, "Lot").await.expect("lot");
    let ouvrage = service
        .create_ouvrage(ACTOR, project.id, lot.id, "O")
        .await
        .expect("ouvrage");
    let bloc = service
        .create_bloc(ACTOR, project.id, ouvrage.id, "B", None, Some(1.0))
        .await
        .expect("bloc");

    // 100 directly under the ouvrage, 50 under the bloc, 20% tax on the
    // direct line.
    service
        .add_line_item(ACTOR, project.id, ouvrage.id, None, 1, 1.0, 20.0)
        .await
        .expect("direct line");
    service
        .add_line_item(ACTOR, project.id, ouvrage.id, Some(bloc.id), 2, 2.0, 0.0)
        .await
        .expect("bloc line");

    let total = scalar_f64(&service, "SELECT prix_total FROM ouvrages WHERE id = ?", ouvrage.id.0).await;
    assert!((total - 170.0).abs() < 1e-9, "total was {total}");

    let pt = scalar_f64(&service, "SELECT pt FROM blocs WHERE id = ?", bloc.id.0).await;
    assert!((pt - 50.0).abs() < 1e-9, "bloc total was {pt}");
}

#[tokio::test]
async fn designations_stay_gap_free_after_delete_and_reorder() {
    let service = service().await;
    let project = service
        .create_project(ACTOR, "Numérotation", Margins::default())
        .await
        .expect("project");
    let lot = service.create_lot(ACTOR, project.id, "Lot").await.expect("lot");

    let first = service
        .create_ouvrage(ACTOR, project.id, lot.id, "Premier")
        .await
        .expect("first");
    let second = service
        .create_ouvrage(ACTOR, project.id, lot.id, "Deuxième")
        .await
        .expect("second");
    let third = service
        .create_ouvrage(ACTOR, project.id, lot.id, "Troisième")
        .await
        .expect("third");

    service
        .delete_ouvrage(ACTOR, project.id, second.id)
        .await
        .expect("delete middle");
    let labels: Vec<Option<String>> = sqlx::query_scalar(
        "SELECT designation FROM ouvrages WHERE lot_id = ? ORDER BY position IS NULL, position, id",
    )
    .bind(lot.id)
    .fetch_all(service.pool())
    .await
    .expect("labels");
    assert_eq!(
        labels,
        vec![Some("1.1".to_string()), Some("1.2".to_string())],
        "no gaps after deleting the middle ouvrage"
    );

    service
        .reorder_ouvrages(ACTOR, project.id, lot.id, &[third.id, first.id])
        .await
        .expect("reorder");
    let ordered: Vec<(String, Option<String>)> = sqlx::query_as(
        "SELECT name, designation FROM ouvrages WHERE lot_id = ? ORDER BY position",
    )
    .bind(lot.id)
    .fetch_all(service.pool())
    .await
    .expect("ordered labels");
    assert_eq!(ordered[0].0, "Troisième");
    assert_eq!(ordered[0].1.as_deref(), Some("1.1"));
    assert_eq!(ordered[1].0, "Premier");
    assert_eq!(ordered[1].1.as_deref(), Some("1.2"));
}

#[tokio::test]
async fn last_line_of_a_lot_becomes_a_placeholder() {
    let service = service().await;
    let project = service
        .create_project(ACTOR, "Placeholder", Margins::default())
        .await
        .expect("project");
    let lot = service.create_lot(ACTOR, project.id, "Lot").await.expect("lot");
    let ouvrage = service
        .create_ouvrage(ACTOR, project.id, lot.id, "O")
        .await
        .expect("ouvrage");
    let line = service
        .add_line_item(ACTOR, project.id, ouvrage.id, None, 1, 1.0, 0.0)
        .await
        .expect("line");

    service
        .remove_line_item(ACTOR, project.id, line.id)
        .await
        .expect("remove last line");

    let (placeholders, total): (i64, f64) = sqlx::query_as(
        "SELECT COUNT(*), COALESCE(SUM(total_ttc), 0) FROM line_items \
         WHERE project_id = ? AND catalog_article_id IS NULL",
    )
    .bind(project.id)
    .fetch_one(service.pool())
    .await
    .expect("placeholder row");
    assert_eq!(placeholders, 1, "last line converts instead of deleting");
    assert_eq!(total, 0.0);
    assert_eq!(
        scalar_f64(&service, "SELECT prix_total FROM ouvrages WHERE id = ?", ouvrage.id.0).await,
        0.0
    );

    // A new real line evicts the placeholder.
    service
        .add_line_item(ACTOR, project.id, ouvrage.id, None, 2, 1.0, 0.0)
        .await
        .expect("new line");
    let placeholders: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM line_items WHERE project_id = ? AND catalog_article_id IS NULL",
    )
    .bind(project.id)
    .fetch_one(service.pool())
    .await
    .expect("placeholder count");
    assert_eq!(placeholders, 0);
}

#[tokio::test]
async fn degenerate_margins_fall_back_to_default_coefficient() {
    let service = service().await;
    let project = service
        .create_project(ACTOR, "Marges", Margins::new(60.0, 40.0))
        .await
        .expect("project");
    let lot = service.create_lot(ACTOR, project.id, "Lot").await.expect("lot");
    let ouvrage = service
        .create_ouvrage(ACTOR, project.id, lot.id, "O")
        .await
        .expect("ouvrage");
    service
        .add_line_item(ACTOR, project.id, ouvrage.id, None, 1, 1.0, 0.0)
        .await
        .expect("line");

    // 1 − 0.6 − 0.4 = 0: coefficient defaults to 1.2.
    let prix_vente =
        scalar_f64(&service, "SELECT prix_vente FROM projects WHERE id = ?", project.id.0).await;
    assert!((prix_vente - 120.0).abs() < 1e-9, "prix_vente was {prix_vente}");
}

#[tokio::test]
async fn margin_update_recomputes_sell_price_without_renumbering() {
    let service = service().await;
    let project = service
        .create_project(ACTOR, "Marges", Margins::new(0.0, 0.0))
        .await
        .expect("project");
    let lot = service.create_lot(ACTOR, project.id, "Lot").await.expect("lot");
    let ouvrage = service
        .create_ouvrage(ACTOR, project.id, lot.id, "O")
        .await
        .expect("ouvrage");
    service
        .add_line_item(ACTOR, project.id, ouvrage.id, None, 1, 1.0, 0.0)
        .await
        .expect("line");

    let before: Option<String> =
        sqlx::query_scalar("SELECT designation FROM ouvrages WHERE id = ?")
            .bind(ouvrage.id)
            .fetch_one(service.pool())
            .await
            .expect("designation");

    let project = service
        .update_project_fields(
            ACTOR,
            project.id,
            ProjectPatch {
                gross_margin: Some(15.0),
                net_margin: Some(5.0),
                ..ProjectPatch::default()
            },
        )
        .await
        .expect("update margins");
    assert!((project.prix_vente - 125.0).abs() < 1e-9);

    let after: Option<String> =
        sqlx::query_scalar("SELECT designation FROM ouvrages WHERE id = ?")
            .bind(ouvrage.id)
            .fetch_one(service.pool())
            .await
            .expect("designation");
    assert_eq!(before, after, "field edit must not renumber");
}

#[tokio::test]
async fn lot_creation_is_find_or_create_per_label() {
    let service = service().await;
    let project = service
        .create_project(ACTOR, "Lots", Margins::default())
        .await
        .expect("project");

    let first = service
        .create_lot(ACTOR, project.id, "Gros œuvre")
        .await
        .expect("first");
    let second = service
        .create_lot(ACTOR, project.id, "Gros œuvre")
        .await
        .expect("second");
    assert_eq!(first.id, second.id);

    let lots: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM lots WHERE project_id = ?")
        .bind(project.id)
        .fetch_one(service.pool())
        .await
        .expect("lot count");
    assert_eq!(lots, 1);
}

#[tokio::test]
async fn non_members_are_rejected_before_any_write() {
    let service = service().await;
    let project = service
        .create_project(ACTOR, "Privé", Margins::default())
        .await
        .expect("project");

    let outsider = Actor::new(UserId(42), false);
    let denied = service.create_lot(outsider, project.id, "Lot").await;
    assert!(matches!(denied, Err(EngineError::AccessDenied)));

    let lots: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM lots")
        .fetch_one(service.pool())
        .await
        .expect("lot count");
    assert_eq!(lots, 0, "rejected mutation must not write");

    let missing = service
        .create_lot(ACTOR, ProjectId(999), "Lot")
        .await;
    assert!(matches!(missing, Err(EngineError::NotFound { .. })));
}

#[tokio::test]
async fn deleting_a_shared_bloc_keeps_it_for_other_parents() {
    let service = service().await;
    let project = service
        .create_project(ACTOR, "Partagé", Margins::default())
        .await
        .expect("project");
    let lot = service.create_lot(ACTOR, project.id, "Lot").await.expect("lot");
    let left = service
        .create_ouvrage(ACTOR, project.id, lot.id, "Gauche")
        .await
        .expect("left");
    let right = service
        .create_ouvrage(ACTOR, project.id, lot.id, "Droite")
        .await
        .expect("right");
    let bloc = service
        .create_bloc(ACTOR, project.id, left.id, "Commun", None, None)
        .await
        .expect("bloc");

    // Attach the same bloc under the second ouvrage through the index.
    let mut tx = service.pool().begin().await.expect("tx");
    chantier_store::StructureIndex::find_or_create(&mut tx, right.id, Some(bloc.id))
        .await
        .expect("second anchor");
    tx.commit().await.expect("commit");

    service
        .delete_bloc(ACTOR, project.id, left.id, bloc.id)
        .await
        .expect("detach from left");
    let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM blocs WHERE id = ?")
        .bind(bloc.id)
        .fetch_one(service.pool())
        .await
        .expect("bloc count");
    assert_eq!(remaining, 1, "bloc still referenced by the other ouvrage");

    service
        .delete_bloc(ACTOR, project.id, right.id, bloc.id)
        .await
        .expect("detach from right");
    let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM blocs WHERE id = ?")
        .bind(bloc.id)
        .fetch_one(service.pool())
        .await
        .expect("bloc count");
    assert_eq!(remaining, 0, "last detach removes the bloc row");
}

#[tokio::test]
async fn project_timestamps_come_from_the_injected_clock() {
    let pool = db::in_memory().await.expect("in-memory pool");
    let start = Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).single().expect("timestamp");
    let clock = Arc::new(FixedClock::new(start));
    let service = MutationService::new(
        pool,
        Arc::new(StaticCatalog::new()),
        Arc::new(NoopSink),
        clock as Arc<dyn Clock>,
        EngineConfig::new(),
    );

    let project = service
        .create_project(ACTOR, "Horodatage", Margins::default())
        .await
        .expect("project");
    assert_eq!(project.created_at, start);
}

#[tokio::test]
async fn sequencer_honours_an_explicit_starting_label() {
    let service = service().await;
    let project = service
        .create_project(ACTOR, "Relabel", Margins::default())
        .await
        .expect("project");
    let lot = service.create_lot(ACTOR, project.id, "Lot").await.expect("lot");
    let ouvrage = service
        .create_ouvrage(ACTOR, project.id, lot.id, "O")
        .await
        .expect("ouvrage");
    let bloc = service
        .create_bloc(ACTOR, project.id, ouvrage.id, "B", None, None)
        .await
        .expect("bloc");

    // Renumber the lot from an overriding label instead of its stored one.
    let mut tx = service.pool().begin().await.expect("tx");
    DesignationSequencer::recalculate(
        &mut tx,
        project.id,
        RecalcScope::lot(lot.id).with_starting_label("7"),
    )
    .await
    .expect("renumber");
    tx.commit().await.expect("commit");

    let label: Option<String> = sqlx::query_scalar("SELECT designation FROM ouvrages WHERE id = ?")
        .bind(ouvrage.id)
        .fetch_one(service.pool())
        .await
        .expect("ouvrage label");
    assert_eq!(label.as_deref(), Some("7.1"));
    let label: Option<String> = sqlx::query_scalar("SELECT designation FROM blocs WHERE id = ?")
        .bind(bloc.id)
        .fetch_one(service.pool())
        .await
        .expect("bloc label");
    assert_eq!(label.as_deref(), Some("7.1.1"));
}

#[tokio::test]
async fn exhausted_rekey_retries_surface_a_conflict_and_roll_back() {
    let service = service().await;
    let project = service
        .create_project(ACTOR, "Allocation", Margins::default())
        .await
        .expect("project");
    let lot = service.create_lot(ACTOR, project.id, "Lot").await.expect("lot");
    let ouvrage = service
        .create_ouvrage(ACTOR, project.id, lot.id, "O")
        .await
        .expect("ouvrage");

    // The first bloc's rowid collides with this ouvrage's id, so the
    // allocator must re-key; freeze bloc ids so every attempt fails.
    sqlx::query(
        "CREATE TRIGGER forbid_bloc_rekey BEFORE UPDATE OF id ON blocs \
         BEGIN SELECT RAISE(ABORT, 'bloc ids frozen'); END",
    )
    .execute(service.pool())
    .await
    .expect("trigger");

    let denied = service
        .create_bloc(ACTOR, project.id, ouvrage.id, "B", None, None)
        .await;
    assert!(matches!(denied, Err(EngineError::Conflict(_))));

    // The whole mutation rolled back, not just the savepoint.
    let blocs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM blocs")
        .fetch_one(service.pool())
        .await
        .expect("bloc count");
    assert_eq!(blocs, 0);
    let anchors: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM structure_nodes WHERE bloc_id IS NOT NULL")
            .fetch_one(service.pool())
            .await
            .expect("anchor count");
    assert_eq!(anchors, 0);

    // Unfreeze: the same creation now re-keys and succeeds.
    sqlx::query("DROP TRIGGER forbid_bloc_rekey")
        .execute(service.pool())
        .await
        .expect("drop trigger");
    let bloc = service
        .create_bloc(ACTOR, project.id, ouvrage.id, "B", None, None)
        .await
        .expect("create after unfreezing");
    assert_ne!(bloc.id.0, ouvrage.id.0);
}

#[tokio::test]
async fn structure_index_is_idempotent_per_pair() {
    let service = service().await;
    let project = service
        .create_project(ACTOR, "Index", Margins::default())
        .await
        .expect("project");
    let lot = service.create_lot(ACTOR, project.id, "Lot").await.expect("lot");
    let ouvrage = service
        .create_ouvrage(ACTOR, project.id, lot.id, "O")
        .await
        .expect("ouvrage");

    let mut tx = service.pool().begin().await.expect("tx");
    let direct_a = chantier_store::StructureIndex::find_or_create(&mut tx, ouvrage.id, None)
        .await
        .expect("first");
    let direct_b = chantier_store::StructureIndex::find_or_create(&mut tx, ouvrage.id, None)
        .await
        .expect("second");
    assert_eq!(direct_a, direct_b);

    let nodes: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM structure_nodes WHERE ouvrage_id = ?")
            .bind(ouvrage.id)
            .fetch_one(&mut *tx)
            .await
            .expect("node count");
    assert_eq!(nodes, 1);
    tx.commit().await.expect("commit");

    let missing = service
        .delete_bloc(ACTOR, project.id, ouvrage.id, BlocId(9999))
        .await;
    assert!(matches!(missing, Err(EngineError::NotFound { .. })));
}
