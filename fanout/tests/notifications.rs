//! Integration tests for the notification pipeline: merge window,
//! audience rules, the system-event gate, push pruning and retention.

#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use chantier_core::config::EngineConfig;
use chantier_core::domain::{Actor, Margins};
use chantier_core::environment::{BoxFuture, Clock, ConsistencyHooks, EventSink, PushChannel};
use chantier_core::error::Result;
use chantier_core::event::{ActionKind, NewEvent};
use chantier_core::ids::{EventId, OuvrageId, ProjectId, UserId};
use chantier_fanout::{NotificationPipeline, RetentionJob, SubscriberRegistry};
use chantier_store::{db, MutationService};
use chantier_testing::mocks::{FixedClock, RecordingPush, StaticCatalog};
use chantier_testing::seed;
use chrono::{Duration, TimeZone, Utc};
use serde_json::json;
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const PROJECT: ProjectId = ProjectId(1);
const ALICE: UserId = UserId(1); // actor in most tests
const BOB: UserId = UserId(2); // plain member, online
const CHLOE: UserId = UserId(3); // member who muted the project
const ADMIN: UserId = UserId(9); // platform admin, not a member

struct Env {
    pool: SqlitePool,
    clock: Arc<FixedClock>,
    push: Arc<RecordingPush>,
    registry: Arc<SubscriberRegistry>,
    pipeline: Arc<NotificationPipeline>,
    config: EngineConfig,
}

/// One project with three members (one muted) and one outside admin.
async fn env() -> Env {
    let pool = db::in_memory().await.expect("in-memory pool");
    let start = Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).single().expect("timestamp");
    let clock = Arc::new(FixedClock::new(start));
    let push = Arc::new(RecordingPush::new());
    let registry = Arc::new(SubscriberRegistry::new());
    let config = EngineConfig::new();
    let pipeline = Arc::new(NotificationPipeline::new(
        pool.clone(),
        Arc::clone(&registry),
        Arc::clone(&push) as Arc<dyn PushChannel>,
        Arc::clone(&clock) as Arc<dyn Clock>,
        config,
    ));

    seed::user(&pool, ALICE, "Alice", false, false).await.expect("alice");
    seed::user(&pool, BOB, "Bob", false, true).await.expect("bob");
    seed::user(&pool, CHLOE, "Chloé", false, true).await.expect("chloé");
    seed::user(&pool, ADMIN, "Dana", true, false).await.expect("admin");
    sqlx::query(
        "INSERT INTO projects (id, name, owner_id, gross_margin, net_margin, prix_vente, created_at) \
         VALUES (?, 'Villa Azur', ?, 0, 0, 0, ?)",
    )
    .bind(PROJECT)
    .bind(ALICE)
    .bind(clock.now())
    .execute(&pool)
    .await
    .expect("project row");
    seed::member(&pool, PROJECT, ALICE, false).await.expect("member alice");
    seed::member(&pool, PROJECT, BOB, false).await.expect("member bob");
    seed::member(&pool, PROJECT, CHLOE, true).await.expect("member chloé");

    Env {
        pool,
        clock,
        push,
        registry,
        pipeline,
        config,
    }
}

fn field_update(actor: UserId, field: &str, to: &str) -> NewEvent {
    NewEvent::new(ActionKind::ProjectFieldsUpdated, actor, PROJECT)
        .metadata(json!({ "fields": { field: { "to": to } } }))
}

async fn recipients_of(pool: &SqlitePool, event_id: EventId) -> Vec<i64> {
    sqlx::query_scalar(
        "SELECT recipient_id FROM notifications WHERE event_id = ? ORDER BY recipient_id",
    )
    .bind(event_id)
    .fetch_all(pool)
    .await
    .expect("recipients")
}

#[tokio::test]
async fn rapid_field_edits_merge_into_one_event() {
    let env = env().await;

    let first = env
        .pipeline
        .handle(field_update(ALICE, "name", "Villa Azur II"))
        .await
        .expect("first edit");
    assert!(!first.merged);

    // 3 s later: inside the window, folds into the first row.
    env.clock.advance(Duration::seconds(3));
    let second = env
        .pipeline
        .handle(field_update(ALICE, "gross_margin", "12"))
        .await
        .expect("second edit");
    assert!(second.merged);
    assert_eq!(second.event.id, first.event.id);
    assert_eq!(second.event.metadata["fields"]["name"]["to"], "Villa Azur II");
    assert_eq!(second.event.metadata["fields"]["gross_margin"]["to"], "12");

    // Merged edits refresh the row without re-notifying.
    assert_eq!(recipients_of(&env.pool, first.event.id).await.len(), 2);
    let events = env
        .pipeline
        .log()
        .events_for_project(PROJECT)
        .await
        .expect("events");
    assert_eq!(events.len(), 1);

    // 6 s later: outside the window, a new row.
    env.clock.advance(Duration::seconds(6));
    let third = env
        .pipeline
        .handle(field_update(ALICE, "name", "Villa Azur III"))
        .await
        .expect("third edit");
    assert!(!third.merged);
    assert_ne!(third.event.id, first.event.id);
    let events = env
        .pipeline
        .log()
        .events_for_project(PROJECT)
        .await
        .expect("events");
    assert_eq!(events.len(), 2);
}

#[tokio::test]
async fn merge_window_is_per_actor() {
    let env = env().await;

    env.pipeline
        .handle(field_update(ALICE, "name", "A"))
        .await
        .expect("alice edit");
    let bob = env
        .pipeline
        .handle(field_update(BOB, "name", "B"))
        .await
        .expect("bob edit");
    assert!(!bob.merged, "another actor's edit must not fold in");
}

#[tokio::test]
async fn audience_excludes_actor_and_muted_members_and_adds_admins() {
    let env = env().await;

    let recorded = env
        .pipeline
        .handle(
            NewEvent::new(ActionKind::OuvrageCreated, ALICE, PROJECT)
                .ouvrage(OuvrageId(10), "Fondations"),
        )
        .await
        .expect("event");

    // Alice acted, Chloé muted: Bob and the admin remain.
    assert_eq!(recipients_of(&env.pool, recorded.event.id).await, vec![BOB.0, ADMIN.0]);
}

#[tokio::test]
async fn admin_actors_do_not_summon_other_admins() {
    let env = env().await;

    let recorded = env
        .pipeline
        .handle(
            NewEvent::new(ActionKind::OuvrageDeleted, ADMIN, PROJECT)
                .ouvrage(OuvrageId(10), "Fondations"),
        )
        .await
        .expect("event");

    assert_eq!(recipients_of(&env.pool, recorded.event.id).await, vec![ALICE.0, BOB.0]);
}

#[derive(Default)]
struct CountingHooks {
    prices: AtomicUsize,
    designations: AtomicUsize,
}

impl ConsistencyHooks for CountingHooks {
    fn refresh_project_prices(&self, _project_id: ProjectId) -> BoxFuture<'_, Result<()>> {
        self.prices.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }

    fn refresh_designations(&self, _project_id: ProjectId) -> BoxFuture<'_, Result<()>> {
        self.designations.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}

#[tokio::test]
async fn system_events_are_persisted_but_trigger_nothing() {
    let env = env().await;
    let hooks = Arc::new(CountingHooks::default());
    env.pipeline.set_hooks(Arc::clone(&hooks) as Arc<dyn ConsistencyHooks>);
    let (_id, mut project_rx) = env
        .registry
        .subscribe(&SubscriberRegistry::project_channel(PROJECT));

    let recorded = env
        .pipeline
        .handle(
            NewEvent::new(ActionKind::BlocUpdated, ALICE, PROJECT)
                .metadata(json!({ "corrected": "pt" }))
                .system(),
        )
        .await
        .expect("system event");

    assert_eq!(hooks.prices.load(Ordering::SeqCst), 0);
    assert_eq!(hooks.designations.load(Ordering::SeqCst), 0);
    assert!(recipients_of(&env.pool, recorded.event.id).await.is_empty());
    assert!(project_rx.try_recv().is_err(), "no broadcast for system events");

    // Still on the record for audit.
    let events = env
        .pipeline
        .log()
        .events_for_project(PROJECT)
        .await
        .expect("events");
    assert_eq!(events.len(), 1);
    assert!(events[0].is_system);

    // A regular structural event runs both hooks.
    env.pipeline
        .handle(
            NewEvent::new(ActionKind::OuvrageCreated, ALICE, PROJECT)
                .ouvrage(OuvrageId(10), "Fondations"),
        )
        .await
        .expect("regular event");
    assert_eq!(hooks.prices.load(Ordering::SeqCst), 1);
    assert_eq!(hooks.designations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn non_structural_events_skip_designation_refresh() {
    let env = env().await;
    let hooks = Arc::new(CountingHooks::default());
    env.pipeline.set_hooks(Arc::clone(&hooks) as Arc<dyn ConsistencyHooks>);

    env.pipeline
        .handle(field_update(ALICE, "name", "Villa Azur II"))
        .await
        .expect("field edit");

    assert_eq!(hooks.prices.load(Ordering::SeqCst), 1);
    assert_eq!(hooks.designations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn broadcast_reaches_project_and_recipient_channels() {
    let env = env().await;
    let (_p, mut project_rx) = env
        .registry
        .subscribe(&SubscriberRegistry::project_channel(PROJECT));
    let (_b, mut bob_rx) = env
        .registry
        .subscribe(&SubscriberRegistry::user_channel(BOB));
    let (_a, mut alice_rx) = env
        .registry
        .subscribe(&SubscriberRegistry::user_channel(ALICE));

    env.pipeline
        .handle(
            NewEvent::new(ActionKind::BlocDeleted, ALICE, PROJECT)
                .ouvrage(OuvrageId(10), "Fondations")
                .bloc(chantier_core::ids::BlocId(11), "Semelle"),
        )
        .await
        .expect("event");

    let live = project_rx.try_recv().expect("project broadcast");
    assert_eq!(live["action"], "bloc_deleted");
    assert_eq!(live["bloc_name"], "Semelle");
    assert!(bob_rx.try_recv().is_ok(), "recipients get a user-channel copy");
    assert!(alice_rx.try_recv().is_err(), "the actor does not notify themselves");
}

#[tokio::test]
async fn expired_push_endpoints_are_pruned() {
    let env = env().await;
    seed::push_endpoint(&env.pool, BOB, "push:alive").await.expect("endpoint");
    seed::push_endpoint(&env.pool, BOB, "push:stale").await.expect("endpoint");
    env.push.expire("push:stale");

    env.pipeline
        .handle(
            NewEvent::new(ActionKind::OuvrageCreated, ALICE, PROJECT)
                .ouvrage(OuvrageId(10), "Fondations"),
        )
        .await
        .expect("event");

    let delivered: Vec<String> = env
        .push
        .sent()
        .into_iter()
        .filter(|(user, _, _)| *user == BOB)
        .map(|(_, endpoint, _)| endpoint)
        .collect();
    assert_eq!(delivered, vec!["push:alive".to_string()]);

    let remaining: Vec<String> =
        sqlx::query_scalar("SELECT endpoint FROM push_endpoints WHERE user_id = ?")
            .bind(BOB)
            .fetch_all(&env.pool)
            .await
            .expect("endpoints");
    assert_eq!(remaining, vec!["push:alive".to_string()]);
}

#[tokio::test]
async fn offline_members_are_notified_without_push() {
    let env = env().await;
    seed::user(&env.pool, BOB, "Bob", false, false).await.expect("bob offline");
    seed::push_endpoint(&env.pool, BOB, "push:bob").await.expect("endpoint");

    let recorded = env
        .pipeline
        .handle(
            NewEvent::new(ActionKind::OuvrageCreated, ALICE, PROJECT)
                .ouvrage(OuvrageId(10), "Fondations"),
        )
        .await
        .expect("event");

    assert!(recipients_of(&env.pool, recorded.event.id).await.contains(&BOB.0));
    assert!(env.push.sent().is_empty(), "no push while offline");
}

#[tokio::test]
async fn retention_purges_old_events_and_their_notifications() {
    let env = env().await;

    let old = env
        .pipeline
        .handle(
            NewEvent::new(ActionKind::OuvrageCreated, ALICE, PROJECT)
                .ouvrage(OuvrageId(10), "Fondations"),
        )
        .await
        .expect("old event");
    assert!(!recipients_of(&env.pool, old.event.id).await.is_empty());

    env.clock.advance(Duration::days(61));
    let fresh = env
        .pipeline
        .handle(
            NewEvent::new(ActionKind::OuvrageCreated, ALICE, PROJECT)
                .ouvrage(OuvrageId(12), "Toiture"),
        )
        .await
        .expect("fresh event");

    let job = RetentionJob::new(
        env.pipeline.log().clone(),
        Arc::clone(&env.clock) as Arc<dyn Clock>,
        env.config,
    );
    let purged = job.run_once().await.expect("purge");
    assert_eq!(purged, 1);

    let events = env
        .pipeline
        .log()
        .events_for_project(PROJECT)
        .await
        .expect("events");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].id, fresh.event.id);
    assert!(recipients_of(&env.pool, old.event.id).await.is_empty(), "cascade");
}

/// Full wiring: the mutation service records through the pipeline, the
/// pipeline calls back into the service through the hooks.
#[tokio::test]
async fn mutations_flow_through_the_pipeline_end_to_end() {
    let env = env().await;
    let catalog = Arc::new(StaticCatalog::new().with_article(1, "Béton C25/30", Some("m3"), 100.0));
    let service = MutationService::new(
        env.pool.clone(),
        catalog,
        Arc::clone(&env.pipeline) as Arc<dyn EventSink>,
        Arc::clone(&env.clock) as Arc<dyn Clock>,
        env.config,
    );
    env.pipeline
        .set_hooks(Arc::new(service.clone()) as Arc<dyn ConsistencyHooks>);

    let actor = Actor::new(ALICE, false);
    let project = service
        .create_project(actor, "Maison Dorée", Margins::new(0.0, 0.0))
        .await
        .expect("project");
    assert_eq!(project.created_at, env.clock.now());
    let lot = service.create_lot(actor, project.id, "Gros œuvre").await.expect("lot");
    let ouvrage = service
        .create_ouvrage(actor, project.id, lot.id, "Fondations")
        .await
        .expect("ouvrage");
    service
        .add_line_item(actor, project.id, ouvrage.id, None, 1, 2.0, 0.0)
        .await
        .expect("line");
    service
        .delete_ouvrage(actor, project.id, ouvrage.id)
        .await
        .expect("delete");

    // Recording is post-commit and spawned, so poll the log.
    let mut deleted = None;
    for _ in 0..100 {
        let events = env
            .pipeline
            .log()
            .events_for_project(project.id)
            .await
            .expect("events");
        deleted = events
            .into_iter()
            .find(|event| event.action == ActionKind::OuvrageDeleted);
        if deleted.is_some() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    let deleted = deleted.expect("deletion event recorded");
    assert_eq!(deleted.ouvrage_name.as_deref(), Some("Fondations"));

    let ouvrages: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ouvrages WHERE id = ?")
        .bind(ouvrage.id)
        .fetch_one(&env.pool)
        .await
        .expect("count");
    assert_eq!(ouvrages, 0, "the event outlives the row it names");
}
