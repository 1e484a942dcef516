//! Notification pipeline: the [`EventSink`] the mutation shell records
//! through after each commit.
//!
//! Per event: persist (merge window) → consistency hooks → notification
//! rows for the audience → live broadcast → push delivery. Every stage
//! after persistence is best-effort: failures are logged as warnings and
//! never surface to the producer.
//!
//! System-tagged events stop after persistence — no hooks, no
//! notifications, no broadcast — so corrective writes can never re-enter
//! the pipeline.

use crate::audience;
use crate::event_log::{EventLog, Recorded};
use crate::registry::SubscriberRegistry;
use chantier_core::config::EngineConfig;
use chantier_core::environment::{BoxFuture, Clock, ConsistencyHooks, EventSink, PushChannel, PushOutcome};
use chantier_core::error::Result;
use chantier_core::event::{EventRecord, NewEvent};
use chantier_core::ids::UserId;
use sqlx::SqlitePool;
use std::sync::{Arc, Mutex, PoisonError};

/// Orchestrates event recording and notification fanout.
pub struct NotificationPipeline {
    log: EventLog,
    pool: SqlitePool,
    registry: Arc<SubscriberRegistry>,
    push: Arc<dyn PushChannel>,
    clock: Arc<dyn Clock>,
    hooks: Mutex<Option<Arc<dyn ConsistencyHooks>>>,
}

impl NotificationPipeline {
    /// Create a pipeline over `pool`.
    pub fn new(
        pool: SqlitePool,
        registry: Arc<SubscriberRegistry>,
        push: Arc<dyn PushChannel>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            log: EventLog::new(pool.clone(), Arc::clone(&clock), config),
            pool,
            registry,
            push,
            clock,
            hooks: Mutex::new(None),
        }
    }

    /// Install the consistency hooks (the mutation service). Separate
    /// from construction because the mutation service itself records
    /// through this pipeline.
    pub fn set_hooks(&self, hooks: Arc<dyn ConsistencyHooks>) {
        *self.hooks.lock().unwrap_or_else(PoisonError::into_inner) = Some(hooks);
    }

    /// The underlying event log.
    #[must_use]
    pub const fn log(&self) -> &EventLog {
        &self.log
    }

    /// Record one event and fan out its notifications.
    ///
    /// # Errors
    ///
    /// Only persistence failures propagate; every later stage is
    /// warn-and-continue.
    pub async fn handle(&self, new: NewEvent) -> Result<Recorded> {
        let recorded = self.log.record(new).await?;
        let event = &recorded.event;

        if event.is_system {
            tracing::debug!(event_id = event.id.0, "system event recorded, triggers suppressed");
            return Ok(recorded);
        }

        self.run_hooks(event).await;

        let payload = event.live_payload();
        self.registry
            .publish(&SubscriberRegistry::project_channel(event.project_id), &payload);

        if recorded.merged {
            // The prior event already notified its audience; the merged
            // diff only refreshes live views.
            return Ok(recorded);
        }

        match self.notify_audience(event, &payload).await {
            Ok(notified) => {
                tracing::debug!(event_id = event.id.0, notified, "notifications created");
            }
            Err(error) => {
                tracing::warn!(%error, event_id = event.id.0, "notification fanout failed");
            }
        }
        Ok(recorded)
    }

    async fn run_hooks(&self, event: &EventRecord) {
        let hooks = self
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(hooks) = hooks else { return };

        if let Err(error) = hooks.refresh_project_prices(event.project_id).await {
            tracing::warn!(%error, project_id = event.project_id.0, "price recalculation failed");
        }
        if event.action.is_structural() {
            if let Err(error) = hooks.refresh_designations(event.project_id).await {
                tracing::warn!(%error, project_id = event.project_id.0, "designation recalculation failed");
            }
        }
    }

    async fn notify_audience(
        &self,
        event: &EventRecord,
        payload: &serde_json::Value,
    ) -> Result<usize> {
        let actor_is_admin: Option<bool> =
            sqlx::query_scalar("SELECT is_admin FROM users WHERE id = ?")
                .bind(event.actor_id)
                .fetch_optional(&self.pool)
                .await?;
        let recipients = audience::compute(
            &self.pool,
            event.project_id,
            event.actor_id,
            actor_is_admin.unwrap_or(false),
        )
        .await?;

        let now = self.clock.now();
        for recipient in &recipients {
            sqlx::query(
                "INSERT INTO notifications (event_id, recipient_id, read, created_at) \
                 VALUES (?, ?, 0, ?)",
            )
            .bind(event.id)
            .bind(recipient)
            .bind(now)
            .execute(&self.pool)
            .await?;

            self.registry
                .publish(&SubscriberRegistry::user_channel(*recipient), payload);
            self.deliver_push(*recipient, payload).await;
        }
        Ok(recipients.len())
    }

    /// Best-effort push delivery: only online users with registered
    /// endpoints; expired endpoints are pruned.
    async fn deliver_push(&self, recipient: UserId, payload: &serde_json::Value) {
        let online: Option<bool> = match sqlx::query_scalar("SELECT online FROM users WHERE id = ?")
            .bind(recipient)
            .fetch_optional(&self.pool)
            .await
        {
            Ok(online) => online,
            Err(error) => {
                tracing::warn!(%error, user_id = recipient.0, "presence lookup failed");
                return;
            }
        };
        if !online.unwrap_or(false) {
            return;
        }

        let endpoints: Vec<(i64, String)> =
            match sqlx::query_as("SELECT id, endpoint FROM push_endpoints WHERE user_id = ?")
                .bind(recipient)
                .fetch_all(&self.pool)
                .await
            {
                Ok(endpoints) => endpoints,
                Err(error) => {
                    tracing::warn!(%error, user_id = recipient.0, "endpoint lookup failed");
                    return;
                }
            };

        for (endpoint_id, endpoint) in endpoints {
            match self.push.send(recipient, &endpoint, payload).await {
                Ok(PushOutcome::Delivered) => {}
                Ok(PushOutcome::Expired) => {
                    tracing::debug!(user_id = recipient.0, endpoint, "pruning expired push endpoint");
                    if let Err(error) = sqlx::query("DELETE FROM push_endpoints WHERE id = ?")
                        .bind(endpoint_id)
                        .execute(&self.pool)
                        .await
                    {
                        tracing::warn!(%error, endpoint_id, "failed to prune push endpoint");
                    }
                }
                Err(error) => {
                    tracing::warn!(%error, user_id = recipient.0, "push delivery failed");
                }
            }
        }
    }
}

impl EventSink for NotificationPipeline {
    fn record(&self, event: NewEvent) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.handle(event).await.map(|_| ()) })
    }
}
