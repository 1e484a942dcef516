//! Environment traits: the seams between the engine and its collaborators.
//!
//! External services (catalog lookup, push delivery) and cross-crate
//! callbacks (event recording, consistency hooks) are injected through
//! these traits. They use explicit `Pin<Box<dyn Future>>` returns instead
//! of `async fn` so they stay dyn-compatible (`Arc<dyn EventSink>` is
//! captured by spawned post-commit tasks).

use crate::domain::CatalogArticle;
use crate::error::Result;
use crate::event::NewEvent;
use crate::ids::{ProjectId, UserId};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;

/// Boxed future alias used by the dyn-compatible traits below.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Source of the current time.
///
/// Injected so the merge window and retention cutoffs are deterministic
/// in tests.
pub trait Clock: Send + Sync {
    /// Get the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock implementation of [`Clock`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Read-only lookup into the external article catalog.
pub trait CatalogLookup: Send + Sync {
    /// Fetch an article's name, unit and reference price.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`](crate::error::EngineError::NotFound)
    /// when the catalog id is unknown.
    fn fetch_article(&self, catalog_id: i64) -> BoxFuture<'_, Result<CatalogArticle>>;
}

/// Outcome of one push delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Payload accepted by the push service.
    Delivered,
    /// Endpoint is gone (HTTP 404/410-equivalent); the caller must prune
    /// its stored endpoint.
    Expired,
}

/// External push-delivery channel.
///
/// The engine stores endpoints and prunes them on [`PushOutcome::Expired`];
/// transport is entirely the implementor's concern.
pub trait PushChannel: Send + Sync {
    /// Send a payload to one registered endpoint of `user_id`.
    ///
    /// # Errors
    ///
    /// Transport failures are surfaced as errors; the caller logs them as
    /// delivery warnings and never retries within the mutation.
    fn send<'a>(
        &'a self,
        user_id: UserId,
        endpoint: &'a str,
        payload: &'a serde_json::Value,
    ) -> BoxFuture<'a, Result<PushOutcome>>;
}

/// Append-only sink for mutation events.
///
/// Implemented by the notification pipeline; the mutation shell records
/// through this seam post-commit, fire-and-forget.
pub trait EventSink: Send + Sync {
    /// Record one event (merge window, audience, notifications, delivery
    /// all happen behind this call).
    ///
    /// # Errors
    ///
    /// Recording failures are logged by the caller; they never affect the
    /// already-committed mutation.
    fn record(&self, event: NewEvent) -> BoxFuture<'_, Result<()>>;
}

/// Corrective recomputations triggered by non-system events.
///
/// Implemented by the mutation service; called by the notification
/// pipeline, and gated there on the event's `is_system` flag so
/// corrective events cannot re-enter the pipeline.
pub trait ConsistencyHooks: Send + Sync {
    /// Recompute every ouvrage total and the project sell price.
    ///
    /// # Errors
    ///
    /// Failures are downgraded to recalculation warnings by the caller.
    fn refresh_project_prices(&self, project_id: ProjectId) -> BoxFuture<'_, Result<()>>;

    /// Renumber designations across the whole project.
    ///
    /// # Errors
    ///
    /// Failures are downgraded to recalculation warnings by the caller.
    fn refresh_designations(&self, project_id: ProjectId) -> BoxFuture<'_, Result<()>>;
}
