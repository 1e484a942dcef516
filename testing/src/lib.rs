//! # Chantier Testing
//!
//! Testing utilities for the hierarchy engine:
//!
//! - Mock implementations of the environment traits (clock, catalog,
//!   push channel, event sink)
//! - Seed helpers for the identity-shaped tables (users, memberships,
//!   push endpoints)
//!
//! ## Example
//!
//! ```ignore
//! use chantier_testing::mocks::{FixedClock, StaticCatalog};
//! use chrono::Utc;
//!
//! let clock = FixedClock::new(Utc::now());
//! let catalog = StaticCatalog::new().with_article(1, "Béton C25/30", Some("m3"), 120.0);
//! ```

#![forbid(unsafe_code)]

/// Mock implementations of the environment traits.
pub mod mocks {
    use chantier_core::domain::CatalogArticle;
    use chantier_core::environment::{
        BoxFuture, CatalogLookup, Clock, EventSink, PushChannel, PushOutcome,
    };
    use chantier_core::error::{EngineError, Result};
    use chantier_core::event::{ActionKind, NewEvent};
    use chantier_core::ids::UserId;
    use chrono::{DateTime, Duration, Utc};
    use std::collections::{HashMap, HashSet};
    use std::sync::{Mutex, PoisonError};

    /// Settable clock for deterministic tests.
    ///
    /// Starts at a fixed instant; advance it explicitly to cross the
    /// merge or retention windows.
    #[derive(Debug)]
    pub struct FixedClock {
        time: Mutex<DateTime<Utc>>,
    }

    impl FixedClock {
        /// Create a clock frozen at `time`.
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Mutex::new(time),
            }
        }

        /// Move the clock forward.
        pub fn advance(&self, by: Duration) {
            let mut guard = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *guard += by;
        }

        /// Jump the clock to an absolute instant.
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = time;
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// In-memory catalog of reference articles.
    #[derive(Debug, Clone, Default)]
    pub struct StaticCatalog {
        articles: HashMap<i64, CatalogArticle>,
    }

    impl StaticCatalog {
        /// Create an empty catalog.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Add an article.
        #[must_use]
        pub fn with_article(
            mut self,
            id: i64,
            name: &str,
            unite: Option<&str>,
            reference_price: f64,
        ) -> Self {
            self.articles.insert(
                id,
                CatalogArticle {
                    id,
                    name: name.to_string(),
                    unite: unite.map(ToString::to_string),
                    reference_price,
                },
            );
            self
        }
    }

    impl CatalogLookup for StaticCatalog {
        fn fetch_article(&self, catalog_id: i64) -> BoxFuture<'_, Result<CatalogArticle>> {
            let article = self.articles.get(&catalog_id).cloned();
            Box::pin(async move {
                article.ok_or(EngineError::not_found("catalog article", catalog_id))
            })
        }
    }

    /// Push channel recording every delivery; endpoints can be scripted
    /// to report themselves expired.
    #[derive(Debug, Default)]
    pub struct RecordingPush {
        sent: Mutex<Vec<(UserId, String, serde_json::Value)>>,
        expired: Mutex<HashSet<String>>,
    }

    impl RecordingPush {
        /// Create a push channel that delivers everything.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Script `endpoint` to report [`PushOutcome::Expired`].
        pub fn expire(&self, endpoint: &str) {
            self.expired
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(endpoint.to_string());
        }

        /// Deliveries recorded so far.
        #[must_use]
        pub fn sent(&self) -> Vec<(UserId, String, serde_json::Value)> {
            self.sent
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }
    }

    impl PushChannel for RecordingPush {
        fn send<'a>(
            &'a self,
            user_id: UserId,
            endpoint: &'a str,
            payload: &'a serde_json::Value,
        ) -> BoxFuture<'a, Result<PushOutcome>> {
            Box::pin(async move {
                let expired = self
                    .expired
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .contains(endpoint);
                if expired {
                    return Ok(PushOutcome::Expired);
                }
                self.sent
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push((user_id, endpoint.to_string(), payload.clone()));
                Ok(PushOutcome::Delivered)
            })
        }
    }

    /// Event sink that drops everything (for tests exercising the store
    /// without a pipeline).
    #[derive(Debug, Clone, Copy, Default)]
    pub struct NoopSink;

    impl EventSink for NoopSink {
        fn record(&self, _event: NewEvent) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    /// Event sink collecting every recorded event in memory.
    #[derive(Debug, Default)]
    pub struct CollectingSink {
        events: Mutex<Vec<NewEvent>>,
    }

    impl CollectingSink {
        /// Create an empty sink.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Events recorded so far.
        #[must_use]
        pub fn events(&self) -> Vec<NewEvent> {
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        /// First recorded event of `action`, if any.
        #[must_use]
        pub fn find(&self, action: ActionKind) -> Option<NewEvent> {
            self.events()
                .into_iter()
                .find(|event| event.action == action)
        }
    }

    impl EventSink for CollectingSink {
        fn record(&self, event: NewEvent) -> BoxFuture<'_, Result<()>> {
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event);
            Box::pin(async { Ok(()) })
        }
    }
}

/// Seed helpers for the identity-shaped tables.
pub mod seed {
    use chantier_core::error::Result;
    use chantier_core::ids::{ProjectId, UserId};
    use sqlx::SqlitePool;

    /// Insert or replace a user row.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn user(
        pool: &SqlitePool,
        id: UserId,
        name: &str,
        is_admin: bool,
        online: bool,
    ) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO users (id, name, is_admin, online) VALUES (?, ?, ?, ?)")
            .bind(id)
            .bind(name)
            .bind(is_admin)
            .bind(online)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Add a project member.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn member(
        pool: &SqlitePool,
        project_id: ProjectId,
        user_id: UserId,
        muted: bool,
    ) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO project_members (project_id, user_id, muted) VALUES (?, ?, ?)",
        )
        .bind(project_id)
        .bind(user_id)
        .bind(muted)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Register a push endpoint for a user.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn push_endpoint(pool: &SqlitePool, user_id: UserId, endpoint: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO push_endpoints (user_id, endpoint) VALUES (?, ?)")
            .bind(user_id)
            .bind(endpoint)
            .execute(pool)
            .await?;
        Ok(())
    }
}
