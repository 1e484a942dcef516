//! Append-only event log with a merge window for rapid repeated edits.
//!
//! Events are persisted with the ancestor-name snapshots the caller
//! captured, so history reads never join against possibly-deleted rows.
//! When the same actor repeats a mergeable action on the same project
//! within the merge window, the new field diff folds into the prior
//! event's metadata instead of creating a new row — one event, one set
//! of notifications, no spam.

use chantier_core::config::EngineConfig;
use chantier_core::environment::Clock;
use chantier_core::error::{EngineError, Result};
use chantier_core::event::{ActionKind, EventRecord, NewEvent};
use chantier_core::ids::{EventId, ProjectId};
use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::sync::Arc;

/// Outcome of recording one event.
#[derive(Debug, Clone)]
pub struct Recorded {
    /// The persisted (or updated) event row.
    pub event: EventRecord,
    /// `true` when the edit was folded into a prior event.
    pub merged: bool,
}

/// Persistence layer for the event log.
#[derive(Clone)]
pub struct EventLog {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl EventLog {
    /// Create an event log over `pool`.
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        Self {
            pool,
            clock,
            config,
        }
    }

    /// Persist `new`, merging into the actor's prior event of the same
    /// action and project when it falls inside the merge window.
    ///
    /// System-tagged events never merge and never absorb merges.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Database`] on persistence failure.
    pub async fn record(&self, new: NewEvent) -> Result<Recorded> {
        let now = self.clock.now();

        if new.action.merges() && !new.is_system {
            if let Some(prior) = self.merge_candidate(&new).await? {
                let age = now - prior.updated_at;
                if age >= Duration::zero()
                    && age <= Duration::seconds(self.config.merge_window_seconds)
                {
                    let metadata = merge_metadata(prior.metadata.clone(), new.metadata);
                    sqlx::query("UPDATE events SET metadata = ?, updated_at = ? WHERE id = ?")
                        .bind(serde_json::to_string(&metadata).map_err(json_err)?)
                        .bind(now)
                        .bind(prior.id)
                        .execute(&self.pool)
                        .await?;
                    let event = self.load(prior.id).await?;
                    tracing::debug!(event_id = event.id.0, "merged event into prior");
                    return Ok(Recorded {
                        event,
                        merged: true,
                    });
                }
            }
        }

        let result = sqlx::query(
            "INSERT INTO events \
             (action, actor_id, project_id, ouvrage_id, bloc_id, line_item_id, \
              ouvrage_name, bloc_name, metadata, is_system, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(new.action.as_str())
        .bind(new.actor_id)
        .bind(new.project_id)
        .bind(new.ouvrage_id)
        .bind(new.bloc_id)
        .bind(new.line_item_id)
        .bind(&new.ouvrage_name)
        .bind(&new.bloc_name)
        .bind(serde_json::to_string(&new.metadata).map_err(json_err)?)
        .bind(new.is_system)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let event = self.load(EventId(result.last_insert_rowid())).await?;
        Ok(Recorded {
            event,
            merged: false,
        })
    }

    /// Load one event row.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] when the row does not exist.
    pub async fn load(&self, id: EventId) -> Result<EventRecord> {
        let row: Option<EventRow> = sqlx::query_as(&format!("{SELECT_EVENT} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or(EngineError::not_found("event", id.0))?.try_into()
    }

    /// All events of one project, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Database`] on query failure.
    pub async fn events_for_project(&self, project_id: ProjectId) -> Result<Vec<EventRecord>> {
        let rows: Vec<EventRow> =
            sqlx::query_as(&format!("{SELECT_EVENT} WHERE project_id = ? ORDER BY id"))
                .bind(project_id)
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(EventRow::try_into).collect()
    }

    /// Delete events created before `cutoff`; their notifications cascade.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Database`] on query failure.
    pub async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let purged = sqlx::query("DELETE FROM events WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if purged > 0 {
            tracing::info!(purged, %cutoff, "purged expired events");
        }
        Ok(purged)
    }

    async fn merge_candidate(&self, new: &NewEvent) -> Result<Option<EventRecord>> {
        let row: Option<EventRow> = sqlx::query_as(&format!(
            "{SELECT_EVENT} WHERE actor_id = ? AND project_id = ? AND action = ? \
             AND is_system = 0 ORDER BY id DESC LIMIT 1"
        ))
        .bind(new.actor_id)
        .bind(new.project_id)
        .bind(new.action.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(EventRow::try_into).transpose()
    }
}

const SELECT_EVENT: &str = "SELECT id, action, actor_id, project_id, ouvrage_id, bloc_id, \
     line_item_id, ouvrage_name, bloc_name, metadata, is_system, created_at, updated_at \
     FROM events";

/// Raw row shape; action and metadata are decoded after fetching.
#[derive(sqlx::FromRow)]
struct EventRow {
    id: i64,
    action: String,
    actor_id: i64,
    project_id: i64,
    ouvrage_id: Option<i64>,
    bloc_id: Option<i64>,
    line_item_id: Option<i64>,
    ouvrage_name: Option<String>,
    bloc_name: Option<String>,
    metadata: String,
    is_system: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for EventRecord {
    type Error = EngineError;

    fn try_from(row: EventRow) -> Result<Self> {
        let action = ActionKind::from_str(&row.action)
            .map_err(|e| EngineError::Database(e.to_string()))?;
        let metadata = serde_json::from_str(&row.metadata).map_err(json_err)?;
        Ok(Self {
            id: EventId(row.id),
            action,
            actor_id: row.actor_id.into(),
            project_id: row.project_id.into(),
            ouvrage_id: row.ouvrage_id.map(Into::into),
            bloc_id: row.bloc_id.map(Into::into),
            line_item_id: row.line_item_id.map(Into::into),
            ouvrage_name: row.ouvrage_name,
            bloc_name: row.bloc_name,
            metadata,
            is_system: row.is_system,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn json_err(e: serde_json::Error) -> EngineError {
    EngineError::Database(format!("metadata encoding failed: {e}"))
}

/// Fold `new` into `prior`: per-key for objects, with one level of
/// sub-object merging so field diffs accumulate under `"fields"`.
fn merge_metadata(prior: serde_json::Value, new: serde_json::Value) -> serde_json::Value {
    match (prior, new) {
        (prior, serde_json::Value::Null) => prior,
        (serde_json::Value::Object(mut prior), serde_json::Value::Object(new)) => {
            for (key, value) in new {
                match (prior.get_mut(&key), value) {
                    (Some(serde_json::Value::Object(existing)), serde_json::Value::Object(incoming)) => {
                        for (inner_key, inner_value) in incoming {
                            existing.insert(inner_key, inner_value);
                        }
                    }
                    (_, value) => {
                        prior.insert(key, value);
                    }
                }
            }
            serde_json::Value::Object(prior)
        }
        (_, new) => new,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn field_diffs_accumulate_under_fields() {
        let prior = json!({ "fields": { "name": { "from": "a", "to": "b" } } });
        let new = json!({ "fields": { "gross_margin": { "from": 10.0, "to": 12.0 } } });
        let merged = merge_metadata(prior, new);
        assert_eq!(merged["fields"]["name"]["to"], "b");
        assert_eq!(merged["fields"]["gross_margin"]["to"], 12.0);
    }

    #[test]
    fn later_diff_of_same_field_wins() {
        let prior = json!({ "fields": { "name": { "from": "a", "to": "b" } } });
        let new = json!({ "fields": { "name": { "from": "b", "to": "c" } } });
        let merged = merge_metadata(prior, new);
        assert_eq!(merged["fields"]["name"]["to"], "c");
    }

    #[test]
    fn null_payload_keeps_prior() {
        let prior = json!({ "fields": {} });
        assert_eq!(merge_metadata(prior.clone(), serde_json::Value::Null), prior);
    }
}
