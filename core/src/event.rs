//! Event model for the append-only mutation log.
//!
//! Every structural or field mutation produces one [`NewEvent`]. The log
//! stores **name snapshots** of the ouvrage/bloc involved, captured at
//! write time, so history stays readable after renames and deletes.
//! Events carry an `is_system` tag: corrective events generated by
//! consistency jobs are persisted for audit but must never re-trigger the
//! recalculation pipeline or any broadcast.

use crate::ids::{BlocId, EventId, LineItemId, OuvrageId, ProjectId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of mutation an event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Project was created.
    ProjectCreated,
    /// Project-level fields (name, margins) were edited.
    ProjectFieldsUpdated,
    /// Project was deleted.
    ProjectDeleted,
    /// Lot association was created.
    LotCreated,
    /// Lot association was deleted.
    LotDeleted,
    /// Ouvrage was created.
    OuvrageCreated,
    /// Ouvrage was renamed.
    OuvrageRenamed,
    /// Ouvrage was deleted.
    OuvrageDeleted,
    /// Ouvrages of one lot were reordered.
    OuvragesReordered,
    /// Bloc was created.
    BlocCreated,
    /// Bloc fields were edited.
    BlocUpdated,
    /// Bloc was detached/deleted.
    BlocDeleted,
    /// Blocs of one ouvrage were reordered.
    BlocsReordered,
    /// Line item was added.
    LineItemAdded,
    /// Line item was edited.
    LineItemUpdated,
    /// Line item was removed.
    LineItemRemoved,
}

impl ActionKind {
    /// Stable wire/storage name of this action.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ProjectCreated => "project_created",
            Self::ProjectFieldsUpdated => "project_fields_updated",
            Self::ProjectDeleted => "project_deleted",
            Self::LotCreated => "lot_created",
            Self::LotDeleted => "lot_deleted",
            Self::OuvrageCreated => "ouvrage_created",
            Self::OuvrageRenamed => "ouvrage_renamed",
            Self::OuvrageDeleted => "ouvrage_deleted",
            Self::OuvragesReordered => "ouvrages_reordered",
            Self::BlocCreated => "bloc_created",
            Self::BlocUpdated => "bloc_updated",
            Self::BlocDeleted => "bloc_deleted",
            Self::BlocsReordered => "blocs_reordered",
            Self::LineItemAdded => "line_item_added",
            Self::LineItemUpdated => "line_item_updated",
            Self::LineItemRemoved => "line_item_removed",
        }
    }

    /// Whether this mutation changes tree shape or occupancy, i.e.
    /// whether designation renumbering must run after it.
    #[must_use]
    pub const fn is_structural(self) -> bool {
        !matches!(
            self,
            Self::ProjectFieldsUpdated
                | Self::OuvrageRenamed
                | Self::BlocUpdated
                | Self::LineItemUpdated
        )
    }

    /// Whether rapid repeats of this action by one actor merge into the
    /// prior event instead of creating a new row.
    ///
    /// Only project-level field updates merge; other kinds are a possible
    /// future extension and deliberately do not.
    #[must_use]
    pub const fn merges(self) -> bool {
        matches!(self, Self::ProjectFieldsUpdated)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error parsing an [`ActionKind`] from its storage name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown action kind: {0}")]
pub struct UnknownActionKind(pub String);

impl FromStr for ActionKind {
    type Err = UnknownActionKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "project_created" => Self::ProjectCreated,
            "project_fields_updated" => Self::ProjectFieldsUpdated,
            "project_deleted" => Self::ProjectDeleted,
            "lot_created" => Self::LotCreated,
            "lot_deleted" => Self::LotDeleted,
            "ouvrage_created" => Self::OuvrageCreated,
            "ouvrage_renamed" => Self::OuvrageRenamed,
            "ouvrage_deleted" => Self::OuvrageDeleted,
            "ouvrages_reordered" => Self::OuvragesReordered,
            "bloc_created" => Self::BlocCreated,
            "bloc_updated" => Self::BlocUpdated,
            "bloc_deleted" => Self::BlocDeleted,
            "blocs_reordered" => Self::BlocsReordered,
            "line_item_added" => Self::LineItemAdded,
            "line_item_updated" => Self::LineItemUpdated,
            "line_item_removed" => Self::LineItemRemoved,
            other => return Err(UnknownActionKind(other.to_string())),
        })
    }
}

/// A mutation event about to be recorded.
///
/// Built by the mutation shell after its transaction commits; name
/// snapshots are captured while the rows still exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    /// What happened.
    pub action: ActionKind,
    /// Who did it.
    pub actor_id: UserId,
    /// Project scope.
    pub project_id: ProjectId,
    /// Ouvrage involved, if any (plain reference, not a foreign key).
    pub ouvrage_id: Option<OuvrageId>,
    /// Bloc involved, if any.
    pub bloc_id: Option<BlocId>,
    /// Line item involved, if any.
    pub line_item_id: Option<LineItemId>,
    /// Ouvrage name at the time of the action.
    pub ouvrage_name: Option<String>,
    /// Bloc name at the time of the action.
    pub bloc_name: Option<String>,
    /// Free-form JSON payload (field diffs, reorder sequences, …).
    pub metadata: serde_json::Value,
    /// `true` for corrective events generated by consistency jobs;
    /// suppresses hooks, notifications and broadcast.
    pub is_system: bool,
}

impl NewEvent {
    /// Start an event for `action` by `actor` on `project`.
    #[must_use]
    pub const fn new(action: ActionKind, actor_id: UserId, project_id: ProjectId) -> Self {
        Self {
            action,
            actor_id,
            project_id,
            ouvrage_id: None,
            bloc_id: None,
            line_item_id: None,
            ouvrage_name: None,
            bloc_name: None,
            metadata: serde_json::Value::Null,
            is_system: false,
        }
    }

    /// Attach the ouvrage reference and its name snapshot.
    #[must_use]
    pub fn ouvrage(mut self, id: OuvrageId, name: impl Into<String>) -> Self {
        self.ouvrage_id = Some(id);
        self.ouvrage_name = Some(name.into());
        self
    }

    /// Attach the bloc reference and its name snapshot.
    #[must_use]
    pub fn bloc(mut self, id: BlocId, name: impl Into<String>) -> Self {
        self.bloc_id = Some(id);
        self.bloc_name = Some(name.into());
        self
    }

    /// Attach the line item reference.
    #[must_use]
    pub const fn line_item(mut self, id: LineItemId) -> Self {
        self.line_item_id = Some(id);
        self
    }

    /// Attach a metadata payload.
    #[must_use]
    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Tag this event as system-generated (no downstream triggers).
    #[must_use]
    pub const fn system(mut self) -> Self {
        self.is_system = true;
        self
    }
}

/// A persisted event row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Row identifier.
    pub id: EventId,
    /// What happened.
    pub action: ActionKind,
    /// Who did it.
    pub actor_id: UserId,
    /// Project scope.
    pub project_id: ProjectId,
    /// Ouvrage involved, if any.
    pub ouvrage_id: Option<OuvrageId>,
    /// Bloc involved, if any.
    pub bloc_id: Option<BlocId>,
    /// Line item involved, if any.
    pub line_item_id: Option<LineItemId>,
    /// Ouvrage name snapshot.
    pub ouvrage_name: Option<String>,
    /// Bloc name snapshot.
    pub bloc_name: Option<String>,
    /// Metadata payload (merged diffs accumulate here).
    pub metadata: serde_json::Value,
    /// System-generated flag.
    pub is_system: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last write timestamp; advanced when later edits merge in.
    pub updated_at: DateTime<Utc>,
}

impl EventRecord {
    /// Structured payload pushed to live subscribers and push endpoints.
    #[must_use]
    pub fn live_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "event_id": self.id.0,
            "action": self.action.as_str(),
            "project_id": self.project_id.0,
            "ouvrage_name": self.ouvrage_name,
            "bloc_name": self.bloc_name,
            "metadata": self.metadata,
            "created_at": self.created_at.to_rfc3339(),
        })
    }
}
