//! Identifier newtypes for the hierarchy and its logs.
//!
//! Row identifiers are plain `i64` wrappers so they bind directly into
//! `sqlx` queries. Subscriber connections are ephemeral and use UUIDs
//! instead (they never touch the database).

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! row_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            Serialize,
            Deserialize,
            sqlx::Type,
        )]
        #[sqlx(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<i64> for $name {
            fn from(raw: i64) -> Self {
                Self(raw)
            }
        }
    };
}

row_id!(
    /// Unique identifier for a project.
    ProjectId
);
row_id!(
    /// Unique identifier for a lot association within a project.
    LotId
);
row_id!(
    /// Unique identifier for a shared lot taxonomy label.
    LabelId
);
row_id!(
    /// Unique identifier for an ouvrage (macro-node).
    ///
    /// Shares one identifier space with [`BlocId`]: legacy lookups address
    /// either kind by bare integer, so an ouvrage id must never equal any
    /// bloc id.
    OuvrageId
);
row_id!(
    /// Unique identifier for a bloc (sub-node). See [`OuvrageId`] for the
    /// shared identifier space constraint.
    BlocId
);
row_id!(
    /// Unique identifier for a structure-index node.
    NodeId
);
row_id!(
    /// Unique identifier for a line item.
    LineItemId
);
row_id!(
    /// Unique identifier for a user.
    UserId
);
row_id!(
    /// Unique identifier for an event row.
    EventId
);

/// Handle for one live subscriber connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub uuid::Uuid);

impl ConnectionId {
    /// Generate a new random `ConnectionId`.
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
