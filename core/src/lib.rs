//! # Chantier Core
//!
//! Core types and traits for the hierarchy consistency & notification
//! engine: a priced bills-of-quantities tree (Lot → Ouvrage → Bloc →
//! line item) whose denormalized aggregates — totals, unit prices,
//! display numbering — are kept consistent after every mutation, with an
//! append-only event log fanning out to live subscribers.
//!
//! ## Crates
//!
//! - `chantier-core` (this crate): ids, entities, margin math, the error
//!   taxonomy, the event model and the environment traits.
//! - `chantier-store`: sqlx-backed persistence, identifier allocation,
//!   price roll-ups, designation renumbering and the transactional
//!   mutation shell.
//! - `chantier-fanout`: event log, audience computation, notification
//!   fanout, subscriber registry and the retention job.
//! - `chantier-testing`: deterministic clocks and recording mocks.
//!
//! ## Design principles
//!
//! - The relational store is the single source of truth; computed fields
//!   are recomputed inside the mutating transaction, never cached beyond
//!   the next commit.
//! - Notification work is post-commit and best-effort: its failure is
//!   logged, never propagated.
//! - Corrective (system-tagged) events never re-trigger the pipeline.

#![forbid(unsafe_code)]

pub mod config;
pub mod domain;
pub mod environment;
pub mod error;
pub mod event;
pub mod ids;

pub use config::EngineConfig;
pub use domain::{Actor, Margins, NodeKind};
pub use error::{EngineError, Result};
pub use event::{ActionKind, EventRecord, NewEvent};
pub use ids::{
    BlocId, ConnectionId, EventId, LabelId, LineItemId, LotId, NodeId, OuvrageId, ProjectId,
    UserId,
};
