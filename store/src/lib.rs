//! # Chantier Store
//!
//! `SQLite`-backed persistence for the hierarchy engine, built on sqlx.
//!
//! The write side lives here: the shared-identifier-space allocator, the
//! structure index anchoring line items to the tree, the bottom-up price
//! roll-ups, the designation sequencer and the transactional mutation
//! shell tying them together.
//!
//! Within one mutation transaction the order is fixed: identifier
//! allocation (savepoint-retried) → structure indexing → price roll-up →
//! designation renumbering → commit. Event recording happens after the
//! commit, through the injected
//! [`EventSink`](chantier_core::environment::EventSink).

#![forbid(unsafe_code)]

pub mod db;
pub mod identity;
pub mod mutations;
pub mod rollup;
pub mod sequencer;
pub mod structure;

pub use identity::IdentitySpaceResolver;
pub use mutations::{BlocPatch, LineItemPatch, MutationService, ProjectPatch};
pub use rollup::PriceRollupEngine;
pub use sequencer::{DesignationSequencer, RecalcScope};
pub use structure::StructureIndex;
