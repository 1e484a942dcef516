//! # Chantier Fanout
//!
//! Event log and notification fanout for the hierarchy engine.
//!
//! Every committed mutation is recorded as an immutable event carrying
//! ancestor-name snapshots, then fanned out: notification rows for the
//! computed audience, live payloads to the subscriber registry, push
//! delivery to online users' registered endpoints. Rapid repeated project
//! field edits merge into the prior event instead of spamming the team.
//!
//! The pipeline is invoked post-commit and is best-effort by contract:
//! nothing here can fail an already-committed mutation.
//!
//! ## Loop prevention
//!
//! Non-system events trigger the consistency hooks (price and
//! designation refresh) and the live broadcast. System-tagged events —
//! those produced by the consistency jobs themselves — are persisted for
//! audit and trigger nothing, so corrective writes cannot recurse.

#![forbid(unsafe_code)]

pub mod audience;
pub mod event_log;
pub mod pipeline;
pub mod registry;
pub mod retention;

pub use event_log::{EventLog, Recorded};
pub use pipeline::NotificationPipeline;
pub use registry::SubscriberRegistry;
pub use retention::{RetentionHandle, RetentionJob};
