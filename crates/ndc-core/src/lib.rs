//! ndc-core library.
//!
//! Version-history branches for replicated workflow executions, and the
//! conflict resolver that moves an execution onto another branch when a
//! replicated event wins.
//!
//! Leaf first:
//!
//! - [`version_history`]: items, branches and the per-execution branch set.
//! - [`event`] and [`state`]: history events and the state derived from them.
//! - [`store`]: history blobs by branch, executions by compare-and-swap.
//! - [`rebuild`]: replaying a branch into a fresh state.
//! - [`resolver`]: keep or rebuild the cached state for an incoming event.
//! - [`branch`], [`replication`], [`engine`]: applying replicated batches.
//! - [`raw_history`]: reading history by version history item range.
//!
//! # Conventions
//!
//! - **Errors**: [`error::HistoryError`] in the library; `anyhow::Result` at the
//!   edges (config loading, store opening).
//! - **Logging**: Use `tracing` macros (`info!`, `warn!`, `error!`, `debug!`, `trace!`).

pub mod branch;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod event;
pub mod identifier;
pub mod raw_history;
pub mod rebuild;
pub mod replication;
pub mod resolver;
pub mod state;
pub mod store;
pub mod version_history;

pub use engine::HistoryEngine;
pub use error::{ErrorKind, HistoryError};
pub use identifier::WorkflowIdentifier;
pub use replication::{ApplyOutcome, ApplyResult, ReplicationTask};
pub use resolver::ConflictResolver;
pub use version_history::{VersionHistories, VersionHistory, VersionHistoryItem};
