/*
 * Kappa Core - materialized views over append-only logs
 *
 * Sources (pull-based cursors over logs) are folded into views by flows:
 *
 *   pull -> transform -> map -> commit
 *
 * Architecture:
 * - Flow actor (one task per flow, single writer of its state)
 * - Orchestrator (named flows, aggregate ready/pause/resume/reset/close)
 * - Transform pipeline (source, flow and view steps in fixed order)
 * - Merge source (fan-in over child cursors)
 * - Versioned cursor store (cursor + view version per flow)
 */

// Public modules
pub mod api;
pub mod config;
pub mod cursor;
pub mod error;
pub mod flow;
pub mod kappa;
pub mod merge;
pub mod message;
pub mod pipeline;
pub mod source;
pub mod sources;
pub mod telemetry;
pub mod view;

// Re-exports
pub use api::{Api, ApiContext, ApiFn, BoundApi};
pub use config::{ConfigError, KappaConfig};
pub use cursor::{CursorState, CursorStore, InMemoryCursorStore};
pub use error::{KappaError, Result};
pub use flow::{FlowEvent, FlowHandle, FlowOptions, FlowState, FlowStatus};
pub use kappa::{Kappa, KappaEvent, KappaStatus};
pub use merge::MergeSource;
pub use message::{Batch, IndexingProgress, Message, OnIndexed};
pub use pipeline::{transform_fn, Pipeline, Transform};
pub use source::{FlowContext, Source, SourceCapabilities, UpdateNotifier};
pub use sources::{AppendOnlyLog, LogSource, MemoryLog};
pub use view::{View, ViewCapabilities};
