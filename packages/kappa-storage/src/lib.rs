//! Durable cursor storage for kappa flows
//!
//! Implements [`kappa_core::CursorStore`] on SQLite so cursors and view
//! versions survive restarts.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use kappa_core::{CursorState, Kappa, MemoryLog};
//! use kappa_storage::SqliteCursorStore;
//! use std::sync::Arc;
//!
//! let store = Arc::new(SqliteCursorStore::open("data/cursors.db")?);
//! let kappa = Kappa::new();
//! let source = kappa.log_source(MemoryLog::new("feed"), CursorState::new(store, "feed-view"));
//! kappa.use_flow("feed-view", Arc::new(source), view)?;
//! ```

pub mod domain;
pub mod error;

#[cfg(feature = "sqlite")]
pub mod infrastructure;

pub use domain::CursorRecord;
pub use error::{ErrorKind, Result, StorageError};

#[cfg(feature = "sqlite")]
pub use infrastructure::SqliteCursorStore;
