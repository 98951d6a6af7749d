//! Source adapters

pub mod log;

pub use log::{AppendOnlyLog, LogSource, MemoryLog, DEFAULT_MAX_BATCH};
