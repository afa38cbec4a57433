//! db — async coordination layer over the engine.
//!
//! Разделение по подмодулям:
//! - core.rs        — Database/Shared, состояния, acquire()/blocking(), ColumnHandle
//! - open.rs        — open/close (RefCounter + ResourceRegistry), column families
//! - kv.rs          — put/get/del/merge, batch(), get_many
//! - batch.rs       — Operation, ChainedBatch (busy/closed)
//! - scan.rs        — DbIterator (fetch/limit/filters), query()
//! - updates.rs     — change feed (since, follow)
//! - maintenance.rs — clear, properties, compact_range, flush_wal, WAL files

pub mod batch;
pub mod core;
pub mod kv;
pub mod maintenance;
pub mod open;
pub mod scan;
pub mod updates;

pub use self::batch::{BatchEntry, ChainedBatch, Operation};
pub use self::core::{ColumnHandle, Database, Status};
pub use self::maintenance::ClearOptions;
pub use self::scan::{DbIterator, Entry, IteratorOptions, QueryResult};
pub use self::updates::{Update, UpdateRow, Updates, UpdatesOptions};
