#![allow(non_snake_case)]

// Базовые модули
pub mod cache;
pub mod config;
pub mod error;
pub mod filter;
pub mod metrics;

// Движок: WAL, checkpoint, таблицы, курсоры, лог обновлений
pub mod engine; // src/engine/{mod,lock,rep,wal,checkpoint,table,columns,cursor,updates}.rs

// Асинхронный слой координации
pub mod db; // src/db/{mod,core,open,kv,batch,scan,updates,maintenance}.rs
mod registry;

// Удобные реэкспорты
pub use cache::{Cache, CacheOptions};
pub use config::{
    ColumnOptions, DbBuilder, DbOptions, InfoLogLevel, MergeOperator, ReadOptions, WriteOptions,
};
pub use db::{
    BatchEntry, ChainedBatch, ClearOptions, ColumnHandle, Database, DbIterator, Entry,
    IteratorOptions, Operation, QueryResult, Status, Update, UpdateRow, Updates, UpdatesOptions,
};
pub use engine::rep::OpKind;
pub use engine::wal::WalFileInfo;
pub use error::{Error, Result};
pub use filter::Filter;
pub use metrics::{snapshot as metrics_snapshot, MetricsSnapshot};
