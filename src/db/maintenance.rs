//! db/maintenance — range delete, properties, compaction and WAL introspection.
//!
//! Реализовано:
//! - Database::clear(ClearOptions): удаляет ключи диапазона одним коммитом.
//! - Database::get_property(name): синхронное чтение свойства движка.
//! - Database::compact_range / compact_range_cf: checkpoint + prune WAL.
//! - Database::flush_wal(sync): сброс буферизованного WAL (manualWalFlush).
//! - Database::current_wal_file / sorted_wal_files.

use crate::engine::table::KeyRange;
use crate::engine::wal::WalFileInfo;
use crate::error::Result;

use super::core::{ColumnHandle, Database};

/// Options of `Database::clear`.
#[derive(Clone, Debug, Default)]
pub struct ClearOptions {
    pub gt: Option<Vec<u8>>,
    pub gte: Option<Vec<u8>>,
    pub lt: Option<Vec<u8>>,
    pub lte: Option<Vec<u8>>,
    /// With a limit: delete from the upper end of the range.
    pub reverse: bool,
    pub limit: Option<usize>,
    pub column: Option<ColumnHandle>,
    pub sync: bool,
}

impl ClearOptions {
    pub fn gt(mut self, key: impl AsRef<[u8]>) -> Self {
        self.gt = Some(key.as_ref().to_vec());
        self
    }

    pub fn gte(mut self, key: impl AsRef<[u8]>) -> Self {
        self.gte = Some(key.as_ref().to_vec());
        self
    }

    pub fn lt(mut self, key: impl AsRef<[u8]>) -> Self {
        self.lt = Some(key.as_ref().to_vec());
        self
    }

    pub fn lte(mut self, key: impl AsRef<[u8]>) -> Self {
        self.lte = Some(key.as_ref().to_vec());
        self
    }

    pub fn reverse(mut self, on: bool) -> Self {
        self.reverse = on;
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn column(mut self, column: &ColumnHandle) -> Self {
        self.column = Some(column.clone());
        self
    }

    pub fn sync(mut self, on: bool) -> Self {
        self.sync = on;
        self
    }
}

impl Database {
    /// Delete the keys of a range atomically. Returns how many keys went away.
    pub async fn clear(&self, options: ClearOptions) -> Result<usize> {
        let column = self.column_id(options.column.as_ref())?;
        let range = KeyRange::from_options(
            options.gt.as_deref(),
            options.gte.as_deref(),
            options.lt.as_deref(),
            options.lte.as_deref(),
        );
        let (reverse, limit, sync) = (options.reverse, options.limit, options.sync);
        let n = self
            .blocking(move |engine| engine.delete_range(column, &range, reverse, limit, sync))
            .await?;
        log::debug!("clear removed {} key(s)", n);
        Ok(n)
    }

    /// Engine property; unknown names give an empty string.
    pub fn get_property(&self, name: &str) -> Result<String> {
        let eref = self.acquire()?;
        Ok(eref.engine.property(name)?)
    }

    /// Compact `[start, end]` of the default column.
    pub async fn compact_range(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<()> {
        self.compact(None, start, end).await
    }

    pub async fn compact_range_cf(
        &self,
        column: &ColumnHandle,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<()> {
        self.compact(Some(column), start, end).await
    }

    async fn compact(
        &self,
        column: Option<&ColumnHandle>,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<()> {
        let column = self.column_id(column)?;
        let range = KeyRange::from_options(None, start, None, end);
        let seq = self
            .blocking(move |engine| engine.compact_range(column, &range))
            .await?;
        log::debug!("compaction checkpointed at seq {}", seq);
        Ok(())
    }

    /// Write WAL bytes buffered under manualWalFlush; `sync` also fsyncs.
    pub async fn flush_wal(&self, sync: bool) -> Result<()> {
        self.blocking(move |engine| engine.flush_wal(sync)).await
    }

    pub async fn current_wal_file(&self) -> Result<WalFileInfo> {
        self.blocking(|engine| engine.current_wal_file()).await
    }

    /// All live WAL segments, oldest first.
    pub async fn sorted_wal_files(&self) -> Result<Vec<WalFileInfo>> {
        self.blocking(|engine| engine.sorted_wal_files()).await
    }
}
