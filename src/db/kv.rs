//! db/kv — point operations and atomic batches.
//!
//! put/del/merge are one-operation batches: they go through exactly the same
//! validation and commit path as `batch()` and chained batches. get is a
//! one-key `get_many`.

use crate::config::{ReadOptions, WriteOptions};
use crate::engine::rep::EngineBatch;
use crate::error::{Error, Result};

use super::batch::{append_op, Operation};
use super::core::Database;

impl Database {
    /// Commit a prepared batch. Empty batches are not committed.
    pub(crate) async fn commit(&self, batch: EngineBatch, sync: bool) -> Result<()> {
        if batch.is_empty() {
            self.acquire()?;
            return Ok(());
        }
        self.blocking(move |engine| engine.commit(&batch, sync).map(|_| ()))
            .await
    }

    /// Same as `commit`, on the calling thread.
    pub(crate) fn commit_blocking(&self, batch: &EngineBatch, sync: bool) -> Result<()> {
        let eref = self.acquire()?;
        if batch.is_empty() {
            return Ok(());
        }
        eref.engine.commit(batch, sync)?;
        Ok(())
    }

    // -------------------- writes --------------------

    pub async fn put(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<()> {
        self.put_with(key, value, &WriteOptions::default()).await
    }

    pub async fn put_with(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        options: &WriteOptions,
    ) -> Result<()> {
        self.batch_with(vec![Operation::put(key.as_ref(), value.as_ref())], options)
            .await
    }

    pub async fn del(&self, key: impl AsRef<[u8]>) -> Result<()> {
        self.del_with(key, &WriteOptions::default()).await
    }

    pub async fn del_with(&self, key: impl AsRef<[u8]>, options: &WriteOptions) -> Result<()> {
        self.batch_with(vec![Operation::del(key.as_ref())], options).await
    }

    /// Combine `operand` with the stored value using the column's merge operator.
    pub async fn merge(&self, key: impl AsRef<[u8]>, operand: impl AsRef<[u8]>) -> Result<()> {
        self.merge_with(key, operand, &WriteOptions::default()).await
    }

    pub async fn merge_with(
        &self,
        key: impl AsRef<[u8]>,
        operand: impl AsRef<[u8]>,
        options: &WriteOptions,
    ) -> Result<()> {
        self.batch_with(vec![Operation::merge(key.as_ref(), operand.as_ref())], options)
            .await
    }

    pub async fn batch(&self, operations: Vec<Operation>) -> Result<()> {
        self.batch_with(operations, &WriteOptions::default()).await
    }

    /// Apply `operations` atomically, in order. Operations without a column
    /// use `options.column` (or the default column).
    pub async fn batch_with(&self, operations: Vec<Operation>, options: &WriteOptions) -> Result<()> {
        let mut batch = EngineBatch::new();
        for op in operations {
            append_op(self, &mut batch, op, options.column.as_ref())?;
        }
        self.commit(batch, options.sync).await
    }

    // -------------------- reads --------------------

    pub async fn get(&self, key: impl AsRef<[u8]>) -> Result<Vec<u8>> {
        self.get_with(key, &ReadOptions::default()).await
    }

    /// Value of `key`; a missing key is `Error::NotFound`.
    pub async fn get_with(&self, key: impl AsRef<[u8]>, options: &ReadOptions) -> Result<Vec<u8>> {
        let mut values = self.get_many_with(vec![key.as_ref().to_vec()], options).await?;
        values.pop().flatten().ok_or(Error::NotFound)
    }

    pub async fn get_many(&self, keys: Vec<Vec<u8>>) -> Result<Vec<Option<Vec<u8>>>> {
        self.get_many_with(keys, &ReadOptions::default()).await
    }

    /// One slot per key, in input order; None for absent keys.
    pub async fn get_many_with(
        &self,
        keys: Vec<Vec<u8>>,
        options: &ReadOptions,
    ) -> Result<Vec<Option<Vec<u8>>>> {
        let column = self.column_id(options.column.as_ref())?;
        self.blocking(move |engine| engine.get_many(column, &keys))
            .await
    }

    /// `get_many_with` on the calling thread, for code outside the runtime.
    pub fn get_many_blocking(
        &self,
        keys: &[Vec<u8>],
        options: &ReadOptions,
    ) -> Result<Vec<Option<Vec<u8>>>> {
        let column = self.column_id(options.column.as_ref())?;
        let eref = self.acquire()?;
        Ok(eref.engine.get_many(column, keys)?)
    }
}
