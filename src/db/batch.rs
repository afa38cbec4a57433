//! db/batch — atomic multi-operation writes.
//!
//! Что делает:
//! - `Operation` describes one put/del/merge/log-data step of `Database::batch`.
//! - `ChainedBatch` accumulates operations and commits them as one unit.
//!   Operations apply in append order; a later operation on the same key wins.
//! - Input is validated when an operation is appended, before any engine call.
//! - While a commit is in flight the batch is busy: mutations and a second
//!   write fail fast with `Error::Busy`.
//! - A successful commit (or `close()`) releases the batch; it is inert
//!   afterwards. A failed commit leaves the batch open with its operations.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::WriteOptions;
use crate::engine::rep::{EngineBatch, OpKind};
use crate::error::{Error, Result};

use super::core::{ColumnHandle, Database};

/// One step of an atomic `Database::batch`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Operation {
    pub kind: OpKind,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub column: Option<ColumnHandle>,
}

impl Operation {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: OpKind::Put,
            key: Some(key.into()),
            value: Some(value.into()),
            column: None,
        }
    }

    pub fn del(key: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: OpKind::Delete,
            key: Some(key.into()),
            value: None,
            column: None,
        }
    }

    pub fn merge(key: impl Into<Vec<u8>>, operand: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: OpKind::Merge,
            key: Some(key.into()),
            value: Some(operand.into()),
            column: None,
        }
    }

    /// Out-of-band blob recorded in the commit but not applied to any key.
    pub fn log_data(blob: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: OpKind::Data,
            key: None,
            value: Some(blob.into()),
            column: None,
        }
    }

    pub fn in_column(mut self, column: &ColumnHandle) -> Self {
        self.column = Some(column.clone());
        self
    }
}

/// Pending operation as reported by `ChainedBatch::to_array`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchEntry {
    pub kind: OpKind,
    /// None for log data.
    pub key: Option<Vec<u8>>,
    /// None for deletes.
    pub value: Option<Vec<u8>>,
}

/// Validate `op` and append it to `batch`.
pub(crate) fn append_op(
    db: &Database,
    batch: &mut EngineBatch,
    op: Operation,
    default_column: Option<&ColumnHandle>,
) -> Result<()> {
    let Operation {
        kind,
        key,
        value,
        column,
    } = op;
    if kind == OpKind::Data {
        let blob = value.ok_or(Error::InvalidValue)?;
        batch.put_log_data(&blob);
        return Ok(());
    }
    let key = key.ok_or(Error::InvalidKey)?;
    let col = db.column_id(column.as_ref().or(default_column))?;
    match (kind, value) {
        (OpKind::Delete, _) => batch.delete(col, &key),
        (OpKind::Put, Some(v)) => batch.put(col, &key, &v),
        (OpKind::Merge, Some(v)) => batch.merge(col, &key, &v),
        _ => return Err(Error::InvalidValue),
    }
    Ok(())
}

struct BatchState {
    batch: EngineBatch,
    busy: bool,
    closed: bool,
}

/// Held by the commit itself: clears the busy flag once the commit settled,
/// even when the caller stopped waiting for it.
struct BusyGuard(Arc<Mutex<BatchState>>);

impl BusyGuard {
    fn lock(&self) -> MutexGuard<'_, BatchState> {
        self.0.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// The commit landed: release the batch.
    fn committed(self) {
        let mut st = self.lock();
        st.closed = true;
        st.batch = EngineBatch::new();
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.lock().busy = false;
    }
}

/// Builder of one atomic commit. See the module docs for the state rules.
pub struct ChainedBatch {
    db: Database,
    state: Arc<Mutex<BatchState>>,
}

impl Database {
    pub fn chained_batch(&self) -> ChainedBatch {
        ChainedBatch {
            db: self.clone(),
            state: Arc::new(Mutex::new(BatchState {
                batch: EngineBatch::new(),
                busy: false,
                closed: false,
            })),
        }
    }
}

impl ChainedBatch {
    fn lock(&self) -> MutexGuard<'_, BatchState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// State guard for a mutation: open and not committing.
    fn writable(&self) -> Result<MutexGuard<'_, BatchState>> {
        let st = self.lock();
        if st.closed {
            return Err(Error::BatchNotOpen);
        }
        if st.busy {
            return Err(Error::Busy);
        }
        Ok(st)
    }

    fn push(&self, op: Operation) -> Result<&Self> {
        let mut st = self.writable()?;
        append_op(&self.db, &mut st.batch, op, None)?;
        Ok(self)
    }

    pub fn put(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<&Self> {
        self.push(Operation::put(key.as_ref(), value.as_ref()))
    }

    pub fn put_cf(
        &self,
        column: &ColumnHandle,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
    ) -> Result<&Self> {
        self.push(Operation::put(key.as_ref(), value.as_ref()).in_column(column))
    }

    pub fn del(&self, key: impl AsRef<[u8]>) -> Result<&Self> {
        self.push(Operation::del(key.as_ref()))
    }

    pub fn del_cf(&self, column: &ColumnHandle, key: impl AsRef<[u8]>) -> Result<&Self> {
        self.push(Operation::del(key.as_ref()).in_column(column))
    }

    pub fn merge(&self, key: impl AsRef<[u8]>, operand: impl AsRef<[u8]>) -> Result<&Self> {
        self.push(Operation::merge(key.as_ref(), operand.as_ref()))
    }

    pub fn merge_cf(
        &self,
        column: &ColumnHandle,
        key: impl AsRef<[u8]>,
        operand: impl AsRef<[u8]>,
    ) -> Result<&Self> {
        self.push(Operation::merge(key.as_ref(), operand.as_ref()).in_column(column))
    }

    /// Append an operation built elsewhere (e.g. one with a missing key or value).
    pub fn add(&self, op: Operation) -> Result<&Self> {
        self.push(op)
    }

    pub fn put_log_data(&self, blob: impl AsRef<[u8]>) -> Result<&Self> {
        self.push(Operation::log_data(blob.as_ref()))
    }

    /// Drop pending operations without committing.
    pub fn clear(&self) -> Result<&Self> {
        self.writable()?.batch.clear();
        Ok(self)
    }

    /// Number of pending operations (0 once released).
    pub fn len(&self) -> usize {
        let st = self.lock();
        if st.closed {
            0
        } else {
            st.batch.count() as usize
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Pending operations in append order; recomputed on every call.
    pub fn to_array(&self) -> Result<Vec<BatchEntry>> {
        let st = self.lock();
        if st.closed {
            return Ok(Vec::new());
        }
        let mut out = Vec::with_capacity(st.batch.count() as usize);
        for op in st.batch.iter() {
            let op = op?;
            out.push(BatchEntry {
                kind: op.kind,
                key: (op.kind != OpKind::Data).then(|| op.key.to_vec()),
                value: op.kind.has_value().then(|| op.value.to_vec()),
            });
        }
        Ok(out)
    }

    /// Mark busy and take a copy of the pending batch.
    fn begin_write(&self) -> Result<(EngineBatch, BusyGuard)> {
        let mut st = self.writable()?;
        st.busy = true;
        let batch = st.batch.clone();
        drop(st);
        Ok((batch, BusyGuard(Arc::clone(&self.state))))
    }

    pub async fn write(&self) -> Result<()> {
        self.write_with(&WriteOptions::default()).await
    }

    /// Commit all pending operations atomically.
    ///
    /// The batch is released from inside the engine task, so a write whose
    /// future is dropped mid-commit still leaves the batch closed.
    pub async fn write_with(&self, options: &WriteOptions) -> Result<()> {
        let (batch, busy) = self.begin_write()?;
        let sync = options.sync;
        self.db
            .blocking(move |engine| {
                if !batch.is_empty() {
                    engine.commit(&batch, sync)?;
                }
                busy.committed();
                Ok(())
            })
            .await
    }

    /// Blocking commit on the calling thread.
    pub fn write_sync(&self, options: &WriteOptions) -> Result<()> {
        let (batch, busy) = self.begin_write()?;
        self.db.commit_blocking(&batch, options.sync)?;
        busy.committed();
        Ok(())
    }

    /// Release the batch. Idempotent.
    pub fn close(&self) {
        let mut st = self.lock();
        if !st.closed {
            st.closed = true;
            st.batch = EngineBatch::new();
        }
    }
}

impl std::fmt::Debug for ChainedBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.lock();
        f.debug_struct("ChainedBatch")
            .field("len", &st.batch.count())
            .field("busy", &st.busy)
            .field("closed", &st.closed)
            .finish()
    }
}
