//! db/scan — cursor iterator and one-shot query.
//!
//! Протокол
//! - Rows are pulled in chunks of up to `FETCH_ROWS` rows (or
//!   `high_water_mark_bytes` of payload) from the engine cursor on the
//!   blocking pool, then handed out one by one.
//! - Key/value filters run inside the engine cursor before a row counts:
//!   `limit` caps matching rows, never scanned rows.
//! - Exhaustion (range end or limit reached) releases the cursor right away;
//!   `next()` keeps returning `Ok(None)` afterwards.
//! - The cursor context sits behind an async mutex. A fetch holds the lock
//!   for as long as the blocking call runs, so a close (explicit, or from
//!   `Database::close`) waits for a pending fetch before releasing the cursor.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;

use crate::engine::cursor::{CursorSpec, EngineCursor};
use crate::engine::table::KeyRange;
use crate::error::{Error, Result};
use crate::registry::CloseFuture;
use crate::filter::{Filter, RowFilter};

use super::core::{ColumnHandle, Database};

pub use crate::engine::cursor::Entry;

/// Rows per engine fetch.
pub const FETCH_ROWS: usize = 1000;
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024;

/// Options of `Database::iterator` / `Database::query`.
#[derive(Clone, Debug)]
pub struct IteratorOptions {
    pub gt: Option<Vec<u8>>,
    pub gte: Option<Vec<u8>>,
    pub lt: Option<Vec<u8>>,
    pub lte: Option<Vec<u8>>,
    pub reverse: bool,
    /// Maximum number of matching rows; None is unlimited.
    pub limit: Option<usize>,
    pub keys: bool,
    pub values: bool,
    pub key_filter: Option<Filter>,
    pub value_filter: Option<Filter>,
    pub column: Option<ColumnHandle>,
    /// Accepted for compatibility; the engine table is memory-resident.
    pub fill_cache: bool,
    pub high_water_mark_bytes: usize,
}

impl Default for IteratorOptions {
    fn default() -> Self {
        Self {
            gt: None,
            gte: None,
            lt: None,
            lte: None,
            reverse: false,
            limit: None,
            keys: true,
            values: true,
            key_filter: None,
            value_filter: None,
            column: None,
            fill_cache: true,
            high_water_mark_bytes: DEFAULT_HIGH_WATER_MARK,
        }
    }
}

impl IteratorOptions {
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

    pub fn keys(mut self, on: bool) -> Self {
        self.keys = on;
        self
    }

    pub fn values(mut self, on: bool) -> Self {
        self.values = on;
        self
    }

    /// Regex over keys; a leading `(?i)` makes it case-insensitive.
    pub fn key_filter(mut self, pattern: &str) -> Result<Self> {
        self.key_filter = Some(Filter::new(pattern)?);
        Ok(self)
    }

    pub fn value_filter(mut self, pattern: &str) -> Result<Self> {
        self.value_filter = Some(Filter::new(pattern)?);
        Ok(self)
    }

    pub fn column(mut self, column: &ColumnHandle) -> Self {
        self.column = Some(column.clone());
        self
    }

    pub fn high_water_mark_bytes(mut self, bytes: usize) -> Self {
        self.high_water_mark_bytes = bytes;
        self
    }

    pub(crate) fn range(&self) -> KeyRange {
        KeyRange::from_options(
            self.gt.as_deref(),
            self.gte.as_deref(),
            self.lt.as_deref(),
            self.lte.as_deref(),
        )
    }
}

/// Result of `Database::query`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryResult {
    pub rows: Vec<Entry>,
    /// Latest sequence number when the query started.
    pub sequence: u64,
}

type CursorSlot = Arc<AsyncMutex<Option<EngineCursor>>>;

/// Pull-based cursor over a key range. See the module docs.
pub struct DbIterator {
    db: Database,
    slot: CursorSlot,
    resource: u64,
    buffer: VecDeque<Entry>,
    /// The engine cursor has no rows left.
    drained: bool,
    /// Released: explicitly, by exhaustion, or never to be used again.
    closed: bool,
    limit: Option<usize>,
    returned: usize,
    high_water_mark: usize,
    sequence: u64,
}

impl Database {
    pub async fn iterator(&self, options: IteratorOptions) -> Result<DbIterator> {
        let column = self.column_id(options.column.as_ref())?;
        let spec = CursorSpec {
            column,
            range: options.range(),
            reverse: options.reverse,
            filter: RowFilter {
                key: options.key_filter.clone(),
                value: options.value_filter.clone(),
            },
            keys: options.keys,
            values: options.values,
        };

        // the guard keeps Database::close from running close_all before we attached
        let eref = self.acquire()?;
        let cursor = eref.engine.cursor(spec)?;
        let sequence = cursor.sequence();
        let slot: CursorSlot = Arc::new(AsyncMutex::new(Some(cursor)));

        let release = Arc::clone(&slot);
        let resource = self.shared.resources.attach(Box::new(move || -> CloseFuture {
            Box::pin(async move {
                release.lock().await.take();
            })
        }));
        drop(eref);

        Ok(DbIterator {
            db: self.clone(),
            slot,
            resource,
            buffer: VecDeque::new(),
            drained: false,
            closed: false,
            limit: options.limit,
            returned: 0,
            high_water_mark: options.high_water_mark_bytes,
            sequence,
        })
    }

    /// Read the whole range in one go.
    pub async fn query(&self, options: IteratorOptions) -> Result<QueryResult> {
        let mut it = self.iterator(options).await?;
        let rows = it.all().await;
        let closed = it.close().await;
        let rows = rows?;
        closed?;
        Ok(QueryResult {
            rows,
            sequence: it.sequence(),
        })
    }
}

impl DbIterator {
    /// Latest sequence number when the iterator was created.
    #[inline]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn remaining(&self) -> Option<usize> {
        self.limit.map(|l| l.saturating_sub(self.returned))
    }

    /// Pull the next chunk into the buffer.
    async fn fill(&mut self) -> Result<()> {
        let want = self.remaining().unwrap_or(usize::MAX).min(FETCH_ROWS);
        let hwm = self.high_water_mark;
        let mut guard = Arc::clone(&self.slot).lock_owned().await;
        if guard.is_none() {
            // released by Database::close
            self.closed = true;
            self.db.shared.resources.detach(self.resource);
            return Err(Error::NotOpen);
        }
        let chunk = self
            .db
            .blocking(move |_| match guard.as_mut() {
                Some(cursor) => cursor.fetch(want, hwm),
                None => Err(anyhow::anyhow!("cursor already released")),
            })
            .await?;
        self.drained = chunk.finished;
        self.buffer.extend(chunk.rows);
        Ok(())
    }

    /// Next row, or None once the range (or limit) is exhausted.
    pub async fn next(&mut self) -> Result<Option<Entry>> {
        if self.closed {
            return Ok(None);
        }
        if self.remaining() == Some(0) {
            self.release().await;
            return Ok(None);
        }
        if self.buffer.is_empty() && !self.drained {
            self.fill().await?;
        }
        match self.buffer.pop_front() {
            Some(row) => {
                self.returned += 1;
                if self.buffer.is_empty() && (self.drained || self.remaining() == Some(0)) {
                    self.release().await;
                }
                Ok(Some(row))
            }
            None => {
                self.release().await;
                Ok(None)
            }
        }
    }

    /// Up to `n` rows; fewer only at the end of the range.
    pub async fn next_batch(&mut self, n: usize) -> Result<Vec<Entry>> {
        let mut out = Vec::with_capacity(n.min(FETCH_ROWS));
        while out.len() < n {
            match self.next().await? {
                Some(row) => out.push(row),
                None => break,
            }
        }
        Ok(out)
    }

    /// All remaining rows (honoring `limit`).
    pub async fn all(&mut self) -> Result<Vec<Entry>> {
        let mut out = Vec::new();
        while let Some(row) = self.next().await? {
            out.push(row);
        }
        Ok(out)
    }

    /// Continue from `target` (inclusive) in the iteration direction.
    /// Buffered rows are dropped; rows already returned still count
    /// against the limit.
    pub async fn seek(&mut self, target: impl AsRef<[u8]>) -> Result<()> {
        if self.closed {
            return Err(Error::NotOpen);
        }
        let mut guard = self.slot.lock().await;
        let cursor = guard.as_mut().ok_or(Error::NotOpen)?;
        cursor.seek(target.as_ref());
        self.buffer.clear();
        self.drained = false;
        Ok(())
    }

    async fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.buffer.clear();
        // waits for a fetch still running on the blocking pool
        self.slot.lock().await.take();
        self.db.shared.resources.detach(self.resource);
    }

    /// Release the cursor. A second call is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        self.release().await;
        Ok(())
    }
}

impl Drop for DbIterator {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // A fetch abandoned mid-flight still holds the lock; its blocking task
        // then owns the last reference to the cursor once we detach.
        if let Ok(mut slot) = self.slot.try_lock() {
            slot.take();
        }
        self.db.shared.resources.detach(self.resource);
    }
}

impl std::fmt::Debug for DbIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbIterator")
            .field("returned", &self.returned)
            .field("limit", &self.limit)
            .field("closed", &self.closed)
            .finish()
    }
}
