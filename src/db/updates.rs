//! db/updates — change feed over committed writes.
//!
//! Поведение
//! - An `Updates` opened with `since = S` yields exactly the commits with
//!   sequence > S, in commit order, one `Update` per commit. The rows of an
//!   update keep the commit's internal order.
//! - Caught up: without `follow` the feed ends (`Ok(None)`, context released);
//!   with `follow` `next()` suspends until the engine publishes a new WAL
//!   watermark.
//! - Column / data filtering happens per row; a commit whose rows were all
//!   filtered out is skipped, its sequence is still consumed.
//! - Close semantics mirror `DbIterator`: a fetch holds the context lock, a
//!   close waits for it.

use std::sync::Arc;

use tokio::sync::{watch, Mutex as AsyncMutex};

use crate::engine::rep::{EngineBatch, OpKind};
use crate::engine::updates::EngineUpdates;
use crate::error::{Error, Result};
use crate::registry::CloseFuture;

use super::core::{ColumnHandle, Database};

/// Options of `Database::updates`.
#[derive(Clone, Debug)]
pub struct UpdatesOptions {
    /// Exclusive lower bound; 0 replays the retained history.
    pub since: u64,
    pub keys: bool,
    pub values: bool,
    /// Include log-data rows (`put_log_data`).
    pub data: bool,
    /// Only rows of this column.
    pub column: Option<ColumnHandle>,
    /// Wait for new commits instead of ending when caught up.
    pub follow: bool,
}

impl Default for UpdatesOptions {
    fn default() -> Self {
        Self {
            since: 0,
            keys: true,
            values: true,
            data: true,
            column: None,
            follow: false,
        }
    }
}

impl UpdatesOptions {
    pub fn since(mut self, seq: u64) -> Self {
        self.since = seq;
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

    pub fn data(mut self, on: bool) -> Self {
        self.data = on;
        self
    }

    pub fn column(mut self, column: &ColumnHandle) -> Self {
        self.column = Some(column.clone());
        self
    }

    pub fn follow(mut self, on: bool) -> Self {
        self.follow = on;
        self
    }
}

/// One operation of a committed batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateRow {
    pub op: OpKind,
    /// None for log data or when `keys` is off.
    pub key: Option<Vec<u8>>,
    /// None for deletes or when `values` is off.
    pub value: Option<Vec<u8>>,
    /// None for the default column and for log data.
    pub column: Option<ColumnHandle>,
}

/// All rows of one commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Update {
    pub sequence: u64,
    pub rows: Vec<UpdateRow>,
}

type FeedSlot = Arc<AsyncMutex<Option<EngineUpdates>>>;

/// Pull-based change feed. See the module docs.
pub struct Updates {
    db: Database,
    slot: FeedSlot,
    resource: u64,
    written: watch::Receiver<u64>,
    stop: watch::Receiver<bool>,
    options: UpdatesOptions,
    column: Option<u32>,
    last: u64,
    closed: bool,
}

impl Database {
    pub async fn updates(&self, options: UpdatesOptions) -> Result<Updates> {
        let column = match options.column.as_ref() {
            Some(h) => Some(self.column_id(Some(h))?),
            None => None,
        };

        let eref = self.acquire()?;
        let reader = eref.engine.updates(options.since)?;
        let written = eref.engine.subscribe_written();
        let slot: FeedSlot = Arc::new(AsyncMutex::new(Some(reader)));
        let (stop_tx, stop) = watch::channel(false);

        let release = Arc::clone(&slot);
        let resource = self.shared.resources.attach(Box::new(move || -> CloseFuture {
            Box::pin(async move {
                // wake a follower first, it holds no lock while waiting
                let _ = stop_tx.send(true);
                release.lock().await.take();
            })
        }));
        drop(eref);
        log::debug!("updates feed opened since {}", options.since);

        Ok(Updates {
            db: self.clone(),
            slot,
            resource,
            written,
            stop,
            last: options.since,
            options,
            column,
            closed: false,
        })
    }
}

impl Updates {
    /// Sequence of the last commit handed out (initially `since`).
    #[inline]
    pub fn last_sequence(&self) -> u64 {
        self.last
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn lost(&mut self) -> Error {
        self.closed = true;
        self.db.shared.resources.detach(self.resource);
        Error::NotOpen
    }

    /// One engine step: the next commit, or None when caught up.
    async fn fetch(&mut self) -> Result<Option<(u64, EngineBatch)>> {
        let mut guard = Arc::clone(&self.slot).lock_owned().await;
        if guard.is_none() {
            return Err(self.lost());
        }
        self.db
            .blocking(move |_| match guard.as_mut() {
                Some(reader) => reader.next(),
                None => Ok(None),
            })
            .await
    }

    fn rows(&self, batch: &EngineBatch) -> Result<Vec<UpdateRow>> {
        let mut rows = Vec::with_capacity(batch.count() as usize);
        for op in batch.iter() {
            let op = op.map_err(Error::Engine)?;
            if op.kind == OpKind::Data {
                if !self.options.data || self.column.is_some() {
                    continue;
                }
                rows.push(UpdateRow {
                    op: op.kind,
                    key: None,
                    value: self.options.values.then(|| op.value.to_vec()),
                    column: None,
                });
                continue;
            }
            if self.column.map_or(false, |c| c != op.column) {
                continue;
            }
            rows.push(UpdateRow {
                op: op.kind,
                key: self.options.keys.then(|| op.key.to_vec()),
                value: (self.options.values && op.kind.has_value()).then(|| op.value.to_vec()),
                column: self.db.column_for_id(op.column),
            });
        }
        Ok(rows)
    }

    /// Next commit after the current position. None once the feed ended
    /// (caught up without `follow`, or closed).
    pub async fn next(&mut self) -> Result<Option<Update>> {
        loop {
            if self.closed {
                return Ok(None);
            }
            // mark the current watermark seen before reading, so a commit
            // landing during the fetch still wakes the follower below
            self.written.borrow_and_update();

            match self.fetch().await? {
                Some((sequence, batch)) => {
                    self.last = sequence;
                    let rows = self.rows(&batch)?;
                    if rows.is_empty() {
                        continue;
                    }
                    return Ok(Some(Update { sequence, rows }));
                }
                None if !self.options.follow => {
                    self.release().await;
                    return Ok(None);
                }
                None => {
                    if *self.stop.borrow() {
                        return Err(self.lost());
                    }
                    tokio::select! {
                        changed = self.written.changed() => {
                            if changed.is_err() {
                                return Err(self.lost());
                            }
                        }
                        _ = self.stop.changed() => {
                            return Err(self.lost());
                        }
                    }
                }
            }
        }
    }

    async fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.slot.lock().await.take();
        self.db.shared.resources.detach(self.resource);
    }

    /// Release the feed. A second call is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        self.release().await;
        Ok(())
    }
}

impl Drop for Updates {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Ok(mut slot) = self.slot.try_lock() {
            slot.take();
        }
        self.db.shared.resources.detach(self.resource);
    }
}

impl std::fmt::Debug for Updates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Updates")
            .field("last", &self.last)
            .field("follow", &self.options.follow)
            .field("closed", &self.closed)
            .finish()
    }
}
