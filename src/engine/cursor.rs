//! engine/cursor — paged, filtered range cursor over one column table.
//!
//! Each `fetch` takes the table read lock once, so a chunk never observes a
//! partial commit. Between fetches the cursor only remembers its position
//! (the last key it scanned), not a snapshot: commits landing between two
//! fetches are visible to the second one if they fall after the position.

use anyhow::{anyhow, Result};
use std::ops::Bound;
use std::sync::Arc;

use super::table::KeyRange;
use super::Engine;
use crate::filter::RowFilter;
use crate::metrics::record_cursor_fetch;

/// One row handed out by a cursor. Fields are None when not requested.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Entry {
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
}

#[derive(Clone, Debug)]
pub struct CursorSpec {
    pub column: u32,
    pub range: KeyRange,
    pub reverse: bool,
    pub filter: RowFilter,
    pub keys: bool,
    pub values: bool,
}

#[derive(Debug, Default)]
pub struct CursorChunk {
    pub rows: Vec<Entry>,
    /// No rows are left after this chunk.
    pub finished: bool,
}

pub struct EngineCursor {
    engine: Arc<Engine>,
    spec: CursorSpec,
    resume: Bound<Vec<u8>>,
    finished: bool,
    sequence: u64,
}

impl EngineCursor {
    pub(super) fn new(engine: Arc<Engine>, spec: CursorSpec) -> Self {
        let sequence = engine.latest_sequence();
        Self {
            engine,
            spec,
            resume: Bound::Unbounded,
            finished: false,
            sequence,
        }
    }

    /// Latest sequence number at cursor creation.
    #[inline]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Reposition: the next fetch starts at `target` (inclusive) in the
    /// iteration direction, still clamped to the cursor range.
    pub fn seek(&mut self, target: &[u8]) {
        self.resume = Bound::Included(target.to_vec());
        self.finished = false;
    }

    /// Up to `max_rows` matching rows; stops early once `max_bytes` of
    /// key+value payload were collected (always at least one row).
    pub fn fetch(&mut self, max_rows: usize, max_bytes: usize) -> Result<CursorChunk> {
        self.engine.ensure_open()?;
        if self.finished || max_rows == 0 {
            return Ok(CursorChunk {
                rows: Vec::new(),
                finished: self.finished,
            });
        }

        let state = self.engine.read_state()?;
        let table = state
            .tables
            .get(&self.spec.column)
            .ok_or_else(|| anyhow!("column {} has no table", self.spec.column))?;

        let resume = match &self.resume {
            Bound::Included(k) => Bound::Included(k.as_slice()),
            Bound::Excluded(k) => Bound::Excluded(k.as_slice()),
            Bound::Unbounded => Bound::Unbounded,
        };

        let mut rows = Vec::new();
        let mut bytes = 0usize;
        let mut last: Option<&Vec<u8>> = None;
        let mut exhausted = true;
        for (k, v) in table.scan(&self.spec.range, self.spec.reverse, resume) {
            if rows.len() >= max_rows || (bytes >= max_bytes && !rows.is_empty()) {
                exhausted = false;
                break;
            }
            last = Some(k);
            if !self.spec.filter.matches(k, v) {
                continue;
            }
            bytes += k.len() + v.len();
            rows.push(Entry {
                key: self.spec.keys.then(|| k.clone()),
                value: self.spec.values.then(|| v.clone()),
            });
        }
        if let Some(k) = last {
            self.resume = Bound::Excluded(k.clone());
        }
        drop(state);

        self.finished = exhausted;
        record_cursor_fetch(rows.len());
        Ok(CursorChunk {
            rows,
            finished: exhausted,
        })
    }
}
