//! engine/updates — ordered reader of committed batches straight from the WAL.
//!
//! Поведение:
//! - Yields every commit with seq > since, in commit order, one batch per commit.
//! - Reads segment bytes through the database's block cache (if attached).
//! - Reaching the end of the newest segment means "caught up" (Ok(None)); a
//!   later call picks up whatever was appended meanwhile.
//! - If `since + 1` is older than the oldest retained segment the reader
//!   starts at the oldest retained commit.

use anyhow::{anyhow, Result};
use std::sync::Arc;

use super::rep::EngineBatch;
use super::wal::{list_segments, SegmentReader, WalRecord, WAL_HDR_SIZE, WAL_REC_BATCH};
use super::Engine;
use crate::metrics::record_feed_entry;

pub struct EngineUpdates {
    engine: Arc<Engine>,
    last: u64,
    reader: Option<SegmentReader>,
    warned_gap: bool,
}

impl EngineUpdates {
    pub(super) fn new(engine: Arc<Engine>, since: u64) -> Self {
        Self {
            engine,
            last: since,
            reader: None,
            warned_gap: false,
        }
    }

    /// Sequence of the last commit handed out (or `since`).
    #[inline]
    pub fn last_sequence(&self) -> u64 {
        self.last
    }

    /// Open the segment that holds `want`, or None when nothing readable exists yet.
    fn open_segment_for(&mut self, want: u64) -> Result<Option<SegmentReader>> {
        let segs = list_segments(self.engine.root())?;
        let pick = segs
            .iter()
            .rev()
            .find(|s| s.start_sequence <= want)
            .or_else(|| segs.first());
        let Some(seg) = pick else {
            return Ok(None);
        };
        if seg.start_sequence > want && !self.warned_gap {
            log::warn!(
                "updates since {} start at {}: older WAL segments were removed",
                want - 1,
                seg.start_sequence
            );
            self.warned_gap = true;
        }
        if seg.size_bytes < WAL_HDR_SIZE as u64 {
            // segment is being created right now
            return Ok(None);
        }
        let reader = SegmentReader::open(&seg.path, self.engine.identity(), self.engine.cache())?;
        Ok(Some(reader))
    }

    fn next_record(&mut self) -> Result<Option<WalRecord>> {
        loop {
            if self.reader.is_none() {
                match self.open_segment_for(self.last + 1)? {
                    Some(r) => self.reader = Some(r),
                    None => return Ok(None),
                }
            }
            let Some(reader) = self.reader.as_mut() else {
                return Ok(None);
            };
            if let Some(rec) = reader.next_record()? {
                return Ok(Some(rec));
            }

            let current = reader.start_seq();
            let newer = list_segments(self.engine.root())?
                .into_iter()
                .find(|s| s.start_sequence > current);
            let Some(next) = newer else {
                return Ok(None);
            };
            // a newer segment exists, so this one is sealed: drain what was
            // flushed between the two reads before moving on
            if let Some(rec) = reader.next_record()? {
                return Ok(Some(rec));
            }
            if next.size_bytes < WAL_HDR_SIZE as u64 {
                return Ok(None);
            }
            self.reader = Some(SegmentReader::open(
                &next.path,
                self.engine.identity(),
                self.engine.cache(),
            )?);
        }
    }

    /// Next committed batch after the current position.
    pub fn next(&mut self) -> Result<Option<(u64, EngineBatch)>> {
        self.engine.ensure_open()?;
        while let Some(rec) = self.next_record()? {
            if rec.rec_type != WAL_REC_BATCH {
                return Err(anyhow!("unexpected WAL record type {} at seq {}", rec.rec_type, rec.seq));
            }
            if rec.seq <= self.last {
                continue;
            }
            let batch = EngineBatch::from_rep(rec.payload)?;
            self.last = rec.seq;
            record_feed_entry();
            return Ok(Some((rec.seq, batch)));
        }
        Ok(None)
    }
}
