//! Lightweight global metrics for QuiverLevel.
//!
//! Потокобезопасные атомарные счётчики, общие для всех открытых баз процесса:
//! - commits / WAL
//! - checkpoints and WAL retention
//! - block cache
//! - cursors and change feeds

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

// ----- Commits / WAL -----
static COMMITS_TOTAL: AtomicU64 = AtomicU64::new(0);
static COMMIT_OPS_TOTAL: AtomicU64 = AtomicU64::new(0);
static WAL_APPENDS_TOTAL: AtomicU64 = AtomicU64::new(0);
static WAL_BYTES_WRITTEN: AtomicU64 = AtomicU64::new(0);
static WAL_FSYNC_CALLS: AtomicU64 = AtomicU64::new(0);
static WAL_ROTATIONS: AtomicU64 = AtomicU64::new(0);

// ----- Checkpoints -----
static CHECKPOINTS_WRITTEN: AtomicU64 = AtomicU64::new(0);
static WAL_SEGMENTS_DELETED: AtomicU64 = AtomicU64::new(0);

// ----- Block cache -----
static BLOCK_CACHE_HITS: AtomicU64 = AtomicU64::new(0);
static BLOCK_CACHE_MISSES: AtomicU64 = AtomicU64::new(0);

// ----- Cursors / feeds -----
static CURSOR_FETCHES: AtomicU64 = AtomicU64::new(0);
static CURSOR_ROWS: AtomicU64 = AtomicU64::new(0);
static FEED_ENTRIES: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub commits_total: u64,
    pub commit_ops_total: u64,
    pub wal_appends_total: u64,
    pub wal_bytes_written: u64,
    pub wal_fsync_calls: u64,
    pub wal_rotations: u64,

    pub checkpoints_written: u64,
    pub wal_segments_deleted: u64,

    pub block_cache_hits: u64,
    pub block_cache_misses: u64,

    pub cursor_fetches: u64,
    pub cursor_rows: u64,
    pub feed_entries: u64,
}

impl MetricsSnapshot {
    pub fn avg_ops_per_commit(&self) -> f64 {
        if self.commits_total == 0 {
            0.0
        } else {
            self.commit_ops_total as f64 / self.commits_total as f64
        }
    }

    pub fn cache_hit_ratio(&self) -> f64 {
        let total = self.block_cache_hits + self.block_cache_misses;
        if total == 0 {
            0.0
        } else {
            self.block_cache_hits as f64 / total as f64
        }
    }
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "commits: {} (avg ops {:.2})", self.commits_total, self.avg_ops_per_commit())?;
        writeln!(
            f,
            "wal: appends={} bytes={} fsyncs={} rotations={}",
            self.wal_appends_total, self.wal_bytes_written, self.wal_fsync_calls, self.wal_rotations
        )?;
        writeln!(
            f,
            "checkpoints: written={} wal_segments_deleted={}",
            self.checkpoints_written, self.wal_segments_deleted
        )?;
        writeln!(
            f,
            "block_cache: hits={} misses={} ratio={:.3}",
            self.block_cache_hits,
            self.block_cache_misses,
            self.cache_hit_ratio()
        )?;
        write!(
            f,
            "cursors: fetches={} rows={}; feed: entries={}",
            self.cursor_fetches, self.cursor_rows, self.feed_entries
        )
    }
}

// ----- Recorders (commits / WAL) -----
pub fn record_commit(ops: u32) {
    COMMITS_TOTAL.fetch_add(1, Ordering::Relaxed);
    COMMIT_OPS_TOTAL.fetch_add(ops as u64, Ordering::Relaxed);
}

pub fn record_wal_append(bytes: usize) {
    WAL_APPENDS_TOTAL.fetch_add(1, Ordering::Relaxed);
    WAL_BYTES_WRITTEN.fetch_add(bytes as u64, Ordering::Relaxed);
}

pub fn record_wal_fsync() {
    WAL_FSYNC_CALLS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_wal_rotation() {
    WAL_ROTATIONS.fetch_add(1, Ordering::Relaxed);
}

// ----- Recorders (checkpoints) -----
pub fn record_checkpoint() {
    CHECKPOINTS_WRITTEN.fetch_add(1, Ordering::Relaxed);
}

pub fn record_wal_segment_deleted() {
    WAL_SEGMENTS_DELETED.fetch_add(1, Ordering::Relaxed);
}

// ----- Recorders (block cache) -----
pub fn record_cache_hit() {
    BLOCK_CACHE_HITS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_cache_miss() {
    BLOCK_CACHE_MISSES.fetch_add(1, Ordering::Relaxed);
}

// ----- Recorders (cursors / feeds) -----
pub fn record_cursor_fetch(rows: usize) {
    CURSOR_FETCHES.fetch_add(1, Ordering::Relaxed);
    CURSOR_ROWS.fetch_add(rows as u64, Ordering::Relaxed);
}

pub fn record_feed_entry() {
    FEED_ENTRIES.fetch_add(1, Ordering::Relaxed);
}

// ----- Snapshot / Reset -----
pub fn snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        commits_total: COMMITS_TOTAL.load(Ordering::Relaxed),
        commit_ops_total: COMMIT_OPS_TOTAL.load(Ordering::Relaxed),
        wal_appends_total: WAL_APPENDS_TOTAL.load(Ordering::Relaxed),
        wal_bytes_written: WAL_BYTES_WRITTEN.load(Ordering::Relaxed),
        wal_fsync_calls: WAL_FSYNC_CALLS.load(Ordering::Relaxed),
        wal_rotations: WAL_ROTATIONS.load(Ordering::Relaxed),

        checkpoints_written: CHECKPOINTS_WRITTEN.load(Ordering::Relaxed),
        wal_segments_deleted: WAL_SEGMENTS_DELETED.load(Ordering::Relaxed),

        block_cache_hits: BLOCK_CACHE_HITS.load(Ordering::Relaxed),
        block_cache_misses: BLOCK_CACHE_MISSES.load(Ordering::Relaxed),

        cursor_fetches: CURSOR_FETCHES.load(Ordering::Relaxed),
        cursor_rows: CURSOR_ROWS.load(Ordering::Relaxed),
        feed_entries: FEED_ENTRIES.load(Ordering::Relaxed),
    }
}

pub fn reset() {
    COMMITS_TOTAL.store(0, Ordering::Relaxed);
    COMMIT_OPS_TOTAL.store(0, Ordering::Relaxed);
    WAL_APPENDS_TOTAL.store(0, Ordering::Relaxed);
    WAL_BYTES_WRITTEN.store(0, Ordering::Relaxed);
    WAL_FSYNC_CALLS.store(0, Ordering::Relaxed);
    WAL_ROTATIONS.store(0, Ordering::Relaxed);

    CHECKPOINTS_WRITTEN.store(0, Ordering::Relaxed);
    WAL_SEGMENTS_DELETED.store(0, Ordering::Relaxed);

    BLOCK_CACHE_HITS.store(0, Ordering::Relaxed);
    BLOCK_CACHE_MISSES.store(0, Ordering::Relaxed);

    CURSOR_FETCHES.store(0, Ordering::Relaxed);
    CURSOR_ROWS.store(0, Ordering::Relaxed);
    FEED_ENTRIES.store(0, Ordering::Relaxed);
}
