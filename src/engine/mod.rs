//! engine — the bundled embedded ordered KV engine.
//!
//! Назначение
//! - The coordination layer (db, batch, iterator, updates) only talks to the
//!   primitives exposed here: open/close, commit, get_many, cursor, updates,
//!   property, checkpoint, flush_wal, WAL file listing.
//! - All calls are blocking; the async layer runs them on the blocking pool.
//!
//! Раскладка каталога
//! - LOCK                         — exclusive process lock (fs2)
//! - IDENTITY                     — random 128-bit hex id, written on creation
//! - COLUMNS                      — column-family registry (JSON)
//! - wal-<seq:020>.log            — WAL segments, one record per commit
//! - checkpoint-<seq:020>.dat     — full table image at a sequence number
//!
//! Порядок записи
//! 1) commit mutex: assign seq = last + 1, append WAL record (fsync if sync)
//! 2) apply to tables under the state write lock (after releasing the commit
//!    mutex when unordered_write is on)
//! 3) publish latest sequence and the written WAL watermark

pub mod checkpoint;
pub mod columns;
pub mod cursor;
pub mod lock;
pub mod rep;
pub mod table;
pub mod updates;
pub mod wal;

use anyhow::{anyhow, Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime};

use tokio::sync::watch;

use crate::cache::Cache;
use crate::config::{ColumnOptions, DbOptions, InfoLogLevel, MergeOperator};
use crate::metrics::{record_checkpoint, record_commit, record_wal_segment_deleted, snapshot};

pub use columns::{DEFAULT_COLUMN, DEFAULT_COLUMN_ID};

use columns::ColumnRegistry;
use cursor::{CursorSpec, EngineCursor};
use lock::{try_lock_exclusive, LockGuard};
use rep::{EngineBatch, OpKind};
use table::{KeyRange, Table};
use updates::EngineUpdates;
use wal::{
    list_segments, truncate_segment, SegmentReader, WalFileInfo, WalWriter, WalWriterCfg,
    WAL_HDR_SIZE,
};

pub const IDENTITY_FILE: &str = "IDENTITY";

/// Engine log line, emitted only when `info_log_level` admits `$lvl`.
macro_rules! info_log {
    ($eng:expr, $lvl:expr, $($arg:tt)+) => {
        if $eng.log_enabled($lvl) {
            log::log!(target: "quiverlevel::engine", $lvl, $($arg)+);
        }
    };
}

pub(crate) struct State {
    pub(crate) tables: HashMap<u32, Table>,
    columns: ColumnRegistry,
    merge: HashMap<u32, MergeOperator>,
}

impl State {
    fn apply(&mut self, batch: &EngineBatch) -> Result<()> {
        for op in batch.iter() {
            let op = op?;
            if op.kind == OpKind::Data {
                continue;
            }
            let merge = self.merge.get(&op.column).copied().unwrap_or_default();
            let table = self
                .tables
                .get_mut(&op.column)
                .ok_or_else(|| anyhow!("unknown column id {}", op.column))?;
            match op.kind {
                OpKind::Put => table.put(op.key, op.value),
                OpKind::Delete => table.delete(op.key),
                OpKind::Merge => table.merge(op.key, op.value, merge),
                OpKind::Data => {}
            }
        }
        Ok(())
    }

    fn check_columns(&self, batch: &EngineBatch) -> Result<()> {
        for op in batch.iter() {
            let op = op?;
            if op.kind != OpKind::Data && !self.tables.contains_key(&op.column) {
                return Err(anyhow!("unknown column id {}", op.column));
            }
        }
        Ok(())
    }
}

struct CommitState {
    writer: WalWriter,
    last_seq: u64,
    bytes_since_checkpoint: u64,
}

/// Engine-level subset of `DbOptions`.
#[derive(Clone, Debug)]
struct EngineCfg {
    wal_ttl_ms: u64,
    wal_size_limit: u64,
    unordered_write: bool,
    info_log_level: Option<InfoLogLevel>,
    merge_operator: MergeOperator,
    write_buffer_size: u64,
}

pub struct Engine {
    root: PathBuf,
    identity: String,
    cfg: EngineCfg,
    cache: Option<Cache>,
    state: RwLock<State>,
    commit: Mutex<CommitState>,
    /// Unordered commits appended to the WAL but not yet applied.
    inflight: Mutex<usize>,
    inflight_cv: Condvar,
    latest_seq: AtomicU64,
    checkpoint_seq: AtomicU64,
    written: watch::Sender<u64>,
    closed: AtomicBool,
    _lock: LockGuard,
}

fn generate_identity() -> String {
    use rand::RngCore;
    let mut rng = rand::rngs::OsRng;
    format!("{:016x}{:016x}", rng.next_u64(), rng.next_u64())
}

fn load_or_create_identity(root: &Path) -> Result<String> {
    let p = root.join(IDENTITY_FILE);
    if p.exists() {
        let s = fs::read_to_string(&p).with_context(|| format!("read {}", p.display()))?;
        let s = s.trim().to_string();
        if s.is_empty() {
            return Err(anyhow!("empty IDENTITY file in {}", root.display()));
        }
        return Ok(s);
    }
    let id = generate_identity();
    let tmp = root.join(format!("{IDENTITY_FILE}.tmp"));
    fs::write(&tmp, format!("{id}\n")).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, &p).with_context(|| format!("rename {} -> {}", tmp.display(), p.display()))?;
    Ok(id)
}

fn merge_for(entry_op: Option<&str>, default: MergeOperator) -> MergeOperator {
    entry_op.and_then(MergeOperator::parse).unwrap_or(default)
}

impl Engine {
    /// Open (or create) the engine at `root`: lock, load the newest
    /// checkpoint, replay the WAL behind it, start a fresh WAL segment.
    pub fn open(root: &Path, opts: &DbOptions) -> Result<Self> {
        let exists = root.join(IDENTITY_FILE).exists();
        if exists && opts.error_if_exists {
            return Err(anyhow!("database already exists (errorIfExists is set)"));
        }
        if !exists && !opts.create_if_missing {
            return Err(anyhow!("database does not exist (createIfMissing is false)"));
        }
        fs::create_dir_all(root).with_context(|| format!("create {}", root.display()))?;
        let lock = try_lock_exclusive(root)?;
        let identity = load_or_create_identity(root)?;

        let mut columns = ColumnRegistry::load(root)?;
        let mut dirty = !root.join("COLUMNS").exists();
        for name in &opts.columns {
            dirty |= columns.ensure(name, None).1;
        }
        if dirty {
            columns.save(root)?;
        }

        let (mut tables, ckpt_seq) = match checkpoint::load_latest(root)? {
            Some(img) => (img.tables.into_iter().collect::<HashMap<_, _>>(), img.seq),
            None => (HashMap::new(), 0),
        };
        let mut merge = HashMap::new();
        for c in &columns.columns {
            tables.entry(c.id).or_insert_with(Table::new);
            merge.insert(c.id, merge_for(c.merge_operator.as_deref(), opts.merge_operator));
        }
        let mut state = State {
            tables,
            columns,
            merge,
        };

        let last_seq = replay_wal(root, &identity, &mut state, ckpt_seq)?;

        let writer = WalWriter::create(
            root,
            last_seq + 1,
            WalWriterCfg {
                compression: opts.wal_compression,
                manual_flush: opts.manual_wal_flush,
                segment_bytes: opts.wal_segment_bytes.max(WAL_HDR_SIZE as u64 + 1),
            },
        )?;

        let (written, _) = watch::channel(last_seq);
        let engine = Self {
            root: root.to_path_buf(),
            identity,
            cfg: EngineCfg {
                wal_ttl_ms: opts.wal_ttl_ms,
                wal_size_limit: opts.wal_size_limit,
                unordered_write: opts.unordered_write,
                info_log_level: opts.info_log_level,
                merge_operator: opts.merge_operator,
                write_buffer_size: opts.write_buffer_size,
            },
            cache: opts.cache.clone(),
            state: RwLock::new(state),
            commit: Mutex::new(CommitState {
                writer,
                last_seq,
                bytes_since_checkpoint: 0,
            }),
            inflight: Mutex::new(0),
            inflight_cv: Condvar::new(),
            latest_seq: AtomicU64::new(last_seq),
            checkpoint_seq: AtomicU64::new(ckpt_seq),
            written,
            closed: AtomicBool::new(false),
            _lock: lock,
        };
        info_log!(
            engine,
            log::Level::Info,
            "engine opened at {} (checkpoint seq {}, latest seq {})",
            root.display(),
            ckpt_seq,
            last_seq
        );
        Ok(engine)
    }

    fn log_enabled(&self, level: log::Level) -> bool {
        self.cfg
            .info_log_level
            .map_or(false, |l| level <= l.level_filter())
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    #[inline]
    pub fn cache(&self) -> Option<Cache> {
        self.cache.clone()
    }

    /// Sequence of the newest commit visible to reads.
    #[inline]
    pub fn latest_sequence(&self) -> u64 {
        self.latest_seq.load(Ordering::Acquire)
    }

    pub fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(anyhow!("engine is closed"));
        }
        Ok(())
    }

    pub(crate) fn read_state(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state.read().map_err(|_| anyhow!("engine state lock poisoned"))
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state.write().map_err(|_| anyhow!("engine state lock poisoned"))
    }

    fn lock_commit(&self) -> Result<MutexGuard<'_, CommitState>> {
        self.commit.lock().map_err(|_| anyhow!("commit lock poisoned"))
    }

    /// Raise the written watermark; it never moves backwards.
    fn publish_written(&self, seq: u64) {
        self.written.send_if_modified(|w| {
            if *w < seq {
                *w = seq;
                true
            } else {
                false
            }
        });
    }

    // -------------------- columns --------------------

    /// (id, name) of every column, default first.
    pub fn columns(&self) -> Result<Vec<(u32, String)>> {
        let st = self.read_state()?;
        let mut out: Vec<_> = st
            .columns
            .columns
            .iter()
            .map(|c| (c.id, c.name.clone()))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        Ok(out)
    }

    pub fn column_id(&self, name: &str) -> Result<Option<u32>> {
        Ok(self.read_state()?.columns.by_name(name).map(|c| c.id))
    }

    /// Create (or look up) a column family; new columns are persisted.
    pub fn create_column(&self, name: &str, opts: ColumnOptions) -> Result<u32> {
        self.ensure_open()?;
        if name.is_empty() {
            return Err(anyhow!("column name must not be empty"));
        }
        let mut st = self.write_state()?;
        let op_name = opts.merge_operator.map(MergeOperator::as_str);
        let (id, created) = st.columns.ensure(name, op_name);
        if created {
            if let Err(e) = st.columns.save(&self.root) {
                st.columns.columns.retain(|c| c.id != id);
                return Err(e);
            }
            st.tables.insert(id, Table::new());
            let op = opts.merge_operator.unwrap_or(self.cfg.merge_operator);
            st.merge.insert(id, op);
            info_log!(self, log::Level::Info, "column {:?} created with id {}", name, id);
        }
        Ok(id)
    }

    // -------------------- writes --------------------

    /// Commit `batch` atomically. Returns its sequence number.
    pub fn commit(&self, batch: &EngineBatch, sync: bool) -> Result<u64> {
        self.ensure_open()?;
        self.read_state()?.check_columns(batch)?;

        let mut c = self.lock_commit()?;
        let seq = c.last_seq + 1;
        let bytes = c.writer.append(seq, batch.data(), sync)?;
        c.last_seq = seq;
        c.bytes_since_checkpoint += bytes as u64;
        record_commit(batch.count());

        if self.cfg.unordered_write {
            *self.inflight.lock().map_err(|_| anyhow!("inflight lock poisoned"))? += 1;
            let written_seq = c.writer.written_seq();
            let need_checkpoint = c.bytes_since_checkpoint >= self.cfg.write_buffer_size;
            drop(c);

            let applied = self.write_state().and_then(|mut st| st.apply(batch));
            {
                let mut n = self.inflight.lock().map_err(|_| anyhow!("inflight lock poisoned"))?;
                *n -= 1;
                self.inflight_cv.notify_all();
            }
            applied?;
            self.latest_seq.fetch_max(seq, Ordering::AcqRel);
            self.publish_written(written_seq);
            if need_checkpoint {
                self.checkpoint()?;
            }
        } else {
            self.write_state()?.apply(batch)?;
            self.latest_seq.store(seq, Ordering::Release);
            self.publish_written(c.writer.written_seq());
            if c.bytes_since_checkpoint >= self.cfg.write_buffer_size {
                self.checkpoint_locked(&mut c)?;
            }
        }
        info_log!(self, log::Level::Debug, "commit seq {} ({} ops)", seq, batch.count());
        Ok(seq)
    }

    /// Delete the keys of `range` in one commit. Returns how many were deleted.
    pub fn delete_range(
        &self,
        column: u32,
        range: &KeyRange,
        reverse: bool,
        limit: Option<usize>,
        sync: bool,
    ) -> Result<usize> {
        self.ensure_open()?;
        let mut batch = EngineBatch::new();
        {
            let st = self.read_state()?;
            let table = st
                .tables
                .get(&column)
                .ok_or_else(|| anyhow!("unknown column id {}", column))?;
            let keys = table.scan(range, reverse, std::ops::Bound::Unbounded);
            for (k, _) in keys.take(limit.unwrap_or(usize::MAX)) {
                batch.delete(column, k);
            }
        }
        if batch.is_empty() {
            return Ok(0);
        }
        self.commit(&batch, sync)?;
        Ok(batch.count() as usize)
    }

    /// Write WAL records buffered by manual_wal_flush; fsync when `sync`.
    pub fn flush_wal(&self, sync: bool) -> Result<()> {
        self.ensure_open()?;
        let mut c = self.lock_commit()?;
        c.writer.flush(sync)?;
        self.publish_written(c.writer.written_seq());
        Ok(())
    }

    // -------------------- reads --------------------

    /// Positional lookup; None for absent keys.
    pub fn get_many(&self, column: u32, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>> {
        self.ensure_open()?;
        let st = self.read_state()?;
        let table = st
            .tables
            .get(&column)
            .ok_or_else(|| anyhow!("unknown column id {}", column))?;
        Ok(keys.iter().map(|k| table.get(k).cloned()).collect())
    }

    pub fn cursor(self: &Arc<Self>, spec: CursorSpec) -> Result<EngineCursor> {
        self.ensure_open()?;
        if !self.read_state()?.tables.contains_key(&spec.column) {
            return Err(anyhow!("unknown column id {}", spec.column));
        }
        Ok(EngineCursor::new(Arc::clone(self), spec))
    }

    /// Reader over commits with sequence > `since`.
    pub fn updates(self: &Arc<Self>, since: u64) -> Result<EngineUpdates> {
        self.ensure_open()?;
        Ok(EngineUpdates::new(Arc::clone(self), since))
    }

    /// Watermark of WAL records readable by `updates`.
    pub fn subscribe_written(&self) -> watch::Receiver<u64> {
        self.written.subscribe()
    }

    // -------------------- maintenance --------------------

    /// Write a checkpoint of all tables and prune covered WAL segments.
    pub fn checkpoint(&self) -> Result<u64> {
        self.ensure_open()?;
        let mut c = self.lock_commit()?;
        self.checkpoint_locked(&mut c)
    }

    /// The bundled engine has no per-range compaction; the range is advisory
    /// and a full checkpoint is taken.
    pub fn compact_range(&self, column: u32, range: &KeyRange) -> Result<u64> {
        info_log!(
            self,
            log::Level::Debug,
            "compact_range column {} {:?}..{:?}",
            column,
            range.lower,
            range.upper
        );
        self.checkpoint()
    }

    fn wait_unordered(&self) -> Result<()> {
        let mut n = self.inflight.lock().map_err(|_| anyhow!("inflight lock poisoned"))?;
        while *n > 0 {
            n = self
                .inflight_cv
                .wait(n)
                .map_err(|_| anyhow!("inflight lock poisoned"))?;
        }
        Ok(())
    }

    fn checkpoint_locked(&self, c: &mut CommitState) -> Result<u64> {
        self.wait_unordered()?;
        c.writer.flush(true)?;
        let seq = c.last_seq;

        let have = self.checkpoint_seq.load(Ordering::Acquire);
        let exists = checkpoint::list_checkpoints(&self.root)?
            .last()
            .map_or(false, |(s, _)| *s == seq);
        if seq != have || !exists {
            let st = self.read_state()?;
            let tables: BTreeMap<u32, &Table> = st.tables.iter().map(|(id, t)| (*id, t)).collect();
            checkpoint::write_checkpoint(&self.root, seq, &tables)?;
            drop(st);
            checkpoint::remove_older(&self.root, seq)?;
            self.checkpoint_seq.store(seq, Ordering::Release);
            record_checkpoint();
            info_log!(self, log::Level::Info, "checkpoint written at seq {}", seq);
        }

        c.writer.rotate(seq + 1)?;
        c.bytes_since_checkpoint = 0;
        self.publish_written(c.writer.written_seq());
        let removed = self.prune_wal(c.writer.start_seq())?;
        if removed > 0 {
            info_log!(self, log::Level::Info, "removed {} covered WAL segment(s)", removed);
        }
        Ok(seq)
    }

    /// Delete sealed segments (all start before `active_start`, so all are
    /// covered by the checkpoint) according to walTTL / walSizeLimit.
    fn prune_wal(&self, active_start: u64) -> Result<usize> {
        let ttl = self.cfg.wal_ttl_ms;
        let limit = self.cfg.wal_size_limit;
        let now = SystemTime::now();
        let mut kept_bytes = 0u64;
        let mut removed = 0usize;

        let sealed: Vec<WalFileInfo> = list_segments(&self.root)?
            .into_iter()
            .filter(|s| s.start_sequence < active_start)
            .collect();
        for seg in sealed.iter().rev() {
            let age = fs::metadata(&seg.path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| now.duration_since(t).ok())
                .unwrap_or(Duration::ZERO);
            let expired = ttl > 0 && age > Duration::from_millis(ttl);
            let oversize = limit > 0 && kept_bytes + seg.size_bytes > limit;
            if (ttl == 0 && limit == 0) || expired || oversize {
                fs::remove_file(&seg.path)
                    .with_context(|| format!("remove {}", seg.path.display()))?;
                record_wal_segment_deleted();
                removed += 1;
            } else {
                kept_bytes += seg.size_bytes;
            }
        }
        Ok(removed)
    }

    // -------------------- introspection --------------------

    pub fn sorted_wal_files(&self) -> Result<Vec<WalFileInfo>> {
        self.ensure_open()?;
        list_segments(&self.root)
    }

    pub fn current_wal_file(&self) -> Result<WalFileInfo> {
        self.ensure_open()?;
        let c = self.lock_commit()?;
        let path = c.writer.path().to_path_buf();
        let size_bytes = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        Ok(WalFileInfo {
            path,
            start_sequence: c.writer.start_seq(),
            size_bytes,
        })
    }

    /// Engine property by name; unknown names yield an empty string.
    pub fn property(&self, name: &str) -> Result<String> {
        self.ensure_open()?;
        let out = match name {
            "quiverlevel.estimate-num-keys" => {
                let st = self.read_state()?;
                st.tables.values().map(Table::len).sum::<usize>().to_string()
            }
            "quiverlevel.latest-sequence" => self.latest_sequence().to_string(),
            "quiverlevel.oldest-sequence" => list_segments(&self.root)?
                .first()
                .map(|s| s.start_sequence)
                .unwrap_or_else(|| self.latest_sequence() + 1)
                .to_string(),
            "quiverlevel.wal-bytes" => list_segments(&self.root)?
                .iter()
                .map(|s| s.size_bytes)
                .sum::<u64>()
                .to_string(),
            "quiverlevel.wal-files" => list_segments(&self.root)?.len().to_string(),
            "quiverlevel.checkpoint-sequence" => {
                self.checkpoint_seq.load(Ordering::Acquire).to_string()
            }
            "quiverlevel.num-columns" => self.read_state()?.columns.columns.len().to_string(),
            "quiverlevel.block-cache-capacity" => self
                .cache
                .as_ref()
                .map_or(0, Cache::capacity)
                .to_string(),
            "quiverlevel.block-cache-usage" => {
                self.cache.as_ref().map_or(0, Cache::usage).to_string()
            }
            "quiverlevel.stats" => snapshot().to_string(),
            _ => String::new(),
        };
        Ok(out)
    }

    // -------------------- close --------------------

    /// Flush and fsync buffered WAL bytes; further calls fail.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut c = self.lock_commit()?;
        c.writer.flush(true)?;
        self.publish_written(c.writer.written_seq());
        info_log!(
            self,
            log::Level::Info,
            "engine closed at {} (latest seq {})",
            self.root.display(),
            c.last_seq
        );
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Ok(mut c) = self.commit.lock() {
            if let Err(e) = c.writer.flush(true) {
                log::warn!("engine drop: WAL flush failed: {:#}", e);
            }
        }
    }
}

/// Replay WAL records newer than `after` into `state`. A torn tail of the
/// newest segment is cut off; damage anywhere else fails the open.
fn replay_wal(root: &Path, identity: &str, state: &mut State, after: u64) -> Result<u64> {
    let segs = list_segments(root)?;
    let mut last = after;
    let n = segs.len();
    for (i, seg) in segs.iter().enumerate() {
        let newest = i + 1 == n;
        if newest && seg.size_bytes < WAL_HDR_SIZE as u64 {
            log::warn!("removing incomplete WAL segment {}", seg.path.display());
            fs::remove_file(&seg.path)?;
            continue;
        }
        // segments whose successor starts at or before `after` are fully covered
        if let Some(next) = segs.get(i + 1) {
            if next.start_sequence <= after + 1 {
                continue;
            }
        }
        let mut r = SegmentReader::open(&seg.path, identity, None)?;
        while let Some(rec) = r.next_record()? {
            if rec.seq <= last {
                continue;
            }
            if rec.seq != last + 1 {
                return Err(anyhow!(
                    "WAL gap in {}: expected seq {}, found {}",
                    seg.path.display(),
                    last + 1,
                    rec.seq
                ));
            }
            let batch = EngineBatch::from_rep(rec.payload)
                .with_context(|| format!("decode WAL record seq {}", rec.seq))?;
            state.apply(&batch)?;
            last = rec.seq;
        }
        let end = r.pos();
        let len = fs::metadata(&seg.path)?.len();
        if end < len {
            if !newest {
                return Err(anyhow!(
                    "WAL segment {} is damaged at offset {} of {}",
                    seg.path.display(),
                    end,
                    len
                ));
            }
            log::warn!(
                "truncating torn WAL tail of {} ({} -> {} bytes)",
                seg.path.display(),
                len,
                end
            );
            truncate_segment(&seg.path, end)?;
        }
    }
    Ok(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::RowFilter;

    fn temp_root(tag: &str) -> PathBuf {
        let t = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir().join(format!("qltest-engine-{tag}-{}-{t}", std::process::id()))
    }

    fn put_batch(kvs: &[(&str, &str)]) -> EngineBatch {
        let mut b = EngineBatch::new();
        for (k, v) in kvs {
            b.put(0, k.as_bytes(), v.as_bytes());
        }
        b
    }

    #[test]
    fn commits_survive_reopen_with_sequence() -> Result<()> {
        let root = temp_root("reopen");
        {
            let e = Engine::open(&root, &DbOptions::default())?;
            assert_eq!(e.commit(&put_batch(&[("a", "1"), ("b", "2")]), false)?, 1);
            let mut d = EngineBatch::new();
            d.delete(0, b"a");
            d.merge(0, b"b", b"+");
            assert_eq!(e.commit(&d, true)?, 2);
            e.close()?;
        }
        let e = Engine::open(&root, &DbOptions::default())?;
        assert_eq!(e.latest_sequence(), 2);
        let got = e.get_many(0, &[b"a".to_vec(), b"b".to_vec()])?;
        assert_eq!(got, vec![None, Some(b"2+".to_vec())]);
        assert_eq!(e.commit(&put_batch(&[("c", "3")]), false)?, 3);
        Ok(())
    }

    #[test]
    fn second_open_is_locked_out() -> Result<()> {
        let root = temp_root("lock");
        let _e = Engine::open(&root, &DbOptions::default())?;
        assert!(Engine::open(&root, &DbOptions::default()).is_err());
        Ok(())
    }

    #[test]
    fn create_and_exists_flags() -> Result<()> {
        let root = temp_root("flags");
        let no_create = DbOptions::default().with_create_if_missing(false);
        assert!(Engine::open(&root, &no_create).is_err());
        Engine::open(&root, &DbOptions::default())?.close()?;
        let strict = DbOptions::default().with_error_if_exists(true);
        assert!(Engine::open(&root, &strict).is_err());
        Ok(())
    }

    #[test]
    fn checkpoint_prunes_wal_and_reopen_uses_it() -> Result<()> {
        let root = temp_root("ckpt");
        {
            let e = Engine::open(&root, &DbOptions::default())?;
            for i in 0..10 {
                let k = format!("k{i}");
                e.commit(&put_batch(&[(&k, "v")]), false)?;
            }
            assert_eq!(e.checkpoint()?, 10);
            assert_eq!(e.property("quiverlevel.checkpoint-sequence")?, "10");
            // only the fresh active segment is left
            let files = e.sorted_wal_files()?;
            assert_eq!(files.len(), 1);
            assert_eq!(files[0].start_sequence, 11);
            e.commit(&put_batch(&[("after", "ckpt")]), false)?;
            e.close()?;
        }
        let e = Engine::open(&root, &DbOptions::default())?;
        assert_eq!(e.latest_sequence(), 11);
        assert_eq!(e.property("quiverlevel.estimate-num-keys")?, "11");
        Ok(())
    }

    #[test]
    fn wal_ttl_keeps_young_segments() -> Result<()> {
        let root = temp_root("ttl");
        let opts = DbOptions::default().with_wal_ttl_ms(60 * 60 * 1000);
        let e = Engine::open(&root, &opts)?;
        e.commit(&put_batch(&[("a", "1")]), false)?;
        e.checkpoint()?;
        assert_eq!(e.sorted_wal_files()?.len(), 2);
        Ok(())
    }

    #[test]
    fn torn_tail_is_truncated_on_open() -> Result<()> {
        let root = temp_root("torn");
        let path;
        {
            let e = Engine::open(&root, &DbOptions::default())?;
            e.commit(&put_batch(&[("a", "1")]), false)?;
            e.commit(&put_batch(&[("b", "2")]), false)?;
            path = e.current_wal_file()?.path;
            e.close()?;
        }
        let len = fs::metadata(&path)?.len();
        truncate_segment(&path, len - 2)?;

        let e = Engine::open(&root, &DbOptions::default())?;
        assert_eq!(e.latest_sequence(), 1);
        assert_eq!(e.get_many(0, &[b"b".to_vec()])?, vec![None]);
        Ok(())
    }

    #[test]
    fn columns_persist_with_merge_operator() -> Result<()> {
        let root = temp_root("cols");
        {
            let e = Engine::open(&root, &DbOptions::default())?;
            let id = e.create_column("scores", ColumnOptions::default().with_merge_operator(MergeOperator::Max))?;
            let mut b = EngineBatch::new();
            b.merge(id, b"alice", b"7");
            b.merge(id, b"alice", b"3");
            b.merge(0, b"log", b"x");
            b.merge(0, b"log", b"y");
            e.commit(&b, false)?;
            e.close()?;
        }
        let e = Engine::open(&root, &DbOptions::default())?;
        let id = e.column_id("scores")?.expect("column persisted");
        assert_eq!(e.get_many(id, &[b"alice".to_vec()])?, vec![Some(b"7".to_vec())]);
        assert_eq!(e.get_many(0, &[b"log".to_vec()])?, vec![Some(b"xy".to_vec())]);
        assert_eq!(e.columns()?.len(), 2);
        Ok(())
    }

    #[test]
    fn unknown_column_rejects_whole_batch() -> Result<()> {
        let root = temp_root("badcol");
        let e = Engine::open(&root, &DbOptions::default())?;
        let mut b = EngineBatch::new();
        b.put(0, b"a", b"1");
        b.put(42, b"b", b"2");
        assert!(e.commit(&b, false).is_err());
        assert_eq!(e.latest_sequence(), 0);
        assert_eq!(e.get_many(0, &[b"a".to_vec()])?, vec![None]);
        Ok(())
    }

    #[test]
    fn updates_follow_rotation_and_skip_since() -> Result<()> {
        let root = temp_root("updates");
        let opts = DbOptions::default().with_wal_segment_bytes(128);
        let e = Arc::new(Engine::open(&root, &opts)?);
        for i in 0..6 {
            let k = format!("key-{i}");
            e.commit(&put_batch(&[(&k, "value-value-value")]), false)?;
        }
        assert!(e.sorted_wal_files()?.len() > 1);

        let mut u = e.updates(2)?;
        let mut seen = Vec::new();
        while let Some((seq, batch)) = u.next()? {
            assert_eq!(batch.count(), 1);
            seen.push(seq);
        }
        assert_eq!(seen, vec![3, 4, 5, 6]);

        e.commit(&put_batch(&[("late", "x")]), false)?;
        assert_eq!(u.next()?.map(|(s, _)| s), Some(7));
        assert!(u.next()?.is_none());
        Ok(())
    }

    #[test]
    fn cursor_pages_resume_after_last_scanned_key() -> Result<()> {
        let root = temp_root("cursor");
        let e = Arc::new(Engine::open(&root, &DbOptions::default())?);
        e.commit(&put_batch(&[("a", "1"), ("b", "2"), ("c", "3"), ("d", "4")]), false)?;
        let mut cur = e.cursor(CursorSpec {
            column: 0,
            range: KeyRange::all(),
            reverse: true,
            filter: RowFilter::default(),
            keys: true,
            values: false,
        })?;
        let first = cur.fetch(3, usize::MAX)?;
        assert!(!first.finished);
        let keys: Vec<_> = first.rows.iter().map(|r| r.key.clone().unwrap()).collect();
        assert_eq!(keys, vec![b"d".to_vec(), b"c".to_vec(), b"b".to_vec()]);
        assert!(first.rows.iter().all(|r| r.value.is_none()));
        let rest = cur.fetch(3, usize::MAX)?;
        assert_eq!(rest.rows.len(), 1);
        assert!(rest.finished);

        cur.seek(b"c");
        assert_eq!(cur.fetch(10, usize::MAX)?.rows.len(), 3);
        Ok(())
    }
}
