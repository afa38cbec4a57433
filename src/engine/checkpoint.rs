//! engine/checkpoint — full image of all column tables at a sequence number.
//!
//! Формат <root>/checkpoint-<seq:020>.dat (LE):
//!   MAGIC "QLCKPT01"
//!   [seq u64][ncols u32]
//!   ncols × ( [column u32][entries u64] entries × ([klen u32][key][vlen u32][value]) )
//!   [crc32c u32] over everything before it
//!
//! Written to a .tmp file, fsynced and renamed. Older checkpoints are removed
//! once a newer one is in place. Loading falls back to older files when the
//! newest one fails validation.

use anyhow::{anyhow, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use super::table::Table;

const CKPT_MAGIC: &[u8; 8] = b"QLCKPT01";
const CKPT_PREFIX: &str = "checkpoint-";
const CKPT_SUFFIX: &str = ".dat";

fn checkpoint_name(seq: u64) -> String {
    format!("{CKPT_PREFIX}{seq:020}{CKPT_SUFFIX}")
}

fn parse_checkpoint_name(name: &str) -> Option<u64> {
    name.strip_prefix(CKPT_PREFIX)?
        .strip_suffix(CKPT_SUFFIX)?
        .parse::<u64>()
        .ok()
}

/// Checkpoint files sorted by sequence, newest last.
pub fn list_checkpoints(root: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut out = Vec::new();
    for ent in fs::read_dir(root).with_context(|| format!("read_dir {}", root.display()))? {
        let ent = ent?;
        if let Some(seq) = ent.file_name().to_str().and_then(parse_checkpoint_name) {
            out.push((seq, ent.path()));
        }
    }
    out.sort_by_key(|(seq, _)| *seq);
    Ok(out)
}

/// Writer that feeds every byte into a running CRC32C.
struct CrcWriter<W: Write> {
    inner: W,
    crc: u32,
}

impl<W: Write> CrcWriter<W> {
    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        self.crc = crc32c::crc32c_append(self.crc, bytes);
        self.inner.write_all(bytes)?;
        Ok(())
    }

    fn put_u32(&mut self, v: u32) -> Result<()> {
        let mut b = [0u8; 4];
        LittleEndian::write_u32(&mut b, v);
        self.put(&b)
    }

    fn put_u64(&mut self, v: u64) -> Result<()> {
        let mut b = [0u8; 8];
        LittleEndian::write_u64(&mut b, v);
        self.put(&b)
    }
}

/// Write a checkpoint of `tables` taken at `seq`. Returns the final path.
pub fn write_checkpoint(root: &Path, seq: u64, tables: &BTreeMap<u32, &Table>) -> Result<PathBuf> {
    let path = root.join(checkpoint_name(seq));
    let tmp = root.join(format!("{}.tmp", checkpoint_name(seq)));

    let f = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(&tmp)
        .with_context(|| format!("open {}", tmp.display()))?;
    let mut w = CrcWriter {
        inner: BufWriter::new(f),
        crc: 0,
    };

    w.put(CKPT_MAGIC)?;
    w.put_u64(seq)?;
    w.put_u32(tables.len() as u32)?;
    for (id, table) in tables {
        w.put_u32(*id)?;
        w.put_u64(table.len() as u64)?;
        for (k, v) in table.iter() {
            w.put_u32(k.len() as u32)?;
            w.put(k)?;
            w.put_u32(v.len() as u32)?;
            w.put(v)?;
        }
    }
    let crc = w.crc;
    let mut inner = w.inner;
    let mut b = [0u8; 4];
    LittleEndian::write_u32(&mut b, crc);
    inner.write_all(&b)?;
    let f = inner
        .into_inner()
        .map_err(|e| anyhow!("flush checkpoint {}: {}", tmp.display(), e.error()))?;
    f.sync_all()?;
    drop(f);

    fs::rename(&tmp, &path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(path)
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&e| e <= self.buf.len())
            .ok_or_else(|| anyhow!("checkpoint truncated at offset {}", self.pos))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }
}

/// Loaded checkpoint image.
pub struct CheckpointImage {
    pub seq: u64,
    pub tables: BTreeMap<u32, Table>,
}

pub fn read_checkpoint(path: &Path) -> Result<CheckpointImage> {
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    if bytes.len() < CKPT_MAGIC.len() + 8 + 4 + 4 {
        return Err(anyhow!("checkpoint too short: {}", path.display()));
    }
    let (body, crc_bytes) = bytes.split_at(bytes.len() - 4);
    let stored = LittleEndian::read_u32(crc_bytes);
    let calc = crc32c::crc32c(body);
    if stored != calc {
        return Err(anyhow!(
            "checkpoint CRC mismatch in {} (stored={}, calc={})",
            path.display(),
            stored,
            calc
        ));
    }

    let mut c = Cursor { buf: body, pos: 0 };
    if c.take(CKPT_MAGIC.len())? != CKPT_MAGIC {
        return Err(anyhow!("bad checkpoint magic: {}", path.display()));
    }
    let seq = c.u64()?;
    let ncols = c.u32()?;
    let mut tables = BTreeMap::new();
    for _ in 0..ncols {
        let id = c.u32()?;
        let entries = c.u64()?;
        let mut t = Table::new();
        for _ in 0..entries {
            let klen = c.u32()? as usize;
            let key = c.take(klen)?;
            let vlen = c.u32()? as usize;
            let value = c.take(vlen)?;
            t.put(key, value);
        }
        tables.insert(id, t);
    }
    Ok(CheckpointImage { seq, tables })
}

/// Newest checkpoint that validates; None when there is none.
pub fn load_latest(root: &Path) -> Result<Option<CheckpointImage>> {
    for (seq, path) in list_checkpoints(root)?.into_iter().rev() {
        match read_checkpoint(&path) {
            Ok(img) => return Ok(Some(img)),
            Err(e) => log::warn!("skipping checkpoint {} (seq {}): {:#}", path.display(), seq, e),
        }
    }
    Ok(None)
}

/// Remove checkpoints older than `keep_seq` and stray .tmp files.
pub fn remove_older(root: &Path, keep_seq: u64) -> Result<usize> {
    let mut removed = 0;
    for (seq, path) in list_checkpoints(root)? {
        if seq < keep_seq {
            fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
            removed += 1;
        }
    }
    for ent in fs::read_dir(root)? {
        let ent = ent?;
        let name = ent.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(CKPT_PREFIX) && name.ends_with(".tmp") {
            let _ = fs::remove_file(ent.path());
        }
    }
    Ok(removed)
}
