//! engine/wal — segmented write-ahead log (QLWAL001).
//!
//! Раскладка:
//! - <root>/wal-<start_seq:020>.log — segment whose first record has `start_seq`.
//! - File header (24 bytes): MAGIC "QLWAL001" + start_seq u64 + nonce u64.
//!   The random nonce makes the block-cache file id unique even if a segment
//!   name is ever reused.
//! - Record header (20 bytes, LE):
//!     [type u8][flags u8][reserved u16][seq u64][len u32][crc32c u32]
//!   CRC32C covers header[0..16) + payload. One record per atomic commit.
//! - flags bit 0: payload is zstd-compressed.
//!
//! Чтение:
//! - A partial tail (header or payload past EOF) reads as end-of-segment.
//! - A CRC mismatch is corruption (Err).

use anyhow::{anyhow, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::fs::{self, File, OpenOptions};
use std::hash::Hasher;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::{BlockKey, Cache};
use crate::metrics::{record_wal_append, record_wal_fsync, record_wal_rotation};

// -------------------- Формат --------------------

pub const WAL_MAGIC: &[u8; 8] = b"QLWAL001";
pub const WAL_HDR_SIZE: usize = 24;
const WAL_HDR_OFF_START_SEQ: usize = 8;
const WAL_HDR_OFF_NONCE: usize = 16;

pub const WAL_REC_HDR_SIZE: usize = 20;
pub const WAL_REC_OFF_TYPE: usize = 0;
pub const WAL_REC_OFF_FLAGS: usize = 1;
pub const WAL_REC_OFF_RESERVED: usize = 2;
pub const WAL_REC_OFF_SEQ: usize = 4;
pub const WAL_REC_OFF_LEN: usize = 12;
pub const WAL_REC_OFF_CRC32: usize = 16;

pub const WAL_REC_BATCH: u8 = 1;
pub const WAL_FLAG_ZSTD: u8 = 0x01;

/// Block size of cached segment reads.
pub const WAL_BLOCK_SIZE: u64 = 32 * 1024;

const SEGMENT_PREFIX: &str = "wal-";
const SEGMENT_SUFFIX: &str = ".log";

#[inline]
pub fn crc32c_of_parts(head_without_crc: &[u8], payload: &[u8]) -> u32 {
    let c = crc32c::crc32c_append(0, head_without_crc);
    crc32c::crc32c_append(c, payload)
}

/// Header with CRC32C filled in.
pub fn build_hdr_with_crc(rec_type: u8, flags: u8, seq: u64, payload: &[u8]) -> [u8; WAL_REC_HDR_SIZE] {
    let mut hdr = [0u8; WAL_REC_HDR_SIZE];
    hdr[WAL_REC_OFF_TYPE] = rec_type;
    hdr[WAL_REC_OFF_FLAGS] = flags;
    LittleEndian::write_u16(&mut hdr[WAL_REC_OFF_RESERVED..WAL_REC_OFF_RESERVED + 2], 0);
    LittleEndian::write_u64(&mut hdr[WAL_REC_OFF_SEQ..WAL_REC_OFF_SEQ + 8], seq);
    LittleEndian::write_u32(
        &mut hdr[WAL_REC_OFF_LEN..WAL_REC_OFF_LEN + 4],
        payload.len() as u32,
    );
    let crc = crc32c_of_parts(&hdr[..WAL_REC_OFF_CRC32], payload);
    LittleEndian::write_u32(&mut hdr[WAL_REC_OFF_CRC32..WAL_REC_OFF_CRC32 + 4], crc);
    hdr
}

pub fn segment_file_name(start_seq: u64) -> String {
    format!("{SEGMENT_PREFIX}{start_seq:020}{SEGMENT_SUFFIX}")
}

pub fn parse_segment_file_name(name: &str) -> Option<u64> {
    name.strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?
        .parse::<u64>()
        .ok()
}

/// A WAL segment on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalFileInfo {
    pub path: PathBuf,
    pub start_sequence: u64,
    pub size_bytes: u64,
}

/// Segments sorted by start sequence.
pub fn list_segments(root: &Path) -> Result<Vec<WalFileInfo>> {
    let mut out = Vec::new();
    for ent in fs::read_dir(root).with_context(|| format!("read_dir {}", root.display()))? {
        let ent = ent?;
        let name = ent.file_name();
        let Some(start) = name.to_str().and_then(parse_segment_file_name) else {
            continue;
        };
        let size_bytes = ent.metadata().map(|m| m.len()).unwrap_or(0);
        out.push(WalFileInfo {
            path: ent.path(),
            start_sequence: start,
            size_bytes,
        });
    }
    out.sort_by_key(|s| s.start_sequence);
    Ok(out)
}

fn generate_nonce() -> u64 {
    use rand::RngCore;
    rand::rngs::OsRng.next_u64()
}

/// Unique block-cache id of a segment: xxhash64(identity, nonce).
pub fn segment_cache_id(identity: &str, nonce: u64) -> u64 {
    let mut h = twox_hash::XxHash64::with_seed(0x51_4C_57_41_4C);
    h.write(identity.as_bytes());
    h.write_u64(nonce);
    h.finish()
}

fn write_segment_header(f: &mut File, start_seq: u64, nonce: u64) -> Result<()> {
    let mut hdr = [0u8; WAL_HDR_SIZE];
    hdr[..8].copy_from_slice(WAL_MAGIC);
    LittleEndian::write_u64(&mut hdr[WAL_HDR_OFF_START_SEQ..WAL_HDR_OFF_START_SEQ + 8], start_seq);
    LittleEndian::write_u64(&mut hdr[WAL_HDR_OFF_NONCE..WAL_HDR_OFF_NONCE + 8], nonce);
    f.seek(SeekFrom::Start(0))?;
    f.write_all(&hdr)?;
    Ok(())
}

/// (start_seq, nonce) of a segment file, validating MAGIC.
pub fn read_segment_header(f: &mut File) -> Result<(u64, u64)> {
    let mut hdr = [0u8; WAL_HDR_SIZE];
    f.seek(SeekFrom::Start(0))?;
    f.read_exact(&mut hdr).context("read WAL segment header")?;
    if &hdr[..8] != WAL_MAGIC {
        return Err(anyhow!("bad WAL magic"));
    }
    Ok((
        LittleEndian::read_u64(&hdr[WAL_HDR_OFF_START_SEQ..WAL_HDR_OFF_START_SEQ + 8]),
        LittleEndian::read_u64(&hdr[WAL_HDR_OFF_NONCE..WAL_HDR_OFF_NONCE + 8]),
    ))
}

// -------------------- Writer --------------------

#[derive(Clone, Copy, Debug)]
pub struct WalWriterCfg {
    pub compression: bool,
    pub manual_flush: bool,
    pub segment_bytes: u64,
}

/// Appender for the active segment.
///
/// With `manual_flush` encoded records stay in `pending` until `flush()`;
/// otherwise every append reaches the OS before returning.
pub struct WalWriter {
    root: PathBuf,
    cfg: WalWriterCfg,
    file: File,
    path: PathBuf,
    start_seq: u64,
    file_len: u64,
    pending: Vec<u8>,
    /// Highest sequence whose record has been written to the file.
    written_seq: u64,
    /// Highest sequence appended (possibly still pending).
    appended_seq: u64,
}

impl WalWriter {
    /// Start a fresh segment whose first record will be `next_seq`.
    pub fn create(root: &Path, next_seq: u64, cfg: WalWriterCfg) -> Result<Self> {
        let (file, path) = Self::create_segment(root, next_seq)?;
        let last = next_seq.saturating_sub(1);
        Ok(Self {
            root: root.to_path_buf(),
            cfg,
            file,
            path,
            start_seq: next_seq,
            file_len: WAL_HDR_SIZE as u64,
            pending: Vec::new(),
            written_seq: last,
            appended_seq: last,
        })
    }

    fn create_segment(root: &Path, start_seq: u64) -> Result<(File, PathBuf)> {
        let path = root.join(segment_file_name(start_seq));
        // A segment with this name can only hold records >= start_seq, and none
        // of those were ever committed: truncating is safe.
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("create WAL segment {}", path.display()))?;
        write_segment_header(&mut file, start_seq, generate_nonce())?;
        file.sync_all()?;
        Ok((file, path))
    }

    /// Append one commit record. Returns the encoded size.
    pub fn append(&mut self, seq: u64, payload: &[u8], sync: bool) -> Result<usize> {
        let (flags, body) = if self.cfg.compression {
            let z = zstd::stream::encode_all(payload, 0).context("zstd compress WAL payload")?;
            (WAL_FLAG_ZSTD, z)
        } else {
            (0, payload.to_vec())
        };
        if body.len() > u32::MAX as usize {
            return Err(anyhow!("payload too large for WAL record: {} bytes", body.len()));
        }

        let projected = self.file_len + self.pending.len() as u64;
        if projected > WAL_HDR_SIZE as u64 && projected >= self.cfg.segment_bytes {
            self.rotate(seq)?;
        }

        let hdr = build_hdr_with_crc(WAL_REC_BATCH, flags, seq, &body);
        self.pending.extend_from_slice(&hdr);
        self.pending.extend_from_slice(&body);
        self.appended_seq = seq;
        let total = WAL_REC_HDR_SIZE + body.len();
        record_wal_append(total);

        if !self.cfg.manual_flush || sync {
            self.write_pending()?;
        }
        if sync {
            self.file.sync_data()?;
            record_wal_fsync();
        }
        Ok(total)
    }

    fn write_pending(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.file.seek(SeekFrom::Start(self.file_len))?;
        self.file
            .write_all(&self.pending)
            .with_context(|| format!("append WAL {}", self.path.display()))?;
        self.file_len += self.pending.len() as u64;
        self.pending.clear();
        self.written_seq = self.appended_seq;
        Ok(())
    }

    /// Write buffered records; fsync when `sync`.
    pub fn flush(&mut self, sync: bool) -> Result<()> {
        self.write_pending()?;
        if sync {
            self.file.sync_data()?;
            record_wal_fsync();
        }
        Ok(())
    }

    /// Seal the active segment and open a new one starting at `next_seq`.
    pub fn rotate(&mut self, next_seq: u64) -> Result<()> {
        self.flush(true)?;
        if next_seq == self.start_seq {
            // nothing was written to the active segment
            return Ok(());
        }
        let (file, path) = Self::create_segment(&self.root, next_seq)?;
        self.file = file;
        self.path = path;
        self.start_seq = next_seq;
        self.file_len = WAL_HDR_SIZE as u64;
        record_wal_rotation();
        log::debug!("wal rotated: new segment starts at seq {}", next_seq);
        Ok(())
    }

    #[inline]
    pub fn written_seq(&self) -> u64 {
        self.written_seq
    }

    #[inline]
    pub fn start_seq(&self) -> u64 {
        self.start_seq
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn pending_bytes(&self) -> usize {
        self.pending.len()
    }
}

// -------------------- Reader --------------------

/// One WAL record read back from disk (payload already decompressed).
#[derive(Debug)]
pub struct WalRecord {
    pub rec_type: u8,
    pub flags: u8,
    pub seq: u64,
    pub payload: Vec<u8>,
    pub pos: u64,
    pub len_total: u64,
}

/// Sequential reader over one segment. Full blocks of the file go through
/// the shared block cache when one is attached.
pub struct SegmentReader {
    file: File,
    path: PathBuf,
    start_seq: u64,
    cache: Option<Cache>,
    cache_id: u64,
    pos: u64,
}

impl SegmentReader {
    pub fn open(path: &Path, identity: &str, cache: Option<Cache>) -> Result<Self> {
        let mut file = File::open(path).with_context(|| format!("open WAL {}", path.display()))?;
        let (start_seq, nonce) = read_segment_header(&mut file)
            .with_context(|| format!("WAL header {}", path.display()))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            start_seq,
            cache,
            cache_id: segment_cache_id(identity, nonce),
            pos: WAL_HDR_SIZE as u64,
        })
    }

    #[inline]
    pub fn start_seq(&self) -> u64 {
        self.start_seq
    }

    #[inline]
    pub fn pos(&self) -> u64 {
        self.pos
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_direct(&mut self, pos: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(pos))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    /// Read `buf.len()` bytes at `pos`; the caller checked `pos + len <= file_len`.
    fn read_at(&mut self, pos: u64, buf: &mut [u8], file_len: u64) -> Result<()> {
        let Some(cache) = self.cache.clone() else {
            return self.read_direct(pos, buf);
        };
        let mut done = 0usize;
        while done < buf.len() {
            let at = pos + done as u64;
            let block = at / WAL_BLOCK_SIZE;
            let block_start = block * WAL_BLOCK_SIZE;
            let block_end = block_start + WAL_BLOCK_SIZE;
            let in_block = (at - block_start) as usize;
            let take = (buf.len() - done).min((block_end - at) as usize);

            if block_end > file_len {
                // хвостовой блок ещё дописывается — мимо кэша
                self.read_direct(at, &mut buf[done..done + take])?;
            } else {
                let key = BlockKey {
                    file_id: self.cache_id,
                    block,
                };
                let bytes = match cache.get(&key) {
                    Some(b) => b,
                    None => {
                        let mut raw = vec![0u8; WAL_BLOCK_SIZE as usize];
                        self.read_direct(block_start, &mut raw)?;
                        let b: Arc<[u8]> = raw.into();
                        cache.insert(key, b.clone());
                        b
                    }
                };
                buf[done..done + take].copy_from_slice(&bytes[in_block..in_block + take]);
            }
            done += take;
        }
        Ok(())
    }

    /// Next complete record, or None at the (possibly partial) end of the file.
    pub fn next_record(&mut self) -> Result<Option<WalRecord>> {
        let file_len = self.file.metadata()?.len();
        let pos = self.pos;
        if pos + WAL_REC_HDR_SIZE as u64 > file_len {
            return Ok(None);
        }
        let mut rhdr = [0u8; WAL_REC_HDR_SIZE];
        self.read_at(pos, &mut rhdr, file_len)?;

        let payload_len = LittleEndian::read_u32(&rhdr[WAL_REC_OFF_LEN..WAL_REC_OFF_LEN + 4]) as u64;
        let total = WAL_REC_HDR_SIZE as u64 + payload_len;
        if pos + total > file_len {
            return Ok(None);
        }
        let mut payload = vec![0u8; payload_len as usize];
        self.read_at(pos + WAL_REC_HDR_SIZE as u64, &mut payload, file_len)?;

        let stored_crc = LittleEndian::read_u32(&rhdr[WAL_REC_OFF_CRC32..WAL_REC_OFF_CRC32 + 4]);
        let calc_crc = crc32c_of_parts(&rhdr[..WAL_REC_OFF_CRC32], &payload);
        if stored_crc != calc_crc {
            return Err(anyhow!(
                "WAL CRC mismatch in {} at pos {} (stored={}, calc={})",
                self.path.display(),
                pos,
                stored_crc,
                calc_crc
            ));
        }

        let flags = rhdr[WAL_REC_OFF_FLAGS];
        if flags & WAL_FLAG_ZSTD != 0 {
            payload = zstd::stream::decode_all(&payload[..])
                .with_context(|| format!("zstd decode WAL record at pos {}", pos))?;
        }

        self.pos = pos + total;
        Ok(Some(WalRecord {
            rec_type: rhdr[WAL_REC_OFF_TYPE],
            flags,
            seq: LittleEndian::read_u64(&rhdr[WAL_REC_OFF_SEQ..WAL_REC_OFF_SEQ + 8]),
            payload,
            pos,
            len_total: total,
        }))
    }
}

/// Cut a segment back to `len` bytes (drop a torn tail after a crash).
pub fn truncate_segment(path: &Path, len: u64) -> Result<()> {
    let f = OpenOptions::new()
        .write(true)
        .open(path)
        .with_context(|| format!("open {} for truncate", path.display()))?;
    f.set_len(len)?;
    f.sync_all()?;
    Ok(())
}
