//! engine/rep — binary representation of an atomic write batch.
//!
//! Формат (LE):
//!   [count u32]
//!   count × [kind u8][column u32][klen u32][key][vlen u32][value]
//!
//! The same bytes are the WAL record payload, so the change feed decodes
//! exactly what was committed, in append order.

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};

const COUNT_SIZE: usize = 4;
const OP_HDR_SIZE: usize = 1 + 4 + 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpKind {
    Put = 1,
    Delete = 2,
    Merge = 3,
    /// Out-of-band log marker, not a key/value mutation.
    Data = 4,
}

impl OpKind {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(OpKind::Put),
            2 => Some(OpKind::Delete),
            3 => Some(OpKind::Merge),
            4 => Some(OpKind::Data),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::Put => "put",
            OpKind::Delete => "del",
            OpKind::Merge => "merge",
            OpKind::Data => "data",
        }
    }

    /// put/merge/data carry a value; delete does not.
    #[inline]
    pub fn has_value(self) -> bool {
        !matches!(self, OpKind::Delete)
    }
}

/// One decoded operation borrowed from a batch rep.
#[derive(Clone, Copy, Debug)]
pub struct BatchOp<'a> {
    pub kind: OpKind,
    pub column: u32,
    pub key: &'a [u8],
    pub value: &'a [u8],
}

#[derive(Clone, Debug)]
pub struct EngineBatch {
    rep: Vec<u8>,
    count: u32,
}

impl Default for EngineBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBatch {
    pub fn new() -> Self {
        Self {
            rep: vec![0u8; COUNT_SIZE],
            count: 0,
        }
    }

    /// Adopt bytes read back from the WAL; validates the whole layout.
    pub fn from_rep(rep: Vec<u8>) -> Result<Self> {
        if rep.len() < COUNT_SIZE {
            return Err(anyhow!("batch rep too short: {} bytes", rep.len()));
        }
        let count = LittleEndian::read_u32(&rep[..COUNT_SIZE]);
        let batch = Self { rep, count };
        let mut seen = 0u32;
        for op in batch.iter() {
            op?;
            seen += 1;
        }
        if seen != count {
            return Err(anyhow!("batch rep count mismatch: header={} decoded={}", count, seen));
        }
        Ok(batch)
    }

    fn push(&mut self, kind: OpKind, column: u32, key: &[u8], value: &[u8]) {
        let mut hdr = [0u8; OP_HDR_SIZE];
        hdr[0] = kind as u8;
        LittleEndian::write_u32(&mut hdr[1..5], column);
        LittleEndian::write_u32(&mut hdr[5..9], key.len() as u32);
        self.rep.extend_from_slice(&hdr);
        self.rep.extend_from_slice(key);
        let mut vlen = [0u8; 4];
        LittleEndian::write_u32(&mut vlen, value.len() as u32);
        self.rep.extend_from_slice(&vlen);
        self.rep.extend_from_slice(value);

        self.count += 1;
        LittleEndian::write_u32(&mut self.rep[..COUNT_SIZE], self.count);
    }

    pub fn put(&mut self, column: u32, key: &[u8], value: &[u8]) {
        self.push(OpKind::Put, column, key, value);
    }

    pub fn delete(&mut self, column: u32, key: &[u8]) {
        self.push(OpKind::Delete, column, key, &[]);
    }

    pub fn merge(&mut self, column: u32, key: &[u8], operand: &[u8]) {
        self.push(OpKind::Merge, column, key, operand);
    }

    pub fn put_log_data(&mut self, blob: &[u8]) {
        self.push(OpKind::Data, 0, &[], blob);
    }

    pub fn clear(&mut self) {
        self.rep.truncate(COUNT_SIZE);
        self.rep[..COUNT_SIZE].fill(0);
        self.count = 0;
    }

    #[inline]
    pub fn count(&self) -> u32 {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.rep
    }

    #[inline]
    pub fn size_in_bytes(&self) -> usize {
        self.rep.len()
    }

    pub fn iter(&self) -> BatchIter<'_> {
        BatchIter {
            rep: &self.rep,
            pos: COUNT_SIZE,
            left: self.count,
        }
    }
}

pub struct BatchIter<'a> {
    rep: &'a [u8],
    pos: usize,
    left: u32,
}

impl<'a> BatchIter<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&e| e <= self.rep.len())
            .ok_or_else(|| anyhow!("batch rep truncated at offset {}", self.pos))?;
        let out = &self.rep[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn decode_one(&mut self) -> Result<BatchOp<'a>> {
        let hdr = self.take(OP_HDR_SIZE)?;
        let kind = OpKind::from_u8(hdr[0])
            .ok_or_else(|| anyhow!("unknown batch op kind {}", hdr[0]))?;
        let column = LittleEndian::read_u32(&hdr[1..5]);
        let klen = LittleEndian::read_u32(&hdr[5..9]) as usize;
        let key = self.take(klen)?;
        let vlen = LittleEndian::read_u32(self.take(4)?) as usize;
        let value = self.take(vlen)?;
        Ok(BatchOp {
            kind,
            column,
            key,
            value,
        })
    }
}

impl<'a> Iterator for BatchIter<'a> {
    type Item = Result<BatchOp<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.left == 0 {
            return None;
        }
        self.left -= 1;
        match self.decode_one() {
            Ok(op) => Some(Ok(op)),
            Err(e) => {
                self.left = 0;
                Some(Err(e))
            }
        }
    }
}
