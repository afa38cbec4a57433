//! engine/table — ordered in-memory table of one column family.

use std::collections::BTreeMap;
use std::ops::Bound;

use crate::config::MergeOperator;

/// Key range with independent lower/upper bounds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyRange {
    pub lower: Bound<Vec<u8>>,
    pub upper: Bound<Vec<u8>>,
}

impl Default for KeyRange {
    fn default() -> Self {
        Self::all()
    }
}

impl KeyRange {
    pub fn all() -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
        }
    }

    /// Build from gt/gte/lt/lte. When both forms of one side are given the
    /// exclusive one wins.
    pub fn from_options(
        gt: Option<&[u8]>,
        gte: Option<&[u8]>,
        lt: Option<&[u8]>,
        lte: Option<&[u8]>,
    ) -> Self {
        let lower = match (gt, gte) {
            (Some(k), _) => Bound::Excluded(k.to_vec()),
            (None, Some(k)) => Bound::Included(k.to_vec()),
            (None, None) => Bound::Unbounded,
        };
        let upper = match (lt, lte) {
            (Some(k), _) => Bound::Excluded(k.to_vec()),
            (None, Some(k)) => Bound::Included(k.to_vec()),
            (None, None) => Bound::Unbounded,
        };
        Self { lower, upper }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        let lo = match &self.lower {
            Bound::Included(k) => key >= k.as_slice(),
            Bound::Excluded(k) => key > k.as_slice(),
            Bound::Unbounded => true,
        };
        let hi = match &self.upper {
            Bound::Included(k) => key <= k.as_slice(),
            Bound::Excluded(k) => key < k.as_slice(),
            Bound::Unbounded => true,
        };
        lo && hi
    }
}

fn as_slice_bound(b: &Bound<Vec<u8>>) -> Bound<&[u8]> {
    match b {
        Bound::Included(k) => Bound::Included(k.as_slice()),
        Bound::Excluded(k) => Bound::Excluded(k.as_slice()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

fn max_lower<'a>(a: Bound<&'a [u8]>, b: Bound<&'a [u8]>) -> Bound<&'a [u8]> {
    match (a, b) {
        (Bound::Unbounded, x) | (x, Bound::Unbounded) => x,
        (Bound::Included(x), Bound::Included(y)) => Bound::Included(x.max(y)),
        (Bound::Excluded(x), Bound::Excluded(y)) => Bound::Excluded(x.max(y)),
        (Bound::Included(i), Bound::Excluded(e)) | (Bound::Excluded(e), Bound::Included(i)) => {
            if i > e {
                Bound::Included(i)
            } else {
                Bound::Excluded(e)
            }
        }
    }
}

fn min_upper<'a>(a: Bound<&'a [u8]>, b: Bound<&'a [u8]>) -> Bound<&'a [u8]> {
    match (a, b) {
        (Bound::Unbounded, x) | (x, Bound::Unbounded) => x,
        (Bound::Included(x), Bound::Included(y)) => Bound::Included(x.min(y)),
        (Bound::Excluded(x), Bound::Excluded(y)) => Bound::Excluded(x.min(y)),
        (Bound::Included(i), Bound::Excluded(e)) | (Bound::Excluded(e), Bound::Included(i)) => {
            if i < e {
                Bound::Included(i)
            } else {
                Bound::Excluded(e)
            }
        }
    }
}

/// BTreeMap::range panics on inverted or (x, x)-excluded ranges; such ranges are empty.
fn is_empty_range(lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> bool {
    match (lower, upper) {
        (Bound::Unbounded, _) | (_, Bound::Unbounded) => false,
        (Bound::Included(a), Bound::Included(b)) => a > b,
        (Bound::Included(a), Bound::Excluded(b))
        | (Bound::Excluded(a), Bound::Included(b))
        | (Bound::Excluded(a), Bound::Excluded(b)) => a >= b,
    }
}

#[derive(Debug, Default)]
pub struct Table {
    map: BTreeMap<Vec<u8>, Vec<u8>>,
    bytes: usize,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Approximate payload bytes (keys + values).
    #[inline]
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    #[inline]
    pub fn get(&self, key: &[u8]) -> Option<&Vec<u8>> {
        self.map.get(key)
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.bytes += value.len();
        match self.map.insert(key.to_vec(), value.to_vec()) {
            Some(old) => self.bytes -= old.len(),
            None => self.bytes += key.len(),
        }
    }

    pub fn delete(&mut self, key: &[u8]) {
        if let Some(old) = self.map.remove(key) {
            self.bytes -= key.len() + old.len();
        }
    }

    pub fn merge(&mut self, key: &[u8], operand: &[u8], op: MergeOperator) {
        let merged = op.apply(self.map.get(key).map(Vec::as_slice), operand);
        self.put(key, &merged);
    }

    /// Rows of `range` in iteration order. `resume` narrows the side the
    /// iteration moves away from: the lower bound going forward, the upper
    /// bound in reverse.
    pub fn scan<'a>(
        &'a self,
        range: &KeyRange,
        reverse: bool,
        resume: Bound<&[u8]>,
    ) -> Box<dyn DoubleEndedIterator<Item = (&'a Vec<u8>, &'a Vec<u8>)> + 'a> {
        let mut lower = as_slice_bound(&range.lower);
        let mut upper = as_slice_bound(&range.upper);
        if reverse {
            upper = min_upper(upper, resume);
        } else {
            lower = max_lower(lower, resume);
        }
        if is_empty_range(lower, upper) {
            return Box::new(std::iter::empty());
        }
        let it = self.map.range::<[u8], _>((lower, upper));
        if reverse {
            Box::new(it.rev())
        } else {
            Box::new(it)
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Vec<u8>, &Vec<u8>)> {
        self.map.iter()
    }
}
