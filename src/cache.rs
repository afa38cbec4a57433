//! cache — shared block cache with a stable numeric identity.
//!
//! Назначение
//! - One cache may back any number of databases at once (many-to-one).
//! - `Cache::token()` is a plain `u64` that can be handed to another thread or
//!   task; `Cache::from_token(token)` there reattaches to the very same cache.
//! - The cache lives as long as at least one `Cache` value exists. The
//!   process-wide registry only holds weak references.
//!
//! Ключ
//! - (file_id u64, block u64). `file_id` is unique per WAL segment file across
//!   all databases sharing the cache.
//! - Only complete 32 KiB blocks are cached. Reads of the block still being
//!   appended at the segment tail go straight to the file.
//!
//! Вытеснение
//! - Byte-bounded LRU per shard; shard picked by xxhash64 of the key.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::error::{Error, Result};
use crate::metrics::{record_cache_hit, record_cache_miss};

const SHARDS: usize = 8;

/// Default capacity used by `CacheOptions::default()`.
pub const DEFAULT_CACHE_CAPACITY: usize = 8 * 1024 * 1024;

#[derive(Clone, Copy, Debug)]
pub struct CacheOptions {
    pub capacity_bytes: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            capacity_bytes: DEFAULT_CACHE_CAPACITY,
        }
    }
}

impl CacheOptions {
    pub fn with_capacity_bytes(mut self, bytes: usize) -> Self {
        self.capacity_bytes = bytes;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct BlockKey {
    pub file_id: u64,
    pub block: u64,
}

struct Node {
    value: Arc<[u8]>,
    prev: Option<BlockKey>,
    next: Option<BlockKey>,
}

/// One LRU shard: intrusive doubly-linked list over a HashMap.
struct Lru {
    cap_bytes: usize,
    used_bytes: usize,
    map: HashMap<BlockKey, Node>,
    head: Option<BlockKey>, // LRU
    tail: Option<BlockKey>, // MRU
}

impl Lru {
    fn new(cap_bytes: usize) -> Self {
        Self {
            cap_bytes,
            used_bytes: 0,
            map: HashMap::new(),
            head: None,
            tail: None,
        }
    }

    fn get(&mut self, key: &BlockKey) -> Option<Arc<[u8]>> {
        let value = self.map.get(key).map(|n| n.value.clone())?;
        self.unlink(key);
        self.push_back(*key);
        Some(value)
    }

    fn insert(&mut self, key: BlockKey, value: Arc<[u8]>) {
        let n = value.len();
        if n == 0 || n > self.cap_bytes {
            return;
        }
        if self.map.contains_key(&key) {
            // блок неизменяем: повторная вставка только освежает позицию
            self.unlink(&key);
            self.push_back(key);
            return;
        }
        while self.used_bytes + n > self.cap_bytes {
            if !self.evict_one() {
                break;
            }
        }
        self.map.insert(
            key,
            Node {
                value,
                prev: None,
                next: None,
            },
        );
        self.push_back(key);
        self.used_bytes += n;
    }

    fn evict_one(&mut self) -> bool {
        let Some(k) = self.head else {
            return false;
        };
        self.unlink(&k);
        if let Some(old) = self.map.remove(&k) {
            self.used_bytes = self.used_bytes.saturating_sub(old.value.len());
        }
        true
    }

    fn unlink(&mut self, key: &BlockKey) {
        let (prev, next) = match self.map.get(key) {
            Some(n) => (n.prev, n.next),
            None => return,
        };
        match prev {
            Some(pk) => {
                if let Some(pn) = self.map.get_mut(&pk) {
                    pn.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(nk) => {
                if let Some(nn) = self.map.get_mut(&nk) {
                    nn.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        if let Some(me) = self.map.get_mut(key) {
            me.prev = None;
            me.next = None;
        }
    }

    fn push_back(&mut self, key: BlockKey) {
        match self.tail {
            None => {
                self.head = Some(key);
                self.tail = Some(key);
            }
            Some(tk) => {
                if let Some(tail_node) = self.map.get_mut(&tk) {
                    tail_node.next = Some(key);
                }
                if let Some(me) = self.map.get_mut(&key) {
                    me.prev = Some(tk);
                    me.next = None;
                }
                self.tail = Some(key);
            }
        }
    }
}

struct CacheInner {
    token: u64,
    capacity: usize,
    shards: Vec<Mutex<Lru>>,
}

impl Drop for CacheInner {
    fn drop(&mut self) {
        if let Ok(mut reg) = registry().lock() {
            reg.remove(&self.token);
        }
    }
}

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);
static REGISTRY: OnceLock<Mutex<HashMap<u64, Weak<CacheInner>>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<u64, Weak<CacheInner>>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Handle to a shared block cache. Cloning is cheap and refers to the same cache.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

impl Cache {
    pub fn new(opts: CacheOptions) -> Self {
        let per_shard = (opts.capacity_bytes / SHARDS).max(1);
        let shards = (0..SHARDS).map(|_| Mutex::new(Lru::new(per_shard))).collect();
        let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::new(CacheInner {
            token,
            capacity: opts.capacity_bytes,
            shards,
        });
        registry()
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(token, Arc::downgrade(&inner));
        log::debug!("block cache #{} created ({} bytes)", token, opts.capacity_bytes);
        Self { inner }
    }

    /// Reattach to a live cache by its token (e.g. one received from another thread).
    pub fn from_token(token: u64) -> Result<Self> {
        let reg = registry().lock().unwrap_or_else(|p| p.into_inner());
        reg.get(&token)
            .and_then(Weak::upgrade)
            .map(|inner| Self { inner })
            .ok_or(Error::InvalidCacheToken(token))
    }

    #[inline]
    pub fn token(&self) -> u64 {
        self.inner.token
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn usage(&self) -> usize {
        self.inner
            .shards
            .iter()
            .map(|s| s.lock().map(|g| g.used_bytes).unwrap_or(0))
            .sum()
    }

    pub fn entries(&self) -> usize {
        self.inner
            .shards
            .iter()
            .map(|s| s.lock().map(|g| g.map.len()).unwrap_or(0))
            .sum()
    }

    /// Two handles refer to the same underlying cache.
    pub fn same_as(&self, other: &Cache) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn shard(&self, key: &BlockKey) -> &Mutex<Lru> {
        let mut h = twox_hash::XxHash64::with_seed(0);
        h.write_u64(key.file_id);
        h.write_u64(key.block);
        &self.inner.shards[(h.finish() as usize) % SHARDS]
    }

    pub(crate) fn get(&self, key: &BlockKey) -> Option<Arc<[u8]>> {
        let got = self.shard(key).lock().ok()?.get(key);
        match got {
            Some(v) => {
                record_cache_hit();
                Some(v)
            }
            None => {
                record_cache_miss();
                None
            }
        }
    }

    pub(crate) fn insert(&self, key: BlockKey, value: Arc<[u8]>) {
        if let Ok(mut g) = self.shard(&key).lock() {
            g.insert(key, value);
        }
    }
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("token", &self.inner.token)
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}
