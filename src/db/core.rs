//! db/core — Database handle: shared state, lifecycle, engine access.
//!
//! Состояния
//!   Closed → Opening → Open → Closing → Closed
//! Only `open()` is meaningful outside Open; everything else fails with
//! `Error::NotOpen` there.
//!
//! Доступ к движку
//! - `acquire()` hands out the engine together with a `RefGuard`, checked and
//!   counted under the lifecycle lock, so `close()` (which flips the state to
//!   Closing under the same lock) never races a call that already started.
//! - `blocking()` runs an engine call on the blocking pool, bounded by a
//!   per-handle semaphore of `parallelism` permits. Guard and permit move into
//!   the blocking closure: a caller that drops its future mid-call still keeps
//!   the engine alive until the call really finished.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Semaphore;

use crate::config::DbOptions;
use crate::engine::{Engine, DEFAULT_COLUMN_ID};
use crate::error::{Error, Result};
use crate::registry::{RefCounter, RefGuard, ResourceRegistry};

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Opening,
    Open,
    Closing,
    Closed,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Opening => "opening",
            Status::Open => "open",
            Status::Closing => "closing",
            Status::Closed => "closed",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Column family of one open database handle.
///
/// Handles are scoped to the `Database` (and the open session) that produced
/// them; using one elsewhere fails with `Error::ColumnNotFound`.
#[derive(Clone, PartialEq, Eq)]
pub struct ColumnHandle {
    pub(crate) db: u64,
    pub(crate) id: u32,
    pub(crate) name: Arc<str>,
}

impl ColumnHandle {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl fmt::Debug for ColumnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ColumnHandle({:?}#{})", self.name, self.id)
    }
}

pub(crate) struct Lifecycle {
    pub(crate) status: Status,
    pub(crate) engine: Option<Arc<Engine>>,
    /// Open column handles by name (the default column is not listed).
    pub(crate) columns: HashMap<String, ColumnHandle>,
    /// Process-unique id of the current open session; column handles carry it.
    pub(crate) session: u64,
}

pub(crate) struct Shared {
    pub(crate) location: PathBuf,
    pub(crate) options: DbOptions,
    pub(crate) life: Mutex<Lifecycle>,
    /// Serializes open() and close().
    pub(crate) transition: tokio::sync::Mutex<()>,
    pub(crate) refs: RefCounter,
    pub(crate) resources: ResourceRegistry,
    pub(crate) permits: Arc<Semaphore>,
}

/// Handle of one database location. Clones share the same state.
#[derive(Clone)]
pub struct Database {
    pub(crate) shared: Arc<Shared>,
}

/// Engine reference valid for the duration of one call.
pub(crate) struct EngineRef {
    pub(crate) engine: Arc<Engine>,
    _guard: RefGuard,
}

impl Database {
    /// A closed handle for `location`; call `open()` next.
    pub fn new(location: impl AsRef<Path>, options: DbOptions) -> Self {
        let permits = Arc::new(Semaphore::new(options.parallelism.max(1)));
        Self {
            shared: Arc::new(Shared {
                location: location.as_ref().to_path_buf(),
                options,
                life: Mutex::new(Lifecycle {
                    status: Status::Closed,
                    engine: None,
                    columns: HashMap::new(),
                    session: 0,
                }),
                transition: tokio::sync::Mutex::new(()),
                refs: RefCounter::new(),
                resources: ResourceRegistry::new(),
                permits,
            }),
        }
    }

    pub(crate) fn life(&self) -> MutexGuard<'_, Lifecycle> {
        self.shared.life.lock().unwrap_or_else(|p| p.into_inner())
    }

    #[inline]
    pub fn location(&self) -> &Path {
        &self.shared.location
    }

    #[inline]
    pub fn options(&self) -> &DbOptions {
        &self.shared.options
    }

    pub fn status(&self) -> Status {
        self.life().status
    }

    pub fn is_open(&self) -> bool {
        self.status() == Status::Open
    }

    /// Number of iterators and feeds currently attached.
    pub fn open_resources(&self) -> usize {
        self.shared.resources.len()
    }

    pub(crate) fn acquire(&self) -> Result<EngineRef> {
        let life = self.life();
        if life.status != Status::Open {
            return Err(Error::NotOpen);
        }
        let engine = life.engine.clone().ok_or(Error::NotOpen)?;
        let guard = self.shared.refs.acquire();
        Ok(EngineRef {
            engine,
            _guard: guard,
        })
    }

    /// Run `f` against the engine on the blocking pool.
    pub(crate) async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Arc<Engine>) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let eref = self.acquire()?;
        let permit = Arc::clone(&self.shared.permits)
            .acquire_owned()
            .await
            .map_err(|_| Error::NotOpen)?;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let eref = eref;
            f(&eref.engine)
        })
        .await
        .map_err(Error::join)?
        .map_err(Error::Engine)
    }

    /// Latest committed sequence number.
    pub fn sequence(&self) -> Result<u64> {
        Ok(self.acquire()?.engine.latest_sequence())
    }

    /// Stable identity of the database files.
    pub fn identity(&self) -> Result<String> {
        Ok(self.acquire()?.engine.identity().to_string())
    }

    // -------------------- columns --------------------

    /// Engine column id for `column` (None = default column).
    pub(crate) fn column_id(&self, column: Option<&ColumnHandle>) -> Result<u32> {
        let Some(h) = column else {
            return Ok(DEFAULT_COLUMN_ID);
        };
        let life = self.life();
        if life.status != Status::Open {
            return Err(Error::NotOpen);
        }
        let current = life.columns.get(h.name()).map_or(false, |c| c == h);
        if current && h.db == life.session {
            Ok(h.id)
        } else {
            Err(Error::ColumnNotFound(h.name().to_string()))
        }
    }

    pub(crate) fn make_handle(life: &Lifecycle, id: u32, name: &str) -> ColumnHandle {
        ColumnHandle {
            db: life.session,
            id,
            name: Arc::from(name),
        }
    }

    /// Handle for a column id seen in committed data (None for the default column).
    pub(crate) fn column_for_id(&self, id: u32) -> Option<ColumnHandle> {
        if id == DEFAULT_COLUMN_ID {
            return None;
        }
        let life = self.life();
        if let Some(h) = life.columns.values().find(|h| h.id == id) {
            return Some(h.clone());
        }
        let engine = life.engine.as_ref()?;
        let name = engine
            .columns()
            .ok()?
            .into_iter()
            .find_map(|(cid, name)| (cid == id).then_some(name))?;
        Some(Self::make_handle(&life, id, &name))
    }
}

pub(crate) fn next_session() -> u64 {
    NEXT_SESSION.fetch_add(1, Ordering::Relaxed)
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("location", &self.shared.location)
            .field("status", &self.status())
            .finish()
    }
}
