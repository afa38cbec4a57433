//! db/open — open/close state machine and column handles.
//!
//! close():
//! 1) status = Closing (new calls fail with NotOpen from here on)
//! 2) wait until in-flight one-shot calls settled (RefCounter)
//! 3) close attached iterators/feeds, wait until they detached (ResourceRegistry)
//! 4) drop column handles, close the engine on the blocking pool
//! 5) status = Closed

use std::path::Path;
use std::sync::Arc;

use crate::config::{ColumnOptions, DbOptions};
use crate::engine::{Engine, DEFAULT_COLUMN};
use crate::error::{Error, Result};

use super::core::{next_session, ColumnHandle, Database, Status};

impl Database {
    /// Construct and open in one step.
    pub async fn open_with(location: impl AsRef<Path>, options: DbOptions) -> Result<Self> {
        let db = Self::new(location, options);
        db.open().await?;
        Ok(db)
    }

    /// Open the engine. Opening an open handle is a no-op.
    pub async fn open(&self) -> Result<()> {
        // до любого обращения к файловой системе
        if self.shared.location.as_os_str().is_empty() {
            return Err(Error::InvalidLocation);
        }
        let _transition = self.shared.transition.lock().await;
        {
            let mut life = self.life();
            match life.status {
                Status::Open => return Ok(()),
                Status::Closed => life.status = Status::Opening,
                // unreachable while the transition lock is held
                Status::Opening | Status::Closing => return Err(Error::NotOpen),
            }
        }

        let location = self.shared.location.clone();
        let options = self.shared.options.clone();
        log::debug!("opening database at {}", location.display());
        let opened = tokio::task::spawn_blocking(move || -> anyhow::Result<(Engine, Vec<(u32, String)>)> {
            let engine = Engine::open(&location, &options)?;
            let columns = engine.columns()?;
            Ok((engine, columns))
        })
        .await
        .map_err(anyhow::Error::new)
        .and_then(|r| r);

        let mut life = self.life();
        match opened {
            Ok((engine, columns)) => {
                life.session = next_session();
                let mut handles = std::collections::HashMap::new();
                for (id, name) in columns {
                    if name != DEFAULT_COLUMN {
                        let h = Self::make_handle(&life, id, &name);
                        handles.insert(name, h);
                    }
                }
                life.columns = handles;
                life.engine = Some(Arc::new(engine));
                life.status = Status::Open;
                log::info!(
                    "database opened at {} ({} column(s))",
                    self.shared.location.display(),
                    life.columns.len() + 1
                );
                Ok(())
            }
            Err(cause) => {
                life.status = Status::Closed;
                Err(Error::Open {
                    location: self.shared.location.clone(),
                    cause,
                })
            }
        }
    }

    /// Close the handle after every in-flight call and attached resource
    /// settled. Closing a closed handle is a no-op.
    pub async fn close(&self) -> Result<()> {
        let _transition = self.shared.transition.lock().await;
        {
            let mut life = self.life();
            match life.status {
                Status::Closed => return Ok(()),
                Status::Open => life.status = Status::Closing,
                Status::Opening | Status::Closing => return Err(Error::NotOpen),
            }
        }

        let pending = self.shared.refs.count();
        if pending > 0 {
            log::debug!("close deferred until {} in-flight call(s) settle", pending);
        }
        self.shared.refs.wait_idle().await;
        self.shared.resources.close_all().await;

        let engine = {
            let mut life = self.life();
            life.columns.clear();
            life.engine.take()
        };
        let closed = match engine {
            Some(engine) => tokio::task::spawn_blocking(move || {
                let r = engine.close();
                drop(engine);
                r
            })
            .await
            .map_err(Error::join)
            .and_then(|r| r.map_err(Error::Engine)),
            None => Ok(()),
        };

        self.life().status = Status::Closed;
        match &closed {
            Ok(()) => log::info!("database closed at {}", self.shared.location.display()),
            Err(e) => log::warn!("database at {} closed with error: {}", self.shared.location.display(), e),
        }
        closed
    }

    // -------------------- columns --------------------

    /// Create a column family (or attach to an existing one) and return its handle.
    pub async fn create_column(&self, name: &str, options: ColumnOptions) -> Result<ColumnHandle> {
        if name == DEFAULT_COLUMN {
            return Err(Error::ColumnNotFound(format!("{name} (the default column needs no handle)")));
        }
        let owned = name.to_string();
        let id = self
            .blocking(move |engine| engine.create_column(&owned, options))
            .await?;
        let mut life = self.life();
        if life.status != Status::Open {
            return Err(Error::NotOpen);
        }
        let h = Self::make_handle(&life, id, name);
        Ok(life.columns.entry(name.to_string()).or_insert(h).clone())
    }

    /// Handle of an existing column.
    pub fn column(&self, name: &str) -> Result<ColumnHandle> {
        let life = self.life();
        if life.status != Status::Open {
            return Err(Error::NotOpen);
        }
        if let Some(h) = life.columns.get(name) {
            return Ok(h.clone());
        }
        drop(life);

        // closed earlier with close_column: reattach
        let eref = self.acquire()?;
        let id = eref
            .engine
            .column_id(name)?
            .filter(|_| name != DEFAULT_COLUMN)
            .ok_or_else(|| Error::ColumnNotFound(name.to_string()))?;
        let mut life = self.life();
        let h = Self::make_handle(&life, id, name);
        Ok(life.columns.entry(name.to_string()).or_insert(h).clone())
    }

    /// Handles of all non-default columns, ordered by id.
    pub fn columns(&self) -> Result<Vec<ColumnHandle>> {
        let life = self.life();
        if life.status != Status::Open {
            return Err(Error::NotOpen);
        }
        let mut out: Vec<_> = life.columns.values().cloned().collect();
        out.sort_by_key(ColumnHandle::id);
        Ok(out)
    }

    /// Release a column handle. The column and its data stay; `column(name)`
    /// hands out a fresh handle.
    pub fn close_column(&self, handle: &ColumnHandle) -> Result<()> {
        self.column_id(Some(handle))?;
        self.life().columns.remove(handle.name());
        Ok(())
    }
}
