//! registry — what a database handle has to wait for before it may close.
//!
//! Два уровня
//! - `RefCounter`: one-shot engine calls (point ops, getMany, batch commits,
//!   fetches) hold a `RefGuard` from before the call until it settles. Close
//!   waits until the count is back to zero.
//! - `ResourceRegistry`: long-lived resources (iterators, feeds) attach a close
//!   action. Close runs every action, then waits until all of them detached.
//!
//! Close actions cannot fail; a resource whose release went wrong logs it and
//! still detaches, so a broken resource never blocks shutdown.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

pub(crate) type CloseFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub(crate) type CloseFn = Box<dyn FnOnce() -> CloseFuture + Send>;

async fn wait_zero(tx: &watch::Sender<usize>) {
    let mut rx = tx.subscribe();
    loop {
        if *rx.borrow_and_update() == 0 {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

// -------------------- ref counting --------------------

#[derive(Clone)]
pub(crate) struct RefCounter {
    tx: Arc<watch::Sender<usize>>,
}

impl RefCounter {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(0usize);
        Self { tx: Arc::new(tx) }
    }

    pub(crate) fn acquire(&self) -> RefGuard {
        self.tx.send_modify(|n| *n += 1);
        RefGuard {
            tx: Arc::clone(&self.tx),
        }
    }

    pub(crate) fn count(&self) -> usize {
        *self.tx.borrow()
    }

    /// Resolves once no guard is outstanding.
    pub(crate) async fn wait_idle(&self) {
        wait_zero(&self.tx).await
    }
}

/// Held for the duration of one engine call.
pub(crate) struct RefGuard {
    tx: Arc<watch::Sender<usize>>,
}

impl Drop for RefGuard {
    fn drop(&mut self) {
        self.tx.send_modify(|n| *n -= 1);
    }
}

// -------------------- long-lived resources --------------------

struct Entries {
    next_id: u64,
    /// None once close_all has taken the action but the resource is still detaching.
    actions: HashMap<u64, Option<CloseFn>>,
}

pub(crate) struct ResourceRegistry {
    entries: Mutex<Entries>,
    count: watch::Sender<usize>,
}

impl ResourceRegistry {
    pub(crate) fn new() -> Self {
        let (count, _) = watch::channel(0usize);
        Self {
            entries: Mutex::new(Entries {
                next_id: 1,
                actions: HashMap::new(),
            }),
            count,
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, Entries> {
        // the map stays consistent even if a holder panicked
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn attach(&self, close: CloseFn) -> u64 {
        let mut e = self.entries();
        let id = e.next_id;
        e.next_id += 1;
        e.actions.insert(id, Some(close));
        let n = e.actions.len();
        drop(e);
        self.count.send_replace(n);
        id
    }

    /// Idempotent; returns whether `id` was still attached.
    pub(crate) fn detach(&self, id: u64) -> bool {
        let mut e = self.entries();
        let was = e.actions.remove(&id).is_some();
        let n = e.actions.len();
        drop(e);
        if was {
            self.count.send_replace(n);
        }
        was
    }

    pub(crate) fn len(&self) -> usize {
        *self.count.borrow()
    }

    /// Run every attached close action (in attach order) and wait until all
    /// resources detached.
    pub(crate) async fn close_all(&self) {
        let mut taken: Vec<(u64, CloseFn)> = {
            let mut e = self.entries();
            e.actions
                .iter_mut()
                .filter_map(|(id, a)| a.take().map(|a| (*id, a)))
                .collect()
        };
        taken.sort_by_key(|(id, _)| *id);
        if !taken.is_empty() {
            log::debug!("closing {} attached resource(s)", taken.len());
        }
        for (id, close) in taken {
            close().await;
            self.detach(id);
        }
        wait_zero(&self.count).await
    }
}
