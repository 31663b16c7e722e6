//! Bounded object pools
//!
//! [`BoundedPool`] keeps up to a fixed number of idle objects in lock-free
//! slots. Objects that do not fit, and everything returned once disposal
//! has begun, go straight to the pool's disposer. [`ConnectionPool`] builds
//! on it to share [`Db`] connections to one database file.

use std::marker::PhantomData;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::dispose::DisposeCoordinator;
use crate::storage::db::Db;
use crate::storage::error::{StoreError, StoreResult};

type Disposer<T> = Box<dyn Fn(T) -> StoreResult<()> + Send + Sync>;

/// Fixed-capacity pool of idle objects
pub struct BoundedPool<T> {
    slots: Box<[AtomicPtr<T>]>,
    coordinator: DisposeCoordinator,
    disposer: Disposer<T>,
    _owns: PhantomData<T>,
}

// SAFETY: every non-null slot pointer is a uniquely owned `Box<T>`, handed
// between threads only through atomic swaps, so sharing the pool only ever
// moves `T` values across threads.
unsafe impl<T: Send> Send for BoundedPool<T> {}
unsafe impl<T: Send> Sync for BoundedPool<T> {}

impl<T> BoundedPool<T> {
    /// Pool with `capacity` slots; `disposer` releases rejected objects
    pub fn new<D>(capacity: usize, disposer: D) -> Self
    where
        D: Fn(T) -> StoreResult<()> + Send + Sync + 'static,
    {
        let slots = (0..capacity)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();
        Self {
            slots,
            coordinator: DisposeCoordinator::new(),
            disposer: Box::new(disposer),
            _owns: PhantomData,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of idle objects (a snapshot)
    pub fn idle(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| !slot.load(Ordering::Acquire).is_null())
            .count()
    }

    pub fn coordinator(&self) -> &DisposeCoordinator {
        &self.coordinator
    }

    fn take_slot(slot: &AtomicPtr<T>) -> Option<T> {
        let taken = slot.swap(ptr::null_mut(), Ordering::AcqRel);
        if taken.is_null() {
            return None;
        }
        // SAFETY: non-null slot values come from `Box::into_raw` in `give`,
        // and the swap made this thread their only owner.
        Some(*unsafe { Box::from_raw(taken) })
    }

    /// Take an idle object, if any
    pub fn take(&self) -> Option<T> {
        self.slots.iter().find_map(Self::take_slot)
    }

    /// Return an object to the pool
    ///
    /// The object is disposed instead when every slot is full or disposal
    /// has begun. Only the disposer can fail.
    pub fn give(&self, item: T) -> StoreResult<()> {
        if self.coordinator.is_disposing_or_disposed() {
            return (self.disposer)(item);
        }

        let raw = Box::into_raw(Box::new(item));
        for slot in self.slots.iter() {
            if slot
                .compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // Disposal may have drained the slots between our check and
                // the store; whatever is in the slot now is ours to release.
                if self.coordinator.is_disposing_or_disposed() {
                    if let Some(late) = Self::take_slot(slot) {
                        return (self.disposer)(late);
                    }
                }
                return Ok(());
            }
        }

        // SAFETY: `raw` was never published to a slot, so we still own it.
        let item = *unsafe { Box::from_raw(raw) };
        debug!("Pool full, disposing returned object");
        (self.disposer)(item)
    }

    fn drain(&self) -> Vec<StoreError> {
        self.slots
            .iter()
            .filter_map(Self::take_slot)
            .filter_map(|item| (self.disposer)(item).err())
            .collect()
    }

    /// Dispose every idle object and refuse new ones
    ///
    /// Returns `Ok(false)` if another caller already disposed the pool.
    /// Disposer failures are collected into one error.
    pub fn dispose(&self) -> StoreResult<bool> {
        self.coordinator.handle_dispose_request(|| {
            let errors = self.drain();
            match StoreError::aggregate(errors) {
                Some(e) => Err(e),
                None => Ok(()),
            }
        })
    }
}

impl<T> Drop for BoundedPool<T> {
    fn drop(&mut self) {
        for e in self.drain() {
            warn!("Failed to dispose pooled object: {}", e);
        }
    }
}

// ==================== Connection Pool ====================

/// Pool of connections to one database file
pub struct ConnectionPool {
    path: PathBuf,
    pool: BoundedPool<Db>,
}

impl ConnectionPool {
    /// Pool keeping at most `size` idle connections to `path`
    pub fn new(path: impl AsRef<Path>, size: usize) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            pool: BoundedPool::new(size, Db::close),
        }
    }

    /// Pool over the configured database with `pool_size` idle slots
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.database_path(), config.pool_size)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn idle(&self) -> usize {
        self.pool.idle()
    }

    /// Borrow a connection, opening a new one when none is idle
    pub fn get(&self) -> StoreResult<PooledDb<'_>> {
        if self.pool.coordinator().is_disposing_or_disposed() {
            return Err(StoreError::Closed {
                what: "connection pool",
            });
        }
        let db = match self.pool.take() {
            Some(db) => db,
            None => {
                debug!(path = %self.path.display(), "Opening pooled connection");
                Db::open(&self.path)?
            }
        };
        Ok(PooledDb {
            pool: self,
            db: Some(db),
        })
    }

    /// Close every idle connection; connections still borrowed close on return
    pub fn dispose(&self) -> StoreResult<bool> {
        let disposed = self.pool.dispose()?;
        if disposed {
            info!(path = %self.path.display(), "Connection pool disposed");
        }
        Ok(disposed)
    }
}

/// A borrowed connection, returned to its pool on drop
pub struct PooledDb<'a> {
    pool: &'a ConnectionPool,
    db: Option<Db>,
}

impl Deref for PooledDb<'_> {
    type Target = Db;

    fn deref(&self) -> &Db {
        // `db` is only emptied in `drop`
        self.db.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledDb<'_> {
    fn drop(&mut self) {
        let Some(db) = self.db.take() else {
            return;
        };
        let result = if db.in_transaction() {
            warn!("Connection returned with an open transaction, closing it");
            db.close()
        } else {
            self.pool.pool.give(db)
        };
        if let Err(e) = result {
            warn!("Failed to return pooled connection: {}", e);
        }
    }
}
