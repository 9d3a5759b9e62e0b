//! Named read/write locks shared across job types.
//!
//! [`NamedLocks`] is a registry of async read/write locks keyed by resource
//! name (`"database"`, `"print-history"`, ...). Distinct names are
//! independent; a writer on a name excludes every reader and writer on the
//! same name.
//!
//! Jobs do not hold registry guards directly. Each firing owns a
//! [`HeldLocks`] scope (reachable through its `JobContext`) which makes
//! acquisition reentrant within the firing and is drained by the lifecycle
//! template after `on_exit`, so a lock can never outlive the firing that
//! took it.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Errors from lock acquisition.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LockError {
    /// The firing holds a read lock on the name and asked for the write lock.
    #[error("cannot upgrade read lock '{0}' to a write lock")]
    UpgradeNotSupported(String),
}

/// Access mode of a named lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Shared access.
    Read,
    /// Exclusive access.
    Write,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Read => f.write_str("read"),
            LockMode::Write => f.write_str("write"),
        }
    }
}

/// Registry of read/write locks keyed by resource name.
#[derive(Default)]
pub struct NamedLocks {
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl NamedLocks {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, name: &str) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(locks.entry(name.to_string()).or_default())
    }

    /// Wait for shared access to `name`.
    pub async fn read(&self, name: &str) -> OwnedRwLockReadGuard<()> {
        self.lock_for(name).read_owned().await
    }

    /// Wait for exclusive access to `name`.
    pub async fn write(&self, name: &str) -> OwnedRwLockWriteGuard<()> {
        self.lock_for(name).write_owned().await
    }

    /// Take exclusive access to `name` only if it is free right now.
    pub fn try_write(&self, name: &str) -> Option<OwnedRwLockWriteGuard<()>> {
        self.lock_for(name).try_write_owned().ok()
    }

    /// Take shared access to `name` only if no writer holds it.
    pub fn try_read(&self, name: &str) -> Option<OwnedRwLockReadGuard<()>> {
        self.lock_for(name).try_read_owned().ok()
    }

    /// Names that have been used at least once.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.locks.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

enum Guard {
    Read(#[allow(dead_code)] OwnedRwLockReadGuard<()>),
    Write(#[allow(dead_code)] OwnedRwLockWriteGuard<()>),
}

struct Held {
    guard: Guard,
    depth: u32,
}

impl Held {
    fn mode(&self) -> LockMode {
        match self.guard {
            Guard::Read(_) => LockMode::Read,
            Guard::Write(_) => LockMode::Write,
        }
    }
}

/// The named locks held by one firing.
pub struct HeldLocks {
    registry: Arc<NamedLocks>,
    held: Mutex<HashMap<String, Held>>,
}

impl HeldLocks {
    /// Create an empty scope over `registry`.
    pub fn new(registry: Arc<NamedLocks>) -> Self {
        Self {
            registry,
            held: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire `name` in `mode`, waiting for conflicting holders to release.
    ///
    /// Re-acquiring a name this scope already holds never blocks: a second
    /// read or write on a held write lock, or a second read on a held read
    /// lock, only bumps the hold depth. Asking for write while holding read
    /// is refused, since waiting would deadlock on ourselves.
    pub async fn acquire(&self, name: &str, mode: LockMode) -> Result<(), LockError> {
        if self.reenter(name, mode)? {
            return Ok(());
        }

        let guard = match mode {
            LockMode::Read => Guard::Read(self.registry.read(name).await),
            LockMode::Write => Guard::Write(self.registry.write(name).await),
        };
        tracing::trace!(lock = name, mode = %mode, "Named lock acquired");

        let mut held = self.held.lock();
        match held.get_mut(name) {
            // Another phase of this firing got there while we waited.
            Some(existing) => existing.depth += 1,
            None => {
                held.insert(name.to_string(), Held { guard, depth: 1 });
            }
        }
        Ok(())
    }

    fn reenter(&self, name: &str, mode: LockMode) -> Result<bool, LockError> {
        let mut held = self.held.lock();
        let Some(existing) = held.get_mut(name) else {
            return Ok(false);
        };
        if existing.mode() == LockMode::Read && mode == LockMode::Write {
            return Err(LockError::UpgradeNotSupported(name.to_string()));
        }
        existing.depth += 1;
        Ok(true)
    }

    /// Release one hold on `name`. Returns false if the scope did not hold it.
    pub fn release(&self, name: &str) -> bool {
        let mut held = self.held.lock();
        let Some(existing) = held.get_mut(name) else {
            return false;
        };
        existing.depth -= 1;
        if existing.depth == 0 {
            held.remove(name);
            tracing::trace!(lock = name, "Named lock released");
        }
        true
    }

    /// Release every lock in the scope regardless of depth.
    ///
    /// Returns the number of distinct names released.
    pub fn release_all(&self) -> usize {
        let drained: Vec<_> = self.held.lock().drain().collect();
        let count = drained.len();
        drop(drained);
        count
    }

    /// Mode in which `name` is currently held, if at all.
    pub fn mode_of(&self, name: &str) -> Option<LockMode> {
        self.held.lock().get(name).map(Held::mode)
    }

    /// Whether the scope holds no locks.
    pub fn is_empty(&self) -> bool {
        self.held.lock().is_empty()
    }
}

impl Drop for HeldLocks {
    fn drop(&mut self) {
        self.held.get_mut().clear();
    }
}
