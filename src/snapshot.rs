//! Versioned, atomically swappable snapshots for hot-reloadable config.
//!
//! Readers take a cheap `Arc` of the current snapshot and keep using it for the
//! rest of their request; writers publish a whole new value. A reader never
//! observes a half-applied update.
//!
//! Writers are serialized, so versions are published in increasing order and
//! [`SnapshotCell::version`] never goes backwards. Reads never take the lock.

use std::sync::{Arc, Mutex, MutexGuard};

use arc_swap::ArcSwap;

/// A value together with the version it was published as.
#[derive(Debug, PartialEq)]
pub struct Snapshot<T> {
    version: u64,
    value: T,
}

impl<T> Snapshot<T> {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn value(&self) -> &T {
        &self.value
    }
}

impl<T> std::ops::Deref for Snapshot<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

/// Shared cell holding the current [`Snapshot`]. Clones share the same cell.
#[derive(Debug)]
pub struct SnapshotCell<T> {
    inner: Arc<ArcSwap<Snapshot<T>>>,
    writer: Arc<Mutex<()>>,
}

impl<T> Clone for SnapshotCell<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), writer: self.writer.clone() }
    }
}

impl<T> SnapshotCell<T> {
    /// Publish `value` as version 1.
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(Snapshot { version: 1, value })),
            writer: Arc::new(Mutex::new(())),
        }
    }

    fn write_lock(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Current snapshot (cheap clone of Arc).
    pub fn load(&self) -> Arc<Snapshot<T>> {
        self.inner.load_full()
    }

    /// Version of the current snapshot.
    pub fn version(&self) -> u64 {
        self.inner.load().version
    }

    /// Replace the value entirely; returns the new version.
    pub fn publish(&self, value: T) -> u64 {
        let _writer = self.write_lock();
        let version = self.inner.load().version + 1;
        self.inner.store(Arc::new(Snapshot { version, value }));
        version
    }

    /// Derive the next value from the current one and publish it.
    ///
    /// Concurrent updates are applied one after another; none is lost.
    pub fn update<F>(&self, f: F) -> u64
    where
        F: FnOnce(&T) -> T,
    {
        let _writer = self.write_lock();
        let current = self.inner.load_full();
        let version = current.version + 1;
        self.inner.store(Arc::new(Snapshot { version, value: f(&current.value) }));
        version
    }
}
