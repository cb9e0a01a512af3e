// Copyright 2020 Joyent, Inc.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use derive_more::{Add, AddAssign, Display, From, Into, Sub, SubAssign};
use slog::Logger;

use crate::error::Error;
use crate::host::HostDistance;

// Default sizing for hosts in the local datacenter
const DEFAULT_LOCAL_SIZING: SizingOptions = SizingOptions {
    core_connections: 2,
    max_connections: 8,
    new_connection_threshold: 100,
};
// Default sizing for hosts in remote datacenters
const DEFAULT_REMOTE_SIZING: SizingOptions = SizingOptions {
    core_connections: 1,
    max_connections: 2,
    new_connection_threshold: 100,
};

/// Sizing parameters applied to the pool of one host distance.
#[derive(Clone, Copy, Debug)]
pub struct SizingOptions {
    /// The number of connections the pool keeps open even when idle. This
    /// is the lower bound on the pool size outside of shutdown and
    /// connection failures.
    pub core_connections: u32,
    /// The upper bound on the pool size. Never exceeded.
    pub max_connections: u32,
    /// The in-flight watermark on the last connection past which the pool
    /// starts opening an additional one.
    pub new_connection_threshold: u32,
}

/// The configuration options for a baize connection pool. This is required
/// to instantiate a new pool.
#[derive(Debug, Default)]
pub struct ConnectionPoolOptions {
    /// Optional sizing for hosts at the `Local` distance. If not specified
    /// the default is 2 core connections, 8 maximum, and a new-connection
    /// threshold of 100.
    pub local: Option<SizingOptions>,
    /// Optional sizing for hosts at the `Remote` distance. If not specified
    /// the default is 1 core connection, 2 maximum, and a new-connection
    /// threshold of 100.
    pub remote: Option<SizingOptions>,
    /// Optional number of seconds a trashed connection is retained for
    /// resurrection before it becomes eligible for closing. If not
    /// specified the default is 120 seconds.
    pub idle_timeout_seconds: Option<u64>,
    /// Optional stream-ID space per connection, fixed by the native
    /// protocol version in use. If not specified the default is 128.
    pub max_streams_per_connection: Option<u32>,
    /// Optional ceiling in milliseconds on the exponential backoff retry
    /// around a transport connect. If not specified the default is 5000
    /// milliseconds.
    pub connect_timeout_millis: Option<u64>,
    /// Optional interval in seconds for an embedded cleanup tick. If not
    /// specified no timer is started and the owner of the pool is expected
    /// to invoke `cleanup_idle_connections` periodically itself.
    pub idle_cleanup_interval_seconds: Option<u64>,
    /// An optional `slog` logger instance. If none is provided then the
    /// logging will fall back to using the
    /// [`slog-stdlog`](https://docs.rs/slog-stdlog) drain which is
    /// essentially the same as using the rust standard
    /// [`log`](https://docs.rs/log) crate.
    pub log: Option<Logger>,
}

impl ConnectionPoolOptions {
    /// Resolve the sizing parameters for a host distance, applying the
    /// documented defaults.
    pub fn sizing(&self, distance: HostDistance) -> SizingOptions {
        match distance {
            HostDistance::Local => self.local.unwrap_or(DEFAULT_LOCAL_SIZING),
            HostDistance::Remote => {
                self.remote.unwrap_or(DEFAULT_REMOTE_SIZING)
            }
            HostDistance::Ignored => SizingOptions {
                core_connections: 0,
                max_connections: 0,
                new_connection_threshold: 0,
            },
        }
    }
}

/// A newtype wrapper around u32 used for counts of connections maintained
/// by the connection pool.
#[derive(
    Add,
    AddAssign,
    Clone,
    Copy,
    Debug,
    Display,
    Eq,
    From,
    Into,
    Ord,
    PartialOrd,
    PartialEq,
    Sub,
    SubAssign,
)]
pub struct ConnectionCount(u32);

/// Point-in-time connection counts for a pool.
#[derive(Copy, Clone, Debug)]
pub struct ConnectionPoolStats {
    /// Connections currently serving requests.
    pub open_connections: ConnectionCount,
    /// Connections retired to the trash and awaiting resurrection or
    /// expiry.
    pub trashed_connections: ConnectionCount,
    /// Requests borrowed and not yet returned, summed over the pool.
    pub in_flight_requests: ConnectionCount,
    /// Create tasks submitted but not yet finished.
    pub pending_connections: ConnectionCount,
}

/// The parking lot borrowers block in when every connection is saturated.
///
/// A single condition variable is deliberate: the pool promises no
/// fairness among waiters, so per-connection wait lists would buy nothing.
/// The atomic waiter count lets signalers skip the lock entirely when no
/// one is parked.
#[derive(Debug, Default)]
pub struct WaiterPark {
    waiters: AtomicUsize,
    lock: Mutex<()>,
    available: Condvar,
}

impl WaiterPark {
    pub fn new() -> Self {
        Default::default()
    }

    /// Park the calling thread until a signal arrives or the timeout
    /// elapses. Wakeups are advisory only; callers rescan the pool and
    /// re-park if nothing is actually free.
    pub fn await_available(&self, timeout: Duration) {
        let guard = self.lock.lock().unwrap();
        self.waiters.fetch_add(1, Ordering::SeqCst);
        let _ = self.available.wait_timeout(guard, timeout).unwrap();
        self.waiters.fetch_sub(1, Ordering::SeqCst);
    }

    /// Wake one parked borrower, if any.
    pub fn signal_one(&self) {
        // Quick check so returns on an idle pool never take the lock
        if self.waiters.load(Ordering::SeqCst) == 0 {
            return;
        }
        let _guard = self.lock.lock().unwrap();
        self.available.notify_one();
    }

    /// Wake every parked borrower.
    pub fn signal_all(&self) {
        if self.waiters.load(Ordering::SeqCst) == 0 {
            return;
        }
        let _guard = self.lock.lock().unwrap();
        self.available.notify_all();
    }
}

/// A copy-on-write list of shared items. Readers take an immutable
/// snapshot without locking, so iteration never observes concurrent
/// mutation; writers serialize on an internal mutex and publish a fresh
/// vector. Item identity is pointer identity.
pub struct SnapshotList<T> {
    items: ArcSwap<Vec<Arc<T>>>,
    write_lock: Mutex<()>,
}

impl<T> SnapshotList<T> {
    pub fn new() -> Self {
        SnapshotList {
            items: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// The current contents. The snapshot is immutable and stays valid
    /// while writers publish newer versions.
    pub fn snapshot(&self) -> Arc<Vec<Arc<T>>> {
        self.items.load_full()
    }

    pub fn is_empty(&self) -> bool {
        self.items.load().is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.load().len()
    }

    pub fn push(&self, item: Arc<T>) {
        let _guard = self.write_lock.lock().unwrap();
        let mut next = Vec::clone(&self.items.load_full());
        next.push(item);
        self.items.store(Arc::new(next));
    }

    pub fn extend(&self, new_items: Vec<Arc<T>>) {
        let _guard = self.write_lock.lock().unwrap();
        let mut next = Vec::clone(&self.items.load_full());
        next.extend(new_items);
        self.items.store(Arc::new(next));
    }

    /// Remove an item by pointer identity. Returns whether it was present.
    pub fn remove(&self, item: &Arc<T>) -> bool {
        let _guard = self.write_lock.lock().unwrap();
        let current = self.items.load_full();
        let next: Vec<Arc<T>> = current
            .iter()
            .filter(|candidate| !Arc::ptr_eq(candidate, item))
            .cloned()
            .collect();
        let removed = next.len() != current.len();
        if removed {
            self.items.store(Arc::new(next));
        }
        removed
    }
}

impl<T> Default for SnapshotList<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A one-shot future completed when the pool's initial core connections
/// have been established, or failed as a group.
#[derive(Clone)]
pub struct InitFuture(InitShared);

type InitShared = Arc<(Mutex<Option<Result<(), Error>>>, Condvar)>;

impl InitFuture {
    pub(crate) fn new() -> Self {
        InitFuture(Arc::new((Mutex::new(None), Condvar::new())))
    }

    pub(crate) fn complete(&self, result: Result<(), Error>) {
        let (lock, condvar) = &*self.0;
        let mut m_result = lock.lock().unwrap();
        if m_result.is_none() {
            *m_result = Some(result);
            condvar.notify_all();
        }
    }

    /// The outcome of initialization, if it has finished.
    pub fn result(&self) -> Option<Result<(), Error>> {
        (self.0).0.lock().unwrap().clone()
    }

    /// Block until initialization finishes.
    pub fn wait(&self) -> Result<(), Error> {
        let (lock, condvar) = &*self.0;
        let mut m_result = lock.lock().unwrap();
        loop {
            if let Some(result) = &*m_result {
                return result.clone();
            }
            m_result = condvar.wait(m_result).unwrap();
        }
    }

    /// Block until initialization finishes or the timeout elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<(), Error>> {
        let (lock, condvar) = &*self.0;
        let mut m_result = lock.lock().unwrap();
        if m_result.is_none() {
            let (guard, _) = condvar.wait_timeout(m_result, timeout).unwrap();
            m_result = guard;
        }
        m_result.clone()
    }
}
