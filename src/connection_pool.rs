// Copyright 2020 Joyent, Inc.

pub mod types;

use std::fmt::Result as FmtResult;
use std::fmt::{Debug, Formatter};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::channel;
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use backoff::{ExponentialBackoff, Operation};
use chrono::Utc;
use slog::{debug, error, o, trace, warn, Drain, Logger};

use crate::connection::{CloseFuture, Connection, ConnectionState, Transport};
use crate::connection_pool::types::{
    ConnectionCount, ConnectionPoolOptions, ConnectionPoolStats, InitFuture,
    SizingOptions, SnapshotList, WaiterPark,
};
use crate::error::Error;
use crate::host::{Host, HostDistance};

// Only one connection may be in creation at a time outside of pool
// initialization and core top-up; this keeps a burst of borrows from
// spawning opens far in excess of the load.
const MAX_SIMULTANEOUS_CREATION: usize = 1;

// When a request times out its stream ID may never be released, so over
// time a connection can bleed available streams. Once the remaining count
// drops below this threshold the connection is replaced by a new one.
const MIN_AVAILABLE_STREAMS: usize = 96;

// Default idle timeout in seconds before a trashed connection may close
const DEFAULT_IDLE_TIMEOUT_SECONDS: u64 = 120;
// Default stream-ID space per connection
const DEFAULT_MAX_STREAMS_PER_CONNECTION: u32 = 128;
// Default ceiling in milliseconds on the connect retry backoff
const DEFAULT_CONNECT_TIMEOUT_MILLIS: u64 = 5_000;

/// A pool of multiplexed connections to a single database host.
///
/// The pool keeps between `core` and `max` long-lived connections open,
/// hands the least busy one to each [`borrow`](ConnectionPool::borrow),
/// parks borrowers when every stream slot is taken, and grows and shrinks
/// with the observed in-flight load. Cloning the pool is cheap and every
/// clone operates on the same shared state; create tasks and the shutdown
/// drain run on their own threads holding such clones.
pub struct ConnectionPool<C, F>
where
    C: Transport,
    F: Fn(&Host) -> C + Send + Sync + 'static,
{
    inner: Arc<PoolInner<C, F>>,
}

impl<C, F> Clone for ConnectionPool<C, F>
where
    C: Transport,
    F: Fn(&Host) -> C + Send + Sync + 'static,
{
    fn clone(&self) -> ConnectionPool<C, F> {
        ConnectionPool {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C, F> Debug for ConnectionPool<C, F>
where
    C: Transport,
    F: Fn(&Host) -> C + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        f.debug_struct("ConnectionPool")
            .field("host", &self.inner.host.name)
            .field("distance", &self.inner.distance)
            .field("open", &self.opened())
            .field("trashed", &self.trashed())
            .field(
                "total_in_flight",
                &self.inner.total_in_flight.load(Ordering::SeqCst),
            )
            .field(
                "is_closing",
                &self.inner.is_closing.load(Ordering::SeqCst),
            )
            .finish()
    }
}

struct PoolInner<C, F>
where
    C: Transport,
    F: Fn(&Host) -> C + Send + Sync + 'static,
{
    host: Host,
    distance: HostDistance,
    sizing: SizingOptions,
    idle_timeout_millis: i64,
    max_streams_per_connection: usize,
    connect_timeout: Duration,
    create_connection: F,
    connections: SnapshotList<Connection<C>>,
    trash: SnapshotList<Connection<C>>,
    open: AtomicUsize,
    scheduled_for_creation: AtomicUsize,
    total_in_flight: AtomicUsize,
    max_total_in_flight: AtomicUsize,
    is_closing: AtomicBool,
    close_future: Mutex<Option<CloseFuture>>,
    waiters: WaiterPark,
    init_future: InitFuture,
    keyspace: Mutex<Option<String>>,
    cleanup_timer: Mutex<Option<(timer::Timer, timer::Guard)>>,
    log: Logger,
}

impl<C, F> ConnectionPool<C, F>
where
    C: Transport,
    F: Fn(&Host) -> C + Send + Sync + 'static,
{
    /// Create a pool for `host` and immediately start opening its core
    /// connections in parallel. The returned pool is usable at once;
    /// [`init_future`](ConnectionPool::init_future) completes when every
    /// core opening has finished. A half-initialized pool is not a valid
    /// resting state: if any core opening fails, the ones that succeeded
    /// are force-closed and the init future carries the failure.
    ///
    /// `m_preexisting` is an existing connection (typically from a
    /// reconnection attempt) to reuse as one of the core connections. It is
    /// ignored if it is already attached to another pool.
    pub fn new(
        cpo: ConnectionPoolOptions,
        host: Host,
        distance: HostDistance,
        create_connection: F,
        m_preexisting: Option<Arc<Connection<C>>>,
    ) -> Self {
        assert!(
            distance != HostDistance::Ignored,
            "an ignored host gets no connection pool"
        );

        let sizing = cpo.sizing(distance);

        let logger = cpo
            .log
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let log = logger.new(o!("host" => host.name.clone()));

        let idle_timeout_millis = cpo
            .idle_timeout_seconds
            .unwrap_or(DEFAULT_IDLE_TIMEOUT_SECONDS)
            as i64
            * 1000;
        let max_streams_per_connection = cpo
            .max_streams_per_connection
            .unwrap_or(DEFAULT_MAX_STREAMS_PER_CONNECTION)
            as usize;
        let connect_timeout = Duration::from_millis(
            cpo.connect_timeout_millis
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MILLIS),
        );

        let inner = Arc::new(PoolInner {
            host,
            distance,
            sizing,
            idle_timeout_millis,
            max_streams_per_connection,
            connect_timeout,
            create_connection,
            connections: SnapshotList::new(),
            trash: SnapshotList::new(),
            open: AtomicUsize::new(0),
            scheduled_for_creation: AtomicUsize::new(0),
            total_in_flight: AtomicUsize::new(0),
            max_total_in_flight: AtomicUsize::new(0),
            is_closing: AtomicBool::new(false),
            close_future: Mutex::new(None),
            waiters: WaiterPark::new(),
            init_future: InitFuture::new(),
            keyspace: Mutex::new(None),
            cleanup_timer: Mutex::new(None),
            log,
        });

        let pool = ConnectionPool { inner };
        pool.start_init(m_preexisting);
        if let Some(interval) = cpo.idle_cleanup_interval_seconds {
            pool.start_cleanup_timer(interval);
        }
        pool
    }

    /// The host this pool serves.
    pub fn host(&self) -> &Host {
        &self.inner.host
    }

    /// The distance classification the sizing parameters were chosen for.
    pub fn host_distance(&self) -> HostDistance {
        self.inner.distance
    }

    /// The future completed when the initial core connections are
    /// established or have failed as a group.
    pub fn init_future(&self) -> InitFuture {
        self.inner.init_future.clone()
    }

    /// The number of connections currently counted as serving.
    pub fn opened(&self) -> usize {
        self.inner.open.load(Ordering::SeqCst)
    }

    /// The number of connections currently sitting in the trash.
    pub fn trashed(&self) -> usize {
        self.inner.trash.len()
    }

    /// Point-in-time counters for the pool.
    pub fn get_stats(&self) -> ConnectionPoolStats {
        let inner = &self.inner;
        ConnectionPoolStats {
            open_connections: ConnectionCount::from(
                inner.open.load(Ordering::SeqCst) as u32,
            ),
            trashed_connections: ConnectionCount::from(
                inner.trash.len() as u32
            ),
            in_flight_requests: ConnectionCount::from(
                inner.total_in_flight.load(Ordering::SeqCst) as u32,
            ),
            pending_connections: ConnectionCount::from(
                inner.scheduled_for_creation.load(Ordering::SeqCst) as u32,
            ),
        }
    }

    /// Record the logical namespace requests should run in. Each borrowed
    /// connection is switched to it before being handed out.
    pub fn set_keyspace(&self, m_keyspace: Option<String>) {
        *self.inner.keyspace.lock().unwrap() = m_keyspace;
    }

    /// Whether `close_async` has been invoked on this pool.
    pub fn is_closed(&self) -> bool {
        self.inner.close_future.lock().unwrap().is_some()
    }

    /// Borrow the least busy connection, with its in-flight count already
    /// incremented on behalf of the caller. When every connection is
    /// saturated the calling thread parks until a slot frees up or
    /// `timeout` elapses. The reservation is released when the returned
    /// guard drops.
    pub fn borrow(
        &self,
        timeout: Duration,
    ) -> Result<BorrowedConnection<C, F>, Error> {
        if self.is_closed() {
            return Err(Error::PoolClosed);
        }

        let inner = &self.inner;
        let connections = inner.connections.snapshot();
        let reserved;
        if connections.is_empty() {
            // Initialization has not finished, or every connection was
            // lost. Creation here bypasses the single-creation throttle,
            // which only guards against overshooting core under load.
            for _ in 0..inner.sizing.core_connections {
                inner.scheduled_for_creation.fetch_add(1, Ordering::SeqCst);
                self.spawn_create_task();
            }
            reserved = self.wait_for_connection(timeout)?;
        } else {
            match least_busy(&connections) {
                None => {
                    // Raced with a shutdown emptying the pool since the
                    // snapshot was taken
                    if self.is_closed() {
                        return Err(Error::PoolClosed);
                    }
                    reserved = self.wait_for_connection(timeout)?;
                }
                Some(candidate) => {
                    if candidate.try_reserve_stream() {
                        reserved = Arc::clone(candidate);
                    } else {
                        // The least busy connection is saturated, so the
                        // whole pool is; park rather than rescanning.
                        reserved = self.wait_for_connection(timeout)?;
                    }
                }
            }
        }

        // However the slot was obtained, account for it and re-evaluate the
        // growth trigger on fresh counters.
        let total_in_flight =
            inner.total_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        loop {
            let old_max = inner.max_total_in_flight.load(Ordering::SeqCst);
            if total_in_flight <= old_max
                || inner
                    .max_total_in_flight
                    .compare_exchange(
                        old_max,
                        total_in_flight,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok()
            {
                break;
            }
        }

        let connection_count = inner.open.load(Ordering::SeqCst)
            + inner.scheduled_for_creation.load(Ordering::SeqCst);
        if connection_count < inner.sizing.max_connections as usize {
            // Add a connection if we fill the first n-1 connections and
            // almost fill the last one
            let current_capacity = (connection_count as i64 - 1)
                * inner.max_streams_per_connection as i64
                + inner.sizing.new_connection_threshold as i64;
            if total_in_flight as i64 > current_capacity {
                self.maybe_spawn_new_connection();
            }
        }

        if let Some(keyspace) = inner.keyspace.lock().unwrap().clone() {
            reserved.ensure_keyspace(&keyspace);
        }

        Ok(BorrowedConnection {
            pool: self.clone(),
            connection: Some(reserved),
        })
    }

    // Park until a stream slot can be reserved somewhere in the pool.
    // Returns the connection the reservation landed on.
    fn wait_for_connection(
        &self,
        timeout: Duration,
    ) -> Result<Arc<Connection<C>>, Error> {
        if timeout == Duration::from_secs(0) {
            return Err(Error::Timeout);
        }

        let start = Instant::now();
        loop {
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(Error::Timeout);
            }
            self.inner.waiters.await_available(timeout - elapsed);

            if self.inner.is_closing.load(Ordering::SeqCst) || self.is_closed()
            {
                return Err(Error::PoolClosed);
            }

            let connections = self.inner.connections.snapshot();
            if let Some(candidate) = least_busy(&connections) {
                if candidate.try_reserve_stream() {
                    return Ok(Arc::clone(candidate));
                }
            }
        }
    }

    // The counterpart of a borrow; invoked by the guard drop.
    fn return_connection(&self, connection: &Arc<Connection<C>>) {
        connection.release_stream();
        self.inner.total_in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.is_closed() {
            connection.close_async();
            return;
        }

        if connection.is_defunct() {
            // Defunct handling already arranged a replacement
            return;
        }

        if connection.state().load() != ConnectionState::Trashed {
            if connection.available_streams() < MIN_AVAILABLE_STREAMS {
                self.replace_connection(connection);
            } else {
                self.inner.waiters.signal_one();
            }
        }
    }

    // Trash a connection that bled too many stream IDs and schedule a
    // replacement. Unlike trash_connection this never refuses: the
    // connection must not serve further borrows.
    fn replace_connection(&self, connection: &Arc<Connection<C>>) {
        if !connection
            .state()
            .transition(ConnectionState::Open, ConnectionState::Trashed)
        {
            return;
        }
        self.inner.open.fetch_sub(1, Ordering::SeqCst);
        self.maybe_spawn_new_connection();
        connection.set_max_idle_time(i64::MIN);
        self.do_trash_connection(connection);
    }

    // Trash one connection on behalf of a shrink tick. Refuses, reverting
    // the state transition, when doing so would take the pool below core.
    fn trash_connection(&self, connection: &Arc<Connection<C>>) -> bool {
        if !connection
            .state()
            .transition(ConnectionState::Open, ConnectionState::Trashed)
        {
            return true;
        }

        loop {
            let opened = self.inner.open.load(Ordering::SeqCst);
            if opened <= self.inner.sizing.core_connections as usize {
                connection.state().store(ConnectionState::Open);
                return false;
            }
            if self
                .inner
                .open
                .compare_exchange(
                    opened,
                    opened - 1,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                break;
            }
        }

        trace!(self.inner.log, "trashing connection");
        connection.set_max_idle_time(
            Utc::now().timestamp_millis() + self.inner.idle_timeout_millis,
        );
        self.do_trash_connection(connection);
        true
    }

    fn do_trash_connection(&self, connection: &Arc<Connection<C>>) {
        self.inner.connections.remove(connection);
        self.inner.trash.push(Arc::clone(connection));
    }

    // Spawn a create task unless one is already pending.
    fn maybe_spawn_new_connection(&self) {
        loop {
            let in_creation =
                self.inner.scheduled_for_creation.load(Ordering::SeqCst);
            if in_creation >= MAX_SIMULTANEOUS_CREATION {
                return;
            }
            if self
                .inner
                .scheduled_for_creation
                .compare_exchange(
                    in_creation,
                    in_creation + 1,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                break;
            }
        }

        self.spawn_create_task();
    }

    // Run one create attempt on its own thread. Callers have already
    // incremented scheduled_for_creation.
    fn spawn_create_task(&self) {
        let pool = self.clone();
        thread::spawn(move || {
            pool.add_connection_if_under_maximum();
            pool.inner
                .scheduled_for_creation
                .fetch_sub(1, Ordering::SeqCst);
        });
    }

    // Add one connection, resurrecting from the trash when possible,
    // unless the pool is already at its maximum or closing.
    fn add_connection_if_under_maximum(&self) -> bool {
        let inner = &self.inner;

        // Reserve a slot in `open`, refusing to cross the maximum
        loop {
            let opened = inner.open.load(Ordering::SeqCst);
            if opened >= inner.sizing.max_connections as usize {
                return false;
            }
            if inner
                .open
                .compare_exchange(
                    opened,
                    opened + 1,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                break;
            }
        }

        if inner.is_closing.load(Ordering::SeqCst) {
            inner.open.fetch_sub(1, Ordering::SeqCst);
            return false;
        }

        let connection = match self.try_resurrect_from_trash() {
            Some(connection) => connection,
            None => {
                debug!(inner.log, "creating new connection on busy pool");
                match self.open_new_connection() {
                    Ok(connection) => connection,
                    Err(e) => {
                        inner.open.fetch_sub(1, Ordering::SeqCst);
                        debug!(
                            inner.log,
                            "error while creating additional connection: {}",
                            e
                        );
                        return false;
                    }
                }
            }
        };

        inner.connections.push(Arc::clone(&connection));
        // No-op unless the connection came out of the trash
        connection
            .state()
            .transition(ConnectionState::Resurrecting, ConnectionState::Open);

        // We may have raced with a shutdown since the check above; make
        // sure the connection gets closed if the pool will not do it.
        if inner.is_closing.load(Ordering::SeqCst) && !connection.is_closed() {
            connection.close_async();
            inner.open.fetch_sub(1, Ordering::SeqCst);
            return false;
        }

        inner.waiters.signal_one();
        true
    }

    // Pick the most recently trashed connection that is still healthy and
    // not yet past its idle deadline; it is the one most likely to still
    // be warm. Selection retries when the state CAS is lost.
    fn try_resurrect_from_trash(&self) -> Option<Arc<Connection<C>>> {
        let now = Utc::now().timestamp_millis();
        loop {
            let trash = self.inner.trash.snapshot();
            let mut highest_max_idle_time = now;
            let mut m_chosen: Option<&Arc<Connection<C>>> = None;
            for connection in trash.iter() {
                if connection.max_idle_time() > highest_max_idle_time
                    && connection.available_streams() > MIN_AVAILABLE_STREAMS
                {
                    highest_max_idle_time = connection.max_idle_time();
                    m_chosen = Some(connection);
                }
            }

            match m_chosen {
                None => return None,
                Some(chosen) => {
                    if chosen.state().transition(
                        ConnectionState::Trashed,
                        ConnectionState::Resurrecting,
                    ) {
                        trace!(self.inner.log, "resurrecting connection");
                        let chosen = Arc::clone(chosen);
                        self.inner.trash.remove(&chosen);
                        return Some(chosen);
                    }
                }
            }
        }
    }

    // Create a transport and connect it, retrying under a bounded
    // exponential backoff.
    fn open_new_connection(&self) -> Result<Arc<Connection<C>>, Error> {
        let inner = &self.inner;
        let mut transport = (inner.create_connection)(&inner.host);

        let mut backoff = ExponentialBackoff {
            max_elapsed_time: Some(inner.connect_timeout),
            ..Default::default()
        };
        let mut m_last_error = None;
        let retry_result = {
            let mut op = || {
                transport.connect().map_err(|e| {
                    warn!(
                        inner.log,
                        "retrying connection to {}: {}", inner.host.name, e
                    );
                    m_last_error = Some(e.to_string());
                })?;
                Ok(())
            };
            op.retry(&mut backoff)
        };
        if retry_result.is_err() {
            error!(inner.log, "giving up trying to establish connection");
            return Err(Error::ConnectionFailure(match m_last_error {
                Some(last_error) => format!(
                    "failed to connect to {}: {}",
                    inner.host.name, last_error
                ),
                None => format!("failed to connect to {}", inner.host.name),
            }));
        }

        let connection = Connection::new(
            inner.host.clone(),
            transport,
            inner.max_streams_per_connection,
            inner.log.clone(),
        );
        connection.attach();
        Ok(connection)
    }

    // Open the initial core connections in parallel and complete the init
    // future with the aggregate outcome.
    fn start_init(&self, m_preexisting: Option<Arc<Connection<C>>>) {
        let core = self.inner.sizing.core_connections as usize;
        let (result_tx, result_rx) = channel();

        let mut m_preexisting = m_preexisting;
        for _ in 0..core {
            if let Some(preexisting) = m_preexisting.take() {
                if preexisting.attach() {
                    result_tx.send(Ok(preexisting)).unwrap();
                    continue;
                }
                // Attached to another pool; open a fresh connection instead
            }
            let pool = self.clone();
            let opener_tx = result_tx.clone();
            thread::spawn(move || {
                let _ = opener_tx.send(pool.open_new_connection());
            });
        }
        drop(result_tx);

        let pool = self.clone();
        thread::spawn(move || {
            let mut opened = Vec::with_capacity(core);
            let mut m_error = None;
            for result in result_rx {
                match result {
                    Ok(connection) => opened.push(connection),
                    Err(e) => {
                        if m_error.is_none() {
                            m_error = Some(e);
                        }
                    }
                }
            }
            match m_error {
                None => {
                    let count = opened.len();
                    pool.inner.connections.extend(opened);
                    pool.inner.open.store(count, Ordering::SeqCst);
                    trace!(pool.inner.log, "created connection pool");
                    pool.inner.init_future.complete(Ok(()));
                }
                Some(err) => {
                    // The pool must not come up half-initialized; close
                    // whatever did open.
                    for connection in opened.iter() {
                        connection.close_async();
                    }
                    pool.inner.init_future.complete(Err(err));
                }
            }
        });
    }

    /// Remove a connection whose transport has failed and schedule a
    /// replacement. Safe to invoke concurrently and repeatedly for the
    /// same connection.
    pub fn replace_defunct_connection(
        &self,
        connection: &Arc<Connection<C>>,
    ) {
        if connection
            .state()
            .transition(ConnectionState::Open, ConnectionState::Gone)
        {
            self.inner.open.fetch_sub(1, Ordering::SeqCst);
        }
        if self.inner.connections.remove(connection) {
            let pool = self.clone();
            thread::spawn(move || {
                pool.add_connection_if_under_maximum();
            });
        }
        connection.close_async();
    }

    /// Top the pool back up to its core connection count. Invoked when a
    /// host comes back up. Racy by nature: any excess created over core is
    /// trashed again by a later shrink tick, and the maximum is still
    /// enforced by the create task itself.
    pub fn ensure_core_connections(&self) {
        if self.is_closed() {
            return;
        }

        let opened = self.inner.open.load(Ordering::SeqCst);
        for _ in opened..self.inner.sizing.core_connections as usize {
            // The single-creation throttle only guards against exceeding
            // core too quickly, so it does not apply here
            self.inner
                .scheduled_for_creation
                .fetch_add(1, Ordering::SeqCst);
            self.spawn_create_task();
        }
    }

    /// One sizing tick: retire connections the observed load no longer
    /// justifies and close trashed connections past their idle deadline.
    /// `now` is wall-clock milliseconds supplied by the caller's clock.
    pub fn cleanup_idle_connections(&self, now: i64) {
        if self.is_closed() {
            return;
        }

        self.shrink_if_below_capacity();
        self.cleanup_trash(now);
    }

    // If we have more open connections than the high-water in-flight load
    // since the previous tick justifies, trash the excess.
    fn shrink_if_below_capacity(&self) {
        let inner = &self.inner;
        let current_load = inner
            .max_total_in_flight
            .swap(inner.total_in_flight.load(Ordering::SeqCst), Ordering::SeqCst);

        let max_streams = inner.max_streams_per_connection;
        let mut needed = current_load / max_streams + 1;
        if current_load % max_streams
            > inner.sizing.new_connection_threshold as usize
        {
            needed += 1;
        }
        let needed = needed.max(inner.sizing.core_connections as usize);
        let actual = inner.open.load(Ordering::SeqCst);
        let mut to_trash = actual.saturating_sub(needed);

        trace!(
            inner.log,
            "in flight {}, {} connections needed, {} available, trashing {}",
            current_load,
            needed,
            actual,
            to_trash
        );

        if to_trash == 0 {
            return;
        }

        for connection in inner.connections.snapshot().iter() {
            if self.trash_connection(connection) {
                to_trash -= 1;
                if to_trash == 0 {
                    return;
                }
            }
        }
    }

    // Close trashed connections that have sat past their idle deadline.
    fn cleanup_trash(&self, now: i64) {
        for connection in self.inner.trash.snapshot().iter() {
            if connection.max_idle_time() < now
                && connection
                    .state()
                    .transition(ConnectionState::Trashed, ConnectionState::Gone)
            {
                if connection.in_flight() == 0 {
                    trace!(self.inner.log, "cleaning up trashed connection");
                    self.inner.trash.remove(connection);
                    connection.close_async();
                } else {
                    // The idle timeout dwarfs any request timeout, so
                    // outstanding requests should have drained; put the
                    // connection back and retry on the next tick.
                    connection.state().store(ConnectionState::Trashed);
                }
            }
        }
    }

    /// Begin an idempotent shutdown. Every parked borrower is woken and
    /// fails with `PoolClosed`; the returned future completes once every
    /// underlying connection, live or trashed, has finished closing.
    /// Concurrent callers all receive the same future.
    pub fn close_async(&self) -> CloseFuture {
        {
            let m_future = self.inner.close_future.lock().unwrap();
            if let Some(future) = &*m_future {
                return future.clone();
            }
        }

        self.inner.is_closing.store(true, Ordering::SeqCst);

        // Wake up all threads that wait
        self.inner.waiters.signal_all();

        let future = self.discard_available_connections();

        let mut m_future = self.inner.close_future.lock().unwrap();
        match &*m_future {
            // We raced and lost; the winner's future is the pool's, and
            // our drain's side effects are benign duplicates.
            Some(winner) => winner.clone(),
            None => {
                *m_future = Some(future.clone());
                future
            }
        }
    }

    // Initiate a close on every connection in both sets, then drain them
    // on a separate thread, accounting each live connection as gone when
    // its close completes.
    fn discard_available_connections(&self) -> CloseFuture {
        let aggregate = CloseFuture::new();
        let drained = aggregate.clone();
        let pool = self.clone();
        thread::spawn(move || {
            let connections = pool.inner.connections.snapshot();
            let trash = pool.inner.trash.snapshot();

            let mut closes =
                Vec::with_capacity(connections.len() + trash.len());
            for connection in connections.iter() {
                closes.push(connection.close_async());
            }
            // Trashed connections may still be open if they had not
            // reached their idle deadline
            for connection in trash.iter() {
                closes.push(connection.close_async());
            }

            for (connection, close) in connections.iter().zip(closes.iter()) {
                close.wait();
                if connection.state().transition(
                    ConnectionState::Open,
                    ConnectionState::Gone,
                ) {
                    pool.inner.open.fetch_sub(1, Ordering::SeqCst);
                }
            }
            for close in closes.iter().skip(connections.len()) {
                close.wait();
            }
            drained.complete();
        });
        aggregate
    }

    // Start the embedded cleanup ticker. The timer callback holds a weak
    // reference so an abandoned pool can still be dropped.
    fn start_cleanup_timer(&self, interval_seconds: u64) {
        debug!(
            self.inner.log,
            "starting cleanup task, interval {} seconds", interval_seconds
        );
        let timer = timer::Timer::new();
        let weak: Weak<PoolInner<C, F>> = Arc::downgrade(&self.inner);
        let guard = timer.schedule_repeating(
            chrono::Duration::seconds(interval_seconds as i64),
            move || {
                if let Some(inner) = weak.upgrade() {
                    let pool = ConnectionPool { inner };
                    pool.cleanup_idle_connections(
                        Utc::now().timestamp_millis(),
                    );
                }
            },
        );
        *self.inner.cleanup_timer.lock().unwrap() = Some((timer, guard));
    }
}

// Scan a snapshot for the connection with the fewest requests in flight.
// Ties go to the first one seen.
fn least_busy<C>(
    connections: &[Arc<Connection<C>>],
) -> Option<&Arc<Connection<C>>>
where
    C: Transport,
{
    let mut min_in_flight = usize::MAX;
    let mut m_least_busy = None;
    for connection in connections {
        let in_flight = connection.in_flight();
        if in_flight < min_in_flight {
            min_in_flight = in_flight;
            m_least_busy = Some(connection);
        }
    }
    m_least_busy
}

/// A borrowed connection. Derefs to the underlying [`Connection`] handle;
/// the stream reservation is returned to the pool when the guard drops.
pub struct BorrowedConnection<C, F>
where
    C: Transport,
    F: Fn(&Host) -> C + Send + Sync + 'static,
{
    pool: ConnectionPool<C, F>,
    connection: Option<Arc<Connection<C>>>,
}

impl<C, F> BorrowedConnection<C, F>
where
    C: Transport,
    F: Fn(&Host) -> C + Send + Sync + 'static,
{
    /// The pooled connection handle backing this borrow.
    pub fn connection(&self) -> &Arc<Connection<C>> {
        self.connection.as_ref().unwrap()
    }
}

impl<C, F> Debug for BorrowedConnection<C, F>
where
    C: Transport,
    F: Fn(&Host) -> C + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        f.debug_struct("BorrowedConnection")
            .field("host", &self.connection().host().name)
            .field("in_flight", &self.connection().in_flight())
            .finish()
    }
}

impl<C, F> Deref for BorrowedConnection<C, F>
where
    C: Transport,
    F: Fn(&Host) -> C + Send + Sync + 'static,
{
    type Target = Connection<C>;

    fn deref(&self) -> &Connection<C> {
        self.connection.as_ref().unwrap()
    }
}

impl<C, F> Drop for BorrowedConnection<C, F>
where
    C: Transport,
    F: Fn(&Host) -> C + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.return_connection(&connection);
        }
    }
}
