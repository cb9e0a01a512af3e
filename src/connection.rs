// Copyright 2020 Joyent, Inc.

use std::error;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use slog::{warn, Logger};

use crate::host::Host;

/// The transport contract a connection must satisfy to participate in a
/// baize pool.
///
/// A transport is not necessarily a raw TCP socket; it is whatever carries
/// multiplexed requests to one host, as long as it obeys this interface.
/// `connect` is invoked exactly once, while the pool still has exclusive
/// ownership of the transport. `close` and `set_keyspace` may be invoked
/// while other threads are using the transport concurrently, so
/// implementations are expected to rely on interior mutability for them
/// (in the same way `TcpStream::shutdown` takes `&self`).
pub trait Transport: Send + Sync + Sized + 'static {
    /// The error type returned by the transport operations. This is an
    /// associated type for the trait meaning each specific implementation
    /// of the `Transport` trait may choose the appropriate concrete error
    /// type to return. The only constraint applied is that the selected
    /// error type must implement the
    /// [Error](https://doc.rust-lang.org/std/error/trait.Error.html) trait
    /// from the standard library.
    type Error: error::Error;
    /// Attempt to establish the transport to the host it was created for.
    fn connect(&mut self) -> Result<(), Self::Error>;
    /// Tear the transport down. Outstanding requests fail when this runs.
    fn close(&self) -> Result<(), Self::Error>;
    /// Switch the logical namespace used by requests on this transport.
    fn set_keyspace(&self, keyspace: &str) -> Result<(), Self::Error>;
}

/// Life-cycle state of a pooled connection. `Gone` is terminal; every
/// transition is performed with a compare-and-swap through [`StateCell`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    /// Serving requests and counted toward the pool size.
    Open,
    /// Temporarily retired; eligible for resurrection until its idle
    /// deadline passes.
    Trashed,
    /// Claimed from the trash by a create task, about to become open again.
    Resurrecting,
    /// Removed for good. A gone connection is never seen by a borrow.
    Gone,
}

impl ConnectionState {
    fn from_u8(value: u8) -> ConnectionState {
        match value {
            0 => ConnectionState::Open,
            1 => ConnectionState::Trashed,
            2 => ConnectionState::Resurrecting,
            _ => ConnectionState::Gone,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Open => 0,
            ConnectionState::Trashed => 1,
            ConnectionState::Resurrecting => 2,
            ConnectionState::Gone => 3,
        }
    }
}

/// An atomically updated [`ConnectionState`].
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: ConnectionState) -> Self {
        StateCell(AtomicU8::new(state.as_u8()))
    }

    /// Read the current state.
    pub fn load(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Unconditionally store a state. Reserved for owners reverting a
    /// transition they just won.
    pub fn store(&self, state: ConnectionState) {
        self.0.store(state.as_u8(), Ordering::SeqCst)
    }

    /// CAS `from` to `to`, returning whether this caller performed the
    /// transition.
    pub fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.0
            .compare_exchange(
                from.as_u8(),
                to.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }
}

/// A one-shot future completed when a close has finished. Completion and
/// waiting ride a mutex and condition variable pair; clones share the same
/// underlying completion.
#[derive(Clone, Debug)]
pub struct CloseFuture(Arc<(Mutex<bool>, Condvar)>);

impl CloseFuture {
    pub(crate) fn new() -> Self {
        CloseFuture(Arc::new((Mutex::new(false), Condvar::new())))
    }

    pub(crate) fn complete(&self) {
        let (lock, condvar) = &*self.0;
        let mut done = lock.lock().unwrap();
        *done = true;
        condvar.notify_all();
    }

    /// Whether the close has already finished.
    pub fn is_complete(&self) -> bool {
        *(self.0).0.lock().unwrap()
    }

    /// Block until the close finishes.
    pub fn wait(&self) {
        let (lock, condvar) = &*self.0;
        let mut done = lock.lock().unwrap();
        while !*done {
            done = condvar.wait(done).unwrap();
        }
    }

    /// Block until the close finishes or the timeout elapses. Returns
    /// whether the close finished.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, condvar) = &*self.0;
        let deadline = Instant::now() + timeout;
        let mut done = lock.lock().unwrap();
        while !*done {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = condvar.wait_timeout(done, deadline - now).unwrap();
            done = guard;
        }
        true
    }

    /// Whether two handles refer to the same underlying close.
    pub fn ptr_eq(&self, other: &CloseFuture) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// A pooled connection: the pool-facing handle around a user transport.
///
/// The pool only manipulates the handle's atomic bookkeeping. The stream
/// accounting (`available_streams`, the defunct flag) is owned by the
/// transport layer, which reports through [`Connection::note_leaked_stream`]
/// and [`Connection::mark_defunct`].
pub struct Connection<C: Transport> {
    host: Host,
    transport: Arc<C>,
    state: StateCell,
    in_flight: AtomicUsize,
    available_streams: AtomicUsize,
    max_idle_time: AtomicI64,
    defunct: AtomicBool,
    attached: AtomicBool,
    keyspace: Mutex<Option<String>>,
    close_future: Mutex<Option<CloseFuture>>,
    log: Logger,
}

impl<C: Transport> Connection<C> {
    /// Wrap a connected transport into a pooled connection handle. The
    /// handle starts in the `Open` state, unattached, with the full
    /// stream-ID budget available.
    pub fn new(
        host: Host,
        transport: C,
        max_streams: usize,
        log: Logger,
    ) -> Arc<Connection<C>> {
        Arc::new(Connection {
            host,
            transport: Arc::new(transport),
            state: StateCell::new(ConnectionState::Open),
            in_flight: AtomicUsize::new(0),
            available_streams: AtomicUsize::new(max_streams),
            max_idle_time: AtomicI64::new(0),
            defunct: AtomicBool::new(false),
            attached: AtomicBool::new(false),
            keyspace: Mutex::new(None),
            close_future: Mutex::new(None),
            log,
        })
    }

    /// The host this connection serves.
    pub fn host(&self) -> &Host {
        &self.host
    }

    /// The connection's life-cycle state cell.
    pub fn state(&self) -> &StateCell {
        &self.state
    }

    /// The number of requests currently in flight on this connection.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// The remaining stream-ID budget.
    pub fn available_streams(&self) -> usize {
        self.available_streams.load(Ordering::SeqCst)
    }

    /// Reserve a stream slot: CAS-increment `in_flight` unless the
    /// connection is already at its available-stream ceiling. Returns
    /// whether a slot was reserved.
    pub fn try_reserve_stream(&self) -> bool {
        loop {
            let in_flight = self.in_flight.load(Ordering::SeqCst);
            if in_flight >= self.available_streams.load(Ordering::SeqCst) {
                return false;
            }
            if self
                .in_flight
                .compare_exchange(
                    in_flight,
                    in_flight + 1,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Release a stream slot reserved with `try_reserve_stream`.
    pub(crate) fn release_stream(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// Record a stream ID that was never released, typically because the
    /// request holding it timed out. Called by the transport layer.
    pub fn note_leaked_stream(&self) {
        loop {
            let available = self.available_streams.load(Ordering::SeqCst);
            if available == 0 {
                return;
            }
            if self
                .available_streams
                .compare_exchange(
                    available,
                    available - 1,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                return;
            }
        }
    }

    /// Whether the transport has become permanently unusable.
    pub fn is_defunct(&self) -> bool {
        self.defunct.load(Ordering::SeqCst)
    }

    /// Flag the transport as permanently unusable. Called by the transport
    /// layer before it asks the pool for a replacement.
    pub fn mark_defunct(&self) {
        self.defunct.store(true, Ordering::SeqCst);
    }

    pub(crate) fn max_idle_time(&self) -> i64 {
        self.max_idle_time.load(Ordering::SeqCst)
    }

    pub(crate) fn set_max_idle_time(&self, millis: i64) {
        self.max_idle_time.store(millis, Ordering::SeqCst);
    }

    /// Attach this connection to a pool. Returns false when the connection
    /// already belongs to one, in which case the caller must leave it alone.
    pub fn attach(&self) -> bool {
        !self.attached.swap(true, Ordering::SeqCst)
    }

    /// Switch the transport to `keyspace` unless it is already there.
    pub(crate) fn ensure_keyspace(&self, keyspace: &str) {
        let mut current = self.keyspace.lock().unwrap();
        if current.as_ref().map(String::as_str) == Some(keyspace) {
            return;
        }
        match self.transport.set_keyspace(keyspace) {
            Ok(()) => *current = Some(String::from(keyspace)),
            Err(e) => warn!(
                self.log,
                "failed to set keyspace {} on connection to {}: {}",
                keyspace,
                self.host.name,
                e
            ),
        }
    }

    /// Close the transport on a separate thread and return a future
    /// completed when the close has finished. Repeat calls return the same
    /// future.
    pub fn close_async(&self) -> CloseFuture {
        let mut m_future = self.close_future.lock().unwrap();
        if let Some(future) = &*m_future {
            return future.clone();
        }
        let future = CloseFuture::new();
        *m_future = Some(future.clone());
        drop(m_future);

        let transport = Arc::clone(&self.transport);
        let log = self.log.clone();
        let host_name = self.host.name.clone();
        let close_done = future.clone();
        // Do not block the caller on external code; the close runs on its
        // own thread.
        thread::spawn(move || {
            if let Err(e) = transport.close() {
                warn!(
                    log,
                    "failed to close connection to {}: {}", host_name, e
                );
            }
            close_done.complete();
        });
        future
    }

    /// Whether a close has been initiated on this connection.
    pub fn is_closed(&self) -> bool {
        self.close_future.lock().unwrap().is_some()
    }
}

impl<C: Transport> Deref for Connection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.transport
    }
}
