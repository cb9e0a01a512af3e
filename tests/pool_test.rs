// Copyright 2020 Joyent, Inc.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::channel;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use slog::o;

use baize::connection::{Connection, Transport};
use baize::connection_pool::types::{ConnectionPoolOptions, SizingOptions};
use baize::connection_pool::ConnectionPool;
use baize::error::Error;
use baize::host::{Host, HostDistance};

#[derive(Debug)]
pub struct DummyTransport {
    addr: SocketAddr,
    connected: AtomicBool,
    closed: AtomicBool,
    keyspace: Mutex<Option<String>>,
    keyspace_switches: AtomicUsize,
    fail_connect: Arc<AtomicBool>,
}

impl DummyTransport {
    fn new(host: &Host, fail_connect: Arc<AtomicBool>) -> Self {
        let addr = SocketAddr::from((host.address, host.port));

        DummyTransport {
            addr,
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            keyspace: Mutex::new(None),
            keyspace_switches: AtomicUsize::new(0),
            fail_connect,
        }
    }

    fn current_keyspace(&self) -> Option<String> {
        self.keyspace.lock().unwrap().clone()
    }

    fn keyspace_switches(&self) -> usize {
        self.keyspace_switches.load(Ordering::SeqCst)
    }
}

impl Transport for DummyTransport {
    type Error = Error;

    fn connect(&mut self) -> Result<(), Error> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::ConnectionFailure(format!(
                "{}: connection refused",
                self.addr
            )));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) -> Result<(), Error> {
        self.connected.store(false, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn set_keyspace(&self, keyspace: &str) -> Result<(), Error> {
        *self.keyspace.lock().unwrap() = Some(String::from(keyspace));
        self.keyspace_switches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn dummy_transport(host: &Host) -> DummyTransport {
    DummyTransport::new(host, Arc::new(AtomicBool::new(false)))
}

fn test_host() -> Host {
    Host::new(&IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 9042)
}

fn sizing(core: u32, max: u32, threshold: u32) -> SizingOptions {
    SizingOptions {
        core_connections: core,
        max_connections: max,
        new_connection_threshold: threshold,
    }
}

fn pool_options(local: SizingOptions) -> ConnectionPoolOptions {
    ConnectionPoolOptions {
        local: Some(local),
        ..Default::default()
    }
}

// Poll until the predicate holds or the deadline passes.
fn wait_until<P: Fn() -> bool>(deadline: Duration, predicate: P) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    predicate()
}

#[test]
fn pool_initializes_core_connections() {
    let pool = ConnectionPool::new(
        pool_options(sizing(2, 8, 100)),
        test_host(),
        HostDistance::Local,
        dummy_transport,
        None,
    );

    assert_eq!(pool.init_future().wait(), Ok(()));
    assert_eq!(pool.opened(), 2);
    assert_eq!(pool.trashed(), 0);

    let stats = pool.get_stats();
    assert_eq!(stats.open_connections, 2.into());
    assert_eq!(stats.in_flight_requests, 0.into());
}

#[test]
fn borrow_and_return_accounting() {
    let pool = ConnectionPool::new(
        pool_options(sizing(2, 8, 100)),
        test_host(),
        HostDistance::Local,
        dummy_transport,
        None,
    );
    assert_eq!(pool.init_future().wait(), Ok(()));

    let borrowed = pool.borrow(Duration::from_secs(5)).unwrap();
    assert_eq!(borrowed.in_flight(), 1);
    assert_eq!(pool.get_stats().in_flight_requests, 1.into());

    let connection = Arc::clone(borrowed.connection());
    drop(borrowed);

    assert_eq!(connection.in_flight(), 0);
    assert_eq!(pool.get_stats().in_flight_requests, 0.into());
}

#[test]
fn borrow_prefers_the_least_busy_connection() {
    let pool = ConnectionPool::new(
        pool_options(sizing(2, 8, 100)),
        test_host(),
        HostDistance::Local,
        dummy_transport,
        None,
    );
    assert_eq!(pool.init_future().wait(), Ok(()));

    let first = pool.borrow(Duration::from_secs(5)).unwrap();
    let second = pool.borrow(Duration::from_secs(5)).unwrap();

    // With one request on the first connection, the second borrow must
    // land on the other one.
    assert!(!Arc::ptr_eq(first.connection(), second.connection()));
    assert_eq!(first.in_flight(), 1);
    assert_eq!(second.in_flight(), 1);
}

#[test]
fn borrow_times_out_when_saturated() {
    let options = ConnectionPoolOptions {
        local: Some(sizing(1, 1, 100)),
        max_streams_per_connection: Some(2),
        ..Default::default()
    };
    let pool = ConnectionPool::new(
        options,
        test_host(),
        HostDistance::Local,
        dummy_transport,
        None,
    );
    assert_eq!(pool.init_future().wait(), Ok(()));

    let _first = pool.borrow(Duration::from_secs(5)).unwrap();
    let _second = pool.borrow(Duration::from_secs(5)).unwrap();

    // A zero deadline fails without parking at all
    assert_eq!(
        pool.borrow(Duration::from_secs(0)).unwrap_err(),
        Error::Timeout
    );

    let start = Instant::now();
    let result = pool.borrow(Duration::from_millis(300));
    assert_eq!(result.unwrap_err(), Error::Timeout);
    assert!(start.elapsed() >= Duration::from_millis(250));
}

#[test]
fn return_signals_a_waiting_borrower() {
    let pool = ConnectionPool::new(
        pool_options(sizing(1, 1, 100)),
        test_host(),
        HostDistance::Local,
        dummy_transport,
        None,
    );
    assert_eq!(pool.init_future().wait(), Ok(()));

    let mut borrowed = Vec::new();
    for _ in 0..128 {
        borrowed.push(pool.borrow(Duration::from_secs(5)).unwrap());
    }

    let (result_tx, result_rx) = channel();
    let pool_clone = pool.clone();
    let waiter = thread::spawn(move || {
        let result = pool_clone.borrow(Duration::from_secs(5));
        result_tx.send(result.map(|_| ())).unwrap();
    });

    // Give the waiter time to park before freeing a slot
    thread::sleep(Duration::from_millis(100));
    let _ = borrowed.pop();

    assert_eq!(result_rx.recv().unwrap(), Ok(()));
    waiter.join().unwrap();
}

#[test]
fn borrow_after_close_fails() {
    let pool = ConnectionPool::new(
        pool_options(sizing(2, 8, 100)),
        test_host(),
        HostDistance::Local,
        dummy_transport,
        None,
    );
    assert_eq!(pool.init_future().wait(), Ok(()));

    let close = pool.close_async();
    assert!(close.wait_timeout(Duration::from_secs(5)));
    assert_eq!(
        pool.borrow(Duration::from_secs(1)).unwrap_err(),
        Error::PoolClosed
    );
    assert_eq!(pool.opened(), 0);
}

#[test]
fn close_is_idempotent_and_shared() {
    let pool = ConnectionPool::new(
        pool_options(sizing(2, 8, 100)),
        test_host(),
        HostDistance::Local,
        dummy_transport,
        None,
    );
    assert_eq!(pool.init_future().wait(), Ok(()));

    let first = pool.close_async();
    let second = pool.close_async();
    assert!(first.ptr_eq(&second));
    assert!(first.wait_timeout(Duration::from_secs(5)));
    assert!(pool.is_closed());
}

#[test]
fn shutdown_wakes_parked_borrowers() {
    let options = ConnectionPoolOptions {
        local: Some(sizing(1, 1, 100)),
        max_streams_per_connection: Some(2),
        ..Default::default()
    };
    let pool = ConnectionPool::new(
        options,
        test_host(),
        HostDistance::Local,
        dummy_transport,
        None,
    );
    assert_eq!(pool.init_future().wait(), Ok(()));

    let _first = pool.borrow(Duration::from_secs(5)).unwrap();
    let _second = pool.borrow(Duration::from_secs(5)).unwrap();

    let mut waiters = Vec::new();
    for _ in 0..3 {
        let pool_clone = pool.clone();
        waiters.push(thread::spawn(move || {
            pool_clone.borrow(Duration::from_secs(10)).map(|_| ())
        }));
    }

    // Give the waiters time to park
    thread::sleep(Duration::from_millis(200));

    let close = pool.close_async();
    for waiter in waiters {
        assert_eq!(waiter.join().unwrap().unwrap_err(), Error::PoolClosed);
    }
    assert!(close.wait_timeout(Duration::from_secs(5)));
}

#[test]
fn preexisting_connection_fills_a_core_slot() {
    let host = test_host();
    let log = slog::Logger::root(slog::Discard, o!());
    let preexisting = Connection::new(
        host.clone(),
        dummy_transport(&host),
        128,
        log.clone(),
    );

    let pool = ConnectionPool::new(
        pool_options(sizing(1, 2, 100)),
        host.clone(),
        HostDistance::Local,
        dummy_transport,
        Some(Arc::clone(&preexisting)),
    );
    assert_eq!(pool.init_future().wait(), Ok(()));
    assert_eq!(pool.opened(), 1);

    let borrowed = pool.borrow(Duration::from_secs(5)).unwrap();
    assert!(Arc::ptr_eq(borrowed.connection(), &preexisting));
    drop(borrowed);

    // The connection now belongs to the first pool, so a second pool must
    // ignore it and open a fresh one.
    let other_pool = ConnectionPool::new(
        pool_options(sizing(1, 2, 100)),
        host,
        HostDistance::Local,
        dummy_transport,
        Some(Arc::clone(&preexisting)),
    );
    assert_eq!(other_pool.init_future().wait(), Ok(()));
    let other_borrowed = other_pool.borrow(Duration::from_secs(5)).unwrap();
    assert!(!Arc::ptr_eq(other_borrowed.connection(), &preexisting));
}

#[test]
fn keyspace_is_propagated_to_borrowed_connections() {
    let pool = ConnectionPool::new(
        pool_options(sizing(1, 2, 100)),
        test_host(),
        HostDistance::Local,
        dummy_transport,
        None,
    );
    assert_eq!(pool.init_future().wait(), Ok(()));

    pool.set_keyspace(Some(String::from("app")));

    let borrowed = pool.borrow(Duration::from_secs(5)).unwrap();
    assert_eq!(borrowed.current_keyspace(), Some(String::from("app")));
    assert_eq!(borrowed.keyspace_switches(), 1);
    drop(borrowed);

    // Switching is skipped when the connection is already there
    let borrowed = pool.borrow(Duration::from_secs(5)).unwrap();
    assert_eq!(borrowed.keyspace_switches(), 1);
}

#[test]
fn failed_initialization_reports_and_recovers() {
    let fail_connect = Arc::new(AtomicBool::new(true));
    let fail_connect_clone = Arc::clone(&fail_connect);
    let create = move |host: &Host| {
        DummyTransport::new(host, Arc::clone(&fail_connect_clone))
    };

    let options = ConnectionPoolOptions {
        local: Some(sizing(2, 8, 100)),
        connect_timeout_millis: Some(50),
        ..Default::default()
    };
    let pool = ConnectionPool::new(
        options,
        test_host(),
        HostDistance::Local,
        create,
        None,
    );

    match pool.init_future().wait() {
        Err(Error::ConnectionFailure(_)) => (),
        other => panic!("unexpected init outcome: {:?}", other),
    }
    assert_eq!(pool.opened(), 0);

    // Once the host accepts connections again a borrow finds an empty pool,
    // resubmits the core create tasks, and parks until one lands.
    fail_connect.store(false, Ordering::SeqCst);
    let borrowed = pool.borrow(Duration::from_secs(5)).unwrap();
    assert_eq!(borrowed.in_flight(), 1);
}

#[test]
fn ensure_core_connections_tops_up() {
    let fail_connect = Arc::new(AtomicBool::new(true));
    let fail_connect_clone = Arc::clone(&fail_connect);
    let create = move |host: &Host| {
        DummyTransport::new(host, Arc::clone(&fail_connect_clone))
    };

    let options = ConnectionPoolOptions {
        local: Some(sizing(2, 8, 100)),
        connect_timeout_millis: Some(50),
        ..Default::default()
    };
    let pool = ConnectionPool::new(
        options,
        test_host(),
        HostDistance::Local,
        create,
        None,
    );
    assert!(pool.init_future().wait().is_err());
    assert_eq!(pool.opened(), 0);

    fail_connect.store(false, Ordering::SeqCst);
    pool.ensure_core_connections();

    assert!(wait_until(Duration::from_secs(5), || pool.opened() == 2));
}

#[test]
fn concurrent_borrowers_balance_and_drain() {
    let pool = ConnectionPool::new(
        pool_options(sizing(2, 4, 100)),
        test_host(),
        HostDistance::Local,
        dummy_transport,
        None,
    );
    assert_eq!(pool.init_future().wait(), Ok(()));

    let mut borrowers = Vec::new();
    for _ in 0..4 {
        let pool_clone = pool.clone();
        borrowers.push(thread::spawn(move || {
            for _ in 0..100 {
                let borrowed =
                    pool_clone.borrow(Duration::from_secs(2)).unwrap();
                assert!(borrowed.in_flight() >= 1);
                drop(borrowed);
            }
        }));
    }

    let cleaner_pool = pool.clone();
    let cleaner = thread::spawn(move || {
        for _ in 0..20 {
            cleaner_pool.cleanup_idle_connections(
                chrono::Utc::now().timestamp_millis(),
            );
            thread::sleep(Duration::from_millis(10));
        }
    });

    for borrower in borrowers {
        borrower.join().unwrap();
    }
    cleaner.join().unwrap();

    assert_eq!(pool.get_stats().in_flight_requests, 0.into());
    let opened = pool.opened();
    assert!(opened >= 2 && opened <= 4, "opened = {}", opened);

    let close = pool.close_async();
    assert!(close.wait_timeout(Duration::from_secs(5)));
}
