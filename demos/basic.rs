// Copyright 2020 Joyent, Inc.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use slog::{info, o, Drain, Logger};

use baize::connection_pool::types::{ConnectionPoolOptions, SizingOptions};
use baize::connection_pool::ConnectionPool;
use baize::error::Error;
use baize::host::{Host, HostDistance};
use baize::connection::Transport;

#[derive(Debug)]
pub struct DummyTransport {
    addr: SocketAddr,
    connected: AtomicBool,
    keyspace: Mutex<Option<String>>,
}

impl DummyTransport {
    fn new(host: &Host) -> Self {
        let addr = SocketAddr::from((host.address, host.port));

        DummyTransport {
            addr,
            connected: AtomicBool::new(false),
            keyspace: Mutex::new(None),
        }
    }
}

impl Transport for DummyTransport {
    type Error = Error;

    fn connect(&mut self) -> Result<(), Error> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) -> Result<(), Error> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn set_keyspace(&self, keyspace: &str) -> Result<(), Error> {
        *self.keyspace.lock().unwrap() = Some(String::from(keyspace));
        Ok(())
    }
}

fn main() {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    );

    info!(log, "running basic baize example");

    let host = Host::new(&IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 9042);
    let options = ConnectionPoolOptions {
        local: Some(SizingOptions {
            core_connections: 2,
            max_connections: 4,
            new_connection_threshold: 100,
        }),
        idle_timeout_seconds: Some(30),
        log: Some(log.clone()),
        ..Default::default()
    };

    let pool = ConnectionPool::new(
        options,
        host,
        HostDistance::Local,
        DummyTransport::new,
        None,
    );
    pool.init_future().wait().expect("pool initialization");
    pool.set_keyspace(Some(String::from("app")));

    // Hammer the pool from a handful of worker threads
    let mut workers = Vec::new();
    for worker in 0..8 {
        let pool = pool.clone();
        let log = log.clone();
        workers.push(thread::spawn(move || {
            for _ in 0..10 {
                match pool.borrow(Duration::from_secs(1)) {
                    Ok(connection) => {
                        info!(
                            log,
                            "worker {} borrowed a connection with {} in flight",
                            worker,
                            connection.in_flight()
                        );
                        thread::sleep(Duration::from_millis(5));
                    }
                    Err(e) => {
                        info!(log, "worker {} failed to borrow: {}", worker, e)
                    }
                }
            }
        }));
    }
    for worker in workers {
        let _ = worker.join();
    }

    pool.cleanup_idle_connections(Utc::now().timestamp_millis());
    info!(
        log,
        "pool has {} open and {} trashed connections",
        pool.opened(),
        pool.trashed()
    );

    let close = pool.close_async();
    close.wait();
    info!(log, "pool closed");
}
