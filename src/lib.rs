// Copyright 2020 Joyent, Inc.

//! A per-host connection pool for multiplexed database drivers
//!
//! Baize manages the cloth the game is played on: for each reachable host
//! of a distributed database it keeps a small, elastic set of long-lived
//! connections, each of which carries many concurrent requests identified
//! by stream IDs. The request-dispatch layer above it sees a single
//! contract: [`borrow`](connection_pool/struct.ConnectionPool.html#method.borrow)
//! a connection, issue the request on it, and let the returned guard drop.
//!
//! ## Transports
//!
//! In baize, a *transport* is not necessarily just a TCP socket. It is
//! whatever carries multiplexed requests to one host, as long as it obeys
//! the [`Transport`](connection/trait.Transport.html) trait: it can
//! `connect`, it can `close`, and it can switch the logical namespace its
//! requests run in. The wire protocol, stream-ID bookkeeping, and request
//! dispatch all live in the transport; the pool never looks inside it.
//!
//! Baize users provide the pool with a function to create a transport for
//! the pooled host. The trait bounds established by the pool for this
//! function are as follows:
//! ```rust,ignore
//! Fn(&Host) -> C + Send + Sync + 'static
//! where C: Transport
//! ```
//! Create tasks run on their own threads, so unlike a single-consumer
//! factory the function must be shareable.
//!
//! ## Borrowing
//!
//! A borrow scans a snapshot of the live connections and reserves a stream
//! slot on the least busy one with a compare-and-swap; no lock is taken on
//! the hot path. When every connection is saturated the borrowing thread
//! parks on a single condition variable until a slot frees up or its
//! deadline passes. Waiters are deliberately not queued fairly: whoever
//! wins the next compare-and-swap gets the slot.
//!
//! ## Elasticity
//!
//! The pool holds between `core` and `max` connections per host, chosen by
//! the host's [`HostDistance`](host/enum.HostDistance.html). It grows when
//! the first n-1 connections are full and the last one is nearing its
//! configured threshold, one creation at a time. A periodic cleanup tick
//! compares the high-water in-flight load against capacity and retires
//! connections the load no longer justifies. Retired connections sit in a
//! trash from which a later growth spurt can resurrect them, until an idle
//! timeout expires and they are closed for good.
//!
//! Connections whose transport fails are replaced immediately, and
//! connections that bleed too many stream IDs (a request that times out
//! may never release its ID) are swapped for fresh ones when returned.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::net::{IpAddr, Ipv4Addr};
//! use std::time::Duration;
//!
//! use baize::connection_pool::types::ConnectionPoolOptions;
//! use baize::connection_pool::ConnectionPool;
//! use baize::host::{Host, HostDistance};
//!
//! let host = Host::new(&IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 9042);
//!
//! let pool = ConnectionPool::new(
//!     ConnectionPoolOptions::default(),
//!     host,
//!     HostDistance::Local,
//!     MyTransport::new,
//!     None,
//! );
//! pool.init_future().wait()?;
//!
//! let conn = pool.borrow(Duration::from_secs(5))?;
//! // Issue requests on the transport via the connection handle.
//! // The stream reservation is returned when `conn` drops.
//! ```

#![allow(missing_docs)]

pub mod connection;
pub mod connection_pool;
pub mod error;
pub mod host;
