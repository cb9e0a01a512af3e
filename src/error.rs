// Copyright 2020 Joyent, Inc.

use std::error;
use std::fmt;

/// Errors surfaced by a baize connection pool.
///
/// The enum is `Clone` so a single failure can be broadcast to every caller
/// waiting on the pool's initialization future.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Error {
    /// The pool is shutting down or already shut. Callers should treat the
    /// host as unavailable and move on to another one.
    PoolClosed,
    /// No stream slot became available before the borrow deadline elapsed.
    Timeout,
    /// A connection to the host could not be established. Carries the text
    /// of the underlying transport error.
    ConnectionFailure(String),
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::PoolClosed => "connection pool is shut down".fmt(fmt),
            Error::Timeout => {
                "timed out waiting for an available connection".fmt(fmt)
            }
            Error::ConnectionFailure(err_str) => err_str.fmt(fmt),
        }
    }
}

impl error::Error for Error {}
