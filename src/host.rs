// Copyright 2020 Joyent, Inc.

use std::net::IpAddr;

use base64;
use sha1::Sha1;

use derive_more::{Display, From, Into};

/// A base64 encoded identifier derived from a host's address and port.
#[derive(
    Clone, Debug, Display, Eq, From, Hash, Into, Ord, PartialOrd, PartialEq,
)]
pub struct HostKey(String);
/// The native protocol port of a host. This is a type alias for u16.
pub type HostPort = u16;
/// The display form of a host. This is a type alias for String.
pub type HostName = String;
/// The IP address of a host. This is a type alias for std::net::IpAddr.
pub type HostAddress = IpAddr;

/// Classification of a host relative to the local application, used to
/// select the sizing parameters of its connection pool. An `Ignored` host
/// gets no pool at all.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum HostDistance {
    /// A host in the local datacenter.
    Local,
    /// A reachable host in a remote datacenter.
    Remote,
    /// A host the driver keeps no connections to.
    Ignored,
}

/// A type representing the different information about a database host.
#[derive(Clone, Debug)]
pub struct Host {
    /// The display form of the host, rendered as address:port.
    pub name: HostName,
    /// The address of the host.
    pub address: HostAddress,
    /// The native protocol port of the host.
    pub port: HostPort,
}

impl Host {
    /// Return a new instance of `Host` given a `HostAddress` and `HostPort`.
    pub fn new(address: &HostAddress, port: HostPort) -> Self {
        Host {
            name: format!("{}:{}", address, port),
            address: *address,
            port,
        }
    }

    /// A stable identifier for this host, fit for map keys and log fields.
    ///
    /// The key hashes a canonical `address/port` rendering rather than the
    /// display name, so cosmetic changes to `name` never change the key.
    pub fn key(&self) -> HostKey {
        let canonical = format!("{}/{}", self.address, self.port);
        let mut digest = Sha1::new();
        digest.update(canonical.as_bytes());
        base64::encode(&digest.digest().bytes()).into()
    }
}
