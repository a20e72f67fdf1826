//! Core type definitions for metaroute
//!
//! Server identities, partition keys and the well-known paths and ports
//! shared by the daemon and the administration tool.

use crate::error::{Error, Result};
use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Inode number of the filesystem root; the root partition is keyed by it.
pub const FS_ROOT_INODE_NUMBER: InodeNumber = InodeNumber(1);

/// Path of the filesystem root partition.
pub const ROOT_PATH: &str = "/";

/// Canonical on-disk location of the routing table.
pub const DEFAULT_MLT_PATH: &str = "/etc/mlt";

/// Drop point watched by the replication daemon.
pub const DEFAULT_STAGING_PATH: &str = "/tmp/temp_mlt";

/// Drop point used when a pushed table arrives from a peer.
pub const DEFAULT_RECEIVE_STAGING_PATH: &str = "/tmp/temp_mlt2";

/// Port dialled on peers when addresses carry no explicit port.
pub const DEFAULT_PEER_PORT: u16 = 49152;

/// Initial number of slots in a fresh server registry.
pub const DEFAULT_SERVER_CAPACITY: usize = 4;

/// Identifier of a partition root (and of any filesystem object)
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into,
)]
#[display("{_0}")]
pub struct InodeNumber(u64);

impl InodeNumber {
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Opaque export (tenant) identifier attached to a partition
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into,
)]
#[display("{_0}")]
pub struct ExportId(u32);

impl ExportId {
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

/// A metadata server, identified by the `(address, port)` pair
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Server {
    pub address: String,
    pub port: u16,
}

impl Server {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// Parse the `ip:port` notation used by the administration tool.
    pub fn parse(s: &str) -> Result<Self> {
        let (address, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidAddress(format!("{s}: expected ip:port")))?;
        if address.is_empty() {
            return Err(Error::InvalidAddress(format!("{s}: empty address")));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| Error::InvalidAddress(format!("{s}: bad port: {e}")))?;
        Ok(Self::new(address, port))
    }

    /// True when both servers run on the same host, regardless of port.
    #[must_use]
    pub fn same_host(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Server({}:{})", self.address, self.port)
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

impl std::str::FromStr for Server {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_parse() {
        let server = Server::parse("10.0.0.1:1337").unwrap();
        assert_eq!(server.address, "10.0.0.1");
        assert_eq!(server.port, 1337);
        assert_eq!(server.to_string(), "10.0.0.1:1337");
    }

    #[test]
    fn test_server_parse_rejects_garbage() {
        assert!(Server::parse("10.0.0.1").is_err());
        assert!(Server::parse(":80").is_err());
        assert!(Server::parse("10.0.0.1:port").is_err());
        assert!(Server::parse("10.0.0.1:70000").is_err());
    }

    #[test]
    fn test_server_same_host() {
        let a = Server::new("10.0.0.1", 1);
        let b = Server::new("10.0.0.1", 2);
        let c = Server::new("10.0.0.2", 1);
        assert!(a.same_host(&b));
        assert!(!a.same_host(&c));
        assert_ne!(a, b);
    }

    #[test]
    fn test_inode_number_display() {
        assert_eq!(FS_ROOT_INODE_NUMBER.get(), 1);
        assert_eq!(InodeNumber::from(42).to_string(), "42");
    }
}
