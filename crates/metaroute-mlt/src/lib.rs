//! metaroute MLT - partition directory
//!
//! The metadata lookup table maps every subtree of the namespace to the
//! metadata server that currently owns it. This crate provides:
//!
//! - [`ServerRegistry`]: slot based list of known servers
//! - [`RoutingTable`]: arena of partition entries with longest prefix
//!   resolution
//! - [`codec`]: checksummed on-disk format
//! - [`MltHandler`]: the locked, process wide access point

pub mod codec;
pub mod handler;
pub mod path;
pub mod registry;
pub mod table;

pub use handler::MltHandler;
pub use registry::ServerRegistry;
pub use table::{AddOutcome, PartitionEntry, PathResolution, RoutingTable};
