//! metaroute Common - Shared types and utilities
//!
//! This crate provides the server and inode identifiers, the unified error
//! type and the node configuration used by every metaroute component.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;
