//! metaroute Admin - routing table replication
//!
//! The administration tool stages a new table on disk; the
//! [`ReplicationDaemon`] of the local server picks it up, loads it and
//! pushes the raw bytes to every other server, whose daemons load and
//! persist it in turn.

pub mod daemon;
pub mod export;
pub mod staging;

pub use daemon::{BroadcastReport, ReplicationDaemon, UpdateStatus};
pub use export::{ConfigRegenerator, ExportConfigWriter, MigrationState};
pub use staging::{stage_update, wait_for_pickup};
