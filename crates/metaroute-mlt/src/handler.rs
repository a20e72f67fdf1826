//! Directory handle
//!
//! `MltHandler` owns the lifetime of the routing table of this process.
//! Every operation takes one exclusive lock for its whole duration, so
//! readers and writers are serialized and a reload (destroy then read) is
//! never observed half way.

use crate::codec;
use crate::table::{AddOutcome, PartitionEntry, PathResolution, RoutingTable};
use metaroute_common::{Error, ExportId, InodeNumber, Result, Server};
use parking_lot::Mutex;
use std::path::Path;
use tracing::{info, warn};

#[derive(Default)]
struct HandlerState {
    table: Option<RoutingTable>,
    my_address: Option<Server>,
}

impl HandlerState {
    fn table(&self) -> Result<&RoutingTable> {
        self.table.as_ref().ok_or(Error::Uninitialized)
    }

    fn table_mut(&mut self) -> Result<&mut RoutingTable> {
        self.table.as_mut().ok_or(Error::Uninitialized)
    }

    fn entry(&self, root_inode: InodeNumber) -> Result<&PartitionEntry> {
        self.table()?
            .entry(root_inode)
            .ok_or(Error::PartitionNotFound(root_inode))
    }

    fn my_address(&self) -> Result<&Server> {
        self.my_address
            .as_ref()
            .ok_or_else(|| Error::InvalidOperation("own address is not set".to_string()))
    }
}

/// Process wide access point to the routing table
///
/// Construct one per process and share it with `Arc`.
#[derive(Default)]
pub struct MltHandler {
    state: Mutex<HandlerState>,
}

impl MltHandler {
    /// Create a handler without a table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True when a table is loaded
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.state.lock().table.is_some()
    }

    /// Create a new table whose root partition is owned by `server`.
    pub fn init_new_mlt(
        &self,
        server: Server,
        export_id: ExportId,
        root_inode: InodeNumber,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.table.is_some() {
            return Err(Error::AlreadyInitialized);
        }
        info!("Initializing routing table, root partition on {}", server);
        state.table = Some(RoutingTable::new(server, export_id, root_inode)?);
        Ok(())
    }

    /// Load a table from disk. Fails if a table is already loaded.
    pub fn read_from_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut state = self.state.lock();
        if state.table.is_some() {
            return Err(Error::AlreadyInitialized);
        }
        state.table = Some(codec::read_file(path)?);
        Ok(())
    }

    /// Replace the current table (if any) with the one stored at `path`.
    ///
    /// On failure no table is left loaded.
    pub fn reload_mlt(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut state = self.state.lock();
        state.table = None;
        match codec::read_file(path) {
            Ok(table) => {
                info!(
                    "Reloaded routing table from {} ({} partitions)",
                    path.display(),
                    table.len()
                );
                state.table = Some(table);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to reload routing table from {}: {}", path.display(), e);
                Err(e)
            }
        }
    }

    /// Persist the current table.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let state = self.state.lock();
        codec::write_file(state.table()?, path)
    }

    /// Drop the current table.
    pub fn destroy_mlt(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.table.take().map(|_| ()).ok_or(Error::Uninitialized)
    }

    pub fn add_server(&self, server: Server) -> Result<()> {
        let mut state = self.state.lock();
        state.table_mut()?.add_server(server).map(|_| ())
    }

    pub fn remove_server(&self, server: &Server) -> Result<()> {
        let mut state = self.state.lock();
        state.table_mut()?.remove_server(server)
    }

    /// Resolve `path` to the partition containing it.
    pub fn path_to_root(&self, path: &str) -> Result<PathResolution> {
        let state = self.state.lock();
        state.table()?.resolve(path)
    }

    /// Resolve `path` and snapshot the owning entry under one lock, so a
    /// concurrent reload cannot separate the two.
    pub fn resolve_entry(&self, path: &str) -> Result<(PathResolution, PartitionEntry)> {
        let state = self.state.lock();
        let resolution = state.table()?.resolve(path)?;
        let entry = state.entry(resolution.root_inode)?.clone();
        Ok((resolution, entry))
    }

    /// Add a partition, or re-assign it when `root_inode` is already known.
    pub fn add_new_entry(
        &self,
        server: &Server,
        export_id: ExportId,
        root_inode: InodeNumber,
        path: &str,
    ) -> Result<AddOutcome> {
        let mut state = self.state.lock();
        let outcome = state
            .table_mut()?
            .add_entry(server, export_id, root_inode, path)?;
        info!("Partition {} at {} -> {} ({:?})", root_inode, path, server, outcome);
        Ok(outcome)
    }

    pub fn remove_entry(&self, root_inode: InodeNumber) -> Result<()> {
        let mut state = self.state.lock();
        let removed = state.table_mut()?.remove_entry(root_inode)?;
        info!("Removed partition {} at {}", root_inode, removed.path);
        Ok(())
    }

    /// Hand a partition to `server`; returns the new version. An
    /// unregistered `server` is reported as a fatal error.
    pub fn update_entry(&self, root_inode: InodeNumber, server: &Server) -> Result<u64> {
        let mut state = self.state.lock();
        state.table_mut()?.update_entry(root_inode, server)
    }

    /// All registered servers in registry order
    pub fn get_server_list(&self) -> Result<Vec<Server>> {
        let state = self.state.lock();
        Ok(state.table()?.registry().servers().cloned().collect())
    }

    /// Registered servers on other hosts. Servers sharing this node's
    /// address count as this node whatever their port.
    pub fn get_other_servers(&self) -> Result<Vec<Server>> {
        let state = self.state.lock();
        let table = state.table()?;
        Ok(table
            .registry()
            .servers()
            .filter(|s| state.my_address.as_ref().is_none_or(|me| !s.same_host(me)))
            .cloned()
            .collect())
    }

    /// Position of the first server on this node's host in registry order.
    /// Equals the number of servers when the host is not registered.
    pub fn get_my_rank(&self) -> Result<usize> {
        let state = self.state.lock();
        let me = state.my_address()?;
        Ok(state
            .table()?
            .registry()
            .servers()
            .take_while(|s| !s.same_host(me))
            .count())
    }

    /// Root inodes of the partitions owned by this node, in insertion order
    pub fn get_my_partitions(&self) -> Result<Vec<InodeNumber>> {
        let state = self.state.lock();
        let me = state.my_address()?;
        Ok(state
            .table()?
            .entries()
            .into_iter()
            .filter(|e| &e.owner == me)
            .map(|e| e.root_inode)
            .collect())
    }

    pub fn is_partition_root(&self, root_inode: InodeNumber) -> Result<bool> {
        let state = self.state.lock();
        Ok(state.table()?.entry(root_inode).is_some())
    }

    /// Parent partition of `root_inode`. Asking for the parent of the root
    /// is an invalid operation.
    pub fn get_parent(&self, root_inode: InodeNumber) -> Result<InodeNumber> {
        let state = self.state.lock();
        state.entry(root_inode)?.parent.ok_or_else(|| {
            Error::InvalidOperation(format!("partition {root_inode} is the root and has no parent"))
        })
    }

    /// Child partitions of `root_inode` in insertion order
    pub fn get_children(&self, root_inode: InodeNumber) -> Result<Vec<InodeNumber>> {
        let state = self.state.lock();
        state
            .table()?
            .children(root_inode)
            .map(<[InodeNumber]>::to_vec)
            .ok_or(Error::PartitionNotFound(root_inode))
    }

    pub fn get_path(&self, root_inode: InodeNumber) -> Result<String> {
        let state = self.state.lock();
        Ok(state.entry(root_inode)?.path.clone())
    }

    pub fn get_version(&self, root_inode: InodeNumber) -> Result<u64> {
        let state = self.state.lock();
        Ok(state.entry(root_inode)?.version)
    }

    pub fn get_export_id(&self, root_inode: InodeNumber) -> Result<ExportId> {
        let state = self.state.lock();
        Ok(state.entry(root_inode)?.export_id)
    }

    /// Server owning the partition
    pub fn get_mds(&self, root_inode: InodeNumber) -> Result<Server> {
        let state = self.state.lock();
        Ok(state.entry(root_inode)?.owner.clone())
    }

    /// Snapshot of a single entry
    pub fn get_entry(&self, root_inode: InodeNumber) -> Result<PartitionEntry> {
        let state = self.state.lock();
        state.entry(root_inode).cloned()
    }

    /// Snapshot of every entry in insertion order
    pub fn entries(&self) -> Result<Vec<PartitionEntry>> {
        let state = self.state.lock();
        Ok(state.table()?.entries().into_iter().cloned().collect())
    }

    /// Record this node's identity. Requires a loaded table.
    pub fn set_my_address(&self, server: Server) -> Result<()> {
        let mut state = self.state.lock();
        state.table()?;
        state.my_address = Some(server);
        Ok(())
    }

    pub fn get_my_address(&self) -> Result<Server> {
        let state = self.state.lock();
        state.table()?;
        state.my_address().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn server(host: u8, port: u16) -> Server {
        Server::new(format!("10.0.0.{host}"), port)
    }

    fn inode(n: u64) -> InodeNumber {
        InodeNumber::new(n)
    }

    fn handler() -> MltHandler {
        let handler = MltHandler::new();
        handler
            .init_new_mlt(server(1, 1337), ExportId::new(1), inode(1))
            .unwrap();
        handler
    }

    #[test]
    fn test_lifecycle() {
        let handler = MltHandler::new();
        assert!(!handler.is_initialized());
        assert!(matches!(handler.get_server_list(), Err(Error::Uninitialized)));

        handler
            .init_new_mlt(server(1, 1337), ExportId::new(1), inode(1))
            .unwrap();
        assert!(matches!(
            handler.init_new_mlt(server(1, 1337), ExportId::new(1), inode(1)),
            Err(Error::AlreadyInitialized)
        ));

        handler.destroy_mlt().unwrap();
        assert!(matches!(handler.destroy_mlt(), Err(Error::Uninitialized)));
        assert!(handler.get_path(inode(1)).unwrap_err().is_fatal());
    }

    #[test]
    fn test_write_destroy_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mlt");
        let handler = handler();
        handler.add_server(server(2, 1337)).unwrap();
        handler.add_server(server(3, 7000)).unwrap();
        handler
            .add_new_entry(&server(2, 1337), ExportId::new(2), inode(2), "/home")
            .unwrap();
        handler
            .add_new_entry(&server(3, 7000), ExportId::new(3), inode(3), "/home/x")
            .unwrap();

        let servers = handler.get_server_list().unwrap();
        let entries = handler.entries().unwrap();

        handler.write_to_file(&path).unwrap();
        handler.destroy_mlt().unwrap();
        assert!(matches!(handler.write_to_file(&path), Err(Error::Uninitialized)));
        handler.read_from_file(&path).unwrap();

        assert_eq!(handler.get_server_list().unwrap(), servers);
        assert_eq!(handler.entries().unwrap(), entries);
        assert!(matches!(
            handler.read_from_file(&path),
            Err(Error::AlreadyInitialized)
        ));
    }

    #[test]
    fn test_reload_replaces_and_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mlt");

        let other = MltHandler::new();
        other
            .init_new_mlt(server(9, 1), ExportId::new(1), inode(1))
            .unwrap();
        other.write_to_file(&path).unwrap();

        let handler = handler();
        handler.reload_mlt(&path).unwrap();
        assert_eq!(handler.get_mds(inode(1)).unwrap(), server(9, 1));

        std::fs::write(&path, b"garbage").unwrap();
        assert!(handler.reload_mlt(&path).is_err());
        assert!(!handler.is_initialized());
    }

    #[test]
    fn test_path_to_root_scenarios() {
        let handler = handler();
        let res = handler.path_to_root("/").unwrap();
        assert_eq!(res.root_inode, inode(1));
        assert!(res.exact);

        handler.add_server(server(2, 1337)).unwrap();
        handler
            .add_new_entry(&server(2, 1337), ExportId::new(2), inode(2), "/home")
            .unwrap();
        let res = handler.path_to_root("/home/x").unwrap();
        assert_eq!(res.root_inode, inode(2));
        assert_eq!(res.relative_path, "/x");

        let res = handler.path_to_root("/home").unwrap();
        assert!(res.exact);
        assert_eq!(res.relative_path, "/home");
    }

    #[test]
    fn test_resolve_entry_snapshots_owner() {
        let handler = MltHandler::new();
        assert!(handler.resolve_entry("/").unwrap_err().is_fatal());

        let handler = self::handler();
        handler.add_server(server(2, 1337)).unwrap();
        handler
            .add_new_entry(&server(2, 1337), ExportId::new(2), inode(2), "/home")
            .unwrap();
        let (res, entry) = handler.resolve_entry("/home/x/y").unwrap();
        assert_eq!(res.root_inode, entry.root_inode);
        assert_eq!(res.relative_path, "/x/y");
        assert_eq!(entry.owner, server(2, 1337));
        assert_eq!(entry.export_id, ExportId::new(2));
        assert!(matches!(
            handler.resolve_entry("home"),
            Err(Error::InvalidPath(_))
        ));
    }

    #[test]
    fn test_server_add_remove_restores_list() {
        let handler = handler();
        handler.add_server(server(2, 1337)).unwrap();
        let before = handler.get_server_list().unwrap();

        handler.add_server(Server::new("1.2.3.4", 9000)).unwrap();
        handler.remove_server(&Server::new("1.2.3.4", 9000)).unwrap();
        assert_eq!(handler.get_server_list().unwrap(), before);

        assert!(matches!(
            handler.remove_server(&Server::new("1.2.3.4", 9000)),
            Err(Error::ServerNotFound(_))
        ));
    }

    #[test]
    fn test_reassignment_bumps_version_once() {
        let handler = handler();
        handler.add_server(server(2, 1337)).unwrap();
        handler
            .add_new_entry(&server(1, 1337), ExportId::new(2), inode(2), "/home")
            .unwrap();
        handler
            .add_new_entry(&server(2, 1337), ExportId::new(2), inode(2), "/home")
            .unwrap();

        assert_eq!(handler.entries().unwrap().len(), 2);
        assert_eq!(handler.get_mds(inode(2)).unwrap(), server(2, 1337));
        assert_eq!(handler.get_version(inode(2)).unwrap(), 1);

        assert_eq!(handler.update_entry(inode(2), &server(1, 1337)).unwrap(), 2);
    }

    #[test]
    fn test_accessors() {
        let handler = handler();
        handler.add_server(server(2, 1337)).unwrap();
        handler
            .add_new_entry(&server(2, 1337), ExportId::new(5), inode(2), "/data")
            .unwrap();

        assert!(handler.is_partition_root(inode(2)).unwrap());
        assert!(!handler.is_partition_root(inode(3)).unwrap());
        assert_eq!(handler.get_parent(inode(2)).unwrap(), inode(1));
        assert!(handler.get_parent(inode(1)).unwrap_err().is_fatal());
        assert!(matches!(
            handler.get_parent(inode(3)),
            Err(Error::PartitionNotFound(_))
        ));
        assert_eq!(handler.get_children(inode(1)).unwrap(), vec![inode(2)]);
        assert!(handler.get_children(inode(2)).unwrap().is_empty());
        assert_eq!(handler.get_path(inode(2)).unwrap(), "/data");
        assert_eq!(handler.get_export_id(inode(2)).unwrap(), ExportId::new(5));
        assert_eq!(handler.get_entry(inode(2)).unwrap().version, 0);
        assert!(matches!(
            handler.remove_entry(inode(3)),
            Err(Error::PartitionNotFound(_))
        ));
        handler.remove_entry(inode(2)).unwrap();
        assert!(!handler.is_partition_root(inode(2)).unwrap());
    }

    #[test]
    fn test_identity_queries() {
        let handler = handler();
        handler.add_server(server(2, 1337)).unwrap();
        handler.add_server(server(3, 1337)).unwrap();
        handler.add_server(server(2, 4000)).unwrap();
        handler
            .add_new_entry(&server(2, 1337), ExportId::new(0), inode(10), "/b")
            .unwrap();
        handler
            .add_new_entry(&server(2, 4000), ExportId::new(0), inode(11), "/c")
            .unwrap();
        handler
            .add_new_entry(&server(2, 1337), ExportId::new(0), inode(12), "/a")
            .unwrap();

        assert!(handler.get_my_rank().unwrap_err().is_fatal());
        handler.set_my_address(server(2, 1337)).unwrap();

        assert_eq!(handler.get_my_address().unwrap(), server(2, 1337));
        assert_eq!(handler.get_my_rank().unwrap(), 1);
        assert_eq!(
            handler.get_other_servers().unwrap(),
            vec![server(1, 1337), server(3, 1337)]
        );
        assert_eq!(handler.get_my_partitions().unwrap(), vec![inode(10), inode(12)]);

        handler.set_my_address(server(8, 1)).unwrap();
        assert_eq!(handler.get_my_rank().unwrap(), 4);
    }

    #[test]
    fn test_set_my_address_requires_table() {
        let handler = MltHandler::new();
        assert!(matches!(
            handler.set_my_address(server(1, 1)),
            Err(Error::Uninitialized)
        ));
    }

    #[test]
    fn test_concurrent_access() {
        let handler = Arc::new(handler());
        handler.add_server(server(2, 1337)).unwrap();

        let workers: Vec<_> = (0..8u64)
            .map(|t| {
                let handler = Arc::clone(&handler);
                std::thread::spawn(move || {
                    for i in 0..50u64 {
                        let ino = inode(100 + t * 1000 + i);
                        let path = format!("/t{t}/p{i}");
                        handler
                            .add_new_entry(&server(2, 1337), ExportId::new(0), ino, &path)
                            .unwrap();
                        assert_eq!(handler.path_to_root(&path).unwrap().root_inode, ino);
                        handler.update_entry(ino, &server(1, 1337)).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let entries = handler.entries().unwrap();
        assert_eq!(entries.len(), 1 + 8 * 50);
        assert!(entries.iter().skip(1).all(|e| e.version == 1));
    }
}
