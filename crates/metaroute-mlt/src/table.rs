//! Routing table
//!
//! Partition entries are kept in an arena keyed by root inode. The parent
//! of an entry is stored as a key, and every node carries the keys of its
//! children in insertion order, so the tree never holds references into
//! itself.

use crate::path::{self, is_prefix, is_proper_prefix};
use crate::registry::ServerRegistry;
use metaroute_common::{Error, ExportId, InodeNumber, ROOT_PATH, Result, Server};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// One partition: a subtree of the namespace and the server owning it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionEntry {
    /// Root inode of the subtree (primary key)
    pub root_inode: InodeNumber,
    /// Canonical absolute path of the subtree root
    pub path: String,
    pub export_id: ExportId,
    /// Owning server, always present in the table's registry
    pub owner: Server,
    /// Bumped on every owner change or confirmation
    pub version: u64,
    /// Entry whose path is the longest proper prefix of this one
    pub parent: Option<InodeNumber>,
}

/// Result of resolving a path against the table
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathResolution {
    /// Root inode of the partition containing the path
    pub root_inode: InodeNumber,
    /// Path below the partition root. The input is normalized first; when
    /// the match is the filesystem root, or the path is the partition root
    /// itself, this is the whole normalized path.
    pub relative_path: String,
    /// True when the path is the partition root itself
    pub exact: bool,
}

/// What `add_entry` did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddOutcome {
    /// A new partition was created
    Inserted,
    /// The root inode was already known; its owner was replaced
    Reassigned { version: u64 },
}

#[derive(Clone, Debug)]
struct Node {
    entry: PartitionEntry,
    sequence: u64,
    children: Vec<InodeNumber>,
}

/// Partition entries plus the server registry they refer to
#[derive(Clone, Debug)]
pub struct RoutingTable {
    registry: ServerRegistry,
    nodes: BTreeMap<InodeNumber, Node>,
    root: InodeNumber,
    next_sequence: u64,
}

impl RoutingTable {
    /// Create a table holding only the root partition, owned by `root_server`.
    pub fn new(root_server: Server, export_id: ExportId, root_inode: InodeNumber) -> Result<Self> {
        let mut registry = ServerRegistry::new();
        registry.add(root_server.clone())?;

        let root = PartitionEntry {
            root_inode,
            path: ROOT_PATH.to_string(),
            export_id,
            owner: root_server,
            version: 0,
            parent: None,
        };

        let mut table = Self {
            registry,
            nodes: BTreeMap::new(),
            root: root_inode,
            next_sequence: 0,
        };
        table.insert_node(root, Vec::new());
        Ok(table)
    }

    /// Rebuild a table from persisted parts. `entries` must be in insertion
    /// order. Every structural invariant is checked before the table is
    /// returned.
    pub fn from_parts(
        registry: ServerRegistry,
        root: InodeNumber,
        entries: Vec<PartitionEntry>,
    ) -> Result<Self> {
        let mut table = Self {
            registry,
            nodes: BTreeMap::new(),
            root,
            next_sequence: 0,
        };

        let mut order = Vec::with_capacity(entries.len());
        for entry in entries {
            let inode = entry.root_inode;
            if table.nodes.contains_key(&inode) {
                return Err(Error::corrupted(format!("duplicate root inode {inode}")));
            }
            order.push((inode, entry.parent));
            table.insert_node(entry, Vec::new());
        }

        for (inode, parent) in order {
            let Some(parent) = parent else { continue };
            let node = table.nodes.get_mut(&parent).ok_or_else(|| {
                Error::corrupted(format!("entry {inode} references missing parent {parent}"))
            })?;
            node.children.push(inode);
        }

        table.validate()?;
        Ok(table)
    }

    fn insert_node(&mut self, entry: PartitionEntry, children: Vec<InodeNumber>) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.nodes.insert(
            entry.root_inode,
            Node {
                entry,
                sequence,
                children,
            },
        );
    }

    /// Register a server.
    pub fn add_server(&mut self, server: Server) -> Result<usize> {
        self.registry.add(server)
    }

    /// Remove a server. A server that still owns partitions cannot be
    /// removed.
    pub fn remove_server(&mut self, server: &Server) -> Result<()> {
        if let Some(owned) = self.nodes.values().find(|n| &n.entry.owner == server) {
            return Err(Error::Conflict(format!(
                "{server} still owns partition {} ({})",
                owned.entry.root_inode, owned.entry.path
            )));
        }
        self.registry.remove(server)
    }

    /// Deepest partition whose path is a prefix of `path` (already canonical).
    fn find_subtree(&self, path: &str) -> Result<&Node> {
        let mut current = self
            .nodes
            .get(&self.root)
            .ok_or_else(|| Error::corrupted("root partition missing"))?;

        // Children of one node are never prefixes of each other, so at most
        // one child can match at every level.
        'descend: loop {
            for child in &current.children {
                if let Some(node) = self.nodes.get(child) {
                    if is_prefix(&node.entry.path, path) {
                        current = node;
                        continue 'descend;
                    }
                }
            }
            return Ok(current);
        }
    }

    /// Find the partition responsible for `path` and the path relative to it.
    pub fn resolve(&self, path: &str) -> Result<PathResolution> {
        let path = path::normalize(path)?;
        let node = self.find_subtree(&path)?;
        let exact = node.entry.path == path;

        let relative_path = if exact || node.entry.path == ROOT_PATH {
            path.clone()
        } else {
            path.strip_prefix(node.entry.path.as_str())
                .unwrap_or_default()
                .to_string()
        };

        Ok(PathResolution {
            root_inode: node.entry.root_inode,
            relative_path,
            exact,
        })
    }

    /// Add a partition rooted at `path`, or hand an existing one to a new
    /// owner when `root_inode` is already in the table.
    ///
    /// Existing partitions below `path` are moved under the new entry.
    pub fn add_entry(
        &mut self,
        owner: &Server,
        export_id: ExportId,
        root_inode: InodeNumber,
        path: &str,
    ) -> Result<AddOutcome> {
        let path = path::normalize(path)?;
        if !self.registry.contains(owner) {
            return Err(Error::ServerNotFound(owner.clone()));
        }

        if let Some(node) = self.nodes.get_mut(&root_inode) {
            if node.entry.path != path {
                return Err(Error::Conflict(format!(
                    "root inode {root_inode} already names {}, not {path}",
                    node.entry.path
                )));
            }
            node.entry.owner = owner.clone();
            node.entry.version += 1;
            return Ok(AddOutcome::Reassigned {
                version: node.entry.version,
            });
        }

        let parent = self.find_subtree(&path)?;
        if parent.entry.path == path {
            return Err(Error::Conflict(format!(
                "{path} is already partition {}",
                parent.entry.root_inode
            )));
        }
        let parent_inode = parent.entry.root_inode;

        let (adopted, kept): (Vec<_>, Vec<_>) = parent.children.iter().copied().partition(|c| {
            self.nodes
                .get(c)
                .is_some_and(|n| is_prefix(&path, &n.entry.path))
        });

        for child in &adopted {
            if let Some(node) = self.nodes.get_mut(child) {
                node.entry.parent = Some(root_inode);
            }
        }
        if let Some(parent) = self.nodes.get_mut(&parent_inode) {
            parent.children = kept;
            parent.children.push(root_inode);
        }

        let entry = PartitionEntry {
            root_inode,
            path,
            export_id,
            owner: owner.clone(),
            version: 0,
            parent: Some(parent_inode),
        };
        self.insert_node(entry, adopted);
        Ok(AddOutcome::Inserted)
    }

    /// Hand a partition to `owner` and bump its version. Returns the new
    /// version.
    pub fn update_entry(&mut self, root_inode: InodeNumber, owner: &Server) -> Result<u64> {
        if !self.registry.contains(owner) {
            return Err(Error::UnknownOwner(owner.clone()));
        }
        let node = self
            .nodes
            .get_mut(&root_inode)
            .ok_or(Error::PartitionNotFound(root_inode))?;
        node.entry.owner = owner.clone();
        node.entry.version += 1;
        Ok(node.entry.version)
    }

    /// Remove a partition; its children move up to its parent.
    pub fn remove_entry(&mut self, root_inode: InodeNumber) -> Result<PartitionEntry> {
        if root_inode == self.root {
            return Err(Error::InvalidOperation(
                "the root partition cannot be removed".to_string(),
            ));
        }
        let node = self
            .nodes
            .remove(&root_inode)
            .ok_or(Error::PartitionNotFound(root_inode))?;
        let parent_inode = node
            .entry
            .parent
            .ok_or_else(|| Error::corrupted(format!("partition {root_inode} has no parent")))?;

        for child in &node.children {
            if let Some(c) = self.nodes.get_mut(child) {
                c.entry.parent = Some(parent_inode);
            }
        }

        let mut siblings = self
            .nodes
            .get(&parent_inode)
            .map(|p| p.children.clone())
            .unwrap_or_default();
        siblings.retain(|c| *c != root_inode);
        siblings.extend(node.children);
        siblings.sort_by_key(|c| self.nodes.get(c).map_or(u64::MAX, |n| n.sequence));

        if let Some(parent) = self.nodes.get_mut(&parent_inode) {
            parent.children = siblings;
        }
        Ok(node.entry)
    }

    /// Root inode of the filesystem root partition
    #[must_use]
    pub const fn root(&self) -> InodeNumber {
        self.root
    }

    #[must_use]
    pub fn entry(&self, root_inode: InodeNumber) -> Option<&PartitionEntry> {
        self.nodes.get(&root_inode).map(|n| &n.entry)
    }

    /// Children of a partition in insertion order
    #[must_use]
    pub fn children(&self, root_inode: InodeNumber) -> Option<&[InodeNumber]> {
        self.nodes.get(&root_inode).map(|n| n.children.as_slice())
    }

    /// All entries in insertion order
    #[must_use]
    pub fn entries(&self) -> Vec<&PartitionEntry> {
        let mut nodes: Vec<_> = self.nodes.values().collect();
        nodes.sort_by_key(|n| n.sequence);
        nodes.into_iter().map(|n| &n.entry).collect()
    }

    #[must_use]
    pub const fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    /// Number of partitions, root included
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Check every structural invariant of the table.
    pub fn validate(&self) -> Result<()> {
        let mut servers = HashSet::new();
        for server in self.registry.servers() {
            if !servers.insert(server) {
                return Err(Error::corrupted(format!("server {server} registered twice")));
            }
        }

        let root = self
            .nodes
            .get(&self.root)
            .ok_or_else(|| Error::corrupted("root partition missing"))?;
        if root.entry.parent.is_some() || root.entry.path != ROOT_PATH {
            return Err(Error::corrupted("root partition is not at /"));
        }

        let mut paths = HashSet::new();
        for (inode, node) in &self.nodes {
            let entry = &node.entry;
            if path::normalize(&entry.path)? != entry.path {
                return Err(Error::corrupted(format!("{}: non canonical path", entry.path)));
            }
            if !paths.insert(entry.path.as_str()) {
                return Err(Error::corrupted(format!("{}: duplicate path", entry.path)));
            }
            if !servers.contains(&entry.owner) {
                return Err(Error::corrupted(format!(
                    "partition {inode} owned by unregistered {}",
                    entry.owner
                )));
            }
            for child in &node.children {
                let parent_of_child = self.nodes.get(child).and_then(|c| c.entry.parent);
                if parent_of_child != Some(*inode) {
                    return Err(Error::corrupted(format!(
                        "partition {child} listed under {inode} but not its child"
                    )));
                }
            }

            if *inode == self.root {
                continue;
            }
            let parent_inode = entry
                .parent
                .ok_or_else(|| Error::corrupted(format!("second root partition {inode}")))?;
            let parent = self.nodes.get(&parent_inode).ok_or_else(|| {
                Error::corrupted(format!("partition {inode} has missing parent {parent_inode}"))
            })?;
            if !is_proper_prefix(&parent.entry.path, &entry.path) {
                return Err(Error::corrupted(format!(
                    "{} is not below its parent {}",
                    entry.path, parent.entry.path
                )));
            }
            if !parent.children.contains(inode) {
                return Err(Error::corrupted(format!(
                    "partition {inode} missing from its parent's children"
                )));
            }
            // The parent must be the closest enclosing partition.
            if let Some(between) = self.nodes.values().find(|n| {
                is_proper_prefix(&parent.entry.path, &n.entry.path)
                    && is_proper_prefix(&n.entry.path, &entry.path)
            }) {
                return Err(Error::corrupted(format!(
                    "{} sits between {} and {}",
                    between.entry.path, parent.entry.path, entry.path
                )));
            }
        }
        Ok(())
    }
}
