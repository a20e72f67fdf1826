//! Server registry
//!
//! Servers live in a slot vector. Removing a server frees its slot and the
//! next registration reuses the first free slot, so the iteration order of
//! the surviving servers never changes. When every slot is taken the vector
//! doubles.

use metaroute_common::{DEFAULT_SERVER_CAPACITY, Error, Result, Server};
use tracing::debug;

/// Slot based collection of servers, unique on `(address, port)`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerRegistry {
    slots: Vec<Option<Server>>,
}

impl ServerRegistry {
    /// Create an empty registry with the default number of slots
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SERVER_CAPACITY)
    }

    /// Create an empty registry with `capacity` free slots (at least one)
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity.max(1)],
        }
    }

    /// Rebuild a registry from persisted slots
    #[must_use]
    pub fn from_slots(slots: Vec<Option<Server>>) -> Self {
        if slots.is_empty() {
            return Self::new();
        }
        Self { slots }
    }

    /// Register a server and return the slot it landed in.
    pub fn add(&mut self, server: Server) -> Result<usize> {
        if self.contains(&server) {
            return Err(Error::ServerAlreadyExists(server));
        }

        if let Some(slot) = self.slots.iter().position(Option::is_none) {
            self.slots[slot] = Some(server);
            return Ok(slot);
        }

        // No free slot: double the slot count. The server is only stored
        // once the allocation succeeded.
        let old_len = self.slots.len();
        self.slots.try_reserve_exact(old_len).map_err(|e| {
            Error::ResourceExhausted(format!("cannot grow server registry to {}: {e}", old_len * 2))
        })?;
        self.slots.resize(old_len * 2, None);
        debug!("Server registry grown from {} to {} slots", old_len, self.slots.len());

        self.slots[old_len] = Some(server);
        Ok(old_len)
    }

    /// Remove a server, freeing its slot.
    pub fn remove(&mut self, server: &Server) -> Result<()> {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.as_ref() == Some(server))
            .ok_or_else(|| Error::ServerNotFound(server.clone()))?;
        *slot = None;
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, server: &Server) -> bool {
        self.servers().any(|s| s == server)
    }

    /// Registered servers in slot order
    pub fn servers(&self) -> impl Iterator<Item = &Server> {
        self.slots.iter().flatten()
    }

    /// Raw slots, including free ones
    #[must_use]
    pub fn slots(&self) -> &[Option<Server>] {
        &self.slots
    }

    /// Number of registered servers
    #[must_use]
    pub fn len(&self) -> usize {
        self.servers().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of slots, free or not
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

impl Default for ServerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
