//! In-process transport
//!
//! Links deliver frames straight into the [`Dispatcher`] bound at the
//! target address. Used to run several servers inside one process, mostly
//! in tests.

use crate::error::{CommError, CommResult};
use crate::server::Dispatcher;
use crate::transport::{Connector, DuplexLink, Link};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Default)]
struct Inner {
    endpoints: Mutex<HashMap<String, Arc<Dispatcher>>>,
    unreachable: Mutex<HashSet<String>>,
}

/// A set of in-process addresses
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Inner>,
}

impl MemoryNetwork {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `address` reachable, delivering to `dispatcher`.
    pub fn bind(&self, address: &str, dispatcher: Arc<Dispatcher>) {
        self.inner
            .endpoints
            .lock()
            .insert(address.to_string(), dispatcher);
    }

    /// Make sends to `address` fail (or succeed again).
    pub fn set_unreachable(&self, address: &str, unreachable: bool) {
        let mut set = self.inner.unreachable.lock();
        if unreachable {
            set.insert(address.to_string());
        } else {
            set.remove(address);
        }
    }

    #[must_use]
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// [`Connector`] for a [`MemoryNetwork`]
pub struct MemoryConnector {
    inner: Arc<Inner>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, address: &str, identity: &str) -> CommResult<Arc<dyn Link>> {
        if !self.inner.endpoints.lock().contains_key(address) {
            return Err(CommError::Io(std::io::Error::new(
                ErrorKind::ConnectionRefused,
                format!("nothing bound at {address}"),
            )));
        }
        Ok(Arc::new(MemoryLink {
            inner: Arc::clone(&self.inner),
            address: address.to_string(),
            identity: identity.to_string(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryLink {
    inner: Arc<Inner>,
    address: String,
    identity: String,
    closed: AtomicBool,
}

#[async_trait]
impl Link for MemoryLink {
    async fn send(&self, frame: Bytes) -> CommResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CommError::Closed);
        }
        if self.inner.unreachable.lock().contains(&self.address) {
            return Err(CommError::Io(std::io::Error::new(
                ErrorKind::BrokenPipe,
                format!("{} unreachable", self.address),
            )));
        }
        let dispatcher = self
            .inner
            .endpoints
            .lock()
            .get(&self.address)
            .cloned()
            .ok_or(CommError::Closed)?;
        dispatcher.dispatch(&self.identity, frame).await
    }

    async fn close(&self) -> CommResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(CommError::Closed);
        }
        Ok(())
    }
}

type Responder = Box<dyn FnMut(Bytes) -> CommResult<Bytes> + Send>;

/// [`DuplexLink`] answering every request with a closure
pub struct ScriptedLink {
    responder: Responder,
    requests: Vec<Bytes>,
}

impl ScriptedLink {
    pub fn new(responder: impl FnMut(Bytes) -> CommResult<Bytes> + Send + 'static) -> Self {
        Self {
            responder: Box::new(responder),
            requests: Vec::new(),
        }
    }

    /// Requests seen so far
    #[must_use]
    pub fn requests(&self) -> &[Bytes] {
        &self.requests
    }
}

#[async_trait]
impl DuplexLink for ScriptedLink {
    async fn round_trip(&mut self, request: Bytes) -> CommResult<Bytes> {
        self.requests.push(request.clone());
        (self.responder)(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::CommunicationModule;

    #[tokio::test]
    async fn test_memory_link_delivers() {
        let network = MemoryNetwork::new();
        let dispatcher = Arc::new(Dispatcher::new());
        let mut rx = dispatcher.register(CommunicationModule::AdminOp, 4);
        network.bind("10.0.0.2", dispatcher);

        let link = network
            .connector()
            .connect("10.0.0.2", "10.0.0.1")
            .await
            .unwrap();
        link.send(Bytes::from_static(b"\x02\x02x")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().sender, "10.0.0.1");

        network.set_unreachable("10.0.0.2", true);
        assert!(link.send(Bytes::from_static(b"\x02\x02x")).await.is_err());

        link.close().await.unwrap();
        assert!(link.close().await.is_err());
    }

    #[tokio::test]
    async fn test_connect_refused_when_unbound() {
        let network = MemoryNetwork::new();
        assert!(network.connector().connect("10.0.0.3", "me").await.is_err());
    }
}
