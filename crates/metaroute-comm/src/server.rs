//! Inbound side of the peer channels
//!
//! Peers connect, announce their identity in the first frame and then
//! stream envelopes. Each envelope is handed to the queue registered for
//! its receiver module.

use crate::envelope::Envelope;
use crate::error::{CommError, CommResult};
use crate::module::CommunicationModule;
use crate::transport::read_frame;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// A message delivered to a module queue
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    /// Identity the sending peer announced
    pub sender: String,
    pub sending_module: CommunicationModule,
    pub receiving_module: CommunicationModule,
    pub payload: Bytes,
}

/// Routes envelopes to per module queues
#[derive(Default)]
pub struct Dispatcher {
    routes: RwLock<HashMap<CommunicationModule, mpsc::Sender<InboundMessage>>>,
}

impl Dispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the queue for `module`, replacing any previous one.
    pub fn register(
        &self,
        module: CommunicationModule,
        capacity: usize,
    ) -> mpsc::Receiver<InboundMessage> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.routes.write().insert(module, tx);
        rx
    }

    /// Decode an envelope received from `sender` and queue it.
    pub async fn dispatch(&self, sender: &str, data: Bytes) -> CommResult<()> {
        let envelope = Envelope::decode(&data)?;
        let route = self
            .routes
            .read()
            .get(&envelope.receiver)
            .cloned()
            .ok_or(CommError::NoReceiver(envelope.receiver))?;

        route
            .send(InboundMessage {
                sender: sender.to_string(),
                sending_module: envelope.sender,
                receiving_module: envelope.receiver,
                payload: envelope.payload,
            })
            .await
            .map_err(|_| CommError::NoReceiver(envelope.receiver))
    }
}

/// TCP listener feeding a [`Dispatcher`]
pub struct InboundServer {
    dispatcher: Arc<Dispatcher>,
    max_frame_len: usize,
}

impl InboundServer {
    #[must_use]
    pub const fn new(dispatcher: Arc<Dispatcher>, max_frame_len: usize) -> Self {
        Self {
            dispatcher,
            max_frame_len,
        }
    }

    /// Accept connections until `shutdown` flips to true.
    pub async fn serve(
        self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> CommResult<()> {
        info!("Peer listener on {}", listener.local_addr()?);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!("Accept failed: {}", e);
                            continue;
                        }
                    };
                    let dispatcher = Arc::clone(&self.dispatcher);
                    let max_frame_len = self.max_frame_len;
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, dispatcher, max_frame_len).await {
                            warn!("Connection from {} ended: {}", addr, e);
                        }
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Peer listener stopping");
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    max_frame_len: usize,
) -> CommResult<()> {
    let Some(identity) = read_frame(&mut stream, max_frame_len).await? else {
        return Ok(());
    };
    let identity = String::from_utf8(identity.to_vec())
        .map_err(|_| CommError::Malformed(format!("non UTF-8 identity from {addr}")))?;
    debug!("Peer {} connected from {}", identity, addr);

    while let Some(frame) = read_frame(&mut stream, max_frame_len).await? {
        match dispatcher.dispatch(&identity, frame).await {
            Ok(()) => {}
            Err(e @ CommError::Malformed(_)) => warn!("Dropping message from {}: {}", identity, e),
            Err(e) => error!("Cannot deliver message from {}: {}", identity, e),
        }
    }
    debug!("Peer {} disconnected", identity);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Connector, TcpConnector};
    use std::time::Duration;

    #[tokio::test]
    async fn test_dispatch_routes_by_receiver() {
        let dispatcher = Dispatcher::new();
        let mut admin = dispatcher.register(CommunicationModule::AdminOp, 4);

        dispatcher
            .dispatch("10.0.0.2", Bytes::from_static(b"\x02\x01data"))
            .await
            .unwrap();
        let msg = admin.recv().await.unwrap();
        assert_eq!(msg.sender, "10.0.0.2");
        assert_eq!(msg.sending_module, CommunicationModule::DistributedAtomicOp);
        assert_eq!(msg.payload, "data");

        assert!(matches!(
            dispatcher
                .dispatch("10.0.0.2", Bytes::from_static(b"\x00\x02x"))
                .await,
            Err(CommError::NoReceiver(CommunicationModule::LoadBalancing))
        ));
        assert!(matches!(
            dispatcher.dispatch("10.0.0.2", Bytes::from_static(b"\x07")).await,
            Err(CommError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_server_delivers_tcp_messages() {
        let dispatcher = Arc::new(Dispatcher::new());
        let mut admin = dispatcher.register(CommunicationModule::AdminOp, 4);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let (stop_tx, stop_rx) = watch::channel(false);
        let server = tokio::spawn(InboundServer::new(dispatcher, 1024).serve(listener, stop_rx));

        let link = TcpConnector::new(1024, Duration::from_secs(5))
            .connect(&address, "10.0.0.9")
            .await
            .unwrap();
        link.send(Bytes::from_static(b"\x02\x02hello")).await.unwrap();

        let msg = admin.recv().await.unwrap();
        assert_eq!(msg.sender, "10.0.0.9");
        assert_eq!(msg.payload, "hello");

        stop_tx.send(true).unwrap();
        server.await.unwrap().unwrap();
    }
}
