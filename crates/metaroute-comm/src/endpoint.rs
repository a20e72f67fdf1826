//! Request/reply layer for one module
//!
//! Requests carry a message id; replies echo it. The endpoint remembers
//! how many replies each outstanding request expects and collects them as
//! they arrive on the module's inbound queue.

use crate::channels::PeerChannels;
use crate::envelope::{Frame, FrameKind};
use crate::error::{CommError, CommResult};
use crate::module::CommunicationModule;
use crate::server::InboundMessage;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tracing::{debug, warn};

/// How long an unanswered request is remembered
pub const MSG_LIFE_TIME: Duration = Duration::from_secs(20);

/// A reply collected for an outstanding request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub server: String,
    pub data: Bytes,
}

/// A request received from a peer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub message_id: u64,
    pub sender: String,
    pub sending_module: CommunicationModule,
    pub data: Bytes,
}

struct Pending {
    expected: usize,
    replies: Vec<Reply>,
    created: Instant,
    notify: Arc<Notify>,
}

/// Request/reply bookkeeping for one [`CommunicationModule`]
pub struct Endpoint {
    module: CommunicationModule,
    channels: Arc<PeerChannels>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, Pending>>,
    life_time: Duration,
}

impl Endpoint {
    #[must_use]
    pub fn new(module: CommunicationModule, channels: Arc<PeerChannels>) -> Self {
        Self {
            module,
            channels,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            life_time: MSG_LIFE_TIME,
        }
    }

    #[must_use]
    pub const fn module(&self) -> CommunicationModule {
        self.module
    }

    #[must_use]
    pub fn channels(&self) -> &Arc<PeerChannels> {
        &self.channels
    }

    /// Send a request to `targets` (every connected peer when empty) and
    /// return its message id. One reply per target is expected.
    pub async fn send_request(
        &self,
        data: Bytes,
        to_module: CommunicationModule,
        targets: &[String],
    ) -> CommResult<u64> {
        let message_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let expected = if targets.is_empty() {
            self.channels.connected_peers().await.len()
        } else {
            targets.len()
        };

        {
            let mut pending = self.pending.lock();
            purge_expired(&mut pending, self.life_time);
            pending.insert(
                message_id,
                Pending {
                    expected,
                    replies: Vec::with_capacity(expected),
                    created: Instant::now(),
                    notify: Arc::new(Notify::new()),
                },
            );
        }

        let frame = Frame::request(message_id, data).encode();
        if let Err(e) = self
            .channels
            .send(frame, self.module, to_module, targets)
            .await
        {
            self.pending.lock().remove(&message_id);
            return Err(e);
        }
        debug!("Request {} sent to {} peers", message_id, expected);
        Ok(message_id)
    }

    /// Wait until every reply for `message_id` has arrived.
    ///
    /// The request is forgotten once this returns, whether or not all
    /// replies came in.
    pub async fn receive_reply(&self, message_id: u64, timeout: Duration) -> CommResult<Vec<Reply>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notify = {
                let mut pending = self.pending.lock();
                let entry = pending
                    .get(&message_id)
                    .ok_or(CommError::UnknownMessageId(message_id))?;
                if entry.replies.len() >= entry.expected {
                    return Ok(pending
                        .remove(&message_id)
                        .map(|p| p.replies)
                        .unwrap_or_default());
                }
                Arc::clone(&entry.notify)
            };

            if tokio::time::timeout_at(deadline, notify.notified())
                .await
                .is_err()
            {
                let entry = self.pending.lock().remove(&message_id);
                let (received, expected) = entry.map_or((0, 0), |p| (p.replies.len(), p.expected));
                return Err(CommError::Timeout { received, expected });
            }
        }
    }

    /// Answer request `message_id` from `server`.
    pub async fn reply(
        &self,
        message_id: u64,
        data: Bytes,
        to_module: CommunicationModule,
        server: &str,
    ) -> CommResult<()> {
        let frame = Frame::reply(message_id, data).encode();
        self.channels
            .send(frame, self.module, to_module, &[server.to_string()])
            .await
    }

    /// Process one inbound message: replies are filed under their request,
    /// requests are returned to the caller.
    pub fn accept(&self, message: InboundMessage) -> Option<Request> {
        let frame = match Frame::decode(&message.payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping message from {}: {}", message.sender, e);
                return None;
            }
        };

        match frame.kind {
            FrameKind::Request => Some(Request {
                message_id: frame.message_id,
                sender: message.sender,
                sending_module: message.sending_module,
                data: frame.data,
            }),
            FrameKind::Reply => {
                self.file_reply(frame.message_id, message.sender, frame.data);
                None
            }
        }
    }

    fn file_reply(&self, message_id: u64, server: String, data: Bytes) {
        let mut pending = self.pending.lock();
        purge_expired(&mut pending, self.life_time);

        match pending.get_mut(&message_id) {
            Some(entry) => {
                entry.replies.push(Reply { server, data });
                if entry.replies.len() >= entry.expected {
                    entry.notify.notify_one();
                }
            }
            None => debug!("Late or unknown reply {} from {}", message_id, server),
        }
    }

    /// Wait for the next request on `inbox`, filing any replies on the way.
    /// Returns `None` once the queue is closed.
    pub async fn next_request(&self, inbox: &mut mpsc::Receiver<InboundMessage>) -> Option<Request> {
        while let Some(message) = inbox.recv().await {
            if let Some(request) = self.accept(message) {
                return Some(request);
            }
        }
        None
    }

    /// Number of requests still waiting for replies
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Forget requests older than `life_time`.
fn purge_expired(pending: &mut HashMap<u64, Pending>, life_time: Duration) {
    pending.retain(|id, p| {
        let alive = p.created.elapsed() < life_time;
        if !alive {
            debug!("Request {} expired with {}/{} replies", id, p.replies.len(), p.expected);
        }
        alive
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::PeerAddressing;
    use crate::memory::MemoryNetwork;
    use crate::server::Dispatcher;

    struct Node {
        endpoint: Arc<Endpoint>,
        inbox: mpsc::Receiver<InboundMessage>,
    }

    async fn node(network: &MemoryNetwork, address: &str) -> Node {
        let dispatcher = Arc::new(Dispatcher::new());
        let inbox = dispatcher.register(CommunicationModule::AdminOp, 16);
        network.bind(&format!("{address}:49152"), dispatcher);
        let channels = Arc::new(PeerChannels::new(
            address,
            PeerAddressing::default(),
            Arc::new(network.connector()),
            1 << 20,
        ));
        Node {
            endpoint: Arc::new(Endpoint::new(CommunicationModule::AdminOp, channels)),
            inbox,
        }
    }

    #[tokio::test]
    async fn test_request_reply_round_trip() {
        let network = MemoryNetwork::new();
        let mut a = node(&network, "10.0.0.1").await;
        let mut b = node(&network, "10.0.0.2").await;
        a.endpoint.channels().ensure_channel("10.0.0.2").await.unwrap();
        b.endpoint.channels().ensure_channel("10.0.0.1").await.unwrap();

        let id = a
            .endpoint
            .send_request(
                Bytes::from_static(b"ping"),
                CommunicationModule::AdminOp,
                &["10.0.0.2".to_string()],
            )
            .await
            .unwrap();

        let request = b.endpoint.next_request(&mut b.inbox).await.unwrap();
        assert_eq!(request.message_id, id);
        assert_eq!(request.sender, "10.0.0.1");
        assert_eq!(request.data, "ping");
        b.endpoint
            .reply(id, Bytes::from_static(b"pong"), CommunicationModule::AdminOp, &request.sender)
            .await
            .unwrap();

        // Deliver the reply into a's pending table.
        let inbound = a.inbox.recv().await.unwrap();
        assert!(a.endpoint.accept(inbound).is_none());

        let replies = a
            .endpoint
            .receive_reply(id, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(replies, vec![Reply { server: "10.0.0.2".to_string(), data: Bytes::from_static(b"pong") }]);
        assert_eq!(a.endpoint.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_receive_reply_waits_for_late_reply() {
        let network = MemoryNetwork::new();
        let a = node(&network, "10.0.0.1").await;
        let _b = node(&network, "10.0.0.2").await;
        a.endpoint.channels().ensure_channel("10.0.0.2").await.unwrap();

        let id = a
            .endpoint
            .send_request(Bytes::new(), CommunicationModule::AdminOp, &[])
            .await
            .unwrap();

        let endpoint = Arc::clone(&a.endpoint);
        let waiter =
            tokio::spawn(async move { endpoint.receive_reply(id, Duration::from_secs(5)).await });
        tokio::task::yield_now().await;

        let reply = InboundMessage {
            sender: "10.0.0.2".to_string(),
            sending_module: CommunicationModule::AdminOp,
            receiving_module: CommunicationModule::AdminOp,
            payload: Frame::reply(id, Bytes::from_static(b"ack")).encode(),
        };
        assert!(a.endpoint.accept(reply).is_none());

        let replies = waiter.await.unwrap().unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].data, "ack");
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_messages_are_dropped() {
        let network = MemoryNetwork::new();
        let a = node(&network, "10.0.0.1").await;
        let garbage = InboundMessage {
            sender: "10.0.0.2".to_string(),
            sending_module: CommunicationModule::AdminOp,
            receiving_module: CommunicationModule::AdminOp,
            payload: Bytes::from_static(b"\x01"),
        };
        assert!(a.endpoint.accept(garbage).is_none());

        let stray = InboundMessage {
            sender: "10.0.0.2".to_string(),
            sending_module: CommunicationModule::AdminOp,
            receiving_module: CommunicationModule::AdminOp,
            payload: Frame::reply(99, Bytes::new()).encode(),
        };
        assert!(a.endpoint.accept(stray).is_none());
        assert_eq!(a.endpoint.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_reply_times_out() {
        let network = MemoryNetwork::new();
        let a = node(&network, "10.0.0.1").await;
        let _b = node(&network, "10.0.0.2").await;
        let _c = node(&network, "10.0.0.3").await;
        a.endpoint
            .channels()
            .ensure_channels(["10.0.0.2", "10.0.0.3"])
            .await;

        let id = a
            .endpoint
            .send_request(Bytes::new(), CommunicationModule::AdminOp, &[])
            .await
            .unwrap();
        let reply = InboundMessage {
            sender: "10.0.0.2".to_string(),
            sending_module: CommunicationModule::AdminOp,
            receiving_module: CommunicationModule::AdminOp,
            payload: Frame::reply(id, Bytes::new()).encode(),
        };
        a.endpoint.accept(reply);

        let err = a
            .endpoint
            .receive_reply(id, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, CommError::Timeout { received: 1, expected: 2 }));
        assert!(matches!(
            a.endpoint.receive_reply(id, Duration::from_secs(1)).await,
            Err(CommError::UnknownMessageId(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_requests_expire_on_next_send() {
        let network = MemoryNetwork::new();
        let a = node(&network, "10.0.0.1").await;
        let _b = node(&network, "10.0.0.2").await;
        a.endpoint.channels().ensure_channel("10.0.0.2").await.unwrap();

        for _ in 0..3 {
            a.endpoint
                .send_request(Bytes::new(), CommunicationModule::AdminOp, &[])
                .await
                .unwrap();
        }
        assert_eq!(a.endpoint.outstanding(), 3);

        tokio::time::advance(MSG_LIFE_TIME + Duration::from_secs(1)).await;
        let id = a
            .endpoint
            .send_request(Bytes::new(), CommunicationModule::AdminOp, &[])
            .await
            .unwrap();
        assert_eq!(a.endpoint.outstanding(), 1);
        assert!(matches!(
            a.endpoint.receive_reply(id - 1, Duration::from_secs(1)).await,
            Err(CommError::UnknownMessageId(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_send_forgets_request() {
        let network = MemoryNetwork::new();
        let a = node(&network, "10.0.0.1").await;
        let err = a
            .endpoint
            .send_request(
                Bytes::new(),
                CommunicationModule::AdminOp,
                &["10.0.0.7".to_string()],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CommError::UnknownTarget { index: 0, .. }));
        assert_eq!(a.endpoint.outstanding(), 0);
    }
}
