//! Outbound peer channels
//!
//! One persistent channel per peer, kept in a table guarded by its own
//! lock. Sends are serialized by a second lock so that at most one send is
//! in flight per process, while channel setup can proceed independently.

use crate::envelope::Envelope;
use crate::error::{CommError, CommResult};
use crate::module::CommunicationModule;
use crate::transport::{Connector, Link};
use bytes::Bytes;
use metaroute_common::Server;
use metaroute_common::config::PeerConfig;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// How peers are keyed and dialled
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerAddressing {
    /// Peers are keyed by `address:port` and dialled as such
    pub variable_ports: bool,
    /// Port appended to bare addresses when dialling
    pub default_port: u16,
}

impl PeerAddressing {
    #[must_use]
    pub const fn from_config(config: &PeerConfig) -> Self {
        Self {
            variable_ports: config.variable_ports,
            default_port: config.default_port,
        }
    }

    /// Channel key for a server from the routing table
    #[must_use]
    pub fn peer_key(&self, server: &Server) -> String {
        if self.variable_ports {
            server.to_string()
        } else {
            server.address.clone()
        }
    }

    /// Address to dial for a channel key
    #[must_use]
    pub fn dial_address(&self, peer: &str) -> String {
        if self.variable_ports {
            peer.to_string()
        } else {
            format!("{peer}:{}", self.default_port)
        }
    }
}

impl Default for PeerAddressing {
    fn default() -> Self {
        Self::from_config(&PeerConfig::default())
    }
}

/// Table of outbound channels
pub struct PeerChannels {
    identity: String,
    addressing: PeerAddressing,
    connector: Arc<dyn Connector>,
    max_frame_len: usize,
    /// Connected peers: channel key -> link
    channels: Mutex<BTreeMap<String, Arc<dyn Link>>>,
    send_lock: Mutex<()>,
}

impl PeerChannels {
    /// Create an empty table. `identity` is announced to every peer so their
    /// replies can be routed back to us.
    pub fn new(
        identity: impl Into<String>,
        addressing: PeerAddressing,
        connector: Arc<dyn Connector>,
        max_frame_len: usize,
    ) -> Self {
        Self {
            identity: identity.into(),
            addressing,
            connector,
            max_frame_len,
            channels: Mutex::new(BTreeMap::new()),
            send_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    #[must_use]
    pub const fn addressing(&self) -> PeerAddressing {
        self.addressing
    }

    /// Open a channel to `peer`. An existing channel is left alone and
    /// reported as [`CommError::ChannelExists`].
    pub async fn ensure_channel(&self, peer: &str) -> CommResult<()> {
        if self.channels.lock().await.contains_key(peer) {
            return Err(CommError::ChannelExists(peer.to_string()));
        }

        // The table stays unlocked while dialling so sends to connected
        // peers are not held up by a slow or unreachable one.
        let address = self.addressing.dial_address(peer);
        let link = self
            .connector
            .connect(&address, &self.identity)
            .await
            .map_err(|e| CommError::ChannelCreation {
                peer: peer.to_string(),
                reason: e.to_string(),
            })?;

        let mut channels = self.channels.lock().await;
        if channels.contains_key(peer) {
            drop(channels);
            if let Err(e) = link.close().await {
                debug!("Closing duplicate channel to {} failed: {}", peer, e);
            }
            return Err(CommError::ChannelExists(peer.to_string()));
        }
        channels.insert(peer.to_string(), link);
        info!("Channel to {} established ({})", peer, address);
        Ok(())
    }

    /// Ensure a channel to every peer in `peers`, ignoring ones that already
    /// exist. Returns how many could not be opened.
    pub async fn ensure_channels<I, S>(&self, peers: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut failed = 0;
        for peer in peers {
            match self.ensure_channel(peer.as_ref()).await {
                Ok(()) => {}
                Err(e) if e.is_already_exists() => {}
                Err(e) => {
                    warn!("{}", e);
                    failed += 1;
                }
            }
        }
        failed
    }

    /// Close and forget the channel to `peer`.
    pub async fn remove_channel(&self, peer: &str) -> CommResult<()> {
        let link = self
            .channels
            .lock()
            .await
            .remove(peer)
            .ok_or_else(|| CommError::NoChannel(peer.to_string()))?;
        link.close().await?;
        info!("Channel to {} removed", peer);
        Ok(())
    }

    /// Close and forget every channel. Returns how many were closed.
    pub async fn teardown_all_channels(&self) -> CommResult<usize> {
        let channels = std::mem::take(&mut *self.channels.lock().await);
        let total = channels.len();
        let mut failed = 0;
        for (peer, link) in channels {
            if let Err(e) = link.close().await {
                warn!("Closing channel to {} failed: {}", peer, e);
                failed += 1;
            }
        }
        info!("Tore down {} channels", total);
        if failed > 0 {
            return Err(CommError::TeardownIncomplete { failed, total });
        }
        Ok(total)
    }

    /// Keys of every open channel
    pub async fn connected_peers(&self) -> Vec<String> {
        self.channels.lock().await.keys().cloned().collect()
    }

    /// Send `payload` to each of `targets` in order, or to every connected
    /// peer when `targets` is empty.
    ///
    /// Stops at the first failing target; peers before it have received the
    /// message and are not contacted again.
    pub async fn send(
        &self,
        payload: Bytes,
        sender: CommunicationModule,
        receiver: CommunicationModule,
        targets: &[String],
    ) -> CommResult<()> {
        let frame = Envelope::new(receiver, sender, payload).encode(self.max_frame_len)?;
        let _sending = self.send_lock.lock().await;

        let targets = if targets.is_empty() {
            self.connected_peers().await
        } else {
            targets.to_vec()
        };

        for (index, peer) in targets.iter().enumerate() {
            let link = self
                .channels
                .lock()
                .await
                .get(peer)
                .cloned()
                .ok_or_else(|| CommError::UnknownTarget {
                    index,
                    peer: peer.clone(),
                })?;
            link.send(frame.clone())
                .await
                .map_err(|e| CommError::SendFailed {
                    index,
                    peer: peer.clone(),
                    reason: e.to_string(),
                })?;
            debug!("Sent {} bytes to {} ({} -> {})", frame.len(), peer, sender, receiver);
        }
        Ok(())
    }
}
