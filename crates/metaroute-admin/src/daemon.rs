//! Replication daemon
//!
//! Two loops share one [`ReplicationDaemon`]:
//!
//! - the broadcaster polls the staging path. A staged table is loaded
//!   locally, then its raw bytes are pushed to every other server of the
//!   new table.
//! - the request loop answers pushes from peers: load the pushed table,
//!   persist it to the canonical path, reply with a status word.
//!
//! Failures are logged and never stop either loop.

use crate::export::{ConfigRegenerator, MigrationState};
use bytes::Bytes;
use metaroute_common::config::{MltConfig, ReplicationConfig};
use metaroute_comm::{CommunicationModule, Endpoint, InboundMessage, PeerChannels, Request};
use metaroute_mlt::MltHandler;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Status word replied to a pushing peer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum UpdateStatus {
    Applied = 0,
    StagingWriteFailed = -1,
    ReloadFailed = -2,
    PersistFailed = -3,
}

impl UpdateStatus {
    #[must_use]
    pub const fn code(self) -> i32 {
        self as i32
    }

    #[must_use]
    pub fn to_bytes(self) -> Bytes {
        Bytes::copy_from_slice(&self.code().to_le_bytes())
    }

    /// Decode a status reply. Unknown values are reported as `Err(raw)`.
    pub fn from_bytes(data: &[u8]) -> Result<Self, Option<i32>> {
        let raw: [u8; 4] = data.try_into().map_err(|_| None)?;
        match i32::from_le_bytes(raw) {
            0 => Ok(Self::Applied),
            -1 => Ok(Self::StagingWriteFailed),
            -2 => Ok(Self::ReloadFailed),
            -3 => Ok(Self::PersistFailed),
            other => Err(Some(other)),
        }
    }
}

/// What one broadcast cycle did
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// The staged table was loaded into the local handler
    pub reloaded: bool,
    /// Peers the table was addressed to
    pub targets: Vec<String>,
    /// The push went out to every target
    pub sent: bool,
    /// Replies collected when acknowledgements are awaited
    pub acknowledgements: Option<Vec<(String, i32)>>,
    /// Where a failed staging file was kept
    pub retained: Option<PathBuf>,
}

pub struct ReplicationDaemon {
    handler: Arc<MltHandler>,
    endpoint: Arc<Endpoint>,
    paths: MltConfig,
    settings: ReplicationConfig,
    migration: Arc<MigrationState>,
    regenerator: Option<Arc<dyn ConfigRegenerator>>,
}

impl ReplicationDaemon {
    #[must_use]
    pub fn new(
        handler: Arc<MltHandler>,
        endpoint: Arc<Endpoint>,
        paths: MltConfig,
        settings: ReplicationConfig,
    ) -> Self {
        Self {
            handler,
            endpoint,
            paths,
            settings,
            migration: Arc::new(MigrationState::new()),
            regenerator: None,
        }
    }

    /// Regenerate derived configuration after updates once a migration
    /// has completed.
    #[must_use]
    pub fn with_regenerator(mut self, regenerator: Arc<dyn ConfigRegenerator>) -> Self {
        self.regenerator = Some(regenerator);
        self
    }

    #[must_use]
    pub fn migration_state(&self) -> Arc<MigrationState> {
        Arc::clone(&self.migration)
    }

    fn channels(&self) -> &PeerChannels {
        self.endpoint.channels()
    }

    /// Poll the staging path until `shutdown` is set.
    pub async fn run_broadcaster(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Watching {} every {:?}",
            self.paths.staging_path.display(),
            self.settings.poll_interval()
        );
        loop {
            tokio::select! {
                () = tokio::time::sleep(self.settings.poll_interval()) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
            if let Some(report) = self.poll_once().await {
                debug!("Broadcast cycle: {:?}", report);
            }
        }
        info!("Broadcaster stopped");
    }

    /// Run one broadcast cycle if a table is staged.
    pub async fn poll_once(&self) -> Option<BroadcastReport> {
        match tokio::fs::try_exists(&self.paths.staging_path).await {
            Ok(true) => Some(self.broadcast().await),
            Ok(false) => None,
            Err(e) => {
                warn!(
                    "Cannot check {}: {}",
                    self.paths.staging_path.display(),
                    e
                );
                None
            }
        }
    }

    async fn broadcast(&self) -> BroadcastReport {
        let staging = &self.paths.staging_path;
        let mut report = BroadcastReport::default();
        info!("Staged routing table found at {}", staging.display());

        let bytes = match tokio::fs::read(staging).await {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                error!("Cannot read staged table {}: {}", staging.display(), e);
                report.retained = self.discard_staging(false).await;
                return report;
            }
        };

        match self.handler.reload_mlt(staging) {
            Ok(()) => report.reloaded = true,
            Err(e) => error!("Staged table rejected: {}", e),
        }

        let others = match self.handler.get_other_servers() {
            Ok(servers) => servers,
            Err(e) => {
                warn!("No peers to update: {}", e);
                Vec::new()
            }
        };
        let addressing = self.channels().addressing();
        report.targets = others.iter().map(|s| addressing.peer_key(s)).collect();
        for peer in &report.targets {
            self.ensure_peer(peer).await;
        }

        if !report.targets.is_empty() {
            match self
                .endpoint
                .send_request(bytes, CommunicationModule::AdminOp, &report.targets)
                .await
            {
                Ok(message_id) => {
                    report.sent = true;
                    info!("Routing table update sent to {:?}", report.targets);
                    if let Some(timeout) = self.settings.ack_timeout() {
                        report.acknowledgements = Some(self.collect_acks(message_id, timeout).await);
                    }
                }
                Err(e) => error!("Routing table update not delivered: {}", e),
            }
        }

        if report.acknowledgements.is_none() {
            tokio::time::sleep(self.settings.grace_period()).await;
        }
        report.retained = self.discard_staging(report.reloaded).await;
        info!("Routing table update finished");
        report
    }

    async fn collect_acks(&self, message_id: u64, timeout: std::time::Duration) -> Vec<(String, i32)> {
        let replies = match self.endpoint.receive_reply(message_id, timeout).await {
            Ok(replies) => replies,
            Err(e) => {
                warn!("Not every server acknowledged the update: {}", e);
                return Vec::new();
            }
        };
        replies
            .into_iter()
            .map(|reply| {
                let code = match UpdateStatus::from_bytes(&reply.data) {
                    Ok(status) => status.code(),
                    Err(Some(raw)) => raw,
                    Err(None) => i32::MIN,
                };
                if code != 0 {
                    warn!("{} failed to apply the update (status {})", reply.server, code);
                }
                (reply.server, code)
            })
            .collect()
    }

    /// Remove the staging file, or keep it aside when it failed to load
    /// and `retain_failed_staging` is set.
    async fn discard_staging(&self, loaded: bool) -> Option<PathBuf> {
        let staging = &self.paths.staging_path;
        if !loaded && self.settings.retain_failed_staging {
            let kept = failed_path(staging);
            match tokio::fs::rename(staging, &kept).await {
                Ok(()) => {
                    warn!("Kept rejected table as {}", kept.display());
                    return Some(kept);
                }
                Err(e) => warn!("Cannot keep {}: {}", staging.display(), e),
            }
        }
        remove_if_present(staging).await;
        None
    }

    async fn ensure_peer(&self, peer: &str) {
        match self.channels().ensure_channel(peer).await {
            Ok(()) => debug!("Channel to {} registered", peer),
            Err(e) if e.is_already_exists() => {}
            Err(e) => warn!("Cannot open channel to {}: {}", peer, e),
        }
    }

    /// Apply a table pushed by a peer and report the outcome.
    ///
    /// The last failing step determines the status.
    pub async fn handle_update(&self, payload: &[u8]) -> UpdateStatus {
        let receive = &self.paths.receive_staging_path;
        let mut status = UpdateStatus::Applied;

        match tokio::fs::write(receive, payload).await {
            Ok(()) => {
                if let Err(e) = self.handler.reload_mlt(receive) {
                    error!("Pushed table rejected: {}", e);
                    status = UpdateStatus::ReloadFailed;
                }
            }
            Err(e) => {
                error!("Cannot stage pushed table at {}: {}", receive.display(), e);
                status = UpdateStatus::StagingWriteFailed;
            }
        }

        let addressing = self.channels().addressing();
        let identity = self.channels().identity().to_string();
        for server in self.handler.get_server_list().unwrap_or_default() {
            let peer = addressing.peer_key(&server);
            if peer != identity {
                self.ensure_peer(&peer).await;
            }
        }

        if let Err(e) = self.handler.write_to_file(&self.paths.path) {
            error!("Cannot persist routing table to {}: {}", self.paths.path.display(), e);
            status = UpdateStatus::PersistFailed;
        }
        remove_if_present(receive).await;

        if self.migration.is_completed() {
            if let Some(regenerator) = &self.regenerator {
                info!("Updating exported configuration");
                match regenerator.regenerate(&self.handler).await {
                    Ok(()) => info!("Exported configuration updated"),
                    Err(e) => error!("Exported configuration update failed: {}", e),
                }
            }
        }
        status
    }

    /// Answer admin requests until the queue closes or `shutdown` is set.
    pub async fn serve_requests(
        &self,
        mut inbox: mpsc::Receiver<InboundMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let request = tokio::select! {
                request = self.endpoint.next_request(&mut inbox) => request,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };
            let Some(request) = request else {
                break;
            };
            self.answer(request).await;
        }
        info!("Admin request loop stopped");
    }

    async fn answer(&self, request: Request) {
        info!("Routing table update from {}", request.sender);
        let status = self.handle_update(&request.data).await;

        self.ensure_peer(&request.sender).await;
        if let Err(e) = self
            .endpoint
            .reply(
                request.message_id,
                status.to_bytes(),
                request.sending_module,
                &request.sender,
            )
            .await
        {
            warn!("Cannot answer {}: {}", request.sender, e);
        }
    }
}

fn failed_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".failed");
    PathBuf::from(name)
}

async fn remove_if_present(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("Cannot remove {}: {}", path.display(), e),
    }
}
