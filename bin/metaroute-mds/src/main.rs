//! metaroute MDS - metadata server daemon
//!
//! Loads the routing table, keeps outbound channels to every peer, applies
//! table pushes from peers, broadcasts locally staged tables and answers
//! client lookups.

mod lookup;

use anyhow::Result;
use clap::Parser;
use lookup::LookupService;
use metaroute_admin::{ConfigRegenerator, ExportConfigWriter, ReplicationDaemon};
use metaroute_comm::{
    CommunicationModule, Dispatcher, Endpoint, InboundServer, PeerAddressing, PeerChannels,
    PrivilegedChannel, TcpConnector, TcpDuplexLink,
};
use metaroute_common::config::{ExportConfig, PeerConfig, read_ip_config};
use metaroute_common::Config;
use metaroute_mlt::MltHandler;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "metaroute-mds")]
#[command(about = "metaroute metadata server daemon")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/metaroute/mds.toml")]
    config: String,

    /// Listen address for peer channels
    #[arg(short, long)]
    listen: Option<String>,

    /// Address this server is registered under in the routing table
    #[arg(long)]
    address: Option<String>,

    /// Port this server is registered under in the routing table
    #[arg(long)]
    port: Option<u16>,

    /// Listen address for client lookups (defaults to all interfaces on
    /// the registered port; required with variable peer ports)
    #[arg(long)]
    lookup_listen: Option<String>,

    /// Canonical routing table file
    #[arg(long)]
    mlt_path: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = Config::load(&args.config)?;

    // CLI takes precedence over the config file
    if let Some(listen) = args.listen {
        config.node.listen = listen;
    }
    if let Some(address) = args.address {
        config.node.address = address;
    }
    if let Some(port) = args.port {
        config.node.port = port;
    }
    if let Some(path) = args.mlt_path {
        config.mlt.path = path;
    }
    let log_level = if args.log_level == "info" {
        config.logging.level.clone()
    } else {
        args.log_level
    };
    if let Some(lookup_listen) = args.lookup_listen {
        config.node.lookup_listen = Some(lookup_listen);
    }
    let (peer_listen, lookup_listen) = config.listen_addresses()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting metaroute MDS");
    info!("Config file: {}", args.config);

    let me = config.node.server();
    let handler = Arc::new(MltHandler::new());
    if let Err(e) = handler.read_from_file(&config.mlt.path) {
        error!(
            "Cannot load routing table from {}: {}",
            config.mlt.path.display(),
            e
        );
        std::process::exit(1);
    }
    handler.set_my_address(me.clone())?;
    info!("Serving as {} (rank {})", me, handler.get_my_rank()?);

    let addressing = PeerAddressing::from_config(&config.peers);
    let identity = addressing.peer_key(&me);
    let channels = Arc::new(PeerChannels::new(
        identity.clone(),
        addressing,
        Arc::new(TcpConnector::new(
            config.peers.max_frame_len,
            config.peers.connect_timeout(),
        )),
        config.peers.max_frame_len,
    ));

    let dispatcher = Arc::new(Dispatcher::new());
    let admin_inbox = dispatcher.register(CommunicationModule::AdminOp, 64);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let peer_listener = TcpListener::bind(&peer_listen).await?;
    let inbound = tokio::spawn(
        InboundServer::new(dispatcher, config.peers.max_frame_len)
            .serve(peer_listener, shutdown_rx.clone()),
    );

    seed_channels(&channels, &handler, &config.peers, &identity).await;

    let endpoint = Arc::new(Endpoint::new(
        CommunicationModule::AdminOp,
        Arc::clone(&channels),
    ));
    let mut daemon = ReplicationDaemon::new(
        Arc::clone(&handler),
        endpoint,
        config.mlt.clone(),
        config.replication.clone(),
    );
    if let Some(writer) = export_writer(&config.exports, &config.peers).await {
        // Exports always reflect the table this server starts with.
        if let Err(e) = writer.regenerate(&handler).await {
            warn!("Cannot write export configuration: {}", e);
        }
        daemon = daemon.with_regenerator(writer);
    }
    let daemon = Arc::new(daemon);

    let requests = {
        let daemon = Arc::clone(&daemon);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { daemon.serve_requests(admin_inbox, shutdown).await })
    };
    let broadcaster = {
        let daemon = Arc::clone(&daemon);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { daemon.run_broadcaster(shutdown).await })
    };

    let lookup_listener = TcpListener::bind(&lookup_listen).await?;
    let lookups = tokio::spawn(
        Arc::new(LookupService::new(
            Arc::clone(&handler),
            config.peers.max_frame_len,
        ))
        .serve(lookup_listener, shutdown_rx),
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    shutdown_tx.send(true)?;

    broadcaster.await?;
    requests.await?;
    if let Err(e) = inbound.await? {
        warn!("Peer listener: {}", e);
    }
    if let Err(e) = lookups.await? {
        warn!("Lookup service: {}", e);
    }
    match channels.teardown_all_channels().await {
        Ok(closed) => info!("Closed {} peer channels", closed),
        Err(e) => warn!("Channel teardown: {}", e),
    }
    Ok(())
}

/// Open channels to the peers listed in `ip_config` and to every other
/// server of the loaded table.
async fn seed_channels(
    channels: &PeerChannels,
    handler: &MltHandler,
    peers: &PeerConfig,
    identity: &str,
) {
    let mut targets = Vec::new();
    if let Some(path) = &peers.ip_config {
        match read_ip_config(path) {
            Ok(list) => targets.extend(list),
            Err(e) => warn!("Cannot read {}: {}", path.display(), e),
        }
    }
    let addressing = channels.addressing();
    match handler.get_other_servers() {
        Ok(servers) => targets.extend(servers.iter().map(|s| addressing.peer_key(s))),
        Err(e) => warn!("Cannot list peers: {}", e),
    }
    targets.retain(|peer| peer != identity);
    targets.sort();
    targets.dedup();

    let failed = channels.ensure_channels(targets.iter()).await;
    info!(
        "Peer channels: {} connected, {} failed",
        channels.connected_peers().await.len(),
        failed
    );
}

async fn export_writer(
    exports: &ExportConfig,
    peers: &PeerConfig,
) -> Option<Arc<ExportConfigWriter<TcpDuplexLink>>> {
    let path = exports.path.as_ref()?;
    let mut writer = ExportConfigWriter::new(path);
    if let Some(peer) = &exports.privileged_peer {
        match TcpDuplexLink::connect(peer, peers.max_frame_len, peers.connect_timeout()).await {
            Ok(link) => writer = writer.with_privileged(PrivilegedChannel::new(link)),
            Err(e) => warn!("Privileged peer {} unreachable: {}", peer, e),
        }
    }
    Some(Arc::new(writer))
}
