//! metaroute CLI - routing table administration
//!
//! Edits the canonical table file of the local server and hands finished
//! tables to the local daemon for cluster-wide replication.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use metaroute_admin::{stage_update, wait_for_pickup};
use metaroute_comm::lookup::{LookupRequest, LookupResponse, decode_body, encode_body};
use metaroute_comm::{Message, MsgType, SequencedCaller, TcpDuplexLink};
use metaroute_common::{Config, ExportId, FS_ROOT_INODE_NUMBER, InodeNumber, Server};
use metaroute_mlt::{AddOutcome, MltHandler};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "metaroute-cli")]
#[command(about = "metaroute routing table administration")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/metaroute/mds.toml")]
    config: String,

    /// Routing table file (overrides the config file)
    #[arg(long)]
    mlt_path: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new table whose root partition is owned by a server
    Init {
        /// Root server as ip:port
        server: String,
        /// Overwrite an existing table file
        #[arg(long)]
        force: bool,
    },
    /// Register a metadata server
    AddMds {
        /// Server as ip:port
        server: String,
    },
    /// Unregister a metadata server
    RemoveMds {
        /// Server as ip:port
        server: String,
    },
    /// List registered metadata servers
    ListMds,
    /// List partitions owned by this node
    ListPartitions {
        /// Show every partition instead
        #[arg(long)]
        all: bool,
    },
    /// Create a partition, or hand an existing one to another server
    AddPartition {
        /// Owning server as ip:port
        server: String,
        /// Absolute path of the partition root
        path: String,
        /// Root inode number
        inode: u64,
    },
    /// Show which partition owns a path
    Resolve {
        path: String,
        /// Ask a running server (ip:port) instead of reading the table file
        #[arg(long)]
        remote: Option<String>,
    },
    /// Stage the table for replication and wait for the daemon
    Sync {
        /// Seconds to wait for the daemon to pick the table up
        #[arg(long, default_value = "10")]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::load(&args.config)?;
    if let Some(path) = args.mlt_path {
        config.mlt.path = path;
    }
    let mlt_path = config.mlt.path.clone();
    debug!("Routing table {}", mlt_path.display());

    match args.command {
        Commands::Init { server, force } => {
            if mlt_path.exists() && !force {
                bail!("{} already exists (use --force to replace it)", mlt_path.display());
            }
            let server = Server::parse(&server)?;
            let handler = MltHandler::new();
            handler.init_new_mlt(server.clone(), ExportId::new(1), FS_ROOT_INODE_NUMBER)?;
            save(&handler, &mlt_path)?;
            println!("Created routing table, root partition on {server}");
        }
        Commands::AddMds { server } => {
            let server = Server::parse(&server)?;
            let handler = load(&mlt_path)?;
            handler.add_server(server.clone())?;
            save(&handler, &mlt_path)?;
            println!("Added {server}");
        }
        Commands::RemoveMds { server } => {
            let server = Server::parse(&server)?;
            let handler = load(&mlt_path)?;
            handler.remove_server(&server)?;
            save(&handler, &mlt_path)?;
            println!("Removed {server}");
        }
        Commands::ListMds => {
            let handler = load(&mlt_path)?;
            println!("Metadata servers");
            println!("================");
            for (rank, server) in handler.get_server_list()?.iter().enumerate() {
                println!("{rank:>4}  {server}");
            }
        }
        Commands::ListPartitions { all } => {
            let handler = load(&mlt_path)?;
            let entries = handler.entries()?;
            let mine = if all {
                None
            } else {
                handler.set_my_address(config.node.server())?;
                Some(handler.get_my_partitions()?)
            };
            println!("{:>10}  {:>7}  {:>6}  {:<21}  PATH", "INODE", "VERSION", "EXPORT", "OWNER");
            for entry in entries
                .iter()
                .filter(|e| mine.as_ref().is_none_or(|m| m.contains(&e.root_inode)))
            {
                println!(
                    "{:>10}  {:>7}  {:>6}  {:<21}  {}",
                    entry.root_inode,
                    entry.version,
                    entry.export_id,
                    entry.owner.to_string(),
                    entry.path
                );
            }
        }
        Commands::AddPartition {
            server,
            path,
            inode,
        } => {
            let server = Server::parse(&server)?;
            let handler = load(&mlt_path)?;
            let outcome =
                handler.add_new_entry(&server, ExportId::new(0), InodeNumber::new(inode), &path)?;
            save(&handler, &mlt_path)?;
            match outcome {
                AddOutcome::Inserted => println!("Partition {inode} at {path} -> {server}"),
                AddOutcome::Reassigned { version } => {
                    println!("Partition {inode} handed to {server} (version {version})");
                }
            }
        }
        Commands::Resolve { path, remote } => {
            let response = match remote {
                Some(address) => resolve_remote(&address, &path, &config).await?,
                None => resolve_local(&load(&mlt_path)?, &path)?,
            };
            print_resolution(&path, &response)?;
        }
        Commands::Sync { timeout } => {
            let handler = load(&mlt_path)?;
            let staging = &config.mlt.staging_path;
            stage_update(&handler, staging)?;
            println!("Staged table at {}", staging.display());
            if wait_for_pickup(staging, Duration::from_secs(timeout)).await? {
                println!("Replication finished");
            } else {
                bail!(
                    "daemon did not pick up {} within {timeout}s",
                    staging.display()
                );
            }
        }
    }

    Ok(())
}

fn load(path: &Path) -> Result<MltHandler> {
    let handler = MltHandler::new();
    handler
        .read_from_file(path)
        .with_context(|| format!("cannot read routing table {}", path.display()))?;
    Ok(handler)
}

fn save(handler: &MltHandler, path: &Path) -> Result<()> {
    handler
        .write_to_file(path)
        .with_context(|| format!("cannot write routing table {}", path.display()))
}

fn resolve_local(handler: &MltHandler, path: &str) -> Result<LookupResponse> {
    let (resolution, entry) = handler.resolve_entry(path)?;
    Ok(LookupResponse {
        root_inode: Some(entry.root_inode),
        owner: Some(entry.owner),
        relative_path: resolution.relative_path,
        exact: resolution.exact,
        version: entry.version,
        error: None,
    })
}

async fn resolve_remote(address: &str, path: &str, config: &Config) -> Result<LookupResponse> {
    let link = TcpDuplexLink::connect(
        address,
        config.peers.max_frame_len,
        config.peers.connect_timeout(),
    )
    .await
    .with_context(|| format!("cannot reach {address}"))?;
    let mut caller = SequencedCaller::new(link);
    let mut request = Message::new(
        MsgType::MltLookupRequest,
        encode_body(&LookupRequest {
            path: path.to_string(),
        })?,
    );
    let response = caller
        .call(&mut request)
        .await
        .with_context(|| format!("lookup at {address} failed"))?;
    Ok(decode_body(&response.body)?)
}

fn print_resolution(path: &str, response: &LookupResponse) -> Result<()> {
    if let Some(reason) = &response.error {
        bail!("cannot resolve {path}: {reason}");
    }
    let (Some(root_inode), Some(owner)) = (response.root_inode, &response.owner) else {
        bail!("cannot resolve {path}: incomplete answer");
    };
    println!("Path:      {path}");
    println!("Partition: {root_inode} (version {})", response.version);
    println!("Owner:     {owner}");
    if response.exact {
        println!("Relative:  (partition root)");
    } else {
        println!("Relative:  {}", response.relative_path);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "metaroute-cli",
            "--mlt-path",
            "/tmp/mlt",
            "add-partition",
            "10.0.0.2:1337",
            "/home",
            "2",
        ])
        .unwrap();
        assert_eq!(args.mlt_path, Some(PathBuf::from("/tmp/mlt")));
        assert!(matches!(
            args.command,
            Commands::AddPartition { inode: 2, .. }
        ));

        let args = Args::try_parse_from(["metaroute-cli", "resolve", "/a", "--remote", "h:1"])
            .unwrap();
        assert!(matches!(args.command, Commands::Resolve { remote: Some(_), .. }));
    }

    #[test]
    fn test_load_save_and_resolve_local() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mlt");
        assert!(load(&path).is_err());

        let handler = MltHandler::new();
        let b = Server::new("10.0.0.2", 1337);
        handler
            .init_new_mlt(Server::new("10.0.0.1", 1337), ExportId::new(1), FS_ROOT_INODE_NUMBER)
            .unwrap();
        handler.add_server(b.clone()).unwrap();
        handler
            .add_new_entry(&b, ExportId::new(0), InodeNumber::new(2), "/home")
            .unwrap();
        save(&handler, &path).unwrap();

        let response = resolve_local(&load(&path).unwrap(), "/home/x").unwrap();
        assert_eq!(response.owner, Some(b));
        assert_eq!(response.relative_path, "/x");
        assert!(print_resolution("/home/x", &response).is_ok());
        assert!(print_resolution("/home/x", &LookupResponse::failed("nope")).is_err());
    }
}
