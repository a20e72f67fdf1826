//! Exported filesystem configuration
//!
//! After this server took part in a partition migration, every table
//! update also rewrites the export blocks served by the co-located file
//! server and asks the privileged process to reload them.

use async_trait::async_trait;
use metaroute_common::{Error, Result, Server};
use metaroute_comm::{DuplexLink, PrivilegedChannel, PrivilegedRequest};
use metaroute_mlt::{MltHandler, PartitionEntry};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info};

const PSEUDO_PREFIX: &str = "/fs";

/// Rebuilds configuration derived from the routing table
#[async_trait]
pub trait ConfigRegenerator: Send + Sync {
    async fn regenerate(&self, handler: &MltHandler) -> Result<()>;
}

/// Whether a partition migration has completed on this server
#[derive(Debug, Default)]
pub struct MigrationState {
    completed: AtomicBool,
}

impl MigrationState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_completed(&self) {
        self.completed.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }
}

/// Writes one export block per partition
pub struct ExportConfigWriter<L> {
    path: PathBuf,
    privileged: Option<PrivilegedChannel<L>>,
    write_lock: Mutex<()>,
}

impl<L: DuplexLink> ExportConfigWriter<L> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            privileged: None,
            write_lock: Mutex::new(()),
        }
    }

    /// Notify the privileged process after every rewrite.
    #[must_use]
    pub fn with_privileged(mut self, channel: PrivilegedChannel<L>) -> Self {
        self.privileged = Some(channel);
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl<L: DuplexLink + 'static> ConfigRegenerator for ExportConfigWriter<L> {
    async fn regenerate(&self, handler: &MltHandler) -> Result<()> {
        let entries = handler.entries()?;
        let me = handler.get_my_address()?;
        let text = render_exports(&entries, &me);

        let _guard = self.write_lock.lock().await;
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, text).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        info!(
            "Wrote {} export blocks to {}",
            entries.len(),
            self.path.display()
        );

        if let Some(channel) = &self.privileged {
            let path = self.path.to_string_lossy();
            let response = channel
                .request(PrivilegedRequest::ReloadExports, path.as_bytes())
                .await?;
            if !response.is_ok() {
                return Err(Error::Internal(format!(
                    "export reload returned {}",
                    response.status
                )));
            }
            debug!("Export reload acknowledged");
        }
        Ok(())
    }
}

/// Render the export blocks for `entries` as seen from `me`.
///
/// Partitions owned by another host carry a referral to that host.
#[must_use]
pub fn render_exports(entries: &[PartitionEntry], me: &Server) -> String {
    let mut out = String::new();
    for (i, entry) in entries.iter().enumerate() {
        let pseudo = format!("{PSEUDO_PREFIX}{}", entry.path);
        let _ = write!(
            out,
            "\nEXPORT\n{{\n\
             Export_Id = {};\n\
             Pseudo = \"{pseudo}\";\n\
             Path = \"/\";\n\
             Root_Access = \"*\";\n\
             Access_Type = RW;\n\
             Access = \"*\";\n\
             SecType = \"sys\";\n\
             FS_Specific = \"{}\";\n",
            i + 1,
            entry.root_inode,
        );
        if !entry.owner.same_host(me) {
            let _ = writeln!(
                out,
                "Referral = \"{pseudo}:{pseudo}@{}\";",
                entry.owner.address
            );
        }
        out.push_str("}\n");
    }
    out
}
