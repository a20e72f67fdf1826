//! Hand-off of a new table to the local replication daemon

use metaroute_common::Result;
use metaroute_mlt::MltHandler;
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// How often [`wait_for_pickup`] checks the staging file
pub const PICKUP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Write the handler's table to the staging path the daemon watches.
pub fn stage_update(handler: &MltHandler, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    handler.write_to_file(path)?;
    info!("Staged routing table at {}", path.display());
    Ok(())
}

/// Wait until the staging file disappears, meaning the daemon finished its
/// broadcast cycle. Returns `false` when `timeout` passes first.
pub async fn wait_for_pickup(path: impl AsRef<Path>, timeout: Duration) -> Result<bool> {
    let path = path.as_ref();
    let deadline = Instant::now() + timeout;
    loop {
        if !tokio::fs::try_exists(path).await? {
            debug!("{} picked up", path.display());
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(PICKUP_POLL_INTERVAL).await;
    }
}
