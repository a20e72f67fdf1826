//! On-disk routing table format
//!
//! ```text
//! +--------+---------+-------------+----------------------+--------+
//! | magic  | version | payload len | bincode(snapshot)    | crc32c |
//! | u32 LE | u16 LE  | u32 LE      | payload len bytes    | u32 LE |
//! +--------+---------+-------------+----------------------+--------+
//! ```
//!
//! The snapshot stores registry slots in slot order (free slots included)
//! and entries in insertion order, so a table read back resolves and ranks
//! servers exactly like the one that was written.

use crate::registry::ServerRegistry;
use crate::table::{PartitionEntry, RoutingTable};
use metaroute_common::{Error, InodeNumber, Result, Server};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Magic number for routing table files ("MLT1")
const MLT_MAGIC: u32 = 0x4D4C_5431;

/// Current format version
const MLT_FORMAT_VERSION: u16 = 1;

/// magic + version + payload length
const HEADER_SIZE: usize = 4 + 2 + 4;

const TRAILER_SIZE: usize = 4;

#[derive(Serialize, Deserialize)]
struct TableSnapshot {
    root: InodeNumber,
    servers: Vec<Option<Server>>,
    entries: Vec<PartitionEntry>,
}

/// Serialize a table into its file representation.
pub fn encode(table: &RoutingTable) -> Result<Vec<u8>> {
    let snapshot = TableSnapshot {
        root: table.root(),
        servers: table.registry().slots().to_vec(),
        entries: table.entries().into_iter().cloned().collect(),
    };
    let payload = bincode::serialize(&snapshot).map_err(|e| Error::serialization(e.to_string()))?;
    let payload_len = u32::try_from(payload.len())
        .map_err(|_| Error::ResourceExhausted(format!("table of {} bytes", payload.len())))?;

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len() + TRAILER_SIZE);
    buf.extend_from_slice(&MLT_MAGIC.to_le_bytes());
    buf.extend_from_slice(&MLT_FORMAT_VERSION.to_le_bytes());
    buf.extend_from_slice(&payload_len.to_le_bytes());
    buf.extend_from_slice(&payload);
    buf.extend_from_slice(&crc32c::crc32c(&payload).to_le_bytes());
    Ok(buf)
}

/// Parse and validate a table from its file representation.
pub fn decode(data: &[u8]) -> Result<RoutingTable> {
    if data.len() < HEADER_SIZE + TRAILER_SIZE {
        return Err(Error::corrupted(format!("{} bytes is too short", data.len())));
    }

    let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    if magic != MLT_MAGIC {
        return Err(Error::corrupted(format!("bad magic {magic:#010x}")));
    }
    let version = u16::from_le_bytes([data[4], data[5]]);
    if version != MLT_FORMAT_VERSION {
        return Err(Error::corrupted(format!("unsupported format version {version}")));
    }
    let payload_len = u32::from_le_bytes([data[6], data[7], data[8], data[9]]) as usize;
    if data.len() != HEADER_SIZE + payload_len + TRAILER_SIZE {
        return Err(Error::corrupted(format!(
            "length mismatch: header says {payload_len} payload bytes, file has {}",
            data.len() - HEADER_SIZE - TRAILER_SIZE
        )));
    }

    let payload = &data[HEADER_SIZE..HEADER_SIZE + payload_len];
    let trailer = &data[HEADER_SIZE + payload_len..];
    let stored = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let computed = crc32c::crc32c(payload);
    if stored != computed {
        return Err(Error::corrupted(format!(
            "checksum mismatch: stored {stored:#010x}, computed {computed:#010x}"
        )));
    }

    let snapshot: TableSnapshot =
        bincode::deserialize(payload).map_err(|e| Error::corrupted(e.to_string()))?;
    RoutingTable::from_parts(
        ServerRegistry::from_slots(snapshot.servers),
        snapshot.root,
        snapshot.entries,
    )
}

/// Read a table from `path`.
pub fn read_file(path: impl AsRef<Path>) -> Result<RoutingTable> {
    let path = path.as_ref();
    let data = fs::read(path)?;
    let table = decode(&data)?;
    debug!(
        "Read routing table from {} ({} partitions, {} servers)",
        path.display(),
        table.len(),
        table.registry().len()
    );
    Ok(table)
}

/// Write a table to `path`. The bytes go to a sibling temporary file that
/// is renamed over the target, so readers see either the old or the new
/// table.
pub fn write_file(table: &RoutingTable, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let data = encode(table)?;
    let tmp = temp_path(path);

    let result = (|| -> std::io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }

    debug!("Wrote routing table to {} ({} bytes)", path.display(), data.len());
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}
