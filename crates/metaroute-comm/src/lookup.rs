//! Bodies of the table lookup messages
//!
//! Carried in [`MsgType::MltLookupRequest`](crate::MsgType::MltLookupRequest)
//! and [`MsgType::MltLookupResponse`](crate::MsgType::MltLookupResponse).

use crate::error::{CommError, CommResult};
use bytes::Bytes;
use metaroute_common::{InodeNumber, Server};
use serde::{Deserialize, Serialize};

/// Which partition owns `path`?
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupRequest {
    pub path: String,
}

/// Answer to a [`LookupRequest`]
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupResponse {
    pub root_inode: Option<InodeNumber>,
    pub owner: Option<Server>,
    pub relative_path: String,
    pub exact: bool,
    pub version: u64,
    /// Set when the lookup failed on the serving side
    pub error: Option<String>,
}

impl LookupResponse {
    #[must_use]
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
            ..Self::default()
        }
    }
}

pub fn encode_body<T: Serialize>(body: &T) -> CommResult<Bytes> {
    bincode::serialize(body)
        .map(Bytes::from)
        .map_err(|e| CommError::Malformed(format!("encode: {e}")))
}

pub fn decode_body<T: for<'de> Deserialize<'de>>(data: &[u8]) -> CommResult<T> {
    bincode::deserialize(data).map_err(|e| CommError::Malformed(format!("decode: {e}")))
}
