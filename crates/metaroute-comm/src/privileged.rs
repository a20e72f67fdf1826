//! Channel to the co-located privileged process
//!
//! The privileged peer serves one request at a time over a single link.
//! Requests are a `u32` little endian kind followed by the body; the reply
//! is an `i32` little endian status followed by an optional body.

use crate::error::{CommError, CommResult};
use crate::transport::DuplexLink;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::sync::Mutex;
use tracing::debug;

/// Operations the privileged peer understands
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PrivilegedRequest {
    AccessCounter = 0,
    Swaps = 1,
    PopulatePrefixPerm = 2,
    UpdatePrefixPerm = 3,
    ReloadExports = 4,
}

impl PrivilegedRequest {
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self as u32
    }
}

/// Response from the privileged peer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrivilegedResponse {
    pub status: i32,
    pub body: Bytes,
}

impl PrivilegedResponse {
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.status == 0
    }
}

/// Single outstanding call to the privileged peer
pub struct PrivilegedChannel<L> {
    link: Mutex<L>,
}

impl<L: DuplexLink> PrivilegedChannel<L> {
    pub fn new(link: L) -> Self {
        Self {
            link: Mutex::new(link),
        }
    }

    /// Send one raw payload and wait for the raw response.
    ///
    /// Concurrent callers are serialized, so responses always pair with
    /// the request that produced them.
    pub async fn call(&self, payload: Bytes) -> CommResult<Bytes> {
        let mut link = self.link.lock().await;
        link.round_trip(payload).await
    }

    /// Issue a typed request.
    pub async fn request(
        &self,
        kind: PrivilegedRequest,
        body: &[u8],
    ) -> CommResult<PrivilegedResponse> {
        let mut buf = BytesMut::with_capacity(4 + body.len());
        buf.put_u32_le(kind.as_u32());
        buf.put_slice(body);

        let mut response = self.call(buf.freeze()).await?;
        if response.len() < 4 {
            return Err(CommError::Malformed(format!(
                "privileged response of {} bytes",
                response.len()
            )));
        }
        let status = response.get_i32_le();
        debug!("Privileged {:?} returned {}", kind, status);
        Ok(PrivilegedResponse {
            status,
            body: response,
        })
    }
}
