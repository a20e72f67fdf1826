//! Message envelopes
//!
//! Every message on a peer channel starts with a one byte receiver tag and
//! a one byte sender tag. Request/reply traffic carries a second header
//! inside the payload:
//!
//! ```text
//! [receiver u8][sender u8][message_id u64 LE][kind u8][data ...]
//! ```

use crate::error::{CommError, CommResult};
use crate::module::CommunicationModule;
use bytes::{BufMut, Bytes, BytesMut};

/// Size of the module tag pair
pub const ENVELOPE_HEADER_SIZE: usize = 2;

/// Size of the message id and kind
pub const FRAME_HEADER_SIZE: usize = 8 + 1;

/// Module tags plus payload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub receiver: CommunicationModule,
    pub sender: CommunicationModule,
    pub payload: Bytes,
}

impl Envelope {
    pub fn new(
        receiver: CommunicationModule,
        sender: CommunicationModule,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            receiver,
            sender,
            payload: payload.into(),
        }
    }

    /// Encode, refusing messages above `max_len` and reporting allocation
    /// failure instead of aborting.
    pub fn encode(&self, max_len: usize) -> CommResult<Bytes> {
        let len = ENVELOPE_HEADER_SIZE + self.payload.len();
        if len > max_len {
            return Err(CommError::MessageTooLarge { len, max: max_len });
        }
        let mut buf = Vec::new();
        buf.try_reserve_exact(len)
            .map_err(|e| CommError::NoMemory(format!("{len} byte message: {e}")))?;
        buf.push(self.receiver.as_u8());
        buf.push(self.sender.as_u8());
        buf.extend_from_slice(&self.payload);
        Ok(Bytes::from(buf))
    }

    pub fn decode(data: &Bytes) -> CommResult<Self> {
        if data.len() < ENVELOPE_HEADER_SIZE {
            return Err(CommError::Malformed(format!(
                "envelope of {} bytes",
                data.len()
            )));
        }
        Ok(Self {
            receiver: CommunicationModule::try_from(data[0])?,
            sender: CommunicationModule::try_from(data[1])?,
            payload: data.slice(ENVELOPE_HEADER_SIZE..),
        })
    }
}

/// Whether a frame starts an exchange or answers one
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Request = 0,
    Reply = 1,
}

/// Message id header used for request/reply pairing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub message_id: u64,
    pub kind: FrameKind,
    pub data: Bytes,
}

impl Frame {
    #[must_use]
    pub fn request(message_id: u64, data: Bytes) -> Self {
        Self {
            message_id,
            kind: FrameKind::Request,
            data,
        }
    }

    #[must_use]
    pub fn reply(message_id: u64, data: Bytes) -> Self {
        Self {
            message_id,
            kind: FrameKind::Reply,
            data,
        }
    }

    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.data.len());
        buf.put_u64_le(self.message_id);
        buf.put_u8(self.kind as u8);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    pub fn decode(data: &Bytes) -> CommResult<Self> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(CommError::Malformed(format!("frame of {} bytes", data.len())));
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&data[..8]);
        let kind = match data[8] {
            0 => FrameKind::Request,
            1 => FrameKind::Reply,
            other => return Err(CommError::Malformed(format!("unknown frame kind {other}"))),
        };
        Ok(Self {
            message_id: u64::from_le_bytes(id),
            kind,
            data: data.slice(FRAME_HEADER_SIZE..),
        })
    }
}
