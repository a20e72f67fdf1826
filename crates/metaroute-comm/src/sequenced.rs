//! Sequenced calls with bounded retries
//!
//! Every message starts with an 8 byte header: `u32` message type and
//! `u32` sequence number, both little endian. A response is accepted only
//! when it echoes the request's sequence number and has the expected
//! type; anything else bumps the sequence number and resends, at most
//! [`MAX_ATTEMPTS`] times.

use crate::error::{CommError, CommResult};
use crate::transport::DuplexLink;
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tracing::{debug, warn};

/// Attempts per call before giving up
pub const MAX_ATTEMPTS: u32 = 3;

/// Encoded size of [`MessageHeader`]
pub const MESSAGE_HEADER_SIZE: usize = 8;

/// Message types of the client protocol
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MsgType {
    CreateFileEinodeRequest = 0,
    CreateInodeResponse = 1,
    UpdateAttributesRequest = 2,
    UpdateAttributesResponse = 3,
    DeleteInodeRequest = 4,
    DeleteInodeResponse = 5,
    MoveEinodeRequest = 6,
    MoveEinodeResponse = 7,
    LookupInodeNumberRequest = 8,
    LookupInodeNumberResponse = 9,
    ParentInodeNumberLookupRequest = 10,
    ParentInodeNumberLookupResponse = 11,
    ParentInodeHierarchyRequest = 12,
    ParentInodeHierarchyResponse = 13,
    EinodeRequest = 14,
    FileEinodeResponse = 15,
    ReadDirRequest = 16,
    ReadDirResponse = 17,
    FallbackErrorMsg = 18,
    UnknownRequestResponse = 19,
    PopulatePrefixPermission = 20,
    UpdatePrefixPermission = 21,
    PopulatePrefixPermissionRsp = 22,
    UpdatePrefixPermissionRsp = 23,
    MltLookupRequest = 24,
    MltLookupResponse = 25,
}

impl MsgType {
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    /// Response type paired with a request type, `None` for responses.
    #[must_use]
    pub const fn expected_response(self) -> Option<Self> {
        Some(match self {
            Self::CreateFileEinodeRequest => Self::CreateInodeResponse,
            Self::UpdateAttributesRequest => Self::UpdateAttributesResponse,
            Self::DeleteInodeRequest => Self::DeleteInodeResponse,
            Self::MoveEinodeRequest => Self::MoveEinodeResponse,
            Self::LookupInodeNumberRequest => Self::LookupInodeNumberResponse,
            Self::ParentInodeNumberLookupRequest => Self::ParentInodeNumberLookupResponse,
            Self::ParentInodeHierarchyRequest => Self::ParentInodeHierarchyResponse,
            Self::EinodeRequest => Self::FileEinodeResponse,
            Self::ReadDirRequest => Self::ReadDirResponse,
            Self::PopulatePrefixPermission => Self::PopulatePrefixPermissionRsp,
            Self::UpdatePrefixPermission => Self::UpdatePrefixPermissionRsp,
            Self::MltLookupRequest => Self::MltLookupResponse,
            _ => return None,
        })
    }
}

impl TryFrom<u32> for MsgType {
    type Error = CommError;

    fn try_from(value: u32) -> CommResult<Self> {
        const ALL: [MsgType; 26] = [
            MsgType::CreateFileEinodeRequest,
            MsgType::CreateInodeResponse,
            MsgType::UpdateAttributesRequest,
            MsgType::UpdateAttributesResponse,
            MsgType::DeleteInodeRequest,
            MsgType::DeleteInodeResponse,
            MsgType::MoveEinodeRequest,
            MsgType::MoveEinodeResponse,
            MsgType::LookupInodeNumberRequest,
            MsgType::LookupInodeNumberResponse,
            MsgType::ParentInodeNumberLookupRequest,
            MsgType::ParentInodeNumberLookupResponse,
            MsgType::ParentInodeHierarchyRequest,
            MsgType::ParentInodeHierarchyResponse,
            MsgType::EinodeRequest,
            MsgType::FileEinodeResponse,
            MsgType::ReadDirRequest,
            MsgType::ReadDirResponse,
            MsgType::FallbackErrorMsg,
            MsgType::UnknownRequestResponse,
            MsgType::PopulatePrefixPermission,
            MsgType::UpdatePrefixPermission,
            MsgType::PopulatePrefixPermissionRsp,
            MsgType::UpdatePrefixPermissionRsp,
            MsgType::MltLookupRequest,
            MsgType::MltLookupResponse,
        ];
        usize::try_from(value)
            .ok()
            .and_then(|i| ALL.get(i).copied())
            .ok_or_else(|| CommError::Malformed(format!("unknown message type {value}")))
    }
}

/// Type and sequence number leading every message
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub msg_type: MsgType,
    pub seqnum: u32,
}

/// A header plus opaque body
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub header: MessageHeader,
    pub body: Bytes,
}

impl Message {
    #[must_use]
    pub const fn new(msg_type: MsgType, body: Bytes) -> Self {
        Self {
            header: MessageHeader {
                msg_type,
                seqnum: 0,
            },
            body,
        }
    }

    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MESSAGE_HEADER_SIZE + self.body.len());
        buf.put_u32_le(self.header.msg_type.as_u32());
        buf.put_u32_le(self.header.seqnum);
        buf.put_slice(&self.body);
        buf.freeze()
    }

    pub fn decode(data: &Bytes) -> CommResult<Self> {
        if data.len() < MESSAGE_HEADER_SIZE {
            return Err(CommError::Malformed(format!(
                "message of {} bytes",
                data.len()
            )));
        }
        let msg_type = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let seqnum = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        Ok(Self {
            header: MessageHeader {
                msg_type: MsgType::try_from(msg_type)?,
                seqnum,
            },
            body: data.slice(MESSAGE_HEADER_SIZE..),
        })
    }
}

/// Why a sequenced call gave up
#[derive(Debug, Error)]
pub enum CallError {
    #[error("{0:?} is not a request type")]
    NotARequest(MsgType),

    #[error("transport failed after {attempts} attempts: {source}")]
    Transport {
        attempts: u32,
        #[source]
        source: CommError,
    },

    #[error(
        "no matching response after {attempts} attempts: expected {expected:?}/{expected_seq}, last got {got}"
    )]
    ProtocolMismatch {
        attempts: u32,
        expected: MsgType,
        expected_seq: u32,
        got: String,
    },
}

impl CallError {
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::NotARequest(_) => 0,
            Self::Transport { attempts, .. } | Self::ProtocolMismatch { attempts, .. } => *attempts,
        }
    }
}

impl From<CallError> for metaroute_common::Error {
    fn from(err: CallError) -> Self {
        match err {
            CallError::NotARequest(_) => Self::InvalidOperation(err.to_string()),
            CallError::Transport { source, .. } => source.into(),
            CallError::ProtocolMismatch { .. } => Self::ProtocolMismatch(err.to_string()),
        }
    }
}

/// One link plus its sequence counter. Keep one per calling task.
pub struct SequencedCaller<L> {
    link: L,
    next_sequence: u32,
    max_attempts: u32,
}

impl<L: DuplexLink> SequencedCaller<L> {
    pub const fn new(link: L) -> Self {
        Self {
            link,
            next_sequence: 0,
            max_attempts: MAX_ATTEMPTS,
        }
    }

    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub const fn link(&self) -> &L {
        &self.link
    }

    /// Send `request` and return the matching response.
    ///
    /// `request.header.seqnum` is overwritten on every attempt and holds
    /// the last sequence number used when this returns.
    pub async fn call(&mut self, request: &mut Message) -> Result<Message, CallError> {
        let expected = request
            .header
            .msg_type
            .expected_response()
            .ok_or(CallError::NotARequest(request.header.msg_type))?;

        let mut last_transport = None;
        let mut last_got = None;
        for attempt in 1..=self.max_attempts {
            request.header.seqnum = self.next_sequence;
            match self.link.round_trip(request.encode()).await {
                Ok(raw) => match Message::decode(&raw) {
                    Ok(response)
                        if response.header.seqnum == request.header.seqnum
                            && response.header.msg_type == expected =>
                    {
                        self.next_sequence = self.next_sequence.wrapping_add(1);
                        return Ok(response);
                    }
                    Ok(response) => {
                        debug!(
                            "Attempt {}: sent seq {}, got {:?}/{}",
                            attempt,
                            request.header.seqnum,
                            response.header.msg_type,
                            response.header.seqnum
                        );
                        last_got = Some(format!(
                            "{:?}/{}",
                            response.header.msg_type, response.header.seqnum
                        ));
                    }
                    Err(e) => {
                        debug!("Attempt {}: undecodable response: {}", attempt, e);
                        last_got = Some(e.to_string());
                    }
                },
                Err(e) => {
                    warn!("Attempt {}: transport error: {}", attempt, e);
                    last_transport = Some(e);
                }
            }
            self.next_sequence = self.next_sequence.wrapping_add(1);
        }

        let attempts = self.max_attempts;
        match (last_got, last_transport) {
            (Some(got), _) => Err(CallError::ProtocolMismatch {
                attempts,
                expected,
                expected_seq: request.header.seqnum,
                got,
            }),
            (None, Some(source)) => Err(CallError::Transport { attempts, source }),
            (None, None) => Err(CallError::Transport {
                attempts,
                source: CommError::Closed,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ScriptedLink;

    fn respond(msg_type: MsgType, seqnum: u32, body: &'static [u8]) -> Bytes {
        Message {
            header: MessageHeader { msg_type, seqnum },
            body: Bytes::from_static(body),
        }
        .encode()
    }

    #[test]
    fn test_header_codec() {
        let msg = Message {
            header: MessageHeader {
                msg_type: MsgType::ReadDirRequest,
                seqnum: 7,
            },
            body: Bytes::from_static(b"dir"),
        };
        let raw = msg.encode();
        assert_eq!(&raw[..8], &[16, 0, 0, 0, 7, 0, 0, 0]);
        assert_eq!(Message::decode(&raw).unwrap(), msg);

        assert!(Message::decode(&Bytes::from_static(b"short")).is_err());
        assert!(Message::decode(&Bytes::from_static(&[99, 0, 0, 0, 0, 0, 0, 0])).is_err());
    }

    #[test]
    fn test_expected_response_pairs() {
        assert_eq!(
            MsgType::MoveEinodeRequest.expected_response(),
            Some(MsgType::MoveEinodeResponse)
        );
        assert_eq!(
            MsgType::UpdatePrefixPermission.expected_response(),
            Some(MsgType::UpdatePrefixPermissionRsp)
        );
        assert_eq!(MsgType::FallbackErrorMsg.expected_response(), None);
        assert_eq!(MsgType::ReadDirResponse.expected_response(), None);
        for raw in 0..26 {
            assert_eq!(MsgType::try_from(raw).unwrap().as_u32(), raw);
        }
    }

    #[tokio::test]
    async fn test_matching_response_on_first_attempt() {
        let link = ScriptedLink::new(|req| {
            let req = Message::decode(&req).unwrap();
            Ok(respond(MsgType::MltLookupResponse, req.header.seqnum, b"ok"))
        });
        let mut caller = SequencedCaller::new(link);
        let mut request = Message::new(MsgType::MltLookupRequest, Bytes::from_static(b"/a"));

        let response = caller.call(&mut request).await.unwrap();
        assert_eq!(response.body, "ok");
        let response = caller.call(&mut request).await.unwrap();
        assert_eq!(response.header.seqnum, 1);
        assert_eq!(caller.link().requests().len(), 2);
    }

    #[tokio::test]
    async fn test_mismatch_bumps_sequence_and_retries() {
        let mut calls = 0;
        let link = ScriptedLink::new(move |req| {
            calls += 1;
            let req = Message::decode(&req).unwrap();
            if calls < 3 {
                Ok(respond(MsgType::MltLookupResponse, req.header.seqnum + 100, b""))
            } else {
                Ok(respond(MsgType::MltLookupResponse, req.header.seqnum, b"late"))
            }
        });
        let mut caller = SequencedCaller::new(link);
        let mut request = Message::new(MsgType::MltLookupRequest, Bytes::new());

        let response = caller.call(&mut request).await.unwrap();
        assert_eq!(response.body, "late");
        assert_eq!(request.header.seqnum, 2);

        let seqs: Vec<u32> = caller
            .link()
            .requests()
            .iter()
            .map(|r| Message::decode(r).unwrap().header.seqnum)
            .collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let link = ScriptedLink::new(|req| {
            let req = Message::decode(&req).unwrap();
            Ok(respond(MsgType::FallbackErrorMsg, req.header.seqnum, b""))
        });
        let mut caller = SequencedCaller::new(link);
        let mut request = Message::new(MsgType::MltLookupRequest, Bytes::new());

        let err = caller.call(&mut request).await.unwrap_err();
        assert!(matches!(
            err,
            CallError::ProtocolMismatch {
                attempts: MAX_ATTEMPTS,
                expected: MsgType::MltLookupResponse,
                ..
            }
        ));
        assert_eq!(caller.link().requests().len(), MAX_ATTEMPTS as usize);
    }

    #[tokio::test]
    async fn test_transport_failures_keep_their_kind() {
        let link = ScriptedLink::new(|_| Err(CommError::Closed));
        let mut caller = SequencedCaller::new(link).with_max_attempts(2);
        let mut request = Message::new(MsgType::ReadDirRequest, Bytes::new());

        let err = caller.call(&mut request).await.unwrap_err();
        assert_eq!(err.attempts(), 2);
        assert!(matches!(
            err,
            CallError::Transport {
                source: CommError::Closed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_responses_cannot_be_sent_as_calls() {
        let mut caller = SequencedCaller::new(ScriptedLink::new(Ok));
        let mut request = Message::new(MsgType::ReadDirResponse, Bytes::new());
        assert!(matches!(
            caller.call(&mut request).await,
            Err(CallError::NotARequest(MsgType::ReadDirResponse))
        ));
        assert!(caller.link().requests().is_empty());
    }
}
