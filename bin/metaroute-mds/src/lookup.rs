//! Routing table lookups for clients
//!
//! Clients hold one connection each and send sequenced messages; every
//! request frame gets exactly one response frame.

use bytes::Bytes;
use metaroute_comm::lookup::{LookupRequest, LookupResponse, decode_body, encode_body};
use metaroute_comm::transport::{read_frame, write_frame};
use metaroute_comm::{CommResult, Message, MessageHeader, MsgType};
use metaroute_mlt::MltHandler;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct LookupService {
    handler: Arc<MltHandler>,
    max_frame_len: usize,
}

impl LookupService {
    pub const fn new(handler: Arc<MltHandler>, max_frame_len: usize) -> Self {
        Self {
            handler,
            max_frame_len,
        }
    }

    /// Build the response frame for one raw request frame.
    pub fn respond(&self, raw: &Bytes) -> Bytes {
        let request = match Message::decode(raw) {
            Ok(request) => request,
            Err(e) => {
                debug!("Undecodable lookup request: {}", e);
                return Message::new(MsgType::FallbackErrorMsg, Bytes::new()).encode();
            }
        };

        let seqnum = request.header.seqnum;
        let (msg_type, body) = match request.header.msg_type {
            MsgType::MltLookupRequest => lookup_reply(self.lookup(&request.body)),
            other => {
                debug!("Unsupported request {:?}", other);
                (MsgType::UnknownRequestResponse, Bytes::new())
            }
        };
        Message {
            header: MessageHeader { msg_type, seqnum },
            body,
        }
        .encode()
    }

    fn lookup(&self, body: &[u8]) -> CommResult<Bytes> {
        let response = match decode_body::<LookupRequest>(body) {
            Ok(request) => self.resolve(&request.path),
            Err(e) => LookupResponse::failed(e.to_string()),
        };
        encode_body(&response)
    }

    fn resolve(&self, path: &str) -> LookupResponse {
        match self.handler.resolve_entry(path) {
            Ok((resolution, entry)) => LookupResponse {
                root_inode: Some(entry.root_inode),
                owner: Some(entry.owner),
                relative_path: resolution.relative_path,
                exact: resolution.exact,
                version: entry.version,
                error: None,
            },
            Err(e) => {
                if e.is_fatal() {
                    warn!("Lookup of {} failed: {}", path, e);
                } else {
                    debug!("Lookup of {} failed: {}", path, e);
                }
                LookupResponse::failed(e.to_string())
            }
        }
    }

    /// Serve clients until `shutdown` flips to true.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> CommResult<()> {
        info!("Lookup service on {}", listener.local_addr()?);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!("Accept failed: {}", e);
                            continue;
                        }
                    };
                    let service = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = service.handle_connection(stream, addr).await {
                            debug!("Lookup client {} gone: {}", addr, e);
                        }
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Lookup service stopping");
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream, addr: SocketAddr) -> CommResult<()> {
        debug!("Lookup client {} connected", addr);
        while let Some(raw) = read_frame(&mut stream, self.max_frame_len).await? {
            let response = self.respond(&raw);
            write_frame(&mut stream, &response, self.max_frame_len).await?;
        }
        Ok(())
    }
}

/// Type and body of the answer to a lookup whose response was encoded
/// into `encoded`.
fn lookup_reply(encoded: CommResult<Bytes>) -> (MsgType, Bytes) {
    match encoded {
        Ok(body) => (MsgType::MltLookupResponse, body),
        Err(e) => {
            warn!("Cannot encode lookup response: {}", e);
            (MsgType::FallbackErrorMsg, Bytes::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metaroute_comm::{SequencedCaller, TcpDuplexLink};
    use metaroute_common::{ExportId, InodeNumber, Server};
    use std::time::Duration;

    fn service() -> LookupService {
        let handler = Arc::new(MltHandler::new());
        let b = Server::new("10.0.0.2", 1337);
        handler
            .init_new_mlt(Server::new("10.0.0.1", 1337), ExportId::new(1), InodeNumber::new(1))
            .unwrap();
        handler.add_server(b.clone()).unwrap();
        handler
            .add_new_entry(&b, ExportId::new(2), InodeNumber::new(2), "/home")
            .unwrap();
        LookupService::new(handler, 1 << 16)
    }

    fn request(path: &str, seqnum: u32) -> Bytes {
        Message {
            header: MessageHeader {
                msg_type: MsgType::MltLookupRequest,
                seqnum,
            },
            body: encode_body(&LookupRequest {
                path: path.to_string(),
            })
            .unwrap(),
        }
        .encode()
    }

    #[test]
    fn test_lookup_resolves_owner() {
        let raw = service().respond(&request("/home/x", 9));
        let response = Message::decode(&raw).unwrap();
        assert_eq!(response.header.msg_type, MsgType::MltLookupResponse);
        assert_eq!(response.header.seqnum, 9);

        let body: LookupResponse = decode_body(&response.body).unwrap();
        assert_eq!(body.root_inode, Some(InodeNumber::new(2)));
        assert_eq!(body.owner, Some(Server::new("10.0.0.2", 1337)));
        assert_eq!(body.relative_path, "/x");
        assert!(!body.exact);
        assert!(body.error.is_none());
    }

    #[test]
    fn test_lookup_reports_errors_in_body() {
        let raw = service().respond(&request("relative", 1));
        let body: LookupResponse = decode_body(&Message::decode(&raw).unwrap().body).unwrap();
        assert!(body.error.is_some());

        let empty = LookupService::new(Arc::new(MltHandler::new()), 1024);
        let raw = empty.respond(&request("/", 1));
        let body: LookupResponse = decode_body(&Message::decode(&raw).unwrap().body).unwrap();
        assert!(body.error.is_some());
    }

    #[test]
    fn test_unknown_and_garbage_requests() {
        let service = service();
        let raw = Message {
            header: MessageHeader {
                msg_type: MsgType::ReadDirRequest,
                seqnum: 4,
            },
            body: Bytes::new(),
        }
        .encode();
        let response = Message::decode(&service.respond(&raw)).unwrap();
        assert_eq!(response.header.msg_type, MsgType::UnknownRequestResponse);
        assert_eq!(response.header.seqnum, 4);

        let response = Message::decode(&service.respond(&Bytes::from_static(b"xx"))).unwrap();
        assert_eq!(response.header.msg_type, MsgType::FallbackErrorMsg);
    }

    #[test]
    fn test_encode_failure_is_not_an_empty_answer() {
        let (msg_type, body) =
            lookup_reply(Err(metaroute_comm::CommError::Malformed("encode".into())));
        assert_eq!(msg_type, MsgType::FallbackErrorMsg);
        assert!(body.is_empty());

        let (msg_type, body) = lookup_reply(Ok(Bytes::from_static(b"ok")));
        assert_eq!(msg_type, MsgType::MltLookupResponse);
        assert_eq!(body, "ok");
    }

    #[test]
    fn test_lookup_of_partition_root_returns_full_path() {
        let raw = service().respond(&request("/home/", 2));
        let body: LookupResponse = decode_body(&Message::decode(&raw).unwrap().body).unwrap();
        assert!(body.exact);
        assert_eq!(body.relative_path, "/home");
        assert_eq!(body.version, 0);
    }

    #[tokio::test]
    async fn test_sequenced_lookup_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let (stop_tx, stop_rx) = watch::channel(false);
        let server = tokio::spawn(Arc::new(service()).serve(listener, stop_rx));

        let link = TcpDuplexLink::connect(&address, 1 << 16, Duration::from_secs(5))
            .await
            .unwrap();
        let mut caller = SequencedCaller::new(link);
        for path in ["/home", "/etc"] {
            let mut msg = Message::new(
                MsgType::MltLookupRequest,
                encode_body(&LookupRequest {
                    path: path.to_string(),
                })
                .unwrap(),
            );
            let response = caller.call(&mut msg).await.unwrap();
            let body: LookupResponse = decode_body(&response.body).unwrap();
            assert!(body.owner.is_some());
        }

        stop_tx.send(true).unwrap();
        server.await.unwrap().unwrap();
    }
}
