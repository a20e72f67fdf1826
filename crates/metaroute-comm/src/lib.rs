//! metaroute Comm - request/reply channels
//!
//! Layers, bottom up:
//!
//! - [`transport`]: length prefixed frames over TCP, behind the
//!   [`Connector`] / [`Link`] traits ([`memory`] provides an in-process
//!   implementation)
//! - [`envelope`]: the `[receiver][sender][payload]` tag pair and the
//!   message id header used to pair replies with requests
//! - [`PeerChannels`]: one outbound channel per peer, serialized sends
//! - [`InboundServer`] and [`Dispatcher`]: accept peer connections and
//!   route messages to per module queues
//! - [`Endpoint`]: request/reply bookkeeping for one module
//! - [`PrivilegedChannel`]: single outstanding call to the co-located
//!   privileged process
//! - [`sequenced`]: bounded retry calls with sequence numbers

pub mod channels;
pub mod endpoint;
pub mod envelope;
pub mod error;
pub mod lookup;
pub mod memory;
pub mod module;
pub mod privileged;
pub mod sequenced;
pub mod server;
pub mod transport;

pub use channels::{PeerAddressing, PeerChannels};
pub use endpoint::{Endpoint, Reply, Request};
pub use envelope::{Envelope, Frame, FrameKind};
pub use error::{CommError, CommResult};
pub use module::CommunicationModule;
pub use privileged::{PrivilegedChannel, PrivilegedRequest};
pub use sequenced::{CallError, Message, MessageHeader, MsgType, SequencedCaller};
pub use server::{Dispatcher, InboundMessage, InboundServer};
pub use transport::{Connector, DuplexLink, Link, TcpConnector, TcpDuplexLink};
