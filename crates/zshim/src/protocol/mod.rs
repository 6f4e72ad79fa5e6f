//! Registration protocol implementation.
//!
//! This module implements the server side of the fixed registration
//! protocol a shared-mode traffic proxy speaks over a Unix domain socket,
//! plus the listener that accepts the proxy's connection.
//!
//! # Architecture
//!
//! The protocol stack is organized in layers:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Listener / Lifecycle            │  accept loop, cancellation
//! ├─────────────────────────────────────────┤
//! │         Session Engine                  │  hello / snapshot / register
//! ├─────────────────────────────────────────┤
//! │         Wire Messages                   │  tagged union, one per datagram
//! ├─────────────────────────────────────────┤
//! │         SEQPACKET Transport             │  boundaries + SCM_RIGHTS
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Module Overview
//!
//! - [`error`]: setup errors and protocol constants
//! - [`messages`]: wire message schema and encode/decode
//! - [`transport`]: SEQPACKET sockets and descriptor transfer
//! - [`session`]: the per-connection state machine
//! - [`listener`]: socket lifecycle and the accept loop

pub mod error;
pub mod listener;
pub mod messages;
pub mod session;
pub mod transport;

pub use error::{MAX_MESSAGE_SIZE, PROTOCOL_VERSION, ShimError};
pub use listener::{DEFAULT_SOCKET_PATH, ShimConfig, ShimHandle, start};
pub use messages::{Ack, AddWorkload, Hello, SnapshotSent, WireMessage, WorkloadInfo};
pub use session::{SessionConn, SessionError, SessionPhase, run_session};
pub use transport::{PacketListener, PacketStream};
