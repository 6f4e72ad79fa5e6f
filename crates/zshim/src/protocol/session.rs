//! Session protocol engine.
//!
//! Drives one accepted connection through the fixed registration sequence:
//!
//! ```text
//! START -> AWAIT_HELLO -> SEND_SNAPSHOT -> AWAIT_ACK
//!       -> (per target) SEND_ADD_WORKLOAD -> AWAIT_ACK
//!       -> DONE
//! ```
//!
//! The sequence is strictly linear. Any receive, decode, or send failure at
//! any step ends the session; errors propagate out of [`run_session`] as
//! early returns and the connection closes when the stream drops. Nothing is
//! retried within a session and no progress carries over to the next one.
//!
//! The engine is written against the [`SessionConn`] seam rather than the
//! concrete transport, so sequencing can be exercised with a scripted
//! connection in tests.

use std::fs::File;
use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use super::error::PROTOCOL_VERSION;
use super::messages::{self, AddWorkload, CodecError, SnapshotSent, WireMessage};
use super::transport::PacketStream;

/// Protocol step a session failure occurred in, for log context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Waiting for the peer's version declaration.
    Hello,
    /// Sending the snapshot marker.
    Snapshot,
    /// Waiting for the snapshot acknowledgement.
    SnapshotAck,
    /// Sending a workload registration.
    AddWorkload,
    /// Waiting for a workload acknowledgement.
    WorkloadAck,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Hello => "hello",
            Self::Snapshot => "snapshot",
            Self::SnapshotAck => "snapshot ack",
            Self::AddWorkload => "workload registration",
            Self::WorkloadAck => "workload ack",
        };
        f.write_str(label)
    }
}

/// Reasons a session ends before DONE.
///
/// Every variant names the phase it occurred in; the accept loop logs these
/// and resumes accepting. None of them escalate past the listener.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The peer closed the connection mid-sequence.
    #[error("peer closed the connection during {phase}")]
    PeerClosed {
        /// Step the close was observed in.
        phase: SessionPhase,
    },

    /// A receive failed.
    #[error("failed to receive {phase} message: {source}")]
    Recv {
        /// Step the receive belonged to.
        phase: SessionPhase,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// A received payload did not decode as a message.
    #[error("failed to decode {phase} message: {source}")]
    Decode {
        /// Step the payload belonged to.
        phase: SessionPhase,
        /// Underlying codec error.
        source: CodecError,
    },

    /// A well-formed message arrived out of sequence.
    #[error("unexpected {got} message during {phase}")]
    UnexpectedMessage {
        /// Step the message arrived in.
        phase: SessionPhase,
        /// Kind of the offending message.
        got: &'static str,
    },

    /// The peer declared a protocol version this engine does not speak.
    #[error("unsupported protocol version {version}, this engine speaks {PROTOCOL_VERSION}")]
    VersionMismatch {
        /// Version the peer declared.
        version: u32,
    },

    /// A registration target path could not be opened.
    #[error("failed to open workload namespace {}: {}", .path.display(), .source)]
    OpenWorkload {
        /// The target path.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// An outgoing message could not be serialized.
    #[error("failed to encode {phase} message: {source}")]
    Encode {
        /// Step the message belonged to.
        phase: SessionPhase,
        /// Underlying codec error.
        source: CodecError,
    },

    /// A send failed.
    #[error("failed to send {phase} message: {source}")]
    Send {
        /// Step the send belonged to.
        phase: SessionPhase,
        /// Underlying I/O error.
        source: io::Error,
    },
}

/// Connection capabilities the engine needs.
///
/// The registration sequence only ever sends whole messages, receives whole
/// messages, and attaches one descriptor to a send; implementations decide
/// how those map onto a transport.
pub trait SessionConn {
    /// Receive one datagram, or `None` when the peer has closed.
    fn recv(&mut self) -> impl std::future::Future<Output = io::Result<Option<Vec<u8>>>> + Send;

    /// Send one encoded message as a single datagram.
    fn send(&mut self, payload: &[u8]) -> impl std::future::Future<Output = io::Result<()>> + Send;

    /// Send one encoded message with an attached descriptor, delivered
    /// atomically with the payload.
    fn send_with_fd(
        &mut self,
        payload: &[u8],
        fd: BorrowedFd<'_>,
    ) -> impl std::future::Future<Output = io::Result<()>> + Send;
}

impl SessionConn for PacketStream {
    async fn recv(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; super::error::MAX_MESSAGE_SIZE];
        let n = PacketStream::recv(self, &mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(buf))
    }

    async fn send(&mut self, payload: &[u8]) -> io::Result<()> {
        PacketStream::send(self, payload).await
    }

    async fn send_with_fd(&mut self, payload: &[u8], fd: BorrowedFd<'_>) -> io::Result<()> {
        PacketStream::send_with_fd(self, payload, fd).await
    }
}

/// Drive one connection through the registration sequence.
///
/// On success the peer has acknowledged the snapshot marker and every
/// registration target, in order. The caller closes the connection by
/// dropping it, on success and failure alike.
///
/// # Errors
///
/// Returns the first failure encountered; the remaining sequence is
/// abandoned (a failed target does not skip to the next one).
pub async fn run_session<C: SessionConn>(
    conn: &mut C,
    targets: &[PathBuf],
) -> Result<(), SessionError> {
    let hello = match recv_message(conn, SessionPhase::Hello).await? {
        WireMessage::Hello(hello) => hello,
        other => {
            return Err(SessionError::UnexpectedMessage {
                phase: SessionPhase::Hello,
                got: other.kind(),
            })
        }
    };
    if hello.version != PROTOCOL_VERSION {
        return Err(SessionError::VersionMismatch {
            version: hello.version,
        });
    }
    debug!(version = hello.version, "received hello");

    send_message(conn, SessionPhase::Snapshot, &SnapshotSent {}.into()).await?;
    expect_ack(conn, SessionPhase::SnapshotAck).await?;

    for path in targets {
        register_workload(conn, path).await?;
        expect_ack(conn, SessionPhase::WorkloadAck).await?;
    }

    Ok(())
}

/// Open one target and send its registration with the namespace descriptor
/// attached.
///
/// The target is opened only here, at send time, and the local handle is
/// closed as soon as the send completes; from then on the peer holds the
/// only reference.
async fn register_workload<C: SessionConn>(
    conn: &mut C,
    path: &Path,
) -> Result<(), SessionError> {
    let file = File::open(path).map_err(|source| SessionError::OpenWorkload {
        path: path.to_path_buf(),
        source,
    })?;

    let add = AddWorkload::new(messages::workload_uid());
    let uid = add.uid.clone();
    let payload =
        messages::encode(&add.into()).map_err(|source| SessionError::Encode {
            phase: SessionPhase::AddWorkload,
            source,
        })?;

    conn.send_with_fd(&payload, file.as_fd())
        .await
        .map_err(|source| SessionError::Send {
            phase: SessionPhase::AddWorkload,
            source,
        })?;
    drop(file);

    debug!(uid = %uid, path = %path.display(), "sent workload registration");
    Ok(())
}

async fn recv_message<C: SessionConn>(
    conn: &mut C,
    phase: SessionPhase,
) -> Result<WireMessage, SessionError> {
    let payload = conn
        .recv()
        .await
        .map_err(|source| SessionError::Recv { phase, source })?
        .ok_or(SessionError::PeerClosed { phase })?;
    messages::decode(&payload).map_err(|source| SessionError::Decode { phase, source })
}

async fn send_message<C: SessionConn>(
    conn: &mut C,
    phase: SessionPhase,
    msg: &WireMessage,
) -> Result<(), SessionError> {
    let payload =
        messages::encode(msg).map_err(|source| SessionError::Encode { phase, source })?;
    conn.send(&payload)
        .await
        .map_err(|source| SessionError::Send { phase, source })
}

async fn expect_ack<C: SessionConn>(
    conn: &mut C,
    phase: SessionPhase,
) -> Result<(), SessionError> {
    match recv_message(conn, phase).await? {
        WireMessage::Ack(_) => Ok(()),
        other => Err(SessionError::UnexpectedMessage {
            phase,
            got: other.kind(),
        }),
    }
}
