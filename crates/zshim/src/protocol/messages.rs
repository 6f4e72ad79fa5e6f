//! Wire messages exchanged with the proxy.
//!
//! Each message is serialized independently and occupies exactly one
//! transport datagram; there is no shared envelope beyond the `type` tag and
//! no internal length prefix. `AddWorkload` additionally carries one open
//! namespace descriptor out-of-band on the same datagram, attached by the
//! transport layer (see [`super::transport`]).
//!
//! # Message Flow
//!
//! ```text
//! Proxy                                    Shim
//!   |  -- Hello { version } ------------->   |
//!   |  <-- SnapshotSent {} ---------------   |
//!   |  -- Ack {} ------------------------>   |
//!   |  <-- AddWorkload { uid, .. } + fd --   |   (per workload)
//!   |  -- Ack {} ------------------------>   |
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::error::MAX_MESSAGE_SIZE;

/// Version declaration sent by the proxy as its first message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Hello {
    /// Protocol version the proxy speaks.
    pub version: u32,
}

/// Declares that the registrations which follow are the complete desired
/// state for this session; no reconciliation of prior state will occur.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SnapshotSent {}

/// Acknowledgement of the previous message.
///
/// Content beyond a successful decode is not inspected.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Ack {}

/// Identity fields recorded for a registered workload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct WorkloadInfo {
    /// Workload name.
    pub name: String,
    /// Workload namespace.
    pub namespace: String,
    /// Service account the workload runs as.
    pub service_account: String,
}

/// Registration of one workload.
///
/// Transmitted together with one attached descriptor referencing the
/// workload's network namespace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AddWorkload {
    /// Unique identifier for this registration.
    pub uid: String,
    /// Workload identity.
    pub workload_info: WorkloadInfo,
}

impl AddWorkload {
    /// Build a minimal registration where the uid doubles as every identity
    /// field.
    #[must_use]
    pub fn new(uid: impl Into<String>) -> Self {
        let uid = uid.into();
        Self {
            workload_info: WorkloadInfo {
                name: uid.clone(),
                namespace: uid.clone(),
                service_account: uid.clone(),
            },
            uid,
        }
    }
}

/// Tagged union over every message on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// Proxy-to-shim version declaration.
    Hello(Hello),
    /// Shim-to-proxy snapshot marker.
    SnapshotSent(SnapshotSent),
    /// Proxy-to-shim acknowledgement.
    Ack(Ack),
    /// Shim-to-proxy workload registration.
    AddWorkload(AddWorkload),
}

impl WireMessage {
    /// Short message name for log and error context.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Hello(_) => "hello",
            Self::SnapshotSent(_) => "snapshot_sent",
            Self::Ack(_) => "ack",
            Self::AddWorkload(_) => "add_workload",
        }
    }
}

impl From<Hello> for WireMessage {
    fn from(msg: Hello) -> Self {
        Self::Hello(msg)
    }
}

impl From<SnapshotSent> for WireMessage {
    fn from(msg: SnapshotSent) -> Self {
        Self::SnapshotSent(msg)
    }
}

impl From<Ack> for WireMessage {
    fn from(msg: Ack) -> Self {
        Self::Ack(msg)
    }
}

impl From<AddWorkload> for WireMessage {
    fn from(msg: AddWorkload) -> Self {
        Self::AddWorkload(msg)
    }
}

/// Message encode/decode failures.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Payload does not fit in one datagram.
    #[error("message of {size} bytes exceeds maximum {max} bytes")]
    TooLarge {
        /// Observed payload size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Message could not be serialized.
    #[error("failed to serialize message: {0}")]
    Serialize(serde_json::Error),

    /// Payload is not a valid message.
    #[error("malformed message payload: {0}")]
    Malformed(serde_json::Error),
}

/// Serialize one message for transmission as a single datagram.
///
/// # Errors
///
/// Returns an error if serialization fails or the encoded form exceeds
/// [`MAX_MESSAGE_SIZE`].
pub fn encode(msg: &WireMessage) -> Result<Vec<u8>, CodecError> {
    let payload = serde_json::to_vec(msg).map_err(CodecError::Serialize)?;
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::TooLarge {
            size: payload.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(payload)
}

/// Decode one received datagram into a message.
///
/// # Errors
///
/// Returns an error if the payload exceeds [`MAX_MESSAGE_SIZE`] or is not a
/// valid message.
pub fn decode(payload: &[u8]) -> Result<WireMessage, CodecError> {
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::TooLarge {
            size: payload.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    serde_json::from_slice(payload).map_err(CodecError::Malformed)
}

/// Generate a registration identifier from the current time.
///
/// Nanosecond resolution keeps identifiers unique within a session without
/// any shared counter state.
#[must_use]
pub fn workload_uid() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_nanos());
    format!("workload-{nanos}")
}
