//! Error types and constants for the registration protocol layer.
//!
//! Two failure classes cross module boundaries here:
//!
//! - [`ShimError`]: setup failures (socket directory, stale-socket removal,
//!   bind). These are fatal to startup and are returned from
//!   [`start`](super::listener::start); no session ever begins.
//! - Session failures are handled locally by the accept loop and never
//!   escalate past it; see [`SessionError`](super::session::SessionError).

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Protocol version spoken by this engine.
///
/// The connecting proxy declares its version in the Hello message; anything
/// other than an exact match aborts the session before a snapshot is sent.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum wire message size in bytes (64 KiB).
///
/// Receive buffers are sized to this, and a datagram that does not fit is
/// rejected as truncated rather than silently delivered short. Registration
/// messages are tiny; the cap exists to bound peer-controlled allocation.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Setup errors fatal to shim startup.
///
/// Every variant aborts [`start`](super::listener::start)
/// entirely; there is no retry.
#[derive(Debug, Error)]
pub enum ShimError {
    /// The socket's parent directory could not be created.
    #[error("failed to create socket directory {}: {}", .path.display(), .source)]
    CreateDir {
        /// Directory that could not be created.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// Something that is not a socket already occupies the socket path.
    ///
    /// Refusing to remove an arbitrary file guards against a misconfigured
    /// path clobbering unrelated data.
    #[error("path {} exists but is not a socket", .path.display())]
    NotASocket {
        /// The occupied path.
        path: PathBuf,
    },

    /// A stale socket file could not be removed before binding.
    #[error("failed to remove stale socket {}: {}", .path.display(), .source)]
    RemoveStale {
        /// The stale socket path.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// The listening endpoint could not be bound.
    #[error("failed to bind {}: {}", .path.display(), .source)]
    Bind {
        /// The socket path.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// Filesystem metadata for the socket path could not be read.
    #[error("failed to stat {}: {}", .path.display(), .source)]
    Stat {
        /// The inspected path.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// Restrictive permissions could not be applied to a created directory.
    #[error("failed to set permissions on {}: {}", .path.display(), .source)]
    SetPermissions {
        /// The created directory.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(PROTOCOL_VERSION, 1);
        assert_eq!(MAX_MESSAGE_SIZE, 64 * 1024);
    }

    #[test]
    fn test_error_messages_carry_path() {
        let err = ShimError::Bind {
            path: PathBuf::from("/run/proxy/registration.sock"),
            source: io::Error::new(io::ErrorKind::AddrInUse, "in use"),
        };
        let msg = err.to_string();
        assert!(msg.contains("/run/proxy/registration.sock"));
        assert!(msg.contains("in use"));
    }
}
