//! Listener and lifecycle management for the registration socket.
//!
//! Owns the rendezvous socket and converts external cancellation into
//! deterministic shutdown. The accept loop is sequential: each accepted
//! connection is driven to completion by the session engine before the next
//! accept is issued, so at most one session (and one open namespace handle)
//! exists at any time.
//!
//! Cancellation is observed only at the accept boundary. A firing token
//! stops new connections from being accepted but never interrupts a session
//! already in flight; the accept-loop task finishing is the completion
//! signal, and a supervisor must block on [`ShimHandle::wait`] rather than
//! assuming shutdown is instantaneous.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::ShimError;
use super::session::run_session;
use super::transport::PacketListener;

/// Default rendezvous socket path expected by the proxy.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/ztunnel/ztunnel.sock";

/// Directory permissions applied when the socket directory is created
/// (owner only). Pre-existing directories are never modified.
const DIRECTORY_MODE: u32 = 0o700;

/// Configuration for the registration shim listener.
#[derive(Debug, Clone)]
pub struct ShimConfig {
    /// Socket path to listen on.
    pub socket_path: PathBuf,
}

impl Default for ShimConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
        }
    }
}

impl ShimConfig {
    /// Create a config listening at the given socket path.
    #[must_use]
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }
}

/// Handle to a running shim.
///
/// The accept-loop task finishing is the shutdown-complete signal; callers
/// that cancelled the token must still wait on this handle before tearing
/// down the rest of the process.
#[derive(Debug)]
pub struct ShimHandle {
    task: JoinHandle<()>,
}

impl ShimHandle {
    /// Block until the accept loop has fully stopped and the socket file has
    /// been removed.
    pub async fn wait(self) {
        if let Err(err) = self.task.await {
            error!(error = %err, "accept loop task failed");
        }
    }
}

/// Bind the registration socket and start accepting in the background.
///
/// Setup removes any stale socket file at the configured path and recreates
/// the endpoint from scratch; nothing from a previous run is reused. The
/// returned handle is owned by the caller; there is no process-wide
/// instance. Must be called from within a tokio runtime.
///
/// # Errors
///
/// Returns an error if the socket directory cannot be created, a stale
/// socket cannot be removed, the path is occupied by a non-socket file, or
/// the bind fails. All are fatal; no session ever begins.
pub fn start(
    config: ShimConfig,
    targets: Vec<PathBuf>,
    cancel: CancellationToken,
) -> Result<ShimHandle, ShimError> {
    let socket_path = config.socket_path;

    if let Some(parent) = socket_path.parent() {
        ensure_directory(parent)?;
    }
    cleanup_socket(&socket_path)?;

    let listener = PacketListener::bind(&socket_path).map_err(|source| ShimError::Bind {
        path: socket_path.clone(),
        source,
    })?;

    info!(
        socket_path = %socket_path.display(),
        workloads = targets.len(),
        "registration shim listening"
    );

    let targets: Arc<[PathBuf]> = targets.into();
    let task = tokio::spawn(accept_loop(listener, socket_path, targets, cancel));

    Ok(ShimHandle { task })
}

/// Sequential accept loop.
///
/// Each connection is handed to the session engine and driven to DONE or
/// ERROR before the next accept; a failed session only ends that session.
async fn accept_loop(
    listener: PacketListener,
    socket_path: PathBuf,
    targets: Arc<[PathBuf]>,
    cancel: CancellationToken,
) {
    debug!("accept loop started");

    loop {
        let mut stream = tokio::select! {
            // Biased so a fired token always wins over a pending connection
            // once the current session has finished.
            biased;

            () = cancel.cancelled() => {
                info!("listener closed by cancellation");
                break;
            }
            result = listener.accept() => match result {
                Ok(stream) => stream,
                Err(err) if is_transient_accept_error(&err) => {
                    warn!(error = %err, "transient accept error, retrying");
                    continue;
                }
                Err(err) => {
                    error!(error = %err, "fatal accept error, shutting down listener");
                    break;
                }
            },
        };

        debug!("accepted proxy connection");
        match run_session(&mut stream, &targets).await {
            Ok(()) => {
                info!(workloads = targets.len(), "registration session complete");
            }
            Err(err) => {
                warn!(error = %err, "session aborted, closing connection");
            }
        }
        // The stream drops here, closing the connection in both outcomes.
    }

    drop(listener);
    remove_socket_file(&socket_path);
    debug!("accept loop stopped");
}

/// Transient accept conditions: log and keep accepting. Anything else ends
/// the loop.
fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted | io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
    )
}

/// Ensure the socket directory exists.
///
/// Created directories get mode 0700; directories that already exist are
/// left untouched, permissions included.
fn ensure_directory(path: &Path) -> Result<(), ShimError> {
    if path.exists() {
        return Ok(());
    }

    std::fs::create_dir_all(path).map_err(|source| ShimError::CreateDir {
        path: path.to_path_buf(),
        source,
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(DIRECTORY_MODE);
        std::fs::set_permissions(path, perms).map_err(|source| ShimError::SetPermissions {
            path: path.to_path_buf(),
            source,
        })?;
    }

    Ok(())
}

/// Remove a stale socket file if present, refusing to touch anything that is
/// not a socket.
fn cleanup_socket(path: &Path) -> Result<(), ShimError> {
    if !path.exists() {
        return Ok(());
    }

    let metadata = std::fs::symlink_metadata(path).map_err(|source| ShimError::Stat {
        path: path.to_path_buf(),
        source,
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        if !metadata.file_type().is_socket() {
            return Err(ShimError::NotASocket {
                path: path.to_path_buf(),
            });
        }
    }

    std::fs::remove_file(path).map_err(|source| ShimError::RemoveStale {
        path: path.to_path_buf(),
        source,
    })?;

    debug!(path = %path.display(), "removed stale socket file");
    Ok(())
}

/// Best-effort removal of the socket file once the loop has exited.
fn remove_socket_file(path: &Path) {
    if !path.exists() {
        return;
    }
    if let Err(err) = std::fs::remove_file(path) {
        warn!(path = %path.display(), error = %err, "failed to remove socket file");
    } else {
        info!(path = %path.display(), "removed socket file");
    }
}
