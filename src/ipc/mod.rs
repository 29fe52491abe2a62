//! A tiny newline-delimited-JSON Unix-socket protocol so a CLI invocation
//! can wake a running daemon's supervisors immediately, instead of relying
//! solely on the poll-interval fallback.

pub mod messages;

use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

pub use messages::{DaemonMessage, DaemonResponse};

pub fn default_socket_path(data_dir: &Path) -> PathBuf {
    data_dir.join("forge.sock")
}

/// Bind a listener at `path`, removing any stale socket file first.
pub fn bind(path: &Path) -> std::io::Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    UnixListener::bind(path)
}

/// Read one `DaemonMessage` from a connection and write back one `DaemonResponse`.
pub async fn handle_connection(stream: UnixStream, handler: impl FnOnce(DaemonMessage) -> DaemonResponse) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    if let Some(line) = lines.next_line().await? {
        let response = match serde_json::from_str::<DaemonMessage>(&line) {
            Ok(msg) => handler(msg),
            Err(e) => DaemonResponse::Error { message: e.to_string() },
        };
        let mut payload = serde_json::to_string(&response)?;
        payload.push('\n');
        writer.write_all(payload.as_bytes()).await?;
    }
    Ok(())
}

/// Best-effort client: connect to `path` and send `message`, returning the
/// daemon's response. Connection failure (daemon not running) is not an
/// error to the caller — the poll fallback guarantees eventual pickup.
pub async fn notify(path: &Path, message: DaemonMessage) -> Option<DaemonResponse> {
    debug!(?path, ?message, "ipc::notify: called");
    let stream = match UnixStream::connect(path).await {
        Ok(s) => s,
        Err(e) => {
            debug!(error = %e, "ipc::notify: daemon not reachable, relying on poll fallback");
            return None;
        }
    };
    let (reader, mut writer) = stream.into_split();
    let mut payload = match serde_json::to_string(&message) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "ipc::notify: failed to serialize message");
            return None;
        }
    };
    payload.push('\n');
    if writer.write_all(payload.as_bytes()).await.is_err() {
        return None;
    }
    let mut lines = BufReader::new(reader).lines();
    match lines.next_line().await {
        Ok(Some(line)) => serde_json::from_str(&line).ok(),
        _ => None,
    }
}
