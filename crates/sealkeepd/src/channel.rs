//! Control channel listener
//!
//! A Unix socket inside the owner-only root directory. Each connection is
//! served on its own task; requests and responses are single JSON lines.
//! Callers are identified by their socket peer credentials and must run as
//! the daemon's own user.

use std::fs;
use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use sealkeep_core::protocol::{Request, Response, WireError};
use sealkeep_core::{process, Error, Paths, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};

use crate::handler::{Caller, Handler};

/// Mode of the socket file once bound
pub const SOCKET_MODE: u32 = 0o600;

pub struct ControlChannel {
    paths: Paths,
    listener: UnixListener,
    uid: u32,
}

impl ControlChannel {
    /// Verify the root directory and process file, claim the process file
    /// and bind.
    ///
    /// Fails with `PermissionDenied` before touching anything if the root
    /// directory is not owner-only or an existing process file is not 0600.
    /// Fails with `AlreadyRunning` if another daemon answers on the socket.
    pub fn bind(paths: &Paths) -> Result<Self> {
        paths.ensure_root()?;
        process::check_pid_file(&paths.pid)?;

        if accepts_connections(&paths.socket) {
            return Err(Error::AlreadyRunning(paths.socket.display().to_string()));
        }
        if let Some(pid) = process::read_pid(&paths.pid) {
            debug!("Removing stale process file for pid {}", pid);
            process::remove_pid(&paths.pid)?;
        }
        if paths.socket.exists() {
            warn!("Removing stale socket {}", paths.socket.display());
            fs::remove_file(&paths.socket)?;
        }

        process::write_pid(&paths.pid, std::process::id())?;
        let listener = match UnixListener::bind(&paths.socket) {
            Ok(listener) => listener,
            Err(e) => {
                let _ = process::remove_pid(&paths.pid);
                return Err(e.into());
            }
        };
        fs::set_permissions(&paths.socket, fs::Permissions::from_mode(SOCKET_MODE))?;

        info!("Control channel listening on {}", paths.socket.display());
        Ok(Self {
            paths: paths.clone(),
            listener,
            uid: current_uid(),
        })
    }

    /// Accept connections until `shutdown` completes, then remove the socket
    /// and process file.
    pub async fn serve(self, handler: Arc<Handler>, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let handler = handler.clone();
                        let uid = self.uid;
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, handler, uid).await {
                                debug!("Connection closed with error: {}", e);
                            }
                        });
                    }
                    Err(e) => error!("Accept failed: {}", e),
                },
            }
        }

        self.cleanup();
        Ok(())
    }

    fn cleanup(&self) {
        if let Err(e) = fs::remove_file(&self.paths.socket) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove socket: {}", e);
            }
        }
        if let Err(e) = process::remove_pid(&self.paths.pid) {
            warn!("Failed to remove process file: {}", e);
        }
        info!("Control channel closed");
    }
}

/// A daemon is live only if something is listening on its socket. The
/// recorded pid alone may have been reused by an unrelated process.
fn accepts_connections(socket: &Path) -> bool {
    socket.exists() && std::os::unix::net::UnixStream::connect(socket).is_ok()
}

fn current_uid() -> u32 {
    // SAFETY: getuid has no preconditions and cannot fail
    unsafe { libc::getuid() }
}

async fn serve_connection(stream: UnixStream, handler: Arc<Handler>, daemon_uid: u32) -> Result<()> {
    let cred = stream.peer_cred()?;
    let caller = Caller {
        uid: cred.uid(),
        pid: cred.pid(),
    };

    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let authorized = caller.uid == daemon_uid;
        let response = if !authorized {
            warn!("Rejecting request from uid {} pid {:?}", caller.uid, caller.pid);
            Response::error(WireError::from(&Error::PermissionDenied(
                "caller is not the daemon's user".to_string(),
            )))
        } else {
            match serde_json::from_str::<Request>(line) {
                Ok(request) => handler.handle(&caller, request).await,
                Err(e) => Response::error(WireError::from(&Error::InvalidRequest(format!(
                    "malformed request: {}",
                    e
                )))),
            }
        };

        let mut out = serde_json::to_vec(&response)
            .map_err(|e| Error::Internal(format!("encoding response: {}", e)))?;
        out.push(b'\n');
        writer.write_all(&out).await?;
        writer.flush().await?;

        if !authorized {
            break;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::{registry_with_account, EMAIL, PASSWORD};
    use crate::session::Session;
    use sealkeep_core::error::ErrorKind;
    use sealkeep_core::protocol::StatusReport;

    fn private_root() -> (tempfile::TempDir, Paths) {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().join("root");
        (temp, Paths::with_root(root))
    }

    fn handler() -> Arc<Handler> {
        let registry = registry_with_account();
        let session = Arc::new(Session::new(registry.clone()));
        Arc::new(Handler::new(registry, session))
    }

    async fn exchange(paths: &Paths, requests: &[Request]) -> Vec<Response> {
        let stream = UnixStream::connect(&paths.socket).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        let mut responses = Vec::new();
        for request in requests {
            let mut line = serde_json::to_vec(request).unwrap();
            line.push(b'\n');
            writer.write_all(&line).await.unwrap();
            let reply = lines.next_line().await.unwrap().unwrap();
            responses.push(serde_json::from_str(&reply).unwrap());
        }
        responses
    }

    #[tokio::test]
    async fn test_refuses_broad_root() {
        let (_temp, paths) = private_root();
        fs::create_dir(&paths.root).unwrap();
        fs::set_permissions(&paths.root, fs::Permissions::from_mode(0o755)).unwrap();

        assert!(matches!(
            ControlChannel::bind(&paths),
            Err(Error::PermissionDenied(_))
        ));
        assert!(!paths.socket.exists());
        assert!(!paths.pid.exists());
    }

    #[tokio::test]
    async fn test_bind_creates_private_root() {
        let (_temp, paths) = private_root();
        let channel = ControlChannel::bind(&paths).unwrap();

        let mode = fs::metadata(&paths.root).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);
        let mode = fs::metadata(&paths.socket).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, SOCKET_MODE);
        assert_eq!(process::read_pid(&paths.pid), Some(std::process::id()));
        drop(channel);
    }

    #[tokio::test]
    async fn test_refuses_broad_pid_file() {
        let (_temp, paths) = private_root();
        paths.ensure_root().unwrap();
        fs::write(&paths.pid, b"4242\n").unwrap();
        fs::set_permissions(&paths.pid, fs::Permissions::from_mode(0o644)).unwrap();

        assert!(matches!(
            ControlChannel::bind(&paths),
            Err(Error::PermissionDenied(_))
        ));
        assert!(!paths.socket.exists());
        assert_eq!(process::read_pid(&paths.pid), Some(4242));
    }

    #[tokio::test]
    async fn test_reused_pid_without_socket_is_stale() {
        let (_temp, paths) = private_root();
        paths.ensure_root().unwrap();
        // pid 1 is always alive but is not a daemon
        process::write_pid(&paths.pid, 1).unwrap();

        let channel = ControlChannel::bind(&paths).unwrap();
        assert_eq!(process::read_pid(&paths.pid), Some(std::process::id()));
        drop(channel);
    }

    #[tokio::test]
    async fn test_refuses_second_daemon() {
        let (_temp, paths) = private_root();
        let first = ControlChannel::bind(&paths).unwrap();

        assert!(matches!(
            ControlChannel::bind(&paths),
            Err(Error::AlreadyRunning(_))
        ));
        assert!(paths.socket.exists());
        drop(first);
    }

    #[tokio::test]
    async fn test_replaces_stale_socket() {
        let (_temp, paths) = private_root();
        paths.ensure_root().unwrap();
        fs::write(&paths.socket, b"").unwrap();
        process::write_pid(&paths.pid, u32::MAX - 1).unwrap();

        assert!(ControlChannel::bind(&paths).is_ok());
    }

    #[tokio::test]
    async fn test_serves_requests_and_cleans_up() {
        let (_temp, paths) = private_root();
        let channel = ControlChannel::bind(&paths).unwrap();
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(channel.serve(handler(), async move {
            let _ = stopped.await;
        }));

        let responses = exchange(
            &paths,
            &[
                Request::Status,
                Request::Login {
                    email: EMAIL.to_string(),
                    password: PASSWORD.to_string(),
                },
                Request::ListKeypairs {
                    org: "missing".to_string(),
                },
            ],
        )
        .await;

        let status: StatusReport =
            serde_json::from_value(responses[0].clone().into_result().unwrap()).unwrap();
        assert_eq!(status.state, "logged_out");
        let login = responses[1].clone().into_result().unwrap();
        assert_eq!(login["state"], "logged_in");
        let err = responses[2].clone().into_result().unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);

        stop.send(()).unwrap();
        server.await.unwrap().unwrap();
        assert!(!paths.socket.exists());
        assert!(!paths.pid.exists());
    }

    #[tokio::test]
    async fn test_malformed_request() {
        let (_temp, paths) = private_root();
        let channel = ControlChannel::bind(&paths).unwrap();
        let server = tokio::spawn(channel.serve(handler(), std::future::pending()));

        let mut stream = UnixStream::connect(&paths.socket).await.unwrap();
        stream.write_all(b"{\"type\":\"launch_missiles\"}\n").await.unwrap();
        let mut lines = BufReader::new(stream).lines();
        let reply = lines.next_line().await.unwrap().unwrap();
        let response: Response = serde_json::from_str(&reply).unwrap();
        assert_eq!(response.into_result().unwrap_err().kind, ErrorKind::InvalidRequest);

        server.abort();
    }
}
