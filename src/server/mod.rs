//! Protocol server.
//!
//! Listens on a Unix stream socket, registers each accepted connection and
//! runs it as a task on the current reactor. All scene mutations go through
//! the shared [`Runtime`].

pub mod connection;
pub mod registry;
pub mod scm;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UnixListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::constants::MAX_SOCKET_PATH;
use crate::runtime::Runtime;

pub use connection::{Connection, ConnectionState};
pub use registry::{ConnectionId, ConnectionInfo, ConnectionRegistry, SharedRegistry};

/// Server settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Listening socket path.
    pub socket_path: PathBuf,
    /// Close connections silent for this long. `None` disables.
    pub idle_timeout: Option<Duration>,
}

/// Bound listener plus everything the accept loop needs.
pub struct Server {
    listener: UnixListener,
    socket_path: PathBuf,
    runtime: Arc<dyn Runtime>,
    registry: SharedRegistry,
    idle_timeout: Option<Duration>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("socket_path", &self.socket_path)
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Bind the listening socket.
    ///
    /// Removes a stale socket file, creates the parent directory and
    /// restricts the socket to its owner (0600). Must be called inside a
    /// tokio runtime.
    pub fn bind(config: &ServerConfig, runtime: Arc<dyn Runtime>) -> Result<Self> {
        let socket_path = config.socket_path.clone();
        prepare_socket_path(&socket_path)?;

        let listener = std::os::unix::net::UnixListener::bind(&socket_path)
            .with_context(|| format!("Failed to bind socket: {}", socket_path.display()))?;

        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&socket_path, perms)
                .with_context(|| format!("Failed to chmod socket: {}", socket_path.display()))?;
        }

        listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(listener)?;

        log::info!("[server] listening on {}", socket_path.display());

        Ok(Self {
            listener,
            socket_path,
            runtime,
            registry: Arc::new(Mutex::new(ConnectionRegistry::new())),
            idle_timeout: config.idle_timeout,
            shutdown: CancellationToken::new(),
        })
    }

    /// Token that stops [`run`](Self::run) when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Shared connection registry.
    pub fn registry(&self) -> SharedRegistry {
        Arc::clone(&self.registry)
    }

    /// Listening socket path.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept and serve connections until shutdown or a fatal accept error.
    ///
    /// On return every connection has torn down its scene and the socket
    /// file has been removed.
    pub async fn run(self) -> Result<()> {
        let mut tasks = JoinSet::new();
        let mut fatal = None;

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let id = self
                            .registry
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .register();
                        log::info!("[server] {id}: connected");
                        let conn = Connection::new(
                            id,
                            stream,
                            Arc::clone(&self.runtime),
                            Arc::clone(&self.registry),
                            self.idle_timeout,
                            self.shutdown.child_token(),
                        );
                        tasks.spawn(conn.run());
                    }
                    Err(e) if is_transient_accept_error(&e) => {
                        log::debug!("[server] transient accept error: {e}");
                    }
                    Err(e) => {
                        log::error!("[server] accept failed: {e}");
                        fatal = Some(e);
                        break;
                    }
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        log::error!("[server] connection task failed: {e}");
                    }
                }
            }
        }

        self.shutdown.cancel();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                log::error!("[server] connection task failed: {e}");
            }
        }

        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != io::ErrorKind::NotFound {
                log::warn!("[server] failed to remove {}: {e}", self.socket_path.display());
            }
        }
        log::info!("[server] stopped");

        match fatal {
            Some(e) => Err(e).context("accept loop failed"),
            None => Ok(()),
        }
    }
}

/// Validate the path length, remove a stale socket and create the parent.
pub fn prepare_socket_path(socket_path: &Path) -> Result<()> {
    let path_len = socket_path.as_os_str().len();
    if path_len >= MAX_SOCKET_PATH {
        anyhow::bail!(
            "Socket path too long ({path_len} bytes, max {}): {}",
            MAX_SOCKET_PATH - 1,
            socket_path.display()
        );
    }

    if socket_path.exists() {
        std::fs::remove_file(socket_path)
            .with_context(|| format!("Failed to remove stale socket: {}", socket_path.display()))?;
    }

    if let Some(parent) = socket_path.parent() {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    Ok(())
}

/// Accept errors that only affect one pending connection.
fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
        || e.raw_os_error() == Some(libc::ECONNABORTED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ErrorCode, Reply, Request};
    use crate::runtime::SharedRuntime;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn start(dir: &Path, idle: Option<Duration>) -> (Arc<dyn Runtime>, Server) {
        let runtime: Arc<dyn Runtime> = Arc::new(SharedRuntime::default());
        let config = ServerConfig { socket_path: dir.join("vrms.sock"), idle_timeout: idle };
        let server = Server::bind(&config, Arc::clone(&runtime)).unwrap();
        (runtime, server)
    }

    async fn roundtrip(stream: &mut tokio::net::UnixStream, request: &Request) -> Reply {
        stream.write_all(&request.encode().unwrap()).await.unwrap();
        let mut buf = [0u8; 8];
        stream.read_exact(&mut buf).await.unwrap();
        Reply::decode(&buf).unwrap()
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_socket_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::TempDir::new().unwrap();
        let (_rt, server) = start(tmp.path(), None);
        let mode = std::fs::metadata(server.socket_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_stale_socket_replaced_and_parent_created() {
        let tmp = tempfile::TempDir::new().unwrap();
        let nested = tmp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("vrms.sock"), b"stale").unwrap();
        let (_rt, server) = start(&nested, None);
        assert!(server.socket_path().exists());
    }

    #[test]
    fn test_long_path_rejected() {
        let long = PathBuf::from(format!("/tmp/{}/vrms.sock", "x".repeat(MAX_SOCKET_PATH)));
        assert!(prepare_socket_path(&long).is_err());
    }

    #[test]
    fn test_transient_errors() {
        assert!(is_transient_accept_error(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(is_transient_accept_error(&io::Error::from_raw_os_error(libc::ECONNABORTED)));
        assert!(!is_transient_accept_error(&io::Error::from_raw_os_error(libc::EMFILE)));
    }

    #[tokio::test]
    async fn test_create_scene_over_socket() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (runtime, server) = start(tmp.path(), None);
        let path = server.socket_path().to_path_buf();
        let token = server.shutdown_token();
        let handle = tokio::spawn(server.run());

        let mut stream = tokio::net::UnixStream::connect(&path).await.unwrap();
        let reply = roundtrip(&mut stream, &Request::CreateScene { name: "S1".into() }).await;
        let scene = reply.into_result().unwrap().get();
        assert_eq!(runtime.scene_ids(), vec![scene]);

        token.cancel();
        handle.await.unwrap().unwrap();
        assert!(runtime.scene_ids().is_empty(), "shutdown tears down scenes");
        assert!(!path.exists(), "socket file removed");
    }

    #[tokio::test]
    async fn test_disconnect_reclaims_scene() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (runtime, server) = start(tmp.path(), None);
        let path = server.socket_path().to_path_buf();
        let registry = server.registry();
        let token = server.shutdown_token();
        let handle = tokio::spawn(server.run());

        let mut stream = tokio::net::UnixStream::connect(&path).await.unwrap();
        roundtrip(&mut stream, &Request::CreateScene { name: "gone".into() }).await;
        assert_eq!(runtime.scene_ids().len(), 1);
        drop(stream);

        wait_until(|| runtime.scene_ids().is_empty()).await;
        wait_until(|| registry.lock().unwrap().is_empty()).await;

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_oversized_frame_answered_and_stream_continues() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (runtime, server) = start(tmp.path(), None);
        let path = server.socket_path().to_path_buf();
        let token = server.shutdown_token();
        let handle = tokio::spawn(server.run());

        let mut stream = tokio::net::UnixStream::connect(&path).await.unwrap();
        let big = crate::protocol::encode_frame(0x01, &vec![b'x'; 4000]);
        stream.write_all(&big).await.unwrap();
        let mut buf = [0u8; 8];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(Reply::decode(&buf), Some(Reply::error(ErrorCode::InvalidRequest)));
        assert!(runtime.scene_ids().is_empty(), "no partial scene");

        let reply = roundtrip(&mut stream, &Request::CreateScene { name: "after".into() }).await;
        assert!(reply.into_result().is_ok());

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_idle_connection_closed() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (runtime, server) = start(tmp.path(), Some(Duration::from_millis(100)));
        let path = server.socket_path().to_path_buf();
        let token = server.shutdown_token();
        let handle = tokio::spawn(server.run());

        let mut stream = tokio::net::UnixStream::connect(&path).await.unwrap();
        roundtrip(&mut stream, &Request::CreateScene { name: "idle".into() }).await;

        // Server closes its end; we observe EOF.
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        wait_until(|| runtime.scene_ids().is_empty()).await;

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_replies_in_request_order() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (_runtime, server) = start(tmp.path(), None);
        let path = server.socket_path().to_path_buf();
        let token = server.shutdown_token();
        let handle = tokio::spawn(server.run());

        let mut stream = tokio::net::UnixStream::connect(&path).await.unwrap();
        let mut batch = Request::CreateScene { name: "one".into() }.encode().unwrap();
        batch.extend(Request::CreateScene { name: "two".into() }.encode().unwrap());
        batch.extend(Request::DestroyScene.encode().unwrap());
        stream.write_all(&batch).await.unwrap();

        let mut replies = Vec::new();
        for _ in 0..3 {
            let mut buf = [0u8; 8];
            stream.read_exact(&mut buf).await.unwrap();
            replies.push(Reply::decode(&buf).unwrap());
        }
        assert_eq!(replies[0].error, ErrorCode::Ok);
        assert_eq!(replies[1], Reply::error(ErrorCode::InvalidRequest));
        assert_eq!(replies[2].id, replies[0].id);

        token.cancel();
        handle.await.unwrap().unwrap();
    }
}
