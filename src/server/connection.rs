//! One client connection.
//!
//! ```text
//! Connected --CREATE_SCENE--> SceneActive(id) --DESTROY_SCENE--> Closed
//!     |                            |
//!     +------- EOF / idle / shutdown: scene torn down, task ends
//! ```
//!
//! `Closed` is terminal for the protocol: the socket stays open but every
//! further request is answered `INVALID_REQUEST`. Dropping the connection
//! (for any reason, including task abort) destroys the owned scene and
//! unregisters the connection.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncWriteExt, Interest};
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;

use super::registry::{ConnectionId, ConnectionRegistry, SharedRegistry};
use super::scm::{self, Received};
use crate::constants::READ_CHUNK_SIZE;
use crate::protocol::{ErrorCode, Frame, FrameDecoder, Reply, Request};
use crate::runtime::Runtime;
use crate::store::{StoreError, StoreResult};

/// Protocol state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted, no scene yet.
    Connected,
    /// Owns the given scene.
    SceneActive(u32),
    /// Scene destroyed; no further requests are served.
    Closed,
}

enum ReadOutcome {
    Data(Received),
    Eof,
    Idle,
    Failed(io::Error),
}

/// Serves requests from one client socket.
pub struct Connection {
    id: ConnectionId,
    stream: UnixStream,
    runtime: Arc<dyn Runtime>,
    registry: SharedRegistry,
    state: ConnectionState,
    decoder: FrameDecoder,
    idle_timeout: Option<Duration>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Wrap an accepted stream. The id must already be registered.
    pub fn new(
        id: ConnectionId,
        stream: UnixStream,
        runtime: Arc<dyn Runtime>,
        registry: SharedRegistry,
        idle_timeout: Option<Duration>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id,
            stream,
            runtime,
            registry,
            state: ConnectionState::Connected,
            decoder: FrameDecoder::new(),
            idle_timeout,
            shutdown,
        }
    }

    /// Current protocol state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Read, dispatch and reply until EOF, idle timeout, I/O error or
    /// shutdown. Teardown happens when `self` drops at the end.
    pub async fn run(mut self) {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];

        'read: loop {
            let outcome = tokio::select! {
                () = self.shutdown.cancelled() => {
                    log::debug!("[server] {}: server shutting down", self.id);
                    break;
                }
                outcome = read_chunk(&self.stream, &mut buf, self.idle_timeout) => outcome,
            };

            let received = match outcome {
                ReadOutcome::Data(received) => received,
                ReadOutcome::Eof => {
                    log::info!("[server] {}: disconnected", self.id);
                    break;
                }
                ReadOutcome::Idle => {
                    log::info!("[server] {}: idle for {:?}, closing", self.id, self.idle_timeout);
                    break;
                }
                ReadOutcome::Failed(e) => {
                    log::warn!("[server] {}: read failed: {e}", self.id);
                    break;
                }
            };

            let frames = self.decoder.feed_received(
                &buf[..received.len],
                received.fds,
                received.truncated,
            );
            for frame in frames {
                let reply = self.handle(frame);
                if let Err(e) = self.stream.write_all(&reply.encode()).await {
                    log::info!("[server] {}: write failed: {e}", self.id);
                    break 'read;
                }
            }
        }
    }

    /// Validate one frame and dispatch it.
    pub fn handle(&mut self, frame: Frame) -> Reply {
        let Frame { tag, request, fds, fds_truncated } = frame;

        let request = match request {
            Ok(request) => request,
            Err(e) => {
                log::warn!("[server] {}: rejected frame 0x{tag:02x}: {e}", self.id);
                return Reply::error(ErrorCode::InvalidRequest);
            }
        };

        if self.state == ConnectionState::Closed {
            log::debug!("[server] {}: request 0x{tag:02x} after scene destroyed", self.id);
            return Reply::error(ErrorCode::InvalidRequest);
        }

        let expected_fds = usize::from(request.carries_fd());
        if fds_truncated || fds.len() != expected_fds {
            log::warn!(
                "[server] {}: 0x{tag:02x} carried {} descriptors (expected {expected_fds}{})",
                self.id,
                fds.len(),
                if fds_truncated { ", control data truncated" } else { "" }
            );
            return Reply::error(ErrorCode::InvalidRequest);
        }

        match self.dispatch(request, fds.into_iter().next()) {
            Ok(id) => Reply::ok(id),
            Err(e) => {
                log::debug!("[server] {}: 0x{tag:02x} failed: {e}", self.id);
                Reply::error(e.code())
            }
        }
    }

    fn dispatch(&mut self, request: Request, fd: Option<OwnedFd>) -> StoreResult {
        let rt = Arc::clone(&self.runtime);

        match request {
            Request::CreateScene { name } => {
                if let ConnectionState::SceneActive(scene) = self.state {
                    return Err(StoreError::InvalidRequest(format!(
                        "connection already owns scene {scene}"
                    )));
                }
                let id = rt.create_scene(&name)?;
                self.state = ConnectionState::SceneActive(id.get());
                self.registry().set_scene(self.id, Some(id.get()));
                log::info!("[server] {}: scene {id} ({name:?}) active", self.id);
                Ok(id)
            }
            Request::DestroyScene => {
                let ConnectionState::SceneActive(scene) = self.state else {
                    return Err(StoreError::InvalidRequest("no active scene".into()));
                };
                let id = rt.destroy_scene(scene)?;
                self.state = ConnectionState::Closed;
                self.registry().set_scene(self.id, None);
                Ok(id)
            }
            request => {
                let requested = request.scene().unwrap_or(0);
                match self.state {
                    ConnectionState::SceneActive(own) if own == requested => {}
                    _ => return Err(StoreError::UnknownId(requested)),
                }
                dispatch_scoped(rt.as_ref(), request, fd)
            }
        }
    }

    fn registry(&self) -> MutexGuard<'_, ConnectionRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let ConnectionState::SceneActive(scene) = self.state {
            if let Some(summary) = self.runtime.scene_summary(scene) {
                if let Ok(json) = serde_json::to_string(&summary) {
                    log::debug!("[server] {}: releasing {json}", self.id);
                }
            }
            match self.runtime.destroy_scene(scene) {
                Ok(_) => log::info!("[server] {}: tore down scene {scene}", self.id),
                Err(e) => log::warn!("[server] {}: teardown of scene {scene}: {e}", self.id),
            }
        }
        self.state = ConnectionState::Closed;
        self.registry().unregister(self.id);
    }
}

/// Route a scene-scoped request whose scene id has been checked.
fn dispatch_scoped(rt: &dyn Runtime, request: Request, fd: Option<OwnedFd>) -> StoreResult {
    match request {
        Request::CreateMemory { scene, size } => {
            let fd = fd.ok_or_else(|| StoreError::InvalidRequest("missing descriptor".into()))?;
            rt.create_memory(scene, fd, size)
        }
        Request::CreateDataObject { scene, memory, offset, length, element } => {
            rt.create_data_object(scene, memory, offset, length, element)
        }
        Request::CreateTextureObject { scene, data, width, height, format, kind } => {
            rt.create_texture_object(scene, data, width, height, format, kind)
        }
        Request::CreateGeometryObject { scene, vertex, normal, index } => {
            rt.create_geometry_object(scene, vertex, normal, index)
        }
        Request::CreateMeshColor { scene, geometry, color } => {
            rt.create_mesh_color(scene, geometry, color)
        }
        Request::CreateMeshTexture { scene, geometry, texture, uv } => {
            rt.create_mesh_texture(scene, geometry, texture, uv)
        }
        Request::AttachMemory { scene, data, binding } => rt.attach_memory(scene, data, binding),
        Request::DetachMemory { scene, data, binding } => rt.detach_memory(scene, data, binding),
        Request::DestroyObject { scene, object } => rt.destroy_object(scene, object),
        Request::CreateProgram { scene, data } => rt.create_program(scene, data),
        Request::RunProgram { scene, program, register } => {
            rt.run_program(scene, program, register)
        }
        Request::SetSkybox { scene, texture } => rt.set_skybox(scene, texture),
        Request::SetRenderBuffer { scene, entries } => rt.set_render_buffer(scene, entries),
        Request::UpdateSystemMatrix { scene, kind, mode, matrix } => {
            rt.update_system_matrix(scene, kind, mode, matrix)
        }
        Request::CreateScene { .. } | Request::DestroyScene => {
            Err(StoreError::InvalidRequest("not a scene-scoped request".into()))
        }
    }
}

async fn read_chunk(stream: &UnixStream, buf: &mut [u8], idle: Option<Duration>) -> ReadOutcome {
    let fd = stream.as_raw_fd();
    loop {
        let read = stream.async_io(Interest::READABLE, || scm::recvmsg_fds(fd, &mut *buf));
        let result = match idle {
            Some(window) => match tokio::time::timeout(window, read).await {
                Ok(result) => result,
                Err(_) => return ReadOutcome::Idle,
            },
            None => read.await,
        };
        return match result {
            Ok(received) if received.len == 0 => ReadOutcome::Eof,
            Ok(received) => ReadOutcome::Data(received),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => ReadOutcome::Failed(e),
        };
    }
}
