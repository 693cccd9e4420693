//! Blocking client for the scene protocol.
//!
//! ```no_run
//! use vrms::client::Client;
//!
//! let mut client = Client::connect("/run/user/1000/vrms.sock")?;
//! let scene = client.create_scene("demo")?.into_result()?;
//! client.destroy_scene()?;
//! # Ok::<(), anyhow::Error>(())
//! ```

use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;

use anyhow::{Context, Result};

use crate::constants::REPLY_SIZE;
use crate::protocol::{
    Binding, ElementType, Matrix, MatrixKind, RenderEntry, Reply, Request, TextureFormat,
    TextureKind, UpdateMode,
};
use crate::server::scm;

/// One connection to the server. Each call sends one request and waits for
/// its reply.
#[derive(Debug)]
pub struct Client {
    stream: UnixStream,
}

impl Client {
    /// Connect to the server socket.
    pub fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path)
            .with_context(|| format!("Failed to connect to {}", path.display()))?;
        Ok(Self { stream })
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: UnixStream) -> Self {
        Self { stream }
    }

    /// Send any request and read its reply.
    ///
    /// `CREATE_MEMORY` needs a descriptor; use [`create_memory`](Self::create_memory).
    pub fn request(&mut self, request: &Request) -> Result<Reply> {
        let frame = request.encode().context("Request cannot be encoded")?;
        self.stream.write_all(&frame).context("Failed to send request")?;
        self.read_reply()
    }

    /// Send raw bytes (for exercising malformed input) and read one reply.
    pub fn send_raw(&mut self, bytes: &[u8]) -> Result<Reply> {
        self.stream.write_all(bytes).context("Failed to send bytes")?;
        self.read_reply()
    }

    fn read_reply(&mut self) -> Result<Reply> {
        let mut buf = [0u8; REPLY_SIZE];
        self.stream.read_exact(&mut buf).context("Failed to read reply")?;
        Reply::decode(&buf).context("Reply carried an unknown error code")
    }

    /// Create this connection's scene.
    pub fn create_scene(&mut self, name: &str) -> Result<Reply> {
        self.request(&Request::CreateScene { name: name.to_owned() })
    }

    /// Destroy this connection's scene.
    pub fn destroy_scene(&mut self) -> Result<Reply> {
        self.request(&Request::DestroyScene)
    }

    /// Share `fd` as a memory region of `size` bytes.
    ///
    /// The descriptor travels with the frame's first byte in one `sendmsg`.
    pub fn create_memory(&mut self, scene: u32, fd: impl AsFd, size: u64) -> Result<Reply> {
        let frame = Request::CreateMemory { scene, size }
            .encode()
            .context("Request cannot be encoded")?;
        let sent = scm::send_with_fd(
            self.stream.as_raw_fd(),
            &frame,
            fd.as_fd().as_raw_fd(),
        )
        .context("sendmsg with descriptor failed")?;
        if sent < frame.len() {
            self.stream.write_all(&frame[sent..]).context("Failed to send request tail")?;
        }
        self.read_reply()
    }

    /// Typed view into a memory region.
    pub fn create_data_object(
        &mut self,
        scene: u32,
        memory: u32,
        offset: u64,
        length: u64,
        element: ElementType,
    ) -> Result<Reply> {
        self.request(&Request::CreateDataObject { scene, memory, offset, length, element })
    }

    /// Texture over a data object.
    pub fn create_texture_object(
        &mut self,
        scene: u32,
        data: u32,
        width: u32,
        height: u32,
        format: TextureFormat,
        kind: TextureKind,
    ) -> Result<Reply> {
        self.request(&Request::CreateTextureObject { scene, data, width, height, format, kind })
    }

    /// Geometry from vertex/normal/index data.
    pub fn create_geometry_object(
        &mut self,
        scene: u32,
        vertex: u32,
        normal: u32,
        index: u32,
    ) -> Result<Reply> {
        self.request(&Request::CreateGeometryObject { scene, vertex, normal, index })
    }

    /// Flat-colored mesh.
    pub fn create_mesh_color(&mut self, scene: u32, geometry: u32, color: [f32; 4]) -> Result<Reply> {
        self.request(&Request::CreateMeshColor { scene, geometry, color })
    }

    /// Textured mesh.
    pub fn create_mesh_texture(
        &mut self,
        scene: u32,
        geometry: u32,
        texture: u32,
        uv: u32,
    ) -> Result<Reply> {
        self.request(&Request::CreateMeshTexture { scene, geometry, texture, uv })
    }

    /// Bind a data object.
    pub fn attach_memory(&mut self, scene: u32, data: u32, binding: Binding) -> Result<Reply> {
        self.request(&Request::AttachMemory { scene, data, binding })
    }

    /// Unbind a data object.
    pub fn detach_memory(&mut self, scene: u32, data: u32, binding: Binding) -> Result<Reply> {
        self.request(&Request::DetachMemory { scene, data, binding })
    }

    /// Destroy one object.
    pub fn destroy_object(&mut self, scene: u32, object: u32) -> Result<Reply> {
        self.request(&Request::DestroyObject { scene, object })
    }

    /// Compile a program.
    pub fn create_program(&mut self, scene: u32, data: u32) -> Result<Reply> {
        self.request(&Request::CreateProgram { scene, data })
    }

    /// Run a program into a register.
    pub fn run_program(&mut self, scene: u32, program: u32, register: u32) -> Result<Reply> {
        self.request(&Request::RunProgram { scene, program, register })
    }

    /// Set the skybox.
    pub fn set_skybox(&mut self, scene: u32, texture: u32) -> Result<Reply> {
        self.request(&Request::SetSkybox { scene, texture })
    }

    /// Replace the render set.
    pub fn set_render_buffer(&mut self, scene: u32, entries: Vec<RenderEntry>) -> Result<Reply> {
        self.request(&Request::SetRenderBuffer { scene, entries })
    }

    /// Update a scene matrix slot.
    pub fn update_system_matrix(
        &mut self,
        scene: u32,
        kind: MatrixKind,
        mode: UpdateMode,
        matrix: Matrix,
    ) -> Result<Reply> {
        self.request(&Request::UpdateSystemMatrix { scene, kind, mode, matrix })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ErrorCode, FrameDecoder};
    use std::num::NonZeroU32;

    /// Answer every frame on `peer` with OK(1), reporting fd counts.
    fn echo_server(peer: UnixStream) -> std::thread::JoinHandle<Vec<(u8, usize)>> {
        std::thread::spawn(move || {
            let mut seen = Vec::new();
            let mut decoder = FrameDecoder::new();
            let mut buf = [0u8; 4096];
            let mut writer = peer.try_clone().unwrap();
            loop {
                let got = scm::recvmsg_fds(peer.as_raw_fd(), &mut buf).unwrap();
                if got.len == 0 {
                    return seen;
                }
                for frame in decoder.feed(&buf[..got.len], got.fds) {
                    seen.push((frame.tag, frame.fds.len()));
                    let reply = Reply::ok(NonZeroU32::new(1).unwrap());
                    writer.write_all(&reply.encode()).unwrap();
                }
            }
        })
    }

    #[test]
    fn test_create_memory_sends_one_fd() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let server = echo_server(theirs);
        let mut client = Client::from_stream(ours);

        let file = tempfile::tempfile().unwrap();
        assert_eq!(client.create_scene("c").unwrap().error, ErrorCode::Ok);
        assert_eq!(client.create_memory(1, &file, 64).unwrap().into_result().unwrap().get(), 1);
        drop(client);

        let seen = server.join().unwrap();
        assert_eq!(seen, vec![(0x01, 0), (0x03, 1)]);
    }

    #[test]
    fn test_unencodable_request_is_not_sent() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let server = echo_server(theirs);
        let mut client = Client::from_stream(ours);

        assert!(client.create_scene(&"n".repeat(300)).is_err());
        let entry = RenderEntry { matrix: 1, texture: 0, geometry: 2 };
        assert!(client.set_render_buffer(1, vec![entry; 1_000]).is_err());

        // The stream stays in sync: the next request gets its own reply.
        assert_eq!(client.create_scene("short").unwrap().error, ErrorCode::Ok);
        drop(client);

        assert_eq!(server.join().unwrap(), vec![(0x01, 0)]);
    }
}
