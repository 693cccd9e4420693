//! Request payloads and the fixed reply.
//!
//! Payload layouts (little-endian):
//!
//! ```text
//! CREATE_SCENE            [u8 len][name: len bytes]
//! DESTROY_SCENE           (empty)
//! CREATE_MEMORY           [u32 scene][u64 size]                  + 1 fd via SCM_RIGHTS
//! CREATE_DATA_OBJECT      [u32 scene][u32 memory][u64 offset][u64 length][u8 element]
//! CREATE_TEXTURE_OBJECT   [u32 scene][u32 data][u32 w][u32 h][u8 format][u8 kind]
//! CREATE_GEOMETRY_OBJECT  [u32 scene][u32 vertex][u32 normal][u32 index]
//! CREATE_MESH_COLOR       [u32 scene][u32 geometry][f32 r][f32 g][f32 b][f32 a]
//! CREATE_MESH_TEXTURE     [u32 scene][u32 geometry][u32 texture][u32 uv]
//! ATTACH_MEMORY           [u32 scene][u32 data][u8 binding]
//! DETACH_MEMORY           [u32 scene][u32 data][u8 binding]
//! DESTROY_OBJECT          [u32 scene][u32 object]
//! CREATE_PROGRAM          [u32 scene][u32 data]
//! RUN_PROGRAM             [u32 scene][u32 program][u32 register]
//! SET_SKYBOX              [u32 scene][u32 texture]
//! SET_RENDER_BUFFER       [u32 scene][u16 n][n × (u32 matrix, u32 texture, u32 geometry)]
//! UPDATE_SYSTEM_MATRIX    [u32 scene][u8 kind][u8 mode][16 × f32]
//! ```

use std::num::NonZeroU32;

use thiserror::Error;

use super::types::{
    Binding, ElementType, ErrorCode, Matrix, MatrixKind, RenderEntry, TextureFormat, TextureKind,
    UpdateMode,
};
use crate::constants::{FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE, MAX_SCENE_NAME_LEN, REPLY_SIZE};

/// Message type tag constants.
pub mod message_type {
    /// Create a scene bound to the connection.
    pub const CREATE_SCENE: u8 = 0x01;
    /// Destroy the connection's scene.
    pub const DESTROY_SCENE: u8 = 0x02;
    /// Register a shared-memory region (fd in ancillary data).
    pub const CREATE_MEMORY: u8 = 0x03;
    /// Create a typed view into a memory region.
    pub const CREATE_DATA_OBJECT: u8 = 0x04;
    /// Create a texture over a data object.
    pub const CREATE_TEXTURE_OBJECT: u8 = 0x05;
    /// Create geometry from vertex/normal/index data objects.
    pub const CREATE_GEOMETRY_OBJECT: u8 = 0x06;
    /// Attach a flat color to a geometry.
    pub const CREATE_MESH_COLOR: u8 = 0x07;
    /// Attach a texture + uv set to a geometry.
    pub const CREATE_MESH_TEXTURE: u8 = 0x08;
    /// Bind a data object for upload.
    pub const ATTACH_MEMORY: u8 = 0x09;
    /// Unbind a data object.
    pub const DETACH_MEMORY: u8 = 0x0A;
    /// Free one object.
    pub const DESTROY_OBJECT: u8 = 0x0B;
    /// Compile a matrix program from a data object.
    pub const CREATE_PROGRAM: u8 = 0x0C;
    /// Evaluate a program into a register.
    pub const RUN_PROGRAM: u8 = 0x0D;
    /// Set the scene's skybox.
    pub const SET_SKYBOX: u8 = 0x0E;
    /// Replace the scene's render buffer set.
    pub const SET_RENDER_BUFFER: u8 = 0x0F;
    /// Client-driven system matrix update.
    pub const UPDATE_SYSTEM_MATRIX: u8 = 0x10;
    /// Server → client only.
    pub const REPLY: u8 = 0xFF;

    /// Whether frames with this tag arrive with a descriptor.
    pub const fn carries_fd(tag: u8) -> bool {
        tag == CREATE_MEMORY
    }
}

/// Why a payload could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Payload ended before all fields were read.
    #[error("payload truncated: needed {needed} more bytes at offset {offset}")]
    Truncated {
        /// Offset where the read started.
        offset: usize,
        /// Bytes that were missing.
        needed: usize,
    },
    /// Payload had bytes left over after the last field.
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
    /// Payload exceeds `MAX_PAYLOAD_SIZE`.
    #[error("payload of {0} bytes exceeds the frame limit")]
    Oversized(usize),
    /// Tag is not a known request type.
    #[error("unknown message type 0x{0:02x}")]
    UnknownType(u8),
    /// A REPLY frame was sent to the server.
    #[error("REPLY is not a valid request")]
    UnexpectedReply,
    /// An enum byte was out of range.
    #[error("invalid {field} value {value}")]
    InvalidEnum {
        /// Field name.
        field: &'static str,
        /// Raw byte.
        value: u8,
    },
    /// Scene name is empty, too long or not UTF-8.
    #[error("invalid scene name")]
    InvalidName,
}

/// Why a request cannot be put on the wire as given.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    /// Scene name longer than `MAX_SCENE_NAME_LEN` bytes.
    #[error("scene name of {0} bytes is too long")]
    NameTooLong(usize),
    /// Payload would exceed `MAX_PAYLOAD_SIZE`.
    #[error("payload of {0} bytes exceeds the frame limit")]
    Oversized(usize),
}

/// A decoded client request.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Create a scene bound to the connection.
    CreateScene {
        /// Scene name.
        name: String,
    },
    /// Destroy the connection's scene.
    DestroyScene,
    /// Register a shared-memory region; the fd travels out of band.
    CreateMemory {
        /// Owning scene.
        scene: u32,
        /// Declared byte size.
        size: u64,
    },
    /// Create a typed view into a memory region.
    CreateDataObject {
        /// Owning scene.
        scene: u32,
        /// Memory region.
        memory: u32,
        /// Byte offset.
        offset: u64,
        /// Byte length.
        length: u64,
        /// Element type.
        element: ElementType,
    },
    /// Create a texture.
    CreateTextureObject {
        /// Owning scene.
        scene: u32,
        /// Backing data object.
        data: u32,
        /// Width in pixels.
        width: u32,
        /// Height in pixels.
        height: u32,
        /// Pixel format.
        format: TextureFormat,
        /// 2D or cube map.
        kind: TextureKind,
    },
    /// Create geometry.
    CreateGeometryObject {
        /// Owning scene.
        scene: u32,
        /// `vec3` positions.
        vertex: u32,
        /// `vec3` normals.
        normal: u32,
        /// Integer indices.
        index: u32,
    },
    /// Flat-colored mesh.
    CreateMeshColor {
        /// Owning scene.
        scene: u32,
        /// Geometry object.
        geometry: u32,
        /// RGBA in `[0, 1]`.
        color: [f32; 4],
    },
    /// Textured mesh.
    CreateMeshTexture {
        /// Owning scene.
        scene: u32,
        /// Geometry object.
        geometry: u32,
        /// 2D texture object.
        texture: u32,
        /// `vec2` texture coordinates.
        uv: u32,
    },
    /// Bind a data object for upload.
    AttachMemory {
        /// Owning scene.
        scene: u32,
        /// Data object.
        data: u32,
        /// Binding role.
        binding: Binding,
    },
    /// Unbind a data object.
    DetachMemory {
        /// Owning scene.
        scene: u32,
        /// Data object.
        data: u32,
        /// Binding role currently held.
        binding: Binding,
    },
    /// Free one object.
    DestroyObject {
        /// Owning scene.
        scene: u32,
        /// Object id.
        object: u32,
    },
    /// Compile a program.
    CreateProgram {
        /// Owning scene.
        scene: u32,
        /// 4-byte-element data object holding the code.
        data: u32,
    },
    /// Run a program.
    RunProgram {
        /// Owning scene.
        scene: u32,
        /// Program object.
        program: u32,
        /// `mat4` data object receiving the result.
        register: u32,
    },
    /// Set the skybox.
    SetSkybox {
        /// Owning scene.
        scene: u32,
        /// Cube-map texture object.
        texture: u32,
    },
    /// Replace the render set.
    SetRenderBuffer {
        /// Owning scene.
        scene: u32,
        /// Draw entries in order.
        entries: Vec<RenderEntry>,
    },
    /// Client-driven system matrix update.
    UpdateSystemMatrix {
        /// Owning scene.
        scene: u32,
        /// Slot.
        kind: MatrixKind,
        /// Set or multiply.
        mode: UpdateMode,
        /// Column-major matrix.
        matrix: Matrix,
    },
}

impl Request {
    /// Wire tag for this request.
    pub fn message_type(&self) -> u8 {
        use message_type as mt;
        match self {
            Self::CreateScene { .. } => mt::CREATE_SCENE,
            Self::DestroyScene => mt::DESTROY_SCENE,
            Self::CreateMemory { .. } => mt::CREATE_MEMORY,
            Self::CreateDataObject { .. } => mt::CREATE_DATA_OBJECT,
            Self::CreateTextureObject { .. } => mt::CREATE_TEXTURE_OBJECT,
            Self::CreateGeometryObject { .. } => mt::CREATE_GEOMETRY_OBJECT,
            Self::CreateMeshColor { .. } => mt::CREATE_MESH_COLOR,
            Self::CreateMeshTexture { .. } => mt::CREATE_MESH_TEXTURE,
            Self::AttachMemory { .. } => mt::ATTACH_MEMORY,
            Self::DetachMemory { .. } => mt::DETACH_MEMORY,
            Self::DestroyObject { .. } => mt::DESTROY_OBJECT,
            Self::CreateProgram { .. } => mt::CREATE_PROGRAM,
            Self::RunProgram { .. } => mt::RUN_PROGRAM,
            Self::SetSkybox { .. } => mt::SET_SKYBOX,
            Self::SetRenderBuffer { .. } => mt::SET_RENDER_BUFFER,
            Self::UpdateSystemMatrix { .. } => mt::UPDATE_SYSTEM_MATRIX,
        }
    }

    /// Scene id named in the payload, if the request is scene-scoped.
    pub fn scene(&self) -> Option<u32> {
        match self {
            Self::CreateScene { .. } | Self::DestroyScene => None,
            Self::CreateMemory { scene, .. }
            | Self::CreateDataObject { scene, .. }
            | Self::CreateTextureObject { scene, .. }
            | Self::CreateGeometryObject { scene, .. }
            | Self::CreateMeshColor { scene, .. }
            | Self::CreateMeshTexture { scene, .. }
            | Self::AttachMemory { scene, .. }
            | Self::DetachMemory { scene, .. }
            | Self::DestroyObject { scene, .. }
            | Self::CreateProgram { scene, .. }
            | Self::RunProgram { scene, .. }
            | Self::SetSkybox { scene, .. }
            | Self::SetRenderBuffer { scene, .. }
            | Self::UpdateSystemMatrix { scene, .. } => Some(*scene),
        }
    }

    /// Whether this request must arrive with exactly one descriptor.
    pub fn carries_fd(&self) -> bool {
        message_type::carries_fd(self.message_type())
    }

    /// Encode the payload (without the frame header).
    ///
    /// Fails rather than truncating a field the wire cannot carry.
    pub fn encode_payload(&self) -> Result<Vec<u8>, EncodeError> {
        let mut w = Writer::default();
        match self {
            Self::CreateScene { name } => {
                if name.len() > MAX_SCENE_NAME_LEN {
                    return Err(EncodeError::NameTooLong(name.len()));
                }
                w.u8(name.len() as u8);
                w.bytes(name.as_bytes());
            }
            Self::DestroyScene => {}
            Self::CreateMemory { scene, size } => {
                w.u32(*scene);
                w.u64(*size);
            }
            Self::CreateDataObject { scene, memory, offset, length, element } => {
                w.u32(*scene);
                w.u32(*memory);
                w.u64(*offset);
                w.u64(*length);
                w.u8(element.to_wire());
            }
            Self::CreateTextureObject { scene, data, width, height, format, kind } => {
                w.u32(*scene);
                w.u32(*data);
                w.u32(*width);
                w.u32(*height);
                w.u8(format.to_wire());
                w.u8(kind.to_wire());
            }
            Self::CreateGeometryObject { scene, vertex, normal, index } => {
                w.u32(*scene);
                w.u32(*vertex);
                w.u32(*normal);
                w.u32(*index);
            }
            Self::CreateMeshColor { scene, geometry, color } => {
                w.u32(*scene);
                w.u32(*geometry);
                for c in color {
                    w.f32(*c);
                }
            }
            Self::CreateMeshTexture { scene, geometry, texture, uv } => {
                w.u32(*scene);
                w.u32(*geometry);
                w.u32(*texture);
                w.u32(*uv);
            }
            Self::AttachMemory { scene, data, binding }
            | Self::DetachMemory { scene, data, binding } => {
                w.u32(*scene);
                w.u32(*data);
                w.u8(binding.to_wire());
            }
            Self::DestroyObject { scene, object } => {
                w.u32(*scene);
                w.u32(*object);
            }
            Self::CreateProgram { scene, data } => {
                w.u32(*scene);
                w.u32(*data);
            }
            Self::RunProgram { scene, program, register } => {
                w.u32(*scene);
                w.u32(*program);
                w.u32(*register);
            }
            Self::SetSkybox { scene, texture } => {
                w.u32(*scene);
                w.u32(*texture);
            }
            Self::SetRenderBuffer { scene, entries } => {
                let Ok(count) = u16::try_from(entries.len()) else {
                    return Err(EncodeError::Oversized(entries.len().saturating_mul(12)));
                };
                w.u32(*scene);
                w.u16(count);
                for e in entries {
                    w.u32(e.matrix);
                    w.u32(e.texture);
                    w.u32(e.geometry);
                }
            }
            Self::UpdateSystemMatrix { scene, kind, mode, matrix } => {
                w.u32(*scene);
                w.u8(kind.to_wire());
                w.u8(mode.to_wire());
                for v in matrix {
                    w.f32(*v);
                }
            }
        }
        if w.0.len() > MAX_PAYLOAD_SIZE {
            return Err(EncodeError::Oversized(w.0.len()));
        }
        Ok(w.0)
    }

    /// Encode a complete frame: `[u8 type][u16 LE len][payload]`.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        Ok(encode_frame(self.message_type(), &self.encode_payload()?))
    }
}

/// Frame an arbitrary tag and payload.
pub fn encode_frame(tag: u8, payload: &[u8]) -> Vec<u8> {
    let len = payload.len().min(u16::MAX as usize);
    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + len);
    buf.push(tag);
    buf.extend_from_slice(&(len as u16).to_le_bytes());
    buf.extend_from_slice(&payload[..len]);
    buf
}

/// Decode a request payload for the given tag.
///
/// Never allocates more than the payload itself; every variable-length
/// field is bounded by the bytes actually present.
pub fn decode_request(tag: u8, payload: &[u8]) -> Result<Request, DecodeError> {
    use message_type as mt;

    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(DecodeError::Oversized(payload.len()));
    }

    let mut r = Reader::new(payload);
    let request = match tag {
        mt::CREATE_SCENE => {
            let len = r.u8()? as usize;
            if len == 0 {
                return Err(DecodeError::InvalidName);
            }
            let raw = r.bytes(len)?;
            let Ok(name) = std::str::from_utf8(raw) else {
                return Err(DecodeError::InvalidName);
            };
            Request::CreateScene { name: name.to_owned() }
        }
        mt::DESTROY_SCENE => Request::DestroyScene,
        mt::CREATE_MEMORY => Request::CreateMemory { scene: r.u32()?, size: r.u64()? },
        mt::CREATE_DATA_OBJECT => Request::CreateDataObject {
            scene: r.u32()?,
            memory: r.u32()?,
            offset: r.u64()?,
            length: r.u64()?,
            element: r.enum_byte("element_type", ElementType::from_wire)?,
        },
        mt::CREATE_TEXTURE_OBJECT => Request::CreateTextureObject {
            scene: r.u32()?,
            data: r.u32()?,
            width: r.u32()?,
            height: r.u32()?,
            format: r.enum_byte("texture_format", TextureFormat::from_wire)?,
            kind: r.enum_byte("texture_kind", TextureKind::from_wire)?,
        },
        mt::CREATE_GEOMETRY_OBJECT => Request::CreateGeometryObject {
            scene: r.u32()?,
            vertex: r.u32()?,
            normal: r.u32()?,
            index: r.u32()?,
        },
        mt::CREATE_MESH_COLOR => Request::CreateMeshColor {
            scene: r.u32()?,
            geometry: r.u32()?,
            color: [r.f32()?, r.f32()?, r.f32()?, r.f32()?],
        },
        mt::CREATE_MESH_TEXTURE => Request::CreateMeshTexture {
            scene: r.u32()?,
            geometry: r.u32()?,
            texture: r.u32()?,
            uv: r.u32()?,
        },
        mt::ATTACH_MEMORY => Request::AttachMemory {
            scene: r.u32()?,
            data: r.u32()?,
            binding: r.enum_byte("binding", Binding::from_wire)?,
        },
        mt::DETACH_MEMORY => Request::DetachMemory {
            scene: r.u32()?,
            data: r.u32()?,
            binding: r.enum_byte("binding", Binding::from_wire)?,
        },
        mt::DESTROY_OBJECT => Request::DestroyObject { scene: r.u32()?, object: r.u32()? },
        mt::CREATE_PROGRAM => Request::CreateProgram { scene: r.u32()?, data: r.u32()? },
        mt::RUN_PROGRAM => Request::RunProgram {
            scene: r.u32()?,
            program: r.u32()?,
            register: r.u32()?,
        },
        mt::SET_SKYBOX => Request::SetSkybox { scene: r.u32()?, texture: r.u32()? },
        mt::SET_RENDER_BUFFER => {
            let scene = r.u32()?;
            let count = r.u16()? as usize;
            // Check the whole table is present before allocating for it.
            r.require(count * 12)?;
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                entries.push(RenderEntry {
                    matrix: r.u32()?,
                    texture: r.u32()?,
                    geometry: r.u32()?,
                });
            }
            Request::SetRenderBuffer { scene, entries }
        }
        mt::UPDATE_SYSTEM_MATRIX => {
            let scene = r.u32()?;
            let kind = r.enum_byte("matrix_kind", MatrixKind::from_wire)?;
            let mode = r.enum_byte("update_mode", UpdateMode::from_wire)?;
            let mut matrix = [0.0f32; 16];
            for v in &mut matrix {
                *v = r.f32()?;
            }
            Request::UpdateSystemMatrix { scene, kind, mode, matrix }
        }
        mt::REPLY => return Err(DecodeError::UnexpectedReply),
        other => return Err(DecodeError::UnknownType(other)),
    };

    r.finish()?;
    Ok(request)
}

/// The fixed `{i32 id, i32 error_code}` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    /// Allocated id, or 0 on failure.
    pub id: u32,
    /// Outcome.
    pub error: ErrorCode,
}

impl Reply {
    /// Successful reply carrying `id`.
    pub fn ok(id: NonZeroU32) -> Self {
        Self { id: id.get(), error: ErrorCode::Ok }
    }

    /// Failed reply; the id is always 0.
    pub fn error(error: ErrorCode) -> Self {
        debug_assert_ne!(error, ErrorCode::Ok);
        Self { id: 0, error }
    }

    /// Encode to the 8-byte wire form.
    pub fn encode(&self) -> [u8; REPLY_SIZE] {
        let mut buf = [0u8; REPLY_SIZE];
        buf[..4].copy_from_slice(&(self.id as i32).to_le_bytes());
        buf[4..].copy_from_slice(&self.error.to_wire().to_le_bytes());
        buf
    }

    /// Decode the 8-byte wire form.
    ///
    /// Returns `None` for an unknown error code.
    pub fn decode(buf: &[u8; REPLY_SIZE]) -> Option<Self> {
        let id = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as u32;
        let code = i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        Some(Self { id, error: ErrorCode::from_wire(code)? })
    }

    /// Convert into `Ok(id)` or `Err(code)`.
    pub fn into_result(self) -> Result<NonZeroU32, ErrorCode> {
        match (self.error, NonZeroU32::new(self.id)) {
            (ErrorCode::Ok, Some(id)) => Ok(id),
            (ErrorCode::Ok, None) => Err(ErrorCode::InvalidRequest),
            (code, _) => Err(code),
        }
    }
}

// ─── Cursor helpers ─────────────────────────────────────────────────────────

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn require(&self, n: usize) -> Result<(), DecodeError> {
        let left = self.buf.len() - self.pos;
        if left < n {
            return Err(DecodeError::Truncated { offset: self.pos, needed: n - left });
        }
        Ok(())
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        self.require(n)?;
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn f32(&mut self) -> Result<f32, DecodeError> {
        Ok(f32::from_le_bytes(self.array()?))
    }

    fn enum_byte<T>(
        &mut self,
        field: &'static str,
        parse: fn(u8) -> Option<T>,
    ) -> Result<T, DecodeError> {
        let value = self.u8()?;
        parse(value).ok_or(DecodeError::InvalidEnum { field, value })
    }

    fn finish(self) -> Result<(), DecodeError> {
        match self.buf.len() - self.pos {
            0 => Ok(()),
            n => Err(DecodeError::TrailingBytes(n)),
        }
    }
}

#[derive(Default)]
struct Writer(Vec<u8>);

impl Writer {
    fn u8(&mut self, v: u8) {
        self.0.push(v);
    }
    fn u16(&mut self, v: u16) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn u32(&mut self, v: u32) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn u64(&mut self, v: u64) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn f32(&mut self, v: f32) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn bytes(&mut self, b: &[u8]) {
        self.0.extend_from_slice(b);
    }
}
