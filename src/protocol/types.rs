//! Enumerations and small value types shared by the codec and the store.
//!
//! Every enum has a stable single-byte wire encoding via `from_wire` /
//! `to_wire`. Unknown bytes decode to `None` and become `INVALID_REQUEST`.

use serde::{Deserialize, Serialize};

/// Column-major 4×4 matrix as carried on the wire and stored in slots.
pub type Matrix = [f32; 16];

/// The identity matrix.
pub const IDENTITY: Matrix = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 0.0, 0.0, 1.0,
];

/// Reply error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// Request succeeded; the reply id is non-zero.
    Ok = 0,
    /// Malformed payload, wrong connection state, bad fd transfer or bounds violation.
    InvalidRequest = 1,
    /// Reference to a missing or foreign id.
    UnknownId = 2,
    /// Resource exhaustion inside the store.
    OutOfMemory = 3,
}

impl ErrorCode {
    /// Decode from the reply's `error_code` field.
    pub fn from_wire(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Ok),
            1 => Some(Self::InvalidRequest),
            2 => Some(Self::UnknownId),
            3 => Some(Self::OutOfMemory),
            _ => None,
        }
    }

    /// Wire value.
    pub fn to_wire(self) -> i32 {
        self as i32
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ok => "OK",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::UnknownId => "UNKNOWN_ID",
            Self::OutOfMemory => "OUT_OF_MEMORY",
        };
        f.write_str(s)
    }
}

impl std::error::Error for ErrorCode {}

/// Element type of a data object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    /// Unsigned 8-bit integer.
    U8,
    /// Unsigned 16-bit integer.
    U16,
    /// Unsigned 32-bit integer.
    U32,
    /// 32-bit float.
    F32,
    /// Two floats.
    Vec2,
    /// Three floats.
    Vec3,
    /// Four floats.
    Vec4,
    /// 2×2 float matrix.
    Mat2,
    /// 3×3 float matrix.
    Mat3,
    /// 4×4 float matrix.
    Mat4,
}

impl ElementType {
    /// Decode a wire byte.
    pub fn from_wire(b: u8) -> Option<Self> {
        Some(match b {
            0 => Self::U8,
            1 => Self::U16,
            2 => Self::U32,
            3 => Self::F32,
            4 => Self::Vec2,
            5 => Self::Vec3,
            6 => Self::Vec4,
            7 => Self::Mat2,
            8 => Self::Mat3,
            9 => Self::Mat4,
            _ => return None,
        })
    }

    /// Wire byte.
    pub fn to_wire(self) -> u8 {
        match self {
            Self::U8 => 0,
            Self::U16 => 1,
            Self::U32 => 2,
            Self::F32 => 3,
            Self::Vec2 => 4,
            Self::Vec3 => 5,
            Self::Vec4 => 6,
            Self::Mat2 => 7,
            Self::Mat3 => 8,
            Self::Mat4 => 9,
        }
    }

    /// Size of one element in bytes.
    pub fn size(self) -> u64 {
        match self {
            Self::U8 => 1,
            Self::U16 => 2,
            Self::U32 | Self::F32 => 4,
            Self::Vec2 => 8,
            Self::Vec3 => 12,
            Self::Vec4 | Self::Mat2 => 16,
            Self::Mat3 => 36,
            Self::Mat4 => 64,
        }
    }

    /// Whether this type can back an index buffer.
    pub fn is_index(self) -> bool {
        matches!(self, Self::U8 | Self::U16 | Self::U32)
    }
}

/// Pixel format of a texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    /// Single 8-bit channel.
    R8,
    /// 8-bit RGB.
    Rgb8,
    /// 8-bit RGBA.
    Rgba8,
    /// 8-bit BGR.
    Bgr8,
    /// 8-bit BGRA.
    Bgra8,
    /// 32-bit float RGBA.
    Rgba32F,
}

impl TextureFormat {
    /// Decode a wire byte.
    pub fn from_wire(b: u8) -> Option<Self> {
        Some(match b {
            0 => Self::R8,
            1 => Self::Rgb8,
            2 => Self::Rgba8,
            3 => Self::Bgr8,
            4 => Self::Bgra8,
            5 => Self::Rgba32F,
            _ => return None,
        })
    }

    /// Wire byte.
    pub fn to_wire(self) -> u8 {
        match self {
            Self::R8 => 0,
            Self::Rgb8 => 1,
            Self::Rgba8 => 2,
            Self::Bgr8 => 3,
            Self::Bgra8 => 4,
            Self::Rgba32F => 5,
        }
    }

    /// Bytes per pixel.
    pub fn bytes_per_pixel(self) -> u64 {
        match self {
            Self::R8 => 1,
            Self::Rgb8 | Self::Bgr8 => 3,
            Self::Rgba8 | Self::Bgra8 => 4,
            Self::Rgba32F => 16,
        }
    }
}

/// Texture dimensionality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureKind {
    /// A single 2D image.
    Flat,
    /// Six faces laid out back to back (+X, -X, +Y, -Y, +Z, -Z).
    CubeMap,
}

impl TextureKind {
    /// Decode a wire byte.
    pub fn from_wire(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Flat),
            1 => Some(Self::CubeMap),
            _ => None,
        }
    }

    /// Wire byte.
    pub fn to_wire(self) -> u8 {
        match self {
            Self::Flat => 0,
            Self::CubeMap => 1,
        }
    }

    /// Number of faces stored in the backing data.
    pub fn faces(self) -> u64 {
        match self {
            Self::Flat => 1,
            Self::CubeMap => 6,
        }
    }
}

/// Role a data object is attached under for upload by the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Binding {
    /// Vertex positions.
    Vertex,
    /// Vertex normals.
    Normal,
    /// Element indices.
    Index,
    /// Texture coordinates.
    Uv,
    /// Texel data.
    Texture,
    /// Model matrices.
    Matrix,
}

impl Binding {
    /// Decode a wire byte.
    pub fn from_wire(b: u8) -> Option<Self> {
        Some(match b {
            0 => Self::Vertex,
            1 => Self::Normal,
            2 => Self::Index,
            3 => Self::Uv,
            4 => Self::Texture,
            5 => Self::Matrix,
            _ => return None,
        })
    }

    /// Wire byte.
    pub fn to_wire(self) -> u8 {
        match self {
            Self::Vertex => 0,
            Self::Normal => 1,
            Self::Index => 2,
            Self::Uv => 3,
            Self::Texture => 4,
            Self::Matrix => 5,
        }
    }
}

/// Which system matrix slot an update targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatrixKind {
    /// Head pose from the tracker.
    Head,
    /// Body / play-space transform.
    Body,
    /// Projection matrix.
    Projection,
}

impl MatrixKind {
    /// All kinds, in wire order.
    pub const ALL: [MatrixKind; 3] = [Self::Head, Self::Body, Self::Projection];

    /// Decode a wire byte.
    pub fn from_wire(b: u8) -> Option<Self> {
        Self::ALL.get(b as usize).copied()
    }

    /// Wire byte.
    pub fn to_wire(self) -> u8 {
        match self {
            Self::Head => 0,
            Self::Body => 1,
            Self::Projection => 2,
        }
    }

    /// Parse the lowercase name used by scripts and config.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "head" => Some(Self::Head),
            "body" => Some(Self::Body),
            "projection" => Some(Self::Projection),
            _ => None,
        }
    }
}

/// How an update combines with the current slot value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateMode {
    /// Replace the slot value.
    Set,
    /// Post-multiply the slot value by the update (`slot = slot * m`).
    Multiply,
}

impl UpdateMode {
    /// Decode a wire byte.
    pub fn from_wire(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Set),
            1 => Some(Self::Multiply),
            _ => None,
        }
    }

    /// Wire byte.
    pub fn to_wire(self) -> u8 {
        match self {
            Self::Set => 0,
            Self::Multiply => 1,
        }
    }

    /// Parse the lowercase name used by scripts.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "set" => Some(Self::Set),
            "multiply" | "mul" => Some(Self::Multiply),
            _ => None,
        }
    }
}

/// One draw entry of a render buffer set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderEntry {
    /// `mat4` data object holding the model matrix.
    pub matrix: u32,
    /// Texture object, or 0 for none.
    pub texture: u32,
    /// Geometry, mesh-color or mesh-texture object.
    pub geometry: u32,
}
