//! Scene object kinds.

use serde::Serialize;

use super::memory::Memory;
use super::program::Program;
use crate::protocol::{Binding, ElementType, TextureFormat, TextureKind};

/// Typed view into a memory region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataObject {
    /// Backing memory id.
    pub memory: u32,
    /// Byte offset into the memory.
    pub offset: u64,
    /// Byte length.
    pub length: u64,
    /// Element type.
    pub element: ElementType,
    /// Upload binding, if attached.
    pub binding: Option<Binding>,
}

impl DataObject {
    /// Bytes per element.
    pub fn stride(&self) -> u64 {
        self.element.size()
    }

    /// Number of elements.
    pub fn count(&self) -> u64 {
        self.length / self.stride()
    }
}

/// Image over a data object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureObject {
    /// Backing data object.
    pub data: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Pixel format.
    pub format: TextureFormat,
    /// 2D or cube map.
    pub kind: TextureKind,
}

/// Indexed triangle geometry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeometryObject {
    /// `vec3` positions.
    pub vertex: u32,
    /// `vec3` normals.
    pub normal: u32,
    /// Integer indices.
    pub index: u32,
}

/// Geometry drawn with a flat color.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshColor {
    /// Geometry object.
    pub geometry: u32,
    /// RGBA in `[0, 1]`.
    pub color: [f32; 4],
}

/// Geometry drawn with a texture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshTexture {
    /// Geometry object.
    pub geometry: u32,
    /// 2D texture object.
    pub texture: u32,
    /// `vec2` coordinates.
    pub uv: u32,
}

/// Anything a scene can hold under an object id.
#[derive(Debug)]
pub enum Object {
    /// Shared-memory region.
    Memory(Memory),
    /// Typed view.
    Data(DataObject),
    /// Texture.
    Texture(TextureObject),
    /// Geometry.
    Geometry(GeometryObject),
    /// Color mesh.
    MeshColor(MeshColor),
    /// Texture mesh.
    MeshTexture(MeshTexture),
    /// Matrix program.
    Program(Program),
}

/// Object kind, for summaries and error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    /// [`Object::Memory`]
    Memory,
    /// [`Object::Data`]
    Data,
    /// [`Object::Texture`]
    Texture,
    /// [`Object::Geometry`]
    Geometry,
    /// [`Object::MeshColor`]
    MeshColor,
    /// [`Object::MeshTexture`]
    MeshTexture,
    /// [`Object::Program`]
    Program,
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Memory => "memory",
            Self::Data => "data object",
            Self::Texture => "texture",
            Self::Geometry => "geometry",
            Self::MeshColor => "mesh color",
            Self::MeshTexture => "mesh texture",
            Self::Program => "program",
        };
        f.write_str(s)
    }
}

impl Object {
    /// This object's kind.
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Memory(_) => ObjectKind::Memory,
            Self::Data(_) => ObjectKind::Data,
            Self::Texture(_) => ObjectKind::Texture,
            Self::Geometry(_) => ObjectKind::Geometry,
            Self::MeshColor(_) => ObjectKind::MeshColor,
            Self::MeshTexture(_) => ObjectKind::MeshTexture,
            Self::Program(_) => ObjectKind::Program,
        }
    }

    /// Ids of the objects this one depends on.
    pub fn references(&self) -> Vec<u32> {
        match self {
            Self::Memory(_) => Vec::new(),
            Self::Data(d) => vec![d.memory],
            Self::Texture(t) => vec![t.data],
            Self::Geometry(g) => vec![g.vertex, g.normal, g.index],
            Self::MeshColor(m) => vec![m.geometry],
            Self::MeshTexture(m) => vec![m.geometry, m.texture, m.uv],
            Self::Program(p) => vec![p.data],
        }
    }

    /// Whether this object can be drawn as the geometry of a render entry.
    pub fn is_drawable(&self) -> bool {
        matches!(self, Self::Geometry(_) | Self::MeshColor(_) | Self::MeshTexture(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_object_count() {
        let d = DataObject {
            memory: 1,
            offset: 0,
            length: 48,
            element: ElementType::Vec3,
            binding: None,
        };
        assert_eq!(d.stride(), 12);
        assert_eq!(d.count(), 4);
    }

    #[test]
    fn test_references() {
        let mesh = Object::MeshTexture(MeshTexture { geometry: 4, texture: 5, uv: 6 });
        assert_eq!(mesh.references(), vec![4, 5, 6]);
        assert!(mesh.is_drawable());
        assert!(!Object::Data(DataObject {
            memory: 1,
            offset: 0,
            length: 4,
            element: ElementType::U32,
            binding: None,
        })
        .is_drawable());
    }
}
