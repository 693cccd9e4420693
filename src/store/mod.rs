//! Scene object store.
//!
//! The store owns every scene and, through each scene, every object. A
//! scene's objects live in one map keyed by id, so destroying the scene drops
//! everything below it (memory mappings and descriptors included) in one go.
//!
//! Every operation validates first and mutates last: on error nothing has
//! changed. Callers outside this module go through [`crate::runtime`], which
//! serializes access behind a mutex.

pub mod matrix;
pub mod memory;
pub mod objects;
pub mod program;

use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::os::fd::OwnedFd;

use serde::Serialize;
use thiserror::Error;

use crate::constants::DEFAULT_MAX_OBJECTS_PER_SCENE;
use crate::protocol::{
    Binding, ElementType, ErrorCode, Matrix, MatrixKind, RenderEntry, TextureFormat, TextureKind,
    UpdateMode, IDENTITY,
};

pub use memory::Memory;
pub use objects::{
    DataObject, GeometryObject, MeshColor, MeshTexture, Object, ObjectKind, TextureObject,
};
pub use program::Program;

/// Why a store operation was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Malformed or inconsistent request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Reference to an id that does not exist in the named scene.
    #[error("unknown id {0}")]
    UnknownId(u32),
    /// Resource exhaustion.
    #[error("out of memory: {0}")]
    OutOfMemory(String),
}

impl StoreError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidRequest(reason.into())
    }

    /// Wire error code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidRequest(_) => ErrorCode::InvalidRequest,
            Self::UnknownId(_) => ErrorCode::UnknownId,
            Self::OutOfMemory(_) => ErrorCode::OutOfMemory,
        }
    }
}

/// Result of a store operation: the affected id on success.
pub type StoreResult = Result<NonZeroU32, StoreError>;

/// A client scene and everything it owns.
#[derive(Debug)]
pub struct Scene {
    name: String,
    objects: BTreeMap<u32, Object>,
    next_object: u32,
    skybox: Option<u32>,
    render_set: Vec<RenderEntry>,
    matrices: BTreeMap<MatrixKind, Matrix>,
}

impl Scene {
    fn new(name: String) -> Self {
        Self {
            name,
            objects: BTreeMap::new(),
            next_object: 1,
            skybox: None,
            render_set: Vec::new(),
            matrices: BTreeMap::new(),
        }
    }

    /// Scene name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up any object.
    pub fn object(&self, id: u32) -> Option<&Object> {
        self.objects.get(&id)
    }

    /// All objects in id order.
    pub fn objects(&self) -> impl Iterator<Item = (u32, &Object)> {
        self.objects.iter().map(|(id, obj)| (*id, obj))
    }

    /// Current skybox texture.
    pub fn skybox(&self) -> Option<u32> {
        self.skybox
    }

    /// Current render set.
    pub fn render_set(&self) -> &[RenderEntry] {
        &self.render_set
    }

    /// Scene-local matrix slot, if written.
    pub fn local_matrix(&self, kind: MatrixKind) -> Option<Matrix> {
        self.matrices.get(&kind).copied()
    }

    fn get(&self, id: u32) -> Result<&Object, StoreError> {
        self.objects.get(&id).ok_or(StoreError::UnknownId(id))
    }

    fn memory(&self, id: u32) -> Result<&Memory, StoreError> {
        match self.get(id)? {
            Object::Memory(m) => Ok(m),
            other => Err(wrong_kind(id, other.kind(), ObjectKind::Memory)),
        }
    }

    fn data(&self, id: u32) -> Result<&DataObject, StoreError> {
        match self.get(id)? {
            Object::Data(d) => Ok(d),
            other => Err(wrong_kind(id, other.kind(), ObjectKind::Data)),
        }
    }

    fn data_of(&self, id: u32, element: ElementType) -> Result<&DataObject, StoreError> {
        let d = self.data(id)?;
        if d.element != element {
            return Err(StoreError::invalid(format!(
                "data object {id} is {:?}, expected {element:?}",
                d.element
            )));
        }
        Ok(d)
    }

    /// A model matrix is float data holding at least one mat4.
    fn model_matrix(&self, id: u32) -> Result<&DataObject, StoreError> {
        let d = self.data(id)?;
        if d.element.is_index() || d.length < ElementType::Mat4.size() {
            return Err(StoreError::invalid(format!(
                "data object {id} ({:?}, {} bytes) cannot hold a mat4",
                d.element, d.length
            )));
        }
        Ok(d)
    }

    fn texture(&self, id: u32) -> Result<&TextureObject, StoreError> {
        match self.get(id)? {
            Object::Texture(t) => Ok(t),
            other => Err(wrong_kind(id, other.kind(), ObjectKind::Texture)),
        }
    }

    fn geometry(&self, id: u32) -> Result<&GeometryObject, StoreError> {
        match self.get(id)? {
            Object::Geometry(g) => Ok(g),
            other => Err(wrong_kind(id, other.kind(), ObjectKind::Geometry)),
        }
    }

    fn program(&self, id: u32) -> Result<&Program, StoreError> {
        match self.get(id)? {
            Object::Program(p) => Ok(p),
            other => Err(wrong_kind(id, other.kind(), ObjectKind::Program)),
        }
    }

    /// Copy out the bytes a data object views.
    fn data_bytes(&self, data: &DataObject) -> Result<Vec<u8>, StoreError> {
        let mem = self.memory(data.memory)?;
        let len = usize::try_from(data.length)
            .map_err(|e| StoreError::invalid(format!("data length {}: {e}", data.length)))?;
        let mut buf = vec![0u8; len];
        mem.read(data.offset, &mut buf)?;
        Ok(buf)
    }

    fn is_referenced(&self, id: u32) -> bool {
        self.skybox == Some(id)
            || self
                .render_set
                .iter()
                .any(|e| e.matrix == id || e.texture == id || e.geometry == id)
            || self.objects.values().any(|o| o.references().contains(&id))
    }

    fn insert(&mut self, limit: usize, object: Object) -> StoreResult {
        if self.objects.len() >= limit {
            return Err(StoreError::OutOfMemory(format!(
                "scene object limit of {limit} reached"
            )));
        }
        let Some(id) = NonZeroU32::new(self.next_object) else {
            return Err(StoreError::OutOfMemory("object ids exhausted".into()));
        };
        self.next_object = self.next_object.wrapping_add(1);
        self.objects.insert(id.get(), object);
        Ok(id)
    }
}

fn wrong_kind(id: u32, found: ObjectKind, expected: ObjectKind) -> StoreError {
    StoreError::invalid(format!("object {id} is a {found}, expected a {expected}"))
}

/// Per-scene counts, for logs and diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SceneSummary {
    /// Scene id.
    pub id: u32,
    /// Scene name.
    pub name: String,
    /// Live objects by kind.
    pub objects: BTreeMap<String, usize>,
    /// Total mapped bytes.
    pub mapped_bytes: u64,
    /// Render set length.
    pub render_entries: usize,
    /// Skybox texture id.
    pub skybox: Option<u32>,
}

/// One live memory mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedRegion {
    /// Owning scene.
    pub scene: u32,
    /// Memory object id.
    pub memory: u32,
    /// Mapping size.
    pub size: u64,
}

/// All scenes plus the module-driven system matrix table.
#[derive(Debug)]
pub struct ObjectStore {
    scenes: BTreeMap<u32, Scene>,
    next_scene: u32,
    global_matrices: BTreeMap<MatrixKind, Matrix>,
    max_objects_per_scene: usize,
}

impl Default for ObjectStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_OBJECTS_PER_SCENE)
    }
}

impl ObjectStore {
    /// Empty store with a per-scene object limit.
    pub fn new(max_objects_per_scene: usize) -> Self {
        Self {
            scenes: BTreeMap::new(),
            next_scene: 1,
            global_matrices: BTreeMap::new(),
            max_objects_per_scene,
        }
    }

    // ─── Scenes ────────────────────────────────────────────────────────────

    /// Create an empty scene.
    pub fn create_scene(&mut self, name: &str) -> StoreResult {
        if name.is_empty() {
            return Err(StoreError::invalid("scene name is empty"));
        }
        let Some(id) = NonZeroU32::new(self.next_scene) else {
            return Err(StoreError::OutOfMemory("scene ids exhausted".into()));
        };
        self.next_scene = self.next_scene.wrapping_add(1);
        self.scenes.insert(id.get(), Scene::new(name.to_owned()));
        log::info!("[store] created scene {id} ({name:?})");
        Ok(id)
    }

    /// Destroy a scene and everything it owns.
    pub fn destroy_scene(&mut self, scene: u32) -> StoreResult {
        let removed = self.scenes.remove(&scene).ok_or(StoreError::UnknownId(scene))?;
        log::info!(
            "[store] destroyed scene {scene} ({:?}, {} objects)",
            removed.name,
            removed.objects.len()
        );
        drop(removed);
        NonZeroU32::new(scene).ok_or(StoreError::UnknownId(scene))
    }

    /// Borrow a scene.
    pub fn scene(&self, scene: u32) -> Option<&Scene> {
        self.scenes.get(&scene)
    }

    /// Ids of every live scene.
    pub fn scene_ids(&self) -> Vec<u32> {
        self.scenes.keys().copied().collect()
    }

    fn scene_ref(&self, scene: u32) -> Result<&Scene, StoreError> {
        self.scenes.get(&scene).ok_or(StoreError::UnknownId(scene))
    }

    fn scene_mut(&mut self, scene: u32) -> Result<&mut Scene, StoreError> {
        self.scenes.get_mut(&scene).ok_or(StoreError::UnknownId(scene))
    }

    // ─── Creation ──────────────────────────────────────────────────────────

    /// Map a client descriptor as a memory region.
    pub fn create_memory(&mut self, scene: u32, fd: OwnedFd, size: u64) -> StoreResult {
        let limit = self.max_objects_per_scene;
        let s = self.scene_mut(scene)?;
        if s.objects.len() >= limit {
            return Err(StoreError::OutOfMemory(format!("scene object limit of {limit} reached")));
        }
        let memory = Memory::map(fd, size)?;
        s.insert(limit, Object::Memory(memory))
    }

    /// Create a typed view into a memory region.
    pub fn create_data_object(
        &mut self,
        scene: u32,
        memory: u32,
        offset: u64,
        length: u64,
        element: ElementType,
    ) -> StoreResult {
        let limit = self.max_objects_per_scene;
        let s = self.scene_mut(scene)?;
        let size = s.memory(memory)?.size();
        if length == 0 {
            return Err(StoreError::invalid("data object length is zero"));
        }
        if length % element.size() != 0 {
            return Err(StoreError::invalid(format!(
                "length {length} is not a multiple of {element:?} ({} bytes)",
                element.size()
            )));
        }
        match offset.checked_add(length) {
            Some(end) if end <= size => {}
            _ => {
                return Err(StoreError::invalid(format!(
                    "range {offset}+{length} exceeds memory {memory} of {size} bytes"
                )))
            }
        }
        s.insert(
            limit,
            Object::Data(DataObject { memory, offset, length, element, binding: None }),
        )
    }

    /// Create a texture over a data object.
    pub fn create_texture_object(
        &mut self,
        scene: u32,
        data: u32,
        width: u32,
        height: u32,
        format: TextureFormat,
        kind: TextureKind,
    ) -> StoreResult {
        let limit = self.max_objects_per_scene;
        let s = self.scene_mut(scene)?;
        let d = s.data(data)?;
        if width == 0 || height == 0 {
            return Err(StoreError::invalid(format!("texture size {width}x{height}")));
        }
        let expected = u64::from(width)
            .checked_mul(u64::from(height))
            .and_then(|px| px.checked_mul(format.bytes_per_pixel()))
            .and_then(|b| b.checked_mul(kind.faces()));
        if expected != Some(d.length) {
            return Err(StoreError::invalid(format!(
                "{kind:?} {width}x{height} {format:?} needs {expected:?} bytes, data object {data} has {}",
                d.length
            )));
        }
        s.insert(limit, Object::Texture(TextureObject { data, width, height, format, kind }))
    }

    /// Create geometry from vertex, normal and index data.
    ///
    /// Any element type is accepted; the renderer decides how to read them.
    pub fn create_geometry_object(
        &mut self,
        scene: u32,
        vertex: u32,
        normal: u32,
        index: u32,
    ) -> StoreResult {
        let limit = self.max_objects_per_scene;
        let s = self.scene_mut(scene)?;
        for id in [vertex, normal, index] {
            s.data(id)?;
        }
        s.insert(limit, Object::Geometry(GeometryObject { vertex, normal, index }))
    }

    /// Give a geometry a flat color.
    pub fn create_mesh_color(&mut self, scene: u32, geometry: u32, color: [f32; 4]) -> StoreResult {
        let limit = self.max_objects_per_scene;
        let s = self.scene_mut(scene)?;
        s.geometry(geometry)?;
        if !color.iter().all(|c| (0.0..=1.0).contains(c)) {
            return Err(StoreError::invalid(format!("color {color:?} outside [0, 1]")));
        }
        s.insert(limit, Object::MeshColor(MeshColor { geometry, color }))
    }

    /// Give a geometry a texture and uv set.
    pub fn create_mesh_texture(
        &mut self,
        scene: u32,
        geometry: u32,
        texture: u32,
        uv: u32,
    ) -> StoreResult {
        let limit = self.max_objects_per_scene;
        let s = self.scene_mut(scene)?;
        s.geometry(geometry)?;
        if s.texture(texture)?.kind != TextureKind::Flat {
            return Err(StoreError::invalid(format!("texture {texture} is not 2D")));
        }
        s.data_of(uv, ElementType::Vec2)?;
        s.insert(limit, Object::MeshTexture(MeshTexture { geometry, texture, uv }))
    }

    /// Compile a program from a data object's current contents.
    pub fn create_program(&mut self, scene: u32, data: u32) -> StoreResult {
        let limit = self.max_objects_per_scene;
        let s = self.scene_mut(scene)?;
        let d = s.data(data)?;
        if d.element.size() != 4 || !matches!(d.element, ElementType::U32 | ElementType::F32) {
            return Err(StoreError::invalid(format!(
                "program data {data} is {:?}, expected u32 or f32",
                d.element
            )));
        }
        let bytes = s.data_bytes(d)?;
        let program = Program::parse(data, &bytes)?;
        s.insert(limit, Object::Program(program))
    }

    // ─── Mutation ──────────────────────────────────────────────────────────

    /// Bind a data object for upload.
    pub fn attach_memory(&mut self, scene: u32, data: u32, binding: Binding) -> StoreResult {
        let s = self.scene_mut(scene)?;
        match s.objects.get_mut(&data) {
            Some(Object::Data(d)) => {
                if let Some(current) = d.binding {
                    return Err(StoreError::invalid(format!(
                        "data object {data} already bound as {current:?}"
                    )));
                }
                d.binding = Some(binding);
            }
            Some(other) => return Err(wrong_kind(data, other.kind(), ObjectKind::Data)),
            None => return Err(StoreError::UnknownId(data)),
        }
        NonZeroU32::new(data).ok_or(StoreError::UnknownId(data))
    }

    /// Clear a data object's binding.
    pub fn detach_memory(&mut self, scene: u32, data: u32, binding: Binding) -> StoreResult {
        let s = self.scene_mut(scene)?;
        match s.objects.get_mut(&data) {
            Some(Object::Data(d)) => {
                if d.binding != Some(binding) {
                    return Err(StoreError::invalid(format!(
                        "data object {data} is bound as {:?}, not {binding:?}",
                        d.binding
                    )));
                }
                d.binding = None;
            }
            Some(other) => return Err(wrong_kind(data, other.kind(), ObjectKind::Data)),
            None => return Err(StoreError::UnknownId(data)),
        }
        NonZeroU32::new(data).ok_or(StoreError::UnknownId(data))
    }

    /// Evaluate a program into a `mat4` register. Returns the program id.
    pub fn run_program(&self, scene: u32, program: u32, register: u32) -> StoreResult {
        let s = self.scene_ref(scene)?;
        let p = s.program(program)?;
        let r = s.data_of(register, ElementType::Mat4)?;
        let mem = s.memory(r.memory)?;

        let result = p.evaluate(|kind| self.resolve_matrix(Some(s), kind));
        let bytes: Vec<u8> = result.iter().flat_map(|v| v.to_le_bytes()).collect();
        mem.write(r.offset, &bytes)?;
        NonZeroU32::new(program).ok_or(StoreError::UnknownId(program))
    }

    /// Set the skybox to a cube-map texture.
    pub fn set_skybox(&mut self, scene: u32, texture: u32) -> StoreResult {
        let s = self.scene_mut(scene)?;
        if s.texture(texture)?.kind != TextureKind::CubeMap {
            return Err(StoreError::invalid(format!("texture {texture} is not a cube map")));
        }
        s.skybox = Some(texture);
        NonZeroU32::new(texture).ok_or(StoreError::UnknownId(texture))
    }

    /// Replace the render set. Returns the scene id.
    pub fn set_render_buffer(&mut self, scene: u32, entries: Vec<RenderEntry>) -> StoreResult {
        let s = self.scene_mut(scene)?;
        for e in &entries {
            s.model_matrix(e.matrix)?;
            if e.texture != 0 {
                s.texture(e.texture)?;
            }
            let g = s.get(e.geometry)?;
            if !g.is_drawable() {
                return Err(StoreError::invalid(format!(
                    "object {} is a {}, not drawable",
                    e.geometry,
                    g.kind()
                )));
            }
        }
        log::debug!("[store] scene {scene} render set: {} entries", entries.len());
        s.render_set = entries;
        NonZeroU32::new(scene).ok_or(StoreError::UnknownId(scene))
    }

    /// Client-driven write to a scene's matrix slot. Returns the scene id.
    ///
    /// `Multiply` starts from the scene's own slot, or identity if unset.
    pub fn update_system_matrix(
        &mut self,
        scene: u32,
        kind: MatrixKind,
        mode: UpdateMode,
        m: Matrix,
    ) -> StoreResult {
        let s = self.scene_mut(scene)?;
        let slot = s.matrices.entry(kind).or_insert(IDENTITY);
        apply(slot, mode, &m);
        NonZeroU32::new(scene).ok_or(StoreError::UnknownId(scene))
    }

    /// Module-driven write to the global matrix table.
    pub fn update_system_matrix_global(&mut self, kind: MatrixKind, mode: UpdateMode, m: Matrix) {
        let slot = self.global_matrices.entry(kind).or_insert(IDENTITY);
        apply(slot, mode, &m);
    }

    // ─── Destruction ───────────────────────────────────────────────────────

    /// Destroy one unreferenced object.
    pub fn destroy_object(&mut self, scene: u32, object: u32) -> StoreResult {
        let s = self.scene_mut(scene)?;
        let kind = s.get(object)?.kind();
        if s.is_referenced(object) {
            return Err(StoreError::invalid(format!("{kind} {object} is still referenced")));
        }
        s.objects.remove(&object);
        log::debug!("[store] scene {scene}: destroyed {kind} {object}");
        NonZeroU32::new(object).ok_or(StoreError::UnknownId(object))
    }

    // ─── Reads ─────────────────────────────────────────────────────────────

    /// Resolve a matrix: scene slot, then global slot, then identity.
    pub fn system_matrix(&self, scene: Option<u32>, kind: MatrixKind) -> Matrix {
        let s = scene.and_then(|id| self.scenes.get(&id));
        self.resolve_matrix(s, kind)
    }

    fn resolve_matrix(&self, scene: Option<&Scene>, kind: MatrixKind) -> Matrix {
        scene
            .and_then(|s| s.local_matrix(kind))
            .or_else(|| self.global_matrices.get(&kind).copied())
            .unwrap_or(IDENTITY)
    }

    /// Counts for one scene.
    pub fn scene_summary(&self, scene: u32) -> Option<SceneSummary> {
        let s = self.scenes.get(&scene)?;
        let mut objects = BTreeMap::new();
        let mut mapped_bytes = 0;
        for obj in s.objects.values() {
            *objects.entry(obj.kind().to_string()).or_insert(0) += 1;
            if let Object::Memory(m) = obj {
                mapped_bytes += m.size();
            }
        }
        Some(SceneSummary {
            id: scene,
            name: s.name.clone(),
            objects,
            mapped_bytes,
            render_entries: s.render_set.len(),
            skybox: s.skybox,
        })
    }

    /// Every live mapping across all scenes.
    pub fn mapped_regions(&self) -> Vec<MappedRegion> {
        self.scenes
            .iter()
            .flat_map(|(scene, s)| {
                s.objects.iter().filter_map(move |(id, obj)| match obj {
                    Object::Memory(m) => {
                        Some(MappedRegion { scene: *scene, memory: *id, size: m.size() })
                    }
                    _ => None,
                })
            })
            .collect()
    }
}

fn apply(slot: &mut Matrix, mode: UpdateMode, m: &Matrix) {
    *slot = match mode {
        UpdateMode::Set => *m,
        UpdateMode::Multiply => matrix::multiply(slot, m),
    };
}
