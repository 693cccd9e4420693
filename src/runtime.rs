//! Runtime interface: the single serialization point for scene state.
//!
//! The protocol server and every module thread hold an `Arc<dyn Runtime>`.
//! [`SharedRuntime`] guards one [`ObjectStore`] with a mutex, so each call is
//! atomic with respect to all others and a reader never sees a half-written
//! matrix.

use std::os::fd::OwnedFd;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::protocol::{
    Binding, ElementType, Matrix, MatrixKind, RenderEntry, TextureFormat, TextureKind, UpdateMode,
};
use crate::store::{ObjectStore, SceneSummary, StoreResult};

/// Operations available to the server and to modules.
pub trait Runtime: Send + Sync {
    /// Create a scene.
    fn create_scene(&self, name: &str) -> StoreResult;
    /// Destroy a scene and everything it owns.
    fn destroy_scene(&self, scene: u32) -> StoreResult;
    /// Map a client descriptor.
    fn create_memory(&self, scene: u32, fd: OwnedFd, size: u64) -> StoreResult;
    /// Typed view into memory.
    fn create_data_object(
        &self,
        scene: u32,
        memory: u32,
        offset: u64,
        length: u64,
        element: ElementType,
    ) -> StoreResult;
    /// Texture over a data object.
    fn create_texture_object(
        &self,
        scene: u32,
        data: u32,
        width: u32,
        height: u32,
        format: TextureFormat,
        kind: TextureKind,
    ) -> StoreResult;
    /// Geometry from vertex/normal/index data.
    fn create_geometry_object(&self, scene: u32, vertex: u32, normal: u32, index: u32)
        -> StoreResult;
    /// Flat-colored mesh.
    fn create_mesh_color(&self, scene: u32, geometry: u32, color: [f32; 4]) -> StoreResult;
    /// Textured mesh.
    fn create_mesh_texture(&self, scene: u32, geometry: u32, texture: u32, uv: u32)
        -> StoreResult;
    /// Compile a program.
    fn create_program(&self, scene: u32, data: u32) -> StoreResult;
    /// Run a program into a register.
    fn run_program(&self, scene: u32, program: u32, register: u32) -> StoreResult;
    /// Set the skybox.
    fn set_skybox(&self, scene: u32, texture: u32) -> StoreResult;
    /// Replace the render set.
    fn set_render_buffer(&self, scene: u32, entries: Vec<RenderEntry>) -> StoreResult;
    /// Bind a data object.
    fn attach_memory(&self, scene: u32, data: u32, binding: Binding) -> StoreResult;
    /// Unbind a data object.
    fn detach_memory(&self, scene: u32, data: u32, binding: Binding) -> StoreResult;
    /// Destroy one object.
    fn destroy_object(&self, scene: u32, object: u32) -> StoreResult;
    /// Client-driven, scene-scoped matrix update.
    fn update_system_matrix(
        &self,
        scene: u32,
        kind: MatrixKind,
        mode: UpdateMode,
        matrix: Matrix,
    ) -> StoreResult;
    /// Module-driven, global matrix update.
    fn update_system_matrix_module(&self, kind: MatrixKind, mode: UpdateMode, matrix: Matrix);
    /// Resolved matrix for a scene (or the global table for `None`).
    fn system_matrix(&self, scene: Option<u32>, kind: MatrixKind) -> Matrix;
    /// Counts for one scene.
    fn scene_summary(&self, scene: u32) -> Option<SceneSummary>;
    /// Every live scene id.
    fn scene_ids(&self) -> Vec<u32>;
    /// Read-only access for render consumers. The lock is held for the
    /// duration of `f`.
    fn with_store(&self, f: &mut dyn FnMut(&ObjectStore));
}

/// Mutex-guarded [`ObjectStore`].
#[derive(Debug, Default)]
pub struct SharedRuntime {
    store: Mutex<ObjectStore>,
}

impl SharedRuntime {
    /// Wrap a store.
    pub fn new(store: ObjectStore) -> Self {
        Self { store: Mutex::new(store) }
    }

    /// Lock the store. A poisoned lock is recovered: every store operation
    /// validates before it mutates, so a panic mid-call leaves no partial
    /// state behind.
    fn lock(&self) -> MutexGuard<'_, ObjectStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Runtime for SharedRuntime {
    fn create_scene(&self, name: &str) -> StoreResult {
        self.lock().create_scene(name)
    }

    fn destroy_scene(&self, scene: u32) -> StoreResult {
        self.lock().destroy_scene(scene)
    }

    fn create_memory(&self, scene: u32, fd: OwnedFd, size: u64) -> StoreResult {
        self.lock().create_memory(scene, fd, size)
    }

    fn create_data_object(
        &self,
        scene: u32,
        memory: u32,
        offset: u64,
        length: u64,
        element: ElementType,
    ) -> StoreResult {
        self.lock().create_data_object(scene, memory, offset, length, element)
    }

    fn create_texture_object(
        &self,
        scene: u32,
        data: u32,
        width: u32,
        height: u32,
        format: TextureFormat,
        kind: TextureKind,
    ) -> StoreResult {
        self.lock().create_texture_object(scene, data, width, height, format, kind)
    }

    fn create_geometry_object(
        &self,
        scene: u32,
        vertex: u32,
        normal: u32,
        index: u32,
    ) -> StoreResult {
        self.lock().create_geometry_object(scene, vertex, normal, index)
    }

    fn create_mesh_color(&self, scene: u32, geometry: u32, color: [f32; 4]) -> StoreResult {
        self.lock().create_mesh_color(scene, geometry, color)
    }

    fn create_mesh_texture(
        &self,
        scene: u32,
        geometry: u32,
        texture: u32,
        uv: u32,
    ) -> StoreResult {
        self.lock().create_mesh_texture(scene, geometry, texture, uv)
    }

    fn create_program(&self, scene: u32, data: u32) -> StoreResult {
        self.lock().create_program(scene, data)
    }

    fn run_program(&self, scene: u32, program: u32, register: u32) -> StoreResult {
        self.lock().run_program(scene, program, register)
    }

    fn set_skybox(&self, scene: u32, texture: u32) -> StoreResult {
        self.lock().set_skybox(scene, texture)
    }

    fn set_render_buffer(&self, scene: u32, entries: Vec<RenderEntry>) -> StoreResult {
        self.lock().set_render_buffer(scene, entries)
    }

    fn attach_memory(&self, scene: u32, data: u32, binding: Binding) -> StoreResult {
        self.lock().attach_memory(scene, data, binding)
    }

    fn detach_memory(&self, scene: u32, data: u32, binding: Binding) -> StoreResult {
        self.lock().detach_memory(scene, data, binding)
    }

    fn destroy_object(&self, scene: u32, object: u32) -> StoreResult {
        self.lock().destroy_object(scene, object)
    }

    fn update_system_matrix(
        &self,
        scene: u32,
        kind: MatrixKind,
        mode: UpdateMode,
        matrix: Matrix,
    ) -> StoreResult {
        self.lock().update_system_matrix(scene, kind, mode, matrix)
    }

    fn update_system_matrix_module(&self, kind: MatrixKind, mode: UpdateMode, matrix: Matrix) {
        self.lock().update_system_matrix_global(kind, mode, matrix);
    }

    fn system_matrix(&self, scene: Option<u32>, kind: MatrixKind) -> Matrix {
        self.lock().system_matrix(scene, kind)
    }

    fn scene_summary(&self, scene: u32) -> Option<SceneSummary> {
        self.lock().scene_summary(scene)
    }

    fn scene_ids(&self) -> Vec<u32> {
        self.lock().scene_ids()
    }

    fn with_store(&self, f: &mut dyn FnMut(&ObjectStore)) {
        f(&self.lock());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::IDENTITY;
    use std::sync::Arc;

    #[test]
    fn test_shared_across_threads() {
        let rt: Arc<dyn Runtime> = Arc::new(SharedRuntime::default());
        let scene = rt.create_scene("threads").unwrap().get();

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let rt = Arc::clone(&rt);
                std::thread::spawn(move || {
                    let mut m = IDENTITY;
                    m[12] = i as f32;
                    for _ in 0..100 {
                        rt.update_system_matrix_module(MatrixKind::Head, UpdateMode::Set, m);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let head = rt.system_matrix(Some(scene), MatrixKind::Head);
        assert!((0.0..4.0).contains(&head[12]));
        assert_eq!(rt.scene_ids(), vec![scene]);
    }

    #[test]
    fn test_with_store_reads_state() {
        let rt = SharedRuntime::default();
        let scene = rt.create_scene("reader").unwrap().get();
        let mut names = Vec::new();
        rt.with_store(&mut |store: &ObjectStore| {
            names.push(store.scene(scene).map(|s| s.name().to_owned()));
        });
        assert_eq!(names, vec![Some("reader".to_owned())]);
    }

    #[test]
    fn test_poisoned_lock_is_recovered() {
        let rt = Arc::new(SharedRuntime::default());
        let poison = Arc::clone(&rt);
        let _ = std::thread::spawn(move || {
            poison.with_store(&mut |_: &ObjectStore| panic!("reader panicked"));
        })
        .join();
        assert!(rt.create_scene("after").is_ok());
    }
}
