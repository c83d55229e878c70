//! Entity storage and acceleration structure ownership.
//!
//! Entities are spawned into a `hecs` world and queued. Once per frame the
//! queue is drained: each mesh entity gets its mesh uploaded (once per mesh)
//! and one BLAS per submesh. The TLAS is rebuilt only when the instance set
//! changed since the last rebuild.

use crate::backend::{MeshBuffers, SceneGpuBackend};
use crate::components::{MaterialId, MeshId, MeshRenderer, Transform};
use crate::error::{Result, SceneError};
use glam::Mat4;
use hecs::{DynamicBundle, Entity, World};
use lumen_core::MeshData;
use lumen_rt::{Blas, Tlas, TlasInstance};
use std::collections::HashMap;
use tracing::{debug, warn};

/// A built BLAS and the instance data that places it in the TLAS.
pub struct BlasContainer {
    pub entity: Entity,
    pub blas: Blas,
    /// Material index, read by shaders as the instance custom index.
    pub custom_index: MaterialId,
    pub transform: Mat4,
}

impl BlasContainer {
    fn instance(&self) -> TlasInstance {
        TlasInstance::new(self.transform, self.custom_index, self.blas.device_address)
    }
}

pub struct Scene {
    world: World,
    create_queue: Vec<Entity>,
    meshes: Vec<MeshData>,
    mesh_buffers: HashMap<MeshId, MeshBuffers>,
    blas_containers: Vec<BlasContainer>,
    tlas: Option<Tlas>,
    tlas_dirty: bool,
    tlas_generation: u64,
}

impl Default for Scene {
    fn default() -> Self {
        Self::new()
    }
}

impl Scene {
    pub fn new() -> Self {
        Self {
            world: World::new(),
            create_queue: Vec::new(),
            meshes: Vec::new(),
            mesh_buffers: HashMap::new(),
            blas_containers: Vec::new(),
            tlas: None,
            tlas_dirty: false,
            tlas_generation: 0,
        }
    }

    /// Register CPU mesh data. Uploaded lazily when an entity first uses it.
    pub fn add_mesh(&mut self, mesh: MeshData) -> Result<MeshId> {
        mesh.validate()?;
        self.meshes.push(mesh);
        Ok(self.meshes.len() as MeshId - 1)
    }

    pub fn mesh(&self, id: MeshId) -> Option<&MeshData> {
        self.meshes.get(id as usize)
    }

    /// Spawn an entity and queue it for GPU creation.
    pub fn spawn(&mut self, components: impl DynamicBundle) -> Entity {
        let entity = self.world.spawn(components);
        self.create_queue.push(entity);
        entity
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn pending_entities(&self) -> usize {
        self.create_queue.len()
    }

    /// Build GPU objects for every queued entity.
    ///
    /// Entities without both [`Transform`] and [`MeshRenderer`] are skipped
    /// with a warning. Returns the number of BLAS containers created. On a GPU
    /// error the entities not yet processed stay queued.
    pub fn execute_entity_create_queue(&mut self, backend: &mut impl SceneGpuBackend) -> Result<usize> {
        let queue = std::mem::take(&mut self.create_queue);
        let mut created = 0;

        for (i, &entity) in queue.iter().enumerate() {
            match self.create_entity(backend, entity) {
                Ok(count) => created += count,
                Err(e) => {
                    self.create_queue.splice(0..0, queue[i + 1..].iter().copied());
                    return Err(e);
                }
            }
        }

        if created > 0 {
            debug!(created, total = self.blas_containers.len(), "processed entity create queue");
        }
        Ok(created)
    }

    fn create_entity(&mut self, backend: &mut impl SceneGpuBackend, entity: Entity) -> Result<usize> {
        let components = self
            .world
            .get::<&Transform>(entity)
            .map(|t| *t)
            .and_then(|t| self.world.get::<&MeshRenderer>(entity).map(|r| (t, *r)));
        let Ok((transform, renderer)) = components else {
            warn!(?entity, "entity is missing Transform or MeshRenderer, skipping");
            return Ok(0);
        };

        let Some(mesh) = self.meshes.get(renderer.mesh as usize) else {
            warn!(?entity, mesh = renderer.mesh, "entity references an unknown mesh, skipping");
            return Ok(0);
        };

        if !self.mesh_buffers.contains_key(&renderer.mesh) {
            let buffers = backend.upload_mesh(mesh, &format!("mesh_{}", renderer.mesh))?;
            self.mesh_buffers.insert(renderer.mesh, buffers);
        }
        let buffers = self
            .mesh_buffers
            .get(&renderer.mesh)
            .ok_or(SceneError::UnknownMesh(renderer.mesh))?;

        let matrix = transform.matrix();
        for (index, submesh) in mesh.submeshes.iter().enumerate() {
            let name = format!("blas_mesh{}_sub{index}", renderer.mesh);
            let blas = backend.build_blas(&buffers.geometry(*submesh), &name)?;
            self.blas_containers.push(BlasContainer {
                entity,
                blas,
                custom_index: renderer.material,
                transform: matrix,
            });
            self.tlas_dirty = true;
        }
        Ok(mesh.submeshes.len())
    }

    /// Rebuild the TLAS if the instance set changed. Returns whether it changed.
    ///
    /// The previous TLAS is retired, not destroyed, so frames still in flight
    /// keep a valid handle.
    pub fn update_tlas(&mut self, backend: &mut impl SceneGpuBackend) -> Result<bool> {
        if !self.tlas_dirty {
            return Ok(false);
        }

        if self.blas_containers.is_empty() {
            self.tlas_dirty = false;
            return Ok(match self.tlas.take() {
                Some(old) => {
                    backend.retire_tlas(old);
                    self.tlas_generation += 1;
                    true
                }
                None => false,
            });
        }

        let instances: Vec<TlasInstance> =
            self.blas_containers.iter().map(BlasContainer::instance).collect();
        let tlas = backend.build_tlas(&instances)?;
        if let Some(old) = self.tlas.replace(tlas) {
            backend.retire_tlas(old);
        }
        self.tlas_dirty = false;
        self.tlas_generation += 1;
        Ok(true)
    }

    /// Move an entity. Its instances are updated at the next TLAS rebuild.
    pub fn set_transform(&mut self, entity: Entity, transform: Transform) -> Result<()> {
        self.world
            .insert_one(entity, transform)
            .map_err(|_| SceneError::UnknownEntity(entity))?;

        let matrix = transform.matrix();
        for container in self.blas_containers.iter_mut().filter(|c| c.entity == entity) {
            container.transform = matrix;
            self.tlas_dirty = true;
        }
        Ok(())
    }

    /// Remove an entity and retire its acceleration structures.
    pub fn despawn(&mut self, entity: Entity, backend: &mut impl SceneGpuBackend) -> Result<()> {
        self.world
            .despawn(entity)
            .map_err(|_| SceneError::UnknownEntity(entity))?;
        self.create_queue.retain(|&e| e != entity);

        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.blas_containers)
            .into_iter()
            .partition(|c| c.entity == entity);
        self.blas_containers = kept;
        if !removed.is_empty() {
            self.tlas_dirty = true;
        }
        for container in removed {
            backend.retire_blas(container.blas);
        }
        Ok(())
    }

    pub fn blas_containers(&self) -> &[BlasContainer] {
        &self.blas_containers
    }

    pub fn tlas(&self) -> Option<&Tlas> {
        self.tlas.as_ref()
    }

    /// Incremented every time the TLAS handle changes.
    pub fn tlas_generation(&self) -> u64 {
        self.tlas_generation
    }

    pub fn is_tlas_dirty(&self) -> bool {
        self.tlas_dirty
    }

    /// Retire every GPU object the scene owns.
    pub fn destroy(&mut self, backend: &mut impl SceneGpuBackend) {
        if let Some(tlas) = self.tlas.take() {
            backend.retire_tlas(tlas);
        }
        for container in self.blas_containers.drain(..) {
            backend.retire_blas(container.blas);
        }
        for (_, buffers) in self.mesh_buffers.drain() {
            backend.retire_mesh(buffers);
        }
        self.tlas_dirty = false;
    }
}

impl Drop for Scene {
    fn drop(&mut self) {
        if self.tlas.is_some() || !self.blas_containers.is_empty() || !self.mesh_buffers.is_empty() {
            warn!(
                blas = self.blas_containers.len(),
                meshes = self.mesh_buffers.len(),
                "scene dropped without destroy(), GPU objects leaked"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives;
    use ash::vk::{self, Handle};
    use glam::Vec3;
    use lumen_core::SubMesh;
    use lumen_gpu::{GpuBuffer, GpuError};
    use lumen_rt::TriangleGeometry;

    #[derive(Default)]
    struct MockBackend {
        next_handle: u64,
        uploads: usize,
        blas_built: usize,
        tlas_built: usize,
        retired_blas: usize,
        retired_tlas: usize,
        retired_meshes: usize,
        fail_blas_after: Option<usize>,
        last_instances: Vec<TlasInstance>,
        last_geometry: Option<TriangleGeometry>,
    }

    impl MockBackend {
        fn handle(&mut self) -> u64 {
            self.next_handle += 1;
            self.next_handle
        }

        fn buffer(&mut self) -> GpuBuffer {
            let raw = self.handle();
            GpuBuffer::external(vk::Buffer::from_raw(raw), 256, vk::BufferUsageFlags::STORAGE_BUFFER)
        }
    }

    impl SceneGpuBackend for MockBackend {
        fn upload_mesh(&mut self, mesh: &MeshData, _name: &str) -> lumen_gpu::Result<MeshBuffers> {
            self.uploads += 1;
            Ok(MeshBuffers {
                vertices: self.buffer(),
                indices: self.buffer(),
                vertex_address: 0x10_000,
                index_address: 0x20_000,
                vertex_count: mesh.vertex_count(),
            })
        }

        fn build_blas(&mut self, geometry: &TriangleGeometry, _name: &str) -> lumen_gpu::Result<Blas> {
            if self.fail_blas_after == Some(self.blas_built) {
                return Err(GpuError::DeviceLost("mock".to_string()));
            }
            self.blas_built += 1;
            self.last_geometry = Some(*geometry);
            let raw = self.handle();
            Ok(Blas {
                handle: vk::AccelerationStructureKHR::from_raw(raw),
                buffer: self.buffer(),
                device_address: raw * 0x100,
            })
        }

        fn build_tlas(&mut self, instances: &[TlasInstance]) -> lumen_gpu::Result<Tlas> {
            self.tlas_built += 1;
            self.last_instances = instances.to_vec();
            let raw = self.handle();
            Ok(Tlas {
                handle: vk::AccelerationStructureKHR::from_raw(raw),
                buffer: self.buffer(),
                instance_buffer: self.buffer(),
                device_address: raw * 0x100,
                instance_count: instances.len() as u32,
            })
        }

        fn retire_mesh(&mut self, _mesh: MeshBuffers) {
            self.retired_meshes += 1;
        }

        fn retire_blas(&mut self, _blas: Blas) {
            self.retired_blas += 1;
        }

        fn retire_tlas(&mut self, _tlas: Tlas) {
            self.retired_tlas += 1;
        }
    }

    fn scene_with_cube() -> (Scene, MeshId) {
        let mut scene = Scene::new();
        let cube = scene.add_mesh(primitives::cube(1.0)).unwrap();
        (scene, cube)
    }

    #[test]
    fn two_mesh_entities_produce_two_blas_containers() {
        let (mut scene, cube) = scene_with_cube();
        let mut backend = MockBackend::default();

        scene.spawn((Transform::default(), MeshRenderer { mesh: cube, material: 3 }));
        scene.spawn((
            Transform::from_position(Vec3::X),
            MeshRenderer { mesh: cube, material: 5 },
        ));

        assert_eq!(scene.execute_entity_create_queue(&mut backend).unwrap(), 2);

        let containers = scene.blas_containers();
        assert_eq!(containers.len(), 2);
        assert!(containers
            .iter()
            .all(|c| c.blas.handle != vk::AccelerationStructureKHR::null()));
        assert_eq!(containers[0].custom_index, 3);
        assert_eq!(containers[1].custom_index, 5);
        assert_eq!(backend.uploads, 1, "shared mesh is uploaded once");
        assert_eq!(scene.pending_entities(), 0);
        assert!(scene.is_tlas_dirty());

        scene.destroy(&mut backend);
    }

    #[test]
    fn entity_missing_components_is_skipped() {
        let (mut scene, cube) = scene_with_cube();
        let mut backend = MockBackend::default();

        scene.spawn((Transform::default(),));
        scene.spawn((MeshRenderer { mesh: cube, material: 0 },));
        scene.spawn((Transform::default(), MeshRenderer { mesh: 42, material: 0 }));

        assert_eq!(scene.execute_entity_create_queue(&mut backend).unwrap(), 0);
        assert!(scene.blas_containers().is_empty());
        assert_eq!(backend.uploads, 0);
        assert!(!scene.is_tlas_dirty());
    }

    #[test]
    fn tlas_rebuilt_only_when_instances_change() {
        let (mut scene, cube) = scene_with_cube();
        let mut backend = MockBackend::default();
        let entity = scene.spawn((Transform::default(), MeshRenderer { mesh: cube, material: 7 }));
        scene.execute_entity_create_queue(&mut backend).unwrap();

        assert!(scene.update_tlas(&mut backend).unwrap());
        assert_eq!(backend.tlas_built, 1);
        assert_eq!(backend.last_instances[0].custom_index, 7);
        assert_eq!(scene.tlas_generation(), 1);

        assert!(!scene.update_tlas(&mut backend).unwrap());
        assert_eq!(backend.tlas_built, 1);

        scene
            .set_transform(entity, Transform::from_position(Vec3::new(0.0, 2.0, 0.0)))
            .unwrap();
        assert!(scene.update_tlas(&mut backend).unwrap());
        assert_eq!(backend.tlas_built, 2);
        assert_eq!(backend.retired_tlas, 1, "previous TLAS goes through the deletion path");
        assert_eq!(
            backend.last_instances[0].transform,
            Mat4::from_translation(Vec3::new(0.0, 2.0, 0.0))
        );

        scene.destroy(&mut backend);
        assert_eq!(backend.retired_tlas, 2);
    }

    #[test]
    fn despawn_retires_blas_and_empties_tlas() {
        let (mut scene, cube) = scene_with_cube();
        let mut backend = MockBackend::default();
        let entity = scene.spawn((Transform::default(), MeshRenderer { mesh: cube, material: 0 }));
        scene.execute_entity_create_queue(&mut backend).unwrap();
        scene.update_tlas(&mut backend).unwrap();

        scene.despawn(entity, &mut backend).unwrap();
        assert_eq!(backend.retired_blas, 1);
        assert!(scene.update_tlas(&mut backend).unwrap());
        assert!(scene.tlas().is_none());
        assert_eq!(backend.retired_tlas, 1);

        assert!(matches!(
            scene.despawn(entity, &mut backend),
            Err(SceneError::UnknownEntity(_))
        ));

        scene.destroy(&mut backend);
        assert_eq!(backend.retired_meshes, 1);
    }

    #[test]
    fn one_container_per_submesh() {
        let mut scene = Scene::new();
        let mut mesh = primitives::cube(1.0);
        mesh.submeshes = vec![
            SubMesh { first_index: 0, index_count: 18 },
            SubMesh { first_index: 18, index_count: 18 },
        ];
        let id = scene.add_mesh(mesh).unwrap();
        let mut backend = MockBackend::default();

        scene.spawn((Transform::default(), MeshRenderer { mesh: id, material: 1 }));
        assert_eq!(scene.execute_entity_create_queue(&mut backend).unwrap(), 2);

        let geometry = backend.last_geometry.unwrap();
        assert_eq!(geometry.index_address, 0x20_000 + 18 * 4);
        assert_eq!(geometry.index_count, 18);
        assert_eq!(geometry.vertex_stride, 48);

        scene.destroy(&mut backend);
    }

    #[test]
    fn failed_build_keeps_rest_queued() {
        let (mut scene, cube) = scene_with_cube();
        let mut backend = MockBackend {
            fail_blas_after: Some(1),
            ..MockBackend::default()
        };
        for material in 0..3 {
            scene.spawn((Transform::default(), MeshRenderer { mesh: cube, material }));
        }

        assert!(scene.execute_entity_create_queue(&mut backend).is_err());
        assert_eq!(scene.blas_containers().len(), 1);
        assert_eq!(scene.pending_entities(), 1);

        backend.fail_blas_after = None;
        assert_eq!(scene.execute_entity_create_queue(&mut backend).unwrap(), 1);
        assert_eq!(scene.blas_containers()[1].custom_index, 2);

        scene.destroy(&mut backend);
    }

    #[test]
    fn invalid_mesh_is_rejected() {
        let mut scene = Scene::new();
        let mut mesh = primitives::plane(1.0);
        mesh.indices.pop();
        assert!(matches!(scene.add_mesh(mesh), Err(SceneError::Data(_))));
    }
}
