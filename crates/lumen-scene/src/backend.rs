//! GPU operations the scene needs, behind a trait so scene logic runs without a device.

use ash::vk;
use lumen_core::{MeshData, SubMesh, Vertex};
use lumen_gpu::{
    create_buffer_with_data, BufferDesc, DeletionQueue, GpuBuffer, GpuContext, MemoryLocation,
    Result,
};
use lumen_rt::{Blas, RayTracingContext, Tlas, TlasInstance, TriangleGeometry};

/// Device-local vertex and index buffers of one mesh.
pub struct MeshBuffers {
    pub vertices: GpuBuffer,
    pub indices: GpuBuffer,
    pub vertex_address: vk::DeviceAddress,
    pub index_address: vk::DeviceAddress,
    pub vertex_count: u32,
}

impl MeshBuffers {
    /// BLAS input for one submesh.
    pub fn geometry(&self, submesh: SubMesh) -> TriangleGeometry {
        TriangleGeometry {
            vertex_address: self.vertex_address,
            vertex_stride: Vertex::STRIDE,
            vertex_count: self.vertex_count,
            index_address: self.index_address
                + u64::from(submesh.first_index) * std::mem::size_of::<u32>() as u64,
            index_count: submesh.index_count,
        }
    }
}

/// GPU work issued by [`crate::Scene`].
///
/// Retired objects go through the deletion queue; none are destroyed immediately.
pub trait SceneGpuBackend {
    fn upload_mesh(&mut self, mesh: &MeshData, name: &str) -> Result<MeshBuffers>;
    fn build_blas(&mut self, geometry: &TriangleGeometry, name: &str) -> Result<Blas>;
    fn build_tlas(&mut self, instances: &[TlasInstance]) -> Result<Tlas>;
    fn retire_mesh(&mut self, mesh: MeshBuffers);
    fn retire_blas(&mut self, blas: Blas);
    fn retire_tlas(&mut self, tlas: Tlas);
}

/// [`SceneGpuBackend`] over a live device.
pub struct VulkanSceneBackend<'a> {
    gpu: &'a GpuContext,
    rt: &'a RayTracingContext,
    deletion: &'a mut DeletionQueue,
}

impl<'a> VulkanSceneBackend<'a> {
    pub fn new(gpu: &'a GpuContext, rt: &'a RayTracingContext, deletion: &'a mut DeletionQueue) -> Self {
        Self { gpu, rt, deletion }
    }
}

impl SceneGpuBackend for VulkanSceneBackend<'_> {
    fn upload_mesh(&mut self, mesh: &MeshData, name: &str) -> Result<MeshBuffers> {
        let usage = vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
            | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;

        let vertex_bytes: &[u8] = bytemuck::cast_slice(&mesh.vertices);
        let vertex_name = format!("{name}_vertices");
        let vertices = create_buffer_with_data(
            self.gpu,
            &BufferDesc::new(&vertex_name, vertex_bytes.len() as u64, usage, MemoryLocation::GpuOnly),
            vertex_bytes,
        )?;

        let index_bytes: &[u8] = bytemuck::cast_slice(&mesh.indices);
        let index_name = format!("{name}_indices");
        let indices = match create_buffer_with_data(
            self.gpu,
            &BufferDesc::new(&index_name, index_bytes.len() as u64, usage, MemoryLocation::GpuOnly),
            index_bytes,
        ) {
            Ok(indices) => indices,
            Err(e) => {
                self.gpu.allocator().lock().destroy_buffer(vertices)?;
                return Err(e);
            }
        };

        Ok(MeshBuffers {
            vertex_address: vertices.device_address(self.gpu.device()),
            index_address: indices.device_address(self.gpu.device()),
            vertex_count: mesh.vertex_count(),
            vertices,
            indices,
        })
    }

    fn build_blas(&mut self, geometry: &TriangleGeometry, name: &str) -> Result<Blas> {
        Blas::build(self.gpu, self.rt, geometry, name)
    }

    fn build_tlas(&mut self, instances: &[TlasInstance]) -> Result<Tlas> {
        Tlas::build(self.gpu, self.rt, instances)
    }

    fn retire_mesh(&mut self, mesh: MeshBuffers) {
        self.deletion.retire_buffer(self.gpu.allocator(), mesh.vertices);
        self.deletion.retire_buffer(self.gpu.allocator(), mesh.indices);
    }

    fn retire_blas(&mut self, blas: Blas) {
        blas.retire(self.rt, self.deletion, self.gpu.allocator());
    }

    fn retire_tlas(&mut self, tlas: Tlas) {
        tlas.retire(self.rt, self.deletion, self.gpu.allocator());
    }
}
