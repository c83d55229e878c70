//! Acceleration structure management for hardware ray tracing.
//!
//! BLAS are built once per submesh from device-local vertex and index
//! buffers. The TLAS is rebuilt from a flat instance list whenever the set of
//! instances changes. Builds are blocking; scratch memory is released as soon
//! as the build fence signals.

use crate::context::RayTracingContext;
use ash::vk;
use glam::Mat4;
use gpu_allocator::MemoryLocation;
use lumen_core::math::{align_up, to_row_major_3x4};
use lumen_gpu::{BufferDesc, DeletionQueue, GpuBuffer, GpuContext, GpuError, Result, SharedAllocator};

/// Largest value that fits the 24-bit instance custom index.
pub const MAX_CUSTOM_INDEX: u32 = (1 << 24) - 1;

/// Triangle geometry input for a BLAS build.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TriangleGeometry {
    /// Device address of the first vertex; positions are the first 12 bytes.
    pub vertex_address: vk::DeviceAddress,
    pub vertex_stride: u64,
    pub vertex_count: u32,
    /// Device address of the first `u32` index of this geometry.
    pub index_address: vk::DeviceAddress,
    pub index_count: u32,
}

impl TriangleGeometry {
    pub fn primitive_count(&self) -> u32 {
        self.index_count / 3
    }

    pub fn validate(&self) -> Result<()> {
        if self.vertex_count == 0 {
            return Err(GpuError::invalid_spec("BLAS geometry", "vertices", "0"));
        }
        if self.index_count == 0 || self.index_count % 3 != 0 {
            return Err(GpuError::invalid_spec(
                "BLAS geometry",
                "a non-zero multiple of 3 indices",
                self.index_count.to_string(),
            ));
        }
        if self.vertex_stride < 12 {
            return Err(GpuError::invalid_spec(
                "BLAS geometry",
                "vertex stride of at least 12 bytes",
                self.vertex_stride.to_string(),
            ));
        }
        Ok(())
    }

    fn to_vk(self) -> vk::AccelerationStructureGeometryKHR<'static> {
        let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
            .vertex_format(vk::Format::R32G32B32_SFLOAT)
            .vertex_data(vk::DeviceOrHostAddressConstKHR {
                device_address: self.vertex_address,
            })
            .vertex_stride(self.vertex_stride)
            .max_vertex(self.vertex_count - 1)
            .index_type(vk::IndexType::UINT32)
            .index_data(vk::DeviceOrHostAddressConstKHR {
                device_address: self.index_address,
            });

        vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .flags(vk::GeometryFlagsKHR::OPAQUE)
            .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
    }
}

/// One instance in the TLAS.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TlasInstance {
    /// Column-major object-to-world transform.
    pub transform: Mat4,
    /// Value of `gl_InstanceCustomIndexEXT`; the material index in this engine.
    pub custom_index: u32,
    pub mask: u8,
    pub sbt_record_offset: u32,
    pub flags: vk::GeometryInstanceFlagsKHR,
    pub blas_address: vk::DeviceAddress,
}

impl TlasInstance {
    /// Instance visible to every ray with the default hit group.
    pub fn new(transform: Mat4, custom_index: u32, blas_address: vk::DeviceAddress) -> Self {
        Self {
            transform,
            custom_index,
            mask: 0xFF,
            sbt_record_offset: 0,
            flags: vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE,
            blas_address,
        }
    }

    /// Convert to the packed Vulkan instance record.
    pub fn to_vk(&self) -> Result<vk::AccelerationStructureInstanceKHR> {
        if self.custom_index > MAX_CUSTOM_INDEX {
            return Err(GpuError::invalid_spec(
                "TLAS instance",
                format!("custom index <= {MAX_CUSTOM_INDEX}"),
                self.custom_index.to_string(),
            ));
        }
        if self.sbt_record_offset > MAX_CUSTOM_INDEX {
            return Err(GpuError::invalid_spec(
                "TLAS instance",
                format!("SBT record offset <= {MAX_CUSTOM_INDEX}"),
                self.sbt_record_offset.to_string(),
            ));
        }

        Ok(vk::AccelerationStructureInstanceKHR {
            transform: vk::TransformMatrixKHR {
                matrix: to_row_major_3x4(&self.transform),
            },
            instance_custom_index_and_mask: vk::Packed24_8::new(self.custom_index, self.mask),
            instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
                self.sbt_record_offset,
                self.flags.as_raw() as u8,
            ),
            acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
                device_handle: self.blas_address,
            },
        })
    }
}

/// Acceleration structure handle plus its dedicated storage buffer.
struct BuiltStructure {
    handle: vk::AccelerationStructureKHR,
    buffer: GpuBuffer,
    device_address: vk::DeviceAddress,
}

/// Query sizes, allocate storage and scratch, build, and wait.
fn build_structure(
    gpu: &GpuContext,
    rt: &RayTracingContext,
    ty: vk::AccelerationStructureTypeKHR,
    geometry: &vk::AccelerationStructureGeometryKHR<'_>,
    primitive_count: u32,
    name: &str,
) -> Result<BuiltStructure> {
    let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
        .ty(ty)
        .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .geometries(std::slice::from_ref(geometry));

    let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
    unsafe {
        rt.as_loader.get_acceleration_structure_build_sizes(
            vk::AccelerationStructureBuildTypeKHR::DEVICE,
            &build_info,
            &[primitive_count],
            &mut sizes,
        );
    }
    if sizes.acceleration_structure_size == 0 || sizes.build_scratch_size == 0 {
        return Err(GpuError::invalid_spec(
            "acceleration structure build",
            "non-zero build sizes",
            format!(
                "storage {} scratch {}",
                sizes.acceleration_structure_size, sizes.build_scratch_size
            ),
        ));
    }

    let buffer = gpu.create_buffer(&BufferDesc::new(
        name,
        sizes.acceleration_structure_size,
        vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        MemoryLocation::GpuOnly,
    ))?;

    let create_info = vk::AccelerationStructureCreateInfoKHR::default()
        .buffer(buffer.handle())
        .offset(0)
        .size(sizes.acceleration_structure_size)
        .ty(ty);
    let handle = match unsafe { rt.as_loader.create_acceleration_structure(&create_info, None) } {
        Ok(handle) => handle,
        Err(e) => {
            gpu.allocator().lock().destroy_buffer(buffer)?;
            return Err(e.into());
        }
    };

    let result = record_blocking_build(gpu, rt, &mut build_info, handle, primitive_count, &sizes);
    if let Err(e) = result {
        unsafe { rt.as_loader.destroy_acceleration_structure(handle, None) };
        gpu.allocator().lock().destroy_buffer(buffer)?;
        return Err(e);
    }

    let address_info =
        vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(handle);
    let device_address = unsafe {
        rt.as_loader
            .get_acceleration_structure_device_address(&address_info)
    };

    Ok(BuiltStructure {
        handle,
        buffer,
        device_address,
    })
}

fn record_blocking_build(
    gpu: &GpuContext,
    rt: &RayTracingContext,
    build_info: &mut vk::AccelerationStructureBuildGeometryInfoKHR<'_>,
    dst: vk::AccelerationStructureKHR,
    primitive_count: u32,
    sizes: &vk::AccelerationStructureBuildSizesInfoKHR<'_>,
) -> Result<()> {
    let scratch = gpu.create_buffer(&BufferDesc::new(
        "as_build_scratch",
        sizes.build_scratch_size + rt.scratch_alignment,
        vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        MemoryLocation::GpuOnly,
    ))?;
    let scratch_address = align_up(scratch.device_address(gpu.device()), rt.scratch_alignment);

    build_info.dst_acceleration_structure = dst;
    build_info.scratch_data = vk::DeviceOrHostAddressKHR {
        device_address: scratch_address,
    };
    let build_info = &*build_info;

    let range = vk::AccelerationStructureBuildRangeInfoKHR::default()
        .primitive_count(primitive_count)
        .primitive_offset(0)
        .first_vertex(0)
        .transform_offset(0);

    let result = gpu.immediate_submit(|cmd| unsafe {
        rt.as_loader.cmd_build_acceleration_structures(
            cmd,
            std::slice::from_ref(build_info),
            &[std::slice::from_ref(&range)],
        );

        // Later builds and traces read what this build wrote.
        let barrier = vk::MemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR)
            .src_access_mask(vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR)
            .dst_stage_mask(
                vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR
                    | vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
            )
            .dst_access_mask(vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR);
        let dependency =
            vk::DependencyInfo::default().memory_barriers(std::slice::from_ref(&barrier));
        gpu.device().cmd_pipeline_barrier2(cmd, &dependency);
    });

    // The submission has completed or failed to start; scratch is idle.
    gpu.allocator().lock().destroy_buffer(scratch)?;
    result
}

fn retire_structure(
    rt: &RayTracingContext,
    deletion: &mut DeletionQueue,
    handle: vk::AccelerationStructureKHR,
) {
    let as_loader = rt.as_loader.clone();
    deletion.submit(move || unsafe { as_loader.destroy_acceleration_structure(handle, None) });
}

/// Bottom-level acceleration structure over one triangle geometry.
pub struct Blas {
    pub handle: vk::AccelerationStructureKHR,
    pub buffer: GpuBuffer,
    pub device_address: vk::DeviceAddress,
}

impl Blas {
    /// Build a BLAS and block until it is ready.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn build(
        gpu: &GpuContext,
        rt: &RayTracingContext,
        geometry: &TriangleGeometry,
        name: &str,
    ) -> Result<Self> {
        geometry.validate()?;
        let built = build_structure(
            gpu,
            rt,
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            &geometry.to_vk(),
            geometry.primitive_count(),
            name,
        )?;
        tracing::debug!(name, triangles = geometry.primitive_count(), "built BLAS");
        Ok(Self {
            handle: built.handle,
            buffer: built.buffer,
            device_address: built.device_address,
        })
    }

    /// Schedule destruction once in-flight frames can no longer reference it.
    pub fn retire(
        self,
        rt: &RayTracingContext,
        deletion: &mut DeletionQueue,
        allocator: &SharedAllocator,
    ) {
        retire_structure(rt, deletion, self.handle);
        deletion.retire_buffer(allocator, self.buffer);
    }
}

/// Top-level acceleration structure over a set of BLAS instances.
pub struct Tlas {
    pub handle: vk::AccelerationStructureKHR,
    pub buffer: GpuBuffer,
    pub instance_buffer: GpuBuffer,
    pub device_address: vk::DeviceAddress,
    pub instance_count: u32,
}

impl Tlas {
    /// Build a TLAS and block until it is ready.
    ///
    /// Every referenced BLAS must stay alive as long as the TLAS.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn build(gpu: &GpuContext, rt: &RayTracingContext, instances: &[TlasInstance]) -> Result<Self> {
        if instances.is_empty() {
            return Err(GpuError::invalid_spec("TLAS build", "at least one instance", "0"));
        }

        let records = instances
            .iter()
            .map(TlasInstance::to_vk)
            .collect::<Result<Vec<_>>>()?;
        let record_size = std::mem::size_of::<vk::AccelerationStructureInstanceKHR>();

        // Instance records are host-written; reinterpret them as bytes.
        let bytes = unsafe {
            std::slice::from_raw_parts(records.as_ptr().cast::<u8>(), records.len() * record_size)
        };

        let instance_buffer = gpu.create_buffer(&BufferDesc::new(
            "tlas_instances",
            bytes.len() as u64,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::CpuToGpu,
        ))?;
        if let Err(e) = instance_buffer.write_bytes(0, bytes) {
            gpu.allocator().lock().destroy_buffer(instance_buffer)?;
            return Err(e);
        }

        let geometry = vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .flags(vk::GeometryFlagsKHR::OPAQUE)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                instances: vk::AccelerationStructureGeometryInstancesDataKHR::default()
                    .array_of_pointers(false)
                    .data(vk::DeviceOrHostAddressConstKHR {
                        device_address: instance_buffer.device_address(gpu.device()),
                    }),
            });

        let instance_count = records.len() as u32;
        let built = match build_structure(
            gpu,
            rt,
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            &geometry,
            instance_count,
            "tlas",
        ) {
            Ok(built) => built,
            Err(e) => {
                gpu.allocator().lock().destroy_buffer(instance_buffer)?;
                return Err(e);
            }
        };

        tracing::debug!(instance_count, "built TLAS");
        Ok(Self {
            handle: built.handle,
            buffer: built.buffer,
            instance_buffer,
            device_address: built.device_address,
            instance_count,
        })
    }

    /// Schedule destruction once in-flight frames can no longer reference it.
    pub fn retire(
        self,
        rt: &RayTracingContext,
        deletion: &mut DeletionQueue,
        allocator: &SharedAllocator,
    ) {
        retire_structure(rt, deletion, self.handle);
        deletion.retire_buffer(allocator, self.buffer);
        deletion.retire_buffer(allocator, self.instance_buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn geometry() -> TriangleGeometry {
        TriangleGeometry {
            vertex_address: 0x1000,
            vertex_stride: 48,
            vertex_count: 4,
            index_address: 0x2000,
            index_count: 6,
        }
    }

    #[test]
    fn identity_transform_becomes_identity_3x4() {
        let record = TlasInstance::new(Mat4::IDENTITY, 0, 0xABC).to_vk().unwrap();
        assert_eq!(
            record.transform.matrix,
            [
                1.0, 0.0, 0.0, 0.0, //
                0.0, 1.0, 0.0, 0.0, //
                0.0, 0.0, 1.0, 0.0,
            ]
        );
        assert_eq!(
            unsafe { record.acceleration_structure_reference.device_handle },
            0xABC
        );
    }

    #[test]
    fn translation_and_custom_index_are_packed() {
        let transform = Mat4::from_translation(Vec3::new(5.0, -2.0, 1.5));
        let record = TlasInstance::new(transform, 17, 1).to_vk().unwrap();
        assert_eq!(record.transform.matrix[3], 5.0);
        assert_eq!(record.transform.matrix[7], -2.0);
        assert_eq!(record.transform.matrix[11], 1.5);
        assert_eq!(record.instance_custom_index_and_mask.low_24(), 17);
        assert_eq!(record.instance_custom_index_and_mask.high_8(), 0xFF);
    }

    #[test]
    fn custom_index_must_fit_24_bits() {
        let instance = TlasInstance::new(Mat4::IDENTITY, MAX_CUSTOM_INDEX + 1, 1);
        assert!(matches!(
            instance.to_vk(),
            Err(GpuError::InvalidSpecification { .. })
        ));
    }

    #[test]
    fn triangle_geometry_is_opaque_float3() {
        let geometry = geometry();
        assert!(geometry.validate().is_ok());
        assert_eq!(geometry.primitive_count(), 2);

        let vk_geometry = geometry.to_vk();
        assert!(vk_geometry.flags.contains(vk::GeometryFlagsKHR::OPAQUE));
        let triangles = unsafe { vk_geometry.geometry.triangles };
        assert_eq!(triangles.vertex_format, vk::Format::R32G32B32_SFLOAT);
        assert_eq!(triangles.max_vertex, 3);
        assert_eq!(triangles.index_type, vk::IndexType::UINT32);
        assert_eq!(triangles.vertex_stride, 48);
    }

    #[test]
    fn geometry_validation() {
        let mut g = geometry();
        g.index_count = 5;
        assert!(g.validate().is_err());

        let mut g = geometry();
        g.vertex_count = 0;
        assert!(g.validate().is_err());

        let mut g = geometry();
        g.vertex_stride = 8;
        assert!(g.validate().is_err());
    }
}
