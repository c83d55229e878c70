//! Shader Binding Table (SBT) management for hardware ray tracing.
//!
//! The SBT is a host-visible buffer holding shader group handles in three
//! regions, each starting on the device's base alignment:
//! - Ray generation: exactly one handle
//! - Miss shaders
//! - Hit groups (closest-hit only)
//!
//! The callable region is always empty.

use crate::context::RayTracingContext;
use ash::vk;
use gpu_allocator::MemoryLocation;
use lumen_core::math::align_up;
use lumen_gpu::{
    BufferDesc, DeletionQueue, GpuBuffer, GpuContext, GpuError, RayTracingCapabilities, Result,
    SharedAllocator,
};

/// One region of the table, relative to the start of the buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SbtRegion {
    pub offset: u64,
    pub stride: u64,
    pub size: u64,
}

impl SbtRegion {
    fn to_vk(self, base_address: vk::DeviceAddress) -> vk::StridedDeviceAddressRegionKHR {
        vk::StridedDeviceAddressRegionKHR {
            device_address: base_address + self.offset,
            stride: self.stride,
            size: self.size,
        }
    }
}

/// Byte layout of a table, computed from device limits alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SbtLayout {
    pub handle_size: u32,
    pub raygen: SbtRegion,
    pub miss: SbtRegion,
    pub hit: SbtRegion,
    pub miss_count: u32,
    pub hit_count: u32,
}

impl SbtLayout {
    pub fn new(properties: &RayTracingCapabilities, miss_count: u32, hit_count: u32) -> Result<Self> {
        let handle_size = properties.shader_group_handle_size;
        let handle_alignment = properties.shader_group_handle_alignment;
        let base_alignment = properties.shader_group_base_alignment;

        if handle_size == 0 {
            return Err(GpuError::invalid_spec("SBT layout", "non-zero handle size", "0"));
        }
        if miss_count == 0 || hit_count == 0 {
            return Err(GpuError::invalid_spec(
                "SBT layout",
                "at least one miss shader and one hit group",
                format!("{miss_count} miss, {hit_count} hit"),
            ));
        }
        for (what, alignment) in [("handle", handle_alignment), ("base", base_alignment)] {
            if !alignment.is_power_of_two() {
                return Err(GpuError::invalid_spec(
                    "SBT layout",
                    format!("power-of-two {what} alignment"),
                    alignment.to_string(),
                ));
            }
        }

        let handle_stride = align_up(u64::from(handle_size), u64::from(handle_alignment));
        let base_alignment = u64::from(base_alignment);

        // Raygen size must equal its stride.
        let raygen_stride = align_up(handle_stride, base_alignment);
        let raygen = SbtRegion {
            offset: 0,
            stride: raygen_stride,
            size: raygen_stride,
        };
        let miss = SbtRegion {
            offset: raygen.size,
            stride: handle_stride,
            size: align_up(u64::from(miss_count) * handle_stride, base_alignment),
        };
        let hit = SbtRegion {
            offset: miss.offset + miss.size,
            stride: handle_stride,
            size: align_up(u64::from(hit_count) * handle_stride, base_alignment),
        };

        Ok(Self {
            handle_size,
            raygen,
            miss,
            hit,
            miss_count,
            hit_count,
        })
    }

    pub fn total_size(&self) -> u64 {
        self.raygen.size + self.miss.size + self.hit.size
    }

    /// Raygen, then every miss shader, then every hit group.
    pub fn group_count(&self) -> u32 {
        1 + self.miss_count + self.hit_count
    }

    /// Bytes returned by `vkGetRayTracingShaderGroupHandlesKHR` for all groups.
    pub fn handle_data_size(&self) -> usize {
        self.group_count() as usize * self.handle_size as usize
    }

    /// Destination offset of every handle, in group order.
    pub fn handle_offsets(&self) -> Vec<u64> {
        let mut offsets = Vec::with_capacity(self.group_count() as usize);
        offsets.push(self.raygen.offset);
        offsets.extend((0..u64::from(self.miss_count)).map(|i| self.miss.offset + i * self.miss.stride));
        offsets.extend((0..u64::from(self.hit_count)).map(|i| self.hit.offset + i * self.hit.stride));
        offsets
    }

    /// Scatter tightly packed handles into `dst` at their region offsets.
    pub fn write_handles(&self, handles: &[u8], dst: &mut [u8]) -> Result<()> {
        if handles.len() < self.handle_data_size() {
            return Err(GpuError::invalid_spec(
                "SBT handle data",
                format!("{} bytes", self.handle_data_size()),
                handles.len().to_string(),
            ));
        }
        if (dst.len() as u64) < self.total_size() {
            return Err(GpuError::invalid_spec(
                "SBT buffer",
                format!("{} bytes", self.total_size()),
                dst.len().to_string(),
            ));
        }

        let handle_size = self.handle_size as usize;
        for (handle, offset) in handles.chunks_exact(handle_size).zip(self.handle_offsets()) {
            let offset = offset as usize;
            dst[offset..offset + handle_size].copy_from_slice(handle);
        }
        Ok(())
    }
}

/// Shader Binding Table for a ray tracing pipeline.
pub struct ShaderBindingTable {
    pub buffer: GpuBuffer,
    pub layout: SbtLayout,
    pub raygen_region: vk::StridedDeviceAddressRegionKHR,
    pub miss_region: vk::StridedDeviceAddressRegionKHR,
    pub hit_region: vk::StridedDeviceAddressRegionKHR,
    /// Empty but required by `vkCmdTraceRaysKHR`.
    pub callable_region: vk::StridedDeviceAddressRegionKHR,
}

impl ShaderBindingTable {
    /// Fetch the pipeline's group handles and write them into a new table.
    pub fn new(
        gpu: &GpuContext,
        rt: &RayTracingContext,
        pipeline: vk::Pipeline,
        miss_count: u32,
        hit_count: u32,
    ) -> Result<Self> {
        let layout = SbtLayout::new(&rt.capabilities, miss_count, hit_count)?;

        let handles = unsafe {
            rt.rt_loader.get_ray_tracing_shader_group_handles(
                pipeline,
                0,
                layout.group_count(),
                layout.handle_data_size(),
            )?
        };

        let mut contents = vec![0u8; layout.total_size() as usize];
        layout.write_handles(&handles, &mut contents)?;

        let buffer = gpu.create_buffer(&BufferDesc::new(
            "shader_binding_table",
            layout.total_size(),
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::CpuToGpu,
        ))?;
        if let Err(e) = buffer.write_bytes(0, &contents) {
            gpu.allocator().lock().destroy_buffer(buffer)?;
            return Err(e);
        }

        let base_address = buffer.device_address(gpu.device());
        tracing::debug!(
            total_size = layout.total_size(),
            miss_count,
            hit_count,
            "created shader binding table"
        );

        Ok(Self {
            raygen_region: layout.raygen.to_vk(base_address),
            miss_region: layout.miss.to_vk(base_address),
            hit_region: layout.hit.to_vk(base_address),
            callable_region: vk::StridedDeviceAddressRegionKHR::default(),
            buffer,
            layout,
        })
    }

    /// Record a trace over a `width` x `height` grid of rays.
    ///
    /// # Safety
    /// The command buffer must be recording with the matching pipeline bound.
    pub unsafe fn cmd_trace_rays(
        &self,
        rt: &RayTracingContext,
        cmd: vk::CommandBuffer,
        width: u32,
        height: u32,
    ) {
        rt.rt_loader.cmd_trace_rays(
            cmd,
            &self.raygen_region,
            &self.miss_region,
            &self.hit_region,
            &self.callable_region,
            width,
            height,
            1,
        );
    }

    pub fn retire(self, deletion: &mut DeletionQueue, allocator: &SharedAllocator) {
        deletion.retire_buffer(allocator, self.buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties(handle_size: u32, handle_alignment: u32, base_alignment: u32) -> RayTracingCapabilities {
        RayTracingCapabilities {
            supported: true,
            shader_group_handle_size: handle_size,
            shader_group_handle_alignment: handle_alignment,
            shader_group_base_alignment: base_alignment,
            max_ray_recursion_depth: 1,
        }
    }

    #[test]
    fn common_nvidia_layout() {
        let layout = SbtLayout::new(&properties(32, 32, 64), 1, 1).unwrap();

        assert_eq!(layout.raygen, SbtRegion { offset: 0, stride: 64, size: 64 });
        assert_eq!(layout.miss, SbtRegion { offset: 64, stride: 32, size: 64 });
        assert_eq!(layout.hit, SbtRegion { offset: 128, stride: 32, size: 64 });
        assert_eq!(layout.total_size(), 192);
        assert_eq!(layout.handle_offsets(), vec![0, 64, 128]);
    }

    #[test]
    fn handles_land_at_region_offsets() {
        let layout = SbtLayout::new(&properties(32, 32, 64), 1, 1).unwrap();
        let handles: Vec<u8> = (0..3u8).flat_map(|g| [g + 1; 32]).collect();
        let mut dst = vec![0u8; layout.total_size() as usize];

        layout.write_handles(&handles, &mut dst).unwrap();

        assert!(dst[0..32].iter().all(|&b| b == 1));
        assert!(dst[32..64].iter().all(|&b| b == 0));
        assert!(dst[64..96].iter().all(|&b| b == 2));
        assert!(dst[128..160].iter().all(|&b| b == 3));
    }

    #[test]
    fn multiple_miss_shaders_share_a_region() {
        let layout = SbtLayout::new(&properties(32, 32, 64), 3, 2).unwrap();

        assert_eq!(layout.miss.size, 128);
        assert_eq!(layout.hit.offset, 192);
        assert_eq!(layout.hit.size, 64);
        assert_eq!(layout.group_count(), 6);
        assert_eq!(layout.handle_offsets(), vec![0, 64, 96, 128, 192, 224]);
    }

    #[test]
    fn handle_alignment_pads_stride() {
        let layout = SbtLayout::new(&properties(16, 32, 64), 1, 1).unwrap();
        assert_eq!(layout.miss.stride, 32);
        assert_eq!(layout.handle_data_size(), 48);
    }

    #[test]
    fn rejects_invalid_inputs() {
        assert!(SbtLayout::new(&properties(0, 32, 64), 1, 1).is_err());
        assert!(SbtLayout::new(&properties(32, 32, 64), 0, 1).is_err());
        assert!(SbtLayout::new(&properties(32, 32, 64), 1, 0).is_err());
        assert!(SbtLayout::new(&properties(32, 24, 64), 1, 1).is_err());

        let layout = SbtLayout::new(&properties(32, 32, 64), 1, 1).unwrap();
        let mut dst = vec![0u8; 192];
        assert!(layout.write_handles(&[0u8; 64], &mut dst).is_err());
        assert!(layout.write_handles(&[0u8; 96], &mut [0u8; 100]).is_err());
    }
}
