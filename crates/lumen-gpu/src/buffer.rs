//! Buffers, buffer descriptions and uploads.

use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use ash::vk;
use gpu_allocator::vulkan::Allocation;
use gpu_allocator::MemoryLocation;

/// Declarative buffer description.
#[derive(Clone, Copy, Debug)]
pub struct BufferDesc<'a> {
    /// Debug name passed to the allocator.
    pub name: &'a str,
    /// Size in bytes. Must be non-zero.
    pub size: u64,
    /// Usage flags. Must be non-empty.
    pub usage: vk::BufferUsageFlags,
    /// Memory location. `MemoryLocation::Unknown` is rejected.
    pub location: MemoryLocation,
}

impl<'a> BufferDesc<'a> {
    /// Create a description.
    pub fn new(
        name: &'a str,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Self {
        Self {
            name,
            size,
            usage,
            location,
        }
    }

    /// Host-visible staging buffer used as a copy source.
    pub fn staging(name: &'a str, size: u64) -> Self {
        Self::new(
            name,
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        )
    }

    /// Check the description without touching the device.
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(GpuError::invalid_spec("buffer", "non-zero size", "0"));
        }
        if self.usage.is_empty() {
            return Err(GpuError::invalid_spec(
                "buffer",
                "at least one usage flag",
                "empty usage",
            ));
        }
        if self.location == MemoryLocation::Unknown {
            return Err(GpuError::invalid_spec(
                "buffer",
                "a concrete memory location",
                "MemoryLocation::Unknown",
            ));
        }
        Ok(())
    }
}

/// A GPU buffer with its allocation.
///
/// Move-only: the handle is released through [`crate::GpuAllocator::destroy_buffer`]
/// or the deletion queue.
pub struct GpuBuffer {
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    size: u64,
    usage: vk::BufferUsageFlags,
}

impl GpuBuffer {
    pub(crate) fn from_parts(
        buffer: vk::Buffer,
        allocation: Option<Allocation>,
        size: u64,
        usage: vk::BufferUsageFlags,
    ) -> Self {
        Self {
            buffer,
            allocation,
            size,
            usage,
        }
    }

    /// Wrap a handle whose memory is owned elsewhere.
    pub fn external(buffer: vk::Buffer, size: u64, usage: vk::BufferUsageFlags) -> Self {
        Self::from_parts(buffer, None, size, usage)
    }

    pub(crate) fn into_parts(self) -> (vk::Buffer, Option<Allocation>) {
        (self.buffer, self.allocation)
    }

    /// Raw buffer handle.
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Usage flags the buffer was created with.
    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    /// Get the device address of this buffer.
    pub fn device_address(&self, device: &ash::Device) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::default().buffer(self.buffer);
        unsafe { device.get_buffer_device_address(&info) }
    }

    /// Whether the memory is persistently mapped.
    pub fn is_mapped(&self) -> bool {
        self.mapped_ptr().is_some()
    }

    fn mapped_ptr(&self) -> Option<*mut u8> {
        self.allocation
            .as_ref()
            .and_then(Allocation::mapped_ptr)
            .map(|p| p.as_ptr().cast::<u8>())
    }

    /// Write raw bytes at `offset` (must be host-visible).
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        check_range(self.size, offset, data.len() as u64)?;
        let ptr = self
            .mapped_ptr()
            .ok_or_else(|| GpuError::InvalidState("buffer is not host-visible".to_string()))?;

        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        }
        Ok(())
    }

    /// Write typed data at `offset` (must be host-visible).
    pub fn write<T: bytemuck::Pod>(&self, offset: u64, data: &[T]) -> Result<()> {
        self.write_bytes(offset, bytemuck::cast_slice(data))
    }

    /// Read `len` bytes starting at `offset` (must be host-visible).
    pub fn read_bytes(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        check_range(self.size, offset, len)?;
        let ptr = self
            .mapped_ptr()
            .ok_or_else(|| GpuError::InvalidState("buffer is not host-visible".to_string()))?;

        let mut out = vec![0u8; len as usize];
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.add(offset as usize), out.as_mut_ptr(), out.len());
        }
        Ok(out)
    }
}

impl std::fmt::Debug for GpuBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuBuffer")
            .field("buffer", &self.buffer)
            .field("size", &self.size)
            .field("usage", &self.usage)
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

/// Validate that `[offset, offset + len)` lies inside a buffer of `size` bytes.
pub(crate) fn check_range(size: u64, offset: u64, len: u64) -> Result<()> {
    let end = offset
        .checked_add(len)
        .ok_or_else(|| GpuError::InvalidState("buffer range overflows".to_string()))?;
    if end > size {
        return Err(GpuError::InvalidState(format!(
            "range {offset}..{end} exceeds buffer size {size}"
        )));
    }
    Ok(())
}

/// Write `data` into `dst` at `offset`.
///
/// Host-visible buffers are written through their mapped pointer. Device-local
/// buffers are filled through a temporary staging buffer and a blocking copy,
/// so they must have been created with `TRANSFER_DST`.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub fn upload_to_buffer(ctx: &GpuContext, dst: &GpuBuffer, offset: u64, data: &[u8]) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    check_range(dst.size(), offset, data.len() as u64)?;

    if dst.is_mapped() {
        return dst.write_bytes(offset, data);
    }

    if !dst.usage().contains(vk::BufferUsageFlags::TRANSFER_DST) {
        return Err(GpuError::invalid_spec(
            "buffer upload",
            "TRANSFER_DST usage on a device-local buffer",
            format!("{:?}", dst.usage()),
        ));
    }

    let staging = ctx.create_buffer(&BufferDesc::staging("upload_staging", data.len() as u64))?;
    let result = staging.write_bytes(0, data).and_then(|()| {
        let region = vk::BufferCopy::default()
            .src_offset(0)
            .dst_offset(offset)
            .size(data.len() as u64);
        ctx.immediate_submit(|cmd| unsafe {
            ctx.device()
                .cmd_copy_buffer(cmd, staging.handle(), dst.handle(), &[region]);
        })
    });

    // The copy has completed (or never started) so the staging buffer is idle.
    ctx.allocator().lock().destroy_buffer(staging)?;
    result
}

/// Create a buffer and fill it with `data`.
///
/// `TRANSFER_DST` is added to the usage of device-local buffers.
pub fn create_buffer_with_data(
    ctx: &GpuContext,
    desc: &BufferDesc<'_>,
    data: &[u8],
) -> Result<GpuBuffer> {
    if (data.len() as u64) > desc.size {
        return Err(GpuError::invalid_spec(
            "buffer",
            format!("at least {} bytes", data.len()),
            desc.size.to_string(),
        ));
    }

    let mut desc = *desc;
    if desc.location == MemoryLocation::GpuOnly {
        desc.usage |= vk::BufferUsageFlags::TRANSFER_DST;
    }

    let buffer = ctx.create_buffer(&desc)?;
    if let Err(e) = upload_to_buffer(ctx, &buffer, 0, data) {
        ctx.allocator().lock().destroy_buffer(buffer)?;
        return Err(e);
    }
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(size: u64, usage: vk::BufferUsageFlags, location: MemoryLocation) -> BufferDesc<'static> {
        BufferDesc::new("test", size, usage, location)
    }

    #[test]
    fn valid_desc_passes() {
        let d = desc(
            256,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            MemoryLocation::GpuOnly,
        );
        assert!(d.validate().is_ok());
    }

    #[test]
    fn zero_size_is_rejected() {
        let d = desc(0, vk::BufferUsageFlags::STORAGE_BUFFER, MemoryLocation::GpuOnly);
        assert!(matches!(
            d.validate(),
            Err(GpuError::InvalidSpecification { operation: "buffer", .. })
        ));
    }

    #[test]
    fn empty_usage_is_rejected() {
        let d = desc(64, vk::BufferUsageFlags::empty(), MemoryLocation::CpuToGpu);
        assert!(matches!(
            d.validate(),
            Err(GpuError::InvalidSpecification { .. })
        ));
    }

    #[test]
    fn unknown_location_is_rejected() {
        let d = desc(64, vk::BufferUsageFlags::UNIFORM_BUFFER, MemoryLocation::Unknown);
        assert!(d.validate().is_err());
    }

    #[test]
    fn staging_desc_is_host_visible_source() {
        let d = BufferDesc::staging("s", 16);
        assert_eq!(d.location, MemoryLocation::CpuToGpu);
        assert!(d.usage.contains(vk::BufferUsageFlags::TRANSFER_SRC));
        assert!(d.validate().is_ok());
    }

    #[test]
    fn range_checks() {
        assert!(check_range(64, 0, 64).is_ok());
        assert!(check_range(64, 60, 4).is_ok());
        assert!(check_range(64, 60, 5).is_err());
        assert!(check_range(64, u64::MAX, 2).is_err());
    }

    #[test]
    fn unmapped_buffer_refuses_host_access() {
        let buffer = GpuBuffer::external(
            vk::Buffer::null(),
            32,
            vk::BufferUsageFlags::STORAGE_BUFFER,
        );
        assert!(!buffer.is_mapped());
        assert!(matches!(
            buffer.write_bytes(0, &[1, 2, 3]),
            Err(GpuError::InvalidState(_))
        ));
        assert!(buffer.read_bytes(0, 4).is_err());
    }
}
