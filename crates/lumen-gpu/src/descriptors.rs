//! Descriptor set management.
//!
//! Layouts that contain an update-after-bind binding are created with the
//! matching pool flag, so texture slots can be written while the set is
//! referenced by frames still in flight.

use crate::error::{GpuError, Result};
use ash::vk;
use lumen_core::constants::{MAX_BINDLESS_TEXTURES, NULL_TEXTURE_ID};
use lumen_core::TextureId;

/// Binding flags used for the bindless texture array.
pub const BINDLESS_BINDING_FLAGS: vk::DescriptorBindingFlags = vk::DescriptorBindingFlags::from_raw(
    vk::DescriptorBindingFlags::UPDATE_AFTER_BIND.as_raw()
        | vk::DescriptorBindingFlags::PARTIALLY_BOUND.as_raw(),
);

/// Descriptor set layout builder.
#[derive(Default)]
pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'static>>,
    flags: Vec<vk::DescriptorBindingFlags>,
}

impl DescriptorSetLayoutBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding with explicit binding flags.
    pub fn binding_with_flags(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        count: u32,
        stage_flags: vk::ShaderStageFlags,
        flags: vk::DescriptorBindingFlags,
    ) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(count)
                .stage_flags(stage_flags),
        );
        self.flags.push(flags);
        self
    }

    /// Add a binding.
    pub fn binding(
        self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        count: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        self.binding_with_flags(
            binding,
            descriptor_type,
            count,
            stage_flags,
            vk::DescriptorBindingFlags::empty(),
        )
    }

    pub fn storage_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::STORAGE_BUFFER, 1, stage_flags)
    }

    pub fn uniform_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::UNIFORM_BUFFER, 1, stage_flags)
    }

    pub fn storage_image(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::STORAGE_IMAGE, 1, stage_flags)
    }

    pub fn acceleration_structure(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(
            binding,
            vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            1,
            stage_flags,
        )
    }

    /// Add a partially bound, update-after-bind array of combined image samplers.
    pub fn bindless_textures(
        self,
        binding: u32,
        count: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        self.binding_with_flags(
            binding,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            count,
            stage_flags,
            BINDLESS_BINDING_FLAGS,
        )
    }

    /// Whether any binding needs an update-after-bind pool.
    pub fn requires_update_after_bind(&self) -> bool {
        self.flags
            .iter()
            .any(|f| f.contains(vk::DescriptorBindingFlags::UPDATE_AFTER_BIND))
    }

    /// Pool sizes needed to allocate `sets` sets of this layout.
    pub fn pool_sizes(&self, sets: u32) -> Vec<vk::DescriptorPoolSize> {
        let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
        for binding in &self.bindings {
            let count = binding.descriptor_count * sets;
            match sizes.iter_mut().find(|s| s.ty == binding.descriptor_type) {
                Some(size) => size.descriptor_count += count,
                None => sizes.push(
                    vk::DescriptorPoolSize::default()
                        .ty(binding.descriptor_type)
                        .descriptor_count(count),
                ),
            }
        }
        sizes
    }

    /// Build the descriptor set layout.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn build(&self, device: &ash::Device) -> Result<vk::DescriptorSetLayout> {
        let mut flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&self.flags);

        let mut layout_info = vk::DescriptorSetLayoutCreateInfo::default()
            .bindings(&self.bindings)
            .push_next(&mut flags_info);
        if self.requires_update_after_bind() {
            layout_info =
                layout_info.flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL);
        }

        Ok(device.create_descriptor_set_layout(&layout_info, None)?)
    }
}

/// Pool sizes for the engine-wide shared pool.
pub fn shared_pool_sizes() -> [vk::DescriptorPoolSize; 5] {
    [
        vk::DescriptorPoolSize::default()
            .ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(MAX_BINDLESS_TEXTURES),
        vk::DescriptorPoolSize::default()
            .ty(vk::DescriptorType::STORAGE_BUFFER)
            .descriptor_count(256),
        vk::DescriptorPoolSize::default()
            .ty(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(64),
        vk::DescriptorPoolSize::default()
            .ty(vk::DescriptorType::STORAGE_IMAGE)
            .descriptor_count(64),
        vk::DescriptorPoolSize::default()
            .ty(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
            .descriptor_count(16),
    ]
}

/// Descriptor pool for allocating descriptor sets.
pub struct DescriptorPool {
    pool: vk::DescriptorPool,
}

impl DescriptorPool {
    /// Create a new descriptor pool.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(
        device: &ash::Device,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
        update_after_bind: bool,
    ) -> Result<Self> {
        let mut flags = vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET;
        if update_after_bind {
            flags |= vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND;
        }

        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes)
            .flags(flags);

        let pool = device.create_descriptor_pool(&create_info, None)?;
        Ok(Self { pool })
    }

    /// Create the shared update-after-bind pool sized by [`shared_pool_sizes`].
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn shared(device: &ash::Device) -> Result<Self> {
        Self::new(device, 64, &shared_pool_sizes(), true)
    }

    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }

    /// Allocate one set per layout.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate(
        &self,
        device: &ash::Device,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>> {
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(layouts);

        Ok(device.allocate_descriptor_sets(&alloc_info)?)
    }

    /// Allocate a single set.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate_one(
        &self,
        device: &ash::Device,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        self.allocate(device, &[layout])?
            .into_iter()
            .next()
            .ok_or_else(|| GpuError::Other("descriptor set allocation returned nothing".into()))
    }

    /// Destroy the pool.
    ///
    /// # Safety
    /// The device must be valid and the pool must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_descriptor_pool(self.pool, None);
    }
}

/// Write a uniform buffer descriptor.
///
/// # Safety
/// Device and buffer must be valid.
pub unsafe fn write_uniform_buffer(
    device: &ash::Device,
    dst_set: vk::DescriptorSet,
    binding: u32,
    buffer: vk::Buffer,
    range: u64,
) {
    write_buffer(
        device,
        dst_set,
        binding,
        vk::DescriptorType::UNIFORM_BUFFER,
        buffer,
        range,
    );
}

/// Write a storage buffer descriptor.
///
/// # Safety
/// Device and buffer must be valid.
pub unsafe fn write_storage_buffer(
    device: &ash::Device,
    dst_set: vk::DescriptorSet,
    binding: u32,
    buffer: vk::Buffer,
    range: u64,
) {
    write_buffer(
        device,
        dst_set,
        binding,
        vk::DescriptorType::STORAGE_BUFFER,
        buffer,
        range,
    );
}

unsafe fn write_buffer(
    device: &ash::Device,
    dst_set: vk::DescriptorSet,
    binding: u32,
    ty: vk::DescriptorType,
    buffer: vk::Buffer,
    range: u64,
) {
    let buffer_info = vk::DescriptorBufferInfo::default()
        .buffer(buffer)
        .offset(0)
        .range(range);

    let write = vk::WriteDescriptorSet::default()
        .dst_set(dst_set)
        .dst_binding(binding)
        .descriptor_type(ty)
        .buffer_info(std::slice::from_ref(&buffer_info));

    device.update_descriptor_sets(&[write], &[]);
}

/// Write a storage image descriptor.
///
/// # Safety
/// Device and image view must be valid.
pub unsafe fn write_storage_image(
    device: &ash::Device,
    dst_set: vk::DescriptorSet,
    binding: u32,
    image_view: vk::ImageView,
) {
    let image_info = vk::DescriptorImageInfo::default()
        .image_view(image_view)
        .image_layout(vk::ImageLayout::GENERAL);

    let write = vk::WriteDescriptorSet::default()
        .dst_set(dst_set)
        .dst_binding(binding)
        .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
        .image_info(std::slice::from_ref(&image_info));

    device.update_descriptor_sets(&[write], &[]);
}

/// Write one element of a combined image sampler array.
///
/// # Safety
/// Device, view and sampler must be valid.
pub unsafe fn write_sampled_image(
    device: &ash::Device,
    dst_set: vk::DescriptorSet,
    binding: u32,
    array_element: u32,
    image_view: vk::ImageView,
    sampler: vk::Sampler,
) {
    let image_info = vk::DescriptorImageInfo::default()
        .image_view(image_view)
        .sampler(sampler)
        .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);

    let write = vk::WriteDescriptorSet::default()
        .dst_set(dst_set)
        .dst_binding(binding)
        .dst_array_element(array_element)
        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
        .image_info(std::slice::from_ref(&image_info));

    device.update_descriptor_sets(&[write], &[]);
}

/// Write an acceleration structure descriptor.
///
/// # Safety
/// Device and acceleration structure must be valid.
pub unsafe fn write_acceleration_structure(
    device: &ash::Device,
    dst_set: vk::DescriptorSet,
    binding: u32,
    acceleration_structure: vk::AccelerationStructureKHR,
) {
    let structures = [acceleration_structure];
    let mut as_info = vk::WriteDescriptorSetAccelerationStructureKHR::default()
        .acceleration_structures(&structures);

    let write = vk::WriteDescriptorSet::default()
        .dst_set(dst_set)
        .dst_binding(binding)
        .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
        .descriptor_count(1)
        .push_next(&mut as_info);

    device.update_descriptor_sets(&[write], &[]);
}

/// Slot allocator for a bindless texture array.
///
/// Slot [`NULL_TEXTURE_ID`] is reserved for the fallback texture, so a
/// material that references no texture still samples something valid.
#[derive(Debug)]
pub struct BindlessTextureTable {
    set: vk::DescriptorSet,
    binding: u32,
    capacity: u32,
    next: u32,
}

impl BindlessTextureTable {
    /// Track slots of `binding` in `set`, which holds `capacity` descriptors.
    pub fn new(set: vk::DescriptorSet, binding: u32, capacity: u32) -> Self {
        Self {
            set,
            binding,
            capacity,
            next: NULL_TEXTURE_ID + 1,
        }
    }

    pub fn set(&self) -> vk::DescriptorSet {
        self.set
    }

    pub fn binding(&self) -> u32 {
        self.binding
    }

    /// Number of slots handed out, excluding the fallback slot.
    pub fn len(&self) -> u32 {
        self.next - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reserve the next free slot.
    pub fn allocate_slot(&mut self) -> Result<TextureId> {
        if self.next >= self.capacity {
            return Err(GpuError::InvalidState(format!(
                "bindless texture table full ({} slots)",
                self.capacity
            )));
        }
        let slot = self.next;
        self.next += 1;
        Ok(slot)
    }

    /// Write a texture into `slot`.
    ///
    /// # Safety
    /// Device, view and sampler must be valid; the slot must not be accessed by
    /// in-flight work that expects the previous contents.
    pub unsafe fn write(
        &self,
        device: &ash::Device,
        slot: TextureId,
        view: vk::ImageView,
        sampler: vk::Sampler,
    ) -> Result<()> {
        if slot >= self.capacity {
            return Err(GpuError::InvalidState(format!(
                "texture slot {slot} out of range"
            )));
        }
        write_sampled_image(device, self.set, self.binding, slot, view, sampler);
        Ok(())
    }

    /// Write the fallback texture into the reserved slot.
    ///
    /// # Safety
    /// See [`Self::write`].
    pub unsafe fn write_fallback(
        &self,
        device: &ash::Device,
        view: vk::ImageView,
        sampler: vk::Sampler,
    ) -> Result<()> {
        self.write(device, NULL_TEXTURE_ID, view, sampler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bindless_binding_requests_update_after_bind() {
        let builder = DescriptorSetLayoutBuilder::new()
            .storage_buffer(0, vk::ShaderStageFlags::ALL)
            .bindless_textures(1, 128, vk::ShaderStageFlags::ALL);
        assert!(builder.requires_update_after_bind());
        assert!(BINDLESS_BINDING_FLAGS.contains(vk::DescriptorBindingFlags::PARTIALLY_BOUND));
    }

    #[test]
    fn plain_layout_does_not_need_update_after_bind() {
        let builder = DescriptorSetLayoutBuilder::new()
            .acceleration_structure(0, vk::ShaderStageFlags::RAYGEN_KHR)
            .storage_image(1, vk::ShaderStageFlags::RAYGEN_KHR);
        assert!(!builder.requires_update_after_bind());
    }

    #[test]
    fn pool_sizes_merge_types() {
        let sizes = DescriptorSetLayoutBuilder::new()
            .storage_buffer(0, vk::ShaderStageFlags::ALL)
            .storage_buffer(1, vk::ShaderStageFlags::ALL)
            .storage_image(2, vk::ShaderStageFlags::ALL)
            .pool_sizes(2);
        assert_eq!(sizes.len(), 2);
        assert_eq!(sizes[0].ty, vk::DescriptorType::STORAGE_BUFFER);
        assert_eq!(sizes[0].descriptor_count, 4);
        assert_eq!(sizes[1].descriptor_count, 2);
    }

    #[test]
    fn shared_pool_has_thousands_of_samplers() {
        let sizes = shared_pool_sizes();
        let samplers = sizes
            .iter()
            .find(|s| s.ty == vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .map(|s| s.descriptor_count);
        assert_eq!(samplers, Some(MAX_BINDLESS_TEXTURES));
        assert!(MAX_BINDLESS_TEXTURES >= 1000);
    }

    #[test]
    fn texture_slots_skip_fallback() {
        let mut table = BindlessTextureTable::new(vk::DescriptorSet::null(), 1, 3);
        assert!(table.is_empty());
        assert_eq!(table.allocate_slot().unwrap(), 1);
        assert_eq!(table.allocate_slot().unwrap(), 2);
        assert!(matches!(
            table.allocate_slot(),
            Err(GpuError::InvalidState(_))
        ));
        assert_eq!(table.len(), 2);
    }
}
